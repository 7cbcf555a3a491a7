use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::{CallArgs, MemoCache, Param};
use crate::config::Settings;
use crate::connectors::{ConnectorResolver, ResolvedTools};
use crate::entitlement::EntitlementResolver;
use crate::error::{ExecutorError, GateError};
use crate::executor::{AgentExecutor, EventStream, ExecutorRequest};
use crate::model::resolve_model;
use crate::store::{AgentRecord, AgentStore, SessionRecord, SessionStore, ThreadStore};
use crate::stream::{encode_error, encode_stream};
use crate::types::Message;
use crate::usage::UsageAccountant;

/// Agents with this name get no name clause in their system prompt.
pub const DEFAULT_AGENT_NAME: &str = "Untitled Agent";

const AGENT_LOOKUP: &str = "agent";

/// Durable state wins once established; fresh input only fills gaps.
pub fn coalesce<T>(durable: Option<T>, fresh: Option<T>) -> Option<T> {
    durable.or(fresh)
}

/// Configuration supplied with this call.
#[derive(Debug, Clone, Default)]
pub struct TurnConfig {
    pub auth_token: Option<String>,
    pub user_id: Option<String>,
    pub llm: Option<String>,
    pub agent_id: Option<Uuid>,
    pub session_id: Option<String>,
    /// Passed through to the executor; never persisted.
    pub thread_id: Option<String>,
}

/// Why a turn stopped, worded for the end user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnFailure {
    pub kind: String,
    pub message: String,
}

impl From<&GateError> for TurnFailure {
    fn from(e: &GateError) -> Self {
        Self {
            kind: e.kind().to_string(),
            message: e.user_message(),
        }
    }
}

/// Per-thread state carried from turn to turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnState {
    pub messages: Vec<Message>,
    pub system_message: Option<String>,
    pub llm: Option<String>,
    pub user_id: Option<String>,
    /// Never written to a checkpoint; each call brings its own credential.
    #[serde(skip)]
    pub auth_token: Option<String>,
    pub session_id: Option<String>,
    pub agent_id: Option<Uuid>,
    pub error: Option<TurnFailure>,
}

impl TurnState {
    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    fn merge(&mut self, fresh: &TurnConfig) {
        self.auth_token = coalesce(self.auth_token.take(), fresh.auth_token.clone());
        self.user_id = coalesce(self.user_id.take(), fresh.user_id.clone());
        self.llm = coalesce(self.llm.take(), fresh.llm.clone());
        self.agent_id = coalesce(self.agent_id.take(), fresh.agent_id);
        self.session_id = coalesce(self.session_id.take(), fresh.session_id.clone());
    }
}

/// Everything `verify` established, handed to `run`.
#[derive(Debug, Clone)]
pub struct VerifiedTurn {
    pub user_id: String,
    pub auth_token: String,
    pub session_id: String,
    pub llm: String,
    pub agent: AgentRecord,
    pub thread_id: Option<String>,
}

fn required<T: Clone>(value: &Option<T>, field: &str) -> Result<T, GateError> {
    value
        .clone()
        .ok_or_else(|| GateError::Validation(field.to_string()))
}

/// System prompt for `agent`, with a name clause unless it has the default
/// name.
pub fn agent_system_prompt(agent: &AgentRecord) -> Option<String> {
    match agent.name.as_deref() {
        Some(name) if name != DEFAULT_AGENT_NAME => Some(format!(
            "Your name is {name}, {}",
            agent.system_prompt.as_deref().unwrap_or_default()
        )),
        _ => agent.system_prompt.clone(),
    }
}

/// One conversation turn: `verify`, then `run`.
///
/// Errors never escape [`execute`](Self::execute). They are logged and
/// recorded on the returned state, with messages and configuration kept so
/// the caller can retry without resupplying anything.
pub struct TurnPipeline {
    sessions: Arc<dyn SessionStore>,
    agents: Arc<dyn AgentStore>,
    threads: Arc<dyn ThreadStore>,
    entitlements: Arc<EntitlementResolver>,
    usage: Arc<UsageAccountant>,
    connectors: Arc<ConnectorResolver>,
    executor: Arc<dyn AgentExecutor>,
    settings: Arc<Settings>,
    cache: MemoCache,
    timeout: Option<Duration>,
}

impl TurnPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        agents: Arc<dyn AgentStore>,
        threads: Arc<dyn ThreadStore>,
        entitlements: Arc<EntitlementResolver>,
        usage: Arc<UsageAccountant>,
        connectors: Arc<ConnectorResolver>,
        executor: Arc<dyn AgentExecutor>,
        settings: Arc<Settings>,
        cache: MemoCache,
    ) -> Self {
        let timeout = settings.executor_timeout();
        Self {
            sessions,
            agents,
            threads,
            entitlements,
            usage,
            connectors,
            executor,
            settings,
            cache,
            timeout,
        }
    }

    /// Bound each executor call. `None` waits indefinitely.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Merge fresh configuration into `state`, then check identity,
    /// entitlement and quota in that order. The first failure stops.
    pub async fn verify(
        &self,
        state: &mut TurnState,
        fresh: &TurnConfig,
    ) -> Result<VerifiedTurn, GateError> {
        state.merge(fresh);

        let auth_token = required(&state.auth_token, "auth_token")?;
        let user_id = required(&state.user_id, "user_id")?;
        let llm = required(&state.llm, "LLM")?;
        let agent_id = required(&state.agent_id, "agent_id")?;
        let session_id = required(&state.session_id, "session_id")?;

        self.verify_session(&auth_token, &user_id).await?;
        resolve_model(&llm, &self.settings)?;
        let tier = self.entitlements.check_model(&user_id, &llm).await?;
        self.usage.enforce_token_limit(&user_id, &llm).await?;
        self.usage.enforce_execution_limit(&user_id).await?;

        let agent = self.agent(agent_id).await?;
        if state.system_message.is_none() {
            state.system_message = agent_system_prompt(&agent);
        }

        info!(%user_id, model = %llm, %tier, %agent_id, "turn verified");
        Ok(VerifiedTurn {
            user_id,
            auth_token,
            session_id,
            llm,
            agent,
            thread_id: fresh.thread_id.clone(),
        })
    }

    /// Resolve backend and tools, run the executor for one turn and append
    /// what it produced to `state.messages`.
    pub async fn run(
        &self,
        state: &mut TurnState,
        turn: &VerifiedTurn,
        cancel: &CancellationToken,
    ) -> Result<(), GateError> {
        let request = self.prepare(state, turn).await?;
        let produced = self.invoke(request, cancel).await?;
        debug!(user_id = %turn.user_id, produced = produced.len(), "turn produced messages");
        state.messages.extend(produced);
        Ok(())
    }

    /// `verify` then `run`. Always returns a state; failures land in
    /// `state.error`.
    pub async fn execute(
        &self,
        mut state: TurnState,
        fresh: &TurnConfig,
        cancel: CancellationToken,
    ) -> TurnState {
        state.error = None;
        match self.verify(&mut state, fresh).await {
            Ok(turn) => {
                if let Err(e) = self.run(&mut state, &turn, &cancel).await {
                    record_failure(&mut state, "run", &e);
                }
            }
            Err(e) => record_failure(&mut state, "verify", &e),
        }
        state
    }

    /// Run one turn on a persisted thread: load its state, append
    /// `new_messages`, execute and checkpoint the result. A failed
    /// checkpoint is recorded on the returned state, which still carries
    /// the turn's messages.
    pub async fn execute_thread(
        &self,
        thread_id: &str,
        new_messages: Vec<Message>,
        fresh: &TurnConfig,
        cancel: CancellationToken,
    ) -> Result<TurnState, GateError> {
        let mut state = self
            .threads
            .load(thread_id)
            .await?
            .map(|checkpoint| checkpoint.state)
            .unwrap_or_default();
        state.messages.extend(new_messages);

        let fresh = TurnConfig {
            thread_id: Some(thread_id.to_string()),
            ..fresh.clone()
        };
        let mut state = self.execute(state, &fresh, cancel).await;
        if let Err(e) = self.threads.checkpoint(thread_id, &state).await {
            record_failure(&mut state, "checkpoint", &GateError::from(e));
        }
        Ok(state)
    }

    /// Streaming variant: verify, then encode the executor's event stream
    /// as protocol lines. Failures before the stream starts become an error
    /// line followed by the end-of-message line.
    pub async fn stream_turn(
        &self,
        mut state: TurnState,
        fresh: &TurnConfig,
        cancel: CancellationToken,
    ) -> BoxStream<'static, String> {
        match self.open_stream(&mut state, fresh, cancel).await {
            Ok(events) => encode_stream(events).boxed(),
            Err(e) => {
                record_failure(&mut state, "stream", &e);
                encode_error(e.user_message()).boxed()
            }
        }
    }

    async fn open_stream(
        &self,
        state: &mut TurnState,
        fresh: &TurnConfig,
        cancel: CancellationToken,
    ) -> Result<EventStream, GateError> {
        let turn = self.verify(state, fresh).await?;
        let request = self.prepare(state, &turn).await?;
        let events = tokio::select! {
            result = self.bounded(self.executor.stream(request)) => result?,
            _ = cancel.cancelled() => return Err(GateError::Cancelled),
        };
        Ok(guarded(events, cancel, self.timeout))
    }

    async fn prepare(
        &self,
        state: &TurnState,
        turn: &VerifiedTurn,
    ) -> Result<ExecutorRequest, GateError> {
        let model = resolve_model(&turn.llm, &self.settings)?;
        let ResolvedTools {
            tools,
            instructions,
        } = self
            .connectors
            .resolve_for_agent(&turn.agent, &turn.user_id, &turn.auth_token)
            .await?;

        let system_prompt = compose_system_prompt(state.system_message.as_deref(), &instructions);
        let mut messages = state.messages.clone();
        if let Some(prompt) = &system_prompt {
            if !messages.first().is_some_and(Message::is_system) {
                messages.insert(0, Message::system(prompt.clone()));
            }
        }

        Ok(ExecutorRequest {
            model,
            tools,
            system_prompt,
            messages,
            thread_id: turn.thread_id.clone(),
        })
    }

    async fn invoke(
        &self,
        request: ExecutorRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>, GateError> {
        tokio::select! {
            result = self.bounded(self.executor.invoke(request)) => result,
            _ = cancel.cancelled() => {
                info!("turn cancelled during executor call");
                Err(GateError::Cancelled)
            }
        }
    }

    /// Apply the executor timeout to one executor call.
    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, ExecutorError>>,
    ) -> Result<T, GateError> {
        let Some(limit) = self.timeout else {
            return call.await.map_err(GateError::from);
        };
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result.map_err(GateError::from),
            Err(_) => {
                warn!(timeout_ms = limit.as_millis() as u64, "executor call timed out");
                Err(GateError::Upstream(silence(limit)))
            }
        }
    }

    async fn verify_session(&self, token: &str, user_id: &str) -> Result<SessionRecord, GateError> {
        let mut sessions = self.sessions.find_sessions(token).await?;
        let matches = sessions.len();
        let session = match (sessions.pop(), sessions.is_empty()) {
            (Some(session), true) => session,
            _ => {
                warn!(user_id, matches, "session token did not resolve to one session");
                return Err(GateError::Authentication(format!(
                    "token matched {matches} sessions"
                )));
            }
        };

        if session.expires_at < Utc::now() {
            warn!(user_id, session = %session.id, "expired session");
            return Err(GateError::Authentication("expired session".into()));
        }
        if session.user_id != user_id {
            warn!(user_id, session = %session.id, "session belongs to another user");
            return Err(GateError::Authentication(
                "session does not belong to user".into(),
            ));
        }
        Ok(session)
    }

    /// Agent records change rarely; they are memoized per id.
    async fn agent(&self, agent_id: Uuid) -> Result<AgentRecord, GateError> {
        self.cache
            .get_or_compute_async(AGENT_LOOKUP, CallArgs::new().arg(agent_id), None, || {
                self.load_agent(agent_id)
            })
            .await
    }

    async fn load_agent(&self, agent_id: Uuid) -> Result<AgentRecord, GateError> {
        self.agents.agent(agent_id).await?.ok_or_else(|| {
            warn!(%agent_id, "agent not found");
            GateError::Configuration(format!("Agent with id {agent_id} not found"))
        })
    }

    /// Forget a memoized agent after it was edited.
    pub fn invalidate_agent(&self, agent_id: Uuid) {
        self.cache
            .invalidate_by_param(AGENT_LOOKUP, Param::Position(0), agent_id);
    }
}

fn compose_system_prompt(base: Option<&str>, instructions: &[String]) -> Option<String> {
    let parts: Vec<&str> = base
        .into_iter()
        .chain(instructions.iter().map(String::as_str))
        .filter(|s| !s.is_empty())
        .collect();
    (!parts.is_empty()).then(|| parts.join("\n\n"))
}

fn record_failure(state: &mut TurnState, stage: &'static str, e: &GateError) {
    error!(
        stage,
        user_id = state.user_id.as_deref().unwrap_or("-"),
        model = state.llm.as_deref().unwrap_or("-"),
        kind = e.kind(),
        error = %e,
        "turn failed"
    );
    state.error = Some(TurnFailure::from(e));
}

fn silence(limit: Duration) -> String {
    format!("executor did not answer within {}ms", limit.as_millis())
}

/// Resolves once the executor has been silent for `timeout`; never without one.
async fn stalled(timeout: Option<Duration>) -> ExecutorError {
    match timeout {
        Some(limit) => {
            tokio::time::sleep(limit).await;
            ExecutorError::Request(silence(limit))
        }
        None => std::future::pending().await,
    }
}

/// Stop pulling from `events` once `cancel` fires or the executor stays
/// silent past `timeout` between events. Either ends the stream with an
/// error so the encoder reports it.
fn guarded(
    events: EventStream,
    cancel: CancellationToken,
    timeout: Option<Duration>,
) -> EventStream {
    let stream = async_stream::stream! {
        let mut events = events;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => Some(Err(ExecutorError::Cancelled)),
                e = stalled(timeout) => Some(Err(e)),
                item = events.next() => item,
            };
            match next {
                Some(Ok(event)) => yield Ok(event),
                Some(Err(e)) => {
                    yield Err(e);
                    break;
                }
                None => break,
            }
        }
    };
    stream.boxed()
}
