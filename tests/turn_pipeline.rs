use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use agent_gate::store::memory::TokenEvent;
use agent_gate::store::{
    Account, AgentRecord, Connector, FileThreadStore, Plan, SessionRecord, Subscription,
    SubscriptionStatus, TraceRecord,
};
use agent_gate::{
    AgentExecutor, ConnectionParams, DiscoveredTools, DiscoveryError, EventMetadata, EventStream,
    ExecutorError, ExecutorRequest, Gate, InMemoryDirectory, Message, Settings, Stores,
    StreamEvent, ToolDiscovery, ToolHandler, ToolRegistry, TurnConfig, TurnState,
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const USER: &str = "user-1";
const AGENT: Uuid = Uuid::from_u128(0xa1);
const CALENDAR: Uuid = Uuid::from_u128(0xca1);

/// Echoes the last user message and reports which tools it was given.
struct EchoExecutor;

fn last_user_text(messages: &[Message]) -> String {
    messages
        .iter()
        .rev()
        .find_map(|m| match m {
            Message::User { content } => Some(content.clone()),
            _ => None,
        })
        .unwrap_or_default()
}

#[async_trait]
impl AgentExecutor for EchoExecutor {
    async fn invoke(&self, request: ExecutorRequest) -> Result<Vec<Message>, ExecutorError> {
        let reply = format!(
            "{} [tools: {}]",
            last_user_text(&request.messages),
            request.tools.tool_names().join(",")
        );
        Ok(vec![Message::assistant(reply)])
    }

    async fn stream(&self, request: ExecutorRequest) -> Result<EventStream, ExecutorError> {
        let text = last_user_text(&request.messages);
        let meta = EventMetadata {
            thread_id: request.thread_id.clone(),
            node: Some("agent".into()),
        };
        let items = vec![
            Ok((StreamEvent::text(text), meta.clone())),
            Err(ExecutorError::Model("context window exceeded".into())),
        ];
        Ok(futures::stream::iter(items).boxed())
    }
}

struct CalendarTool;

#[async_trait]
impl ToolHandler for CalendarTool {
    async fn call(&self, _input: &Value) -> Result<Value, String> {
        Ok(json!([]))
    }
}

#[derive(Default)]
struct FakeDiscovery {
    calls: AtomicUsize,
}

#[async_trait]
impl ToolDiscovery for FakeDiscovery {
    async fn discover(
        &self,
        connections: &BTreeMap<String, ConnectionParams>,
    ) -> Result<DiscoveredTools, DiscoveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut tools = ToolRegistry::new();
        for (name, params) in connections {
            assert_eq!(params.headers["Authorization"], "Bearer tok-1");
            tools = tools.add(
                name,
                "list_events",
                json!({"name": "list_events", "description": "List calendar events"}),
                CalendarTool,
            );
        }
        Ok(DiscoveredTools {
            tools,
            instructions: vec!["Dates are in UTC.".into()],
        })
    }
}

fn seed(plan: &str) -> Arc<InMemoryDirectory> {
    let dir = Arc::new(InMemoryDirectory::new());
    dir.add_plan(Plan {
        id: 7,
        name: plan.into(),
    });
    dir.add_subscription(Subscription {
        id: 1,
        user_id: USER.into(),
        plan_id: 7,
        status: SubscriptionStatus::Active,
        renews_at: Some(Utc::now() + Duration::days(3)),
        ends_at: None,
    });
    dir.add_session(SessionRecord {
        id: "sess-1".into(),
        token: "tok-1".into(),
        user_id: USER.into(),
        expires_at: Utc::now() + Duration::hours(2),
    });
    dir.add_connector(Connector {
        id: CALENDAR,
        name: "calendar".into(),
        description: "Google Calendar".into(),
        url: "https://calendar.example/mcp".into(),
        provider: Some("google".into()),
        scopes: vec!["calendar".into()],
    });
    dir.add_account(Account {
        user_id: USER.into(),
        provider_id: "google".into(),
        access_token: Some("ya29".into()),
        refresh_token: Some("1//r".into()),
        access_token_expires_at: Some(Utc::now() + Duration::minutes(30)),
        scope: Some("openid,calendar".into()),
    });
    dir.add_agent(AgentRecord {
        id: AGENT,
        user_id: USER.into(),
        name: Some("Planner".into()),
        system_prompt: Some("you organise schedules.".into()),
        connector_ids: vec![CALENDAR],
    });
    dir
}

fn config(llm: &str) -> TurnConfig {
    TurnConfig {
        auth_token: Some("tok-1".into()),
        user_id: Some(USER.into()),
        llm: Some(llm.into()),
        agent_id: Some(AGENT),
        session_id: Some("chat-1".into()),
        thread_id: None,
    }
}

#[tokio::test]
async fn thread_turns_persist_and_pin_the_model() {
    let threads = tempfile::tempdir().unwrap();
    let dir = seed("enterprise");
    let discovery = Arc::new(FakeDiscovery::default());
    let stores = Stores::in_memory(dir).with_threads(FileThreadStore::new(threads.path()));
    let gate = Gate::builder(Settings::default(), stores, EchoExecutor)
        .discovery(SharedDiscovery(discovery.clone()))
        .build();

    let state = gate
        .pipeline()
        .execute_thread(
            "thread-1",
            vec![Message::user("what's on today?")],
            &config("gemini-2.5-pro"),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(state.error.is_none(), "{:?}", state.error);
    assert_eq!(
        state.messages.last(),
        Some(&Message::assistant("what's on today? [tools: list_events]"))
    );
    assert_eq!(
        state.system_message.as_deref(),
        Some("Your name is Planner, you organise schedules.")
    );

    // The second turn asks for another model; the thread keeps its own.
    let state = gate
        .pipeline()
        .execute_thread(
            "thread-1",
            vec![Message::user("and tomorrow?")],
            &config("gpt-4.1-mini"),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(state.llm.as_deref(), Some("gemini-2.5-pro"));
    assert_eq!(state.messages.len(), 4);
    assert_eq!(discovery.calls.load(Ordering::SeqCst), 2);

    let report = gate
        .admin()
        .delete_threads(&["thread-1".into(), "thread-2".into()])
        .await;
    assert_eq!(report.deleted, vec!["thread-1".to_string()]);
    assert_eq!(report.failed[0].thread_id, "thread-2");
}

#[tokio::test]
async fn basic_plan_cannot_use_provider_connectors() {
    let dir = seed("basic");
    let discovery = Arc::new(FakeDiscovery::default());
    let gate = Gate::builder(Settings::default(), Stores::in_memory(dir), EchoExecutor)
        .discovery(SharedDiscovery(discovery.clone()))
        .build();

    let state = gate
        .pipeline()
        .execute(
            TurnState::with_messages(vec![Message::user("hi")]),
            &config("gpt-4.1-mini"),
            CancellationToken::new(),
        )
        .await;

    let failure = state.error.unwrap();
    assert_eq!(failure.kind, "entitlement");
    assert_eq!(failure.message, "Please upgrade to access this MCP.");
    assert_eq!(state.messages, vec![Message::user("hi")]);
    assert_eq!(discovery.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn streamed_turn_ends_with_error_then_message_end() {
    let gate = Gate::builder(Settings::default(), Stores::in_memory(seed("enterprise")), EchoExecutor)
        .discovery(FakeDiscovery::default())
        .build();

    let mut fresh = config("gpt-4.1");
    fresh.thread_id = Some("thread-s".into());
    let lines: Vec<String> = gate
        .pipeline()
        .stream_turn(
            TurnState::with_messages(vec![Message::user("ping")]),
            &fresh,
            CancellationToken::new(),
        )
        .await
        .collect()
        .await;

    assert_eq!(
        lines,
        vec![
            "f:{\"messageId\":\"thread-s\"}\n".to_string(),
            "0:\"ping\"\n".to_string(),
            "3:\"model error: context window exceeded\"\n".to_string(),
            "d:{\"finishReason\":\"stop\",\"usage\":{\"promptTokens\":0,\"completionTokens\":0}}\n"
                .to_string(),
        ]
    );
}

#[tokio::test]
async fn usage_report_and_token_quota_share_the_window() {
    let dir = seed("pro");
    let now = Utc::now();
    dir.record_tokens(TokenEvent {
        user_id: USER.into(),
        model: "gemini-flash".into(),
        session_id: Some("chat-1".into()),
        at: now - Duration::days(2),
        tokens: 1_000_000,
    });
    dir.add_trace(
        USER,
        now - Duration::days(2),
        TraceRecord {
            total_cost: 0.25,
            output: json!({"response": [{
                "response_metadata": {
                    "model_name": "gemini-2.0-flash",
                    "token_usage": {"prompt_tokens": 900000, "completion_tokens": 100000, "total_tokens": 1000000}
                }
            }]}),
        },
    );
    let gate = Gate::builder(Settings::default(), Stores::in_memory(dir), EchoExecutor)
        .discovery(FakeDiscovery::default())
        .build();

    let err = gate
        .usage()
        .enforce_token_limit(USER, "gemini-flash")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "quota");
    assert!(gate.usage().enforce_token_limit(USER, "gpt-4.1").await.is_ok());

    let report = gate.admin().usage_report(USER).await.unwrap();
    let flash = &report.models["gemini-2.0-flash"];
    assert_eq!(flash.total_input_tokens, 900_000);
    assert_eq!(flash.total_tokens, 1_000_000);
    assert!((flash.total_cost - 0.25).abs() < 1e-9);
}

/// Lets a test keep a handle on the discovery it hands to the builder.
struct SharedDiscovery(Arc<FakeDiscovery>);

#[async_trait]
impl ToolDiscovery for SharedDiscovery {
    async fn discover(
        &self,
        connections: &BTreeMap<String, ConnectionParams>,
    ) -> Result<DiscoveredTools, DiscoveryError> {
        self.0.discover(connections).await
    }
}
