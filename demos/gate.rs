//! Run one streamed turn through the gate against in-memory stores and print
//! the protocol lines.
//!
//! Usage:
//!   cargo run --example gate -- --plan pro --model gpt-4.1 "hello there"
//!   cargo run --example gate -- --plan basic --model gpt-4.1 "blocked"
//!   cargo run --example gate -- --threads ./threads --delete t1 --delete t2

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use agent_gate::store::{
    AgentRecord, FileThreadStore, Plan, SessionRecord, Subscription, SubscriptionStatus,
};
use agent_gate::{
    AgentExecutor, EventMetadata, EventStream, ExecutorError, ExecutorRequest, Gate,
    InMemoryDirectory, Message, Settings, Stores, StreamEvent, TurnConfig, TurnState, Usage,
    CONTENT_TYPE, PROTOCOL_HEADER,
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use clap::Parser;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "gate", about = "Drive one turn through the agent gate")]
struct Cli {
    /// Plan the demo user is subscribed to: basic, pro or enterprise
    #[arg(long, default_value = "basic")]
    plan: String,

    /// Model to request
    #[arg(long, default_value = "gpt-4.1-mini")]
    model: String,

    /// Agent display name
    #[arg(long, default_value = "Untitled Agent")]
    agent_name: String,

    /// Directory for thread checkpoints
    #[arg(long)]
    threads: Option<PathBuf>,

    /// Thread ids to delete instead of running a turn
    #[arg(long)]
    delete: Vec<String>,

    /// The user message
    message: Option<String>,
}

/// Streams the user message back word by word.
struct EchoExecutor;

#[async_trait]
impl AgentExecutor for EchoExecutor {
    async fn invoke(&self, request: ExecutorRequest) -> Result<Vec<Message>, ExecutorError> {
        let text = request
            .messages
            .iter()
            .filter_map(|m| match m {
                Message::User { content } => Some(content.as_str()),
                _ => None,
            })
            .last()
            .unwrap_or_default()
            .to_string();
        Ok(vec![Message::assistant(text)])
    }

    async fn stream(&self, request: ExecutorRequest) -> Result<EventStream, ExecutorError> {
        let reply = self.invoke(request.clone()).await?;
        let text = match reply.first() {
            Some(Message::Assistant { content, .. }) => content.clone(),
            _ => String::new(),
        };
        let meta = EventMetadata {
            thread_id: request.thread_id.clone(),
            node: Some("echo".into()),
        };
        let words: Vec<_> = text
            .split_inclusive(' ')
            .map(|w| {
                Ok::<_, ExecutorError>((
                    StreamEvent::Chunk {
                        content: w.to_string(),
                        tool_calls: vec![],
                        usage: Some(Usage {
                            input_tokens: 0,
                            output_tokens: 1,
                        }),
                    },
                    meta.clone(),
                ))
            })
            .collect();
        Ok(futures::stream::iter(words).boxed())
    }
}

fn seed(cli: &Cli, agent_id: Uuid) -> Arc<InMemoryDirectory> {
    let dir = Arc::new(InMemoryDirectory::new());
    dir.add_plan(Plan {
        id: 1,
        name: cli.plan.clone(),
    });
    dir.add_subscription(Subscription {
        id: 1,
        user_id: "demo".into(),
        plan_id: 1,
        status: SubscriptionStatus::Active,
        renews_at: Some(Utc::now() + Duration::days(30)),
        ends_at: None,
    });
    dir.add_session(SessionRecord {
        id: "session".into(),
        token: "demo-token".into(),
        user_id: "demo".into(),
        expires_at: Utc::now() + Duration::hours(1),
    });
    dir.add_agent(AgentRecord {
        id: agent_id,
        user_id: "demo".into(),
        name: Some(cli.agent_name.clone()),
        system_prompt: Some("answer briefly.".into()),
        connector_ids: vec![],
    });
    dir
}

#[tokio::main]
async fn main() {
    agent_gate::logging::init("warn");
    let cli = Cli::parse();

    let agent_id = Uuid::new_v4();
    let mut stores = Stores::in_memory(seed(&cli, agent_id));
    if let Some(dir) = &cli.threads {
        stores = stores.with_threads(FileThreadStore::new(dir));
    }
    let gate = Gate::builder(Settings::default(), stores, EchoExecutor).build();

    if !cli.delete.is_empty() {
        let report = gate.admin().delete_threads(&cli.delete).await;
        println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
        return;
    }

    let Some(message) = cli.message.clone() else {
        eprintln!("error: a message is required unless --delete is given");
        std::process::exit(2);
    };

    let config = TurnConfig {
        auth_token: Some("demo-token".into()),
        user_id: Some("demo".into()),
        llm: Some(cli.model.clone()),
        agent_id: Some(agent_id),
        session_id: Some("demo-session".into()),
        thread_id: Some(Uuid::new_v4().to_string()),
    };

    eprintln!("{}: {}", PROTOCOL_HEADER.0, PROTOCOL_HEADER.1);
    eprintln!("content-type: {CONTENT_TYPE}");

    let mut lines = gate
        .pipeline()
        .stream_turn(
            TurnState::with_messages(vec![Message::user(message)]),
            &config,
            CancellationToken::new(),
        )
        .await;
    let mut stdout = io::stdout();
    while let Some(line) = lines.next().await {
        let _ = stdout.write_all(line.as_bytes());
    }
    let _ = stdout.flush();
}
