//! Bidroom client - headless entry point
//!
//! Runs the realtime core without a window: toasts, navigation requests and
//! conversation updates are written to the log.
//!
//! Usage:
//!   bidroom-client [--demo] [--conversation <id>]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bidroom_client::backend::{ChangeFeedTransport, DataBackend, PresenceTransport};
use bidroom_client::{
    logging, AuthSession, ClientConfig, HeadlessHost, MemoryBackend, PhoenixSocket,
    RealtimeClient, RestBackend,
};
use bidroom_shared::NewMessage;
use clap::Parser;

const DEMO_CONVERSATION: &str = "demo-conversation";

/// Headless Bidroom realtime client
#[derive(Parser, Debug)]
#[command(name = "bidroom-client")]
#[command(version, about, long_about = None)]
struct Args {
    /// Run against an in-process backend with a simulated counterpart
    #[arg(long)]
    demo: bool,

    /// Conversation to open and follow
    #[arg(long, value_name = "ID")]
    conversation: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = ClientConfig::from_env();
    logging::init(&config.log_filter);

    let host = Arc::new(HeadlessHost::default());
    let client = if args.demo {
        demo_client(config, host)
    } else {
        hosted_client(config, host)?
    };
    client.start();

    let conversation = args
        .conversation
        .or_else(|| args.demo.then(|| DEMO_CONVERSATION.to_string()));
    if let Some(id) = conversation.as_deref() {
        let session = client.open_conversation(id).await;
        let mut updates = session.messages.subscribe();
        let pipeline = session.messages.clone();
        tokio::spawn(async move {
            while let Ok(update) = updates.recv().await {
                tracing::info!(change = ?update.change, len = update.len, "conversation updated");
                if let Some(newest) = pipeline.messages().last() {
                    tracing::debug!(id = %newest.id, status = ?newest.status, "newest message");
                }
            }
        });
    }

    let mut toasts = client.notifications().subscribe_toasts();
    tokio::spawn(async move {
        while let Ok(toast) = toasts.recv().await {
            tracing::info!(from = %toast.sender_name, conversation = %toast.conversation_id, "{}", toast.message);
        }
    });
    let mut navigation = client.notifications().subscribe_navigation();
    tokio::spawn(async move {
        while let Ok(id) = navigation.recv().await {
            tracing::info!(conversation = %id, "navigate");
        }
    });
    let mut unread = client.unread().subscribe();
    tokio::spawn(async move {
        while unread.changed().await.is_ok() {
            let count = *unread.borrow();
            tracing::info!(count, "unread messages");
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    client.shutdown();
    Ok(())
}

fn hosted_client(config: ClientConfig, host: Arc<HeadlessHost>) -> anyhow::Result<RealtimeClient> {
    let token = config
        .backend
        .access_token
        .clone()
        .context("BIDROOM_ACCESS_TOKEN is required outside --demo")?;
    let session = AuthSession::from_access_token(&token)?;
    tracing::info!(user = %session.user_id, url = %config.backend.base_url, "Connecting");

    let data: Arc<dyn DataBackend> = Arc::new(RestBackend::new(config.backend.clone()));
    let socket = Arc::new(PhoenixSocket::new(config.backend.clone(), &config.feed));
    let feed: Arc<dyn ChangeFeedTransport> = socket.clone();
    let presence: Arc<dyn PresenceTransport> = socket;
    Ok(RealtimeClient::new(config, session, data, feed, presence, host))
}

/// In-process backend with a chatty counterpart, for trying the client offline.
fn demo_client(config: ClientConfig, host: Arc<HeadlessHost>) -> RealtimeClient {
    let backend = MemoryBackend::new()
        .with_profile("demo-buyer", "Demo Buyer")
        .with_profile("demo-seller", "Demo Seller")
        .with_conversation(DEMO_CONVERSATION, &["demo-buyer", "demo-seller"])
        .with_conversation("demo-other", &["demo-buyer", "demo-seller"]);
    let session = AuthSession::new("demo-buyer", "Demo Buyer");

    let chatter = backend.clone();
    tokio::spawn(async move {
        let lines = [
            (DEMO_CONVERSATION, "Is the lot still available?"),
            ("demo-other", "I can do 20% off if you pick up today."),
            (DEMO_CONVERSATION, "Sending the invoice now."),
        ];
        let mut tick = tokio::time::interval(Duration::from_secs(5));
        tick.tick().await;
        for (conversation, text) in lines.iter().cycle() {
            tick.tick().await;
            let message = NewMessage {
                conversation_id: conversation.to_string(),
                sender_id: "demo-seller".to_string(),
                content: Some(text.to_string()),
                attachment_url: None,
                attachment_type: None,
                attachment_name: None,
                client_nonce: None,
            };
            if let Err(e) = chatter.insert_message(&message).await {
                tracing::warn!("Demo insert failed: {}", e);
            }
            chatter.heartbeat();
        }
    });

    RealtimeClient::in_memory(config, session, backend, host)
}
