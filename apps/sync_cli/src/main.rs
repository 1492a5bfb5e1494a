use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Parser;
use client_core::{
    load_config, BulkFetcher, Credentials, EventCategory, HttpFetcher, PersistentEvent,
    SyncEvent, SyncSession, ThreadEvent, WebSocketTransport,
};
use shared::domain::{ThreadId, UserId};
use storage::{KeyValueStore, Storage};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Joins one thread and relays stdin lines as messages.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    token: String,
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    thread: String,
    /// Skip the initial thread-list and history fetch.
    #[arg(long)]
    offline_history: bool,
}

fn print_thread_event(event: &ThreadEvent) {
    match event {
        ThreadEvent::MessageAdded(message) => {
            let marker = if message.is_pending() { " (sending)" } else { "" };
            println!("[{}] {}{marker}", message.sender_id, message.content);
        }
        ThreadEvent::MessageConfirmed(message) => {
            println!("  delivered {}", message.id.as_ref().map(|id| id.as_str()).unwrap_or("?"));
        }
        ThreadEvent::MessageFailed { message, reason } => {
            println!("  failed to send \"{}\": {reason}", message.content);
        }
        ThreadEvent::Typing { user_id } => println!("  {user_id} is typing..."),
        ThreadEvent::TypingStopped { .. } => {}
        ThreadEvent::Joined => println!("  joined"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let config = load_config(args.config.as_deref())?;
    let kv: Arc<dyn KeyValueStore> = Arc::new(Storage::new(&config.database_url).await?);
    let transport = Arc::new(WebSocketTransport::new(config.websocket_url()?));
    let fetcher: Arc<dyn BulkFetcher> =
        Arc::new(HttpFetcher::new(config.server_url.clone(), Some(args.token.clone())));

    let session = SyncSession::start(
        config,
        UserId::new(args.user_id),
        transport,
        Some(fetcher),
        kv,
    )
    .await?;

    let thread_id = ThreadId::new(args.thread);
    session.subscribe(thread_id.clone(), Arc::new(print_thread_event));
    session.register_persistent_handler(
        EventCategory::Invitation,
        Arc::new(|event: &PersistentEvent| {
            if let PersistentEvent::Invitation(invite) = event {
                println!("* invitation: {}", invite.title.as_deref().unwrap_or("(untitled)"));
            }
        }),
    );

    let mut events = session.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SyncEvent::StatusChanged(status) => info!(
                    state = ?status.state,
                    attempt = status.attempt_count,
                    queued = status.queued_count,
                    "status changed"
                ),
                SyncEvent::SendFailed(err) => warn!(local_id = %err.local_id, reason = %err.reason, "send failed"),
                SyncEvent::ThreadsLoaded(ids) => info!(threads = ids.len(), "threads loaded"),
            }
        }
    });

    if let Err(err) = session.connect(Credentials::new(args.token)).await {
        warn!(error = %err, "initial connect failed; messages will queue until reconnect");
    }
    if !args.offline_history {
        if let Err(err) = session.load_threads().await {
            warn!(error = %err, "could not load thread list");
        }
        match session.load_thread(&thread_id).await {
            Ok(history) => history.iter().for_each(|m| println!("[{}] {}", m.sender_id, m.content)),
            Err(err) => warn!(error = %err, "could not load history"),
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => {
                    if let Err(err) = session.send(thread_id.clone(), line, Vec::new(), None) {
                        warn!(error = %err, "send rejected");
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.shutdown().await;
    Ok(())
}
