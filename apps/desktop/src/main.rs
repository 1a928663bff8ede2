use std::{sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use client_core::{
    ClientConfig, ConversationList, LoadState, PersistentTokenStore, RealtimeContext,
    SessionTokenStore, TokenStore,
};
use shared::domain::UserId;
use tracing::{info, warn};

mod config;

use config::load_settings;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    user_id: i64,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    token: Option<String>,
    /// Seconds to keep tailing pushes before exiting.
    #[arg(long, default_value_t = 30)]
    tail_seconds: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    if let Some(token) = args.token {
        settings.token = Some(token);
    }

    let tokens: Arc<dyn TokenStore> = match &settings.token_file {
        Some(path) => Arc::new(PersistentTokenStore::new(path)),
        None => Arc::new(SessionTokenStore::default()),
    };
    if let Some(token) = &settings.token {
        tokens.store(token);
    }

    let context = RealtimeContext::new(
        ClientConfig {
            server_url: settings.server_url.clone(),
        },
        tokens,
    );
    let user_id = UserId(args.user_id);
    if let Err(err) = context.sign_in(user_id).await {
        warn!("realtime connection unavailable, continuing over rest: {err}");
    }

    let list = ConversationList::new(&context, user_id);
    let _push_listener = list.spawn_push_listener(&context.router);
    list.load().await;

    match list.state().await {
        LoadState::Ready => {
            for entry in list.entries().await {
                println!(
                    "{:>3}  {}  [{}]  {}",
                    entry.unread_count,
                    if entry.peer_is_online { "on " } else { "off" },
                    entry.time_label.as_deref().unwrap_or("-"),
                    entry.display_name,
                );
            }
        }
        LoadState::Error(message) => println!("load failed: {message}"),
        other => println!("unexpected list state: {other:?}"),
    }

    info!(seconds = args.tail_seconds, "tailing pushes");
    let mut pushes = context.router.subscribe();
    let _ = tokio::time::timeout(Duration::from_secs(args.tail_seconds), async {
        while let Ok(push) = pushes.recv().await {
            println!("push: {push:?}");
        }
    })
    .await;

    context.sign_out().await;
    Ok(())
}
