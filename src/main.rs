use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use open_music_link::audio::lavalink_client::LavalinkClient;
use open_music_link::audio::voice::{VoiceGateway, VoiceStateRequest};
use open_music_link::config::Config;
use open_music_link::events::ManagerEvent;
use open_music_link::model::LoadResult;

/// This binary never joins voice channels, requests are only logged.
struct DetachedGateway;

#[async_trait]
impl VoiceGateway for DetachedGateway {
    async fn send_voice_state(&self, request: VoiceStateRequest) -> open_music_link::Result<()> {
        debug!(?request, "voice state request ignored");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("open_music_link=debug".parse()?)
                .add_directive("reqwest=info".parse()?),
        )
        .init();

    info!("🎵 Starting open-music-link v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    info!("{}", config.summary());

    let args: Vec<String> = std::env::args().collect();
    let client = LavalinkClient::new(config, Arc::new(DetachedGateway)).context("invalid node configuration")?;

    if args.iter().any(|arg| arg == "--health-check") {
        return health_check(&client).await;
    }

    let mut search = args
        .iter()
        .position(|arg| arg == "--search")
        .and_then(|i| args.get(i + 1))
        .cloned();

    let mut events = client.subscribe();
    client.connect().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("⚠️ Shutdown signal received");
                break;
            }
            event = events.recv() => match event {
                Ok(ManagerEvent::NodeReady { node, session_id, resumed }) => {
                    info!(node = %node, session = %session_id, resumed, "✅ node ready");
                    if let Some(query) = search.take() {
                        run_search(&client, &node, &query).await;
                    }
                }
                Ok(ManagerEvent::NodeClosed { node }) => {
                    warn!(node = %node, "node closed, no more retries");
                    if client.nodes().online().is_empty() {
                        error!("❌ every node is down");
                    }
                }
                Ok(other) => debug!(?other, "event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    }

    client.shutdown().await;
    Ok(())
}

async fn run_search(client: &LavalinkClient, node: &str, query: &str) {
    match client.search(query, Some(node)).await {
        Ok(LoadResult::Error(exception)) => {
            error!("load failed: {}", exception.message.unwrap_or(exception.cause));
        }
        Ok(result) => {
            let tracks = result.into_tracks();
            info!("🔍 {} result(s) for '{}'", tracks.len(), query);
            for (i, track) in tracks.iter().take(10).enumerate() {
                info!(
                    "  {}. {} - {} [{}]",
                    i + 1,
                    track.info.author,
                    track.title(),
                    humantime::format_duration(track.duration())
                );
            }
        }
        Err(e) => error!("search failed: {e}"),
    }
}

/// Prints `OK` when every node answers `/info`.
async fn health_check(client: &LavalinkClient) -> Result<()> {
    for node in client.nodes().all() {
        let info = node
            .rest()
            .info()
            .await
            .with_context(|| format!("node {} is unreachable", node.name()))?
            .with_context(|| format!("node {} returned no info", node.name()))?;
        info!(node = %node.name(), version = %info.version.semver, "node healthy");
    }

    println!("OK");
    Ok(())
}
