use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

mod config;
mod dashboard;
mod db;
mod error;
mod events;
mod live_scores;
mod notify;
mod shl;

use config::Config;
use dashboard::AppState;
use db::Database;
use events::{EventPipeline, EventStore};
use live_scores::{
    FeedContext, FeedNormalizer, GameLoop, GameSnapshotStore, LiveFeed, LoopSettings,
    StatsProvider,
};
use notify::{EventDispatcher, HttpPushGateway, LogPush, PushTransport, SubscriberRegistry};
use shl::{HttpTransport, RateLimitedClient, ShlClient};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    let db = Database::open(&config.database_path)?;
    info!("Database opened: {}", config.database_path);

    // Every upstream call, token requests included, goes through one limiter
    let transport = Arc::new(HttpTransport::new(&config.api_url)?);
    let client = Arc::new(RateLimitedClient::new(transport, config.call_spacing()));
    let credentials = config.credentials();
    if credentials.is_none() {
        warn!("No client credentials configured, upstream calls are unauthenticated");
    }
    let provider: Arc<dyn StatsProvider> = Arc::new(ShlClient::new(client, credentials));

    let snapshots = Arc::new(GameSnapshotStore::new(Arc::clone(&provider), db.clone()));
    snapshots.load_persisted(&config.season).await?;

    let push: Arc<dyn PushTransport> = match &config.push_gateway_url {
        Some(url) => Arc::new(HttpPushGateway::new(url)?),
        None => {
            warn!("No push gateway configured, notifications are only logged");
            Arc::new(LogPush)
        }
    };
    info!("Push transport: {}", push.name());

    let registry = SubscriberRegistry::new(db.clone());
    let events = EventStore::new(db.clone());
    let dispatcher = Arc::new(EventDispatcher::new(push, registry.clone()));
    let pipeline = Arc::new(EventPipeline::new(events.clone(), dispatcher));

    let normalizer = Arc::new(FeedNormalizer::new(
        Arc::clone(&snapshots),
        Duration::from_secs(config.report_ttl_secs),
    ));
    let feed = Arc::new(LiveFeed::new(
        &config.feed_url,
        Arc::new(FeedContext {
            provider: Arc::clone(&provider),
            snapshots: Arc::clone(&snapshots),
            normalizer,
            pipeline: Arc::clone(&pipeline),
        }),
    ));

    let settings = LoopSettings {
        season: config.season.clone(),
        active_delay: Duration::from_secs(config.active_poll_secs),
        idle_delay: Duration::from_secs(config.idle_poll_secs),
        lookahead: chrono::Duration::minutes(config.lookahead_minutes),
    };
    let game_loop = GameLoop::new(
        settings,
        provider,
        Arc::clone(&snapshots),
        pipeline,
        feed,
    );
    let tracked = game_loop.tracked();
    tokio::spawn(game_loop.run());

    let app = dashboard::router(AppState {
        season: config.season.clone(),
        snapshots,
        events,
        registry,
        tracked,
    });
    let addr: SocketAddr = config.dashboard_addr.parse()?;
    info!("Status router listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app).await?;

    Ok(())
}
