//! Live feed connection: frame decoding and the task that owns the socket.
//!
//! ```text
//!  feed server ──frames──▶ feed task ──reports──▶ FeedNormalizer cache + GameSnapshotStore
//!                            │
//!                            └──events──▶ FeedNormalizer ──▶ EventPipeline
//! ```
//!
//! Frames are SockJS-style: `o` opens, `h` is a heartbeat, `c[..]` closes and
//! `a[..]` carries a JSON array whose elements are themselves JSON strings.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use super::normalizer::{FeedNormalizer, GameReport, RawFeedEvent};
use super::provider::StatsProvider;
use super::snapshots::GameSnapshotStore;
use crate::error::FeedError;
use crate::events::EventPipeline;

/// One decoded unit of a data frame.
#[derive(Debug, Clone)]
pub enum FeedPayload {
    Event(RawFeedEvent),
    Report(Vec<GameReport>),
}

#[derive(Debug)]
pub enum Frame {
    Open,
    Heartbeat,
    Close(String),
    /// Per-element results: one bad element never spoils its siblings.
    Data(Vec<Result<FeedPayload, FeedError>>),
}

pub fn parse_frame(text: &str) -> Result<Frame, FeedError> {
    let text = text.trim();
    match text {
        "o" => return Ok(Frame::Open),
        "h" => return Ok(Frame::Heartbeat),
        _ => {}
    }
    if let Some(reason) = text.strip_prefix('c') {
        return Ok(Frame::Close(reason.to_string()));
    }

    let body = text.strip_prefix('a').unwrap_or(text);
    let elements: Vec<Value> =
        serde_json::from_str(body).map_err(|e| FeedError::Malformed(format!("frame: {}", e)))?;

    let mut out = Vec::new();
    for element in elements {
        let inner = match element {
            Value::String(s) => match serde_json::from_str::<Value>(&s) {
                Ok(v) => v,
                Err(e) => {
                    out.push(Err(FeedError::Malformed(format!("element: {}", e))));
                    continue;
                }
            },
            other => other,
        };
        match inner {
            Value::Array(items) => out.extend(items.into_iter().map(parse_payload)),
            other => out.push(parse_payload(other)),
        }
    }
    Ok(Frame::Data(out))
}

fn parse_payload(value: Value) -> Result<FeedPayload, FeedError> {
    let class = value.get("class").and_then(|c| c.as_str()).unwrap_or_default();
    if class == "GameReport" {
        let reports = value
            .get("gameReports")
            .cloned()
            .unwrap_or_else(|| Value::Array(vec![value.clone()]));
        return serde_json::from_value(reports)
            .map(FeedPayload::Report)
            .map_err(|e| FeedError::Malformed(format!("GameReport: {}", e)));
    }
    serde_json::from_value(value)
        .map(FeedPayload::Event)
        .map_err(|e| FeedError::Malformed(format!("event: {}", e)))
}

fn join_message(game_ids: &[i64]) -> String {
    let joins: Vec<String> = game_ids
        .iter()
        .map(|id| serde_json::json!({ "action": "join", "channel": format!("game/{}", id) }).to_string())
        .collect();
    serde_json::json!(joins).to_string()
}

/// Collaborators the feed task hands decoded frames to.
pub struct FeedContext {
    pub provider: Arc<dyn StatsProvider>,
    pub snapshots: Arc<GameSnapshotStore>,
    pub normalizer: Arc<FeedNormalizer>,
    pub pipeline: Arc<EventPipeline>,
}

impl FeedContext {
    pub async fn handle_text(&self, text: &str) {
        let elements = match parse_frame(text) {
            Ok(Frame::Data(elements)) => elements,
            Ok(Frame::Close(reason)) => {
                warn!("[LiveFeed] Server sent close frame {}", reason);
                return;
            }
            Ok(_) => return,
            Err(e) => {
                warn!("[LiveFeed] Dropped frame: {}", e);
                return;
            }
        };

        for element in elements {
            match element {
                Ok(FeedPayload::Report(reports)) => {
                    for report in reports {
                        self.snapshots.apply_report(&report).await;
                        self.normalizer.record_report(report);
                    }
                }
                Ok(FeedPayload::Event(raw)) => {
                    let Some(event) = self.normalizer.normalize(raw.game_id, &raw).await else {
                        continue;
                    };
                    if let Err(e) = self.pipeline.publish(event).await {
                        error!("[LiveFeed] Failed to publish event {}: {:#}", raw.event_id, e);
                    }
                }
                Err(e) => warn!("[LiveFeed] Dropped element: {}", e),
            }
        }
    }
}

enum FeedCommand {
    Join(Vec<i64>),
    Leave(Vec<i64>),
    Close,
}

/// Apply a join or leave to the set of channels rejoined on reconnect.
/// Returns the ids joined for the first time.
fn track_channels(channels: &mut BTreeSet<i64>, command: &FeedCommand) -> Vec<i64> {
    match command {
        FeedCommand::Join(ids) => ids.iter().copied().filter(|id| channels.insert(*id)).collect(),
        FeedCommand::Leave(ids) => {
            for id in ids {
                channels.remove(id);
            }
            Vec::new()
        }
        FeedCommand::Close => Vec::new(),
    }
}

struct FeedTask {
    commands: mpsc::Sender<FeedCommand>,
}

/// What the poll loop needs from the feed connection.
pub trait FeedControl: Send + Sync {
    fn is_open(&self) -> bool;

    /// Start the connection if it is not running, joining `game_ids`.
    fn open(&self, game_ids: &[i64]);

    /// Join more game channels on the open connection.
    fn join(&self, game_ids: &[i64]);

    /// Stop rejoining these channels after a reconnect.
    fn leave(&self, game_ids: &[i64]);

    fn close(&self);
}

/// Handle on the live feed connection. At most one connection task runs;
/// it lives from `open` until `close`.
pub struct LiveFeed {
    url: String,
    ctx: Arc<FeedContext>,
    task: Mutex<Option<FeedTask>>,
}

impl LiveFeed {
    pub fn new(url: &str, ctx: Arc<FeedContext>) -> Self {
        LiveFeed {
            url: url.to_string(),
            ctx,
            task: Mutex::new(None),
        }
    }

    fn send(&self, command: FeedCommand) {
        if let Ok(task) = self.task.lock() {
            if let Some(t) = task.as_ref() {
                if let Err(e) = t.commands.try_send(command) {
                    warn!("[LiveFeed] Command dropped: {}", e);
                }
            }
        }
    }
}

impl FeedControl for LiveFeed {
    fn is_open(&self) -> bool {
        self.task
            .lock()
            .map(|t| t.as_ref().is_some_and(|t| !t.commands.is_closed()))
            .unwrap_or(false)
    }

    fn open(&self, game_ids: &[i64]) {
        let Ok(mut task) = self.task.lock() else {
            return;
        };
        if task.as_ref().is_some_and(|t| !t.commands.is_closed()) {
            drop(task);
            self.join(game_ids);
            return;
        }

        let (tx, rx) = mpsc::channel(64);
        let url = self.url.clone();
        let ctx = Arc::clone(&self.ctx);
        let channels: BTreeSet<i64> = game_ids.iter().copied().collect();
        tokio::spawn(async move {
            feed_loop(&url, ctx, channels, rx).await;
        });
        *task = Some(FeedTask { commands: tx });
    }

    fn join(&self, game_ids: &[i64]) {
        if !game_ids.is_empty() {
            self.send(FeedCommand::Join(game_ids.to_vec()));
        }
    }

    fn leave(&self, game_ids: &[i64]) {
        if !game_ids.is_empty() {
            self.send(FeedCommand::Leave(game_ids.to_vec()));
        }
    }

    fn close(&self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(t) = task.take() {
                let _ = t.commands.try_send(FeedCommand::Close);
            }
        }
    }
}

fn with_token(url: &str, token: Option<String>) -> Result<String, url::ParseError> {
    let mut parsed = url::Url::parse(url)?;
    if let Some(token) = token {
        parsed.query_pairs_mut().append_pair("access_token", &token);
    }
    Ok(parsed.to_string())
}

fn backoff_delay(backoff_secs: u64) -> Duration {
    use rand::Rng;
    let jitter_ms = rand::thread_rng().gen_range(0..=500u64);
    Duration::from_secs(backoff_secs) + Duration::from_millis(jitter_ms)
}

type FeedStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// How a connected session ended.
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    /// Connection lost; reconnect after backoff
    Dropped,
    /// The handle asked for the feed to stop
    Closed,
}

/// Connection loop with exponential backoff. Every reconnect rejoins the
/// channels still tracked. Returns once closed.
async fn feed_loop(
    url: &str,
    ctx: Arc<FeedContext>,
    mut channels: BTreeSet<i64>,
    mut commands: mpsc::Receiver<FeedCommand>,
) {
    let mut backoff_secs = 1u64;
    let max_backoff = 30u64;

    loop {
        let endpoint = match with_token(url, ctx.provider.feed_token().await) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                error!("[LiveFeed] Invalid feed URL {}: {}", url, e);
                return;
            }
        };
        info!("[LiveFeed] Connecting to {}", url);

        match tokio_tungstenite::connect_async(endpoint.as_str()).await {
            Ok((ws_stream, _)) => {
                info!("[LiveFeed] Connected");
                backoff_secs = 1;
                if run_session(ws_stream, &ctx, &mut channels, &mut commands).await
                    == SessionEnd::Closed
                {
                    return;
                }
            }
            Err(e) => {
                error!("[LiveFeed] Connection failed: {}", e);
            }
        }

        let delay = backoff_delay(backoff_secs);
        warn!("[LiveFeed] Reconnecting in {:?}...", delay);
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                cmd = commands.recv() => match cmd {
                    Some(FeedCommand::Close) | None => {
                        info!("[LiveFeed] Closed while reconnecting");
                        return;
                    }
                    Some(cmd) => {
                        track_channels(&mut channels, &cmd);
                    }
                },
            }
        }
        backoff_secs = (backoff_secs * 2).min(max_backoff);
    }
}

/// Join every tracked channel, then pump frames and commands until the
/// connection drops or the handle closes it.
async fn run_session(
    ws_stream: FeedStream,
    ctx: &FeedContext,
    channels: &mut BTreeSet<i64>,
    commands: &mut mpsc::Receiver<FeedCommand>,
) -> SessionEnd {
    let (mut write, mut read) = ws_stream.split();

    if !channels.is_empty() {
        let ids: Vec<i64> = channels.iter().copied().collect();
        if let Err(e) = write.send(Message::Text(join_message(&ids))).await {
            error!("[LiveFeed] Join failed: {}", e);
            return SessionEnd::Dropped;
        }
        info!("[LiveFeed] Joined {} game channel(s)", ids.len());
    }

    let mut ping_interval = tokio::time::interval(Duration::from_secs(25));

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => ctx.handle_text(&text).await,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        warn!("[LiveFeed] Server closed connection");
                        return SessionEnd::Dropped;
                    }
                    Some(Err(e)) => {
                        error!("[LiveFeed] WS error: {}", e);
                        return SessionEnd::Dropped;
                    }
                    None => {
                        warn!("[LiveFeed] Stream ended");
                        return SessionEnd::Dropped;
                    }
                    _ => {}
                }
            }
            cmd = commands.recv() => {
                match cmd {
                    Some(FeedCommand::Close) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        info!("[LiveFeed] Closed");
                        return SessionEnd::Closed;
                    }
                    Some(cmd) => {
                        let fresh = track_channels(channels, &cmd);
                        if fresh.is_empty() {
                            continue;
                        }
                        if let Err(e) = write.send(Message::Text(join_message(&fresh))).await {
                            error!("[LiveFeed] Join send failed: {}", e);
                        }
                    }
                }
            }
            _ = ping_interval.tick() => {
                if let Err(e) = write.send(Message::Ping(vec![])).await {
                    error!("[LiveFeed] Ping failed: {}", e);
                    return SessionEnd::Dropped;
                }
            }
        }
    }
}
