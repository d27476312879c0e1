#![warn(unused_crate_dependencies)]

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use config::Config;
use log::{error, info};
use player::{PlayerConfig as EnginePlayerConfig, PlayerEngine};
use presence::PresenceTracker;
use replayer::StoreReplayer;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use store::Store;
use thiserror::Error;
use tokio::signal;
use tokio_util::sync::CancellationToken;

mod archiver;
mod broker;
mod channels;
mod codec;
mod commands;
mod config;
mod database;
mod logging;
mod player;
mod presence;
mod producer;
mod replayer;
mod schema;
mod store;
mod tags;
mod utils;

use broker::memory::InMemoryJetStream;
use broker::{DeliverPolicy, PullConsumer};
use channels::{ChannelManager, LIVESTREAM_SUBJECT};
use commands::{CommandSender, COMMAND_SUBJECT_PREFIX};
use producer::Producer;
use tags::{TagSender, TAG_BROADCAST_SUBJECT};

#[derive(Debug, Error)]
enum RelayError {
    #[error("database error: {0}")]
    Database(#[from] std::io::Error),
    #[error("broker error: {0}")]
    Broker(#[from] broker::BrokerError),
    #[error("channel error: {0}")]
    Channel(#[from] channels::ChannelError),
}

/// Flags a headless invocation needs; mirrors the CLI surface every
/// executable built from this crate exposes.
struct HeadlessArgs {
    headless: bool,
    duration: Option<u64>,
    rate: Option<f64>,
    nats_servers: Vec<String>,
    js_stream: Option<String>,
    subject_prefix: Option<String>,
    source: Option<String>,
    room: Option<String>,
    metrics_interval: Option<u64>,
    write_cbor_dir: Option<String>,
    group_replay_id: Option<String>,
}

impl HeadlessArgs {
    fn parse(raw: impl Iterator<Item = String>) -> Self {
        let mut args = HeadlessArgs {
            headless: false,
            duration: None,
            rate: None,
            nats_servers: Vec::new(),
            js_stream: None,
            subject_prefix: None,
            source: None,
            room: None,
            metrics_interval: None,
            write_cbor_dir: None,
            group_replay_id: None,
        };

        let mut iter = raw.skip(1);
        while let Some(flag) = iter.next() {
            match flag.as_str() {
                "--headless" => args.headless = true,
                "--duration" => args.duration = iter.next().and_then(|v| v.parse().ok()),
                "--rate" => args.rate = iter.next().and_then(|v| v.parse().ok()),
                "--nats-server" => {
                    if let Some(value) = iter.next() {
                        args.nats_servers.push(value);
                    }
                }
                "--js-stream" => args.js_stream = iter.next(),
                "--subject-prefix" => args.subject_prefix = iter.next(),
                "--source" => args.source = iter.next(),
                "--room" => args.room = iter.next(),
                "--metrics-interval" => args.metrics_interval = iter.next().and_then(|v| v.parse().ok()),
                "--write-cbor-dir" => args.write_cbor_dir = iter.next(),
                "--group-replay-id" => args.group_replay_id = iter.next(),
                _ => {}
            }
        }

        args
    }

    /// Headless mode requires at minimum a duration and a playback rate; an
    /// invocation missing either is an incomplete headless invocation per
    /// the documented CLI contract, and exits non-zero before touching the
    /// broker or store.
    fn validate_headless(&self) -> bool {
        !self.headless || (self.duration.is_some() && self.rate.is_some())
    }
}

struct AppState {
    channel_manager: Arc<ChannelManager<InMemoryJetStream>>,
    presence: Arc<PresenceTracker>,
    store: Arc<Store>,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn channels_handler(State(state): State<Arc<AppState>>) -> Json<Vec<serde_json::Value>> {
    Json(state.channel_manager.directory().to_dicts(false))
}

async fn presence_handler(State(state): State<Arc<AppState>>) -> Json<Vec<presence::ClientPresence>> {
    Json(state.presence.list())
}

async fn message_counts(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let messages = state.store.count_messages().await.unwrap_or(0);
    let commands = state.store.count_commands().await.unwrap_or(0);
    let tags = state.store.count_tags().await.unwrap_or(0);
    Json(serde_json::json!({ "messages": messages, "commands": commands, "tags": tags }))
}

#[tokio::main]
async fn main() {
    let args = HeadlessArgs::parse(std::env::args());
    if !args.validate_headless() {
        eprintln!("--headless requires both --duration and --rate");
        std::process::exit(1);
    }

    let mut config: Config = config::load_config();
    if let Some(prefix) = &args.subject_prefix {
        config.broker.subject_prefix = prefix.clone();
    }
    if let Some(stream) = &args.js_stream {
        config.broker.stream_name = stream.clone();
    }

    logging::setup(config.logging);

    if !args.nats_servers.is_empty() {
        info!(
            "--nats-server flags given ({:?}) but a networked broker client is out of scope; using the in-memory simulator",
            args.nats_servers
        );
    }
    if let Some(source) = &args.source {
        info!("--source {source} given but file-based datagram replay is not wired into this binary");
    }
    if let Some(dir) = &args.write_cbor_dir {
        info!("--write-cbor-dir {dir} given but raw CBOR capture is not wired into this binary");
    }

    if let Err(err) = run(config, args).await {
        error!("fatal error: {err}");
        std::process::exit(1);
    }
}

async fn run(config: Config, args: HeadlessArgs) -> Result<(), RelayError> {
    let db = database::connect(&config.archiver.database_file).await?;
    let store = Arc::new(Store::new(db));

    let js = Arc::new(InMemoryJetStream::new());
    js.ensure_stream(
        &config.broker.stream_name,
        vec![format!("{}.>", config.broker.subject_prefix), TAG_BROADCAST_SUBJECT.to_string()],
    )?;
    js.ensure_stream(&config.broker.replay_stream_name, vec!["player.>".to_string()])?;

    // Constructed so the full component graph wires together even though
    // this binary doesn't yet expose ingest/command/replay endpoints over
    // the ops surface.
    let _producer = Producer::new(js.clone(), config.broker.subject_prefix.clone(), None);
    let channel_manager = Arc::new(ChannelManager::new(js.clone()));
    let _command_sender = CommandSender::new(js.clone(), "operator");
    let _tag_sender = TagSender::new(js.clone(), "operator");
    let presence = Arc::new(PresenceTracker::new());
    let _replayer = StoreReplayer::new(js.clone(), store.clone());

    if let Some(replay_id) = &args.group_replay_id {
        channel_manager.start_group_replay(replay_id, &config.broker.replay_stream_name, None)?;
    }
    if let Some(room) = &args.room {
        info!("room override requested: {room}");
    }

    let telemetry_filter = format!("{}.*.*", config.broker.subject_prefix);
    let command_filter = format!("{COMMAND_SUBJECT_PREFIX}.>");
    let telemetry_consumer: Box<dyn PullConsumer> =
        Box::new(js.create_pull_consumer(&config.broker.stream_name, &telemetry_filter, DeliverPolicy::DeliverNew));
    let command_consumer: Box<dyn PullConsumer> =
        Box::new(js.create_pull_consumer(&config.broker.stream_name, &command_filter, DeliverPolicy::DeliverNew));
    let tag_consumer: Box<dyn PullConsumer> =
        Box::new(js.create_pull_consumer(&config.broker.stream_name, "tags.>", DeliverPolicy::DeliverNew));
    let archiver = Arc::new(archiver::Archiver::new(
        telemetry_consumer,
        command_consumer,
        tag_consumer,
        store.clone(),
        config.archiver.batch_size,
    ));

    let mut player_channels: hashbrown::HashMap<String, Box<dyn PullConsumer>> = hashbrown::HashMap::new();
    player_channels.insert(
        "livestream".to_string(),
        Box::new(js.create_pull_consumer(&config.broker.stream_name, LIVESTREAM_SUBJECT, DeliverPolicy::DeliverNew)),
    );
    let engine_config: EnginePlayerConfig = (&config.player).into();
    let player_engine = PlayerEngine::new(player_channels, "livestream", &engine_config)
        .map_err(|err| RelayError::Broker(broker::BrokerError::PublishFailed(err.to_string())))?;
    let player_engine = Arc::new(parking_lot::Mutex::new(player_engine));

    let cancel = CancellationToken::new();

    let archive_task = {
        let archiver = archiver.clone();
        let cancel = cancel.clone();
        let interval = Duration::from_millis(config.broker.pull_timeout_ms);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if let Err(err) = archiver.drain().await {
                            error!("archiver drain failed: {err}");
                        }
                    }
                }
            }
        })
    };

    let metrics_interval = args
        .metrics_interval
        .unwrap_or(config.player.metrics_interval_ms);
    let metrics_task = {
        let player_engine = player_engine.clone();
        let cancel = cancel.clone();
        let interval = Duration::from_millis(metrics_interval);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let mut engine = player_engine.lock();
                        engine.fetch_more(50);
                        let metrics = engine.metrics();
                        info!("player metrics: {metrics:?}");
                    }
                }
            }
        })
    };

    let state = Arc::new(AppState {
        channel_manager: channel_manager.clone(),
        presence: presence.clone(),
        store: store.clone(),
    });

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/channels", get(channels_handler))
        .route("/presence", get(presence_handler))
        .route("/messages", get(message_counts))
        .with_state(state);

    let addr = SocketAddr::new(config.host, config.port);
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind ops surface on {addr}: {err}");
            cancel.cancel();
            archive_task.abort();
            metrics_task.abort();
            return Err(RelayError::Database(err));
        }
    };
    info!("ops surface listening on {addr}");

    let server = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app.into_make_service()).await {
            error!("ops surface error: {err}");
        }
    });

    if args.headless {
        let seconds = args.duration.expect("validated by validate_headless");
        tokio::time::sleep(Duration::from_secs(seconds)).await;
    } else {
        let _ = signal::ctrl_c().await;
    }

    cancel.cancel();
    server.abort();
    archive_task.abort();
    metrics_task.abort();

    Ok(())
}
