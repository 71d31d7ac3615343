mod clients;
mod config;
mod lifecycle;
mod migrate;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use chrono::{Duration, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ferry_relay::Dispatcher;
use ferry_relay::clients::{ChatClient, RoomClient};
use ferry_store::{KeyLocks, LinkTable, SeenEvents, Store};

use clients::bot::BotClient;
use clients::federation::FederationClient;
use config::{Config, PLACEHOLDER_COUNTERPART};
use lifecycle::Controller;

fn config_path() -> PathBuf {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "-c" || arg == "--config" {
            if let Some(path) = args.next() {
                return PathBuf::from(path);
            }
        }
    }
    PathBuf::from("config.json")
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cfg = Config::load_or_init(&config_path())?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cfg.content.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if cfg.content.counterpart == PLACEHOLDER_COUNTERPART {
        bail!("edit the configuration file first: counterpart is still the placeholder");
    }

    let store = Arc::new(Store::open(&cfg.content.database).context("open store")?);
    let locks = Arc::new(KeyLocks::new());
    let links = LinkTable::open(store.clone(), locks.clone()).context("open link table")?;
    let seen = SeenEvents::new(store.clone());

    if let Some(days) = cfg.content.seen_retention_days {
        seen.prune_older_than(Utc::now() - Duration::days(i64::from(days)))
            .context("prune processed-event entries")?;
    }

    if let Some(list) = cfg.take_legacy_room_list() {
        migrate::import_legacy_rooms(&links, list)
            .await
            .context("import legacy room list")?;
    }

    let bot = Arc::new(BotClient::new(&cfg.content.bot.token)?);
    let federation = Arc::new(FederationClient::new(
        &cfg.content.federation.base_url,
        &cfg.content.federation.username,
        &cfg.content.federation.password,
        &cfg.content.federation.device_id,
        &cfg.content.federation.token,
    )?);
    if !federation.has_token() {
        cfg.content.federation.token = federation.login().await.context("login")?;
        cfg.save()?;
    }

    let intake = CancellationToken::new();
    let net = CancellationToken::new();
    let tracker = TaskTracker::new();

    let chat: Arc<dyn ChatClient> = bot.clone();
    let rooms: Arc<dyn RoomClient> = federation.clone();
    let dispatcher = Dispatcher::new(
        links,
        seen,
        chat,
        rooms,
        cfg.content.counterpart.clone(),
        net.clone(),
    );

    match bot.self_identity().await {
        Ok(name) => info!(bot = %name, "bridge is up"),
        Err(e) => warn!(error = %e, "could not fetch bot identity"),
    }

    // Signals must route through the tiered shutdown from the moment events
    // can flow, so the listener goes up before the intake loops.
    let (tx, rx) = mpsc::channel(4);
    lifecycle::listen_for_signals(tx);

    let poll_timeout = cfg.content.bot.poll_timeout_secs;
    let shared_cfg = Arc::new(Mutex::new(cfg));
    tokio::spawn(clients::bot::run_poll_loop(
        bot,
        dispatcher.clone(),
        tracker.clone(),
        intake.clone(),
        poll_timeout,
    ));
    tokio::spawn(clients::federation::run_sync_loop(
        federation,
        dispatcher.clone(),
        tracker.clone(),
        intake.clone(),
        shared_cfg,
    ));

    let controller = Controller::new(store, dispatcher.fatal_token(), intake, net, tracker);
    let code = controller.run(rx).await;
    std::process::exit(code);
}
