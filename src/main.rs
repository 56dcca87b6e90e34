// ===============================
// src/main.rs
// ===============================
/*
 # relay
 ACCOUNT_MAPPING="6098214=7412666" cargo run -- relay
 curl -s -XPOST localhost:6699/queue/add -H 'content-type: application/json' \
   -d '{"accountId":"7412666","action":"open","orderType":"buy","symbol":"EURUSD","volume":0.1,"ticket":1001}'
 curl -s 'localhost:6699/queue/read?accountId=6098214&total=0&buy=0&sell=0'
 curl -s localhost:6699/metrics | grep '^relay_'

 # follower (paper engine)
 FOLLOWER_ACCOUNT_ID=6098214 cargo run -- follow
 curl -s localhost:9899/metrics | grep '^follower_'
*/
/*
=============================================================================
Project : trade_relay — deduplicating trade relay + follower in Rust
Module  : main.rs
Version : 0.5.0
License : MIT (see LICENSE)

Summary : Relays trade events (open/close/modify) from originating accounts
          to following accounts through per-account FIFO queues with
          idempotency keys, reconciles position counts between both sides,
          and replays accepted events on the following platform with bounded
          staleness.
=============================================================================
*/
mod accounts;
mod clock;
mod config;
mod consumer;
mod dedup;
mod dispatch;
mod domain;
mod error;
mod gateway;          // ExecutionEngine seam + paper engine
mod metrics;
mod notifier;
mod positions;        // position reconciliation
mod posttrade;
mod queue;
mod recorder;
mod router;
mod server;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::clock::{Clock, SystemClock};
use crate::config::{Command, FollowerArgs, RelayArgs};
use crate::consumer::SessionStats;
use crate::dispatch::Dispatcher;
use crate::error::StartupError;
use crate::gateway::PaperEngine;
use crate::notifier::{LogNotifier, Notifier, WebhookNotifier};
use crate::positions::PositionLedger;
use crate::recorder::Recorder;
use crate::router::MessageRouter;
use crate::server::RelayState;

#[tokio::main]
async fn main() {
    // ---- Logging ----
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // ---- Config ----
    let cli = config::load();

    // ---- Metrics ----
    metrics::init();

    let res = match cli.command {
        Command::Relay(args) => run_relay(args).await,
        Command::Follow(args) => run_follower(args).await,
    };
    if let Err(e) = res {
        error!(error = %e, "exited with error");
        std::process::exit(1);
    }
}

async fn run_relay(args: RelayArgs) -> Result<(), StartupError> {
    let accounts = Arc::new(args.account_table());

    info!(
        listen = %args.listen,
        queue_max_size = args.queue_max_size,
        dedup_max_keys = args.dedup_max_keys,
        allowed_origin = ?accounts.originating(),
        mapped_followers = accounts.mapping_len(),
        alert_cooldown_secs = args.alert_cooldown_secs,
        no_report_policy = ?args.no_report_policy,
        webhook = args.alert_webhook_url.is_some(),
        "startup config"
    );
    if accounts.mapping_len() == 0 {
        warn!("ACCOUNT_MAPPING is empty, every follower read will be rejected");
    }
    metrics::CONFIG_ROLE.with_label_values(&["relay"]).set(1);
    metrics::CONFIG_MAPPED_FOLLOWERS.set(accounts.mapping_len() as i64);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let notifier: Arc<dyn Notifier> = match &args.alert_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())?),
        None => Arc::new(LogNotifier),
    };

    let state = Arc::new(RelayState {
        router: MessageRouter::new(accounts.clone(), clock.clone(), args.router_cfg()),
        ledger: PositionLedger::new(accounts, clock.clone(), notifier, args.reconcile_cfg()),
        recorder: Recorder::spawn(args.record_file.clone()),
        clock,
    });

    server::serve(args.listen, state, shutdown_signal()).await?;
    info!("relay stopped");
    Ok(())
}

async fn run_follower(args: FollowerArgs) -> Result<(), StartupError> {
    let cfg = args.consumer_cfg();
    if cfg.account_id.is_empty() {
        return Err(StartupError::Config("FOLLOWER_ACCOUNT_ID is empty".into()));
    }
    let symbols = args.paper_symbols();
    let dispatch_cfg = args.dispatch_cfg();

    info!(
        relay = %cfg.relay_url,
        account = %cfg.account_id,
        fixed_volume = ?dispatch_cfg.fixed_volume,
        tag = %dispatch_cfg.tag,
        symbols = ?symbols,
        metrics_port = args.metrics_port,
        "startup config"
    );
    metrics::CONFIG_ROLE.with_label_values(&["follower"]).set(1);
    metrics::serve_metrics(args.metrics_port);

    let engine = PaperEngine::new(cfg.account_id.clone(), &symbols);
    let dispatcher = Dispatcher::new(engine, dispatch_cfg);
    let stats = Arc::new(SessionStats::default());
    let recorder = Recorder::spawn(args.record_file.clone());

    consumer::run(cfg, dispatcher, Arc::new(SystemClock), recorder, stats.clone(), shutdown_signal()).await?;
    stats.log_summary();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(?e, "ctrl-c handler failed, running until killed");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
