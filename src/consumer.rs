// ===============================
// src/consumer.rs (follower: poll -> staleness -> dispatch)
// ===============================
//
// Tasks:
//   poller        : timer ticks, PollGate, spawns one cycle at a time
//   cycle         : GET relay -> Empty | Accepted | RequestFailed, staleness check
//                   (DispatcherDown ends the poller with an error)
//   dispatch_loop : sole owner of the execution engine; applies accepted events
//                   and publishes the follower's position counts (watch channel)
//
// A cycle only ends once its event has been dispatched or discarded, and the
// gate stays closed until then.
//
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::clock::{parse_origin_time, Clock};
use crate::dispatch::{DispatchOutcome, Dispatcher, Tally};
use crate::domain::{lenient_id, PositionCounts, TradeEvent, WireEvent};
use crate::error::PollError;
use crate::gateway::{position_counts, ExecutionEngine};
use crate::metrics::{FOLLOWER_POSITIONS, LAT_ORIGIN_DISPATCH, POLLS, STALE_DISCARDS, TIME_PARSE_FAILURES};
use crate::posttrade;
use crate::recorder::{AuditRecord, Recorder};

#[derive(Debug, Clone)]
pub struct ConsumerCfg {
    pub relay_url: String,
    pub account_id: String,
    /// Minimum spacing between two round-trips.
    pub request_interval: Duration,
    pub tick: Duration,
    pub request_timeout: Duration,
    pub message_expire: chrono::Duration,
    pub origin_utc_offset_hours: i32,
}

// ---------- gate / state machine ----------

/// At most one round-trip in flight, rounds spaced at least `min_interval`
/// apart. A tick that arrives too early is simply dropped.
#[derive(Debug)]
pub struct PollGate {
    min_interval: Duration,
    in_flight: bool,
    last_start: Option<Instant>,
}

impl PollGate {
    pub fn new(min_interval: Duration) -> Self {
        Self { min_interval, in_flight: false, last_start: None }
    }

    pub fn try_begin(&mut self, now: Instant) -> bool {
        if self.in_flight {
            return false;
        }
        if let Some(last) = self.last_start {
            if now.saturating_duration_since(last) < self.min_interval {
                return false;
            }
        }
        self.in_flight = true;
        self.last_start = Some(now);
        true
    }

    pub fn finish(&mut self) {
        self.in_flight = false;
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Requesting,
    Empty,
    Accepted,
    RequestFailed,
    /// The dispatch loop is gone; polling must stop.
    DispatcherDown,
}

impl PollState {
    fn label(&self) -> &'static str {
        match self {
            PollState::Idle => "idle",
            PollState::Requesting => "requesting",
            PollState::Empty => "empty",
            PollState::Accepted => "accepted",
            PollState::RequestFailed => "failed",
            PollState::DispatcherDown => "dispatcher_down",
        }
    }
}

// ---------- staleness ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh { age_ms: i64 },
    Stale { age_ms: i64 },
    NoTimestamp,
    /// Timestamp present but unreadable; the event is dispatched anyway.
    Unparseable,
}

pub fn evaluate_freshness(
    ev: &WireEvent,
    now: DateTime<Utc>,
    window: chrono::Duration,
    utc_offset_hours: i32,
) -> Freshness {
    let origin = match ev.origin_time_utc {
        Some(t) => t,
        None => {
            let Some(raw) = ev.timestamp.as_deref().filter(|s| !s.trim().is_empty()) else {
                return Freshness::NoTimestamp;
            };
            match parse_origin_time(raw, utc_offset_hours) {
                Some(t) => t,
                None => return Freshness::Unparseable,
            }
        }
    };
    // absolute: clock skew can put the origin time in our future
    let age_ms = (now - origin).num_milliseconds();
    if age_ms.abs() > window.num_milliseconds() {
        Freshness::Stale { age_ms }
    } else {
        Freshness::Fresh { age_ms }
    }
}

// ---------- session stats ----------

#[derive(Debug, Default)]
pub struct SessionStats {
    pub requests: AtomicU64,
    pub request_success: AtomicU64,
    pub request_fail: AtomicU64,
    pub expired: AtomicU64,
    pub time_parse_failures: AtomicU64,
    pub trade_success: AtomicU64,
    pub trade_fail: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub requests: u64,
    pub request_success: u64,
    pub request_fail: u64,
    pub expired: u64,
    pub time_parse_failures: u64,
    pub trade_success: u64,
    pub trade_fail: u64,
}

impl SessionStats {
    pub fn summary(&self) -> SessionSummary {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        SessionSummary {
            requests: get(&self.requests),
            request_success: get(&self.request_success),
            request_fail: get(&self.request_fail),
            expired: get(&self.expired),
            time_parse_failures: get(&self.time_parse_failures),
            trade_success: get(&self.trade_success),
            trade_fail: get(&self.trade_fail),
        }
    }

    pub fn log_summary(&self) {
        let s = self.summary();
        info!(
            requests = s.requests,
            request_success = s.request_success,
            request_fail = s.request_fail,
            expired = s.expired,
            time_parse_failures = s.time_parse_failures,
            trade_success = s.trade_success,
            trade_fail = s.trade_fail,
            "follower session summary"
        );
    }
}

fn bump(c: &AtomicU64) {
    c.fetch_add(1, Ordering::Relaxed);
}

// ---------- relay client ----------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub data: Option<WireEvent>,
    #[serde(default)]
    pub queue_size: usize,
    #[serde(default, deserialize_with = "lenient_id")]
    pub mt5_account_id: Option<String>,
    #[serde(default)]
    pub allowed_accounts: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RelayClient {
    http: reqwest::Client,
    url: String,
    account_id: String,
}

impl RelayClient {
    pub fn new(url: String, account_id: String, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, url, account_id })
    }

    pub async fn poll(&self, counts: PositionCounts) -> Result<ReadResponse, PollError> {
        let rsp = self
            .http
            .get(&self.url)
            .query(&[
                ("accountId", self.account_id.clone()),
                ("total", counts.total.to_string()),
                ("buy", counts.buy.to_string()),
                ("sell", counts.sell.to_string()),
            ])
            .send()
            .await
            .map_err(classify)?;
        let status = rsp.status();
        let body = rsp.text().await.map_err(classify)?;
        if !status.is_success() {
            return Err(PollError::Status { status: status.as_u16(), body });
        }
        Ok(serde_json::from_str(&body)?)
    }
}

fn classify(e: reqwest::Error) -> PollError {
    if e.is_timeout() {
        PollError::Timeout
    } else {
        PollError::Http(e)
    }
}

// ---------- cycle ----------

pub struct Job {
    pub event: WireEvent,
    pub done: oneshot::Sender<()>,
}

struct CycleCtx {
    client: RelayClient,
    clock: Arc<dyn Clock>,
    stats: Arc<SessionStats>,
    recorder: Recorder,
    jobs: mpsc::Sender<Job>,
    message_expire: chrono::Duration,
    origin_utc_offset_hours: i32,
}

async fn cycle(ctx: &CycleCtx, counts: PositionCounts) -> PollState {
    // Never take a message off the relay that nobody can dispatch.
    if ctx.jobs.is_closed() {
        return PollState::DispatcherDown;
    }
    bump(&ctx.stats.requests);
    let rsp = match ctx.client.poll(counts).await {
        Ok(r) => r,
        Err(e) => {
            bump(&ctx.stats.request_fail);
            POLLS.with_label_values(&[PollState::RequestFailed.label()]).inc();
            error!(error = %e, "relay request failed");
            return PollState::RequestFailed;
        }
    };
    if !rsp.success {
        bump(&ctx.stats.request_fail);
        POLLS.with_label_values(&[PollState::RequestFailed.label()]).inc();
        warn!(follower = ?rsp.mt5_account_id, "relay answered success=false");
        return PollState::RequestFailed;
    }
    bump(&ctx.stats.request_success);

    let Some(event) = rsp.data else {
        POLLS.with_label_values(&[PollState::Empty.label()]).inc();
        debug!(follower = ?rsp.mt5_account_id, sources = ?rsp.allowed_accounts, "queue empty");
        return PollState::Empty;
    };
    POLLS.with_label_values(&[PollState::Accepted.label()]).inc();
    let account = event.account_id.clone().unwrap_or_default();
    info!(
        %account,
        action = event.action.as_deref().unwrap_or("-"),
        symbol = event.symbol.as_deref().unwrap_or("-"),
        ticket = ?event.ticket,
        remaining = rsp.queue_size,
        "message received"
    );

    let now = ctx.clock.now();
    match evaluate_freshness(&event, now, ctx.message_expire, ctx.origin_utc_offset_hours) {
        Freshness::Stale { age_ms } => {
            bump(&ctx.stats.expired);
            STALE_DISCARDS.inc();
            warn!(%account, age_ms, timestamp = event.timestamp.as_deref().unwrap_or("-"), "message expired, discarded");
            ctx.recorder.record(AuditRecord::Stale { ts: now, account, age_ms });
            return PollState::Accepted;
        }
        Freshness::Unparseable => {
            bump(&ctx.stats.time_parse_failures);
            TIME_PARSE_FAILURES.inc();
            warn!(
                %account,
                timestamp = event.timestamp.as_deref().unwrap_or("-"),
                "origin timestamp not parseable, staleness check skipped"
            );
        }
        Freshness::Fresh { age_ms } => LAT_ORIGIN_DISPATCH.observe(age_ms.max(0) as f64),
        Freshness::NoTimestamp => {}
    }

    let (done_tx, done_rx) = oneshot::channel();
    if ctx.jobs.send(Job { event, done: done_tx }).await.is_err() || done_rx.await.is_err() {
        error!(%account, "dispatch loop stopped while handling message");
        return PollState::DispatcherDown;
    }
    PollState::Accepted
}

// ---------- dispatch loop ----------

pub async fn dispatch_loop<E: ExecutionEngine>(
    mut dispatcher: Dispatcher<E>,
    mut jobs: mpsc::Receiver<Job>,
    counts_tx: watch::Sender<PositionCounts>,
    stats: Arc<SessionStats>,
    recorder: Recorder,
    clock: Arc<dyn Clock>,
) {
    info!(account = %dispatcher.engine().account_id(), "dispatch loop started");
    publish_counts(&dispatcher, &counts_tx);
    while let Some(job) = jobs.recv().await {
        let account = job.event.account_id.clone().unwrap_or_default();
        let action = job.event.action.clone().unwrap_or_default();
        let outcome = match TradeEvent::from_wire(job.event) {
            Ok(ev) => dispatcher.dispatch(&ev),
            Err(e) => DispatchOutcome::Failed(e.into()),
        };
        posttrade::report(&account, &action, &outcome, &stats);
        recorder.record(AuditRecord::Dispatched {
            ts: clock.now(),
            account,
            action,
            success: outcome.tally() == Tally::Success,
            outcome: outcome.label().to_string(),
        });
        publish_counts(&dispatcher, &counts_tx);
        let _ = job.done.send(());
    }
    debug!("dispatch loop stopped");
}

fn publish_counts<E: ExecutionEngine>(dispatcher: &Dispatcher<E>, tx: &watch::Sender<PositionCounts>) {
    let counts = position_counts(&dispatcher.engine().list_positions());
    FOLLOWER_POSITIONS.with_label_values(&["total"]).set(counts.total as i64);
    FOLLOWER_POSITIONS.with_label_values(&["buy"]).set(counts.buy as i64);
    FOLLOWER_POSITIONS.with_label_values(&["sell"]).set(counts.sell as i64);
    tx.send_replace(counts);
}

// ---------- poller ----------

/// Run the follower until `shutdown` resolves. An in-flight cycle is always
/// completed before returning.
pub async fn run<E: ExecutionEngine + 'static>(
    cfg: ConsumerCfg,
    dispatcher: Dispatcher<E>,
    clock: Arc<dyn Clock>,
    recorder: Recorder,
    stats: Arc<SessionStats>,
    shutdown: impl Future<Output = ()>,
) -> Result<(), PollError> {
    let client = RelayClient::new(cfg.relay_url.clone(), cfg.account_id.clone(), cfg.request_timeout)?;

    let (job_tx, job_rx) = mpsc::channel::<Job>(1);
    let (counts_tx, counts_rx) = watch::channel(PositionCounts::default());
    let dispatch_handle = tokio::spawn(dispatch_loop(
        dispatcher,
        job_rx,
        counts_tx,
        stats.clone(),
        recorder.clone(),
        clock.clone(),
    ));

    let ctx = Arc::new(CycleCtx {
        client,
        clock,
        stats,
        recorder,
        jobs: job_tx,
        message_expire: cfg.message_expire,
        origin_utc_offset_hours: cfg.origin_utc_offset_hours,
    });

    info!(
        relay = %cfg.relay_url,
        account = %cfg.account_id,
        interval_ms = cfg.request_interval.as_millis() as u64,
        expire_secs = cfg.message_expire.num_seconds(),
        "follower started"
    );

    let mut ticker = interval(cfg.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut gate = PollGate::new(cfg.request_interval);
    let mut state = PollState::Idle;
    let (done_tx, mut done_rx) = mpsc::channel::<PollState>(1);
    let mut failure = None;
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                if !gate.try_begin(Instant::now()) {
                    continue;
                }
                state = PollState::Requesting;
                let ctx = ctx.clone();
                let counts = *counts_rx.borrow();
                let done = done_tx.clone();
                tokio::spawn(async move {
                    let end = cycle(&ctx, counts).await;
                    let _ = done.send(end).await;
                });
            }
            Some(end) = done_rx.recv() => {
                gate.finish();
                debug!(state = end.label(), "poll cycle finished");
                if end == PollState::DispatcherDown {
                    POLLS.with_label_values(&[end.label()]).inc();
                    error!("dispatch loop is down, polling stopped");
                    failure = Some(PollError::DispatcherStopped);
                    break;
                }
                state = PollState::Idle;
            }
        }
    }

    if gate.in_flight() {
        info!(state = state.label(), "waiting for in-flight cycle");
        let _ = done_rx.recv().await;
    }
    drop(ctx);
    if let Err(e) = dispatch_handle.await {
        error!(?e, "dispatch loop panicked");
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
