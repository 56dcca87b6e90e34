// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : trade_relay — deduplicating trade relay + follower in Rust
Module  : config.rs
Version : 0.5.0
License : MIT (see LICENSE)

Summary : Relays trade events (open/close/modify) from originating accounts
          to following accounts through per-account FIFO queues with
          idempotency keys, reconciles position counts between both sides,
          and replays accepted events on the following platform with bounded
          staleness.
=============================================================================
*/
use std::net::SocketAddr;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use clap::{Args, Parser, Subcommand};
use dotenvy::dotenv;
use rust_decimal::Decimal;
use tracing::warn;

use crate::accounts::AccountTable;
use crate::consumer::ConsumerCfg;
use crate::dispatch::DispatchCfg;
use crate::positions::{NoReportPolicy, ReconcileCfg};
use crate::router::RouterCfg;

#[derive(Debug, Parser)]
#[command(name = "trade_relay", version, about = "Trade relay and follower")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the relay (HTTP queue server + reconciliation).
    Relay(RelayArgs),
    /// Poll a relay and replay events on the following account.
    Follow(FollowerArgs),
}

#[derive(Debug, Clone, Args)]
pub struct RelayArgs {
    #[arg(long, env = "RELAY_LISTEN", default_value = "0.0.0.0:6699")]
    pub listen: SocketAddr,

    #[arg(long, env = "QUEUE_MAX_SIZE", default_value_t = 1000)]
    pub queue_max_size: usize,

    #[arg(long, env = "DEDUP_MAX_KEYS", default_value_t = 10_000)]
    pub dedup_max_keys: usize,

    /// Comma separated; empty permits every account.
    #[arg(long, env = "ALLOWED_ORIGIN_ACCOUNTS", default_value = "")]
    pub allowed_origin_accounts: String,

    #[arg(long, env = "ALLOWED_FOLLOWER_ACCOUNTS", default_value = "")]
    pub allowed_follower_accounts: String,

    /// `follower=origin1|origin2;follower2=origin3`
    #[arg(long, env = "ACCOUNT_MAPPING", default_value = "")]
    pub account_mapping: String,

    #[arg(long, env = "ALERT_COOLDOWN_SECS", default_value_t = 120)]
    pub alert_cooldown_secs: i64,

    #[arg(long, env = "ALERT_WEBHOOK_URL")]
    pub alert_webhook_url: Option<String>,

    #[arg(long, env = "RECONCILE_NO_REPORT_POLICY", default_value = "skip", value_parser = parse_policy)]
    pub no_report_policy: NoReportPolicy,

    #[arg(long, env = "ORIGIN_UTC_OFFSET_HOURS", default_value_t = 2, allow_negative_numbers = true)]
    pub origin_utc_offset_hours: i32,

    #[arg(long, env = "RECORD_FILE")]
    pub record_file: Option<String>,
}

impl RelayArgs {
    pub fn account_table(&self) -> AccountTable {
        AccountTable::new(
            parse_list(&self.allowed_origin_accounts),
            parse_list(&self.allowed_follower_accounts),
            parse_mapping(&self.account_mapping),
        )
    }

    pub fn router_cfg(&self) -> RouterCfg {
        RouterCfg {
            max_queue: self.queue_max_size,
            max_keys: self.dedup_max_keys,
            origin_utc_offset_hours: self.origin_utc_offset_hours,
        }
    }

    pub fn reconcile_cfg(&self) -> ReconcileCfg {
        ReconcileCfg {
            cooldown: chrono::Duration::seconds(self.alert_cooldown_secs.max(0)),
            no_report_policy: self.no_report_policy,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct FollowerArgs {
    #[arg(long, env = "RELAY_URL", default_value = "http://127.0.0.1:6699/queue/read")]
    pub relay_url: String,

    #[arg(long, env = "FOLLOWER_ACCOUNT_ID")]
    pub follower_account_id: String,

    #[arg(long, env = "REQUEST_INTERVAL_SECS", default_value_t = 1)]
    pub request_interval_secs: u64,

    #[arg(long, env = "TIMER_TICK_MS", default_value_t = 1000)]
    pub timer_tick_ms: u64,

    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 5)]
    pub request_timeout_secs: u64,

    #[arg(long, env = "MESSAGE_EXPIRE_SECS", default_value_t = 5)]
    pub message_expire_secs: i64,

    /// 0 follows the relayed volume.
    #[arg(long, env = "FIXED_VOLUME", default_value = "0")]
    pub fixed_volume: Decimal,

    #[arg(long, env = "POSITION_TAG", default_value = "TradeRelay")]
    pub position_tag: String,

    #[arg(long, env = "ORIGIN_UTC_OFFSET_HOURS", default_value_t = 2, allow_negative_numbers = true)]
    pub origin_utc_offset_hours: i32,

    #[arg(long, env = "PAPER_SYMBOLS", default_value = "EURUSD,GBPUSD,XAUUSD,USDJPY")]
    pub paper_symbols: String,

    #[arg(long, env = "METRICS_PORT", default_value_t = 9899)]
    pub metrics_port: u16,

    #[arg(long, env = "RECORD_FILE")]
    pub record_file: Option<String>,
}

impl FollowerArgs {
    pub fn consumer_cfg(&self) -> ConsumerCfg {
        ConsumerCfg {
            relay_url: self.relay_url.clone(),
            account_id: self.follower_account_id.trim().to_string(),
            request_interval: Duration::from_secs(self.request_interval_secs),
            tick: Duration::from_millis(self.timer_tick_ms.max(1)),
            request_timeout: Duration::from_secs(self.request_timeout_secs.max(1)),
            message_expire: chrono::Duration::seconds(self.message_expire_secs.max(0)),
            origin_utc_offset_hours: self.origin_utc_offset_hours,
        }
    }

    pub fn dispatch_cfg(&self) -> DispatchCfg {
        DispatchCfg {
            fixed_volume: (self.fixed_volume > Decimal::ZERO).then_some(self.fixed_volume),
            tag: self.position_tag.clone(),
        }
    }

    pub fn paper_symbols(&self) -> Vec<String> {
        parse_list(&self.paper_symbols).into_iter().map(|s| s.to_ascii_uppercase()).collect()
    }
}

pub fn load() -> Cli {
    // .env first so clap's `env` lookups see it
    let _ = dotenv();
    Cli::parse()
}

fn parse_policy(s: &str) -> Result<NoReportPolicy, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "skip" | "" => Ok(NoReportPolicy::Skip),
        "alert" => Ok(NoReportPolicy::AlertAsMismatch),
        other => Err(format!("expected skip|alert, got '{other}'")),
    }
}

pub fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|x| x.trim())
        .filter(|x| !x.is_empty())
        .map(|x| x.to_string())
        .collect()
}

/// `6098214=7412666|7412667;6098215=7412668` -> follower -> ordered sources.
/// Entries without `=` or without any source are skipped with a warning.
pub fn parse_mapping(raw: &str) -> HashMap<String, Vec<String>> {
    let mut out = HashMap::new();
    for entry in raw.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((follower, sources)) = entry.split_once('=') else {
            warn!(%entry, "ACCOUNT_MAPPING entry without '=', ignored");
            continue;
        };
        let follower = follower.trim();
        let sources: Vec<String> = sources
            .split('|')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if follower.is_empty() || sources.is_empty() {
            warn!(%entry, "ACCOUNT_MAPPING entry incomplete, ignored");
            continue;
        }
        out.insert(follower.to_string(), sources);
    }
    out
}
