// ===============================
// src/router.rs (validate -> authorize -> dedup -> tenant FIFO)
// ===============================
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::accounts::AccountTable;
use crate::clock::{parse_origin_time, Clock};
use crate::dedup::message_key;
use crate::domain::{TradeEvent, WireEvent};
use crate::error::RelayError;
use crate::metrics::{DEQUEUES, ENQUEUES, QUEUE_DEPTH, QUEUE_EVICTIONS};
use crate::queue::{PushOutcome, QueueStats, QueueStore};

#[derive(Debug, Clone)]
pub struct RouterCfg {
    pub max_queue: usize,
    pub max_keys: usize,
    pub origin_utc_offset_hours: i32,
}

impl Default for RouterCfg {
    fn default() -> Self {
        Self { max_queue: 1000, max_keys: 10_000, origin_utc_offset_hours: 2 }
    }
}

#[derive(Debug, Clone)]
pub struct Enqueued {
    pub account_id: String,
    pub key: String,
    pub queue_size: usize,
    pub event: TradeEvent,
}

#[derive(Debug, Clone)]
pub struct Dequeued {
    pub follower: String,
    pub event: Option<TradeEvent>,
    /// Remaining events across every queue the follower may drain.
    pub queue_size: usize,
    pub sources: Vec<String>,
}

pub struct MessageRouter {
    accounts: Arc<AccountTable>,
    queues: QueueStore,
    clock: Arc<dyn Clock>,
    origin_utc_offset_hours: i32,
}

impl MessageRouter {
    pub fn new(accounts: Arc<AccountTable>, clock: Arc<dyn Clock>, cfg: RouterCfg) -> Self {
        Self {
            accounts,
            queues: QueueStore::new(cfg.max_queue, cfg.max_keys),
            clock,
            origin_utc_offset_hours: cfg.origin_utc_offset_hours,
        }
    }

    pub fn accounts(&self) -> &AccountTable {
        &self.accounts
    }

    pub fn enqueue(&self, wire: WireEvent) -> Result<Enqueued, RelayError> {
        let res = self.try_enqueue(wire);
        let label = match &res {
            Ok(_) => "accepted",
            Err(e) => e.kind(),
        };
        ENQUEUES.with_label_values(&[label]).inc();
        res
    }

    fn try_enqueue(&self, wire: WireEvent) -> Result<Enqueued, RelayError> {
        // authorization is decided on the account alone, before the payload is judged
        let account = wire
            .account_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(RelayError::MissingAccountId)?
            .to_string();
        if let Err(e) = self.accounts.authorize_originating(&account) {
            warn!(%account, allowed = ?self.accounts.originating(), "enqueue from unauthorized account");
            return Err(e);
        }

        let mut ev = TradeEvent::from_wire(wire)?;
        let now = self.clock.now();
        ev.received_at = Some(now);
        ev.queue_time = Some(now);
        ev.origin_time_utc = match ev.origin_timestamp.as_deref() {
            Some(raw) => {
                let parsed = parse_origin_time(raw, self.origin_utc_offset_hours);
                if parsed.is_none() {
                    warn!(%account, timestamp = %raw, "origin timestamp not parseable, kept raw");
                }
                parsed
            }
            None => None,
        };

        let key = message_key(&ev);
        match self.queues.push(key.clone(), ev.clone()) {
            PushOutcome::Duplicate => {
                warn!(%account, %key, "duplicate message ignored");
                Err(RelayError::DuplicateMessage { key })
            }
            PushOutcome::Queued { len, evicted } => {
                if let Some(old) = evicted {
                    warn!(%account, dropped_key = %message_key(&old), "queue full, oldest message dropped");
                    QUEUE_EVICTIONS.with_label_values(&[&account]).inc();
                }
                QUEUE_DEPTH.with_label_values(&[&account]).set(len as i64);
                info!(
                    %account,
                    action = ev.action.kind().as_str(),
                    symbol = ev.action.symbol().unwrap_or("-"),
                    ticket = ?ev.source_ticket,
                    queue_size = len,
                    "enqueued"
                );
                Ok(Enqueued { account_id: account, key, queue_size: len, event: ev })
            }
        }
    }

    /// Pop the head of the first non-empty queue in the follower's mapping
    /// order. Strict priority: a busy first source starves later ones.
    pub fn dequeue(&self, follower: Option<&str>) -> Result<Dequeued, RelayError> {
        let res = self.try_dequeue(follower);
        let label = match &res {
            Ok(d) if d.event.is_some() => "message",
            Ok(_) => "empty",
            Err(e) => e.kind(),
        };
        DEQUEUES.with_label_values(&[label]).inc();
        res
    }

    fn try_dequeue(&self, follower: Option<&str>) -> Result<Dequeued, RelayError> {
        let follower = follower
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(RelayError::MissingAccountId)?;
        self.accounts.authorize_following(follower)?;
        let sources = self.accounts.sources_for(follower)?.to_vec();

        let event = self.queues.pop_first(&sources);
        if let Some(ev) = &event {
            QUEUE_DEPTH
                .with_label_values(&[&ev.account_id])
                .set(self.queues.len(&ev.account_id) as i64);
            debug!(%follower, account = %ev.account_id, action = ev.action.kind().as_str(), "dequeued");
        }
        let queue_size = self.queues.total_len(&sources);
        Ok(Dequeued { follower: follower.to_string(), event, queue_size, sources })
    }

    pub fn queue_depth(&self, follower: &str) -> Result<usize, RelayError> {
        self.accounts.authorize_following(follower)?;
        let sources = self.accounts.sources_for(follower)?;
        Ok(self.queues.total_len(sources))
    }

    pub fn queue_len(&self, account: &str) -> usize {
        self.queues.len(account)
    }

    pub fn peek(&self, account: &str) -> Option<TradeEvent> {
        self.queues.peek(account)
    }

    pub fn clear(&self, account: Option<&str>) -> usize {
        let n = self.queues.clear(account);
        info!(account = account.unwrap_or("*"), dropped = n, "queue cleared");
        n
    }

    pub fn stats(&self, account: Option<&str>) -> QueueStats {
        self.queues.stats(account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use ahash::AHashMap as HashMap;
    use chrono::{TimeZone, Utc};

    fn router_with(origin_allow: Vec<&str>, max_queue: usize) -> MessageRouter {
        router_allowing(origin_allow, vec![], max_queue)
    }

    fn router_allowing(origin_allow: Vec<&str>, follow_allow: Vec<&str>, max_queue: usize) -> MessageRouter {
        let mut mapping = HashMap::new();
        mapping.insert("F1".to_string(), vec!["A".to_string()]);
        mapping.insert("F2".to_string(), vec!["A".to_string(), "B".to_string()]);
        mapping.insert("FB".to_string(), vec!["B".to_string()]);
        let accounts = AccountTable::new(
            origin_allow.into_iter().map(String::from).collect(),
            follow_allow.into_iter().map(String::from).collect(),
            mapping,
        );
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 12, 4, 16, 11, 12).unwrap()));
        let cfg = RouterCfg { max_queue, max_keys: 100, origin_utc_offset_hours: 2 };
        MessageRouter::new(Arc::new(accounts), clock, cfg)
    }

    fn open(account: &str, ticket: i64) -> WireEvent {
        WireEvent {
            account_id: Some(account.into()),
            action: Some("open".into()),
            order_type: Some("buy".into()),
            symbol: Some("EURUSD".into()),
            ticket: Some(ticket),
            ..Default::default()
        }
    }

    fn tickets(r: &MessageRouter, follower: &str) -> Vec<u64> {
        std::iter::from_fn(|| r.dequeue(Some(follower)).unwrap().event)
            .map(|e| e.source_ticket.unwrap())
            .collect()
    }

    #[test]
    fn per_tenant_fifo() {
        let r = router_with(vec![], 100);
        for t in [5, 3, 9, 1] {
            r.enqueue(open("A", t)).unwrap();
        }
        assert_eq!(tickets(&r, "F1"), vec![5, 3, 9, 1]);
    }

    #[test]
    fn duplicate_submission_is_queued_once() {
        let r = router_with(vec![], 100);
        assert_eq!(r.enqueue(open("A", 7)).unwrap().queue_size, 1);
        assert!(matches!(r.enqueue(open("A", 7)), Err(RelayError::DuplicateMessage { .. })));
        assert_eq!(tickets(&r, "F1"), vec![7]);
        // consumed, still remembered
        assert!(matches!(r.enqueue(open("A", 7)), Err(RelayError::DuplicateMessage { .. })));
    }

    #[test]
    fn capacity_bound_drops_oldest() {
        let r = router_with(vec![], 3);
        for t in 1..=5 {
            r.enqueue(open("A", t)).unwrap();
        }
        assert_eq!(r.queue_len("A"), 3);
        assert_eq!(tickets(&r, "F1"), vec![3, 4, 5]);
    }

    #[test]
    fn routing_isolation_and_priority() {
        let r = router_with(vec![], 100);
        r.enqueue(open("B", 1)).unwrap();
        assert!(r.dequeue(Some("F1")).unwrap().event.is_none());

        r.enqueue(open("A", 2)).unwrap();
        r.enqueue(open("B", 3)).unwrap();
        assert_eq!(r.queue_depth("F2").unwrap(), 3);
        let first = r.dequeue(Some("F2")).unwrap();
        assert_eq!(first.event.unwrap().account_id, "A");
        assert_eq!(first.queue_size, 2);
        assert_eq!(tickets(&r, "F2"), vec![1, 3]);
    }

    #[test]
    fn rejections() {
        let r = router_with(vec!["A"], 100);
        let mut anon = open("A", 1);
        anon.account_id = None;
        assert_eq!(r.enqueue(anon).unwrap_err(), RelayError::MissingAccountId);
        assert!(matches!(r.enqueue(open("B", 1)), Err(RelayError::Unauthorized { .. })));
        assert_eq!(r.dequeue(None).unwrap_err(), RelayError::MissingAccountId);
        assert!(matches!(r.dequeue(Some("ghost")), Err(RelayError::NoMapping { .. })));
        // unauthorized wins over a malformed payload
        let bad = WireEvent { account_id: Some("B".into()), ..Default::default() };
        assert!(matches!(r.enqueue(bad), Err(RelayError::Unauthorized { .. })));
    }

    #[test]
    fn mapped_follower_outside_allow_list_is_refused() {
        let r = router_allowing(vec![], vec!["F1"], 100);
        r.enqueue(open("A", 1)).unwrap();
        match r.dequeue(Some("F2")) {
            Err(RelayError::Unauthorized { account, allowed }) => {
                assert_eq!(account, "F2");
                assert_eq!(allowed, vec!["F1".to_string()]);
            }
            other => panic!("expected unauthorized, got {other:?}"),
        }
        assert!(matches!(r.queue_depth("F2"), Err(RelayError::Unauthorized { .. })));
        assert_eq!(r.queue_len("A"), 1);
        assert_eq!(tickets(&r, "F1"), vec![1]);
    }

    #[test]
    fn enqueue_stamps_times_and_normalizes_origin() {
        let r = router_with(vec![], 100);
        let mut w = open("A", 1);
        w.timestamp = Some("2025.12.04 18:11:10".into());
        let ev = r.enqueue(w).unwrap().event;
        assert_eq!(ev.queue_time, Some(Utc.with_ymd_and_hms(2025, 12, 4, 16, 11, 12).unwrap()));
        assert_eq!(ev.origin_time_utc, Some(Utc.with_ymd_and_hms(2025, 12, 4, 16, 11, 10).unwrap()));

        let mut w = open("A", 2);
        w.timestamp = Some("not a time".into());
        let ev = r.enqueue(w).unwrap().event;
        assert!(ev.origin_time_utc.is_none());
        assert_eq!(ev.origin_timestamp.as_deref(), Some("not a time"));
    }
}
