// ===============================
// src/queue.rs (per-tenant FIFO + idempotency window)
// ===============================
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::dedup::KeyWindow;
use crate::domain::TradeEvent;

/// One originating account's queue. Dedup keys outlive the events they
/// admitted: an evicted or consumed event re-sent with the same key is
/// still a duplicate.
#[derive(Debug)]
struct TenantQueue {
    events: VecDeque<TradeEvent>,
    keys: KeyWindow,
}

#[derive(Debug)]
pub enum PushOutcome {
    Queued { len: usize, evicted: Option<TradeEvent> },
    Duplicate,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub size: usize,
    pub max_size: usize,
    pub oldest_message_time: Option<DateTime<Utc>>,
    pub newest_message_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_queues: Option<BTreeMap<String, usize>>,
}

/// Tenant queues are created lazily and live for the process lifetime.
/// The outer map lock is only held to look up / insert a tenant; all queue
/// work happens under that tenant's own mutex.
pub struct QueueStore {
    tenants: RwLock<HashMap<String, Arc<Mutex<TenantQueue>>>>,
    max_size: usize,
    max_keys: usize,
}

impl QueueStore {
    pub fn new(max_size: usize, max_keys: usize) -> Self {
        Self { tenants: RwLock::new(HashMap::new()), max_size: max_size.max(1), max_keys }
    }

    fn tenant(&self, id: &str) -> Option<Arc<Mutex<TenantQueue>>> {
        self.tenants.read().get(id).cloned()
    }

    fn tenant_or_create(&self, id: &str) -> Arc<Mutex<TenantQueue>> {
        if let Some(t) = self.tenant(id) {
            return t;
        }
        let mut map = self.tenants.write();
        map.entry(id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(TenantQueue {
                    events: VecDeque::new(),
                    keys: KeyWindow::new(self.max_keys),
                }))
            })
            .clone()
    }

    /// Dedup check, eviction and append happen under one tenant lock.
    pub fn push(&self, key: String, ev: TradeEvent) -> PushOutcome {
        let tenant = self.tenant_or_create(&ev.account_id);
        let mut q = tenant.lock();
        if q.keys.contains(&key) {
            return PushOutcome::Duplicate;
        }
        let evicted = if q.events.len() >= self.max_size { q.events.pop_front() } else { None };
        q.events.push_back(ev);
        q.keys.insert(key);
        PushOutcome::Queued { len: q.events.len(), evicted }
    }

    /// Pop the head of the first non-empty queue, in the given order.
    pub fn pop_first(&self, ids: &[String]) -> Option<TradeEvent> {
        for id in ids {
            if let Some(tenant) = self.tenant(id) {
                if let Some(ev) = tenant.lock().events.pop_front() {
                    return Some(ev);
                }
            }
        }
        None
    }

    pub fn peek(&self, id: &str) -> Option<TradeEvent> {
        let tenant = self.tenant(id)?;
        let q = tenant.lock();
        q.events.front().cloned()
    }

    pub fn len(&self, id: &str) -> usize {
        match self.tenant(id) {
            Some(tenant) => {
                let q = tenant.lock();
                q.events.len()
            }
            None => 0,
        }
    }

    pub fn total_len(&self, ids: &[String]) -> usize {
        ids.iter().map(|id| self.len(id)).sum()
    }

    /// Drop queued events (one tenant or all). Dedup keys are kept.
    pub fn clear(&self, id: Option<&str>) -> usize {
        match id {
            Some(id) => self.tenant(id).map(|t| clear_tenant(&t)).unwrap_or(0),
            None => {
                let all: Vec<_> = self.tenants.read().values().cloned().collect();
                all.iter().map(clear_tenant).sum()
            }
        }
    }

    pub fn stats(&self, id: Option<&str>) -> QueueStats {
        match id {
            Some(id) => {
                let (size, oldest, newest) = self
                    .tenant(id)
                    .map(|t| {
                        let q = t.lock();
                        (
                            q.events.len(),
                            q.events.front().and_then(|e| e.queue_time),
                            q.events.back().and_then(|e| e.queue_time),
                        )
                    })
                    .unwrap_or((0, None, None));
                QueueStats {
                    size,
                    max_size: self.max_size,
                    oldest_message_time: oldest,
                    newest_message_time: newest,
                    queue_count: None,
                    account_queues: None,
                }
            }
            None => {
                let snapshot: Vec<_> = self
                    .tenants
                    .read()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                let mut per_account = BTreeMap::new();
                let mut oldest: Option<DateTime<Utc>> = None;
                let mut newest: Option<DateTime<Utc>> = None;
                for (account, tenant) in snapshot {
                    let q = tenant.lock();
                    per_account.insert(account, q.events.len());
                    if let Some(t) = q.events.front().and_then(|e| e.queue_time) {
                        oldest = Some(oldest.map_or(t, |o| o.min(t)));
                    }
                    if let Some(t) = q.events.back().and_then(|e| e.queue_time) {
                        newest = Some(newest.map_or(t, |n| n.max(t)));
                    }
                }
                QueueStats {
                    size: per_account.values().sum(),
                    max_size: self.max_size,
                    oldest_message_time: oldest,
                    newest_message_time: newest,
                    queue_count: Some(per_account.len()),
                    account_queues: Some(per_account),
                }
            }
        }
    }
}

fn clear_tenant(t: &Arc<Mutex<TenantQueue>>) -> usize {
    let mut q = t.lock();
    let n = q.events.len();
    q.events.clear();
    n
}
