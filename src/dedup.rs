// ===============================
// src/dedup.rs
// ===============================
use std::collections::VecDeque;

use ahash::AHashSet as HashSet;
use rust_decimal::Decimal;

use crate::domain::{TradeAction, TradeEvent};

/// Idempotency key: `{account}_{ticket}_{action}`, plus `_{sl}_{tp}` for
/// modify so two modifies of one ticket with different levels stay distinct.
pub fn message_key(ev: &TradeEvent) -> String {
    let ticket = ev
        .source_ticket
        .map(|t| t.to_string())
        .unwrap_or_else(|| "none".to_string());
    let action = ev.action.kind().as_str();
    match &ev.action {
        TradeAction::Modify { protection, .. } => format!(
            "{}_{}_{}_{}_{}",
            ev.account_id,
            ticket,
            action,
            level(protection.stop_loss),
            level(protection.take_profit)
        ),
        _ => format!("{}_{}_{}", ev.account_id, ticket, action),
    }
}

fn level(v: Option<Decimal>) -> String {
    v.map(|d| d.normalize().to_string()).unwrap_or_else(|| "0".to_string())
}

/// Insertion-ordered set of recent keys. Once it grows past `max`, only the
/// newest `max / 2` keys are kept.
#[derive(Debug)]
pub struct KeyWindow {
    order: VecDeque<String>,
    seen: HashSet<String>,
    max: usize,
}

impl KeyWindow {
    pub fn new(max: usize) -> Self {
        Self { order: VecDeque::new(), seen: HashSet::new(), max: max.max(2) }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.seen.contains(key)
    }

    /// Returns false if the key was already present.
    pub fn insert(&mut self, key: String) -> bool {
        if !self.seen.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > self.max {
            let keep = self.max / 2;
            while self.order.len() > keep {
                if let Some(old) = self.order.pop_front() {
                    self.seen.remove(&old);
                }
            }
        }
        true
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.order.len()
    }
}
