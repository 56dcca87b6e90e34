// ===============================
// src/positions.rs (position reconciliation between the two sides)
// ===============================
use std::fmt::Write as _;
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::accounts::AccountTable;
use crate::clock::Clock;
use crate::domain::{PositionCounts, PositionSide};
use crate::metrics::RECONCILE;
use crate::notifier::Notifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionSnapshot {
    #[serde(flatten)]
    pub counts: PositionCounts,
    pub last_update_time: DateTime<Utc>,
}

/// What to do when no mapped originating account has ever reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NoReportPolicy {
    #[default]
    Skip,
    /// Compare against an all-zero originating side.
    AlertAsMismatch,
}

#[derive(Debug, Clone)]
pub struct ReconcileCfg {
    pub cooldown: Duration,
    pub no_report_policy: NoReportPolicy,
}

impl Default for ReconcileCfg {
    fn default() -> Self {
        Self { cooldown: Duration::seconds(120), no_report_policy: NoReportPolicy::Skip }
    }
}

/// Originating counts summed over the mapped accounts. Each report is a
/// `u32`, the sum is not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountSum {
    pub total: u64,
    pub buy: u64,
    pub sell: u64,
}

impl CountSum {
    fn add(self, c: PositionCounts) -> Self {
        Self {
            total: self.total + u64::from(c.total),
            buy: self.buy + u64::from(c.buy),
            sell: self.sell + u64::from(c.sell),
        }
    }
}

/// Signed following-minus-originating differences.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountDiff {
    pub total: i64,
    pub buy: i64,
    pub sell: i64,
}

impl CountDiff {
    fn between(following: PositionCounts, originating: CountSum) -> Self {
        let signed = |f: u32, o: u64| i64::from(f) - i64::try_from(o).unwrap_or(i64::MAX);
        Self {
            total: signed(following.total, originating.total),
            buy: signed(following.buy, originating.buy),
            sell: signed(following.sell, originating.sell),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.total == 0 && self.buy == 0 && self.sell == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MismatchAlert {
    pub follower: String,
    pub following: PositionCounts,
    pub originating: CountSum,
    /// Every mapped originating account; `None` if it never reported.
    pub breakdown: Vec<(String, Option<PositionSnapshot>)>,
    pub diff: CountDiff,
    pub previous_alert: Option<DateTime<Utc>>,
    pub at: DateTime<Utc>,
}

impl MismatchAlert {
    pub fn subject(&self) -> String {
        format!(
            "[TradeRelay] position mismatch on follower {} (total {:+})",
            self.follower, self.diff.total
        )
    }

    pub fn body(&self) -> String {
        let mut b = String::new();
        let _ = writeln!(b, "Position mismatch detected at {}", self.at.to_rfc3339());
        let _ = writeln!(b);
        let _ = writeln!(
            b,
            "Following {}: total={} buy={} sell={}",
            self.follower, self.following.total, self.following.buy, self.following.sell
        );
        let _ = writeln!(
            b,
            "Originating (sum): total={} buy={} sell={}",
            self.originating.total, self.originating.buy, self.originating.sell
        );
        for (account, snap) in &self.breakdown {
            match snap {
                Some(s) => {
                    let _ = writeln!(
                        b,
                        "  - {}: total={} buy={} sell={} (updated {})",
                        account,
                        s.counts.total,
                        s.counts.buy,
                        s.counts.sell,
                        s.last_update_time.to_rfc3339()
                    );
                }
                None => {
                    let _ = writeln!(b, "  - {account}: never reported");
                }
            }
        }
        let _ = writeln!(
            b,
            "Difference (following - originating): total={:+} buy={:+} sell={:+}",
            self.diff.total, self.diff.buy, self.diff.sell
        );
        match self.previous_alert {
            Some(t) => {
                let _ = writeln!(b, "Previous alert: {}", t.to_rfc3339());
            }
            None => {
                let _ = writeln!(b, "Previous alert: none");
            }
        }
        b
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    NoMapping,
    NoReports,
    Matched,
    Alerted(Box<MismatchAlert>),
    Suppressed { last_alert: DateTime<Utc> },
}

impl ReconcileOutcome {
    fn label(&self) -> &'static str {
        match self {
            ReconcileOutcome::NoMapping => "no_mapping",
            ReconcileOutcome::NoReports => "skipped",
            ReconcileOutcome::Matched => "matched",
            ReconcileOutcome::Alerted(_) => "alerted",
            ReconcileOutcome::Suppressed { .. } => "suppressed",
        }
    }
}

/// Last-reported position counts per side/account plus per-pair alert
/// suppression. Snapshots never expire; a stale report is compared as-is.
pub struct PositionLedger {
    accounts: Arc<AccountTable>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    cfg: ReconcileCfg,
    snapshots: Mutex<HashMap<(PositionSide, String), PositionSnapshot>>,
    last_alert: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl PositionLedger {
    pub fn new(
        accounts: Arc<AccountTable>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        cfg: ReconcileCfg,
    ) -> Self {
        Self {
            accounts,
            clock,
            notifier,
            cfg,
            snapshots: Mutex::new(HashMap::new()),
            last_alert: Mutex::new(HashMap::new()),
        }
    }

    pub fn report_position(&self, side: PositionSide, account: &str, counts: PositionCounts) {
        let snap = PositionSnapshot { counts, last_update_time: self.clock.now() };
        self.snapshots.lock().insert((side, account.to_string()), snap);
        debug!(?side, %account, total = counts.total, buy = counts.buy, sell = counts.sell, "position report");
    }

    #[cfg(test)]
    pub fn snapshot(&self, side: PositionSide, account: &str) -> Option<PositionSnapshot> {
        self.snapshots.lock().get(&(side, account.to_string())).copied()
    }

    pub fn all_snapshots(&self) -> Vec<(PositionSide, String, PositionSnapshot)> {
        let mut out: Vec<_> = self
            .snapshots
            .lock()
            .iter()
            .map(|((side, acc), snap)| (*side, acc.clone(), *snap))
            .collect();
        out.sort_by(|a, b| a.1.cmp(&b.1));
        out
    }

    /// Compare a follower's counts with the sum over its mapped originating
    /// accounts and raise a rate-limited alert on mismatch.
    pub fn compare_and_alert(&self, follower: &str, following: PositionCounts) -> ReconcileOutcome {
        let outcome = self.evaluate(follower, following);
        RECONCILE.with_label_values(&[follower, outcome.label()]).inc();
        if let ReconcileOutcome::Alerted(alert) = &outcome {
            info!(%follower, diff_total = alert.diff.total, "position mismatch alert");
            self.notifier.notify(&alert.subject(), &alert.body());
        }
        outcome
    }

    fn evaluate(&self, follower: &str, following: PositionCounts) -> ReconcileOutcome {
        let Ok(sources) = self.accounts.sources_for(follower) else {
            return ReconcileOutcome::NoMapping;
        };

        let breakdown: Vec<(String, Option<PositionSnapshot>)> = {
            let snaps = self.snapshots.lock();
            sources
                .iter()
                .map(|acc| (acc.clone(), snaps.get(&(PositionSide::Originating, acc.clone())).copied()))
                .collect()
        };

        let reported: Vec<PositionCounts> =
            breakdown.iter().filter_map(|(_, s)| s.map(|s| s.counts)).collect();
        if reported.is_empty() && self.cfg.no_report_policy == NoReportPolicy::Skip {
            return ReconcileOutcome::NoReports;
        }
        let originating = reported.iter().fold(CountSum::default(), |acc, c| acc.add(*c));
        let diff = CountDiff::between(following, originating);

        let key = suppression_key(follower, sources);
        let now = self.clock.now();
        let mut last_alert = self.last_alert.lock();

        if diff.is_zero() {
            last_alert.remove(&key);
            return ReconcileOutcome::Matched;
        }

        let previous = last_alert.get(&key).copied();
        if let Some(prev) = previous {
            if now - prev < self.cfg.cooldown {
                return ReconcileOutcome::Suppressed { last_alert: prev };
            }
        }
        last_alert.insert(key, now);

        ReconcileOutcome::Alerted(Box::new(MismatchAlert {
            follower: follower.to_string(),
            following,
            originating,
            breakdown,
            diff,
            previous_alert: previous,
            at: now,
        }))
    }
}

fn suppression_key(follower: &str, sources: &[String]) -> String {
    let mut sorted = sources.to_vec();
    sorted.sort();
    format!("{follower}|{}", sorted.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::notifier::RecordingNotifier;
    use chrono::TimeZone;

    struct Fixture {
        ledger: PositionLedger,
        clock: Arc<ManualClock>,
        notifier: Arc<RecordingNotifier>,
    }

    fn fixture(policy: NoReportPolicy) -> Fixture {
        let mut mapping = HashMap::new();
        mapping.insert("6098214".to_string(), vec!["7412666".to_string()]);
        mapping.insert("multi".to_string(), vec!["A".to_string(), "B".to_string()]);
        let accounts = Arc::new(AccountTable::new(vec![], vec![], mapping));
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 12, 5, 8, 0, 0).unwrap()));
        let notifier = Arc::new(RecordingNotifier::default());
        let cfg = ReconcileCfg { cooldown: Duration::seconds(120), no_report_policy: policy };
        let ledger = PositionLedger::new(accounts, clock.clone(), notifier.clone(), cfg);
        Fixture { ledger, clock, notifier }
    }

    #[test]
    fn mismatch_alerts_are_rate_limited_and_rearmed_by_a_match() {
        let f = fixture(NoReportPolicy::Skip);
        f.ledger.report_position(PositionSide::Originating, "7412666", PositionCounts::new(1, 1, 0));

        let mismatch = PositionCounts::new(2, 2, 0);
        assert!(matches!(f.ledger.compare_and_alert("6098214", mismatch), ReconcileOutcome::Alerted(_)));
        assert_eq!(f.notifier.count(), 1);

        f.clock.advance(Duration::seconds(30));
        assert!(matches!(
            f.ledger.compare_and_alert("6098214", mismatch),
            ReconcileOutcome::Suppressed { .. }
        ));
        assert_eq!(f.notifier.count(), 1);

        f.clock.advance(Duration::seconds(100)); // 130s after the first alert
        match f.ledger.compare_and_alert("6098214", mismatch) {
            ReconcileOutcome::Alerted(a) => {
                assert_eq!(a.previous_alert, Some(Utc.with_ymd_and_hms(2025, 12, 5, 8, 0, 0).unwrap()));
            }
            other => panic!("expected alert, got {other:?}"),
        }
        assert_eq!(f.notifier.count(), 2);

        f.clock.advance(Duration::seconds(5));
        assert_eq!(
            f.ledger.compare_and_alert("6098214", PositionCounts::new(1, 1, 0)),
            ReconcileOutcome::Matched
        );
        f.clock.advance(Duration::seconds(1));
        assert!(matches!(f.ledger.compare_and_alert("6098214", mismatch), ReconcileOutcome::Alerted(_)));
        assert_eq!(f.notifier.count(), 3);
    }

    #[test]
    fn alert_body_carries_breakdown_and_signed_diff() {
        let f = fixture(NoReportPolicy::Skip);
        f.ledger.report_position(PositionSide::Originating, "A", PositionCounts::new(2, 1, 1));
        let outcome = f.ledger.compare_and_alert("multi", PositionCounts::new(1, 0, 1));
        let ReconcileOutcome::Alerted(alert) = outcome else { panic!("expected alert") };
        assert_eq!(alert.originating, CountSum { total: 2, buy: 1, sell: 1 });
        assert_eq!(alert.diff, CountDiff { total: -1, buy: -1, sell: 0 });

        let (subject, body) = f.notifier.last().unwrap();
        assert!(subject.contains("multi"));
        assert!(body.contains("- A: total=2 buy=1 sell=1"));
        assert!(body.contains("- B: never reported"));
        assert!(body.contains("total=-1 buy=-1 sell=+0"));
        assert!(body.contains("Previous alert: none"));
    }

    #[test]
    fn unreported_or_unmapped_followers_are_skipped_by_default() {
        let f = fixture(NoReportPolicy::Skip);
        assert_eq!(
            f.ledger.compare_and_alert("6098214", PositionCounts::new(3, 3, 0)),
            ReconcileOutcome::NoReports
        );
        assert_eq!(
            f.ledger.compare_and_alert("stranger", PositionCounts::new(3, 3, 0)),
            ReconcileOutcome::NoMapping
        );
        assert_eq!(f.notifier.count(), 0);
    }

    #[test]
    fn alert_policy_treats_missing_reports_as_zero() {
        let f = fixture(NoReportPolicy::AlertAsMismatch);
        match f.ledger.compare_and_alert("6098214", PositionCounts::new(3, 3, 0)) {
            ReconcileOutcome::Alerted(a) => assert_eq!(a.diff.total, 3),
            other => panic!("expected alert, got {other:?}"),
        }
        assert_eq!(
            f.ledger.compare_and_alert("6098214", PositionCounts::default()),
            ReconcileOutcome::Matched
        );
    }

    #[test]
    fn originating_sum_is_wider_than_a_single_report() {
        let f = fixture(NoReportPolicy::Skip);
        f.ledger.report_position(PositionSide::Originating, "A", PositionCounts::new(u32::MAX, u32::MAX, 0));
        f.ledger.report_position(PositionSide::Originating, "B", PositionCounts::new(1, 1, 0));
        let ReconcileOutcome::Alerted(alert) = f.ledger.compare_and_alert("multi", PositionCounts::default())
        else {
            panic!("expected alert")
        };
        let expected = u64::from(u32::MAX) + 1;
        assert_eq!(alert.originating, CountSum { total: expected, buy: expected, sell: 0 });
        assert_eq!(alert.diff, CountDiff { total: -(expected as i64), buy: -(expected as i64), sell: 0 });
        assert!(f.notifier.last().unwrap().1.contains(&format!("Originating (sum): total={expected}")));
    }

    #[test]
    fn report_overwrites_snapshot() {
        let f = fixture(NoReportPolicy::Skip);
        f.ledger.report_position(PositionSide::Following, "6098214", PositionCounts::new(1, 1, 0));
        f.clock.advance(Duration::seconds(10));
        f.ledger.report_position(PositionSide::Following, "6098214", PositionCounts::new(0, 0, 0));
        let snap = f.ledger.snapshot(PositionSide::Following, "6098214").unwrap();
        assert_eq!(snap.counts.total, 0);
        assert_eq!(snap.last_update_time, f.clock.now());
    }
}
