// ===============================
// src/posttrade.rs
// ===============================
use tracing::{error, info, warn};

use crate::consumer::SessionStats;
use crate::dispatch::{DispatchOutcome, ProtectionStatus, Tally};
use crate::metrics::TRADES;

/// Log one dispatch outcome and count it. Only successes and failures are
/// counted in the session stats; skips and not-found are neutral.
pub fn report(account: &str, action: &str, outcome: &DispatchOutcome, stats: &SessionStats) {
    match outcome {
        DispatchOutcome::Opened { position, volume, protection } => {
            info!(%account, position, %volume, "OPENED");
            if let ProtectionStatus::Failed(e) = protection {
                warn!(%account, position, error = %e, "OPENED without protection");
            }
        }
        DispatchOutcome::Closed { position } => info!(%account, position, "CLOSED"),
        DispatchOutcome::ClosedAll { closed, failed } => {
            info!(%account, closed, failed, "CLOSED ALL")
        }
        DispatchOutcome::Modified { position } => info!(%account, position, "MODIFIED"),
        DispatchOutcome::Skipped(reason) => info!(%account, %action, %reason, "SKIPPED"),
        DispatchOutcome::PositionNotFound { ticket } => {
            warn!(%account, %action, ticket = ?ticket, "POSITION NOT FOUND")
        }
        DispatchOutcome::Failed(e) => error!(%account, %action, error = %e, "FAILED"),
    }

    let action = if action.is_empty() { "unknown" } else { action };
    TRADES.with_label_values(&[action, outcome.label()]).inc();
    match outcome.tally() {
        Tally::Success => {
            stats.trade_success.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        Tally::Failure => {
            stats.trade_fail.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        Tally::Neutral => {}
    }
}
