// ===============================
// src/dispatch.rs (relayed action -> execution engine calls)
// ===============================
//
// Every path ends in a DispatchOutcome; nothing here returns an error to the
// caller, so a bad event or a broker rejection can never stop the poll loop.
//
// Position resolution for close/modify:
//   1) exact id == relayed ticket
//   2) fallback: our tag + symbol, Buy first then Sell (best effort; with several
//      same-symbol positions it may pick the wrong one)
//
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::domain::{OrderSide, Protection, TradeAction, TradeEvent};
use crate::error::{DispatchError, EngineError};
use crate::gateway::{ExecutionEngine, OpenRequest, Position, PositionId};

#[derive(Debug, Clone)]
pub struct DispatchCfg {
    /// Overrides every relayed volume when set.
    pub fixed_volume: Option<Decimal>,
    /// Label put on positions we open; used by the fallback lookup.
    pub tag: String,
}

impl Default for DispatchCfg {
    fn default() -> Self {
        Self { fixed_volume: None, tag: "TradeRelay".to_string() }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProtectionStatus {
    NotRequested,
    Applied,
    /// Position stays open without (full) protection.
    Failed(EngineError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Opened { position: PositionId, volume: Decimal, protection: ProtectionStatus },
    Closed { position: PositionId },
    ClosedAll { closed: usize, failed: usize },
    Modified { position: PositionId },
    Skipped(&'static str),
    PositionNotFound { ticket: Option<u64> },
    Failed(DispatchError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tally { Success, Failure, Neutral }

impl DispatchOutcome {
    pub fn tally(&self) -> Tally {
        match self {
            DispatchOutcome::Opened { .. }
            | DispatchOutcome::Closed { .. }
            | DispatchOutcome::Modified { .. } => Tally::Success,
            DispatchOutcome::ClosedAll { closed, .. } if *closed > 0 => Tally::Success,
            DispatchOutcome::ClosedAll { failed, .. } if *failed > 0 => Tally::Failure,
            DispatchOutcome::Failed(_) => Tally::Failure,
            _ => Tally::Neutral,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::Opened { .. } => "opened",
            DispatchOutcome::Closed { .. } => "closed",
            DispatchOutcome::ClosedAll { .. } => "closed_all",
            DispatchOutcome::Modified { .. } => "modified",
            DispatchOutcome::Skipped(_) => "skipped",
            DispatchOutcome::PositionNotFound { .. } => "not_found",
            DispatchOutcome::Failed(_) => "failed",
        }
    }
}

pub struct Dispatcher<E: ExecutionEngine> {
    engine: E,
    cfg: DispatchCfg,
}

impl<E: ExecutionEngine> Dispatcher<E> {
    pub fn new(engine: E, cfg: DispatchCfg) -> Self {
        Self { engine, cfg }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    #[cfg(test)]
    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn dispatch(&mut self, ev: &TradeEvent) -> DispatchOutcome {
        match &ev.action {
            TradeAction::Open { side, symbol, volume, price, protection } => {
                self.open(*side, symbol, *volume, *price, *protection, ev.comment.clone())
            }
            TradeAction::Close { symbol, ticket, .. } => self.close(*ticket, symbol.as_deref()),
            TradeAction::Modify { symbol, ticket, protection } => {
                self.modify(*ticket, symbol.as_deref(), *protection)
            }
        }
    }

    fn open(
        &mut self,
        side: OrderSide,
        symbol: &str,
        volume: Decimal,
        price: Decimal,
        protection: Protection,
        comment: Option<String>,
    ) -> DispatchOutcome {
        let Some(info) = self.engine.resolve_symbol(symbol) else {
            warn!(%symbol, "unknown symbol");
            return DispatchOutcome::Failed(DispatchError::UnknownSymbol(symbol.to_string()));
        };

        let volume_to_use = match self.cfg.fixed_volume {
            Some(fixed) => {
                info!(original = %volume, fixed = %fixed, "fixed volume overrides relayed volume");
                fixed
            }
            None => volume,
        };
        if volume_to_use <= Decimal::ZERO {
            return DispatchOutcome::Failed(DispatchError::InvalidVolume(volume_to_use.to_string()));
        }

        // Levels are set after the fill: pre-fill levels are often rejected or imprecise.
        let req = OpenRequest {
            symbol: info.name,
            side,
            volume: volume_to_use,
            price_hint: price,
            label: self.cfg.tag.clone(),
            comment,
        };
        let position = match self.engine.open_position(req) {
            Ok(p) => p,
            Err(e) => return DispatchOutcome::Failed(e.into()),
        };
        info!(id = position.id, symbol = %position.symbol, side = side.as_str(), volume = %volume_to_use, "opened");

        let protection_status = if protection.is_empty() {
            ProtectionStatus::NotRequested
        } else {
            match self.engine.modify_position(position.id, protection.stop_loss, protection.take_profit) {
                Ok(()) => ProtectionStatus::Applied,
                Err(e) => {
                    warn!(
                        id = position.id,
                        error = %e,
                        sl = ?protection.stop_loss,
                        tp = ?protection.take_profit,
                        "failed to set stop-loss/take-profit, position left open; check it manually"
                    );
                    ProtectionStatus::Failed(e)
                }
            }
        };
        DispatchOutcome::Opened { position: position.id, volume: volume_to_use, protection: protection_status }
    }

    fn close(&mut self, ticket: Option<u64>, symbol: Option<&str>) -> DispatchOutcome {
        let Some(ticket) = ticket else {
            warn!("close without ticket, closing every open position");
            return self.close_all();
        };
        let Some(position) = self.resolve(Some(ticket), symbol) else {
            warn!(ticket, symbol = symbol.unwrap_or("-"), "no position found to close");
            return DispatchOutcome::PositionNotFound { ticket: Some(ticket) };
        };
        match self.engine.close_position(position.id) {
            Ok(()) => DispatchOutcome::Closed { position: position.id },
            Err(e) => DispatchOutcome::Failed(e.into()),
        }
    }

    fn close_all(&mut self) -> DispatchOutcome {
        let mut closed = 0;
        let mut failed = 0;
        for p in self.engine.list_positions() {
            match self.engine.close_position(p.id) {
                Ok(()) => closed += 1,
                Err(e) => {
                    warn!(id = p.id, error = %e, "close failed");
                    failed += 1;
                }
            }
        }
        DispatchOutcome::ClosedAll { closed, failed }
    }

    fn modify(&mut self, ticket: Option<u64>, symbol: Option<&str>, protection: Protection) -> DispatchOutcome {
        let Some(position) = self.resolve(ticket, symbol) else {
            warn!(ticket = ?ticket, symbol = symbol.unwrap_or("-"), "no position found to modify");
            return DispatchOutcome::PositionNotFound { ticket };
        };
        if protection.is_empty() {
            warn!(id = position.id, "modify without a positive stop-loss or take-profit, skipped");
            return DispatchOutcome::Skipped("no positive stop-loss or take-profit");
        }
        match self.engine.modify_position(position.id, protection.stop_loss, protection.take_profit) {
            Ok(()) => DispatchOutcome::Modified { position: position.id },
            Err(e) => DispatchOutcome::Failed(e.into()),
        }
    }

    fn resolve(&self, ticket: Option<u64>, symbol: Option<&str>) -> Option<Position> {
        if let Some(t) = ticket {
            if let Some(p) = self.engine.list_positions().into_iter().find(|p| p.id == t) {
                return Some(p);
            }
        }
        let symbol = symbol?;
        self.engine
            .find_position_by_tag(&self.cfg.tag, symbol, OrderSide::Buy)
            .or_else(|| self.engine.find_position_by_tag(&self.cfg.tag, symbol, OrderSide::Sell))
    }
}
