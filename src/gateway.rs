// ===============================
// src/gateway.rs (execution engine seam + paper engine)
// ===============================
use ahash::AHashSet as HashSet;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use crate::domain::{OrderSide, PositionCounts};
use crate::error::EngineError;

pub type PositionId = u64;

#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub id: PositionId,
    pub symbol: String,
    pub side: OrderSide,
    pub volume: Decimal,
    pub entry_price: Decimal,
    pub label: String,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub comment: Option<String>,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolInfo {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenRequest {
    pub symbol: String,
    pub side: OrderSide,
    /// Lots, as relayed. Broker unit conversion is the engine's business.
    pub volume: Decimal,
    pub price_hint: Decimal,
    pub label: String,
    pub comment: Option<String>,
}

/// Following-platform trading API. Implementations are driven from a single
/// task (the dispatch loop) and are never called concurrently.
pub trait ExecutionEngine: Send {
    fn account_id(&self) -> String;

    fn resolve_symbol(&self, name: &str) -> Option<SymbolInfo>;

    /// Market order without protective levels.
    fn open_position(&mut self, req: OpenRequest) -> Result<Position, EngineError>;

    fn close_position(&mut self, id: PositionId) -> Result<(), EngineError>;

    /// `None` leaves that level untouched.
    fn modify_position(
        &mut self,
        id: PositionId,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<(), EngineError>;

    fn list_positions(&self) -> Vec<Position>;

    fn find_position_by_tag(&self, tag: &str, symbol: &str, side: OrderSide) -> Option<Position> {
        self.list_positions()
            .into_iter()
            .find(|p| p.label == tag && p.symbol.eq_ignore_ascii_case(symbol) && p.side == side)
    }
}

pub fn position_counts(positions: &[Position]) -> PositionCounts {
    let buy = positions.iter().filter(|p| p.side == OrderSide::Buy).count() as u32;
    let sell = positions.iter().filter(|p| p.side == OrderSide::Sell).count() as u32;
    PositionCounts { total: buy + sell, buy, sell }
}

/// In-memory engine: orders fill instantly at the relayed price.
#[derive(Debug)]
pub struct PaperEngine {
    account: String,
    symbols: HashSet<String>,
    positions: Vec<Position>,
    next_id: PositionId,
    failing: HashSet<&'static str>,
}

impl PaperEngine {
    pub fn new(account: impl Into<String>, symbols: &[String]) -> Self {
        Self {
            account: account.into(),
            symbols: symbols.iter().map(|s| s.to_ascii_uppercase()).collect(),
            positions: Vec::new(),
            next_id: 1,
            failing: HashSet::new(),
        }
    }

    #[cfg(test)]
    /// Make every call of `operation` ("open", "close", "modify") fail.
    pub fn fail_on(&mut self, operation: &'static str) {
        self.failing.insert(operation);
    }

    #[cfg(test)]
    pub fn recover(&mut self, operation: &'static str) {
        self.failing.remove(operation);
    }

    fn guard(&self, operation: &'static str) -> Result<(), EngineError> {
        if self.failing.contains(operation) {
            Err(EngineError::new(operation, "rejected by paper engine"))
        } else {
            Ok(())
        }
    }
}

impl ExecutionEngine for PaperEngine {
    fn account_id(&self) -> String {
        self.account.clone()
    }

    fn resolve_symbol(&self, name: &str) -> Option<SymbolInfo> {
        let upper = name.trim().to_ascii_uppercase();
        self.symbols.contains(&upper).then_some(SymbolInfo { name: upper })
    }

    fn open_position(&mut self, req: OpenRequest) -> Result<Position, EngineError> {
        self.guard("open")?;
        if req.volume <= Decimal::ZERO {
            return Err(EngineError::new("open", format!("volume {} not tradable", req.volume)));
        }
        let pos = Position {
            id: self.next_id,
            symbol: req.symbol,
            side: req.side,
            volume: req.volume,
            entry_price: req.price_hint,
            label: req.label,
            stop_loss: None,
            take_profit: None,
            comment: req.comment,
            opened_at: Utc::now(),
        };
        self.next_id += 1;
        self.positions.push(pos.clone());
        debug!(id = pos.id, symbol = %pos.symbol, side = pos.side.as_str(), "paper open");
        Ok(pos)
    }

    fn close_position(&mut self, id: PositionId) -> Result<(), EngineError> {
        self.guard("close")?;
        let idx = self
            .positions
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| EngineError::new("close", format!("position {id} not open")))?;
        self.positions.remove(idx);
        Ok(())
    }

    fn modify_position(
        &mut self,
        id: PositionId,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<(), EngineError> {
        self.guard("modify")?;
        let pos = self
            .positions
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| EngineError::new("modify", format!("position {id} not open")))?;
        if let Some(sl) = stop_loss {
            pos.stop_loss = Some(sl);
        }
        if let Some(tp) = take_profit {
            pos.take_profit = Some(tp);
        }
        Ok(())
    }

    fn list_positions(&self) -> Vec<Position> {
        self.positions.clone()
    }
}
