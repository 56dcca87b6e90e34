// ===============================
// src/domain.rs
// ===============================
//
// Trade events as relayed between the originating and following platforms.
//
// - WireEvent  : lenient JSON record exactly as the platforms exchange it
//                (every field optional, numbers or strings for ids).
// - TradeEvent : validated event; action-specific fields enforced at
//                construction via TradeAction.
//
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::RelayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide { Buy, Sell }

impl OrderSide {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" => Some(OrderSide::Buy),
            "sell" => Some(OrderSide::Sell),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self { OrderSide::Buy => "buy", OrderSide::Sell => "sell" }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind { Open, Close, Modify }

impl ActionKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Some(ActionKind::Open),
            "close" => Some(ActionKind::Close),
            "modify" => Some(ActionKind::Modify),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Open => "open",
            ActionKind::Close => "close",
            ActionKind::Modify => "modify",
        }
    }
}

/// Stop-loss / take-profit levels. A level is only meaningful when > 0,
/// non-positive inputs are dropped at construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Protection {
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

impl Protection {
    pub fn new(stop_loss: Option<Decimal>, take_profit: Option<Decimal>) -> Self {
        Self {
            stop_loss: stop_loss.filter(|v| *v > Decimal::ZERO),
            take_profit: take_profit.filter(|v| *v > Decimal::ZERO),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stop_loss.is_none() && self.take_profit.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TradeAction {
    Open {
        side: OrderSide,
        symbol: String,
        volume: Decimal,
        price: Decimal,
        protection: Protection,
    },
    Close {
        symbol: Option<String>,
        ticket: Option<u64>,
        volume: Decimal,
        price: Decimal,
    },
    Modify {
        symbol: Option<String>,
        ticket: Option<u64>,
        protection: Protection,
    },
}

impl TradeAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            TradeAction::Open { .. } => ActionKind::Open,
            TradeAction::Close { .. } => ActionKind::Close,
            TradeAction::Modify { .. } => ActionKind::Modify,
        }
    }

    pub fn symbol(&self) -> Option<&str> {
        match self {
            TradeAction::Open { symbol, .. } => Some(symbol.as_str()),
            TradeAction::Close { symbol, .. } | TradeAction::Modify { symbol, .. } => symbol.as_deref(),
        }
    }

    pub fn protection(&self) -> Protection {
        match self {
            TradeAction::Open { protection, .. } | TradeAction::Modify { protection, .. } => *protection,
            TradeAction::Close { .. } => Protection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradeEvent {
    pub account_id: String,
    pub action: TradeAction,
    pub comment: Option<String>,
    /// Raw originating-platform local time, kept verbatim.
    pub origin_timestamp: Option<String>,
    pub origin_time_utc: Option<DateTime<Utc>>,
    pub received_at: Option<DateTime<Utc>>,
    pub queue_time: Option<DateTime<Utc>>,
    /// Ticket as submitted, kept for Open events too (dedup key uses it).
    pub source_ticket: Option<u64>,
}

impl TradeEvent {
    /// Validate a wire record. Optional fields default rather than fail;
    /// account id, action and (for open) side + symbol are mandatory.
    pub fn from_wire(w: WireEvent) -> Result<Self, RelayError> {
        let account_id = w
            .account_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(RelayError::MissingAccountId)?
            .to_string();

        let raw_action = w
            .action
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| RelayError::InvalidEvent("missing action".into()))?;
        let kind = ActionKind::parse(raw_action)
            .ok_or_else(|| RelayError::InvalidEvent(format!("unknown action '{raw_action}'")))?;

        let ticket = w.ticket.filter(|t| *t > 0).map(|t| t as u64);
        let symbol = w
            .symbol
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let volume = w.volume.unwrap_or_default();
        let price = w.price.unwrap_or_default();
        let protection = Protection::new(w.sl, w.tp);

        let action = match kind {
            ActionKind::Open => {
                let raw_side = w
                    .order_type
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| RelayError::InvalidEvent("open requires orderType".into()))?;
                let side = OrderSide::parse(raw_side)
                    .ok_or_else(|| RelayError::UnknownOrderType(raw_side.to_string()))?;
                let symbol = symbol
                    .ok_or_else(|| RelayError::InvalidEvent("open requires symbol".into()))?;
                TradeAction::Open { side, symbol, volume, price, protection }
            }
            ActionKind::Close => TradeAction::Close { symbol, ticket, volume, price },
            ActionKind::Modify => TradeAction::Modify { symbol, ticket, protection },
        };

        Ok(TradeEvent {
            account_id,
            action,
            comment: w.comment.filter(|c| !c.is_empty()),
            origin_timestamp: w.timestamp.filter(|t| !t.trim().is_empty()),
            origin_time_utc: w.origin_time_utc,
            received_at: w.received_at,
            queue_time: w.queue_time,
            source_ticket: ticket,
        })
    }

    pub fn to_wire(&self) -> WireEvent {
        let (order_type, volume, price) = match &self.action {
            TradeAction::Open { side, volume, price, .. } => {
                (Some(side.as_str().to_string()), Some(*volume), Some(*price))
            }
            TradeAction::Close { volume, price, .. } => (None, Some(*volume), Some(*price)),
            TradeAction::Modify { .. } => (None, None, None),
        };
        let protection = self.action.protection();
        WireEvent {
            account_id: Some(self.account_id.clone()),
            action: Some(self.action.kind().as_str().to_string()),
            order_type,
            symbol: self.action.symbol().map(str::to_string),
            volume,
            price,
            sl: protection.stop_loss,
            tp: protection.take_profit,
            ticket: self.source_ticket.map(|t| t as i64),
            comment: self.comment.clone(),
            timestamp: self.origin_timestamp.clone(),
            origin_time_utc: self.origin_time_utc,
            received_at: self.received_at,
            queue_time: self.queue_time,
        }
    }
}

/// Trade record as exchanged over HTTP (`accountId`, `orderType`, `sl`, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEvent {
    #[serde(default, deserialize_with = "lenient_id")]
    pub account_id: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub order_type: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub volume: Option<Decimal>,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub sl: Option<Decimal>,
    #[serde(default)]
    pub tp: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_ticket")]
    pub ticket: Option<i64>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_time_utc: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_time: Option<DateTime<Utc>>,
}

// Account ids arrive as JSON numbers from some terminals, strings from others.
pub(crate) fn lenient_id<'de, D>(d: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    match Option::<serde_json::Value>::deserialize(d)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(D::Error::custom(format!("invalid account id: {other}"))),
    }
}

fn lenient_ticket<'de, D>(d: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    match Option::<serde_json::Value>::deserialize(d)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("invalid ticket: {n}"))),
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(serde_json::Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("invalid ticket: {s}"))),
        Some(other) => Err(D::Error::custom(format!("invalid ticket: {other}"))),
    }
}

/// Which side of the bridge a position report describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide { Originating, Following }

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionCounts {
    pub total: u32,
    pub buy: u32,
    pub sell: u32,
}

impl PositionCounts {
    pub fn new(total: u32, buy: u32, sell: u32) -> Self { Self { total, buy, sell } }
}
