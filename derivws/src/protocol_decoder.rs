// derivws/src/protocol_decoder.rs
// Typed views of inbound frames and the ordered classification chain.

use crate::base::DerivError;
use serde::de::{DeserializeOwned, Deserializer, Error as DeError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// --- Inbound payloads ---

/// A single price tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
  pub symbol: String,
  #[serde(deserialize_with = "de_f64")]
  pub quote: f64,
  #[serde(default, deserialize_with = "de_opt_f64")]
  pub bid: Option<f64>,
  #[serde(default, deserialize_with = "de_opt_f64")]
  pub ask: Option<f64>,
  #[serde(default, deserialize_with = "de_i64")]
  pub epoch: i64,
  #[serde(default, deserialize_with = "de_opt_f64")]
  pub pip_size: Option<f64>,
}

/// A live candle update from an OHLC stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ohlc {
  pub symbol: String,
  #[serde(deserialize_with = "de_u32")]
  pub granularity: u32,
  #[serde(deserialize_with = "de_f64")]
  pub open: f64,
  #[serde(deserialize_with = "de_f64")]
  pub high: f64,
  #[serde(deserialize_with = "de_f64")]
  pub low: f64,
  #[serde(deserialize_with = "de_f64")]
  pub close: f64,
  #[serde(default, deserialize_with = "de_i64")]
  pub epoch: i64,
  #[serde(default, deserialize_with = "de_i64")]
  pub open_time: i64,
}

/// One historical candle from a `ticks_history` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
  #[serde(deserialize_with = "de_i64")]
  pub epoch: i64,
  #[serde(deserialize_with = "de_f64")]
  pub open: f64,
  #[serde(deserialize_with = "de_f64")]
  pub high: f64,
  #[serde(deserialize_with = "de_f64")]
  pub low: f64,
  #[serde(deserialize_with = "de_f64")]
  pub close: f64,
}

/// Body of an `authorize` acknowledgment.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AuthorizePayload {
  pub loginid: String,
  #[serde(default)]
  pub currency: String,
  #[serde(default, deserialize_with = "de_f64")]
  pub balance: f64,
}

/// Body of a `balance` push.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BalanceUpdate {
  #[serde(deserialize_with = "de_f64")]
  pub balance: f64,
  #[serde(default)]
  pub currency: Option<String>,
  #[serde(default)]
  pub loginid: Option<String>,
}

/// A contract as listed in a `portfolio` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioEntry {
  #[serde(deserialize_with = "de_u64")]
  pub contract_id: u64,
  #[serde(default, deserialize_with = "de_f64")]
  pub buy_price: f64,
  #[serde(default)]
  pub symbol: String,
  #[serde(default)]
  pub contract_type: String,
  #[serde(default, deserialize_with = "de_opt_f64")]
  pub payout: Option<f64>,
  #[serde(default, deserialize_with = "de_opt_i64")]
  pub purchase_time: Option<i64>,
  #[serde(default, deserialize_with = "de_opt_i64")]
  pub expiry_time: Option<i64>,
  #[serde(default)]
  pub longcode: Option<String>,
}

/// Live status of a single contract from a `proposal_open_contract` push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenContract {
  #[serde(deserialize_with = "de_u64")]
  pub contract_id: u64,
  #[serde(default, deserialize_with = "de_opt_f64")]
  pub profit: Option<f64>,
  #[serde(default, deserialize_with = "de_opt_f64")]
  pub buy_price: Option<f64>,
  #[serde(default, deserialize_with = "de_opt_f64")]
  pub bid_price: Option<f64>,
  #[serde(default, deserialize_with = "de_opt_f64")]
  pub current_spot: Option<f64>,
  #[serde(default, deserialize_with = "de_flag")]
  pub is_sold: bool,
  #[serde(default, deserialize_with = "de_flag")]
  pub is_expired: bool,
  #[serde(default)]
  pub status: Option<String>,
  #[serde(default)]
  pub underlying: Option<String>,
  #[serde(default)]
  pub contract_type: Option<String>,
}

/// Price quote returned by a `proposal` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalQuote {
  pub id: String,
  #[serde(deserialize_with = "de_f64")]
  pub ask_price: f64,
  #[serde(deserialize_with = "de_f64")]
  pub payout: f64,
  #[serde(default, deserialize_with = "de_opt_f64")]
  pub spot: Option<f64>,
  #[serde(default)]
  pub longcode: Option<String>,
}

/// Confirmation of a `buy` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuyReceipt {
  #[serde(deserialize_with = "de_u64")]
  pub contract_id: u64,
  #[serde(deserialize_with = "de_f64")]
  pub buy_price: f64,
  #[serde(default, deserialize_with = "de_opt_f64")]
  pub balance_after: Option<f64>,
  #[serde(default, deserialize_with = "de_opt_u64")]
  pub transaction_id: Option<u64>,
  #[serde(default)]
  pub longcode: Option<String>,
}

/// Body of an `error` payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ApiErrorPayload {
  #[serde(default)]
  pub code: String,
  #[serde(default)]
  pub message: String,
}

impl From<ApiErrorPayload> for DerivError {
  fn from(e: ApiErrorPayload) -> Self {
    DerivError::ServerError { code: e.code, message: e.message }
  }
}

// --- Classification ---

/// Payload category of an inbound frame, in routing precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
  Authorize,
  Balance,
  Portfolio,
  OpenContract,
  Error,
  Tick,
  Ohlc,
  /// `ticks_history` candles, the first reply to an OHLC subscription.
  Candles,
  Pong,
  Unknown,
}

fn has_object(frame: &Value, field: &str) -> bool {
  frame.get(field).map_or(false, Value::is_object)
}

fn is_authorize(frame: &Value) -> bool { has_object(frame, "authorize") }
fn is_balance(frame: &Value) -> bool { has_object(frame, "balance") }
fn is_portfolio(frame: &Value) -> bool { has_object(frame, "portfolio") }
fn is_open_contract(frame: &Value) -> bool { has_object(frame, "proposal_open_contract") }
fn is_error(frame: &Value) -> bool { has_object(frame, "error") }
fn is_tick(frame: &Value) -> bool { has_object(frame, "tick") }
fn is_ohlc(frame: &Value) -> bool { has_object(frame, "ohlc") }
fn is_candles(frame: &Value) -> bool { frame.get("candles").map_or(false, Value::is_array) }
// The keepalive reply is `{"msg_type": "ping", "ping": "pong"}`.
fn is_pong(frame: &Value) -> bool { frame.get("ping").and_then(Value::as_str) == Some("pong") }

/// Ordered predicate chain; the first matching entry decides the kind.
const CLASSIFIERS: &[(InboundKind, fn(&Value) -> bool)] = &[
  (InboundKind::Authorize, is_authorize),
  (InboundKind::Balance, is_balance),
  (InboundKind::Portfolio, is_portfolio),
  (InboundKind::OpenContract, is_open_contract),
  (InboundKind::Error, is_error),
  (InboundKind::Tick, is_tick),
  (InboundKind::Ohlc, is_ohlc),
  (InboundKind::Candles, is_candles),
  (InboundKind::Pong, is_pong),
];

/// Classifies a frame by the presence of known top-level payload fields.
pub fn classify(frame: &Value) -> InboundKind {
  CLASSIFIERS
    .iter()
    .find(|(_, matches)| matches(frame))
    .map(|(kind, _)| *kind)
    .unwrap_or(InboundKind::Unknown)
}

// --- Field accessors ---

/// Client request id echoed by the server, if any.
pub fn req_id(frame: &Value) -> Option<u64> {
  frame.get("req_id").and_then(Value::as_u64)
}

/// Server subscription id carried by a push, if any.
pub fn subscription_id(frame: &Value) -> Option<String> {
  frame
    .get("subscription")
    .and_then(|s| s.get("id"))
    .and_then(Value::as_str)
    .map(str::to_string)
}

pub fn echo_req(frame: &Value) -> Option<&Value> {
  frame.get("echo_req")
}

pub fn msg_type(frame: &Value) -> Option<&str> {
  frame.get("msg_type").and_then(Value::as_str)
}

/// The `error` payload of a frame, if it carries one.
pub fn error_payload(frame: &Value) -> Option<ApiErrorPayload> {
  frame.get("error").and_then(|e| ApiErrorPayload::deserialize(e).ok())
}

/// Deserializes the payload under `field`.
pub fn payload<T: DeserializeOwned>(frame: &Value, field: &str) -> Result<T, DerivError> {
  let value = frame
    .get(field)
    .ok_or_else(|| DerivError::ProtocolMismatch(format!("missing '{}' payload", field)))?;
  T::deserialize(value).map_err(|e| DerivError::ProtocolMismatch(format!("bad '{}' payload: {}", field, e)))
}

/// Contracts listed in a `portfolio` payload.
pub fn portfolio_entries(frame: &Value) -> Result<Vec<PortfolioEntry>, DerivError> {
  let contracts = frame
    .get("portfolio")
    .and_then(|p| p.get("contracts"))
    .ok_or_else(|| DerivError::ProtocolMismatch("portfolio without contracts".to_string()))?;
  Vec::<PortfolioEntry>::deserialize(contracts)
    .map_err(|e| DerivError::ProtocolMismatch(format!("bad portfolio contracts: {}", e)))
}

/// Candles in a `ticks_history` response, oldest first.
pub fn candles(frame: &Value) -> Result<Vec<Candle>, DerivError> {
  payload(frame, "candles")
}

// --- Lenient numeric deserializers (the server sends some numbers as strings) ---

fn value_to_f64(v: &Value) -> Option<f64> {
  match v {
    Value::Number(n) => n.as_f64(),
    Value::String(s) => s.trim().parse().ok(),
    _ => None,
  }
}

fn value_to_i64(v: &Value) -> Option<i64> {
  match v {
    Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
    Value::String(s) => s.trim().parse().ok(),
    _ => None,
  }
}

fn de_f64<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
  let v = Value::deserialize(d)?;
  value_to_f64(&v).ok_or_else(|| D::Error::custom(format!("expected number, got {}", v)))
}

fn de_opt_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
  let v = Value::deserialize(d)?;
  match v {
    Value::Null => Ok(None),
    Value::String(ref s) if s.is_empty() => Ok(None),
    other => value_to_f64(&other)
      .map(Some)
      .ok_or_else(|| D::Error::custom(format!("expected number, got {}", other))),
  }
}

fn de_i64<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
  let v = Value::deserialize(d)?;
  value_to_i64(&v).ok_or_else(|| D::Error::custom(format!("expected integer, got {}", v)))
}

fn de_opt_i64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
  let v = Value::deserialize(d)?;
  match v {
    Value::Null => Ok(None),
    other => value_to_i64(&other)
      .map(Some)
      .ok_or_else(|| D::Error::custom(format!("expected integer, got {}", other))),
  }
}

fn de_u64<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
  let n = de_i64(d)?;
  u64::try_from(n).map_err(|_| D::Error::custom(format!("expected unsigned integer, got {}", n)))
}

fn de_opt_u64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
  match de_opt_i64(d)? {
    None => Ok(None),
    Some(n) => u64::try_from(n)
      .map(Some)
      .map_err(|_| D::Error::custom(format!("expected unsigned integer, got {}", n))),
  }
}

fn de_u32<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
  let n = de_i64(d)?;
  u32::try_from(n).map_err(|_| D::Error::custom(format!("expected granularity, got {}", n)))
}

// 0/1 integers and booleans both appear for flags.
fn de_flag<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
  match Value::deserialize(d)? {
    Value::Bool(b) => Ok(b),
    Value::Number(n) => Ok(n.as_f64().map_or(false, |f| f != 0.0)),
    Value::String(s) => Ok(s == "1" || s.eq_ignore_ascii_case("true")),
    _ => Ok(false),
  }
}
