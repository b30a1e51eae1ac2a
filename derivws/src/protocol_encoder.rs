// derivws/src/protocol_encoder.rs
// Builders for outbound request frames.

use crate::base::DerivError;
use serde_json::{json, Map, Value};

/// Operation field of outbound requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
  Ticks,
  TicksHistory,
  Balance,
  Portfolio,
  ProposalOpenContract,
  Authorize,
  Buy,
  Proposal,
  Forget,
  Ping,
}

impl Operation {
  pub const ALL: [Operation; 10] = [
    Operation::Ticks,
    Operation::TicksHistory,
    Operation::Balance,
    Operation::Portfolio,
    Operation::ProposalOpenContract,
    Operation::Authorize,
    Operation::Buy,
    Operation::Proposal,
    Operation::Forget,
    Operation::Ping,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Operation::Ticks => "ticks",
      Operation::TicksHistory => "ticks_history",
      Operation::Balance => "balance",
      Operation::Portfolio => "portfolio",
      Operation::ProposalOpenContract => "proposal_open_contract",
      Operation::Authorize => "authorize",
      Operation::Buy => "buy",
      Operation::Proposal => "proposal",
      Operation::Forget => "forget",
      Operation::Ping => "ping",
    }
  }

  /// Finds the operation a request frame (or an `echo_req`) carries.
  pub fn identify(frame: &Value) -> Option<Operation> {
    let obj = frame.as_object()?;
    Operation::ALL.iter().copied().find(|op| obj.contains_key(op.as_str()))
  }
}

/// Parameters of a `proposal` (price quote) request.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposalRequest {
  pub symbol: String,
  /// e.g. `CALL`, `PUT`, `DIGITEVEN`.
  pub contract_type: String,
  pub amount: f64,
  /// `stake` or `payout`.
  pub basis: String,
  pub currency: String,
  pub duration: u32,
  /// `t` ticks, `s` seconds, `m` minutes, `h` hours, `d` days.
  pub duration_unit: String,
  pub barrier: Option<String>,
}

impl ProposalRequest {
  pub fn new(symbol: &str, contract_type: &str, amount: f64, currency: &str, duration: u32, duration_unit: &str) -> Self {
    Self {
      symbol: symbol.to_string(),
      contract_type: contract_type.to_string(),
      amount,
      basis: "stake".to_string(),
      currency: currency.to_string(),
      duration,
      duration_unit: duration_unit.to_string(),
      barrier: None,
    }
  }
}

pub fn authorize(token: &str) -> Value {
  json!({ "authorize": token })
}

pub fn subscribe_ticks(symbol: &str) -> Value {
  json!({ "ticks": symbol, "subscribe": 1 })
}

/// Live OHLC stream: a `ticks_history` candles request with `subscribe`.
pub fn subscribe_ohlc(symbol: &str, granularity: u32) -> Value {
  json!({
    "ticks_history": symbol,
    "style": "candles",
    "granularity": granularity,
    "count": 1,
    "end": "latest",
    "adjust_start_time": 1,
    "subscribe": 1,
  })
}

pub fn subscribe_balance() -> Value {
  json!({ "balance": 1, "subscribe": 1 })
}

pub fn portfolio() -> Value {
  json!({ "portfolio": 1 })
}

pub fn subscribe_contract(contract_id: u64) -> Value {
  json!({ "proposal_open_contract": 1, "contract_id": contract_id, "subscribe": 1 })
}

/// One-shot historical candles, newest last.
pub fn candles(symbol: &str, granularity: u32, count: u32) -> Result<Value, DerivError> {
  if symbol.is_empty() {
    return Err(DerivError::InvalidParameter("symbol must not be empty".to_string()));
  }
  if count == 0 {
    return Err(DerivError::InvalidParameter("candle count must be positive".to_string()));
  }
  Ok(json!({
    "ticks_history": symbol,
    "style": "candles",
    "granularity": granularity,
    "count": count,
    "end": "latest",
    "adjust_start_time": 1,
  }))
}

pub fn proposal(req: &ProposalRequest) -> Result<Value, DerivError> {
  if !(req.amount > 0.0) {
    return Err(DerivError::InvalidParameter(format!("amount must be positive, got {}", req.amount)));
  }
  let mut frame = json!({
    "proposal": 1,
    "amount": req.amount,
    "basis": req.basis,
    "contract_type": req.contract_type,
    "currency": req.currency,
    "duration": req.duration,
    "duration_unit": req.duration_unit,
    "symbol": req.symbol,
  });
  if let Some(barrier) = &req.barrier {
    frame["barrier"] = Value::String(barrier.clone());
  }
  Ok(frame)
}

pub fn buy(proposal_id: &str, max_price: f64) -> Value {
  json!({ "buy": proposal_id, "price": max_price })
}

/// Cancels a stream by its server-assigned subscription id.
pub fn forget(subscription_id: &str) -> Value {
  json!({ "forget": subscription_id })
}

pub fn ping() -> Value {
  json!({ "ping": 1 })
}

/// Merges the client request id into a frame. Non-object frames are rejected.
pub fn with_req_id(mut frame: Value, req_id: u64) -> Result<Value, DerivError> {
  let obj: &mut Map<String, Value> = frame
    .as_object_mut()
    .ok_or_else(|| DerivError::InvalidParameter("request frame must be a JSON object".to_string()))?;
  obj.insert("req_id".to_string(), Value::from(req_id));
  Ok(frame)
}
