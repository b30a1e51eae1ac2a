// derivws/src/message_parser.rs
//
// Classify inbound frames and dispatch them to the appropriate component.
use crate::account::AccountInfo;
use crate::base::DerivError;
use crate::handler::MessageHandler;
use crate::observer::StreamUpdate;
use crate::protocol_decoder::{self, AuthorizePayload, BalanceUpdate, InboundKind, Ohlc, OpenContract, Tick};
use crate::protocol_encoder::{self, Operation};
use crate::subscription::{PushDisposition, SubscriptionKey};
use log::{debug, trace, warn};
use serde_json::Value;

/// Outcome of routing one frame. The connection manager acts on the authorize outcomes.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
  /// Completed a pending request.
  Response,
  Authorized,
  AuthorizeFailed(DerivError),
  /// Updated the account cache and/or a stream listener.
  Push,
  /// A benign "already subscribed" error.
  Swallowed,
  /// Any other server error.
  Error(DerivError),
  Pong,
  Ignored,
}

/// Routes a frame. This is the single entry point for inbound traffic.
///
/// Raw message observers see the frame first. Then, first match wins:
/// 1. a response to a pending request (by `req_id`, or structurally when it has none)
/// 2. `authorize`
/// 3. `balance`
/// 4. `portfolio`
/// 5. `proposal_open_contract`
/// 6. `error`
/// 7. `tick` / `ohlc`, and the `candles` reply that opens an OHLC stream
///
/// Any server subscription id on a push in 3-7 is recorded before listeners run. A sold
/// contract's entry is dropped after its final snapshot is delivered.
pub fn process_message(handler: &MessageHandler, frame: &Value) -> Result<Routed, DerivError> {
  for observer in handler.messages.snapshot() {
    observer.on_message(frame);
  }

  if handler.requests.try_complete(frame) {
    return Ok(Routed::Response);
  }

  match protocol_decoder::classify(frame) {
    InboundKind::Authorize => process_authorize(handler, frame),
    InboundKind::Balance => process_balance(handler, frame),
    InboundKind::Portfolio => process_portfolio(handler, frame),
    InboundKind::OpenContract => process_open_contract(handler, frame),
    InboundKind::Error => Ok(process_error(handler, frame)),
    InboundKind::Tick => process_tick(handler, frame),
    InboundKind::Ohlc => process_ohlc(handler, frame),
    InboundKind::Candles => process_candles(handler, frame),
    InboundKind::Pong => {
      trace!("Pong received.");
      Ok(Routed::Pong)
    }
    InboundKind::Unknown => {
      debug!(
        "{}",
        DerivError::ProtocolMismatch(format!("unrouted msg_type {:?}", protocol_decoder::msg_type(frame)))
      );
      Ok(Routed::Ignored)
    }
  }
}

fn process_authorize(handler: &MessageHandler, frame: &Value) -> Result<Routed, DerivError> {
  let auth: AuthorizePayload = protocol_decoder::payload(frame, "authorize")?;
  handler.account.on_authorized(AccountInfo::new(&auth.loginid, &auth.currency, auth.balance));
  Ok(Routed::Authorized)
}

fn process_balance(handler: &MessageHandler, frame: &Value) -> Result<Routed, DerivError> {
  let update: BalanceUpdate = protocol_decoder::payload(frame, "balance")?;
  handler.account.on_balance(&update);
  fan_out(handler, SubscriptionKey::Balance, frame, StreamUpdate::Balance(update));
  Ok(Routed::Push)
}

fn process_portfolio(handler: &MessageHandler, frame: &Value) -> Result<Routed, DerivError> {
  let entries = protocol_decoder::portfolio_entries(frame)?;
  handler.account.on_portfolio(entries.clone());

  for entry in &entries {
    let key = SubscriptionKey::Contract(entry.contract_id);
    if handler.subscriptions.contains(&key) {
      continue;
    }
    if let Err(e) = handler.subscriptions.ensure(key, protocol_encoder::subscribe_contract(entry.contract_id)) {
      warn!("Could not subscribe to contract {}: {}", entry.contract_id, e);
    }
  }

  fan_out(handler, SubscriptionKey::Portfolio, frame, StreamUpdate::Portfolio(entries));
  Ok(Routed::Push)
}

fn process_open_contract(handler: &MessageHandler, frame: &Value) -> Result<Routed, DerivError> {
  let contract: OpenContract = protocol_decoder::payload(frame, "proposal_open_contract")?;
  handler.account.on_open_contract(contract.clone());
  let key = SubscriptionKey::Contract(contract.contract_id);
  let sold = contract.is_sold;
  fan_out(handler, key.clone(), frame, StreamUpdate::Contract(contract));
  // The server ends the stream on sale; nothing to forget or reissue.
  if sold && handler.subscriptions.retire(&key) {
    debug!("{}: sold, stream closed.", key);
  }
  Ok(Routed::Push)
}

fn process_error(handler: &MessageHandler, frame: &Value) -> Routed {
  let payload = protocol_decoder::error_payload(frame).unwrap_or(protocol_decoder::ApiErrorPayload {
    code: String::new(),
    message: "malformed error payload".to_string(),
  });
  let error = DerivError::from(payload);
  if error.is_already_subscribed() {
    debug!("Ignoring benign error: {}", error);
    return Routed::Swallowed;
  }

  let echo = protocol_decoder::echo_req(frame);

  // A subscribe the server refused never gets an id; drop it and tell its listener.
  if let Some(key) = echo.and_then(SubscriptionKey::from_echo) {
    if let Some(listener) = handler.subscriptions.reject_pending(&key) {
      warn!("Subscription {} rejected: {}", key, error);
      listener.on_error(&key, &error);
    }
  }

  if echo.and_then(Operation::identify) == Some(Operation::Authorize) {
    return Routed::AuthorizeFailed(error);
  }

  warn!("Server error ({:?}): {}", protocol_decoder::msg_type(frame), error);
  Routed::Error(error)
}

fn process_tick(handler: &MessageHandler, frame: &Value) -> Result<Routed, DerivError> {
  let tick: Tick = protocol_decoder::payload(frame, "tick")?;
  let key = SubscriptionKey::Tick(tick.symbol.clone());
  fan_out(handler, key, frame, StreamUpdate::Tick(tick));
  Ok(Routed::Push)
}

fn process_ohlc(handler: &MessageHandler, frame: &Value) -> Result<Routed, DerivError> {
  let ohlc: Ohlc = protocol_decoder::payload(frame, "ohlc")?;
  let key = SubscriptionKey::Ohlc(ohlc.symbol.clone(), ohlc.granularity);
  fan_out(handler, key, frame, StreamUpdate::Ohlc(ohlc));
  Ok(Routed::Push)
}

// The first reply to an OHLC subscribe is a `candles` history carrying the subscription id. Its
// latest candle seeds the stream.
fn process_candles(handler: &MessageHandler, frame: &Value) -> Result<Routed, DerivError> {
  let echo_key = protocol_decoder::echo_req(frame).and_then(SubscriptionKey::from_echo);
  let Some(SubscriptionKey::Ohlc(symbol, granularity)) = echo_key else {
    trace!("Unsolicited candles dropped.");
    return Ok(Routed::Ignored);
  };
  let candles = protocol_decoder::candles(frame)?;
  let key = SubscriptionKey::Ohlc(symbol.clone(), granularity);
  match candles.last() {
    Some(c) => {
      let ohlc = Ohlc {
        symbol,
        granularity,
        open: c.open,
        high: c.high,
        low: c.low,
        close: c.close,
        epoch: c.epoch,
        open_time: c.epoch,
      };
      fan_out(handler, key, frame, StreamUpdate::Ohlc(ohlc));
    }
    None => {
      handler.subscriptions.on_push(&key, protocol_decoder::subscription_id(frame));
    }
  }
  Ok(Routed::Push)
}

// Records the subscription id, then invokes the listener outside every lock.
fn fan_out(handler: &MessageHandler, key: SubscriptionKey, frame: &Value, update: StreamUpdate) {
  match handler.subscriptions.on_push(&key, protocol_decoder::subscription_id(frame)) {
    PushDisposition::Deliver(Some(listener)) => listener.on_update(&key, &update),
    PushDisposition::Deliver(None) => trace!("{}: no listener.", key),
    PushDisposition::Cancelled => debug!("{}: cancelled on confirmation.", key),
    PushDisposition::Dropped => trace!("{}: not subscribed, push dropped.", key),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::conn::MessageBroker;
  use crate::observer::StreamObserver;
  use parking_lot::Mutex;
  use serde_json::json;
  use std::sync::Arc;
  use tokio::sync::mpsc::{self, UnboundedReceiver};

  fn handler() -> (MessageHandler, UnboundedReceiver<String>) {
    let broker = Arc::new(MessageBroker::new());
    let (tx, rx) = mpsc::unbounded_channel();
    broker.attach(tx);
    (MessageHandler::new(broker), rx)
  }

  fn sent(rx: &mut UnboundedReceiver<String>) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Ok(text) = rx.try_recv() {
      frames.push(serde_json::from_str(&text).unwrap());
    }
    frames
  }

  #[derive(Default)]
  struct Collector {
    updates: Mutex<Vec<StreamUpdate>>,
    errors: Mutex<Vec<DerivError>>,
  }

  impl StreamObserver for Collector {
    fn on_update(&self, _key: &SubscriptionKey, update: &StreamUpdate) {
      self.updates.lock().push(update.clone());
    }
    fn on_error(&self, _key: &SubscriptionKey, error: &DerivError) {
      self.errors.lock().push(error.clone());
    }
  }

  fn subscribe(handler: &MessageHandler, key: SubscriptionKey) -> Arc<Collector> {
    let collector = Arc::new(Collector::default());
    handler.subscriptions.subscribe(key.clone(), key.request_frame(), Some(collector.clone())).unwrap();
    collector
  }

  #[test]
  fn test_tick_push_reaches_listener_and_confirms() {
    let (handler, _rx) = handler();
    let key = SubscriptionKey::Tick("R_10".to_string());
    let collector = subscribe(&handler, key.clone());

    let frame = json!({"msg_type": "tick", "tick": {"symbol": "R_10", "quote": 123.45}, "subscription": {"id": "abc"}});
    assert_eq!(process_message(&handler, &frame).unwrap(), Routed::Push);

    let updates = collector.updates.lock();
    match &updates[..] {
      [StreamUpdate::Tick(tick)] => assert_eq!(tick.quote, 123.45),
      other => panic!("unexpected updates {:?}", other),
    }
    assert_eq!(handler.subscriptions.info(&key).unwrap().server_id.as_deref(), Some("abc"));
  }

  #[test]
  fn test_ohlc_string_fields_normalized() {
    let (handler, _rx) = handler();
    let collector = subscribe(&handler, SubscriptionKey::Ohlc("R_10".to_string(), 60));
    let frame = json!({"msg_type": "ohlc", "subscription": {"id": "o1"}, "ohlc": {
      "symbol": "R_10", "granularity": 60, "open": "1.5", "high": "2.0", "low": "1.0", "close": "1.75",
      "epoch": 1700000060, "open_time": 1700000040
    }});
    process_message(&handler, &frame).unwrap();
    match &collector.updates.lock()[..] {
      [StreamUpdate::Ohlc(ohlc)] => assert_eq!(ohlc.close, 1.75),
      other => panic!("unexpected updates {:?}", other),
    };
  }

  #[test]
  fn test_raw_observers_see_every_frame_first() {
    let (handler, _rx) = handler();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    handler.messages.add(Arc::new(move |frame: &Value| {
      s.lock().push(frame.get("msg_type").cloned().unwrap_or(Value::Null));
    }));
    process_message(&handler, &json!({"msg_type": "website_status", "website_status": {}})).unwrap();
    process_message(&handler, &json!({"msg_type": "buy", "buy": {"contract_id": 1}})).unwrap();
    assert_eq!(*seen.lock(), vec![json!("website_status"), json!("buy")]);
  }

  #[test]
  fn test_authorize_populates_cache() {
    let (handler, _rx) = handler();
    let frame = json!({"msg_type": "authorize", "authorize": {"loginid": "CR123", "currency": "USD", "balance": 1000}});
    assert_eq!(process_message(&handler, &frame).unwrap(), Routed::Authorized);
    let info = handler.account.get_account_info().unwrap();
    assert_eq!((info.login_id.as_str(), info.currency.as_str(), info.balance), ("CR123", "USD", 1000.0));
  }

  #[test]
  fn test_authorize_error_reported() {
    let (handler, _rx) = handler();
    let frame = json!({"msg_type": "authorize", "echo_req": {"authorize": "bad"},
      "error": {"code": "InvalidToken", "message": "The token is invalid."}});
    match process_message(&handler, &frame).unwrap() {
      Routed::AuthorizeFailed(DerivError::ServerError { code, .. }) => assert_eq!(code, "InvalidToken"),
      other => panic!("unexpected {:?}", other),
    }
    assert!(!handler.account.is_authorized());
  }

  #[test]
  fn test_portfolio_subscribes_untracked_contracts() {
    let (handler, mut rx) = handler();
    handler.subscriptions.ensure(SubscriptionKey::Contract(1), protocol_encoder::subscribe_contract(1)).unwrap();
    sent(&mut rx);

    let frame = json!({"msg_type": "portfolio", "portfolio": {"contracts": [
      {"contract_id": 1, "buy_price": 10}, {"contract_id": 2, "buy_price": 5}
    ]}});
    process_message(&handler, &frame).unwrap();
    assert_eq!(sent(&mut rx), vec![protocol_encoder::subscribe_contract(2)]);
    assert_eq!(handler.account.get_portfolio().len(), 2);
  }

  #[test]
  fn test_open_contract_fan_out() {
    let (handler, _rx) = handler();
    let collector = subscribe(&handler, SubscriptionKey::Contract(55));
    let frame = json!({"msg_type": "proposal_open_contract", "subscription": {"id": "c55"},
      "proposal_open_contract": {"contract_id": 55, "profit": "3.2", "is_sold": 0}});
    process_message(&handler, &frame).unwrap();
    assert_eq!(handler.account.get_open_contract(55).unwrap().profit, Some(3.2));
    assert_eq!(collector.updates.lock().len(), 1);
  }

  #[test]
  fn test_sold_contract_is_retired_after_last_update() {
    let (handler, mut rx) = handler();
    let key = SubscriptionKey::Contract(77);
    let collector = subscribe(&handler, key.clone());
    sent(&mut rx);

    let frame = json!({"msg_type": "proposal_open_contract", "subscription": {"id": "c77"},
      "proposal_open_contract": {"contract_id": 77, "profit": "-1.0", "is_sold": 1}});
    assert_eq!(process_message(&handler, &frame).unwrap(), Routed::Push);
    assert_eq!(collector.updates.lock().len(), 1);
    assert!(!handler.subscriptions.contains(&key));
    assert!(sent(&mut rx).is_empty());
    assert!(handler.account.get_open_contract(77).unwrap().is_sold);
  }

  #[test]
  fn test_candles_reply_seeds_ohlc_stream() {
    let (handler, _rx) = handler();
    let key = SubscriptionKey::Ohlc("R_10".to_string(), 60);
    let collector = subscribe(&handler, key.clone());
    let frame = json!({"msg_type": "candles", "echo_req": protocol_encoder::subscribe_ohlc("R_10", 60),
      "subscription": {"id": "o1"},
      "candles": [{"epoch": 1700000040, "open": "1.5", "high": 2, "low": 1, "close": "1.25"}]});
    assert_eq!(process_message(&handler, &frame).unwrap(), Routed::Push);

    match &collector.updates.lock()[..] {
      [StreamUpdate::Ohlc(ohlc)] => {
        assert_eq!((ohlc.symbol.as_str(), ohlc.granularity, ohlc.close), ("R_10", 60, 1.25));
        assert_eq!(ohlc.open_time, 1700000040);
      }
      other => panic!("unexpected updates {:?}", other),
    }
    assert_eq!(handler.subscriptions.info(&key).unwrap().server_id.as_deref(), Some("o1"));

    // A history reply for a plain request is not a stream push.
    let history = json!({"msg_type": "candles", "echo_req": protocol_encoder::candles("R_10", 60, 5).unwrap(),
      "candles": [{"epoch": 1, "open": 1, "high": 1, "low": 1, "close": 1}]});
    assert_eq!(process_message(&handler, &history).unwrap(), Routed::Ignored);
    assert_eq!(collector.updates.lock().len(), 1);
  }

  #[test]
  fn test_empty_candles_reply_still_confirms() {
    let (handler, _rx) = handler();
    let key = SubscriptionKey::Ohlc("R_25".to_string(), 300);
    let collector = subscribe(&handler, key.clone());
    let frame = json!({"msg_type": "candles", "echo_req": protocol_encoder::subscribe_ohlc("R_25", 300),
      "subscription": {"id": "o2"}, "candles": []});
    assert_eq!(process_message(&handler, &frame).unwrap(), Routed::Push);
    assert!(collector.updates.lock().is_empty());
    assert_eq!(handler.subscriptions.info(&key).unwrap().server_id.as_deref(), Some("o2"));
  }

  #[test]
  fn test_ping_reply_routes_to_pong() {
    let (handler, _rx) = handler();
    let frame = json!({"msg_type": "ping", "ping": "pong", "echo_req": {"ping": 1}});
    assert_eq!(process_message(&handler, &frame).unwrap(), Routed::Pong);
  }

  #[test]
  fn test_already_subscribed_is_swallowed() {
    let (handler, _rx) = handler();
    let key = SubscriptionKey::Tick("R_10".to_string());
    let collector = subscribe(&handler, key.clone());
    let frame = json!({"msg_type": "tick", "echo_req": {"ticks": "R_10", "subscribe": 1},
      "error": {"code": "AlreadySubscribed", "message": "You are already subscribed to R_10."}});
    assert_eq!(process_message(&handler, &frame).unwrap(), Routed::Swallowed);
    assert!(handler.subscriptions.contains(&key));
    assert!(collector.errors.lock().is_empty());
  }

  #[test]
  fn test_rejected_subscription_removed_and_listener_told() {
    let (handler, _rx) = handler();
    let key = SubscriptionKey::Tick("R_XX".to_string());
    let collector = subscribe(&handler, key.clone());
    let frame = json!({"msg_type": "tick", "echo_req": {"ticks": "R_XX", "subscribe": 1},
      "error": {"code": "InvalidSymbol", "message": "Symbol R_XX invalid."}});
    assert!(matches!(process_message(&handler, &frame).unwrap(), Routed::Error(_)));
    assert!(!handler.subscriptions.contains(&key));
    assert_eq!(collector.errors.lock().len(), 1);
  }

  #[test]
  fn test_unknown_req_id_and_unknown_type_are_ignored() {
    let (handler, _rx) = handler();
    let frame = json!({"msg_type": "candles", "req_id": 424242, "candles": []});
    assert_eq!(process_message(&handler, &frame).unwrap(), Routed::Ignored);
    assert_eq!(handler.requests.pending_count(), 0);
    assert!(handler.subscriptions.is_empty());
  }

  #[test]
  fn test_push_for_unknown_key_is_dropped() {
    let (handler, _rx) = handler();
    let frame = json!({"msg_type": "tick", "tick": {"symbol": "R_75", "quote": 1}, "subscription": {"id": "z"}});
    assert_eq!(process_message(&handler, &frame).unwrap(), Routed::Push);
    assert!(handler.subscriptions.is_empty());
  }

  #[test]
  fn test_malformed_tick_is_protocol_mismatch() {
    let (handler, _rx) = handler();
    let frame = json!({"msg_type": "tick", "tick": {"quote": 1}});
    assert!(matches!(process_message(&handler, &frame), Err(DerivError::ProtocolMismatch(_))));
  }
}
