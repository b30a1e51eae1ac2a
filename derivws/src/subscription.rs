// derivws/src/subscription.rs
// Registry of logical stream subscriptions multiplexed over the single connection.

//! Subscription bookkeeping.
//!
//! Every logical stream is identified by a [`SubscriptionKey`]. The registry keeps at most one
//! entry per key, remembers the frame that created it (so it can be reissued after a reconnect)
//! and tracks the server-assigned subscription id, which arrives asynchronously with the first
//! push. Cancelling requires that id, so an unsubscribe issued before the id is known is
//! deferred until it arrives.

use crate::base::DerivError;
use crate::conn::MessageBroker;
use crate::observer::StreamObserver;
use crate::protocol_encoder::{self, Operation};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Stream family of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
  Tick,
  Ohlc,
  Contract,
  Balance,
  Portfolio,
}

impl FromStr for StreamKind {
  type Err = DerivError;
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "tick" | "ticks" => Ok(StreamKind::Tick),
      "ohlc" | "candles" => Ok(StreamKind::Ohlc),
      "contract" => Ok(StreamKind::Contract),
      "balance" => Ok(StreamKind::Balance),
      "portfolio" => Ok(StreamKind::Portfolio),
      other => Err(DerivError::InvalidParameter(format!("unknown stream kind '{}'", other))),
    }
  }
}

/// Identity of one logical push stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubscriptionKey {
  Tick(String),
  Ohlc(String, u32),
  Contract(u64),
  Balance,
  Portfolio,
}

impl fmt::Display for SubscriptionKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SubscriptionKey::Tick(symbol) => write!(f, "tick_{}", symbol),
      SubscriptionKey::Ohlc(symbol, granularity) => write!(f, "ohlc_{}_{}", symbol, granularity),
      SubscriptionKey::Contract(id) => write!(f, "contract_{}", id),
      SubscriptionKey::Balance => write!(f, "balance"),
      SubscriptionKey::Portfolio => write!(f, "portfolio"),
    }
  }
}

impl SubscriptionKey {
  /// Builds a key from the loose `(kind, symbol-or-id, granularity)` form used by `unsubscribe`.
  pub fn from_parts(kind: StreamKind, symbol_or_id: &str, granularity: Option<u32>) -> Result<Self, DerivError> {
    match kind {
      StreamKind::Tick => Ok(SubscriptionKey::Tick(non_empty(symbol_or_id)?)),
      StreamKind::Ohlc => {
        let granularity = granularity
          .ok_or_else(|| DerivError::InvalidParameter("ohlc streams need a granularity".to_string()))?;
        Ok(SubscriptionKey::Ohlc(non_empty(symbol_or_id)?, granularity))
      }
      StreamKind::Contract => symbol_or_id
        .trim()
        .parse()
        .map(SubscriptionKey::Contract)
        .map_err(|_| DerivError::InvalidParameter(format!("bad contract id '{}'", symbol_or_id))),
      StreamKind::Balance => Ok(SubscriptionKey::Balance),
      StreamKind::Portfolio => Ok(SubscriptionKey::Portfolio),
    }
  }

  pub fn kind(&self) -> StreamKind {
    match self {
      SubscriptionKey::Tick(_) => StreamKind::Tick,
      SubscriptionKey::Ohlc(..) => StreamKind::Ohlc,
      SubscriptionKey::Contract(_) => StreamKind::Contract,
      SubscriptionKey::Balance => StreamKind::Balance,
      SubscriptionKey::Portfolio => StreamKind::Portfolio,
    }
  }

  /// Account streams (balance, portfolio, contracts) need an authorized session.
  pub fn requires_authorization(&self) -> bool {
    matches!(self, SubscriptionKey::Balance | SubscriptionKey::Portfolio | SubscriptionKey::Contract(_))
  }

  /// Whether the server keeps pushing (and assigns a subscription id). Portfolio is a one-shot listing.
  pub fn is_streaming(&self) -> bool {
    !matches!(self, SubscriptionKey::Portfolio)
  }

  /// The frame that opens this stream.
  pub fn request_frame(&self) -> Value {
    match self {
      SubscriptionKey::Tick(symbol) => protocol_encoder::subscribe_ticks(symbol),
      SubscriptionKey::Ohlc(symbol, granularity) => protocol_encoder::subscribe_ohlc(symbol, *granularity),
      SubscriptionKey::Contract(id) => protocol_encoder::subscribe_contract(*id),
      SubscriptionKey::Balance => protocol_encoder::subscribe_balance(),
      SubscriptionKey::Portfolio => protocol_encoder::portfolio(),
    }
  }

  /// Recovers the key a request was made for from its `echo_req`.
  pub fn from_echo(echo: &Value) -> Option<Self> {
    match Operation::identify(echo)? {
      Operation::Ticks => echo.get("ticks").and_then(Value::as_str).map(|s| SubscriptionKey::Tick(s.to_string())),
      Operation::TicksHistory => {
        // Only the subscribed candle form is a stream; one-shot history belongs to the correlator.
        let subscribed = echo.get("subscribe").and_then(Value::as_u64) == Some(1);
        let candles = echo.get("style").and_then(Value::as_str) == Some("candles");
        if !(subscribed && candles) {
          return None;
        }
        let symbol = echo.get("ticks_history").and_then(Value::as_str)?;
        let granularity = echo.get("granularity").and_then(Value::as_u64)?;
        Some(SubscriptionKey::Ohlc(symbol.to_string(), u32::try_from(granularity).ok()?))
      }
      Operation::ProposalOpenContract => echo.get("contract_id").and_then(Value::as_u64).map(SubscriptionKey::Contract),
      Operation::Balance => Some(SubscriptionKey::Balance),
      Operation::Portfolio => Some(SubscriptionKey::Portfolio),
      _ => None,
    }
  }
}

// Compares data pointers only; vtable pointers of the same type may differ between codegen units.
fn same_listener(a: &Arc<dyn StreamObserver>, b: &Arc<dyn StreamObserver>) -> bool {
  std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

fn non_empty(symbol: &str) -> Result<String, DerivError> {
  let symbol = symbol.trim();
  if symbol.is_empty() {
    return Err(DerivError::InvalidParameter("symbol must not be empty".to_string()));
  }
  Ok(symbol.to_string())
}

/// Confirmation state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
  /// Requested, no server id yet.
  Pending,
  /// A push carrying the server id has arrived.
  Confirmed,
}

/// Read-only view of one registry entry.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionInfo {
  pub key: SubscriptionKey,
  pub state: SubscriptionState,
  pub server_id: Option<String>,
  pub has_listener: bool,
  pub cancel_pending: bool,
  pub needs_resubscribe: bool,
}

struct Subscription {
  listener: Option<Arc<dyn StreamObserver>>,
  request: Value,
  server_id: Option<String>,
  // Unsubscribed before the id arrived: forget it as soon as the id shows up.
  cancel_on_confirm: bool,
  // Demoted by a connection loss and not yet reissued on the new connection.
  needs_resubscribe: bool,
}

impl Subscription {
  fn new(request: Value, listener: Option<Arc<dyn StreamObserver>>) -> Self {
    Subscription { listener, request, server_id: None, cancel_on_confirm: false, needs_resubscribe: false }
  }

  fn state(&self) -> SubscriptionState {
    if self.server_id.is_some() { SubscriptionState::Confirmed } else { SubscriptionState::Pending }
  }
}

/// What the router should do with a push.
pub enum PushDisposition {
  /// Hand the payload to this listener (if any).
  Deliver(Option<Arc<dyn StreamObserver>>),
  /// The entry was awaiting its id to be cancelled; it has now been forgotten.
  Cancelled,
  /// No entry for the key, or a cancel still waiting for its id.
  Dropped,
}

pub struct SubscriptionRegistry {
  message_broker: Arc<MessageBroker>,
  subscriptions: Mutex<HashMap<SubscriptionKey, Subscription>>,
}

impl SubscriptionRegistry {
  pub fn new(message_broker: Arc<MessageBroker>) -> Self {
    SubscriptionRegistry { message_broker, subscriptions: Mutex::new(HashMap::new()) }
  }

  /// Subscribes `key`, sending `frame` only when no entry exists yet.
  ///
  /// An existing entry (pending or confirmed) keeps its server id and only has its listener
  /// replaced; a listener-less call leaves an existing listener in place. Returns whether a frame
  /// was sent. A send failure creates no entry.
  pub fn subscribe(
    &self,
    key: SubscriptionKey,
    frame: Value,
    listener: Option<Arc<dyn StreamObserver>>,
  ) -> Result<bool, DerivError> {
    let mut subs = self.subscriptions.lock();
    if let Some(existing) = subs.get_mut(&key) {
      debug!("Subscription {} exists; replacing listener only.", key);
      if listener.is_some() {
        existing.listener = listener;
      }
      existing.cancel_on_confirm = false;
      return Ok(false);
    }
    self.message_broker.send(&frame)?;
    debug!("Subscription {} requested.", key);
    subs.insert(key, Subscription::new(frame, listener));
    Ok(true)
  }

  /// Makes sure an internal (listener-less) stream is live on the current connection: creates it,
  /// or reissues it if a connection loss demoted it. Returns whether a frame was sent.
  pub fn ensure(&self, key: SubscriptionKey, frame: Value) -> Result<bool, DerivError> {
    let mut subs = self.subscriptions.lock();
    match subs.get_mut(&key) {
      Some(existing) if existing.needs_resubscribe || existing.cancel_on_confirm => {
        let mut sent = false;
        if existing.needs_resubscribe {
          self.message_broker.send(&frame)?;
          existing.needs_resubscribe = false;
          existing.request = frame;
          sent = true;
        }
        existing.cancel_on_confirm = false;
        Ok(sent)
      }
      Some(_) => Ok(false),
      None => {
        self.message_broker.send(&frame)?;
        subs.insert(key, Subscription::new(frame, None));
        Ok(true)
      }
    }
  }

  /// Records the server id carried by a push for `key` and decides who receives the payload.
  pub fn on_push(&self, key: &SubscriptionKey, server_id: Option<String>) -> PushDisposition {
    let mut subs = self.subscriptions.lock();
    let Some(sub) = subs.get_mut(key) else {
      return PushDisposition::Dropped;
    };
    if let Some(id) = server_id {
      if sub.server_id.as_deref() != Some(id.as_str()) {
        debug!("Subscription {} confirmed with id {}.", key, id);
      }
      sub.server_id = Some(id);
    }
    if sub.cancel_on_confirm {
      let Some(id) = sub.server_id.clone() else {
        return PushDisposition::Dropped;
      };
      subs.remove(key);
      self.send_forget(key, &id);
      return PushDisposition::Cancelled;
    }
    PushDisposition::Deliver(sub.listener.clone())
  }

  /// Removes the listener for `key` immediately and cancels the server stream.
  ///
  /// A confirmed entry is forgotten by id right away. A pending entry is marked so the cancel goes
  /// out once its id arrives. An entry that is not live on the server (demoted, or a one-shot
  /// portfolio listing) is simply dropped.
  pub fn unsubscribe(&self, key: &SubscriptionKey) -> bool {
    let mut subs = self.subscriptions.lock();
    if !subs.contains_key(key) {
      debug!("Unsubscribe {}: not subscribed.", key);
      return false;
    }
    self.cancel_entry(&mut subs, key);
    true
  }

  /// Like [`unsubscribe`](Self::unsubscribe), but only while `listener` is still the one
  /// registered for `key`. A listener that was replaced by a later subscribe leaves the entry alone.
  pub fn unsubscribe_if(&self, key: &SubscriptionKey, listener: &Arc<dyn StreamObserver>) -> bool {
    let mut subs = self.subscriptions.lock();
    let owned = subs
      .get(key)
      .and_then(|s| s.listener.as_ref())
      .map_or(false, |current| same_listener(current, listener));
    if !owned {
      debug!("Unsubscribe {}: listener no longer registered, entry kept.", key);
      return false;
    }
    self.cancel_entry(&mut subs, key);
    true
  }

  /// Removes an entry whose server stream has already ended (e.g. a sold contract). Sends nothing.
  pub fn retire(&self, key: &SubscriptionKey) -> bool {
    let removed = self.subscriptions.lock().remove(key).is_some();
    if removed {
      debug!("Subscription {} retired.", key);
    }
    removed
  }

  fn cancel_entry(&self, subs: &mut HashMap<SubscriptionKey, Subscription>, key: &SubscriptionKey) {
    let Some(sub) = subs.get_mut(key) else { return };
    sub.listener = None;
    match sub.server_id.clone() {
      Some(id) => {
        subs.remove(key);
        self.send_forget(key, &id);
      }
      None if sub.needs_resubscribe || !key.is_streaming() || !self.message_broker.is_open() => {
        subs.remove(key);
        debug!("Unsubscribe {}: not live on the server, dropped locally.", key);
      }
      None => {
        sub.cancel_on_confirm = true;
        debug!("Unsubscribe {}: id not yet known, cancel deferred.", key);
      }
    }
  }

  /// Drops a subscription the server rejected before confirming it. Returns the listener to notify.
  pub fn reject_pending(&self, key: &SubscriptionKey) -> Option<Arc<dyn StreamObserver>> {
    let mut subs = self.subscriptions.lock();
    if subs.get(key).map_or(true, |s| s.server_id.is_some()) {
      return None;
    }
    subs.remove(key).and_then(|s| s.listener)
  }

  /// Demotes every entry to pending-without-id after a connection loss. Listeners stay registered;
  /// entries that were only waiting to be cancelled are dropped. Returns how many were demoted.
  pub fn on_connection_lost(&self) -> usize {
    let mut subs = self.subscriptions.lock();
    subs.retain(|_, s| !s.cancel_on_confirm);
    for sub in subs.values_mut() {
      sub.server_id = None;
      sub.needs_resubscribe = true;
    }
    info!("Connection lost: {} subscription(s) demoted to pending.", subs.len());
    subs.len()
  }

  /// Reissues demoted entries on a fresh connection. Entries that need authorization are only
  /// reissued when `authorized`. Returns the number of frames sent.
  pub fn resubscribe(&self, authorized: bool) -> usize {
    let mut subs = self.subscriptions.lock();
    let mut sent = 0;
    for (key, sub) in subs.iter_mut() {
      if !sub.needs_resubscribe || (key.requires_authorization() && !authorized) {
        continue;
      }
      match self.message_broker.send(&sub.request) {
        Ok(()) => {
          sub.needs_resubscribe = false;
          sent += 1;
        }
        Err(e) => {
          warn!("Resubscribe {} failed: {}", key, e);
          break;
        }
      }
    }
    if sent > 0 {
      info!("Reissued {} subscription(s).", sent);
    }
    sent
  }

  pub fn contains(&self, key: &SubscriptionKey) -> bool {
    self.subscriptions.lock().contains_key(key)
  }

  pub fn info(&self, key: &SubscriptionKey) -> Option<SubscriptionInfo> {
    self.subscriptions.lock().get(key).map(|s| SubscriptionInfo {
      key: key.clone(),
      state: s.state(),
      server_id: s.server_id.clone(),
      has_listener: s.listener.is_some(),
      cancel_pending: s.cancel_on_confirm,
      needs_resubscribe: s.needs_resubscribe,
    })
  }

  /// All keys, sorted.
  pub fn keys(&self) -> Vec<SubscriptionKey> {
    let mut keys: Vec<_> = self.subscriptions.lock().keys().cloned().collect();
    keys.sort();
    keys
  }

  pub fn len(&self) -> usize {
    self.subscriptions.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn send_forget(&self, key: &SubscriptionKey, id: &str) {
    match self.message_broker.send(&protocol_encoder::forget(id)) {
      Ok(()) => debug!("Forget sent for {} ({}).", key, id),
      // The server drops its streams with the connection, so there is nothing left to cancel.
      Err(e) => debug!("Forget for {} ({}) not sent: {}", key, id, e),
    }
  }
}
