// derivws/src/observer.rs
// Observer traits and the id-keyed registry that holds them.

#![allow(unused_variables)] // For default implementations

use crate::base::DerivError;
use crate::protocol_decoder::{BalanceUpdate, Ohlc, OpenContract, PortfolioEntry, Tick};
use crate::subscription::SubscriptionKey;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Unique identifier for a registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(pub usize);

/// Payload delivered to a stream listener, already normalized to numeric types.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamUpdate {
  Tick(Tick),
  Ohlc(Ohlc),
  Balance(BalanceUpdate),
  Portfolio(Vec<PortfolioEntry>),
  Contract(OpenContract),
}

/// Listener for one logical stream (ticks, candles, balance, portfolio or a contract).
pub trait StreamObserver: Send + Sync {
  /// Called for every push routed to the listener's subscription key.
  fn on_update(&self, key: &SubscriptionKey, update: &StreamUpdate);
  /// Called when the server rejects the subscription before it was confirmed.
  fn on_error(&self, key: &SubscriptionKey, error: &DerivError) {}
}

impl<F> StreamObserver for F
where
  F: Fn(&SubscriptionKey, &StreamUpdate) + Send + Sync,
{
  fn on_update(&self, key: &SubscriptionKey, update: &StreamUpdate) {
    self(key, update)
  }
}

/// Connectivity notifications. `true` means the connection is usable for requests.
pub trait ConnectionObserver: Send + Sync {
  fn on_connectivity_change(&self, connected: bool);
  /// Automatic reconnection gave up; only `manual_connect()` resumes it.
  fn on_reconnect_exhausted(&self, attempts: u32) {}
}

impl<F> ConnectionObserver for F
where
  F: Fn(bool) + Send + Sync,
{
  fn on_connectivity_change(&self, connected: bool) {
    self(connected)
  }
}

/// Sees every inbound frame before classification.
pub trait MessageObserver: Send + Sync {
  fn on_message(&self, frame: &Value);
}

impl<F> MessageObserver for F
where
  F: Fn(&Value) + Send + Sync,
{
  fn on_message(&self, frame: &Value) {
    self(frame)
  }
}

/// Observers keyed by [`ObserverId`]. Notification happens on a snapshot, never under the lock,
/// so observers may add or remove observers from inside a callback.
pub struct ObserverRegistry<T: ?Sized> {
  observers: RwLock<BTreeMap<usize, Arc<T>>>,
  next_id: AtomicUsize,
}

impl<T: ?Sized> Default for ObserverRegistry<T> {
  fn default() -> Self {
    Self { observers: RwLock::new(BTreeMap::new()), next_id: AtomicUsize::new(1) }
  }
}

impl<T: ?Sized> ObserverRegistry<T> {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(&self, observer: Arc<T>) -> ObserverId {
    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
    self.observers.write().insert(id, observer);
    ObserverId(id)
  }

  pub fn remove(&self, id: ObserverId) -> bool {
    self.observers.write().remove(&id.0).is_some()
  }

  /// Current observers in registration order.
  pub fn snapshot(&self) -> Vec<Arc<T>> {
    self.observers.read().values().cloned().collect()
  }

  pub fn len(&self) -> usize {
    self.observers.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use parking_lot::Mutex;

  #[test]
  fn test_registry_add_remove() {
    let registry: ObserverRegistry<dyn ConnectionObserver> = ObserverRegistry::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s1 = seen.clone();
    let s2 = seen.clone();
    let a = registry.add(Arc::new(move |c: bool| s1.lock().push(("a", c))));
    let b = registry.add(Arc::new(move |c: bool| s2.lock().push(("b", c))));
    assert_ne!(a, b);
    assert_eq!(registry.len(), 2);

    for obs in registry.snapshot() {
      obs.on_connectivity_change(true);
    }
    assert_eq!(*seen.lock(), vec![("a", true), ("b", true)]);

    assert!(registry.remove(a));
    assert!(!registry.remove(a));
    assert_eq!(registry.len(), 1);
  }

  #[test]
  fn test_closure_stream_observer_ignores_errors_by_default() {
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let observer: Arc<dyn StreamObserver> = Arc::new(move |_key: &SubscriptionKey, _update: &StreamUpdate| {
      c.fetch_add(1, Ordering::SeqCst);
    });
    let key = SubscriptionKey::Balance;
    observer.on_error(&key, &DerivError::ConnectionLost);
    let update = StreamUpdate::Balance(BalanceUpdate { balance: 1.0, currency: None, loginid: None });
    observer.on_update(&key, &update);
    assert_eq!(count.load(Ordering::SeqCst), 1);
  }
}
