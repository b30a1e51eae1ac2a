// derivws/src/stream_subscription.rs

//! Pull-style access to one stream.
//!
//! A [`StreamSubscription`] registers a channel-backed listener for its key and hands updates out
//! through blocking or non-blocking receives. Cancelling it, or dropping it, unsubscribes the key.
//!
//! ```no_run
//! # use derivws::{DerivClient, ClientConfig};
//! # use std::time::Duration;
//! # async fn run() -> Result<(), derivws::DerivError> {
//! let client = DerivClient::new(ClientConfig::default());
//! client.connect()?;
//! let ticks = client.stream_ticks("R_100")?;
//! while let Some(event) = ticks.next_timeout(Duration::from_secs(5)) {
//!   println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

use crate::base::DerivError;
use crate::observer::{StreamObserver, StreamUpdate};
use crate::subscription::{SubscriptionKey, SubscriptionRegistry};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Items yielded by a [`StreamSubscription`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
  Update(StreamUpdate),
  /// The server rejected the subscription. No further updates follow.
  Error(DerivError),
}

struct ChannelObserver {
  sender: Sender<StreamEvent>,
}

impl StreamObserver for ChannelObserver {
  fn on_update(&self, key: &SubscriptionKey, update: &StreamUpdate) {
    if self.sender.send(StreamEvent::Update(update.clone())).is_err() {
      warn!("StreamSubscription {}: receiver dropped, update discarded.", key);
    }
  }

  fn on_error(&self, key: &SubscriptionKey, error: &DerivError) {
    debug!("StreamSubscription {}: error {}", key, error);
    let _ = self.sender.send(StreamEvent::Error(error.clone()));
  }
}

pub struct StreamSubscription {
  key: SubscriptionKey,
  registry: Arc<SubscriptionRegistry>,
  listener: Arc<dyn StreamObserver>,
  receiver: Receiver<StreamEvent>,
  closed: AtomicBool,
}

impl StreamSubscription {
  pub(crate) fn open(registry: Arc<SubscriptionRegistry>, key: SubscriptionKey) -> Result<Self, DerivError> {
    let (sender, receiver) = crossbeam_channel::unbounded();
    let listener: Arc<dyn StreamObserver> = Arc::new(ChannelObserver { sender });
    registry.subscribe(key.clone(), key.request_frame(), Some(listener.clone()))?;
    debug!("StreamSubscription {} opened.", key);
    Ok(StreamSubscription { key, registry, listener, receiver, closed: AtomicBool::new(false) })
  }

  pub fn key(&self) -> &SubscriptionKey {
    &self.key
  }

  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::SeqCst)
  }

  /// Blocks up to `timeout` for the next event. `None` on timeout or after `cancel()`.
  ///
  /// This blocks the calling thread; from async code use `try_next` or a blocking task.
  pub fn next_timeout(&self, timeout: Duration) -> Option<StreamEvent> {
    if self.is_closed() {
      return self.receiver.try_recv().ok();
    }
    match self.receiver.recv_timeout(timeout) {
      Ok(event) => Some(event),
      Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
    }
  }

  pub fn try_next(&self) -> Option<StreamEvent> {
    match self.receiver.try_recv() {
      Ok(event) => Some(event),
      Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
    }
  }

  /// Drains everything already queued.
  pub fn drain(&self) -> Vec<StreamEvent> {
    self.receiver.try_iter().collect()
  }

  /// Unsubscribes the key. Events already queued can still be read. Idempotent.
  ///
  /// If a later handle or callback took over the key, the stream stays live for it and only this
  /// handle closes.
  pub fn cancel(&self) {
    if self.closed.swap(true, Ordering::SeqCst) {
      return;
    }
    debug!("StreamSubscription {} cancelled.", self.key);
    self.registry.unsubscribe_if(&self.key, &self.listener);
  }
}

impl Drop for StreamSubscription {
  fn drop(&mut self) {
    self.cancel();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::conn::MessageBroker;
  use crate::protocol_decoder::Tick;
  use tokio::sync::mpsc;

  fn tick(quote: f64) -> StreamUpdate {
    StreamUpdate::Tick(Tick { symbol: "R_50".to_string(), quote, bid: None, ask: None, epoch: 1, pip_size: None })
  }

  fn setup() -> (Arc<SubscriptionRegistry>, mpsc::UnboundedReceiver<String>) {
    let broker = Arc::new(MessageBroker::new());
    let (tx, rx) = mpsc::unbounded_channel();
    broker.attach(tx);
    (Arc::new(SubscriptionRegistry::new(broker)), rx)
  }

  fn listener_of(registry: &SubscriptionRegistry, key: &SubscriptionKey) -> Arc<dyn StreamObserver> {
    match registry.on_push(key, Some("sub-1".to_string())) {
      crate::subscription::PushDisposition::Deliver(Some(listener)) => listener,
      _ => panic!("expected a listener for {}", key),
    }
  }

  #[test]
  fn test_updates_are_queued_in_order() {
    let (registry, mut rx) = setup();
    let key = SubscriptionKey::Tick("R_50".to_string());
    let stream = StreamSubscription::open(registry.clone(), key.clone()).unwrap();
    assert!(rx.try_recv().is_ok());

    let listener = listener_of(&registry, &key);
    listener.on_update(&key, &tick(1.0));
    listener.on_update(&key, &tick(2.0));

    assert_eq!(stream.try_next(), Some(StreamEvent::Update(tick(1.0))));
    assert_eq!(stream.next_timeout(Duration::from_millis(10)), Some(StreamEvent::Update(tick(2.0))));
    assert_eq!(stream.next_timeout(Duration::from_millis(10)), None);
  }

  #[test]
  fn test_drop_sends_forget() {
    let (registry, mut rx) = setup();
    let key = SubscriptionKey::Tick("R_50".to_string());
    {
      let _stream = StreamSubscription::open(registry.clone(), key.clone()).unwrap();
      listener_of(&registry, &key);
      rx.try_recv().unwrap();
    }
    let forget: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
    assert_eq!(forget["forget"], "sub-1");
    assert!(!registry.contains(&key));
  }

  #[test]
  fn test_cancel_is_idempotent_and_keeps_queued_events() {
    let (registry, _rx) = setup();
    let key = SubscriptionKey::Tick("R_50".to_string());
    let stream = StreamSubscription::open(registry.clone(), key.clone()).unwrap();
    let listener = listener_of(&registry, &key);
    listener.on_update(&key, &tick(3.0));

    stream.cancel();
    stream.cancel();
    assert!(stream.is_closed());
    assert_eq!(stream.drain(), vec![StreamEvent::Update(tick(3.0))]);
  }

  #[test]
  fn test_dropping_superseded_handle_keeps_stream() {
    let (registry, mut rx) = setup();
    let key = SubscriptionKey::Tick("R_10".to_string());
    let first = StreamSubscription::open(registry.clone(), key.clone()).unwrap();
    let second = StreamSubscription::open(registry.clone(), key.clone()).unwrap();
    assert!(rx.try_recv().is_ok());
    assert!(rx.try_recv().is_err());

    drop(first);
    assert!(registry.contains(&key));
    assert!(rx.try_recv().is_err());

    let listener = listener_of(&registry, &key);
    listener.on_update(&key, &tick(4.0));
    assert_eq!(second.try_next(), Some(StreamEvent::Update(tick(4.0))));

    drop(second);
    let forget: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
    assert_eq!(forget["forget"], "sub-1");
    assert!(!registry.contains(&key));
  }

  #[test]
  fn test_open_fails_when_disconnected() {
    let registry = Arc::new(SubscriptionRegistry::new(Arc::new(MessageBroker::new())));
    let result = StreamSubscription::open(registry, SubscriptionKey::Tick("R_50".to_string()));
    assert!(matches!(result, Err(DerivError::NotConnected)));
  }
}
