// derivws/src/conn_mock.rs
// In-memory transport for tests and offline use.

use crate::base::DerivError;
use crate::conn::{Connection, TransportEvent, TransportHandle};

use async_trait::async_trait;
use log::{debug, trace};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// How the next dial attempt should behave.
#[derive(Debug, Clone)]
pub enum DialBehavior {
  Accept,
  Refuse(String),
  /// Never completes; exercises the connect timeout.
  Hang,
}

#[derive(Default)]
struct MockConnectionState {
  dialed_urls: Vec<String>,
  scripted: VecDeque<DialBehavior>,
  // Inbound event sender and outbound frame receiver of the current link.
  events: Option<UnboundedSender<TransportEvent>>,
  outbound: Option<UnboundedReceiver<String>>,
  sent: Vec<String>,
}

impl MockConnectionState {
  // Moves frames written since the last call into the `sent` log.
  fn drain_outbound(&mut self) {
    if let Some(rx) = self.outbound.as_mut() {
      while let Ok(text) = rx.try_recv() {
        trace!("Mock: captured outbound {}", text);
        self.sent.push(text);
      }
    }
  }
}

/// Scriptable [`Connection`]. Clones share state, so a test keeps one clone while the client owns another.
#[derive(Clone, Default)]
pub struct MockConnection {
  inner: Arc<Mutex<MockConnectionState>>,
}

impl MockConnection {
  pub fn new() -> Self {
    Self::default()
  }

  /// Queues the behavior of a future dial; unscripted dials are accepted.
  pub fn script_dial(&self, behavior: DialBehavior) {
    self.inner.lock().scripted.push_back(behavior);
  }

  pub fn dial_count(&self) -> usize {
    self.inner.lock().dialed_urls.len()
  }

  pub fn dialed_urls(&self) -> Vec<String> {
    self.inner.lock().dialed_urls.clone()
  }

  /// Whether the client currently holds an open link.
  pub fn is_linked(&self) -> bool {
    self.inner.lock().events.as_ref().map_or(false, |tx| !tx.is_closed())
  }

  /// Every frame the client has written, across all links, in order.
  pub fn sent(&self) -> Vec<Value> {
    let mut state = self.inner.lock();
    state.drain_outbound();
    state.sent.iter().filter_map(|text| serde_json::from_str(text).ok()).collect()
  }

  /// Sent frames carrying `operation` as a top-level field.
  pub fn sent_with(&self, operation: &str) -> Vec<Value> {
    self.sent().into_iter().filter(|f| f.get(operation).is_some()).collect()
  }

  pub fn clear_sent(&self) {
    let mut state = self.inner.lock();
    state.drain_outbound();
    state.sent.clear();
  }

  /// Delivers an inbound frame. Returns false when no link is open.
  pub fn push(&self, frame: Value) -> bool {
    self.push_text(frame.to_string())
  }

  pub fn push_text(&self, text: String) -> bool {
    let state = self.inner.lock();
    match state.events.as_ref() {
      Some(tx) => tx.send(TransportEvent::Message(text)).is_ok(),
      None => false,
    }
  }

  /// Answers `request` the way the server does: echoes it under `echo_req` and copies its `req_id`.
  pub fn reply(&self, request: &Value, mut body: Value) -> bool {
    if let Some(obj) = body.as_object_mut() {
      obj.insert("echo_req".to_string(), request.clone());
      if let Some(req_id) = request.get("req_id") {
        obj.insert("req_id".to_string(), req_id.clone());
      }
    }
    self.push(body)
  }

  /// Simulates the peer closing the connection.
  pub fn close(&self, reason: Option<&str>) {
    let mut state = self.inner.lock();
    state.drain_outbound();
    if let Some(tx) = state.events.take() {
      let _ = tx.send(TransportEvent::Closed(reason.map(str::to_string)));
    }
    state.outbound = None;
  }

  /// Simulates a transport error.
  pub fn fail(&self, error: &str) {
    let mut state = self.inner.lock();
    state.drain_outbound();
    if let Some(tx) = state.events.take() {
      let _ = tx.send(TransportEvent::Error(error.to_string()));
    }
    state.outbound = None;
  }
}

#[async_trait]
impl Connection for MockConnection {
  async fn dial(&self, url: &str) -> Result<TransportHandle, DerivError> {
    let behavior = {
      let mut state = self.inner.lock();
      state.dialed_urls.push(url.to_string());
      state.scripted.pop_front().unwrap_or(DialBehavior::Accept)
    };
    debug!("Mock: dial {} -> {:?}", url, behavior);

    match behavior {
      DialBehavior::Refuse(reason) => Err(DerivError::ConnectionFailed(reason)),
      DialBehavior::Hang => {
        std::future::pending::<()>().await;
        Err(DerivError::InternalError("pending future completed".to_string()))
      }
      DialBehavior::Accept => {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut state = self.inner.lock();
        state.drain_outbound();
        state.outbound = Some(out_rx);
        state.events = Some(event_tx);
        Ok(TransportHandle { outbound: out_tx, events: event_rx })
      }
    }
  }
}
