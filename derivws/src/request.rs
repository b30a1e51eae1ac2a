// derivws/src/request.rs
// Correlation of outbound requests with their responses.

use crate::base::DerivError;
use crate::conn::MessageBroker;
use crate::protocol_decoder;
use crate::protocol_encoder;
use log::{debug, trace, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Structural fallback for responses that do not echo `req_id`.
///
/// Matches on the response `msg_type` and on salient fields of `echo_req`. Two concurrent requests
/// with identical salient fields cannot be told apart; the oldest pending one wins. Callers that
/// need exactness must serialize such requests.
#[derive(Debug, Clone, PartialEq)]
pub struct EchoMatcher {
  msg_type: Option<String>,
  fields: Vec<(String, Value)>,
}

impl EchoMatcher {
  pub fn new(msg_type: &str) -> Self {
    EchoMatcher { msg_type: Some(msg_type.to_string()), fields: Vec::new() }
  }

  pub fn any_type() -> Self {
    EchoMatcher { msg_type: None, fields: Vec::new() }
  }

  /// Requires `echo_req[name] == value`.
  pub fn field(mut self, name: &str, value: Value) -> Self {
    self.fields.push((name.to_string(), value));
    self
  }

  /// Copies the named fields of an outbound frame.
  pub fn from_request(msg_type: &str, request: &Value, salient: &[&str]) -> Self {
    salient.iter().fold(Self::new(msg_type), |m, name| {
      let value = request.get(*name).cloned().unwrap_or(Value::Null);
      m.field(name, value)
    })
  }

  pub fn matches(&self, frame: &Value) -> bool {
    if let Some(expected) = &self.msg_type {
      if protocol_decoder::msg_type(frame) != Some(expected.as_str()) {
        return false;
      }
    }
    let Some(echo) = protocol_decoder::echo_req(frame) else {
      return false;
    };
    self.fields.iter().all(|(name, value)| echo.get(name) == Some(value))
  }
}

struct PendingRequest {
  matcher: Option<EchoMatcher>,
  sender: oneshot::Sender<Result<Value, DerivError>>,
  sent_at: Instant,
}

/// Outstanding request/response pairs keyed by client request id.
pub struct RequestCorrelator {
  message_broker: Arc<MessageBroker>,
  pending: Mutex<HashMap<u64, PendingRequest>>,
}

// Removes the pending entry when the waiting future finishes or is dropped.
struct PendingGuard<'a> {
  correlator: &'a RequestCorrelator,
  req_id: u64,
}

impl Drop for PendingGuard<'_> {
  fn drop(&mut self) {
    self.correlator.pending.lock().remove(&self.req_id);
  }
}

impl RequestCorrelator {
  pub fn new(message_broker: Arc<MessageBroker>) -> Self {
    RequestCorrelator { message_broker, pending: Mutex::new(HashMap::new()) }
  }

  /// Sends `frame` with a fresh `req_id` and waits for its response.
  ///
  /// Fails with [`DerivError::NotConnected`] if the frame cannot be sent, [`DerivError::Timeout`]
  /// when no response arrives in time, [`DerivError::ServerError`] when the response carries an
  /// `error` payload and [`DerivError::ConnectionLost`] if the connection drops first.
  pub async fn request(&self, frame: Value, matcher: Option<EchoMatcher>, timeout: Duration) -> Result<Value, DerivError> {
    let req_id = self.message_broker.next_request_id();
    let frame = protocol_encoder::with_req_id(frame, req_id)?;
    let (sender, receiver) = oneshot::channel();

    self.pending.lock().insert(req_id, PendingRequest { matcher, sender, sent_at: Instant::now() });
    let _guard = PendingGuard { correlator: self, req_id };

    self.message_broker.send(&frame)?;
    debug!("Request {} sent.", req_id);

    match tokio::time::timeout(timeout, receiver).await {
      Ok(Ok(result)) => result,
      // Sender dropped without an answer: the map was torn down.
      Ok(Err(_)) => Err(DerivError::ConnectionLost),
      Err(_) => {
        warn!("Request {} timed out after {:?}.", req_id, timeout);
        Err(DerivError::Timeout(format!("request {} got no response within {:?}", req_id, timeout)))
      }
    }
  }

  /// Completes the pending request this frame answers. Returns false if it answers none.
  ///
  /// A frame carrying a `req_id` is only ever matched by that id. The structural matcher is
  /// consulted only for frames without one.
  pub fn try_complete(&self, frame: &Value) -> bool {
    let entry = {
      let mut pending = self.pending.lock();
      match protocol_decoder::req_id(frame) {
        Some(id) => pending.remove(&id).map(|p| (id, p)),
        None => {
          let oldest = pending
            .iter()
            .filter(|(_, p)| p.matcher.as_ref().map_or(false, |m| m.matches(frame)))
            .map(|(id, _)| *id)
            .min();
          oldest.and_then(|id| pending.remove(&id).map(|p| (id, p)))
        }
      }
    };

    let Some((req_id, entry)) = entry else {
      if let Some(id) = protocol_decoder::req_id(frame) {
        trace!("Response for unknown request {} ignored by correlator.", id);
      }
      return false;
    };

    let result = match protocol_decoder::error_payload(frame) {
      Some(err) => Err(DerivError::from(err)),
      None => Ok(frame.clone()),
    };
    debug!("Request {} answered after {:?} (ok={}).", req_id, entry.sent_at.elapsed(), result.is_ok());
    if entry.sender.send(result).is_err() {
      debug!("Request {} waiter already gone.", req_id);
    }
    true
  }

  /// Fails every outstanding request with `error`. Returns how many were failed.
  pub fn fail_all(&self, error: DerivError) -> usize {
    let drained: Vec<(u64, PendingRequest)> = self.pending.lock().drain().collect();
    let count = drained.len();
    for (req_id, entry) in drained {
      trace!("Failing request {} with {}", req_id, error);
      let _ = entry.sender.send(Err(error.clone()));
    }
    if count > 0 {
      debug!("Failed {} pending request(s): {}", count, error);
    }
    count
  }

  pub fn pending_count(&self) -> usize {
    self.pending.lock().len()
  }

  pub fn is_pending(&self, req_id: u64) -> bool {
    self.pending.lock().contains_key(&req_id)
  }
}
