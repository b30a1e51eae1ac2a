// derivws/src/conn.rs
// Transport abstraction, the WebSocket implementation and the guarded send primitive.

use crate::base::DerivError;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Event emitted by an open transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
  /// A complete inbound text frame.
  Message(String),
  /// The peer closed the connection, with the close reason if one was given.
  Closed(Option<String>),
  Error(String),
}

/// Both halves of an open transport. Dropping `outbound` closes the connection.
pub struct TransportHandle {
  pub outbound: UnboundedSender<String>,
  pub events: UnboundedReceiver<TransportEvent>,
}

/// Opens transports to the server.
#[async_trait]
pub trait Connection: Send + Sync {
  /// Opens a new transport to `url`. Returning `Ok` is the transport-open event.
  async fn dial(&self, url: &str) -> Result<TransportHandle, DerivError>;
}

/// WebSocket transport over tokio-tungstenite.
#[derive(Debug, Default, Clone)]
pub struct WsConnection;

impl WsConnection {
  pub fn new() -> Self {
    WsConnection
  }
}

#[async_trait]
impl Connection for WsConnection {
  async fn dial(&self, url: &str) -> Result<TransportHandle, DerivError> {
    info!("Connecting to {}", url);
    let (ws, _response) = connect_async(url).await?;
    info!("WebSocket open: {}", url);
    let (mut sink, mut stream) = ws.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<Message>();
    let (event_tx, event_rx) = mpsc::unbounded_channel::<TransportEvent>();

    // Writer: application frames plus pongs queued by the reader.
    let writer_events = event_tx.clone();
    tokio::spawn(async move {
      loop {
        let msg = tokio::select! {
          text = out_rx.recv() => match text {
            Some(text) => Message::Text(text),
            None => break,
          },
          ctrl = ctrl_rx.recv() => match ctrl {
            Some(msg) => msg,
            None => break,
          },
        };
        if let Err(e) = sink.send(msg).await {
          warn!("WebSocket write failed: {}", e);
          let _ = writer_events.send(TransportEvent::Error(e.to_string()));
          return;
        }
      }
      debug!("WebSocket writer finished, closing sink.");
      if let Err(e) = sink.close().await {
        debug!("Error closing WebSocket sink: {}", e);
      }
    });

    tokio::spawn(async move {
      while let Some(msg) = stream.next().await {
        let forwarded = match msg {
          Ok(Message::Text(text)) => event_tx.send(TransportEvent::Message(text)),
          Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
            Ok(text) => event_tx.send(TransportEvent::Message(text)),
            Err(e) => {
              warn!("Dropping non-UTF-8 binary frame: {}", e);
              Ok(())
            }
          },
          Ok(Message::Ping(payload)) => {
            trace!("Ping received, queueing pong.");
            let _ = ctrl_tx.send(Message::Pong(payload));
            Ok(())
          }
          Ok(Message::Close(frame)) => {
            let reason = frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
            info!("WebSocket closed by peer: {:?}", reason);
            let _ = event_tx.send(TransportEvent::Closed(reason));
            return;
          }
          Ok(_) => Ok(()),
          Err(e) => {
            error!("WebSocket read error: {}", e);
            let _ = event_tx.send(TransportEvent::Error(e.to_string()));
            return;
          }
        };
        if forwarded.is_err() {
          debug!("Transport event receiver dropped; stopping reader.");
          return;
        }
      }
      let _ = event_tx.send(TransportEvent::Closed(None));
    });

    Ok(TransportHandle { outbound: out_tx, events: event_rx })
  }
}

/// Internal send primitive shared by every component.
///
/// Holds the outbound half of the current transport. Sends fail with
/// [`DerivError::NotConnected`] while no transport is attached; they never block or queue.
/// Also hands out client request ids.
pub struct MessageBroker {
  outbound: Mutex<Option<UnboundedSender<String>>>,
  next_req_id: AtomicU64,
}

impl Default for MessageBroker {
  fn default() -> Self {
    Self::new()
  }
}

impl MessageBroker {
  pub fn new() -> Self {
    MessageBroker { outbound: Mutex::new(None), next_req_id: AtomicU64::new(1) }
  }

  pub(crate) fn attach(&self, outbound: UnboundedSender<String>) {
    *self.outbound.lock() = Some(outbound);
  }

  /// Drops the outbound half, which closes the transport. Returns whether one was attached.
  pub(crate) fn detach(&self) -> bool {
    self.outbound.lock().take().is_some()
  }

  pub fn is_open(&self) -> bool {
    self.outbound.lock().as_ref().map_or(false, |tx| !tx.is_closed())
  }

  pub fn next_request_id(&self) -> u64 {
    self.next_req_id.fetch_add(1, Ordering::SeqCst)
  }

  pub fn send(&self, frame: &Value) -> Result<(), DerivError> {
    self.send_text(frame.to_string())
  }

  pub fn send_text(&self, text: String) -> Result<(), DerivError> {
    let guard = self.outbound.lock();
    let tx = guard.as_ref().ok_or(DerivError::NotConnected)?;
    trace!("-> {}", text);
    tx.send(text).map_err(|_| DerivError::NotConnected)
  }
}
