// derivws/src/conn_manager.rs

//! Connection lifecycle: connect, authorize, detect loss, back off and reconnect.
//!
//! ```text
//! Disconnected --connect()--> Connecting --open--> Connected --token--> Authorizing --ack--> Ready
//!                                                  Connected --no token-----------------> Ready
//! any --close | error | connect timeout--> Disconnected (+ scheduled reconnect)
//! any --disconnect()--> Closing --> Disconnected (no reconnect)
//! ```
//!
//! The manager owns the transport handle and every timer (connect timeout, reconnect backoff,
//! keepalive). Each transport gets a generation number; events from an older generation are
//! discarded, so a late close from a replaced transport cannot tear down the current one.

use crate::base::{ConnectionState, DerivError};
use crate::config::ClientConfig;
use crate::conn::{Connection, TransportEvent, TransportHandle};
use crate::handler::MessageHandler;
use crate::message_parser::{self, Routed};
use crate::observer::{ConnectionObserver, ObserverId, ObserverRegistry};
use crate::protocol_encoder;
use crate::subscription::SubscriptionKey;

use log::{debug, error, info, trace, warn};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

#[derive(Default)]
struct Tasks {
  connect: Option<JoinHandle<()>>,
  reconnect: Option<JoinHandle<()>>,
  keepalive: Option<JoinHandle<()>>,
  reader: Option<JoinHandle<()>>,
}

impl Tasks {
  fn abort(slot: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = slot.take() {
      handle.abort();
    }
  }

  // Everything tied to the current transport. The reconnect timer is handled separately.
  fn cancel_transport(&mut self) {
    Self::abort(&mut self.connect);
    Self::abort(&mut self.keepalive);
    Self::abort(&mut self.reader);
  }

  fn cancel_all(&mut self) {
    self.cancel_transport();
    Self::abort(&mut self.reconnect);
  }
}

struct Lifecycle {
  state: ConnectionState,
  generation: u64,
  // Reconnect attempts since the last successful open.
  attempts: u32,
  exhausted: bool,
  tasks: Tasks,
}

pub struct ConnectionManager {
  config: RwLock<ClientConfig>,
  connection: Arc<dyn Connection>,
  handler: MessageHandler,
  observers: ObserverRegistry<dyn ConnectionObserver>,
  connected: AtomicBool,
  lifecycle: Mutex<Lifecycle>,
  self_ref: Weak<ConnectionManager>,
}

impl ConnectionManager {
  pub fn new(config: ClientConfig, connection: Arc<dyn Connection>, handler: MessageHandler) -> Arc<Self> {
    Arc::new_cyclic(|self_ref| ConnectionManager {
      config: RwLock::new(config),
      connection,
      handler,
      observers: ObserverRegistry::new(),
      connected: AtomicBool::new(false),
      lifecycle: Mutex::new(Lifecycle {
        state: ConnectionState::Disconnected,
        generation: 0,
        attempts: 0,
        exhausted: false,
        tasks: Tasks::default(),
      }),
      self_ref: self_ref.clone(),
    })
  }

  pub fn handler(&self) -> &MessageHandler {
    &self.handler
  }

  pub fn state(&self) -> ConnectionState {
    self.lifecycle.lock().state
  }

  /// True once the connection is usable: authorized, or open in market-data-only mode.
  pub fn is_connected(&self) -> bool {
    self.connected.load(Ordering::SeqCst)
  }

  /// Reconnect attempts made since the last successful open.
  pub fn reconnect_attempts(&self) -> u32 {
    self.lifecycle.lock().attempts
  }

  /// Whether automatic reconnection has given up.
  pub fn is_exhausted(&self) -> bool {
    self.lifecycle.lock().exhausted
  }

  pub fn config(&self) -> ClientConfig {
    self.config.read().clone()
  }

  /// Takes effect on the next connect.
  pub fn set_api_token(&self, token: Option<String>) {
    self.config.write().api_token = token;
  }

  /// Takes effect on the next connect.
  pub fn set_app_id(&self, app_id: String) {
    self.config.write().app_id = app_id;
  }

  // --- Observers ---

  /// Registers `observer` and immediately reports the current connectivity to it.
  pub fn add_observer(&self, observer: Arc<dyn ConnectionObserver>) -> ObserverId {
    let id = self.observers.add(observer.clone());
    observer.on_connectivity_change(self.is_connected());
    id
  }

  pub fn remove_observer(&self, id: ObserverId) -> bool {
    self.observers.remove(id)
  }

  fn set_connected(&self, connected: bool) {
    let previous = self.connected.swap(connected, Ordering::SeqCst);
    if previous == connected {
      return;
    }
    info!("Connectivity changed: connected={}", connected);
    for observer in self.observers.snapshot() {
      observer.on_connectivity_change(connected);
    }
  }

  // --- Public lifecycle operations ---

  /// Starts connecting unless already connecting or open. Never waits for the outcome;
  /// watch connection observers for that. Must be called inside a Tokio runtime.
  pub fn connect(&self) -> Result<(), DerivError> {
    let runtime = current_runtime()?;
    let mut lifecycle = self.lifecycle.lock();
    if lifecycle.state == ConnectionState::Connecting || lifecycle.state.is_open() {
      debug!("connect(): already {}", lifecycle.state);
      return Ok(());
    }
    self.start_connect(&mut lifecycle, &runtime);
    Ok(())
  }

  /// Resets the reconnect budget and connects. Recovers from an exhausted state.
  pub fn manual_connect(&self) -> Result<(), DerivError> {
    {
      let mut lifecycle = self.lifecycle.lock();
      lifecycle.attempts = 0;
      lifecycle.exhausted = false;
    }
    info!("Manual connect requested.");
    self.connect()
  }

  /// Closes the connection without reconnecting. Idempotent.
  ///
  /// Subscriptions stay registered (demoted to pending) and are reissued by the next connect.
  pub fn disconnect(&self) {
    {
      let mut lifecycle = self.lifecycle.lock();
      Tasks::abort(&mut lifecycle.tasks.reconnect);
      lifecycle.attempts = 0;
      if lifecycle.state == ConnectionState::Disconnected {
        debug!("disconnect(): already disconnected");
        return;
      }
      info!("Disconnecting from {} state.", lifecycle.state);
      lifecycle.state = ConnectionState::Closing;
      lifecycle.generation += 1;
      lifecycle.tasks.cancel_transport();
      self.handler.broker.detach();
    }

    self.invalidate();

    let mut lifecycle = self.lifecycle.lock();
    if lifecycle.state == ConnectionState::Closing {
      lifecycle.state = ConnectionState::Disconnected;
    }
  }

  // --- Internals ---

  fn start_connect(&self, lifecycle: &mut Lifecycle, runtime: &Handle) {
    Tasks::abort(&mut lifecycle.tasks.reconnect);
    Tasks::abort(&mut lifecycle.tasks.connect);
    lifecycle.generation += 1;
    lifecycle.state = ConnectionState::Connecting;
    let generation = lifecycle.generation;

    let (url, timeout) = {
      let config = self.config.read();
      (config.url(), config.connect_timeout)
    };
    info!("Connecting to {} (generation {}).", url, generation);

    let connection = self.connection.clone();
    let weak = self.self_ref.clone();
    lifecycle.tasks.connect = Some(runtime.spawn(async move {
      let result = match tokio::time::timeout(timeout, connection.dial(&url)).await {
        Ok(result) => result,
        Err(_) => Err(DerivError::Timeout(format!("connection not established within {:?}", timeout))),
      };
      let Some(manager) = weak.upgrade() else { return };
      match result {
        Ok(handle) => manager.on_open(generation, handle),
        Err(e) => manager.on_transport_down(generation, &e.to_string()),
      }
    }));
  }

  fn on_open(&self, generation: u64, handle: TransportHandle) {
    let mut lifecycle = self.lifecycle.lock();
    if lifecycle.generation != generation || lifecycle.state != ConnectionState::Connecting {
      debug!("Dropping stale transport (generation {}).", generation);
      return;
    }
    // This runs on the connect task itself, so release it rather than abort it.
    lifecycle.tasks.connect = None;
    lifecycle.attempts = 0;
    lifecycle.exhausted = false;
    lifecycle.state = ConnectionState::Connected;
    self.handler.broker.attach(handle.outbound);
    info!("Transport open (generation {}).", generation);

    lifecycle.tasks.reader = Some(tokio::spawn(read_loop(self.self_ref.clone(), generation, handle.events)));
    lifecycle.tasks.keepalive = self.spawn_keepalive();

    let token = self.config.read().api_token.clone();
    match token {
      Some(token) => {
        lifecycle.state = ConnectionState::Authorizing;
        drop(lifecycle);
        debug!("Sending authorize.");
        if let Err(e) = self.handler.broker.send(&protocol_encoder::authorize(&token)) {
          warn!("Could not send authorize: {}", e);
        }
      }
      None => {
        lifecycle.state = ConnectionState::Ready;
        drop(lifecycle);
        info!("No API token configured; market data only.");
        self.on_usable(false);
      }
    }
  }

  fn on_authorized(&self, generation: u64) {
    {
      let mut lifecycle = self.lifecycle.lock();
      if lifecycle.generation != generation {
        return;
      }
      if lifecycle.state == ConnectionState::Authorizing {
        lifecycle.state = ConnectionState::Ready;
      }
    }
    self.on_usable(true);
  }

  fn on_authorize_failed(&self, generation: u64, error: DerivError) {
    {
      let mut lifecycle = self.lifecycle.lock();
      if lifecycle.generation != generation {
        return;
      }
      if lifecycle.state == ConnectionState::Authorizing {
        lifecycle.state = ConnectionState::Connected;
      }
    }
    warn!("Authorization failed ({}); continuing with market data only.", error);
    self.on_usable(false);
  }

  // The connection can carry requests: restore streams and report connectivity.
  fn on_usable(&self, authorized: bool) {
    let subscriptions = &self.handler.subscriptions;
    if authorized {
      for key in [SubscriptionKey::Balance, SubscriptionKey::Portfolio] {
        let frame = key.request_frame();
        if let Err(e) = subscriptions.ensure(key.clone(), frame) {
          warn!("Could not subscribe to {}: {}", key, e);
        }
      }
    }
    subscriptions.resubscribe(authorized);
    self.set_connected(true);
  }

  fn handle_frame(&self, generation: u64, text: &str) {
    if self.lifecycle.lock().generation != generation {
      trace!("Ignoring frame from stale transport.");
      return;
    }
    trace!("<- {}", text);
    let frame: Value = match serde_json::from_str(text) {
      Ok(frame) => frame,
      Err(e) => {
        warn!("Unparseable frame ({}): {}", e, text);
        return;
      }
    };
    match message_parser::process_message(&self.handler, &frame) {
      Ok(Routed::Authorized) => self.on_authorized(generation),
      Ok(Routed::AuthorizeFailed(error)) => self.on_authorize_failed(generation, error),
      Ok(_) => {}
      Err(e) => debug!("Frame not routed: {}", e),
    }
  }

  fn on_transport_down(&self, generation: u64, reason: &str) {
    {
      let mut lifecycle = self.lifecycle.lock();
      if lifecycle.generation != generation || lifecycle.state == ConnectionState::Disconnected {
        return;
      }
      warn!("Connection down while {}: {}", lifecycle.state, reason);
      lifecycle.tasks.cancel_transport();
      self.handler.broker.detach();
      lifecycle.state = ConnectionState::Disconnected;
    }
    self.invalidate();
    self.schedule_reconnect(generation);
  }

  // Server-side state died with the transport.
  fn invalidate(&self) {
    let demoted = self.handler.subscriptions.on_connection_lost();
    let failed = self.handler.requests.fail_all(DerivError::ConnectionLost);
    self.handler.account.clear();
    debug!("Invalidated {} subscription(s) and {} request(s).", demoted, failed);
    self.set_connected(false);
  }

  fn schedule_reconnect(&self, generation: u64) {
    let runtime = match current_runtime() {
      Ok(runtime) => runtime,
      Err(e) => {
        warn!("Cannot schedule reconnect: {}", e);
        return;
      }
    };
    let policy = self.config.read().reconnect.clone();

    let exhausted_after = {
      let mut lifecycle = self.lifecycle.lock();
      if lifecycle.generation != generation || lifecycle.state != ConnectionState::Disconnected {
        return;
      }
      if policy.allows(lifecycle.attempts) {
        lifecycle.attempts += 1;
        let delay = policy.delay_for(lifecycle.attempts);
        info!("Reconnect attempt {}/{} in {:?}.", lifecycle.attempts, policy.max_attempts, delay);
        let weak = self.self_ref.clone();
        Tasks::abort(&mut lifecycle.tasks.reconnect);
        lifecycle.tasks.reconnect = Some(runtime.spawn(async move {
          tokio::time::sleep(delay).await;
          if let Some(manager) = weak.upgrade() {
            manager.fire_reconnect(generation);
          }
        }));
        None
      } else {
        lifecycle.exhausted = true;
        Some(lifecycle.attempts)
      }
    };

    if let Some(attempts) = exhausted_after {
      error!("Giving up after {} reconnect attempt(s); manual_connect() required.", attempts);
      for observer in self.observers.snapshot() {
        observer.on_reconnect_exhausted(attempts);
      }
    }
  }

  fn fire_reconnect(&self, generation: u64) {
    let Ok(runtime) = current_runtime() else { return };
    let mut lifecycle = self.lifecycle.lock();
    if lifecycle.generation != generation || lifecycle.state != ConnectionState::Disconnected {
      return;
    }
    // Running on the reconnect task; release it rather than abort it.
    lifecycle.tasks.reconnect = None;
    self.start_connect(&mut lifecycle, &runtime);
  }

  fn spawn_keepalive(&self) -> Option<JoinHandle<()>> {
    let interval = self.config.read().keepalive_interval.filter(|i| !i.is_zero())?;
    let broker = self.handler.broker.clone();
    Some(tokio::spawn(async move {
      let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
      loop {
        ticker.tick().await;
        if let Err(e) = broker.send(&protocol_encoder::ping()) {
          debug!("Keepalive stopped: {}", e);
          return;
        }
        trace!("Keepalive ping sent.");
      }
    }))
  }
}

impl Drop for ConnectionManager {
  fn drop(&mut self) {
    self.lifecycle.get_mut().tasks.cancel_all();
    self.handler.broker.detach();
  }
}

fn current_runtime() -> Result<Handle, DerivError> {
  Handle::try_current().map_err(|_| DerivError::InternalError("must be called within a Tokio runtime".to_string()))
}

async fn read_loop(manager: Weak<ConnectionManager>, generation: u64, mut events: UnboundedReceiver<TransportEvent>) {
  while let Some(event) = events.recv().await {
    let Some(mgr) = manager.upgrade() else { return };
    match event {
      TransportEvent::Message(text) => mgr.handle_frame(generation, &text),
      TransportEvent::Closed(reason) => {
        let reason = format!("closed by peer ({})", reason.as_deref().unwrap_or("no reason"));
        mgr.on_transport_down(generation, &reason);
        return;
      }
      TransportEvent::Error(e) => {
        mgr.on_transport_down(generation, &e);
        return;
      }
    }
  }
  if let Some(mgr) = manager.upgrade() {
    mgr.on_transport_down(generation, "transport event stream ended");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::ReconnectPolicy;
  use crate::conn::MessageBroker;
  use crate::conn_mock::{DialBehavior, MockConnection};
  use serde_json::json;
  use std::time::Duration;

  fn manager(mock: &MockConnection, token: Option<&str>, max_attempts: u32) -> Arc<ConnectionManager> {
    let config = ClientConfig {
      api_token: token.map(str::to_string),
      keepalive_interval: None,
      reconnect: ReconnectPolicy {
        base_delay: Duration::from_millis(100),
        factor: 2.0,
        max_delay: Duration::from_secs(1),
        max_attempts,
      },
      ..ClientConfig::default()
    };
    ConnectionManager::new(config, Arc::new(mock.clone()), MessageHandler::new(Arc::new(MessageBroker::new())))
  }

  async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_market_data_only_goes_ready() {
    let mock = MockConnection::new();
    let mgr = manager(&mock, None, 3);
    mgr.connect().unwrap();
    assert_eq!(mgr.state(), ConnectionState::Connecting);
    // A second connect while connecting does nothing.
    mgr.connect().unwrap();
    settle().await;
    assert_eq!(mock.dial_count(), 1);
    assert_eq!(mgr.state(), ConnectionState::Ready);
    assert!(mgr.is_connected());
    assert!(mock.sent_with("authorize").is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_keepalive_pings_and_reply_is_pong() {
    let mock = MockConnection::new();
    let config = ClientConfig { keepalive_interval: Some(Duration::from_secs(30)), ..ClientConfig::default() };
    let mgr = ConnectionManager::new(config, Arc::new(mock.clone()), MessageHandler::new(Arc::new(MessageBroker::new())));
    mgr.connect().unwrap();
    settle().await;
    assert_eq!(mgr.state(), ConnectionState::Ready);
    assert!(mock.sent_with("ping").is_empty());

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(mock.sent_with("ping"), vec![json!({"ping": 1})]);

    let reply = json!({"msg_type": "ping", "ping": "pong", "echo_req": {"ping": 1}});
    assert_eq!(message_parser::process_message(mgr.handler(), &reply), Ok(Routed::Pong));
    assert!(mock.push(reply));
    settle().await;
    assert_eq!(mgr.state(), ConnectionState::Ready);
  }

  #[tokio::test(start_paused = true)]
  async fn test_authorize_handshake() {
    let mock = MockConnection::new();
    let mgr = manager(&mock, Some("tok"), 3);
    mgr.connect().unwrap();
    settle().await;
    assert_eq!(mgr.state(), ConnectionState::Authorizing);
    assert!(!mgr.is_connected());
    let auth = mock.sent_with("authorize");
    assert_eq!(auth, vec![json!({"authorize": "tok"})]);

    mock.reply(&auth[0], json!({"msg_type": "authorize", "authorize": {"loginid": "CR9", "currency": "USD", "balance": 5}}));
    settle().await;
    assert_eq!(mgr.state(), ConnectionState::Ready);
    assert!(mgr.is_connected());
    assert_eq!(mock.sent_with("balance").len(), 1);
    assert_eq!(mock.sent_with("portfolio").len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_connect_timeout_counts_as_failure() {
    let mock = MockConnection::new();
    mock.script_dial(DialBehavior::Hang);
    let mgr = manager(&mock, None, 3);
    mgr.connect().unwrap();
    tokio::time::sleep(Duration::from_secs(16)).await;
    // Timed out after 15s, then the first reconnect (100ms) succeeded.
    assert_eq!(mock.dial_count(), 2);
    assert_eq!(mgr.state(), ConnectionState::Ready);
  }

  #[tokio::test(start_paused = true)]
  async fn test_reconnect_budget_exhaustion_and_manual_connect() {
    let mock = MockConnection::new();
    for _ in 0..3 {
      mock.script_dial(DialBehavior::Refuse("refused".to_string()));
    }
    let mgr = manager(&mock, None, 2);
    let exhausted = Arc::new(Mutex::new(None));
    struct Watch(Arc<Mutex<Option<u32>>>);
    impl ConnectionObserver for Watch {
      fn on_connectivity_change(&self, _connected: bool) {}
      fn on_reconnect_exhausted(&self, attempts: u32) {
        *self.0.lock() = Some(attempts);
      }
    }
    mgr.add_observer(Arc::new(Watch(exhausted.clone())));

    mgr.connect().unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(mock.dial_count(), 3);
    assert!(mgr.is_exhausted());
    assert_eq!(*exhausted.lock(), Some(2));
    assert_eq!(mgr.state(), ConnectionState::Disconnected);

    mgr.manual_connect().unwrap();
    settle().await;
    assert_eq!(mock.dial_count(), 4);
    assert!(mgr.is_connected());
    assert!(!mgr.is_exhausted());
  }

  #[tokio::test(start_paused = true)]
  async fn test_disconnect_is_final_and_idempotent() {
    let mock = MockConnection::new();
    let mgr = manager(&mock, None, 3);
    mgr.connect().unwrap();
    settle().await;
    assert!(mgr.is_connected());

    mgr.disconnect();
    assert_eq!(mgr.state(), ConnectionState::Disconnected);
    assert!(!mgr.is_connected());
    mgr.disconnect();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(mock.dial_count(), 1);
    assert!(!mock.is_linked());
  }

  #[tokio::test(start_paused = true)]
  async fn test_peer_close_reconnects_with_backoff() {
    let mock = MockConnection::new();
    let mgr = manager(&mock, None, 5);
    let changes = Arc::new(Mutex::new(Vec::new()));
    let c = changes.clone();
    mgr.add_observer(Arc::new(move |connected: bool| c.lock().push(connected)));

    mgr.connect().unwrap();
    settle().await;
    mock.close(Some("server restart"));
    settle().await;
    assert_eq!(mgr.state(), ConnectionState::Disconnected);
    assert_eq!(mgr.reconnect_attempts(), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(mock.dial_count(), 2);
    assert!(mgr.is_connected());
    assert_eq!(mgr.reconnect_attempts(), 0);
    // Initial report, connect, loss, reconnect.
    assert_eq!(*changes.lock(), vec![false, true, false, true]);
  }
}
