// derivws/src/client.rs

use crate::account::{AccountInfo, AccountObserver, AccountStats, OpenContract, PortfolioEntry};
use crate::account_manager::AccountManager;
use crate::base::{ConnectionState, DerivError};
use crate::config::{validate_app_id, ClientConfig};
use crate::conn::{Connection, MessageBroker, WsConnection};
use crate::conn_manager::ConnectionManager;
use crate::handler::MessageHandler;
use crate::observer::{ConnectionObserver, MessageObserver, ObserverId, StreamObserver};
use crate::protocol_decoder::{self, BuyReceipt, Candle, ProposalQuote};
use crate::protocol_encoder::{self, ProposalRequest};
use crate::request::EchoMatcher;
use crate::settings::{MemorySettings, SettingsStore, KEY_API_TOKEN, KEY_APP_ID};
use crate::stream_subscription::StreamSubscription;
use crate::subscription::{StreamKind, SubscriptionInfo, SubscriptionKey};
use log::{debug, info, warn};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Client for the Deriv WebSocket API.
///
/// Owns one connection and everything scoped to it: the subscription registry, pending requests
/// and the account cache. Instances are independent. Dropping the client disconnects it.
pub struct DerivClient {
  conn_mgr: Arc<ConnectionManager>,
  handler: MessageHandler,
  settings: Arc<dyn SettingsStore>,
}

impl DerivClient {
  /// A client that dials the real endpoint and keeps settings in memory.
  pub fn new(config: ClientConfig) -> Self {
    Self::build(config, Arc::new(WsConnection::new()), Arc::new(MemorySettings::new()))
  }

  /// A client over a caller-supplied transport, e.g. [`MockConnection`](crate::conn_mock::MockConnection).
  pub fn with_connection(config: ClientConfig, connection: Arc<dyn Connection>) -> Self {
    Self::build(config, connection, Arc::new(MemorySettings::new()))
  }

  /// A client whose credential and app id are loaded from, and saved to, `settings`.
  /// Stored values take precedence over `config`.
  pub fn with_settings(
    mut config: ClientConfig,
    connection: Arc<dyn Connection>,
    settings: Arc<dyn SettingsStore>,
  ) -> Result<Self, DerivError> {
    if let Some(token) = settings.get(KEY_API_TOKEN)? {
      debug!("Using stored API token.");
      config.api_token = Some(token);
    }
    if let Some(app_id) = settings.get(KEY_APP_ID)? {
      validate_app_id(&app_id)?;
      debug!("Using stored app id {}.", app_id);
      config.app_id = app_id;
    }
    Ok(Self::build(config, connection, settings))
  }

  fn build(config: ClientConfig, connection: Arc<dyn Connection>, settings: Arc<dyn SettingsStore>) -> Self {
    let handler = MessageHandler::new(Arc::new(MessageBroker::new()));
    let conn_mgr = ConnectionManager::new(config, connection, handler.clone());
    DerivClient { conn_mgr, handler, settings }
  }

  pub fn config(&self) -> ClientConfig {
    self.conn_mgr.config()
  }

  pub fn account(&self) -> Arc<AccountManager> {
    self.handler.account.clone()
  }

  // --- Connection ---

  /// Starts connecting in the background. Must be called inside a Tokio runtime.
  pub fn connect(&self) -> Result<(), DerivError> {
    self.conn_mgr.connect()
  }

  /// Connects after automatic reconnection has given up, with a fresh attempt budget.
  pub fn manual_connect(&self) -> Result<(), DerivError> {
    self.conn_mgr.manual_connect()
  }

  pub fn disconnect(&self) {
    self.conn_mgr.disconnect()
  }

  pub fn is_connected(&self) -> bool {
    self.conn_mgr.is_connected()
  }

  pub fn connection_state(&self) -> ConnectionState {
    self.conn_mgr.state()
  }

  /// Waits until the connection is usable, or fails with [`DerivError::Timeout`].
  pub async fn wait_connected(&self, timeout: Duration) -> Result<(), DerivError> {
    let notify = Arc::new(Notify::new());
    let n = notify.clone();
    let id = self.conn_mgr.add_observer(Arc::new(move |connected: bool| {
      if connected {
        n.notify_one();
      }
    }));
    let result = tokio::time::timeout(timeout, async {
      while !self.is_connected() {
        notify.notified().await;
      }
    })
    .await;
    self.conn_mgr.remove_observer(id);
    result.map_err(|_| DerivError::Timeout(format!("not connected within {:?}", timeout)))
  }

  pub fn add_connection_observer<T: ConnectionObserver + 'static>(&self, observer: T) -> ObserverId {
    self.conn_mgr.add_observer(Arc::new(observer))
  }

  pub fn remove_connection_observer(&self, id: ObserverId) -> bool {
    self.conn_mgr.remove_observer(id)
  }

  // --- Streams ---

  /// Streams ticks for `symbol`. Subscribing again replaces the listener without a new request.
  pub fn subscribe_ticks<L: StreamObserver + 'static>(&self, symbol: &str, listener: L) -> Result<(), DerivError> {
    let key = SubscriptionKey::from_parts(StreamKind::Tick, symbol, None)?;
    self.subscribe_key(key, Arc::new(listener))
  }

  /// Streams candles of `granularity` seconds for `symbol`.
  pub fn subscribe_ohlc<L: StreamObserver + 'static>(
    &self,
    symbol: &str,
    granularity: u32,
    listener: L,
  ) -> Result<(), DerivError> {
    let key = SubscriptionKey::from_parts(StreamKind::Ohlc, symbol, Some(granularity))?;
    self.subscribe_key(key, Arc::new(listener))
  }

  /// Balance pushes. Requires an authorized connection.
  pub fn subscribe_balance<L: StreamObserver + 'static>(&self, listener: L) -> Result<(), DerivError> {
    self.subscribe_key(SubscriptionKey::Balance, Arc::new(listener))
  }

  /// Portfolio listings. Requires an authorized connection.
  pub fn subscribe_portfolio<L: StreamObserver + 'static>(&self, listener: L) -> Result<(), DerivError> {
    self.subscribe_key(SubscriptionKey::Portfolio, Arc::new(listener))
  }

  /// Tracks a contract without a listener; its snapshots feed the account cache only.
  pub fn subscribe_contract(&self, contract_id: u64) -> Result<(), DerivError> {
    let key = SubscriptionKey::Contract(contract_id);
    self.require_authorized(&key)?;
    self.handler.subscriptions.ensure(key.clone(), key.request_frame())?;
    Ok(())
  }

  pub fn subscribe_contract_with<L: StreamObserver + 'static>(&self, contract_id: u64, listener: L) -> Result<(), DerivError> {
    self.subscribe_key(SubscriptionKey::Contract(contract_id), Arc::new(listener))
  }

  /// Subscribes `key` with an already shared listener.
  pub fn subscribe_key(&self, key: SubscriptionKey, listener: Arc<dyn StreamObserver>) -> Result<(), DerivError> {
    self.require_authorized(&key)?;
    let frame = key.request_frame();
    if self.handler.subscriptions.subscribe(key.clone(), frame, Some(listener))? {
      info!("Subscribed to {}.", key);
    }
    Ok(())
  }

  /// Pull-style tick stream. Dropping the handle unsubscribes.
  pub fn stream_ticks(&self, symbol: &str) -> Result<StreamSubscription, DerivError> {
    let key = SubscriptionKey::from_parts(StreamKind::Tick, symbol, None)?;
    StreamSubscription::open(self.handler.subscriptions.clone(), key)
  }

  /// Pull-style candle stream. Dropping the handle unsubscribes.
  pub fn stream_ohlc(&self, symbol: &str, granularity: u32) -> Result<StreamSubscription, DerivError> {
    let key = SubscriptionKey::from_parts(StreamKind::Ohlc, symbol, Some(granularity))?;
    StreamSubscription::open(self.handler.subscriptions.clone(), key)
  }

  /// Cancels a stream. `symbol_or_id` is the symbol, or the contract id for contract streams;
  /// `granularity` is only used for OHLC. Returns false if nothing was subscribed.
  pub fn unsubscribe(&self, kind: StreamKind, symbol_or_id: &str, granularity: Option<u32>) -> Result<bool, DerivError> {
    let key = SubscriptionKey::from_parts(kind, symbol_or_id, granularity)?;
    Ok(self.unsubscribe_key(&key))
  }

  pub fn unsubscribe_key(&self, key: &SubscriptionKey) -> bool {
    self.handler.subscriptions.unsubscribe(key)
  }

  pub fn subscription_info(&self, key: &SubscriptionKey) -> Option<SubscriptionInfo> {
    self.handler.subscriptions.info(key)
  }

  pub fn subscriptions(&self) -> Vec<SubscriptionKey> {
    self.handler.subscriptions.keys()
  }

  fn require_authorized(&self, key: &SubscriptionKey) -> Result<(), DerivError> {
    if key.requires_authorization() && !self.handler.account.is_authorized() {
      return Err(DerivError::InvalidParameter(format!("{} requires an authorized connection", key)));
    }
    Ok(())
  }

  // --- Requests ---

  /// Sends `frame` as a correlated request and returns the raw response.
  pub async fn request(&self, frame: Value) -> Result<Value, DerivError> {
    let timeout = self.conn_mgr.config().request_timeout;
    self.handler.requests.request(frame, None, timeout).await
  }

  async fn request_matching(&self, frame: Value, matcher: EchoMatcher) -> Result<Value, DerivError> {
    let timeout = self.conn_mgr.config().request_timeout;
    self.handler.requests.request(frame, Some(matcher), timeout).await
  }

  /// The last `count` candles of `granularity` seconds for `symbol`, oldest first.
  /// Public market data; authorization is not needed.
  pub async fn get_candles(&self, symbol: &str, granularity: u32, count: u32) -> Result<Vec<Candle>, DerivError> {
    let frame = protocol_encoder::candles(symbol, granularity, count)?;
    let matcher = EchoMatcher::from_request("candles", &frame, &["ticks_history", "granularity", "count"]);
    let response = self.request_matching(frame, matcher).await?;
    let candles = protocol_decoder::candles(&response)?;
    debug!("Received {} candle(s) for {}.", candles.len(), symbol);
    Ok(candles)
  }

  /// Prices a contract. The returned quote id is what [`buy`](Self::buy) takes.
  pub async fn proposal(&self, request: &ProposalRequest) -> Result<ProposalQuote, DerivError> {
    let frame = protocol_encoder::proposal(request)?;
    let matcher = EchoMatcher::from_request("proposal", &frame, &["symbol", "contract_type", "amount", "duration"]);
    let response = self.request_matching(frame, matcher).await?;
    protocol_decoder::payload(&response, "proposal")
  }

  /// Buys a priced proposal for at most `max_price`, then tracks the new contract.
  pub async fn buy(&self, proposal_id: &str, max_price: f64) -> Result<BuyReceipt, DerivError> {
    if proposal_id.is_empty() {
      return Err(DerivError::InvalidParameter("proposal id must not be empty".to_string()));
    }
    let frame = protocol_encoder::buy(proposal_id, max_price);
    let matcher = EchoMatcher::from_request("buy", &frame, &["buy"]);
    let response = self.request_matching(frame, matcher).await?;
    let receipt: BuyReceipt = protocol_decoder::payload(&response, "buy")?;
    info!("Bought contract {} for {:.2}.", receipt.contract_id, receipt.buy_price);

    let key = SubscriptionKey::Contract(receipt.contract_id);
    if let Err(e) = self.handler.subscriptions.ensure(key.clone(), key.request_frame()) {
      warn!("Could not track contract {}: {}", receipt.contract_id, e);
    }
    if let Err(e) = self.handler.broker.send(&protocol_encoder::portfolio()) {
      warn!("Could not refresh portfolio: {}", e);
    }
    Ok(receipt)
  }

  // --- Raw traffic ---

  /// Writes a raw frame. Returns false when not connected.
  pub fn send(&self, raw_frame: &str) -> bool {
    match self.handler.broker.send_text(raw_frame.to_string()) {
      Ok(()) => true,
      Err(e) => {
        debug!("Raw send failed: {}", e);
        false
      }
    }
  }

  pub fn add_message_observer<T: MessageObserver + 'static>(&self, observer: T) -> ObserverId {
    self.handler.messages.add(Arc::new(observer))
  }

  pub fn remove_message_observer(&self, id: ObserverId) -> bool {
    self.handler.messages.remove(id)
  }

  // --- Account ---

  pub fn get_account_info(&self) -> Option<AccountInfo> {
    self.handler.account.get_account_info()
  }

  pub fn get_balance(&self) -> Option<f64> {
    self.handler.account.get_balance()
  }

  pub fn get_portfolio(&self) -> Vec<PortfolioEntry> {
    self.handler.account.get_portfolio()
  }

  pub fn get_open_contracts(&self) -> Vec<OpenContract> {
    self.handler.account.get_open_contracts()
  }

  pub fn get_total_profit_loss(&self) -> f64 {
    self.handler.account.get_total_profit_loss()
  }

  pub fn get_account_stats(&self) -> AccountStats {
    self.handler.account.stats()
  }

  pub fn add_account_observer<T: AccountObserver + 'static>(&self, observer: T) -> ObserverId {
    self.handler.account.add_observer(observer)
  }

  pub fn remove_account_observer(&self, id: ObserverId) -> bool {
    self.handler.account.remove_observer(id)
  }

  // --- Settings ---

  /// Stores the API token (or clears it with `None`). Used from the next connect on.
  pub fn set_credential(&self, token: Option<&str>) -> Result<(), DerivError> {
    let token = token.map(str::trim).filter(|t| !t.is_empty());
    match token {
      Some(token) => self.settings.set(KEY_API_TOKEN, token)?,
      None => self.settings.remove(KEY_API_TOKEN)?,
    }
    self.conn_mgr.set_api_token(token.map(str::to_string));
    info!("API token {}.", if token.is_some() { "updated" } else { "cleared" });
    Ok(())
  }

  /// Stores the application id. Used from the next connect on.
  pub fn set_app_id(&self, app_id: &str) -> Result<(), DerivError> {
    validate_app_id(app_id)?;
    self.settings.set(KEY_APP_ID, app_id)?;
    self.conn_mgr.set_app_id(app_id.to_string());
    info!("App id set to {}.", app_id);
    Ok(())
  }
}

impl Drop for DerivClient {
  fn drop(&mut self) {
    self.conn_mgr.disconnect();
  }
}
