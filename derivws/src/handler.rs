// derivws/src/handler.rs
// The set of components an inbound frame can be dispatched to.

use crate::account_manager::AccountManager;
use crate::conn::MessageBroker;
use crate::observer::{MessageObserver, ObserverRegistry};
use crate::request::RequestCorrelator;
use crate::subscription::SubscriptionRegistry;
use std::sync::Arc;

/// Dispatch targets of the message router. All share one [`MessageBroker`].
#[derive(Clone)]
pub struct MessageHandler {
  pub broker: Arc<MessageBroker>,
  pub subscriptions: Arc<SubscriptionRegistry>,
  pub requests: Arc<RequestCorrelator>,
  pub account: Arc<AccountManager>,
  pub messages: Arc<ObserverRegistry<dyn MessageObserver>>,
}

impl MessageHandler {
  pub fn new(broker: Arc<MessageBroker>) -> Self {
    MessageHandler {
      subscriptions: Arc::new(SubscriptionRegistry::new(broker.clone())),
      requests: Arc::new(RequestCorrelator::new(broker.clone())),
      account: Arc::new(AccountManager::new()),
      messages: Arc::new(ObserverRegistry::new()),
      broker,
    }
  }
}
