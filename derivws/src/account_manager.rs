// derivws/src/account_manager.rs

//! Connection-scoped account state: identity, balance, portfolio and open-contract snapshots.
//!
//! The `AccountManager` is written only by the message router and read by anyone. It is filled
//! by the `authorize` acknowledgment, kept current by `balance`, `portfolio` and
//! `proposal_open_contract` pushes, and cleared when the connection is lost.
//!
//! # Example
//!
//! ```no_run
//! use derivws::{ClientConfig, DerivClient};
//!
//! # async fn run() -> Result<(), derivws::DerivError> {
//! let client = DerivClient::new(ClientConfig::from_env()?);
//! client.connect()?;
//! // ... once connected and authorized:
//! if let Some(info) = client.get_account_info() {
//!   println!("{} {} {:.2}", info.login_id, info.currency, info.balance);
//! }
//! let stats = client.get_account_stats();
//! println!("P/L {:.2}, win rate {:.0}%", stats.total_profit, stats.win_rate * 100.0);
//! # Ok(())
//! # }
//! ```

use crate::account::{AccountInfo, AccountObserver, AccountStats, OpenContract, PortfolioEntry};
use crate::observer::{ObserverId, ObserverRegistry};
use crate::protocol_decoder::BalanceUpdate;
use chrono::Utc;
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Default)]
struct AccountState {
  info: Option<AccountInfo>,
  portfolio: Vec<PortfolioEntry>,
  open_contracts: HashMap<u64, OpenContract>,
  // Every contract id that has appeared in a portfolio listing this session.
  seen_contracts: HashSet<u64>,
}

#[derive(Default)]
pub struct AccountManager {
  account_state: RwLock<AccountState>,
  observers: ObserverRegistry<dyn AccountObserver>,
}

impl AccountManager {
  pub fn new() -> Self {
    Self::default()
  }

  // --- Writes (router only) ---

  /// Replaces the account record wholesale after (re)authorization.
  pub(crate) fn on_authorized(&self, info: AccountInfo) {
    info!("Authorized as {} ({} {:.2}).", info.login_id, info.currency, info.balance);
    self.account_state.write().info = Some(info.clone());
    for observer in self.observers.snapshot() {
      observer.on_account_update(&info);
    }
  }

  /// Updates the balance in place. Ignored before authorization.
  pub(crate) fn on_balance(&self, update: &BalanceUpdate) -> bool {
    let updated = {
      let mut state = self.account_state.write();
      match state.info.as_mut() {
        Some(info) => {
          info.balance = update.balance;
          info.updated_at = Utc::now();
          Some(info.clone())
        }
        None => None,
      }
    };
    match updated {
      Some(info) => {
        debug!("Balance now {:.2} {}.", info.balance, info.currency);
        for observer in self.observers.snapshot() {
          observer.on_account_update(&info);
        }
        true
      }
      None => {
        warn!("Balance update {:.2} received before authorization; ignored.", update.balance);
        false
      }
    }
  }

  /// Replaces the portfolio list. Returns the ids not previously seen.
  pub(crate) fn on_portfolio(&self, entries: Vec<PortfolioEntry>) -> Vec<u64> {
    let new_ids = {
      let mut state = self.account_state.write();
      let new_ids: Vec<u64> = entries
        .iter()
        .map(|e| e.contract_id)
        .filter(|id| !state.seen_contracts.contains(id))
        .collect();
      state.seen_contracts.extend(new_ids.iter().copied());
      state.portfolio = entries;
      new_ids
    };
    let entries = self.get_portfolio();
    debug!("Portfolio: {} contract(s), {} new.", entries.len(), new_ids.len());
    for observer in self.observers.snapshot() {
      observer.on_portfolio_update(&entries);
    }
    new_ids
  }

  /// Upserts the live snapshot of one contract.
  pub(crate) fn on_open_contract(&self, contract: OpenContract) {
    self.account_state.write().open_contracts.insert(contract.contract_id, contract.clone());
    for observer in self.observers.snapshot() {
      observer.on_contract_update(&contract);
    }
  }

  /// Drops everything. Called when the connection is lost or explicitly reset.
  pub(crate) fn clear(&self) {
    let had_account = {
      let mut state = self.account_state.write();
      let had = state.info.is_some();
      *state = AccountState::default();
      had
    };
    if had_account {
      debug!("Account cache cleared.");
      for observer in self.observers.snapshot() {
        observer.on_account_reset();
      }
    }
  }

  // --- Reads ---

  pub fn is_authorized(&self) -> bool {
    self.account_state.read().info.is_some()
  }

  pub fn get_account_info(&self) -> Option<AccountInfo> {
    self.account_state.read().info.clone()
  }

  pub fn get_balance(&self) -> Option<f64> {
    self.account_state.read().info.as_ref().map(|i| i.balance)
  }

  pub fn get_portfolio(&self) -> Vec<PortfolioEntry> {
    self.account_state.read().portfolio.clone()
  }

  /// Open-contract snapshots ordered by contract id.
  pub fn get_open_contracts(&self) -> Vec<OpenContract> {
    let mut contracts: Vec<OpenContract> = self.account_state.read().open_contracts.values().cloned().collect();
    contracts.sort_by_key(|c| c.contract_id);
    contracts
  }

  pub fn get_open_contract(&self, contract_id: u64) -> Option<OpenContract> {
    self.account_state.read().open_contracts.get(&contract_id).cloned()
  }

  /// Whether a contract is known from a portfolio listing or a contract push.
  pub fn is_tracked(&self, contract_id: u64) -> bool {
    let state = self.account_state.read();
    state.seen_contracts.contains(&contract_id) || state.open_contracts.contains_key(&contract_id)
  }

  pub fn get_total_profit_loss(&self) -> f64 {
    self.stats().total_profit
  }

  /// Folds the cached contracts into aggregate statistics.
  pub fn stats(&self) -> AccountStats {
    let state = self.account_state.read();
    if state.info.is_none() {
      return AccountStats::default();
    }

    let total_profit: f64 = state.open_contracts.values().filter_map(|c| c.profit).sum();

    // A snapshot supersedes the portfolio entry for the same contract.
    let listed_stake = |id: u64| state.portfolio.iter().find(|e| e.contract_id == id).map(|e| e.buy_price);
    let snapshot_stake: f64 = state
      .open_contracts
      .values()
      .map(|c| c.buy_price.or_else(|| listed_stake(c.contract_id)).unwrap_or(0.0))
      .sum();
    let unsnapshotted_stake: f64 = state
      .portfolio
      .iter()
      .filter(|e| !state.open_contracts.contains_key(&e.contract_id))
      .map(|e| e.buy_price)
      .sum();

    // Wins are counted over the same set as `contracts_seen`, keeping the rate within [0, 1].
    let wins = state
      .open_contracts
      .values()
      .filter(|c| state.seen_contracts.contains(&c.contract_id))
      .filter(|c| c.is_sold && c.profit.map_or(false, |p| p > 0.0))
      .count();
    let contracts_seen = state.seen_contracts.len();
    let win_rate = if contracts_seen == 0 { 0.0 } else { wins as f64 / contracts_seen as f64 };

    let active_count = state
      .portfolio
      .iter()
      .filter(|e| state.open_contracts.get(&e.contract_id).map_or(true, |c| !c.is_sold))
      .count();

    AccountStats {
      total_profit,
      total_stake: snapshot_stake + unsnapshotted_stake,
      wins,
      contracts_seen,
      win_rate,
      active_count,
    }
  }

  // --- Observers ---

  pub fn add_observer<T: AccountObserver + 'static>(&self, observer: T) -> ObserverId {
    let id = self.observers.add(Arc::new(observer));
    debug!("Added account observer {:?}", id);
    id
  }

  pub fn remove_observer(&self, id: ObserverId) -> bool {
    self.observers.remove(id)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use parking_lot::Mutex;

  fn entry(id: u64, buy_price: f64) -> PortfolioEntry {
    PortfolioEntry {
      contract_id: id,
      buy_price,
      symbol: "R_10".to_string(),
      contract_type: "CALL".to_string(),
      payout: None,
      purchase_time: None,
      expiry_time: None,
      longcode: None,
    }
  }

  fn snapshot(id: u64, profit: Option<f64>, is_sold: bool, buy_price: Option<f64>) -> OpenContract {
    OpenContract {
      contract_id: id,
      profit,
      buy_price,
      bid_price: None,
      current_spot: None,
      is_sold,
      is_expired: is_sold,
      status: Some(if is_sold { "sold" } else { "open" }.to_string()),
      underlying: Some("R_10".to_string()),
      contract_type: Some("CALL".to_string()),
    }
  }

  #[test]
  fn test_balance_updates_only_balance() {
    let mgr = AccountManager::new();
    mgr.on_authorized(AccountInfo::new("CR123", "USD", 1000.0));
    let update = BalanceUpdate { balance: 950.0, currency: Some("USD".to_string()), loginid: Some("CR123".to_string()) };
    assert!(mgr.on_balance(&update));

    let info = mgr.get_account_info().unwrap();
    assert_eq!(info.login_id, "CR123");
    assert_eq!(info.currency, "USD");
    assert_eq!(info.balance, 950.0);
    assert_eq!(mgr.get_balance(), Some(950.0));
  }

  #[test]
  fn test_balance_before_authorize_is_ignored() {
    let mgr = AccountManager::new();
    let update = BalanceUpdate { balance: 1.0, currency: None, loginid: None };
    assert!(!mgr.on_balance(&update));
    assert_eq!(mgr.get_account_info(), None);
  }

  #[test]
  fn test_stats_zeroed_without_account() {
    let mgr = AccountManager::new();
    mgr.on_portfolio(vec![entry(1, 10.0)]);
    mgr.on_open_contract(snapshot(1, Some(5.0), true, Some(10.0)));
    assert_eq!(mgr.stats(), AccountStats::default());
    assert_eq!(mgr.get_total_profit_loss(), 0.0);
  }

  #[test]
  fn test_stats_fold() {
    let mgr = AccountManager::new();
    mgr.on_authorized(AccountInfo::new("CR1", "USD", 100.0));
    assert_eq!(mgr.on_portfolio(vec![entry(1, 10.0), entry(2, 20.0), entry(3, 5.0), entry(4, 8.0)]), vec![1, 2, 3, 4]);
    mgr.on_open_contract(snapshot(1, Some(9.0), true, Some(10.0)));   // win
    mgr.on_open_contract(snapshot(2, Some(-20.0), true, None));       // loss, stake from portfolio
    mgr.on_open_contract(snapshot(3, Some(1.5), false, Some(5.0)));   // open, in profit
    mgr.on_open_contract(snapshot(9, None, false, Some(2.0)));        // not in portfolio

    let stats = mgr.stats();
    assert!((stats.total_profit - (9.0 - 20.0 + 1.5)).abs() < 1e-9);
    assert!((stats.total_stake - (10.0 + 20.0 + 5.0 + 2.0 + 8.0)).abs() < 1e-9);
    assert_eq!(stats.wins, 1);
    assert_eq!(stats.contracts_seen, 4);
    assert!((stats.win_rate - 0.25).abs() < 1e-9);
    // 3 and 4 are still open.
    assert_eq!(stats.active_count, 2);
  }

  #[test]
  fn test_unlisted_wins_do_not_inflate_win_rate() {
    let mgr = AccountManager::new();
    mgr.on_authorized(AccountInfo::new("CR1", "USD", 100.0));
    mgr.on_portfolio(vec![entry(1, 10.0)]);
    mgr.on_open_contract(snapshot(1, Some(2.0), true, Some(10.0)));
    mgr.on_open_contract(snapshot(7, Some(4.0), true, Some(3.0)));
    mgr.on_open_contract(snapshot(8, Some(1.0), true, Some(3.0)));

    let stats = mgr.stats();
    assert_eq!(stats.contracts_seen, 1);
    assert_eq!(stats.wins, 1);
    assert!(stats.win_rate <= 1.0);
    assert!((stats.total_profit - 7.0).abs() < 1e-9);
  }

  #[test]
  fn test_seen_contracts_survive_portfolio_replacement() {
    let mgr = AccountManager::new();
    mgr.on_authorized(AccountInfo::new("CR1", "USD", 100.0));
    mgr.on_portfolio(vec![entry(1, 10.0)]);
    assert_eq!(mgr.on_portfolio(vec![entry(2, 10.0)]), vec![2]);
    assert_eq!(mgr.get_portfolio().len(), 1);
    assert!(mgr.is_tracked(1));
    assert_eq!(mgr.stats().contracts_seen, 2);
  }

  #[test]
  fn test_open_contract_upsert_and_clear() {
    let mgr = AccountManager::new();
    mgr.on_authorized(AccountInfo::new("CR1", "USD", 100.0));
    mgr.on_open_contract(snapshot(7, Some(1.0), false, Some(5.0)));
    mgr.on_open_contract(snapshot(7, Some(2.0), true, Some(5.0)));
    assert_eq!(mgr.get_open_contracts().len(), 1);
    assert_eq!(mgr.get_open_contract(7).unwrap().profit, Some(2.0));

    mgr.clear();
    assert!(!mgr.is_authorized());
    assert!(mgr.get_open_contracts().is_empty());
    assert!(!mgr.is_tracked(7));
  }

  struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
  }

  impl AccountObserver for Recorder {
    fn on_account_update(&self, info: &AccountInfo) {
      self.events.lock().push(format!("account {}", info.balance));
    }
    fn on_account_reset(&self) {
      self.events.lock().push("reset".to_string());
    }
  }

  #[test]
  fn test_observers() {
    let mgr = AccountManager::new();
    let events = Arc::new(Mutex::new(Vec::new()));
    let id = mgr.add_observer(Recorder { events: events.clone() });
    mgr.on_authorized(AccountInfo::new("CR1", "USD", 10.0));
    mgr.on_balance(&BalanceUpdate { balance: 12.5, currency: None, loginid: None });
    mgr.clear();
    mgr.clear();
    assert_eq!(*events.lock(), vec!["account 10", "account 12.5", "reset"]);
    assert!(mgr.remove_observer(id));
  }
}
