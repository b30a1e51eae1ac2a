// derivws/src/account.rs
// Account data structures for the Deriv API

#![allow(unused_variables)] // For default implementations

use chrono::{DateTime, Utc};

pub use crate::protocol_decoder::{OpenContract, PortfolioEntry};

/// Identity and balance of the authorized account.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountInfo {
  /// Login id, e.g. `CR123456` (real) or `VRTC123456` (virtual).
  pub login_id: String,
  pub currency: String,
  pub balance: f64,
  /// When the cache last changed any field of this record.
  pub updated_at: DateTime<Utc>,
}

impl AccountInfo {
  pub fn new(login_id: &str, currency: &str, balance: f64) -> Self {
    AccountInfo {
      login_id: login_id.to_string(),
      currency: currency.to_string(),
      balance,
      updated_at: Utc::now(),
    }
  }

  /// Virtual (demo) accounts have a `VR` login prefix.
  pub fn is_virtual(&self) -> bool {
    self.login_id.starts_with("VR")
  }
}

/// Aggregates over the cached contracts. All zero while no account is authorized.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AccountStats {
  /// Sum of `profit` over open-contract snapshots that report one.
  pub total_profit: f64,
  /// Sum of buy prices over every tracked contract.
  pub total_stake: f64,
  /// Sold contracts with positive profit.
  pub wins: usize,
  /// Distinct contracts ever listed in a portfolio response.
  pub contracts_seen: usize,
  /// `wins / contracts_seen`, in `[0, 1]`.
  pub win_rate: f64,
  /// Portfolio entries not yet marked sold.
  pub active_count: usize,
}

/// Receives account cache changes.
pub trait AccountObserver: Send + Sync {
  /// Called after authorization and on every balance change.
  fn on_account_update(&self, info: &AccountInfo) {}
  /// Called when the portfolio list is replaced.
  fn on_portfolio_update(&self, entries: &[PortfolioEntry]) {}
  /// Called on every open-contract snapshot.
  fn on_contract_update(&self, contract: &OpenContract) {}
  /// Called when the cache is cleared (connection lost or explicit reset).
  fn on_account_reset(&self) {}
}
