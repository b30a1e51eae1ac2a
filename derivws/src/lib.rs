// derivws/src/lib.rs
// Main entry point for the Deriv API library

//! # derivws
//!
//! A streaming client for the Deriv WebSocket API:
//!
//! - Connection lifecycle with authorization, keepalive and backoff reconnection
//! - Deduplicated market-data and account subscriptions that survive reconnects
//! - Correlated request/response calls with timeouts
//! - A connection-scoped account cache with aggregate statistics
//!
//! ```no_run
//! use derivws::{ClientConfig, DerivClient, StreamUpdate, SubscriptionKey};
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), derivws::DerivError> {
//! let client = DerivClient::new(ClientConfig::from_env()?);
//! client.connect()?;
//! client.wait_connected(Duration::from_secs(15)).await?;
//! client.subscribe_ticks("R_100", |key: &SubscriptionKey, update: &StreamUpdate| {
//!   println!("{}: {:?}", key, update);
//! })?;
//! for candle in client.get_candles("R_100", 60, 10).await? {
//!   println!("{} {}", candle.epoch, candle.close);
//! }
//! # Ok(())
//! # }
//! ```

mod base;
mod handler;
mod message_parser;
mod protocol_decoder;
mod protocol_encoder;
mod request;
pub mod account;
pub mod account_manager;
pub mod client;
pub mod config;
pub mod conn;
pub mod conn_manager;
pub mod conn_mock;
pub mod observer;
pub mod settings;
pub mod stream_subscription;
pub mod subscription;

pub use base::{ConnectionState, DerivError};
pub use client::DerivClient;
pub use config::{ClientConfig, ReconnectPolicy};
pub use observer::{ConnectionObserver, MessageObserver, ObserverId, StreamObserver, StreamUpdate};
pub use protocol_decoder::{BalanceUpdate, BuyReceipt, Candle, Ohlc, OpenContract, PortfolioEntry, ProposalQuote, Tick};
pub use protocol_encoder::ProposalRequest;
pub use stream_subscription::{StreamEvent, StreamSubscription};
pub use subscription::{StreamKind, SubscriptionInfo, SubscriptionKey, SubscriptionState};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
