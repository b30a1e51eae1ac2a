// derivws/src/base.rs
// Base types and error definitions for the Deriv WebSocket client

use std::fmt;
use thiserror::Error;

/// Errors that can occur in the Deriv client.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DerivError {
  #[error("Configuration error: {0}")]
  ConfigurationError(String),

  #[error("Connection failed: {0}")]
  ConnectionFailed(String),

  /// The transport dropped while the operation was outstanding.
  #[error("Connection lost")]
  ConnectionLost,

  /// No transport is open; the frame was not sent.
  #[error("Not connected to Deriv")]
  NotConnected,

  #[error("Request timeout: {0}")]
  Timeout(String),

  /// The server answered with an explicit `error` payload.
  #[error("Server error: code={code}, msg={message}")]
  ServerError { code: String, message: String },

  /// A frame did not have the shape its classification promised.
  #[error("Protocol mismatch: {0}")]
  ProtocolMismatch(String),

  #[error("Message parse error: {0}")]
  ParseError(String),

  #[error("Invalid parameter: {0}")]
  InvalidParameter(String),

  #[error("Storage error: {0}")]
  StorageError(String),

  #[error("Internal error: {0}")]
  InternalError(String),
}

impl DerivError {
  /// True for the server's "already subscribed" rejection, which the client treats as benign.
  pub fn is_already_subscribed(&self) -> bool {
    match self {
      DerivError::ServerError { code, message } => is_already_subscribed(code, message),
      _ => false,
    }
  }
}

/// Checks an error code/message pair for the "already subscribed" race.
pub(crate) fn is_already_subscribed(code: &str, message: &str) -> bool {
  code.eq_ignore_ascii_case("AlreadySubscribed")
    || message.to_ascii_lowercase().contains("already subscribed")
}

impl From<serde_json::Error> for DerivError {
  fn from(e: serde_json::Error) -> Self {
    DerivError::ParseError(e.to_string())
  }
}

impl From<rusqlite::Error> for DerivError {
  fn from(e: rusqlite::Error) -> Self {
    DerivError::StorageError(e.to_string())
  }
}

impl From<tokio_tungstenite::tungstenite::Error> for DerivError {
  fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
    DerivError::ConnectionFailed(e.to_string())
  }
}

/// Lifecycle state of the single client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
  Disconnected,
  Connecting,
  Connected,
  Authorizing,
  Ready,
  Closing,
}

impl ConnectionState {
  /// Whether a transport is currently open (frames can be sent).
  pub fn is_open(&self) -> bool {
    matches!(self, ConnectionState::Connected | ConnectionState::Authorizing | ConnectionState::Ready)
  }
}

impl fmt::Display for ConnectionState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      ConnectionState::Disconnected => "disconnected",
      ConnectionState::Connecting => "connecting",
      ConnectionState::Connected => "connected",
      ConnectionState::Authorizing => "authorizing",
      ConnectionState::Ready => "ready",
      ConnectionState::Closing => "closing",
    };
    write!(f, "{}", s)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_already_subscribed_detection() {
    let by_code = DerivError::ServerError {
      code: "AlreadySubscribed".to_string(),
      message: "You are already subscribed to R_10.".to_string(),
    };
    assert!(by_code.is_already_subscribed());

    let by_message = DerivError::ServerError {
      code: "InputValidationFailed".to_string(),
      message: "Already subscribed".to_string(),
    };
    assert!(by_message.is_already_subscribed());

    let other = DerivError::ServerError {
      code: "InvalidSymbol".to_string(),
      message: "Symbol R_99 is invalid.".to_string(),
    };
    assert!(!other.is_already_subscribed());
    assert!(!DerivError::ConnectionLost.is_already_subscribed());
  }

  #[test]
  fn test_error_display() {
    let err = DerivError::ServerError { code: "RateLimit".to_string(), message: "slow down".to_string() };
    assert_eq!(err.to_string(), "Server error: code=RateLimit, msg=slow down");
    assert_eq!(DerivError::NotConnected.to_string(), "Not connected to Deriv");
  }

  #[test]
  fn test_state_is_open() {
    assert!(!ConnectionState::Disconnected.is_open());
    assert!(!ConnectionState::Connecting.is_open());
    assert!(ConnectionState::Connected.is_open());
    assert!(ConnectionState::Authorizing.is_open());
    assert!(ConnectionState::Ready.is_open());
    assert!(!ConnectionState::Closing.is_open());
    assert_eq!(ConnectionState::Ready.to_string(), "ready");
  }
}
