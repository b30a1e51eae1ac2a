// derivws/src/config.rs
// Client configuration: endpoint, timeouts and the reconnect policy.

use crate::base::DerivError;
use std::env;
use std::time::Duration;

/// Public Deriv WebSocket endpoint.
pub const DEFAULT_ENDPOINT: &str = "wss://ws.derivws.com/websockets/v3";
/// Deriv's public test application id.
pub const DEFAULT_APP_ID: &str = "1089";

pub const ENV_ENDPOINT: &str = "DERIV_ENDPOINT";
pub const ENV_APP_ID: &str = "DERIV_APP_ID";
pub const ENV_API_TOKEN: &str = "DERIV_API_TOKEN";
pub const ENV_CONNECT_TIMEOUT_SECS: &str = "DERIV_CONNECT_TIMEOUT_SECS";

/// Exponential backoff applied between automatic reconnect attempts.
///
/// `delay_for(n) = min(base_delay * factor^(n-1), max_delay)`, so the sequence is
/// non-decreasing and capped. Once `max_attempts` consecutive attempts have failed,
/// automatic reconnection stops until `manual_connect()` is called.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
  pub base_delay: Duration,
  pub factor: f64,
  pub max_delay: Duration,
  pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
  fn default() -> Self {
    Self {
      base_delay: Duration::from_secs(1),
      factor: 1.5,
      max_delay: Duration::from_secs(30),
      max_attempts: 10,
    }
  }
}

impl ReconnectPolicy {
  /// Delay before reconnect attempt `attempt` (1-based). Attempt 0 is treated as 1.
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    // factor < 1 would make the sequence shrink
    let factor = self.factor.max(1.0);
    let secs = self.base_delay.as_secs_f64() * factor.powi(exp);
    let cap = self.max_delay.as_secs_f64();
    if !secs.is_finite() || secs >= cap {
      self.max_delay
    } else {
      Duration::from_secs_f64(secs)
    }
  }

  /// Whether another automatic attempt is allowed after `attempts` failures.
  pub fn allows(&self, attempts: u32) -> bool {
    attempts < self.max_attempts
  }
}

/// Configuration for a [`DerivClient`](crate::DerivClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
  pub endpoint: String,
  pub app_id: String,
  pub language: String,
  /// API token used for `authorize`. `None` means market-data-only mode.
  pub api_token: Option<String>,
  pub connect_timeout: Duration,
  pub request_timeout: Duration,
  /// Interval between application-level `ping` frames. `None` disables keepalive.
  pub keepalive_interval: Option<Duration>,
  pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
  fn default() -> Self {
    Self {
      endpoint: DEFAULT_ENDPOINT.to_string(),
      app_id: DEFAULT_APP_ID.to_string(),
      language: "EN".to_string(),
      api_token: None,
      connect_timeout: Duration::from_secs(15),
      request_timeout: Duration::from_secs(30),
      keepalive_interval: Some(Duration::from_secs(30)),
      reconnect: ReconnectPolicy::default(),
    }
  }
}

impl ClientConfig {
  /// Load configuration from environment variables, falling back to defaults.
  ///
  /// Optional:
  /// - `DERIV_ENDPOINT`: WebSocket endpoint without query string
  /// - `DERIV_APP_ID`: numeric application id
  /// - `DERIV_API_TOKEN`: API token; enables authorization
  /// - `DERIV_CONNECT_TIMEOUT_SECS`: connection-establishment timeout
  pub fn from_env() -> Result<Self, DerivError> {
    let mut config = Self::default();

    if let Ok(endpoint) = env::var(ENV_ENDPOINT) {
      if !endpoint.starts_with("ws://") && !endpoint.starts_with("wss://") {
        return Err(DerivError::ConfigurationError(format!(
          "{} must be a ws:// or wss:// URL, got '{}'", ENV_ENDPOINT, endpoint
        )));
      }
      config.endpoint = endpoint;
    }

    if let Ok(app_id) = env::var(ENV_APP_ID) {
      validate_app_id(&app_id)?;
      config.app_id = app_id;
    }

    config.api_token = env::var(ENV_API_TOKEN).ok().filter(|t| !t.trim().is_empty());

    if let Ok(secs) = env::var(ENV_CONNECT_TIMEOUT_SECS) {
      let secs: u64 = secs.parse().map_err(|_| {
        DerivError::ConfigurationError(format!("{} must be an integer, got '{}'", ENV_CONNECT_TIMEOUT_SECS, secs))
      })?;
      config.connect_timeout = Duration::from_secs(secs);
    }

    Ok(config)
  }

  /// Full connection URL including the application id and language.
  pub fn url(&self) -> String {
    format!("{}?app_id={}&l={}", self.endpoint, self.app_id, self.language)
  }
}

/// App ids are assigned by the vendor and are always numeric.
pub fn validate_app_id(app_id: &str) -> Result<(), DerivError> {
  if app_id.is_empty() || !app_id.chars().all(|c| c.is_ascii_digit()) {
    return Err(DerivError::ConfigurationError(format!("app id must be numeric, got '{}'", app_id)));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use serial_test::serial;

  fn clear_env() {
    for var in [ENV_ENDPOINT, ENV_APP_ID, ENV_API_TOKEN, ENV_CONNECT_TIMEOUT_SECS] {
      env::remove_var(var);
    }
  }

  #[test]
  fn test_backoff_is_non_decreasing_and_capped() {
    let policy = ReconnectPolicy {
      base_delay: Duration::from_millis(500),
      factor: 2.0,
      max_delay: Duration::from_secs(10),
      max_attempts: 20,
    };
    let delays: Vec<Duration> = (1..=20).map(|n| policy.delay_for(n)).collect();
    assert_eq!(delays[0], Duration::from_millis(500));
    assert_eq!(delays[1], Duration::from_secs(1));
    for pair in delays.windows(2) {
      assert!(pair[0] <= pair[1]);
    }
    assert!(delays.iter().all(|d| *d <= Duration::from_secs(10)));
    assert_eq!(*delays.last().unwrap(), Duration::from_secs(10));
  }

  #[test]
  fn test_backoff_huge_attempt_does_not_overflow() {
    let policy = ReconnectPolicy::default();
    assert_eq!(policy.delay_for(u32::MAX), policy.max_delay);
    assert_eq!(policy.delay_for(0), policy.base_delay);
  }

  #[test]
  fn test_attempt_budget() {
    let policy = ReconnectPolicy { max_attempts: 3, ..Default::default() };
    assert!(policy.allows(0));
    assert!(policy.allows(2));
    assert!(!policy.allows(3));
  }

  #[test]
  fn test_url() {
    let config = ClientConfig::default();
    assert_eq!(config.url(), "wss://ws.derivws.com/websockets/v3?app_id=1089&l=EN");
  }

  #[test]
  #[serial]
  fn test_from_env_defaults() {
    clear_env();
    let config = ClientConfig::from_env().unwrap();
    assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
    assert_eq!(config.app_id, DEFAULT_APP_ID);
    assert!(config.api_token.is_none());
    assert_eq!(config.connect_timeout, Duration::from_secs(15));
  }

  #[test]
  #[serial]
  fn test_from_env_overrides() {
    clear_env();
    env::set_var(ENV_APP_ID, "36544");
    env::set_var(ENV_API_TOKEN, "a1-secret");
    env::set_var(ENV_CONNECT_TIMEOUT_SECS, "5");
    let config = ClientConfig::from_env().unwrap();
    assert_eq!(config.app_id, "36544");
    assert_eq!(config.api_token.as_deref(), Some("a1-secret"));
    assert_eq!(config.connect_timeout, Duration::from_secs(5));
    clear_env();
  }

  #[test]
  fn test_validate_app_id() {
    assert!(validate_app_id("1089").is_ok());
    for bad in ["", "abc", "12 3", "-1"] {
      assert!(matches!(validate_app_id(bad), Err(DerivError::ConfigurationError(_))), "{:?}", bad);
    }
  }

  #[test]
  #[serial]
  fn test_from_env_rejects_bad_values() {
    clear_env();
    env::set_var(ENV_APP_ID, "abc");
    assert!(matches!(ClientConfig::from_env(), Err(DerivError::ConfigurationError(_))));
    clear_env();

    env::set_var(ENV_ENDPOINT, "http://example.com");
    assert!(matches!(ClientConfig::from_env(), Err(DerivError::ConfigurationError(_))));
    clear_env();

    env::set_var(ENV_CONNECT_TIMEOUT_SECS, "soon");
    assert!(matches!(ClientConfig::from_env(), Err(DerivError::ConfigurationError(_))));
    clear_env();
  }
}
