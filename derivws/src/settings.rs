// derivws/src/settings.rs
// Key-value storage for the API token and application id.

use crate::base::DerivError;
use log::debug;
use parking_lot::Mutex;
use rusqlite::{params, Connection as DbConnection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;

pub const KEY_API_TOKEN: &str = "api_token";
pub const KEY_APP_ID: &str = "app_id";

/// Persistent storage for client settings. No transactional semantics are required.
pub trait SettingsStore: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<String>, DerivError>;
  fn set(&self, key: &str, value: &str) -> Result<(), DerivError>;
  fn remove(&self, key: &str) -> Result<(), DerivError>;
}

/// In-process settings; lost when the process exits.
#[derive(Debug, Default)]
pub struct MemorySettings {
  values: Mutex<HashMap<String, String>>,
}

impl MemorySettings {
  pub fn new() -> Self {
    Self::default()
  }
}

impl SettingsStore for MemorySettings {
  fn get(&self, key: &str) -> Result<Option<String>, DerivError> {
    Ok(self.values.lock().get(key).cloned())
  }

  fn set(&self, key: &str, value: &str) -> Result<(), DerivError> {
    self.values.lock().insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<(), DerivError> {
    self.values.lock().remove(key);
    Ok(())
  }
}

/// Settings stored in a single SQLite table.
pub struct SqliteSettings {
  conn: Mutex<DbConnection>,
}

impl SqliteSettings {
  /// Opens (or creates) the settings database at `path`.
  pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DerivError> {
    let conn = DbConnection::open(path.as_ref())?;
    Self::init(conn)
  }

  /// Opens a private in-memory database.
  pub fn open_in_memory() -> Result<Self, DerivError> {
    Self::init(DbConnection::open_in_memory()?)
  }

  fn init(conn: DbConnection) -> Result<Self, DerivError> {
    conn.execute(
      "CREATE TABLE IF NOT EXISTS settings (
         key   TEXT PRIMARY KEY NOT NULL,
         value TEXT NOT NULL
       )",
      (),
    )?;
    debug!("Settings database ready.");
    Ok(Self { conn: Mutex::new(conn) })
  }
}

impl SettingsStore for SqliteSettings {
  fn get(&self, key: &str) -> Result<Option<String>, DerivError> {
    let conn = self.conn.lock();
    let value = conn
      .query_row("SELECT value FROM settings WHERE key = ?1", params![key], |row| row.get(0))
      .optional()?;
    Ok(value)
  }

  fn set(&self, key: &str, value: &str) -> Result<(), DerivError> {
    let conn = self.conn.lock();
    conn.execute(
      "INSERT INTO settings (key, value) VALUES (?1, ?2)
       ON CONFLICT(key) DO UPDATE SET value = excluded.value",
      params![key, value],
    )?;
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<(), DerivError> {
    let conn = self.conn.lock();
    conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
    Ok(())
  }
}
