//! State store implementation
//!
//! Provides file-based state persistence with atomic writes.

use super::types::{keys, Entry, PersistedState, Scope, StateKey, StoredValue};
use crate::error::{Error, Result};
use crate::types::{Cursor, Timestamp};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Shared handle to the persisted key/value state
#[derive(Debug)]
pub struct StateStore {
    /// Path to the state file
    path: PathBuf,
    /// Current state (cached)
    state: Arc<RwLock<PersistedState>>,
    /// Whether to save on every update
    auto_save: bool,
    /// Serializes file writes so the last rename always carries the newest snapshot
    save_lock: Arc<Mutex<()>>,
}

impl StateStore {
    /// Create a new state store with the given path
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self::with_state(path.as_ref().to_path_buf(), PersistedState::new(), true)
    }

    /// Create an in-memory state store (no file persistence)
    pub fn in_memory() -> Self {
        Self::with_state(PathBuf::new(), PersistedState::new(), false)
    }

    /// Create a state store from a file, loading existing state if present
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let contents = std::fs::read_to_string(&path).map_err(|e| Error::State {
                message: format!("Failed to read state file: {e}"),
            })?;
            serde_json::from_str(&contents).map_err(|e| Error::State {
                message: format!("Failed to parse state file: {e}"),
            })?
        } else {
            PersistedState::new()
        };

        Ok(Self::with_state(path, state, true))
    }

    /// Create an in-memory state store from a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        let state: PersistedState = serde_json::from_str(json).map_err(|e| Error::State {
            message: format!("Failed to parse state JSON: {e}"),
        })?;
        Ok(Self::with_state(PathBuf::new(), state, false))
    }

    fn with_state(path: PathBuf, state: PersistedState, auto_save: bool) -> Self {
        Self {
            path,
            state: Arc::new(RwLock::new(state)),
            auto_save,
            save_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Reload state from file
    pub async fn load(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }

        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| Error::State {
                message: format!("Failed to read state file: {e}"),
            })?;

        let loaded: PersistedState = serde_json::from_str(&contents).map_err(|e| Error::State {
            message: format!("Failed to parse state file: {e}"),
        })?;

        *self.state.write().await = loaded;
        Ok(())
    }

    /// Save current state to file
    pub async fn save(&self) -> Result<()> {
        if self.is_in_memory() {
            return Ok(());
        }

        let _guard = self.save_lock.lock().await;
        let contents = {
            let state = self.state.read().await;
            serde_json::to_string_pretty(&*state).map_err(|e| Error::State {
                message: format!("Failed to serialize state: {e}"),
            })?
        };

        // Write to temp file first, then rename for atomicity
        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, &contents)
            .await
            .map_err(|e| Error::State {
                message: format!("Failed to write state file: {e}"),
            })?;

        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| Error::State {
                message: format!("Failed to rename state file: {e}"),
            })?;

        Ok(())
    }

    async fn persist(&self) -> Result<()> {
        if self.auto_save {
            self.save().await?;
        }
        Ok(())
    }

    /// Export state as pretty-printed JSON string
    pub async fn to_json_pretty(&self) -> Result<String> {
        let state = self.state.read().await;
        serde_json::to_string_pretty(&*state).map_err(|e| Error::State {
            message: format!("Failed to serialize state: {e}"),
        })
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Raw value for a key
    pub async fn get(&self, key: &StateKey) -> Option<StoredValue> {
        self.state.read().await.value(key).cloned()
    }

    /// Boolean value, false when absent
    pub async fn get_bool(&self, key: &StateKey) -> bool {
        self.get(key)
            .await
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Integer value, 0 when absent
    pub async fn get_int(&self, key: &StateKey) -> i64 {
        self.get(key).await.and_then(|v| v.as_int()).unwrap_or(0)
    }

    /// Integer value if present
    pub async fn get_opt_int(&self, key: &StateKey) -> Option<i64> {
        self.get(key).await.and_then(|v| v.as_int())
    }

    /// Time value
    pub async fn get_time(&self, key: &StateKey) -> Option<Timestamp> {
        self.get(key).await.and_then(|v| v.as_time())
    }

    /// Text value
    pub async fn get_text(&self, key: &StateKey) -> Option<String> {
        self.get(key)
            .await
            .and_then(|v| v.as_text().map(ToString::to_string))
    }

    /// Cursor value; a corrupt cursor is an error rather than silently dropped
    pub async fn get_cursor(&self, key: &StateKey) -> Result<Option<Cursor>> {
        self.get(key).await.and_then(|v| v.as_cursor()).transpose()
    }

    /// Copy of every entry in a scope
    pub async fn scope_entries(&self, scope: Scope) -> BTreeMap<String, Entry> {
        self.state.read().await.scope_entries(scope)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Set a value
    pub async fn set(&self, key: &StateKey, value: StoredValue) -> Result<()> {
        self.state.write().await.insert(key, value);
        self.persist().await
    }

    /// Set a boolean
    pub async fn set_bool(&self, key: &StateKey, value: bool) -> Result<()> {
        self.set(key, StoredValue::Bool(value)).await
    }

    /// Set an integer
    pub async fn set_int(&self, key: &StateKey, value: i64) -> Result<()> {
        self.set(key, StoredValue::Int(value)).await
    }

    /// Set a time
    pub async fn set_time(&self, key: &StateKey, value: Timestamp) -> Result<()> {
        self.set(key, StoredValue::Time(value)).await
    }

    /// Set a text value
    pub async fn set_text(&self, key: &StateKey, value: impl Into<String>) -> Result<()> {
        self.set(key, StoredValue::Text(value.into())).await
    }

    /// Remove a value
    pub async fn remove(&self, key: &StateKey) -> Result<()> {
        self.state.write().await.remove(key);
        self.persist().await
    }

    /// Apply a group of writes under one lock and save once
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut StateWriter<'_>),
    {
        {
            let mut state = self.state.write().await;
            let mut writer = StateWriter { state: &mut state };
            f(&mut writer);
        }
        self.persist().await
    }

    /// Clear one scope
    pub async fn reset_scope(&self, scope: Scope) -> Result<()> {
        info!(%scope, "Resetting persisted state scope");
        self.state.write().await.clear_scope(scope);
        self.persist().await
    }

    /// Clear every resettable scope
    pub async fn reset_all(&self) -> Result<()> {
        info!("Resetting all persisted state");
        {
            let mut state = self.state.write().await;
            for scope in Scope::RESETTABLE {
                state.clear_scope(scope);
            }
        }
        self.persist().await
    }

    /// Compare the stored layout version with `expected`, resetting everything on mismatch.
    ///
    /// Returns true when a reset happened.
    pub async fn ensure_schema_version(&self, expected: i64) -> Result<bool> {
        let key = keys::schema_version();
        let stored = self.get_opt_int(&key).await;
        if stored == Some(expected) {
            return Ok(false);
        }

        let was_empty = {
            let mut state = self.state.write().await;
            let was_empty = state.entries.is_empty();
            for scope in Scope::RESETTABLE {
                state.clear_scope(scope);
            }
            state.insert(&key, StoredValue::Int(expected));
            was_empty
        };
        self.persist().await?;

        if was_empty {
            debug!(version = expected, "Initialized state schema version");
            Ok(false)
        } else {
            info!(?stored, expected, "State schema version changed, reset all scopes");
            Ok(true)
        }
    }

    /// Get the state file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if using in-memory mode
    pub fn is_in_memory(&self) -> bool {
        self.path.as_os_str().is_empty()
    }
}

impl Clone for StateStore {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            state: Arc::clone(&self.state),
            auto_save: self.auto_save,
            save_lock: Arc::clone(&self.save_lock),
        }
    }
}

/// Write access handed to [`StateStore::update`]
pub struct StateWriter<'a> {
    state: &'a mut PersistedState,
}

impl StateWriter<'_> {
    /// Current value of a key
    pub fn get(&self, key: &StateKey) -> Option<&StoredValue> {
        self.state.value(key)
    }

    /// Current integer value, 0 when absent
    pub fn get_int(&self, key: &StateKey) -> i64 {
        self.get(key).and_then(StoredValue::as_int).unwrap_or(0)
    }

    /// Current time value
    pub fn get_time(&self, key: &StateKey) -> Option<Timestamp> {
        self.get(key).and_then(StoredValue::as_time)
    }

    /// Set a value
    pub fn set(&mut self, key: &StateKey, value: StoredValue) {
        self.state.insert(key, value);
    }

    /// Set a boolean
    pub fn set_bool(&mut self, key: &StateKey, value: bool) {
        self.set(key, StoredValue::Bool(value));
    }

    /// Set an integer
    pub fn set_int(&mut self, key: &StateKey, value: i64) {
        self.set(key, StoredValue::Int(value));
    }

    /// Set a time
    pub fn set_time(&mut self, key: &StateKey, value: Timestamp) {
        self.set(key, StoredValue::Time(value));
    }

    /// Set a cursor
    pub fn set_cursor(&mut self, key: &StateKey, cursor: &Cursor) {
        self.set(key, StoredValue::Cursor(cursor.to_base64()));
    }

    /// Remove a key
    pub fn remove(&mut self, key: &StateKey) {
        self.state.remove(key);
    }

    /// Remove several keys
    pub fn remove_all(&mut self, keys: &[StateKey]) {
        for key in keys {
            self.remove(key);
        }
    }
}
