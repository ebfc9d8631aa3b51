//! Durable per-workspace session state: last-used channel/chat identifiers
//! and the most recent authentication material per business, read by the
//! heartbeat collaborator after the originating request has ended.
//!
//! Every mutation is a read-modify-atomic-write: update memory under the
//! lock, stamp a fresh timestamp, then persist via temp file + rename before
//! returning. The on-disk file is never observed half-written regardless of
//! where a crash lands.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write state file: {0}")]
    Io(#[from] std::io::Error),
}

/// Auth context for a specific business, kept fresh for heartbeat use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthEntry {
    pub jwt_token: String,
    pub channel: String,
    pub chat_id: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WorkspaceState {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    last_channel: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    last_chat_id: String,
    /// One entry per business ID; a new write fully replaces the prior entry.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    active_auth: HashMap<String, AuthEntry>,
    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
}

impl Default for WorkspaceState {
    fn default() -> Self {
        Self {
            last_channel: String::new(),
            last_chat_id: String::new(),
            active_auth: HashMap::new(),
            timestamp: Utc::now(),
        }
    }
}

/// Manages persistent workspace state with atomic saves.
#[derive(Debug)]
pub struct StateManager {
    state_path: PathBuf,
    inner: Mutex<WorkspaceState>,
}

impl StateManager {
    /// Create a manager rooted at `<workspace>/state/state.json`.
    ///
    /// If the current-layout file is absent, a legacy `<workspace>/state.json`
    /// is consulted exactly once: when it parses, its contents seed memory
    /// and are immediately re-persisted on the new path. The legacy file is
    /// advisory — any read or parse failure just means starting empty.
    pub fn new(workspace: &Path) -> Self {
        let state_dir = workspace.join("state");
        let state_path = state_dir.join("state.json");
        let legacy_path = workspace.join("state.json");

        let _ = fs::create_dir_all(&state_dir);

        let mut state = WorkspaceState::default();
        if state_path.exists() {
            if let Some(loaded) = read_state(&state_path) {
                state = loaded;
            }
        } else if let Some(migrated) = read_state(&legacy_path) {
            state = migrated;
            match save_atomic(&state_path, &state) {
                Ok(()) => tracing::info!(
                    "migrated state from {} to {}",
                    legacy_path.display(),
                    state_path.display()
                ),
                Err(e) => tracing::warn!("failed to persist migrated state: {e}"),
            }
        }

        Self {
            state_path,
            inner: Mutex::new(state),
        }
    }

    /// Update the last-used channel and durably persist before returning.
    pub fn set_last_channel(&self, channel: &str) -> Result<(), StateError> {
        let mut state = self.inner.lock();
        state.last_channel = channel.to_string();
        state.timestamp = Utc::now();
        save_atomic(&self.state_path, &state)
    }

    /// Update the last-used chat ID and durably persist before returning.
    pub fn set_last_chat_id(&self, chat_id: &str) -> Result<(), StateError> {
        let mut state = self.inner.lock();
        state.last_chat_id = chat_id.to_string();
        state.timestamp = Utc::now();
        save_atomic(&self.state_path, &state)
    }

    /// Record auth context for a business. Last writer wins — the new entry
    /// fully replaces any prior one for the same business ID.
    pub fn set_business_auth(
        &self,
        business_id: &str,
        jwt_token: &str,
        channel: &str,
        chat_id: &str,
    ) -> Result<(), StateError> {
        let mut state = self.inner.lock();
        state.active_auth.insert(
            business_id.to_string(),
            AuthEntry {
                jwt_token: jwt_token.to_string(),
                channel: channel.to_string(),
                chat_id: chat_id.to_string(),
                updated_at: Utc::now(),
            },
        );
        state.timestamp = Utc::now();
        save_atomic(&self.state_path, &state)
    }

    pub fn last_channel(&self) -> String {
        self.inner.lock().last_channel.clone()
    }

    pub fn last_chat_id(&self) -> String {
        self.inner.lock().last_chat_id.clone()
    }

    /// All active business auth entries. Returns a defensive copy so callers
    /// never observe (or race with) in-progress mutation.
    pub fn active_auth(&self) -> HashMap<String, AuthEntry> {
        self.inner.lock().active_auth.clone()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.inner.lock().timestamp
    }
}

fn read_state(path: &Path) -> Option<WorkspaceState> {
    let data = fs::read(path).ok()?;
    serde_json::from_slice(&data).ok()
}

/// Write-to-temp then atomic rename. On rename failure the temp file is
/// removed and the error surfaces; the previous on-disk state stays valid.
fn save_atomic(path: &Path, state: &WorkspaceState) -> Result<(), StateError> {
    let file_name = path
        .file_name()
        .and_then(|v| v.to_str())
        .unwrap_or("state.json");
    let temp_path = path.with_file_name(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

    let data = serde_json::to_vec_pretty(state)?;
    fs::write(&temp_path, data)?;

    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(StateError::Io(e));
    }
    Ok(())
}
