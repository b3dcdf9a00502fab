//! Session persistence: one JSON file per conversation.
//!
//! Writes are atomic (temp file, then rename) so a crash never leaves a
//! half-written session on disk. Loads are best-effort: a file that fails
//! to parse is pushed aside with a `.corrupt` suffix and the session starts
//! empty.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::llm::Turn;

/// Persisted conversation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedSession {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub turns: Vec<Turn>,
}

impl SavedSession {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            created_at: now,
            updated_at: now,
            turns: Vec::new(),
        }
    }
}

/// Directory-backed session store.
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, id: &str) -> Option<PathBuf> {
        if !valid_session_id(id) {
            return None;
        }
        Some(self.dir.join(format!("{id}.json")))
    }

    /// Atomically persist a session (write temp, rename over).
    pub fn save(&self, session: &SavedSession) -> Result<()> {
        let path = self
            .path_for(&session.id)
            .with_context(|| format!("invalid session id: {}", session.id))?;

        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;

        let json = serde_json::to_vec_pretty(session).context("failed to serialize session")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to rename into {}", path.display()))?;

        debug!(id = %session.id, turns = session.turns.len(), "session saved");
        Ok(())
    }

    /// Best-effort load. Missing file or invalid id yields `None`; a file
    /// that fails to parse is renamed with a `.corrupt` suffix.
    pub fn load(&self, id: &str) -> Option<SavedSession> {
        let path = self.path_for(id)?;
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(id, error = %e, "failed to read session file");
                return None;
            }
        };

        match serde_json::from_str::<SavedSession>(&contents) {
            Ok(session) => {
                info!(id, turns = session.turns.len(), "session restored");
                Some(session)
            }
            Err(e) => {
                warn!(id, error = %e, "corrupt session file, renaming aside");
                let corrupt = path.with_extension("json.corrupt");
                if let Err(e) = std::fs::rename(&path, &corrupt) {
                    warn!(id, error = %e, "failed to rename corrupt session file");
                }
                None
            }
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Session ids become file names; only a conservative charset is allowed.
fn valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
