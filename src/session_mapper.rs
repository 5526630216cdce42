use crate::error::LauncherError;
use crate::session::Session;
use crate::store::{self, FileLock, LockError, LOCK_TIMEOUT};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// What the status display reads for one platform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MappingEntry {
    pub session_id: String,
    pub updated_at: DateTime<Utc>,
}

type MappingFile = BTreeMap<String, MappingEntry>;

/// Writes `session-mappings.json`. Failures are logged, never returned.
pub struct SessionMapper {
    path: PathBuf,
    lock_path: PathBuf,
}

impl SessionMapper {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            lock_path: store::lock_path_for(path),
        }
    }

    pub fn publish(&self, platform_key: &str, session: &Session) -> bool {
        let entry = MappingEntry {
            session_id: session.id.clone(),
            updated_at: session.last_used_at,
        };
        self.absorb(platform_key, "publish", |mappings| {
            mappings.insert(platform_key.to_string(), entry);
        })
    }

    /// Drops the platform's entry after a launch without session tracking.
    pub fn retract(&self, platform_key: &str) -> bool {
        self.absorb(platform_key, "retract", |mappings| {
            mappings.remove(platform_key);
        })
    }

    fn absorb(&self, platform_key: &str, action: &str, mutate: impl FnOnce(&mut MappingFile)) -> bool {
        match self.rewrite(mutate) {
            Ok(()) => {
                debug!(platform = %platform_key, action, path = %self.path.display(), "session mapping updated");
                true
            }
            Err(err) => {
                warn!(
                    platform = %platform_key,
                    action,
                    path = %self.path.display(),
                    error = %err,
                    "could not update session mapping; status display may be stale"
                );
                false
            }
        }
    }

    fn rewrite(&self, mutate: impl FnOnce(&mut MappingFile)) -> Result<(), LauncherError> {
        let _lock = FileLock::acquire(&self.lock_path, LOCK_TIMEOUT).map_err(|err| match err {
            LockError::TimedOut(_) => LauncherError::SessionStoreLocked {
                path: self.path.clone(),
            },
            LockError::Io(err) => LauncherError::Io(err),
        })?;
        let mut mappings = match store::read_optional(&self.path)? {
            Some(text) => serde_json::from_str::<MappingFile>(&text).unwrap_or_else(|err| {
                warn!(path = %self.path.display(), error = %err, "discarding unreadable session mapping");
                MappingFile::new()
            }),
            None => MappingFile::new(),
        };
        let before = mappings.clone();
        mutate(&mut mappings);
        if mappings != before || !self.path.exists() {
            store::write_json_atomic(&self.path, &mappings)?;
        }
        Ok(())
    }

    /// Best-effort read, as the status display does it.
    #[cfg(test)]
    pub fn read(&self) -> MappingFile {
        store::read_optional(&self.path)
            .ok()
            .flatten()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default()
    }
}
