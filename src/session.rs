//! Per-platform session records in `cache/sessions/sessions.json`.
//!
//! Every mutation runs under the store's sibling lock and rewrites the file
//! atomically; see [`crate::store`].

use crate::config::{LauncherPreferences, LauncherRegistry};
use crate::error::LauncherError;
use crate::store::{self, FileLock, LockError, LOCK_TIMEOUT};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::{to_raw_value, RawValue};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const STORE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub platform_key: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

/// Outcome of [`SessionManager::get_or_create`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionDecision {
    Reused(Session),
    Created(Session),
    /// Launch without session tracking.
    Untracked,
}

impl SessionDecision {
    pub fn session(&self) -> Option<&Session> {
        match self {
            SessionDecision::Reused(session) | SessionDecision::Created(session) => Some(session),
            SessionDecision::Untracked => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default = "store_version")]
    version: u32,
    #[serde(default)]
    platforms: BTreeMap<String, PlatformSessions>,
}

impl Default for StoreDocument {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            platforms: BTreeMap::new(),
        }
    }
}

fn store_version() -> u32 {
    STORE_VERSION
}

// Records stay raw so untouched ones are written back byte for byte.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PlatformSessions {
    #[serde(default)]
    current: Option<String>,
    #[serde(default)]
    sessions: Vec<Box<RawValue>>,
}

impl PlatformSessions {
    fn position_of(&self, id: &str) -> Option<usize> {
        self.sessions
            .iter()
            .position(|raw| record_id(raw).as_deref() == Some(id))
    }
}

#[derive(Deserialize)]
struct RecordId {
    id: String,
}

fn record_id(raw: &RawValue) -> Option<String> {
    serde_json::from_str::<RecordId>(raw.get())
        .ok()
        .map(|record| record.id)
}

fn parse_record(raw: &RawValue) -> serde_json::Result<Session> {
    serde_json::from_str(raw.get())
}

/// One row of [`SessionManager::list`].
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StoredSession {
    #[serde(flatten)]
    pub session: Session,
    pub current: bool,
}

pub struct SessionManager {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
    prefixes: BTreeMap<String, String>,
}

impl SessionManager {
    pub fn new(path: &Path, registry: &LauncherRegistry) -> Self {
        let prefixes = registry
            .platforms
            .keys()
            .enumerate()
            .map(|(index, key)| (key.clone(), format!("{:02}", (index + 1) % 100)))
            .collect();
        Self {
            path: path.to_path_buf(),
            lock_path: store::lock_path_for(path),
            lock_timeout: LOCK_TIMEOUT,
            prefixes,
        }
    }

    #[cfg(test)]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_or_create(
        &self,
        platform_key: &str,
        continue_requested: bool,
        prefs: &LauncherPreferences,
    ) -> Result<SessionDecision, LauncherError> {
        if !continue_requested && !prefs.auto_create_session {
            debug!(platform = %platform_key, "auto_create_session is off; launching untracked");
            return Ok(SessionDecision::Untracked);
        }
        self.transact(|doc| {
            let now = Utc::now();
            if continue_requested {
                return match reuse_current(doc, platform_key, now) {
                    Some(session) => {
                        info!(platform = %platform_key, session = %session.id, "continuing session");
                        Ok(SessionDecision::Reused(session))
                    }
                    None => Err(LauncherError::NoSessionToContinue {
                        platform: platform_key.to_string(),
                    }),
                };
            }
            let session = self.insert_new(doc, platform_key, now)?;
            Ok(SessionDecision::Created(session))
        })
    }

    /// Creates a fresh current session regardless of preferences.
    pub fn create(&self, platform_key: &str) -> Result<Session, LauncherError> {
        self.transact(|doc| self.insert_new(doc, platform_key, Utc::now()))
    }

    /// Removes sessions last used more than `retention_days` ago.
    pub fn cleanup(&self, retention_days: u32) -> Result<usize, LauncherError> {
        let horizon = ChronoDuration::days(i64::from(retention_days));
        self.cleanup_before(Utc::now() - horizon)
    }

    pub fn cleanup_before(&self, cutoff: DateTime<Utc>) -> Result<usize, LauncherError> {
        let removed = self.transact(|doc| Ok(expire(doc, cutoff)))?;
        if removed > 0 {
            info!(removed, cutoff = %cutoff, "expired sessions removed");
        }
        Ok(removed)
    }

    /// Readable sessions, grouped by platform key, most recently used first.
    ///
    /// Reads without the lock; a concurrent writer's rename is atomic.
    pub fn list(&self) -> Result<BTreeMap<String, Vec<StoredSession>>, LauncherError> {
        let doc = self.read_document(false)?;
        let mut listing = BTreeMap::new();
        for (key, entry) in doc.platforms {
            let mut rows: Vec<StoredSession> = entry
                .sessions
                .iter()
                .filter_map(|raw| parse_record(raw).ok())
                .map(|session| StoredSession {
                    current: entry.current.as_deref() == Some(session.id.as_str()),
                    session,
                })
                .collect();
            rows.sort_by(|a, b| {
                b.session
                    .last_used_at
                    .cmp(&a.session.last_used_at)
                    .then(b.current.cmp(&a.current))
            });
            if !rows.is_empty() {
                listing.insert(key, rows);
            }
        }
        Ok(listing)
    }

    fn insert_new(
        &self,
        doc: &mut StoreDocument,
        platform_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Session, LauncherError> {
        let prefix = self
            .prefixes
            .get(platform_key)
            .map(String::as_str)
            .unwrap_or("00");
        let taken: HashSet<String> = doc
            .platforms
            .values()
            .flat_map(|entry| entry.sessions.iter().filter_map(|raw| record_id(raw)))
            .collect();
        let id = generate_id(prefix, &taken);
        let session = Session {
            id: id.clone(),
            platform_key: platform_key.to_string(),
            created_at: now,
            last_used_at: now,
            metadata: serde_json::Map::new(),
        };
        let entry = doc.platforms.entry(platform_key.to_string()).or_default();
        entry.sessions.push(to_raw_value(&session)?);
        entry.current = Some(id);
        info!(platform = %platform_key, session = %session.id, "session created");
        Ok(session)
    }

    fn transact<T>(
        &self,
        mutate: impl FnOnce(&mut StoreDocument) -> Result<T, LauncherError>,
    ) -> Result<T, LauncherError> {
        let _lock = FileLock::acquire(&self.lock_path, self.lock_timeout).map_err(|err| match err {
            LockError::TimedOut(_) => LauncherError::SessionStoreLocked {
                path: self.path.clone(),
            },
            LockError::Io(err) => LauncherError::Io(err),
        })?;
        let mut doc = self.read_document(true)?;
        let before = serde_json::to_string(&doc)?;
        let result = mutate(&mut doc)?;
        if serde_json::to_string(&doc)? != before {
            store::write_json_atomic(&self.path, &doc)?;
        }
        Ok(result)
    }

    fn read_document(&self, quarantine: bool) -> Result<StoreDocument, LauncherError> {
        let Some(text) = store::read_optional(&self.path)? else {
            return Ok(StoreDocument::default());
        };
        match serde_json::from_str::<StoreDocument>(&text) {
            Ok(doc) => {
                if doc.version != STORE_VERSION {
                    warn!(path = %self.path.display(), version = doc.version, "unexpected session store version");
                }
                Ok(doc)
            }
            Err(err) if quarantine => {
                let aside = corrupt_path(&self.path);
                warn!(
                    path = %self.path.display(),
                    moved_to = %aside.display(),
                    error = %err,
                    "session store is corrupt; starting a new one"
                );
                fs::rename(&self.path, &aside)?;
                Ok(StoreDocument::default())
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "session store is unreadable");
                Ok(StoreDocument::default())
            }
        }
    }
}

fn reuse_current(doc: &mut StoreDocument, platform_key: &str, now: DateTime<Utc>) -> Option<Session> {
    let entry = doc.platforms.get_mut(platform_key)?;
    let current = entry.current.clone()?;
    let index = entry.position_of(&current)?;
    let mut session = match parse_record(&entry.sessions[index]) {
        Ok(session) => session,
        Err(err) => {
            warn!(platform = %platform_key, session = %current, error = %err, "current session record is unreadable");
            return None;
        }
    };
    session.last_used_at = now;
    entry.sessions[index] = to_raw_value(&session).ok()?;
    Some(session)
}

fn expire(doc: &mut StoreDocument, cutoff: DateTime<Utc>) -> usize {
    let mut removed = 0;
    for (key, entry) in doc.platforms.iter_mut() {
        entry.sessions.retain(|raw| {
            match parse_record(raw) {
                Ok(session) if session.last_used_at < cutoff => {
                    debug!(platform = %key, session = %session.id, "session expired");
                    removed += 1;
                    false
                }
                Ok(_) => true,
                Err(err) => {
                    warn!(platform = %key, error = %err, "skipping unreadable session record");
                    true
                }
            }
        });
        if let Some(current) = entry.current.as_deref() {
            if entry.position_of(current).is_none() {
                entry.current = None;
            }
        }
    }
    doc.platforms
        .retain(|_, entry| !entry.sessions.is_empty() || entry.current.is_some());
    removed
}

fn generate_id(prefix: &str, taken: &HashSet<String>) -> String {
    loop {
        let uuid = Uuid::new_v4().to_string();
        let candidate = format!("{prefix}{}", &uuid[2..]);
        if !taken.contains(&candidate) {
            return candidate;
        }
    }
}

fn corrupt_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|s| s.to_os_string())
        .unwrap_or_default();
    name.push(".corrupt");
    path.with_file_name(name)
}
