use dirs::home_dir;
use std::env;
use std::path::{Path, PathBuf};

pub const PROJECT_PATH_ENV: &str = "CC_LAUNCHER_PROJECT_PATH";

/// Every file the launcher reads or writes, derived from one config root.
#[derive(Debug, Clone)]
pub struct LauncherPaths {
    pub root: PathBuf,
    pub platforms_file: PathBuf,
    pub launcher_file: PathBuf,
    pub config_lock: PathBuf,
    pub session_store: PathBuf,
    pub session_mappings: PathBuf,
    pub executable_cache: PathBuf,
    pub log_dir: PathBuf,
}

impl LauncherPaths {
    pub fn from_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let config_dir = root.join("config");
        let cache_dir = root.join("cache");
        let sessions_dir = cache_dir.join("sessions");
        Self {
            platforms_file: config_dir.join("platforms.json"),
            launcher_file: config_dir.join("launcher.json"),
            config_lock: config_dir.join(".config.lock"),
            session_store: sessions_dir.join("sessions.json"),
            session_mappings: sessions_dir.join("session-mappings.json"),
            executable_cache: cache_dir.join("claude-executable.json"),
            log_dir: root.join("logs"),
            root,
        }
    }

    pub fn config_dir(&self) -> &Path {
        self.platforms_file.parent().unwrap_or(&self.root)
    }
}

pub fn resolve_root(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var(PROJECT_PATH_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    default_root()
}

fn default_root() -> PathBuf {
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".claude");
    base
}
