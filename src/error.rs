use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LauncherError {
    #[error("configuration not found at {}; run with --init-config to create it", path.display())]
    ConfigMissing { path: PathBuf },
    #[error("configuration is invalid. Please edit {} and try again:\n  - {}", path.display(), problems.join("\n  - "))]
    ConfigInvalid { path: PathBuf, problems: Vec<String> },
    #[error("configuration already exists at {}; refusing to overwrite it", path.display())]
    AlreadyInitialized { path: PathBuf },
    #[error("unknown platform '{key}'; use --list to see configured platforms")]
    UnknownPlatform { key: String },
    #[error("platform '{key}' is disabled; set \"enabled\": true in platforms.json to use it")]
    PlatformDisabled { key: String },
    #[error("environment setup did not finish within {seconds}s")]
    EnvironmentSetupTimeout { seconds: u64 },
    #[error("no session to continue for platform '{platform}'")]
    NoSessionToContinue { platform: String },
    #[error("session store {} is locked by another cc-launcher process", path.display())]
    SessionStoreLocked { path: PathBuf },
    #[error("claude executable '{name}' not found; install it with `npm install -g @anthropic-ai/claude-code`")]
    ExecutableNotFound { name: String },
    #[error("{} is not executable", path.display())]
    NotExecutable { path: PathBuf },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("child process error: {0}")]
    ChildProcess(String),
}

impl LauncherError {
    pub fn kind(&self) -> &'static str {
        match self {
            LauncherError::ConfigMissing { .. } => "ConfigMissing",
            LauncherError::ConfigInvalid { .. } => "ConfigInvalid",
            LauncherError::AlreadyInitialized { .. } => "AlreadyInitialized",
            LauncherError::UnknownPlatform { .. } => "UnknownPlatform",
            LauncherError::PlatformDisabled { .. } => "PlatformDisabled",
            LauncherError::EnvironmentSetupTimeout { .. } => "EnvironmentSetupTimeout",
            LauncherError::NoSessionToContinue { .. } => "NoSessionToContinue",
            LauncherError::SessionStoreLocked { .. } => "SessionStoreLocked",
            LauncherError::ExecutableNotFound { .. } => "ExecutableNotFound",
            LauncherError::NotExecutable { .. } => "NotExecutable",
            LauncherError::Io(_) | LauncherError::Json(_) => "IOError",
            LauncherError::ChildProcess(_) => "ChildProcessError",
        }
    }

    pub fn config_invalid(path: impl Into<PathBuf>, problem: impl Into<String>) -> Self {
        LauncherError::ConfigInvalid {
            path: path.into(),
            problems: vec![problem.into()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_invalid_lists_every_problem() {
        let err = LauncherError::ConfigInvalid {
            path: PathBuf::from("/tmp/platforms.json"),
            problems: vec!["first".to_string(), "second".to_string()],
        };
        let text = err.to_string();
        assert!(text.contains("Please edit /tmp/platforms.json"));
        assert!(text.contains("  - first\n  - second"));
        assert_eq!(err.kind(), "ConfigInvalid");
    }

    #[test]
    fn io_errors_report_io_kind() {
        let err = LauncherError::from(io::Error::new(io::ErrorKind::Other, "boom"));
        assert_eq!(err.kind(), "IOError");
    }
}
