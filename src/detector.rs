use crate::error::LauncherError;
use crate::store;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cell::OnceCell;
use std::env;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const WELL_KNOWN_NAME: &str = "claude";

/// Package runners that can start the assistant without a global install,
/// tried in order after the direct names.
const RUNNERS: &[(&str, &[&str])] = &[
    ("npx", &["@anthropic-ai/claude-code"]),
    ("pnpx", &["claude"]),
    ("yarn", &["claude"]),
];

const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// A program plus the arguments that precede the assistant's own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssistantCommand {
    pub program: PathBuf,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub leading_args: Vec<String>,
}

impl AssistantCommand {
    fn direct(program: PathBuf) -> Self {
        Self {
            program,
            leading_args: Vec::new(),
        }
    }
}

impl fmt::Display for AssistantCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.leading_args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RememberedExecutable {
    name: String,
    #[serde(flatten)]
    command: AssistantCommand,
    verified_at: DateTime<Utc>,
}

/// Finds the assistant executable once per invocation.
#[derive(Debug)]
pub struct ExecutableDetector {
    search_path: Option<OsString>,
    remember_file: Option<PathBuf>,
    resolved: OnceCell<AssistantCommand>,
}

impl ExecutableDetector {
    pub fn new(search_path: Option<OsString>) -> Self {
        Self {
            search_path,
            remember_file: None,
            resolved: OnceCell::new(),
        }
    }

    /// Persists the resolved path to `file` and consults it on later runs.
    pub fn remembering(mut self, file: PathBuf) -> Self {
        self.remember_file = Some(file);
        self
    }

    pub fn locate(&self, configured: &str) -> Result<AssistantCommand, LauncherError> {
        if let Some(command) = self.resolved.get() {
            return Ok(command.clone());
        }
        let configured = configured.trim();
        let command = if looks_like_path(configured) {
            let candidate = PathBuf::from(configured);
            if !candidate.exists() {
                return Err(LauncherError::ExecutableNotFound {
                    name: configured.to_string(),
                });
            }
            verify(&candidate)?;
            AssistantCommand::direct(fs::canonicalize(&candidate).unwrap_or(candidate))
        } else {
            match self.recall(configured) {
                Some(command) => command,
                None => {
                    let command = self.search(configured)?;
                    self.remember(configured, &command);
                    command
                }
            }
        };
        info!(command = %command, "assistant executable located");
        Ok(self.resolved.get_or_init(|| command).clone())
    }

    fn search(&self, name: &str) -> Result<AssistantCommand, LauncherError> {
        let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let mut names = vec![name];
        if name != WELL_KNOWN_NAME {
            names.push(WELL_KNOWN_NAME);
        }
        let mut last_error = None;
        for candidate in names.into_iter().filter(|n| !n.is_empty()) {
            match which::which_in(candidate, self.search_path.as_ref(), &cwd) {
                Ok(path) => match verify(&path) {
                    Ok(()) => return Ok(AssistantCommand::direct(path)),
                    Err(err) => last_error = Some(err),
                },
                Err(err) => debug!(name = %candidate, error = %err, "not on search path"),
            }
        }
        for (runner, leading) in RUNNERS {
            let Ok(path) = which::which_in(runner, self.search_path.as_ref(), &cwd) else {
                continue;
            };
            if verify(&path).is_err() {
                continue;
            }
            let command = AssistantCommand {
                program: path,
                leading_args: leading.iter().map(|arg| arg.to_string()).collect(),
            };
            if reports_assistant_version(&command) {
                return Ok(command);
            }
            debug!(command = %command, "runner did not report an assistant version");
        }
        Err(last_error.unwrap_or_else(|| LauncherError::ExecutableNotFound {
            name: name.to_string(),
        }))
    }

    fn recall(&self, name: &str) -> Option<AssistantCommand> {
        let file = self.remember_file.as_ref()?;
        let text = store::read_optional(file).ok().flatten()?;
        let remembered: RememberedExecutable = match serde_json::from_str(&text) {
            Ok(remembered) => remembered,
            Err(err) => {
                warn!(path = %file.display(), error = %err, "ignoring unreadable executable cache");
                return None;
            }
        };
        let command = remembered.command;
        if remembered.name != name || verify(&command.program).is_err() {
            debug!(command = %command, "remembered executable is stale");
            return None;
        }
        debug!(command = %command, "using remembered executable");
        Some(command)
    }

    fn remember(&self, name: &str, command: &AssistantCommand) {
        let Some(file) = &self.remember_file else {
            return;
        };
        let record = RememberedExecutable {
            name: name.to_string(),
            command: command.clone(),
            verified_at: Utc::now(),
        };
        if let Err(err) = store::write_json_atomic(file, &record) {
            warn!(path = %file.display(), error = %err, "could not remember executable");
        }
    }
}

/// Runs `<command> --version` and looks for the assistant in its output.
fn reports_assistant_version(command: &AssistantCommand) -> bool {
    let spawned = Command::new(&command.program)
        .args(&command.leading_args)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(err) => {
            debug!(command = %command, error = %err, "version check failed to start");
            return false;
        }
    };
    let deadline = Instant::now() + VERSION_PROBE_TIMEOUT;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(50)),
            Ok(None) | Err(_) => {
                warn!(command = %command, "version check did not finish; skipping");
                let _ = child.kill();
                let _ = child.wait();
                return false;
            }
        }
    }
    let Ok(output) = child.wait_with_output() else {
        return false;
    };
    if !output.status.success() {
        return false;
    }
    let text = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
    .to_ascii_lowercase();
    text.contains("claude") || text.contains("anthropic")
}

fn looks_like_path(value: &str) -> bool {
    value.contains('/') || value.contains('\\') || Path::new(value).is_absolute()
}

/// Fails with `NotExecutable` unless `path` is a file the user can run.
pub fn verify(path: &Path) -> Result<(), LauncherError> {
    let not_executable = || LauncherError::NotExecutable {
        path: path.to_path_buf(),
    };
    let metadata = fs::metadata(path).map_err(|_| not_executable())?;
    if !metadata.is_file() {
        return Err(not_executable());
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(not_executable());
        }
    }
    Ok(())
}
