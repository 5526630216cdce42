use crate::config::{Credential, LauncherPreferences, PlatformDefinition};
use crate::error::LauncherError;
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsStr;
use std::io;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use tracing::debug;

const ASSISTANT_PREFIX: &str = "ANTHROPIC_";

/// Variables outside the `ANTHROPIC_` prefix that still belong to the
/// assistant and must not leak from one platform into the next.
const ASSISTANT_VARIABLES: &[&str] = &[
    "CLAUDE_API_KEY",
    "CLAUDE_AUTH_TOKEN",
    "CLAUDE_BASE_URL",
    "CLAUDE_MODEL",
    "CLAUDE_CODE_MAX_OUTPUT_TOKENS",
    "MOONSHOT_API_KEY",
    "DEEPSEEK_API_KEY",
    "SILICONFLOW_API_KEY",
];

pub const API_KEY_VAR: &str = "ANTHROPIC_API_KEY";
pub const AUTH_TOKEN_VAR: &str = "ANTHROPIC_AUTH_TOKEN";
pub const BASE_URL_VAR: &str = "ANTHROPIC_BASE_URL";
pub const MODEL_VAR: &str = "ANTHROPIC_MODEL";

/// What to strip from, and add to, the inherited environment of the child.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentPlan {
    pub remove: Vec<String>,
    pub set: BTreeMap<String, String>,
}

pub fn is_assistant_variable(name: &str) -> bool {
    name.starts_with(ASSISTANT_PREFIX) || ASSISTANT_VARIABLES.contains(&name)
}

/// Names from `existing` that fall in the assistant namespace, sorted.
pub fn clear<K: AsRef<OsStr>>(existing: impl IntoIterator<Item = K>) -> Vec<String> {
    let names: BTreeSet<String> = existing
        .into_iter()
        .filter_map(|name| name.as_ref().to_str().map(str::to_string))
        .filter(|name| is_assistant_variable(name))
        .collect();
    names.into_iter().collect()
}

pub fn build(platform: &PlatformDefinition, prefs: &LauncherPreferences) -> BTreeMap<String, String> {
    let mut envs = BTreeMap::new();
    envs.insert(BASE_URL_VAR.to_string(), platform.api_base_url.clone());

    let (active, blanked) = match &platform.credential {
        Credential::ApiKey(_) | Credential::LoginToken(_) => (API_KEY_VAR, AUTH_TOKEN_VAR),
        Credential::AuthToken(_) => (AUTH_TOKEN_VAR, API_KEY_VAR),
    };
    envs.insert(active.to_string(), platform.credential.secret().to_string());
    envs.insert(blanked.to_string(), String::new());
    debug!(
        kind = platform.credential.field_name(),
        variable = active,
        "credential mapped"
    );

    for name in [
        MODEL_VAR,
        "ANTHROPIC_DEFAULT_HAIKU_MODEL",
        "ANTHROPIC_DEFAULT_SONNET_MODEL",
        "ANTHROPIC_DEFAULT_OPUS_MODEL",
    ] {
        envs.insert(name.to_string(), platform.model.clone());
    }
    let small_model = platform.small_model.as_ref().unwrap_or(&platform.model);
    envs.insert("ANTHROPIC_SMALL_FAST_MODEL".to_string(), small_model.clone());

    if let Some(tokens) = platform.max_output_tokens {
        envs.insert("CLAUDE_CODE_MAX_OUTPUT_TOKENS".to_string(), tokens.to_string());
    }
    if let Some(path) = prefs.git_bash_path.as_deref().filter(|p| !p.trim().is_empty()) {
        envs.insert("CLAUDE_CODE_GIT_BASH_PATH".to_string(), path.to_string());
    }
    envs
}

/// Computes the child's environment plan within `environment.timeout_seconds`.
pub fn prepare(
    platform: &PlatformDefinition,
    prefs: &LauncherPreferences,
    inherited: Vec<String>,
) -> Result<EnvironmentPlan, LauncherError> {
    let seconds = prefs.environment.timeout_seconds;
    let platform = platform.clone();
    let prefs = prefs.clone();
    let plan = run_with_deadline(Duration::from_secs(seconds), seconds, move || {
        let remove = if prefs.environment.clear_existing {
            clear(inherited)
        } else {
            Vec::new()
        };
        EnvironmentPlan {
            remove,
            set: build(&platform, &prefs),
        }
    })?;
    debug!(
        removed = plan.remove.len(),
        set = plan.set.len(),
        "environment prepared"
    );
    Ok(plan)
}

fn run_with_deadline<T, F>(timeout: Duration, seconds: u64, job: F) -> Result<T, LauncherError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("environment-setup".to_string())
        .spawn(move || {
            let _ = tx.send(job());
        })?;
    rx.recv_timeout(timeout).map_err(|err| match err {
        RecvTimeoutError::Timeout => LauncherError::EnvironmentSetupTimeout { seconds },
        RecvTimeoutError::Disconnected => LauncherError::Io(io::Error::new(
            io::ErrorKind::Other,
            "environment setup worker exited without a result",
        )),
    })
}
