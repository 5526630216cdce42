use crate::error::LauncherError;
use crate::paths::LauncherPaths;
use crate::store::{self, FileLock, LockError, LOCK_TIMEOUT};
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use std::cell::OnceCell;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const DEFAULT_PLATFORMS_JSON: &str = include_str!("../config/platforms.default.json");
const DEFAULT_LAUNCHER_JSON: &str = include_str!("../config/launcher.default.json");

const CREDENTIAL_FIELDS: &str = "login_token, api_key, auth_token";

/// The single credential a platform authenticates with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    LoginToken(String),
    ApiKey(String),
    AuthToken(String),
}

impl Credential {
    pub fn field_name(&self) -> &'static str {
        match self {
            Credential::LoginToken(_) => "login_token",
            Credential::ApiKey(_) => "api_key",
            Credential::AuthToken(_) => "auth_token",
        }
    }

    pub fn secret(&self) -> &str {
        match self {
            Credential::LoginToken(value)
            | Credential::ApiKey(value)
            | Credential::AuthToken(value) => value,
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.secret().trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformDefinition {
    pub key: String,
    pub name: String,
    pub api_base_url: String,
    pub credential: Credential,
    pub model: String,
    pub small_model: Option<String>,
    pub max_output_tokens: Option<u32>,
    pub enabled: bool,
}

impl PlatformDefinition {
    pub fn has_credential(&self) -> bool {
        self.credential.is_configured()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LauncherRegistry {
    pub source: PathBuf,
    pub platforms: BTreeMap<String, PlatformDefinition>,
    pub default_platform: Option<String>,
    pub aliases: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LauncherPreferences {
    pub default_platform: Option<String>,
    pub claude_executable: String,
    pub git_bash_path: Option<String>,
    pub auto_create_session: bool,
    pub continue_last_session: bool,
    pub environment: EnvironmentPreferences,
    pub session_retention_days: u32,
    pub remember_executable: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EnvironmentPreferences {
    pub clear_existing: bool,
    pub timeout_seconds: u64,
}

impl Default for LauncherPreferences {
    fn default() -> Self {
        Self {
            default_platform: None,
            claude_executable: "claude".to_string(),
            git_bash_path: None,
            auto_create_session: true,
            continue_last_session: false,
            environment: EnvironmentPreferences::default(),
            session_retention_days: 30,
            remember_executable: false,
        }
    }
}

impl Default for EnvironmentPreferences {
    fn default() -> Self {
        Self {
            clear_existing: true,
            timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegistryFile {
    #[serde(deserialize_with = "unique_map")]
    platforms: BTreeMap<String, PlatformRecord>,
    #[serde(default)]
    default_platform: Option<String>,
    #[serde(default, deserialize_with = "unique_map")]
    aliases: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PlatformRecord {
    name: String,
    api_base_url: String,
    #[serde(default)]
    login_token: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    auth_token: Option<String>,
    model: String,
    enabled: bool,
    #[serde(default)]
    small_model: Option<String>,
    #[serde(default)]
    claude_code_config: Option<ClaudeCodeConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ClaudeCodeConfig {
    #[serde(default)]
    max_output_tokens: Option<u32>,
}

impl PlatformRecord {
    fn credential(&self) -> Result<Credential, String> {
        let slots = [
            self.login_token.clone().map(Credential::LoginToken),
            self.api_key.clone().map(Credential::ApiKey),
            self.auth_token.clone().map(Credential::AuthToken),
        ];
        let present: Vec<Credential> = slots.into_iter().flatten().collect();
        let configured: Vec<&str> = present
            .iter()
            .filter(|c| c.is_configured())
            .map(|c| c.field_name())
            .collect();
        if configured.len() > 1 {
            return Err(format!(
                "credential is ambiguous ({}); set only one of {CREDENTIAL_FIELDS}",
                configured.join(", ")
            ));
        }
        // An empty slot still fixes the credential kind for a platform not yet configured.
        present
            .iter()
            .find(|c| c.is_configured())
            .or_else(|| present.first())
            .cloned()
            .ok_or_else(|| format!("no credential field; set one of {CREDENTIAL_FIELDS}"))
    }
}

fn unique_map<'de, D, V>(deserializer: D) -> Result<BTreeMap<String, V>, D::Error>
where
    D: Deserializer<'de>,
    V: Deserialize<'de>,
{
    struct UniqueMapVisitor<V>(PhantomData<V>);

    impl<'de, V: Deserialize<'de>> Visitor<'de> for UniqueMapVisitor<V> {
        type Value = BTreeMap<String, V>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("an object with unique keys")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
            let mut map = BTreeMap::new();
            while let Some((key, value)) = access.next_entry::<String, V>()? {
                if map.contains_key(&key) {
                    return Err(de::Error::custom(format!("duplicate key `{key}`")));
                }
                map.insert(key, value);
            }
            Ok(map)
        }
    }

    deserializer.deserialize_map(UniqueMapVisitor(PhantomData))
}

fn parse_registry(path: &Path, content: &str) -> Result<LauncherRegistry, Vec<String>> {
    let file: RegistryFile = serde_json::from_str(content).map_err(|err| vec![err.to_string()])?;
    let mut problems = Vec::new();
    let mut platforms = BTreeMap::new();

    for (key, record) in &file.platforms {
        if key.trim().is_empty() {
            problems.push("platforms: platform key must be non-empty".to_string());
            continue;
        }
        let credential = match record.credential() {
            Ok(credential) => credential,
            Err(problem) => {
                problems.push(format!("platforms.{key}: {problem}"));
                continue;
            }
        };
        if record.enabled && record.api_base_url.trim().is_empty() {
            problems.push(format!("platforms.{key}.api_base_url must be non-empty"));
        }
        if record.enabled && record.model.trim().is_empty() {
            problems.push(format!("platforms.{key}.model must be non-empty"));
        }
        platforms.insert(
            key.clone(),
            PlatformDefinition {
                key: key.clone(),
                name: record.name.clone(),
                api_base_url: record.api_base_url.clone(),
                credential,
                model: record.model.clone(),
                small_model: record.small_model.clone().filter(|m| !m.trim().is_empty()),
                max_output_tokens: record
                    .claude_code_config
                    .as_ref()
                    .and_then(|c| c.max_output_tokens),
                enabled: record.enabled,
            },
        );
    }

    for (alias, target) in &file.aliases {
        if !file.platforms.contains_key(target) {
            problems.push(format!("aliases.{alias} points to unknown platform '{target}'"));
        }
    }
    if let Some(default) = &file.default_platform {
        if !file.platforms.contains_key(default) {
            problems.push(format!("default_platform '{default}' is not a configured platform"));
        }
    }

    if !problems.is_empty() {
        return Err(problems);
    }
    Ok(LauncherRegistry {
        source: path.to_path_buf(),
        platforms,
        default_platform: file.default_platform,
        aliases: file.aliases,
    })
}

#[cfg(test)]
pub(crate) fn registry_from_json(content: &str) -> LauncherRegistry {
    parse_registry(Path::new("platforms.json"), content).expect("valid test registry")
}

fn parse_preferences(content: &str) -> Result<LauncherPreferences, Vec<String>> {
    let prefs: LauncherPreferences =
        serde_json::from_str(content).map_err(|err| vec![err.to_string()])?;
    let mut problems = Vec::new();
    if prefs.claude_executable.trim().is_empty() {
        problems.push("claude_executable must be non-empty".to_string());
    }
    if prefs.environment.timeout_seconds == 0 {
        problems.push("environment.timeout_seconds must be greater than 0".to_string());
    }
    if !problems.is_empty() {
        return Err(problems);
    }
    Ok(prefs)
}

fn preference_problems(prefs: &LauncherPreferences, registry: &LauncherRegistry) -> Vec<String> {
    let mut problems = Vec::new();
    if let Some(default) = prefs.default_platform.as_deref().map(str::trim) {
        if !default.is_empty()
            && !registry.platforms.contains_key(default)
            && !registry.aliases.contains_key(default)
        {
            problems.push(format!(
                "default_platform '{default}' is neither a platform key nor an alias"
            ));
        }
    }
    problems
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub registry: LauncherRegistry,
    pub preferences: LauncherPreferences,
}

/// Loads and initializes `platforms.json` and `launcher.json`.
///
/// The first successful `load` is cached for the lifetime of the store, which
/// the launcher keeps for exactly one invocation.
pub struct ConfigStore {
    paths: LauncherPaths,
    cache: OnceCell<LoadedConfig>,
}

impl ConfigStore {
    pub fn new(paths: LauncherPaths) -> Self {
        Self {
            paths,
            cache: OnceCell::new(),
        }
    }

    pub fn paths(&self) -> &LauncherPaths {
        &self.paths
    }

    pub fn load(&self) -> Result<LoadedConfig, LauncherError> {
        if let Some(cached) = self.cache.get() {
            return Ok(cached.clone());
        }
        let platforms_path = &self.paths.platforms_file;
        let launcher_path = &self.paths.launcher_file;

        let Some(registry_text) = store::read_optional(platforms_path)? else {
            return Err(LauncherError::ConfigMissing {
                path: platforms_path.clone(),
            });
        };
        let registry = parse_registry(platforms_path, &registry_text).map_err(|problems| {
            LauncherError::ConfigInvalid {
                path: platforms_path.clone(),
                problems,
            }
        })?;

        let preferences = match store::read_optional(launcher_path)? {
            Some(text) => parse_preferences(&text).map_err(|problems| {
                LauncherError::ConfigInvalid {
                    path: launcher_path.clone(),
                    problems,
                }
            })?,
            None => {
                debug!(path = %launcher_path.display(), "launcher.json missing; using defaults");
                LauncherPreferences::default()
            }
        };
        let problems = preference_problems(&preferences, &registry);
        if !problems.is_empty() {
            return Err(LauncherError::ConfigInvalid {
                path: launcher_path.clone(),
                problems,
            });
        }

        debug!(
            platforms = registry.platforms.len(),
            aliases = registry.aliases.len(),
            "configuration loaded"
        );
        let loaded = LoadedConfig {
            registry,
            preferences,
        };
        Ok(self.cache.get_or_init(|| loaded).clone())
    }

    pub fn init_defaults(&self) -> Result<Vec<PathBuf>, LauncherError> {
        fs::create_dir_all(self.paths.config_dir())?;
        let _lock = FileLock::acquire(&self.paths.config_lock, LOCK_TIMEOUT)
            .map_err(config_lock_error)?;

        for path in [&self.paths.platforms_file, &self.paths.launcher_file] {
            if path.exists() {
                return Err(LauncherError::AlreadyInitialized { path: path.clone() });
            }
        }
        store::write_atomic(&self.paths.platforms_file, DEFAULT_PLATFORMS_JSON)?;
        store::write_atomic(&self.paths.launcher_file, DEFAULT_LAUNCHER_JSON)?;
        info!(dir = %self.paths.config_dir().display(), "configuration initialized");
        Ok(vec![
            self.paths.platforms_file.clone(),
            self.paths.launcher_file.clone(),
        ])
    }

    /// Reports every problem found in both files without touching the cache.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let registry = match read_for_validation(&self.paths.platforms_file, &mut problems) {
            Some(text) => match parse_registry(&self.paths.platforms_file, &text) {
                Ok(registry) => Some(registry),
                Err(found) => {
                    extend_prefixed(&mut problems, &self.paths.platforms_file, found);
                    None
                }
            },
            None => None,
        };

        let prefs = match store::read_optional(&self.paths.launcher_file) {
            Ok(Some(text)) => match parse_preferences(&text) {
                Ok(prefs) => Some(prefs),
                Err(found) => {
                    extend_prefixed(&mut problems, &self.paths.launcher_file, found);
                    None
                }
            },
            Ok(None) => Some(LauncherPreferences::default()),
            Err(err) => {
                problems.push(format!("{}: {err}", file_label(&self.paths.launcher_file)));
                None
            }
        };

        if let (Some(registry), Some(prefs)) = (registry, prefs) {
            let found = preference_problems(&prefs, &registry);
            extend_prefixed(&mut problems, &self.paths.launcher_file, found);
        }
        problems
    }
}

fn read_for_validation(path: &Path, problems: &mut Vec<String>) -> Option<String> {
    match store::read_optional(path) {
        Ok(Some(text)) => Some(text),
        Ok(None) => {
            problems.push(format!(
                "{}: file does not exist; run --init-config",
                file_label(path)
            ));
            None
        }
        Err(err) => {
            problems.push(format!("{}: {err}", file_label(path)));
            None
        }
    }
}

fn extend_prefixed(problems: &mut Vec<String>, path: &Path, found: Vec<String>) {
    let label = file_label(path);
    problems.extend(found.into_iter().map(|p| format!("{label}: {p}")));
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

fn config_lock_error(err: LockError) -> LauncherError {
    match err {
        LockError::TimedOut(path) => LauncherError::Io(io::Error::new(
            io::ErrorKind::WouldBlock,
            format!("{} is held by another cc-launcher process", path.display()),
        )),
        LockError::Io(err) => LauncherError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store_in(dir: &Path) -> ConfigStore {
        ConfigStore::new(LauncherPaths::from_root(dir))
    }

    fn write_registry(store: &ConfigStore, body: &str) {
        store::write_atomic(&store.paths().platforms_file, body).unwrap();
    }

    #[test]
    fn init_then_load_yields_disabled_registry_without_problems() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let created = store.init_defaults().unwrap();
        assert_eq!(created.len(), 2);

        let loaded = store.load().unwrap();
        assert!(!loaded.registry.platforms.is_empty());
        assert!(loaded.registry.platforms.values().all(|p| !p.enabled));
        assert_eq!(loaded.preferences, LauncherPreferences::default());
        assert!(store.validate().is_empty());
    }

    #[test]
    fn init_refuses_to_overwrite_existing_files() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store.init_defaults().unwrap();
        fs::write(&store.paths().launcher_file, "{\"auto_create_session\": false}\n").unwrap();

        let err = store.init_defaults().unwrap_err();
        assert!(matches!(err, LauncherError::AlreadyInitialized { .. }));
        let content = fs::read_to_string(&store.paths().launcher_file).unwrap();
        assert_eq!(content, "{\"auto_create_session\": false}\n");
    }

    #[test]
    fn load_without_files_is_config_missing() {
        let dir = tempdir().unwrap();
        let err = store_in(dir.path()).load().unwrap_err();
        assert_eq!(err.kind(), "ConfigMissing");
    }

    #[test]
    fn missing_launcher_file_uses_default_preferences() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        write_registry(
            &store,
            r#"{"platforms": {"deepseek": {"name": "DeepSeek", "api_base_url": "https://api.deepseek.com/anthropic", "api_key": "sk-1", "model": "deepseek-chat", "enabled": true}}}"#,
        );
        let loaded = store.load().unwrap();
        assert!(loaded.preferences.auto_create_session);
        assert_eq!(
            loaded.registry.platforms["deepseek"].credential,
            Credential::ApiKey("sk-1".to_string())
        );
    }

    #[test]
    fn duplicate_platform_keys_are_rejected() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        write_registry(
            &store,
            r#"{"platforms": {
                "kimi": {"name": "Kimi", "api_base_url": "https://a", "auth_token": "t", "model": "k2", "enabled": true},
                "kimi": {"name": "Kimi 2", "api_base_url": "https://b", "auth_token": "t", "model": "k2", "enabled": true}
            }}"#,
        );
        let err = store.load().unwrap_err();
        match err {
            LauncherError::ConfigInvalid { problems, .. } => {
                assert!(problems[0].contains("duplicate key `kimi`"), "{problems:?}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn validate_collects_every_structural_problem() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        write_registry(
            &store,
            r#"{
                "platforms": {
                    "deepseek": {"name": "DeepSeek", "api_base_url": "https://a", "api_key": "k", "auth_token": "t", "model": "m", "enabled": true},
                    "kimi": {"name": "Kimi", "api_base_url": "https://b", "model": "k2", "enabled": false}
                },
                "default_platform": "gaccode",
                "aliases": {"sf": "siliconflow"}
            }"#,
        );
        let problems = store.validate();
        assert_eq!(problems.len(), 4, "{problems:?}");
        assert!(problems.iter().all(|p| p.starts_with("platforms.json: ")));
        assert!(problems.iter().any(|p| p.contains("platforms.deepseek: credential is ambiguous")));
        assert!(problems.iter().any(|p| p.contains("platforms.kimi: no credential field")));
        assert!(problems.iter().any(|p| p.contains("aliases.sf points to unknown platform")));
        assert!(problems.iter().any(|p| p.contains("default_platform 'gaccode'")));
        assert!(!store.paths().launcher_file.exists());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store.init_defaults().unwrap();
        fs::write(&store.paths().launcher_file, "{\"unknown_field\": true}\n").unwrap();
        let err = store.load().unwrap_err();
        assert_eq!(err.kind(), "ConfigInvalid");
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn preferences_default_platform_must_resolve() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store.init_defaults().unwrap();
        fs::write(&store.paths().launcher_file, "{\"default_platform\": \"nope\"}\n").unwrap();
        let problems = store.validate();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("launcher.json: default_platform 'nope'"));

        fs::write(&store.paths().launcher_file, "{\"default_platform\": \"dp\"}\n").unwrap();
        assert!(store.validate().is_empty());
    }

    #[test]
    fn load_is_cached_for_the_store_lifetime() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store.init_defaults().unwrap();
        let first = store.load().unwrap();
        fs::write(&store.paths().platforms_file, "not json").unwrap();
        assert_eq!(store.load().unwrap().registry, first.registry);
        assert!(store_in(dir.path()).load().is_err());
    }
}
