use crate::config::{ConfigStore, LauncherPreferences};
use crate::detector::ExecutableDetector;
use crate::environment::{self, EnvironmentPlan};
use crate::error::LauncherError;
use crate::platform;
use crate::session::{SessionDecision, SessionManager};
use crate::session_mapper::SessionMapper;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};
use tracing::{debug, info, warn};

/// What the user asked for on the command line.
#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    pub platform: Option<String>,
    pub continue_session: bool,
    pub passthrough: Vec<String>,
}

/// Everything decided before the assistant is spawned.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub platform_key: String,
    pub platform_name: String,
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub environment: EnvironmentPlan,
    pub decision: SessionDecision,
}

pub trait ChildRunner {
    /// Runs `program` to completion and returns the exit code to propagate.
    fn run(&self, program: &Path, args: &[String], env: &EnvironmentPlan) -> Result<i32, LauncherError>;
}

/// Exit code reported when the launcher itself was interrupted.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

pub struct ProcessRunner {
    // SIGINT typed at the controlling terminal already reaches the child.
    #[cfg_attr(not(unix), allow(dead_code))]
    terminal_delivers_interrupt: bool,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self {
            terminal_delivers_interrupt: in_terminal_foreground(),
        }
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ChildRunner for ProcessRunner {
    fn run(&self, program: &Path, args: &[String], env: &EnvironmentPlan) -> Result<i32, LauncherError> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        for name in &env.remove {
            cmd.env_remove(name);
        }
        cmd.envs(&env.set);
        let code = self.run_relaying_signals(&mut cmd, program)?;
        info!(code, "assistant exited");
        Ok(code)
    }
}

fn spawn(cmd: &mut Command, program: &Path) -> Result<Child, LauncherError> {
    let child = cmd.spawn().map_err(|err| {
        LauncherError::ChildProcess(format!("failed to start {}: {err}", program.display()))
    })?;
    debug!(pid = child.id(), program = %program.display(), "assistant started");
    Ok(child)
}

fn wait(child: &mut Child) -> Result<ExitStatus, LauncherError> {
    child
        .wait()
        .map_err(|err| LauncherError::ChildProcess(format!("failed to wait for assistant: {err}")))
}

#[cfg(unix)]
impl ProcessRunner {
    fn run_relaying_signals(&self, cmd: &mut Command, program: &Path) -> Result<i32, LauncherError> {
        use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;
        use std::thread;

        // Registered before the spawn so a signal arriving in between is queued.
        let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
        let handle = signals.handle();
        let mut child = spawn(cmd, program)?;
        let pid = child.id() as libc::pid_t;
        let interrupted = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&interrupted);
        let forward_interrupt = !self.terminal_delivers_interrupt;
        let forwarder = thread::Builder::new()
            .name("signal-forwarder".to_string())
            .spawn(move || {
                for signal in signals.forever() {
                    if signal == SIGINT {
                        seen.store(true, Ordering::SeqCst);
                        if !forward_interrupt {
                            debug!("interrupt received; the terminal delivered it to the assistant");
                            continue;
                        }
                    }
                    debug!(signal, pid, "forwarding signal to assistant");
                    // SAFETY: kill has no memory-safety preconditions.
                    unsafe {
                        libc::kill(pid, signal);
                    }
                }
            });
        let forwarder = match forwarder {
            Ok(forwarder) => Some(forwarder),
            Err(err) => {
                warn!(error = %err, "signals will not be forwarded to the assistant");
                None
            }
        };

        let status = wait(&mut child);
        handle.close();
        if let Some(forwarder) = forwarder {
            let _ = forwarder.join();
        }
        let status = status?;
        if interrupted.load(Ordering::SeqCst) && status.code().is_some() {
            info!(status = %status, "launcher was interrupted");
            return Ok(INTERRUPTED_EXIT_CODE);
        }
        Ok(exit_code(status))
    }
}

#[cfg(not(unix))]
impl ProcessRunner {
    fn run_relaying_signals(&self, cmd: &mut Command, program: &Path) -> Result<i32, LauncherError> {
        let mut child = spawn(cmd, program)?;
        Ok(exit_code(wait(&mut child)?))
    }
}

/// True when the launcher's process group owns a controlling terminal, so
/// a typed interrupt reaches the child without help.
#[cfg(unix)]
fn in_terminal_foreground() -> bool {
    // SAFETY: tcgetpgrp and getpgrp only query process state.
    unsafe {
        let group = libc::getpgrp();
        [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO]
            .into_iter()
            .map(|fd| libc::tcgetpgrp(fd))
            .any(|foreground| foreground != -1 && foreground == group)
    }
}

#[cfg(not(unix))]
fn in_terminal_foreground() -> bool {
    false
}

/// The child's own code, or `128 + signal` when a signal ended it.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

pub struct LauncherEngine {
    config: ConfigStore,
    search_path: Option<OsString>,
    inherited: Vec<String>,
}

impl LauncherEngine {
    pub fn new(config: ConfigStore) -> Self {
        Self {
            config,
            search_path: env::var_os("PATH"),
            inherited: env::vars_os()
                .filter_map(|(name, _)| name.into_string().ok())
                .collect(),
        }
    }

    #[cfg(test)]
    pub fn with_search_path(mut self, search_path: Option<OsString>) -> Self {
        self.search_path = search_path;
        self
    }

    #[cfg(test)]
    pub fn with_inherited(mut self, names: Vec<String>) -> Self {
        self.inherited = names;
        self
    }

    pub fn detector(&self, prefs: &LauncherPreferences) -> ExecutableDetector {
        let detector = ExecutableDetector::new(self.search_path.clone());
        if prefs.remember_executable {
            detector.remembering(self.config.paths().executable_cache.clone())
        } else {
            detector
        }
    }

    /// Runs every step up to, but not including, spawning the assistant.
    pub fn prepare(&self, request: &LaunchRequest) -> Result<LaunchPlan, LauncherError> {
        let loaded = self.config.load()?;
        let prefs = &loaded.preferences;
        let paths = self.config.paths();

        let token = request
            .platform
            .clone()
            .or_else(|| prefs.default_platform.clone())
            .unwrap_or_default();
        let platform = platform::resolve(&token, &loaded.registry)?;

        let environment = environment::prepare(platform, prefs, self.inherited.clone())?;

        let sessions = SessionManager::new(&paths.session_store, &loaded.registry);
        if let Err(err) = sessions.cleanup(prefs.session_retention_days) {
            warn!(path = %paths.session_store.display(), error = %err, "session cleanup skipped");
        }
        let continue_requested = request.continue_session || prefs.continue_last_session;
        let decision = match sessions.get_or_create(&platform.key, continue_requested, prefs) {
            Err(LauncherError::NoSessionToContinue { platform: key }) => {
                warn!(platform = %key, "no session to continue; starting a new one");
                SessionDecision::Created(sessions.create(&key)?)
            }
            other => other?,
        };

        let mapper = SessionMapper::new(&paths.session_mappings);
        match decision.session() {
            Some(session) => mapper.publish(&platform.key, session),
            None => mapper.retract(&platform.key),
        };

        let command = self.detector(prefs).locate(&prefs.claude_executable)?;
        let mut args = command.leading_args;
        args.extend(child_args(&decision, &request.passthrough));

        Ok(LaunchPlan {
            platform_key: platform.key.clone(),
            platform_name: platform.name.clone(),
            executable: command.program,
            args,
            environment,
            decision,
        })
    }

    pub fn run(&self, plan: &LaunchPlan, runner: &dyn ChildRunner) -> Result<i32, LauncherError> {
        info!(
            platform = %plan.platform_key,
            executable = %plan.executable.display(),
            args = ?plan.args,
            "launching assistant"
        );
        runner.run(&plan.executable, &plan.args, &plan.environment)
    }
}

fn child_args(decision: &SessionDecision, passthrough: &[String]) -> Vec<String> {
    let mut args = match decision {
        SessionDecision::Reused(_) => vec!["--continue".to_string()],
        SessionDecision::Created(session) => vec!["--session-id".to_string(), session.id.clone()],
        SessionDecision::Untracked => Vec::new(),
    };
    args.extend(passthrough.iter().cloned());
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::LauncherPaths;
    use crate::session_mapper::SessionMapper;
    use std::cell::RefCell;
    use std::fs;
    use tempfile::{tempdir, TempDir};

    #[derive(Debug, Clone)]
    struct RecordedRun {
        program: PathBuf,
        args: Vec<String>,
        env: EnvironmentPlan,
    }

    #[derive(Default)]
    struct FakeRunner {
        calls: RefCell<Vec<RecordedRun>>,
        exit_code: i32,
    }

    impl ChildRunner for FakeRunner {
        fn run(&self, program: &Path, args: &[String], env: &EnvironmentPlan) -> Result<i32, LauncherError> {
            self.calls.borrow_mut().push(RecordedRun {
                program: program.to_path_buf(),
                args: args.to_vec(),
                env: env.clone(),
            });
            Ok(self.exit_code)
        }
    }

    const REGISTRY: &str = r#"{
        "platforms": {
            "deepseek": {"name": "DeepSeek", "api_base_url": "https://api.deepseek.com/anthropic", "api_key": "sk-dp", "model": "deepseek-chat", "enabled": true},
            "kimi": {"name": "Kimi", "api_base_url": "https://api.moonshot.cn/anthropic", "auth_token": "kimi-token", "model": "kimi-k2", "enabled": true},
            "siliconflow": {"name": "SiliconFlow", "api_base_url": "https://api.siliconflow.cn", "api_key": "sk-sf", "model": "k2", "enabled": false}
        },
        "default_platform": "kimi",
        "aliases": {"dp": "deepseek"}
    }"#;

    fn setup(launcher_json: &str) -> (TempDir, LauncherPaths) {
        let dir = tempdir().unwrap();
        let paths = LauncherPaths::from_root(dir.path());
        fs::create_dir_all(paths.config_dir()).unwrap();
        fs::write(&paths.platforms_file, REGISTRY).unwrap();
        fs::write(&paths.launcher_file, launcher_json).unwrap();
        (dir, paths)
    }

    #[cfg(unix)]
    fn fake_claude(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let bin = dir.join("bin");
        fs::create_dir_all(&bin).unwrap();
        let path = bin.join("claude");
        fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn launch(engine: &LauncherEngine, request: &LaunchRequest, runner: &FakeRunner) -> Result<i32, LauncherError> {
        let plan = engine.prepare(request)?;
        engine.run(&plan, runner)
    }

    fn engine(paths: &LauncherPaths, search: Option<&Path>) -> LauncherEngine {
        LauncherEngine::new(ConfigStore::new(paths.clone()))
            .with_search_path(search.map(|p| p.as_os_str().to_owned()))
            .with_inherited(vec![
                "PATH".to_string(),
                "ANTHROPIC_API_KEY".to_string(),
                "MOONSHOT_API_KEY".to_string(),
            ])
    }

    #[test]
    fn missing_executable_aborts_after_session_is_mapped() {
        let (_dir, paths) = setup(r#"{"claude_executable": "/nonexistent"}"#);
        let engine = engine(&paths, None);
        let runner = FakeRunner::default();
        let request = LaunchRequest {
            platform: Some("kimi".to_string()),
            ..LaunchRequest::default()
        };

        let err = launch(&engine, &request, &runner).unwrap_err();
        assert_eq!(err.kind(), "ExecutableNotFound");
        assert!(runner.calls.borrow().is_empty());

        let mappings = SessionMapper::new(&paths.session_mappings).read();
        assert!(mappings.contains_key("kimi"));
        assert!(paths.session_store.exists());
    }

    #[test]
    fn disabled_platform_short_circuits_before_sessions() {
        let (_dir, paths) = setup("{}");
        let engine = engine(&paths, None);
        let request = LaunchRequest {
            platform: Some("siliconflow".to_string()),
            ..LaunchRequest::default()
        };
        let err = engine.prepare(&request).unwrap_err();
        assert_eq!(err.kind(), "PlatformDisabled");
        assert!(!paths.session_store.exists());
    }

    #[cfg(unix)]
    #[test]
    fn launch_passes_session_and_environment_to_child() {
        let (dir, paths) = setup("{}");
        let claude = fake_claude(dir.path());
        let bin = claude.parent().unwrap().to_path_buf();
        let engine = engine(&paths, Some(&bin));
        let runner = FakeRunner {
            exit_code: 3,
            ..FakeRunner::default()
        };
        let request = LaunchRequest {
            platform: Some("dp".to_string()),
            continue_session: false,
            passthrough: vec!["--verbose".to_string()],
        };

        assert_eq!(launch(&engine, &request, &runner).unwrap(), 3);
        let calls = runner.calls.borrow();
        let call = &calls[0];
        assert_eq!(call.program, claude);
        assert_eq!(call.args[0], "--session-id");
        assert!(call.args[1].starts_with("01"));
        assert_eq!(call.args[2], "--verbose");
        assert_eq!(call.env.set["ANTHROPIC_API_KEY"], "sk-dp");
        assert_eq!(call.env.remove, vec!["ANTHROPIC_API_KEY", "MOONSHOT_API_KEY"]);

        let mappings = SessionMapper::new(&paths.session_mappings).read();
        assert_eq!(mappings["deepseek"].session_id, call.args[1]);
    }

    #[cfg(unix)]
    #[test]
    fn continue_reuses_or_falls_back_to_new_session() {
        let (dir, paths) = setup("{}");
        let claude = fake_claude(dir.path());
        let bin = claude.parent().unwrap().to_path_buf();
        let engine = engine(&paths, Some(&bin));
        let request = LaunchRequest {
            platform: None,
            continue_session: true,
            passthrough: Vec::new(),
        };

        let first = engine.prepare(&request).unwrap();
        assert_eq!(first.platform_key, "kimi");
        assert!(matches!(first.decision, SessionDecision::Created(_)));
        assert_eq!(first.args[0], "--session-id");

        let second = engine.prepare(&request).unwrap();
        assert!(matches!(second.decision, SessionDecision::Reused(_)));
        assert_eq!(second.args, vec!["--continue"]);
        assert_eq!(
            second.decision.session().map(|s| &s.id),
            first.decision.session().map(|s| &s.id)
        );
    }

    #[cfg(unix)]
    #[test]
    fn untracked_launch_retracts_mapping() {
        let (dir, paths) = setup(r#"{"auto_create_session": false}"#);
        let claude = fake_claude(dir.path());
        let bin = claude.parent().unwrap().to_path_buf();
        let engine = engine(&paths, Some(&bin));
        let request = LaunchRequest {
            platform: Some("kimi".to_string()),
            ..LaunchRequest::default()
        };
        let plan = engine.prepare(&request).unwrap();
        assert_eq!(plan.decision, SessionDecision::Untracked);
        assert!(plan.args.is_empty());
        assert!(!SessionMapper::new(&paths.session_mappings).read().contains_key("kimi"));
    }

    #[cfg(unix)]
    #[test]
    fn signal_termination_maps_to_128_plus_signal() {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(exit_code(ExitStatus::from_raw(2)), 130);
        assert_eq!(exit_code(ExitStatus::from_raw(15)), 143);
        assert_eq!(exit_code(ExitStatus::from_raw(7 << 8)), 7);
    }

    #[cfg(unix)]
    #[test]
    fn process_runner_propagates_child_exit_code() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let script = dir.path().join("assistant");
        fs::write(&script, "#!/bin/sh\n[ -z \"$STALE\" ] || exit 9\nexit \"$CODE\"\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        let mut plan = EnvironmentPlan::default();
        plan.set.insert("CODE".to_string(), "4".to_string());
        plan.remove.push("STALE".to_string());
        let runner = ProcessRunner {
            terminal_delivers_interrupt: false,
        };
        assert_eq!(runner.run(&script, &[], &plan).unwrap(), 4);
    }

    #[cfg(unix)]
    #[test]
    fn package_runner_arguments_precede_session_arguments() {
        use std::os::unix::fs::PermissionsExt;
        let (dir, paths) = setup("{}");
        let bin = dir.path().join("bin");
        fs::create_dir_all(&bin).unwrap();
        let npx = bin.join("npx");
        fs::write(&npx, "#!/bin/sh\necho '1.0.0 (Claude Code)'\n").unwrap();
        fs::set_permissions(&npx, fs::Permissions::from_mode(0o755)).unwrap();
        let engine = engine(&paths, Some(&bin));
        let request = LaunchRequest {
            platform: Some("kimi".to_string()),
            continue_session: false,
            passthrough: vec!["--verbose".to_string()],
        };

        let plan = engine.prepare(&request).unwrap();
        assert_eq!(plan.executable, npx);
        assert_eq!(plan.args[0], "@anthropic-ai/claude-code");
        assert_eq!(plan.args[1], "--session-id");
        assert!(plan.args[2].starts_with("02"));
        assert_eq!(plan.args[3], "--verbose");
    }
}
