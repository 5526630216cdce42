mod config;
mod detector;
mod environment;
mod error;
mod launcher;
mod logging;
mod paths;
mod platform;
mod session;
mod session_mapper;
mod store;

use clap::{ArgGroup, Parser};
use config::{ConfigStore, LoadedConfig};
use dialoguer::console::style;
use error::LauncherError;
use launcher::{LaunchPlan, LaunchRequest, LauncherEngine, ProcessRunner};
use paths::LauncherPaths;
use serde::Serialize;
use serde_json::json;
use session::{SessionDecision, SessionManager};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "cc-launcher",
    version,
    about = "Launch Claude Code against one of several API platforms"
)]
#[command(group(
    ArgGroup::new("mode")
        .args(["list", "check_config", "init_config", "sessions", "cleanup_sessions"])
        .multiple(false)
))]
struct Cli {
    /// Platform key or alias; the configured default is used when omitted.
    platform: Option<String>,
    /// Continue the platform's current session.
    #[arg(short = 'c', long = "continue")]
    continue_session: bool,
    /// List configured platforms.
    #[arg(long)]
    list: bool,
    /// Validate configuration without launching.
    #[arg(long)]
    check_config: bool,
    /// Create default configuration files.
    #[arg(long)]
    init_config: bool,
    /// List stored sessions.
    #[arg(long)]
    sessions: bool,
    /// Remove sessions unused for DAYS (defaults to session_retention_days).
    #[arg(long, value_name = "DAYS", num_args = 0..=1)]
    cleanup_sessions: Option<Option<u32>>,
    #[arg(long, global = true)]
    debug: bool,
    #[arg(long, global = true)]
    json: bool,
    #[arg(long, hide = true)]
    config_dir: Option<PathBuf>,
    /// Arguments passed through to Claude Code.
    #[arg(last = true)]
    passthrough: Vec<String>,
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_details: Option<ErrorDetails>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
struct ErrorDetails {
    error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    problems: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
struct Context {
    paths: LauncherPaths,
    json: bool,
}

fn main() {
    let cli = Cli::parse();
    let root = paths::resolve_root(cli.config_dir.as_ref());
    let paths = LauncherPaths::from_root(root);
    logging::init_logging(&paths.log_dir, cli.debug);
    let ctx = Context {
        paths,
        json: cli.json,
    };

    let result = if cli.init_config {
        handle_init_config(&ctx).map(|()| 0)
    } else if cli.check_config {
        handle_check_config(&ctx).map(|()| 0)
    } else if cli.list {
        handle_list(&ctx).map(|()| 0)
    } else if cli.sessions {
        handle_sessions(&ctx).map(|()| 0)
    } else if let Some(days) = cli.cleanup_sessions {
        handle_cleanup_sessions(&ctx, days).map(|()| 0)
    } else {
        handle_launch(&ctx, cli)
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            tracing::debug!(kind = err.kind(), "{err}");
            if ctx.json {
                let payload = JsonResult::<serde_json::Value> {
                    ok: false,
                    result: None,
                    error: Some(err.to_string()),
                    error_details: Some(error_details(&err)),
                };
                if print_json(&payload).is_err() {
                    eprintln!("{err}");
                }
            } else {
                eprintln!("{} {err}", style("error:").red().bold());
            }
            std::process::exit(1);
        }
    }
}

fn handle_init_config(ctx: &Context) -> Result<(), LauncherError> {
    let store = ConfigStore::new(ctx.paths.clone());
    let created = store.init_defaults()?;
    if ctx.json {
        return output(ctx, json!({ "created": created }));
    }
    for path in &created {
        println!("{} {}", style("created").green(), path.display());
    }
    println!(
        "{}",
        style("Add a credential and set \"enabled\": true for the platforms you use.").dim()
    );
    Ok(())
}

fn handle_check_config(ctx: &Context) -> Result<(), LauncherError> {
    let store = ConfigStore::new(ctx.paths.clone());
    let problems = store.validate();
    let loaded = if problems.is_empty() { store.load().ok() } else { None };

    let platforms: Vec<serde_json::Value> = loaded
        .as_ref()
        .map(platform_rows)
        .unwrap_or_default();
    let executable = loaded.as_ref().map(|loaded| {
        let engine = LauncherEngine::new(ConfigStore::new(ctx.paths.clone()));
        match engine
            .detector(&loaded.preferences)
            .locate(&loaded.preferences.claude_executable)
        {
            Ok(command) => json!({
                "ok": true,
                "path": command.program,
                "command": command.to_string(),
            }),
            Err(err) => json!({ "ok": false, "error": err.to_string() }),
        }
    });
    let ok = problems.is_empty();

    if ctx.json {
        let payload = JsonResult {
            ok,
            result: Some(json!({
                "config_dir": ctx.paths.config_dir(),
                "problems": problems,
                "platforms": platforms,
                "executable": executable,
            })),
            error: (!ok).then(|| format!("{} configuration problem(s) found", problems.len())),
            error_details: None,
        };
        return print_json(&payload);
    }

    if !ok {
        return Err(LauncherError::ConfigInvalid {
            path: ctx.paths.config_dir().to_path_buf(),
            problems,
        });
    }
    println!(
        "{} {}",
        style("configuration ok:").green().bold(),
        ctx.paths.config_dir().display()
    );
    if let Some(loaded) = &loaded {
        print_platforms(loaded);
    }
    match executable {
        Some(result) if result["ok"] == true => {
            println!("\n{} {}", style("claude:").bold(), result["command"].as_str().unwrap_or_default())
        }
        Some(result) => println!(
            "\n{} {}",
            style("claude:").bold(),
            style(result["error"].as_str().unwrap_or_default()).yellow()
        ),
        None => {}
    }
    Ok(())
}

fn handle_list(ctx: &Context) -> Result<(), LauncherError> {
    let loaded = ConfigStore::new(ctx.paths.clone()).load()?;
    if ctx.json {
        return output(
            ctx,
            json!({
                "default_platform": loaded.registry.default_platform,
                "platforms": platform_rows(&loaded),
            }),
        );
    }
    print_platforms(&loaded);
    Ok(())
}

fn platform_rows(loaded: &LoadedConfig) -> Vec<serde_json::Value> {
    let default = loaded.registry.default_platform.as_deref();
    platform::list(&loaded.registry)
        .map(|entry| {
            json!({
                "key": entry.key,
                "name": entry.definition.name,
                "enabled": entry.enabled,
                "has_credential": entry.has_credential,
                "credential_kind": entry.definition.credential.field_name(),
                "model": entry.definition.model,
                "api_base_url": entry.definition.api_base_url,
                "aliases": entry.aliases,
                "default": Some(entry.key) == default,
            })
        })
        .collect()
}

fn print_platforms(loaded: &LoadedConfig) {
    let default = loaded.registry.default_platform.as_deref();
    println!("{}", style("Platforms").bold());
    for entry in platform::list(&loaded.registry) {
        let marker = if Some(entry.key) == default { "*" } else { " " };
        let state = match (entry.enabled, entry.has_credential) {
            (true, true) => style("enabled").green(),
            (true, false) => style("missing credential").yellow(),
            (false, _) => style("disabled").dim(),
        };
        let aliases = if entry.aliases.is_empty() {
            String::new()
        } else {
            format!(" (aliases: {})", entry.aliases.join(", "))
        };
        println!(
            "{marker} {:<14} {:<16} {}{}",
            entry.key,
            entry.definition.name,
            state,
            style(aliases).dim()
        );
    }
}

fn handle_sessions(ctx: &Context) -> Result<(), LauncherError> {
    let loaded = ConfigStore::new(ctx.paths.clone()).load()?;
    let manager = SessionManager::new(&ctx.paths.session_store, &loaded.registry);
    let listing = manager.list()?;
    if ctx.json {
        return output(ctx, json!({ "store": manager.path(), "sessions": listing }));
    }
    if listing.is_empty() {
        println!("{}", style("no sessions").dim());
        return Ok(());
    }
    for (key, rows) in &listing {
        println!("{}", style(key).bold());
        for row in rows {
            let marker = if row.current { "*" } else { " " };
            println!(
                "{marker} {}  {}",
                row.session.id,
                style(row.session.last_used_at.format("%Y-%m-%d %H:%M:%S UTC")).dim()
            );
        }
    }
    Ok(())
}

fn handle_cleanup_sessions(ctx: &Context, days: Option<u32>) -> Result<(), LauncherError> {
    let loaded = ConfigStore::new(ctx.paths.clone()).load()?;
    let days = days.unwrap_or(loaded.preferences.session_retention_days);
    let manager = SessionManager::new(&ctx.paths.session_store, &loaded.registry);
    let removed = manager.cleanup(days)?;
    if ctx.json {
        return output(
            ctx,
            json!({ "store": manager.path(), "removed": removed, "retention_days": days }),
        );
    }
    println!("removed {removed} session(s) unused for more than {days} day(s)");
    Ok(())
}

fn handle_launch(ctx: &Context, cli: Cli) -> Result<i32, LauncherError> {
    let engine = LauncherEngine::new(ConfigStore::new(ctx.paths.clone()));
    let request = LaunchRequest {
        platform: cli.platform,
        continue_session: cli.continue_session,
        passthrough: cli.passthrough,
    };
    let plan = engine.prepare(&request)?;
    if !ctx.json {
        announce(&plan);
    }
    engine.run(&plan, &ProcessRunner::new())
}

fn announce(plan: &LaunchPlan) {
    let session = match &plan.decision {
        SessionDecision::Reused(session) => format!("continuing {}", session.id),
        SessionDecision::Created(session) => format!("session {}", session.id),
        SessionDecision::Untracked => "no session tracking".to_string(),
    };
    eprintln!(
        "{} {} {}",
        style("Launching Claude Code on").cyan(),
        style(&plan.platform_name).bold(),
        style(format!("({session})")).dim()
    );
}

fn error_details(err: &LauncherError) -> ErrorDetails {
    let mut details = ErrorDetails {
        error_code: err.kind().to_string(),
        path: None,
        key: None,
        problems: None,
    };
    match err {
        LauncherError::ConfigMissing { path }
        | LauncherError::AlreadyInitialized { path }
        | LauncherError::SessionStoreLocked { path }
        | LauncherError::NotExecutable { path } => {
            details.path = Some(path.display().to_string());
        }
        LauncherError::ConfigInvalid { path, problems } => {
            details.path = Some(path.display().to_string());
            details.problems = Some(problems.clone());
        }
        LauncherError::UnknownPlatform { key } | LauncherError::PlatformDisabled { key } => {
            details.key = Some(key.clone());
        }
        LauncherError::NoSessionToContinue { platform } => details.key = Some(platform.clone()),
        LauncherError::ExecutableNotFound { name } => details.key = Some(name.clone()),
        LauncherError::EnvironmentSetupTimeout { .. }
        | LauncherError::Io(_)
        | LauncherError::Json(_)
        | LauncherError::ChildProcess(_) => {}
    }
    details
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), LauncherError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            error_details: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), LauncherError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn cli_parses_platform_and_passthrough() {
        let cli = Cli::try_parse_from(["cc-launcher", "dp", "-c", "--", "--model", "x"]).unwrap();
        assert_eq!(cli.platform.as_deref(), Some("dp"));
        assert!(cli.continue_session);
        assert_eq!(cli.passthrough, vec!["--model", "x"]);
    }

    #[test]
    fn cleanup_days_are_optional() {
        let cli = Cli::try_parse_from(["cc-launcher", "--cleanup-sessions"]).unwrap();
        assert_eq!(cli.cleanup_sessions, Some(None));
        let cli = Cli::try_parse_from(["cc-launcher", "--cleanup-sessions", "7"]).unwrap();
        assert_eq!(cli.cleanup_sessions, Some(Some(7)));
        let cli = Cli::try_parse_from(["cc-launcher"]).unwrap();
        assert_eq!(cli.cleanup_sessions, None);
    }

    #[test]
    fn modes_are_mutually_exclusive() {
        assert!(Cli::try_parse_from(["cc-launcher", "--list", "--init-config"]).is_err());
    }

    #[test]
    fn error_details_carry_kind_and_offender() {
        let details = error_details(&LauncherError::PlatformDisabled {
            key: "siliconflow".to_string(),
        });
        assert_eq!(details.error_code, "PlatformDisabled");
        assert_eq!(details.key.as_deref(), Some("siliconflow"));

        let details = error_details(&LauncherError::ConfigMissing {
            path: Path::new("/tmp/cc/config/platforms.json").to_path_buf(),
        });
        assert_eq!(details.path.as_deref(), Some("/tmp/cc/config/platforms.json"));
    }
}
