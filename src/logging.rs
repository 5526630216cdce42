//! Console and file logging.
//!
//! The console layer writes to stderr so `--json` output on stdout stays
//! parseable. `CC_LAUNCHER_LOG` takes any `EnvFilter` directive and overrides
//! the console level; the file layer always records debug and above.

use std::path::Path;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const LOG_ENV: &str = "CC_LAUNCHER_LOG";
pub const LOG_FILE: &str = "cc-launcher.log";

pub fn init_logging(log_dir: &Path, debug: bool) {
    let console_filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(console_directive(debug)));
    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(console_filter);

    // No log directory means no file layer; the launch goes on.
    let file_layer = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(LOG_FILE)
        .build(log_dir)
        .ok()
        .map(|appender| {
            fmt::layer()
                .with_writer(appender)
                .with_ansi(false)
                .with_filter(EnvFilter::new("debug"))
        });

    let _ = tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init();
}

fn console_directive(debug: bool) -> &'static str {
    if debug {
        "debug"
    } else {
        "warn"
    }
}
