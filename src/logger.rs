use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::error;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*};

use crate::build::BuildError;

/// Installs the global subscriber.
///
/// - `log_level` is an `EnvFilter` directive (e.g. `"info"` or
///   `"cmdforge=debug"`), overridden by `RUST_LOG` when set.
/// - human readable events always go to stderr.
/// - with `log_file`, events are also appended to that file as JSON lines.
pub fn init_tracing(log_level: &str, log_file: Option<PathBuf>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .with_context(|| format!("invalid log level `{log_level}`"))?;

    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    let json_layer = match log_file {
        Some(path) => {
            let appender = file_appender(&path)?;
            Some(fmt::layer().json().with_writer(appender).with_ansi(false))
        }
        None => None,
    };

    Registry::default()
        .with(env_filter)
        .with(stderr_layer)
        .with(json_layer)
        .try_init()
        .map_err(|err| anyhow!("tracing already initialised: {err}"))
}

fn file_appender(path: &Path) -> Result<RollingFileAppender> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .with_context(|| format!("log file {} has no file name", path.display()))?;
    std::fs::create_dir_all(dir).with_context(|| format!("cannot create log directory {}", dir.display()))?;
    Ok(RollingFileAppender::new(Rotation::NEVER, dir, file_name))
}

/// Logs a failed build with both its debug and display detail.
pub fn log_build_error(command: &str, err: &BuildError) {
    error!(
        command,
        plain = ?err,
        message = %error_chain(err),
        "command build failed"
    );
}

/// `err` followed by each of its sources, separated by `: `.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}
