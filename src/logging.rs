//! Process-wide log subscriber setup

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::error;
use tracing_subscriber::fmt::MakeWriter;

use crate::config::{LogFormat, LoggingConfig};

/// Where log output ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    File(PathBuf),
    Stderr,
}

/// Install the global subscriber for `shard_id`.
///
/// Output goes to `<path>/memdb-<shard_id>.log`. When that file cannot be
/// opened the reason is printed to stderr and logging continues on stderr.
pub fn init(config: &LoggingConfig, shard_id: &str) -> Result<LogTarget> {
    let file_path = config.file_for(shard_id);
    let opened = std::fs::create_dir_all(&config.path)
        .and_then(|_| OpenOptions::new().create(true).append(true).open(&file_path));

    match opened {
        Ok(file) => {
            install(config, Arc::new(file), false)?;
            Ok(LogTarget::File(file_path))
        }
        Err(e) => {
            eprintln!(
                "Warning: cannot open log file {} ({}), logging to stderr",
                file_path.display(),
                e
            );
            install(config, std::io::stderr, true)?;
            Ok(LogTarget::Stderr)
        }
    }
}

fn install<W>(config: &LoggingConfig, writer: W, ansi: bool) -> Result<()>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let builder = tracing_subscriber::fmt()
        .with_max_level(config.level.as_tracing())
        .with_target(false)
        .with_ansi(ansi)
        .with_writer(writer);

    match config.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e))
}

/// Log panics instead of printing them to a possibly detached stderr.
///
/// A panic inside a spawned task only ends that task; the process keeps
/// serving.
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        error!("Uncaught panic: {}", info);
    }));
}
