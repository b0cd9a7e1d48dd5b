//! memdb shard process
//!
//! Runs one shard of a memdb cluster in the foreground or, with `--daemon`,
//! under a detached restart supervisor.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use memdb::{
    config::{Config, ConfigError, ShardConfig},
    daemon, logging, MemoryDatabase, ShardLifecycleController,
};
use tracing::error;

#[derive(Parser)]
#[command(name = "memdb")]
#[command(about = "Shard gateway for the memdb document store")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "conf")]
    conf: Option<PathBuf>,

    /// Shard id to run, as named in the config
    #[arg(short, long)]
    shard: Option<String>,

    /// Run in the background under a restart supervisor
    #[arg(short, long)]
    daemon: bool,

    /// Started by the supervisor; always runs in the foreground
    #[arg(long, hide = true)]
    child: bool,

    /// Act as the restart supervisor
    #[arg(long, hide = true)]
    supervise: bool,
}

fn main() {
    let cli = Cli::parse();

    let (config, shard) = match resolve(&cli) {
        Ok(resolved) => resolved,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    // Forwarded to the supervisor and the child unchanged
    let args: Vec<OsString> = std::env::args_os().skip(1).collect();

    if cli.supervise {
        init_logging(&config, &shard);
        let code = match daemon::supervise(&args) {
            Ok(code) => code,
            Err(e) => {
                error!("Supervisor failed: {:#}", e);
                1
            }
        };
        std::process::exit(code);
    }

    if cli.daemon && !cli.child {
        match daemon::spawn_supervisor(&args) {
            Ok(pid) => {
                println!("memdb shard {} started in background (pid {})", shard.shard_id, pid);
                std::process::exit(0);
            }
            Err(e) => {
                eprintln!("Error: {:#}", e);
                std::process::exit(1);
            }
        }
    }

    init_logging(&config, &shard);
    logging::install_panic_hook();

    if let Err(e) = serve(config, shard) {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
    std::process::exit(0);
}

/// Load the config and pick this process's shard
fn resolve(cli: &Cli) -> Result<(Config, ShardConfig), ConfigError> {
    let candidates = Config::search_paths(cli.conf.as_deref());
    Config::resolve(&candidates, cli.shard.as_deref())
}

fn init_logging(config: &Config, shard: &ShardConfig) {
    if let Err(e) = logging::init(&config.logger, &shard.shard_id) {
        eprintln!("Warning: {:#}", e);
    }
}

fn serve(config: Config, shard: ShardConfig) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build async runtime")?;

    runtime.block_on(async move {
        let db = Arc::new(MemoryDatabase::from_config(&shard));
        let controller = ShardLifecycleController::new(shard, config.gateway, db);
        controller.run().await
    })
}
