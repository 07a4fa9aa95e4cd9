//! Mocks the ClusterMesh API server of many clusters, publishing their nodes,
//! identities, endpoints and services into etcd.
#![deny(missing_docs)]

mod cache;
mod cluster;
mod config;
mod fleet;
mod health;
mod heartbeat;
mod kinds;
mod kvstore;
mod metrics;
mod mocker;
mod random;
mod ratelimit;
mod signal;
mod store;
mod syncer;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use cmapisrv_common::telemetry;
use tracing::info;

use crate::mocker::mocker;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log at debug level.
    #[arg(long, global = true, env = "MOCKER_DEBUG")]
    debug: bool,

    /// Format of the log lines.
    #[arg(long, global = true, value_enum, env = "MOCKER_LOG_FORMAT", default_value_t = LogFormat::Compact)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Compact,
    Json,
}

impl From<LogFormat> for telemetry::Format {
    fn from(value: LogFormat) -> Self {
        match value {
            LogFormat::Compact => telemetry::Format::Compact,
            LogFormat::Json => telemetry::Format::Json,
        }
    }
}

/// Available Subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Simulate clusters publishing their state into the kvstore
    Mocker(config::Opts),
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Mocker(_) => "mocker",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    telemetry::init(args.debug, args.log_format.into())?;

    info!(command = args.command.name(), ?args.command, "starting");
    match args.command {
        Command::Mocker(opts) => mocker(opts).await?,
    }
    Ok(())
}
