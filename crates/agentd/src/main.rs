use std::path::PathBuf;

use clap::Parser;
use miette::{miette, Result};
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Coffer storage agent
///
/// Serves chunk requests from the proxy tier against the configured
/// containers and takes part in peer-assisted chunk repair. SIGTERM or
/// SIGINT triggers a graceful shutdown.
#[derive(Debug, Clone, Parser)]
struct Args {
	/// Path to the agent configuration file
	#[arg(env = "COFFER_CONFIG")]
	pub config: PathBuf,
}

fn main() -> Result<()> {
	let args = Args::parse();
	let config = coffer_agentd::Config::load(&args.config)?;

	let filter = std::env::var("COFFER_LOG").unwrap_or_else(|_| {
		format!("warn,coffer_agentd={level},coffer_proto={level}", level = config.log.level)
	});
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_new(&filter).map_err(|err| miette!("bad log filter {filter:?}: {err}"))?,
		)
		.init();

	debug!(?args, "starting agent");
	coffer_agentd::run(config)
}
