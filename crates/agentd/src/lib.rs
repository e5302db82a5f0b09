#![deny(rust_2018_idioms)]

//! The coffer storage agent: serves chunk operations dispatched by the proxy
//! tier against its local containers, takes part in peer-assisted erasure
//! repair, and reports its containers to the proxies' coordinators.

mod agent;
mod coding;
mod config;
mod container;
mod coordinator;
mod error;
mod io;
mod manager;
mod repair;
mod stats;

use std::sync::Arc;

use miette::{IntoDiagnostic, Result};

pub use agent::Agent;
pub use config::{
	AgentSection, Config, ContainerConfig, ContainerType, CurveSection, HttpProxy, KeepAlive,
	LogSection, ProxyConfig, TcpSection,
};
pub use container::Container;
pub use error::{ContainerError, ContainerResult};
pub use manager::ContainerManager;
pub use stats::{Snapshot, Stats};

/// Build an agent from a loaded configuration.
///
/// The returned runtime must outlive the agent: the cloud drivers execute
/// their SDK calls on it.
pub fn build(config: Config) -> Result<(Arc<Agent>, tokio::runtime::Runtime)> {
	let config = Arc::new(config);
	let rt = tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.into_diagnostic()?;
	let manager = Arc::new(ContainerManager::new(&config, rt.handle().clone())?);
	Ok((Arc::new(Agent::new(config, manager)), rt))
}

/// Run the agent until it is terminated by a signal.
pub fn run(config: Config) -> Result<()> {
	let (agent, _rt) = build(config)?;

	{
		let agent = agent.clone();
		ctrlc::set_handler(move || agent.shutdown()).into_diagnostic()?;
	}

	agent.run()
}
