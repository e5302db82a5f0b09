//! Control-plane coordinator: registers the agent with every proxy, answers
//! inbound proxy queries, and re-registers automatically when a proxy
//! connection comes back.

use std::sync::{
	atomic::{AtomicBool, Ordering},
	mpsc::{channel, sync_channel, RecvTimeoutError, SyncSender},
	Arc, Mutex,
};
use std::thread::JoinHandle;
use std::time::Duration;

use miette::{IntoDiagnostic, Result};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::io::{self, SocketRole};
use crate::manager::ContainerManager;
use coffer_proto::{
	recv_coordinator_event, send_coordinator_event, tcp_addr, AgentStatus, CoordinatorEvent,
	HostType, Opcode, SysInfo,
};

/// Interval between system info samples.
const SYSINFO_INTERVAL: Duration = Duration::from_secs(5);

pub struct Coordinator {
	config: Arc<Config>,
	manager: Arc<ContainerManager>,
	ctx: zmq::Context,
	stop: Arc<AtomicBool>,
	host_type: HostType,

	listener: Option<JoinHandle<()>>,
	_sampler_tx: SyncSender<()>,
	sampler: Option<JoinHandle<()>>,
	monitors: Vec<JoinHandle<()>>,
}

/// Probe where this host runs, once at startup.
fn detect_host_type() -> HostType {
	let vendor = std::fs::read_to_string("/sys/class/dmi/id/sys_vendor").unwrap_or_default();
	let vendor = vendor.trim();
	if vendor.contains("Amazon") {
		HostType::Aws
	} else if vendor.contains("Microsoft") {
		HostType::Azure
	} else if vendor.contains("Alibaba") {
		HostType::Ali
	} else {
		HostType::OnPrem
	}
}

fn sample_sysinfo(sys: &mut sysinfo::System, host_type: HostType) -> SysInfo {
	sys.refresh_cpu_usage();
	sys.refresh_memory();
	let load = sysinfo::System::load_average();
	SysInfo {
		host_type,
		num_cpus: sys.cpus().len() as u32,
		cpu_usage: sys.global_cpu_usage(),
		mem_total: sys.total_memory(),
		mem_free: sys.available_memory(),
		load_avg: [load.one as f32, load.five as f32, load.fifteen as f32],
	}
}

impl Coordinator {
	pub fn start(config: Arc<Config>, manager: Arc<ContainerManager>) -> Result<Self> {
		let ctx = zmq::Context::new();
		let stop = Arc::new(AtomicBool::new(false));
		let host_type = detect_host_type();
		debug!(?host_type, "detected host type");

		let latest_sysinfo = {
			let mut sys = sysinfo::System::new();
			Arc::new(Mutex::new(sample_sysinfo(&mut sys, host_type)))
		};

		let (sampler_tx, sampler_rx) = sync_channel::<()>(1);
		let sampler = {
			let latest = latest_sysinfo.clone();
			std::thread::Builder::new()
				.name("sysinfo-sampler".into())
				.spawn(move || {
					let mut sys = sysinfo::System::new();
					loop {
						match sampler_rx.recv_timeout(SYSINFO_INTERVAL) {
							Err(RecvTimeoutError::Timeout) => {
								let sample = sample_sysinfo(&mut sys, host_type);
								*latest.lock().expect("sysinfo poisoned") = sample;
							}
							Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
						}
					}
				})
				.into_diagnostic()?
		};

		let listener = {
			let ctx = ctx.clone();
			let config = config.clone();
			let manager = manager.clone();
			let stop = stop.clone();
			let latest = latest_sysinfo.clone();
			std::thread::Builder::new()
				.name("coordinator".into())
				.spawn(move || listen_to_proxy(ctx, config, manager, stop, host_type, latest))
				.into_diagnostic()?
		};

		Ok(Self {
			config,
			manager,
			ctx,
			stop,
			host_type,
			listener: Some(listener),
			_sampler_tx: sampler_tx,
			sampler: Some(sampler),
			monitors: Vec::new(),
		})
	}

	fn status_event(
		config: &Config,
		manager: &ContainerManager,
		host_type: HostType,
		opcode: Opcode,
	) -> CoordinatorEvent {
		CoordinatorEvent {
			opcode,
			status: AgentStatus {
				addr: config.data_addr(),
				host_type,
				cport: config.agent.cport,
				containers: manager.container_summaries(),
			},
			..Default::default()
		}
	}

	/// Register this agent with every configured proxy and keep monitoring
	/// each connection, re-registering on reconnects.
	///
	/// Blocks until every proxy has answered the initial registration (or
	/// its timeout expired); returns whether all of them succeeded.
	pub fn register(&mut self) -> bool {
		let (result_tx, result_rx) = channel();

		let proxies = self.config.proxies.clone();
		for (index, proxy) in proxies.iter().enumerate() {
			let ctx = self.ctx.clone();
			let config = self.config.clone();
			let manager = self.manager.clone();
			let stop = self.stop.clone();
			let host_type = self.host_type;
			let proxy_addr = proxy.addr();
			let result_tx = result_tx.clone();

			let handle = std::thread::Builder::new()
				.name(format!("proxy-monitor-{index}"))
				.spawn(move || {
					monitor_proxy(
						ctx, config, manager, stop, host_type, index, proxy_addr, result_tx,
					)
				});
			match handle {
				Ok(handle) => self.monitors.push(handle),
				Err(err) => {
					error!(proxy = index, "failed to spawn proxy monitor: {err}");
					return false;
				}
			}
		}
		drop(result_tx);

		let wait = Duration::from_millis(self.config.event_probe_timeout_ms.max(0) as u64 + 1000);
		let mut registered = 0;
		while registered < self.config.proxies.len() {
			match result_rx.recv_timeout(wait) {
				Ok(true) => registered += 1,
				Ok(false) => return false,
				Err(_) => {
					error!("timed out waiting for proxy registrations");
					return false;
				}
			}
		}
		true
	}
}

impl Drop for Coordinator {
	fn drop(&mut self) {
		warn!("terminating coordinator");
		self.stop.store(true, Ordering::SeqCst);
		// disconnect the sampler channel so its thread leaves the loop
		let (tx, _) = sync_channel(1);
		drop(std::mem::replace(&mut self._sampler_tx, tx));
		let mut ctx = self.ctx.clone();
		let _ = ctx.destroy();
		for handle in self
			.listener
			.take()
			.into_iter()
			.chain(self.sampler.take())
			.chain(self.monitors.drain(..))
		{
			let _ = handle.join();
		}
		warn!("terminated coordinator");
	}
}

/// Serve inbound proxy queries on the control-plane port.
fn listen_to_proxy(
	ctx: zmq::Context,
	config: Arc<Config>,
	manager: Arc<ContainerManager>,
	stop: Arc<AtomicBool>,
	host_type: HostType,
	latest_sysinfo: Arc<Mutex<SysInfo>>,
) {
	let socket = match ctx.socket(zmq::REP) {
		Ok(socket) => socket,
		Err(err) => {
			error!("failed to open coordinator socket: {err}");
			return;
		}
	};
	let setup = || -> zmq::Result<()> {
		io::set_socket_options(&socket, &config, SocketRole::Server)?;
		socket.set_rcvtimeo(config.event_probe_timeout_ms)?;
		socket.bind(&tcp_addr(config.listen_ip(), config.agent.cport))
	};
	if let Err(err) = setup() {
		error!("failed to bind coordinator socket: {err}");
		return;
	}
	debug!(port = config.agent.cport, "coordinator listening");

	while !stop.load(Ordering::SeqCst) {
		let mut event = match recv_coordinator_event(&socket) {
			Ok((event, _)) => event,
			Err(coffer_proto::WireError::Socket(zmq::Error::EAGAIN)) => continue,
			Err(coffer_proto::WireError::Socket(zmq::Error::ETERM)) => break,
			Err(coffer_proto::WireError::Socket(err)) => {
				warn!("coordinator stops listening: {err}");
				break;
			}
			Err(err) => {
				// keep the reply flow in step even for malformed queries
				warn!("malformed coordinator event: {err}");
				let reply = CoordinatorEvent::bare(Opcode::Unknown);
				if send_coordinator_event(&socket, &reply).is_err() {
					break;
				}
				continue;
			}
		};

		match event.opcode {
			Opcode::SynPing => {
				debug!("got ping");
				event.opcode = Opcode::AckPing;
			}
			Opcode::UpdAgentReq => {
				event = Coordinator::status_event(&config, &manager, host_type, Opcode::UpdAgentRep);
			}
			Opcode::GetSysinfoReq => {
				event = CoordinatorEvent {
					opcode: Opcode::GetSysinfoRep,
					sysinfo: latest_sysinfo.lock().expect("sysinfo poisoned").clone(),
					..Default::default()
				};
			}
			other => {
				warn!(opcode = ?other, "unknown opcode on the control plane");
				event = CoordinatorEvent::bare(Opcode::Unknown);
			}
		}

		if let Err(err) = send_coordinator_event(&socket, &event) {
			warn!("failed to send coordinator reply: {err}");
			break;
		}
	}
}

fn send_registration(
	socket: &zmq::Socket,
	config: &Config,
	manager: &ContainerManager,
	host_type: HostType,
	proxy_addr: &str,
) -> bool {
	let event = Coordinator::status_event(config, manager, host_type, Opcode::RegAgentReq);
	if let Err(err) = send_coordinator_event(socket, &event) {
		error!(proxy = proxy_addr, "failed to send registration: {err}");
		return false;
	}
	match recv_coordinator_event(socket) {
		Ok((reply, _)) if reply.opcode == Opcode::RegAgentRepSuccess => {
			info!(proxy = proxy_addr, "registered to proxy");
			true
		}
		Ok((reply, _)) => {
			error!(proxy = proxy_addr, opcode = ?reply.opcode, "proxy refused registration");
			false
		}
		Err(err) => {
			error!(proxy = proxy_addr, "no registration reply: {err}");
			false
		}
	}
}

/// Own the connection to one proxy: register once, then re-register every
/// time the transport reports a reconnect.
#[allow(clippy::too_many_arguments)]
fn monitor_proxy(
	ctx: zmq::Context,
	config: Arc<Config>,
	manager: Arc<ContainerManager>,
	stop: Arc<AtomicBool>,
	host_type: HostType,
	index: usize,
	proxy_addr: String,
	result_tx: std::sync::mpsc::Sender<bool>,
) {
	let socket = match ctx.socket(zmq::REQ) {
		Ok(socket) => socket,
		Err(err) => {
			error!(proxy = %proxy_addr, "failed to open registration socket: {err}");
			let _ = result_tx.send(false);
			return;
		}
	};
	let setup = || -> zmq::Result<()> {
		io::set_socket_options(&socket, &config, SocketRole::ToProxy)?;
		socket.set_rcvtimeo(config.event_probe_timeout_ms)?;
		socket.set_sndtimeo(config.event_probe_timeout_ms)?;
		socket.set_linger(config.event_probe_timeout_ms)?;
		// survive missed replies so re-registration can reuse the socket
		socket.set_req_relaxed(true)?;
		socket.set_req_correlate(true)?;
		socket.connect(&proxy_addr)
	};
	if let Err(err) = setup() {
		error!(proxy = %proxy_addr, "failed to connect registration socket: {err}");
		let _ = result_tx.send(false);
		return;
	}

	let registered = send_registration(&socket, &config, &manager, host_type, &proxy_addr);
	let _ = result_tx.send(registered);
	drop(result_tx);
	if !registered {
		return;
	}

	// watch transport events; a fresh connect means the proxy restarted and
	// forgot us
	let monitor_endpoint = format!("inproc://monitor-proxy-{index}");
	if let Err(err) = socket.monitor(
		&monitor_endpoint,
		zmq::SocketEvent::CONNECTED.to_raw() as i32,
	) {
		error!(proxy = %proxy_addr, "failed to monitor proxy socket: {err}");
		return;
	}
	let pair = match ctx.socket(zmq::PAIR) {
		Ok(pair) => pair,
		Err(err) => {
			error!(proxy = %proxy_addr, "failed to open monitor socket: {err}");
			return;
		}
	};
	if pair.set_rcvtimeo(config.event_probe_timeout_ms).is_err()
		|| pair.connect(&monitor_endpoint).is_err()
	{
		error!(proxy = %proxy_addr, "failed to connect monitor socket");
		return;
	}

	while !stop.load(Ordering::SeqCst) {
		match pair.recv_multipart(0) {
			Ok(frames) => {
				let Some(event_id) = frames
					.first()
					.filter(|f| f.len() >= 2)
					.map(|f| u16::from_le_bytes([f[0], f[1]]))
				else {
					continue;
				};
				if event_id == zmq::SocketEvent::CONNECTED.to_raw() {
					debug!(proxy = %proxy_addr, "reconnected, registering again");
					send_registration(&socket, &config, &manager, host_type, &proxy_addr);
				}
			}
			Err(zmq::Error::EAGAIN) => continue,
			Err(zmq::Error::ETERM) => break,
			Err(err) => {
				warn!(proxy = %proxy_addr, "proxy monitor stopped: {err}");
				break;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_sysinfo_sample_is_plausible() {
		let mut sys = sysinfo::System::new();
		let sample = sample_sysinfo(&mut sys, HostType::OnPrem);
		assert!(sample.num_cpus >= 1);
		assert!(sample.mem_total > 0);
	}

	#[test]
	fn test_detect_host_type_does_not_panic() {
		let _ = detect_host_type();
	}
}
