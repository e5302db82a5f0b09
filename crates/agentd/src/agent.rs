//! The agent proper: frontend/backend socket pair, worker pool, and the
//! per-opcode dispatch executed by each worker.

use std::sync::{
	atomic::AtomicU32,
	Arc,
};

use miette::{miette, IntoDiagnostic, Result};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::io::{self, SocketRole};
use crate::manager::ContainerManager;
use crate::repair;
use crate::stats::Stats;
use coffer_proto::{
	recv_event, send_event, tcp_addr, ChunkEvent, CodingMeta, EventTags, Opcode, Tag, WireError,
};

/// In-process queue between the frontend and the workers.
const WORKER_QUEUE: &str = "inproc://chunk-workers";

pub struct Agent {
	config: Arc<Config>,
	manager: Arc<ContainerManager>,
	stats: Arc<Stats>,
	event_count: Arc<AtomicU32>,
	ctx: zmq::Context,
}

impl Agent {
	pub fn new(config: Arc<Config>, manager: Arc<ContainerManager>) -> Self {
		Self {
			config,
			manager,
			stats: Arc::new(Stats::new()),
			event_count: Arc::new(AtomicU32::new(0)),
			ctx: zmq::Context::new(),
		}
	}

	pub fn stats(&self) -> &Stats {
		&self.stats
	}

	/// Terminate the ZeroMQ context: every blocking socket call returns with
	/// an error and the workers wind down. Safe to call from any thread.
	pub fn shutdown(&self) {
		warn!("terminating agent");
		let mut ctx = self.ctx.clone();
		if let Err(err) = ctx.destroy() {
			error!("failed to terminate socket context: {err}");
		}
	}

	/// Run the agent: register to proxies, serve chunk events until the
	/// context is terminated, then drain and report.
	pub fn run(&self) -> Result<()> {
		let mut coordinator = Coordinator::start(self.config.clone(), self.manager.clone())?;

		if self.config.agent.register_to_proxy && !coordinator.register() {
			return Err(miette!("failed to register to proxies"));
		}

		// frontend takes proxy requests, backend feeds the worker pool
		let frontend = self.ctx.socket(zmq::ROUTER).into_diagnostic()?;
		io::set_socket_options(&frontend, &self.config, SocketRole::Server).into_diagnostic()?;
		let data_addr = tcp_addr(self.config.listen_ip(), self.config.agent.port);
		frontend.bind(&data_addr).into_diagnostic()?;

		let backend = self.ctx.socket(zmq::DEALER).into_diagnostic()?;
		backend.bind(WORKER_QUEUE).into_diagnostic()?;

		let workers: Vec<_> = (0..self.config.agent.num_workers)
			.map(|worker| {
				let ctx = self.ctx.clone();
				let config = self.config.clone();
				let manager = self.manager.clone();
				let stats = self.stats.clone();
				let event_count = self.event_count.clone();
				std::thread::Builder::new()
					.name(format!("chunk-worker-{worker}"))
					.spawn(move || worker_loop(worker, ctx, config, manager, stats, event_count))
					.into_diagnostic()
			})
			.collect::<Result<_>>()?;

		info!(
			addr = %data_addr,
			workers = self.config.agent.num_workers,
			"agent serving chunk events"
		);

		// shuttles frames between the sockets until the context terminates
		if let Err(err) = zmq::proxy(&frontend, &backend) {
			debug!("event proxy stopped: {err}");
		}
		drop(frontend);
		drop(backend);

		for worker in workers {
			let _ = worker.join();
		}
		drop(coordinator);

		self.stats.log_summary();
		info!("agent terminated");
		Ok(())
	}
}

fn worker_loop(
	worker: usize,
	ctx: zmq::Context,
	config: Arc<Config>,
	manager: Arc<ContainerManager>,
	stats: Arc<Stats>,
	event_count: Arc<AtomicU32>,
) {
	let socket = match ctx.socket(zmq::REP) {
		Ok(socket) => socket,
		Err(err) => {
			error!(worker, "failed to open worker socket: {err}");
			return;
		}
	};
	if let Err(err) = io::set_socket_options(&socket, &config, SocketRole::Server) {
		error!(worker, "failed to set worker socket options: {err}");
		return;
	}
	if let Err(err) = socket.connect(WORKER_QUEUE) {
		error!(worker, "failed to connect to event queue: {err}");
		return;
	}
	debug!(worker, "worker ready");

	loop {
		let (mut event, received) = match recv_event(&socket) {
			Ok(received) => received,
			Err(WireError::Socket(zmq::Error::ETERM)) => {
				debug!(worker, "worker stopping");
				break;
			}
			Err(WireError::Socket(err)) => {
				error!(worker, "failed to receive chunk event: {err}");
				break;
			}
			Err(err) => {
				// the message was drained; answer with a bare failure so the
				// request/reply flow stays in step
				error!(worker, "malformed chunk event: {err}");
				if send_event(&socket, &ChunkEvent::default()).is_err() {
					break;
				}
				continue;
			}
		};
		stats.add_ingress(received);

		let mut tags = EventTags::default();
		tags.p2a.end = Tag::now();
		tags.agent_process.start = Tag::now();

		dispatch(&ctx, &config, &manager, &stats, &event_count, &mut event);

		tags.agent_process.end = Tag::now();
		tags.a2p.start = Tag::now();
		event.tags = tags;

		match send_event(&socket, &event) {
			Ok(sent) => stats.add_egress(sent),
			Err(err) => {
				error!(worker, "failed to send chunk event reply: {err}");
				break;
			}
		}
	}
}

/// Whether the event carries the announced number of container ids and
/// chunk tuples.
fn batch_shape_ok(event: &ChunkEvent) -> bool {
	let n = event.num_chunks as usize;
	let factor = event.opcode.chunk_factor() as usize;
	event.num_chunks >= 0
		&& event.container_ids.len() == n
		&& event.chunks.len() == n * factor
}

fn fail(event: &mut ChunkEvent) {
	*event = std::mem::take(event).into_failure();
}

fn dispatch(
	ctx: &zmq::Context,
	config: &Config,
	manager: &ContainerManager,
	stats: &Stats,
	event_count: &AtomicU32,
	event: &mut ChunkEvent,
) {
	let num_chunks = event.num_chunks;
	match event.opcode {
		Opcode::PutChunkReq => {
			stats.add_ingress_chunk(event.chunk_bytes());
			let ok = batch_shape_ok(event)
				&& manager
					.put_chunks(&event.container_ids.clone(), &mut event.chunks)
					.map_err(|err| error!(num_chunks, "failed to put chunks: {err}"))
					.is_ok();
			if ok {
				info!(num_chunks, "put chunks into containers");
				event.opcode = Opcode::PutChunkRepSuccess;
			} else {
				fail(event);
			}
			stats.record_op(ok);
		}

		Opcode::GetChunkReq => {
			let ok = batch_shape_ok(event)
				&& manager
					.get_chunks(&event.container_ids.clone(), &mut event.chunks)
					.map_err(|err| error!(num_chunks, "failed to get chunks: {err}"))
					.is_ok();
			if ok {
				info!(num_chunks, "got chunks from containers");
				stats.add_egress_chunk(event.chunk_bytes());
				event.opcode = Opcode::GetChunkRepSuccess;
			} else {
				fail(event);
			}
			stats.record_op(ok);
		}

		Opcode::DelChunkReq => {
			if batch_shape_ok(event) {
				manager.delete_chunks(&event.container_ids, &event.chunks);
				info!(num_chunks, "deleted chunks in containers");
				event.opcode = Opcode::DelChunkRepSuccess;
				stats.record_op(true);
			} else {
				fail(event);
				stats.record_op(false);
			}
		}

		Opcode::CpyChunkReq => {
			let n = num_chunks as usize;
			let ok = batch_shape_ok(event) && {
				let ids = event.container_ids.clone();
				let (srcs, dsts) = event.chunks.split_at_mut(n);
				manager
					.copy_chunks(&ids, srcs, dsts)
					.map_err(|err| error!(num_chunks, "failed to copy chunks: {err}"))
					.is_ok()
			};
			if ok {
				info!(num_chunks, "copied chunks in containers");
				// the reply reports the destination metadata in the leading
				// tuples
				for i in 0..n {
					let dst = event.chunks[n + i].clone();
					event.chunks[i].copy_meta(&dst, true);
				}
				event.opcode = Opcode::CpyChunkRepSuccess;
			} else {
				fail(event);
			}
			stats.record_op(ok);
		}

		Opcode::MovChunkReq => {
			let n = num_chunks as usize;
			let ok = batch_shape_ok(event) && {
				let ids = event.container_ids.clone();
				let (srcs, dsts) = event.chunks.split_at_mut(n);
				manager
					.move_chunks(&ids, srcs, dsts)
					.map_err(|err| error!(num_chunks, "failed to move chunks: {err}"))
					.is_ok()
			};
			if ok {
				info!(num_chunks, "moved chunks in containers");
				for i in 0..n {
					let dst = event.chunks[n + i].clone();
					event.chunks[i].copy_meta(&dst, true);
				}
				event.opcode = Opcode::MovChunkRepSuccess;
			} else {
				fail(event);
			}
			stats.record_op(ok);
		}

		Opcode::EncChunkReq => {
			let result = if batch_shape_ok(event) {
				manager.get_encoded_chunks(
					&event.container_ids,
					&event.chunks,
					&event.coding.state,
				)
			} else {
				Err(crate::error::ContainerError::integrity("bad event shape"))
			};
			match result {
				Ok(coded) => {
					info!(num_chunks, "encoded chunks in containers");
					event.num_chunks = 1;
					event.chunks = vec![coded];
					event.container_ids.clear();
					event.coding = CodingMeta::default();
					event.opcode = Opcode::EncChunkRepSuccess;
					stats.record_op(true);
				}
				Err(err) => {
					error!(num_chunks, "failed to encode chunks: {err}");
					fail(event);
					stats.record_op(false);
				}
			}
		}

		Opcode::RprChunkReq => {
			let ok = batch_shape_ok(event)
				&& repair::handle_repair(ctx, config, manager, event_count, event);
			if ok {
				info!(num_chunks, "repaired chunks");
				event.opcode = Opcode::RprChunkRepSuccess;
			} else {
				error!(num_chunks, "failed to repair chunks");
				fail(event);
			}
			stats.record_op(ok);
		}

		Opcode::ChkChunkReq => {
			if batch_shape_ok(event) && manager.has_chunks(&event.container_ids, &event.chunks) {
				info!(num_chunks, "checked chunks in containers");
				event.opcode = Opcode::ChkChunkRepSuccess;
			} else {
				error!(num_chunks, "failed to find (some of the) chunks in containers");
				fail(event);
			}
		}

		Opcode::VrfChunkReq => {
			let result = if batch_shape_ok(event) {
				manager.verify_chunks(&event.container_ids.clone(), &mut event.chunks)
			} else {
				Err(crate::error::ContainerError::integrity("bad event shape"))
			};
			match result {
				Ok(corrupted) => {
					info!(num_chunks, corrupted, "verified chunk checksums");
					// report only the corrupted chunks, compacted in front
					event.num_chunks = corrupted as i32;
					event.chunks.truncate(corrupted);
					event.opcode = Opcode::VrfChunkRepSuccess;
					stats.record_op(true);
				}
				Err(err) => {
					error!(num_chunks, "failed to verify chunk checksums: {err}");
					fail(event);
					stats.record_op(false);
				}
			}
		}

		Opcode::RvtChunkReq => {
			let ok = batch_shape_ok(event)
				&& manager
					.revert_chunks(&event.container_ids, &event.chunks)
					.map_err(|err| error!(num_chunks, "failed to revert chunks: {err}"))
					.is_ok();
			if ok {
				info!(num_chunks, "reverted chunks in containers");
				event.opcode = Opcode::RvtChunkRepSuccess;
			} else {
				fail(event);
			}
			stats.record_op(ok);
		}

		other => {
			warn!(opcode = ?other, "unexpected opcode on the data plane");
			fail(event);
		}
	}
}
