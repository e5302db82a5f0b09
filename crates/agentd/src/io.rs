//! Socket plumbing: option setup shared by every socket, and the peer
//! request helper used by the repair orchestrator.

use tracing::{debug, error};

use crate::config::Config;
use crate::error::{ContainerError, ContainerResult};
use coffer_proto::{recv_event, send_event, ChunkEvent};

/// Which side of a connection a socket plays, for CurveZMQ key selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketRole {
	/// Listening socket of this agent.
	Server,
	/// Outbound connection to another agent.
	ToAgent,
	/// Outbound connection to a proxy.
	ToProxy,
}

/// Apply the configured buffer sizes, keepalive tuning, and CurveZMQ keys.
pub fn set_socket_options(
	socket: &zmq::Socket,
	config: &Config,
	role: SocketRole,
) -> zmq::Result<()> {
	socket.set_sndbuf(config.tcp.buffer_size)?;
	socket.set_rcvbuf(config.tcp.buffer_size)?;

	if let Some(keepalive) = &config.tcp.keepalive {
		socket.set_tcp_keepalive(1)?;
		socket.set_tcp_keepalive_idle(keepalive.idle)?;
		socket.set_tcp_keepalive_intvl(keepalive.interval)?;
		socket.set_tcp_keepalive_cnt(keepalive.count)?;
	}

	if let Some(curve) = &config.curve {
		match role {
			SocketRole::Server => {
				socket.set_curve_server(true)?;
			}
			SocketRole::ToAgent | SocketRole::ToProxy => {
				let server_key = if role == SocketRole::ToProxy {
					&curve.proxy_public_key
				} else {
					&curve.agent_public_key
				};
				socket.set_curve_serverkey(server_key.as_bytes())?;
				socket.set_curve_publickey(curve.agent_public_key.as_bytes())?;
			}
		}
		socket.set_curve_secretkey(curve.agent_secret_key.as_bytes())?;
	}

	Ok(())
}

/// Send one chunk request to a peer agent and wait for its reply.
///
/// Opens a fresh REQ socket per request with send/receive timeouts from
/// `failure_timeout_ms`, so a dead peer costs one timeout rather than a hung
/// worker.
pub fn send_chunk_request(
	ctx: &zmq::Context,
	config: &Config,
	address: &str,
	request: &ChunkEvent,
) -> ContainerResult<ChunkEvent> {
	let socket = ctx
		.socket(zmq::REQ)
		.map_err(|err| ContainerError::Transport(format!("{err}")))?;
	let setup = || -> zmq::Result<()> {
		set_socket_options(&socket, config, SocketRole::ToAgent)?;
		socket.set_sndtimeo(config.failure_timeout_ms)?;
		socket.set_rcvtimeo(config.failure_timeout_ms)?;
		socket.set_linger(config.failure_timeout_ms)?;
		socket.connect(address)
	};
	setup().map_err(|err| {
		error!(address, "failed to connect to peer agent: {err}");
		ContainerError::Transport(format!("{err}"))
	})?;

	debug!(address, opcode = ?request.opcode, id = request.id, "sending peer chunk request");
	send_event(&socket, request)
		.map_err(|err| ContainerError::Transport(format!("send to {address}: {err}")))?;
	let (reply, _) = recv_event(&socket)
		.map_err(|err| ContainerError::Transport(format!("recv from {address}: {err}")))?;
	debug!(address, opcode = ?reply.opcode, id = reply.id, "received peer chunk reply");
	Ok(reply)
}
