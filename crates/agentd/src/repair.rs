//! Peer-assisted repair of lost chunks.
//!
//! Conventional repair fetches every surviving chunk from its peer with a
//! GET and decodes locally. CAR repair asks each peer to pre-combine its
//! local group with an ENC request, then sums the partial results, which
//! moves most of the traffic off the repair path.

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{debug, error, warn};

use crate::config::Config;
use crate::error::ContainerError;
use crate::manager::ContainerManager;
use crate::{coding, io};
use coffer_proto::{
	Chunk, ChunkEvent, CodingMeta, Opcode, CODING_SCHEME_UNKNOWN,
};

/// Chunks each repair participant stores locally.
const CHUNKS_PER_NODE: usize = 1;

/// One planned peer exchange.
struct PeerRequest {
	event: ChunkEvent,
	address: String,
}

struct RepairPlan {
	requests: Vec<PeerRequest>,
	/// Peer addresses left over for forwarding reconstructed chunks.
	forward_addresses: Vec<String>,
}

/// Lay out the peer requests for a repair event.
///
/// Returns None when the descriptor is inconsistent (bad counts, short maps,
/// or not enough peer addresses).
fn plan_requests(event: &ChunkEvent, next_id: impl FnMut() -> u32) -> Option<RepairPlan> {
	let mut next_id = next_id;
	let repair = &event.repair;
	let group_map = &repair.chunk_group_map;
	let container_map = &repair.container_group_map;

	let template = event.chunks.first()?;
	let is_car = repair.using_car;
	let num_req = if is_car {
		repair.num_chunk_groups as usize
	} else {
		*group_map.first()? as usize
	};
	if num_req == 0 {
		return None;
	}

	let mut addresses = repair
		.agents
		.split(';')
		.filter(|addr| !addr.is_empty())
		.map(String::from);

	let mut requests = Vec::with_capacity(num_req);
	let mut cpos = 0usize;
	for i in 0..num_req {
		let num_chunks = if is_car {
			*group_map.get(cpos + i)? as usize
		} else {
			CHUNKS_PER_NODE
		};
		if num_chunks == 0 {
			return None;
		}

		let container_ids: Vec<i32> = container_map.get(cpos..cpos + num_chunks)?.to_vec();
		let mut chunks = Vec::with_capacity(num_chunks);
		for j in 0..num_chunks {
			let cid = if is_car {
				*group_map.get(cpos + i + j + 1)?
			} else {
				*group_map.get(cpos + j + 1)?
			};
			chunks.push(Chunk::new(
				template.namespace_id,
				template.fuuid,
				cid,
				template.file_version,
			));
		}

		let coding = if is_car {
			CodingMeta {
				scheme: event.coding.scheme,
				// a cheap alias into the parent event's coefficient buffer
				state: event.coding.state.slice(
					cpos.min(event.coding.state.len())
						..(cpos + num_chunks).min(event.coding.state.len()),
				),
			}
		} else {
			CodingMeta::default()
		};
		if is_car && coding.state.len() != num_chunks {
			return None;
		}

		let request = ChunkEvent {
			id: next_id(),
			opcode: if is_car {
				Opcode::EncChunkReq
			} else {
				Opcode::GetChunkReq
			},
			num_chunks: num_chunks as i32,
			container_ids,
			chunks,
			coding,
			..Default::default()
		};
		requests.push(PeerRequest {
			event: request,
			address: addresses.next()?,
		});
		cpos += num_chunks;
	}

	Some(RepairPlan {
		requests,
		forward_addresses: addresses.collect(),
	})
}

/// Execute a repair request, reconstructing the chunks named by `event` and
/// distributing them to this agent's containers and to peers.
///
/// Returns whether every step succeeded. The event's chunk list is filled
/// with the reconstructed payloads as a side effect.
pub fn handle_repair(
	ctx: &zmq::Context,
	config: &Config,
	manager: &ContainerManager,
	event_count: &AtomicU32,
	event: &mut ChunkEvent,
) -> bool {
	if event.coding.scheme >= CODING_SCHEME_UNKNOWN {
		error!(scheme = event.coding.scheme, "invalid coding scheme for repair");
		return false;
	}
	let num_out = event.num_chunks as usize;
	if num_out == 0 || event.chunks.len() < num_out || event.container_ids.len() < num_out {
		error!("repair event addresses no chunks");
		return false;
	}

	let is_car = event.repair.using_car;
	let Some(plan) = plan_requests(event, || event_count.fetch_add(1, Ordering::SeqCst)) else {
		error!("inconsistent repair descriptor");
		return false;
	};
	let num_req = plan.requests.len();
	debug!(using_car = is_car, num_req, "start of chunk repair");

	// fetch (or pre-encode) every surviving input in parallel, one peer each
	let expected = if is_car {
		Opcode::EncChunkRepSuccess
	} else {
		Opcode::GetChunkRepSuccess
	};
	let replies: Vec<Result<ChunkEvent, ContainerError>> = std::thread::scope(|scope| {
		let handles: Vec<_> = plan
			.requests
			.iter()
			.map(|peer| {
				scope.spawn(move || io::send_chunk_request(ctx, config, &peer.address, &peer.event))
			})
			.collect();
		handles
			.into_iter()
			.map(|handle| {
				handle
					.join()
					.unwrap_or_else(|_| Err(ContainerError::Transport("peer task panicked".into())))
			})
			.collect()
	});

	let mut inputs = Vec::with_capacity(num_req);
	let mut chunk_size = 0usize;
	let mut all_success = true;
	for (peer, reply) in plan.requests.iter().zip(&replies) {
		match reply {
			Ok(reply) if reply.opcode == expected => {
				match reply.chunks.first().and_then(|c| c.data.clone()) {
					Some(data) => {
						chunk_size = data.len();
						inputs.push(data);
					}
					None => {
						error!(address = %peer.address, "peer reply carried no chunk payload");
						all_success = false;
					}
				}
			}
			Ok(reply) => {
				error!(
					address = %peer.address,
					opcode = ?reply.opcode,
					"peer failed to serve repair input"
				);
				all_success = false;
			}
			Err(err) => {
				error!(address = %peer.address, "peer repair request failed: {err}");
				all_success = false;
			}
		}
	}
	if !all_success || chunk_size == 0 || inputs.iter().any(|data| data.len() != chunk_size) {
		warn!(using_car = is_car, num_req, "end of chunk repair (failed fetching inputs)");
		return false;
	}

	// reconstruct: CAR partials sum with unit coefficients, conventional
	// repair applies the decode matrix shipped in the coding state
	let matrix = if is_car {
		vec![1u8; num_req * num_out]
	} else {
		event.coding.state.to_vec()
	};
	let input_slices: Vec<&[u8]> = inputs.iter().map(|data| data.as_ref()).collect();
	let Some(outputs) = coding::encode(&input_slices, num_out, chunk_size, &matrix) else {
		error!("decode matrix too short for repair");
		return false;
	};
	for (chunk, output) in event.chunks.iter_mut().zip(outputs) {
		chunk.set_data(output.into());
		chunk.compute_md5();
	}

	// distribute: the first chunks stay local, the rest go to peers
	let num_local = if is_car { num_out } else { CHUNKS_PER_NODE };
	let num_forward = num_out - num_local;
	if num_forward > plan.forward_addresses.len() {
		error!(
			num_forward,
			available = plan.forward_addresses.len(),
			"not enough peer addresses to forward reconstructed chunks"
		);
		return false;
	}

	let forwards: Vec<(String, ChunkEvent)> = (0..num_forward)
		.map(|i| {
			let chunk = event.chunks[num_local + i].clone();
			let request = ChunkEvent {
				id: event_count.fetch_add(1, Ordering::SeqCst),
				opcode: Opcode::PutChunkReq,
				num_chunks: 1,
				container_ids: vec![event.container_ids[num_local + i]],
				chunks: vec![chunk],
				..Default::default()
			};
			(plan.forward_addresses[i].clone(), request)
		})
		.collect();

	let mut all_success = true;
	let forward_replies: Vec<Result<ChunkEvent, ContainerError>> = std::thread::scope(|scope| {
		let handles: Vec<_> = forwards
			.iter()
			.map(|(address, request)| {
				scope.spawn(move || io::send_chunk_request(ctx, config, address, request))
			})
			.collect();

		// store our share locally while the forwards are in flight
		let local_ids = vec![event.container_ids[0]; num_local];
		if let Err(err) = manager.put_chunks(&local_ids, &mut event.chunks[..num_local]) {
			error!("failed to store repaired chunks locally: {err}");
			all_success = false;
		}

		handles
			.into_iter()
			.map(|handle| {
				handle
					.join()
					.unwrap_or_else(|_| Err(ContainerError::Transport("peer task panicked".into())))
			})
			.collect()
	});

	for ((address, request), reply) in forwards.iter().zip(&forward_replies) {
		match reply {
			Ok(reply) if reply.opcode == Opcode::PutChunkRepSuccess => {}
			Ok(reply) => {
				error!(
					address = %address,
					chunk = %request.chunks[0].name(),
					opcode = ?reply.opcode,
					"peer failed to store repaired chunk"
				);
				all_success = false;
			}
			Err(err) => {
				error!(address = %address, "forwarding repaired chunk failed: {err}");
				all_success = false;
			}
		}
	}

	debug!(using_car = is_car, num_req, "end of chunk repair");
	all_success
}
