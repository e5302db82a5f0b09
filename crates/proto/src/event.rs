use bytes::Bytes;

use crate::{Chunk, Opcode};

/// One endpoint of a telemetry tag point, in seconds and nanoseconds since
/// the unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tag {
	pub sec: i64,
	pub nsec: i64,
}

impl Tag {
	pub fn now() -> Self {
		let ts = jiff::Timestamp::now();
		Self {
			sec: ts.as_second(),
			nsec: i64::from(ts.subsec_nanosecond()),
		}
	}
}

/// A start/end pair of tag points.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TagPair {
	pub start: Tag,
	pub end: Tag,
}

/// The three telemetry intervals recorded per event: proxy to agent, agent
/// processing, and agent to proxy. Informational only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventTags {
	pub p2a: TagPair,
	pub agent_process: TagPair,
	pub a2p: TagPair,
}

/// Erasure-coding metadata attached to encode and repair requests.
///
/// For an encode request the state is a 1×k row of field coefficients; for a
/// repair request it is the flattened decode matrix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodingMeta {
	pub scheme: u8,
	pub state: Bytes,
}

/// Repair descriptor for a repair request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairInfo {
	/// Number of repair input groups.
	pub num_chunk_groups: i32,
	/// Number of surviving chunks to fetch in total.
	pub num_input_chunks: i32,
	/// Flattened group records: `[count, cid_0, cid_1, ...]` per group.
	pub chunk_group_map: Vec<i32>,
	/// Container id for each input chunk, in group order.
	pub container_group_map: Vec<i32>,
	/// `;`-delimited peer addresses, consumed in order, trailing `;`.
	pub agents: String,
	/// Whether peers pre-aggregate their local chunks before sending.
	pub using_car: bool,
}

/// A single request/reply unit between proxy and agent, or agent and agent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkEvent {
	pub id: u32,
	pub opcode: Opcode,

	/// Number of chunks addressed by this event. Replies may shrink this
	/// (verify replies count corrupted chunks only).
	pub num_chunks: i32,
	/// Container ids parallel to `chunks`, one per counted chunk.
	pub container_ids: Vec<i32>,
	/// Chunk tuples, `num_chunks * opcode.chunk_factor()` entries.
	pub chunks: Vec<Chunk>,

	pub coding: CodingMeta,
	pub repair: RepairInfo,

	pub tags: EventTags,
}

impl ChunkEvent {
	/// A request addressing `chunks` in the given containers.
	pub fn request(id: u32, opcode: Opcode, container_ids: Vec<i32>, chunks: Vec<Chunk>) -> Self {
		Self {
			id,
			opcode,
			num_chunks: container_ids.len() as i32,
			container_ids,
			chunks,
			..Default::default()
		}
	}

	/// Turn this event into a failure reply for its own opcode, dropping all
	/// payloads.
	pub fn into_failure(mut self) -> Self {
		self.opcode = self.opcode.reply_fail();
		self.num_chunks = 0;
		self.container_ids.clear();
		self.chunks.clear();
		self.coding = CodingMeta::default();
		self.repair = RepairInfo::default();
		self
	}

	/// Sum of the payload sizes of all chunks currently attached.
	pub fn chunk_bytes(&self) -> u64 {
		self.chunks
			.iter()
			.map(|c| c.data.as_ref().map_or(0, |d| d.len() as u64))
			.sum()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use uuid::Uuid;

	#[test]
	fn test_request_counts_containers() {
		let chunks = vec![Chunk::new(0, Uuid::new_v4(), 0, 1); 2];
		let event = ChunkEvent::request(9, Opcode::GetChunkReq, vec![1, 2], chunks);
		assert_eq!(event.num_chunks, 2);
		assert_eq!(event.opcode, Opcode::GetChunkReq);
	}

	#[test]
	fn test_into_failure_clears_payload() {
		let mut chunk = Chunk::new(0, Uuid::new_v4(), 0, 1);
		chunk.set_data(Bytes::from_static(b"abc"));
		let event = ChunkEvent::request(1, Opcode::PutChunkReq, vec![1], vec![chunk]);
		let failure = event.into_failure();
		assert_eq!(failure.opcode, Opcode::PutChunkRepFail);
		assert_eq!(failure.num_chunks, 0);
		assert!(failure.chunks.is_empty());
		assert!(failure.container_ids.is_empty());
	}

	#[test]
	fn test_chunk_bytes() {
		let mut a = Chunk::default();
		a.set_data(Bytes::from(vec![0u8; 10]));
		let b = Chunk::default();
		let event = ChunkEvent {
			chunks: vec![a, b],
			..Default::default()
		};
		assert_eq!(event.chunk_bytes(), 10);
	}
}
