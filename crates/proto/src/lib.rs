#![deny(rust_2018_idioms)]

//! Data model and wire protocol shared by the coffer storage agents and the
//! proxy tier. Chunk events travel as multipart ZeroMQ messages; the codec
//! here is the single source of truth for the frame layout.

mod chunk;
mod coord;
mod event;
mod opcode;
mod wire;

pub use chunk::{md5_digest, Chunk, CHUNK_VERSION_MAX_LEN, MD5_DIGEST_LENGTH};
pub use coord::{
	coordinator_from_frames, coordinator_to_frames, recv_coordinator_event,
	send_coordinator_event, AgentStatus, ContainerSummary, CoordinatorEvent, HostType, SysInfo,
};
pub use event::{ChunkEvent, CodingMeta, EventTags, RepairInfo, Tag, TagPair};
pub use opcode::{Opcode, CODING_SCHEME_RS, CODING_SCHEME_UNKNOWN};
pub use wire::{from_frames, recv_event, send_event, to_frames, WireError};

/// Format a ZeroMQ TCP endpoint from an IP and port.
pub fn tcp_addr(ip: &str, port: u16) -> String {
	format!("tcp://{ip}:{port}")
}

/// Extract the IP part of a `tcp://ip:port` endpoint.
pub fn addr_ip(addr: &str) -> &str {
	let start = addr.rfind('/').map_or(0, |i| i + 1);
	let end = addr.rfind(':').unwrap_or(addr.len());
	if end > start {
		&addr[start..end]
	} else {
		&addr[start..]
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_tcp_addr() {
		assert_eq!(tcp_addr("127.0.0.1", 57002), "tcp://127.0.0.1:57002");
		assert_eq!(tcp_addr("0.0.0.0", 1), "tcp://0.0.0.0:1");
	}

	#[test]
	fn test_addr_ip() {
		assert_eq!(addr_ip("tcp://127.0.0.1:57002"), "127.0.0.1");
		assert_eq!(addr_ip("tcp://10.0.0.3:80"), "10.0.0.3");
	}
}
