//! End-to-end exercise of a running agent over its data and control planes,
//! with two filesystem containers.

use bytes::Bytes;
use uuid::Uuid;

use coffer_agentd::{build, Config};
use coffer_proto::{
	coordinator_from_frames, md5_digest, recv_event, send_event, Chunk, ChunkEvent, CodingMeta,
	CoordinatorEvent, Opcode, RepairInfo, Tag,
};

const CHUNK_SIZE: usize = 1024;
const DATA_PORT: u16 = 58742;
const CTRL_PORT: u16 = 58743;

fn test_config(dir: &std::path::Path) -> Config {
	let yaml = format!(
		r#"
agent:
  num_workers: 4
  ip: 127.0.0.1
  port: {DATA_PORT}
  cport: {CTRL_PORT}
  register_to_proxy: false
event_probe_timeout_ms: 500
failure_timeout_ms: 10000
containers:
  - {{ id: 1, type: fs, path: {c1}, capacity: 1048576 }}
  - {{ id: 2, type: fs, path: {c2}, capacity: 1048576 }}
"#,
		c1 = dir.join("c1").display(),
		c2 = dir.join("c2").display(),
	);
	Config::from_yaml(&yaml).unwrap()
}

fn data_chunk(fuuid: Uuid, chunk_id: i32, byte: u8) -> Chunk {
	let mut chunk = Chunk::new(1, fuuid, chunk_id, 0);
	chunk.set_data(Bytes::from(vec![byte; CHUNK_SIZE]));
	chunk.compute_md5();
	chunk
}

fn meta_chunk(fuuid: Uuid, chunk_id: i32, byte: u8) -> Chunk {
	let mut chunk = data_chunk(fuuid, chunk_id, byte);
	chunk.release_data();
	chunk
}

fn request(socket: &zmq::Socket, mut event: ChunkEvent) -> ChunkEvent {
	if event.opcode.from_proxy() {
		event.tags.p2a.start = Tag::now();
	}
	send_event(socket, &event).unwrap();
	let (reply, _) = recv_event(socket).unwrap();
	assert_eq!(reply.id, event.id);
	reply
}

#[test]
fn test_agent_serves_chunk_events() {
	let dir = tempfile::TempDir::new().unwrap();
	let (agent, _rt) = build(test_config(dir.path())).unwrap();

	let runner = {
		let agent = agent.clone();
		std::thread::spawn(move || agent.run())
	};

	let ctx = zmq::Context::new();
	let socket = ctx.socket(zmq::REQ).unwrap();
	socket.set_rcvtimeo(30_000).unwrap();
	socket.connect(&format!("tcp://127.0.0.1:{DATA_PORT}")).unwrap();

	let fuuid = Uuid::new_v4();
	let all_a = md5_digest(&vec![b'a'; CHUNK_SIZE]);

	// 1. put two chunks of 'a' and read them back
	let reply = request(
		&socket,
		ChunkEvent::request(
			1,
			Opcode::PutChunkReq,
			vec![1, 2],
			vec![data_chunk(fuuid, 0, b'a'), data_chunk(fuuid, 1, b'a')],
		),
	);
	assert_eq!(reply.opcode, Opcode::PutChunkRepSuccess);
	assert_eq!(reply.num_chunks, 2);
	assert_eq!(reply.chunks[0].md5, all_a);

	let reply = request(
		&socket,
		ChunkEvent::request(
			2,
			Opcode::GetChunkReq,
			vec![1, 2],
			vec![meta_chunk(fuuid, 0, b'a'), meta_chunk(fuuid, 1, b'a')],
		),
	);
	assert_eq!(reply.opcode, Opcode::GetChunkRepSuccess);
	assert_eq!(reply.num_chunks, 2);
	for chunk in &reply.chunks {
		assert_eq!(chunk.data.as_deref(), Some(&vec![b'a'; CHUNK_SIZE][..]));
		assert_eq!(chunk.md5, all_a);
	}

	// 2. a get against a container this agent does not own fails fast
	let reply = request(
		&socket,
		ChunkEvent::request(
			3,
			Opcode::GetChunkReq,
			vec![1, 123],
			vec![meta_chunk(fuuid, 0, b'a'), meta_chunk(fuuid, 1, b'a')],
		),
	);
	assert_eq!(reply.opcode, Opcode::GetChunkRepFail);

	// 3. encode the two chunks with unit coefficients: equal buffers cancel
	let mut encode = ChunkEvent::request(
		4,
		Opcode::EncChunkReq,
		vec![1, 2],
		vec![meta_chunk(fuuid, 0, b'a'), meta_chunk(fuuid, 1, b'a')],
	);
	encode.coding = CodingMeta {
		scheme: 0,
		state: Bytes::from_static(&[1, 1]),
	};
	let reply = request(&socket, encode);
	assert_eq!(reply.opcode, Opcode::EncChunkRepSuccess);
	assert_eq!(reply.num_chunks, 1);
	assert_eq!(reply.chunks[0].size as usize, CHUNK_SIZE);
	assert!(reply.chunks[0].data.as_ref().unwrap().iter().all(|&b| b == 0));

	// 4. CAR repair: both survivors pre-encode on this same agent, the
	// target lands in container 1
	let mut repair = ChunkEvent::request(
		5,
		Opcode::RprChunkReq,
		vec![1],
		vec![Chunk::new(1, fuuid, 7, 0)],
	);
	repair.coding = CodingMeta {
		scheme: 0,
		state: Bytes::from_static(&[1, 1]),
	};
	repair.repair = RepairInfo {
		num_chunk_groups: 2,
		num_input_chunks: 2,
		chunk_group_map: vec![1, 0, 1, 1],
		container_group_map: vec![1, 2],
		agents: format!("tcp://127.0.0.1:{DATA_PORT};tcp://127.0.0.1:{DATA_PORT};"),
		using_car: true,
	};
	let reply = request(&socket, repair);
	assert_eq!(reply.opcode, Opcode::RprChunkRepSuccess);

	// the reconstructed chunk is the XOR of the two 'a' chunks
	let zeros = md5_digest(&vec![0u8; CHUNK_SIZE]);
	let mut repaired = Chunk::new(1, fuuid, 7, 0);
	repaired.md5 = zeros;
	repaired.size = CHUNK_SIZE as i32;
	let reply = request(
		&socket,
		ChunkEvent::request(6, Opcode::GetChunkReq, vec![1], vec![repaired.clone()]),
	);
	assert_eq!(reply.opcode, Opcode::GetChunkRepSuccess);
	assert!(reply.chunks[0].data.as_ref().unwrap().iter().all(|&b| b == 0));

	// 5. overwrite chunk 1 with zeros, then verify against the original
	// checksums: exactly the overwritten chunk is reported corrupted
	let mut zero_chunk = Chunk::new(1, fuuid, 1, 0);
	zero_chunk.set_data(Bytes::from(vec![0u8; CHUNK_SIZE]));
	zero_chunk.compute_md5();
	let reply = request(
		&socket,
		ChunkEvent::request(7, Opcode::PutChunkReq, vec![2], vec![zero_chunk]),
	);
	assert_eq!(reply.opcode, Opcode::PutChunkRepSuccess);
	let backup_version = reply.chunks[0].version.clone();
	assert!(!backup_version.is_empty());

	let reply = request(
		&socket,
		ChunkEvent::request(
			8,
			Opcode::VrfChunkReq,
			vec![1, 2],
			vec![meta_chunk(fuuid, 0, b'a'), meta_chunk(fuuid, 1, b'a')],
		),
	);
	assert_eq!(reply.opcode, Opcode::VrfChunkRepSuccess);
	assert_eq!(reply.num_chunks, 1);
	assert_eq!(reply.chunks[0].chunk_id, 1);

	// revert the overwrite and verify everything is clean again
	let mut revert_chunk = meta_chunk(fuuid, 1, b'a');
	revert_chunk.set_version(&backup_version);
	let reply = request(
		&socket,
		ChunkEvent::request(9, Opcode::RvtChunkReq, vec![2], vec![revert_chunk]),
	);
	assert_eq!(reply.opcode, Opcode::RvtChunkRepSuccess);

	let reply = request(
		&socket,
		ChunkEvent::request(
			10,
			Opcode::VrfChunkReq,
			vec![1, 2],
			vec![meta_chunk(fuuid, 0, b'a'), meta_chunk(fuuid, 1, b'a')],
		),
	);
	assert_eq!(reply.opcode, Opcode::VrfChunkRepSuccess);
	assert_eq!(reply.num_chunks, 0);

	// 6. delete both chunks; checks fail, verification flags them all
	let reply = request(
		&socket,
		ChunkEvent::request(
			11,
			Opcode::DelChunkReq,
			vec![1, 2],
			vec![meta_chunk(fuuid, 0, b'a'), meta_chunk(fuuid, 1, b'a')],
		),
	);
	assert_eq!(reply.opcode, Opcode::DelChunkRepSuccess);

	let reply = request(
		&socket,
		ChunkEvent::request(
			12,
			Opcode::ChkChunkReq,
			vec![1, 2],
			vec![meta_chunk(fuuid, 0, b'a'), meta_chunk(fuuid, 1, b'a')],
		),
	);
	assert_eq!(reply.opcode, Opcode::ChkChunkRepFail);

	let reply = request(
		&socket,
		ChunkEvent::request(
			13,
			Opcode::VrfChunkReq,
			vec![1, 2],
			vec![meta_chunk(fuuid, 0, b'a'), meta_chunk(fuuid, 1, b'a')],
		),
	);
	assert_eq!(reply.opcode, Opcode::VrfChunkRepSuccess);
	assert_eq!(reply.num_chunks, 2);

	// control plane: ping and container status
	let ctrl = ctx.socket(zmq::REQ).unwrap();
	ctrl.set_rcvtimeo(10_000).unwrap();
	ctrl.connect(&format!("tcp://127.0.0.1:{CTRL_PORT}")).unwrap();

	let ping = CoordinatorEvent::bare(Opcode::SynPing);
	ctrl.send_multipart(coffer_proto::coordinator_to_frames(&ping), 0)
		.unwrap();
	let frames = ctrl.recv_multipart(0).unwrap();
	assert_eq!(
		coordinator_from_frames(&frames).unwrap().opcode,
		Opcode::AckPing
	);

	let update = CoordinatorEvent::bare(Opcode::UpdAgentReq);
	ctrl.send_multipart(coffer_proto::coordinator_to_frames(&update), 0)
		.unwrap();
	let frames = ctrl.recv_multipart(0).unwrap();
	let status = coordinator_from_frames(&frames).unwrap();
	assert_eq!(status.opcode, Opcode::UpdAgentRep);
	assert_eq!(status.status.containers.len(), 2);
	assert_eq!(
		status.status.addr,
		format!("tcp://127.0.0.1:{DATA_PORT}")
	);

	// shut down and make sure the serving loop exits cleanly
	let stats = agent.stats().snapshot();
	assert!(stats.ops_ok >= 10);
	assert!(stats.ops_fail >= 1);
	assert!(stats.traffic_in > 0);
	assert!(stats.chunk_in as usize >= 3 * CHUNK_SIZE);

	agent.shutdown();
	runner.join().unwrap().unwrap();
}
