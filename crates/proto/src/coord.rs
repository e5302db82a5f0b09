//! Control-plane events between agents and proxies: registration, status
//! refresh, ping, and system-info queries. Same multipart conventions as the
//! chunk-event codec, much smaller vocabulary.

use crate::{Opcode, WireError};

/// Where the agent host runs, detected once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum HostType {
	#[default]
	OnPrem = 0,
	Aws = 1,
	Azure = 2,
	Ali = 3,
}

impl HostType {
	pub fn from_u8(raw: u8) -> Self {
		match raw {
			1 => Self::Aws,
			2 => Self::Azure,
			3 => Self::Ali,
			_ => Self::OnPrem,
		}
	}
}

/// One container as reported to a proxy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSummary {
	pub id: i32,
	pub ctype: u8,
	pub usage: u64,
	pub capacity: u64,
}

/// Registration / status payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentStatus {
	/// Data-plane endpoint of the agent (`tcp://ip:port`).
	pub addr: String,
	pub host_type: HostType,
	/// Control-plane port.
	pub cport: u16,
	pub containers: Vec<ContainerSummary>,
}

/// Sampled host load, returned for system-info queries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SysInfo {
	pub host_type: HostType,
	pub num_cpus: u32,
	/// Aggregate CPU usage, 0.0 to 100.0.
	pub cpu_usage: f32,
	pub mem_total: u64,
	pub mem_free: u64,
	pub load_avg: [f32; 3],
}

/// A control-plane request or reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoordinatorEvent {
	pub opcode: Opcode,
	pub status: AgentStatus,
	pub sysinfo: SysInfo,
}

impl CoordinatorEvent {
	pub fn bare(opcode: Opcode) -> Self {
		Self {
			opcode,
			..Default::default()
		}
	}

	fn has_status(opcode: Opcode) -> bool {
		matches!(opcode, Opcode::RegAgentReq | Opcode::UpdAgentRep)
	}

	fn has_sysinfo(opcode: Opcode) -> bool {
		opcode == Opcode::GetSysinfoRep
	}
}

fn frame_u16(value: u16) -> Vec<u8> {
	value.to_le_bytes().to_vec()
}

/// Serialize a coordinator event into wire frames.
pub fn coordinator_to_frames(event: &CoordinatorEvent) -> Vec<Vec<u8>> {
	let mut frames = vec![frame_u16(event.opcode as u16)];

	if CoordinatorEvent::has_status(event.opcode) {
		frames.push(event.status.addr.as_bytes().to_vec());
		frames.push(vec![event.status.host_type as u8]);
		frames.push(frame_u16(event.status.cport));
		frames.push((event.status.containers.len() as i32).to_le_bytes().to_vec());

		let containers = &event.status.containers;
		let mut ids = Vec::with_capacity(containers.len() * 4);
		let mut types = Vec::with_capacity(containers.len());
		let mut usage = Vec::with_capacity(containers.len() * 8);
		let mut capacity = Vec::with_capacity(containers.len() * 8);
		for c in containers {
			ids.extend_from_slice(&c.id.to_le_bytes());
			types.push(c.ctype);
			usage.extend_from_slice(&c.usage.to_le_bytes());
			capacity.extend_from_slice(&c.capacity.to_le_bytes());
		}
		frames.push(ids);
		frames.push(types);
		frames.push(usage);
		frames.push(capacity);
	}

	if CoordinatorEvent::has_sysinfo(event.opcode) {
		let si = &event.sysinfo;
		frames.push(vec![si.host_type as u8]);
		frames.push(si.num_cpus.to_le_bytes().to_vec());
		frames.push(si.cpu_usage.to_le_bytes().to_vec());
		frames.push(si.mem_total.to_le_bytes().to_vec());
		frames.push(si.mem_free.to_le_bytes().to_vec());
		let mut loads = Vec::with_capacity(12);
		for l in si.load_avg {
			loads.extend_from_slice(&l.to_le_bytes());
		}
		frames.push(loads);
	}

	frames
}

/// Parse a coordinator event from wire frames.
pub fn coordinator_from_frames(frames: &[Vec<u8>]) -> Result<CoordinatorEvent, WireError> {
	fn next<'a>(
		frames: &'a [Vec<u8>],
		pos: &mut usize,
		field: &'static str,
	) -> Result<&'a [u8], WireError> {
		let frame = frames.get(*pos).ok_or(WireError::MissingFrame { field })?;
		*pos += 1;
		Ok(frame)
	}

	fn fixed<const N: usize>(
		frames: &[Vec<u8>],
		pos: &mut usize,
		field: &'static str,
	) -> Result<[u8; N], WireError> {
		let frame = next(frames, pos, field)?;
		frame.try_into().map_err(|_| WireError::BadFrame {
			field,
			reason: format!("expected {N} bytes, got {}", frame.len()),
		})
	}

	let mut pos = 0;
	let raw_op = u16::from_le_bytes(fixed(frames, &mut pos, "opcode")?);
	let opcode = Opcode::from_u16(raw_op).ok_or(WireError::UnknownOpcode(raw_op))?;
	let mut event = CoordinatorEvent::bare(opcode);

	if CoordinatorEvent::has_status(opcode) {
		event.status.addr = String::from_utf8_lossy(next(frames, &mut pos, "status.addr")?).into_owned();
		event.status.host_type = HostType::from_u8(fixed::<1>(frames, &mut pos, "status.host_type")?[0]);
		event.status.cport = u16::from_le_bytes(fixed(frames, &mut pos, "status.cport")?);

		let count = i32::from_le_bytes(fixed(frames, &mut pos, "status.num_containers")?);
		if !(0..=4096).contains(&count) {
			return Err(WireError::BadFrame {
				field: "status.num_containers",
				reason: format!("impossible count {count}"),
			});
		}
		let count = count as usize;

		let ids = next(frames, &mut pos, "status.container_ids")?;
		let types = next(frames, &mut pos, "status.container_types")?;
		let usage = next(frames, &mut pos, "status.container_usage")?;
		let capacity = next(frames, &mut pos, "status.container_capacity")?;
		if ids.len() != count * 4
			|| types.len() != count
			|| usage.len() != count * 8
			|| capacity.len() != count * 8
		{
			return Err(WireError::BadFrame {
				field: "status.containers",
				reason: "array length mismatch".into(),
			});
		}

		event.status.containers = (0..count)
			.map(|i| ContainerSummary {
				id: i32::from_le_bytes(ids[i * 4..i * 4 + 4].try_into().unwrap()),
				ctype: types[i],
				usage: u64::from_le_bytes(usage[i * 8..i * 8 + 8].try_into().unwrap()),
				capacity: u64::from_le_bytes(capacity[i * 8..i * 8 + 8].try_into().unwrap()),
			})
			.collect();
	}

	if CoordinatorEvent::has_sysinfo(opcode) {
		event.sysinfo.host_type = HostType::from_u8(fixed::<1>(frames, &mut pos, "sysinfo.host_type")?[0]);
		event.sysinfo.num_cpus = u32::from_le_bytes(fixed(frames, &mut pos, "sysinfo.num_cpus")?);
		event.sysinfo.cpu_usage = f32::from_le_bytes(fixed(frames, &mut pos, "sysinfo.cpu_usage")?);
		event.sysinfo.mem_total = u64::from_le_bytes(fixed(frames, &mut pos, "sysinfo.mem_total")?);
		event.sysinfo.mem_free = u64::from_le_bytes(fixed(frames, &mut pos, "sysinfo.mem_free")?);
		let loads: [u8; 12] = fixed(frames, &mut pos, "sysinfo.load_avg")?;
		for (i, chunk) in loads.chunks_exact(4).enumerate() {
			event.sysinfo.load_avg[i] = f32::from_le_bytes(chunk.try_into().unwrap());
		}
	}

	Ok(event)
}

/// Send a coordinator event as one multipart message.
pub fn send_coordinator_event(
	socket: &zmq::Socket,
	event: &CoordinatorEvent,
) -> Result<u64, WireError> {
	let frames = coordinator_to_frames(event);
	let bytes = frames.iter().map(|f| f.len() as u64).sum();
	socket.send_multipart(frames, 0)?;
	Ok(bytes)
}

/// Receive and parse one coordinator event.
pub fn recv_coordinator_event(socket: &zmq::Socket) -> Result<(CoordinatorEvent, u64), WireError> {
	let frames = socket.recv_multipart(0)?;
	let bytes = frames.iter().map(|f| f.len() as u64).sum();
	let event = coordinator_from_frames(&frames)?;
	Ok((event, bytes))
}
