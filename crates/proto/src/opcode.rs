/// Reed-Solomon (XOR/GF-256) coding scheme tag.
pub const CODING_SCHEME_RS: u8 = 0;
/// One past the last valid coding scheme tag.
pub const CODING_SCHEME_UNKNOWN: u8 = 1;

/// Operation codes for chunk and coordinator events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u16)]
pub enum Opcode {
	#[default]
	Unknown = 0,

	PutChunkReq = 1,
	PutChunkRepSuccess = 2,
	PutChunkRepFail = 3,
	GetChunkReq = 4,
	GetChunkRepSuccess = 5,
	GetChunkRepFail = 6,
	DelChunkReq = 7,
	DelChunkRepSuccess = 8,
	DelChunkRepFail = 9,
	CpyChunkReq = 10,
	CpyChunkRepSuccess = 11,
	CpyChunkRepFail = 12,
	MovChunkReq = 13,
	MovChunkRepSuccess = 14,
	MovChunkRepFail = 15,
	EncChunkReq = 16,
	EncChunkRepSuccess = 17,
	EncChunkRepFail = 18,
	RprChunkReq = 19,
	RprChunkRepSuccess = 20,
	RprChunkRepFail = 21,
	ChkChunkReq = 22,
	ChkChunkRepSuccess = 23,
	ChkChunkRepFail = 24,
	VrfChunkReq = 25,
	VrfChunkRepSuccess = 26,
	VrfChunkRepFail = 27,
	RvtChunkReq = 28,
	RvtChunkRepSuccess = 29,
	RvtChunkRepFail = 30,

	RegAgentReq = 64,
	RegAgentRepSuccess = 65,
	RegAgentRepFail = 66,
	UpdAgentReq = 67,
	UpdAgentRep = 68,
	SynPing = 69,
	AckPing = 70,
	GetSysinfoReq = 71,
	GetSysinfoRep = 72,
}

impl Opcode {
	pub fn from_u16(raw: u16) -> Option<Self> {
		use Opcode::*;
		Some(match raw {
			0 => Unknown,
			1 => PutChunkReq,
			2 => PutChunkRepSuccess,
			3 => PutChunkRepFail,
			4 => GetChunkReq,
			5 => GetChunkRepSuccess,
			6 => GetChunkRepFail,
			7 => DelChunkReq,
			8 => DelChunkRepSuccess,
			9 => DelChunkRepFail,
			10 => CpyChunkReq,
			11 => CpyChunkRepSuccess,
			12 => CpyChunkRepFail,
			13 => MovChunkReq,
			14 => MovChunkRepSuccess,
			15 => MovChunkRepFail,
			16 => EncChunkReq,
			17 => EncChunkRepSuccess,
			18 => EncChunkRepFail,
			19 => RprChunkReq,
			20 => RprChunkRepSuccess,
			21 => RprChunkRepFail,
			22 => ChkChunkReq,
			23 => ChkChunkRepSuccess,
			24 => ChkChunkRepFail,
			25 => VrfChunkReq,
			26 => VrfChunkRepSuccess,
			27 => VrfChunkRepFail,
			28 => RvtChunkReq,
			29 => RvtChunkRepSuccess,
			30 => RvtChunkRepFail,
			64 => RegAgentReq,
			65 => RegAgentRepSuccess,
			66 => RegAgentRepFail,
			67 => UpdAgentReq,
			68 => UpdAgentRep,
			69 => SynPing,
			70 => AckPing,
			71 => GetSysinfoReq,
			72 => GetSysinfoRep,
			_ => return None,
		})
	}

	/// Whether messages with this opcode originate from a proxy (or from the
	/// orchestrating agent during repair, which speaks as a proxy).
	pub fn from_proxy(self) -> bool {
		use Opcode::*;
		matches!(
			self,
			PutChunkReq
				| GetChunkReq | DelChunkReq
				| CpyChunkReq | EncChunkReq
				| RegAgentReq | UpdAgentReq
				| SynPing | RprChunkReq
				| ChkChunkReq | MovChunkReq
				| VrfChunkReq
		)
	}

	/// Whether the message carries the chunk section (count, ids, tuples).
	///
	/// Failure replies and delete replies carry none.
	pub fn has_data(self) -> bool {
		use Opcode::*;
		!matches!(
			self,
			PutChunkRepFail
				| GetChunkRepFail | DelChunkRepFail
				| DelChunkRepSuccess | CpyChunkRepFail
				| MovChunkRepFail | EncChunkRepFail
				| RprChunkRepFail | ChkChunkRepFail
				| VrfChunkRepFail | RvtChunkRepFail
		)
	}

	/// Whether the chunk section includes the container-id array.
	///
	/// Encode and verify replies address no containers.
	pub fn has_container_ids(self) -> bool {
		use Opcode::*;
		self.has_data()
			&& !matches!(
				self,
				EncChunkRepSuccess | EncChunkRepFail | VrfChunkRepSuccess | VrfChunkRepFail
			)
	}

	/// Whether each chunk tuple is followed by its payload frame.
	pub fn has_chunk_data(self) -> bool {
		use Opcode::*;
		matches!(self, PutChunkReq | GetChunkRepSuccess | EncChunkRepSuccess) && self.has_data()
	}

	/// Whether the message carries the coding-state section.
	pub fn needs_coding(self) -> bool {
		matches!(self, Opcode::EncChunkReq | Opcode::RprChunkReq)
	}

	/// Whether the message carries the repair descriptor.
	pub fn has_repair_info(self) -> bool {
		self == Opcode::RprChunkReq
	}

	/// How many chunk tuples travel per counted chunk.
	///
	/// Copy and move requests interleave source and destination tuples in
	/// one array, so they carry twice `num_chunks` tuples.
	pub fn chunk_factor(self) -> i32 {
		match self {
			Opcode::CpyChunkReq | Opcode::MovChunkReq => 2,
			_ => 1,
		}
	}

	/// The success reply for a request opcode.
	pub fn reply_success(self) -> Opcode {
		use Opcode::*;
		match self {
			PutChunkReq => PutChunkRepSuccess,
			GetChunkReq => GetChunkRepSuccess,
			DelChunkReq => DelChunkRepSuccess,
			CpyChunkReq => CpyChunkRepSuccess,
			MovChunkReq => MovChunkRepSuccess,
			EncChunkReq => EncChunkRepSuccess,
			RprChunkReq => RprChunkRepSuccess,
			ChkChunkReq => ChkChunkRepSuccess,
			VrfChunkReq => VrfChunkRepSuccess,
			RvtChunkReq => RvtChunkRepSuccess,
			RegAgentReq => RegAgentRepSuccess,
			other => other,
		}
	}

	/// The failure reply for a request opcode.
	pub fn reply_fail(self) -> Opcode {
		use Opcode::*;
		match self {
			PutChunkReq => PutChunkRepFail,
			GetChunkReq => GetChunkRepFail,
			DelChunkReq => DelChunkRepFail,
			CpyChunkReq => CpyChunkRepFail,
			MovChunkReq => MovChunkRepFail,
			EncChunkReq => EncChunkRepFail,
			RprChunkReq => RprChunkRepFail,
			ChkChunkReq => ChkChunkRepFail,
			VrfChunkReq => VrfChunkRepFail,
			RvtChunkReq => RvtChunkRepFail,
			RegAgentReq => RegAgentRepFail,
			other => other,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_round_trip_u16() {
		for raw in 0..=128u16 {
			if let Some(op) = Opcode::from_u16(raw) {
				assert_eq!(op as u16, raw);
			}
		}
	}

	#[test]
	fn test_direction_predicates() {
		assert!(Opcode::PutChunkReq.from_proxy());
		assert!(Opcode::SynPing.from_proxy());
		// revert requests are the one data-plane request counted as
		// agent-originated on the wire
		assert!(!Opcode::RvtChunkReq.from_proxy());
		assert!(!Opcode::PutChunkRepSuccess.from_proxy());
	}

	#[test]
	fn test_data_predicates() {
		assert!(Opcode::PutChunkReq.has_data());
		assert!(Opcode::PutChunkRepSuccess.has_data());
		assert!(!Opcode::PutChunkRepFail.has_data());
		assert!(!Opcode::DelChunkRepSuccess.has_data());
		assert!(!Opcode::RvtChunkRepFail.has_data());

		assert!(Opcode::GetChunkRepSuccess.has_container_ids());
		assert!(!Opcode::EncChunkRepSuccess.has_container_ids());
		assert!(!Opcode::VrfChunkRepSuccess.has_container_ids());

		assert!(Opcode::PutChunkReq.has_chunk_data());
		assert!(Opcode::GetChunkRepSuccess.has_chunk_data());
		assert!(Opcode::EncChunkRepSuccess.has_chunk_data());
		assert!(!Opcode::GetChunkReq.has_chunk_data());
	}

	#[test]
	fn test_coding_predicates() {
		assert!(Opcode::EncChunkReq.needs_coding());
		assert!(Opcode::RprChunkReq.needs_coding());
		assert!(!Opcode::PutChunkReq.needs_coding());
		assert!(Opcode::RprChunkReq.has_repair_info());
		assert!(!Opcode::EncChunkReq.has_repair_info());
	}

	#[test]
	fn test_chunk_factor() {
		assert_eq!(Opcode::CpyChunkReq.chunk_factor(), 2);
		assert_eq!(Opcode::MovChunkReq.chunk_factor(), 2);
		assert_eq!(Opcode::CpyChunkRepSuccess.chunk_factor(), 1);
		assert_eq!(Opcode::PutChunkReq.chunk_factor(), 1);
	}

	#[test]
	fn test_reply_mapping() {
		assert_eq!(Opcode::PutChunkReq.reply_success(), Opcode::PutChunkRepSuccess);
		assert_eq!(Opcode::PutChunkReq.reply_fail(), Opcode::PutChunkRepFail);
		assert_eq!(Opcode::VrfChunkReq.reply_success(), Opcode::VrfChunkRepSuccess);
		assert_eq!(Opcode::RegAgentReq.reply_fail(), Opcode::RegAgentRepFail);
	}
}
