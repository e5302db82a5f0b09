use bytes::Bytes;
use md5::{Digest, Md5};
use uuid::Uuid;

/// Length of an MD5 digest in bytes.
pub const MD5_DIGEST_LENGTH: usize = 16;

/// Maximum length of a chunk version token on the wire.
///
/// Back-end native tokens (S3 VersionId, Azure snapshot timestamp, the unix
/// timestamp suffix of filesystem backups) are truncated to this many bytes.
pub const CHUNK_VERSION_MAX_LEN: usize = 31;

/// Compute the MD5 digest of a byte slice.
pub fn md5_digest(data: &[u8]) -> [u8; MD5_DIGEST_LENGTH] {
	let mut hasher = Md5::new();
	hasher.update(data);
	hasher.finalize().into()
}

/// A single stored chunk.
///
/// Identity is the tuple (namespace, file uuid, file version, chunk id); the
/// canonical [name](Chunk::name) doubles as the back-end object key. Payloads
/// are refcounted [`Bytes`], so cloning a chunk (or slicing a repair buffer
/// into per-peer views) never copies or double-frees data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Chunk {
	pub namespace_id: u8,
	pub fuuid: Uuid,
	pub chunk_id: i32,
	pub file_version: i32,

	/// Back-end version token for a later revert, at most
	/// [`CHUNK_VERSION_MAX_LEN`] bytes. Opaque to everything but the driver
	/// that minted it.
	pub version: String,

	pub md5: [u8; MD5_DIGEST_LENGTH],
	pub size: i32,
	pub data: Option<Bytes>,
}

impl Chunk {
	pub fn new(namespace_id: u8, fuuid: Uuid, chunk_id: i32, file_version: i32) -> Self {
		Self {
			namespace_id,
			fuuid,
			chunk_id,
			file_version,
			..Default::default()
		}
	}

	/// Canonical chunk name, used as the back-end object key.
	pub fn name(&self) -> String {
		format!(
			"{}_{}_{}_{}",
			self.namespace_id, self.fuuid, self.file_version, self.chunk_id
		)
	}

	pub fn set_id(&mut self, namespace_id: u8, fuuid: Uuid, chunk_id: i32) {
		self.namespace_id = namespace_id;
		self.fuuid = fuuid;
		self.chunk_id = chunk_id;
	}

	/// Copy identity, version token, checksum, and optionally size from
	/// another chunk, leaving the payload untouched.
	pub fn copy_meta(&mut self, src: &Chunk, copy_size: bool) {
		self.set_id(src.namespace_id, src.fuuid, src.chunk_id);
		self.file_version = src.file_version;
		self.version = src.version.clone();
		self.md5 = src.md5;
		if copy_size {
			self.size = src.size;
		}
	}

	/// Store a version token, truncating to the wire limit.
	pub fn set_version(&mut self, token: &str) {
		self.version = if token.len() > CHUNK_VERSION_MAX_LEN {
			let mut end = CHUNK_VERSION_MAX_LEN;
			while !token.is_char_boundary(end) {
				end -= 1;
			}
			token[..end].to_string()
		} else {
			token.to_string()
		};
	}

	/// Attach a payload and keep the size field in sync.
	pub fn set_data(&mut self, data: Bytes) {
		self.size = data.len() as i32;
		self.data = Some(data);
	}

	/// Drop the payload without touching metadata.
	pub fn release_data(&mut self) {
		self.data = None;
	}

	/// Recompute the stored MD5 from the current payload.
	///
	/// Returns false when there is no payload to hash.
	pub fn compute_md5(&mut self) -> bool {
		match &self.data {
			Some(data) => {
				self.md5 = md5_digest(data);
				true
			}
			None => false,
		}
	}

	/// Check the current payload against the stored MD5.
	pub fn verify_md5(&self) -> bool {
		match &self.data {
			Some(data) => md5_digest(data) == self.md5,
			None => false,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_chunk_name_format() {
		let fuuid = Uuid::parse_str("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap();
		let chunk = Chunk::new(1, fuuid, 3, 7);
		assert_eq!(
			chunk.name(),
			"1_67e55044-10b1-426f-9247-bb680e5fe0c8_7_3"
		);
	}

	#[test]
	fn test_version_truncation() {
		let mut chunk = Chunk::default();
		chunk.set_version(&"v".repeat(64));
		assert_eq!(chunk.version.len(), CHUNK_VERSION_MAX_LEN);
		chunk.set_version("short");
		assert_eq!(chunk.version, "short");
	}

	#[test]
	fn test_md5_round_trip() {
		let mut chunk = Chunk::new(0, Uuid::new_v4(), 0, 0);
		chunk.set_data(Bytes::from(vec![b'a'; 1024]));
		assert!(chunk.compute_md5());
		assert!(chunk.verify_md5());
		assert_eq!(chunk.md5, md5_digest(&[b'a'; 1024]));

		chunk.set_data(Bytes::from(vec![b'b'; 1024]));
		assert!(!chunk.verify_md5());
	}

	#[test]
	fn test_md5_without_payload() {
		let mut chunk = Chunk::default();
		assert!(!chunk.compute_md5());
		assert!(!chunk.verify_md5());
	}

	#[test]
	fn test_copy_meta() {
		let mut src = Chunk::new(2, Uuid::new_v4(), 4, 1);
		src.set_version("1700000000");
		src.md5 = [7; 16];
		src.size = 512;

		let mut dst = Chunk::default();
		dst.copy_meta(&src, false);
		assert_eq!(dst.fuuid, src.fuuid);
		assert_eq!(dst.version, src.version);
		assert_eq!(dst.md5, src.md5);
		assert_eq!(dst.size, 0);

		dst.copy_meta(&src, true);
		assert_eq!(dst.size, 512);
	}
}
