//! Routes chunk operations to containers by id and aggregates usage.

use std::collections::HashMap;

use bytes::Bytes;
use miette::{miette, Result};
use tokio::runtime::Handle;
use tracing::{debug, error, warn};

use crate::coding;
use crate::config::{Config, ContainerType};
use crate::container::{AwsContainer, AzureContainer, Container, FsContainer, OssContainer};
use crate::error::{ContainerError, ContainerResult};
use coffer_proto::{Chunk, ContainerSummary};

pub struct ContainerManager {
	containers: HashMap<i32, Box<dyn Container>>,
	/// Container ids in configuration order, for stable status reports.
	order: Vec<i32>,
	verify_checksum: bool,
}

impl ContainerManager {
	pub fn new(config: &Config, rt: Handle) -> Result<Self> {
		let mut containers: HashMap<i32, Box<dyn Container>> = HashMap::new();
		let mut order = Vec::with_capacity(config.containers.len());

		for c in &config.containers {
			let driver: Box<dyn Container> = match c.ctype {
				ContainerType::Fs => Box::new(FsContainer::new(
					c,
					config.verify_chunk_checksum,
					config.agent.flush_on_close,
					config.copy_block_size,
				)?),
				ContainerType::AwsS3 => Box::new(AwsContainer::new(
					c,
					config.verify_chunk_checksum,
					rt.clone(),
				)?),
				ContainerType::AliOss => Box::new(OssContainer::new(
					c,
					config.verify_chunk_checksum,
					rt.clone(),
				)?),
				ContainerType::AzureBlob => Box::new(AzureContainer::new(
					c,
					config.verify_chunk_checksum,
					rt.clone(),
				)?),
			};
			if containers.insert(c.id, driver).is_some() {
				return Err(miette!("duplicate container id {}", c.id));
			}
			order.push(c.id);
		}

		Ok(Self {
			containers,
			order,
			verify_checksum: config.verify_chunk_checksum,
		})
	}

	fn container(&self, id: i32) -> ContainerResult<&dyn Container> {
		self.containers
			.get(&id)
			.map(|c| c.as_ref())
			.ok_or_else(|| ContainerError::backend("no-container", format!("container {id} is not resident")))
	}

	pub fn num_containers(&self) -> usize {
		self.order.len()
	}

	/// Id, type, usage, and capacity of every container, scheduling a usage
	/// refresh so the next report is fresher.
	pub fn container_summaries(&self) -> Vec<ContainerSummary> {
		self.order
			.iter()
			.filter_map(|id| self.containers.get(id))
			.map(|c| {
				let summary = ContainerSummary {
					id: c.id(),
					ctype: c.type_tag(),
					usage: c.usage(),
					capacity: c.capacity(),
				};
				c.bg_update_usage();
				summary
			})
			.collect()
	}

	/// Store a batch of chunks, one container id per chunk.
	///
	/// The batch is not atomic: on the first failure, chunks already written
	/// are deleted best-effort and the whole batch reports failure.
	pub fn put_chunks(&self, ids: &[i32], chunks: &mut [Chunk]) -> ContainerResult<()> {
		let mut written = 0;
		let mut failure = None;

		for (i, (id, chunk)) in ids.iter().zip(chunks.iter_mut()).enumerate() {
			if self.verify_checksum && !chunk.verify_md5() {
				failure = Some((
					i,
					ContainerError::integrity(format!(
						"incoming chunk {} failed checksum verification",
						chunk.name()
					)),
				));
				break;
			}
			let result = self
				.container(*id)
				.and_then(|c| {
					let put = c.put_chunk(chunk);
					c.bg_update_usage();
					put
				});
			match result {
				Ok(()) => written = i + 1,
				Err(err) => {
					failure = Some((i, err));
					break;
				}
			}
		}

		let Some((index, err)) = failure else {
			return Ok(());
		};
		error!(chunk = index, "put batch failed, rolling back {written} written chunks: {err}");
		for j in 0..written {
			if let Ok(c) = self.container(ids[j]) {
				if let Err(err) = c.delete_chunk(&chunks[j]) {
					warn!(container = ids[j], "rollback delete failed: {err}");
				}
				c.bg_update_usage();
			}
		}
		Err(err)
	}

	/// Fetch a batch of chunks, stopping at the first failure.
	pub fn get_chunks(&self, ids: &[i32], chunks: &mut [Chunk]) -> ContainerResult<()> {
		for (id, chunk) in ids.iter().zip(chunks.iter_mut()) {
			self.container(*id)?.get_chunk(chunk, false)?;
		}
		Ok(())
	}

	/// Delete a batch of chunks, best-effort over every entry.
	pub fn delete_chunks(&self, ids: &[i32], chunks: &[Chunk]) {
		for (id, chunk) in ids.iter().zip(chunks.iter()) {
			match self.container(*id) {
				Ok(c) => {
					if let Err(err) = c.delete_chunk(chunk) {
						warn!(container = id, chunk = %chunk.name(), "delete failed: {err}");
					}
					c.bg_update_usage();
				}
				Err(err) => warn!(container = id, "delete skipped: {err}"),
			}
		}
	}

	/// Copy a batch of chunks within their containers.
	///
	/// On the first failure, destinations already copied are deleted.
	pub fn copy_chunks(
		&self,
		ids: &[i32],
		srcs: &[Chunk],
		dsts: &mut [Chunk],
	) -> ContainerResult<()> {
		for i in 0..srcs.len() {
			let result = self.container(ids[i]).and_then(|c| {
				let copied = c.copy_chunk(&srcs[i], &mut dsts[i]);
				c.bg_update_usage();
				copied
			});
			if let Err(err) = result {
				error!(container = ids[i], "copy batch failed: {err}");
				for j in 0..i {
					if let Ok(c) = self.container(ids[j]) {
						let _ = c.delete_chunk(&dsts[j]);
					}
				}
				return Err(err);
			}
		}
		Ok(())
	}

	/// Move a batch of chunks within their containers.
	///
	/// On the first failure, chunks already moved are moved back.
	pub fn move_chunks(
		&self,
		ids: &[i32],
		srcs: &mut [Chunk],
		dsts: &mut [Chunk],
	) -> ContainerResult<()> {
		for i in 0..srcs.len() {
			let result = self.container(ids[i]).and_then(|c| {
				let moved = c.move_chunk(&srcs[i], &mut dsts[i]);
				c.bg_update_usage();
				moved
			});
			if let Err(err) = result {
				error!(container = ids[i], "move batch failed: {err}");
				for j in 0..i {
					if let Ok(c) = self.container(ids[j]) {
						if let Err(err) = c.move_chunk(&dsts[j], &mut srcs[j]) {
							warn!(container = ids[j], "rollback move failed: {err}");
						}
					}
				}
				return Err(err);
			}
		}
		Ok(())
	}

	/// Whether every chunk of the batch exists with matching metadata.
	pub fn has_chunks(&self, ids: &[i32], chunks: &[Chunk]) -> bool {
		ids.iter().zip(chunks.iter()).all(|(id, chunk)| {
			self.container(*id)
				.map(|c| c.has_chunk(chunk))
				.unwrap_or(false)
		})
	}

	/// Verify a batch of chunks against their stored digests.
	///
	/// Returns the number of corrupted chunks and compacts the batch in
	/// place so that the first N entries are the corrupted ones.
	pub fn verify_chunks(&self, ids: &[i32], chunks: &mut [Chunk]) -> ContainerResult<usize> {
		let mut corrupted = 0;
		for i in 0..chunks.len() {
			let container = self.container(ids[i])?;
			if !container.verify_chunk(&chunks[i]) {
				chunks.swap(corrupted, i);
				corrupted += 1;
			}
		}
		Ok(corrupted)
	}

	/// Revert a batch of chunks, stopping at the first failure.
	pub fn revert_chunks(&self, ids: &[i32], chunks: &[Chunk]) -> ContainerResult<()> {
		for (id, chunk) in ids.iter().zip(chunks.iter()) {
			self.container(*id)?.revert_chunk(chunk)?;
		}
		Ok(())
	}

	/// Fetch the addressed chunks and combine them into one chunk with the
	/// given coefficient row.
	///
	/// Fetches skip checksum verification: inputs may be sub-chunks of a
	/// repair group rather than client-visible chunks.
	pub fn get_encoded_chunks(
		&self,
		ids: &[i32],
		chunks: &[Chunk],
		matrix: &[u8],
	) -> ContainerResult<Chunk> {
		if chunks.is_empty() {
			return Err(ContainerError::integrity("encode over an empty chunk list"));
		}

		let mut raw = Vec::with_capacity(chunks.len());
		for (id, chunk) in ids.iter().zip(chunks.iter()) {
			let mut fetched = Chunk::new(
				chunk.namespace_id,
				chunk.fuuid,
				chunk.chunk_id,
				chunk.file_version,
			);
			self.container(*id)?.get_chunk(&mut fetched, true)?;
			raw.push(fetched);
		}

		let chunk_size = raw[0].size as usize;
		let inputs: Vec<&[u8]> = raw
			.iter()
			.map(|c| c.data.as_deref().unwrap_or_default())
			.collect();
		let outputs = coding::encode(&inputs, 1, chunk_size, matrix).ok_or_else(|| {
			ContainerError::integrity("coding state too short for the requested encode")
		})?;

		let mut coded = Chunk::default();
		coded.set_data(Bytes::from(outputs.into_iter().next().expect("one output row")));
		debug!(inputs = chunks.len(), size = coded.size, "encoded chunk batch");
		Ok(coded)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Config;
	use coffer_proto::md5_digest;
	use tempfile::TempDir;
	use uuid::Uuid;

	fn test_manager(verify: bool) -> (TempDir, ContainerManager, tokio::runtime::Runtime) {
		let dir = TempDir::new().unwrap();
		let yaml = format!(
			r#"
agent: {{ register_to_proxy: false }}
verify_chunk_checksum: {verify}
containers:
  - {{ id: 1, type: fs, path: {c1}, capacity: 1048576 }}
  - {{ id: 2, type: fs, path: {c2}, capacity: 1048576 }}
"#,
			c1 = dir.path().join("c1").display(),
			c2 = dir.path().join("c2").display(),
		);
		let config = Config::from_yaml(&yaml).unwrap();
		let rt = tokio::runtime::Builder::new_multi_thread()
			.worker_threads(1)
			.enable_all()
			.build()
			.unwrap();
		let manager = ContainerManager::new(&config, rt.handle().clone()).unwrap();
		(dir, manager, rt)
	}

	fn chunk_with(byte: u8, chunk_id: i32, fuuid: Uuid) -> Chunk {
		let mut chunk = Chunk::new(1, fuuid, chunk_id, 0);
		chunk.set_data(Bytes::from(vec![byte; 1024]));
		chunk.compute_md5();
		chunk
	}

	#[test]
	fn test_put_get_batch() {
		let (_dir, manager, _rt) = test_manager(true);
		let fuuid = Uuid::new_v4();
		let mut chunks = vec![chunk_with(b'a', 0, fuuid), chunk_with(b'a', 1, fuuid)];
		manager.put_chunks(&[1, 2], &mut chunks).unwrap();

		let mut fetched = chunks.clone();
		for c in &mut fetched {
			c.release_data();
		}
		manager.get_chunks(&[1, 2], &mut fetched).unwrap();
		assert_eq!(fetched[0].data.as_deref(), Some(&vec![b'a'; 1024][..]));
		assert_eq!(fetched[1].md5, md5_digest(&vec![b'a'; 1024]));
	}

	#[test]
	fn test_put_to_missing_container_rolls_back() {
		let (_dir, manager, _rt) = test_manager(true);
		let fuuid = Uuid::new_v4();
		let mut chunks = vec![chunk_with(b'b', 0, fuuid), chunk_with(b'b', 1, fuuid)];
		assert!(manager.put_chunks(&[1, 123], &mut chunks).is_err());

		// the chunk written to container 1 was rolled back
		assert!(!manager.has_chunks(&[1], &chunks[..1]));
	}

	#[test]
	fn test_get_from_missing_container_fails() {
		let (_dir, manager, _rt) = test_manager(true);
		let fuuid = Uuid::new_v4();
		let mut chunks = vec![chunk_with(b'c', 0, fuuid)];
		manager.put_chunks(&[1], &mut chunks).unwrap();
		chunks[0].release_data();
		assert!(manager.get_chunks(&[123], &mut chunks).is_err());
	}

	#[test]
	fn test_delete_is_best_effort() {
		let (_dir, manager, _rt) = test_manager(true);
		let fuuid = Uuid::new_v4();
		let mut chunks = vec![chunk_with(b'd', 0, fuuid), chunk_with(b'd', 1, fuuid)];
		manager.put_chunks(&[1, 2], &mut chunks).unwrap();

		// bogus id in the middle does not stop the rest
		manager.delete_chunks(&[1, 123, 2], &[chunks[0].clone(), chunks[0].clone(), chunks[1].clone()]);
		assert!(!manager.has_chunks(&[1], &chunks[..1]));
		assert!(!manager.has_chunks(&[2], &chunks[1..]));
	}

	#[test]
	fn test_copy_and_move_batches() {
		let (_dir, manager, _rt) = test_manager(true);
		let fuuid = Uuid::new_v4();
		let mut srcs = vec![chunk_with(b'e', 0, fuuid)];
		manager.put_chunks(&[1], &mut srcs).unwrap();

		let mut dsts = vec![srcs[0].clone()];
		dsts[0].release_data();
		dsts[0].chunk_id = 10;
		manager.copy_chunks(&[1], &srcs, &mut dsts).unwrap();
		assert!(manager.has_chunks(&[1], &srcs));
		assert!(manager.has_chunks(&[1], &dsts));

		let mut moved = vec![srcs[0].clone()];
		moved[0].release_data();
		moved[0].chunk_id = 20;
		manager.move_chunks(&[1], &mut srcs, &mut moved).unwrap();
		assert!(!manager.has_chunks(&[1], &srcs));
		assert!(manager.has_chunks(&[1], &moved));
	}

	#[test]
	fn test_verify_compacts_corrupted_first() {
		let (dir, manager, _rt) = test_manager(true);
		let fuuid = Uuid::new_v4();
		let mut chunks = vec![
			chunk_with(b'f', 0, fuuid),
			chunk_with(b'g', 1, fuuid),
			chunk_with(b'h', 2, fuuid),
		];
		manager.put_chunks(&[1, 1, 2], &mut chunks).unwrap();

		// corrupt the middle chunk behind the manager's back
		std::fs::write(
			dir.path().join("c1").join(chunks[1].name()),
			vec![0u8; 1024],
		)
		.unwrap();

		let corrupted = manager.verify_chunks(&[1, 1, 2], &mut chunks).unwrap();
		assert_eq!(corrupted, 1);
		assert_eq!(chunks[0].chunk_id, 1);
	}

	#[test]
	fn test_verify_missing_container_is_an_error() {
		let (_dir, manager, _rt) = test_manager(true);
		let mut chunks = vec![chunk_with(b'i', 0, Uuid::new_v4())];
		assert!(manager.verify_chunks(&[123], &mut chunks).is_err());
	}

	#[test]
	fn test_encoded_chunks_xor() {
		let (_dir, manager, _rt) = test_manager(true);
		let fuuid = Uuid::new_v4();
		let mut chunks = vec![chunk_with(b'a', 0, fuuid), chunk_with(b'a', 1, fuuid)];
		manager.put_chunks(&[1, 2], &mut chunks).unwrap();

		let coded = manager
			.get_encoded_chunks(&[1, 2], &chunks, &[1, 1])
			.unwrap();
		assert_eq!(coded.size, 1024);
		assert!(coded.data.unwrap().iter().all(|&b| b == 0));
	}

	#[test]
	fn test_summaries_report_every_container() {
		let (_dir, manager, _rt) = test_manager(true);
		let summaries = manager.container_summaries();
		assert_eq!(summaries.len(), 2);
		assert_eq!(summaries[0].id, 1);
		assert_eq!(summaries[1].id, 2);
		assert_eq!(summaries[0].capacity, 1048576);
	}
}
