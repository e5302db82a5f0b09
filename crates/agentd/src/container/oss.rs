//! Aliyun OSS container driver.
//!
//! OSS speaks the S3 wire protocol, so this driver reuses the S3 client
//! against the configured OSS endpoint. Unlike the AWS driver it never
//! enables bucket versioning, records no version tokens, and cannot revert.

use std::sync::Arc;

use aws_sdk_s3::{primitives::ByteStream, Client};
use miette::{miette, Result};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::s3::{build_client, bucket_usage, create_bucket, etag_matches, etag_to_md5, map_sdk_error};
use super::{Container, UsageCell, UsageRefresher};
use crate::config::ContainerConfig;
use crate::error::{ContainerError, ContainerResult};
use coffer_proto::Chunk;

pub struct OssContainer {
	id: i32,
	capacity: u64,
	bucket: String,
	client: Client,
	rt: Handle,
	usage: Arc<UsageCell>,
	verify_checksum: bool,
	refresher: UsageRefresher,
}

impl OssContainer {
	pub fn new(config: &ContainerConfig, verify_checksum: bool, rt: Handle) -> Result<Self> {
		let bucket = config
			.bucket
			.clone()
			.ok_or_else(|| miette!("ali-oss container {} has no bucket", config.id))?;
		if config.endpoint.is_none() {
			return Err(miette!("ali-oss container {} has no endpoint", config.id));
		}
		let client = build_client(config);
		create_bucket(&rt, &client, config, &bucket)?;

		let usage = UsageCell::new();
		let refresher = {
			let usage = usage.clone();
			let client = client.clone();
			let bucket = bucket.clone();
			let rt = rt.clone();
			UsageRefresher::spawn(format!("oss-{}", config.id), move || {
				if let Some(total) = bucket_usage(&rt, &client, &bucket) {
					usage.set(total);
				}
			})
		};

		let container = Self {
			id: config.id,
			capacity: config.capacity,
			bucket,
			client,
			rt,
			usage,
			verify_checksum,
			refresher,
		};
		container.update_usage();
		debug!(
			id = container.id,
			bucket = %container.bucket,
			capacity = container.capacity,
			"ali oss container ready"
		);
		Ok(container)
	}

	fn head(&self, key: &str) -> ContainerResult<(i64, Option<String>)> {
		let resp = self
			.rt
			.block_on(self.client.head_object().bucket(&self.bucket).key(key).send())
			.map_err(map_sdk_error)?;
		Ok((
			resp.content_length().unwrap_or(-1),
			resp.e_tag().map(String::from),
		))
	}
}

impl Container for OssContainer {
	fn id(&self) -> i32 {
		self.id
	}

	fn type_tag(&self) -> u8 {
		crate::config::ContainerType::AliOss.tag()
	}

	fn capacity(&self) -> u64 {
		self.capacity
	}

	fn usage(&self) -> u64 {
		self.usage.get()
	}

	fn put_chunk(&self, chunk: &mut Chunk) -> ContainerResult<()> {
		let key = chunk.name();
		let data = chunk
			.data
			.clone()
			.ok_or_else(|| ContainerError::integrity("put without a payload"))?;

		let resp = self
			.rt
			.block_on(
				self.client
					.put_object()
					.bucket(&self.bucket)
					.key(&key)
					.body(ByteStream::from(data))
					.send(),
			)
			.map_err(map_sdk_error)?;

		let etag = resp.e_tag().unwrap_or_default().to_string();
		if self.verify_checksum && !etag_matches(&etag, &chunk.md5) {
			return Err(ContainerError::integrity(format!(
				"etag mismatch after put of {key}"
			)));
		}
		if let Some(md5) = etag_to_md5(&etag) {
			chunk.md5 = md5;
		}
		// no version token: OSS overwrites are not revertible
		chunk.version.clear();

		info!(chunk = %key, bucket = %self.bucket, "put chunk");
		Ok(())
	}

	fn get_chunk(&self, chunk: &mut Chunk, skip_verify: bool) -> ContainerResult<()> {
		let key = chunk.name();
		let resp = self
			.rt
			.block_on(
				self.client
					.get_object()
					.bucket(&self.bucket)
					.key(&key)
					.send(),
			)
			.map_err(map_sdk_error)?;
		let data = self
			.rt
			.block_on(resp.body.collect())
			.map_err(|err| ContainerError::Transport(format!("{err}")))?
			.into_bytes();
		chunk.set_data(data);
		if !skip_verify && self.verify_checksum && !chunk.verify_md5() {
			chunk.release_data();
			return Err(ContainerError::integrity(format!(
				"checksum mismatch reading {key}"
			)));
		}
		debug!(chunk = %key, bucket = %self.bucket, size = chunk.size, "get chunk");
		Ok(())
	}

	fn delete_chunk(&self, chunk: &Chunk) -> ContainerResult<()> {
		let key = chunk.name();
		match self.rt.block_on(
			self.client
				.delete_object()
				.bucket(&self.bucket)
				.key(&key)
				.send(),
		) {
			Ok(_) => {
				info!(chunk = %key, bucket = %self.bucket, "deleted chunk");
				Ok(())
			}
			Err(err) => match map_sdk_error(err) {
				ContainerError::NotFound => {
					warn!(chunk = %key, "delete of absent chunk");
					Ok(())
				}
				other => Err(other),
			},
		}
	}

	fn copy_chunk(&self, src: &Chunk, dst: &mut Chunk) -> ContainerResult<()> {
		let skey = src.name();
		let dkey = dst.name();

		self.rt
			.block_on(
				self.client
					.copy_object()
					.bucket(&self.bucket)
					.key(&dkey)
					.copy_source(format!("{}/{}", self.bucket, skey))
					.send(),
			)
			.map_err(map_sdk_error)?;

		let verified = match self.head(&dkey) {
			Ok((length, etag)) => {
				dst.size = length as i32;
				if let Some(md5) = etag.as_deref().and_then(etag_to_md5) {
					dst.md5 = md5;
				}
				!self.verify_checksum
					|| etag
						.as_deref()
						.map(|etag| etag_matches(etag, &src.md5))
						.unwrap_or(false)
			}
			Err(_) => false,
		};
		if !verified {
			let _ = self.delete_chunk(dst);
			return Err(ContainerError::integrity(format!(
				"verification failed after copy of {skey} to {dkey}"
			)));
		}

		info!(src = %skey, dst = %dkey, bucket = %self.bucket, "copied chunk");
		Ok(())
	}

	fn move_chunk(&self, src: &Chunk, dst: &mut Chunk) -> ContainerResult<()> {
		self.copy_chunk(src, dst)?;
		self.delete_chunk(src)
	}

	fn has_chunk(&self, chunk: &Chunk) -> bool {
		match self.head(&chunk.name()) {
			Ok((length, etag)) => {
				length == i64::from(chunk.size)
					&& (!self.verify_checksum
						|| etag
							.as_deref()
							.map(|etag| etag_matches(etag, &chunk.md5))
							.unwrap_or(false))
			}
			Err(_) => false,
		}
	}

	fn revert_chunk(&self, chunk: &Chunk) -> ContainerResult<()> {
		warn!(chunk = %chunk.name(), "revert is not supported on oss containers");
		Err(ContainerError::Unsupported)
	}

	fn verify_chunk(&self, chunk: &Chunk) -> bool {
		match self.head(&chunk.name()) {
			Ok((_, Some(etag))) => etag_matches(&etag, &chunk.md5),
			_ => false,
		}
	}

	fn update_usage(&self) {
		if let Some(total) = bucket_usage(&self.rt, &self.client, &self.bucket) {
			self.usage.set(total);
		}
	}

	fn bg_update_usage(&self) {
		self.refresher.schedule();
	}
}
