//! AWS S3 container driver.
//!
//! Chunks are objects keyed by their canonical name. Bucket versioning
//! provides revert: every put records the new VersionId, and revert deletes
//! that specific version so the previous one becomes current again. The
//! bucket is created on startup along with a lifecycle rule that expires
//! noncurrent versions after a day.

use std::sync::Arc;

use aws_credential_types::Credentials;
use aws_sdk_s3::{
	config::{BehaviorVersion, Region},
	error::{ProvideErrorMetadata, SdkError},
	primitives::ByteStream,
	types::{
		BucketLifecycleConfiguration, BucketLocationConstraint, BucketVersioningStatus,
		CreateBucketConfiguration, ExpirationStatus, LifecycleRule, LifecycleRuleFilter,
		NoncurrentVersionExpiration, VersioningConfiguration,
	},
	Client,
};
use miette::{miette, Result};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::{Container, UsageCell, UsageRefresher};
use crate::config::ContainerConfig;
use crate::error::{ContainerError, ContainerResult};
use coffer_proto::Chunk;

pub struct AwsContainer {
	id: i32,
	capacity: u64,
	bucket: String,
	client: Client,
	rt: Handle,
	usage: Arc<UsageCell>,
	verify_checksum: bool,
	refresher: UsageRefresher,
}

pub(super) fn map_sdk_error<E, R>(err: SdkError<E, R>) -> ContainerError
where
	E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
	match &err {
		SdkError::ServiceError(ctx) => {
			let meta = ctx.err().meta();
			let code = meta.code().unwrap_or("unknown").to_string();
			if matches!(code.as_str(), "NoSuchKey" | "NotFound" | "404") {
				ContainerError::NotFound
			} else {
				ContainerError::Backend {
					code,
					message: meta.message().unwrap_or("no message").to_string(),
				}
			}
		}
		SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => {
			ContainerError::Transport(format!("{err}"))
		}
		_ => ContainerError::Transport(format!("{err}")),
	}
}

/// Compare an S3 etag (quoted hex MD5 for single-part objects) against a
/// binary digest.
pub(super) fn etag_matches(etag: &str, md5: &[u8; 16]) -> bool {
	etag.trim_matches('"').eq_ignore_ascii_case(&hex::encode(md5))
}

/// Parse an S3 etag back into a binary MD5.
pub(super) fn etag_to_md5(etag: &str) -> Option<[u8; 16]> {
	let raw = hex::decode(etag.trim_matches('"')).ok()?;
	raw.try_into().ok()
}

pub(super) fn build_client(config: &ContainerConfig) -> Client {
	let creds = Credentials::from_keys(
		config.key_id.clone().unwrap_or_default(),
		config.key.clone().unwrap_or_default(),
		None,
	);
	let region = config
		.region
		.clone()
		.unwrap_or_else(|| "us-east-1".to_string());

	let mut builder = aws_sdk_s3::config::Builder::new()
		.behavior_version(BehaviorVersion::latest())
		.region(Region::new(region))
		.credentials_provider(creds);
	if let Some(endpoint) = &config.endpoint {
		builder = builder.endpoint_url(endpoint).force_path_style(true);
	}
	if let Some(proxy) = &config.http_proxy {
		// the SDK's default connector has no per-client proxy support
		warn!(
			container = config.id,
			proxy_ip = %proxy.ip,
			proxy_port = proxy.port,
			"http proxy configured but not supported by the s3 driver, ignoring"
		);
	}
	Client::from_conf(builder.build())
}

pub(super) fn create_bucket(
	rt: &Handle,
	client: &Client,
	config: &ContainerConfig,
	bucket: &str,
) -> Result<()> {
	let mut req = client.create_bucket().bucket(bucket);
	if let Some(region) = config.region.as_deref() {
		if region != "us-east-1" {
			req = req.create_bucket_configuration(
				CreateBucketConfiguration::builder()
					.location_constraint(BucketLocationConstraint::from(region))
					.build(),
			);
		}
	}
	match rt.block_on(req.send()) {
		Ok(_) => {
			debug!(container = config.id, bucket, "created bucket");
			Ok(())
		}
		Err(err) => {
			let tolerable = err.as_service_error().is_some_and(|e| {
				e.is_bucket_already_exists() || e.is_bucket_already_owned_by_you()
			});
			if tolerable {
				Ok(())
			} else {
				Err(miette!(
					"failed to create bucket {bucket} for container {}: {}",
					config.id,
					map_sdk_error(err)
				))
			}
		}
	}
}

impl AwsContainer {
	pub fn new(config: &ContainerConfig, verify_checksum: bool, rt: Handle) -> Result<Self> {
		let bucket = config
			.bucket
			.clone()
			.ok_or_else(|| miette!("aws-s3 container {} has no bucket", config.id))?;
		let client = build_client(config);

		create_bucket(&rt, &client, config, &bucket)?;
		Self::setup_lifecycle(&rt, &client, &bucket);
		Self::setup_versioning(&rt, &client, &bucket);

		let usage = UsageCell::new();
		let refresher = {
			let usage = usage.clone();
			let client = client.clone();
			let bucket = bucket.clone();
			let rt = rt.clone();
			UsageRefresher::spawn(format!("s3-{}", config.id), move || {
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
			"aws s3 container ready"
		);
		Ok(container)
	}

	fn setup_lifecycle(rt: &Handle, client: &Client, bucket: &str) {
		let rule = LifecycleRule::builder()
			.id("expire noncurrent chunk versions after a day")
			.filter(LifecycleRuleFilter::builder().prefix("").build())
			.noncurrent_version_expiration(
				NoncurrentVersionExpiration::builder().noncurrent_days(1).build(),
			)
			.status(ExpirationStatus::Enabled)
			.build();
		let rule = match rule {
			Ok(rule) => rule,
			Err(err) => {
				warn!(bucket, "failed to build lifecycle rule: {err}");
				return;
			}
		};
		let lifecycle = match BucketLifecycleConfiguration::builder().rules(rule).build() {
			Ok(lifecycle) => lifecycle,
			Err(err) => {
				warn!(bucket, "failed to build lifecycle configuration: {err}");
				return;
			}
		};
		let result = rt.block_on(
			client
				.put_bucket_lifecycle_configuration()
				.bucket(bucket)
				.lifecycle_configuration(lifecycle)
				.send(),
		);
		if let Err(err) = result {
			warn!(bucket, "failed to enable lifecycle rules: {}", map_sdk_error(err));
		}
	}

	fn setup_versioning(rt: &Handle, client: &Client, bucket: &str) {
		let result = rt.block_on(
			client
				.put_bucket_versioning()
				.bucket(bucket)
				.versioning_configuration(
					VersioningConfiguration::builder()
						.status(BucketVersioningStatus::Enabled)
						.build(),
				)
				.send(),
		);
		if let Err(err) = result {
			warn!(bucket, "failed to enable versioning: {}", map_sdk_error(err));
		}
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

pub(super) fn bucket_usage(rt: &Handle, client: &Client, bucket: &str) -> Option<u64> {
	let mut total = 0u64;
	let mut token: Option<String> = None;
	loop {
		let mut req = client.list_objects_v2().bucket(bucket);
		if let Some(t) = &token {
			req = req.continuation_token(t);
		}
		let resp = match rt.block_on(req.send()) {
			Ok(resp) => resp,
			Err(err) => {
				warn!(bucket, "failed to list objects for usage: {}", map_sdk_error(err));
				return None;
			}
		};
		for obj in resp.contents() {
			total += obj.size().unwrap_or(0).max(0) as u64;
		}
		if resp.is_truncated() == Some(true) {
			token = resp.next_continuation_token().map(String::from);
			if token.is_none() {
				break;
			}
		} else {
			break;
		}
	}
	Some(total)
}

impl Container for AwsContainer {
	fn id(&self) -> i32 {
		self.id
	}

	fn type_tag(&self) -> u8 {
		crate::config::ContainerType::AwsS3.tag()
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
				"etag mismatch after put of {key} ({etag} vs {})",
				hex::encode(chunk.md5)
			)));
		}

		// the new VersionId is what a revert will delete
		if let Some(version) = resp.version_id() {
			chunk.set_version(version);
		} else {
			chunk.version.clear();
		}
		if let Some(md5) = etag_to_md5(&etag) {
			chunk.md5 = md5;
		}

		info!(chunk = %key, bucket = %self.bucket, version = %chunk.version, "put chunk");
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

		// verify the destination before declaring success
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
		let key = chunk.name();
		// deleting the recorded version makes the previous one current
		self.rt
			.block_on(
				self.client
					.delete_object()
					.bucket(&self.bucket)
					.key(&key)
					.version_id(&chunk.version)
					.send(),
			)
			.map_err(map_sdk_error)?;
		info!(chunk = %key, version = %chunk.version, "reverted chunk");
		Ok(())
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

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_etag_matches() {
		let md5 = coffer_proto::md5_digest(b"hello");
		let etag = format!("\"{}\"", hex::encode(md5));
		assert!(etag_matches(&etag, &md5));
		assert!(etag_matches(&hex::encode(md5).to_uppercase(), &md5));
		assert!(!etag_matches("\"deadbeef\"", &md5));
	}

	#[test]
	fn test_etag_to_md5() {
		let md5 = coffer_proto::md5_digest(b"etag");
		let etag = format!("\"{}\"", hex::encode(md5));
		assert_eq!(etag_to_md5(&etag), Some(md5));
		assert_eq!(etag_to_md5("\"not-hex\""), None);
		// multipart etags carry a part suffix and do not parse
		assert_eq!(etag_to_md5("\"abc123-2\""), None);
	}
}
