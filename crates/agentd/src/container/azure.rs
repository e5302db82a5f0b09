//! Azure Blob container driver.
//!
//! Chunks are block blobs. Revert relies on snapshots: a put first snapshots
//! the existing blob and records the snapshot timestamp as the version
//! token, and revert copies that snapshot back over the current blob. The
//! authoritative digest is the blob's Content-MD5 property.

use std::sync::Arc;

use azure_core::{error::Error as AzureError, AppendToUrlQuery, StatusCode, Url};
use azure_storage::{ConsistencyMD5, StorageCredentials};
use azure_storage_blobs::prelude::*;
use futures::StreamExt;
use miette::{miette, Result};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::{Container, UsageCell, UsageRefresher};
use crate::config::ContainerConfig;
use crate::error::{ContainerError, ContainerResult};
use coffer_proto::Chunk;

pub struct AzureContainer {
	id: i32,
	capacity: u64,
	container_client: ContainerClient,
	rt: Handle,
	usage: Arc<UsageCell>,
	verify_checksum: bool,
	refresher: UsageRefresher,
}

fn map_azure_error(err: AzureError) -> ContainerError {
	if let Some(http) = err.as_http_error() {
		if http.status() == StatusCode::NotFound {
			ContainerError::NotFound
		} else {
			ContainerError::Backend {
				code: http
					.error_code()
					.unwrap_or("unknown")
					.to_string(),
				message: format!("{http}"),
			}
		}
	} else {
		ContainerError::Transport(format!("{err}"))
	}
}

fn consistency_to_md5(digest: &ConsistencyMD5) -> Option<[u8; 16]> {
	let bytes: &[u8] = digest.bytes().as_ref();
	bytes.try_into().ok()
}

fn snapshot_token(snapshot: &Snapshot) -> String {
	let mut url = Url::parse("x-snapshot://token").expect("static url parses");
	snapshot.append_to_url_query(&mut url);
	url.query_pairs()
		.find(|(key, _)| key == "snapshot")
		.map(|(_, value)| value.into_owned())
		.unwrap_or_default()
}

fn container_usage(rt: &Handle, client: &ContainerClient) -> Option<u64> {
	let result = rt.block_on(async {
		let mut stream = client.list_blobs().into_stream();
		let mut total = 0u64;
		while let Some(resp) = stream.next().await {
			let resp = resp?;
			for blob in resp.blobs.blobs() {
				total += blob.properties.content_length;
			}
		}
		Ok::<u64, AzureError>(total)
	});
	match result {
		Ok(total) => Some(total),
		Err(err) => {
			warn!("failed to list blobs for usage: {err}");
			None
		}
	}
}

impl AzureContainer {
	pub fn new(config: &ContainerConfig, verify_checksum: bool, rt: Handle) -> Result<Self> {
		let bucket = config
			.bucket
			.clone()
			.ok_or_else(|| miette!("azure-blob container {} has no bucket", config.id))?;
		let account = config
			.account
			.clone()
			.ok_or_else(|| miette!("azure-blob container {} has no account", config.id))?;
		let key = config
			.key
			.clone()
			.ok_or_else(|| miette!("azure-blob container {} has no key", config.id))?;

		if let Some(proxy) = &config.http_proxy {
			warn!(
				container = config.id,
				proxy_ip = %proxy.ip,
				proxy_port = proxy.port,
				"http proxy configured but not supported by the azure driver, ignoring"
			);
		}

		let credentials = StorageCredentials::access_key(account.clone(), key);
		let container_client =
			BlobServiceClient::new(account, credentials).container_client(&bucket);

		// create the blob container unless it is already there
		if let Err(err) = rt.block_on(container_client.create().into_future()) {
			let exists = err
				.as_http_error()
				.is_some_and(|http| http.status() == StatusCode::Conflict);
			if !exists {
				return Err(miette!(
					"failed to create blob container {bucket} for container {}: {err}",
					config.id
				));
			}
		}

		let usage = UsageCell::new();
		let refresher = {
			let usage = usage.clone();
			let client = container_client.clone();
			let rt = rt.clone();
			UsageRefresher::spawn(format!("azure-{}", config.id), move || {
				if let Some(total) = container_usage(&rt, &client) {
					usage.set(total);
				}
			})
		};

		let container = Self {
			id: config.id,
			capacity: config.capacity,
			container_client,
			rt,
			usage,
			verify_checksum,
			refresher,
		};
		container.update_usage();
		debug!(
			id = container.id,
			container = %bucket,
			capacity = container.capacity,
			"azure blob container ready"
		);
		Ok(container)
	}

	fn properties(&self, chunk: &Chunk) -> ContainerResult<(u64, Option<[u8; 16]>)> {
		let client = self.container_client.blob_client(chunk.name());
		let resp = self
			.rt
			.block_on(client.get_properties().into_future())
			.map_err(map_azure_error)?;
		let properties = resp.blob.properties;
		Ok((
			properties.content_length,
			properties.content_md5.as_ref().and_then(consistency_to_md5),
		))
	}
}

impl Container for AzureContainer {
	fn id(&self) -> i32 {
		self.id
	}

	fn type_tag(&self) -> u8 {
		crate::config::ContainerType::AzureBlob.tag()
	}

	fn capacity(&self) -> u64 {
		self.capacity
	}

	fn usage(&self) -> u64 {
		self.usage.get()
	}

	fn put_chunk(&self, chunk: &mut Chunk) -> ContainerResult<()> {
		let name = chunk.name();
		let data = chunk
			.data
			.clone()
			.ok_or_else(|| ContainerError::integrity("put without a payload"))?;
		let client = self.container_client.blob_client(&name);

		// snapshot the existing blob so the overwrite stays revertible
		match self.rt.block_on(client.snapshot().into_future()) {
			Ok(resp) => chunk.set_version(&snapshot_token(&resp.snapshot)),
			Err(err) => {
				if err
					.as_http_error()
					.is_some_and(|http| http.status() == StatusCode::NotFound)
				{
					chunk.version.clear();
				} else {
					warn!(chunk = %name, "failed to snapshot blob before put: {err}");
					chunk.version.clear();
				}
			}
		}

		let resp = self
			.rt
			.block_on(client.put_block_blob(data).into_future())
			.map_err(map_azure_error)?;

		if let Some(md5) = resp.content_md5.as_ref().and_then(consistency_to_md5) {
			if self.verify_checksum && md5 != chunk.md5 {
				return Err(ContainerError::integrity(format!(
					"content-md5 mismatch after put of {name}"
				)));
			}
			chunk.md5 = md5;
		}

		info!(chunk = %name, version = %chunk.version, "put chunk");
		Ok(())
	}

	fn get_chunk(&self, chunk: &mut Chunk, skip_verify: bool) -> ContainerResult<()> {
		let name = chunk.name();
		let client = self.container_client.blob_client(&name);
		let data = self
			.rt
			.block_on(client.get_content())
			.map_err(map_azure_error)?;
		chunk.set_data(data.into());
		if !skip_verify && self.verify_checksum && !chunk.verify_md5() {
			chunk.release_data();
			return Err(ContainerError::integrity(format!(
				"checksum mismatch reading {name}"
			)));
		}
		debug!(chunk = %name, size = chunk.size, "get chunk");
		Ok(())
	}

	fn delete_chunk(&self, chunk: &Chunk) -> ContainerResult<()> {
		let name = chunk.name();
		let client = self.container_client.blob_client(&name);
		let result = self.rt.block_on(
			client
				.delete()
				.delete_snapshots_method(DeleteSnapshotsMethod::Include)
				.into_future(),
		);
		match result {
			Ok(_) => {
				info!(chunk = %name, "deleted chunk");
				Ok(())
			}
			Err(err) => match map_azure_error(err) {
				ContainerError::NotFound => {
					warn!(chunk = %name, "delete of absent chunk");
					Ok(())
				}
				other => Err(other),
			},
		}
	}

	fn copy_chunk(&self, src: &Chunk, dst: &mut Chunk) -> ContainerResult<()> {
		let sname = src.name();
		let dname = dst.name();
		let src_client = self.container_client.blob_client(&sname);
		let dst_client = self.container_client.blob_client(&dname);

		let src_url = src_client.url().map_err(map_azure_error)?;
		self.rt
			.block_on(dst_client.copy(src_url).into_future())
			.map_err(map_azure_error)?;

		let (length, md5) = match self.properties(dst) {
			Ok(props) => props,
			Err(err) => {
				let _ = self.delete_chunk(dst);
				return Err(err);
			}
		};
		dst.size = length as i32;
		if let Some(md5) = md5 {
			dst.md5 = md5;
		}
		if self.verify_checksum && md5 != Some(src.md5) {
			let _ = self.delete_chunk(dst);
			return Err(ContainerError::integrity(format!(
				"verification failed after copy of {sname} to {dname}"
			)));
		}

		info!(src = %sname, dst = %dname, size = dst.size, "copied chunk");
		Ok(())
	}

	fn move_chunk(&self, src: &Chunk, dst: &mut Chunk) -> ContainerResult<()> {
		self.copy_chunk(src, dst)?;
		self.delete_chunk(src)
	}

	fn has_chunk(&self, chunk: &Chunk) -> bool {
		match self.properties(chunk) {
			Ok((length, md5)) => {
				length == chunk.size as u64
					&& (!self.verify_checksum || md5 == Some(chunk.md5))
			}
			Err(_) => false,
		}
	}

	fn revert_chunk(&self, chunk: &Chunk) -> ContainerResult<()> {
		let name = chunk.name();
		let client = self.container_client.blob_client(&name);

		// copy the recorded snapshot back over the current blob
		let mut snapshot_url = client.url().map_err(map_azure_error)?;
		snapshot_url
			.query_pairs_mut()
			.append_pair("snapshot", &chunk.version);
		self.rt
			.block_on(client.copy(snapshot_url).into_future())
			.map_err(map_azure_error)?;

		info!(chunk = %name, version = %chunk.version, "reverted chunk");
		Ok(())
	}

	fn verify_chunk(&self, chunk: &Chunk) -> bool {
		match self.properties(chunk) {
			Ok((_, md5)) => md5 == Some(chunk.md5),
			Err(_) => false,
		}
	}

	fn update_usage(&self) {
		if let Some(total) = container_usage(&self.rt, &self.container_client) {
			self.usage.set(total);
		}
	}

	fn bg_update_usage(&self) {
		self.refresher.schedule();
	}
}
