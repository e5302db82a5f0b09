//! Container drivers: typed storage back-ends executing chunk operations.

use std::sync::{
	atomic::{AtomicU64, Ordering},
	mpsc::{sync_channel, Receiver, SyncSender, TrySendError},
	Arc,
};
use std::thread::JoinHandle;

use tracing::debug;

use crate::error::ContainerResult;
use coffer_proto::Chunk;

mod azure;
mod fs;
mod oss;
mod s3;

pub use azure::AzureContainer;
pub use fs::FsContainer;
pub use oss::OssContainer;
pub use s3::AwsContainer;

/// One storage back-end owned by this agent.
///
/// All drivers share the same operation set; per-back-end semantics (native
/// versioning, server-side copy, digest sources) are documented on each
/// implementation. Drivers do not retry: transient failures surface to the
/// proxy, which owns retry policy.
pub trait Container: Send + Sync {
	fn id(&self) -> i32;
	fn type_tag(&self) -> u8;
	fn capacity(&self) -> u64;

	/// Cached usage in bytes, refreshed by the background updater.
	fn usage(&self) -> u64;

	/// Store or overwrite a chunk under its canonical name.
	///
	/// Overwrites record a version token in `chunk.version` sufficient for a
	/// later revert, where the back-end supports it. On success the chunk's
	/// MD5 is refreshed from the authoritative back-end digest when the
	/// back-end returns one.
	fn put_chunk(&self, chunk: &mut Chunk) -> ContainerResult<()>;

	/// Fetch a chunk's payload and size.
	fn get_chunk(&self, chunk: &mut Chunk, skip_verify: bool) -> ContainerResult<()>;

	/// Remove a chunk. Idempotent: removing an absent chunk succeeds.
	fn delete_chunk(&self, chunk: &Chunk) -> ContainerResult<()>;

	/// Copy a chunk within this container, verifying the destination.
	fn copy_chunk(&self, src: &Chunk, dst: &mut Chunk) -> ContainerResult<()>;

	/// Move a chunk within this container.
	fn move_chunk(&self, src: &Chunk, dst: &mut Chunk) -> ContainerResult<()>;

	/// Whether a chunk exists with the expected size (and digest, when
	/// verification is enabled).
	fn has_chunk(&self, chunk: &Chunk) -> bool;

	/// Restore the previously recorded version of a chunk.
	fn revert_chunk(&self, chunk: &Chunk) -> ContainerResult<()>;

	/// Check a chunk's digest against the back-end.
	fn verify_chunk(&self, chunk: &Chunk) -> bool;

	/// Recompute the cached usage now. Safe to call from any thread.
	fn update_usage(&self);

	/// Schedule a usage refresh on the background updater without blocking.
	fn bg_update_usage(&self);
}

/// Cached usage counter shared between a driver and its refresher thread.
#[derive(Debug, Default)]
pub(crate) struct UsageCell(AtomicU64);

impl UsageCell {
	pub fn new() -> Arc<Self> {
		Arc::new(Self(AtomicU64::new(0)))
	}

	pub fn get(&self) -> u64 {
		self.0.load(Ordering::Relaxed)
	}

	pub fn set(&self, value: u64) {
		self.0.store(value, Ordering::Relaxed);
	}
}

/// Background usage updater with a drop-latest signal channel.
///
/// `schedule` never blocks: when a refresh is already pending the new signal
/// is dropped. The worker exits when the refresher is dropped.
pub(crate) struct UsageRefresher {
	tx: SyncSender<()>,
	handle: Option<JoinHandle<()>>,
}

impl UsageRefresher {
	pub fn spawn<F>(name: String, refresh: F) -> Self
	where
		F: Fn() + Send + 'static,
	{
		let (tx, rx): (SyncSender<()>, Receiver<()>) = sync_channel(1);
		let handle = std::thread::Builder::new()
			.name(format!("usage-{name}"))
			.spawn(move || {
				while rx.recv().is_ok() {
					refresh();
				}
				debug!(container = %name, "usage refresher stopped");
			})
			.expect("failed to spawn usage refresher thread");
		Self {
			tx,
			handle: Some(handle),
		}
	}

	pub fn schedule(&self) {
		match self.tx.try_send(()) {
			Ok(()) | Err(TrySendError::Full(())) => {}
			Err(TrySendError::Disconnected(())) => {
				debug!("usage refresher is gone, skipping refresh");
			}
		}
	}
}

impl Drop for UsageRefresher {
	fn drop(&mut self) {
		// disconnect the channel so the worker exits its recv loop
		let (tx, _) = sync_channel(1);
		drop(std::mem::replace(&mut self.tx, tx));
		if let Some(handle) = self.handle.take() {
			let _ = handle.join();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::AtomicUsize;
	use std::time::Duration;

	#[test]
	fn test_usage_cell() {
		let cell = UsageCell::new();
		assert_eq!(cell.get(), 0);
		cell.set(42);
		assert_eq!(cell.get(), 42);
	}

	#[test]
	fn test_refresher_runs_and_stops() {
		let count = Arc::new(AtomicUsize::new(0));
		let seen = count.clone();
		let refresher = UsageRefresher::spawn("test".into(), move || {
			seen.fetch_add(1, Ordering::SeqCst);
		});

		refresher.schedule();
		let deadline = std::time::Instant::now() + Duration::from_secs(5);
		while count.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
			std::thread::sleep(Duration::from_millis(10));
		}
		assert!(count.load(Ordering::SeqCst) >= 1);

		// dropping joins the worker
		drop(refresher);
	}

	#[test]
	fn test_schedule_never_blocks() {
		let refresher = UsageRefresher::spawn("busy".into(), move || {
			std::thread::sleep(Duration::from_millis(50));
		});
		for _ in 0..100 {
			refresher.schedule();
		}
	}
}
