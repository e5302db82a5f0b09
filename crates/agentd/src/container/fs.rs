//! Filesystem container driver.
//!
//! Chunks are plain files named by their canonical chunk name inside the
//! container directory. Versioning is emulated: overwrites first rename the
//! existing file to `"{name}.{unix_ts}"` and record the timestamp as the
//! version token; a periodic sweeper deletes expired backups.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{
	mpsc::{sync_channel, RecvTimeoutError, SyncSender},
	Arc, Mutex,
};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use fs4::fs_std::FileExt;
use miette::{IntoDiagnostic, Result};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::{Container, UsageCell, UsageRefresher};
use crate::config::ContainerConfig;
use crate::error::{ContainerError, ContainerResult};
use coffer_proto::{md5_digest, Chunk};

/// Interval between backup sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Age after which a backup file is deleted.
const BACKUP_EXPIRY: Duration = Duration::from_secs(600);

pub struct FsContainer {
	id: i32,
	capacity: u64,
	dir: PathBuf,
	usage: Arc<UsageCell>,
	verify_checksum: bool,
	flush_on_close: bool,
	copy_block_size: u64,

	/// Per-path write serialization. The outer mutex only guards map
	/// lookups; the inner mutex is held for the duration of a write.
	locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,

	refresher: UsageRefresher,
	sweeper: Option<Sweeper>,
}

struct Sweeper {
	tx: SyncSender<()>,
	handle: Option<JoinHandle<()>>,
}

impl Drop for Sweeper {
	fn drop(&mut self) {
		let (tx, _) = sync_channel(1);
		drop(std::mem::replace(&mut self.tx, tx));
		if let Some(handle) = self.handle.take() {
			let _ = handle.join();
		}
	}
}

/// Whether a file name belongs to a backup rather than a current chunk.
///
/// Current chunk names contain only alphanumerics, `-`, and `_`; backups
/// carry a `.{token}` suffix.
fn is_backup_name(name: &str) -> bool {
	name.contains('.')
}

fn sweep_backups(dir: &Path) {
	// re-scan after any removal: the directory iterator may be invalidated
	// by concurrent deletions
	loop {
		let mut removed = false;
		for entry in WalkDir::new(dir).into_iter().flatten() {
			if !entry.file_type().is_file() {
				continue;
			}
			let name = entry.file_name().to_string_lossy();
			if !is_backup_name(&name) {
				continue;
			}
			let expired = entry
				.metadata()
				.ok()
				.and_then(|m| m.modified().ok())
				.and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
				.is_some_and(|age| age > BACKUP_EXPIRY);
			if !expired {
				continue;
			}
			debug!(path = %entry.path().display(), "removing expired chunk backup");
			if fs::remove_file(entry.path()).is_ok() {
				removed = true;
			}
		}
		if !removed {
			break;
		}
	}
}

fn directory_usage(dir: &Path) -> u64 {
	WalkDir::new(dir)
		.into_iter()
		.flatten()
		.filter(|e| e.file_type().is_file())
		.filter(|e| !is_backup_name(&e.file_name().to_string_lossy()))
		.filter_map(|e| e.metadata().ok())
		.map(|m| m.len())
		.sum()
}

impl FsContainer {
	pub fn new(
		config: &ContainerConfig,
		verify_checksum: bool,
		flush_on_close: bool,
		copy_block_size: u64,
	) -> Result<Self> {
		let dir = config
			.path
			.clone()
			.ok_or_else(|| miette::miette!("fs container {} has no path", config.id))?;
		fs::create_dir_all(&dir).into_diagnostic()?;

		let usage = UsageCell::new();
		usage.set(directory_usage(&dir));

		let refresher = {
			let usage = usage.clone();
			let dir = dir.clone();
			UsageRefresher::spawn(format!("fs-{}", config.id), move || {
				usage.set(directory_usage(&dir));
			})
		};

		let sweeper = {
			let dir = dir.clone();
			let id = config.id;
			let (tx, rx) = sync_channel::<()>(1);
			let handle = std::thread::Builder::new()
				.name(format!("fs-sweep-{id}"))
				.spawn(move || loop {
					match rx.recv_timeout(SWEEP_INTERVAL) {
						Err(RecvTimeoutError::Timeout) => sweep_backups(&dir),
						Ok(()) | Err(RecvTimeoutError::Disconnected) => {
							debug!(container = id, "backup sweeper stopped");
							break;
						}
					}
				})
				.into_diagnostic()?;
			Sweeper {
				tx,
				handle: Some(handle),
			}
		};

		debug!(
			id = config.id,
			dir = %dir.display(),
			capacity = config.capacity,
			"fs container ready"
		);

		Ok(Self {
			id: config.id,
			capacity: config.capacity,
			dir,
			usage,
			verify_checksum,
			flush_on_close,
			copy_block_size,
			locks: Mutex::new(HashMap::new()),
			refresher,
			sweeper: Some(sweeper),
		})
	}

	fn chunk_path(&self, chunk: &Chunk) -> PathBuf {
		self.dir.join(chunk.name())
	}

	fn backup_path(path: &Path, token: &str) -> PathBuf {
		let mut os = path.as_os_str().to_owned();
		os.push(".");
		os.push(token);
		PathBuf::from(os)
	}

	fn write_lock(&self, path: &Path) -> Arc<Mutex<()>> {
		let mut locks = self.locks.lock().expect("fs lock table poisoned");
		locks
			.entry(path.to_path_buf())
			.or_insert_with(|| Arc::new(Mutex::new(())))
			.clone()
	}

	fn read_file(&self, path: &Path) -> ContainerResult<Bytes> {
		let mut file = File::open(path)?;
		file.lock_shared()?;
		let mut buf = Vec::new();
		let read = file.read_to_end(&mut buf);
		let _ = FileExt::unlock(&file);
		read?;
		Ok(Bytes::from(buf))
	}

	fn write_file(&self, path: &Path, data: &[u8]) -> ContainerResult<()> {
		let mut file = File::create(path)?;
		file.lock_exclusive()?;
		let written = file.write_all(data).and_then(|()| {
			if self.flush_on_close {
				file.flush()?;
				file.sync_all()?;
			}
			Ok(())
		});
		let _ = FileExt::unlock(&file);
		written?;
		Ok(())
	}
}

impl Container for FsContainer {
	fn id(&self) -> i32 {
		self.id
	}

	fn type_tag(&self) -> u8 {
		crate::config::ContainerType::Fs.tag()
	}

	fn capacity(&self) -> u64 {
		self.capacity
	}

	fn usage(&self) -> u64 {
		self.usage.get()
	}

	fn put_chunk(&self, chunk: &mut Chunk) -> ContainerResult<()> {
		let data = chunk
			.data
			.clone()
			.ok_or_else(|| ContainerError::integrity("put without a payload"))?;
		let path = self.chunk_path(chunk);

		let lock = self.write_lock(&path);
		let _guard = lock.lock().expect("fs path lock poisoned");

		// back up any existing chunk so it stays revertible
		if path.is_file() {
			let token = jiff::Timestamp::now().as_second().to_string();
			let backup = Self::backup_path(&path, &token);
			fs::rename(&path, &backup).map_err(|err| {
				warn!(
					path = %path.display(),
					backup = %backup.display(),
					"failed to back up chunk before overwrite: {err}"
				);
				ContainerError::from(err)
			})?;
			chunk.set_version(&token);
		} else {
			chunk.version.clear();
		}

		self.write_file(&path, &data)?;

		let read_back = self.read_file(&path)?;
		let digest = md5_digest(&read_back);
		if self.verify_checksum && digest != chunk.md5 {
			return Err(ContainerError::integrity(format!(
				"checksum mismatch after write of {}",
				chunk.name()
			)));
		}
		chunk.md5 = digest;
		chunk.size = read_back.len() as i32;

		info!(chunk = %chunk.name(), path = %path.display(), size = chunk.size, "put chunk");
		Ok(())
	}

	fn get_chunk(&self, chunk: &mut Chunk, skip_verify: bool) -> ContainerResult<()> {
		let path = self.chunk_path(chunk);
		let data = self.read_file(&path)?;
		chunk.set_data(data);
		if !skip_verify && self.verify_checksum && !chunk.verify_md5() {
			chunk.release_data();
			return Err(ContainerError::integrity(format!(
				"checksum mismatch reading {}",
				chunk.name()
			)));
		}
		debug!(chunk = %chunk.name(), path = %path.display(), size = chunk.size, "get chunk");
		Ok(())
	}

	fn delete_chunk(&self, chunk: &Chunk) -> ContainerResult<()> {
		let path = self.chunk_path(chunk);
		match fs::remove_file(&path) {
			Ok(()) => {
				info!(chunk = %chunk.name(), path = %path.display(), "deleted chunk");
				Ok(())
			}
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
				warn!(chunk = %chunk.name(), "delete of absent chunk");
				Ok(())
			}
			Err(err) => Err(err.into()),
		}
	}

	fn copy_chunk(&self, src: &Chunk, dst: &mut Chunk) -> ContainerResult<()> {
		let spath = self.chunk_path(src);
		let dpath = self.chunk_path(dst);

		let lock = self.write_lock(&dpath);
		let _guard = lock.lock().expect("fs path lock poisoned");

		let mut sfile = File::open(&spath)?;
		sfile.lock_shared()?;
		let mut dfile = File::create(&dpath)?;
		dfile.lock_exclusive()?;

		let mut buf = vec![0u8; self.copy_block_size.max(1) as usize];
		let mut copied = 0u64;
		let result = loop {
			match sfile.read(&mut buf) {
				Ok(0) => break Ok(()),
				Ok(n) => {
					if let Err(err) = dfile.write_all(&buf[..n]) {
						break Err(err);
					}
					copied += n as u64;
				}
				Err(err) => break Err(err),
			}
		};
		let _ = FileExt::unlock(&sfile);
		let _ = FileExt::unlock(&dfile);
		drop(sfile);
		drop(dfile);

		if let Err(err) = result {
			let _ = fs::remove_file(&dpath);
			return Err(err.into());
		}
		if copied != src.size as u64 {
			let _ = fs::remove_file(&dpath);
			return Err(ContainerError::integrity(format!(
				"short copy of {} ({copied} of {} bytes)",
				src.name(),
				src.size
			)));
		}

		let read_back = match self.read_file(&dpath) {
			Ok(data) => data,
			Err(err) => {
				let _ = fs::remove_file(&dpath);
				return Err(err);
			}
		};
		let digest = md5_digest(&read_back);
		if self.verify_checksum && digest != dst.md5 {
			let _ = fs::remove_file(&dpath);
			return Err(ContainerError::integrity(format!(
				"checksum mismatch after copy to {}",
				dst.name()
			)));
		}
		dst.size = copied as i32;
		dst.md5 = digest;

		info!(src = %src.name(), dst = %dst.name(), size = dst.size, "copied chunk");
		Ok(())
	}

	fn move_chunk(&self, src: &Chunk, dst: &mut Chunk) -> ContainerResult<()> {
		let spath = self.chunk_path(src);
		let dpath = self.chunk_path(dst);

		let size = fs::metadata(&spath)?.len();
		fs::rename(&spath, &dpath)?;

		let read_back = self.read_file(&dpath);
		let verified = match &read_back {
			Ok(data) => !self.verify_checksum || md5_digest(data) == dst.md5,
			Err(_) => false,
		};
		if !verified {
			// put the chunk back under its source name
			let _ = fs::rename(&dpath, &spath);
			return Err(ContainerError::integrity(format!(
				"verification failed after move to {}",
				dst.name()
			)));
		}

		dst.size = size as i32;
		dst.md5 = md5_digest(&read_back.expect("verified read"));
		info!(src = %src.name(), dst = %dst.name(), size = dst.size, "moved chunk");
		Ok(())
	}

	fn has_chunk(&self, chunk: &Chunk) -> bool {
		let path = self.chunk_path(chunk);
		let size_matches = fs::metadata(&path)
			.map(|m| m.len() == chunk.size as u64)
			.unwrap_or(false);
		if !size_matches {
			return false;
		}
		if !self.verify_checksum {
			return true;
		}
		// reads the payload back, unlike the HEAD-based cloud drivers
		let mut probe = chunk.clone();
		probe.release_data();
		self.get_chunk(&mut probe, false).is_ok()
	}

	fn revert_chunk(&self, chunk: &Chunk) -> ContainerResult<()> {
		let path = self.chunk_path(chunk);
		let backup = Self::backup_path(&path, &chunk.version);
		let staging = Self::backup_path(&path, "0");

		// three-way rename: park the current file, promote the backup, then
		// drop the parked copy; restore on failure
		let _ = fs::rename(&path, &staging);
		match fs::rename(&backup, &path) {
			Ok(()) => {
				let _ = fs::remove_file(&staging);
				info!(chunk = %chunk.name(), version = %chunk.version, "reverted chunk");
				Ok(())
			}
			Err(err) => {
				let _ = fs::rename(&staging, &path);
				warn!(
					chunk = %chunk.name(),
					version = %chunk.version,
					"failed to revert chunk: {err}"
				);
				Err(err.into())
			}
		}
	}

	fn verify_chunk(&self, chunk: &Chunk) -> bool {
		let path = self.chunk_path(chunk);
		let matched = self
			.read_file(&path)
			.map(|data| md5_digest(&data) == chunk.md5)
			.unwrap_or(false);
		if !matched {
			warn!(chunk = %chunk.name(), path = %path.display(), "chunk failed verification");
		}
		matched
	}

	fn update_usage(&self) {
		self.usage.set(directory_usage(&self.dir));
	}

	fn bg_update_usage(&self) {
		self.refresher.schedule();
	}
}

impl Drop for FsContainer {
	fn drop(&mut self) {
		self.sweeper.take();
	}
}
