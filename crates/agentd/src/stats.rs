//! Operation and traffic counters, shared by all workers.

use std::sync::Mutex;

use tracing::info;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
	pub traffic_in: u64,
	pub traffic_out: u64,
	pub chunk_in: u64,
	pub chunk_out: u64,
	pub ops_ok: u64,
	pub ops_fail: u64,
}

/// Counters behind a single mutex; every increment is one short critical
/// section, contention is expected to be low.
#[derive(Debug, Default)]
pub struct Stats(Mutex<Snapshot>);

impl Stats {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add_ingress(&self, bytes: u64) {
		self.0.lock().expect("stats poisoned").traffic_in += bytes;
	}

	pub fn add_egress(&self, bytes: u64) {
		self.0.lock().expect("stats poisoned").traffic_out += bytes;
	}

	pub fn add_ingress_chunk(&self, bytes: u64) {
		self.0.lock().expect("stats poisoned").chunk_in += bytes;
	}

	pub fn add_egress_chunk(&self, bytes: u64) {
		self.0.lock().expect("stats poisoned").chunk_out += bytes;
	}

	pub fn record_op(&self, success: bool) {
		let mut counters = self.0.lock().expect("stats poisoned");
		if success {
			counters.ops_ok += 1;
		} else {
			counters.ops_fail += 1;
		}
	}

	pub fn snapshot(&self) -> Snapshot {
		*self.0.lock().expect("stats poisoned")
	}

	pub fn log_summary(&self) {
		let snapshot = self.snapshot();
		info!(
			traffic_in = snapshot.traffic_in,
			traffic_out = snapshot.traffic_out,
			chunk_in = snapshot.chunk_in,
			chunk_out = snapshot.chunk_out,
			ops_ok = snapshot.ops_ok,
			ops_fail = snapshot.ops_fail,
			"agent statistics"
		);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_counters_accumulate() {
		let stats = Stats::new();
		stats.add_ingress(100);
		stats.add_ingress(50);
		stats.add_egress(10);
		stats.add_ingress_chunk(64);
		stats.add_egress_chunk(32);
		stats.record_op(true);
		stats.record_op(true);
		stats.record_op(false);

		let snapshot = stats.snapshot();
		assert_eq!(snapshot.traffic_in, 150);
		assert_eq!(snapshot.traffic_out, 10);
		assert_eq!(snapshot.chunk_in, 64);
		assert_eq!(snapshot.chunk_out, 32);
		assert_eq!(snapshot.ops_ok, 2);
		assert_eq!(snapshot.ops_fail, 1);
	}
}
