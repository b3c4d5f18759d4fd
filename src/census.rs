use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use dashmap::DashMap;

use crate::id::ActorKey;

/// Counters for one actor key.
#[derive(Debug, Default)]
struct Stats {
	activations: AtomicUsize,
	max_live: AtomicUsize,
	live: AtomicUsize,
}

impl Stats {
	fn snapshot(&self) -> KeyCensus {
		KeyCensus {
			activations: self.activations.load(Ordering::Relaxed),
			max_live: self.max_live.load(Ordering::Relaxed),
			live: self.live.load(Ordering::Relaxed),
		}
	}
}

/// Tracks how many instances of each key have been activated and how many
/// are live, so the single-instance guarantee can be checked from outside.
#[derive(Debug, Clone, Default)]
pub struct Census {
	counts: Arc<DashMap<ActorKey, Stats>>,
}

/// A point-in-time view of one key's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyCensus {
	pub activations: usize,
	pub max_live: usize,
	pub live: usize,
}

/// Held by a live instance; decrements the live count when dropped.
#[derive(Debug)]
pub struct LiveGuard {
	census: Census,
	key: ActorKey,
}

impl Census {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn enter(&self, key: &ActorKey) -> LiveGuard {
		let entry = self.counts.entry(key.clone()).or_default();
		entry.activations.fetch_add(1, Ordering::Relaxed);
		let live = entry.live.fetch_add(1, Ordering::Relaxed) + 1;
		entry.max_live.fetch_max(live, Ordering::Relaxed);
		metrics::gauge!("runy_live_instances").increment(1.0);

		LiveGuard {
			census: self.clone(),
			key: key.clone(),
		}
	}

	pub fn get(&self, key: &ActorKey) -> KeyCensus {
		self.counts
			.get(key)
			.map(|stats| stats.snapshot())
			.unwrap_or_default()
	}

	pub fn total_live(&self) -> usize {
		self.counts
			.iter()
			.map(|entry| entry.value().live.load(Ordering::Relaxed))
			.sum()
	}

	pub fn report(&self) -> CensusReport {
		let by_key = self
			.counts
			.iter()
			.map(|entry| (entry.key().to_string(), entry.value().snapshot()))
			.collect();
		CensusReport { by_key }
	}
}

impl Drop for LiveGuard {
	fn drop(&mut self) {
		if let Some(entry) = self.census.counts.get(&self.key) {
			entry.live.fetch_sub(1, Ordering::Relaxed);
		}
		metrics::gauge!("runy_live_instances").decrement(1.0);
	}
}

/// Sorted table of every key seen by the runtime.
#[derive(Debug, Clone)]
pub struct CensusReport {
	by_key: BTreeMap<String, KeyCensus>,
}

impl fmt::Display for CensusReport {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name_width = self.by_key.keys().map(|k| k.len()).max().unwrap_or(0).max(3);

		writeln!(
			f,
			"{:<name_width$} {:>12} {:>12} {:>12}",
			"key", "activations", "max_live", "live"
		)?;
		for (key, stats) in &self.by_key {
			writeln!(
				f,
				"{key:<name_width$} {:>12} {:>12} {:>12}",
				stats.activations, stats.max_live, stats.live
			)?;
		}
		Ok(())
	}
}
