use std::collections::BTreeMap;
use std::sync::Arc;

use futures::FutureExt as _;
use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::driver::Driver;
use crate::driver::DriverError;
use crate::driver::Revision;
use crate::driver::StoredState;
use crate::id::ActorKey;

/// Operation counters, mostly useful for asserting on runtime behavior in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverStats {
	pub loads: u64,
	pub saves: u64,
	pub conflicts: u64,
	pub removes: u64,
}

#[derive(Debug, Default)]
struct Faults {
	failing_loads: usize,
	fail_next_save: bool,
	conflict_next_save: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
	entries: BTreeMap<ActorKey, StoredState>,
	faults: Faults,
	stats: DriverStats,
}

/// Reference driver keeping everything in one mutex-guarded map.
///
/// Nothing survives the process. Clones share the same storage, so a test can
/// keep a handle while the runtime owns another, and can start a second
/// runtime on the same data to emulate a restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryDriver {
	state: Arc<Mutex<MemoryState>>,
}

impl MemoryDriver {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.state.lock().entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.state.lock().entries.is_empty()
	}

	pub fn stats(&self) -> DriverStats {
		self.state.lock().stats
	}

	/// Current blob and revision of `key`, bypassing fault injection.
	pub fn raw_get(&self, key: &ActorKey) -> Option<StoredState> {
		self.state.lock().entries.get(key).cloned()
	}

	/// Write `blob` unconditionally, as a competing writer would.
	pub fn overwrite(&self, key: &ActorKey, blob: Vec<u8>) -> Revision {
		let mut state = self.state.lock();
		let revision = state
			.entries
			.get(key)
			.map(|stored| stored.revision)
			.unwrap_or(Revision::NONE)
			.next();
		state.entries.insert(key.clone(), StoredState { blob, revision });
		revision
	}

	/// Make the next `count` loads fail with an I/O error.
	pub fn fail_next_loads(&self, count: usize) {
		self.state.lock().faults.failing_loads = count;
	}

	/// Make the next save fail with an I/O error without writing.
	pub fn fail_next_save(&self) {
		self.state.lock().faults.fail_next_save = true;
	}

	/// Make the next save report a conflict without writing.
	pub fn force_conflict_next_save(&self) {
		self.state.lock().faults.conflict_next_save = true;
	}

	fn load_now(&self, key: &ActorKey) -> Result<Option<StoredState>, DriverError> {
		let mut state = self.state.lock();
		state.stats.loads += 1;
		if state.faults.failing_loads > 0 {
			state.faults.failing_loads -= 1;
			return Err(DriverError::Io("injected load failure".into()));
		}
		Ok(state.entries.get(key).cloned())
	}

	fn save_now(
		&self,
		key: &ActorKey,
		blob: Vec<u8>,
		expected: Revision,
	) -> Result<Revision, DriverError> {
		let mut state = self.state.lock();
		state.stats.saves += 1;

		if std::mem::take(&mut state.faults.fail_next_save) {
			return Err(DriverError::Io("injected save failure".into()));
		}

		let actual = state
			.entries
			.get(key)
			.map(|stored| stored.revision)
			.unwrap_or(Revision::NONE);

		if std::mem::take(&mut state.faults.conflict_next_save) {
			state.stats.conflicts += 1;
			return Err(DriverError::Conflict {
				expected,
				actual: actual.next(),
			});
		}

		if actual != expected {
			state.stats.conflicts += 1;
			tracing::warn!(%key, %expected, %actual, "Rejected stale save");
			return Err(DriverError::Conflict { expected, actual });
		}

		let revision = expected.next();
		state.entries.insert(key.clone(), StoredState { blob, revision });
		tracing::trace!(%key, %revision, "Saved actor state");
		Ok(revision)
	}
}

impl Driver for MemoryDriver {
	fn name(&self) -> &'static str {
		"memory"
	}

	fn load<'a>(
		&'a self,
		key: &'a ActorKey,
	) -> BoxFuture<'a, Result<Option<StoredState>, DriverError>> {
		futures::future::ready(self.load_now(key)).boxed()
	}

	fn save<'a>(
		&'a self,
		key: &'a ActorKey,
		blob: Vec<u8>,
		expected: Revision,
	) -> BoxFuture<'a, Result<Revision, DriverError>> {
		futures::future::ready(self.save_now(key, blob, expected)).boxed()
	}

	fn remove<'a>(&'a self, key: &'a ActorKey) -> BoxFuture<'a, Result<(), DriverError>> {
		let mut state = self.state.lock();
		state.stats.removes += 1;
		state.entries.remove(key);
		futures::future::ready(Ok(())).boxed()
	}

	fn list<'a>(
		&'a self,
		namespace: &'a str,
		prefix: &'a [String],
	) -> BoxFuture<'a, Result<Vec<ActorKey>, DriverError>> {
		let keys: Vec<ActorKey> = self
			.state
			.lock()
			.entries
			.keys()
			.filter(|key| key.has_prefix(namespace, prefix))
			.cloned()
			.collect();
		futures::future::ready(Ok(keys)).boxed()
	}
}
