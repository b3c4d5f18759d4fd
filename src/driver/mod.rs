//! Persistence contract for actor state.
//!
//! A driver stores one opaque blob per [`ActorKey`] together with a
//! [`Revision`]. Writes are compare-and-swap on the revision so that two
//! instances of the same key can never silently overwrite each other.

use std::fmt;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde::Serialize;

use crate::id::ActorKey;

mod memory;

pub use memory::DriverStats;
pub use memory::MemoryDriver;

/// Per-key write counter used for compare-and-swap.
///
/// `Revision::NONE` means "never persisted"; every successful save stores
/// `expected.next()`.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Revision(u64);

impl Revision {
	pub const NONE: Self = Revision(0);

	pub const fn new(value: u64) -> Self {
		Revision(value)
	}

	pub const fn value(&self) -> u64 {
		self.0
	}

	pub fn next(&self) -> Self {
		Revision(self.0.saturating_add(1))
	}
}

impl fmt::Display for Revision {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "r{}", self.0)
	}
}

/// A persisted blob and the revision it was written at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredState {
	pub blob: Vec<u8>,
	pub revision: Revision,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
	#[error("Revision conflict: expected {expected}, found {actual}")]
	Conflict { expected: Revision, actual: Revision },

	#[error("Driver I/O failure: {0}")]
	Io(String),
}

impl DriverError {
	/// Only transport-level failures are worth retrying, and only for reads.
	pub fn is_retryable(&self) -> bool {
		matches!(self, DriverError::Io(_))
	}
}

/// Pluggable persistence backend.
///
/// Implementations must treat blobs as opaque and must enforce the
/// compare-and-swap contract of [`Driver::save`]. Distinct keys may be
/// accessed concurrently; the runtime funnels all access to one key through
/// a single instance.
pub trait Driver: Send + Sync + 'static {
	/// Short name used in logs.
	fn name(&self) -> &'static str {
		"driver"
	}

	/// Load the state of `key`. `Ok(None)` means the key was never persisted.
	fn load<'a>(
		&'a self,
		key: &'a ActorKey,
	) -> BoxFuture<'a, Result<Option<StoredState>, DriverError>>;

	/// Store `blob` if the current revision equals `expected`.
	///
	/// `expected == Revision::NONE` creates the key and fails if it exists.
	/// Returns the new revision, or `DriverError::Conflict` without writing.
	fn save<'a>(
		&'a self,
		key: &'a ActorKey,
		blob: Vec<u8>,
		expected: Revision,
	) -> BoxFuture<'a, Result<Revision, DriverError>>;

	/// Delete the state of `key`. Removing a missing key is not an error.
	fn remove<'a>(&'a self, key: &'a ActorKey) -> BoxFuture<'a, Result<(), DriverError>>;

	/// Keys in `namespace` whose identifier starts with `prefix`, sorted.
	fn list<'a>(
		&'a self,
		namespace: &'a str,
		prefix: &'a [String],
	) -> BoxFuture<'a, Result<Vec<ActorKey>, DriverError>>;
}
