use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// Address of one logical actor: the registered actor type (namespace) plus
/// an ordered sequence of identifier components.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActorKey {
	namespace: String,
	identifier: Vec<String>,
}

impl ActorKey {
	/// Key with a single identifier component.
	pub fn new(namespace: impl Into<String>, identifier: impl Into<String>) -> Self {
		Self {
			namespace: namespace.into(),
			identifier: vec![identifier.into()],
		}
	}

	/// Key with a compound identifier, e.g. `["tenant-1", "room-7"]`.
	pub fn compound<I, S>(namespace: impl Into<String>, identifier: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		Self {
			namespace: namespace.into(),
			identifier: identifier.into_iter().map(Into::into).collect(),
		}
	}

	pub fn namespace(&self) -> &str {
		&self.namespace
	}

	pub fn identifier(&self) -> &[String] {
		&self.identifier
	}

	/// Component-wise prefix match used by driver enumeration.
	pub fn has_prefix(&self, namespace: &str, prefix: &[String]) -> bool {
		self.namespace == namespace && self.identifier.starts_with(prefix)
	}
}

impl fmt::Display for ActorKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.namespace)?;
		for part in &self.identifier {
			write!(f, "/{part}")?;
		}
		Ok(())
	}
}

/// Identity of a single client connection. Never reused across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}
}

impl Default for ConnectionId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Display::fmt(&self.0, f)
	}
}
