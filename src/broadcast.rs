//! Connection bookkeeping and event fan-out for one instance.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::context::ConnInfo;
use crate::id::ConnectionId;
use crate::protocol::ALL_EVENTS;
use crate::protocol::ToClient;

/// Ordered outbound queue of a connection task, shared by events and
/// action responses.
pub(crate) type Outbox = mpsc::UnboundedSender<ToClient>;

/// Event names a connection receives.
///
/// New connections receive everything. Subscribing to [`ALL_EVENTS`] toggles
/// that wildcard; named subscriptions are tracked next to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriptions {
	wildcard: bool,
	names: BTreeSet<String>,
}

impl Default for Subscriptions {
	fn default() -> Self {
		Self {
			wildcard: true,
			names: BTreeSet::new(),
		}
	}
}

impl Subscriptions {
	pub fn wants(&self, event: &str) -> bool {
		self.wildcard || self.names.contains(event)
	}

	pub fn apply(&mut self, event: &str, subscribe: bool) {
		if event == ALL_EVENTS {
			self.wildcard = subscribe;
		} else if subscribe {
			self.names.insert(event.to_string());
		} else {
			self.names.remove(event);
		}
	}
}

pub(crate) struct AttachedConnection<CS> {
	pub info: Arc<ConnInfo<CS>>,
	pub outbox: Outbox,
	pub subscriptions: Subscriptions,
}

/// Connections attached to an instance, keyed by id.
pub struct ConnectionSet<CS> {
	attached: BTreeMap<ConnectionId, AttachedConnection<CS>>,
}

impl<CS> Default for ConnectionSet<CS> {
	fn default() -> Self {
		Self {
			attached: BTreeMap::new(),
		}
	}
}

impl<CS> ConnectionSet<CS> {
	pub fn len(&self) -> usize {
		self.attached.len()
	}

	pub fn is_empty(&self) -> bool {
		self.attached.is_empty()
	}

	pub fn contains(&self, id: ConnectionId) -> bool {
		self.attached.contains_key(&id)
	}

	pub fn iter(&self) -> impl Iterator<Item = &ConnInfo<CS>> {
		self.attached.values().map(|conn| conn.info.as_ref())
	}

	pub(crate) fn get(&self, id: ConnectionId) -> Option<&Arc<ConnInfo<CS>>> {
		self.attached.get(&id).map(|conn| &conn.info)
	}

	pub(crate) fn insert(&mut self, conn: AttachedConnection<CS>) {
		self.attached.insert(conn.info.id(), conn);
	}

	pub(crate) fn remove(&mut self, id: ConnectionId) -> Option<AttachedConnection<CS>> {
		self.attached.remove(&id)
	}

	/// Returns `false` if the connection is not attached.
	pub(crate) fn subscribe(&mut self, id: ConnectionId, event: &str, subscribe: bool) -> bool {
		match self.attached.get_mut(&id) {
			Some(conn) => {
				conn.subscriptions.apply(event, subscribe);
				true
			}
			None => false,
		}
	}

	/// Connections that currently want `event`.
	pub(crate) fn subscribers(&self, event: &str) -> Vec<ConnectionId> {
		self.attached
			.iter()
			.filter(|(_, conn)| conn.subscriptions.wants(event))
			.map(|(id, _)| *id)
			.collect()
	}

	/// Hand every queued event to its recipients' outboxes, in emission
	/// order. Recipients that went away are skipped.
	pub(crate) fn deliver(&self, queue: EventQueue) -> usize {
		let mut delivered = 0;
		for event in queue.pending {
			for id in &event.recipients {
				let Some(conn) = self.attached.get(id) else {
					continue;
				};
				let frame = ToClient::Event {
					name: event.name.clone(),
					args: event.args.clone(),
				};
				if conn.outbox.send(frame).is_ok() {
					delivered += 1;
				}
			}
		}
		delivered
	}
}

struct PendingEvent {
	recipients: Vec<ConnectionId>,
	name: String,
	args: Vec<Value>,
}

/// Events emitted by a running action, held until the action commits.
#[derive(Default)]
pub struct EventQueue {
	pending: Vec<PendingEvent>,
	undeclared: Vec<String>,
}

impl EventQueue {
	/// Remember an emission of an event the actor never declared.
	pub(crate) fn reject(&mut self, name: String) {
		self.undeclared.push(name);
	}

	/// Undeclared names emitted so far; any fails the action.
	pub(crate) fn undeclared(&self) -> &[String] {
		&self.undeclared
	}

	pub(crate) fn push(&mut self, recipients: Vec<ConnectionId>, name: String, args: Vec<Value>) {
		if recipients.is_empty() {
			return;
		}
		self.pending.push(PendingEvent {
			recipients,
			name,
			args,
		});
	}

	pub fn len(&self) -> usize {
		self.pending.len()
	}

	pub fn is_empty(&self) -> bool {
		self.pending.is_empty()
	}
}
