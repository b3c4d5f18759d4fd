use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;

use crate::broadcast::ConnectionSet;
use crate::broadcast::EventQueue;
use crate::definition::Actor;
use crate::id::ActorKey;
use crate::id::ConnectionId;

/// What a `create_conn_state` hook knows about an incoming connection.
#[derive(Debug, Clone)]
pub struct ConnectInfo {
	pub key: ActorKey,
	pub connection_id: ConnectionId,
	/// Already filtered to the public allowlist.
	pub headers: BTreeMap<String, String>,
}

/// An attached connection as seen by hooks and action handlers.
#[derive(Debug)]
pub struct ConnInfo<CS> {
	id: ConnectionId,
	params: Value,
	state: Arc<CS>,
	headers: BTreeMap<String, String>,
}

impl<CS> ConnInfo<CS> {
	pub(crate) fn new(
		id: ConnectionId,
		params: Value,
		state: Arc<CS>,
		headers: BTreeMap<String, String>,
	) -> Self {
		Self {
			id,
			params,
			state,
			headers,
		}
	}

	pub fn id(&self) -> ConnectionId {
		self.id
	}

	/// Raw parameters sent with `Connect`.
	pub fn params(&self) -> &Value {
		&self.params
	}

	pub fn state(&self) -> &CS {
		&self.state
	}

	pub fn header(&self, name: &str) -> Option<&str> {
		self.headers
			.get(&name.to_ascii_lowercase())
			.map(String::as_str)
	}

	pub fn headers(&self) -> &BTreeMap<String, String> {
		&self.headers
	}
}

/// Everything an action handler may touch while it holds the instance.
///
/// State mutations are committed only if the handler succeeds; events
/// emitted through [`broadcast`](Self::broadcast) and [`send`](Self::send)
/// are delivered only after that commit. Emitting an event the actor did not
/// declare fails the action.
pub struct ActionContext<'a, A: Actor> {
	key: &'a ActorKey,
	state: &'a mut A::State,
	vars: &'a mut A::Vars,
	conn: &'a ConnInfo<A::ConnState>,
	connections: &'a ConnectionSet<A::ConnState>,
	events: &'a mut EventQueue,
	declared: Option<&'a BTreeSet<String>>,
}

impl<'a, A: Actor> ActionContext<'a, A> {
	pub(crate) fn new(
		key: &'a ActorKey,
		state: &'a mut A::State,
		vars: &'a mut A::Vars,
		conn: &'a ConnInfo<A::ConnState>,
		connections: &'a ConnectionSet<A::ConnState>,
		events: &'a mut EventQueue,
		declared: Option<&'a BTreeSet<String>>,
	) -> Self {
		Self {
			key,
			state,
			vars,
			conn,
			connections,
			events,
			declared,
		}
	}

	pub fn key(&self) -> &ActorKey {
		self.key
	}

	pub fn state(&self) -> &A::State {
		&*self.state
	}

	pub fn state_mut(&mut self) -> &mut A::State {
		&mut *self.state
	}

	pub fn vars(&self) -> &A::Vars {
		&*self.vars
	}

	pub fn vars_mut(&mut self) -> &mut A::Vars {
		&mut *self.vars
	}

	/// The connection that invoked this action.
	pub fn conn(&self) -> &ConnInfo<A::ConnState> {
		self.conn
	}

	/// Every connection attached to this instance, the caller included.
	pub fn connections(&self) -> impl Iterator<Item = &ConnInfo<A::ConnState>> {
		self.connections.iter()
	}

	pub fn connection_count(&self) -> usize {
		self.connections.len()
	}

	/// Queue an event for every connection subscribed to `name`.
	///
	/// Recipients are fixed now; the event is released after commit and
	/// dropped if the action fails.
	pub fn broadcast(&mut self, name: impl Into<String>, args: Vec<Value>) {
		let name = name.into();
		if !self.is_declared(&name) {
			self.events.reject(name);
			return;
		}
		let recipients = self.connections.subscribers(&name);
		self.events.push(recipients, name, args);
	}

	/// Queue an event for a single connection regardless of its
	/// subscriptions. Returns `false` if it is not attached.
	pub fn send(&mut self, to: ConnectionId, name: impl Into<String>, args: Vec<Value>) -> bool {
		let name = name.into();
		if !self.is_declared(&name) {
			self.events.reject(name);
			return false;
		}
		if !self.connections.contains(to) {
			return false;
		}
		self.events.push(vec![to], name, args);
		true
	}

	fn is_declared(&self, name: &str) -> bool {
		self.declared.is_none_or(|declared| declared.contains(name))
	}
}
