//! Running one action against an instance: lookup, execution, rollback and
//! compare-and-swap persistence.

use std::panic::AssertUnwindSafe;
use std::time::Instant;

use futures::FutureExt as _;
use serde_json::Value;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::broadcast::EventQueue;
use crate::context::ActionContext;
use crate::definition::Actor;
use crate::driver::DriverError;
use crate::error::ActionError;
use crate::error::ErrorKind;
use crate::id::ConnectionId;
use crate::instance::Instance;
use crate::instance::StateSnapshot;
use crate::instance::encode_blob;
use crate::instance::now_ms;

/// One action request routed to an instance.
#[derive(Debug, Clone)]
pub struct ActionInvocation {
	pub connection: ConnectionId,
	pub name: String,
	pub args: Vec<Value>,
	pub request_id: String,
}

impl<A: Actor> Instance<A> {
	pub(crate) async fn dispatch(&mut self, invocation: ActionInvocation) -> Result<Value, ActionError> {
		let ActionInvocation {
			connection,
			name,
			args,
			request_id,
		} = invocation;

		let Some(entry) = self.config.action(&name) else {
			debug!(action = %name, %request_id, "Unknown action");
			record(self.config.name(), "not_found", None);
			return Err(ActionError::not_found(format!("unknown action: {name}")));
		};
		let handler = entry.handler.clone();

		let Some(conn) = self.connections.get(connection).cloned() else {
			debug!(%connection, "Action from a detached connection");
			record(self.config.name(), "not_found", None);
			return Err(ActionError::not_found("connection is not attached"));
		};

		let config = self.config.clone();
		let timeout = self.action_timeout;
		let started = Instant::now();
		let mut events = EventQueue::default();

		let outcome = {
			let ctx = ActionContext::new(
				&self.key,
				&mut self.state,
				&mut self.vars,
				&conn,
				&self.connections,
				&mut events,
				config.events(),
			);
			let call = AssertUnwindSafe(handler.call(ctx, args)).catch_unwind();
			match timeout {
				Some(limit) => tokio::time::timeout(limit, call).await.ok(),
				None => Some(call.await),
			}
		};

		let result = match outcome {
			Some(Ok(Ok(_))) if !events.undeclared().is_empty() => {
				error!(action = %name, %request_id, events = ?events.undeclared(), "Action emitted undeclared events");
				Err(ActionError::internal())
			}
			Some(Ok(Ok(value))) => Ok(value),
			Some(Ok(Err(err))) => {
				let action_err = ActionError::from_handler(&err);
				if action_err.kind == ErrorKind::Internal {
					error!(action = %name, %request_id, error = ?err, "Action failed");
				} else {
					debug!(action = %name, %request_id, error = %err, "Action rejected");
				}
				Err(action_err)
			}
			Some(Err(panic)) => {
				error!(action = %name, %request_id, panic = panic_message(&*panic), "Action panicked");
				Err(ActionError::internal())
			}
			None => {
				warn!(action = %name, %request_id, ?timeout, "Action timed out");
				Err(ActionError::internal())
			}
		};

		let result = match result {
			Ok(value) => self.commit().await.map(|_| value),
			Err(err) => Err(err),
		};

		match &result {
			Ok(_) => {
				let delivered = self.connections.deliver(events);
				debug!(action = %name, %request_id, delivered, "Action committed");
			}
			Err(_) => {
				self.rollback();
				if !events.is_empty() {
					debug!(action = %name, dropped = events.len(), "Dropping events of failed action");
				}
			}
		}

		let outcome = match &result {
			Ok(_) => "ok",
			Err(err) => err.kind.as_str(),
		};
		record(self.config.name(), outcome, Some(started));
		result
	}

	/// Persist the state if it changed since the last commit.
	///
	/// Returns whether a save happened. On failure nothing is updated and
	/// the caller is expected to roll back.
	pub(crate) async fn commit(&mut self) -> Result<bool, ActionError> {
		let serialized = serde_json::to_vec(&self.state).map_err(|err| {
			error!(error = %err, "State is not serializable");
			ActionError::internal()
		})?;
		if serialized == self.persisted {
			return Ok(false);
		}

		let persisted_at_ms = now_ms();
		let blob = encode_blob(&self.state, persisted_at_ms).map_err(|err| {
			error!(error = %err, "State is not serializable");
			ActionError::internal()
		})?;

		let revision = match self.driver.save(&self.key, blob, self.revision).await {
			Ok(revision) => revision,
			Err(DriverError::Conflict { expected, actual }) => {
				warn!(%expected, %actual, "State was modified by another writer");
				return Err(ActionError::conflict());
			}
			Err(err) => {
				error!(error = %err, "Failed to save state");
				return Err(ActionError::internal());
			}
		};

		self.revision = revision;
		self.persisted_at_ms = persisted_at_ms;
		self.snapshots.send_replace(StateSnapshot {
			revision,
			persisted_at_ms,
			state: serde_json::from_slice(&serialized).unwrap_or(Value::Null),
		});
		self.persisted = serialized;

		if let Some(on_state_change) = self.config.on_state_change.clone() {
			// the revision is already durable
			run_hook("on_state_change", || on_state_change(&self.state));
		}
		Ok(true)
	}

	/// Restore the state of the last committed revision.
	pub(crate) fn rollback(&mut self) {
		match serde_json::from_slice(&self.persisted) {
			Ok(state) => self.state = state,
			Err(err) => error!(error = %err, "Failed to restore the last committed state"),
		}
	}
}

fn record(actor: &str, outcome: &'static str, started: Option<Instant>) {
	metrics::counter!("runy_actions_total",
		"actor" => actor.to_string(),
		"outcome" => outcome
	)
	.increment(1);
	if let Some(started) = started {
		metrics::histogram!("runy_action_duration_seconds",
			"actor" => actor.to_string()
		)
		.record(started.elapsed().as_secs_f64());
	}
}

/// Run a synchronous lifecycle hook. Returns `false` if it panicked.
pub(crate) fn run_hook(hook: &'static str, f: impl FnOnce()) -> bool {
	match std::panic::catch_unwind(AssertUnwindSafe(f)) {
		Ok(()) => true,
		Err(panic) => {
			error!(hook, panic = panic_message(&*panic), "Hook panicked");
			metrics::counter!("runy_hook_panics_total", "hook" => hook).increment(1);
			false
		}
	}
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
	if let Some(message) = panic.downcast_ref::<&'static str>() {
		message
	} else if let Some(message) = panic.downcast_ref::<String>() {
		message
	} else {
		"non-string panic payload"
	}
}
