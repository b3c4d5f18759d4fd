//! The live, in-memory embodiment of one actor key.
//!
//! Each instance is a tokio task draining a bounded mailbox. Messages are
//! handled one at a time and every handler future is awaited to completion
//! before the next message is taken, so the mailbox doubles as the
//! instance's execution lock.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::Instrument as _;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::broadcast::AttachedConnection;
use crate::broadcast::ConnectionSet;
use crate::broadcast::Outbox;
use crate::broadcast::Subscriptions;
use crate::cancel::StopReason;
use crate::cancel::StopToken;
use crate::census::LiveGuard;
use crate::config::LoadRetryConfig;
use crate::context::ConnInfo;
use crate::definition::Actor;
use crate::definition::ActorConfig;
use crate::dispatch::ActionInvocation;
use crate::dispatch::run_hook;
use crate::driver::Driver;
use crate::driver::DriverError;
use crate::driver::Revision;
use crate::driver::StoredState;
use crate::envelope::Envelope;
use crate::error::ActionError;
use crate::error::ActorError;
use crate::id::ActorKey;
use crate::id::ConnectionId;
use crate::router::CreationGuard;
use crate::router::Router;

/// How often activation retries creating the initial state after losing a
/// create race before giving up.
const CREATE_ATTEMPTS: usize = 3;

/// Committed state as published to observers.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
	pub revision: Revision,
	pub persisted_at_ms: u64,
	pub state: Value,
}

/// Blob layout written to the driver.
#[derive(Deserialize)]
struct PersistedState<S> {
	persisted_at_ms: u64,
	state: S,
}

#[derive(Serialize)]
struct PersistedStateRef<'a, S> {
	persisted_at_ms: u64,
	state: &'a S,
}

pub(crate) fn now_ms() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|elapsed| elapsed.as_millis() as u64)
		.unwrap_or_default()
}

pub(crate) fn encode_blob<S: Serialize>(state: &S, persisted_at_ms: u64) -> serde_json::Result<Vec<u8>> {
	serde_json::to_vec(&PersistedStateRef {
		persisted_at_ms,
		state,
	})
}

/// A connection ready to join an instance.
#[derive(Clone)]
pub(crate) struct AttachRequest {
	pub id: ConnectionId,
	pub params: Value,
	pub headers: BTreeMap<String, String>,
	pub state: Arc<dyn Any + Send + Sync>,
	pub outbox: Outbox,
}

impl fmt::Debug for AttachRequest {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("AttachRequest").field("id", &self.id).finish()
	}
}

#[derive(Debug)]
pub(crate) enum InstanceMessage {
	Attach(Envelope<AttachRequest, Result<(), ActorError>>),
	Detach(Envelope<ConnectionId, ()>),
	Dispatch(Envelope<ActionInvocation, Result<Value, ActionError>>),
	Subscribe {
		connection: ConnectionId,
		event: String,
		subscribe: bool,
	},
}

impl InstanceMessage {
	/// Answer a message that arrived after the instance stopped serving.
	fn reject(self, key: &ActorKey) {
		match self {
			InstanceMessage::Attach(envelope) => {
				let _ = envelope.send(Err(ActorError::Stopped { key: key.clone() }));
			}
			InstanceMessage::Detach(envelope) => {
				let _ = envelope.send(());
			}
			InstanceMessage::Dispatch(envelope) => {
				let _ = envelope.send(Err(ActionError::internal()));
			}
			InstanceMessage::Subscribe { .. } => {}
		}
	}
}

/// Cloneable handle to a running instance.
#[derive(Clone)]
pub struct InstanceLink {
	inner: Arc<LinkInner>,
}

struct LinkInner {
	key: ActorKey,
	generation: u64,
	mailbox: mpsc::Sender<InstanceMessage>,
	stop: StopToken,
	snapshots: watch::Receiver<StateSnapshot>,
}

impl fmt::Debug for InstanceLink {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("InstanceLink")
			.field("key", &self.inner.key)
			.field("generation", &self.inner.generation)
			.field("alive", &self.is_alive())
			.finish()
	}
}

impl InstanceLink {
	pub fn key(&self) -> &ActorKey {
		&self.inner.key
	}

	/// Distinguishes successive activations of the same key.
	pub fn generation(&self) -> u64 {
		self.inner.generation
	}

	pub fn is_alive(&self) -> bool {
		!self.inner.mailbox.is_closed()
	}

	/// The last committed state.
	pub fn state(&self) -> StateSnapshot {
		self.inner.snapshots.borrow().clone()
	}

	/// Receives a new snapshot after every commit.
	pub fn watch_state(&self) -> watch::Receiver<StateSnapshot> {
		self.inner.snapshots.clone()
	}

	/// Ask the instance to flush and leave the live table. Queued messages
	/// are still handled.
	pub fn stop(&self) {
		self.inner.stop.stop(StopReason::Closed);
	}

	/// Run an action on behalf of an attached connection.
	pub async fn dispatch(&self, invocation: ActionInvocation) -> Result<Value, ActionError> {
		let (envelope, reply) = Envelope::new(invocation);
		if self.send(InstanceMessage::Dispatch(envelope)).await.is_err() {
			warn!(key = %self.inner.key, "Dispatch to a stopped instance");
			return Err(ActionError::internal());
		}
		reply.await.unwrap_or_else(|_| Err(ActionError::internal()))
	}

	pub(crate) async fn attach(&self, request: AttachRequest) -> Result<(), ActorError> {
		let (envelope, reply) = Envelope::new(request);
		self.send(InstanceMessage::Attach(envelope)).await?;
		reply.await.map_err(|_| self.stopped())?
	}

	pub(crate) async fn detach(&self, connection: ConnectionId) -> Result<(), ActorError> {
		let (envelope, reply) = Envelope::new(connection);
		self.send(InstanceMessage::Detach(envelope)).await?;
		reply.await.map_err(|_| self.stopped())
	}

	pub(crate) async fn subscribe(
		&self,
		connection: ConnectionId,
		event: String,
		subscribe: bool,
	) -> Result<(), ActorError> {
		self.send(InstanceMessage::Subscribe {
			connection,
			event,
			subscribe,
		})
		.await
	}

	async fn send(&self, message: InstanceMessage) -> Result<(), ActorError> {
		self.inner
			.mailbox
			.send(message)
			.await
			.map_err(|_| self.stopped())
	}

	fn stopped(&self) -> ActorError {
		ActorError::Stopped {
			key: self.inner.key.clone(),
		}
	}
}

/// Instance state owned by its task.
pub(crate) struct Instance<A: Actor> {
	pub key: ActorKey,
	pub config: Arc<ActorConfig<A>>,
	pub state: A::State,
	pub vars: A::Vars,
	pub revision: Revision,
	/// Serialized form of the state at `revision`.
	pub persisted: Vec<u8>,
	pub persisted_at_ms: u64,
	pub connections: ConnectionSet<A::ConnState>,
	/// Per-type timeout, falling back to the runtime default.
	pub action_timeout: Option<Duration>,
	pub driver: Arc<dyn Driver>,
	pub snapshots: watch::Sender<StateSnapshot>,
}

struct Hydrated<S> {
	state: S,
	revision: Revision,
	persisted: Vec<u8>,
	persisted_at_ms: u64,
}

enum Exit {
	Idle,
	Stopped(StopReason),
}

/// Hydrate `key` and spawn its task. The caller holds the key's creation
/// lock and inserts the returned link into the live table.
pub(crate) async fn activate<A: Actor>(
	config: Arc<ActorConfig<A>>,
	key: ActorKey,
	router: Router,
	input: Option<Value>,
) -> Result<InstanceLink, ActorError> {
	let settings = router.settings();
	let driver = router.driver();

	let span = tracing::info_span!("actor", key = %key);
	let hydrated = hydrate(&config, &key, input.as_ref(), driver.as_ref(), &settings.load_retry)
		.instrument(span.clone())
		.await?;

	let snapshot = StateSnapshot {
		revision: hydrated.revision,
		persisted_at_ms: hydrated.persisted_at_ms,
		state: serde_json::from_slice(&hydrated.persisted).unwrap_or(Value::Null),
	};
	let (snapshots, snapshot_rx) = watch::channel(snapshot);

	let mut instance = Instance {
		vars: config.create_vars(&key),
		key: key.clone(),
		action_timeout: config.action_timeout.or(settings.action_timeout()),
		config,
		state: hydrated.state,
		revision: hydrated.revision,
		persisted: hydrated.persisted,
		persisted_at_ms: hydrated.persisted_at_ms,
		connections: ConnectionSet::default(),
		driver,
		snapshots,
	};

	if let Some(on_start) = instance.config.on_start.clone() {
		if !run_hook("on_start", || on_start(&instance.key, &mut instance.state)) {
			return Err(ActorError::Internal(format!("on_start of {key} panicked")));
		}
		if instance.commit().instrument(span.clone()).await.is_err() {
			return Err(ActorError::Internal(format!(
				"failed to persist state of {key} after on_start"
			)));
		}
	}

	let (tx, rx) = mpsc::channel(settings.mailbox_capacity);
	let stop = router.stop_token().child();
	let generation = router.next_generation();
	let live = router.census().enter(&key);

	let link = InstanceLink {
		inner: Arc::new(LinkInner {
			key,
			generation,
			mailbox: tx,
			stop: stop.clone(),
			snapshots: snapshot_rx,
		}),
	};

	info!(parent: &span, generation, revision = %instance.revision, "Instance activated");
	router.spawn(
		instance
			.run(rx, stop, router.clone(), generation, live)
			.instrument(span),
	);

	Ok(link)
}

async fn hydrate<A: Actor>(
	config: &ActorConfig<A>,
	key: &ActorKey,
	input: Option<&Value>,
	driver: &dyn Driver,
	retry: &LoadRetryConfig,
) -> Result<Hydrated<A::State>, ActorError> {
	let not_serializable = |err: serde_json::Error| {
		ActorError::Internal(format!("state of {key} is not serializable: {err}"))
	};

	for _ in 0..CREATE_ATTEMPTS {
		if let Some(stored) = load_with_retry(key, driver, retry).await? {
			let decoded: PersistedState<A::State> =
				serde_json::from_slice(&stored.blob).map_err(|err| ActorError::CorruptState {
					key: key.clone(),
					reason: err.to_string(),
				})?;
			let persisted = serde_json::to_vec(&decoded.state).map_err(not_serializable)?;
			debug!(revision = %stored.revision, "Hydrated from driver");
			return Ok(Hydrated {
				state: decoded.state,
				revision: stored.revision,
				persisted,
				persisted_at_ms: decoded.persisted_at_ms,
			});
		}

		let state = config.first_state(key, input)?;
		let persisted = serde_json::to_vec(&state).map_err(not_serializable)?;
		let persisted_at_ms = now_ms();
		let blob = encode_blob(&state, persisted_at_ms).map_err(not_serializable)?;

		match driver.save(key, blob, Revision::NONE).await {
			Ok(revision) => {
				debug!(%revision, "Created initial state");
				return Ok(Hydrated {
					state,
					revision,
					persisted,
					persisted_at_ms,
				});
			}
			Err(DriverError::Conflict { actual, .. }) => {
				debug!(%actual, "Initial state was created concurrently, reloading");
			}
			Err(source) => {
				return Err(ActorError::Driver {
					key: key.clone(),
					source,
				});
			}
		}
	}

	Err(ActorError::Internal(format!(
		"could not create initial state of {key}"
	)))
}

async fn load_with_retry(
	key: &ActorKey,
	driver: &dyn Driver,
	retry: &LoadRetryConfig,
) -> Result<Option<StoredState>, ActorError> {
	let mut attempt = 1;
	loop {
		match driver.load(key).await {
			Ok(stored) => return Ok(stored),
			Err(err) if err.is_retryable() && attempt < retry.attempts => {
				let delay = retry.backoff(attempt);
				warn!(attempt, ?delay, error = %err, "Load failed, retrying");
				tokio::time::sleep(delay).await;
				attempt += 1;
			}
			Err(source) => {
				error!(attempt, error = %source, "Load failed");
				return Err(ActorError::Driver {
					key: key.clone(),
					source,
				});
			}
		}
	}
}

impl<A: Actor> Instance<A> {
	async fn run(
		mut self,
		mut mailbox: mpsc::Receiver<InstanceMessage>,
		stop: StopToken,
		router: Router,
		generation: u64,
		live: LiveGuard,
	) {
		let idle = self
			.config
			.idle_timeout
			.unwrap_or_else(|| router.settings().idle_timeout());

		let stopped = stop.stopped();
		tokio::pin!(stopped);
		let sleep = tokio::time::sleep(idle);
		tokio::pin!(sleep);

		let exit = loop {
			tokio::select! {
				biased;
				reason = &mut stopped => break Exit::Stopped(reason),
				message = mailbox.recv() => match message {
					Some(message) => {
						self.handle(message).await;
						sleep.as_mut().reset(Instant::now() + idle);
					}
					None => break Exit::Stopped(StopReason::Closed),
				},
				() = &mut sleep, if self.connections.is_empty() => break Exit::Idle,
			}
		};

		// held until the final flush, new activations of this key wait on it
		let creation = router.lock_key(&self.key).await;
		match exit {
			Exit::Idle => debug!(?idle, "Idle timeout reached"),
			Exit::Stopped(reason) => {
				debug!(?reason, "Stop requested, handling queued messages");
				mailbox.close();
				while let Some(message) = mailbox.recv().await {
					match message {
						// would be closed right away, the caller attaches to the next activation
						message @ InstanceMessage::Attach(_) => message.reject(&self.key),
						message => self.handle(message).await,
					}
				}
			}
		}

		self.retire(mailbox, router, generation, live, creation).await;
	}

	/// Flush and leave the live table.
	async fn retire(
		mut self,
		mut mailbox: mpsc::Receiver<InstanceMessage>,
		router: Router,
		generation: u64,
		live: LiveGuard,
		creation: CreationGuard,
	) {
		if self.commit().await.is_err() {
			warn!("Final flush failed, uncommitted changes are lost");
		}
		router.remove_live(&self.key, generation);

		mailbox.close();
		let mut rejected = 0;
		while let Some(message) = mailbox.recv().await {
			message.reject(&self.key);
			rejected += 1;
		}

		let connections = self.connections.len();
		info!(revision = %self.revision, connections, rejected, "Instance stopped");

		drop(self);
		drop(live);
		drop(creation);
	}

	async fn handle(&mut self, message: InstanceMessage) {
		match message {
			InstanceMessage::Attach(envelope) => {
				// nobody would ever detach it
				if envelope.is_abandoned() {
					debug!("Dropping abandoned attach request");
					return;
				}
				let (request, reply) = envelope.split();
				let result = self.attach(request).await;
				let _ = reply.send(result);
			}
			InstanceMessage::Detach(envelope) => {
				let (connection, reply) = envelope.split();
				self.detach(connection).await;
				let _ = reply.send(());
			}
			InstanceMessage::Dispatch(envelope) => {
				let (invocation, reply) = envelope.split();
				let result = self.dispatch(invocation).await;
				// the caller may have disconnected; the action still ran
				let _ = reply.send(result);
			}
			InstanceMessage::Subscribe {
				connection,
				event,
				subscribe,
			} => {
				if !self.connections.subscribe(connection, &event, subscribe) {
					debug!(%connection, %event, "Subscription from a detached connection");
				}
			}
		}
	}

	async fn attach(&mut self, request: AttachRequest) -> Result<(), ActorError> {
		let state = request.state.downcast::<A::ConnState>().map_err(|_| {
			ActorError::Internal(format!(
				"connection state of {} has the wrong type",
				request.id
			))
		})?;

		let info = Arc::new(ConnInfo::new(request.id, request.params, state, request.headers));
		self.connections.insert(AttachedConnection {
			info: info.clone(),
			outbox: request.outbox,
			subscriptions: Subscriptions::default(),
		});

		if let Some(on_connect) = self.config.on_connect.clone() {
			if !run_hook("on_connect", || on_connect(&mut self.state, &info)) {
				self.rollback();
				self.connections.remove(request.id);
				return Err(ActorError::Internal(format!(
					"on_connect panicked for {}",
					request.id
				)));
			}
			self.commit_or_rollback().await;
		}
		debug!(connection = %request.id, total = self.connections.len(), "Connection attached");
		Ok(())
	}

	async fn detach(&mut self, connection: ConnectionId) {
		let Some(attached) = self.connections.remove(connection) else {
			return;
		};
		debug!(%connection, total = self.connections.len(), "Connection detached");

		if let Some(on_disconnect) = self.config.on_disconnect.clone() {
			if !run_hook("on_disconnect", || on_disconnect(&mut self.state, &attached.info)) {
				self.rollback();
				return;
			}
			self.commit_or_rollback().await;
		}
	}

	async fn commit_or_rollback(&mut self) {
		if self.commit().await.is_err() {
			self.rollback();
		}
	}
}
