//! Actor type definitions.
//!
//! An actor type is described once by an [`ActorConfig`]: how to build its
//! initial state, which actions it exposes, how connections authenticate and
//! which lifecycle hooks run and which events it may emit. The per-slot
//! types (state, connection params, connection state, vars, create input)
//! are fixed at compile time by the [`Actor`] trait.

use std::any::type_name;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use downcast_rs::DowncastSync;
use downcast_rs::impl_downcast;
use futures::FutureExt as _;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::context::ActionContext;
use crate::context::ConnInfo;
use crate::context::ConnectInfo;
use crate::error::ActorError;
use crate::error::ConnectRejection;
use crate::error::DefinitionError;
use crate::error::UserError;
use crate::id::ActorKey;
use crate::instance::InstanceLink;
use crate::protocol::ALL_EVENTS;
use crate::router::Router;

/// Compile-time slot types of an actor.
///
/// ```ignore
/// struct Counter;
///
/// impl Actor for Counter {
///     type State = CounterState;
///     type ConnParams = serde_json::Value;
///     type ConnState = ();
///     type Vars = ();
///     type Input = ();
/// }
/// ```
pub trait Actor: Sized + Send + Sync + 'static {
	/// Persisted payload. Prefer ordered maps so the serialized form is stable.
	type State: Serialize + DeserializeOwned + Send + Sync + 'static;
	/// Parameters a client sends with `Connect`.
	type ConnParams: DeserializeOwned + Send + 'static;
	/// Per-connection data produced by `create_conn_state`. Connections of
	/// actors without that hook start with `Default::default()`.
	type ConnState: Serialize + Default + Send + Sync + 'static;
	/// Ephemeral per-instance data, never persisted.
	type Vars: Default + Send + Sync + 'static;
	/// Supplied by whoever creates the actor and handed to `create_state`
	/// on the very first activation. Use `()` when unused.
	type Input: DeserializeOwned + Send + 'static;
}

/// A callable action of actor `A`.
pub trait ActionHandler<A: Actor>: Send + Sync + 'static {
	fn call<'a>(
		&'a self,
		ctx: ActionContext<'a, A>,
		args: Vec<Value>,
	) -> BoxFuture<'a, anyhow::Result<Value>>;
}

impl<A, F> ActionHandler<A> for F
where
	A: Actor,
	F: for<'a> Fn(ActionContext<'a, A>, Vec<Value>) -> BoxFuture<'a, anyhow::Result<Value>>
		+ Send
		+ Sync
		+ 'static,
{
	fn call<'a>(
		&'a self,
		ctx: ActionContext<'a, A>,
		args: Vec<Value>,
	) -> BoxFuture<'a, anyhow::Result<Value>> {
		self(ctx, args)
	}
}

/// Adapter deserializing the argument array into `Args` and serializing `R`.
struct TypedAction<F, Args, R> {
	name: String,
	func: F,
	_types: PhantomData<fn(Args) -> R>,
}

impl<A, F, Args, R> ActionHandler<A> for TypedAction<F, Args, R>
where
	A: Actor,
	F: for<'a> Fn(ActionContext<'a, A>, Args) -> BoxFuture<'a, anyhow::Result<R>>
		+ Send
		+ Sync
		+ 'static,
	Args: DeserializeOwned + Send + 'static,
	R: Serialize + Send + 'static,
{
	fn call<'a>(
		&'a self,
		ctx: ActionContext<'a, A>,
		args: Vec<Value>,
	) -> BoxFuture<'a, anyhow::Result<Value>> {
		let args = match parse_args::<Args>(args) {
			Ok(args) => args,
			Err(err) => {
				let err = UserError::new(format!("invalid arguments for {}: {err}", self.name));
				return futures::future::ready(Err(err.into())).boxed();
			}
		};

		let future = (self.func)(ctx, args);
		async move {
			let value = future.await?;
			Ok(serde_json::to_value(value)?)
		}
		.boxed()
	}
}

fn parse_args<Args: DeserializeOwned>(args: Vec<Value>) -> Result<Args, serde_json::Error> {
	let empty = args.is_empty();
	match serde_json::from_value(Value::Array(args)) {
		Ok(args) => Ok(args),
		// `()` and `Option<_>` do not deserialize from an empty sequence
		Err(err) if empty => serde_json::from_value(Value::Null).map_err(|_| err),
		Err(err) => Err(err),
	}
}

/// An entry of the action table: the handler plus what we know about it.
pub struct ActionEntry<A: Actor> {
	name: String,
	args_type: Option<&'static str>,
	pub(crate) handler: Arc<dyn ActionHandler<A>>,
}

impl<A: Actor> ActionEntry<A> {
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Rust type of the arguments for typed actions.
	pub fn args_type(&self) -> Option<&'static str> {
		self.args_type
	}
}

impl<A: Actor> fmt::Debug for ActionEntry<A> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ActionEntry")
			.field("name", &self.name)
			.field("args_type", &self.args_type)
			.finish()
	}
}

type ConnStateHook<A> = dyn Fn(
		ConnectInfo,
		<A as Actor>::ConnParams,
	) -> BoxFuture<'static, anyhow::Result<<A as Actor>::ConnState>>
	+ Send
	+ Sync;
type StateHook<A> = dyn Fn(&ActorKey, &mut <A as Actor>::State) + Send + Sync;
type ConnHook<A> =
	dyn Fn(&mut <A as Actor>::State, &ConnInfo<<A as Actor>::ConnState>) + Send + Sync;
type CreateStateHook<A> =
	dyn Fn(&ActorKey, <A as Actor>::Input) -> <A as Actor>::State + Send + Sync;

/// Validated, immutable definition of one actor type.
pub struct ActorConfig<A: Actor> {
	name: String,
	initial_state: Arc<dyn Fn(&ActorKey) -> A::State + Send + Sync>,
	pub(crate) create_state: Option<Arc<CreateStateHook<A>>>,
	pub(crate) create_vars: Option<Arc<dyn Fn(&ActorKey) -> A::Vars + Send + Sync>>,
	pub(crate) create_conn_state: Option<Arc<ConnStateHook<A>>>,
	pub(crate) on_start: Option<Arc<StateHook<A>>>,
	pub(crate) on_connect: Option<Arc<ConnHook<A>>>,
	pub(crate) on_disconnect: Option<Arc<ConnHook<A>>>,
	pub(crate) on_state_change: Option<Arc<dyn Fn(&A::State) + Send + Sync>>,
	pub(crate) idle_timeout: Option<Duration>,
	pub(crate) action_timeout: Option<Duration>,
	actions: BTreeMap<String, ActionEntry<A>>,
	events: Option<BTreeSet<String>>,
}

impl<A: Actor> ActorConfig<A> {
	/// Start a definition named `name` (the key namespace it serves).
	pub fn builder<F>(name: impl Into<String>, initial_state: F) -> ActorConfigBuilder<A>
	where
		F: Fn(&ActorKey) -> A::State + Send + Sync + 'static,
	{
		ActorConfigBuilder {
			config: ActorConfig {
				name: name.into(),
				initial_state: Arc::new(initial_state),
				create_state: None,
				create_vars: None,
				create_conn_state: None,
				on_start: None,
				on_connect: None,
				on_disconnect: None,
				on_state_change: None,
				idle_timeout: None,
				action_timeout: None,
				actions: BTreeMap::new(),
				events: None,
			},
			pending: Vec::new(),
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn action(&self, name: &str) -> Option<&ActionEntry<A>> {
		self.actions.get(name)
	}

	pub fn action_names(&self) -> impl Iterator<Item = &str> {
		self.actions.keys().map(String::as_str)
	}

	pub fn idle_timeout(&self) -> Option<Duration> {
		self.idle_timeout
	}

	pub fn action_timeout(&self) -> Option<Duration> {
		self.action_timeout
	}

	/// Declared event names, `None` when the actor may emit any name.
	pub fn events(&self) -> Option<&BTreeSet<String>> {
		self.events.as_ref()
	}

	/// State of a key that has never been persisted.
	///
	/// `input` reaches `create_state` when both are present; otherwise the
	/// plain initial-state factory runs.
	pub(crate) fn first_state(&self, key: &ActorKey, input: Option<&Value>) -> Result<A::State, ActorError> {
		let (Some(input), Some(create_state)) = (input, &self.create_state) else {
			if input.is_some() {
				tracing::debug!(%key, "Actor takes no create input, ignoring it");
			}
			return Ok((self.initial_state)(key));
		};
		let input = <A::Input as serde::Deserialize>::deserialize(input).map_err(|err| ActorError::InvalidInput {
			key: key.clone(),
			reason: err.to_string(),
		})?;
		Ok(create_state(key, input))
	}

	pub(crate) fn create_vars(&self, key: &ActorKey) -> A::Vars {
		match &self.create_vars {
			Some(factory) => factory(key),
			None => A::Vars::default(),
		}
	}
}

impl<A: Actor> fmt::Debug for ActorConfig<A> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ActorConfig")
			.field("name", &self.name)
			.field("actions", &self.actions.keys().collect::<Vec<_>>())
			.field("idle_timeout", &self.idle_timeout)
			.field("action_timeout", &self.action_timeout)
			.field("events", &self.events)
			.finish()
	}
}

pub struct ActorConfigBuilder<A: Actor> {
	config: ActorConfig<A>,
	// kept in declaration order so duplicates are reported at build time
	pending: Vec<ActionEntry<A>>,
}

impl<A: Actor> ActorConfigBuilder<A> {
	/// Register an action working on raw JSON arguments.
	///
	/// ```ignore
	/// .action("reset", |mut c, _args| Box::pin(async move {
	///     c.state_mut().count = 0;
	///     Ok(serde_json::Value::Null)
	/// }))
	/// ```
	pub fn action<F>(mut self, name: impl Into<String>, handler: F) -> Self
	where
		F: for<'a> Fn(ActionContext<'a, A>, Vec<Value>) -> BoxFuture<'a, anyhow::Result<Value>>
			+ Send
			+ Sync
			+ 'static,
	{
		self.pending.push(ActionEntry {
			name: name.into(),
			args_type: None,
			handler: Arc::new(handler),
		});
		self
	}

	/// Register an action whose argument array deserializes into `Args`
	/// (usually a tuple) and whose result serializes from `R`.
	pub fn action_typed<Args, R, F>(mut self, name: impl Into<String>, handler: F) -> Self
	where
		F: for<'a> Fn(ActionContext<'a, A>, Args) -> BoxFuture<'a, anyhow::Result<R>>
			+ Send
			+ Sync
			+ 'static,
		Args: DeserializeOwned + Send + 'static,
		R: Serialize + Send + 'static,
	{
		let name = name.into();
		self.pending.push(ActionEntry {
			name: name.clone(),
			args_type: Some(type_name::<Args>()),
			handler: Arc::new(TypedAction {
				name,
				func: handler,
				_types: PhantomData,
			}),
		});
		self
	}

	/// Authenticate connections and produce their per-connection state.
	///
	/// Returning an error refuses the connection: a [`ConnectRejection`]
	/// keeps its code, a [`UserError`] becomes `unauthorized`, anything else
	/// `internal`.
	pub fn create_conn_state<F, Fut>(mut self, hook: F) -> Self
	where
		F: Fn(ConnectInfo, A::ConnParams) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = anyhow::Result<A::ConnState>> + Send + 'static,
	{
		self.config.create_conn_state = Some(Arc::new(move |info, params| hook(info, params).boxed()));
		self
	}

	/// Build the first state of a key from the creator's input.
	///
	/// Only consulted when the key has no persisted state and input was
	/// supplied; later activations hydrate from the driver.
	pub fn create_state<F>(mut self, factory: F) -> Self
	where
		F: Fn(&ActorKey, A::Input) -> A::State + Send + Sync + 'static,
	{
		self.config.create_state = Some(Arc::new(factory));
		self
	}

	/// Restrict the events this actor may emit. Emitting anything else
	/// fails the action.
	pub fn events<I, N>(mut self, names: I) -> Self
	where
		I: IntoIterator<Item = N>,
		N: Into<String>,
	{
		self.config
			.events
			.get_or_insert_with(BTreeSet::new)
			.extend(names.into_iter().map(Into::into));
		self
	}

	pub fn create_vars<F>(mut self, factory: F) -> Self
	where
		F: Fn(&ActorKey) -> A::Vars + Send + Sync + 'static,
	{
		self.config.create_vars = Some(Arc::new(factory));
		self
	}

	/// Runs once per activation after the state is hydrated.
	pub fn on_start<F>(mut self, hook: F) -> Self
	where
		F: Fn(&ActorKey, &mut A::State) + Send + Sync + 'static,
	{
		self.config.on_start = Some(Arc::new(hook));
		self
	}

	pub fn on_connect<F>(mut self, hook: F) -> Self
	where
		F: Fn(&mut A::State, &ConnInfo<A::ConnState>) + Send + Sync + 'static,
	{
		self.config.on_connect = Some(Arc::new(hook));
		self
	}

	pub fn on_disconnect<F>(mut self, hook: F) -> Self
	where
		F: Fn(&mut A::State, &ConnInfo<A::ConnState>) + Send + Sync + 'static,
	{
		self.config.on_disconnect = Some(Arc::new(hook));
		self
	}

	/// Runs after every committed state change.
	pub fn on_state_change<F>(mut self, hook: F) -> Self
	where
		F: Fn(&A::State) + Send + Sync + 'static,
	{
		self.config.on_state_change = Some(Arc::new(hook));
		self
	}

	/// Overrides the runtime idle timeout for this actor type.
	pub fn idle_timeout(mut self, timeout: Duration) -> Self {
		self.config.idle_timeout = Some(timeout);
		self
	}

	/// Actions running longer than this fail with an internal error.
	pub fn action_timeout(mut self, timeout: Duration) -> Self {
		self.config.action_timeout = Some(timeout);
		self
	}

	pub fn build(self) -> Result<ActorConfig<A>, DefinitionError> {
		let ActorConfigBuilder {
			mut config,
			pending,
		} = self;

		if config.name.is_empty() {
			return Err(DefinitionError::EmptyName);
		}
		if config.name.contains('/') {
			return Err(DefinitionError::InvalidName(config.name));
		}
		if pending.is_empty() {
			return Err(DefinitionError::NoActions(config.name));
		}
		if config.idle_timeout == Some(Duration::ZERO) {
			return Err(DefinitionError::ZeroDuration {
				field: "idle_timeout",
			});
		}
		if config.action_timeout == Some(Duration::ZERO) {
			return Err(DefinitionError::ZeroDuration {
				field: "action_timeout",
			});
		}

		if let Some(events) = &config.events {
			if let Some(bad) = events.iter().find(|name| name.is_empty() || *name == ALL_EVENTS) {
				return Err(DefinitionError::InvalidEventName(bad.clone()));
			}
		}

		for entry in pending {
			if entry.name.is_empty() {
				return Err(DefinitionError::EmptyActionName);
			}
			if config.actions.contains_key(&entry.name) {
				return Err(DefinitionError::DuplicateAction(entry.name));
			}
			config.actions.insert(entry.name.clone(), entry);
		}

		Ok(config)
	}
}

/// Connection data produced by a successful `create_conn_state`.
pub(crate) struct AuthenticatedConn {
	pub state: Arc<dyn std::any::Any + Send + Sync>,
	pub payload: Value,
}

/// Type-erased view of an [`ActorConfig`] held by the registry.
pub(crate) trait ActorFactory: DowncastSync {
	fn name(&self) -> &str;

	fn authenticate(
		&self,
		info: ConnectInfo,
		params: Value,
	) -> BoxFuture<'static, Result<AuthenticatedConn, ConnectRejection>>;

	/// `input` seeds the state when the key has never been persisted.
	fn activate(
		self: Arc<Self>,
		key: ActorKey,
		router: Router,
		input: Option<Value>,
	) -> BoxFuture<'static, Result<InstanceLink, ActorError>>;
}

impl_downcast!(sync ActorFactory);

impl<A: Actor> ActorFactory for ActorConfig<A> {
	fn name(&self) -> &str {
		&self.name
	}

	fn authenticate(
		&self,
		info: ConnectInfo,
		params: Value,
	) -> BoxFuture<'static, Result<AuthenticatedConn, ConnectRejection>> {
		let hook = self.create_conn_state.clone();
		async move {
			let params: A::ConnParams = serde_json::from_value(params)
				.map_err(|err| ConnectRejection::invalid_params(err.to_string()))?;

			let state = match hook {
				Some(hook) => hook(info.clone(), params).await.map_err(|err| {
					let rejection = ConnectRejection::from_hook(&err);
					if rejection.code == "internal" {
						tracing::error!(key = %info.key, error = ?err, "create_conn_state failed");
					}
					rejection
				})?,
				None => A::ConnState::default(),
			};

			let payload = serde_json::to_value(&state).map_err(|err| {
				tracing::error!(key = %info.key, error = %err, "Connection state is not serializable");
				ConnectRejection::internal()
			})?;

			Ok(AuthenticatedConn {
				state: Arc::new(state),
				payload,
			})
		}
		.boxed()
	}

	fn activate(
		self: Arc<Self>,
		key: ActorKey,
		router: Router,
		input: Option<Value>,
	) -> BoxFuture<'static, Result<InstanceLink, ActorError>> {
		crate::instance::activate(self, key, router, input).boxed()
	}
}

/// The set of actor types a runtime serves, keyed by namespace.
#[derive(Clone, Default)]
pub struct Registry {
	actors: BTreeMap<String, Arc<dyn ActorFactory>>,
}

impl Registry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register<A: Actor>(mut self, config: ActorConfig<A>) -> Result<Self, DefinitionError> {
		let name = config.name().to_string();
		if self.actors.contains_key(&name) {
			return Err(DefinitionError::DuplicateActor(name));
		}
		self.actors.insert(name, Arc::new(config));
		Ok(self)
	}

	pub fn names(&self) -> impl Iterator<Item = &str> {
		self.actors.keys().map(String::as_str)
	}

	/// The typed definition registered under `name`, if it is an `A`.
	pub fn config<A: Actor>(&self, name: &str) -> Option<Arc<ActorConfig<A>>> {
		self.actors
			.get(name)
			.cloned()
			.and_then(|factory| factory.downcast_arc::<ActorConfig<A>>().ok())
	}

	pub(crate) fn factory(&self, name: &str) -> Option<Arc<dyn ActorFactory>> {
		self.actors.get(name).cloned()
	}
}

impl fmt::Debug for Registry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_list().entries(self.actors.keys()).finish()
	}
}

#[cfg(test)]
mod tests {
	use serde::Deserialize;

	use super::*;

	#[derive(Debug, Default, Serialize, Deserialize)]
	struct CounterState {
		count: i64,
	}

	struct Counter;

	impl Actor for Counter {
		type State = CounterState;
		type ConnParams = Value;
		type ConnState = ();
		type Vars = ();
		type Input = i64;
	}

	fn noop<'a>(_ctx: ActionContext<'a, Counter>, _args: Vec<Value>) -> BoxFuture<'a, anyhow::Result<Value>> {
		futures::future::ready(Ok(Value::Null)).boxed()
	}

	#[test]
	fn builds_action_table() {
		let config = ActorConfig::<Counter>::builder("counter", |_| CounterState::default())
			.action("a", noop)
			.action("b", noop)
			.build()
			.unwrap();

		assert_eq!(config.action_names().collect::<Vec<_>>(), vec!["a", "b"]);
		assert!(config.action("missing").is_none());
	}

	#[test]
	fn rejects_invalid_definitions() {
		let dup = ActorConfig::<Counter>::builder("counter", |_| CounterState::default())
			.action("a", noop)
			.action("a", noop)
			.build();
		assert_eq!(dup.unwrap_err(), DefinitionError::DuplicateAction("a".into()));

		let empty = ActorConfig::<Counter>::builder("counter", |_| CounterState::default()).build();
		assert_eq!(empty.unwrap_err(), DefinitionError::NoActions("counter".into()));

		let slash = ActorConfig::<Counter>::builder("a/b", |_| CounterState::default())
			.action("a", noop)
			.build();
		assert!(matches!(slash, Err(DefinitionError::InvalidName(_))));

		let zero = ActorConfig::<Counter>::builder("counter", |_| CounterState::default())
			.action("a", noop)
			.idle_timeout(Duration::ZERO)
			.build();
		assert!(matches!(zero, Err(DefinitionError::ZeroDuration { .. })));
	}

	#[test]
	fn create_input_only_reaches_create_state() {
		let key = ActorKey::new("counter", "a");
		let plain = ActorConfig::<Counter>::builder("counter", |_| CounterState { count: 1 })
			.action("a", noop)
			.build()
			.unwrap();
		assert_eq!(plain.first_state(&key, Some(&Value::from(9))).unwrap().count, 1);

		let seeded = ActorConfig::<Counter>::builder("counter", |_| CounterState { count: 1 })
			.create_state(|_, start| CounterState { count: start })
			.action("a", noop)
			.build()
			.unwrap();
		assert_eq!(seeded.first_state(&key, None).unwrap().count, 1);
		assert_eq!(seeded.first_state(&key, Some(&Value::from(9))).unwrap().count, 9);
		assert!(matches!(
			seeded.first_state(&key, Some(&Value::from("nine"))),
			Err(ActorError::InvalidInput { .. })
		));
	}

	#[test]
	fn declared_events_are_validated() {
		let config = ActorConfig::<Counter>::builder("counter", |_| CounterState::default())
			.action("a", noop)
			.events(["countChanged", "reset"])
			.build()
			.unwrap();
		let events = config.events().unwrap();
		assert!(events.contains("reset"));
		assert_eq!(events.len(), 2);

		let wildcard = ActorConfig::<Counter>::builder("counter", |_| CounterState::default())
			.action("a", noop)
			.events([ALL_EVENTS])
			.build();
		assert_eq!(
			wildcard.unwrap_err(),
			DefinitionError::InvalidEventName("*".into())
		);
	}

	#[test]
	fn registry_recovers_typed_config() {
		let config = ActorConfig::<Counter>::builder("counter", |_| CounterState::default())
			.action("a", noop)
			.build()
			.unwrap();
		let registry = Registry::new().register(config).unwrap();

		assert!(registry.config::<Counter>("counter").is_some());
		assert!(registry.config::<Counter>("missing").is_none());

		let again = ActorConfig::<Counter>::builder("counter", |_| CounterState::default())
			.action("a", noop)
			.build()
			.unwrap();
		assert!(matches!(
			registry.register(again),
			Err(DefinitionError::DuplicateActor(_))
		));
	}

	#[test]
	fn empty_args_parse_as_unit() {
		parse_args::<()>(vec![]).unwrap();
		assert_eq!(parse_args::<Option<i64>>(vec![]).unwrap(), None);
		let pair: (i64, String) = parse_args(vec![Value::from(1), Value::from("x")]).unwrap();
		assert_eq!(pair, (1, "x".to_string()));
		assert!(parse_args::<(i64,)>(vec![Value::from("nope")]).is_err());
	}
}
