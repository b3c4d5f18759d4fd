use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinSet;
use tracing::error;

use crate::cancel::StopToken;
use crate::census::Census;
use crate::config::RuntimeConfig;
use crate::definition::ActorFactory;
use crate::definition::Registry;
use crate::driver::Driver;
use crate::error::ActorError;
use crate::id::ActorKey;
use crate::instance::InstanceLink;

/// Maps keys to live instances and activates missing ones.
///
/// At most one instance per key is live: activation and retirement of a key
/// both happen under that key's creation lock.
#[derive(Clone)]
pub struct Router {
	inner: Arc<RouterInner>,
}

struct RouterInner {
	registry: Registry,
	driver: Arc<dyn Driver>,
	settings: Arc<RuntimeConfig>,
	live: DashMap<ActorKey, InstanceLink>,
	creation: DashMap<ActorKey, Arc<tokio::sync::Mutex<()>>>,
	census: Census,
	stop: StopToken,
	generation: AtomicU64,
	tasks: Mutex<JoinSet<()>>,
}

/// Exclusive right to activate or retire one key.
pub(crate) struct CreationGuard {
	router: Router,
	key: ActorKey,
	guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for CreationGuard {
	fn drop(&mut self) {
		drop(self.guard.take());
		self.router
			.inner
			.creation
			.remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
	}
}

impl Router {
	pub(crate) fn new(registry: Registry, driver: Arc<dyn Driver>, settings: RuntimeConfig) -> Self {
		Self {
			inner: Arc::new(RouterInner {
				registry,
				driver,
				settings: Arc::new(settings),
				live: DashMap::new(),
				creation: DashMap::new(),
				census: Census::new(),
				stop: StopToken::new(),
				generation: AtomicU64::new(0),
				tasks: Mutex::new(JoinSet::new()),
			}),
		}
	}

	/// The live instance for `key`, activating it if needed.
	pub async fn resolve(&self, key: &ActorKey) -> Result<InstanceLink, ActorError> {
		self.resolve_with_input(key, None).await
	}

	/// Like [`resolve`](Self::resolve), seeding a never persisted key's
	/// state from `input`. Ignored when the key already has state.
	pub async fn resolve_with_input(
		&self,
		key: &ActorKey,
		input: Option<Value>,
	) -> Result<InstanceLink, ActorError> {
		if self.inner.stop.is_stopped() {
			return Err(ActorError::Shutdown);
		}
		if let Some(link) = self.live(key) {
			return Ok(link);
		}

		let factory = self.factory(key.namespace())?;
		let _creation = self.lock_key(key).await;

		// someone else may have finished activating while we waited
		if let Some(link) = self.live(key) {
			return Ok(link);
		}
		if self.inner.stop.is_stopped() {
			return Err(ActorError::Shutdown);
		}

		let link = factory.activate(key.clone(), self.clone(), input).await?;
		self.inner.live.insert(key.clone(), link.clone());
		Ok(link)
	}

	/// The live instance for `key` without activating it.
	pub fn live(&self, key: &ActorKey) -> Option<InstanceLink> {
		self.inner
			.live
			.get(key)
			.filter(|link| link.is_alive())
			.map(|link| link.clone())
	}

	pub fn live_count(&self) -> usize {
		self.inner.live.len()
	}

	pub fn registry(&self) -> &Registry {
		&self.inner.registry
	}

	pub fn census(&self) -> &Census {
		&self.inner.census
	}

	pub(crate) fn factory(&self, namespace: &str) -> Result<Arc<dyn ActorFactory>, ActorError> {
		self.inner
			.registry
			.factory(namespace)
			.ok_or_else(|| ActorError::UnknownActor {
				namespace: namespace.to_string(),
			})
	}

	pub(crate) fn driver(&self) -> Arc<dyn Driver> {
		self.inner.driver.clone()
	}

	pub(crate) fn settings(&self) -> Arc<RuntimeConfig> {
		self.inner.settings.clone()
	}

	pub(crate) fn stop_token(&self) -> &StopToken {
		&self.inner.stop
	}

	pub(crate) fn next_generation(&self) -> u64 {
		self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1
	}

	pub(crate) async fn lock_key(&self, key: &ActorKey) -> CreationGuard {
		let lock = self
			.inner
			.creation
			.entry(key.clone())
			.or_default()
			.clone();
		let guard = lock.lock_owned().await;
		CreationGuard {
			router: self.clone(),
			key: key.clone(),
			guard: Some(guard),
		}
	}

	/// Remove `key` from the live table if it still points at `generation`.
	pub(crate) fn remove_live(&self, key: &ActorKey, generation: u64) {
		self.inner
			.live
			.remove_if(key, |_, link| link.generation() == generation);
	}

	pub(crate) fn spawn<F>(&self, task: F)
	where
		F: Future<Output = ()> + Send + 'static,
	{
		let mut tasks = self.inner.tasks.lock();
		while let Some(result) = tasks.try_join_next() {
			if let Err(err) = result {
				if err.is_panic() {
					error!(error = %err, "Task panicked");
				}
			}
		}
		tasks.spawn(task);
	}

	/// Stop every instance and connection and wait for their tasks.
	pub(crate) async fn shutdown(&self) {
		self.inner.stop.stop(crate::cancel::StopReason::Shutdown);

		loop {
			// tasks spawned while draining land in a fresh set
			let mut tasks = std::mem::take(&mut *self.inner.tasks.lock());
			if tasks.is_empty() {
				break;
			}
			while let Some(result) = tasks.join_next().await {
				if let Err(err) = result {
					if err.is_panic() {
						error!(error = %err, "Task panicked during shutdown");
					}
				}
			}
		}
	}
}
