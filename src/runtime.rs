use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::census::Census;
use crate::client::LocalClient;
use crate::config::RuntimeConfig;
use crate::connection;
use crate::connection::ConnectionHandle;
use crate::connection::OpenRequest;
use crate::definition::Registry;
use crate::driver::Driver;
use crate::driver::DriverError;
use crate::error::ActorError;
use crate::error::ConfigError;
use crate::id::ActorKey;
use crate::instance::InstanceLink;
use crate::router::Router;
use crate::transport::FrameSink;
use crate::transport::FrameSource;
use crate::transport::ServerEnd;
use crate::transport::TRANSPORT_CAPACITY_DEFAULT;
use crate::transport::Transport;

/// A running actor host: registered actor types, one driver and every live
/// instance and connection.
///
/// ```ignore
/// let registry = Registry::new().register(counter_config)?;
/// let runtime = Runtime::start(registry, Arc::new(MemoryDriver::new()), RuntimeConfig::default())?;
///
/// let mut client = runtime.connect(OpenRequest::new(ActorKey::new("counter", "a")));
/// client.connect(json!(null)).await?;
///
/// runtime.shutdown().await;
/// ```
#[derive(Clone)]
pub struct Runtime {
	router: Router,
	driver: Arc<dyn Driver>,
}

impl Runtime {
	/// Must be called within a tokio runtime.
	pub fn start(
		registry: Registry,
		driver: Arc<dyn Driver>,
		config: RuntimeConfig,
	) -> Result<Self, ConfigError> {
		config.validate()?;
		info!(
			actors = ?registry.names().collect::<Vec<_>>(),
			driver = driver.name(),
			idle_timeout = ?config.idle_timeout(),
			"Runtime started"
		);
		Ok(Self {
			router: Router::new(registry, driver.clone(), config),
			driver,
		})
	}

	pub fn router(&self) -> &Router {
		&self.router
	}

	pub fn registry(&self) -> &Registry {
		self.router.registry()
	}

	pub fn census(&self) -> &Census {
		self.router.census()
	}

	/// The live instance for `key`, activating it if needed.
	pub async fn resolve(&self, key: &ActorKey) -> Result<InstanceLink, ActorError> {
		self.router.resolve(key).await
	}

	/// Resolve `key`, creating its first state from `input` if it has never
	/// been persisted.
	pub async fn resolve_with_input(&self, key: &ActorKey, input: Value) -> Result<InstanceLink, ActorError> {
		self.router.resolve_with_input(key, Some(input)).await
	}

	pub fn is_live(&self, key: &ActorKey) -> bool {
		self.router.live(key).is_some()
	}

	/// Persisted keys of `namespace` whose identifier starts with `prefix`.
	pub async fn list(&self, namespace: &str, prefix: &[String]) -> Result<Vec<ActorKey>, DriverError> {
		self.driver.list(namespace, prefix).await
	}

	/// Serve a connection over a caller-provided transport.
	pub fn serve<S, K>(&self, open: OpenRequest, source: S, sink: K) -> ConnectionHandle
	where
		S: FrameSource,
		K: FrameSink,
	{
		connection::spawn(&self.router, open, source, sink)
	}

	/// Open an in-process connection. Call [`LocalClient::connect`] to
	/// complete the handshake.
	pub fn connect(&self, open: OpenRequest) -> LocalClient {
		let (client, server) = Transport::pair(TRANSPORT_CAPACITY_DEFAULT);
		let ServerEnd { rx, tx } = server;
		let key = open.key.clone();
		let encoding = open.encoding;
		let handle = self.serve(open, rx, tx);
		LocalClient::new(key, encoding, handle, client.tx, client.rx)
	}

	/// Stop accepting work, let connections and instances drain and flush,
	/// and wait for every task to finish.
	pub async fn shutdown(&self) {
		info!("Runtime shutting down");
		self.router.shutdown().await;
		info!("Runtime stopped");
	}
}
