//! Server side of one client connection.
//!
//! ```text
//! Connecting -> Authenticating -> Active -> Closing -> Closed
//!      \______________\___________________________/^
//! ```
//!
//! A connection task owns its transport. It authenticates the client,
//! attaches to the instance, then multiplexes inbound requests, action
//! responses and events until either side goes away.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use futures::FutureExt as _;
use futures::StreamExt as _;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::Instrument as _;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::cancel::StopReason;
use crate::cancel::StopToken;
use crate::context::ConnectInfo;
use crate::dispatch::ActionInvocation;
use crate::error::ActionError;
use crate::error::ActorError;
use crate::error::ConnectRejection;
use crate::id::ActorKey;
use crate::id::ConnectionId;
use crate::instance::AttachRequest;
use crate::instance::InstanceLink;
use crate::protocol::Encoding;
use crate::protocol::ToClient;
use crate::protocol::ToServer;
use crate::protocol::filter_public_headers;
use crate::router::Router;
use crate::transport::FrameSink;
use crate::transport::FrameSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
	/// Transport is open, waiting for the `Connect` frame.
	Connecting,
	/// Running `create_conn_state` and attaching to the instance.
	Authenticating,
	Active,
	/// No longer reading; delivering outstanding responses.
	Closing,
	Closed,
}

impl ConnectionState {
	pub fn can_transition_to(&self, next: ConnectionState) -> bool {
		use ConnectionState::*;
		matches!(
			(self, next),
			(Connecting, Authenticating)
				| (Connecting, Closed)
				| (Authenticating, Active)
				| (Authenticating, Closed)
				| (Active, Closing)
				| (Closing, Closed)
		)
	}

	pub fn is_closed(&self) -> bool {
		*self == ConnectionState::Closed
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
	pub id: ConnectionId,
	pub key: ActorKey,
	pub state: ConnectionState,
	pub close_reason: Option<String>,
}

/// Where a new connection goes and how it talks.
#[derive(Debug, Clone)]
pub struct OpenRequest {
	pub key: ActorKey,
	pub encoding: Encoding,
	pub headers: BTreeMap<String, String>,
	/// Create input, used only if this connection creates the actor.
	pub input: Option<Value>,
}

impl OpenRequest {
	pub fn new(key: ActorKey) -> Self {
		Self {
			key,
			encoding: Encoding::default(),
			headers: BTreeMap::new(),
			input: None,
		}
	}

	pub fn with_input(mut self, input: Value) -> Self {
		self.input = Some(input);
		self
	}

	pub fn with_encoding(mut self, encoding: Encoding) -> Self {
		self.encoding = encoding;
		self
	}

	/// Transport headers; anything outside the public allowlist is dropped.
	pub fn with_headers<I, K, V>(mut self, headers: I) -> Self
	where
		I: IntoIterator<Item = (K, V)>,
		K: AsRef<str>,
		V: Into<String>,
	{
		self.headers = filter_public_headers(headers);
		self
	}
}

/// Observer of a running connection task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
	status: Arc<ArcSwap<ConnectionStatus>>,
	stop: StopToken,
}

impl ConnectionHandle {
	pub fn id(&self) -> ConnectionId {
		self.status.load().id
	}

	pub fn state(&self) -> ConnectionState {
		self.status.load().state
	}

	pub fn status(&self) -> Arc<ConnectionStatus> {
		self.status.load_full()
	}

	/// Close from the server side. Outstanding responses are still written.
	pub fn close(&self) {
		self.stop.stop(StopReason::Closed);
	}
}

/// Spawn the task serving one connection.
pub(crate) fn spawn<S, K>(router: &Router, open: OpenRequest, source: S, sink: K) -> ConnectionHandle
where
	S: FrameSource,
	K: FrameSink,
{
	let id = ConnectionId::new();
	let stop = router.stop_token().child();
	let status = Arc::new(ArcSwap::from_pointee(ConnectionStatus {
		id,
		key: open.key.clone(),
		state: ConnectionState::Connecting,
		close_reason: None,
	}));

	let span = tracing::info_span!("connection", %id, key = %open.key);
	let task = ConnectionTask {
		router: router.clone(),
		open,
		id,
		source,
		sink,
		sink_open: true,
		status: status.clone(),
		stop: stop.clone(),
	};
	router.spawn(task.run().instrument(span));

	ConnectionHandle { status, stop }
}

type InFlight = FuturesUnordered<BoxFuture<'static, (String, Result<Value, ActionError>)>>;

struct ConnectionTask<S, K> {
	router: Router,
	open: OpenRequest,
	id: ConnectionId,
	source: S,
	sink: K,
	sink_open: bool,
	status: Arc<ArcSwap<ConnectionStatus>>,
	stop: StopToken,
}

struct Attached {
	link: InstanceLink,
	outbox: mpsc::UnboundedReceiver<ToClient>,
}

impl<S: FrameSource, K: FrameSink> ConnectionTask<S, K> {
	async fn run(mut self) {
		let reason = match self.establish().await {
			Ok(attached) => {
				metrics::counter!("runy_connections_total", "outcome" => "accepted").increment(1);
				self.serve(attached).await
			}
			Err(reason) => {
				metrics::counter!("runy_connections_total", "outcome" => "rejected").increment(1);
				reason
			}
		};

		info!(%reason, "Connection closed");
		let current = self.status.load_full();
		if current.state.can_transition_to(ConnectionState::Closed) {
			self.status.store(Arc::new(ConnectionStatus {
				state: ConnectionState::Closed,
				close_reason: Some(reason),
				..(*current).clone()
			}));
		}
	}

	fn transition(&self, next: ConnectionState) {
		let current = self.status.load_full();
		if !current.state.can_transition_to(next) {
			error!(from = ?current.state, to = ?next, "Illegal connection state transition");
			return;
		}
		self.status.store(Arc::new(ConnectionStatus {
			state: next,
			..(*current).clone()
		}));
	}

	async fn write(&mut self, frame: &ToClient) {
		if !self.sink_open {
			return;
		}
		let bytes = match self.open.encoding.encode(frame) {
			Ok(bytes) => bytes,
			Err(err) => {
				error!(error = %err, "Failed to encode frame");
				return;
			}
		};
		if self.sink.send(bytes).await.is_err() {
			debug!("Transport closed, dropping further output");
			self.sink_open = false;
		}
	}

	async fn reject(&mut self, rejection: ConnectRejection) -> String {
		warn!(code = %rejection.code, reason = %rejection.reason, "Connection rejected");
		let reason = rejection.to_string();
		self.write(&ToClient::ConnectError {
			code: rejection.code,
			reason: rejection.reason,
		})
		.await;
		reason
	}

	/// Handshake, authentication and attach. On failure the client has been
	/// told why and the returned reason is the close reason.
	async fn establish(&mut self) -> Result<Attached, String> {
		let first = tokio::select! {
			reason = self.stop.stopped() => return Err(format!("stopped before connect: {reason:?}")),
			frame = self.source.recv() => frame,
		};
		let Some(first) = first else {
			return Err("transport closed before connect".into());
		};

		let params = match self.open.encoding.decode::<ToServer>(&first) {
			Ok(ToServer::Connect { params }) => params,
			Ok(_) => {
				let rejection = ConnectRejection::protocol("first frame must be connect");
				return Err(self.reject(rejection).await);
			}
			Err(err) => {
				let rejection = ConnectRejection::protocol(err.to_string());
				return Err(self.reject(rejection).await);
			}
		};

		self.transition(ConnectionState::Authenticating);

		let factory = match self.router.factory(self.open.key.namespace()) {
			Ok(factory) => factory,
			Err(err) => {
				let rejection = ConnectRejection::new("not_found", err.to_string());
				return Err(self.reject(rejection).await);
			}
		};

		let info = ConnectInfo {
			key: self.open.key.clone(),
			connection_id: self.id,
			headers: self.open.headers.clone(),
		};
		let authenticated = tokio::select! {
			reason = self.stop.stopped() => return Err(format!("stopped during authentication: {reason:?}")),
			result = factory.authenticate(info, params.clone()) => result,
		};
		let authenticated = match authenticated {
			Ok(authenticated) => authenticated,
			Err(rejection) => return Err(self.reject(rejection).await),
		};

		let (outbox_tx, outbox) = mpsc::unbounded_channel();
		let request = AttachRequest {
			id: self.id,
			params,
			headers: self.open.headers.clone(),
			state: authenticated.state,
			outbox: outbox_tx,
		};
		let link = attach(
			self.router.clone(),
			self.open.key.clone(),
			self.open.input.clone(),
			request,
		)
		.await;
		let link = match link {
			Ok(link) => link,
			Err(rejection) => return Err(self.reject(rejection).await),
		};

		self.write(&ToClient::ConnectOk {
			connection_id: self.id.to_string(),
			conn_state: authenticated.payload,
		})
		.await;
		self.transition(ConnectionState::Active);
		info!(generation = link.generation(), "Connection active");

		Ok(Attached { link, outbox })
	}

	async fn serve(&mut self, attached: Attached) -> String {
		let Attached { link, mut outbox } = attached;
		let mut inflight = InFlight::new();
		let mut outstanding = HashSet::new();

		let stopped = self.stop.stopped();
		tokio::pin!(stopped);

		let reason = loop {
			tokio::select! {
				reason = &mut stopped => break format!("{reason:?}").to_lowercase(),
				frame = self.source.recv() => match frame {
					Some(frame) => {
						if let Some(reason) = self.on_frame(&frame, &link, &mut inflight, &mut outstanding).await {
							break reason;
						}
					}
					None => break "transport closed".to_string(),
				},
				Some((request_id, result)) = inflight.next() => {
					outstanding.remove(&request_id);
					self.write(&ToClient::action_response(request_id, result)).await;
				}
				event = outbox.recv() => match event {
					Some(frame) => self.write(&frame).await,
					None => break "instance stopped".to_string(),
				},
			}
		};

		self.transition(ConnectionState::Closing);

		// actions already dispatched run to completion either way
		while let Some((request_id, result)) = inflight.next().await {
			outstanding.remove(&request_id);
			self.write(&ToClient::action_response(request_id, result)).await;
		}
		while let Ok(frame) = outbox.try_recv() {
			self.write(&frame).await;
		}

		if let Err(err) = link.detach(self.id).await {
			debug!(error = %err, "Instance stopped before detach");
		}
		reason
	}

	/// Handle one inbound frame while active. Returns a close reason when
	/// the connection should close.
	async fn on_frame(
		&mut self,
		frame: &[u8],
		link: &InstanceLink,
		inflight: &mut InFlight,
		outstanding: &mut HashSet<String>,
	) -> Option<String> {
		let message = match self.open.encoding.decode::<ToServer>(frame) {
			Ok(message) => message,
			Err(err) => {
				warn!(error = %err, "Dropping undecodable frame");
				return None;
			}
		};

		match message {
			ToServer::Action {
				name,
				args,
				request_id,
			} => {
				if !outstanding.insert(request_id.clone()) {
					warn!(%request_id, "Request id is already in flight");
					let err = ActionError::user(format!("request id {request_id} is already in flight"));
					self.write(&ToClient::action_response(request_id, Err(err))).await;
					return None;
				}

				let invocation = ActionInvocation {
					connection: self.id,
					name,
					args,
					request_id: request_id.clone(),
				};
				let link = link.clone();
				inflight.push(
					async move {
						let result = link.dispatch(invocation).await;
						(request_id, result)
					}
					.boxed(),
				);
				None
			}
			ToServer::Subscribe { event, subscribe } => {
				match link.subscribe(self.id, event, subscribe).await {
					Ok(()) => None,
					Err(_) => Some("instance stopped".to_string()),
				}
			}
			ToServer::Disconnect => Some("client disconnected".to_string()),
			ToServer::Connect { .. } => {
				warn!("Ignoring repeated connect frame");
				None
			}
		}
	}
}

/// Resolve and attach, resolving again when the instance retired in
/// between.
///
/// Must not borrow the connection task: transports are `Send` but not
/// necessarily `Sync`.
async fn attach(
	router: Router,
	key: ActorKey,
	input: Option<Value>,
	request: AttachRequest,
) -> Result<InstanceLink, ConnectRejection> {
	let attempts = router.settings().attach_attempts;
	for attempt in 1..=attempts {
		let link = match router.resolve_with_input(&key, input.clone()).await {
			Ok(link) => link,
			Err(err @ ActorError::InvalidInput { .. }) => {
				return Err(ConnectRejection::invalid_params(err.to_string()));
			}
			Err(err) => {
				error!(error = %err, "Failed to resolve instance");
				return Err(ConnectRejection::internal());
			}
		};

		match link.attach(request.clone()).await {
			Ok(()) => return Ok(link),
			Err(err) if err.is_stale_instance() => {
				debug!(attempt, "Instance retired before attach, resolving again");
			}
			Err(err) => {
				error!(error = %err, "Failed to attach");
				return Err(ConnectRejection::internal());
			}
		}
	}
	error!(attempts, "Gave up attaching to a retiring instance");
	Err(ConnectRejection::internal())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn legal_transitions() {
		use ConnectionState::*;
		assert!(Connecting.can_transition_to(Authenticating));
		assert!(Authenticating.can_transition_to(Closed));
		assert!(Active.can_transition_to(Closing));
		assert!(Closing.can_transition_to(Closed));

		assert!(!Connecting.can_transition_to(Active));
		assert!(!Active.can_transition_to(Closed));
		assert!(!Closed.can_transition_to(Connecting));
	}

	#[test]
	fn open_request_filters_headers() {
		let open = OpenRequest::new(ActorKey::new("counter", "a"))
			.with_headers([("Authorization", "secret"), ("User-Agent", "test")]);
		assert_eq!(open.headers.len(), 1);
		assert_eq!(open.headers["user-agent"], "test");
	}
}
