//! In-process protocol client.
//!
//! Speaks the same frames as a remote client, over [`Transport::pair`], so
//! everything it observes went through the real connection path.
//!
//! [`Transport::pair`]: crate::transport::Transport::pair

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::connection::ConnectionHandle;
use crate::connection::ConnectionState;
use crate::error::ActionError;
use crate::error::ErrorKind;
use crate::id::ActorKey;
use crate::protocol::ALL_EVENTS;
use crate::protocol::Encoding;
use crate::protocol::ToClient;
use crate::protocol::ToServer;

type Reply = Result<Value, ActionError>;
type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Reply>>>>;

/// Errors while establishing a client connection.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ClientError {
	#[error("Connection rejected ({code}): {reason}")]
	Rejected { code: String, reason: String },
	#[error("Client is already connected")]
	AlreadyConnected,
	#[error("Connection closed")]
	Closed,
	#[error("Invalid connect params: {0}")]
	Params(String),
	#[error("Codec error: {0}")]
	Codec(String),
	#[error("Unexpected frame during handshake: {0}")]
	Protocol(String),
}

/// Errors of a single action call.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CallError {
	#[error("{0}")]
	Action(#[from] ActionError),
	#[error("Client is not connected")]
	NotConnected,
	#[error("Failed to send request: {0}")]
	SendFailed(String),
	#[error("Connection closed before the reply arrived")]
	Closed,
	#[error("Reply timed out after {timeout:?}")]
	Timeout { timeout: Duration },
}

impl CallError {
	/// Kind of the action failure, if the actor answered.
	pub fn kind(&self) -> Option<ErrorKind> {
		match self {
			CallError::Action(err) => Some(err.kind),
			_ => None,
		}
	}
}

/// An event pushed by the actor.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientEvent {
	pub name: String,
	pub args: Vec<Value>,
}

/// Handle returned by [`LocalClient::call`]: await the reply or drop it.
pub struct ActionCall {
	request_id: String,
	receiver: Option<oneshot::Receiver<Reply>>,
	send_error: Option<CallError>,
	timeout: Option<Duration>,
	pending: Option<Pending>,
}

impl ActionCall {
	fn sent(request_id: String, receiver: oneshot::Receiver<Reply>, pending: Pending) -> Self {
		Self {
			request_id,
			receiver: Some(receiver),
			send_error: None,
			timeout: None,
			pending: Some(pending),
		}
	}

	fn failed(request_id: String, error: CallError) -> Self {
		Self {
			request_id,
			receiver: None,
			send_error: Some(error),
			timeout: None,
			pending: None,
		}
	}

	pub fn request_id(&self) -> &str {
		&self.request_id
	}

	/// Give up waiting after `timeout`. The action itself is not cancelled.
	pub fn timeout(mut self, timeout: Duration) -> Self {
		self.timeout = Some(timeout);
		self
	}

	pub async fn reply(mut self) -> Result<Value, CallError> {
		if let Some(err) = self.send_error.take() {
			return Err(err);
		}
		let Some(receiver) = self.receiver.take() else {
			return Err(CallError::Closed);
		};

		let received = match self.timeout {
			Some(timeout) => match tokio::time::timeout(timeout, receiver).await {
				Ok(received) => received,
				Err(_) => {
					if let Some(pending) = &self.pending {
						pending.lock().remove(&self.request_id);
					}
					return Err(CallError::Timeout { timeout });
				}
			},
			None => receiver.await,
		};

		match received {
			Ok(reply) => reply.map_err(CallError::Action),
			Err(_) => Err(CallError::Closed),
		}
	}
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
	fn drop(&mut self) {
		self.0.abort();
	}
}

struct Session {
	connection_id: String,
	conn_state: Value,
	events: mpsc::UnboundedReceiver<ClientEvent>,
	reader: AbortOnDrop,
}

/// A protocol client connected through an in-process transport.
///
/// ```ignore
/// let mut client = runtime.connect(OpenRequest::new(ActorKey::new("counter", "a")));
/// client.connect(serde_json::json!({})).await?;
/// let count = client.action("increment", vec![json!(1)]).await?;
/// ```
pub struct LocalClient {
	key: ActorKey,
	encoding: Encoding,
	handle: ConnectionHandle,
	tx: mpsc::Sender<Vec<u8>>,
	rx: Option<mpsc::Receiver<Vec<u8>>>,
	pending: Pending,
	next_request: AtomicU64,
	session: Option<Session>,
}

impl LocalClient {
	pub(crate) fn new(
		key: ActorKey,
		encoding: Encoding,
		handle: ConnectionHandle,
		tx: mpsc::Sender<Vec<u8>>,
		rx: mpsc::Receiver<Vec<u8>>,
	) -> Self {
		Self {
			key,
			encoding,
			handle,
			tx,
			rx: Some(rx),
			pending: Pending::default(),
			next_request: AtomicU64::new(1),
			session: None,
		}
	}

	pub fn key(&self) -> &ActorKey {
		&self.key
	}

	/// The server-side connection this client talks to.
	pub fn handle(&self) -> &ConnectionHandle {
		&self.handle
	}

	pub fn connection_id(&self) -> Option<&str> {
		self.session
			.as_ref()
			.map(|session| session.connection_id.as_str())
	}

	/// Connection state returned by the actor's `create_conn_state`.
	pub fn conn_state(&self) -> Option<&Value> {
		self.session.as_ref().map(|session| &session.conn_state)
	}

	pub fn is_closed(&self) -> bool {
		self.handle.state() == ConnectionState::Closed
	}

	/// Send `Connect` and wait for the handshake to finish.
	pub async fn connect(&mut self, params: impl Serialize) -> Result<&Value, ClientError> {
		let Some(mut rx) = self.rx.take() else {
			return Err(ClientError::AlreadyConnected);
		};
		let params = serde_json::to_value(params).map_err(|err| ClientError::Params(err.to_string()))?;

		self.send(&ToServer::Connect { params })
			.await
			.map_err(|_| ClientError::Closed)?;

		let frame = rx.recv().await.ok_or(ClientError::Closed)?;
		let frame: ToClient = self
			.encoding
			.decode(&frame)
			.map_err(|err| ClientError::Codec(err.to_string()))?;

		let (connection_id, conn_state) = match frame {
			ToClient::ConnectOk {
				connection_id,
				conn_state,
			} => (connection_id, conn_state),
			ToClient::ConnectError { code, reason } => {
				return Err(ClientError::Rejected { code, reason });
			}
			other => return Err(ClientError::Protocol(format!("{other:?}"))),
		};

		let (events_tx, events) = mpsc::unbounded_channel();
		let reader = tokio::spawn(read_frames(
			rx,
			self.encoding,
			self.pending.clone(),
			events_tx,
		));

		let session = self.session.insert(Session {
			connection_id,
			conn_state,
			events,
			reader: AbortOnDrop(reader),
		});
		Ok(&session.conn_state)
	}

	/// Send an action request. Errors are reported when awaiting the reply.
	pub async fn call(&self, name: impl Into<String>, args: Vec<Value>) -> ActionCall {
		let request_id = self.next_request.fetch_add(1, Ordering::Relaxed).to_string();
		if self.session.is_none() {
			return ActionCall::failed(request_id, CallError::NotConnected);
		}

		let (reply, receiver) = oneshot::channel();
		self.pending.lock().insert(request_id.clone(), reply);

		let frame = ToServer::Action {
			name: name.into(),
			args,
			request_id: request_id.clone(),
		};
		if let Err(err) = self.send(&frame).await {
			self.pending.lock().remove(&request_id);
			return ActionCall::failed(request_id, err);
		}
		ActionCall::sent(request_id, receiver, self.pending.clone())
	}

	/// Call an action and wait for its reply.
	pub async fn action(&self, name: impl Into<String>, args: Vec<Value>) -> Result<Value, CallError> {
		self.call(name, args).await.reply().await
	}

	pub async fn subscribe(&self, event: impl Into<String>) -> Result<(), CallError> {
		self.set_subscription(event.into(), true).await
	}

	/// Unsubscribing from `"*"` stops the default delivery of every event.
	pub async fn unsubscribe(&self, event: impl Into<String>) -> Result<(), CallError> {
		self.set_subscription(event.into(), false).await
	}

	pub async fn unsubscribe_all(&self) -> Result<(), CallError> {
		self.set_subscription(ALL_EVENTS.to_string(), false).await
	}

	async fn set_subscription(&self, event: String, subscribe: bool) -> Result<(), CallError> {
		if self.session.is_none() {
			return Err(CallError::NotConnected);
		}
		self.send(&ToServer::Subscribe { event, subscribe }).await
	}

	/// Wait for the next event. `None` once the connection is gone.
	pub async fn next_event(&mut self) -> Option<ClientEvent> {
		self.session.as_mut()?.events.recv().await
	}

	/// An event that has already arrived, without waiting.
	pub fn try_next_event(&mut self) -> Option<ClientEvent> {
		self.session.as_mut()?.events.try_recv().ok()
	}

	pub fn events(&mut self) -> impl Stream<Item = ClientEvent> + '_ {
		let session = self.session.as_mut();
		let mut events = session.map(|session| &mut session.events);
		futures::stream::poll_fn(move |cx| match events.as_mut() {
			Some(events) => events.poll_recv(cx),
			None => std::task::Poll::Ready(None),
		})
	}

	/// Send `Disconnect` and wait until the server has closed the
	/// connection. Replies still in flight are delivered before that.
	pub async fn disconnect(mut self) {
		if self.send(&ToServer::Disconnect).await.is_err() {
			return;
		}
		if let Some(mut session) = self.session.take() {
			let _ = (&mut session.reader.0).await;
		}
	}

	async fn send(&self, frame: &ToServer) -> Result<(), CallError> {
		let bytes = self
			.encoding
			.encode(frame)
			.map_err(|err| CallError::SendFailed(err.to_string()))?;
		self.tx
			.send(bytes)
			.await
			.map_err(|_| CallError::SendFailed("transport closed".into()))
	}
}

async fn read_frames(
	mut rx: mpsc::Receiver<Vec<u8>>,
	encoding: Encoding,
	pending: Pending,
	events: mpsc::UnboundedSender<ClientEvent>,
) {
	while let Some(frame) = rx.recv().await {
		let frame: ToClient = match encoding.decode(&frame) {
			Ok(frame) => frame,
			Err(err) => {
				warn!(error = %err, "Client dropped an undecodable frame");
				continue;
			}
		};

		match frame {
			ToClient::ActionResponse {
				request_id,
				outcome,
			} => {
				complete(&pending, request_id, outcome.into_result());
			}
			ToClient::Event { name, args } => {
				let _ = events.send(ClientEvent { name, args });
			}
			other => warn!(frame = ?other, "Client got an unexpected frame"),
		}
	}

	// fail every call still waiting
	pending.lock().clear();
}

fn complete(pending: &Pending, request_id: String, reply: Reply) {
	match pending.lock().remove(&request_id) {
		Some(sender) => {
			let _ = sender.send(reply);
		}
		None => warn!(%request_id, "Reply for an unknown request"),
	}
}
