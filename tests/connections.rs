mod common;

use std::cell::Cell;
use std::marker::PhantomData;

use common::*;
use runy_host::ActionError;
use runy_host::ActorKey;
use runy_host::CallError;
use runy_host::ClientError;
use runy_host::ConnectionState;
use runy_host::Encoding;
use runy_host::ErrorKind;
use runy_host::MemoryDriver;
use runy_host::OpenRequest;
use runy_host::protocol::ActionOutcome;
use runy_host::protocol::ToClient;
use runy_host::protocol::ToServer;
use runy_host::transport::ClientEnd;
use runy_host::transport::FrameSink;
use runy_host::transport::FrameSource;
use runy_host::transport::Transport;
use runy_host::transport::TransportClosed;
use serde_json::json;
use tokio::sync::mpsc;

async fn send(client: &ClientEnd, frame: ToServer) {
	let bytes = Encoding::Json.encode(&frame).unwrap();
	client.tx.send(bytes).await.unwrap();
}

async fn recv(client: &mut ClientEnd) -> Option<ToClient> {
	let bytes = tokio::time::timeout(WAIT, client.rx.recv())
		.await
		.expect("timed out waiting for a frame")?;
	Some(Encoding::Json.decode(&bytes).unwrap())
}

fn action(name: &str, args: Vec<serde_json::Value>, request_id: &str) -> ToServer {
	ToServer::Action {
		name: name.into(),
		args,
		request_id: request_id.into(),
	}
}

#[tokio::test]
async fn test_rejected_token_never_activates_the_actor() {
	let driver = MemoryDriver::new();
	let runtime = start(&driver);
	let key = ActorKey::new("tenant", "acme");

	let mut client = runtime.connect(OpenRequest::new(key.clone()));
	let err = client.connect(json!({"token": "forged"})).await.unwrap_err();
	assert_eq!(
		err,
		ClientError::Rejected {
			code: "unauthorized".into(),
			reason: "invalid token".into(),
		}
	);

	assert!(!runtime.is_live(&key));
	assert_eq!(runtime.census().get(&key).activations, 0);
	assert!(driver.is_empty());
	assert_eq!(driver.stats().loads, 0);

	eventually(|| {
		let closed = client.is_closed();
		async move { closed }
	})
	.await;
	runtime.shutdown().await;
}

#[tokio::test]
async fn test_hooks_choose_their_rejection_code() {
	let runtime = start(&MemoryDriver::new());
	let key = ActorKey::new("tenant", "acme");

	let mut client = runtime.connect(OpenRequest::new(key.clone()));
	let err = client.connect(json!({"token": "banned"})).await.unwrap_err();
	assert_eq!(
		err,
		ClientError::Rejected {
			code: "banned".into(),
			reason: "account suspended".into(),
		}
	);

	let mut client = runtime.connect(OpenRequest::new(key));
	let err = client.connect(json!({"nothing": true})).await.unwrap_err();
	let ClientError::Rejected { code, .. } = err else {
		panic!("expected a rejection, got {err:?}");
	};
	assert_eq!(code, "invalid_params");

	runtime.shutdown().await;
}

#[tokio::test]
async fn test_conn_state_and_filtered_headers_reach_handlers() {
	let runtime = start(&MemoryDriver::new());
	let key = ActorKey::new("tenant", "acme");

	let mut client = runtime.connect(OpenRequest::new(key).with_headers([
		("Authorization", "Bearer secret"),
		("Cookie", "session=1"),
		("User-Agent", "tests"),
		("X-Actor-Conn-Token", "abc"),
	]));
	let conn_state = client.connect(json!({"token": "user-ann"})).await.unwrap().clone();
	let headers = json!({"user-agent": "tests", "x-actor-conn-token": "abc"});
	assert_eq!(conn_state, json!({"user": "ann", "headers": headers}));

	let me = client.action("whoami", vec![]).await.unwrap();
	assert_eq!(me["user"], json!("ann"));
	assert_eq!(me["headers"], headers);
	assert_eq!(me["key"], json!("tenant/acme"));

	runtime.shutdown().await;
}

#[tokio::test]
async fn test_permissions_follow_the_connection() {
	let runtime = start(&MemoryDriver::new());
	let key = ActorKey::new("admin", "vault");
	let admin = connect(&runtime, &key, json!({"role": "admin"})).await;
	let viewer = connect(&runtime, &key, json!({"role": "viewer"})).await;

	let err = viewer.action("getSecrets", vec![]).await.unwrap_err();
	assert_eq!(err.kind(), Some(ErrorKind::User));
	assert_eq!(err.to_string(), "User error: Permission denied");

	let err = viewer.action("addSecret", vec![json!("backdoor")]).await.unwrap_err();
	assert_eq!(err.kind(), Some(ErrorKind::User));
	assert_eq!(
		admin.action("getSecrets", vec![]).await.unwrap(),
		json!(["launch-code"])
	);

	assert_eq!(admin.action("addSecret", vec![json!("spare")]).await.unwrap(), json!(2));

	let mut anonymous = runtime.connect(OpenRequest::new(key));
	let err = anonymous.connect(json!({"role": ""})).await.unwrap_err();
	assert!(matches!(err, ClientError::Rejected { code, .. } if code == "unauthorized"));

	runtime.shutdown().await;
}

#[tokio::test]
async fn test_unknown_actor_type_is_not_found() {
	let runtime = start(&MemoryDriver::new());
	let mut client = runtime.connect(OpenRequest::new(ActorKey::new("ghost", "a")));
	let err = client.connect(json!(null)).await.unwrap_err();
	assert!(matches!(err, ClientError::Rejected { code, .. } if code == "not_found"));
	runtime.shutdown().await;
}

#[tokio::test]
async fn test_client_misuse() {
	let runtime = start(&MemoryDriver::new());
	let mut client = runtime.connect(OpenRequest::new(ActorKey::new("counter", "a")));

	let err = client.action("getCount", vec![]).await.unwrap_err();
	assert_eq!(err, CallError::NotConnected);

	client.connect(json!(null)).await.unwrap();
	assert_eq!(
		client.connect(json!(null)).await.unwrap_err(),
		ClientError::AlreadyConnected
	);

	let other = connect(&runtime, &ActorKey::new("counter", "a"), json!(null)).await;
	assert_ne!(client.connection_id(), other.connection_id());
	runtime.shutdown().await;
}

#[tokio::test]
async fn test_first_frame_must_be_connect() {
	let runtime = start(&MemoryDriver::new());
	let (mut client, server) = Transport::pair(8);
	let handle = runtime.serve(
		OpenRequest::new(ActorKey::new("counter", "a")),
		server.rx,
		server.tx,
	);

	send(&client, action("getCount", vec![], "1")).await;
	let frame = recv(&mut client).await.unwrap();
	assert!(matches!(frame, ToClient::ConnectError { code, .. } if code == "protocol"));

	// the server hangs up after rejecting
	assert_eq!(recv(&mut client).await, None);
	assert_eq!(handle.state(), ConnectionState::Closed);
	assert!(!runtime.is_live(&ActorKey::new("counter", "a")));
	runtime.shutdown().await;
}

#[tokio::test]
async fn test_undecodable_handshake_is_a_protocol_error() {
	let runtime = start(&MemoryDriver::new());
	let (mut client, server) = Transport::pair(8);
	runtime.serve(
		OpenRequest::new(ActorKey::new("counter", "a")),
		server.rx,
		server.tx,
	);

	client.tx.send(b"{not json".to_vec()).await.unwrap();
	let frame = recv(&mut client).await.unwrap();
	assert!(matches!(frame, ToClient::ConnectError { code, .. } if code == "protocol"));
	runtime.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_request_id_is_refused() {
	let runtime = start(&MemoryDriver::new());
	let (mut client, server) = Transport::pair(8);
	runtime.serve(
		OpenRequest::new(ActorKey::new("counter", "dup")),
		server.rx,
		server.tx,
	);

	send(&client, ToServer::Connect { params: json!(null) }).await;
	assert!(matches!(
		recv(&mut client).await.unwrap(),
		ToClient::ConnectOk { .. }
	));

	send(&client, action("slowIncrement", vec![json!(100)], "7")).await;
	send(&client, action("slowIncrement", vec![json!(100)], "7")).await;

	let refused = recv(&mut client).await.unwrap();
	assert_eq!(refused.request_id(), Some("7"));
	assert!(matches!(
		refused,
		ToClient::ActionResponse { outcome: ActionOutcome(Err(ActionError { kind: ErrorKind::User, .. })), .. }
	));
	let accepted = recv(&mut client).await.unwrap();
	assert_eq!(accepted, ToClient::action_response("7".into(), Ok(json!(1))));

	// the id is free again once answered
	send(&client, action("getCount", vec![], "7")).await;
	assert_eq!(
		recv(&mut client).await.unwrap(),
		ToClient::action_response("7".into(), Ok(json!(1)))
	);
	runtime.shutdown().await;
}

#[tokio::test]
async fn test_dropped_client_does_not_cancel_its_action() {
	let runtime = start(&MemoryDriver::new());
	let key = ActorKey::new("counter", "orphan");
	let client = connect(&runtime, &key, json!(null)).await;
	let observer = connect(&runtime, &key, json!(null)).await;

	let call = client.call("slowIncrement", vec![json!(100)]).await;
	drop(call);
	drop(client);

	eventually(|| {
		let observer = &observer;
		async move { observer.action("getCount", vec![]).await.unwrap() == json!(1) }
	})
	.await;
	runtime.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_walks_the_state_machine() {
	let runtime = start(&MemoryDriver::new());
	let client = connect(&runtime, &ActorKey::new("counter", "a"), json!(null)).await;
	let handle = client.handle().clone();
	assert_eq!(handle.state(), ConnectionState::Active);

	// in-flight replies are delivered before the close
	let pending = client.call("slowIncrement", vec![json!(50)]).await;
	let reply = tokio::spawn(pending.reply());
	client.disconnect().await;

	assert_eq!(reply.await.unwrap().unwrap(), json!(1));
	let status = handle.status();
	assert_eq!(status.state, ConnectionState::Closed);
	assert_eq!(status.close_reason.as_deref(), Some("client disconnected"));
	runtime.shutdown().await;
}

#[tokio::test]
async fn test_server_side_close() {
	let runtime = start(&MemoryDriver::new());
	let mut client = connect(&runtime, &ActorKey::new("counter", "a"), json!(null)).await;

	client.handle().close();
	assert_eq!(client.next_event().await, None);
	assert!(client.is_closed());

	let err = client.action("getCount", vec![]).await.unwrap_err();
	assert!(matches!(err, CallError::SendFailed(_) | CallError::Closed));
	runtime.shutdown().await;
}

/// A transport end that can move between threads but not be shared.
struct Unshared<T> {
	inner: T,
	_not_sync: PhantomData<Cell<()>>,
}

impl<T> Unshared<T> {
	fn new(inner: T) -> Self {
		Self {
			inner,
			_not_sync: PhantomData,
		}
	}
}

impl FrameSource for Unshared<mpsc::Receiver<Vec<u8>>> {
	async fn recv(&mut self) -> Option<Vec<u8>> {
		self.inner.recv().await
	}
}

impl FrameSink for Unshared<mpsc::Sender<Vec<u8>>> {
	async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportClosed> {
		self.inner.send(frame).await.map_err(|_| TransportClosed)
	}
}

async fn recv_json(client: &mut ClientEnd) -> serde_json::Value {
	let bytes = tokio::time::timeout(WAIT, client.rx.recv())
		.await
		.expect("timed out waiting for a frame")
		.expect("transport closed");
	serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_transport_need_not_be_sync() {
	let runtime = start(&MemoryDriver::new());
	let (mut client, server) = Transport::pair(8);
	runtime.serve(
		OpenRequest::new(ActorKey::new("counter", "unshared")),
		Unshared::new(server.rx),
		Unshared::new(server.tx),
	);

	send(&client, ToServer::Connect { params: json!(null) }).await;
	assert!(matches!(
		recv(&mut client).await.unwrap(),
		ToClient::ConnectOk { .. }
	));
	send(&client, action("getCount", vec![], "1")).await;
	assert_eq!(
		recv(&mut client).await.unwrap(),
		ToClient::action_response("1".into(), Ok(json!(0)))
	);
	runtime.shutdown().await;
}

#[tokio::test]
async fn test_json_wire_shape() {
	let runtime = start(&MemoryDriver::new());
	let (mut client, server) = Transport::pair(8);
	runtime.serve(
		OpenRequest::new(ActorKey::new("counter", "wire")),
		server.rx,
		server.tx,
	);

	client.tx.send(br#"{"type":"connect"}"#.to_vec()).await.unwrap();
	let ok = recv_json(&mut client).await;
	assert_eq!(ok["type"], "connect_ok");
	assert!(ok["connection_id"].is_string());

	client
		.tx
		.send(br#"{"type":"action","action":"increment","args":[5],"request_id":"a"}"#.to_vec())
		.await
		.unwrap();
	// the event and the response are not ordered against each other
	let mut frames = vec![recv_json(&mut client).await, recv_json(&mut client).await];
	frames.sort_by_key(|frame| frame["type"].as_str().unwrap_or_default().to_string());
	assert_eq!(
		frames,
		vec![
			json!({"type": "action_response", "request_id": "a", "ok": true, "value": 5}),
			json!({"type": "event", "event": "countChanged", "args": [5]}),
		]
	);

	client
		.tx
		.send(br#"{"type":"action","action":"explode","args":[],"request_id":"b"}"#.to_vec())
		.await
		.unwrap();
	assert_eq!(
		recv_json(&mut client).await,
		json!({
			"type": "action_response",
			"request_id": "b",
			"ok": false,
			"error_kind": "not_found",
			"message": "unknown action: explode",
		})
	);
	runtime.shutdown().await;
}
