#![allow(dead_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt as _;
use futures::future::BoxFuture;
use runy_host::ActionContext;
use runy_host::Actor;
use runy_host::ActorConfig;
use runy_host::ActorKey;
use runy_host::ClientEvent;
use runy_host::ConnInfo;
use runy_host::ConnectInfo;
use runy_host::ConnectRejection;
use runy_host::LocalClient;
use runy_host::MemoryDriver;
use runy_host::OpenRequest;
use runy_host::Registry;
use runy_host::Runtime;
use runy_host::RuntimeConfig;
use runy_host::UserError;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use tracing_subscriber::EnvFilter;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env())
		.with_test_writer()
		.try_init();
}

// counter

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterState {
	pub count: i64,
}

pub struct Counter;

impl Actor for Counter {
	type State = CounterState;
	type ConnParams = Value;
	type ConnState = ();
	type Vars = ();
	/// Starting count.
	type Input = i64;
}

fn increment<'a>(mut c: ActionContext<'a, Counter>, (by,): (i64,)) -> BoxFuture<'a, anyhow::Result<i64>> {
	async move {
		c.state_mut().count += by;
		let count = c.state().count;
		c.broadcast("countChanged", vec![json!(count)]);
		Ok(count)
	}
	.boxed()
}

fn get_count<'a>(c: ActionContext<'a, Counter>, _args: Vec<Value>) -> BoxFuture<'a, anyhow::Result<Value>> {
	async move { Ok(json!(c.state().count)) }.boxed()
}

/// Mutates and emits, then fails with a domain error.
fn increment_then_reject<'a>(mut c: ActionContext<'a, Counter>, _args: Vec<Value>) -> BoxFuture<'a, anyhow::Result<Value>> {
	async move {
		c.state_mut().count += 1000;
		c.broadcast("countChanged", vec![json!(c.state().count)]);
		Err(UserError::new("rejected after mutating").into())
	}
	.boxed()
}

fn increment_then_fail<'a>(mut c: ActionContext<'a, Counter>, _args: Vec<Value>) -> BoxFuture<'a, anyhow::Result<Value>> {
	async move {
		c.state_mut().count += 1000;
		Err(anyhow::anyhow!("connection string postgres://admin:hunter2@db"))
	}
	.boxed()
}

fn increment_then_panic<'a>(mut c: ActionContext<'a, Counter>, _args: Vec<Value>) -> BoxFuture<'a, anyhow::Result<Value>> {
	async move {
		c.state_mut().count += 1000;
		if c.state().count > 0 {
			panic!("handler bug");
		}
		Ok(Value::Null)
	}
	.boxed()
}

/// Sleeps for `ms` milliseconds, then increments by one.
fn slow_increment<'a>(mut c: ActionContext<'a, Counter>, (ms,): (u64,)) -> BoxFuture<'a, anyhow::Result<i64>> {
	async move {
		tokio::time::sleep(Duration::from_millis(ms)).await;
		c.state_mut().count += 1;
		Ok(c.state().count)
	}
	.boxed()
}

/// Mutates, then emits an event the counter never declared.
fn broadcast_typo<'a>(mut c: ActionContext<'a, Counter>, _args: ()) -> BoxFuture<'a, anyhow::Result<()>> {
	async move {
		c.state_mut().count += 1;
		c.broadcast("countChnaged", vec![json!(c.state().count)]);
		Ok(())
	}
	.boxed()
}

/// Increments, then sleeps for `ms` milliseconds.
fn increment_then_sleep<'a>(mut c: ActionContext<'a, Counter>, (ms,): (u64,)) -> BoxFuture<'a, anyhow::Result<i64>> {
	async move {
		c.state_mut().count += 1;
		tokio::time::sleep(Duration::from_millis(ms)).await;
		Ok(c.state().count)
	}
	.boxed()
}

pub fn counter_config() -> ActorConfig<Counter> {
	counter_builder().build().unwrap()
}

pub fn counter_builder() -> runy_host::ActorConfigBuilder<Counter> {
	ActorConfig::builder("counter", |_| CounterState::default())
		.create_state(|_, start: i64| CounterState { count: start })
		.events(["countChanged"])
		.action_typed("increment", increment)
		.action("getCount", get_count)
		.action("incrementThenReject", increment_then_reject)
		.action("incrementThenFail", increment_then_fail)
		.action("incrementThenPanic", increment_then_panic)
		.action_typed("slowIncrement", slow_increment)
		.action_typed("incrementThenSleep", increment_then_sleep)
		.action_typed("broadcastTypo", broadcast_typo)
}

// admin: per-connection roles

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vault {
	pub secrets: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct RoleParams {
	pub role: String,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct Role {
	pub role: String,
}

pub struct Admin;

impl Actor for Admin {
	type State = Vault;
	type ConnParams = RoleParams;
	type ConnState = Role;
	type Vars = ();
	type Input = ();
}

fn require_admin(conn: &ConnInfo<Role>) -> Result<(), UserError> {
	if conn.state().role == "admin" {
		Ok(())
	} else {
		Err(UserError::new("Permission denied"))
	}
}

fn get_secrets<'a>(c: ActionContext<'a, Admin>, _args: ()) -> BoxFuture<'a, anyhow::Result<Vec<String>>> {
	async move {
		require_admin(c.conn())?;
		Ok(c.state().secrets.clone())
	}
	.boxed()
}

/// Pushes before checking the role, so a rejected call must be rolled back.
fn add_secret<'a>(mut c: ActionContext<'a, Admin>, (secret,): (String,)) -> BoxFuture<'a, anyhow::Result<usize>> {
	async move {
		c.state_mut().secrets.push(secret);
		require_admin(c.conn())?;
		Ok(c.state().secrets.len())
	}
	.boxed()
}

async fn assign_role(_info: ConnectInfo, params: RoleParams) -> anyhow::Result<Role> {
	if params.role.is_empty() {
		return Err(ConnectRejection::unauthorized("role is required").into());
	}
	Ok(Role { role: params.role })
}

pub fn admin_config() -> ActorConfig<Admin> {
	ActorConfig::builder("admin", |_| Vault {
		secrets: vec!["launch-code".to_string()],
	})
	.create_conn_state(assign_role)
	.action_typed("getSecrets", get_secrets)
	.action_typed("addSecret", add_secret)
	.build()
	.unwrap()
}

// tenant: token auth, headers and presence hooks

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
	pub online: i64,
	pub visits: i64,
}

#[derive(Debug, Deserialize)]
pub struct TokenParams {
	pub token: String,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct Member {
	pub user: String,
	pub headers: BTreeMap<String, String>,
}

pub struct Tenant;

impl Actor for Tenant {
	type State = Presence;
	type ConnParams = TokenParams;
	type ConnState = Member;
	type Vars = ();
	type Input = ();
}

async fn authenticate(info: ConnectInfo, params: TokenParams) -> anyhow::Result<Member> {
	match params.token.as_str() {
		"banned" => Err(ConnectRejection::new("banned", "account suspended").into()),
		token if token.starts_with("user-") => Ok(Member {
			user: token.trim_start_matches("user-").to_string(),
			headers: info.headers,
		}),
		_ => Err(UserError::new("invalid token").into()),
	}
}

fn whoami<'a>(c: ActionContext<'a, Tenant>, _args: ()) -> BoxFuture<'a, anyhow::Result<Value>> {
	async move {
		Ok(json!({
			"user": c.conn().state().user,
			"headers": c.conn().headers(),
			"key": c.key().to_string(),
		}))
	}
	.boxed()
}

fn presence<'a>(c: ActionContext<'a, Tenant>, _args: ()) -> BoxFuture<'a, anyhow::Result<Presence>> {
	async move { Ok(c.state().clone()) }.boxed()
}

pub fn tenant_config() -> ActorConfig<Tenant> {
	ActorConfig::builder("tenant", |_| Presence::default())
		.create_conn_state(authenticate)
		.on_connect(|state: &mut Presence, conn: &ConnInfo<Member>| {
			state.online += 1;
			state.visits += 1;
			if conn.state().user == "crash" {
				panic!("presence tracker crashed on connect");
			}
		})
		.on_disconnect(|state: &mut Presence, conn: &ConnInfo<Member>| {
			state.online -= 1;
			if conn.state().user == "ghost" {
				panic!("presence tracker crashed on disconnect");
			}
		})
		.action_typed("whoami", whoami)
		.action_typed("presence", presence)
		.build()
		.unwrap()
}

// chat: compound keys, subscriptions and targeted sends

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
	pub messages: Vec<String>,
}

pub struct Chat;

impl Actor for Chat {
	type State = Room;
	type ConnParams = Value;
	type ConnState = ();
	type Vars = ();
	type Input = ();
}

fn post<'a>(mut c: ActionContext<'a, Chat>, (text,): (String,)) -> BoxFuture<'a, anyhow::Result<usize>> {
	async move {
		c.state_mut().messages.push(text.clone());
		c.broadcast("message", vec![json!(text)]);
		Ok(c.state().messages.len())
	}
	.boxed()
}

fn post_many<'a>(mut c: ActionContext<'a, Chat>, (texts,): (Vec<String>,)) -> BoxFuture<'a, anyhow::Result<()>> {
	async move {
		for text in texts {
			c.state_mut().messages.push(text.clone());
			c.broadcast("message", vec![json!(text)]);
		}
		Ok(())
	}
	.boxed()
}

fn announce<'a>(mut c: ActionContext<'a, Chat>, (text,): (String,)) -> BoxFuture<'a, anyhow::Result<()>> {
	async move {
		c.broadcast("announcement", vec![json!(text)]);
		Ok(())
	}
	.boxed()
}

fn whisper<'a>(mut c: ActionContext<'a, Chat>, (to, text): (String, String)) -> BoxFuture<'a, anyhow::Result<bool>> {
	async move {
		let target = c
			.connections()
			.map(|conn| conn.id())
			.find(|id| id.to_string() == to);
		let Some(target) = target else {
			return Err(UserError::new("no such connection").into());
		};
		Ok(c.send(target, "whisper", vec![json!(text)]))
	}
	.boxed()
}

fn members<'a>(c: ActionContext<'a, Chat>, _args: ()) -> BoxFuture<'a, anyhow::Result<usize>> {
	async move { Ok(c.connection_count()) }.boxed()
}

pub fn chat_config() -> ActorConfig<Chat> {
	ActorConfig::builder("chat", |_| Room::default())
		.action_typed("post", post)
		.action_typed("postMany", post_many)
		.action_typed("announce", announce)
		.action_typed("whisper", whisper)
		.action_typed("members", members)
		.build()
		.unwrap()
}

// harness

pub fn registry() -> Registry {
	Registry::new()
		.register(counter_config())
		.unwrap()
		.register(admin_config())
		.unwrap()
		.register(tenant_config())
		.unwrap()
		.register(chat_config())
		.unwrap()
}

pub fn start(driver: &MemoryDriver) -> Runtime {
	start_with(driver, RuntimeConfig::default())
}

pub fn start_with(driver: &MemoryDriver, config: RuntimeConfig) -> Runtime {
	init_tracing();
	Runtime::start(registry(), Arc::new(driver.clone()), config).unwrap()
}

pub async fn connect(runtime: &Runtime, key: &ActorKey, params: Value) -> LocalClient {
	let mut client = runtime.connect(OpenRequest::new(key.clone()));
	client.connect(params).await.unwrap();
	client
}

pub async fn next_event(client: &mut LocalClient) -> ClientEvent {
	tokio::time::timeout(WAIT, client.next_event())
		.await
		.expect("timed out waiting for an event")
		.expect("connection closed while waiting for an event")
}

/// Poll `check` until it holds, advancing (possibly paused) time.
pub async fn eventually<F, Fut>(mut check: F)
where
	F: FnMut() -> Fut,
	Fut: Future<Output = bool>,
{
	for _ in 0..500 {
		if check().await {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("condition not reached");
}
