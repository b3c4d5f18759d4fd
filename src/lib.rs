//! A host for stateful, addressable actors.
//!
//! Every actor key has at most one live instance. The instance serializes
//! all actions against its state, persists each change through a
//! [`Driver`](driver::Driver) with compare-and-swap, and pushes events to
//! the clients connected to it.

pub mod broadcast;
mod cancel;
mod census;
mod client;
mod config;
mod connection;
mod context;
mod definition;
mod dispatch;
pub mod driver;
mod envelope;
mod error;
mod id;
mod instance;
pub mod protocol;
mod router;
mod runtime;
pub mod transport;

pub mod prelude {
	pub use super::ActionContext;
	pub use super::Actor;
	pub use super::ActorConfig;
	pub use super::ActorKey;
	pub use super::Registry;
	pub use super::Runtime;
	pub use super::RuntimeConfig;
	pub use super::UserError;
	pub use futures::FutureExt as _;
	pub use futures::future::BoxFuture;
}

pub use cancel::StopReason;
pub use cancel::StopToken;
pub use census::Census;
pub use census::CensusReport;
pub use census::KeyCensus;
pub use client::ActionCall;
pub use client::CallError;
pub use client::ClientError;
pub use client::ClientEvent;
pub use client::LocalClient;
pub use config::LoadRetryConfig;
pub use config::RuntimeConfig;
pub use connection::ConnectionHandle;
pub use connection::ConnectionState;
pub use connection::ConnectionStatus;
pub use connection::OpenRequest;
pub use context::ActionContext;
pub use context::ConnInfo;
pub use context::ConnectInfo;
pub use definition::ActionEntry;
pub use definition::ActionHandler;
pub use definition::Actor;
pub use definition::ActorConfig;
pub use definition::ActorConfigBuilder;
pub use definition::Registry;
pub use dispatch::ActionInvocation;
pub use driver::Driver;
pub use driver::MemoryDriver;
pub use error::ActionError;
pub use error::ActorError;
pub use error::ConfigError;
pub use error::ConnectRejection;
pub use error::DefinitionError;
pub use error::ErrorKind;
pub use error::INTERNAL_ERROR_MESSAGE;
pub use error::UserError;
pub use id::ActorKey;
pub use id::ConnectionId;
pub use instance::InstanceLink;
pub use instance::StateSnapshot;
pub use protocol::Encoding;
pub use router::Router;
pub use runtime::Runtime;
