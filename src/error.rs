use serde::Deserialize;
use serde::Serialize;

use crate::driver::DriverError;
use crate::id::ActorKey;
use crate::protocol::CodecError;

/// Message sent to clients in place of internal failure details.
pub const INTERNAL_ERROR_MESSAGE: &str = "internal error";

/// Wire-level classification of a failed action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
	/// Expected domain rejection raised by the handler, message is safe to show.
	User,
	/// Unknown action, or unknown actor when strict lookup is required.
	NotFound,
	/// Unexpected failure, details stay in the server logs.
	Internal,
	/// Persistence compare-and-swap failed.
	Conflict,
}

impl ErrorKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			ErrorKind::User => "user",
			ErrorKind::NotFound => "not_found",
			ErrorKind::Internal => "internal",
			ErrorKind::Conflict => "conflict",
		}
	}
}

/// A domain error raised from an action handler.
///
/// Handlers return `anyhow::Result`; an error that downcasts to `UserError`
/// is surfaced to the client verbatim, everything else becomes an opaque
/// internal error.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct UserError {
	message: String,
}

impl UserError {
	pub fn new(message: impl Into<String>) -> Self {
		Self {
			message: message.into(),
		}
	}

	pub fn message(&self) -> &str {
		&self.message
	}
}

/// The typed failure of a single action as seen by the caller.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind:?} error: {message}")]
pub struct ActionError {
	pub kind: ErrorKind,
	pub message: String,
}

impl ActionError {
	pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
		Self {
			kind,
			message: message.into(),
		}
	}

	pub fn user(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::User, message)
	}

	pub fn not_found(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::NotFound, message)
	}

	pub fn internal() -> Self {
		Self::new(ErrorKind::Internal, INTERNAL_ERROR_MESSAGE)
	}

	pub fn conflict() -> Self {
		Self::new(
			ErrorKind::Conflict,
			"state was modified concurrently, the action was not applied",
		)
	}

	/// Classify an error returned by a handler.
	///
	/// Only `UserError` keeps its message. The caller is responsible for
	/// logging the original error when the result is internal.
	pub fn from_handler(err: &anyhow::Error) -> Self {
		match err.downcast_ref::<UserError>() {
			Some(user) => Self::user(user.message()),
			None => Self::internal(),
		}
	}
}

/// Rejection returned by a `create_conn_state` hook.
///
/// Hooks may also return a plain `UserError` (mapped to `unauthorized`) or any
/// other error (mapped to `internal`).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {reason}")]
pub struct ConnectRejection {
	pub code: String,
	pub reason: String,
}

impl ConnectRejection {
	pub fn new(code: impl Into<String>, reason: impl Into<String>) -> Self {
		Self {
			code: code.into(),
			reason: reason.into(),
		}
	}

	pub fn unauthorized(reason: impl Into<String>) -> Self {
		Self::new("unauthorized", reason)
	}

	pub fn protocol(reason: impl Into<String>) -> Self {
		Self::new("protocol", reason)
	}

	pub fn invalid_params(reason: impl Into<String>) -> Self {
		Self::new("invalid_params", reason)
	}

	pub fn internal() -> Self {
		Self::new("internal", INTERNAL_ERROR_MESSAGE)
	}

	pub(crate) fn from_hook(err: &anyhow::Error) -> Self {
		if let Some(rejection) = err.downcast_ref::<ConnectRejection>() {
			return rejection.clone();
		}
		match err.downcast_ref::<UserError>() {
			Some(user) => Self::unauthorized(user.message()),
			None => Self::internal(),
		}
	}
}

/// Errors raised while validating an actor definition.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DefinitionError {
	#[error("Actor name must not be empty")]
	EmptyName,

	#[error("Actor name {0:?} must not contain '/'")]
	InvalidName(String),

	#[error("Action name must not be empty")]
	EmptyActionName,

	#[error("Action {0:?} is defined more than once")]
	DuplicateAction(String),

	#[error("Actor {0:?} defines no actions")]
	NoActions(String),

	#[error("Option {field} must be greater than zero")]
	ZeroDuration { field: &'static str },

	#[error("Actor type {0:?} is already registered")]
	DuplicateActor(String),

	#[error("Event name {0:?} is empty or reserved")]
	InvalidEventName(String),
}

/// Errors raised by the runtime itself rather than by user code.
#[derive(thiserror::Error, Debug)]
pub enum ActorError {
	#[error("Unknown actor type: {namespace}")]
	UnknownActor { namespace: String },

	#[error("Actor instance {key} has stopped")]
	Stopped { key: ActorKey },

	#[error("Driver failure for {key}: {source}")]
	Driver {
		key: ActorKey,
		#[source]
		source: DriverError,
	},

	#[error("Failed to decode persisted state of {key}: {reason}")]
	CorruptState { key: ActorKey, reason: String },

	#[error("Invalid create input for {key}: {reason}")]
	InvalidInput { key: ActorKey, reason: String },

	#[error("Invalid actor definition: {0}")]
	Definition(#[from] DefinitionError),

	#[error("Codec error: {0}")]
	Codec(#[from] CodecError),

	#[error("Runtime is shutting down")]
	Shutdown,

	#[error("Internal runtime error: {0}")]
	Internal(String),
}

impl ActorError {
	/// Whether the caller should resolve the key again and retry.
	pub fn is_stale_instance(&self) -> bool {
		matches!(self, ActorError::Stopped { .. })
	}
}

/// Errors raised while loading or validating a `RuntimeConfig`.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
	#[error("Invalid configuration: {field}, reason: {reason}")]
	Invalid { field: &'static str, reason: String },

	#[error("Failed to parse configuration: {0}")]
	Parse(#[from] toml::de::Error),

	#[error("Failed to read configuration file: {0}")]
	Io(#[from] std::io::Error),
}
