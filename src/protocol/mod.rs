//! Messages exchanged between a client and an actor over one connection.
//!
//! The transport carries opaque frames; each frame is exactly one
//! [`ToServer`] or [`ToClient`] message in the [`Encoding`] chosen when the
//! connection was opened.
//!
//! ```text
//! {"type":"action","action":"increment","args":[1],"request_id":"7"}
//! {"type":"action_response","request_id":"7","ok":true,"value":1}
//! {"type":"action_response","request_id":"8","ok":false,"error_kind":"user","message":"no"}
//! {"type":"event","event":"countChanged","args":[1]}
//! ```

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::error::ActionError;
use crate::error::ErrorKind;

mod encoding;
mod headers;

pub use encoding::CodecError;
pub use encoding::Encoding;
pub use headers::ALLOWED_PUBLIC_HEADERS;
pub use headers::filter_public_headers;

/// Event name that toggles the wildcard subscription.
pub const ALL_EVENTS: &str = "*";

/// Client to actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToServer {
	/// First frame of every connection.
	Connect {
		#[serde(default)]
		params: Value,
	},
	Action {
		#[serde(rename = "action")]
		name: String,
		#[serde(default)]
		args: Vec<Value>,
		request_id: String,
	},
	Subscribe {
		event: String,
		subscribe: bool,
	},
	Disconnect,
}

/// Actor to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToClient {
	ConnectOk {
		connection_id: String,
		conn_state: Value,
	},
	ConnectError {
		code: String,
		reason: String,
	},
	ActionResponse {
		request_id: String,
		#[serde(flatten)]
		outcome: ActionOutcome,
	},
	Event {
		#[serde(rename = "event")]
		name: String,
		args: Vec<Value>,
	},
}

impl ToClient {
	/// Response frame for a finished action.
	pub fn action_response(request_id: String, result: Result<Value, ActionError>) -> Self {
		ToClient::ActionResponse {
			request_id,
			outcome: ActionOutcome(result),
		}
	}

	/// The request id this frame answers, if it is an action response.
	pub fn request_id(&self) -> Option<&str> {
		match self {
			ToClient::ActionResponse { request_id, .. } => Some(request_id),
			_ => None,
		}
	}
}

/// Result of one action, discriminated on the wire by `ok`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "OutcomeFields", try_from = "OutcomeFields")]
pub struct ActionOutcome(pub Result<Value, ActionError>);

impl ActionOutcome {
	pub fn into_result(self) -> Result<Value, ActionError> {
		self.0
	}
}

#[derive(Serialize, Deserialize)]
struct OutcomeFields {
	ok: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	value: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	error_kind: Option<ErrorKind>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	message: Option<String>,
}

impl From<ActionOutcome> for OutcomeFields {
	fn from(outcome: ActionOutcome) -> Self {
		match outcome.0 {
			Ok(value) => OutcomeFields {
				ok: true,
				value: Some(value),
				error_kind: None,
				message: None,
			},
			Err(err) => OutcomeFields {
				ok: false,
				value: None,
				error_kind: Some(err.kind),
				message: Some(err.message),
			},
		}
	}
}

impl TryFrom<OutcomeFields> for ActionOutcome {
	type Error = &'static str;

	fn try_from(fields: OutcomeFields) -> Result<Self, Self::Error> {
		if fields.ok {
			// `"value": null` reads back as `None`
			return Ok(ActionOutcome(Ok(fields.value.unwrap_or(Value::Null))));
		}
		let kind = fields.error_kind.ok_or("failed action response without error_kind")?;
		Ok(ActionOutcome(Err(ActionError::new(
			kind,
			fields.message.unwrap_or_default(),
		))))
	}
}
