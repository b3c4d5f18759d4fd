use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
	#[error("JSON codec error: {0}")]
	Json(#[from] serde_json::Error),

	#[error("MessagePack encode error: {0}")]
	MessagePackEncode(#[from] rmp_serde::encode::Error),

	#[error("MessagePack decode error: {0}")]
	MessagePackDecode(#[from] rmp_serde::decode::Error),

	#[error("Unknown encoding: {0}")]
	UnknownEncoding(String),
}

/// Wire encoding of a connection, fixed for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Encoding {
	#[default]
	#[serde(rename = "json")]
	Json,
	#[serde(rename = "msgpack")]
	MessagePack,
}

impl Encoding {
	pub fn as_str(&self) -> &'static str {
		match self {
			Encoding::Json => "json",
			Encoding::MessagePack => "msgpack",
		}
	}

	pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
		match self {
			Encoding::Json => Ok(serde_json::to_vec(value)?),
			// named fields keep the tagged enums self-describing
			Encoding::MessagePack => Ok(rmp_serde::to_vec_named(value)?),
		}
	}

	pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
		match self {
			Encoding::Json => Ok(serde_json::from_slice(bytes)?),
			Encoding::MessagePack => Ok(rmp_serde::from_slice(bytes)?),
		}
	}
}

impl FromStr for Encoding {
	type Err = CodecError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"json" => Ok(Encoding::Json),
			"msgpack" | "messagepack" => Ok(Encoding::MessagePack),
			other => Err(CodecError::UnknownEncoding(other.to_string())),
		}
	}
}

impl fmt::Display for Encoding {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
