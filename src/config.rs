//! Runtime configuration.
//!
//! Every field has a serde default so a partial TOML document is enough:
//!
//! ```toml
//! idle_timeout_ms = 30000
//!
//! [load_retry]
//! attempts = 5
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;

pub const IDLE_TIMEOUT_MS_DEFAULT: u64 = 60_000;
pub const MAILBOX_CAPACITY_DEFAULT: usize = 64;
pub const ATTACH_ATTEMPTS_DEFAULT: usize = 3;
pub const LOAD_RETRY_ATTEMPTS_DEFAULT: u32 = 3;
pub const LOAD_RETRY_BASE_BACKOFF_MS_DEFAULT: u64 = 50;
pub const LOAD_RETRY_MAX_BACKOFF_MS_DEFAULT: u64 = 2_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
	/// How long an instance without connections stays resident.
	#[serde(default = "default_idle_timeout_ms")]
	pub idle_timeout_ms: u64,

	/// Bounded mailbox size of each instance.
	#[serde(default = "default_mailbox_capacity")]
	pub mailbox_capacity: usize,

	/// How many times a connection re-resolves an instance that stopped
	/// between lookup and attach.
	#[serde(default = "default_attach_attempts")]
	pub attach_attempts: usize,

	/// Default action timeout, overridable per actor type.
	#[serde(default)]
	pub action_timeout_ms: Option<u64>,

	#[serde(default)]
	pub load_retry: LoadRetryConfig,
}

/// Backoff for driver I/O failures while hydrating an instance.
/// Saves are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadRetryConfig {
	#[serde(default = "default_load_attempts")]
	pub attempts: u32,

	#[serde(default = "default_base_backoff_ms")]
	pub base_backoff_ms: u64,

	#[serde(default = "default_max_backoff_ms")]
	pub max_backoff_ms: u64,
}

fn default_idle_timeout_ms() -> u64 {
	IDLE_TIMEOUT_MS_DEFAULT
}

fn default_mailbox_capacity() -> usize {
	MAILBOX_CAPACITY_DEFAULT
}

fn default_attach_attempts() -> usize {
	ATTACH_ATTEMPTS_DEFAULT
}

fn default_load_attempts() -> u32 {
	LOAD_RETRY_ATTEMPTS_DEFAULT
}

fn default_base_backoff_ms() -> u64 {
	LOAD_RETRY_BASE_BACKOFF_MS_DEFAULT
}

fn default_max_backoff_ms() -> u64 {
	LOAD_RETRY_MAX_BACKOFF_MS_DEFAULT
}

impl Default for RuntimeConfig {
	fn default() -> Self {
		Self {
			idle_timeout_ms: default_idle_timeout_ms(),
			mailbox_capacity: default_mailbox_capacity(),
			attach_attempts: default_attach_attempts(),
			action_timeout_ms: None,
			load_retry: LoadRetryConfig::default(),
		}
	}
}

impl Default for LoadRetryConfig {
	fn default() -> Self {
		Self {
			attempts: default_load_attempts(),
			base_backoff_ms: default_base_backoff_ms(),
			max_backoff_ms: default_max_backoff_ms(),
		}
	}
}

impl RuntimeConfig {
	pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
		let config: RuntimeConfig = toml::from_str(source)?;
		config.validate()?;
		Ok(config)
	}

	pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let source = std::fs::read_to_string(path)?;
		Self::from_toml_str(&source)
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.idle_timeout_ms == 0 {
			return Err(ConfigError::Invalid {
				field: "idle_timeout_ms",
				reason: "must be greater than zero".into(),
			});
		}
		if self.mailbox_capacity == 0 {
			return Err(ConfigError::Invalid {
				field: "mailbox_capacity",
				reason: "must be greater than zero".into(),
			});
		}
		if self.attach_attempts == 0 {
			return Err(ConfigError::Invalid {
				field: "attach_attempts",
				reason: "must be greater than zero".into(),
			});
		}
		if self.action_timeout_ms == Some(0) {
			return Err(ConfigError::Invalid {
				field: "action_timeout_ms",
				reason: "must be greater than zero when set".into(),
			});
		}
		self.load_retry.validate()
	}

	pub fn idle_timeout(&self) -> Duration {
		Duration::from_millis(self.idle_timeout_ms)
	}

	pub fn action_timeout(&self) -> Option<Duration> {
		self.action_timeout_ms.map(Duration::from_millis)
	}

	pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
		self.idle_timeout_ms = timeout.as_millis() as u64;
		self
	}
}

impl LoadRetryConfig {
	fn validate(&self) -> Result<(), ConfigError> {
		if self.attempts == 0 {
			return Err(ConfigError::Invalid {
				field: "load_retry.attempts",
				reason: "must be at least 1".into(),
			});
		}
		if self.base_backoff_ms > self.max_backoff_ms {
			return Err(ConfigError::Invalid {
				field: "load_retry.base_backoff_ms",
				reason: format!(
					"{} exceeds max_backoff_ms {}",
					self.base_backoff_ms, self.max_backoff_ms
				),
			});
		}
		Ok(())
	}

	/// Delay before retry number `attempt` (1-based), doubling up to the cap.
	pub fn backoff(&self, attempt: u32) -> Duration {
		let factor = 1u64 << attempt.saturating_sub(1).min(16);
		let delay = self.base_backoff_ms.saturating_mul(factor);
		Duration::from_millis(delay.min(self.max_backoff_ms))
	}
}
