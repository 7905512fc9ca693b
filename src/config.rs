//! Server configuration.
//!
//! Loaded once at startup from a JSON file; anything wrong with it is fatal
//! (the process exits 2 rather than limping along with a partial upstream
//! set).

use std::net::SocketAddr;
use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::keys::KeyId;

pub const DEFAULT_FRESHNESS_SECONDS: u64 = 30;
pub const DEFAULT_PROBE_WINDOW_POLLS: u32 = 10;
pub const DEFAULT_MAX_REFIRE: u32 = 10;
pub const DEFAULT_QUERY_DEADLINE_MS: u64 = 2_000;
pub const DEFAULT_REFIRE_DELAY_MS: u64 = 100;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read {path}: {source}")]
	Read {
		path: String,
		source: std::io::Error,
	},
	#[error("failed to parse config: {0}")]
	Parse(#[from] serde_json::Error),
	#[error("invalid config: {0}")]
	Invalid(String),
}

/// How a client query is routed to the upstream pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum DispatchMode {
	/// Forward to one upstream sampled from the hot set.
	SinglePick,
	/// Forward to every upstream in the hot set, first success wins.
	#[default]
	Race,
}

impl DispatchMode {
	/// CLI encoding: 0 = single-pick, 1 = race.
	pub fn from_flag(mode: u32) -> Result<Self, ConfigError> {
		match mode {
			0 => Ok(DispatchMode::SinglePick),
			1 => Ok(DispatchMode::Race),
			other => Err(ConfigError::Invalid(format!(
				"dispatch mode must be 0 or 1, got {other}"
			))),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpstreamConfig {
	pub address: SocketAddr,
	/// Base64-encoded raw Ed25519 public key.
	pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServerConfig {
	pub upstreams: Vec<UpstreamConfig>,
	/// Identities whose `AdminQuery` envelopes reach the rate limiter.
	#[serde(default)]
	pub admin_keys: Vec<String>,
	#[serde(default = "default_freshness")]
	pub freshness_seconds: u64,
	/// Hot-set recomputation period, in probe results per upstream.
	#[serde(default = "default_probe_window")]
	pub probe_window_polls: u32,
	#[serde(default = "default_refire_allowlist")]
	pub refire_allowlist: Vec<String>,
	#[serde(default = "default_max_refire")]
	pub max_refire: u32,
	#[serde(default = "default_query_deadline")]
	pub query_deadline_ms: u64,
	#[serde(default = "default_refire_delay")]
	pub refire_delay_ms: u64,
}

fn default_freshness() -> u64 {
	DEFAULT_FRESHNESS_SECONDS
}

fn default_probe_window() -> u32 {
	DEFAULT_PROBE_WINDOW_POLLS
}

fn default_refire_allowlist() -> Vec<String> {
	// Known race in upstream state snapshots makes these retryable; the list
	// is a workaround, not a policy. Do not extend it casually.
	vec!["not found".to_string(), "get account state".to_string()]
}

fn default_max_refire() -> u32 {
	DEFAULT_MAX_REFIRE
}

fn default_query_deadline() -> u64 {
	DEFAULT_QUERY_DEADLINE_MS
}

fn default_refire_delay() -> u64 {
	DEFAULT_REFIRE_DELAY_MS
}

/// A fully validated upstream entry.
#[derive(Debug, Clone)]
pub struct Upstream {
	pub id: KeyId,
	pub key: VerifyingKey,
	pub address: SocketAddr,
}

impl ServerConfig {
	pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();
		let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
			path: path.display().to_string(),
			source,
		})?;
		let cfg: ServerConfig = serde_json::from_str(&raw)?;
		cfg.validate()?;
		Ok(cfg)
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.upstreams.is_empty() {
			return Err(ConfigError::Invalid(
				"at least one upstream is required".to_string(),
			));
		}
		if self.freshness_seconds == 0 {
			return Err(ConfigError::Invalid(
				"freshnessSeconds must be positive".to_string(),
			));
		}
		if self.probe_window_polls == 0 {
			return Err(ConfigError::Invalid(
				"probeWindowPolls must be positive".to_string(),
			));
		}
		self.resolved_upstreams()?;
		self.admin_identities()?;
		Ok(())
	}

	pub fn resolved_upstreams(&self) -> Result<Vec<Upstream>, ConfigError> {
		self
			.upstreams
			.iter()
			.map(|u| {
				let key = decode_pubkey(&u.public_key)?;
				Ok(Upstream {
					id: KeyId::of(&key),
					key,
					address: u.address,
				})
			})
			.collect()
	}

	pub fn admin_identities(&self) -> Result<Vec<(KeyId, VerifyingKey)>, ConfigError> {
		self
			.admin_keys
			.iter()
			.map(|raw| {
				let key = decode_pubkey(raw)?;
				Ok((KeyId::of(&key), key))
			})
			.collect()
	}
}

fn decode_pubkey(raw: &str) -> Result<VerifyingKey, ConfigError> {
	let bytes = STANDARD
		.decode(raw)
		.map_err(|e| ConfigError::Invalid(format!("bad base64 public key: {e}")))?;
	let bytes: [u8; 32] = bytes
		.as_slice()
		.try_into()
		.map_err(|_| ConfigError::Invalid("public key must be 32 bytes".to_string()))?;
	VerifyingKey::from_bytes(&bytes)
		.map_err(|_| ConfigError::Invalid("not a valid Ed25519 public key".to_string()))
}

#[cfg(test)]
mod tests {
	use ed25519_dalek::SigningKey;

	use super::*;

	fn key_b64(seed: u8) -> String {
		STANDARD.encode(SigningKey::from_bytes(&[seed; 32]).verifying_key().as_bytes())
	}

	#[test]
	fn minimal_config_gets_defaults() {
		let raw = format!(
			r#"{{"upstreams": [{{"address": "127.0.0.1:4443", "publicKey": "{}"}}]}}"#,
			key_b64(1)
		);
		let cfg: ServerConfig = serde_json::from_str(&raw).unwrap();
		cfg.validate().unwrap();
		assert_eq!(cfg.freshness_seconds, 30);
		assert_eq!(cfg.max_refire, 10);
		assert_eq!(
			cfg.refire_allowlist,
			vec!["not found".to_string(), "get account state".to_string()]
		);
		assert_eq!(cfg.resolved_upstreams().unwrap().len(), 1);
	}

	#[test]
	fn rejects_empty_upstreams() {
		let cfg: ServerConfig = serde_json::from_str(r#"{"upstreams": []}"#).unwrap();
		assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
	}

	#[test]
	fn rejects_bad_public_key() {
		let raw = r#"{"upstreams": [{"address": "127.0.0.1:4443", "publicKey": "AAA"}]}"#;
		let cfg: ServerConfig = serde_json::from_str(raw).unwrap();
		assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
	}

	#[test]
	fn dispatch_mode_flags() {
		assert_eq!(DispatchMode::from_flag(0).unwrap(), DispatchMode::SinglePick);
		assert_eq!(DispatchMode::from_flag(1).unwrap(), DispatchMode::Race);
		assert!(DispatchMode::from_flag(2).is_err());
	}
}
