//! Admin command execution.
//!
//! Admin authority is positional: the router only routes an `AdminQuery`
//! envelope here when the caller connected to an admin-designated local
//! identity. Payload-level authentication is deliberately absent.

use bytes::Bytes;
use tracing::warn;

use crate::limiter::RateLimiter;
use crate::proto::{self, AdminCommand, CODE_ADMIN};

/// Parses and executes one admin function, returning the reply to resolve
/// the caller's promise with. Failures are framed errors; the user table is
/// untouched unless the mutation was durably stored.
pub fn execute(limiter: &mut RateLimiter, inner: &[u8]) -> Bytes {
	let command = match proto::parse_admin(inner) {
		Ok(command) => command,
		Err(e) => {
			warn!("invalid admin function: {e}");
			return proto::error_frame(CODE_ADMIN, "admin function not found");
		},
	};
	match command {
		AdminCommand::AddUser {
			pubkey,
			valid_until,
			rate_limit,
		} => match limiter.add_user(pubkey, valid_until, rate_limit) {
			Ok(short_id) => proto::new_user_reply(&pubkey, short_id.as_bytes()),
			Err(e) => {
				warn!("add_user failed: {e}");
				proto::error_frame(CODE_ADMIN, &format!("add_user failed: {e}"))
			},
		},
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use ed25519_dalek::SigningKey;
	use tokio_util::sync::CancellationToken;

	use super::*;
	use crate::keys::{IdentityRegistry, KeyId};
	use crate::metrics::Metrics;
	use crate::store::UserStore;

	fn limiter(dir: &std::path::Path) -> RateLimiter {
		let store = UserStore::open(dir).unwrap();
		let metrics = Arc::new(Metrics::new(
			&mut prometheus_client::registry::Registry::default(),
		));
		RateLimiter::new(store, IdentityRegistry::new(), metrics, CancellationToken::new()).0
	}

	#[test]
	fn add_user_acknowledges_with_short_id() {
		let dir = tempfile::tempdir().unwrap();
		let mut limiter = limiter(dir.path());

		let key = SigningKey::from_bytes(&[9u8; 32]).verifying_key();
		let pubkey = *key.as_bytes();
		let cmd = proto::add_user_command(&pubkey, 4_000_000_000, 25);

		let reply = execute(&mut limiter, &cmd);
		let (echoed, short_id) = proto::parse_new_user(&reply).unwrap();
		assert_eq!(echoed, pubkey);
		assert_eq!(short_id, KeyId::of(&key).0);
	}

	#[test]
	fn garbage_is_admin_invalid() {
		let dir = tempfile::tempdir().unwrap();
		let mut limiter = limiter(dir.path());

		let reply = execute(&mut limiter, b"\x01\x02\x03\x04garbage");
		let frame = proto::parse_error_frame(&reply).unwrap();
		assert_eq!(frame.code, CODE_ADMIN);
	}

	#[test]
	fn semantic_failure_is_admin_invalid() {
		let dir = tempfile::tempdir().unwrap();
		let mut limiter = limiter(dir.path());

		let cmd = proto::add_user_command(&[7u8; 32], 4_000_000_000, -3);
		let reply = execute(&mut limiter, &cmd);
		let frame = proto::parse_error_frame(&reply).unwrap();
		assert_eq!(frame.code, CODE_ADMIN);
	}
}
