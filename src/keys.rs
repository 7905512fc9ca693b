//! Ed25519 identities.
//!
//! Every peer (upstream lite-server, proxy-local identity, provisioned user)
//! is addressed by a 256-bit short id derived from its public key. Clients
//! connect *to* a local identity; the identity they picked is the
//! authentication fact the router admits on.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyError {
	#[error("io: {0}")]
	Io(#[from] std::io::Error),
	#[error("bad key material in {0}")]
	BadKeyFile(PathBuf),
}

/// 256-bit short identifier of a public key (SHA-256 over the raw key bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(pub [u8; 32]);

impl KeyId {
	pub fn of(key: &VerifyingKey) -> Self {
		KeyId::of_bytes(key.as_bytes())
	}

	pub fn of_bytes(raw: &[u8; 32]) -> Self {
		let digest = Sha256::digest(raw);
		let mut id = [0u8; 32];
		id.copy_from_slice(&digest);
		KeyId(id)
	}

	pub fn as_bytes(&self) -> &[u8; 32] {
		&self.0
	}
}

impl fmt::Display for KeyId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&hex::encode(self.0))
	}
}

// Key ids appear in logs constantly; the derived tuple form is unreadable
// there, so Debug goes through Display.
impl fmt::Debug for KeyId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Display::fmt(self, f)
	}
}

/// Long-term private keys, one raw 32-byte seed file per key, named by the
/// hex short id of the public half.
pub struct Keyring {
	dir: PathBuf,
	keys: HashMap<KeyId, SigningKey>,
}

impl Keyring {
	pub fn open(dir: impl AsRef<Path>) -> Result<Self, KeyError> {
		let dir = dir.as_ref().to_path_buf();
		std::fs::create_dir_all(&dir)?;
		let mut keys = HashMap::new();
		for entry in std::fs::read_dir(&dir)? {
			let path = entry?.path();
			if !path.is_file() {
				continue;
			}
			let raw = std::fs::read(&path)?;
			let seed: [u8; 32] = raw
				.as_slice()
				.try_into()
				.map_err(|_| KeyError::BadKeyFile(path.clone()))?;
			let key = SigningKey::from_bytes(&seed);
			keys.insert(KeyId::of(&key.verifying_key()), key);
		}
		Ok(Keyring { dir, keys })
	}

	/// Generates and durably stores a fresh key, returning its short id.
	pub fn generate(&mut self) -> Result<KeyId, KeyError> {
		let mut seed = [0u8; 32];
		rand::rng().fill_bytes(&mut seed);
		self.add(SigningKey::from_bytes(&seed))
	}

	pub fn add(&mut self, key: SigningKey) -> Result<KeyId, KeyError> {
		let id = KeyId::of(&key.verifying_key());
		std::fs::write(self.dir.join(id.to_string()), key.to_bytes())?;
		self.keys.insert(id, key);
		Ok(id)
	}

	pub fn get(&self, id: &KeyId) -> Option<&SigningKey> {
		self.keys.get(id)
	}

	pub fn ids(&self) -> impl Iterator<Item = &KeyId> {
		self.keys.keys()
	}

	pub fn is_empty(&self) -> bool {
		self.keys.is_empty()
	}
}

/// The set of local identities the datagram endpoint answers for.
///
/// Provisioned pubkeys are opaque addresses here; handshake-level proof of
/// key possession belongs to the transport collaborator. Registration is
/// idempotent; the registry is shared between the server (which advertises
/// the identities), the rate limiter (which registers provisioned users)
/// and the router (which distinguishes admin identities).
#[derive(Clone, Default)]
pub struct IdentityRegistry {
	inner: Arc<RwLock<HashMap<KeyId, [u8; 32]>>>,
}

impl IdentityRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns true if the identity was not previously registered.
	pub fn register(&self, pubkey: [u8; 32]) -> bool {
		let id = KeyId::of_bytes(&pubkey);
		self
			.inner
			.write()
			.expect("identity registry lock")
			.insert(id, pubkey)
			.is_none()
	}

	pub fn contains(&self, id: &KeyId) -> bool {
		self
			.inner
			.read()
			.expect("identity registry lock")
			.contains_key(id)
	}

	pub fn len(&self) -> usize {
		self.inner.read().expect("identity registry lock").len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn test_key(seed: u8) -> SigningKey {
		SigningKey::from_bytes(&[seed; 32])
	}

	#[test]
	fn short_id_is_stable() {
		let key = test_key(1).verifying_key();
		assert_eq!(KeyId::of(&key), KeyId::of(&key));
		assert_ne!(KeyId::of(&key), KeyId::of(&test_key(2).verifying_key()));
	}

	#[test]
	fn keyring_round_trip() {
		let dir = tempfile::tempdir().unwrap();
		let id = {
			let mut ring = Keyring::open(dir.path()).unwrap();
			ring.add(test_key(3)).unwrap()
		};
		let reloaded = Keyring::open(dir.path()).unwrap();
		assert!(reloaded.get(&id).is_some());
		assert_eq!(reloaded.ids().count(), 1);
	}

	#[test]
	fn registry_registration_is_idempotent() {
		let registry = IdentityRegistry::new();
		let key = test_key(4).verifying_key();
		assert!(registry.register(*key.as_bytes()));
		assert!(!registry.register(*key.as_bytes()));
		assert_eq!(registry.len(), 1);
		assert!(registry.contains(&KeyId::of(&key)));
	}
}
