//! Embedded user-credential store.
//!
//! Keys are raw 32-byte public keys; values are encoded
//! [`UserRecord`](crate::proto::UserRecord)s. A well-known `"users"` index
//! key lists all pubkeys so boot-time enumeration does not depend on
//! iteration order. Single writer: the rate limiter.

use std::path::Path;

use rocksdb::{DB, WriteBatch, WriteOptions};
use thiserror::Error;
use tracing::warn;

use crate::proto::{self, UserRecord};

const USERS_INDEX_KEY: &[u8] = b"users";

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("store: {0}")]
	Db(#[from] rocksdb::Error),
	#[error("corrupt record under {0}")]
	Corrupt(String),
}

pub struct UserStore {
	db: DB,
}

impl UserStore {
	pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
		let mut opts = rocksdb::Options::default();
		opts.create_if_missing(true);
		let db = DB::open(&opts, path)?;
		Ok(UserStore { db })
	}

	/// Durably writes the record and the membership index in one batch.
	/// Returns only after the write is synced; the caller may then update
	/// its in-memory view and acknowledge the admin.
	pub fn put_user(&self, pubkey: &[u8; 32], record: &UserRecord) -> Result<(), StoreError> {
		let mut index = self.read_index()?;
		if !index.contains(pubkey) {
			index.push(*pubkey);
		}

		let mut batch = WriteBatch::default();
		batch.put(pubkey, record.encode());
		batch.put(USERS_INDEX_KEY, proto::encode_user_index(&index));

		let mut write_opts = WriteOptions::default();
		write_opts.set_sync(true);
		self.db.write_opt(batch, &write_opts)?;
		Ok(())
	}

	pub fn get_user(&self, pubkey: &[u8; 32]) -> Result<Option<UserRecord>, StoreError> {
		match self.db.get(pubkey)? {
			None => Ok(None),
			Some(raw) => UserRecord::decode(&raw)
				.map(Some)
				.map_err(|_| StoreError::Corrupt(hex::encode(pubkey))),
		}
	}

	/// Enumerates all stored users. Entries whose record is missing or
	/// corrupt are skipped with a warning rather than failing the boot.
	pub fn list_users(&self) -> Result<Vec<([u8; 32], UserRecord)>, StoreError> {
		let mut out = Vec::new();
		for pubkey in self.read_index()? {
			match self.get_user(&pubkey) {
				Ok(Some(record)) => out.push((pubkey, record)),
				Ok(None) => warn!(user = %hex::encode(pubkey), "indexed user has no record"),
				Err(_) => warn!(user = %hex::encode(pubkey), "broken db on user"),
			}
		}
		Ok(out)
	}

	fn read_index(&self) -> Result<Vec<[u8; 32]>, StoreError> {
		match self.db.get(USERS_INDEX_KEY)? {
			None => Ok(Vec::new()),
			Some(raw) => proto::decode_user_index(&raw)
				.map_err(|_| StoreError::Corrupt("users index".to_string())),
		}
	}
}
