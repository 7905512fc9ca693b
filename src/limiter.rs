//! Per-user admission control and the actor that owns the user table.
//!
//! The limiter is the sole writer of the user table and the sole caller of
//! the persistent store. After every mutation or rehydrate it publishes an
//! immutable snapshot; the router admits against that snapshot and its own
//! per-window usage counters without suspending.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::keys::{IdentityRegistry, KeyId};
use crate::metrics::Metrics;
use crate::proto::UserRecord;
use crate::store::{StoreError, UserStore};
use crate::{admin, unix_now};

/// Immutable admission snapshot, keyed by the short id of the user pubkey.
pub type UserTable = HashMap<KeyId, UserRecord>;

#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
	Ok,
	/// Destination is not a provisioned user identity.
	Unknown,
	/// Wall clock has passed the credential's valid-until.
	Expired,
	/// This window's counter exceeded the configured budget.
	OverBudget,
}

/// Synchronous admission check. Increments the usage counter for `dst`
/// (unknown destinations are not counted) and applies the fixed one-second
/// window: the caller clears `usage` on its tick.
pub fn admit(
	users: &UserTable,
	usage: &mut HashMap<KeyId, u32>,
	dst: &KeyId,
	now: i64,
) -> Admission {
	let Some(record) = users.get(dst) else {
		return Admission::Unknown;
	};
	if now > record.valid_until {
		return Admission::Expired;
	}
	let count = usage.entry(*dst).or_insert(0);
	*count += 1;
	if *count > record.rate_limit.max(0) as u32 {
		Admission::OverBudget
	} else {
		Admission::Ok
	}
}

#[derive(Debug, Error)]
pub enum LimiterError {
	#[error("rate limit must not be negative")]
	NegativeRate,
	#[error(transparent)]
	Store(#[from] StoreError),
}

pub enum AdminMsg {
	/// An admin function from an admin-designated identity; resolves with a
	/// `new_user` acknowledgement or an error frame.
	Execute {
		inner: Bytes,
		reply: oneshot::Sender<Bytes>,
	},
	/// Periodic nudge from the router's tick.
	Rehydrate,
}

#[derive(Clone)]
pub struct LimiterHandle {
	tx: mpsc::Sender<AdminMsg>,
}

impl LimiterHandle {
	pub async fn execute(&self, inner: Bytes, reply: oneshot::Sender<Bytes>) {
		let _ = self.tx.send(AdminMsg::Execute { inner, reply }).await;
	}

	pub fn request_rehydrate(&self) {
		// Coalescing is fine here; the next tick will nudge again.
		let _ = self.tx.try_send(AdminMsg::Rehydrate);
	}
}

struct UserEntry {
	pubkey: [u8; 32],
	record: UserRecord,
}

pub struct RateLimiter {
	store: UserStore,
	users: HashMap<KeyId, UserEntry>,
	snapshot: Arc<ArcSwap<UserTable>>,
	registry: IdentityRegistry,
	metrics: Arc<Metrics>,
	rx: mpsc::Receiver<AdminMsg>,
	ct: CancellationToken,
}

impl RateLimiter {
	pub fn new(
		store: UserStore,
		registry: IdentityRegistry,
		metrics: Arc<Metrics>,
		ct: CancellationToken,
	) -> (Self, LimiterHandle, Arc<ArcSwap<UserTable>>) {
		let (tx, rx) = mpsc::channel(64);
		let snapshot = Arc::new(ArcSwap::from_pointee(UserTable::new()));
		let limiter = RateLimiter {
			store,
			users: HashMap::new(),
			snapshot: snapshot.clone(),
			registry,
			metrics,
			rx,
			ct,
		};
		(limiter, LimiterHandle { tx }, snapshot)
	}

	pub async fn run(mut self) {
		info!("rate limiter start");
		self.rehydrate();
		loop {
			tokio::select! {
				_ = self.ct.cancelled() => return,
				msg = self.rx.recv() => match msg {
					Some(AdminMsg::Execute { inner, reply }) => {
						let resp = admin::execute(&mut self, &inner);
						let _ = reply.send(resp);
					},
					Some(AdminMsg::Rehydrate) => self.rehydrate(),
					None => return,
				},
			}
		}
	}

	/// Loads every non-expired user from the store, registering identities
	/// that are not yet local. Safe to call repeatedly.
	pub fn rehydrate(&mut self) {
		let listed = match self.store.list_users() {
			Ok(listed) => listed,
			Err(e) => {
				warn!("rehydrate failed: {e}");
				return;
			},
		};
		let now = unix_now() as i64;
		for (pubkey, record) in listed {
			if now > record.valid_until {
				continue;
			}
			if self.registry.register(pubkey) {
				info!(
					user = %hex::encode(pubkey),
					valid_until = record.valid_until,
					ratelimit = record.rate_limit,
					"add key from db"
				);
			}
			self
				.users
				.insert(KeyId::of_bytes(&pubkey), UserEntry { pubkey, record });
		}
		self.publish();
	}

	/// Durably stores the credential, then updates the table and registers
	/// the identity. The store write failing leaves memory untouched.
	pub(crate) fn add_user(
		&mut self,
		pubkey: [u8; 32],
		valid_until: i64,
		rate_limit: i32,
	) -> Result<KeyId, LimiterError> {
		if rate_limit < 0 {
			return Err(LimiterError::NegativeRate);
		}
		let id = KeyId::of_bytes(&pubkey);
		let record = UserRecord {
			valid_until,
			rate_limit,
		};
		self.store.put_user(&pubkey, &record)?;
		self.users.insert(id, UserEntry { pubkey, record });
		self.registry.register(pubkey);
		self.publish();
		self.metrics.record_admin_mutation();
		info!(user = %hex::encode(pubkey), valid_until, ratelimit = rate_limit, "add user");
		Ok(id)
	}

	fn publish(&self) {
		let table: UserTable = self
			.users
			.iter()
			.map(|(id, entry)| (*id, entry.record))
			.collect();
		self.snapshot.store(Arc::new(table));
	}
}

#[cfg(test)]
mod tests {
	use ed25519_dalek::SigningKey;

	use super::*;

	fn user_key(seed: u8) -> ([u8; 32], KeyId) {
		let key = SigningKey::from_bytes(&[seed; 32]).verifying_key();
		(*key.as_bytes(), KeyId::of(&key))
	}

	fn test_metrics() -> Arc<Metrics> {
		Arc::new(Metrics::new(&mut prometheus_client::registry::Registry::default()))
	}

	fn limiter(dir: &std::path::Path) -> (RateLimiter, Arc<ArcSwap<UserTable>>) {
		let store = UserStore::open(dir).unwrap();
		let (limiter, _handle, snapshot) = RateLimiter::new(
			store,
			IdentityRegistry::new(),
			test_metrics(),
			CancellationToken::new(),
		);
		(limiter, snapshot)
	}

	#[test]
	fn admit_counts_per_window() {
		let (_, id) = user_key(1);
		let users = UserTable::from([(
			id,
			UserRecord {
				valid_until: i64::MAX,
				rate_limit: 2,
			},
		)]);
		let mut usage = HashMap::new();

		assert_eq!(admit(&users, &mut usage, &id, 0), Admission::Ok);
		assert_eq!(admit(&users, &mut usage, &id, 0), Admission::Ok);
		assert_eq!(admit(&users, &mut usage, &id, 0), Admission::OverBudget);

		// Window boundary: counters reset.
		usage.clear();
		assert_eq!(admit(&users, &mut usage, &id, 0), Admission::Ok);
	}

	#[test]
	fn admit_boundaries() {
		let (_, id) = user_key(1);
		let users = UserTable::from([(
			id,
			UserRecord {
				valid_until: 1_000,
				rate_limit: 0,
			},
		)]);
		let mut usage = HashMap::new();

		// Unknown destination is not counted.
		assert_eq!(
			admit(&users, &mut usage, &user_key(2).1, 0),
			Admission::Unknown
		);
		assert!(usage.is_empty());

		// Exact valid-until equality is still admitted (by budget here: 0).
		assert_eq!(admit(&users, &mut usage, &id, 1_000), Admission::OverBudget);
		// Past it, expiry wins over the budget check.
		assert_eq!(admit(&users, &mut usage, &id, 1_001), Admission::Expired);
	}

	#[tokio::test]
	async fn add_user_is_durable_and_published() {
		let dir = tempfile::tempdir().unwrap();
		let (pubkey, id) = user_key(3);
		{
			let (mut limiter, snapshot) = limiter(dir.path());
			limiter.add_user(pubkey, 4_000_000_000, 7).unwrap();
			assert_eq!(snapshot.load().get(&id).unwrap().rate_limit, 7);
		}
		// A fresh process against the same store sees the same user.
		let (mut limiter, snapshot) = limiter(dir.path());
		limiter.rehydrate();
		assert_eq!(snapshot.load().get(&id).unwrap().rate_limit, 7);
	}

	#[tokio::test]
	async fn add_user_overwrite_keeps_second_state() {
		let dir = tempfile::tempdir().unwrap();
		let (pubkey, id) = user_key(4);
		let (mut limiter, snapshot) = limiter(dir.path());
		limiter.add_user(pubkey, 4_000_000_000, 1).unwrap();
		limiter.add_user(pubkey, 4_000_000_100, 9).unwrap();
		let table = snapshot.load();
		assert_eq!(
			table.get(&id).unwrap(),
			&UserRecord {
				valid_until: 4_000_000_100,
				rate_limit: 9,
			}
		);
		assert_eq!(table.len(), 1);
	}

	#[tokio::test]
	async fn rehydrate_skips_expired_and_is_idempotent() {
		let dir = tempfile::tempdir().unwrap();
		let (live_pk, live_id) = user_key(5);
		let (dead_pk, dead_id) = user_key(6);
		{
			let (mut limiter, _snapshot) = limiter(dir.path());
			limiter.add_user(live_pk, 4_000_000_000, 5).unwrap();
			limiter.add_user(dead_pk, 1, 5).unwrap();
		}

		let store = UserStore::open(dir.path()).unwrap();
		let registry = IdentityRegistry::new();
		let (mut limiter, _handle, snapshot) = RateLimiter::new(
			store,
			registry.clone(),
			test_metrics(),
			CancellationToken::new(),
		);
		limiter.rehydrate();
		assert!(snapshot.load().contains_key(&live_id));
		assert!(!snapshot.load().contains_key(&dead_id));
		assert!(registry.contains(&live_id));
		assert!(!registry.contains(&dead_id));

		let first = snapshot.load_full();
		limiter.rehydrate();
		assert_eq!(*snapshot.load_full(), *first);
		assert_eq!(registry.len(), 1);
	}

	#[tokio::test]
	async fn add_user_rejects_negative_rate() {
		let dir = tempfile::tempdir().unwrap();
		let (pubkey, _) = user_key(7);
		let (mut limiter, snapshot) = limiter(dir.path());
		assert!(matches!(
			limiter.add_user(pubkey, 0, -1),
			Err(LimiterError::NegativeRate)
		));
		assert!(snapshot.load().is_empty());
	}
}
