//! A lite-server proxy: terminates client RPC on a chain query protocol,
//! authenticates callers by the local identity they connect to, enforces
//! per-user rate limits, and forwards each call to a pool of upstream
//! lite-servers with health-aware dispatch.

use std::time::{SystemTime, UNIX_EPOCH};

pub mod admin;
pub mod adnl;
pub mod config;
pub mod fanout;
pub mod keys;
pub mod limiter;
pub mod metrics;
pub mod proto;
pub mod proxy;
pub mod signal;
pub mod store;
pub mod upstream;

/// Wall-clock seconds since the Unix epoch.
pub fn unix_now() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_secs()
}
