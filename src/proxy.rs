//! The proxy router: admit, authenticate, rate-limit, dispatch, resolve.
//!
//! A single actor owns the upstream pool, the freshness tracker and the hot
//! set. Everything it does between suspension points is synchronous; all
//! communication with upstream clients, the rate limiter and in-flight
//! collectors is by message.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use rand::seq::IndexedRandom;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adnl::InboundQuery;
use crate::config::{DispatchMode, ServerConfig};
use crate::fanout::{self, InFlight};
use crate::keys::KeyId;
use crate::limiter::{self, Admission, LimiterHandle, UserTable};
use crate::metrics::{Metrics, QueryOutcome, Transition};
use crate::proto::{self, CODE_PROXY, CODE_TRANSPORT, Envelope};
use crate::unix_now;
use crate::upstream::{UpstreamEvent, UpstreamHandle};

pub struct RouterConfig {
	pub mode: DispatchMode,
	pub freshness: Duration,
	pub probe_window_polls: u32,
	pub refire_allowlist: Arc<Vec<String>>,
	pub max_refire: u32,
	pub refire_delay: Duration,
}

impl RouterConfig {
	pub fn new(cfg: &ServerConfig, mode: DispatchMode) -> Self {
		RouterConfig {
			mode,
			freshness: Duration::from_secs(cfg.freshness_seconds),
			probe_window_polls: cfg.probe_window_polls,
			refire_allowlist: Arc::new(cfg.refire_allowlist.clone()),
			max_refire: cfg.max_refire,
			refire_delay: Duration::from_millis(cfg.refire_delay_ms),
		}
	}
}

pub struct Router {
	cfg: RouterConfig,
	upstreams: HashMap<KeyId, UpstreamHandle>,
	connected: HashSet<KeyId>,
	chain_time: HashMap<KeyId, u32>,
	hot_set: Vec<KeyId>,
	probe_results: u32,
	usage: HashMap<KeyId, u32>,
	users: Arc<ArcSwap<UserTable>>,
	admin_ids: HashSet<KeyId>,
	limiter: LimiterHandle,
	metrics: Arc<Metrics>,
	inited: bool,
	inbound_rx: mpsc::Receiver<InboundQuery>,
	events_rx: mpsc::Receiver<UpstreamEvent>,
	refire_tx: mpsc::Sender<InFlight>,
	refire_rx: mpsc::Receiver<InFlight>,
	ct: CancellationToken,
}

impl Router {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		cfg: RouterConfig,
		upstreams: Vec<UpstreamHandle>,
		users: Arc<ArcSwap<UserTable>>,
		admin_ids: HashSet<KeyId>,
		limiter: LimiterHandle,
		metrics: Arc<Metrics>,
		inbound_rx: mpsc::Receiver<InboundQuery>,
		events_rx: mpsc::Receiver<UpstreamEvent>,
		ct: CancellationToken,
	) -> Router {
		let (refire_tx, refire_rx) = mpsc::channel(256);
		Router {
			cfg,
			upstreams: upstreams.into_iter().map(|u| (u.id, u)).collect(),
			connected: HashSet::new(),
			chain_time: HashMap::new(),
			hot_set: Vec::new(),
			probe_results: 0,
			usage: HashMap::new(),
			users,
			admin_ids,
			limiter,
			metrics,
			inited: false,
			inbound_rx,
			events_rx,
			refire_tx,
			refire_rx,
			ct,
		}
	}

	pub async fn run(mut self) {
		let period = Duration::from_secs(1);
		let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
		loop {
			tokio::select! {
				_ = self.ct.cancelled() => return,
				_ = tick.tick() => self.on_tick(),
				query = self.inbound_rx.recv() => match query {
					Some(q) => {
						self.handle_inflight(InFlight {
							src: q.src,
							dst: q.dst,
							payload: q.payload,
							reply: q.reply,
							depth: 0,
						}).await;
					},
					None => return,
				},
				// Never yields None: the router holds its own refire sender.
				Some(refired) = self.refire_rx.recv() => {
					self.metrics.record_refire();
					self.handle_inflight(refired).await;
				},
				event = self.events_rx.recv() => match event {
					Some(ev) => self.on_event(ev),
					None => return,
				},
			}
		}
	}

	/// Admission order: refire budget, readiness, envelope routing, rate
	/// limit, dispatch. Exactly one resolution leaves this path.
	async fn handle_inflight(&mut self, request: InFlight) {
		if request.depth > self.cfg.max_refire {
			error!(dst = %request.dst, depth = request.depth, "too deep refire");
			self.metrics.record_query(QueryOutcome::RefireExhausted);
			let _ = request.reply.send(proto::error_frame(CODE_PROXY, "too deep refire"));
			return;
		}

		if !self.inited {
			self.metrics.record_query(QueryOutcome::NotReady);
			let _ = request.reply.send(proto::error_frame(CODE_PROXY, "Server not ready"));
			return;
		}

		debug!(dst = %request.dst, "got query");

		let envelope = match proto::classify(&request.payload) {
			Ok(envelope) => envelope,
			Err(e) => {
				debug!(src = %request.src, "unroutable payload: {e}");
				self.metrics.record_query(QueryOutcome::BadEnvelope);
				let _ = request
					.reply
					.send(proto::error_frame(CODE_TRANSPORT, "unknown envelope"));
				return;
			},
		};

		if let Envelope::AdminQuery(inner) = envelope {
			if self.admin_ids.contains(&request.dst) {
				info!(admin = %request.dst, "got admin query");
				self.metrics.record_query(QueryOutcome::Admin);
				self.limiter.execute(inner, request.reply).await;
			} else {
				self.metrics.record_query(QueryOutcome::Unauthorised);
				let _ = request
					.reply
					.send(proto::error_frame(CODE_PROXY, "Unauthorised"));
			}
			return;
		}

		// Admins bypass the user table; everyone else is charged against
		// this window's budget for the identity they connected to.
		if !self.admin_ids.contains(&request.dst) {
			let users = self.users.load();
			match limiter::admit(&users, &mut self.usage, &request.dst, unix_now() as i64) {
				Admission::Ok => {},
				Admission::Unknown => {
					self.metrics.record_query(QueryOutcome::Unauthorised);
					let _ = request
						.reply
						.send(proto::error_frame(CODE_PROXY, "Unauthorised"));
					return;
				},
				Admission::Expired | Admission::OverBudget => {
					info!(dst = %request.dst, "drop because of ratelimit");
					self.metrics.record_query(QueryOutcome::Ratelimited);
					let _ = request
						.reply
						.send(proto::error_frame(CODE_PROXY, "Ratelimit"));
					return;
				},
			}
		}

		self.dispatch(request);
	}

	fn dispatch(&mut self, request: InFlight) {
		let from_hot_set = !self.hot_set.is_empty();
		let targets: Vec<KeyId> = if from_hot_set {
			self.hot_set.clone()
		} else {
			self.connected.iter().copied().collect()
		};
		if targets.is_empty() {
			warn!(dst = %request.dst, "no upstream connection");
			self.metrics.record_query(QueryOutcome::NotReady);
			let _ = request
				.reply
				.send(proto::error_frame(CODE_TRANSPORT, "no upstream connection"));
			return;
		}

		let chosen: Vec<KeyId> = match self.cfg.mode {
			DispatchMode::SinglePick => {
				vec![*targets.choose(&mut rand::rng()).expect("targets non-empty")]
			},
			DispatchMode::Race => targets,
		};

		debug!(
			dst = %request.dst,
			size = request.payload.len(),
			set = if from_hot_set { "uptodate" } else { "all" },
			fanout = chosen.len(),
			"dispatch query"
		);
		self.metrics.record_query(QueryOutcome::Forwarded);

		let payload = request.payload.clone();
		let collector = fanout::spawn(
			request,
			chosen.len(),
			self.cfg.refire_allowlist.clone(),
			self.refire_tx.clone(),
			self.cfg.refire_delay,
		);
		for id in chosen {
			let Some(handle) = self.upstreams.get(&id) else {
				continue;
			};
			let handle = handle.clone();
			let payload = payload.clone();
			let collector = collector.clone();
			tokio::spawn(async move {
				let res = handle.send_raw(payload).await;
				let _ = collector.send((handle.id, res)).await;
			});
		}
	}

	fn on_event(&mut self, event: UpstreamEvent) {
		match event {
			UpstreamEvent::Ready(id) => {
				info!(server = %id, "now available");
				self.metrics.record_transition(Transition::Ready);
				self.connected.insert(id);
				if let Some(handle) = self.upstreams.get(&id) {
					handle.request_probe();
				}
			},
			UpstreamEvent::Closed(id) => {
				info!(server = %id, "disconnected");
				self.metrics.record_transition(Transition::Closed);
				self.connected.remove(&id);
				self.chain_time.remove(&id);
				self.hot_set.retain(|u| u != &id);
			},
			UpstreamEvent::ChainTime(id, time) => {
				if self.connected.contains(&id) {
					self.chain_time.insert(id, time);
				}
				self.probe_results += 1;
				let window = self.upstreams.len() as u32 * self.cfg.probe_window_polls;
				if window > 0 && self.probe_results >= window {
					self.recompute_hot_set();
					self.probe_results = 0;
				}
			},
		}
	}

	fn recompute_hot_set(&mut self) {
		let now = unix_now();
		let fresh = compute_fresh(
			&self.chain_time,
			&self.connected,
			now,
			self.cfg.freshness.as_secs(),
		);
		let outdated = self.chain_time.len() - fresh.len();

		let best = self
			.chain_time
			.iter()
			.max_by_key(|(_, time)| **time)
			.map(|(id, time)| (*id, *time));
		if let Some((id, time)) = best {
			info!(
				uptodate = fresh.len(),
				outdated,
				best_time = %time_ago(now, time as u64),
				best_server = %id,
				"private lite-server stats"
			);
		}

		self.metrics.set_hot_set_size(fresh.len());
		self.hot_set = fresh;
	}

	fn on_tick(&mut self) {
		self.usage.clear();
		self.limiter.request_rehydrate();
		for handle in self.upstreams.values() {
			handle.request_probe();
		}
		if !self.inited {
			self.inited = true;
			info!("proxy initialised, first probe round requested");
		}
	}
}

/// Fresh iff connected and the reported chain time is within the window.
fn compute_fresh(
	chain_time: &HashMap<KeyId, u32>,
	connected: &HashSet<KeyId>,
	now: u64,
	window_secs: u64,
) -> Vec<KeyId> {
	let mut fresh: Vec<KeyId> = chain_time
		.iter()
		.filter(|(id, time)| {
			connected.contains(*id) && now.saturating_sub(**time as u64) <= window_secs
		})
		.map(|(id, _)| *id)
		.collect();
	fresh.sort();
	fresh
}

/// Compact "12s ago" / "in 3m 4s" rendering for the stats log.
fn time_ago(now: u64, ts: u64) -> String {
	let past = now >= ts;
	let mut x = now.abs_diff(ts);
	let body = if x < 60 {
		format!("{x}s")
	} else if x < 3_600 {
		format!("{}m {}s", x / 60, x % 60)
	} else if x < 3_600 * 24 {
		x /= 60;
		format!("{}h {}m", x / 60, x % 60)
	} else {
		x /= 3_600;
		format!("{}d {}h", x / 24, x % 24)
	};
	if past {
		format!("{body} ago")
	} else {
		format!("in {body}")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn id(n: u8) -> KeyId {
		KeyId([n; 32])
	}

	#[test]
	fn freshness_classification() {
		let now = 1_700_000_100u64;
		let chain_time = HashMap::from([
			(id(1), 1_700_000_095u32), // 5s behind
			(id(2), 1_700_000_055),    // 45s behind
			(id(3), 1_700_000_099),    // fresh but disconnected
		]);
		let connected = HashSet::from([id(1), id(2)]);

		assert_eq!(compute_fresh(&chain_time, &connected, now, 30), vec![id(1)]);
	}

	#[test]
	fn freshness_window_is_inclusive() {
		let now = 1_000u64;
		let chain_time = HashMap::from([(id(1), 970u32)]);
		let connected = HashSet::from([id(1)]);
		assert_eq!(compute_fresh(&chain_time, &connected, now, 30), vec![id(1)]);
		assert!(compute_fresh(&chain_time, &connected, now + 1, 30).is_empty());
	}

	#[test]
	fn time_ago_rendering() {
		assert_eq!(time_ago(100, 88), "12s ago");
		assert_eq!(time_ago(100, 100), "0s ago");
		assert_eq!(time_ago(88, 100), "in 12s");
		assert_eq!(time_ago(4_000, 100), "1h 5m ago");
		assert_eq!(time_ago(1_000_000, 100), "11d 13h ago");
	}
}
