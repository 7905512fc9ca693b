//! Proxy metrics.
//!
//! Counters are labelled by outcome rather than by caller identity; user key
//! ids are high-cardinality and belong in logs, not label sets.

use std::sync::Arc;

use axum::{Router, extract::State, http::StatusCode, routing::get};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tracing::error;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum QueryOutcome {
	Forwarded,
	Ratelimited,
	Unauthorised,
	NotReady,
	RefireExhausted,
	BadEnvelope,
	Admin,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct QueryLabel {
	pub outcome: QueryOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Transition {
	Ready,
	Closed,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TransitionLabel {
	pub event: Transition,
}

pub struct Metrics {
	queries: Family<QueryLabel, Counter>,
	refires: Counter,
	admin_mutations: Counter,
	upstream_transitions: Family<TransitionLabel, Counter>,
	hot_set_size: Gauge,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let registry = registry.sub_registry_with_prefix("liteproxy");

		let queries = Family::<QueryLabel, Counter>::default();
		registry.register(
			"queries",
			"Client queries by admission/dispatch outcome",
			queries.clone(),
		);

		let refires = Counter::default();
		registry.register(
			"refires",
			"Requests rescheduled after a retryable upstream error",
			refires.clone(),
		);

		let admin_mutations = Counter::default();
		registry.register(
			"admin_mutations",
			"Successful admin mutations",
			admin_mutations.clone(),
		);

		let upstream_transitions = Family::<TransitionLabel, Counter>::default();
		registry.register(
			"upstream_transitions",
			"Upstream connection state transitions",
			upstream_transitions.clone(),
		);

		let hot_set_size = Gauge::default();
		registry.register(
			"hot_set_size",
			"Upstreams currently considered fresh",
			hot_set_size.clone(),
		);

		Self {
			queries,
			refires,
			admin_mutations,
			upstream_transitions,
			hot_set_size,
		}
	}

	pub fn record_query(&self, outcome: QueryOutcome) {
		self.queries.get_or_create(&QueryLabel { outcome }).inc();
	}

	pub fn record_refire(&self) {
		self.refires.inc();
	}

	pub fn record_admin_mutation(&self) {
		self.admin_mutations.inc();
	}

	pub fn record_transition(&self, event: Transition) {
		self
			.upstream_transitions
			.get_or_create(&TransitionLabel { event })
			.inc();
	}

	pub fn set_hot_set_size(&self, size: usize) {
		self.hot_set_size.set(size as i64);
	}
}

#[derive(Clone)]
pub struct App {
	registry: Arc<Registry>,
}

impl App {
	pub fn new(registry: Arc<Registry>) -> Self {
		Self { registry }
	}

	pub fn router(&self) -> Router {
		Router::new()
			.route("/metrics", get(metrics_handler))
			.with_state(self.clone())
	}
}

async fn metrics_handler(State(app): State<App>) -> Result<String, StatusCode> {
	let mut buffer = String::new();
	encode(&mut buffer, &app.registry).map_err(|e| {
		error!("metrics encode failed: {e}");
		StatusCode::INTERNAL_SERVER_ERROR
	})?;
	Ok(buffer)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn outcomes_encode() {
		let mut registry = Registry::default();
		let metrics = Metrics::new(&mut registry);
		metrics.record_query(QueryOutcome::Forwarded);
		metrics.record_query(QueryOutcome::Ratelimited);
		metrics.set_hot_set_size(3);

		let mut out = String::new();
		encode(&mut out, &registry).unwrap();
		assert!(out.contains("liteproxy_queries_total"));
		assert!(out.contains("liteproxy_hot_set_size 3"));
	}
}
