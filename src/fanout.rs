//! Per-request reply collection.
//!
//! One collector task exists per in-flight client request. It owns the
//! client promise, counts down the replies it expects, and resolves exactly
//! once: with the first server-accepted answer, with the best remembered
//! soft error once every sibling has reported, or by escalating to a refire
//! when the final reply is a retryable soft error.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::adnl::AdnlError;
use crate::keys::KeyId;
use crate::proto;

/// A client request travelling through dispatch. The promise is move-only;
/// whoever holds the `InFlight` owes the client exactly one resolution.
#[derive(Debug)]
pub struct InFlight {
	pub src: KeyId,
	pub dst: KeyId,
	pub payload: Bytes,
	pub reply: oneshot::Sender<Bytes>,
	pub depth: u32,
}

/// Spawns a collector expecting `expected` replies and returns the channel
/// the per-upstream send tasks report into. A refire request is delivered to
/// `refire_tx` after `refire_delay`, with the depth already incremented.
pub fn spawn(
	request: InFlight,
	expected: usize,
	allowlist: Arc<Vec<String>>,
	refire_tx: mpsc::Sender<InFlight>,
	refire_delay: Duration,
) -> mpsc::Sender<(KeyId, Result<Bytes, AdnlError>)> {
	debug_assert!(expected > 0);
	let (tx, rx) = mpsc::channel(expected.max(1));
	tokio::spawn(collect(request, expected, allowlist, refire_tx, refire_delay, rx));
	tx
}

async fn collect(
	request: InFlight,
	expected: usize,
	allowlist: Arc<Vec<String>>,
	refire_tx: mpsc::Sender<InFlight>,
	refire_delay: Duration,
	mut rx: mpsc::Receiver<(KeyId, Result<Bytes, AdnlError>)>,
) {
	let InFlight {
		src,
		dst,
		payload,
		reply,
		depth,
	} = request;

	let mut remaining = expected;
	let mut prev_soft: Option<Bytes> = None;
	let mut last_err = AdnlError::Closed;

	while let Some((server, res)) = rx.recv().await {
		remaining -= 1;
		match res {
			Ok(data) => match proto::parse_error_frame(&data) {
				None => {
					// Server-accepted answer; first one wins, the rest of the
					// replies die with the channel.
					let _ = reply.send(data);
					return;
				},
				Some(frame) if remaining > 0 => {
					debug!(%server, remaining, "soft error, waiting on siblings: {}", frame.message);
					prev_soft = Some(data);
				},
				Some(frame) => {
					if allowlist.iter().any(|s| frame.message.contains(s)) {
						info!(%dst, depth, "refire on: {}", frame.message);
						tokio::time::sleep(refire_delay).await;
						let _ = refire_tx
							.send(InFlight {
								src,
								dst,
								payload,
								reply,
								depth: depth + 1,
							})
							.await;
						return;
					}
					// Final reply, not retryable: forwarded as-is.
					let _ = reply.send(data);
					return;
				},
			},
			Err(e) => {
				debug!(%server, remaining, "transport error: {e}");
				last_err = e;
				if remaining == 0 {
					let resolution = prev_soft
						.unwrap_or_else(|| proto::error_frame(proto::CODE_TRANSPORT, &last_err.to_string()));
					let _ = reply.send(resolution);
					return;
				}
			},
		}
	}

	// All senders dropped before reporting; surface it as a transport error.
	let resolution =
		prev_soft.unwrap_or_else(|| proto::error_frame(proto::CODE_TRANSPORT, &last_err.to_string()));
	let _ = reply.send(resolution);
}

#[cfg(test)]
mod tests {
	use super::*;

	fn allowlist() -> Arc<Vec<String>> {
		Arc::new(vec![
			"not found".to_string(),
			"get account state".to_string(),
		])
	}

	fn in_flight(depth: u32) -> (InFlight, oneshot::Receiver<Bytes>) {
		let (tx, rx) = oneshot::channel();
		(
			InFlight {
				src: KeyId([1u8; 32]),
				dst: KeyId([2u8; 32]),
				payload: Bytes::from_static(b"query"),
				reply: tx,
				depth,
			},
			rx,
		)
	}

	fn server(n: u8) -> KeyId {
		KeyId([n; 32])
	}

	#[tokio::test]
	async fn first_success_wins() {
		let (req, reply) = in_flight(0);
		let (refire_tx, _refire_rx) = mpsc::channel(1);
		let tx = spawn(req, 3, allowlist(), refire_tx, Duration::ZERO);

		tx.send((server(1), Ok(Bytes::from_static(b"answer"))))
			.await
			.unwrap();
		assert_eq!(&reply.await.unwrap()[..], b"answer");
		// Late siblings are discarded without effect.
		let _ = tx.send((server(2), Ok(Bytes::from_static(b"late")))).await;
	}

	#[tokio::test]
	async fn soft_error_retained_until_last_reply() {
		let (req, reply) = in_flight(0);
		let (refire_tx, _refire_rx) = mpsc::channel(1);
		let tx = spawn(req, 2, allowlist(), refire_tx, Duration::ZERO);

		let soft = proto::error_frame(0, "some upstream trouble");
		tx.send((server(1), Ok(soft.clone()))).await.unwrap();
		tx.send((server(2), Err(AdnlError::Timeout))).await.unwrap();

		assert_eq!(reply.await.unwrap(), soft);
	}

	#[tokio::test]
	async fn sibling_success_beats_soft_error() {
		let (req, reply) = in_flight(0);
		let (refire_tx, _refire_rx) = mpsc::channel(1);
		let tx = spawn(req, 2, allowlist(), refire_tx, Duration::ZERO);

		tx.send((server(1), Ok(proto::error_frame(0, "not found"))))
			.await
			.unwrap();
		tx.send((server(2), Ok(Bytes::from_static(b"real"))))
			.await
			.unwrap();
		assert_eq!(&reply.await.unwrap()[..], b"real");
	}

	#[tokio::test]
	async fn all_transport_errors_resolve_framed() {
		let (req, reply) = in_flight(0);
		let (refire_tx, _refire_rx) = mpsc::channel(1);
		let tx = spawn(req, 2, allowlist(), refire_tx, Duration::ZERO);

		tx.send((server(1), Err(AdnlError::Timeout))).await.unwrap();
		tx.send((server(2), Err(AdnlError::NotConnected)))
			.await
			.unwrap();

		let frame = proto::parse_error_frame(&reply.await.unwrap()).unwrap();
		assert_eq!(frame.code, proto::CODE_TRANSPORT);
	}

	#[tokio::test]
	async fn retryable_final_soft_error_escalates_to_refire() {
		let (req, mut reply) = in_flight(3);
		let (refire_tx, mut refire_rx) = mpsc::channel(1);
		let tx = spawn(req, 1, allowlist(), refire_tx, Duration::ZERO);

		tx.send((server(1), Ok(proto::error_frame(0, "block not found in db"))))
			.await
			.unwrap();

		let refired = refire_rx.recv().await.unwrap();
		assert_eq!(refired.depth, 4);
		assert_eq!(&refired.payload[..], b"query");
		// The promise travelled with the refire, unresolved.
		assert!(reply.try_recv().is_err());
	}

	#[tokio::test]
	async fn non_retryable_final_soft_error_is_forwarded() {
		let (req, reply) = in_flight(0);
		let (refire_tx, mut refire_rx) = mpsc::channel(1);
		let tx = spawn(req, 1, allowlist(), refire_tx, Duration::ZERO);

		let soft = proto::error_frame(0, "permanently broken");
		tx.send((server(1), Ok(soft.clone()))).await.unwrap();

		assert_eq!(reply.await.unwrap(), soft);
		assert!(refire_rx.try_recv().is_err());
	}
}
