//! One actor per configured upstream lite-server.
//!
//! Owns the external client connection and exposes the two operations the
//! router needs: forwarding a raw query under a deadline and probing the
//! server's chain time. Connection transitions and probe results flow back
//! to the router as tagged events on a shared channel.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::adnl::{AdnlClient, AdnlError, ConnEvent};
use crate::config::Upstream;
use crate::keys::KeyId;
use crate::proto;

/// Events the router consumes, from all upstreams multiplexed onto one
/// channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
	Ready(KeyId),
	Closed(KeyId),
	/// Result of a freshness probe; 0 means the probe failed.
	ChainTime(KeyId, u32),
}

pub enum UpstreamCmd {
	SendRaw {
		payload: Bytes,
		reply: oneshot::Sender<Result<Bytes, AdnlError>>,
	},
	Probe,
}

/// Cloneable address of an upstream actor. Integration tests script fake
/// upstreams by constructing a handle around their own mailbox.
#[derive(Clone)]
pub struct UpstreamHandle {
	pub id: KeyId,
	cmd_tx: mpsc::Sender<UpstreamCmd>,
}

impl UpstreamHandle {
	pub fn new(id: KeyId, cmd_tx: mpsc::Sender<UpstreamCmd>) -> Self {
		UpstreamHandle { id, cmd_tx }
	}

	/// Forwards `payload` verbatim; resolves with the raw response or a
	/// transport error once the deadline passes.
	pub async fn send_raw(&self, payload: Bytes) -> Result<Bytes, AdnlError> {
		let (tx, rx) = oneshot::channel();
		self
			.cmd_tx
			.send(UpstreamCmd::SendRaw { payload, reply: tx })
			.await
			.map_err(|_| AdnlError::Closed)?;
		rx.await.map_err(|_| AdnlError::Closed)?
	}

	/// Requests one freshness probe; the result arrives as a
	/// [`UpstreamEvent::ChainTime`]. Never blocks the caller.
	pub fn request_probe(&self) {
		let _ = self.cmd_tx.try_send(UpstreamCmd::Probe);
	}
}

pub struct UpstreamClient {
	id: KeyId,
	client: AdnlClient,
	deadline: Duration,
	events: mpsc::Sender<UpstreamEvent>,
	cmd_rx: mpsc::Receiver<UpstreamCmd>,
	ct: CancellationToken,
}

impl UpstreamClient {
	/// Spawns the connection task and the actor loop; returns the handle the
	/// router dispatches through.
	pub fn spawn(
		upstream: &Upstream,
		deadline: Duration,
		events: mpsc::Sender<UpstreamEvent>,
		ct: CancellationToken,
	) -> UpstreamHandle {
		let (conn_tx, mut conn_rx) = mpsc::channel(16);
		let client = AdnlClient::connect(upstream.id, upstream.address, conn_tx, ct.clone());

		// Connection transitions become router events.
		let forward = events.clone();
		tokio::spawn(async move {
			while let Some(ev) = conn_rx.recv().await {
				let mapped = match ev {
					ConnEvent::Ready(id) => UpstreamEvent::Ready(id),
					ConnEvent::Closed(id) => UpstreamEvent::Closed(id),
				};
				if forward.send(mapped).await.is_err() {
					return;
				}
			}
		});

		let (cmd_tx, cmd_rx) = mpsc::channel(256);
		let actor = UpstreamClient {
			id: upstream.id,
			client,
			deadline,
			events,
			cmd_rx,
			ct,
		};
		tokio::spawn(actor.run());
		UpstreamHandle::new(upstream.id, cmd_tx)
	}

	async fn run(mut self) {
		loop {
			tokio::select! {
				_ = self.ct.cancelled() => return,
				cmd = self.cmd_rx.recv() => match cmd {
					Some(UpstreamCmd::SendRaw { payload, reply }) => {
						let client = self.client.clone();
						let deadline = self.deadline;
						tokio::spawn(async move {
							let _ = reply.send(client.query(payload, deadline).await);
						});
					},
					Some(UpstreamCmd::Probe) => {
						let client = self.client.clone();
						let deadline = self.deadline;
						let events = self.events.clone();
						let id = self.id;
						tokio::spawn(async move {
							let time = match client.query(proto::masterchain_info_query(), deadline).await {
								Ok(reply) => proto::parse_masterchain_info(&reply).unwrap_or(0),
								Err(e) => {
									debug!(server = %id, "freshness probe failed: {e}");
									0
								},
							};
							let _ = events.send(UpstreamEvent::ChainTime(id, time)).await;
						});
					},
					None => return,
				},
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use futures::{SinkExt, StreamExt};
	use tokio::net::TcpListener;
	use tokio_util::codec::{Framed, LengthDelimitedCodec};

	use super::*;
	use crate::config;

	/// A scripted lite-server: answers every query with the given payload.
	async fn fake_lite_server(listener: TcpListener, answer: Bytes) {
		loop {
			let Ok((stream, _)) = listener.accept().await else {
				return;
			};
			let answer = answer.clone();
			tokio::spawn(async move {
				let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
				while let Some(Ok(frame)) = framed.next().await {
					let mut resp = bytes::BytesMut::from(&frame[..8]);
					resp.extend_from_slice(&answer);
					if framed.send(resp.freeze()).await.is_err() {
						return;
					}
				}
			});
		}
	}

	async fn spawn_against(
		answer: Bytes,
		events: mpsc::Sender<UpstreamEvent>,
		ct: CancellationToken,
	) -> UpstreamHandle {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(fake_lite_server(listener, answer));
		let key = ed25519_dalek::SigningKey::from_bytes(&[1u8; 32]).verifying_key();
		let upstream = config::Upstream {
			id: KeyId::of(&key),
			key,
			address: addr,
		};
		UpstreamClient::spawn(&upstream, Duration::from_secs(2), events, ct)
	}

	#[tokio::test]
	async fn send_raw_forwards_verbatim() {
		let ct = CancellationToken::new();
		let (ev_tx, mut ev_rx) = mpsc::channel(16);
		let handle = spawn_against(Bytes::from_static(b"answer"), ev_tx, ct.clone()).await;
		assert!(matches!(ev_rx.recv().await, Some(UpstreamEvent::Ready(_))));

		let resp = handle.send_raw(Bytes::from_static(b"q")).await.unwrap();
		assert_eq!(&resp[..], b"answer");
		ct.cancel();
	}

	#[tokio::test]
	async fn probe_reports_chain_time() {
		let ct = CancellationToken::new();
		let (ev_tx, mut ev_rx) = mpsc::channel(16);
		let reply = proto::masterchain_info_reply(7, 1_700_000_042, 1_700_000_043);
		let handle = spawn_against(reply, ev_tx, ct.clone()).await;
		assert!(matches!(ev_rx.recv().await, Some(UpstreamEvent::Ready(_))));

		handle.request_probe();
		match ev_rx.recv().await {
			Some(UpstreamEvent::ChainTime(id, t)) => {
				assert_eq!(id, handle.id);
				assert_eq!(t, 1_700_000_042);
			},
			other => panic!("unexpected event {other:?}"),
		}
		ct.cancel();
	}

	#[tokio::test]
	async fn probe_failure_reports_zero() {
		let ct = CancellationToken::new();
		let (ev_tx, mut ev_rx) = mpsc::channel(16);
		// The fake answers probes with garbage, which must parse to 0.
		let handle = spawn_against(Bytes::from_static(b"nonsense"), ev_tx, ct.clone()).await;
		assert!(matches!(ev_rx.recv().await, Some(UpstreamEvent::Ready(_))));

		handle.request_probe();
		assert_eq!(
			ev_rx.recv().await,
			Some(UpstreamEvent::ChainTime(handle.id, 0))
		);
		ct.cancel();
	}
}
