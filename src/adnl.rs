//! The authenticated datagram request/response channel the proxy consumes.
//!
//! Real ADNL (UDP framing, handshakes, channel encryption) is a collaborator,
//! not part of this crate; what the proxy needs from it is exactly two
//! shapes, and this module provides them over length-delimited TCP frames:
//!
//! * [`AdnlClient`]: an external client connection to one upstream, keyed by
//!   the peer's public key: `query(payload, deadline)` plus ready/closed
//!   transition reports and reconnect with exponential backoff.
//! * [`AdnlServer`]: the serving side, accepting queries addressed from
//!   `src` to `dst` (both 256-bit key ids), handing them to a subscriber and
//!   writing back exactly one reply per query id.
//!
//! Client frames are `qid:u64 ++ payload` both ways (the peer identity is
//! fixed per connection). Server frames are `src:32 ++ dst:32 ++ qid:u64 ++
//! payload` inbound and `qid:u64 ++ payload` outbound.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::keys::KeyId;

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdnlError {
	#[error("not connected")]
	NotConnected,
	#[error("query timed out")]
	Timeout,
	#[error("connection closed")]
	Closed,
	#[error("io: {0}")]
	Io(String),
}

/// Connection state transitions reported to the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnEvent {
	Ready(KeyId),
	Closed(KeyId),
}

enum ClientCmd {
	Query {
		payload: Bytes,
		reply: oneshot::Sender<Result<Bytes, AdnlError>>,
	},
}

/// Handle to one external client connection. Cloneable; the connection
/// itself is owned by a single task.
#[derive(Clone)]
pub struct AdnlClient {
	cmd_tx: mpsc::Sender<ClientCmd>,
}

impl AdnlClient {
	/// Spawns the connection task. `events` sees a `Ready` after every
	/// successful connect and a `Closed` after every disconnect.
	pub fn connect(
		peer: KeyId,
		addr: SocketAddr,
		events: mpsc::Sender<ConnEvent>,
		ct: CancellationToken,
	) -> AdnlClient {
		let (cmd_tx, cmd_rx) = mpsc::channel(256);
		tokio::spawn(conn_loop(peer, addr, cmd_rx, events, ct));
		AdnlClient { cmd_tx }
	}

	/// Sends one request and awaits the matching reply. The deadline covers
	/// the full round trip; on expiry the caller sees a transport error.
	pub async fn query(&self, payload: Bytes, deadline: Duration) -> Result<Bytes, AdnlError> {
		let (tx, rx) = oneshot::channel();
		self
			.cmd_tx
			.send(ClientCmd::Query { payload, reply: tx })
			.await
			.map_err(|_| AdnlError::Closed)?;
		match tokio::time::timeout(deadline, rx).await {
			Err(_) => Err(AdnlError::Timeout),
			Ok(Err(_)) => Err(AdnlError::Closed),
			Ok(Ok(res)) => res,
		}
	}
}

async fn conn_loop(
	peer: KeyId,
	addr: SocketAddr,
	mut cmd_rx: mpsc::Receiver<ClientCmd>,
	events: mpsc::Sender<ConnEvent>,
	ct: CancellationToken,
) {
	let mut backoff = INITIAL_BACKOFF;
	loop {
		tokio::select! {
			_ = ct.cancelled() => return,
			res = TcpStream::connect(addr) => match res {
				Ok(stream) => {
					info!(server = %peer, %addr, "connected");
					backoff = INITIAL_BACKOFF;
					if events.send(ConnEvent::Ready(peer)).await.is_err() {
						return;
					}
					run_connection(stream, &mut cmd_rx, &ct).await;
					info!(server = %peer, "disconnected");
					if events.send(ConnEvent::Closed(peer)).await.is_err() {
						return;
					}
				},
				Err(e) => {
					debug!(server = %peer, %addr, "connect failed: {e}, retrying in {backoff:?}");
				},
			},
		}
		// Commands arriving while disconnected fail fast instead of queueing
		// behind the backoff.
		let sleep = tokio::time::sleep(backoff);
		tokio::pin!(sleep);
		loop {
			tokio::select! {
				_ = ct.cancelled() => return,
				_ = &mut sleep => break,
				cmd = cmd_rx.recv() => match cmd {
					Some(ClientCmd::Query { reply, .. }) => {
						let _ = reply.send(Err(AdnlError::NotConnected));
					},
					None => return,
				},
			}
		}
		backoff = std::cmp::min(MAX_BACKOFF, backoff * 2);
	}
}

async fn run_connection(
	stream: TcpStream,
	cmd_rx: &mut mpsc::Receiver<ClientCmd>,
	ct: &CancellationToken,
) {
	let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
	// Entries for timed-out queries stay until the reply (or disconnect)
	// clears them; the send below then fails silently.
	let mut pending: HashMap<u64, oneshot::Sender<Result<Bytes, AdnlError>>> = HashMap::new();
	let mut next_qid: u64 = 0;

	loop {
		tokio::select! {
			_ = ct.cancelled() => break,
			cmd = cmd_rx.recv() => match cmd {
				Some(ClientCmd::Query { payload, reply }) => {
					let qid = next_qid;
					next_qid += 1;
					let mut frame = BytesMut::with_capacity(payload.len() + 8);
					frame.put_u64_le(qid);
					frame.extend_from_slice(&payload);
					if let Err(e) = framed.send(frame.freeze()).await {
						let _ = reply.send(Err(AdnlError::Io(e.to_string())));
						break;
					}
					pending.insert(qid, reply);
				},
				None => break,
			},
			frame = framed.next() => match frame {
				Some(Ok(mut buf)) => {
					if buf.len() < 8 {
						warn!("short frame from upstream, dropping");
						continue;
					}
					let qid = (&buf[..8]).get_u64_le();
					let payload = buf.split_off(8).freeze();
					if let Some(tx) = pending.remove(&qid) {
						let _ = tx.send(Ok(payload));
					}
				},
				Some(Err(e)) => {
					debug!("read error: {e}");
					break;
				},
				None => break,
			},
		}
	}

	for (_, tx) in pending.drain() {
		let _ = tx.send(Err(AdnlError::Closed));
	}
}

/// One authenticated client query, as delivered to the router.
///
/// `src` is the authenticated caller, `dst` the local identity the caller
/// connected to. `reply` is the one-shot sink for the response; it must
/// resolve exactly once, which the type enforces by consumption.
#[derive(Debug)]
pub struct InboundQuery {
	pub src: KeyId,
	pub dst: KeyId,
	pub payload: Bytes,
	pub reply: oneshot::Sender<Bytes>,
}

/// The serving endpoint clients connect to.
pub struct AdnlServer {
	local: SocketAddr,
}

impl AdnlServer {
	pub async fn bind(
		addr: SocketAddr,
		subscriber: mpsc::Sender<InboundQuery>,
		ct: CancellationToken,
	) -> std::io::Result<AdnlServer> {
		let listener = TcpListener::bind(addr).await?;
		let local = listener.local_addr()?;
		info!(%local, "lite endpoint listening");
		tokio::spawn(accept_loop(listener, subscriber, ct));
		Ok(AdnlServer { local })
	}

	pub fn local_addr(&self) -> SocketAddr {
		self.local
	}
}

async fn accept_loop(
	listener: TcpListener,
	subscriber: mpsc::Sender<InboundQuery>,
	ct: CancellationToken,
) {
	loop {
		tokio::select! {
			_ = ct.cancelled() => return,
			res = listener.accept() => match res {
				Ok((stream, peer)) => {
					debug!(%peer, "client connected");
					tokio::spawn(serve_connection(stream, subscriber.clone(), ct.child_token()));
				},
				Err(e) => {
					warn!("accept failed: {e}");
				},
			},
		}
	}
}

async fn serve_connection(
	stream: TcpStream,
	subscriber: mpsc::Sender<InboundQuery>,
	ct: CancellationToken,
) {
	let framed = Framed::new(stream, LengthDelimitedCodec::new());
	let (mut sink, mut frames) = framed.split();

	// Replies resolve in any order; a writer task serialises them onto the
	// connection.
	let (resp_tx, mut resp_rx) = mpsc::channel::<Bytes>(64);
	let writer = tokio::spawn(async move {
		while let Some(frame) = resp_rx.recv().await {
			if sink.send(frame).await.is_err() {
				break;
			}
		}
	});

	loop {
		tokio::select! {
			_ = ct.cancelled() => break,
			frame = frames.next() => match frame {
				Some(Ok(buf)) => {
					if buf.len() < 32 + 32 + 8 {
						warn!("short client frame, dropping connection");
						break;
					}
					let mut src = [0u8; 32];
					let mut dst = [0u8; 32];
					src.copy_from_slice(&buf[..32]);
					dst.copy_from_slice(&buf[32..64]);
					let qid = (&buf[64..72]).get_u64_le();
					let payload = Bytes::copy_from_slice(&buf[72..]);

					let (tx, rx) = oneshot::channel();
					let query = InboundQuery {
						src: KeyId(src),
						dst: KeyId(dst),
						payload,
						reply: tx,
					};
					if subscriber.send(query).await.is_err() {
						break;
					}
					let resp_tx = resp_tx.clone();
					tokio::spawn(async move {
						if let Ok(resp) = rx.await {
							let mut frame = BytesMut::with_capacity(resp.len() + 8);
							frame.put_u64_le(qid);
							frame.extend_from_slice(&resp);
							let _ = resp_tx.send(frame.freeze()).await;
						}
					});
				},
				_ => break,
			},
		}
	}
	drop(resp_tx);
	let _ = writer.await;
}
