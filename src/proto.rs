//! The fixed RPC envelope the proxy understands.
//!
//! Everything inside a [`Envelope::Query`] is opaque and forwarded verbatim;
//! the proxy only parses replies far enough to (a) pull the chain time out of
//! a freshness-probe answer, (b) recognise a framed error object and read its
//! message for the refire allow-list test, and (c) frame its own errors.
//!
//! Tags are little-endian `u32` constructor ids assigned by the RPC schema.
//! Variable-length byte strings use the TL convention: a one-byte length for
//! short strings, `0xFE` plus a three-byte length for long ones, padded with
//! zeroes to a four-byte boundary.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const TAG_QUERY: u32 = 0x798c06df;
pub const TAG_ADMIN_QUERY: u32 = 0x4eac5c3e;
pub const TAG_WAIT_MC_SEQNO: u32 = 0xbaacab1a;
pub const TAG_ERROR: u32 = 0xbba9e148;
pub const TAG_GET_MC_INFO_EXT: u32 = 0x70a671df;
pub const TAG_MC_INFO_EXT: u32 = 0xf5e0cca8;
pub const TAG_ADD_USER: u32 = 0x9bbd4f42;
pub const TAG_NEW_USER: u32 = 0x51a0b3dc;
pub const TAG_USER_RECORD: u32 = 0x3f87a1e5;
pub const TAG_USER_INDEX: u32 = 0x72c83d91;

/// Proxy-originated admission and refire errors.
pub const CODE_PROXY: i32 = 228;
/// Transport and timeout errors framed on behalf of the datagram layer.
pub const CODE_TRANSPORT: i32 = 652;
/// Admin command parse or semantic failures.
pub const CODE_ADMIN: i32 = 400;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtoError {
	#[error("payload truncated")]
	Truncated,
	#[error("unknown constructor {0:#010x}")]
	UnknownTag(u32),
	#[error("malformed byte string")]
	BadBytes,
}

/// Classification of an inbound client payload by envelope tag.
#[derive(Debug, PartialEq, Eq)]
pub enum Envelope {
	/// Ordinary chain query. The inner payload stays opaque.
	Query,
	/// Admin mutation; carries the inner admin function.
	AdminQuery(Bytes),
	/// A `Query` wrapped with a minimum-chain-height request. The whole
	/// payload (prefix included) is forwarded verbatim; the upstream does
	/// the waiting.
	WaitMasterchainSeqno { seqno: i32, timeout_ms: i32 },
}

pub fn classify(payload: &[u8]) -> Result<Envelope, ProtoError> {
	let mut buf = payload;
	if buf.remaining() < 4 {
		return Err(ProtoError::Truncated);
	}
	match buf.get_u32_le() {
		TAG_QUERY => Ok(Envelope::Query),
		TAG_ADMIN_QUERY => {
			let inner = get_bytes(&mut buf)?;
			Ok(Envelope::AdminQuery(inner))
		},
		TAG_WAIT_MC_SEQNO => {
			if buf.remaining() < 8 {
				return Err(ProtoError::Truncated);
			}
			let seqno = buf.get_i32_le();
			let timeout_ms = buf.get_i32_le();
			Ok(Envelope::WaitMasterchainSeqno { seqno, timeout_ms })
		},
		other => Err(ProtoError::UnknownTag(other)),
	}
}

/// Wraps an inner function into a `Query` envelope.
pub fn wrap_query(inner: &[u8]) -> Bytes {
	let mut out = BytesMut::with_capacity(inner.len() + 8);
	out.put_u32_le(TAG_QUERY);
	put_bytes(&mut out, inner);
	out.freeze()
}

pub fn admin_query(inner: &[u8]) -> Bytes {
	let mut out = BytesMut::with_capacity(inner.len() + 8);
	out.put_u32_le(TAG_ADMIN_QUERY);
	put_bytes(&mut out, inner);
	out.freeze()
}

/// A framed error object as produced by an upstream or by the proxy itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFrame {
	pub code: i32,
	pub message: String,
}

pub fn error_frame(code: i32, message: &str) -> Bytes {
	let mut out = BytesMut::with_capacity(message.len() + 12);
	out.put_u32_le(TAG_ERROR);
	out.put_i32_le(code);
	put_bytes(&mut out, message.as_bytes());
	out.freeze()
}

/// Returns the framed error if `payload` is one, `None` for any other shape.
pub fn parse_error_frame(payload: &[u8]) -> Option<ErrorFrame> {
	let mut buf = payload;
	if buf.remaining() < 8 {
		return None;
	}
	if buf.get_u32_le() != TAG_ERROR {
		return None;
	}
	let code = buf.get_i32_le();
	let message = get_bytes(&mut buf).ok()?;
	let message = std::str::from_utf8(&message).ok()?.to_string();
	Some(ErrorFrame { code, message })
}

/// The well-known freshness probe: `getMasterchainInfoExt` in a `Query`.
pub fn masterchain_info_query() -> Bytes {
	let mut inner = BytesMut::with_capacity(8);
	inner.put_u32_le(TAG_GET_MC_INFO_EXT);
	inner.put_i32_le(0); // mode
	wrap_query(&inner)
}

/// Extracts the server-reported chain time from a probe reply. Any parse
/// failure (including an error frame) yields `None`; the caller maps that
/// to chain time 0.
pub fn parse_masterchain_info(reply: &[u8]) -> Option<u32> {
	let mut buf = reply;
	if buf.remaining() < 4 {
		return None;
	}
	if buf.get_u32_le() != TAG_MC_INFO_EXT {
		return None;
	}
	// mode, version, capabilities, last_seqno precede last_utime
	if buf.remaining() < 4 + 4 + 8 + 4 + 4 {
		return None;
	}
	buf.advance(4 + 4 + 8 + 4);
	Some(buf.get_u32_le())
}

/// Builds a `masterchainInfoExt` reply; the lite-server side of the probe.
pub fn masterchain_info_reply(last_seqno: i32, last_utime: u32, now: u32) -> Bytes {
	let mut out = BytesMut::with_capacity(32);
	out.put_u32_le(TAG_MC_INFO_EXT);
	out.put_i32_le(0); // mode
	out.put_i32_le(1); // version
	out.put_i64_le(0); // capabilities
	out.put_i32_le(last_seqno);
	out.put_u32_le(last_utime);
	out.put_u32_le(now);
	out.freeze()
}

/// Admin functions accepted on an admin-designated identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
	AddUser {
		pubkey: [u8; 32],
		valid_until: i64,
		rate_limit: i32,
	},
}

pub fn parse_admin(inner: &[u8]) -> Result<AdminCommand, ProtoError> {
	let mut buf = inner;
	if buf.remaining() < 4 {
		return Err(ProtoError::Truncated);
	}
	match buf.get_u32_le() {
		TAG_ADD_USER => {
			if buf.remaining() < 32 + 8 + 4 {
				return Err(ProtoError::Truncated);
			}
			let mut pubkey = [0u8; 32];
			buf.copy_to_slice(&mut pubkey);
			let valid_until = buf.get_i64_le();
			let rate_limit = buf.get_i32_le();
			Ok(AdminCommand::AddUser {
				pubkey,
				valid_until,
				rate_limit,
			})
		},
		other => Err(ProtoError::UnknownTag(other)),
	}
}

pub fn add_user_command(pubkey: &[u8; 32], valid_until: i64, rate_limit: i32) -> Bytes {
	let mut out = BytesMut::with_capacity(48);
	out.put_u32_le(TAG_ADD_USER);
	out.put_slice(pubkey);
	out.put_i64_le(valid_until);
	out.put_i32_le(rate_limit);
	out.freeze()
}

pub fn new_user_reply(pubkey: &[u8; 32], short_id: &[u8; 32]) -> Bytes {
	let mut out = BytesMut::with_capacity(68);
	out.put_u32_le(TAG_NEW_USER);
	out.put_slice(pubkey);
	out.put_slice(short_id);
	out.freeze()
}

pub fn parse_new_user(reply: &[u8]) -> Result<([u8; 32], [u8; 32]), ProtoError> {
	let mut buf = reply;
	if buf.remaining() < 4 + 64 {
		return Err(ProtoError::Truncated);
	}
	let tag = buf.get_u32_le();
	if tag != TAG_NEW_USER {
		return Err(ProtoError::UnknownTag(tag));
	}
	let mut pubkey = [0u8; 32];
	let mut short_id = [0u8; 32];
	buf.copy_to_slice(&mut pubkey);
	buf.copy_to_slice(&mut short_id);
	Ok((pubkey, short_id))
}

/// The persisted per-user credential record, stored under the raw pubkey.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserRecord {
	pub valid_until: i64,
	pub rate_limit: i32,
}

impl UserRecord {
	pub fn encode(&self) -> Bytes {
		let mut out = BytesMut::with_capacity(16);
		out.put_u32_le(TAG_USER_RECORD);
		out.put_i64_le(self.valid_until);
		out.put_i32_le(self.rate_limit);
		out.freeze()
	}

	pub fn decode(raw: &[u8]) -> Result<Self, ProtoError> {
		let mut buf = raw;
		if buf.remaining() < 16 {
			return Err(ProtoError::Truncated);
		}
		let tag = buf.get_u32_le();
		if tag != TAG_USER_RECORD {
			return Err(ProtoError::UnknownTag(tag));
		}
		Ok(UserRecord {
			valid_until: buf.get_i64_le(),
			rate_limit: buf.get_i32_le(),
		})
	}
}

/// The boot-time enumeration index stored under the well-known `"users"` key.
pub fn encode_user_index(pubkeys: &[[u8; 32]]) -> Bytes {
	let mut out = BytesMut::with_capacity(8 + pubkeys.len() * 32);
	out.put_u32_le(TAG_USER_INDEX);
	out.put_u32_le(pubkeys.len() as u32);
	for pk in pubkeys {
		out.put_slice(pk);
	}
	out.freeze()
}

pub fn decode_user_index(raw: &[u8]) -> Result<Vec<[u8; 32]>, ProtoError> {
	let mut buf = raw;
	if buf.remaining() < 8 {
		return Err(ProtoError::Truncated);
	}
	let tag = buf.get_u32_le();
	if tag != TAG_USER_INDEX {
		return Err(ProtoError::UnknownTag(tag));
	}
	let count = buf.get_u32_le() as usize;
	if buf.remaining() < count * 32 {
		return Err(ProtoError::Truncated);
	}
	let mut out = Vec::with_capacity(count);
	for _ in 0..count {
		let mut pk = [0u8; 32];
		buf.copy_to_slice(&mut pk);
		out.push(pk);
	}
	Ok(out)
}

fn put_bytes(out: &mut BytesMut, data: &[u8]) {
	let len = data.len();
	if len < 254 {
		out.put_u8(len as u8);
	} else {
		out.put_u8(0xfe);
		out.put_u8((len & 0xff) as u8);
		out.put_u8(((len >> 8) & 0xff) as u8);
		out.put_u8(((len >> 16) & 0xff) as u8);
	}
	out.put_slice(data);
	while (out.len() % 4) != 0 {
		out.put_u8(0);
	}
}

fn get_bytes(buf: &mut &[u8]) -> Result<Bytes, ProtoError> {
	if buf.remaining() < 1 {
		return Err(ProtoError::Truncated);
	}
	let first = buf.get_u8();
	let (len, header) = if first == 0xfe {
		if buf.remaining() < 3 {
			return Err(ProtoError::Truncated);
		}
		let mut len = buf.get_u8() as usize;
		len |= (buf.get_u8() as usize) << 8;
		len |= (buf.get_u8() as usize) << 16;
		(len, 4usize)
	} else if first == 0xff {
		return Err(ProtoError::BadBytes);
	} else {
		(first as usize, 1usize)
	};
	if buf.remaining() < len {
		return Err(ProtoError::Truncated);
	}
	let data = Bytes::copy_from_slice(&buf[..len]);
	buf.advance(len);
	let pad = (4 - ((header + len) % 4)) % 4;
	if buf.remaining() < pad {
		return Err(ProtoError::Truncated);
	}
	buf.advance(pad);
	Ok(data)
}
