#![forbid(unsafe_code)]

use bytes::{Bytes, BytesMut};
use prost::Message;
use thiserror::Error;

/// Default maximum size of a single RPC payload.
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 1024 * 1024; // 1 MiB

#[derive(Debug, Error)]
pub enum CodecError {
	#[error("payload exceeds maximum size: len={len} max={max}")]
	PayloadTooLarge {
		len: usize,
		max: usize,
	},

	#[error("protobuf decode error: {0}")]
	Decode(#[from] prost::DecodeError),

	#[error("protobuf encode error: {0}")]
	Encode(#[from] prost::EncodeError),
}

/// Encode a protobuf message into a bus payload.
pub fn encode_payload<M: Message>(msg: &M, max_payload_size: usize) -> Result<Bytes, CodecError> {
	let len = msg.encoded_len();
	if len > max_payload_size {
		return Err(CodecError::PayloadTooLarge {
			len,
			max: max_payload_size,
		});
	}

	let mut buf = BytesMut::with_capacity(len);
	msg.encode(&mut buf)?;
	Ok(buf.freeze())
}

/// Decode a bus payload, refusing anything larger than `max_payload_size`.
pub fn decode_payload<M: Message + Default>(src: &[u8], max_payload_size: usize) -> Result<M, CodecError> {
	if src.len() > max_payload_size {
		return Err(CodecError::PayloadTooLarge {
			len: src.len(),
			max: max_payload_size,
		});
	}

	Ok(M::decode(src)?)
}
