//! # Weft Wire Protocol
//!
//! Binary framing for the weft collaboration hub. Every message is a
//! self-describing frame carrying one of five bodies: document sync,
//! awareness, file transfer, RPC, or ack, plus the two fixed keepalive
//! frames.
//!
//! The codec is pure and reentrant; it performs no I/O and holds no state
//! beyond the per-message memoized encoding. Identities are derived from the
//! exact emitted bytes: `Message::id()` is `base64(SHA-256(frame))`.
//!
//! ## Frame layout
//!
//! ```text
//! +-------+---------+----------------+-----------+------+------------------+
//! | magic | version | document       | encrypted | type | type-specific    |
//! | YJS   | 0x01    | varstring      | 0|1       | u8   | body             |
//! +-------+---------+----------------+-----------+------+------------------+
//! ```
//!
//! Ping (`YJSping`) and pong (`YJSpong`) are exact 7-byte frames with no
//! further fields. Acks write a zero-length document slot and expose
//! `document() == None`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod message;
pub mod varint;

pub use codec::{
    Frame, MAGIC, PING_FRAME, PONG_FRAME, VERSION, decode, empty_state_vector, empty_update,
    encode_message, encode_ping, encode_pong, is_empty_state_vector, is_empty_update,
};
pub use error::DecodeError;
pub use message::{
    AwarenessPayload, Context, DocPayload, FileDirection, FilePayload, Message, MessageType,
    Payload, Permission, RpcPayload, RpcRequestType, RpcResult, context_keys,
};
