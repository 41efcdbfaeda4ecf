//! Frame encoding and decoding.
//!
//! Every frame begins with the 3-byte magic `Y J S`. Ping and pong are the
//! exact 7-byte frames `YJSping` / `YJSpong`. Any other frame continues with
//! a version byte, the length-prefixed document name (zero-length for acks),
//! the encrypted flag, the message-type discriminant, and a type-specific
//! body. Unknown discriminants fail decoding; a decoder must never guess.

use crate::error::{DecodeError, Result};
use crate::message::{
    AwarenessPayload, DocPayload, FileDirection, FilePayload, Message, MessageType, Payload,
    Permission, RpcPayload, RpcRequestType, RpcResult,
};
use crate::varint::{Reader, put_varbytes, put_varstring, put_varuint};

/// Protocol magic: `Y J S`
pub const MAGIC: [u8; 3] = [0x59, 0x4A, 0x53];

/// Current protocol version
pub const VERSION: u8 = 0x01;

/// Complete ping frame: `YJSping`
pub const PING_FRAME: [u8; 7] = [0x59, 0x4A, 0x53, 0x70, 0x69, 0x6E, 0x67];

/// Complete pong frame: `YJSpong`
pub const PONG_FRAME: [u8; 7] = [0x59, 0x4A, 0x53, 0x70, 0x6F, 0x6E, 0x67];

/// Awareness body discriminant for presence updates
const AWARENESS_UPDATE: u8 = 1;

/// RPC result kind: success
const RESULT_SUCCESS: u8 = 1;

/// RPC result kind: error
const RESULT_ERROR: u8 = 0;

/// A decoded frame: keepalive or a full message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Keepalive probe
    Ping,
    /// Keepalive reply
    Pong,
    /// A framed message
    Message(Message),
}

/// Encode a ping frame
#[must_use]
pub fn encode_ping() -> [u8; 7] {
    PING_FRAME
}

/// Encode a pong frame
#[must_use]
pub fn encode_pong() -> [u8; 7] {
    PONG_FRAME
}

/// Canonical encoding of an empty state vector: a single varuint `0`
#[must_use]
pub fn empty_state_vector() -> Vec<u8> {
    vec![0]
}

/// Canonical encoding of an empty update: a single varuint `0`
#[must_use]
pub fn empty_update() -> Vec<u8> {
    vec![0]
}

/// Whether `sv` is (an encoding of) the empty state vector
#[must_use]
pub fn is_empty_state_vector(sv: &[u8]) -> bool {
    sv.is_empty() || sv == [0]
}

/// Whether `update` is (an encoding of) the empty update
#[must_use]
pub fn is_empty_update(update: &[u8]) -> bool {
    update.is_empty() || update == [0]
}

/// Encode a message into a fresh frame buffer
///
/// Infallible: `Message` constructors guarantee every variant carries the
/// fields its layout needs.
#[must_use]
pub fn encode_message(msg: &Message) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(&MAGIC);
    buf.push(VERSION);
    put_varstring(&mut buf, msg.document().unwrap_or(""));
    buf.push(u8::from(msg.encrypted()));
    buf.push(msg.message_type() as u8);

    match msg.payload() {
        Payload::Doc(doc) => encode_doc_body(&mut buf, doc),
        Payload::Awareness(AwarenessPayload::Update { update }) => {
            buf.push(AWARENESS_UPDATE);
            put_varbytes(&mut buf, update);
        }
        Payload::File(file) => encode_file_body(&mut buf, file),
        Payload::Rpc(rpc) => encode_rpc_body(&mut buf, rpc),
        Payload::Ack { message_id } => put_varstring(&mut buf, message_id),
    }

    buf
}

fn encode_doc_body(buf: &mut Vec<u8>, doc: &DocPayload) {
    buf.push(doc.discriminant());
    match doc {
        DocPayload::SyncStep1 { state_vector } => put_varbytes(buf, state_vector),
        DocPayload::SyncStep2 { update } | DocPayload::Update { update } => {
            put_varbytes(buf, update);
        }
        DocPayload::AuthMessage { permission, reason } => {
            buf.push(*permission as u8);
            if *permission == Permission::Denied {
                put_varstring(buf, reason.as_deref().unwrap_or(""));
            }
        }
        DocPayload::SyncDone => {}
    }
}

fn encode_file_body(buf: &mut Vec<u8>, file: &FilePayload) {
    buf.push(file.discriminant());
    match file {
        FilePayload::Request {
            direction,
            file_id,
            filename,
            size,
            mime_type,
            content_id,
        } => {
            buf.push(*direction as u8);
            put_varstring(buf, file_id);
            put_varstring(buf, filename);
            put_varuint(buf, *size);
            put_varstring(buf, mime_type);
            match content_id {
                Some(id) => {
                    buf.push(1);
                    put_varbytes(buf, id);
                }
                None => buf.push(0),
            }
        }
        FilePayload::Progress {
            file_id,
            chunk_index,
            chunk_data,
            total_chunks,
            bytes_uploaded,
            encrypted,
            proof,
        } => {
            put_varstring(buf, file_id);
            put_varuint(buf, *chunk_index);
            put_varbytes(buf, chunk_data);
            put_varuint(buf, *total_chunks);
            put_varuint(buf, *bytes_uploaded);
            buf.push(u8::from(*encrypted));
            put_varuint(buf, proof.len() as u64);
            for hash in proof {
                buf.extend_from_slice(hash);
            }
        }
    }
}

fn encode_rpc_body(buf: &mut Vec<u8>, rpc: &RpcPayload) {
    put_varstring(buf, &rpc.method);
    buf.push(rpc.request_type as u8);
    put_varstring(buf, &rpc.original_request_id);
    match &rpc.result {
        RpcResult::Success { payload } => {
            buf.push(RESULT_SUCCESS);
            put_varbytes(buf, payload);
        }
        RpcResult::Error {
            status_code,
            details,
            payload,
        } => {
            buf.push(RESULT_ERROR);
            put_varuint(buf, *status_code);
            put_varstring(buf, details);
            match payload {
                Some(bytes) => {
                    buf.push(1);
                    put_varbytes(buf, bytes);
                }
                None => buf.push(0),
            }
        }
    }
}

/// Decode a frame
///
/// # Errors
///
/// Returns `DecodeError::BadMagic` when the frame does not start with
/// `Y J S`, `DecodeError::Version` on an unsupported version byte,
/// `DecodeError::Truncated` when a field runs past the end of the buffer,
/// and `DecodeError::Unknown` on an unrecognized discriminant.
pub fn decode(buf: &[u8]) -> Result<Frame> {
    if buf.len() < MAGIC.len() {
        return Err(DecodeError::Truncated {
            offset: buf.len(),
            needed: MAGIC.len() - buf.len(),
        });
    }
    if buf[..3] != MAGIC {
        return Err(DecodeError::BadMagic([buf[0], buf[1], buf[2]]));
    }
    if buf == PING_FRAME {
        return Ok(Frame::Ping);
    }
    if buf == PONG_FRAME {
        return Ok(Frame::Pong);
    }

    let mut reader = Reader::new(&buf[3..]);
    let version = reader.read_u8()?;
    if version != VERSION {
        return Err(DecodeError::Version {
            expected: VERSION,
            actual: version,
        });
    }
    let document = reader.read_varstring()?;
    let encrypted = match reader.read_u8()? {
        0 => false,
        1 => true,
        value => {
            return Err(DecodeError::Unknown {
                field: "encrypted",
                value,
            });
        }
    };
    let message_type = MessageType::try_from(reader.read_u8()?)?;

    let payload = match message_type {
        MessageType::Doc => Payload::Doc(decode_doc_body(&mut reader)?),
        MessageType::Awareness => {
            let payload_type = reader.read_u8()?;
            if payload_type != AWARENESS_UPDATE {
                return Err(DecodeError::Unknown {
                    field: "awareness_payload_type",
                    value: payload_type,
                });
            }
            Payload::Awareness(AwarenessPayload::Update {
                update: reader.read_varbytes()?.to_vec(),
            })
        }
        MessageType::File => Payload::File(decode_file_body(&mut reader)?),
        MessageType::Rpc => Payload::Rpc(decode_rpc_body(&mut reader)?),
        MessageType::Ack => Payload::Ack {
            message_id: reader.read_varstring()?,
        },
    };

    // Acks omit the document; the wire slot is a zero-length string.
    let document = match message_type {
        MessageType::Ack => None,
        _ => Some(document),
    };

    let message = Message::from_parts(document, encrypted, payload);
    message.set_encoded(buf.to_vec());
    Ok(Frame::Message(message))
}

fn decode_doc_body(reader: &mut Reader<'_>) -> Result<DocPayload> {
    let payload_type = reader.read_u8()?;
    match payload_type {
        0 => Ok(DocPayload::SyncStep1 {
            state_vector: reader.read_varbytes()?.to_vec(),
        }),
        1 => Ok(DocPayload::SyncStep2 {
            update: reader.read_varbytes()?.to_vec(),
        }),
        2 => Ok(DocPayload::Update {
            update: reader.read_varbytes()?.to_vec(),
        }),
        3 => {
            let permission = Permission::try_from(reader.read_u8()?)?;
            let reason = match permission {
                Permission::Granted => None,
                Permission::Denied => Some(reader.read_varstring()?),
            };
            Ok(DocPayload::AuthMessage { permission, reason })
        }
        4 => Ok(DocPayload::SyncDone),
        value => Err(DecodeError::Unknown {
            field: "doc_payload_type",
            value,
        }),
    }
}

fn decode_file_body(reader: &mut Reader<'_>) -> Result<FilePayload> {
    let payload_type = reader.read_u8()?;
    match payload_type {
        0 => {
            let direction = FileDirection::try_from(reader.read_u8()?)?;
            let file_id = reader.read_varstring()?;
            let filename = reader.read_varstring()?;
            let size = reader.read_varuint()?;
            let mime_type = reader.read_varstring()?;
            let content_id = match reader.read_u8()? {
                0 => None,
                1 => Some(reader.read_varbytes()?.to_vec()),
                value => {
                    return Err(DecodeError::Unknown {
                        field: "content_id_presence",
                        value,
                    });
                }
            };
            Ok(FilePayload::Request {
                direction,
                file_id,
                filename,
                size,
                mime_type,
                content_id,
            })
        }
        1 => {
            let file_id = reader.read_varstring()?;
            let chunk_index = reader.read_varuint()?;
            let chunk_data = reader.read_varbytes()?.to_vec();
            let total_chunks = reader.read_varuint()?;
            let bytes_uploaded = reader.read_varuint()?;
            let encrypted = reader.read_u8()? != 0;
            let proof_len = reader.read_varuint()?;
            let mut proof = Vec::with_capacity(proof_len.min(64) as usize);
            for _ in 0..proof_len {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(reader.read_exact(32)?);
                proof.push(hash);
            }
            Ok(FilePayload::Progress {
                file_id,
                chunk_index,
                chunk_data,
                total_chunks,
                bytes_uploaded,
                encrypted,
                proof,
            })
        }
        value => Err(DecodeError::Unknown {
            field: "file_payload_type",
            value,
        }),
    }
}

fn decode_rpc_body(reader: &mut Reader<'_>) -> Result<RpcPayload> {
    let method = reader.read_varstring()?;
    let request_type = RpcRequestType::try_from(reader.read_u8()?)?;
    let original_request_id = reader.read_varstring()?;
    let result = match reader.read_u8()? {
        RESULT_SUCCESS => RpcResult::Success {
            payload: reader.read_varbytes()?.to_vec(),
        },
        RESULT_ERROR => {
            let status_code = reader.read_varuint()?;
            let details = reader.read_varstring()?;
            let payload = match reader.read_u8()? {
                0 => None,
                1 => Some(reader.read_varbytes()?.to_vec()),
                value => {
                    return Err(DecodeError::Unknown {
                        field: "rpc_error_payload_presence",
                        value,
                    });
                }
            };
            RpcResult::Error {
                status_code,
                details,
                payload,
            }
        }
        value => {
            return Err(DecodeError::Unknown {
                field: "rpc_result_kind",
                value,
            });
        }
    };
    Ok(RpcPayload {
        method,
        request_type,
        original_request_id,
        result,
    })
}
