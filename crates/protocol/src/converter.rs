//! Converter between frames and typed messages
//!
//! The tag table is fixed once `build()` returns; decoding and encoding only
//! accept message kinds that were bound to a tag beforehand.

use crate::frame::{Frame, MAX_PAYLOAD_SIZE};
use crate::message::{Authentication, Authorization, Config, Fail, Message, MessageType};
use bytes::Bytes;
use rkyv::util::AlignedVec;
use std::collections::HashMap;
use thiserror::Error;

/// Serialize an rkyv value into frame payload bytes
macro_rules! encode_archive {
    ($value:expr) => {
        rkyv::to_bytes::<rkyv::rancor::Error>($value)
            .map(|bytes| Bytes::from(bytes.to_vec()))
            .map_err(|e| CodecError::SerializationFailed(e.to_string()))
    };
}

/// Validate and deserialize an rkyv payload. Archives must be read from an
/// aligned buffer, so the payload is copied first.
macro_rules! decode_archive {
    ($ty:ty, $kind:expr, $payload:expr) => {{
        let payload: &[u8] = $payload;
        let mut aligned = AlignedVec::<16>::with_capacity(payload.len());
        aligned.extend_from_slice(payload);
        rkyv::from_bytes::<$ty, rkyv::rancor::Error>(&aligned).map_err(|e| {
            CodecError::Malformed {
                kind: $kind,
                reason: e.to_string(),
            }
        })
    }};
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Unknown tag: {0}")]
    UnknownTag(u16),

    #[error("Unregistered message type: {0}")]
    UnregisteredType(MessageType),

    #[error("Tag {0} is already bound")]
    DuplicateTag(u16),

    #[error("Message type {0} is already bound")]
    DuplicateType(MessageType),

    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Malformed {kind} payload: {reason}")]
    Malformed { kind: MessageType, reason: String },
}

/// Builder collecting tag relations before the table is frozen
#[derive(Debug, Default)]
pub struct ConverterBuilder {
    by_tag: HashMap<u16, MessageType>,
    by_type: HashMap<MessageType, u16>,
}

impl ConverterBuilder {
    /// Bind a tag to a message kind. Each tag and each kind may be bound once.
    pub fn bind_relation(mut self, tag: u16, kind: MessageType) -> Result<Self, CodecError> {
        if self.by_tag.contains_key(&tag) {
            return Err(CodecError::DuplicateTag(tag));
        }
        if self.by_type.contains_key(&kind) {
            return Err(CodecError::DuplicateType(kind));
        }
        self.by_tag.insert(tag, kind);
        self.by_type.insert(kind, tag);
        Ok(self)
    }

    pub fn build(self) -> Converter {
        Converter {
            by_tag: self.by_tag,
            by_type: self.by_type,
        }
    }
}

/// Frame <-> message converter with an immutable tag table
#[derive(Debug, Clone)]
pub struct Converter {
    by_tag: HashMap<u16, MessageType>,
    by_type: HashMap<MessageType, u16>,
}

impl Converter {
    pub fn builder() -> ConverterBuilder {
        ConverterBuilder::default()
    }

    /// Converter with every message kind bound to its default tag
    pub fn standard() -> Self {
        let mut by_tag = HashMap::new();
        let mut by_type = HashMap::new();
        for kind in MessageType::ALL {
            by_tag.insert(kind.default_tag(), kind);
            by_type.insert(kind, kind.default_tag());
        }
        Self { by_tag, by_type }
    }

    /// Tag bound to a message kind, if any
    pub fn tag_of(&self, kind: MessageType) -> Option<u16> {
        self.by_type.get(&kind).copied()
    }

    /// Message kind bound to a tag, if any
    pub fn type_of(&self, tag: u16) -> Option<MessageType> {
        self.by_tag.get(&tag).copied()
    }

    /// Decode a frame into a typed message
    pub fn to_object(&self, frame: &Frame) -> Result<Message, CodecError> {
        if frame.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(CodecError::PayloadTooLarge {
                size: frame.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let kind = self
            .type_of(frame.tag)
            .ok_or(CodecError::UnknownTag(frame.tag))?;

        let payload = &frame.payload;
        let message = match kind {
            MessageType::Authentication => {
                Message::Authentication(decode_archive!(Authentication, kind, payload)?)
            }
            MessageType::Authorization => {
                Message::Authorization(decode_archive!(Authorization, kind, payload)?)
            }
            MessageType::ConfigRequest => {
                if !payload.is_empty() {
                    return Err(CodecError::Malformed {
                        kind,
                        reason: format!("expected empty payload, got {} bytes", payload.len()),
                    });
                }
                Message::ConfigRequest
            }
            MessageType::Config => Message::Config(decode_archive!(Config, kind, payload)?),
            MessageType::Packet => Message::Packet(frame.payload.clone()),
            MessageType::Fail => Message::Fail(decode_archive!(Fail, kind, payload)?),
        };

        Ok(message)
    }

    /// Encode a typed message into a frame
    pub fn to_frame(&self, message: &Message) -> Result<Frame, CodecError> {
        let kind = message.message_type();
        let tag = self
            .tag_of(kind)
            .ok_or(CodecError::UnregisteredType(kind))?;

        let payload = match message {
            Message::Authentication(value) => encode_archive!(value)?,
            Message::Authorization(value) => encode_archive!(value)?,
            Message::ConfigRequest => Bytes::new(),
            Message::Config(value) => encode_archive!(value)?,
            Message::Packet(packet) => packet.clone(),
            Message::Fail(value) => encode_archive!(value)?,
        };

        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(CodecError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        Ok(Frame { tag, payload })
    }
}

impl Default for Converter {
    fn default() -> Self {
        Self::standard()
    }
}
