//! Protocol-level errors.

use thiserror::Error;

use crate::packet_type::PacketType;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("buffer too short: need {needed} more bytes, have {remaining}")]
    BufferTooShort { needed: usize, remaining: usize },

    #[error("VarInt encoding error: {0}")]
    VarInt(#[from] crate::types::VarIntError),

    #[error("invalid UTF-8 string")]
    InvalidUtf8,

    #[error("decompression error: {0}")]
    DecompressError(String),

    #[error("compression error: {0}")]
    CompressError(String),

    #[error("unknown packet id 0x{id:02X} in {phase:?}/{direction:?}")]
    UnknownPacketId {
        id: u32,
        phase: crate::packet_type::Phase,
        direction: crate::packet_type::Direction,
    },

    #[error("cannot instantiate {0:?}: no wire class registered")]
    InstantiationFailed(PacketType),

    #[error("field index {index} out of range for {target} (size {size})")]
    IndexOutOfRange {
        index: usize,
        size: usize,
        target: &'static str,
    },

    #[error("slot {slot} of {class} cannot be read as {target}")]
    TargetIncompatible {
        class: String,
        slot: usize,
        target: &'static str,
    },

    #[error("{operation} is not available on {packet_type:?}")]
    WrongPacketType {
        packet_type: PacketType,
        operation: &'static str,
    },

    #[error("unknown wire class: {0}")]
    UnknownWireClass(String),

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("schema parse error: {0}")]
    SchemaParse(#[from] toml::de::Error),

    #[error("invalid data: {0}")]
    InvalidData(String),
}
