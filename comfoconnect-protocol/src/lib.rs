//! # comfoconnect-protocol
//!
//! Wire protocol implementation for ComfoConnect gateways.
//!
//! This crate provides:
//! - The 38-byte envelope header and its codec, including a streaming decoder
//! - The opcode table with request/confirm pairing
//! - Operation header and message body types, with a protobuf codec
//! - The property value codec for raw device values

pub mod codec;
pub mod envelope;
pub mod error;
pub mod message;
pub mod opcode;
pub mod property;
pub mod proto;

pub use codec::{EnvelopeDecoder, MessageCodec};
pub use envelope::{format_uuid, parse_uuid, Envelope, Header, HEADER_SIZE};
pub use error::{GatewayResult, ProtocolError};
pub use message::{Operation, Payload};
pub use opcode::{Opcode, OpcodeKind};
pub use property::{PropertyType, PropertyValue};
pub use proto::ProtobufCodec;

/// Default TCP and UDP port of a gateway.
pub const DEFAULT_PORT: u16 = 56747;

/// Maximum accepted envelope size (1 MiB).
pub const MAX_ENVELOPE_SIZE: usize = 1024 * 1024;
