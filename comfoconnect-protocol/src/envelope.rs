//! Binary envelope format for gateway messages.
//!
//! Envelope layout (38 bytes header + operation + payload, big-endian):
//!
//! ```text
//! +--------------+-------------+---------------+-----------+
//! | total_length | sender uuid | receiver uuid | op_length |
//! |   4 bytes    |  16 bytes   |   16 bytes    |  2 bytes  |
//! +--------------+-------------+---------------+-----------+
//! | operation                  | payload                   |
//! | op_length bytes            | message_length bytes      |
//! +----------------------------+---------------------------+
//! ```
//!
//! `total_length` counts every byte after itself, so
//! `total_length = 38 + op_length + message_length - 4`.

use crate::error::ProtocolError;
use crate::MAX_ENVELOPE_SIZE;
use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

/// Size of the fixed envelope header in bytes (4+16+16+2 = 38).
pub const HEADER_SIZE: usize = 38;

/// Size of the leading length field, which `total_length` does not count.
const LENGTH_FIELD_SIZE: usize = 4;

/// Number of hex characters in a textual device UUID.
pub const UUID_HEX_LEN: usize = 32;

/// Parses a textual device UUID.
///
/// Accepts up to 32 hex characters; shorter values are zero-padded on the
/// left, so `"1"` becomes `00000000000000000000000000000001`.
pub fn parse_uuid(text: &str) -> Result<Uuid, ProtocolError> {
    let text = text.trim();
    if text.is_empty()
        || text.len() > UUID_HEX_LEN
        || !text.chars().all(|c| c.is_ascii_hexdigit())
    {
        return Err(ProtocolError::InvalidUuid(text.to_string()));
    }
    let padded = format!("{:0>width$}", text, width = UUID_HEX_LEN);
    Uuid::parse_str(&padded).map_err(|_| ProtocolError::InvalidUuid(text.to_string()))
}

/// Formats a device UUID as 32 lowercase hex characters.
pub fn format_uuid(uuid: &Uuid) -> String {
    uuid.simple().to_string()
}

/// A parsed envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// UUID of the sending party.
    pub sender: Uuid,
    /// UUID of the receiving party.
    pub receiver: Uuid,
    /// Length of the operation section.
    pub op_length: u16,
    /// Length of the payload section (derived from `total_length` on the wire).
    pub message_length: u32,
}

impl Header {
    pub fn new(sender: Uuid, receiver: Uuid, op_length: u16, message_length: u32) -> Self {
        Self {
            sender,
            receiver,
            op_length,
            message_length,
        }
    }

    /// Value of the on-wire `total_length` field.
    pub fn total_length(&self) -> u32 {
        (HEADER_SIZE - LENGTH_FIELD_SIZE) as u32 + u32::from(self.op_length) + self.message_length
    }

    /// Full envelope length including the header.
    pub fn length(&self) -> usize {
        HEADER_SIZE + self.op_length as usize + self.message_length as usize
    }

    /// Offset of the operation section from the start of the envelope.
    pub fn op_offset(&self) -> usize {
        HEADER_SIZE
    }

    /// Offset of the payload section from the start of the envelope.
    pub fn message_offset(&self) -> usize {
        HEADER_SIZE + self.op_length as usize
    }

    /// Serializes the header into its 38-byte wire form.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.total_length().to_be_bytes());
        out[4..20].copy_from_slice(self.sender.as_bytes());
        out[20..36].copy_from_slice(self.receiver.as_bytes());
        out[36..38].copy_from_slice(&self.op_length.to_be_bytes());
        out
    }

    /// Parses a header from the start of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < HEADER_SIZE {
            return Err(ProtocolError::FrameTooShort {
                available: buf.len(),
            });
        }

        let total_length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let sender = uuid_at(buf, 4);
        let receiver = uuid_at(buf, 20);
        let op_length = u16::from_be_bytes([buf[36], buf[37]]);

        let fixed = (HEADER_SIZE - LENGTH_FIELD_SIZE) as u32 + u32::from(op_length);
        let message_length =
            total_length
                .checked_sub(fixed)
                .ok_or(ProtocolError::InvalidLength {
                    total_length,
                    op_length,
                })?;

        Ok(Self {
            sender,
            receiver,
            op_length,
            message_length,
        })
    }
}

fn uuid_at(buf: &[u8], offset: usize) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&buf[offset..offset + 16]);
    Uuid::from_bytes(bytes)
}

/// One complete wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub header: Header,
    /// Encoded operation struct.
    pub operation: Bytes,
    /// Encoded opcode-specific payload.
    pub payload: Bytes,
}

impl Envelope {
    /// Creates an envelope, validating section sizes.
    pub fn new(
        sender: Uuid,
        receiver: Uuid,
        operation: Bytes,
        payload: Bytes,
    ) -> Result<Self, ProtocolError> {
        let op_length = u16::try_from(operation.len()).map_err(|_| {
            ProtocolError::EnvelopeTooLarge {
                size: operation.len(),
                max: u16::MAX as usize,
            }
        })?;
        let size = HEADER_SIZE + operation.len() + payload.len();
        if size > MAX_ENVELOPE_SIZE {
            return Err(ProtocolError::EnvelopeTooLarge {
                size,
                max: MAX_ENVELOPE_SIZE,
            });
        }

        Ok(Self {
            header: Header::new(sender, receiver, op_length, payload.len() as u32),
            operation,
            payload,
        })
    }

    /// Builds and serializes an envelope in one step.
    pub fn to_bytes(
        sender: Uuid,
        receiver: Uuid,
        operation: &[u8],
        payload: &[u8],
    ) -> Result<BytesMut, ProtocolError> {
        let envelope = Self::new(
            sender,
            receiver,
            Bytes::copy_from_slice(operation),
            Bytes::copy_from_slice(payload),
        )?;
        Ok(envelope.encode())
    }

    /// Encodes the envelope into bytes.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.header.length());
        buf.put_slice(&self.header.to_bytes());
        buf.put_slice(&self.operation);
        buf.put_slice(&self.payload);
        buf
    }

    /// Decodes one envelope starting at `offset`.
    ///
    /// Returns the envelope and the offset of the byte following it, so a
    /// buffer holding several concatenated envelopes can be walked in a loop.
    pub fn decode(buf: &[u8], offset: usize) -> Result<(Self, usize), ProtocolError> {
        let rest = buf.get(offset..).unwrap_or_default();
        let header = Header::parse(rest)?;

        let op_available = rest.len() - HEADER_SIZE;
        if header.op_length as usize > op_available {
            return Err(ProtocolError::TruncatedOperation {
                declared: header.op_length as usize,
                available: op_available,
            });
        }

        let payload_available = op_available - header.op_length as usize;
        if header.message_length as usize > payload_available {
            return Err(ProtocolError::TruncatedPayload {
                declared: header.message_length as usize,
                available: payload_available,
            });
        }

        let operation =
            Bytes::copy_from_slice(&rest[header.op_offset()..header.message_offset()]);
        let payload = Bytes::copy_from_slice(&rest[header.message_offset()..header.length()]);

        Ok((
            Self {
                header,
                operation,
                payload,
            },
            offset + header.length(),
        ))
    }

    /// Decodes every envelope in a buffer of concatenated envelopes.
    pub fn decode_all(buf: &[u8]) -> Result<Vec<Self>, ProtocolError> {
        let mut envelopes = Vec::new();
        let mut offset = 0;
        while offset < buf.len() {
            let (envelope, next) = Self::decode(buf, offset)?;
            envelopes.push(envelope);
            offset = next;
        }
        Ok(envelopes)
    }

    pub fn sender(&self) -> Uuid {
        self.header.sender
    }

    pub fn receiver(&self) -> Uuid {
        self.header.receiver
    }
}
