//! Message codec capability and streaming envelope decoder.

use crate::envelope::{Envelope, Header, HEADER_SIZE};
use crate::error::ProtocolError;
use crate::message::{Operation, Payload, SearchGatewayResponse};
use crate::opcode::Opcode;
use crate::MAX_ENVELOPE_SIZE;
use bytes::{Buf, Bytes, BytesMut};

/// Encodes and decodes the operation header and opcode-specific bodies.
///
/// The envelope layer only needs the opcode and correlation id of each
/// message; everything schema-specific goes through this trait so the body
/// encoding can be swapped without touching the transport.
pub trait MessageCodec: Send + Sync + 'static {
    /// Encodes an operation header.
    fn encode_operation(&self, operation: &Operation) -> Result<Bytes, ProtocolError>;

    /// Decodes an operation header.
    fn decode_operation(&self, buf: &[u8]) -> Result<Operation, ProtocolError>;

    /// Encodes the body sent with `opcode`.
    fn encode_payload(&self, opcode: Opcode, payload: &Payload) -> Result<Bytes, ProtocolError>;

    /// Decodes the body received with `opcode`.
    fn decode_payload(&self, opcode: Opcode, buf: &[u8]) -> Result<Payload, ProtocolError>;

    /// Encodes the UDP discovery request.
    fn encode_discovery_request(&self) -> Bytes;

    /// Decodes a UDP discovery response.
    fn decode_discovery_response(&self, buf: &[u8])
        -> Result<SearchGatewayResponse, ProtocolError>;
}

/// Reassembles envelopes from a byte stream.
///
/// Socket reads may end in the middle of an envelope or carry several at
/// once; bytes are buffered until a complete envelope is available.
pub struct EnvelopeDecoder {
    buffer: BytesMut,
}

impl EnvelopeDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next envelope from the buffer.
    ///
    /// Returns `Ok(None)` if more data is needed. On error the offending
    /// bytes are left in place; callers should `clear()` to resynchronize.
    pub fn decode_envelope(&mut self) -> Result<Option<Envelope>, ProtocolError> {
        if self.buffer.len() < HEADER_SIZE {
            return Ok(None);
        }

        let header = Header::parse(&self.buffer)?;
        let length = header.length();
        if length > MAX_ENVELOPE_SIZE {
            return Err(ProtocolError::EnvelopeTooLarge {
                size: length,
                max: MAX_ENVELOPE_SIZE,
            });
        }
        if self.buffer.len() < length {
            return Ok(None);
        }

        self.buffer.advance(HEADER_SIZE);
        let operation = self.buffer.split_to(header.op_length as usize).freeze();
        let payload = self.buffer.split_to(header.message_length as usize).freeze();

        Ok(Some(Envelope {
            header,
            operation,
            payload,
        }))
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for EnvelopeDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::parse_uuid;

    fn encoded(operation: &[u8], payload: &[u8]) -> BytesMut {
        Envelope::to_bytes(
            parse_uuid("1").unwrap(),
            parse_uuid("2").unwrap(),
            operation,
            payload,
        )
        .unwrap()
    }

    #[test]
    fn test_partial_envelope_decoding() {
        let bytes = encoded(b"op", b"payload");
        let mut decoder = EnvelopeDecoder::new();

        // Split inside the header
        decoder.extend(&bytes[..10]);
        assert!(decoder.decode_envelope().unwrap().is_none());

        // Split inside the payload
        decoder.extend(&bytes[10..bytes.len() - 2]);
        assert!(decoder.decode_envelope().unwrap().is_none());

        decoder.extend(&bytes[bytes.len() - 2..]);
        let envelope = decoder.decode_envelope().unwrap().unwrap();
        assert_eq!(envelope.operation.as_ref(), b"op");
        assert_eq!(envelope.payload.as_ref(), b"payload");
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_coalesced_envelopes() {
        let mut decoder = EnvelopeDecoder::new();
        decoder.extend(&encoded(b"a", b"1"));
        decoder.extend(&encoded(b"b", b"22"));
        decoder.extend(&encoded(b"c", b"333")[..20]);

        let first = decoder.decode_envelope().unwrap().unwrap();
        assert_eq!(first.operation.as_ref(), b"a");
        let second = decoder.decode_envelope().unwrap().unwrap();
        assert_eq!(second.payload.as_ref(), b"22");
        assert!(decoder.decode_envelope().unwrap().is_none());
        assert_eq!(decoder.buffered(), 20);
    }

    #[test]
    fn test_oversized_envelope_rejected() {
        let mut header = Header::new(
            parse_uuid("1").unwrap(),
            parse_uuid("2").unwrap(),
            0,
            0,
        )
        .to_bytes();
        header[0..4].copy_from_slice(&(MAX_ENVELOPE_SIZE as u32).to_be_bytes());

        let mut decoder = EnvelopeDecoder::new();
        decoder.extend(&header);
        assert!(matches!(
            decoder.decode_envelope(),
            Err(ProtocolError::EnvelopeTooLarge { .. })
        ));

        decoder.clear();
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_default() {
        let decoder = EnvelopeDecoder::default();
        assert_eq!(decoder.buffered(), 0);
    }
}
