//! Protocol error types and gateway result codes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Protocol-level errors that can occur during framing or message handling.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too short: need 38 header bytes, {available} available")]
    FrameTooShort { available: usize },

    #[error("truncated operation: declared {declared} bytes, {available} available")]
    TruncatedOperation { declared: usize, available: usize },

    #[error("truncated payload: declared {declared} bytes, {available} available")]
    TruncatedPayload { declared: usize, available: usize },

    #[error("invalid envelope length: total {total_length}, operation {op_length}")]
    InvalidLength { total_length: u32, op_length: u16 },

    #[error("envelope too large: {size} bytes (max {max})")]
    EnvelopeTooLarge { size: usize, max: usize },

    #[error("invalid device UUID: {0:?}")]
    InvalidUuid(String),

    #[error("unknown opcode: {0}")]
    UnknownOpcode(u32),

    #[error("unknown gateway result: {0}")]
    UnknownResult(u32),

    #[error("unknown property type: {0}")]
    UnknownPropertyType(u8),

    #[error("value too short for {data_type}: expected {expected} bytes, got {actual}")]
    ValueTooShort {
        data_type: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("value {value} cannot be encoded as {data_type}")]
    ValueTypeMismatch {
        data_type: &'static str,
        value: String,
    },

    #[error("invalid UTF-8 in property value")]
    InvalidUtf8,

    #[error("malformed message: {0}")]
    Malformed(&'static str),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("payload does not match opcode {0}")]
    UnexpectedPayload(&'static str),
}

/// Result codes carried in the operation header of a confirm.
///
/// These values are part of the gateway contract and must remain stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayResult {
    Ok,
    BadRequest,
    InternalError,
    NotReachable,
    OtherSession,
    NotAllowed,
    NoResources,
    NotExist,
    RmiError,
}

impl GatewayResult {
    /// Returns the wire value of this result.
    pub fn code(&self) -> u32 {
        match self {
            GatewayResult::Ok => 0,
            GatewayResult::BadRequest => 1,
            GatewayResult::InternalError => 2,
            GatewayResult::NotReachable => 3,
            GatewayResult::OtherSession => 4,
            GatewayResult::NotAllowed => 5,
            GatewayResult::NoResources => 6,
            GatewayResult::NotExist => 7,
            GatewayResult::RmiError => 8,
        }
    }

    /// Parses a wire value.
    pub fn from_code(code: u32) -> Result<Self, ProtocolError> {
        Ok(match code {
            0 => GatewayResult::Ok,
            1 => GatewayResult::BadRequest,
            2 => GatewayResult::InternalError,
            3 => GatewayResult::NotReachable,
            4 => GatewayResult::OtherSession,
            5 => GatewayResult::NotAllowed,
            6 => GatewayResult::NoResources,
            7 => GatewayResult::NotExist,
            8 => GatewayResult::RmiError,
            other => return Err(ProtocolError::UnknownResult(other)),
        })
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, GatewayResult::Ok)
    }

    /// Returns whether a request failing with this result may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayResult::NotReachable | GatewayResult::NoResources | GatewayResult::OtherSession
        )
    }
}

impl fmt::Display for GatewayResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayResult::Ok => write!(f, "OK"),
            GatewayResult::BadRequest => write!(f, "BAD_REQUEST"),
            GatewayResult::InternalError => write!(f, "INTERNAL_ERROR"),
            GatewayResult::NotReachable => write!(f, "NOT_REACHABLE"),
            GatewayResult::OtherSession => write!(f, "OTHER_SESSION"),
            GatewayResult::NotAllowed => write!(f, "NOT_ALLOWED"),
            GatewayResult::NoResources => write!(f, "NO_RESOURCES"),
            GatewayResult::NotExist => write!(f, "NOT_EXIST"),
            GatewayResult::RmiError => write!(f, "RMI_ERROR"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_code_roundtrip() {
        for code in 0..=8 {
            let result = GatewayResult::from_code(code).unwrap();
            assert_eq!(result.code(), code);
        }
        assert!(matches!(
            GatewayResult::from_code(42),
            Err(ProtocolError::UnknownResult(42))
        ));
    }

    #[test]
    fn test_result_retryable() {
        assert!(GatewayResult::NotReachable.is_retryable());
        assert!(GatewayResult::NoResources.is_retryable());
        assert!(GatewayResult::OtherSession.is_retryable());

        assert!(!GatewayResult::Ok.is_retryable());
        assert!(!GatewayResult::BadRequest.is_retryable());
        assert!(!GatewayResult::NotAllowed.is_retryable());
        assert!(!GatewayResult::RmiError.is_retryable());
    }

    #[test]
    fn test_result_display() {
        assert_eq!(GatewayResult::Ok.to_string(), "OK");
        assert_eq!(GatewayResult::NotAllowed.to_string(), "NOT_ALLOWED");
        assert_eq!(GatewayResult::OtherSession.to_string(), "OTHER_SESSION");
        assert_eq!(GatewayResult::RmiError.to_string(), "RMI_ERROR");
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::FrameTooShort { available: 12 };
        assert!(err.to_string().contains("12"));

        let err = ProtocolError::TruncatedPayload {
            declared: 100,
            available: 7,
        };
        let msg = err.to_string();
        assert!(msg.contains("100") && msg.contains('7'));

        let err = ProtocolError::UnknownOpcode(999);
        assert!(err.to_string().contains("999"));

        let err = ProtocolError::MissingField("uuid");
        assert!(err.to_string().contains("uuid"));

        let err = ProtocolError::InvalidUtf8;
        assert!(err.to_string().contains("UTF-8"));
    }
}
