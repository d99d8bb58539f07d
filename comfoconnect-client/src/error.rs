//! Client error types.

use comfoconnect_protocol::{GatewayResult, Opcode};
use std::path::PathBuf;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] comfoconnect_protocol::ProtocolError),

    #[error("already connecting")]
    AlreadyConnecting,

    #[error("already connected")]
    AlreadyConnected,

    #[error("not connected")]
    Disconnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connect timeout")]
    Timeout,

    #[error("gateway timeout: no {opcode} confirm for message {id}")]
    GatewayTimeout { opcode: Opcode, id: u32 },

    #[error("unexpected response to message {id}: expected {expected}, got {actual}")]
    UnexpectedResponseOpcode {
        id: u32,
        expected: Opcode,
        actual: Opcode,
    },

    #[error("unexpected {opcode} payload: {kind}")]
    UnexpectedPayload { opcode: Opcode, kind: &'static str },

    #[error("session already active")]
    AlreadyActive,

    #[error("gateway rejected {opcode}: {result}{}", describe(.description))]
    GatewayError {
        opcode: Opcode,
        result: GatewayResult,
        description: Option<String>,
    },

    #[error("device error {code}: {description}")]
    RmiError { code: u32, description: &'static str },

    #[error("property {0} is read-only")]
    ReadOnlyProperty(String),

    #[error("discovery already in progress")]
    AlreadyInProgress,

    #[error("operation aborted")]
    Aborted,

    #[error("completion already settled")]
    AlreadySettled,

    #[error("malformed discovery response from {from}: {source}")]
    MalformedDiscoveryResponse {
        from: std::net::SocketAddr,
        #[source]
        source: comfoconnect_protocol::ProtocolError,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_) => true,
            ClientError::Timeout => true,
            ClientError::GatewayTimeout { .. } => true,
            ClientError::ConnectionClosed => true,
            ClientError::Disconnected => true,
            ClientError::GatewayError { result, .. } => result.is_retryable(),
            _ => false,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    IoError(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file {0}: {1}")]
    ParseError(PathBuf, String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue {
        field: &'static str,
        message: String,
    },
}

impl From<ConfigError> for ClientError {
    fn from(err: ConfigError) -> Self {
        ClientError::InvalidConfig(err.to_string())
    }
}

fn describe(description: &Option<String>) -> String {
    description
        .as_deref()
        .map(|d| format!(" ({d})"))
        .unwrap_or_default()
}

/// Describes a device error code returned in an RMI response.
pub fn rmi_error_description(code: u32) -> &'static str {
    match code {
        11 => "unknown command",
        12 => "unknown unit",
        13 => "unknown subunit",
        14 => "unknown property",
        15 => "type cannot have a range",
        30 => "value not in range",
        32 => "property not gettable or settable",
        40 => "internal error",
        41 => "internal error, the command is probably malformed",
        _ => "unknown device error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(ClientError::Timeout.is_retryable());
        assert!(ClientError::ConnectionClosed.is_retryable());
        assert!(ClientError::GatewayTimeout {
            opcode: Opcode::VersionRequest,
            id: 1
        }
        .is_retryable());
        assert!(ClientError::GatewayError {
            opcode: Opcode::StartSessionRequest,
            result: GatewayResult::OtherSession,
            description: None,
        }
        .is_retryable());

        assert!(!ClientError::AlreadyActive.is_retryable());
        assert!(!ClientError::ReadOnlyProperty("fan".to_string()).is_retryable());
        assert!(!ClientError::GatewayError {
            opcode: Opcode::RegisterDeviceRequest,
            result: GatewayResult::NotAllowed,
            description: None,
        }
        .is_retryable());
    }

    #[test]
    fn test_gateway_error_display() {
        let err = ClientError::GatewayError {
            opcode: Opcode::RegisterDeviceRequest,
            result: GatewayResult::NotAllowed,
            description: Some("invalid pin".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "gateway rejected REGISTER_DEVICE_REQUEST: NOT_ALLOWED (invalid pin)"
        );

        let err = ClientError::GatewayError {
            opcode: Opcode::VersionRequest,
            result: GatewayResult::InternalError,
            description: None,
        };
        assert_eq!(
            err.to_string(),
            "gateway rejected VERSION_REQUEST: INTERNAL_ERROR"
        );
    }

    #[test]
    fn test_rmi_error_display() {
        let err = ClientError::RmiError {
            code: 30,
            description: rmi_error_description(30),
        };
        assert_eq!(err.to_string(), "device error 30: value not in range");
        assert_eq!(rmi_error_description(99), "unknown device error");
    }
}
