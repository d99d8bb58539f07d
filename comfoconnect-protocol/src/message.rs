//! Operation header and message bodies exchanged with the gateway.

use crate::error::GatewayResult;
use crate::opcode::Opcode;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Operation header carried by every envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Operation type.
    pub opcode: Opcode,
    /// Correlation id, assigned by the sender and echoed by the responder.
    pub id: u32,
    /// Result code, present on confirms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<GatewayResult>,
    /// Human-readable result description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Operation {
    pub fn new(opcode: Opcode, id: u32) -> Self {
        Self {
            opcode,
            id,
            result: None,
            description: None,
        }
    }

    pub fn with_result(mut self, result: GatewayResult) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Returns whether the operation reports a failure.
    ///
    /// A missing result is treated as success.
    pub fn is_error(&self) -> bool {
        matches!(self.result, Some(result) if !result.is_ok())
    }
}

/// Registers this client with the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterDeviceRequest {
    pub uuid: Uuid,
    pub pin: u32,
    pub device_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartSessionRequest {
    /// Take over the session of another connected client.
    pub takeover: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartSessionConfirm {
    pub device_name: Option<String>,
    pub resumed: bool,
}

/// A client registered with the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredDevice {
    pub uuid: Uuid,
    pub device_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListRegisteredDevicesConfirm {
    pub devices: Vec<RegisteredDevice>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeregisterDeviceRequest {
    pub uuid: Uuid,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionConfirm {
    pub gateway_version: u32,
    pub serial_number: String,
    pub comfonet_version: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CnTimeRequest {
    /// Seconds since 2000-01-01 to set, or `None` to only read the clock.
    pub set_time: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CnTimeConfirm {
    pub current_time: u32,
}

/// Operating mode reported for a node on the bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeMode {
    #[default]
    Init,
    Normal,
    Update,
    Unknown(u32),
}

impl NodeMode {
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => NodeMode::Init,
            1 => NodeMode::Normal,
            2 => NodeMode::Update,
            other => NodeMode::Unknown(other),
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            NodeMode::Init => 0,
            NodeMode::Normal => 1,
            NodeMode::Update => 2,
            NodeMode::Unknown(code) => *code,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CnNodeNotification {
    pub node_id: u32,
    pub product_id: u32,
    pub zone_id: u32,
    pub mode: NodeMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CnRmiRequest {
    pub node_id: u32,
    pub message: Bytes,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CnRmiResponse {
    /// Device error code, 0 on success.
    pub result: u32,
    pub message: Bytes,
}

/// Default zone for RPDO subscriptions.
pub const DEFAULT_RPDO_ZONE: u32 = 1;

/// Default RPDO timeout, meaning "never expire".
pub const DEFAULT_RPDO_TIMEOUT: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CnRpdoRequest {
    pub pdid: u32,
    pub zone: u32,
    /// Property data type code.
    pub data_type: u32,
    pub timeout: u32,
    pub interval: Option<u32>,
}

impl CnRpdoRequest {
    pub fn new(pdid: u32, data_type: u32) -> Self {
        Self {
            pdid,
            zone: DEFAULT_RPDO_ZONE,
            data_type,
            timeout: DEFAULT_RPDO_TIMEOUT,
            interval: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CnRpdoNotification {
    pub pdid: u32,
    pub data: Bytes,
    pub zone: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CnAlarmNotification {
    pub zone: u32,
    pub product_id: u32,
    pub product_variant: u32,
    pub serial_number: String,
    pub sw_program_version: u32,
    #[serde(with = "hex_bytes")]
    pub errors: Vec<u8>,
    pub error_id: u32,
    pub node_id: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayNotification {
    pub push_uuids: Vec<Uuid>,
    pub alarm: Option<CnAlarmNotification>,
}

/// Search response returned by a gateway during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchGatewayResponse {
    pub address: String,
    pub uuid: Uuid,
    pub version: u32,
}

/// Decoded opcode-specific message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Empty,
    RegisterDevice(RegisterDeviceRequest),
    StartSession(StartSessionRequest),
    StartSessionConfirm(StartSessionConfirm),
    ListRegisteredDevicesConfirm(ListRegisteredDevicesConfirm),
    DeregisterDevice(DeregisterDeviceRequest),
    VersionConfirm(VersionConfirm),
    TimeRequest(CnTimeRequest),
    TimeConfirm(CnTimeConfirm),
    NodeNotification(CnNodeNotification),
    RmiRequest(CnRmiRequest),
    RmiResponse(CnRmiResponse),
    RpdoRequest(CnRpdoRequest),
    RpdoNotification(CnRpdoNotification),
    AlarmNotification(CnAlarmNotification),
    GatewayNotification(GatewayNotification),
    /// Body of an opcode without a modelled schema.
    Raw(Bytes),
}

impl Payload {
    /// Returns the variant name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Empty => "empty",
            Payload::RegisterDevice(_) => "register_device",
            Payload::StartSession(_) => "start_session",
            Payload::StartSessionConfirm(_) => "start_session_confirm",
            Payload::ListRegisteredDevicesConfirm(_) => "list_registered_devices_confirm",
            Payload::DeregisterDevice(_) => "deregister_device",
            Payload::VersionConfirm(_) => "version_confirm",
            Payload::TimeRequest(_) => "time_request",
            Payload::TimeConfirm(_) => "time_confirm",
            Payload::NodeNotification(_) => "node_notification",
            Payload::RmiRequest(_) => "rmi_request",
            Payload::RmiResponse(_) => "rmi_response",
            Payload::RpdoRequest(_) => "rpdo_request",
            Payload::RpdoNotification(_) => "rpdo_notification",
            Payload::AlarmNotification(_) => "alarm_notification",
            Payload::GatewayNotification(_) => "gateway_notification",
            Payload::Raw(_) => "raw",
        }
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}
