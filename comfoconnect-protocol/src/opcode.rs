//! Gateway operation codes.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How an opcode participates in an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpcodeKind {
    /// Sent by the client, possibly answered by a confirm.
    Request,
    /// Answer to a request, matched by message id.
    Confirm,
    /// Unsolicited message from the gateway.
    Notification,
    /// Connection-level control traffic.
    Control,
}

macro_rules! opcodes {
    ($($name:ident = $value:literal => $wire:literal,)*) => {
        /// Operation type carried in every operation header.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        #[repr(u32)]
        pub enum Opcode {
            $($name = $value,)*
        }

        impl Opcode {
            /// Parses a wire value.
            pub fn from_u32(value: u32) -> Result<Self, ProtocolError> {
                match value {
                    $($value => Ok(Opcode::$name),)*
                    other => Err(ProtocolError::UnknownOpcode(other)),
                }
            }

            /// Returns the protocol name of this opcode.
            pub fn name(&self) -> &'static str {
                match self {
                    $(Opcode::$name => $wire,)*
                }
            }
        }
    };
}

opcodes! {
    NoOperation = 0 => "NO_OPERATION",
    SetAddressRequest = 1 => "SET_ADDRESS_REQUEST",
    RegisterDeviceRequest = 2 => "REGISTER_DEVICE_REQUEST",
    StartSessionRequest = 3 => "START_SESSION_REQUEST",
    CloseSessionRequest = 4 => "CLOSE_SESSION_REQUEST",
    ListRegisteredDevicesRequest = 5 => "LIST_REGISTERED_DEVICES_REQUEST",
    DeregisterDeviceRequest = 6 => "DEREGISTER_DEVICE_REQUEST",
    ChangePinRequest = 7 => "CHANGE_PIN_REQUEST",
    GetRemoteAccessIdRequest = 8 => "GET_REMOTE_ACCESS_ID_REQUEST",
    SetRemoteAccessIdRequest = 9 => "SET_REMOTE_ACCESS_ID_REQUEST",
    GetSupportIdRequest = 10 => "GET_SUPPORT_ID_REQUEST",
    SetSupportIdRequest = 11 => "SET_SUPPORT_ID_REQUEST",
    GetWebIdRequest = 12 => "GET_WEB_ID_REQUEST",
    SetWebIdRequest = 13 => "SET_WEB_ID_REQUEST",
    SetPushIdRequest = 14 => "SET_PUSH_ID_REQUEST",
    DebugRequest = 15 => "DEBUG_REQUEST",
    UpgradeRequest = 16 => "UPGRADE_REQUEST",
    SetDeviceSettingsRequest = 17 => "SET_DEVICE_SETTINGS_REQUEST",
    VersionRequest = 18 => "VERSION_REQUEST",
    CnTimeRequest = 30 => "CN_TIME_REQUEST",
    CnTimeConfirm = 31 => "CN_TIME_CONFIRM",
    CnNodeRequest = 32 => "CN_NODE_REQUEST",
    CnNodeNotification = 33 => "CN_NODE_NOTIFICATION",
    CnRmiRequest = 34 => "CN_RMI_REQUEST",
    CnRmiResponse = 35 => "CN_RMI_RESPONSE",
    CnRmiAsyncRequest = 36 => "CN_RMI_ASYNC_REQUEST",
    CnRmiAsyncConfirm = 37 => "CN_RMI_ASYNC_CONFIRM",
    CnRmiAsyncResponse = 38 => "CN_RMI_ASYNC_RESPONSE",
    CnRpdoRequest = 39 => "CN_RPDO_REQUEST",
    CnRpdoConfirm = 40 => "CN_RPDO_CONFIRM",
    CnRpdoNotification = 41 => "CN_RPDO_NOTIFICATION",
    CnAlarmNotification = 42 => "CN_ALARM_NOTIFICATION",
    SetAddressConfirm = 51 => "SET_ADDRESS_CONFIRM",
    RegisterDeviceConfirm = 52 => "REGISTER_DEVICE_CONFIRM",
    StartSessionConfirm = 53 => "START_SESSION_CONFIRM",
    CloseSessionConfirm = 54 => "CLOSE_SESSION_CONFIRM",
    ListRegisteredDevicesConfirm = 55 => "LIST_REGISTERED_DEVICES_CONFIRM",
    DeregisterDeviceConfirm = 56 => "DEREGISTER_DEVICE_CONFIRM",
    ChangePinConfirm = 57 => "CHANGE_PIN_CONFIRM",
    GetRemoteAccessIdConfirm = 58 => "GET_REMOTE_ACCESS_ID_CONFIRM",
    SetRemoteAccessIdConfirm = 59 => "SET_REMOTE_ACCESS_ID_CONFIRM",
    GetSupportIdConfirm = 60 => "GET_SUPPORT_ID_CONFIRM",
    SetSupportIdConfirm = 61 => "SET_SUPPORT_ID_CONFIRM",
    GetWebIdConfirm = 62 => "GET_WEB_ID_CONFIRM",
    SetWebIdConfirm = 63 => "SET_WEB_ID_CONFIRM",
    SetPushIdConfirm = 64 => "SET_PUSH_ID_CONFIRM",
    DebugConfirm = 65 => "DEBUG_CONFIRM",
    UpgradeConfirm = 66 => "UPGRADE_CONFIRM",
    SetDeviceSettingsConfirm = 67 => "SET_DEVICE_SETTINGS_CONFIRM",
    VersionConfirm = 68 => "VERSION_CONFIRM",
    GatewayNotification = 100 => "GATEWAY_NOTIFICATION",
    KeepAlive = 101 => "KEEP_ALIVE",
    FactoryReset = 102 => "FACTORY_RESET",
}

impl Opcode {
    /// Returns the wire value.
    pub fn as_u32(&self) -> u32 {
        *self as u32
    }

    pub fn kind(&self) -> OpcodeKind {
        use Opcode::*;
        match self {
            NoOperation | KeepAlive | FactoryReset => OpcodeKind::Control,
            CnNodeNotification | CnRpdoNotification | CnAlarmNotification
            | CnRmiAsyncResponse | GatewayNotification => OpcodeKind::Notification,
            CnTimeConfirm | CnRmiResponse | CnRmiAsyncConfirm | CnRpdoConfirm => {
                OpcodeKind::Confirm
            }
            other if (51..=68).contains(&other.as_u32()) => OpcodeKind::Confirm,
            _ => OpcodeKind::Request,
        }
    }

    /// Returns the confirm paired with this request.
    ///
    /// `NoOperation` means no confirm is expected and the exchange completes
    /// once the request has been written.
    pub fn confirm(&self) -> Opcode {
        use Opcode::*;
        match self {
            SetAddressRequest => SetAddressConfirm,
            RegisterDeviceRequest => RegisterDeviceConfirm,
            StartSessionRequest => StartSessionConfirm,
            ListRegisteredDevicesRequest => ListRegisteredDevicesConfirm,
            DeregisterDeviceRequest => DeregisterDeviceConfirm,
            ChangePinRequest => ChangePinConfirm,
            GetRemoteAccessIdRequest => GetRemoteAccessIdConfirm,
            SetRemoteAccessIdRequest => SetRemoteAccessIdConfirm,
            GetSupportIdRequest => GetSupportIdConfirm,
            SetSupportIdRequest => SetSupportIdConfirm,
            GetWebIdRequest => GetWebIdConfirm,
            SetWebIdRequest => SetWebIdConfirm,
            SetPushIdRequest => SetPushIdConfirm,
            DebugRequest => DebugConfirm,
            UpgradeRequest => UpgradeConfirm,
            SetDeviceSettingsRequest => SetDeviceSettingsConfirm,
            VersionRequest => VersionConfirm,
            CnTimeRequest => CnTimeConfirm,
            CnRmiRequest => CnRmiResponse,
            CnRmiAsyncRequest => CnRmiAsyncConfirm,
            CnRpdoRequest => CnRpdoConfirm,
            // The gateway drops the socket instead of confirming.
            CloseSessionRequest => NoOperation,
            _ => NoOperation,
        }
    }

    /// Returns whether a request with this opcode waits for a confirm.
    pub fn expects_confirm(&self) -> bool {
        self.confirm() != Opcode::NoOperation
    }

    /// Opcodes that may be sent before a session is active.
    pub fn is_session_exempt(&self) -> bool {
        matches!(
            self,
            Opcode::RegisterDeviceRequest | Opcode::StartSessionRequest | Opcode::KeepAlive
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
