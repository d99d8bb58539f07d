//! Protobuf encoding of the operation header and message bodies.
//!
//! Only the handful of wire types the gateway schema uses are supported:
//! varints (type 0) and length-delimited fields (type 2) are produced;
//! fixed32/fixed64 fields are skipped when read.

use crate::codec::MessageCodec;
use crate::error::{GatewayResult, ProtocolError};
use crate::message::*;
use crate::opcode::Opcode;
use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_FIXED32: u8 = 5;

/// Appends protobuf fields to a buffer.
#[derive(Debug, Default)]
struct ProtoWriter {
    buf: BytesMut,
}

impl ProtoWriter {
    fn new() -> Self {
        Self::default()
    }

    fn put_varint(&mut self, mut value: u64) {
        while value >= 0x80 {
            self.buf.put_u8((value as u8 & 0x7f) | 0x80);
            value >>= 7;
        }
        self.buf.put_u8(value as u8);
    }

    fn key(&mut self, field: u32, wire_type: u8) {
        self.put_varint(u64::from(field << 3 | u32::from(wire_type)));
    }

    fn uint32(&mut self, field: u32, value: u32) -> &mut Self {
        self.key(field, WIRE_VARINT);
        self.put_varint(u64::from(value));
        self
    }

    fn bool(&mut self, field: u32, value: bool) -> &mut Self {
        self.uint32(field, u32::from(value))
    }

    fn bytes(&mut self, field: u32, value: &[u8]) -> &mut Self {
        self.key(field, WIRE_LEN);
        self.put_varint(value.len() as u64);
        self.buf.put_slice(value);
        self
    }

    fn string(&mut self, field: u32, value: &str) -> &mut Self {
        self.bytes(field, value.as_bytes())
    }

    fn message(&mut self, field: u32, message: ProtoWriter) -> &mut Self {
        self.bytes(field, &message.buf)
    }

    fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// A single decoded field value.
#[derive(Debug, Clone, Copy)]
enum Field<'a> {
    Varint(u64),
    Len(&'a [u8]),
    Fixed,
}

impl<'a> Field<'a> {
    fn as_u32(&self) -> Result<u32, ProtocolError> {
        match self {
            Field::Varint(value) => Ok(*value as u32),
            _ => Err(ProtocolError::Malformed("expected varint field")),
        }
    }

    fn as_bool(&self) -> Result<bool, ProtocolError> {
        Ok(self.as_u32()? != 0)
    }

    fn as_bytes(&self) -> Result<&'a [u8], ProtocolError> {
        match self {
            Field::Len(bytes) => Ok(bytes),
            _ => Err(ProtocolError::Malformed("expected length-delimited field")),
        }
    }

    fn as_string(&self) -> Result<String, ProtocolError> {
        let bytes = self.as_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }

    fn as_uuid(&self) -> Result<Uuid, ProtocolError> {
        Uuid::from_slice(self.as_bytes()?).map_err(|_| ProtocolError::Malformed("uuid must be 16 bytes"))
    }
}

/// Iterates over the fields of an encoded message.
struct ProtoReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ProtoReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn varint(&mut self) -> Result<u64, ProtocolError> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = *self
                .buf
                .get(self.pos)
                .ok_or(ProtocolError::Malformed("truncated varint"))?;
            self.pos += 1;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(ProtocolError::Malformed("varint too long"))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(ProtocolError::Malformed("truncated field"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn next_field(&mut self) -> Result<Option<(u32, Field<'a>)>, ProtocolError> {
        if self.pos >= self.buf.len() {
            return Ok(None);
        }
        let key = self.varint()?;
        let field = (key >> 3) as u32;
        let value = match (key & 0x7) as u8 {
            WIRE_VARINT => Field::Varint(self.varint()?),
            WIRE_LEN => {
                let len = self.varint()? as usize;
                Field::Len(self.take(len)?)
            }
            WIRE_FIXED64 => {
                self.take(8)?;
                Field::Fixed
            }
            WIRE_FIXED32 => {
                self.take(4)?;
                Field::Fixed
            }
            _ => return Err(ProtocolError::Malformed("unsupported wire type")),
        };
        Ok(Some((field, value)))
    }
}

/// Runs `f` for every field of `buf`.
fn for_each_field<'a>(
    buf: &'a [u8],
    mut f: impl FnMut(u32, Field<'a>) -> Result<(), ProtocolError>,
) -> Result<(), ProtocolError> {
    let mut reader = ProtoReader::new(buf);
    while let Some((number, field)) = reader.next_field()? {
        f(number, field)?;
    }
    Ok(())
}

/// The gateway's protobuf schema.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtobufCodec;

impl ProtobufCodec {
    pub fn new() -> Self {
        Self
    }

    /// Encodes a discovery response, as sent by a gateway.
    pub fn encode_discovery_response(&self, response: &SearchGatewayResponse) -> Bytes {
        let mut inner = ProtoWriter::new();
        inner
            .string(1, &response.address)
            .bytes(2, response.uuid.as_bytes())
            .uint32(3, response.version);
        let mut outer = ProtoWriter::new();
        outer.message(2, inner);
        outer.finish()
    }

    fn encode_alarm(alarm: &CnAlarmNotification) -> ProtoWriter {
        let mut w = ProtoWriter::new();
        w.uint32(1, alarm.zone)
            .uint32(2, alarm.product_id)
            .uint32(3, alarm.product_variant)
            .string(4, &alarm.serial_number)
            .uint32(5, alarm.sw_program_version)
            .bytes(6, &alarm.errors)
            .uint32(7, alarm.error_id)
            .uint32(8, alarm.node_id);
        w
    }

    fn decode_alarm(buf: &[u8]) -> Result<CnAlarmNotification, ProtocolError> {
        let mut alarm = CnAlarmNotification::default();
        for_each_field(buf, |number, field| {
            match number {
                1 => alarm.zone = field.as_u32()?,
                2 => alarm.product_id = field.as_u32()?,
                3 => alarm.product_variant = field.as_u32()?,
                4 => alarm.serial_number = field.as_string()?,
                5 => alarm.sw_program_version = field.as_u32()?,
                6 => alarm.errors = field.as_bytes()?.to_vec(),
                7 => alarm.error_id = field.as_u32()?,
                8 => alarm.node_id = field.as_u32()?,
                _ => {}
            }
            Ok(())
        })?;
        Ok(alarm)
    }
}

/// Returns the opcode a typed payload belongs to.
fn payload_opcode(payload: &Payload) -> Option<Opcode> {
    Some(match payload {
        Payload::Empty | Payload::Raw(_) => return None,
        Payload::RegisterDevice(_) => Opcode::RegisterDeviceRequest,
        Payload::StartSession(_) => Opcode::StartSessionRequest,
        Payload::StartSessionConfirm(_) => Opcode::StartSessionConfirm,
        Payload::ListRegisteredDevicesConfirm(_) => Opcode::ListRegisteredDevicesConfirm,
        Payload::DeregisterDevice(_) => Opcode::DeregisterDeviceRequest,
        Payload::VersionConfirm(_) => Opcode::VersionConfirm,
        Payload::TimeRequest(_) => Opcode::CnTimeRequest,
        Payload::TimeConfirm(_) => Opcode::CnTimeConfirm,
        Payload::NodeNotification(_) => Opcode::CnNodeNotification,
        Payload::RmiRequest(_) => Opcode::CnRmiRequest,
        Payload::RmiResponse(_) => Opcode::CnRmiResponse,
        Payload::RpdoRequest(_) => Opcode::CnRpdoRequest,
        Payload::RpdoNotification(_) => Opcode::CnRpdoNotification,
        Payload::AlarmNotification(_) => Opcode::CnAlarmNotification,
        Payload::GatewayNotification(_) => Opcode::GatewayNotification,
    })
}

impl MessageCodec for ProtobufCodec {
    fn encode_operation(&self, operation: &Operation) -> Result<Bytes, ProtocolError> {
        let mut w = ProtoWriter::new();
        w.uint32(1, operation.opcode.as_u32());
        if let Some(result) = operation.result {
            w.uint32(2, result.code());
        }
        if let Some(ref description) = operation.description {
            w.string(3, description);
        }
        w.uint32(4, operation.id);
        Ok(w.finish())
    }

    fn decode_operation(&self, buf: &[u8]) -> Result<Operation, ProtocolError> {
        let mut opcode = None;
        let mut result = None;
        let mut description = None;
        let mut id = 0;
        for_each_field(buf, |number, field| {
            match number {
                1 => opcode = Some(Opcode::from_u32(field.as_u32()?)?),
                2 => result = Some(GatewayResult::from_code(field.as_u32()?)?),
                3 => description = Some(field.as_string()?),
                4 => id = field.as_u32()?,
                _ => {}
            }
            Ok(())
        })?;

        Ok(Operation {
            opcode: opcode.ok_or(ProtocolError::MissingField("type"))?,
            id,
            result,
            description,
        })
    }

    fn encode_payload(&self, opcode: Opcode, payload: &Payload) -> Result<Bytes, ProtocolError> {
        if let Some(expected) = payload_opcode(payload) {
            if expected != opcode {
                return Err(ProtocolError::UnexpectedPayload(opcode.name()));
            }
        }

        let mut w = ProtoWriter::new();
        match payload {
            Payload::Empty => {}
            Payload::Raw(bytes) => return Ok(bytes.clone()),
            Payload::RegisterDevice(req) => {
                w.bytes(1, req.uuid.as_bytes())
                    .uint32(2, req.pin)
                    .string(3, &req.device_name);
            }
            Payload::StartSession(req) => {
                w.bool(1, req.takeover);
            }
            Payload::StartSessionConfirm(confirm) => {
                if let Some(ref name) = confirm.device_name {
                    w.string(1, name);
                }
                w.bool(2, confirm.resumed);
            }
            Payload::ListRegisteredDevicesConfirm(confirm) => {
                for device in &confirm.devices {
                    let mut app = ProtoWriter::new();
                    app.bytes(1, device.uuid.as_bytes())
                        .string(2, &device.device_name);
                    w.message(1, app);
                }
            }
            Payload::DeregisterDevice(req) => {
                w.bytes(1, req.uuid.as_bytes());
            }
            Payload::VersionConfirm(confirm) => {
                w.uint32(1, confirm.gateway_version)
                    .string(2, &confirm.serial_number)
                    .uint32(3, confirm.comfonet_version);
            }
            Payload::TimeRequest(req) => {
                if let Some(time) = req.set_time {
                    w.uint32(1, time);
                }
            }
            Payload::TimeConfirm(confirm) => {
                w.uint32(1, confirm.current_time);
            }
            Payload::NodeNotification(node) => {
                w.uint32(1, node.node_id)
                    .uint32(2, node.product_id)
                    .uint32(3, node.zone_id)
                    .uint32(4, node.mode.code());
            }
            Payload::RmiRequest(req) => {
                w.uint32(1, req.node_id).bytes(2, &req.message);
            }
            Payload::RmiResponse(resp) => {
                w.uint32(1, resp.result).bytes(2, &resp.message);
            }
            Payload::RpdoRequest(req) => {
                w.uint32(1, req.pdid)
                    .uint32(2, req.zone)
                    .uint32(3, req.data_type)
                    .uint32(4, req.timeout);
                if let Some(interval) = req.interval {
                    w.uint32(5, interval);
                }
            }
            Payload::RpdoNotification(notification) => {
                w.uint32(1, notification.pdid)
                    .bytes(2, &notification.data)
                    .uint32(3, notification.zone);
            }
            Payload::AlarmNotification(alarm) => {
                w = Self::encode_alarm(alarm);
            }
            Payload::GatewayNotification(notification) => {
                for uuid in &notification.push_uuids {
                    w.bytes(1, uuid.as_bytes());
                }
                if let Some(ref alarm) = notification.alarm {
                    w.message(2, Self::encode_alarm(alarm));
                }
            }
        }
        Ok(w.finish())
    }

    fn decode_payload(&self, opcode: Opcode, buf: &[u8]) -> Result<Payload, ProtocolError> {
        let payload = match opcode {
            Opcode::RegisterDeviceRequest => {
                let mut uuid = None;
                let mut pin = 0;
                let mut device_name = String::new();
                for_each_field(buf, |number, field| {
                    match number {
                        1 => uuid = Some(field.as_uuid()?),
                        2 => pin = field.as_u32()?,
                        3 => device_name = field.as_string()?,
                        _ => {}
                    }
                    Ok(())
                })?;
                Payload::RegisterDevice(RegisterDeviceRequest {
                    uuid: uuid.ok_or(ProtocolError::MissingField("uuid"))?,
                    pin,
                    device_name,
                })
            }
            Opcode::StartSessionRequest => {
                let mut takeover = false;
                for_each_field(buf, |number, field| {
                    if number == 1 {
                        takeover = field.as_bool()?;
                    }
                    Ok(())
                })?;
                Payload::StartSession(StartSessionRequest { takeover })
            }
            Opcode::StartSessionConfirm => {
                let mut confirm = StartSessionConfirm::default();
                for_each_field(buf, |number, field| {
                    match number {
                        1 => confirm.device_name = Some(field.as_string()?),
                        2 => confirm.resumed = field.as_bool()?,
                        _ => {}
                    }
                    Ok(())
                })?;
                Payload::StartSessionConfirm(confirm)
            }
            Opcode::ListRegisteredDevicesConfirm => {
                let mut devices = Vec::new();
                for_each_field(buf, |number, field| {
                    if number == 1 {
                        let mut uuid = None;
                        let mut device_name = String::new();
                        for_each_field(field.as_bytes()?, |number, field| {
                            match number {
                                1 => uuid = Some(field.as_uuid()?),
                                2 => device_name = field.as_string()?,
                                _ => {}
                            }
                            Ok(())
                        })?;
                        devices.push(RegisteredDevice {
                            uuid: uuid.ok_or(ProtocolError::MissingField("uuid"))?,
                            device_name,
                        });
                    }
                    Ok(())
                })?;
                Payload::ListRegisteredDevicesConfirm(ListRegisteredDevicesConfirm { devices })
            }
            Opcode::DeregisterDeviceRequest => {
                let mut uuid = None;
                for_each_field(buf, |number, field| {
                    if number == 1 {
                        uuid = Some(field.as_uuid()?);
                    }
                    Ok(())
                })?;
                Payload::DeregisterDevice(DeregisterDeviceRequest {
                    uuid: uuid.ok_or(ProtocolError::MissingField("uuid"))?,
                })
            }
            Opcode::VersionConfirm => {
                let mut confirm = VersionConfirm::default();
                for_each_field(buf, |number, field| {
                    match number {
                        1 => confirm.gateway_version = field.as_u32()?,
                        2 => confirm.serial_number = field.as_string()?,
                        3 => confirm.comfonet_version = field.as_u32()?,
                        _ => {}
                    }
                    Ok(())
                })?;
                Payload::VersionConfirm(confirm)
            }
            Opcode::CnTimeRequest => {
                let mut request = CnTimeRequest::default();
                for_each_field(buf, |number, field| {
                    if number == 1 {
                        request.set_time = Some(field.as_u32()?);
                    }
                    Ok(())
                })?;
                Payload::TimeRequest(request)
            }
            Opcode::CnTimeConfirm => {
                let mut confirm = CnTimeConfirm::default();
                for_each_field(buf, |number, field| {
                    if number == 1 {
                        confirm.current_time = field.as_u32()?;
                    }
                    Ok(())
                })?;
                Payload::TimeConfirm(confirm)
            }
            Opcode::CnNodeNotification => {
                let mut node = CnNodeNotification::default();
                for_each_field(buf, |number, field| {
                    match number {
                        1 => node.node_id = field.as_u32()?,
                        2 => node.product_id = field.as_u32()?,
                        3 => node.zone_id = field.as_u32()?,
                        4 => node.mode = NodeMode::from_code(field.as_u32()?),
                        _ => {}
                    }
                    Ok(())
                })?;
                Payload::NodeNotification(node)
            }
            Opcode::CnRmiRequest => {
                let mut node_id = None;
                let mut message = Bytes::new();
                for_each_field(buf, |number, field| {
                    match number {
                        1 => node_id = Some(field.as_u32()?),
                        2 => message = Bytes::copy_from_slice(field.as_bytes()?),
                        _ => {}
                    }
                    Ok(())
                })?;
                Payload::RmiRequest(CnRmiRequest {
                    node_id: node_id.ok_or(ProtocolError::MissingField("nodeId"))?,
                    message,
                })
            }
            Opcode::CnRmiResponse => {
                let mut response = CnRmiResponse::default();
                for_each_field(buf, |number, field| {
                    match number {
                        1 => response.result = field.as_u32()?,
                        2 => response.message = Bytes::copy_from_slice(field.as_bytes()?),
                        _ => {}
                    }
                    Ok(())
                })?;
                Payload::RmiResponse(response)
            }
            Opcode::CnRpdoRequest => {
                let mut pdid = None;
                let mut request = CnRpdoRequest::new(0, 0);
                for_each_field(buf, |number, field| {
                    match number {
                        1 => pdid = Some(field.as_u32()?),
                        2 => request.zone = field.as_u32()?,
                        3 => request.data_type = field.as_u32()?,
                        4 => request.timeout = field.as_u32()?,
                        5 => request.interval = Some(field.as_u32()?),
                        _ => {}
                    }
                    Ok(())
                })?;
                request.pdid = pdid.ok_or(ProtocolError::MissingField("pdid"))?;
                Payload::RpdoRequest(request)
            }
            Opcode::CnRpdoNotification => {
                let mut pdid = None;
                let mut data = Bytes::new();
                let mut zone = DEFAULT_RPDO_ZONE;
                for_each_field(buf, |number, field| {
                    match number {
                        1 => pdid = Some(field.as_u32()?),
                        2 => data = Bytes::copy_from_slice(field.as_bytes()?),
                        3 => zone = field.as_u32()?,
                        _ => {}
                    }
                    Ok(())
                })?;
                Payload::RpdoNotification(CnRpdoNotification {
                    pdid: pdid.ok_or(ProtocolError::MissingField("pdid"))?,
                    data,
                    zone,
                })
            }
            Opcode::CnAlarmNotification => Payload::AlarmNotification(Self::decode_alarm(buf)?),
            Opcode::GatewayNotification => {
                let mut notification = GatewayNotification::default();
                for_each_field(buf, |number, field| {
                    match number {
                        1 => notification.push_uuids.push(field.as_uuid()?),
                        2 => notification.alarm = Some(Self::decode_alarm(field.as_bytes()?)?),
                        _ => {}
                    }
                    Ok(())
                })?;
                Payload::GatewayNotification(notification)
            }
            _ if buf.is_empty() => Payload::Empty,
            _ => Payload::Raw(Bytes::copy_from_slice(buf)),
        };
        Ok(payload)
    }

    fn encode_discovery_request(&self) -> Bytes {
        let mut w = ProtoWriter::new();
        w.message(1, ProtoWriter::new());
        w.finish()
    }

    fn decode_discovery_response(&self, buf: &[u8]) -> Result<SearchGatewayResponse, ProtocolError> {
        let mut response = None;
        for_each_field(buf, |number, field| {
            if number == 2 {
                response = Some(field.as_bytes()?);
            }
            Ok(())
        })?;
        let response = response.ok_or(ProtocolError::MissingField("searchGatewayResponse"))?;

        let mut address = String::new();
        let mut uuid = None;
        let mut version = 0;
        for_each_field(response, |number, field| {
            match number {
                1 => address = field.as_string()?,
                2 => uuid = Some(field.as_uuid()?),
                3 => version = field.as_u32()?,
                _ => {}
            }
            Ok(())
        })?;

        Ok(SearchGatewayResponse {
            address,
            uuid: uuid.ok_or(ProtocolError::MissingField("uuid"))?,
            version,
        })
    }
}
