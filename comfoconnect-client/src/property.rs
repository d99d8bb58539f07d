//! Property descriptors, subscriptions and update delivery.

use bytes::{BufMut, Bytes, BytesMut};
use comfoconnect_protocol::{property, PropertyType, PropertyValue, ProtocolError};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Post-decode transformation applied to a property value.
pub type ConvertFn = Arc<dyn Fn(PropertyValue) -> PropertyValue + Send + Sync>;

/// Callback invoked with every update of a subscribed property.
pub type PropertyListener = Arc<dyn Fn(&PropertyUpdate) + Send + Sync>;

/// RMI command byte for reading a single property.
const RMI_GET_PROPERTY: u8 = 0x01;

/// RMI command byte for writing a single property.
const RMI_SET_PROPERTY: u8 = 0x03;

/// RMI read flag requesting the current value.
const RMI_READ_VALUE: u8 = 0x10;

/// A data point the gateway pushes through RPDO notifications.
#[derive(Clone)]
pub struct PropertyDescriptor {
    pub id: u32,
    pub name: String,
    pub data_type: PropertyType,
    pub convert: Option<ConvertFn>,
}

impl PropertyDescriptor {
    pub fn new(id: u32, name: impl Into<String>, data_type: PropertyType) -> Self {
        Self {
            id,
            name: name.into(),
            data_type,
            convert: None,
        }
    }

    /// Sets a conversion applied to every decoded value, e.g. unit scaling.
    pub fn with_convert(
        mut self,
        convert: impl Fn(PropertyValue) -> PropertyValue + Send + Sync + 'static,
    ) -> Self {
        self.convert = Some(Arc::new(convert));
        self
    }

    /// Decodes a raw buffer and applies the conversion hook.
    pub fn decode(&self, raw: &[u8]) -> Result<PropertyValue, ProtocolError> {
        let value = property::decode(self.data_type, raw)?;
        Ok(match self.convert {
            Some(ref convert) => convert(value),
            None => value,
        })
    }
}

impl fmt::Debug for PropertyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("data_type", &self.data_type)
            .field("convert", &self.convert.is_some())
            .finish()
    }
}

/// A property addressed through remote method invocation on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RmiProperty {
    pub node_id: u32,
    pub unit: u8,
    pub subunit: u8,
    pub property_id: u8,
    pub name: String,
    pub data_type: PropertyType,
    pub writable: bool,
}

impl RmiProperty {
    /// Creates a read-only property on subunit 1.
    pub fn new(
        node_id: u32,
        unit: u8,
        property_id: u8,
        name: impl Into<String>,
        data_type: PropertyType,
    ) -> Self {
        Self {
            node_id,
            unit,
            subunit: 1,
            property_id,
            name: name.into(),
            data_type,
            writable: false,
        }
    }

    pub fn with_subunit(mut self, subunit: u8) -> Self {
        self.subunit = subunit;
        self
    }

    pub fn writable(mut self) -> Self {
        self.writable = true;
        self
    }

    /// Command bytes reading the current value.
    pub fn read_command(&self) -> Bytes {
        Bytes::copy_from_slice(&[
            RMI_GET_PROPERTY,
            self.unit,
            self.subunit,
            RMI_READ_VALUE,
            self.property_id,
        ])
    }

    /// Command bytes writing `value`.
    pub fn write_command(&self, value: &PropertyValue) -> Result<Bytes, ProtocolError> {
        let encoded = property::encode(self.data_type, value)?;
        let mut buf = BytesMut::with_capacity(4 + encoded.len());
        buf.put_u8(RMI_SET_PROPERTY);
        buf.put_u8(self.unit);
        buf.put_u8(self.subunit);
        buf.put_u8(self.property_id);
        buf.put_slice(&encoded);
        Ok(buf.freeze())
    }
}

/// A decoded property update delivered to listeners.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyUpdate {
    pub property_id: u32,
    pub property_name: String,
    pub data_type: PropertyType,
    pub value: PropertyValue,
    #[serde(serialize_with = "serialize_hex")]
    pub raw: Bytes,
}

fn serialize_hex<S: serde::Serializer>(raw: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(raw))
}

/// Subscription bookkeeping for one property id.
pub struct PropertySubscription {
    pub descriptor: PropertyDescriptor,
    listeners: Vec<(u64, PropertyListener)>,
    /// Whether the gateway currently knows about this subscription.
    pub registered: bool,
    /// Listener registrations in progress; each sends its own request.
    pub(crate) claims: u32,
}

impl PropertySubscription {
    pub fn new(descriptor: PropertyDescriptor) -> Self {
        Self {
            descriptor,
            listeners: Vec::new(),
            registered: false,
            claims: 0,
        }
    }

    pub(crate) fn add_listener(&mut self, key: u64, listener: PropertyListener) {
        self.listeners.push((key, listener));
    }

    pub(crate) fn remove_listener(&mut self, key: u64) {
        self.listeners.retain(|(k, _)| *k != key);
    }

    /// Returns the listeners in registration order.
    pub fn listeners(&self) -> Vec<PropertyListener> {
        self.listeners.iter().map(|(_, l)| l.clone()).collect()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Whether a new session should request this subscription again.
    pub(crate) fn needs_resubscribe(&self) -> bool {
        !self.registered && self.claims == 0 && !self.listeners.is_empty()
    }

    /// Decodes a raw notification into an update.
    pub fn update(&self, raw: Bytes) -> Result<PropertyUpdate, ProtocolError> {
        let value = self.descriptor.decode(&raw)?;
        Ok(PropertyUpdate {
            property_id: self.descriptor.id,
            property_name: self.descriptor.name.clone(),
            data_type: self.descriptor.data_type,
            value,
            raw,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_convert() {
        let descriptor = PropertyDescriptor::new(276, "supply_temperature", PropertyType::Int16)
            .with_convert(|v| PropertyValue::Float(v.as_f64().unwrap_or_default() / 10.0));
        let value = descriptor.decode(&[0xd2, 0x00]).unwrap();
        assert_eq!(value, PropertyValue::Float(21.0));

        let plain = PropertyDescriptor::new(117, "exhaust_fan_duty", PropertyType::Uint8);
        assert_eq!(plain.decode(&[42]).unwrap(), PropertyValue::Uint(42));
        assert!(plain.decode(&[]).is_err());
    }

    #[test]
    fn test_rmi_commands() {
        let property = RmiProperty::new(1, 0x15, 0x08, "firmware", PropertyType::String);
        assert_eq!(
            property.read_command().as_ref(),
            &[0x01, 0x15, 0x01, 0x10, 0x08]
        );

        let property = RmiProperty::new(1, 0x1e, 0x04, "bypass_mode", PropertyType::Uint8)
            .with_subunit(2)
            .writable();
        assert_eq!(
            property
                .write_command(&PropertyValue::Uint(1))
                .unwrap()
                .as_ref(),
            &[0x03, 0x1e, 0x02, 0x04, 0x01]
        );
        assert!(property
            .write_command(&PropertyValue::Text("x".into()))
            .is_err());
    }

    #[test]
    fn test_subscription_listeners() {
        let mut subscription =
            PropertySubscription::new(PropertyDescriptor::new(65, "fan_mode", PropertyType::Uint8));
        subscription.add_listener(1, Arc::new(|_| {}));
        subscription.add_listener(2, Arc::new(|_| {}));
        assert_eq!(subscription.listener_count(), 2);

        subscription.remove_listener(1);
        assert_eq!(subscription.listener_count(), 1);
        assert!(!subscription.registered);

        let update = subscription.update(Bytes::from_static(&[3])).unwrap();
        assert_eq!(update.property_id, 65);
        assert_eq!(update.property_name, "fan_mode");
        assert_eq!(update.value, PropertyValue::Uint(3));

        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["raw"], "03");
        assert_eq!(json["data_type"], "UINT8");
        assert_eq!(json["value"], 3);
    }

    #[test]
    fn test_needs_resubscribe() {
        let mut subscription =
            PropertySubscription::new(PropertyDescriptor::new(65, "fan_mode", PropertyType::Uint8));
        assert!(!subscription.needs_resubscribe());

        subscription.add_listener(1, Arc::new(|_| {}));
        assert!(subscription.needs_resubscribe());

        // A registration in progress sends its own request
        subscription.claims = 1;
        assert!(!subscription.needs_resubscribe());

        subscription.claims = 0;
        subscription.registered = true;
        assert!(!subscription.needs_resubscribe());
    }
}
