//! The message type registry: the ordered table that gives every message its
//! one-byte on-wire type.
//!
//! The registry is the wire contract shared with the firmware. A message's
//! on-wire type is its *index* in this table, not its name, so existing
//! entries must never be reordered or removed across protocol versions —
//! only appending new entries is safe.
//!
//! Following the crate-wide rule of explicit configuration over ambient
//! globals, a registry is constructed once at startup and passed by
//! [`std::sync::Arc`] into every connection manager and device. Tests that
//! need a divergent wire table simply build their own.

use crate::error::ProtocolError;

/// The standard firmware message table, in wire order.
pub const DEFAULT_MESSAGE_TYPES: &[&str] = &[
    "batteryLevel",
    "getName",
    "setName",
    "getDeviceType",
    "setDeviceType",
    "getSensorDataConfigurations",
    "setSensorDataConfigurations",
    "sensorData",
    "triggerVibration",
    "getFirmwareVersion",
    "fileTransferInfo",
    "fileTransferData",
];

/// Message types carrying device identity and housekeeping data. The
/// connection manager dispatches these on a separate channel from the
/// generic data path so the `Device` layer can keep its cached identity
/// fields current without the data path knowing about them.
pub const META_MESSAGE_TYPES: &[&str] = &[
    "batteryLevel",
    "getName",
    "getDeviceType",
    "getFirmwareVersion",
];

/// An ordered, append-only table of message-type names.
///
/// ```
/// # use solekit::registry::MessageRegistry;
/// let registry = MessageRegistry::default();
/// let idx = registry.index_of("sensorData").unwrap();
/// assert_eq!(registry.name(idx), Some("sensorData"));
/// ```
#[derive(Debug, Clone)]
pub struct MessageRegistry {
    entries: Vec<String>,
}

impl MessageRegistry {
    /// Build a registry from an ordered list of names. At most 256 entries
    /// are meaningful since the wire type is a single byte; extras are
    /// truncated.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: names.into_iter().map(Into::into).take(256).collect(),
        }
    }

    /// The wire index for `name`, or `UnknownMessageType` if absent.
    pub fn index_of(&self, name: &str) -> Result<u8, ProtocolError> {
        self.entries
            .iter()
            .position(|n| n == name)
            .map(|i| i as u8)
            .ok_or_else(|| ProtocolError::UnknownMessageType(name.to_owned()))
    }

    /// The name at wire index `index`, if the index has an entry.
    pub fn name(&self, index: u8) -> Option<&str> {
        self.entries.get(index as usize).map(String::as_str)
    }

    /// Whether `name` belongs to the device-meta subset that the connection
    /// manager routes onto its meta channel.
    pub fn is_meta(&self, name: &str) -> bool {
        META_MESSAGE_TYPES.contains(&name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MESSAGE_TYPES.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_is_index_stable() {
        let r = MessageRegistry::default();
        // Spot-check a few anchors of the wire contract. If one of these
        // fails, the table was reordered and every deployed device breaks.
        assert_eq!(r.index_of("batteryLevel").unwrap(), 0);
        assert_eq!(r.index_of("sensorData").unwrap(), 7);
        assert_eq!(r.index_of("triggerVibration").unwrap(), 8);
    }

    #[test]
    fn unknown_name_is_rejected() {
        let r = MessageRegistry::default();
        assert_eq!(
            r.index_of("noSuchThing"),
            Err(ProtocolError::UnknownMessageType("noSuchThing".into()))
        );
        assert_eq!(r.name(200), None);
    }

    #[test]
    fn custom_registry_is_independent() {
        let r = MessageRegistry::new(["a", "b"]);
        assert_eq!(r.len(), 2);
        assert_eq!(r.index_of("b").unwrap(), 1);
        assert!(!r.is_meta("a"));
    }
}
