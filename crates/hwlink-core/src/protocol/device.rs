//! Device families and negotiated link parameters

use serde::{Deserialize, Serialize};

/// Envelope format spoken by a device family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// Caller-encoded commands, no outer framing
    V1,
    /// Every frame starts with the V2 marker; plain payloads get an L1 wrap
    V2,
}

/// Closed set of device families the core knows how to talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    /// Wired desktop wallet
    Classic,
    /// Wireless handheld wallet, pairs with a one-time passcode
    Mobile,
    /// Card-form wallet on the V2 protocol, pairs with a one-time passcode
    Card,
    /// Any device running its bootloader (firmware update mode)
    Bootloader,
    /// In-process virtual device
    Virtual,
}

impl DeviceType {
    /// Default link parameters for this family
    pub fn profile(self) -> LinkProfile {
        let (version, packet_size) = match self {
            DeviceType::Classic => (ProtocolVersion::V1, 64),
            DeviceType::Mobile => (ProtocolVersion::V1, 64),
            DeviceType::Card => (ProtocolVersion::V2, 112),
            DeviceType::Bootloader => (ProtocolVersion::V1, 64),
            DeviceType::Virtual => (ProtocolVersion::V1, 64),
        };
        LinkProfile {
            device_type: self,
            version,
            packet_size,
        }
    }

    /// Whether a session must be authenticated before it is usable
    pub fn requires_auth(self) -> bool {
        matches!(self, DeviceType::Mobile | DeviceType::Card)
    }
}

/// Parameters a link adapter reports on a successful connect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkProfile {
    /// Device family
    pub device_type: DeviceType,
    /// Framing protocol
    pub version: ProtocolVersion,
    /// Maximum bytes per link write
    pub packet_size: usize,
}

impl LinkProfile {
    /// Override the packet size of a family default
    pub fn with_packet_size(mut self, packet_size: usize) -> Self {
        self.packet_size = packet_size;
        self
    }

    /// Override the protocol version of a family default
    pub fn with_version(mut self, version: ProtocolVersion) -> Self {
        self.version = version;
        self
    }
}

/// Identity of the connected device, fixed for the life of the connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Device family
    pub device_type: DeviceType,
    /// Framing protocol
    pub version: ProtocolVersion,
    /// Maximum bytes per link write
    pub packet_size: usize,
    /// Adapter-specific device address (port name, BLE id, ...)
    pub address: String,
}

impl DeviceIdentity {
    /// Identity from the profile reported at connect
    pub fn new(profile: LinkProfile, address: impl Into<String>) -> Self {
        Self {
            device_type: profile.device_type,
            version: profile.version,
            packet_size: profile.packet_size,
            address: address.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_defaults() {
        assert_eq!(DeviceType::Card.profile().version, ProtocolVersion::V2);
        assert_eq!(DeviceType::Card.profile().packet_size, 112);
        assert_eq!(DeviceType::Classic.profile().packet_size, 64);
        assert!(DeviceType::Mobile.requires_auth());
        assert!(!DeviceType::Bootloader.requires_auth());
    }
}
