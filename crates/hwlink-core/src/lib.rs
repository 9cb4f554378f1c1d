//! # hwlink Core Library
//!
//! Transport protocol core for talking to hardware security devices.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Packet framing for the V1 envelope and V2/L1 protocols
//! - Status envelope decoding
//! - A single-in-flight exchange coordinator with deadlines
//! - Connection lifecycle with passcode authentication
//! - Link adapters for wired (serial / TCP) and in-process virtual devices
//!
//! ## Example
//!
//! ```rust,ignore
//! use hwlink_core::link::{EchoDevice, VirtualLink};
//! use hwlink_core::protocol::{commands, DeviceType, Transport};
//!
//! let transport = Transport::new(VirtualLink::for_device(DeviceType::Virtual, EchoDevice::new()));
//! transport.connect().await?;
//! let payload = transport.exchange(&commands::echo(b"ping")).await?;
//! assert_eq!(payload, b"ping");
//! transport.disconnect().await?;
//! ```

pub mod link;
pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::link::{LinkAdapter, LinkEvent, VirtualLink, WiredLink, WiredLinkConfig};
    pub use crate::protocol::{
        DeviceIdentity, DeviceType, LinkError, ProtocolVersion, StatusCode, Transport,
        TransportConfig, TransportError, TransportState,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
