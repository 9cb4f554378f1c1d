//! Physical link adapters
//!
//! A link adapter only knows how to open a link to one device, write one
//! packet-sized chunk at a time, and push whatever bytes arrive onto the
//! inbound channel it was handed at connect time. Framing, reassembly and the
//! exchange state machine live in [`crate::protocol`] and are shared by every
//! backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::protocol::{LinkError, LinkProfile};

pub mod serial;
pub mod virtual_link;
pub mod wired;

pub use serial::{list_ports, sort_ports, PortInfo};
pub use virtual_link::{EchoDevice, Loopback, VirtualDevice, VirtualLink, VirtualLinkHandle};
pub use wired::{PortScanner, WiredLink, WiredLinkConfig, WiredTarget};

/// Something that happened on the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Bytes received from the device, in receipt order
    Data(Vec<u8>),
    /// The link dropped underneath us
    Disconnected(String),
}

/// Physical transport family of an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkKind {
    /// Bluetooth Low Energy
    Ble,
    /// USB bulk transfer
    Usb,
    /// USB HID reports
    Hid,
    /// USB CDC or UART serial port
    Serial,
    /// TCP bridge to a device or emulator
    Tcp,
    /// In-process device
    Virtual,
}

/// Narrow contract every physical backend implements
#[async_trait]
pub trait LinkAdapter: Send {
    /// Transport family, for diagnostics
    fn kind(&self) -> LinkKind;

    /// Address of the bound device (port name, BLE id, ...)
    fn address(&self) -> String;

    /// Open the link and report the device's negotiated parameters.
    ///
    /// Received bytes and link loss must be pushed onto `inbound` in receipt
    /// order until [`LinkAdapter::disconnect`] is called.
    async fn connect(&mut self, inbound: mpsc::Sender<LinkEvent>)
        -> Result<LinkProfile, LinkError>;

    /// Transmit exactly one packet-sized chunk
    async fn write(&mut self, chunk: &[u8]) -> Result<(), LinkError>;

    /// Tear the link down. Must be safe to call on a closed link.
    async fn disconnect(&mut self) -> Result<(), LinkError>;
}

/// A device seen (or lost) during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// A port appeared
    Discovered(PortInfo),
    /// The named port went away
    Vanished(String),
}

/// Optional multi-device discovery offered by some backends
#[async_trait]
pub trait Scanner: Send + Sync {
    /// Report devices appearing and disappearing until `timeout` elapses
    async fn scan(
        &self,
        timeout: Duration,
        events: mpsc::Sender<ScanEvent>,
    ) -> Result<(), LinkError>;
}
