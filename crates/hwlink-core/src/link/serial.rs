//! Serial port discovery and setup
//!
//! Wired devices enumerate as USB CDC serial ports.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::time::Duration;
use tracing::debug;

use crate::protocol::LinkError;

/// Default baud rate for USB CDC devices (ignored by most firmware, but required)
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// An available serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyACM0" or "COM3")
    pub name: String,
    /// USB vendor and product id, for USB-attached ports
    pub usb_id: Option<(u16, u16)>,
    /// USB product string
    pub product: Option<String>,
}

impl PortInfo {
    /// Port with no USB details
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            usb_id: None,
            product: None,
        }
    }

    /// True for ports backed by a USB device
    pub fn is_usb(&self) -> bool {
        self.usb_id.is_some()
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb) => Self {
                name: info.port_name,
                usb_id: Some((usb.vid, usb.pid)),
                product: usb.product,
            },
            _ => Self::named(info.port_name),
        }
    }
}

/// USB ports first, then by name with any trailing index compared numerically
/// so that COM10 sorts after COM2.
fn port_order(port: &PortInfo) -> (bool, &str, u32) {
    let name = port.name.as_str();
    let stem = name.trim_end_matches(|c: char| c.is_ascii_digit());
    let index = name[stem.len()..].parse().unwrap_or(0);
    (!port.is_usb(), stem, index)
}

/// Sort ports into the order they are presented to the user
pub fn sort_ports(ports: &mut [PortInfo]) {
    ports.sort_by(|a, b| port_order(a).cmp(&port_order(b)));
}

/// Ports the operating system currently reports, in presentation order
pub fn list_ports() -> Vec<PortInfo> {
    let mut ports: Vec<PortInfo> = match serialport::available_ports() {
        Ok(found) => found.into_iter().map(PortInfo::from).collect(),
        Err(e) => {
            debug!("list_ports: enumeration failed: {}", e);
            Vec::new()
        }
    };
    sort_ports(&mut ports);
    ports.dedup_by(|a, b| a.name == b.name);
    ports
}

/// Open a port for packet traffic (8N1, no flow control)
pub fn open_port(
    name: &str,
    baud_rate: u32,
    timeout: Duration,
) -> Result<Box<dyn SerialPort>, LinkError> {
    let mut port = serialport::new(name, baud_rate)
        .timeout(timeout)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .open()?;

    // CDC devices only start streaming once DTR is asserted
    if let Err(e) = port.write_data_terminal_ready(true) {
        debug!("open_port: cannot assert DTR on {}: {}", name, e);
    }
    port.clear(serialport::ClearBuffer::All)?;

    debug!("open_port: {} open at {} baud", name, baud_rate);
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb(name: &str) -> PortInfo {
        PortInfo {
            usb_id: Some((0x1209, 0x0001)),
            ..PortInfo::named(name)
        }
    }

    #[test]
    fn test_list_ports_does_not_panic() {
        for port in list_ports() {
            assert!(!port.name.is_empty());
        }
    }

    #[test]
    fn test_usb_ports_first_with_numeric_index() {
        let mut ports = vec![
            PortInfo::named("/dev/ttyS0"),
            usb("/dev/ttyACM10"),
            usb("/dev/ttyACM2"),
            PortInfo::named("COM10"),
            PortInfo::named("COM2"),
            usb("/dev/ttyACM0"),
        ];
        sort_ports(&mut ports);
        let ordered: Vec<&str> = ports.iter().map(|p| p.name.as_str()).collect();

        assert_eq!(
            ordered,
            vec![
                "/dev/ttyACM0",
                "/dev/ttyACM2",
                "/dev/ttyACM10",
                "/dev/ttyS0",
                "COM2",
                "COM10",
            ]
        );
    }
}
