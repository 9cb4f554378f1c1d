//! In-process virtual link
//!
//! Every written packet is handed to a [`VirtualDevice`] and whatever packets the
//! device answers with are pushed back onto the inbound channel, so the full
//! framing and exchange path runs without hardware.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{LinkAdapter, LinkEvent, LinkKind};
use crate::protocol::{
    commands::Command, encode_response, fragment, DeviceType, Framer, LinkError, LinkProfile,
    ProtocolVersion, StatusCode,
};

/// Device logic behind a virtual link
pub trait VirtualDevice: Send {
    /// Handle one packet from the host and return the packets to send back
    fn on_packet(&mut self, packet: &[u8], profile: &LinkProfile) -> Vec<Vec<u8>>;
}

/// Packetize a device response for the given profile
pub fn reply_packets(response: &[u8], profile: &LinkProfile) -> Vec<Vec<u8>> {
    match fragment(response, profile.packet_size, profile.version) {
        Ok(packets) => packets,
        Err(e) => {
            warn!("virtual device: cannot frame reply: {}", e);
            Vec::new()
        }
    }
}

/// Sends every packet straight back
#[derive(Debug, Default, Clone, Copy)]
pub struct Loopback;

impl VirtualDevice for Loopback {
    fn on_packet(&mut self, packet: &[u8], _profile: &LinkProfile) -> Vec<Vec<u8>> {
        vec![packet.to_vec()]
    }
}

/// Answers echo commands with their data in a success envelope.
///
/// V1 echo commands must fit in a single packet; V2 commands are reassembled.
#[derive(Debug, Default)]
pub struct EchoDevice {
    framer: Option<Framer>,
}

impl EchoDevice {
    /// Device with no partial command buffered
    pub fn new() -> Self {
        Self::default()
    }

    fn next_command(&mut self, packet: &[u8], profile: &LinkProfile) -> Option<Vec<u8>> {
        match profile.version {
            ProtocolVersion::V1 => Some(packet.to_vec()),
            ProtocolVersion::V2 => {
                let framer = self
                    .framer
                    .get_or_insert_with(|| Framer::new(ProtocolVersion::V2, usize::MAX));
                match framer.feed(packet) {
                    Ok(command) => command,
                    Err(e) => {
                        warn!("echo device: dropping malformed frame: {}", e);
                        None
                    }
                }
            }
        }
    }
}

impl VirtualDevice for EchoDevice {
    fn on_packet(&mut self, packet: &[u8], profile: &LinkProfile) -> Vec<Vec<u8>> {
        let Some(command) = self.next_command(packet, profile) else {
            return Vec::new();
        };

        let response = match Command::parse(&command) {
            Some((Command::Echo, data)) => encode_response(data, StatusCode::Success),
            Some(_) => encode_response(&[], StatusCode::UnsupportedCommand),
            None => encode_response(&[], StatusCode::InvalidParameter),
        };
        match response {
            Ok(response) => reply_packets(&response, profile),
            Err(e) => {
                warn!("echo device: {}", e);
                reply_packets(&[], profile)
            }
        }
    }
}

type InboundSlot = Arc<Mutex<Option<mpsc::Sender<LinkEvent>>>>;

fn current_sender(slot: &InboundSlot) -> Result<mpsc::Sender<LinkEvent>, LinkError> {
    slot.lock()
        .map_err(|_| LinkError::Other("virtual link lock poisoned".into()))?
        .clone()
        .ok_or(LinkError::NotOpen)
}

/// Link adapter backed by an in-process device
pub struct VirtualLink {
    profile: LinkProfile,
    device: Box<dyn VirtualDevice>,
    inbound: InboundSlot,
    name: String,
}

impl VirtualLink {
    /// Virtual link reporting `profile` on connect
    pub fn new(profile: LinkProfile, device: impl VirtualDevice + 'static) -> Self {
        Self {
            profile,
            device: Box::new(device),
            inbound: Arc::new(Mutex::new(None)),
            name: format!("virtual:{:?}", profile.device_type).to_lowercase(),
        }
    }

    /// Virtual link using the family defaults of `device_type`
    pub fn for_device(device_type: DeviceType, device: impl VirtualDevice + 'static) -> Self {
        Self::new(device_type.profile(), device)
    }

    /// Handle for injecting traffic and link failures from outside
    pub fn handle(&self) -> VirtualLinkHandle {
        VirtualLinkHandle {
            inbound: self.inbound.clone(),
        }
    }
}

#[async_trait]
impl LinkAdapter for VirtualLink {
    fn kind(&self) -> LinkKind {
        LinkKind::Virtual
    }

    fn address(&self) -> String {
        self.name.clone()
    }

    async fn connect(
        &mut self,
        inbound: mpsc::Sender<LinkEvent>,
    ) -> Result<LinkProfile, LinkError> {
        let mut slot = self
            .inbound
            .lock()
            .map_err(|_| LinkError::Other("virtual link lock poisoned".into()))?;
        if slot.is_some() {
            return Err(LinkError::Other("link already open".into()));
        }
        *slot = Some(inbound);
        Ok(self.profile)
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<(), LinkError> {
        if chunk.len() > self.profile.packet_size {
            return Err(LinkError::PacketTooLarge {
                len: chunk.len(),
                max: self.profile.packet_size,
            });
        }
        let sender = current_sender(&self.inbound)?;

        let replies = self.device.on_packet(chunk, &self.profile);
        debug!(
            "virtual link: {} byte packet in, {} packets out",
            chunk.len(),
            replies.len()
        );
        for reply in replies {
            sender
                .send(LinkEvent::Data(reply))
                .await
                .map_err(|_| LinkError::Closed)?;
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), LinkError> {
        self.inbound
            .lock()
            .map_err(|_| LinkError::Other("virtual link lock poisoned".into()))?
            .take();
        Ok(())
    }
}

/// Drives a [`VirtualLink`] from the device side
#[derive(Clone)]
pub struct VirtualLinkHandle {
    inbound: InboundSlot,
}

impl VirtualLinkHandle {
    /// True while the link is open
    pub fn is_connected(&self) -> bool {
        self.inbound.lock().map(|s| s.is_some()).unwrap_or(false)
    }

    /// Deliver bytes as if the device had sent them
    pub async fn inject(&self, bytes: Vec<u8>) -> Result<(), LinkError> {
        current_sender(&self.inbound)?
            .send(LinkEvent::Data(bytes))
            .await
            .map_err(|_| LinkError::Closed)
    }

    /// Simulate the link dropping (device unplugged, out of range)
    pub async fn sever(&self, reason: &str) -> Result<(), LinkError> {
        let sender = current_sender(&self.inbound)?;
        if let Ok(mut slot) = self.inbound.lock() {
            slot.take();
        }
        sender
            .send(LinkEvent::Disconnected(reason.to_string()))
            .await
            .map_err(|_| LinkError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_status, Framer};

    #[tokio::test]
    async fn test_loopback_returns_packets() {
        let mut link = VirtualLink::for_device(DeviceType::Virtual, Loopback);
        let (tx, mut rx) = mpsc::channel(4);
        link.connect(tx).await.unwrap();
        link.write(&[1, 2, 3]).await.unwrap();
        assert_eq!(rx.recv().await, Some(LinkEvent::Data(vec![1, 2, 3])));
    }

    #[tokio::test]
    async fn test_write_before_connect() {
        let mut link = VirtualLink::for_device(DeviceType::Virtual, Loopback);
        assert!(matches!(link.write(&[1]).await, Err(LinkError::NotOpen)));
    }

    #[tokio::test]
    async fn test_oversized_write_rejected() {
        let mut link = VirtualLink::for_device(DeviceType::Virtual, Loopback);
        let (tx, _rx) = mpsc::channel(4);
        link.connect(tx).await.unwrap();
        assert!(matches!(
            link.write(&[0u8; 65]).await,
            Err(LinkError::PacketTooLarge { len: 65, max: 64 })
        ));
    }

    #[test]
    fn test_echo_device_v2() {
        let profile = DeviceType::Card.profile();
        let mut device = EchoDevice::new();
        let command = crate::protocol::commands::echo(&[0x42; 200]);
        let packets = fragment(&command, profile.packet_size, profile.version).unwrap();

        let mut replies = Vec::new();
        for packet in &packets {
            replies.extend(device.on_packet(packet, &profile));
        }

        let mut framer = Framer::new(ProtocolVersion::V2, usize::MAX);
        let mut response = None;
        for reply in &replies {
            if let Some(r) = framer.feed(reply).unwrap() {
                response = Some(r);
            }
        }
        let response = response.expect("Should reassemble");
        let (status, data) = decode_status(&response).unwrap();
        assert_eq!(status, StatusCode::Success);
        assert_eq!(data, &[0x42; 200][..]);
    }

    #[test]
    fn test_echo_device_unknown_command() {
        let profile = DeviceType::Classic.profile();
        let mut device = EchoDevice::new();
        let replies = device.on_packet(&[0xF8, 0x01], &profile);
        let (status, _) = decode_status(&replies.concat()).unwrap();
        assert_eq!(status, StatusCode::UnsupportedCommand);
    }

    #[tokio::test]
    async fn test_handle_sever() {
        let mut link = VirtualLink::for_device(DeviceType::Virtual, Loopback);
        let handle = link.handle();
        let (tx, mut rx) = mpsc::channel(4);
        link.connect(tx).await.unwrap();
        assert!(handle.is_connected());
        handle.sever("unplugged").await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(LinkEvent::Disconnected("unplugged".into()))
        );
        assert!(!handle.is_connected());
        assert!(matches!(link.write(&[1]).await, Err(LinkError::NotOpen)));
    }
}
