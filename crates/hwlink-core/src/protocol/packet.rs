//! Packet framing
//!
//! Splits logical commands into link-sized packets and reassembles logical
//! responses from the packets a link delivers.
//!
//! V1 traffic is sent as-is: commands embed their own length and responses are
//! status envelopes (see [`super::status`]).
//!
//! V2 traffic is always a V2 frame:
//! - 1 byte: frame marker (0xF8)
//! - 1 byte: frame kind
//! - 2 bytes: body length (little-endian)
//! - N bytes: body
//!
//! Payloads that are not already V2 frames travel inside an L1 frame (kind 0x4C)
//! which is stripped again on reassembly. L1 frames carry a 4-byte length so a
//! wrapped payload is not limited to 64 KiB.

use byteorder::{ByteOrder, LittleEndian};
use tracing::debug;

use super::{ProtocolVersion, TransportError, ENVELOPE_OVERHEAD};

/// First byte of every V2 frame
pub const V2_FRAME_MARKER: u8 = 0xF8;

/// Frame kind of the L1 wrap applied to plain payloads
pub const L1_KIND: u8 = 0x4C;

/// Marker + kind + length of a native V2 frame
pub const V2_HEADER_LEN: usize = 4;

/// Marker + kind + 32-bit length of an L1 frame
pub const L1_HEADER_LEN: usize = 6;

/// Largest body an L1 frame can carry
pub const MAX_V2_BODY: usize = u32::MAX as usize;

/// Check whether `payload` is already a self-describing V2 frame.
///
/// L1 frames are excluded so that a payload which merely looks like one is
/// wrapped again and comes back unchanged.
pub fn is_v2_frame(payload: &[u8]) -> bool {
    payload.len() >= V2_HEADER_LEN
        && payload[0] == V2_FRAME_MARKER
        && payload[1] != L1_KIND
        && LittleEndian::read_u16(&payload[2..4]) as usize == payload.len() - V2_HEADER_LEN
}

/// Wrap a payload in an L1 frame
pub fn wrap_l1(payload: &[u8]) -> Result<Vec<u8>, TransportError> {
    if payload.len() > MAX_V2_BODY {
        return Err(TransportError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_V2_BODY,
        });
    }

    let mut frame = Vec::with_capacity(L1_HEADER_LEN + payload.len());
    frame.push(V2_FRAME_MARKER);
    frame.push(L1_KIND);
    let mut len_bytes = [0u8; 4];
    LittleEndian::write_u32(&mut len_bytes, payload.len() as u32);
    frame.extend_from_slice(&len_bytes);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Body of a complete L1 frame, or `None` if `frame` is not one
pub fn unwrap_l1(frame: &[u8]) -> Option<&[u8]> {
    if frame.len() < L1_HEADER_LEN || frame[0] != V2_FRAME_MARKER || frame[1] != L1_KIND {
        return None;
    }
    let len = LittleEndian::read_u32(&frame[2..6]) as usize;
    frame.get(L1_HEADER_LEN..L1_HEADER_LEN + len)
}

/// Encode a logical payload into packets of at most `packet_size` bytes
pub fn fragment(
    payload: &[u8],
    packet_size: usize,
    version: ProtocolVersion,
) -> Result<Vec<Vec<u8>>, TransportError> {
    if packet_size == 0 {
        return Err(TransportError::Config("packet size must be positive".into()));
    }

    let wrapped;
    let wire: &[u8] = match version {
        ProtocolVersion::V2 if !is_v2_frame(payload) => {
            wrapped = wrap_l1(payload)?;
            &wrapped
        }
        _ => payload,
    };

    Ok(wire.chunks(packet_size).map(<[u8]>::to_vec).collect())
}

/// Incremental reassembler for inbound packets
#[derive(Debug, Clone)]
pub struct Framer {
    version: ProtocolVersion,
    max_response_size: usize,
    buffer: Vec<u8>,
}

impl Framer {
    /// Create a framer for the given version.
    ///
    /// `max_response_size` bounds the declared length of a single response
    /// including its 4 bytes of header/status overhead.
    pub fn new(version: ProtocolVersion, max_response_size: usize) -> Self {
        Self {
            version,
            max_response_size,
            buffer: Vec::new(),
        }
    }

    /// Protocol version this framer reassembles
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Bytes accumulated for the response in progress
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partially received response
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Feed one received packet.
    ///
    /// Returns the complete response once enough bytes have arrived. Bytes past
    /// the end of the declared frame (link padding) are discarded.
    pub fn feed(&mut self, packet: &[u8]) -> Result<Option<Vec<u8>>, TransportError> {
        self.buffer.extend_from_slice(packet);

        let result = match self.version {
            ProtocolVersion::V1 => self.take_envelope(),
            ProtocolVersion::V2 => self.take_v2_frame(),
        };

        if result.is_err() {
            self.reset();
        }
        result
    }

    fn take_envelope(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        if self.buffer.len() < 2 {
            return Ok(None);
        }

        let total = LittleEndian::read_u16(&self.buffer[0..2]) as usize + ENVELOPE_OVERHEAD;
        self.check_size(total)?;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let response = self.complete(total);
        Ok(Some(response))
    }

    fn take_v2_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        match self.buffer.first() {
            None => return Ok(None),
            Some(&V2_FRAME_MARKER) => {}
            Some(other) => {
                return Err(TransportError::Protocol(format!(
                    "expected V2 frame marker {:#04x}, got {:#04x}",
                    V2_FRAME_MARKER, other
                )))
            }
        }
        let Some(&kind) = self.buffer.get(1) else {
            return Ok(None);
        };
        let header_len = if kind == L1_KIND {
            L1_HEADER_LEN
        } else {
            V2_HEADER_LEN
        };
        if self.buffer.len() < header_len {
            return Ok(None);
        }

        let body_len = if kind == L1_KIND {
            LittleEndian::read_u32(&self.buffer[2..6]) as usize
        } else {
            LittleEndian::read_u16(&self.buffer[2..4]) as usize
        };
        let total = body_len.saturating_add(header_len);
        self.check_size(total)?;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let mut frame = self.complete(total);
        if kind == L1_KIND {
            frame = frame.split_off(L1_HEADER_LEN);
        }
        Ok(Some(frame))
    }

    fn check_size(&self, total: usize) -> Result<(), TransportError> {
        if total > self.max_response_size {
            return Err(TransportError::Protocol(format!(
                "declared response of {} bytes exceeds limit of {}",
                total, self.max_response_size
            )));
        }
        Ok(())
    }

    fn complete(&mut self, total: usize) -> Vec<u8> {
        if self.buffer.len() > total {
            debug!(
                "framer: dropping {} bytes of padding",
                self.buffer.len() - total
            );
        }
        self.buffer.truncate(total);
        std::mem::take(&mut self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_response, StatusCode};

    fn reassemble(framer: &mut Framer, packets: &[Vec<u8>]) -> Option<Vec<u8>> {
        let mut out = None;
        for packet in packets {
            if let Some(response) = framer.feed(packet).expect("Should feed") {
                out = Some(response);
            }
        }
        out
    }

    #[test]
    fn test_v1_fragment_has_no_header() {
        let payload: Vec<u8> = (0..130).map(|i| i as u8).collect();
        let packets = fragment(&payload, 64, ProtocolVersion::V1).unwrap();
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].len(), 64);
        assert_eq!(packets[2].len(), 2);
        assert_eq!(packets.concat(), payload);
    }

    #[test]
    fn test_v1_reassembly_waits_for_declared_length() {
        let envelope = encode_response(&[7u8; 100], StatusCode::Success).unwrap();
        let packets = fragment(&envelope, 64, ProtocolVersion::V1).unwrap();
        let mut framer = Framer::new(ProtocolVersion::V1, 1024);

        assert_eq!(framer.feed(&packets[0]).unwrap(), None);
        assert_eq!(framer.buffered(), 64);
        assert_eq!(framer.feed(&packets[1]).unwrap(), Some(envelope));
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_v1_padding_dropped() {
        let envelope = encode_response(&[1, 2, 3], StatusCode::Success).unwrap();
        let mut packet = envelope.clone();
        packet.resize(64, 0);
        let mut framer = Framer::new(ProtocolVersion::V1, 1024);
        assert_eq!(framer.feed(&packet).unwrap(), Some(envelope));
    }

    #[test]
    fn test_v2_wraps_plain_payload() {
        let payload = vec![0x01, 0x02, 0x03];
        let packets = fragment(&payload, 64, ProtocolVersion::V2).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(
            packets[0],
            vec![0xF8, L1_KIND, 0x03, 0x00, 0x00, 0x00, 0x01, 0x02, 0x03]
        );

        let mut framer = Framer::new(ProtocolVersion::V2, 1024);
        assert_eq!(reassemble(&mut framer, &packets), Some(payload));
    }

    #[test]
    fn test_v2_native_frame_passes_through() {
        let native = vec![V2_FRAME_MARKER, 0x08, 0x02, 0x00, 0xAA, 0xBB];
        assert!(is_v2_frame(&native));
        let packets = fragment(&native, 64, ProtocolVersion::V2).unwrap();
        assert_eq!(packets, vec![native.clone()]);

        let mut framer = Framer::new(ProtocolVersion::V2, 1024);
        assert_eq!(reassemble(&mut framer, &packets), Some(native));
    }

    #[test]
    fn test_v2_l1_lookalike_is_wrapped_again() {
        let lookalike = wrap_l1(&[9, 9]).unwrap();
        assert!(!is_v2_frame(&lookalike));
        let packets = fragment(&lookalike, 64, ProtocolVersion::V2).unwrap();
        let mut framer = Framer::new(ProtocolVersion::V2, 1024);
        assert_eq!(reassemble(&mut framer, &packets), Some(lookalike));
    }

    #[test]
    fn test_v2_rejects_missing_marker() {
        let mut framer = Framer::new(ProtocolVersion::V2, 1024);
        assert!(matches!(
            framer.feed(&[0x01, 0x00, 0x00]),
            Err(TransportError::Protocol(_))
        ));
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_oversized_declaration_rejected() {
        let mut framer = Framer::new(ProtocolVersion::V1, 16);
        assert!(framer.feed(&[0xFF, 0x00]).is_err());
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_zero_packet_size() {
        assert!(matches!(
            fragment(&[1], 0, ProtocolVersion::V1),
            Err(TransportError::Config(_))
        ));
    }

    #[test]
    fn test_l1_length_is_not_limited_to_u16() {
        let payload = vec![0x5A; 70_000];
        let frame = wrap_l1(&payload).unwrap();
        assert_eq!(&frame[2..6], &[0x70, 0x11, 0x01, 0x00]);

        let packets = fragment(&payload, 112, ProtocolVersion::V2).unwrap();
        let mut framer = Framer::new(ProtocolVersion::V2, 1 << 20);
        assert_eq!(reassemble(&mut framer, &packets), Some(payload));
    }

    #[test]
    fn test_unwrap_l1() {
        let frame = wrap_l1(b"abc").unwrap();
        assert_eq!(unwrap_l1(&frame), Some(&b"abc"[..]));
        assert_eq!(unwrap_l1(b"abc"), None);
        assert_eq!(unwrap_l1(&frame[..5]), None);
    }
}
