//! Status envelope encoding/decoding
//!
//! Every logical response carries its own length and a trailing status word:
//! - 2 bytes: data length (little-endian)
//! - N bytes: data
//! - 2 bytes: status code (big-endian)

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::TransportError;

/// Bytes of envelope overhead around the data (length prefix + status word)
pub const ENVELOPE_OVERHEAD: usize = 4;

/// Status word reported by the device at the end of every response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    /// Command completed, data is valid
    Success,
    /// Generic failure
    Fail,
    /// Device is busy with another operation
    Busy,
    /// Device gave up waiting (e.g. for user confirmation)
    Timeout,
    /// Command not recognised by the running application
    UnsupportedCommand,
    /// Malformed or out-of-range parameters
    InvalidParameter,
    /// Authentication (OTP) rejected
    AuthenticationFailed,
    /// User rejected the operation on the device
    Rejected,
    /// Any status word outside the known set
    Unknown(u16),
}

impl StatusCode {
    /// Map a raw status word to a code
    pub fn from_word(word: u16) -> Self {
        match word {
            0x9000 => StatusCode::Success,
            0x6F00 => StatusCode::Fail,
            0x6601 => StatusCode::Busy,
            0x6602 => StatusCode::Timeout,
            0x6D00 => StatusCode::UnsupportedCommand,
            0x6B00 => StatusCode::InvalidParameter,
            0x6982 => StatusCode::AuthenticationFailed,
            0x6985 => StatusCode::Rejected,
            other => StatusCode::Unknown(other),
        }
    }

    /// Raw status word as sent on the wire
    pub fn word(&self) -> u16 {
        match self {
            StatusCode::Success => 0x9000,
            StatusCode::Fail => 0x6F00,
            StatusCode::Busy => 0x6601,
            StatusCode::Timeout => 0x6602,
            StatusCode::UnsupportedCommand => 0x6D00,
            StatusCode::InvalidParameter => 0x6B00,
            StatusCode::AuthenticationFailed => 0x6982,
            StatusCode::Rejected => 0x6985,
            StatusCode::Unknown(word) => *word,
        }
    }

    /// True only for `Success`
    pub fn is_success(&self) -> bool {
        matches!(self, StatusCode::Success)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusCode::Unknown(word) => write!(f, "unknown ({:#06x})", word),
            known => write!(f, "{:?} ({:#06x})", known, known.word()),
        }
    }
}

/// Declared data length of an envelope, if the prefix is present
pub fn declared_length(response: &[u8]) -> Option<usize> {
    if response.len() < 2 {
        return None;
    }
    Some(LittleEndian::read_u16(&response[0..2]) as usize)
}

/// Split a response envelope into its status code and data
pub fn decode_status(response: &[u8]) -> Result<(StatusCode, &[u8]), TransportError> {
    let data_len = declared_length(response).ok_or_else(|| {
        TransportError::Protocol(format!(
            "response of {} bytes has no length prefix",
            response.len()
        ))
    })?;

    if response.len() < data_len + ENVELOPE_OVERHEAD {
        return Err(TransportError::Protocol(format!(
            "declared length {} needs {} bytes, got {}",
            data_len,
            data_len + ENVELOPE_OVERHEAD,
            response.len()
        )));
    }

    let word = BigEndian::read_u16(&response[2 + data_len..4 + data_len]);
    Ok((StatusCode::from_word(word), &response[2..2 + data_len]))
}

/// Build a response envelope around `data`
pub fn encode_response(data: &[u8], status: StatusCode) -> Result<Vec<u8>, TransportError> {
    if data.len() > u16::MAX as usize {
        return Err(TransportError::PayloadTooLarge {
            len: data.len(),
            max: u16::MAX as usize,
        });
    }

    let mut bytes = vec![0u8; data.len() + ENVELOPE_OVERHEAD];
    LittleEndian::write_u16(&mut bytes[0..2], data.len() as u16);
    bytes[2..2 + data.len()].copy_from_slice(data);
    BigEndian::write_u16(&mut bytes[2 + data.len()..], status.word());
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_success() {
        let response = [0x03, 0x00, 0xAA, 0xBB, 0xCC, 0x90, 0x00];
        let (status, data) = decode_status(&response).expect("Should decode");
        assert_eq!(status, StatusCode::Success);
        assert_eq!(data, &[0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn test_decode_ignores_trailing_padding() {
        let mut response = encode_response(&[1, 2], StatusCode::Rejected).unwrap();
        response.extend_from_slice(&[0u8; 10]);
        let (status, data) = decode_status(&response).unwrap();
        assert_eq!(status, StatusCode::Rejected);
        assert_eq!(data, &[1, 2]);
    }

    #[test]
    fn test_decode_short_buffer() {
        // Declares 16 bytes of data but only carries 2
        let response = [0x10, 0x00, 0x01, 0x02];
        assert!(matches!(
            decode_status(&response),
            Err(TransportError::Protocol(_))
        ));
        assert!(decode_status(&[0x01]).is_err());
    }

    #[test]
    fn test_unknown_word_preserved() {
        let response = encode_response(&[], StatusCode::from_word(0x1234)).unwrap();
        let (status, data) = decode_status(&response).unwrap();
        assert_eq!(status, StatusCode::Unknown(0x1234));
        assert_eq!(status.word(), 0x1234);
        assert!(data.is_empty());
    }

    #[test]
    fn test_known_words_roundtrip() {
        for code in [
            StatusCode::Success,
            StatusCode::Fail,
            StatusCode::Busy,
            StatusCode::Timeout,
            StatusCode::UnsupportedCommand,
            StatusCode::InvalidParameter,
            StatusCode::AuthenticationFailed,
            StatusCode::Rejected,
        ] {
            assert_eq!(StatusCode::from_word(code.word()), code);
        }
    }
}
