//! Device commands used by the transport itself
//!
//! Application commands are opaque to the core. The handful below are the ones
//! the lifecycle and diagnostics need to build on their own.

use serde::{Deserialize, Serialize};

use super::V2_FRAME_MARKER;

/// Transport-level device commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Echo the data back in a success envelope
    Echo,

    /// Present a one-time passcode to authenticate the session
    Otp,

    /// Query firmware version
    GetVersion,

    /// Restart into the bootloader for a firmware update
    RebootToBootloader,
}

impl Command {
    /// Command byte following the frame marker
    pub fn code(&self) -> u8 {
        match self {
            Command::Echo => 0x08,
            Command::Otp => 0x03,
            Command::GetVersion => 0x01,
            Command::RebootToBootloader => 0x0B,
        }
    }

    /// Look up a command by its byte
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x08 => Some(Command::Echo),
            0x03 => Some(Command::Otp),
            0x01 => Some(Command::GetVersion),
            0x0B => Some(Command::RebootToBootloader),
            _ => None,
        }
    }

    /// Build the raw command bytes: marker, command byte, then data
    pub fn build(&self, data: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(2 + data.len());
        bytes.push(V2_FRAME_MARKER);
        bytes.push(self.code());
        bytes.extend_from_slice(data);
        bytes
    }

    /// Parse raw command bytes into the command and its data
    pub fn parse(bytes: &[u8]) -> Option<(Self, &[u8])> {
        match bytes {
            [V2_FRAME_MARKER, code, data @ ..] => Command::from_code(*code).map(|c| (c, data)),
            _ => None,
        }
    }
}

/// Echo command carrying `data`
pub fn echo(data: &[u8]) -> Vec<u8> {
    Command::Echo.build(data)
}

/// OTP command carrying the ASCII passcode
pub fn otp(code: &str) -> Vec<u8> {
    Command::Otp.build(code.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_layout() {
        assert_eq!(echo(&[1, 2]), vec![0xF8, 0x08, 1, 2]);
    }

    #[test]
    fn test_parse() {
        let bytes = otp("123456");
        let (cmd, data) = Command::parse(&bytes).expect("Should parse");
        assert_eq!(cmd, Command::Otp);
        assert_eq!(data, b"123456");
        assert_eq!(Command::parse(&[0x00, 0x08]), None);
        assert_eq!(Command::parse(&[0xF8, 0x77]), None);
    }
}
