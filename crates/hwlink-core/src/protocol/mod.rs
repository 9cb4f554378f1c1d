//! Transport Protocol Core
//!
//! Frames logical commands into link-sized packets, reassembles and status-checks
//! responses, and drives the connection lifecycle on top of a [`crate::link::LinkAdapter`].
//!
//! Supports the V1 envelope protocol and the V2 protocol with L1 wrapping.

pub mod commands;
mod connection;
mod device;
mod error;
mod exchange;
mod packet;
mod status;

pub use commands::Command;
pub use connection::{DisconnectReason, Transport, TransportConfig, TransportState};
pub use device::{DeviceIdentity, DeviceType, LinkProfile, ProtocolVersion};
pub use error::{LinkError, TransportError};
pub use exchange::{ExchangeCoordinator, TrafficCounters};
pub use packet::{
    fragment, is_v2_frame, unwrap_l1, wrap_l1, Framer, L1_HEADER_LEN, L1_KIND, MAX_V2_BODY,
    V2_FRAME_MARKER, V2_HEADER_LEN,
};
pub use status::{decode_status, declared_length, encode_response, StatusCode, ENVELOPE_OVERHEAD};

/// Default timeout for a single exchange in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Default capacity of the inbound packet channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Default bound on a single reassembled response (1 MiB)
pub const DEFAULT_MAX_RESPONSE_SIZE: usize = 1 << 20;

/// Lock a std mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
