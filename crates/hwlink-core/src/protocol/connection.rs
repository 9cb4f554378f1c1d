//! Transport lifecycle
//!
//! Binds one link adapter to the exchange coordinator and owns the connection
//! state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> (Authenticating ->) Ready
//! ```
//!
//! Explicit disconnects and link-level losses both drop straight back to
//! `Disconnected`, failing whatever exchange was in flight.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    commands, lock, DeviceIdentity, ExchangeCoordinator, LinkProfile, TrafficCounters,
    TransportError, DEFAULT_CHANNEL_CAPACITY, DEFAULT_MAX_RESPONSE_SIZE, DEFAULT_TIMEOUT_MS,
};
use crate::link::{LinkAdapter, LinkEvent};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportState {
    /// No link
    Disconnected,
    /// Link being opened
    Connecting,
    /// Link open, device identified
    Connected,
    /// Waiting for a one-time passcode to be accepted
    Authenticating,
    /// Exchanges allowed
    Ready,
}

/// Why a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called
    Requested,
    /// The link reported a failure or closed underneath us
    LinkLost(String),
}

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Exchange timeout in milliseconds
    pub timeout_ms: u64,
    /// Capacity of the inbound packet channel
    pub channel_capacity: usize,
    /// Largest response accepted, including length prefix and status word
    pub max_response_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
        }
    }
}

impl TransportConfig {
    /// Parse from JSON; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self, TransportError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| TransportError::Config(format!("invalid transport config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file
    pub fn from_file(path: &Path) -> Result<Self, TransportError> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            TransportError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    /// Reject values the transport cannot run with
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.timeout_ms == 0 {
            return Err(TransportError::Config("timeout_ms must be positive".into()));
        }
        if self.channel_capacity == 0 {
            return Err(TransportError::Config(
                "channel_capacity must be positive".into(),
            ));
        }
        if self.max_response_size < super::ENVELOPE_OVERHEAD {
            return Err(TransportError::Config(format!(
                "max_response_size must be at least {}",
                super::ENVELOPE_OVERHEAD
            )));
        }
        Ok(())
    }

    /// Exchange timeout as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

type DisconnectCallback = Arc<dyn Fn(DisconnectReason) + Send + Sync>;

/// State shared with the receive task
struct Shared {
    id: Uuid,
    state: Mutex<TransportState>,
    identity: Mutex<Option<DeviceIdentity>>,
    coordinator: ExchangeCoordinator,
    on_disconnect: Mutex<Option<DisconnectCallback>>,
}

impl Shared {
    /// Set the state, returning the previous one
    fn set_state(&self, next: TransportState) -> TransportState {
        let mut state = lock(&self.state);
        let previous = *state;
        *state = next;
        if previous != next {
            debug!("transport {}: {:?} -> {:?}", self.id, previous, next);
        }
        previous
    }

    /// Move `from -> to` only if nothing else changed the state meanwhile
    fn transition(&self, from: TransportState, to: TransportState) -> bool {
        let mut state = lock(&self.state);
        if *state != from {
            return false;
        }
        *state = to;
        debug!("transport {}: {:?} -> {:?}", self.id, from, to);
        true
    }

    fn state(&self) -> TransportState {
        *lock(&self.state)
    }

    fn notify(&self, reason: DisconnectReason) {
        let callback = lock(&self.on_disconnect).clone();
        if let Some(callback) = callback {
            callback(reason);
        }
    }

    /// Tear down after the link dropped on its own
    fn link_lost(&self, reason: String) {
        if self.set_state(TransportState::Disconnected) == TransportState::Disconnected {
            return;
        }
        warn!("transport {}: link lost: {}", self.id, reason);
        self.coordinator.fail_all();
        lock(&self.identity).take();
        self.notify(DisconnectReason::LinkLost(reason));
    }
}

/// Consume link events in receipt order until cancelled or the link dies
async fn receive_loop(
    shared: Arc<Shared>,
    mut inbound: mpsc::Receiver<LinkEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            event = inbound.recv() => event,
        };

        match event {
            Some(LinkEvent::Data(bytes)) => shared.coordinator.on_packet(&bytes),
            Some(LinkEvent::Disconnected(reason)) => {
                shared.link_lost(reason);
                return;
            }
            None => {
                shared.link_lost("link channel closed".to_string());
                return;
            }
        }
    }
}

/// A device connection over one link adapter
pub struct Transport {
    config: TransportConfig,
    link: AsyncMutex<Box<dyn LinkAdapter>>,
    shared: Arc<Shared>,
    receiver: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
    lifecycle: AsyncMutex<()>,
}

impl Transport {
    /// Bind a transport to `link` with default configuration
    pub fn new(link: impl LinkAdapter + 'static) -> Self {
        Self::with_config(link, TransportConfig::default())
    }

    /// Bind a transport to `link` with explicit configuration
    pub fn with_config(link: impl LinkAdapter + 'static, config: TransportConfig) -> Self {
        Self {
            config,
            link: AsyncMutex::new(Box::new(link)),
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                state: Mutex::new(TransportState::Disconnected),
                identity: Mutex::new(None),
                coordinator: ExchangeCoordinator::new(),
                on_disconnect: Mutex::new(None),
            }),
            receiver: Mutex::new(None),
            lifecycle: AsyncMutex::new(()),
        }
    }

    /// Instance id used in log lines
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Active configuration
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> TransportState {
        self.shared.state()
    }

    /// True once exchanges are allowed
    pub fn is_ready(&self) -> bool {
        self.state() == TransportState::Ready
    }

    /// Identity of the connected device
    pub fn identity(&self) -> Option<DeviceIdentity> {
        lock(&self.shared.identity).clone()
    }

    /// Link traffic since the transport was created
    pub fn counters(&self) -> TrafficCounters {
        self.shared.coordinator.counters()
    }

    /// True when no exchange or raw read is outstanding
    pub fn is_idle(&self) -> bool {
        self.shared.coordinator.is_idle()
    }

    /// Register a callback run whenever the connection ends
    pub fn on_disconnect<F>(&self, callback: F)
    where
        F: Fn(DisconnectReason) + Send + Sync + 'static,
    {
        *lock(&self.shared.on_disconnect) = Some(Arc::new(callback));
    }

    /// Open the link, identify the device and advance to `Ready`, or to
    /// `Authenticating` for devices that pair with a passcode.
    pub async fn connect(&self) -> Result<DeviceIdentity, TransportError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.config.validate()?;
        if !self
            .shared
            .transition(TransportState::Disconnected, TransportState::Connecting)
        {
            return Err(TransportError::AlreadyConnected);
        }

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let mut link = self.link.lock().await;
        info!(
            "transport {}: connecting over {:?} to {}",
            self.shared.id,
            link.kind(),
            link.address()
        );

        // Clears whatever a previous, lost connection left behind
        if let Err(e) = link.disconnect().await {
            debug!("transport {}: stale link cleanup: {}", self.shared.id, e);
        }

        let profile = match link.connect(tx).await {
            Ok(profile) => profile,
            Err(e) => {
                warn!("transport {}: connect failed: {}", self.shared.id, e);
                self.shared.set_state(TransportState::Disconnected);
                return Err(e.into());
            }
        };

        if profile.packet_size == 0 {
            let _ = link.disconnect().await;
            self.shared.set_state(TransportState::Disconnected);
            return Err(TransportError::Config(
                "link reported a zero packet size".into(),
            ));
        }

        let identity = DeviceIdentity::new(profile, link.address());
        drop(link);

        self.shared
            .coordinator
            .configure(
                profile.version,
                self.config.max_response_size,
                self.config.channel_capacity,
            );
        *lock(&self.shared.identity) = Some(identity.clone());
        self.shared.set_state(TransportState::Connected);

        let next = if profile.device_type.requires_auth() {
            TransportState::Authenticating
        } else {
            TransportState::Ready
        };
        self.shared.set_state(next);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(receive_loop(self.shared.clone(), rx, cancel.clone()));
        if let Some((_, stale)) = lock(&self.receiver).replace((task, cancel)) {
            stale.cancel();
        }

        info!(
            "transport {}: connected to {:?} ({:?}, packet size {}), state {:?}",
            self.shared.id, identity.device_type, identity.version, identity.packet_size, next
        );
        Ok(identity)
    }

    /// Connect and run the passcode handshake, asking `prompt` for a code on
    /// each attempt. An empty code abandons the handshake and disconnects.
    pub async fn connect_with_otp<F, Fut>(
        &self,
        mut prompt: F,
    ) -> Result<DeviceIdentity, TransportError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = String>,
    {
        let identity = self.connect().await?;
        let mut attempt = 0;
        while self.state() == TransportState::Authenticating {
            attempt += 1;
            let code = prompt(attempt).await;
            match self.authenticate(&code).await {
                Ok(()) => break,
                Err(TransportError::Status { code }) => {
                    debug!("transport {}: attempt {} rejected ({})", self.shared.id, attempt, code);
                }
                Err(TransportError::Cancelled) => {
                    self.disconnect().await?;
                    return Err(TransportError::Cancelled);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(identity)
    }

    /// Present a one-time passcode. A rejected code leaves the link up so the
    /// caller can retry; an empty code cancels.
    pub async fn authenticate(&self, code: &str) -> Result<(), TransportError> {
        match self.state() {
            TransportState::Authenticating => {}
            TransportState::Disconnected | TransportState::Connecting => {
                return Err(TransportError::Disconnected)
            }
            actual => {
                return Err(TransportError::InvalidState {
                    expected: TransportState::Authenticating,
                    actual,
                })
            }
        }
        if code.is_empty() {
            info!("transport {}: authentication abandoned", self.shared.id);
            return Err(TransportError::Cancelled);
        }

        match self
            .exchange_unchecked(&commands::otp(code), self.config.timeout())
            .await
        {
            Ok(_) => {
                if !self
                    .shared
                    .transition(TransportState::Authenticating, TransportState::Ready)
                {
                    return Err(TransportError::Disconnected);
                }
                info!("transport {}: authenticated", self.shared.id);
                Ok(())
            }
            Err(TransportError::Status { code }) => {
                warn!("transport {}: passcode rejected ({})", self.shared.id, code);
                Err(TransportError::Status { code })
            }
            Err(e) => Err(e),
        }
    }

    /// Close the link. Any exchange in flight fails with `Disconnected`.
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        let _lifecycle = self.lifecycle.lock().await;

        if let Some((_, cancel)) = lock(&self.receiver).take() {
            cancel.cancel();
        }
        let previous = self.shared.set_state(TransportState::Disconnected);
        self.shared.coordinator.fail_all();
        lock(&self.shared.identity).take();

        let result = self.link.lock().await.disconnect().await;
        if previous != TransportState::Disconnected {
            info!("transport {}: disconnected", self.shared.id);
            self.shared.notify(DisconnectReason::Requested);
        }
        result.map_err(Into::into)
    }

    /// Caller-requested reconnection: up to `attempts` connects, `delay` apart
    pub async fn reconnect(
        &self,
        attempts: u32,
        delay: Duration,
    ) -> Result<DeviceIdentity, TransportError> {
        if self.state() != TransportState::Disconnected {
            self.disconnect().await?;
        }

        let attempts = attempts.max(1);
        let mut last_error = TransportError::Disconnected;
        for attempt in 1..=attempts {
            match self.connect().await {
                Ok(identity) => return Ok(identity),
                Err(e) => {
                    warn!(
                        "transport {}: reconnect attempt {}/{} failed: {}",
                        self.shared.id, attempt, attempts, e
                    );
                    last_error = e;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(delay).await;
            }
        }
        Err(last_error)
    }

    /// Send a logical command and wait for its payload, using the configured timeout
    pub async fn exchange(&self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.exchange_with_timeout(command, self.config.timeout())
            .await
    }

    /// Send a logical command and wait at most `timeout` for its payload
    pub async fn exchange_with_timeout(
        &self,
        command: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.require_ready()?;
        self.exchange_unchecked(command, timeout).await
    }

    /// Write one raw packet (bootloader / firmware update traffic)
    pub async fn write(&self, packet: &[u8]) -> Result<(), TransportError> {
        self.require_ready()?;
        let profile = self.profile()?;
        self.shared
            .coordinator
            .write_raw(&self.link, profile, packet)
            .await
    }

    /// Read one raw packet
    pub async fn read(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.require_ready()?;
        self.shared.coordinator.read_raw(timeout).await
    }

    async fn exchange_unchecked(
        &self,
        command: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let profile = self.profile()?;
        self.shared
            .coordinator
            .exchange(&self.link, profile, command, timeout)
            .await
    }

    fn profile(&self) -> Result<LinkProfile, TransportError> {
        lock(&self.shared.identity)
            .as_ref()
            .map(|identity| LinkProfile {
                device_type: identity.device_type,
                version: identity.version,
                packet_size: identity.packet_size,
            })
            .ok_or(TransportError::Disconnected)
    }

    /// Exchanges and raw traffic only run on a `Ready` transport
    fn require_ready(&self) -> Result<(), TransportError> {
        match self.state() {
            TransportState::Ready => Ok(()),
            _ => Err(TransportError::Disconnected),
        }
    }


}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some((_, cancel)) = lock(&self.receiver).take() {
            cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.timeout(), Duration::from_millis(DEFAULT_TIMEOUT_MS));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_partial_json() {
        let config = TransportConfig::from_json_str(r#"{"timeout_ms": 500}"#).unwrap();
        assert_eq!(config.timeout_ms, 500);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
    }

    #[test]
    fn test_config_rejects_zero_timeout() {
        assert!(matches!(
            TransportConfig::from_json_str(r#"{"timeout_ms": 0}"#),
            Err(TransportError::Config(_))
        ));
        assert!(TransportConfig::from_json_str("not json").is_err());
    }
}
