//! Wired link: USB CDC serial ports and TCP bridges
//!
//! Serial devices give no receive callback, so a blocking poll loop watches the
//! stream on a fixed interval. The same loop notices the port vanishing (cable
//! pulled) or the bridge closing, and reports it as a link-level disconnect.
//! The loop is tied to a cancellation token that [`WiredLink::disconnect`] trips.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::serial::{list_ports, open_port, PortInfo, DEFAULT_BAUD_RATE};
use super::{LinkAdapter, LinkEvent, LinkKind, ScanEvent, Scanner};
use crate::protocol::{DeviceType, LinkError, LinkProfile};

/// Default interval between polls of the receive buffer
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5;

/// Where the wired device lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WiredTarget {
    /// Serial or USB CDC port
    Serial {
        /// Port name, e.g. "/dev/ttyACM0"
        port_name: String,
        /// Line speed
        baud_rate: u32,
    },
    /// TCP bridge
    Tcp {
        /// host:port
        address: String,
    },
}

/// Wired link configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WiredLinkConfig {
    /// Where to connect
    pub target: WiredTarget,
    /// Family of the attached device
    pub device_type: DeviceType,
    /// Packet size override; the family default is used when unset
    #[serde(default)]
    pub packet_size: Option<usize>,
    /// Interval between receive polls in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

impl WiredLinkConfig {
    /// Serial port at the default baud rate
    pub fn serial(port_name: impl Into<String>, device_type: DeviceType) -> Self {
        Self {
            target: WiredTarget::Serial {
                port_name: port_name.into(),
                baud_rate: DEFAULT_BAUD_RATE,
            },
            device_type,
            packet_size: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }

    /// TCP bridge at `address` (host:port)
    pub fn tcp(address: impl Into<String>, device_type: DeviceType) -> Self {
        Self {
            target: WiredTarget::Tcp {
                address: address.into(),
            },
            device_type,
            packet_size: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }

    /// Negotiated parameters for the configured device
    pub fn profile(&self) -> LinkProfile {
        let profile = self.device_type.profile();
        match self.packet_size {
            Some(size) => profile.with_packet_size(size),
            None => profile,
        }
    }
}

/// Write timeout on TCP bridges
const TCP_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Open byte stream to a wired device
enum WiredChannel {
    Serial(Box<dyn SerialPort>),
    Tcp(TcpStream),
}

impl WiredChannel {
    /// Blocking reads wait at most `poll` before reporting no input
    fn open(target: &WiredTarget, poll: Duration) -> Result<Self, LinkError> {
        match target {
            WiredTarget::Serial {
                port_name,
                baud_rate,
            } => Ok(Self::Serial(open_port(port_name, *baud_rate, poll)?)),
            WiredTarget::Tcp { address } => {
                let stream = TcpStream::connect(address.as_str())?;
                stream.set_nodelay(true)?;
                stream.set_read_timeout(Some(poll))?;
                stream.set_write_timeout(Some(TCP_WRITE_TIMEOUT))?;
                Ok(Self::Tcp(stream))
            }
        }
    }

    /// Second handle on the same stream, for the poll loop
    fn try_clone(&self) -> Result<Self, LinkError> {
        Ok(match self {
            Self::Serial(port) => Self::Serial(port.try_clone()?),
            Self::Tcp(stream) => Self::Tcp(stream.try_clone()?),
        })
    }

    /// Wait up to one poll interval for input.
    ///
    /// `Ok(0)` means nothing arrived; a stream closed by the peer is an error.
    fn receive(&mut self, buffer: &mut [u8], interval: Duration) -> io::Result<usize> {
        let result = match self {
            // Polling bytes_to_read avoids parking in read() on a vanished port
            Self::Serial(port) => {
                let available = port.bytes_to_read().map_err(io::Error::other)? as usize;
                if available == 0 {
                    std::thread::sleep(interval);
                    return Ok(0);
                }
                let len = available.min(buffer.len());
                port.read(&mut buffer[..len])
            }
            Self::Tcp(stream) => match stream.read(buffer) {
                Ok(0) => Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed the connection",
                )),
                other => other,
            },
        };

        match result {
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                Ok(0)
            }
            other => other,
        }
    }

    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Self::Serial(port) => {
                port.write_all(data)?;
                port.flush()
            }
            Self::Tcp(stream) => {
                stream.write_all(data)?;
                stream.flush()
            }
        }
    }
}

/// Polled link over a serial port or TCP stream
pub struct WiredLink {
    config: WiredLinkConfig,
    writer: Option<Arc<Mutex<WiredChannel>>>,
    cancel: Option<CancellationToken>,
    poller: Option<JoinHandle<()>>,
}

impl WiredLink {
    /// Unopened link for `config`
    pub fn new(config: WiredLinkConfig) -> Self {
        Self {
            config,
            writer: None,
            cancel: None,
            poller: None,
        }
    }

    /// Configuration the link was created with
    pub fn config(&self) -> &WiredLinkConfig {
        &self.config
    }

    /// True between a successful connect and disconnect
    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    /// True while the receive loop is running
    pub fn is_polling(&self) -> bool {
        self.poller
            .as_ref()
            .is_some_and(|poller| !poller.is_finished())
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms.max(1))
    }
}

fn join_error(e: tokio::task::JoinError) -> LinkError {
    LinkError::Other(format!("link task failed: {}", e))
}

/// Blocking receive loop; runs on the blocking pool until cancelled
fn poll_loop(
    mut reader: WiredChannel,
    inbound: mpsc::Sender<LinkEvent>,
    cancel: CancellationToken,
    interval: Duration,
    chunk_size: usize,
) {
    let mut buffer = vec![0u8; chunk_size.max(1)];

    while !cancel.is_cancelled() {
        match reader.receive(&mut buffer, interval) {
            Ok(0) => {}
            Ok(n) => {
                debug!("wired link: received {} bytes", n);
                if inbound
                    .blocking_send(LinkEvent::Data(buffer[..n].to_vec()))
                    .is_err()
                {
                    // Transport went away; nobody left to deliver to
                    return;
                }
            }
            Err(e) => {
                if !cancel.is_cancelled() {
                    warn!("wired link lost: {}", e);
                    let _ = inbound.blocking_send(LinkEvent::Disconnected(e.to_string()));
                }
                return;
            }
        }
    }
    debug!("wired link: poll loop cancelled");
}

#[async_trait]
impl LinkAdapter for WiredLink {
    fn kind(&self) -> LinkKind {
        match self.config.target {
            WiredTarget::Serial { .. } => LinkKind::Serial,
            WiredTarget::Tcp { .. } => LinkKind::Tcp,
        }
    }

    fn address(&self) -> String {
        match &self.config.target {
            WiredTarget::Serial { port_name, .. } => port_name.clone(),
            WiredTarget::Tcp { address } => address.clone(),
        }
    }

    async fn connect(
        &mut self,
        inbound: mpsc::Sender<LinkEvent>,
    ) -> Result<LinkProfile, LinkError> {
        if self.is_open() {
            return Err(LinkError::Other("link already open".into()));
        }

        let target = self.config.target.clone();
        let interval = self.poll_interval();
        let channel = tokio::task::spawn_blocking(move || WiredChannel::open(&target, interval))
            .await
            .map_err(join_error)??;
        let reader = channel.try_clone()?;

        let profile = self.config.profile();
        let cancel = CancellationToken::new();
        let poller = tokio::task::spawn_blocking({
            let cancel = cancel.clone();
            move || poll_loop(reader, inbound, cancel, interval, profile.packet_size)
        });

        self.writer = Some(Arc::new(Mutex::new(channel)));
        self.cancel = Some(cancel);
        self.poller = Some(poller);

        info!(
            "wired link open: {} ({:?}, packet size {})",
            self.address(),
            profile.device_type,
            profile.packet_size
        );
        Ok(profile)
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<(), LinkError> {
        let max = self.config.profile().packet_size;
        if chunk.len() > max {
            return Err(LinkError::PacketTooLarge {
                len: chunk.len(),
                max,
            });
        }

        let writer = self.writer.clone().ok_or(LinkError::NotOpen)?;
        let data = chunk.to_vec();
        tokio::task::spawn_blocking(move || -> Result<(), LinkError> {
            let mut channel = writer
                .lock()
                .map_err(|_| LinkError::Other("writer lock poisoned".into()))?;
            channel.send(&data)?;
            Ok(())
        })
        .await
        .map_err(join_error)?
    }

    async fn disconnect(&mut self) -> Result<(), LinkError> {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(poller) = self.poller.take() {
            poller.await.map_err(join_error)?;
        }
        if self.writer.take().is_some() {
            info!("wired link closed: {}", self.address());
        }
        Ok(())
    }
}

impl Drop for WiredLink {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

type PortSource = Arc<dyn Fn() -> Vec<PortInfo> + Send + Sync>;

/// Discovery by diffing the serial port list on an interval
pub struct PortScanner {
    interval: Duration,
    source: PortSource,
}

impl PortScanner {
    /// Scanner over the operating system's port list
    pub fn new(interval: Duration) -> Self {
        Self::with_source(interval, list_ports)
    }

    /// Scanner over a custom port listing
    pub fn with_source<F>(interval: Duration, source: F) -> Self
    where
        F: Fn() -> Vec<PortInfo> + Send + Sync + 'static,
    {
        Self {
            interval,
            source: Arc::new(source),
        }
    }
}

impl Default for PortScanner {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

/// Events turning the `known` listing into `current`
fn diff_ports(known: &[PortInfo], current: &[PortInfo]) -> Vec<ScanEvent> {
    let appeared = current
        .iter()
        .filter(|port| !known.iter().any(|k| k.name == port.name))
        .map(|port| ScanEvent::Discovered(port.clone()));
    let vanished = known
        .iter()
        .filter(|port| !current.iter().any(|c| c.name == port.name))
        .map(|port| ScanEvent::Vanished(port.name.clone()));
    appeared.chain(vanished).collect()
}

#[async_trait]
impl Scanner for PortScanner {
    async fn scan(
        &self,
        timeout: Duration,
        events: mpsc::Sender<ScanEvent>,
    ) -> Result<(), LinkError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut known: Vec<PortInfo> = Vec::new();
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                biased;
                _ = tokio::time::sleep_until(deadline) => return Ok(()),
                _ = ticker.tick() => {}
            }

            let source = self.source.clone();
            let current = tokio::task::spawn_blocking(move || source())
                .await
                .map_err(join_error)?;

            for event in diff_ports(&known, &current) {
                debug!("port scan: {:?}", event);
                if events.send(event).await.is_err() {
                    return Ok(());
                }
            }
            known = current;
        }
    }
}
