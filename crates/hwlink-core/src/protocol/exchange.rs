//! Exchange coordination
//!
//! Owns the single in-flight exchange of a transport. Outbound commands are
//! fragmented and written in order; inbound packets are fed to the framer by the
//! transport's receive task and the decoded result is handed to the one waiter.
//!
//! Raw mode (bootloader / firmware update traffic) bypasses the framer: every
//! inbound packet is delivered as-is to [`ExchangeCoordinator::read_raw`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, warn};

use super::{
    decode_status, fragment, lock, Framer, LinkProfile, ProtocolVersion, TransportError,
    DEFAULT_CHANNEL_CAPACITY, DEFAULT_MAX_RESPONSE_SIZE,
};
use crate::link::LinkAdapter;

type Reply = oneshot::Sender<Result<Vec<u8>, TransportError>>;
type ReplyReceiver = oneshot::Receiver<Result<Vec<u8>, TransportError>>;

enum Pending {
    Idle,
    Exchange {
        id: u64,
        reply: Reply,
    },
    Raw {
        inbox: VecDeque<Vec<u8>>,
        waiter: Option<Reply>,
    },
}

struct CoordinatorState {
    framer: Framer,
    pending: Pending,
    raw_capacity: usize,
}

/// A raw waiter whose reader has gone away no longer counts
fn waiting(waiter: &Option<Reply>) -> bool {
    waiter.as_ref().is_some_and(|reply| !reply.is_closed())
}

/// Outcome of registering a raw read
enum RawTicket {
    Ready(Vec<u8>),
    Wait(ReplyReceiver),
}

/// Clears its exchange if the waiting future is dropped before completion
struct AbandonOnDrop<'a> {
    coordinator: &'a ExchangeCoordinator,
    id: u64,
}

impl Drop for AbandonOnDrop<'_> {
    fn drop(&mut self) {
        if self.coordinator.abandon(self.id) {
            debug!("exchange {}: abandoned by caller", self.id);
        }
    }
}

/// Cumulative link traffic
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TrafficCounters {
    /// Bytes written to the link
    pub tx_bytes: u64,
    /// Bytes received from the link
    pub rx_bytes: u64,
    /// Packets written
    pub tx_packets: u64,
    /// Packets received
    pub rx_packets: u64,
}

/// At-most-one exchange state machine
pub struct ExchangeCoordinator {
    state: std::sync::Mutex<CoordinatorState>,
    next_id: AtomicU64,
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
    tx_packets: AtomicU64,
    rx_packets: AtomicU64,
}

impl Default for ExchangeCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ExchangeCoordinator {
    /// Idle coordinator with V1 framing and default limits
    pub fn new() -> Self {
        Self {
            state: std::sync::Mutex::new(CoordinatorState {
                framer: Framer::new(ProtocolVersion::V1, DEFAULT_MAX_RESPONSE_SIZE),
                pending: Pending::Idle,
                raw_capacity: DEFAULT_CHANNEL_CAPACITY,
            }),
            next_id: AtomicU64::new(1),
            tx_bytes: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            tx_packets: AtomicU64::new(0),
            rx_packets: AtomicU64::new(0),
        }
    }

    /// Bind the framer to the version negotiated at connect time.
    ///
    /// `raw_capacity` bounds how many unread raw packets are kept.
    pub fn configure(
        &self,
        version: ProtocolVersion,
        max_response_size: usize,
        raw_capacity: usize,
    ) {
        let mut state = lock(&self.state);
        state.framer = Framer::new(version, max_response_size);
        state.pending = Pending::Idle;
        state.raw_capacity = raw_capacity.max(1);
    }

    /// Traffic seen since the coordinator was created
    pub fn counters(&self) -> TrafficCounters {
        TrafficCounters {
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
        }
    }

    /// True when neither an exchange nor a raw reader is outstanding
    pub fn is_idle(&self) -> bool {
        match &lock(&self.state).pending {
            Pending::Idle => true,
            Pending::Raw { waiter, .. } => !waiting(waiter),
            Pending::Exchange { .. } => false,
        }
    }

    /// Send `command` and wait for the reassembled, status-checked response
    pub async fn exchange(
        &self,
        link: &AsyncMutex<Box<dyn LinkAdapter>>,
        profile: LinkProfile,
        command: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let packets = fragment(command, profile.packet_size, profile.version)?;
        let (id, mut reply) = self.begin_exchange()?;
        let _guard = AbandonOnDrop {
            coordinator: self,
            id,
        };
        debug!(
            "exchange {}: {} byte command in {} packets",
            id,
            command.len(),
            packets.len()
        );

        let run = async {
            tokio::select! {
                biased;
                early = &mut reply => {
                    return early.unwrap_or(Err(TransportError::Disconnected));
                }
                sent = self.send_packets(link, &packets) => sent?,
            }
            reply.await.unwrap_or(Err(TransportError::Disconnected))
        };

        match tokio::time::timeout(timeout, run).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(e)) => {
                self.abandon(id);
                Err(e)
            }
            Err(_) => {
                if self.abandon(id) {
                    warn!("exchange {}: timed out after {:?}", id, timeout);
                }
                Err(TransportError::Timeout)
            }
        }
    }

    /// Write one raw packet, bypassing the framer
    pub async fn write_raw(
        &self,
        link: &AsyncMutex<Box<dyn LinkAdapter>>,
        profile: LinkProfile,
        packet: &[u8],
    ) -> Result<(), TransportError> {
        if packet.len() > profile.packet_size {
            return Err(TransportError::PayloadTooLarge {
                len: packet.len(),
                max: profile.packet_size,
            });
        }
        self.arm_raw()?;
        self.send_packets(link, &[packet.to_vec()]).await
    }

    /// Read the next raw packet from the device
    pub async fn read_raw(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let receiver = match self.begin_read()? {
            RawTicket::Ready(packet) => return Ok(packet),
            RawTicket::Wait(receiver) => receiver,
        };

        match tokio::time::timeout(timeout, receiver).await {
            Ok(result) => result.unwrap_or(Err(TransportError::Disconnected)),
            Err(_) => {
                self.cancel_read();
                Err(TransportError::Timeout)
            }
        }
    }

    /// Route one packet delivered by the link
    pub fn on_packet(&self, packet: &[u8]) {
        self.rx_bytes
            .fetch_add(packet.len() as u64, Ordering::Relaxed);
        self.rx_packets.fetch_add(1, Ordering::Relaxed);

        let mut state = lock(&self.state);
        let capacity = state.raw_capacity;
        if matches!(state.pending, Pending::Exchange { .. }) {
            let outcome = match state.framer.feed(packet) {
                Ok(None) => return,
                Ok(Some(response)) => decode_response(&response),
                Err(e) => Err(e),
            };
            if let Pending::Exchange { id, reply } =
                std::mem::replace(&mut state.pending, Pending::Idle)
            {
                debug!("exchange {}: complete ({})", id, describe(&outcome));
                let _ = reply.send(outcome);
            }
            return;
        }

        match &mut state.pending {
            Pending::Raw { inbox, waiter } => match waiter.take() {
                Some(reply) => {
                    if let Err(Ok(unclaimed)) = reply.send(Ok(packet.to_vec())) {
                        push_raw(inbox, unclaimed, capacity);
                    }
                }
                None => push_raw(inbox, packet.to_vec(), capacity),
            },
            _ => {
                debug!(
                    "discarding {} byte packet with no exchange pending",
                    packet.len()
                );
            }
        }
    }

    /// Fail whatever is outstanding; used when the link goes away
    pub fn fail_all(&self) {
        let mut state = lock(&self.state);
        state.framer.reset();
        match std::mem::replace(&mut state.pending, Pending::Idle) {
            Pending::Idle => {}
            Pending::Exchange { id, reply } => {
                debug!("exchange {}: cancelled by disconnect", id);
                let _ = reply.send(Err(TransportError::Disconnected));
            }
            Pending::Raw { waiter, .. } => {
                if let Some(reply) = waiter {
                    let _ = reply.send(Err(TransportError::Disconnected));
                }
            }
        }
    }

    fn begin_exchange(&self) -> Result<(u64, ReplyReceiver), TransportError> {
        let mut state = lock(&self.state);
        match &state.pending {
            Pending::Exchange { .. } => return Err(TransportError::Busy),
            Pending::Raw { waiter, .. } if waiting(waiter) => return Err(TransportError::Busy),
            Pending::Raw { inbox, .. } if !inbox.is_empty() => {
                debug!("dropping {} unread raw packets", inbox.len());
            }
            _ => {}
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, receiver) = oneshot::channel();
        state.framer.reset();
        state.pending = Pending::Exchange { id, reply };
        Ok((id, receiver))
    }

    /// Clear exchange `id` if it is still pending; true if it was
    fn abandon(&self, id: u64) -> bool {
        let mut state = lock(&self.state);
        match state.pending {
            Pending::Exchange { id: pending, .. } if pending == id => {
                state.pending = Pending::Idle;
                state.framer.reset();
                true
            }
            _ => false,
        }
    }

    fn arm_raw(&self) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        match state.pending {
            Pending::Exchange { .. } => Err(TransportError::Busy),
            Pending::Raw { .. } => Ok(()),
            Pending::Idle => {
                state.pending = Pending::Raw {
                    inbox: VecDeque::new(),
                    waiter: None,
                };
                Ok(())
            }
        }
    }

    fn begin_read(&self) -> Result<RawTicket, TransportError> {
        self.arm_raw()?;
        let mut state = lock(&self.state);
        match &mut state.pending {
            Pending::Raw { inbox, waiter } => {
                if waiting(waiter) {
                    return Err(TransportError::Busy);
                }
                if let Some(packet) = inbox.pop_front() {
                    return Ok(RawTicket::Ready(packet));
                }
                let (reply, receiver) = oneshot::channel();
                *waiter = Some(reply);
                Ok(RawTicket::Wait(receiver))
            }
            // Lost a race with an exchange between arming and registering
            _ => Err(TransportError::Busy),
        }
    }

    fn cancel_read(&self) {
        if let Pending::Raw { waiter, .. } = &mut lock(&self.state).pending {
            waiter.take();
        }
    }

    async fn send_packets(
        &self,
        link: &AsyncMutex<Box<dyn LinkAdapter>>,
        packets: &[Vec<u8>],
    ) -> Result<(), TransportError> {
        let mut link = link.lock().await;
        for packet in packets {
            link.write(packet).await?;
            self.tx_bytes
                .fetch_add(packet.len() as u64, Ordering::Relaxed);
            self.tx_packets.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

/// Queue an unread raw packet, dropping the oldest once full
fn push_raw(inbox: &mut VecDeque<Vec<u8>>, packet: Vec<u8>, capacity: usize) {
    if inbox.len() >= capacity {
        if let Some(dropped) = inbox.pop_front() {
            warn!(
                "raw inbox full ({} packets), dropping oldest {} byte packet",
                capacity,
                dropped.len()
            );
        }
    }
    inbox.push_back(packet);
}

fn decode_response(response: &[u8]) -> Result<Vec<u8>, TransportError> {
    let (status, payload) = decode_status(response)?;
    if status.is_success() {
        Ok(payload.to_vec())
    } else {
        Err(TransportError::Status { code: status })
    }
}

fn describe(outcome: &Result<Vec<u8>, TransportError>) -> String {
    match outcome {
        Ok(payload) => format!("{} bytes", payload.len()),
        Err(e) => e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_response, StatusCode};

    #[test]
    fn test_packets_without_exchange_are_discarded() {
        let coordinator = ExchangeCoordinator::new();
        coordinator.on_packet(&[0x00, 0x00, 0x90, 0x00]);
        assert!(coordinator.is_idle());
        assert_eq!(coordinator.counters().rx_packets, 1);
    }

    #[test]
    fn test_second_exchange_is_busy() {
        let coordinator = ExchangeCoordinator::new();
        let (_id, _rx) = coordinator.begin_exchange().unwrap();
        assert!(matches!(
            coordinator.begin_exchange(),
            Err(TransportError::Busy)
        ));
        assert!(matches!(coordinator.arm_raw(), Err(TransportError::Busy)));
    }

    #[test]
    fn test_exchange_resolves_on_complete_envelope() {
        let coordinator = ExchangeCoordinator::new();
        let (_id, mut rx) = coordinator.begin_exchange().unwrap();
        let envelope = encode_response(&[5u8; 70], StatusCode::Success).unwrap();

        coordinator.on_packet(&envelope[..64]);
        assert!(rx.try_recv().is_err());
        coordinator.on_packet(&envelope[64..]);
        assert_eq!(rx.try_recv().unwrap().unwrap(), vec![5u8; 70]);
        assert!(coordinator.is_idle());
    }

    #[test]
    fn test_non_success_status_is_error() {
        let coordinator = ExchangeCoordinator::new();
        let (_id, mut rx) = coordinator.begin_exchange().unwrap();
        coordinator.on_packet(&encode_response(&[1], StatusCode::Rejected).unwrap());
        let result = rx.try_recv().unwrap();
        assert_eq!(result.unwrap_err().status(), Some(StatusCode::Rejected));
    }

    #[test]
    fn test_abandon_only_matching_id() {
        let coordinator = ExchangeCoordinator::new();
        let (id, _rx) = coordinator.begin_exchange().unwrap();
        assert!(!coordinator.abandon(id + 1));
        assert!(coordinator.abandon(id));
        assert!(coordinator.is_idle());
    }

    #[test]
    fn test_fail_all_reports_disconnect() {
        let coordinator = ExchangeCoordinator::new();
        let (_id, mut rx) = coordinator.begin_exchange().unwrap();
        coordinator.on_packet(&[0x10, 0x00, 0x01]);
        coordinator.fail_all();
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(TransportError::Disconnected)
        ));
        assert!(coordinator.is_idle());
    }

    #[test]
    fn test_raw_inbox_keeps_early_packets() {
        let coordinator = ExchangeCoordinator::new();
        coordinator.arm_raw().unwrap();
        coordinator.on_packet(&[1, 2, 3]);
        match coordinator.begin_read().unwrap() {
            RawTicket::Ready(packet) => assert_eq!(packet, vec![1, 2, 3]),
            RawTicket::Wait(_) => panic!("packet should have been buffered"),
        }
    }

    #[test]
    fn test_raw_inbox_is_bounded() {
        let coordinator = ExchangeCoordinator::new();
        coordinator.configure(ProtocolVersion::V1, DEFAULT_MAX_RESPONSE_SIZE, 4);
        coordinator.arm_raw().unwrap();
        for i in 0..10u8 {
            coordinator.on_packet(&[i]);
        }

        let mut unread = Vec::new();
        while let Ok(RawTicket::Ready(packet)) = coordinator.begin_read() {
            unread.push(packet[0]);
        }
        assert_eq!(unread, vec![6, 7, 8, 9]);
    }

    #[test]
    fn test_dropped_raw_reader_is_not_busy() {
        let coordinator = ExchangeCoordinator::new();
        match coordinator.begin_read().unwrap() {
            RawTicket::Wait(receiver) => drop(receiver),
            RawTicket::Ready(_) => panic!("inbox should be empty"),
        }
        assert!(coordinator.is_idle());
        assert!(coordinator.begin_exchange().is_ok());
    }

    #[test]
    fn test_exchange_after_raw_drops_inbox() {
        let coordinator = ExchangeCoordinator::new();
        coordinator.arm_raw().unwrap();
        coordinator.on_packet(&[9, 9]);
        let (_id, _rx) = coordinator.begin_exchange().unwrap();
        assert!(!coordinator.is_idle());
    }
}
