//! Timing-system multicast receiver.
//!
//! The DAQ timing system publishes one datagram per event on a multicast
//! group derived from the platform id. Each datagram is a fixed 28-byte
//! header of seven host-order `u32` fields followed by a variable-length
//! run of command bytes:
//!
//! ```text
//! nanoseconds | seconds | fiducial_low | fiducial_high | group_mask | event_code | command_count
//! ```
//!
//! [`TimestampListener`] owns the socket and runs the receive loop on its
//! own task so blocking network activity never stalls the acquisition loop.
//! The loop multiplexes between the socket and a dedicated stop channel with
//! `tokio::select!`; it never polls a flag on a timer, and it never blocks on
//! the socket alone (which would miss stop signals). Decoded events that
//! match the configured readout-group mask land in a bounded queue drained
//! by [`TimestampListener::get`].

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use bytes::Buf;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, trace, warn};

use crate::error::{AppResult, CamError};

/// Last octet of the multicast group for platform 0.
pub const MCAST_GROUP_START: u8 = 16;
/// UDP port for platform 0; platform id is added on top.
pub const MCAST_PORT_BASE: u16 = 10150;
/// Seven u32 header fields.
pub const HEADER_LEN: usize = 28;
/// Largest datagram the receive loop will accept.
pub const MAX_DATAGRAM: usize = 10240;
/// Low 17 bits of the high timing word identify the fiducial.
pub const FIDUCIAL_MASK: u32 = 0x1ffff;

/// Depth of the decoded-event queue between the receive loop and `get`.
const EVENT_QUEUE_DEPTH: usize = 256;

/// Multicast (group, port) pair for a DAQ platform.
pub fn multicast_endpoint(platform: u8) -> (Ipv4Addr, u16) {
    (
        Ipv4Addr::new(239, 255, 16, MCAST_GROUP_START + platform),
        MCAST_PORT_BASE + u16::from(platform),
    )
}

// =============================================================================
// TimingEvent
// =============================================================================

/// One decoded timing-system event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingEvent {
    pub nanoseconds: u32,
    pub seconds: u32,
    pub fiducial_low: u32,
    pub fiducial_high: u32,
    pub group_mask: u32,
    pub event_code: u32,
    pub commands: Vec<u8>,
}

impl TimingEvent {
    /// Decode one datagram. A short header or a command count that does not
    /// match the remaining payload is a [`CamError::Decode`]; the receive
    /// loop drops such datagrams without crashing.
    pub fn decode(data: &[u8]) -> AppResult<Self> {
        if data.len() < HEADER_LEN {
            return Err(CamError::Decode(format!(
                "datagram too short: {} bytes",
                data.len()
            )));
        }
        let mut buf = data;
        let nanoseconds = buf.get_u32_ne();
        let seconds = buf.get_u32_ne();
        let fiducial_low = buf.get_u32_ne();
        let fiducial_high = buf.get_u32_ne();
        let group_mask = buf.get_u32_ne();
        let event_code = buf.get_u32_ne();
        let command_count = buf.get_u32_ne() as usize;
        if buf.remaining() != command_count {
            return Err(CamError::Decode(format!(
                "expected {command_count} command bytes, got {}",
                buf.remaining()
            )));
        }
        Ok(Self {
            nanoseconds,
            seconds,
            fiducial_low,
            fiducial_high,
            group_mask,
            event_code,
            commands: buf.to_vec(),
        })
    }

    /// Wire form of this event, suitable for publishing on the group.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.commands.len());
        for field in [
            self.nanoseconds,
            self.seconds,
            self.fiducial_low,
            self.fiducial_high,
            self.group_mask,
            self.event_code,
            self.commands.len() as u32,
        ] {
            out.extend_from_slice(&field.to_ne_bytes());
        }
        out.extend_from_slice(&self.commands);
        out
    }

    /// True when this event is relevant to a readout-group bitmask.
    pub fn matches(&self, group_filter: u32) -> bool {
        self.group_mask & group_filter != 0
    }

    /// Low-bit timing identifier used to tag produced frames.
    pub fn fiducial(&self) -> u32 {
        self.fiducial_high & FIDUCIAL_MASK
    }
}

// =============================================================================
// TimestampListener
// =============================================================================

struct ListenerTask {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Background receiver for timing-system multicasts.
///
/// `start`/`stop` transitions are serialized by a mutex so concurrent callers
/// see at most one transition in flight; both are idempotent.
pub struct TimestampListener {
    group: Ipv4Addr,
    port: u16,
    group_filter: u32,
    interface: Ipv4Addr,
    events_tx: mpsc::Sender<TimingEvent>,
    events_rx: Mutex<mpsc::Receiver<TimingEvent>>,
    state: Mutex<Option<ListenerTask>>,
}

impl TimestampListener {
    /// Listener for one platform/readout-group pair. When `interface` is
    /// `None` the multicast join uses the wildcard interface.
    pub fn new(platform: u8, readout_group: u8, interface: Option<Ipv4Addr>) -> Self {
        let (group, port) = multicast_endpoint(platform);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        Self {
            group,
            port,
            group_filter: 1 << u32::from(readout_group),
            interface: interface.unwrap_or(Ipv4Addr::UNSPECIFIED),
            events_tx,
            events_rx: Mutex::new(events_rx),
            state: Mutex::new(None),
        }
    }

    pub fn group(&self) -> Ipv4Addr {
        self.group
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.is_some()
    }

    fn bind_socket(&self) -> AppResult<UdpSocket> {
        let bind_err = |source: std::io::Error| CamError::Bind {
            group: self.group,
            port: self.port,
            source,
        };
        let socket =
            Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(bind_err)?;
        // Allow other receivers on the same host to share the port.
        socket.set_reuse_address(true).map_err(bind_err)?;
        socket
            .bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.port).into())
            .map_err(bind_err)?;
        socket
            .join_multicast_v4(&self.group, &self.interface)
            .map_err(bind_err)?;
        socket.set_nonblocking(true).map_err(bind_err)?;
        UdpSocket::from_std(socket.into()).map_err(bind_err)
    }

    /// Open the socket, join the group, and spawn the receive loop.
    ///
    /// Idempotent: a second call while already running is a no-op. A bind or
    /// join failure is surfaced to the caller; acquisition cannot proceed
    /// without the timing feed, so this is the one error that should abort
    /// startup of the whole system.
    pub async fn start(&self) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            debug!("timestamp listener already running");
            return Ok(());
        }
        let socket = self.bind_socket()?;
        let (stop_tx, stop_rx) = watch::channel(false);
        debug!(group = %self.group, port = self.port, "starting daq timestamp listener");
        let handle = tokio::spawn(receive_loop(
            socket,
            self.group_filter,
            self.events_tx.clone(),
            stop_rx,
        ));
        *state = Some(ListenerTask { stop_tx, handle });
        Ok(())
    }

    /// Wait for the next timing event, bounded by `timeout`.
    ///
    /// Returns [`CamError::Timeout`] once the window elapses with no event.
    /// A zero timeout polls the queue and returns immediately.
    pub async fn get(&self, timeout: Duration) -> AppResult<TimingEvent> {
        let mut events = self.events_rx.lock().await;
        match time::timeout(timeout, events.recv()).await {
            Ok(Some(event)) => Ok(event),
            Ok(None) => Err(CamError::ListenerStopped),
            Err(_) => Err(CamError::Timeout(timeout.as_secs_f64())),
        }
    }

    /// Signal the receive loop to exit and, when `wait` is set, block until
    /// its task has fully exited. No-op when not running; safe to call twice.
    pub async fn stop(&self, wait: bool) {
        let mut state = self.state.lock().await;
        let Some(task) = state.take() else {
            return;
        };
        debug!("stopping daq timestamp listener");
        let _ = task.stop_tx.send(true);
        if wait {
            if let Err(err) = task.handle.await {
                warn!(%err, "timestamp listener task did not exit cleanly");
            }
        }
    }
}

/// Socket/stop multiplexer. The socket lives on this task's stack, so it is
/// closed on every exit path, including cancellation.
async fn receive_loop(
    socket: UdpSocket,
    group_filter: u32,
    events: mpsc::Sender<TimingEvent>,
    mut stop: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            received = socket.recv(&mut buf) => match received {
                Ok(len) => match TimingEvent::decode(&buf[..len]) {
                    Ok(event) if event.matches(group_filter) => {
                        if let Err(err) = events.try_send(event) {
                            warn!(%err, "timing event queue full, dropping event");
                        }
                    }
                    Ok(event) => {
                        trace!(group_mask = event.group_mask, "timing event outside readout group")
                    }
                    Err(err) => debug!(%err, "dropping malformed timing datagram"),
                },
                Err(err) => warn!(%err, "multicast receive failed"),
            },
            _ = stop.changed() => break,
        }
    }
    debug!("timestamp listener exiting");
}
