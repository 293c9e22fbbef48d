//! The transport black box.
//!
//! A [`Transport`] moves opaque byte payloads between peers and reports peer
//! lifecycle as [`TransportEvent`]s. Events are queued by the implementation
//! and handed out synchronously by [`Transport::poll`], so every callback runs
//! on the thread that drives the tick loop.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Transport-local identifier of one connected endpoint.
///
/// Only meaningful to the transport instance that issued it; two processes
/// will generally use different ids for the same connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Atomic generator for monotonically increasing [`PeerId`]s.
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unique [`PeerId`].
    pub fn next_id(&self) -> PeerId {
        PeerId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Reliability class requested for a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryMode {
    /// Delivered exactly once and in order. Handshake, roster and lifecycle
    /// traffic.
    ReliableOrdered,
    /// May be dropped; stale packets are discarded. Frequent state updates.
    Sequenced,
}

impl DeliveryMode {
    /// Single-byte channel tag used by stream framing.
    pub fn channel(self) -> u8 {
        match self {
            Self::ReliableOrdered => 0,
            Self::Sequenced => 1,
        }
    }

    /// Inverse of [`DeliveryMode::channel`].
    pub fn from_channel(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::ReliableOrdered),
            1 => Some(Self::Sequenced),
            _ => None,
        }
    }
}

/// Something that happened on the transport since the last poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A remote endpoint wants to connect. Answer with
    /// [`Transport::accept`] or [`Transport::reject`].
    ConnectionRequest {
        /// Id the peer will keep if accepted.
        peer: PeerId,
        /// Remote address, when the transport knows one.
        addr: Option<SocketAddr>,
    },
    /// A connection is established and can carry payloads.
    Connected(PeerId),
    /// A connection is gone. Always the last event for that peer.
    Disconnected(PeerId),
    /// A payload arrived.
    Received {
        /// Sender.
        peer: PeerId,
        /// Channel the payload travelled on.
        mode: DeliveryMode,
        /// Raw bytes.
        payload: Vec<u8>,
    },
    /// A socket-level failure. Connection-scoped when `peer` is set.
    Error {
        /// Affected peer, if any.
        peer: Option<PeerId>,
        /// Human-readable description.
        message: String,
    },
}

/// Errors surfaced synchronously by transport calls.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The peer is unknown or already gone.
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    /// Nothing is listening at the dialled address.
    #[error("no listener at {0}")]
    Unreachable(SocketAddr),

    /// The address is already taken by another listener.
    #[error("address {0} already in use")]
    AddressInUse(SocketAddr),

    /// The transport was stopped.
    #[error("transport stopped")]
    Stopped,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Byte-oriented, event-driven connection layer.
pub trait Transport {
    /// Start accepting connection requests on `addr`. Returns the bound
    /// address (useful when binding port 0).
    fn listen(&mut self, addr: SocketAddr) -> Result<SocketAddr, TransportError>;

    /// Open a connection to `addr`. The returned peer becomes usable once
    /// [`TransportEvent::Connected`] is reported for it.
    fn connect(&mut self, addr: SocketAddr) -> Result<PeerId, TransportError>;

    /// Admit a peer that raised [`TransportEvent::ConnectionRequest`].
    fn accept(&mut self, peer: PeerId);

    /// Refuse a peer that raised [`TransportEvent::ConnectionRequest`].
    fn reject(&mut self, peer: PeerId);

    /// Queue `payload` for delivery to `peer`. Fire-and-forget.
    fn send(
        &mut self,
        peer: PeerId,
        payload: &[u8],
        mode: DeliveryMode,
    ) -> Result<(), TransportError>;

    /// Close a connection. [`TransportEvent::Disconnected`] follows.
    fn disconnect(&mut self, peer: PeerId);

    /// Drain every event raised since the previous call.
    fn poll(&mut self) -> Vec<TransportEvent>;

    /// Abort all connections and in-flight work. No drain guarantee.
    fn stop(&mut self);

    /// Number of established connections.
    fn peer_count(&self) -> usize;
}
