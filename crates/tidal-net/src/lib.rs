//! Networking for Tidal: the transport black box, its in-memory and TCP
//! implementations, stream framing, and the replication wire protocol.

pub mod framing;
pub mod memory;
pub mod protocol;
pub mod tcp;
pub mod transport;

pub use framing::{Frame, FrameConfig, FrameError, read_frame, write_frame};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use protocol::{
    MAX_PAYLOAD_TEXT, MessageType, ProtocolError, TYPE_TAG_LEN, WireMessage, decode, encode,
};
pub use tcp::TcpTransport;
pub use transport::{DeliveryMode, IdGenerator, PeerId, Transport, TransportError, TransportEvent};
