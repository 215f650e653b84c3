//! Tether pairing exchange.
//! Two nodes, a master and a slave, hand each other network credentials and a
//! reachable address over a connectionless radio link. The transport is a trait;
//! the crate drives it from two tokio tasks.

pub mod callbacks;
pub mod engine;
pub mod integrity;
pub mod node;
pub mod peer;
pub mod protocol;
pub mod receive;
pub mod shutdown;
pub mod transport;
pub mod wire;

mod scheduler;

pub use callbacks::{Handler, HandlerError, RegisterError, Slot, Station, StationError};
pub use engine::ProtocolEngine;
pub use node::{LinkStatus, Node, NodeConfig, StartError, RESTART_DELAY};
pub use peer::{MacAddress, MacParseError};
pub use protocol::{AckTopic, CredentialBundle, Packet, Payload, PayloadError, Role, Topic};
pub use receive::Inbound;
pub use transport::{LoopbackTransport, Transport, TransportError, DEFAULT_CHANNEL};
pub use wire::{decode_packet, encode_packet, FrameDecodeError, PACKET_LEN};
