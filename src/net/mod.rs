//! Networking layer
//!
//! Channels, compression and the token handshake on top of pluggable
//! delivery engines.

pub mod channel;
pub mod client;
pub mod compression;
pub mod engine;
pub mod framing;
pub mod responder;
pub mod server;
pub mod storage;
pub mod stub;
#[cfg(feature = "quic")]
pub mod tls;
pub mod token;
pub mod traffic;
pub mod transport;

pub use channel::{Channel, PacketParams, SendFlags, CHANNEL_COUNT, DEFAULT_MTU, MAX_PACKET_SIZE};
pub use client::{ClientError, NetClient, HEARTBEAT_CODE};
pub use responder::{PeerState, Responder};
pub use server::NetServer;
pub use storage::{ConnectionStorage, NetworkEventStorage, RecvPacket, SharedStorage};
pub use stub::{NullClient, NullServer};
pub use token::{Token, TOKEN_LEN};
pub use traffic::{TrafficLogger, TrafficReport};
pub use transport::{pump, Client, NetError, SendError, Server, ServerError, ServerSyncCallback};
