//! Delivery engines behind the client/server layer
//!
//! An engine moves already-compressed payloads between peers and reports
//! lifecycle events through [`TransportEngine::poll`]. Sends go through a
//! shareable [`PacketSink`] so responders can send without borrowing the
//! engine.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};

use crate::net::channel::SendFlags;

pub mod loopback;
#[cfg(feature = "quic")]
pub mod quic;

pub use loopback::{
    LoopbackClientEngine, LoopbackConfig, LoopbackHub, LoopbackServerEngine, LOOPBACK_SERVER_PEER,
};
#[cfg(feature = "quic")]
pub use quic::{EngineRuntime, QuicClientEngine, QuicServerEngine};

/// Engine-assigned handle of one remote peer
pub type PeerId = u64;

/// Events reported by an engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Connect { peer: PeerId },
    Disconnect { peer: PeerId },
    Receive { peer: PeerId, channel: u8, data: Vec<u8> },
    /// A reliable packet sent with an ack id was delivered
    Ack { peer: PeerId, ack_id: u64 },
    /// The engine hit an error it could not recover from
    Error { message: String },
}

/// Link statistics of one peer
///
/// Both packet counters describe the same direction of the link, so
/// `packets_lost <= packets_sent` always holds. Engines that can see loss
/// on the sending side count outbound packets; QUIC counts what the peer
/// sent us.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Smoothed round trip time in milliseconds
    pub rtt_ms: u32,
    /// Cumulative packets sent on the measured direction
    pub packets_sent: u64,
    /// Cumulative packets of `packets_sent` known lost
    pub packets_lost: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Engine is closed")]
    Closed,
    #[error("Unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("Payload of {0} bytes exceeds link limit {1}")]
    TooLarge(usize, usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Engine setup failed: {0}")]
    Setup(String),
}

/// Send side of an engine
pub trait PacketSink: Send + Sync {
    /// Queue `data` for `peer`; reliable packets with `ack_id` produce an
    /// [`EngineEvent::Ack`] once delivered
    fn send(
        &self,
        peer: PeerId,
        channel: u8,
        data: &[u8],
        flags: SendFlags,
        ack_id: Option<u64>,
    ) -> Result<(), EngineError>;

    /// Start a graceful disconnect; the `Disconnect` event follows later
    fn disconnect(&self, peer: PeerId);

    fn stats(&self, peer: PeerId) -> Option<LinkStats>;

    /// Largest unreliable payload the link carries unfragmented
    fn mtu(&self) -> usize;
}

/// Poll side of an engine
pub trait TransportEngine {
    /// Take one pending event, waiting up to `timeout`
    fn poll(&mut self, timeout: Duration) -> Result<Option<EngineEvent>, EngineError>;

    fn sink(&self) -> Arc<dyn PacketSink>;
}

/// Client engines connect to a single server peer
pub trait Connector: TransportEngine {
    /// Start (re)connecting; completion is reported as `Connect` or `Disconnect`
    fn connect(&mut self) -> Result<(), EngineError>;

    /// Handle of the server peer
    fn server_peer(&self) -> PeerId;
}

/// Take one event from an engine queue, waiting up to `timeout`
pub(crate) fn poll_queue(
    rx: &Receiver<EngineEvent>,
    timeout: Duration,
) -> Result<Option<EngineEvent>, EngineError> {
    if timeout.is_zero() {
        match rx.try_recv() {
            Ok(ev) => Ok(Some(ev)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(EngineError::Closed),
        }
    } else {
        match rx.recv_timeout(timeout) {
            Ok(ev) => Ok(Some(ev)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(EngineError::Closed),
        }
    }
}
