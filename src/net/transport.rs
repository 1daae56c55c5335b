//! Client and server contracts
//!
//! [`Client`] and [`Server`] are what game systems talk to. The concrete
//! [`NetClient`](crate::net::client::NetClient) and
//! [`NetServer`](crate::net::server::NetServer) run them over any engine;
//! [`NullClient`](crate::net::stub::NullClient) and
//! [`NullServer`](crate::net::stub::NullServer) stand in for bots and tests.
//!
//! Callbacks run synchronously inside `update`, in subscription order.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::metrics::Metrics;
use crate::net::channel::{Channel, PacketParams, MAX_PACKET_SIZE};
use crate::net::compression::compress;
use crate::net::engine::{PacketSink, PeerId};
use crate::net::responder::Responder;
use crate::net::storage::SharedStorage;
use crate::net::token::Token;
use crate::net::traffic::{Direction, TrafficLogger};

/// Asynchronous transport failure reported to error subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum NetError {
    #[error("Not connected")]
    NotConnected,
    #[error("Transport loop failed")]
    LoopError,
}

/// Send rejected because of its size; a caller bug, not a network condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("Packet of {0} bytes exceeds maximum {max}", max = MAX_PACKET_SIZE)]
    PacketTooLarge(usize),
    #[error("Compressed unreliable packet of {size} bytes exceeds MTU {mtu}")]
    ExceedsMtu { size: usize, mtu: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ServerError {
    #[error("Event storage is already set")]
    StorageAlreadySet,
    #[error("Sync callback is already set")]
    SyncCallbackAlreadySet,
    #[error("No peer holds the given token")]
    UnknownToken,
}

pub type ClientConnectCb = Box<dyn FnMut() + Send>;
pub type ClientDisconnectCb = Box<dyn FnMut() + Send>;
pub type ClientErrorCb = Box<dyn FnMut(NetError) + Send>;
pub type ClientReceiveCb = Box<dyn FnMut(&[u8]) + Send>;

pub type ServerConnectCb = Box<dyn FnMut(&Responder) + Send>;
pub type ServerErrorCb = Box<dyn FnMut(NetError) + Send>;
pub type ServerReceiveCb = Box<dyn FnMut(&Responder, &[u8]) + Send>;
pub type ServerTokenConfirmationCb = Box<dyn FnMut(&Responder) + Send>;
/// Receives the token the peer held; empty if it never sent one
pub type ServerDisconnectCb = Box<dyn FnMut(&Token) + Send>;

/// Runs once the engine confirms delivery of a reliable packet
pub type AckCallback = Box<dyn FnOnce() + Send>;

/// Low-latency hooks invoked before regular dispatch
pub trait ServerSyncCallback: Send {
    fn on_connect_server(&mut self, responder: &Responder);
    fn on_receive_server(&mut self, responder: &Responder, channel: Channel, data: &[u8]);
}

pub trait Client {
    /// Process at most one transport event, waiting up to `timeout_ms`
    fn update(&mut self, timeout_ms: u32) -> bool;

    fn is_connected(&self) -> bool;

    /// `Ok(false)` when not connected
    fn send(&self, data: &[u8], params: PacketParams) -> Result<bool, SendError>;

    fn subscribe_on_connect(&mut self, callback: ClientConnectCb);
    fn subscribe_on_disconnect(&mut self, callback: ClientDisconnectCb);
    fn subscribe_on_error(&mut self, callback: ClientErrorCb);
    fn subscribe_on_receive(&mut self, channel: Channel, callback: ClientReceiveCb);

    fn auth_token(&self) -> &Token;

    /// Round trip time in milliseconds, `u32::MAX` when unavailable
    fn ping(&self) -> u32;

    /// Smoothed packet loss ratio
    fn packet_loss(&self) -> f32;
}

pub trait Server {
    /// Process at most one transport event, waiting up to `timeout_ms`
    fn update(&mut self, timeout_ms: u32) -> bool;

    /// Send to every validated peer
    fn broadcast(&self, data: &[u8], params: PacketParams) -> Result<(), SendError>;

    /// Visit every validated peer
    fn foreach_responder(&self, f: &mut dyn FnMut(&Responder));

    /// Highest round trip time among validated peers
    fn max_rtt(&self) -> u32;

    fn responder(&self, token: &Token) -> Option<&Responder>;
    fn has_responder(&self, token: &Token) -> bool;

    /// Admit the peer holding `token` as a player
    fn set_valid_token(&mut self, token: &Token) -> Result<(), ServerError>;

    /// Start disconnecting the peer holding `token`
    fn disconnect(&mut self, token: &Token) -> Result<(), ServerError>;

    fn subscribe_on_connect(&mut self, callback: ServerConnectCb);
    fn subscribe_on_error(&mut self, callback: ServerErrorCb);
    fn subscribe_on_receive(&mut self, channel: Channel, callback: ServerReceiveCb);
    fn subscribe_on_token_confirmation(&mut self, callback: ServerTokenConfirmationCb);
    fn subscribe_on_disconnect(&mut self, callback: ServerDisconnectCb);

    fn set_storage(&mut self, storage: SharedStorage) -> Result<(), ServerError>;
    fn set_sync_callback(&mut self, callback: Box<dyn ServerSyncCallback>) -> Result<(), ServerError>;
}

/// Call `update(0)` until it reports idle or `budget` is spent
///
/// Returns the number of events processed.
pub fn pump(mut update: impl FnMut(u32) -> bool, budget: Duration) -> usize {
    let start = Instant::now();
    let mut processed = 0;
    while start.elapsed() < budget && update(0) {
        processed += 1;
    }
    processed
}

/// Exponentially weighted packet loss from cumulative link counters
///
/// Holds the last value so it can be returned while nothing has been sent.
#[derive(Debug, Default)]
pub struct LossEstimator {
    bits: AtomicU32,
}

impl LossEstimator {
    /// Weight kept from the previous value
    pub const WEIGHT: f32 = 0.992;

    pub fn sample(&self, packets_sent: u64, packets_lost: u64) -> f32 {
        let previous = self.value();
        if packets_sent == 0 {
            return previous;
        }
        let ratio = packets_lost as f32 / packets_sent as f32;
        let next = previous * Self::WEIGHT + ratio * (1.0 - Self::WEIGHT);
        self.bits.store(next.to_bits(), Ordering::Relaxed);
        next
    }

    pub fn value(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// Shared outbound half of a client or server
///
/// Checks sizes, compresses, records traffic and tracks ack callbacks.
pub struct SendPath {
    sink: Arc<dyn PacketSink>,
    traffic: Mutex<TrafficLogger>,
    metrics: Option<Arc<Metrics>>,
    next_ack: AtomicU64,
    acks: Mutex<FxHashMap<u64, (PeerId, AckCallback)>>,
}

impl SendPath {
    pub fn new(sink: Arc<dyn PacketSink>, traffic_window_secs: usize) -> Self {
        Self {
            sink,
            traffic: Mutex::new(TrafficLogger::new(traffic_window_secs)),
            metrics: None,
            next_ack: AtomicU64::new(1),
            acks: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn sink(&self) -> &Arc<dyn PacketSink> {
        &self.sink
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    pub fn traffic(&self) -> &Mutex<TrafficLogger> {
        &self.traffic
    }

    /// Validate and compress a payload once for any number of peers
    pub fn prepare(&self, data: &[u8], params: PacketParams) -> Result<Vec<u8>, SendError> {
        if data.len() > MAX_PACKET_SIZE {
            return Err(SendError::PacketTooLarge(data.len()));
        }
        let packed = compress(data);
        let mtu = self.sink.mtu();
        if !params.is_reliable && packed.len() > mtu {
            return Err(SendError::ExceedsMtu {
                size: packed.len(),
                mtu,
            });
        }
        Ok(packed)
    }

    /// Hand a prepared packet to the engine; `false` if the engine refused it
    pub fn deliver(
        &self,
        peer: PeerId,
        packed: &[u8],
        params: PacketParams,
        on_ack: Option<AckCallback>,
    ) -> bool {
        let ack_id = match on_ack {
            Some(callback) if params.is_reliable => {
                let id = self.next_ack.fetch_add(1, Ordering::Relaxed);
                self.acks.lock().insert(id, (peer, callback));
                Some(id)
            }
            Some(_) => {
                debug!("Ack callback ignored for unreliable packet on {}", params.channel);
                None
            }
            None => None,
        };

        match self.sink.send(peer, params.channel.id(), packed, params.flags(), ack_id) {
            Ok(()) => {
                self.traffic
                    .lock()
                    .record(Direction::Outbound, params.channel, packed.len());
                if let Some(metrics) = &self.metrics {
                    metrics.record_sent(packed.len());
                }
                true
            }
            Err(e) => {
                if let Some(id) = ack_id {
                    self.acks.lock().remove(&id);
                }
                warn!("Send to peer {} on {} failed: {}", peer, params.channel, e);
                false
            }
        }
    }

    /// Count an inbound packet of `bytes` compressed bytes
    pub fn record_inbound(&self, channel: Channel, bytes: usize) {
        self.traffic.lock().record(Direction::Inbound, channel, bytes);
        if let Some(metrics) = &self.metrics {
            metrics.record_received(bytes);
        }
    }

    /// Take the callback registered for `ack_id`
    pub fn take_ack(&self, ack_id: u64) -> Option<AckCallback> {
        self.acks.lock().remove(&ack_id).map(|(_, callback)| callback)
    }

    /// Forget callbacks of a peer that went away
    pub fn drop_acks(&self, peer: PeerId) {
        self.acks.lock().retain(|_, (owner, _)| *owner != peer);
    }

    pub fn pending_acks(&self) -> usize {
        self.acks.lock().len()
    }
}
