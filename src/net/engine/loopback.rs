//! In-process engine
//!
//! One [`LoopbackHub`] hosts a server endpoint and any number of client
//! endpoints, wired together with crossbeam channels. Delivery is immediate
//! and ordered. Unreliable packets can be dropped deterministically (every
//! Nth one) to exercise loss handling without a network.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::net::channel::{SendFlags, DEFAULT_MTU};
use crate::net::engine::{
    poll_queue, Connector, EngineError, EngineEvent, LinkStats, PacketSink, PeerId, TransportEngine,
};

/// Peer handle of the server as seen by loopback clients
pub const LOOPBACK_SERVER_PEER: PeerId = 0;

/// Hub behaviour
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    pub mtu: usize,
    /// Drop every Nth unreliable packet (0 = never)
    pub drop_every: u64,
    /// Round trip time reported in link stats
    pub rtt_ms: u32,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            drop_every: 0,
            rtt_ms: 1,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    lost: AtomicU64,
}

struct Link {
    to_client: Sender<EngineEvent>,
    connected: AtomicBool,
    /// Server to client
    down: Counters,
    /// Client to server
    up: Counters,
}

struct Shared {
    config: LoopbackConfig,
    to_server: Sender<EngineEvent>,
    server_rx: Receiver<EngineEvent>,
    links: RwLock<FxHashMap<PeerId, Arc<Link>>>,
    next_peer: AtomicU64,
    accepting: AtomicBool,
    unreliable_seen: AtomicU64,
}

impl Shared {
    fn link(&self, peer: PeerId) -> Option<Arc<Link>> {
        self.links.read().get(&peer).cloned()
    }

    /// Whether this unreliable packet is the one to drop
    fn should_drop(&self, flags: SendFlags) -> bool {
        if flags.is_reliable() || self.config.drop_every == 0 {
            return false;
        }
        let n = self.unreliable_seen.fetch_add(1, Ordering::Relaxed) + 1;
        n % self.config.drop_every == 0
    }

    fn check_size(&self, data: &[u8], flags: SendFlags) -> Result<(), EngineError> {
        if !flags.is_reliable() && data.len() > self.config.mtu {
            return Err(EngineError::TooLarge(data.len(), self.config.mtu));
        }
        Ok(())
    }

    fn close_link(&self, peer: PeerId) {
        let Some(link) = self.link(peer) else {
            return;
        };
        if link.connected.swap(false, Ordering::AcqRel) {
            debug!("Loopback link {} closed", peer);
            let _ = link.to_client.send(EngineEvent::Disconnect {
                peer: LOOPBACK_SERVER_PEER,
            });
            let _ = self.to_server.send(EngineEvent::Disconnect { peer });
        }
    }
}

/// In-process network
#[derive(Clone)]
pub struct LoopbackHub {
    shared: Arc<Shared>,
}

impl LoopbackHub {
    pub fn new(config: LoopbackConfig) -> Self {
        let (to_server, server_rx) = unbounded();
        Self {
            shared: Arc::new(Shared {
                config,
                to_server,
                server_rx,
                links: RwLock::new(FxHashMap::default()),
                next_peer: AtomicU64::new(LOOPBACK_SERVER_PEER + 1),
                accepting: AtomicBool::new(true),
                unreliable_seen: AtomicU64::new(0),
            }),
        }
    }

    /// Server endpoint; create one per hub
    pub fn server(&self) -> LoopbackServerEngine {
        LoopbackServerEngine {
            shared: self.shared.clone(),
            sink: Arc::new(ServerSink {
                shared: self.shared.clone(),
            }),
        }
    }

    /// New client endpoint, not yet connected
    pub fn client(&self) -> LoopbackClientEngine {
        let peer = self.shared.next_peer.fetch_add(1, Ordering::Relaxed);
        let (to_client, rx) = unbounded();
        let link = Arc::new(Link {
            to_client,
            connected: AtomicBool::new(false),
            down: Counters::default(),
            up: Counters::default(),
        });
        self.shared.links.write().insert(peer, link);
        LoopbackClientEngine {
            shared: self.shared.clone(),
            peer,
            rx,
            sink: Arc::new(ClientSink {
                shared: self.shared.clone(),
                peer,
            }),
        }
    }

    /// Refuse (or accept again) new connections
    pub fn set_accepting(&self, accepting: bool) {
        self.shared.accepting.store(accepting, Ordering::Release);
    }

    /// Drop the link of `peer` as if the network failed
    pub fn sever(&self, peer: PeerId) {
        self.shared.close_link(peer);
    }

    pub fn connected_peers(&self) -> usize {
        self.shared
            .links
            .read()
            .values()
            .filter(|l| l.connected.load(Ordering::Acquire))
            .count()
    }
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new(LoopbackConfig::default())
    }
}

pub struct LoopbackServerEngine {
    shared: Arc<Shared>,
    sink: Arc<ServerSink>,
}

impl TransportEngine for LoopbackServerEngine {
    fn poll(&mut self, timeout: Duration) -> Result<Option<EngineEvent>, EngineError> {
        poll_queue(&self.shared.server_rx, timeout)
    }

    fn sink(&self) -> Arc<dyn PacketSink> {
        self.sink.clone()
    }
}

struct ServerSink {
    shared: Arc<Shared>,
}

impl PacketSink for ServerSink {
    fn send(
        &self,
        peer: PeerId,
        channel: u8,
        data: &[u8],
        flags: SendFlags,
        ack_id: Option<u64>,
    ) -> Result<(), EngineError> {
        let link = self
            .shared
            .link(peer)
            .filter(|l| l.connected.load(Ordering::Acquire))
            .ok_or(EngineError::UnknownPeer(peer))?;
        self.shared.check_size(data, flags)?;

        link.down.sent.fetch_add(1, Ordering::Relaxed);
        if self.shared.should_drop(flags) {
            trace!("Loopback dropped unreliable packet to {}", peer);
            link.down.lost.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        link.to_client
            .send(EngineEvent::Receive {
                peer: LOOPBACK_SERVER_PEER,
                channel,
                data: data.to_vec(),
            })
            .map_err(|_| EngineError::Closed)?;
        if let (Some(ack_id), true) = (ack_id, flags.is_reliable()) {
            let _ = self.shared.to_server.send(EngineEvent::Ack { peer, ack_id });
        }
        Ok(())
    }

    fn disconnect(&self, peer: PeerId) {
        self.shared.close_link(peer);
    }

    fn stats(&self, peer: PeerId) -> Option<LinkStats> {
        self.shared.link(peer).map(|l| LinkStats {
            rtt_ms: self.shared.config.rtt_ms,
            packets_sent: l.down.sent.load(Ordering::Relaxed),
            packets_lost: l.down.lost.load(Ordering::Relaxed),
        })
    }

    fn mtu(&self) -> usize {
        self.shared.config.mtu
    }
}

pub struct LoopbackClientEngine {
    shared: Arc<Shared>,
    peer: PeerId,
    rx: Receiver<EngineEvent>,
    sink: Arc<ClientSink>,
}

impl LoopbackClientEngine {
    /// Handle the server uses for this client
    pub fn peer_id(&self) -> PeerId {
        self.peer
    }
}

impl TransportEngine for LoopbackClientEngine {
    fn poll(&mut self, timeout: Duration) -> Result<Option<EngineEvent>, EngineError> {
        poll_queue(&self.rx, timeout)
    }

    fn sink(&self) -> Arc<dyn PacketSink> {
        self.sink.clone()
    }
}

impl Connector for LoopbackClientEngine {
    fn connect(&mut self) -> Result<(), EngineError> {
        let link = self.shared.link(self.peer).ok_or(EngineError::Closed)?;
        if !self.shared.accepting.load(Ordering::Acquire) {
            debug!("Loopback hub refused peer {}", self.peer);
            let _ = link.to_client.send(EngineEvent::Disconnect {
                peer: LOOPBACK_SERVER_PEER,
            });
            return Ok(());
        }
        if link.connected.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _ = self.shared.to_server.send(EngineEvent::Connect { peer: self.peer });
        let _ = link.to_client.send(EngineEvent::Connect {
            peer: LOOPBACK_SERVER_PEER,
        });
        Ok(())
    }

    fn server_peer(&self) -> PeerId {
        LOOPBACK_SERVER_PEER
    }
}

impl Drop for LoopbackClientEngine {
    fn drop(&mut self) {
        self.shared.close_link(self.peer);
        self.shared.links.write().remove(&self.peer);
    }
}

struct ClientSink {
    shared: Arc<Shared>,
    peer: PeerId,
}

impl PacketSink for ClientSink {
    fn send(
        &self,
        _server: PeerId,
        channel: u8,
        data: &[u8],
        flags: SendFlags,
        ack_id: Option<u64>,
    ) -> Result<(), EngineError> {
        let link = self
            .shared
            .link(self.peer)
            .filter(|l| l.connected.load(Ordering::Acquire))
            .ok_or(EngineError::Closed)?;
        self.shared.check_size(data, flags)?;

        link.up.sent.fetch_add(1, Ordering::Relaxed);
        if self.shared.should_drop(flags) {
            trace!("Loopback dropped unreliable packet from {}", self.peer);
            link.up.lost.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        self.shared
            .to_server
            .send(EngineEvent::Receive {
                peer: self.peer,
                channel,
                data: data.to_vec(),
            })
            .map_err(|_| EngineError::Closed)?;
        if let (Some(ack_id), true) = (ack_id, flags.is_reliable()) {
            let _ = link.to_client.send(EngineEvent::Ack {
                peer: LOOPBACK_SERVER_PEER,
                ack_id,
            });
        }
        Ok(())
    }

    fn disconnect(&self, _server: PeerId) {
        self.shared.close_link(self.peer);
    }

    fn stats(&self, _server: PeerId) -> Option<LinkStats> {
        self.shared.link(self.peer).map(|l| LinkStats {
            rtt_ms: self.shared.config.rtt_ms,
            packets_sent: l.up.sent.load(Ordering::Relaxed),
            packets_lost: l.up.lost.load(Ordering::Relaxed),
        })
    }

    fn mtu(&self) -> usize {
        self.shared.config.mtu
    }
}
