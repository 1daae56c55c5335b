//! QUIC engine (WebTransport via wtransport)
//!
//! Reliable packets are `[channel][payload]` frames on one bidirectional
//! stream per peer, opened by the client. Unreliable packets are datagrams
//! with a `[channel][flags][seq]` header. Async I/O runs on a shared tokio
//! runtime and reaches the poll side through a bounded crossbeam queue.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use wtransport::endpoint::IncomingSession;
use wtransport::tls::Sha256Digest;
use wtransport::{ClientConfig, Connection, Endpoint, RecvStream, SendStream, ServerConfig, VarInt};

use crate::net::channel::SendFlags;
use crate::net::engine::{
    poll_queue, Connector, EngineError, EngineEvent, LinkStats, PacketSink, PeerId, TransportEngine,
};
use crate::net::framing::{read_packet, write_message, write_packet, DatagramHeader, DATAGRAM_HEADER_SIZE};
use crate::net::tls::TlsConfig;
use crate::util::wrapping::sequence_newer;

/// Capacity of the I/O to poll event queue
pub const EVENT_QUEUE_CAPACITY: usize = 4096;

/// Peer handle of the server as seen by QUIC clients
pub const QUIC_SERVER_PEER: PeerId = 0;

const KEEP_ALIVE: Duration = Duration::from_secs(3);

static RUNTIME: Mutex<Weak<Runtime>> = parking_lot::const_mutex(Weak::new());

/// Process-wide handle on the I/O runtime
///
/// The first guard builds the runtime, the last one dropped shuts it down.
pub struct EngineRuntime {
    handle: Handle,
    runtime: Option<Arc<Runtime>>,
}

impl EngineRuntime {
    pub fn acquire() -> Result<Self, EngineError> {
        let mut slot = RUNTIME.lock();
        let runtime = match slot.upgrade() {
            Some(rt) => rt,
            None => {
                let rt = Arc::new(
                    tokio::runtime::Builder::new_multi_thread()
                        .worker_threads(2)
                        .thread_name("netcore-io")
                        .enable_all()
                        .build()?,
                );
                *slot = Arc::downgrade(&rt);
                info!("Network I/O runtime started");
                rt
            }
        };
        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Whether this guard shares its runtime with `other`
    pub fn same_runtime(&self, other: &EngineRuntime) -> bool {
        match (&self.runtime, &other.runtime) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Drop for EngineRuntime {
    fn drop(&mut self) {
        let Some(rt) = self.runtime.take() else {
            return;
        };
        let _slot = RUNTIME.lock();
        if let Ok(rt) = Arc::try_unwrap(rt) {
            info!("Network I/O runtime stopped");
            rt.shutdown_background();
        }
    }
}

/// Sequence tracking of inbound datagrams on one link
#[derive(Debug, Default)]
struct InboundSequence {
    expected: Option<u16>,
    newest: FxHashMap<u8, u16>,
}

impl InboundSequence {
    /// Record an arrival; returns the number of datagrams skipped over, or
    /// `None` for a late arrival that was already counted as skipped
    fn track(&mut self, seq: u16) -> Option<u64> {
        let skipped = match self.expected {
            Some(expected) if seq == expected => 0,
            Some(expected) if sequence_newer(seq, expected) => u64::from(seq.wrapping_sub(expected)),
            Some(_) => return None,
            None => 0,
        };
        self.expected = Some(seq.wrapping_add(1));
        Some(skipped)
    }

    /// Whether a sequenced datagram is newer than everything seen on its channel
    fn accept_sequenced(&mut self, channel: u8, seq: u16) -> bool {
        match self.newest.get(&channel) {
            Some(&newest) if !sequence_newer(seq, newest) => false,
            _ => {
                self.newest.insert(channel, seq);
                true
            }
        }
    }
}

/// Loss accounting of the datagrams a peer sends to us
///
/// Both counters describe the same direction: `expected` counts every
/// datagram the peer is known to have sent, `lost` the subset that never
/// reached the event queue. `lost` never exceeds `expected`.
#[derive(Debug, Default)]
struct InboundLoss {
    expected: AtomicU64,
    lost: AtomicU64,
}

impl InboundLoss {
    /// An in-order or newer datagram arrived after `skipped` missing ones
    fn arrived(&self, skipped: u64) {
        self.expected.fetch_add(skipped + 1, Ordering::Release);
        if skipped > 0 {
            self.lost.fetch_add(skipped, Ordering::Release);
        }
    }

    /// A datagram already recorded by `arrived` was dropped locally
    fn dropped(&self) {
        self.lost.fetch_add(1, Ordering::Release);
    }

    /// `(expected, lost)`; `lost` is read first so the pair stays ordered
    fn snapshot(&self) -> (u64, u64) {
        let lost = self.lost.load(Ordering::Acquire);
        let expected = self.expected.load(Ordering::Acquire);
        (expected, lost)
    }
}

struct Outbound {
    channel: u8,
    data: Vec<u8>,
    ack_id: Option<u64>,
}

struct PeerLink {
    connection: Arc<Connection>,
    reliable: mpsc::UnboundedSender<Outbound>,
    next_seq: AtomicU16,
    inbound: InboundLoss,
}

struct Shared {
    links: RwLock<FxHashMap<PeerId, Arc<PeerLink>>>,
    events: Sender<EngineEvent>,
    mtu: usize,
    max_peers: usize,
    next_peer: AtomicU64,
}

impl Shared {
    fn new(events: Sender<EngineEvent>, mtu: usize, max_peers: usize) -> Self {
        Self {
            links: RwLock::new(FxHashMap::default()),
            events,
            mtu,
            max_peers,
            next_peer: AtomicU64::new(QUIC_SERVER_PEER + 1),
        }
    }

    fn link(&self, peer: PeerId) -> Option<Arc<PeerLink>> {
        self.links.read().get(&peer).cloned()
    }

    /// Lifecycle events must not be lost, wait for room in the queue
    fn push_lifecycle(&self, event: EngineEvent) {
        let events = self.events.clone();
        tokio::task::block_in_place(move || {
            let _ = events.send(event);
        });
    }

    /// Data events are dropped when the game thread falls behind
    fn push_data(&self, event: EngineEvent) -> bool {
        match self.events.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Network event queue full, dropping inbound packet");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Drive one established peer until its connection closes
///
/// Publishes `Connect` on entry. The closing `Disconnect` is left to the
/// caller so it can settle its own state first.
async fn run_peer(
    peer: PeerId,
    connection: Connection,
    mut send: SendStream,
    mut recv: RecvStream,
    shared: Arc<Shared>,
) {
    let connection = Arc::new(connection);
    let (reliable_tx, mut reliable_rx) = mpsc::unbounded_channel::<Outbound>();
    let link = Arc::new(PeerLink {
        connection: connection.clone(),
        reliable: reliable_tx,
        next_seq: AtomicU16::new(0),
        inbound: InboundLoss::default(),
    });
    shared.links.write().insert(peer, link.clone());
    shared.push_lifecycle(EngineEvent::Connect { peer });
    debug!("QUIC peer {} connected", peer);

    let writer_shared = shared.clone();
    let writer = tokio::spawn(async move {
        while let Some(out) = reliable_rx.recv().await {
            if let Err(e) = write_packet(&mut send, out.channel, &out.data).await {
                debug!("Reliable write to peer {} failed: {}", peer, e);
                break;
            }
            if let Some(ack_id) = out.ack_id {
                writer_shared.push_data(EngineEvent::Ack { peer, ack_id });
            }
        }
    });

    let reader_shared = shared.clone();
    let reader_connection = connection.clone();
    let reader = tokio::spawn(async move {
        loop {
            match read_packet(&mut recv).await {
                Ok(Some((channel, data))) => {
                    reader_shared.push_data(EngineEvent::Receive { peer, channel, data });
                }
                Ok(None) => {}
                Err(e) => {
                    debug!("Reliable stream of peer {} ended: {}", peer, e);
                    break;
                }
            }
        }
        reader_connection.close(VarInt::from_u32(0), b"stream closed");
    });

    let mut sequence = InboundSequence::default();
    loop {
        let datagram = match connection.receive_datagram().await {
            Ok(d) => d,
            Err(e) => {
                debug!("QUIC peer {} closed: {}", peer, e);
                break;
            }
        };
        let Ok((header, payload)) = DatagramHeader::decode(&datagram) else {
            debug!("Malformed datagram from peer {}", peer);
            continue;
        };

        let arrival = sequence.track(header.sequence);
        if let Some(skipped) = arrival {
            link.inbound.arrived(skipped);
        }
        let flags = SendFlags::from_bits_truncate(header.flags);
        if flags.is_sequenced_unreliable() && !sequence.accept_sequenced(header.channel, header.sequence) {
            trace!("Stale datagram {} on channel {} from peer {}", header.sequence, header.channel, peer);
            continue;
        }
        if !shared.push_data(EngineEvent::Receive {
            peer,
            channel: header.channel,
            data: payload.to_vec(),
        }) && arrival.is_some()
        {
            link.inbound.dropped();
        }
    }

    writer.abort();
    reader.abort();
    shared.links.write().remove(&peer);
    debug!("QUIC peer {} disconnected", peer);
}

struct QuicSink {
    shared: Arc<Shared>,
}

impl PacketSink for QuicSink {
    fn send(
        &self,
        peer: PeerId,
        channel: u8,
        data: &[u8],
        flags: SendFlags,
        ack_id: Option<u64>,
    ) -> Result<(), EngineError> {
        let link = self.shared.link(peer).ok_or(EngineError::UnknownPeer(peer))?;

        if flags.is_reliable() {
            link.reliable
                .send(Outbound {
                    channel,
                    data: data.to_vec(),
                    ack_id,
                })
                .map_err(|_| EngineError::Closed)?;
        } else {
            let limit = link
                .connection
                .max_datagram_size()
                .map_or(0, |max| max.saturating_sub(DATAGRAM_HEADER_SIZE))
                .min(self.shared.mtu);
            if data.len() > limit {
                return Err(EngineError::TooLarge(data.len(), limit));
            }
            let sequence = link.next_seq.fetch_add(1, Ordering::Relaxed);
            let datagram = DatagramHeader {
                channel,
                flags: flags.bits(),
                sequence,
            }
            .encode(data);
            if let Err(e) = link.connection.send_datagram(datagram) {
                debug!("Datagram to peer {} not sent: {}", peer, e);
            }
        }
        Ok(())
    }

    fn disconnect(&self, peer: PeerId) {
        if let Some(link) = self.shared.link(peer) {
            link.connection.close(VarInt::from_u32(0), b"disconnect");
        }
    }

    fn stats(&self, peer: PeerId) -> Option<LinkStats> {
        self.shared.link(peer).map(|link| {
            // QUIC hides datagram loss from the sender; measure what the peer sent us
            let (expected, lost) = link.inbound.snapshot();
            LinkStats {
                rtt_ms: link.connection.rtt().as_millis().min(u128::from(u32::MAX)) as u32,
                packets_sent: expected,
                packets_lost: lost,
            }
        })
    }

    fn mtu(&self) -> usize {
        self.shared.mtu
    }
}

/// Server side QUIC engine
pub struct QuicServerEngine {
    events: Receiver<EngineEvent>,
    sink: Arc<QuicSink>,
    accept_task: JoinHandle<()>,
    port: u16,
    cert_hash: String,
    runtime: EngineRuntime,
}

impl QuicServerEngine {
    /// Bind on `addr` (port 0 picks a free port) and start accepting sessions
    ///
    /// An unspecified address binds dual-stack.
    pub fn bind(addr: SocketAddr, tls: TlsConfig, mtu: usize, max_peers: usize) -> Result<Self, EngineError> {
        let runtime = EngineRuntime::acquire()?;
        let handle = runtime.handle().clone();
        let _enter = handle.enter();

        let builder = ServerConfig::builder();
        let builder = if addr.ip().is_unspecified() {
            builder.with_bind_default(addr.port())
        } else {
            builder.with_bind_address(addr)
        };
        let config = builder
            .with_identity(tls.identity)
            .keep_alive_interval(Some(KEEP_ALIVE))
            .build();
        let endpoint = Endpoint::server(config)?;
        let port = endpoint.local_addr()?.port();

        let (tx, events) = bounded(EVENT_QUEUE_CAPACITY);
        let shared = Arc::new(Shared::new(tx, mtu, max_peers));
        let accept_shared = shared.clone();
        let accept_task = handle.spawn(async move {
            loop {
                let incoming = endpoint.accept().await;
                let shared = accept_shared.clone();
                tokio::spawn(async move {
                    if let Err(e) = accept_peer(incoming, shared).await {
                        warn!("QUIC session setup failed: {}", e);
                    }
                });
            }
        });

        info!("QUIC engine listening on port {}", port);
        Ok(Self {
            events,
            sink: Arc::new(QuicSink { shared }),
            accept_task,
            port,
            cert_hash: tls.cert_hash,
            runtime,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Base64 certificate hash clients pin
    pub fn cert_hash(&self) -> &str {
        &self.cert_hash
    }

    pub fn peer_count(&self) -> usize {
        self.sink.shared.links.read().len()
    }
}

async fn accept_peer(incoming: IncomingSession, shared: Arc<Shared>) -> anyhow::Result<()> {
    let request = incoming.await?;
    if shared.links.read().len() >= shared.max_peers {
        warn!("Rejecting session from {}: server full", request.authority());
        request.forbidden().await;
        return Ok(());
    }

    let connection = request.accept().await?;
    let (send, recv) = connection.accept_bi().await?;
    let peer = shared.next_peer.fetch_add(1, Ordering::Relaxed);
    run_peer(peer, connection, send, recv, shared.clone()).await;
    shared.push_lifecycle(EngineEvent::Disconnect { peer });
    Ok(())
}

impl TransportEngine for QuicServerEngine {
    fn poll(&mut self, timeout: Duration) -> Result<Option<EngineEvent>, EngineError> {
        poll_queue(&self.events, timeout)
    }

    fn sink(&self) -> Arc<dyn PacketSink> {
        self.sink.clone()
    }
}

impl Drop for QuicServerEngine {
    fn drop(&mut self) {
        self.accept_task.abort();
        for link in self.sink.shared.links.read().values() {
            link.connection.close(VarInt::from_u32(0), b"server shutdown");
        }
    }
}

/// Client side QUIC engine
pub struct QuicClientEngine {
    url: String,
    cert_hash: Option<Sha256Digest>,
    events: Receiver<EngineEvent>,
    sink: Arc<QuicSink>,
    dialing: Arc<AtomicBool>,
    dial_task: Option<JoinHandle<()>>,
    runtime: EngineRuntime,
}

impl QuicClientEngine {
    /// Engine for `url` (e.g. `https://127.0.0.1:9000`)
    ///
    /// With `cert_hash` the server certificate is pinned, otherwise the
    /// platform roots are used.
    pub fn new(url: &str, cert_hash: Option<Sha256Digest>, mtu: usize) -> Result<Self, EngineError> {
        let runtime = EngineRuntime::acquire()?;
        let (tx, events) = bounded(EVENT_QUEUE_CAPACITY);
        Ok(Self {
            url: url.to_string(),
            cert_hash,
            events,
            sink: Arc::new(QuicSink {
                shared: Arc::new(Shared::new(tx, mtu, 1)),
            }),
            dialing: Arc::new(AtomicBool::new(false)),
            dial_task: None,
            runtime,
        })
    }

    fn client_config(&self) -> ClientConfig {
        let builder = ClientConfig::builder().with_bind_default();
        let builder = match &self.cert_hash {
            Some(hash) => builder.with_server_certificate_hashes([hash.clone()]),
            None => builder.with_native_certs(),
        };
        builder.keep_alive_interval(Some(KEEP_ALIVE)).build()
    }
}

async fn dial(url: String, config: ClientConfig, shared: Arc<Shared>) -> anyhow::Result<()> {
    let endpoint = Endpoint::client(config)?;
    let connection = endpoint.connect(url.as_str()).await?;
    let (mut send, recv) = connection.open_bi().await?.await?;
    // The server only sees the stream once something is written on it
    write_message(&mut send, &[]).await?;
    run_peer(QUIC_SERVER_PEER, connection, send, recv, shared).await;
    Ok(())
}

/// Await one dial attempt and publish its terminal `Disconnect`
///
/// The dial flag is cleared before the event is queued, so a `connect`
/// issued in reaction to that `Disconnect` always starts a fresh dial.
async fn finish_dial<F>(attempt: F, dialing: Arc<AtomicBool>, shared: Arc<Shared>)
where
    F: Future<Output = anyhow::Result<()>>,
{
    if let Err(e) = attempt.await {
        warn!("Connection attempt failed: {}", e);
    }
    dialing.store(false, Ordering::Release);
    shared.push_lifecycle(EngineEvent::Disconnect {
        peer: QUIC_SERVER_PEER,
    });
}

impl TransportEngine for QuicClientEngine {
    fn poll(&mut self, timeout: Duration) -> Result<Option<EngineEvent>, EngineError> {
        poll_queue(&self.events, timeout)
    }

    fn sink(&self) -> Arc<dyn PacketSink> {
        self.sink.clone()
    }
}

impl Connector for QuicClientEngine {
    fn connect(&mut self) -> Result<(), EngineError> {
        if self.dialing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let config = self.client_config();
        let url = self.url.clone();
        let shared = self.sink.shared.clone();
        let dialing = self.dialing.clone();

        debug!("Connecting to {}", url);
        let attempt = dial(url, config, shared.clone());
        self.dial_task = Some(self.runtime.handle().spawn(finish_dial(attempt, dialing, shared)));
        Ok(())
    }

    fn server_peer(&self) -> PeerId {
        QUIC_SERVER_PEER
    }
}

impl Drop for QuicClientEngine {
    fn drop(&mut self) {
        if let Some(task) = self.dial_task.take() {
            task.abort();
        }
        self.sink.disconnect(QUIC_SERVER_PEER);
    }
}
