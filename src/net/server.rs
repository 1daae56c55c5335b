//! Server side of the transport
//!
//! Peers go through the token handshake:
//!
//! 1. transport connect: a [`Responder`] exists, no token yet
//! 2. TOKEN packet: the token is indexed and handed to storage as pending
//! 3. [`Server::set_valid_token`]: the peer becomes a player
//!
//! Disconnecting at any stage removes the peer; only validated tokens show
//! up as "just disconnected" in storage.

use std::array;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tracing::{debug, error, info, trace, warn};

use crate::metrics::Metrics;
use crate::net::channel::{Channel, PacketParams, CHANNEL_COUNT};
use crate::net::client::HEARTBEAT_CODE;
use crate::net::compression::decompress;
use crate::net::engine::{EngineEvent, PeerId, TransportEngine};
use crate::net::responder::Responder;
use crate::net::storage::SharedStorage;
use crate::net::token::Token;
use crate::net::traffic::TrafficReport;
use crate::net::transport::{
    NetError, SendError, SendPath, Server, ServerConnectCb, ServerDisconnectCb, ServerError,
    ServerErrorCb, ServerReceiveCb, ServerSyncCallback, ServerTokenConfirmationCb,
};

pub struct NetServer<E> {
    engine: E,
    path: Arc<SendPath>,
    responders: FxHashMap<PeerId, Responder>,
    tokens: FxHashMap<Token, PeerId>,
    storage: Option<SharedStorage>,
    sync_callback: Option<Box<dyn ServerSyncCallback>>,
    on_connect: Vec<ServerConnectCb>,
    on_error: Vec<ServerErrorCb>,
    on_receive: [Vec<ServerReceiveCb>; CHANNEL_COUNT],
    on_token_confirmation: Vec<ServerTokenConfirmationCb>,
    on_disconnect: Vec<ServerDisconnectCb>,
}

impl<E: TransportEngine> NetServer<E> {
    pub fn new(engine: E, traffic_window_secs: usize) -> Self {
        let path = SendPath::new(engine.sink(), traffic_window_secs);
        Self::with_path(engine, path)
    }

    /// Server that also feeds `metrics`
    pub fn with_metrics(engine: E, traffic_window_secs: usize, metrics: Arc<Metrics>) -> Self {
        let path = SendPath::new(engine.sink(), traffic_window_secs).with_metrics(metrics);
        Self::with_path(engine, path)
    }

    fn with_path(engine: E, path: SendPath) -> Self {
        Self {
            engine,
            path: Arc::new(path),
            responders: FxHashMap::default(),
            tokens: FxHashMap::default(),
            storage: None,
            sync_callback: None,
            on_connect: Vec::new(),
            on_error: Vec::new(),
            on_receive: array::from_fn(|_| Vec::new()),
            on_token_confirmation: Vec::new(),
            on_disconnect: Vec::new(),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Peers at any handshake stage
    pub fn responders(&self) -> impl Iterator<Item = &Responder> {
        self.responders.values()
    }

    pub fn responder_mut(&mut self, token: &Token) -> Option<&mut Responder> {
        let peer = self.tokens.get(token)?;
        self.responders.get_mut(peer)
    }

    pub fn peer_count(&self) -> usize {
        self.responders.len()
    }

    pub fn traffic_report(&self) -> TrafficReport {
        self.path.traffic().lock().report()
    }

    pub fn log_traffic(&self) {
        self.path.traffic().lock().log_summary();
    }

    fn notify_error(&mut self, error: NetError) {
        for callback in &mut self.on_error {
            callback(error);
        }
    }

    fn handle_connect(&mut self, peer: PeerId) {
        if self.responders.contains_key(&peer) {
            warn!("Duplicate connect for peer {}", peer);
            return;
        }
        debug!("Peer {} connected, waiting for token", peer);
        let responder = Responder::new(peer, self.path.clone());
        if let Some(metrics) = self.path.metrics() {
            metrics.connections_active.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(sync) = &mut self.sync_callback {
            sync.on_connect_server(&responder);
        }
        for callback in &mut self.on_connect {
            callback(&responder);
        }
        self.responders.insert(peer, responder);
    }

    fn handle_disconnect(&mut self, peer: PeerId) {
        let Some(responder) = self.responders.remove(&peer) else {
            debug!("Disconnect for unknown peer {}", peer);
            return;
        };
        self.path.drop_acks(peer);

        let token = responder.token().clone();
        let owns_token = !token.is_empty() && self.tokens.get(&token) == Some(&peer);
        if owns_token {
            self.tokens.remove(&token);
            if let Some(storage) = &self.storage {
                storage.lock().remove_connected_token(&token);
            }
        }
        if let Some(metrics) = self.path.metrics() {
            Metrics::gauge_dec(&metrics.connections_active);
            if responder.is_valid() {
                Metrics::gauge_dec(&metrics.peers_validated);
            }
        }
        info!("Peer {} disconnected (token {})", peer, token);

        for callback in &mut self.on_disconnect {
            callback(&token);
        }
    }

    fn handle_token(&mut self, peer: PeerId, data: &[u8]) {
        let Some(token) = Token::try_from_slice(data) else {
            warn!("Peer {} sent a malformed token of {} bytes", peer, data.len());
            return;
        };
        let Some(current) = self.responders.get(&peer).map(|r| r.token().clone()) else {
            return;
        };
        if !current.is_empty() {
            if current != token {
                warn!("Peer {} tried to change its token", peer);
            }
            return;
        }

        // Same player reconnecting before the old link timed out
        if let Some(old_peer) = self.tokens.insert(token.clone(), peer) {
            warn!("Token {} moved from peer {} to peer {}", token, old_peer, peer);
            if let Some(old) = self.responders.get_mut(&old_peer) {
                old.set_token(Token::empty());
                if old.is_valid() {
                    old.set_is_valid(false);
                    if let Some(metrics) = self.path.metrics() {
                        Metrics::gauge_dec(&metrics.peers_validated);
                    }
                }
            }
            if let Some(storage) = &self.storage {
                storage.lock().remove_connected_token(&token);
            }
            self.path.sink().disconnect(old_peer);
        }

        if let Some(responder) = self.responders.get_mut(&peer) {
            responder.set_token(token.clone());
        }
        if let Some(storage) = &self.storage {
            storage.lock().add_connected_token(&token);
        }
        info!("Peer {} presented token {}", peer, token);
    }

    fn handle_receive(&mut self, peer: PeerId, channel_id: u8, wire: Vec<u8>) {
        if !self.responders.contains_key(&peer) {
            debug!("Dropping packet from unknown peer {}", peer);
            if let Some(metrics) = self.path.metrics() {
                metrics.unknown_peer_packets.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }
        let Some(channel) = Channel::from_id(channel_id) else {
            warn!("Peer {} sent a packet on unknown channel {}", peer, channel_id);
            return;
        };
        self.path.record_inbound(channel, wire.len());

        let data = match decompress(&wire) {
            Ok(data) => data,
            Err(e) => {
                warn!("Dropping packet from peer {} on {}: {}", peer, channel, e);
                if let Some(metrics) = self.path.metrics() {
                    metrics.decompression_failures.fetch_add(1, Ordering::Relaxed);
                }
                return;
            }
        };

        match channel {
            Channel::Token => return self.handle_token(peer, &data),
            Channel::Service if data == HEARTBEAT_CODE.to_le_bytes() => {
                trace!("Heartbeat from peer {}", peer);
                return;
            }
            _ => {}
        }

        let Some(responder) = self.responders.get(&peer) else {
            return;
        };
        if let Some(sync) = &mut self.sync_callback {
            sync.on_receive_server(responder, channel, &data);
        }
        if !responder.token().is_empty() {
            if let Some(storage) = &self.storage {
                storage.lock().store_recv_packet(channel, responder.token(), &data);
            }
        }
        for callback in &mut self.on_receive[channel.index()] {
            callback(responder, &data);
        }
    }

    fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Connect { peer } => self.handle_connect(peer),
            EngineEvent::Disconnect { peer } => self.handle_disconnect(peer),
            EngineEvent::Receive { peer, channel, data } => self.handle_receive(peer, channel, data),
            EngineEvent::Ack { peer, ack_id } => match self.path.take_ack(ack_id) {
                Some(callback) => callback(),
                None => trace!("Ack {} from peer {} has no callback", ack_id, peer),
            },
            EngineEvent::Error { message } => {
                error!("Transport error: {}", message);
                self.notify_error(NetError::LoopError);
            }
        }
    }
}

impl<E: TransportEngine> Server for NetServer<E> {
    fn update(&mut self, timeout_ms: u32) -> bool {
        match self.engine.poll(Duration::from_millis(u64::from(timeout_ms))) {
            Ok(Some(event)) => {
                self.handle_event(event);
                true
            }
            Ok(None) => false,
            Err(e) => {
                error!("Server engine failed: {}", e);
                self.notify_error(NetError::LoopError);
                false
            }
        }
    }

    fn broadcast(&self, data: &[u8], params: PacketParams) -> Result<(), SendError> {
        let packed = self.path.prepare(data, params)?;
        for responder in self.responders.values().filter(|r| r.is_valid()) {
            self.path.deliver(responder.peer(), &packed, params, None);
        }
        Ok(())
    }

    fn foreach_responder(&self, f: &mut dyn FnMut(&Responder)) {
        for responder in self.responders.values().filter(|r| r.is_valid()) {
            f(responder);
        }
    }

    fn max_rtt(&self) -> u32 {
        self.responders
            .values()
            .filter(|r| r.is_valid())
            .map(Responder::rtt)
            .filter(|rtt| *rtt != u32::MAX)
            .max()
            .unwrap_or(0)
    }

    fn responder(&self, token: &Token) -> Option<&Responder> {
        let peer = self.tokens.get(token)?;
        self.responders.get(peer)
    }

    fn has_responder(&self, token: &Token) -> bool {
        self.tokens.contains_key(token)
    }

    fn set_valid_token(&mut self, token: &Token) -> Result<(), ServerError> {
        let peer = *self.tokens.get(token).ok_or(ServerError::UnknownToken)?;
        let responder = self.responders.get_mut(&peer).ok_or(ServerError::UnknownToken)?;
        if responder.is_valid() {
            return Ok(());
        }
        responder.set_is_valid(true);
        if let Some(storage) = &self.storage {
            storage.lock().confirm_token(token);
        }
        if let Some(metrics) = self.path.metrics() {
            metrics.peers_validated.fetch_add(1, Ordering::Relaxed);
        }
        info!("Token {} validated for peer {}", token, peer);

        let responder = &self.responders[&peer];
        for callback in &mut self.on_token_confirmation {
            callback(responder);
        }
        Ok(())
    }

    fn disconnect(&mut self, token: &Token) -> Result<(), ServerError> {
        let peer = *self.tokens.get(token).ok_or(ServerError::UnknownToken)?;
        self.path.sink().disconnect(peer);
        Ok(())
    }

    fn subscribe_on_connect(&mut self, callback: ServerConnectCb) {
        self.on_connect.push(callback);
    }

    fn subscribe_on_error(&mut self, callback: ServerErrorCb) {
        self.on_error.push(callback);
    }

    fn subscribe_on_receive(&mut self, channel: Channel, callback: ServerReceiveCb) {
        self.on_receive[channel.index()].push(callback);
    }

    fn subscribe_on_token_confirmation(&mut self, callback: ServerTokenConfirmationCb) {
        self.on_token_confirmation.push(callback);
    }

    fn subscribe_on_disconnect(&mut self, callback: ServerDisconnectCb) {
        self.on_disconnect.push(callback);
    }

    fn set_storage(&mut self, storage: SharedStorage) -> Result<(), ServerError> {
        if self.storage.is_some() {
            return Err(ServerError::StorageAlreadySet);
        }
        self.storage = Some(storage);
        Ok(())
    }

    fn set_sync_callback(&mut self, callback: Box<dyn ServerSyncCallback>) -> Result<(), ServerError> {
        if self.sync_callback.is_some() {
            return Err(ServerError::SyncCallbackAlreadySet);
        }
        self.sync_callback = Some(callback);
        Ok(())
    }
}
