//! Tick-scoped connection and packet storage
//!
//! The transport feeds a [`NetworkEventStorage`] as events arrive; game
//! systems read the storage during the tick. Everything "just" happened is
//! visible for exactly one tick: [`ConnectionStorage::begin_tick`] clears it
//! whether or not anyone looked.
//!
//! A token is listed in at most one of the "just" lists per tick. A token
//! that leaves and is confirmed again within one tick (it moved to a new
//! link) is only reported as connected; one that joins and leaves within a
//! tick is not reported at all.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tracing::debug;

use crate::net::channel::{Channel, CHANNEL_COUNT};
use crate::net::token::Token;

/// Sink for connection lifecycle and received packets
pub trait NetworkEventStorage: Send {
    /// Handshake token received from a peer
    fn add_connected_token(&mut self, token: &Token);

    /// Peer left, at any handshake stage
    fn remove_connected_token(&mut self, token: &Token);

    fn store_recv_packet(&mut self, channel: Channel, token: &Token, data: &[u8]);

    /// Token accepted by the application
    fn confirm_token(&mut self, token: &Token);
}

/// Storage shared between a transport and the systems reading it
pub type SharedStorage = Arc<Mutex<dyn NetworkEventStorage>>;

/// One received packet and its sender
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvPacket {
    /// Sender token; empty for packets a client received from its server
    pub token: Token,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct ConnectionStorage {
    pending: FxHashSet<Token>,
    connected: FxHashSet<Token>,
    just_connected: Vec<Token>,
    just_disconnected: Vec<Token>,
    confirmed: Vec<Token>,
    packets: [Vec<RecvPacket>; CHANNEL_COUNT],
}

impl ConnectionStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap in the shared handle expected by the transport
    pub fn shared() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Drop everything that was only visible for the previous tick
    pub fn begin_tick(&mut self) {
        self.just_connected.clear();
        self.just_disconnected.clear();
        self.confirmed.clear();
        for packets in &mut self.packets {
            packets.clear();
        }
    }

    pub fn connected_tokens(&self) -> &FxHashSet<Token> {
        &self.connected
    }

    pub fn is_connected(&self, token: &Token) -> bool {
        self.connected.contains(token)
    }

    /// Tokens received but not yet confirmed
    pub fn is_pending(&self, token: &Token) -> bool {
        self.pending.contains(token)
    }

    pub fn just_connected_tokens(&self) -> &[Token] {
        &self.just_connected
    }

    pub fn just_disconnected_tokens(&self) -> &[Token] {
        &self.just_disconnected
    }

    pub fn confirmed_tokens(&self) -> &[Token] {
        &self.confirmed
    }

    pub fn recv_packets(&self, channel: Channel) -> &[RecvPacket] {
        &self.packets[channel.index()]
    }
}

impl NetworkEventStorage for ConnectionStorage {
    fn add_connected_token(&mut self, token: &Token) {
        if self.connected.contains(token) {
            debug!("Token {} already connected", token);
            return;
        }
        self.pending.insert(token.clone());
    }

    fn remove_connected_token(&mut self, token: &Token) {
        self.pending.remove(token);
        if !self.connected.remove(token) {
            return;
        }
        let joined = self.just_connected.len();
        self.just_connected.retain(|t| t != token);
        if self.just_connected.len() == joined {
            self.just_disconnected.push(token.clone());
        }
    }

    fn store_recv_packet(&mut self, channel: Channel, token: &Token, data: &[u8]) {
        self.packets[channel.index()].push(RecvPacket {
            token: token.clone(),
            data: data.to_vec(),
        });
    }

    fn confirm_token(&mut self, token: &Token) {
        if !self.pending.remove(token) {
            debug!("Confirming token {} that is not pending", token);
            return;
        }
        self.just_disconnected.retain(|t| t != token);
        self.connected.insert(token.clone());
        self.just_connected.push(token.clone());
        self.confirmed.push(token.clone());
    }
}
