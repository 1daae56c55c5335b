use std::sync::Arc;

use crate::net::channel::PacketParams;
use crate::net::engine::{LinkStats, PeerId};
use crate::net::token::Token;
use crate::net::transport::{AckCallback, LossEstimator, SendError, SendPath};

/// Handshake stage of a peer, as seen by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Transport connected, no token packet yet
    PendingToken,
    /// Token received, waiting for the application to confirm it
    PendingValidation,
    /// Admitted as a player
    Validated,
}

/// One connected peer from the server's point of view
///
/// Owned by the server; callbacks only borrow it for the duration of the
/// call. Keep the [`Token`] to find the peer again on a later tick.
pub struct Responder {
    peer: PeerId,
    token: Token,
    is_valid: bool,
    team_id: u8,
    saved_rtt: Option<u32>,
    loss: LossEstimator,
    path: Arc<SendPath>,
}

impl Responder {
    pub fn new(peer: PeerId, path: Arc<SendPath>) -> Self {
        Self {
            peer,
            token: Token::empty(),
            is_valid: false,
            team_id: 0,
            saved_rtt: None,
            loss: LossEstimator::default(),
            path,
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn state(&self) -> PeerState {
        if self.is_valid {
            PeerState::Validated
        } else if self.token.is_empty() {
            PeerState::PendingToken
        } else {
            PeerState::PendingValidation
        }
    }

    /// Send to this peer; `on_ack` runs inside a later server update once a
    /// reliable packet is delivered
    ///
    /// Returns `Ok(false)` if the engine refused the packet.
    pub fn send(
        &self,
        data: &[u8],
        params: PacketParams,
        on_ack: Option<AckCallback>,
    ) -> Result<bool, SendError> {
        let packed = self.path.prepare(data, params)?;
        Ok(self.path.deliver(self.peer, &packed, params, on_ack))
    }

    fn stats(&self) -> Option<LinkStats> {
        self.path.sink().stats(self.peer)
    }

    /// Round trip time in milliseconds, `u32::MAX` when unavailable
    pub fn rtt(&self) -> u32 {
        self.stats().map_or(u32::MAX, |s| s.rtt_ms)
    }

    pub fn packet_loss(&self) -> f32 {
        match self.stats() {
            Some(s) => self.loss.sample(s.packets_sent, s.packets_lost),
            None => self.loss.value(),
        }
    }

    pub fn token(&self) -> &Token {
        &self.token
    }

    pub fn set_token(&mut self, token: Token) {
        self.token = token;
    }

    /// Whether the application admitted this peer
    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    pub fn set_is_valid(&mut self, is_valid: bool) {
        self.is_valid = is_valid;
    }

    pub fn team_id(&self) -> u8 {
        self.team_id
    }

    pub fn set_team_id(&mut self, team_id: u8) {
        self.team_id = team_id;
    }

    /// Remember the current RTT for a later [`Self::rtt_is_better`]
    pub fn save_rtt(&mut self) {
        self.saved_rtt = Some(self.rtt());
    }

    /// Whether the RTT dropped since the last [`Self::save_rtt`]
    pub fn rtt_is_better(&self) -> bool {
        match self.saved_rtt {
            Some(saved) => self.rtt() < saved,
            None => true,
        }
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("peer", &self.peer)
            .field("token", &self.token)
            .field("is_valid", &self.is_valid)
            .field("team_id", &self.team_id)
            .finish()
    }
}
