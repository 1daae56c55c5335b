//! Inert client and server for bots and tests
//!
//! Sends go nowhere and getters return fixed values.

use std::sync::Arc;

use crate::net::channel::{Channel, PacketParams, SendFlags, DEFAULT_MTU};
use crate::net::engine::{EngineError, LinkStats, PacketSink, PeerId};
use crate::net::responder::Responder;
use crate::net::storage::SharedStorage;
use crate::net::token::Token;
use crate::net::transport::{
    Client, ClientConnectCb, ClientDisconnectCb, ClientErrorCb, ClientReceiveCb, SendError,
    SendPath, Server, ServerConnectCb, ServerDisconnectCb, ServerError, ServerErrorCb,
    ServerReceiveCb, ServerSyncCallback, ServerTokenConfirmationCb,
};

/// Sink that accepts and discards everything
#[derive(Debug, Default)]
pub struct NullSink;

impl PacketSink for NullSink {
    fn send(&self, _: PeerId, _: u8, _: &[u8], _: SendFlags, _: Option<u64>) -> Result<(), EngineError> {
        Ok(())
    }

    fn disconnect(&self, _: PeerId) {}

    fn stats(&self, _: PeerId) -> Option<LinkStats> {
        None
    }

    fn mtu(&self) -> usize {
        DEFAULT_MTU
    }
}

/// Responder not backed by any link, e.g. for a bot owned by the server
pub fn stand_in_responder(peer: PeerId, token: Token) -> Responder {
    let mut responder = Responder::new(peer, Arc::new(SendPath::new(Arc::new(NullSink), 1)));
    responder.set_token(token);
    responder.set_is_valid(true);
    responder
}

/// Client that is always connected and never receives anything
#[derive(Debug, Default)]
pub struct NullClient {
    token: Token,
}

impl NullClient {
    pub fn new(token: Token) -> Self {
        Self { token }
    }
}

impl Client for NullClient {
    fn update(&mut self, _timeout_ms: u32) -> bool {
        false
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn send(&self, _data: &[u8], _params: PacketParams) -> Result<bool, SendError> {
        Ok(true)
    }

    fn subscribe_on_connect(&mut self, _callback: ClientConnectCb) {}
    fn subscribe_on_disconnect(&mut self, _callback: ClientDisconnectCb) {}
    fn subscribe_on_error(&mut self, _callback: ClientErrorCb) {}
    fn subscribe_on_receive(&mut self, _channel: Channel, _callback: ClientReceiveCb) {}

    fn auth_token(&self) -> &Token {
        &self.token
    }

    fn ping(&self) -> u32 {
        0
    }

    fn packet_loss(&self) -> f32 {
        0.0
    }
}

/// Server without peers
#[derive(Debug, Default)]
pub struct NullServer;

impl Server for NullServer {
    fn update(&mut self, _timeout_ms: u32) -> bool {
        false
    }

    fn broadcast(&self, _data: &[u8], _params: PacketParams) -> Result<(), SendError> {
        Ok(())
    }

    fn foreach_responder(&self, _f: &mut dyn FnMut(&Responder)) {}

    fn max_rtt(&self) -> u32 {
        0
    }

    fn responder(&self, _token: &Token) -> Option<&Responder> {
        None
    }

    fn has_responder(&self, _token: &Token) -> bool {
        false
    }

    fn set_valid_token(&mut self, _token: &Token) -> Result<(), ServerError> {
        Ok(())
    }

    fn disconnect(&mut self, _token: &Token) -> Result<(), ServerError> {
        Ok(())
    }

    fn subscribe_on_connect(&mut self, _callback: ServerConnectCb) {}
    fn subscribe_on_error(&mut self, _callback: ServerErrorCb) {}
    fn subscribe_on_receive(&mut self, _channel: Channel, _callback: ServerReceiveCb) {}
    fn subscribe_on_token_confirmation(&mut self, _callback: ServerTokenConfirmationCb) {}
    fn subscribe_on_disconnect(&mut self, _callback: ServerDisconnectCb) {}

    fn set_storage(&mut self, _storage: SharedStorage) -> Result<(), ServerError> {
        Ok(())
    }

    fn set_sync_callback(&mut self, _callback: Box<dyn ServerSyncCallback>) -> Result<(), ServerError> {
        Ok(())
    }
}
