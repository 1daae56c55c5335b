//! Client side of the transport
//!
//! On every transport connect the client presents its token on the TOKEN
//! channel. Lost connections are retried while reconnection attempts
//! remain; a negative attempt count retries forever.

use std::array;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use crate::config::NetConfig;
use crate::metrics::Metrics;
use crate::net::channel::{Channel, PacketParams, CHANNEL_COUNT};
use crate::net::compression::decompress;
use crate::net::engine::{Connector, EngineError, EngineEvent};
use crate::net::storage::SharedStorage;
use crate::net::token::Token;
use crate::net::traffic::TrafficReport;
use crate::net::transport::{
    Client, ClientConnectCb, ClientDisconnectCb, ClientErrorCb, ClientReceiveCb, LossEstimator,
    NetError, SendError, SendPath,
};

/// Keepalive payload sent on the SERVICE channel
pub const HEARTBEAT_CODE: u16 = 0x4842;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub struct NetClient<E> {
    engine: E,
    path: SendPath,
    token: Token,
    connected: bool,
    /// Reconnections left; negative means unlimited
    conn_attempts: i32,
    heartbeat_interval: Option<Duration>,
    last_heartbeat: Instant,
    loss: LossEstimator,
    storage: Option<SharedStorage>,
    on_connect: Vec<ClientConnectCb>,
    on_disconnect: Vec<ClientDisconnectCb>,
    on_error: Vec<ClientErrorCb>,
    on_receive: [Vec<ClientReceiveCb>; CHANNEL_COUNT],
}

impl<E: Connector> NetClient<E> {
    pub fn new(engine: E, token: Token, conn_attempts: i32) -> Self {
        Self::build(engine, token, conn_attempts, 60)
    }

    /// Client with attempts, heartbeat and traffic window taken from `config`
    pub fn from_config(engine: E, token: Token, config: &NetConfig) -> Self {
        let mut client = Self::build(
            engine,
            token,
            config.connect_attempts,
            config.traffic_window_secs as usize,
        );
        client.heartbeat_interval = config.heartbeat_interval();
        client
    }

    fn build(engine: E, token: Token, conn_attempts: i32, traffic_window_secs: usize) -> Self {
        let path = SendPath::new(engine.sink(), traffic_window_secs);
        Self {
            engine,
            path,
            token,
            connected: false,
            conn_attempts,
            heartbeat_interval: None,
            last_heartbeat: Instant::now(),
            loss: LossEstimator::default(),
            storage: None,
            on_connect: Vec::new(),
            on_disconnect: Vec::new(),
            on_error: Vec::new(),
            on_receive: array::from_fn(|_| Vec::new()),
        }
    }

    /// Send a heartbeat every `interval` while connected; zero disables it
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = (!interval.is_zero()).then_some(interval);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.path = self.path.with_metrics(metrics);
        self
    }

    /// Mirror the own token and received packets into `storage`
    pub fn with_storage(mut self, storage: SharedStorage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Start connecting; completion is reported through `update`
    pub fn connect(&mut self) -> Result<(), ClientError> {
        info!("Connecting");
        self.engine.connect()?;
        Ok(())
    }

    pub fn remaining_attempts(&self) -> i32 {
        self.conn_attempts
    }

    pub fn engine(&self) -> &E {
        &self.engine
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

    fn reconnect(&mut self) {
        if self.conn_attempts == 0 {
            warn!("Reconnection attempts exhausted");
            self.notify_error(NetError::NotConnected);
            return;
        }
        if self.conn_attempts > 0 {
            self.conn_attempts -= 1;
        }
        debug!("Reconnecting, {} attempts left", self.conn_attempts);
        if let Err(e) = self.engine.connect() {
            error!("Reconnect failed: {}", e);
            self.notify_error(NetError::LoopError);
        }
    }

    fn send_heartbeat_if_due(&mut self) {
        let Some(interval) = self.heartbeat_interval else {
            return;
        };
        if !self.connected || self.last_heartbeat.elapsed() < interval {
            return;
        }
        self.last_heartbeat = Instant::now();
        match self.send(&HEARTBEAT_CODE.to_le_bytes(), PacketParams::unreliable(Channel::Service)) {
            Ok(true) => trace!("Heartbeat sent"),
            Ok(false) => debug!("Heartbeat not sent"),
            Err(e) => warn!("Heartbeat rejected: {}", e),
        }
    }

    fn handle_connect(&mut self) {
        if self.connected {
            return;
        }
        self.connected = true;
        self.last_heartbeat = Instant::now();
        info!("Connected");

        if !self.token.is_empty() {
            let params = PacketParams::reliable(Channel::Token);
            match self.send(self.token.as_bytes(), params) {
                Ok(true) => debug!("Token sent"),
                Ok(false) => warn!("Token could not be sent"),
                Err(e) => error!("Token rejected: {}", e),
            }
            if let Some(storage) = &self.storage {
                let mut storage = storage.lock();
                storage.add_connected_token(&self.token);
                storage.confirm_token(&self.token);
            }
        }
        for callback in &mut self.on_connect {
            callback();
        }
    }

    fn handle_disconnect(&mut self) {
        if self.connected {
            self.connected = false;
            info!("Disconnected");
            if let Some(storage) = &self.storage {
                storage.lock().remove_connected_token(&self.token);
            }
            for callback in &mut self.on_disconnect {
                callback();
            }
        } else {
            debug!("Connection attempt failed");
        }
        self.reconnect();
    }

    fn handle_receive(&mut self, channel_id: u8, wire: Vec<u8>) {
        let Some(channel) = Channel::from_id(channel_id) else {
            warn!("Packet on unknown channel {}", channel_id);
            return;
        };
        self.path.record_inbound(channel, wire.len());

        let data = match decompress(&wire) {
            Ok(data) => data,
            Err(e) => {
                warn!("Dropping packet on {}: {}", channel, e);
                if let Some(metrics) = self.path.metrics() {
                    metrics
                        .decompression_failures
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
                return;
            }
        };
        if let Some(storage) = &self.storage {
            storage
                .lock()
                .store_recv_packet(channel, &Token::empty(), &data);
        }
        for callback in &mut self.on_receive[channel.index()] {
            callback(&data);
        }
    }

    fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Connect { .. } => self.handle_connect(),
            EngineEvent::Disconnect { .. } => self.handle_disconnect(),
            EngineEvent::Receive { channel, data, .. } => self.handle_receive(channel, data),
            EngineEvent::Ack { ack_id, .. } => {
                if let Some(callback) = self.path.take_ack(ack_id) {
                    callback();
                }
            }
            EngineEvent::Error { message } => {
                error!("Transport error: {}", message);
                self.notify_error(NetError::LoopError);
            }
        }
    }
}

impl<E: Connector> Client for NetClient<E> {
    fn update(&mut self, timeout_ms: u32) -> bool {
        self.send_heartbeat_if_due();
        match self.engine.poll(Duration::from_millis(u64::from(timeout_ms))) {
            Ok(Some(event)) => {
                self.handle_event(event);
                true
            }
            Ok(None) => false,
            Err(e) => {
                error!("Client engine failed: {}", e);
                self.notify_error(NetError::LoopError);
                false
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn send(&self, data: &[u8], params: PacketParams) -> Result<bool, SendError> {
        let packed = self.path.prepare(data, params)?;
        if !self.connected {
            return Ok(false);
        }
        Ok(self.path.deliver(self.engine.server_peer(), &packed, params, None))
    }

    fn subscribe_on_connect(&mut self, callback: ClientConnectCb) {
        self.on_connect.push(callback);
    }

    fn subscribe_on_disconnect(&mut self, callback: ClientDisconnectCb) {
        self.on_disconnect.push(callback);
    }

    fn subscribe_on_error(&mut self, callback: ClientErrorCb) {
        self.on_error.push(callback);
    }

    fn subscribe_on_receive(&mut self, channel: Channel, callback: ClientReceiveCb) {
        self.on_receive[channel.index()].push(callback);
    }

    fn auth_token(&self) -> &Token {
        &self.token
    }

    fn ping(&self) -> u32 {
        if !self.connected {
            return u32::MAX;
        }
        self.path
            .sink()
            .stats(self.engine.server_peer())
            .map_or(u32::MAX, |s| s.rtt_ms)
    }

    fn packet_loss(&self) -> f32 {
        match self.path.sink().stats(self.engine.server_peer()) {
            Some(s) => self.loss.sample(s.packets_sent, s.packets_lost),
            None => self.loss.value(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::engine::{
        LoopbackClientEngine, LoopbackConfig, LoopbackHub, LoopbackServerEngine, TransportEngine,
    };
    use crate::net::storage::ConnectionStorage;
    use crate::net::transport::pump;
    use parking_lot::Mutex;

    fn drain(server: &mut LoopbackServerEngine) -> Vec<EngineEvent> {
        let mut out = Vec::new();
        while let Ok(Some(event)) = server.poll(Duration::ZERO) {
            out.push(event);
        }
        out
    }

    fn token_packets(events: &[EngineEvent]) -> Vec<Vec<u8>> {
        events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::Receive { channel, data, .. } if *channel == Channel::Token.id() => {
                    decompress(data).ok()
                }
                _ => None,
            })
            .collect()
    }

    fn run(client: &mut NetClient<LoopbackClientEngine>) -> usize {
        pump(|t| client.update(t), Duration::from_secs(1))
    }

    #[test]
    fn test_token_sent_on_connect() {
        let hub = LoopbackHub::default();
        let mut server = hub.server();
        let token = Token::from_str_padded("client-token");
        let mut client = NetClient::new(hub.client(), token.clone(), -1);

        assert!(!client.is_connected());
        client.connect().unwrap();
        run(&mut client);
        assert!(client.is_connected());

        let events = drain(&mut server);
        assert_eq!(token_packets(&events), vec![token.as_bytes().to_vec()]);
    }

    #[test]
    fn test_empty_token_not_sent() {
        let hub = LoopbackHub::default();
        let mut server = hub.server();
        let mut client = NetClient::new(hub.client(), Token::empty(), 0);
        client.connect().unwrap();
        run(&mut client);
        assert!(token_packets(&drain(&mut server)).is_empty());
    }

    #[test]
    fn test_send_while_disconnected() {
        let hub = LoopbackHub::default();
        let client = NetClient::new(hub.client(), Token::empty(), 0);
        assert_eq!(client.send(b"x", PacketParams::reliable(Channel::Default)), Ok(false));
        assert_eq!(client.ping(), u32::MAX);
        assert_eq!(client.packet_loss(), 0.0);
        assert!(client
            .send(&vec![0u8; 5000], PacketParams::reliable(Channel::Default))
            .is_err());
    }

    #[test]
    fn test_reconnects_and_resends_token() {
        let hub = LoopbackHub::default();
        let mut server = hub.server();
        let token = Token::from_str_padded("again");
        let mut client = NetClient::new(hub.client(), token.clone(), -1);

        let connects = Arc::new(Mutex::new(0));
        let disconnects = Arc::new(Mutex::new(0));
        let c = connects.clone();
        client.subscribe_on_connect(Box::new(move || *c.lock() += 1));
        let d = disconnects.clone();
        client.subscribe_on_disconnect(Box::new(move || *d.lock() += 1));

        client.connect().unwrap();
        run(&mut client);
        hub.sever(client.engine().peer_id());
        run(&mut client);

        assert!(client.is_connected());
        assert_eq!(*connects.lock(), 2);
        assert_eq!(*disconnects.lock(), 1);
        assert_eq!(token_packets(&drain(&mut server)).len(), 2);
        assert_eq!(client.remaining_attempts(), -1);
    }

    #[test]
    fn test_attempts_exhausted() {
        let hub = LoopbackHub::default();
        hub.set_accepting(false);
        let mut client = NetClient::new(hub.client(), Token::from_str_padded("late"), 2);

        let errors = Arc::new(Mutex::new(Vec::new()));
        let e = errors.clone();
        client.subscribe_on_error(Box::new(move |err: NetError| e.lock().push(err)));

        client.connect().unwrap();
        run(&mut client);

        assert!(!client.is_connected());
        assert_eq!(client.remaining_attempts(), 0);
        assert_eq!(errors.lock().as_slice(), &[NetError::NotConnected]);
    }

    #[test]
    fn test_receive_dispatch_and_storage() {
        let hub = LoopbackHub::default();
        let server = hub.server();
        let storage = ConnectionStorage::shared();
        let token = Token::from_str_padded("mirror");
        let mut client = NetClient::new(hub.client(), token.clone(), 0).with_storage(storage.clone());

        let got = Arc::new(Mutex::new(Vec::new()));
        let g = got.clone();
        client.subscribe_on_receive(Channel::Time, Box::new(move |data: &[u8]| g.lock().push(data.to_vec())));

        client.connect().unwrap();
        run(&mut client);
        assert!(storage.lock().is_connected(&token));

        let packed = crate::net::compression::compress(b"now");
        server
            .sink()
            .send(
                client.engine().peer_id(),
                Channel::Time.id(),
                &packed,
                PacketParams::unreliable(Channel::Time).flags(),
                None,
            )
            .unwrap();
        run(&mut client);

        assert_eq!(got.lock().as_slice(), &[b"now".to_vec()]);
        let storage = storage.lock();
        assert_eq!(storage.recv_packets(Channel::Time).len(), 1);
        assert!(storage.recv_packets(Channel::Time)[0].token.is_empty());
    }

    #[test]
    fn test_heartbeat_while_connected() {
        let hub = LoopbackHub::default();
        let mut server = hub.server();
        let mut client =
            NetClient::new(hub.client(), Token::empty(), 0).with_heartbeat(Duration::from_millis(1));
        client.connect().unwrap();
        run(&mut client);

        std::thread::sleep(Duration::from_millis(5));
        client.update(0);

        let heartbeats = drain(&mut server)
            .into_iter()
            .filter(|e| matches!(e, EngineEvent::Receive { channel, .. } if *channel == Channel::Service.id()))
            .count();
        assert!(heartbeats >= 1);
    }

    #[test]
    fn test_ping_and_loss_when_connected() {
        let hub = LoopbackHub::new(LoopbackConfig {
            rtt_ms: 25,
            drop_every: 4,
            ..LoopbackConfig::default()
        });
        let _server = hub.server();
        let mut client = NetClient::new(hub.client(), Token::empty(), 0);
        client.connect().unwrap();
        run(&mut client);
        assert_eq!(client.ping(), 25);

        for _ in 0..8 {
            client
                .send(b"input", PacketParams::unreliable(Channel::Input))
                .unwrap();
        }
        let loss = client.packet_loss();
        assert!(loss > 0.0 && loss < 0.25);
    }
}
