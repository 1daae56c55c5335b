//! Client/server sessions over the in-process loopback engine

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use netcore::net::engine::{LoopbackConfig, LoopbackHub, LoopbackServerEngine};
use netcore::net::{
    Channel, Client, ConnectionStorage, NetClient, NetError, NetServer, PacketParams, PeerState,
    Responder, Server, Token,
};

/// Run both sides until neither has anything left to process
fn settle(server: &mut NetServer<LoopbackServerEngine>, clients: &mut [&mut dyn Client]) {
    for _ in 0..256 {
        let mut busy = server.update(0);
        for client in clients.iter_mut() {
            busy |= client.update(0);
        }
        if !busy {
            return;
        }
    }
    panic!("loopback session did not settle");
}

#[test]
fn test_token_handshake_end_to_end() {
    let hub = LoopbackHub::default();
    let mut server = NetServer::new(hub.server(), 60);
    let storage = ConnectionStorage::shared();
    server.set_storage(storage.clone()).unwrap();

    let confirmed = Arc::new(AtomicUsize::new(0));
    {
        let confirmed = confirmed.clone();
        server.subscribe_on_token_confirmation(Box::new(move |_: &Responder| {
            confirmed.fetch_add(1, Ordering::SeqCst);
        }));
    }

    let token = Token::from_str_padded("alice");
    let mut client = NetClient::new(hub.client(), token.clone(), 0);
    client.connect().unwrap();
    settle(&mut server, &mut [&mut client]);

    assert!(client.is_connected());
    assert!(server.has_responder(&token));
    assert_eq!(
        server.responder(&token).map(Responder::state),
        Some(PeerState::PendingValidation)
    );
    assert!(storage.lock().is_pending(&token));

    // Not validated yet, so broadcasts skip the peer
    let received = Arc::new(Mutex::new(Vec::new()));
    {
        let received = received.clone();
        client.subscribe_on_receive(
            Channel::Time,
            Box::new(move |data: &[u8]| received.lock().push(data.to_vec())),
        );
    }
    server.broadcast(&1u32.to_le_bytes(), PacketParams::unreliable(Channel::Time)).unwrap();
    settle(&mut server, &mut [&mut client]);
    assert!(received.lock().is_empty());

    server.set_valid_token(&token).unwrap();
    assert_eq!(confirmed.load(Ordering::SeqCst), 1);
    {
        let storage = storage.lock();
        assert!(storage.is_connected(&token));
        assert_eq!(storage.just_connected_tokens(), &[token.clone()]);
    }

    server.broadcast(&2u32.to_le_bytes(), PacketParams::unreliable(Channel::Time)).unwrap();
    settle(&mut server, &mut [&mut client]);
    assert_eq!(*received.lock(), vec![2u32.to_le_bytes().to_vec()]);

    storage.lock().begin_tick();
    assert_eq!(client.send(b"jump", PacketParams::reliable(Channel::Input)), Ok(true));
    settle(&mut server, &mut [&mut client]);
    let storage = storage.lock();
    let packets = storage.recv_packets(Channel::Input);
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].token, token);
    assert_eq!(packets[0].data, b"jump");
    assert!(storage.recv_packets(Channel::Token).is_empty());
}

#[test]
fn test_server_disconnect_clears_token() {
    let hub = LoopbackHub::default();
    let mut server = NetServer::new(hub.server(), 60);
    let storage = ConnectionStorage::shared();
    server.set_storage(storage.clone()).unwrap();

    let left = Arc::new(Mutex::new(Vec::new()));
    {
        let left = left.clone();
        server.subscribe_on_disconnect(Box::new(move |token: &Token| left.lock().push(token.clone())));
    }

    let token = Token::from_str_padded("bob");
    let mut client = NetClient::new(hub.client(), token.clone(), 0);
    let errors = Arc::new(Mutex::new(Vec::new()));
    {
        let errors = errors.clone();
        client.subscribe_on_error(Box::new(move |e: NetError| errors.lock().push(e)));
    }
    client.connect().unwrap();
    settle(&mut server, &mut [&mut client]);
    server.set_valid_token(&token).unwrap();
    storage.lock().begin_tick();

    server.disconnect(&token).unwrap();
    settle(&mut server, &mut [&mut client]);

    assert!(!client.is_connected());
    assert!(!server.has_responder(&token));
    assert_eq!(server.peer_count(), 0);
    assert_eq!(*left.lock(), vec![token.clone()]);
    assert_eq!(storage.lock().just_disconnected_tokens(), &[token.clone()]);
    // No reconnection attempts were configured
    assert_eq!(*errors.lock(), vec![NetError::NotConnected]);
    assert!(server.disconnect(&token).is_err());
}

#[test]
fn test_client_reconnects_while_attempts_remain() {
    let hub = LoopbackHub::default();
    let mut server = NetServer::new(hub.server(), 60);
    let token = Token::from_str_padded("carol");
    let client_engine = hub.client();
    let peer = client_engine.peer_id();
    let mut client = NetClient::new(client_engine, token.clone(), 2);

    let connects = Arc::new(AtomicUsize::new(0));
    {
        let connects = connects.clone();
        client.subscribe_on_connect(Box::new(move || {
            connects.fetch_add(1, Ordering::SeqCst);
        }));
    }
    client.connect().unwrap();
    settle(&mut server, &mut [&mut client]);
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    hub.sever(peer);
    settle(&mut server, &mut [&mut client]);

    assert!(client.is_connected());
    assert_eq!(connects.load(Ordering::SeqCst), 2);
    assert_eq!(client.remaining_attempts(), 1);
    // The token was presented again on the new link
    assert!(server.has_responder(&token));
}

#[test]
fn test_refused_connect_consumes_attempts() {
    let hub = LoopbackHub::default();
    hub.set_accepting(false);
    let mut server = NetServer::new(hub.server(), 60);
    let mut client = NetClient::new(hub.client(), Token::from_str_padded("dave"), 1);

    let errors = Arc::new(Mutex::new(Vec::new()));
    {
        let errors = errors.clone();
        client.subscribe_on_error(Box::new(move |e: NetError| errors.lock().push(e)));
    }
    client.connect().unwrap();
    settle(&mut server, &mut [&mut client]);

    assert!(!client.is_connected());
    assert_eq!(client.remaining_attempts(), 0);
    assert_eq!(*errors.lock(), vec![NetError::NotConnected]);
    assert_eq!(server.peer_count(), 0);
}

#[test]
fn test_token_moves_to_new_link() {
    let hub = LoopbackHub::default();
    let mut server = NetServer::new(hub.server(), 60);
    let token = Token::from_str_padded("erin");

    let mut first = NetClient::new(hub.client(), token.clone(), 0);
    first.connect().unwrap();
    settle(&mut server, &mut [&mut first]);
    server.set_valid_token(&token).unwrap();

    let second_engine = hub.client();
    let second_peer = second_engine.peer_id();
    let mut second = NetClient::new(second_engine, token.clone(), 0);
    second.connect().unwrap();
    settle(&mut server, &mut [&mut first, &mut second]);

    assert!(!first.is_connected());
    assert!(second.is_connected());
    let responder = server.responder(&token).unwrap();
    assert_eq!(responder.peer(), second_peer);
    assert!(!responder.is_valid());
    assert_eq!(server.peer_count(), 1);
}

#[test]
fn test_token_relinked_within_tick_keeps_player() {
    let hub = LoopbackHub::default();
    let mut server = NetServer::new(hub.server(), 60);
    let storage = ConnectionStorage::shared();
    server.set_storage(storage.clone()).unwrap();
    let token = Token::from_str_padded("heidi");

    let mut first = NetClient::new(hub.client(), token.clone(), 0);
    first.connect().unwrap();
    settle(&mut server, &mut [&mut first]);
    server.set_valid_token(&token).unwrap();
    storage.lock().begin_tick();

    let mut second = NetClient::new(hub.client(), token.clone(), 0);
    second.connect().unwrap();
    settle(&mut server, &mut [&mut first, &mut second]);
    server.set_valid_token(&token).unwrap();

    // A game loop handling leaves before joins ends up with the player present
    let mut players = std::collections::HashSet::new();
    players.insert(token.clone());
    let storage = storage.lock();
    for left in storage.just_disconnected_tokens() {
        players.remove(left);
    }
    for joined in storage.just_connected_tokens() {
        players.insert(joined.clone());
    }
    assert!(players.contains(&token));
    assert!(storage.just_disconnected_tokens().is_empty());
    assert_eq!(storage.just_connected_tokens(), &[token.clone()]);
    assert!(second.is_connected());
}

#[test]
fn test_ack_callback_and_rtt() {
    let hub = LoopbackHub::new(LoopbackConfig {
        rtt_ms: 25,
        ..LoopbackConfig::default()
    });
    let mut server = NetServer::new(hub.server(), 60);
    let token = Token::from_str_padded("frank");
    let mut client = NetClient::new(hub.client(), token.clone(), 0);
    client.connect().unwrap();
    settle(&mut server, &mut [&mut client]);
    assert_eq!(server.max_rtt(), 0);
    server.set_valid_token(&token).unwrap();

    let acked = Arc::new(AtomicUsize::new(0));
    {
        let acked = acked.clone();
        let responder = server.responder(&token).unwrap();
        let sent = responder
            .send(
                b"state",
                PacketParams::reliable(Channel::Default),
                Some(Box::new(move || {
                    acked.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
        assert!(sent);
    }
    settle(&mut server, &mut [&mut client]);

    assert_eq!(acked.load(Ordering::SeqCst), 1);
    assert_eq!(server.max_rtt(), 25);
    assert_eq!(client.ping(), 25);
}

#[test]
fn test_packet_loss_is_smoothed() {
    let hub = LoopbackHub::new(LoopbackConfig {
        drop_every: 2,
        ..LoopbackConfig::default()
    });
    let mut server = NetServer::new(hub.server(), 60);
    let token = Token::from_str_padded("grace");
    let mut client = NetClient::new(hub.client(), token.clone(), 0);
    client.connect().unwrap();
    settle(&mut server, &mut [&mut client]);
    server.set_valid_token(&token).unwrap();

    for frame in 0u32..10 {
        server.broadcast(&frame.to_le_bytes(), PacketParams::unreliable(Channel::Time)).unwrap();
    }
    settle(&mut server, &mut [&mut client]);

    let responder = server.responder(&token).unwrap();
    let first = responder.packet_loss();
    assert!((first - 0.5 * 0.008).abs() < 1e-6, "loss {}", first);
    let second = responder.packet_loss();
    assert!((second - (first * 0.992 + 0.5 * 0.008)).abs() < 1e-6, "loss {}", second);
}
