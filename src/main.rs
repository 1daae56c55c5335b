use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rustc_hash::FxHashMap;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use netcore::config::NetConfig;
use netcore::input::packet::decode_input_burst;
use netcore::input::NetworkInputComponent;
use netcore::metrics::Metrics;
use netcore::net::engine::{EngineRuntime, QuicServerEngine};
use netcore::net::tls::TlsConfig;
use netcore::net::{
    pump, Channel, ConnectionStorage, NetServer, PacketParams, PeerState, Server, Token,
};
use netcore::util::wrapping::FrameId;

fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("netcore server v{}", env!("CARGO_PKG_VERSION"));

    let config = NetConfig::load_or_default();
    config.validate()?;
    info!(
        "Configuration loaded: {}:{}, max_clients={}, tick_rate={}",
        config.bind_address, config.port, config.max_clients, config.tick_rate
    );

    let runtime = EngineRuntime::acquire()?;
    let metrics = Arc::new(Metrics::new());

    #[cfg(feature = "metrics_http")]
    {
        let metrics = metrics.clone();
        let port = config.metrics_port;
        runtime.handle().spawn(async move {
            if let Err(e) = netcore::metrics::start_metrics_server(metrics, port).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        runtime.handle().spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
            }
            shutdown.store(true, Ordering::Release);
        });
    }

    let tls = runtime.handle().block_on(TlsConfig::load(
        config.tls_cert_path.as_deref(),
        config.tls_key_path.as_deref(),
    ))?;
    let engine = QuicServerEngine::bind(
        SocketAddr::new(config.bind_address, config.port),
        tls,
        config.mtu,
        config.max_clients,
    )?;
    info!("Server ready on https://{}:{}", config.bind_address, engine.port());
    info!("Certificate hash: {}", engine.cert_hash());

    let mut server = NetServer::with_metrics(engine, config.traffic_window_secs as usize, metrics.clone());
    let storage = ConnectionStorage::shared();
    server.set_storage(storage.clone())?;

    let mut inputs: FxHashMap<Token, NetworkInputComponent> = FxHashMap::default();
    let mut frame: FrameId = 0;
    let tick = config.tick_interval();
    let mut next_tick = Instant::now() + tick;
    let mut last_traffic_log = Instant::now();

    while !shutdown.load(Ordering::Acquire) {
        let tick_start = Instant::now();
        storage.lock().begin_tick();

        pump(|timeout| server.update(timeout), config.update_budget());
        admit_pending(&mut server);

        {
            let storage = storage.lock();
            for token in storage.just_disconnected_tokens() {
                info!("Player {} left", token);
                inputs.remove(token);
            }
            for token in storage.just_connected_tokens() {
                info!("Player {} joined", token);
                inputs.insert(token.clone(), NetworkInputComponent::default());
            }
            for packet in storage.recv_packets(Channel::Input) {
                let Some(component) = inputs.get_mut(&packet.token) else {
                    continue;
                };
                match decode_input_burst(&packet.data) {
                    Ok(burst) => {
                        let mut fresh = 0;
                        for (input_frame, snapshot) in burst.frames() {
                            if component.push_input(input_frame, *snapshot) {
                                fresh += 1;
                            }
                        }
                        debug!("{} new input frames from {}", fresh, packet.token);
                    }
                    Err(e) => warn!("Bad input burst from {}: {}", packet.token, e),
                }
            }
        }

        if let Err(e) = server.broadcast(&frame.to_le_bytes(), PacketParams::unreliable(Channel::Time)) {
            error!("Time broadcast rejected: {}", e);
        }
        frame = frame.wrapping_add(1);
        metrics.record_tick_time(tick_start.elapsed());

        if let Some(interval) = config.traffic_log_interval() {
            if last_traffic_log.elapsed() >= interval {
                last_traffic_log = Instant::now();
                server.log_traffic();
                metrics.publish_traffic(server.traffic_report());
            }
        }

        let now = Instant::now();
        if next_tick > now {
            std::thread::sleep(next_tick - now);
            next_tick += tick;
        } else {
            next_tick = now + tick;
        }
    }

    info!("Shutting down...");
    drop(server);
    info!("Server stopped");
    Ok(())
}

/// The demo has no session service, so every presented token is admitted
fn admit_pending(server: &mut NetServer<QuicServerEngine>) {
    let pending: Vec<Token> = server
        .responders()
        .filter(|r| r.state() == PeerState::PendingValidation)
        .map(|r| r.token().clone())
        .collect();
    for token in pending {
        if let Err(e) = server.set_valid_token(&token) {
            warn!("Could not admit {}: {}", token, e);
        }
    }
}
