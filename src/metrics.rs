//! Prometheus-compatible metrics endpoint
//!
//! Exposes transport counters in Prometheus format.
//! Default endpoint: http://localhost:9090/metrics

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::net::traffic::TrafficReport;

const TICK_HISTORY: usize = 1000;

/// Metrics registry of one server or client process
#[derive(Debug)]
pub struct Metrics {
    // Peers
    pub connections_active: AtomicU64,
    pub peers_validated: AtomicU64,

    // Wire counters (compressed sizes)
    pub packets_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,

    // Dropped inbound packets
    pub decompression_failures: AtomicU64,
    pub unknown_peer_packets: AtomicU64,

    // Tick timing (microseconds)
    pub tick_time_us: AtomicU64,
    pub tick_time_p95_us: AtomicU64,
    pub tick_time_p99_us: AtomicU64,
    pub tick_time_max_us: AtomicU64,
    pub tick_count: AtomicU64,

    start_time: Instant,

    // Rolling tick times for percentile calculation
    tick_history: RwLock<VecDeque<u64>>,

    // Last published traffic report
    traffic: RwLock<TrafficReport>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_active: AtomicU64::new(0),
            peers_validated: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            decompression_failures: AtomicU64::new(0),
            unknown_peer_packets: AtomicU64::new(0),
            tick_time_us: AtomicU64::new(0),
            tick_time_p95_us: AtomicU64::new(0),
            tick_time_p99_us: AtomicU64::new(0),
            tick_time_max_us: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            start_time: Instant::now(),
            tick_history: RwLock::new(VecDeque::with_capacity(TICK_HISTORY)),
            traffic: RwLock::new(TrafficReport::default()),
        }
    }

    pub fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Decrement a gauge without wrapping below zero
    pub fn gauge_dec(gauge: &AtomicU64) {
        let _ = gauge.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    /// Record a tick time and update percentiles
    pub fn record_tick_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.tick_time_us.store(us, Ordering::Relaxed);
        self.tick_count.fetch_add(1, Ordering::Relaxed);

        let mut history = self.tick_history.write();
        history.push_back(us);
        while history.len() > TICK_HISTORY {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();

            let p95_idx = (sorted.len() as f32 * 0.95) as usize;
            let p99_idx = (sorted.len() as f32 * 0.99) as usize;

            self.tick_time_p95_us.store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_p99_us.store(sorted[p99_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_max_us.store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    /// Replace the exported per-channel traffic statistics
    pub fn publish_traffic(&self, report: TrafficReport) {
        *self.traffic.write() = report;
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                let _ = write!(
                    output,
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                );
            };
        }

        metric!("netcore_connections_active", "Transport-connected peers", "gauge",
            self.connections_active.load(Ordering::Relaxed));
        metric!("netcore_peers_validated", "Peers with a confirmed token", "gauge",
            self.peers_validated.load(Ordering::Relaxed));

        metric!("netcore_packets_sent_total", "Packets handed to the engine", "counter",
            self.packets_sent.load(Ordering::Relaxed));
        metric!("netcore_packets_received_total", "Packets received from the engine", "counter",
            self.packets_received.load(Ordering::Relaxed));
        metric!("netcore_bytes_sent_total", "Compressed bytes sent", "counter",
            self.bytes_sent.load(Ordering::Relaxed));
        metric!("netcore_bytes_received_total", "Compressed bytes received", "counter",
            self.bytes_received.load(Ordering::Relaxed));
        metric!("netcore_decompression_failures_total", "Inbound packets dropped as corrupt", "counter",
            self.decompression_failures.load(Ordering::Relaxed));
        metric!("netcore_unknown_peer_packets_total", "Inbound packets from unknown peers", "counter",
            self.unknown_peer_packets.load(Ordering::Relaxed));

        metric!("netcore_tick_time_microseconds", "Current tick time in microseconds", "gauge",
            self.tick_time_us.load(Ordering::Relaxed));
        metric!("netcore_tick_time_p95_microseconds", "95th percentile tick time", "gauge",
            self.tick_time_p95_us.load(Ordering::Relaxed));
        metric!("netcore_tick_time_p99_microseconds", "99th percentile tick time", "gauge",
            self.tick_time_p99_us.load(Ordering::Relaxed));
        metric!("netcore_tick_time_max_microseconds", "Maximum tick time", "gauge",
            self.tick_time_max_us.load(Ordering::Relaxed));
        metric!("netcore_tick_count", "Total ticks processed", "counter",
            self.tick_count.load(Ordering::Relaxed));
        metric!("netcore_uptime_seconds", "Uptime in seconds", "counter",
            self.uptime_seconds());

        let traffic = self.traffic.read();
        if !traffic.channels.is_empty() {
            output.push_str("# HELP netcore_channel_bytes_per_second Per-channel wire rate over the traffic window\n");
            output.push_str("# TYPE netcore_channel_bytes_per_second gauge\n");
            for entry in &traffic.channels {
                let rates = entry.bytes_per_sec;
                for (stat, value) in [
                    ("avg", rates.avg),
                    ("p50", rates.p50 as f64),
                    ("p95", rates.p95 as f64),
                    ("p99", rates.p99 as f64),
                    ("max", rates.max as f64),
                ] {
                    let _ = writeln!(
                        output,
                        "netcore_channel_bytes_per_second{{channel=\"{}\",direction=\"{}\",stat=\"{}\"}} {}",
                        entry.channel,
                        entry.direction.as_str(),
                        stat,
                        value
                    );
                }
            }
        }

        output
    }

    /// Generate JSON format metrics
    pub fn to_json(&self) -> String {
        json!({
            "peers": {
                "connected": self.connections_active.load(Ordering::Relaxed),
                "validated": self.peers_validated.load(Ordering::Relaxed),
            },
            "network": {
                "packets_sent": self.packets_sent.load(Ordering::Relaxed),
                "packets_received": self.packets_received.load(Ordering::Relaxed),
                "bytes_sent": self.bytes_sent.load(Ordering::Relaxed),
                "bytes_received": self.bytes_received.load(Ordering::Relaxed),
                "decompression_failures": self.decompression_failures.load(Ordering::Relaxed),
                "unknown_peer_packets": self.unknown_peer_packets.load(Ordering::Relaxed),
            },
            "performance": {
                "tick_time_us": self.tick_time_us.load(Ordering::Relaxed),
                "tick_time_p95_us": self.tick_time_p95_us.load(Ordering::Relaxed),
                "tick_time_p99_us": self.tick_time_p99_us.load(Ordering::Relaxed),
                "tick_time_max_us": self.tick_time_max_us.load(Ordering::Relaxed),
                "tick_count": self.tick_count.load(Ordering::Relaxed),
            },
            "traffic": &*self.traffic.read(),
            "uptime_seconds": self.uptime_seconds(),
        })
        .to_string()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(metrics: Arc<Metrics>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);
                    let response = respond(&metrics, &request);
                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read from metrics socket {}: {}", peer, e);
                }
            }
        });
    }
}

fn respond(metrics: &Metrics, request: &str) -> String {
    let (content_type, body) = if request.starts_with("GET /metrics/json") {
        ("application/json", metrics.to_json())
    } else if request.starts_with("GET /metrics") {
        ("text/plain; version=0.0.4", metrics.to_prometheus())
    } else if request.starts_with("GET /health") {
        ("text/plain", "OK".to_string())
    } else {
        return "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string();
    };
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        content_type,
        body.len(),
        body
    )
}
