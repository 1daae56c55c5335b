use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;

use crate::net::channel::{DEFAULT_MTU, MAX_PACKET_SIZE};

/// Smallest MTU a datagram header plus a compressed heartbeat fits in
const MIN_MTU: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Port cannot be 0")]
    ZeroPort,
    #[error("max_clients must be at least 1")]
    NoClients,
    #[error("tick_rate must be 1-1000, got {0}")]
    TickRate(u32),
    #[error("mtu must be {min}-{max}, got {0}", min = MIN_MTU, max = MAX_PACKET_SIZE)]
    Mtu(usize),
    #[error("update budget of {0:?} does not fit in a tick of {1:?}")]
    UpdateBudget(Duration, Duration),
    #[error("Metrics port {0} collides with the game port")]
    MetricsPort(u16),
}

/// Transport configuration
#[derive(Debug, Clone, PartialEq)]
pub struct NetConfig {
    /// Address to bind the server to
    pub bind_address: IpAddr,
    /// Port to listen on
    pub port: u16,
    /// Maximum number of concurrently connected peers
    pub max_clients: usize,
    /// Server ticks per second
    pub tick_rate: u32,
    /// Wall-clock time spent pumping transport events per tick
    pub update_budget_ms: u64,
    /// Client reconnection attempts; negative retries forever
    pub connect_attempts: i32,
    /// Client keepalive interval; 0 disables it
    pub heartbeat_interval_ms: u64,
    /// Ceiling for compressed unreliable packets
    pub mtu: usize,
    /// Seconds of per-channel traffic kept for statistics
    pub traffic_window_secs: u64,
    /// How often the traffic summary is logged; 0 disables it
    pub traffic_log_interval_secs: u64,
    pub metrics_port: u16,
    /// Path to TLS certificate file (if not using self-signed)
    pub tls_cert_path: Option<String>,
    /// Path to TLS key file (if not using self-signed)
    pub tls_key_path: Option<String>,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: 9000,
            max_clients: 100,
            tick_rate: 60,
            update_budget_ms: 4,
            connect_attempts: -1,
            heartbeat_interval_ms: 1000,
            mtu: DEFAULT_MTU,
            traffic_window_secs: 60,
            traffic_log_interval_secs: 10,
            metrics_port: 9090,
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

/// Overwrite `target` with the parsed value of `var`, if set and accepted
fn read_env<T: FromStr>(var: &str, target: &mut T, accept: impl Fn(&T) -> bool) {
    let Ok(raw) = std::env::var(var) else {
        return;
    };
    match raw.parse::<T>() {
        Ok(parsed) if accept(&parsed) => *target = parsed,
        Ok(_) => tracing::warn!("{} '{}' out of range, using default", var, raw),
        Err(_) => tracing::warn!("Invalid {} '{}', using default", var, raw),
    }
}

impl NetConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        read_env("BIND_ADDRESS", &mut config.bind_address, |_| true);
        read_env("PORT", &mut config.port, |p| *p > 0);
        read_env("MAX_CLIENTS", &mut config.max_clients, |n| (1..=10_000).contains(n));
        read_env("TICK_RATE", &mut config.tick_rate, |n| (1..=1000).contains(n));
        read_env("UPDATE_BUDGET_MS", &mut config.update_budget_ms, |_| true);
        read_env("CONNECT_ATTEMPTS", &mut config.connect_attempts, |_| true);
        read_env("HEARTBEAT_INTERVAL_MS", &mut config.heartbeat_interval_ms, |_| true);
        read_env("MTU", &mut config.mtu, |m| (MIN_MTU..=MAX_PACKET_SIZE).contains(m));
        read_env("TRAFFIC_WINDOW_SECS", &mut config.traffic_window_secs, |n| *n > 0);
        read_env("TRAFFIC_LOG_INTERVAL_SECS", &mut config.traffic_log_interval_secs, |_| true);
        read_env("METRICS_PORT", &mut config.metrics_port, |p| *p > 0);

        if let Ok(cert_path) = std::env::var("TLS_CERT_PATH") {
            config.tls_cert_path = Some(cert_path);
        }
        if let Ok(key_path) = std::env::var("TLS_KEY_PATH") {
            config.tls_key_path = Some(key_path);
        }

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::ZeroPort);
        }
        if self.max_clients == 0 {
            return Err(ConfigError::NoClients);
        }
        if !(1..=1000).contains(&self.tick_rate) {
            return Err(ConfigError::TickRate(self.tick_rate));
        }
        if !(MIN_MTU..=MAX_PACKET_SIZE).contains(&self.mtu) {
            return Err(ConfigError::Mtu(self.mtu));
        }
        if self.update_budget() >= self.tick_interval() {
            return Err(ConfigError::UpdateBudget(self.update_budget(), self.tick_interval()));
        }
        if self.metrics_port == self.port {
            return Err(ConfigError::MetricsPort(self.metrics_port));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(1) / self.tick_rate.max(1)
    }

    pub fn update_budget(&self) -> Duration {
        Duration::from_millis(self.update_budget_ms)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }

    pub fn traffic_log_interval(&self) -> Option<Duration> {
        (self.traffic_log_interval_secs > 0).then(|| Duration::from_secs(self.traffic_log_interval_secs))
    }
}
