use crate::liveness::LivenessConfig;
use crate::ratelimit::RateLimitConfig;
use clap::{ArgAction, Parser};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Command line / environment configuration for the server binary.
#[derive(Debug, Clone, Parser)]
#[command(name = "peer-rendezvous", version, about = "Peer rendezvous and room coordination server")]
pub struct Config {
    /// Address to listen on
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Port to listen on
    #[arg(long, short, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// Liveness probe interval in milliseconds
    #[arg(long, env = "HEARTBEAT_INTERVAL_MS", default_value_t = 1000)]
    pub heartbeat_interval_ms: u64,

    /// Missed probe intervals before a peer is dropped
    #[arg(long, env = "HEARTBEAT_MISS_LIMIT", default_value_t = 5)]
    pub heartbeat_miss_limit: u32,

    /// Actions a peer may take per rate limit window
    #[arg(long, env = "RATE_LIMIT_ACTIONS", default_value_t = 10)]
    pub rate_limit_actions: usize,

    /// How long each action counts against the budget, in milliseconds
    #[arg(long, env = "RATE_LIMIT_WINDOW_MS", default_value_t = 10_000)]
    pub rate_limit_window_ms: u64,

    /// Take the client address from cf-connecting-ip / x-forwarded-for
    #[arg(long, env = "TRUST_PROXY_HEADERS", default_value_t = true, action = ArgAction::Set)]
    pub trust_proxy_headers: bool,

    /// tracing filter directive, e.g. `info` or `peer_rendezvous_lib=debug`
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,

    /// Also write a daily rolling log file into this directory
    #[arg(long, env = "LOG_DIR")]
    pub log_dir: Option<PathBuf>,
}

impl Config {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn settings(&self) -> Settings {
        Settings {
            liveness: LivenessConfig {
                interval: Duration::from_millis(self.heartbeat_interval_ms.max(1)),
                miss_limit: self.heartbeat_miss_limit.max(1),
            },
            rate_limit: RateLimitConfig {
                max_actions: self.rate_limit_actions,
                window: Duration::from_millis(self.rate_limit_window_ms),
            },
            trust_proxy_headers: self.trust_proxy_headers,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 3000,
            heartbeat_interval_ms: 1000,
            heartbeat_miss_limit: 5,
            rate_limit_actions: 10,
            rate_limit_window_ms: 10_000,
            trust_proxy_headers: true,
            log_filter: "info".to_string(),
            log_dir: None,
        }
    }
}

/// Runtime knobs the coordinator needs, independent of how they were supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub liveness: LivenessConfig,
    pub rate_limit: RateLimitConfig,
    pub trust_proxy_headers: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Config::default().settings()
    }
}
