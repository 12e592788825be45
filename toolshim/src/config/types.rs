// Copyright 2026 The Toolshim Project
// SPDX-License-Identifier: Apache-2.0

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 9810;
pub const DEFAULT_TIMEOUT_MS: u64 = 300_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_STREAM_IDLE_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_TRACE_DIR: &str = "./toolshim-traces";

/// Validated proxy configuration. Loaded once at startup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub listen: ListenConfig,
    pub upstream: UpstreamConfig,
    pub markers: MarkerConfig,
    pub trace: TraceConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListenConfig {
    pub host: IpAddr,
    pub port: u16,
}

impl ListenConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
        }
    }
}

/// How upstream targets are reached and which ones are acceptable.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamConfig {
    /// Whole-request timeout for non-streaming calls.
    pub timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Longest silence tolerated between streamed chunks.
    pub stream_idle_timeout_ms: u64,
    /// Lowercased host names. Empty allows any host.
    pub allowed_hosts: Vec<String>,
    /// Allow loopback, private and link-local targets.
    pub allow_private: bool,
}

impl UpstreamConfig {
    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_idle_timeout_ms)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            stream_idle_timeout_ms: DEFAULT_STREAM_IDLE_TIMEOUT_MS,
            allowed_hosts: Vec::new(),
            allow_private: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarkerConfig {
    /// Fixed seed for reproducible marker selection.
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraceConfig {
    pub enabled: bool,
    pub dir: PathBuf,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: PathBuf::from(DEFAULT_TRACE_DIR),
        }
    }
}
