// Copyright 2026 The Toolshim Project
// SPDX-License-Identifier: Apache-2.0

// Raw YAML shapes. Every section is optional; defaults and validation are
// applied by the loader when building the typed `Config`.

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct RawConfig {
    pub toolshim: String,
    pub listen: Option<RawListenConfig>,
    pub upstream: Option<RawUpstreamConfig>,
    pub markers: Option<RawMarkerConfig>,
    pub trace: Option<RawTraceConfig>,
}

#[derive(Debug, Deserialize)]
pub struct RawListenConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct RawUpstreamConfig {
    pub timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub stream_idle_timeout_ms: Option<u64>,
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    pub allow_private: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct RawMarkerConfig {
    pub seed: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct RawTraceConfig {
    #[serde(default)]
    pub enabled: bool,
    pub dir: Option<String>,
}
