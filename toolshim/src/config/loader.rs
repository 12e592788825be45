// Copyright 2026 The Toolshim Project
// SPDX-License-Identifier: Apache-2.0

use std::net::IpAddr;
use std::path::PathBuf;

use super::error::ConfigError;
use super::interpolation::resolve_variables;
use super::raw;
use super::source::ConfigSource;
use super::types::*;

/// Load and validate a toolshim config from the given source.
///
/// Steps:
/// 1. Read raw YAML from the source
/// 2. Parse into raw deserialization types
/// 3. Check the contract version
/// 4. Resolve `${VAR}` references in string fields
/// 5. Apply defaults and validate values
pub fn load_config(source: &dyn ConfigSource) -> Result<Config, ConfigError> {
    let raw_yaml = source.load()?;
    let raw: raw::RawConfig = serde_yaml::from_str(&raw_yaml)?;

    if raw.toolshim != "v1" {
        return Err(ConfigError::Validation(format!(
            "unsupported contract version \"{}\", expected \"v1\"",
            raw.toolshim
        )));
    }

    Ok(Config {
        listen: build_listen_config(raw.listen)?,
        upstream: build_upstream_config(raw.upstream)?,
        markers: MarkerConfig {
            seed: raw.markers.and_then(|m| m.seed),
        },
        trace: build_trace_config(raw.trace)?,
    })
}

fn build_listen_config(raw: Option<raw::RawListenConfig>) -> Result<ListenConfig, ConfigError> {
    let mut listen = ListenConfig::default();
    let Some(raw) = raw else {
        return Ok(listen);
    };

    if let Some(host) = raw.host {
        let host = resolve_variables(&host)?;
        listen.host = host.trim().parse::<IpAddr>().map_err(|_| {
            ConfigError::Validation(format!(
                "listen.host \"{host}\" is not an IP address"
            ))
        })?;
    }
    if let Some(port) = raw.port {
        if port == 0 {
            return Err(ConfigError::Validation(
                "listen.port must be between 1 and 65535".to_string(),
            ));
        }
        listen.port = port;
    }
    Ok(listen)
}

fn build_upstream_config(
    raw: Option<raw::RawUpstreamConfig>,
) -> Result<UpstreamConfig, ConfigError> {
    let defaults = UpstreamConfig::default();
    let Some(raw) = raw else {
        return Ok(defaults);
    };

    let allowed_hosts = raw
        .allowed_hosts
        .iter()
        .map(|host| {
            let host = resolve_variables(host)?.trim().to_ascii_lowercase();
            if host.is_empty() {
                return Err(ConfigError::Validation(
                    "upstream.allowed_hosts entries must not be empty".to_string(),
                ));
            }
            Ok(host)
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(UpstreamConfig {
        timeout_ms: positive("upstream.timeout_ms", raw.timeout_ms, defaults.timeout_ms)?,
        connect_timeout_ms: positive(
            "upstream.connect_timeout_ms",
            raw.connect_timeout_ms,
            defaults.connect_timeout_ms,
        )?,
        stream_idle_timeout_ms: positive(
            "upstream.stream_idle_timeout_ms",
            raw.stream_idle_timeout_ms,
            defaults.stream_idle_timeout_ms,
        )?,
        allowed_hosts,
        allow_private: raw.allow_private.unwrap_or(defaults.allow_private),
    })
}

fn build_trace_config(raw: Option<raw::RawTraceConfig>) -> Result<TraceConfig, ConfigError> {
    let Some(raw) = raw else {
        return Ok(TraceConfig::default());
    };
    let dir = match raw.dir {
        Some(dir) => PathBuf::from(resolve_variables(&dir)?),
        None => PathBuf::from(DEFAULT_TRACE_DIR),
    };
    Ok(TraceConfig {
        enabled: raw.enabled,
        dir,
    })
}

fn positive(field: &str, value: Option<u64>, default: u64) -> Result<u64, ConfigError> {
    match value {
        Some(0) => Err(ConfigError::Validation(format!(
            "{field} must be greater than 0"
        ))),
        Some(v) => Ok(v),
        None => Ok(default),
    }
}
