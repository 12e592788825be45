// Copyright 2026 The Toolshim Project
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use toolshim::config::{self, Config};
use toolshim::engine;
use toolshim::markers::MarkerSet;
use toolshim::parser::ToolProtocol;
use toolshim::proxy;
use toolshim::trace::{FileTraceSink, NoopTraceSink, TraceSink};
use tracing_subscriber::EnvFilter;

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "toolshim", about = "Tool calling proxy for chat backends")]
struct Cli {
    /// Path to a toolshim.yaml config file. Defaults apply when omitted.
    #[arg(long, env = "TOOLSHIM_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on (overrides the config file)
    #[arg(long, env = "TOOLSHIM_HOST")]
    host: Option<IpAddr>,

    /// Port to listen on (overrides the config file)
    #[arg(long, env = "TOOLSHIM_PORT")]
    port: Option<u16>,
}

fn fail(msg: &str, err: &dyn std::fmt::Display) -> ! {
    tracing::error!(error = %err, "{msg}");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match config::load_config(&config::FileSource::new(path)) {
            Ok(c) => c,
            Err(e) => fail("failed to load config", &e),
        },
        None => Config::default(),
    };
    if let Some(host) = cli.host {
        config.listen.host = host;
    }
    if let Some(port) = cli.port {
        config.listen.port = port;
    }
    let config = Arc::new(config);

    tracing::info!(
        config = ?cli.config,
        timeout_ms = config.upstream.timeout_ms,
        stream_idle_timeout_ms = config.upstream.stream_idle_timeout_ms,
        allowed_hosts = config.upstream.allowed_hosts.len(),
        allow_private = config.upstream.allow_private,
        trace = config.trace.enabled,
        "config loaded"
    );

    let markers = match config.markers.seed {
        Some(seed) => MarkerSet::generate_with(&mut StdRng::seed_from_u64(seed)),
        None => MarkerSet::generate(),
    };
    tracing::debug!(call_start = %markers.call_start, "markers selected");
    let protocol = match ToolProtocol::new(markers) {
        Ok(p) => Arc::new(p),
        Err(e) => fail("invalid marker set", &e),
    };

    let trace_files = if config.trace.enabled {
        match FileTraceSink::new(&config.trace.dir) {
            Ok(sink) => Some(Arc::new(sink)),
            Err(e) => fail("failed to start trace writer", &e),
        }
    } else {
        None
    };
    let tracer: Arc<dyn TraceSink> = match &trace_files {
        Some(sink) => sink.clone(),
        None => Arc::new(NoopTraceSink),
    };

    let upstream: Arc<dyn proxy::UpstreamClient> =
        match engine::build_engine_client(config.clone(), protocol, tracer) {
            Ok(client) => Arc::new(client),
            Err(e) => fail("failed to build HTTP client", &e),
        };

    let app = proxy::build_router(upstream, proxy::TargetPolicy::from_config(&config.upstream));

    let addr = config.listen.addr();
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => fail("failed to bind to address", &e),
    };

    tracing::info!(%addr, "toolshim listening");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
    {
        fail("server error", &e);
    }

    if let Some(sink) = trace_files {
        sink.flush().await;
    }
}
