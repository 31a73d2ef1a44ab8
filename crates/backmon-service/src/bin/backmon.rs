// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! The backmon daemon binary.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use backmon_service::config::Configuration;
use backmon_service::metrics::ApplicationMetricSet;
use backmon_service::monitor::Monitor;
use backmon_service::server::{self, ApiState};
use clap::Parser;
use prometheus::Registry;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "backmon", about = "Monitors backup artifacts on storage back-ends")]
struct Args {
    /// Path to the configuration file; the default search covers the
    /// working directory, ~/.backmon, and /etc/backmon.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging, overriding any configured log level.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Configuration::load(args.config.as_deref())?;

    init_tracing(args.debug, config.global.log_level.as_deref());
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting backmon");

    let registry = Registry::new();
    let app_metrics = ApplicationMetricSet::new(&registry);
    app_metrics
        .environments_total
        .set(config.environments.len() as i64);

    let monitor = Arc::new(Monitor::new(&config, registry, app_metrics));

    spawn_refresh_signal_handler(monitor.clone());
    tokio::spawn(monitor.clone().run(config.global.update_interval));

    let state = ApiState {
        monitor,
        basic_auth: config.http.basic_auth.clone().map(Arc::new),
        downloads_enabled: config.downloads.enabled,
    };
    let router = server::router(state);

    let address = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.global.http_port));
    tracing::info!(%address, "starting webserver");
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .with_context(|| format!("could not bind {address}"))?;

    axum::serve(listener, router)
        .await
        .context("webserver terminated")
}

fn init_tracing(debug: bool, configured_level: Option<&str>) {
    let filter = if let Ok(filter) = EnvFilter::try_from_default_env() {
        filter
    } else if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new(configured_level.unwrap_or("info"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// SIGHUP queues a refresh, coalescing with any already pending one.
#[cfg(unix)]
fn spawn_refresh_signal_handler(monitor: Arc<Monitor>) {
    tokio::spawn(async move {
        let mut hangup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        {
            Ok(signal) => signal,
            Err(error) => {
                tracing::warn!(%error, "could not install SIGHUP handler");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            tracing::info!("got HUP signal, reloading");
            monitor.request_refresh();
        }
    });
}

#[cfg(not(unix))]
fn spawn_refresh_signal_handler(_monitor: Arc<Monitor>) {}
