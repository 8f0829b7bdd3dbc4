// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Mutex;

use clap::Parser;
use tracing::error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use fleetsync::config::WorkerArgs;

/// Initialize tracing from CLI/env config: stdout always, plus
/// `{data_dir}/sync.log` when `--enable-file-log` is set. Uses `try_init` so
/// it's safe to call multiple times (e.g. from tests).
fn init_tracing(args: &WorkerArgs) {
    let filter = if std::env::var("RUST_LOG").is_ok() && args.log_level == "info" {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level))
    } else {
        EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let json = args.log_format == "json";
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = vec![Box::new(filter)];
    layers.push(if json { Box::new(fmt::layer().json()) } else { Box::new(fmt::layer()) });

    if args.enable_file_log {
        if let Err(e) = std::fs::create_dir_all(&args.data_dir) {
            eprintln!("failed to create data dir for file logging: {e}");
        } else {
            let appender = tracing_appender::rolling::never(&args.data_dir, "sync.log");
            let writer = Mutex::new(appender);
            let file_layer: Box<dyn Layer<Registry> + Send + Sync> = if json {
                Box::new(fmt::layer().json().with_writer(writer).with_ansi(false))
            } else {
                Box::new(fmt::layer().with_writer(writer).with_ansi(false))
            };
            layers.push(file_layer);
        }
    }

    let result = Registry::default().with(layers).try_init();
    drop(result);
}

#[tokio::main]
async fn main() {
    // Required once per process: reqwest is built against a provider-less
    // rustls backend, so the panel HTTP client needs a crypto provider
    // installed before the first TLS connection.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let args = WorkerArgs::parse();
    init_tracing(&args);

    if let Err(e) = fleetsync::run(args).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}
