mod alerts;
mod collector;
mod collectors;
mod config;
mod format;
mod http;
mod metrics;
mod recorder;
mod snapshot;
mod store;
mod transmission;

use axum::serve;
use clap::Parser;
use collector::StatsCollector;
use config::Config;
use metrics::Metrics;
use recorder::MetricsRecorder;
use reqwest::Client;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use store::Store;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "./rpimon.yaml";

#[derive(Parser, Debug)]
#[command(name = "rpimon")]
#[command(version)]
struct Cli {
    /// Configuration file. Falls back to ./rpimon.yaml, then built-in defaults.
    #[arg(long)]
    config: Option<String>,
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match load_config(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };

    info!(
        listen = %cfg.listen,
        database = %cfg.database_path,
        interval = %humantime::format_duration(cfg.record_interval()),
        transmission = cfg.transmission.url.is_some(),
        "starting rpimon"
    );

    let store = match Store::open(&cfg.database_path) {
        Ok(store) => store,
        Err(err) => {
            error!(error = %err, "failed to open metrics database");
            std::process::exit(1);
        }
    };
    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialise metrics");
            std::process::exit(1);
        }
    };

    let http_client = Client::builder()
        .user_agent(concat!("rpimon/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| Client::new());
    let collector = Arc::new(StatsCollector::from_config(&cfg, http_client));

    let recorder = MetricsRecorder::new(collector.clone(), store.clone(), cfg.record_interval())
        .with_metrics(metrics.clone());
    recorder.start();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let listen = cfg.listen.clone();
        let state = http::AppState {
            collector,
            store,
            metrics,
            default_limit: cfg.history.default_limit,
        };
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "invalid listen address");
                    return;
                }
            };
            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, listen = %listen, "failed to bind HTTP listener");
                    return;
                }
            };
            info!(listen = %addr, "HTTP server listening");

            let server = serve(listener, http::build_router(state)).with_graceful_shutdown(
                async move {
                    let _ = shutdown_rx.changed().await;
                },
            );
            if let Err(err) = server.await {
                error!(error = %err, "HTTP server error");
            }
        })
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
    }
    info!("shutdown requested");

    let _ = shutdown_tx.send(true);
    recorder.stop().await;
    let _ = http_task.await;
    info!("rpimon stopped");
}

fn load_config(path: Option<&str>) -> Result<Config, config::ConfigError> {
    match path {
        Some(path) => Config::load_from_file(path),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            Config::load_from_file(DEFAULT_CONFIG_PATH)
        }
        None => {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
