use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use slotbook::engine::Engine;
use slotbook::notify::NotifyHub;
use slotbook::{observability, sweep, wire};

struct Config {
    bind: String,
    port: u16,
    data_dir: PathBuf,
    password: String,
    max_connections: usize,
    sweep_interval: Duration,
    compact_threshold: u64,
    metrics_port: Option<u16>,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    fn from_env() -> Self {
        Self {
            bind: env_or("SLOTBOOK_BIND", "0.0.0.0".to_string()),
            port: env_or("SLOTBOOK_PORT", 7420),
            data_dir: env_or("SLOTBOOK_DATA_DIR", PathBuf::from("./data")),
            password: env_or("SLOTBOOK_PASSWORD", "slotbook".to_string()),
            max_connections: env_or("SLOTBOOK_MAX_CONNECTIONS", 256),
            sweep_interval: Duration::from_secs(env_or("SLOTBOOK_SWEEP_INTERVAL_SECS", 60)),
            compact_threshold: env_or("SLOTBOOK_COMPACT_THRESHOLD", 1000),
            metrics_port: std::env::var("SLOTBOOK_METRICS_PORT")
                .ok()
                .and_then(|s| s.parse().ok()),
        }
    }
}

/// Resolves on SIGTERM or ctrl-c.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

/// Wait for every connection permit to come back, or give up at the deadline.
async fn drain_connections(semaphore: &Semaphore, total: usize, deadline: Duration) {
    let timeout = tokio::time::sleep(deadline);
    tokio::pin!(timeout);
    loop {
        if semaphore.available_permits() == total {
            info!("all connections drained");
            return;
        }
        tokio::select! {
            _ = &mut timeout => {
                let open = total - semaphore.available_permits();
                warn!("drain timeout, {open} connections still open");
                return;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let cfg = Config::from_env();
    observability::init(cfg.metrics_port);

    std::fs::create_dir_all(&cfg.data_dir)?;
    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(cfg.data_dir.join("slotbook.wal"), notify)?);

    tokio::spawn(sweep::run_sweep(engine.clone(), cfg.sweep_interval));
    tokio::spawn(sweep::run_compactor(engine.clone(), cfg.compact_threshold));

    let addr = format!("{}:{}", cfg.bind, cfg.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("slotbook listening on {addr}");
    info!("  data_dir: {}", cfg.data_dir.display());
    info!("  max_connections: {}", cfg.max_connections);
    info!("  sweep_interval: {:?}", cfg.sweep_interval);
    info!(
        "  metrics: {}",
        cfg.metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let semaphore = Arc::new(Semaphore::new(cfg.max_connections));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let (socket, peer) = tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    error!("accept error: {e}");
                    continue;
                }
            },
        };

        let Ok(permit) = semaphore.clone().try_acquire_owned() else {
            warn!("connection limit reached, rejecting {peer}");
            metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
            drop(socket);
            continue;
        };

        info!("connection from {peer}");
        metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
        metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
        let engine = engine.clone();
        let password = cfg.password.clone();
        tokio::spawn(async move {
            let _permit = permit; // held until the connection closes
            if let Err(e) = wire::process_connection(socket, engine, password).await {
                error!("connection error from {peer}: {e}");
            }
            metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
        });
    }

    info!("draining connections...");
    drain_connections(&semaphore, cfg.max_connections, Duration::from_secs(10)).await;

    info!("slotbook stopped");
    Ok(())
}
