use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use slotd::config::Config;
use slotd::engine::Engine;
use slotd::facade::BookingFacade;
use slotd::maintenance;
use slotd::notify::{LogMailer, NotifyHub};
use slotd::observability;
use slotd::wire::{self, AppState};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = Config::from_env();
    observability::init(cfg.metrics_port);

    std::fs::create_dir_all(&cfg.data_dir)?;
    let wal_path = cfg.data_dir.join("portal.wal");

    let engine = Arc::new(Engine::new(
        wal_path,
        Arc::new(NotifyHub::new()),
        cfg.tuning(),
    )?);
    tokio::spawn(maintenance::run_compactor(engine.clone(), cfg.compact_threshold));

    let state = Arc::new(AppState {
        facade: BookingFacade::new(engine, Arc::new(LogMailer)),
        token: cfg.token.clone(),
    });

    let addr = format!("{}:{}", cfg.bind, cfg.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("listening on {addr}");

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
    };

    wire::serve(listener, state, cfg.max_connections, shutdown).await
}
