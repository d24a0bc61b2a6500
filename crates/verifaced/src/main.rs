use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;
use veriface_core::JsonAnalyzer;
use zbus::object_server::SignalEmitter;

mod config;
mod dbus_interface;
mod engine;
mod rate_limiter;
mod store;

use dbus_interface::{AppState, VerifyService, BUS_NAME, OBJECT_PATH};
use rate_limiter::{RateLimiter, RateLimits};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("verifaced starting");

    let config = config::Config::from_env()?;
    tracing::info!(
        db = %config.db_path.display(),
        session_bus = config.session_bus,
        liveness = config.verify.liveness.enabled,
        "configuration loaded"
    );

    let store = store::ReferenceStore::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open {}", config.db_path.display()))?;

    // Frames arrive as detector output; see veriface_core::detection.
    let engine = engine::spawn_engine(JsonAnalyzer)?;

    let rate_limiter = RateLimiter::new(RateLimits {
        max_failures: config.max_failures,
        window: config.failure_window,
        lockout: config.lockout,
    });

    let tick_interval = config.tick_interval;
    let session_idle = config.session_idle;
    let session_bus = config.session_bus;

    let state = Arc::new(Mutex::new(AppState {
        config,
        engine,
        store,
        rate_limiter,
        sessions: HashMap::new(),
    }));

    let service = VerifyService {
        state: Arc::clone(&state),
    };

    let builder = if session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to connect to D-Bus")?;

    let emitter = SignalEmitter::new(&conn, OBJECT_PATH)?;
    tokio::spawn(dbus_interface::run_session_timers(
        state,
        emitter,
        tick_interval,
        session_idle,
    ));

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "verifaced ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("verifaced shutting down");

    Ok(())
}
