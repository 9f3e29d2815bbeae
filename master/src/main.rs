mod driver;
mod failover;
mod handlers;
mod state;

use crate::state::AppState;
use anyhow::Context;
use common::{JobConfigBuilder, LocalWarehouse};
use std::{env, sync::Arc};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

pub const WORKER_HEARTBEAT_TIMEOUT_SECS: u64 = 20;
pub const FAILOVER_SWEEP_INTERVAL_SECS: u64 = 5;
pub const MAX_TASK_ATTEMPTS: u32 = 3;

const DEFAULT_MASTER_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_WAREHOUSE_ROOT: &str = "/data/warehouse";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            env::var("RUST_LOG")
                .unwrap_or_else(|_| "master=debug,common=info,tower_http=info,axum=info".into()),
        )
        .init();

    let warehouse_root = env::var("WAREHOUSE_ROOT").unwrap_or_else(|_| DEFAULT_WAREHOUSE_ROOT.into());
    let warehouse = Arc::new(LocalWarehouse::new(&warehouse_root));

    // engine, estrategia y directorios por defecto salen del entorno; cada
    // job puede pisar engine y estrategia en el pedido
    let state = AppState::new(warehouse, JobConfigBuilder::from_env(""));

    // router HTTP
    let app = handlers::build_router(state.clone()).layer(TraceLayer::new_for_http());

    // detección de workers caídos en segundo plano
    let failover_state = state.clone();
    tokio::spawn(async move {
        failover::run_failover_loop(failover_state).await;
    });

    let addr = env::var("MASTER_ADDR").unwrap_or_else(|_| DEFAULT_MASTER_ADDR.into());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("no se pudo escuchar en {addr}"))?;
    info!(
        "master escuchando en {} (warehouse en {})",
        listener.local_addr()?,
        warehouse_root
    );

    axum::serve(listener, app).await?;
    Ok(())
}
