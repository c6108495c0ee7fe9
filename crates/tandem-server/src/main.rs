//! Tandem relay server binary.
//!
//! Listens on `TANDEM_BIND` (default `0.0.0.0:3030`). Log filtering follows
//! `RUST_LOG`.

use std::{net::SocketAddr, sync::Arc};

use tandem_server::{AppState, app};
use tracing::{info, warn};

const BIND_ENV: &str = "TANDEM_BIND";
const DEFAULT_BIND: ([u8; 4], u16) = ([0, 0, 0, 0], 3030);

fn bind_addr() -> SocketAddr {
    match std::env::var(BIND_ENV) {
        Ok(value) => value.parse().unwrap_or_else(|e| {
            warn!("Ignoring {}={}: {}", BIND_ENV, value, e);
            SocketAddr::from(DEFAULT_BIND)
        }),
        Err(_) => SocketAddr::from(DEFAULT_BIND),
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tandem_server=info,tower_http=info".into()),
        )
        .init();

    let state = Arc::new(AppState::new());
    let addr = bind_addr();

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Tandem relay server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    axum::serve(listener, app(state)).await
}
