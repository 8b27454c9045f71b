//! The hearth chat server daemon.
//!
//! Configuration comes from the environment:
//!
//! - `HEARTH_BIND`: listen address (default `127.0.0.1:7878`)
//! - `HEARTH_DB`: SQLite file path (default: in-memory, lost on exit)
//! - `HEARTH_TRANSPORT`: `tcp` (default) or `websocket`
//! - `RUST_LOG`: log filter (default `hearth=info`)

use hearth::prelude::*;

#[tokio::main]
async fn main() -> Result<(), HearthError> {
    hearth::logging::init("hearth=info");

    let config = config_from_env();
    tracing::info!(
        bind = %config.bind_addr,
        transport = ?config.transport,
        database = ?config.database,
        "starting hearthd"
    );

    let builder = ChatServer::builder().config(config.clone());
    match config.transport {
        TransportKind::Tcp => serve(builder.build().await?).await,
        TransportKind::WebSocket => serve(builder.build_websocket().await?).await,
    }
}

fn config_from_env() -> ServerConfig {
    let mut config = ServerConfig::default();
    if let Ok(addr) = std::env::var("HEARTH_BIND") {
        config.bind_addr = addr;
    }
    if let Ok(path) = std::env::var("HEARTH_DB") {
        config.database = DatabaseLocation::File(path.into());
    }
    if let Ok(kind) = std::env::var("HEARTH_TRANSPORT") {
        match kind.to_ascii_lowercase().as_str() {
            "tcp" => config.transport = TransportKind::Tcp,
            "websocket" | "ws" => config.transport = TransportKind::WebSocket,
            other => tracing::warn!(value = other, "unknown HEARTH_TRANSPORT, using tcp"),
        }
    }
    config
}

async fn serve<T: Transport>(server: ChatServer<T>) -> Result<(), HearthError> {
    tracing::info!(addr = %server.local_addr()?, "listening");

    let handle = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            handle.shutdown();
        }
    });

    server.run().await
}
