/// livepg WebSocket Server
///
/// Connects to PostgreSQL using the `LIVEPG_*` environment variables and
/// serves live queries to WebSocket clients.

use livepg::server::run_server;
use livepg::{EngineConfig, LivePg};
use std::io;
use std::sync::Arc;

#[actix_web::main]
async fn main() -> io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("PORT: {e}")))?;

    let config = EngineConfig::from_env().map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let engine = LivePg::connect(config)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e))?;
    let engine = Arc::new(engine);

    let served = run_server(engine.clone(), &host, port).await;

    if let Err(e) = engine.end().await {
        log::warn!("shutdown incomplete: {e}");
    }
    served
}
