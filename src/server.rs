/// HTTP server exposing live queries over WebSocket
use actix_web::{middleware, web, App, Error, HttpRequest, HttpResponse, HttpServer};
use actix_web_actors::ws;
use log::info;
use std::sync::Arc;

use crate::engine::LivePg;
use crate::websocket::{AppState, LiveQuerySocket};

/// WebSocket endpoint handler
async fn ws_index(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let resp = ws::start(LiveQuerySocket::new(state), &req, stream)?;
    Ok(resp)
}

/// Health check endpoint
async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "channel": state.engine.config().channel,
        "caches": state.engine.cache_count(),
        "tables": state.engine.bound_tables(),
    }))
}

/// Start the HTTP server in front of a running engine
pub async fn run_server(engine: Arc<LivePg>, host: &str, port: u16) -> std::io::Result<()> {
    let state = web::Data::new(AppState::new(engine));

    info!("livepg WebSocket: ws://{}:{}/ws", host, port);
    info!("livepg health check: http://{}:{}/health", host, port);

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(middleware::Logger::default())
            // CORS for development
            .wrap(
                actix_cors::Cors::default()
                    .allow_any_origin()
                    .allow_any_method()
                    .allow_any_header()
                    .max_age(3600),
            )
            .route("/ws", web::get().to(ws_index))
            .route("/health", web::get().to(health_check))
    })
    .bind((host, port))?
    .run()
    .await
}
