use axum::http::{
    header::{AUTHORIZATION, CONTENT_TYPE},
    HeaderValue, Method,
};
use log::*;
pub use service::AppState;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

mod controller;
mod error;
pub(crate) mod extractors;
pub mod router;
mod ws;

pub use error::{Error, Result};

/// Serves the HTTP and WebSocket API until ctrl-c, then shuts subscriptions and the
/// broker down.
pub async fn init_server(app_state: AppState) -> std::io::Result<()> {
    let interface = app_state
        .config
        .interface
        .clone()
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let host = format!("{interface}:{}", app_state.config.port);

    let cors_layer = cors_layer(&app_state.config.allowed_origins);
    let app = router::define_routes(app_state.clone()).layer(cors_layer);

    let listener = TcpListener::bind(&host).await?;
    info!(
        "Server starting on {host} ({} broker, streaming {})",
        app_state.config.effective_broker(),
        if app_state.config.enable_streaming {
            "enabled"
        } else {
            "disabled"
        }
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!("Server stopped accepting connections, shutting down streaming");
    app_state.shutdown().await;
    served
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {origin}");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_methods([Method::DELETE, Method::GET, Method::POST, Method::PUT])
        .allow_credentials(true)
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .allow_origin(origins)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for the shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod test_support;
