use crate::controller::{entity_event_controller, health_check_controller, topic_controller};
use crate::ws::handler::ws_handler;
use crate::AppState;
use axum::{
    routing::{get, post, put},
    Router,
};

use utoipa::{
    openapi::security::{Http, HttpAuthScheme, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_rapidoc::RapiDoc;

// This is the global definition of our OpenAPI spec. To be a part
// of the rendered spec, a path and schema must be listed here.
#[derive(OpenApi)]
#[openapi(
        info(
            title = "Streaming Platform API"
        ),
        paths(
            health_check_controller::health_check,
            topic_controller::index,
            topic_controller::create,
            topic_controller::delete,
            entity_event_controller::create,
        ),
        components(
            schemas(
                entity_event_controller::EntityEventRequest,
            )
        ),
        modifiers(&SecurityAddon),
        tags(
            (name = "streaming_platform", description = "Real-time topic streaming API")
        )
    )]
struct ApiDoc;

struct SecurityAddon;

// Every protected endpoint takes the same bearer token the WebSocket upgrade does.
impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
            )
        }
    }
}

pub fn define_routes(app_state: AppState) -> Router {
    Router::new()
        .merge(health_routes())
        .merge(streaming_routes(app_state.clone()))
        .merge(topic_routes(app_state.clone()))
        .merge(entity_event_routes(app_state))
        .merge(RapiDoc::with_openapi("/api-docs/openapi2.json", ApiDoc::openapi()).path("/rapidoc"))
}

fn health_routes() -> Router {
    Router::new().route("/health", get(health_check_controller::health_check))
}

fn streaming_routes(app_state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(app_state)
}

fn topic_routes(app_state: AppState) -> Router {
    Router::new()
        .route("/topics", get(topic_controller::index))
        .route(
            "/topics/{topic}",
            put(topic_controller::create).delete(topic_controller::delete),
        )
        .with_state(app_state)
}

fn entity_event_routes(app_state: AppState) -> Router {
    Router::new()
        .route(
            "/entities/{entity_type}/{entity_id}/events",
            post(entity_event_controller::create),
        )
        .with_state(app_state)
}
