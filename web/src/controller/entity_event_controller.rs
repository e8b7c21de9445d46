use crate::controller::ApiResponse;
use crate::extractors::authenticated_principal::AuthenticatedPrincipal;
use crate::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use broker::Payload;
use domain::{authorize, Action, EntityRef, Id};
use events::EntityEvent;
use log::*;
use serde::Deserialize;
use utoipa::ToSchema;

#[derive(Debug, Deserialize, ToSchema)]
pub(crate) struct EntityEventRequest {
    /// `created`, `updated`, `deleted` or any custom event name.
    pub event_type: String,
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub data: Option<Payload>,
}

/// POST an event about an entity onto its topic
///
/// The event is handed to the broker in the background; a 202 only means it was
/// accepted for delivery.
#[utoipa::path(
    post,
    path = "/entities/{entity_type}/{entity_id}/events",
    params(
        ("entity_type" = String, Path, description = "Entity type, e.g. order"),
        ("entity_id" = String, Path, description = "Entity id (UUID)"),
    ),
    request_body = EntityEventRequest,
    responses(
        (status = 202, description = "Event accepted; body carries the topic it goes to", body = String),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Missing update privilege for the entity type"),
    ),
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn create(
    AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
    State(app_state): State<AppState>,
    Path((entity_type, entity_id)): Path<(String, Id)>,
    Json(params): Json<EntityEventRequest>,
) -> Response {
    let entity = EntityRef::new(entity_type, entity_id);
    let topic = entity.topic();

    let decision = authorize(&principal, Action::Publish, &topic, Some(&entity));
    if !decision.is_allowed() {
        info!(
            "Denied {} event on {topic} for {}: {:?}",
            params.event_type,
            principal.username,
            decision.rule()
        );
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }

    let event = EntityEvent::new(
        entity.entity_type,
        entity.entity_id,
        params.event_type,
        params.data.unwrap_or_default(),
    );
    debug!("Accepted {} event for {topic}", event.kind);
    app_state.events.spawn_entity_event(event);

    (
        StatusCode::ACCEPTED,
        Json(ApiResponse::new(StatusCode::ACCEPTED.into(), topic)),
    )
        .into_response()
}
