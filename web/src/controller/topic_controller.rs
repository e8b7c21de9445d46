use crate::controller::ApiResponse;
use crate::extractors::authenticated_principal::AuthenticatedPrincipal;
use crate::{AppState, Error};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use domain::error::Error as DomainError;
use domain::Principal;
use log::*;

fn forbidden_unless_superuser(principal: &Principal) -> Option<Response> {
    if principal.is_superuser {
        None
    } else {
        info!(
            "Principal {} attempted topic administration without superuser",
            principal.username
        );
        Some((StatusCode::FORBIDDEN, "Forbidden").into_response())
    }
}

/// GET all topics known to the broker
#[utoipa::path(
    get,
    path = "/topics",
    responses(
        (status = 200, description = "Topics known to the broker", body = [String]),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden"),
    ),
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn index(
    AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
    State(app_state): State<AppState>,
) -> Response {
    if let Some(rejection) = forbidden_unless_superuser(&principal) {
        return rejection;
    }

    let topics = app_state.broker.list_topics().await;
    debug!("Listing {} topics", topics.len());

    Json(ApiResponse::new(StatusCode::OK.into(), topics)).into_response()
}

/// CREATE a topic. Creating an existing topic succeeds.
#[utoipa::path(
    put,
    path = "/topics/{topic}",
    params(("topic" = String, Path, description = "Topic name")),
    responses(
        (status = 201, description = "Topic exists"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden"),
        (status = 502, description = "The broker refused or could not be reached"),
    ),
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn create(
    AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
    State(app_state): State<AppState>,
    Path(topic): Path<String>,
) -> Result<Response, Error> {
    if let Some(rejection) = forbidden_unless_superuser(&principal) {
        return Ok(rejection);
    }

    debug!("CREATE topic {topic}");
    if !app_state
        .broker
        .create_topic(&topic, app_state.config.topic_settings())
        .await
    {
        return Err(DomainError::network(format!("Failed to create topic: {topic}")).into());
    }

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::new(StatusCode::CREATED.into(), topic)),
    )
        .into_response())
}

/// DELETE a topic. Deleting a missing topic succeeds.
#[utoipa::path(
    delete,
    path = "/topics/{topic}",
    params(("topic" = String, Path, description = "Topic name")),
    responses(
        (status = 204, description = "Topic no longer exists"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden"),
        (status = 502, description = "The broker refused or could not be reached"),
    ),
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn delete(
    AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
    State(app_state): State<AppState>,
    Path(topic): Path<String>,
) -> Result<Response, Error> {
    if let Some(rejection) = forbidden_unless_superuser(&principal) {
        return Ok(rejection);
    }

    debug!("DELETE topic {topic}");
    if !app_state.broker.delete_topic(&topic).await {
        return Err(DomainError::network(format!("Failed to delete topic: {topic}")).into());
    }

    Ok(StatusCode::NO_CONTENT.into_response())
}
