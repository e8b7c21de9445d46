use crate::extractors::RejectionType;
use crate::AppState;
use axum::{
    extract::{FromRequestParts, Query},
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
};
use domain::Principal;
use log::*;
use serde::Deserialize;

/// The principal behind the bearer token of a request.
///
/// The token is read from the `Authorization: Bearer` header, or from the `token`
/// query parameter for clients (browsers) that cannot set headers on a WebSocket
/// upgrade. Unknown tokens are rejected with 401, inactive principals with 403.
pub(crate) struct AuthenticatedPrincipal(pub Principal);

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn bearer_token(parts: &Parts) -> Option<String> {
    let from_header = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string());

    from_header.or_else(|| {
        Query::<TokenQuery>::try_from_uri(&parts.uri)
            .ok()
            .and_then(|Query(query)| query.token)
    })
}

impl FromRequestParts<AppState> for AuthenticatedPrincipal {
    type Rejection = RejectionType;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(token) = bearer_token(parts).filter(|token| !token.is_empty()) else {
            return Err((StatusCode::UNAUTHORIZED, "Unauthorized".to_string()));
        };

        let principal = state
            .principals
            .principal_for_token(&token)
            .await
            .map_err(|e| {
                error!("Principal lookup failed: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                )
            })?;

        match principal {
            Some(principal) if principal.is_active => Ok(AuthenticatedPrincipal(principal)),
            Some(principal) => {
                info!("Rejected inactive principal {}", principal.username);
                Err((StatusCode::FORBIDDEN, "Forbidden".to_string()))
            }
            None => Err((StatusCode::UNAUTHORIZED, "Unauthorized".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(request: Request<()>) -> Parts {
        request.into_parts().0
    }

    #[test]
    fn token_comes_from_the_header_first() {
        let parts = parts(
            Request::builder()
                .uri("/ws?token=from-query")
                .header(AUTHORIZATION, "Bearer from-header")
                .body(())
                .unwrap(),
        );
        assert_eq!(bearer_token(&parts).as_deref(), Some("from-header"));
    }

    #[test]
    fn token_falls_back_to_the_query_string() {
        let parts = parts(Request::builder().uri("/ws?token=abc").body(()).unwrap());
        assert_eq!(bearer_token(&parts).as_deref(), Some("abc"));
    }

    #[test]
    fn other_schemes_are_ignored() {
        let parts = parts(
            Request::builder()
                .uri("/topics")
                .header(AUTHORIZATION, "Basic dXNlcjpwYXNz")
                .body(())
                .unwrap(),
        );
        assert_eq!(bearer_token(&parts), None);
    }
}
