//! Directory API endpoints.

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;

use crate::state::RelayState;

/// Query parameters for the user listing.
#[derive(Debug, Default, Deserialize)]
pub struct UserSearchQuery {
    pub search: Option<String>,
}

/// List directory users, optionally filtered.
///
/// GET /api/users?search=ali
pub async fn list_users(
    State(state): State<RelayState>,
    Query(query): Query<UserSearchQuery>,
) -> impl IntoResponse {
    Json(state.directory.search(query.search.as_deref()))
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::directory::{UserDirectory, UserRecord};
    use crate::state::{RelayConfig, RelayState};

    fn state() -> RelayState {
        RelayState::new(
            RelayConfig::default(),
            UserDirectory::new(vec![
                UserRecord::new("alice", "Alice"),
                UserRecord::new("bob", "Bob"),
            ]),
        )
    }

    async fn get(uri: &str) -> (StatusCode, serde_json::Value) {
        let response = crate::app(state())
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_list_all_users() {
        let (status, body) = get("/api/users").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_search_users() {
        let (status, body) = get("/api/users?search=BO").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!([{"id": "bob", "name": "Bob"}]));
    }
}
