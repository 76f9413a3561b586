//! HTTP client for the relay's read-only user directory (`GET /api/users`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// A user record as served by the directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Any further fields, passed through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserRecord {
    /// Name to show for this user, falling back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Directory lookups against a relay's HTTP surface.
#[derive(Debug, Clone)]
pub struct DirectoryClient {
    http: reqwest::Client,
    base_url: String,
}

impl DirectoryClient {
    /// `base_url` is the relay's HTTP origin, e.g. `http://localhost:9001`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn users_url(&self) -> String {
        format!("{}/api/users", self.base_url)
    }

    /// List users, optionally filtered by a case-insensitive search on id or name.
    pub async fn search(&self, query: Option<&str>) -> Result<Vec<UserRecord>> {
        let mut request = self.http.get(self.users_url());
        if let Some(q) = query.filter(|q| !q.is_empty()) {
            request = request.query(&[("search", q)]);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::DirectoryError(format!(
                "directory returned {}",
                response.status()
            )));
        }
        Ok(response.json::<Vec<UserRecord>>().await?)
    }

    /// Display name for `user_id`, if the directory knows it.
    pub async fn display_name(&self, user_id: &str) -> Result<Option<String>> {
        let users = self.search(Some(user_id)).await?;
        Ok(users
            .into_iter()
            .find(|u| u.id == user_id)
            .map(|u| u.display_name().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_users_url_trims_trailing_slash() {
        let client = DirectoryClient::new("http://localhost:9001/");
        assert_eq!(client.users_url(), "http://localhost:9001/api/users");
    }

    #[test]
    fn test_record_keeps_extra_fields() {
        let record: UserRecord =
            serde_json::from_value(json!({"id": "alice", "name": "Alice", "avatar": "a.png"})).unwrap();
        assert_eq!(record.display_name(), "Alice");
        assert_eq!(record.extra["avatar"], "a.png");
    }

    #[test]
    fn test_display_name_falls_back_to_id() {
        let record: UserRecord = serde_json::from_value(json!({"id": "bob"})).unwrap();
        assert_eq!(record.display_name(), "bob");
    }

    #[tokio::test]
    async fn test_unreachable_directory_is_an_error() {
        let client = DirectoryClient::new("http://127.0.0.1:1");
        let err = client.search(None).await.unwrap_err();
        assert!(matches!(err, Error::DirectoryError(_) | Error::Timeout(_)));
    }
}
