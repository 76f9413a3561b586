//! Directory store.
//!
//! Loaded once at startup from a JSON file holding an array of user records.
//! A missing or unreadable file yields an empty directory and a warning.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One directory entry. Fields beyond `id` and `name` are passed through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            extra: Map::new(),
        }
    }

    fn matches(&self, needle: &str) -> bool {
        self.id.to_lowercase().contains(needle) || self.name.to_lowercase().contains(needle)
    }
}

/// Immutable, cheaply clonable user directory.
#[derive(Debug, Clone, Default)]
pub struct UserDirectory {
    users: Arc<Vec<UserRecord>>,
}

impl UserDirectory {
    pub fn new(users: Vec<UserRecord>) -> Self {
        Self {
            users: Arc::new(users),
        }
    }

    /// Load the directory from `path`.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "User directory file not found, serving an empty directory");
            return Self::default();
        }

        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<Vec<UserRecord>>(&contents) {
                Ok(users) => {
                    tracing::info!(users = users.len(), path = %path.display(), "User directory loaded");
                    Self::new(users)
                }
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "Failed to parse user directory");
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "Failed to read user directory");
                Self::default()
            }
        }
    }

    /// All users, or those whose id or name contains `query` (case-insensitive).
    pub fn search(&self, query: Option<&str>) -> Vec<UserRecord> {
        match query.map(str::trim).filter(|q| !q.is_empty()) {
            None => self.users.as_ref().clone(),
            Some(q) => {
                let needle = q.to_lowercase();
                self.users
                    .iter()
                    .filter(|u| u.matches(&needle))
                    .cloned()
                    .collect()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample() -> UserDirectory {
        UserDirectory::new(vec![
            UserRecord::new("alice", "Alice Liddell"),
            UserRecord::new("bob", "Bob Marley"),
            UserRecord::new("carol", "Carol Danvers"),
        ])
    }

    #[test]
    fn test_search_without_query_returns_everyone() {
        assert_eq!(sample().search(None).len(), 3);
        assert_eq!(sample().search(Some("  ")).len(), 3);
    }

    #[test]
    fn test_search_matches_id_and_name_case_insensitively() {
        let dir = sample();
        let hits = dir.search(Some("MAR"));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "bob");

        let hits = dir.search(Some("car"));
        assert_eq!(hits[0].id, "carol");
    }

    #[test]
    fn test_load_passes_extra_fields_through() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"id":"alice","name":"Alice","avatar":"a.png"}},{{"id":"bob","name":"Bob"}}]"#
        )
        .unwrap();

        let dir = UserDirectory::load(file.path());
        assert_eq!(dir.len(), 2);
        let alice = &dir.search(Some("alice"))[0];
        assert_eq!(alice.extra["avatar"], "a.png");
    }

    #[test]
    fn test_load_keeps_records_without_a_name() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"[{{"id":"alice","name":"Alice"}},{{"id":"ghost"}}]"#).unwrap();

        let dir = UserDirectory::load(file.path());
        assert_eq!(dir.len(), 2);
        let ghost = &dir.search(Some("ghost"))[0];
        assert_eq!(ghost.name, "");
        assert_eq!(dir.search(Some("alice"))[0].name, "Alice");
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = UserDirectory::load(Path::new("/definitely/not/here/users.json"));
        assert!(dir.is_empty());
    }

    #[test]
    fn test_load_corrupt_file_is_empty() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(UserDirectory::load(file.path()).is_empty());
    }
}
