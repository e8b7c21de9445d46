//! Token to principal resolution.
//!
//! Authentication itself happens elsewhere; the streaming service only needs to turn
//! a presented bearer token into the [`Principal`] snapshot it was issued for.

use crate::error::Error;
use crate::principal::Principal;
use async_trait::async_trait;
use dashmap::DashMap;
use log::*;
use std::collections::HashMap;
use std::path::Path;

#[async_trait]
pub trait PrincipalProvider: Send + Sync {
    /// `Ok(None)` means the token is unknown.
    async fn principal_for_token(&self, token: &str) -> Result<Option<Principal>, Error>;
}

/// In-memory token directory, optionally seeded from a JSON file of the form
/// `{ "<token>": { "id": ..., "username": ..., "roles": [...] } }`.
#[derive(Debug, Default)]
pub struct PrincipalDirectory {
    principals: DashMap<String, Principal>,
}

impl PrincipalDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, Error> {
        let entries: HashMap<String, Principal> = serde_json::from_str(json)?;
        let directory = Self::new();
        for (token, principal) in entries {
            directory.insert(token, principal);
        }
        Ok(directory)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let directory = Self::from_json(&contents)?;
        info!(
            "Loaded {} principal(s) from {}",
            directory.len(),
            path.display()
        );
        Ok(directory)
    }

    pub fn insert(&self, token: impl Into<String>, principal: Principal) {
        self.principals.insert(token.into(), principal);
    }

    pub fn len(&self) -> usize {
        self.principals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.principals.is_empty()
    }
}

#[async_trait]
impl PrincipalProvider for PrincipalDirectory {
    async fn principal_for_token(&self, token: &str) -> Result<Option<Principal>, Error> {
        Ok(self.principals.get(token).map(|entry| entry.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DomainErrorKind, InternalErrorKind};
    use crate::Id;

    #[tokio::test]
    async fn resolves_known_tokens_and_ignores_unknown_ones() {
        let directory = PrincipalDirectory::new();
        let principal = Principal::new(Id::new_v4(), "ada");
        directory.insert("token-a", principal.clone());

        assert_eq!(
            directory.principal_for_token("token-a").await.unwrap(),
            Some(principal)
        );
        assert_eq!(directory.principal_for_token("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn loads_a_json_directory() {
        let id = Id::new_v4();
        let json = format!(
            r#"{{"secret": {{"id": "{id}", "username": "bob",
                "roles": [{{"name": "viewer", "privileges": [{{"name": "read_order"}}]}}]}}}}"#
        );

        let directory = PrincipalDirectory::from_json(&json).unwrap();
        let principal = directory
            .principal_for_token("secret")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(principal.id, id);
        assert!(principal.has_privilege("read_order"));
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let err = PrincipalDirectory::from_json("[1, 2").unwrap_err();
        assert_eq!(
            err.error_kind,
            DomainErrorKind::Internal(InternalErrorKind::Config)
        );
    }

    #[test]
    fn reads_the_directory_from_disk() {
        let path = std::env::temp_dir().join(format!("principals-{}.json", Id::new_v4()));
        std::fs::write(
            &path,
            format!(r#"{{"t": {{"id": "{}", "username": "eve"}}}}"#, Id::new_v4()),
        )
        .unwrap();

        let directory = PrincipalDirectory::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(directory.len(), 1);
        assert!(PrincipalDirectory::from_file(&path).is_err());
    }
}
