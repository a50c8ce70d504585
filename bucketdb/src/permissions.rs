//! Write access: which users may administer which buckets, and the bearer token each bucket
//! accepts.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

const WILDCARD: &str = "*";

/// User name to the buckets that user may write. `*` grants every bucket.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permissions {
    users: BTreeMap<String, Vec<String>>,
}

impl Permissions {
    pub fn new(users: BTreeMap<String, Vec<String>>) -> Self {
        Self { users }
    }

    pub fn allowed(&self, user: &str, bucket: &str) -> bool {
        self.has_permission(user, bucket) || self.has_permission(user, WILDCARD)
    }

    fn has_permission(&self, user: &str, bucket: &str) -> bool {
        self.users
            .get(user)
            .is_some_and(|buckets| buckets.iter().any(|b| b == bucket))
    }
}

/// The token from an `Authorization: Bearer <token>` header. Absent or too short headers give
/// an empty token.
pub fn extract_bearer_token(header: Option<&str>) -> &str {
    match header {
        Some(header) if header.len() >= 8 => header.get(7..).unwrap_or(""),
        _ => "",
    }
}

/// Bucket name to the bearer token that bucket accepts for writes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BucketTokens {
    tokens: BTreeMap<String, String>,
}

impl BucketTokens {
    pub fn new(tokens: BTreeMap<String, String>) -> Self {
        Self { tokens }
    }

    pub fn insert<B: Into<String>, T: Into<String>>(&mut self, bucket: B, token: T) {
        self.tokens.insert(bucket.into(), token.into());
    }

    /// Buckets without a configured token accept no writes.
    pub fn authorized(&self, bucket: &str, header: Option<&str>) -> bool {
        let presented = extract_bearer_token(header);
        match self.tokens.get(bucket) {
            Some(expected) if expected == presented => true,
            Some(_) => {
                warn!(bucket, "bearer token mismatch");
                false
            }
            None => {
                warn!(bucket, "no token configured for bucket");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn permissions() -> Permissions {
        Permissions::new(BTreeMap::from([
            ("bob@example.com".to_string(), vec!["foo".to_string()]),
            ("admin@example.com".to_string(), vec!["*".to_string()]),
        ]))
    }

    #[test]
    fn explicit_permission_allows_only_that_bucket() {
        let permissions = permissions();
        assert!(permissions.allowed("bob@example.com", "foo"));
        assert!(!permissions.allowed("bob@example.com", "bar"));
    }

    #[test]
    fn wildcard_allows_every_bucket() {
        let permissions = permissions();
        assert!(permissions.allowed("admin@example.com", "foo"));
        assert!(permissions.allowed("admin@example.com", "anything"));
        assert!(!permissions.allowed("nobody@example.com", "foo"));
    }

    #[test]
    fn bearer_token_extraction() {
        assert_eq!(extract_bearer_token(None), "");
        assert_eq!(extract_bearer_token(Some("Bearer")), "");
        assert_eq!(extract_bearer_token(Some("Bearer ")), "");
        assert_eq!(extract_bearer_token(Some("Bearer x")), "x");
        assert_eq!(extract_bearer_token(Some("Bearer foo-bar-token")), "foo-bar-token");
    }

    #[test]
    fn tokens_must_match_the_bucket() {
        let mut tokens = BucketTokens::default();
        tokens.insert("foo", "foo-bearer-token");
        assert!(tokens.authorized("foo", Some("Bearer foo-bearer-token")));
        assert!(!tokens.authorized("foo", Some("Bearer wrong")));
        assert!(!tokens.authorized("foo", None));
        assert!(!tokens.authorized("bar", Some("Bearer foo-bearer-token")));
    }

    #[test]
    fn permissions_deserialize_from_a_map() -> serde_json::Result<()> {
        let permissions: Permissions =
            serde_json::from_str(r#"{"bob@example.com": ["foo", "bar"]}"#)?;
        assert!(permissions.allowed("bob@example.com", "bar"));
        Ok(())
    }
}
