//! Connection credentials.
//!
//! A token arrives with the WebSocket handshake, either as `?token=` in the
//! request URI or as `Authorization: Bearer <token>`. The hub resolves it to
//! an [`Identity`] before any envelope is processed.

use std::collections::HashMap;

use url::form_urlencoded;

use crate::error::SyncError;

/// Authenticated user behind a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub user_id: String,
    pub name: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
        }
    }
}

/// Resolves a presented token to an identity.
pub trait CredentialVerifier: Send + Sync + 'static {
    fn verify(&self, token: &str) -> Option<Identity>;
}

impl<F> CredentialVerifier for F
where
    F: Fn(&str) -> Option<Identity> + Send + Sync + 'static,
{
    fn verify(&self, token: &str) -> Option<Identity> {
        self(token)
    }
}

/// Fixed token table, for single-process deployments and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    tokens: HashMap<String, Identity>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }

    /// Parse `token:userId:name` triples separated by commas.
    ///
    /// `name` may be omitted, in which case it defaults to the user id.
    pub fn parse(list: &str) -> Result<Self, SyncError> {
        let mut credentials = Self::new();
        for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let mut parts = entry.splitn(3, ':');
            let token = parts.next().unwrap_or_default().trim();
            let user_id = parts.next().unwrap_or_default().trim();
            if token.is_empty() || user_id.is_empty() {
                return Err(SyncError::Config(format!(
                    "credential entry {entry:?} must look like token:userId[:name]"
                )));
            }
            let name = parts.next().map(str::trim).filter(|n| !n.is_empty()).unwrap_or(user_id);
            credentials = credentials.with_token(token, Identity::new(user_id, name));
        }
        Ok(credentials)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl CredentialVerifier for StaticCredentials {
    fn verify(&self, token: &str) -> Option<Identity> {
        self.tokens.get(token).cloned()
    }
}

/// Extract the token from a handshake's URI query or `Authorization` header.
///
/// The query is form-urlencoded; the parameter wins when both are present.
/// The auth scheme is matched case-insensitively.
pub fn token_from_request(query: Option<&str>, authorization: Option<&str>) -> Option<String> {
    let from_query = query.and_then(|q| {
        form_urlencoded::parse(q.as_bytes())
            .find(|(key, _)| key == "token")
            .map(|(_, value)| value.into_owned())
    });

    from_query
        .or_else(|| {
            let (scheme, token) = authorization?.trim().split_once(' ')?;
            scheme
                .eq_ignore_ascii_case("bearer")
                .then(|| token.trim().to_string())
        })
        .filter(|t| !t.is_empty())
}
