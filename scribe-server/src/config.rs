//! Environment configuration for the hub binary.
//!
//! | Variable                 | Default          |
//! |--------------------------|------------------|
//! | `SCRIBE_BIND_ADDR`       | `127.0.0.1:9090` |
//! | `SCRIBE_DOCUMENT_ID`     | `default`        |
//! | `SCRIBE_INITIAL_CONTENT` | empty            |
//! | `SCRIBE_CONFLICT_POLICY` | `arrival-order`  |
//! | `SCRIBE_TOKENS`          | none             |
//!
//! `SCRIBE_TOKENS` is a comma-separated list of `token:userId[:name]`.

use scribe_collab::{ServerConfig, StaticCredentials, SyncError};

pub const BIND_ADDR: &str = "SCRIBE_BIND_ADDR";
pub const DOCUMENT_ID: &str = "SCRIBE_DOCUMENT_ID";
pub const INITIAL_CONTENT: &str = "SCRIBE_INITIAL_CONTENT";
pub const CONFLICT_POLICY: &str = "SCRIBE_CONFLICT_POLICY";
pub const TOKENS: &str = "SCRIBE_TOKENS";

/// Everything the binary needs to start a hub.
#[derive(Debug)]
pub struct Settings {
    pub server: ServerConfig,
    pub credentials: StaticCredentials,
}

impl Settings {
    pub fn from_env() -> Result<Self, SyncError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SyncError> {
        let mut server = ServerConfig::default();
        if let Some(addr) = lookup(BIND_ADDR) {
            server.bind_addr = addr;
        }
        if let Some(id) = lookup(DOCUMENT_ID) {
            if id.trim().is_empty() {
                return Err(SyncError::Config(format!("{DOCUMENT_ID} must not be empty")));
            }
            server.document_id = id;
        }
        if let Some(content) = lookup(INITIAL_CONTENT) {
            server.initial_content = content;
        }
        if let Some(policy) = lookup(CONFLICT_POLICY) {
            server.conflict_policy = policy.parse()?;
        }
        let credentials = match lookup(TOKENS) {
            Some(list) => StaticCredentials::parse(&list)?,
            None => StaticCredentials::new(),
        };
        Ok(Self {
            server,
            credentials,
        })
    }
}
