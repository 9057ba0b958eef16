//! Pluggable authentication for `rpcswitch.hello`.
//!
//! The switch never interprets credentials itself; it hands the
//! `{method, who, token}` triple to an [`AuthVerifier`] and acts on the
//! outcome. The built-in [`TokenVerifier`] checks static per-method token
//! tables from the daemon config.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{AppConfig, AuthMethodConfig};

/// Outcome of a verification attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    Granted,
    Denied(String),
}

#[async_trait]
pub trait AuthVerifier: Send + Sync {
    /// Verify `who`'s `token` under the named auth `method`.
    ///
    /// An `Err` means the verifier itself failed, not that the credentials
    /// were rejected; rejections are `Ok(AuthResult::Denied(..))`.
    async fn verify(&self, method: &str, who: &str, token: &str) -> anyhow::Result<AuthResult>;
}

/// Verifier backed by the `[auth.<method>] tokens` tables in the config.
pub struct TokenVerifier {
    methods: HashMap<String, AuthMethodConfig>,
}

impl TokenVerifier {
    pub fn new(methods: HashMap<String, AuthMethodConfig>) -> Self {
        Self { methods }
    }
}

#[async_trait]
impl AuthVerifier for TokenVerifier {
    async fn verify(&self, method: &str, who: &str, token: &str) -> anyhow::Result<AuthResult> {
        let Some(table) = self.methods.get(method) else {
            return Ok(AuthResult::Denied(format!("unknown auth method '{method}'")));
        };
        match table.tokens.get(who) {
            Some(expected) if expected == token => Ok(AuthResult::Granted),
            _ => Ok(AuthResult::Denied(format!("invalid credentials for '{who}'"))),
        }
    }
}

pub fn create_verifier(config: &AppConfig) -> Arc<dyn AuthVerifier> {
    Arc::new(TokenVerifier::new(config.auth.clone()))
}
