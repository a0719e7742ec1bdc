//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bearer token verification for the control plane."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use axum::http::{header, HeaderMap};
use botdeck_common::TokenGrant;
use indexmap::IndexMap;
use tracing::debug;

/// Identity a verified token resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub uid: String,
    pub email: Option<String>,
}

/// Resolves bearer tokens to principals.
pub trait TokenVerifier: Send + Sync + 'static {
    fn verify(&self, token: &str) -> Option<Principal>;
}

/// Verifier backed by the `[server.tokens]` table.
#[derive(Debug, Clone)]
pub struct StaticTokenVerifier {
    grants: Arc<IndexMap<String, TokenGrant>>,
}

impl StaticTokenVerifier {
    pub fn new(grants: impl IntoIterator<Item = (String, TokenGrant)>) -> Self {
        Self {
            grants: Arc::new(grants.into_iter().collect()),
        }
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> Option<Principal> {
        let Some(grant) = self.grants.get(token) else {
            debug!("bearer token rejected");
            return None;
        };
        Some(Principal {
            uid: grant.uid.clone(),
            email: grant.email.clone(),
        })
    }
}

/// Token from an `Authorization: Bearer <token>` header. Any other scheme
/// counts as missing.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}
