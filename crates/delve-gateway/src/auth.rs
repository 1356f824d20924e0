//! Gateway access: an optional shared token plus named API keys, each key
//! carrying a role. A gateway with neither is open.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{header, StatusCode};

use delve_core::config::{ApiKeyRole, GatewayConfig};

use crate::state::AppState;

/// Secrets presented with a request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Credentials {
    /// `Authorization: Bearer <secret>`
    pub bearer: Option<String>,
    /// `?token=<secret>`, for `EventSource` clients that cannot set headers.
    pub query_token: Option<String>,
}

impl Credentials {
    pub fn from_parts(parts: &Parts) -> Self {
        let bearer = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|v| v.trim().to_string());
        let query_token = parts
            .uri
            .query()
            .and_then(|q| q.split('&').find_map(|pair| pair.strip_prefix("token=")))
            .map(str::to_string);
        Self {
            bearer,
            query_token,
        }
    }

    /// The header wins over the query string.
    fn secret(&self) -> Option<&str> {
        self.bearer.as_deref().or(self.query_token.as_deref())
    }
}

/// An authenticated caller. Extracting it rejects unauthenticated requests
/// with 401; handlers then check the role they need with `require`.
#[derive(Debug, Clone)]
pub struct Caller {
    pub name: String,
    pub role: ApiKeyRole,
}

impl Caller {
    fn admin(name: &str) -> Self {
        Self {
            name: name.to_string(),
            role: ApiKeyRole::Admin,
        }
    }

    /// 403 unless the caller's role is at least `role`.
    pub fn require(&self, role: ApiKeyRole) -> Result<(), StatusCode> {
        if self.role >= role {
            Ok(())
        } else {
            Err(StatusCode::FORBIDDEN)
        }
    }
}

/// Resolve presented credentials against the gateway config.
///
/// API keys are matched first, then the shared token (which grants admin).
/// Presenting nothing is only accepted by an open gateway; presenting a
/// secret that matches nothing is always refused.
pub fn authorize(config: &GatewayConfig, credentials: &Credentials) -> Option<Caller> {
    let open = config.token.is_none() && config.api_keys.is_empty();

    let Some(secret) = credentials.secret() else {
        return open.then(|| Caller::admin("anonymous"));
    };

    if let Some(key) = config.api_keys.iter().find(|k| k.key == secret) {
        return Some(Caller {
            name: key.name.clone(),
            role: key.role.clone(),
        });
    }
    (config.token.as_deref() == Some(secret)).then(|| Caller::admin("token"))
}

impl FromRequestParts<Arc<AppState>> for Caller {
    type Rejection = StatusCode;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        authorize(&state.config, &Credentials::from_parts(parts)).ok_or(StatusCode::UNAUTHORIZED)
    }
}
