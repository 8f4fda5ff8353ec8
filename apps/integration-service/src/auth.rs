//! Request authorization for the process endpoint.
//!
//! Four credentials are accepted, checked in order: the internal shared
//! secret (cron), a service-role JWT, the raw service key as bearer, and an
//! interactive session token whose profile role is administrative. Anything
//! else is a 401.

use std::sync::Arc;

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::Value;

use funil_store::IntegrationStore;

use crate::config::Config;

const INTERNAL_SECRET_HEADER: &str = "x-internal-secret";

/// Profile roles allowed to trigger processing interactively.
const ADMIN_ROLES: &[&str] = &["admin", "manager", "superadmin"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    InternalSecret,
    ServiceRoleJwt,
    ServiceKey,
    AdminSession,
}

impl AuthMethod {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InternalSecret => "internal_secret",
            Self::ServiceRoleJwt => "service_role_jwt",
            Self::ServiceKey => "service_key",
            Self::AdminSession => "admin_session",
        }
    }
}

pub async fn authorize(
    headers: &HeaderMap,
    config: &Config,
    store: &Arc<dyn IntegrationStore>,
) -> Option<AuthMethod> {
    if let (Some(presented), Some(expected)) = (
        headers
            .get(INTERNAL_SECRET_HEADER)
            .and_then(|value| value.to_str().ok()),
        config.internal_secret.as_deref(),
    ) && presented == expected
    {
        return Some(AuthMethod::InternalSecret);
    }

    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())?;

    if jwt_role(bearer).as_deref() == Some("service_role") {
        return Some(AuthMethod::ServiceRoleJwt);
    }

    if bearer == config.service_key {
        return Some(AuthMethod::ServiceKey);
    }

    // Session lookup fails closed: a store error here is a 401, not a 500.
    match store.resolve_session_role(bearer).await {
        Ok(Some(role)) if ADMIN_ROLES.contains(&role.as_str()) => Some(AuthMethod::AdminSession),
        Ok(_) => None,
        Err(error) => {
            tracing::warn!(%error, "session role lookup failed during authorization");
            None
        }
    }
}

/// Extract the `role` claim from an unverified JWT payload. The claim is only
/// trusted to *grant* service-role access because the downstream database
/// re-checks the key on every request; a forged token buys nothing.
fn jwt_role(token: &str) -> Option<String> {
    let payload = token.split('.').nth(1)?;
    let decoded = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Value = serde_json::from_slice(&decoded).ok()?;
    claims
        .get("role")
        .and_then(Value::as_str)
        .map(str::to_string)
}
