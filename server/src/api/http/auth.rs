//! Caller identity extraction

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;
use secrecy::SecretString;

use crate::domain::identity::CallerIdentity;
use crate::error::{Error, Result};

const IMPERSONATE_USER: &str = "impersonate-user";
const IMPERSONATE_GROUP: &str = "impersonate-group";
const IMPERSONATE_EXTRA_PREFIX: &str = "impersonate-extra-";

impl<S> FromRequestParts<S> for CallerIdentity
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|e| Error::Unauthorized(e.to_string()))?;

        let token = bearer.token().trim();
        if token.is_empty() {
            return Err(Error::Unauthorized("empty bearer token".to_string()));
        }

        let mut identity = CallerIdentity::new(SecretString::from(token.to_string()));
        apply_impersonation(&mut identity, &parts.headers);
        Ok(identity)
    }
}

/// Copy impersonation headers. Groups and extras only apply with a user.
fn apply_impersonation(identity: &mut CallerIdentity, headers: &HeaderMap) {
    let user = headers
        .get(IMPERSONATE_USER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let Some(user) = user else {
        return;
    };
    identity.impersonate_user = Some(user.to_string());

    identity.impersonate_groups = headers
        .get_all(IMPERSONATE_GROUP)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::to_string)
        .collect();

    for (name, value) in headers {
        let Some(key) = name.as_str().strip_prefix(IMPERSONATE_EXTRA_PREFIX) else {
            continue;
        };
        if let Ok(value) = value.to_str() {
            identity
                .impersonate_extra
                .entry(key.to_string())
                .or_default()
                .push(value.to_string());
        }
    }
}
