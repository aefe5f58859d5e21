//! Caller identity claims carried by bearer tokens

use std::collections::HashMap;

use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use crate::error::{Error, Result};

/// Legacy flat claim holding the service account uid
const SERVICE_ACCOUNT_UID_CLAIM: &str = "kubernetes.io/serviceaccount/service-account.uid";

/// Who is calling, as presented on the inbound request
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub token: SecretString,
    pub impersonate_user: Option<String>,
    pub impersonate_groups: Vec<String>,
    pub impersonate_extra: HashMap<String, Vec<String>>,
}

impl CallerIdentity {
    pub fn new(token: SecretString) -> Self {
        Self {
            token,
            impersonate_user: None,
            impersonate_groups: Vec::new(),
            impersonate_extra: HashMap::new(),
        }
    }

    /// Decode the claims of the bearer token
    pub fn claims(&self) -> Result<TokenClaims> {
        TokenClaims::parse(self.token.expose_secret())
    }
}

/// Decoded payload of a service account JWT.
///
/// The signature is not verified here: the token is only trusted by the
/// cluster API it is forwarded to.
#[derive(Debug, Clone)]
pub struct TokenClaims {
    payload: serde_json::Map<String, Value>,
}

impl TokenClaims {
    /// Decode the payload segment of a `header.payload.signature` token
    pub fn parse(token: &str) -> Result<Self> {
        let segments: Vec<&str> = token.split('.').collect();
        if segments.len() != 3 {
            return Err(Error::Unauthorized("invalid token".to_string()));
        }

        let raw = segments[1].trim_end_matches('=');
        let decoded = URL_SAFE_NO_PAD
            .decode(raw)
            .or_else(|_| STANDARD_NO_PAD.decode(raw))
            .map_err(|e| Error::Unauthorized(format!("failed to decode token: {}", e)))?;

        match serde_json::from_slice::<Value>(&decoded) {
            Ok(Value::Object(payload)) => Ok(Self { payload }),
            Ok(_) => Err(Error::Unauthorized("token payload is not an object".to_string())),
            Err(e) => Err(Error::Unauthorized(format!("failed to unmarshal token: {}", e))),
        }
    }

    /// Uid of the service account the token was issued for.
    ///
    /// Reads the legacy flat claim first, then the projected-token form
    /// `{"kubernetes.io": {"serviceaccount": {"uid": ...}}}`.
    pub fn service_account_uid(&self) -> Result<&str> {
        if let Some(Value::String(uid)) = self.payload.get(SERVICE_ACCOUNT_UID_CLAIM) {
            return Ok(uid);
        }

        self.payload
            .get("kubernetes.io")
            .and_then(|v| v.get("serviceaccount"))
            .and_then(|v| v.get("uid"))
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MissingClaim(SERVICE_ACCOUNT_UID_CLAIM.to_string()))
    }

    /// Subject of the token, if any
    pub fn subject(&self) -> Option<&str> {
        self.payload.get("sub").and_then(Value::as_str)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build an unsigned token around a JSON payload
    pub(crate) fn token_with(payload: Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","kid":"test"}"#);
        let body = URL_SAFE_NO_PAD.encode(payload.to_string());
        format!("{}.{}.c2lnbmF0dXJl", header, body)
    }

    #[test]
    fn test_legacy_claim() {
        let token = token_with(serde_json::json!({
            "iss": "kubernetes/serviceaccount",
            "kubernetes.io/serviceaccount/service-account.uid": "4ac87008-3426-4cae-8f3c-141e03a0e34b",
            "sub": "system:serviceaccount:karmada-system:karmada-dashboard",
        }));

        let claims = TokenClaims::parse(&token).unwrap();
        assert_eq!(
            claims.service_account_uid().unwrap(),
            "4ac87008-3426-4cae-8f3c-141e03a0e34b"
        );
        assert_eq!(
            claims.subject(),
            Some("system:serviceaccount:karmada-system:karmada-dashboard")
        );
    }

    #[test]
    fn test_projected_claim() {
        let token = token_with(serde_json::json!({
            "kubernetes.io": {
                "namespace": "karmada-system",
                "serviceaccount": { "name": "admin", "uid": "0d5d4a7e-0000-4000-8000-000000000001" }
            }
        }));

        let claims = TokenClaims::parse(&token).unwrap();
        assert_eq!(
            claims.service_account_uid().unwrap(),
            "0d5d4a7e-0000-4000-8000-000000000001"
        );
    }

    #[test]
    fn test_standard_alphabet_payload() {
        let header = STANDARD_NO_PAD.encode(b"{}");
        let body = STANDARD_NO_PAD.encode(br#"{"kubernetes.io/serviceaccount/service-account.uid":"abc"}"#);
        let claims = TokenClaims::parse(&format!("{}.{}.sig", header, body)).unwrap();
        assert_eq!(claims.service_account_uid().unwrap(), "abc");
    }

    #[test]
    fn test_missing_claim() {
        let token = token_with(serde_json::json!({ "sub": "alice" }));
        let err = TokenClaims::parse(&token).unwrap().service_account_uid().unwrap_err();
        assert!(matches!(err, Error::MissingClaim(_)));
    }

    #[test]
    fn test_malformed_tokens() {
        assert!(matches!(TokenClaims::parse("opaque"), Err(Error::Unauthorized(_))));
        assert!(matches!(TokenClaims::parse("a.%%%.c"), Err(Error::Unauthorized(_))));

        let not_object = format!("a.{}.c", URL_SAFE_NO_PAD.encode("[1,2]"));
        assert!(matches!(TokenClaims::parse(&not_object), Err(Error::Unauthorized(_))));
    }
}
