//! Minimal single-cluster access descriptor (kubeconfig) for terminal pods

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Name shared by the cluster, user and context entries
pub const DESCRIPTOR_ENTRY_NAME: &str = "karmada-apiserver";

/// How the descriptor's consumer should trust the API server certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsTrust {
    /// PEM-encoded CA bundle
    CaData(Vec<u8>),
    /// Skip certificate verification
    InsecureSkipVerify,
    /// Use the system trust store
    SystemRoots,
}

impl TlsTrust {
    /// Build a CA trust from DER certificates, re-encoding them as PEM
    pub fn from_der_certs(certs: &[Vec<u8>]) -> Self {
        if certs.is_empty() {
            return TlsTrust::SystemRoots;
        }

        let mut pem = String::new();
        for der in certs {
            pem.push_str("-----BEGIN CERTIFICATE-----\n");
            let encoded = STANDARD.encode(der);
            for line in encoded.as_bytes().chunks(64) {
                pem.push_str(&String::from_utf8_lossy(line));
                pem.push('\n');
            }
            pem.push_str("-----END CERTIFICATE-----\n");
        }
        TlsTrust::CaData(pem.into_bytes())
    }
}

/// Identity the caller acts as on the control plane
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Impersonation {
    pub user: Option<String>,
    pub groups: Vec<String>,
    pub extra: BTreeMap<String, Vec<String>>,
}

/// In-memory credential material for one request. Never persisted.
pub struct CredentialMaterial {
    pub server: String,
    pub trust: TlsTrust,
    pub token: SecretString,
    pub impersonation: Impersonation,
}

impl std::fmt::Debug for CredentialMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialMaterial")
            .field("server", &self.server)
            .field("trust", &self.trust)
            .field("token", &"[REDACTED]")
            .field("impersonation", &self.impersonation)
            .finish()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Kubeconfig {
    #[serde(rename = "apiVersion")]
    api_version: String,
    kind: String,
    clusters: Vec<NamedCluster>,
    users: Vec<NamedUser>,
    contexts: Vec<NamedContext>,
    #[serde(rename = "current-context")]
    current_context: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: Cluster,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Cluster {
    server: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    insecure_skip_tls_verify: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    certificate_authority_data: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NamedUser {
    name: String,
    user: User,
}

#[derive(Debug, Serialize, Deserialize)]
struct User {
    token: String,
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    impersonate: Option<String>,
    #[serde(rename = "as-groups", default, skip_serializing_if = "Vec::is_empty")]
    impersonate_groups: Vec<String>,
    #[serde(
        rename = "as-user-extra",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    impersonate_extra: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NamedContext {
    name: String,
    context: Context,
}

#[derive(Debug, Serialize, Deserialize)]
struct Context {
    cluster: String,
    user: String,
}

impl CredentialMaterial {
    /// Render the descriptor. The output embeds the live token.
    pub fn render(&self) -> Result<SecretString> {
        let (insecure_skip_tls_verify, certificate_authority_data) = match &self.trust {
            TlsTrust::InsecureSkipVerify => (Some(true), None),
            TlsTrust::CaData(pem) => (None, Some(STANDARD.encode(pem))),
            TlsTrust::SystemRoots => (None, None),
        };

        let doc = Kubeconfig {
            api_version: "v1".to_string(),
            kind: "Config".to_string(),
            clusters: vec![NamedCluster {
                name: DESCRIPTOR_ENTRY_NAME.to_string(),
                cluster: Cluster {
                    server: self.server.clone(),
                    insecure_skip_tls_verify,
                    certificate_authority_data,
                },
            }],
            users: vec![NamedUser {
                name: DESCRIPTOR_ENTRY_NAME.to_string(),
                user: User {
                    token: self.token.expose_secret().to_string(),
                    impersonate: self.impersonation.user.clone(),
                    impersonate_groups: self.impersonation.groups.clone(),
                    impersonate_extra: self.impersonation.extra.clone(),
                },
            }],
            contexts: vec![NamedContext {
                name: DESCRIPTOR_ENTRY_NAME.to_string(),
                context: Context {
                    cluster: DESCRIPTOR_ENTRY_NAME.to_string(),
                    user: DESCRIPTOR_ENTRY_NAME.to_string(),
                },
            }],
            current_context: DESCRIPTOR_ENTRY_NAME.to_string(),
        };

        Ok(SecretString::from(serde_yaml::to_string(&doc)?))
    }
}
