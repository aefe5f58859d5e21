//! Personal terminal pod provisioning

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use sha2::{Digest, Sha256};
use tokio::time::{sleep, timeout};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::infra::exec::ExecTarget;
use crate::infra::kube::{CreateOutcome, PodApi};
use crate::Config;

/// Prefix of every terminal pod name
const POD_NAME_PREFIX: &str = "ttyd-";

/// Longest pod name that is still a valid DNS label
const MAX_POD_NAME_LEN: usize = 63;

/// Port the terminal image listens on
const TERMINAL_PORT: u16 = 7681;

/// Settings shaping terminal pods
#[derive(Debug, Clone)]
pub struct TerminalPodSettings {
    pub namespace: String,
    pub image: String,
    pub service_account: String,
    pub image_pull_secrets: Vec<String>,
    pub poll_interval: Duration,
    pub ready_timeout: Duration,
}

impl From<&Config> for TerminalPodSettings {
    fn from(config: &Config) -> Self {
        Self {
            namespace: config.terminal_namespace.clone(),
            image: config.terminal_image.clone(),
            service_account: config.terminal_service_account.clone(),
            image_pull_secrets: config.terminal_image_pull_secrets.clone(),
            poll_interval: config.readiness_poll_interval(),
            ready_timeout: config.readiness_timeout(),
        }
    }
}

/// A provisioned, ready terminal pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalPod {
    pub name: String,
    pub namespace: String,
    pub container: String,
}

impl TerminalPod {
    pub fn exec_target(&self) -> ExecTarget {
        ExecTarget::new(&self.namespace, &self.name, &self.container)
    }
}

/// Derive the terminal pod name for a service account uid.
///
/// Uids that already form a valid DNS label are kept readable; anything else
/// is hashed.
pub fn terminal_pod_name(uid: &str) -> String {
    let fits = !uid.is_empty()
        && POD_NAME_PREFIX.len() + uid.len() <= MAX_POD_NAME_LEN
        && uid
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !uid.ends_with('-');

    if fits {
        format!("{}{}", POD_NAME_PREFIX, uid)
    } else {
        let digest = hex::encode(Sha256::digest(uid.as_bytes()));
        format!("{}{}", POD_NAME_PREFIX, &digest[..16])
    }
}

/// Check the pod's Ready condition
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Creates or adopts the caller's terminal pod and waits for it to be ready
pub struct TerminalPodProvisioner {
    pods: Arc<dyn PodApi>,
    settings: TerminalPodSettings,
}

impl TerminalPodProvisioner {
    pub fn new(pods: Arc<dyn PodApi>, settings: TerminalPodSettings) -> Self {
        Self { pods, settings }
    }

    /// Build the pod manifest for a given pod name
    pub fn build_pod(&self, name: &str) -> Result<Pod> {
        let pull_secrets: Vec<serde_json::Value> = self
            .settings
            .image_pull_secrets
            .iter()
            .map(|secret| serde_json::json!({ "name": secret }))
            .collect();

        let probe = serde_json::json!({
            "tcpSocket": { "port": TERMINAL_PORT },
            "initialDelaySeconds": 5,
            "periodSeconds": 10,
            "failureThreshold": 3,
        });

        let manifest = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": name,
                "namespace": self.settings.namespace,
                "labels": {
                    "app.kubernetes.io/managed-by": "karmada-dashboard",
                    "app.kubernetes.io/component": "terminal",
                },
            },
            "spec": {
                "serviceAccountName": self.settings.service_account,
                "imagePullSecrets": pull_secrets,
                "containers": [{
                    "name": name,
                    "image": self.settings.image,
                    "imagePullPolicy": "IfNotPresent",
                    "ports": [{
                        "name": "tcp",
                        "containerPort": TERMINAL_PORT,
                        "protocol": "TCP",
                    }],
                    "livenessProbe": probe,
                    "readinessProbe": probe,
                }],
            },
        });

        serde_json::from_value(manifest)
            .map_err(|e| Error::Internal(format!("invalid terminal pod manifest: {}", e)))
    }

    /// Ensure the terminal pod for `uid` exists and is ready
    pub async fn provision(&self, uid: &str) -> Result<TerminalPod> {
        let name = terminal_pod_name(uid);
        let namespace = &self.settings.namespace;

        let existing = self
            .pods
            .get(namespace, &name)
            .await
            .map_err(|e| Error::Provisioning(e.to_string()))?;

        if existing.is_some() {
            info!("Reusing terminal pod {}/{}", namespace, name);
        } else {
            let pod = self.build_pod(&name)?;
            match self.pods.create(namespace, &pod).await {
                Ok(CreateOutcome::Created(created)) => info!(
                    "Created terminal pod {}/{} (uid {})",
                    namespace,
                    name,
                    created.metadata.uid.as_deref().unwrap_or("pending")
                ),
                Ok(CreateOutcome::AlreadyExists) => {
                    info!("Terminal pod {}/{} created concurrently, reusing", namespace, name)
                }
                Err(e) => return Err(Error::Provisioning(e.to_string())),
            }
        }

        self.wait_ready(&name).await?;

        Ok(TerminalPod {
            container: name.clone(),
            name,
            namespace: namespace.clone(),
        })
    }

    /// Poll until the pod reports Ready, bounded by the readiness deadline
    async fn wait_ready(&self, name: &str) -> Result<()> {
        let namespace = &self.settings.namespace;

        let poll = async {
            loop {
                match self.pods.get(namespace, name).await {
                    Ok(Some(pod)) if is_pod_ready(&pod) => return Ok(()),
                    Ok(Some(_)) => debug!("Terminal pod {}/{} not ready yet", namespace, name),
                    Ok(None) => debug!("Terminal pod {}/{} not visible yet", namespace, name),
                    Err(e) => return Err(Error::Provisioning(e.to_string())),
                }
                sleep(self.settings.poll_interval).await;
            }
        };

        match timeout(self.settings.ready_timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(Error::ReadinessTimeout {
                pod: name.to_string(),
                seconds: self.settings.ready_timeout.as_secs(),
            }),
        }
    }
}
