//! Kubernetes client plumbing

use async_trait::async_trait;
use futures::{FutureExt, Sink, SinkExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, AttachedProcess, PostParams};
use kube::config::{AuthInfo, KubeConfigOptions, Kubeconfig};
use kube::Client;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::domain::descriptor::{CredentialMaterial, Impersonation, TlsTrust};
use crate::domain::identity::CallerIdentity;
use crate::domain::session::TerminalSize;
use crate::error::{Error, Result};
use crate::infra::exec::{ExecBackend, ExecStream, ExecTarget, ExitStatus};
use crate::Config;

/// Result of a pod create call
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    Created(Pod),
    AlreadyExists,
}

/// Pod operations needed to provision terminal pods
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PodApi: Send + Sync {
    /// Fetch a pod, `None` if it does not exist
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    /// Create a pod, reporting a name conflict as `AlreadyExists`
    async fn create(&self, namespace: &str, pod: &Pod) -> Result<CreateOutcome>;
}

/// Clients for the clusters the terminal subsystem talks to
#[derive(Clone)]
pub struct ClusterClients {
    /// Cluster hosting terminal pods, authenticated as this server
    host: Client,
    /// Control-plane API callers authenticate against
    api_config: kube::Config,
}

impl ClusterClients {
    /// Load both cluster configurations
    pub async fn load(config: &Config) -> Result<Self> {
        let host_config = load_kube_config(
            config.host_kubeconfig.as_deref(),
            config.host_context.as_deref(),
        )
        .await?;

        let api_config = match config.api_kubeconfig.as_deref() {
            Some(path) => load_kube_config(Some(path), config.api_context.as_deref()).await?,
            None => host_config.clone(),
        };

        info!("Host cluster: {}", host_config.cluster_url);
        info!("Control-plane API: {}", api_config.cluster_url);

        Ok(Self::new(Client::try_from(host_config)?, api_config))
    }

    pub fn new(host: Client, api_config: kube::Config) -> Self {
        Self { host, api_config }
    }

    /// Client for the cluster hosting terminal pods
    pub fn host(&self) -> Client {
        self.host.clone()
    }

    /// Control-plane configuration authenticated as the caller
    pub fn config_for(&self, identity: &CallerIdentity) -> kube::Config {
        let mut config = self.api_config.clone();
        config.auth_info = AuthInfo {
            token: Some(identity.token.clone()),
            impersonate: identity.impersonate_user.clone(),
            impersonate_groups: if identity.impersonate_groups.is_empty() {
                None
            } else {
                Some(identity.impersonate_groups.clone())
            },
            ..Default::default()
        };
        config
    }

    /// Credential material letting the caller reach the control plane
    pub fn credential_material(&self, identity: &CallerIdentity) -> Result<CredentialMaterial> {
        let config = self.config_for(identity);
        let token = config
            .auth_info
            .token
            .clone()
            .ok_or_else(|| Error::Unauthorized("missing bearer token".to_string()))?;

        let trust = if config.accept_invalid_certs {
            TlsTrust::InsecureSkipVerify
        } else {
            TlsTrust::from_der_certs(config.root_cert.as_deref().unwrap_or(&[]))
        };

        let impersonation = Impersonation {
            user: config.auth_info.impersonate.clone(),
            groups: config.auth_info.impersonate_groups.clone().unwrap_or_default(),
            extra: identity
                .impersonate_extra
                .iter()
                .map(|(key, values)| (key.clone(), values.clone()))
                .collect(),
        };
        if let Some(user) = &impersonation.user {
            debug!("Descriptor acts as {} in {:?}", user, impersonation.groups);
        }

        Ok(CredentialMaterial {
            server: config.cluster_url.to_string().trim_end_matches('/').to_string(),
            trust,
            token,
            impersonation,
        })
    }
}

async fn load_kube_config(path: Option<&str>, context: Option<&str>) -> Result<kube::Config> {
    let options = KubeConfigOptions {
        context: context.map(str::to_string),
        ..Default::default()
    };

    match path {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .map_err(|e| Error::Kube(format!("failed to read {}: {}", path, e)))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .map_err(|e| Error::Kube(e.to_string()))
        }
        None if context.is_some() => kube::Config::from_kubeconfig(&options)
            .await
            .map_err(|e| Error::Kube(e.to_string())),
        None => kube::Config::infer()
            .await
            .map_err(|e| Error::Kube(e.to_string())),
    }
}

/// Pod API backed by a live cluster
pub struct KubePodApi {
    client: Client,
}

impl KubePodApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodApi for KubePodApi {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(pods.get_opt(name).await?)
    }

    async fn create(&self, namespace: &str, pod: &Pod) -> Result<CreateOutcome> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match pods.create(&PostParams::default(), pod).await {
            Ok(created) => Ok(CreateOutcome::Created(created)),
            Err(kube::Error::Api(resp)) if resp.code == 409 => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(e.into()),
        }
    }
}

/// Exec backend using the cluster's websocket exec subresource
pub struct KubeExecBackend {
    client: Client,
}

impl KubeExecBackend {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Aborts the exec task if the stream is dropped before it finishes
struct ProcessGuard(Option<AttachedProcess>);

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if let Some(process) = &self.0 {
            process.abort();
        }
    }
}

#[async_trait]
impl ExecBackend for KubeExecBackend {
    async fn exec(
        &self,
        target: &ExecTarget,
        command: Vec<String>,
        tty: bool,
    ) -> Result<ExecStream> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);
        let params = AttachParams::default()
            .container(target.container.clone())
            .stdin(true)
            .stdout(true)
            .stderr(!tty)
            .tty(tty);

        debug!("Opening exec stream to {} (tty: {})", target, tty);
        let mut process = pods
            .exec(&target.pod, command, &params)
            .await
            .map_err(|e| Error::Stream(e.to_string()))?;

        let stdin = process
            .stdin()
            .ok_or_else(|| Error::Stream("exec stream has no stdin".to_string()))?;
        let stdout = process
            .stdout()
            .ok_or_else(|| Error::Stream("exec stream has no stdout".to_string()))?;
        let stderr = process
            .stderr()
            .map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>);
        let resize = process.terminal_size().map(forward_resize);
        let status = process.take_status();

        let mut guard = ProcessGuard(Some(process));
        let exit = async move {
            let status = match status {
                Some(status) => status.await,
                None => None,
            };
            if let Some(process) = guard.0.take() {
                let _ = process.join().await;
            }

            match status {
                Some(s) if s.status.as_deref() == Some("Success") => ExitStatus::Success,
                Some(s) => ExitStatus::Failure(
                    s.message
                        .or(s.reason)
                        .unwrap_or_else(|| "command failed".to_string()),
                ),
                None => ExitStatus::Unknown,
            }
        }
        .boxed();

        Ok(ExecStream {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr,
            resize,
            exit,
        })
    }
}

/// Relay resize events into the exec stream's size channel
fn forward_resize<S>(mut sink: S) -> mpsc::Sender<TerminalSize>
where
    S: Sink<kube::api::TerminalSize> + Send + Unpin + 'static,
{
    let (tx, mut rx) = mpsc::channel::<TerminalSize>(16);
    tokio::spawn(async move {
        while let Some(size) = rx.recv().await {
            let size = kube::api::TerminalSize {
                width: size.cols,
                height: size.rows,
            };
            if sink.send(size).await.is_err() {
                break;
            }
        }
    });
    tx
}
