//! Terminal service: personal terminal setup and interactive shells

use std::sync::Arc;

use tracing::info;

use crate::domain::identity::CallerIdentity;
use crate::error::{Error, Result};
use crate::infra::exec::ExecTarget;
use crate::infra::kube::ClusterClients;
use crate::infra::session_registry::SessionRegistry;
use crate::service::bridge::ExecStreamBridge;
use crate::service::injector::CredentialInjector;
use crate::service::provisioner::{TerminalPod, TerminalPodProvisioner};

/// Orchestrates terminal pods, credential delivery and shell sessions
pub struct TerminalService {
    clients: ClusterClients,
    provisioner: TerminalPodProvisioner,
    injector: CredentialInjector,
    bridge: Arc<ExecStreamBridge>,
    registry: Arc<SessionRegistry>,
    shells: Vec<String>,
}

impl TerminalService {
    pub fn new(
        clients: ClusterClients,
        provisioner: TerminalPodProvisioner,
        injector: CredentialInjector,
        bridge: Arc<ExecStreamBridge>,
        registry: Arc<SessionRegistry>,
        shells: Vec<String>,
    ) -> Self {
        Self {
            clients,
            provisioner,
            injector,
            bridge,
            registry,
            shells,
        }
    }

    /// Ensure the caller's terminal pod is ready and holds their credentials
    pub async fn create_personal_terminal(&self, identity: &CallerIdentity) -> Result<TerminalPod> {
        let claims = identity.claims()?;
        let uid = claims.service_account_uid()?;
        info!(
            "Preparing personal terminal for {}",
            claims.subject().unwrap_or(uid)
        );

        let pod = self.provisioner.provision(uid).await?;
        let material = self.clients.credential_material(identity)?;
        self.injector.inject(&pod.exec_target(), &material).await?;

        info!("Personal terminal {}/{} ready", pod.namespace, pod.name);
        Ok(pod)
    }

    /// Register a session for an interactive shell in `target` and start its
    /// bridge. The returned id is what the browser attaches with.
    pub fn open_shell(&self, target: ExecTarget, shell: Option<String>) -> Result<String> {
        let shells = match shell {
            Some(shell) if shell.trim().is_empty() => {
                return Err(Error::InvalidRequest("shell must not be empty".to_string()))
            }
            Some(shell) => vec![shell],
            None => self.shells.clone(),
        };

        let id = SessionRegistry::generate_id();
        let session = self.registry.create(&id)?;
        self.bridge.spawn(session, target, shells);
        Ok(id)
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use kube::Client;
    use secrecy::SecretString;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    use super::*;
    use crate::domain::identity::tests::token_with;
    use crate::infra::exec::fake::{FakeExecBackend, RemoteEnd};
    use crate::infra::exec::ExitStatus;
    use crate::infra::kube::MockPodApi;
    use crate::service::provisioner::tests::{pod_with_ready, settings};

    pub(crate) struct Fixture {
        pub service: Arc<TerminalService>,
        pub registry: Arc<SessionRegistry>,
        pub remotes: mpsc::UnboundedReceiver<RemoteEnd>,
        pub backend: Arc<FakeExecBackend>,
    }

    pub(crate) fn fixture(pods: MockPodApi) -> Fixture {
        fixture_with_attach_timeout(pods, Duration::from_secs(5))
    }

    pub(crate) fn fixture_with_attach_timeout(
        pods: MockPodApi,
        attach_timeout: Duration,
    ) -> Fixture {
        let mut api_config = kube::Config::new("https://172.18.0.2:5443".parse().unwrap());
        api_config.accept_invalid_certs = true;
        let host = Client::try_from(kube::Config::new("https://10.0.0.1:6443".parse().unwrap()))
            .expect("client from static config");
        let clients = ClusterClients::new(host, api_config);

        let (backend, remotes) = FakeExecBackend::new();
        let backend = Arc::new(backend);
        let registry = Arc::new(SessionRegistry::new());

        let service = Arc::new(TerminalService::new(
            clients,
            TerminalPodProvisioner::new(Arc::new(pods), settings()),
            CredentialInjector::new(backend.clone()),
            Arc::new(
                ExecStreamBridge::new(registry.clone(), backend.clone(), attach_timeout)
                    .with_start_grace(Duration::from_millis(50)),
            ),
            registry.clone(),
            vec!["bash".to_string(), "sh".to_string()],
        ));

        Fixture {
            service,
            registry,
            remotes,
            backend,
        }
    }

    pub(crate) fn ready_pods() -> MockPodApi {
        let mut pods = MockPodApi::new();
        pods.expect_get()
            .returning(|_, name| Ok(Some(pod_with_ready(&name.to_string(), true))));
        pods
    }

    pub(crate) fn caller(uid: &str) -> CallerIdentity {
        CallerIdentity::new(SecretString::from(token_with(serde_json::json!({
            "kubernetes.io/serviceaccount/service-account.uid": uid,
            "sub": "system:serviceaccount:karmada-system:alice",
        }))))
    }

    /// Accept one injection and report success
    pub(crate) async fn accept_injection(remote: &mut RemoteEnd) -> String {
        let mut received = Vec::new();
        remote.stdin.read_to_end(&mut received).await.unwrap();
        if let Some(mut stderr) = remote.stderr.take() {
            stderr.shutdown().await.unwrap();
        }
        String::from_utf8(received).unwrap()
    }

    #[tokio::test]
    async fn test_personal_terminal_end_to_end() {
        let Fixture {
            service,
            mut remotes,
            ..
        } = fixture(ready_pods());
        let identity = caller("abc");

        let remote = tokio::spawn(async move {
            let mut remote = remotes.recv().await.unwrap();
            let descriptor = accept_injection(&mut remote).await;
            let target = remote.target.clone();
            let _ = remote.exit.send(ExitStatus::Success);
            (target, descriptor)
        });

        let pod = service.create_personal_terminal(&identity).await.unwrap();
        assert_eq!(pod.name, "ttyd-abc");

        let (target, descriptor) = remote.await.unwrap();
        assert_eq!(target, ExecTarget::new("karmada-system", "ttyd-abc", "ttyd-abc"));
        assert!(descriptor.contains("https://172.18.0.2:5443"));
        assert!(descriptor.contains("insecure-skip-tls-verify: true"));
    }

    #[tokio::test]
    async fn test_missing_uid_claim_provisions_nothing() {
        let mut pods = MockPodApi::new();
        pods.expect_get().never();
        pods.expect_create().never();
        let f = fixture(pods);

        let identity = CallerIdentity::new(SecretString::from(token_with(
            serde_json::json!({ "sub": "alice" }),
        )));
        let err = f.service.create_personal_terminal(&identity).await.unwrap_err();
        assert!(matches!(err, Error::MissingClaim(_)));
    }

    #[tokio::test]
    async fn test_open_shell_registers_pending_session() {
        let f = fixture(MockPodApi::new());
        let target = ExecTarget::new("default", "nginx", "nginx");

        let first = f.service.open_shell(target.clone(), None).unwrap();
        let second = f.service.open_shell(target, Some("zsh".to_string())).unwrap();
        assert_ne!(first, second);
        assert_eq!(f.service.session_count(), 2);
        assert!(f.registry.get(&first).is_ok());

        assert!(matches!(
            f.service.open_shell(ExecTarget::new("a", "b", "c"), Some(" ".to_string())),
            Err(Error::InvalidRequest(_))
        ));
    }
}
