//! Delivery of the caller's access descriptor into a terminal pod

use std::sync::Arc;
use std::time::Duration;

use secrecy::ExposeSecret;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::domain::descriptor::CredentialMaterial;
use crate::error::{Error, Result};
use crate::infra::exec::{ExecBackend, ExecStream, ExecTarget, ExitStatus};

/// Deadline for a whole delivery
const INJECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest stderr excerpt carried in an error
const MAX_STDERR_LEN: usize = 512;

/// Writes access descriptors into terminal pods over the exec channel
pub struct CredentialInjector {
    exec: Arc<dyn ExecBackend>,
}

impl CredentialInjector {
    pub fn new(exec: Arc<dyn ExecBackend>) -> Self {
        Self { exec }
    }

    /// Remote command storing exactly `len` bytes of stdin as the kubeconfig
    fn command(len: usize) -> Vec<String> {
        vec![
            "sh".to_string(),
            "-c".to_string(),
            format!(
                "umask 077 && mkdir -p ~/.kube && head -c {} > ~/.kube/config",
                len
            ),
        ]
    }

    /// Render the descriptor for `material` and write it into `target`.
    ///
    /// Overwrites any previous descriptor, so repeated calls leave exactly one.
    pub async fn inject(&self, target: &ExecTarget, material: &CredentialMaterial) -> Result<()> {
        let descriptor = material
            .render()
            .map_err(|e| Error::Injection(e.to_string()))?;
        let payload = descriptor.expose_secret().as_bytes();

        let stream = self
            .exec
            .exec(target, Self::command(payload.len()), false)
            .await
            .map_err(|e| Error::Injection(e.to_string()))?;

        match timeout(INJECT_TIMEOUT, deliver(stream, payload)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::Injection(format!(
                    "no exit status from {} after {}s",
                    target,
                    INJECT_TIMEOUT.as_secs()
                )))
            }
        }

        info!("Access descriptor delivered to {}", target);
        Ok(())
    }
}

/// Feed the payload, drain the outputs and wait for the exit status
async fn deliver(stream: ExecStream, payload: &[u8]) -> Result<()> {
    let ExecStream {
        mut stdin,
        stdout,
        stderr,
        exit,
        ..
    } = stream;

    let feed = async {
        stdin.write_all(payload).await?;
        stdin.shutdown().await?;
        Ok::<_, std::io::Error>(())
    };

    let (fed, out, err) = tokio::join!(feed, drain(Some(stdout)), drain(stderr));
    let status = exit.await;

    let stderr = String::from_utf8_lossy(&err);
    let stderr = stderr.trim();
    debug!("Injection finished: {} stdout bytes", out.len());

    match status {
        ExitStatus::Success => {}
        ExitStatus::Failure(message) => {
            let detail = if stderr.is_empty() { message } else { truncate(stderr) };
            return Err(Error::Injection(detail));
        }
        ExitStatus::Unknown => {
            return Err(Error::Injection(
                "exec stream closed without an exit status".to_string(),
            ))
        }
    }

    // A successful exit after a short write is still a failed delivery
    fed.map_err(|e| Error::Injection(format!("failed to write descriptor: {}", e)))
}

async fn drain(reader: Option<Box<dyn AsyncRead + Send + Unpin>>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        let _ = reader.read_to_end(&mut buf).await;
    }
    buf
}

fn truncate(text: &str) -> String {
    match text.char_indices().nth(MAX_STDERR_LEN) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
