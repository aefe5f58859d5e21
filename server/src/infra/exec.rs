//! Exec stream abstraction over the cluster's native exec protocol

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::domain::session::TerminalSize;
use crate::error::Result;

/// Container an exec stream is opened against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecTarget {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

impl ExecTarget {
    pub fn new(
        namespace: impl Into<String>,
        pod: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            container: container.into(),
        }
    }
}

impl std::fmt::Display for ExecTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.pod, self.container)
    }
}

/// Exit status reported by the remote command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Failure(String),
    /// The stream ended without a status frame
    Unknown,
}

/// A live exec stream
pub struct ExecStream {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    /// Absent when the stream was opened with a tty
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    /// Out-of-band resize channel, present only with a tty
    pub resize: Option<mpsc::Sender<TerminalSize>>,
    /// Resolves once the remote command exits
    pub exit: BoxFuture<'static, ExitStatus>,
}

/// Opens exec streams into containers
#[async_trait]
pub trait ExecBackend: Send + Sync {
    async fn exec(&self, target: &ExecTarget, command: Vec<String>, tty: bool)
        -> Result<ExecStream>;
}
