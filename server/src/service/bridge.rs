//! Bridge between a browser-facing session and a container exec stream

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, trace, warn};

use crate::domain::session::{Attachment, Outbound, TerminalSession, TerminalSize};
use crate::error::{Error, Result};
use crate::infra::exec::{ExecBackend, ExecStream, ExecTarget, ExitStatus};
use crate::infra::session_registry::SessionRegistry;

/// Read buffer for exec output
const OUTPUT_CHUNK_SIZE: usize = 8192;

/// How long to wait for the exit status once stdout has closed
const EXIT_GRACE: Duration = Duration::from_secs(1);

/// How long a freshly opened shell may stay silent before it counts as started
const START_GRACE: Duration = Duration::from_secs(2);

/// An exec stream whose shell is known to have started
struct StartedShell {
    stream: ExecStream,
    /// Output read while waiting for the shell to start
    first_output: Option<Bytes>,
}

/// Runs one task per session moving bytes between transport and exec stream
pub struct ExecStreamBridge {
    registry: Arc<SessionRegistry>,
    exec: Arc<dyn ExecBackend>,
    attach_timeout: Duration,
    start_grace: Duration,
}

impl ExecStreamBridge {
    pub fn new(
        registry: Arc<SessionRegistry>,
        exec: Arc<dyn ExecBackend>,
        attach_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            exec,
            attach_timeout,
            start_grace: START_GRACE,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_start_grace(mut self, start_grace: Duration) -> Self {
        self.start_grace = start_grace;
        self
    }

    /// Start serving `session` in the background.
    ///
    /// The session is removed from the registry when the task ends, whatever
    /// the outcome. A failure stays visible to transports that attach later.
    pub fn spawn(
        self: &Arc<Self>,
        session: Arc<TerminalSession>,
        target: ExecTarget,
        shells: Vec<String>,
    ) -> JoinHandle<()> {
        let bridge = self.clone();
        tokio::spawn(async move {
            let id = session.id().to_string();
            match bridge.run(&session, &target, &shells).await {
                Ok(()) => {
                    info!("Terminal session {} finished", id);
                    bridge.registry.delete(&id).await;
                }
                Err(e) => {
                    if e.is_stream_failure() {
                        warn!("Terminal session {} ended: {}", id, e);
                    } else {
                        info!("Terminal session {} ended: {}", id, e);
                    }
                    bridge.registry.retire(&id, e).await;
                }
            }
        })
    }

    async fn run(
        &self,
        session: &TerminalSession,
        target: &ExecTarget,
        shells: &[String],
    ) -> Result<()> {
        let id = session.id();
        let bound = session
            .take_bound_signal()
            .await
            .ok_or_else(|| Error::SessionAlreadyBound(id.to_string()))?;
        let mut resize_events = session
            .take_resize_events()
            .await
            .ok_or_else(|| Error::SessionAlreadyBound(id.to_string()))?;

        let attachment = match timeout(self.attach_timeout, bound).await {
            Ok(Ok(signal)) => signal?,
            Ok(Err(_)) => return Err(Error::SessionClosed(id.to_string())),
            Err(_) => {
                let err = Error::AttachTimeout {
                    session: id.to_string(),
                    seconds: self.attach_timeout.as_secs(),
                };
                session.close(Some(err.clone())).await;
                return Err(err);
            }
        };
        info!("Terminal session {} bound to {}", id, target);

        let Attachment { input, output } = attachment;
        let result = match self.open_shell(target, shells).await {
            Ok(shell) => pump(shell, input, &output, &mut resize_events).await,
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            let _ = output.send(Outbound::Error(e.to_string())).await;
        }
        result
    }

    /// Open an interactive exec with the first shell that starts
    async fn open_shell(&self, target: &ExecTarget, shells: &[String]) -> Result<StartedShell> {
        let mut last_error = None;

        for shell in shells {
            match self.start_shell(target, shell).await {
                Ok(started) => {
                    debug!("Started {} in {}", shell, target);
                    return Ok(started);
                }
                Err(e) => {
                    warn!("Failed to start {} in {}: {}", shell, target, e);
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(Error::Stream(msg)) => Error::Stream(msg),
            Some(e) => Error::Stream(e.to_string()),
            None => Error::InvalidRequest("no shell to start".to_string()),
        })
    }

    /// Open `shell` and wait until it prints, exits or stays quiet for the
    /// start grace. A missing binary is reported by the cluster only through
    /// the exit status, so a failed exit before any output is a start failure.
    async fn start_shell(&self, target: &ExecTarget, shell: &str) -> Result<StartedShell> {
        let ExecStream {
            stdin,
            mut stdout,
            stderr,
            resize,
            exit,
        } = self.exec.exec(target, vec![shell.to_string()], true).await?;
        let exit = exit.shared();

        let mut buf = vec![0u8; OUTPUT_CHUNK_SIZE];
        let first_output = tokio::select! {
            biased;
            read = stdout.read(&mut buf) => match read? {
                0 => match timeout(EXIT_GRACE, exit.clone()).await {
                    Ok(ExitStatus::Failure(message)) => return Err(Error::Stream(message)),
                    _ => None,
                },
                n => Some(Bytes::copy_from_slice(&buf[..n])),
            },
            status = exit.clone() => {
                if let ExitStatus::Failure(message) = status {
                    return Err(Error::Stream(message));
                }
                None
            }
            _ = sleep(self.start_grace) => None,
        };

        Ok(StartedShell {
            stream: ExecStream {
                stdin,
                stdout,
                stderr,
                resize,
                exit: exit.boxed(),
            },
            first_output,
        })
    }
}

/// Move bytes both ways until either side closes
async fn pump(
    shell: StartedShell,
    mut input: mpsc::Receiver<Bytes>,
    output: &mpsc::Sender<Outbound>,
    resize_events: &mut mpsc::UnboundedReceiver<TerminalSize>,
) -> Result<()> {
    let StartedShell {
        stream:
            ExecStream {
                mut stdin,
                mut stdout,
                stderr,
                resize,
                exit,
            },
        first_output,
    } = shell;

    if let Some(data) = first_output {
        if output.send(Outbound::Data(data)).await.is_err() {
            return Ok(());
        }
    }

    // Resize events are polled first so a resize queued before a keystroke
    // reaches the remote before it
    let upstream = async {
        loop {
            tokio::select! {
                biased;
                Some(size) = resize_events.recv() => {
                    trace!("Resize to {}x{}", size.cols, size.rows);
                    if let Some(resize) = &resize {
                        let _ = resize.send(size).await;
                    }
                }
                data = input.recv() => match data {
                    Some(data) => {
                        stdin.write_all(&data).await?;
                        stdin.flush().await?;
                    }
                    None => return Ok::<_, Error>(()),
                },
            }
        }
    };

    let errors = async {
        match stderr {
            Some(mut stderr) => copy_out(&mut stderr, output).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        result = upstream => {
            debug!("Browser side closed");
            result
        }
        result = copy_out(&mut stdout, output) => match result {
            Ok(()) => match timeout(EXIT_GRACE, exit).await {
                Ok(ExitStatus::Failure(message)) => Err(Error::Stream(message)),
                _ => Ok(()),
            },
            Err(e) => Err(e),
        },
        result = errors => result,
    }
}

/// Copy exec output to the transport until EOF or until the transport goes away
async fn copy_out<R>(reader: &mut R, output: &mpsc::Sender<Outbound>) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; OUTPUT_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        trace!("Forwarding {} bytes of output", n);
        if output
            .send(Outbound::Data(Bytes::copy_from_slice(&buf[..n])))
            .await
            .is_err()
        {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::session::SessionStatus;
    use crate::infra::exec::fake::{FakeExecBackend, RemoteEnd};

    struct Harness {
        registry: Arc<SessionRegistry>,
        bridge: Arc<ExecStreamBridge>,
        remotes: mpsc::UnboundedReceiver<RemoteEnd>,
        backend: Arc<FakeExecBackend>,
    }

    fn harness(attach_timeout: Duration) -> Harness {
        let registry = Arc::new(SessionRegistry::new());
        let (backend, remotes) = FakeExecBackend::new();
        let backend = Arc::new(backend);
        let bridge = Arc::new(
            ExecStreamBridge::new(registry.clone(), backend.clone(), attach_timeout)
                .with_start_grace(Duration::from_millis(50)),
        );
        Harness {
            registry,
            bridge,
            remotes,
            backend,
        }
    }

    fn target() -> ExecTarget {
        ExecTarget::new("default", "nginx", "nginx")
    }

    fn shells() -> Vec<String> {
        vec!["bash".to_string(), "sh".to_string()]
    }

    fn attachment() -> (Attachment, mpsc::Sender<Bytes>, mpsc::Receiver<Outbound>) {
        let (input_tx, input_rx) = mpsc::channel(32);
        let (output_tx, output_rx) = mpsc::channel(32);
        (
            Attachment {
                input: input_rx,
                output: output_tx,
            },
            input_tx,
            output_rx,
        )
    }

    #[tokio::test]
    async fn test_bytes_flow_both_ways() {
        let mut h = harness(Duration::from_secs(5));
        let session = h.registry.create("s1").unwrap();
        let task = h.bridge.spawn(session.clone(), target(), shells());

        let (attachment, input, mut output) = attachment();
        session.bind(attachment).await.unwrap();
        assert_eq!(session.status().await, SessionStatus::Bound);

        let mut remote = h.remotes.recv().await.unwrap();
        assert_eq!(remote.command, vec!["bash".to_string()]);
        assert!(remote.tty);

        input.send(Bytes::from_static(b"ls\n")).await.unwrap();
        let mut buf = [0u8; 3];
        remote.stdin.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ls\n");

        remote.stdout.write_all(b"bin etc\r\n").await.unwrap();
        assert_eq!(
            output.recv().await,
            Some(Outbound::Data(Bytes::from_static(b"bin etc\r\n")))
        );

        // Remote shell exits
        let _ = remote.exit.send(ExitStatus::Success);
        drop(remote.stdout);
        task.await.unwrap();

        assert_eq!(output.recv().await, None);
        assert!(h.registry.is_empty());
        assert_eq!(session.status().await, SessionStatus::Closed);
    }

    #[tokio::test]
    async fn test_resize_events_forwarded_in_order() {
        let mut h = harness(Duration::from_secs(5));
        let session = h.registry.create("s1").unwrap();
        let _task = h.bridge.spawn(session.clone(), target(), shells());

        let (attachment, input, _output) = attachment();
        session.bind(attachment).await.unwrap();
        let mut remote = h.remotes.recv().await.unwrap();

        for (rows, cols) in [(24, 80), (30, 100), (24, 80)] {
            session.push_resize(TerminalSize::new(rows, cols)).unwrap();
        }
        input.send(Bytes::from_static(b"x")).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            let size = remote.resize.recv().await.unwrap();
            seen.push((size.rows, size.cols));
        }
        assert_eq!(seen, vec![(24, 80), (30, 100), (24, 80)]);

        let mut buf = [0u8; 1];
        remote.stdin.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"x");
    }

    #[tokio::test]
    async fn test_attach_timeout_removes_session() {
        let h = harness(Duration::from_millis(50));
        let session = h.registry.create("s1").unwrap();
        let task = h.bridge.spawn(session.clone(), target(), shells());

        task.await.unwrap();
        assert!(h.registry.is_empty());
        assert_eq!(session.status().await, SessionStatus::Closed);

        let (attachment, _input, _output) = attachment();
        assert!(matches!(
            session.bind(attachment).await,
            Err(Error::AttachTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_late_attach_sees_attach_timeout() {
        let h = harness(Duration::from_millis(50));
        let session = h.registry.create("s1").unwrap();
        h.bridge.spawn(session, target(), shells()).await.unwrap();

        let err = h.registry.get("s1").unwrap_err();
        assert!(matches!(err, Error::AttachTimeout { ref session, .. } if session == "s1"));
        assert!(err.to_string().contains("not attached"));
    }

    #[tokio::test]
    async fn test_second_attach_leaves_first_intact() {
        let mut h = harness(Duration::from_secs(5));
        let session = h.registry.create("s1").unwrap();
        let _task = h.bridge.spawn(session.clone(), target(), shells());

        let (first, input, mut output) = attachment();
        session.bind(first).await.unwrap();
        let mut remote = h.remotes.recv().await.unwrap();

        let (second, _input2, _output2) = attachment();
        assert!(matches!(
            session.bind(second).await,
            Err(Error::SessionAlreadyBound(_))
        ));

        input.send(Bytes::from_static(b"pwd\n")).await.unwrap();
        let mut buf = [0u8; 4];
        remote.stdin.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pwd\n");

        remote.stdout.write_all(b"/\r\n").await.unwrap();
        assert_eq!(
            output.recv().await,
            Some(Outbound::Data(Bytes::from_static(b"/\r\n")))
        );
    }

    #[tokio::test]
    async fn test_shell_fallback() {
        let mut h = harness(Duration::from_secs(5));
        h.backend.fail_command("bash");
        let session = h.registry.create("s1").unwrap();
        let _task = h.bridge.spawn(session.clone(), target(), shells());

        let (attachment, _input, _output) = attachment();
        session.bind(attachment).await.unwrap();

        let remote = h.remotes.recv().await.unwrap();
        assert_eq!(remote.command, vec!["sh".to_string()]);
    }

    #[tokio::test]
    async fn test_shell_fallback_when_exit_status_reports_missing_binary() {
        let mut h = harness(Duration::from_secs(5));
        h.backend.missing_binary("bash");
        let session = h.registry.create("s1").unwrap();
        let _task = h.bridge.spawn(session.clone(), target(), shells());

        let (attachment, input, mut output) = attachment();
        session.bind(attachment).await.unwrap();

        let mut remote = h.remotes.recv().await.unwrap();
        assert_eq!(remote.command, vec!["sh".to_string()]);

        // The prompt printed while starting reaches the browser first
        remote.stdout.write_all(b"$ ").await.unwrap();
        assert_eq!(
            output.recv().await,
            Some(Outbound::Data(Bytes::from_static(b"$ ")))
        );

        input.send(Bytes::from_static(b"id\n")).await.unwrap();
        let mut buf = [0u8; 3];
        remote.stdin.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"id\n");
        assert_eq!(session.status().await, SessionStatus::Bound);
    }

    #[tokio::test]
    async fn test_missing_binaries_report_exit_message() {
        let h = harness(Duration::from_secs(5));
        h.backend.missing_binary("bash");
        h.backend.missing_binary("sh");
        let session = h.registry.create("s1").unwrap();
        let task = h.bridge.spawn(session.clone(), target(), shells());

        let (attachment, _input, mut output) = attachment();
        session.bind(attachment).await.unwrap();

        match output.recv().await {
            Some(Outbound::Error(message)) => {
                assert!(message.contains("\"sh\": executable file not found"))
            }
            other => panic!("unexpected output: {:?}", other),
        }
        task.await.unwrap();
        assert!(matches!(h.registry.get("s1"), Err(Error::Stream(_))));
    }

    #[tokio::test]
    async fn test_no_shell_starts_reports_error() {
        let h = harness(Duration::from_secs(5));
        h.backend.fail_command("bash");
        h.backend.fail_command("sh");
        let session = h.registry.create("s1").unwrap();
        let task = h.bridge.spawn(session.clone(), target(), shells());

        let (attachment, _input, mut output) = attachment();
        session.bind(attachment).await.unwrap();

        match output.recv().await {
            Some(Outbound::Error(message)) => assert!(message.contains("sh")),
            other => panic!("unexpected output: {:?}", other),
        }
        task.await.unwrap();
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn test_browser_disconnect_ends_session() {
        let mut h = harness(Duration::from_secs(5));
        let session = h.registry.create("s1").unwrap();
        let task = h.bridge.spawn(session.clone(), target(), shells());

        let (attachment, input, _output) = attachment();
        session.bind(attachment).await.unwrap();
        let _remote = h.remotes.recv().await.unwrap();

        drop(input);
        task.await.unwrap();
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn test_deleted_before_attach_ends_task() {
        let h = harness(Duration::from_secs(5));
        let session = h.registry.create("s1").unwrap();
        let task = h.bridge.spawn(session, target(), shells());

        // Let the task take the bound signal first
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.registry.delete("s1").await;
        task.await.unwrap();
        assert!(h.registry.is_empty());
    }
}
