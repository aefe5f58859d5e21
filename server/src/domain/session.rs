//! Terminal session domain model

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::{Error, Result};

/// Terminal session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Registered, no transport attached yet
    Pending,
    /// Transport attached and wired to an exec stream
    Bound,
    /// Torn down
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Bound => "bound",
            SessionStatus::Closed => "closed",
        }
    }

    /// Check whether `next` is reachable from this state
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (SessionStatus::Pending, SessionStatus::Bound)
                | (SessionStatus::Pending, SessionStatus::Closed)
                | (SessionStatus::Bound, SessionStatus::Closed)
        )
    }
}

/// Terminal dimensions in character cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub rows: u16,
    pub cols: u16,
}

impl TerminalSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }
}

/// Message from the bridge to the browser transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Raw terminal output
    Data(Bytes),
    /// The session is ending because of this error
    Error(String),
}

/// Transport-facing ends handed to the bridge when a browser attaches
#[derive(Debug)]
pub struct Attachment {
    /// Raw bytes typed in the browser
    pub input: mpsc::Receiver<Bytes>,
    /// Output flowing back to the browser
    pub output: mpsc::Sender<Outbound>,
}

/// Payload of the one-shot bound notification
pub type BoundSignal = Result<Attachment>;

struct SessionInner {
    status: SessionStatus,
    bound_tx: Option<oneshot::Sender<BoundSignal>>,
    close_reason: Option<Error>,
}

/// One in-flight or pending interactive shell
pub struct TerminalSession {
    id: String,
    created_at: DateTime<Utc>,
    inner: Mutex<SessionInner>,
    bound_rx: Mutex<Option<oneshot::Receiver<BoundSignal>>>,
    resize_tx: mpsc::UnboundedSender<TerminalSize>,
    resize_rx: Mutex<Option<mpsc::UnboundedReceiver<TerminalSize>>>,
}

impl TerminalSession {
    /// Create a pending session with fresh signal and event channels
    pub fn new(id: impl Into<String>) -> Self {
        let (bound_tx, bound_rx) = oneshot::channel();
        let (resize_tx, resize_rx) = mpsc::unbounded_channel();

        Self {
            id: id.into(),
            created_at: Utc::now(),
            inner: Mutex::new(SessionInner {
                status: SessionStatus::Pending,
                bound_tx: Some(bound_tx),
                close_reason: None,
            }),
            bound_rx: Mutex::new(Some(bound_rx)),
            resize_tx,
            resize_rx: Mutex::new(Some(resize_rx)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub async fn status(&self) -> SessionStatus {
        self.inner.lock().await.status
    }

    /// Claim the session for a transport. Succeeds at most once.
    pub async fn bind(&self, attachment: Attachment) -> Result<()> {
        let mut inner = self.inner.lock().await;

        match inner.status {
            SessionStatus::Pending => {}
            SessionStatus::Bound => return Err(Error::SessionAlreadyBound(self.id.clone())),
            SessionStatus::Closed => {
                return Err(inner
                    .close_reason
                    .clone()
                    .unwrap_or_else(|| Error::SessionClosed(self.id.clone())))
            }
        }

        let bound_tx = inner
            .bound_tx
            .take()
            .ok_or_else(|| Error::SessionClosed(self.id.clone()))?;

        if bound_tx.send(Ok(attachment)).is_err() {
            // Nobody is waiting for the stream any more
            inner.status = SessionStatus::Closed;
            return Err(Error::SessionClosed(self.id.clone()));
        }

        inner.status = SessionStatus::Bound;
        Ok(())
    }

    /// Take the bound notification receiver. Only the first caller gets it.
    pub async fn take_bound_signal(&self) -> Option<oneshot::Receiver<BoundSignal>> {
        self.bound_rx.lock().await.take()
    }

    /// Take the resize event consumer. Only the first caller gets it.
    pub async fn take_resize_events(&self) -> Option<mpsc::UnboundedReceiver<TerminalSize>> {
        self.resize_rx.lock().await.take()
    }

    /// Queue a resize event for the bridge
    pub fn push_resize(&self, size: TerminalSize) -> Result<()> {
        self.resize_tx
            .send(size)
            .map_err(|_| Error::SessionClosed(self.id.clone()))
    }

    /// Move to `Closed`, waking a pending waiter with `reason`.
    /// Later binds are refused with the same reason.
    /// Returns false if the session was already closed.
    pub async fn close(&self, reason: Option<Error>) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.status.can_transition_to(SessionStatus::Closed) {
            return false;
        }

        let reason = reason.unwrap_or_else(|| Error::SessionClosed(self.id.clone()));
        if let Some(bound_tx) = inner.bound_tx.take() {
            let _ = bound_tx.send(Err(reason.clone()));
        }
        inner.close_reason = Some(reason);
        inner.status = SessionStatus::Closed;
        true
    }
}

impl std::fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalSession")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}
