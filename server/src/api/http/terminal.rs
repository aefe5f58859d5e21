//! Terminal HTTP handlers

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use super::response::Envelope;
use crate::domain::identity::CallerIdentity;
use crate::infra::exec::ExecTarget;
use crate::{AppState, Result};

/// Optional shell override for interactive exec
#[derive(Debug, Default, Deserialize)]
pub struct ShellQuery {
    pub shell: Option<String>,
}

/// Session handle returned by the shell endpoint
#[derive(Debug, Serialize)]
pub struct TerminalResponse {
    pub id: String,
}

/// Prepare the caller's personal terminal pod
pub async fn create_terminal(
    State(state): State<AppState>,
    identity: CallerIdentity,
) -> Result<Json<Envelope<&'static str>>> {
    state
        .terminal_service
        .create_personal_terminal(&identity)
        .await?;
    Ok(Json(Envelope::success("ok")))
}

/// Open an interactive shell session in a container
pub async fn exec_shell(
    State(state): State<AppState>,
    _identity: CallerIdentity,
    Path((namespace, pod, container)): Path<(String, String, String)>,
    Query(query): Query<ShellQuery>,
) -> Result<Json<Envelope<TerminalResponse>>> {
    let target = ExecTarget::new(namespace, pod, container);
    let id = state.terminal_service.open_shell(target, query.shell)?;
    Ok(Json(Envelope::success(TerminalResponse { id })))
}
