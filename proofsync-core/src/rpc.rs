//! Typed RPC calls against the game server.
//!
//! `RpcBackend` is the wire seam (`transport::LeanServer` in production, a
//! scripted fake in tests). `RpcClient` binds a backend to the current
//! `Session`, fills in default positions, decodes payloads, and maps every
//! failure to one `RpcFailure`.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::session::Session;
use crate::types::{
    DocumentPosition, InteractiveDiagnostic, InteractiveGoals, InteractiveTermGoal, ProofState,
    UserWidgets,
};

pub const GET_PROOF_STATE: &str = "Game.getProofState";
pub const GET_INTERACTIVE_GOALS: &str = "Game.getInteractiveGoals";
pub const GET_INTERACTIVE_TERM_GOAL: &str = "Lean.Widget.getInteractiveTermGoal";
pub const GET_WIDGETS: &str = "Lean.Widget.getWidgets";
pub const GET_INTERACTIVE_DIAGNOSTICS: &str = "Lean.Widget.getInteractiveDiagnostics";

/// JSON-RPC / Lean RPC error codes the client reacts to.
pub mod codes {
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const REQUEST_CANCELLED: i64 = -32800;
    pub const CONTENT_MODIFIED: i64 = -32801;
    pub const RPC_NEEDS_RECONNECT: i64 = -32900;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcFailureKind {
    /// No session bound; raised before any network traffic.
    NoSession,
    /// The connection itself failed (server gone, write error, timeout).
    Transport,
    /// The server answered with an error response.
    Remote { code: i64 },
    MethodNotFound,
    /// The server forgot our RPC session; a new one must be connected.
    NeedsReconnect,
    /// The payload did not match the expected shape.
    Decode,
}

/// Uniform failure signal for every RPC call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct RpcFailure {
    pub kind: RpcFailureKind,
    pub reason: String,
    pub transient: bool,
}

impl RpcFailure {
    pub fn new(kind: RpcFailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            transient: false,
        }
    }

    pub fn no_session() -> Self {
        Self::new(RpcFailureKind::NoSession, "RPC session not initialized")
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        Self::new(RpcFailureKind::Transport, reason)
    }

    /// Build from a JSON-RPC error response.
    pub fn remote(code: i64, message: impl Into<String>) -> Self {
        let kind = match code {
            codes::METHOD_NOT_FOUND => RpcFailureKind::MethodNotFound,
            codes::RPC_NEEDS_RECONNECT => RpcFailureKind::NeedsReconnect,
            _ => RpcFailureKind::Remote { code },
        };
        let mut f = Self::new(kind, message);
        f.transient = matches!(code, codes::CONTENT_MODIFIED | codes::REQUEST_CANCELLED);
        f
    }

    pub fn decode(method: &str, err: impl std::fmt::Display) -> Self {
        Self::new(
            RpcFailureKind::Decode,
            format!("failed to decode {method} response: {err}"),
        )
    }

    pub fn with_transient(mut self, transient: bool) -> Self {
        self.transient = transient;
        self
    }

    /// Mark transient when the reason mentions one of `markers`.
    pub fn classify(mut self, markers: &[String]) -> Self {
        if !self.transient {
            self.transient = markers
                .iter()
                .any(|m| !m.is_empty() && self.reason.contains(m.as_str()));
        }
        self
    }

    pub fn is_method_not_found(&self) -> bool {
        self.kind == RpcFailureKind::MethodNotFound
    }
}

/// Wire seam: one Lean RPC call against a connected session.
#[async_trait]
pub trait RpcBackend: Send + Sync {
    async fn call(
        &self,
        session: &Session,
        pos: &DocumentPosition,
        method: &str,
        params: Value,
    ) -> Result<Value, RpcFailure>;
}

#[derive(Debug, Clone)]
pub struct RpcOptions {
    pub timeout: Duration,
    pub transient_markers: Vec<String>,
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            transient_markers: vec!["Client is not running".to_string()],
        }
    }
}

struct ClientInner {
    backend: Arc<dyn RpcBackend>,
    session: RwLock<Option<Session>>,
    opts: RpcOptions,
}

/// Typed client bound to (at most) one session at a time.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("session", &self.current_session().ok())
            .field("opts", &self.inner.opts)
            .finish()
    }
}

impl RpcClient {
    pub fn new(backend: Arc<dyn RpcBackend>, session: Session, opts: RpcOptions) -> Self {
        Self::build(backend, Some(session), opts)
    }

    /// A client with no session; every call fails fast with `NoSession`.
    pub fn unbound(backend: Arc<dyn RpcBackend>, opts: RpcOptions) -> Self {
        Self::build(backend, None, opts)
    }

    fn build(backend: Arc<dyn RpcBackend>, session: Option<Session>, opts: RpcOptions) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                backend,
                session: RwLock::new(session),
                opts,
            }),
        }
    }

    /// Swap the bound session. Calls already in flight keep the one they started with.
    pub fn update_session(&self, session: Session) {
        match self.inner.session.write() {
            Ok(mut g) => *g = Some(session),
            Err(poisoned) => *poisoned.into_inner() = Some(session),
        }
    }

    pub fn current_session(&self) -> Result<Session, RpcFailure> {
        let g = match self.inner.session.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        g.clone().ok_or_else(RpcFailure::no_session)
    }

    async fn call(
        &self,
        session: &Session,
        pos: &DocumentPosition,
        method: &str,
        params: Value,
    ) -> Result<Value, RpcFailure> {
        let fut = self.inner.backend.call(session, pos, method, params);
        let res = match tokio::time::timeout(self.inner.opts.timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(RpcFailure::transport(format!(
                "timeout waiting for {method} after {}s",
                self.inner.opts.timeout.as_secs()
            ))),
        };
        res.map_err(|e| e.classify(&self.inner.opts.transient_markers))
    }

    fn resolve_pos(session: &Session, pos: Option<DocumentPosition>) -> DocumentPosition {
        pos.unwrap_or_else(|| DocumentPosition::start_of(session.uri()))
    }

    /// Fetch the full proof state. `Ok(None)` means the call succeeded but the
    /// server returned no payload.
    pub async fn get_proof_state(
        &self,
        pos: Option<DocumentPosition>,
    ) -> Result<Option<ProofState>, RpcFailure> {
        let session = self.current_session()?;
        let pos = Self::resolve_pos(&session, pos);
        debug!(uri = %pos.uri, session = session.id(), "requesting proof state");
        let v = match self.call(&session, &pos, GET_PROOF_STATE, pos.to_tdpp()).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, transient = e.transient, "failed to get proof state");
                return Err(e);
            }
        };
        if v.is_null() {
            warn!(uri = %pos.uri, "received empty proof state");
            return Ok(None);
        }
        let proof = decode::<ProofState>(GET_PROOF_STATE, v)?;
        debug!(steps = proof.steps.len(), completed = proof.completed, "received proof state");
        Ok(Some(proof))
    }

    pub async fn get_interactive_goals(
        &self,
        pos: Option<DocumentPosition>,
    ) -> Result<Option<InteractiveGoals>, RpcFailure> {
        let session = self.current_session()?;
        let pos = Self::resolve_pos(&session, pos);
        let v = self
            .call(&session, &pos, GET_INTERACTIVE_GOALS, pos.to_tdpp())
            .await?;
        decode_opt(GET_INTERACTIVE_GOALS, v)
    }

    pub async fn get_interactive_term_goal(
        &self,
        pos: Option<DocumentPosition>,
    ) -> Result<Option<InteractiveTermGoal>, RpcFailure> {
        let session = self.current_session()?;
        let pos = Self::resolve_pos(&session, pos);
        let v = self
            .call(&session, &pos, GET_INTERACTIVE_TERM_GOAL, pos.to_tdpp())
            .await?;
        decode_opt(GET_INTERACTIVE_TERM_GOAL, v)
    }

    /// Widgets at `pos`. Servers without widget support yield an empty list.
    pub async fn get_widgets(
        &self,
        pos: Option<DocumentPosition>,
    ) -> Result<UserWidgets, RpcFailure> {
        let session = self.current_session()?;
        let pos = Self::resolve_pos(&session, pos);
        let params = json!({ "line": pos.line, "character": pos.character });
        match self.call(&session, &pos, GET_WIDGETS, params).await {
            Ok(v) => Ok(decode_opt::<UserWidgets>(GET_WIDGETS, v)?.unwrap_or_default()),
            Err(e) if e.is_method_not_found() => {
                debug!("server has no widget support");
                Ok(UserWidgets::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Interactive diagnostics for lines `start_line..end_line`.
    pub async fn get_diagnostics(
        &self,
        start_line: u32,
        end_line: u32,
    ) -> Result<Vec<InteractiveDiagnostic>, RpcFailure> {
        let session = self.current_session()?;
        let pos = DocumentPosition::start_of(session.uri());
        let params = json!({ "lineRange": { "start": start_line, "end": end_line } });
        let v = self
            .call(&session, &pos, GET_INTERACTIVE_DIAGNOSTICS, params)
            .await?;
        Ok(decode_opt(GET_INTERACTIVE_DIAGNOSTICS, v)?.unwrap_or_default())
    }
}

fn decode<T: DeserializeOwned>(method: &str, v: Value) -> Result<T, RpcFailure> {
    serde_json::from_value(v).map_err(|e| RpcFailure::decode(method, e))
}

fn decode_opt<T: DeserializeOwned>(method: &str, v: Value) -> Result<Option<T>, RpcFailure> {
    if v.is_null() {
        return Ok(None);
    }
    decode(method, v).map(Some)
}
