//! Proof state manager: the single owner of `ProofState` and `Session`.
//!
//! State machine:
//!
//! ```text
//! Uninitialized --set_session--> Initializing --load ok/hard failure--> Ready <--> Updating
//! ```
//!
//! `crashed` is orthogonal: set by hard RPC failures (or a dead server),
//! cleared by `set_session` and by the next successful load. Crashes are
//! advisory; the last good `ProofState` stays readable.
//!
//! Concurrency: the state lives behind a `std::sync::Mutex` that is never held
//! across an `.await`. A load captures the session id and a ticket, awaits the
//! RPC, then re-checks both before applying, so results from a replaced session
//! or older than an already-applied load are dropped.

use std::sync::{Arc, Mutex, MutexGuard};

use lsp_types::Diagnostic;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::diagnostics::{last_step_has_errors, step_start_line};
use crate::rpc::{RpcBackend, RpcClient, RpcFailure, RpcOptions};
use crate::session::Session;
use crate::types::{
    DiagnosticsPublished, DocumentPosition, InteractiveGoals, InteractiveTermGoal, ProofState,
    ServerEvent, UserWidgets,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Uninitialized,
    Initializing,
    Ready,
    Updating,
}

/// Coarse status for consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Updating,
    Ready,
    Error,
}

/// What a successful call that returns no proof state does to the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmptyPayloadPolicy {
    #[default]
    KeepPrevious,
    ResetToEmpty,
}

impl std::str::FromStr for EmptyPayloadPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "keep" | "keep-previous" => Ok(Self::KeepPrevious),
            "reset" | "reset-to-empty" => Ok(Self::ResetToEmpty),
            other => Err(format!("unknown empty-payload policy `{other}` (want keep|reset)")),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ManagerOptions {
    pub rpc: RpcOptions,
    pub empty_payload: EmptyPayloadPolicy,
}

/// Result of one `load_proof_state` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Applied,
    /// The call succeeded without a payload; handled per `EmptyPayloadPolicy`.
    Empty,
    /// Known-transient failure; nothing changed.
    Transient(RpcFailure),
    /// Hard failure; `crashed` is now set.
    Crashed(RpcFailure),
    /// The result belonged to a replaced session or an older request.
    Superseded,
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("RPC session not initialized")]
    NoSession,
    #[error(transparent)]
    Rpc(#[from] RpcFailure),
}

/// Read-only snapshot handed to consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofView {
    pub proof: ProofState,
    pub interim_diags: Vec<Diagnostic>,
    pub crashed: bool,
    pub initializing: bool,
    pub phase: Phase,
    pub status: Status,
    pub selected_step: Option<usize>,
    pub uri: Option<String>,
    /// Bumped on every observable change.
    pub revision: u64,
}

struct State {
    proof: ProofState,
    interim_diags: Vec<Diagnostic>,
    crashed: bool,
    phase: Phase,
    selected_step: Option<usize>,
    session: Option<Session>,
    client: Option<RpcClient>,
    next_ticket: u64,
    applied_ticket: u64,
    in_flight: usize,
    revision: u64,
}

impl State {
    fn new() -> Self {
        Self {
            proof: ProofState::default(),
            interim_diags: Vec::new(),
            crashed: false,
            phase: Phase::Uninitialized,
            selected_step: None,
            session: None,
            client: None,
            next_ticket: 0,
            applied_ticket: 0,
            in_flight: 0,
            revision: 0,
        }
    }

    fn status(&self) -> Status {
        if self.phase == Phase::Updating {
            Status::Updating
        } else if self.crashed {
            Status::Error
        } else {
            Status::Ready
        }
    }

    fn initializing(&self) -> bool {
        matches!(self.phase, Phase::Uninitialized | Phase::Initializing)
    }

    fn view(&self) -> ProofView {
        ProofView {
            proof: self.proof.clone(),
            interim_diags: self.interim_diags.clone(),
            crashed: self.crashed,
            initializing: self.initializing(),
            phase: self.phase,
            status: self.status(),
            selected_step: self.selected_step,
            uri: self.session.as_ref().map(|s| s.uri().to_string()),
            revision: self.revision,
        }
    }

    fn session_id(&self) -> Option<u64> {
        self.session.as_ref().map(Session::id)
    }

    /// Leave `Updating` once nothing is in flight.
    fn settle(&mut self) {
        if self.in_flight == 0 && self.phase == Phase::Updating {
            self.phase = Phase::Ready;
        }
    }

    /// Make every load issued so far stale.
    fn invalidate_in_flight(&mut self) {
        self.applied_ticket = self.next_ticket;
    }
}

/// A proof whose last step errs is never complete, whatever the server says.
fn normalize(mut proof: ProofState) -> ProofState {
    if (proof.completed || proof.completed_with_warnings) && last_step_has_errors(&proof) {
        warn!(
            steps = proof.steps.len(),
            "proof marked completed but its last step has errors; clearing completion"
        );
        proof.completed = false;
        proof.completed_with_warnings = false;
    }
    proof
}

struct Inner {
    backend: Arc<dyn RpcBackend>,
    opts: ManagerOptions,
    state: Mutex<State>,
    tx: watch::Sender<ProofView>,
}

/// Handle to the shared manager. Clones share state.
#[derive(Clone)]
pub struct ProofStateManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ProofStateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProofStateManager")
            .field("view", &self.snapshot())
            .finish()
    }
}

impl ProofStateManager {
    pub fn new(backend: Arc<dyn RpcBackend>, opts: ManagerOptions) -> Self {
        let state = State::new();
        let (tx, _rx) = watch::channel(state.view());
        Self {
            inner: Arc::new(Inner {
                backend,
                opts,
                state: Mutex::new(state),
                tx,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.inner.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Bump the revision and notify subscribers. Consumes the guard so the
    /// watch channel is never written under the state lock.
    fn commit(&self, mut st: MutexGuard<'_, State>) {
        st.revision += 1;
        let view = st.view();
        drop(st);
        self.inner.tx.send_replace(view);
    }

    pub fn subscribe(&self) -> watch::Receiver<ProofView> {
        self.inner.tx.subscribe()
    }

    pub fn snapshot(&self) -> ProofView {
        self.lock().view()
    }

    pub fn proof(&self) -> ProofState {
        self.lock().proof.clone()
    }

    pub fn interim_diags(&self) -> Vec<Diagnostic> {
        self.lock().interim_diags.clone()
    }

    pub fn crashed(&self) -> bool {
        self.lock().crashed
    }

    pub fn initializing(&self) -> bool {
        self.lock().initializing()
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    pub fn status(&self) -> Status {
        self.lock().status()
    }

    pub fn selected_step(&self) -> Option<usize> {
        self.lock().selected_step
    }

    pub fn session(&self) -> Option<Session> {
        self.lock().session.clone()
    }

    /// Bind a new session. Any result still in flight for the old one is ignored.
    pub fn set_session(&self, session: Session) {
        let mut st = self.lock();
        let same_doc = st.session.as_ref().is_some_and(|s| s.uri() == session.uri());
        if !same_doc {
            st.proof = ProofState::default();
            st.interim_diags.clear();
            st.selected_step = None;
        }
        info!(uri = session.uri(), session = session.id(), "session set");
        st.client = Some(RpcClient::new(
            Arc::clone(&self.inner.backend),
            session.clone(),
            self.inner.opts.rpc.clone(),
        ));
        st.session = Some(session);
        st.crashed = false;
        st.phase = Phase::Initializing;
        st.in_flight = 0;
        st.invalidate_in_flight();
        self.commit(st);
    }

    /// Fetch the proof state from the server and merge it.
    ///
    /// Fails only when no session is bound; RPC failures are folded into the
    /// returned `LoadOutcome` and the `crashed` flag.
    pub async fn load_proof_state(&self) -> Result<LoadOutcome, ManagerError> {
        let (client, session_id, ticket) = {
            let mut st = self.lock();
            let (Some(client), Some(session_id)) = (st.client.clone(), st.session_id()) else {
                debug!("load_proof_state called before a session was set");
                return Err(ManagerError::NoSession);
            };
            st.next_ticket += 1;
            let ticket = st.next_ticket;
            st.in_flight += 1;
            if st.phase == Phase::Ready {
                st.phase = Phase::Updating;
            }
            self.commit(st);
            (client, session_id, ticket)
        };

        let res = client.get_proof_state(None).await;

        let mut st = self.lock();
        if st.session_id() != Some(session_id) {
            debug!(session = session_id, "discarding proof state from replaced session");
            return Ok(LoadOutcome::Superseded);
        }
        st.in_flight = st.in_flight.saturating_sub(1);
        if ticket <= st.applied_ticket {
            debug!(ticket, applied = st.applied_ticket, "discarding stale proof state");
            st.settle();
            self.commit(st);
            return Ok(LoadOutcome::Superseded);
        }

        let outcome = match res {
            Ok(Some(proof)) => {
                st.applied_ticket = ticket;
                st.proof = normalize(proof);
                st.crashed = false;
                st.phase = Phase::Ready;
                LoadOutcome::Applied
            }
            Ok(None) => match self.inner.opts.empty_payload {
                EmptyPayloadPolicy::KeepPrevious => {
                    warn!("no proof state returned; keeping previous state");
                    st.settle();
                    LoadOutcome::Empty
                }
                EmptyPayloadPolicy::ResetToEmpty => {
                    warn!("no proof state returned; resetting to empty");
                    st.applied_ticket = ticket;
                    st.proof = ProofState::default();
                    st.crashed = false;
                    st.phase = Phase::Ready;
                    LoadOutcome::Empty
                }
            },
            Err(e) if e.transient => {
                warn!(error = %e, "backend not ready; will retry on next trigger");
                st.settle();
                LoadOutcome::Transient(e)
            }
            Err(e) => {
                error!(error = %e, "failed to load proof state");
                st.crashed = true;
                st.phase = Phase::Ready;
                LoadOutcome::Crashed(e)
            }
        };
        self.commit(st);
        Ok(outcome)
    }

    /// Replace the proof state directly. Completion flags are cleared when the
    /// last step carries an error.
    pub fn update_proof(&self, proof: ProofState) {
        let mut st = self.lock();
        st.invalidate_in_flight();
        st.proof = normalize(proof);
        self.commit(st);
    }

    /// Ingest a `publishDiagnostics` payload. Returns whether anything changed.
    ///
    /// Payloads for any document other than the session's are dropped, and an
    /// identical replay is a no-op.
    pub fn update_interim_diags(&self, event: &DiagnosticsPublished) -> bool {
        let mut st = self.lock();
        let Some(uri) = st.session.as_ref().map(|s| s.uri().to_string()) else {
            debug!(uri = %event.uri, "dropping diagnostics: no session");
            return false;
        };
        if uri != event.uri {
            debug!(uri = %event.uri, tracked = %uri, "dropping diagnostics for stale document");
            return false;
        }
        if st.interim_diags == event.diagnostics {
            return false;
        }
        st.interim_diags = event.diagnostics.clone();
        self.commit(st);
        true
    }

    /// Route one server event.
    pub fn handle_event(&self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::DiagnosticsPublished(p) => self.update_interim_diags(p),
            ServerEvent::Exited { reason } => {
                error!(%reason, "server exited");
                let mut st = self.lock();
                if st.crashed {
                    return false;
                }
                st.crashed = true;
                self.commit(st);
                true
            }
        }
    }

    /// Drop step `n` and everything after it, together with the diagnostics
    /// that start on or after step `n`'s first line.
    pub fn delete_from_step(&self, n: usize) {
        let mut st = self.lock();
        let cutoff = step_start_line(n);
        if n < st.proof.steps.len() {
            st.proof.steps.truncate(n);
            st.proof.completed = false;
            st.proof.completed_with_warnings = false;
        }
        st.proof.diagnostics.retain(|d| d.start_line() < cutoff);
        st.interim_diags.retain(|d| d.range.start.line < cutoff);
        if st.selected_step.is_some_and(|s| s >= n) {
            st.selected_step = None;
        }
        st.invalidate_in_flight();
        debug!(n, cutoff, "deleted steps");
        self.commit(st);
    }

    pub fn select_step(&self, step: Option<usize>) {
        let mut st = self.lock();
        if st.selected_step == step {
            return;
        }
        st.selected_step = step;
        self.commit(st);
    }

    pub fn set_crashed(&self, crashed: bool) {
        let mut st = self.lock();
        if st.crashed == crashed {
            return;
        }
        st.crashed = crashed;
        self.commit(st);
    }

    fn client(&self) -> Result<RpcClient, ManagerError> {
        self.lock().client.clone().ok_or(ManagerError::NoSession)
    }

    pub async fn get_goals(
        &self,
        pos: DocumentPosition,
    ) -> Result<Option<InteractiveGoals>, ManagerError> {
        Ok(self.client()?.get_interactive_goals(Some(pos)).await?)
    }

    pub async fn get_term_goal(
        &self,
        pos: DocumentPosition,
    ) -> Result<Option<InteractiveTermGoal>, ManagerError> {
        Ok(self.client()?.get_interactive_term_goal(Some(pos)).await?)
    }

    pub async fn get_widgets(&self, pos: DocumentPosition) -> Result<UserWidgets, ManagerError> {
        Ok(self.client()?.get_widgets(Some(pos)).await?)
    }

    /// Diagnostics for a line range, with messages flattened to plain text.
    pub async fn get_diagnostics(
        &self,
        start_line: u32,
        end_line: u32,
    ) -> Result<Vec<Diagnostic>, ManagerError> {
        let diags = self.client()?.get_diagnostics(start_line, end_line).await?;
        Ok(diags.iter().map(|d| d.to_basic()).collect())
    }
}
