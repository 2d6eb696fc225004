//! Single-line command input ("typewriter").
//!
//! The typewriter owns one pending command. Submitting writes it into the
//! document below the cursor and asks the manager for a fresh proof state;
//! the next `publishDiagnostics` for the document decides whether the cursor
//! advances past the new line (accepted) or stays put for a correction.

use lsp_types::Range;
use tracing::debug;

use crate::diagnostics::{has_errors, last_step_has_errors};
use crate::document::DocumentEditor;
use crate::manager::{LoadOutcome, ManagerError, ProofStateManager};
use crate::types::{DiagnosticsPublished, GameHint, ProofState, ServerEvent};

#[derive(Debug, Clone, Default)]
pub struct Typewriter {
    uri: String,
    pending: String,
    processing: bool,
    deleted_hints: Vec<GameHint>,
}

impl Typewriter {
    /// A typewriter tracking the document at `uri`.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Default::default()
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn input(&self) -> &str {
        &self.pending
    }

    pub fn processing(&self) -> bool {
        self.processing
    }

    /// Hints removed by the last edit, kept visible until the next submission.
    pub fn deleted_hints(&self) -> &[GameHint] {
        &self.deleted_hints
    }

    pub fn set_deleted_hints(&mut self, hints: Vec<GameHint>) {
        self.deleted_hints = hints;
    }

    /// Observe an edit of the input field. Line breaks are stripped on the
    /// spot; returns `true` if any were.
    pub fn set_input(&mut self, value: &str) -> bool {
        let cleaned: String = value.chars().filter(|c| *c != '\n' && *c != '\r').collect();
        let stripped = cleaned.len() != value.len();
        self.pending = cleaned;
        stripped
    }

    /// Write the pending command into the document.
    ///
    /// Everything from the cursor to the end of the document is replaced by
    /// the trimmed command plus a newline, and the cursor is put back where it
    /// was. Returns the submitted command, or `None` when busy or empty.
    ///
    /// This only edits the document. The caller must follow a `Some` with
    /// `ProofStateManager::load_proof_state`, or use [`Typewriter::run_command`].
    /// `processing` stays set until [`Typewriter::on_diagnostics`] (or a server
    /// exit, see [`Typewriter::handle_event`]) clears it.
    pub fn submit<E: DocumentEditor + ?Sized>(&mut self, editor: &mut E) -> Option<String> {
        if self.processing {
            debug!("submit ignored: previous command still processing");
            return None;
        }
        let command = self.pending.trim().to_string();
        if command.is_empty() {
            return None;
        }
        self.processing = true;
        self.deleted_hints.clear();

        let pos = editor.cursor_position();
        let end = editor.document_end_position();
        editor.insert_text(Range::new(pos, end), &format!("{command}\n"));
        self.pending.clear();
        editor.set_cursor_position(pos);
        debug!(%command, line = pos.line, "submitted command");
        Some(command)
    }

    /// `submit` followed by a proof-state refresh.
    pub async fn run_command<E: DocumentEditor + ?Sized>(
        &mut self,
        editor: &mut E,
        manager: &ProofStateManager,
    ) -> Result<Option<LoadOutcome>, ManagerError> {
        if self.submit(editor).is_none() {
            return Ok(None);
        }
        let outcome = manager.load_proof_state().await?;
        self.sync_with_proof(&manager.proof());
        Ok(Some(outcome))
    }

    /// React to a `publishDiagnostics` notification. Returns `false` if it was
    /// for another document.
    pub fn on_diagnostics<E: DocumentEditor + ?Sized>(
        &mut self,
        editor: &mut E,
        event: &DiagnosticsPublished,
    ) -> bool {
        if event.uri != self.uri {
            return false;
        }
        self.processing = false;
        if !has_errors(Some(&event.diagnostics)) {
            editor.set_cursor_position(editor.document_end_position());
        }
        true
    }

    /// Route one server event. A server exit releases `processing`, since no
    /// diagnostics will ever arrive for the pending edit. Returns whether the
    /// typewriter state changed.
    pub fn handle_event<E: DocumentEditor + ?Sized>(
        &mut self,
        editor: &mut E,
        event: &ServerEvent,
    ) -> bool {
        match event {
            ServerEvent::DiagnosticsPublished(p) => self.on_diagnostics(editor, p),
            ServerEvent::Exited { reason } => {
                if !self.processing {
                    return false;
                }
                debug!(%reason, "server exited while processing; releasing input");
                self.processing = false;
                true
            }
        }
    }

    /// Put the failing command back into the buffer when the last step errs.
    pub fn sync_with_proof(&mut self, proof: &ProofState) -> bool {
        if !last_step_has_errors(proof) {
            return false;
        }
        let Some(step) = proof.last_step() else {
            return false;
        };
        if self.pending == step.command {
            return false;
        }
        self.pending = step.command.clone();
        true
    }

    /// The input is hidden once the level is done, even with warnings left.
    pub fn is_hidden(proof: &ProofState) -> bool {
        proof.completed_with_warnings
    }
}
