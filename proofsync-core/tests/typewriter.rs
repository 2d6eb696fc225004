mod common;

use common::{error_diag, goal, FakeBackend};
use lsp_types::{Diagnostic, DiagnosticSeverity, Position, Range};
use proofsync_core::document::{ChangeSink, DocumentChange};
use proofsync_core::rpc::GET_PROOF_STATE;
use proofsync_core::{
    DiagnosticsPublished, DocumentEditor, LoadOutcome, ManagerOptions, ProofStateManager, Session,
    TextDocument, Typewriter,
};
use serde_json::json;
use std::sync::{Arc, Mutex};

const DOC: &str = "file:///game/Level1.lean";

struct Recorder(Arc<Mutex<Vec<DocumentChange>>>);

impl ChangeSink for Recorder {
    fn send_change(&self, change: DocumentChange) {
        self.0.lock().unwrap().push(change);
    }
}

fn diag(line: u32, sev: DiagnosticSeverity, msg: &str) -> Diagnostic {
    Diagnostic {
        range: Range::new(Position::new(line, 0), Position::new(line, 3)),
        severity: Some(sev),
        message: msg.to_string(),
        ..Default::default()
    }
}

fn published(diagnostics: Vec<Diagnostic>) -> DiagnosticsPublished {
    DiagnosticsPublished {
        uri: DOC.to_string(),
        diagnostics,
    }
}

fn level_doc() -> (TextDocument, Arc<Mutex<Vec<DocumentChange>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut doc =
        TextDocument::new(DOC, "intro x\n").with_sink(Box::new(Recorder(Arc::clone(&seen))));
    doc.set_cursor_position(Position::new(1, 0));
    (doc, seen)
}

#[test]
fn accepted_command_advances_cursor() {
    let (mut doc, seen) = level_doc();
    let mut t = Typewriter::new(DOC);

    t.set_input("rfl");
    assert_eq!(t.submit(&mut doc).as_deref(), Some("rfl"));
    assert_eq!(doc.text(), "intro x\nrfl\n");
    assert_eq!(t.input(), "");
    assert!(t.processing());
    assert_eq!(doc.cursor_position(), Position::new(1, 0));

    let changes = seen.lock().unwrap().clone();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].text, "intro x\nrfl\n");
    assert_eq!(changes[0].version, 2);

    // Warnings and open goals do not block the step.
    let ev = published(vec![
        diag(1, DiagnosticSeverity::WARNING, "unused variable"),
        diag(0, DiagnosticSeverity::ERROR, "unsolved goals\nx : Nat"),
    ]);
    assert!(t.on_diagnostics(&mut doc, &ev));
    assert!(!t.processing());
    assert_eq!(doc.cursor_position(), doc.document_end_position());
    assert_eq!(doc.cursor_position(), Position::new(2, 0));
}

#[tokio::test]
async fn rejected_command_returns_to_buffer() {
    let fake = Arc::new(FakeBackend::default());
    fake.push(
        GET_PROOF_STATE,
        Ok(json!({
            "steps": [
                { "command": "", "goals": [goal("x = x")], "errors": [] },
                { "command": "intro x", "goals": [goal("x = x")], "errors": [] },
                { "command": "rfl", "goals": [], "errors": [error_diag(1, "The rfl tactic failed")] }
            ],
            "diagnostics": [error_diag(1, "The rfl tactic failed")],
            "completed": false
        })),
    );
    let m = ProofStateManager::new(fake.clone(), ManagerOptions::default());
    m.set_session(Session::new("1", DOC));
    let (mut doc, _seen) = level_doc();
    let mut t = Typewriter::new(DOC);

    t.set_input("rfl");
    let out = t.run_command(&mut doc, &m).await.unwrap();
    assert_eq!(out, Some(LoadOutcome::Applied));
    assert_eq!(t.input(), "rfl");

    let ev = published(vec![diag(1, DiagnosticSeverity::ERROR, "The rfl tactic failed")]);
    assert!(t.on_diagnostics(&mut doc, &ev));
    assert!(!t.processing());
    assert_eq!(doc.cursor_position(), Position::new(1, 0));

    // Resubmitting overwrites the failed line in place.
    t.set_input("exact rfl");
    t.submit(&mut doc);
    assert_eq!(doc.text(), "intro x\nexact rfl\n");
}

#[tokio::test]
async fn busy_typewriter_makes_no_rpc_call() {
    let fake = Arc::new(FakeBackend::default());
    fake.push(GET_PROOF_STATE, Ok(json!({ "steps": [], "completed": false })));
    let m = ProofStateManager::new(fake.clone(), ManagerOptions::default());
    m.set_session(Session::new("1", DOC));
    let (mut doc, seen) = level_doc();
    let mut t = Typewriter::new(DOC);

    t.set_input("intro y");
    assert!(t.run_command(&mut doc, &m).await.unwrap().is_some());
    t.set_input("rfl");
    assert_eq!(t.run_command(&mut doc, &m).await.unwrap(), None);
    assert_eq!(fake.calls().len(), 1);
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(t.input(), "rfl");
}

#[test]
fn pasted_newlines_never_reach_the_document() {
    let (mut doc, _seen) = level_doc();
    let mut t = Typewriter::new(DOC);
    assert!(t.set_input("intro y\nrfl"));
    t.submit(&mut doc);
    assert_eq!(doc.text(), "intro x\nintro yrfl\n");
    assert_eq!(doc.uri(), t.uri());
}
