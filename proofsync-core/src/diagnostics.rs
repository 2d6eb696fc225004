//! Error classification and the line → proof-step partition.
//!
//! Two diagnostic shapes reach this module: basic LSP diagnostics from
//! `publishDiagnostics`, and interactive diagnostics embedded in proof states.
//! They are classified by separate predicates; the basic one exempts
//! "unsolved goals" notices, the interactive one does not.

use lsp_types::{Diagnostic, DiagnosticSeverity};

use crate::types::{InteractiveDiagnostic, ProofState};

/// Prefix of the notice Lean emits while a proof is still open.
pub const UNSOLVED_GOALS: &str = "unsolved goals";

/// True iff some diagnostic is an error other than an "unsolved goals" notice.
pub fn has_errors(diags: Option<&[Diagnostic]>) -> bool {
    diags.is_some_and(|ds| {
        ds.iter().any(|d| {
            d.severity == Some(DiagnosticSeverity::ERROR) && !d.message.starts_with(UNSOLVED_GOALS)
        })
    })
}

/// True iff some interactive diagnostic has error severity.
pub fn has_interactive_errors(diags: Option<&[InteractiveDiagnostic]>) -> bool {
    diags.is_some_and(|ds| ds.iter().any(InteractiveDiagnostic::is_error))
}

/// Whether the most recent step of `proof` carries an error.
pub fn last_step_has_errors(proof: &ProofState) -> bool {
    has_interactive_errors(proof.last_step().map(|s| s.errors.as_slice()))
}

/// Index of the step a diagnostic starting on `line` belongs to.
///
/// Line 0 is the banner before the first command and belongs to no step.
/// Anything at or past `n_steps - 1` is attributed to the last step.
pub fn step_for_line(line: u32, n_steps: usize) -> Option<usize> {
    if n_steps == 0 || line == 0 {
        return None;
    }
    let line = line as usize;
    if line >= n_steps - 1 {
        Some(n_steps - 1)
    } else {
        Some(line + 1)
    }
}

/// First document line owned by step `step`.
///
/// Step `n` is produced by the command on line `n - 1`; step 0 is the
/// initial state and starts at the top of the document.
pub fn step_start_line(step: usize) -> u32 {
    u32::try_from(step.saturating_sub(1)).unwrap_or(u32::MAX)
}

/// Proof-state diagnostics attributed to step `k`.
pub fn diagnostics_at_step(proof: &ProofState, k: usize) -> Vec<&InteractiveDiagnostic> {
    let n = proof.steps.len();
    proof
        .diagnostics
        .iter()
        .filter(|d| step_for_line(d.start_line(), n) == Some(k))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ProofStep, TaggedText};
    use lsp_types::{Position, Range};

    fn basic(line: u32, sev: DiagnosticSeverity, msg: &str) -> Diagnostic {
        Diagnostic {
            range: Range::new(Position::new(line, 0), Position::new(line, 1)),
            severity: Some(sev),
            message: msg.to_string(),
            ..Default::default()
        }
    }

    fn interactive(line: u32, sev: DiagnosticSeverity, msg: &str) -> InteractiveDiagnostic {
        InteractiveDiagnostic {
            range: Range::new(Position::new(line, 0), Position::new(line, 1)),
            full_range: None,
            severity: Some(sev),
            message: TaggedText::from(msg),
        }
    }

    #[test]
    fn has_errors_is_false_for_absent_empty_and_warnings() {
        assert!(!has_errors(None));
        assert!(!has_errors(Some(&[])));
        let ws = vec![
            basic(1, DiagnosticSeverity::WARNING, "unused variable"),
            basic(2, DiagnosticSeverity::INFORMATION, "note"),
        ];
        assert!(!has_errors(Some(&ws)));
    }

    #[test]
    fn has_errors_exempts_unsolved_goals() {
        let ds = vec![basic(1, DiagnosticSeverity::ERROR, "unsolved goals\n⊢ 2 = 2")];
        assert!(!has_errors(Some(&ds)));
        let ds = vec![
            basic(1, DiagnosticSeverity::ERROR, "unsolved goals"),
            basic(2, DiagnosticSeverity::ERROR, "unknown tactic"),
        ];
        assert!(has_errors(Some(&ds)));
    }

    #[test]
    fn has_errors_marker_must_be_a_prefix() {
        let ds = vec![basic(1, DiagnosticSeverity::ERROR, "error: unsolved goals")];
        assert!(has_errors(Some(&ds)));
    }

    #[test]
    fn interactive_predicate_has_no_message_exemption() {
        assert!(!has_interactive_errors(None));
        let ds = vec![interactive(1, DiagnosticSeverity::ERROR, "unsolved goals")];
        assert!(has_interactive_errors(Some(&ds)));
        let ds = vec![interactive(1, DiagnosticSeverity::WARNING, "declaration uses 'sorry'")];
        assert!(!has_interactive_errors(Some(&ds)));
    }

    #[test]
    fn step_mapping_tie_breaks() {
        // 4 steps: initial + three commands.
        assert_eq!(step_for_line(0, 4), None);
        assert_eq!(step_for_line(1, 4), Some(2));
        assert_eq!(step_for_line(2, 4), Some(3));
        assert_eq!(step_for_line(3, 4), Some(3));
        assert_eq!(step_for_line(17, 4), Some(3));
        assert_eq!(step_for_line(5, 0), None);
        assert_eq!(step_for_line(0, 1), None);
        assert_eq!(step_for_line(1, 1), Some(0));
    }

    #[test]
    fn diagnostics_at_step_uses_mapping() {
        let proof = ProofState {
            steps: vec![ProofStep::default(); 3],
            diagnostics: vec![
                interactive(0, DiagnosticSeverity::INFORMATION, "banner"),
                interactive(2, DiagnosticSeverity::ERROR, "late"),
                interactive(9, DiagnosticSeverity::WARNING, "later"),
            ],
            ..Default::default()
        };
        assert!(diagnostics_at_step(&proof, 0).is_empty());
        assert!(diagnostics_at_step(&proof, 1).is_empty());
        assert_eq!(diagnostics_at_step(&proof, 2).len(), 2);
    }

    #[test]
    fn last_step_errors_follow_interactive_predicate() {
        let mut proof = ProofState {
            steps: vec![ProofStep::default()],
            ..Default::default()
        };
        assert!(!last_step_has_errors(&proof));
        proof.steps.push(ProofStep {
            command: "rfl".to_string(),
            errors: vec![interactive(1, DiagnosticSeverity::ERROR, "unsolved goals")],
            ..Default::default()
        });
        assert!(last_step_has_errors(&proof));
        assert!(!last_step_has_errors(&ProofState::default()));
    }
}
