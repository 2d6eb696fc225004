//! Wire types exchanged with the game server.
//!
//! Field names follow the server's JSON (`camelCase`); every collection is
//! `#[serde(default)]` because older servers omit empty fields.

use lsp_types::{Diagnostic, DiagnosticSeverity, Position, Range};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// A location in the backing document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentPosition {
    pub uri: String,
    pub line: u32,
    pub character: u32,
}

impl DocumentPosition {
    pub fn new(uri: impl Into<String>, line: u32, character: u32) -> Self {
        Self {
            uri: uri.into(),
            line,
            character,
        }
    }

    /// Line 0, character 0 of `uri`; the default position for RPC calls.
    pub fn start_of(uri: impl Into<String>) -> Self {
        Self::new(uri, 0, 0)
    }

    pub fn position(&self) -> Position {
        Position::new(self.line, self.character)
    }

    /// `TextDocumentPositionParams` shape expected by `$/lean/rpc/*`.
    pub fn to_tdpp(&self) -> serde_json::Value {
        json!({
            "textDocument": { "uri": self.uri },
            "position": { "line": self.line, "character": self.character },
        })
    }
}

/// Lean's `TaggedText`: plain text, a concatenation, or text tagged with an embed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaggedText {
    Text(String),
    Append(Vec<TaggedText>),
    Tag(serde_json::Value, Box<TaggedText>),
}

impl TaggedText {
    /// Flatten to plain text, dropping embeds but keeping the text they wrap.
    pub fn to_plain(&self) -> String {
        let mut out = String::new();
        self.push_plain(&mut out);
        out
    }

    fn push_plain(&self, out: &mut String) {
        match self {
            TaggedText::Text(s) => out.push_str(s),
            TaggedText::Append(xs) => {
                for x in xs {
                    x.push_plain(out);
                }
            }
            TaggedText::Tag(_, inner) => inner.push_plain(out),
        }
    }
}

impl From<&str> for TaggedText {
    fn from(s: &str) -> Self {
        TaggedText::Text(s.to_string())
    }
}

/// Diagnostic as returned inside proof states and by `getInteractiveDiagnostics`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractiveDiagnostic {
    pub range: Range,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_range: Option<Range>,
    #[serde(default)]
    pub severity: Option<DiagnosticSeverity>,
    pub message: TaggedText,
}

impl InteractiveDiagnostic {
    pub fn start_line(&self) -> u32 {
        self.range.start.line
    }

    pub fn is_error(&self) -> bool {
        self.severity == Some(DiagnosticSeverity::ERROR)
    }

    /// Basic LSP diagnostic with the message flattened to plain text.
    pub fn to_basic(&self) -> Diagnostic {
        Diagnostic {
            range: self.range,
            severity: self.severity,
            message: self.message.to_plain(),
            ..Default::default()
        }
    }
}

/// A named, typed entry of a goal's local context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hypothesis {
    #[serde(rename = "userName")]
    pub user_name: String,
    #[serde(rename = "type")]
    pub type_: String,
}

/// A message attached to a goal. Spoilers are hints hidden by default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalMessage {
    pub message: String,
    #[serde(default)]
    pub spoiler: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Goal {
    #[serde(default)]
    pub objects: Vec<Hypothesis>,
    #[serde(default)]
    pub assumptions: Vec<Hypothesis>,
    pub goal: String,
    #[serde(default)]
    pub messages: Vec<GoalMessage>,
}

impl Goal {
    /// Messages shown without the user asking for help.
    pub fn open_messages(&self) -> impl Iterator<Item = &GoalMessage> {
        self.messages.iter().filter(|m| !m.spoiler)
    }

    pub fn hints(&self) -> impl Iterator<Item = &GoalMessage> {
        self.messages.iter().filter(|m| m.spoiler)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameHint {
    pub text: String,
    #[serde(default)]
    pub hidden: bool,
}

/// One submitted command and the state it produced.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProofStep {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub goals: Vec<Goal>,
    #[serde(default, alias = "diags")]
    pub errors: Vec<InteractiveDiagnostic>,
    #[serde(default)]
    pub hints: Vec<GameHint>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofState {
    #[serde(default)]
    pub steps: Vec<ProofStep>,
    #[serde(default)]
    pub diagnostics: Vec<InteractiveDiagnostic>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub completed_with_warnings: bool,
}

impl ProofState {
    pub fn last_step(&self) -> Option<&ProofStep> {
        self.steps.last()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractiveHypothesisBundle {
    pub names: Vec<String>,
    #[serde(rename = "type")]
    pub type_: TaggedText,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub val: Option<TaggedText>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractiveGoal {
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub goal_prefix: Option<String>,
    #[serde(default)]
    pub hyps: Vec<InteractiveHypothesisBundle>,
    #[serde(rename = "type")]
    pub type_: TaggedText,
    #[serde(default)]
    pub hints: Vec<GameHint>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InteractiveGoals {
    #[serde(default)]
    pub goals: Vec<InteractiveGoal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractiveTermGoal {
    #[serde(default)]
    pub hyps: Vec<InteractiveHypothesisBundle>,
    #[serde(rename = "type")]
    pub type_: TaggedText,
    #[serde(default)]
    pub range: Option<Range>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserWidgetInstance {
    pub id: String,
    #[serde(default)]
    pub javascript_hash: String,
    #[serde(default)]
    pub props: serde_json::Value,
    #[serde(default)]
    pub range: Option<Range>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UserWidgets {
    #[serde(default)]
    pub widgets: Vec<UserWidgetInstance>,
}

/// Payload of a `textDocument/publishDiagnostics` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsPublished {
    pub uri: String,
    pub diagnostics: Vec<Diagnostic>,
}

/// Unsolicited traffic from the server, delivered in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    DiagnosticsPublished(DiagnosticsPublished),
    /// The server process went away; in-flight calls will fail.
    Exited { reason: String },
}
