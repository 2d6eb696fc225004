//! The editable document the typewriter writes into.
//!
//! Positions are LSP positions: zero-based lines, characters counted in UTF-16
//! code units (what Lean servers expect).

use lsp_types::{Position, Range};

/// Editor surface the typewriter drives.
pub trait DocumentEditor {
    fn uri(&self) -> &str;
    /// Replace `range` with `text`.
    fn insert_text(&mut self, range: Range, text: &str);
    fn cursor_position(&self) -> Position;
    fn set_cursor_position(&mut self, pos: Position);
    fn document_end_position(&self) -> Position;
}

/// Full-text snapshot emitted after every edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentChange {
    pub uri: String,
    pub version: i32,
    pub text: String,
}

/// Receiver of document changes (the server connection, in practice).
pub trait ChangeSink: Send {
    fn send_change(&self, change: DocumentChange);
}

/// In-memory document with a single cursor.
pub struct TextDocument {
    uri: String,
    text: String,
    version: i32,
    cursor: Position,
    sink: Option<Box<dyn ChangeSink>>,
}

impl std::fmt::Debug for TextDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextDocument")
            .field("uri", &self.uri)
            .field("version", &self.version)
            .field("cursor", &self.cursor)
            .field("len", &self.text.len())
            .finish()
    }
}

impl TextDocument {
    pub fn new(uri: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            text: text.into(),
            version: 1,
            cursor: Position::new(0, 0),
            sink: None,
        }
    }

    /// Forward every subsequent edit to `sink`.
    pub fn with_sink(mut self, sink: Box<dyn ChangeSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    /// Byte offset of `pos`, clamped to the end of its line / the document.
    pub fn offset_at(&self, pos: Position) -> usize {
        let mut line = 0u32;
        let mut col = 0u32;
        for (i, ch) in self.text.char_indices() {
            if line == pos.line && col >= pos.character {
                return i;
            }
            if ch == '\n' {
                if line == pos.line {
                    return i;
                }
                line += 1;
                col = 0;
            } else {
                col += ch.len_utf16() as u32;
            }
        }
        self.text.len()
    }

    pub fn position_at(&self, offset: usize) -> Position {
        let mut line = 0u32;
        let mut col = 0u32;
        for (i, ch) in self.text.char_indices() {
            if i >= offset {
                break;
            }
            if ch == '\n' {
                line += 1;
                col = 0;
            } else {
                col += ch.len_utf16() as u32;
            }
        }
        Position::new(line, col)
    }

    fn clamp(&self, pos: Position) -> Position {
        self.position_at(self.offset_at(pos))
    }

    fn bump(&mut self) {
        self.version = self.version.saturating_add(1);
        if let Some(sink) = &self.sink {
            sink.send_change(DocumentChange {
                uri: self.uri.clone(),
                version: self.version,
                text: self.text.clone(),
            });
        }
    }
}

impl DocumentEditor for TextDocument {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn insert_text(&mut self, range: Range, text: &str) {
        let start = self.offset_at(range.start);
        let end = self.offset_at(range.end).max(start);
        self.text.replace_range(start..end, text);
        self.cursor = self.clamp(self.cursor);
        self.bump();
    }

    fn cursor_position(&self) -> Position {
        self.cursor
    }

    fn set_cursor_position(&mut self, pos: Position) {
        self.cursor = self.clamp(pos);
    }

    fn document_end_position(&self) -> Position {
        self.position_at(self.text.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Recorder(Arc<Mutex<Vec<DocumentChange>>>);

    impl ChangeSink for Recorder {
        fn send_change(&self, change: DocumentChange) {
            self.0.lock().unwrap().push(change);
        }
    }

    #[test]
    fn offsets_and_positions_roundtrip_on_lines() {
        let d = TextDocument::new("file:///a.lean", "ab\ncd\n");
        assert_eq!(d.offset_at(Position::new(1, 1)), 4);
        assert_eq!(d.position_at(4), Position::new(1, 1));
        assert_eq!(d.document_end_position(), Position::new(2, 0));
        // Past end of line clamps to the newline.
        assert_eq!(d.offset_at(Position::new(0, 99)), 2);
    }

    #[test]
    fn characters_are_utf16_units() {
        let d = TextDocument::new("file:///a.lean", "⊢ 𝔽 x");
        // '⊢' is 1 unit, '𝔽' is 2 units.
        assert_eq!(d.document_end_position(), Position::new(0, 6));
        assert_eq!(&d.text()[d.offset_at(Position::new(0, 5))..], "x");
    }

    #[test]
    fn insert_replaces_range_and_notifies_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut d = TextDocument::new("file:///a.lean", "intro x\nsimp\n")
            .with_sink(Box::new(Recorder(Arc::clone(&seen))));
        let cur = Position::new(1, 0);
        d.set_cursor_position(cur);
        let end = d.document_end_position();
        d.insert_text(Range::new(cur, end), "rfl\n");
        assert_eq!(d.text(), "intro x\nrfl\n");
        assert_eq!(d.cursor_position(), cur);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].version, 2);
        assert_eq!(seen[0].text, "intro x\nrfl\n");
    }
}
