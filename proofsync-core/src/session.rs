use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// A live binding between this client, one backend RPC connection, and one document.
///
/// Sessions are never mutated; a reconnect builds a new one. `id` is unique per
/// process and is what stale-result checks compare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    id: u64,
    connection: String,
    uri: String,
}

impl Session {
    pub fn new(connection: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            connection: connection.into(),
            uri: uri.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Backend connection handle (the Lean RPC `sessionId`).
    pub fn connection(&self) -> &str {
        &self.connection
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sessions_with_same_fields_are_distinct() {
        let a = Session::new("42", "file:///Game.lean");
        let b = Session::new("42", "file:///Game.lean");
        assert_ne!(a.id(), b.id());
        assert_ne!(a, b);
        assert_eq!(a.clone(), a);
    }
}
