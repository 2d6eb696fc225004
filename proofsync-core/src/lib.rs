//! `proofsync-core`: client-side proof-state synchronization for Lean game servers.
//!
//! Scope:
//! - talk to a game server over stdio (LSP + Lean RPC), see [`transport`]
//! - typed RPC calls with one failure type, see [`rpc`]
//! - classify diagnostics and attribute them to proof steps, see [`diagnostics`]
//! - own the proof state and its crash/initializing/ready status, see [`manager`]
//! - the single-line command input that writes into the document, see [`typewriter`]
//!
//! Data flow: the typewriter edits the [`document`], the edit is mirrored to the
//! server, the manager reloads the proof state over RPC, and `publishDiagnostics`
//! notifications arrive on an ordered [`ServerEvent`] queue that the driver hands
//! to both the manager and the typewriter. Consumers read snapshots or
//! subscribe to the manager's watch channel.
//!
//! Entrypoints:
//! - the CLI binary lives in `proofsync-core/src/bin/proofsync.rs`
//!
//! Environment: see [`config`].

pub mod config;
pub mod diagnostics;
pub mod document;
pub mod manager;
pub mod rpc;
pub mod session;
pub mod transport;
pub mod typewriter;
pub mod types;

pub use config::{Config, ConfigError};
pub use diagnostics::{has_errors, has_interactive_errors, last_step_has_errors, step_for_line};
pub use document::{DocumentEditor, TextDocument};
pub use manager::{
    EmptyPayloadPolicy, LoadOutcome, ManagerError, ManagerOptions, Phase, ProofStateManager,
    ProofView, Status,
};
pub use rpc::{RpcBackend, RpcClient, RpcFailure, RpcFailureKind, RpcOptions};
pub use session::Session;
pub use transport::LeanServer;
pub use typewriter::Typewriter;
pub use types::{
    DiagnosticsPublished, DocumentPosition, Goal, InteractiveDiagnostic, ProofState, ProofStep,
    ServerEvent,
};
