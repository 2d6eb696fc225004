//! Stdio connection to a Lean (game) server.
//!
//! Wire format is LSP base protocol: `Content-Length` framed JSON-RPC 2.0.
//! One reader task decodes frames; one pump task owns the writer, assigns
//! request ids, routes responses to their waiters, answers server-initiated
//! requests, and forwards notifications as `ServerEvent`s in arrival order.
//!
//! On top of that this module speaks the Lean RPC extension
//! (`$/lean/rpc/connect`, `$/lean/rpc/call`, `$/lean/rpc/keepAlive`) and
//! implements `RpcBackend`.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lsp_types::{
    DidChangeTextDocumentParams, DidOpenTextDocumentParams, InitializeParams,
    PublishDiagnosticsParams, TextDocumentContentChangeEvent, TextDocumentItem, Uri,
    VersionedTextDocumentIdentifier,
};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::document::{ChangeSink, DocumentChange};
use crate::rpc::{RpcBackend, RpcFailure};
use crate::session::Session;
use crate::types::{DiagnosticsPublished, DocumentPosition, ServerEvent};

/// Reason reported for calls made before the handshake finished.
pub const NOT_RUNNING: &str = "Client is not running";

const MAX_HEADER_BYTES: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to spawn {cmd}: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },
    #[error("server process has no {0}")]
    MissingPipe(&'static str),
    #[error("initialize handshake failed: {0}")]
    Handshake(String),
    #[error("bad document uri `{0}`")]
    BadUri(String),
}

/// Build a `file://` URI for a path on disk.
pub fn file_uri(p: &Path) -> Result<String, TransportError> {
    url::Url::from_file_path(p)
        .map(|u| u.to_string())
        .map_err(|_| TransportError::BadUri(p.display().to_string()))
}

fn parse_uri(s: &str) -> Result<Uri, TransportError> {
    Uri::from_str(s).map_err(|_| TransportError::BadUri(s.to_string()))
}

pub fn encode_msg(v: &Value) -> Vec<u8> {
    let body = v.to_string();
    let mut out = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    out.extend_from_slice(body.as_bytes());
    out
}

pub async fn write_msg<W: AsyncWrite + Unpin>(w: &mut W, v: &Value) -> std::io::Result<()> {
    w.write_all(&encode_msg(v)).await?;
    w.flush().await
}

/// Read one framed message. `Ok(None)` on EOF or an unparseable frame header.
pub async fn read_one_msg<R: AsyncBufRead + Unpin>(r: &mut R) -> std::io::Result<Option<Value>> {
    let mut content_len: Option<usize> = None;
    let mut header_bytes = 0usize;
    loop {
        let mut line = String::new();
        let n = r.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        header_bytes += n;
        if header_bytes > MAX_HEADER_BYTES {
            return Ok(None);
        }
        let t = line.trim();
        if t.is_empty() {
            break;
        }
        if let Some(rest) = t.strip_prefix("Content-Length:") {
            content_len = rest.trim().parse::<usize>().ok();
        }
    }
    let Some(n) = content_len else {
        return Ok(None);
    };
    let mut body = vec![0u8; n];
    r.read_exact(&mut body).await?;
    match serde_json::from_slice::<Value>(&body) {
        Ok(v) => Ok(Some(v)),
        Err(e) => {
            warn!(error = %e, "dropping undecodable frame");
            Ok(Some(Value::Null))
        }
    }
}

type Waiter = oneshot::Sender<Result<Value, RpcFailure>>;

#[derive(Debug)]
enum Outgoing {
    Request {
        method: String,
        params: Value,
        resp: Waiter,
    },
    Notify {
        method: String,
        params: Value,
    },
}

#[derive(Debug, Default)]
struct Liveness {
    running: AtomicBool,
    exit_reason: Mutex<Option<String>>,
}

impl Liveness {
    fn failure(&self) -> RpcFailure {
        let exited = match self.exit_reason.lock() {
            Ok(g) => g.clone(),
            Err(p) => p.into_inner().clone(),
        };
        match exited {
            Some(reason) => RpcFailure::transport(format!("server exited: {reason}")),
            None => RpcFailure::transport(NOT_RUNNING).with_transient(true),
        }
    }

    fn mark_exited(&self, reason: &str) {
        self.running.store(false, Ordering::SeqCst);
        match self.exit_reason.lock() {
            Ok(mut g) => *g = Some(reason.to_string()),
            Err(p) => *p.into_inner() = Some(reason.to_string()),
        }
    }
}

struct Pump<W> {
    writer: W,
    next_id: u64,
    waiters: HashMap<u64, Waiter>,
    events: mpsc::UnboundedSender<ServerEvent>,
}

impl<W: AsyncWrite + Unpin> Pump<W> {
    async fn send(&mut self, out: Outgoing) {
        match out {
            Outgoing::Request {
                method,
                params,
                resp,
            } => {
                let id = self.next_id;
                self.next_id += 1;
                let msg = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
                if let Err(e) = write_msg(&mut self.writer, &msg).await {
                    let _ = resp.send(Err(RpcFailure::transport(format!(
                        "failed to write {method}: {e}"
                    ))));
                    return;
                }
                self.waiters.insert(id, resp);
            }
            Outgoing::Notify { method, params } => {
                let msg = json!({ "jsonrpc": "2.0", "method": method, "params": params });
                if let Err(e) = write_msg(&mut self.writer, &msg).await {
                    warn!(%method, error = %e, "failed to write notification");
                }
            }
        }
    }

    async fn dispatch(&mut self, msg: Value) {
        let method = msg.get("method").and_then(Value::as_str).map(str::to_string);
        let id = msg.get("id").cloned();

        match (method, id) {
            // Response to one of ours.
            (None, Some(id)) => {
                let Some(tx) = id.as_u64().and_then(|id| self.waiters.remove(&id)) else {
                    debug!(?id, "response for unknown request");
                    return;
                };
                let res = match msg.get("error") {
                    Some(err) => Err(RpcFailure::remote(
                        err.get("code").and_then(Value::as_i64).unwrap_or(0),
                        err.get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown error"),
                    )),
                    None => Ok(msg.get("result").cloned().unwrap_or(Value::Null)),
                };
                let _ = tx.send(res);
            }
            // Server-initiated request (registerCapability, workDoneProgress/create, ...).
            (Some(method), Some(id)) => {
                debug!(%method, "acknowledging server request");
                let ack = json!({ "jsonrpc": "2.0", "id": id, "result": Value::Null });
                if let Err(e) = write_msg(&mut self.writer, &ack).await {
                    warn!(%method, error = %e, "failed to acknowledge server request");
                }
            }
            (Some(method), None) if method == "textDocument/publishDiagnostics" => {
                let Some(params) = msg.get("params") else {
                    return;
                };
                match serde_json::from_value::<PublishDiagnosticsParams>(params.clone()) {
                    Ok(p) => {
                        let _ = self.events.send(ServerEvent::DiagnosticsPublished(
                            DiagnosticsPublished {
                                uri: p.uri.to_string(),
                                diagnostics: p.diagnostics,
                            },
                        ));
                    }
                    Err(e) => warn!(error = %e, "bad publishDiagnostics params"),
                }
            }
            (Some(method), None) => {
                debug!(%method, "ignoring notification");
            }
            (None, None) => {}
        }
    }

    fn fail_all(&mut self, failure: &RpcFailure) {
        for (_, tx) in self.waiters.drain() {
            let _ = tx.send(Err(failure.clone()));
        }
    }
}

async fn read_loop<R: AsyncRead + Unpin>(reader: R, tx: mpsc::UnboundedSender<Value>) {
    let mut reader = BufReader::new(reader);
    loop {
        match read_one_msg(&mut reader).await {
            Ok(Some(v)) => {
                if tx.send(v).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "read from server failed");
                break;
            }
        }
    }
}

async fn run_pump<W: AsyncWrite + Unpin>(
    mut pump: Pump<W>,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    mut incoming: mpsc::UnboundedReceiver<Value>,
    live: Arc<Liveness>,
) {
    let reason = loop {
        tokio::select! {
            out = rx.recv() => match out {
                Some(out) => pump.send(out).await,
                None => break "client closed".to_string(),
            },
            msg = incoming.recv() => match msg {
                Some(msg) => pump.dispatch(msg).await,
                None => break "server closed its output".to_string(),
            },
        }
    };
    live.mark_exited(&reason);
    pump.fail_all(&live.failure());
    let _ = pump.events.send(ServerEvent::Exited { reason });
}

struct ServerInner {
    tx: mpsc::UnboundedSender<Outgoing>,
    live: Arc<Liveness>,
    keepalive: Duration,
    keepalives: Mutex<HashMap<String, JoinHandle<()>>>,
    _child: Mutex<Option<Child>>,
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        let handles = match self.keepalives.get_mut() {
            Ok(m) => m,
            Err(p) => p.into_inner(),
        };
        for (_, h) in handles.drain() {
            h.abort();
        }
    }
}

/// Handle to a running server. Clones share the connection.
#[derive(Clone)]
pub struct LeanServer {
    inner: Arc<ServerInner>,
}

impl LeanServer {
    /// Spawn the configured server in `cfg.game_dir` and complete the handshake.
    pub async fn spawn(
        cfg: &Config,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerEvent>), TransportError> {
        let mut cmd = Command::new(&cfg.server_cmd);
        cmd.args(&cfg.server_args)
            .current_dir(&cfg.game_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        let cmd_s = format!("{} {}", cfg.server_cmd.display(), cfg.server_args.join(" "));
        info!(cmd = %cmd_s, cwd = %cfg.game_dir.display(), "starting server");

        let mut child = cmd.spawn().map_err(|source| TransportError::Spawn {
            cmd: cmd_s,
            source,
        })?;
        let stdin = child.stdin.take().ok_or(TransportError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(TransportError::MissingPipe("stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "proofsync_core::server_stderr", "{line}");
                }
            });
        }

        let root = file_uri(&cfg.game_dir).ok();
        Self::start(stdout, stdin, Some(child), root, cfg.keepalive, cfg.rpc_timeout).await
    }

    /// Run the protocol over arbitrary streams (used directly by tests).
    pub async fn start<R, W>(
        reader: R,
        writer: W,
        child: Option<Child>,
        root_uri: Option<String>,
        keepalive: Duration,
        handshake_timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerEvent>), TransportError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        // Unbounded so the reader never stalls while the pump is blocked on a write.
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let live = Arc::new(Liveness::default());

        tokio::spawn(read_loop(reader, in_tx));
        let pump = Pump {
            writer,
            next_id: 1,
            waiters: HashMap::new(),
            events: ev_tx,
        };
        tokio::spawn(run_pump(pump, rx, in_rx, Arc::clone(&live)));

        let server = Self {
            inner: Arc::new(ServerInner {
                tx,
                live,
                keepalive,
                keepalives: Mutex::new(HashMap::new()),
                _child: Mutex::new(child),
            }),
        };

        let mut params = InitializeParams {
            capabilities: lsp_types::ClientCapabilities::default(),
            ..Default::default()
        };
        if let Some(root) = root_uri {
            let uri = parse_uri(&root)?;
            params.workspace_folders = Some(vec![lsp_types::WorkspaceFolder {
                uri,
                name: "game".to_string(),
            }]);
        }
        let params = serde_json::to_value(params)
            .map_err(|e| TransportError::Handshake(format!("encode initialize: {e}")))?;
        let init = tokio::time::timeout(handshake_timeout, server.send_request("initialize", params))
            .await
            .map_err(|_| TransportError::Handshake("timeout waiting for initialize response".to_string()))?;
        init.map_err(|e| TransportError::Handshake(e.reason))?;
        server.notify("initialized", json!({}));
        server.inner.live.running.store(true, Ordering::SeqCst);
        info!("server initialized");
        Ok((server, ev_rx))
    }

    pub fn is_running(&self) -> bool {
        self.inner.live.running.load(Ordering::SeqCst)
    }

    fn notify(&self, method: &str, params: Value) {
        let out = Outgoing::Notify {
            method: method.to_string(),
            params,
        };
        if self.inner.tx.send(out).is_err() {
            debug!(%method, "notification dropped: connection closed");
        }
    }

    async fn send_request(&self, method: &str, params: Value) -> Result<Value, RpcFailure> {
        let (resp, rx) = oneshot::channel();
        let out = Outgoing::Request {
            method: method.to_string(),
            params,
            resp,
        };
        self.inner
            .tx
            .send(out)
            .map_err(|_| self.inner.live.failure())?;
        rx.await.map_err(|_| self.inner.live.failure())?
    }

    /// A request that requires a completed handshake.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, RpcFailure> {
        if !self.is_running() {
            return Err(self.inner.live.failure());
        }
        self.send_request(method, params).await
    }

    pub fn open_document(&self, uri: &str, text: &str) -> Result<(), TransportError> {
        let params = DidOpenTextDocumentParams {
            text_document: TextDocumentItem {
                uri: parse_uri(uri)?,
                language_id: "lean4".to_string(),
                version: 1,
                text: text.to_string(),
            },
        };
        self.notify("textDocument/didOpen", json!(params));
        Ok(())
    }

    /// Open an RPC session for `uri` and keep it alive until replaced.
    pub async fn connect(&self, uri: &str) -> Result<Session, RpcFailure> {
        let v = self.request("$/lean/rpc/connect", json!({ "uri": uri })).await?;
        let Some(sid) = v.get("sessionId") else {
            return Err(RpcFailure::decode("$/lean/rpc/connect", "missing sessionId"));
        };
        // Keep the id's JSON form verbatim; servers differ on number vs string.
        let session = Session::new(sid.to_string(), uri);
        self.start_keepalive(&session);
        info!(uri, session = session.id(), "rpc session connected");
        Ok(session)
    }

    fn start_keepalive(&self, session: &Session) {
        let tx = self.inner.tx.clone();
        let every = self.inner.keepalive;
        let params = json!({ "uri": session.uri(), "sessionId": session_id_json(session) });
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.tick().await;
            loop {
                tick.tick().await;
                let out = Outgoing::Notify {
                    method: "$/lean/rpc/keepAlive".to_string(),
                    params: params.clone(),
                };
                if tx.send(out).is_err() {
                    break;
                }
            }
        });
        let mut g = match self.inner.keepalives.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        if let Some(old) = g.insert(session.uri().to_string(), handle) {
            old.abort();
        }
    }
}

fn session_id_json(session: &Session) -> Value {
    serde_json::from_str(session.connection())
        .unwrap_or_else(|_| Value::String(session.connection().to_string()))
}

#[async_trait]
impl RpcBackend for LeanServer {
    async fn call(
        &self,
        session: &Session,
        pos: &DocumentPosition,
        method: &str,
        params: Value,
    ) -> Result<Value, RpcFailure> {
        let payload = json!({
            "textDocument": { "uri": pos.uri },
            "position": { "line": pos.line, "character": pos.character },
            "sessionId": session_id_json(session),
            "method": method,
            "params": params,
        });
        self.request("$/lean/rpc/call", payload).await
    }
}

impl ChangeSink for LeanServer {
    fn send_change(&self, change: DocumentChange) {
        let uri = match parse_uri(&change.uri) {
            Ok(u) => u,
            Err(e) => {
                warn!(error = %e, "not syncing document");
                return;
            }
        };
        let params = DidChangeTextDocumentParams {
            text_document: VersionedTextDocumentIdentifier {
                uri,
                version: change.version,
            },
            content_changes: vec![TextDocumentContentChangeEvent {
                range: None,
                range_length: None,
                text: change.text,
            }],
        };
        self.notify("textDocument/didChange", json!(params));
    }
}
