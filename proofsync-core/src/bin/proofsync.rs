use proofsync_core as psc;
use proofsync_core::document::DocumentEditor;
use proofsync_core::rpc::RpcFailureKind;
use psc::{
    Config, DocumentPosition, LeanServer, LoadOutcome, ManagerError, ProofStateManager,
    ServerEvent, TextDocument, Typewriter,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn arg_value(args: &[String], key: &str) -> Option<String> {
    args.iter()
        .position(|a| a == key)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn arg_flag(args: &[String], key: &str) -> bool {
    args.iter().any(|a| a == key)
}

fn arg_u64(args: &[String], key: &str) -> Option<u64> {
    arg_value(args, key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn usage() -> String {
    [
        "proofsync (Rust): typewriter client for Lean game servers.",
        "",
        "Commands:",
        "  repl  --game <dir> --file <relpath> [--timeout-s N] [--idle-ms N] [--write]",
        "  run   --game <dir> --file <relpath> --commands <path> [--timeout-s N] [--idle-ms N] [--write]",
        "  state --game <dir> --file <relpath> [--timeout-s N] [--idle-ms N]",
        "",
        "REPL input:",
        "  <tactic>      submit one command",
        "  :state        print the current snapshot",
        "  :goals        interactive goals at the cursor",
        "  :diags        interactive diagnostics for the whole document",
        "  :widgets      widgets at the cursor",
        "  :select [N]   select step N (or clear)",
        "  :undo N       delete step N and everything after it",
        "  :quit",
        "",
        "Notes:",
        "- Output is JSON lines on stdout; logs go to stderr (RUST_LOG or PROOFSYNC_LOG).",
        "- The server is `lake serve` in --game unless PROOFSYNC_SERVER_CMD/ARGS say otherwise.",
    ]
    .join("\n")
}

fn emit(v: serde_json::Value) {
    println!("{v}");
}

type LoadResult = Result<LoadOutcome, ManagerError>;

struct Driver {
    server: LeanServer,
    manager: ProofStateManager,
    typewriter: Typewriter,
    doc: TextDocument,
    loads_tx: mpsc::UnboundedSender<LoadResult>,
    loads_in_flight: usize,
}

impl Driver {
    fn emit_state(&self, why: &str) {
        let view = self.manager.snapshot();
        let hidden = Typewriter::is_hidden(&view.proof);
        emit(json!({
            "event": "state",
            "why": why,
            "view": view,
            "input": self.typewriter.input(),
            "processing": self.typewriter.processing(),
            "hidden": hidden,
        }));
    }

    fn spawn_load(&mut self) {
        let manager = self.manager.clone();
        let tx = self.loads_tx.clone();
        self.loads_in_flight += 1;
        tokio::spawn(async move {
            let _ = tx.send(manager.load_proof_state().await);
        });
    }

    fn cursor_pos(&self) -> DocumentPosition {
        let p = self.doc.cursor_position();
        DocumentPosition::new(self.doc.uri(), p.line, p.character)
    }

    async fn handle_load(&mut self, res: LoadResult) {
        self.loads_in_flight = self.loads_in_flight.saturating_sub(1);
        match res {
            Ok(LoadOutcome::Crashed(f)) if f.kind == RpcFailureKind::NeedsReconnect => {
                warn!("rpc session lost; reconnecting");
                match self.server.connect(self.doc.uri()).await {
                    Ok(session) => {
                        self.manager.set_session(session);
                        self.spawn_load();
                    }
                    Err(e) => warn!(error = %e, "reconnect failed"),
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "load skipped"),
        }
        self.typewriter.sync_with_proof(&self.manager.proof());
        self.emit_state("load");
    }

    fn handle_event(&mut self, ev: ServerEvent) {
        self.manager.handle_event(&ev);
        let changed = self.typewriter.handle_event(&mut self.doc, &ev);
        match &ev {
            ServerEvent::DiagnosticsPublished(_) if changed => {
                // Elaboration finished; the proof state is now authoritative.
                self.spawn_load();
                self.emit_state("diagnostics");
            }
            ServerEvent::DiagnosticsPublished(_) => {}
            // Input stays open; further loads report the crash.
            ServerEvent::Exited { .. } => self.emit_state("server"),
        }
    }

    /// Returns `false` when the session should end.
    async fn handle_line(&mut self, line: &str) -> bool {
        let line = line.trim();
        let (head, arg) = match line.split_once(char::is_whitespace) {
            Some((h, a)) => (h, a.trim()),
            None => (line, ""),
        };
        match head {
            "" => {}
            ":quit" | ":q" => return false,
            ":state" => self.emit_state("request"),
            ":goals" => {
                let res = self.manager.get_goals(self.cursor_pos()).await;
                emit(match res {
                    Ok(g) => json!({ "event": "goals", "goals": g }),
                    Err(e) => json!({ "event": "error", "error": e.to_string() }),
                });
            }
            ":widgets" => {
                let res = self.manager.get_widgets(self.cursor_pos()).await;
                emit(match res {
                    Ok(w) => json!({ "event": "widgets", "widgets": w }),
                    Err(e) => json!({ "event": "error", "error": e.to_string() }),
                });
            }
            ":diags" => {
                let end = self.doc.document_end_position().line + 1;
                let res = self.manager.get_diagnostics(0, end).await;
                emit(match res {
                    Ok(d) => json!({ "event": "diagnostics", "diagnostics": d }),
                    Err(e) => json!({ "event": "error", "error": e.to_string() }),
                });
            }
            ":select" => {
                self.manager.select_step(arg.parse::<usize>().ok());
                self.emit_state("select");
            }
            ":undo" => match arg.parse::<usize>() {
                Ok(n) => self.undo_from(n),
                Err(_) => emit(json!({ "event": "error", "error": "usage: :undo N" })),
            },
            _ if head.starts_with(':') => {
                emit(json!({ "event": "error", "error": format!("unknown command {head}") }));
            }
            _ => {
                self.typewriter.set_input(line);
                if self.typewriter.submit(&mut self.doc).is_some() {
                    self.spawn_load();
                }
            }
        }
        true
    }

    /// Remove the document lines of step `n` onward, then drop the steps.
    fn undo_from(&mut self, n: usize) {
        let line = psc::diagnostics::step_start_line(n);
        let start = lsp_types::Position::new(line, 0);
        let end = self.doc.document_end_position();
        if start.line <= end.line {
            self.doc.insert_text(lsp_types::Range::new(start, end), "");
            self.doc.set_cursor_position(start);
        }
        self.manager.delete_from_step(n);
        self.spawn_load();
        self.emit_state("undo");
    }

    async fn drive<R: AsyncBufRead + Unpin>(
        &mut self,
        input: R,
        mut events: mpsc::UnboundedReceiver<ServerEvent>,
        mut loads_rx: mpsc::UnboundedReceiver<LoadResult>,
        idle: StdDuration,
    ) {
        let mut lines = input.lines();
        let mut input_done = false;
        loop {
            let busy = self.typewriter.processing() || self.loads_in_flight > 0;
            tokio::select! {
                line = lines.next_line(), if !input_done && !self.typewriter.processing() => {
                    match line {
                        Ok(Some(l)) => {
                            if !self.handle_line(&l).await {
                                break;
                            }
                        }
                        Ok(None) => input_done = true,
                        Err(e) => {
                            warn!(error = %e, "input read failed");
                            input_done = true;
                        }
                    }
                }
                Some(ev) = events.recv() => self.handle_event(ev),
                Some(res) = loads_rx.recv() => self.handle_load(res).await,
                _ = tokio::time::sleep(idle), if input_done => {
                    if busy {
                        warn!("timed out waiting for the server to settle");
                    }
                    break;
                }
            }
        }
    }
}

async fn run_session(
    cfg: Config,
    file: PathBuf,
    commands: Option<PathBuf>,
    interactive: bool,
    idle: StdDuration,
    write_back: bool,
) -> Result<(), String> {
    let path = cfg.game_dir.join(&file);
    let text = std::fs::read_to_string(&path).unwrap_or_default();
    let uri = psc::transport::file_uri(&path).map_err(|e| e.to_string())?;

    let (server, events) = LeanServer::spawn(&cfg)
        .await
        .map_err(|e| format!("server: {e}"))?;
    server
        .open_document(&uri, &text)
        .map_err(|e| format!("open: {e}"))?;

    let mut doc = TextDocument::new(uri.clone(), text).with_sink(Box::new(server.clone()));
    doc.set_cursor_position(doc.document_end_position());

    let manager = ProofStateManager::new(Arc::new(server.clone()), cfg.manager_options());
    let mut session = None;
    for attempt in 1..=5u64 {
        match server.connect(&uri).await {
            Ok(s) => {
                session = Some(s);
                break;
            }
            Err(e) => {
                warn!(attempt, error = %e, "rpc connect failed");
                tokio::time::sleep(StdDuration::from_millis(200 * attempt)).await;
            }
        }
    }
    let session = session.ok_or_else(|| "could not open an rpc session".to_string())?;
    manager.set_session(session);

    let (loads_tx, loads_rx) = mpsc::unbounded_channel();
    let mut driver = Driver {
        server,
        manager,
        typewriter: Typewriter::new(uri),
        doc,
        loads_tx,
        loads_in_flight: 0,
    };
    driver.spawn_load();

    if interactive {
        let stdin = BufReader::new(tokio::io::stdin());
        driver.drive(stdin, events, loads_rx, idle).await;
    } else if let Some(p) = commands {
        let f = tokio::fs::File::open(&p)
            .await
            .map_err(|e| format!("failed to open {}: {e}", p.display()))?;
        driver.drive(BufReader::new(f), events, loads_rx, idle).await;
    } else {
        driver.drive(tokio::io::empty(), events, loads_rx, idle).await;
    }

    driver.emit_state("final");
    if write_back {
        std::fs::write(&path, driver.doc.text())
            .map_err(|e| format!("failed to write {}: {e}", path.display()))?;
        info!(path = %path.display(), "document written");
    }
    Ok(())
}

fn main() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();
    let cmd = args.get(1).map(|s| s.as_str()).unwrap_or("");
    let rest = args.get(2..).unwrap_or(&[]);

    if cmd.is_empty() || cmd == "--help" || cmd == "-h" || cmd == "help" {
        println!("{}", usage());
        return Ok(());
    }
    if !matches!(cmd, "repl" | "run" | "state") {
        return Err(format!("unknown command `{cmd}`\n\n{}", usage()));
    }

    let game = arg_value(rest, "--game")
        .ok_or_else(|| "missing --game".to_string())
        .map(PathBuf::from)?;
    let file = arg_value(rest, "--file")
        .ok_or_else(|| "missing --file".to_string())
        .map(PathBuf::from)?;
    let mut cfg = Config::from_env(&game).map_err(|e| format!("config: {e}"))?;
    if let Some(s) = arg_u64(rest, "--timeout-s") {
        cfg.rpc_timeout = StdDuration::from_secs(s);
    }
    let idle = StdDuration::from_millis(arg_u64(rest, "--idle-ms").unwrap_or(3_000));
    let write_back = arg_flag(rest, "--write");

    // Logs on stderr; stdout is the JSON stream.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_filter));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    let commands = match cmd {
        "run" => Some(
            arg_value(rest, "--commands")
                .ok_or_else(|| "missing --commands".to_string())
                .map(PathBuf::from)?,
        ),
        _ => None,
    };

    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| format!("failed to build tokio runtime: {e}"))?;
    rt.block_on(run_session(
        cfg,
        file,
        commands,
        cmd == "repl",
        idle,
        write_back && cmd != "state",
    ))
}
