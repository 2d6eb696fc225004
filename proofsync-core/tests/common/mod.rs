#![allow(dead_code)]

use async_trait::async_trait;
use proofsync_core::{DocumentPosition, RpcBackend, RpcFailure, Session};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::oneshot;

type Reply = Result<Value, RpcFailure>;

enum Scripted {
    Now(Reply),
    Gated(oneshot::Receiver<Reply>),
}

#[derive(Debug, Clone)]
pub struct Call {
    pub method: String,
    pub connection: String,
    pub pos: DocumentPosition,
    pub params: Value,
}

/// Backend that answers from per-method queues. Gated replies block until
/// the test releases them, so completion order can be chosen freely.
#[derive(Default)]
pub struct FakeBackend {
    replies: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<Vec<Call>>,
}

impl FakeBackend {
    pub fn push(&self, method: &str, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_default()
            .push_back(Scripted::Now(reply));
    }

    pub fn push_gated(&self, method: &str) -> oneshot::Sender<Reply> {
        let (tx, rx) = oneshot::channel();
        self.replies
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_default()
            .push_back(Scripted::Gated(rx));
        tx
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RpcBackend for FakeBackend {
    async fn call(
        &self,
        session: &Session,
        pos: &DocumentPosition,
        method: &str,
        params: Value,
    ) -> Result<Value, RpcFailure> {
        self.calls.lock().unwrap().push(Call {
            method: method.to_string(),
            connection: session.connection().to_string(),
            pos: pos.clone(),
            params,
        });
        let next = self
            .replies
            .lock()
            .unwrap()
            .get_mut(method)
            .and_then(VecDeque::pop_front);
        match next {
            Some(Scripted::Now(r)) => r,
            Some(Scripted::Gated(rx)) => rx
                .await
                .unwrap_or_else(|_| Err(RpcFailure::transport("gate dropped"))),
            None => Err(RpcFailure::transport(format!("no reply scripted for {method}"))),
        }
    }
}

pub fn goal(target: &str) -> Value {
    json!({ "objects": [], "assumptions": [], "goal": target, "messages": [] })
}

pub fn error_diag(line: u32, msg: &str) -> Value {
    json!({
        "range": { "start": { "line": line, "character": 0 }, "end": { "line": line, "character": 3 } },
        "severity": 1,
        "message": { "text": msg }
    })
}

pub fn proof_json(commands: &[&str], completed: bool) -> Value {
    let steps: Vec<Value> = commands
        .iter()
        .map(|c| json!({ "command": c, "goals": [goal("a = a")], "errors": [] }))
        .collect();
    json!({ "steps": steps, "diagnostics": [], "completed": completed })
}
