mod common;

use common::{proof_json, FakeBackend};
use proofsync_core::rpc::GET_PROOF_STATE;
use proofsync_core::{RpcClient, RpcFailureKind, RpcOptions, Session};
use std::sync::Arc;

const DOC: &str = "file:///game/Level1.lean";

async fn wait_for_calls(fake: &FakeBackend, n: usize) {
    for _ in 0..1000 {
        if fake.calls().len() >= n {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("backend saw {} calls, wanted {n}", fake.calls().len());
}

#[tokio::test]
async fn swapped_session_applies_to_new_calls_only() {
    let fake = Arc::new(FakeBackend::default());
    let gate = fake.push_gated(GET_PROOF_STATE);
    fake.push(GET_PROOF_STATE, Ok(proof_json(&["", "rfl"], true)));
    let client = RpcClient::new(fake.clone(), Session::new("s1", DOC), RpcOptions::default());

    let c = client.clone();
    let first = tokio::spawn(async move { c.get_proof_state(None).await });
    wait_for_calls(&fake, 1).await;

    let s2 = Session::new("s2", DOC);
    client.update_session(s2.clone());
    assert_eq!(client.current_session().unwrap(), s2);

    gate.send(Ok(proof_json(&[""], false))).unwrap();
    let p = first.await.unwrap().unwrap().unwrap();
    assert_eq!(p.steps.len(), 1);

    let p = client.get_proof_state(None).await.unwrap().unwrap();
    assert!(p.completed);

    let calls = fake.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].connection, "s1");
    assert_eq!(calls[1].connection, "s2");
}

#[tokio::test]
async fn unbound_client_fails_fast_until_bound() {
    let fake = Arc::new(FakeBackend::default());
    let client = RpcClient::unbound(fake.clone(), RpcOptions::default());

    let err = client.get_proof_state(None).await.unwrap_err();
    assert_eq!(err.kind, RpcFailureKind::NoSession);
    assert!(!err.transient);
    let err = client.get_diagnostics(0, 5).await.unwrap_err();
    assert_eq!(err.kind, RpcFailureKind::NoSession);
    assert!(fake.calls().is_empty());

    fake.push(GET_PROOF_STATE, Ok(proof_json(&[""], false)));
    client.update_session(Session::new("s1", DOC));
    assert!(client.get_proof_state(None).await.unwrap().is_some());
    assert_eq!(fake.calls()[0].connection, "s1");
}
