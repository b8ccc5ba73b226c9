use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use arbiter::{
    Context, Controller, DecisionCallback, DiagnosticsRequest, Info, InMemoryStore, PolicyManager,
    QueryRequest, RingBuffer, TransactionParams,
};

const AUTHZ: &str = "package authz\ndefault allow = false\nallow { [u] = data.admins; u == input.user }";

struct Harness {
    controller: Arc<Controller>,
    buffer: Option<Arc<RingBuffer>>,
    seen: Arc<Mutex<Vec<Info>>>,
}

fn harness(with_buffer: bool, policies: &[(&str, &str)]) -> Harness {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback: DecisionCallback = Arc::new(move |_ctx: &Context, info: &Info| {
        sink.lock().unwrap().push(info.clone());
    });

    let buffer = with_buffer.then(|| Arc::new(RingBuffer::new(8)));
    let mut builder = Controller::builder()
        .with_store(Arc::new(InMemoryStore::from_value(json!({"admins": ["alice"]}))))
        .with_manager(Arc::new(PolicyManager::new()))
        .with_decision_logger(callback)
        .with_decision_id_factory(Arc::new(|| "decision-1".to_string()));
    if let Some(buffer) = &buffer {
        builder = builder.with_diagnostics_buffer(buffer.clone());
    }
    let controller = builder.build().unwrap();

    let ctx = Context::background();
    controller.init(&ctx).unwrap();
    let txn = controller
        .new_transaction(&ctx, TransactionParams::WRITE)
        .unwrap();
    controller.put_policy(&ctx, &txn, "authz", AUTHZ).unwrap();
    for (id, src) in policies {
        controller.put_policy(&ctx, &txn, id, src).unwrap();
    }
    controller.commit(&ctx, txn).unwrap();

    Harness {
        controller,
        buffer,
        seen,
    }
}

fn http_request() -> DiagnosticsRequest {
    DiagnosticsRequest {
        method: "POST".to_string(),
        path: "/v1/data/authz/allow".to_string(),
        remote_addr: "10.0.0.1:4000".to_string(),
        ..DiagnosticsRequest::default()
    }
}

fn decide(h: &Harness, request: &DiagnosticsRequest, user: &str) -> (Option<Value>, Arc<Info>) {
    let (outcome, info) = h.controller.decide(
        &Context::background(),
        request,
        QueryRequest::new("data.authz.allow").with_raw_input(json!({ "user": user })),
    );
    let value = outcome
        .into_result()
        .ok()
        .and_then(|r| r.results.first().map(|q| q.expressions[0].value.clone()));
    (value, info)
}

#[test]
fn callback_sees_every_decision_without_a_buffer() {
    let h = harness(false, &[("diag", "package system.diagnostics\nconfig = {\"mode\": \"all\"}")]);
    let (value, info) = decide(&h, &http_request(), "alice");

    assert_eq!(value, Some(json!(true)));
    let seen = h.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].decision_id, "decision-1");
    assert_eq!(seen[0].remote_addr, "10.0.0.1:4000");
    assert_eq!(seen[0].input, Some(json!({"user": "alice"})));
    // Diagnostics are off without a buffer, so nothing is traced.
    assert!(info.trace.is_none());
}

#[test]
fn mode_on_buffers_without_trace() {
    let h = harness(true, &[("diag", "package system.diagnostics\nconfig = {\"mode\": \"on\"}")]);
    decide(&h, &http_request(), "alice");

    let records = h.buffer.as_ref().unwrap().snapshot();
    assert_eq!(records.len(), 1);
    assert!(records[0].trace.is_none());
    assert!(records[0].error.is_none());
    assert_eq!(h.seen.lock().unwrap().len(), 1);
}

#[test]
fn mode_all_buffers_with_trace_and_instrumentation() {
    let h = harness(true, &[("diag", "package system.diagnostics\nconfig = {\"mode\": \"all\"}")]);
    let (_, info) = decide(&h, &http_request(), "alice");

    let records = h.buffer.as_ref().unwrap().snapshot();
    assert_eq!(records.len(), 1);
    let trace = records[0].trace.as_ref().unwrap();
    assert!(!trace.is_empty());
    assert!(info.metrics.contains_key("counter_eval_rule_evaluations"));
}

#[test]
fn mode_can_depend_on_the_request() {
    let h = harness(
        true,
        &[(
            "diag",
            "package system.diagnostics\nconfig = {\"mode\": \"all\"} { input.params.explain = [\"full\"] }",
        )],
    );
    let buffer = h.buffer.as_ref().unwrap();

    decide(&h, &http_request(), "alice");
    assert!(buffer.is_empty());

    let mut explained = http_request();
    explained
        .params
        .insert("explain".to_string(), vec!["full".to_string()]);
    decide(&h, &explained, "alice");
    assert_eq!(buffer.len(), 1);
    assert!(buffer.snapshot()[0].trace.is_some());
    assert_eq!(h.seen.lock().unwrap().len(), 2);
}

#[test]
fn failing_diagnostics_policy_does_not_change_the_decision() {
    let h = harness(
        true,
        &[(
            "diag",
            "package system.diagnostics\nconfig = {\"mode\": \"on\"}\nconfig = {\"mode\": \"all\"}",
        )],
    );
    let (allowed, _) = decide(&h, &http_request(), "alice");
    let (denied, _) = decide(&h, &http_request(), "bob");

    assert_eq!(allowed, Some(json!(true)));
    assert_eq!(denied, Some(json!(false)));
    assert!(h.buffer.as_ref().unwrap().is_empty());
    assert_eq!(h.seen.lock().unwrap().len(), 2);
}

#[test]
fn failed_query_is_recorded_with_its_error() {
    let h = harness(true, &[("diag", "package system.diagnostics\nconfig = {\"mode\": \"on\"}")]);
    let (outcome, info) = h.controller.decide(
        &Context::background(),
        &http_request(),
        QueryRequest::new("x == 1"),
    );

    assert!(!outcome.is_ok());
    assert!(info.results.is_none());
    let error = info.error.as_ref().unwrap();
    assert_eq!(error.code, "invalid_parameter");
    assert!(info.metrics.contains_key("timer_eval_query_parse_ns"));
    assert_eq!(h.buffer.as_ref().unwrap().len(), 1);
}

#[test]
fn records_carry_the_current_revision() {
    let h = harness(true, &[("diag", "package system.diagnostics\nconfig = {\"mode\": \"on\"}")]);
    let ctx = Context::background();
    let store = h.controller.store();
    let mut txn = store.new_transaction(&ctx, TransactionParams::WRITE).unwrap();
    store
        .write(
            &ctx,
            &mut txn,
            arbiter::PatchOp::Add,
            &arbiter::Path::parse("/system/bundle/manifest/revision").unwrap(),
            Some(json!("rev-7")),
        )
        .unwrap();
    store.commit(&ctx, txn).unwrap();

    let (_, info) = decide(&h, &http_request(), "alice");
    assert_eq!(info.revision, "rev-7");
    assert_eq!(h.buffer.as_ref().unwrap().snapshot()[0].revision, "rev-7");
}

#[test]
fn ring_buffer_keeps_the_most_recent_records() {
    let h = harness(true, &[("diag", "package system.diagnostics\nconfig = {\"mode\": \"on\"}")]);
    let buffer = h.buffer.as_ref().unwrap();
    for user in ["a", "b", "c", "d", "e", "f", "g", "h", "i", "j"] {
        decide(&h, &http_request(), user);
    }

    let records = buffer.snapshot();
    assert_eq!(records.len(), buffer.capacity());
    assert_eq!(records[0].input, Some(json!({"user": "c"})));
    assert_eq!(records[7].input, Some(json!({"user": "j"})));
}
