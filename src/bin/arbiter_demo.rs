//! arbiter-demo - walk a decision controller through its lifecycle.
//!
//! Loads a small authorization policy and a diagnostics policy, serves a few
//! decisions, commits a new bundle revision and prints what a watcher saw.
//! Set `RUST_LOG=arbiter=debug` to see the controller's hooks fire.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing_subscriber::EnvFilter;

use arbiter::{
    ArbiterResult, Context, Controller, ControllerConfig, DiagnosticsRequest, Info, InMemoryStore,
    PatchOp, Path, PolicyManager, QueryRequest, RingBuffer, Store, TransactionParams,
};

const AUTHZ_POLICY: &str = r#"package authz
default allow = false
allow { [u] = data.admins; u == input.user }
"#;

const DIAGNOSTICS_POLICY: &str = r#"package system.diagnostics
config = {"mode": "all"} { input.params.explain = ["full"] }
"#;

struct DemoConfig {
    buffer_size: usize,
    compiler_error_limit: usize,
}

fn parse_args() -> DemoConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = DemoConfig {
        buffer_size: 16,
        compiler_error_limit: ControllerConfig::default().compiler_error_limit,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--buffer-size" | "-b" => {
                config.buffer_size = numeric_arg(&args, i, "--buffer-size");
                i += 2;
            }
            "--error-limit" | "-e" => {
                config.compiler_error_limit = numeric_arg(&args, i, "--error-limit");
                i += 2;
            }
            "--help" | "-h" => {
                println!("arbiter-demo - decision controller walkthrough");
                println!();
                println!("USAGE:");
                println!("    arbiter-demo [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -b, --buffer-size <N>     Diagnostics ring buffer size [default: 16]");
                println!("    -e, --error-limit <N>     Compiler error limit, 0 = unlimited [default: 10]");
                println!("    -h, --help                Print help information");
                std::process::exit(0);
            }
            arg => {
                eprintln!("error: unknown argument: {arg}");
                std::process::exit(1);
            }
        }
    }

    config
}

fn numeric_arg(args: &[String], i: usize, name: &str) -> usize {
    match args.get(i + 1).map(|v| v.parse::<usize>()) {
        Some(Ok(n)) => n,
        Some(Err(_)) => {
            eprintln!("error: {name} expects a non-negative integer");
            std::process::exit(1);
        }
        None => {
            eprintln!("error: {name} requires a value");
            std::process::exit(1);
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("arbiter=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = parse_args();
    if let Err(err) = run(&config) {
        eprintln!("error [{}]: {err}", err.code());
        std::process::exit(1);
    }
}

fn run(config: &DemoConfig) -> ArbiterResult<()> {
    let ctx = Context::background();
    let store = Arc::new(InMemoryStore::from_value(json!({"admins": ["alice"]})));
    let buffer = Arc::new(RingBuffer::new(config.buffer_size));

    let controller = Controller::builder()
        .with_store(store.clone())
        .with_manager(Arc::new(PolicyManager::new()))
        .with_compiler_error_limit(config.compiler_error_limit)
        .with_diagnostics_buffer(buffer.clone())
        .with_decision_logger(Arc::new(|_ctx: &Context, info: &Info| {
            tracing::info!(
                decision_id = %info.decision_id,
                revision = %info.revision,
                query = %info.query,
                ok = info.error.is_none(),
                "decision"
            );
        }))
        .build()?;
    controller.init(&ctx)?;

    let txn = controller.new_transaction(&ctx, TransactionParams::WRITE)?;
    controller.put_policy(&ctx, &txn, "authz.policy", AUTHZ_POLICY)?;
    controller.put_policy(&ctx, &txn, "diagnostics.policy", DIAGNOSTICS_POLICY)?;
    controller.commit(&ctx, txn)?;

    let watch = controller.watch(&ctx, "x = data.authz.allow")?;
    if let Ok(event) = watch.recv_timeout(Duration::from_secs(1)) {
        println!("watch {:?}: {}", event.kind, to_json(&event.results));
    }

    let request = DiagnosticsRequest {
        method: "POST".to_string(),
        path: "/v1/data/authz/allow".to_string(),
        remote_addr: "127.0.0.1:9000".to_string(),
        ..DiagnosticsRequest::default()
    };
    for user in ["alice", "bob"] {
        let (outcome, info) = controller.decide(
            &ctx,
            &request,
            QueryRequest::new("data.authz.allow").with_raw_input(json!({ "user": user })),
        );
        let response = outcome.into_result()?;
        println!(
            "{user}: {} (decision {})",
            to_json(&response.results),
            info.decision_id
        );
    }

    let mut explained = request.clone();
    explained
        .params
        .insert("explain".to_string(), vec!["full".to_string()]);
    let (_, info) = controller.decide(
        &ctx,
        &explained,
        QueryRequest::new("data.authz.allow").with_raw_input(json!({"user": "alice"})),
    );
    println!(
        "explained decision {} captured {} trace events",
        info.decision_id,
        info.trace.as_ref().map_or(0, Vec::len)
    );

    let mut txn = store.new_transaction(&ctx, TransactionParams::WRITE)?;
    store.write(
        &ctx,
        &mut txn,
        PatchOp::Add,
        &Path::parse(&controller.config().revision_path)?,
        Some(json!("demo-1")),
    )?;
    store.write(
        &ctx,
        &mut txn,
        PatchOp::Replace,
        &Path::parse("/admins")?,
        Some(json!(["alice", "bob"])),
    )?;
    controller.commit(&ctx, txn)?;
    println!("revision is now {:?}", controller.revision());

    while let Some(event) = watch.try_recv() {
        println!("watch {:?}: {}", event.kind, to_json(&event.results));
    }

    println!("buffered {} decision record(s)", buffer.len());
    for info in buffer.snapshot() {
        println!("{}", to_json(info.as_ref()));
    }
    Ok(())
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|err| format!("<unserializable: {err}>"))
}
