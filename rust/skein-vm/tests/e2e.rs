//! End-to-end tests: compile Skein source and run it under both executors.

use skein_core::{ErrorKind, Settlement, ThreadId, ThreadStatus, Value};
use skein_runtime::{read_trace, verify_chain, LedgerError};
use skein_vm::{ExecutorKind, FnCapability, NoForeign, RunReport, RuntimeConfig, Session, SessionError};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

const BOTH: [ExecutorKind; 2] = [ExecutorKind::Local, ExecutorKind::Distributed];

fn config(kind: ExecutorKind) -> RuntimeConfig {
    let mut cfg = RuntimeConfig::default();
    cfg.executor.kind = kind;
    cfg.executor.workers = Some(4);
    cfg.run.timeout_ms = 20_000;
    cfg
}

fn session(source: &str, kind: ExecutorKind) -> Session {
    Session::from_source(source, config(kind), Arc::new(NoForeign)).expect("source should compile")
}

/// Helper: compile, run `entry(args)`, return the report.
fn run_with(source: &str, kind: ExecutorKind, entry: &str, args: Vec<Value>) -> RunReport {
    session(source, kind).run(entry, args).expect("run should settle")
}

fn run_main(source: &str, kind: ExecutorKind) -> RunReport {
    run_with(source, kind, "main", vec![])
}

fn run_local(source: &str) -> RunReport {
    run_main(source, ExecutorKind::Local)
}

fn run_distributed(source: &str) -> RunReport {
    run_main(source, ExecutorKind::Distributed)
}

fn temp_dir(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("skein-e2e-{}-{}", tag, uuid::Uuid::new_v4()))
}

fn wait_for_status(session: &Session, thread: ThreadId, status: ThreadStatus) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while session.status(thread).unwrap() != status {
        assert!(Instant::now() < deadline, "{} never reached {}", thread, status);
        std::thread::sleep(Duration::from_millis(5));
    }
}

const ADD: &str = r#"
fn add(x, y) { x + y }
fn main() {
    x = async add(2, 3)
    await x
}
"#;

const REVERSE: &str = r#"
fn id(i) { i }

fn spawn_all(i, n, acc) {
    if i == n { acc } else { spawn_all(i + 1, n, append(acc, async id(i))) }
}

fn collect(threads, i, acc) {
    if i < 0 { acc } else { collect(threads, i - 1, append(acc, await nth(threads, i))) }
}

fn main() {
    threads = spawn_all(0, 100, [])
    collect(threads, 99, [])
}
"#;

// ─── Spawn and await ───

#[test]
fn e2e_async_add_local() {
    assert_eq!(run_local(ADD).value(), Some(&Value::Int(5)));
}

#[test]
fn e2e_async_add_distributed() {
    assert_eq!(run_distributed(ADD).value(), Some(&Value::Int(5)));
}

#[test]
fn e2e_if_expression_on_float_input() {
    let src = r#"fn f(x) { if x > 0.5 { "yes" } else { "no" } }"#;
    for kind in BOTH {
        let yes = run_with(src, kind, "f", vec![Value::Float(0.7)]);
        let no = run_with(src, kind, "f", vec![Value::Float(0.3)]);
        assert_eq!(yes.value(), Some(&Value::Str("yes".into())));
        assert_eq!(no.value(), Some(&Value::Str("no".into())));
    }
}

#[test]
fn e2e_hundred_threads_awaited_in_reverse() {
    let expected = Value::List((0..100).rev().map(Value::Int).collect());
    for kind in BOTH {
        let session = session(REVERSE, kind);
        let report = session.run("main", vec![]).unwrap();
        assert_eq!(report.value(), Some(&expected), "{:?}", kind);

        let ledger = session.ledger();
        assert_eq!(ledger.threads().len(), 101);
        for thread in ledger.threads() {
            assert_eq!(
                ledger.settle(thread, Settlement::Resolved(Value::Null)),
                Err(LedgerError::AlreadySettled(thread))
            );
        }
    }
}

#[test]
fn e2e_nested_spawns_and_chained_awaits() {
    let src = r#"
fn leaf(n) { n * 10 }
fn mid(n) { a = async leaf(n); b = async leaf(n + 1); await a + await b }
fn main() { x = async mid(1); y = async mid(2); await x + await y }
"#;
    for kind in BOTH {
        assert_eq!(run_main(src, kind).value(), Some(&Value::Int(80)), "{:?}", kind);
    }
}

#[test]
fn e2e_await_non_thread_passes_value_through() {
    for kind in BOTH {
        let report = run_main("fn main() { await [1, 2] }", kind);
        assert_eq!(report.value(), Some(&Value::List(vec![Value::Int(1), Value::Int(2)])));
    }
}

// ─── Failures ───

#[test]
fn e2e_type_error_propagates_with_origin() {
    let src = r#"
fn bad() { "yes" < true }
fn main() { t = async bad(); await t }
"#;
    for kind in BOTH {
        let session = session(src, kind);
        let report = session.run("main", vec![]).unwrap();
        let failure = report.failure().expect("main should fail");
        assert_eq!(failure.kind, ErrorKind::TypeError);
        assert_eq!(failure.origin, ThreadId::new(1));
        assert!(failure.to_string().contains("thread:1"), "{}", failure);
        assert_eq!(session.status(ThreadId::new(0)).unwrap(), ThreadStatus::Failed);
        assert_eq!(session.status(ThreadId::new(1)).unwrap(), ThreadStatus::Failed);
    }
}

#[test]
fn e2e_failure_travels_up_an_await_chain() {
    let src = r#"
fn bottom() { 1 / 0 }
fn middle() { await async bottom() }
fn main() { await async middle() }
"#;
    for kind in BOTH {
        let failure = run_main(src, kind).failure().cloned().expect("main should fail");
        assert_eq!(failure.kind, ErrorKind::ArithmeticError);
        assert_eq!(failure.origin, ThreadId::new(2));
    }
}

#[test]
fn e2e_self_await_is_deadlock() {
    for kind in BOTH {
        let report = run_with("fn main(t) { await t }", kind, "main", vec![Value::Thread(ThreadId::new(0))]);
        assert_eq!(report.failure().map(|f| f.kind), Some(ErrorKind::Deadlock), "{:?}", kind);
    }
}

#[test]
fn e2e_mutual_await_is_deadlock() {
    let src = r#"
fn other(t) { await t }
fn main(a, b) {
    x = async other(b)
    y = async other(a)
    await x
}
"#;
    // Thread 1 awaits thread 2 and thread 2 awaits thread 1; whichever
    // registers second closes the cycle.
    for kind in BOTH {
        let args = vec![Value::Thread(ThreadId::new(1)), Value::Thread(ThreadId::new(2))];
        let report = run_with(src, kind, "main", args);
        assert_eq!(report.failure().map(|f| f.kind), Some(ErrorKind::Deadlock), "{:?}", kind);
    }
}

#[test]
fn e2e_stack_overflow() {
    for kind in BOTH {
        let report = run_main("fn down(n) { down(n + 1) }\nfn main() { down(0) }", kind);
        assert_eq!(report.failure().map(|f| f.kind), Some(ErrorKind::StackOverflow));
    }
}

// ─── Chained results ───

#[test]
fn e2e_thread_valued_result_chains_to_the_inner_value() {
    let src = r#"
fn inner() { 5 }
fn outer() { async inner() }
fn main() { await async outer() }
"#;
    for kind in BOTH {
        let report = run_main(src, kind);
        assert_eq!(report.settlement, Settlement::Resolved(Value::Int(5)), "{:?}", kind);
    }
}

#[test]
fn e2e_entry_returning_a_thread_settles_with_it() {
    for kind in BOTH {
        let session = session("fn inner(n) { n * 2 }\nfn main() { async inner(21) }", kind);
        let report = session.run("main", vec![]).unwrap();
        assert_eq!(report.value(), Some(&Value::Int(42)));
        assert_eq!(session.status(report.entry).unwrap(), ThreadStatus::Resolved);
    }
}

#[test]
fn e2e_chained_failure_keeps_inner_origin() {
    let src = r#"
fn bad() { 1 / 0 }
fn relay() { async bad() }
fn main() { await async relay() }
"#;
    for kind in BOTH {
        let report = run_main(src, kind);
        let failure = report.failure().expect("chained failure");
        assert_eq!(failure.kind, ErrorKind::ArithmeticError);
        assert_eq!(failure.origin, ThreadId::new(2));
    }
}

#[test]
fn e2e_result_chained_on_itself_is_deadlock() {
    for kind in BOTH {
        let report = run_with("fn main(t) { t }", kind, "main", vec![Value::Thread(ThreadId::new(0))]);
        assert_eq!(report.failure().map(|f| f.kind), Some(ErrorKind::Deadlock));
    }
}

// ─── Suspension ───

#[test]
fn e2e_await_on_never_settling_thread_stays_suspended() {
    for kind in BOTH {
        let mut cfg = config(kind);
        cfg.run.timeout_ms = 100;
        let session = Session::from_source("fn main(t) { await t }", cfg, Arc::new(NoForeign)).unwrap();
        let never = session.ledger().next_thread_id();
        session.ledger().create(never).unwrap();

        match session.run("main", vec![Value::Thread(never)]) {
            Err(SessionError::Timeout { thread, .. }) => assert_eq!(thread, ThreadId::new(1)),
            other => panic!("expected timeout, got {:?}", other.map(|r| r.settlement)),
        }
        let main = ThreadId::new(1);
        assert_eq!(session.status(main).unwrap(), ThreadStatus::Suspended);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(session.status(main).unwrap(), ThreadStatus::Suspended, "{:?}", kind);
    }
}

#[test]
fn e2e_many_waiters_are_all_released() {
    for kind in BOTH {
        let session = session("fn waiter(t) { await t }", kind);
        let target = session.ledger().next_thread_id();
        session.ledger().create(target).unwrap();

        let waiters: Vec<ThreadId> =
            (0..8).map(|_| session.spawn("waiter", vec![Value::Thread(target)]).unwrap()).collect();
        for w in &waiters {
            wait_for_status(&session, *w, ThreadStatus::Suspended);
        }

        let mut released = session.force_fail(target, "deadline passed").unwrap();
        released.sort();
        assert_eq!(released, waiters);
        for w in &waiters {
            match session.executor().wait(*w, Some(Duration::from_secs(10))).unwrap() {
                Settlement::Failed(f) => {
                    assert_eq!(f.origin, target);
                    assert!(f.message.contains("deadline passed"));
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }
}

// ─── Determinism and tracing ───

#[test]
fn e2e_traces_are_deterministic_across_runs_and_executors() {
    let baseline = run_local(REVERSE);
    for report in [run_local(REVERSE), run_distributed(REVERSE), run_distributed(REVERSE)] {
        assert_eq!(report.value(), baseline.value());
        for thread in 0..=100 {
            let t = ThreadId::new(thread);
            assert_eq!(report.thread_trace(t), baseline.thread_trace(t), "{}", t);
        }
    }
}

#[test]
fn e2e_merged_trace_is_time_ordered() {
    for kind in BOTH {
        let report = run_main(ADD, kind);
        assert!(!report.trace.is_empty());
        assert!(report.trace.windows(2).all(|w| w[0].order_key() <= w[1].order_key()));
        let main: Vec<_> = report.trace.iter().filter(|e| e.thread == ThreadId::new(0)).collect();
        assert!(main.iter().enumerate().all(|(i, e)| e.seq == i as u64));
        assert_eq!(main.iter().filter(|e| e.opcode == "AWAIT").count(), 1);
    }
}

#[test]
fn e2e_trace_disabled_records_nothing() {
    let mut cfg = config(ExecutorKind::Local);
    cfg.trace.enabled = false;
    let report = Session::from_source(ADD, cfg, Arc::new(NoForeign)).unwrap().run("main", vec![]).unwrap();
    assert!(report.trace.is_empty());
    assert_eq!(report.value(), Some(&Value::Int(5)));
}

#[test]
fn e2e_trace_export_is_hash_chained() {
    let dir = temp_dir("trace");
    let mut cfg = config(ExecutorKind::Distributed);
    cfg.trace.dir = Some(dir.clone());
    let session = Session::from_source(ADD, cfg, Arc::new(NoForeign)).unwrap();
    let report = session.run("main", vec![]).unwrap();

    let path = report.trace_file.clone().expect("trace file");
    assert_eq!(path, dir.join(format!("{}.thread0.jsonl", session.id())));
    let records = read_trace(&path).unwrap();
    assert_eq!(records.len(), report.trace.len() + 2);
    assert_eq!(records[0].program_hash.as_deref(), Some(session.program().source_hash.as_str()));
    verify_chain(&records).unwrap();
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn e2e_each_run_traces_only_its_own_threads() {
    for kind in BOTH {
        let dir = temp_dir("runs");
        let mut cfg = config(kind);
        cfg.trace.dir = Some(dir.clone());
        let session = Session::from_source(ADD, cfg, Arc::new(NoForeign)).unwrap();
        let first = session.run("main", vec![]).unwrap();
        let second = session.run("main", vec![]).unwrap();

        let threads = |report: &RunReport| report.trace.iter().map(|e| e.thread.as_u64()).collect::<BTreeSet<_>>();
        assert_eq!(threads(&first), BTreeSet::from([0, 1]));
        assert_eq!(second.entry, ThreadId::new(2));
        assert_eq!(threads(&second), BTreeSet::from([2, 3]));
        assert_eq!(session.trace().len(), first.trace.len() + second.trace.len());

        let first_file = first.trace_file.clone().expect("first trace file");
        let second_file = second.trace_file.clone().expect("second trace file");
        assert_ne!(first_file, second_file);
        let records = read_trace(&first_file).unwrap();
        verify_chain(&records).unwrap();
        assert_eq!(records.len(), first.trace.len() + 2);
        assert!(records.iter().filter_map(|r| r.event.as_ref()).all(|e| e.thread.as_u64() < 2));
        let _ = std::fs::remove_dir_all(dir);
    }
}

// ─── Continuation storage ───

#[test]
fn e2e_file_store_with_compression() {
    let dir = temp_dir("conts");
    let mut cfg = config(ExecutorKind::Distributed);
    cfg.continuations.dir = Some(dir.clone());
    cfg.continuations.compress = true;
    let session = Session::from_source(REVERSE, cfg, Arc::new(NoForeign)).unwrap();
    let report = session.run("main", vec![]).unwrap();
    assert_eq!(report.value().map(|v| matches!(v, Value::List(items) if items.len() == 100)), Some(true));

    // Every continuation is deleted once its thread settles.
    let session_dir = dir.join(session.id());
    let deadline = Instant::now() + Duration::from_secs(10);
    while std::fs::read_dir(&session_dir).unwrap().count() > 0 {
        assert!(Instant::now() < deadline, "continuations left behind");
        std::thread::sleep(Duration::from_millis(5));
    }
    let _ = std::fs::remove_dir_all(dir);
}

// ─── Builtins and capabilities ───

#[test]
fn e2e_print_collects_output() {
    let src = r#"
fn greet(name) { print("hello", name); len(name) }
fn main() {
    a = async greet("ada")
    b = async greet("grace")
    await a + await b
}
"#;
    for kind in BOTH {
        let report = run_main(src, kind);
        assert_eq!(report.value(), Some(&Value::Int(8)));
        let mut output = report.output.clone();
        output.sort();
        assert_eq!(output, vec!["hello ada".to_string(), "hello grace".to_string()]);
    }
}

#[test]
fn e2e_foreign_capability_and_failure() {
    let src = r#"
import(double, host.math, 1)
import(explode, host.math, 0)
fn ok() { double(21) }
fn boom() { explode() }
fn main() { a = async ok(); b = async boom(); [await a, await b] }
"#;
    let host = FnCapability::new()
        .with("host.math.double", |args| match args.first() {
            Some(Value::Int(n)) => Ok(Value::Int(n * 2)),
            _ => Err("expected int".into()),
        })
        .with("host.math.explode", |_| Err("kaboom".into()));
    let host = Arc::new(host);
    for kind in BOTH {
        let report = Session::from_source(src, config(kind), host.clone()).unwrap().run("main", vec![]).unwrap();
        let failure = report.failure().expect("boom should fail main");
        assert_eq!(failure.kind, ErrorKind::ForeignCallError);
        assert_eq!(failure.origin, ThreadId::new(2));
        assert!(failure.message.contains("kaboom"));
    }
}

#[test]
fn e2e_compile_errors_never_reach_the_vm() {
    assert!(matches!(
        Session::from_source("fn main() { nope }", RuntimeConfig::default(), Arc::new(NoForeign)),
        Err(SessionError::Compile(_))
    ));
}
