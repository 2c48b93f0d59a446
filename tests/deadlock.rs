//! End-to-end deadlock detection over small assembled programs.
//!
//! Fixtures encode `lock (x) { ... }` the way compilers emit it: the
//! monitor enter before a protected region whose finally handler releases
//! the lock, with `leave` exiting the region.

use lovelock::analysis::callgraph::ChaCallGraphBuilder;
use lovelock::analysis::heap::HeapObject;
use lovelock::detector::lock::state::LockState;
use lovelock::detector::lock::{DeadlockDetector, InterproceduralLockAnalysis};
use lovelock::detector::report::Report;
use lovelock::program::builder::ProgramBuilder;
use lovelock::program::{ExceptionHandler, HandlerKind, MethodId, Opcode, Program, TypeId};
use lovelock::{AnalysisOptions, AnalysisSession, CancellationToken, Options};
use petgraph::visit::EdgeRef;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Attach a body that acquires `locks` front to back as properly nested
/// `lock` regions, innermost handler first in the handler table.
fn set_nested_lock_body(pb: &mut ProgramBuilder, method: MethodId, locks: &[TypeId]) {
    let wk = *pb.well_known();
    let n = locks.len();
    let mut ops = Vec::new();
    for &ty in locks {
        ops.push(Opcode::LoadToken(ty));
        ops.push(Opcode::Call(wk.get_type_from_handle));
        ops.push(Opcode::Call(wk.monitor_enter));
    }
    ops.push(Opcode::Nop);
    let mut handlers = Vec::new();
    let mut leave = (3 * n + 1) as u32;
    for k in (1..=n).rev() {
        let ty = locks[k - 1];
        ops.push(Opcode::Leave(leave + 5));
        ops.push(Opcode::LoadToken(ty));
        ops.push(Opcode::Call(wk.get_type_from_handle));
        ops.push(Opcode::Call(wk.monitor_exit));
        ops.push(Opcode::EndFinally);
        handlers.push(ExceptionHandler {
            kind: HandlerKind::Finally,
            try_start: (3 * k) as u32,
            try_end: leave + 1,
            handler_start: leave + 1,
            handler_end: leave + 5,
        });
        leave += 5;
    }
    ops.push(Opcode::Return);
    pb.set_body(method, vec![], ops, handlers);
}

fn locking_method(pb: &mut ProgramBuilder, holder: TypeId, name: &str, locks: &[TypeId]) -> MethodId {
    let method = pb.declare_static_method(holder, name, vec![], None);
    set_nested_lock_body(pb, method, locks);
    method
}

/// A `Main` that constructs one `ThreadStart` per target, as `new Thread`
/// call sites do.
fn spawning_main(pb: &mut ProgramBuilder, holder: TypeId, targets: &[MethodId]) -> MethodId {
    let thread_start = pb.add_delegate("System.Threading.ThreadStart", vec![]);
    let ctor = pb.method_of(thread_start, ".ctor").unwrap();
    let main = pb.declare_static_method(holder, "Main", vec![], None);
    let mut ops = Vec::new();
    for &target in targets {
        ops.push(Opcode::LoadConst);
        ops.push(Opcode::LoadFunction(target));
        ops.push(Opcode::NewObject(ctor));
        ops.push(Opcode::Pop);
    }
    ops.push(Opcode::Return);
    pb.set_body(main, vec![], ops, vec![]);
    main
}

fn analyze_with(program: &Program, entry: MethodId, options: AnalysisOptions) -> LockState {
    let token = CancellationToken::new();
    let call_graph = ChaCallGraphBuilder::new(program, token.clone())
        .build(entry)
        .unwrap();
    InterproceduralLockAnalysis::new(program, options, token)
        .run(&call_graph)
        .unwrap()
        .state
}

fn analyze(program: &Program, entry: MethodId) -> LockState {
    analyze_with(program, entry, AnalysisOptions::default())
}

/// A body that locks a static field the way compilers encode it: the
/// field is loaded once for the enter and reloaded in the finally
/// handler for the exit.
fn set_field_lock_body(pb: &mut ProgramBuilder, method: MethodId, field: lovelock::program::FieldId) {
    let wk = *pb.well_known();
    pb.set_body(
        method,
        vec![],
        vec![
            Opcode::LoadStaticField(field),
            Opcode::Call(wk.monitor_enter),
            Opcode::Nop,
            Opcode::Leave(7),
            Opcode::LoadStaticField(field),
            Opcode::Call(wk.monitor_exit),
            Opcode::EndFinally,
            Opcode::Return,
        ],
        vec![ExceptionHandler {
            kind: HandlerKind::Finally,
            try_start: 2,
            try_end: 4,
            handler_start: 4,
            handler_end: 7,
        }],
    );
}

#[test]
fn nested_lock_regions_summarize_to_roots_and_edges() {
    init_logging();
    let mut pb = ProgramBuilder::new();
    let a = pb.add_class("App.A");
    let b = pb.add_class("App.B");
    let holder = pb.add_class("App.Program");
    let worker = locking_method(&mut pb, holder, "Worker", &[a, b]);
    let program = pb.finish();

    let state = analyze(&program, worker);
    assert!(state.locks.is_empty());
    assert_eq!(state.roots.len(), 1);
    assert_eq!(state.roots[0].object, HeapObject::TypeOf(a));
    assert_eq!(state.graph.edges().len(), 1);
    let edge = &state.graph.edges()[0];
    assert_eq!(edge.source.object, HeapObject::TypeOf(a));
    assert_eq!(edge.target.object, HeapObject::TypeOf(b));
}

#[test]
fn reentrant_locking_records_no_ordering() {
    init_logging();
    let mut pb = ProgramBuilder::new();
    let a = pb.add_class("App.A");
    let holder = pb.add_class("App.Program");
    let worker = locking_method(&mut pb, holder, "Worker", &[a, a]);
    let program = pb.finish();

    let state = analyze(&program, worker);
    assert!(state.locks.is_empty());
    assert_eq!(state.roots.len(), 1);
    assert!(state.graph.edges().is_empty());
    assert!(DeadlockDetector::new(&program).detect(&state).is_empty());
}

#[test]
fn callee_acquisitions_compose_under_the_callers_lock() {
    init_logging();
    let mut pb = ProgramBuilder::new();
    let m = pb.add_class("App.M");
    let r = pb.add_class("App.R");
    let holder = pb.add_class("App.Program");
    let helper = locking_method(&mut pb, holder, "Helper", &[r]);
    let wk = *pb.well_known();
    let caller = pb.declare_static_method(holder, "Caller", vec![], None);
    pb.set_body(
        caller,
        vec![],
        vec![
            Opcode::LoadToken(m),
            Opcode::Call(wk.get_type_from_handle),
            Opcode::Call(wk.monitor_enter),
            Opcode::Call(helper),
            Opcode::Leave(9),
            Opcode::LoadToken(m),
            Opcode::Call(wk.get_type_from_handle),
            Opcode::Call(wk.monitor_exit),
            Opcode::EndFinally,
            Opcode::Return,
        ],
        vec![ExceptionHandler {
            kind: HandlerKind::Finally,
            try_start: 3,
            try_end: 5,
            handler_start: 5,
            handler_end: 9,
        }],
    );
    let program = pb.finish();

    let state = analyze(&program, caller);
    assert_eq!(state.roots.len(), 1);
    assert_eq!(state.roots[0].object, HeapObject::TypeOf(m));
    assert!(state
        .graph
        .edges()
        .iter()
        .any(|e| e.source.object == HeapObject::TypeOf(m)
            && e.target.object == HeapObject::TypeOf(r)));
    assert!(!state.roots.iter().any(|root| root.object == HeapObject::TypeOf(r)));
}

#[test]
fn parameter_lock_binds_to_the_passed_object() {
    init_logging();
    let mut pb = ProgramBuilder::new();
    let t = pb.add_class("App.T");
    let holder = pb.add_class("App.Program");
    let wk = *pb.well_known();
    let helper = pb.declare_static_method(holder, "LockIt", vec![wk.type_type], None);
    pb.set_body(
        helper,
        vec![],
        vec![
            Opcode::LoadArg(0),
            Opcode::Call(wk.monitor_enter),
            Opcode::Nop,
            Opcode::Leave(7),
            Opcode::LoadArg(0),
            Opcode::Call(wk.monitor_exit),
            Opcode::EndFinally,
            Opcode::Return,
        ],
        vec![ExceptionHandler {
            kind: HandlerKind::Finally,
            try_start: 2,
            try_end: 4,
            handler_start: 4,
            handler_end: 7,
        }],
    );
    let caller = pb.declare_static_method(holder, "Caller", vec![], None);
    pb.set_body(
        caller,
        vec![],
        vec![
            Opcode::LoadToken(t),
            Opcode::Call(wk.get_type_from_handle),
            Opcode::Call(helper),
            Opcode::Return,
        ],
        vec![],
    );
    let program = pb.finish();

    let state = analyze(&program, caller);
    assert_eq!(state.roots.len(), 1);
    assert_eq!(state.roots[0].object, HeapObject::TypeOf(t));
}

#[test]
fn typeof_locks_unify_across_methods() {
    init_logging();
    let mut pb = ProgramBuilder::new();
    let t = pb.add_class("App.T");
    let holder = pb.add_class("App.Program");
    let wk = *pb.well_known();
    let direct = locking_method(&mut pb, holder, "Direct", &[t]);
    let helper = pb.declare_static_method(holder, "LockIt", vec![wk.type_type], None);
    pb.set_body(
        helper,
        vec![],
        vec![
            Opcode::LoadArg(0),
            Opcode::Call(wk.monitor_enter),
            Opcode::Nop,
            Opcode::Leave(7),
            Opcode::LoadArg(0),
            Opcode::Call(wk.monitor_exit),
            Opcode::EndFinally,
            Opcode::Return,
        ],
        vec![ExceptionHandler {
            kind: HandlerKind::Finally,
            try_start: 2,
            try_end: 4,
            handler_start: 4,
            handler_end: 7,
        }],
    );
    let via_param = pb.declare_static_method(holder, "ViaParam", vec![], None);
    pb.set_body(
        via_param,
        vec![],
        vec![
            Opcode::LoadToken(t),
            Opcode::Call(wk.get_type_from_handle),
            Opcode::Call(helper),
            Opcode::Return,
        ],
        vec![],
    );
    let main = spawning_main(&mut pb, holder, &[direct, via_param]);
    let program = pb.finish();

    // Both threads lock typeof(App.T); the graph must hold one vertex.
    let state = analyze(&program, main);
    assert_eq!(state.graph.vertices().len(), 1);
    assert_eq!(state.roots.len(), 1);
    assert_eq!(state.roots[0].object, HeapObject::TypeOf(t));
}

#[test]
fn opposite_lock_orders_on_two_threads_are_reported() {
    init_logging();
    let mut pb = ProgramBuilder::new();
    let a = pb.add_class("App.A");
    let b = pb.add_class("App.B");
    let holder = pb.add_class("App.Program");
    let first = locking_method(&mut pb, holder, "First", &[a, b]);
    let second = locking_method(&mut pb, holder, "Second", &[b, a]);
    let main = spawning_main(&mut pb, holder, &[first, second]);
    let program = pb.finish();

    let outcome =
        AnalysisSession::with_entry(&program, main, AnalysisOptions::default(), CancellationToken::new())
            .run()
            .unwrap();
    assert_eq!(outcome.reports.len(), 1);
    let Report::Deadlock(content) = &outcome.reports[0];
    assert_eq!(content.bug_kind, "Deadlock");
    let locks = format!("{} {}", content.diagnosis.first_lock, content.diagnosis.second_lock);
    assert!(locks.contains("App.A") && locks.contains("App.B"));
    assert!(outcome.reports_json().contains("Deadlock"));
}

#[test]
fn shared_outer_lock_suppresses_the_report() {
    init_logging();
    let mut pb = ProgramBuilder::new();
    let a = pb.add_class("App.A");
    let b = pb.add_class("App.B");
    let c = pb.add_class("App.C");
    let holder = pb.add_class("App.Program");
    let first = locking_method(&mut pb, holder, "First", &[c, a, b]);
    let second = locking_method(&mut pb, holder, "Second", &[c, b, a]);
    let main = spawning_main(&mut pb, holder, &[first, second]);
    let program = pb.finish();

    let outcome =
        AnalysisSession::with_entry(&program, main, AnalysisOptions::default(), CancellationToken::new())
            .run()
            .unwrap();
    assert!(outcome.reports.is_empty());
}

#[test]
fn thread_entry_delegates_become_analysis_roots() {
    init_logging();
    let mut pb = ProgramBuilder::new();
    let a = pb.add_class("App.A");
    let holder = pb.add_class("App.Program");
    let first = locking_method(&mut pb, holder, "First", &[a]);
    let second = locking_method(&mut pb, holder, "Second", &[a]);
    let main = spawning_main(&mut pb, holder, &[first, second]);
    let program = pb.finish();

    let outcome =
        AnalysisSession::with_entry(&program, main, AnalysisOptions::default(), CancellationToken::new())
            .run()
            .unwrap();
    assert_eq!(outcome.root_methods.len(), 3);
    assert!(outcome.root_methods.contains(&main));
    assert!(outcome.root_methods.contains(&first));
    assert!(outcome.root_methods.contains(&second));
}

#[test]
fn repeated_runs_are_deterministic() {
    init_logging();
    let mut pb = ProgramBuilder::new();
    let a = pb.add_class("App.A");
    let b = pb.add_class("App.B");
    let holder = pb.add_class("App.Program");
    let first = locking_method(&mut pb, holder, "First", &[a, b]);
    let second = locking_method(&mut pb, holder, "Second", &[b, a]);
    let main = spawning_main(&mut pb, holder, &[first, second]);
    let program = pb.finish();

    let signature = |outcome: &lovelock::AnalysisOutcome| {
        let nodes: Vec<String> = outcome.lock_graph.graph.node_weights().cloned().collect();
        let edges: Vec<(usize, usize, String)> = outcome
            .lock_graph
            .graph
            .edge_references()
            .map(|e| (e.source().index(), e.target().index(), e.weight().clone()))
            .collect();
        (nodes, edges, outcome.reports_json())
    };
    let run = || {
        AnalysisSession::with_entry(&program, main, AnalysisOptions::default(), CancellationToken::new())
            .run()
            .unwrap()
    };
    assert_eq!(signature(&run()), signature(&run()));
}

#[test]
fn field_locks_stay_balanced_under_no_aliasing() {
    init_logging();
    let mut pb = ProgramBuilder::new();
    let holder = pb.add_class("App.Program");
    let wk = *pb.well_known();
    let guard = pb.add_field(holder, "guard", wk.object, false);
    let worker = pb.declare_static_method(holder, "Work", vec![], None);
    set_field_lock_body(&mut pb, worker, guard);
    let program = pb.finish();

    let state = analyze_with(&program, worker, AnalysisOptions::NO_ALIASING);
    assert!(state.locks.is_empty());
    assert_eq!(state.roots.len(), 1);
    assert_eq!(state.roots[0].object, HeapObject::UnaliasedField(guard));
}

#[test]
fn mutable_field_reloads_release_the_same_lock() {
    init_logging();
    let mut pb = ProgramBuilder::new();
    let holder = pb.add_class("App.Program");
    let wk = *pb.well_known();
    let guard = pb.add_field(holder, "guard", wk.object, false);
    let worker = pb.declare_static_method(holder, "Work", vec![], None);
    set_field_lock_body(&mut pb, worker, guard);
    let program = pb.finish();

    // Default policy keys the two loads by distinct sites; release still
    // matches them through the common field.
    let state = analyze(&program, worker);
    assert!(state.locks.is_empty());
    assert_eq!(state.roots.len(), 1);
    assert!(matches!(
        state.roots[0].object,
        HeapObject::Generic { point: None, .. }
    ));
}

#[test]
fn release_helper_without_held_lock_is_ignored() {
    init_logging();
    let mut pb = ProgramBuilder::new();
    let holder = pb.add_class("App.Program");
    let wk = *pb.well_known();
    let release = pb.declare_static_method(holder, "Release", vec![wk.object], None);
    pb.set_body(
        release,
        vec![],
        vec![
            Opcode::LoadArg(0),
            Opcode::Call(wk.monitor_exit),
            Opcode::Return,
        ],
        vec![],
    );
    let program = pb.finish();

    let state = analyze(&program, release);
    assert!(state.locks.is_empty());
    assert!(state.roots.is_empty());
    assert!(state.graph.vertices().is_empty());
}

#[test]
fn opaque_system_methods_pass_callee_locks_through() {
    init_logging();
    let mut pb = ProgramBuilder::new();
    let a = pb.add_class("App.A");
    let holder = pb.add_class("App.Program");
    let worker = locking_method(&mut pb, holder, "Work", &[a]);
    let proxy_type = pb.add_class("System.Proxy");
    let proxy = pb.declare_static_method(proxy_type, "Call", vec![], None);
    pb.set_body(proxy, vec![], vec![Opcode::Call(worker), Opcode::Return], vec![]);
    let main = pb.declare_static_method(holder, "Main", vec![], None);
    pb.set_body(main, vec![], vec![Opcode::Call(proxy), Opcode::Return], vec![]);
    let program = pb.finish();

    // The proxy body is never interpreted, but its summary still unions
    // what it calls, so the acquisition reaches the entry.
    let token = CancellationToken::new();
    let call_graph = ChaCallGraphBuilder::new(&program, token.clone())
        .build(main)
        .unwrap();
    let state = InterproceduralLockAnalysis::new(
        &program,
        AnalysisOptions::IGNORE_SYSTEM_NAMESPACE,
        token,
    )
    .run(&call_graph)
    .unwrap()
    .state;
    assert_eq!(state.roots.len(), 1);
    assert_eq!(state.roots[0].object, HeapObject::TypeOf(a));
}

#[test]
fn session_resolves_the_entry_from_options() {
    init_logging();
    let mut pb = ProgramBuilder::new();
    let a = pb.add_class("App.A");
    let holder = pb.add_class("App.Program");
    locking_method(&mut pb, holder, "Main", &[a]);
    let program = pb.finish();

    let options = Options::parse_from_str("App.Program::Main").unwrap();
    let session = AnalysisSession::new(&program, &options, CancellationToken::new()).unwrap();
    let outcome = session.run().unwrap();
    assert!(outcome.reports.is_empty());
    assert_eq!(outcome.root_methods.len(), 1);
    // Export graphs mark their roots: the entry method and the one lock.
    assert_eq!(outcome.call_graph.roots.len(), 1);
    assert_eq!(outcome.lock_graph.roots.len(), 1);

    let missing = Options::parse_from_str("App.Program::Nope").unwrap();
    assert!(AnalysisSession::new(&program, &missing, CancellationToken::new()).is_err());
}
