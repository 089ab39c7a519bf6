//! Stack VM dispatch loop.
//!
//! The machine executes a thread directly on its [`Continuation`]: frames
//! live in a `Vec`, instruction pointers are indices, and bytecode calls
//! push frames instead of recursing on the host stack. Suspending at
//! `AWAIT` therefore needs no capture step; the continuation is already
//! the complete thread state.

mod ops;

use crate::foreign::{Capability, ForeignError};
use chrono::Utc;
use skein_compiler::{Function, Instruction, Program};
use skein_core::{ErrorKind, Settlement, ThreadFailure, ThreadId, Value};
use skein_runtime::{Continuation, Frame, TraceEvent, TraceSink};
use thiserror::Error;

/// Maximum number of frames on one thread's call stack.
pub const MAX_CALL_DEPTH: usize = 1024;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("{0}")]
    Type(String),
    #[error("{0}")]
    Arithmetic(String),
    #[error(transparent)]
    Foreign(#[from] ForeignError),
    #[error("call depth exceeded {0}")]
    StackOverflow(usize),
    #[error("{waiter} awaiting {target} would wait on itself")]
    Deadlock { waiter: ThreadId, target: ThreadId },
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    #[error("unbound name at runtime: {0}")]
    UnresolvedName(String),
    #[error("continuation was captured against {found}, not {expected}")]
    ProgramMismatch { expected: String, found: String },
    #[error("executor error: {0}")]
    Host(String),
    #[error("internal error: {0}")]
    Internal(String),
    /// An awaited thread failed; its failure becomes this thread's.
    #[error("{0}")]
    Propagated(ThreadFailure),
}

impl VmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VmError::Type(_) | VmError::UnknownFunction(_) => ErrorKind::TypeError,
            VmError::Arithmetic(_) => ErrorKind::ArithmeticError,
            VmError::Foreign(_) => ErrorKind::ForeignCallError,
            VmError::StackOverflow(_) => ErrorKind::StackOverflow,
            VmError::Deadlock { .. } => ErrorKind::Deadlock,
            VmError::Propagated(f) => f.kind,
            VmError::UnresolvedName(_) | VmError::ProgramMismatch { .. } | VmError::Host(_) | VmError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// The failure recorded for `thread`. Propagated failures keep their
    /// original origin.
    pub fn into_failure(self, thread: ThreadId) -> ThreadFailure {
        match self {
            VmError::Propagated(f) => f,
            other => ThreadFailure::new(thread, other.kind(), other.to_string()),
        }
    }
}

/// How a run of the dispatch loop ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Finished(Value),
    /// Stopped at `AWAIT` on `target`; the continuation's `pending_await`
    /// is set and it can be persisted as-is.
    Suspended(ThreadId),
    Failed(ThreadFailure),
}

impl RunOutcome {
    /// The ledger settlement for a terminal outcome.
    pub fn into_settlement(self) -> Option<Settlement> {
        match self {
            RunOutcome::Finished(v) => Some(Settlement::Resolved(v)),
            RunOutcome::Failed(f) => Some(Settlement::Failed(f)),
            RunOutcome::Suspended(_) => None,
        }
    }
}

/// Answer of [`ThreadHost::await_thread`].
#[derive(Debug, Clone, PartialEq)]
pub enum AwaitOutcome {
    Ready(Settlement),
    /// Stop the dispatch loop; the executor will deliver the settlement
    /// later.
    Suspend,
}

/// The executor side of `ASYNC_CALL` and `AWAIT`.
pub trait ThreadHost {
    fn spawn(&self, parent: ThreadId, function: &str, args: Vec<Value>) -> Result<ThreadId, VmError>;

    fn await_thread(&self, waiter: ThreadId, target: ThreadId) -> Result<AwaitOutcome, VmError>;
}

/// Build the initial continuation of `function(args)`.
pub fn entry_continuation(
    program: &Program,
    thread: ThreadId,
    function: &str,
    args: Vec<Value>,
) -> Result<Continuation, VmError> {
    let func = program.function(function).ok_or_else(|| VmError::UnknownFunction(function.to_string()))?;
    check_arity(func, args.len())?;
    let locals = func.params.iter().cloned().zip(args).collect();
    Ok(Continuation::new(thread, program.source_hash.clone(), Frame::new(function, locals)))
}

fn check_arity(func: &Function, found: usize) -> Result<(), VmError> {
    if func.params.len() != found {
        return Err(VmError::Type(format!(
            "{} expects {} arguments, got {}",
            func.name,
            func.params.len(),
            found
        )));
    }
    Ok(())
}

pub struct Machine<'a> {
    program: &'a Program,
    capability: &'a dyn Capability,
    tracer: &'a dyn TraceSink,
}

impl<'a> Machine<'a> {
    pub fn new(program: &'a Program, capability: &'a dyn Capability, tracer: &'a dyn TraceSink) -> Self {
        Machine { program, capability, tracer }
    }

    /// Run `cont` until it finishes, fails or suspends.
    ///
    /// A continuation with a delivered settlement in its inbox resumes from
    /// the pending `AWAIT` with that outcome.
    pub fn run(&self, cont: &mut Continuation, host: &dyn ThreadHost) -> RunOutcome {
        match self.execute(cont, host) {
            Ok(outcome) => outcome,
            Err(e) => RunOutcome::Failed(e.into_failure(cont.thread)),
        }
    }

    fn function(&self, name: &str) -> Result<&'a Function, VmError> {
        self.program.function(name).ok_or_else(|| VmError::UnknownFunction(name.to_string()))
    }

    fn callable(&self, callee: &Value, argc: usize) -> Result<&'a Function, VmError> {
        match callee {
            Value::Function(name) => {
                let func = self.function(name)?;
                check_arity(func, argc)?;
                Ok(func)
            }
            other => Err(VmError::Type(format!("{} is not callable", other.type_name()))),
        }
    }

    fn execute(&self, cont: &mut Continuation, host: &dyn ThreadHost) -> Result<RunOutcome, VmError> {
        if cont.program_hash != self.program.source_hash {
            return Err(VmError::ProgramMismatch {
                expected: self.program.source_hash.clone(),
                found: cont.program_hash.clone(),
            });
        }
        if let Some(settlement) = cont.inbox.take() {
            cont.pending_await = None;
            let value = settlement.into_result().map_err(VmError::Propagated)?;
            cont.frames.last_mut().ok_or_else(empty_stack)?.stack.push(value);
        } else if let Some(target) = cont.pending_await {
            return Err(VmError::Internal(format!("{} resumed before {} settled", cont.thread, target)));
        }

        let thread = cont.thread;
        loop {
            let depth = cont.frames.len();
            let frame = cont.frames.last_mut().ok_or_else(empty_stack)?;
            let func = self.function(&frame.function)?;
            let ip = frame.ip;
            let inst = *func
                .code
                .get(ip)
                .ok_or_else(|| VmError::Internal(format!("ip {} past the end of {}", ip, func.name)))?;

            if self.tracer.enabled() {
                self.tracer.record(TraceEvent {
                    thread,
                    seq: cont.trace_seq,
                    function: func.name.clone(),
                    ip,
                    opcode: inst.opcode().to_string(),
                    depth,
                    timestamp: Utc::now(),
                });
            }
            cont.trace_seq += 1;
            frame.ip += 1;

            match inst {
                Instruction::LoadConst(k) => {
                    let c = func
                        .constants
                        .get(k as usize)
                        .ok_or_else(|| VmError::Internal(format!("constant {} out of range in {}", k, func.name)))?;
                    frame.stack.push(c.to_value());
                }
                Instruction::LoadName(n) => {
                    let name = name_at(func, n)?;
                    let value = frame.local(name).cloned().ok_or_else(|| VmError::UnresolvedName(name.to_string()))?;
                    frame.stack.push(value);
                }
                Instruction::StoreName(n) => {
                    let name = name_at(func, n)?;
                    let value = pop(frame)?;
                    frame.set_local(name, value);
                }
                Instruction::BinOp(op) => {
                    let rhs = pop(frame)?;
                    let lhs = pop(frame)?;
                    frame.stack.push(ops::binary(op, lhs, rhs)?);
                }
                Instruction::UnOp(op) => {
                    let operand = pop(frame)?;
                    frame.stack.push(ops::unary(op, operand)?);
                }
                Instruction::Jump(target) => frame.ip = target as usize,
                Instruction::JumpIfFalse(target) => match pop(frame)? {
                    Value::Bool(true) => {}
                    Value::Bool(false) => frame.ip = target as usize,
                    other => {
                        return Err(VmError::Type(format!("condition must be bool, got {}", other.type_name())))
                    }
                },
                Instruction::Call(argc) => {
                    let args = pop_n(frame, argc as usize)?;
                    let callee = pop(frame)?;
                    let target = self.callable(&callee, args.len())?;
                    if depth >= MAX_CALL_DEPTH {
                        return Err(VmError::StackOverflow(MAX_CALL_DEPTH));
                    }
                    let locals = target.params.iter().cloned().zip(args).collect();
                    cont.frames.push(Frame::new(target.name.clone(), locals));
                }
                Instruction::Return => {
                    let value = frame.stack.pop().unwrap_or(Value::Null);
                    cont.frames.pop();
                    match cont.frames.last_mut() {
                        Some(caller) => caller.stack.push(value),
                        None => return Ok(RunOutcome::Finished(value)),
                    }
                }
                Instruction::ForeignCall { import, argc } => {
                    let target = self
                        .program
                        .imports
                        .get(import as usize)
                        .ok_or_else(|| VmError::Internal(format!("import {} out of range", import)))?;
                    let args = pop_n(frame, argc as usize)?;
                    frame.stack.push(self.capability.invoke(target, args)?);
                }
                Instruction::AsyncCall(argc) => {
                    let args = pop_n(frame, argc as usize)?;
                    let callee = pop(frame)?;
                    let target = self.callable(&callee, args.len())?;
                    let child = host.spawn(thread, &target.name, args)?;
                    frame.stack.push(Value::Thread(child));
                }
                Instruction::Await => match pop(frame)? {
                    Value::Thread(target) => match host.await_thread(thread, target)? {
                        AwaitOutcome::Ready(settlement) => {
                            frame.stack.push(settlement.into_result().map_err(VmError::Propagated)?)
                        }
                        AwaitOutcome::Suspend => {
                            cont.pending_await = Some(target);
                            return Ok(RunOutcome::Suspended(target));
                        }
                    },
                    other => frame.stack.push(other),
                },
            }
        }
    }
}

fn empty_stack() -> VmError {
    VmError::Internal("empty call stack".into())
}

fn name_at(func: &Function, n: u32) -> Result<&str, VmError> {
    func.names
        .get(n as usize)
        .map(String::as_str)
        .ok_or_else(|| VmError::Internal(format!("name {} out of range in {}", n, func.name)))
}

fn pop(frame: &mut Frame) -> Result<Value, VmError> {
    frame.stack.pop().ok_or_else(|| VmError::Internal(format!("operand stack underflow in {}", frame.function)))
}

fn pop_n(frame: &mut Frame, n: usize) -> Result<Vec<Value>, VmError> {
    if frame.stack.len() < n {
        return Err(VmError::Internal(format!("operand stack underflow in {}", frame.function)));
    }
    let at = frame.stack.len() - n;
    Ok(frame.stack.split_off(at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foreign::{Builtins, NoForeign};
    use skein_runtime::{NoTrace, TraceLog};
    use std::cell::RefCell;
    use std::sync::Arc;

    /// Host that runs spawned threads to completion inline.
    struct InlineHost<'p> {
        program: &'p Program,
        results: RefCell<Vec<Settlement>>,
    }

    impl<'p> InlineHost<'p> {
        fn new(program: &'p Program) -> Self {
            InlineHost { program, results: RefCell::new(Vec::new()) }
        }
    }

    impl ThreadHost for InlineHost<'_> {
        fn spawn(&self, _parent: ThreadId, function: &str, args: Vec<Value>) -> Result<ThreadId, VmError> {
            let id = ThreadId::new(self.results.borrow().len() as u64 + 1);
            let mut cont = entry_continuation(self.program, id, function, args)?;
            let caps = Builtins::new(Arc::new(NoForeign));
            let outcome = Machine::new(self.program, &caps, &NoTrace).run(&mut cont, self);
            let settlement = outcome.into_settlement().ok_or_else(|| VmError::Host("child suspended".into()))?;
            self.results.borrow_mut().push(settlement);
            Ok(id)
        }

        fn await_thread(&self, _waiter: ThreadId, target: ThreadId) -> Result<AwaitOutcome, VmError> {
            let idx = target.as_u64() as usize - 1;
            Ok(AwaitOutcome::Ready(self.results.borrow()[idx].clone()))
        }
    }

    /// Host whose every await suspends.
    struct SuspendingHost;

    impl ThreadHost for SuspendingHost {
        fn spawn(&self, _parent: ThreadId, _function: &str, _args: Vec<Value>) -> Result<ThreadId, VmError> {
            Ok(ThreadId::new(42))
        }

        fn await_thread(&self, _waiter: ThreadId, _target: ThreadId) -> Result<AwaitOutcome, VmError> {
            Ok(AwaitOutcome::Suspend)
        }
    }

    fn run_source(src: &str, entry: &str, args: Vec<Value>) -> RunOutcome {
        let program = skein_compiler::compile(src).unwrap();
        let mut cont = entry_continuation(&program, ThreadId::new(0), entry, args).unwrap();
        let caps = Builtins::new(Arc::new(NoForeign));
        let host = InlineHost::new(&program);
        Machine::new(&program, &caps, &NoTrace).run(&mut cont, &host)
    }

    fn run_main(src: &str) -> RunOutcome {
        run_source(src, "main", vec![])
    }

    #[test]
    fn arithmetic_and_calls() {
        let src = "fn add(x, y) { x + y }\nfn main() { add(2, 3) * 2 }";
        assert_eq!(run_main(src), RunOutcome::Finished(Value::Int(10)));
    }

    #[test]
    fn if_branches_on_input() {
        let src = r#"fn f(x) { if x > 0.5 { "yes" } else { "no" } }"#;
        assert_eq!(run_source(src, "f", vec![Value::Float(0.7)]), RunOutcome::Finished(Value::Str("yes".into())));
        assert_eq!(run_source(src, "f", vec![Value::Float(0.3)]), RunOutcome::Finished(Value::Str("no".into())));
    }

    #[test]
    fn if_without_else_is_null() {
        assert_eq!(run_main("fn main() { if false { 1 } }"), RunOutcome::Finished(Value::Null));
    }

    #[test]
    fn recursion_through_frames() {
        let src = "fn fact(n) { if n <= 1 { 1 } else { n * fact(n - 1) } }\nfn main() { fact(20) }";
        assert_eq!(run_main(src), RunOutcome::Finished(Value::Int(2_432_902_008_176_640_000)));
    }

    #[test]
    fn dynamic_call_through_local() {
        let src = "fn twice(x) { x * 2 }\nfn main() { f = twice; f(21) }";
        assert_eq!(run_main(src), RunOutcome::Finished(Value::Int(42)));
    }

    #[test]
    fn dynamic_call_checks_arity() {
        let src = "fn twice(x) { x * 2 }\nfn main() { f = twice; f(1, 2) }";
        match run_main(src) {
            RunOutcome::Failed(f) => assert_eq!(f.kind, ErrorKind::TypeError),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn async_and_await_inline() {
        let src = "fn add(x, y) { x + y }\nfn main() { x = async add(2, 3); await x }";
        assert_eq!(run_main(src), RunOutcome::Finished(Value::Int(5)));
    }

    #[test]
    fn await_non_thread_passes_through() {
        assert_eq!(run_main("fn main() { await 7 }"), RunOutcome::Finished(Value::Int(7)));
    }

    #[test]
    fn runtime_type_error_names_thread() {
        match run_main(r#"fn main() { "a" == true }"#) {
            RunOutcome::Failed(f) => {
                assert_eq!(f.kind, ErrorKind::TypeError);
                assert_eq!(f.origin, ThreadId::new(0));
                assert!(f.to_string().starts_with("TypeError in thread:0"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn awaited_failure_keeps_origin() {
        let src = "fn bad() { 1 / 0 }\nfn main() { t = async bad(); await t }";
        match run_main(src) {
            RunOutcome::Failed(f) => {
                assert_eq!(f.kind, ErrorKind::ArithmeticError);
                assert_eq!(f.origin, ThreadId::new(1));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn condition_must_be_bool() {
        match run_main("fn main() { if 1 { 2 } else { 3 } }") {
            RunOutcome::Failed(f) => assert_eq!(f.kind, ErrorKind::TypeError),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unbounded_recursion_overflows() {
        match run_main("fn down(n) { down(n + 1) }\nfn main() { down(0) }") {
            RunOutcome::Failed(f) => assert_eq!(f.kind, ErrorKind::StackOverflow),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn suspend_then_resume_with_delivery() {
        let src = "fn work() { 1 }\nfn main() { t = async work(); v = await t; v + 1 }";
        let program = skein_compiler::compile(src).unwrap();
        let caps = Builtins::new(Arc::new(NoForeign));
        let machine = Machine::new(&program, &caps, &NoTrace);
        let mut cont = entry_continuation(&program, ThreadId::new(0), "main", vec![]).unwrap();

        assert_eq!(machine.run(&mut cont, &SuspendingHost), RunOutcome::Suspended(ThreadId::new(42)));
        assert_eq!(cont.pending_await, Some(ThreadId::new(42)));

        let bytes = cont.encode().unwrap();
        let mut restored = Continuation::decode(&bytes).unwrap();
        restored.deliver(Settlement::Resolved(Value::Int(41)));
        assert_eq!(machine.run(&mut restored, &SuspendingHost), RunOutcome::Finished(Value::Int(42)));
    }

    #[test]
    fn resume_with_failure_propagates() {
        let src = "fn work() { 1 }\nfn main() { await async work() }";
        let program = skein_compiler::compile(src).unwrap();
        let machine = Machine::new(&program, &NoForeign, &NoTrace);
        let mut cont = entry_continuation(&program, ThreadId::new(0), "main", vec![]).unwrap();
        assert!(matches!(machine.run(&mut cont, &SuspendingHost), RunOutcome::Suspended(_)));

        let failure = ThreadFailure::new(ThreadId::new(42), ErrorKind::ForeignCallError, "down");
        cont.deliver(Settlement::Failed(failure.clone()));
        assert_eq!(machine.run(&mut cont, &SuspendingHost), RunOutcome::Failed(failure));
    }

    #[test]
    fn resume_against_other_program_is_refused() {
        let program = skein_compiler::compile("fn main() { 1 }").unwrap();
        let other = skein_compiler::compile("fn main() { 2 }").unwrap();
        let mut cont = entry_continuation(&program, ThreadId::new(0), "main", vec![]).unwrap();
        match Machine::new(&other, &NoForeign, &NoTrace).run(&mut cont, &SuspendingHost) {
            RunOutcome::Failed(f) => assert_eq!(f.kind, ErrorKind::Internal),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn tracer_sees_every_instruction() {
        let src = "fn main() { x = 1; x + 2 }";
        let program = skein_compiler::compile(src).unwrap();
        let log = TraceLog::new();
        let mut cont = entry_continuation(&program, ThreadId::new(0), "main", vec![]).unwrap();
        let outcome = Machine::new(&program, &NoForeign, &log).run(&mut cont, &SuspendingHost);
        assert_eq!(outcome, RunOutcome::Finished(Value::Int(3)));

        let events = log.thread(ThreadId::new(0));
        assert_eq!(events.len(), program.functions["main"].code.len());
        assert_eq!(events.len() as u64, cont.trace_seq);
        assert!(events.iter().enumerate().all(|(i, e)| e.seq == i as u64 && e.depth == 1));
        assert_eq!(events.last().map(|e| e.opcode.as_str()), Some("RETURN"));
    }

    #[test]
    fn entry_checks_function_and_arity() {
        let program = skein_compiler::compile("fn f(a) { a }").unwrap();
        assert!(matches!(
            entry_continuation(&program, ThreadId::new(0), "g", vec![]),
            Err(VmError::UnknownFunction(_))
        ));
        assert!(matches!(entry_continuation(&program, ThreadId::new(0), "f", vec![]), Err(VmError::Type(_))));
    }
}
