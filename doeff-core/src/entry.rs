//! Public entry points: `run`/`async_run`, strict `DoExpr` validation,
//! handler installation, and result wrapping.

use crate::config::VmConfig;
use crate::continuation::{CallMetadata, Continuation};
use crate::error::VmError;
use crate::handler::HandlerEntry;
use crate::ids::TaskId;
use crate::ir::DoExpr;
use crate::value::{Bindings, Value};
use crate::vm::Vm;
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{info_span, warn};

/// `run`'s/`async_run`'s result.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub value: Option<Value>,
    pub error: Option<VmError>,
    pub raw_store: Bindings,
    pub traceback: Option<Value>,
}

impl RunResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Nest the built-in sentinels (reader over `env`, state over `store`)
/// outermost, then the caller's `handlers` in the order given — so a
/// user handler shadows the sentinels for any effect it also claims, but
/// falls through to them (and the sentinels fall through to `Delegate`) for
/// anything it doesn't.
fn install_handlers(expr: DoExpr, handlers: Vec<HandlerEntry>, env: Bindings) -> DoExpr {
    let mut wrapped = expr;
    for handler in handlers.into_iter().rev() {
        wrapped = DoExpr::with_handler(handler, wrapped);
    }
    wrapped = DoExpr::with_handler(crate::native::state::state_handler(), wrapped);
    DoExpr::with_handler(crate::native::reader::ask_handler(env), wrapped)
}

fn validate_top_level(expr: &DoExpr) -> Result<(), VmError> {
    // Construction of a `DoExpr` is already statically typed in Rust, so
    // the only boundary check left is a bare `Effect` at top level
    // (everything else is a well-formed node by construction).
    if matches!(expr, DoExpr::Effect(_)) {
        return Err(crate::error::BoundaryError::new(
            Value::Unit,
            "a bare Effect must be wrapped in Perform before reaching run()",
        )
        .into());
    }
    Ok(())
}

fn root_task_continuation(program: DoExpr) -> Continuation {
    let mut k = Continuation::new(
        0,
        Arc::new(Vec::new()),
        Arc::new(Vec::new()),
        None,
        Vec::new(),
        CallMetadata::default(),
        None,
    );
    k.program_ref = Some(program);
    k
}

fn finish(vm: &Vm, outcome: Result<Value, VmError>) -> RunResult {
    match outcome {
        Ok(v) => RunResult {
            value: Some(v),
            error: None,
            raw_store: vm.store().clone(),
            traceback: None,
        },
        Err(e) => {
            let traceback = match &e {
                VmError::HostCallFailed { traceback: Some(tb), .. } => Some(Value::str(tb.clone())),
                _ => None,
            };
            warn!(error = %e, "run failed");
            RunResult {
                value: None,
                error: Some(e),
                raw_store: vm.store().clone(),
                traceback,
            }
        }
    }
}

/// Drive a program to completion synchronously. Panics if the
/// program ever reaches `Mode::Suspended` on an external promise with no
/// other ready work — use [`async_run`] for programs that do.
pub fn run(expr: DoExpr, handlers: Vec<HandlerEntry>, env: Bindings, store: Bindings) -> RunResult {
    run_with_config(expr, handlers, env, store, VmConfig::default())
}

pub fn run_with_config(
    expr: DoExpr,
    handlers: Vec<HandlerEntry>,
    env: Bindings,
    store: Bindings,
    config: VmConfig,
) -> RunResult {
    let span = info_span!("doeff.run");
    let _guard = span.enter();

    if let Err(e) = validate_top_level(&expr) {
        return RunResult {
            value: None,
            error: Some(e),
            raw_store: store,
            traceback: None,
        };
    }

    let mut vm = Vm::new(config);
    vm.store = store;
    let program = install_handlers(expr, handlers, env);
    let root = root_task_continuation(program);
    let root_handle = vm.continuations.register(root);
    let task = vm.scheduler.spawn(root_handle);
    let outcome = vm.pump(task);
    finish(&vm, outcome)
}

pin_project! {
    /// Future returned by [`async_run`]: each poll drives the
    /// scheduler as far as it can go, then registers the waker and yields
    /// once the ready queue is empty with external promises still pending.
    /// [`crate::scheduler::ExternalCompleter::resolve`]/`reject` wakes it
    /// again once the host has settled one of those promises.
    pub struct AsyncRun {
        vm: Vm,
        task: Option<TaskId>,
        validation_error: Option<VmError>,
    }
}

impl Future for AsyncRun {
    type Output = RunResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<RunResult> {
        let this = self.project();
        if let Some(e) = this.validation_error.take() {
            return Poll::Ready(finish(this.vm, Err(e)));
        }
        let task = this.task.expect("AsyncRun polled after completion");
        match this.vm.pump(task) {
            Ok(v) => Poll::Ready(finish(this.vm, Ok(v))),
            Err(VmError::InternalInvariant { message })
                if message.contains("ready queue empty with external promises still pending") =>
            {
                this.vm.scheduler.register_waker(cx.waker().clone());
                Poll::Pending
            }
            Err(e) => Poll::Ready(finish(this.vm, Err(e))),
        }
    }
}

/// Async variant: identical contract to [`run`], but yields
/// to the host's executor instead of treating an empty ready queue with
/// outstanding external promises as a deadlock. The returned future wakes
/// itself once [`crate::scheduler::ExternalCompleter`] settles one of the
/// promises this run is still waiting on.
pub fn async_run(
    expr: DoExpr,
    handlers: Vec<HandlerEntry>,
    env: Bindings,
    store: Bindings,
    config: VmConfig,
) -> AsyncRun {
    let span = info_span!("doeff.async_run");
    let _guard = span.enter();

    let mut vm = Vm::new(config);
    vm.store = store;

    if let Err(e) = validate_top_level(&expr) {
        return AsyncRun {
            vm,
            task: None,
            validation_error: Some(e),
        };
    }

    let program = install_handlers(expr, handlers, env);
    let root = root_task_continuation(program);
    let root_handle = vm.continuations.register(root);
    let task = vm.scheduler.spawn(root_handle);
    AsyncRun {
        vm,
        task: Some(task),
        validation_error: None,
    }
}
