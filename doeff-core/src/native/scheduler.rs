//! Scheduler effect family: `Spawn`/`Wait`/`Gather`/
//! `Race`/`CreateExternalPromise`. Unlike Reader/State/Writer this handler
//! needs direct `&mut Vm` access — it registers continuations with
//! [`crate::scheduler::Scheduler`] rather than producing a `DoExpr` to step
//! immediately, so most of its branches return `NativeOutcome::Suspend`.

use crate::error::VmError;
use crate::handler::{HandlerEntry, NativeOutcome};
use crate::ids::TaskId;
use crate::ir::DoExpr;
use crate::value::{HostObject, Value};
use std::sync::Arc;

fn task_of(v: &Value) -> Result<TaskId, VmError> {
    match v {
        Value::Task(id) => Ok(*id),
        _ => Err(VmError::internal("scheduler: expected a Task value")),
    }
}

fn task_list(v: &Value) -> Result<Vec<TaskId>, VmError> {
    match v {
        Value::List(items) => items.iter().map(task_of).collect(),
        _ => Err(VmError::internal("scheduler: expected a list of Task values")),
    }
}

/// The completer half of `CreateExternalPromise`, handed to the host as an
/// opaque `Value::Host` and never inspected by the VM again.
#[derive(Debug)]
pub struct PromiseCompleter {
    pub promise: crate::ids::PromiseId,
    pub completer: crate::scheduler::ExternalCompleter,
}

impl HostObject for PromiseCompleter {
    fn type_name(&self) -> &str {
        "PromiseCompleter"
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl PromiseCompleter {
    pub fn resolve(&self, value: Value) {
        self.completer.resolve(self.promise, value);
    }

    pub fn reject(&self, message: impl Into<String>) {
        self.completer.reject(self.promise, message);
    }
}

pub fn scheduler_handler() -> HandlerEntry {
    HandlerEntry::native(
        "doeff.scheduler",
        |effect| {
            matches!(
                effect.record_tag(),
                Some("Spawn") | Some("Wait") | Some("Gather") | Some("Race") | Some("CreateExternalPromise")
            )
        },
        move |vm, effect, k| {
            let owner = vm
                .current_task
                .ok_or_else(|| VmError::internal("scheduler effect performed outside any task"))?;
            match effect.record_tag() {
                Some("Spawn") => {
                    let Some(Value::Expr(body)) = effect.field("expr").cloned() else {
                        return Err(VmError::internal("Spawn: missing expr payload"));
                    };
                    let mut root = crate::continuation::Continuation::new(
                        0,
                        Arc::new(Vec::new()),
                        Arc::new(Vec::new()),
                        None,
                        Vec::new(),
                        crate::continuation::CallMetadata::default(),
                        None,
                    );
                    root.program_ref = Some((*body).clone());
                    let root_handle = vm.continuations.register(root);
                    let task_id = vm.scheduler.spawn(root_handle);
                    Ok(NativeOutcome::Step(DoExpr::resume(k, Value::Task(task_id))))
                }
                Some("Wait") => {
                    let target = task_of(effect.field("task").ok_or_else(|| VmError::internal("Wait: missing task"))?)?;
                    match vm.scheduler.register_wait(owner, k, target) {
                        Some(outcome) => match outcome.into_result() {
                            Ok(v) => Ok(NativeOutcome::Step(DoExpr::resume(k, v))),
                            Err(e) => Err(e),
                        },
                        None => Ok(NativeOutcome::Suspend),
                    }
                }
                Some("Gather") => {
                    let order = task_list(effect.field("tasks").ok_or_else(|| VmError::internal("Gather: missing tasks"))?)?;
                    vm.scheduler.register_gather(owner, k, order);
                    Ok(NativeOutcome::Suspend)
                }
                Some("Race") => {
                    let order = task_list(effect.field("tasks").ok_or_else(|| VmError::internal("Race: missing tasks"))?)?;
                    vm.scheduler.register_race(owner, k, order);
                    Ok(NativeOutcome::Suspend)
                }
                Some("CreateExternalPromise") => {
                    let promise = vm.scheduler.create_promise();
                    let completer = vm.scheduler.completer();
                    let handle = Arc::new(PromiseCompleter { promise, completer });
                    let mut fields = indexmap::IndexMap::new();
                    fields.insert("promise".to_string(), Value::Promise(promise));
                    fields.insert("completer".to_string(), Value::Host(handle));
                    Ok(NativeOutcome::Step(DoExpr::resume(k, Value::record("ExternalPromise", fields))))
                }
                _ => Err(VmError::internal("scheduler: unrecognized effect")),
            }
        },
    )
}

pub fn spawn(body: DoExpr) -> DoExpr {
    let mut fields = indexmap::IndexMap::new();
    fields.insert("expr".to_string(), Value::Expr(Arc::new(body)));
    DoExpr::perform(Value::record("Spawn", fields))
}

pub fn wait(task: TaskId) -> DoExpr {
    let mut fields = indexmap::IndexMap::new();
    fields.insert("task".to_string(), Value::Task(task));
    DoExpr::perform(Value::record("Wait", fields))
}

pub fn gather(tasks: Vec<TaskId>) -> DoExpr {
    let mut fields = indexmap::IndexMap::new();
    fields.insert(
        "tasks".to_string(),
        Value::List(Arc::new(tasks.into_iter().map(Value::Task).collect())),
    );
    DoExpr::perform(Value::record("Gather", fields))
}

pub fn race(tasks: Vec<TaskId>) -> DoExpr {
    let mut fields = indexmap::IndexMap::new();
    fields.insert(
        "tasks".to_string(),
        Value::List(Arc::new(tasks.into_iter().map(Value::Task).collect())),
    );
    DoExpr::perform(Value::record("Race", fields))
}

pub fn create_external_promise() -> DoExpr {
    DoExpr::perform(Value::record("CreateExternalPromise", indexmap::IndexMap::new()))
}

/// Called from `Value::Host` returned by `create_external_promise`'s dynamic
/// result, by an embedder that knows it is holding a `PromiseCompleter`.
pub fn downcast_completer(value: &Value) -> Option<&PromiseCompleter> {
    match value {
        Value::Host(obj) => obj.as_any().downcast_ref::<PromiseCompleter>(),
        _ => None,
    }
}
