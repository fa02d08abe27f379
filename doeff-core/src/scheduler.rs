//! Cooperative scheduler: Spawn/Wait/Gather/Race and the external-promise
//! bridge.
//!
//! A single FIFO ready queue gives deterministic scheduling: the head task
//! runs until it suspends, completes, or fails;
//! new tasks and released waiters both enqueue at the tail. A blocked
//! task's resumption point is a captured `Continuation`, stashed here and
//! replayed by the VM the next time that task id is popped off the ready
//! queue — waking a dependency never jumps the queue.

use crate::continuation::ContinuationHandle;
use crate::error::VmError;
use crate::ids::{PromiseId, TaskId};
use crate::value::Value;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::task::Waker;
use tracing::debug;

#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Completed(Value),
    Failed(VmError),
}

impl TaskOutcome {
    pub fn into_result(self) -> Result<Value, VmError> {
        match self {
            TaskOutcome::Completed(v) => Ok(v),
            TaskOutcome::Failed(e) => Err(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Waiting,
    Completed,
    Failed,
}

/// One spawned unit of cooperative work. `root` is replaced every time the
/// task suspends and is later resumed, so the scheduler always knows what
/// continuation to replay the next time this task id reaches the head of
/// the ready queue.
#[derive(Debug)]
pub struct Task {
    pub id: TaskId,
    pub root: ContinuationHandle,
    pub state: TaskState,
    pub result: Option<TaskOutcome>,
}

struct WaitWaiter {
    owner: TaskId,
    k: ContinuationHandle,
    target: TaskId,
}

struct GatherWaiter {
    owner: TaskId,
    k: ContinuationHandle,
    order: Vec<TaskId>,
}

struct RaceWaiter {
    owner: TaskId,
    k: ContinuationHandle,
    order: Vec<TaskId>,
}

enum ExternalCompletion {
    Ok { promise: PromiseId, value: Value },
    Err { promise: PromiseId, message: String },
}

pub struct Scheduler {
    tasks: FxHashMap<TaskId, Task>,
    ready: VecDeque<TaskId>,
    /// `(continuation to resume, value or error to deliver)` for a task
    /// whose dependency already settled, keyed by the task id that will
    /// replay it once popped off the ready queue.
    pending_resume: FxHashMap<TaskId, (ContinuationHandle, Result<Value, VmError>)>,
    wait_waiters: Vec<WaitWaiter>,
    gather_waiters: Vec<GatherWaiter>,
    race_waiters: Vec<RaceWaiter>,
    promise_resolved: FxHashMap<PromiseId, Result<Value, VmError>>,
    promise_waiters: FxHashMap<PromiseId, Vec<(TaskId, ContinuationHandle)>>,
    completion_tx: Sender<ExternalCompletion>,
    completion_rx: Receiver<ExternalCompletion>,
    /// Registered by `async_run`'s future on a pending poll, woken by
    /// [`ExternalCompleter`] once it has sent a completion — so the host
    /// executor knows to poll again instead of busy-waiting rather than
    /// yielding control to the host's event loop forever.
    waker: Arc<Mutex<Option<Waker>>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tasks: FxHashMap::default(),
            ready: VecDeque::new(),
            pending_resume: FxHashMap::default(),
            wait_waiters: Vec::new(),
            gather_waiters: Vec::new(),
            race_waiters: Vec::new(),
            promise_resolved: FxHashMap::default(),
            promise_waiters: FxHashMap::default(),
            completion_tx: tx,
            completion_rx: rx,
            waker: Arc::new(Mutex::new(None)),
        }
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn(&mut self, root: ContinuationHandle) -> TaskId {
        let id = TaskId::fresh();
        self.tasks.insert(
            id,
            Task {
                id,
                root,
                state: TaskState::Ready,
                result: None,
            },
        );
        self.ready.push_back(id);
        debug!(task = id.0, "spawned");
        id
    }

    pub fn pop_ready(&mut self) -> Option<TaskId> {
        self.ready.pop_front()
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn mark_running(&mut self, id: TaskId) {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.state = TaskState::Running;
        }
    }

    pub fn mark_waiting(&mut self, id: TaskId) {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.state = TaskState::Waiting;
        }
    }

    /// First activation (program root) vs. a settled-dependency replay.
    pub fn take_pending_resume(&mut self, id: TaskId) -> Option<(ContinuationHandle, Result<Value, VmError>)> {
        self.pending_resume.remove(&id)
    }

    fn stash_resume(&mut self, owner: TaskId, k: ContinuationHandle, result: Result<Value, VmError>) {
        self.pending_resume.insert(owner, (k, result));
        if let Some(task) = self.tasks.get_mut(&owner) {
            task.state = TaskState::Ready;
        }
        self.ready.push_back(owner);
    }

    pub fn complete(&mut self, id: TaskId, outcome: TaskOutcome) {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.state = match &outcome {
                TaskOutcome::Completed(_) => TaskState::Completed,
                TaskOutcome::Failed(_) => TaskState::Failed,
            };
            task.result = Some(outcome);
        }
    }

    fn outcome_of(&self, id: TaskId) -> Option<TaskOutcome> {
        self.tasks.get(&id).and_then(|t| t.result.clone())
    }

    fn is_settled(&self, id: TaskId) -> bool {
        matches!(
            self.tasks.get(&id).map(|t| t.state),
            Some(TaskState::Completed) | Some(TaskState::Failed)
        )
    }

    /// Register `owner`'s wait on `target`, blocking at continuation `k`.
    /// Returns the outcome immediately if `target` already settled.
    pub fn register_wait(
        &mut self,
        owner: TaskId,
        k: ContinuationHandle,
        target: TaskId,
    ) -> Option<TaskOutcome> {
        if self.is_settled(target) {
            return self.outcome_of(target);
        }
        self.wait_waiters.push(WaitWaiter { owner, k, target });
        self.mark_waiting(owner);
        None
    }

    pub fn register_gather(&mut self, owner: TaskId, k: ContinuationHandle, order: Vec<TaskId>) {
        self.mark_waiting(owner);
        self.gather_waiters.push(GatherWaiter { owner, k, order });
    }

    pub fn register_race(&mut self, owner: TaskId, k: ContinuationHandle, order: Vec<TaskId>) {
        self.mark_waiting(owner);
        self.race_waiters.push(RaceWaiter { owner, k, order });
    }

    /// Scan all registered waiters against current task states, moving any
    /// whose dependencies settled into `pending_resume` + the ready queue.
    /// Called by the VM once per pump iteration.
    pub fn settle_waiters(&mut self) {
        let wait_waiters = std::mem::take(&mut self.wait_waiters);
        for w in wait_waiters {
            if self.is_settled(w.target) {
                let outcome = self.outcome_of(w.target).unwrap();
                self.stash_resume(w.owner, w.k, outcome.into_result());
            } else {
                self.wait_waiters.push(w);
            }
        }

        let gather_waiters = std::mem::take(&mut self.gather_waiters);
        for w in gather_waiters {
            if w.order.iter().all(|t| self.is_settled(*t)) {
                let first_err = w
                    .order
                    .iter()
                    .find_map(|t| match self.outcome_of(*t) {
                        Some(TaskOutcome::Failed(e)) => Some(e),
                        _ => None,
                    });
                let result = match first_err {
                    Some(e) => Err(e),
                    None => {
                        let values = w
                            .order
                            .iter()
                            .map(|t| match self.outcome_of(*t) {
                                Some(TaskOutcome::Completed(v)) => v,
                                _ => Value::Unit,
                            })
                            .collect();
                        Ok(Value::List(std::sync::Arc::new(values)))
                    }
                };
                self.stash_resume(w.owner, w.k, result);
            } else {
                self.gather_waiters.push(w);
            }
        }

        let race_waiters = std::mem::take(&mut self.race_waiters);
        for w in race_waiters {
            if let Some((idx, outcome)) = w.order.iter().enumerate().find_map(|(i, t)| {
                if self.is_settled(*t) {
                    self.outcome_of(*t).map(|o| (i, o))
                } else {
                    None
                }
            }) {
                let result = outcome.into_result().map(|v| {
                    Value::List(std::sync::Arc::new(vec![Value::Int(idx as i64), v]))
                });
                self.stash_resume(w.owner, w.k, result);
            } else {
                self.race_waiters.push(w);
            }
        }
    }

    pub fn create_promise(&mut self) -> PromiseId {
        PromiseId::fresh()
    }

    pub fn register_promise_wait(&mut self, owner: TaskId, k: ContinuationHandle, promise: PromiseId) {
        if let Some(result) = self.promise_resolved.get(&promise).cloned() {
            self.stash_resume(owner, k, result);
            return;
        }
        self.mark_waiting(owner);
        self.promise_waiters.entry(promise).or_default().push((owner, k));
    }

    pub fn completer(&self) -> ExternalCompleter {
        ExternalCompleter {
            tx: self.completion_tx.clone(),
            waker: self.waker.clone(),
        }
    }

    /// Stash the waker for `async_run`'s future to be woken once any
    /// outstanding external promise settles.
    pub fn register_waker(&self, waker: Waker) {
        *self.waker.lock() = Some(waker);
    }

    pub fn feed_external_result(&self, promise: PromiseId, value: Result<Value, String>) {
        let msg = match value {
            Ok(v) => ExternalCompletion::Ok { promise, value: v },
            Err(e) => ExternalCompletion::Err { promise, message: e },
        };
        let _ = self.completion_tx.send(msg);
    }

    /// Apply external completions received since the last call. Does not
    /// itself run any continuation — it only moves settled promises' waiters
    /// into `pending_resume`, same as `settle_waiters` does for tasks.
    pub fn drain_external_completions(&mut self) {
        while let Ok(msg) = self.completion_rx.try_recv() {
            let (id, result) = match msg {
                ExternalCompletion::Ok { promise, value } => (promise, Ok(value)),
                ExternalCompletion::Err { promise, message } => {
                    (promise, Err(VmError::host_call_failed(message)))
                }
            };
            self.promise_resolved.insert(id, result.clone());
            if let Some(waiters) = self.promise_waiters.remove(&id) {
                for (owner, k) in waiters {
                    self.stash_resume(owner, k, result.clone());
                }
            }
        }
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    pub fn has_pending_external(&self) -> bool {
        !self.promise_waiters.is_empty()
    }

    pub fn waiting_task_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| matches!(t.state, TaskState::Waiting))
            .count()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tasks", &self.tasks.len())
            .field("ready", &self.ready.len())
            .finish()
    }
}

/// Thread-safe completer half of `CreateExternalPromise`.
#[derive(Clone)]
pub struct ExternalCompleter {
    tx: Sender<ExternalCompletion>,
    waker: Arc<Mutex<Option<Waker>>>,
}

impl std::fmt::Debug for ExternalCompleter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ExternalCompleter")
    }
}

impl ExternalCompleter {
    pub fn resolve(&self, promise: PromiseId, value: Value) {
        let _ = self.tx.send(ExternalCompletion::Ok { promise, value });
        self.wake();
    }

    pub fn reject(&self, promise: PromiseId, message: impl Into<String>) {
        let _ = self.tx.send(ExternalCompletion::Err {
            promise,
            message: message.into(),
        });
        self.wake();
    }

    fn wake(&self) {
        if let Some(waker) = self.waker.lock().take() {
            waker.wake();
        }
    }
}
