//! The step machine: evaluates `DoExpr` nodes, delivers
//! values back down through frames, and drives the scheduler's ready queue.

use crate::error::VmError;
use crate::host::StreamStep;
use crate::ids::MarkerId;
use crate::ir::{DoCtrl, DoExpr};
use crate::scheduler::TaskOutcome;
use crate::segment::{Frame, HandlerPhase, Segment};
use crate::value::Value;
use crate::vm::{ActiveHandler, Mode, Vm};

impl Vm {
    /// Evaluate a freshly-produced `DoExpr`: push frames for `Map`/`FlatMap`,
    /// resolve `Apply` in place, and hand off to dispatch/reflection for
    /// `Ctrl` nodes. Terminates by setting `self.mode`.
    pub(crate) fn eval_expr(&mut self, mut expr: DoExpr) -> Result<(), VmError> {
        loop {
            match expr {
                DoExpr::Pure(v) => {
                    self.mode = Mode::Delivering(v);
                    return Ok(());
                }
                DoExpr::Effect(v) => {
                    return Err(crate::error::BoundaryError::new(
                        v,
                        "a bare Effect must be wrapped in Perform",
                    )
                    .into());
                }
                DoExpr::Perform(inner) => {
                    let effect = match *inner {
                        DoExpr::Effect(v) => v,
                        other => {
                            return Err(crate::error::BoundaryError::new(
                                Value::Unit,
                                format!("Perform must wrap an Effect, got {:?}", other.tag()),
                            )
                            .into())
                        }
                    };
                    return self.start_dispatch(effect);
                }
                DoExpr::Map(inner, f) => {
                    self.push_frame(Frame::Map { f })?;
                    expr = *inner;
                    continue;
                }
                DoExpr::FlatMap(inner, f) => {
                    self.push_frame(Frame::FlatMap { f })?;
                    expr = *inner;
                    continue;
                }
                DoExpr::HostStream(handle) => {
                    let metadata = handle
                        .debug_location()
                        .unwrap_or_else(crate::segment::FrameMetadata::unknown);
                    self.push_frame(Frame::HostStream {
                        handle: handle.clone(),
                        metadata,
                    })?;
                    let step = self.with_host_lock(|| handle.send(Value::Unit))?;
                    return self.handle_stream_step(step);
                }
                DoExpr::Apply(f, args, kwargs) => {
                    let metadata = f.debug_location().unwrap_or_else(crate::segment::FrameMetadata::unknown);
                    self.push_frame(Frame::Program { metadata })?;
                    expr = f.call(args, kwargs)?;
                    continue;
                }
                DoExpr::Safe(inner) => {
                    self.push_frame(Frame::Catch)?;
                    expr = *inner;
                    continue;
                }
                DoExpr::Ctrl(ctrl) => return self.eval_ctrl(*ctrl),
            }
        }
    }

    fn handle_stream_step(&mut self, step: StreamStep) -> Result<(), VmError> {
        match step {
            StreamStep::Yielded(expr) => self.eval_expr(expr),
            StreamStep::Returned(v) => {
                self.mode = Mode::Delivering(v);
                Ok(())
            }
        }
    }

    fn eval_ctrl(&mut self, ctrl: DoCtrl) -> Result<(), VmError> {
        match ctrl {
            DoCtrl::WithHandler(entry, body) => {
                let marker = MarkerId::fresh();
                let seg_id = self
                    .current_segment
                    .ok_or_else(|| VmError::internal("WithHandler: no current segment"))?;
                {
                    let seg = self
                        .arena
                        .get_mut(seg_id)
                        .ok_or_else(|| VmError::internal("WithHandler: dangling segment id"))?;
                    seg.push_frame(Frame::Marker { marker_id: marker });
                    seg.scope_chain.push(marker);
                }
                self.handlers.insert(
                    marker,
                    ActiveHandler {
                        entry,
                        prompt_seg_id: seg_id,
                    },
                );
                self.handler_stack.push(marker);
                self.eval_expr(*body)
            }
            DoCtrl::MaskBehind(identity, body) => {
                let marker = MarkerId::fresh();
                self.push_frame(Frame::Marker { marker_id: marker })?;
                self.masked.push((marker, identity));
                self.eval_expr(*body)
            }
            DoCtrl::Resume(k, value) => self.activate_resume(k, value),
            DoCtrl::Transfer(k, value) => self.activate_resume(k, value),
            DoCtrl::Delegate => self.do_forward(true),
            DoCtrl::Pass => self.do_forward(false),
            DoCtrl::GetContinuation => {
                let seg_id = self
                    .current_segment
                    .ok_or_else(|| VmError::internal("GetContinuation: no current segment"))?;
                let (frames, scope_chain) = {
                    let seg = self
                        .arena
                        .get(seg_id)
                        .ok_or_else(|| VmError::internal("GetContinuation: dangling segment id"))?;
                    (seg.frames.clone(), seg.scope_chain.clone())
                };
                let k = crate::continuation::Continuation::new(
                    seg_id,
                    std::sync::Arc::new(frames),
                    std::sync::Arc::new(scope_chain),
                    None,
                    Vec::new(),
                    crate::continuation::CallMetadata::default(),
                    None,
                );
                let handle = self.continuations.register(k);
                self.mode = Mode::Delivering(Value::Continuation(handle));
                Ok(())
            }
            DoCtrl::GetHandlers => {
                self.mode = Mode::Delivering(self.reflect_get_handlers());
                Ok(())
            }
            DoCtrl::GetCallStack => {
                self.mode = Mode::Delivering(self.reflect_get_call_stack());
                Ok(())
            }
            DoCtrl::GetTraceback(handle) => {
                let value = self.reflect_get_traceback(handle)?;
                self.mode = Mode::Delivering(value);
                Ok(())
            }
        }
    }

    /// Pop the top frame of the current segment and react to it according to
    /// `self.mode`'s delivered value.
    fn step_deliver(&mut self) -> Result<(), VmError> {
        let value = match &self.mode {
            Mode::Delivering(v) => v.clone(),
            _ => return Err(VmError::internal("step_deliver called outside Delivering mode")),
        };
        let seg_id = self
            .current_segment
            .ok_or_else(|| VmError::internal("step_deliver: no current segment"))?;
        let frame = self
            .arena
            .get_mut(seg_id)
            .ok_or_else(|| VmError::internal("step_deliver: dangling segment id"))?
            .pop_frame();

        match frame {
            None => {
                let caller = self.arena.get(seg_id).and_then(|s| s.caller);
                self.arena.free(seg_id);
                match caller {
                    Some(caller_id) => {
                        self.current_segment = Some(caller_id);
                        Ok(())
                    }
                    None => {
                        self.mode = Mode::Done(value);
                        Ok(())
                    }
                }
            }
            Some(Frame::Program { .. }) => Ok(()),
            Some(Frame::Catch) => {
                let mut fields = indexmap::IndexMap::new();
                fields.insert("value".to_string(), value);
                self.mode = Mode::Delivering(Value::record("Ok", fields));
                Ok(())
            }
            Some(Frame::Marker { marker_id }) => {
                self.handlers.remove(&marker_id);
                self.handler_stack.retain(|m| *m != marker_id);
                self.masked.retain(|(m, _)| *m != marker_id);
                Ok(())
            }
            Some(Frame::Map { f }) => {
                let v2 = f.call(value)?;
                self.mode = Mode::Delivering(v2);
                Ok(())
            }
            Some(Frame::FlatMap { f }) => {
                let next = f.call(value)?;
                self.eval_expr(next)
            }
            Some(Frame::HostStream { handle, metadata }) => {
                let step = self.with_host_lock(|| handle.send(value))?;
                match step {
                    StreamStep::Yielded(expr) => {
                        if let Some(seg) = self.arena.get_mut(seg_id) {
                            seg.push_frame(Frame::HostStream { handle, metadata });
                        }
                        self.eval_expr(expr)
                    }
                    StreamStep::Returned(v) => {
                        self.mode = Mode::Delivering(v);
                        Ok(())
                    }
                }
            }
            Some(Frame::Handler { phase, .. }) => {
                let _ = phase;
                self.handle_handler_return(value)
            }
        }
    }

    /// Drive `self.mode` until the active task suspends, completes, or
    /// fails. Each iteration is one logical `step_deliver`; `Running` only
    /// appears transiently right after a task
    /// is activated, before its root expression has been evaluated once.
    pub(crate) fn run_to_suspension(&mut self) -> Result<(), VmError> {
        loop {
            match &self.mode {
                Mode::Done(_) | Mode::Failed(_) | Mode::Suspended => return Ok(()),
                Mode::Running => return Ok(()),
                Mode::Delivering(_) => {
                    if let Err(e) = self.step_deliver() {
                        self.unwind_or_fail(e)?;
                    }
                }
            }
        }
    }

    /// On a catchable error, unwind the current segment (and its caller
    /// chain) looking for a `Safe` boundary; otherwise fail the task.
    pub(crate) fn unwind_or_fail(&mut self, err: VmError) -> Result<(), VmError> {
        if !err.is_catchable() {
            self.mode = Mode::Failed(err);
            return Ok(());
        }
        let mut seg_id_opt = self.current_segment;
        loop {
            let Some(seg_id) = seg_id_opt else {
                self.mode = Mode::Failed(err);
                return Ok(());
            };
            let found = self
                .arena
                .get(seg_id)
                .and_then(|seg| seg.frames.iter().rposition(|f| matches!(f, Frame::Catch)));
            match found {
                Some(idx) => {
                    if let Some(seg) = self.arena.get_mut(seg_id) {
                        seg.frames.truncate(idx);
                    }
                    self.current_segment = Some(seg_id);
                    let mut fields = indexmap::IndexMap::new();
                    fields.insert("message".to_string(), Value::str(err.to_string()));
                    self.mode = Mode::Delivering(Value::record("Err", fields));
                    return Ok(());
                }
                None => {
                    let caller = self.arena.get(seg_id).and_then(|s| s.caller);
                    self.arena.free(seg_id);
                    seg_id_opt = caller;
                }
            }
        }
    }

    /// Install a task's resumption point (fresh program root, or a settled
    /// dependency's delivered value/error) and drive it to suspension.
    fn run_task(&mut self, task_id: crate::ids::TaskId) -> Result<(), VmError> {
        self.current_task = Some(task_id);
        self.scheduler.mark_running(task_id);

        if let Some((k_handle, result)) = self.scheduler.take_pending_resume(task_id) {
            let k = self.continuations.take(k_handle)?;
            let prompt = self.prompt_segment_for(k.dispatch_id);
            self.activate_continuation(&k, prompt);
            match result {
                Ok(v) => self.mode = Mode::Delivering(v),
                Err(e) => self.mode = Mode::Failed(e),
            }
        } else {
            let root = self
                .scheduler
                .task(task_id)
                .map(|t| t.root)
                .ok_or_else(|| VmError::internal("run_task: unknown task id"))?;
            let k = self.continuations.take(root)?;
            let program = k.program_ref.clone();
            let root_seg = Segment::root(Vec::new());
            let seg_id = self.arena.alloc(root_seg);
            self.current_segment = Some(seg_id);
            match program {
                Some(expr) => {
                    if let Err(e) = self.eval_expr(expr) {
                        self.unwind_or_fail(e)?;
                    }
                }
                None => return Err(VmError::internal("run_task: task root has no program")),
            }
        }
        self.run_to_suspension()
    }

    /// Run the cooperative scheduler until `root_task` settles. Orphaned
    /// sibling tasks are simply left in the ready queue/registry once the
    /// root's result is known.
    pub(crate) fn pump(&mut self, root_task: crate::ids::TaskId) -> Result<Value, VmError> {
        loop {
            self.scheduler.drain_external_completions();
            self.scheduler.settle_waiters();

            let Some(task_id) = self.scheduler.pop_ready() else {
                if self.scheduler.has_pending_external() {
                    return Err(VmError::internal(
                        "pump: ready queue empty with external promises still pending (use async_run)",
                    ));
                }
                return Err(VmError::SchedulerDeadlock {
                    waiting: self.scheduler.waiting_task_count(),
                });
            };

            self.run_task(task_id)?;

            match std::mem::replace(&mut self.mode, Mode::Running) {
                Mode::Done(v) => {
                    self.scheduler.complete(task_id, TaskOutcome::Completed(v.clone()));
                    if task_id == root_task {
                        return Ok(v);
                    }
                }
                Mode::Failed(e) => {
                    self.scheduler.complete(task_id, TaskOutcome::Failed(e.clone()));
                    if task_id == root_task {
                        return Err(e);
                    }
                }
                Mode::Suspended => {}
                other => self.mode = other,
            }
        }
    }
}
