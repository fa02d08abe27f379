//! VM state and the handful of operations every
//! other module in this crate is built around: segment bookkeeping,
//! continuation capture/install, and the reflection primitives
//! (`GetHandlers`/`GetCallStack`/`GetTraceback`) that read across the whole
//! arena rather than just the current segment.
//!
//! The actual interpreter loop lives in [`crate::step`]; dispatch in
//! [`crate::dispatch`]. This module owns the data they operate on.

use crate::config::VmConfig;
use crate::continuation::{CallMetadata, Continuation, ContinuationHandle, ContinuationRegistry};
use crate::error::VmError;
use crate::handler::{HandlerEntry, Identity};
use crate::host::HostLock;
use crate::ids::{MarkerId, SegmentId, TaskId};
use crate::scheduler::Scheduler;
use crate::segment::{Frame, Segment, SegmentArena};
use crate::value::{Bindings, Value};
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// A handler currently installed by a live `WithHandler` scope.
#[derive(Debug, Clone)]
pub struct ActiveHandler {
    pub entry: HandlerEntry,
    /// Segment to resume in once this handler's scope (and everything
    /// dispatched into it) is done with — i.e. what was "current" right
    /// before the matching `WithHandler` pushed its marker.
    pub prompt_seg_id: SegmentId,
}

/// One in-flight `Perform` dispatch.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub dispatch_id: crate::ids::DispatchId,
    pub effect: Value,
    /// Innermost-first chain of markers that were visible when this
    /// dispatch started, so `Delegate`/`Pass` know where to resume probing.
    pub handler_chain: Vec<MarkerId>,
    pub handler_idx: usize,
    /// The continuation a `Resume`/`Transfer` inside the handler body
    /// currently targets. Replaced by `Delegate`/`Pass` with a fresh
    /// capture each time the effect is forwarded to an outer handler.
    pub k_user: ContinuationHandle,
    pub completed: bool,
}

/// Where the step machine stands with respect to the currently active task.
#[derive(Debug, Clone)]
pub enum Mode {
    /// About to evaluate a fresh `DoExpr` (task just activated).
    Running,
    /// A value is being delivered down through the current segment's frames.
    Delivering(Value),
    /// The active task suspended cooperatively (blocked on a task/promise).
    Suspended,
    Done(Value),
    Failed(VmError),
}

pub struct Vm {
    pub(crate) arena: SegmentArena,
    pub(crate) current_segment: Option<SegmentId>,
    pub(crate) handlers: FxHashMap<MarkerId, ActiveHandler>,
    /// Lexically active `WithHandler` scopes, innermost last.
    pub(crate) handler_stack: Vec<MarkerId>,
    /// Identities currently hidden from dispatch by `MaskBehind`, keyed by
    /// the `Marker` frame that will restore them on scope exit.
    pub(crate) masked: Vec<(MarkerId, Identity)>,
    pub(crate) dispatch_stack: Vec<DispatchContext>,
    pub(crate) continuations: ContinuationRegistry,
    pub(crate) scheduler: Scheduler,
    pub(crate) current_task: Option<TaskId>,
    pub mode: Mode,
    pub(crate) host_lock: HostLock,
    pub config: VmConfig,
    /// The in-memory mapping `Get`/`Put`/`Modify` operate on. Seeded from
    /// `run`/`async_run`'s `store` argument;
    /// read back afterward as `RunResult.raw_store`.
    pub(crate) store: Bindings,
}

impl Vm {
    pub fn new(config: VmConfig) -> Self {
        Self {
            arena: SegmentArena::new(),
            current_segment: None,
            handlers: FxHashMap::default(),
            handler_stack: Vec::new(),
            masked: Vec::new(),
            dispatch_stack: Vec::new(),
            continuations: ContinuationRegistry::new(),
            scheduler: Scheduler::new(),
            current_task: None,
            mode: Mode::Running,
            host_lock: HostLock::new(),
            config,
            store: Bindings::new(),
        }
    }

    pub fn store(&self) -> &Bindings {
        &self.store
    }

    pub fn with_host_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        self.host_lock.with(f)
    }

    pub(crate) fn current_scope_chain(&self) -> Vec<MarkerId> {
        self.current_segment
            .and_then(|id| self.arena.get(id))
            .map(|seg| seg.scope_chain.clone())
            .unwrap_or_default()
    }

    pub(crate) fn push_frame(&mut self, frame: Frame) -> Result<(), VmError> {
        let seg_id = self
            .current_segment
            .ok_or_else(|| VmError::internal("push_frame: no current segment"))?;
        self.arena
            .get_mut(seg_id)
            .ok_or_else(|| VmError::internal("push_frame: dangling segment id"))?
            .push_frame(frame);
        Ok(())
    }

    /// Splice a continuation's captured frames into a fresh segment and make
    /// it current.
    pub(crate) fn activate_continuation(
        &mut self,
        k: &Continuation,
        caller: Option<SegmentId>,
    ) -> SegmentId {
        let seg = Segment {
            id: 0,
            frames: (*k.frames).clone(),
            scope_chain: (*k.scope_chain).clone(),
            caller,
        };
        let seg_id = self.arena.alloc(seg);
        self.current_segment = Some(seg_id);
        seg_id
    }

    /// Capture the live frames above `marker` in the current segment into an
    /// immutable snapshot, truncating them out of the live segment in the
    /// same step. One-shot is enforced
    /// later, at `take`, not here — capturing a continuation never consumes
    /// anything by itself (`GetContinuation` relies on that).
    pub(crate) fn capture_above_marker(
        &mut self,
        marker: MarkerId,
        dispatch_id: Option<crate::ids::DispatchId>,
        parent: Option<Arc<Continuation>>,
    ) -> Result<(ContinuationHandle, SegmentId), VmError> {
        let seg_id = self
            .current_segment
            .ok_or_else(|| VmError::internal("capture: no current segment"))?;
        let seg = self
            .arena
            .get_mut(seg_id)
            .ok_or_else(|| VmError::internal("capture: dangling segment id"))?;
        let marker_idx = seg
            .frames
            .iter()
            .position(|f| f.is_marker_for(marker))
            .ok_or_else(|| VmError::internal("capture: marker frame not found in current segment"))?;
        let captured: Vec<Frame> = seg.frames.split_off(marker_idx + 1);
        let scope_chain = seg.scope_chain.clone();
        let k = Continuation::new(
            seg_id,
            Arc::new(captured),
            Arc::new(scope_chain),
            dispatch_id,
            Vec::new(),
            CallMetadata::default(),
            parent,
        );
        let handle = self.continuations.register(k);
        Ok((handle, seg_id))
    }

    pub(crate) fn prompt_segment_for(&self, dispatch_id: Option<crate::ids::DispatchId>) -> Option<SegmentId> {
        let d = dispatch_id?;
        let ctx = self.dispatch_stack.iter().rev().find(|c| c.dispatch_id == d)?;
        // the prompt is wherever the handler for this dispatch was
        // installed; chase it through the marker that started it.
        self.handlers
            .get(&ctx.handler_chain[ctx.handler_idx])
            .map(|a| a.prompt_seg_id)
    }

    fn lazy_pop_completed(&mut self) {
        while matches!(self.dispatch_stack.last(), Some(c) if c.completed) {
            self.dispatch_stack.pop();
        }
    }

    pub(crate) fn mark_dispatch_completed(&mut self, dispatch_id: Option<crate::ids::DispatchId>) {
        if let Some(d) = dispatch_id {
            if let Some(ctx) = self.dispatch_stack.iter_mut().rev().find(|c| c.dispatch_id == d) {
                ctx.completed = true;
            }
        }
        self.lazy_pop_completed();
    }

    pub(crate) fn handle_handler_return(&mut self, value: Value) -> Result<(), VmError> {
        if let Some(top) = self.dispatch_stack.last_mut() {
            top.completed = true;
        }
        self.lazy_pop_completed();
        self.mode = Mode::Delivering(value);
        Ok(())
    }

    // --- Reflection primitives ---

    pub(crate) fn reflect_get_handlers(&self) -> Value {
        let list: Vec<Value> = self
            .handler_stack
            .iter()
            .rev()
            .filter_map(|m| self.handlers.get(m))
            .map(|a| a.entry.identity.to_value())
            .collect();
        Value::List(Arc::new(list))
    }

    pub(crate) fn reflect_get_call_stack(&self) -> Value {
        let mut out = Vec::new();
        let mut cursor = self.current_segment;
        while let Some(seg_id) = cursor {
            let Some(seg) = self.arena.get(seg_id) else { break };
            for frame in seg.frames.iter().rev() {
                match frame {
                    Frame::Program { metadata } | Frame::HostStream { metadata, .. } => {
                        out.push(frame_metadata_to_value(metadata));
                    }
                    _ => {}
                }
            }
            cursor = seg.caller;
        }
        Value::List(Arc::new(out))
    }

    pub(crate) fn reflect_get_traceback(&self, handle: ContinuationHandle) -> Result<Value, VmError> {
        let k = self
            .continuations
            .peek(handle)
            .ok_or_else(|| VmError::internal("GetTraceback: unknown continuation"))?;
        let tb = crate::traceback::Traceback::capture(&k);
        let hops: Vec<Value> = tb
            .hops
            .into_iter()
            .map(|hop| {
                Value::List(Arc::new(hop.frames.iter().map(frame_metadata_to_value).collect()))
            })
            .collect();
        Ok(Value::List(Arc::new(hops)))
    }
}

fn frame_metadata_to_value(m: &crate::segment::FrameMetadata) -> Value {
    let mut fields = IndexMap::new();
    fields.insert("function_name".to_string(), Value::str(m.function_name.clone()));
    fields.insert("source_file".to_string(), Value::str(m.source_file.clone()));
    fields.insert("source_line".to_string(), Value::Int(m.source_line as i64));
    Value::record("Frame", fields)
}
