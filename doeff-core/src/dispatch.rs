//! The dispatch engine: finding a handler for a performed effect, masking
//! busy handlers against self-recursion, and `Resume`/`Transfer`/`Delegate`/
//! `Pass`.

use crate::error::VmError;
use crate::handler::NativeOutcome;
use crate::ids::{DispatchId, MarkerId};
use crate::segment::{Frame, HandlerPhase, Segment};
use crate::value::Value;
use crate::vm::{DispatchContext, Mode, Vm};
use std::collections::HashSet;

impl Vm {
    /// Markers visible from the current segment, innermost first, with the
    /// handlers already busy handling the in-flight dispatch (and anything
    /// masked by `MaskBehind`) removed.
    fn visible_handler_chain(&self) -> Vec<MarkerId> {
        let mut chain = self.current_scope_chain();
        chain.reverse();

        if let Some(top) = self.dispatch_stack.last() {
            if !top.completed {
                let busy: HashSet<MarkerId> = top.handler_chain[..=top.handler_idx].iter().copied().collect();
                chain.retain(|m| !busy.contains(m));
            }
        }

        if !self.masked.is_empty() {
            chain.retain(|m| {
                let identity = self.handlers.get(m).map(|a| &a.entry.identity);
                match identity {
                    Some(id) => !self.masked.iter().any(|(_, masked_id)| masked_id == id),
                    None => true,
                }
            });
        }

        chain
    }

    fn find_matching_handler(&self, chain: &[MarkerId], effect: &Value) -> Result<usize, VmError> {
        for (idx, marker) in chain.iter().enumerate() {
            if let Some(active) = self.handlers.get(marker) {
                if self.with_host_lock(|| active.entry.can_handle(effect))? {
                    return Ok(idx);
                }
            }
        }
        Err(VmError::unhandled_effect(effect.clone()))
    }

    pub(crate) fn start_dispatch(&mut self, effect: Value) -> Result<(), VmError> {
        let chain = self.visible_handler_chain();
        let idx = self.find_matching_handler(&chain, &effect)?;
        let marker = chain[idx];
        let active = self
            .handlers
            .get(&marker)
            .cloned()
            .ok_or_else(|| VmError::internal("dispatch: handler vanished between match and invoke"))?;

        let dispatch_id = DispatchId::fresh();
        let (k_handle, cur_seg_id) = self.capture_above_marker(marker, Some(dispatch_id), None)?;

        self.dispatch_stack.push(DispatchContext {
            dispatch_id,
            effect: effect.clone(),
            handler_chain: chain,
            handler_idx: idx,
            k_user: k_handle,
            completed: false,
        });

        self.run_handler_body(marker, cur_seg_id, active.entry, HandlerPhase::Start, effect, k_handle)
    }

    /// Invoke a handler's `start`/`delegate` phase and, unless it suspends
    /// cooperatively, push a fresh segment to evaluate the returned body in.
    pub(crate) fn run_handler_body(
        &mut self,
        marker: MarkerId,
        caller_seg_id: crate::ids::SegmentId,
        entry: crate::handler::HandlerEntry,
        phase: HandlerPhase,
        effect: Value,
        k_handle: crate::continuation::ContinuationHandle,
    ) -> Result<(), VmError> {
        match entry.kind {
            crate::handler::HandlerKind::Native(native) => {
                let start = native.start.clone();
                match start(self, effect, k_handle)? {
                    NativeOutcome::Suspend => {
                        self.mode = Mode::Suspended;
                        Ok(())
                    }
                    NativeOutcome::Step(body) => {
                        self.push_handler_segment(marker, caller_seg_id, phase);
                        self.eval_expr(body)
                    }
                }
            }
            crate::handler::HandlerKind::Host(host) => {
                let body = match phase {
                    HandlerPhase::Delegate => self.with_host_lock(|| host.delegate(effect, k_handle))?,
                    _ => self.with_host_lock(|| host.start(effect, k_handle))?,
                };
                self.push_handler_segment(marker, caller_seg_id, phase);
                self.eval_expr(body)
            }
        }
    }

    fn push_handler_segment(&mut self, marker: MarkerId, caller_seg_id: crate::ids::SegmentId, phase: HandlerPhase) {
        let seg = Segment {
            id: 0,
            frames: vec![Frame::Handler { marker, phase }],
            scope_chain: self.current_scope_chain(),
            caller: Some(caller_seg_id),
        };
        let seg_id = self.arena.alloc(seg);
        self.current_segment = Some(seg_id);
    }

    /// `Resume(k, v)` and `Transfer(k, v)` share the same mechanics: consume
    /// `k` (enforcing one-shot), splice its frames into a fresh segment whose
    /// caller is that dispatch's prompt, and deliver `v` into it. The handler
    /// body that issued the call is abandoned: resumption is tail-resumptive,
    /// never returned to.
    pub(crate) fn activate_resume(&mut self, handle: crate::continuation::ContinuationHandle, value: Value) -> Result<(), VmError> {
        let k = self.continuations.take(handle)?;
        let prompt = self.prompt_segment_for(k.dispatch_id);
        self.mark_dispatch_completed(k.dispatch_id);
        // The handler body's own segment (whatever is current right now) is
        // abandoned the moment it resumes — tail-resumptive, never returned
        // to — so free it instead of leaking an arena slot.
        if let Some(abandoned) = self.current_segment {
            self.arena.free(abandoned);
        }
        self.activate_continuation(&k, prompt);
        self.mode = Mode::Delivering(value);
        Ok(())
    }

    /// `Delegate`/`Pass`: re-offer the in-flight effect to the next handler
    /// outward in the chain captured at dispatch start. The continuation
    /// handed to that outer handler must still run the frames captured
    /// above the original `Perform` (`top.k_user`) once the delegating
    /// handler's own body frames finish delivering, or whatever computation
    /// followed the `Perform` is silently dropped. `Delegate` additionally
    /// threads the consumed `k_user` in as the new continuation's parent so
    /// `GetTraceback` can reconstruct the hop; `Pass` does not.
    pub(crate) fn do_forward(&mut self, keep_parent: bool) -> Result<(), VmError> {
        let top = self
            .dispatch_stack
            .last()
            .cloned()
            .ok_or_else(|| VmError::internal("Delegate/Pass outside an active dispatch"))?;

        let cur_seg_id = self
            .current_segment
            .ok_or_else(|| VmError::internal("Delegate/Pass: no current segment"))?;
        let (leftover_frames, scope_chain) = {
            let seg = self
                .arena
                .get_mut(cur_seg_id)
                .ok_or_else(|| VmError::internal("Delegate/Pass: dangling segment id"))?;
            (std::mem::take(&mut seg.frames), seg.scope_chain.clone())
        };

        // `k_user` is being subsumed into `k_new` here, so one-shot use is
        // enforced by consuming it rather than merely peeking at it. Its
        // frames go first (outermost) so they run only after the
        // delegating handler's own leftover frames (innermost) have
        // finished delivering into this same continuation.
        let k_user = self.continuations.take(top.k_user)?;
        let mut frames = (*k_user.frames).clone();
        frames.extend(leftover_frames);

        let parent = if keep_parent { Some(std::sync::Arc::new(k_user)) } else { None };
        let k_new = crate::continuation::Continuation::new(
            cur_seg_id,
            std::sync::Arc::new(frames),
            std::sync::Arc::new(scope_chain),
            Some(top.dispatch_id),
            Vec::new(),
            crate::continuation::CallMetadata::default(),
            parent,
        );
        let k_new_handle = self.continuations.register(k_new);

        for idx in (top.handler_idx + 1)..top.handler_chain.len() {
            let marker = top.handler_chain[idx];
            let Some(active) = self.handlers.get(&marker).cloned() else { continue };
            if self.with_host_lock(|| active.entry.can_handle(&top.effect))? {
                if let Some(ctx) = self.dispatch_stack.last_mut() {
                    ctx.handler_idx = idx;
                    ctx.k_user = k_new_handle;
                }
                return self.run_handler_body(
                    marker,
                    cur_seg_id,
                    active.entry,
                    HandlerPhase::Delegate,
                    top.effect,
                    k_new_handle,
                );
            }
        }

        Err(VmError::unhandled_effect(top.effect))
    }
}
