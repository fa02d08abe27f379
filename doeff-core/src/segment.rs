//! The segment arena: storage for frames above a `WithHandler` marker.
//!
//! Segments are stored densely and recycled through a free list so capture
//! and restore don't pay allocator overhead on the hot path. Exactly one
//! segment is "current" at any time; the others are reachable only through
//! a `Continuation`'s `segment_id` or a `caller` chain.

use crate::host::HostStreamHandle;
use crate::ids::{MarkerId, SegmentId};
use crate::ir::{BindFn, PureFn};
use std::fmt;
use std::sync::Arc;

/// Source location recorded on `Program`/`HostStream` frames for
/// `GetCallStack`/`GetTraceback`.
#[derive(Debug, Clone, Default)]
pub struct FrameMetadata {
    pub function_name: String,
    pub source_file: String,
    pub source_line: u32,
}

impl FrameMetadata {
    pub fn new(function_name: impl Into<String>, source_file: impl Into<String>, source_line: u32) -> Self {
        Self {
            function_name: function_name.into(),
            source_file: source_file.into(),
            source_line,
        }
    }

    pub fn unknown() -> Self {
        Self {
            function_name: "<unknown>".to_string(),
            source_file: "<unknown>".to_string(),
            source_line: 0,
        }
    }
}

/// Which phase of the handler protocol a `Handler` frame is executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerPhase {
    Start,
    Resume,
    Delegate,
}

/// A single stack slot in a segment.
#[derive(Debug, Clone)]
pub enum Frame {
    /// A native-expression call frame, kept for call-stack/traceback
    /// bookkeeping. Native evaluation of the `DoExpr` tree itself is driven
    /// by `Map`/`FlatMap` frames and the step machine's `Mode`, so this
    /// frame carries no resumable state of its own: once a value is
    /// delivered to it, it is popped and delivery continues below it.
    Program { metadata: FrameMetadata },
    /// A foreign-coroutine stepping cursor; requires the host lock to step.
    HostStream {
        handle: HostStreamHandle,
        metadata: FrameMetadata,
    },
    /// A user handler body currently executing.
    Handler { marker: MarkerId, phase: HandlerPhase },
    /// Anchors the entry of a `WithHandler` scope.
    Marker { marker_id: MarkerId },
    Map { f: Arc<dyn PureFn> },
    FlatMap { f: Arc<dyn BindFn> },
    /// A `Safe` boundary: catches a catchable `VmError` unwinding through it.
    Catch,
}

impl Frame {
    pub fn is_marker_for(&self, marker_id: MarkerId) -> bool {
        matches!(self, Frame::Marker { marker_id: m } if *m == marker_id)
    }
}

/// A delimited region of the continuation: one handler scope's worth of
/// frames plus the scope chain visible from it.
#[derive(Clone)]
pub struct Segment {
    pub id: SegmentId,
    pub frames: Vec<Frame>,
    pub scope_chain: Vec<MarkerId>,
    /// The segment execution returns to once this one empties out.
    pub caller: Option<SegmentId>,
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("frames", &self.frames.len())
            .field("scope_chain", &self.scope_chain)
            .field("caller", &self.caller)
            .finish()
    }
}

impl Segment {
    pub fn new(marker: MarkerId, caller: Option<SegmentId>, mut scope_chain: Vec<MarkerId>) -> Self {
        scope_chain.push(marker);
        Self {
            id: 0,
            frames: Vec::new(),
            scope_chain,
            caller,
        }
    }

    pub fn root(scope_chain: Vec<MarkerId>) -> Self {
        Self {
            id: 0,
            frames: Vec::new(),
            scope_chain,
            caller: None,
        }
    }

    pub fn push_frame(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub fn pop_frame(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    pub fn top_frame(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Dense arena of segments with free-list reuse.
#[derive(Debug, Default)]
pub struct SegmentArena {
    segments: Vec<Option<Segment>>,
    free_list: Vec<SegmentId>,
}

impl SegmentArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, mut segment: Segment) -> SegmentId {
        if let Some(id) = self.free_list.pop() {
            segment.id = id;
            self.segments[id] = Some(segment);
            id
        } else {
            let id = self.segments.len();
            segment.id = id;
            self.segments.push(Some(segment));
            id
        }
    }

    pub fn get(&self, id: SegmentId) -> Option<&Segment> {
        self.segments.get(id).and_then(|slot| slot.as_ref())
    }

    pub fn get_mut(&mut self, id: SegmentId) -> Option<&mut Segment> {
        self.segments.get_mut(id).and_then(|slot| slot.as_mut())
    }

    /// Free a segment, returning it to the free list for reuse. Only valid
    /// once the segment is empty and no continuation references it.
    pub fn free(&mut self, id: SegmentId) {
        if let Some(slot) = self.segments.get_mut(id) {
            *slot = None;
            self.free_list.push(id);
        }
    }

    pub fn live_count(&self) -> usize {
        self.segments.iter().filter(|s| s.is_some()).count()
    }
}
