//! Reified, one-shot continuations.
//!
//! A `Continuation` is an immutable snapshot of the frames above a dispatch
//! point. It never changes after capture; the *registry* is what enforces
//! one-shot use, by removing the snapshot from its table on the first
//! successful `take` and remembering the id was used so a second attempt
//! fails with `ContinuationAlreadyUsed` rather than silently returning
//! nothing.

use crate::handler::{HandlerEntry, Identity};
use crate::ids::{ContId, DispatchId};
use crate::ir::DoExpr;
use crate::segment::Frame;
use crate::error::VmError;
use crate::ids::MarkerId;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt;
use std::sync::Arc;

/// Call-site metadata recorded when a continuation is captured, used as the
/// innermost traceback hop if nothing more specific is available.
#[derive(Debug, Clone, Default)]
pub struct CallMetadata {
    pub function_name: String,
    pub source_file: String,
    pub source_line: u32,
}

/// Immutable snapshot of the computation above a dispatch point.
#[derive(Debug, Clone)]
pub struct Continuation {
    pub id: ContId,
    pub segment_id: crate::ids::SegmentId,
    pub frames: Arc<Vec<Frame>>,
    pub scope_chain: Arc<Vec<MarkerId>>,
    pub dispatch_id: Option<DispatchId>,
    pub started: bool,
    pub program_ref: Option<DoExpr>,
    pub handlers: Vec<HandlerEntry>,
    pub handler_identities: Vec<Option<Identity>>,
    pub metadata: CallMetadata,
    pub parent: Option<Arc<Continuation>>,
}

impl Continuation {
    pub fn new(
        segment_id: crate::ids::SegmentId,
        frames: Arc<Vec<Frame>>,
        scope_chain: Arc<Vec<MarkerId>>,
        dispatch_id: Option<DispatchId>,
        handlers: Vec<HandlerEntry>,
        metadata: CallMetadata,
        parent: Option<Arc<Continuation>>,
    ) -> Self {
        let handler_identities = handlers.iter().map(|h| Some(h.identity.clone())).collect();
        Self {
            id: ContId::fresh(),
            segment_id,
            frames,
            scope_chain,
            dispatch_id,
            started: false,
            program_ref: None,
            handlers,
            handler_identities,
            metadata,
            parent,
        }
    }

    /// Walk the parent chain, one hop per `Delegate` taken. Innermost first.
    pub fn parent_chain(&self) -> Vec<Arc<Continuation>> {
        let mut hops = Vec::new();
        let mut cursor = self.parent.clone();
        while let Some(parent) = cursor {
            cursor = parent.parent.clone();
            hops.push(parent);
        }
        hops
    }
}

/// Opaque, copyable handle to a continuation. The only thing the public API
/// and host embedders ever see — the `Continuation` payload itself lives in
/// the registry.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContinuationHandle(pub(crate) ContId);

impl ContinuationHandle {
    pub fn id(&self) -> ContId {
        self.0
    }
}

impl fmt::Debug for ContinuationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "K({})", self.0 .0)
    }
}

/// Registry of reified continuations, owned by the `VM`.
///
/// `register`/`take`/`has` form a register/take/has-continuation triplet,
/// scoped to one registry per VM instance instead of a process-global table —
/// there is no mutable state shared across VM instances.
#[derive(Default)]
pub struct ContinuationRegistry {
    table: RwLock<FxHashMap<ContId, Continuation>>,
    used: RwLock<FxHashSet<ContId>>,
}

impl fmt::Debug for ContinuationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContinuationRegistry")
            .field("live", &self.table.read().len())
            .field("used", &self.used.read().len())
            .finish()
    }
}

impl ContinuationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, k: Continuation) -> ContinuationHandle {
        let id = k.id;
        self.table.write().insert(id, k);
        ContinuationHandle(id)
    }

    pub fn has(&self, handle: ContinuationHandle) -> bool {
        self.table.read().contains_key(&handle.0)
    }

    /// Non-consuming read, used by `GetTraceback` which may be called
    /// without spending the continuation's one Resume/Transfer use.
    pub fn peek(&self, handle: ContinuationHandle) -> Option<Continuation> {
        self.table.read().get(&handle.0).cloned()
    }

    /// Consume the continuation for a `Resume`/`Transfer`. Enforces the
    /// one-shot invariant: a continuation can be resumed at most once.
    pub fn take(&self, handle: ContinuationHandle) -> Result<Continuation, VmError> {
        {
            let used = self.used.read();
            if used.contains(&handle.0) {
                return Err(VmError::continuation_already_used(handle.0));
            }
        }
        let mut table = self.table.write();
        match table.remove(&handle.0) {
            Some(k) => {
                self.used.write().insert(handle.0);
                Ok(k)
            }
            None => Err(VmError::continuation_already_used(handle.0)),
        }
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
