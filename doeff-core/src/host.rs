//! The FFI boundary to a host dynamic-language runtime.
//!
//! A VM embedded inside a dynamic host language must take that language's
//! global lock before touching anything it owns. Since this crate is not
//! tied to a specific host, that discipline is
//! captured as a trait object (`HostHandler`, `HostStream`) plus a single
//! coarse-grained [`HostLock`] — an embedder wires a concrete language
//! binding up to these traits instead of linking against a C ABI.

use crate::continuation::ContinuationHandle;
use crate::error::VmError;
use crate::handler::Identity;
use crate::ir::DoExpr;
use crate::segment::FrameMetadata;
use crate::value::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// A non-native (host-provided) effect handler.
///
/// `can_handle` is required to be total and side-effect-free;
/// the VM calls it with the host lock held but never mutates arena state
/// while doing so.
pub trait HostHandler: fmt::Debug + Send + Sync {
    fn can_handle(&self, effect: &Value) -> Result<bool, VmError>;
    fn start(&self, effect: Value, k: ContinuationHandle) -> Result<DoExpr, VmError>;

    /// Reserved for advanced handlers; default delegates to `start`.
    fn resume(&self, effect: Value, k: ContinuationHandle, _value: Value) -> Result<DoExpr, VmError> {
        self.start(effect, k)
    }

    fn delegate(&self, effect: Value, k: ContinuationHandle) -> Result<DoExpr, VmError> {
        self.start(effect, k)
    }

    fn identity(&self) -> Identity;
}

/// Result of stepping a host-owned generator/coroutine one tick.
#[derive(Debug, Clone)]
pub enum StreamStep {
    Yielded(DoExpr),
    Returned(Value),
}

/// A foreign-coroutine stepping cursor.
///
/// `send`/`throw` require the host lock; `debug_location` is used only for
/// traceback fallback and is cheap enough to call without the lock in this
/// abstraction (a concrete binding may still choose to take it internally).
pub trait HostStream: fmt::Debug + Send + Sync {
    fn send(&self, value: Value) -> Result<StreamStep, VmError>;
    fn throw(&self, error: VmError) -> Result<StreamStep, VmError>;
    fn debug_location(&self) -> Option<FrameMetadata>;
}

pub type HostStreamHandle = Arc<dyn HostStream>;

/// The coarse-grained host lock.
///
/// Acquired only around host calls and host-generator stepping; never held
/// across arena mutation or more than one host call.
#[derive(Default)]
pub struct HostLock {
    inner: parking_lot::Mutex<()>,
}

impl fmt::Debug for HostLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HostLock")
    }
}

impl HostLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for the duration of `f`, then release it. Callers
    /// must not perform arena mutation inside `f`.
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        let started = std::time::Instant::now();
        let _guard = self.inner.lock();
        let result = f();
        let held: Duration = started.elapsed();
        trace!(held_micros = held.as_micros(), "host lock scope released");
        result
    }
}
