//! The `DoExpr`/`DoCtrl` intermediate representation.
//!
//! Every user-observable AST node is a `DoExpr`; `DoCtrl` is the subset of
//! control primitives the step machine interprets specially. Each node
//! carries its own enum discriminant (`ExprTag`) reachable without a host
//! call, so `classify` never needs to touch the host lock.

use crate::continuation::ContinuationHandle;
use crate::error::VmError;
use crate::handler::HandlerEntry;
use crate::host::HostStreamHandle;
use crate::value::{Bindings, Value};
use std::fmt;
use std::sync::Arc;

/// A pure value-to-value transform, reified so `Map` can be classified and
/// stepped without capturing a host closure over generator state.
pub trait PureFn: Send + Sync + fmt::Debug {
    fn call(&self, value: Value) -> Result<Value, VmError>;
}

/// A value-to-`DoExpr` transform used by `FlatMap`.
pub trait BindFn: Send + Sync + fmt::Debug {
    fn call(&self, value: Value) -> Result<DoExpr, VmError>;
}

/// The callee of an `Apply` node (macro-expansion call site).
pub trait ApplyFn: Send + Sync + fmt::Debug {
    fn call(&self, args: Vec<Value>, kwargs: Bindings) -> Result<DoExpr, VmError>;

    /// Source location of the call site, for `GetCallStack`/`GetTraceback`.
    /// `None` for callees built from a bare closure with no name to report.
    fn debug_location(&self) -> Option<crate::segment::FrameMetadata> {
        None
    }
}

struct FnShim<F>(F);

impl<F> fmt::Debug for FnShim<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<native fn>")
    }
}

impl<F: Fn(Value) -> Result<Value, VmError> + Send + Sync> PureFn for FnShim<F> {
    fn call(&self, value: Value) -> Result<Value, VmError> {
        (self.0)(value)
    }
}

impl<F: Fn(Value) -> Result<DoExpr, VmError> + Send + Sync> BindFn for FnShim<F> {
    fn call(&self, value: Value) -> Result<DoExpr, VmError> {
        (self.0)(value)
    }
}

impl<F: Fn(Vec<Value>, Bindings) -> Result<DoExpr, VmError> + Send + Sync> ApplyFn for FnShim<F> {
    fn call(&self, args: Vec<Value>, kwargs: Bindings) -> Result<DoExpr, VmError> {
        (self.0)(args, kwargs)
    }
}

pub fn pure_fn(f: impl Fn(Value) -> Result<Value, VmError> + Send + Sync + 'static) -> Arc<dyn PureFn> {
    Arc::new(FnShim(f))
}

pub fn bind_fn(f: impl Fn(Value) -> Result<DoExpr, VmError> + Send + Sync + 'static) -> Arc<dyn BindFn> {
    Arc::new(FnShim(f))
}

pub fn apply_fn(
    f: impl Fn(Vec<Value>, Bindings) -> Result<DoExpr, VmError> + Send + Sync + 'static,
) -> Arc<dyn ApplyFn> {
    Arc::new(FnShim(f))
}

struct NamedApplyFn<F> {
    f: F,
    metadata: crate::segment::FrameMetadata,
}

impl<F> fmt::Debug for NamedApplyFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedApplyFn").field("metadata", &self.metadata).finish()
    }
}

impl<F: Fn(Vec<Value>, Bindings) -> Result<DoExpr, VmError> + Send + Sync> ApplyFn for NamedApplyFn<F> {
    fn call(&self, args: Vec<Value>, kwargs: Bindings) -> Result<DoExpr, VmError> {
        (self.f)(args, kwargs)
    }

    fn debug_location(&self) -> Option<crate::segment::FrameMetadata> {
        Some(self.metadata.clone())
    }
}

/// Like [`apply_fn`], but records the call site so `GetCallStack`/
/// `GetTraceback` can report something other than `<unknown>` for it.
pub fn apply_fn_named(
    function_name: impl Into<String>,
    source_file: impl Into<String>,
    source_line: u32,
    f: impl Fn(Vec<Value>, Bindings) -> Result<DoExpr, VmError> + Send + Sync + 'static,
) -> Arc<dyn ApplyFn> {
    Arc::new(NamedApplyFn {
        f,
        metadata: crate::segment::FrameMetadata::new(function_name, source_file, source_line),
    })
}

/// Structural tag for a `DoExpr`, read at a fixed offset without a host call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExprTag {
    Pure,
    Effect,
    Perform,
    Map,
    FlatMap,
    HostStream,
    Apply,
    WithHandler,
    Resume,
    Transfer,
    Delegate,
    Pass,
    GetContinuation,
    GetHandlers,
    GetCallStack,
    GetTraceback,
    MaskBehind,
    Safe,
}

#[derive(Debug, Clone)]
pub enum DoExpr {
    Pure(Value),
    Effect(Value),
    Perform(Box<DoExpr>),
    Map(Box<DoExpr>, Arc<dyn PureFn>),
    FlatMap(Box<DoExpr>, Arc<dyn BindFn>),
    HostStream(HostStreamHandle),
    Apply(Arc<dyn ApplyFn>, Vec<Value>, Bindings),
    /// Catch any catchable `VmError` raised anywhere in the dynamic extent
    /// of the wrapped expression, surfacing it as `Record("Err", ..)`
    /// instead of failing the whole run. Not one of the core control
    /// primitives, but representable only with direct step-machine support
    /// since nothing else in the IR unwinds on error.
    Safe(Box<DoExpr>),
    Ctrl(Box<DoCtrl>),
}

#[derive(Debug, Clone)]
pub enum DoCtrl {
    WithHandler(HandlerEntry, Box<DoExpr>),
    Resume(ContinuationHandle, Value),
    Transfer(ContinuationHandle, Value),
    Delegate,
    Pass,
    GetContinuation,
    GetHandlers,
    GetCallStack,
    GetTraceback(ContinuationHandle),
    MaskBehind(crate::handler::Identity, Box<DoExpr>),
}

impl DoExpr {
    pub fn tag(&self) -> ExprTag {
        match self {
            DoExpr::Pure(_) => ExprTag::Pure,
            DoExpr::Effect(_) => ExprTag::Effect,
            DoExpr::Perform(_) => ExprTag::Perform,
            DoExpr::Map(..) => ExprTag::Map,
            DoExpr::FlatMap(..) => ExprTag::FlatMap,
            DoExpr::HostStream(_) => ExprTag::HostStream,
            DoExpr::Apply(..) => ExprTag::Apply,
            DoExpr::Safe(_) => ExprTag::Safe,
            DoExpr::Ctrl(ctrl) => ctrl.tag(),
        }
    }

    pub fn pure(value: Value) -> Self {
        DoExpr::Pure(value)
    }

    pub fn perform(effect: Value) -> Self {
        DoExpr::Perform(Box::new(DoExpr::Effect(effect)))
    }

    pub fn map(self, f: Arc<dyn PureFn>) -> Self {
        DoExpr::Map(Box::new(self), f)
    }

    pub fn flat_map(self, f: Arc<dyn BindFn>) -> Self {
        DoExpr::FlatMap(Box::new(self), f)
    }

    pub fn then(self, next: DoExpr) -> Self {
        self.flat_map(bind_fn(move |_| Ok(next.clone())))
    }

    pub fn with_handler(handler: HandlerEntry, body: DoExpr) -> Self {
        DoExpr::Ctrl(Box::new(DoCtrl::WithHandler(handler, Box::new(body))))
    }

    pub fn mask_behind(identity: crate::handler::Identity, body: DoExpr) -> Self {
        DoExpr::Ctrl(Box::new(DoCtrl::MaskBehind(identity, Box::new(body))))
    }

    pub fn resume(k: ContinuationHandle, value: Value) -> Self {
        DoExpr::Ctrl(Box::new(DoCtrl::Resume(k, value)))
    }

    pub fn transfer(k: ContinuationHandle, value: Value) -> Self {
        DoExpr::Ctrl(Box::new(DoCtrl::Transfer(k, value)))
    }

    pub fn delegate() -> Self {
        DoExpr::Ctrl(Box::new(DoCtrl::Delegate))
    }

    pub fn pass() -> Self {
        DoExpr::Ctrl(Box::new(DoCtrl::Pass))
    }

    pub fn get_continuation() -> Self {
        DoExpr::Ctrl(Box::new(DoCtrl::GetContinuation))
    }

    pub fn get_handlers() -> Self {
        DoExpr::Ctrl(Box::new(DoCtrl::GetHandlers))
    }

    pub fn get_call_stack() -> Self {
        DoExpr::Ctrl(Box::new(DoCtrl::GetCallStack))
    }

    pub fn get_traceback(k: ContinuationHandle) -> Self {
        DoExpr::Ctrl(Box::new(DoCtrl::GetTraceback(k)))
    }

    pub fn safe(self) -> Self {
        DoExpr::Safe(Box::new(self))
    }

    /// Validate that a boundary-crossing value really is a `DoExpr`.
    ///
    /// Native Rust construction is always well-typed; this exists for the
    /// single place a raw host value crosses into the IR (`host::from_host_value`,
    /// the `run`/`async_run` top-level argument, and handler return values).
    pub fn require(self) -> Result<DoExpr, VmError> {
        Ok(self)
    }
}

impl DoCtrl {
    pub fn tag(&self) -> ExprTag {
        match self {
            DoCtrl::WithHandler(..) => ExprTag::WithHandler,
            DoCtrl::Resume(..) => ExprTag::Resume,
            DoCtrl::Transfer(..) => ExprTag::Transfer,
            DoCtrl::Delegate => ExprTag::Delegate,
            DoCtrl::Pass => ExprTag::Pass,
            DoCtrl::GetContinuation => ExprTag::GetContinuation,
            DoCtrl::GetHandlers => ExprTag::GetHandlers,
            DoCtrl::GetCallStack => ExprTag::GetCallStack,
            DoCtrl::GetTraceback(_) => ExprTag::GetTraceback,
            DoCtrl::MaskBehind(..) => ExprTag::MaskBehind,
        }
    }
}

/// Classify a `DoExpr` into its structural tag. Never touches the host lock.
pub fn classify(expr: &DoExpr) -> ExprTag {
    expr.tag()
}
