//! Handler entries installed by `WithHandler`.
//!
//! A handler is either `Native` — implemented directly in the runtime and
//! given full access to VM state so it can bypass the host boundary
//! entirely — or `Host`, a user-provided object satisfying the
//! [`crate::host::HostHandler`] protocol and invoked only through it.

use crate::continuation::ContinuationHandle;
use crate::error::VmError;
use crate::host::HostHandler;
use crate::ir::DoExpr;
use crate::value::{HostObject, Value};
use crate::vm::Vm;
use std::fmt;
use std::sync::Arc;

/// A handler's identity, preserved verbatim through `GetHandlers` rather
/// than replaced with a placeholder string.
#[derive(Debug, Clone)]
pub enum Identity {
    Native(&'static str),
    Host(Arc<dyn HostObject>),
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Identity::Native(a), Identity::Native(b)) => a == b,
            (Identity::Host(a), Identity::Host(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for Identity {}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Native(name) => write!(f, "native:{name}"),
            Identity::Host(obj) => write!(f, "host:{}", obj.type_name()),
        }
    }
}

/// What a native handler's `start`/`delegate` phase produced.
///
/// Most native handlers (reader, state, writer, result) always return
/// `Step`. Only scheduler-aware handlers use `Suspend`: the handler has
/// already stashed the passed-in continuation somewhere it will be replayed
/// from later (a scheduler waiter table, a promise registration), and the
/// step machine should stop driving this task rather than push a handler
/// body frame that has nothing to evaluate yet.
#[derive(Debug, Clone)]
pub enum NativeOutcome {
    Step(DoExpr),
    Suspend,
}

/// Body of a native handler's `start` phase. Runs with direct `&mut Vm`
/// access and never takes the host lock.
pub type NativeStart =
    Arc<dyn Fn(&mut Vm, Value, ContinuationHandle) -> Result<NativeOutcome, VmError> + Send + Sync>;

#[derive(Clone)]
pub struct NativeHandler {
    pub name: &'static str,
    pub can_handle: Arc<dyn Fn(&Value) -> bool + Send + Sync>,
    pub start: NativeStart,
}

impl fmt::Debug for NativeHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeHandler").field("name", &self.name).finish()
    }
}

#[derive(Debug, Clone)]
pub enum HandlerKind {
    Native(NativeHandler),
    Host(Arc<dyn HostHandler>),
}

/// A handler as installed by `WithHandler`. One `HandlerEntry` per
/// `WithHandler` scope.
#[derive(Debug, Clone)]
pub struct HandlerEntry {
    pub identity: Identity,
    pub kind: HandlerKind,
}

impl HandlerEntry {
    pub fn native(
        name: &'static str,
        can_handle: impl Fn(&Value) -> bool + Send + Sync + 'static,
        start: impl Fn(&mut Vm, Value, ContinuationHandle) -> Result<NativeOutcome, VmError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            identity: Identity::Native(name),
            kind: HandlerKind::Native(NativeHandler {
                name,
                can_handle: Arc::new(can_handle),
                start: Arc::new(start),
            }),
        }
    }

    pub fn host(handler: Arc<dyn HostHandler>) -> Self {
        Self {
            identity: handler.identity(),
            kind: HandlerKind::Host(handler),
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self.kind, HandlerKind::Native(_))
    }

    /// Total, side-effect-free test. Native handlers never need the host lock for
    /// this; host handlers are called with it held by the caller.
    pub fn can_handle(&self, effect: &Value) -> Result<bool, VmError> {
        match &self.kind {
            HandlerKind::Native(native) => Ok((native.can_handle)(effect)),
            HandlerKind::Host(host) => host.can_handle(effect),
        }
    }
}

impl Identity {
    /// Reify as a `Value` for `GetHandlers`.
    pub fn to_value(&self) -> Value {
        match self {
            Identity::Native(name) => {
                let mut fields = indexmap::IndexMap::new();
                fields.insert("name".to_string(), Value::str(*name));
                Value::record("NativeHandler", fields)
            }
            Identity::Host(obj) => Value::Host(obj.clone()),
        }
    }
}
