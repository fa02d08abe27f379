//! The dynamic value type effect payloads, store entries, and results are
//! built from.
//!
//! The VM treats `Value::Host` payloads as opaque — effect payloads are
//! opaque to the VM; everything else is a small closed set of
//! host-language-agnostic primitives so the native Reader/State/Writer
//! effects in `doeff-std` have something concrete to store and compare.

use crate::continuation::ContinuationHandle;
use crate::ids::{PromiseId, TaskId};
use crate::ir::{DoExpr, PureFn};
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;

/// A host-owned object the VM must never introspect, only pass around.
///
/// Handler callables, user generators, and effect payloads defined entirely
/// on the host side are wrapped in this so `classify`/dispatch never needs
/// to know what is inside.
pub trait HostObject: fmt::Debug + Send + Sync {
    fn type_name(&self) -> &str;

    /// Lets a native handler recover its own concrete type back out of a
    /// `Value::Host` it stashed earlier (e.g. an external-promise completer
    /// handed to the host and never touched by the VM in between).
    fn as_any(&self) -> &dyn std::any::Any;
}

#[derive(Debug, Clone)]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    List(Arc<Vec<Value>>),
    Map(Arc<IndexMap<String, Value>>),
    Continuation(ContinuationHandle),
    Task(TaskId),
    Promise(PromiseId),
    /// A tagged, opaque record: effect payloads from `doeff-std` and from
    /// host embedders alike are represented this way so `can_handle` can
    /// dispatch on `tag` without knowing the field layout.
    Record {
        tag: Arc<str>,
        fields: Arc<IndexMap<String, Value>>,
    },
    Host(Arc<dyn HostObject>),
    /// A first-class program value, boxed. Exists only so `Spawn`'s effect
    /// payload can carry the `DoExpr` for the task root through the same
    /// opaque-`Value` channel every other effect uses; nothing else in the
    /// VM inspects it.
    Expr(Arc<DoExpr>),
    /// A reified pure transform, carried as a value so `Modify`'s effect
    /// payload can hand its function to the state handler the same way
    /// every other effect payload is opaque data, not a host closure.
    Fn(Arc<dyn PureFn>),
}

/// Structural equality for the comparable variants; `Host`/`Expr`/`Fn`
/// compare by pointer identity since what they wrap can't implement
/// `PartialEq` itself (same reasoning as [`crate::handler::Identity`]'s
/// manual impl for its own opaque `Host` variant).
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Unit, Value::Unit) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Continuation(a), Value::Continuation(b)) => a == b,
            (Value::Task(a), Value::Task(b)) => a == b,
            (Value::Promise(a), Value::Promise(b)) => a == b,
            (
                Value::Record { tag: t1, fields: f1 },
                Value::Record { tag: t2, fields: f2 },
            ) => t1 == t2 && f1 == f2,
            (Value::Host(a), Value::Host(b)) => Arc::ptr_eq(a, b),
            (Value::Expr(a), Value::Expr(b)) => Arc::ptr_eq(a, b),
            (Value::Fn(a), Value::Fn(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Value {
    pub fn str(s: impl Into<Arc<str>>) -> Self {
        Value::Str(s.into())
    }

    pub fn record(tag: impl Into<Arc<str>>, fields: IndexMap<String, Value>) -> Self {
        Value::Record {
            tag: tag.into(),
            fields: Arc::new(fields),
        }
    }

    /// The record tag, if this value is a `Record`. Used by native handlers'
    /// `can_handle` to dispatch without a full pattern match.
    pub fn record_tag(&self) -> Option<&str> {
        match self {
            Value::Record { tag, .. } => Some(tag.as_ref()),
            _ => None,
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Record { fields, .. } => fields.get(name),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_ref()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn unit() -> Self {
        Value::Unit
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unit => write!(f, "()"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Map(map) => write!(f, "{{{} entries}}", map.len()),
            Value::Continuation(k) => write!(f, "<continuation {:?}>", k.id()),
            Value::Task(t) => write!(f, "<task {t:?}>"),
            Value::Promise(p) => write!(f, "<promise {p:?}>"),
            Value::Record { tag, .. } => write!(f, "{tag}{{..}}"),
            Value::Host(obj) => write!(f, "<host {}>", obj.type_name()),
            Value::Expr(_) => write!(f, "<expr>"),
            Value::Fn(_) => write!(f, "<fn>"),
        }
    }
}

/// A store or environment mapping, as passed into `run`/`async_run`.
pub type Bindings = IndexMap<String, Value>;
