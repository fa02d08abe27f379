//! State effect family: `Get`/`Put`/`Modify` operate on the
//! VM's `store`, the in-memory mapping `run`/`async_run` seed from their
//! `store` argument. `AtomicGet`/
//! `AtomicUpdate` are the same operations under different names — every
//! native handler call already runs to completion without interleaving
//! another task, so there is nothing further to make atomic here.

use crate::handler::{HandlerEntry, NativeOutcome};
use crate::ir::DoExpr;
use crate::value::Value;
use std::sync::Arc;

fn key_of(effect: &Value) -> Result<&str, crate::error::VmError> {
    effect
        .field("key")
        .and_then(Value::as_str)
        .ok_or_else(|| crate::error::VmError::internal("state: missing key"))
}

pub fn state_handler() -> HandlerEntry {
    HandlerEntry::native(
        "doeff.state",
        |effect| {
            matches!(
                effect.record_tag(),
                Some("Get") | Some("Put") | Some("Modify") | Some("AtomicGet") | Some("AtomicUpdate")
            )
        },
        |vm, effect, k| match effect.record_tag() {
            Some("Get") | Some("AtomicGet") => {
                let key = key_of(&effect)?;
                let value = vm.store.get(key).cloned().unwrap_or(Value::Unit);
                Ok(NativeOutcome::Step(DoExpr::resume(k, value)))
            }
            Some("Put") => {
                let key = key_of(&effect)?.to_string();
                let value = effect.field("value").cloned().unwrap_or(Value::Unit);
                vm.store.insert(key, value);
                Ok(NativeOutcome::Step(DoExpr::resume(k, Value::Unit)))
            }
            Some("Modify") | Some("AtomicUpdate") => {
                let key = key_of(&effect)?.to_string();
                let Some(Value::Fn(f)) = effect.field("f").cloned() else {
                    return Err(crate::error::VmError::internal("Modify: missing function payload"));
                };
                let old = vm.store.get(&key).cloned().unwrap_or(Value::Unit);
                let new = f.call(old.clone())?;
                vm.store.insert(key, new);
                // Modify resumes the caller with the *old* value.
                Ok(NativeOutcome::Step(DoExpr::resume(k, old)))
            }
            _ => Err(crate::error::VmError::internal("state: unrecognized effect")),
        },
    )
}

fn keyed(key: impl Into<Arc<str>>) -> indexmap::IndexMap<String, Value> {
    let mut fields = indexmap::IndexMap::new();
    fields.insert("key".to_string(), Value::Str(key.into()));
    fields
}

pub fn get(key: impl Into<Arc<str>>) -> DoExpr {
    DoExpr::perform(Value::record("Get", keyed(key)))
}

pub fn put(key: impl Into<Arc<str>>, value: Value) -> DoExpr {
    let mut fields = keyed(key);
    fields.insert("value".to_string(), value);
    DoExpr::perform(Value::record("Put", fields))
}

pub fn modify(key: impl Into<Arc<str>>, f: Arc<dyn crate::ir::PureFn>) -> DoExpr {
    let mut fields = keyed(key);
    fields.insert("f".to_string(), Value::Fn(f));
    DoExpr::perform(Value::record("Modify", fields))
}
