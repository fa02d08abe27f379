//! Reader effect family: `Ask(key, default?)` reads a keyed
//! binding from the nearest enclosing handler's environment, falling
//! through to the next-outer reader handler (via `Delegate`) when the key
//! is absent and no default was given. `Local(map, expr)` is sugar over
//! `WithHandler` with a fresh handler carrying the overridden bindings —
//! ordinary handler-stack shadowing already gives it the right lexical
//! scoping, so it needs no primitive of its own.

use crate::handler::{HandlerEntry, NativeOutcome};
use crate::ir::DoExpr;
use crate::value::{Bindings, Value};
use std::sync::Arc;

pub fn ask_handler(bindings: Bindings) -> HandlerEntry {
    HandlerEntry::native(
        "doeff.reader.ask",
        |effect| effect.record_tag() == Some("Ask"),
        move |_vm, effect, k| {
            let key = effect.field("key").and_then(Value::as_str).unwrap_or_default();
            if let Some(value) = bindings.get(key) {
                return Ok(NativeOutcome::Step(DoExpr::resume(k, value.clone())));
            }
            if let Some(default) = effect.field("default") {
                return Ok(NativeOutcome::Step(DoExpr::resume(k, default.clone())));
            }
            Ok(NativeOutcome::Step(DoExpr::delegate()))
        },
    )
}

pub fn ask(key: impl Into<Arc<str>>) -> DoExpr {
    let mut fields = indexmap::IndexMap::new();
    fields.insert("key".to_string(), Value::Str(key.into()));
    DoExpr::perform(Value::record("Ask", fields))
}

pub fn ask_or(key: impl Into<Arc<str>>, default: Value) -> DoExpr {
    let mut fields = indexmap::IndexMap::new();
    fields.insert("key".to_string(), Value::Str(key.into()));
    fields.insert("default".to_string(), default);
    DoExpr::perform(Value::record("Ask", fields))
}

pub fn local(overrides: Bindings, body: DoExpr) -> DoExpr {
    DoExpr::with_handler(ask_handler(overrides), body)
}
