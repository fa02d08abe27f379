//! `Safe(expr)`, the Result family: catches any catchable `VmError`
//! raised anywhere in `expr`'s dynamic extent, delivering `Record("Ok",
//! {value})` or `Record("Err", {message})` instead of failing the run.
//! Implemented directly in the step machine (`doeff_core::ir::DoExpr::Safe`,
//! `doeff_core::step::Vm::unwind_or_fail`) since nothing else in the core
//! AST unwinds on error; this module is just the ergonomic surface.

use doeff_core::value::Value;
use doeff_core::DoExpr;

pub fn safe(expr: DoExpr) -> DoExpr {
    expr.safe()
}

/// `true` for `Record("Ok", ..)`, `false` for `Record("Err", ..)`, `None`
/// for anything else (i.e. the value did not come from a `Safe` boundary).
pub fn is_ok(value: &Value) -> Option<bool> {
    match value.record_tag() {
        Some("Ok") => Some(true),
        Some("Err") => Some(false),
        _ => None,
    }
}

pub fn ok_value(value: &Value) -> Option<Value> {
    match value.record_tag() {
        Some("Ok") => value.field("value").cloned(),
        _ => None,
    }
}

pub fn err_message(value: &Value) -> Option<&str> {
    match value.record_tag() {
        Some("Err") => value.field("message").and_then(Value::as_str),
        _ => None,
    }
}
