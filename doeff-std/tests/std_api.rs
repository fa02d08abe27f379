//! The ergonomic wrappers `doeff-std` adds on top of `doeff_core::native`.

use doeff_std::result::{err_message, is_ok, ok_value, safe};
use doeff_std::state::{get, modify, put};
use doeff_std::{scheduler_handlers, Bindings, DoExpr, Value};

#[test]
fn modify_wrapper_accepts_a_plain_closure() {
    let program = put("n", Value::Int(3)).then(modify("n", |v| Value::Int(v.as_int().unwrap_or(0) + 10)).then(get("n")));
    let result = doeff_core::run(program, Vec::new(), Bindings::new(), Bindings::new());
    assert_eq!(result.value, Some(Value::Int(13)));
}

#[test]
fn safe_reports_ok_for_a_successful_program() {
    let program = safe(DoExpr::pure(Value::Int(1)));
    let result = doeff_core::run(program, Vec::new(), Bindings::new(), Bindings::new());
    let value = result.value.unwrap();
    assert_eq!(is_ok(&value), Some(true));
    assert_eq!(ok_value(&value), Some(Value::Int(1)));
}

#[test]
fn safe_reports_err_for_an_unhandled_effect() {
    let program = safe(DoExpr::perform(Value::record("Nope", Bindings::new())));
    let result = doeff_core::run(program, Vec::new(), Bindings::new(), Bindings::new());
    let value = result.value.unwrap();
    assert_eq!(is_ok(&value), Some(false));
    assert!(err_message(&value).is_some());
}

#[test]
fn scheduler_handlers_returns_exactly_one_handler() {
    assert_eq!(scheduler_handlers().len(), 1);
}
