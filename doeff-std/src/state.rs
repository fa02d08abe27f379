//! `Get`/`Put`/`Modify`, the State effect family, operating on the `store`
//! mapping `doeff_core::run` seeds the VM with.

use doeff_core::ir::pure_fn;
use doeff_core::value::Value;

pub use doeff_core::native::state::{get, put};

/// `f` receives the current value at `key` and must return the new one.
/// `Modify` resumes the caller with the *old* value.
pub fn modify(key: impl Into<std::sync::Arc<str>>, f: impl Fn(Value) -> Value + Send + Sync + 'static) -> doeff_core::DoExpr {
    doeff_core::native::state::modify(key, pure_fn(move |v| Ok(f(v))))
}
