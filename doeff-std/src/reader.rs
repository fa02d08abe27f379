//! `Ask`/`Local`, the Reader effect family. Re-exports `doeff-core`'s
//! native reader handler and constructors; `env` for the outermost scope is
//! supplied to `doeff_core::run` directly, not installed here.

pub use doeff_core::native::reader::{ask, ask_or, local};
