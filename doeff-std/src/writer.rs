//! `Log`/`Tell`/`Listen`, the Writer effect family.

pub use doeff_core::native::writer::{listen, log, tell};
