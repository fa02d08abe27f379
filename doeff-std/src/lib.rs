//! Native effect families shipped as part of the core distribution:
//! Reader, State, Writer, Result/`Safe`, and the scheduler
//! surface. Thin ergonomic layer over [`doeff_core::native`] — every
//! constructor here just builds the `DoExpr`/`HandlerEntry` values
//! `doeff-core` already knows how to run, without reimplementing any of
//! its machinery.

pub mod reader;
pub mod result;
pub mod scheduler;
pub mod state;
pub mod writer;

pub use doeff_core::ir::DoExpr;
pub use doeff_core::value::{Bindings, Value};

/// A program's entire handler chain. Reader
/// and State are installed by `doeff_core::run` itself from `env`/`store`,
/// so the only sentinel an embedder typically adds explicitly is the
/// scheduler (needed only by programs that actually `Spawn`).
pub fn scheduler_handlers() -> Vec<doeff_core::HandlerEntry> {
    vec![scheduler::scheduler_handler()]
}
