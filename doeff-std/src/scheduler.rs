//! `Spawn`/`Wait`/`Gather`/`Race`/`CreateExternalPromise`, the Scheduler
//! effect family.

pub use doeff_core::native::scheduler::{
    create_external_promise, downcast_completer, gather, race, scheduler_handler, spawn, wait, PromiseCompleter,
};
