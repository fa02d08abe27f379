//! Writer effect family: `Log`/`Tell` append to an accumulator
//! installed by the nearest enclosing handler. `Listen` is sugar over
//! `WithHandler` with a fresh accumulator, mirroring how `doeff-std` builds
//! `Local` as sugar over the reader handler rather than a primitive of its
//! own.

use crate::handler::{HandlerEntry, NativeOutcome};
use crate::ir::{bind_fn, DoExpr};
use crate::value::Value;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Clone)]
pub struct WriterLog(Arc<Mutex<Vec<Value>>>);

impl WriterLog {
    pub fn drain(&self) -> Vec<Value> {
        std::mem::take(&mut self.0.lock())
    }

    pub fn snapshot(&self) -> Vec<Value> {
        self.0.lock().clone()
    }
}

pub fn tell_handler() -> (HandlerEntry, WriterLog) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let out_log = WriterLog(log.clone());
    let entry = HandlerEntry::native(
        "doeff.writer.tell",
        |effect| matches!(effect.record_tag(), Some("Log") | Some("Tell")),
        move |_vm, effect, k| {
            match effect.record_tag() {
                Some("Log") => {
                    let msg = effect.field("message").cloned().unwrap_or(Value::Unit);
                    log.lock().push(msg);
                }
                Some("Tell") => {
                    let items = effect.field("items").cloned().unwrap_or(Value::Unit);
                    match items {
                        Value::List(items) => log.lock().extend(items.iter().cloned()),
                        other => log.lock().push(other),
                    }
                }
                _ => unreachable!("can_handle only admits Log/Tell"),
            }
            Ok(NativeOutcome::Step(DoExpr::resume(k, Value::Unit)))
        },
    );
    (entry, out_log)
}

pub fn log(message: Value) -> DoExpr {
    let mut fields = indexmap::IndexMap::new();
    fields.insert("message".to_string(), message);
    DoExpr::perform(Value::record("Log", fields))
}

pub fn tell(items: Vec<Value>) -> DoExpr {
    let mut fields = indexmap::IndexMap::new();
    fields.insert("items".to_string(), Value::List(Arc::new(items)));
    DoExpr::perform(Value::record("Tell", fields))
}

/// Run `body` under a fresh accumulator and pair its result with everything
/// it told, as `Record("Listened", {value, log})`.
pub fn listen(body: DoExpr) -> DoExpr {
    let (handler, log) = tell_handler();
    DoExpr::with_handler(
        handler,
        body.flat_map(bind_fn(move |value| {
            let mut fields = indexmap::IndexMap::new();
            fields.insert("value".to_string(), value);
            fields.insert("log".to_string(), Value::List(Arc::new(log.drain())));
            Ok(DoExpr::pure(Value::record("Listened", fields)))
        })),
    )
}
