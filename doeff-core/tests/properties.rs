//! End-to-end properties of `run`/`async_run` over the native effect
//! families in `doeff_core::native`.

use doeff_core::continuation::{CallMetadata, Continuation, ContinuationRegistry};
use doeff_core::handler::{HandlerEntry, Identity, NativeOutcome};
use doeff_core::ir::{bind_fn, pure_fn};
use doeff_core::native::{reader, scheduler as native_scheduler, state, writer};
use doeff_core::value::Value;
use doeff_core::{run, Bindings, DoExpr};
use indexmap::IndexMap;
use proptest::prelude::*;
use std::sync::Arc;

fn env(pairs: &[(&str, Value)]) -> Bindings {
    let mut b = Bindings::new();
    for (k, v) in pairs {
        b.insert((*k).to_string(), v.clone());
    }
    b
}

#[test]
fn state_counter_increments_via_get_put() {
    let program = state::get("count").flat_map(bind_fn(|v| {
        let n = v.as_int().unwrap_or(0);
        Ok(state::put("count", Value::Int(n + 1)))
    }));
    let store = env(&[("count", Value::Int(41))]);
    let result = run(program, Vec::new(), Bindings::new(), store);
    assert!(result.is_ok());
    assert_eq!(result.raw_store.get("count"), Some(&Value::Int(42)));
}

#[test]
fn state_modify_resumes_with_old_value() {
    let program = state::modify("n", pure_fn(|v| Ok(Value::Int(v.as_int().unwrap_or(0) * 2))));
    let store = env(&[("n", Value::Int(10))]);
    let result = run(program, Vec::new(), Bindings::new(), store);
    assert_eq!(result.value, Some(Value::Int(10)), "Modify must resume with the pre-update value");
    assert_eq!(result.raw_store.get("n"), Some(&Value::Int(20)));
}

#[test]
fn ask_returns_env_binding() {
    let program = reader::ask("name");
    let env = env(&[("name", Value::str("alice"))]);
    let result = run(program, Vec::new(), env, Bindings::new());
    assert_eq!(result.value, Some(Value::str("alice")));
}

#[test]
fn ask_or_falls_back_to_default_when_key_absent() {
    let program = reader::ask_or("missing", Value::Int(7));
    let result = run(program, Vec::new(), Bindings::new(), Bindings::new());
    assert_eq!(result.value, Some(Value::Int(7)));
}

#[test]
fn local_overrides_are_scoped_to_their_body() {
    let inner = reader::local(env(&[("x", Value::Int(2))]), reader::ask("x"));
    let program = inner.flat_map(bind_fn(|inner_x| {
        Ok(reader::ask_or("x", Value::Unit).flat_map(bind_fn(move |outer_x| {
            let mut fields = IndexMap::new();
            fields.insert("inner".to_string(), inner_x.clone());
            fields.insert("outer".to_string(), outer_x);
            Ok(DoExpr::pure(Value::record("Pair", fields)))
        })))
    }));
    let outer_env = env(&[("x", Value::Int(1))]);
    let result = run(program, Vec::new(), outer_env, Bindings::new());
    let value = result.value.expect("program should complete");
    assert_eq!(value.field("inner"), Some(&Value::Int(2)));
    assert_eq!(value.field("outer"), Some(&Value::Int(1)));
}

#[test]
fn listen_pairs_a_value_with_everything_told_inside_it() {
    let body = writer::log(Value::str("first")).then(writer::tell(vec![Value::str("second"), Value::str("third")]).then(DoExpr::pure(Value::Int(99))));
    let program = writer::listen(body);
    let result = run(program, Vec::new(), Bindings::new(), Bindings::new());
    let value = result.value.expect("listen should complete");
    assert_eq!(value.record_tag(), Some("Listened"));
    assert_eq!(value.field("value"), Some(&Value::Int(99)));
    let Some(Value::List(log)) = value.field("log") else {
        panic!("expected a log list");
    };
    assert_eq!(log.len(), 3);
}

#[test]
fn safe_catches_an_unhandled_effect_as_a_record() {
    let program = DoExpr::perform(Value::record("Nonexistent", IndexMap::new())).safe();
    let result = run(program, Vec::new(), Bindings::new(), Bindings::new());
    let value = result.value.expect("Safe should absorb the error, not fail the run");
    assert_eq!(value.record_tag(), Some("Err"));
}

#[test]
fn safe_passes_through_a_successful_value_as_ok() {
    let program = DoExpr::pure(Value::Int(5)).safe();
    let result = run(program, Vec::new(), Bindings::new(), Bindings::new());
    let value = result.value.unwrap();
    assert_eq!(value.record_tag(), Some("Ok"));
    assert_eq!(value.field("value"), Some(&Value::Int(5)));
}

#[test]
fn unhandled_effect_outside_any_safe_boundary_fails_the_run() {
    let program = DoExpr::perform(Value::record("Nonexistent", IndexMap::new()));
    let result = run(program, Vec::new(), Bindings::new(), Bindings::new());
    assert!(!result.is_ok());
    assert!(matches!(result.error, Some(doeff_core::VmError::UnhandledEffect { .. })));
}

#[test]
fn bare_effect_at_top_level_is_rejected() {
    let result = run(DoExpr::Effect(Value::Unit), Vec::new(), Bindings::new(), Bindings::new());
    assert!(!result.is_ok());
}

#[test]
fn spawn_and_wait_returns_the_childs_value() {
    let child = DoExpr::pure(Value::Int(7));
    let program = native_scheduler::spawn(child).flat_map(bind_fn(|t| {
        let Value::Task(id) = t else { unreachable!() };
        Ok(native_scheduler::wait(id))
    }));
    let result = run(program, vec![native_scheduler::scheduler_handler()], Bindings::new(), Bindings::new());
    assert_eq!(result.value, Some(Value::Int(7)));
}

#[test]
fn gather_collects_results_in_spawn_order() {
    let mut program = DoExpr::pure(Value::List(std::sync::Arc::new(Vec::new())));
    for n in [1i64, 2, 3] {
        program = program.flat_map(bind_fn(move |acc| {
            let Value::List(tasks) = acc else { unreachable!() };
            let tasks = (*tasks).clone();
            Ok(native_scheduler::spawn(DoExpr::pure(Value::Int(n))).flat_map(bind_fn(move |t| {
                let mut next = tasks.clone();
                next.push(t);
                Ok(DoExpr::pure(Value::List(std::sync::Arc::new(next))))
            })))
        }));
    }
    program = program.flat_map(bind_fn(|acc| {
        let Value::List(tasks) = acc else { unreachable!() };
        let ids = tasks
            .iter()
            .map(|t| match t {
                Value::Task(id) => *id,
                _ => unreachable!(),
            })
            .collect();
        Ok(native_scheduler::gather(ids))
    }));
    let result = run(program, vec![native_scheduler::scheduler_handler()], Bindings::new(), Bindings::new());
    let Some(Value::List(values)) = result.value else {
        panic!("gather should produce a list");
    };
    assert_eq!(*values, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
}

const MASK_NAMES: [&str; 4] = ["mask0", "mask1", "mask2", "mask3"];
const MASK_TAGS: [&str; 4] = ["MaskTag0", "MaskTag1", "MaskTag2", "MaskTag3"];

fn mask_handler(idx: usize) -> HandlerEntry {
    let tag = MASK_TAGS[idx];
    HandlerEntry::native(
        MASK_NAMES[idx],
        move |effect| effect.record_tag() == Some(tag),
        move |_vm, _effect, k| Ok(NativeOutcome::Step(DoExpr::resume(k, Value::Int(idx as i64)))),
    )
}

const GET_HANDLERS_NAMES: [&str; 4] = ["ghA", "ghB", "ghC", "ghD"];

fn inert_handler(name: &'static str) -> HandlerEntry {
    HandlerEntry::native(name, |_effect| false, |_vm, effect, k| Ok(NativeOutcome::Step(DoExpr::resume(k, effect))))
}

proptest! {
    /// A continuation can be resumed exactly once, no matter how many times
    /// `take` is attempted against the same handle.
    #[test]
    fn prop_continuation_take_succeeds_exactly_once(attempts in 1usize..8) {
        let registry = ContinuationRegistry::new();
        let k = Continuation::new(0, Arc::new(Vec::new()), Arc::new(Vec::new()), None, Vec::new(), CallMetadata::default(), None);
        let handle = registry.register(k);
        let successes = (0..attempts).filter(|_| registry.take(handle).is_ok()).count();
        prop_assert_eq!(successes, 1);
    }

    /// `MaskBehind` removes exactly the named handler from the visible
    /// chain for its body, so an effect only that handler claims goes
    /// unhandled no matter which position in the chain it occupies.
    #[test]
    fn prop_masking_a_handler_makes_its_own_effect_unhandled(
        (n, mask_idx) in (1usize..=4).prop_flat_map(|n| (Just(n), 0..n))
    ) {
        let handlers: Vec<HandlerEntry> = (0..n).map(mask_handler).collect();
        let masked_identity = Identity::Native(MASK_NAMES[mask_idx]);
        let effect = Value::record(MASK_TAGS[mask_idx], IndexMap::new());
        let program = DoExpr::mask_behind(masked_identity, DoExpr::perform(effect));
        let result = run(program, handlers, Bindings::new(), Bindings::new());
        prop_assert!(!result.is_ok());
        let is_unhandled = matches!(result.error, Some(doeff_core::VmError::UnhandledEffect { .. }));
        prop_assert!(is_unhandled);
    }

    /// Delegating a `Perform` outward must not drop whatever computation was
    /// chained onto it: the outer handler's resume value still has to flow
    /// through the inner handler's trailing `flat_map`.
    #[test]
    fn prop_delegate_runs_the_trailing_computation_after_the_outer_resume(base in -1000i64..1000, inc in -1000i64..1000) {
        let inner = HandlerEntry::native(
            "delegating",
            |effect| effect.record_tag() == Some("Delegated"),
            |_vm, _effect, _k| Ok(NativeOutcome::Step(DoExpr::delegate())),
        );
        let outer = HandlerEntry::native(
            "resuming",
            |effect| effect.record_tag() == Some("Delegated"),
            move |_vm, _effect, k| Ok(NativeOutcome::Step(DoExpr::resume(k, Value::Int(base)))),
        );
        let program = DoExpr::perform(Value::record("Delegated", IndexMap::new()))
            .flat_map(bind_fn(move |v| Ok(DoExpr::pure(Value::Int(v.as_int().unwrap() + inc)))));
        let result = run(program, vec![outer, inner], Bindings::new(), Bindings::new());
        prop_assert_eq!(result.value, Some(Value::Int(base + inc)));
    }

    /// `GetHandlers` lists every installed handler innermost first, in the
    /// reverse of the order they were passed to `run`.
    #[test]
    fn prop_get_handlers_lists_installed_handlers_innermost_first(n in 1usize..=4) {
        let names = &GET_HANDLERS_NAMES[..n];
        let handlers: Vec<HandlerEntry> = names.iter().map(|name| inert_handler(*name)).collect();
        let result = run(DoExpr::get_handlers(), handlers, Bindings::new(), Bindings::new());
        let Some(Value::List(list)) = result.value else {
            panic!("GetHandlers should produce a list");
        };
        let seen: Vec<&str> = list
            .iter()
            .filter(|v| v.record_tag() == Some("NativeHandler"))
            .filter_map(|v| v.field("name").and_then(Value::as_str))
            .filter(|name| names.contains(name))
            .collect();
        let expected: Vec<&str> = names.iter().rev().copied().collect();
        prop_assert_eq!(seen, expected);
    }

    /// `Race` over tasks that are all already complete by the time the
    /// waiters are settled picks the first completed task in the order the
    /// caller listed them, deterministically.
    #[test]
    fn prop_race_of_already_complete_tasks_picks_first_in_order(values in prop::collection::vec(-1000i64..1000, 2..6)) {
        let first = values[0];
        let mut program = DoExpr::pure(Value::List(Arc::new(Vec::new())));
        for v in values {
            program = program.flat_map(bind_fn(move |acc| {
                let Value::List(tasks) = acc else { unreachable!() };
                let tasks = (*tasks).clone();
                Ok(native_scheduler::spawn(DoExpr::pure(Value::Int(v))).flat_map(bind_fn(move |t| {
                    let mut next = tasks.clone();
                    next.push(t);
                    Ok(DoExpr::pure(Value::List(Arc::new(next))))
                })))
            }));
        }
        program = program.flat_map(bind_fn(|acc| {
            let Value::List(tasks) = acc else { unreachable!() };
            let ids = tasks
                .iter()
                .map(|t| match t {
                    Value::Task(id) => *id,
                    _ => unreachable!(),
                })
                .collect();
            Ok(native_scheduler::race(ids))
        }));
        let result = run(program, vec![native_scheduler::scheduler_handler()], Bindings::new(), Bindings::new());
        let Some(Value::List(pair)) = result.value else {
            panic!("race should produce [index, value]");
        };
        prop_assert_eq!(pair[0].clone(), Value::Int(0));
        prop_assert_eq!(pair[1].clone(), Value::Int(first));
    }
}

#[test]
fn external_promise_resolves_every_registered_waiter_exactly_once() {
    use doeff_core::ids::TaskId;
    use doeff_core::scheduler::Scheduler;

    let mut scheduler = Scheduler::new();
    let registry = ContinuationRegistry::new();
    let promise = scheduler.create_promise();
    let completer = scheduler.completer();

    let waiters: Vec<TaskId> = (0..3)
        .map(|_| {
            let k = Continuation::new(0, Arc::new(Vec::new()), Arc::new(Vec::new()), None, Vec::new(), CallMetadata::default(), None);
            let handle = registry.register(k);
            let owner = scheduler.spawn(handle);
            let waiter_k = registry.register(Continuation::new(
                0,
                Arc::new(Vec::new()),
                Arc::new(Vec::new()),
                None,
                Vec::new(),
                CallMetadata::default(),
                None,
            ));
            scheduler.register_promise_wait(owner, waiter_k, promise);
            owner
        })
        .collect();

    completer.resolve(promise, Value::Int(42));
    scheduler.drain_external_completions();

    for owner in &waiters {
        let (_, result) = scheduler
            .take_pending_resume(*owner)
            .expect("each waiter on a resolved promise should be scheduled for resumption");
        assert_eq!(result.unwrap(), Value::Int(42));
    }

    // Draining again after every waiter already moved to pending_resume must
    // not resolve anything a second time.
    scheduler.drain_external_completions();
    for owner in &waiters {
        assert!(scheduler.take_pending_resume(*owner).is_none());
    }
}
