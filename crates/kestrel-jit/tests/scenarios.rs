//! End-to-end behavior of the optimizing tier through `Engine`

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use kestrel_jit::analysis::backward::BackwardPass;
use kestrel_jit::bytecode::FuncId;
use kestrel_jit::ir::EntryKind;
use kestrel_jit::pipeline::context::CompileContext;
use kestrel_jit::pipeline::lifter::lift_function;
use kestrel_jit::profiling::ProgramProfile;
use kestrel_jit::runtime::{EntryKey, OverrideSnapshot, Relax, SiteKey};
use kestrel_jit::{Engine, JitConfig, Tier, Value};

use common::*;

#[test]
fn test_inlined_call_relaxed_after_repeated_target_misses() {
    let mut engine = Engine::new(caller_program(), eager_config(5, 5)).unwrap();
    let key = EntryKey::function(FuncId(0));
    let inc = Value::function(FuncId(1));
    let big = Value::function(FuncId(2));

    for i in 0..8 {
        assert_eq!(engine.run(FuncId(0), &[inc, Value::int(i)]).unwrap(), Value::int(i + 1));
    }
    let first = engine.entries().get(key).expect("caller compiled");
    assert_eq!(first.tier, Tier::Full);
    assert_eq!(first.frames.len(), 2, "inc is inlined");

    let site = SiteKey::new(FuncId(0), CALLER_CALL_OFFSET);
    let threshold = engine.config().rejit.bailout_threshold as i32;
    for i in 0..threshold - 1 {
        assert_eq!(engine.run(FuncId(0), &[big, Value::int(i)]).unwrap(), Value::int(i + 100));
        let current = engine.entries().get(key).unwrap();
        assert!(Arc::ptr_eq(&first, &current));
        assert!(engine.overrides().allows(site, Relax::NoInline));
    }
    assert_eq!(engine.site_stats().count(site), (threshold - 1) as u32);

    // The last miss relaxes the site and replaces the body
    assert_eq!(engine.run(FuncId(0), &[big, Value::int(7)]).unwrap(), Value::int(107));
    assert!(!engine.overrides().allows(site, Relax::NoInline));
    let second = engine.entries().get(key).unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(second.frames.len(), 1, "the call is no longer inlined");
    assert_eq!(first.bailouts.load(Ordering::Relaxed), threshold as u64);

    for i in 0..10 {
        assert_eq!(engine.run(FuncId(0), &[big, Value::int(i)]).unwrap(), Value::int(i + 100));
        assert_eq!(engine.run(FuncId(0), &[inc, Value::int(i)]).unwrap(), Value::int(i + 1));
    }
    assert_eq!(second.bailouts.load(Ordering::Relaxed), 0);
}

#[test]
fn test_dead_store_removed_and_results_match_interpreter() {
    let program = dead_store_program();
    let profiles = ProgramProfile::new(1);
    profiles.functions[0].with_data(|d| {
        d.record_arith(1, true);
        d.record_arith(3, true);
    });
    let config = JitConfig::default();
    let overrides = OverrideSnapshot::default();
    let mut ctx = CompileContext::new(&program, &profiles, &config, &overrides, Tier::Full);
    let mut ir = lift_function(&mut ctx, FuncId(0), EntryKind::Function).unwrap();
    let stats = BackwardPass::new(&mut ctx).run(&mut ir).unwrap();
    assert!(stats.removed >= 1);

    let mut jit = Engine::new(dead_store_program(), eager_config(2, 4)).unwrap();
    let mut interp = Engine::new(dead_store_program(), JitConfig::interpreter_only()).unwrap();
    let inputs = [
        (Value::int(3), Value::int(4)),
        (Value::int(-2), Value::int(9)),
        (Value::int(6), Value::int(7)),
        (Value::int(1), Value::int(1)),
        (Value::int(10), Value::int(0)),
        (Value::float(0.5), Value::int(3)),
        (Value::int(0), Value::int(-3)),
        (Value::int(i32::MAX), Value::int(2)),
        (Value::int(5), Value::int(5)),
    ];
    for (a, b) in inputs {
        assert_eq!(
            jit.run(FuncId(0), &[a, b]).unwrap(),
            interp.run(FuncId(0), &[a, b]).unwrap(),
            "madd({:?}, {:?})",
            a,
            b
        );
    }
    assert_eq!(jit.tier_of(FuncId(0)), Tier::Full);
    let entry = jit.entries().get(EntryKey::function(FuncId(0))).unwrap();
    // float argument, negative zero and overflow
    assert_eq!(entry.bailouts.load(Ordering::Relaxed), 3);
}

#[test]
fn test_hot_loop_runs_compiled_body() {
    let mut config = JitConfig::default();
    config.scheduler.background = false;
    config.tiering.loop_threshold = 10;
    let mut jit = Engine::new(sum_program(), config).unwrap();
    let mut interp = Engine::new(sum_program(), JitConfig::interpreter_only()).unwrap();

    assert_eq!(jit.run(FuncId(0), &[Value::int(1000)]).unwrap(), Value::int(499_500));
    let key = EntryKey::new(FuncId(0), EntryKind::Loop(SUM_LOOP_HEADER));
    let entry = jit.entries().get(key).expect("loop body compiled");
    assert_eq!(entry.tier, Tier::Full);
    assert_eq!(jit.tier_of(FuncId(0)), Tier::Interpreter);

    for n in [0, 1, 7, 64, 300] {
        assert_eq!(
            jit.run(FuncId(0), &[Value::int(n)]).unwrap(),
            interp.run(FuncId(0), &[Value::int(n)]).unwrap()
        );
    }
}

#[test]
fn test_nested_calls_inline_two_levels() {
    let mut engine = Engine::new(nested_program(), eager_config(10, 10)).unwrap();
    for i in 0..20 {
        assert_eq!(engine.run(FuncId(0), &[Value::int(i)]).unwrap(), Value::int((i + i + 1) * 2));
    }
    let entry = engine.entries().get(EntryKey::function(FuncId(0))).unwrap();
    assert_eq!(entry.frames.len(), 3);
    assert!(entry.frames.iter().all(|(_, f)| f.depth <= engine.config().inlining.max_depth));

    // A float bails from inside the innermost inlinee and finishes in the interpreter
    let mut interp = Engine::new(nested_program(), JitConfig::interpreter_only()).unwrap();
    let x = [Value::float(0.3)];
    assert_eq!(engine.run(FuncId(0), &x).unwrap(), interp.run(FuncId(0), &x).unwrap());
    assert_eq!(entry.bailouts.load(Ordering::Relaxed), 1);
}

#[test]
fn test_throw_from_inlined_callee_reaches_caller_handler() {
    let mut jit = Engine::new(try_catch_program(), eager_config(2, 4)).unwrap();
    let mut interp = Engine::new(try_catch_program(), JitConfig::interpreter_only()).unwrap();
    for a in 0..10 {
        let args = [Value::int(a)];
        assert_eq!(jit.run(FuncId(0), &args).unwrap(), Value::int(a + 1));
        interp.run(FuncId(0), &args).unwrap();
    }
    let entry = jit.entries().get(EntryKey::function(FuncId(0))).expect("guarded compiled");
    assert_eq!(entry.tier, Tier::Full);
    assert_eq!(entry.frames.len(), 2, "thrower is inlined");

    // The throw side never ran, so it leaves from inside the inlined frame
    assert_eq!(jit.run(FuncId(0), &[Value::int(50)]).unwrap(), Value::int(150));
    for a in [10, 3, 11, -4, 99] {
        let args = [Value::int(a)];
        assert_eq!(jit.run(FuncId(0), &args).unwrap(), interp.run(FuncId(0), &args).unwrap(), "a = {}", a);
    }
    assert!(entry.bailouts.load(Ordering::Relaxed) >= 1);
}

#[test]
fn test_two_target_site_inlines_each_target_once() {
    let mut engine = Engine::new(caller_program(), eager_config(6, 6)).unwrap();
    let inc = Value::function(FuncId(1));
    let big = Value::function(FuncId(2));
    let alternate = |i: i32| if i % 2 == 0 { (inc, i + 1) } else { (big, i + 100) };
    for i in 0..12 {
        let (f, expected) = alternate(i);
        assert_eq!(engine.run(FuncId(0), &[f, Value::int(i)]).unwrap(), Value::int(expected));
    }

    let entry = engine.entries().get(EntryKey::function(FuncId(0))).expect("caller compiled");
    assert_eq!(entry.tier, Tier::Full);
    assert_eq!(entry.frames.len(), 3, "root plus one frame per target");
    for i in 12..40 {
        let (f, expected) = alternate(i);
        assert_eq!(engine.run(FuncId(0), &[f, Value::int(i)]).unwrap(), Value::int(expected));
    }
    assert_eq!(entry.bailouts.load(Ordering::Relaxed), 0);
}

#[test]
fn test_inlined_constructor_matches_interpreter() {
    let mut jit = Engine::new(constructor_program(), eager_config(2, 4)).unwrap();
    let mut interp = Engine::new(constructor_program(), JitConfig::interpreter_only()).unwrap();
    for v in 0..8 {
        let args = [Value::int(v)];
        assert_eq!(jit.run(FuncId(0), &args).unwrap(), Value::int(4 * v));
        interp.run(FuncId(0), &args).unwrap();
    }
    let entry = jit.entries().get(EntryKey::function(FuncId(0))).expect("make compiled");
    assert_eq!(entry.frames.len(), 2, "Point is inlined");
    assert!(entry.frames.iter().any(|(_, f)| f.inlinee.as_ref().is_some_and(|r| r.construct)));

    // Overflow inside the inlined constructor resumes it in the interpreter
    for v in [i32::MAX / 2, 7, -3] {
        let args = [Value::int(v)];
        assert_eq!(jit.run(FuncId(0), &args).unwrap(), interp.run(FuncId(0), &args).unwrap(), "v = {}", v);
    }
}

#[test]
fn test_simple_tier_keeps_profiling_call_targets() {
    let mut engine = Engine::new(caller_program(), eager_config(2, 12)).unwrap();
    let inc = Value::function(FuncId(1));
    let big = Value::function(FuncId(2));
    for i in 0..2 {
        assert_eq!(engine.run(FuncId(0), &[inc, Value::int(i)]).unwrap(), Value::int(i + 1));
    }
    for i in 0..6 {
        assert_eq!(engine.run(FuncId(0), &[big, Value::int(i)]).unwrap(), Value::int(i + 100));
    }
    assert_eq!(engine.tier_of(FuncId(0)), Tier::Simple);
    let targets = engine
        .profiles()
        .get(FuncId(0))
        .unwrap()
        .with_data(|d| d.call_site(CALLER_CALL_OFFSET).map(|s| s.targets.clone()));
    assert_eq!(targets, Some(vec![FuncId(1), FuncId(2)]));

    for i in 0..10 {
        let (f, expected) = if i % 2 == 0 { (inc, i + 1) } else { (big, i + 100) };
        assert_eq!(engine.run(FuncId(0), &[f, Value::int(i)]).unwrap(), Value::int(expected));
    }
    let entry = engine.entries().get(EntryKey::function(FuncId(0))).unwrap();
    assert_eq!(entry.tier, Tier::Full);
    assert_eq!(entry.frames.len(), 3, "both targets seen in simple code are inlined");
}
