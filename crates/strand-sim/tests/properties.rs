//! Behavioral tests: lower small programs with `strand-codegen` and run them.
//!
//! Values a program wants to check are passed to external `observe_<type>`
//! functions, which the machine records instead of running.

use strand_codegen::lir::{self, InstKind, ValueKind};
use strand_codegen::ssa::{self, Builtin, CallCommon, CallInstruction, Local, Select, SelectState, Signature, Ty};
use strand_codegen::{CodeGen, CodegenOptions, Frame, TypedValue};
use strand_sim::{Machine, SimError, Val};

// ── Helpers ──────────────────────────────────────────────────────────

fn codegen() -> CodeGen {
    CodeGen::new(CodegenOptions::default()).unwrap()
}

fn codegen_32() -> CodeGen {
    let options = CodegenOptions {
        pointer_bits: 32,
        ..CodegenOptions::default()
    };
    CodeGen::new(options).unwrap()
}

fn main_frame(cg: &mut CodeGen, params: &[Local]) -> Frame {
    let sig = Signature::new(params.iter().map(|p| p.ty.clone()).collect(), None);
    cg.new_frame("main", &sig, params).unwrap()
}

/// Bind a lowered value to a fresh local so it can be used as an SSA operand.
fn bind(fr: &mut Frame, id: u32, tv: TypedValue) -> ssa::Value {
    let local = Local::new(id, format!("v{id}"), tv.ty.clone());
    fr.bind(&local, tv);
    ssa::Value::Local(local)
}

fn observe(cg: &mut CodeGen, fr: &mut Frame, id: u32, tv: TypedValue) {
    let name = format!("observe_{}", tv.ty.mangle());
    let sig = Signature::new(vec![tv.ty.clone()], None);
    let value = bind(fr, id, tv);
    let call = CallCommon::new(ssa::Value::function(name, sig), vec![value]);
    cg.codegen_call_common(fr, &call).unwrap();
}

fn finish(mut cg: CodeGen, mut fr: Frame) -> Machine {
    fr.builder.build_return(None).unwrap();
    cg.finish_frame(fr).unwrap();
    Machine::new(cg.into_module().unwrap()).unwrap()
}

fn observed(m: &Machine, name: &str) -> Vec<Val> {
    m.calls_to(name).map(|c| c.args[0].clone()).collect()
}

fn make_chan(cg: &mut CodeGen, fr: &mut Frame, id: u32, elem: Ty, cap: i64) -> ssa::Value {
    let ch = cg
        .codegen_make_chan(fr, &Ty::chan(elem), &ssa::Value::int(Ty::int(), cap))
        .unwrap();
    bind(fr, id, ch)
}

// ── Channels ─────────────────────────────────────────────────────────

#[test]
fn fifo_channel_delivers_in_send_order() {
    let mut cg = codegen();
    let mut fr = main_frame(&mut cg, &[]);
    let ch = make_chan(&mut cg, &mut fr, 100, Ty::int(), 4);
    for v in [10, 20, 30] {
        cg.codegen_chan_send(&mut fr, &ch, &ssa::Value::int(Ty::int(), v)).unwrap();
    }
    for id in 0..3 {
        let received = cg.codegen_chan_recv(&mut fr, &ch, false).unwrap();
        observe(&mut cg, &mut fr, id, received.value);
    }
    let mut m = finish(cg, fr);
    m.run("main", vec![]).unwrap();

    assert_eq!(m.stats().fifo_channels, 1);
    assert_eq!(
        observed(&m, "observe_i64"),
        vec![Val::int(64, 10), Val::int(64, 20), Val::int(64, 30)]
    );
}

#[test]
fn int32_channel_of_capacity_two_then_success_flag_fallback() {
    let mut cg = codegen();
    let mut fr = main_frame(&mut cg, &[]);
    let ch = make_chan(&mut cg, &mut fr, 100, Ty::int32(), 2);
    cg.codegen_chan_send(&mut fr, &ch, &ssa::Value::int(Ty::int32(), 1)).unwrap();
    cg.codegen_chan_send(&mut fr, &ch, &ssa::Value::int(Ty::int32(), 2)).unwrap();
    for id in 0..2 {
        let received = cg.codegen_chan_recv(&mut fr, &ch, false).unwrap();
        observe(&mut cg, &mut fr, id, received.value);
    }
    cg.codegen_chan_send(&mut fr, &ch, &ssa::Value::int(Ty::int32(), -3)).unwrap();
    let received = cg.codegen_chan_recv(&mut fr, &ch, true).unwrap();
    observe(&mut cg, &mut fr, 2, received.value);
    observe(&mut cg, &mut fr, 3, received.ok.unwrap());

    let mut m = finish(cg, fr);
    m.run("main", vec![]).unwrap();

    assert_eq!(m.stats().fifo_channels, 1);
    assert_eq!(m.stats().generic_channels, 0);
    assert_eq!(
        observed(&m, "observe_i32"),
        vec![Val::int(32, 1), Val::int(32, 2), Val::int(32, -3)]
    );
    assert_eq!(observed(&m, "observe_bool"), vec![Val::bool(true)]);
}

#[test]
fn fifo_words_decode_floats_bools_and_pointers() {
    let mut cg = codegen();
    let p = Local::new(50, "p", Ty::pointer(Ty::int()));
    let mut fr = main_frame(&mut cg, &[p.clone()]);
    let floats = make_chan(&mut cg, &mut fr, 100, Ty::Float64, 1);
    let bools = make_chan(&mut cg, &mut fr, 101, Ty::Bool, 1);
    let ptrs = make_chan(&mut cg, &mut fr, 102, Ty::pointer(Ty::int()), 1);
    let small = make_chan(&mut cg, &mut fr, 103, Ty::Float32, 1);

    cg.codegen_chan_send(&mut fr, &floats, &ssa::Value::float(Ty::Float64, 2.5)).unwrap();
    let v = cg.codegen_chan_recv(&mut fr, &floats, false).unwrap();
    observe(&mut cg, &mut fr, 0, v.value);

    cg.codegen_chan_send(&mut fr, &bools, &ssa::Value::bool(true)).unwrap();
    let v = cg.codegen_chan_recv(&mut fr, &bools, false).unwrap();
    observe(&mut cg, &mut fr, 1, v.value);

    cg.codegen_chan_send(&mut fr, &ptrs, &ssa::Value::Local(p)).unwrap();
    let v = cg.codegen_chan_recv(&mut fr, &ptrs, false).unwrap();
    observe(&mut cg, &mut fr, 2, v.value);

    cg.codegen_chan_send(&mut fr, &small, &ssa::Value::float(Ty::Float32, -0.5)).unwrap();
    let v = cg.codegen_chan_recv(&mut fr, &small, false).unwrap();
    observe(&mut cg, &mut fr, 3, v.value);

    let mut m = finish(cg, fr);
    let target = strand_sim::Ptr::Function("somewhere".into());
    m.run("main", vec![Val::Ptr(target.clone())]).unwrap();

    assert_eq!(m.stats().fifo_channels, 4);
    assert_eq!(observed(&m, "observe_f64"), vec![Val::F64(2.5)]);
    assert_eq!(observed(&m, "observe_bool"), vec![Val::bool(true)]);
    assert_eq!(observed(&m, "observe_ptr.i64"), vec![Val::Ptr(target)]);
    assert_eq!(observed(&m, "observe_f32"), vec![Val::F32(-0.5)]);
}

#[test]
fn closed_channel_yields_zero_and_false() {
    let mut cg = CodeGen::new(CodegenOptions {
        fifo_channels: false,
        ..CodegenOptions::default()
    })
    .unwrap();
    let mut fr = main_frame(&mut cg, &[]);
    let ch = make_chan(&mut cg, &mut fr, 100, Ty::int(), 1);
    cg.codegen_chan_send(&mut fr, &ch, &ssa::Value::int(Ty::int(), 8)).unwrap();
    let close = CallCommon::builtin(Builtin::Close, vec![ch.clone()]);
    cg.codegen_call_common(&mut fr, &close).unwrap();
    for id in 0..2 {
        let received = cg.codegen_chan_recv(&mut fr, &ch, true).unwrap();
        observe(&mut cg, &mut fr, 2 * id, received.value);
        observe(&mut cg, &mut fr, 2 * id + 1, received.ok.unwrap());
    }
    let mut m = finish(cg, fr);
    m.run("main", vec![]).unwrap();

    assert_eq!(m.stats().generic_channels, 1);
    assert_eq!(observed(&m, "observe_i64"), vec![Val::int(64, 8), Val::int(64, 0)]);
    assert_eq!(observed(&m, "observe_bool"), vec![Val::bool(true), Val::bool(false)]);
}

#[test]
fn receive_on_empty_channel_without_threads_deadlocks() {
    let mut cg = codegen();
    let mut fr = main_frame(&mut cg, &[]);
    let ch = make_chan(&mut cg, &mut fr, 100, Ty::int(), 1);
    cg.codegen_chan_recv(&mut fr, &ch, false).unwrap();
    let mut m = finish(cg, fr);
    assert!(matches!(m.run("main", vec![]), Err(SimError::Deadlock(_))));
}

// ── Select ───────────────────────────────────────────────────────────

#[test]
fn blocking_select_picks_the_ready_receive() {
    let mut cg = codegen();
    let mut fr = main_frame(&mut cg, &[]);
    let a = make_chan(&mut cg, &mut fr, 100, Ty::int(), 1);
    let b = make_chan(&mut cg, &mut fr, 101, Ty::int(), 1);
    cg.codegen_chan_send(&mut fr, &b, &ssa::Value::int(Ty::int(), 77)).unwrap();

    let sel = Select::new(vec![SelectState::recv(a), SelectState::recv(b)], true)
        .with_extract(0, 1)
        .with_extract(3, 1);
    let result = cg.codegen_select(&mut fr, &sel).unwrap();
    assert!(result.recv_values[0].is_none());
    observe(&mut cg, &mut fr, 0, result.index);
    observe(&mut cg, &mut fr, 1, result.recv_ok.unwrap());
    observe(&mut cg, &mut fr, 2, result.recv_values[1].clone().unwrap());

    let mut m = finish(cg, fr);
    m.run("main", vec![]).unwrap();

    let index = observed(&m, "observe_i64")[0].as_i64().unwrap();
    assert!((0..2).contains(&index));
    assert_eq!(index, 1);
    assert_eq!(observed(&m, "observe_i64")[1], Val::int(64, 77));
    assert_eq!(observed(&m, "observe_bool"), vec![Val::bool(true)]);
}

#[test]
fn non_blocking_select_with_nothing_ready_takes_default() {
    let mut cg = codegen();
    let mut fr = main_frame(&mut cg, &[]);
    let a = make_chan(&mut cg, &mut fr, 100, Ty::int(), 1);
    let b = make_chan(&mut cg, &mut fr, 101, Ty::int(), 1);
    let sel = Select::new(vec![SelectState::recv(a), SelectState::recv(b)], false);
    let result = cg.codegen_select(&mut fr, &sel).unwrap();
    observe(&mut cg, &mut fr, 0, result.index);

    let mut m = finish(cg, fr);
    m.run("main", vec![]).unwrap();
    assert_eq!(observed(&m, "observe_i64"), vec![Val::int(64, -1)]);
}

#[test]
fn blocking_select_prefers_ready_send_over_empty_receive() {
    let mut cg = codegen();
    let mut fr = main_frame(&mut cg, &[]);
    let out = make_chan(&mut cg, &mut fr, 100, Ty::int(), 1);
    let input = make_chan(&mut cg, &mut fr, 101, Ty::int(), 1);
    let sel = Select::new(
        vec![
            SelectState::recv(input),
            SelectState::send(out.clone(), ssa::Value::int(Ty::int(), 5)),
        ],
        true,
    )
    .with_extract(2, 1);
    let result = cg.codegen_select(&mut fr, &sel).unwrap();
    observe(&mut cg, &mut fr, 0, result.index);
    let sent = cg.codegen_chan_recv(&mut fr, &out, false).unwrap();
    observe(&mut cg, &mut fr, 1, sent.value);

    let mut m = finish(cg, fr);
    m.run("main", vec![]).unwrap();
    assert_eq!(observed(&m, "observe_i64"), vec![Val::int(64, 1), Val::int(64, 5)]);
}

// ── Thunks, defer and go ─────────────────────────────────────────────

#[test]
fn variable_used_twice_is_captured_once() {
    let mut cg = codegen();
    let x = Local::new(0, "x", Ty::int());
    let mut fr = main_frame(&mut cg, &[x.clone()]);
    let pair = ssa::Value::function("pair", Signature::new(vec![Ty::int(), Ty::int()], None));
    let call = CallCommon::method(pair, ssa::Value::Local(x.clone()), vec![ssa::Value::Local(x)]);
    cg.codegen_call_instruction(&mut fr, &CallInstruction::defer(call)).unwrap();
    cg.codegen_undefer(&mut fr).unwrap();

    let mut m = finish(cg, fr);
    m.run("main", vec![Val::int(64, 41)]).unwrap();

    let calls: Vec<_> = m.calls_to("pair").collect();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].args, vec![Val::int(64, 41), Val::int(64, 41)]);
    assert_eq!(m.stats().heap_allocs, 1);
    assert_eq!(m.stats().defers_run, 1);
    assert_eq!(m.stats().retaddrs_set, 1);
}

#[test]
fn deferred_calls_run_newest_first() {
    let mut cg = codegen();
    let mut fr = main_frame(&mut cg, &[]);
    let show = ssa::Value::function("show", Signature::new(vec![Ty::int()], None));
    for v in [1, 2, 3] {
        let call = CallCommon::new(show.clone(), vec![ssa::Value::int(Ty::int(), v)]);
        cg.codegen_call_instruction(&mut fr, &CallInstruction::defer(call)).unwrap();
    }
    cg.codegen_undefer(&mut fr).unwrap();

    let mut m = finish(cg, fr);
    m.run("main", vec![]).unwrap();
    assert_eq!(observed(&m, "show"), vec![Val::int(64, 3), Val::int(64, 2), Val::int(64, 1)]);
}

#[test]
fn zero_capture_thunk_gets_null_argument() {
    let mut cg = codegen();
    let mut fr = main_frame(&mut cg, &[]);
    let cleanup = ssa::Value::function("cleanup", Signature::new(vec![], None));
    cg.codegen_call_instruction(&mut fr, &CallInstruction::defer(CallCommon::new(cleanup, vec![])))
        .unwrap();
    cg.codegen_undefer(&mut fr).unwrap();
    fr.builder.build_return(None).unwrap();
    cg.finish_frame(fr).unwrap();

    let module = cg.into_module().unwrap();
    let main = module.get_function("main").unwrap();
    let push = main.calls_to("strand_defer").next().unwrap();
    let InstKind::Call { args, .. } = &push.kind else {
        panic!("calls_to yields calls");
    };
    assert_eq!(args[1].kind, ValueKind::Null);

    let mut m = Machine::new(module).unwrap();
    m.run("main", vec![]).unwrap();
    assert_eq!(m.calls_to("cleanup").count(), 1);
    assert_eq!(m.stats().heap_allocs, 0);
}

fn deferred_recover_program(mut cg: CodeGen) -> Machine {
    let flag = Local::new(0, "flag", Ty::Bool);
    let mut fr = main_frame(&mut cg, &[flag.clone()]);
    let flag_value = fr.lookup(flag.id).unwrap().value.clone();
    fr.set_can_recover(flag_value);
    let recover = CallCommon::builtin(Builtin::Recover, vec![]);
    cg.codegen_call_instruction(&mut fr, &CallInstruction::defer(recover)).unwrap();
    cg.codegen_undefer(&mut fr).unwrap();
    finish(cg, fr)
}

#[test]
fn recover_flag_survives_the_trip_through_the_thunk_argument() {
    let mut m = deferred_recover_program(codegen());
    m.run("main", vec![Val::bool(true)]).unwrap();
    assert_eq!(m.stats().deferred_recovers, 1);
    assert_eq!(m.stats().recovers, 0);

    let mut m = deferred_recover_program(codegen());
    m.run("main", vec![Val::bool(false)]).unwrap();
    assert_eq!(m.stats().deferred_recovers, 0);
    assert_eq!(m.stats().defers_run, 1);
}

#[test]
fn go_runs_thunk_once_then_exits_thread() {
    let mut cg = codegen();
    let x = Local::new(0, "x", Ty::int());
    let mut fr = main_frame(&mut cg, &[x.clone()]);
    let worker = ssa::Value::function("worker", Signature::new(vec![Ty::int()], None));
    let call = CallCommon::new(worker, vec![ssa::Value::Local(x)]);
    cg.codegen_call_instruction(&mut fr, &CallInstruction::go(call)).unwrap();

    let mut m = finish(cg, fr);
    m.run("main", vec![Val::int(64, 9)]).unwrap();
    assert_eq!(observed(&m, "worker"), vec![Val::int(64, 9)]);
    assert_eq!(m.stats().threads_created, 1);
    assert_eq!(m.stats().threads_exited, 1);
}

#[test]
fn goroutine_feeds_a_blocked_receiver() {
    let mut cg = codegen();
    let chan_ty = Ty::chan(Ty::int());

    // func producer(ch chan int) { ch <- 7; ch <- 8 }
    let ch_param = Local::new(0, "ch", chan_ty.clone());
    let producer_sig = Signature::new(vec![chan_ty.clone()], None);
    let mut pfr = cg.new_frame("producer", &producer_sig, &[ch_param.clone()]).unwrap();
    for v in [7, 8] {
        cg.codegen_chan_send(&mut pfr, &ssa::Value::Local(ch_param.clone()), &ssa::Value::int(Ty::int(), v))
            .unwrap();
    }
    pfr.builder.build_return(None).unwrap();
    cg.finish_frame(pfr).unwrap();

    let mut fr = main_frame(&mut cg, &[]);
    let ch = make_chan(&mut cg, &mut fr, 100, Ty::int(), 2);
    let producer = ssa::Value::function("producer", producer_sig);
    cg.codegen_call_instruction(&mut fr, &CallInstruction::go(CallCommon::new(producer, vec![ch.clone()])))
        .unwrap();
    for id in 0..2 {
        let received = cg.codegen_chan_recv(&mut fr, &ch, false).unwrap();
        observe(&mut cg, &mut fr, id, received.value);
    }

    let mut m = finish(cg, fr);
    m.run("main", vec![]).unwrap();
    assert_eq!(observed(&m, "observe_i64"), vec![Val::int(64, 7), Val::int(64, 8)]);
    assert_eq!(m.stats().threads_exited, 1);
}

#[test]
fn panic_surfaces_the_value() {
    let mut cg = codegen();
    let mut fr = main_frame(&mut cg, &[]);
    let call = CallCommon::builtin(Builtin::Panic, vec![ssa::Value::int(Ty::int(), 42)]);
    cg.codegen_call_common(&mut fr, &call).unwrap();
    let mut m = finish(cg, fr);
    assert_eq!(m.run("main", vec![]).unwrap_err(), SimError::Panic("42".into()));
}

#[test]
fn lowered_modules_are_well_formed() {
    let mut cg = codegen();
    let mut fr = main_frame(&mut cg, &[]);
    make_chan(&mut cg, &mut fr, 100, Ty::Struct(vec![Ty::int(), Ty::Bool]), 0);
    fr.builder.build_return(None).unwrap();
    cg.finish_frame(fr).unwrap();
    let module: lir::Module = cg.into_module().unwrap();
    assert!(module.get_global("__tydesc.chan.struct2.i64.bool").is_some());
    Machine::new(module).unwrap();
}

// ── 32-bit targets ───────────────────────────────────────────────────

#[test]
fn select_indices_stay_signed_on_32_bit_targets() {
    let mut cg = codegen_32();
    let mut fr = main_frame(&mut cg, &[]);
    let full = make_chan(&mut cg, &mut fr, 100, Ty::int32(), 2);
    let empty = make_chan(&mut cg, &mut fr, 101, Ty::int32(), 1);
    cg.codegen_chan_send(&mut fr, &full, &ssa::Value::int(Ty::int32(), 1)).unwrap();
    cg.codegen_chan_send(&mut fr, &full, &ssa::Value::int(Ty::int32(), 2)).unwrap();

    // Capacity two is full after two sends, so nothing is ready here.
    let blocked = Select::new(
        vec![
            SelectState::recv(empty.clone()),
            SelectState::send(full.clone(), ssa::Value::int(Ty::int32(), 3)),
        ],
        false,
    );
    let result = cg.codegen_select(&mut fr, &blocked).unwrap();
    observe(&mut cg, &mut fr, 0, result.index);

    let ready = Select::new(vec![SelectState::recv(empty), SelectState::recv(full)], true).with_extract(3, 1);
    let result = cg.codegen_select(&mut fr, &ready).unwrap();
    observe(&mut cg, &mut fr, 1, result.index);
    observe(&mut cg, &mut fr, 2, result.recv_values[1].clone().unwrap());

    let mut m = finish(cg, fr);
    m.run("main", vec![]).unwrap();

    assert_eq!(observed(&m, "observe_i64"), vec![Val::int(64, -1), Val::int(64, 1)]);
    assert_eq!(observed(&m, "observe_i32"), vec![Val::int(32, 1)]);
    assert_eq!(m.stats().fifo_channels, 2);
}

#[test]
fn capacity_is_narrowed_to_the_pointer_width() {
    let mut cg = codegen_32();
    let mut fr = main_frame(&mut cg, &[]);
    let ch = make_chan(&mut cg, &mut fr, 100, Ty::int(), 3);
    for v in [10, 20, 30] {
        cg.codegen_chan_send(&mut fr, &ch, &ssa::Value::int(Ty::int(), v)).unwrap();
    }
    for id in 0..3 {
        let received = cg.codegen_chan_recv(&mut fr, &ch, false).unwrap();
        observe(&mut cg, &mut fr, id, received.value);
    }

    let module = {
        fr.builder.build_return(None).unwrap();
        cg.finish_frame(fr).unwrap();
        cg.into_module().unwrap()
    };
    let fifo_new = module.get_function("strand_chan_new_fifo").unwrap();
    assert_eq!(fifo_new.ty.params[1], lir::Type::Int(32));

    let mut m = Machine::new(module).unwrap();
    m.run("main", vec![]).unwrap();
    assert_eq!(
        observed(&m, "observe_i64"),
        vec![Val::int(64, 10), Val::int(64, 20), Val::int(64, 30)]
    );
}

#[test]
fn recover_flag_round_trips_through_a_32_bit_pointer() {
    let mut m = deferred_recover_program(codegen_32());
    m.run("main", vec![Val::bool(true)]).unwrap();
    assert_eq!(m.stats().deferred_recovers, 1);
    assert_eq!(m.stats().recovers, 0);

    let mut m = deferred_recover_program(codegen_32());
    m.run("main", vec![Val::bool(false)]).unwrap();
    assert_eq!(m.stats().deferred_recovers, 0);
    assert_eq!(m.stats().defers_run, 1);
}
