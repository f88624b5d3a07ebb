//! End-to-end lowering tests: whole functions through `CodeGen`, checked on
//! the printed module.
//!
//! These tests verify that:
//! - options parsed from TOML drive backend selection
//! - `go` with captures yields a record, a thunk and a thread entry
//! - select registers cases with their source indices
//! - every module produced here passes verification

use strand_codegen::codegen::channels::{ChannelBackend, RecvCapability, RecvLimitation};
use strand_codegen::ssa::{self, CallCommon, CallInstruction, Local, Select, SelectState, Signature, Ty};
use strand_codegen::{CodeGen, CodegenError, CodegenOptions};

// ── Helpers ────────────────────────────────────────────────────────────

fn lower(options: CodegenOptions, body: impl FnOnce(&mut CodeGen, &mut strand_codegen::Frame)) -> String {
    let mut cg = CodeGen::new(options).unwrap();
    let mut fr = cg.new_frame("main", &Signature::new(vec![], None), &[]).unwrap();
    body(&mut cg, &mut fr);
    fr.builder.build_return(None).unwrap();
    cg.finish_frame(fr).unwrap();
    cg.verify().unwrap();
    cg.get_ir()
}

fn bind_chan(cg: &mut CodeGen, fr: &mut strand_codegen::Frame, id: u32, elem: Ty) -> ssa::Value {
    let chan_ty = Ty::chan(elem);
    let ch = cg
        .codegen_make_chan(fr, &chan_ty, &ssa::Value::int(Ty::int(), 1))
        .unwrap();
    let local = Local::new(id, "ch", chan_ty);
    fr.bind(&local, ch);
    ssa::Value::Local(local)
}

// ── Options ────────────────────────────────────────────────────────────

#[test]
fn test_toml_options_disable_fifo_channels() {
    let options = CodegenOptions::from_toml_str(
        r#"
        module_name = "prog"
        fifo_channels = false
        "#,
    )
    .unwrap();
    let ir = lower(options, |cg, fr| {
        assert_eq!(cg.channel_backend(&Ty::int32()), ChannelBackend::Generic);
        bind_chan(cg, fr, 0, Ty::int32());
    });
    assert!(ir.starts_with("; ModuleID = 'prog'"), "Module should be named: {}", ir);
    assert!(ir.contains("call i8* @strand_chan_new(i8* %tydesc"), "Should use generic make: {}", ir);
    assert!(!ir.contains("call i8* @strand_chan_new_fifo("), "No FIFO make expected: {}", ir);
}

#[test]
fn test_32_bit_targets_use_i32_capacities() {
    let options = CodegenOptions {
        pointer_bits: 32,
        ..CodegenOptions::default()
    };
    let ir = lower(options, |cg, fr| {
        bind_chan(cg, fr, 0, Ty::uint8());
    });
    assert!(ir.contains("declare i8* @strand_chan_new_fifo(i8, i32)"), "{}", ir);
    assert!(ir.contains("call i8* @strand_chan_new_fifo(i8 8, i32 1)"), "{}", ir);
}

// ── Channels ───────────────────────────────────────────────────────────

#[test]
fn test_recv_capability_is_a_tagged_answer() {
    let cg = CodeGen::new(CodegenOptions::default()).unwrap();
    assert_eq!(
        cg.fifo_recv_capability(&Ty::int32(), false),
        RecvCapability::Supported { width: 32 }
    );
    assert_eq!(
        cg.fifo_recv_capability(&Ty::int32(), true),
        RecvCapability::Unsupported(RecvLimitation::SuccessFlag)
    );
    assert_eq!(
        cg.fifo_recv_capability(&Ty::Struct(vec![Ty::Bool]), false),
        RecvCapability::Unsupported(RecvLimitation::NotFifo)
    );
}

#[test]
fn test_negative_capacity_is_rejected() {
    let mut cg = CodeGen::new(CodegenOptions::default()).unwrap();
    let mut fr = cg.new_frame("main", &Signature::new(vec![], None), &[]).unwrap();
    let err = cg
        .codegen_make_chan(&mut fr, &Ty::chan(Ty::int()), &ssa::Value::int(Ty::int(), -1))
        .unwrap_err();
    assert_eq!(err, CodegenError::UnsupportedCapacity("-1".into()));
}

// ── go ─────────────────────────────────────────────────────────────────

#[test]
fn test_go_with_captures_builds_record_thunk_and_entry() {
    let mut cg = CodeGen::new(CodegenOptions::default()).unwrap();
    let x = Local::new(0, "x", Ty::int32());
    let flag = Local::new(1, "flag", Ty::Bool);
    let sig = Signature::new(vec![Ty::int32(), Ty::Bool], None);
    let mut fr = cg.new_frame("main", &sig, &[x.clone(), flag.clone()]).unwrap();
    let worker = ssa::Value::function("worker", Signature::new(vec![Ty::int32(), Ty::Bool, Ty::int32()], None));
    let call = CallCommon::new(
        worker,
        vec![ssa::Value::Local(x.clone()), ssa::Value::Local(flag), ssa::Value::Local(x)],
    );
    cg.codegen_call_instruction(&mut fr, &CallInstruction::go(call)).unwrap();
    fr.builder.build_return(None).unwrap();
    cg.finish_frame(fr).unwrap();
    cg.verify().unwrap();
    let ir = cg.get_ir();

    assert!(ir.contains("call i8* @strand_gc_alloc(i64 8, i64 4)"), "Record is {{ i32, i1 }}: {}", ir);
    assert!(ir.contains("define internal void @__thunk.0(i8* %p0)"), "{}", ir);
    assert!(ir.contains("%record = bitcast i8* %p0 to { i32, i1 }*"), "{}", ir);
    assert!(ir.contains("call void @worker(i32 %x, i1 %flag, i32 %x)"), "Both uses read one field: {}", ir);
    assert!(ir.contains("define internal i8* @__thread_entry.0(i8* %p0)"), "{}", ir);
    assert!(!ir.contains("strand_defer_set_retaddr(i8* blockaddress"), "go thunks have no exit: {}", ir);
}

#[test]
fn test_thunk_names_never_shadow_params_or_each_other() {
    let mut cg = CodeGen::new(CodegenOptions::default()).unwrap();
    let locals = [
        Local::new(0, "p0", Ty::int()),
        Local::new(1, "x", Ty::int()),
        Local::new(2, "x", Ty::int()),
        Local::new(3, "x1", Ty::int()),
    ];
    let sig = Signature::new(vec![Ty::int(); 4], None);
    let mut fr = cg.new_frame("main", &sig, &locals).unwrap();
    let use4 = ssa::Value::function("use4", Signature::new(vec![Ty::int(); 4], None));
    let args = locals.iter().cloned().map(ssa::Value::Local).collect();
    cg.codegen_call_instruction(&mut fr, &CallInstruction::defer(CallCommon::new(use4, args)))
        .unwrap();
    fr.builder.build_return(None).unwrap();
    cg.finish_frame(fr).unwrap();
    cg.verify().unwrap();
    let ir = cg.get_ir();

    let start = ir.find("define internal void @__thunk.0").unwrap();
    let thunk = &ir[start..start + ir[start..].find("\n}").unwrap()];
    assert_eq!(thunk.matches("%p0 = ").count(), 0, "Param must not be redefined: {}", thunk);
    assert_eq!(thunk.matches("%x1 = ").count(), 1, "{}", thunk);
    assert!(
        thunk.contains("call void @use4(i64 %p01, i64 %x, i64 %x1, i64 %x11)"),
        "Each field is read into its own name: {}",
        thunk
    );
}

// ── select ─────────────────────────────────────────────────────────────

#[test]
fn test_select_registers_cases_in_source_order() {
    let ir = lower(CodegenOptions::default(), |cg, fr| {
        let a = bind_chan(cg, fr, 0, Ty::int());
        let b = bind_chan(cg, fr, 1, Ty::int());
        let sel = Select::new(
            vec![
                SelectState::send(a, ssa::Value::int(Ty::int(), 3)),
                SelectState::recv(b),
            ],
            false,
        )
        .with_extract(2, 0);
        let result = cg.codegen_select(fr, &sel).unwrap();
        assert!(result.recv_values[0].is_none(), "Unused receive yields no value");
        assert!(result.recv_ok.is_some());
    });
    assert!(ir.contains("call i8* @strand_select_new(i32 3)"), "Non-blocking adds a slot: {}", ir);
    assert!(ir.contains("call void @strand_select_default(i8* %select, i32 -1)"), "{}", ir);
    assert!(ir.contains(", i32 0)\n"), "Send case is index 0: {}", ir);
    assert!(ir.contains("i8* null, i1* %selok, i32 1)"), "Unused receive passes null: {}", ir);
}
