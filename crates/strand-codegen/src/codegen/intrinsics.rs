//! Runtime function declarations in the LIR module.
//!
//! Declares every runtime entry point the lowering may call. The
//! signatures must match the runtime library bit for bit; `iP` below is
//! the target's pointer-width integer.

use crate::error::CodegenError;
use crate::lir::{BuildError, FnAttr, FnType, Module, Type, Value};

use super::types::TypeLayout;

/// Declare all runtime functions in the module.
///
/// Called once from [`CodeGen::new`](super::CodeGen::new), before any
/// lowering that might reference them.
pub fn declare_intrinsics(module: &mut Module, layout: &TypeLayout) -> Result<(), BuildError> {
    let void = Type::Void;
    let i1 = Type::i1();
    let i8 = Type::i8();
    let i32 = Type::i32();
    let i64 = Type::i64();
    let ptr = Type::opaque_ptr();
    let int_ptr = layout.int_ptr_type();

    let mut declare = |name: &str, params: Vec<Type>, ret: Type, attrs: &[FnAttr]| {
        module
            .declare_function(name, FnType::new(params, ret), attrs)
            .map(|_| ())
    };

    // ── Channels ─────────────────────────────────────────────────────

    // strand_chan_new_fifo(width: i8, cap: iP) -> ptr
    declare("strand_chan_new_fifo", vec![i8.clone(), int_ptr.clone()], ptr.clone(), &[])?;
    // strand_chan_new(tydesc: ptr, cap: iP) -> ptr
    declare("strand_chan_new", vec![ptr.clone(), int_ptr.clone()], ptr.clone(), &[])?;
    // strand_chan_send_fifo(ch: ptr, val: ptr)
    declare("strand_chan_send_fifo", vec![ptr.clone(), ptr.clone()], void.clone(), &[])?;
    // strand_chan_send(tydesc: ptr, ch: ptr, val: ptr)
    declare(
        "strand_chan_send",
        vec![ptr.clone(), ptr.clone(), ptr.clone()],
        void.clone(),
        &[],
    )?;
    // strand_chan_recv_fifo(ch: ptr) -> i64
    declare("strand_chan_recv_fifo", vec![ptr.clone()], i64.clone(), &[])?;
    // strand_chan_recv(tydesc: ptr, ch: ptr, out: ptr)
    declare(
        "strand_chan_recv",
        vec![ptr.clone(), ptr.clone(), ptr.clone()],
        void.clone(),
        &[],
    )?;
    // strand_chan_recv2(tydesc: ptr, ch: ptr, out: ptr) -> i1
    declare(
        "strand_chan_recv2",
        vec![ptr.clone(), ptr.clone(), ptr.clone()],
        i1.clone(),
        &[],
    )?;
    // strand_chan_close(ch: ptr)
    declare("strand_chan_close", vec![ptr.clone()], void.clone(), &[])?;

    // ── Select ───────────────────────────────────────────────────────

    // strand_select_new(size: i32) -> ptr
    declare("strand_select_new", vec![i32.clone()], ptr.clone(), &[])?;
    // strand_select_default(sel: ptr, index: i32)
    declare("strand_select_default", vec![ptr.clone(), i32.clone()], void.clone(), &[])?;
    // strand_select_send(sel: ptr, ch: ptr, val: ptr, index: i32)
    declare(
        "strand_select_send",
        vec![ptr.clone(), ptr.clone(), ptr.clone(), i32.clone()],
        void.clone(),
        &[],
    )?;
    // strand_select_recv2(sel: ptr, ch: ptr, out: ptr, ok: i1*, index: i32)
    declare(
        "strand_select_recv2",
        vec![ptr.clone(), ptr.clone(), ptr.clone(), i1.clone().ptr_to(), i32],
        void.clone(),
        &[],
    )?;
    // strand_select_go(sel: ptr) -> iP
    declare("strand_select_go", vec![ptr.clone()], int_ptr, &[])?;

    // ── Defer, panic and recover ─────────────────────────────────────

    // strand_defer_set_retaddr(addr: ptr)
    declare("strand_defer_set_retaddr", vec![ptr.clone()], void.clone(), &[])?;
    // strand_defer(thunk: ptr, arg: ptr)
    declare("strand_defer", vec![ptr.clone(), ptr.clone()], void.clone(), &[])?;
    // strand_undefer()
    declare("strand_undefer", vec![], void.clone(), &[])?;
    // strand_recover() -> ptr
    declare("strand_recover", vec![], ptr.clone(), &[])?;
    // strand_deferred_recover() -> ptr
    declare("strand_deferred_recover", vec![], ptr.clone(), &[])?;
    // strand_panic(tydesc: ptr, val: ptr) noreturn
    declare(
        "strand_panic",
        vec![ptr.clone(), ptr.clone()],
        void.clone(),
        &[FnAttr::NoReturn],
    )?;

    // ── Memory and threads ───────────────────────────────────────────

    // strand_gc_alloc(size: i64, align: i64) -> ptr
    declare("strand_gc_alloc", vec![i64.clone(), i64], ptr.clone(), &[])?;
    // strand_thread_exit(ret: ptr) noreturn
    declare("strand_thread_exit", vec![ptr.clone()], void.clone(), &[FnAttr::NoReturn])?;
    // strand_thread_create(entry: ptr, arg: ptr)
    declare("strand_thread_create", vec![ptr.clone(), ptr], void, &[])?;

    Ok(())
}

/// Look up a declared runtime function as a callable value.
pub fn get_intrinsic(module: &Module, name: &str) -> Result<Value, CodegenError> {
    module
        .get_function(name)
        .map(|f| f.as_value())
        .ok_or_else(|| CodegenError::MissingIntrinsic(name.to_string()))
}
