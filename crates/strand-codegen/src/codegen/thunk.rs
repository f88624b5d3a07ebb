//! Thunk synthesis for deferred and spawned calls.
//!
//! A thunk is an internal `void(i8*)` function that replays one call later.
//! Everything the call needs that cannot be regenerated from scratch is
//! packed into a heap record in the creating frame; the thunk unpacks the
//! record in its `prologue` block and re-emits the call in `entry`.
//!
//! Two special cases bypass the record:
//!
//! - nothing to capture: the argument is a null pointer
//! - a capture-less `recover()`: the argument is the creating frame's
//!   recoverable flag, zero-extended to pointer width and carried in the
//!   pointer bits. The runtime relies on this encoding.

use rustc_hash::FxHashSet;
use tracing::debug;

use crate::error::CodegenError;
use crate::lir::{self, CastOp, FnType, FunctionBuilder, Linkage, Value};
use crate::ssa::{self, Builtin, CallCommon, CallInstruction, CallKind, Local};

use super::{CodeGen, Frame, TypedValue};

/// How a call operand reaches the thunk.
#[derive(Debug, Clone, PartialEq)]
pub enum Capture<'a> {
    /// Constants, functions, builtins and globals are regenerated inside
    /// the thunk.
    Inline,
    /// Everything else travels in the capture record.
    Captured(&'a Local),
}

pub fn classify(value: &ssa::Value) -> Capture<'_> {
    match value {
        ssa::Value::Const(_) | ssa::Value::Function(_) | ssa::Value::Builtin(_) | ssa::Value::Global(_) => {
            Capture::Inline
        }
        ssa::Value::Local(local) => Capture::Captured(local),
    }
}

/// The deduplicated locals a call captures, in first-use order. Field `i`
/// of the record holds `fields[i]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureRecord {
    pub fields: Vec<Local>,
}

impl CaptureRecord {
    pub fn collect(call: &CallCommon) -> Self {
        let mut seen = FxHashSet::default();
        let mut fields = Vec::new();
        for operand in call.operands() {
            if let Capture::Captured(local) = classify(operand) {
                if seen.insert(local.id) {
                    fields.push(local.clone());
                }
            }
        }
        CaptureRecord { fields }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }
}

/// A synthesized thunk and the single argument to invoke it with.
#[derive(Debug, Clone, PartialEq)]
pub struct Thunk {
    /// The thunk function (`void (i8*)*`, or `i8*` after [`create_thunk`]).
    ///
    /// [`create_thunk`]: CodeGen::create_thunk
    pub function: Value,
    /// `i8*`: null, the smuggled recoverable flag, or the capture record.
    pub arg: Value,
}

/// The thunk's argument encoding, decided once per call.
enum ThunkArg {
    Null,
    RecoverFlag,
    Record(lir::Type),
}

impl CodeGen {
    /// Build a thunk for `call` and cast it to an opaque pointer, the form
    /// the defer runtime takes.
    pub fn create_thunk(&mut self, fr: &mut Frame, call: &CallInstruction) -> Result<Thunk, CodegenError> {
        let thunk = self.create_thunk_raw(fr, call)?;
        let function = fr.builder.build_bitcast(&thunk.function, lir::Type::opaque_ptr(), "thunk")?;
        Ok(Thunk {
            function,
            arg: thunk.arg,
        })
    }

    /// Build a thunk for `call`. Emits the argument packing into `fr` and
    /// defines the thunk in the module; the thunk keeps its `void (i8*)*`
    /// type.
    pub fn create_thunk_raw(&mut self, fr: &mut Frame, call: &CallInstruction) -> Result<Thunk, CodegenError> {
        let record = CaptureRecord::collect(&call.common);
        let is_recover = call.common.is_builtin(Builtin::Recover);
        let deferred = call.kind == CallKind::Defer;
        let opaque = lir::Type::opaque_ptr();
        let int_ptr = self.layout.int_ptr_type();

        // ── Argument, in the creating frame ──────────────────────────

        let (encoding, arg) = if record.is_empty() && is_recover {
            let flag = fr.can_recover().clone();
            let word = fr.builder.build_cast(CastOp::ZExt, &flag, int_ptr.clone(), "canrecover")?;
            let arg = fr.builder.build_cast(CastOp::IntToPtr, &word, opaque.clone(), "thunkarg")?;
            (ThunkArg::RecoverFlag, arg)
        } else if record.is_empty() {
            (ThunkArg::Null, Value::null(opaque.clone()))
        } else {
            let field_tys: Vec<lir::Type> = record
                .fields
                .iter()
                .map(|local| self.layout.lir_type(&local.ty))
                .collect();
            let record_ty = lir::Type::Struct(field_tys.clone());
            let ptr = self.create_type_malloc(fr, &record_ty)?;
            for (i, (local, field_ty)) in record.fields.iter().zip(&field_tys).enumerate() {
                let value = self.resolve_value(fr, &ssa::Value::Local(local.clone()))?;
                if value.value.ty != *field_ty {
                    return Err(CodegenError::CaptureTypeMismatch {
                        name: local.name.clone(),
                        expected: field_ty.to_string(),
                        found: value.value.ty.to_string(),
                    });
                }
                let field = fr.builder.build_struct_gep(&ptr, i as u32, "")?;
                fr.builder.build_store(&value.value, &field)?;
            }
            let arg = fr.builder.build_bitcast(&ptr, opaque.clone(), "thunkarg")?;
            (ThunkArg::Record(record_ty), arg)
        };

        // ── The thunk itself ─────────────────────────────────────────

        let name = self.next_symbol("__thunk");
        debug!(
            thunk = %name,
            captures = record.len(),
            deferred,
            recover = is_recover,
            "synthesize thunk"
        );
        let builder = FunctionBuilder::new(name, FnType::new(vec![opaque], lir::Type::Void), Linkage::Internal);
        let mut thunk_fr = Frame::new(builder);
        let prologue = thunk_fr.builder.append_block("prologue");
        thunk_fr.builder.position_at_end(prologue);
        let param = thunk_fr.builder.param(0)?;

        match &encoding {
            ThunkArg::RecoverFlag => {
                let word = thunk_fr.builder.build_cast(CastOp::PtrToInt, &param, int_ptr, "")?;
                let flag = thunk_fr.builder.build_cast(CastOp::Trunc, &word, lir::Type::i1(), "canrecover")?;
                thunk_fr.set_can_recover(flag);
            }
            ThunkArg::Record(record_ty) => {
                let ptr = thunk_fr.builder.build_bitcast(&param, record_ty.clone().ptr_to(), "record")?;
                for (i, local) in record.fields.iter().enumerate() {
                    let field = thunk_fr.builder.build_struct_gep(&ptr, i as u32, "")?;
                    let value = thunk_fr.builder.build_load(&field, &local.name)?;
                    thunk_fr.bind(local, TypedValue::new(value, local.ty.clone()));
                }
            }
            ThunkArg::Null => {}
        }

        let entry = thunk_fr.builder.append_block("entry");
        thunk_fr.builder.build_br(entry)?;
        thunk_fr.builder.set_alloca_block(prologue);
        thunk_fr.builder.position_at_end(entry);

        let exit = if deferred {
            let exit = thunk_fr.builder.append_block("exit");
            let retaddr = thunk_fr.builder.block_address(exit);
            self.call_runtime(&mut thunk_fr, "strand_defer_set_retaddr", &[retaddr], "")?;
            Some(exit)
        } else {
            None
        };

        if deferred && is_recover {
            self.codegen_recover(&mut thunk_fr, true)?;
        } else {
            self.codegen_call_common(&mut thunk_fr, &call.common)?;
        }

        if let Some(exit) = exit {
            thunk_fr.builder.build_br(exit)?;
            thunk_fr.builder.position_at_end(exit);
        }
        thunk_fr.builder.build_return(None)?;

        let function = self.finish_frame(thunk_fr)?;
        Ok(Thunk { function, arg })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::CodegenOptions;
    use crate::ssa::{Signature, Ty};

    fn codegen() -> CodeGen {
        CodeGen::new(CodegenOptions::default()).unwrap()
    }

    #[test]
    fn test_classify_operands() {
        assert_eq!(classify(&ssa::Value::int(Ty::int(), 1)), Capture::Inline);
        assert_eq!(classify(&ssa::Value::Builtin(Builtin::Close)), Capture::Inline);
        assert_eq!(classify(&ssa::Value::global("g", Ty::Bool)), Capture::Inline);
        let local = Local::new(3, "x", Ty::Bool);
        let value = ssa::Value::Local(local.clone());
        assert_eq!(classify(&value), Capture::Captured(&local));
    }

    #[test]
    fn test_capture_record_dedups_in_first_use_order() {
        let x = ssa::Value::local(1, "x", Ty::int());
        let y = ssa::Value::local(2, "y", Ty::Bool);
        let f = ssa::Value::function("f", Signature::new(vec![Ty::int(), Ty::Bool, Ty::int()], None));
        let call = CallCommon::new(f, vec![x.clone(), y, x, ssa::Value::int(Ty::int(), 4)]);
        let record = CaptureRecord::collect(&call);
        let names: Vec<_> = record.fields.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["x", "y"]);
    }

    #[test]
    fn test_capture_less_thunk_gets_null() {
        let mut cg = codegen();
        let mut fr = cg.new_frame("main", &Signature::new(vec![], None), &[]).unwrap();
        let f = ssa::Value::function("tick", Signature::new(vec![Ty::int()], None));
        let call = CallInstruction::go(CallCommon::new(f, vec![ssa::Value::int(Ty::int(), 1)]));
        let thunk = cg.create_thunk_raw(&mut fr, &call).unwrap();
        assert_eq!(thunk.arg, Value::null(lir::Type::opaque_ptr()));
        fr.builder.build_return(None).unwrap();
        cg.finish_frame(fr).unwrap();
        cg.verify().unwrap();

        let thunk_fn = cg.module().get_function("__thunk.0").unwrap();
        insta::assert_snapshot!(thunk_fn.to_string(), @r"
        define internal void @__thunk.0(i8* %p0) {
        prologue:
          br label %entry

        entry:
          call void @tick(i64 1)
          ret void
        }
        ");
    }

    #[test]
    fn test_deferred_thunk_records_resumption_point() {
        let mut cg = codegen();
        let ch = Local::new(0, "ch", Ty::chan(Ty::int()));
        let sig = Signature::new(vec![ch.ty.clone()], None);
        let mut fr = cg.new_frame("main", &sig, &[ch.clone()]).unwrap();
        let call = CallInstruction::defer(CallCommon::builtin(Builtin::Close, vec![ssa::Value::Local(ch)]));
        let thunk = cg.create_thunk_raw(&mut fr, &call).unwrap();
        assert_eq!(thunk.arg.ty, lir::Type::opaque_ptr());
        fr.builder.build_return(None).unwrap();
        cg.finish_frame(fr).unwrap();
        cg.verify().unwrap();

        let thunk_fn = cg.module().get_function("__thunk.0").unwrap();
        insta::assert_snapshot!(thunk_fn.to_string(), @r"
        define internal void @__thunk.0(i8* %p0) {
        prologue:
          %record = bitcast i8* %p0 to { i8* }*
          %t = getelementptr inbounds { i8* }, { i8* }* %record, i32 0, i32 0
          %ch = load i8*, i8** %t
          br label %entry

        entry:
          call void @strand_defer_set_retaddr(i8* blockaddress(@__thunk.0, %exit))
          call void @strand_chan_close(i8* %ch)
          br label %exit

        exit:
          ret void
        }
        ");
    }

    #[test]
    fn test_record_is_heap_allocated_in_creating_frame() {
        let mut cg = codegen();
        let x = Local::new(0, "x", Ty::int32());
        let sig = Signature::new(vec![x.ty.clone()], None);
        let mut fr = cg.new_frame("main", &sig, &[x.clone()]).unwrap();
        let f = ssa::Value::function("use2", Signature::new(vec![Ty::int32(), Ty::int32()], None));
        let xv = ssa::Value::Local(x);
        let call = CallInstruction::go(CallCommon::new(f, vec![xv.clone(), xv]));
        cg.create_thunk_raw(&mut fr, &call).unwrap();
        fr.builder.build_return(None).unwrap();
        cg.finish_frame(fr).unwrap();
        let ir = cg.get_ir();
        assert!(ir.contains("%alloc = call i8* @strand_gc_alloc(i64 4, i64 4)"), "{}", ir);
        assert!(ir.contains("store i32 %p0, i32* %t1"), "Should store the capture once: {}", ir);
        assert_eq!(ir.matches("store i32 %p0").count(), 1, "{}", ir);
        assert!(ir.contains("call void @use2(i32 %x, i32 %x)"), "Both uses read one field: {}", ir);
    }

    #[test]
    fn test_recover_thunk_smuggles_flag() {
        let mut cg = codegen();
        let mut fr = cg.new_frame("main", &Signature::new(vec![], None), &[]).unwrap();
        let call = CallInstruction::defer(CallCommon::builtin(Builtin::Recover, vec![]));
        let thunk = cg.create_thunk_raw(&mut fr, &call).unwrap();
        assert_eq!(thunk.arg.ty, lir::Type::opaque_ptr());
        fr.builder.build_return(None).unwrap();
        cg.finish_frame(fr).unwrap();
        cg.verify().unwrap();
        let ir = cg.get_ir();
        assert!(ir.contains("%canrecover = zext i1 false to i64"), "{}", ir);
        assert!(ir.contains("%thunkarg = inttoptr i64 %canrecover to i8*"), "{}", ir);
        assert!(ir.contains("%canrecover = trunc i64 %t to i1"), "Thunk decodes the flag: {}", ir);
        assert!(ir.contains("call i8* @strand_deferred_recover()"), "{}", ir);
    }

    #[test]
    fn test_capture_type_mismatch_is_fatal() {
        let mut cg = codegen();
        let x = Local::new(0, "x", Ty::int32());
        let sig = Signature::new(vec![x.ty.clone()], None);
        let mut fr = cg.new_frame("main", &sig, &[x]).unwrap();
        // The same local, claimed to be 64 bits wide by a stale SSA value.
        let stale = ssa::Value::local(0, "x", Ty::int());
        let f = ssa::Value::function("g", Signature::new(vec![Ty::int()], None));
        let call = CallInstruction::go(CallCommon::new(f, vec![stale]));
        let err = cg.create_thunk_raw(&mut fr, &call).unwrap_err();
        assert_eq!(
            err,
            CodegenError::CaptureTypeMismatch {
                name: "x".into(),
                expected: "i64".into(),
                found: "i32".into(),
            }
        );
    }
}
