//! Call lowering: plain calls, builtins, `defer`, `go` and `recover`.

use tracing::debug;

use crate::error::CodegenError;
use crate::lir::{self, BuildError, Value};
use crate::ssa::{self, Builtin, CallCommon, CallInstruction, CallKind, Ty};

use super::{CodeGen, Frame, TypedValue};

impl CodeGen {
    /// Lower a call instruction of any kind. Only plain calls produce a
    /// value.
    pub fn codegen_call_instruction(
        &mut self,
        fr: &mut Frame,
        call: &CallInstruction,
    ) -> Result<Option<TypedValue>, CodegenError> {
        match call.kind {
            CallKind::Call => self.codegen_call_common(fr, &call.common),
            CallKind::Defer => self.codegen_defer(fr, call).map(|_| None),
            CallKind::Go => self.codegen_go(fr, call).map(|_| None),
        }
    }

    /// Emit the call itself: a builtin, a direct call to a named function,
    /// or an indirect call through a function value.
    pub fn codegen_call_common(
        &mut self,
        fr: &mut Frame,
        call: &CallCommon,
    ) -> Result<Option<TypedValue>, CodegenError> {
        if let ssa::Value::Builtin(builtin) = &call.callee {
            return self.codegen_builtin(fr, *builtin, &call.args);
        }
        let callee = self.resolve_value(fr, &call.callee)?;
        let sig = match &callee.ty {
            Ty::Func(sig) => sig.clone(),
            other => {
                return Err(CodegenError::UnexpectedType {
                    op: "call",
                    expected: "function",
                    found: other.clone(),
                })
            }
        };
        if sig.params.len() != call.args.len() {
            return Err(CodegenError::Internal(format!(
                "call passes {} arguments to a function taking {}",
                call.args.len(),
                sig.params.len()
            )));
        }
        let mut args = Vec::with_capacity(call.args.len());
        for (arg, param) in call.args.iter().zip(&sig.params) {
            let value = self.resolve_value(fr, arg)?;
            args.push(self.convert(fr, value, param)?.value);
        }
        let result = fr.builder.build_call(&callee.value, &args, "call")?;
        Ok(match (result, sig.result) {
            (Some(value), Some(ty)) => Some(TypedValue::new(value, *ty)),
            _ => None,
        })
    }

    pub fn codegen_builtin(
        &mut self,
        fr: &mut Frame,
        builtin: Builtin,
        args: &[ssa::Value],
    ) -> Result<Option<TypedValue>, CodegenError> {
        let expected = match builtin {
            Builtin::Recover => 0,
            Builtin::Close | Builtin::Panic => 1,
        };
        if args.len() != expected {
            return Err(CodegenError::Internal(format!(
                "builtin {builtin:?} takes {expected} arguments, got {}",
                args.len()
            )));
        }
        match builtin {
            Builtin::Recover => self.codegen_recover(fr, false).map(Some),
            Builtin::Close => self.codegen_chan_close(fr, &args[0]).map(|_| None),
            Builtin::Panic => self.codegen_panic(fr, &args[0]).map(|_| None),
        }
    }

    /// `recover()`: ask the runtime only when the frame may recover,
    /// otherwise yield null.
    pub fn codegen_recover(&mut self, fr: &mut Frame, deferred: bool) -> Result<TypedValue, CodegenError> {
        let opaque = lir::Type::opaque_ptr();
        let flag = fr.can_recover().clone();
        let from = fr.builder.current_block().ok_or(BuildError::NoInsertBlock)?;
        let recover_bb = fr.builder.append_block("recover");
        let cont = fr.builder.append_block("recover.cont");
        fr.builder.build_cond_br(&flag, recover_bb, cont)?;

        fr.builder.position_at_end(recover_bb);
        let runtime = if deferred {
            "strand_deferred_recover"
        } else {
            "strand_recover"
        };
        let recovered = self.call_runtime_value(fr, runtime, &[], "recovered")?;
        fr.builder.build_br(cont)?;

        fr.builder.position_at_end(cont);
        let incoming = [(recovered, recover_bb), (Value::null(opaque.clone()), from)];
        let value = fr.builder.build_phi(opaque, &incoming, "recover.value")?;
        Ok(TypedValue::new(value, Ty::UnsafePointer))
    }

    /// `panic(v)`: spill `v` and hand it to the runtime with its descriptor.
    pub fn codegen_panic(&mut self, fr: &mut Frame, value: &ssa::Value) -> Result<(), CodegenError> {
        let value = self.resolve_value(fr, value)?;
        let ptr = self.spill(fr, &value.value, "panic")?;
        let tydesc = self.type_descriptor(fr, &value.ty)?;
        self.call_runtime(fr, "strand_panic", &[tydesc, ptr], "")?;
        Ok(())
    }

    /// `defer f(args)`: push a thunk onto the current function's defer list.
    pub fn codegen_defer(&mut self, fr: &mut Frame, call: &CallInstruction) -> Result<(), CodegenError> {
        let thunk = self.create_thunk(fr, call)?;
        self.call_runtime(fr, "strand_defer", &[thunk.function, thunk.arg], "")?;
        Ok(())
    }

    /// `go f(args)`: start a native thread running the call.
    pub fn codegen_go(&mut self, fr: &mut Frame, call: &CallInstruction) -> Result<(), CodegenError> {
        let thunk = self.create_thunk_raw(fr, call)?;
        let entry = self.create_thread_entry(&thunk.function)?;
        debug!(entry = %entry, "spawn thread");
        let entry = fr.builder.build_bitcast(&entry, lir::Type::opaque_ptr(), "threadentry")?;
        self.call_runtime(fr, "strand_thread_create", &[entry, thunk.arg], "")?;
        Ok(())
    }

    /// Run the current function's pending deferred calls, newest first.
    /// Emitted in function epilogues.
    pub fn codegen_undefer(&mut self, fr: &mut Frame) -> Result<(), CodegenError> {
        self.call_runtime(fr, "strand_undefer", &[], "")?;
        Ok(())
    }
}
