//! Native thread entry adapters.
//!
//! Native thread creation wants an `i8* (i8*)` entry point, while thunks are
//! `void (i8*)`. The adapter calls the thunk with its own argument, ends the
//! thread through the runtime, and returns null so the function is well
//! formed even though the exit call never returns.

use tracing::debug;

use crate::error::CodegenError;
use crate::lir::{self, FnType, FunctionBuilder, Linkage, Value};

use super::{CodeGen, Frame};

impl CodeGen {
    /// Define a thread entry adapter around `thunk` (a `void (i8*)*`).
    pub fn create_thread_entry(&mut self, thunk: &Value) -> Result<Value, CodegenError> {
        let opaque = lir::Type::opaque_ptr();
        let thunk_ty = FnType::new(vec![opaque.clone()], lir::Type::Void);
        if thunk.ty.as_fn_ptr() != Some(&thunk_ty) {
            return Err(CodegenError::Internal(format!(
                "thread entry needs a `void (i8*)*` thunk, found `{}`",
                thunk.ty
            )));
        }

        let name = self.next_symbol("__thread_entry");
        debug!(entry = %name, thunk = %thunk, "synthesize thread entry");
        let ty = FnType::new(vec![opaque.clone()], opaque.clone());
        let mut wrap_fr = Frame::new(FunctionBuilder::new(name, ty, Linkage::Internal));
        let entry = wrap_fr.builder.append_block("entry");
        wrap_fr.builder.position_at_end(entry);

        let arg = wrap_fr.builder.param(0)?;
        wrap_fr.builder.build_call(thunk, &[arg], "")?;
        let null = Value::null(opaque);
        self.call_runtime(&mut wrap_fr, "strand_thread_exit", &[null.clone()], "")?;
        wrap_fr.builder.build_return(Some(&null))?;

        self.finish_frame(wrap_fr)
    }
}
