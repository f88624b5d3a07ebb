//! Concurrency lowering from SSA into LIR.
//!
//! This module implements the lowering of channel operations, select
//! statements, and deferred/spawned calls into calls to the Strand runtime
//! plus synthesized helper functions.
//!
//! ## Architecture
//!
//! - [`CodeGen`]: Main codegen struct holding the module, options and layout
//! - [`frame`]: Per-function state ([`Frame`], [`TypedValue`])
//! - [`types`]: Ty to LIR type mapping
//! - [`intrinsics`]: Runtime function declarations
//! - [`channels`]: make, send, receive (FIFO and generic backends), close
//! - [`select`]: Multi-way select
//! - [`thunk`]: Thunk synthesis for `defer` and `go`
//! - [`thread`]: Native thread entry adapters
//! - [`calls`]: Call, builtin, defer, go and recover lowering

pub mod calls;
pub mod channels;
pub mod frame;
pub mod intrinsics;
pub mod select;
pub mod thread;
pub mod thunk;
pub mod types;

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::error::CodegenError;
use crate::lir::{
    self, sign_extend, CastOp, Global, GlobalInit, Linkage, Module, TypeDescriptor, Value,
};
use crate::options::CodegenOptions;
use crate::ssa::{self, ConstValue, FuncRef, Local, Signature, Ty};

pub use self::frame::{Frame, TypedValue};
use self::intrinsics::{declare_intrinsics, get_intrinsic};
use self::types::TypeLayout;

// ── CodeGen ──────────────────────────────────────────────────────────

/// The lowering context for one module.
///
/// Holds the module under construction and everything shared between the
/// functions lowered into it. Per-function state lives in [`Frame`]s,
/// which are passed into every lowering operation alongside `&mut self`.
pub struct CodeGen {
    /// The module being built.
    pub(crate) module: Module,
    pub(crate) options: CodegenOptions,
    pub(crate) layout: TypeLayout,
    /// Counters for synthesized function names, keyed by prefix.
    name_counters: FxHashMap<&'static str, u32>,
}

impl CodeGen {
    /// Create a codegen context with all runtime functions declared.
    pub fn new(options: CodegenOptions) -> Result<Self, CodegenError> {
        options.validate()?;
        let layout = TypeLayout::new(options.pointer_bits);
        let mut module = Module::new(options.module_name.clone());
        declare_intrinsics(&mut module, &layout)?;
        Ok(CodeGen {
            module,
            options,
            layout,
            name_counters: FxHashMap::default(),
        })
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn options(&self) -> &CodegenOptions {
        &self.options
    }

    pub fn layout(&self) -> &TypeLayout {
        &self.layout
    }

    /// The module as LLVM-style assembly text.
    pub fn get_ir(&self) -> String {
        self.module.to_string()
    }

    pub fn verify(&self) -> Result<(), CodegenError> {
        lir::verify_module(&self.module)?;
        Ok(())
    }

    /// Verify and hand back the finished module.
    pub fn into_module(self) -> Result<Module, CodegenError> {
        self.verify()?;
        Ok(self.module)
    }

    /// A fresh name for a synthesized function, e.g. `__thunk.3`.
    pub(crate) fn next_symbol(&mut self, prefix: &'static str) -> String {
        let counter = self.name_counters.entry(prefix).or_insert(0);
        let name = format!("{prefix}.{counter}");
        *counter += 1;
        name
    }

    // ── Frames ───────────────────────────────────────────────────────

    /// Start lowering a source function. Its parameters are bound to the
    /// given locals and the builder is positioned in the `entry` block.
    pub fn new_frame(
        &mut self,
        name: &str,
        sig: &Signature,
        params: &[Local],
    ) -> Result<Frame, CodegenError> {
        if params.len() != sig.params.len() {
            return Err(CodegenError::Internal(format!(
                "function `{name}` has {} parameters but {} locals were bound",
                sig.params.len(),
                params.len()
            )));
        }
        let builder = lir::FunctionBuilder::new(name, self.layout.fn_type(sig), Linkage::External);
        let mut fr = Frame::new(builder);
        let entry = fr.builder.append_block("entry");
        fr.builder.position_at_end(entry);
        for (i, local) in params.iter().enumerate() {
            let value = fr.builder.param(i as u32)?;
            fr.bind(local, TypedValue::new(value, local.ty.clone()));
        }
        Ok(fr)
    }

    /// Add the frame's function to the module.
    pub fn finish_frame(&mut self, fr: Frame) -> Result<Value, CodegenError> {
        Ok(self.module.define_function(fr.finish())?)
    }

    /// Declare a source function in the module (idempotent).
    pub fn declare_function(&mut self, func: &FuncRef) -> Result<Value, CodegenError> {
        let ty = self.layout.fn_type(&func.sig);
        Ok(self.module.declare_function(&func.name, ty, &[])?)
    }

    // ── Values ───────────────────────────────────────────────────────

    /// Produce the generated value for an SSA value in frame `fr`.
    ///
    /// Locals come from the frame's environment; constants, functions and
    /// globals are regenerated on the spot.
    pub fn resolve_value(&mut self, fr: &mut Frame, value: &ssa::Value) -> Result<TypedValue, CodegenError> {
        match value {
            ssa::Value::Local(local) => fr
                .lookup(local.id)
                .cloned()
                .ok_or_else(|| CodegenError::UnboundValue(local.name.clone())),
            ssa::Value::Const(c) => {
                let lir_ty = self.layout.lir_type(&c.ty);
                let v = match (&c.value, &lir_ty) {
                    (ConstValue::Int(v), lir::Type::Int(bits)) => Value::const_int(*bits, *v),
                    (ConstValue::Int(v), ty) if ty.is_float() => Value::const_float(lir_ty.clone(), *v as f64),
                    (ConstValue::Bool(b), _) => Value::const_bool(*b),
                    (ConstValue::Float(v), ty) if ty.is_float() => Value::const_float(lir_ty.clone(), *v),
                    (ConstValue::Nil, ty) if ty.is_pointer() => Value::null(lir_ty.clone()),
                    _ => {
                        return Err(CodegenError::UnexpectedType {
                            op: "constant",
                            expected: "matching",
                            found: c.ty.clone(),
                        })
                    }
                };
                Ok(TypedValue::new(v, c.ty.clone()))
            }
            ssa::Value::Function(func) => {
                let v = self.declare_function(func)?;
                Ok(TypedValue::new(v, Ty::Func(func.sig.clone())))
            }
            ssa::Value::Global(global) => {
                let v = self.module.add_global(Global {
                    name: global.name.clone(),
                    ty: self.layout.lir_type(&global.elem),
                    init: GlobalInit::Zero,
                    constant: false,
                });
                Ok(TypedValue::new(v, Ty::pointer(global.elem.clone())))
            }
            ssa::Value::Builtin(builtin) => Err(CodegenError::BuiltinAsValue(*builtin)),
        }
    }

    /// Convert a value to another source type with the same meaning:
    /// integer width changes, float precision changes, pointer casts, and
    /// retypings that keep the generated representation (channel
    /// direction, for example).
    pub fn convert(&mut self, fr: &mut Frame, tv: TypedValue, to: &Ty) -> Result<TypedValue, CodegenError> {
        if tv.ty == *to {
            return Ok(tv);
        }
        let target = self.layout.lir_type(to);
        let value = match (&tv.ty, to) {
            (from, _) if from.is_integer() && to.is_integer() => {
                let bits = target.int_bits().unwrap_or(64);
                match tv.value.as_const_int() {
                    Some(raw) => {
                        let from_bits = tv.value.ty.int_bits().unwrap_or(64);
                        let widened = if from.is_signed() {
                            sign_extend(raw, from_bits)
                        } else {
                            raw as i64
                        };
                        Value::const_int(bits, widened)
                    }
                    None => fr.builder.build_int_resize(&tv.value, bits, from.is_signed(), "conv")?,
                }
            }
            (Ty::Float32, Ty::Float64) => fr.builder.build_cast(CastOp::FpExt, &tv.value, target, "conv")?,
            (Ty::Float64, Ty::Float32) => fr.builder.build_cast(CastOp::FpTrunc, &tv.value, target, "conv")?,
            _ if tv.value.ty == target => tv.value,
            (Ty::UnsafePointer | Ty::Pointer(_), Ty::UnsafePointer | Ty::Pointer(_)) => {
                fr.builder.build_bitcast(&tv.value, target, "conv")?
            }
            _ => {
                return Err(CodegenError::UnsupportedConversion {
                    from: tv.ty.clone(),
                    to: to.clone(),
                })
            }
        };
        Ok(TypedValue::new(value, to.clone()))
    }

    // ── Runtime helpers ──────────────────────────────────────────────

    /// Emit a call to a declared runtime function.
    pub(crate) fn call_runtime(
        &mut self,
        fr: &mut Frame,
        name: &str,
        args: &[Value],
        result_name: &str,
    ) -> Result<Option<Value>, CodegenError> {
        let callee = get_intrinsic(&self.module, name)?;
        trace!(runtime = name, args = args.len(), "emit runtime call");
        Ok(fr.builder.build_call(&callee, args, result_name)?)
    }

    /// Like [`call_runtime`](Self::call_runtime) for functions that return
    /// a value.
    pub(crate) fn call_runtime_value(
        &mut self,
        fr: &mut Frame,
        name: &str,
        args: &[Value],
        result_name: &str,
    ) -> Result<Value, CodegenError> {
        self.call_runtime(fr, name, args, result_name)?
            .ok_or_else(|| CodegenError::Internal(format!("runtime function `{name}` returns void")))
    }

    /// Store a value into a fresh entry-block slot and return the slot's
    /// address as an opaque pointer.
    pub(crate) fn spill(&mut self, fr: &mut Frame, value: &Value, name: &str) -> Result<Value, CodegenError> {
        let slot = fr.builder.build_entry_alloca(value.ty.clone(), name)?;
        fr.builder.build_store(value, &slot)?;
        Ok(fr.builder.build_bitcast(&slot, lir::Type::opaque_ptr(), "")?)
    }

    /// Allocate a `ty` on the runtime heap and return a typed pointer to it.
    pub fn create_type_malloc(&mut self, fr: &mut Frame, ty: &lir::Type) -> Result<Value, CodegenError> {
        let size = Value::const_int(64, self.layout.lir_size_of(ty) as i64);
        let align = Value::const_int(64, self.layout.lir_align_of(ty) as i64);
        let raw = self.call_runtime_value(fr, "strand_gc_alloc", &[size, align], "alloc")?;
        Ok(fr.builder.build_bitcast(&raw, ty.clone().ptr_to(), "")?)
    }

    /// The runtime type descriptor for `ty` as an opaque pointer.
    pub fn type_descriptor(&mut self, fr: &mut Frame, ty: &Ty) -> Result<Value, CodegenError> {
        let name = self.descriptor_global(ty);
        let global = Value::global(name, TypeDescriptor::layout());
        Ok(fr.builder.build_bitcast(&global, lir::Type::opaque_ptr(), "tydesc")?)
    }

    /// Define (once) the descriptor global for `ty` and those it refers to.
    fn descriptor_global(&mut self, ty: &Ty) -> String {
        let name = format!("__tydesc.{}", ty.mangle());
        if self.module.get_global(&name).is_some() {
            return name;
        }
        let elem = match ty {
            Ty::Pointer(elem) | Ty::Chan { elem, .. } => Some(self.descriptor_global(elem)),
            _ => None,
        };
        let desc = TypeDescriptor {
            kind: self.layout.descriptor_kind(ty),
            size: self.layout.size_of(ty),
            align: self.layout.align_of(ty),
            elem,
        };
        self.module.add_global(Global {
            name: name.clone(),
            ty: TypeDescriptor::layout(),
            init: GlobalInit::TypeDescriptor(desc),
            constant: true,
        });
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codegen() -> CodeGen {
        CodeGen::new(CodegenOptions::default()).unwrap()
    }

    #[test]
    fn test_rejects_invalid_options() {
        let options = CodegenOptions {
            pointer_bits: 16,
            ..CodegenOptions::default()
        };
        assert!(matches!(CodeGen::new(options), Err(CodegenError::InvalidOptions(_))));
    }

    #[test]
    fn test_unbound_local_is_an_error() {
        let mut cg = codegen();
        let mut fr = cg.new_frame("f", &Signature::new(vec![], None), &[]).unwrap();
        let err = cg
            .resolve_value(&mut fr, &ssa::Value::local(9, "x", Ty::int()))
            .unwrap_err();
        assert_eq!(err, CodegenError::UnboundValue("x".into()));
    }

    #[test]
    fn test_constant_conversion_folds() {
        let mut cg = codegen();
        let mut fr = cg.new_frame("f", &Signature::new(vec![], None), &[]).unwrap();
        let c = cg.resolve_value(&mut fr, &ssa::Value::int(Ty::int32(), -2)).unwrap();
        let wide = cg.convert(&mut fr, c, &Ty::int()).unwrap();
        assert_eq!(wide.value, Value::const_int(64, -2));
        assert_eq!(fr.builder.finish().blocks[0].insts.len(), 0);
    }

    #[test]
    fn test_local_conversion_emits_cast() {
        let mut cg = codegen();
        let x = Local::new(0, "x", Ty::uint8());
        let sig = Signature::new(vec![Ty::uint8()], None);
        let mut fr = cg.new_frame("f", &sig, &[x.clone()]).unwrap();
        let tv = cg.resolve_value(&mut fr, &ssa::Value::Local(x)).unwrap();
        let wide = cg.convert(&mut fr, tv, &Ty::Uintptr).unwrap();
        fr.builder.build_return(None).unwrap();
        cg.finish_frame(fr).unwrap();
        assert_eq!(wide.value.ty, lir::Type::i64());
        let ir = cg.get_ir();
        assert!(ir.contains("%conv = zext i8 %p0 to i64"), "Should zero-extend unsigned: {}", ir);
    }

    #[test]
    fn test_bad_conversion_is_reported() {
        let mut cg = codegen();
        let mut fr = cg.new_frame("f", &Signature::new(vec![], None), &[]).unwrap();
        let b = cg.resolve_value(&mut fr, &ssa::Value::bool(true)).unwrap();
        assert!(matches!(
            cg.convert(&mut fr, b, &Ty::Float64),
            Err(CodegenError::UnsupportedConversion { .. })
        ));
    }

    #[test]
    fn test_channel_descriptor_points_at_element() {
        let mut cg = codegen();
        let mut fr = cg.new_frame("f", &Signature::new(vec![], None), &[]).unwrap();
        cg.type_descriptor(&mut fr, &Ty::chan(Ty::int32())).unwrap();
        let ir = cg.get_ir();
        assert!(
            ir.contains("@__tydesc.i32 = internal constant { i8, i64, i64, i8* } { i8 2, i64 4, i64 4, i8* null }"),
            "Should define the element descriptor: {}",
            ir
        );
        assert!(
            ir.contains("@__tydesc.chan.i32 = internal constant { i8, i64, i64, i8* } { i8 8, i64 8, i64 8, i8* bitcast ({ i8, i64, i64, i8* }* @__tydesc.i32 to i8*) }"),
            "Should link the channel descriptor to its element: {}",
            ir
        );
    }

    #[test]
    fn test_globals_resolve_to_addresses() {
        let mut cg = codegen();
        let mut fr = cg.new_frame("f", &Signature::new(vec![], None), &[]).unwrap();
        let g = cg
            .resolve_value(&mut fr, &ssa::Value::global("counter", Ty::int()))
            .unwrap();
        assert_eq!(g.ty, Ty::pointer(Ty::int()));
        assert_eq!(g.value.ty, lir::Type::i64().ptr_to());
        assert!(cg.get_ir().contains("@counter = global i64 zeroinitializer"));
    }

    #[test]
    fn test_synthesized_names_count_per_prefix() {
        let mut cg = codegen();
        assert_eq!(cg.next_symbol("__thunk"), "__thunk.0");
        assert_eq!(cg.next_symbol("__thunk"), "__thunk.1");
        assert_eq!(cg.next_symbol("__thread_entry"), "__thread_entry.0");
    }
}
