//! Translation of LIR modules into LLVM modules via inkwell.
//!
//! LIR keeps typed pointers for readability and for the simulator; LLVM 21
//! only has opaque pointers, so every `T*` becomes `ptr` and pointer to
//! pointer bitcasts disappear. Pointee types needed by `load`, `alloca` and
//! `getelementptr` are taken from the LIR operand types.
//!
//! Blocks are translated in order. Phi nodes are created empty on first
//! sight and their incoming edges are filled in once every instruction of
//! the function has a value, so forward references across blocks are fine.

use inkwell::attributes::{Attribute, AttributeLoc};
use inkwell::basic_block::BasicBlock;
use inkwell::builder::Builder;
use inkwell::context::Context;
use inkwell::module::{Linkage as LlvmLinkage, Module};
use inkwell::types::{BasicMetadataTypeEnum, BasicType, BasicTypeEnum, FunctionType};
use inkwell::values::{
    BasicMetadataValueEnum, BasicValue, BasicValueEnum, FunctionValue, PhiValue, PointerValue,
};
use inkwell::AddressSpace;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::lir::{
    self, CastOp, FnAttr, FnType, GlobalInit, InstId, InstKind, Linkage, ValueKind,
};

/// Emits LIR modules into one LLVM module.
pub struct LlvmEmitter<'ctx> {
    context: &'ctx Context,
    module: Module<'ctx>,
    builder: Builder<'ctx>,
}

/// Per-function translation state.
struct FnState<'ctx> {
    function: FunctionValue<'ctx>,
    blocks: Vec<BasicBlock<'ctx>>,
    values: FxHashMap<InstId, BasicValueEnum<'ctx>>,
    pending_phis: Vec<(PhiValue<'ctx>, Vec<(lir::Value, lir::BlockId)>)>,
}

impl<'ctx> LlvmEmitter<'ctx> {
    pub fn new(context: &'ctx Context, module_name: &str) -> Self {
        LlvmEmitter {
            context,
            module: context.create_module(module_name),
            builder: context.create_builder(),
        }
    }

    pub fn module(&self) -> &Module<'ctx> {
        &self.module
    }

    /// Get the LLVM IR as a string.
    pub fn get_ir(&self) -> String {
        self.module.print_to_string().to_string()
    }

    /// Translate `lir` and verify the result.
    pub fn emit(&mut self, lir: &lir::Module) -> Result<(), String> {
        // Step 1: Globals first, so descriptor initializers can refer to
        // each other regardless of order.
        for global in lir.globals() {
            let ty = self.basic_type(&global.ty)?;
            let g = self.module.add_global(ty, None, &global.name);
            g.set_constant(global.constant);
            // Descriptors are private to the module; program globals are not.
            if global.constant {
                g.set_linkage(LlvmLinkage::Internal);
            }
        }
        for global in lir.globals() {
            let init = match &global.init {
                GlobalInit::Zero => self.basic_type(&global.ty)?.const_zero(),
                GlobalInit::TypeDescriptor(desc) => self.descriptor_initializer(desc)?,
            };
            let g = self
                .module
                .get_global(&global.name)
                .ok_or_else(|| format!("global '{}' vanished", global.name))?;
            g.set_initializer(&init);
        }

        // Step 2: Forward-declare every function.
        for func in lir.functions() {
            let fn_ty = self.fn_type(&func.ty)?;
            let linkage = match func.linkage {
                Linkage::External => LlvmLinkage::External,
                Linkage::Internal => LlvmLinkage::Internal,
            };
            let fn_val = self.module.add_function(&func.name, fn_ty, Some(linkage));
            if func.has_attr(FnAttr::NoReturn) {
                let kind = Attribute::get_named_enum_kind_id("noreturn");
                fn_val.add_attribute(
                    AttributeLoc::Function,
                    self.context.create_enum_attribute(kind, 0),
                );
            }
        }

        // Step 3: Bodies.
        for func in lir.functions().iter().filter(|f| !f.is_declaration()) {
            self.emit_function(func)?;
        }

        debug!(module = %lir.name, "emitted LLVM module");
        self.module
            .verify()
            .map_err(|e| format!("LLVM module verification failed: {}", e))
    }

    // ── Types ────────────────────────────────────────────────────────

    fn basic_type(&self, ty: &lir::Type) -> Result<BasicTypeEnum<'ctx>, String> {
        Ok(match ty {
            lir::Type::Int(bits) => self.context.custom_width_int_type(*bits).into(),
            lir::Type::F32 => self.context.f32_type().into(),
            lir::Type::F64 => self.context.f64_type().into(),
            lir::Type::Ptr(_) => self.context.ptr_type(AddressSpace::default()).into(),
            lir::Type::Struct(fields) => {
                let fields = fields
                    .iter()
                    .map(|f| self.basic_type(f))
                    .collect::<Result<Vec<_>, _>>()?;
                self.context.struct_type(&fields, false).into()
            }
            lir::Type::Void | lir::Type::Func(_) => {
                return Err(format!("`{}` is not a first-class type", ty))
            }
        })
    }

    fn fn_type(&self, ty: &FnType) -> Result<FunctionType<'ctx>, String> {
        let params = ty
            .params
            .iter()
            .map(|p| self.basic_type(p).map(BasicMetadataTypeEnum::from))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(match &ty.ret {
            lir::Type::Void => self.context.void_type().fn_type(&params, false),
            ret => self.basic_type(ret)?.fn_type(&params, false),
        })
    }

    fn descriptor_initializer(
        &self,
        desc: &lir::TypeDescriptor,
    ) -> Result<BasicValueEnum<'ctx>, String> {
        let i64_ty = self.context.i64_type();
        let ptr_ty = self.context.ptr_type(AddressSpace::default());
        let elem = match &desc.elem {
            Some(name) => self
                .module
                .get_global(name)
                .ok_or_else(|| format!("descriptor element '{}' not found", name))?
                .as_pointer_value(),
            None => ptr_ty.const_null(),
        };
        let fields: [BasicValueEnum<'ctx>; 4] = [
            self.context
                .i8_type()
                .const_int(desc.kind.code() as u64, false)
                .into(),
            i64_ty.const_int(desc.size, false).into(),
            i64_ty.const_int(desc.align, false).into(),
            elem.into(),
        ];
        Ok(self.context.const_struct(&fields, false).into())
    }

    // ── Functions ────────────────────────────────────────────────────

    fn emit_function(&mut self, func: &lir::Function) -> Result<(), String> {
        let function = self
            .module
            .get_function(&func.name)
            .ok_or_else(|| format!("function '{}' not declared", func.name))?;
        let blocks = func
            .blocks
            .iter()
            .map(|b| self.context.append_basic_block(function, &b.name))
            .collect();
        let mut state = FnState {
            function,
            blocks,
            values: FxHashMap::default(),
            pending_phis: Vec::new(),
        };

        for (block, bb) in func.blocks.iter().zip(state.blocks.clone()) {
            self.builder.position_at_end(bb);
            for inst in &block.insts {
                self.emit_inst(&mut state, func, inst)?;
            }
        }

        for (phi, incoming) in std::mem::take(&mut state.pending_phis) {
            for (value, block) in incoming {
                let value = self.value(&state, func, &value)?;
                let bb = state.block(block)?;
                phi.add_incoming(&[(&value as &dyn BasicValue<'ctx>, bb)]);
            }
        }
        Ok(())
    }

    fn emit_inst(
        &mut self,
        state: &mut FnState<'ctx>,
        func: &lir::Function,
        inst: &lir::Inst,
    ) -> Result<(), String> {
        let name = inst.name.as_str();
        let result: Option<BasicValueEnum<'ctx>> = match &inst.kind {
            InstKind::Alloca { ty } => {
                let ty = self.basic_type(ty)?;
                let slot = self.builder.build_alloca(ty, name).map_err(|e| e.to_string())?;
                Some(slot.into())
            }
            InstKind::Load { ptr } => {
                let ty = self.basic_type(&inst.ty)?;
                let ptr = self.pointer(state, func, ptr)?;
                Some(self.builder.build_load(ty, ptr, name).map_err(|e| e.to_string())?)
            }
            InstKind::Store { value, ptr } => {
                let value = self.value(state, func, value)?;
                let ptr = self.pointer(state, func, ptr)?;
                self.builder.build_store(ptr, value).map_err(|e| e.to_string())?;
                None
            }
            InstKind::StructGep { ptr, index } => {
                let pointee = ptr
                    .ty
                    .pointee()
                    .ok_or_else(|| format!("getelementptr through non-pointer `{}`", ptr.ty))?;
                let struct_ty = self.basic_type(pointee)?;
                let ptr = self.pointer(state, func, ptr)?;
                let field = self
                    .builder
                    .build_struct_gep(struct_ty, ptr, *index, name)
                    .map_err(|e| e.to_string())?;
                Some(field.into())
            }
            InstKind::Cast { op, value } => Some(self.emit_cast(state, func, *op, value, &inst.ty, name)?),
            InstKind::Call { callee, args } => self.emit_call(state, func, callee, args, name)?,
            InstKind::Phi { incoming } => {
                let ty = self.basic_type(&inst.ty)?;
                let phi = self.builder.build_phi(ty, name).map_err(|e| e.to_string())?;
                state.pending_phis.push((phi, incoming.clone()));
                Some(phi.as_basic_value())
            }
            InstKind::Br { target } => {
                self.builder
                    .build_unconditional_branch(state.block(*target)?)
                    .map_err(|e| e.to_string())?;
                None
            }
            InstKind::CondBr {
                cond,
                then_block,
                else_block,
            } => {
                let cond = self.value(state, func, cond)?.into_int_value();
                self.builder
                    .build_conditional_branch(cond, state.block(*then_block)?, state.block(*else_block)?)
                    .map_err(|e| e.to_string())?;
                None
            }
            InstKind::Ret { value } => {
                match value {
                    Some(v) => {
                        let v = self.value(state, func, v)?;
                        self.builder.build_return(Some(&v)).map_err(|e| e.to_string())?;
                    }
                    None => {
                        self.builder.build_return(None).map_err(|e| e.to_string())?;
                    }
                }
                None
            }
            InstKind::Unreachable => {
                self.builder.build_unreachable().map_err(|e| e.to_string())?;
                None
            }
        };

        if let (Some(id), Some(value)) = (inst.id, result) {
            state.values.insert(id, value);
        }
        Ok(())
    }

    fn emit_cast(
        &self,
        state: &FnState<'ctx>,
        func: &lir::Function,
        op: CastOp,
        value: &lir::Value,
        to: &lir::Type,
        name: &str,
    ) -> Result<BasicValueEnum<'ctx>, String> {
        let v = self.value(state, func, value)?;
        let to_ty = self.basic_type(to)?;
        let b = &self.builder;
        let cast: BasicValueEnum<'ctx> = match op {
            CastOp::Trunc => b
                .build_int_truncate(v.into_int_value(), to_ty.into_int_type(), name)
                .map_err(|e| e.to_string())?
                .into(),
            CastOp::ZExt => b
                .build_int_z_extend(v.into_int_value(), to_ty.into_int_type(), name)
                .map_err(|e| e.to_string())?
                .into(),
            CastOp::SExt => b
                .build_int_s_extend(v.into_int_value(), to_ty.into_int_type(), name)
                .map_err(|e| e.to_string())?
                .into(),
            CastOp::FpTrunc => b
                .build_float_trunc(v.into_float_value(), to_ty.into_float_type(), name)
                .map_err(|e| e.to_string())?
                .into(),
            CastOp::FpExt => b
                .build_float_ext(v.into_float_value(), to_ty.into_float_type(), name)
                .map_err(|e| e.to_string())?
                .into(),
            CastOp::IntToPtr => b
                .build_int_to_ptr(v.into_int_value(), to_ty.into_pointer_type(), name)
                .map_err(|e| e.to_string())?
                .into(),
            CastOp::PtrToInt => b
                .build_ptr_to_int(v.into_pointer_value(), to_ty.into_int_type(), name)
                .map_err(|e| e.to_string())?
                .into(),
            // Pointer to pointer casts vanish under opaque pointers.
            CastOp::Bitcast if value.ty.is_pointer() && to.is_pointer() => v,
            CastOp::Bitcast => b.build_bit_cast(v, to_ty, name).map_err(|e| e.to_string())?,
        };
        Ok(cast)
    }

    fn emit_call(
        &self,
        state: &FnState<'ctx>,
        func: &lir::Function,
        callee: &lir::Value,
        args: &[lir::Value],
        name: &str,
    ) -> Result<Option<BasicValueEnum<'ctx>>, String> {
        let args = args
            .iter()
            .map(|a| self.value(state, func, a).map(BasicMetadataValueEnum::from))
            .collect::<Result<Vec<_>, _>>()?;
        let call = match &callee.kind {
            ValueKind::Function(fn_name) => {
                let target = self
                    .module
                    .get_function(fn_name)
                    .ok_or_else(|| format!("call to undeclared function '{}'", fn_name))?;
                self.builder
                    .build_call(target, &args, name)
                    .map_err(|e| e.to_string())?
            }
            _ => {
                let fn_ty = callee
                    .ty
                    .as_fn_ptr()
                    .ok_or_else(|| format!("call through non-function `{}`", callee.ty))?;
                let fn_ty = self.fn_type(fn_ty)?;
                let ptr = self.pointer(state, func, callee)?;
                self.builder
                    .build_indirect_call(fn_ty, ptr, &args, name)
                    .map_err(|e| e.to_string())?
            }
        };
        Ok(call.try_as_basic_value().basic())
    }

    // ── Operands ─────────────────────────────────────────────────────

    fn value(
        &self,
        state: &FnState<'ctx>,
        func: &lir::Function,
        value: &lir::Value,
    ) -> Result<BasicValueEnum<'ctx>, String> {
        Ok(match &value.kind {
            ValueKind::Inst(id, name) => *state
                .values
                .get(id)
                .ok_or_else(|| format!("%{} used before its definition in @{}", name, func.name))?,
            ValueKind::Param(i) => state
                .function
                .get_nth_param(*i)
                .ok_or_else(|| format!("@{} has no parameter {}", func.name, i))?,
            ValueKind::ConstInt(v) => {
                let bits = value
                    .ty
                    .int_bits()
                    .ok_or_else(|| format!("integer constant of type `{}`", value.ty))?;
                self.context
                    .custom_width_int_type(bits)
                    .const_int(*v, false)
                    .into()
            }
            ValueKind::ConstFloat(v) => match value.ty {
                lir::Type::F32 => self.context.f32_type().const_float(*v).into(),
                _ => self.context.f64_type().const_float(*v).into(),
            },
            ValueKind::Null => self.basic_type(&value.ty)?.const_zero(),
            ValueKind::Undef => undef(self.basic_type(&value.ty)?),
            ValueKind::Function(name) => self
                .module
                .get_function(name)
                .ok_or_else(|| format!("function '{}' not declared", name))?
                .as_global_value()
                .as_pointer_value()
                .into(),
            ValueKind::Global(name) => self
                .module
                .get_global(name)
                .ok_or_else(|| format!("global '{}' not found", name))?
                .as_pointer_value()
                .into(),
            ValueKind::BlockAddress { function, block } => {
                if *function != func.name {
                    return Err(format!(
                        "blockaddress of @{} used inside @{}",
                        function, func.name
                    ));
                }
                let id = func
                    .block_by_name(block)
                    .ok_or_else(|| format!("no block %{} in @{}", block, function))?;
                // SAFETY: the block belongs to a function with a body and is
                // never removed while the module lives.
                unsafe { state.block(id)?.get_address() }
                    .ok_or_else(|| format!("cannot take the address of %{}", block))?
                    .into()
            }
        })
    }

    fn pointer(
        &self,
        state: &FnState<'ctx>,
        func: &lir::Function,
        value: &lir::Value,
    ) -> Result<PointerValue<'ctx>, String> {
        match self.value(state, func, value)? {
            BasicValueEnum::PointerValue(p) => Ok(p),
            other => Err(format!("expected a pointer, found {:?}", other.get_type())),
        }
    }
}

impl<'ctx> FnState<'ctx> {
    fn block(&self, id: lir::BlockId) -> Result<BasicBlock<'ctx>, String> {
        self.blocks
            .get(id.index())
            .copied()
            .ok_or_else(|| format!("block {} out of range", id.0))
    }
}

fn undef(ty: BasicTypeEnum<'_>) -> BasicValueEnum<'_> {
    match ty {
        BasicTypeEnum::IntType(t) => t.get_undef().into(),
        BasicTypeEnum::FloatType(t) => t.get_undef().into(),
        BasicTypeEnum::PointerType(t) => t.get_undef().into(),
        BasicTypeEnum::StructType(t) => t.get_undef().into(),
        BasicTypeEnum::ArrayType(t) => t.get_undef().into(),
        BasicTypeEnum::VectorType(t) => t.get_undef().into(),
        BasicTypeEnum::ScalableVectorType(t) => t.get_undef().into(),
    }
}

/// Translate a verified LIR module and return its LLVM IR text.
pub fn emit_llvm_ir(lir: &lir::Module) -> Result<String, String> {
    let context = Context::create();
    let mut emitter = LlvmEmitter::new(&context, &lir.name);
    emitter.emit(lir)?;
    Ok(emitter.get_ir())
}
