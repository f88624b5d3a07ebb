//! Type-checked instruction builder for one LIR function.

use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use super::{
    Block, BlockId, CastOp, FnType, Function, Inst, InstId, InstKind, Linkage, Type, Value,
    ValueKind,
};

/// An instruction could not be built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("no insertion block is set")]
    NoInsertBlock,
    #[error("block `{0}` already has a terminator")]
    BlockTerminated(String),
    #[error("type mismatch in {context}: expected `{expected}`, found `{found}`")]
    TypeMismatch {
        context: &'static str,
        expected: String,
        found: String,
    },
    #[error("{context} requires a pointer operand, found `{found}`")]
    NotAPointer { context: &'static str, found: String },
    #[error("field {index} is out of range for `{ty}`")]
    FieldOutOfRange { index: u32, ty: String },
    #[error("call expects {expected} arguments, found {found}")]
    ArityMismatch { expected: usize, found: usize },
    #[error("invalid cast `{op}` from `{from}` to `{to}`")]
    InvalidCast {
        op: CastOp,
        from: String,
        to: String,
    },
    #[error("function has no parameter {0}")]
    NoSuchParam(u32),
    #[error("function `{0}` is already defined")]
    DuplicateDefinition(String),
    #[error("conflicting declarations of `{name}`: `{expected}` vs `{found}`")]
    ConflictingDeclaration {
        name: String,
        expected: String,
        found: String,
    },
}

fn mismatch(context: &'static str, expected: &Type, found: &Type) -> BuildError {
    BuildError::TypeMismatch {
        context,
        expected: expected.to_string(),
        found: found.to_string(),
    }
}

// ── FunctionBuilder ──────────────────────────────────────────────────

/// Builds the body of a single function.
///
/// The builder owns the function under construction; [`finish`] hands it
/// back for insertion into a [`Module`](super::Module). Besides the usual
/// "current block" insertion point it tracks an *alloca block*: stack
/// slots requested through [`build_entry_alloca`] are grouped at the top
/// of that block no matter where the main insertion point is.
///
/// [`finish`]: FunctionBuilder::finish
/// [`build_entry_alloca`]: FunctionBuilder::build_entry_alloca
pub struct FunctionBuilder {
    func: Function,
    current: Option<BlockId>,
    alloca_block: Option<BlockId>,
    next_inst: u32,
    /// Values, blocks and parameters share one namespace, as in LLVM.
    names: Names,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>, ty: FnType, linkage: Linkage) -> Self {
        let mut names = Names::default();
        for i in 0..ty.params.len() {
            names.taken.insert(format!("p{i}"));
        }
        let mut func = Function::declaration(name, ty);
        func.linkage = linkage;
        FunctionBuilder {
            func,
            current: None,
            alloca_block: None,
            next_inst: 0,
            names,
        }
    }

    pub fn function_name(&self) -> &str {
        &self.func.name
    }

    pub fn fn_type(&self) -> &FnType {
        &self.func.ty
    }

    /// The function being built, as a callable operand.
    pub fn as_value(&self) -> Value {
        self.func.as_value()
    }

    pub fn param(&self, index: u32) -> Result<Value, BuildError> {
        let ty = self
            .func
            .ty
            .params
            .get(index as usize)
            .ok_or(BuildError::NoSuchParam(index))?;
        Ok(Value {
            kind: ValueKind::Param(index),
            ty: ty.clone(),
        })
    }

    // ── Blocks ───────────────────────────────────────────────────────

    /// Append a new block. Names are made unique by suffixing a counter.
    pub fn append_block(&mut self, name: &str) -> BlockId {
        let name = self.names.unique(name);
        let id = BlockId(self.func.blocks.len() as u32);
        self.func.blocks.push(Block {
            name,
            insts: Vec::new(),
        });
        // The first block doubles as the alloca block until told otherwise.
        if self.alloca_block.is_none() {
            self.alloca_block = Some(id);
        }
        id
    }

    pub fn position_at_end(&mut self, block: BlockId) {
        self.current = Some(block);
    }

    pub fn current_block(&self) -> Option<BlockId> {
        self.current
    }

    pub fn set_alloca_block(&mut self, block: BlockId) {
        self.alloca_block = Some(block);
    }

    pub fn block_name(&self, block: BlockId) -> &str {
        self.func
            .blocks
            .get(block.index())
            .map(|b| b.name.as_str())
            .unwrap_or("")
    }

    /// Whether the current block already ends in a terminator.
    pub fn is_terminated(&self) -> bool {
        self.current
            .and_then(|b| self.func.blocks.get(b.index()))
            .is_some_and(|b| b.terminator().is_some())
    }

    /// `blockaddress(@this, %block)` as an opaque pointer.
    pub fn block_address(&self, block: BlockId) -> Value {
        Value {
            kind: ValueKind::BlockAddress {
                function: self.func.name.clone(),
                block: self.block_name(block).to_string(),
            },
            ty: Type::opaque_ptr(),
        }
    }

    // ── Insertion ────────────────────────────────────────────────────

    fn insert(&mut self, name: &str, kind: InstKind, ty: Type) -> Result<Option<Value>, BuildError> {
        let block = self.current.ok_or(BuildError::NoInsertBlock)?;
        let inst = self.make_inst(name, kind, ty);
        let result = inst.result();
        let block = &mut self.func.blocks[block.index()];
        if block.terminator().is_some() {
            return Err(BuildError::BlockTerminated(block.name.clone()));
        }
        block.insts.push(inst);
        Ok(result)
    }

    fn insert_value(&mut self, name: &str, kind: InstKind, ty: Type) -> Result<Value, BuildError> {
        self.insert(name, kind, ty)?
            .ok_or_else(|| mismatch("value instruction", &Type::i8(), &Type::Void))
    }

    fn make_inst(&mut self, name: &str, kind: InstKind, ty: Type) -> Inst {
        let produces_value = ty != Type::Void;
        let (id, name) = if produces_value {
            let id = InstId(self.next_inst);
            self.next_inst += 1;
            let base = if name.is_empty() { "t" } else { name };
            (Some(id), self.names.unique(base))
        } else {
            (None, String::new())
        };
        Inst { id, name, kind, ty }
    }

    // ── Memory ───────────────────────────────────────────────────────

    /// Allocate a stack slot in the current block.
    pub fn build_alloca(&mut self, ty: Type, name: &str) -> Result<Value, BuildError> {
        let ptr_ty = ty.clone().ptr_to();
        self.insert_value(name, InstKind::Alloca { ty }, ptr_ty)
    }

    /// Allocate a stack slot at the top of the alloca block, after any
    /// slots already placed there. The current insertion point is kept.
    pub fn build_entry_alloca(&mut self, ty: Type, name: &str) -> Result<Value, BuildError> {
        let block = self.alloca_block.ok_or(BuildError::NoInsertBlock)?;
        let ptr_ty = ty.clone().ptr_to();
        let inst = self.make_inst(name, InstKind::Alloca { ty }, ptr_ty);
        let result = inst.result();
        let insts = &mut self.func.blocks[block.index()].insts;
        let at = insts
            .iter()
            .take_while(|i| matches!(i.kind, InstKind::Alloca { .. }))
            .count();
        insts.insert(at, inst);
        result.ok_or(BuildError::NoInsertBlock)
    }

    pub fn build_load(&mut self, ptr: &Value, name: &str) -> Result<Value, BuildError> {
        let pointee = ptr.ty.pointee().cloned().ok_or_else(|| BuildError::NotAPointer {
            context: "load",
            found: ptr.ty.to_string(),
        })?;
        self.insert_value(name, InstKind::Load { ptr: ptr.clone() }, pointee)
    }

    pub fn build_store(&mut self, value: &Value, ptr: &Value) -> Result<(), BuildError> {
        let pointee = ptr.ty.pointee().ok_or_else(|| BuildError::NotAPointer {
            context: "store",
            found: ptr.ty.to_string(),
        })?;
        if *pointee != value.ty {
            return Err(mismatch("store", pointee, &value.ty));
        }
        self.insert(
            "",
            InstKind::Store {
                value: value.clone(),
                ptr: ptr.clone(),
            },
            Type::Void,
        )?;
        Ok(())
    }

    /// Address of field `index` of the struct `ptr` points to.
    pub fn build_struct_gep(&mut self, ptr: &Value, index: u32, name: &str) -> Result<Value, BuildError> {
        let fields = match ptr.ty.pointee() {
            Some(Type::Struct(fields)) => fields,
            _ => {
                return Err(BuildError::NotAPointer {
                    context: "struct gep",
                    found: ptr.ty.to_string(),
                })
            }
        };
        let field = fields
            .get(index as usize)
            .cloned()
            .ok_or_else(|| BuildError::FieldOutOfRange {
                index,
                ty: ptr.ty.to_string(),
            })?;
        self.insert_value(
            name,
            InstKind::StructGep {
                ptr: ptr.clone(),
                index,
            },
            field.ptr_to(),
        )
    }

    // ── Casts ────────────────────────────────────────────────────────

    pub fn build_cast(&mut self, op: CastOp, value: &Value, to: Type, name: &str) -> Result<Value, BuildError> {
        if !cast_is_valid(op, &value.ty, &to) {
            return Err(BuildError::InvalidCast {
                op,
                from: value.ty.to_string(),
                to: to.to_string(),
            });
        }
        self.insert_value(
            name,
            InstKind::Cast {
                op,
                value: value.clone(),
            },
            to,
        )
    }

    pub fn build_bitcast(&mut self, value: &Value, to: Type, name: &str) -> Result<Value, BuildError> {
        if value.ty == to {
            return Ok(value.clone());
        }
        self.build_cast(CastOp::Bitcast, value, to, name)
    }

    /// Zero-extend, truncate or pass through an integer to width `bits`.
    pub fn build_int_resize(&mut self, value: &Value, bits: u32, signed: bool, name: &str) -> Result<Value, BuildError> {
        let from = value.ty.int_bits().ok_or_else(|| BuildError::InvalidCast {
            op: CastOp::Trunc,
            from: value.ty.to_string(),
            to: Type::Int(bits).to_string(),
        })?;
        match from.cmp(&bits) {
            std::cmp::Ordering::Equal => Ok(value.clone()),
            std::cmp::Ordering::Greater => self.build_cast(CastOp::Trunc, value, Type::Int(bits), name),
            std::cmp::Ordering::Less if signed => self.build_cast(CastOp::SExt, value, Type::Int(bits), name),
            std::cmp::Ordering::Less => self.build_cast(CastOp::ZExt, value, Type::Int(bits), name),
        }
    }

    // ── Calls and control flow ───────────────────────────────────────

    /// Call `callee` (a function pointer). Returns the result, or `None`
    /// for a void callee.
    pub fn build_call(&mut self, callee: &Value, args: &[Value], name: &str) -> Result<Option<Value>, BuildError> {
        let fn_ty = callee
            .ty
            .as_fn_ptr()
            .cloned()
            .ok_or_else(|| BuildError::NotAPointer {
                context: "call",
                found: callee.ty.to_string(),
            })?;
        if fn_ty.params.len() != args.len() {
            return Err(BuildError::ArityMismatch {
                expected: fn_ty.params.len(),
                found: args.len(),
            });
        }
        for (param, arg) in fn_ty.params.iter().zip(args) {
            if *param != arg.ty {
                return Err(mismatch("call argument", param, &arg.ty));
            }
        }
        self.insert(
            name,
            InstKind::Call {
                callee: callee.clone(),
                args: args.to_vec(),
            },
            fn_ty.ret,
        )
    }

    pub fn build_phi(&mut self, ty: Type, incoming: &[(Value, BlockId)], name: &str) -> Result<Value, BuildError> {
        for (value, _) in incoming {
            if value.ty != ty {
                return Err(mismatch("phi", &ty, &value.ty));
            }
        }
        self.insert_value(
            name,
            InstKind::Phi {
                incoming: incoming.to_vec(),
            },
            ty,
        )
    }

    pub fn build_br(&mut self, target: BlockId) -> Result<(), BuildError> {
        self.insert("", InstKind::Br { target }, Type::Void)?;
        Ok(())
    }

    pub fn build_cond_br(&mut self, cond: &Value, then_block: BlockId, else_block: BlockId) -> Result<(), BuildError> {
        if cond.ty != Type::i1() {
            return Err(mismatch("conditional branch", &Type::i1(), &cond.ty));
        }
        self.insert(
            "",
            InstKind::CondBr {
                cond: cond.clone(),
                then_block,
                else_block,
            },
            Type::Void,
        )?;
        Ok(())
    }

    pub fn build_return(&mut self, value: Option<&Value>) -> Result<(), BuildError> {
        let ret = &self.func.ty.ret;
        match value {
            Some(v) if v.ty != *ret => return Err(mismatch("return", ret, &v.ty)),
            None if *ret != Type::Void => return Err(mismatch("return", ret, &Type::Void)),
            _ => {}
        }
        self.insert(
            "",
            InstKind::Ret {
                value: value.cloned(),
            },
            Type::Void,
        )?;
        Ok(())
    }

    pub fn build_unreachable(&mut self) -> Result<(), BuildError> {
        self.insert("", InstKind::Unreachable, Type::Void)?;
        Ok(())
    }

    /// Hand back the finished function.
    pub fn finish(self) -> Function {
        self.func
    }
}

/// Local names handed out so far, plus the next suffix to try per base.
#[derive(Default)]
struct Names {
    taken: FxHashSet<String>,
    next_suffix: FxHashMap<String, u32>,
}

impl Names {
    fn unique(&mut self, base: &str) -> String {
        if self.taken.insert(base.to_string()) {
            return base.to_string();
        }
        let suffix = self.next_suffix.entry(base.to_string()).or_insert(1);
        loop {
            let candidate = format!("{base}{suffix}");
            *suffix += 1;
            if self.taken.insert(candidate.clone()) {
                return candidate;
            }
        }
    }
}

fn bit_width(ty: &Type) -> Option<u32> {
    match ty {
        Type::Int(bits) => Some(*bits),
        Type::F32 => Some(32),
        Type::F64 => Some(64),
        _ => None,
    }
}

fn cast_is_valid(op: CastOp, from: &Type, to: &Type) -> bool {
    match op {
        CastOp::Trunc => matches!((from, to), (Type::Int(a), Type::Int(b)) if a > b),
        CastOp::ZExt | CastOp::SExt => matches!((from, to), (Type::Int(a), Type::Int(b)) if a < b),
        CastOp::FpTrunc => *from == Type::F64 && *to == Type::F32,
        CastOp::FpExt => *from == Type::F32 && *to == Type::F64,
        CastOp::IntToPtr => matches!(from, Type::Int(_)) && to.is_pointer(),
        CastOp::PtrToInt => from.is_pointer() && matches!(to, Type::Int(_)),
        CastOp::Bitcast => {
            (from.is_pointer() && to.is_pointer())
                || matches!((bit_width(from), bit_width(to)), (Some(a), Some(b)) if a == b)
        }
    }
}
