//! Low-level IR (LIR) produced by the concurrency lowering.
//!
//! LIR is deliberately shaped after LLVM IR with typed pointers: a module
//! holds functions and globals, functions hold basic blocks, and every
//! instruction result carries its type. Keeping the shape this close to
//! LLVM means the optional `llvm` feature can translate a module
//! instruction-for-instruction, while the simulator in `strand-sim` can
//! execute the same module without an LLVM installation.
//!
//! ## Architecture
//!
//! - [`builder`]: [`FunctionBuilder`], the append-only instruction builder
//!   with a separate entry-block insertion point for stack slots
//! - [`print`]: textual rendering (`Display` impls)
//! - [`verify`]: structural verification of finished modules

pub mod builder;
pub mod print;
pub mod verify;

use std::fmt;

use rustc_hash::FxHashMap;

pub use builder::{BuildError, FunctionBuilder};
pub use verify::{verify_module, VerifyError};

// ── Types ────────────────────────────────────────────────────────────

/// An LIR type.
///
/// Pointers are typed (`T*`); the opaque pointer used at every runtime
/// boundary is `i8*`, as in LLVM before opaque pointers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Void,
    /// An integer of the given bit width (`i1`, `i8`, ..., `i64`).
    Int(u32),
    F32,
    F64,
    Ptr(Box<Type>),
    /// A literal (unnamed, unpacked) struct.
    Struct(Vec<Type>),
    Func(Box<FnType>),
}

impl Type {
    pub fn i1() -> Self {
        Type::Int(1)
    }

    pub fn i8() -> Self {
        Type::Int(8)
    }

    pub fn i32() -> Self {
        Type::Int(32)
    }

    pub fn i64() -> Self {
        Type::Int(64)
    }

    /// The opaque runtime pointer, `i8*`.
    pub fn opaque_ptr() -> Self {
        Type::Ptr(Box::new(Type::i8()))
    }

    /// A pointer to `self`.
    pub fn ptr_to(self) -> Self {
        Type::Ptr(Box::new(self))
    }

    pub fn pointee(&self) -> Option<&Type> {
        match self {
            Type::Ptr(inner) => Some(inner),
            _ => None,
        }
    }

    pub fn int_bits(&self) -> Option<u32> {
        match self {
            Type::Int(bits) => Some(*bits),
            _ => None,
        }
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, Type::Ptr(_))
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Type::F32 | Type::F64)
    }

    /// The function type behind a function pointer, if `self` is one.
    pub fn as_fn_ptr(&self) -> Option<&FnType> {
        match self {
            Type::Ptr(inner) => match inner.as_ref() {
                Type::Func(fn_ty) => Some(fn_ty),
                _ => None,
            },
            _ => None,
        }
    }
}

/// A function signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FnType {
    pub params: Vec<Type>,
    pub ret: Type,
}

impl FnType {
    pub fn new(params: Vec<Type>, ret: Type) -> Self {
        FnType { params, ret }
    }

    /// The pointer type of a function with this signature.
    pub fn ptr_type(&self) -> Type {
        Type::Func(Box::new(self.clone())).ptr_to()
    }
}

// ── Values ───────────────────────────────────────────────────────────

/// Identifies an instruction result within one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstId(pub u32);

/// Identifies a basic block within one function (its index in `blocks`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A typed operand.
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    pub kind: ValueKind,
    pub ty: Type,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValueKind {
    /// The result of an instruction in the current function.
    Inst(InstId, String),
    /// The n-th parameter of the current function.
    Param(u32),
    /// An integer constant, stored zero-extended and masked to its width.
    ConstInt(u64),
    ConstFloat(f64),
    Null,
    Undef,
    /// The address of a function.
    Function(String),
    /// The address of a global.
    Global(String),
    /// The address of a basic block (`blockaddress(@f, %bb)`).
    BlockAddress { function: String, block: String },
}

/// Mask `value` to the low `bits` bits.
pub fn mask_to_width(value: u64, bits: u32) -> u64 {
    if bits >= 64 {
        value
    } else {
        value & ((1u64 << bits) - 1)
    }
}

/// Interpret the low `bits` bits of `value` as a two's complement integer.
pub fn sign_extend(value: u64, bits: u32) -> i64 {
    if bits >= 64 {
        value as i64
    } else {
        let shift = 64 - bits;
        ((value << shift) as i64) >> shift
    }
}

impl Value {
    /// An integer constant of the given width. Negative values are stored
    /// in two's complement, truncated to `bits`.
    pub fn const_int(bits: u32, value: i64) -> Self {
        Value {
            kind: ValueKind::ConstInt(mask_to_width(value as u64, bits)),
            ty: Type::Int(bits),
        }
    }

    pub fn const_bool(value: bool) -> Self {
        Value::const_int(1, value as i64)
    }

    pub fn const_float(ty: Type, value: f64) -> Self {
        Value {
            kind: ValueKind::ConstFloat(value),
            ty,
        }
    }

    pub fn null(ty: Type) -> Self {
        Value {
            kind: ValueKind::Null,
            ty,
        }
    }

    pub fn undef(ty: Type) -> Self {
        Value {
            kind: ValueKind::Undef,
            ty,
        }
    }

    pub fn function(name: impl Into<String>, fn_ty: &FnType) -> Self {
        Value {
            kind: ValueKind::Function(name.into()),
            ty: fn_ty.ptr_type(),
        }
    }

    /// The address of a global holding a value of type `value_ty`.
    pub fn global(name: impl Into<String>, value_ty: Type) -> Self {
        Value {
            kind: ValueKind::Global(name.into()),
            ty: value_ty.ptr_to(),
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(
            self.kind,
            ValueKind::ConstInt(_) | ValueKind::ConstFloat(_) | ValueKind::Null | ValueKind::Undef
        )
    }

    /// The constant integer payload, if this is an integer constant.
    pub fn as_const_int(&self) -> Option<u64> {
        match self.kind {
            ValueKind::ConstInt(v) => Some(v),
            _ => None,
        }
    }
}

// ── Instructions ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CastOp {
    Trunc,
    ZExt,
    SExt,
    FpTrunc,
    FpExt,
    Bitcast,
    IntToPtr,
    PtrToInt,
}

impl CastOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            CastOp::Trunc => "trunc",
            CastOp::ZExt => "zext",
            CastOp::SExt => "sext",
            CastOp::FpTrunc => "fptrunc",
            CastOp::FpExt => "fpext",
            CastOp::Bitcast => "bitcast",
            CastOp::IntToPtr => "inttoptr",
            CastOp::PtrToInt => "ptrtoint",
        }
    }
}

impl fmt::Display for CastOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstKind {
    Alloca { ty: Type },
    Load { ptr: Value },
    Store { value: Value, ptr: Value },
    /// `getelementptr inbounds S, S* ptr, i32 0, i32 index`.
    StructGep { ptr: Value, index: u32 },
    Cast { op: CastOp, value: Value },
    Call { callee: Value, args: Vec<Value> },
    Phi { incoming: Vec<(Value, BlockId)> },
    Br { target: BlockId },
    CondBr { cond: Value, then_block: BlockId, else_block: BlockId },
    Ret { value: Option<Value> },
    Unreachable,
}

/// One instruction. `ty` is the result type (`Void` when there is none).
#[derive(Debug, Clone, PartialEq)]
pub struct Inst {
    pub id: Option<InstId>,
    pub name: String,
    pub kind: InstKind,
    pub ty: Type,
}

impl Inst {
    pub fn is_terminator(&self) -> bool {
        matches!(
            self.kind,
            InstKind::Br { .. } | InstKind::CondBr { .. } | InstKind::Ret { .. } | InstKind::Unreachable
        )
    }

    /// The result of this instruction as an operand.
    pub fn result(&self) -> Option<Value> {
        self.id.map(|id| Value {
            kind: ValueKind::Inst(id, self.name.clone()),
            ty: self.ty.clone(),
        })
    }

    /// All value operands, in textual order.
    pub fn operands(&self) -> Vec<&Value> {
        match &self.kind {
            InstKind::Alloca { .. } | InstKind::Br { .. } | InstKind::Unreachable => Vec::new(),
            InstKind::Load { ptr } => vec![ptr],
            InstKind::Store { value, ptr } => vec![value, ptr],
            InstKind::StructGep { ptr, .. } => vec![ptr],
            InstKind::Cast { value, .. } => vec![value],
            InstKind::Call { callee, args } => {
                let mut ops = vec![callee];
                ops.extend(args.iter());
                ops
            }
            InstKind::Phi { incoming } => incoming.iter().map(|(v, _)| v).collect(),
            InstKind::CondBr { cond, .. } => vec![cond],
            InstKind::Ret { value } => value.iter().collect(),
        }
    }

    /// Blocks this instruction refers to (branch targets, phi predecessors).
    pub fn block_refs(&self) -> Vec<BlockId> {
        match &self.kind {
            InstKind::Br { target } => vec![*target],
            InstKind::CondBr {
                then_block,
                else_block,
                ..
            } => vec![*then_block, *else_block],
            InstKind::Phi { incoming } => incoming.iter().map(|(_, b)| *b).collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub name: String,
    pub insts: Vec<Inst>,
}

impl Block {
    pub fn terminator(&self) -> Option<&Inst> {
        self.insts.last().filter(|inst| inst.is_terminator())
    }
}

// ── Functions and globals ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    External,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FnAttr {
    /// The function never returns control to its caller.
    NoReturn,
}

/// A function definition, or a declaration when `blocks` is empty.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub ty: FnType,
    pub linkage: Linkage,
    pub attrs: Vec<FnAttr>,
    pub blocks: Vec<Block>,
}

impl Function {
    pub fn declaration(name: impl Into<String>, ty: FnType) -> Self {
        Function {
            name: name.into(),
            ty,
            linkage: Linkage::External,
            attrs: Vec::new(),
            blocks: Vec::new(),
        }
    }

    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn has_attr(&self, attr: FnAttr) -> bool {
        self.attrs.contains(&attr)
    }

    /// The address of this function as an operand.
    pub fn as_value(&self) -> Value {
        Value::function(self.name.clone(), &self.ty)
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(id.index())
    }

    pub fn block_by_name(&self, name: &str) -> Option<BlockId> {
        self.blocks
            .iter()
            .position(|b| b.name == name)
            .map(|i| BlockId(i as u32))
    }

    /// Every instruction in block order.
    pub fn instructions(&self) -> impl Iterator<Item = &Inst> {
        self.blocks.iter().flat_map(|b| b.insts.iter())
    }

    /// Every call instruction whose callee is the named function.
    pub fn calls_to<'a>(&'a self, callee: &'a str) -> impl Iterator<Item = &'a Inst> + 'a {
        self.instructions().filter(move |inst| match &inst.kind {
            InstKind::Call { callee: c, .. } => {
                matches!(&c.kind, ValueKind::Function(name) if name == callee)
            }
            _ => false,
        })
    }
}

/// Kind tag stored in the first field of a runtime type descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    Bool = 1,
    Int = 2,
    Uint = 3,
    Uintptr = 4,
    Float = 5,
    UnsafePointer = 6,
    Pointer = 7,
    Chan = 8,
    Struct = 9,
    Func = 10,
}

impl DescriptorKind {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// The payload of a runtime type descriptor global.
///
/// Laid out in memory as `{ i8 kind, i64 size, i64 align, i8* elem }`,
/// where `elem` names the element descriptor of pointer and channel types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
    pub kind: DescriptorKind,
    pub size: u64,
    pub align: u64,
    pub elem: Option<String>,
}

impl TypeDescriptor {
    /// The LIR type of a descriptor global.
    pub fn layout() -> Type {
        Type::Struct(vec![Type::i8(), Type::i64(), Type::i64(), Type::opaque_ptr()])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GlobalInit {
    Zero,
    TypeDescriptor(TypeDescriptor),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Global {
    pub name: String,
    /// The type of the value stored in the global.
    pub ty: Type,
    pub init: GlobalInit,
    pub constant: bool,
}

impl Global {
    pub fn as_value(&self) -> Value {
        Value::global(self.name.clone(), self.ty.clone())
    }
}

// ── Module ───────────────────────────────────────────────────────────

/// A translation unit: functions and globals, indexed by name.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub name: String,
    functions: Vec<Function>,
    globals: Vec<Global>,
    function_index: FxHashMap<String, usize>,
    global_index: FxHashMap<String, usize>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Module {
            name: name.into(),
            ..Module::default()
        }
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    pub fn globals(&self) -> &[Global] {
        &self.globals
    }

    pub fn get_function(&self, name: &str) -> Option<&Function> {
        self.function_index.get(name).map(|&i| &self.functions[i])
    }

    pub fn get_global(&self, name: &str) -> Option<&Global> {
        self.global_index.get(name).map(|&i| &self.globals[i])
    }

    /// Declare an external function, or return the existing one.
    ///
    /// Redeclaring with a different signature is an error.
    pub fn declare_function(
        &mut self,
        name: &str,
        ty: FnType,
        attrs: &[FnAttr],
    ) -> Result<Value, BuildError> {
        if let Some(existing) = self.get_function(name) {
            if existing.ty != ty {
                return Err(BuildError::ConflictingDeclaration {
                    name: name.to_string(),
                    expected: FnTypeDisplay(&existing.ty).to_string(),
                    found: FnTypeDisplay(&ty).to_string(),
                });
            }
            return Ok(existing.as_value());
        }
        let mut func = Function::declaration(name, ty);
        func.attrs.extend_from_slice(attrs);
        let value = func.as_value();
        self.function_index.insert(name.to_string(), self.functions.len());
        self.functions.push(func);
        Ok(value)
    }

    /// Add a function definition. A prior declaration with the same
    /// signature is replaced in place.
    pub fn define_function(&mut self, func: Function) -> Result<Value, BuildError> {
        let value = func.as_value();
        match self.function_index.get(&func.name).copied() {
            Some(i) => {
                let existing = &self.functions[i];
                if !existing.is_declaration() {
                    return Err(BuildError::DuplicateDefinition(func.name));
                }
                if existing.ty != func.ty {
                    return Err(BuildError::ConflictingDeclaration {
                        name: func.name.clone(),
                        expected: FnTypeDisplay(&existing.ty).to_string(),
                        found: FnTypeDisplay(&func.ty).to_string(),
                    });
                }
                self.functions[i] = func;
            }
            None => {
                self.function_index
                    .insert(func.name.clone(), self.functions.len());
                self.functions.push(func);
            }
        }
        Ok(value)
    }

    /// Add a global unless one with the same name already exists.
    pub fn add_global(&mut self, global: Global) -> Value {
        if let Some(existing) = self.get_global(&global.name) {
            return existing.as_value();
        }
        let value = global.as_value();
        self.global_index
            .insert(global.name.clone(), self.globals.len());
        self.globals.push(global);
        value
    }
}

/// Renders a function type as `ret (params)`.
pub struct FnTypeDisplay<'a>(pub &'a FnType);
