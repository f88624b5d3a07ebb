//! The LIR interpreter.

use std::rc::Rc;

use rustc_hash::FxHashMap;
use strand_codegen::lir::{
    self, mask_to_width, sign_extend, verify_module, BlockId, CastOp, Function, GlobalInit, InstId,
    InstKind, Module, Type, ValueKind,
};
use tracing::{debug, trace};

use crate::memory::{Memory, Ptr, Val};
use crate::runtime::{Runtime, RuntimeStats};
use crate::SimError;

/// A call to a function the module declares but does not define (and that
/// is not a runtime primitive). Such calls are recorded instead of run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalCall {
    pub name: String,
    pub args: Vec<Val>,
}

/// Non-local control flow while executing.
#[derive(Debug)]
pub(crate) enum Trap {
    Error(SimError),
    /// `strand_thread_exit` unwinding the current thread.
    ThreadExit,
}

impl From<SimError> for Trap {
    fn from(err: SimError) -> Self {
        Trap::Error(err)
    }
}

/// Executes the functions of one module against a fresh memory and runtime.
pub struct Machine {
    module: Rc<Module>,
    pub(crate) memory: Memory,
    globals: FxHashMap<String, Ptr>,
    pub(crate) runtime: Runtime,
    trace: Vec<ExternalCall>,
}

/// Instruction results and parameters of one activation.
struct Activation {
    params: Vec<Val>,
    values: FxHashMap<InstId, Val>,
}

impl Machine {
    /// Load a verified module and initialize its globals.
    pub fn new(module: Module) -> Result<Self, SimError> {
        verify_module(&module)?;
        let mut machine = Machine {
            module: Rc::new(module),
            memory: Memory::new(),
            globals: FxHashMap::default(),
            runtime: Runtime::default(),
            trace: Vec::new(),
        };
        machine.init_globals()?;
        Ok(machine)
    }

    fn init_globals(&mut self) -> Result<(), SimError> {
        let module = Rc::clone(&self.module);
        for global in module.globals() {
            let ptr = self.memory.allocate();
            self.globals.insert(global.name.clone(), ptr);
        }
        for global in module.globals() {
            let init = match &global.init {
                GlobalInit::Zero => Val::zero(&global.ty),
                GlobalInit::TypeDescriptor(desc) => {
                    let elem = match &desc.elem {
                        Some(name) => Val::Ptr(self.global(name)?),
                        None => Val::null(),
                    };
                    Val::Struct(vec![
                        Val::int(8, i64::from(desc.kind.code())),
                        Val::int(64, desc.size as i64),
                        Val::int(64, desc.align as i64),
                        elem,
                    ])
                }
            };
            let ptr = self.global(&global.name)?;
            self.memory.store(&ptr, init)?;
        }
        Ok(())
    }

    fn global(&self, name: &str) -> Result<Ptr, SimError> {
        self.globals
            .get(name)
            .cloned()
            .ok_or_else(|| SimError::BadMemory(format!("unknown global @{name}")))
    }

    /// Run `name` with `args`, then let every spawned thread finish.
    pub fn run(&mut self, name: &str, args: Vec<Val>) -> Result<Option<Val>, SimError> {
        debug!(function = name, "run");
        let result = match self.call_function(name, args) {
            Ok(value) => value,
            Err(Trap::ThreadExit) => None,
            Err(Trap::Error(err)) => return Err(err),
        };
        while self.run_one_pending().map_err(into_error)? {}
        Ok(result)
    }

    /// Calls to external functions, in execution order.
    pub fn trace(&self) -> &[ExternalCall] {
        &self.trace
    }

    /// Recorded calls to the external function `name`.
    pub fn calls_to<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a ExternalCall> + 'a {
        self.trace.iter().filter(move |c| c.name == name)
    }

    pub fn stats(&self) -> &RuntimeStats {
        &self.runtime.stats
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// Read a global's current value.
    pub fn read_global(&self, name: &str) -> Result<Val, SimError> {
        let ptr = self.global(name)?;
        self.memory.load_any(&ptr)
    }

    // ── Calls ────────────────────────────────────────────────────────

    pub(crate) fn call_value(&mut self, callee: &Val, args: Vec<Val>) -> Result<Option<Val>, Trap> {
        match callee {
            Val::Ptr(Ptr::Function(name)) => {
                let name = name.clone();
                self.call_function(&name, args)
            }
            other => Err(SimError::Type(format!("call through non-function {other}")).into()),
        }
    }

    pub(crate) fn call_function(&mut self, name: &str, args: Vec<Val>) -> Result<Option<Val>, Trap> {
        let module = Rc::clone(&self.module);
        let func = module
            .get_function(name)
            .ok_or_else(|| SimError::UnknownFunction(name.to_string()))?;
        if func.ty.params.len() != args.len() {
            return Err(SimError::Type(format!(
                "@{name} takes {} arguments, got {}",
                func.ty.params.len(),
                args.len()
            ))
            .into());
        }
        if !func.is_declaration() {
            self.runtime.enter_frame();
            let result = self.execute(func, args);
            self.runtime.leave_frame();
            return result;
        }
        if name.starts_with("strand_") {
            return self.call_runtime(name, &args, &func.ty.ret);
        }
        trace!(function = name, "external call");
        self.trace.push(ExternalCall {
            name: name.to_string(),
            args,
        });
        match func.ty.ret {
            Type::Void => Ok(None),
            _ => Err(SimError::Unsupported(format!("external @{name} returns a value")).into()),
        }
    }

    fn execute(&mut self, func: &Function, params: Vec<Val>) -> Result<Option<Val>, Trap> {
        let mut act = Activation {
            params,
            values: FxHashMap::default(),
        };
        let mut prev: Option<BlockId> = None;
        let mut cur = BlockId(0);

        'blocks: loop {
            let block = func
                .block(cur)
                .ok_or_else(|| SimError::Type(format!("@{} has no block {}", func.name, cur.0)))?;

            // Phis read their inputs before any of them is assigned.
            let mut incoming = Vec::new();
            for inst in block.insts.iter() {
                let InstKind::Phi { incoming: edges } = &inst.kind else {
                    break;
                };
                let from = prev.ok_or_else(|| {
                    SimError::Type(format!("phi in entry block of @{}", func.name))
                })?;
                let (value, _) = edges.iter().find(|(_, b)| *b == from).ok_or_else(|| {
                    SimError::Type(format!("phi %{} has no edge from block {}", inst.name, from.0))
                })?;
                incoming.push((inst.id, self.eval(&act, func, value)?));
            }
            for (id, value) in incoming {
                if let Some(id) = id {
                    act.values.insert(id, value);
                }
            }

            for inst in block.insts.iter() {
                let result = match &inst.kind {
                    InstKind::Phi { .. } => continue,
                    InstKind::Br { target } => {
                        prev = Some(cur);
                        cur = *target;
                        continue 'blocks;
                    }
                    InstKind::CondBr {
                        cond,
                        then_block,
                        else_block,
                    } => {
                        let taken = self
                            .eval(&act, func, cond)?
                            .as_bool()
                            .ok_or_else(|| SimError::Type("non-boolean branch condition".into()))?;
                        prev = Some(cur);
                        cur = if taken { *then_block } else { *else_block };
                        continue 'blocks;
                    }
                    InstKind::Ret { value } => {
                        return match value {
                            Some(v) => Ok(Some(self.eval(&act, func, v)?)),
                            None => Ok(None),
                        };
                    }
                    InstKind::Unreachable => {
                        return Err(SimError::Unreachable(func.name.clone()).into());
                    }
                    _ => self.step(&act, func, inst)?,
                };
                if let (Some(id), Some(value)) = (inst.id, result) {
                    act.values.insert(id, value);
                }
            }
            return Err(SimError::Type(format!("block %{} falls off its end", block.name)).into());
        }
    }

    /// Execute one non-terminator instruction.
    fn step(&mut self, act: &Activation, func: &Function, inst: &lir::Inst) -> Result<Option<Val>, Trap> {
        Ok(match &inst.kind {
            InstKind::Alloca { .. } => Some(Val::Ptr(self.memory.allocate())),
            InstKind::Load { ptr } => {
                let ptr = self.eval_ptr(act, func, ptr)?;
                Some(self.memory.load(&ptr, &inst.ty)?)
            }
            InstKind::Store { value, ptr } => {
                let value = self.eval(act, func, value)?;
                let ptr = self.eval_ptr(act, func, ptr)?;
                self.memory.store(&ptr, value)?;
                None
            }
            InstKind::StructGep { ptr, index } => match self.eval_ptr(act, func, ptr)? {
                Ptr::Mem(addr) => Some(Val::Ptr(Ptr::Mem(addr.field(*index)))),
                other => return Err(SimError::BadMemory(format!("getelementptr on {other:?}")).into()),
            },
            InstKind::Cast { op, value } => {
                let v = self.eval(act, func, value)?;
                Some(self.cast(*op, v, &inst.ty)?)
            }
            InstKind::Call { callee, args } => {
                let callee = self.eval(act, func, callee)?;
                let args = args
                    .iter()
                    .map(|a| self.eval(act, func, a))
                    .collect::<Result<Vec<_>, _>>()?;
                self.call_value(&callee, args)?
            }
            InstKind::Phi { .. }
            | InstKind::Br { .. }
            | InstKind::CondBr { .. }
            | InstKind::Ret { .. }
            | InstKind::Unreachable => None,
        })
    }

    // ── Operands ─────────────────────────────────────────────────────

    fn eval(&self, act: &Activation, func: &Function, value: &lir::Value) -> Result<Val, SimError> {
        Ok(match &value.kind {
            ValueKind::Inst(id, name) => act
                .values
                .get(id)
                .cloned()
                .ok_or_else(|| SimError::Type(format!("%{name} read before it was set")))?,
            ValueKind::Param(i) => act
                .params
                .get(*i as usize)
                .cloned()
                .ok_or_else(|| SimError::Type(format!("@{} has no parameter {i}", func.name)))?,
            ValueKind::ConstInt(v) => Val::Int {
                bits: value.ty.int_bits().unwrap_or(64),
                value: *v,
            },
            ValueKind::ConstFloat(v) => match value.ty {
                Type::F32 => Val::F32(*v as f32),
                _ => Val::F64(*v),
            },
            ValueKind::Null => Val::zero(&value.ty),
            ValueKind::Undef => Val::Undef,
            ValueKind::Function(name) => Val::Ptr(Ptr::Function(name.clone())),
            ValueKind::Global(name) => Val::Ptr(self.global(name)?),
            ValueKind::BlockAddress { function, block } => Val::Ptr(Ptr::Block {
                function: function.clone(),
                block: block.clone(),
            }),
        })
    }

    fn eval_ptr(&self, act: &Activation, func: &Function, value: &lir::Value) -> Result<Ptr, SimError> {
        match self.eval(act, func, value)? {
            Val::Ptr(p) => Ok(p),
            other => Err(SimError::Type(format!("expected a pointer, found {other}"))),
        }
    }

    fn cast(&mut self, op: CastOp, v: Val, to: &Type) -> Result<Val, SimError> {
        let bad = |v: &Val| SimError::Type(format!("cannot {op} {v} to {to}"));
        let to_bits = to.int_bits();
        Ok(match (op, &v) {
            (CastOp::Trunc | CastOp::ZExt, Val::Int { value, .. }) => {
                let bits = to_bits.ok_or_else(|| bad(&v))?;
                Val::Int {
                    bits,
                    value: mask_to_width(*value, bits),
                }
            }
            (CastOp::SExt, Val::Int { bits: from, value }) => {
                let bits = to_bits.ok_or_else(|| bad(&v))?;
                Val::int(bits, sign_extend(*value, *from))
            }
            (CastOp::FpExt, Val::F32(f)) => Val::F64(f64::from(*f)),
            (CastOp::FpTrunc, Val::F64(f)) => Val::F32(*f as f32),
            (CastOp::IntToPtr, Val::Int { value, .. }) => Val::Ptr(self.memory.word_to_ptr(*value)),
            (CastOp::PtrToInt, Val::Ptr(p)) => {
                let bits = to_bits.ok_or_else(|| bad(&v))?;
                Val::Int {
                    bits,
                    value: mask_to_width(self.memory.ptr_to_word(p), bits),
                }
            }
            (CastOp::Bitcast, Val::Ptr(_)) if to.is_pointer() => v.clone(),
            (CastOp::Bitcast, Val::Int { bits: 64, value }) if *to == Type::F64 => {
                Val::F64(f64::from_bits(*value))
            }
            (CastOp::Bitcast, Val::Int { bits: 32, value }) if *to == Type::F32 => {
                Val::F32(f32::from_bits(*value as u32))
            }
            (CastOp::Bitcast, Val::F64(f)) if to_bits == Some(64) => Val::Int {
                bits: 64,
                value: f.to_bits(),
            },
            (CastOp::Bitcast, Val::F32(f)) if to_bits == Some(32) => Val::Int {
                bits: 32,
                value: u64::from(f.to_bits()),
            },
            (CastOp::Bitcast, Val::Int { bits, .. }) if to_bits == Some(*bits) => v.clone(),
            (_, Val::Undef) => Val::Undef,
            _ => return Err(bad(&v)),
        })
    }
}

pub(crate) fn into_error(trap: Trap) -> SimError {
    match trap {
        Trap::Error(err) => err,
        Trap::ThreadExit => SimError::Unsupported("thread exit outside a thread".into()),
    }
}
