//! The SSA input model consumed by the lowering.
//!
//! SSA construction happens upstream; these types carry only what the
//! concurrency lowering needs to know about a well-typed program: values
//! and their types, call instructions, and select statements together
//! with the uses of their result tuple.

pub mod types;

pub use types::{ChanDir, Signature, Ty};

/// Stable identity of an SSA local. Two [`Local`]s with the same id are the
/// same variable, whatever their names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    Int(i64),
    Bool(bool),
    Float(f64),
    /// The zero value of a pointer, channel, or function type.
    Nil,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Const {
    pub ty: Ty,
    pub value: ConstValue,
}

/// A reference to a top-level function.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FuncRef {
    pub name: String,
    pub sig: Signature,
}

/// Built-in operations that have no address of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    Recover,
    Close,
    Panic,
}

/// A package-level variable. As an SSA value it denotes the variable's
/// address, so its type is a pointer to `elem`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GlobalRef {
    pub name: String,
    pub elem: Ty,
}

/// A function-local SSA value: a parameter or an instruction result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Local {
    pub id: ValueId,
    pub name: String,
    pub ty: Ty,
}

impl Local {
    pub fn new(id: u32, name: impl Into<String>, ty: Ty) -> Self {
        Local {
            id: ValueId(id),
            name: name.into(),
            ty,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Const(Const),
    Function(FuncRef),
    Builtin(Builtin),
    Global(GlobalRef),
    Local(Local),
}

impl Value {
    pub fn int(ty: Ty, value: i64) -> Value {
        Value::Const(Const {
            ty,
            value: ConstValue::Int(value),
        })
    }

    pub fn bool(value: bool) -> Value {
        Value::Const(Const {
            ty: Ty::Bool,
            value: ConstValue::Bool(value),
        })
    }

    pub fn float(ty: Ty, value: f64) -> Value {
        Value::Const(Const {
            ty,
            value: ConstValue::Float(value),
        })
    }

    pub fn nil(ty: Ty) -> Value {
        Value::Const(Const {
            ty,
            value: ConstValue::Nil,
        })
    }

    pub fn function(name: impl Into<String>, sig: Signature) -> Value {
        Value::Function(FuncRef {
            name: name.into(),
            sig,
        })
    }

    pub fn global(name: impl Into<String>, elem: Ty) -> Value {
        Value::Global(GlobalRef {
            name: name.into(),
            elem,
        })
    }

    pub fn local(id: u32, name: impl Into<String>, ty: Ty) -> Value {
        Value::Local(Local::new(id, name, ty))
    }

    /// The static type of the value. Builtins have none.
    pub fn ty(&self) -> Option<Ty> {
        match self {
            Value::Const(c) => Some(c.ty.clone()),
            Value::Function(f) => Some(Ty::Func(f.sig.clone())),
            Value::Builtin(_) => None,
            Value::Global(g) => Some(Ty::pointer(g.elem.clone())),
            Value::Local(l) => Some(l.ty.clone()),
        }
    }

    pub fn as_local(&self) -> Option<&Local> {
        match self {
            Value::Local(l) => Some(l),
            _ => None,
        }
    }
}

// ── Calls ────────────────────────────────────────────────────────────

/// The callee and arguments shared by plain, deferred, and spawned calls.
#[derive(Debug, Clone, PartialEq)]
pub struct CallCommon {
    pub callee: Value,
    pub args: Vec<Value>,
}

impl CallCommon {
    pub fn new(callee: Value, args: Vec<Value>) -> Self {
        CallCommon { callee, args }
    }

    /// A statically dispatched method call; the receiver is the first
    /// argument.
    pub fn method(callee: Value, recv: Value, args: Vec<Value>) -> Self {
        let mut all = Vec::with_capacity(args.len() + 1);
        all.push(recv);
        all.extend(args);
        CallCommon { callee, args: all }
    }

    pub fn builtin(builtin: Builtin, args: Vec<Value>) -> Self {
        CallCommon {
            callee: Value::Builtin(builtin),
            args,
        }
    }

    pub fn is_builtin(&self, builtin: Builtin) -> bool {
        self.callee == Value::Builtin(builtin)
    }

    /// The callee followed by the arguments, in evaluation order.
    pub fn operands(&self) -> impl Iterator<Item = &Value> {
        std::iter::once(&self.callee).chain(self.args.iter())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Call,
    Defer,
    Go,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallInstruction {
    pub kind: CallKind,
    pub common: CallCommon,
}

impl CallInstruction {
    pub fn defer(common: CallCommon) -> Self {
        CallInstruction {
            kind: CallKind::Defer,
            common,
        }
    }

    pub fn go(common: CallCommon) -> Self {
        CallInstruction {
            kind: CallKind::Go,
            common,
        }
    }

    pub fn call(common: CallCommon) -> Self {
        CallInstruction {
            kind: CallKind::Call,
            common,
        }
    }
}

// ── Select ───────────────────────────────────────────────────────────

/// One case of a select statement.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectState {
    /// `Send` or `Recv`.
    pub dir: ChanDir,
    pub chan: Value,
    /// The value to send, for send cases.
    pub send: Option<Value>,
}

impl SelectState {
    pub fn send(chan: Value, value: Value) -> Self {
        SelectState {
            dir: ChanDir::Send,
            chan,
            send: Some(value),
        }
    }

    pub fn recv(chan: Value) -> Self {
        SelectState {
            dir: ChanDir::Recv,
            chan,
            send: None,
        }
    }

    pub fn is_recv(&self) -> bool {
        self.dir == ChanDir::Recv
    }
}

/// An extract from the select result tuple
/// `(index, recvOk, recv_0, ..., recv_k)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extract {
    pub index: usize,
    /// How many instructions use the extracted value.
    pub referrers: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub states: Vec<SelectState>,
    /// `false` when the select has a default case.
    pub blocking: bool,
    pub extracts: Vec<Extract>,
}

impl Select {
    pub fn new(states: Vec<SelectState>, blocking: bool) -> Self {
        Select {
            states,
            blocking,
            extracts: Vec::new(),
        }
    }

    /// Record that tuple position `index` is extracted and used
    /// `referrers` times.
    pub fn with_extract(mut self, index: usize, referrers: usize) -> Self {
        self.extracts.push(Extract { index, referrers });
        self
    }

    /// Whether the value of the `recv_index`-th receive case is consumed.
    pub fn receive_used(&self, recv_index: usize) -> bool {
        self.extracts
            .iter()
            .any(|e| e.index == recv_index + 2 && e.referrers > 0)
    }

    pub fn has_receive(&self) -> bool {
        self.states.iter().any(SelectState::is_recv)
    }
}
