//! Per-function lowering state.

use rustc_hash::FxHashMap;

use crate::lir::{FunctionBuilder, Value};
use crate::ssa::{Local, Ty, ValueId};

/// A generated value paired with its source-level type.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedValue {
    pub value: Value,
    pub ty: Ty,
}

impl TypedValue {
    pub fn new(value: Value, ty: Ty) -> Self {
        TypedValue { value, ty }
    }
}

/// State for lowering exactly one function.
///
/// A frame owns the function's builder (with its entry-block slot
/// allocator), the environment mapping SSA locals to generated values, and
/// the recoverable flag. Thunks and thread entries get their own frames,
/// which never see the environment of the frame that created them.
pub struct Frame {
    pub builder: FunctionBuilder,
    env: FxHashMap<ValueId, TypedValue>,
    /// `i1`; whether `recover` may stop a panic from this function.
    can_recover: Value,
}

impl Frame {
    pub fn new(builder: FunctionBuilder) -> Self {
        Frame {
            builder,
            env: FxHashMap::default(),
            can_recover: Value::const_bool(false),
        }
    }

    pub fn bind(&mut self, local: &Local, value: TypedValue) {
        self.env.insert(local.id, value);
    }

    pub fn lookup(&self, id: ValueId) -> Option<&TypedValue> {
        self.env.get(&id)
    }

    pub fn can_recover(&self) -> &Value {
        &self.can_recover
    }

    pub fn set_can_recover(&mut self, flag: Value) {
        self.can_recover = flag;
    }

    pub fn finish(self) -> crate::lir::Function {
        self.builder.finish()
    }
}
