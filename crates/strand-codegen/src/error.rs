//! Errors raised while lowering.
//!
//! Every variant is an internal consistency fault: the SSA input violated an
//! invariant that type checking should have guaranteed, or the lowering
//! itself misused the builder. Backend limitations that have a fallback are
//! not errors; see [`RecvCapability`](crate::codegen::channels::RecvCapability).

use thiserror::Error;

use crate::lir::{BuildError, VerifyError};
use crate::ssa::Ty;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodegenError {
    #[error("captured value `{name}` has type `{found}`, but its record field holds `{expected}`")]
    CaptureTypeMismatch {
        name: String,
        expected: String,
        found: String,
    },

    #[error("unsupported channel capacity: {0}")]
    UnsupportedCapacity(String),

    #[error("the fixed-width channel backend cannot receive into `{elem}` with a success flag")]
    UnsupportedRecv { elem: Ty },

    #[error("cannot convert `{from}` to `{to}`")]
    UnsupportedConversion { from: Ty, to: Ty },

    #[error("value `{0}` is not bound in the current frame")]
    UnboundValue(String),

    #[error("builtin `{0:?}` cannot be used as a value")]
    BuiltinAsValue(crate::ssa::Builtin),

    #[error("`{op}` expects a {expected} operand, found `{found}`")]
    UnexpectedType {
        op: &'static str,
        expected: &'static str,
        found: Ty,
    },

    #[error("runtime function `{0}` is not declared")]
    MissingIntrinsic(String),

    #[error("invalid codegen options: {0}")]
    InvalidOptions(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Verify(#[from] VerifyError),
}
