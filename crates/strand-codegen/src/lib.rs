//! Concurrency lowering for the Strand compiler backend.
//!
//! This crate turns the concurrency constructs of a type-checked, SSA-form
//! Strand program (channel creation, send, receive and close, multi-way
//! select, `defer`, `go` and `recover`) into explicit low-level IR that
//! calls the Strand runtime, synthesizing thunks and thread entry adapters
//! on the way.
//!
//! ## Architecture
//!
//! - [`ssa`]: The SSA input model (types, values, calls, selects)
//! - [`lir`]: The LLVM-shaped output IR, with builder, printer and verifier
//! - [`codegen`]: The lowering itself
//! - [`options`]: Codegen options
//! - `llvm` (feature `llvm`): Translation of LIR modules into LLVM modules
//!
//! ## Pipeline
//!
//! ```text
//! SSA call/select/channel ops -> CodeGen (+ Frame per function) -> LIR Module -> LLVM IR
//! ```

pub mod codegen;
pub mod error;
pub mod lir;
#[cfg(feature = "llvm")]
pub mod llvm;
pub mod options;
pub mod ssa;

pub use codegen::{CodeGen, Frame, TypedValue};
pub use error::CodegenError;
pub use options::CodegenOptions;
