//! An interpreter for Strand LIR with a reference channel runtime.
//!
//! `strand-sim` executes the modules produced by `strand-codegen` without an
//! LLVM installation, so the lowering can be tested by behavior instead of
//! by IR shape alone: values sent on a channel come back in order, select
//! picks the case index it should, thunks see the values they captured.
//!
//! ## Architecture
//!
//! - [`memory`]: values, pointers and the object store backing allocas,
//!   globals and heap allocations
//! - [`interp`]: [`Machine`], the block-by-block LIR interpreter
//! - [`runtime`]: the `strand_*` primitives (channels, select, defer,
//!   threads, heap)
//!
//! ## Threads
//!
//! The simulator is single-threaded. A spawned thread is queued and runs to
//! completion when the running thread would otherwise block, and every queued
//! thread is drained before [`Machine::run`] returns.

pub mod interp;
pub mod memory;
pub mod runtime;

pub use interp::{ExternalCall, Machine};
pub use memory::{Addr, Ptr, Val};
pub use runtime::RuntimeStats;

/// Failures of a simulated program.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SimError {
    #[error("all threads are blocked: {0}")]
    Deadlock(String),

    #[error("panic: {0}")]
    Panic(String),

    #[error("call to unknown function '{0}'")]
    UnknownFunction(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("bad memory access: {0}")]
    BadMemory(String),

    #[error("type error: {0}")]
    Type(String),

    #[error("reached unreachable code in @{0}")]
    Unreachable(String),

    #[error("invalid module: {0}")]
    InvalidModule(#[from] strand_codegen::lir::VerifyError),
}
