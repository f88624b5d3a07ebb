//! Channel lowering: make, send, receive and close.
//!
//! Two runtime backends exist. The fixed-width FIFO backend moves scalar
//! elements of at most 64 bits and hands received elements back as a raw
//! 64-bit word. The generic backend works from a runtime type descriptor,
//! copies elements through memory, and is the only one able to report
//! whether a receive got a value or saw a closed channel.
//!
//! Which backend a channel uses is a pure function of its element type and
//! the codegen options, so every operation on a channel value agrees with
//! the constructor that produced it.

use tracing::debug;

use crate::error::CodegenError;
use crate::lir::{self, CastOp, Value};
use crate::ssa::{self, ConstValue, Ty};

use super::{CodeGen, Frame, TypedValue};

/// The runtime implementation behind a channel type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelBackend {
    /// Fixed-width FIFO; `width` is the element size in bits.
    Fifo { width: u8 },
    /// Descriptor-driven generic channel.
    Generic,
}

/// Why the FIFO backend declined a receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvLimitation {
    /// A success flag was requested; FIFO receives only return the element.
    SuccessFlag,
    /// The channel lives on the generic backend.
    NotFifo,
}

impl RecvLimitation {
    pub fn reason(self) -> &'static str {
        match self {
            RecvLimitation::SuccessFlag => "fifo receive cannot report a success flag",
            RecvLimitation::NotFifo => "channel uses the generic backend",
        }
    }
}

/// Answer of the FIFO backend to "can you lower this receive?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvCapability {
    Supported { width: u8 },
    Unsupported(RecvLimitation),
}

/// The result of a receive: the element and, when requested, the flag
/// telling a real value from a closed channel's zero value.
#[derive(Debug, Clone, PartialEq)]
pub struct Received {
    pub value: TypedValue,
    pub ok: Option<TypedValue>,
}

fn chan_elem(chan: &TypedValue, op: &'static str) -> Result<Ty, CodegenError> {
    chan.ty
        .chan_elem()
        .cloned()
        .ok_or_else(|| CodegenError::UnexpectedType {
            op,
            expected: "channel",
            found: chan.ty.clone(),
        })
}

impl CodeGen {
    /// The backend channels of element type `elem` are built on.
    pub fn channel_backend(&self, elem: &Ty) -> ChannelBackend {
        if self.options.fifo_channels {
            if let Some(width) = self.layout.fifo_width(elem) {
                return ChannelBackend::Fifo { width };
            }
        }
        ChannelBackend::Generic
    }

    // ── make ─────────────────────────────────────────────────────────

    /// Lower `make(chan T, cap)`, picking the backend from `T`.
    pub fn codegen_make_chan(
        &mut self,
        fr: &mut Frame,
        chan_ty: &Ty,
        cap: &ssa::Value,
    ) -> Result<TypedValue, CodegenError> {
        let elem = chan_ty.chan_elem().ok_or_else(|| CodegenError::UnexpectedType {
            op: "make",
            expected: "channel",
            found: chan_ty.clone(),
        })?;
        let backend = self.channel_backend(elem);
        debug!(chan = %chan_ty, ?backend, "make channel");
        match backend {
            ChannelBackend::Fifo { .. } => self.codegen_make_chan_fifo(fr, chan_ty, cap),
            ChannelBackend::Generic => self.codegen_make_chan_generic(fr, chan_ty, cap),
        }
    }

    /// `strand_chan_new_fifo(width, cap)`.
    pub fn codegen_make_chan_fifo(
        &mut self,
        fr: &mut Frame,
        chan_ty: &Ty,
        cap: &ssa::Value,
    ) -> Result<TypedValue, CodegenError> {
        let elem = chan_ty.chan_elem().ok_or_else(|| CodegenError::UnexpectedType {
            op: "make",
            expected: "channel",
            found: chan_ty.clone(),
        })?;
        let width = self
            .layout
            .fifo_width(elem)
            .ok_or_else(|| CodegenError::UnexpectedType {
                op: "make fifo channel",
                expected: "fixed-width element",
                found: chan_ty.clone(),
            })?;
        let capacity = self.channel_capacity(fr, cap)?;
        let width = Value::const_int(8, i64::from(width));
        let ch = self.call_runtime_value(fr, "strand_chan_new_fifo", &[width, capacity], "chan")?;
        Ok(TypedValue::new(ch, chan_ty.clone()))
    }

    /// `strand_chan_new(tydesc, cap)`.
    pub fn codegen_make_chan_generic(
        &mut self,
        fr: &mut Frame,
        chan_ty: &Ty,
        cap: &ssa::Value,
    ) -> Result<TypedValue, CodegenError> {
        let capacity = self.channel_capacity(fr, cap)?;
        let tydesc = self.type_descriptor(fr, chan_ty)?;
        let ch = self.call_runtime_value(fr, "strand_chan_new", &[tydesc, capacity], "chan")?;
        Ok(TypedValue::new(ch, chan_ty.clone()))
    }

    /// The capacity operand as an `iP`. Non-integers and negative constants
    /// are rejected.
    fn channel_capacity(&mut self, fr: &mut Frame, cap: &ssa::Value) -> Result<Value, CodegenError> {
        if let ssa::Value::Const(c) = cap {
            if let ConstValue::Int(n) = c.value {
                if n < 0 {
                    return Err(CodegenError::UnsupportedCapacity(n.to_string()));
                }
            }
        }
        let tv = self.resolve_value(fr, cap)?;
        if !tv.ty.is_integer() {
            return Err(CodegenError::UnsupportedCapacity(format!("value of type `{}`", tv.ty)));
        }
        Ok(self.convert(fr, tv, &Ty::Uintptr)?.value)
    }

    // ── send ─────────────────────────────────────────────────────────

    /// Lower `ch <- v` on whichever backend the channel uses.
    pub fn codegen_chan_send(
        &mut self,
        fr: &mut Frame,
        ch: &ssa::Value,
        value: &ssa::Value,
    ) -> Result<(), CodegenError> {
        let chan = self.resolve_value(fr, ch)?;
        let elem = chan_elem(&chan, "send")?;
        let value = self.resolve_value(fr, value)?;
        match self.channel_backend(&elem) {
            ChannelBackend::Fifo { .. } => self.codegen_chan_send_fifo(fr, &chan, value),
            ChannelBackend::Generic => self.codegen_chan_send_generic(fr, &chan, value),
        }
    }

    /// `strand_chan_send_fifo(ch, &v)`.
    pub fn codegen_chan_send_fifo(
        &mut self,
        fr: &mut Frame,
        chan: &TypedValue,
        value: TypedValue,
    ) -> Result<(), CodegenError> {
        let elem = chan_elem(chan, "send")?;
        let value = self.convert(fr, value, &elem)?;
        let ptr = self.spill(fr, &value.value, "send")?;
        self.call_runtime(fr, "strand_chan_send_fifo", &[chan.value.clone(), ptr], "")?;
        Ok(())
    }

    /// `strand_chan_send(tydesc, ch, &v)`.
    pub fn codegen_chan_send_generic(
        &mut self,
        fr: &mut Frame,
        chan: &TypedValue,
        value: TypedValue,
    ) -> Result<(), CodegenError> {
        let elem = chan_elem(chan, "send")?;
        let value = self.convert(fr, value, &elem)?;
        let ptr = self.spill(fr, &value.value, "send")?;
        let tydesc = self.type_descriptor(fr, &chan.ty)?;
        self.call_runtime(fr, "strand_chan_send", &[tydesc, chan.value.clone(), ptr], "")?;
        Ok(())
    }

    // ── receive ──────────────────────────────────────────────────────

    /// Whether the FIFO backend can lower a receive of `elem`.
    pub fn fifo_recv_capability(&self, elem: &Ty, comma_ok: bool) -> RecvCapability {
        match self.channel_backend(elem) {
            ChannelBackend::Generic => RecvCapability::Unsupported(RecvLimitation::NotFifo),
            ChannelBackend::Fifo { .. } if comma_ok => {
                RecvCapability::Unsupported(RecvLimitation::SuccessFlag)
            }
            ChannelBackend::Fifo { width } => RecvCapability::Supported { width },
        }
    }

    /// Lower `<-ch` (or `v, ok := <-ch`), using the FIFO backend when it
    /// can do the job and the generic backend otherwise.
    pub fn codegen_chan_recv(
        &mut self,
        fr: &mut Frame,
        ch: &ssa::Value,
        comma_ok: bool,
    ) -> Result<Received, CodegenError> {
        let chan = self.resolve_value(fr, ch)?;
        let elem = chan_elem(&chan, "receive")?;
        match self.fifo_recv_capability(&elem, comma_ok) {
            RecvCapability::Supported { .. } => self.codegen_chan_recv_fifo(fr, &chan, comma_ok),
            RecvCapability::Unsupported(limitation) => {
                debug!(chan = %chan.ty, reason = limitation.reason(), "receive falls back to generic backend");
                self.codegen_chan_recv_generic(fr, &chan, comma_ok)
            }
        }
    }

    /// `strand_chan_recv_fifo(ch)`, decoding the returned word into the
    /// element type. Fails with [`CodegenError::UnsupportedRecv`] when a
    /// success flag is requested.
    pub fn codegen_chan_recv_fifo(
        &mut self,
        fr: &mut Frame,
        chan: &TypedValue,
        comma_ok: bool,
    ) -> Result<Received, CodegenError> {
        let elem = chan_elem(chan, "receive")?;
        if comma_ok {
            return Err(CodegenError::UnsupportedRecv { elem });
        }
        let elem_ty = self.layout.lir_type(&elem);
        let slot = fr.builder.build_entry_alloca(elem_ty.clone(), "recv")?;
        let word = self.call_runtime_value(fr, "strand_chan_recv_fifo", &[chan.value.clone()], "word")?;
        let decoded = decode_word(fr, &word, &elem_ty)?;
        fr.builder.build_store(&decoded, &slot)?;
        let value = fr.builder.build_load(&slot, "elem")?;
        Ok(Received {
            value: TypedValue::new(value, elem),
            ok: None,
        })
    }

    /// `strand_chan_recv2(tydesc, ch, &out)` when a success flag is wanted,
    /// `strand_chan_recv(tydesc, ch, &out)` otherwise.
    pub fn codegen_chan_recv_generic(
        &mut self,
        fr: &mut Frame,
        chan: &TypedValue,
        comma_ok: bool,
    ) -> Result<Received, CodegenError> {
        let elem = chan_elem(chan, "receive")?;
        let elem_ty = self.layout.lir_type(&elem);
        let slot = fr.builder.build_entry_alloca(elem_ty, "recv")?;
        let out = fr.builder.build_bitcast(&slot, lir::Type::opaque_ptr(), "")?;
        let tydesc = self.type_descriptor(fr, &chan.ty)?;
        let args = [tydesc, chan.value.clone(), out];
        let ok = if comma_ok {
            let ok = self.call_runtime_value(fr, "strand_chan_recv2", &args, "ok")?;
            Some(TypedValue::new(ok, Ty::Bool))
        } else {
            self.call_runtime(fr, "strand_chan_recv", &args, "")?;
            None
        };
        let value = fr.builder.build_load(&slot, "elem")?;
        Ok(Received {
            value: TypedValue::new(value, elem),
            ok,
        })
    }

    // ── close ────────────────────────────────────────────────────────

    /// `strand_chan_close(ch)`.
    pub fn codegen_chan_close(&mut self, fr: &mut Frame, ch: &ssa::Value) -> Result<(), CodegenError> {
        let chan = self.resolve_value(fr, ch)?;
        chan_elem(&chan, "close")?;
        self.call_runtime(fr, "strand_chan_close", &[chan.value], "")?;
        Ok(())
    }
}

/// Reinterpret the FIFO runtime's 64-bit word as an element of `ty`.
///
/// Integers travel zero-extended in the low bits, floats as their IEEE bit
/// pattern, pointers as their address, booleans as 0 or 1.
fn decode_word(fr: &mut Frame, word: &Value, ty: &lir::Type) -> Result<Value, CodegenError> {
    let b = &mut fr.builder;
    let value = match ty {
        lir::Type::Int(64) => word.clone(),
        lir::Type::Int(bits) => b.build_cast(CastOp::Trunc, word, lir::Type::Int(*bits), "trunc")?,
        lir::Type::F64 => b.build_cast(CastOp::Bitcast, word, lir::Type::F64, "bits")?,
        lir::Type::F32 => {
            let low = b.build_cast(CastOp::Trunc, word, lir::Type::i32(), "trunc")?;
            b.build_cast(CastOp::Bitcast, &low, lir::Type::F32, "bits")?
        }
        lir::Type::Ptr(_) => b.build_cast(CastOp::IntToPtr, word, ty.clone(), "addr")?,
        other => {
            return Err(CodegenError::Internal(format!(
                "fifo channel element `{other}` cannot be decoded from a word"
            )))
        }
    };
    Ok(value)
}
