//! Multi-way select lowering.
//!
//! A select is lowered into a runtime descriptor that every case is
//! registered with, followed by one dispatch call returning the index of the
//! case that fired. Case `i` is registered with index `i`; the implicit
//! default case of a non-blocking select is registered first, with index -1.

use tracing::debug;

use crate::error::CodegenError;
use crate::lir::{self, Value};
use crate::ssa::{self, Ty};

use super::{CodeGen, Frame, TypedValue};

/// The lowered select result tuple `(index, recvOk, recv_0, ..., recv_k)`.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectResult {
    /// Winning case index as an `int`; -1 when the default case fired.
    pub index: TypedValue,
    /// Present when the select has at least one receive case.
    pub recv_ok: Option<TypedValue>,
    /// One entry per receive case, `None` for cases whose value is unused.
    pub recv_values: Vec<Option<TypedValue>>,
}

/// Per-case operands computed before registration.
struct CaseOperands {
    chan: Value,
    /// Opaque pointer to the value slot, or null for unused receives.
    slot: Value,
    /// The typed slot to load from after dispatch (used receives only).
    recv_slot: Option<(Value, Ty)>,
    is_recv: bool,
}

impl CodeGen {
    pub fn codegen_select(&mut self, fr: &mut Frame, sel: &ssa::Select) -> Result<SelectResult, CodegenError> {
        let size = sel.states.len() + usize::from(!sel.blocking);
        debug!(
            cases = sel.states.len(),
            blocking = sel.blocking,
            size,
            "lower select"
        );
        let size = Value::const_int(32, size as i64);
        let desc = self.call_runtime_value(fr, "strand_select_new", &[size], "select")?;

        let mut cases = Vec::with_capacity(sel.states.len());
        let mut recv_index = 0;
        for state in &sel.states {
            let chan = self.resolve_value(fr, &state.chan)?;
            let elem = chan
                .ty
                .chan_elem()
                .cloned()
                .ok_or_else(|| CodegenError::UnexpectedType {
                    op: "select",
                    expected: "channel",
                    found: chan.ty.clone(),
                })?;
            if state.is_recv() {
                let used = sel.receive_used(recv_index);
                recv_index += 1;
                let (slot, recv_slot) = if used {
                    let elem_ty = self.layout.lir_type(&elem);
                    let typed = fr.builder.build_entry_alloca(elem_ty, "selrecv")?;
                    let opaque = fr.builder.build_bitcast(&typed, lir::Type::opaque_ptr(), "")?;
                    (opaque, Some((typed, elem)))
                } else {
                    (Value::null(lir::Type::opaque_ptr()), None)
                };
                cases.push(CaseOperands {
                    chan: chan.value,
                    slot,
                    recv_slot,
                    is_recv: true,
                });
            } else {
                let send = state.send.as_ref().ok_or_else(|| {
                    CodegenError::Internal("select send case without a value".to_string())
                })?;
                let value = self.resolve_value(fr, send)?;
                let value = self.convert(fr, value, &elem)?;
                let slot = self.spill(fr, &value.value, "selsend")?;
                cases.push(CaseOperands {
                    chan: chan.value,
                    slot,
                    recv_slot: None,
                    is_recv: false,
                });
            }
        }

        let ok_slot = if sel.has_receive() {
            Some(fr.builder.build_entry_alloca(lir::Type::i1(), "selok")?)
        } else {
            None
        };

        if !sel.blocking {
            self.call_runtime(
                fr,
                "strand_select_default",
                &[desc.clone(), Value::const_int(32, -1)],
                "",
            )?;
        }
        for (i, case) in cases.iter().enumerate() {
            let index = Value::const_int(32, i as i64);
            match (&ok_slot, case.is_recv) {
                (Some(ok), true) => {
                    let args = [desc.clone(), case.chan.clone(), case.slot.clone(), ok.clone(), index];
                    self.call_runtime(fr, "strand_select_recv2", &args, "")?;
                }
                _ => {
                    let args = [desc.clone(), case.chan.clone(), case.slot.clone(), index];
                    self.call_runtime(fr, "strand_select_send", &args, "")?;
                }
            }
        }

        let winner = self.call_runtime_value(fr, "strand_select_go", &[desc], "index")?;
        // The runtime answers with a signed pointer-width index; -1 is the default case.
        let index_ty = Ty::Int {
            bits: self.layout.pointer_bits as u8,
            signed: true,
        };
        let index = self.convert(fr, TypedValue::new(winner, index_ty), &Ty::int())?;

        let mut recv_ok = None;
        let mut recv_values = Vec::new();
        if let Some(ok) = &ok_slot {
            let flag = fr.builder.build_load(ok, "recvok")?;
            recv_ok = Some(TypedValue::new(flag, Ty::Bool));
            for case in cases.iter().filter(|c| c.is_recv) {
                let value = match &case.recv_slot {
                    Some((slot, elem)) => {
                        let v = fr.builder.build_load(slot, "recv")?;
                        Some(TypedValue::new(v, elem.clone()))
                    }
                    None => None,
                };
                recv_values.push(value);
            }
        }

        Ok(SelectResult {
            index: TypedValue::new(index.value, Ty::int()),
            recv_ok,
            recv_values,
        })
    }
}
