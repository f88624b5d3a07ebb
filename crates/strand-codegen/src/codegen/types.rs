//! Source type to LIR type mapping and target layout.
//!
//! # Type mapping
//!
//! | Ty                 | LIR type                        |
//! |--------------------|---------------------------------|
//! | Bool               | i1                              |
//! | Int { bits, .. }   | iN                              |
//! | Uintptr            | iP (target pointer width)       |
//! | Float32 / Float64  | float / double                  |
//! | UnsafePointer      | i8*                             |
//! | Pointer(T)         | T*                              |
//! | Chan { .. }        | i8* (opaque runtime handle)     |
//! | Struct(fields)     | { field0, field1, ... }         |
//! | Func(sig)          | R (P0, P1, ...)* (code pointer) |

use crate::lir::{self, DescriptorKind, FnType};
use crate::ssa::{Signature, Ty};

/// Target-dependent layout facts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeLayout {
    pub pointer_bits: u32,
}

impl TypeLayout {
    pub fn new(pointer_bits: u32) -> Self {
        TypeLayout { pointer_bits }
    }

    /// The pointer-sized integer type (`iP`).
    pub fn int_ptr_type(&self) -> lir::Type {
        lir::Type::Int(self.pointer_bits)
    }

    pub fn lir_type(&self, ty: &Ty) -> lir::Type {
        match ty {
            Ty::Bool => lir::Type::i1(),
            Ty::Int { bits, .. } => lir::Type::Int(u32::from(*bits)),
            Ty::Uintptr => self.int_ptr_type(),
            Ty::Float32 => lir::Type::F32,
            Ty::Float64 => lir::Type::F64,
            Ty::UnsafePointer | Ty::Chan { .. } => lir::Type::opaque_ptr(),
            Ty::Pointer(elem) => self.lir_type(elem).ptr_to(),
            Ty::Struct(fields) => lir::Type::Struct(fields.iter().map(|f| self.lir_type(f)).collect()),
            Ty::Func(sig) => self.fn_type(sig).ptr_type(),
        }
    }

    pub fn fn_type(&self, sig: &Signature) -> FnType {
        let params = sig.params.iter().map(|p| self.lir_type(p)).collect();
        let ret = match &sig.result {
            Some(result) => self.lir_type(result),
            None => lir::Type::Void,
        };
        FnType::new(params, ret)
    }

    // ── Sizes ────────────────────────────────────────────────────────

    /// Allocation size of an LIR type in bytes, padded to its alignment.
    pub fn lir_size_of(&self, ty: &lir::Type) -> u64 {
        match ty {
            lir::Type::Void => 0,
            lir::Type::Int(bits) => u64::from(bits.div_ceil(8)).next_power_of_two(),
            lir::Type::F32 => 4,
            lir::Type::F64 => 8,
            lir::Type::Ptr(_) | lir::Type::Func(_) => u64::from(self.pointer_bits / 8),
            lir::Type::Struct(fields) => {
                let mut offset = 0u64;
                for field in fields {
                    let align = self.lir_align_of(field);
                    offset = offset.next_multiple_of(align) + self.lir_size_of(field);
                }
                offset.next_multiple_of(self.lir_align_of(ty))
            }
        }
    }

    pub fn lir_align_of(&self, ty: &lir::Type) -> u64 {
        match ty {
            lir::Type::Struct(fields) => fields.iter().map(|f| self.lir_align_of(f)).max().unwrap_or(1),
            lir::Type::Void => 1,
            other => self.lir_size_of(other).clamp(1, 8),
        }
    }

    pub fn size_of(&self, ty: &Ty) -> u64 {
        self.lir_size_of(&self.lir_type(ty))
    }

    pub fn align_of(&self, ty: &Ty) -> u64 {
        self.lir_align_of(&self.lir_type(ty))
    }

    /// Element width in bits for the fixed-width FIFO channel runtime, or
    /// `None` when the element cannot travel in a single 64-bit word.
    pub fn fifo_width(&self, elem: &Ty) -> Option<u8> {
        if !elem.is_scalar() {
            return None;
        }
        let bits = self.size_of(elem) * 8;
        if bits == 0 || bits > 64 {
            return None;
        }
        u8::try_from(bits).ok()
    }

    /// Kind tag of the runtime type descriptor for `ty`.
    pub fn descriptor_kind(&self, ty: &Ty) -> DescriptorKind {
        match ty {
            Ty::Bool => DescriptorKind::Bool,
            Ty::Int { signed: true, .. } => DescriptorKind::Int,
            Ty::Int { signed: false, .. } => DescriptorKind::Uint,
            Ty::Uintptr => DescriptorKind::Uintptr,
            Ty::Float32 | Ty::Float64 => DescriptorKind::Float,
            Ty::UnsafePointer => DescriptorKind::UnsafePointer,
            Ty::Pointer(_) => DescriptorKind::Pointer,
            Ty::Chan { .. } => DescriptorKind::Chan,
            Ty::Struct(_) => DescriptorKind::Struct,
            Ty::Func(_) => DescriptorKind::Func,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_mapping() {
        let layout = TypeLayout::new(64);
        assert_eq!(layout.lir_type(&Ty::Bool), lir::Type::i1());
        assert_eq!(layout.lir_type(&Ty::Uintptr), lir::Type::i64());
        assert_eq!(layout.lir_type(&Ty::chan(Ty::int())), lir::Type::opaque_ptr());
        assert_eq!(
            layout.lir_type(&Ty::pointer(Ty::int32())),
            lir::Type::i32().ptr_to()
        );
        assert_eq!(TypeLayout::new(32).lir_type(&Ty::Uintptr), lir::Type::i32());
    }

    #[test]
    fn struct_layout_is_padded() {
        let layout = TypeLayout::new(64);
        let ty = Ty::Struct(vec![Ty::Bool, Ty::int(), Ty::int32()]);
        assert_eq!(layout.size_of(&ty), 24);
        assert_eq!(layout.align_of(&ty), 8);
        assert_eq!(layout.size_of(&Ty::Struct(vec![])), 0);
    }

    #[test]
    fn fifo_widths() {
        let layout = TypeLayout::new(64);
        assert_eq!(layout.fifo_width(&Ty::int32()), Some(32));
        assert_eq!(layout.fifo_width(&Ty::Bool), Some(8));
        assert_eq!(layout.fifo_width(&Ty::Float64), Some(64));
        assert_eq!(layout.fifo_width(&Ty::pointer(Ty::Bool)), Some(64));
        assert_eq!(TypeLayout::new(32).fifo_width(&Ty::UnsafePointer), Some(32));
        assert_eq!(layout.fifo_width(&Ty::Struct(vec![Ty::int32()])), None);
    }

    #[test]
    fn function_values_are_code_pointers() {
        let layout = TypeLayout::new(64);
        let ty = Ty::func(vec![Ty::int()], None);
        assert_eq!(layout.lir_type(&ty).to_string(), "void (i64)*");
    }
}
