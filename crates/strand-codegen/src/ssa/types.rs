//! Source-level types as handed over by SSA construction.

use std::fmt;

/// The direction a channel type permits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChanDir {
    /// `chan T`
    Both,
    /// `chan<- T`
    Send,
    /// `<-chan T`
    Recv,
}

/// A function signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub params: Vec<Ty>,
    /// `None` for functions without a result.
    pub result: Option<Box<Ty>>,
}

impl Signature {
    pub fn new(params: Vec<Ty>, result: Option<Ty>) -> Self {
        Signature {
            params,
            result: result.map(Box::new),
        }
    }
}

/// A fully resolved source type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Ty {
    Bool,
    Int { bits: u8, signed: bool },
    Uintptr,
    Float32,
    Float64,
    /// `unsafe.Pointer`
    UnsafePointer,
    Pointer(Box<Ty>),
    Chan { dir: ChanDir, elem: Box<Ty> },
    Struct(Vec<Ty>),
    Func(Signature),
}

impl Ty {
    /// The platform `int`, always 64 bits wide here.
    pub fn int() -> Ty {
        Ty::Int {
            bits: 64,
            signed: true,
        }
    }

    pub fn int32() -> Ty {
        Ty::Int {
            bits: 32,
            signed: true,
        }
    }

    pub fn uint8() -> Ty {
        Ty::Int {
            bits: 8,
            signed: false,
        }
    }

    /// A bidirectional channel of `elem`.
    pub fn chan(elem: Ty) -> Ty {
        Ty::Chan {
            dir: ChanDir::Both,
            elem: Box::new(elem),
        }
    }

    pub fn pointer(elem: Ty) -> Ty {
        Ty::Pointer(Box::new(elem))
    }

    pub fn func(params: Vec<Ty>, result: Option<Ty>) -> Ty {
        Ty::Func(Signature::new(params, result))
    }

    /// The element type of a channel type.
    pub fn chan_elem(&self) -> Option<&Ty> {
        match self {
            Ty::Chan { elem, .. } => Some(elem),
            _ => None,
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Ty::Int { .. } | Ty::Uintptr)
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, Ty::Int { signed: true, .. })
    }

    /// Whether the type is a single machine scalar (not an aggregate).
    pub fn is_scalar(&self) -> bool {
        !matches!(self, Ty::Struct(_))
    }

    /// A name for this type usable inside a symbol.
    ///
    /// Aggregates carry their arity so nested names stay unambiguous.
    pub fn mangle(&self) -> String {
        match self {
            Ty::Bool => "bool".into(),
            Ty::Int { bits, signed: true } => format!("i{bits}"),
            Ty::Int {
                bits,
                signed: false,
            } => format!("u{bits}"),
            Ty::Uintptr => "uintptr".into(),
            Ty::Float32 => "f32".into(),
            Ty::Float64 => "f64".into(),
            Ty::UnsafePointer => "unsafeptr".into(),
            Ty::Pointer(elem) => format!("ptr.{}", elem.mangle()),
            Ty::Chan { elem, .. } => format!("chan.{}", elem.mangle()),
            Ty::Struct(fields) => {
                let mut s = format!("struct{}", fields.len());
                for field in fields {
                    s.push('.');
                    s.push_str(&field.mangle());
                }
                s
            }
            Ty::Func(sig) => {
                let mut s = format!("func{}", sig.params.len());
                for param in &sig.params {
                    s.push('.');
                    s.push_str(&param.mangle());
                }
                match &sig.result {
                    Some(result) => {
                        s.push('.');
                        s.push_str(&result.mangle());
                    }
                    None => s.push_str(".void"),
                }
                s
            }
        }
    }
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::Bool => f.write_str("bool"),
            Ty::Int { bits, signed: true } => write!(f, "int{bits}"),
            Ty::Int {
                bits,
                signed: false,
            } => write!(f, "uint{bits}"),
            Ty::Uintptr => f.write_str("uintptr"),
            Ty::Float32 => f.write_str("float32"),
            Ty::Float64 => f.write_str("float64"),
            Ty::UnsafePointer => f.write_str("unsafe.Pointer"),
            Ty::Pointer(elem) => write!(f, "*{elem}"),
            Ty::Chan { dir, elem } => match dir {
                ChanDir::Both => write!(f, "chan {elem}"),
                ChanDir::Send => write!(f, "chan<- {elem}"),
                ChanDir::Recv => write!(f, "<-chan {elem}"),
            },
            Ty::Struct(fields) => {
                f.write_str("struct{")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str("; ")?;
                    }
                    write!(f, "{field}")?;
                }
                f.write_str("}")
            }
            Ty::Func(sig) => {
                f.write_str("func(")?;
                for (i, param) in sig.params.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{param}")?;
                }
                f.write_str(")")?;
                if let Some(result) = &sig.result {
                    write!(f, " {result}")?;
                }
                Ok(())
            }
        }
    }
}
