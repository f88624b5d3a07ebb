//! Textual rendering of LIR in LLVM assembly syntax.

use std::fmt::{self, Display, Formatter, Write};

use super::{
    FnType, FnTypeDisplay, Function, Global, GlobalInit, Inst, InstKind, Linkage, Module, Type,
    TypeDescriptor, Value, ValueKind,
};
use super::{sign_extend, FnAttr};

impl Display for Type {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => f.write_str("void"),
            Type::Int(bits) => write!(f, "i{bits}"),
            Type::F32 => f.write_str("float"),
            Type::F64 => f.write_str("double"),
            Type::Ptr(inner) => write!(f, "{inner}*"),
            Type::Struct(fields) => {
                if fields.is_empty() {
                    return f.write_str("{}");
                }
                f.write_str("{ ")?;
                write_list(f, fields)?;
                f.write_str(" }")
            }
            Type::Func(fn_ty) => write!(f, "{}", FnTypeDisplay(fn_ty)),
        }
    }
}

impl Display for FnTypeDisplay<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} (", self.0.ret)?;
        write_list(f, &self.0.params)?;
        f.write_str(")")
    }
}

fn write_list<T: Display>(f: &mut Formatter<'_>, items: &[T]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

/// Renders the operand alone, without its type.
impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ValueKind::Inst(_, name) => write!(f, "%{name}"),
            ValueKind::Param(i) => write!(f, "%p{i}"),
            ValueKind::ConstInt(v) => match self.ty {
                Type::Int(1) => f.write_str(if *v != 0 { "true" } else { "false" }),
                Type::Int(bits) => write!(f, "{}", sign_extend(*v, bits)),
                _ => write!(f, "{v}"),
            },
            ValueKind::ConstFloat(v) => write!(f, "{v:?}"),
            ValueKind::Null => f.write_str("null"),
            ValueKind::Undef => f.write_str("undef"),
            ValueKind::Function(name) | ValueKind::Global(name) => write!(f, "@{name}"),
            ValueKind::BlockAddress { function, block } => {
                write!(f, "blockaddress(@{function}, %{block})")
            }
        }
    }
}

/// `T v`, the form operands take in most instruction positions.
struct Typed<'a>(&'a Value);

impl Display for Typed<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.0.ty, self.0)
    }
}

/// An instruction rendered in the context of its function (for block names).
pub struct InstDisplay<'a> {
    pub inst: &'a Inst,
    pub func: &'a Function,
}

impl InstDisplay<'_> {
    fn block(&self, id: super::BlockId) -> &str {
        self.func.block(id).map(|b| b.name.as_str()).unwrap_or("<invalid>")
    }
}

impl Display for InstDisplay<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let inst = self.inst;
        if inst.id.is_some() {
            write!(f, "%{} = ", inst.name)?;
        }
        match &inst.kind {
            InstKind::Alloca { ty } => write!(f, "alloca {ty}"),
            InstKind::Load { ptr } => write!(f, "load {}, {}", inst.ty, Typed(ptr)),
            InstKind::Store { value, ptr } => write!(f, "store {}, {}", Typed(value), Typed(ptr)),
            InstKind::StructGep { ptr, index } => {
                let pointee = ptr.ty.pointee().cloned().unwrap_or(Type::Void);
                write!(
                    f,
                    "getelementptr inbounds {pointee}, {}, i32 0, i32 {index}",
                    Typed(ptr)
                )
            }
            InstKind::Cast { op, value } => write!(f, "{op} {} to {}", Typed(value), inst.ty),
            InstKind::Call { callee, args } => {
                write!(f, "call {} {callee}(", inst.ty)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", Typed(arg))?;
                }
                f.write_str(")")
            }
            InstKind::Phi { incoming } => {
                write!(f, "phi {} ", inst.ty)?;
                for (i, (value, block)) in incoming.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "[ {value}, %{} ]", self.block(*block))?;
                }
                Ok(())
            }
            InstKind::Br { target } => write!(f, "br label %{}", self.block(*target)),
            InstKind::CondBr {
                cond,
                then_block,
                else_block,
            } => write!(
                f,
                "br {}, label %{}, label %{}",
                Typed(cond),
                self.block(*then_block),
                self.block(*else_block)
            ),
            InstKind::Ret { value: Some(v) } => write!(f, "ret {}", Typed(v)),
            InstKind::Ret { value: None } => f.write_str("ret void"),
            InstKind::Unreachable => f.write_str("unreachable"),
        }
    }
}

fn write_attrs(f: &mut Formatter<'_>, func: &Function) -> fmt::Result {
    for attr in &func.attrs {
        match attr {
            FnAttr::NoReturn => f.write_str(" noreturn")?,
        }
    }
    Ok(())
}

fn write_params(f: &mut Formatter<'_>, ty: &FnType, named: bool) -> fmt::Result {
    for (i, param) in ty.params.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        if named {
            write!(f, "{param} %p{i}")?;
        } else {
            write!(f, "{param}")?;
        }
    }
    Ok(())
}

impl Display for Function {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_declaration() {
            write!(f, "declare {} @{}(", self.ty.ret, self.name)?;
            write_params(f, &self.ty, false)?;
            f.write_str(")")?;
            return write_attrs(f, self);
        }
        let linkage = match self.linkage {
            Linkage::External => "",
            Linkage::Internal => "internal ",
        };
        write!(f, "define {linkage}{} @{}(", self.ty.ret, self.name)?;
        write_params(f, &self.ty, true)?;
        f.write_str(")")?;
        write_attrs(f, self)?;
        f.write_str(" {\n")?;
        for (i, block) in self.blocks.iter().enumerate() {
            if i > 0 {
                f.write_char('\n')?;
            }
            writeln!(f, "{}:", block.name)?;
            for inst in &block.insts {
                writeln!(f, "  {}", InstDisplay { inst, func: self })?;
            }
        }
        f.write_str("}")
    }
}

fn write_descriptor(f: &mut Formatter<'_>, desc: &TypeDescriptor) -> fmt::Result {
    let layout = TypeDescriptor::layout();
    write!(
        f,
        "{layout} {{ i8 {}, i64 {}, i64 {}, i8* ",
        desc.kind.code(),
        desc.size,
        desc.align
    )?;
    match &desc.elem {
        Some(elem) => write!(f, "bitcast ({layout}* @{elem} to i8*)")?,
        None => f.write_str("null")?,
    }
    f.write_str(" }")
}

impl Display for Global {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.init {
            GlobalInit::TypeDescriptor(desc) => {
                let kw = if self.constant { "constant" } else { "global" };
                write!(f, "@{} = internal {kw} ", self.name)?;
                write_descriptor(f, desc)
            }
            GlobalInit::Zero => {
                let kw = if self.constant { "constant" } else { "global" };
                write!(f, "@{} = {kw} {} zeroinitializer", self.name, self.ty)
            }
        }
    }
}

impl Display for Module {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "; ModuleID = '{}'", self.name)?;
        if !self.globals().is_empty() {
            f.write_char('\n')?;
            for global in self.globals() {
                writeln!(f, "{global}")?;
            }
        }
        let (decls, defs): (Vec<_>, Vec<_>) =
            self.functions().iter().partition(|func| func.is_declaration());
        if !decls.is_empty() {
            f.write_char('\n')?;
            for func in decls {
                writeln!(f, "{func}")?;
            }
        }
        for func in defs {
            writeln!(f, "\n{func}")?;
        }
        Ok(())
    }
}
