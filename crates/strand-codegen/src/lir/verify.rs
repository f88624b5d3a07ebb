//! Structural verification of finished LIR modules.
//!
//! The builder already type-checks each instruction as it is created; the
//! verifier covers what only becomes checkable once a module is complete:
//! terminators, cross-function references, and block addresses.

use rustc_hash::FxHashSet;
use thiserror::Error;

use super::{Function, InstKind, Module, Value, ValueKind};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("function `{function}`: block `{block}` has no terminator")]
    MissingTerminator { function: String, block: String },
    #[error("function `{function}`: block `{block}` has a terminator before its end")]
    EarlyTerminator { function: String, block: String },
    #[error("function `{function}`: reference to missing block #{block}")]
    BadBlockRef { function: String, block: u32 },
    #[error("function `{function}`: reference to undeclared function `@{name}`")]
    UnknownFunction { function: String, name: String },
    #[error("function `{function}`: reference to undeclared global `@{name}`")]
    UnknownGlobal { function: String, name: String },
    #[error("function `{function}`: blockaddress of unknown block `@{target}` %{block}")]
    BadBlockAddress {
        function: String,
        target: String,
        block: String,
    },
    #[error("function `{function}`: use of undefined value `%{name}`")]
    UndefinedValue { function: String, name: String },
    #[error("function `{function}`: parameter {index} out of range")]
    BadParam { function: String, index: u32 },
    #[error("function `{function}`: local name `%{name}` is defined twice")]
    DuplicateName { function: String, name: String },
    #[error("global `{global}`: descriptor element `@{elem}` is not defined")]
    BadDescriptorElem { global: String, elem: String },
}

/// Verify every definition in `module`.
pub fn verify_module(module: &Module) -> Result<(), VerifyError> {
    for global in module.globals() {
        if let super::GlobalInit::TypeDescriptor(desc) = &global.init {
            if let Some(elem) = &desc.elem {
                if module.get_global(elem).is_none() {
                    return Err(VerifyError::BadDescriptorElem {
                        global: global.name.clone(),
                        elem: elem.clone(),
                    });
                }
            }
        }
    }
    for func in module.functions() {
        if !func.is_declaration() {
            verify_function(module, func)?;
        }
    }
    Ok(())
}

fn verify_function(module: &Module, func: &Function) -> Result<(), VerifyError> {
    let name = || func.name.clone();
    let defined: FxHashSet<_> = func.instructions().filter_map(|inst| inst.id).collect();

    let mut locals: FxHashSet<String> = (0..func.ty.params.len()).map(|i| format!("p{i}")).collect();
    let block_names = func.blocks.iter().map(|b| b.name.as_str());
    let value_names = func.instructions().filter(|i| i.id.is_some()).map(|i| i.name.as_str());
    for local in block_names.chain(value_names) {
        if !locals.insert(local.to_string()) {
            return Err(VerifyError::DuplicateName {
                function: name(),
                name: local.to_string(),
            });
        }
    }

    for block in &func.blocks {
        match block.insts.last() {
            Some(last) if last.is_terminator() => {}
            _ => {
                return Err(VerifyError::MissingTerminator {
                    function: name(),
                    block: block.name.clone(),
                })
            }
        }
        let body = &block.insts[..block.insts.len() - 1];
        if body.iter().any(|inst| inst.is_terminator()) {
            return Err(VerifyError::EarlyTerminator {
                function: name(),
                block: block.name.clone(),
            });
        }

        for inst in &block.insts {
            for target in inst.block_refs() {
                if func.block(target).is_none() {
                    return Err(VerifyError::BadBlockRef {
                        function: name(),
                        block: target.0,
                    });
                }
            }
            if let InstKind::Alloca { .. } = inst.kind {
                continue;
            }
            for operand in inst.operands() {
                verify_operand(module, func, &defined, operand)?;
            }
        }
    }
    Ok(())
}

fn verify_operand(
    module: &Module,
    func: &Function,
    defined: &FxHashSet<super::InstId>,
    value: &Value,
) -> Result<(), VerifyError> {
    match &value.kind {
        ValueKind::Inst(id, name) if !defined.contains(id) => Err(VerifyError::UndefinedValue {
            function: func.name.clone(),
            name: name.clone(),
        }),
        ValueKind::Param(index) if *index as usize >= func.ty.params.len() => {
            Err(VerifyError::BadParam {
                function: func.name.clone(),
                index: *index,
            })
        }
        ValueKind::Function(callee) if module.get_function(callee).is_none() => {
            Err(VerifyError::UnknownFunction {
                function: func.name.clone(),
                name: callee.clone(),
            })
        }
        ValueKind::Global(global) if module.get_global(global).is_none() => {
            Err(VerifyError::UnknownGlobal {
                function: func.name.clone(),
                name: global.clone(),
            })
        }
        ValueKind::BlockAddress { function, block } => {
            let known = module
                .get_function(function)
                .and_then(|target| target.block_by_name(block))
                .is_some();
            if known {
                Ok(())
            } else {
                Err(VerifyError::BadBlockAddress {
                    function: func.name.clone(),
                    target: function.clone(),
                    block: block.clone(),
                })
            }
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::{FnType, FunctionBuilder, Linkage, Type};

    #[test]
    fn missing_terminator_is_reported() {
        let mut module = Module::new("m");
        let mut b = FunctionBuilder::new("f", FnType::new(vec![], Type::Void), Linkage::Internal);
        let entry = b.append_block("entry");
        b.position_at_end(entry);
        b.build_alloca(Type::i8(), "x").unwrap();
        module.define_function(b.finish()).unwrap();
        assert_eq!(
            verify_module(&module),
            Err(VerifyError::MissingTerminator {
                function: "f".into(),
                block: "entry".into()
            })
        );
    }

    #[test]
    fn undeclared_callee_is_reported() {
        let mut module = Module::new("m");
        let mut b = FunctionBuilder::new("f", FnType::new(vec![], Type::Void), Linkage::Internal);
        let entry = b.append_block("entry");
        b.position_at_end(entry);
        let ghost = Value::function("ghost", &FnType::new(vec![], Type::Void));
        b.build_call(&ghost, &[], "").unwrap();
        b.build_return(None).unwrap();
        module.define_function(b.finish()).unwrap();
        assert!(matches!(
            verify_module(&module),
            Err(VerifyError::UnknownFunction { name, .. }) if name == "ghost"
        ));
    }

    #[test]
    fn block_address_must_name_a_real_block() {
        let mut module = Module::new("m");
        let mut b = FunctionBuilder::new("f", FnType::new(vec![], Type::Void), Linkage::Internal);
        let entry = b.append_block("entry");
        let exit = b.append_block("exit");
        b.position_at_end(entry);
        let addr = b.block_address(exit);
        let slot = b.build_alloca(Type::opaque_ptr(), "slot").unwrap();
        b.build_store(&addr, &slot).unwrap();
        b.build_br(exit).unwrap();
        b.position_at_end(exit);
        b.build_return(None).unwrap();
        module.define_function(b.finish()).unwrap();
        assert_eq!(verify_module(&module), Ok(()));
    }

    #[test]
    fn value_shadowing_a_parameter_is_reported() {
        let mut module = Module::new("m");
        let mut b = FunctionBuilder::new("f", FnType::new(vec![Type::i64()], Type::Void), Linkage::Internal);
        let entry = b.append_block("entry");
        b.position_at_end(entry);
        b.build_alloca(Type::i64(), "slot").unwrap();
        b.build_return(None).unwrap();
        let mut func = b.finish();
        func.blocks[0].insts[0].name = "p0".into();
        module.define_function(func).unwrap();
        assert_eq!(
            verify_module(&module),
            Err(VerifyError::DuplicateName {
                function: "f".into(),
                name: "p0".into()
            })
        );
    }
}
