//! Code generation options.

use serde::Deserialize;

use crate::error::CodegenError;

/// Options controlling one [`CodeGen`](crate::codegen::CodeGen) run.
///
/// Usually embedded in the driver's configuration file as a `[codegen]`
/// table; every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CodegenOptions {
    /// Name of the produced module.
    pub module_name: String,
    /// Width of pointers and `uintptr` on the target: 32 or 64.
    pub pointer_bits: u32,
    /// Use the fixed-width FIFO channel runtime for scalar elements. When
    /// off, every channel goes through the generic runtime.
    pub fifo_channels: bool,
}

impl Default for CodegenOptions {
    fn default() -> Self {
        CodegenOptions {
            module_name: "main".to_string(),
            pointer_bits: 64,
            fifo_channels: true,
        }
    }
}

impl CodegenOptions {
    /// Parse options from TOML text.
    pub fn from_toml_str(content: &str) -> Result<CodegenOptions, CodegenError> {
        let options: CodegenOptions = toml::from_str(content)
            .map_err(|e| CodegenError::InvalidOptions(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), CodegenError> {
        if !matches!(self.pointer_bits, 32 | 64) {
            return Err(CodegenError::InvalidOptions(format!(
                "pointer_bits must be 32 or 64, got {}",
                self.pointer_bits
            )));
        }
        if self.module_name.is_empty() {
            return Err(CodegenError::InvalidOptions(
                "module_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
