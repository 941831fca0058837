//! Loading, verifying, and writing LLVM modules, with failures mapped onto
//! [`ObfuscateError`] so binaries can turn them into the process exit codes
//! spec §6 calls for rather than letting an LLVM-side panic escape.

use std::path::Path;

use inkwell::context::Context;
use inkwell::memory_buffer::MemoryBuffer;
use inkwell::module::Module;

use crate::error::{ObfuscateError, Result};

/// Loads a module from `path`, accepting either textual IR (`.ll`) or
/// bitcode (`.bc`) based on its extension, matching `parseIRFile`'s
/// behavior in the original tools.
pub fn load_module<'ctx>(context: &'ctx Context, path: &Path) -> Result<Module<'ctx>> {
    let buffer = MemoryBuffer::create_from_file(path).map_err(|e| ObfuscateError::Io {
        path: path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
    })?;

    let is_textual = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("ll"))
        .unwrap_or(false);

    if is_textual {
        context
            .create_module_from_ir(buffer)
            .map_err(|e| ObfuscateError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
    } else {
        Module::parse_bitcode_from_buffer(&buffer, context).map_err(|e| ObfuscateError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

/// Runs LLVM's own IR verifier over `module`. A failure here is always
/// fatal and always a bug in a pass, never one of the transformation-skip
/// conditions spec §7 treats as non-errors.
pub fn verify_module(module: &Module) -> Result<()> {
    module
        .verify()
        .map_err(|e| ObfuscateError::Verify(e.to_string()))
}

/// Writes `module` to `path` as bitcode (the format every tool's
/// `OutputFilename` positional argument expects), verifying it first.
pub fn write_module(module: &Module, path: &Path) -> Result<()> {
    verify_module(module)?;
    if module.write_bitcode_to_path(path) {
        Ok(())
    } else {
        Err(ObfuscateError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(
                std::io::ErrorKind::Other,
                "LLVM bitcode writer reported failure",
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_accepts_an_empty_module() {
        let context = Context::create();
        let module = context.create_module("empty");
        assert!(verify_module(&module).is_ok());
    }

    #[test]
    fn verify_accepts_a_trivial_returning_function() {
        let context = Context::create();
        let module = context.create_module("trivial");
        let i32_ty = context.i32_type();
        let fn_ty = i32_ty.fn_type(&[], false);
        let function = module.add_function("main", fn_ty, None);
        let entry = context.append_basic_block(function, "entry");
        let builder = context.create_builder();
        builder.position_at_end(entry);
        builder.build_return(Some(&i32_ty.const_int(0, false))).unwrap();
        assert!(verify_module(&module).is_ok());
    }
}
