//! The four obfuscation passes. Each module exposes an `Options` struct and
//! a `run(module, iterations, options, rng)` entry point; binaries parse
//! CLI flags into the `Options` struct and call straight into these.

pub mod cff;
pub mod eib;
pub mod mba_pass;
pub mod senc;

use inkwell::values::FunctionValue;
use inkwell::module::Module;

/// Returns every function defined (not merely declared) in `module`, in
/// module order — the unit of work every pass iterates over.
pub(crate) fn defined_functions<'ctx>(module: &Module<'ctx>) -> Vec<FunctionValue<'ctx>> {
    let mut out = Vec::new();
    let mut current = module.get_first_function();
    while let Some(f) = current {
        if f.get_first_basic_block().is_some() {
            out.push(f);
        }
        current = f.get_next_function();
    }
    out
}
