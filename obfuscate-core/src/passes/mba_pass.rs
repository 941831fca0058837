//! Mixed Boolean Arithmetic substitution pass: walks every basic block,
//! snapshotting candidate instructions per opcode before replacing any of
//! them (so a rewrite whose own output happens to use the same opcode never
//! gets revisited in the same sweep).

use inkwell::basic_block::BasicBlock;
use inkwell::context::Context;
use inkwell::module::Module;
use inkwell::values::{BasicValue, FunctionValue, InstructionOpcode, InstructionValue, IntValue};
use log::debug;

use crate::error::Result;
use crate::mba::{self, Rewrite};
use crate::passes::defined_functions;
use crate::rng::RandomSource;

/// MBA has no extra knobs beyond the common `--iterations`/`--seed` pair.
#[derive(Debug, Clone, Copy, Default)]
pub struct Options;

/// Runs the MBA substitution pass over every defined function in `module`,
/// `iterations` times.
pub fn run<'ctx>(
    context: &'ctx Context,
    module: &Module<'ctx>,
    iterations: u32,
    _options: Options,
    rng: &mut dyn RandomSource,
) -> Result<()> {
    for i in 0..iterations {
        debug!("mba: sweep {} of {iterations}", i + 1);
        for function in defined_functions(module) {
            run_on_function(context, function, rng);
        }
    }
    Ok(())
}

fn run_on_function<'ctx>(context: &'ctx Context, function: FunctionValue<'ctx>, rng: &mut dyn RandomSource) {
    for bb in function.get_basic_blocks() {
        run_on_opcode(context, bb, InstructionOpcode::Sub, mba::SUB_REWRITES, rng);
        run_on_opcode(context, bb, InstructionOpcode::Add, mba::ADD_REWRITES, rng);
        run_on_opcode(context, bb, InstructionOpcode::Xor, mba::XOR_REWRITES, rng);
        run_on_opcode(context, bb, InstructionOpcode::Mul, mba::MUL_REWRITES, rng);
        run_on_opcode(context, bb, InstructionOpcode::Or, mba::OR_REWRITES, rng);
    }
}

fn run_on_opcode<'ctx>(
    context: &'ctx Context,
    bb: BasicBlock<'ctx>,
    opcode: InstructionOpcode,
    catalogue: &[Rewrite<'ctx>],
    rng: &mut dyn RandomSource,
) {
    let candidates: Vec<InstructionValue> = bb
        .get_instructions()
        .filter(|inst| inst.get_opcode() == opcode)
        .collect();

    for inst in candidates {
        let Some(lhs) = inst.get_operand(0).and_then(|o| o.left()) else {
            continue;
        };
        let Some(rhs) = inst.get_operand(1).and_then(|o| o.left()) else {
            continue;
        };
        let (Ok(lhs), Ok(rhs)) = (IntValue::try_from(lhs), IntValue::try_from(rhs)) else {
            continue;
        };

        let builder = context.create_builder();
        builder.position_before(&inst);

        let replacement = mba::apply_random(catalogue, &builder, lhs, rhs, rng);
        inst.replace_all_uses_with(&replacement.as_basic_value_enum());
        // The original instruction is left in place (dead): removing it
        // would require the same use-list walk the replacement already
        // performed, and the original is side-effect free, so leaving it
        // costs nothing but a little code size. Matches the original
        // tool's own `replaceAllUsesWith` without an `eraseFromParent`.
    }
}
