//! Control-flow flattening: rewrites a function's CFG into a dispatcher
//! state machine. Every original block (including entry) stores its
//! successor's state and branches back to a shared `dispatch` block, which
//! walks a chain of condition blocks comparing the current state against
//! each original block's assigned state.

use std::collections::{HashMap, HashSet};

use inkwell::basic_block::BasicBlock;
use inkwell::context::Context;
use inkwell::module::{Linkage, Module};
use inkwell::types::IntType;
use inkwell::values::{FunctionValue, InstructionOpcode, IntValue};
use inkwell::IntPredicate;
use log::{debug, warn};

use crate::error::Result;
use crate::ir_utils;
use crate::opaque::OpaqueTransformer;
use crate::passes::defined_functions;
use crate::rng::RandomSource;
use crate::siphash;

/// Percent-chance knobs for the dispatcher state's comparison layering.
/// All default to 0 ("never"), matching the original tool's defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    pub use_function_resolver: i32,
    pub use_global_state: i32,
    pub use_opaque: i32,
    pub use_global_opaque: i32,
    pub use_siphash: i32,
    pub clone_siphash: i32,
}

const SIPHASH_RETRY_BUDGET: u32 = 64;
const STATE_LOW_BOUND: u64 = 0x000F_0000;

/// Runs CFF over every eligible defined function in `module`, `iterations`
/// times, then shuffles blocks and re-settles entry-block alloca placement
/// and SSA form as a final pass over the whole module.
pub fn run<'ctx>(
    context: &'ctx Context,
    module: &Module<'ctx>,
    iterations: u32,
    options: Options,
    rng: &mut dyn RandomSource,
) -> Result<()> {
    let siphash_fn = if options.use_siphash > 0 {
        match siphash::get_or_create_siphash_function(module, module.get_context()) {
            Ok(f) => {
                ir_utils::demote_reg_to_stack(f, context)?;
                ir_utils::demote_phi_to_stack(f, context)?;
                Some(f)
            }
            Err(e) => {
                warn!("cff: failed to prepare siphash helper ({e}), disabling siphash layer");
                None
            }
        }
    } else {
        None
    };

    for i in 0..iterations {
        debug!("cff: sweep {} of {iterations}", i + 1);
        for function in defined_functions(module) {
            if siphash_fn.is_some_and(|f| f == function) {
                continue;
            }
            obfuscate_function(context, module, function, &options, siphash_fn, rng)?;
        }
    }

    for function in defined_functions(module) {
        ir_utils::shuffle_blocks(function, rng);
        ir_utils::ensure_allocas_in_entry(function, context)?;
        ir_utils::demote_reg_to_stack(function, context)?;
        ir_utils::demote_phi_to_stack(function, context)?;
    }
    Ok(())
}

fn obfuscate_function<'ctx>(
    context: &'ctx Context,
    module: &Module<'ctx>,
    f: FunctionValue<'ctx>,
    options: &Options,
    siphash_fn: Option<FunctionValue<'ctx>>,
    rng: &mut dyn RandomSource,
) -> Result<()> {
    if ir_utils::has_cxx_exceptions(f) {
        debug!("cff: skipping {:?}, function carries exception handling", f.get_name());
        return Ok(());
    }
    if f.count_basic_blocks() < 2 {
        debug!("cff: skipping {:?}, fewer than 2 blocks", f.get_name());
        return Ok(());
    }

    let is_32_bit = module
        .get_data_layout()
        .as_str()
        .to_str()
        .map(|s| !s.contains("p:64"))
        .unwrap_or(false);
    let state_ty = if is_32_bit {
        context.i32_type()
    } else {
        context.i64_type()
    };

    let entry = f.get_first_basic_block().expect("checked block count above");
    let builder = context.create_builder();
    builder.position_before(
        &entry
            .get_first_instruction()
            .expect("entry block is non-empty after verification"),
    );
    let state_slot = builder.build_alloca(state_ty, "state").unwrap();
    builder.build_store(state_slot, state_ty.const_int(0, false)).unwrap();

    let original_blocks: Vec<BasicBlock> = f
        .get_basic_blocks()
        .into_iter()
        .filter(|bb| *bb != entry)
        .collect();

    // Assign each original block a unique, non-trivial state.
    let mut states: HashSet<u64> = HashSet::new();
    let mut block_state: Vec<(BasicBlock, u64)> = Vec::with_capacity(original_blocks.len());
    let max_state = if is_32_bit { u32::MAX as u64 } else { u64::MAX };
    for bb in &original_blocks {
        let mut candidate;
        loop {
            candidate = rng.range_u64(STATE_LOW_BOUND, max_state);
            if states.insert(candidate) {
                break;
            }
        }
        block_state.push((*bb, candidate));
    }

    let dispatch = context.insert_basic_block_after(entry, "dispatch");
    let default_bb = context.insert_basic_block_after(dispatch, "default");
    builder.position_at_end(default_bb);
    builder.build_unconditional_branch(dispatch).unwrap();

    // Build the condition-block chain, one per original block, each
    // comparing the (possibly layered) state to its assigned target. Every
    // condition block's non-match edge goes straight to `default_bb` (which
    // loops back to `dispatch`); there is no separate block-to-block chain
    // edge to wire; each `cond_bb` gets exactly one terminator, its own
    // `build_conditional_branch` below.
    let fn_name = f.get_name().to_string_lossy().into_owned();
    let mut resolvers: HashMap<u64, FunctionValue> = HashMap::new();
    let mut first_cond: Option<BasicBlock> = None;
    let mut insert_after = default_bb;
    for (bb, target_state) in &block_state {
        let cond_bb = context.insert_basic_block_after(insert_after, "cff.cond");
        insert_after = cond_bb;
        if first_cond.is_none() {
            first_cond = Some(cond_bb);
        }

        builder.position_at_end(cond_bb);
        let loaded_state = builder
            .build_load(state_ty, state_slot, "state.load")
            .unwrap()
            .into_int_value();
        let (transformed_state, transformed_target) = maybe_transform_dispatcher_state(
            module,
            context,
            &builder,
            loaded_state,
            *target_state,
            options,
            &states,
            is_32_bit,
            siphash_fn,
            rng,
        );
        let target_value = get_target_state(module, context, &builder, transformed_target, is_32_bit, options, rng);
        let cmp = if rng.chance(options.use_function_resolver) {
            let resolver = *resolvers.entry(*target_state).or_insert_with(|| {
                get_or_create_resolver_function(module, context, state_ty, &fn_name, *target_state)
            });
            builder
                .build_call(
                    resolver,
                    &[transformed_state.into(), target_value.into()],
                    "cff.resolve.call",
                )
                .unwrap()
                .try_as_basic_value()
                .left()
                .expect("resolver returns an i1")
                .into_int_value()
        } else {
            builder
                .build_int_compare(IntPredicate::EQ, transformed_state, target_value, "cff.match")
                .unwrap()
        };
        builder.build_conditional_branch(cmp, *bb, default_bb).unwrap();
    }

    builder.position_at_end(dispatch);
    if let Some(first) = first_cond {
        builder.build_unconditional_branch(first).unwrap();
    } else {
        builder.build_unconditional_branch(default_bb).unwrap();
    }

    // Rewire every original block's (and entry's) terminator to store its
    // destination state and branch to `dispatch`.
    let mut all_rewireable = original_blocks.clone();
    all_rewireable.push(entry);
    for bb in all_rewireable {
        rewire_terminator(context, &builder, bb, dispatch, state_slot, state_ty, &block_state)?;
    }

    ir_utils::demote_reg_to_stack(f, context)?;
    ir_utils::demote_phi_to_stack(f, context)?;
    Ok(())
}

fn rewire_terminator<'ctx>(
    context: &'ctx Context,
    builder: &inkwell::builder::Builder<'ctx>,
    bb: BasicBlock<'ctx>,
    dispatch: BasicBlock<'ctx>,
    state_slot: inkwell::values::PointerValue<'ctx>,
    state_ty: inkwell::types::IntType<'ctx>,
    block_state: &[(BasicBlock<'ctx>, u64)],
) -> Result<()> {
    let Some(term) = bb.get_terminator() else {
        return Ok(());
    };

    match term.get_opcode() {
        InstructionOpcode::Br if term.get_num_operands() == 1 => {
            let Some(dest) = term.get_operand(0).and_then(|o| o.right()) else {
                return Ok(());
            };
            let Some(&(_, state)) = block_state.iter().find(|(b, _)| *b == dest) else {
                return Ok(());
            };
            term.erase_from_basic_block();
            builder.position_at_end(bb);
            builder.build_store(state_slot, state_ty.const_int(state, false)).unwrap();
            builder.build_unconditional_branch(dispatch).unwrap();
        }
        InstructionOpcode::Br if term.get_num_operands() == 3 => {
            let Some(cond) = term.get_operand(0).and_then(|o| o.left()) else {
                return Ok(());
            };
            let Ok(cond) = IntValue::try_from(cond) else {
                return Ok(());
            };
            let Some(false_dest) = term.get_operand(1).and_then(|o| o.right()) else {
                return Ok(());
            };
            let Some(true_dest) = term.get_operand(2).and_then(|o| o.right()) else {
                return Ok(());
            };
            let Some(&(_, true_state)) = block_state.iter().find(|(b, _)| *b == true_dest) else {
                return Ok(());
            };
            let Some(&(_, false_state)) = block_state.iter().find(|(b, _)| *b == false_dest) else {
                return Ok(());
            };

            let true_state_bb = context.insert_basic_block_after(bb, "cff.truestate");
            let false_state_bb = context.insert_basic_block_after(true_state_bb, "cff.falsestate");

            builder.position_at_end(true_state_bb);
            builder.build_store(state_slot, state_ty.const_int(true_state, false)).unwrap();
            builder.build_unconditional_branch(dispatch).unwrap();

            builder.position_at_end(false_state_bb);
            builder.build_store(state_slot, state_ty.const_int(false_state, false)).unwrap();
            builder.build_unconditional_branch(dispatch).unwrap();

            term.erase_from_basic_block();
            builder.position_at_end(bb);
            builder
                .build_conditional_branch(cond, true_state_bb, false_state_bb)
                .unwrap();
        }
        // Return, unreachable, switch, and every other terminator shape is
        // left untouched: these are valid dispatcher exits.
        _ => {}
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn maybe_transform_dispatcher_state<'ctx>(
    module: &Module<'ctx>,
    context: &'ctx Context,
    builder: &inkwell::builder::Builder<'ctx>,
    state: IntValue<'ctx>,
    target_state: u64,
    options: &Options,
    states: &HashSet<u64>,
    is_32_bit: bool,
    siphash_fn: Option<FunctionValue<'ctx>>,
    rng: &mut dyn RandomSource,
) -> (IntValue<'ctx>, u64) {
    let mut state = state;
    let mut target_state = target_state;

    if let Some(siphash_fn) = siphash_fn {
        if rng.chance(options.use_siphash) {
            if let Some((hashed_target, keys)) =
                find_collision_free_siphash_keys(target_state, states, is_32_bit, rng)
            {
                target_state = hashed_target;

                let call_fn = if rng.chance(options.clone_siphash) {
                    let unique = rng.next_u64();
                    siphash::clone_siphash_function(module, module.get_context(), &format!("___siphash_{unique:x}"))
                        .unwrap_or(siphash_fn)
                } else {
                    siphash_fn
                };

                let i64_ty = context.i64_type();
                let state_arg = if is_32_bit {
                    builder.build_int_z_extend(state, i64_ty, "cff.sip.zext").unwrap()
                } else {
                    state
                };
                let args: Vec<inkwell::values::BasicMetadataValueEnum> = std::iter::once(state_arg.into())
                    .chain(keys.iter().map(|k| i64_ty.const_int(*k, false).into()))
                    .collect();
                let call = builder.build_call(call_fn, &args, "cff.sip.call").unwrap();
                let result = call
                    .try_as_basic_value()
                    .left()
                    .expect("siphash returns an i64")
                    .into_int_value();
                state = if is_32_bit {
                    builder.build_int_truncate(result, context.i32_type(), "cff.sip.trunc").unwrap()
                } else {
                    result
                };
            }
        }
    }

    if rng.chance(options.use_opaque) {
        let transformer = OpaqueTransformer::new(is_32_bit, rng);
        state = transformer.transform(module, builder, state, options.use_global_opaque, rng);
        target_state = transformer.transform_constant(target_state);
    }

    (state, target_state)
}

/// Finds a SipHash key schedule for which `target_state`'s hash is unique
/// among `states`' hashes, retrying up to [`SIPHASH_RETRY_BUDGET`] times
/// before giving up (the caller then skips the SipHash layer for this site).
fn find_collision_free_siphash_keys(
    target_state: u64,
    states: &HashSet<u64>,
    is_32_bit: bool,
    rng: &mut dyn RandomSource,
) -> Option<(u64, [u64; 6])> {
    let mask = if is_32_bit { u32::MAX as u64 } else { u64::MAX };

    for _ in 0..SIPHASH_RETRY_BUDGET {
        let keys: [u64; 6] = std::array::from_fn(|_| rng.range_u64(STATE_LOW_BOUND, u64::MAX));
        let hashed = siphash::siphash_ct(
            target_state,
            keys[0],
            keys[1],
            keys[2],
            keys[3],
            keys[4],
            keys[5],
        ) & mask;

        let collisions = states
            .iter()
            .filter(|&&s| {
                siphash::siphash_ct(s, keys[0], keys[1], keys[2], keys[3], keys[4], keys[5]) & mask == hashed
            })
            .count();

        if collisions == 1 && !states.contains(&hashed) {
            return Some((hashed, keys));
        }
    }
    warn!("cff: exhausted {SIPHASH_RETRY_BUDGET} attempts finding a collision-free siphash schedule");
    None
}

fn get_target_state<'ctx>(
    module: &Module<'ctx>,
    context: &'ctx Context,
    builder: &inkwell::builder::Builder<'ctx>,
    target_state: u64,
    is_32_bit: bool,
    options: &Options,
    rng: &mut dyn RandomSource,
) -> IntValue<'ctx> {
    let int_ty = if is_32_bit {
        context.i32_type()
    } else {
        context.i64_type()
    };
    let literal = int_ty.const_int(target_state, false);

    if rng.chance(options.use_global_state) {
        let name = format!("__state_{target_state}");
        let gv = module.add_global(int_ty, None, &name);
        gv.set_linkage(inkwell::module::Linkage::Private);
        gv.set_initializer(&literal.as_basic_value_enum());
        return builder
            .build_load(int_ty, gv.as_pointer_value(), "cff.state.load")
            .unwrap()
            .into_int_value();
    }
    literal
}

/// Returns the module's resolver helper for `target_state` within `fn_name`,
/// creating it if this is the first condition block to need it. One
/// resolver per (function, target state) pair, matching the original's
/// `cff_resolve_state_check` sharing: routing a dispatcher comparison
/// through a call indirection still lets an analyst find the comparison,
/// but hides it behind an extra frame and makes every resolved state a
/// distinct symbol rather than an inline `icmp` visible at the call site.
fn get_or_create_resolver_function<'ctx>(
    module: &Module<'ctx>,
    context: &'ctx Context,
    state_ty: IntType<'ctx>,
    fn_name: &str,
    target_state: u64,
) -> FunctionValue<'ctx> {
    let resolver_name = format!("cff_resolve_state_check_{fn_name}_{target_state:x}");
    if let Some(existing) = module.get_function(&resolver_name) {
        return existing;
    }

    let fn_ty = context.bool_type().fn_type(&[state_ty.into(), state_ty.into()], false);
    let resolver = module.add_function(&resolver_name, fn_ty, Some(Linkage::Internal));
    let entry = context.append_basic_block(resolver, "entry");
    let builder = context.create_builder();
    builder.position_at_end(entry);

    let state_param = resolver.get_nth_param(0).expect("resolver takes two params").into_int_value();
    let target_param = resolver.get_nth_param(1).expect("resolver takes two params").into_int_value();
    let cmp = builder
        .build_int_compare(IntPredicate::EQ, state_param, target_param, "resolve.cmp")
        .unwrap();
    builder.build_return(Some(&cmp)).unwrap();
    resolver
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::Random;

    #[test]
    fn collision_free_keys_exist_for_small_state_sets() {
        let mut rng = Random::new(1);
        let states: HashSet<u64> = [0x1_0000, 0x2_0000, 0x3_0000].into_iter().collect();
        let found = find_collision_free_siphash_keys(0x4_0000, &states, false, &mut rng);
        assert!(found.is_some());
    }
}
