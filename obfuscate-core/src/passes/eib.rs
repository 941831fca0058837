//! Encrypted Indirect Branch: replaces direct branches with an indirect
//! jump through an XTEA-enciphered table of block addresses, decrypted
//! inline at the branch site.

use inkwell::basic_block::BasicBlock;
use inkwell::builder::Builder;
use inkwell::context::Context;
use inkwell::module::{Linkage, Module};
use inkwell::values::{FunctionValue, GlobalValue, InstructionOpcode, InstructionValue, IntValue};
use inkwell::AddressSpace;
use log::debug;

use crate::error::Result;
use crate::ir_utils;
use crate::passes::defined_functions;
use crate::rng::{RandomSource, SplitMixStream};
use crate::xtea::{self, XteaInfo, XteaScratch};

const MAGIC: u64 = 0xDEAD_BEEF;

/// EIB's only extra knob: the percent chance any given `br` is replaced.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub replace_chance: i32,
}

impl Default for Options {
    fn default() -> Self {
        Self { replace_chance: 100 }
    }
}

/// One function's branch-address table and the key schedules it needs
/// enciphered once the ctor built by [`build_encipher_ctor`] runs.
struct TableWork<'ctx> {
    table_global: GlobalValue<'ctx>,
    schedules: Vec<XteaInfo>,
    key_globals: Vec<GlobalValue<'ctx>>,
}

pub fn run<'ctx>(
    context: &'ctx Context,
    module: &Module<'ctx>,
    iterations: u32,
    options: Options,
    rng: &mut dyn RandomSource,
) -> Result<()> {
    let mut tables = Vec::new();
    for i in 0..iterations {
        debug!("eib: sweep {} of {iterations}", i + 1);
        for function in defined_functions(module) {
            if let Some(work) = obfuscate_function(context, module, function, &options, rng)? {
                tables.push(work);
            }
        }
    }
    if !tables.is_empty() {
        build_encipher_ctor(context, module, &tables)?;
    }
    Ok(())
}

fn obfuscate_function<'ctx>(
    context: &'ctx Context,
    module: &Module<'ctx>,
    f: FunctionValue<'ctx>,
    options: &Options,
    rng: &mut dyn RandomSource,
) -> Result<Option<TableWork<'ctx>>> {
    if ir_utils::has_cxx_exceptions(f) {
        debug!("eib: skipping {:?}, function carries exception handling", f.get_name());
        return Ok(None);
    }
    if f.count_basic_blocks() < 2 {
        return Ok(None);
    }

    let branches: Vec<InstructionValue> = f
        .get_basic_blocks()
        .into_iter()
        .filter_map(|bb| bb.get_terminator())
        .filter(|t| t.get_opcode() == InstructionOpcode::Br)
        .filter(|_| rng.chance(options.replace_chance))
        .collect();
    if branches.is_empty() {
        return Ok(None);
    }

    let mut targets: Vec<BasicBlock> = Vec::new();
    for branch in &branches {
        for i in 0..branch.get_num_operands() {
            if let Some(dest) = branch.get_operand(i).and_then(|o| o.right()) {
                if !targets.contains(&dest) {
                    targets.push(dest);
                }
            }
        }
    }
    if targets.is_empty() {
        return Ok(None);
    }

    let master_seed = rng.next_u64() as u32;
    let mut stream = SplitMixStream::new(master_seed);
    let schedules: Vec<XteaInfo> = targets
        .iter()
        .map(|_| XteaInfo {
            key: [stream.next_u32(), stream.next_u32(), stream.next_u32(), stream.next_u32()],
            delta: 0x9E37_79B9,
            rounds: (stream.next_u32() % 3) + 1,
        })
        .collect();

    let i64_ty = context.i64_type();
    let table_len = 4 + targets.len();
    let table_ty = i64_ty.array_type(table_len as u32);
    let table_name = format!("__eib_table_{}", f.get_name().to_string_lossy());
    let table_global: GlobalValue = module.add_global(table_ty, Some(AddressSpace::default()), &table_name);
    table_global.set_linkage(Linkage::Private);

    let mut entries = vec![
        i64_ty.const_int(MAGIC, false),
        i64_ty.const_int(MAGIC, false),
        i64_ty.const_int(MAGIC, false),
        i64_ty.const_int(master_seed as u64, false),
    ];
    // `encipher_ct` needs a concrete u64 to operate on, but a block's
    // runtime address is only known to the linker; folding a constant XTEA
    // pass over a `blockaddress` constant expression is not something LLVM's
    // constant folder can do. So the table is initialized with the raw
    // `blockaddress` values, and a module constructor (below) runs once at
    // program startup and enciphers each entry in place, once the address
    // is a concrete runtime value — the same "transform once at load time"
    // shape `senc`'s global mode uses for its own decrypt ctor. After the
    // ctor runs, the table holds exactly the ciphertext `rewire_branch`'s
    // inline decipher loop inverts.
    for target in &targets {
        let addr = target.get_address().expect("basic block has a stable address once it exists");
        let addr_as_int = unsafe {
            IntValue::new(inkwell::llvm_sys::core::LLVMConstPtrToInt(
                addr.as_value_ref(),
                i64_ty.as_type_ref(),
            ))
        };
        entries.push(addr_as_int);
    }
    table_global.set_initializer(&i64_ty.const_array(&entries));

    let mut key_globals = Vec::with_capacity(schedules.len());
    for (idx, schedule) in schedules.iter().enumerate() {
        let key_ty = context.i32_type().array_type(4);
        let key_name = format!("__eib_key_{}_{idx}", f.get_name().to_string_lossy());
        let key_global = module.add_global(key_ty, Some(AddressSpace::default()), &key_name);
        key_global.set_linkage(Linkage::Private);
        let words: Vec<_> = schedule
            .key
            .iter()
            .map(|w| context.i32_type().const_int(*w as u64, false))
            .collect();
        key_global.set_initializer(&context.i32_type().const_array(&words));
        key_globals.push(key_global);
    }

    let entry_bb = f.get_first_basic_block().expect("checked block count above");
    let builder = context.create_builder();
    builder.position_before(
        &entry_bb
            .get_first_instruction()
            .expect("entry block is non-empty after verification"),
    );
    let scratch = XteaScratch::allocate(&builder, context)?;
    let scratch_u64 = builder.build_alloca(i64_ty, "eib.scratch").unwrap();

    for branch in branches {
        rewire_branch(
            context,
            &builder,
            branch,
            &targets,
            &schedules,
            &key_globals,
            table_global,
            &scratch,
            scratch_u64,
        )?;
    }

    ir_utils::demote_reg_to_stack(f, context)?;
    ir_utils::demote_phi_to_stack(f, context)?;
    Ok(Some(TableWork { table_global, schedules, key_globals }))
}

/// Builds a single module constructor that enciphers every function's
/// branch-address table entries in place, once at program startup — mirroring
/// `senc`'s global-mode decrypt ctor, but forward-direction and over table
/// slots instead of string buffers. Runs once per module regardless of how
/// many functions EIB touched, so it only ever needs one
/// `llvm.global_ctors` entry.
fn build_encipher_ctor<'ctx>(context: &'ctx Context, module: &Module<'ctx>, tables: &[TableWork<'ctx>]) -> Result<()> {
    let i32_ty = context.i32_type();
    let i64_ty = context.i64_type();

    let ctor_fn_ty = context.void_type().fn_type(&[], false);
    let ctor = module.add_function("__eib_encipher_ctor", ctor_fn_ty, Some(Linkage::Internal));
    let entry = context.append_basic_block(ctor, "entry");
    let builder = context.create_builder();
    builder.position_at_end(entry);

    let scratch = XteaScratch::allocate(&builder, context)?;
    let scratch_u64 = builder.build_alloca(i64_ty, "eib.ctor.scratch").unwrap();
    let scratch_i32ptr = builder
        .build_bit_cast(scratch_u64, i32_ty.ptr_type(AddressSpace::default()), "eib.ctor.scratch.i32")
        .unwrap()
        .into_pointer_value();

    for work in tables {
        let table_ty = work.table_global.get_value_type();
        for (idx, schedule) in work.schedules.iter().enumerate() {
            let slot = i32_ty.const_int((4 + idx) as u64, false);
            let zero = i32_ty.const_int(0, false);
            let entry_ptr = unsafe {
                builder
                    .build_in_bounds_gep(table_ty, work.table_global.as_pointer_value(), &[zero, slot], "eib.ctor.entryptr")
                    .unwrap()
            };
            let raw = builder.build_load(i64_ty, entry_ptr, "eib.ctor.raw").unwrap();
            builder.build_store(scratch_u64, raw).unwrap();

            let delta = i32_ty.const_int(schedule.delta as u64, false);
            let rounds = i32_ty.const_int(schedule.rounds as u64, false);
            let key_ptr = work.key_globals[idx].as_pointer_value();
            xtea::emit_encipher(&builder, context, scratch_i32ptr, key_ptr, delta, rounds, &scratch)?;

            let enciphered = builder.build_load(i64_ty, scratch_u64, "eib.ctor.enciphered").unwrap();
            builder.build_store(entry_ptr, enciphered).unwrap();
        }
    }

    builder.build_return(None).unwrap();
    register_global_ctor(context, module, ctor);
    Ok(())
}

/// Appends `ctor` to `llvm.global_ctors`. EIB builds at most one ctor per
/// module (see [`build_encipher_ctor`]), so unlike a pass that might run
/// several times, there is never a pre-existing entry of its own to splice
/// around; a `llvm.global_ctors` from elsewhere in the pipeline is left
/// untouched and this registration is skipped rather than risked.
fn register_global_ctor<'ctx>(context: &'ctx Context, module: &Module<'ctx>, ctor: FunctionValue<'ctx>) {
    let i32_ty = context.i32_type();
    let ctor_ptr_ty = ctor.get_type();
    let i8_ptr_ty = context.i8_type().ptr_type(AddressSpace::default());
    let entry_ty = context.struct_type(&[i32_ty.into(), ctor_ptr_ty.into(), i8_ptr_ty.into()], false);

    if module.get_global("llvm.global_ctors").is_some() {
        log::warn!("eib: llvm.global_ctors already present, leaving it untouched and skipping ctor registration");
        return;
    }

    let new_entry = entry_ty.const_named_struct(&[
        i32_ty.const_int(65535, false).into(),
        ctor.as_global_value().as_pointer_value().into(),
        i8_ptr_ty.const_null().into(),
    ]);
    let array_ty = entry_ty.array_type(1);
    let gv = module.add_global(array_ty, Some(AddressSpace::default()), "llvm.global_ctors");
    gv.set_linkage(Linkage::Appending);
    gv.set_initializer(&array_ty.const_array(&[new_entry]));
}

#[allow(clippy::too_many_arguments)]
fn rewire_branch<'ctx>(
    context: &'ctx Context,
    builder: &Builder<'ctx>,
    branch: InstructionValue<'ctx>,
    targets: &[BasicBlock<'ctx>],
    schedules: &[XteaInfo],
    key_globals: &[GlobalValue<'ctx>],
    table_global: GlobalValue<'ctx>,
    scratch: &XteaScratch<'ctx>,
    scratch_u64: inkwell::values::PointerValue<'ctx>,
) -> Result<()> {
    let i32_ty = context.i32_type();
    let i64_ty = context.i64_type();

    builder.position_before(&branch);

    let (index, delta, rounds, key_ptr) = if branch.get_num_operands() == 1 {
        let dest = branch
            .get_operand(0)
            .and_then(|o| o.right())
            .expect("unconditional br has one block operand");
        let idx = targets.iter().position(|t| *t == dest).expect("dest was added to targets");
        (
            i32_ty.const_int((4 + idx) as u64, false),
            i32_ty.const_int(schedules[idx].delta as u64, false),
            i32_ty.const_int(schedules[idx].rounds as u64, false),
            key_globals[idx].as_pointer_value(),
        )
    } else {
        let cond: IntValue = branch
            .get_operand(0)
            .and_then(|o| o.left())
            .and_then(|v| IntValue::try_from(v).ok())
            .expect("conditional br has an i1 condition operand");
        let false_dest = branch.get_operand(1).and_then(|o| o.right()).expect("conditional br false dest");
        let true_dest = branch.get_operand(2).and_then(|o| o.right()).expect("conditional br true dest");
        let true_idx = targets.iter().position(|t| *t == true_dest).expect("dest was added to targets");
        let false_idx = targets.iter().position(|t| *t == false_dest).expect("dest was added to targets");

        let index = builder
            .build_select(
                cond,
                i32_ty.const_int((4 + true_idx) as u64, false),
                i32_ty.const_int((4 + false_idx) as u64, false),
                "eib.idx",
            )
            .unwrap()
            .into_int_value();
        let delta = builder
            .build_select(
                cond,
                i32_ty.const_int(schedules[true_idx].delta as u64, false),
                i32_ty.const_int(schedules[false_idx].delta as u64, false),
                "eib.delta",
            )
            .unwrap()
            .into_int_value();
        let rounds = builder
            .build_select(
                cond,
                i32_ty.const_int(schedules[true_idx].rounds as u64, false),
                i32_ty.const_int(schedules[false_idx].rounds as u64, false),
                "eib.rounds",
            )
            .unwrap()
            .into_int_value();
        let key_ptr = builder
            .build_select(
                cond,
                key_globals[true_idx].as_pointer_value(),
                key_globals[false_idx].as_pointer_value(),
                "eib.keyptr",
            )
            .unwrap()
            .into_pointer_value();
        (index, delta, rounds, key_ptr)
    };

    let table_ty = table_global.get_value_type();
    let zero = i32_ty.const_int(0, false);
    let entry_ptr = unsafe {
        builder
            .build_in_bounds_gep(table_ty, table_global.as_pointer_value(), &[zero, index], "eib.entryptr")
            .unwrap()
    };

    // Copy the 64-bit table entry into the function's shared scratch slot
    // (allocated once at entry) that the XTEA emitter can address as two
    // `i32` halves, decrypt it in place, then read it back.
    let encrypted = builder.build_load(i64_ty, entry_ptr, "eib.encrypted").unwrap();
    builder.build_store(scratch_u64, encrypted).unwrap();
    let scratch_i32ptr = builder
        .build_bit_cast(scratch_u64, i32_ty.ptr_type(AddressSpace::default()), "eib.scratch.i32")
        .unwrap()
        .into_pointer_value();

    xtea::emit_decipher(builder, context, scratch_i32ptr, key_ptr, delta, rounds, scratch)?;

    let decrypted = builder
        .build_load(i64_ty, scratch_u64, "eib.decrypted")
        .unwrap()
        .into_int_value();
    let dest_ptr = builder
        .build_int_to_ptr(decrypted, i32_ty.ptr_type(AddressSpace::default()), "eib.destptr")
        .unwrap();

    // `emit_decipher` leaves the builder positioned at the end of the
    // continuation block it created (where `decrypted`/`dest_ptr` above were
    // also emitted); the indirect branch terminates that block, not `bb` —
    // `bb` is already terminated by the unconditional branch into the
    // decipher loop that `emit_decipher` appended before `branch` was erased.
    branch.erase_from_basic_block();
    builder.build_indirect_branch(dest_ptr, targets).unwrap();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::Random;

    #[test]
    fn derived_schedules_differ_per_target() {
        let mut stream = SplitMixStream::new(12345);
        let a = [stream.next_u32(), stream.next_u32(), stream.next_u32(), stream.next_u32()];
        let b = [stream.next_u32(), stream.next_u32(), stream.next_u32(), stream.next_u32()];
        assert_ne!(a, b);
    }

    #[test]
    fn replace_chance_zero_means_no_candidates_sampled() {
        let mut rng = Random::new(9);
        for _ in 0..100 {
            assert!(!rng.chance(0));
        }
    }
}
