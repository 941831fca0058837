//! String encryption: a SplitMix32 keystream XORed over each encrypted
//! string's bytes, 4 bytes (one keystream word) at a time.
//!
//! [`xor_encrypt_strings`] is the compile-time transform applied to a
//! string's bytes before it is written into the module as the new
//! (encrypted) global initializer. [`emit_splitmix32`] and
//! [`emit_decrypt_buffer`] emit the matching runtime decryption IR, used by
//! both SENC modes: global mode calls the decrypt loop once per string from
//! a constructor; stack mode inlines one decrypt loop per use.

use inkwell::builder::Builder;
use inkwell::context::Context;
use inkwell::values::{IntValue, PointerValue};
use inkwell::IntPredicate;

use crate::error::Result;
use crate::rng::split_mix32;

/// XORs every string in `strings` in place with a SplitMix32 keystream
/// derived from `master_seed ^ index`, so no two strings in the same module
/// share a keystream even though they share a master seed.
pub fn xor_encrypt_strings(strings: &mut [Vec<u8>], master_seed: u32) {
    for (i, s) in strings.iter_mut().enumerate() {
        let seed = master_seed ^ i as u32;
        let mut state = seed;
        let len = s.len();
        let mut offset = 0usize;

        while offset < len {
            let keystream = split_mix32(&mut state);
            let chunk = (len - offset).min(4);
            for j in 0..chunk {
                s[offset + j] ^= ((keystream >> (j * 8)) & 0xFF) as u8;
            }
            offset += chunk;
        }
    }
}

/// Emits one SplitMix32 step: `state' = state + 0x9E3779B9`, then the usual
/// xor/mul/xor/mul/xor mixing chain. Returns `(new_state, keystream_word)`.
pub fn emit_splitmix32<'ctx>(
    builder: &Builder<'ctx>,
    context: &'ctx Context,
    state: IntValue<'ctx>,
) -> (IntValue<'ctx>, IntValue<'ctx>) {
    let i32_ty = context.i32_type();
    let c_add = i32_ty.const_int(0x9E37_79B9, false);
    let c_mul1 = i32_ty.const_int(0x85EB_CA6B, false);
    let c_mul2 = i32_ty.const_int(0xC2B2_AE35, false);

    let new_state = builder.build_int_add(state, c_add, "sm32.state").unwrap();
    let mut z = new_state;
    let shr16a = builder.build_right_shift(z, i32_ty.const_int(16, false), false, "sm32.shr16a").unwrap();
    z = builder.build_xor(z, shr16a, "sm32.xor1").unwrap();
    z = builder.build_int_mul(z, c_mul1, "sm32.mul1").unwrap();
    let shr13 = builder.build_right_shift(z, i32_ty.const_int(13, false), false, "sm32.shr13").unwrap();
    z = builder.build_xor(z, shr13, "sm32.xor2").unwrap();
    z = builder.build_int_mul(z, c_mul2, "sm32.mul2").unwrap();
    let shr16b = builder.build_right_shift(z, i32_ty.const_int(16, false), false, "sm32.shr16b").unwrap();
    z = builder.build_xor(z, shr16b, "sm32.xor3").unwrap();

    (new_state, z)
}

/// Stack slots the decrypt loop needs.
pub struct DecryptScratch<'ctx> {
    pub offset: PointerValue<'ctx>,
    pub state: PointerValue<'ctx>,
    pub j: PointerValue<'ctx>,
}

impl<'ctx> DecryptScratch<'ctx> {
    pub fn allocate(builder: &Builder<'ctx>, context: &'ctx Context) -> Result<Self> {
        let i32_ty = context.i32_type();
        Ok(Self {
            offset: builder.build_alloca(i32_ty, "dec.off").unwrap(),
            state: builder.build_alloca(i32_ty, "dec.state").unwrap(),
            j: builder.build_alloca(i32_ty, "dec.j").unwrap(),
        })
    }
}

/// Emits a loop that decrypts `str_len` bytes from `in_ptr` into `out_ptr`
/// using the SplitMix32 keystream seeded by `state_seed`, 4 bytes at a time.
/// Leaves the builder positioned after the loop (its "after" block).
pub fn emit_decrypt_buffer<'ctx>(
    builder: &Builder<'ctx>,
    context: &'ctx Context,
    state_seed: IntValue<'ctx>,
    in_ptr: PointerValue<'ctx>,
    out_ptr: PointerValue<'ctx>,
    str_len: IntValue<'ctx>,
    scratch: &DecryptScratch<'ctx>,
) -> Result<()> {
    let i32_ty = context.i32_type();
    let i8_ty = context.i8_type();
    let current_bb = builder.get_insert_block().expect("builder has an insertion point");

    builder.build_store(scratch.offset, i32_ty.const_int(0, false)).unwrap();
    builder.build_store(scratch.state, state_seed).unwrap();

    let loop_off = context.insert_basic_block_after(current_bb, "dec.loop.off");
    let body_off = context.insert_basic_block_after(loop_off, "dec.body.off");
    let after_off = context.insert_basic_block_after(body_off, "dec.after.off");

    builder.build_unconditional_branch(loop_off).unwrap();

    builder.position_at_end(loop_off);
    let current_off = builder.build_load(i32_ty, scratch.offset, "dec.curoff").unwrap().into_int_value();
    let current_state = builder.build_load(i32_ty, scratch.state, "dec.curstate").unwrap().into_int_value();
    let cmp_off = builder
        .build_int_compare(IntPredicate::ULT, current_off, str_len, "dec.cmpoff")
        .unwrap();
    builder.build_conditional_branch(cmp_off, body_off, after_off).unwrap();

    builder.position_at_end(body_off);
    let (new_state, keystream) = emit_splitmix32(builder, context, current_state);

    let rem = builder.build_int_sub(str_len, current_off, "dec.rem").unwrap();
    let four = i32_ty.const_int(4, false);
    let rem_lt_4 = builder
        .build_int_compare(IntPredicate::ULT, rem, four, "dec.remlt4")
        .unwrap();
    let chunk = builder.build_select(rem_lt_4, rem, four, "dec.chunk").unwrap().into_int_value();

    let loop_j = context.insert_basic_block_after(body_off, "dec.loop.j");
    let body_j = context.insert_basic_block_after(loop_j, "dec.body.j");
    let after_j = context.insert_basic_block_after(body_j, "dec.after.j");

    builder.build_store(scratch.j, i32_ty.const_int(0, false)).unwrap();
    builder.build_unconditional_branch(loop_j).unwrap();

    builder.position_at_end(loop_j);
    let current_j = builder.build_load(i32_ty, scratch.j, "dec.curj").unwrap().into_int_value();
    let cmp_j = builder
        .build_int_compare(IntPredicate::ULT, current_j, chunk, "dec.cmpj")
        .unwrap();
    builder.build_conditional_branch(cmp_j, body_j, after_j).unwrap();

    builder.position_at_end(body_j);
    let off_plus_j = builder.build_int_add(current_off, current_j, "dec.offplusj").unwrap();
    let in_byte = unsafe {
        builder
            .build_in_bounds_gep(i8_ty, in_ptr, &[off_plus_j], "dec.inbyte")
            .unwrap()
    };
    let orig = builder.build_load(i8_ty, in_byte, "dec.orig").unwrap().into_int_value();

    let shift = builder.build_int_mul(current_j, i32_ty.const_int(8, false), "dec.shift").unwrap();
    let shr = builder.build_right_shift(keystream, shift, false, "dec.shr").unwrap();
    let mask = builder.build_int_truncate(shr, i8_ty, "dec.mask").unwrap();
    let out = builder.build_xor(orig, mask, "dec.out").unwrap();

    let out_byte = unsafe {
        builder
            .build_in_bounds_gep(i8_ty, out_ptr, &[off_plus_j], "dec.outbyte")
            .unwrap()
    };
    builder.build_store(out_byte, out).unwrap();

    let j_next = builder.build_int_add(current_j, i32_ty.const_int(1, false), "dec.jnext").unwrap();
    builder.build_store(scratch.j, j_next).unwrap();
    builder.build_unconditional_branch(loop_j).unwrap();

    builder.position_at_end(after_j);
    let off_next = builder.build_int_add(current_off, chunk, "dec.offnext").unwrap();
    builder.build_store(scratch.offset, off_next).unwrap();
    builder.build_store(scratch.state, new_state).unwrap();
    builder.build_unconditional_branch(loop_off).unwrap();

    builder.position_at_end(after_off);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_is_involution_with_same_seed() {
        let original = b"hello, obfuscated world!".to_vec();
        let mut buf = original.clone();
        xor_encrypt_strings(std::slice::from_mut(&mut buf), 0xCAFE_BABE);
        assert_ne!(buf, original);
        xor_encrypt_strings(std::slice::from_mut(&mut buf), 0xCAFE_BABE);
        assert_eq!(buf, original);
    }

    #[test]
    fn distinct_indices_get_distinct_keystreams() {
        let mut strings = vec![b"aaaaaaaa".to_vec(), b"aaaaaaaa".to_vec()];
        xor_encrypt_strings(&mut strings, 1);
        assert_ne!(strings[0], strings[1]);
    }

    #[test]
    fn empty_string_is_a_no_op() {
        let mut strings: Vec<Vec<u8>> = vec![Vec::new()];
        xor_encrypt_strings(&mut strings, 42);
        assert!(strings[0].is_empty());
    }
}
