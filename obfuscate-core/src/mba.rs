//! Mixed Boolean Arithmetic substitution: per-opcode catalogues of
//! semantically-equivalent rewrites for `add`, `sub`, `xor`, `mul`, and `or`.
//!
//! Each catalogue entry is a plain `fn` item rather than a closure or trait
//! object — no rewrite needs per-call state beyond the operands and the
//! shared PRNG, so a function-pointer table is the simplest fit, mirroring
//! the original's array-of-lambdas (`mba_sub.cpp:76-194`) in idiomatic Rust.

use inkwell::builder::Builder;
use inkwell::values::IntValue;

use crate::rng::RandomSource;

/// One MBA rewrite: given the builder and the two operands of the original
/// binary op, emits an equivalent sequence of instructions and returns the
/// replacement value.
pub type Rewrite<'ctx> =
    fn(&Builder<'ctx>, IntValue<'ctx>, IntValue<'ctx>, &mut dyn RandomSource) -> IntValue<'ctx>;

/// `x - y ≡ (x ⊕ -y) + 2·(x ∧ -y)`
fn sub_xor_and(b: &Builder, x: IntValue, y: IntValue, _rng: &mut dyn RandomSource) -> IntValue {
    let neg_y = b.build_int_neg(y, "mba.neg").unwrap();
    let xor = b.build_xor(x, neg_y, "mba.xor").unwrap();
    let and = b.build_and(x, neg_y, "mba.and").unwrap();
    let two = x.get_type().const_int(2, false);
    let mul = b.build_int_mul(two, and, "mba.mul").unwrap();
    b.build_int_add(xor, mul, "mba.add").unwrap()
}

/// SUB's catalogue: currently a single rewrite, kept as a slice of one so
/// adding alternatives later does not change call sites.
pub const SUB_REWRITES: &[Rewrite] = &[sub_xor_and];

/// `x + y ≡ ¬(x + (-x + (-x + ¬ y)))`
fn add_not_chain(b: &Builder, x: IntValue, y: IntValue, _rng: &mut dyn RandomSource) -> IntValue {
    let not_y = b.build_not(y, "mba.not").unwrap();
    let neg_x1 = b.build_int_neg(x, "mba.neg1").unwrap();
    let inner = b.build_int_add(neg_x1, not_y, "mba.add1").unwrap();
    let neg_x2 = b.build_int_neg(x, "mba.neg2").unwrap();
    let mid = b.build_int_add(neg_x2, inner, "mba.add2").unwrap();
    let outer = b.build_int_add(x, mid, "mba.add3").unwrap();
    b.build_not(outer, "mba.not2").unwrap()
}

/// `a + b`, seeded with a random mask `r`: `c = b + r; a' = a + c; a' - r`.
fn add_random_mask(b: &Builder, a: IntValue, y: IntValue, rng: &mut dyn RandomSource) -> IntValue {
    let r = a.get_type().const_int(rng.next_u64(), false);
    let c = b.build_int_add(y, r, "mba.c").unwrap();
    let a_plus_c = b.build_int_add(a, c, "mba.sum").unwrap();
    b.build_int_sub(a_plus_c, r, "mba.unmask").unwrap()
}

/// ADD's catalogue: the NOT-chain identity and the random-mask identity.
pub const ADD_REWRITES: &[Rewrite] = &[add_not_chain, add_random_mask];

/// `a ⊕ b ≡ (¬a ∧ b) ∨ (a ∧ ¬b)`
fn xor_demorgan(b: &Builder, a: IntValue, y: IntValue, _rng: &mut dyn RandomSource) -> IntValue {
    let not_a = b.build_not(a, "mba.nota").unwrap();
    let left = b.build_and(not_a, y, "mba.left").unwrap();
    let not_b = b.build_not(y, "mba.notb").unwrap();
    let right = b.build_and(a, not_b, "mba.right").unwrap();
    b.build_or(left, right, "mba.or").unwrap()
}

/// `a ⊕ b ≡ (a ∨ b) ∧ ¬(a ∧ b)`
fn xor_or_and_not(b: &Builder, a: IntValue, y: IntValue, _rng: &mut dyn RandomSource) -> IntValue {
    let or = b.build_or(a, y, "mba.or").unwrap();
    let and = b.build_and(a, y, "mba.and").unwrap();
    let not_and = b.build_not(and, "mba.notand").unwrap();
    b.build_and(or, not_and, "mba.result").unwrap()
}

/// `a ⊕ b ≡ (a + b) - 2·(a ∧ b)`
fn xor_add_sub(b: &Builder, a: IntValue, y: IntValue, _rng: &mut dyn RandomSource) -> IntValue {
    let sum = b.build_int_add(a, y, "mba.sum").unwrap();
    let and = b.build_and(a, y, "mba.and").unwrap();
    let two = a.get_type().const_int(2, false);
    let twice = b.build_int_mul(two, and, "mba.twice").unwrap();
    b.build_int_sub(sum, twice, "mba.result").unwrap()
}

/// `a ⊕ b ≡ ¬(¬a ∧ ¬b) ∧ ¬(a ∧ b)`
fn xor_double_demorgan(
    b: &Builder,
    a: IntValue,
    y: IntValue,
    _rng: &mut dyn RandomSource,
) -> IntValue {
    let not_a = b.build_not(a, "mba.nota").unwrap();
    let not_b = b.build_not(y, "mba.notb").unwrap();
    let nor = b.build_and(not_a, not_b, "mba.nor").unwrap();
    let not_nor = b.build_not(nor, "mba.notnor").unwrap();
    let and = b.build_and(a, y, "mba.and").unwrap();
    let not_and = b.build_not(and, "mba.notand").unwrap();
    b.build_and(not_nor, not_and, "mba.result").unwrap()
}

/// XOR's catalogue: four semantically-equivalent identities.
pub const XOR_REWRITES: &[Rewrite] = &[
    xor_demorgan,
    xor_or_and_not,
    xor_add_sub,
    xor_double_demorgan,
];

/// `b·c ≡ (b∨c)·(b∧c) + (b∧¬c)·(c∧¬b)`
fn mul_or_and_split(b: &Builder, x: IntValue, y: IntValue, _rng: &mut dyn RandomSource) -> IntValue {
    let or = b.build_or(x, y, "mba.or").unwrap();
    let and = b.build_and(x, y, "mba.and").unwrap();
    let left = b.build_int_mul(or, and, "mba.left").unwrap();
    let not_y = b.build_not(y, "mba.noty").unwrap();
    let b_and_noty = b.build_and(x, not_y, "mba.bnoty").unwrap();
    let not_x = b.build_not(x, "mba.notx").unwrap();
    let c_and_notb = b.build_and(y, not_x, "mba.cnotb").unwrap();
    let right = b.build_int_mul(b_and_noty, c_and_notb, "mba.right").unwrap();
    b.build_int_add(left, right, "mba.result").unwrap()
}

/// MUL's catalogue: currently a single rewrite.
pub const MUL_REWRITES: &[Rewrite] = &[mul_or_and_split];

/// `a ∨ b ≡ ¬(¬a ∧ ¬b)`
fn or_demorgan(b: &Builder, a: IntValue, y: IntValue, _rng: &mut dyn RandomSource) -> IntValue {
    let not_a = b.build_not(a, "mba.nota").unwrap();
    let not_b = b.build_not(y, "mba.notb").unwrap();
    let and = b.build_and(not_a, not_b, "mba.and").unwrap();
    b.build_not(and, "mba.result").unwrap()
}

/// `a ∨ b ≡ a ⊕ b ⊕ (a ∧ b)`
fn or_xor_and(b: &Builder, a: IntValue, y: IntValue, _rng: &mut dyn RandomSource) -> IntValue {
    let and = b.build_and(a, y, "mba.and").unwrap();
    let inner = b.build_xor(y, and, "mba.innerxor").unwrap();
    b.build_xor(a, inner, "mba.result").unwrap()
}

/// `a ∨ b ≡ (a + b) - (a ∧ b)`
fn or_add_sub(b: &Builder, a: IntValue, y: IntValue, _rng: &mut dyn RandomSource) -> IntValue {
    let sum = b.build_int_add(a, y, "mba.sum").unwrap();
    let and = b.build_and(a, y, "mba.and").unwrap();
    b.build_int_sub(sum, and, "mba.result").unwrap()
}

/// OR's catalogue: three semantically-equivalent identities.
pub const OR_REWRITES: &[Rewrite] = &[or_demorgan, or_xor_and, or_add_sub];

/// Picks a uniformly random rewrite from `catalogue` and applies it.
pub fn apply_random<'ctx>(
    catalogue: &[Rewrite<'ctx>],
    builder: &Builder<'ctx>,
    lhs: IntValue<'ctx>,
    rhs: IntValue<'ctx>,
    rng: &mut dyn RandomSource,
) -> IntValue<'ctx> {
    let idx = rng.uniform_index(catalogue.len());
    catalogue[idx](builder, lhs, rhs, rng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::Random;
    use inkwell::context::Context;
    use inkwell::OptimizationLevel;

    fn check_catalogue_preserves_semantics(
        catalogue: &[Rewrite],
        op: impl Fn(i64, i64) -> i64,
        samples: &[(i64, i64)],
    ) {
        for (entry_idx, rewrite) in catalogue.iter().enumerate() {
            let context = Context::create();
            let module = context.create_module("mba_test");
            let i64_ty = context.i64_type();
            let fn_ty = i64_ty.fn_type(&[i64_ty.into(), i64_ty.into()], false);
            let func = module.add_function(&format!("check_{entry_idx}"), fn_ty, None);
            let entry = context.append_basic_block(func, "entry");
            let builder = context.create_builder();
            builder.position_at_end(entry);

            let lhs = func.get_nth_param(0).unwrap().into_int_value();
            let rhs = func.get_nth_param(1).unwrap().into_int_value();
            let mut rng = Random::new(1);
            let result = rewrite(&builder, lhs, rhs, &mut rng);
            builder.build_return(Some(&result)).unwrap();

            let engine = module
                .create_jit_execution_engine(OptimizationLevel::None)
                .expect("failed to create JIT execution engine");
            type CheckFn = unsafe extern "C" fn(i64, i64) -> i64;
            let compiled = unsafe {
                engine
                    .get_function::<CheckFn>(&format!("check_{entry_idx}"))
                    .expect("compiled function not found")
            };

            for &(a, b) in samples {
                let actual = unsafe { compiled.call(a, b) };
                assert_eq!(actual, op(a, b), "rewrite {entry_idx} on ({a}, {b})");
            }
        }
    }

    #[test]
    fn sub_identity_holds_over_samples() {
        check_catalogue_preserves_semantics(
            SUB_REWRITES,
            |x, y| x.wrapping_sub(y),
            &[(5, 3), (-7, 2), (0, 0), (i64::MIN, 1)],
        );
    }

    #[test]
    fn add_identity_holds_over_samples() {
        check_catalogue_preserves_semantics(
            ADD_REWRITES,
            |x, y| x.wrapping_add(y),
            &[(5, 3), (-7, 2), (0, 0), (i64::MAX, 1)],
        );
    }

    #[test]
    fn xor_identity_holds_over_samples() {
        check_catalogue_preserves_semantics(
            XOR_REWRITES,
            |x, y| x ^ y,
            &[(5, 3), (-7, 2), (0, 0), (-1, 0)],
        );
    }

    #[test]
    fn mul_identity_holds_over_samples() {
        check_catalogue_preserves_semantics(
            MUL_REWRITES,
            |x, y| x.wrapping_mul(y),
            &[(5, 3), (-7, 2), (0, 0), (1000, 1000)],
        );
    }

    #[test]
    fn or_identity_holds_over_samples() {
        check_catalogue_preserves_semantics(
            OR_REWRITES,
            |x, y| x | y,
            &[(5, 3), (-7, 2), (0, 0), (-1, 0)],
        );
    }

    #[test]
    fn catalogue_sizes_match_the_documented_count() {
        assert_eq!(SUB_REWRITES.len(), 1);
        assert_eq!(ADD_REWRITES.len(), 2);
        assert_eq!(XOR_REWRITES.len(), 4);
        assert_eq!(MUL_REWRITES.len(), 1);
        assert_eq!(OR_REWRITES.len(), 3);
    }
}
