//! Opaque transformer: a reversible pipeline of 2-6 integer operations used
//! to hide constants and dispatcher state values from simple static
//! analysis. The forward transform is emitted as IR; [`transform_constant`]
//! computes the same pipeline natively so callers needing the transformed
//! value at compile time (state table construction, collision search) don't
//! have to interpret their own IR.

use inkwell::builder::Builder;
use inkwell::module::Module;
use inkwell::values::{BasicValue, GlobalValue, IntValue};
use inkwell::AddressSpace;

use crate::rng::RandomSource;

/// One step of the reversible pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    Xor,
    Add,
    Sub,
    Rol,
    Ror,
}

impl OpType {
    fn from_index(idx: u64) -> Self {
        match idx {
            0 => OpType::Xor,
            1 => OpType::Add,
            2 => OpType::Sub,
            3 => OpType::Rol,
            _ => OpType::Ror,
        }
    }
}

/// A randomly generated, reversible sequence of XOR/ADD/SUB/ROL/ROR steps
/// over an `is_32_bit`-wide (32- or 64-bit) integer.
pub struct OpaqueTransformer {
    is_32_bit: bool,
    ops: Vec<OpType>,
    constants: Vec<u64>,
}

impl OpaqueTransformer {
    /// Builds a new pipeline of 2-6 steps, drawing op kinds and constants
    /// from `rng`. Rotation amounts are reduced to `1..=31` so a rotate by 0
    /// (a no-op that would reveal nothing was done) never occurs.
    pub fn new(is_32_bit: bool, rng: &mut dyn RandomSource) -> Self {
        let num_steps = rng.range_u64(2, 6) as usize;
        let max_const = if is_32_bit { u32::MAX as u64 } else { u64::MAX };
        let mut ops = Vec::with_capacity(num_steps);
        let mut constants = Vec::with_capacity(num_steps);

        for _ in 0..num_steps {
            let op = OpType::from_index(rng.range_u64(0, 4));
            let mut c = rng.range_u64(0x000F_0000, max_const);
            if matches!(op, OpType::Rol | OpType::Ror) {
                c = (c % 31) + 1;
            }
            ops.push(op);
            constants.push(c);
        }

        Self {
            is_32_bit,
            ops,
            constants,
        }
    }

    fn bit_width(&self) -> u32 {
        if self.is_32_bit {
            32
        } else {
            64
        }
    }

    fn mask(&self) -> u64 {
        if self.is_32_bit {
            u32::MAX as u64
        } else {
            u64::MAX
        }
    }

    /// Applies the pipeline to `input` natively, matching the IR the
    /// `transform` method below emits bit-for-bit.
    pub fn transform_constant(&self, input: u64) -> u64 {
        let mask = self.mask();
        let width = self.bit_width();
        let mut current = input & mask;

        for (op, &c) in self.ops.iter().zip(self.constants.iter()) {
            current = match op {
                OpType::Xor => current ^ c,
                OpType::Add => current.wrapping_add(c),
                OpType::Sub => current.wrapping_sub(c),
                OpType::Rol => {
                    let shift = (c % width as u64) as u32;
                    rotate_left(current, shift, width)
                }
                OpType::Ror => {
                    let shift = (c % width as u64) as u32;
                    rotate_right(current, shift, width)
                }
            };
            current &= mask;
        }
        current
    }

    /// Inverse of [`transform_constant`]: recovers the original value from a
    /// transformed one, applying the pipeline's inverse steps in reverse
    /// order.
    pub fn untransform_constant(&self, transformed: u64) -> u64 {
        let mask = self.mask();
        let width = self.bit_width();
        let mut current = transformed & mask;

        for (op, &c) in self.ops.iter().zip(self.constants.iter()).rev() {
            current = match op {
                OpType::Xor => current ^ c,
                OpType::Add => current.wrapping_sub(c),
                OpType::Sub => current.wrapping_add(c),
                OpType::Rol => {
                    let shift = (c % width as u64) as u32;
                    rotate_right(current, shift, width)
                }
                OpType::Ror => {
                    let shift = (c % width as u64) as u32;
                    rotate_left(current, shift, width)
                }
            };
            current &= mask;
        }
        current
    }

    /// Emits IR implementing the pipeline over `input`, truncating or
    /// zero-extending it to the transformer's target width first if needed.
    /// `use_global_chance` is the percent chance each constant is hidden
    /// behind a freshly created private global load rather than emitted as
    /// an immediate, per spec's opaque-global option.
    pub fn transform<'ctx>(
        &self,
        module: &Module<'ctx>,
        builder: &Builder<'ctx>,
        input: IntValue<'ctx>,
        use_global_chance: i32,
        rng: &mut dyn RandomSource,
    ) -> IntValue<'ctx> {
        let target_ty = if self.is_32_bit {
            module.get_context().i32_type()
        } else {
            module.get_context().i64_type()
        };

        let mut current = if input.get_type() != target_ty {
            if self.is_32_bit {
                builder.build_int_truncate(input, target_ty, "opaque.trunc").unwrap()
            } else {
                builder
                    .build_int_z_extend_or_bit_cast(input, target_ty, "opaque.zext")
                    .unwrap()
            }
        } else {
            input
        };

        let width = self.bit_width();

        for (op, &c) in self.ops.iter().zip(self.constants.iter()) {
            let c_val = self.materialize_constant(module, builder, c, use_global_chance, rng);
            current = match op {
                OpType::Xor => builder.build_xor(current, c_val, "opaque.xor").unwrap(),
                OpType::Add => builder.build_int_add(current, c_val, "opaque.add").unwrap(),
                OpType::Sub => builder.build_int_sub(current, c_val, "opaque.sub").unwrap(),
                OpType::Rol => {
                    let shift = c % width as u64;
                    let shift_c =
                        self.materialize_constant(module, builder, shift, use_global_chance, rng);
                    let inv_c = self.materialize_constant(
                        module,
                        builder,
                        width as u64 - shift,
                        use_global_chance,
                        rng,
                    );
                    let left = builder.build_left_shift(current, shift_c, "opaque.shl").unwrap();
                    let right = builder
                        .build_right_shift(current, inv_c, false, "opaque.lshr")
                        .unwrap();
                    builder.build_or(left, right, "opaque.rol").unwrap()
                }
                OpType::Ror => {
                    let shift = c % width as u64;
                    let shift_c =
                        self.materialize_constant(module, builder, shift, use_global_chance, rng);
                    let inv_c = self.materialize_constant(
                        module,
                        builder,
                        width as u64 - shift,
                        use_global_chance,
                        rng,
                    );
                    let right = builder
                        .build_right_shift(current, shift_c, false, "opaque.lshr")
                        .unwrap();
                    let left = builder.build_left_shift(current, inv_c, "opaque.shl").unwrap();
                    builder.build_or(right, left, "opaque.ror").unwrap()
                }
            };
        }
        current
    }

    fn materialize_constant<'ctx>(
        &self,
        module: &Module<'ctx>,
        builder: &Builder<'ctx>,
        c: u64,
        use_global_chance: i32,
        rng: &mut dyn RandomSource,
    ) -> IntValue<'ctx> {
        let ty = if self.is_32_bit {
            module.get_context().i32_type()
        } else {
            module.get_context().i64_type()
        };
        let literal = ty.const_int(c, false);

        if rng.chance(use_global_chance) {
            let name = format!("__state_var_{c}");
            let gv: GlobalValue = module.add_global(ty, Some(AddressSpace::default()), &name);
            gv.set_linkage(inkwell::module::Linkage::Private);
            gv.set_initializer(&literal.as_basic_value_enum());
            return builder
                .build_load(ty, gv.as_pointer_value(), "opaque.load")
                .unwrap()
                .into_int_value();
        }
        literal
    }
}

fn rotate_left(v: u64, shift: u32, width: u32) -> u64 {
    if shift == 0 {
        return v;
    }
    ((v << shift) | (v >> (width - shift))) & width_mask(width)
}

fn rotate_right(v: u64, shift: u32, width: u32) -> u64 {
    if shift == 0 {
        return v;
    }
    ((v >> shift) | (v << (width - shift))) & width_mask(width)
}

fn width_mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::Random;

    #[test]
    fn transform_and_untransform_round_trip_64bit() {
        let mut rng = Random::new(77);
        for _ in 0..200 {
            let transformer = OpaqueTransformer::new(false, &mut rng);
            let input = rng.range_u64(0, u64::MAX);
            let transformed = transformer.transform_constant(input);
            assert_eq!(transformer.untransform_constant(transformed), input);
        }
    }

    #[test]
    fn transform_and_untransform_round_trip_32bit() {
        let mut rng = Random::new(13);
        for _ in 0..200 {
            let transformer = OpaqueTransformer::new(true, &mut rng);
            let input = rng.range_u64(0, u32::MAX as u64);
            let transformed = transformer.transform_constant(input);
            assert!(transformed <= u32::MAX as u64);
            assert_eq!(transformer.untransform_constant(transformed), input);
        }
    }

    #[test]
    fn pipeline_has_two_to_six_steps() {
        let mut rng = Random::new(5);
        for _ in 0..500 {
            let transformer = OpaqueTransformer::new(false, &mut rng);
            assert!((2..=6).contains(&transformer.ops.len()));
        }
    }

    #[test]
    fn rotation_amounts_are_never_zero() {
        let mut rng = Random::new(9);
        for _ in 0..500 {
            let transformer = OpaqueTransformer::new(false, &mut rng);
            for (op, &c) in transformer.ops.iter().zip(transformer.constants.iter()) {
                if matches!(op, OpType::Rol | OpType::Ror) {
                    assert!((1..=31).contains(&c));
                }
            }
        }
    }
}
