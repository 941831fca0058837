//! SipHash-2-4 state transform.
//!
//! The transform is carried as a textual LLVM IR blob (`SIPHASH_IR`) rather
//! than built instruction-by-instruction with `Builder` calls — the
//! reference round function is dense enough that hand-authored textual IR,
//! parsed and linked in once per module, is clearer than reconstructing it
//! with builder calls, and keeps the emitted IR bit-identical across runs.
//! [`siphash_ct`] is the same function reimplemented natively in Rust, used
//! only for the compile-time collision search a dispatcher-state transform
//! needs before it ever touches IR.

use inkwell::context::ContextRef;
use inkwell::memory_buffer::MemoryBuffer;
use inkwell::module::{Linkage, Module};
use inkwell::values::FunctionValue;

use crate::error::{ObfuscateError, Result};

/// Name every SipHash helper function carries before an optional clone
/// renames it.
pub const SIPHASH_FN_NAME: &str = "___siphash";

/// Textual IR for a SipHash-2-4 round function taking the input word and a
/// 6-word key/state schedule (`k0, k1, v0, v1, v2, v3`) and returning the
/// mixed 64-bit result. Declared `define` (external linkage) so the linker
/// does not drop it as unused before the caller gets a chance to reference
/// it; callers downgrade it to internal linkage once linked in.
pub const SIPHASH_IR: &str = r#"
define i64 @___siphash(i64 noundef %0, i64 noundef %1, i64 noundef %2, i64 noundef %3, i64 noundef %4, i64 noundef %5, i64 noundef %6) {
  %8 = xor i64 %6, %2
  %9 = xor i64 %5, %1
  %10 = xor i64 %4, %2
  %11 = xor i64 %3, %1
  %12 = xor i64 %8, %0
  br label %13

13:
  %14 = phi i64 [ %11, %7 ], [ %26, %13 ]
  %15 = phi i64 [ %10, %7 ], [ %31, %13 ]
  %16 = phi i64 [ %9, %7 ], [ %32, %13 ]
  %17 = phi i1 [ true, %7 ], [ false, %13 ]
  %18 = phi i64 [ %12, %7 ], [ %28, %13 ]
  %19 = add i64 %14, %15
  %20 = tail call i64 @llvm.fshl.i64(i64 %15, i64 %15, i64 13)
  %21 = xor i64 %19, %20
  %22 = tail call i64 @llvm.fshl.i64(i64 %19, i64 %19, i64 32)
  %23 = add i64 %16, %18
  %24 = tail call i64 @llvm.fshl.i64(i64 %18, i64 %18, i64 16)
  %25 = xor i64 %23, %24
  %26 = add i64 %22, %25
  %27 = tail call i64 @llvm.fshl.i64(i64 %25, i64 %25, i64 21)
  %28 = xor i64 %26, %27
  %29 = add i64 %21, %23
  %30 = tail call i64 @llvm.fshl.i64(i64 %21, i64 %21, i64 17)
  %31 = xor i64 %30, %29
  %32 = tail call i64 @llvm.fshl.i64(i64 %29, i64 %29, i64 32)
  br i1 %17, label %13, label %33

33:
  %34 = xor i64 %26, %0
  %35 = xor i64 %28, 576460752303423488
  br label %36

36:
  %37 = phi i64 [ %34, %33 ], [ %49, %36 ]
  %38 = phi i64 [ %31, %33 ], [ %54, %36 ]
  %39 = phi i64 [ %32, %33 ], [ %55, %36 ]
  %40 = phi i1 [ true, %33 ], [ false, %36 ]
  %41 = phi i64 [ %35, %33 ], [ %51, %36 ]
  %42 = add i64 %37, %38
  %43 = tail call i64 @llvm.fshl.i64(i64 %38, i64 %38, i64 13)
  %44 = xor i64 %42, %43
  %45 = tail call i64 @llvm.fshl.i64(i64 %42, i64 %42, i64 32)
  %46 = add i64 %39, %41
  %47 = tail call i64 @llvm.fshl.i64(i64 %41, i64 %41, i64 16)
  %48 = xor i64 %46, %47
  %49 = add i64 %45, %48
  %50 = tail call i64 @llvm.fshl.i64(i64 %48, i64 %48, i64 21)
  %51 = xor i64 %49, %50
  %52 = add i64 %44, %46
  %53 = tail call i64 @llvm.fshl.i64(i64 %44, i64 %44, i64 17)
  %54 = xor i64 %53, %52
  %55 = tail call i64 @llvm.fshl.i64(i64 %52, i64 %52, i64 32)
  br i1 %40, label %36, label %56

56:
  %57 = xor i64 %49, 576460752303423488
  %58 = xor i64 %55, 255
  br label %59

59:
  %60 = phi i64 [ %57, %56 ], [ %72, %59 ]
  %61 = phi i64 [ %54, %56 ], [ %77, %59 ]
  %62 = phi i64 [ %58, %56 ], [ %78, %59 ]
  %63 = phi i32 [ 0, %56 ], [ %79, %59 ]
  %64 = phi i64 [ %51, %56 ], [ %74, %59 ]
  %65 = add i64 %60, %61
  %66 = tail call i64 @llvm.fshl.i64(i64 %61, i64 %61, i64 13)
  %67 = xor i64 %65, %66
  %68 = tail call i64 @llvm.fshl.i64(i64 %65, i64 %65, i64 32)
  %69 = add i64 %62, %64
  %70 = tail call i64 @llvm.fshl.i64(i64 %64, i64 %64, i64 16)
  %71 = xor i64 %69, %70
  %72 = add i64 %68, %71
  %73 = tail call i64 @llvm.fshl.i64(i64 %71, i64 %71, i64 21)
  %74 = xor i64 %72, %73
  %75 = add i64 %67, %69
  %76 = tail call i64 @llvm.fshl.i64(i64 %67, i64 %67, i64 17)
  %77 = xor i64 %76, %75
  %78 = tail call i64 @llvm.fshl.i64(i64 %75, i64 %75, i64 32)
  %79 = add nuw nsw i32 %63, 1
  %80 = icmp eq i32 %79, 4
  br i1 %80, label %81, label %59

81:
  %82 = xor i64 %78, %74
  %83 = xor i64 %82, %77
  %84 = xor i64 %83, %72
  ret i64 %84
}

declare i64 @llvm.fshl.i64(i64, i64, i64)
"#;

/// Returns the module's existing `___siphash` function, or parses
/// [`SIPHASH_IR`] and links it in (downgrading it to internal linkage once
/// linked) if none is present yet.
pub fn get_or_create_siphash_function<'ctx>(
    module: &Module<'ctx>,
    context: ContextRef<'ctx>,
) -> Result<FunctionValue<'ctx>> {
    if let Some(existing) = module.get_function(SIPHASH_FN_NAME) {
        return Ok(existing);
    }

    let buffer = MemoryBuffer::create_from_memory_range(SIPHASH_IR.as_bytes(), "siphash");
    let siphash_module = context
        .create_module_from_ir(buffer)
        .map_err(|e| ObfuscateError::Parse {
            path: "<embedded siphash ir>".into(),
            message: e.to_string(),
        })?;

    module
        .link_in_module(siphash_module)
        .map_err(|e| ObfuscateError::Link(e.to_string()))?;

    let fn_value = module
        .get_function(SIPHASH_FN_NAME)
        .ok_or_else(|| ObfuscateError::Link("siphash function missing after link".into()))?;
    fn_value.set_linkage(Linkage::Internal);
    Ok(fn_value)
}

/// Parses a fresh copy of [`SIPHASH_IR`] under `new_name` and links it into
/// `module`, then marks it always-inline. Used in place of LLVM-C++'s
/// `CloneFunction` (which inkwell/LLVM-C has no binding for): re-parsing the
/// same textual blob under a new name produces a function that is
/// structurally identical but not aliased to the shared one, which is all
/// the "clone before inlining" option needs.
pub fn clone_siphash_function<'ctx>(
    module: &Module<'ctx>,
    context: ContextRef<'ctx>,
    new_name: &str,
) -> Result<FunctionValue<'ctx>> {
    let renamed_ir = SIPHASH_IR.replacen(SIPHASH_FN_NAME, new_name, 1);
    let buffer = MemoryBuffer::create_from_memory_range(renamed_ir.as_bytes(), new_name);
    let clone_module = context
        .create_module_from_ir(buffer)
        .map_err(|e| ObfuscateError::Parse {
            path: "<embedded siphash ir clone>".into(),
            message: e.to_string(),
        })?;

    module
        .link_in_module(clone_module)
        .map_err(|e| ObfuscateError::Link(e.to_string()))?;

    let fn_value = module
        .get_function(new_name)
        .ok_or_else(|| ObfuscateError::Link("cloned siphash function missing after link".into()))?;
    fn_value.set_linkage(Linkage::Internal);
    fn_value.add_attribute(
        inkwell::attributes::AttributeLoc::Function,
        context.create_enum_attribute(inkwell::attributes::Attribute::get_named_enum_kind_id("alwaysinline"), 0),
    );
    Ok(fn_value)
}

#[inline]
fn rotl64(x: u64, b: u32) -> u64 {
    x.rotate_left(b)
}

/// Native reimplementation of the SipHash-2-4 variable the emitted IR
/// computes, used only for the compile-time collision search a dispatcher
/// state transform performs before ever emitting a call.
pub fn siphash_ct(input: u64, k0: u64, k1: u64, v0: u64, v1: u64, v2: u64, v3: u64) -> u64 {
    let mut v0 = v0 ^ k0;
    let mut v1 = v1 ^ k1;
    let mut v2 = v2 ^ k0;
    let mut v3 = v3 ^ k1 ^ input;

    macro_rules! siphash_round {
        () => {{
            v0 = v0.wrapping_add(v1);
            v1 = rotl64(v1, 13);
            v1 ^= v0;
            v0 = rotl64(v0, 32);
            v2 = v2.wrapping_add(v3);
            v3 = rotl64(v3, 16);
            v3 ^= v2;
            v0 = v0.wrapping_add(v3);
            v3 = rotl64(v3, 21);
            v3 ^= v0;
            v2 = v2.wrapping_add(v1);
            v1 = rotl64(v1, 17);
            v1 ^= v2;
            v2 = rotl64(v2, 32);
        }};
    }

    let b = (8u64 << 56) | input;

    siphash_round!();
    siphash_round!();
    v0 ^= input;

    v3 ^= b;
    siphash_round!();
    siphash_round!();
    v0 ^= b;

    v2 ^= 0xff;
    siphash_round!();
    siphash_round!();
    siphash_round!();
    siphash_round!();

    v0 ^ v1 ^ v2 ^ v3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn siphash_ct_is_deterministic() {
        let a = siphash_ct(42, 1, 2, 3, 4, 5, 6);
        let b = siphash_ct(42, 1, 2, 3, 4, 5, 6);
        assert_eq!(a, b);
    }

    #[test]
    fn siphash_ct_differs_across_keys() {
        let a = siphash_ct(42, 1, 2, 3, 4, 5, 6);
        let b = siphash_ct(42, 7, 2, 3, 4, 5, 6);
        assert_ne!(a, b);
    }

    #[test]
    fn siphash_ct_differs_across_inputs() {
        let a = siphash_ct(1, 10, 20, 30, 40, 50, 60);
        let b = siphash_ct(2, 10, 20, 30, 40, 50, 60);
        assert_ne!(a, b);
    }
}
