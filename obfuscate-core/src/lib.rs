//! Shared engine for the LLVM bitcode obfuscation pass suite: control-flow
//! flattening, encrypted indirect branching, mixed-boolean-arithmetic
//! substitution, and string encryption.
//!
//! Each pass is a thin driver (`passes::*`) over the primitives in this
//! crate's other modules: a shared PRNG ([`rng`]), function-local IR
//! surgery ([`ir_utils`]), the MBA rewrite catalogue ([`mba`]), the opaque
//! value transformer ([`opaque`]), the SipHash state transform
//! ([`siphash`]), the XTEA block cipher ([`xtea`]), the string cipher
//! ([`strcipher`]), and module load/verify/write helpers ([`module_io`]).

pub mod cli;
pub mod error;
pub mod ir_utils;
pub mod mba;
pub mod module_io;
pub mod opaque;
pub mod passes;
pub mod rng;
pub mod siphash;
pub mod strcipher;
pub mod xtea;

pub use error::{ObfuscateError, Result};
pub use rng::{Random, RandomSource};
