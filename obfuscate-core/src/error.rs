//! Error taxonomy for the obfuscation pass suite.
//!
//! Mirrors spec §7: I/O and parse failures are reported up to the caller,
//! post-pass verifier failures are always fatal, and SipHash key-collision
//! exhaustion is a recoverable condition the caller can downgrade to a
//! warning and an opaque-only layer.

use std::path::PathBuf;

/// Errors that can occur while loading, transforming, or writing a module.
#[derive(Debug, thiserror::Error)]
pub enum ObfuscateError {
    /// Failed to read or write a file.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path being read or written.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The input could not be parsed as LLVM bitcode or IR.
    #[error("failed to parse module `{path}`: {message}")]
    Parse {
        /// Path of the module that failed to parse.
        path: PathBuf,
        /// Diagnostic text from the LLVM parser.
        message: String,
    },

    /// Linking an auxiliary module (e.g. the SipHash blob) into the target
    /// module failed.
    #[error("failed to link helper module: {0}")]
    Link(String),

    /// The module failed LLVM's own IR verifier after a pass ran. This is
    /// always a bug in the pass; it is never triggered by the skip
    /// conditions in §7, which are not errors.
    #[error("module failed verification after transformation: {0}")]
    Verify(String),

    /// A SipHash key schedule could not be found that avoids collisions
    /// among the active dispatcher states within the retry budget. Callers
    /// should fall back to an opaque-only state transform and continue.
    #[error("exhausted {attempts} attempts to find a collision-free SipHash key schedule")]
    SipHashCollisionExhausted {
        /// Number of key schedules tried before giving up.
        attempts: u32,
    },
}

/// Convenience alias used throughout `obfuscate-core`.
pub type Result<T> = std::result::Result<T, ObfuscateError>;
