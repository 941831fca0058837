//! CLI driver for the mixed-boolean-arithmetic substitution pass.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use inkwell::context::Context as LlvmContext;
use obfuscate_core::cli::LogLevel;
use obfuscate_core::passes::mba_pass;
use obfuscate_core::{cli, module_io, Random};

/// Rewrites add/sub/xor/mul/or instructions with semantically equivalent
/// expressions drawn from a fixed rewrite catalogue.
#[derive(Debug, Parser)]
#[command(name = "obfuscate-mba", version)]
struct Args {
    /// Input bitcode or textual IR file.
    input: PathBuf,

    /// Output bitcode file.
    output: PathBuf,

    /// Apply the pass this many times in succession.
    #[arg(long, default_value_t = 1)]
    iterations: u32,

    /// PRNG seed; 0 draws a seed nondeterministically and logs it.
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Minimum log severity emitted; overridable at runtime via `RUST_LOG`.
    #[arg(long, value_enum, default_value = "info")]
    log_level: LogLevel,
}

fn main() -> ExitCode {
    let args = Args::parse();
    cli::init_logger(args.log_level);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let context = LlvmContext::create();
    let module = module_io::load_module(&context, &args.input)
        .with_context(|| format!("loading {}", args.input.display()))?;

    let mut rng = Random::new(args.seed);
    log::info!("mba: seed {}", rng.seed());

    mba_pass::run(&context, &module, args.iterations, mba_pass::Options, &mut rng)
        .context("running mba pass")?;

    module_io::write_module(&module, &args.output)
        .with_context(|| format!("writing {}", args.output.display()))?;
    Ok(())
}
