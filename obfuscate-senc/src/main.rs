//! CLI driver for the string encryption pass.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use inkwell::context::Context as LlvmContext;
use obfuscate_core::cli::LogLevel;
use obfuscate_core::passes::senc;
use obfuscate_core::{cli, module_io, Random};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Global,
    Stack,
}

/// Encrypts eligible string constants and emits matching runtime decryptors.
#[derive(Debug, Parser)]
#[command(name = "obfuscate-senc", version)]
struct Args {
    /// Input bitcode or textual IR file.
    input: PathBuf,

    /// Output bitcode file.
    output: PathBuf,

    /// Apply the pass this many times in succession. SENC only ever
    /// encrypts each eligible string once; this exists for flag parity with
    /// the other three tools.
    #[arg(long, default_value_t = 1)]
    iterations: u32,

    /// PRNG seed; 0 draws a seed nondeterministically and logs it.
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Minimum log severity emitted; overridable at runtime via `RUST_LOG`.
    #[arg(long, value_enum, default_value = "info")]
    log_level: LogLevel,

    /// Global mode decrypts every string once at startup via a constructor;
    /// stack mode decrypts into a stack buffer at each use site instead.
    #[arg(long, value_enum, default_value_t = ModeArg::Global)]
    mode: ModeArg,

    /// Skip string globals whose name starts with this prefix. May be
    /// given more than once.
    #[arg(long = "skip-prefix")]
    skip_prefix: Vec<String>,
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
    log::info!("senc: seed {}", rng.seed());

    let options = senc::Options {
        mode: match args.mode {
            ModeArg::Global => senc::Mode::Global,
            ModeArg::Stack => senc::Mode::Stack,
        },
        skip_prefixes: args.skip_prefix,
    };
    senc::run(&context, &module, args.iterations, options, &mut rng).context("running senc pass")?;

    module_io::write_module(&module, &args.output)
        .with_context(|| format!("writing {}", args.output.display()))?;
    Ok(())
}
