//! CLI driver for the control-flow flattening pass.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use inkwell::context::Context as LlvmContext;
use obfuscate_core::cli::LogLevel;
use obfuscate_core::passes::cff;
use obfuscate_core::{cli, module_io, Random};

/// Rewrites each eligible function's CFG into a dispatcher state machine.
#[derive(Debug, Parser)]
#[command(name = "obfuscate-cff", version)]
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

    /// Percent chance a dispatcher comparison is routed through a cloned
    /// function-resolver indirection instead of compared inline.
    #[arg(long = "use-func-resolver", default_value_t = 0)]
    use_func_resolver: i32,

    /// Percent chance a dispatcher state constant is hidden behind a
    /// private global load instead of emitted as an immediate.
    #[arg(long = "use-global-state", default_value_t = 0)]
    use_global_state: i32,

    /// Percent chance the dispatcher state is run through the opaque
    /// XOR/ADD/SUB/ROL/ROR transform before comparison.
    #[arg(long = "use-opaque", default_value_t = 0)]
    use_opaque: i32,

    /// Percent chance each opaque-transform constant is hidden behind a
    /// private global load.
    #[arg(long = "use-global-opaque", default_value_t = 0)]
    use_global_opaque: i32,

    /// Percent chance the dispatcher state is additionally run through the
    /// SipHash transform before comparison.
    #[arg(long = "use-siphash", default_value_t = 0)]
    use_siphash: i32,

    /// Percent chance a SipHash call site gets its own cloned, always-inlined
    /// copy of the helper function rather than sharing the one per module.
    #[arg(long = "clone-siphash", default_value_t = 0)]
    clone_siphash: i32,
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
    log::info!("cff: seed {}", rng.seed());

    let options = cff::Options {
        use_function_resolver: args.use_func_resolver,
        use_global_state: args.use_global_state,
        use_opaque: args.use_opaque,
        use_global_opaque: args.use_global_opaque,
        use_siphash: args.use_siphash,
        clone_siphash: args.clone_siphash,
    };

    cff::run(&context, &module, args.iterations, options, &mut rng).context("running cff pass")?;

    module_io::write_module(&module, &args.output)
        .with_context(|| format!("writing {}", args.output.display()))?;
    Ok(())
}
