//! Embed Runtime CLI entry point.
//!
//! Loads a WebAssembly module (binary or text), optionally with gas
//! metering, calls one exported function and prints its result.
//!
//! ```text
//! embed-runtime module.wat add 1 2
//! embed-runtime module.wasm fib 20 --gas-limit 100000 --opcode-cost 1
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use embed_runtime_common::RuntimeConfig;
use embed_runtime_core::{Imports, Instance, OpcodeCosts, Value, ValueKind, WasmEngine};

/// Call an exported function of a WebAssembly module.
#[derive(Debug, Parser)]
#[command(name = "embed-runtime", version, about)]
struct Cli {
    /// Path to a `.wasm` or `.wat` module.
    module: PathBuf,

    /// Name of the exported function to call.
    function: String,

    /// Arguments, parsed according to the function's parameter types.
    #[arg(allow_negative_numbers = true)]
    args: Vec<String>,

    /// TOML configuration file.
    #[arg(long, env = "EMBED_RUNTIME_CONFIG")]
    config: Option<PathBuf>,

    /// Enable gas metering with this limit (overrides the config file).
    #[arg(long)]
    gas_limit: Option<u64>,

    /// Cost of every opcode when metering (overrides the config file).
    #[arg(long)]
    opcode_cost: Option<u32>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,embed_runtime=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => RuntimeConfig::from_file(path)?,
        None => RuntimeConfig::default(),
    };
    if let Some(gas_limit) = cli.gas_limit {
        config.metering.enabled = true;
        config.metering.gas_limit = gas_limit;
    }
    if let Some(cost) = cli.opcode_cost {
        config.metering.default_cost = cost;
    }

    let engine = WasmEngine::new(&config.engine)?;

    let bytes = std::fs::read(&cli.module)
        .with_context(|| format!("Failed to read module '{}'", cli.module.display()))?;

    let mut instance = if config.metering.enabled {
        let costs = OpcodeCosts::from_config(&config.metering)?;
        Instance::<()>::metered_with_imports(
            &engine,
            &bytes,
            Imports::new(),
            config.metering.gas_limit,
            &costs,
        )?
    } else {
        Instance::<()>::new(&engine, &bytes)?
    };

    let function = instance
        .export(&cli.function)
        .with_context(|| format!("Exported function `{}` does not exist.", cli.function))?;
    let args = parse_args(function.signature().inputs(), &cli.args)?;

    info!(function = %cli.function, args = args.len(), "Calling exported function");

    let result = instance.call(&cli.function, &args);

    if instance.is_metered() {
        eprintln!("points used: {}", instance.points_used());
    }

    match result? {
        Value::Void => {}
        value => println!("{value}"),
    }

    Ok(())
}

/// Parse each argument as the kind declared at its position.
///
/// Surplus or missing arguments are passed through so the call reports the
/// arity mismatch.
fn parse_args(kinds: &[ValueKind], args: &[String]) -> anyhow::Result<Vec<Value>> {
    args.iter()
        .enumerate()
        .map(|(i, arg)| match kinds.get(i) {
            Some(kind) => Ok(kind.parse(arg)?),
            None => Ok(Value::I32(0)),
        })
        .collect()
}
