//! The `reef` command-line runtime.
//!
//! Exit codes are a contract with shell scripts: 0 success, 1 runtime trap,
//! 2 invalid module, 126 file not found.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};

use reef_vm::prelude::*;
use reef_vm::runtime::{self, WasiOptions};
use reef_vm::wasi::Capabilities;

const EXIT_TRAP: u8 = 1;
const EXIT_INVALID: u8 = 2;
const EXIT_NO_FILE: u8 = 126;

#[derive(Parser)]
#[command(name = "reef", version, about = "A WebAssembly runtime")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
    /// Module path (shorthand for `run <module>`).
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand)]
enum Command {
    /// Run a module (the default when the first argument looks like a path).
    Run(RunArgs),
    /// List a module's imports and exports.
    Inspect {
        /// Module path.
        module: PathBuf,
        /// Emit JSON.
        #[arg(long)]
        json: bool,
    },
    /// Decode and validate without running.
    Validate {
        /// Module path.
        module: PathBuf,
    },
    /// List the supported proposals.
    Features {
        /// Emit JSON.
        #[arg(long)]
        json: bool,
    },
    /// Print the version.
    Version,
}

#[derive(Args, Default)]
struct RunArgs {
    /// Module path.
    module: Option<PathBuf>,
    /// Arguments passed to the program (or to `--invoke`).
    args: Vec<String>,
    /// Invoke a specific export instead of `_start`.
    #[arg(long)]
    invoke: Option<String>,
    /// Instantiate a side module first: `--link name=file`.
    #[arg(long, value_name = "NAME=FILE")]
    link: Vec<String>,
    /// Fuel budget; execution traps once it is spent.
    #[arg(long)]
    fuel: Option<u64>,
    /// Ceiling on linear-memory bytes.
    #[arg(long)]
    max_memory: Option<u64>,
    /// Preopen a host directory for WASI.
    #[arg(long)]
    dir: Vec<PathBuf>,
    /// Inject an environment entry: `--env KEY=VALUE`.
    #[arg(long, value_name = "KEY=VALUE")]
    env: Vec<String>,
    /// Allow stdio plus preopened-file reads.
    #[arg(long)]
    allow_read: bool,
    /// Allow preopened-file writes.
    #[arg(long)]
    allow_write: bool,
    /// Allow environment access.
    #[arg(long)]
    allow_env: bool,
    /// Allow path_open.
    #[arg(long)]
    allow_path: bool,
    /// Allow clock access.
    #[arg(long)]
    allow_clock: bool,
    /// Allow randomness.
    #[arg(long)]
    allow_random: bool,
    /// Allow proc_exit and scheduling.
    #[arg(long)]
    allow_proc: bool,
    /// Grant every capability.
    #[arg(long)]
    allow_all: bool,
    /// Deny every capability and clamp fuel and memory.
    #[arg(long)]
    sandbox: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Some(Command::Run(args)) => run(args),
        Some(Command::Inspect { module, json }) => inspect(&module, json),
        Some(Command::Validate { module }) => validate(&module),
        Some(Command::Features { json }) => {
            features(json);
            Ok(ExitCode::SUCCESS)
        }
        Some(Command::Version) => {
            println!("reef {}", env!("CARGO_PKG_VERSION"));
            Ok(ExitCode::SUCCESS)
        }
        None => run(cli.run),
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("reef: {e}");
            ExitCode::from(classify(&e))
        }
    }
}

/// Map an error onto the exit-code contract.
fn classify(e: &anyhow::Error) -> u8 {
    match e.downcast_ref::<VmError>() {
        Some(VmError::InvalidWasm(_)) => EXIT_INVALID,
        Some(_) => EXIT_TRAP,
        None => {
            if e.downcast_ref::<std::io::Error>().is_some() {
                EXIT_NO_FILE
            } else {
                EXIT_INVALID
            }
        }
    }
}

fn read_module(path: &Path) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| anyhow::anyhow!(std::io::Error::new(e.kind(), format!("{}: {e}", path.display()))))
}

fn capabilities(args: &RunArgs) -> Capabilities {
    if args.sandbox {
        return Capabilities::empty();
    }
    if args.allow_all {
        return Capabilities::all();
    }
    let mut caps = Capabilities::default_set();
    if args.allow_read {
        caps |= Capabilities::STDIO | Capabilities::FS_READ;
    }
    if args.allow_write {
        caps |= Capabilities::FS_WRITE;
    }
    if args.allow_env {
        caps |= Capabilities::ENV;
    }
    if args.allow_path {
        caps |= Capabilities::PATH | Capabilities::FS_READ;
    }
    if args.allow_clock {
        caps |= Capabilities::CLOCK;
    }
    if args.allow_random {
        caps |= Capabilities::RANDOM;
    }
    if args.allow_proc {
        caps |= Capabilities::PROC;
    }
    caps
}

fn run(args: RunArgs) -> anyhow::Result<ExitCode> {
    let Some(path) = args.module.clone() else {
        anyhow::bail!("no module given; see `reef --help`");
    };
    let bytes = read_module(&path)?;

    let mut params = VmParams::default();
    if args.sandbox {
        params = VmParams::sandboxed();
    }
    if let Some(fuel) = args.fuel {
        params.fuel = Some(fuel);
    }
    if let Some(max) = args.max_memory {
        params.max_memory_bytes = Some(max);
    }

    let mut links = Vec::new();
    for spec in &args.link {
        let (name, file) = spec
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("--link expects NAME=FILE"))?;
        links.push((name.to_string(), read_module(Path::new(file))?));
    }

    let mut env = Vec::new();
    for spec in &args.env {
        let (key, value) = spec
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("--env expects KEY=VALUE"))?;
        env.push((key.to_string(), value.to_string()));
    }

    let mut wasi_args = vec![path.display().to_string()];
    if args.invoke.is_none() {
        wasi_args.extend(args.args.iter().cloned());
    }

    let options = WasiOptions {
        caps: Some(capabilities(&args)),
        args: wasi_args,
        env,
        preopens: args.dir.clone(),
    };
    let mut module = WasmModule::load_wasi_with(&bytes, params, options, &links)?;

    if let Some(name) = &args.invoke {
        let info = module
            .get_export_info(name)
            .ok_or_else(|| anyhow::anyhow!(VmError::ExportNotFound(name.clone())))?;
        let signature = info
            .signature
            .ok_or_else(|| anyhow::anyhow!("{name} is not a function export"))?;
        let words = runtime::parse_invoke_args(&signature, &args.args)?;
        let results = module.invoke(name, &words)?;
        for line in runtime::format_invoke_results(&signature, &results) {
            println!("{line}");
        }
    } else {
        module.invoke("_start", &[])?;
    }

    match module.get_wasi_exit_code() {
        Some(code) => Ok(ExitCode::from(code.clamp(0, 255) as u8)),
        None => Ok(ExitCode::SUCCESS),
    }
}

fn inspect(path: &Path, json: bool) -> anyhow::Result<ExitCode> {
    let bytes = read_module(path)?;
    let imports = runtime::inspect_imports(&bytes)?;
    let module = WasmModule::load_with(
        &bytes,
        VmParams::default(),
        Default::default(),
        None,
        &[],
    );

    if json {
        let imports_json: Vec<_> = imports
            .iter()
            .map(|i| {
                serde_json::json!({
                    "module": i.module,
                    "name": i.name,
                    "kind": format!("{:?}", i.kind).to_lowercase(),
                    "params": i.signature.as_ref().map(types_of).unwrap_or_default(),
                    "results": i.signature.as_ref().map(results_of).unwrap_or_default(),
                })
            })
            .collect();
        let exports_json: Vec<_> = module
            .as_ref()
            .map(|m| {
                m.exports()
                    .iter()
                    .map(|e| {
                        serde_json::json!({
                            "name": e.name,
                            "kind": format!("{:?}", e.kind).to_lowercase(),
                            "params": e.signature.as_ref().map(types_of).unwrap_or_default(),
                            "results": e.signature.as_ref().map(results_of).unwrap_or_default(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        let doc = serde_json::json!({ "imports": imports_json, "exports": exports_json });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(ExitCode::SUCCESS);
    }

    println!("imports:");
    for i in &imports {
        match &i.signature {
            Some(sig) => println!(
                "  {}.{} : func {:?} -> {:?}",
                i.module, i.name, sig.params, sig.results
            ),
            None => println!("  {}.{} : {:?}", i.module, i.name, i.kind),
        }
    }
    println!("exports:");
    if let Ok(module) = &module {
        for e in module.exports() {
            match &e.signature {
                Some(sig) => {
                    println!("  {} : func {:?} -> {:?}", e.name, sig.params, sig.results)
                }
                None => println!("  {} : {:?}", e.name, e.kind),
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn types_of(sig: &reef_vm::module::Signature) -> Vec<String> {
    sig.params.iter().map(|t| t.to_string()).collect()
}

fn results_of(sig: &reef_vm::module::Signature) -> Vec<String> {
    sig.results.iter().map(|t| t.to_string()).collect()
}

fn validate(path: &Path) -> anyhow::Result<ExitCode> {
    let bytes = read_module(path)?;
    runtime::validate_bytes(&bytes)?;
    println!("{}: ok", path.display());
    Ok(ExitCode::SUCCESS)
}

const FEATURES: &[&str] = &[
    "bulk-memory",
    "custom-page-sizes",
    "exception-handling",
    "function-references",
    "gc",
    "memory64",
    "multi-memory",
    "multi-value",
    "mutable-globals",
    "nontrapping-float-to-int",
    "reference-types",
    "sign-extension",
    "simd",
    "tail-call",
    "threads",
    "wide-arithmetic",
];

fn features(json: bool) {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({ "features": FEATURES }))
                .expect("static document")
        );
    } else {
        for feature in FEATURES {
            println!("{feature}");
        }
    }
}
