use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;

use wasmslice::analysis::summary::Summaries;
use wasmslice::ir::{Label, Section};
use wasmslice::{annotate, build_cfgs, parser::parse_wasm, slice_function, AnalysisOptions};

/// wasmslice — static analysis and backward slicing for WebAssembly.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Input WebAssembly binary (.wasm)
    input: PathBuf,

    #[command(subcommand)]
    command: Command,

    /// Do not propagate locals through local.get/set/tee
    #[arg(long)]
    no_propagate_locals: bool,

    /// Do not propagate globals through global.get/set
    #[arg(long)]
    no_propagate_globals: bool,

    /// Name constants with fresh variables instead of constant vars
    #[arg(long)]
    no_use_const: bool,

    /// Slicer keeps whole blocks as soon as one instruction is kept
    #[arg(long)]
    keep_entire_blocks: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Dump annotated control-flow graphs as graphviz dot
    Cfg {
        /// Only this function index (default: all)
        #[arg(long)]
        function: Option<u32>,

        /// Output directory for the .dot files (default: stdout)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Backward slice of one instruction, printed as a dot graph
    Slice {
        /// Function index in the module's function space
        #[arg(long)]
        function: u32,

        /// Label id of the criterion instruction within the function body
        #[arg(long)]
        instruction: u32,

        /// Output file (default: stdout)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let options = AnalysisOptions {
        propagate_locals: !cli.no_propagate_locals,
        propagate_globals: !cli.no_propagate_globals,
        use_const: !cli.no_use_const,
        keep_entire_blocks: cli.keep_entire_blocks,
    };

    let wasm_bytes = fs::read(&cli.input)
        .with_context(|| format!("failed to read {}", cli.input.display()))?;
    let module = parse_wasm(&wasm_bytes).context("failed to parse WebAssembly module")?;
    let cfgs = build_cfgs(&module).context("failed to build CFGs")?;
    if cfgs.is_empty() {
        bail!("module contains no local functions");
    }
    let summaries = Summaries::new();

    match cli.command {
        Command::Cfg { function, output } => {
            for cfg in &cfgs {
                if function.is_some_and(|f| f != cfg.func_idx) {
                    continue;
                }
                let annotated = annotate(cfg, &options, &summaries)
                    .with_context(|| format!("annotating function {}", cfg.func_idx))?;
                let dot = annotated.to_dot(|spec| Some(spec.to_string()));
                match &output {
                    Some(dir) => {
                        let path = dir.join(format!("{}_{}.dot", cfg.name, cfg.func_idx));
                        fs::write(&path, dot)
                            .with_context(|| format!("failed to write {}", path.display()))?;
                        eprintln!("wasmslice: wrote {}", path.display());
                    }
                    None => print!("{}", dot),
                }
            }
        }
        Command::Slice {
            function,
            instruction,
            output,
        } => {
            let cfg = cfgs
                .iter()
                .find(|c| c.func_idx == function)
                .with_context(|| format!("no local function with index {}", function))?;
            let criterion = Label {
                section: Section::Function,
                id: instruction,
            };
            let annotated = annotate(cfg, &options, &summaries)
                .with_context(|| format!("annotating function {}", function))?;
            let sliced = slice_function(&annotated, criterion, &options, &summaries)?;
            let dot = sliced.to_dot(|_| None);
            match output {
                Some(path) => {
                    fs::write(&path, dot)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    eprintln!("wasmslice: wrote {}", path.display());
                }
                None => print!("{}", dot),
            }
        }
    }

    Ok(())
}
