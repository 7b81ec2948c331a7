//! Thin host binary for `cscript`: runs a compiled `.cso` bytecode container
//! or dumps its metadata. There is no text front end in this workspace
//! (lexing/parsing a `.cs` source file into an AST is out of scope for the
//! `cscript` crate) — this binary is the "run already-compiled bytecode"
//! half of a host, grounded on `monty-cli`'s read-file-then-run shape, and
//! exists to exercise the engine end to end rather than to be a full
//! toolchain entry point.

use std::fs;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cscript::format::load_dso;
use cscript::resource::ResourceLimits;
use cscript::vm::VmConfig;
use cscript::{Outcome, Vm};

#[derive(Parser)]
#[command(name = "cscript", about = "Run or inspect cscript .cso bytecode containers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load a `.cso` file and run it to completion on a fresh fiber.
    Run {
        path: String,
        /// Emit a tracing span per dispatched opcode.
        #[arg(long)]
        trace: bool,
        /// Cap the run to this many dispatched opcodes.
        #[arg(long)]
        max_steps: Option<u64>,
        /// Cap simultaneously active packages.
        #[arg(long)]
        max_packages: Option<usize>,
    },
    /// Load a `.cso` file and print its bytecode/constant-pool sizes.
    DumpDso { path: String },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run { path, trace, max_steps, max_packages } => run(&path, trace, max_steps, max_packages),
        Command::DumpDso { path } => dump_dso(&path),
    }
}

fn run(path: &str, trace: bool, max_steps: Option<u64>, max_packages: Option<usize>) -> ExitCode {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("error reading {path}: {err}");
            return ExitCode::FAILURE;
        }
    };
    let codeblock = match load_dso(&bytes) {
        Ok(cb) => cb,
        Err(err) => {
            eprintln!("error loading {path}: {err}");
            return ExitCode::FAILURE;
        }
    };

    let limits = max_steps.map(|max_steps| ResourceLimits { max_steps, ..ResourceLimits::default() });
    let mut vm = Vm::new(VmConfig { trace, limits, max_active_packages: max_packages });

    let fiber = vm.spawn_fiber();
    let scope_name = vm.interns.intern(&codeblock.file_name, true);
    let ns = vm.dispatch.find(scope_name.clone(), None);
    match vm.exec_codeblock(fiber, std::rc::Rc::new(codeblock), 0, scope_name, ns, &[]) {
        Outcome::Return(value) => {
            println!("-> {}", vm.display_value(&value));
            ExitCode::SUCCESS
        }
        Outcome::Yielded(value) => {
            println!("yielded -> {}", vm.display_value(&value));
            ExitCode::SUCCESS
        }
        Outcome::Faulted(fault) => {
            eprintln!("fault: {fault}");
            ExitCode::FAILURE
        }
    }
}

fn dump_dso(path: &str) -> ExitCode {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("error reading {path}: {err}");
            return ExitCode::FAILURE;
        }
    };
    match load_dso(&bytes) {
        Ok(cb) => {
            println!("file: {}", cb.file_name);
            println!("code bytes: {}", cb.code.len());
            println!("global strings: {}", cb.global_strings.len());
            println!("function strings: {}", cb.function_strings.len());
            println!("global floats: {}", cb.global_floats.len());
            println!("function floats: {}", cb.function_floats.len());
            println!("line entries: {}", cb.line_breaks.len());
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
