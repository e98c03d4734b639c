use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use rill_core::loader;
use rillvm::dap::{stdio_channel, DapHandler, DapSession};
use rillvm::{ProgramImage, Vm};

#[derive(Parser, Debug)]
#[command(name = "rillvm", about = "Rill VM bytecode interpreter")]
struct Args {
    /// Path to the .vmbc bytecode file to execute.
    file: PathBuf,

    /// Enable instruction-level dispatch tracing.
    #[arg(long)]
    verbose: bool,

    /// Serve the Debug Adapter Protocol on stdio instead of executing
    /// immediately.
    #[arg(long)]
    dap: bool,
}

fn init_tracing(args: &Args) {
    let default_filter = if args.verbose {
        "info,rillvm=trace,rill_core=trace"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    // In DAP mode stdout carries protocol frames; diagnostics go to stderr
    // either way.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    let program = loader::load_file(&args.file)
        .with_context(|| format!("failed to load bytecode from {}", args.file.display()))?;
    tracing::debug!(
        instructions = program.instructions.len(),
        constants = program.constants.len(),
        entry_point = program.entry_point,
        "bytecode loaded"
    );

    let mut vm = Vm::new();
    if args.dap {
        if let Some(info) = program.debug_info.clone() {
            vm.debug().state.lock().set_debug_info(info);
        }
        let (mut reader, writer) = stdio_channel();
        let session = DapSession::new(Box::new(writer));
        let mut handler = DapHandler::new(&vm, session);
        handler.set_program(
            ProgramImage::from_loaded(&program),
            program.entry_point,
            program.global_count,
        );
        handler.run(&mut reader);
        return Ok(());
    }

    vm.run_loaded(&program)?;
    Ok(())
}
