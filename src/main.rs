use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use loxbc::{LoxError, Vm};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "loxbc")]
#[command(about = "A bytecode compiler and virtual machine for Lox")]
#[command(version)]
struct Cli {
    /// Script to run. Starts a REPL when omitted.
    script: Option<PathBuf>,
}

// Exit codes, following sysexits.h.
const EX_DATAERR: u8 = 65;
const EX_SOFTWARE: u8 = 70;
const EX_IOERR: u8 = 74;

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.script {
        Some(path) => run_file(&path),
        None => repl(),
    }
}

fn repl() -> ExitCode {
    let mut vm = Vm::new();
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        if io::stdout().flush().is_err() {
            return ExitCode::from(EX_IOERR);
        }
        match lines.next() {
            Some(Ok(line)) => {
                // Compile and runtime errors are reported and the session carries on.
                if let Err(e) = vm.interpret(&line) {
                    report(&e);
                    if e.is_fatal() {
                        return ExitCode::from(EX_SOFTWARE);
                    }
                }
            }
            Some(Err(e)) => {
                eprintln!("{}", e);
                return ExitCode::from(EX_IOERR);
            }
            None => {
                println!();
                return ExitCode::SUCCESS;
            }
        }
    }
}

fn run_file(path: &Path) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Could not read file \"{}\": {}", path.display(), e);
            return ExitCode::from(EX_IOERR);
        }
    };
    let mut vm = Vm::new();
    match vm.interpret(&source) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report(&e);
            match e {
                LoxError::CompileError(_) => ExitCode::from(EX_DATAERR),
                LoxError::RuntimeError(_) | LoxError::InternalError(_) => {
                    ExitCode::from(EX_SOFTWARE)
                }
            }
        }
    }
}

fn report(error: &LoxError) {
    eprintln!("{}", error);
}
