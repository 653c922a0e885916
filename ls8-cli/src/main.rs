use std::path::PathBuf;
use std::process::ExitCode;

use ls8::{Config, Cpu, LoadError, Mode, Sink, Trace};

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, error, info};

/// LS-8 runner
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Program image to load and execute
    program: PathBuf,

    /// Whether to reproduce the quirks of the reference machine
    #[clap(long, value_enum, default_value_t = Mode::Reference)]
    mode: Mode,

    /// Print a state dump before every instruction
    #[clap(long)]
    trace: bool,
}

/// Sink which prints to the terminal
///
/// `PRN` output goes to `stdout`; state dumps go to `stderr`.
struct Console;

impl Sink for Console {
    fn print(&mut self, value: u8) {
        println!("{value}");
    }
    fn trace(&mut self, trace: &Trace) {
        eprintln!("{trace}");
    }
}

fn run(args: &Args) -> Result<()> {
    let image = ls8::program::load_file(&args.program)?;
    for (addr, line) in ls8::disassemble(&image) {
        debug!("{addr:02x}  {line}");
    }

    let mut cpu = Cpu::new(Config {
        mode: args.mode,
        trace: args.trace,
    });
    cpu.load(&image)
        .with_context(|| format!("failed to load {:?}", args.program))?;

    info!("running {:?}", args.program);
    let start = std::time::Instant::now();
    cpu.run(&mut Console)?;
    info!("halted after {:?}", start.elapsed());
    Ok(())
}

/// Picks the process exit code for an error
fn exit_code(e: &anyhow::Error) -> u8 {
    if let Some(e) = e.downcast_ref::<ls8::Error>() {
        e.exit_code()
    } else if let Some(e) = e.downcast_ref::<LoadError>() {
        e.exit_code()
    } else {
        // Anything else happened while getting the program off the disk
        ls8::exit::LOAD
    }
}

fn main() -> ExitCode {
    let env = env_logger::Env::default()
        .filter_or("LS8_LOG", "info")
        .write_style_or("LS8_LOG", "always");
    env_logger::init_from_env(env);

    let args = Args::parse();
    match run(&args) {
        Ok(()) => {
            info!("shutting down");
            ExitCode::from(ls8::exit::HALT)
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exit_codes() {
        let e =
            anyhow::Error::from(ls8::Error::StackOverflow { sp: 5, end: 5 });
        assert_eq!(exit_code(&e), ls8::exit::STACK_OVERFLOW);

        let e = anyhow::Error::from(LoadError::TooLarge(300))
            .context("failed to load");
        assert_eq!(exit_code(&e), ls8::exit::LOAD);

        let e = anyhow::Error::from(ls8::Error::UnhandledInstruction {
            opcode: 0xFF,
            pc: 0,
        })
        .context("while running");
        assert_eq!(exit_code(&e), ls8::exit::UNKNOWN_INSTRUCTION);
    }

    #[test]
    fn args() {
        let args = Args::try_parse_from(["ls8", "prog.ls8"]).unwrap();
        assert_eq!(args.mode, Mode::Reference);
        assert!(!args.trace);

        let args =
            Args::try_parse_from(["ls8", "--mode", "strict", "--trace", "p"])
                .unwrap();
        assert_eq!(args.mode, Mode::Strict);
        assert!(args.trace);
    }
}
