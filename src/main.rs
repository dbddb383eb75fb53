use clap::{Parser, Subcommand};
use graft::{Engine, EngineConfig, EngineError, UnknownSyscall};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "graft")]
#[command(about = "Dynamic binary instrumentation for RV64GC binaries", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a guest binary under the engine
    Run {
        /// The RISC-V ELF executable to run
        file: PathBuf,
        /// Arguments passed through to the guest
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
        /// Replace dispatcher exits with direct cache-to-cache branches
        #[arg(long)]
        trace_linking: bool,
        /// Share context-switch stubs between blocks
        #[arg(long)]
        stub_regions: bool,
        /// Log each materialized block
        #[arg(long)]
        dump_blocks: bool,
        /// Code cache capacity in bytes
        #[arg(long, default_value_t = 4 * 1024 * 1024)]
        cache_size: usize,
        /// Abort on guest syscalls without a handler
        #[arg(long)]
        strict_syscalls: bool,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            args,
            trace_linking,
            stub_regions,
            dump_blocks,
            cache_size,
            strict_syscalls,
        } => {
            let config = EngineConfig {
                cache_size,
                trace_linking,
                stub_regions,
                dump_blocks,
                unknown_syscall: if strict_syscalls {
                    UnknownSyscall::Fatal
                } else {
                    UnknownSyscall::Enosys
                },
                ..EngineConfig::default()
            };
            match run_guest(&file, &args, config) {
                Ok(code) => ExitCode::from(code as u8),
                Err(e) => {
                    eprintln!("graft: {}", e);
                    ExitCode::from(error_code(&e))
                }
            }
        }
    }
}

fn run_guest(file: &PathBuf, args: &[String], config: EngineConfig) -> Result<i32, EngineError> {
    let mut engine = Engine::new(file, config)?;
    engine.set_guest_args(args);
    engine.run()
}

/// Engine failures get distinct exit codes so scripts can tell them from
/// guest exit statuses.
fn error_code(e: &EngineError) -> u8 {
    match e {
        EngineError::TargetRead(_) | EngineError::InvalidTarget(_) => 2,
        EngineError::UnsupportedHost => 4,
        _ => 3,
    }
}
