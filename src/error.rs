//! Engine error type.

/// Error type for engine operations.
///
/// Recoverable conditions (link range overflow, stub insertion, first cache
/// exhaustion) are handled inside the engine and never surface here; these
/// variants are the fatal ones, plus the load-time validation failures.
#[derive(Debug)]
pub enum EngineError {
    /// The target file could not be read.
    TargetRead(std::io::Error),
    /// The target is not a static 64-bit RISC-V ELF executable.
    InvalidTarget(String),
    /// The decoder met an encoding it does not know, at the given guest PC.
    UnknownOpcode { pc: u64, raw: u32 },
    /// The code cache region could not be mapped.
    CacheMap { errno: i32 },
    /// A block did not fit even after a cache flush.
    CacheExhausted { pc: u64, need: usize, capacity: usize },
    /// Guest address space could not be reserved (segment clash, mmap failure).
    GuestMap { vaddr: u64, errno: i32 },
    /// The guest executed an instruction that faults (EBREAK, unaligned jump).
    GuestFault { pc: u64, symbol: Option<String>, what: &'static str },
    /// A syscall number with no handler, under the `Fatal` policy.
    UnhandledSyscall { number: u64, pc: u64 },
    /// Guest execution requires a riscv64 host.
    UnsupportedHost,
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::TargetRead(e) => write!(f, "could not read target: {}", e),
            EngineError::InvalidTarget(why) => write!(f, "invalid target: {}", why),
            EngineError::UnknownOpcode { pc, raw } => {
                write!(f, "unknown opcode {:#010x} at guest pc {:#x}", raw, pc)
            }
            EngineError::CacheMap { errno } => {
                write!(f, "could not map code cache (errno {})", errno)
            }
            EngineError::CacheExhausted { pc, need, capacity } => write!(
                f,
                "code cache exhausted translating guest pc {:#x} ({} bytes needed, capacity {})",
                pc, need, capacity
            ),
            EngineError::GuestMap { vaddr, errno } => {
                write!(f, "could not map guest segment at {:#x} (errno {})", vaddr, errno)
            }
            EngineError::GuestFault { pc, symbol, what } => match symbol {
                Some(sym) => write!(f, "guest fault: {} at pc {:#x} ({})", what, pc, sym),
                None => write!(f, "guest fault: {} at pc {:#x}", what, pc),
            },
            EngineError::UnhandledSyscall { number, pc } => {
                write!(f, "unhandled guest syscall {} at pc {:#x}", number, pc)
            }
            EngineError::UnsupportedHost => {
                write!(f, "guest execution requires a riscv64 host")
            }
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::TargetRead(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::TargetRead(e)
    }
}
