//! Engine configuration types.

/// Policy for guest syscalls with no registered handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnknownSyscall {
    /// Return -ENOSYS to the guest and continue.
    #[default]
    Enosys,
    /// Abort the run with a diagnostic.
    Fatal,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Code cache capacity in bytes.
    pub cache_size: usize,
    /// Maximum original instructions per translated block.
    pub max_block_insns: usize,
    /// Replace dispatcher exits with direct cache-to-cache branches when the
    /// successor is materialized and no runtime callback interposes.
    pub trace_linking: bool,
    /// Route block exits through shared stub regions instead of emitting a
    /// full context-switch sequence at every tail.
    pub stub_regions: bool,
    /// Instruction cadence at which a fresh stub region is planted.
    pub stub_interval_insns: usize,
    /// What to do with guest syscalls that have no handler.
    pub unknown_syscall: UnknownSyscall,
    /// Log every materialized block at debug level.
    pub dump_blocks: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_size: 4 * 1024 * 1024,
            max_block_insns: 128,
            trace_linking: false,
            stub_regions: false,
            stub_interval_insns: 1024,
            unknown_syscall: UnknownSyscall::Enosys,
            dump_blocks: false,
        }
    }
}
