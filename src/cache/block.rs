//! Cached block descriptors and the basic-block table.

use std::collections::HashMap;

pub type BlockId = usize;

/// Why a translated block ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminatorKind {
    /// Conditional branch with taken and fall-through arms.
    Branch,
    /// JAL / C.J with a statically known target.
    DirectJump,
    /// JALR / C.JR / C.JALR; target resolved at run time.
    IndirectJump,
    /// ECALL; the dispatcher routes through the syscall shim.
    Syscall,
    /// Cut for a non-control reason (instrumented instruction, length cap).
    Segmented,
}

/// Descriptor of one materialized block. Immutable once inserted.
#[derive(Debug, Clone)]
pub struct BlockDescriptor {
    /// Guest address of the first original instruction.
    pub first_addr: u64,
    /// Guest address of the last original instruction.
    pub last_addr: u64,
    /// Start of the enclosing logical basic block; differs from
    /// `first_addr` only for segmented continuations, and keeps
    /// per-instruction attribution stable across cuts.
    pub basic_block_addr: u64,
    /// Translated bytes occupy `[cache_start, cache_end)`.
    pub cache_start: usize,
    pub cache_end: usize,
    /// Original instruction count.
    pub insn_count: usize,
    pub terminator: TerminatorKind,
    /// Raw encodings of the first and last original instructions.
    pub first_raw: u32,
    pub last_raw: u32,
    /// Branch/direct-jump target, when statically known.
    pub taken_target: Option<u64>,
    /// Next sequential guest address (branch fall-through, segment resume).
    pub fall_through: Option<u64>,
    /// Resume address after a syscall terminator.
    pub ecall_next: Option<u64>,
    /// First entry into this block came through a taken branch arm.
    pub entered_by_branch: bool,
}

/// Basic-block table: guest address of a block's first instruction to its
/// descriptor. Descriptors live in a pooled arena; ids are arena indices.
#[derive(Default)]
pub struct BlockTable {
    arena: Vec<BlockDescriptor>,
    by_addr: HashMap<u64, BlockId>,
}

impl BlockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, guest_addr: u64) -> Option<BlockId> {
        self.by_addr.get(&guest_addr).copied()
    }

    /// Id the next inserted descriptor will get; exit sites reference their
    /// block before the descriptor is complete.
    pub fn next_id(&self) -> BlockId {
        self.arena.len()
    }

    pub fn get(&self, id: BlockId) -> &BlockDescriptor {
        &self.arena[id]
    }

    /// Insert a freshly materialized block. The address must not already be
    /// present; materialization is idempotent at the caller via `lookup`.
    pub fn insert(&mut self, desc: BlockDescriptor) -> BlockId {
        debug_assert!(desc.cache_start < desc.cache_end);
        let id = self.arena.len();
        let prev = self.by_addr.insert(desc.first_addr, id);
        debug_assert!(prev.is_none(), "duplicate block at {:#x}", desc.first_addr);
        self.arena.push(desc);
        id
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Drop everything; cache flush invalidates all descriptors.
    pub fn clear(&mut self) {
        self.arena.clear();
        self.by_addr.clear();
    }
}
