//! Callback registry.
//!
//! Exactly one callback per (scope, phase, mode) triple, plus per-mnemonic
//! and per-group instruction registrations. ALLOCATOR-mode callbacks fire
//! once per materialization; RUNTIME-mode callbacks fire on every dynamic
//! execution via the dispatcher, and their presence suppresses trace
//! linking and forces block segmentation at targeted instructions.

use crate::cache::block::BlockDescriptor;
use crate::engine::context::GuestContext;
use crate::riscv::Mnemonic;
use std::collections::HashMap;

/// Callback position relative to its scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Pre,
    Post,
}

/// When a callback runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Once, while the allocator materializes the block or instruction.
    Allocator,
    /// On every execution, from the dispatcher.
    Runtime,
}

impl Phase {
    fn idx(self) -> usize {
        match self {
            Phase::Pre => 0,
            Phase::Post => 1,
        }
    }
}

impl Mode {
    fn idx(self) -> usize {
        match self {
            Mode::Allocator => 0,
            Mode::Runtime => 1,
        }
    }
}

/// Per-instruction view handed to instruction-scope callbacks.
#[derive(Debug, Clone, Copy)]
pub struct InsnInfo {
    pub addr: u64,
    pub raw: u32,
    pub mnemonic: Mnemonic,
    /// Start of the enclosing logical basic block, stable across
    /// segmentation cuts.
    pub basic_block_addr: u64,
    pub group: Option<u32>,
}

pub type ExitCallback = Box<dyn FnMut(&mut GuestContext)>;
pub type BlockCallback = Box<dyn FnMut(&mut GuestContext, &BlockDescriptor)>;
pub type InsnCallback = Box<dyn FnMut(&mut GuestContext, &InsnInfo)>;

#[derive(Default)]
pub struct CallbackRegistry {
    exit: [[Option<ExitCallback>; 2]; 2],
    block: [[Option<BlockCallback>; 2]; 2],
    insn: [[Option<InsnCallback>; 2]; 2],
    by_type: HashMap<(Mnemonic, Phase, Mode), InsnCallback>,
    by_group: HashMap<(u32, Phase, Mode), InsnCallback>,
    runtime_count: usize,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_exit(&mut self, phase: Phase, mode: Mode, cb: ExitCallback) {
        self.bump(mode, self.exit[phase.idx()][mode.idx()].is_some());
        self.exit[phase.idx()][mode.idx()] = Some(cb);
    }

    pub fn set_block(&mut self, phase: Phase, mode: Mode, cb: BlockCallback) {
        self.bump(mode, self.block[phase.idx()][mode.idx()].is_some());
        self.block[phase.idx()][mode.idx()] = Some(cb);
    }

    pub fn set_insn(&mut self, phase: Phase, mode: Mode, cb: InsnCallback) {
        self.bump(mode, self.insn[phase.idx()][mode.idx()].is_some());
        self.insn[phase.idx()][mode.idx()] = Some(cb);
    }

    pub fn set_insn_type(&mut self, mnemonic: Mnemonic, phase: Phase, mode: Mode, cb: InsnCallback) {
        let replaced = self
            .by_type
            .insert((mnemonic, phase, mode), cb)
            .is_some();
        self.bump(mode, replaced);
    }

    pub fn set_insn_group(&mut self, group: u32, phase: Phase, mode: Mode, cb: InsnCallback) {
        let replaced = self.by_group.insert((group, phase, mode), cb).is_some();
        self.bump(mode, replaced);
    }

    fn bump(&mut self, mode: Mode, replaced: bool) {
        if mode == Mode::Runtime && !replaced {
            self.runtime_count += 1;
        }
    }

    /// Any RUNTIME-mode callback registered? Trace linking must stay off
    /// while this holds, since links bypass the dispatcher.
    pub fn has_runtime(&self) -> bool {
        self.runtime_count > 0
    }

    pub fn exit_mut(&mut self, phase: Phase, mode: Mode) -> Option<&mut ExitCallback> {
        self.exit[phase.idx()][mode.idx()].as_mut()
    }

    pub fn block_mut(&mut self, phase: Phase, mode: Mode) -> Option<&mut BlockCallback> {
        self.block[phase.idx()][mode.idx()].as_mut()
    }

    pub fn insn_mut(&mut self, phase: Phase, mode: Mode) -> Option<&mut InsnCallback> {
        self.insn[phase.idx()][mode.idx()].as_mut()
    }

    pub fn insn_type_mut(
        &mut self,
        mnemonic: Mnemonic,
        phase: Phase,
        mode: Mode,
    ) -> Option<&mut InsnCallback> {
        self.by_type.get_mut(&(mnemonic, phase, mode))
    }

    pub fn insn_group_mut(
        &mut self,
        group: u32,
        phase: Phase,
        mode: Mode,
    ) -> Option<&mut InsnCallback> {
        self.by_group.get_mut(&(group, phase, mode))
    }

    /// Does a RUNTIME instruction-scope callback target this instruction at
    /// the given phase? Drives block segmentation in the allocator.
    pub fn runtime_targets(&self, mnemonic: Mnemonic, group: Option<u32>, phase: Phase) -> bool {
        if self.insn[phase.idx()][Mode::Runtime.idx()].is_some() {
            return true;
        }
        if self.by_type.contains_key(&(mnemonic, phase, Mode::Runtime)) {
            return true;
        }
        if let Some(g) = group {
            if self.by_group.contains_key(&(g, phase, Mode::Runtime)) {
                return true;
            }
        }
        false
    }

    /// Run every matching instruction-scope callback of the given phase and
    /// mode for one instruction.
    pub fn fire_insn(
        &mut self,
        ctx: &mut GuestContext,
        info: &InsnInfo,
        phase: Phase,
        mode: Mode,
    ) {
        if let Some(cb) = self.insn[phase.idx()][mode.idx()].as_mut() {
            cb(ctx, info);
        }
        if let Some(cb) = self.by_type.get_mut(&(info.mnemonic, phase, mode)) {
            cb(ctx, info);
        }
        if let Some(g) = info.group {
            if let Some(cb) = self.by_group.get_mut(&(g, phase, mode)) {
                cb(ctx, info);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_single_slot_per_triple() {
        let mut reg = CallbackRegistry::new();
        let hits = Rc::new(Cell::new(0u32));
        let h = hits.clone();
        reg.set_block(Phase::Post, Mode::Runtime, Box::new(move |_, _| h.set(h.get() + 1)));
        // Re-registering replaces the slot and keeps the runtime count sane.
        let h = hits.clone();
        reg.set_block(Phase::Post, Mode::Runtime, Box::new(move |_, _| h.set(h.get() + 10)));
        assert!(reg.has_runtime());

        let mut ctx = GuestContext::new();
        let desc = crate::cache::block::BlockDescriptor {
            first_addr: 0,
            last_addr: 0,
            basic_block_addr: 0,
            cache_start: 0,
            cache_end: 4,
            insn_count: 1,
            terminator: crate::cache::block::TerminatorKind::DirectJump,
            first_raw: 0,
            last_raw: 0,
            taken_target: None,
            fall_through: None,
            ecall_next: None,
            entered_by_branch: false,
        };
        if let Some(cb) = reg.block_mut(Phase::Post, Mode::Runtime) {
            cb(&mut ctx, &desc);
        }
        assert_eq!(hits.get(), 10);
    }

    #[test]
    fn test_runtime_targets() {
        let mut reg = CallbackRegistry::new();
        assert!(!reg.runtime_targets(Mnemonic::Add, None, Phase::Post));
        reg.set_insn_type(Mnemonic::Add, Phase::Post, Mode::Runtime, Box::new(|_, _| {}));
        assert!(reg.runtime_targets(Mnemonic::Add, None, Phase::Post));
        assert!(!reg.runtime_targets(Mnemonic::Sub, None, Phase::Post));
        reg.set_insn_group(7, Phase::Pre, Mode::Runtime, Box::new(|_, _| {}));
        assert!(reg.runtime_targets(Mnemonic::Sub, Some(7), Phase::Pre));
    }

    #[test]
    fn test_allocator_mode_does_not_mark_runtime() {
        let mut reg = CallbackRegistry::new();
        reg.set_block(Phase::Pre, Mode::Allocator, Box::new(|_, _| {}));
        assert!(!reg.has_runtime());
    }
}
