//! The block allocator.
//!
//! Given a guest address, scans `.text` to the next terminator, then emits
//! the translated block into the code cache: inline instrumentation at the
//! woven positions, transparency fixups for PC-relative and link-producing
//! instructions, the x4/x31 virtualization rewrites, and a context-switch
//! exit sequence (or a direct trace link) per control-flow arm.
//!
//! Emitted-code contract (shared with `engine::context`): `tp` is the
//! context base, x31 is dead at block boundaries, and the guest's x4/x31
//! live in their context slots.

use crate::cache::block::{BlockDescriptor, BlockId, BlockTable, TerminatorKind};
use crate::cache::link::{ExitKind, ExitToken, LinkTable};
use crate::cache::CodeCache;
use crate::callbacks::{CallbackRegistry, InsnInfo, Mode, Phase};
use crate::config::EngineConfig;
use crate::elf::GuestImage;
use crate::engine::context::{self, GuestContext};
use crate::engine::EngineStats;
use crate::error::EngineError;
use crate::inline::InlineWeaver;
use crate::riscv::{decode, encode, reg, Insn, Mnemonic};
use std::collections::HashMap;

/// Worst-case translated bytes for one instruction (li64 expansion plus the
/// full stand-in spill dance).
const WORST_INSN_BYTES: usize = 64;
/// Worst-case bytes for the whole terminator construct: branch word, two
/// exit sequences with arm restores, and a JAL link writeback.
const WORST_TERM_BYTES: usize = 160;
/// A planted stub region: store token, load handler, jump.
const STUB_BYTES: usize = 12;
/// Keep every block tail within JAL reach of its stub, with slack for the
/// worst-case block laid down after the check.
const STUB_REACH_BYTES: i64 = (1 << 20) - (16 * 1024);

const SPECIAL_MASK: u32 = (1 << reg::TP) | (1 << reg::T6);

/// Outcome of a materialization attempt.
pub enum Materialize {
    Done(BlockId),
    /// Not enough cache room; recoverable by a flush.
    NeedFlush { need: usize },
}

/// Stub-region planting state, reset on cache flush.
#[derive(Default)]
pub struct StubState {
    last_stub: Option<usize>,
    insns_since_stub: usize,
}

impl StubState {
    pub fn clear(&mut self) {
        self.last_stub = None;
        self.insns_since_stub = 0;
    }
}

enum ScanEnd {
    /// Terminated by a control-flow instruction (the last scanned one).
    Control,
    /// Cut before an instruction with a RUNTIME PRE hook on it.
    SegmentBefore,
    /// Cut after an instruction with a RUNTIME POST hook on it.
    SegmentAfter,
    /// Hit the configured block length cap.
    LengthCap,
}

/// One materialization pass over the engine's shared state. Built fresh by
/// the dispatcher for each block it needs.
pub struct Translator<'a> {
    pub image: &'a GuestImage,
    pub config: &'a EngineConfig,
    pub cache: &'a mut CodeCache,
    pub blocks: &'a mut BlockTable,
    pub links: &'a mut LinkTable,
    pub weaver: &'a InlineWeaver,
    pub callbacks: &'a mut CallbackRegistry,
    pub groups: &'a HashMap<Mnemonic, u32>,
    pub ctx: &'a mut GuestContext,
    pub stub: &'a mut StubState,
    pub stats: &'a mut EngineStats,
}

impl Translator<'_> {
    /// Materialize the block starting at `addr`. Idempotent: an existing
    /// BBT entry is returned untouched. `logical_start` carries the
    /// enclosing logical block for segmented continuations.
    pub fn materialize(
        &mut self,
        addr: u64,
        entered_by_branch: bool,
        logical_start: Option<u64>,
    ) -> Result<Materialize, EngineError> {
        if let Some(id) = self.blocks.lookup(addr) {
            return Ok(Materialize::Done(id));
        }

        let (insns, end) = self.scan(addr)?;

        let need = self.weaver.reserve_bytes(insns.len())
            + insns.len() * WORST_INSN_BYTES
            + WORST_TERM_BYTES
            + STUB_BYTES;
        if need > self.cache.capacity() {
            return Err(EngineError::CacheExhausted {
                pc: addr,
                need,
                capacity: self.cache.capacity(),
            });
        }
        if need > self.cache.remaining() {
            return Ok(Materialize::NeedFlush { need });
        }

        if self.config.stub_regions {
            self.ensure_stub(insns.len());
        }

        let entry_off = self.cache.cursor();
        let block_id = self.blocks.next_id();
        let basic_block_addr = logical_start.unwrap_or(addr);
        let (first_addr, first_insn) = insns[0];
        let (last_addr, last_insn) = *insns.last().expect("scan yields at least one insn");

        let (terminator, taken_target, fall_through, ecall_next) =
            classify(&end, last_addr, &last_insn);

        let mut desc = BlockDescriptor {
            first_addr,
            last_addr,
            basic_block_addr,
            cache_start: entry_off,
            cache_end: entry_off,
            insn_count: insns.len(),
            terminator,
            first_raw: first_insn.raw,
            last_raw: last_insn.raw,
            taken_target,
            fall_through,
            ecall_next,
            entered_by_branch,
        };

        if let Some(cb) = self.callbacks.block_mut(Phase::Pre, Mode::Allocator) {
            cb(self.ctx, &desc);
        }

        self.emit_words(self.weaver.block(Phase::Pre).words());

        let is_control = matches!(end, ScanEnd::Control);
        for (i, &(pc, ref insn)) in insns.iter().enumerate() {
            let info = InsnInfo {
                addr: pc,
                raw: insn.raw,
                mnemonic: insn.mnemonic,
                basic_block_addr,
                group: self.groups.get(&insn.mnemonic).copied(),
            };
            let last = i == insns.len() - 1;
            if last && is_control {
                self.emit_words(self.weaver.block(Phase::Post).words());
                self.emit_words(self.weaver.insn(Phase::Pre).words());
                self.callbacks.fire_insn(self.ctx, &info, Phase::Pre, Mode::Allocator);
                self.emit_terminator(block_id, pc, insn);
                self.callbacks.fire_insn(self.ctx, &info, Phase::Post, Mode::Allocator);
            } else {
                self.emit_words(self.weaver.insn(Phase::Pre).words());
                self.callbacks.fire_insn(self.ctx, &info, Phase::Pre, Mode::Allocator);
                self.emit_plain(pc, insn);
                self.callbacks.fire_insn(self.ctx, &info, Phase::Post, Mode::Allocator);
                self.emit_words(self.weaver.insn(Phase::Post).words());
            }
        }

        if !is_control {
            let next = last_addr + last_insn.len as u64;
            self.emit_words(self.weaver.block(Phase::Post).words());
            self.emit_jump_or_exit(block_id, next, ExitKind::Segment(next), &[]);
        }

        desc.cache_end = self.cache.cursor();
        if let Some(cb) = self.callbacks.block_mut(Phase::Post, Mode::Allocator) {
            cb(self.ctx, &desc);
        }

        if self.config.dump_blocks {
            log::debug!(
                "block {:#x}..{:#x} ({} insns, {:?}) at cache [{:#x}, {:#x})",
                desc.first_addr,
                desc.last_addr,
                desc.insn_count,
                desc.terminator,
                desc.cache_start,
                desc.cache_end,
            );
        }

        let id = self.blocks.insert(desc);
        debug_assert_eq!(id, block_id);
        self.links.register_entry(addr, entry_off);
        self.stats.links_installed +=
            self.links.install_links(self.cache, addr, entry_off) as u64;
        self.cache.sync_icache();
        self.stats.blocks_materialized += 1;
        Ok(Materialize::Done(id))
    }

    // ==================== scanning ====================

    fn scan(&self, addr: u64) -> Result<(Vec<(u64, Insn)>, ScanEnd), EngineError> {
        let mut insns = Vec::new();
        let mut pc = addr;
        loop {
            let word = self.image.fetch(pc).ok_or_else(|| EngineError::GuestFault {
                pc,
                symbol: self.image.symbol_at(pc).map(String::from),
                what: "instruction fetch outside .text",
            })?;
            let insn = decode::decode(word);
            if insn.mnemonic == Mnemonic::Unknown {
                return Err(EngineError::UnknownOpcode { pc, raw: insn.raw });
            }
            let group = self.groups.get(&insn.mnemonic).copied();
            if !insns.is_empty() && self.callbacks.runtime_targets(insn.mnemonic, group, Phase::Pre)
            {
                return Ok((insns, ScanEnd::SegmentBefore));
            }
            insns.push((pc, insn));
            if insn.is_terminator() {
                return Ok((insns, ScanEnd::Control));
            }
            if self.callbacks.runtime_targets(insn.mnemonic, group, Phase::Post) {
                return Ok((insns, ScanEnd::SegmentAfter));
            }
            if insns.len() >= self.config.max_block_insns {
                return Ok((insns, ScanEnd::LengthCap));
            }
            pc += insn.len as u64;
        }
    }

    // ==================== plain instruction emission ====================

    fn emit_plain(&mut self, pc: u64, insn: &Insn) {
        // AUIPC must deliver the original PC, not the cache PC.
        if insn.mnemonic == Mnemonic::Auipc {
            let value = (pc as i64).wrapping_add(insn.imm) as u64;
            self.emit_li64_guest(insn.rd.unwrap_or(0), value);
            return;
        }

        if ((insn.xreg_reads() | insn.xreg_writes()) & SPECIAL_MASK) == 0 {
            if insn.len == 2 {
                self.cache.emit_u16(insn.raw as u16);
            } else {
                self.cache.emit_u32(insn.raw);
            }
            return;
        }

        // The instruction touches x4 or x31: rewrite its expanded form to
        // run against the context slots through stand-in registers.
        let reads = insn.xreg_reads();
        let writes = insn.xreg_writes();
        let mut word = insn.base_word();

        let used = field_mask(insn);
        let mut map: Vec<(u8, u8)> = Vec::with_capacity(2);
        if (reads | writes) & (1 << reg::T6) != 0 {
            // x31 stands in for itself; it is dead at boundaries.
            map.push((reg::T6, reg::T6));
        }
        if (reads | writes) & (1 << reg::TP) != 0 {
            let standin = [reg::T5, reg::T4, reg::T3]
                .into_iter()
                .find(|&r| used & (1 << r) == 0)
                .expect("a free stand-in register always exists");
            map.push((reg::TP, standin));
        }

        for &(orig, standin) in &map {
            if standin != reg::T6 {
                self.emit(encode::sd(standin, reg::TP, context::xreg_offset(standin)));
            }
            if reads & (1 << orig) != 0 {
                self.emit(encode::ld(standin, reg::TP, context::xreg_offset(orig)));
            }
        }

        for &(orig, standin) in &map {
            word = patch_fields(word, insn, orig, standin);
        }
        self.emit(word);

        for &(orig, standin) in &map {
            if writes & (1 << orig) != 0 {
                self.emit(encode::sd(standin, reg::TP, context::xreg_offset(orig)));
            }
            if standin != reg::T6 {
                self.emit(encode::ld(standin, reg::TP, context::xreg_offset(standin)));
            }
        }
    }

    /// Materialize `value` into guest register `rd`, honoring the x4/x31
    /// memory residency.
    fn emit_li64_guest(&mut self, rd: u8, value: u64) {
        if rd == 0 {
            return;
        }
        if rd == reg::TP || rd == reg::T6 {
            for w in encode::load_imm64(reg::T6, value) {
                self.emit(w);
            }
            self.emit(encode::sd(reg::T6, reg::TP, context::xreg_offset(rd)));
        } else {
            for w in encode::load_imm64(rd, value) {
                self.emit(w);
            }
        }
    }

    // ==================== terminators ====================

    fn emit_terminator(&mut self, block: BlockId, pc: u64, insn: &Insn) {
        if insn.is_branch() {
            self.emit_branch_term(block, pc, insn);
        } else if insn.is_direct_jump() {
            let target = (pc as i64).wrapping_add(insn.imm) as u64;
            let next = pc + insn.len as u64;
            self.emit_li64_guest(insn.rd.unwrap_or(0), next);
            self.emit_jump_or_exit(block, target, ExitKind::Taken(target), &[]);
        } else if insn.is_indirect_jump() {
            self.emit_jalr_term(block, pc, insn);
        } else if insn.is_syscall() {
            let next = pc + insn.len as u64;
            self.emit_exit(block, ExitKind::Syscall { next }, &[]);
        } else {
            debug_assert!(insn.is_ebreak());
            self.emit_exit(block, ExitKind::Break(pc), &[]);
        }
    }

    fn emit_branch_term(&mut self, block: BlockId, pc: u64, insn: &Insn) {
        let taken = (pc as i64).wrapping_add(insn.imm) as u64;
        let fall = pc + insn.len as u64;
        let mut word = insn.base_word();
        let rs1 = insn.rs1.unwrap_or(0);
        let rs2 = insn.rs2.unwrap_or(0);

        // Branch operands in x4/x31 are loaded into stand-ins up front;
        // spilled stand-ins are restored at the entry of both arms.
        let mut restores: Vec<u8> = Vec::new();
        self.rewrite_branch_operands(&mut word, rs1, rs2, &mut restores);

        let branch_off = self.cache.emit_u32(encode::nop());
        self.emit_jump_or_exit(block, fall, ExitKind::FallThrough(fall), &restores);
        let taken_off = self.cache.cursor();
        let rel = (taken_off - branch_off) as i32;
        self.cache.patch_u32(branch_off, with_branch_offset(word, rel));
        self.emit_jump_or_exit(block, taken, ExitKind::Taken(taken), &restores);
    }

    /// Load branch operands living in x4/x31 into stand-ins and patch the
    /// branch word accordingly. Spilled stand-ins are listed in `restores`.
    fn rewrite_branch_operands(
        &mut self,
        word: &mut u32,
        rs1: u8,
        rs2: u8,
        restores: &mut Vec<u8>,
    ) {
        let mut rs1_standin = None;
        if rs1 == reg::TP || rs1 == reg::T6 {
            self.emit(encode::ld(reg::T6, reg::TP, context::xreg_offset(rs1)));
            *word = encode::patch_rs1(*word, reg::T6);
            rs1_standin = Some(reg::T6);
        }
        if rs2 == reg::TP || rs2 == reg::T6 {
            if rs2 == rs1 {
                *word = encode::patch_rs2(*word, rs1_standin.expect("rs1 already renamed"));
            } else {
                let standin = if rs1_standin.is_none() { reg::T6 } else { reg::T5 };
                if standin != reg::T6 {
                    self.emit(encode::sd(standin, reg::TP, context::xreg_offset(standin)));
                    restores.push(standin);
                }
                self.emit(encode::ld(standin, reg::TP, context::xreg_offset(rs2)));
                *word = encode::patch_rs2(*word, standin);
            }
        }
    }

    fn emit_jalr_term(&mut self, block: BlockId, pc: u64, insn: &Insn) {
        let next = pc + insn.len as u64;
        let rs1 = insn.rs1.unwrap_or(0);
        let rd = insn.rd.unwrap_or(0);

        // Target computed from the old rs1 before any rd writeback.
        if rs1 == reg::TP || rs1 == reg::T6 {
            self.emit(encode::ld(reg::T6, reg::TP, context::xreg_offset(rs1)));
            self.emit(encode::addi(reg::T6, reg::T6, insn.imm as i32));
        } else {
            self.emit(encode::addi(reg::T6, rs1, insn.imm as i32));
        }
        self.emit(encode::andi(reg::T6, reg::T6, -2));
        self.emit(encode::sd(reg::T6, reg::TP, context::INDIRECT_TARGET_OFFSET));

        // Link writeback carries the original return address.
        self.emit_li64_guest(rd, next);

        self.emit_exit(block, ExitKind::Indirect, &[]);
    }

    /// Emit a direct-control exit: a cache-to-cache branch when the target
    /// is already materialized and linking applies, otherwise a context
    /// switch with a backpatch request.
    fn emit_jump_or_exit(&mut self, block: BlockId, target: u64, kind: ExitKind, restores: &[u8]) {
        for &r in restores {
            self.emit(encode::ld(r, reg::TP, context::xreg_offset(r)));
        }
        if self.can_link() {
            if let Some(target_off) = self.links.entry(target) {
                let rel = target_off as i64 - self.cache.cursor() as i64;
                if encode::jal_in_range(rel) {
                    let token = self.links.new_site(block, kind, self.cache.cursor());
                    self.links.mark_linked(token);
                    self.emit(encode::jal(reg::ZERO, rel as i32));
                    self.stats.links_installed += 1;
                    return;
                }
            }
        }
        let token = self.emit_exit_tail(block, kind);
        if self.can_link() {
            self.links.request_link(target, token);
        }
    }

    /// Emit a context-switch exit after arm restores have been handled.
    fn emit_exit(&mut self, block: BlockId, kind: ExitKind, restores: &[u8]) -> ExitToken {
        for &r in restores {
            self.emit(encode::ld(r, reg::TP, context::xreg_offset(r)));
        }
        self.emit_exit_tail(block, kind)
    }

    fn emit_exit_tail(&mut self, block: BlockId, kind: ExitKind) -> ExitToken {
        if let Some(cb) = self.callbacks.exit_mut(Phase::Pre, Mode::Allocator) {
            cb(self.ctx);
        }
        let patch_off = self.cache.cursor();
        let token = self.links.new_site(block, kind, patch_off);
        for w in encode::load_imm32(reg::T6, token as i32) {
            self.emit(w);
        }
        if self.config.stub_regions {
            let stub = self.stub.last_stub.expect("stub planted before block");
            let rel = stub as i64 - self.cache.cursor() as i64;
            debug_assert!(encode::jal_in_range(rel), "stub out of JAL reach");
            self.emit(encode::jal(reg::ZERO, rel as i32));
        } else {
            self.emit(encode::sd(reg::T6, reg::TP, context::EXIT_TOKEN_OFFSET));
            self.emit(encode::ld(reg::T6, reg::TP, context::EXIT_HANDLER_OFFSET));
            self.emit(encode::jalr(reg::ZERO, reg::T6, 0));
        }
        if let Some(cb) = self.callbacks.exit_mut(Phase::Post, Mode::Allocator) {
            cb(self.ctx);
        }
        token
    }

    // ==================== stub regions ====================

    /// Plant a fresh stub when the next block's worst-case tail would drift
    /// out of JAL reach of the current one, or at the configured cadence.
    fn ensure_stub(&mut self, upcoming_insns: usize) {
        let worst_block = self.weaver.reserve_bytes(upcoming_insns)
            + upcoming_insns * WORST_INSN_BYTES
            + WORST_TERM_BYTES;
        let need_new = match self.stub.last_stub {
            None => true,
            Some(off) => {
                let worst_tail = (self.cache.cursor() + worst_block) as i64;
                worst_tail - off as i64 > STUB_REACH_BYTES
                    || self.stub.insns_since_stub + upcoming_insns
                        >= self.config.stub_interval_insns
            }
        };
        if need_new {
            let off = self.cache.cursor();
            self.emit(encode::sd(reg::T6, reg::TP, context::EXIT_TOKEN_OFFSET));
            self.emit(encode::ld(reg::T6, reg::TP, context::EXIT_HANDLER_OFFSET));
            self.emit(encode::jalr(reg::ZERO, reg::T6, 0));
            self.stub.last_stub = Some(off);
            self.stub.insns_since_stub = 0;
            self.stats.stubs_planted += 1;
        }
        self.stub.insns_since_stub += upcoming_insns;
    }

    // ==================== helpers ====================

    fn can_link(&self) -> bool {
        self.config.trace_linking && !self.callbacks.has_runtime()
    }

    fn emit(&mut self, word: u32) {
        self.cache.emit_u32(word);
    }

    fn emit_words(&mut self, words: &[u32]) {
        for &w in words {
            self.cache.emit_u32(w);
        }
    }
}

fn classify(
    end: &ScanEnd,
    last_addr: u64,
    last: &Insn,
) -> (TerminatorKind, Option<u64>, Option<u64>, Option<u64>) {
    let next = last_addr + last.len as u64;
    match end {
        ScanEnd::Control => {
            if last.is_branch() {
                let taken = (last_addr as i64).wrapping_add(last.imm) as u64;
                (TerminatorKind::Branch, Some(taken), Some(next), None)
            } else if last.is_direct_jump() {
                let taken = (last_addr as i64).wrapping_add(last.imm) as u64;
                (TerminatorKind::DirectJump, Some(taken), None, None)
            } else if last.is_indirect_jump() {
                (TerminatorKind::IndirectJump, None, None, None)
            } else {
                // ECALL and EBREAK both end the block at the system boundary.
                (TerminatorKind::Syscall, None, None, Some(next))
            }
        }
        ScanEnd::SegmentBefore | ScanEnd::SegmentAfter | ScanEnd::LengthCap => {
            (TerminatorKind::Segmented, None, Some(next), None)
        }
    }
}

/// Bitmask of every integer register named by the instruction's fields.
fn field_mask(insn: &Insn) -> u32 {
    let mut mask = 0;
    if insn.rd_is_x {
        if let Some(r) = insn.rd {
            mask |= 1u32 << r;
        }
    }
    if insn.rs1_is_x {
        if let Some(r) = insn.rs1 {
            mask |= 1u32 << r;
        }
    }
    if insn.rs2_is_x {
        if let Some(r) = insn.rs2 {
            mask |= 1u32 << r;
        }
    }
    mask
}

/// Rename every field of `word` naming `orig` (in the integer file) to
/// `standin`.
fn patch_fields(word: u32, insn: &Insn, orig: u8, standin: u8) -> u32 {
    let mut word = word;
    if insn.rd_is_x && insn.rd == Some(orig) {
        word = encode::patch_rd(word, standin);
    }
    if insn.rs1_is_x && insn.rs1 == Some(orig) {
        word = encode::patch_rs1(word, standin);
    }
    if insn.rs2_is_x && insn.rs2 == Some(orig) {
        word = encode::patch_rs2(word, standin);
    }
    word
}

/// Rebuild a B-type word with a new byte offset.
fn with_branch_offset(word: u32, offset: i32) -> u32 {
    let opcode = word & 0x7f;
    let f3 = (word >> 12) & 0x7;
    let rs1 = ((word >> 15) & 0x1f) as u8;
    let rs2 = ((word >> 20) & 0x1f) as u8;
    encode::b_type(opcode, f3, rs1, rs2, offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::link::ExitKind;
    use crate::elf::GuestImage;

    const TEXT_BASE: u64 = 0x1_0000;

    struct Rig {
        image: GuestImage,
        config: EngineConfig,
        cache: CodeCache,
        blocks: BlockTable,
        links: LinkTable,
        weaver: InlineWeaver,
        callbacks: CallbackRegistry,
        groups: HashMap<Mnemonic, u32>,
        ctx: Box<GuestContext>,
        stub: StubState,
        stats: EngineStats,
    }

    impl Rig {
        fn new(words: &[u32]) -> Self {
            Self::with_config(words, EngineConfig::default())
        }

        fn with_config(words: &[u32], config: EngineConfig) -> Self {
            let mut text = Vec::new();
            for w in words {
                text.extend_from_slice(&w.to_le_bytes());
            }
            Rig {
                image: GuestImage::from_parts(TEXT_BASE, TEXT_BASE, text),
                cache: CodeCache::new(config.cache_size).unwrap(),
                config,
                blocks: BlockTable::new(),
                links: LinkTable::new(),
                weaver: InlineWeaver::new(),
                callbacks: CallbackRegistry::new(),
                groups: HashMap::new(),
                ctx: GuestContext::new(),
                stub: StubState::default(),
                stats: EngineStats::default(),
            }
        }

        fn translate(&mut self, addr: u64) -> Result<Materialize, EngineError> {
            let mut tr = Translator {
                image: &self.image,
                config: &self.config,
                cache: &mut self.cache,
                blocks: &mut self.blocks,
                links: &mut self.links,
                weaver: &self.weaver,
                callbacks: &mut self.callbacks,
                groups: &self.groups,
                ctx: &mut *self.ctx,
                stub: &mut self.stub,
                stats: &mut self.stats,
            };
            tr.materialize(addr, false, None)
        }

        fn translate_ok(&mut self, addr: u64) -> BlockId {
            match self.translate(addr).unwrap() {
                Materialize::Done(id) => id,
                Materialize::NeedFlush { .. } => panic!("unexpected cache pressure"),
            }
        }

        /// Emitted words of a block, in order.
        fn block_words(&self, id: BlockId) -> Vec<u32> {
            let desc = self.blocks.get(id);
            (desc.cache_start..desc.cache_end)
                .step_by(4)
                .map(|off| self.cache.read_u32(off))
                .collect()
        }
    }

    #[test]
    fn test_straightline_block() {
        let mut rig = Rig::new(&[
            encode::addi(5, 0, 1),
            encode::addi(6, 0, 2),
            encode::jal(0, -8),
        ]);
        let id = rig.translate_ok(TEXT_BASE);
        let desc = rig.blocks.get(id);
        assert_eq!(desc.first_addr, TEXT_BASE);
        assert_eq!(desc.last_addr, TEXT_BASE + 8);
        assert_eq!(desc.insn_count, 3);
        assert_eq!(desc.terminator, TerminatorKind::DirectJump);
        assert_eq!(desc.taken_target, Some(TEXT_BASE));
        assert_eq!(desc.fall_through, None);

        // Plain instructions are copied verbatim; then the context-switch
        // exit: li token, store it, load the handler, jump.
        let words = rig.block_words(id);
        assert_eq!(words[0], encode::addi(5, 0, 1));
        assert_eq!(words[1], encode::addi(6, 0, 2));
        assert_eq!(words[2], encode::addi(reg::T6, 0, 0)); // token 0
        assert_eq!(
            words[3],
            encode::sd(reg::T6, reg::TP, context::EXIT_TOKEN_OFFSET)
        );
        assert_eq!(
            words[4],
            encode::ld(reg::T6, reg::TP, context::EXIT_HANDLER_OFFSET)
        );
        assert_eq!(words[5], encode::jalr(0, reg::T6, 0));
        assert_eq!(words.len(), 6);
    }

    #[test]
    fn test_materialization_is_idempotent() {
        let mut rig = Rig::new(&[encode::jal(0, 0)]);
        let a = rig.translate_ok(TEXT_BASE);
        let cursor = rig.cache.cursor();
        let b = rig.translate_ok(TEXT_BASE);
        assert_eq!(a, b);
        assert_eq!(rig.cache.cursor(), cursor);
        assert_eq!(rig.stats.blocks_materialized, 1);
    }

    #[test]
    fn test_auipc_transparency() {
        // auipc x5, 0x2000 at TEXT_BASE must deliver TEXT_BASE + 0x2000,
        // and no AUIPC may survive into the cache.
        let mut rig = Rig::new(&[encode::auipc(5, 2), encode::jal(0, 0)]);
        let id = rig.translate_ok(TEXT_BASE);
        let words = rig.block_words(id);
        assert!(words.iter().all(|w| w & 0x7f != 0x17), "auipc leaked into cache");
        // The li expansion targets x5 and produces the original PC value.
        let expect = encode::load_imm64(5, TEXT_BASE + 0x2000);
        assert_eq!(&words[..expect.len()], expect.as_slice());
    }

    #[test]
    fn test_jal_link_writeback() {
        // jal ra, +16: ra must receive the *guest* return address.
        let mut rig = Rig::new(&[encode::jal(1, 16)]);
        let id = rig.translate_ok(TEXT_BASE);
        let words = rig.block_words(id);
        let expect = encode::load_imm64(1, TEXT_BASE + 4);
        assert_eq!(&words[..expect.len()], expect.as_slice());
        let desc = rig.blocks.get(id);
        assert_eq!(desc.taken_target, Some(TEXT_BASE + 16));
    }

    #[test]
    fn test_special_reg_rewrite() {
        // addi x31, x31, 1 operates on the memory-resident guest x31.
        let mut rig = Rig::new(&[encode::addi(31, 31, 1), encode::jal(0, 0)]);
        let id = rig.translate_ok(TEXT_BASE);
        let words = rig.block_words(id);
        assert_eq!(words[0], encode::ld(reg::T6, reg::TP, context::xreg_offset(31)));
        assert_eq!(words[1], encode::addi(31, 31, 1));
        assert_eq!(words[2], encode::sd(reg::T6, reg::TP, context::xreg_offset(31)));
    }

    #[test]
    fn test_tp_reg_rewrite_uses_standin() {
        // ld x5, 0(x4): guest tp is memory-resident; a stand-in must carry
        // it and be spilled/restored around the access.
        let mut rig = Rig::new(&[encode::ld(5, reg::TP, 0), encode::jal(0, 0)]);
        let id = rig.translate_ok(TEXT_BASE);
        let words = rig.block_words(id);
        let s = reg::T5;
        assert_eq!(words[0], encode::sd(s, reg::TP, context::xreg_offset(s)));
        assert_eq!(words[1], encode::ld(s, reg::TP, context::xreg_offset(reg::TP)));
        assert_eq!(words[2], encode::ld(5, s, 0));
        assert_eq!(words[3], encode::ld(s, reg::TP, context::xreg_offset(s)));
    }

    #[test]
    fn test_branch_arms_and_offsets() {
        let mut rig = Rig::new(&[encode::beq(5, 6, 8), encode::jal(0, 0)]);
        let id = rig.translate_ok(TEXT_BASE);
        let desc = rig.blocks.get(id);
        assert_eq!(desc.terminator, TerminatorKind::Branch);
        assert_eq!(desc.taken_target, Some(TEXT_BASE + 8));
        assert_eq!(desc.fall_through, Some(TEXT_BASE + 4));

        let words = rig.block_words(id);
        // Fall-through exit is 4 words; the branch must hop over it.
        let branch = decode::decode(words[0]);
        assert_eq!(branch.mnemonic, Mnemonic::Beq);
        assert_eq!(branch.rs1, Some(5));
        assert_eq!(branch.rs2, Some(6));
        assert_eq!(branch.imm, 20);
        // Both arms end in a context switch through the exit handler.
        assert_eq!(words[3], encode::ld(reg::T6, reg::TP, context::EXIT_HANDLER_OFFSET));
        assert_eq!(*words.last().unwrap(), encode::jalr(0, reg::T6, 0));
        // Arm exit kinds are recorded in emission order.
        assert_eq!(rig.links.site(0).kind, ExitKind::FallThrough(TEXT_BASE + 4));
        assert_eq!(rig.links.site(1).kind, ExitKind::Taken(TEXT_BASE + 8));
    }

    #[test]
    fn test_jalr_indirect_exit() {
        // jalr ra, t0, 4: target from old rs1, bit 0 cleared, link written.
        let mut rig = Rig::new(&[encode::jalr(1, 5, 4)]);
        let id = rig.translate_ok(TEXT_BASE);
        let desc = rig.blocks.get(id);
        assert_eq!(desc.terminator, TerminatorKind::IndirectJump);
        let words = rig.block_words(id);
        assert_eq!(words[0], encode::addi(reg::T6, 5, 4));
        assert_eq!(words[1], encode::andi(reg::T6, reg::T6, -2));
        assert_eq!(
            words[2],
            encode::sd(reg::T6, reg::TP, context::INDIRECT_TARGET_OFFSET)
        );
        let link = encode::load_imm64(1, TEXT_BASE + 4);
        assert_eq!(&words[3..3 + link.len()], link.as_slice());
        assert_eq!(rig.links.site(0).kind, ExitKind::Indirect);
    }

    #[test]
    fn test_ecall_terminator() {
        let mut rig = Rig::new(&[encode::addi(17, 0, 93), encode::ecall()]);
        let id = rig.translate_ok(TEXT_BASE);
        let desc = rig.blocks.get(id);
        assert_eq!(desc.terminator, TerminatorKind::Syscall);
        assert_eq!(desc.ecall_next, Some(TEXT_BASE + 8));
        assert_eq!(
            rig.links.site(0).kind,
            ExitKind::Syscall { next: TEXT_BASE + 8 }
        );
    }

    #[test]
    fn test_length_cap_segments() {
        let mut words: Vec<u32> = (0..10).map(|_| encode::addi(5, 5, 1)).collect();
        words.push(encode::jal(0, 0));
        let mut config = EngineConfig::default();
        config.max_block_insns = 4;
        let mut rig = Rig::with_config(&words, config);
        let id = rig.translate_ok(TEXT_BASE);
        let desc = rig.blocks.get(id);
        assert_eq!(desc.insn_count, 4);
        assert_eq!(desc.terminator, TerminatorKind::Segmented);
        assert_eq!(desc.fall_through, Some(TEXT_BASE + 16));
        assert_eq!(rig.links.site(0).kind, ExitKind::Segment(TEXT_BASE + 16));
    }

    #[test]
    fn test_segmentation_post_phase() {
        // A RUNTIME POST hook on MUL cuts the block after the mul.
        let mut rig = Rig::new(&[
            encode::addi(5, 0, 1),
            crate::riscv::encode::r_type(0x33, 6, 0, 5, 5, 0x01), // mul x6, x5, x5
            encode::addi(7, 0, 2),
            encode::jal(0, 0),
        ]);
        rig.callbacks
            .set_insn_type(Mnemonic::Mul, Phase::Post, Mode::Runtime, Box::new(|_, _| {}));
        let id = rig.translate_ok(TEXT_BASE);
        let desc = rig.blocks.get(id);
        assert_eq!(desc.insn_count, 2);
        assert_eq!(desc.last_addr, TEXT_BASE + 4);
        assert_eq!(desc.terminator, TerminatorKind::Segmented);
        assert_eq!(desc.fall_through, Some(TEXT_BASE + 8));
    }

    #[test]
    fn test_segmentation_pre_phase() {
        // A RUNTIME PRE hook on MUL cuts the block *before* the mul, which
        // then starts its own block and records the logical block start.
        let mut rig = Rig::new(&[
            encode::addi(5, 0, 1),
            crate::riscv::encode::r_type(0x33, 6, 0, 5, 5, 0x01),
            encode::jal(0, 0),
        ]);
        rig.callbacks
            .set_insn_type(Mnemonic::Mul, Phase::Pre, Mode::Runtime, Box::new(|_, _| {}));
        let first = rig.translate_ok(TEXT_BASE);
        assert_eq!(rig.blocks.get(first).insn_count, 1);
        assert_eq!(rig.blocks.get(first).terminator, TerminatorKind::Segmented);

        let mut tr = Translator {
            image: &rig.image,
            config: &rig.config,
            cache: &mut rig.cache,
            blocks: &mut rig.blocks,
            links: &mut rig.links,
            weaver: &rig.weaver,
            callbacks: &mut rig.callbacks,
            groups: &rig.groups,
            ctx: &mut *rig.ctx,
            stub: &mut rig.stub,
            stats: &mut rig.stats,
        };
        let cont = match tr.materialize(TEXT_BASE + 4, false, Some(TEXT_BASE)).unwrap() {
            Materialize::Done(id) => id,
            _ => panic!(),
        };
        let desc = rig.blocks.get(cont);
        assert_eq!(desc.first_addr, TEXT_BASE + 4);
        assert_eq!(desc.basic_block_addr, TEXT_BASE);
    }

    #[test]
    fn test_inline_weaving_positions() {
        let marker_pre = encode::addi(0, 0, 1); // distinctive nops
        let marker_post = encode::addi(0, 0, 2);
        let mut rig = Rig::new(&[encode::addi(5, 0, 7), encode::jal(0, 0)]);
        rig.weaver.block_mut(Phase::Pre).append(marker_pre);
        rig.weaver.block_mut(Phase::Post).append(marker_post);
        let id = rig.translate_ok(TEXT_BASE);
        let words = rig.block_words(id);
        assert_eq!(words[0], marker_pre);
        assert_eq!(words[1], encode::addi(5, 0, 7));
        // Block POST runs before the terminator's exit construct.
        assert_eq!(words[2], marker_post);
    }

    #[test]
    fn test_insn_inline_wraps_each_instruction() {
        let marker = encode::addi(0, 0, 3);
        let mut rig = Rig::new(&[
            encode::addi(5, 0, 1),
            encode::addi(6, 0, 2),
            encode::jal(0, 0),
        ]);
        rig.weaver.insn_mut(Phase::Pre).append(marker);
        let id = rig.translate_ok(TEXT_BASE);
        let words = rig.block_words(id);
        let count = words.iter().filter(|&&w| w == marker).count();
        // One per instruction, terminator included.
        assert_eq!(count, 3);
    }

    #[test]
    fn test_trace_link_backpatch_on_self_loop() {
        let mut config = EngineConfig::default();
        config.trace_linking = true;
        let mut rig = Rig::with_config(&[encode::addi(5, 5, 1), encode::jal(0, -4)], config);
        let id = rig.translate_ok(TEXT_BASE);
        // The jump targets the block's own entry, which materialized a
        // moment later: the pending backpatch must have been drained.
        assert_eq!(rig.stats.links_installed, 1);
        assert!(rig.links.site(0).linked);
        let desc = rig.blocks.get(id);
        let site = rig.links.site(0);
        let jal = decode::decode(rig.cache.read_u32(site.patch_off));
        assert_eq!(jal.mnemonic, Mnemonic::Jal);
        assert_eq!(
            site.patch_off as i64 + jal.imm,
            desc.cache_start as i64,
            "link lands on the block entry"
        );
    }

    #[test]
    fn test_trace_link_immediate_when_target_known() {
        let mut config = EngineConfig::default();
        config.trace_linking = true;
        // Block B at +8 jumps back to block A; A is materialized first.
        let mut rig = Rig::with_config(
            &[
                encode::addi(5, 5, 1),
                encode::jal(0, 8), // A ends, jumping to C
                encode::jal(0, -8), // B jumps to A
            ],
            config,
        );
        rig.translate_ok(TEXT_BASE);
        let before = rig.stats.links_installed;
        rig.translate_ok(TEXT_BASE + 8);
        assert!(rig.stats.links_installed > before, "emission-time link");
    }

    #[test]
    fn test_runtime_callbacks_suppress_linking() {
        let mut config = EngineConfig::default();
        config.trace_linking = true;
        let mut rig = Rig::with_config(&[encode::addi(5, 5, 1), encode::jal(0, -4)], config);
        rig.callbacks
            .set_block(Phase::Post, Mode::Runtime, Box::new(|_, _| {}));
        rig.translate_ok(TEXT_BASE);
        assert_eq!(rig.stats.links_installed, 0);
        assert!(!rig.links.site(0).linked);
    }

    #[test]
    fn test_allocator_callbacks_fire_once() {
        use std::cell::Cell;
        use std::rc::Rc;
        let mut rig = Rig::new(&[encode::addi(5, 0, 1), encode::jal(0, 0)]);
        let blocks = Rc::new(Cell::new(0u32));
        let insns = Rc::new(Cell::new(0u32));
        let b = blocks.clone();
        rig.callbacks
            .set_block(Phase::Pre, Mode::Allocator, Box::new(move |_, _| b.set(b.get() + 1)));
        let i = insns.clone();
        rig.callbacks
            .set_insn(Phase::Post, Mode::Allocator, Box::new(move |_, _| i.set(i.get() + 1)));
        rig.translate_ok(TEXT_BASE);
        rig.translate_ok(TEXT_BASE); // BBT hit; no re-fire
        assert_eq!(blocks.get(), 1);
        assert_eq!(insns.get(), 2);
    }

    #[test]
    fn test_stub_regions_share_one_exit() {
        let mut config = EngineConfig::default();
        config.stub_regions = true;
        let mut rig = Rig::with_config(
            &[encode::jal(0, 4), encode::jal(0, 4), encode::jal(0, 0)],
            config,
        );
        let a = rig.translate_ok(TEXT_BASE);
        let b = rig.translate_ok(TEXT_BASE + 4);
        assert_eq!(rig.stats.stubs_planted, 1);
        // Each block tail is li token + jal to the shared stub.
        for id in [a, b] {
            let words = rig.block_words(id);
            let jal = decode::decode(*words.last().unwrap());
            assert_eq!(jal.mnemonic, Mnemonic::Jal, "tail jumps to the stub");
            let desc = rig.blocks.get(id);
            let jal_at = desc.cache_end as i64 - 4;
            assert_eq!(jal_at + jal.imm, 0, "stub sits at cache offset 0");
        }
    }

    #[test]
    fn test_unknown_opcode_is_fatal() {
        let mut rig = Rig::new(&[0xffff_ffff]);
        match rig.translate(TEXT_BASE) {
            Err(EngineError::UnknownOpcode { pc, .. }) => assert_eq!(pc, TEXT_BASE),
            other => panic!("expected UnknownOpcode, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_fetch_outside_text_is_guest_fault() {
        let mut rig = Rig::new(&[encode::jal(0, 0)]);
        assert!(matches!(
            rig.translate(TEXT_BASE + 0x9000),
            Err(EngineError::GuestFault { .. })
        ));
    }

    #[test]
    fn test_compressed_copied_verbatim() {
        // c.addi a0, 1 / c.jr ra — build the little-endian halfword stream.
        let mut text = Vec::new();
        text.extend_from_slice(&0x0505u16.to_le_bytes()); // c.addi a0, 1
        text.extend_from_slice(&0x8082u16.to_le_bytes()); // c.jr ra
        let mut rig = Rig::new(&[]);
        rig.image = GuestImage::from_parts(TEXT_BASE, TEXT_BASE, text);
        let id = rig.translate_ok(TEXT_BASE);
        let desc = rig.blocks.get(id);
        assert_eq!(desc.insn_count, 2);
        assert_eq!(desc.terminator, TerminatorKind::IndirectJump);
        assert_eq!(desc.last_addr, TEXT_BASE + 2);
        // The c.addi is copied as a 2-byte instruction.
        assert_eq!(rig.cache.read_u32(desc.cache_start) & 0xffff, 0x0505);
    }

    #[test]
    fn test_cache_pressure_reports_need_flush() {
        let mut config = EngineConfig::default();
        config.cache_size = 4096;
        config.max_block_insns = 8;
        let mut words: Vec<u32> = Vec::new();
        for _ in 0..200 {
            words.push(encode::addi(5, 5, 1));
        }
        words.push(encode::jal(0, 0));
        let mut rig = Rig::with_config(&words, config);
        // Materialize distinct addresses until the cache reports pressure.
        let mut saw_flush_request = false;
        for i in 0..200 {
            match rig.translate(TEXT_BASE + i * 4) {
                Ok(Materialize::Done(_)) => {}
                Ok(Materialize::NeedFlush { need }) => {
                    assert!(need <= rig.cache.capacity());
                    saw_flush_request = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert!(saw_flush_request);
    }
}

