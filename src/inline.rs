//! Inline instrumentation weaver.
//!
//! Holds the raw instruction sequences the allocator splices around each
//! translated block ({BB} scope) or around every translated instruction
//! ({insn} scope), at PRE or POST position. Sequences are consumed at
//! materialization time and never patched afterwards.
//!
//! Inline code executes with the guest register file live. The contract
//! matches every other piece of emitted code: `tp` holds the context base
//! (see [`crate::engine::context`] for slot offsets), `t6`/x31 is free
//! scratch, and the context's two spill slots are available for anything
//! wider. Clobbering any other register without restoring it changes guest
//! state.

use crate::callbacks::Phase;
use crate::riscv::encode;

/// One ordered sequence of raw instruction words.
#[derive(Default, Clone)]
pub struct InlineSeq {
    words: Vec<u32>,
}

impl InlineSeq {
    /// Append one raw 32-bit instruction word.
    pub fn append(&mut self, word: u32) {
        self.words.push(word);
    }

    /// Append the canonical load-immediate expansion of `value` into `reg`.
    pub fn append_load_imm64(&mut self, reg: u8, value: u64) {
        self.words.extend(encode::load_imm64(reg, value));
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

/// The four inline sequences: {block, instruction} x {PRE, POST}.
#[derive(Default)]
pub struct InlineWeaver {
    block_pre: InlineSeq,
    block_post: InlineSeq,
    insn_pre: InlineSeq,
    insn_post: InlineSeq,
}

impl InlineWeaver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_mut(&mut self, phase: Phase) -> &mut InlineSeq {
        match phase {
            Phase::Pre => &mut self.block_pre,
            Phase::Post => &mut self.block_post,
        }
    }

    pub fn insn_mut(&mut self, phase: Phase) -> &mut InlineSeq {
        match phase {
            Phase::Pre => &mut self.insn_pre,
            Phase::Post => &mut self.insn_post,
        }
    }

    pub fn block(&self, phase: Phase) -> &InlineSeq {
        match phase {
            Phase::Pre => &self.block_pre,
            Phase::Post => &self.block_post,
        }
    }

    pub fn insn(&self, phase: Phase) -> &InlineSeq {
        match phase {
            Phase::Pre => &self.insn_pre,
            Phase::Post => &self.insn_post,
        }
    }

    /// Worst-case bytes the weaver adds to a block of `insn_count`
    /// instructions; the allocator's room check uses this.
    pub fn reserve_bytes(&self, insn_count: usize) -> usize {
        4 * (self.block_pre.len()
            + self.block_post.len()
            + insn_count * (self.insn_pre.len() + self.insn_post.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_order() {
        let mut weaver = InlineWeaver::new();
        weaver.block_mut(Phase::Post).append(0x0000_0013);
        weaver.block_mut(Phase::Post).append_load_imm64(31, 0x1234_5678_9abc);
        let words = weaver.block(Phase::Post).words();
        assert_eq!(words[0], 0x0000_0013);
        assert!(words.len() > 2);
        assert!(weaver.block(Phase::Pre).is_empty());
    }

    #[test]
    fn test_reserve_bytes() {
        let mut weaver = InlineWeaver::new();
        weaver.insn_mut(Phase::Pre).append(0x13);
        weaver.insn_mut(Phase::Post).append(0x13);
        weaver.block_mut(Phase::Pre).append(0x13);
        assert_eq!(weaver.reserve_bytes(10), 4 * (1 + 10 * 2));
    }
}
