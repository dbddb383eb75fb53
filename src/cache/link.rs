//! Exit sites, the exit-link table, and trace-link backpatching.
//!
//! Every context-switch exit emitted into the cache owns an [`ExitSite`];
//! its index is the token the exit sequence hands to the dispatcher. The
//! same record doubles as the backpatch bookkeeping: when trace linking is
//! on and a site's target materializes later, the word at `patch_off` is
//! rewritten into a direct cache-to-cache jump.

use super::block::BlockId;
use super::CodeCache;
use crate::riscv::encode;
use std::collections::HashMap;

pub type ExitToken = usize;

/// What the dispatcher should do when a given exit fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Direct jump, or the taken arm of a conditional branch.
    Taken(u64),
    /// The fall-through arm of a conditional branch.
    FallThrough(u64),
    /// Indirect jump; the target is in the context's `indirect_target` slot.
    Indirect,
    /// ECALL; resume at `next` after the shim runs.
    Syscall { next: u64 },
    /// Segmented cut; continue at the next sequential instruction.
    Segment(u64),
    /// EBREAK; the dispatcher surfaces a guest fault at this address.
    Break(u64),
}

impl ExitKind {
    /// Guest target a trace link may be installed toward.
    pub fn link_target(&self) -> Option<u64> {
        match self {
            ExitKind::Taken(t) | ExitKind::FallThrough(t) => Some(*t),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct ExitSite {
    pub block: BlockId,
    pub kind: ExitKind,
    /// Cache offset of the word a link overwrites (the first instruction of
    /// the context-switch sequence proper, past any arm-entry restores).
    pub patch_off: usize,
    /// A link was installed; links are monotone, at most one per site.
    pub linked: bool,
}

/// Exit-link table plus exit-site arena.
#[derive(Default)]
pub struct LinkTable {
    /// Guest address of a materialized block entry (or stub) to its cache
    /// offset. Entries only ever point at block or stub first bytes.
    entries: HashMap<u64, usize>,
    sites: Vec<ExitSite>,
    /// Sites waiting for a guest target to materialize.
    pending: HashMap<u64, Vec<ExitToken>>,
}

impl LinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_site(&mut self, block: BlockId, kind: ExitKind, patch_off: usize) -> ExitToken {
        let token = self.sites.len();
        self.sites.push(ExitSite {
            block,
            kind,
            patch_off,
            linked: false,
        });
        token
    }

    pub fn site(&self, token: ExitToken) -> &ExitSite {
        &self.sites[token]
    }

    /// Record that a direct branch was emitted in place of this site's
    /// context switch at materialization time.
    pub fn mark_linked(&mut self, token: ExitToken) {
        self.sites[token].linked = true;
    }

    pub fn site_count(&self) -> usize {
        self.sites.len()
    }

    pub fn register_entry(&mut self, guest_addr: u64, cache_off: usize) {
        self.entries.insert(guest_addr, cache_off);
    }

    pub fn entry(&self, guest_addr: u64) -> Option<usize> {
        self.entries.get(&guest_addr).copied()
    }

    /// Record that `token` wants a direct branch to `target` once it exists.
    pub fn request_link(&mut self, target: u64, token: ExitToken) {
        self.pending.entry(target).or_default().push(token);
    }

    /// Patch every pending site waiting on `target`, now materialized at
    /// `target_off`. Sites whose JAL cannot reach stay context switches.
    /// Returns the number of links installed.
    pub fn install_links(
        &mut self,
        cache: &mut CodeCache,
        target: u64,
        target_off: usize,
    ) -> usize {
        let Some(tokens) = self.pending.remove(&target) else {
            return 0;
        };
        let mut installed = 0;
        for token in tokens {
            let site = &mut self.sites[token];
            if site.linked {
                continue;
            }
            let rel = target_off as i64 - site.patch_off as i64;
            if !encode::jal_in_range(rel) {
                continue;
            }
            cache.patch_u32(site.patch_off, encode::jal(0, rel as i32));
            site.linked = true;
            installed += 1;
        }
        if installed > 0 {
            cache.sync_icache();
        }
        installed
    }

    /// Drop everything on cache flush.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.sites.clear();
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::riscv::decode;

    #[test]
    fn test_entry_registration() {
        let mut links = LinkTable::new();
        links.register_entry(0x1000, 64);
        assert_eq!(links.entry(0x1000), Some(64));
        assert_eq!(links.entry(0x2000), None);
    }

    #[test]
    fn test_backpatch_installs_jal() {
        let mut cache = CodeCache::new(4096).unwrap();
        let mut links = LinkTable::new();
        // An exit sequence placeholder at offset 0.
        let patch_off = cache.emit_u32(encode::nop());
        for _ in 0..7 {
            cache.emit_u32(encode::nop());
        }
        let token = links.new_site(0, ExitKind::Taken(0x2000), patch_off);
        links.request_link(0x2000, token);

        // Target block materializes at offset 64.
        while cache.cursor() < 64 {
            cache.emit_u32(encode::nop());
        }
        links.register_entry(0x2000, 64);
        assert_eq!(links.install_links(&mut cache, 0x2000, 64), 1);
        assert!(links.site(token).linked);

        let word = cache.read_u32(patch_off);
        let insn = decode::decode(word);
        assert_eq!(insn.mnemonic, crate::riscv::Mnemonic::Jal);
        assert_eq!(insn.rd, Some(0));
        assert_eq!(insn.imm, 64);
    }

    #[test]
    fn test_backpatch_is_monotone() {
        let mut cache = CodeCache::new(4096).unwrap();
        let mut links = LinkTable::new();
        let patch_off = cache.emit_u32(encode::nop());
        let token = links.new_site(0, ExitKind::Taken(0x2000), patch_off);
        links.request_link(0x2000, token);
        assert_eq!(links.install_links(&mut cache, 0x2000, 0), 1);
        // A second drain for the same target finds nothing pending.
        links.request_link(0x2000, token);
        assert_eq!(links.install_links(&mut cache, 0x2000, 0), 0);
    }

    #[test]
    fn test_out_of_range_link_left_alone() {
        let mut cache = CodeCache::new(4 * 1024 * 1024).unwrap();
        let mut links = LinkTable::new();
        let patch_off = cache.emit_u32(encode::nop());
        let token = links.new_site(0, ExitKind::Taken(0x2000), patch_off);
        links.request_link(0x2000, token);
        // Pretend the target landed 2 MiB away, beyond JAL reach.
        let far = 2 * 1024 * 1024;
        while cache.cursor() < far {
            cache.emit_u32(encode::nop());
        }
        assert_eq!(links.install_links(&mut cache, 0x2000, far), 0);
        assert!(!links.site(token).linked);
        assert_eq!(cache.read_u32(patch_off), encode::nop());
    }
}
