//! The engine: lifecycle, registration API, and the dispatcher.
//!
//! A flat record owning every subsystem — guest image, register-save area,
//! code cache, block and link tables, weaver, callback registry, syscall
//! shim. The dispatcher loop lives here: it is reached on every context
//! switch out of the cache, resolves the next guest address, materializes
//! and links blocks on demand, runs RUNTIME callbacks, and re-enters the
//! cache.

pub mod context;
pub mod syscall;

use crate::cache::block::{BlockDescriptor, BlockId, BlockTable};
use crate::cache::link::LinkTable;
use crate::cache::CodeCache;
use crate::callbacks::{CallbackRegistry, Mode, Phase};
use crate::config::EngineConfig;
use crate::elf::{GuestImage, GuestSpace};
use crate::error::EngineError;
use crate::inline::{InlineSeq, InlineWeaver};
use crate::riscv::Mnemonic;
use crate::translate::{Materialize, StubState, Translator};
use self::context::GuestContext;
use self::syscall::{SyscallHandler, SyscallTable};
use std::collections::HashMap;
use std::path::Path;

/// Counters reported at debug level when a run ends.
#[derive(Debug, Default, Clone)]
pub struct EngineStats {
    pub blocks_materialized: u64,
    pub flushes: u64,
    pub links_installed: u64,
    pub stubs_planted: u64,
    pub syscalls: u64,
    pub exits_taken: u64,
    pub exits_fall_through: u64,
    pub exits_indirect: u64,
    pub exits_syscall: u64,
    pub exits_segment: u64,
}

pub struct Engine {
    config: EngineConfig,
    image: GuestImage,
    ctx: Box<GuestContext>,
    cache: CodeCache,
    blocks: BlockTable,
    links: LinkTable,
    weaver: InlineWeaver,
    callbacks: CallbackRegistry,
    groups: HashMap<Mnemonic, u32>,
    syscalls: SyscallTable,
    stub: StubState,
    stats: EngineStats,
    space: Option<GuestSpace>,
    guest_args: Vec<String>,
    guest_env: Vec<String>,
}

impl Engine {
    /// Load and validate the target, map the code cache.
    pub fn new(path: &Path, config: EngineConfig) -> Result<Self, EngineError> {
        let image = GuestImage::load(path)?;
        let mut engine = Self::from_image(image, config)?;
        engine.guest_args = vec![path.display().to_string()];
        Ok(engine)
    }

    /// Build an engine over an already-parsed image.
    pub fn from_image(image: GuestImage, config: EngineConfig) -> Result<Self, EngineError> {
        let cache = CodeCache::new(config.cache_size)?;
        let syscalls = SyscallTable::new(config.unknown_syscall);
        Ok(Engine {
            ctx: GuestContext::new(),
            cache,
            blocks: BlockTable::new(),
            links: LinkTable::new(),
            weaver: InlineWeaver::new(),
            callbacks: CallbackRegistry::new(),
            groups: HashMap::new(),
            syscalls,
            stub: StubState::default(),
            stats: EngineStats::default(),
            space: None,
            guest_args: vec!["guest".to_string()],
            guest_env: Vec::new(),
            image,
            config,
        })
    }

    // ==================== registration ====================

    /// Guest argv entries after argv[0] (which names the target).
    pub fn set_guest_args(&mut self, args: &[String]) {
        self.guest_args.truncate(1);
        self.guest_args.extend_from_slice(args);
    }

    pub fn set_guest_env(&mut self, env: &[String]) {
        self.guest_env = env.to_vec();
    }

    pub fn register_exit_fn(
        &mut self,
        phase: Phase,
        mode: Mode,
        f: impl FnMut(&mut GuestContext) + 'static,
    ) {
        self.callbacks.set_exit(phase, mode, Box::new(f));
    }

    pub fn register_block_fn(
        &mut self,
        phase: Phase,
        mode: Mode,
        f: impl FnMut(&mut GuestContext, &BlockDescriptor) + 'static,
    ) {
        self.callbacks.set_block(phase, mode, Box::new(f));
    }

    pub fn register_insn_fn(
        &mut self,
        phase: Phase,
        mode: Mode,
        f: impl FnMut(&mut GuestContext, &crate::callbacks::InsnInfo) + 'static,
    ) {
        self.callbacks.set_insn(phase, mode, Box::new(f));
    }

    pub fn register_insn_type_fn(
        &mut self,
        mnemonic: Mnemonic,
        phase: Phase,
        mode: Mode,
        f: impl FnMut(&mut GuestContext, &crate::callbacks::InsnInfo) + 'static,
    ) {
        self.callbacks.set_insn_type(mnemonic, phase, mode, Box::new(f));
    }

    pub fn register_insn_group_fn(
        &mut self,
        group: u32,
        phase: Phase,
        mode: Mode,
        f: impl FnMut(&mut GuestContext, &crate::callbacks::InsnInfo) + 'static,
    ) {
        self.callbacks.set_insn_group(group, phase, mode, Box::new(f));
    }

    /// Tag mnemonics with a group id for per-group instrumentation.
    pub fn assign_group(&mut self, mnemonics: &[Mnemonic], group: u32) {
        for &m in mnemonics {
            self.groups.insert(m, group);
        }
    }

    /// Block-scope inline sequence for the given phase.
    pub fn inline_block(&mut self, phase: Phase) -> &mut InlineSeq {
        self.weaver.block_mut(phase)
    }

    /// Instruction-scope inline sequence for the given phase.
    pub fn inline_insn(&mut self, phase: Phase) -> &mut InlineSeq {
        self.weaver.insn_mut(phase)
    }

    /// Override the handler for one guest syscall number.
    pub fn register_syscall(&mut self, number: u64, handler: SyscallHandler) {
        self.syscalls.register(number, handler);
    }

    // ==================== accessors ====================

    pub fn image(&self) -> &GuestImage {
        &self.image
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn context_mut(&mut self) -> &mut GuestContext {
        &mut self.ctx
    }

    /// The mapped guest address space, once `run` has set it up.
    pub fn guest_space(&self) -> Option<&GuestSpace> {
        self.space.as_ref()
    }

    pub fn lookup_block(&self, addr: u64) -> Option<BlockId> {
        self.blocks.lookup(addr)
    }

    pub fn block(&self, id: BlockId) -> &BlockDescriptor {
        self.blocks.get(id)
    }

    // ==================== materialization ====================

    /// Materialize the block at `addr` (and, under trace linking, its
    /// direct successors) without executing anything.
    pub fn materialize_block(&mut self, addr: u64) -> Result<BlockId, EngineError> {
        self.ensure_block(addr, false, None)
    }

    fn ensure_block(
        &mut self,
        addr: u64,
        entered_by_branch: bool,
        logical: Option<u64>,
    ) -> Result<BlockId, EngineError> {
        if let Some(id) = self.blocks.lookup(addr) {
            return Ok(id);
        }
        match self.materialize(addr, entered_by_branch, logical)? {
            Materialize::Done(id) => {
                self.trace_allocate(id);
                Ok(id)
            }
            Materialize::NeedFlush { .. } => {
                log::debug!("code cache full at {:#x}, flushing", addr);
                self.flush();
                match self.materialize(addr, entered_by_branch, logical)? {
                    Materialize::Done(id) => {
                        self.trace_allocate(id);
                        Ok(id)
                    }
                    Materialize::NeedFlush { need } => Err(EngineError::CacheExhausted {
                        pc: addr,
                        need,
                        capacity: self.cache.capacity(),
                    }),
                }
            }
        }
    }

    fn materialize(
        &mut self,
        addr: u64,
        entered_by_branch: bool,
        logical: Option<u64>,
    ) -> Result<Materialize, EngineError> {
        let mut translator = Translator {
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
        translator.materialize(addr, entered_by_branch, logical)
    }

    /// Speculatively materialize direct successors so fresh chains link up
    /// without extra dispatcher round trips. Failures here are ignored; a
    /// path that is actually taken will surface them when it runs.
    fn trace_allocate(&mut self, id: BlockId) {
        if !self.config.trace_linking || self.callbacks.has_runtime() {
            return;
        }
        let mut work = vec![id];
        let mut budget = 8usize;
        while let Some(bid) = work.pop() {
            let (taken, fall) = {
                let d = self.blocks.get(bid);
                (d.taken_target, d.fall_through)
            };
            for target in [taken, fall].into_iter().flatten() {
                if budget == 0 {
                    return;
                }
                if self.blocks.lookup(target).is_some() {
                    continue;
                }
                budget -= 1;
                if let Ok(Materialize::Done(next)) = self.materialize(target, false, None) {
                    work.push(next);
                }
            }
        }
    }

    /// Flush the cache: cursor, BBT, ELT, exit sites, and stub chain all
    /// reset. Every cache reference held anywhere is invalid after this.
    fn flush(&mut self) {
        self.cache.flush();
        self.blocks.clear();
        self.links.clear();
        self.stub.clear();
        self.stats.flushes += 1;
    }

    // ==================== running ====================

    /// Run the guest to completion; returns its exit code.
    pub fn run(&mut self) -> Result<i32, EngineError> {
        #[cfg(target_arch = "riscv64")]
        {
            self.run_native()
        }
        #[cfg(not(target_arch = "riscv64"))]
        {
            Err(EngineError::UnsupportedHost)
        }
    }

    #[cfg(target_arch = "riscv64")]
    fn run_native(&mut self) -> Result<i32, EngineError> {
        use self::syscall::SyscallOutcome;
        use crate::cache::block::TerminatorKind;
        use crate::cache::link::ExitKind;
        use crate::callbacks::InsnInfo;
        use crate::riscv::decode;

        let space = GuestSpace::map(&self.image, &self.guest_args, &self.guest_env)?;
        self.ctx.xregs[2] = space.initial_sp;
        // Newlib crt0 variants read argc/argv from registers rather than
        // the stack; provide both.
        self.ctx.xregs[10] = self.guest_args.len() as u64;
        self.ctx.xregs[11] = space.initial_sp + 8;
        self.space = Some(space);

        let mut next_pc = self.image.entry;
        let mut entered_by_branch = false;
        let mut logical: Option<u64> = None;
        log::debug!("entering guest at {:#x}", next_pc);

        loop {
            let id = self.ensure_block(next_pc, entered_by_branch, logical)?;
            let desc = self.blocks.get(id).clone();

            if self.callbacks.has_runtime() {
                if let Some(cb) = self.callbacks.block_mut(Phase::Pre, Mode::Runtime) {
                    cb(&mut *self.ctx, &desc);
                }
                let first = decode::decode(desc.first_raw);
                let info = InsnInfo {
                    addr: desc.first_addr,
                    raw: desc.first_raw,
                    mnemonic: first.mnemonic,
                    basic_block_addr: desc.basic_block_addr,
                    group: self.groups.get(&first.mnemonic).copied(),
                };
                self.callbacks
                    .fire_insn(&mut *self.ctx, &info, Phase::Pre, Mode::Runtime);
                if let Some(cb) = self.callbacks.exit_mut(Phase::Post, Mode::Runtime) {
                    cb(&mut *self.ctx);
                }
            }

            self.ctx.pc = next_pc;
            let entry = self.cache.addr_at(desc.cache_start);
            let ctx_ptr: *mut GuestContext = &mut *self.ctx;
            unsafe {
                context::graft_enter_guest(ctx_ptr, entry);
            }

            let token = self.ctx.exit_token as usize;
            let (site_kind, site_block) = {
                let site = self.links.site(token);
                (site.kind, site.block)
            };
            let exited = self.blocks.get(site_block).clone();

            if self.callbacks.has_runtime() {
                if let Some(cb) = self.callbacks.exit_mut(Phase::Pre, Mode::Runtime) {
                    cb(&mut *self.ctx);
                }
                let last = decode::decode(exited.last_raw);
                let info = InsnInfo {
                    addr: exited.last_addr,
                    raw: exited.last_raw,
                    mnemonic: last.mnemonic,
                    basic_block_addr: exited.basic_block_addr,
                    group: self.groups.get(&last.mnemonic).copied(),
                };
                self.callbacks
                    .fire_insn(&mut *self.ctx, &info, Phase::Post, Mode::Runtime);
                if let Some(cb) = self.callbacks.block_mut(Phase::Post, Mode::Runtime) {
                    cb(&mut *self.ctx, &exited);
                }
            }

            logical = None;
            entered_by_branch = false;
            match site_kind {
                ExitKind::Taken(t) => {
                    self.stats.exits_taken += 1;
                    entered_by_branch = exited.terminator == TerminatorKind::Branch;
                    next_pc = t;
                }
                ExitKind::FallThrough(t) => {
                    self.stats.exits_fall_through += 1;
                    next_pc = t;
                }
                ExitKind::Segment(t) => {
                    self.stats.exits_segment += 1;
                    logical = Some(exited.basic_block_addr);
                    next_pc = t;
                }
                ExitKind::Indirect => {
                    self.stats.exits_indirect += 1;
                    next_pc = self.ctx.indirect_target;
                }
                ExitKind::Syscall { next } => {
                    self.stats.exits_syscall += 1;
                    self.stats.syscalls += 1;
                    self.ctx.ecall_next = next;
                    let number = self.ctx.xregs[17];
                    let space = self.space.as_mut().expect("guest space mapped");
                    match self
                        .syscalls
                        .dispatch(number, &mut *self.ctx, space, exited.last_addr)?
                    {
                        SyscallOutcome::Continue(ret) => {
                            self.ctx.xregs[10] = ret as u64;
                            // Handlers may redirect by rewriting ecall_next.
                            next_pc = self.ctx.ecall_next;
                        }
                        SyscallOutcome::Exit(code) => {
                            self.log_stats();
                            return Ok(code);
                        }
                    }
                }
                ExitKind::Break(pc) => {
                    return Err(EngineError::GuestFault {
                        pc,
                        symbol: self.image.symbol_at(pc).map(String::from),
                        what: "ebreak",
                    });
                }
            }
        }
    }

    #[allow(dead_code)]
    fn log_stats(&self) {
        log::debug!(
            "run finished: {} blocks, {} flushes, {} links, {} stubs, {} syscalls",
            self.stats.blocks_materialized,
            self.stats.flushes,
            self.stats.links_installed,
            self.stats.stubs_planted,
            self.stats.syscalls,
        );
    }
}
