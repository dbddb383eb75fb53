//! Guest syscall shim.
//!
//! Blocks end at ECALL and the dispatcher routes here. Handlers are kept in
//! a per-number table so user code can override any of them; the defaults
//! cover what Newlib's libgloss actually emits (Linux syscall numbering).
//! Guest pointers are host pointers — the two share one address space — so
//! forwarding is a direct libc call on a riscv64 host.

use crate::config::UnknownSyscall;
use crate::elf::GuestSpace;
use crate::engine::context::GuestContext;
use crate::error::EngineError;
use std::collections::HashMap;

/// RISC-V Linux syscall numbers used by Newlib targets.
pub mod nr {
    pub const OPENAT: u64 = 56;
    pub const CLOSE: u64 = 57;
    pub const LSEEK: u64 = 62;
    pub const READ: u64 = 63;
    pub const WRITE: u64 = 64;
    pub const WRITEV: u64 = 66;
    pub const FSTAT: u64 = 80;
    pub const EXIT: u64 = 93;
    pub const EXIT_GROUP: u64 = 94;
    pub const CLOCK_GETTIME: u64 = 113;
    pub const KILL: u64 = 129;
    pub const TIMES: u64 = 153;
    pub const GETTIMEOFDAY: u64 = 169;
    pub const GETPID: u64 = 172;
    pub const BRK: u64 = 214;
    pub const OPEN: u64 = 1024;
}

const ENOSYS: i64 = 38;

/// What the dispatcher does after a handled syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallOutcome {
    /// Write the value to guest a0 and resume at `ecall_next`.
    Continue(i64),
    /// The guest exited; stop dispatching without tearing the engine down.
    Exit(i32),
}

pub type SyscallHandler = Box<dyn FnMut(&mut GuestContext, &mut GuestSpace) -> SyscallOutcome>;

pub struct SyscallTable {
    handlers: HashMap<u64, SyscallHandler>,
    policy: UnknownSyscall,
}

fn ret_or_errno(res: i64) -> i64 {
    if res < 0 {
        -(std::io::Error::last_os_error().raw_os_error().unwrap_or(5) as i64)
    } else {
        res
    }
}

fn arg(ctx: &GuestContext, n: usize) -> u64 {
    ctx.xregs[10 + n]
}

impl SyscallTable {
    pub fn new(policy: UnknownSyscall) -> Self {
        let mut table = SyscallTable {
            handlers: HashMap::new(),
            policy,
        };
        table.install_defaults();
        table
    }

    /// Register (or override) the handler for one syscall number.
    pub fn register(&mut self, number: u64, handler: SyscallHandler) {
        self.handlers.insert(number, handler);
    }

    /// Handle one guest syscall. `pc` is the guest address of the ECALL,
    /// used only for diagnostics.
    pub fn dispatch(
        &mut self,
        number: u64,
        ctx: &mut GuestContext,
        space: &mut GuestSpace,
        pc: u64,
    ) -> Result<SyscallOutcome, EngineError> {
        match self.handlers.get_mut(&number) {
            Some(handler) => Ok(handler(ctx, space)),
            None => match self.policy {
                UnknownSyscall::Enosys => {
                    log::warn!("unhandled guest syscall {} at {:#x}, returning -ENOSYS", number, pc);
                    Ok(SyscallOutcome::Continue(-ENOSYS))
                }
                UnknownSyscall::Fatal => Err(EngineError::UnhandledSyscall { number, pc }),
            },
        }
    }

    fn install_defaults(&mut self) {
        self.register(
            nr::WRITE,
            Box::new(|ctx, _| {
                let res = unsafe {
                    libc::write(
                        arg(ctx, 0) as i32,
                        arg(ctx, 1) as *const libc::c_void,
                        arg(ctx, 2) as usize,
                    )
                };
                SyscallOutcome::Continue(ret_or_errno(res as i64))
            }),
        );
        self.register(
            nr::WRITEV,
            Box::new(|ctx, _| {
                let res = unsafe {
                    libc::writev(
                        arg(ctx, 0) as i32,
                        arg(ctx, 1) as *const libc::iovec,
                        arg(ctx, 2) as i32,
                    )
                };
                SyscallOutcome::Continue(ret_or_errno(res as i64))
            }),
        );
        self.register(
            nr::READ,
            Box::new(|ctx, _| {
                let res = unsafe {
                    libc::read(
                        arg(ctx, 0) as i32,
                        arg(ctx, 1) as *mut libc::c_void,
                        arg(ctx, 2) as usize,
                    )
                };
                SyscallOutcome::Continue(ret_or_errno(res as i64))
            }),
        );
        self.register(
            nr::OPENAT,
            Box::new(|ctx, _| {
                let res = unsafe {
                    libc::openat(
                        arg(ctx, 0) as i32,
                        arg(ctx, 1) as *const libc::c_char,
                        arg(ctx, 2) as i32,
                        arg(ctx, 3) as libc::mode_t,
                    )
                };
                SyscallOutcome::Continue(ret_or_errno(res as i64))
            }),
        );
        self.register(
            nr::OPEN,
            Box::new(|ctx, _| {
                let res = unsafe {
                    libc::open(
                        arg(ctx, 0) as *const libc::c_char,
                        arg(ctx, 1) as i32,
                        arg(ctx, 2) as libc::mode_t,
                    )
                };
                SyscallOutcome::Continue(ret_or_errno(res as i64))
            }),
        );
        self.register(
            nr::CLOSE,
            Box::new(|ctx, _| {
                let fd = arg(ctx, 0) as i32;
                // Newlib closes its stdio at exit; keep the engine's alive.
                if fd <= 2 {
                    return SyscallOutcome::Continue(0);
                }
                let res = unsafe { libc::close(fd) };
                SyscallOutcome::Continue(ret_or_errno(res as i64))
            }),
        );
        self.register(
            nr::LSEEK,
            Box::new(|ctx, _| {
                let res = unsafe {
                    libc::lseek(arg(ctx, 0) as i32, arg(ctx, 1) as i64, arg(ctx, 2) as i32)
                };
                SyscallOutcome::Continue(ret_or_errno(res))
            }),
        );
        self.register(
            nr::FSTAT,
            Box::new(|ctx, _| {
                let res = unsafe {
                    libc::fstat(arg(ctx, 0) as i32, arg(ctx, 1) as *mut libc::stat)
                };
                SyscallOutcome::Continue(ret_or_errno(res as i64))
            }),
        );
        self.register(
            nr::BRK,
            Box::new(|ctx, space| {
                SyscallOutcome::Continue(space.set_brk(arg(ctx, 0)) as i64)
            }),
        );
        self.register(
            nr::EXIT,
            Box::new(|ctx, _| SyscallOutcome::Exit(arg(ctx, 0) as i32)),
        );
        self.register(
            nr::EXIT_GROUP,
            Box::new(|ctx, _| SyscallOutcome::Exit(arg(ctx, 0) as i32)),
        );
        self.register(
            nr::GETTIMEOFDAY,
            Box::new(|ctx, _| {
                let res = unsafe {
                    libc::gettimeofday(arg(ctx, 0) as *mut libc::timeval, std::ptr::null_mut())
                };
                SyscallOutcome::Continue(ret_or_errno(res as i64))
            }),
        );
        self.register(
            nr::CLOCK_GETTIME,
            Box::new(|ctx, _| {
                let res = unsafe {
                    libc::clock_gettime(arg(ctx, 0) as i32, arg(ctx, 1) as *mut libc::timespec)
                };
                SyscallOutcome::Continue(ret_or_errno(res as i64))
            }),
        );
        self.register(
            nr::TIMES,
            Box::new(|ctx, _| {
                let res = unsafe { libc::times(arg(ctx, 0) as *mut libc::tms) };
                SyscallOutcome::Continue(ret_or_errno(res))
            }),
        );
        self.register(
            nr::GETPID,
            Box::new(|_, _| SyscallOutcome::Continue(unsafe { libc::getpid() } as i64)),
        );
        self.register(
            nr::KILL,
            Box::new(|ctx, _| {
                // Newlib's abort path: kill(getpid(), SIGABRT). Forwarding
                // surfaces the guest fault as a host abort, as intended.
                let res = unsafe { libc::kill(arg(ctx, 0) as i32, arg(ctx, 1) as i32) };
                SyscallOutcome::Continue(ret_or_errno(res as i64))
            }),
        );
    }
}
