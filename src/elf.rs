//! Guest ELF image loading.
//!
//! Parses the target with goblin, validates it is a static 64-bit RISC-V
//! executable, and keeps what the engine needs: `.text` bytes for the
//! translator, loadable segments for mapping, the entry point, and the
//! symbol table for diagnostics. `GuestSpace` then reproduces the guest's
//! address space inside the engine's own (the two share one process).

use crate::error::EngineError;
use goblin::elf::{header, program_header, Elf};
use std::path::Path;

const PAGE_SIZE: u64 = 4096;

/// A loadable segment.
#[derive(Debug, Clone)]
pub struct Segment {
    pub vaddr: u64,
    pub memsz: u64,
    pub filesz: u64,
    pub offset: u64,
    pub flags: u32,
}

/// Parsed guest binary.
pub struct GuestImage {
    pub entry: u64,
    pub text_vaddr: u64,
    pub text: Vec<u8>,
    pub segments: Vec<Segment>,
    /// File bytes, kept for segment copying at map time.
    data: Vec<u8>,
    /// (addr, name) pairs sorted by address, function symbols only.
    symbols: Vec<(u64, String)>,
}

impl GuestImage {
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let data = std::fs::read(path)?;
        Self::parse(data)
    }

    pub fn parse(data: Vec<u8>) -> Result<Self, EngineError> {
        let elf = Elf::parse(&data).map_err(|e| EngineError::InvalidTarget(e.to_string()))?;

        if !elf.is_64 {
            return Err(EngineError::InvalidTarget(
                "only 64-bit RISC-V binaries are supported".into(),
            ));
        }
        if elf.header.e_machine != header::EM_RISCV {
            return Err(EngineError::InvalidTarget(format!(
                "not a RISC-V binary (e_machine={:#x})",
                elf.header.e_machine
            )));
        }
        if elf.header.e_type != header::ET_EXEC {
            return Err(EngineError::InvalidTarget(
                "only static executables are supported (ET_EXEC)".into(),
            ));
        }

        let segments: Vec<Segment> = elf
            .program_headers
            .iter()
            .filter(|ph| ph.p_type == program_header::PT_LOAD && ph.p_memsz > 0)
            .map(|ph| Segment {
                vaddr: ph.p_vaddr,
                memsz: ph.p_memsz,
                filesz: ph.p_filesz,
                offset: ph.p_offset,
                flags: ph.p_flags,
            })
            .collect();
        if segments.is_empty() {
            return Err(EngineError::InvalidTarget("no loadable segments".into()));
        }

        let mut text_vaddr = 0;
        let mut text = Vec::new();
        for section in &elf.section_headers {
            if elf.shdr_strtab.get_at(section.sh_name) == Some(".text") {
                let start = section.sh_offset as usize;
                let end = start + section.sh_size as usize;
                if end > data.len() {
                    return Err(EngineError::InvalidTarget(".text extends past file".into()));
                }
                text_vaddr = section.sh_addr;
                text = data[start..end].to_vec();
                break;
            }
        }
        if text.is_empty() {
            return Err(EngineError::InvalidTarget("no .text section".into()));
        }

        let mut symbols: Vec<(u64, String)> = elf
            .syms
            .iter()
            .filter(|sym| sym.st_value != 0 && sym.is_function())
            .filter_map(|sym| {
                elf.strtab
                    .get_at(sym.st_name)
                    .map(|name| (sym.st_value, name.to_string()))
            })
            .collect();
        symbols.sort_by_key(|&(addr, _)| addr);

        let entry = elf.entry;
        Ok(GuestImage {
            entry,
            text_vaddr,
            text,
            segments,
            data,
            symbols,
        })
    }

    /// Assemble an image directly from parts, bypassing ELF parsing. Used
    /// by harnesses that feed the translator synthetic text.
    pub fn from_parts(entry: u64, text_vaddr: u64, text: Vec<u8>) -> Self {
        let segments = vec![Segment {
            vaddr: text_vaddr,
            memsz: text.len() as u64,
            filesz: text.len() as u64,
            offset: 0,
            flags: program_header::PF_R | program_header::PF_X,
        }];
        GuestImage {
            entry,
            text_vaddr,
            data: text.clone(),
            text,
            segments,
            symbols: Vec::new(),
        }
    }

    /// Fetch the instruction word at a guest address. The upper halfword is
    /// zero-padded at the very end of `.text`; the decoder only consumes it
    /// for full-size instructions.
    pub fn fetch(&self, addr: u64) -> Option<u32> {
        let off = addr.checked_sub(self.text_vaddr)? as usize;
        if off + 2 > self.text.len() || off % 2 != 0 {
            return None;
        }
        let lo = u16::from_le_bytes([self.text[off], self.text[off + 1]]) as u32;
        let hi = if off + 4 <= self.text.len() {
            u16::from_le_bytes([self.text[off + 2], self.text[off + 3]]) as u32
        } else {
            0
        };
        Some(lo | (hi << 16))
    }

    pub fn contains_text(&self, addr: u64) -> bool {
        addr >= self.text_vaddr && addr < self.text_vaddr + self.text.len() as u64
    }

    /// Address of a named function symbol.
    pub fn addr_of(&self, name: &str) -> Option<u64> {
        self.symbols
            .iter()
            .find(|(_, n)| n == name)
            .map(|&(addr, _)| addr)
    }

    /// Nearest function symbol at or before `addr`, for diagnostics.
    pub fn symbol_at(&self, addr: u64) -> Option<&str> {
        match self.symbols.binary_search_by_key(&addr, |&(a, _)| a) {
            Ok(i) => Some(self.symbols[i].1.as_str()),
            Err(0) => None,
            Err(i) => Some(self.symbols[i - 1].1.as_str()),
        }
    }

    /// Lowest page after every loadable segment; the brk heap starts here.
    pub fn load_end(&self) -> u64 {
        let end = self
            .segments
            .iter()
            .map(|s| s.vaddr + s.memsz)
            .max()
            .unwrap_or(0);
        (end + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
    }
}

/// Size of the guest stack mapping.
const STACK_SIZE: usize = 8 * 1024 * 1024;
/// Size of the brk heap reservation.
const HEAP_SIZE: usize = 256 * 1024 * 1024;

/// The guest's materialized address space: its segments mapped at their
/// linked addresses, a stack, and a brk heap.
pub struct GuestSpace {
    pub stack_top: u64,
    pub initial_sp: u64,
    pub brk_base: u64,
    pub brk: u64,
    pub brk_limit: u64,
    mappings: Vec<(u64, usize)>,
}

impl GuestSpace {
    /// Map every PT_LOAD segment at its linked address, copy file bytes,
    /// zero BSS tails, then map the stack and heap and lay out the initial
    /// stack (argc/argv/envp/auxv, Linux convention).
    pub fn map(image: &GuestImage, args: &[String], env: &[String]) -> Result<Self, EngineError> {
        let mut mappings = Vec::new();

        // Adjacent segments may share a boundary page; map only the pages
        // not already covered by an earlier segment.
        let mut next_free = 0u64;
        for seg in &image.segments {
            let map_start = (seg.vaddr & !(PAGE_SIZE - 1)).max(next_free);
            let map_end = (seg.vaddr + seg.memsz + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
            if map_start < map_end {
                let len = (map_end - map_start) as usize;
                let ptr = unsafe {
                    libc::mmap(
                        map_start as *mut libc::c_void,
                        len,
                        libc::PROT_READ | libc::PROT_WRITE,
                        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
                        -1,
                        0,
                    )
                };
                if ptr == libc::MAP_FAILED || ptr as u64 != map_start {
                    let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
                    if ptr != libc::MAP_FAILED {
                        unsafe { libc::munmap(ptr, len) };
                    }
                    release(&mappings);
                    return Err(EngineError::GuestMap {
                        vaddr: seg.vaddr,
                        errno,
                    });
                }
                mappings.push((map_start, len));
            }
            next_free = next_free.max(map_end);

            let file = &image.data[seg.offset as usize..(seg.offset + seg.filesz) as usize];
            unsafe {
                std::ptr::copy_nonoverlapping(file.as_ptr(), seg.vaddr as *mut u8, file.len());
            }
            // Segment permissions stay RW: the guest never executes its own
            // pages, and the engine writes syscall results through them.
        }

        let brk_base = image.load_end();
        let heap = unsafe {
            libc::mmap(
                brk_base as *mut libc::c_void,
                HEAP_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_FIXED_NOREPLACE,
                -1,
                0,
            )
        };
        if heap == libc::MAP_FAILED {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            release(&mappings);
            return Err(EngineError::GuestMap {
                vaddr: brk_base,
                errno,
            });
        }
        mappings.push((heap as u64, HEAP_SIZE));

        let stack = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                STACK_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if stack == libc::MAP_FAILED {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            release(&mappings);
            return Err(EngineError::GuestMap { vaddr: 0, errno });
        }
        mappings.push((stack as u64, STACK_SIZE));
        let stack_top = stack as u64 + STACK_SIZE as u64;

        let initial_sp = unsafe { build_initial_stack(stack_top, args, env) };

        Ok(GuestSpace {
            stack_top,
            initial_sp,
            brk_base,
            brk: brk_base,
            brk_limit: brk_base + HEAP_SIZE as u64,
            mappings,
        })
    }

    /// Emulate the brk syscall against the reserved heap. Returns the new
    /// program break (the old one if the request cannot be satisfied).
    pub fn set_brk(&mut self, addr: u64) -> u64 {
        if addr >= self.brk_base && addr < self.brk_limit {
            self.brk = addr;
        }
        self.brk
    }
}

impl Drop for GuestSpace {
    fn drop(&mut self) {
        release(&self.mappings);
    }
}

fn release(mappings: &[(u64, usize)]) {
    for &(addr, len) in mappings {
        unsafe {
            libc::munmap(addr as *mut libc::c_void, len);
        }
    }
}

/// Lay out argc/argv/envp/auxv below `stack_top`; returns the initial sp.
///
/// # Safety
/// The stack mapping under `stack_top` must be live and writable.
unsafe fn build_initial_stack(stack_top: u64, args: &[String], env: &[String]) -> u64 {
    // String bytes first, then the pointer vectors, 16-byte aligned.
    let mut cursor = stack_top;
    let mut arg_ptrs = Vec::with_capacity(args.len());
    let mut env_ptrs = Vec::with_capacity(env.len());

    let push_str = |cursor: &mut u64, s: &str| -> u64 {
        *cursor -= s.len() as u64 + 1;
        unsafe {
            std::ptr::copy_nonoverlapping(s.as_ptr(), *cursor as *mut u8, s.len());
            *(*cursor as *mut u8).add(s.len()) = 0;
        }
        *cursor
    };

    for s in args {
        arg_ptrs.push(push_str(&mut cursor, s));
    }
    for s in env {
        env_ptrs.push(push_str(&mut cursor, s));
    }

    // argc + argv[] + NULL + envp[] + NULL + auxv (2 pairs)
    let words = 1 + arg_ptrs.len() + 1 + env_ptrs.len() + 1 + 4;
    cursor &= !0xf;
    cursor -= (words as u64) * 8;
    cursor &= !0xf;

    let mut p = cursor as *mut u64;
    unsafe {
        *p = args.len() as u64;
        p = p.add(1);
        for &a in &arg_ptrs {
            *p = a;
            p = p.add(1);
        }
        *p = 0;
        p = p.add(1);
        for &e in &env_ptrs {
            *p = e;
            p = p.add(1);
        }
        *p = 0;
        p = p.add(1);
        *p = 6; // AT_PAGESZ
        p = p.add(1);
        *p = PAGE_SIZE;
        p = p.add(1);
        *p = 0; // AT_NULL
        p = p.add(1);
        *p = 0;
    }

    cursor
}
