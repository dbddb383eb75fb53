//! graft - dynamic binary instrumentation for static RV64GC binaries.
//!
//! The engine translates a guest ELF, block by block, into an executable
//! code cache and runs it from there, weaving user instrumentation around
//! blocks and instructions. Control never returns to the guest's original
//! `.text`; transparency fixups preserve the guest's view of its own PC.

pub mod cache;
pub mod callbacks;
pub mod config;
pub mod elf;
pub mod engine;
pub mod error;
pub mod inline;
pub mod riscv;
pub mod translate;

// Re-export the types a front-end touches.
pub use callbacks::{InsnInfo, Mode, Phase};
pub use config::{EngineConfig, UnknownSyscall};
pub use engine::{Engine, EngineStats};
pub use error::EngineError;
