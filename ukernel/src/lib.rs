//! The micro-kernel collaborator: just enough of a Linux rv32 user-mode
//! environment to let `rvdbt-core` run a real guest binary — ELF
//! loading, auxv construction, filesystem sandboxing, and the syscall
//! subset named in the syscall surface.
//!
//! Everything here is a thin, fallible wrapper around the host's own
//! libc; it makes no attempt to emulate a full kernel.

pub mod elf_loader;
pub mod error;
pub mod fsmanager;
pub mod syscall;

pub use error::UkernelError;
