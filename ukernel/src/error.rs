//! Error vocabulary for the collaborator surfaces this crate builds on
//! top of `rvdbt-core`: ELF loading and guest filesystem path resolution.
//! The syscall dispatcher itself does not use this — an unsupported
//! syscall number is a `panic!`, per the surface's "unknown numbers
//! panic with the syscall name" contract.

#[derive(Debug, thiserror::Error)]
pub enum UkernelError {
    #[error("failed to parse guest ELF: {0}")]
    ElfParse(String),

    #[error("guest ELF has no PT_LOAD segments")]
    NoLoadSegments,

    #[error("guest path escapes fsroot: {0}")]
    PathEscape(String),
}
