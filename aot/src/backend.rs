//! The AOT pipeline's choice of code generator.
//!
//! The original system can target either its JIT-shared `qmc` backend
//! or a standalone LLVM backend for ahead-of-time compiles. Only the
//! former exists here: LLVM is a build-time absence, not a runtime
//! error path, so there is nothing to select at `CompilerBackend::Llvm`
//! and no variant for it.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilerBackend {
    Qcg,
}

impl Default for CompilerBackend {
    fn default() -> Self {
        CompilerBackend::Qcg
    }
}
