//! The QIR → x86-64 pipeline: operand legalisation (QSel), linear-scan
//! register allocation, and the byte-level instruction emitter. Also
//! home to the fixed-register ABI (`jitabi`) and the patchable branch
//! slots the emitter and the lazy-link stub share.
//!
//! Grounded on `dbt/qjit/qcg/` (the original splits this the same way:
//! `qsel.cpp`, `regalloc.cpp`, `qcg.cpp`'s `Emit_*` table).

pub mod jitabi;
pub mod qsel;
pub mod regalloc;
pub mod emit;
pub mod branchslot;

pub use emit::{EmittedCode, Emitter};
pub use regalloc::allocate;
