use rvdbt_common::GAddr;

/// Error kinds the core recognises. Translated guest code never returns
/// one of these directly — it raises traps that the execution loop
/// observes via `CpuState::trapno`. `DbtError` is the vocabulary for the
/// few seams that can report a recoverable condition: opening a profile
/// file, and (in `rvdbt-aot`) loading an AOT shared object. Everything
/// else is a `panic!`/`unreachable!()`.
#[derive(Debug, thiserror::Error)]
pub enum DbtError {
    #[error("illegal instruction at {0}")]
    IllegalInsn(GAddr),

    #[error("unaligned branch target {0}")]
    UnalignedIp(GAddr),

    #[error("guest ebreak at {0}")]
    Ebreak(GAddr),

    #[error("guest ecall at {0}")]
    Ecall(GAddr),

    #[error("segfault inside guest window at pc={pc}, fault={fault}")]
    GuestSegv { pc: GAddr, fault: usize },

    #[error("segfault outside guest window at fault={fault:#x}")]
    HostSegv { fault: usize },

    #[error("translation cache arena exhausted: {0}")]
    ArenaExhausted(&'static str),

    #[error("profile checksum mismatch for {0}")]
    ProfileMismatch(String),

    #[error("failed to load AOT object: {0}")]
    AotLoadFailure(String),
}
