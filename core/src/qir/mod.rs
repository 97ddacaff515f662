//! The Quick IR (QIR): the small SSA-ish intermediate representation the
//! rv32 translator emits and QSel/regalloc/emit consume.
//!
//! Grounded on `dbt/qjit/qir.h`, `dbt/qjit/qir_ops.h`, `dbt/qjit/qir_builder.h`.
//! Intrusive linked lists in the original become arena-owned index
//! vectors here (`Region` owns `Vec<Block>`/`Vec<Inst>`, `Block`/`Inst`
//! are referenced by index), per the workspace's no-raw-intrusive-list
//! policy; instruction dispatch is a tagged enum rather than a class
//! hierarchy with vtables.

pub mod operand;
pub mod inst;
pub mod region;
pub mod builder;

pub use operand::{RegN, VOperand, VSign, VType};
pub use inst::{CondCode, Inst, OpFlags};
pub use region::{Block, BlockId, InstId, Region, StateInfo, StateReg, VRegsInfo};
pub use builder::Builder;
