//! A QIR region: the compilation unit. Owns every block and instruction
//! created within it; all of it is discarded together once emission is
//! done. Grounded on `dbt/qjit/qir.h`'s `Region`/`Block`/`StateInfo`/
//! `VRegsInfo`.

use super::inst::Inst;
use super::operand::{RegN, VType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstId(pub u32);

pub struct Block {
    pub id: BlockId,
    pub insns: Vec<InstId>,
    pub succs: Vec<BlockId>,
    pub preds: Vec<BlockId>,
}

/// Describes one guest register's home in `CpuState`: a global QIR
/// virtual register pre-assigned to a memory slot. Grounded on
/// `dbt/qjit/qir.h`'s `StateReg`.
#[derive(Debug, Clone, Copy)]
pub struct StateReg {
    pub state_offs: u16,
    pub ty: VType,
    pub name: &'static str,
}

pub struct StateInfo {
    pub regs: Vec<StateReg>,
}

/// Tracks the region's virtual registers: the first `n_globals` map 1:1
/// onto `StateInfo`'s guest-register slots; everything past that is a
/// region-local temporary introduced by the builder.
pub struct VRegsInfo<'a> {
    glob_info: &'a StateInfo,
    loc_info: Vec<VType>,
}

impl<'a> VRegsInfo<'a> {
    pub fn new(glob_info: &'a StateInfo) -> Self {
        VRegsInfo { glob_info, loc_info: Vec::new() }
    }

    pub fn num_globals(&self) -> RegN {
        self.glob_info.regs.len() as RegN
    }

    pub fn num_all(&self) -> RegN {
        self.num_globals() + self.loc_info.len() as RegN
    }

    pub fn is_global(&self, idx: RegN) -> bool {
        idx < self.num_globals()
    }

    pub fn global_info(&self, idx: RegN) -> &StateReg {
        &self.glob_info.regs[idx as usize]
    }

    pub fn local_type(&self, idx: RegN) -> VType {
        self.loc_info[(idx - self.num_globals()) as usize]
    }

    pub fn add_local(&mut self, ty: VType) -> RegN {
        let idx = self.num_globals() + self.loc_info.len() as RegN;
        self.loc_info.push(ty);
        idx
    }
}

pub struct Region<'a> {
    blocks: Vec<Block>,
    insns: Vec<Inst>,
    pub vregs_info: VRegsInfo<'a>,
}

impl<'a> Region<'a> {
    pub fn new(state_info: &'a StateInfo) -> Self {
        Region {
            blocks: Vec::new(),
            insns: Vec::new(),
            vregs_info: VRegsInfo::new(state_info),
        }
    }

    pub fn create_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block { id, insns: Vec::new(), succs: Vec::new(), preds: Vec::new() });
        id
    }

    pub fn create_inst(&mut self, block: BlockId, inst: Inst) -> InstId {
        let id = InstId(self.insns.len() as u32);
        self.insns.push(inst);
        self.block_mut(block).insns.push(id);
        id
    }

    /// Appends a new instruction to storage without attaching it to any
    /// block's instruction list; the caller places it via
    /// `set_block_insns`. Used by legalisation passes that need to
    /// splice instructions into the middle of a block.
    pub fn create_inst_detached(&mut self, inst: Inst) -> InstId {
        let id = InstId(self.insns.len() as u32);
        self.insns.push(inst);
        id
    }

    pub fn set_block_insns(&mut self, block: BlockId, insns: Vec<InstId>) {
        self.block_mut(block).insns = insns;
    }

    pub fn add_succ(&mut self, from: BlockId, to: BlockId) {
        self.block_mut(from).succs.push(to);
        self.block_mut(to).preds.push(from);
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.0 as usize]
    }

    pub fn inst(&self, id: InstId) -> &Inst {
        &self.insns[id.0 as usize]
    }

    pub fn inst_mut(&mut self, id: InstId) -> &mut Inst {
        &mut self.insns[id.0 as usize]
    }

    pub fn num_blocks(&self) -> u32 {
        self.blocks.len() as u32
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter()
    }
}
