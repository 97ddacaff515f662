//! Linear-scan register allocation over legalised QIR.
//!
//! Walks the region's blocks in creation order (which, for the single
//! basic-block-per-region translator in `crate::translate`, is already
//! control-flow order) and replaces every `VGpr` operand with a `PGpr`
//! or a `Slot`. Grounded on `dbt/qjit/regalloc.cpp`: globals live in
//! guest-state memory and are filled into a physical register on first
//! use; locals are DEAD until their first def and pick a spill-frame
//! slot only the first time they are evicted; a `call_op` (`hcall`)
//! spills every caller-clobbered physical register and forces globals
//! back to memory.

use std::collections::HashMap;

use super::jitabi::{gpr_call_clobber, gpr_pool, PhysReg, RegMask, QCG_SPILL_FRAME_SIZE};
use crate::qir::inst::Inst;
use crate::qir::operand::{RegN, VOperand, VType};
use crate::qir::region::Region;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Loc {
    /// Not yet defined (locals only, before their first write).
    Undefined,
    /// Resident in a physical register.
    Preg(PhysReg),
    /// Backed by memory: the global's state slot, or a local's
    /// spill-frame slot once one has been assigned.
    Mem,
}

struct RegFile {
    pool: RegMask,
    loc: Vec<Loc>,
    local_offset: HashMap<RegN, u16>,
    owner: [Option<RegN>; 16],
    dirty: [bool; 16],
    last_used: [u64; 16],
    tick: u64,
    next_local_offset: u16,
    spill_code: Vec<Inst>,
}

impl RegFile {
    fn new(pool: RegMask, num_vregs: usize) -> Self {
        RegFile {
            pool,
            loc: vec![Loc::Undefined; num_vregs],
            local_offset: HashMap::new(),
            owner: [None; 16],
            dirty: [false; 16],
            last_used: [0; 16],
            tick: 0,
            next_local_offset: 0,
            spill_code: Vec::new(),
        }
    }

    fn touch(&mut self, p: PhysReg) {
        self.tick += 1;
        self.last_used[p as usize] = self.tick;
    }

    fn local_slot(&mut self, reg: RegN, ty: VType) -> VOperand {
        let size = ty.size() as u16;
        let offset = *self.local_offset.entry(reg).or_insert_with(|| {
            let align = size.max(1);
            let off = (self.next_local_offset + align - 1) / align * align;
            let next = off + size as u16;
            assert!(
                (next as u32) <= QCG_SPILL_FRAME_SIZE,
                "qcg: local spill frame exceeds QCG_SPILL_FRAME_SIZE"
            );
            self.next_local_offset = next;
            off
        });
        VOperand::Slot { ty, is_global: false, offset }
    }

    /// Writes `p`'s current occupant back to memory (if it holds one)
    /// and frees the physical register.
    fn spill_preg(&mut self, p: PhysReg, region: &Region<'_>) {
        let Some(reg) = self.owner[p as usize] else { return };
        if self.dirty[p as usize] {
            let is_global = region.vregs_info.is_global(reg);
            let slot = if is_global {
                let info = region.vregs_info.global_info(reg);
                VOperand::Slot { ty: info.ty, is_global: true, offset: info.state_offs }
            } else {
                let ty = region.vregs_info.local_type(reg);
                self.local_slot(reg, ty)
            };
            let ty = slot.ty();
            self.spill_code.push(Inst::Mov { d: slot, s: VOperand::PGpr { ty, reg: p as RegN } });
        }
        self.loc[reg as usize] = Loc::Mem;
        self.owner[p as usize] = None;
        self.dirty[p as usize] = false;
    }

    /// Picks a free physical register from `pool`, evicting the least
    /// recently used occupant if the pool is fully committed.
    fn acquire(&mut self, pool: RegMask, region: &Region<'_>) -> PhysReg {
        for p in 0..16u8 {
            if pool.test(p) && self.owner[p as usize].is_none() {
                return p;
            }
        }
        let victim = (0..16u8)
            .filter(|&p| pool.test(p) && self.owner[p as usize].is_some())
            .min_by_key(|&p| self.last_used[p as usize])
            .expect("register pool is non-empty");
        self.spill_preg(victim, region);
        victim
    }

    /// Ensures `operand` (an input) is resident in a physical register;
    /// constants pass through unchanged.
    fn fill(&mut self, operand: VOperand, region: &Region<'_>) -> VOperand {
        let VOperand::VGpr { ty, reg } = operand else { return operand };
        match self.loc[reg as usize] {
            Loc::Preg(p) => {
                self.touch(p);
                VOperand::PGpr { ty, reg: p as RegN }
            }
            Loc::Mem => {
                let p = self.acquire(self.pool, region);
                let src = if region.vregs_info.is_global(reg) {
                    let info = region.vregs_info.global_info(reg);
                    VOperand::Slot { ty: info.ty, is_global: true, offset: info.state_offs }
                } else {
                    self.local_slot(reg, ty)
                };
                self.spill_code.push(Inst::Mov { d: VOperand::PGpr { ty, reg: p as RegN }, s: src });
                self.owner[p as usize] = Some(reg);
                self.loc[reg as usize] = Loc::Preg(p);
                self.dirty[p as usize] = false;
                self.touch(p);
                VOperand::PGpr { ty, reg: p as RegN }
            }
            Loc::Undefined => unreachable!("qcg: read of vreg {reg} before its first definition"),
        }
    }

    /// Assigns a physical register to hold a freshly-produced value,
    /// reusing an input's register when QSel already aliased them.
    fn assign_output(&mut self, operand: VOperand, region: &Region<'_>) -> VOperand {
        let VOperand::VGpr { ty, reg } = operand else {
            panic!("qcg: non-vgpr output operand reached regalloc")
        };
        let p = match self.loc[reg as usize] {
            Loc::Preg(p) if self.owner[p as usize] == Some(reg) => p,
            _ => self.acquire(self.pool, region),
        };
        self.owner[p as usize] = Some(reg);
        self.loc[reg as usize] = Loc::Preg(p);
        self.dirty[p as usize] = true;
        self.touch(p);
        VOperand::PGpr { ty, reg: p as RegN }
    }

    /// Writes every global currently resident in a register back to its
    /// state slot. Used before `gbr`/`gbrind` (region exit) and as the
    /// first step of `hcall`'s clobber handling.
    fn force_globals_to_memory(&mut self, region: &Region<'_>) {
        for reg in 0..region.vregs_info.num_globals() {
            if let Loc::Preg(p) = self.loc[reg as usize] {
                if self.dirty[p as usize] {
                    self.spill_preg(p, region);
                } else {
                    self.owner[p as usize] = None;
                    self.loc[reg as usize] = Loc::Mem;
                }
            }
        }
    }

    fn spill_call_clobbered(&mut self, region: &Region<'_>) {
        for p in 0..16u8 {
            if gpr_call_clobber().test(p) && self.owner[p as usize].is_some() {
                self.spill_preg(p, region);
            }
        }
    }

    fn take_spill_code(&mut self) -> Vec<Inst> {
        std::mem::take(&mut self.spill_code)
    }
}

/// Runs register allocation over a legalised (post-QSel) region in
/// place. `zero_mmu_base` controls whether `MEMBASE` is carved out of
/// the allocatable pool.
pub fn allocate(region: &mut Region<'_>, zero_mmu_base: bool) {
    let pool = gpr_pool(zero_mmu_base);
    let num_vregs = region.vregs_info.num_all() as usize;
    let mut rf = RegFile::new(pool, num_vregs);

    let block_ids: Vec<_> = region.blocks().map(|b| b.id).collect();
    for block in block_ids {
        let old_insns = region.block(block).insns.clone();
        let mut new_insns = Vec::with_capacity(old_insns.len());

        for inst_id in old_insns {
            let inst = region.inst(inst_id).clone();
            let lowered = match inst {
                Inst::Mov { d, s } => {
                    let s = rf.fill(s, region);
                    let d = rf.assign_output(d, region);
                    Inst::Mov { d, s }
                }
                Inst::Bin { op, d, a, b } => {
                    let a = rf.fill(a, region);
                    let b = rf.fill(b, region);
                    let d = rf.assign_output(d, region);
                    Inst::Bin { op, d, a, b }
                }
                Inst::Setcc { cc, d, a, b } => {
                    let a = rf.fill(a, region);
                    let b = rf.fill(b, region);
                    let d = rf.assign_output(d, region);
                    Inst::Setcc { cc, d, a, b }
                }
                Inst::Br { target } => Inst::Br { target },
                Inst::Brcc { cc, a, b, taken, fallthrough } => {
                    let a = rf.fill(a, region);
                    let b = rf.fill(b, region);
                    Inst::Brcc { cc, a, b, taken, fallthrough }
                }
                Inst::Gbr { tpc } => {
                    rf.force_globals_to_memory(region);
                    Inst::Gbr { tpc }
                }
                Inst::Gbrind { tpc } => {
                    let tpc = rf.fill(tpc, region);
                    rf.force_globals_to_memory(region);
                    Inst::Gbrind { tpc }
                }
                Inst::VmLoad { sz, sgn, d, addr } => {
                    let addr = rf.fill(addr, region);
                    let d = rf.assign_output(d, region);
                    Inst::VmLoad { sz, sgn, d, addr }
                }
                Inst::VmStore { sz, sgn, addr, val } => {
                    let addr = rf.fill(addr, region);
                    let val = rf.fill(val, region);
                    Inst::VmStore { sz, sgn, addr, val }
                }
                Inst::Hcall { stub_id, arg } => {
                    let arg = rf.fill(arg, region);
                    rf.force_globals_to_memory(region);
                    rf.spill_call_clobbered(region);
                    Inst::Hcall { stub_id, arg }
                }
            };

            for spill_inst in rf.take_spill_code() {
                new_insns.push(region.create_inst_detached(spill_inst));
            }
            new_insns.push(region.create_inst_detached(lowered));
        }

        region.set_block_insns(block, new_insns);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qir::inst::BinOp;
    use crate::qir::operand::VType;
    use crate::qir::region::{Region, StateInfo, StateReg};

    fn state_info() -> StateInfo {
        StateInfo { regs: vec![StateReg { state_offs: 0, ty: VType::I32, name: "x1" }] }
    }

    #[test]
    fn output_reuses_aliased_input_register() {
        let info = state_info();
        let mut region = Region::new(&info);
        let local = region.vregs_info.add_local(VType::I32);
        let bb = region.create_block();
        let d = VOperand::VGpr { ty: VType::I32, reg: local };
        let a = VOperand::VGpr { ty: VType::I32, reg: local };
        let b = VOperand::Const { ty: VType::I32, val: 4 };
        let mov_id = region.create_inst(bb, Inst::Mov { d: a, s: b });
        let bin_id = region.create_inst(bb, Inst::Bin { op: BinOp::Add, d, a, b });
        region.set_block_insns(bb, vec![mov_id, bin_id]);

        allocate(&mut region, false);

        let insns: Vec<_> = region.block(bb).insns.iter().map(|id| region.inst(*id).clone()).collect();
        let Inst::Bin { d, a, .. } = insns.last().unwrap() else { panic!("expected bin") };
        assert_eq!(d.as_const(), None);
        assert!(matches!(d, VOperand::PGpr { .. }));
        assert_eq!(a, d);
    }

    #[test]
    fn global_is_filled_from_state_then_synced_at_gbr() {
        let info = state_info();
        let mut region = Region::new(&info);
        let bb = region.create_block();
        let g = VOperand::VGpr { ty: VType::I32, reg: 0 };
        let one = VOperand::Const { ty: VType::I32, val: 1 };
        let bin_id = region.create_inst(bb, Inst::Bin { op: BinOp::Add, d: g, a: g, b: one });
        let gbr_id = region.create_inst(bb, Inst::Gbr { tpc: 0x100 });
        region.set_block_insns(bb, vec![bin_id, gbr_id]);

        allocate(&mut region, false);

        let insns: Vec<_> = region.block(bb).insns.iter().map(|id| region.inst(*id).clone()).collect();
        // fill-from-state, bin, spill-to-state, gbr
        assert!(insns.iter().any(|i| matches!(i, Inst::Mov { s: VOperand::Slot { is_global: true, .. }, .. })));
        assert!(insns.iter().any(|i| matches!(i, Inst::Mov { d: VOperand::Slot { is_global: true, .. }, .. })));
        assert!(matches!(insns.last().unwrap(), Inst::Gbr { tpc: 0x100 }));
    }

    #[test]
    fn every_operand_is_post_ra_after_allocation() {
        let info = state_info();
        let mut region = Region::new(&info);
        let local = region.vregs_info.add_local(VType::I32);
        let bb = region.create_block();
        let d = VOperand::VGpr { ty: VType::I32, reg: local };
        let s = VOperand::Const { ty: VType::I32, val: 7 };
        let mov_id = region.create_inst(bb, Inst::Mov { d, s });
        let gbr_id = region.create_inst(bb, Inst::Gbr { tpc: 0 });
        region.set_block_insns(bb, vec![mov_id, gbr_id]);

        allocate(&mut region, false);

        for id in region.block(bb).insns.clone() {
            for op in region.inst(id).inputs() {
                assert!(op.is_post_ra());
            }
            if let Some(op) = region.inst(id).output() {
                assert!(op.is_post_ra());
            }
        }
    }
}
