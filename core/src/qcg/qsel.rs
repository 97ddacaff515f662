//! Operand legalisation: rewrites QIR in place so every instruction
//! matches the 2-address shape the x86-64 encoder expects. Grounded on
//! `dbt/qjit/qcg/qsel.cpp`.
//!
//! x86's binops are `dst op= src`: `Bin{op,d,a,b}` is only directly
//! encodable when `d` and `a` are the same virtual register. When they
//! differ, a `mov d, a` is inserted ahead of the op and the op's first
//! input becomes `d` — unless `b` itself aliases `d`, in which case `b`
//! is cloned into a fresh temporary first so the `mov` doesn't clobber
//! it before it's read.

use crate::qir::inst::{CondCode, Inst};
use crate::qir::operand::VOperand;
use crate::qir::region::{InstId, Region};

fn aliases(a: VOperand, b: VOperand) -> bool {
    match (a, b) {
        (VOperand::VGpr { reg: ra, .. }, VOperand::VGpr { reg: rb, .. }) => ra == rb,
        (VOperand::PGpr { reg: ra, .. }, VOperand::PGpr { reg: rb, .. }) => ra == rb,
        _ => false,
    }
}

/// `setcc`/`brcc` require `a` in a register; x0 (`gprop(0)`'s `Const`)
/// can appear on either side of a guest comparison (`beq zero, t0, L`,
/// `slti rd, zero, imm`). Swap operands and invert the comparison with
/// `CondCode::swap()` when only `b` is a register; if neither is (both
/// sides are x0), materialise `a` into a fresh temporary.
fn canonicalise_cmp(
    region: &mut Region<'_>,
    new_insns: &mut Vec<InstId>,
    mut cc: CondCode,
    mut a: VOperand,
    mut b: VOperand,
) -> (CondCode, VOperand, VOperand) {
    if !a.is_vgpr() && b.is_vgpr() {
        std::mem::swap(&mut a, &mut b);
        cc = cc.swap();
    }
    if !a.is_vgpr() {
        let ty = a.ty();
        let tmp = VOperand::VGpr { ty, reg: region.vregs_info.add_local(ty) };
        new_insns.push(region.create_inst_detached(Inst::Mov { d: tmp, s: a }));
        a = tmp;
    }
    (cc, a, b)
}

pub fn legalize(region: &mut Region<'_>) {
    let block_ids: Vec<_> = region.blocks().map(|b| b.id).collect();
    for block in block_ids {
        let old_insns = region.block(block).insns.clone();
        let mut new_insns = Vec::with_capacity(old_insns.len());

        for inst_id in old_insns {
            let inst = region.inst(inst_id).clone();
            match inst {
                Inst::Bin { op, d, a, b } => {
                    let mut a = a;
                    let mut b = b;
                    if aliases(b, d) && !aliases(a, d) {
                        let ty = b.ty();
                        let clone_reg = region.vregs_info.add_local(ty);
                        let clone = VOperand::VGpr { ty, reg: clone_reg };
                        new_insns.push(region.create_inst_detached(Inst::Mov { d: clone, s: b }));
                        b = clone;
                    }
                    if !aliases(a, d) {
                        new_insns.push(region.create_inst_detached(Inst::Mov { d, s: a }));
                        a = d;
                    }
                    new_insns.push(region.create_inst_detached(Inst::Bin { op, d, a, b }));
                }
                Inst::Setcc { cc, d, a, b } => {
                    let (cc, a, b) = canonicalise_cmp(region, &mut new_insns, cc, a, b);
                    new_insns.push(region.create_inst_detached(Inst::Setcc { cc, d, a, b }));
                }
                Inst::Brcc { cc, a, b, taken, fallthrough } => {
                    let (cc, a, b) = canonicalise_cmp(region, &mut new_insns, cc, a, b);
                    new_insns.push(region.create_inst_detached(Inst::Brcc { cc, a, b, taken, fallthrough }));
                }
                other => {
                    new_insns.push(region.create_inst_detached(other));
                }
            }
        }

        region.set_block_insns(block, new_insns);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qir::inst::BinOp;
    use crate::qir::operand::VType;
    use crate::qir::region::StateInfo;

    #[test]
    fn mismatched_dest_gets_a_mov() {
        let info = StateInfo { regs: vec![] };
        let mut region = Region::new(&info);
        let bb = region.create_block();
        let d = VOperand::VGpr { ty: VType::I32, reg: 0 };
        let a = VOperand::VGpr { ty: VType::I32, reg: 1 };
        let b = VOperand::VGpr { ty: VType::I32, reg: 2 };
        let id = region.create_inst(bb, Inst::Bin { op: BinOp::Add, d, a, b });
        region.set_block_insns(bb, vec![id]);

        legalize(&mut region);

        let insns = &region.block(bb).insns;
        assert_eq!(insns.len(), 2);
        assert!(matches!(region.inst(insns[0]), Inst::Mov { .. }));
        match region.inst(insns[1]) {
            Inst::Bin { a, .. } => assert!(aliases(*a, d)),
            other => panic!("expected Bin, got {other:?}"),
        }
    }

    #[test]
    fn already_2_address_is_untouched() {
        let info = StateInfo { regs: vec![] };
        let mut region = Region::new(&info);
        let bb = region.create_block();
        let d = VOperand::VGpr { ty: VType::I32, reg: 0 };
        let b = VOperand::VGpr { ty: VType::I32, reg: 1 };
        let id = region.create_inst(bb, Inst::Bin { op: BinOp::Add, d, a: d, b });
        region.set_block_insns(bb, vec![id]);

        legalize(&mut region);

        assert_eq!(region.block(bb).insns.len(), 1);
    }

    #[test]
    fn b_aliasing_dest_is_cloned_first() {
        let info = StateInfo { regs: vec![] };
        let mut region = Region::new(&info);
        let bb = region.create_block();
        let d = VOperand::VGpr { ty: VType::I32, reg: 0 };
        let a = VOperand::VGpr { ty: VType::I32, reg: 1 };
        let id = region.create_inst(bb, Inst::Bin { op: BinOp::Add, d, a, b: d });
        region.set_block_insns(bb, vec![id]);

        legalize(&mut region);

        let insns = &region.block(bb).insns;
        assert_eq!(insns.len(), 3);
        assert!(matches!(region.inst(insns[0]), Inst::Mov { .. }));
        assert!(matches!(region.inst(insns[1]), Inst::Mov { .. }));
    }

    #[test]
    fn brcc_with_const_lhs_swaps_in_the_register_operand() {
        let info = StateInfo { regs: vec![] };
        let mut region = Region::new(&info);
        let bb = region.create_block();
        let taken = region.create_block();
        let fallthrough = region.create_block();
        let zero = VOperand::Const { ty: VType::I32, val: 0 };
        let t0 = VOperand::VGpr { ty: VType::I32, reg: 1 };
        let id = region.create_inst(bb, Inst::Brcc { cc: CondCode::Eq, a: zero, b: t0, taken, fallthrough });
        region.set_block_insns(bb, vec![id]);

        legalize(&mut region);

        let insns = &region.block(bb).insns;
        assert_eq!(insns.len(), 1);
        match region.inst(insns[0]) {
            Inst::Brcc { cc, a, b, .. } => {
                assert_eq!(*cc, CondCode::Eq.swap());
                assert_eq!(*a, t0);
                assert_eq!(*b, zero);
            }
            other => panic!("expected Brcc, got {other:?}"),
        }
    }

    #[test]
    fn setcc_with_const_both_sides_materialises_a_temporary() {
        let info = StateInfo { regs: vec![] };
        let mut region = Region::new(&info);
        let bb = region.create_block();
        let d = VOperand::VGpr { ty: VType::I32, reg: 0 };
        let zero = VOperand::Const { ty: VType::I32, val: 0 };
        let one = VOperand::Const { ty: VType::I32, val: 1 };
        let id = region.create_inst(bb, Inst::Setcc { cc: CondCode::Lt, d, a: zero, b: one });
        region.set_block_insns(bb, vec![id]);

        legalize(&mut region);

        let insns = &region.block(bb).insns;
        assert_eq!(insns.len(), 2);
        assert!(matches!(region.inst(insns[0]), Inst::Mov { .. }));
        match region.inst(insns[1]) {
            Inst::Setcc { cc, a, b, .. } => {
                assert_eq!(*cc, CondCode::Lt);
                assert!(a.is_vgpr());
                assert_eq!(*b, one);
            }
            other => panic!("expected Setcc, got {other:?}"),
        }
    }
}
