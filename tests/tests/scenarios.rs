//! Multi-module end-to-end scenarios: each test wires together the real
//! collaborators (`rvdbt-core`'s tcache/execute/profile, `rvdbt-ukernel`'s
//! syscalls, `rvdbt-aot`'s driver/writer) the way `elfrun`/`elfaot` do,
//! instead of exercising any one of them in isolation.

use object::{Object, ObjectSymbol};

use rvdbt_aot::driver::compile_image;
use rvdbt_aot::writer::write_aot_object;
use rvdbt_common::GAddr;
use rvdbt_core::aspace::{AddressSpace, ZERO_MMU_BASE};
use rvdbt_core::execute::execute;
use rvdbt_core::profile::ProfileStore;
use rvdbt_core::runtime::StubTable;
use rvdbt_core::state::{guest_state_info, CpuState, TrapNo};
use rvdbt_core::tcache::TCache;
use rvdbt_ukernel::fsmanager::FsManager;
use rvdbt_ukernel::syscall::Syscalls;

/// Hand-rolled rv32i encoders, grounded field-for-field on
/// `rvdbt_core::decode`'s bitfield layout (the decoder and the encoders
/// here are each other's mirror image).
mod asm {
    fn r(opcode: u32, rd: u8, funct3: u32, rs1: u8, rs2: u8, funct7: u32) -> u32 {
        opcode | ((rd as u32) << 7) | (funct3 << 12) | ((rs1 as u32) << 15) | ((rs2 as u32) << 20) | (funct7 << 25)
    }

    fn i(opcode: u32, rd: u8, funct3: u32, rs1: u8, imm: i32) -> u32 {
        opcode | ((rd as u32) << 7) | (funct3 << 12) | ((rs1 as u32) << 15) | ((imm as u32 & 0xfff) << 20)
    }

    fn b(opcode: u32, funct3: u32, rs1: u8, rs2: u8, imm: i32) -> u32 {
        let imm = imm as u32;
        let b11 = (imm >> 11) & 1;
        let b12 = (imm >> 12) & 1;
        let b4_1 = (imm >> 1) & 0xf;
        let b10_5 = (imm >> 5) & 0x3f;
        opcode | (b11 << 7) | (b4_1 << 8) | (funct3 << 12) | ((rs1 as u32) << 15) | ((rs2 as u32) << 20) | (b10_5 << 25) | (b12 << 31)
    }

    pub fn addi(rd: u8, rs1: u8, imm: i32) -> u32 {
        i(0b0010011, rd, 0b000, rs1, imm)
    }

    pub fn add(rd: u8, rs1: u8, rs2: u8) -> u32 {
        r(0b0110011, rd, 0b000, rs1, rs2, 0b0000000)
    }

    pub fn lui(rd: u8, imm: u32) -> u32 {
        0b0110111 | ((rd as u32) << 7) | (imm & 0xFFFFF000)
    }

    pub fn lw(rd: u8, rs1: u8, imm: i32) -> u32 {
        i(0b0000011, rd, 0b010, rs1, imm)
    }

    pub fn bne(rs1: u8, rs2: u8, imm: i32) -> u32 {
        b(0b1100011, 0b001, rs1, rs2, imm)
    }

    pub fn jalr(rd: u8, rs1: u8, imm: i32) -> u32 {
        i(0b1100111, rd, 0b000, rs1, imm)
    }

    pub fn ecall() -> u32 {
        0b000000000000_00000_000_00000_1110011
    }
}

fn scratch_dir(tag: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("rvdbt-e2e-{tag}-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// `sum = 1 + 2 + ... + 10` via a backward-branching loop, exiting
/// through `ecall` with the result in `a0`. Exercises the full
/// translate -> qsel -> regalloc -> emit -> trampoline pipeline across
/// several linked blocks in one `execute` call.
fn sum_loop_program() -> Vec<u32> {
    vec![
        asm::addi(5, 0, 1),   // 0:  i = 1
        asm::addi(6, 0, 0),   // 4:  sum = 0
        asm::addi(7, 0, 11),  // 8:  limit = 11
        asm::add(6, 6, 5),    // 12: sum += i      <- loop
        asm::addi(5, 5, 1),   // 16: i += 1
        asm::bne(5, 7, -8),   // 20: if i != limit goto loop
        asm::addi(10, 6, 0),  // 24: a0 = sum
        asm::ecall(),         // 28
    ]
}

fn read_u32_over(words: &[u32]) -> impl Fn(u32) -> u32 + '_ {
    move |ip: u32| words[(ip / 4) as usize]
}

#[test]
fn sum_loop_exits_with_a0_55() {
    let words = sum_loop_program();
    let tcache = TCache::new();
    let stubs = StubTable::new();
    let state_info = guest_state_info();
    let mut state = CpuState::new();

    execute(&mut state, &tcache, &state_info, &stubs, ZERO_MMU_BASE, read_u32_over(&words));

    assert_eq!(state.trapno, TrapNo::Ecall);
    assert_eq!(state.gpr[10], 55);
    assert_eq!(state.ip, 28);
}

#[test]
fn second_run_reuses_every_block_without_recompiling() {
    let words = sum_loop_program();
    let tcache = TCache::new();
    let stubs = StubTable::new();
    let state_info = guest_state_info();
    let mut state = CpuState::new();

    execute(&mut state, &tcache, &state_info, &stubs, ZERO_MMU_BASE, read_u32_over(&words));
    assert_eq!(state.gpr[10], 55);

    let entry_tb = tcache.lookup(0).unwrap().as_ptr();
    let loop_tb = tcache.lookup(12).unwrap().as_ptr();
    let exit_tb = tcache.lookup(24).unwrap().as_ptr();

    state.ip = 0;
    state.clear_trap();
    execute(&mut state, &tcache, &state_info, &stubs, ZERO_MMU_BASE, read_u32_over(&words));
    assert_eq!(state.gpr[10], 55);

    assert_eq!(tcache.lookup(0).unwrap().as_ptr(), entry_tb);
    assert_eq!(tcache.lookup(12).unwrap().as_ptr(), loop_tb);
    assert_eq!(tcache.lookup(24).unwrap().as_ptr(), exit_tb);
}

const TABLE_BASE: u32 = 0x0000_4000;

/// Builds the straight-line dispatch-table caller: six calls through a
/// four-entry jump table (cycling targets, with two targets hit twice),
/// followed by `ecall`, with the four callee routines laid out after it.
/// Each callee adds a distinct constant into `x20` and returns via
/// `jalr x0, x1, 0`.
fn dispatch_program() -> (Vec<u32>, [u32; 4]) {
    let mut words = vec![asm::addi(20, 0, 0)]; // x20 = 0

    for idx in [0u32, 1, 2, 3, 1, 3] {
        words.push(asm::lui(13, TABLE_BASE));
        words.push(asm::addi(13, 13, (idx * 4) as i32));
        words.push(asm::lw(14, 13, 0));
        words.push(asm::jalr(1, 14, 0));
    }
    words.push(asm::ecall());

    let deltas = [10i32, 20, 30, 40];
    let mut routine_addrs = [0u32; 4];
    for (n, delta) in deltas.iter().enumerate() {
        routine_addrs[n] = (words.len() * 4) as u32;
        words.push(asm::addi(20, 20, *delta));
        words.push(asm::jalr(0, 1, 0));
    }

    (words, routine_addrs)
}

#[test]
fn indirect_dispatch_table_routes_through_all_four_targets() {
    let (words, routine_addrs) = dispatch_program();

    let mut aspace = AddressSpace::new();
    aspace
        .mmap(Some(GAddr::new(TABLE_BASE)), 4096, libc::PROT_READ | libc::PROT_WRITE, -1, 0)
        .expect("mapping the dispatch table");
    for (n, addr) in routine_addrs.iter().enumerate() {
        unsafe {
            let slot = aspace.g2h(GAddr::new(TABLE_BASE + n as u32 * 4)) as *mut u32;
            slot.write_unaligned(*addr);
        }
    }

    let tcache = TCache::new();
    let stubs = StubTable::new();
    let state_info = guest_state_info();
    let mut state = CpuState::new();
    state.membase = aspace.base();

    execute(&mut state, &tcache, &state_info, &stubs, ZERO_MMU_BASE, read_u32_over(&words));

    assert_eq!(state.trapno, TrapNo::Ecall);
    // dispatched to routines 0,1,2,3,1,3 adding 10,20,30,40,20,40
    assert_eq!(state.gpr[20], 160);

    for addr in routine_addrs {
        let tb = tcache.lookup(addr).expect("routine block compiled");
        assert!(unsafe { tb.as_ref().flags.is_brind_target.get() });
    }
}

#[test]
fn profile_store_ors_marks_across_independently_reopened_runs() {
    let dir = scratch_dir("profile-or");
    let path = dir.join("profile.bin");
    let elf = b"profile-or scenario image";

    {
        let mut run_a = ProfileStore::open(&path, elf).unwrap();
        run_a.mark_brind_target(0x100);
        run_a.mark_segment_entry(0x200);
        run_a.flush().unwrap();
    }
    {
        let mut run_b = ProfileStore::open(&path, elf).unwrap();
        run_b.mark_brind_target(0x200);
        run_b.mark_segment_entry(0x100);
        run_b.flush().unwrap();
    }

    let run_c = ProfileStore::open(&path, elf).unwrap();
    let mut brind = run_c.brind_targets();
    brind.sort();
    let mut entries = run_c.segment_entries();
    entries.sort();

    assert_eq!(brind, vec![0x100, 0x200]);
    assert_eq!(entries, vec![0x100, 0x200]);

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn brk_grows_by_a_full_page_run_and_zeroes_fresh_memory() {
    let dir = scratch_dir("brk");
    let mut aspace = AddressSpace::new();
    let fsmgr = FsManager::new(dir.join("fsroot"));
    let brk_base: u32 = 0x0010_0000;
    let mut syscalls = Syscalls::new(fsmgr, brk_base);

    let mut state = CpuState::new();
    state.membase = aspace.base();
    const A7: usize = 17;
    const A0: usize = 10;
    const SYS_BRK: u32 = 214;

    let requested = brk_base + 12 * 1024;
    state.gpr[A7] = SYS_BRK;
    state.gpr[A0] = requested;
    assert_eq!(syscalls.dispatch(&mut state, &mut aspace), None);
    assert_eq!(state.gpr[A0], requested);

    unsafe {
        let probe = aspace.g2h(GAddr::new(brk_base + 4096)) as *mut u32;
        assert_eq!(probe.read_unaligned(), 0);
        probe.write_unaligned(0xdead_beef);
        assert_eq!(probe.read_unaligned(), 0xdead_beef);
    }

    // a second `brk(0)` queries the current break without moving it
    state.gpr[A7] = SYS_BRK;
    state.gpr[A0] = 0;
    assert_eq!(syscalls.dispatch(&mut state, &mut aspace), None);
    assert_eq!(state.gpr[A0], requested);

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn aot_compile_smoke_test_publishes_one_symbol_per_entry() {
    let words = vec![asm::addi(10, 0, 42), asm::ecall()];
    let state_info = guest_state_info();

    let regions = compile_image(&state_info, read_u32_over(&words), &[0], &[], ZERO_MMU_BASE);
    assert_eq!(regions.len(), 1);
    assert!(regions[0].publish_symbol);
    assert!(!regions[0].code.is_empty());

    let bytes = write_aot_object(&regions);
    let obj = object::File::parse(&*bytes).expect("parsing the written .aot.so");

    let names: Vec<String> = obj.symbols().filter_map(|s| s.name().ok().map(String::from)).collect();
    assert!(names.iter().any(|n| n == "_aot_tab"));
    assert!(names.iter().any(|n| n == "_aot_patch_tab"));
    assert!(names.iter().any(|n| n == "_x0"));
}
