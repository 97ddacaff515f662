//! Drives `rvdbt_core`'s module graph and QIR pipeline over a guest
//! image to produce the set of compiled regions an AOT shared object
//! packages up.
//!
//! Grounded on `dbt/aot/aot.cpp`: discover the page's control
//! flow with the analyser, partition it with the module graph's
//! dominator-based regions, then run each entry through the same
//! translate/legalise/allocate/emit pipeline the JIT uses (`rvdbt-core`
//! doesn't merge multiple guest blocks into a single QIR region — the
//! AOT driver compiles one block per module-graph node too, and uses
//! the region partition only to order the worklist and to tell a
//! segment entry from an interior block for the symbol table).

use std::collections::VecDeque;

use rvdbt_core::analyse::{analyse, Control, Edge};
use rvdbt_core::modgraph::ModuleGraph;
use rvdbt_core::qcg::emit::{PendingBranchSlot, PendingStubCall};
use rvdbt_core::qcg::{qsel, regalloc, Emitter};
use rvdbt_core::qir::{Region, StateInfo};
use rvdbt_core::translate::Translator;

/// One compiled guest block: its entry IP, the emitted x86-64 bytes, and
/// the unresolved branch-slot/hcall-stub patch sites within those bytes
/// (left for the loader to fix up against the host process's own
/// `StubTable`, the same way `rvdbt_core::compile::patch_code` fixes
/// them up for the JIT). `publish_symbol` marks segment entries and
/// indirect-branch targets — interior fallthrough blocks stay unnamed in
/// the written object, matching the original's "only entries callers can
/// actually jump to get a symbol" convention.
pub struct CompiledRegion {
    pub gip: u32,
    pub code: Vec<u8>,
    pub branch_slots: Vec<PendingBranchSlot>,
    pub stub_calls: Vec<PendingStubCall>,
    pub publish_symbol: bool,
}

/// Walks the reachable control flow from `entries` (typically just the
/// ELF entry point, plus any indirect-branch targets a profile run
/// recorded), builds the module graph, and compiles every discovered
/// block.
pub fn compile_image(
    state_info: &StateInfo,
    read_u32: impl Fn(u32) -> u32,
    entries: &[u32],
    brind_targets: &[u32],
    zero_mmu_base: bool,
) -> Vec<CompiledRegion> {
    let mut graph = ModuleGraph::new();
    let mut worklist: VecDeque<u32> = VecDeque::new();

    for &ip in entries {
        graph.record_entry(ip);
        graph.record_segment_entry(ip);
        worklist.push_back(ip);
    }

    let mut ip_ends = std::collections::HashMap::new();

    while let Some(ip) = worklist.pop_front() {
        if ip_ends.contains_key(&ip) {
            continue;
        }
        let result = analyse(ip, u32::MAX, &read_u32);
        ip_ends.insert(ip, result.ip_end);

        for edge in &result.edges {
            let targets: Vec<u32> = match *edge {
                Edge::Direct(t) => vec![t],
                Edge::DirectLink { target, link } => vec![target, link],
                Edge::Indirect { link } => link.into_iter().collect(),
            };
            for t in targets {
                if graph.get_node(t).is_none() {
                    graph.record_entry(t);
                    worklist.push_back(t);
                }
            }
        }
        if result.control != Control::Overflow {
            for edge in &result.edges {
                if let Edge::Direct(t) | Edge::DirectLink { target: t, .. } = *edge {
                    graph.record_gbr(ip, t);
                }
            }
        }
    }

    for &ip in brind_targets {
        if graph.get_node(ip).is_some() {
            graph.record_brind_target(ip);
        }
    }

    graph.compute_dom_tree();
    let regions = graph.compute_regions();

    let mut compiled = Vec::new();
    for region in &regions {
        for &node_id in region {
            let node = graph.node(node_id);
            let ip = node.ip;
            let boundary = ip_ends.get(&ip).copied().unwrap_or(u32::MAX);

            let mut qir_region = Region::new(state_info);
            let entry_block = qir_region.create_block();
            Translator::translate(&mut qir_region, entry_block, ip, boundary, &read_u32);
            qsel::legalize(&mut qir_region);
            regalloc::allocate(&mut qir_region, zero_mmu_base);
            let emitted = Emitter::new(&qir_region, zero_mmu_base).emit();

            compiled.push(CompiledRegion {
                gip: ip,
                code: emitted.code,
                branch_slots: emitted.branch_slots,
                stub_calls: emitted.stub_calls,
                publish_symbol: node.is_segment_entry || node.is_brind_target,
            });
        }
    }
    compiled
}
