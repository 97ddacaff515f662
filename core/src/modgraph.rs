//! Per-page control-flow graph over discovered guest basic blocks, used
//! by the AOT pipeline to partition a page into single-entry regions.
//!
//! Grounded on `dbt/aot/aot_module.{h,cpp}`'s `ModuleGraph`/
//! `ModuleGraphNode`/`RPOTraversal`/`ComputeDomTree`. Raw `unique_ptr`/
//! raw-pointer node ownership becomes a `Vec<ModuleGraphNode>` arena
//! indexed by `NodeId`; `root` is always index 0.

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

pub const ROOT: NodeId = NodeId(0);

pub struct ModuleGraphNode {
    pub ip: u32,
    pub ip_end: u32,
    pub is_brind_target: bool,
    pub is_segment_entry: bool,
    pub succs: Vec<NodeId>,
    pub preds: Vec<NodeId>,
    pub dominator: Option<NodeId>,
}

impl ModuleGraphNode {
    fn new(ip: u32) -> Self {
        ModuleGraphNode {
            ip,
            ip_end: 0,
            is_brind_target: false,
            is_segment_entry: false,
            succs: Vec::new(),
            preds: Vec::new(),
            dominator: None,
        }
    }
}

pub struct ModuleGraph {
    nodes: Vec<ModuleGraphNode>,
    ip_index: std::collections::BTreeMap<u32, NodeId>,
}

impl ModuleGraph {
    pub fn new() -> Self {
        let mut nodes = Vec::new();
        nodes.push(ModuleGraphNode::new(0));
        ModuleGraph { nodes, ip_index: std::collections::BTreeMap::new() }
    }

    pub fn node(&self, id: NodeId) -> &ModuleGraphNode {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut ModuleGraphNode {
        &mut self.nodes[id.0 as usize]
    }

    pub fn get_node(&self, ip: u32) -> Option<NodeId> {
        self.ip_index.get(&ip).copied()
    }

    pub fn add_node(&mut self, ip: u32) -> NodeId {
        if let Some(&id) = self.ip_index.get(&ip) {
            return id;
        }
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(ModuleGraphNode::new(ip));
        self.ip_index.insert(ip, id);
        id
    }

    fn add_succ(&mut self, from: NodeId, to: NodeId) {
        self.nodes[from.0 as usize].succs.push(to);
        self.nodes[to.0 as usize].preds.push(from);
    }

    pub fn record_entry(&mut self, ip: u32) -> NodeId {
        self.add_node(ip)
    }

    pub fn record_brind_target(&mut self, ip: u32) {
        let node = self.get_node(ip).expect("brind target must already be a recorded entry");
        self.node_mut(node).is_brind_target = true;
        self.add_succ(ROOT, node);
    }

    pub fn record_segment_entry(&mut self, ip: u32) {
        let node = self.get_node(ip).expect("segment entry must already be a recorded entry");
        self.node_mut(node).is_segment_entry = true;
        self.add_succ(ROOT, node);
    }

    /// Records a direct edge; a target outside the module (not yet
    /// discovered) is silently dropped — a "sidecall" the original
    /// leaves for the caller to resolve via the tcache instead.
    pub fn record_gbr(&mut self, from_ip: u32, target_ip: u32) {
        if let Some(tgt) = self.get_node(target_ip) {
            let from = self.get_node(from_ip).expect("from_ip must be a recorded entry");
            self.add_succ(from, tgt);
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Reverse postorder over the graph reachable from the root, via an
    /// explicit-stack DFS (no recursion, so page-sized graphs never blow
    /// the host stack).
    pub fn rpo(&self) -> Vec<NodeId> {
        let mut visited = vec![false; self.nodes.len()];
        let mut postorder = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<(NodeId, usize)> = vec![(ROOT, 0)];
        visited[ROOT.0 as usize] = true;

        while let Some((node, child_idx)) = stack.pop() {
            let succs = &self.nodes[node.0 as usize].succs;
            if child_idx < succs.len() {
                let child = succs[child_idx];
                stack.push((node, child_idx + 1));
                if !visited[child.0 as usize] {
                    visited[child.0 as usize] = true;
                    stack.push((child, 0));
                }
            } else {
                postorder.push(node);
            }
        }
        postorder.reverse();
        postorder
    }

    /// Cooper-Harvey-Kennedy dominator computation over RPO numbers.
    /// Grounded on `ModuleGraph::ComputeDomTree`.
    pub fn compute_dom_tree(&mut self) {
        let rpo = self.rpo();
        let mut rpo_number = vec![u32::MAX; self.nodes.len()];
        for (i, &n) in rpo.iter().enumerate() {
            rpo_number[n.0 as usize] = i as u32;
        }

        self.nodes[ROOT.0 as usize].dominator = Some(ROOT);

        let intersect = |doms: &[Option<NodeId>], rpo_number: &[u32], mut b1: NodeId, mut b2: NodeId| -> NodeId {
            while b1 != b2 {
                while rpo_number[b1.0 as usize] > rpo_number[b2.0 as usize] {
                    b1 = doms[b1.0 as usize].unwrap();
                }
                while rpo_number[b2.0 as usize] > rpo_number[b1.0 as usize] {
                    b2 = doms[b2.0 as usize].unwrap();
                }
            }
            b1
        };

        let mut changed = true;
        while changed {
            changed = false;
            for &b in &rpo {
                if b == ROOT {
                    continue;
                }
                let preds = self.nodes[b.0 as usize].preds.clone();
                let mut new_idom = None;
                for p in preds {
                    new_idom = Some(match new_idom {
                        None => p,
                        Some(cur) => {
                            if self.nodes[p.0 as usize].dominator.is_some() {
                                intersect(
                                    &self.nodes.iter().map(|n| n.dominator).collect::<Vec<_>>(),
                                    &rpo_number,
                                    p,
                                    cur,
                                )
                            } else {
                                cur
                            }
                        }
                    });
                }
                if self.nodes[b.0 as usize].dominator != new_idom {
                    self.nodes[b.0 as usize].dominator = new_idom;
                    changed = true;
                }
            }
        }
    }

    /// Partitions the reachable graph into single-entry regions: a node
    /// is a region entry iff its immediate dominator is the root. Every
    /// other node joins the region of its dominator. Returns one vector
    /// per region, in RPO order, entry first.
    pub fn compute_regions(&self) -> Vec<Vec<NodeId>> {
        let rpo = self.rpo();
        let mut region_of: std::collections::HashMap<NodeId, usize> = std::collections::HashMap::new();
        let mut regions: Vec<Vec<NodeId>> = Vec::new();

        for &n in &rpo {
            if n == ROOT {
                continue;
            }
            let idom = self.nodes[n.0 as usize].dominator.expect("dom tree must be computed first");
            let region_id = if idom == ROOT {
                regions.push(Vec::new());
                regions.len() - 1
            } else {
                *region_of.get(&idom).expect("dominator visited before its dominatees in RPO")
            };
            region_of.insert(n, region_id);
            regions[region_id].push(n);
        }
        regions
    }
}

impl Default for ModuleGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diamond_dominators() {
        let mut g = ModuleGraph::new();
        let a = g.record_entry(0x100);
        g.record_segment_entry(0x100);
        let b = g.record_entry(0x104);
        let c = g.record_entry(0x108);
        let d = g.record_entry(0x10c);
        g.record_gbr(0x100, 0x104);
        g.record_gbr(0x100, 0x108);
        g.record_gbr(0x104, 0x10c);
        g.record_gbr(0x108, 0x10c);
        g.compute_dom_tree();
        assert_eq!(g.node(a).dominator, Some(ROOT));
        assert_eq!(g.node(b).dominator, Some(a));
        assert_eq!(g.node(c).dominator, Some(a));
        assert_eq!(g.node(d).dominator, Some(a));
    }

    #[test]
    fn single_region_for_diamond() {
        let mut g = ModuleGraph::new();
        g.record_entry(0x100);
        g.record_segment_entry(0x100);
        g.record_entry(0x104);
        g.record_entry(0x108);
        g.record_entry(0x10c);
        g.record_gbr(0x100, 0x104);
        g.record_gbr(0x100, 0x108);
        g.record_gbr(0x104, 0x10c);
        g.record_gbr(0x108, 0x10c);
        g.compute_dom_tree();
        let regions = g.compute_regions();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].len(), 4);
        assert_eq!(regions[0][0], g.get_node(0x100).unwrap());
    }

    #[test]
    fn two_segment_entries_become_two_regions() {
        let mut g = ModuleGraph::new();
        g.record_entry(0x100);
        g.record_segment_entry(0x100);
        g.record_entry(0x200);
        g.record_segment_entry(0x200);
        g.compute_dom_tree();
        let regions = g.compute_regions();
        assert_eq!(regions.len(), 2);
    }
}
