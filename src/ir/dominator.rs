//! Dominator analysis.
//!
//! Classical iterative data-flow over reverse postorder (Cooper–Harvey–
//! Kennedy). Operates on a plain adjacency list indexed by block position,
//! so the same code serves the forward CFG and the reversed CFG used for
//! post-dominators (a synthetic end node joined to every `ret` block).
//!
//! All traversals use explicit stacks; deep CFGs from real programs
//! overflow the thread stack otherwise.

use crate::common::fx_hash::FxHashSet;

/// Successor lists indexed by block position.
pub type Cfg = Vec<Vec<usize>>;

const UNDEFINED: usize = usize::MAX;

#[derive(Debug)]
pub struct DominatorTree {
    /// Immediate dominator per node; the entry points at itself and
    /// unreachable nodes hold `usize::MAX`.
    pub idom: Vec<usize>,
    entry: usize,
    rpo: Vec<usize>,
    rpo_number: Vec<usize>,
}

impl DominatorTree {
    pub fn compute(cfg: &Cfg, entry: usize) -> DominatorTree {
        let n = cfg.len();
        let rpo = reverse_postorder(cfg, entry);
        let mut rpo_number = vec![UNDEFINED; n];
        for (i, &node) in rpo.iter().enumerate() {
            rpo_number[node] = i;
        }

        let mut preds: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (u, succs) in cfg.iter().enumerate() {
            if rpo_number[u] == UNDEFINED {
                continue;
            }
            for &v in succs {
                preds[v].push(u);
            }
        }

        let mut idom = vec![UNDEFINED; n];
        idom[entry] = entry;
        let mut changed = true;
        while changed {
            changed = false;
            for &b in rpo.iter().skip(1) {
                let mut new_idom = UNDEFINED;
                for &p in &preds[b] {
                    if idom[p] == UNDEFINED {
                        continue;
                    }
                    new_idom = if new_idom == UNDEFINED {
                        p
                    } else {
                        intersect(&idom, &rpo_number, new_idom, p)
                    };
                }
                assert!(new_idom != UNDEFINED, "dominator: block {} has no processed predecessor", b);
                if idom[b] != new_idom {
                    idom[b] = new_idom;
                    changed = true;
                }
            }
        }

        DominatorTree { idom, entry, rpo, rpo_number }
    }

    pub fn entry(&self) -> usize {
        self.entry
    }

    pub fn is_reachable(&self, node: usize) -> bool {
        self.rpo_number[node] != UNDEFINED
    }

    pub fn reverse_postorder(&self) -> &[usize] {
        &self.rpo
    }

    /// Children lists of the dominator tree, ascending.
    pub fn children(&self) -> Vec<Vec<usize>> {
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); self.idom.len()];
        for (node, &dom) in self.idom.iter().enumerate() {
            if dom != UNDEFINED && node != self.entry {
                children[dom].push(node);
            }
        }
        children
    }

    /// Preorder walk of the dominator tree, children visited ascending.
    pub fn dfs_order(&self) -> Vec<usize> {
        let children = self.children();
        let mut order = Vec::with_capacity(self.rpo.len());
        let mut stack = vec![self.entry];
        while let Some(node) = stack.pop() {
            order.push(node);
            for &c in children[node].iter().rev() {
                stack.push(c);
            }
        }
        order
    }

    /// The dominance frontier of every reachable node.
    pub fn dominance_frontier(&self, cfg: &Cfg) -> Vec<FxHashSet<usize>> {
        let n = cfg.len();
        let mut preds: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (u, succs) in cfg.iter().enumerate() {
            if !self.is_reachable(u) {
                continue;
            }
            for &v in succs {
                preds[v].push(u);
            }
        }

        let mut frontier: Vec<FxHashSet<usize>> = vec![FxHashSet::default(); n];
        for b in 0..n {
            if !self.is_reachable(b) || preds[b].len() < 2 {
                continue;
            }
            for &p in &preds[b] {
                let mut runner = p;
                while runner != self.idom[b] {
                    frontier[runner].insert(b);
                    runner = self.idom[runner];
                }
            }
        }
        frontier
    }

    /// For every block `b`, the set of blocks `P` whose *iterated* dominance
    /// frontier contains `b` — i.e. a store in `P` forces a phi at `b`.
    /// Consumed by mem2reg.
    pub fn iterated_frontier_predecessors(&self, cfg: &Cfg) -> Vec<Vec<usize>> {
        let frontier = self.dominance_frontier(cfg);
        let n = cfg.len();
        let mut sources: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (p, fr) in frontier.iter().enumerate() {
            for &b in fr {
                sources[b].push(p);
            }
        }

        let mut result: Vec<Vec<usize>> = vec![Vec::new(); n];
        for b in 0..n {
            let mut visited: FxHashSet<usize> = FxHashSet::default();
            let mut stack: Vec<usize> = sources[b].clone();
            while let Some(p) = stack.pop() {
                if !visited.insert(p) {
                    continue;
                }
                stack.extend(sources[p].iter().copied());
            }
            let mut set: Vec<usize> = visited.into_iter().collect();
            set.sort_unstable();
            result[b] = set;
        }
        result
    }
}

fn intersect(idom: &[usize], rpo_number: &[usize], mut a: usize, mut b: usize) -> usize {
    while a != b {
        while rpo_number[a] > rpo_number[b] {
            a = idom[a];
        }
        while rpo_number[b] > rpo_number[a] {
            b = idom[b];
        }
    }
    a
}

/// Reverse postorder from `entry`; unreachable nodes are absent.
pub fn reverse_postorder(cfg: &Cfg, entry: usize) -> Vec<usize> {
    let n = cfg.len();
    let mut visited = vec![false; n];
    let mut postorder = Vec::with_capacity(n);
    // (node, next successor index) frames
    let mut stack: Vec<(usize, usize)> = vec![(entry, 0)];
    visited[entry] = true;
    while let Some(frame) = stack.last_mut() {
        let node = frame.0;
        if frame.1 < cfg[node].len() {
            let succ = cfg[node][frame.1];
            frame.1 += 1;
            if !visited[succ] {
                visited[succ] = true;
                stack.push((succ, 0));
            }
        } else {
            postorder.push(node);
            stack.pop();
        }
    }
    postorder.reverse();
    postorder
}

/// The reversed CFG with a synthetic end node (index `n`) joined to every
/// block in `exit_nodes`; dominators of this graph are post-dominators.
pub fn reverse_cfg(cfg: &Cfg, exit_nodes: &[usize]) -> (Cfg, usize) {
    let n = cfg.len();
    let mut reversed: Cfg = vec![Vec::new(); n + 1];
    for (u, succs) in cfg.iter().enumerate() {
        for &v in succs {
            reversed[v].push(u);
        }
    }
    reversed[n] = exit_nodes.to_vec();
    (reversed, n)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Diamond: 0 -> {1, 2} -> 3
    fn diamond() -> Cfg {
        vec![vec![1, 2], vec![3], vec![3], vec![]]
    }

    #[test]
    fn test_idom_diamond() {
        let dt = DominatorTree::compute(&diamond(), 0);
        assert_eq!(dt.idom[1], 0);
        assert_eq!(dt.idom[2], 0);
        assert_eq!(dt.idom[3], 0);
    }

    #[test]
    fn test_frontier_diamond() {
        let cfg = diamond();
        let dt = DominatorTree::compute(&cfg, 0);
        let df = dt.dominance_frontier(&cfg);
        assert!(df[1].contains(&3));
        assert!(df[2].contains(&3));
        assert!(df[0].is_empty());
        assert!(df[3].is_empty());
    }

    #[test]
    fn test_loop_frontier_contains_header() {
        // 0 -> 1 (header) -> 2 (body) -> 1, 1 -> 3 (exit)
        let cfg: Cfg = vec![vec![1], vec![2, 3], vec![1], vec![]];
        let dt = DominatorTree::compute(&cfg, 0);
        let df = dt.dominance_frontier(&cfg);
        // The body's frontier is the header itself (back edge).
        assert!(df[2].contains(&1));
        let ifp = dt.iterated_frontier_predecessors(&cfg);
        // A store in the body or the header forces a phi at the header.
        assert!(ifp[1].contains(&2));
        assert!(ifp[1].contains(&1));
    }

    #[test]
    fn test_dfs_order_starts_at_entry_and_respects_tree() {
        let cfg = diamond();
        let dt = DominatorTree::compute(&cfg, 0);
        let order = dt.dfs_order();
        assert_eq!(order[0], 0);
        assert_eq!(order.len(), 4);
        let pos = |n: usize| order.iter().position(|&x| x == n).unwrap();
        assert!(pos(0) < pos(1));
        assert!(pos(0) < pos(3));
    }

    #[test]
    fn test_unreachable_blocks_are_skipped() {
        // Node 2 unreachable.
        let cfg: Cfg = vec![vec![1], vec![], vec![1]];
        let dt = DominatorTree::compute(&cfg, 0);
        assert!(!dt.is_reachable(2));
        assert_eq!(dt.reverse_postorder(), &[0, 1]);
    }

    #[test]
    fn test_post_dominators_via_reverse_cfg() {
        let cfg = diamond();
        let (rcfg, end) = reverse_cfg(&cfg, &[3]);
        let dt = DominatorTree::compute(&rcfg, end);
        // 3 post-dominates everything.
        assert_eq!(dt.idom[0], 3);
        assert_eq!(dt.idom[1], 3);
        assert_eq!(dt.idom[2], 3);
    }
}
