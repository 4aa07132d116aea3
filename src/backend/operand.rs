//! Operand classification and parallel-move resolution.
//!
//! A parallel move is a set of simultaneous assignments with pairwise
//! distinct destinations, so each node of the move graph has in-degree at
//! most one and the graph is a forest of trees hanging off simple cycles.
//! Register-to-register and stack-to-stack moves are resolved as two
//! independent graphs: trees are emitted from the leaves in, cycles are
//! rotated (through a scratch register, or by xor-swap chains for stack
//! slots), and the remaining cross-class moves — immediates, globals,
//! register↔stack — carry no ordering hazard and go last for register
//! destinations, first for stack destinations.

use crate::common::fx_hash::FxHashMap;
use std::hash::Hash;

use crate::backend::asm::{AsmInst, MemAddr};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Reg(&'static str),
    Imm(i32),
    Stack(i32),
    Global(String),
}

impl Operand {
    pub fn is_lower(&self) -> bool {
        matches!(self, Operand::Imm(v) if (-2048..=2047).contains(v))
    }
}

fn mv(dest: &str, src: &str) -> AsmInst {
    AsmInst::Mv { dest: dest.to_string(), src: src.to_string() }
}

fn lw(reg: &str, offset: i32) -> AsmInst {
    AsmInst::Mem { op: "lw", reg: reg.to_string(), addr: MemAddr::Offset { base: "sp", offset } }
}

fn sw(reg: &str, offset: i32) -> AsmInst {
    AsmInst::Mem { op: "sw", reg: reg.to_string(), addr: MemAddr::Offset { base: "sp", offset } }
}

/// Find one cycle in a graph whose nodes have in-degree ≤ 1, as the node
/// sequence along the edges. Iterative: move graphs mirror the CFG's depth.
fn find_ring<T: Copy + Eq + Hash + Ord>(graph: &FxHashMap<T, Vec<T>>) -> Vec<T> {
    let mut nodes: Vec<T> = graph.keys().copied().collect();
    nodes.sort_unstable();
    let mut visited: Vec<T> = Vec::new();
    for &start in &nodes {
        let mut path: Vec<T> = Vec::new();
        let mut stack: Vec<(T, usize)> = vec![(start, 0)];
        while let Some(&mut (node, ref mut next)) = stack.last_mut() {
            if *next == 0 {
                if path.contains(&node) {
                    let at = path.iter().position(|&n| n == node).unwrap();
                    return path[at..].to_vec();
                }
                if visited.contains(&node) {
                    stack.pop();
                    continue;
                }
                visited.push(node);
                path.push(node);
            }
            let succs = &graph[&node];
            if *next < succs.len() {
                let succ = succs[*next];
                *next += 1;
                stack.push((succ, 0));
            } else {
                path.pop();
                stack.pop();
            }
        }
    }
    Vec::new()
}

/// Remove each cycle (emitting its rotation) until only trees remain, then
/// emit every tree from its root; tree moves must execute before the
/// rotations so downstream copies read pre-rotation values.
fn eliminate_forest<T: Copy + Eq + Hash + Ord>(
    graph: &mut FxHashMap<T, Vec<T>>,
    mut eliminate_ring: impl FnMut(&[T]) -> Vec<AsmInst>,
    mut eliminate_tree: impl FnMut(&FxHashMap<T, Vec<T>>, T) -> Vec<AsmInst>,
) -> Vec<AsmInst> {
    let mut ring_insts = Vec::new();
    loop {
        let ring = find_ring(graph);
        if ring.is_empty() {
            break;
        }
        ring_insts.extend(eliminate_ring(&ring));
        for i in 0..ring.len() {
            let from = ring[i];
            let to = ring[(i + 1) % ring.len()];
            graph.get_mut(&from).unwrap().retain(|&t| t != to);
        }
    }

    let mut in_degree: FxHashMap<T, usize> = graph.keys().map(|&n| (n, 0)).collect();
    for targets in graph.values() {
        for &t in targets {
            *in_degree.get_mut(&t).unwrap() += 1;
        }
    }
    let mut roots: Vec<T> = graph.keys().copied().filter(|n| in_degree[n] == 0).collect();
    roots.sort_unstable();
    let mut tree_insts = Vec::new();
    for root in roots {
        tree_insts.extend(eliminate_tree(graph, root));
    }

    tree_insts.extend(ring_insts);
    tree_insts
}

fn eliminate_tree_reg(
    graph: &FxHashMap<&'static str, Vec<&'static str>>,
    root: &'static str,
) -> Vec<AsmInst> {
    // Children first (post-order), then fill them from this node.
    let mut out = Vec::new();
    let mut stack = vec![(root, false)];
    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            for &child in &graph[&node] {
                out.push(mv(child, node));
            }
            continue;
        }
        stack.push((node, true));
        for &child in &graph[&node] {
            stack.push((child, false));
        }
    }
    out
}

fn eliminate_ring_reg(tmp: &str, nodes: &[&'static str]) -> Vec<AsmInst> {
    let n = nodes.len();
    if n == 1 {
        return Vec::new();
    }
    let mut out = vec![mv(tmp, nodes[0]), mv(nodes[0], nodes[n - 1])];
    for i in (2..n).rev() {
        out.push(mv(nodes[i], nodes[i - 1]));
    }
    out.push(mv(nodes[1], tmp));
    out
}

fn xor_swap_on_stack(tmp1: &str, tmp2: &str, a: i32, b: i32) -> Vec<AsmInst> {
    let xor = |dest: &str, l: &str, r: &str| AsmInst::Cmd {
        op: "xor",
        dest: dest.to_string(),
        operands: vec![l.to_string(), r.to_string()],
    };
    vec![
        lw(tmp1, a),
        lw(tmp2, b),
        xor(tmp1, tmp1, tmp2),
        sw(tmp1, a),
        lw(tmp1, a),
        lw(tmp2, b),
        xor(tmp2, tmp1, tmp2),
        sw(tmp2, b),
        lw(tmp1, a),
        lw(tmp2, b),
        xor(tmp1, tmp1, tmp2),
        sw(tmp1, a),
    ]
}

fn eliminate_ring_stack(tmp1: &str, tmp2: &str, nodes: &[i32]) -> Vec<AsmInst> {
    let n = nodes.len();
    if n == 1 {
        return Vec::new();
    }
    let mut out = Vec::new();
    for i in (1..n).rev() {
        out.extend(xor_swap_on_stack(tmp1, tmp2, nodes[i], nodes[(i + 1) % n]));
    }
    out
}

fn eliminate_tree_stack(
    tmp1: &str,
    graph: &FxHashMap<i32, Vec<i32>>,
    root: i32,
) -> Vec<AsmInst> {
    let mut out = Vec::new();
    let mut stack = vec![(root, false)];
    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            if !graph[&node].is_empty() {
                out.push(lw(tmp1, node));
                for &child in &graph[&node] {
                    out.push(sw(tmp1, child));
                }
            }
            continue;
        }
        stack.push((node, true));
        for &child in &graph[&node] {
            stack.push((child, false));
        }
    }
    out
}

/// Realise the simultaneous assignment `to[i] = from[i]` for all `i`.
/// Destinations must be pairwise distinct registers or stack slots.
pub fn rearrange_operands(
    var_from: &[Operand],
    var_to: &[Operand],
    tmp1: &'static str,
    tmp2: &'static str,
) -> Vec<AsmInst> {
    assert_eq!(var_from.len(), var_to.len(), "parallel move arity mismatch");
    let mut out: Vec<AsmInst> = Vec::new();

    // Stack-to-stack permutation first.
    let mut graph_stack: FxHashMap<i32, Vec<i32>> = FxHashMap::default();
    for (f, t) in var_from.iter().zip(var_to) {
        let (Operand::Stack(f), Operand::Stack(t)) = (f, t) else { continue };
        graph_stack.entry(*f).or_default();
        graph_stack.entry(*t).or_default();
        graph_stack.get_mut(f).unwrap().push(*t);
    }
    if !graph_stack.is_empty() {
        out.extend(eliminate_forest(
            &mut graph_stack,
            |ring| eliminate_ring_stack(tmp1, tmp2, ring),
            |graph, root| eliminate_tree_stack(tmp1, graph, root),
        ));
    }

    // Other sources landing on stack slots.
    for (f, t) in var_from.iter().zip(var_to) {
        let Operand::Stack(t) = t else { continue };
        let reg: &str = match f {
            Operand::Stack(_) => continue,
            Operand::Imm(0) => "zero",
            Operand::Imm(v) => {
                out.push(AsmInst::Cmd {
                    op: "li",
                    dest: tmp1.to_string(),
                    operands: vec![v.to_string()],
                });
                tmp1
            }
            Operand::Reg(r) => r,
            Operand::Global(label) => {
                assert!(label.starts_with(".str"), "global {} used as a move source", label);
                out.push(AsmInst::Mem {
                    op: "la",
                    reg: tmp1.to_string(),
                    addr: MemAddr::Symbol { label: label.clone(), tmp: None },
                });
                tmp1
            }
        };
        out.push(sw(reg, *t));
    }

    // Register-to-register permutation.
    let mut graph_reg: FxHashMap<&'static str, Vec<&'static str>> = FxHashMap::default();
    for (f, t) in var_from.iter().zip(var_to) {
        let (&Operand::Reg(f), &Operand::Reg(t)) = (f, t) else { continue };
        graph_reg.entry(f).or_default();
        graph_reg.entry(t).or_default();
        graph_reg.get_mut(f).unwrap().push(t);
    }
    if !graph_reg.is_empty() {
        out.extend(eliminate_forest(
            &mut graph_reg,
            |ring| eliminate_ring_reg(tmp1, ring),
            |graph, root| eliminate_tree_reg(graph, root),
        ));
    }

    // Other sources landing in registers.
    for (f, t) in var_from.iter().zip(var_to) {
        let Operand::Reg(t) = t else { continue };
        match f {
            Operand::Reg(_) => {}
            Operand::Stack(offset) => out.push(lw(t, *offset)),
            Operand::Imm(v) => out.push(AsmInst::Cmd {
                op: "li",
                dest: t.to_string(),
                operands: vec![v.to_string()],
            }),
            Operand::Global(label) => {
                assert!(label.starts_with(".str"), "global {} used as a move source", label);
                out.push(AsmInst::Mem {
                    op: "la",
                    reg: t.to_string(),
                    addr: MemAddr::Symbol { label: label.clone(), tmp: None },
                });
            }
        }
    }

    out
}
