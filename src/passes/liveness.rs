//! Liveness analysis.
//!
//! Per-instruction `live_out` sets, built by walking upward from every use
//! until the defining instruction or an already-annotated point is hit.
//! A phi's operand is live on the corresponding predecessor *edge*, not at
//! the phi's own block entry. Also fills each block's `live_in` and the
//! function's `var_defs` universe (definitions plus parameters plus
//! `ret_addr`), which the register allocator consumes.

use crate::common::fx_hash::FxHashSet;
use crate::ir::ir::*;
use crate::passes::utils::{collect_defs, collect_uses};

pub fn liveness_analysis(func: &mut Function) {
    let mut defs = collect_defs(func);
    defs.insert(RET_ADDR.to_string());
    for param in &func.params {
        defs.insert(param.name.clone());
    }
    let use_sites = collect_uses(&defs, func);
    func.var_defs = defs;

    for &id in &func.layout.clone() {
        let block = func.block_mut(id);
        block.live_in.clear();
        for inst in &mut block.insts {
            inst.live_out.clear();
        }
    }

    let mut sorted: Vec<(&String, &Vec<(BlockId, usize)>)> = use_sites.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    for (var, sites) in sorted {
        let mut visited: FxHashSet<BlockId> = FxHashSet::default();
        for &(block, idx) in sites {
            let is_phi = func.block(block).insts[idx].is_phi();
            if is_phi {
                let InstKind::Phi { incoming, .. } = &func.block(block).insts[idx].kind else {
                    unreachable!()
                };
                let sources: Vec<BlockId> = incoming
                    .iter()
                    .filter(|(_, value)| value == var)
                    .map(|(pred, _)| *pred)
                    .collect();
                for source in sources {
                    scan_from_block_end(func, var, source, &mut visited);
                }
            } else {
                scan_before(func, var, block, idx, &mut visited);
            }
        }
    }
}

/// Mark `var` live out of every instruction of `block` from the bottom,
/// stopping at its definition; continue into predecessors otherwise.
fn scan_from_block_end(
    func: &mut Function,
    var: &str,
    block: BlockId,
    visited: &mut FxHashSet<BlockId>,
) {
    let mut stack = vec![block];
    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        let mut defined = false;
        for inst in func.block_mut(id).insts.iter_mut().rev() {
            inst.live_out.insert(var.to_string());
            if inst.def() == Some(var) {
                defined = true;
                break;
            }
        }
        if !defined {
            func.block_mut(id).live_in.insert(var.to_string());
            stack.extend(func.block(id).predecessors.iter().copied());
        }
    }
}

/// Mark `var` live out of the instructions strictly above position `idx`,
/// stopping where it is defined or already live.
fn scan_before(
    func: &mut Function,
    var: &str,
    block: BlockId,
    idx: usize,
    visited: &mut FxHashSet<BlockId>,
) {
    for i in (0..idx).rev() {
        let inst = &mut func.block_mut(block).insts[i];
        if inst.live_out.contains(var) {
            return;
        }
        inst.live_out.insert(var.to_string());
        if inst.def() == Some(var) {
            return;
        }
    }
    func.block_mut(block).live_in.insert(var.to_string());
    let preds: Vec<BlockId> = func.block(block).predecessors.clone();
    for pred in preds {
        scan_from_block_end(func, var, pred, visited);
    }
}
