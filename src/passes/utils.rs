//! Shared helpers for the middle-end passes.
//!
//! Analyses index data by *layout position* (a block's place in
//! `Function::layout`), not by arena id; `positions` gives the translation.

use crate::common::fx_hash::{FxHashMap, FxHashSet};
use crate::common::types::IrType;
use crate::ir::dominator::Cfg;
use crate::ir::ir::{BlockId, Function, InstKind};

/// Arena id → layout position (`usize::MAX` for blocks out of layout).
pub fn positions(func: &Function) -> Vec<usize> {
    let mut pos = vec![usize::MAX; func.blocks.len()];
    for (i, &id) in func.layout.iter().enumerate() {
        pos[id.index()] = i;
    }
    pos
}

/// Successor lists in layout-position space.
pub fn build_cfg(func: &Function, pos: &[usize]) -> Cfg {
    func.layout
        .iter()
        .map(|&id| {
            func.block(id)
                .successors
                .iter()
                .map(|s| {
                    let p = pos[s.index()];
                    assert!(p != usize::MAX, "{}: successor block out of layout", func.name);
                    p
                })
                .collect()
        })
        .collect()
}

/// Layout positions of blocks ending in `ret`.
pub fn ret_positions(func: &Function) -> Vec<usize> {
    func.layout
        .iter()
        .enumerate()
        .filter(|(_, &id)| matches!(func.block(id).terminator().kind, InstKind::Ret { .. }))
        .map(|(i, _)| i)
        .collect()
}

/// Every SSA name defined in the body.
pub fn collect_defs(func: &Function) -> FxHashSet<String> {
    let mut defs = FxHashSet::default();
    for &id in &func.layout {
        for inst in &func.block(id).insts {
            if let Some(def) = inst.def() {
                defs.insert(def.to_string());
            }
        }
    }
    defs
}

/// Result type per defined name (`icmp` defines `i1`).
pub fn collect_type_map(func: &Function) -> FxHashMap<String, IrType> {
    let mut map = FxHashMap::default();
    for &id in &func.layout {
        for inst in &func.block(id).insts {
            if let (Some(def), Some(ty)) = (inst.def(), inst.result_ty()) {
                map.insert(def.to_string(), ty);
            }
        }
    }
    map
}

/// Use sites of every defined name, as (block, instruction index) pairs.
pub fn collect_uses(
    defs: &FxHashSet<String>,
    func: &Function,
) -> FxHashMap<String, Vec<(BlockId, usize)>> {
    let mut sites: FxHashMap<String, Vec<(BlockId, usize)>> = FxHashMap::default();
    for def in defs {
        sites.insert(def.clone(), Vec::new());
    }
    for &id in &func.layout {
        for (i, inst) in func.block(id).insts.iter().enumerate() {
            inst.for_each_use(|u| {
                if let Some(v) = sites.get_mut(u) {
                    v.push((id, i));
                }
            });
        }
    }
    sites
}

/// Rewrite the layout into reverse postorder; blocks no longer reachable
/// from the entry drop out.
pub fn rearrange_in_rpo(func: &mut Function) {
    let entry = func.entry();
    let mut visited: FxHashSet<BlockId> = FxHashSet::default();
    let mut postorder: Vec<BlockId> = Vec::with_capacity(func.layout.len());
    let mut stack: Vec<(BlockId, usize)> = vec![(entry, 0)];
    visited.insert(entry);
    while let Some(frame) = stack.last_mut() {
        let id = frame.0;
        let succs = &func.block(id).successors;
        if frame.1 < succs.len() {
            let succ = succs[frame.1];
            frame.1 += 1;
            if visited.insert(succ) {
                stack.push((succ, 0));
            }
        } else {
            postorder.push(id);
            stack.pop();
        }
    }
    postorder.reverse();
    func.layout = postorder;

    // Dropped blocks may still be listed as predecessors; prune them and
    // the phi incomings that referenced them.
    for &id in &func.layout.clone() {
        let block = func.block_mut(id);
        block.predecessors.retain(|p| visited.contains(p));
        for inst in &mut block.insts {
            if let InstKind::Phi { incoming, .. } = &mut inst.kind {
                incoming.retain(|(p, _)| visited.contains(p));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parser::parse_module;

    #[test]
    fn test_rpo_drops_orphan_blocks() {
        let src = "\
define i32 @main() {
entry:
  br label %exit
orphan:
  br label %exit
exit:
  ret i32 0
}
";
        let mut module = parse_module(src).unwrap();
        let f = module.functions.iter_mut().find(|f| f.name == "@main").unwrap();
        assert_eq!(f.layout.len(), 3);
        rearrange_in_rpo(f);
        assert_eq!(f.layout.len(), 2);
        assert_eq!(f.block(f.layout[0]).name, "entry");
        assert_eq!(f.block(f.layout[1]).name, "exit");
    }

    #[test]
    fn test_collect_defs_and_uses() {
        let src = "\
define i32 @main() {
entry:
  %a = add i32 1, 2
  %b = add i32 %a, %a
  ret i32 %b
}
";
        let module = parse_module(src).unwrap();
        let f = module.function("@main").unwrap();
        let defs = collect_defs(f);
        assert!(defs.contains("%a") && defs.contains("%b"));
        let uses = collect_uses(&defs, f);
        assert_eq!(uses["%a"].len(), 2);
        assert_eq!(uses["%b"].len(), 1);
    }
}
