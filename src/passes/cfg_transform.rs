//! CFG cleanup after SCCP: unreachable-block elimination and copy
//! propagation.
//!
//! Reachability is computed under the CFG minus the function's
//! `edge_to_remove` queue, in both directions: forward from the entry and
//! backward from the `ret` blocks. Only the intersection survives. Phi
//! incomings and branch terminators are re-pruned against the surviving
//! edges, single-incoming phis degrade to copies (`add x, 0`), and a
//! global rename sweep folds the copies away.

use crate::common::fx_hash::{FxHashMap, FxHashSet};
use crate::ir::ir::*;

pub fn remove_unreachable(func: &mut Function) {
    let layout = func.layout.clone();
    let removed = std::mem::take(&mut func.edge_to_remove);

    // Forward reachability from the entry, ignoring removed edges.
    let mut forward: FxHashSet<BlockId> = FxHashSet::default();
    let mut stack = vec![layout[0]];
    while let Some(id) = stack.pop() {
        if !forward.insert(id) {
            continue;
        }
        for &succ in &func.block(id).successors {
            if !removed.contains(&(id, succ)) {
                stack.push(succ);
            }
        }
    }

    // Backward reachability from every ret block.
    let mut pred_map: FxHashMap<BlockId, Vec<BlockId>> = FxHashMap::default();
    for &id in &forward {
        for &succ in &func.block(id).successors {
            if !removed.contains(&(id, succ)) && forward.contains(&succ) {
                pred_map.entry(succ).or_default().push(id);
            }
        }
    }
    let mut backward: FxHashSet<BlockId> = FxHashSet::default();
    let mut stack: Vec<BlockId> = forward
        .iter()
        .copied()
        .filter(|&id| matches!(func.block(id).terminator().kind, InstKind::Ret { .. }))
        .collect();
    while let Some(id) = stack.pop() {
        if !backward.insert(id) {
            continue;
        }
        if let Some(preds) = pred_map.get(&id) {
            stack.extend(preds.iter().copied());
        }
    }

    let reachable: FxHashSet<BlockId> = forward.intersection(&backward).copied().collect();

    if reachable.is_empty() {
        // No path from entry to any return. Degenerate but must stay a
        // well-formed function: reduce to an empty return.
        let entry = layout[0];
        let value = match func.ret_ty {
            crate::common::types::IrType::Void => None,
            crate::common::types::IrType::I1 => Some("false".to_string()),
            crate::common::types::IrType::Ptr => Some("null".to_string()),
            crate::common::types::IrType::I32 => Some("0".to_string()),
        };
        let ret_ty = func.ret_ty;
        let block = func.block_mut(entry);
        block.insts = vec![Inst::new(InstKind::Ret { ty: ret_ty, value })];
        block.successors.clear();
        block.predecessors.clear();
        func.layout = vec![entry];
        return;
    }

    let mut new_layout = Vec::with_capacity(layout.len());
    for &id in &layout {
        if !reachable.contains(&id) {
            continue;
        }
        new_layout.push(id);

        // Re-prune phi incomings against surviving edges.
        for inst in &mut func.block_mut(id).insts {
            if !inst.is_phi() {
                break;
            }
            let InstKind::Phi { incoming, .. } = &mut inst.kind else { unreachable!() };
            incoming.retain(|(p, _)| reachable.contains(p) && !removed.contains(&(*p, id)));
        }

        // A branch with a single surviving successor becomes a jump.
        let survivors: Vec<BlockId> = func
            .block(id)
            .successors
            .iter()
            .copied()
            .filter(|&s| reachable.contains(&s) && !removed.contains(&(id, s)))
            .collect();
        let block = func.block_mut(id);
        if matches!(block.terminator().kind, InstKind::Branch { .. })
            && survivors.len() != block.successors.len()
        {
            assert!(!survivors.is_empty(), "{}: reachable block lost every successor", block.name);
            block.successors = vec![survivors[0]];
            *block.insts.last_mut().unwrap() = Inst::new(InstKind::Jump);
        }
    }

    for &id in &new_layout {
        func.block_mut(id)
            .predecessors
            .retain(|&p| reachable.contains(&p) && !removed.contains(&(p, id)));
    }

    func.layout = new_layout;
    copy_propagation(func);
}

/// Rewrite single-incoming phis to copies, then fold every copy
/// (`add x, 0` and its phi-degraded form) through a global rename map.
pub fn copy_propagation(func: &mut Function) {
    let mut rename: FxHashMap<String, String> = FxHashMap::default();
    for &id in &func.layout.clone() {
        for inst in &mut func.block_mut(id).insts {
            match &mut inst.kind {
                InstKind::Phi { dest, ty, incoming } if incoming.len() == 1 => {
                    let value = incoming[0].1.clone();
                    rename.insert(dest.clone(), value.clone());
                    inst.kind = InstKind::Bin {
                        dest: std::mem::take(dest),
                        op: BinOp::Add,
                        ty: *ty,
                        lhs: value,
                        rhs: "0".to_string(),
                    };
                }
                InstKind::Bin { dest, op: BinOp::Add, lhs, rhs, .. } if rhs == "0" => {
                    rename.insert(dest.clone(), lhs.clone());
                }
                _ => {}
            }
        }
    }
    if rename.is_empty() {
        return;
    }
    for &id in &func.layout.clone() {
        for inst in &mut func.block_mut(id).insts {
            inst.rename_uses(&rename);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::renamer::Renamer;
    use crate::ir::parser::parse_module;
    use crate::ir::printer::module_text;

    #[test]
    fn test_removed_edge_prunes_branch_and_phi() {
        let src = "\
define i32 @main() {
entry:
  br label %head
head:
  %x = phi i32 [1, %entry], [2, %dead]
  %c = icmp slt i32 %x, 10
  br i1 %c, label %exit, label %dead
dead:
  br label %head
exit:
  ret i32 %x
}
";
        let mut module = parse_module(src).unwrap();
        {
            let f = module.functions.iter_mut().find(|f| f.name == "@main").unwrap();
            let head = f.layout[1];
            let dead = f.layout[2];
            f.edge_to_remove.insert((head, dead));
            remove_unreachable(f);
            assert_eq!(f.layout.len(), 3);
            let head_block = f.block(head);
            assert_eq!(head_block.predecessors.len(), 1);
            // The single-incoming phi degraded to a copy and was folded.
            assert!(head_block.insts.iter().all(|i| !i.is_phi()));
        }
        let text = module_text(&module);
        assert!(text.contains("ret i32 1") || text.contains("%x = add i32 1, 0"));
    }

    #[test]
    fn test_blocks_missing_ret_path_are_dropped() {
        let src = "\
define i32 @main() {
entry:
  %c = icmp eq i32 0, 0
  br i1 %c, label %good, label %spin
spin:
  br label %spin
good:
  ret i32 0
}
";
        let mut module = parse_module(src).unwrap();
        module.for_each_definition(|f, _: &mut Renamer| remove_unreachable(f));
        let f = module.function("@main").unwrap();
        assert_eq!(f.layout.len(), 2);
        // The branch toward the non-returning loop became a jump.
        assert!(matches!(
            f.block(f.layout[0]).terminator().kind,
            InstKind::Jump
        ));
    }

    #[test]
    fn test_copy_propagation_folds_chains() {
        let src = "\
define i32 @main() {
entry:
  %a = add i32 41, 1
  %b = add i32 %a, 0
  %c = add i32 %b, 0
  call void @printInt(i32 %c)
  ret i32 0
}
";
        let mut module = parse_module(src).unwrap();
        module.for_each_definition(|f, _: &mut Renamer| copy_propagation(f));
        let f = module.function("@main").unwrap();
        let entry = f.block(f.layout[0]);
        // %c's use now reads %b (one level per sweep).
        let InstKind::Call(call) = &entry.insts[3].kind else { panic!() };
        assert_eq!(call.args[0], "%b");
    }
}
