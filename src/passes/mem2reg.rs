//! Promotion of entry-block scalar allocas to SSA values (mem2reg).
//!
//! Phis are placed on the iterated dominance frontier of the store set of
//! each promotable pointer, then a dominator-tree DFS renames loads and
//! stores against a per-pointer value stack. A phi whose every recorded
//! incoming is `undef` proves the block is only reachable along paths that
//! never stored the pointer; such blocks are flagged unreachable and left
//! for the CFG cleanup to drop.

use crate::common::fx_hash::{FxHashMap, FxHashSet};
use crate::common::renamer::Renamer;
use crate::common::types::IrType;
use crate::ir::dominator::DominatorTree;
use crate::ir::ir::*;
use crate::passes::utils::{build_cfg, positions};

struct PhiSlot {
    dest: String,
    ty: IrType,
    /// Incoming value per predecessor layout position, recorded during the
    /// rename walk; predecessors never visited stay absent.
    values: FxHashMap<usize, String>,
}

pub fn mem2reg(func: &mut Function, renamer: &mut Renamer) {
    let pos = positions(func);
    let cfg = build_cfg(func, &pos);
    let layout = func.layout.clone();

    // Promotable pointers: every alloca in the entry block.
    let mut allocas: FxHashSet<String> = FxHashSet::default();
    let mut type_map: FxHashMap<String, IrType> = FxHashMap::default();
    for inst in &func.block(layout[0]).insts {
        if let InstKind::Alloca { dest, ty } = &inst.kind {
            allocas.insert(dest.clone());
            type_map.insert(dest.clone(), *ty);
        }
    }
    if allocas.is_empty() {
        return;
    }

    // Store set per block.
    let defs: Vec<FxHashSet<String>> = layout
        .iter()
        .map(|&id| {
            func.block(id)
                .insts
                .iter()
                .filter_map(|inst| match &inst.kind {
                    InstKind::Store { addr, .. } if allocas.contains(addr) => Some(addr.clone()),
                    _ => None,
                })
                .collect()
        })
        .collect();

    let dom = DominatorTree::compute(&cfg, 0);
    let frontier_preds = dom.iterated_frontier_predecessors(&cfg);

    // One phi slot per (join block, pointer stored on its frontier).
    let mut phi_map: Vec<FxHashMap<String, PhiSlot>> = Vec::with_capacity(layout.len());
    for preds in &frontier_preds {
        let mut slots: FxHashMap<String, PhiSlot> = FxHashMap::default();
        for &p in preds {
            for pointer in &defs[p] {
                if !slots.contains_key(pointer) {
                    let base = pointer.strip_suffix(".ptr").unwrap_or(pointer);
                    let dest = renamer.get_name(&format!("{}.val", base));
                    slots.insert(
                        pointer.clone(),
                        PhiSlot { dest, ty: type_map[pointer], values: FxHashMap::default() },
                    );
                }
            }
        }
        phi_map.push(slots);
    }

    let mut stacks: FxHashMap<String, Vec<String>> =
        allocas.iter().map(|p| (p.clone(), vec![UNDEF.to_string()])).collect();
    let mut rename_map: FxHashMap<String, String> = FxHashMap::default();
    let mut visited: FxHashSet<usize> = FxHashSet::default();

    // CFG DFS with explicit enter/exit events; recursion overflows on the
    // deep CFGs real programs produce.
    enum Ev {
        Enter(usize),
        Exit(usize),
    }
    let mut events = vec![Ev::Enter(0)];
    visited.insert(0);
    while let Some(ev) = events.pop() {
        match ev {
            Ev::Enter(i) => {
                let id = layout[i];
                for (pointer, slot) in &phi_map[i] {
                    stacks.get_mut(pointer).unwrap().push(slot.dest.clone());
                }
                for inst in &mut func.block_mut(id).insts {
                    inst.rename_uses(&rename_map);
                    match &inst.kind {
                        InstKind::Store { addr, src, .. } if allocas.contains(addr) => {
                            let src = src.clone();
                            stacks.get_mut(addr).unwrap().push(src);
                        }
                        InstKind::Load { dest, addr, .. } if allocas.contains(addr) => {
                            let top = stacks[addr].last().unwrap().clone();
                            rename_map.insert(dest.clone(), top);
                        }
                        _ => {}
                    }
                }
                events.push(Ev::Exit(i));
                // Record this block's value tops into every successor's phi
                // slots, then descend into the unvisited ones.
                let succs = cfg[i].clone();
                let mut fresh = Vec::new();
                for &succ in &succs {
                    for (pointer, slot) in phi_map[succ].iter_mut() {
                        let top = stacks[pointer].last().unwrap().clone();
                        slot.values.insert(i, top);
                    }
                    if visited.insert(succ) {
                        fresh.push(succ);
                    } else {
                        // Keep an already-visited successor's leading phis
                        // consistent with names renamed since.
                        for inst in &mut func.block_mut(layout[succ]).insts {
                            if !inst.is_phi() {
                                break;
                            }
                            inst.rename_uses(&rename_map);
                        }
                    }
                }
                for &succ in fresh.iter().rev() {
                    events.push(Ev::Enter(succ));
                }
            }
            Ev::Exit(i) => {
                let id = layout[i];
                for pointer in phi_map[i].keys() {
                    stacks.get_mut(pointer).unwrap().pop();
                }
                for inst in &func.block(id).insts {
                    if let InstKind::Store { addr, .. } = &inst.kind {
                        if allocas.contains(addr) {
                            stacks.get_mut(addr).unwrap().pop();
                        }
                    }
                }
                func.block_mut(id).insts.retain(|inst| match &inst.kind {
                    InstKind::Load { addr, .. } | InstKind::Store { addr, .. } => {
                        !allocas.contains(addr)
                    }
                    _ => true,
                });
            }
        }
    }

    // Materialise the phis, deterministically ordered by destination name.
    for (i, slots) in phi_map.into_iter().enumerate() {
        if slots.is_empty() {
            continue;
        }
        let id = layout[i];
        if slots.values().any(|slot| slot.values.values().all(|v| v == UNDEF)) {
            func.block_mut(id).unreachable = true;
        }
        let preds = func.block(id).predecessors.clone();
        let mut phis: Vec<Inst> = slots
            .into_values()
            .map(|slot| {
                let incoming = preds
                    .iter()
                    .map(|&p| {
                        let value = slot
                            .values
                            .get(&pos[p.index()])
                            .cloned()
                            .unwrap_or_else(|| UNDEF.to_string());
                        (p, value)
                    })
                    .collect();
                Inst::new(InstKind::Phi { dest: slot.dest, ty: slot.ty, incoming })
            })
            .collect();
        phis.sort_by(|a, b| {
            let (InstKind::Phi { dest: da, .. }, InstKind::Phi { dest: db, .. }) = (&a.kind, &b.kind)
            else {
                unreachable!()
            };
            da.cmp(db)
        });
        let block = func.block_mut(id);
        phis.append(&mut block.insts);
        block.insts = phis;
    }

    // The entry block no longer contains any alloca.
    func.block_mut(layout[0]).insts.retain(|inst| !matches!(inst.kind, InstKind::Alloca { .. }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::interp::run_main;
    use crate::ir::parser::parse_module;
    use crate::ir::printer::function_text;

    const LOOP_SUM: &str = "\
define i32 @main() {
entry:
  %s.ptr = alloca i32
  %i.ptr = alloca i32
  store i32 0, ptr %s.ptr
  store i32 1, ptr %i.ptr
  br label %cond
cond:
  %i = load i32, ptr %i.ptr
  %c = icmp sle i32 %i, 10
  br i1 %c, label %body, label %done
body:
  %s = load i32, ptr %s.ptr
  %i.2 = load i32, ptr %i.ptr
  %s.next = add i32 %s, %i.2
  store i32 %s.next, ptr %s.ptr
  %i.next = add i32 %i.2, 1
  store i32 %i.next, ptr %i.ptr
  br label %cond
done:
  %r = load i32, ptr %s.ptr
  call void @printInt(i32 %r)
  ret i32 0
}
";

    fn promote(src: &str) -> (String, String) {
        let mut module = parse_module(src).unwrap();
        let before = run_main(&module).1;
        module.for_each_definition(mem2reg);
        let after = run_main(&module).1;
        (before, after)
    }

    #[test]
    fn test_promotion_preserves_behaviour() {
        let (before, after) = promote(LOOP_SUM);
        assert_eq!(before, "55");
        assert_eq!(after, "55");
    }

    #[test]
    fn test_no_alloca_or_promoted_memory_ops_remain() {
        let mut module = parse_module(LOOP_SUM).unwrap();
        module.for_each_definition(mem2reg);
        let f = module.function("@main").unwrap();
        for &id in &f.layout {
            for inst in &f.block(id).insts {
                assert!(!matches!(inst.kind, InstKind::Alloca { .. }));
                if let InstKind::Load { addr, .. } | InstKind::Store { addr, .. } = &inst.kind {
                    assert!(!addr.ends_with(".ptr"), "promoted access survived: {}", addr);
                }
            }
        }
        // The loop header got a phi per pointer, ordered by name.
        let cond = f.layout[1];
        let phis: Vec<_> =
            f.block(cond).insts.iter().take_while(|i| i.is_phi()).collect();
        assert_eq!(phis.len(), 2);
    }

    #[test]
    fn test_phi_incomings_match_predecessors() {
        let mut module = parse_module(LOOP_SUM).unwrap();
        module.for_each_definition(mem2reg);
        let f = module.function("@main").unwrap();
        for &id in &f.layout {
            let block = f.block(id);
            for inst in block.insts.iter().take_while(|i| i.is_phi()) {
                let InstKind::Phi { incoming, .. } = &inst.kind else { unreachable!() };
                assert_eq!(incoming.len(), block.predecessors.len());
                for ((p, _), &q) in incoming.iter().zip(&block.predecessors) {
                    assert_eq!(*p, q);
                }
            }
        }
    }

    #[test]
    fn test_branchy_program_reads_latest_store() {
        let src = "\
define i32 @main() {
entry:
  %x.ptr = alloca i32
  store i32 1, ptr %x.ptr
  %n = call i32 @string.length(ptr @.str)
  %c = icmp sgt i32 %n, 2
  br i1 %c, label %then, label %join
then:
  store i32 7, ptr %x.ptr
  br label %join
join:
  %x = load i32, ptr %x.ptr
  call void @printInt(i32 %x)
  ret i32 0
}
";
        let src = format!(
            "@.str = private unnamed_addr constant [4 x i8] c\"abc\\00\"\n{}",
            src
        );
        let (before, after) = promote(&src);
        assert_eq!(before, "7");
        assert_eq!(after, "7");
    }

    #[test]
    fn test_undef_path_marks_block() {
        // %x.ptr is stored only in one arm; the join phi sees undef on the
        // other path but not on all paths, so nothing is marked.
        let mut module = parse_module(
            "\
define i32 @main() {
entry:
  %x.ptr = alloca i32
  %c = icmp eq i32 1, 1
  br i1 %c, label %a, label %b
a:
  store i32 5, ptr %x.ptr
  br label %join
b:
  br label %join
join:
  %x = load i32, ptr %x.ptr
  ret i32 %x
}
",
        )
        .unwrap();
        module.for_each_definition(mem2reg);
        let f = module.function("@main").unwrap();
        let join = f
            .layout
            .iter()
            .find(|&&id| f.block(id).name == "join")
            .copied()
            .unwrap();
        assert!(!f.block(join).unreachable);
        let text = function_text(f);
        assert!(text.contains("phi"));
        assert!(text.contains("undef"));
    }
}
