//! Register allocation.
//!
//! Twenty-six logical registers are available (ra, a0–a7, s0–s11, t2–t6;
//! t0/t1 stay reserved as emission scratch). Spilling is a single linear
//! pass: wherever more unassigned names are live than registers exist, the
//! excess is parked on the stack, picking the lexicographically smallest
//! names so the choice is deterministic, and preferring to keep names that
//! die in the very next instruction. Assignment then walks the dominator
//! tree, recomputing the vacancy set from each block's live-in and giving
//! every definition the smallest vacant id. Phi definitions are assigned
//! at block entry, after their operands' registers have been released.

use std::collections::BTreeSet;

use tracing::trace;

use crate::common::fx_hash::{FxHashMap, FxHashSet};
use crate::ir::dominator::DominatorTree;
use crate::ir::ir::*;
use crate::passes::utils::{build_cfg, positions};

/// Number of allocatable registers.
pub const K: usize = 26;

/// What the allocator decided for one SSA name. Stack slots carry the
/// pointer name they derive from so the frame builder can coalesce every
/// value of one promoted slot into a single location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegAlloc {
    Register(usize),
    Stack(String),
}

fn spill_to_stack(
    var: &str,
    unassigned: &mut BTreeSet<String>,
    table: &mut FxHashMap<String, RegAlloc>,
) {
    unassigned.remove(var);
    table.insert(var.to_string(), RegAlloc::Stack(pointer_name_of(var)));
}

fn choose_spill(
    vars: &mut BTreeSet<String>,
    k: usize,
    unassigned: &mut BTreeSet<String>,
    table: &mut FxHashMap<String, RegAlloc>,
) {
    while vars.len() > k {
        // Deterministic tie-break: the lexicographically smallest name.
        let var = vars.iter().next().unwrap().clone();
        vars.remove(&var);
        spill_to_stack(&var, unassigned, table);
    }
}

/// Names whose only use is the immediately following instruction; these
/// are kept in registers preferentially.
fn short_lived_vars(func: &Function) -> FxHashSet<String> {
    let mut short = FxHashSet::default();
    for &id in &func.layout {
        let insts = &func.block(id).insts;
        for i in 0..insts.len().saturating_sub(1) {
            if let Some(def) = insts[i].def() {
                if !insts[i + 1].live_out.contains(def) {
                    short.insert(def.to_string());
                }
            }
        }
    }
    short
}

fn spill(func: &Function) -> (BTreeSet<String>, FxHashMap<String, RegAlloc>) {
    let mut unassigned: BTreeSet<String> = func.var_defs.iter().cloned().collect();
    let mut table: FxHashMap<String, RegAlloc> = FxHashMap::default();
    let short_lived = short_lived_vars(func);

    if !func.is_leaf {
        spill_to_stack(RET_ADDR, &mut unassigned, &mut table);
    }
    for &id in &func.layout {
        for inst in &func.block(id).insts {
            let mut live: BTreeSet<String> = inst
                .live_out
                .iter()
                .filter(|v| unassigned.contains(*v))
                .cloned()
                .collect();
            if live.len() > K {
                let retained: Vec<String> =
                    live.iter().filter(|v| short_lived.contains(*v)).cloned().collect();
                for v in &retained {
                    live.remove(v);
                }
                assert!(
                    retained.len() <= K,
                    "{}: more short-lived values live than registers",
                    func.name
                );
                choose_spill(&mut live, K - retained.len(), &mut unassigned, &mut table);
            }
        }
    }
    let mut entry_live: BTreeSet<String> = func
        .block(func.entry())
        .live_in
        .iter()
        .filter(|v| unassigned.contains(*v))
        .cloned()
        .collect();
    if entry_live.len() > K {
        choose_spill(&mut entry_live, K, &mut unassigned, &mut table);
    }
    (unassigned, table)
}

pub fn allocate_registers(func: &Function) -> FxHashMap<String, RegAlloc> {
    let pos = positions(func);
    let cfg = build_cfg(func, &pos);
    let dfs_order = DominatorTree::compute(&cfg, 0).dfs_order();

    let (mut unassigned, mut table) = spill(func);
    let mut vacant: BTreeSet<usize> = (0..K).collect();

    fn allocate(
        var: &str,
        vacant: &mut BTreeSet<usize>,
        unassigned: &mut BTreeSet<String>,
        table: &mut FxHashMap<String, RegAlloc>,
    ) {
        if unassigned.contains(var) {
            let id = *vacant.iter().next().unwrap_or_else(|| {
                panic!("register allocator ran out of registers at {}", var)
            });
            vacant.remove(&id);
            unassigned.remove(var);
            table.insert(var.to_string(), RegAlloc::Register(id));
        }
    }

    allocate(RET_ADDR, &mut vacant, &mut unassigned, &mut table);
    for param in &func.params {
        allocate(&param.name, &mut vacant, &mut unassigned, &mut table);
    }

    for &i in &dfs_order {
        let block = func.block(func.layout[i]);
        vacant = (0..K).collect();
        for var in &block.live_in {
            if let Some(RegAlloc::Register(id)) = table.get(var) {
                vacant.remove(id);
            }
        }

        // Phi operands are consumed at block entry: their registers are
        // free before the phi destinations get assigned.
        for inst in block.insts.iter().take_while(|inst| inst.is_phi()) {
            inst.for_each_use(|var| {
                if !inst.live_out.contains(var) {
                    if let Some(RegAlloc::Register(id)) = table.get(var) {
                        vacant.insert(*id);
                    }
                }
            });
        }

        for inst in &block.insts {
            if !inst.is_phi() {
                inst.for_each_use(|var| {
                    if !inst.live_out.contains(var) {
                        if let Some(RegAlloc::Register(id)) = table.get(var) {
                            vacant.insert(*id);
                        }
                    }
                });
            }
            if let Some(def) = inst.def() {
                allocate(def, &mut vacant, &mut unassigned, &mut table);
            }
        }
    }

    trace!(function = %func.name, allocated = table.len(), "register allocation done");
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parser::parse_module;
    use crate::passes::liveness::liveness_analysis;

    fn alloc_for(src: &str, name: &str) -> (crate::ir::ir::IrModule, FxHashMap<String, RegAlloc>) {
        let mut module = parse_module(src).unwrap();
        module.for_each_definition(|f, _| {
            crate::passes::dce::naive_dce(f);
            liveness_analysis(f);
        });
        let table = {
            let f = module.function(name).unwrap();
            allocate_registers(f)
        };
        (module, table)
    }

    #[test]
    fn test_no_two_live_values_share_a_register() {
        let src = "\
define i32 @main() {
entry:
  %a = call i32 @getInt()
  %b = call i32 @getInt()
  %c = call i32 @getInt()
  %ab = add i32 %a, %b
  %abc = add i32 %ab, %c
  call void @printInt(i32 %abc)
  ret i32 0
}
";
        let (module, table) = alloc_for(src, "@main");
        let f = module.function("@main").unwrap();
        for &id in &f.layout {
            for inst in &f.block(id).insts {
                let mut seen = FxHashSet::default();
                for var in &inst.live_out {
                    if let Some(RegAlloc::Register(r)) = table.get(var) {
                        assert!(seen.insert(*r), "register {} shared in live set", r);
                    }
                }
                assert!(seen.len() <= K);
            }
        }
    }

    #[test]
    fn test_ret_addr_spilled_in_non_leaf() {
        let src = "\
define i32 @main() {
entry:
  %a = call i32 @getInt()
  ret i32 %a
}
";
        let (_, table) = alloc_for(src, "@main");
        assert!(matches!(table.get(RET_ADDR), Some(RegAlloc::Stack(_))));
    }

    #[test]
    fn test_ret_addr_gets_first_register_in_leaf() {
        let src = "\
define i32 @id(i32 %x.param) {
entry:
  ret i32 %x.param
}
";
        let (_, table) = alloc_for(src, "@id");
        assert_eq!(table.get(RET_ADDR), Some(&RegAlloc::Register(0)));
        assert_eq!(table.get("%x.param"), Some(&RegAlloc::Register(1)));
    }

    #[test]
    fn test_spill_slots_coalesce_by_pointer_name() {
        let mut table: FxHashMap<String, RegAlloc> = FxHashMap::default();
        let mut unassigned: BTreeSet<String> =
            ["%x.val".to_string(), "%x.val.2".to_string()].into_iter().collect();
        spill_to_stack("%x.val", &mut unassigned, &mut table);
        spill_to_stack("%x.val.2", &mut unassigned, &mut table);
        assert_eq!(table["%x.val"], table["%x.val.2"]);
    }
}
