//! Global-variable localisation for leaf functions.
//!
//! A leaf function cannot observe a global changing under it (globals are
//! not aliased through pointers; the front-end type system guarantees it),
//! so its hottest globals are cached in local pseudo-slots: loaded once at
//! entry, accessed through the slot in the body, and written back before
//! every return if the function ever stored them. mem2reg then promotes
//! the slots like any other alloca — this pass must run before it.

use crate::common::fx_hash::FxHashMap;
use crate::common::renamer::Renamer;
use crate::common::types::IrType;
use crate::ir::ir::*;

/// At most this many globals are localised per function.
const MAX_INLINED: usize = 8;

pub fn inline_global_variables(func: &mut Function, renamer: &mut Renamer) {
    if !func.is_leaf {
        return;
    }

    // Count loads and stores per global symbol.
    let mut counts: FxHashMap<String, u32> = FxHashMap::default();
    let mut types: FxHashMap<String, IrType> = FxHashMap::default();
    let mut stored: Vec<String> = Vec::new();
    for &id in &func.layout {
        for inst in &func.block(id).insts {
            match &inst.kind {
                InstKind::Load { addr, ty, .. } if is_global(addr) => {
                    *counts.entry(addr.clone()).or_insert(0) += 1;
                    types.insert(addr.clone(), *ty);
                }
                InstKind::Store { addr, ty, .. } if is_global(addr) => {
                    *counts.entry(addr.clone()).or_insert(0) += 1;
                    types.insert(addr.clone(), *ty);
                    if !stored.contains(addr) {
                        stored.push(addr.clone());
                    }
                }
                _ => {}
            }
        }
    }
    if counts.is_empty() {
        return;
    }

    let mut chosen: Vec<String> = counts.keys().cloned().collect();
    chosen.sort_by(|a, b| counts[b].cmp(&counts[a]).then_with(|| a.cmp(b)));
    chosen.truncate(MAX_INLINED);
    // Keep the write-back order deterministic.
    let stored: Vec<String> = chosen.iter().filter(|g| stored.contains(g)).cloned().collect();

    let local_names: FxHashMap<String, String> = chosen
        .iter()
        .map(|global| {
            let base = global.trim_start_matches('@');
            let base = base.strip_suffix(".ptr").unwrap_or(base);
            let local = format!("{}.ptr", renamer.get_name(&format!("%{}", base)));
            (global.clone(), local)
        })
        .collect();

    // Body: every access goes through the local slot instead.
    for &id in &func.layout.clone() {
        for inst in &mut func.block_mut(id).insts {
            match &mut inst.kind {
                InstKind::Load { addr, .. } | InstKind::Store { addr, .. } => {
                    if let Some(local) = local_names.get(addr) {
                        *addr = local.clone();
                    }
                }
                _ => {}
            }
        }
        // Write stored globals back just before the return.
        let is_ret = matches!(func.block(id).terminator().kind, InstKind::Ret { .. });
        if is_ret && !stored.is_empty() {
            let mut write_back = Vec::new();
            for global in &stored {
                let local = &local_names[global];
                let ty = types[global];
                let base = local.strip_suffix(".ptr").unwrap();
                let value = renamer.get_name(&format!("{}.val", base));
                write_back.push(Inst::new(InstKind::Load {
                    dest: value.clone(),
                    ty,
                    addr: local.clone(),
                }));
                write_back.push(Inst::new(InstKind::Store {
                    ty,
                    addr: global.clone(),
                    src: value,
                }));
            }
            let block = func.block_mut(id);
            let ret = block.insts.pop().unwrap();
            block.insts.extend(write_back);
            block.insts.push(ret);
        }
    }

    // Entry: allocate the slots and seed them from the globals, ahead of
    // everything except the existing allocas.
    let entry = func.entry();
    let block = func.block_mut(entry);
    let old = std::mem::take(&mut block.insts);
    let (mut allocas, rest): (Vec<Inst>, Vec<Inst>) =
        old.into_iter().partition(|inst| matches!(inst.kind, InstKind::Alloca { .. }));
    let mut seeds = Vec::new();
    for global in &chosen {
        let local = &local_names[global];
        let ty = types[global];
        let base = local.strip_suffix(".ptr").unwrap();
        let value = renamer.get_name(&format!("{}.val", base));
        allocas.push(Inst::new(InstKind::Alloca { dest: local.clone(), ty }));
        seeds.push(Inst::new(InstKind::Load { dest: value.clone(), ty, addr: global.clone() }));
        seeds.push(Inst::new(InstKind::Store { ty, addr: local.clone(), src: value }));
    }
    let block = func.block_mut(entry);
    block.insts = allocas;
    block.insts.extend(seeds);
    block.insts.extend(rest);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::interp::run_main;
    use crate::ir::parser::parse_module;
    use crate::ir::printer::function_text;
    use crate::passes::dce::naive_dce;

    const COUNTER: &str = "\
@count = global i32 10
define i32 @bump() {
entry:
  %v = load i32, ptr @count
  %v2 = add i32 %v, 1
  store i32 %v2, ptr @count
  %v3 = load i32, ptr @count
  ret i32 %v3
}
define i32 @main() {
entry:
  %a = call i32 @bump()
  %b = call i32 @bump()
  call void @printInt(i32 %b)
  ret i32 0
}
";

    fn localised() -> crate::ir::ir::IrModule {
        let mut module = parse_module(COUNTER).unwrap();
        module.for_each_definition(|f, _| naive_dce(f));
        module.for_each_definition(inline_global_variables);
        module
    }

    #[test]
    fn test_body_accesses_go_through_local_slot() {
        let module = localised();
        let bump = module.function("@bump").unwrap();
        let text = function_text(bump);
        // One load from the global at entry, one store back before ret;
        // body accesses use the slot.
        assert!(text.contains("alloca"));
        assert_eq!(text.matches("ptr @count").count(), 2);
    }

    #[test]
    fn test_behaviour_is_preserved() {
        let plain = parse_module(COUNTER).unwrap();
        let module = localised();
        assert_eq!(run_main(&plain).1, run_main(&module).1);
        assert_eq!(run_main(&module).1, "12");
    }

    #[test]
    fn test_non_leaf_functions_are_left_alone() {
        let module = localised();
        let main = module.function("@main").unwrap();
        let text = function_text(main);
        assert!(!text.contains("alloca"));
    }
}
