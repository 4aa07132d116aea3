//! Naive dead-code elimination.
//!
//! Instructions become nodes in a dependency graph: a node for each defined
//! name, plus shared nodes for the effectful kinds (`branch`, `jump`,
//! `ret`, `store`, effectful `call`). Reverse BFS from the effect roots
//! marks the live set; everything unmarked is deleted. An effectful call
//! whose result is unused keeps the call but drops the definition.
//!
//! Also recomputes `is_leaf` from the surviving call set. Running the pass
//! twice is safe; several pipeline points rely on that.

use crate::common::fx_hash::{FxHashMap, FxHashSet};
use crate::ir::ir::*;

const EFFECT: &str = "effect";

fn node_key(inst: &Inst) -> String {
    if let Some(def) = inst.def() {
        return def.to_string();
    }
    match &inst.kind {
        InstKind::Branch { .. } => "branch".to_string(),
        InstKind::Jump => "jump".to_string(),
        InstKind::Ret { .. } => "ret".to_string(),
        InstKind::Store { .. } => "store".to_string(),
        InstKind::Call(call) => {
            if call.no_effect && !call.tail_call {
                "call_no".to_string()
            } else {
                "call".to_string()
            }
        }
        _ => panic!("dce: instruction defines nothing and has no effect class"),
    }
}

pub fn naive_dce(func: &mut Function) {
    let mut graph: FxHashMap<String, FxHashSet<String>> = FxHashMap::default();
    let mut effect_roots: FxHashSet<String> = FxHashSet::default();
    for root in ["branch", "jump", "ret", "store", "call"] {
        effect_roots.insert(root.to_string());
    }
    graph.insert(EFFECT.to_string(), effect_roots);
    graph.entry("call".to_string()).or_default();

    for &id in &func.layout {
        for inst in &func.block(id).insts {
            let node = node_key(inst);
            // An effectful call that defines a value roots its definition.
            if let InstKind::Call(call) = &inst.kind {
                if inst.def().is_some() && !call.no_effect {
                    graph.get_mut("call").unwrap().insert(node.clone());
                }
            }
            let entry = graph.entry(node).or_default();
            inst.for_each_use(|u| {
                if is_local(u) {
                    entry.insert(u.to_string());
                }
            });
        }
    }

    let mut live: FxHashSet<String> = FxHashSet::default();
    live.insert(EFFECT.to_string());
    let mut queue: Vec<String> = vec![EFFECT.to_string()];
    while let Some(node) = queue.pop() {
        if let Some(nexts) = graph.get(&node) {
            for next in nexts {
                if graph.contains_key(next) && live.insert(next.clone()) {
                    queue.push(next.clone());
                }
            }
        }
    }

    for &id in &func.layout.clone() {
        func.block_mut(id).insts.retain(|inst| live.contains(&node_key(inst)));
    }

    // Drop definitions of effectful calls nobody reads, and refresh the
    // leaf flag.
    let mut used: FxHashSet<String> = FxHashSet::default();
    for &id in &func.layout {
        for inst in &func.block(id).insts {
            inst.for_each_use(|u| {
                used.insert(u.to_string());
            });
        }
    }
    let mut is_leaf = true;
    for &id in &func.layout.clone() {
        for inst in &mut func.block_mut(id).insts {
            if let InstKind::Call(call) = &mut inst.kind {
                is_leaf = false;
                if let Some(dest) = &call.dest {
                    if !used.contains(dest) {
                        call.dest = None;
                    }
                }
            }
        }
    }
    func.is_leaf = is_leaf;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::renamer::Renamer;
    use crate::ir::parser::parse_module;
    use crate::ir::printer::module_text;

    fn run_dce(src: &str) -> crate::ir::ir::IrModule {
        let mut module = parse_module(src).unwrap();
        module.for_each_definition(|f, _: &mut Renamer| naive_dce(f));
        module
    }

    #[test]
    fn test_removes_unused_pure_chain() {
        let module = run_dce(
            "\
define i32 @main() {
entry:
  %a = add i32 1, 2
  %b = mul i32 %a, 3
  %kept = add i32 4, 5
  ret i32 %kept
}
",
        );
        let f = module.function("@main").unwrap();
        let entry = f.block(f.layout[0]);
        assert_eq!(entry.insts.len(), 2);
        assert_eq!(entry.insts[0].def(), Some("%kept"));
    }

    #[test]
    fn test_unused_no_effect_call_is_removed_entirely() {
        let module = run_dce(
            "\
@.str = private unnamed_addr constant [3 x i8] c\"ab\\00\"
define i32 @main() {
entry:
  %n = call i32 @string.length(ptr @.str)
  ret i32 0
}
",
        );
        let f = module.function("@main").unwrap();
        assert_eq!(f.block(f.layout[0]).insts.len(), 1);
        assert!(f.is_leaf);
    }

    #[test]
    fn test_unused_effectful_call_keeps_call_drops_def() {
        let module = run_dce(
            "\
define i32 @main() {
entry:
  %n = call i32 @getInt()
  ret i32 0
}
",
        );
        let f = module.function("@main").unwrap();
        let entry = f.block(f.layout[0]);
        assert_eq!(entry.insts.len(), 2);
        let InstKind::Call(call) = &entry.insts[0].kind else { panic!("call removed") };
        assert!(call.dest.is_none());
        assert!(!f.is_leaf);
    }

    #[test]
    fn test_store_roots_its_value_chain() {
        let module = run_dce(
            "\
@g = global i32 0
define i32 @main() {
entry:
  %v = add i32 20, 22
  store i32 %v, ptr @g
  ret i32 0
}
",
        );
        let text = module_text(&module);
        assert!(text.contains("%v = add i32 20, 22"));
        assert!(text.contains("store i32 %v, ptr @g"));
    }

    #[test]
    fn test_idempotent() {
        let src = "\
define i32 @main() {
entry:
  %a = add i32 1, 2
  %n = call i32 @getInt()
  %b = mul i32 %n, %a
  call void @printInt(i32 %b)
  ret i32 0
}
";
        let mut module = parse_module(src).unwrap();
        module.for_each_definition(|f, _: &mut Renamer| naive_dce(f));
        let once = module_text(&module);
        module.for_each_definition(|f, _: &mut Renamer| naive_dce(f));
        assert_eq!(module_text(&module), once);
    }
}
