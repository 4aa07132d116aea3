//! The middle-end passes and their presets.
//!
//! The backend relies on the `O0` sequence unconditionally: mem2reg must
//! have removed scalar allocas, MIR must have shaped instructions for
//! selection, and liveness must have annotated everything before register
//! allocation. `O1` and `O2` interleave the optional optimisations at
//! their required points — global-variable localisation ahead of mem2reg
//! (so its pseudo-slots get promoted), SCCP and the CFG cleanup after it,
//! GVN-PRE last before lowering.

pub mod cfg_transform;
pub mod dce;
pub mod globalvar;
pub mod gvn_pre;
pub mod liveness;
pub mod mem2reg;
pub mod mir;
pub mod sccp;
pub mod utils;

use tracing::debug;

use crate::common::renamer::Renamer;
use crate::ir::ir::{Function, IrModule};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptLevel {
    O0,
    O1,
    O2,
}

impl OptLevel {
    pub fn from_str(s: &str) -> Option<OptLevel> {
        match s {
            "O0" => Some(OptLevel::O0),
            "O1" => Some(OptLevel::O1),
            "O2" => Some(OptLevel::O2),
            _ => None,
        }
    }
}

pub struct Pass {
    pub name: &'static str,
    run: fn(&mut Function, &mut Renamer),
}

fn dce(f: &mut Function, _: &mut Renamer) {
    dce::naive_dce(f);
}

fn sccp(f: &mut Function, _: &mut Renamer) {
    sccp::sparse_conditional_constant_propagation(f);
}

fn remove_unreachable(f: &mut Function, _: &mut Renamer) {
    cfg_transform::remove_unreachable(f);
}

fn copy_propagation(f: &mut Function, _: &mut Renamer) {
    cfg_transform::copy_propagation(f);
}

fn rpo(f: &mut Function, _: &mut Renamer) {
    utils::rearrange_in_rpo(f);
}

fn liveness(f: &mut Function, _: &mut Renamer) {
    liveness::liveness_analysis(f);
}

/// The pass sequence for an optimisation level.
pub fn preset(level: OptLevel) -> Vec<Pass> {
    let mut passes = vec![Pass { name: "dce", run: dce }];
    if level != OptLevel::O0 {
        passes.push(Pass { name: "globalvar", run: globalvar::inline_global_variables });
    }
    passes.push(Pass { name: "mem2reg", run: mem2reg::mem2reg });
    passes.push(Pass { name: "dce-post-mem2reg", run: dce });
    if level != OptLevel::O0 {
        passes.push(Pass { name: "sccp", run: sccp });
        passes.push(Pass { name: "remove-unreachable", run: remove_unreachable });
        passes.push(Pass { name: "dce-post-sccp", run: dce });
    }
    if level == OptLevel::O2 {
        passes.push(Pass { name: "gvn-pre", run: gvn_pre::gvn_pre });
        passes.push(Pass { name: "copy-propagation", run: copy_propagation });
        passes.push(Pass { name: "dce-post-gvn", run: dce });
    }
    passes.push(Pass { name: "rpo", run: rpo });
    passes.push(Pass { name: "mir", run: mir::mir_builder });
    passes.push(Pass { name: "dce-post-mir", run: dce });
    passes.push(Pass { name: "liveness", run: liveness });
    passes
}

/// Run a preset over the module; `after_pass` sees every intermediate
/// state (used by `--dump-ir`).
pub fn run_passes(
    module: &mut IrModule,
    level: OptLevel,
    mut after_pass: impl FnMut(&str, &IrModule),
) {
    for pass in preset(level) {
        debug!(pass = pass.name, "running");
        module.for_each_definition(pass.run);
        after_pass(pass.name, module);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::interp::run_main;
    use crate::ir::parser::parse_module;

    const PROGRAM: &str = "\
@g = global i32 3
define i32 @scale(i32 %x.param) {
entry:
  %r.ptr = alloca i32
  %g = load i32, ptr @g
  %m = mul i32 %x.param, %g
  store i32 %m, ptr %r.ptr
  %r = load i32, ptr %r.ptr
  ret i32 %r
}
define i32 @main() {
entry:
  %a = call i32 @scale(i32 7)
  %b = add i32 %a, 2
  %c = icmp eq i32 %b, 23
  br i1 %c, label %yes, label %no
yes:
  call void @printInt(i32 %b)
  br label %exit
no:
  call void @printInt(i32 0)
  br label %exit
exit:
  ret i32 0
}
";

    #[test]
    fn test_every_level_preserves_behaviour_at_ir_stage() {
        // MIR rewrites leave the IR executable by the interpreter, so run
        // the whole preset and compare observable output.
        let reference = run_main(&parse_module(PROGRAM).unwrap()).1;
        assert_eq!(reference, "23");
        for level in [OptLevel::O0, OptLevel::O1, OptLevel::O2] {
            let mut module = parse_module(PROGRAM).unwrap();
            run_passes(&mut module, level, |_, _| {});
            assert_eq!(run_main(&module).1, reference, "level {:?}", level);
        }
    }
}
