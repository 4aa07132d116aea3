//! LLVM-15-compatible textual form of the IR.
//!
//! Used by `--emit-llvm`, the `--dump-ir` snapshots, and test assertions.
//! After MIR lowering the module contains constructs plain LLVM does not
//! have (`smulh`, pointer `add`, fused branches, tail-call/ret folding);
//! those print in an obvious extended syntax since the dump is for humans.

use std::fmt::Write;

use crate::ir::ir::*;

pub fn module_text(module: &IrModule) -> String {
    let mut out = String::new();
    for class in &module.classes {
        let members: Vec<String> = class.members.iter().map(|ty| ty.to_string()).collect();
        let _ = writeln!(out, "{} = type {{{}}}", class.name, members.join(", "));
    }
    for global in &module.globals {
        let _ = writeln!(out, "{} = global {} {}", global.name, global.ty, global.init);
    }
    for s in &module.strings {
        let _ = writeln!(
            out,
            "{} = private unnamed_addr constant [{} x i8] c\"{}\\00\"",
            s.name,
            s.value.len() + 1,
            escape_ll(&s.value)
        );
    }
    for function in &module.functions {
        out.push_str(&function_text(function));
    }
    out
}

pub fn function_text(func: &Function) -> String {
    let mut out = String::new();
    if func.is_declaration() {
        let params: Vec<String> = func.params.iter().map(|p| p.ty.to_string()).collect();
        let _ = writeln!(out, "declare {} {}({})", func.ret_ty, func.name, params.join(", "));
        return out;
    }
    let params: Vec<String> = func.params.iter().map(|p| format!("{} {}", p.ty, p.name)).collect();
    let _ = writeln!(out, "define {} {}({}) {{", func.ret_ty, func.name, params.join(", "));
    for &id in &func.layout {
        let block = func.block(id);
        let _ = writeln!(out, "{}:", block.name);
        for inst in &block.insts {
            let _ = writeln!(out, "  {}", inst_text(inst, block, func));
        }
    }
    out.push_str("}\n");
    out
}

pub fn inst_text(inst: &Inst, block: &Block, func: &Function) -> String {
    match &inst.kind {
        InstKind::Bin { dest, op, ty, lhs, rhs } => {
            format!("{} = {} {} {}, {}", dest, op.as_str(), ty, lhs, rhs)
        }
        InstKind::Icmp { dest, op, ty, lhs, rhs } => {
            format!("{} = icmp {} {} {}, {}", dest, op.as_str(), ty, lhs, rhs)
        }
        InstKind::Load { dest, ty, addr } => format!("{} = load {}, ptr {}", dest, ty, addr),
        InstKind::Store { ty, addr, src } => format!("store {} {}, ptr {}", ty, src, addr),
        InstKind::Alloca { dest, ty } => format!("{} = alloca {}", dest, ty),
        InstKind::Gep { dest, ty_name, ptr, index, member } => {
            let index = index.as_deref().unwrap_or("0");
            match member {
                Some(member) => format!(
                    "{} = getelementptr inbounds {}, ptr {}, i32 {}, i32 {}",
                    dest, ty_name, ptr, index, member
                ),
                None => format!("{} = getelementptr inbounds {}, ptr {}, i32 {}", dest, ty_name, ptr, index),
            }
        }
        InstKind::Call(call) => {
            let args: Vec<String> = call
                .arg_tys
                .iter()
                .zip(&call.args)
                .map(|(ty, arg)| format!("{} {}", ty, arg))
                .collect();
            let tail = if call.tail_call { "tail " } else { "" };
            let body = format!("{}call {} {}({})", tail, call.ret_ty, call.callee, args.join(", "));
            match (&call.dest, call.tail_call) {
                (Some(dest), false) => format!("{} = {}", dest, body),
                _ => body,
            }
        }
        InstKind::Phi { dest, ty, incoming } => {
            let entries: Vec<String> = incoming
                .iter()
                .map(|(pred, value)| format!("[{}, %{}]", value, func.block(*pred).name))
                .collect();
            format!("{} = phi {} {}", dest, ty, entries.join(", "))
        }
        InstKind::Jump => format!("br label %{}", func.block(block.successors[0]).name),
        InstKind::Branch { cond, fused } => {
            let t = &func.block(block.successors[0]).name;
            let f = &func.block(block.successors[1]).name;
            match fused {
                Some(icmp) => format!(
                    "br ({} {} {}, {}), label %{}, label %{}",
                    icmp.op.as_str(),
                    icmp.ty,
                    icmp.lhs,
                    icmp.rhs,
                    t,
                    f
                ),
                None => format!("br i1 {}, label %{}, label %{}", cond, t, f),
            }
        }
        InstKind::Ret { ty, value } => match value {
            Some(value) => format!("ret {} {}", ty, value),
            None => format!("ret {}", ty),
        },
    }
}

/// Only `\n`, `\` and `"` occur in source strings; NULs are appended by the
/// printer itself.
pub fn escape_ll(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        match b {
            b'\\' => out.push_str("\\5C"),
            b'\n' => out.push_str("\\0A"),
            b'"' => out.push_str("\\22"),
            _ => out.push(b as char),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::IrType;

    fn two_block_function() -> Function {
        let mut f = Function::new(
            "@main",
            IrType::I32,
            vec![Param { name: "%n.param".to_string(), ty: IrType::I32 }],
        );
        let entry = f.add_block(Block::new("entry"));
        let exit = f.add_block(Block::new("exit"));
        f.layout = vec![entry, exit];
        f.block_mut(entry).insts.push(Inst::new(InstKind::Bin {
            dest: "%x".to_string(),
            op: BinOp::Add,
            ty: IrType::I32,
            lhs: "%n.param".to_string(),
            rhs: "1".to_string(),
        }));
        f.block_mut(entry).insts.push(Inst::new(InstKind::Jump));
        f.block_mut(entry).successors = vec![exit];
        f.block_mut(exit).predecessors = vec![entry];
        f.block_mut(exit)
            .insts
            .push(Inst::new(InstKind::Ret { ty: IrType::I32, value: Some("%x".to_string()) }));
        f
    }

    #[test]
    fn test_function_text() {
        let text = function_text(&two_block_function());
        assert!(text.contains("define i32 @main(i32 %n.param) {"));
        assert!(text.contains("%x = add i32 %n.param, 1"));
        assert!(text.contains("br label %exit"));
        assert!(text.contains("ret i32 %x"));
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape_ll("a\"b\\c\nd"), "a\\22b\\5Cc\\0Ad");
    }
}
