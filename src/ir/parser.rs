//! Reader for the textual IR form — the seam to the external front end.
//!
//! The reader accepts exactly what the printer emits for a pre-MIR module:
//! class records, globals, string literals, `declare` lines and `define`
//! bodies whose instructions come from the closed set. Anything else is a
//! user-visible parse error carrying the source line.

use crate::common::error::CompileError;
use crate::common::fx_hash::FxHashMap;
use crate::common::types::{array_ctor_signature, ClassLayout, FunctionSig, IrType};
use crate::ir::ir::*;

pub fn parse_module(src: &str) -> Result<IrModule, CompileError> {
    let mut module = IrModule::new();

    // Known call targets: runtime builtins plus every declare/define header.
    let mut sigs: FxHashMap<String, FunctionSig> = FxHashMap::default();
    for function in &module.functions {
        sigs.insert(function.name.clone(), function.signature());
    }
    for (lineno, line) in numbered_lines(src) {
        if line.starts_with("declare ") || line.starts_with("define ") {
            let sig = parse_header(line, lineno)?.0;
            sigs.insert(sig.name.clone(), sig);
        }
    }

    let mut lines = numbered_lines(src).collect::<Vec<_>>().into_iter();
    while let Some((lineno, line)) = lines.next() {
        if let Some(rest) = assignment_of(line, "= type ") {
            let (name, body) = rest;
            let body = body.trim().trim_start_matches('{').trim_end_matches('}');
            let mut members = Vec::new();
            for tok in toks(body) {
                let ty = IrType::from_str(tok)
                    .ok_or_else(|| CompileError::parse(lineno, format!("bad member type `{}`", tok)))?;
                members.push(ty);
            }
            module.classes.retain(|c| c.name != name);
            module.classes.push(ClassLayout { name: name.to_string(), members });
            module.renamer.register_name(name);
        } else if let Some((name, body)) = assignment_of(line, "= global ") {
            let t = toks(body);
            if t.len() != 2 {
                return Err(CompileError::parse(lineno, "expected `@g = global <ty> <init>`"));
            }
            let ty = IrType::from_str(t[0])
                .ok_or_else(|| CompileError::parse(lineno, format!("bad type `{}`", t[0])))?;
            module.globals.push(GlobalVar { name: name.to_string(), ty, init: parse_imm(t[1]) });
            module.renamer.register_name(name);
        } else if let Some((name, body)) = assignment_of(line, "= private unnamed_addr constant ") {
            let value = parse_string_constant(body, lineno)?;
            module.strings.push(StrLit { name: name.to_string(), value });
            module.renamer.register_name(name);
        } else if line.starts_with("declare ") {
            let sig = parse_header(line, lineno)?.0;
            if module.function(&sig.name).is_none() {
                module.functions.push(Function::declaration(&sig));
            }
        } else if line.starts_with("define ") {
            let (sig, params) = parse_header(line, lineno)?;
            let mut body = Vec::new();
            let mut closed = false;
            for (lineno, line) in lines.by_ref() {
                if line == "}" {
                    closed = true;
                    break;
                }
                body.push((lineno, line));
            }
            if !closed {
                return Err(CompileError::parse(lineno, "unterminated function body"));
            }
            let function = parse_body(sig, params, &body, &sigs, &mut module)?;
            module.renamer.register_name(&function.name);
            match module.functions.iter_mut().find(|f| f.name == function.name) {
                Some(slot) => *slot = function,
                None => module.functions.push(function),
            }
        } else {
            return Err(CompileError::parse(lineno, format!("unrecognised line `{}`", line)));
        }
    }

    Ok(module)
}

fn numbered_lines(src: &str) -> impl Iterator<Item = (usize, &str)> {
    src.lines().enumerate().filter_map(|(i, raw)| {
        // `;` opens a comment, but only outside a string constant.
        let line = match raw.find(';') {
            Some(pos) if !raw[..pos].contains('"') => raw[..pos].trim(),
            _ => raw.trim(),
        };
        if line.is_empty() {
            None
        } else {
            Some((i + 1, line))
        }
    })
}

/// `"%x = type {...}"` with `marker = "= type "` yields `("%x", "{...}")`.
fn assignment_of<'a>(line: &'a str, marker: &str) -> Option<(&'a str, &'a str)> {
    let pos = line.find(marker)?;
    let name = line[..pos].trim();
    if !(name.starts_with('%') || name.starts_with('@')) || name.contains(' ') {
        return None;
    }
    Some((name, line[pos + marker.len()..].trim()))
}

/// Split on whitespace and commas.
fn toks(s: &str) -> Vec<&str> {
    s.split(|c: char| c.is_whitespace() || c == ',').filter(|t| !t.is_empty()).collect()
}

/// `declare i32 @f(ptr, i32)` or `define i32 @f(i32 %a.param, …) {`.
fn parse_header(line: &str, lineno: usize) -> Result<(FunctionSig, Vec<Param>), CompileError> {
    let bad = |msg: &str| CompileError::parse(lineno, msg.to_string());
    let rest = line
        .strip_prefix("declare ")
        .or_else(|| line.strip_prefix("define "))
        .ok_or_else(|| bad("expected function header"))?;
    let rest = rest.trim_end_matches('{').trim();
    let open = rest.find('(').ok_or_else(|| bad("missing `(`"))?;
    let close = rest.rfind(')').ok_or_else(|| bad("missing `)`"))?;
    let head = toks(&rest[..open]);
    let [ret, name] = head[..] else {
        return Err(bad("expected `<ret-ty> @name`"));
    };
    let ret = IrType::from_str(ret).ok_or_else(|| bad("bad return type"))?;
    if !name.starts_with('@') {
        return Err(bad("function names are `@`-prefixed"));
    }

    let mut params = Vec::new();
    for piece in rest[open + 1..close].split(',') {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        let t = toks(piece);
        let ty = IrType::from_str(t[0])
            .ok_or_else(|| CompileError::parse(lineno, format!("bad parameter type `{}`", t[0])))?;
        let pname = t.get(1).copied().unwrap_or("");
        params.push(Param { name: pname.to_string(), ty });
    }

    let sig = FunctionSig {
        name: name.to_string(),
        params: params.iter().map(|p| p.ty).collect(),
        ret,
        no_effect: false,
    };
    Ok((sig, params))
}

fn parse_string_constant(body: &str, lineno: usize) -> Result<String, CompileError> {
    let bad = |msg: &str| CompileError::parse(lineno, msg.to_string());
    let open = body.find("c\"").ok_or_else(|| bad("missing `c\"`"))?;
    let payload = &body[open + 2..];
    let payload = payload.strip_suffix('"').ok_or_else(|| bad("unterminated string constant"))?;
    let mut value = String::new();
    let mut chars = payload.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            value.push(c);
            continue;
        }
        let hi = chars.next().ok_or_else(|| bad("truncated escape"))?;
        let lo = chars.next().ok_or_else(|| bad("truncated escape"))?;
        let byte = u8::from_str_radix(&format!("{}{}", hi, lo), 16)
            .map_err(|_| bad("bad hex escape"))?;
        value.push(byte as char);
    }
    // The printer appends the NUL terminator; strip it back off.
    if value.ends_with('\0') {
        value.pop();
    }
    Ok(value)
}

/// Partially-parsed block: phi incomings and terminator targets still hold
/// label names until the whole body is read.
struct PendingBlock {
    name: String,
    insts: Vec<Inst>,
    /// Per-phi label lists, aligned with the leading phi run.
    phi_labels: Vec<Vec<String>>,
    succ_labels: Vec<String>,
}

fn parse_body(
    sig: FunctionSig,
    params: Vec<Param>,
    body: &[(usize, &str)],
    sigs: &FxHashMap<String, FunctionSig>,
    module: &mut IrModule,
) -> Result<Function, CompileError> {
    let mut function = Function::new(sig.name.clone(), sig.ret, params);
    let mut pending: Vec<PendingBlock> = Vec::new();

    for &(lineno, line) in body {
        if let Some(label) = line.strip_suffix(':') {
            if label.contains(' ') {
                return Err(CompileError::parse(lineno, format!("bad label `{}`", label)));
            }
            pending.push(PendingBlock {
                name: label.to_string(),
                insts: Vec::new(),
                phi_labels: Vec::new(),
                succ_labels: Vec::new(),
            });
            continue;
        }
        let block = pending
            .last_mut()
            .ok_or_else(|| CompileError::parse(lineno, "instruction before first block label"))?;
        parse_inst(line, lineno, sigs, block)?;
    }

    if pending.is_empty() {
        return Err(CompileError::parse(0, format!("function {} has no blocks", sig.name)));
    }

    let mut ids: FxHashMap<String, BlockId> = FxHashMap::default();
    for pb in &pending {
        let id = function.add_block(Block::new(pb.name.clone()));
        if ids.insert(pb.name.clone(), id).is_some() {
            return Err(CompileError::parse(0, format!("duplicate block label `{}`", pb.name)));
        }
        function.layout.push(id);
        module.renamer.register_name(&pb.name);
    }

    // Wire edges, then re-align phi incomings to predecessor order.
    for (pos, pb) in pending.iter().enumerate() {
        let id = function.layout[pos];
        for label in &pb.succ_labels {
            let target = *ids
                .get(label)
                .ok_or_else(|| CompileError::parse(0, format!("unknown block `%{}`", label)))?;
            function.block_mut(id).successors.push(target);
            function.block_mut(target).predecessors.push(id);
        }
    }
    for (pos, mut pb) in pending.into_iter().enumerate() {
        let id = function.layout[pos];
        let preds = function.block(id).predecessors.clone();
        for (phi_idx, labels) in pb.phi_labels.iter().enumerate() {
            let inst = &mut pb.insts[phi_idx];
            let InstKind::Phi { dest, incoming, .. } = &mut inst.kind else {
                unreachable!();
            };
            if labels.len() != preds.len() {
                return Err(CompileError::parse(
                    0,
                    format!("phi {} has {} incomings for {} predecessors", dest, labels.len(), preds.len()),
                ));
            }
            let values = std::mem::take(incoming);
            for &pred in &preds {
                let pred_name = &function.block(pred).name;
                let found = labels
                    .iter()
                    .position(|l| l == pred_name)
                    .ok_or_else(|| {
                        CompileError::parse(0, format!("phi {} misses predecessor %{}", dest, pred_name))
                    })?;
                incoming.push((pred, values[found].1.clone()));
            }
        }
        for inst in &pb.insts {
            if let Some(def) = inst.def() {
                module.renamer.register_name(def);
            }
        }
        let terminated = pb.insts.last().is_some_and(|inst| inst.is_terminator());
        if !terminated {
            return Err(CompileError::parse(0, format!("block `{}` has no terminator", pb.name)));
        }
        if pb.insts.iter().take(pb.insts.len() - 1).any(|inst| inst.is_terminator()) {
            return Err(CompileError::parse(0, format!("terminator mid-block in `{}`", pb.name)));
        }
        function.block_mut(id).insts = pb.insts;
    }

    Ok(function)
}

fn parse_inst(
    line: &str,
    lineno: usize,
    sigs: &FxHashMap<String, FunctionSig>,
    block: &mut PendingBlock,
) -> Result<(), CompileError> {
    let bad = |msg: String| CompileError::parse(lineno, msg);

    let (dest, rest) = match line.find(" = ") {
        Some(pos) if line.starts_with('%') => {
            (Some(line[..pos].trim().to_string()), line[pos + 3..].trim())
        }
        _ => (None, line),
    };

    let op = rest.split_whitespace().next().unwrap_or("");
    let kind = match op {
        _ if BinOp::from_str(op).is_some() => {
            let t = toks(rest);
            let [_, ty, lhs, rhs] = t[..] else {
                return Err(bad(format!("malformed `{}`", op)));
            };
            InstKind::Bin {
                dest: dest.ok_or_else(|| bad(format!("`{}` needs a destination", op)))?,
                op: BinOp::from_str(op).unwrap(),
                ty: IrType::from_str(ty).ok_or_else(|| bad(format!("bad type `{}`", ty)))?,
                lhs: lhs.to_string(),
                rhs: rhs.to_string(),
            }
        }
        "icmp" => {
            let t = toks(rest);
            let [_, pred, ty, lhs, rhs] = t[..] else {
                return Err(bad("malformed `icmp`".to_string()));
            };
            InstKind::Icmp {
                dest: dest.ok_or_else(|| bad("`icmp` needs a destination".to_string()))?,
                op: IcmpOp::from_str(pred).ok_or_else(|| bad(format!("bad predicate `{}`", pred)))?,
                ty: IrType::from_str(ty).ok_or_else(|| bad(format!("bad type `{}`", ty)))?,
                lhs: lhs.to_string(),
                rhs: rhs.to_string(),
            }
        }
        "load" => {
            let t = toks(rest);
            let [_, ty, "ptr", addr] = t[..] else {
                return Err(bad("expected `load <ty>, ptr <addr>`".to_string()));
            };
            InstKind::Load {
                dest: dest.ok_or_else(|| bad("`load` needs a destination".to_string()))?,
                ty: IrType::from_str(ty).ok_or_else(|| bad(format!("bad type `{}`", ty)))?,
                addr: addr.to_string(),
            }
        }
        "store" => {
            let t = toks(rest);
            let [_, ty, src, "ptr", addr] = t[..] else {
                return Err(bad("expected `store <ty> <src>, ptr <addr>`".to_string()));
            };
            InstKind::Store {
                ty: IrType::from_str(ty).ok_or_else(|| bad(format!("bad type `{}`", ty)))?,
                addr: addr.to_string(),
                src: src.to_string(),
            }
        }
        "alloca" => {
            let t = toks(rest);
            let [_, ty] = t[..] else {
                return Err(bad("expected `alloca <ty>`".to_string()));
            };
            InstKind::Alloca {
                dest: dest.ok_or_else(|| bad("`alloca` needs a destination".to_string()))?,
                ty: IrType::from_str(ty).ok_or_else(|| bad(format!("bad type `{}`", ty)))?,
            }
        }
        "getelementptr" => {
            let t: Vec<&str> = toks(rest).into_iter().filter(|&t| t != "inbounds").collect();
            // getelementptr <ty>, ptr <p>, i32 <i> [, i32 <m>]
            let (ty_name, ptr, indices) = match t[..] {
                [_, ty, "ptr", ptr, "i32", i] => (ty, ptr, vec![i]),
                [_, ty, "ptr", ptr, "i32", i, "i32", m] => (ty, ptr, vec![i, m]),
                _ => return Err(bad("malformed `getelementptr`".to_string())),
            };
            let member = if indices.len() == 2 {
                Some(indices[1].parse::<usize>().map_err(|_| bad("member index must be a constant".to_string()))?)
            } else {
                None
            };
            let index = indices[0];
            InstKind::Gep {
                dest: dest.ok_or_else(|| bad("`getelementptr` needs a destination".to_string()))?,
                ty_name: ty_name.to_string(),
                ptr: ptr.to_string(),
                index: if index == "0" { None } else { Some(index.to_string()) },
                member,
            }
        }
        "call" => {
            let open = rest.find('(').ok_or_else(|| bad("missing `(`".to_string()))?;
            let close = rest.rfind(')').ok_or_else(|| bad("missing `)`".to_string()))?;
            let head = toks(&rest[..open]);
            let [_, ret, callee] = head[..] else {
                return Err(bad("expected `call <ty> @f(…)`".to_string()));
            };
            let ret_ty = IrType::from_str(ret).ok_or_else(|| bad(format!("bad type `{}`", ret)))?;
            let sig = sigs
                .get(callee)
                .cloned()
                .or_else(|| array_ctor_signature(callee))
                .ok_or_else(|| bad(format!("call to unknown function `{}`", callee)))?;
            let mut args = Vec::new();
            let mut arg_tys = Vec::new();
            for piece in rest[open + 1..close].split(',') {
                let piece = piece.trim();
                if piece.is_empty() {
                    continue;
                }
                let t = toks(piece);
                let [ty, value] = t[..] else {
                    return Err(bad(format!("malformed argument `{}`", piece)));
                };
                arg_tys.push(IrType::from_str(ty).ok_or_else(|| bad(format!("bad type `{}`", ty)))?);
                args.push(value.to_string());
            }
            if args.len() != sig.params.len() {
                return Err(bad(format!(
                    "`{}` takes {} arguments, got {}",
                    callee,
                    sig.params.len(),
                    args.len()
                )));
            }
            InstKind::Call(CallInst {
                dest,
                callee: callee.to_string(),
                ret_ty,
                args,
                arg_tys,
                no_effect: sig.no_effect,
                tail_call: false,
                self_tail_call: false,
            })
        }
        "phi" => {
            // phi <ty> [v, %l], [v2, %l2], …
            let t = toks(rest);
            let ty = IrType::from_str(t.get(1).copied().unwrap_or(""))
                .ok_or_else(|| bad("bad phi type".to_string()))?;
            let mut labels = Vec::new();
            let mut incoming = Vec::new();
            for pair in rest.split('[').skip(1) {
                let pair = pair.trim().trim_end_matches(',').trim().trim_end_matches(']');
                let t = toks(pair);
                let [value, label] = t[..] else {
                    return Err(bad("malformed phi incoming".to_string()));
                };
                let label = label
                    .strip_prefix('%')
                    .ok_or_else(|| bad("phi labels are `%`-prefixed".to_string()))?;
                labels.push(label.to_string());
                incoming.push((BlockId(0), value.to_string()));
            }
            if block.insts.len() != block.phi_labels.len() {
                return Err(bad("phi after non-phi instruction".to_string()));
            }
            block.phi_labels.push(labels);
            InstKind::Phi {
                dest: dest.ok_or_else(|| bad("`phi` needs a destination".to_string()))?,
                ty,
                incoming,
            }
        }
        "br" => {
            let t = toks(rest);
            match t[..] {
                [_, "label", target] => {
                    let target = target
                        .strip_prefix('%')
                        .ok_or_else(|| bad("branch targets are `%`-prefixed".to_string()))?;
                    block.succ_labels = vec![target.to_string()];
                    InstKind::Jump
                }
                [_, "i1", cond, "label", t_label, "label", f_label] => {
                    let t_label = t_label
                        .strip_prefix('%')
                        .ok_or_else(|| bad("branch targets are `%`-prefixed".to_string()))?;
                    let f_label = f_label
                        .strip_prefix('%')
                        .ok_or_else(|| bad("branch targets are `%`-prefixed".to_string()))?;
                    block.succ_labels = vec![t_label.to_string(), f_label.to_string()];
                    InstKind::Branch { cond: cond.to_string(), fused: None }
                }
                _ => return Err(bad("malformed `br`".to_string())),
            }
        }
        "ret" => {
            let t = toks(rest);
            match t[..] {
                [_, "void"] => InstKind::Ret { ty: IrType::Void, value: None },
                [_, ty, value] => InstKind::Ret {
                    ty: IrType::from_str(ty).ok_or_else(|| bad(format!("bad type `{}`", ty)))?,
                    value: Some(value.to_string()),
                },
                _ => return Err(bad("malformed `ret`".to_string())),
            }
        }
        _ => return Err(bad(format!("unknown instruction `{}`", op))),
    };

    block.insts.push(Inst::new(kind));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::printer::module_text;

    const LOOP_SUM: &str = r#"
@g = global i32 0
@.str = private unnamed_addr constant [6 x i8] c"hello\00"
define i32 @main() {
entry:
  %s.ptr = alloca i32
  store i32 0, ptr %s.ptr
  br label %cond
cond:
  %i = phi i32 [0, %entry], [%i.next, %body]
  %c = icmp slt i32 %i, 10
  br i1 %c, label %body, label %done
body:
  %s = load i32, ptr %s.ptr
  %s.next = add i32 %s, %i
  store i32 %s.next, ptr %s.ptr
  %i.next = add i32 %i, 1
  br label %cond
done:
  %r = load i32, ptr %s.ptr
  call void @printInt(i32 %r)
  ret i32 0
}
"#;

    #[test]
    fn test_parse_loop_sum() {
        let module = parse_module(LOOP_SUM).unwrap();
        let main = module.function("@main").unwrap();
        assert_eq!(main.layout.len(), 4);
        let cond = main.block(main.layout[1]);
        assert_eq!(cond.name, "cond");
        assert_eq!(cond.predecessors.len(), 2);
        assert_eq!(cond.successors.len(), 2);
        // Phi incomings follow predecessor order.
        let InstKind::Phi { incoming, .. } = &cond.insts[0].kind else {
            panic!("expected phi");
        };
        assert_eq!(incoming[0].0, cond.predecessors[0]);
        assert_eq!(incoming[1].0, cond.predecessors[1]);
        assert_eq!(module.globals.len(), 1);
        assert_eq!(module.strings[0].value, "hello");
    }

    #[test]
    fn test_roundtrip_through_printer() {
        let module = parse_module(LOOP_SUM).unwrap();
        let text = module_text(&module);
        let again = parse_module(&text).unwrap();
        assert_eq!(module_text(&again), text);
    }

    #[test]
    fn test_unknown_callee_is_an_error() {
        let src = "define void @f() {\nentry:\n  call void @nope()\n  ret void\n}\n";
        let err = parse_module(src).unwrap_err();
        assert!(err.to_string().contains("unknown function"));
    }

    #[test]
    fn test_array_ctor_calls_resolve() {
        let src = "define i32 @main() {\nentry:\n  %a = call ptr @__new_int_1d_array__(i32 5)\n  ret i32 0\n}\n";
        let module = parse_module(src).unwrap();
        assert!(module.function("@main").is_some());
    }

    #[test]
    fn test_missing_terminator_is_an_error() {
        let src = "define i32 @main() {\nentry:\n  %a = add i32 1, 2\n}\n";
        assert!(parse_module(src).is_err());
    }

    #[test]
    fn test_class_gep() {
        let src = "\
%class.P = type {i32, i32}
define i32 @main() {
entry:
  %p = call ptr @malloc(i32 8)
  %f = getelementptr inbounds %class.P, ptr %p, i32 0, i32 1
  store i32 4, ptr %f
  ret i32 0
}
";
        let module = parse_module(src).unwrap();
        let main = module.function("@main").unwrap();
        let gep = &main.block(main.layout[0]).insts[1];
        let InstKind::Gep { member, index, .. } = &gep.kind else {
            panic!("expected gep");
        };
        assert_eq!(*member, Some(1));
        assert!(index.is_none());
    }
}
