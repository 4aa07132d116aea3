//! MIR lowering: strength reduction and instruction-selection pre-work.
//!
//! Rewrites the module into the shapes the RISC-V emitter pattern-matches:
//! commutative operators carry any immediate on the right and inside the
//! 12-bit field (`li` materialises the rest), multiplications by powers of
//! two become shifts, constant divisions become the magic-number sequence,
//! comparisons normalise to `slt`/`seqz`/`snez` form with an inversion
//! `xor` where needed, a branch fed by a single-use `icmp` absorbs it,
//! `getelementptr` turns into shift-and-add arithmetic, and calls in tail
//! position fold their `ret` — a self tail call becomes a jump back to the
//! entry block with rebound arguments.

use crate::common::fx_hash::FxHashMap;
use crate::common::renamer::Renamer;
use crate::common::types::{IrType, ARRAY_RECORD};
use crate::ir::ir::*;

pub fn imm_overflow(token: &str) -> bool {
    let v = parse_imm(token);
    !(-2048..=2047).contains(&v)
}

fn is_power_of_two(v: i32) -> bool {
    v != 0 && v & (v - 1) == 0
}

fn bit_length(v: i32) -> u32 {
    assert!(v >= 0);
    32 - v.leading_zeros()
}

/// Emit `dest = add ty 0, value` — selected as `li` by the backend.
fn add_li(out: &mut Vec<Inst>, value: &str, ty: IrType, renamer: &mut Renamer) -> String {
    let dest = renamer.get_name("%.li");
    out.push(Inst::new(InstKind::Bin {
        dest: dest.clone(),
        op: BinOp::Add,
        ty,
        lhs: "0".to_string(),
        rhs: value.to_string(),
    }));
    dest
}

fn li_operand(out: &mut Vec<Inst>, operand: &mut String, ty: IrType, renamer: &mut Renamer) {
    let name = add_li(out, operand, ty, renamer);
    *operand = name;
}

/// Swap an immediate to the right-hand side and keep it within 12 bits.
fn commutative_law(
    lhs: &mut String,
    rhs: &mut String,
    ty: IrType,
    out: &mut Vec<Inst>,
    renamer: &mut Renamer,
) {
    if is_imm(lhs) {
        std::mem::swap(lhs, rhs);
    }
    if is_imm(lhs) {
        li_operand(out, lhs, ty, renamer);
    }
    if is_imm(rhs) && imm_overflow(rhs) {
        li_operand(out, rhs, ty, renamer);
    }
}

/// The classical magic-number expansion of `n / d` for constant `d`
/// (RV32IM: `smulh` + shifts + sign fix). The caller renames the last
/// instruction's destination.
fn division_by_invariant_integer(n: &str, d: i32, renamer: &mut Renamer) -> Vec<Inst> {
    let bin = |dest: &str, op: BinOp, lhs: &str, rhs: &str| {
        Inst::new(InstKind::Bin {
            dest: dest.to_string(),
            op,
            ty: IrType::I32,
            lhs: lhs.to_string(),
            rhs: rhs.to_string(),
        })
    };

    if is_power_of_two(d) {
        // n/2^k as (n + (n>>31 & 2^k-1)) >> k.
        let mut out = Vec::new();
        let srai = renamer.get_name("%.srai");
        out.push(bin(&srai, BinOp::Ashr, n, "31"));
        let and = renamer.get_name("%.and");
        let mut mask = (d - 1).to_string();
        if d > 2048 {
            mask = add_li(&mut out, &mask, IrType::I32, renamer);
        }
        out.push(bin(&and, BinOp::And, &srai, &mask));
        let add = renamer.get_name("%.add");
        out.push(bin(&add, BinOp::Add, n, &and));
        let magic = renamer.get_name("%.magic");
        out.push(bin(&magic, BinOp::Ashr, &add, &(bit_length(d) - 1).to_string()));
        return out;
    }

    if d == 0 {
        // Source-level division by a literal zero is undefined; preserve
        // the dividend.
        return vec![bin(n, BinOp::Add, n, "0")];
    }
    if d == -1 {
        let neg = renamer.get_name("%.neg");
        return vec![bin(&neg, BinOp::Sub, "0", n)];
    }

    let abs_d = d.unsigned_abs() as i64;
    let l = bit_length((abs_d - 1) as i32).max(1);
    let magic = (1i64 + ((1i64 << (31 + l)) / abs_d) - (1i64 << 32)) as i32;
    let shift = l as i32 - 1;

    let mut out = Vec::new();
    let mulh = renamer.get_name("%.mulh");
    let magic_name = add_li(&mut out, &magic.to_string(), IrType::I32, renamer);
    out.push(bin(&mulh, BinOp::Smulh, n, &magic_name));
    let mut acc = mulh;
    if magic < 0 {
        let add = renamer.get_name("%.add");
        out.push(bin(&add, BinOp::Add, &acc, n));
        acc = add;
    }
    if shift > 0 {
        let shifted = renamer.get_name("%.shift");
        out.push(bin(&shifted, BinOp::Ashr, &acc, &shift.to_string()));
        acc = shifted;
    }
    let sign = renamer.get_name("%.sign");
    out.push(bin(&sign, BinOp::Ashr, n, "31"));
    let result = renamer.get_name("%.div");
    out.push(bin(&result, BinOp::Sub, &acc, &sign));
    if d < 0 {
        let neg = renamer.get_name("%.neg");
        out.push(bin(&neg, BinOp::Sub, "0", &result));
    }
    out
}

/// Per-function lowering driver.
pub fn mir_builder(func: &mut Function, renamer: &mut Renamer) {
    let mut icmp_map: FxHashMap<String, (IcmpOp, IrType, String, String)> = FxHashMap::default();
    let entry = func.entry();
    for &id in &func.layout.clone() {
        build_mir_block(func, id, entry, &mut icmp_map, renamer);
    }
}

fn build_mir_block(
    func: &mut Function,
    id: BlockId,
    entry: BlockId,
    icmp_map: &mut FxHashMap<String, (IcmpOp, IrType, String, String)>,
    renamer: &mut Renamer,
) {
    let insts = std::mem::take(&mut func.block_mut(id).insts);
    let mut out: Vec<Inst> = Vec::with_capacity(insts.len());
    let mut new_successor: Option<BlockId> = None;

    for mut inst in insts {
        match &mut inst.kind {
            InstKind::Bin { dest, op, ty, lhs, rhs } => {
                match op {
                    BinOp::Add | BinOp::And | BinOp::Or | BinOp::Xor => {
                        commutative_law(lhs, rhs, *ty, &mut out, renamer);
                    }
                    BinOp::Sub if lhs == "0" => {
                        // kept whole; selected as `neg`
                    }
                    BinOp::Sub | BinOp::Shl | BinOp::Ashr | BinOp::Smulh => {
                        if is_imm(lhs) {
                            li_operand(&mut out, lhs, *ty, renamer);
                        }
                        if is_imm(rhs) && imm_overflow(rhs) {
                            li_operand(&mut out, rhs, *ty, renamer);
                        }
                    }
                    BinOp::Mul | BinOp::Sdiv | BinOp::Srem => {
                        if *op == BinOp::Mul && is_imm(lhs) {
                            std::mem::swap(lhs, rhs);
                        }
                        if is_imm(lhs) {
                            li_operand(&mut out, lhs, *ty, renamer);
                        }
                        if is_imm(rhs) {
                            let imm = parse_imm(rhs);
                            if *op == BinOp::Mul && is_power_of_two(imm) {
                                out.push(Inst::new(InstKind::Bin {
                                    dest: dest.clone(),
                                    op: BinOp::Shl,
                                    ty: *ty,
                                    lhs: lhs.clone(),
                                    rhs: (bit_length(imm) - 1).to_string(),
                                }));
                                continue;
                            } else if *op == BinOp::Sdiv {
                                let mut seq = division_by_invariant_integer(lhs, imm, renamer);
                                rename_last_dest(&mut seq, dest);
                                out.extend(seq);
                                continue;
                            } else {
                                li_operand(&mut out, rhs, *ty, renamer);
                            }
                        }
                    }
                }
                out.push(inst);
            }
            InstKind::Icmp { dest, op, ty, lhs, rhs } => {
                icmp_map.insert(dest.clone(), (*op, *ty, lhs.clone(), rhs.clone()));
                if matches!(op, IcmpOp::Eq | IcmpOp::Ne) {
                    if is_zero(lhs) {
                        std::mem::swap(lhs, rhs);
                    }
                    if is_zero(rhs) {
                        // selected as seqz / snez
                        if is_imm(lhs) {
                            li_operand(&mut out, lhs, *ty, renamer);
                        }
                    } else {
                        let name = renamer.get_name("%.xor");
                        let mut xlhs = lhs.clone();
                        let mut xrhs = rhs.clone();
                        commutative_law(&mut xlhs, &mut xrhs, *ty, &mut out, renamer);
                        out.push(Inst::new(InstKind::Bin {
                            dest: name.clone(),
                            op: BinOp::Xor,
                            ty: *ty,
                            lhs: xlhs,
                            rhs: xrhs,
                        }));
                        *lhs = name;
                        *rhs = "0".to_string();
                    }
                    out.push(inst);
                    continue;
                }
                let mut inverted = false;
                if matches!(op, IcmpOp::Sle | IcmpOp::Sge) {
                    inverted = true;
                    *op = if *op == IcmpOp::Sle { IcmpOp::Sgt } else { IcmpOp::Slt };
                }
                if *op == IcmpOp::Sgt {
                    std::mem::swap(lhs, rhs);
                    *op = IcmpOp::Slt;
                }
                if is_imm(lhs) {
                    let bumped = parse_imm(lhs) as i64 + 1;
                    if (-2048..=2047).contains(&bumped) {
                        // `2 < a` becomes `!(a < 3)`.
                        std::mem::swap(lhs, rhs);
                        *rhs = bumped.to_string();
                        inverted = !inverted;
                    }
                }
                if is_imm(lhs) {
                    li_operand(&mut out, lhs, *ty, renamer);
                }
                if is_imm(rhs) && imm_overflow(&(-parse_imm(rhs)).to_string()) {
                    li_operand(&mut out, rhs, *ty, renamer);
                }
                if inverted {
                    let inner = renamer.get_name("%.inv");
                    let outer = std::mem::replace(dest, inner.clone());
                    out.push(inst);
                    out.push(Inst::new(InstKind::Bin {
                        dest: outer,
                        op: BinOp::Xor,
                        ty: IrType::I1,
                        lhs: inner,
                        rhs: "true".to_string(),
                    }));
                } else {
                    out.push(inst);
                }
            }
            InstKind::Gep { dest, ty_name, ptr, index, member } => {
                let mut operand = ptr.clone();
                let mut emitted = false;
                if let Some(index) = index {
                    let shift = match ty_name.as_str() {
                        ARRAY_RECORD => 3,
                        "i1" => 0,
                        "i32" | "ptr" => 2,
                        other => panic!("gep element access into class type {}", other),
                    };
                    if shift != 0 {
                        let shl = renamer.get_name("%.shl");
                        let mut shl_inst = Inst::new(InstKind::Bin {
                            dest: shl.clone(),
                            op: BinOp::Shl,
                            ty: IrType::I32,
                            lhs: index.clone(),
                            rhs: shift.to_string(),
                        });
                        if let InstKind::Bin { lhs, .. } = &mut shl_inst.kind {
                            if is_imm(lhs) {
                                li_operand(&mut out, lhs, IrType::I32, renamer);
                            }
                        }
                        out.push(shl_inst);
                        let add = renamer.get_name("%.add");
                        out.push(Inst::new(InstKind::Bin {
                            dest: add.clone(),
                            op: BinOp::Add,
                            ty: IrType::Ptr,
                            lhs: shl,
                            rhs: ptr.clone(),
                        }));
                        operand = add;
                    } else {
                        let add = renamer.get_name("%.add");
                        let mut lhs = index.clone();
                        let mut rhs = ptr.clone();
                        commutative_law(&mut lhs, &mut rhs, IrType::Ptr, &mut out, renamer);
                        out.push(Inst::new(InstKind::Bin {
                            dest: add.clone(),
                            op: BinOp::Add,
                            ty: IrType::Ptr,
                            lhs,
                            rhs,
                        }));
                        operand = add;
                    }
                    emitted = true;
                }
                let member_offset = member.map_or(0, |m| m as i32 * 4);
                if member_offset != 0 {
                    let mut lhs = operand.clone();
                    let mut rhs = member_offset.to_string();
                    commutative_law(&mut lhs, &mut rhs, IrType::Ptr, &mut out, renamer);
                    out.push(Inst::new(InstKind::Bin {
                        dest: dest.clone(),
                        op: BinOp::Add,
                        ty: IrType::Ptr,
                        lhs,
                        rhs,
                    }));
                    emitted = true;
                }
                if emitted {
                    rename_last_dest(&mut out, dest);
                } else {
                    out.push(Inst::new(InstKind::Bin {
                        dest: dest.clone(),
                        op: BinOp::Add,
                        ty: IrType::Ptr,
                        lhs: ptr.clone(),
                        rhs: "0".to_string(),
                    }));
                }
            }
            InstKind::Store { ty, src, .. } => {
                if is_imm(src) && !is_zero(src) {
                    li_operand(&mut out, src, *ty, renamer);
                }
                out.push(inst);
            }
            InstKind::Branch { cond, fused } => {
                if is_imm(cond) {
                    li_operand(&mut out, cond, IrType::I1, renamer);
                } else if let Some((op, ty, lhs, rhs)) = icmp_map.get(cond.as_str()).cloned() {
                    let (mut op, mut lhs, mut rhs) = (op, lhs, rhs);
                    if is_zero(&lhs) {
                        std::mem::swap(&mut lhs, &mut rhs);
                        op = op.swapped();
                    }
                    if is_imm(&lhs) {
                        li_operand(&mut out, &mut lhs, ty, renamer);
                    }
                    if is_imm(&rhs) && !is_zero(&rhs) {
                        li_operand(&mut out, &mut rhs, ty, renamer);
                    }
                    *fused = Some(FusedIcmp { op, ty, lhs, rhs });
                }
                out.push(inst);
            }
            InstKind::Ret { value, .. } => {
                let folds = match (out.last(), &value) {
                    (Some(last), value) => match (&last.kind, value) {
                        (InstKind::Call(call), Some(v)) => call.dest.as_deref() == Some(v.as_str()),
                        (InstKind::Call(call), None) => call.dest.is_none(),
                        _ => false,
                    },
                    _ => false,
                };
                if folds {
                    let InstKind::Call(call) = &mut out.last_mut().unwrap().kind else {
                        unreachable!()
                    };
                    call.tail_call = true;
                    if call.callee == func.name {
                        // Loopify: jump back to the entry with rebound
                        // arguments instead of a real call.
                        call.self_tail_call = true;
                        out.push(Inst::new(InstKind::Jump));
                        new_successor = Some(entry);
                    }
                } else {
                    out.push(inst);
                }
            }
            InstKind::Load { .. }
            | InstKind::Alloca { .. }
            | InstKind::Call(_)
            | InstKind::Phi { .. }
            | InstKind::Jump => out.push(inst),
        }
    }

    func.block_mut(id).insts = out;
    if let Some(target) = new_successor {
        assert!(
            func.block(target).phi_count() == 0,
            "{}: self tail call into a block with phis",
            func.name
        );
        func.block_mut(id).successors = vec![target];
        func.block_mut(target).predecessors.push(id);
    }
}

fn rename_last_dest(seq: &mut [Inst], dest: &str) {
    let last = seq.last_mut().expect("empty rewrite sequence");
    match &mut last.kind {
        InstKind::Bin { dest: d, .. } | InstKind::Icmp { dest: d, .. } => *d = dest.to_string(),
        _ => panic!("rewrite sequence does not end in a definition"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parser::parse_module;
    use crate::ir::printer::module_text;

    fn lower(src: &str) -> crate::ir::ir::IrModule {
        let mut module = parse_module(src).unwrap();
        module.for_each_definition(mir_builder);
        module
    }

    #[test]
    fn test_mul_by_power_of_two_becomes_shift() {
        let module = lower(
            "\
define i32 @main() {
entry:
  %n = call i32 @getInt()
  %a = mul i32 %n, 8
  %b = mul i32 4, %n
  call void @printInt(i32 %a)
  call void @printInt(i32 %b)
  ret i32 0
}
",
        );
        let text = module_text(&module);
        assert!(text.contains("%a = shl i32 %n, 3"));
        assert!(text.contains("%b = shl i32 %n, 2"));
        assert!(!text.contains("mul"));
    }

    #[test]
    fn test_division_magic_sequence() {
        let module = lower(
            "\
define i32 @main() {
entry:
  %n = call i32 @getInt()
  %a = sdiv i32 %n, 7
  call void @printInt(i32 %a)
  ret i32 0
}
",
        );
        let text = module_text(&module);
        assert!(text.contains("smulh"));
        assert!(text.contains("ashr i32 %n, 31"));
        assert!(!text.contains("sdiv"));
        // The sequence ends by defining the original name.
        assert!(text.contains("%a = sub i32"));
    }

    #[test]
    fn test_division_by_power_of_two() {
        let module = lower(
            "\
define i32 @main() {
entry:
  %n = call i32 @getInt()
  %a = sdiv i32 %n, 4
  call void @printInt(i32 %a)
  ret i32 0
}
",
        );
        let text = module_text(&module);
        assert!(text.contains("ashr i32 %n, 31"));
        assert!(text.contains("and i32"));
        assert!(!text.contains("smulh"));
    }

    #[test]
    fn test_wide_immediate_is_materialised() {
        let module = lower(
            "\
define i32 @main() {
entry:
  %n = call i32 @getInt()
  %a = add i32 %n, 100000
  call void @printInt(i32 %a)
  ret i32 0
}
",
        );
        let text = module_text(&module);
        assert!(text.contains("%.li = add i32 0, 100000"));
        assert!(text.contains("%a = add i32 %n, %.li"));
    }

    #[test]
    fn test_sle_on_constant_folds_into_slt_range() {
        let module = lower(
            "\
define i32 @main() {
entry:
  %n = call i32 @getInt()
  %c = icmp sle i32 %n, 5
  %r = icmp eq i1 %c, false
  call void @printInt(i32 %n)
  ret i32 0
}
",
        );
        let text = module_text(&module);
        // n <= 5 flips twice and lands on n < 6 with no inversion left.
        assert!(text.contains("%c = icmp slt i32 %n, 6"));
        assert!(!text.contains("xor i1"));
    }

    #[test]
    fn test_sle_on_registers_inverts_through_xor() {
        let module = lower(
            "\
define i32 @main() {
entry:
  %n = call i32 @getInt()
  %m = call i32 @getInt()
  %c = icmp sle i32 %n, %m
  %r = icmp eq i1 %c, false
  call void @printInt(i32 %n)
  ret i32 0
}
",
        );
        let text = module_text(&module);
        // n <= m becomes !(m < n).
        assert!(text.contains("%.inv = icmp slt i32 %m, %n"));
        assert!(text.contains("%c = xor i1 %.inv, true"));
    }

    #[test]
    fn test_branch_fuses_feeding_icmp() {
        let module = lower(
            "\
define i32 @main() {
entry:
  %n = call i32 @getInt()
  %c = icmp slt i32 %n, 10
  br i1 %c, label %a, label %b
a:
  ret i32 1
b:
  ret i32 2
}
",
        );
        let f = module.function("@main").unwrap();
        let entry = f.block(f.layout[0]);
        let InstKind::Branch { fused, .. } = &entry.terminator().kind else { panic!() };
        assert!(fused.is_some());
    }

    #[test]
    fn test_gep_lowers_to_shift_add() {
        let module = lower(
            "\
%class.P = type {i32, i32}
define i32 @main() {
entry:
  %p = call ptr @malloc(i32 8)
  %f = getelementptr inbounds %class.P, ptr %p, i32 0, i32 1
  %a = call ptr @__new_int_1d_array__(i32 5)
  %n = call i32 @getInt()
  %e = getelementptr inbounds i32, ptr %a, i32 %n
  store i32 1, ptr %f
  store i32 2, ptr %e
  ret i32 0
}
",
        );
        let text = module_text(&module);
        assert!(!text.contains("getelementptr"));
        assert!(text.contains("%f = add ptr %p, 4"));
        assert!(text.contains("shl i32 %n, 2"));
    }

    #[test]
    fn test_self_tail_call_loopifies() {
        let src = "\
define i32 @count(i32 %n.param) {
entry:
  %c = icmp eq i32 %n.param, 0
  br i1 %c, label %done, label %more
done:
  ret i32 0
more:
  %n2 = sub i32 %n.param, 1
  %r = call i32 @count(i32 %n2)
  ret i32 %r
}
";
        let module = lower(src);
        let f = module.function("@count").unwrap();
        let more = f.layout[2];
        let block = f.block(more);
        assert!(matches!(block.terminator().kind, InstKind::Jump));
        assert_eq!(block.successors, vec![f.entry()]);
        let InstKind::Call(call) = &block.insts[block.insts.len() - 2].kind else { panic!() };
        assert!(call.tail_call && call.self_tail_call);
        // Entry gained the loop predecessor.
        assert!(f.block(f.entry()).predecessors.contains(&more));
    }

    #[test]
    fn test_non_self_tail_call_is_flagged() {
        let src = "\
define i32 @helper(i32 %n.param) {
entry:
  ret i32 %n.param
}
define i32 @outer(i32 %n.param) {
entry:
  %r = call i32 @helper(i32 %n.param)
  ret i32 %r
}
";
        let module = lower(src);
        let f = module.function("@outer").unwrap();
        let entry = f.block(f.entry());
        let InstKind::Call(call) = &entry.insts.last().unwrap().kind else { panic!() };
        assert!(call.tail_call && !call.self_tail_call);
        // The ret folded into the call.
        assert_eq!(entry.insts.len(), 1);
    }
}
