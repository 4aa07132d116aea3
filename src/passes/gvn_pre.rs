//! Global value numbering with partial-redundancy elimination.
//!
//! Expressions are numbered in a value table; commutative operators
//! normalise their operand numbers so `a+b` and `b+a` share a class. Per
//! block the pass builds the classic five sets — expressions generated
//! (`exp_gen`, topologically ordered), phi-defined values (`phi_gen`),
//! temporaries killed (`tmp_gen`), the leader table at exit (`avail_out`,
//! built down the dominator tree) and the anticipated set at entry
//! (`antic_in`, iterated to fixpoint in post-dominator order with
//! phi-translation across joins). The insertion phase materialises a
//! computation in predecessors where it is only partially available and
//! joins the copies with a fresh phi; the elimination phase rewrites every
//! computation whose value already has a dominating leader into a copy.

use crate::common::fx_hash::FxHashMap;
use crate::common::renamer::Renamer;
use crate::common::types::IrType;
use crate::ir::dominator::{reverse_cfg, DominatorTree};
use crate::ir::ir::*;
use crate::passes::utils::{build_cfg, positions, ret_positions};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Expression {
    /// A register or a constant, by name.
    Temp(String),
    Bin { op: BinOp, v1: u32, v2: u32 },
}

impl Expression {
    fn bin(op: BinOp, v1: u32, v2: u32) -> Expression {
        if op.is_commutative() {
            Expression::Bin { op, v1: v1.min(v2), v2: v1.max(v2) }
        } else {
            Expression::Bin { op, v1, v2 }
        }
    }
}

/// The first `binop` recorded for a value class; cloned and re-wired when
/// the insertion phase materialises the computation elsewhere.
#[derive(Debug, Clone)]
struct BinSnapshot {
    dest: String,
    op: BinOp,
    ty: IrType,
    operands: [String; 2],
}

#[derive(Default)]
struct ValueTable {
    expressions: FxHashMap<Expression, u32>,
    number: u32,
    snapshots: Vec<Option<BinSnapshot>>,
}

impl ValueTable {
    fn fresh(&mut self, snapshot: Option<BinSnapshot>) -> u32 {
        let number = self.number;
        self.number += 1;
        self.snapshots.push(snapshot);
        number
    }

    fn query_or_assign(&mut self, expr: Expression, snapshot: Option<BinSnapshot>) -> u32 {
        if let Some(&number) = self.expressions.get(&expr) {
            return number;
        }
        let number = self.fresh(snapshot);
        self.expressions.insert(expr, number);
        number
    }

    fn assign(&mut self, expr: Expression, number: Option<u32>) -> u32 {
        let number = number.unwrap_or_else(|| self.fresh(None));
        self.expressions.insert(expr, number);
        number
    }

    fn query(&self, expr: &Expression) -> Option<u32> {
        self.expressions.get(expr).copied()
    }

    /// Carry a (value, expression) pair across the `pred → succ` edge by
    /// replacing phi-defined values with their incoming on that edge.
    fn phi_translate(
        &mut self,
        pred_index: usize,
        value: u32,
        expr: &Expression,
        phi_gen: &FxHashMap<u32, Vec<(u32, String)>>,
    ) -> (u32, Expression) {
        let translate = |v: u32| phi_gen.get(&v).map_or(v, |inc| inc[pred_index].0);
        let Expression::Bin { op, v1, v2 } = expr else {
            return match phi_gen.get(&value) {
                Some(inc) => {
                    let (v, name) = &inc[pred_index];
                    (*v, Expression::Temp(name.clone()))
                }
                None => (value, expr.clone()),
            };
        };
        let new_expr = Expression::Bin { op: *op, v1: translate(*v1), v2: translate(*v2) };
        if new_expr == *expr {
            return (value, expr.clone());
        }
        let snapshot = self.snapshots[value as usize].clone();
        (self.query_or_assign(new_expr.clone(), snapshot), new_expr)
    }

    /// Rebuild the computation of `value` in a block whose leader table is
    /// `avail`, with operands rewritten to the local leaders.
    fn reconstruct(
        &self,
        avail: &FxHashMap<u32, String>,
        value: u32,
        expr: &Expression,
        renamer: &mut Renamer,
    ) -> Inst {
        let Expression::Bin { v1, v2, .. } = expr else {
            panic!("gvn-pre: reconstructing a non-binop expression")
        };
        let snapshot = self.snapshots[value as usize]
            .clone()
            .expect("gvn-pre: value class has no recorded computation");
        let mut operands = snapshot.operands.clone();
        for (operand, &dep) in operands.iter_mut().zip([v1, v2]) {
            match avail.get(&dep) {
                Some(leader) => *operand = leader.clone(),
                None => assert!(
                    is_imm(operand) || operand.ends_with(".param"),
                    "gvn-pre: operand {} has no leader",
                    operand
                ),
            }
        }
        let dest = renamer.get_name(&snapshot.dest);
        let [lhs, rhs] = operands;
        Inst::new(InstKind::Bin { dest, op: snapshot.op, ty: snapshot.ty, lhs, rhs })
    }
}

/// Insertion-ordered value → expression map with dict-style (order
/// insensitive) equality; `antic_in` convergence and the topological order
/// of `exp_gen` both depend on these semantics.
#[derive(Debug, Clone, Default)]
struct OrderedExprs {
    entries: Vec<(u32, Expression)>,
}

impl OrderedExprs {
    fn contains(&self, value: u32) -> bool {
        self.entries.iter().any(|(v, _)| *v == value)
    }

    fn get(&self, value: u32) -> Option<&Expression> {
        self.entries.iter().find(|(v, _)| *v == value).map(|(_, e)| e)
    }

    fn insert_if_absent(&mut self, value: u32, expr: Expression) {
        if !self.contains(value) {
            self.entries.push((value, expr));
        }
    }

    fn set(&mut self, value: u32, expr: Expression) {
        match self.entries.iter_mut().find(|(v, _)| *v == value) {
            Some(entry) => entry.1 = expr,
            None => self.entries.push((value, expr)),
        }
    }

    fn same_as(&self, other: &OrderedExprs) -> bool {
        self.entries.len() == other.entries.len()
            && self.entries.iter().all(|(v, e)| other.get(*v) == Some(e))
    }
}

/// Drop killed temporaries and expressions whose operands are not
/// themselves anticipated; keeps the topological order intact.
fn clean(gen: &OrderedExprs, kill: &FxHashMap<u32, String>) -> OrderedExprs {
    let mut result = OrderedExprs::default();
    for (value, expr) in &gen.entries {
        match expr {
            Expression::Temp(_) if kill.contains_key(value) => continue,
            Expression::Bin { v1, v2, .. } if !result.contains(*v1) || !result.contains(*v2) => {
                continue
            }
            _ => result.entries.push((*value, expr.clone())),
        }
    }
    result
}

pub fn gvn_pre(func: &mut Function, renamer: &mut Renamer) {
    let pos = positions(func);
    let cfg = build_cfg(func, &pos);
    let n = cfg.len();
    let layout = func.layout.clone();

    let dom = DominatorTree::compute(&cfg, 0);
    let idom: Vec<usize> = (0..n).map(|i| dom.idom[i]).collect();
    let dom_order = dom.dfs_order();
    let children = dom.children();

    let (rcfg, end) = reverse_cfg(&cfg, &ret_positions(func));
    let post_dom = DominatorTree::compute(&rcfg, end);
    let mut post_order = post_dom.dfs_order();
    post_order.retain(|&i| i != end);

    let mut table = ValueTable::default();
    let mut avail_out: Vec<FxHashMap<u32, String>> = vec![FxHashMap::default(); n];
    let mut antic_in: Vec<OrderedExprs> = vec![OrderedExprs::default(); n];
    let mut phi_gen: Vec<FxHashMap<u32, Vec<(u32, String)>>> = vec![FxHashMap::default(); n];
    let mut tmp_gen: Vec<FxHashMap<u32, String>> = vec![FxHashMap::default(); n];

    // Phase 1: leaders down the dominator tree, local exp_gen, antic seed.
    for &i in &dom_order {
        let mut exp_gen = OrderedExprs::default();
        avail_out[i] = if i == 0 { FxHashMap::default() } else { avail_out[idom[i]].clone() };
        for inst in &func.block(layout[i]).insts {
            let Some(dest) = inst.def() else { continue };
            let dest = dest.to_string();
            let tmp_def = Expression::Temp(dest.clone());
            let mut def_value = None;
            if let InstKind::Bin { op, ty, lhs, rhs, .. } = &inst.kind {
                let mut val_use = [0u32; 2];
                for (slot, operand) in val_use.iter_mut().zip([lhs, rhs]) {
                    *slot = table.query_or_assign(Expression::Temp(operand.clone()), None);
                    exp_gen.insert_if_absent(*slot, Expression::Temp(operand.clone()));
                }
                let expr = Expression::bin(*op, val_use[0], val_use[1]);
                let snapshot = BinSnapshot {
                    dest: dest.clone(),
                    op: *op,
                    ty: *ty,
                    operands: [lhs.clone(), rhs.clone()],
                };
                let value = table.query_or_assign(expr.clone(), Some(snapshot));
                exp_gen.insert_if_absent(value, expr);
                def_value = Some(value);
            }
            let def_value = if inst.is_phi() {
                table.assign(tmp_def, None)
            } else {
                let value = table.assign(tmp_def, def_value);
                tmp_gen[i].entry(value).or_insert_with(|| dest.clone());
                value
            };
            avail_out[i].entry(def_value).or_insert_with(|| dest.clone());
        }
        antic_in[i] = clean(&exp_gen, &tmp_gen[i]);
    }

    // Phase 1.5: phi-defined values and their incoming classes.
    for (i, &id) in layout.iter().enumerate() {
        if !dom.is_reachable(i) {
            continue;
        }
        let block = func.block(id);
        for inst in block.insts.iter().take_while(|inst| inst.is_phi()) {
            let InstKind::Phi { dest, incoming, .. } = &inst.kind else { unreachable!() };
            let def_value = table
                .query(&Expression::Temp(dest.clone()))
                .expect("gvn-pre: phi destination unnumbered");
            let inc: Vec<(u32, String)> = incoming
                .iter()
                .map(|(_, value)| {
                    (table.query_or_assign(Expression::Temp(value.clone()), None), value.clone())
                })
                .collect();
            phi_gen[i].insert(def_value, inc);
        }
    }

    // Phase 2: anticipated sets to fixpoint in post-dominator order.
    let mut converged = false;
    while !converged {
        converged = true;
        for &i in &post_order {
            let succs = &cfg[i];
            let mut antic_out = OrderedExprs::default();
            match succs.len() {
                0 => continue,
                1 => {
                    let succ = succs[0];
                    let pred_index = pred_index_of(func, &layout, i, succ);
                    for (v, e) in antic_in[succ].entries.clone() {
                        let (v2, e2) = table.phi_translate(pred_index, v, &e, &phi_gen[succ]);
                        antic_out.set(v2, e2);
                    }
                }
                _ => {
                    let (a1, a2) = (&antic_in[succs[0]], &antic_in[succs[1]]);
                    for (v, e) in &a1.entries {
                        if a2.contains(*v) {
                            antic_out.entries.push((*v, e.clone()));
                        }
                    }
                }
            }
            let mut new_antic = antic_in[i].clone();
            for (v, e) in antic_out.entries {
                new_antic.set(v, e);
            }
            let new_antic = clean(&new_antic, &tmp_gen[i]);
            if !new_antic.same_as(&antic_in[i]) {
                antic_in[i] = new_antic;
                converged = false;
            }
        }
    }

    // Insertion: hoist partially-available computations into the deficient
    // predecessors and join with a phi.
    let mut converged = false;
    while !converged {
        converged = true;
        let mut new_set: Vec<FxHashMap<u32, String>> = vec![FxHashMap::default(); n];
        for &i in &dom_order {
            let preds: Vec<usize> = func
                .block(layout[i])
                .predecessors
                .iter()
                .map(|p| pos[p.index()])
                .collect();
            if preds.len() > 1 {
                for (value, expr) in antic_in[i].entries.clone() {
                    if !matches!(expr, Expression::Bin { .. }) {
                        continue;
                    }
                    let translated: Vec<(u32, Expression)> = (0..preds.len())
                        .map(|j| table.phi_translate(j, value, &expr, &phi_gen[i]))
                        .collect();
                    let mut leaders: Vec<Option<String>> = translated
                        .iter()
                        .zip(&preds)
                        .map(|((v, _), &p)| avail_out[p].get(v).cloned())
                        .collect();
                    if leaders.iter().all(|l| l.is_some()) || leaders.iter().all(|l| l.is_none()) {
                        continue;
                    }
                    converged = false;
                    let mut phi_ty = IrType::I32;
                    for (j, &p) in preds.iter().enumerate() {
                        if leaders[j].is_some() {
                            continue;
                        }
                        let (vt, et) = &translated[j];
                        let inst = table.reconstruct(&avail_out[p], *vt, et, renamer);
                        let InstKind::Bin { dest, ty, .. } = &inst.kind else { unreachable!() };
                        let (dest, ty) = (dest.clone(), *ty);
                        phi_ty = ty;
                        let pred_id = layout[p];
                        let block = func.block_mut(pred_id);
                        let at = block.insts.len() - 1;
                        block.insts.insert(at, inst);
                        new_set[p].insert(*vt, dest.clone());
                        avail_out[p].insert(*vt, dest.clone());
                        table.assign(Expression::Temp(dest.clone()), Some(*vt));
                        leaders[j] = Some(dest);
                    }
                    let dest = renamer.get_name("%.gvn_pre");
                    let incoming: Vec<(BlockId, String)> = func
                        .block(layout[i])
                        .predecessors
                        .iter()
                        .zip(&leaders)
                        .map(|(&p, leader)| (p, leader.clone().unwrap()))
                        .collect();
                    let phi = Inst::new(InstKind::Phi { dest: dest.clone(), ty: phi_ty, incoming });
                    func.block_mut(layout[i]).insts.insert(0, phi);
                    new_set[i].insert(value, dest.clone());
                    avail_out[i].insert(value, dest.clone());
                    table.assign(Expression::Temp(dest.clone()), Some(value));
                    phi_gen[i].insert(
                        value,
                        translated
                            .iter()
                            .zip(&leaders)
                            .map(|((v, _), leader)| (*v, leader.clone().unwrap()))
                            .collect(),
                    );
                }
                let additions: Vec<(u32, String)> =
                    new_set[i].iter().map(|(v, s)| (*v, s.clone())).collect();
                avail_out[i].extend(additions);
            }
            for &c in &children[i] {
                let inherited: Vec<(u32, String)> =
                    new_set[i].iter().map(|(v, s)| (*v, s.clone())).collect();
                new_set[c].extend(inherited.iter().cloned());
                avail_out[c].extend(inherited);
            }
        }
    }

    // Elimination: replace computations that have a dominating leader.
    for (i, &id) in layout.iter().enumerate() {
        if !dom.is_reachable(i) {
            continue;
        }
        let mut avail_in =
            if i == 0 { FxHashMap::default() } else { avail_out[idom[i]].clone() };
        for inst in &mut func.block_mut(id).insts {
            let Some(dest) = inst.def() else { continue };
            let dest = dest.to_string();
            let value = match table.query(&Expression::Temp(dest.clone())) {
                Some(value) => value,
                None => continue,
            };
            if let Some(leader) = avail_in.get(&value) {
                if *leader != dest {
                    let ty = inst.result_ty().expect("defining instruction has a type");
                    inst.kind = InstKind::Bin {
                        dest: dest.clone(),
                        op: BinOp::Add,
                        ty,
                        lhs: leader.clone(),
                        rhs: "0".to_string(),
                    };
                }
            }
            avail_in.entry(value).or_insert(dest);
        }
    }
}

fn pred_index_of(func: &Function, layout: &[BlockId], pred_pos: usize, succ_pos: usize) -> usize {
    let pred_id = layout[pred_pos];
    func.block(layout[succ_pos])
        .predecessors
        .iter()
        .position(|&p| p == pred_id)
        .expect("gvn-pre: edge without matching predecessor entry")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parser::parse_module;
    use crate::ir::printer::{function_text, module_text};
    use crate::passes::cfg_transform::copy_propagation;
    use crate::passes::dce::naive_dce;

    // The classic PRE diamond: `a+b` is computed in one arm and after the
    // join; the insertion phase hoists it into the other arm and the join
    // computation collapses onto a phi.
    const DIAMOND: &str = "\
define i32 @main() {
entry:
  %a = call i32 @getInt()
  %b = call i32 @getInt()
  %c = icmp sgt i32 %a, 0
  br i1 %c, label %left, label %right
left:
  %x = add i32 %a, %b
  call void @printInt(i32 %x)
  br label %join
right:
  br label %join
join:
  %y = add i32 %a, %b
  call void @printInt(i32 %y)
  ret i32 0
}
";

    fn run_pipeline(src: &str) -> crate::ir::ir::IrModule {
        let mut module = parse_module(src).unwrap();
        module.for_each_definition(gvn_pre);
        module.for_each_definition(|f, _| copy_propagation(f));
        module.for_each_definition(|f, _| naive_dce(f));
        module
    }

    #[test]
    fn test_partial_redundancy_is_hoisted() {
        let module = run_pipeline(DIAMOND);
        let f = module.function("@main").unwrap();
        let text = function_text(f);
        // The join block no longer recomputes a+b: it reads a phi.
        let join = f.layout.iter().find(|&&id| f.block(id).name == "join").unwrap();
        let joins_adds = f
            .block(*join)
            .insts
            .iter()
            .filter(|i| matches!(&i.kind, InstKind::Bin { op: BinOp::Add, rhs, .. } if rhs != "0"))
            .count();
        assert_eq!(joins_adds, 0, "join still computes the sum:\n{}", text);
        // The right arm now computes it instead.
        let right = f.layout.iter().find(|&&id| f.block(id).name == "right").unwrap();
        assert!(f
            .block(*right)
            .insts
            .iter()
            .any(|i| matches!(&i.kind, InstKind::Bin { op: BinOp::Add, .. })));
        assert!(text.contains("%.gvn_pre"));
    }

    #[test]
    fn test_behaviour_is_preserved() {
        let plain = parse_module(DIAMOND).unwrap();
        let module = run_pipeline(DIAMOND);
        for input in [[3, 4], [-3, 4]] {
            let mut a = crate::ir::interp::Interp::new(&plain);
            a.input_ints.extend(input);
            a.run();
            let mut b = crate::ir::interp::Interp::new(&module);
            b.input_ints.extend(input);
            b.run();
            assert_eq!(a.output, b.output);
        }
    }

    #[test]
    fn test_full_redundancy_becomes_copy() {
        let src = "\
define i32 @main() {
entry:
  %a = call i32 @getInt()
  %x = add i32 %a, 1
  %y = add i32 1, %a
  %s = add i32 %x, %y
  call void @printInt(i32 %s)
  ret i32 0
}
";
        let module = run_pipeline(src);
        let text = module_text(&module);
        // Commutative normalisation: %y collapsed onto %x.
        assert_eq!(text.matches("add i32 %a, 1").count() + text.matches("add i32 1, %a").count(), 1);
        let mut interp = crate::ir::interp::Interp::new(&module);
        interp.input_ints.push(20);
        interp.run();
        assert_eq!(interp.output, "42");
    }

    #[test]
    fn test_loop_invariant_not_duplicated_per_iteration() {
        let src = "\
define i32 @main() {
entry:
  %a = call i32 @getInt()
  %b = call i32 @getInt()
  br label %head
head:
  %i = phi i32 [0, %entry], [%i.next, %head]
  %inv = add i32 %a, %b
  %i.next = add i32 %i, %inv
  %c = icmp slt i32 %i.next, 100
  br i1 %c, label %head, label %exit
exit:
  call void @printInt(i32 %i.next)
  ret i32 0
}
";
        let plain = parse_module(src).unwrap();
        let module = run_pipeline(src);
        let mut a = crate::ir::interp::Interp::new(&plain);
        a.input_ints.extend([7, 6]);
        a.run();
        let mut b = crate::ir::interp::Interp::new(&module);
        b.input_ints.extend([7, 6]);
        b.run();
        assert_eq!(a.output, b.output);
    }
}
