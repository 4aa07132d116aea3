//! Sparse conditional constant propagation.
//!
//! Each SSA name carries a three-state lattice cell (unknown → constant →
//! not-constant; transitions are monotone). Two worklists drive the
//! propagation: CFG edges whose executability was just discovered, and SSA
//! edges whose source cell just changed. A block's instructions are
//! evaluated only once some predecessor edge is executable; phis meet
//! their incoming values across executable edges only.
//!
//! A branch on a constant condition enqueues only the taken edge and
//! records the other in the function's edge-removal queue for the CFG
//! cleanup. Arithmetic wraps at 32 bits; division truncates like the
//! RV32 `div` it will eventually compile to, and a zero divisor keeps the
//! cell unknown.

use crate::common::fx_hash::{FxHashMap, FxHashSet};
use crate::common::types::IrType;
use crate::ir::ir::*;
use crate::passes::utils::{collect_defs, collect_type_map, collect_uses};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cell {
    Unknown,
    Const(i32),
    NotConst,
}

fn meet(lhs: Cell, rhs: Cell) -> Cell {
    match (lhs, rhs) {
        (Cell::Unknown, x) => x,
        (x, Cell::Unknown) => x,
        (Cell::Const(a), Cell::Const(b)) if a == b => lhs,
        _ => Cell::NotConst,
    }
}

fn to_imm(value: i32, ty: IrType) -> String {
    match ty {
        IrType::I32 => value.to_string(),
        IrType::I1 => if value != 0 { "true" } else { "false" }.to_string(),
        _ => "null".to_string(),
    }
}

struct Sccp<'f> {
    func: &'f mut Function,
    cells: FxHashMap<String, Cell>,
    type_map: FxHashMap<String, IrType>,
    use_sites: FxHashMap<String, Vec<(BlockId, usize)>>,
    block_visited: FxHashSet<BlockId>,
    edge_visited: FxHashSet<(BlockId, BlockId)>,
    cfg_work: Vec<(BlockId, BlockId)>,
    ssa_work: Vec<(BlockId, usize)>,
}

pub fn sparse_conditional_constant_propagation(func: &mut Function) {
    let defs = collect_defs(func);
    let type_map = collect_type_map(func);
    let use_sites = collect_uses(&defs, func);
    let mut cells: FxHashMap<String, Cell> =
        defs.iter().map(|d| (d.clone(), Cell::Unknown)).collect();
    for param in &func.params {
        cells.insert(param.name.clone(), Cell::NotConst);
    }
    let entry = func.entry();

    let mut sccp = Sccp {
        func,
        cells,
        type_map,
        use_sites,
        block_visited: FxHashSet::default(),
        edge_visited: FxHashSet::default(),
        cfg_work: vec![(entry, entry)],
        ssa_work: Vec::new(),
    };
    sccp.run();
}

impl<'f> Sccp<'f> {
    fn run(&mut self) {
        while !self.cfg_work.is_empty() || !self.ssa_work.is_empty() {
            while let Some((from, to)) = self.cfg_work.pop() {
                if !self.edge_visited.insert((from, to)) {
                    continue;
                }
                self.visit_block(from, to);
            }
            while let Some((block, idx)) = self.ssa_work.pop() {
                if self.block_visited.contains(&block) {
                    self.visit_inst(block, idx);
                }
            }
        }

        // Fixpoint reached: substitute constants, record dead edges, flag
        // blocks the propagation never reached.
        for &id in &self.func.layout.clone() {
            if !self.block_visited.contains(&id) {
                self.func.block_mut(id).unreachable = true;
            }
            for idx in 0..self.func.block(id).insts.len() {
                if self.substitute(id, idx) {
                    self.func.block_mut(id).unreachable = true;
                }
            }
        }
    }

    fn value_of(&self, token: &str) -> Cell {
        if token == UNDEF {
            return Cell::Unknown;
        }
        if is_local(token) {
            return self.cells.get(token).copied().unwrap_or(Cell::NotConst);
        }
        if is_global(token) {
            return Cell::NotConst;
        }
        Cell::Const(parse_imm(token))
    }

    fn try_update(&mut self, name: &str, value: Cell) {
        if self.cells.get(name) != Some(&value) {
            self.cells.insert(name.to_string(), value);
            if let Some(sites) = self.use_sites.get(name) {
                self.ssa_work.extend(sites.iter().copied());
            }
        }
    }

    fn visit_block(&mut self, _from: BlockId, to: BlockId) {
        // Re-meet every phi each time a new incoming edge turns executable.
        let phi_count = self.func.block(to).phi_count();
        for idx in 0..phi_count {
            self.visit_phi(to, idx);
        }
        if !self.block_visited.insert(to) {
            return;
        }
        for idx in phi_count..self.func.block(to).insts.len() {
            self.visit_expr(to, idx);
        }
    }

    fn visit_inst(&mut self, block: BlockId, idx: usize) {
        if self.func.block(block).insts[idx].is_phi() {
            self.visit_phi(block, idx);
        } else {
            self.visit_expr(block, idx);
        }
    }

    fn visit_phi(&mut self, block: BlockId, idx: usize) {
        let InstKind::Phi { dest, incoming, .. } = &self.func.block(block).insts[idx].kind else {
            return;
        };
        let dest = dest.clone();
        let mut value = Cell::Unknown;
        for (pred, token) in incoming {
            if self.edge_visited.contains(&(*pred, block)) {
                value = meet(value, self.value_of(token));
            }
        }
        self.try_update(&dest, value);
    }

    fn visit_expr(&mut self, block: BlockId, idx: usize) {
        let kind = self.func.block(block).insts[idx].kind.clone();
        match kind {
            InstKind::Load { dest, .. } | InstKind::Gep { dest, .. } => {
                self.try_update(&dest, Cell::NotConst);
            }
            InstKind::Call(call) => {
                if let Some(dest) = call.dest {
                    self.try_update(&dest, Cell::NotConst);
                }
            }
            InstKind::Icmp { dest, op, lhs, rhs, .. } => {
                let (lv, rv) = (self.value_of(&lhs), self.value_of(&rhs));
                if lv == Cell::Unknown || rv == Cell::Unknown {
                    return;
                }
                if lhs == rhs {
                    let result = matches!(op, IcmpOp::Eq | IcmpOp::Sle | IcmpOp::Sge);
                    return self.try_update(&dest, Cell::Const(result as i32));
                }
                let (Cell::Const(a), Cell::Const(b)) = (lv, rv) else {
                    return self.try_update(&dest, Cell::NotConst);
                };
                let result = match op {
                    IcmpOp::Eq => a == b,
                    IcmpOp::Ne => a != b,
                    IcmpOp::Slt => a < b,
                    IcmpOp::Sgt => a > b,
                    IcmpOp::Sle => a <= b,
                    IcmpOp::Sge => a >= b,
                };
                self.try_update(&dest, Cell::Const(result as i32));
            }
            InstKind::Bin { dest, op, lhs, rhs, .. } => {
                let (lv, rv) = (self.value_of(&lhs), self.value_of(&rhs));
                if lv == Cell::Unknown || rv == Cell::Unknown {
                    return;
                }
                let (Cell::Const(a), Cell::Const(b)) = (lv, rv) else {
                    // x - x and x ^ x are zero whatever x is.
                    if lhs == rhs && matches!(op, BinOp::Sub | BinOp::Xor) {
                        return self.try_update(&dest, Cell::Const(0));
                    }
                    return self.try_update(&dest, Cell::NotConst);
                };
                let result = match op {
                    BinOp::Add => a.wrapping_add(b),
                    BinOp::Sub => a.wrapping_sub(b),
                    BinOp::Mul => a.wrapping_mul(b),
                    BinOp::Sdiv => {
                        if b == 0 {
                            return; // undefined; leave the cell unknown
                        }
                        a.wrapping_div(b)
                    }
                    BinOp::Srem => {
                        if b == 0 {
                            return;
                        }
                        a.wrapping_rem(b)
                    }
                    BinOp::And => a & b,
                    BinOp::Or => a | b,
                    BinOp::Xor => a ^ b,
                    BinOp::Shl => a.wrapping_shl(b as u32 & 0x1f),
                    BinOp::Ashr => a.wrapping_shr(b as u32 & 0x1f),
                    BinOp::Smulh => ((a as i64 * b as i64) >> 32) as i32,
                };
                self.try_update(&dest, Cell::Const(result));
            }
            InstKind::Jump => {
                let succ = self.func.block(block).successors[0];
                self.cfg_work.push((block, succ));
            }
            InstKind::Branch { cond, .. } => {
                let succs = self.func.block(block).successors.clone();
                match self.value_of(&cond) {
                    Cell::Unknown => {}
                    Cell::NotConst => {
                        self.cfg_work.push((block, succs[1]));
                        self.cfg_work.push((block, succs[0]));
                    }
                    Cell::Const(c) => {
                        let taken = if c != 0 { succs[0] } else { succs[1] };
                        self.cfg_work.push((block, taken));
                    }
                }
            }
            InstKind::Store { .. } | InstKind::Alloca { .. } | InstKind::Ret { .. } => {}
            InstKind::Phi { .. } => unreachable!("phi reached visit_expr"),
        }
    }

    /// Substitute known constants into one instruction's operands. Returns
    /// true when the instruction consumes a value that is still unknown on
    /// every executable path, i.e. the block cannot actually execute.
    fn substitute(&mut self, block: BlockId, idx: usize) -> bool {
        let is_phi = self.func.block(block).insts[idx].is_phi();
        let mut dead_edges: Vec<(BlockId, BlockId)> = Vec::new();
        let mut unreachable = false;

        if is_phi {
            let InstKind::Phi { incoming, .. } = &mut self.func.block_mut(block).insts[idx].kind
            else {
                unreachable!()
            };
            let mut rewrites: Vec<(usize, String)> = Vec::new();
            for (i, (pred, token)) in incoming.iter().enumerate() {
                match cell_for_token(&self.cells, token) {
                    Some(Cell::Unknown) => dead_edges.push((*pred, block)),
                    Some(Cell::Const(v)) => {
                        if let Some(ty) = self.type_map.get(token.as_str()) {
                            rewrites.push((i, to_imm(v, *ty)));
                        }
                    }
                    _ => {}
                }
            }
            for (i, imm) in rewrites {
                incoming[i].1 = imm;
            }
        } else {
            let cells = &self.cells;
            let type_map = &self.type_map;
            self.func.block_mut(block).insts[idx].for_each_use_mut(|token| {
                match cell_for_token(cells, token) {
                    Some(Cell::Unknown) => unreachable = true,
                    Some(Cell::Const(v)) => {
                        if let Some(ty) = type_map.get(token.as_str()) {
                            *token = to_imm(v, *ty);
                        }
                    }
                    _ => {}
                }
            });
        }

        // A branch whose condition folded to a literal keeps only the
        // taken edge.
        if let InstKind::Branch { cond, .. } = &self.func.block(block).insts[idx].kind {
            if cond == "true" || cond == "false" {
                let succs = &self.func.block(block).successors;
                let dead = if cond == "false" { succs[0] } else { succs[1] };
                dead_edges.push((block, dead));
            }
        }
        self.func.edge_to_remove.extend(dead_edges);
        unreachable
    }
}

/// The cell for an operand token, or `None` when the token is not an SSA
/// name tracked by the lattice. `undef` reads as unknown.
fn cell_for_token(cells: &FxHashMap<String, Cell>, token: &str) -> Option<Cell> {
    if token == UNDEF {
        return Some(Cell::Unknown);
    }
    cells.get(token).copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::renamer::Renamer;
    use crate::ir::interp::run_main;
    use crate::ir::parser::parse_module;
    use crate::ir::printer::module_text;
    use crate::passes::cfg_transform::remove_unreachable;

    fn run_sccp(src: &str) -> crate::ir::ir::IrModule {
        let mut module = parse_module(src).unwrap();
        module
            .for_each_definition(|f, _: &mut Renamer| sparse_conditional_constant_propagation(f));
        module
    }

    #[test]
    fn test_straight_line_folding() {
        let module = run_sccp(
            "\
define i32 @main() {
entry:
  %a = add i32 2, 3
  %b = mul i32 %a, %a
  call void @printInt(i32 %b)
  ret i32 0
}
",
        );
        let text = module_text(&module);
        assert!(text.contains("call void @printInt(i32 25)"));
    }

    #[test]
    fn test_constant_branch_records_dead_edge() {
        let src = "\
define i32 @main() {
entry:
  %c = icmp slt i32 1, 2
  br i1 %c, label %yes, label %no
yes:
  call void @printInt(i32 1)
  br label %exit
no:
  call void @printInt(i32 2)
  br label %exit
exit:
  ret i32 0
}
";
        let mut module = parse_module(src).unwrap();
        {
            let f = module.functions.iter_mut().find(|f| f.name == "@main").unwrap();
            sparse_conditional_constant_propagation(f);
            assert_eq!(f.edge_to_remove.len(), 1);
            let no = f.layout[2];
            assert!(f.block(no).unreachable);
            remove_unreachable(f);
            assert_eq!(f.layout.len(), 3);
        }
        assert_eq!(run_main(&module).1, "1");
    }

    #[test]
    fn test_phi_meets_only_executable_edges() {
        let src = "\
define i32 @main() {
entry:
  br i1 true, label %a, label %b
a:
  br label %join
b:
  br label %join
join:
  %x = phi i32 [7, %a], [9, %b]
  call void @printInt(i32 %x)
  ret i32 0
}
";
        let module = run_sccp(src);
        let text = module_text(&module);
        // Only the %a edge executes, so the phi folds to 7.
        assert!(text.contains("call void @printInt(i32 7)"));
    }

    #[test]
    fn test_loop_counter_stays_variable() {
        let src = "\
define i32 @main() {
entry:
  br label %head
head:
  %i = phi i32 [0, %entry], [%i.next, %head]
  %i.next = add i32 %i, 1
  %c = icmp slt i32 %i.next, 10
  br i1 %c, label %head, label %exit
exit:
  call void @printInt(i32 %i)
  ret i32 0
}
";
        let module = run_sccp(src);
        let text = module_text(&module);
        assert!(text.contains("%i.next = add i32 %i, 1"));
    }

    #[test]
    fn test_division_matches_hardware_semantics() {
        let module = run_sccp(
            "\
define i32 @main() {
entry:
  %a = sdiv i32 -7, 2
  %b = srem i32 -7, 2
  %c = add i32 %a, %b
  call void @printInt(i32 %c)
  ret i32 0
}
",
        );
        let text = module_text(&module);
        // -7 / 2 truncates to -3, remainder -1.
        assert!(text.contains("call void @printInt(i32 -4)"));
    }

    #[test]
    fn test_observable_output_is_preserved() {
        let src = "\
define i32 @main() {
entry:
  %n = call i32 @getInt()
  %k = mul i32 3, 4
  %m = add i32 %n, %k
  %c = icmp sge i32 %k, 12
  br i1 %c, label %yes, label %no
yes:
  call void @printInt(i32 %m)
  br label %exit
no:
  call void @printInt(i32 0)
  br label %exit
exit:
  ret i32 0
}
";
        let plain = parse_module(src).unwrap();
        let mut optimised = parse_module(src).unwrap();
        optimised
            .for_each_definition(|f, _: &mut Renamer| sparse_conditional_constant_propagation(f));
        optimised.for_each_definition(|f, _: &mut Renamer| remove_unreachable(f));

        let mut a = crate::ir::interp::Interp::new(&plain);
        a.input_ints.push(30);
        a.run();
        let mut b = crate::ir::interp::Interp::new(&optimised);
        b.input_ints.push(30);
        b.run();
        assert_eq!(a.output, b.output);
    }
}
