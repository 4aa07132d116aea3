//! Lowering the MIR module to RISC-V assembly.
//!
//! Per function: allocate registers, lay out the frame (outgoing stack
//! arguments, coalesced spill slots, the caller-save region, the
//! callee-save region, rounded to 16 bytes), select instructions per
//! block with `t0`/`t1` as the only scratch registers, realise phis as
//! parallel moves on the incoming edges (splitting critical edges with
//! trampoline blocks), order blocks in reverse postorder so the common
//! path falls through, and finally relax conditional branches whose
//! targets sit outside a conservative ±800-instruction window.
//!
//! Instruction selection runs twice per function: the first pass only
//! discovers which callee-saved registers and how many caller-save slots
//! the function needs, the second produces the code.

use std::collections::BTreeSet;

use tracing::debug;

use crate::backend::asm::*;
use crate::backend::operand::{rearrange_operands, Operand};
use crate::backend::regalloc::{allocate_registers, RegAlloc};
use crate::common::fx_hash::FxHashMap;
use crate::common::types::IrType;
use crate::ir::ir::*;

const CALLEE_SAVED: [&str; 12] =
    ["s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11"];
const CALLER_SAVED: [&str; 14] =
    ["ra", "t2", "t3", "t4", "t5", "t6", "a0", "a1", "a2", "a3", "a4", "a5", "a6", "a7"];
const ARG_REGS: [&str; 8] = ["a0", "a1", "a2", "a3", "a4", "a5", "a6", "a7"];

/// Leaf bodies get the temporaries first so calls never force saves;
/// everything else prefers callee-saved registers.
fn register_list(is_leaf: bool) -> [&'static str; 26] {
    if is_leaf {
        [
            "ra", "a0", "a1", "a2", "a3", "a4", "a5", "a6", "a7", "t2", "t3", "t4", "t5", "t6",
            "s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11",
        ]
    } else {
        [
            "ra", "a0", "a1", "a2", "a3", "a4", "a5", "a6", "a7", "s0", "s1", "s2", "s3", "s4",
            "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t2", "t3", "t4", "t5", "t6",
        ]
    }
}

pub struct AsmBuilder<'m> {
    module: &'m IrModule,
    /// `@symbol` → asm label, for globals and string literals.
    global_symbols: FxHashMap<String, String>,
    regs: FxHashMap<String, &'static str>,
    slots: FxHashMap<String, i32>,
    callee_used: BTreeSet<&'static str>,
    max_saved_reg: usize,
    stack_size: i32,
    block_counter: u32,
    func_name: String,
}

pub fn build_module(module: &IrModule) -> AsmModule {
    AsmBuilder::new(module).build()
}

impl<'m> AsmBuilder<'m> {
    pub fn new(module: &'m IrModule) -> AsmBuilder<'m> {
        AsmBuilder {
            module,
            global_symbols: FxHashMap::default(),
            regs: FxHashMap::default(),
            slots: FxHashMap::default(),
            callee_used: BTreeSet::new(),
            max_saved_reg: 0,
            stack_size: 0,
            block_counter: 0,
            func_name: String::new(),
        }
    }

    pub fn build(mut self) -> AsmModule {
        let module = self.module;
        let mut out = AsmModule::default();
        for global in &module.globals {
            let label = global.name.trim_start_matches('@').to_string();
            self.global_symbols.insert(global.name.clone(), label.clone());
            out.globals.push(AsmGlobal { name: label, value: global.init });
        }
        for s in &module.strings {
            let label = s.name.trim_start_matches('@').to_string();
            self.global_symbols.insert(s.name.clone(), label.clone());
            out.strings.push(AsmStr { name: label, value: s.value.clone() });
        }
        for function in &module.functions {
            if function.is_declaration() {
                continue;
            }
            out.functions.push(self.build_function(function));
        }
        out
    }

    fn fresh_label(&mut self) -> String {
        let label = format!(".L_{}_{}", self.func_name, self.block_counter);
        self.block_counter += 1;
        label
    }

    fn build_function(&mut self, ir_func: &Function) -> AsmFunction {
        debug!(function = %ir_func.name, "building assembly");
        let label = ir_func.name.trim_start_matches('@').to_string();
        let mut func = AsmFunction::new(label);
        self.func_name = func.label.clone();
        self.block_counter = 0;
        self.max_saved_reg = 0;
        self.regs.clear();
        self.slots.clear();
        self.callee_used.clear();
        let header_label = self.fresh_label();

        let table = allocate_registers(ir_func);
        let registers = register_list(ir_func.is_leaf);

        // Frame: incoming overflow mirror + outgoing call arguments first.
        self.stack_size = 4 * (ir_func.params.len() as i32 - 8).max(0);
        self.stack_size += 4 * (max_call_args(ir_func) as i32 - 8).max(0);

        // Spill slots, coalesced per pointer name; then resolve register ids.
        let mut slot_offsets: FxHashMap<String, i32> = FxHashMap::default();
        let mut entries: Vec<(&String, &RegAlloc)> = table.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        for (var, alloc) in entries {
            match alloc {
                RegAlloc::Stack(pointer) => {
                    let offset = *slot_offsets.entry(pointer.clone()).or_insert_with(|| {
                        let offset = self.stack_size;
                        self.stack_size += 4;
                        offset
                    });
                    self.slots.insert(var.clone(), offset);
                }
                RegAlloc::Register(id) => {
                    let reg = registers[*id];
                    self.regs.insert(var.clone(), reg);
                    if CALLEE_SAVED.contains(&reg) {
                        self.callee_used.insert(reg);
                    }
                }
            }
        }

        // First pass pins down callee_used and max_saved_reg; the second
        // emits with those stable.
        let _ = self.build_blocks(ir_func);
        self.block_counter = 1; // header keeps label 0
        let mut blocks = self.build_blocks(ir_func);
        link_blocks(ir_func, &mut blocks);
        let mut func_blocks = blocks;
        self.eliminate_phi(ir_func, &mut func_blocks);

        // Header: sp adjustment, parameter placement, callee saves.
        let callee_sorted: Vec<&'static str> = self.callee_used.iter().copied().collect();
        self.stack_size += self.max_saved_reg as i32 * 4;
        let save_from: Vec<Operand> = callee_sorted.iter().map(|&r| Operand::Reg(r)).collect();
        let save_to: Vec<Operand> = (0..callee_sorted.len())
            .map(|i| Operand::Stack(self.stack_size + i as i32 * 4))
            .collect();
        self.stack_size += callee_sorted.len() as i32 * 4;
        self.stack_size = (self.stack_size + 15) / 16 * 16;
        func.stack_size = self.stack_size;

        let mut header = AsmBlock::new(header_label);
        if self.stack_size > 0 {
            if self.stack_size <= 2048 {
                header.insts.push(AsmInst::Cmd {
                    op: "addi",
                    dest: "sp".to_string(),
                    operands: vec!["sp".to_string(), (-self.stack_size).to_string()],
                });
            } else {
                header.insts.push(AsmInst::Cmd {
                    op: "li",
                    dest: "t0".to_string(),
                    operands: vec![(-self.stack_size).to_string()],
                });
                header.insts.push(AsmInst::Cmd {
                    op: "add",
                    dest: "sp".to_string(),
                    operands: vec!["sp".to_string(), "t0".to_string()],
                });
            }
        }
        let mut param_from = vec![Operand::Reg("ra")];
        param_from.extend(prepare_params(ir_func.params.len()));
        for operand in &mut param_from {
            if let Operand::Stack(offset) = operand {
                // Incoming overflow arguments live in the caller's frame.
                *offset += self.stack_size;
            }
        }
        let mut param_names = vec![RET_ADDR.to_string()];
        param_names.extend(ir_func.params.iter().map(|p| p.name.clone()));
        let param_to = self.prepare_var_to(&param_names);
        let mut from = param_from;
        from.extend(save_from);
        let mut to = param_to;
        to.extend(save_to);
        header.insts.extend(rearrange_operands(&from, &to, "t0", "t1"));
        header.flow = Some(FlowControl::jump());

        // Wire the header in front of the entry block.
        func.blocks = func_blocks;
        let header_idx = func.add_block(header);
        func.blocks[header_idx].successors = vec![0];
        func.blocks[0].predecessors.insert(0, header_idx);

        func.order = rearrange_blocks(&func.blocks, header_idx);
        relax_branch_offsets(&mut func);
        func
    }

    fn build_blocks(&mut self, ir_func: &Function) -> Vec<AsmBlock> {
        ir_func.layout.iter().map(|&id| self.build_block(ir_func, id)).collect()
    }

    fn prepare_var_from(&self, names: &[String]) -> Vec<Operand> {
        names
            .iter()
            .map(|name| {
                if let Some(&reg) = self.regs.get(name) {
                    Operand::Reg(reg)
                } else if let Some(&offset) = self.slots.get(name) {
                    Operand::Stack(offset)
                } else if let Some(label) = self.global_symbols.get(name) {
                    Operand::Global(label.clone())
                } else {
                    Operand::Imm(parse_imm(name))
                }
            })
            .collect()
    }

    fn prepare_var_to(&self, names: &[String]) -> Vec<Operand> {
        names
            .iter()
            .map(|name| {
                if let Some(&reg) = self.regs.get(name) {
                    Operand::Reg(reg)
                } else if let Some(&offset) = self.slots.get(name) {
                    Operand::Stack(offset)
                } else {
                    panic!("{}: move destination {} has no allocation", self.func_name, name)
                }
            })
            .collect()
    }

    /// Resolve a destination name to the register the result should be
    /// computed into, plus the store that parks it if it lives on the stack.
    fn prepare_dest(&self, name: &str) -> (String, Option<AsmInst>) {
        if let Some(&reg) = self.regs.get(name) {
            (reg.to_string(), None)
        } else if let Some(&offset) = self.slots.get(name) {
            let store = AsmInst::Mem {
                op: "sw",
                reg: "t0".to_string(),
                addr: MemAddr::Offset { base: "sp", offset },
            };
            ("t0".to_string(), Some(store))
        } else {
            panic!("{}: destination {} has no allocation", self.func_name, name)
        }
    }

    /// Resolve an operand, loading it into `tmp` when it lives on the
    /// stack or is a string address. Returns the operand and whether the
    /// scratch got used.
    fn prepare_operand(&self, block: &mut AsmBlock, name: &str, tmp: &'static str) -> (Operand, bool) {
        if let Some(&reg) = self.regs.get(name) {
            (Operand::Reg(reg), false)
        } else if let Some(&offset) = self.slots.get(name) {
            block.insts.push(AsmInst::Mem {
                op: "lw",
                reg: tmp.to_string(),
                addr: MemAddr::Offset { base: "sp", offset },
            });
            (Operand::Reg(tmp), true)
        } else if let Some(label) = self.global_symbols.get(name) {
            assert!(
                label.starts_with(".str"),
                "{}: global {} read outside load/store",
                self.func_name,
                name
            );
            block.insts.push(AsmInst::Mem {
                op: "la",
                reg: tmp.to_string(),
                addr: MemAddr::Symbol { label: label.clone(), tmp: None },
            });
            (Operand::Reg(tmp), true)
        } else if is_zero(name) {
            (Operand::Reg("zero"), false)
        } else {
            (Operand::Imm(parse_imm(name)), false)
        }
    }

    fn prepare_operands(
        &self,
        block: &mut AsmBlock,
        lhs: &str,
        rhs: &str,
    ) -> (Operand, Operand) {
        let (lhs, used) = self.prepare_operand(block, lhs, "t0");
        let tmp = if used { "t1" } else { "t0" };
        let (rhs, _) = self.prepare_operand(block, rhs, tmp);
        (lhs, rhs)
    }

    fn restore_callee_saved(&self) -> Vec<AsmInst> {
        let base = self.stack_size + self.max_saved_reg as i32 * 4;
        self.callee_used
            .iter()
            .enumerate()
            .map(|(i, &reg)| AsmInst::Mem {
                op: "lw",
                reg: reg.to_string(),
                addr: MemAddr::Offset { base: "sp", offset: base + i as i32 * 4 },
            })
            .collect()
    }

    fn build_block(&mut self, ir_func: &Function, id: BlockId) -> AsmBlock {
        let mut block = AsmBlock::new(self.fresh_label());
        let ir_block = ir_func.block(id);
        for inst in &ir_block.insts {
            match &inst.kind {
                InstKind::Phi { .. } => continue, // realised on the incoming edges
                InstKind::Bin { dest, op, lhs, rhs, .. } => {
                    self.emit_bin(&mut block, dest, *op, lhs, rhs);
                }
                InstKind::Icmp { dest, op, lhs, rhs, .. } => {
                    self.emit_icmp(&mut block, dest, *op, lhs, rhs);
                }
                InstKind::Load { dest, ty, addr } => {
                    let (dest, store) = self.prepare_dest(dest);
                    if self.regs.contains_key(addr) || self.slots.contains_key(addr) {
                        let width = if *ty == IrType::I1 { "lb" } else { "lw" };
                        let (addr, _) = self.prepare_operand(&mut block, addr, "t0");
                        let Operand::Reg(base) = addr else {
                            panic!("{}: load address is not a register", self.func_name)
                        };
                        block.insts.push(AsmInst::Mem {
                            op: width,
                            reg: dest.clone(),
                            addr: MemAddr::Offset { base, offset: 0 },
                        });
                    } else {
                        let label = self.global_symbols[addr].clone();
                        block.insts.push(AsmInst::Mem {
                            op: "lw",
                            reg: dest.clone(),
                            addr: MemAddr::Symbol { label, tmp: None },
                        });
                    }
                    block.insts.extend(store);
                }
                InstKind::Store { ty, addr, src } => {
                    if self.regs.contains_key(addr) || self.slots.contains_key(addr) {
                        let width = if *ty == IrType::I1 { "sb" } else { "sw" };
                        let (value, pos) = self.prepare_operands(&mut block, src, addr);
                        let (Operand::Reg(value), Operand::Reg(pos)) = (value, pos) else {
                            panic!("{}: store operands must be registers", self.func_name)
                        };
                        block.insts.push(AsmInst::Mem {
                            op: width,
                            reg: value.to_string(),
                            addr: MemAddr::Offset { base: pos, offset: 0 },
                        });
                    } else {
                        let (value, used) = self.prepare_operand(&mut block, src, "t0");
                        let tmp = if used { "t1" } else { "t0" };
                        let Operand::Reg(value) = value else {
                            panic!("{}: store value is not a register", self.func_name)
                        };
                        let label = self.global_symbols[addr].clone();
                        block.insts.push(AsmInst::Mem {
                            op: "sw",
                            reg: value.to_string(),
                            addr: MemAddr::Symbol { label, tmp: Some(tmp) },
                        });
                    }
                }
                InstKind::Jump => block.flow = Some(FlowControl::jump()),
                InstKind::Branch { cond, fused } => self.emit_branch(&mut block, cond, fused),
                InstKind::Ret { value, .. } => {
                    if let Some(value) = value {
                        let (operand, _) = self.prepare_operand(&mut block, value, "a0");
                        match operand {
                            Operand::Imm(v) => block.insts.push(AsmInst::Cmd {
                                op: "li",
                                dest: "a0".to_string(),
                                operands: vec![v.to_string()],
                            }),
                            Operand::Reg(reg) if reg != "a0" => block.insts.push(AsmInst::Mv {
                                dest: "a0".to_string(),
                                src: reg.to_string(),
                            }),
                            _ => {}
                        }
                    }
                    block.insts.extend(self.restore_callee_saved());
                    if let Some(&offset) = self.slots.get(RET_ADDR) {
                        block.insts.push(AsmInst::Mem {
                            op: "lw",
                            reg: "ra".to_string(),
                            addr: MemAddr::Offset { base: "sp", offset },
                        });
                    }
                    block.flow = Some(FlowControl::ret());
                }
                InstKind::Call(call) if !call.tail_call => self.emit_call(&mut block, inst, call),
                InstKind::Call(call) if call.self_tail_call => {
                    // Rebind the parameters and let the following jump loop
                    // back to the entry.
                    let from = self.prepare_var_from(&call.args);
                    let names: Vec<String> =
                        ir_func.params.iter().map(|p| p.name.clone()).collect();
                    let to = self.prepare_var_to(&names);
                    block.insts.extend(rearrange_operands(&from, &to, "t0", "t1"));
                }
                InstKind::Call(call) => {
                    // Non-self tail call: rebind ra + arguments, restore
                    // callee-saved registers, emit the tail transfer.
                    let mut names = vec![RET_ADDR.to_string()];
                    names.extend(call.args.iter().cloned());
                    let from = self.prepare_var_from(&names);
                    let mut to = vec![Operand::Reg("ra")];
                    to.extend(prepare_params(call.args.len()));
                    block.insts.extend(rearrange_operands(&from, &to, "t0", "t1"));
                    block.insts.extend(self.restore_callee_saved());
                    block.flow =
                        Some(FlowControl::tail(call.callee.trim_start_matches('@').to_string()));
                }
                InstKind::Alloca { .. } | InstKind::Gep { .. } => {
                    panic!("{}: {:?} survived lowering", self.func_name, inst.kind)
                }
            }
        }
        block
    }

    fn emit_bin(&mut self, block: &mut AsmBlock, dest: &str, op: BinOp, lhs: &str, rhs: &str) {
        let (dest, store) = self.prepare_dest(dest);
        if op == BinOp::Add && lhs == "0" {
            // li materialisation from the MIR rewriter.
            block.insts.push(AsmInst::Cmd {
                op: "li",
                dest,
                operands: vec![parse_imm(rhs).to_string()],
            });
            block.insts.extend(store);
            return;
        }
        if op == BinOp::Sub && lhs == "0" {
            let (_, rhs) = self.prepare_operands(block, lhs, rhs);
            match rhs {
                Operand::Imm(v) => block.insts.push(AsmInst::Cmd {
                    op: "li",
                    dest,
                    operands: vec![(-v).to_string()],
                }),
                Operand::Reg(reg) => block.insts.push(AsmInst::Cmd {
                    op: "neg",
                    dest,
                    operands: vec![reg.to_string()],
                }),
                _ => unreachable!(),
            }
            block.insts.extend(store);
            return;
        }
        let (lhs, rhs) = self.prepare_operands(block, lhs, rhs);
        let Operand::Reg(lhs) = lhs else {
            panic!("{}: unlowered immediate on the left of {:?}", self.func_name, op)
        };
        assert!(
            matches!(rhs, Operand::Reg(_)) || rhs.is_lower(),
            "{}: immediate operand out of range for {:?}",
            self.func_name,
            op
        );
        let inst = match op {
            BinOp::Add | BinOp::And | BinOp::Or | BinOp::Xor => {
                let mnemonic = match (op, &rhs) {
                    (BinOp::Add, Operand::Imm(_)) => "addi",
                    (BinOp::Add, _) => "add",
                    (BinOp::And, Operand::Imm(_)) => "andi",
                    (BinOp::And, _) => "and",
                    (BinOp::Or, Operand::Imm(_)) => "ori",
                    (BinOp::Or, _) => "or",
                    (BinOp::Xor, Operand::Imm(_)) => "xori",
                    (BinOp::Xor, _) => "xor",
                    _ => unreachable!(),
                };
                AsmInst::Cmd { op: mnemonic, dest, operands: vec![lhs.to_string(), operand_text(&rhs)] }
            }
            BinOp::Sub => match rhs {
                Operand::Imm(v) => AsmInst::Cmd {
                    op: "addi",
                    dest,
                    operands: vec![lhs.to_string(), (-v).to_string()],
                },
                _ => AsmInst::Cmd {
                    op: "sub",
                    dest,
                    operands: vec![lhs.to_string(), operand_text(&rhs)],
                },
            },
            BinOp::Shl | BinOp::Ashr => {
                let base = if op == BinOp::Shl { "sll" } else { "sra" };
                let mnemonic = match rhs {
                    Operand::Imm(_) => {
                        if base == "sll" {
                            "slli"
                        } else {
                            "srai"
                        }
                    }
                    _ => base,
                };
                AsmInst::Cmd { op: mnemonic, dest, operands: vec![lhs.to_string(), operand_text(&rhs)] }
            }
            BinOp::Mul | BinOp::Sdiv | BinOp::Srem | BinOp::Smulh => {
                let mnemonic = match op {
                    BinOp::Mul => "mul",
                    BinOp::Sdiv => "div",
                    BinOp::Srem => "rem",
                    BinOp::Smulh => "mulh",
                    _ => unreachable!(),
                };
                assert!(
                    matches!(rhs, Operand::Reg(_)),
                    "{}: {} needs a register operand",
                    self.func_name,
                    mnemonic
                );
                AsmInst::Cmd { op: mnemonic, dest, operands: vec![lhs.to_string(), operand_text(&rhs)] }
            }
        };
        block.insts.push(inst);
        block.insts.extend(store);
    }

    fn emit_icmp(&mut self, block: &mut AsmBlock, dest: &str, op: IcmpOp, lhs: &str, rhs: &str) {
        let (dest, store) = self.prepare_dest(dest);
        if is_zero(rhs) {
            let (lhs, _) = self.prepare_operand(block, lhs, "t0");
            let Operand::Reg(lhs) = lhs else {
                panic!("{}: unlowered immediate on the left of icmp", self.func_name)
            };
            let mnemonic = match op {
                IcmpOp::Slt => "sltz",
                IcmpOp::Sgt => "sgtz",
                IcmpOp::Ne => "snez",
                IcmpOp::Eq => "seqz",
                other => panic!(
                    "{}: comparison {:?} against zero survived lowering",
                    self.func_name, other
                ),
            };
            block.insts.push(AsmInst::Cmd { op: mnemonic, dest, operands: vec![lhs.to_string()] });
        } else {
            let (lhs, rhs) = self.prepare_operands(block, lhs, rhs);
            let Operand::Reg(lhs) = lhs else {
                panic!("{}: unlowered immediate on the left of icmp", self.func_name)
            };
            assert_eq!(op, IcmpOp::Slt, "{}: non-slt comparison survived lowering", self.func_name);
            assert!(matches!(rhs, Operand::Reg(_)) || rhs.is_lower());
            let mnemonic = if matches!(rhs, Operand::Imm(_)) { "slti" } else { "slt" };
            block.insts.push(AsmInst::Cmd {
                op: mnemonic,
                dest,
                operands: vec![lhs.to_string(), operand_text(&rhs)],
            });
        }
        block.insts.extend(store);
    }

    fn emit_branch(&mut self, block: &mut AsmBlock, cond: &str, fused: &Option<FusedIcmp>) {
        match fused {
            Some(icmp) => {
                if is_zero(&icmp.rhs) {
                    let (lhs, _) = self.prepare_operand(block, &icmp.lhs, "t0");
                    let Operand::Reg(lhs) = lhs else {
                        panic!("{}: unlowered immediate in fused branch", self.func_name)
                    };
                    let op = match icmp.op {
                        IcmpOp::Eq => "beqz",
                        IcmpOp::Ne => "bnez",
                        IcmpOp::Slt => "bltz",
                        IcmpOp::Sgt => "bgtz",
                        IcmpOp::Sle => "blez",
                        IcmpOp::Sge => "bgez",
                    };
                    block.flow = Some(FlowControl::branch(op, vec![lhs.to_string()]));
                } else {
                    let (lhs, rhs) = self.prepare_operands(block, &icmp.lhs, &icmp.rhs);
                    let (Operand::Reg(lhs), Operand::Reg(rhs)) = (lhs, rhs) else {
                        panic!("{}: unlowered immediate in fused branch", self.func_name)
                    };
                    let op = match icmp.op {
                        IcmpOp::Eq => "beq",
                        IcmpOp::Ne => "bne",
                        IcmpOp::Slt => "blt",
                        IcmpOp::Sgt => "bgt",
                        IcmpOp::Sle => "ble",
                        IcmpOp::Sge => "bge",
                    };
                    block.flow =
                        Some(FlowControl::branch(op, vec![lhs.to_string(), rhs.to_string()]));
                }
            }
            None => {
                let (cond, _) = self.prepare_operand(block, cond, "t0");
                let Operand::Reg(cond) = cond else {
                    panic!("{}: branch condition is not a register", self.func_name)
                };
                block.flow = Some(FlowControl::branch("bnez", vec![cond.to_string()]));
            }
        }
    }

    fn emit_call(&mut self, block: &mut AsmBlock, inst: &Inst, call: &CallInst) {
        // Values live across the call sitting in caller-saved registers
        // move into free callee-saved registers, overflowing into the
        // caller-save stack region.
        let mut live_regs: BTreeSet<&'static str> = BTreeSet::new();
        for var in &inst.live_out {
            if Some(var.as_str()) == call.dest.as_deref() {
                continue;
            }
            if let Some(&reg) = self.regs.get(var) {
                live_regs.insert(reg);
            }
        }
        let available: Vec<&'static str> =
            CALLEE_SAVED.iter().copied().filter(|r| !live_regs.contains(r)).collect();
        let caller_regs: Vec<&'static str> =
            live_regs.iter().copied().filter(|r| CALLER_SAVED.contains(r)).collect();
        self.max_saved_reg =
            self.max_saved_reg.max(caller_regs.len().saturating_sub(available.len()));
        let in_regs = caller_regs.len().min(available.len());
        let mut save_to: Vec<Operand> =
            available[..in_regs].iter().map(|&r| Operand::Reg(r)).collect();
        for i in 0..caller_regs.len() - in_regs {
            save_to.push(Operand::Stack(self.stack_size + i as i32 * 4));
        }
        self.callee_used.extend(available[..in_regs].iter().copied());
        let save_from: Vec<Operand> = caller_regs.iter().map(|&r| Operand::Reg(r)).collect();

        let mut from = self.prepare_var_from(&call.args);
        from.extend(save_from.iter().cloned());
        let mut to = prepare_params(call.args.len());
        to.extend(save_to.iter().cloned());
        block.insts.extend(rearrange_operands(&from, &to, "t0", "t1"));

        block
            .insts
            .push(AsmInst::Call { func: call.callee.trim_start_matches('@').to_string() });

        let (mut restore_from, mut restore_to) = (Vec::new(), Vec::new());
        if let Some(dest) = &call.dest {
            restore_from.push(Operand::Reg("a0"));
            restore_to.extend(self.prepare_var_to(std::slice::from_ref(dest)));
        }
        restore_from.extend(save_to);
        restore_to.extend(save_from);
        block.insts.extend(rearrange_operands(&restore_from, &restore_to, "t0", "t1"));
    }

    fn eliminate_phi(&mut self, ir_func: &Function, blocks: &mut Vec<AsmBlock>) {
        let pos = crate::passes::utils::positions(ir_func);
        for (b, &id) in ir_func.layout.iter().enumerate() {
            let ir_block = ir_func.block(id);
            if ir_block.phi_count() == 0 {
                continue;
            }
            let phis: Vec<&Inst> =
                ir_block.insts.iter().take_while(|inst| inst.is_phi()).collect();
            let dests: Vec<String> = phis
                .iter()
                .map(|inst| inst.def().expect("phi without destination").to_string())
                .collect();
            let phi_to = self.prepare_var_to(&dests);

            for (pred_pos, &pred_id) in ir_block.predecessors.iter().enumerate() {
                let pred = pos[pred_id.index()];
                let values: Vec<String> = phis
                    .iter()
                    .map(|inst| {
                        let InstKind::Phi { incoming, .. } = &inst.kind else { unreachable!() };
                        incoming
                            .iter()
                            .find(|(p, _)| *p == pred_id)
                            .map(|(_, v)| v.clone())
                            .expect("phi incoming missing for predecessor")
                    })
                    .collect();
                let phi_from = self.prepare_var_from(&values);
                let moves = rearrange_operands(&phi_from, &phi_to, "t0", "t1");
                if ir_func.block(pred_id).successors.len() > 1 {
                    // Critical edge: park the moves in a trampoline block.
                    let mut tramp = AsmBlock::new(self.fresh_label());
                    tramp.insts = moves;
                    tramp.flow = Some(FlowControl::jump());
                    tramp.predecessors = vec![pred];
                    tramp.successors = vec![b];
                    let t = blocks.len();
                    blocks.push(tramp);
                    let slot = blocks[pred]
                        .successors
                        .iter()
                        .position(|&s| s == b)
                        .expect("edge lost between linked blocks");
                    blocks[pred].successors[slot] = t;
                    blocks[b].predecessors[pred_pos] = t;
                } else {
                    blocks[pred].insts.extend(moves);
                }
            }
        }
    }
}

fn operand_text(operand: &Operand) -> String {
    match operand {
        Operand::Reg(r) => r.to_string(),
        Operand::Imm(v) => v.to_string(),
        _ => panic!("operand has no direct text form"),
    }
}

fn prepare_params(count: usize) -> Vec<Operand> {
    let mut params = Vec::with_capacity(count);
    for reg in ARG_REGS.iter().take(count.min(8)) {
        params.push(Operand::Reg(reg));
    }
    for i in 0..count.saturating_sub(8) {
        params.push(Operand::Stack(i as i32 * 4));
    }
    params
}

fn max_call_args(func: &Function) -> usize {
    let mut max = 0;
    for &id in &func.layout {
        for inst in &func.block(id).insts {
            if let InstKind::Call(call) = &inst.kind {
                max = max.max(call.args.len());
            }
        }
    }
    max
}

/// Mirror the IR edges onto the asm blocks. Branch successors are stored
/// as (false, true) so the emitter's fall-through convention works out.
fn link_blocks(ir_func: &Function, blocks: &mut [AsmBlock]) {
    let pos = crate::passes::utils::positions(ir_func);
    for (b, &id) in ir_func.layout.iter().enumerate() {
        let ir_block = ir_func.block(id);
        blocks[b].predecessors =
            ir_block.predecessors.iter().map(|p| pos[p.index()]).collect();
        let succs: Vec<usize> = ir_block.successors.iter().map(|s| pos[s.index()]).collect();
        blocks[b].successors = if succs.len() == 2 { vec![succs[1], succs[0]] } else { succs };
    }
}

/// Reverse postorder over the emitted graph, so an edge's target tends to
/// follow its source directly.
fn rearrange_blocks(blocks: &[AsmBlock], header: usize) -> Vec<usize> {
    let mut visited = vec![false; blocks.len()];
    let mut postorder = Vec::with_capacity(blocks.len());
    let mut stack: Vec<(usize, usize)> = vec![(header, 0)];
    visited[header] = true;
    while let Some(frame) = stack.last_mut() {
        let b = frame.0;
        let succs = &blocks[b].successors;
        if frame.1 < succs.len() {
            let succ = succs[frame.1];
            frame.1 += 1;
            if !visited[succ] {
                visited[succ] = true;
                stack.push((succ, 0));
            }
        } else {
            postorder.push(b);
            stack.pop();
        }
    }
    assert_eq!(postorder.len(), blocks.len(), "unreachable assembly block");
    postorder.reverse();
    postorder
}

/// Conditional branches reach ±4 KiB; beyond a conservative window the
/// branch is flipped (when only the far target is far) or widened into a
/// short branch over two unconditional jumps.
fn relax_branch_offsets(func: &mut AsmFunction) {
    const TOLERANCE: isize = 800;
    let sizes: Vec<usize> = func.order.iter().map(|&b| func.blocks[b].estimated_size()).collect();
    let mut begin: FxHashMap<usize, isize> = FxHashMap::default();
    let mut end: FxHashMap<usize, isize> = FxHashMap::default();
    let mut at: isize = 0;
    for (&b, &size) in func.order.iter().zip(&sizes) {
        begin.insert(b, at);
        at += size as isize;
        end.insert(b, at);
    }
    for &b in &func.order {
        let succs = func.blocks[b].successors.clone();
        if succs.is_empty() {
            continue;
        }
        let here = end[&b];
        if here == begin[&succs[0]] {
            if let Some(flow) = &mut func.blocks[b].flow {
                flow.can_fallthrough = true;
            }
        }
        if succs.len() == 2 {
            let d0 = (here - begin[&succs[0]]).abs();
            let d1 = (here - begin[&succs[1]]).abs();
            let flow = func.blocks[b].flow.as_mut().expect("branch block without flow");
            if d0 < TOLERANCE && TOLERANCE < d1 {
                flow.flip();
            } else if d0 > TOLERANCE && d1 > TOLERANCE {
                flow.extend_range = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parser::parse_module;
    use crate::passes::{run_passes, OptLevel};

    fn compile(src: &str, level: OptLevel) -> AsmModule {
        let mut module = parse_module(src).unwrap();
        run_passes(&mut module, level, |_, _| {});
        build_module(&module)
    }

    const FIB: &str = "\
define i32 @fib(i32 %n.param) {
entry:
  %c = icmp slt i32 %n.param, 2
  br i1 %c, label %base, label %rec
base:
  ret i32 %n.param
rec:
  %n1 = sub i32 %n.param, 1
  %a = call i32 @fib(i32 %n1)
  %n2 = sub i32 %n.param, 2
  %b = call i32 @fib(i32 %n2)
  %r = add i32 %a, %b
  ret i32 %r
}
define i32 @main() {
entry:
  %f = call i32 @fib(i32 10)
  call void @printInt(i32 %f)
  ret i32 0
}
";

    #[test]
    fn test_fib_compiles_at_every_level() {
        for level in [OptLevel::O0, OptLevel::O1, OptLevel::O2] {
            let asm = compile(FIB, level);
            assert_eq!(asm.functions.len(), 2);
            let text = asm.text();
            assert!(text.contains(".globl fib"));
            assert!(text.contains(".globl main"));
            assert!(text.contains("call fib"));
            assert!(text.contains("call printInt"));
        }
    }

    #[test]
    fn test_frames_stay_16_byte_aligned() {
        let asm = compile(FIB, OptLevel::O1);
        for function in &asm.functions {
            assert_eq!(function.stack_size % 16, 0, "{} frame misaligned", function.label);
        }
    }

    #[test]
    fn test_block_labels_follow_function_pattern() {
        let asm = compile(FIB, OptLevel::O1);
        for function in &asm.functions {
            for &b in &function.order {
                let label = &function.blocks[b].label;
                assert!(
                    label.starts_with(&format!(".L_{}_", function.label)),
                    "stray label {}",
                    label
                );
            }
        }
    }

    #[test]
    fn test_leaf_function_avoids_callee_saved_registers() {
        let src = "\
define i32 @double(i32 %x.param) {
entry:
  %r = add i32 %x.param, %x.param
  ret i32 %r
}
define i32 @main() {
entry:
  %d = call i32 @double(i32 21)
  call void @printInt(i32 %d)
  ret i32 0
}
";
        let asm = compile(src, OptLevel::O1);
        let double = asm.functions.iter().find(|f| f.label == "double").unwrap();
        // A small leaf body touches no s-register, so nothing is saved
        // and the frame stays empty.
        assert_eq!(double.stack_size, 0);
        let text = double.text();
        assert!(!text.contains("sw s"));
    }

    #[test]
    fn test_self_tail_call_becomes_loop() {
        let src = "\
define i32 @spin(i32 %n.param) {
entry:
  %c = icmp eq i32 %n.param, 0
  br i1 %c, label %done, label %more
done:
  ret i32 0
more:
  %n2 = sub i32 %n.param, 1
  %r = call i32 @spin(i32 %n2)
  ret i32 %r
}
define i32 @main() {
entry:
  %r = call i32 @spin(i32 100)
  call void @printInt(i32 %r)
  ret i32 0
}
";
        let asm = compile(src, OptLevel::O1);
        let spin = asm.functions.iter().find(|f| f.label == "spin").unwrap();
        let text = spin.text();
        // The recursive call disappeared: the loop jumps back instead.
        assert!(!text.contains("call spin"));
    }

    #[test]
    fn test_phi_on_critical_edge_gets_trampoline() {
        // entry has two successors and join two predecessors, so the edge
        // entry→join is critical and must be split for the phi move.
        let src = "\
define i32 @main() {
entry:
  %n = call i32 @getInt()
  %c = icmp sgt i32 %n, 0
  br i1 %c, label %mid, label %join
mid:
  br label %join
join:
  %x = phi i32 [1, %mid], [2, %entry]
  call void @printInt(i32 %x)
  ret i32 0
}
";
        let asm = compile(src, OptLevel::O0);
        let main = asm.functions.iter().find(|f| f.label == "main").unwrap();
        // header + 3 body blocks + 1 trampoline
        assert_eq!(main.blocks.len(), 5);
        // The trampoline carries the phi move and jumps to the join.
        let tramp = main
            .blocks
            .iter()
            .find(|b| b.predecessors.len() == 1 && b.successors.len() == 1 && !b.insts.is_empty()
                && matches!(b.flow, Some(FlowControl { kind: FlowKind::Jump, .. }))
                && b.insts.iter().all(|i| matches!(i, AsmInst::Mv { .. } | AsmInst::Cmd { op: "li", .. } | AsmInst::Mem { .. })));
        assert!(tramp.is_some());
        // Every successor referenced by the layout exists in the text.
        let text = main.text();
        for &b in &main.order {
            for succ in &main.blocks[b].successors {
                assert!(text.contains(&main.blocks[*succ].label));
            }
        }
    }

    #[test]
    fn test_globals_and_strings_reach_their_sections() {
        let src = "\
@counter = global i32 5
@.str = private unnamed_addr constant [4 x i8] c\"hi\\0A\\00\"
define i32 @main() {
entry:
  %v = load i32, ptr @counter
  %v2 = add i32 %v, 1
  store i32 %v2, ptr @counter
  call void @print(ptr @.str)
  ret i32 0
}
";
        let asm = compile(src, OptLevel::O0);
        let text = asm.text();
        assert!(text.contains("counter:\n\t.word 5"));
        assert!(text.contains(".asciz \"hi\\n\""));
        assert!(text.contains("lw") && text.contains("counter"));
        assert!(text.contains("la"));
    }
}
