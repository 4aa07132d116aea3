//! The assembly-level program representation and its textual emission.
//!
//! Blocks live in an arena owned by the function; `order` is the emission
//! sequence chosen by the reverse-postorder layout. A block's control
//! transfer is a separate `FlowControl` rather than an instruction so
//! branch relaxation can flip or widen it after everything else is fixed.

use std::fmt::Write;

/// One emitted machine instruction (or pseudo-instruction).
#[derive(Debug, Clone)]
pub enum AsmInst {
    /// `op dest, operands…` — arithmetic, logic, li, comparisons.
    Cmd { op: &'static str, dest: String, operands: Vec<String> },
    Mv { dest: String, src: String },
    /// Load/store/la with either an `offset(base)` address or a symbol
    /// (assembler pseudo form, optionally with a scratch register).
    Mem { op: &'static str, reg: String, addr: MemAddr },
    Call { func: String },
}

#[derive(Debug, Clone)]
pub enum MemAddr {
    Offset { base: &'static str, offset: i32 },
    Symbol { label: String, tmp: Option<&'static str> },
}

impl AsmInst {
    pub fn text(&self) -> String {
        match self {
            AsmInst::Cmd { op, dest, operands } => {
                format!("{} {}, {}", op, dest, operands.join(", "))
            }
            AsmInst::Mv { dest, src } => format!("mv {}, {}", dest, src),
            AsmInst::Mem { op, reg, addr } => match addr {
                MemAddr::Offset { base, offset } => format!("{} {}, {}({})", op, reg, offset, base),
                MemAddr::Symbol { label, tmp: Some(tmp) } => {
                    format!("{} {}, {}, {}", op, reg, label, tmp)
                }
                MemAddr::Symbol { label, tmp: None } => format!("{} {}, {}", op, reg, label),
            },
            AsmInst::Call { func } => format!("call {}", func),
        }
    }
}

#[derive(Debug, Clone)]
pub enum FlowKind {
    Jump,
    /// `op` is the full branch mnemonic (`beq`, `bnez`, `bltz`, …).
    Branch { op: &'static str, operands: Vec<String> },
    Ret,
    Tail { func: String },
}

#[derive(Debug, Clone)]
pub struct FlowControl {
    pub kind: FlowKind,
    pub can_fallthrough: bool,
    /// Widen into `branch .+8; j false; j true` when both targets are far.
    pub extend_range: bool,
    pub flipped: bool,
}

impl FlowControl {
    pub fn jump() -> FlowControl {
        FlowControl { kind: FlowKind::Jump, can_fallthrough: false, extend_range: false, flipped: false }
    }

    pub fn branch(op: &'static str, operands: Vec<String>) -> FlowControl {
        FlowControl {
            kind: FlowKind::Branch { op, operands },
            can_fallthrough: false,
            extend_range: false,
            flipped: false,
        }
    }

    pub fn ret() -> FlowControl {
        FlowControl { kind: FlowKind::Ret, can_fallthrough: false, extend_range: false, flipped: false }
    }

    pub fn tail(func: String) -> FlowControl {
        FlowControl {
            kind: FlowKind::Tail { func },
            can_fallthrough: false,
            extend_range: false,
            flipped: false,
        }
    }

    /// Invert the branch sense; the successor pair is read swapped.
    pub fn flip(&mut self) {
        let FlowKind::Branch { op, .. } = &mut self.kind else {
            panic!("flipping a non-branch flow control")
        };
        self.flipped = !self.flipped;
        self.can_fallthrough = false;
        *op = match *op {
            "blt" => "bge",
            "bge" => "blt",
            "beq" => "bne",
            "bne" => "beq",
            "bnez" => "beqz",
            "beqz" => "bnez",
            "ble" => "bgt",
            "bgt" => "ble",
            "blez" => "bgtz",
            "bgtz" => "blez",
            "bltz" => "bgez",
            "bgez" => "bltz",
            other => panic!("unknown branch mnemonic {}", other),
        };
    }
}

#[derive(Debug)]
pub struct AsmBlock {
    pub label: String,
    pub insts: Vec<AsmInst>,
    pub flow: Option<FlowControl>,
    /// Indices into the owning function's arena.
    pub predecessors: Vec<usize>,
    pub successors: Vec<usize>,
}

impl AsmBlock {
    pub fn new(label: String) -> AsmBlock {
        AsmBlock { label, insts: Vec::new(), flow: None, predecessors: Vec::new(), successors: Vec::new() }
    }

    /// Estimated instruction count once assembled.
    pub fn estimated_size(&self) -> usize {
        self.insts.len() + 2
    }
}

#[derive(Debug)]
pub struct AsmFunction {
    pub label: String,
    pub blocks: Vec<AsmBlock>,
    pub order: Vec<usize>,
    pub stack_size: i32,
}

impl AsmFunction {
    pub fn new(label: String) -> AsmFunction {
        AsmFunction { label, blocks: Vec::new(), order: Vec::new(), stack_size: 0 }
    }

    pub fn add_block(&mut self, block: AsmBlock) -> usize {
        self.blocks.push(block);
        self.blocks.len() - 1
    }

    pub fn text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, ".globl {}", self.label);
        let _ = writeln!(out, "{}:", self.label);
        for &b in &self.order {
            let block = &self.blocks[b];
            let _ = writeln!(out, "{}:", block.label);
            for inst in &block.insts {
                let _ = writeln!(out, "\t{}", inst.text());
            }
            self.emit_flow(block, &mut out);
        }
        out
    }

    fn emit_sp_restore(&self, out: &mut String) {
        if self.stack_size == 0 {
            return;
        }
        if self.stack_size <= 2047 {
            let _ = writeln!(out, "\taddi sp, sp, {}", self.stack_size);
        } else {
            let _ = writeln!(out, "\tli t0, {}", self.stack_size);
            let _ = writeln!(out, "\tadd sp, sp, t0");
        }
    }

    fn emit_flow(&self, block: &AsmBlock, out: &mut String) {
        let Some(flow) = &block.flow else {
            let _ = writeln!(out, "\t# unreachable");
            return;
        };
        match &flow.kind {
            FlowKind::Ret => {
                self.emit_sp_restore(out);
                let _ = writeln!(out, "\tret");
            }
            FlowKind::Tail { func } => {
                self.emit_sp_restore(out);
                let _ = writeln!(out, "\ttail {}", func);
            }
            FlowKind::Jump => {
                if !flow.can_fallthrough {
                    let _ =
                        writeln!(out, "\tj {}", self.blocks[block.successors[0]].label);
                }
            }
            FlowKind::Branch { op, operands } => {
                // Successors are (false, true); a flipped branch reads the
                // pair the other way round.
                let mut false_label = self.blocks[block.successors[0]].label.as_str();
                let mut true_label = self.blocks[block.successors[1]].label.as_str();
                if flow.flipped {
                    std::mem::swap(&mut false_label, &mut true_label);
                }
                let operands = operands.join(", ");
                if flow.extend_range {
                    let _ = writeln!(out, "\t{} {}, .+8", op, operands);
                    let _ = writeln!(out, "\tj {}", false_label);
                    let _ = writeln!(out, "\tj {}", true_label);
                } else if flow.can_fallthrough {
                    let _ = writeln!(out, "\t{} {}, {}", op, operands, true_label);
                } else {
                    let _ = writeln!(out, "\t{} {}, {}", op, operands, true_label);
                    let _ = writeln!(out, "\tj {}", false_label);
                }
            }
        }
    }
}

#[derive(Debug)]
pub struct AsmGlobal {
    pub name: String,
    pub value: i32,
}

#[derive(Debug)]
pub struct AsmStr {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Default)]
pub struct AsmModule {
    pub functions: Vec<AsmFunction>,
    pub globals: Vec<AsmGlobal>,
    pub strings: Vec<AsmStr>,
    pub builtin_functions: String,
}

impl AsmModule {
    pub fn text(&self) -> String {
        let mut out = String::new();
        out.push_str("\t.text\n");
        for function in &self.functions {
            out.push_str(&function.text());
        }
        out.push_str("\t.data\n\t.p2align 2\n");
        for global in &self.globals {
            let _ = writeln!(out, ".globl {}", global.name);
            let _ = writeln!(out, "{}:\n\t.word {}", global.name, global.value);
        }
        out.push_str("\t.rodata\n\t.p2align 2\n");
        for s in &self.strings {
            let escaped = s
                .value
                .replace('\\', "\\\\")
                .replace('\n', "\\n")
                .replace('"', "\\\"");
            let _ = writeln!(out, ".globl {}", s.name);
            let _ = writeln!(out, "{}:\n\t.asciz \"{}\"", s.name, escaped);
        }
        if !self.builtin_functions.is_empty() {
            out.push_str("\n\t# runtime library\n");
            out.push_str(&self.builtin_functions);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_emission_forms() {
        let mut f = AsmFunction::new("f".to_string());
        let b0 = f.add_block(AsmBlock::new(".L_f_0".to_string()));
        let b1 = f.add_block(AsmBlock::new(".L_f_1".to_string()));
        let b2 = f.add_block(AsmBlock::new(".L_f_2".to_string()));
        f.blocks[b0].successors = vec![b1, b2];
        f.blocks[b0].flow = Some(FlowControl::branch("blt", vec!["a0".into(), "a1".into()]));
        f.blocks[b1].flow = Some(FlowControl::ret());
        f.blocks[b2].flow = Some(FlowControl::ret());
        f.order = vec![b0, b1, b2];

        let text = f.text();
        // Branch goes to the true target, fall-through jump to the false.
        assert!(text.contains("blt a0, a1, .L_f_2"));
        assert!(text.contains("j .L_f_1"));

        let flow = f.blocks[b0].flow.as_mut().unwrap();
        flow.flip();
        flow.can_fallthrough = true;
        let text = f.text();
        assert!(text.contains("bge a0, a1, .L_f_1"));
        assert!(!text.contains("j .L_f_1"));
    }

    #[test]
    fn test_extended_range_trio() {
        let mut f = AsmFunction::new("f".to_string());
        let b0 = f.add_block(AsmBlock::new(".L_f_0".to_string()));
        let b1 = f.add_block(AsmBlock::new(".L_f_1".to_string()));
        let b2 = f.add_block(AsmBlock::new(".L_f_2".to_string()));
        f.blocks[b0].successors = vec![b1, b2];
        let mut flow = FlowControl::branch("beqz", vec!["a0".into()]);
        flow.extend_range = true;
        f.blocks[b0].flow = Some(flow);
        f.blocks[b1].flow = Some(FlowControl::ret());
        f.blocks[b2].flow = Some(FlowControl::ret());
        f.order = vec![b0, b1, b2];
        let text = f.text();
        assert!(text.contains("beqz a0, .+8"));
        assert!(text.contains("j .L_f_1"));
        assert!(text.contains("j .L_f_2"));
    }

    #[test]
    fn test_ret_restores_stack() {
        let mut f = AsmFunction::new("f".to_string());
        let b0 = f.add_block(AsmBlock::new(".L_f_0".to_string()));
        f.blocks[b0].flow = Some(FlowControl::ret());
        f.order = vec![b0];
        f.stack_size = 32;
        assert!(f.text().contains("addi sp, sp, 32\n\tret"));
    }

    #[test]
    fn test_module_sections() {
        let mut module = AsmModule::default();
        module.globals.push(AsmGlobal { name: "g".to_string(), value: 7 });
        module.strings.push(AsmStr { name: ".str".to_string(), value: "hi\n".to_string() });
        module.builtin_functions = "malloc:\n\tret\n".to_string();
        let text = module.text();
        assert!(text.contains("\t.data\n\t.p2align 2\n.globl g\ng:\n\t.word 7"));
        assert!(text.contains(".asciz \"hi\\n\""));
        assert!(text.contains("malloc:"));
        let data = text.find(".data").unwrap();
        let rodata = text.find(".rodata").unwrap();
        assert!(data < rodata);
    }
}
