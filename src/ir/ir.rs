//! The SSA intermediate representation.
//!
//! Every SSA value is a textual name. The prefix disambiguates scope:
//! `%` local, `@` global / function / string literal, and a bare token is
//! an immediate literal (`0`, `true`, `false`, `null`, `undef`, decimal).
//!
//! Blocks live in an arena owned by the function and reference each other
//! by [`BlockId`]; the function's `layout` gives the emission and analysis
//! order. Terminators are ordinary instructions and sit last in a block's
//! instruction list. Jump and branch targets are not stored on the
//! instruction: they are the block's `successors` (branch: `[true, false]`),
//! so rewiring an edge is a single list update.

use crate::common::fx_hash::{FxHashMap, FxHashSet};
use crate::common::renamer::Renamer;
use crate::common::types::{builtin_signatures, ClassLayout, FunctionSig, IrType};

/// The reserved liveness name for the return address register.
pub const RET_ADDR: &str = "ret_addr";

/// The undefined value: what a promoted pointer yields on a path that never
/// stored to it. An immediate with value 0 at emission.
pub const UNDEF: &str = "undef";

/// Index into a function's block arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Sdiv,
    Srem,
    Shl,
    Ashr,
    And,
    Or,
    Xor,
    /// High half of a 32x32 signed multiply; produced by the MIR division
    /// strength reduction, never by the front end.
    Smulh,
}

impl BinOp {
    pub fn as_str(self) -> &'static str {
        match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::Sdiv => "sdiv",
            BinOp::Srem => "srem",
            BinOp::Shl => "shl",
            BinOp::Ashr => "ashr",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Xor => "xor",
            BinOp::Smulh => "smulh",
        }
    }

    pub fn from_str(s: &str) -> Option<BinOp> {
        Some(match s {
            "add" => BinOp::Add,
            "sub" => BinOp::Sub,
            "mul" => BinOp::Mul,
            "sdiv" => BinOp::Sdiv,
            "srem" => BinOp::Srem,
            "shl" => BinOp::Shl,
            "ashr" => BinOp::Ashr,
            "and" => BinOp::And,
            "or" => BinOp::Or,
            "xor" => BinOp::Xor,
            "smulh" => BinOp::Smulh,
            _ => return None,
        })
    }

    pub fn is_commutative(self) -> bool {
        matches!(self, BinOp::Add | BinOp::Mul | BinOp::And | BinOp::Or | BinOp::Xor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IcmpOp {
    Eq,
    Ne,
    Slt,
    Sgt,
    Sle,
    Sge,
}

impl IcmpOp {
    pub fn as_str(self) -> &'static str {
        match self {
            IcmpOp::Eq => "eq",
            IcmpOp::Ne => "ne",
            IcmpOp::Slt => "slt",
            IcmpOp::Sgt => "sgt",
            IcmpOp::Sle => "sle",
            IcmpOp::Sge => "sge",
        }
    }

    pub fn from_str(s: &str) -> Option<IcmpOp> {
        Some(match s {
            "eq" => IcmpOp::Eq,
            "ne" => IcmpOp::Ne,
            "slt" => IcmpOp::Slt,
            "sgt" => IcmpOp::Sgt,
            "sle" => IcmpOp::Sle,
            "sge" => IcmpOp::Sge,
            _ => return None,
        })
    }

    /// The predicate with its operands exchanged (`a op b` == `b op' a`).
    pub fn swapped(self) -> IcmpOp {
        match self {
            IcmpOp::Eq => IcmpOp::Eq,
            IcmpOp::Ne => IcmpOp::Ne,
            IcmpOp::Slt => IcmpOp::Sgt,
            IcmpOp::Sgt => IcmpOp::Slt,
            IcmpOp::Sle => IcmpOp::Sge,
            IcmpOp::Sge => IcmpOp::Sle,
        }
    }
}

/// A comparison attached to a branch terminator by the MIR icmp/branch
/// fusion, emitted as a single RISC-V conditional branch.
#[derive(Debug, Clone)]
pub struct FusedIcmp {
    pub op: IcmpOp,
    pub ty: IrType,
    pub lhs: String,
    pub rhs: String,
}

#[derive(Debug, Clone)]
pub struct CallInst {
    pub dest: Option<String>,
    pub callee: String,
    pub ret_ty: IrType,
    pub args: Vec<String>,
    pub arg_tys: Vec<IrType>,
    /// Copied from the callee's signature; an unused result makes the call dead.
    pub no_effect: bool,
    /// Tail position: the following `ret` was folded into this call.
    pub tail_call: bool,
    /// A tail call to the enclosing function, rewritten into a loop.
    pub self_tail_call: bool,
}

#[derive(Debug, Clone)]
pub enum InstKind {
    Bin { dest: String, op: BinOp, ty: IrType, lhs: String, rhs: String },
    Icmp { dest: String, op: IcmpOp, ty: IrType, lhs: String, rhs: String },
    Load { dest: String, ty: IrType, addr: String },
    Store { ty: IrType, addr: String, src: String },
    Alloca { dest: String, ty: IrType },
    /// Class-field access (`member` = field index, offset `member * 4`) or
    /// element access (`index`, scaled by the element width of `ty_name`).
    Gep { dest: String, ty_name: String, ptr: String, index: Option<String>, member: Option<usize> },
    Call(CallInst),
    Phi { dest: String, ty: IrType, incoming: Vec<(BlockId, String)> },
    /// Target: `successors[0]`.
    Jump,
    /// Targets: `successors[0]` (true), `successors[1]` (false).
    Branch { cond: String, fused: Option<FusedIcmp> },
    Ret { ty: IrType, value: Option<String> },
}

/// An instruction plus the liveness annotation the allocator consumes.
#[derive(Debug, Clone)]
pub struct Inst {
    pub kind: InstKind,
    pub live_out: FxHashSet<String>,
}

impl Inst {
    pub fn new(kind: InstKind) -> Inst {
        Inst { kind, live_out: FxHashSet::default() }
    }

    /// The SSA name this instruction defines, if any. A tail call defines
    /// nothing: its result leaves through the return register.
    pub fn def(&self) -> Option<&str> {
        match &self.kind {
            InstKind::Bin { dest, .. }
            | InstKind::Icmp { dest, .. }
            | InstKind::Load { dest, .. }
            | InstKind::Alloca { dest, .. }
            | InstKind::Gep { dest, .. }
            | InstKind::Phi { dest, .. } => Some(dest),
            InstKind::Call(call) => {
                if call.tail_call {
                    None
                } else {
                    call.dest.as_deref()
                }
            }
            InstKind::Store { .. } | InstKind::Jump | InstKind::Branch { .. } | InstKind::Ret { .. } => None,
        }
    }

    /// The ordered operand names. `ret` and tail calls use `ret_addr` so the
    /// return address stays live through non-leaf bodies.
    pub fn for_each_use(&self, mut f: impl FnMut(&str)) {
        match &self.kind {
            InstKind::Bin { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            InstKind::Icmp { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            InstKind::Load { addr, .. } => f(addr),
            InstKind::Store { addr, src, .. } => {
                f(addr);
                f(src);
            }
            InstKind::Alloca { .. } | InstKind::Jump => {}
            InstKind::Gep { ptr, index, .. } => {
                f(ptr);
                if let Some(index) = index {
                    f(index);
                }
            }
            InstKind::Call(call) => {
                if call.tail_call {
                    f(RET_ADDR);
                }
                for arg in &call.args {
                    f(arg);
                }
            }
            InstKind::Phi { incoming, .. } => {
                for (_, value) in incoming {
                    f(value);
                }
            }
            InstKind::Branch { cond, fused } => match fused {
                Some(icmp) => {
                    f(&icmp.lhs);
                    f(&icmp.rhs);
                }
                None => f(cond),
            },
            InstKind::Ret { value, .. } => {
                f(RET_ADDR);
                if let Some(value) = value {
                    f(value);
                }
            }
        }
    }

    pub fn for_each_use_mut(&mut self, mut f: impl FnMut(&mut String)) {
        match &mut self.kind {
            InstKind::Bin { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            InstKind::Icmp { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            InstKind::Load { addr, .. } => f(addr),
            InstKind::Store { addr, src, .. } => {
                f(addr);
                f(src);
            }
            InstKind::Alloca { .. } | InstKind::Jump => {}
            InstKind::Gep { ptr, index, .. } => {
                f(ptr);
                if let Some(index) = index {
                    f(index);
                }
            }
            InstKind::Call(call) => {
                for arg in &mut call.args {
                    f(arg);
                }
            }
            InstKind::Phi { incoming, .. } => {
                for (_, value) in incoming {
                    f(value);
                }
            }
            InstKind::Branch { cond, fused } => match fused {
                Some(icmp) => {
                    f(&mut icmp.lhs);
                    f(&mut icmp.rhs);
                }
                None => f(cond),
            },
            InstKind::Ret { value, .. } => {
                if let Some(value) = value {
                    f(value);
                }
            }
        }
    }

    pub fn uses(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.for_each_use(|u| out.push(u.to_string()));
        out
    }

    /// Apply a rename map to every operand (single level, no chasing).
    pub fn rename_uses(&mut self, map: &FxHashMap<String, String>) {
        if map.is_empty() {
            return;
        }
        self.for_each_use_mut(|u| {
            if let Some(new) = map.get(u) {
                *u = new.clone();
            }
        });
    }

    /// The type of the defined value, if any.
    pub fn result_ty(&self) -> Option<crate::common::types::IrType> {
        use crate::common::types::IrType;
        match &self.kind {
            InstKind::Bin { ty, .. } => Some(*ty),
            InstKind::Icmp { .. } => Some(IrType::I1),
            InstKind::Load { ty, .. } => Some(*ty),
            InstKind::Alloca { .. } | InstKind::Gep { .. } => Some(IrType::Ptr),
            InstKind::Call(call) => Some(call.ret_ty),
            InstKind::Phi { ty, .. } => Some(*ty),
            InstKind::Store { .. } | InstKind::Jump | InstKind::Branch { .. } | InstKind::Ret { .. } => None,
        }
    }

    pub fn is_phi(&self) -> bool {
        matches!(self.kind, InstKind::Phi { .. })
    }

    pub fn is_terminator(&self) -> bool {
        matches!(self.kind, InstKind::Jump | InstKind::Branch { .. } | InstKind::Ret { .. })
    }
}

#[derive(Debug, Clone)]
pub struct Block {
    pub name: String,
    pub insts: Vec<Inst>,
    pub predecessors: Vec<BlockId>,
    pub successors: Vec<BlockId>,
    pub live_in: FxHashSet<String>,
    pub unreachable: bool,
}

impl Block {
    pub fn new(name: impl Into<String>) -> Block {
        Block {
            name: name.into(),
            insts: Vec::new(),
            predecessors: Vec::new(),
            successors: Vec::new(),
            live_in: FxHashSet::default(),
            unreachable: false,
        }
    }

    pub fn terminator(&self) -> &Inst {
        let last = self.insts.last().expect("block has no terminator");
        debug_assert!(last.is_terminator() || matches!(last.kind, InstKind::Call(ref c) if c.tail_call));
        last
    }

    /// The leading phi run.
    pub fn phi_count(&self) -> usize {
        self.insts.iter().take_while(|inst| inst.is_phi()).count()
    }
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub ty: IrType,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub ret_ty: IrType,
    pub params: Vec<Param>,
    pub no_effect: bool,
    /// Block arena; `layout` gives the live blocks in order. Empty layout
    /// means this is a declaration.
    pub blocks: Vec<Block>,
    pub layout: Vec<BlockId>,
    pub is_leaf: bool,
    /// All names defined in the body, plus parameters and `ret_addr`.
    /// Populated by liveness analysis.
    pub var_defs: FxHashSet<String>,
    /// Edges SCCP proved dead; drained by unreachable-block elimination.
    pub edge_to_remove: FxHashSet<(BlockId, BlockId)>,
}

impl Function {
    pub fn new(name: impl Into<String>, ret_ty: IrType, params: Vec<Param>) -> Function {
        Function {
            name: name.into(),
            ret_ty,
            params,
            no_effect: false,
            blocks: Vec::new(),
            layout: Vec::new(),
            is_leaf: false,
            var_defs: FxHashSet::default(),
            edge_to_remove: FxHashSet::default(),
        }
    }

    pub fn declaration(sig: &FunctionSig) -> Function {
        let params = sig.params.iter().map(|&ty| Param { name: String::new(), ty }).collect();
        let mut f = Function::new(sig.name.clone(), sig.ret, params);
        f.no_effect = sig.no_effect;
        f
    }

    pub fn is_declaration(&self) -> bool {
        self.layout.is_empty()
    }

    pub fn entry(&self) -> BlockId {
        self.layout[0]
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }

    pub fn add_block(&mut self, block: Block) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(block);
        id
    }

    pub fn signature(&self) -> FunctionSig {
        FunctionSig {
            name: self.name.clone(),
            params: self.params.iter().map(|p| p.ty).collect(),
            ret: self.ret_ty,
            no_effect: self.no_effect,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GlobalVar {
    pub name: String,
    pub ty: IrType,
    pub init: i32,
}

#[derive(Debug, Clone)]
pub struct StrLit {
    pub name: String,
    /// Raw bytes, escapes resolved, without the trailing NUL.
    pub value: String,
}

#[derive(Debug)]
pub struct IrModule {
    pub classes: Vec<ClassLayout>,
    pub globals: Vec<GlobalVar>,
    pub strings: Vec<StrLit>,
    pub functions: Vec<Function>,
    pub renamer: Renamer,
}

impl IrModule {
    /// An empty module pre-seeded with the runtime's declarations and the
    /// internal array record type.
    pub fn new() -> IrModule {
        IrModule {
            classes: vec![ClassLayout::array_record()],
            globals: Vec::new(),
            strings: Vec::new(),
            functions: builtin_signatures().iter().map(Function::declaration).collect(),
            renamer: Renamer::new(),
        }
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn class(&self, name: &str) -> Option<&ClassLayout> {
        self.classes.iter().find(|c| c.name == name)
    }

    /// Run a pass over every function definition, with the renamer split
    /// out so the pass can mint names.
    pub fn for_each_definition(&mut self, mut pass: impl FnMut(&mut Function, &mut Renamer)) {
        let renamer = &mut self.renamer;
        for function in &mut self.functions {
            if !function.is_declaration() {
                pass(function, renamer);
            }
        }
    }
}

impl Default for IrModule {
    fn default() -> Self {
        IrModule::new()
    }
}

/// `%`-prefixed: a local SSA name.
pub fn is_local(name: &str) -> bool {
    name.starts_with('%')
}

/// `@`-prefixed: a global, function, or string literal.
pub fn is_global(name: &str) -> bool {
    name.starts_with('@')
}

/// Neither prefix: an immediate literal (including `undef`).
pub fn is_imm(name: &str) -> bool {
    !is_local(name) && !is_global(name)
}

pub fn is_zero(name: &str) -> bool {
    name == "0" || name == "false" || name == "null"
}

/// Parse an immediate token. Does not check the 12-bit range.
pub fn parse_imm(token: &str) -> i32 {
    match token {
        "true" => 1,
        "false" | "null" | UNDEF => 0,
        _ => token.parse::<i64>().expect("malformed immediate") as i32,
    }
}

/// Map a value name back to the stack slot it came from, for spill-slot
/// coalescing: `%a.val.2` → `%a.ptr`, `%a.val` → `%a.ptr`, `%a` → `%a.ptr`.
pub fn pointer_name_of(var: &str) -> String {
    match var.rfind(".val") {
        Some(pos) => format!("{}.ptr", &var[..pos]),
        None => format!("{}.ptr", var),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_classification() {
        assert!(is_local("%x"));
        assert!(is_global("@g"));
        assert!(is_imm("42"));
        assert!(is_imm("true"));
        assert!(is_imm(UNDEF));
        assert!(is_zero("null"));
        assert!(!is_zero("true"));
    }

    #[test]
    fn test_parse_imm() {
        assert_eq!(parse_imm("42"), 42);
        assert_eq!(parse_imm("-2048"), -2048);
        assert_eq!(parse_imm("true"), 1);
        assert_eq!(parse_imm("false"), 0);
        assert_eq!(parse_imm("null"), 0);
        assert_eq!(parse_imm(UNDEF), 0);
        assert_eq!(parse_imm("2147483647"), i32::MAX);
    }

    #[test]
    fn test_pointer_name_of() {
        assert_eq!(pointer_name_of("%a.val.2"), "%a.ptr");
        assert_eq!(pointer_name_of("%a.val"), "%a.ptr");
        assert_eq!(pointer_name_of("%a.val.b.val.3"), "%a.val.b.ptr");
        assert_eq!(pointer_name_of("%a"), "%a.ptr");
    }

    #[test]
    fn test_inst_defs_and_uses() {
        let inst = Inst::new(InstKind::Bin {
            dest: "%d".to_string(),
            op: BinOp::Add,
            ty: IrType::I32,
            lhs: "%a".to_string(),
            rhs: "%b".to_string(),
        });
        assert_eq!(inst.def(), Some("%d"));
        assert_eq!(inst.uses(), vec!["%a", "%b"]);

        let ret = Inst::new(InstKind::Ret { ty: IrType::I32, value: Some("%d".to_string()) });
        assert_eq!(ret.def(), None);
        assert_eq!(ret.uses(), vec![RET_ADDR, "%d"]);
    }

    #[test]
    fn test_tail_call_has_no_def() {
        let mut call = CallInst {
            dest: Some("%r".to_string()),
            callee: "@f".to_string(),
            ret_ty: IrType::I32,
            args: vec!["%x".to_string()],
            arg_tys: vec![IrType::I32],
            no_effect: false,
            tail_call: false,
            self_tail_call: false,
        };
        let inst = Inst::new(InstKind::Call(call.clone()));
        assert_eq!(inst.def(), Some("%r"));

        call.tail_call = true;
        let inst = Inst::new(InstKind::Call(call));
        assert_eq!(inst.def(), None);
        assert_eq!(inst.uses(), vec![RET_ADDR, "%x"]);
    }

    #[test]
    fn test_rename_uses() {
        let mut inst = Inst::new(InstKind::Store {
            ty: IrType::I32,
            addr: "%p".to_string(),
            src: "%v".to_string(),
        });
        let mut map = FxHashMap::default();
        map.insert("%v".to_string(), "%w".to_string());
        inst.rename_uses(&map);
        assert_eq!(inst.uses(), vec!["%p", "%w"]);
    }
}
