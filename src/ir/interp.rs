//! A small reference interpreter for the IR.
//!
//! Executes a module well enough to check observable behaviour of the
//! middle-end passes: a pass is correct when the program prints the same
//! output before and after it runs. Supports the pre-MIR instruction set
//! plus the runtime builtins; not a performance tool.

use crate::common::fx_hash::FxHashMap;
use crate::common::types::ARRAY_RECORD;
use crate::ir::ir::*;

const STEP_LIMIT: usize = 1_000_000;

pub struct Interp<'m> {
    module: &'m IrModule,
    memory: FxHashMap<i32, i32>,
    heap_strings: FxHashMap<i32, String>,
    symbols: FxHashMap<String, i32>,
    next_addr: i32,
    steps: usize,
    pub output: String,
    pub input_ints: Vec<i32>,
    pub input_strings: Vec<String>,
}

impl<'m> Interp<'m> {
    pub fn new(module: &'m IrModule) -> Interp<'m> {
        let mut interp = Interp {
            module,
            memory: FxHashMap::default(),
            heap_strings: FxHashMap::default(),
            symbols: FxHashMap::default(),
            next_addr: 0x1000,
            steps: 0,
            output: String::new(),
            input_ints: Vec::new(),
            input_strings: Vec::new(),
        };
        for global in &module.globals {
            let addr = interp.alloc(4);
            interp.memory.insert(addr, global.init);
            interp.symbols.insert(global.name.clone(), addr);
        }
        for s in &module.strings {
            let addr = interp.alloc(s.value.len() as i32 + 1);
            interp.heap_strings.insert(addr, s.value.clone());
            interp.symbols.insert(s.name.clone(), addr);
        }
        interp
    }

    /// Run `@main`; returns its exit value.
    pub fn run(&mut self) -> i32 {
        let module = self.module;
        let main = module.function("@main").expect("no @main");
        self.call_function(main, &[]).unwrap_or(0)
    }

    fn alloc(&mut self, bytes: i32) -> i32 {
        let addr = self.next_addr;
        self.next_addr += (bytes + 3) & !3;
        addr
    }

    fn call_function(&mut self, func: &'m Function, args: &[i32]) -> Option<i32> {
        assert!(!func.is_declaration(), "interpreting declaration {}", func.name);
        let mut env: FxHashMap<String, i32> = FxHashMap::default();
        for (param, &value) in func.params.iter().zip(args) {
            env.insert(param.name.clone(), value);
        }

        let mut current = func.entry();
        let mut previous: Option<BlockId> = None;
        loop {
            self.steps += 1;
            assert!(self.steps < STEP_LIMIT, "interpreter ran away");
            let block = func.block(current);

            // Phis read their incoming values simultaneously.
            if let Some(pred) = previous {
                let mut updates = Vec::new();
                for inst in block.insts.iter().take_while(|i| i.is_phi()) {
                    let InstKind::Phi { dest, incoming, .. } = &inst.kind else { unreachable!() };
                    let (_, value) = incoming
                        .iter()
                        .find(|(p, _)| *p == pred)
                        .unwrap_or_else(|| panic!("phi {} has no incoming for {}", dest, func.block(pred).name));
                    updates.push((dest.clone(), self.eval(value, &env)));
                }
                env.extend(updates);
            }

            for inst in block.insts.iter().skip(block.phi_count()) {
                match &inst.kind {
                    InstKind::Bin { dest, op, lhs, rhs, .. } => {
                        let value = eval_binop(*op, self.eval(lhs, &env), self.eval(rhs, &env));
                        env.insert(dest.clone(), value);
                    }
                    InstKind::Icmp { dest, op, lhs, rhs, .. } => {
                        let value = eval_icmp(*op, self.eval(lhs, &env), self.eval(rhs, &env));
                        env.insert(dest.clone(), value);
                    }
                    InstKind::Alloca { dest, .. } => {
                        let addr = self.alloc(4);
                        env.insert(dest.clone(), addr);
                    }
                    InstKind::Load { dest, addr, .. } => {
                        let addr = self.eval(addr, &env);
                        let value = self.memory.get(&addr).copied().unwrap_or(0);
                        env.insert(dest.clone(), value);
                    }
                    InstKind::Store { addr, src, .. } => {
                        let addr = self.eval(addr, &env);
                        let value = self.eval(src, &env);
                        self.memory.insert(addr, value);
                    }
                    InstKind::Gep { dest, ty_name, ptr, index, member } => {
                        let base = self.eval(ptr, &env);
                        let scale = elem_size(ty_name);
                        let index = index.as_deref().map_or(0, |i| self.eval(i, &env));
                        let offset = member.map_or(0, |m| m as i32 * 4);
                        env.insert(dest.clone(), base + index * scale + offset);
                    }
                    InstKind::Call(call) => {
                        let args: Vec<i32> = call.args.iter().map(|a| self.eval(a, &env)).collect();
                        let result = self.dispatch_call(&call.callee, &args);
                        if let Some(dest) = &call.dest {
                            env.insert(dest.clone(), result.unwrap_or(0));
                        }
                        if call.tail_call {
                            return result;
                        }
                    }
                    InstKind::Jump => {}
                    InstKind::Branch { cond, fused } => {
                        let taken = match fused {
                            Some(icmp) => {
                                eval_icmp(icmp.op, self.eval(&icmp.lhs, &env), self.eval(&icmp.rhs, &env)) != 0
                            }
                            None => self.eval(cond, &env) != 0,
                        };
                        previous = Some(current);
                        current = if taken { block.successors[0] } else { block.successors[1] };
                    }
                    InstKind::Ret { value, .. } => {
                        return value.as_ref().map(|v| self.eval(v, &env));
                    }
                    InstKind::Phi { .. } => panic!("phi after non-phi in {}", block.name),
                }
            }

            if matches!(block.terminator().kind, InstKind::Jump) {
                previous = Some(current);
                current = block.successors[0];
            } else if matches!(block.terminator().kind, InstKind::Branch { .. }) {
                // successor already selected above
            } else {
                panic!("block {} fell through", block.name);
            }
        }
    }

    fn eval(&self, token: &str, env: &FxHashMap<String, i32>) -> i32 {
        if is_local(token) {
            // A read of a never-written promoted slot is `undef`; zero it.
            env.get(token).copied().unwrap_or(0)
        } else if is_global(token) {
            *self.symbols.get(token).unwrap_or_else(|| panic!("unknown symbol {}", token))
        } else {
            parse_imm(token)
        }
    }

    fn string_at(&self, addr: i32) -> String {
        self.heap_strings.get(&addr).cloned().unwrap_or_default()
    }

    fn new_string(&mut self, value: String) -> i32 {
        let addr = self.alloc(value.len() as i32 + 1);
        self.heap_strings.insert(addr, value);
        addr
    }

    fn new_array(&mut self, elem_bytes: i32, count: i32) -> i32 {
        let base = self.alloc(count * elem_bytes + 4) + 4;
        self.memory.insert(base - 4, count);
        base
    }

    fn new_nd_array(&mut self, elem_bytes: i32, extents: &[i32]) -> i32 {
        if extents.len() == 1 {
            return self.new_array(elem_bytes, extents[0]);
        }
        // Outer dimensions are arrays of {ptr, i32} records.
        let outer = self.new_array(8, extents[0]);
        for i in 0..extents[0] {
            let inner = self.new_nd_array(elem_bytes, &extents[1..]);
            self.memory.insert(outer + i * 8, inner);
            self.memory.insert(outer + i * 8 + 4, extents[1]);
        }
        outer
    }

    fn dispatch_call(&mut self, callee: &str, args: &[i32]) -> Option<i32> {
        let module = self.module;
        if let Some(func) = module.function(callee) {
            if !func.is_declaration() {
                return self.call_function(func, args);
            }
        }
        let result = match callee {
            "@malloc" => self.alloc(args[0]),
            "@print" => {
                let s = self.string_at(args[0]);
                self.output.push_str(&s);
                return None;
            }
            "@println" => {
                let s = self.string_at(args[0]);
                self.output.push_str(&s);
                self.output.push('\n');
                return None;
            }
            "@printInt" => {
                self.output.push_str(&args[0].to_string());
                return None;
            }
            "@printlnInt" => {
                self.output.push_str(&args[0].to_string());
                self.output.push('\n');
                return None;
            }
            "@getInt" => self.input_ints.remove(0),
            "@getString" => {
                let s = self.input_strings.remove(0);
                self.new_string(s)
            }
            "@toString" => self.new_string(args[0].to_string()),
            "@string.add" => {
                let s = self.string_at(args[0]) + &self.string_at(args[1]);
                self.new_string(s)
            }
            "@string.eq" => (self.string_at(args[0]) == self.string_at(args[1])) as i32,
            "@string.ne" => (self.string_at(args[0]) != self.string_at(args[1])) as i32,
            "@string.lt" => (self.string_at(args[0]) < self.string_at(args[1])) as i32,
            "@string.le" => (self.string_at(args[0]) <= self.string_at(args[1])) as i32,
            "@string.gt" => (self.string_at(args[0]) > self.string_at(args[1])) as i32,
            "@string.ge" => (self.string_at(args[0]) >= self.string_at(args[1])) as i32,
            "@string.length" => self.string_at(args[0]).len() as i32,
            "@string.substring" => {
                let s = self.string_at(args[0]);
                let sub = s[args[1] as usize..args[2] as usize].to_string();
                self.new_string(sub)
            }
            "@string.parseInt" => {
                let s = self.string_at(args[0]);
                let digits: String =
                    s.chars().take_while(|c| c.is_ascii_digit() || *c == '-').collect();
                digits.parse().unwrap_or(0)
            }
            "@string.ord" => self.string_at(args[0]).as_bytes()[args[1] as usize] as i32,
            _ => {
                if let Some(extents) = array_ctor_extents(callee, args) {
                    let elem_bytes = if callee.contains("_bool_") { 1 } else { 4 };
                    self.new_nd_array(elem_bytes, &extents)
                } else {
                    panic!("interpreter: unknown builtin {}", callee)
                }
            }
        };
        Some(result)
    }
}

fn array_ctor_extents(callee: &str, args: &[i32]) -> Option<Vec<i32>> {
    crate::common::types::array_ctor_signature(callee).map(|_| args.to_vec())
}

fn elem_size(ty_name: &str) -> i32 {
    match ty_name {
        ARRAY_RECORD => 8,
        "i1" => 1,
        _ => 4,
    }
}

fn eval_binop(op: BinOp, lhs: i32, rhs: i32) -> i32 {
    match op {
        BinOp::Add => lhs.wrapping_add(rhs),
        BinOp::Sub => lhs.wrapping_sub(rhs),
        BinOp::Mul => lhs.wrapping_mul(rhs),
        BinOp::Sdiv => {
            if rhs == 0 {
                0
            } else {
                lhs.wrapping_div(rhs)
            }
        }
        BinOp::Srem => {
            if rhs == 0 {
                0
            } else {
                lhs.wrapping_rem(rhs)
            }
        }
        BinOp::Shl => lhs.wrapping_shl(rhs as u32 & 0x1f),
        BinOp::Ashr => lhs.wrapping_shr(rhs as u32 & 0x1f),
        BinOp::And => lhs & rhs,
        BinOp::Or => lhs | rhs,
        BinOp::Xor => lhs ^ rhs,
        BinOp::Smulh => ((lhs as i64 * rhs as i64) >> 32) as i32,
    }
}

fn eval_icmp(op: IcmpOp, lhs: i32, rhs: i32) -> i32 {
    let result = match op {
        IcmpOp::Eq => lhs == rhs,
        IcmpOp::Ne => lhs != rhs,
        IcmpOp::Slt => lhs < rhs,
        IcmpOp::Sgt => lhs > rhs,
        IcmpOp::Sle => lhs <= rhs,
        IcmpOp::Sge => lhs >= rhs,
    };
    result as i32
}

/// Convenience for tests: run `@main` and return (exit value, stdout).
pub fn run_main(module: &IrModule) -> (i32, String) {
    let mut interp = Interp::new(module);
    let exit = interp.run();
    (exit, interp.output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parser::parse_module;

    #[test]
    fn test_loop_sum_runs() {
        let src = "\
define i32 @main() {
entry:
  br label %cond
cond:
  %i = phi i32 [0, %entry], [%i.next, %body]
  %s = phi i32 [0, %entry], [%s.next, %body]
  %c = icmp sle i32 %i, 10
  br i1 %c, label %body, label %done
body:
  %s.next = add i32 %s, %i
  %i.next = add i32 %i, 1
  br label %cond
done:
  call void @printInt(i32 %s)
  ret i32 0
}
";
        let module = parse_module(src).unwrap();
        let (exit, output) = run_main(&module);
        assert_eq!(exit, 0);
        assert_eq!(output, "55");
    }

    #[test]
    fn test_fib_recursion() {
        let src = "\
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
        let module = parse_module(src).unwrap();
        assert_eq!(run_main(&module).1, "55");
    }

    #[test]
    fn test_array_and_class_memory() {
        let src = "\
%class.P = type {i32, i32}
define i32 @main() {
entry:
  %a = call ptr @__new_int_1d_array__(i32 5)
  %e4 = getelementptr inbounds i32, ptr %a, i32 4
  store i32 16, ptr %e4
  %v = load i32, ptr %e4
  %p = call ptr @malloc(i32 8)
  %x = getelementptr inbounds %class.P, ptr %p, i32 0, i32 0
  %y = getelementptr inbounds %class.P, ptr %p, i32 0, i32 1
  store i32 3, ptr %x
  store i32 4, ptr %y
  %xv = load i32, ptr %x
  %yv = load i32, ptr %y
  %xx = mul i32 %xv, %xv
  %yy = mul i32 %yv, %yv
  %sum = add i32 %xx, %yy
  %t = add i32 %sum, %v
  call void @printInt(i32 %t)
  ret i32 0
}
";
        let module = parse_module(src).unwrap();
        assert_eq!(run_main(&module).1, "41");
    }

    #[test]
    fn test_string_builtins() {
        let src = "\
@.str = private unnamed_addr constant [3 x i8] c\"ab\\00\"
@.str.2 = private unnamed_addr constant [3 x i8] c\"cd\\00\"
define i32 @main() {
entry:
  %s = call ptr @string.add(ptr @.str, ptr @.str.2)
  call void @println(ptr %s)
  %n = call i32 @string.length(ptr %s)
  call void @printInt(i32 %n)
  ret i32 0
}
";
        let module = parse_module(src).unwrap();
        assert_eq!(run_main(&module).1, "abcd\n4");
    }
}
