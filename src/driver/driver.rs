//! The compiler driver: input, pass pipeline, output.
//!
//! The front end hands over a typed IR module in the textual form of
//! `ir::parser`; everything from there to the final assembly happens here.
//! The runtime library blob is appended verbatim to the emitted assembly.

use std::io::Read;
use std::path::Path;

use tracing::debug;

use crate::backend::builder::build_module;
use crate::common::error::CompileError;
use crate::ir::ir::IrModule;
use crate::ir::parser::parse_module;
use crate::ir::printer::module_text;
use crate::passes::{run_passes, OptLevel};

/// The runtime library: `malloc`, array constructors, string primitives
/// and I/O. Shipped as data and appended unchanged.
const RUNTIME: &str = include_str!("../../runtime/builtin.s");

pub struct Options {
    /// Input path; `None` or `-` reads stdin.
    pub input: Option<String>,
    /// Output path; `-` writes stdout.
    pub output: String,
    pub opt_level: OptLevel,
    pub emit_llvm: bool,
    pub syntax_only: bool,
    pub dump_ir: bool,
    pub dump_asm: bool,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            input: None,
            output: "a.s".to_string(),
            opt_level: OptLevel::O1,
            emit_llvm: false,
            syntax_only: false,
            dump_ir: false,
            dump_asm: false,
        }
    }
}

pub struct Driver {
    pub options: Options,
}

impl Driver {
    pub fn new(options: Options) -> Driver {
        Driver { options }
    }

    pub fn run(&self) -> Result<(), CompileError> {
        let source = self.read_input()?;
        let mut module = parse_module(&source)?;
        debug!(functions = module.functions.len(), "module parsed");
        if self.options.syntax_only {
            return Ok(());
        }

        self.compile(&mut module)
    }

    fn compile(&self, module: &mut IrModule) -> Result<(), CompileError> {
        let dump_ir = self.options.dump_ir;
        let mut dump_error = None;
        run_passes(module, self.options.opt_level, |pass, module| {
            if dump_ir && dump_error.is_none() {
                if let Err(e) = write_file(
                    &format!("dumps/ir-after-{}.ll", pass),
                    &module_text(module),
                ) {
                    dump_error = Some(e);
                }
            }
        });
        if let Some(e) = dump_error {
            return Err(e);
        }

        if self.options.emit_llvm {
            return self.write_output(&module_text(module));
        }

        let mut asm = build_module(module);
        asm.builtin_functions = RUNTIME.to_string();
        let text = asm.text();
        if self.options.dump_asm {
            write_file("dumps/final.s", &text)?;
        }
        self.write_output(&text)
    }

    fn read_input(&self) -> Result<String, CompileError> {
        match self.options.input.as_deref() {
            None | Some("-") => {
                let mut source = String::new();
                std::io::stdin()
                    .read_to_string(&mut source)
                    .map_err(|e| CompileError::Read { path: "<stdin>".to_string(), source: e })?;
                Ok(source)
            }
            Some(path) => std::fs::read_to_string(path)
                .map_err(|e| CompileError::Read { path: path.to_string(), source: e }),
        }
    }

    fn write_output(&self, text: &str) -> Result<(), CompileError> {
        if self.options.output == "-" {
            print!("{}", text);
            Ok(())
        } else {
            write_file(&self.options.output, text)
        }
    }
}

fn write_file(path: &str, text: &str) -> Result<(), CompileError> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CompileError::Write { path: path.to_string(), source: e })?;
        }
    }
    std::fs::write(path, text).map_err(|e| CompileError::Write { path: path.to_string(), source: e })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO: &str = "\
@.str = private unnamed_addr constant [6 x i8] c\"hello\\00\"
define i32 @main() {
entry:
  call void @println(ptr @.str)
  ret i32 0
}
";

    fn driver_for(dir: &tempfile::TempDir, source: &str, options: impl FnOnce(&mut Options)) -> Driver {
        let input = dir.path().join("input.ll");
        std::fs::write(&input, source).unwrap();
        let mut opts = Options {
            input: Some(input.to_string_lossy().into_owned()),
            output: dir.path().join("out.s").to_string_lossy().into_owned(),
            ..Options::default()
        };
        options(&mut opts);
        Driver::new(opts)
    }

    #[test]
    fn test_end_to_end_assembly_file() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver_for(&dir, HELLO, |_| {});
        driver.run().unwrap();
        let text = std::fs::read_to_string(dir.path().join("out.s")).unwrap();
        assert!(text.contains(".globl main"));
        assert!(text.contains("call println"));
        assert!(text.contains(".asciz \"hello\""));
        // The runtime blob is appended.
        assert!(text.contains("# runtime library"));
        assert!(text.contains("string.add:"));
    }

    #[test]
    fn test_emit_llvm() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver_for(&dir, HELLO, |o| o.emit_llvm = true);
        driver.run().unwrap();
        let text = std::fs::read_to_string(dir.path().join("out.s")).unwrap();
        assert!(text.contains("define i32 @main()"));
        assert!(!text.contains(".globl"));
    }

    #[test]
    fn test_syntax_only_stops_early() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver_for(&dir, HELLO, |o| o.syntax_only = true);
        driver.run().unwrap();
        assert!(!dir.path().join("out.s").exists());
    }

    #[test]
    fn test_parse_error_is_reported_with_line() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver_for(&dir, "define i32 @main() {\nentry:\n  frobnicate\n}\n", |_| {});
        let err = driver.run().unwrap_err();
        assert!(err.to_string().contains("line 3"));
    }
}
