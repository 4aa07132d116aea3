use mxc::driver::{Driver, Options};
use mxc::passes::OptLevel;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let mut options = Options::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-o" => {
                i += 1;
                if i < args.len() {
                    options.output = args[i].clone();
                } else {
                    eprintln!("error: -o requires an argument");
                    std::process::exit(1);
                }
            }
            "-O0" => options.opt_level = OptLevel::O0,
            "-O1" => options.opt_level = OptLevel::O1,
            "-O2" => options.opt_level = OptLevel::O2,
            "-O" => {
                i += 1;
                match args.get(i).and_then(|l| OptLevel::from_str(l)) {
                    Some(level) => options.opt_level = level,
                    None => {
                        eprintln!("error: -O takes one of O0, O1, O2");
                        std::process::exit(1);
                    }
                }
            }
            "--emit-llvm" => options.emit_llvm = true,
            "--syntax-only" => options.syntax_only = true,
            "--dump-ir" => options.dump_ir = true,
            "--dump-asm" => options.dump_asm = true,
            arg if arg.starts_with('-') && arg != "-" => {
                eprintln!("error: unknown flag: {}", arg);
                std::process::exit(1);
            }
            _ => {
                if options.input.is_some() {
                    eprintln!("error: multiple input files");
                    std::process::exit(1);
                }
                options.input = Some(args[i].clone());
            }
        }
        i += 1;
    }

    match Driver::new(options).run() {
        Ok(()) => {}
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    }
}
