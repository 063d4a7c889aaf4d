//! Sylva compiler CLI.
//!
//! Batch compilation to C99 + pthreads, with an optional native build
//! through the external `cc` toolchain.

use std::path::{Path, PathBuf};

use sylvac::{
    build_native, check_unit, compile_unit, init_tracing, read_source, write_output, UnitOutcome,
};

fn main() {
    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        return;
    }

    let command = &args[1];
    match command.as_str() {
        "compile" => {
            if args.len() < 3 {
                eprintln!("Usage: sylva compile <file.syl> [-o output.c]");
                std::process::exit(1);
            }
            let inputs = input_files(&args[2..]);
            let output = flag_value(&args[2..], "-o");
            compile_files(&inputs, output.as_deref());
        }
        "check" => {
            if args.len() < 3 {
                eprintln!("Usage: sylva check <file.syl>...");
                std::process::exit(1);
            }
            check_files(&input_files(&args[2..]));
        }
        "build" => {
            if args.len() < 3 {
                eprintln!("Usage: sylva build <file.syl> [-o executable]");
                std::process::exit(1);
            }
            let inputs = input_files(&args[2..]);
            let output = flag_value(&args[2..], "-o");
            build_files(&inputs, output.as_deref());
        }
        "parse" => {
            if args.len() < 3 {
                eprintln!("Usage: sylva parse <file.syl>");
                std::process::exit(1);
            }
            parse_file(Path::new(&args[2]));
        }
        "help" | "--help" | "-h" => print_usage(),
        "version" | "--version" | "-v" => {
            println!("Sylva Compiler {}", env!("CARGO_PKG_VERSION"));
        }
        _ => {
            // A bare .syl path is shorthand for `compile`.
            if Path::new(command)
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("syl"))
            {
                compile_files(&[PathBuf::from(command)], None);
            } else {
                eprintln!("Unknown command: {command}");
                eprintln!();
                print_usage();
                std::process::exit(1);
            }
        }
    }
}

fn print_usage() {
    println!("Sylva Compiler");
    println!();
    println!("Usage: sylva <command> [options]");
    println!();
    println!("Commands:");
    println!("  compile <file.syl>   Generate C code (-o output.c)");
    println!("  check <file.syl>...  Analyze only, no output");
    println!("  build <file.syl>     Compile and link with cc (-o executable)");
    println!("  parse <file.syl>     Read and display the value tree");
    println!("  help                 Show this help message");
    println!("  version              Show version information");
    println!();
    println!("Examples:");
    println!("  sylva compile main.syl -o main.c");
    println!("  sylva build main.syl -o main");
    println!("  sylva check lib.syl util.syl");
    println!("  sylva main.syl       (shorthand for 'compile')");
}

fn input_files(args: &[String]) -> Vec<PathBuf> {
    let mut inputs = Vec::new();
    let mut skip_next = false;
    for arg in args {
        if skip_next {
            skip_next = false;
            continue;
        }
        if arg == "-o" {
            skip_next = true;
            continue;
        }
        if !arg.starts_with('-') {
            inputs.push(PathBuf::from(arg));
        }
    }
    inputs
}

fn flag_value(args: &[String], flag: &str) -> Option<PathBuf> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
}

/// Compile each input independently; exit non-zero if any unit failed.
fn compile_files(inputs: &[PathBuf], output: Option<&Path>) {
    let mut failed = false;
    for input in inputs {
        let source = match read_source(input) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("{e}");
                failed = true;
                continue;
            }
        };
        match compile_unit(&source) {
            UnitOutcome::Code(code) => {
                let out_path = output
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| input.with_extension("c"));
                if let Err(e) = write_output(&out_path, &code) {
                    eprintln!("{e}");
                    failed = true;
                }
            }
            UnitOutcome::Failed(diag) => {
                let name = input.display().to_string();
                eprint!("{}", sylva_diagnostic::render(&diag, &name, &source));
                failed = true;
            }
        }
    }
    if failed {
        std::process::exit(1);
    }
}

fn check_files(inputs: &[PathBuf]) {
    let mut failed = false;
    for input in inputs {
        let source = match read_source(input) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("{e}");
                failed = true;
                continue;
            }
        };
        if let Some(diag) = check_unit(&source) {
            let name = input.display().to_string();
            eprint!("{}", sylva_diagnostic::render(&diag, &name, &source));
            failed = true;
        }
    }
    if failed {
        std::process::exit(1);
    }
}

fn build_files(inputs: &[PathBuf], output: Option<&Path>) {
    for input in inputs {
        let source = match read_source(input) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("{e}");
                std::process::exit(1);
            }
        };
        match compile_unit(&source) {
            UnitOutcome::Code(code) => {
                let c_path = input.with_extension("c");
                if let Err(e) = write_output(&c_path, &code) {
                    eprintln!("{e}");
                    std::process::exit(1);
                }
                let exe_path = output
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| input.with_extension(""));
                if let Err(e) = build_native(&c_path, &exe_path) {
                    eprintln!("{e}");
                    std::process::exit(1);
                }
            }
            UnitOutcome::Failed(diag) => {
                let name = input.display().to_string();
                eprint!("{}", sylva_diagnostic::render(&diag, &name, &source));
                std::process::exit(1);
            }
        }
    }
}

fn parse_file(path: &Path) {
    let source = match read_source(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    let interner = sylva_ast::StringInterner::new();
    match sylva_reader::read_unit(&source, &interner) {
        Ok(ast) => {
            for &root in ast.roots() {
                println!("{}", ast.display(root, &interner));
            }
        }
        Err(diag) => {
            let name = path.display().to_string();
            eprint!("{}", sylva_diagnostic::render(&diag, &name, &source));
            std::process::exit(1);
        }
    }
}
