//! The Sylva compiler driver library.
//!
//! Pure batch compilation: source text in, C source out. Each source
//! file is an independent compilation unit — a unit aborts on its first
//! diagnostic, other units continue, so one invocation surfaces as many
//! independent errors as possible.

mod tracing_setup;

use std::path::{Path, PathBuf};
use std::process::Command;

use sylva_ast::StringInterner;
use sylva_codegen::CCodegen;
use sylva_diagnostic::Diagnostic;

pub use tracing_setup::init_tracing;

/// Driver-level failures (I/O and toolchain, not user diagnostics).
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("cannot read `{path}`: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot write `{path}`: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("no C compiler found (tried `cc`)")]
    NoCc,
    #[error("C compiler failed with status {status}")]
    CcFailed { status: std::process::ExitStatus },
}

/// Outcome of compiling one unit.
pub enum UnitOutcome {
    /// Generated C source.
    Code(String),
    /// The unit's first diagnostic, rendered against its source.
    Failed(Box<Diagnostic>),
}

/// Compile one source unit to C.
pub fn compile_unit(source: &str) -> UnitOutcome {
    let interner = StringInterner::new();
    let ast = match sylva_reader::read_unit(source, &interner) {
        Ok(ast) => ast,
        Err(diag) => return UnitOutcome::Failed(Box::new(diag)),
    };
    let unit = match sylva_analysis::analyze_unit(&ast, &interner) {
        Ok(unit) => unit,
        Err(diag) => return UnitOutcome::Failed(Box::new(diag)),
    };
    let result = CCodegen::generate(&ast, &interner, &unit);
    // Codegen failures are compiler bugs and panic before this point;
    // a non-success result without a panic still aborts loudly.
    assert!(
        result.success,
        "internal error: codegen failed after clean analysis: {:?}",
        result.errors
    );
    UnitOutcome::Code(result.code)
}

/// Check one source unit (analysis only, no output).
pub fn check_unit(source: &str) -> Option<Box<Diagnostic>> {
    let interner = StringInterner::new();
    let ast = match sylva_reader::read_unit(source, &interner) {
        Ok(ast) => ast,
        Err(diag) => return Some(Box::new(diag)),
    };
    match sylva_analysis::analyze_unit(&ast, &interner) {
        Ok(_) => None,
        Err(diag) => Some(Box::new(diag)),
    }
}

/// Read a source file.
pub fn read_source(path: &Path) -> Result<String, DriverError> {
    std::fs::read_to_string(path).map_err(|source| DriverError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Write generated C to a file.
pub fn write_output(path: &Path, code: &str) -> Result<(), DriverError> {
    std::fs::write(path, code).map_err(|source| DriverError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Build a native executable from generated C via the external `cc`.
pub fn build_native(c_path: &Path, out_path: &Path) -> Result<(), DriverError> {
    let status = Command::new("cc")
        .arg("-std=c99")
        .arg("-O2")
        .arg("-pthread")
        .arg(c_path)
        .arg("-o")
        .arg(out_path)
        .arg("-lpthread")
        .status()
        .map_err(|_| DriverError::NoCc)?;
    if !status.success() {
        return Err(DriverError::CcFailed { status });
    }
    Ok(())
}
