//! C99 code generation backend for the Sylva compiler.
//!
//! Lowers an analyzed unit to a single C translation unit that carries
//! its own runtime: tagged immediates, in-place generational references,
//! the stable slot pool, arenas, SCC collection, deferred decrements,
//! channels, atoms, threads, and setjmp/longjmp unwinding.
//!
//! # Architecture
//!
//! ```text
//! Ast + AnalyzedUnit
//!        ↓
//!    CCodegen       (lower annotated AST to C, gated by the analysis tables)
//!        ↓
//!   CodegenResult   (C source + any errors)
//! ```
//!
//! Every memory decision is read from the analysis context — allocation
//! site, free points, elision classes, reuse candidates, tethers, thread
//! locality. An inconsistency between tables at this stage is a compiler
//! bug and panics; user-level failures were already diagnosed upstream.

pub mod c;
mod context;

pub use c::CCodegen;
pub use context::CodegenContext;

/// Result of code generation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct CodegenResult {
    /// Generated C code (empty if errors occurred).
    pub code: String,
    /// Errors encountered during codegen.
    pub errors: Vec<CodegenError>,
    /// Whether codegen succeeded.
    pub success: bool,
}

impl CodegenResult {
    /// Create a successful result with generated code.
    pub fn success(code: String) -> Self {
        Self {
            code,
            errors: Vec::new(),
            success: true,
        }
    }

    /// Create an error result.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: String::new(),
            errors: vec![CodegenError {
                message: message.into(),
            }],
            success: false,
        }
    }

    /// Check if codegen failed.
    pub fn has_errors(&self) -> bool {
        !self.success || !self.errors.is_empty()
    }
}

/// A code generation error.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CodegenError {
    pub message: String,
}

impl std::fmt::Display for CodegenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CodegenError {}
