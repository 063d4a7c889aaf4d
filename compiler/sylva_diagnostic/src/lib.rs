//! Diagnostic and error reporting for the Sylva compiler.
//!
//! Compile-time failures are [`Diagnostic`] values: a severity, an error
//! code, a message, and labeled source spans. Each source unit aborts on
//! its first error but other units continue, so a batch invocation
//! surfaces as many independent diagnostics as possible.
//!
//! Codegen-impossible states are not diagnostics — they are compiler bugs
//! and panic (see `sylva_codegen`).

mod diagnostic;
mod emitter;
mod error_code;

pub use diagnostic::{Diagnostic, Label, Severity};
pub use emitter::render;
pub use error_code::ErrorCode;
