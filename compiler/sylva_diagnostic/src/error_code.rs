//! Error code registry.
//!
//! Codes are grouped by phase: E1xxx reader, E2xxx resolution and shape,
//! E3xxx memory analysis. Codes are stable identifiers; messages may
//! evolve.

use std::fmt;

/// Stable error code attached to every diagnostic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Reader
    /// Unbalanced or unexpected delimiter.
    UnbalancedDelimiter,
    /// Malformed literal (bad number, bad character escape).
    MalformedLiteral,
    /// Unexpected end of input.
    UnexpectedEof,

    // Resolution / shape
    /// Reference to a symbol with no visible binding.
    UnboundSymbol,
    /// Call with the wrong number of arguments for a known definition.
    ArityMismatch,
    /// `deftype` field is not a `(name Type)` list or repeats a name.
    BadDeftypeField,
    /// `set!` target has no visible binding.
    SetUnknownName,
    /// Malformed special form (missing binding list, empty body, ...).
    MalformedForm,

    // Memory analysis
    /// A reference would escape from an outer region into an inner one.
    EscapeViolatesRegion,
    /// A borrow would outlive the scope that created it.
    BorrowOutlivesScope,

    // Internal
    /// Analysis produced inconsistent tables (compiler bug surfaced as a
    /// diagnostic by `validate()` before codegen panics on it).
    InternalInvariant,
}

impl ErrorCode {
    /// The stable `Ennnn` string for this code.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::UnbalancedDelimiter => "E1001",
            ErrorCode::MalformedLiteral => "E1002",
            ErrorCode::UnexpectedEof => "E1003",
            ErrorCode::UnboundSymbol => "E2001",
            ErrorCode::ArityMismatch => "E2002",
            ErrorCode::BadDeftypeField => "E2003",
            ErrorCode::SetUnknownName => "E2004",
            ErrorCode::MalformedForm => "E2005",
            ErrorCode::EscapeViolatesRegion => "E3001",
            ErrorCode::BorrowOutlivesScope => "E3002",
            ErrorCode::InternalInvariant => "E9001",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_unique() {
        let all = [
            ErrorCode::UnbalancedDelimiter,
            ErrorCode::MalformedLiteral,
            ErrorCode::UnexpectedEof,
            ErrorCode::UnboundSymbol,
            ErrorCode::ArityMismatch,
            ErrorCode::BadDeftypeField,
            ErrorCode::SetUnknownName,
            ErrorCode::MalformedForm,
            ErrorCode::EscapeViolatesRegion,
            ErrorCode::BorrowOutlivesScope,
            ErrorCode::InternalInvariant,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a.as_str(), b.as_str());
            }
        }
    }
}
