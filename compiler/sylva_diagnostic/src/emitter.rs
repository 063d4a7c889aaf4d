//! Terminal rendering for diagnostics.
//!
//! Renders a diagnostic against its source text:
//!
//! ```text
//! error[E2001]: unbound symbol `y`
//!   --> main.syl:3:10
//!    |
//!  3 | (print (+ x y))
//!    |              ^ not defined in this scope
//! ```
//!
//! Rendering is plain text (no color control sequences) so output is
//! stable under test capture and redirection.

use std::fmt::Write as _;

use sylva_ast::Span;

use crate::{Diagnostic, Label};

/// Render a diagnostic against its source unit.
///
/// `file` is the display name of the unit; `source` its full text.
pub fn render(diag: &Diagnostic, file: &str, source: &str) -> String {
    let mut out = String::with_capacity(256);

    let _ = writeln!(out, "{}[{}]: {}", diag.severity, diag.code, diag.message);

    let (line, col) = line_col(source, diag.span.start());
    let _ = writeln!(out, "  --> {file}:{line}:{col}");

    render_snippet(&mut out, source, diag.span, None);
    for label in &diag.labels {
        if label.span != diag.span {
            render_snippet(&mut out, source, label.span, Some(&label.message));
        } else if !label.message.is_empty() {
            // Same span as the primary: annotate the primary underline.
            annotate_last_underline(&mut out, &label.message);
        }
    }

    for note in &diag.notes {
        let _ = writeln!(out, "   = note: {note}");
    }

    out
}

/// 1-based line and column of a byte offset.
fn line_col(source: &str, offset: u32) -> (usize, usize) {
    let offset = (offset as usize).min(source.len());
    let mut line = 1;
    let mut line_start = 0;
    for (i, b) in source.bytes().enumerate().take(offset) {
        if b == b'\n' {
            line += 1;
            line_start = i + 1;
        }
    }
    (line, offset - line_start + 1)
}

fn render_snippet(out: &mut String, source: &str, span: Span, label: Option<&str>) {
    let (line_no, col) = line_col(source, span.start());
    let line_text = source.lines().nth(line_no - 1).unwrap_or("");
    let width = span.len().max(1) as usize;
    let width = width.min(line_text.len().saturating_sub(col - 1).max(1));

    let gutter = line_no.to_string();
    let pad = " ".repeat(gutter.len());
    let _ = writeln!(out, " {pad} |");
    let _ = writeln!(out, " {gutter} | {line_text}");
    let underline = format!("{}{}", " ".repeat(col - 1), "^".repeat(width));
    match label {
        Some(msg) if !msg.is_empty() => {
            let _ = writeln!(out, " {pad} | {underline} {msg}");
        }
        _ => {
            let _ = writeln!(out, " {pad} | {underline}");
        }
    }
}

/// Append a label message to the most recent underline line.
fn annotate_last_underline(out: &mut String, message: &str) {
    if out.ends_with('\n') {
        out.pop();
    }
    let _ = writeln!(out, " {message}");
}

/// Render only the first error of a unit (units abort on first error) with
/// the remaining count summarized.
pub fn render_unit(diags: &[Diagnostic], file: &str, source: &str) -> String {
    let mut out = String::new();
    if let Some(first) = diags.first() {
        out.push_str(&render(first, file, source));
        if diags.len() > 1 {
            let _ = writeln!(out, "   = note: {} more diagnostic(s) in this unit", diags.len() - 1);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorCode;
    use pretty_assertions::assert_eq;

    #[test]
    fn renders_code_location_and_underline() {
        let source = "(define (f x)\n  (+ x y))\n";
        let y_at = source.find('y').unwrap() as u32;
        let diag = Diagnostic::error(
            ErrorCode::UnboundSymbol,
            "unbound symbol `y`",
            Span::new(y_at, y_at + 1),
        );
        let rendered = render(&diag, "main.syl", source);
        assert!(rendered.contains("error[E2001]: unbound symbol `y`"));
        assert!(rendered.contains("--> main.syl:2:8"));
        assert!(rendered.contains("(+ x y)"));
        assert!(rendered.contains('^'));
    }

    #[test]
    fn line_col_is_one_based() {
        assert_eq!(line_col("abc", 0), (1, 1));
        assert_eq!(line_col("a\nbc", 2), (2, 1));
        assert_eq!(line_col("a\nbc", 3), (2, 2));
    }
}
