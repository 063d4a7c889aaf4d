//! Raw token definition.
//!
//! The `RawToken` enum is the logos-derived tokenizer output. The surface
//! syntax is small: delimiters, numeric/character/boolean literals, and
//! symbols. Line comments start with `;`.

use logos::Logos;

/// Raw token from logos (before interning).
#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq)]
#[logos(skip r"[ \t\r\n]+")] // Skip whitespace
#[logos(skip r";[^\n]*")] // Skip line comments
pub(crate) enum RawToken {
    #[token("(")]
    LParen,

    #[token(")")]
    RParen,

    /// `#t` / `#f` — read as the symbols `true` / `false`.
    #[token("#t")]
    True,
    #[token("#f")]
    False,

    /// Character literal: `#\a`, `#\(`, or the named forms
    /// `#\space`, `#\newline`, `#\tab`.
    #[regex(r"#\\(space|newline|tab|[^\s])", priority = 4)]
    Char,

    #[regex(r"-?[0-9]+\.[0-9]+", priority = 4)]
    Float,

    #[regex(r"-?[0-9]+", priority = 4)]
    Int,

    /// Symbols: identifier characters plus the Lisp operator set.
    /// `:weak`-style annotations lex as ordinary symbols.
    #[regex(r"[A-Za-z0-9+\-*/<>=!?_.:&%^~]+", priority = 2)]
    Symbol,
}

#[cfg(test)]
mod tests {
    use super::*;
    use logos::Logos;

    fn lex(source: &str) -> Vec<RawToken> {
        RawToken::lexer(source).map(|t| t.expect("lex")).collect()
    }

    #[test]
    fn lexes_simple_form() {
        assert_eq!(
            lex("(+ 1 2.5)"),
            vec![
                RawToken::LParen,
                RawToken::Symbol,
                RawToken::Int,
                RawToken::Float,
                RawToken::RParen,
            ]
        );
    }

    #[test]
    fn negative_number_is_a_number_not_a_symbol() {
        assert_eq!(lex("-42"), vec![RawToken::Int]);
        assert_eq!(lex("-4.2"), vec![RawToken::Float]);
    }

    #[test]
    fn bare_minus_is_a_symbol() {
        assert_eq!(lex("-"), vec![RawToken::Symbol]);
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(lex("1 ; the rest is noise\n2"), vec![RawToken::Int, RawToken::Int]);
    }

    #[test]
    fn char_literals() {
        assert_eq!(lex(r"#\a #\space #\("), vec![RawToken::Char; 3]);
    }

    #[test]
    fn booleans() {
        assert_eq!(lex("#t #f"), vec![RawToken::True, RawToken::False]);
    }

    #[test]
    fn bang_and_question_symbols() {
        assert_eq!(lex("set! null? for-each"), vec![RawToken::Symbol; 3]);
    }
}
