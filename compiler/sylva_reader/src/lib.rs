//! Lexer and s-expression reader for the Sylva compiler.
//!
//! Produces the [`Ast`] value tree the analysis pipeline consumes. The
//! reader is a thin collaborator: a `logos` lexer over a tiny token set
//! plus a recursive list reader. A unit aborts on its first error (the
//! driver continues with other units).

mod token;

use logos::Logos;

use sylva_ast::{Ast, ExprKind, NodeId, Span, StringInterner};
use sylva_diagnostic::{Diagnostic, ErrorCode};

use token::RawToken;

/// Read one source unit into an [`Ast`].
///
/// On success the returned arena has its top-level forms registered as
/// roots and every node numbered in pre-order. On failure the first
/// diagnostic of the unit is returned.
pub fn read_unit(source: &str, interner: &StringInterner) -> Result<Ast, Diagnostic> {
    let mut tokens = Vec::new();
    let mut lexer = RawToken::lexer(source);
    while let Some(result) = lexer.next() {
        let span = Span::from_range(lexer.span());
        match result {
            Ok(token) => tokens.push((token, span)),
            Err(()) => {
                return Err(Diagnostic::error(
                    ErrorCode::MalformedLiteral,
                    format!("unrecognized input `{}`", lexer.slice()),
                    span,
                ));
            }
        }
    }

    let mut reader = Reader {
        source,
        tokens,
        pos: 0,
        ast: Ast::new(),
        interner,
    };

    while !reader.at_eof() {
        let root = reader.read_value()?;
        reader.ast.push_root(root);
    }

    let mut ast = reader.ast;
    ast.number_positions();
    Ok(ast)
}

struct Reader<'a> {
    source: &'a str,
    tokens: Vec<(RawToken, Span)>,
    pos: usize,
    ast: Ast,
    interner: &'a StringInterner,
}

impl Reader<'_> {
    fn at_eof(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<(RawToken, Span)> {
        self.tokens.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<(RawToken, Span)> {
        let t = self.peek();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn slice(&self, span: Span) -> &str {
        &self.source[span.to_range()]
    }

    fn eof_span(&self) -> Span {
        let end = u32::try_from(self.source.len()).unwrap_or(u32::MAX);
        Span::point(end)
    }

    fn read_value(&mut self) -> Result<NodeId, Diagnostic> {
        let Some((token, span)) = self.bump() else {
            return Err(Diagnostic::error(
                ErrorCode::UnexpectedEof,
                "unexpected end of input",
                self.eof_span(),
            ));
        };

        match token {
            RawToken::LParen => self.read_list(span),
            RawToken::RParen => Err(Diagnostic::error(
                ErrorCode::UnbalancedDelimiter,
                "unexpected `)`",
                span,
            )),
            RawToken::Int => {
                let text = self.slice(span);
                let value: i64 = text.parse().map_err(|_| {
                    Diagnostic::error(
                        ErrorCode::MalformedLiteral,
                        format!("integer literal `{text}` out of range"),
                        span,
                    )
                })?;
                Ok(self.ast.alloc(ExprKind::Int(value), span))
            }
            RawToken::Float => {
                let text = self.slice(span);
                let value: f64 = text.parse().map_err(|_| {
                    Diagnostic::error(
                        ErrorCode::MalformedLiteral,
                        format!("malformed float literal `{text}`"),
                        span,
                    )
                })?;
                Ok(self.ast.alloc(ExprKind::Float(value), span))
            }
            RawToken::Char => {
                let value = parse_char(self.slice(span)).ok_or_else(|| {
                    Diagnostic::error(
                        ErrorCode::MalformedLiteral,
                        format!("malformed character literal `{}`", self.slice(span)),
                        span,
                    )
                })?;
                Ok(self.ast.alloc(ExprKind::Char(value), span))
            }
            RawToken::True => {
                let name = self.interner.intern("true");
                Ok(self.ast.alloc(ExprKind::Symbol(name), span))
            }
            RawToken::False => {
                let name = self.interner.intern("false");
                Ok(self.ast.alloc(ExprKind::Symbol(name), span))
            }
            RawToken::Symbol => {
                let name = self.interner.intern(self.slice(span));
                Ok(self.ast.alloc(ExprKind::Symbol(name), span))
            }
        }
    }

    fn read_list(&mut self, open: Span) -> Result<NodeId, Diagnostic> {
        let mut items = Vec::new();
        loop {
            match self.peek() {
                None => {
                    return Err(Diagnostic::error(
                        ErrorCode::UnbalancedDelimiter,
                        "unclosed `(`",
                        open,
                    )
                    .with_label(self.eof_span(), "input ends here"));
                }
                Some((RawToken::RParen, close)) => {
                    self.pos += 1;
                    let span = open.merge(close);
                    return Ok(self.ast.list(&items, span));
                }
                Some(_) => items.push(self.read_value()?),
            }
        }
    }
}

fn parse_char(text: &str) -> Option<char> {
    let body = text.strip_prefix("#\\")?;
    match body {
        "space" => Some(' '),
        "newline" => Some('\n'),
        "tab" => Some('\t'),
        _ => {
            let mut chars = body.chars();
            let c = chars.next()?;
            chars.next().is_none().then_some(c)
        }
    }
}
