//! Rendering nodes back to s-expression text.
//!
//! Used by `sylva parse` and by diagnostics that quote source forms.

use std::fmt;

use crate::{Ast, ExprKind, NodeId, StringInterner};

/// Displayable view of one node.
pub struct AstDisplay<'a> {
    ast: &'a Ast,
    interner: &'a StringInterner,
    id: NodeId,
}

impl Ast {
    /// Render a node as s-expression text.
    pub fn display<'a>(&'a self, id: NodeId, interner: &'a StringInterner) -> AstDisplay<'a> {
        AstDisplay {
            ast: self,
            interner,
            id,
        }
    }
}

impl fmt::Display for AstDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_node(f, self.ast, self.interner, self.id)
    }
}

fn write_node(
    f: &mut fmt::Formatter<'_>,
    ast: &Ast,
    interner: &StringInterner,
    id: NodeId,
) -> fmt::Result {
    match ast.kind(id) {
        ExprKind::Int(v) => write!(f, "{v}"),
        ExprKind::Float(v) => {
            // Keep floats re-readable: always show a fractional part.
            if v.fract() == 0.0 && v.is_finite() {
                write!(f, "{v:.1}")
            } else {
                write!(f, "{v}")
            }
        }
        ExprKind::Char(c) => write!(f, "#\\{c}"),
        ExprKind::Symbol(name) => write!(f, "{}", interner.lookup(name)),
        ExprKind::Nil => write!(f, "()"),
        ExprKind::Cell { head, tail } => {
            write!(f, "(")?;
            write_node(f, ast, interner, head)?;
            let mut cur = tail;
            loop {
                match ast.kind(cur) {
                    ExprKind::Cell { head, tail } => {
                        write!(f, " ")?;
                        write_node(f, ast, interner, head)?;
                        cur = tail;
                    }
                    ExprKind::Nil => break,
                    _ => {
                        write!(f, " . ")?;
                        write_node(f, ast, interner, cur)?;
                        break;
                    }
                }
            }
            write!(f, ")")
        }
    }
}
