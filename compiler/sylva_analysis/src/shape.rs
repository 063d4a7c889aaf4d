//! Type shape analysis.
//!
//! Classifies every `deftype` as Tree, DAG, or Cyclic by inspecting its
//! fields:
//!
//! - No self-referential field → **Tree**.
//! - A self-referential field whose name contains a back-edge pattern
//!   (`parent`, `prev`, `previous`, `back`, `up`, `owner`) → **Cyclic**,
//!   and the field is recorded as a back-edge.
//! - A self-referential field with no pattern match → **DAG**.
//! - An explicit `:weak` annotation forces back-edge treatment regardless
//!   of the field name.
//!
//! The shape drives the free-strategy choice downstream: trees free
//! structurally, DAGs by refcount, cyclic values by SCC or deferred
//! decrement.

use sylva_ast::{Ast, Name, NodeId, StringInterner};
use sylva_diagnostic::{Diagnostic, ErrorCode};

use crate::context::{AnalysisContext, FieldInfo, Shape, ShapeInfo};
use crate::resolve::Program;

/// Field-name substrings that mark a self-referential field as a
/// back-edge (a child-to-parent link rather than an ownership edge).
pub const BACK_EDGE_PATTERNS: &[&str] = &["parent", "prev", "previous", "back", "up", "owner"];

/// Run shape analysis over every `deftype` of the unit.
pub fn analyze_shapes(
    ast: &Ast,
    interner: &StringInterner,
    program: &Program,
    ctx: &mut AnalysisContext,
) -> Result<(), Diagnostic> {
    for &decl in &program.types {
        let info = classify_deftype(ast, interner, decl)?;
        let name = ast
            .as_symbol(ast.list_nth(decl, 1).expect("hoisting checked the name"))
            .expect("hoisting checked the name");
        tracing::debug!(
            ty = interner.lookup(name),
            shape = ?info.shape,
            back_edges = info.back_edge_fields.len(),
            "classified type"
        );
        ctx.shapes.insert(name, info);
    }
    Ok(())
}

fn classify_deftype(
    ast: &Ast,
    interner: &StringInterner,
    decl: NodeId,
) -> Result<ShapeInfo, Diagnostic> {
    let items = ast.list_items(decl);
    let ty_name = ast.as_symbol(items[1]).expect("hoisting checked the name");

    let mut fields: Vec<FieldInfo> = Vec::with_capacity(items.len() - 2);
    let mut back_edges = Vec::new();
    let mut has_owning_self_ref = false;

    for &field in &items[2..] {
        let parts = ast.list_items(field);
        let (Some(&fname_node), Some(&fty_node)) = (parts.first(), parts.get(1)) else {
            return Err(Diagnostic::error(
                ErrorCode::BadDeftypeField,
                "field must be `(name Type)`",
                ast.span(field),
            ));
        };
        let (Some(fname), Some(fty)) = (ast.as_symbol(fname_node), ast.as_symbol(fty_node)) else {
            return Err(Diagnostic::error(
                ErrorCode::BadDeftypeField,
                "field name and type must be symbols",
                ast.span(field),
            ));
        };
        if fields.iter().any(|f: &FieldInfo| f.name == fname) {
            return Err(Diagnostic::error(
                ErrorCode::BadDeftypeField,
                format!("duplicate field `{}`", interner.lookup(fname)),
                ast.span(fname_node),
            ));
        }
        let weak = parts
            .get(2)
            .and_then(|&n| ast.as_symbol(n))
            .is_some_and(|n| interner.lookup(n) == ":weak");

        let self_referential = fty == ty_name;
        if self_referential {
            if weak || is_back_edge_name(interner.lookup(fname)) {
                back_edges.push(fname);
            } else {
                has_owning_self_ref = true;
            }
        }

        fields.push(FieldInfo {
            name: fname,
            ty: fty,
            weak,
        });
    }

    let shape = if !back_edges.is_empty() {
        Shape::Cyclic
    } else if has_owning_self_ref {
        Shape::Dag
    } else {
        Shape::Tree
    };

    Ok(ShapeInfo {
        shape,
        fields,
        is_cyclic: shape == Shape::Cyclic,
        back_edge_fields: back_edges,
        decl,
    })
}

/// Whether a field name matches a registered back-edge pattern.
pub fn is_back_edge_name(name: &str) -> bool {
    BACK_EDGE_PATTERNS.iter().any(|p| name.contains(p))
}

/// Whether a specific field of a type is a recorded back-edge.
pub fn is_back_edge_field(ctx: &AnalysisContext, ty: Name, field: Name) -> bool {
    ctx.shapes
        .get(&ty)
        .is_some_and(|info| info.back_edge_fields.contains(&field))
}

#[cfg(test)]
mod tests;
