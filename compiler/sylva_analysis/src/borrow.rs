//! Borrow inference.
//!
//! Two kinds of borrows are recorded:
//!
//! - **Loop borrows**: each looping primitive (`for-each`, `map`, `fold`,
//!   `filter`) iterating a Local collection of shape Tree or DAG borrows
//!   the collection for the whole loop. Loop borrows set `needs_tether`:
//!   codegen pins the collection at the loop header and releases it at
//!   every exit (normal and unwinding), so the body pays no per-iteration
//!   RC traffic.
//! - **Shared borrows**: accessor results (`head`, `tail`, `unbox`,
//!   `deref`, field reads) in straight-line code. These need no tether —
//!   the holder is consumed before anything can free the source.
//!
//! A borrow must end inside the scope that created it. The permissive
//! reading (escaped borrow still valid by generation check) is rejected;
//! the runtime validation stays in the emitted code as a backstop but the
//! analysis never produces such a borrow.

use sylva_ast::{Ast, ExprKind, NodeId, SpecialForm, StringInterner};
use sylva_diagnostic::{Diagnostic, ErrorCode};

use crate::context::{
    AnalysisContext, BorrowInfo, BorrowKind, Shape, VarOwnership,
};
use crate::resolve::{head_form, Program};

/// Accessor heads that produce shared borrows in straight-line code.
const ACCESSOR_HEADS: &[&str] = &["head", "tail", "unbox", "deref"];

/// Run borrow inference over the unit.
pub fn infer_borrows(
    ast: &Ast,
    interner: &StringInterner,
    program: &Program,
    ctx: &mut AnalysisContext,
) -> Result<(), Diagnostic> {
    // This pass owns the borrow table.
    ctx.borrows.clear();

    let mut forms: Vec<NodeId> = Vec::new();
    for def in program.functions.values() {
        forms.extend(&def.body);
    }
    forms.extend(&program.toplevel);

    let mut stack = forms;
    while let Some(node) = stack.pop() {
        if let ExprKind::Cell { head, tail } = ast.kind(node) {
            stack.push(head);
            stack.push(tail);
        } else {
            continue;
        }

        match head_form(ast, interner, node) {
            Some(form) if form.is_loop() && form != SpecialForm::While => {
                record_loop_borrow(ast, interner, program, ctx, node, form)?;
            }
            Some(_) => {}
            None => record_shared_borrow(ast, interner, ctx, node),
        }
    }

    let total: usize = ctx.borrows.values().map(Vec::len).sum();
    tracing::debug!(borrows = total, "borrow inference finished");
    Ok(())
}

/// Record a Loop borrow on the collection argument of a looping form.
fn record_loop_borrow(
    ast: &Ast,
    interner: &StringInterner,
    program: &Program,
    ctx: &mut AnalysisContext,
    node: NodeId,
    form: SpecialForm,
) -> Result<(), Diagnostic> {
    // Collection operand position: `(for-each x items body...)` puts it
    // at 2, `(map f items)` / `(fold f init items)` / `(filter f items)`
    // put it last.
    let items = ast.list_items(node);
    let coll = match form {
        SpecialForm::ForEach => items.get(2),
        _ => items.last().filter(|_| items.len() >= 3),
    };
    let Some(&coll) = coll else {
        return Ok(());
    };
    let Some(&key) = ctx.resolutions.get(&coll) else {
        return Ok(()); // collection is a fresh expression, nothing borrowed
    };
    let Some(owner) = ctx.owners.get(&key) else {
        return Ok(());
    };
    if owner.ownership != VarOwnership::Local || !matches!(owner.shape, Shape::Tree | Shape::Dag) {
        return Ok(());
    }

    let start = ast.pos(node);
    let end = Program::subtree_end(ast, node);

    // Conservative scope rule: the loop must sit inside the extent of
    // the scope that created the collection.
    let scope = key.scope;
    if let Some(scope_data) = program.scopes.get(scope.index()) {
        if end > scope_data.end || start < scope_data.start {
            return Err(Diagnostic::error(
                ErrorCode::BorrowOutlivesScope,
                format!(
                    "loop borrows `{}` beyond the scope that created it",
                    interner.lookup(key.name)
                ),
                ast.span(node),
            ));
        }
    }

    let holder = match form {
        SpecialForm::ForEach => ast
            .list_nth(node, 1)
            .and_then(|v| ast.as_symbol(v))
            .unwrap_or(key.name),
        _ => key.name,
    };

    ctx.borrows.entry(key).or_default().push(BorrowInfo {
        holder,
        kind: BorrowKind::Loop,
        needs_tether: true,
        start,
        end,
        scope,
    });
    Ok(())
}

/// Record a Shared borrow for an accessor on a local variable.
fn record_shared_borrow(
    ast: &Ast,
    interner: &StringInterner,
    ctx: &mut AnalysisContext,
    node: NodeId,
) {
    let items = ast.list_items(node);
    let Some(head_name) = items.first().and_then(|&h| ast.as_symbol(h)) else {
        return;
    };
    let head_str = interner.lookup(head_name);
    let is_accessor = ACCESSOR_HEADS.contains(&head_str)
        || ctx.shapes.keys().any(|&ty| {
            let ty_str = interner.lookup(ty);
            head_str.len() > ty_str.len() + 1
                && head_str.starts_with(ty_str)
                && head_str.as_bytes()[ty_str.len()] == b'-'
        });
    if !is_accessor {
        return;
    }
    let Some(&key) = items.get(1).and_then(|a| ctx.resolutions.get(a)) else {
        return;
    };
    if ctx
        .owners
        .get(&key)
        .is_none_or(|o| o.ownership != VarOwnership::Local)
    {
        return;
    }

    let pos = ast.pos(node);
    ctx.borrows.entry(key).or_default().push(BorrowInfo {
        holder: key.name,
        kind: BorrowKind::Shared,
        needs_tether: false,
        start: pos,
        end: Program::subtree_end(ast, node),
        scope: key.scope,
    });
}

#[cfg(test)]
mod tests;
