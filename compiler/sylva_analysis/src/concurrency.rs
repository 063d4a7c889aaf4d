//! Concurrency analysis.
//!
//! Classifies every variable's thread locality:
//!
//! - **Local** (default) — never leaves its thread; plain RC.
//! - **Shared** — captured by a spawn body or held by an atom; every
//!   surviving RC operation must be atomic.
//! - **Transferred** — sent over a channel with transfer semantics; the
//!   sender's reference ends at the send (no post-send decrement) and the
//!   receiver inherits the sole reference, so non-atomic RC stays sound.
//! - **Immutable** — frozen; pure readers need no RC operations at all.
//!
//! Also records each spawn site's capture set and, per channel send,
//! whether the send transfers ownership.

use sylva_ast::{Ast, ExprKind, NodeId, SpecialForm, StringInterner};

use crate::context::{AnalysisContext, SpawnSite, ThreadLocality, VarKey};
use crate::resolve::{head_form, Program};

/// Run concurrency classification over the unit.
pub fn analyze_concurrency(
    ast: &Ast,
    interner: &StringInterner,
    program: &Program,
    ctx: &mut AnalysisContext,
) {
    ctx.locality.clear();
    ctx.spawns.clear();
    ctx.channel_transfers.clear();

    let mut stack: Vec<NodeId> = Vec::new();
    for def in program.functions.values() {
        stack.extend(&def.body);
    }
    stack.extend(&program.toplevel);

    let mut spawns: Vec<SpawnSite> = Vec::new();

    while let Some(node) = stack.pop() {
        let ExprKind::Cell { head, tail } = ast.kind(node) else {
            continue;
        };
        stack.push(head);
        stack.push(tail);

        match head_form(ast, interner, node) {
            Some(SpecialForm::Spawn) => {
                let captures = ctx.captures.get(&node).cloned().unwrap_or_default();
                for &key in &captures {
                    promote(ctx, key, ThreadLocality::Shared);
                }
                spawns.push(SpawnSite { node, captures });
            }
            Some(SpecialForm::Atom) => {
                if let Some(&key) = ast.list_nth(node, 1).and_then(|a| ctx.resolutions.get(&a)) {
                    promote(ctx, key, ThreadLocality::Shared);
                }
            }
            Some(SpecialForm::Send) => {
                let transfers = send_transfers(ast, ctx, node);
                ctx.channel_transfers.insert(node, transfers);
                if transfers {
                    if let Some(&key) =
                        ast.list_nth(node, 2).and_then(|v| ctx.resolutions.get(&v))
                    {
                        promote(ctx, key, ThreadLocality::Transferred);
                    }
                }
            }
            Some(SpecialForm::Freeze) => {
                if let Some(&key) = ast.list_nth(node, 1).and_then(|v| ctx.resolutions.get(&v)) {
                    promote(ctx, key, ThreadLocality::Immutable);
                }
            }
            _ => {}
        }
    }

    spawns.sort_by_key(|s| ast.pos(s.node));
    ctx.spawns = spawns;

    tracing::debug!(
        shared = ctx
            .locality
            .values()
            .filter(|&&l| l == ThreadLocality::Shared)
            .count(),
        spawns = ctx.spawns.len(),
        "concurrency classification finished"
    );
}

/// Locality lattice: Local < Shared < Transferred < Immutable. A freeze
/// wins over everything; a transfer wins over mere sharing (the transfer
/// point is the variable's linear end).
fn promote(ctx: &mut AnalysisContext, key: VarKey, new: ThreadLocality) {
    let rank = |l: ThreadLocality| match l {
        ThreadLocality::Local => 0,
        ThreadLocality::Shared => 1,
        ThreadLocality::Transferred => 2,
        ThreadLocality::Immutable => 3,
    };
    let current = ctx.thread_locality(key);
    if rank(new) > rank(current) {
        ctx.locality.insert(key, new);
    }
}

/// A send transfers ownership when its payload is a variable at its last
/// use, or a fresh (unnamed) expression. A variable the sender keeps
/// using is retained instead: the send increments and both sides own.
fn send_transfers(ast: &Ast, ctx: &AnalysisContext, node: NodeId) -> bool {
    let Some(payload) = ast.list_nth(node, 2) else {
        return false;
    };
    match ctx.resolutions.get(&payload) {
        Some(key) => ctx
            .usage
            .get(key)
            .is_some_and(|u| u.last_use == ast.pos(payload)),
        // Fresh expression: nobody else can hold it.
        None => true,
    }
}

#[cfg(test)]
mod tests;
