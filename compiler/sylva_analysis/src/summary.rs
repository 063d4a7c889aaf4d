//! Interprocedural function summaries.
//!
//! Computes, per user function: the ownership each parameter is used with
//! ({Borrowed, Consumed, Passthrough, Captured}), the ownership of the
//! return value ({Fresh, Passthrough, Borrowed, None}), whether the body
//! has side effects, and whether it allocates.
//!
//! Summaries are computed bottom-up over the call graph by fixpoint
//! iteration: every summary starts optimistic (params Borrowed, return
//! Fresh, no effects) and facts only escalate, so iteration converges.
//! Recursive groups fall out of the same loop — no explicit SCC
//! construction is needed.
//!
//! Downstream consumers:
//! - the ownership pass marks parameters Borrowed/Transferred from these
//!   annotations;
//! - codegen suppresses the caller-side free around a call whose argument
//!   flows through a Passthrough parameter.

use rustc_hash::FxHashMap;

use sylva_ast::{Ast, ExprKind, Name, NodeId, SpecialForm, StringInterner};

use crate::context::{
    AnalysisContext, FnSummary, ParamOwnership, ParamSummary, ReturnOwnership, VarKey,
};
use crate::resolve::{head_form, FnDef, Program};

/// Constructor heads: forms whose result is a fresh allocation.
const CONSTRUCTOR_HEADS: &[&str] = &["cons", "list"];

/// Accessor heads: forms whose result borrows from their operand.
const ACCESSOR_HEADS: &[&str] = &["head", "tail"];

/// Effectful primitive heads (beyond the effectful special forms).
const EFFECT_HEADS: &[&str] = &["print"];

/// Compute summaries for every user function in the unit.
pub fn compute_summaries(
    ast: &Ast,
    interner: &StringInterner,
    program: &Program,
    ctx: &mut AnalysisContext,
) {
    // Seed: every function starts Borrowed/Fresh/pure.
    let mut summaries: FxHashMap<Name, FnSummary> = FxHashMap::default();
    for name in &program.fn_order {
        let def = &program.functions[name];
        summaries.insert(
            *name,
            FnSummary {
                params: def
                    .params
                    .iter()
                    .map(|&p| ParamSummary {
                        name: p,
                        ownership: ParamOwnership::Borrowed,
                    })
                    .collect(),
                return_ownership: ReturnOwnership::Fresh,
                return_param_index: None,
                has_side_effects: false,
                allocates: false,
            },
        );
    }

    // Fixpoint: facts only escalate, so this terminates.
    let mut changed = true;
    let mut iterations = 0u32;
    while changed {
        changed = false;
        iterations += 1;
        for name in &program.fn_order {
            let def = &program.functions[name];
            let updated = summarize_function(ast, interner, ctx, def, &summaries);
            let current = summaries.get_mut(name).expect("seeded above");
            if *current != updated {
                *current = updated;
                changed = true;
            }
        }
    }
    tracing::debug!(
        functions = program.fn_order.len(),
        iterations,
        "function summaries converged"
    );

    for (name, summary) in summaries {
        ctx.summaries.insert(name, summary);
    }
}

fn summarize_function(
    ast: &Ast,
    interner: &StringInterner,
    ctx: &AnalysisContext,
    def: &FnDef,
    summaries: &FxHashMap<Name, FnSummary>,
) -> FnSummary {
    let param_keys: Vec<VarKey> = def
        .params
        .iter()
        .map(|&p| VarKey::new(def.scope, p))
        .collect();

    let mut params: Vec<ParamSummary> = def
        .params
        .iter()
        .map(|&p| ParamSummary {
            name: p,
            ownership: ParamOwnership::Borrowed,
        })
        .collect();

    let mut has_side_effects = false;
    let mut allocates = false;

    // Tail expressions of the body (through if / let / begin nesting).
    let tails = collect_tails(ast, interner, *def.body.last().expect("bodies are non-empty"));

    // Walk every node of every body form.
    for &form in &def.body {
        let mut stack = vec![form];
        while let Some(node) = stack.pop() {
            if let ExprKind::Cell { head, tail } = ast.kind(node) {
                stack.push(head);
                stack.push(tail);
            }

            let Some(items) = call_items(ast, node) else {
                continue;
            };

            // Effects and allocation from this form's head.
            if let Some(form_kind) = head_form(ast, interner, node) {
                if form_kind.is_effectful() {
                    has_side_effects = true;
                }
                if is_constructor_form(form_kind) {
                    allocates = true;
                }
            } else if let Some(head_name) = ast.as_symbol(items[0]) {
                let head_str = interner.lookup(head_name);
                if EFFECT_HEADS.contains(&head_str) {
                    has_side_effects = true;
                }
                if CONSTRUCTOR_HEADS.contains(&head_str) || head_str.starts_with("make-") {
                    allocates = true;
                }
                if let Some(callee) = summaries.get(&head_name) {
                    if callee.has_side_effects {
                        has_side_effects = true;
                    }
                }
            }

            // Parameter use classification at this form.
            for (i, &key) in param_keys.iter().enumerate() {
                if let Some(escalated) = classify_param_use(ast, interner, ctx, node, key, summaries)
                {
                    escalate(&mut params[i].ownership, escalated);
                }
            }
        }
    }

    // Parameters captured by any closure inside the body.
    for (i, key) in param_keys.iter().enumerate() {
        let captured = ctx.captures.values().any(|list| list.contains(key));
        if captured {
            escalate(&mut params[i].ownership, ParamOwnership::Captured);
        }
    }

    // Parameters returned in tail position are Passthrough.
    let mut return_param_index = None;
    for &tail in &tails {
        if let Some(key) = ctx.resolutions.get(&tail) {
            if let Some(i) = param_keys.iter().position(|k| k == key) {
                escalate(&mut params[i].ownership, ParamOwnership::Passthrough);
                return_param_index = Some(i);
            }
        }
    }

    let return_ownership =
        classify_return(ast, interner, ctx, &tails, &param_keys, summaries, return_param_index);
    if return_ownership != ReturnOwnership::Passthrough {
        return_param_index = None;
    }

    FnSummary {
        params,
        return_ownership,
        return_param_index,
        has_side_effects,
        allocates,
    }
}

/// Ownership escalation lattice: Borrowed < Passthrough < Consumed <
/// Captured. Facts never de-escalate, which is what makes the fixpoint
/// converge.
fn escalate(current: &mut ParamOwnership, new: ParamOwnership) {
    let rank = |o: ParamOwnership| match o {
        ParamOwnership::Borrowed => 0,
        ParamOwnership::Passthrough => 1,
        ParamOwnership::Consumed => 2,
        ParamOwnership::Captured => 3,
    };
    if rank(new) > rank(*current) {
        *current = new;
    }
}

/// How one form uses a parameter, if it escalates the parameter at all.
fn classify_param_use(
    ast: &Ast,
    interner: &StringInterner,
    ctx: &AnalysisContext,
    node: NodeId,
    param: VarKey,
    summaries: &FxHashMap<Name, FnSummary>,
) -> Option<ParamOwnership> {
    let items = call_items(ast, node)?;

    let arg_positions: Vec<usize> = items[1..]
        .iter()
        .enumerate()
        .filter(|(_, &arg)| ctx.resolutions.get(&arg) == Some(&param))
        .map(|(i, _)| i)
        .collect();
    if arg_positions.is_empty() {
        return None;
    }

    if let Some(form) = head_form(ast, interner, node) {
        return match form {
            // Channel send transfers the value away: a transitive free
            // from this function's perspective.
            SpecialForm::Send if arg_positions.contains(&1) => Some(ParamOwnership::Consumed),
            // Stored into a shared mutable cell.
            SpecialForm::Atom | SpecialForm::Box => Some(ParamOwnership::Captured),
            SpecialForm::SetBox | SpecialForm::Reset if arg_positions.contains(&1) => {
                Some(ParamOwnership::Captured)
            }
            _ => None,
        };
    }

    let head_name = ast.as_symbol(items[0])?;
    let head_str = interner.lookup(head_name);

    // Stored into a fresh structure: retained beyond this call.
    if CONSTRUCTOR_HEADS.contains(&head_str) || head_str.starts_with("make-") {
        return Some(ParamOwnership::Captured);
    }
    if head_str.starts_with("set-") && head_str.ends_with('!') {
        return Some(ParamOwnership::Captured);
    }

    // Calls propagate the callee's parameter ownership.
    if let Some(callee) = summaries.get(&head_name) {
        let mut worst: Option<ParamOwnership> = None;
        for &pos in &arg_positions {
            match callee.params.get(pos).map(|p| p.ownership) {
                Some(ParamOwnership::Consumed) => {
                    worst = Some(ParamOwnership::Consumed);
                }
                Some(ParamOwnership::Captured) => return Some(ParamOwnership::Captured),
                _ => {}
            }
        }
        return worst;
    }

    None
}

/// Classify the return ownership from the body's tail expressions.
fn classify_return(
    ast: &Ast,
    interner: &StringInterner,
    ctx: &AnalysisContext,
    tails: &[NodeId],
    param_keys: &[VarKey],
    summaries: &FxHashMap<Name, FnSummary>,
    passthrough_index: Option<usize>,
) -> ReturnOwnership {
    // A tail that returns a parameter dominates: the caller must keep
    // owning that argument across the call, even if another branch
    // returns a fresh value (that branch then leaks at worst, never
    // double-frees).
    if passthrough_index.is_some() {
        return ReturnOwnership::Passthrough;
    }

    let mut result: Option<ReturnOwnership> = None;
    for &tail in tails {
        let one = classify_one_tail(ast, interner, ctx, tail, param_keys, summaries);
        result = Some(match (result, one) {
            (None, o) => o,
            (Some(a), b) if a == b => a,
            // Mixed branches: a fresh value is the conservative owner
            // story for the caller.
            _ => ReturnOwnership::Fresh,
        });
    }
    result.unwrap_or(ReturnOwnership::None)
}

fn classify_one_tail(
    ast: &Ast,
    interner: &StringInterner,
    ctx: &AnalysisContext,
    tail: NodeId,
    param_keys: &[VarKey],
    summaries: &FxHashMap<Name, FnSummary>,
) -> ReturnOwnership {
    match ast.kind(tail) {
        // Immediates carry no ownership; treat as fresh.
        ExprKind::Int(_) | ExprKind::Float(_) | ExprKind::Char(_) | ExprKind::Nil => {
            ReturnOwnership::Fresh
        }
        ExprKind::Symbol(_) => {
            if ctx
                .resolutions
                .get(&tail)
                .is_some_and(|key| param_keys.contains(key))
            {
                ReturnOwnership::Passthrough
            } else {
                // Some other binding: the value flows out of the frame.
                ReturnOwnership::Fresh
            }
        }
        ExprKind::Cell { .. } => {
            if let Some(form) = head_form(ast, interner, tail) {
                return if is_constructor_form(form) {
                    ReturnOwnership::Fresh
                } else if form.is_effectful() {
                    ReturnOwnership::None
                } else {
                    ReturnOwnership::Fresh
                };
            }
            let items = ast.list_items(tail);
            let Some(head_name) = items.first().and_then(|&h| ast.as_symbol(h)) else {
                return ReturnOwnership::Fresh;
            };
            let head_str = interner.lookup(head_name);

            if ACCESSOR_HEADS.contains(&head_str) || is_field_accessor(interner, ctx, head_name) {
                return ReturnOwnership::Borrowed;
            }
            if CONSTRUCTOR_HEADS.contains(&head_str) || head_str.starts_with("make-") {
                return ReturnOwnership::Fresh;
            }
            if EFFECT_HEADS.contains(&head_str) {
                return ReturnOwnership::None;
            }

            // Tail call: propagate the callee's return ownership. A
            // passthrough callee returns our argument — ours only if that
            // argument is one of our parameters, which the caller loop
            // already detected; otherwise the value is fresh from our
            // caller's perspective.
            if let Some(callee) = summaries.get(&head_name) {
                return match callee.return_ownership {
                    ReturnOwnership::Passthrough | ReturnOwnership::Fresh => ReturnOwnership::Fresh,
                    other => other,
                };
            }
            ReturnOwnership::Fresh
        }
    }
}

/// Tail expressions of a form: itself, or the tails of its branches.
pub fn collect_tails(ast: &Ast, interner: &StringInterner, node: NodeId) -> Vec<NodeId> {
    let mut tails = Vec::new();
    collect_tails_into(ast, interner, node, &mut tails);
    tails
}

fn collect_tails_into(ast: &Ast, interner: &StringInterner, node: NodeId, out: &mut Vec<NodeId>) {
    match head_form(ast, interner, node) {
        Some(SpecialForm::If) => {
            let items = ast.list_items(node);
            if let Some(&t) = items.get(2) {
                collect_tails_into(ast, interner, t, out);
            }
            if let Some(&e) = items.get(3) {
                collect_tails_into(ast, interner, e, out);
            }
        }
        Some(SpecialForm::Let | SpecialForm::Begin) => {
            let items = ast.list_items(node);
            let first_body = if head_form(ast, interner, node) == Some(SpecialForm::Let) {
                2
            } else {
                1
            };
            if let Some(&last) = items.get(first_body.max(items.len().saturating_sub(1))) {
                collect_tails_into(ast, interner, last, out);
            } else {
                out.push(node);
            }
        }
        _ => out.push(node),
    }
}

/// Whether a special form allocates a fresh value.
fn is_constructor_form(form: SpecialForm) -> bool {
    matches!(
        form,
        SpecialForm::Lambda
            | SpecialForm::Chan
            | SpecialForm::Atom
            | SpecialForm::Box
            | SpecialForm::Map
            | SpecialForm::Filter
    )
}

/// Whether a head is a `deftype` field accessor (`T-field`).
fn is_field_accessor(interner: &StringInterner, ctx: &AnalysisContext, head: Name) -> bool {
    let s = interner.lookup(head);
    ctx.shapes.keys().any(|&ty| {
        let ty_str = interner.lookup(ty);
        s.len() > ty_str.len() + 1 && s.starts_with(ty_str) && s.as_bytes()[ty_str.len()] == b'-'
    })
}

fn call_items(ast: &Ast, node: NodeId) -> Option<Vec<NodeId>> {
    match ast.kind(node) {
        ExprKind::Cell { .. } => {
            let items = ast.list_items(node);
            if items.is_empty() {
                None
            } else {
                Some(items)
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests;
