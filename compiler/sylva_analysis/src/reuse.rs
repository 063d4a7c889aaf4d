//! Constructor reuse detection.
//!
//! Walks the emission plan — frees and allocations in the order codegen
//! will emit them — and pairs each free with an immediately following
//! constructor of the same size class. When the freed binding was Local
//! and unique, the pair becomes a reuse candidate: codegen emits a
//! conditional that reinitializes the freed slot in place instead of
//! freeing and reallocating, falling back to a fresh allocation when the
//! runtime refcount test fails.
//!
//! Only adjacent free/alloc pairs are considered; anything in between
//! that touches the heap disqualifies the pair (the slot could have been
//! recycled already).

use sylva_ast::{Ast, ExprKind, Name, NodeId, Pos, StringInterner};

use crate::context::{AnalysisContext, ReuseCandidate, SizeClass, VarKey, VarOwnership};
use crate::resolve::Program;

#[derive(Clone, Copy, Debug)]
enum PlanEvent {
    Free { var: VarKey, pos: Pos, anchor: NodeId },
    Alloc { node: NodeId, pos: Pos, class: SizeClass, type_name: Option<Name> },
}

impl PlanEvent {
    fn pos(self) -> Pos {
        match self {
            PlanEvent::Free { pos, .. } | PlanEvent::Alloc { pos, .. } => pos,
        }
    }
}

/// Detect reuse candidates across the unit's emission plan.
pub fn detect_reuse(
    ast: &Ast,
    interner: &StringInterner,
    program: &Program,
    ctx: &mut AnalysisContext,
) {
    ctx.reuses.clear();

    let mut events: Vec<PlanEvent> = Vec::new();

    // Free events. A free anchored "after" a statement lands after every
    // allocation inside that statement, so it sorts at the statement's
    // subtree end.
    for (&anchor, vars) in &ctx.frees_after {
        let pos = Program::subtree_end(ast, anchor);
        for &var in vars {
            events.push(PlanEvent::Free { var, pos, anchor });
        }
    }
    for (&anchor, vars) in &ctx.frees_on_entry {
        let pos = ast.pos(anchor);
        for &var in vars {
            events.push(PlanEvent::Free { var, pos, anchor });
        }
    }

    // Allocation events: every constructor call in the unit.
    let mut stack: Vec<NodeId> = Vec::new();
    for def in program.functions.values() {
        stack.extend(&def.body);
    }
    for global in &program.globals {
        stack.push(global.value);
    }
    stack.extend(&program.toplevel);
    while let Some(node) = stack.pop() {
        if let ExprKind::Cell { head, tail } = ast.kind(node) {
            stack.push(head);
            stack.push(tail);
        } else {
            continue;
        }
        if let Some((class, type_name)) = alloc_class(ast, interner, ctx, node) {
            events.push(PlanEvent::Alloc {
                node,
                pos: ast.pos(node),
                class,
                type_name,
            });
        }
    }

    events.sort_by_key(|e| e.pos());

    // Branch-arm context per node: a free in one arm must not pair with
    // an allocation in the other (they are never on the same path).
    let arm_ctx = compute_arm_contexts(ast, interner, program);

    // Adjacent pairing.
    for pair in events.windows(2) {
        let (
            PlanEvent::Free { var, pos: free_pos, anchor },
            PlanEvent::Alloc { node, pos, class, .. },
        ) = (pair[0], pair[1])
        else {
            continue;
        };
        if arm_ctx.get(&anchor) != arm_ctx.get(&node) {
            continue;
        }
        let Some(owner) = ctx.owners.get(&var) else {
            continue;
        };
        if owner.ownership != VarOwnership::Local || !owner.is_unique {
            continue;
        }
        let freed_class = var_size_class(ast, interner, ctx, program, var);
        if freed_class != class {
            continue;
        }
        let type_name = var_type_name(ast, interner, program, var);
        let is_consumed = ctx
            .usage
            .get(&var)
            .is_some_and(|u| owner.free_pos.is_some_and(|fp| fp <= u.last_use));
        ctx.reuses.push(ReuseCandidate {
            freed: var,
            type_name,
            free_pos,
            alloc_pos: pos,
            alloc_node: node,
            size_class: class,
            can_reuse: true,
            is_consumed,
        });
    }

    ctx.reuses.sort_by_key(|r| r.free_pos);
    tracing::debug!(candidates = ctx.reuses.len(), "reuse detection finished");
}

/// Assign every node the identity of the innermost branch arm (or loop
/// body) containing it. Nodes in different arms can never execute on the
/// same path, so free/alloc pairs across arms are rejected.
fn compute_arm_contexts(
    ast: &Ast,
    interner: &StringInterner,
    program: &Program,
) -> rustc_hash::FxHashMap<NodeId, NodeId> {
    use sylva_ast::SpecialForm;

    let mut ctx_of: rustc_hash::FxHashMap<NodeId, NodeId> = rustc_hash::FxHashMap::default();
    // (node, current arm root)
    let mut stack: Vec<(NodeId, NodeId)> = Vec::new();
    let sentinel = NodeId::new(u32::MAX);
    for def in program.functions.values() {
        stack.extend(def.body.iter().map(|&n| (n, sentinel)));
    }
    stack.extend(program.toplevel.iter().map(|&n| (n, sentinel)));

    while let Some((node, arm)) = stack.pop() {
        ctx_of.insert(node, arm);
        let ExprKind::Cell { .. } = ast.kind(node) else {
            continue;
        };
        let items = ast.list_items(node);
        match crate::resolve::head_form(ast, interner, node) {
            Some(SpecialForm::If) => {
                if let Some(&cond) = items.get(1) {
                    stack.push((cond, arm));
                }
                for &arm_root in items.iter().skip(2) {
                    stack.push((arm_root, arm_root));
                }
            }
            Some(SpecialForm::Try) => {
                for &part in items.iter().skip(1) {
                    stack.push((part, part));
                }
            }
            _ => {
                for &child in &items {
                    stack.push((child, arm));
                }
            }
        }
    }
    ctx_of
}

/// Size class and user type of an allocation site, if the node is a
/// constructor call.
fn alloc_class(
    ast: &Ast,
    interner: &StringInterner,
    ctx: &AnalysisContext,
    node: NodeId,
) -> Option<(SizeClass, Option<Name>)> {
    let head = ast.head_symbol(node)?;
    let head_str = interner.lookup(head);
    match head_str {
        "cons" => Some((SizeClass::CELL, None)),
        "box" => Some((SizeClass::CELL, None)),
        "lambda" => Some((SizeClass::CLOSURE, None)),
        _ => {
            let ty = head_str.strip_prefix("make-")?;
            let ty_name = interner.intern(ty);
            let info = ctx.shapes.get(&ty_name)?;
            Some((SizeClass::for_user_type(info.fields.len()), Some(ty_name)))
        }
    }
}

/// Size class of a freed binding, from its initializer.
fn var_size_class(
    ast: &Ast,
    interner: &StringInterner,
    ctx: &AnalysisContext,
    program: &Program,
    var: VarKey,
) -> SizeClass {
    let Some(&init) = program.binding_inits.get(&var) else {
        return SizeClass::SCALAR;
    };
    if let Some((class, _)) = alloc_class(ast, interner, ctx, init) {
        return class;
    }
    match ast.kind(init) {
        ExprKind::Cell { .. } => SizeClass::CELL,
        _ => SizeClass::SCALAR,
    }
}

/// User type name of a freed binding, when its initializer names one.
fn var_type_name(
    ast: &Ast,
    interner: &StringInterner,
    program: &Program,
    var: VarKey,
) -> Option<Name> {
    let &init = program.binding_inits.get(&var)?;
    let head = ast.head_symbol(init)?;
    let ty = interner.lookup(head).strip_prefix("make-")?;
    Some(interner.intern(ty))
}
