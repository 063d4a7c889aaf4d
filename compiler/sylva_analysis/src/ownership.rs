//! Ownership and escape analysis.
//!
//! Produces, per binding, an Owner record (ownership class, uniqueness,
//! free obligation, shape, allocation and free strategies) and an Escape
//! record (how the value leaves its scope, if at all). Every new local
//! starts from the default `{Local, unique, must_free, shape=Tree,
//! alloc=Heap}` and is refined from there.
//!
//! Decision order matters and is fixed:
//!
//! 1. escape classification (Return / Capture / HeapStore / Global, with
//!    transitive heap-store propagation to a fixpoint);
//! 2. ownership (Borrowed for borrowed/passthrough parameters, Shared for
//!    multiply-captured or atom-held values, Transferred for values whose
//!    last use is a transferring channel send);
//! 3. uniqueness (lost on capture, on aliasing into a structure that
//!    outlives the use, on passing to a capturing callee);
//! 4. allocation strategy (Stack for non-escaping unique scalars and
//!    pool-sized trees, Arena for non-escaping cyclic values, Heap
//!    otherwise);
//! 5. free strategy from ownership × shape.
//!
//! The free *position* is not decided here — the liveness pass computes
//! free points and writes them back into the owner table.

use rustc_hash::FxHashMap;

use sylva_ast::{Ast, ExprKind, NodeId, Pos, SpecialForm, StringInterner};
use sylva_diagnostic::{Diagnostic, ErrorCode};

use crate::context::{
    AllocStrategy, AnalysisContext, EscapeClass, EscapeInfo, FreeStrategy, OwnerInfo,
    ParamOwnership, RegionId, RegionInfo, ScopeId, Shape, UsageFlags, VarKey, VarOwnership,
};
use crate::resolve::{head_form, Program};
use crate::summary::collect_tails;

/// Number of constructor cells a stack pool slot set can absorb. Larger
/// trees go to the heap even when they never escape.
const STACK_POOL_BUDGET: usize = 4;

/// Primitive heads whose result is always an immediate scalar.
const SCALAR_RESULT_HEADS: &[&str] = &[
    "+", "-", "*", "/", "mod", "<", ">", "<=", ">=", "=", "!=", "not", "and", "or", "null?",
    "pair?", "int?", "float?", "char?", "sym?", "bool?", "char->int", "int->char",
];

/// Per-binding facts gathered by the single walk over the unit.
#[derive(Default)]
struct UseFacts {
    /// Positions where the value is aliased into a constructor.
    constructor_arg_uses: Vec<Pos>,
    /// Passed to a callee parameter marked Captured.
    passed_to_capturing: bool,
    /// Placed into an atom.
    atom_arg: bool,
    /// Position of a transferring channel send of this value, if any.
    send_pos: Option<Pos>,
    /// Target of a `freeze`.
    frozen: bool,
    /// Number of distinct closures capturing this binding.
    capture_count: usize,
}

/// Heap-store edge: `value` is stored into `target`.
struct StoreEdge {
    target: VarKey,
    value: VarKey,
    node: NodeId,
}

/// Run ownership and escape analysis over the unit.
pub fn analyze_ownership(
    ast: &Ast,
    interner: &StringInterner,
    program: &Program,
    ctx: &mut AnalysisContext,
) -> Result<(), Diagnostic> {
    tracing::debug!(bindings = ctx.usage.len(), "analyzing ownership");

    let facts = gather_facts(ast, interner, program, ctx);
    let edges = gather_store_edges(ast, interner, program, ctx);
    let return_escapes = gather_return_escapes(ast, interner, program, ctx);

    build_regions(program, ctx);

    // Pass 1: escape classes, with transitive heap-store propagation.
    let mut escapes: FxHashMap<VarKey, EscapeClass> = FxHashMap::default();
    for (&key, usage) in &ctx.usage {
        let class = if key.scope == ScopeId::TOP && !usage.flags.contains(UsageFlags::PARAMETER) {
            EscapeClass::Global
        } else if return_escapes.contains(&key) {
            EscapeClass::Return
        } else if usage.flags.contains(UsageFlags::CAPTURED) {
            EscapeClass::Capture
        } else {
            EscapeClass::None
        };
        escapes.insert(key, class);
    }
    // A value stored into an escaping target escapes transitively.
    let mut changed = true;
    while changed {
        changed = false;
        for edge in &edges {
            let target_escapes = escapes
                .get(&edge.target)
                .is_some_and(|c| *c != EscapeClass::None);
            if target_escapes && escapes.get(&edge.value) == Some(&EscapeClass::None) {
                escapes.insert(edge.value, EscapeClass::HeapStore);
                changed = true;
            }
        }
    }

    // Sharing: seeded by multi-capture and atom placement, propagated
    // through store edges to a fixpoint (a value stored into a shared
    // parent is itself shared). Computed up-front from the facts alone so
    // a re-run over the same context reproduces identical classes.
    let mut shared: rustc_hash::FxHashSet<VarKey> = facts
        .iter()
        .filter(|(_, f)| f.capture_count > 1 || f.atom_arg)
        .map(|(&k, _)| k)
        .collect();
    let mut changed = true;
    while changed {
        changed = false;
        for edge in &edges {
            if shared.contains(&edge.target) && shared.insert(edge.value) {
                changed = true;
            }
        }
    }

    // Pass 2: the owner table.
    let keys: Vec<VarKey> = ctx.usage.keys().copied().collect();
    for key in keys {
        let usage = ctx.usage[&key];
        let fact = facts.get(&key);
        let escape_class = escapes.get(&key).copied().unwrap_or(EscapeClass::None);

        let mut owner = OwnerInfo::local_default();

        // Shape from the initializer (parameters and loop variables keep
        // the conservative Tree default).
        owner.shape = program
            .binding_inits
            .get(&key)
            .map_or(Shape::Tree, |&init| infer_shape(ast, interner, ctx, init));

        // Ownership. Loop variables alias the borrowed collection's
        // elements; they never own.
        let param_ownership = param_summary_ownership(program, ctx, key, usage.flags);
        owner.ownership = if usage.flags.contains(UsageFlags::LOOP_VAR)
            || matches!(
                param_ownership,
                Some(ParamOwnership::Borrowed | ParamOwnership::Passthrough)
            ) {
            VarOwnership::Borrowed
        } else if fact.is_some_and(|f| f.send_pos == Some(usage.last_use)) {
            VarOwnership::Transferred
        } else if shared.contains(&key) {
            VarOwnership::Shared
        } else {
            VarOwnership::Local
        };

        // Uniqueness: lost on capture, on aliasing that outlives the use,
        // or on passing to a capturing callee.
        let aliased_while_live = fact.is_some_and(|f| {
            f.constructor_arg_uses
                .iter()
                .any(|&pos| pos < usage.last_use)
        });
        if usage.flags.contains(UsageFlags::CAPTURED)
            || aliased_while_live
            || fact.is_some_and(|f| f.passed_to_capturing)
            || owner.ownership == VarOwnership::Shared
        {
            owner.is_unique = false;
        }

        // Allocation strategy. Only plain locals are candidates for the
        // stack pool or an arena; anything shared or handed away needs a
        // real heap object.
        let escapes_none = escape_class == EscapeClass::None;
        let plain_local = owner.ownership == VarOwnership::Local;
        owner.alloc = if plain_local
            && escapes_none
            && owner.is_unique
            && fits_stack(ast, ctx, program, key, owner.shape)
        {
            AllocStrategy::Stack
        } else if plain_local && owner.shape == Shape::Cyclic && escapes_none {
            AllocStrategy::Arena
        } else {
            AllocStrategy::Heap
        };

        // Free strategy from ownership × shape. Direct frees (Unique,
        // Tree) require uniqueness; anything aliased falls back to RC.
        let frozen = fact.is_some_and(|f| f.frozen);
        owner.free = match (owner.ownership, owner.shape) {
            (VarOwnership::Borrowed, _) => FreeStrategy::None,
            (_, Shape::Cyclic) if frozen => FreeStrategy::Scc,
            (_, Shape::Cyclic) => FreeStrategy::Deferred,
            (VarOwnership::Local | VarOwnership::Transferred, Shape::Scalar)
                if owner.is_unique =>
            {
                FreeStrategy::Unique
            }
            (VarOwnership::Local | VarOwnership::Transferred, Shape::Tree)
                if owner.is_unique =>
            {
                if has_children(ast, program, key) {
                    FreeStrategy::Tree
                } else {
                    FreeStrategy::Unique
                }
            }
            (_, Shape::Dag) => FreeStrategy::Rc,
            (_, Shape::Tree | Shape::Scalar) => FreeStrategy::RcTree,
        };

        // Free obligation. A returned value's obligation transfers to the
        // caller with the value; transferred and borrowed values are
        // someone else's to release; stack and arena storage reclaims in
        // bulk.
        owner.must_free = !matches!(
            owner.ownership,
            VarOwnership::Borrowed | VarOwnership::Transferred
        ) && !matches!(owner.alloc, AllocStrategy::Stack | AllocStrategy::Arena)
            && escape_class != EscapeClass::Return;

        ctx.owners.insert(key, owner);
        ctx.escapes.insert(
            key,
            EscapeInfo {
                class: escape_class,
                is_unique: owner.is_unique,
            },
        );
    }

    // Region escape flags, now that escape classes are final.
    let escaping: Vec<RegionId> = ctx
        .var_regions
        .iter()
        .filter(|(k, _)| {
            ctx.escapes
                .get(k)
                .is_some_and(|e| e.class != EscapeClass::None)
        })
        .map(|(_, &r)| r)
        .collect();
    for region in escaping {
        if let Some(info) = ctx.regions.get_mut(region.index()) {
            info.has_escaping_refs = true;
        }
    }

    // Region discipline: a region-allocated value must not be stored into
    // a binding of a shallower region.
    for edge in &edges {
        let value_alloc = ctx.owners.get(&edge.value).map(|o| o.alloc);
        if !matches!(
            value_alloc,
            Some(AllocStrategy::Stack | AllocStrategy::Arena)
        ) {
            continue;
        }
        let (Some(&tr), Some(&vr)) = (
            ctx.var_regions.get(&edge.target),
            ctx.var_regions.get(&edge.value),
        ) else {
            continue;
        };
        if ctx.regions[tr.index()].depth < ctx.regions[vr.index()].depth {
            return Err(Diagnostic::error(
                ErrorCode::EscapeViolatesRegion,
                "value allocated in an inner region is stored into an outer binding",
                ast.span(edge.node),
            ));
        }
    }

    Ok(())
}

/// One walk over every form, recording the per-binding use facts.
fn gather_facts(
    ast: &Ast,
    interner: &StringInterner,
    program: &Program,
    ctx: &AnalysisContext,
) -> FxHashMap<VarKey, UseFacts> {
    let mut facts: FxHashMap<VarKey, UseFacts> = FxHashMap::default();

    for list in ctx.captures.values() {
        for &key in list {
            facts.entry(key).or_default().capture_count += 1;
        }
    }

    for_each_form(ast, program, &mut |node| {
        let items = ast.list_items(node);
        let Some(&head) = items.first() else { return };

        if let Some(form) = head_form(ast, interner, node) {
            match form {
                SpecialForm::Atom => {
                    if let Some(key) = items.get(1).and_then(|a| ctx.resolutions.get(a)) {
                        facts.entry(*key).or_default().atom_arg = true;
                    }
                }
                SpecialForm::Send => {
                    if let Some(key) = items.get(2).and_then(|a| ctx.resolutions.get(a)) {
                        let slot = &mut facts.entry(*key).or_default().send_pos;
                        let pos = ast.pos(items[2]);
                        if slot.is_none() || *slot < Some(pos) {
                            *slot = Some(pos);
                        }
                    }
                }
                SpecialForm::Freeze => {
                    if let Some(key) = items.get(1).and_then(|a| ctx.resolutions.get(a)) {
                        facts.entry(*key).or_default().frozen = true;
                    }
                }
                _ => {}
            }
            return;
        }

        let Some(head_name) = ast.as_symbol(head) else {
            return;
        };
        let head_str = interner.lookup(head_name);

        if head_str == "cons" || head_str == "list" || head_str.starts_with("make-") {
            for &arg in &items[1..] {
                if let Some(key) = ctx.resolutions.get(&arg) {
                    facts
                        .entry(*key)
                        .or_default()
                        .constructor_arg_uses
                        .push(ast.pos(arg));
                }
            }
        }

        if let Some(summary) = ctx.summaries.get(&head_name) {
            for (i, &arg) in items[1..].iter().enumerate() {
                if let Some(key) = ctx.resolutions.get(&arg) {
                    if summary.params.get(i).map(|p| p.ownership) == Some(ParamOwnership::Captured)
                    {
                        facts.entry(*key).or_default().passed_to_capturing = true;
                    }
                }
            }
        }
    });

    facts
}

/// Collect heap-store edges: `(set-box! b v)`, `(reset! a v)`,
/// `(set-T-field! o v)`, and constructor initializers that alias a
/// variable into another binding.
fn gather_store_edges(
    ast: &Ast,
    interner: &StringInterner,
    program: &Program,
    ctx: &AnalysisContext,
) -> Vec<StoreEdge> {
    let mut edges = Vec::new();

    for_each_form(ast, program, &mut |node| {
        let items = ast.list_items(node);
        let Some(&head) = items.first() else { return };

        let is_store = match head_form(ast, interner, node) {
            Some(SpecialForm::SetBox | SpecialForm::Reset) => true,
            Some(_) => false,
            None => ast
                .as_symbol(head)
                .is_some_and(|n| {
                    let s = interner.lookup(n);
                    s.starts_with("set-") && s.ends_with('!')
                }),
        };
        if !is_store {
            return;
        }
        let (Some(target), Some(value)) = (
            items.get(1).and_then(|t| ctx.resolutions.get(t)),
            items.get(2).and_then(|v| ctx.resolutions.get(v)),
        ) else {
            return;
        };
        edges.push(StoreEdge {
            target: *target,
            value: *value,
            node,
        });
    });

    // Constructor initializers: `(let ((x (cons a b))) ...)` aliases `a`
    // and `b` into `x`.
    for (&key, &init) in &program.binding_inits {
        if let ExprKind::Cell { .. } = ast.kind(init) {
            let items = ast.list_items(init);
            let is_ctor = items
                .first()
                .and_then(|&h| ast.as_symbol(h))
                .is_some_and(|n| {
                    let s = interner.lookup(n);
                    s == "cons" || s == "list" || s.starts_with("make-")
                });
            if is_ctor {
                for &arg in &items[1..] {
                    if let Some(&value) = ctx.resolutions.get(&arg) {
                        edges.push(StoreEdge {
                            target: key,
                            value,
                            node: init,
                        });
                    }
                }
            }
        }
    }

    edges
}

/// Bindings returned from a function's tail position.
fn gather_return_escapes(
    ast: &Ast,
    interner: &StringInterner,
    program: &Program,
    ctx: &AnalysisContext,
) -> rustc_hash::FxHashSet<VarKey> {
    let mut out = rustc_hash::FxHashSet::default();
    for def in program.functions.values() {
        let Some(&last) = def.body.last() else {
            continue;
        };
        for tail in collect_tails(ast, interner, last) {
            if let Some(&key) = ctx.resolutions.get(&tail) {
                out.insert(key);
            }
        }
    }
    out
}

/// Build the region table: one region per scope, depth = scope depth.
///
/// This pass owns the region tables; clearing first keeps a re-run over
/// the same context idempotent.
fn build_regions(program: &Program, ctx: &mut AnalysisContext) {
    ctx.regions.clear();
    ctx.var_regions.clear();
    let mut depths: Vec<u32> = Vec::with_capacity(program.scopes.len());
    for (i, scope) in program.scopes.iter().enumerate() {
        let depth = match scope.parent {
            Some(p) if p.index() < i => depths[p.index()] + 1,
            _ => 0,
        };
        depths.push(depth);
        ctx.regions.push(RegionInfo {
            id: RegionId::new(u32::try_from(i).unwrap_or_else(|_| panic!("region overflow"))),
            depth,
            parent: scope.parent.map(|p| RegionId::new(p.raw())),
            members: Vec::new(),
            external_refs: 0,
            has_escaping_refs: false,
        });
    }
    let keys: Vec<VarKey> = ctx.usage.keys().copied().collect();
    for key in keys {
        let region = RegionId::new(key.scope.raw());
        if region.index() < ctx.regions.len() {
            ctx.regions[region.index()].members.push(key);
            ctx.var_regions.insert(key, region);
        }
    }
    for region in &mut ctx.regions {
        region.members.sort_by_key(|k| (k.scope, k.name.raw()));
    }
}

/// Parameter ownership from the enclosing function's summary, if the
/// binding is a parameter.
fn param_summary_ownership(
    program: &Program,
    ctx: &AnalysisContext,
    key: VarKey,
    flags: UsageFlags,
) -> Option<ParamOwnership> {
    if !flags.contains(UsageFlags::PARAMETER) {
        return None;
    }
    for def in program.functions.values() {
        if def.scope == key.scope {
            let summary = ctx.summaries.get(&def.name)?;
            return summary
                .params
                .iter()
                .find(|p| p.name == key.name)
                .map(|p| p.ownership);
        }
    }
    // Lambda parameters have no interprocedural summary; they are owned
    // by the closure invocation.
    None
}

/// Infer the shape of a binding from its initializer.
fn infer_shape(
    ast: &Ast,
    interner: &StringInterner,
    ctx: &AnalysisContext,
    init: NodeId,
) -> Shape {
    match ast.kind(init) {
        ExprKind::Int(_) | ExprKind::Float(_) | ExprKind::Char(_) => Shape::Scalar,
        ExprKind::Nil => Shape::Scalar,
        ExprKind::Symbol(name) => {
            let s = interner.lookup(name);
            if s == "true" || s == "false" {
                Shape::Scalar
            } else {
                Shape::Tree
            }
        }
        ExprKind::Cell { .. } => {
            let Some(head_name) = ast.head_symbol(init) else {
                return Shape::Tree;
            };
            let head_str = interner.lookup(head_name);
            if let Some(ty) = head_str.strip_prefix("make-") {
                let ty_name = interner.intern(ty);
                return ctx.shapes.get(&ty_name).map_or(Shape::Tree, |s| s.shape);
            }
            if SCALAR_RESULT_HEADS.contains(&head_str) {
                return Shape::Scalar;
            }
            Shape::Tree
        }
    }
}

/// Whether a binding's value is a structure with children (drives Tree vs
/// Unique free strategy).
fn has_children(ast: &Ast, program: &Program, key: VarKey) -> bool {
    program
        .binding_inits
        .get(&key)
        .is_some_and(|&init| matches!(ast.kind(init), ExprKind::Cell { .. }))
}

/// Whether a non-escaping unique binding fits the per-scope stack pool.
fn fits_stack(
    ast: &Ast,
    ctx: &AnalysisContext,
    program: &Program,
    key: VarKey,
    shape: Shape,
) -> bool {
    match shape {
        Shape::Scalar => true,
        Shape::Tree => {
            // Small constructor trees with no embedded calls fit the pool.
            let Some(&init) = program.binding_inits.get(&key) else {
                return false;
            };
            let mut cells = 0usize;
            let mut stack = vec![init];
            while let Some(node) = stack.pop() {
                match ast.kind(node) {
                    ExprKind::Cell { head, tail } => {
                        cells += 1;
                        if cells > STACK_POOL_BUDGET {
                            return false;
                        }
                        stack.push(head);
                        stack.push(tail);
                    }
                    ExprKind::Symbol(name) => {
                        // A call head other than a constructor disqualifies.
                        let s = name;
                        if ctx.summaries.contains_key(&s) {
                            return false;
                        }
                    }
                    _ => {}
                }
            }
            true
        }
        Shape::Dag | Shape::Cyclic => false,
    }
}

/// Visit every list form in every function body, global initializer, and
/// top-level expression.
fn for_each_form(ast: &Ast, program: &Program, visit: &mut dyn FnMut(NodeId)) {
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
            visit(node);
            stack.push(head);
            stack.push(tail);
        }
    }
}
