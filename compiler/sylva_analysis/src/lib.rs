//! Static memory-management analyses for the Sylva compiler.
//!
//! This crate provides:
//!
//! - **[`AnalysisContext`]** — the per-compilation registry every pass
//!   appends its facts to (usage, owner, escape, shape, summary, region,
//!   borrow, reuse, RC-elision, and concurrency tables).
//! - **The pass pipeline** ([`analyze_unit`]) — resolution, type shapes,
//!   interprocedural summaries, ownership & escape, CFG + liveness +
//!   free points, borrow inference, RC elision, constructor reuse, and
//!   concurrency classification, in that order.
//!
//! Codegen consumes the finished context: every variable it emits has a
//! decided allocation strategy, free strategy, free points, elision
//! class, and thread locality. Nothing is decided at runtime.
//!
//! # Design
//!
//! The pass structure follows the reference-counting compilers that
//! pioneered static RC placement: liveness-driven release points, borrow
//! inference so read-only flows skip RC entirely, and free/alloc pairing
//! for in-place constructor reuse. Passes communicate only through the
//! context; each table is append-only while its producing pass runs and
//! read-only afterwards.

pub mod borrow;
pub mod cfg;
pub mod concurrency;
pub mod context;
pub mod liveness;
pub mod ownership;
pub mod rc_elim;
pub mod resolve;
pub mod reuse;
pub mod shape;
pub mod summary;

pub use borrow::infer_borrows;
pub use cfg::{build_cfg, Cfg, CfgNode, CfgNodeId, CfgNodeKind};
pub use concurrency::analyze_concurrency;
pub use context::{
    AllocStrategy, AnalysisContext, BorrowInfo, BorrowKind, EscapeClass, EscapeInfo, FieldInfo,
    FnSummary, FreeStrategy, OwnerInfo, ParamOwnership, ParamSummary, RcElision, RegionId,
    RegionInfo, ReturnOwnership, ReuseCandidate, ScopeId, Shape, ShapeInfo, SizeClass, SpawnSite,
    ThreadLocality, UsageFlags, UsageInfo, VarKey, VarOwnership,
};
pub use liveness::{compute_free_points, compute_liveness, LiveSet, Liveness};
pub use ownership::analyze_ownership;
pub use rc_elim::{assign_elisions, can_elide_dec_ref, can_elide_inc_ref};
pub use resolve::{head_form, resolve_unit, FnDef, GlobalDef, Program};
pub use reuse::detect_reuse;
pub use shape::{analyze_shapes, is_back_edge_field, BACK_EDGE_PATTERNS};
pub use summary::compute_summaries;

use sylva_ast::{Ast, StringInterner};
use sylva_diagnostic::{Diagnostic, ErrorCode};

/// A fully analyzed compilation unit, ready for codegen.
pub struct AnalyzedUnit {
    pub program: Program,
    pub ctx: AnalysisContext,
}

/// Run the full analysis pipeline over one unit.
///
/// Aborts on the first diagnostic (the driver continues with other
/// units). A successful return guarantees the cross-table invariants
/// hold — codegen may panic on anything inconsistent it still finds.
pub fn analyze_unit(ast: &Ast, interner: &StringInterner) -> Result<AnalyzedUnit, Diagnostic> {
    let mut ctx = AnalysisContext::new();

    let program = resolve_unit(ast, interner, &mut ctx)?;
    analyze_shapes(ast, interner, &program, &mut ctx)?;
    compute_summaries(ast, interner, &program, &mut ctx);
    analyze_ownership(ast, interner, &program, &mut ctx)?;

    // CFG + liveness per function body, then the top-level sequence.
    ctx.frees_after.clear();
    ctx.frees_on_entry.clear();
    ctx.frees_else.clear();
    let mut fn_names: Vec<_> = program.fn_order.clone();
    fn_names.sort_by_key(|n| n.raw());
    for name in fn_names {
        let def = &program.functions[&name];
        let params: Vec<VarKey> = def
            .params
            .iter()
            .map(|&p| VarKey::new(def.scope, p))
            .collect();
        let cfg = build_cfg(ast, interner, &ctx, &params, &def.body);
        let liveness = compute_liveness(&cfg);
        compute_free_points(ast, &cfg, &liveness, &mut ctx);
    }
    if !program.toplevel.is_empty() {
        let cfg = build_cfg(ast, interner, &ctx, &[], &program.toplevel);
        let liveness = compute_liveness(&cfg);
        compute_free_points(ast, &cfg, &liveness, &mut ctx);
    }

    // Closure bodies (`lambda` / `spawn`) are their own control-flow
    // units: their internal bindings free inside the closure, not in the
    // enclosing function.
    let mut closures: Vec<_> = program.lambda_scopes.iter().map(|(&n, &s)| (n, s)).collect();
    closures.sort_by_key(|&(node, _)| ast.pos(node));
    for (node, scope) in closures {
        let params: Vec<VarKey> = ctx
            .usage
            .iter()
            .filter(|(k, u)| k.scope == scope && u.flags.contains(UsageFlags::PARAMETER))
            .map(|(&k, _)| k)
            .collect();
        let items = ast.list_items(node);
        let body_start = match head_form(ast, interner, node) {
            Some(sylva_ast::SpecialForm::Lambda) => 2,
            _ => 1, // spawn
        };
        if items.len() > body_start {
            let cfg = build_cfg(ast, interner, &ctx, &params, &items[body_start..]);
            let liveness = compute_liveness(&cfg);
            compute_free_points(ast, &cfg, &liveness, &mut ctx);
        }
    }

    // Bindings with a free obligation but no computed free point (a
    // global nobody reads) release with the unit epilogue at their last
    // recorded position.
    let unanchored: Vec<VarKey> = ctx
        .owners
        .iter()
        .filter(|(_, o)| o.must_free && o.free_pos.is_none())
        .map(|(&k, _)| k)
        .collect();
    for key in unanchored {
        let last_use = ctx.usage.get(&key).map(|u| u.last_use);
        if let Some(owner) = ctx.owners.get_mut(&key) {
            owner.free_pos = last_use;
        }
    }

    infer_borrows(ast, interner, &program, &mut ctx)?;
    assign_elisions(&mut ctx);
    detect_reuse(ast, interner, &program, &mut ctx);
    analyze_concurrency(ast, interner, &program, &mut ctx);

    if let Some(problem) = ctx.validate().into_iter().next() {
        debug_assert_eq!(problem.code, ErrorCode::InternalInvariant);
        return Err(problem);
    }

    Ok(AnalyzedUnit { program, ctx })
}

#[cfg(test)]
mod tests;
