//! Reference-count elision.
//!
//! Picks, per variable, which RC operations codegen may drop:
//!
//! - `ElideBoth` — unique values and stack-pooled values: nobody else can
//!   observe the count.
//! - `ElideDec` — arena/pool values: reclaimed in bulk, decrements are
//!   dead work.
//! - `ElideInc` — borrowed values: the caller's reference outlives every
//!   use here.
//! - `Required` — everything else.
//!
//! Codegen gates every inc/dec macro expansion on this table; where the
//! concurrency table says Shared, the surviving operations become their
//! atomic variants.

use crate::context::{AllocStrategy, AnalysisContext, RcElision, VarOwnership};

/// Assign an elision class to every variable in the owner table.
pub fn assign_elisions(ctx: &mut AnalysisContext) {
    ctx.elisions.clear();

    let keys: Vec<_> = ctx.owners.keys().copied().collect();
    for key in keys {
        let owner = ctx.owners[&key];
        let class = if owner.is_unique || owner.alloc == AllocStrategy::Stack {
            RcElision::ElideBoth
        } else if matches!(owner.alloc, AllocStrategy::Arena | AllocStrategy::Pool) {
            RcElision::ElideDec
        } else if owner.ownership == VarOwnership::Borrowed {
            RcElision::ElideInc
        } else {
            RcElision::Required
        };
        ctx.elisions.insert(key, class);
    }

    tracing::debug!(vars = ctx.elisions.len(), "rc elision assigned");
}

/// Whether an increment may be skipped for a variable.
pub fn can_elide_inc_ref(ctx: &AnalysisContext, key: crate::context::VarKey) -> bool {
    matches!(
        ctx.elision(key),
        RcElision::ElideInc | RcElision::ElideBoth
    )
}

/// Whether a decrement may be skipped for a variable.
pub fn can_elide_dec_ref(ctx: &AnalysisContext, key: crate::context::VarKey) -> bool {
    matches!(
        ctx.elision(key),
        RcElision::ElideDec | RcElision::ElideBoth
    )
}
