//! Backward dataflow liveness and free-point placement.
//!
//! Standard backward liveness over the [`Cfg`](crate::cfg::Cfg):
//!
//! 1. Per node, `gen` = variables used, `kill` = variables defined.
//! 2. Postorder fixpoint:
//!    - `live_out(n) = ∪ live_in(s)` over successors `s`;
//!    - `live_in(n) = gen(n) ∪ (live_out(n) − kill(n))`.
//!
//! A **free point** for `v` is a node where `v ∈ live_in` and
//! `v ∉ live_out` — the earliest provably safe release point. On
//! branching control flow the per-edge liveness gap produces distinct
//! frees per branch, so neither path over-retains. Loop-local values die
//! at the backedge and free once per iteration; values live across the
//! loop free after it.
//!
//! Free points are written to the emission tables (`frees_after`,
//! `frees_on_entry`) keyed by AST node, and each freed variable's
//! earliest free position lands in its owner record.

use rustc_hash::FxHashSet;

use sylva_ast::{Ast, NodeId};

use crate::cfg::{Cfg, CfgNodeKind};
use crate::context::{AnalysisContext, VarKey};

/// Set of live variables at a program point.
pub type LiveSet = FxHashSet<VarKey>;

/// Liveness information for every CFG node.
pub struct Liveness {
    /// Variables live at node entry, indexed by `CfgNodeId::index()`.
    pub live_in: Vec<LiveSet>,
    /// Variables live at node exit, indexed by `CfgNodeId::index()`.
    pub live_out: Vec<LiveSet>,
}

/// Compute liveness for all nodes of a CFG.
pub fn compute_liveness(cfg: &Cfg) -> Liveness {
    let n = cfg.nodes.len();
    let postorder = cfg.postorder();

    let mut live_in: Vec<LiveSet> = (0..n).map(|_| LiveSet::default()).collect();
    let mut live_out: Vec<LiveSet> = (0..n).map(|_| LiveSet::default()).collect();

    let mut iterations = 0u32;
    loop {
        iterations += 1;
        let mut changed = false;

        for &id in &postorder {
            let idx = id.index();
            let node = &cfg.nodes[idx];

            let mut new_out = LiveSet::default();
            for succ in &node.succs {
                for &var in &live_in[succ.index()] {
                    new_out.insert(var);
                }
            }

            let mut new_in: LiveSet = node.uses.iter().copied().collect();
            for &var in &new_out {
                if !node.defs.contains(&var) {
                    new_in.insert(var);
                }
            }

            if new_in != live_in[idx] || new_out != live_out[idx] {
                live_in[idx] = new_in;
                live_out[idx] = new_out;
                changed = true;
            }
        }

        if !changed {
            break;
        }
    }

    tracing::debug!(nodes = n, iterations, "liveness converged");

    Liveness { live_in, live_out }
}

/// Derive free points from liveness and record them in the context.
///
/// Only variables whose owner record says `must_free` receive free
/// points. Whether the release is a direct free, a structural free, or an
/// (atomic) decrement is the free strategy's concern, not placement's.
pub fn compute_free_points(ast: &Ast, cfg: &Cfg, liveness: &Liveness, ctx: &mut AnalysisContext) {
    let record_after = |ctx: &mut AnalysisContext, anchor: NodeId, var: VarKey| {
        let list = ctx.frees_after.entry(anchor).or_default();
        if !list.contains(&var) {
            list.push(var);
        }
        update_free_pos(ast, ctx, var, anchor);
    };
    let record_on_entry = |ctx: &mut AnalysisContext, anchor: NodeId, var: VarKey| {
        let list = ctx.frees_on_entry.entry(anchor).or_default();
        if !list.contains(&var) {
            list.push(var);
        }
        update_free_pos(ast, ctx, var, anchor);
    };
    let record_else = |ctx: &mut AnalysisContext, anchor: NodeId, var: VarKey| {
        let list = ctx.frees_else.entry(anchor).or_default();
        if !list.contains(&var) {
            list.push(var);
        }
        update_free_pos(ast, ctx, var, anchor);
    };

    for (idx, node) in cfg.nodes.iter().enumerate() {
        // Node kills: used here, dead afterwards.
        for &var in &liveness.live_in[idx] {
            if liveness.live_out[idx].contains(&var) || !node.uses.contains(&var) {
                continue;
            }
            if !must_free(ctx, var) {
                continue;
            }
            if let Some(anchor) = node.node {
                record_after(ctx, anchor, var);
            }
        }

        // Dead definitions: bound and never read.
        for &var in &node.defs {
            if liveness.live_out[idx].contains(&var) || !must_free(ctx, var) {
                continue;
            }
            if let Some(anchor) = node.node {
                record_after(ctx, anchor, var);
            }
        }

        // Edge gaps at forks: live out of the fork, dead on one path.
        if node.succs.len() < 2 {
            continue;
        }
        for &succ in &node.succs {
            let gap: Vec<VarKey> = liveness.live_out[idx]
                .iter()
                .copied()
                .filter(|v| !liveness.live_in[succ.index()].contains(v) && must_free(ctx, *v))
                .collect();
            if gap.is_empty() {
                continue;
            }
            let succ_node = &cfg.nodes[succ.index()];
            for var in gap {
                if let Some(&arm) = cfg.arm_roots.get(&succ) {
                    // Top of an explicit branch arm.
                    record_on_entry(ctx, arm, var);
                } else if matches!(succ_node.kind, CfgNodeKind::Return | CfgNodeKind::Exit) {
                    // The fork statement is the last one; free after it.
                    if let Some(anchor) = node.node {
                        record_after(ctx, anchor, var);
                    }
                } else if node.kind == CfgNodeKind::Branch {
                    // Missing else arm: key the free by the `if` node
                    // itself; codegen materializes the arm.
                    if let Some(anchor) = node.node {
                        record_else(ctx, anchor, var);
                    }
                } else if let Some(anchor) = succ_node.node {
                    // Loop exit into the following statement.
                    record_on_entry(ctx, anchor, var);
                }
            }
        }
    }
}

fn must_free(ctx: &AnalysisContext, var: VarKey) -> bool {
    ctx.owners.get(&var).is_some_and(|o| o.must_free)
}

fn update_free_pos(ast: &Ast, ctx: &mut AnalysisContext, var: VarKey, anchor: NodeId) {
    let pos = ast.pos(anchor);
    if let Some(owner) = ctx.owners.get_mut(&var) {
        match owner.free_pos {
            Some(existing) if existing <= pos => {}
            _ => owner.free_pos = Some(pos),
        }
    }
}
