use pretty_assertions::assert_eq;

use sylva_ast::StringInterner;

use crate::cfg::{build_cfg, Cfg, CfgNodeKind};
use crate::context::AnalysisContext;
use crate::resolve::resolve_unit;

fn cfg_of(source: &str) -> (Cfg, AnalysisContext, StringInterner) {
    let interner = StringInterner::new();
    let ast = sylva_reader::read_unit(source, &interner).expect("read");
    let mut ctx = AnalysisContext::new();
    let program = resolve_unit(&ast, &interner, &mut ctx).expect("resolve");
    let cfg = build_cfg(&ast, &interner, &ctx, &[], &program.toplevel);
    (cfg, ctx, interner)
}

#[test]
fn straight_line_is_a_seq_chain() {
    let (cfg, _, _) = cfg_of("(print 1) (print 2)");
    assert_eq!(cfg.count_kind(CfgNodeKind::Entry), 1);
    assert_eq!(cfg.count_kind(CfgNodeKind::Exit), 1);
    assert_eq!(cfg.count_kind(CfgNodeKind::Return), 1);
    assert_eq!(cfg.count_kind(CfgNodeKind::Seq), 2);
    assert_eq!(cfg.count_kind(CfgNodeKind::Branch), 0);
}

#[test]
fn if_has_exactly_one_branch_and_one_join() {
    let (cfg, _, _) = cfg_of("(let ((c 1) (x 2) (y 3)) (if c x y))");
    assert_eq!(cfg.count_kind(CfgNodeKind::Branch), 1);
    assert_eq!(cfg.count_kind(CfgNodeKind::Join), 1);
}

#[test]
fn branch_fans_out_to_both_arms() {
    let (cfg, _, _) = cfg_of("(let ((c 1)) (if c 1 2))");
    let branch = cfg
        .nodes
        .iter()
        .find(|n| n.kind == CfgNodeKind::Branch)
        .expect("branch present");
    assert_eq!(branch.succs.len(), 2);
    assert_eq!(cfg.arm_roots.len(), 2);
}

#[test]
fn while_builds_header_and_backedge() {
    let (cfg, _, _) = cfg_of("(let ((n 10)) (while (> n 0) (set! n (- n 1))))");
    assert_eq!(cfg.count_kind(CfgNodeKind::LoopHeader), 1);
    assert_eq!(cfg.count_kind(CfgNodeKind::LoopBackedge), 1);

    // The backedge's only successor is the header.
    let header_id = cfg
        .nodes
        .iter()
        .position(|n| n.kind == CfgNodeKind::LoopHeader)
        .expect("header present");
    let backedge = cfg
        .nodes
        .iter()
        .find(|n| n.kind == CfgNodeKind::LoopBackedge)
        .expect("backedge present");
    assert_eq!(backedge.succs.len(), 1);
    assert_eq!(backedge.succs[0].index(), header_id);
}

#[test]
fn for_each_defines_the_loop_variable_at_the_header() {
    let (cfg, ctx, interner) = cfg_of("(let ((items (list 1 2 3))) (for-each x items (print x)))");
    let x = interner.intern("x");
    let header = cfg
        .nodes
        .iter()
        .find(|n| n.kind == CfgNodeKind::LoopHeader)
        .expect("header present");
    assert!(header.defs.iter().any(|k| k.name == x));
    // The collection is a use at the header.
    let items_key = ctx
        .usage
        .keys()
        .find(|k| k.name == interner.intern("items"))
        .copied()
        .expect("items bound");
    assert!(header.uses.contains(&items_key));
}

#[test]
fn map_models_an_internal_loop() {
    let (cfg, _, _) = cfg_of("(let ((items (list 1 2))) (map (lambda (x) x) items))");
    assert_eq!(cfg.count_kind(CfgNodeKind::LoopHeader), 1);
    assert_eq!(cfg.count_kind(CfgNodeKind::LoopBackedge), 1);
}

#[test]
fn postorder_covers_all_reachable_nodes() {
    let (cfg, _, _) = cfg_of("(let ((c 1)) (if c (print 1) (print 2)) (print 3))");
    let order = cfg.postorder();
    assert_eq!(order.len(), cfg.nodes.len());
}

#[test]
fn predecessors_mirror_successors() {
    let (cfg, _, _) = cfg_of("(let ((c 1)) (if c 1 2))");
    let preds = cfg.predecessors();
    for (i, node) in cfg.nodes.iter().enumerate() {
        for succ in &node.succs {
            assert!(preds[succ.index()].iter().any(|p| p.index() == i));
        }
    }
}
