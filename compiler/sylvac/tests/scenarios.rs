//! End-to-end driver tests: literal programs through read → analyze →
//! codegen, with the facts and the emitted C both checked.

use pretty_assertions::assert_eq;

use sylva_analysis::{
    analyze_unit, AllocStrategy, BorrowKind, CfgNodeKind, FreeStrategy, Shape, VarOwnership,
};
use sylva_ast::StringInterner;
use sylvac::{check_unit, compile_unit, UnitOutcome};

fn compile(source: &str) -> String {
    match compile_unit(source) {
        UnitOutcome::Code(code) => code,
        UnitOutcome::Failed(diag) => panic!("compilation failed: {diag:?}"),
    }
}

/// `(let ((x 1)) x)` — unique scalar local on the stack, program result 1.
#[test]
fn scenario_simple_let() {
    let source = "(let ((x 1)) x)";

    let interner = StringInterner::new();
    let ast = sylva_reader::read_unit(source, &interner).expect("read");
    let unit = analyze_unit(&ast, &interner).expect("analyze");
    let x = *unit
        .ctx
        .usage
        .keys()
        .find(|k| k.name == interner.intern("x"))
        .expect("x bound");
    let owner = &unit.ctx.owners[&x];
    assert_eq!(owner.ownership, VarOwnership::Local);
    assert!(owner.is_unique);
    assert_eq!(owner.alloc, AllocStrategy::Stack);
    assert!(matches!(
        owner.free,
        FreeStrategy::Unique | FreeStrategy::Tree
    ));

    let code = compile(source);
    assert!(code.contains("syl_print_result("));
    assert!(code.contains("syl_from_fixnum(INT64_C(1))"));
}

/// `(if cond x y)` — one Branch, one Join; per-arm liveness.
#[test]
fn scenario_if_cfg() {
    let interner = StringInterner::new();
    let ast = sylva_reader::read_unit(
        "(let ((cond 1) (x 2) (y 3)) (if cond x y))",
        &interner,
    )
    .expect("read");
    let unit = analyze_unit(&ast, &interner).expect("analyze");

    let cfg = sylva_analysis::build_cfg(&ast, &interner, &unit.ctx, &[], &unit.program.toplevel);
    assert_eq!(cfg.count_kind(CfgNodeKind::Branch), 1);
    assert_eq!(cfg.count_kind(CfgNodeKind::Join), 1);
}

/// `(deftype DLNode ...)` — Cyclic with `prev` as the back edge.
#[test]
fn scenario_dlnode_shape() {
    let interner = StringInterner::new();
    let ast = sylva_reader::read_unit(
        "(deftype DLNode (data Int) (next DLNode) (prev DLNode))\n(print 0)",
        &interner,
    )
    .expect("read");
    let unit = analyze_unit(&ast, &interner).expect("analyze");

    let info = &unit.ctx.shapes[&interner.intern("DLNode")];
    assert_eq!(info.shape, Shape::Cyclic);
    assert!(info.is_cyclic);
    assert_eq!(info.back_edge_fields, vec![interner.intern("prev")]);
}

/// `(define (identity x) x)` — passthrough parameter, caller keeps
/// ownership.
#[test]
fn scenario_identity_passthrough() {
    let interner = StringInterner::new();
    let ast =
        sylva_reader::read_unit("(define (identity x) x)\n(print (identity 1))", &interner)
            .expect("read");
    let unit = analyze_unit(&ast, &interner).expect("analyze");

    let summary = &unit.ctx.summaries[&interner.intern("identity")];
    assert_eq!(
        summary.params[0].ownership,
        sylva_analysis::ParamOwnership::Passthrough
    );
    assert_eq!(
        summary.return_ownership,
        sylva_analysis::ReturnOwnership::Passthrough
    );
    assert_eq!(summary.return_param_index, Some(0));
    assert!(!summary.caller_should_free_arg(0));
}

/// `(for-each x items (print x))` — loop borrow with a tether, acquire
/// and release around the loop.
#[test]
fn scenario_for_each_tether() {
    let source = "(let ((items (list 1 2 3 4 5))) (for-each x items (print x)))";

    let interner = StringInterner::new();
    let ast = sylva_reader::read_unit(source, &interner).expect("read");
    let unit = analyze_unit(&ast, &interner).expect("analyze");
    let items = *unit
        .ctx
        .usage
        .keys()
        .find(|k| k.name == interner.intern("items"))
        .expect("items bound");
    let borrows = &unit.ctx.borrows[&items];
    let loop_borrow = borrows
        .iter()
        .find(|b| b.kind == BorrowKind::Loop)
        .expect("loop borrow recorded");
    assert!(loop_borrow.needs_tether);
    assert!(loop_borrow.start < loop_borrow.end);

    let code = compile(source);
    let acquire = code.find("syl_tether_acquire(syl_items_s1);").expect("acquire");
    let release = code.find("syl_tether_release(syl_items_s1);").expect("release");
    assert!(acquire < release);
}

/// `(fact 10)` — the factorial program compiles with a recursion-only
/// heap profile (no allocation in the hot path).
#[test]
fn scenario_factorial() {
    let source = "(define (fact n) (if (< n 2) 1 (* n (fact (- n 1))))) (fact 10)";
    let code = compile(source);

    assert!(code.contains("static syl_value syl_fact("));
    assert!(code.contains("syl_print_result("));
    // The body is pure arithmetic over immediates: no constructor calls
    // inside the generated function.
    let body_start = code.find("static syl_value syl_fact(").expect("fact emitted");
    let body_end = code[body_start..].find("\n}").expect("fact closes") + body_start;
    let body = &code[body_start..body_end];
    assert!(!body.contains("syl_mk_pair"));
    assert!(!body.contains("syl_mk_user"));
}

/// Channel scenario: sender transfers a fresh value, no sender-side RC,
/// receiver inherits the sole reference.
#[test]
fn scenario_channel_transfer() {
    let source = "(let ((ch (chan 1)) (v (list 1 2 3 4 5)))\n\
                  (spawn (send! ch v))\n\
                  (print (head (recv! ch))))";

    let interner = StringInterner::new();
    let ast = sylva_reader::read_unit(source, &interner).expect("read");
    let unit = analyze_unit(&ast, &interner).expect("analyze");
    let v = *unit
        .ctx
        .usage
        .keys()
        .find(|k| k.name == interner.intern("v"))
        .expect("v bound");
    let owner = &unit.ctx.owners[&v];
    assert_eq!(owner.ownership, VarOwnership::Transferred);
    assert!(!owner.must_free);

    let code = compile(source);
    assert!(code.contains("syl_channel_send("));
    assert!(code.contains("syl_channel_recv("));
    assert!(code.contains("syl_spawn_thread("));
    // No sender-side decrement of the transferred value.
    assert!(!code.contains("syl_dec_ref(syl_v_s1)"));
    assert!(!code.contains("syl_free_tree(syl_v_s1)"));
}

#[test]
fn check_reports_first_unit_error() {
    let diag = check_unit("(print (+ x 1))").expect("unbound symbol");
    assert_eq!(diag.code, sylva_diagnostic::ErrorCode::UnboundSymbol);
    assert!(check_unit("(print (+ 1 1))").is_none());
}

#[test]
fn malformed_input_fails_at_the_reader() {
    let diag = check_unit("(print 1").expect("unbalanced");
    assert_eq!(diag.code, sylva_diagnostic::ErrorCode::UnbalancedDelimiter);
}

#[test]
fn emitted_unit_is_self_contained() {
    let code = compile("(print 1)");
    // One translation unit: runtime types, implementation, and program.
    assert!(code.contains("SYLVA_RT_H"));
    assert!(code.contains("pthread_mutex_lock"));
    assert!(code.contains("int main(void)"));
    // No external includes beyond the standard library and pthreads.
    assert!(!code.contains("#include \"sylva_rt.h\""));
}

#[test]
fn distinct_units_are_independent() {
    // One failing unit does not poison another.
    assert!(check_unit("(print nope)").is_some());
    assert!(check_unit("(print 1)").is_none());
}

/// The analysis is deterministic end to end: two compilations of the
/// same source produce identical C.
#[test]
fn codegen_is_deterministic() {
    let source = "(define (id x) x)\n\
                  (let ((p (list 1 2 3 4 5)) (c 1))\n\
                  (if c (print (head p)) (print 0)))";
    assert_eq!(compile(source), compile(source));
}

/// `VarKey`-scoped names keep shadowed bindings apart in the output.
#[test]
fn shadowed_bindings_get_distinct_c_names() {
    let code = compile("(let ((x 1)) (let ((x 2)) (print x)))");
    assert!(code.contains("syl_x_s1"));
    assert!(code.contains("syl_x_s2"));
}
