use pretty_assertions::assert_eq;

use sylva_ast::{Name, StringInterner};

use crate::borrow::infer_borrows;
use crate::context::{AnalysisContext, BorrowKind, VarKey};
use crate::resolve::resolve_unit;
use crate::shape::analyze_shapes;
use crate::summary::compute_summaries;

fn analyze(source: &str) -> (AnalysisContext, StringInterner) {
    let interner = StringInterner::new();
    let ast = sylva_reader::read_unit(source, &interner).expect("read");
    let mut ctx = AnalysisContext::new();
    let program = resolve_unit(&ast, &interner, &mut ctx).expect("resolve");
    analyze_shapes(&ast, &interner, &program, &mut ctx).expect("shapes");
    compute_summaries(&ast, &interner, &program, &mut ctx);
    crate::ownership::analyze_ownership(&ast, &interner, &program, &mut ctx).expect("ownership");
    infer_borrows(&ast, &interner, &program, &mut ctx).expect("borrows");
    (ctx, interner)
}

fn key_of(ctx: &AnalysisContext, name: Name) -> VarKey {
    *ctx.usage
        .keys()
        .find(|k| k.name == name)
        .expect("binding present")
}

#[test]
fn for_each_borrows_the_collection_with_a_tether() {
    let (ctx, interner) =
        analyze("(let ((items (list 1 2 3 4 5))) (for-each x items (print x)))");
    let items = key_of(&ctx, interner.intern("items"));
    let borrows = &ctx.borrows[&items];
    assert_eq!(borrows.len(), 1);
    let b = &borrows[0];
    assert_eq!(b.kind, BorrowKind::Loop);
    assert!(b.needs_tether);
    assert!(b.start < b.end);
    assert_eq!(b.holder, interner.intern("x"));
}

#[test]
fn map_borrows_its_collection() {
    let (ctx, interner) =
        analyze("(let ((items (list 1 2 3 4 5))) (map (lambda (x) x) items))");
    let items = key_of(&ctx, interner.intern("items"));
    assert!(ctx.borrows[&items]
        .iter()
        .any(|b| b.kind == BorrowKind::Loop && b.needs_tether));
}

#[test]
fn accessors_create_untethered_shared_borrows() {
    let (ctx, interner) = analyze("(let ((p (list 1 2 3 4 5))) (print (head p)))");
    let p = key_of(&ctx, interner.intern("p"));
    let borrows = &ctx.borrows[&p];
    assert!(borrows
        .iter()
        .all(|b| b.kind == BorrowKind::Shared && !b.needs_tether));
}

#[test]
fn fresh_collection_expressions_borrow_nothing() {
    let (ctx, _) = analyze("(for-each x (list 1 2 3) (print x))");
    assert!(ctx.borrows.is_empty());
}

#[test]
fn shared_collections_are_not_loop_borrowed() {
    // The collection is held by an atom, so it is Shared, not Local; the
    // loop must go through RC, not a tether.
    let (ctx, interner) = analyze(
        "(let ((items (list 1 2 3 4 5)))\n\
         (let ((a (atom items)))\n\
         (for-each x items (print x))))",
    );
    let items = key_of(&ctx, interner.intern("items"));
    let loop_borrows = ctx
        .borrows
        .get(&items)
        .map(|bs| bs.iter().filter(|b| b.kind == BorrowKind::Loop).count())
        .unwrap_or(0);
    assert_eq!(loop_borrows, 0);
}
