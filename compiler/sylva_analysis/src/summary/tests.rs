use pretty_assertions::assert_eq;

use sylva_ast::StringInterner;

use crate::context::{AnalysisContext, ParamOwnership, ReturnOwnership};
use crate::resolve::resolve_unit;
use crate::shape::analyze_shapes;
use crate::summary::compute_summaries;

fn summarize(source: &str) -> (AnalysisContext, StringInterner) {
    let interner = StringInterner::new();
    let ast = sylva_reader::read_unit(source, &interner).expect("read");
    let mut ctx = AnalysisContext::new();
    let program = resolve_unit(&ast, &interner, &mut ctx).expect("resolve");
    analyze_shapes(&ast, &interner, &program, &mut ctx).expect("shapes");
    compute_summaries(&ast, &interner, &program, &mut ctx);
    (ctx, interner)
}

#[test]
fn identity_is_passthrough() {
    let (ctx, interner) = summarize("(define (identity x) x)");
    let summary = &ctx.summaries[&interner.intern("identity")];
    assert_eq!(summary.params[0].ownership, ParamOwnership::Passthrough);
    assert_eq!(summary.return_ownership, ReturnOwnership::Passthrough);
    assert_eq!(summary.return_param_index, Some(0));
    assert!(!summary.caller_should_free_arg(0));
}

#[test]
fn passthrough_through_nested_if() {
    let (ctx, interner) = summarize("(define (pick c x) (if c x x))");
    let summary = &ctx.summaries[&interner.intern("pick")];
    assert_eq!(summary.params[1].ownership, ParamOwnership::Passthrough);
    assert_eq!(summary.return_param_index, Some(1));
}

#[test]
fn unused_parameter_is_borrowed() {
    let (ctx, interner) = summarize("(define (fst a b) a)");
    let summary = &ctx.summaries[&interner.intern("fst")];
    assert_eq!(summary.params[1].ownership, ParamOwnership::Borrowed);
    assert!(summary.caller_should_free_arg(1));
}

#[test]
fn constructor_return_is_fresh_and_allocates() {
    let (ctx, interner) = summarize("(define (pair a b) (cons a b))");
    let summary = &ctx.summaries[&interner.intern("pair")];
    assert_eq!(summary.return_ownership, ReturnOwnership::Fresh);
    assert!(summary.allocates);
    // Arguments stored into the fresh pair are retained past the call.
    assert_eq!(summary.params[0].ownership, ParamOwnership::Captured);
}

#[test]
fn accessor_return_is_borrowed() {
    let (ctx, interner) = summarize("(define (first p) (head p))");
    let summary = &ctx.summaries[&interner.intern("first")];
    assert_eq!(summary.return_ownership, ReturnOwnership::Borrowed);
    assert!(!summary.allocates);
}

#[test]
fn field_accessor_return_is_borrowed() {
    let (ctx, interner) = summarize(
        "(deftype Point (x Int) (y Int))\n(define (get-x p) (Point-x p))",
    );
    let summary = &ctx.summaries[&interner.intern("get-x")];
    assert_eq!(summary.return_ownership, ReturnOwnership::Borrowed);
}

#[test]
fn print_only_body_is_effectful_with_no_owned_return() {
    let (ctx, interner) = summarize("(define (show x) (print x))");
    let summary = &ctx.summaries[&interner.intern("show")];
    assert!(summary.has_side_effects);
    assert_eq!(summary.return_ownership, ReturnOwnership::None);
}

#[test]
fn effects_propagate_through_calls() {
    let (ctx, interner) = summarize("(define (show x) (print x))\n(define (wrap x) (show x))");
    assert!(ctx.summaries[&interner.intern("wrap")].has_side_effects);
}

#[test]
fn channel_send_consumes_parameter() {
    let (ctx, interner) = summarize("(define (ship ch v) (send! ch v))");
    let summary = &ctx.summaries[&interner.intern("ship")];
    assert_eq!(summary.params[1].ownership, ParamOwnership::Consumed);
    assert!(summary.has_side_effects);
}

#[test]
fn consumption_propagates_transitively() {
    let (ctx, interner) = summarize(
        "(define (ship ch v) (send! ch v))\n(define (relay ch v) (ship ch v))",
    );
    let summary = &ctx.summaries[&interner.intern("relay")];
    assert_eq!(summary.params[1].ownership, ParamOwnership::Consumed);
}

#[test]
fn capture_by_closure_marks_captured() {
    let (ctx, interner) = summarize("(define (adder n) (lambda (x) (+ x n)))");
    let summary = &ctx.summaries[&interner.intern("adder")];
    assert_eq!(summary.params[0].ownership, ParamOwnership::Captured);
    assert!(summary.allocates);
}

#[test]
fn recursive_function_converges() {
    let (ctx, interner) =
        summarize("(define (fact n) (if (< n 2) 1 (* n (fact (- n 1)))))");
    let summary = &ctx.summaries[&interner.intern("fact")];
    assert_eq!(summary.return_ownership, ReturnOwnership::Fresh);
    assert!(!summary.has_side_effects);
    assert!(!summary.allocates);
}
