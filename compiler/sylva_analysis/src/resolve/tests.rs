use pretty_assertions::assert_eq;

use sylva_ast::StringInterner;
use sylva_diagnostic::ErrorCode;

use crate::context::{AnalysisContext, ScopeId, UsageFlags, VarKey};
use crate::resolve::resolve_unit;

fn resolve(source: &str) -> (AnalysisContext, crate::resolve::Program, StringInterner) {
    let interner = StringInterner::new();
    let ast = sylva_reader::read_unit(source, &interner).expect("read");
    let mut ctx = AnalysisContext::new();
    let program = resolve_unit(&ast, &interner, &mut ctx).expect("resolve");
    (ctx, program, interner)
}

fn resolve_err(source: &str) -> ErrorCode {
    let interner = StringInterner::new();
    let ast = sylva_reader::read_unit(source, &interner).expect("read");
    let mut ctx = AnalysisContext::new();
    resolve_unit(&ast, &interner, &mut ctx).unwrap_err().code
}

#[test]
fn let_binding_is_recorded() {
    let (ctx, _, interner) = resolve("(let ((x 1)) x)");
    let x = interner.intern("x");
    let entry = ctx
        .usage
        .iter()
        .find(|(k, _)| k.name == x)
        .map(|(_, v)| *v)
        .expect("x recorded");
    assert!(entry.flags.contains(UsageFlags::READ));
    assert!(entry.last_use > entry.def_pos);
}

#[test]
fn function_parameters_are_flagged() {
    let (ctx, program, interner) = resolve("(define (f a b) (+ a b))");
    let f = interner.intern("f");
    let def = &program.functions[&f];
    assert_eq!(def.params.len(), 2);

    let a = interner.intern("a");
    let key = VarKey::new(def.scope, a);
    assert!(ctx.usage[&key].flags.contains(UsageFlags::PARAMETER));
    assert!(ctx.usage[&key].flags.contains(UsageFlags::READ));
}

#[test]
fn unbound_symbol_is_an_error() {
    assert_eq!(resolve_err("(print y)"), ErrorCode::UnboundSymbol);
}

#[test]
fn set_on_unknown_name_is_an_error() {
    assert_eq!(resolve_err("(set! nope 1)"), ErrorCode::SetUnknownName);
}

#[test]
fn set_flags_written() {
    let (ctx, _, interner) = resolve("(let ((x 1)) (set! x 2) x)");
    let x = interner.intern("x");
    let entry = ctx
        .usage
        .iter()
        .find(|(k, _)| k.name == x)
        .map(|(_, v)| *v)
        .expect("x recorded");
    assert!(entry.flags.contains(UsageFlags::WRITTEN));
}

#[test]
fn arity_mismatch_is_an_error() {
    assert_eq!(
        resolve_err("(define (f x) x) (f 1 2)"),
        ErrorCode::ArityMismatch
    );
}

#[test]
fn recursion_resolves_through_hoisting() {
    let (_, program, interner) =
        resolve("(define (fact n) (if (< n 2) 1 (* n (fact (- n 1))))) (fact 10)");
    assert!(program.functions.contains_key(&interner.intern("fact")));
    assert_eq!(program.toplevel.len(), 1);
}

#[test]
fn lambda_captures_outer_binding() {
    let (ctx, _, interner) = resolve("(let ((x 1)) (lambda (y) (+ x y)))");
    let x = interner.intern("x");
    let (key, usage) = ctx
        .usage
        .iter()
        .find(|(k, _)| k.name == x)
        .map(|(k, v)| (*k, *v))
        .expect("x recorded");
    assert!(usage.flags.contains(UsageFlags::CAPTURED));

    let captures: Vec<_> = ctx.captures.values().flatten().collect();
    assert!(captures.contains(&&key));
}

#[test]
fn lambda_parameter_is_not_a_capture() {
    let (ctx, _, interner) = resolve("(lambda (y) y)");
    let y = interner.intern("y");
    let usage = ctx
        .usage
        .iter()
        .find(|(k, _)| k.name == y)
        .map(|(_, v)| *v)
        .expect("y recorded");
    assert!(!usage.flags.contains(UsageFlags::CAPTURED));
}

#[test]
fn spawn_body_captures_like_a_closure() {
    let (ctx, _, interner) = resolve("(let ((v 1)) (spawn (print v)))");
    let v = interner.intern("v");
    let usage = ctx
        .usage
        .iter()
        .find(|(k, _)| k.name == v)
        .map(|(_, v)| *v)
        .expect("v recorded");
    assert!(usage.flags.contains(UsageFlags::CAPTURED));
}

#[test]
fn deftype_operations_are_callable() {
    let (_, _, _) = resolve(
        "(deftype Point (x Int) (y Int))\n(let ((p (make-Point 1 2))) (print (Point-x p)))",
    );
}

#[test]
fn global_define_binds_for_later_forms() {
    let (_, program, _) = resolve("(define limit 10) (print limit)");
    assert_eq!(program.globals.len(), 1);
    assert_eq!(program.toplevel.len(), 1);
}

#[test]
fn toplevel_scope_is_scope_zero() {
    let (_, program, _) = resolve("(print 1)");
    assert_eq!(
        program.scopes[ScopeId::TOP.index()].parent,
        None
    );
}

#[test]
fn shadowing_resolves_to_innermost() {
    let (ctx, _, interner) = resolve("(let ((x 1)) (let ((x 2)) x))");
    let x = interner.intern("x");
    // Two distinct bindings of `x`; only the inner one is read.
    let reads: Vec<_> = ctx
        .usage
        .iter()
        .filter(|(k, v)| k.name == x && v.flags.contains(UsageFlags::READ))
        .collect();
    assert_eq!(reads.len(), 1);
}
