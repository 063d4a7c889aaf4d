use pretty_assertions::assert_eq;

use sylva_ast::{Name, StringInterner};

use crate::concurrency::analyze_concurrency;
use crate::context::{AnalysisContext, ThreadLocality, VarKey};
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
    analyze_concurrency(&ast, &interner, &program, &mut ctx);
    (ctx, interner)
}

fn key_of(ctx: &AnalysisContext, name: Name) -> VarKey {
    *ctx.usage
        .keys()
        .find(|k| k.name == name)
        .expect("binding present")
}

#[test]
fn default_locality_is_local() {
    let (ctx, interner) = analyze("(let ((x (list 1 2 3 4 5))) (print (head x)))");
    let x = key_of(&ctx, interner.intern("x"));
    assert_eq!(ctx.thread_locality(x), ThreadLocality::Local);
}

#[test]
fn spawn_captures_promote_to_shared() {
    let (ctx, interner) = analyze("(let ((v (list 1 2 3 4 5))) (spawn (print (head v))))");
    let v = key_of(&ctx, interner.intern("v"));
    assert_eq!(ctx.thread_locality(v), ThreadLocality::Shared);
    assert_eq!(ctx.spawns.len(), 1);
    assert!(ctx.spawns[0].captures.contains(&v));
}

#[test]
fn send_at_last_use_transfers() {
    let (ctx, interner) = analyze("(let ((ch (chan 1)) (v (list 1 2 3 4 5))) (send! ch v))");
    let v = key_of(&ctx, interner.intern("v"));
    assert_eq!(ctx.thread_locality(v), ThreadLocality::Transferred);
    assert_eq!(ctx.channel_transfers.len(), 1);
    assert!(ctx.channel_transfers.values().all(|&t| t));
}

#[test]
fn send_of_retained_value_does_not_transfer() {
    let (ctx, interner) = analyze(
        "(let ((ch (chan 1)) (v (list 1 2 3 4 5)))\n\
         (send! ch v)\n\
         (print (head v)))",
    );
    let v = key_of(&ctx, interner.intern("v"));
    assert_ne!(ctx.thread_locality(v), ThreadLocality::Transferred);
    assert!(ctx.channel_transfers.values().all(|&t| !t));
}

#[test]
fn fresh_send_payload_transfers() {
    let (ctx, _) = analyze("(let ((ch (chan 1))) (send! ch (list 1 2 3)))");
    assert!(ctx.channel_transfers.values().all(|&t| t));
}

#[test]
fn atom_value_is_shared() {
    let (ctx, interner) = analyze("(let ((v (list 1 2 3 4 5))) (let ((a (atom v))) a))");
    let v = key_of(&ctx, interner.intern("v"));
    assert_eq!(ctx.thread_locality(v), ThreadLocality::Shared);
}

#[test]
fn frozen_value_is_immutable() {
    let (ctx, interner) = analyze("(let ((v (list 1 2 3 4 5))) (freeze v) (print (head v)))");
    let v = key_of(&ctx, interner.intern("v"));
    assert_eq!(ctx.thread_locality(v), ThreadLocality::Immutable);
}
