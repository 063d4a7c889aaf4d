//! Pipeline-level tests: whole programs through every pass.

use pretty_assertions::assert_eq;

use sylva_ast::{Name, StringInterner};

use crate::{
    analyze_unit, AllocStrategy, AnalyzedUnit, FreeStrategy, RcElision, Shape, ThreadLocality,
    VarKey, VarOwnership,
};

fn analyze(source: &str) -> (AnalyzedUnit, StringInterner) {
    let interner = StringInterner::new();
    let ast = sylva_reader::read_unit(source, &interner).expect("read");
    let unit = analyze_unit(&ast, &interner).expect("analyze");
    (unit, interner)
}

fn key_of(unit: &AnalyzedUnit, name: Name) -> VarKey {
    *unit
        .ctx
        .usage
        .keys()
        .find(|k| k.name == name)
        .expect("binding present")
}

#[test]
fn simple_let_scalar() {
    let (unit, interner) = analyze("(let ((x 1)) x)");
    let x = key_of(&unit, interner.intern("x"));
    let owner = &unit.ctx.owners[&x];
    assert_eq!(owner.ownership, VarOwnership::Local);
    assert!(owner.is_unique);
    assert_eq!(owner.alloc, AllocStrategy::Stack);
    assert!(matches!(
        owner.free,
        FreeStrategy::Unique | FreeStrategy::Tree
    ));
}

#[test]
fn every_binding_has_owner_and_strategy() {
    let (unit, _) = analyze(
        "(define (twice f x) (f (f x)))\n\
         (let ((p (list 1 2 3 4 5)) (n 7))\n\
         (print (head p))\n\
         (print n))",
    );
    for key in unit.ctx.usage.keys() {
        let owner = unit.ctx.owners.get(key).expect("owner decided");
        // Free strategy and allocation are always decided.
        let _ = owner.free;
        let _ = owner.alloc;
        // Elision is always decided.
        let _ = unit.ctx.elision(*key);
    }
}

#[test]
fn factorial_program_analyzes_clean() {
    let (unit, interner) =
        analyze("(define (fact n) (if (< n 2) 1 (* n (fact (- n 1))))) (fact 10)");
    let fact = interner.intern("fact");
    let summary = &unit.ctx.summaries[&fact];
    assert!(!summary.has_side_effects);
    assert!(!summary.allocates);
}

#[test]
fn channel_transfer_scenario() {
    // Sender transfers a fresh value; the sender's post-send decrement is
    // elided (no free obligation) and the receiver inherits ownership.
    let (unit, interner) = analyze(
        "(let ((ch (chan 1)) (v (list 1 2 3 4 5)))\n\
         (spawn (send! ch v))\n\
         (print (head (recv! ch))))",
    );
    let v = key_of(&unit, interner.intern("v"));
    let owner = &unit.ctx.owners[&v];
    assert_eq!(owner.ownership, VarOwnership::Transferred);
    assert!(!owner.must_free);
    assert_eq!(unit.ctx.thread_locality(v), ThreadLocality::Transferred);
}

#[test]
fn borrowed_param_elides_and_never_frees() {
    let (unit, interner) = analyze(
        "(define (sum p) (if (null? p) 0 (+ (head p) (sum (tail p)))))\n\
         (let ((items (list 1 2 3 4 5))) (print (sum items)))",
    );
    let p_key = *unit
        .ctx
        .usage
        .iter()
        .find(|(k, u)| {
            k.name == interner.intern("p")
                && u.flags.contains(crate::UsageFlags::PARAMETER)
        })
        .map(|(k, _)| k)
        .expect("param bound");
    let owner = &unit.ctx.owners[&p_key];
    assert_eq!(owner.ownership, VarOwnership::Borrowed);
    assert_eq!(owner.free, FreeStrategy::None);
    assert_ne!(unit.ctx.elision(p_key), RcElision::Required);
}

#[test]
fn dlnode_is_cyclic_with_prev_back_edge() {
    let (unit, interner) =
        analyze("(deftype DLNode (data Int) (next DLNode) (prev DLNode))\n(print 0)");
    let info = &unit.ctx.shapes[&interner.intern("DLNode")];
    assert_eq!(info.shape, Shape::Cyclic);
    assert_eq!(info.back_edge_fields, vec![interner.intern("prev")]);
}

#[test]
fn analysis_is_idempotent() {
    // Running the pipeline twice over the same source produces identical
    // facts.
    let source = "(define (id x) x)\n\
                  (deftype Quad (a Int) (b Int) (c Int) (d Int))\n\
                  (let ((p (make-Quad 1 2 3 4)) (c 1))\n\
                  (if c (print (Quad-a p)) (print (Quad-b p)))\n\
                  (for-each x (list 1 2 3) (print x)))";
    let interner = StringInterner::new();
    let ast = sylva_reader::read_unit(source, &interner).expect("read");
    let first = analyze_unit(&ast, &interner).expect("analyze");
    let second = analyze_unit(&ast, &interner).expect("analyze");
    assert_eq!(
        first.ctx.facts_fingerprint(),
        second.ctx.facts_fingerprint()
    );
}

#[test]
fn validate_passes_on_clean_units() {
    let (unit, _) = analyze(
        "(define (len p) (if (null? p) 0 (+ 1 (len (tail p)))))\n\
         (let ((items (list 1 2 3 4 5))) (print (len items)))",
    );
    assert!(unit.ctx.validate().is_empty());
}
