use pretty_assertions::assert_eq;

use sylva_ast::StringInterner;
use sylva_diagnostic::ErrorCode;

use crate::context::{AnalysisContext, Shape};
use crate::resolve::resolve_unit;
use crate::shape::{analyze_shapes, is_back_edge_field, is_back_edge_name};

fn shapes_of(source: &str) -> (AnalysisContext, StringInterner) {
    let interner = StringInterner::new();
    let ast = sylva_reader::read_unit(source, &interner).expect("read");
    let mut ctx = AnalysisContext::new();
    let program = resolve_unit(&ast, &interner, &mut ctx).expect("resolve");
    analyze_shapes(&ast, &interner, &program, &mut ctx).expect("shapes");
    (ctx, interner)
}

#[test]
fn no_self_reference_is_tree() {
    let (ctx, interner) = shapes_of("(deftype Point (x Int) (y Int))");
    assert_eq!(ctx.shapes[&interner.intern("Point")].shape, Shape::Tree);
}

#[test]
fn owning_self_reference_is_dag() {
    let (ctx, interner) = shapes_of("(deftype Node (data Int) (next Node))");
    let info = &ctx.shapes[&interner.intern("Node")];
    assert_eq!(info.shape, Shape::Dag);
    assert!(info.back_edge_fields.is_empty());
}

#[test]
fn doubly_linked_node_is_cyclic_with_prev_back_edge() {
    let (ctx, interner) = shapes_of("(deftype DLNode (data Int) (next DLNode) (prev DLNode))");
    let name = interner.intern("DLNode");
    let info = &ctx.shapes[&name];
    assert_eq!(info.shape, Shape::Cyclic);
    assert!(info.is_cyclic);
    assert_eq!(info.back_edge_fields, vec![interner.intern("prev")]);
    assert!(is_back_edge_field(&ctx, name, interner.intern("prev")));
    assert!(!is_back_edge_field(&ctx, name, interner.intern("next")));
}

#[test]
fn weak_annotation_forces_back_edge() {
    let (ctx, interner) = shapes_of("(deftype Tree (left Tree) (link Tree :weak))");
    let info = &ctx.shapes[&interner.intern("Tree")];
    assert_eq!(info.shape, Shape::Cyclic);
    assert_eq!(info.back_edge_fields, vec![interner.intern("link")]);
}

#[test]
fn back_edge_patterns_match_substrings() {
    assert!(is_back_edge_name("parent"));
    assert!(is_back_edge_name("prev_sibling"));
    assert!(is_back_edge_name("owner_ref"));
    assert!(is_back_edge_name("backlink"));
    assert!(!is_back_edge_name("next"));
    assert!(!is_back_edge_name("child"));
}

#[test]
fn duplicate_field_is_an_error() {
    let interner = StringInterner::new();
    let ast = sylva_reader::read_unit("(deftype T (a Int) (a Int))", &interner).expect("read");
    let mut ctx = AnalysisContext::new();
    let program = resolve_unit(&ast, &interner, &mut ctx).expect("resolve");
    let err = analyze_shapes(&ast, &interner, &program, &mut ctx).unwrap_err();
    assert_eq!(err.code, ErrorCode::BadDeftypeField);
}

#[test]
fn bare_field_is_an_error() {
    let interner = StringInterner::new();
    let ast = sylva_reader::read_unit("(deftype T (a))", &interner).expect("read");
    let mut ctx = AnalysisContext::new();
    let program = resolve_unit(&ast, &interner, &mut ctx).expect("resolve");
    let err = analyze_shapes(&ast, &interner, &program, &mut ctx).unwrap_err();
    assert_eq!(err.code, ErrorCode::BadDeftypeField);
}
