use sylva_analysis::analyze_unit;
use sylva_ast::StringInterner;

use crate::CCodegen;

fn generate(source: &str) -> String {
    let interner = StringInterner::new();
    let ast = sylva_reader::read_unit(source, &interner).expect("read");
    let unit = analyze_unit(&ast, &interner).expect("analyze");
    let result = CCodegen::generate(&ast, &interner, &unit);
    assert!(result.success, "codegen failed: {:?}", result.errors);
    result.code
}

#[test]
fn unit_carries_the_runtime() {
    let code = generate("(print 1)");
    assert!(code.contains("typedef uintptr_t syl_value;"));
    assert!(code.contains("syl_obj *syl_pool_alloc(void)"));
    assert!(code.contains("uint32_t syl_scc_freeze(syl_value root)"));
    assert!(code.contains("int main(void)"));
    assert!(code.contains("syl_rt_init();"));
    assert!(code.contains("syl_rt_shutdown();"));
}

#[test]
fn final_value_prints_as_result() {
    let code = generate("(let ((x 1)) x)");
    assert!(code.contains("syl_print_result("));
}

#[test]
fn scalar_stack_local_is_an_immediate_with_no_rc() {
    let code = generate("(let ((x 1)) x)");
    assert!(code.contains("syl_value syl_x_s1 = syl_from_fixnum(INT64_C(1));"));
    // A unique stack scalar produces no RC traffic anywhere.
    assert!(!code.contains("syl_inc_ref(syl_x_s1)"));
    assert!(!code.contains("syl_dec_ref(syl_x_s1)"));
}

#[test]
fn heap_list_is_freed_at_its_free_point() {
    let code = generate("(let ((p (list 1 2 3 4 5))) (print (head p)) (print 0))");
    // The list is unique: a structural free, not a refcount op.
    assert!(code.contains("syl_free_tree(syl_p_s1);"));
}

#[test]
fn branches_receive_distinct_frees() {
    let code = generate(
        "(let ((c 1) (x (list 1 2 3 4 5)) (y (list 6 7 8 9 10)))\n\
         (if c (print (head x)) (print (head y))))",
    );
    // Each arm frees the list it does not use.
    let then_arm = code.find("if (syl_is_truthy(").expect("branch emitted");
    let frees: Vec<usize> = ["syl_free_tree(syl_x_s1);", "syl_free_tree(syl_y_s1);"]
        .iter()
        .filter_map(|f| code[then_arm..].find(f))
        .collect();
    assert_eq!(frees.len(), 2, "both branch frees present:\n{code}");
}

#[test]
fn user_functions_lower_to_static_functions() {
    let code = generate("(define (fact n) (if (< n 2) 1 (* n (fact (- n 1))))) (fact 10)");
    assert!(code.contains("static syl_value syl_fact(syl_value syl_n_s1)"));
    assert!(code.contains("syl_fact(syl_from_fixnum(INT64_C(10)))"));
    assert!(code.contains("syl_mul("));
    assert!(code.contains("syl_lt("));
}

#[test]
fn for_each_emits_tether_acquire_and_release() {
    let code = generate("(let ((items (list 1 2 3 4 5))) (for-each x items (print x)))");
    assert!(code.contains("syl_tether_acquire(syl_items_s1);"));
    assert!(code.contains("syl_tether_release(syl_items_s1);"));
    let acquire = code.find("syl_tether_acquire").expect("acquire");
    let release = code.rfind("syl_tether_release").expect("release");
    assert!(acquire < release);
}

#[test]
fn deftype_emits_metadata_and_accessors() {
    let code = generate(
        "(deftype Quad (a Int) (b Int) (c Int) (d Int))\n\
         (define (mk) (make-Quad 1 2 3 4))\n\
         (print (Quad-a (mk)))",
    );
    assert!(code.contains("#define SYL_TYPE_Quad 1u"));
    assert!(code.contains("syl_Quad_back_edges[4] = {0, 0, 0, 0};"));
    assert!(code.contains("syl_mk_user(1u, 4u,"));
    assert!(code.contains("syl_user_get("));
}

#[test]
fn cyclic_local_builds_into_an_arena() {
    let code = generate(
        "(deftype DLNode (data Int) (next DLNode) (prev DLNode))\n\
         (let ((n (make-DLNode 1 () ()))) (print (DLNode-data n)))",
    );
    assert!(code.contains("#define SYL_TYPE_DLNode 1u"));
    assert!(code.contains("syl_DLNode_back_edges[3] = {0, 0, 1};"));
    assert!(code.contains("syl_arena *__arena = NULL;"));
    assert!(code.contains("syl_arena_alloc(__arena)"));
    assert!(code.contains("if (__arena) syl_arena_destroy(__arena);"));
    // Arena values have no per-object free.
    assert!(!code.contains("syl_free_tree(syl_n_s1)"));
}

#[test]
fn closures_lift_with_capture_blocks() {
    let code = generate("(let ((n 1)) (let ((f (lambda (x) (+ x n)))) (print 0)))");
    assert!(code.contains(
        "static syl_value syl_closure_0(syl_value *caps, syl_value *args, uint32_t argc)"
    ));
    assert!(code.contains("syl_value syl_n_s1 = caps[0];"));
    assert!(code.contains("syl_value syl_x_s2 = args[0];"));
    assert!(code.contains("syl_mk_closure(syl_closure_0, 1u,"));
}

#[test]
fn spawn_builds_a_thread_over_a_lifted_closure() {
    let code = generate("(let ((v (list 1 2 3 4 5))) (spawn (print (head v))) (print 0))");
    assert!(code.contains("syl_spawn_thread("));
    // Spawn captures are shared: the publish increments atomically.
    assert!(code.contains("syl_inc_ref_atomic(syl_v_s1);"));
}

#[test]
fn transferring_send_elides_the_sender_side_rc() {
    let code = generate("(let ((ch (chan 1)) (v (list 1 2 3 4 5))) (send! ch v))");
    assert!(code.contains("syl_channel_send("));
    // Transfer: no post-send decrement, no pre-send increment of v.
    assert!(!code.contains("syl_inc_ref_atomic(syl_v_s1)"));
    assert!(!code.contains("syl_dec_ref(syl_v_s1)"));
    assert!(!code.contains("syl_free_tree(syl_v_s1)"));
}

#[test]
fn retained_send_publishes_a_second_reference() {
    let code = generate(
        "(let ((ch (chan 1)) (v (list 1 2 3 4 5)))\n\
         (send! ch v)\n\
         (print (head v)))",
    );
    let send = code.find("syl_channel_send").expect("send emitted");
    let inc = code.find("syl_inc_ref_atomic").expect("inc emitted");
    assert!(inc < send, "the publish increment precedes the send");
}

#[test]
fn try_lowers_to_landing_pads() {
    let code = generate("(try (error boom) (catch e (print e)))");
    assert!(code.contains("syl_try_enter();"));
    assert!(code.contains("setjmp("));
    assert!(code.contains("syl_try_exit();"));
    assert!(code.contains("syl_current_error();"));
    assert!(code.contains("syl_throw(syl_mk_error(\"boom\", SYL_NIL));"));
}

#[test]
fn reuse_candidate_emits_conditional_reinit() {
    let code = generate(
        "(deftype Quad (a Int) (b Int) (c Int) (d Int))\n\
         (let ((p (make-Quad 1 2 3 4)))\n\
         (print (Quad-a p))\n\
         (let ((q (make-Quad 5 6 7 8)))\n\
         (print (Quad-b q))))",
    );
    assert!(code.contains("syl_reuse_or_free(syl_p_s1)"));
    assert!(code.contains("syl_reuse_user("));
    // The paired free is consumed by the reuse site.
    assert!(!code.contains("syl_free_tree(syl_p_s1);"));
}

#[test]
fn passthrough_argument_is_not_freed_around_the_call() {
    let code = generate(
        "(define (identity x) x)\n\
         (let ((p (list 1 2 3 4 5))) (print (head (identity p))))",
    );
    // `p` flows through `identity`; the caller-side free is suppressed.
    assert!(!code.contains("syl_free_tree(syl_p_s2);"));
}

#[test]
fn globals_are_file_scope() {
    let code = generate("(define limit 10) (print limit)");
    assert!(code.contains("static syl_value syl_limit_s0 = SYL_NIL;"));
    assert!(code.contains("syl_limit_s0 = syl_from_fixnum(INT64_C(10));"));
}

#[test]
fn map_iterates_with_reversal() {
    let code = generate(
        "(define (double x) (* x 2))\n\
         (let ((items (list 1 2 3 4 5))) (print (map double items)))",
    );
    assert!(code.contains("syl_double("));
    assert!(code.contains("syl_list_reverse("));
}
