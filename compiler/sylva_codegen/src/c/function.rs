//! Function, closure, and entry-point emission.
//!
//! Each user function becomes a `static syl_value` C function over
//! tagged values, with a per-function slot pool when the analysis put
//! any of its bindings on the stack. Closure bodies are lifted to
//! functions with the fixed `(captures, args, argc)` signature; every
//! user function also gets a trampoline with that signature so bare
//! function references can flow as closure values.

use sylva_analysis::{AllocStrategy, Shape, VarKey};
use sylva_ast::{Ast, ExprKind, Name, NodeId, SpecialForm};

use crate::context::CodegenContext;

use super::expr::{global_key, FnEmitter};

/// The pool bump expression handed to the emitter.
const POOL_EXPR: &str = "&__pool[__pool_i++]";

/// Emit one user function definition.
pub fn emit_function<'a>(ctx: &mut CodegenContext<'a>, ast: &'a Ast, name: Name) {
    let def = ctx.program.functions[&name].clone();
    let mangled = ctx.mangle(name);
    let params: Vec<String> = def
        .params
        .iter()
        .map(|&p| format!("syl_value {}", ctx.var_name(VarKey::new(def.scope, p))))
        .collect();

    ctx.writeln(&format!(
        "static syl_value {mangled}({}) {{",
        if params.is_empty() {
            "void".to_owned()
        } else {
            params.join(", ")
        }
    ));
    ctx.indent();

    let pool = emit_pool_decl(ctx, ast, &def.body);
    let arena = emit_arena_decl(ctx, ast, &def.body);
    let has_arena = arena.is_some();
    let mut emitter = FnEmitter::new(ctx, ast, pool, arena);
    let value = emitter.emit_body(&def.body);
    if has_arena {
        ctx.writeln("if (__arena) syl_arena_destroy(__arena);");
    }
    ctx.writeln(&format!("return {value};"));

    ctx.dedent();
    ctx.writeln("}");
    ctx.newline();
}

/// Emit the fixed-signature trampoline for a user function.
pub fn emit_trampoline(ctx: &mut CodegenContext<'_>, name: Name) {
    let def = ctx.program.functions[&name].clone();
    let mangled = ctx.mangle(name);
    ctx.writeln(&format!(
        "static syl_value {mangled}_tramp(syl_value *caps, syl_value *args, uint32_t argc) {{"
    ));
    ctx.indent();
    ctx.writeln("(void)caps;");
    ctx.writeln("(void)argc;");
    if def.params.is_empty() {
        ctx.writeln("(void)args;");
        ctx.writeln(&format!("return {mangled}();"));
    } else {
        let args: Vec<String> = (0..def.params.len()).map(|i| format!("args[{i}]")).collect();
        ctx.writeln(&format!("return {mangled}({});", args.join(", ")));
    }
    ctx.dedent();
    ctx.writeln("}");
    ctx.newline();
}

/// Emit a lifted closure body (`lambda` or `spawn`).
pub fn emit_closure_fn<'a>(ctx: &mut CodegenContext<'a>, ast: &'a Ast, node: NodeId) {
    let fn_name = ctx.closure_fns[&node].clone();
    let scope = ctx.program.lambda_scopes[&node];
    let is_lambda = ast
        .head_symbol(node)
        .is_some_and(|h| ctx.resolve_name(h) == "lambda");

    ctx.writeln(&format!(
        "static syl_value {fn_name}(syl_value *caps, syl_value *args, uint32_t argc) {{"
    ));
    ctx.indent();
    ctx.writeln("(void)caps;");
    ctx.writeln("(void)args;");
    ctx.writeln("(void)argc;");

    let items = ast.list_items(node);

    // Parameters bind from the argument block.
    let body_start = if is_lambda {
        let param_list = items[1];
        for (i, p) in ast.list_items(param_list).into_iter().enumerate() {
            let name = ast.as_symbol(p).expect("parameters are symbols");
            let var = ctx.var_name(VarKey::new(scope, name));
            ctx.writeln(&format!("syl_value {var} = args[{i}];"));
        }
        2
    } else {
        1
    };

    // Captures bind from the capture block, under their outer names so
    // body expressions resolve unchanged.
    let captures = ctx.analysis.captures.get(&node).cloned().unwrap_or_default();
    for (i, &key) in captures.iter().enumerate() {
        let var = ctx.var_name(key);
        ctx.writeln(&format!("syl_value {var} = caps[{i}];"));
    }

    let body = &items[body_start..];
    let pool = emit_pool_decl(ctx, ast, body);
    let arena = emit_arena_decl(ctx, ast, body);
    let has_arena = arena.is_some();
    let mut emitter = FnEmitter::new(ctx, ast, pool, arena);
    let value = emitter.emit_body(body);
    if has_arena {
        ctx.writeln("if (__arena) syl_arena_destroy(__arena);");
    }
    ctx.writeln(&format!("return {value};"));

    ctx.dedent();
    ctx.writeln("}");
    ctx.newline();
}

/// Emit the program entry point: runtime init, globals, the top-level
/// sequence with the final value printed, epilogue.
pub fn emit_main<'a>(ctx: &mut CodegenContext<'a>, ast: &'a Ast) {
    ctx.writeln("int main(void) {");
    ctx.indent();
    ctx.writeln("syl_rt_init();");

    let globals = ctx.program.globals.clone();
    let toplevel = ctx.program.toplevel.clone();

    let mut pool_roots: Vec<NodeId> = toplevel.clone();
    pool_roots.extend(globals.iter().map(|g| g.value));
    let pool = emit_pool_decl(ctx, ast, &pool_roots);
    let arena = emit_arena_decl(ctx, ast, &pool_roots);
    let has_arena = arena.is_some();

    {
        let mut emitter = FnEmitter::new(ctx, ast, pool, arena);
        for global in &globals {
            let value = emitter.emit_expr(global.value);
            let var = emitter.ctx.var_name(global_key(global.name));
            emitter.ctx.writeln(&format!("{var} = {value};"));
        }

        // All but the last top-level form are plain statements; the last
        // one's value is the program result, printed before its frees
        // run.
        if let Some((&last, init)) = toplevel.split_last() {
            for &form in init {
                emitter.emit_stmt(form);
            }
            emitter.emit_entry_frees(last);
            let value = emitter.emit_expr(last);
            emitter.ctx.writeln(&format!("syl_print_result({value});"));
            emitter.emit_after_frees(last);
        }
    }

    if has_arena {
        ctx.writeln("if (__arena) syl_arena_destroy(__arena);");
    }
    ctx.writeln("syl_flush_freelist();");
    ctx.writeln("syl_rt_shutdown();");
    ctx.writeln("return 0;");
    ctx.dedent();
    ctx.writeln("}");
}

/// Declare the per-function stack pool when the body has stack-allocated
/// structured bindings; returns the bump expression for the emitter.
fn emit_pool_decl(ctx: &mut CodegenContext<'_>, ast: &Ast, body: &[NodeId]) -> Option<String> {
    let slots = pool_slots(ctx, ast, body);
    if slots == 0 {
        return None;
    }
    ctx.writeln(&format!("syl_obj __pool[{slots}];"));
    ctx.writeln("size_t __pool_i = 0;");
    Some(POOL_EXPR.to_owned())
}

/// Declare the per-function arena when any binding is arena-bound;
/// returns the arena variable for the emitter. The arena is created
/// lazily at the first allocation and destroyed before return.
fn emit_arena_decl(ctx: &mut CodegenContext<'_>, ast: &Ast, body: &[NodeId]) -> Option<String> {
    if !has_arena_bindings(ctx, ast, body) {
        return None;
    }
    ctx.writeln("syl_arena *__arena = NULL;");
    Some("__arena".to_owned())
}

/// Whether any `let` binding in the body (outside closure boundaries)
/// has the Arena allocation strategy.
fn has_arena_bindings(ctx: &CodegenContext<'_>, ast: &Ast, body: &[NodeId]) -> bool {
    let mut stack: Vec<NodeId> = body.to_vec();
    while let Some(node) = stack.pop() {
        if is_closure_boundary(ctx, ast, node) {
            continue;
        }
        if let ExprKind::Cell { head, tail } = ast.kind(node) {
            stack.push(head);
            stack.push(tail);
        } else {
            continue;
        }
        if ast
            .head_symbol(node)
            .is_some_and(|h| SpecialForm::from_str(ctx.resolve_name(h)) == Some(SpecialForm::Let))
        {
            let items = ast.list_items(node);
            let Some(&binding_list) = items.get(1) else {
                continue;
            };
            for binding in ast.list_items(binding_list) {
                let Some(&name_node) = ast.list_items(binding).first() else {
                    continue;
                };
                let Some(key) = lookup_binding(ctx, ast, name_node) else {
                    continue;
                };
                if ctx
                    .analysis
                    .owner(key)
                    .is_some_and(|o| o.alloc == AllocStrategy::Arena)
                {
                    return true;
                }
            }
        }
    }
    false
}

/// Count the constructor slots the body's stack bindings need.
fn pool_slots(ctx: &CodegenContext<'_>, ast: &Ast, body: &[NodeId]) -> usize {
    let mut slots = 0usize;
    let mut stack: Vec<NodeId> = body.to_vec();
    while let Some(node) = stack.pop() {
        // Closure bodies get their own pool.
        if is_closure_boundary(ctx, ast, node) {
            continue;
        }
        if let ExprKind::Cell { head, tail } = ast.kind(node) {
            stack.push(head);
            stack.push(tail);
        } else {
            continue;
        }
        if ast
            .head_symbol(node)
            .is_some_and(|h| SpecialForm::from_str(ctx.resolve_name(h)) == Some(SpecialForm::Let))
        {
            let items = ast.list_items(node);
            let Some(&binding_list) = items.get(1) else {
                continue;
            };
            for binding in ast.list_items(binding_list) {
                let parts = ast.list_items(binding);
                let (Some(&name_node), Some(&init)) = (parts.first(), parts.get(1)) else {
                    continue;
                };
                let Some(key) = lookup_binding(ctx, ast, name_node) else {
                    continue;
                };
                let stack_tree = ctx.analysis.owner(key).is_some_and(|o| {
                    o.alloc == AllocStrategy::Stack && o.shape != Shape::Scalar
                });
                if stack_tree {
                    slots += constructor_count(ctx, ast, init);
                }
            }
        }
    }
    slots
}

/// Number of constructor calls in an initializer subtree.
fn constructor_count(ctx: &CodegenContext<'_>, ast: &Ast, init: NodeId) -> usize {
    let mut count = 0usize;
    let mut stack = vec![init];
    while let Some(node) = stack.pop() {
        if let ExprKind::Cell { head, tail } = ast.kind(node) {
            stack.push(head);
            stack.push(tail);
        } else {
            continue;
        }
        if let Some(h) = ast.head_symbol(node) {
            let s = ctx.resolve_name(h);
            if s == "cons" || s.starts_with("make-") {
                count += 1;
            } else if s == "list" {
                count += ast.list_len(node).saturating_sub(1);
            }
        }
    }
    count
}

fn lookup_binding(ctx: &CodegenContext<'_>, ast: &Ast, name_node: NodeId) -> Option<VarKey> {
    let name = ast.as_symbol(name_node)?;
    let pos = ast.pos(name_node);
    ctx.analysis
        .usage
        .iter()
        .find(|(k, u)| k.name == name && u.def_pos == pos)
        .map(|(&k, _)| k)
}

fn is_closure_boundary(ctx: &CodegenContext<'_>, ast: &Ast, node: NodeId) -> bool {
    ast.head_symbol(node).is_some_and(|h| {
        matches!(
            SpecialForm::from_str(ctx.resolve_name(h)),
            Some(SpecialForm::Lambda | SpecialForm::Spawn)
        )
    })
}
