//! C backend: one analyzed unit in, one C99 translation unit out.

pub mod expr;
pub mod function;
pub mod runtime;

use sylva_analysis::AnalyzedUnit;
use sylva_ast::{Ast, StringInterner};

use crate::context::CodegenContext;
use crate::CodegenResult;

use self::function::{emit_closure_fn, emit_function, emit_main, emit_trampoline};
use self::runtime::CRuntime;

/// C code generator.
pub struct CCodegen;

impl CCodegen {
    /// Generate the complete translation unit for one analyzed unit.
    pub fn generate(ast: &Ast, interner: &StringInterner, unit: &AnalyzedUnit) -> CodegenResult {
        let mut ctx = CodegenContext::new(interner, &unit.ctx, &unit.program);

        // Deterministic ids for user types (declaration order).
        for (i, &decl) in unit.program.types.iter().enumerate() {
            let name = ast
                .list_nth(decl, 1)
                .and_then(|n| ast.as_symbol(n))
                .expect("deftype names were validated during resolution");
            #[expect(clippy::cast_possible_truncation, reason = "type counts fit in u32")]
            ctx.type_ids.insert(name, i as u32 + 1);
        }

        // Names for lifted closure bodies, in source order.
        let mut closures: Vec<_> = unit.program.lambda_scopes.keys().copied().collect();
        closures.sort_by_key(|&n| ast.pos(n));
        for (i, node) in closures.iter().enumerate() {
            ctx.closure_fns.insert(*node, format!("syl_closure_{i}"));
        }

        tracing::debug!(
            functions = unit.program.fn_order.len(),
            closures = closures.len(),
            types = unit.program.types.len(),
            "generating C unit"
        );

        CRuntime::emit(&mut ctx, ast);

        // Forward declarations so definition order never matters.
        ctx.writeln("/* forward declarations */");
        for name in &unit.program.fn_order {
            let def = &unit.program.functions[name];
            let params: Vec<String> = def
                .params
                .iter()
                .map(|&p| format!("syl_value {}", ctx.var_name(sylva_analysis::VarKey::new(def.scope, p))))
                .collect();
            let mangled = ctx.mangle(*name);
            ctx.writeln(&format!(
                "static syl_value {mangled}({});",
                if params.is_empty() {
                    "void".to_owned()
                } else {
                    params.join(", ")
                }
            ));
            ctx.writeln(&format!(
                "static syl_value {mangled}_tramp(syl_value *caps, syl_value *args, uint32_t argc);"
            ));
        }
        for node in &closures {
            let fn_name = ctx.closure_fns[node].clone();
            ctx.writeln(&format!(
                "static syl_value {fn_name}(syl_value *caps, syl_value *args, uint32_t argc);"
            ));
        }
        ctx.newline();

        // Globals are file-scope so closures and functions can read them.
        for global in &unit.program.globals {
            let key = sylva_analysis::VarKey::new(sylva_analysis::ScopeId::TOP, global.name);
            let var = ctx.var_name(key);
            ctx.writeln(&format!("static syl_value {var} = SYL_NIL;"));
        }
        if !unit.program.globals.is_empty() {
            ctx.newline();
        }

        // Closure bodies first: function bodies may construct them.
        for node in &closures {
            emit_closure_fn(&mut ctx, ast, *node);
        }

        for &name in &unit.program.fn_order {
            emit_function(&mut ctx, ast, name);
            emit_trampoline(&mut ctx, name);
        }

        emit_main(&mut ctx, ast);

        CodegenResult::success(ctx.take_output())
    }
}

#[cfg(test)]
mod tests;
