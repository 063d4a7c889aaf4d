//! Runtime emission.
//!
//! The runtime ships as two embedded C sources concatenated into every
//! translation unit, followed by per-program type metadata (numeric type
//! ids and back-edge bitmaps for user types).

use sylva_analysis::VarKey;
use sylva_ast::Ast;

use crate::context::CodegenContext;

/// The runtime's public surface (types, inlines, prototypes).
pub const RT_HEADER: &str = include_str!("rt/sylva_rt.h");

/// The runtime implementation.
pub const RT_IMPL: &str = include_str!("rt/sylva_rt.c");

/// C runtime code generator.
pub struct CRuntime;

impl CRuntime {
    /// Emit the runtime and the program's type metadata.
    pub fn emit(ctx: &mut CodegenContext<'_>, ast: &Ast) {
        ctx.writeln("/* ================================================================ */");
        ctx.writeln("/* Sylva runtime                                                    */");
        ctx.writeln("/* ================================================================ */");
        ctx.write(RT_HEADER);
        ctx.newline();
        // Strip the include line: this is a single translation unit.
        for line in RT_IMPL.lines() {
            if line.trim() == "#include \"sylva_rt.h\"" {
                continue;
            }
            ctx.writeln(line);
        }
        ctx.newline();

        Self::emit_type_metadata(ctx, ast);
    }

    /// Emit numeric ids and back-edge bitmaps for every `deftype`.
    fn emit_type_metadata(ctx: &mut CodegenContext<'_>, ast: &Ast) {
        if ctx.program.types.is_empty() {
            return;
        }
        ctx.writeln("/* user type metadata */");

        let types: Vec<_> = ctx.program.types.clone();
        for decl in types {
            let Some(name) = ast.list_nth(decl, 1).and_then(|n| ast.as_symbol(n)) else {
                continue;
            };
            let id = ctx.type_ids[&name];
            let mangled = ctx.mangle(name);
            let info = &ctx.analysis.shapes[&name];
            let nfields = info.fields.len();

            let tag: String = ctx
                .resolve_name(name)
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                .collect();
            ctx.writeln(&format!("#define SYL_TYPE_{tag} {id}u"));
            let bits: Vec<&str> = info
                .fields
                .iter()
                .map(|f| {
                    if info.back_edge_fields.contains(&f.name) {
                        "1"
                    } else {
                        "0"
                    }
                })
                .collect();
            ctx.writeln(&format!(
                "static const uint8_t {mangled}_back_edges[{}] = {{{}}};",
                nfields.max(1),
                if bits.is_empty() {
                    "0".to_owned()
                } else {
                    bits.join(", ")
                }
            ));
        }
        ctx.newline();
    }
}

/// The C release expression for one binding, by its free strategy and
/// thread locality. `None` strategies emit nothing.
pub fn free_stmt(ctx: &CodegenContext<'_>, key: VarKey) -> Option<String> {
    use sylva_analysis::FreeStrategy;

    let owner = ctx.analysis.owner(key)?;
    let var = ctx.var_name(key);
    let atomic = ctx.is_shared(key);
    Some(match owner.free {
        FreeStrategy::None => return None,
        FreeStrategy::Unique => format!("syl_free_unique({var});"),
        FreeStrategy::Tree => format!("syl_free_tree({var});"),
        FreeStrategy::Rc | FreeStrategy::RcTree => {
            if atomic {
                format!("syl_dec_ref_atomic({var});")
            } else {
                format!("syl_dec_ref({var});")
            }
        }
        FreeStrategy::Scc => format!("syl_scc_release({var});"),
        FreeStrategy::Deferred => format!("syl_defer_decrement({var});"),
    })
}
