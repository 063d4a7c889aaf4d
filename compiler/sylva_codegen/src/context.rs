//! Code generation context and state.
//!
//! The `CodegenContext` holds everything emission needs: the interner,
//! the analysis tables, the output buffer with indentation, and counters
//! for temporaries and lifted closures.

use rustc_hash::FxHashMap;

use sylva_analysis::{AnalysisContext, Program, RcElision, ThreadLocality, VarKey};
use sylva_ast::{Name, NodeId, StringInterner};

/// Code generation context.
pub struct CodegenContext<'a> {
    /// String interner for resolving names.
    pub interner: &'a StringInterner,
    /// The finished analysis tables.
    pub analysis: &'a AnalysisContext,
    /// The resolved unit (functions, globals, types, top level).
    pub program: &'a Program,
    /// Lifted closure bodies: lambda/spawn node → emitted function name.
    pub closure_fns: FxHashMap<NodeId, String>,
    /// User type name → numeric type id in the emitted unit.
    pub type_ids: FxHashMap<Name, u32>,
    /// Current indentation level.
    indent: usize,
    /// Generated code output.
    output: String,
    /// Counter for generating unique temporary names.
    temp_counter: u32,
}

impl<'a> CodegenContext<'a> {
    pub fn new(
        interner: &'a StringInterner,
        analysis: &'a AnalysisContext,
        program: &'a Program,
    ) -> Self {
        Self {
            interner,
            analysis,
            program,
            closure_fns: FxHashMap::default(),
            type_ids: FxHashMap::default(),
            indent: 0,
            output: String::with_capacity(8192),
            temp_counter: 0,
        }
    }

    /// Resolve a name to its string representation.
    #[inline]
    pub fn resolve_name(&self, name: Name) -> &str {
        self.interner.lookup(name)
    }

    /// Mangle a Sylva name for C compatibility.
    ///
    /// C identifiers can only contain alphanumeric characters and
    /// underscores; everything else becomes `_`.
    pub fn mangle(&self, name: Name) -> String {
        let s = self.interner.lookup(name);
        let mut result = String::with_capacity(s.len() + 4);
        result.push_str("syl_");
        for c in s.chars() {
            if c.is_ascii_alphanumeric() {
                result.push(c);
            } else {
                result.push('_');
            }
        }
        result
    }

    /// The C variable for a binding: the mangled name qualified by the
    /// binding scope, so shadowed bindings coexist in one C function.
    pub fn var_name(&self, key: VarKey) -> String {
        format!("{}_s{}", self.mangle(key.name), key.scope.raw())
    }

    /// Whether a binding's surviving RC operations must be atomic.
    pub fn is_shared(&self, key: VarKey) -> bool {
        self.analysis.thread_locality(key) == ThreadLocality::Shared
    }

    /// Whether an increment may be skipped for a binding.
    pub fn can_elide_inc(&self, key: VarKey) -> bool {
        matches!(
            self.analysis.elision(key),
            RcElision::ElideInc | RcElision::ElideBoth
        )
    }

    /// Whether a decrement may be skipped for a binding.
    pub fn can_elide_dec(&self, key: VarKey) -> bool {
        matches!(
            self.analysis.elision(key),
            RcElision::ElideDec | RcElision::ElideBoth
        )
    }

    /// Generate a unique temporary variable name.
    pub fn fresh_temp(&mut self) -> String {
        let n = self.temp_counter;
        self.temp_counter += 1;
        format!("_t{n}")
    }

    /// Increase indentation level.
    pub fn indent(&mut self) {
        self.indent += 1;
    }

    /// Decrease indentation level.
    pub fn dedent(&mut self) {
        debug_assert!(self.indent > 0, "dedent called with zero indent");
        self.indent = self.indent.saturating_sub(1);
    }

    /// Write a string to output without indentation or newline.
    pub fn write(&mut self, s: &str) {
        self.output.push_str(s);
    }

    /// Write a line to output (with indentation and newline).
    pub fn writeln(&mut self, s: &str) {
        for _ in 0..self.indent {
            self.output.push_str("    ");
        }
        self.output.push_str(s);
        self.output.push('\n');
    }

    /// Write a newline.
    pub fn newline(&mut self) {
        self.output.push('\n');
    }

    /// Take the generated output.
    pub fn take_output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }
}

#[cfg(test)]
mod tests {
    use sylva_analysis::{AnalysisContext, Program};
    use sylva_ast::StringInterner;

    use super::CodegenContext;

    #[test]
    fn mangle_replaces_lisp_punctuation() {
        let interner = StringInterner::new();
        let analysis = AnalysisContext::new();
        let program = Program::default();
        let ctx = CodegenContext::new(&interner, &analysis, &program);
        assert_eq!(ctx.mangle(interner.intern("for-each")), "syl_for_each");
        assert_eq!(ctx.mangle(interner.intern("null?")), "syl_null_");
        assert_eq!(ctx.mangle(interner.intern("set!")), "syl_set_");
    }

    #[test]
    fn fresh_temps_are_sequential() {
        let interner = StringInterner::new();
        let analysis = AnalysisContext::new();
        let program = Program::default();
        let mut ctx = CodegenContext::new(&interner, &analysis, &program);
        assert_eq!(ctx.fresh_temp(), "_t0");
        assert_eq!(ctx.fresh_temp(), "_t1");
    }

    #[test]
    fn writeln_indents() {
        let interner = StringInterner::new();
        let analysis = AnalysisContext::new();
        let program = Program::default();
        let mut ctx = CodegenContext::new(&interner, &analysis, &program);
        ctx.writeln("a");
        ctx.indent();
        ctx.writeln("b");
        ctx.dedent();
        ctx.writeln("c");
        assert_eq!(ctx.take_output(), "a\n    b\nc\n");
    }
}
