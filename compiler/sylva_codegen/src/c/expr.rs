//! Expression lowering.
//!
//! Emission is A-normal: every subexpression lands in a fresh `syl_value`
//! temporary, so control flow (branches, loops, try) composes without
//! C-level expression nesting. The emitter consults the analysis tables
//! at every step:
//!
//! - frees are emitted at the computed free points, per branch;
//! - inc/dec are gated by the elision table and switch to atomic
//!   variants where thread locality is Shared;
//! - reuse candidates lower to `syl_reuse_or_free` + in-place
//!   reinitialization with an allocation fallback;
//! - loop borrows emit tether acquire/release around the iteration;
//! - stack-pooled bindings build into the per-function slot pool.
//!
//! Anything inconsistent between tables is a compiler bug and panics.

use rustc_hash::{FxHashMap, FxHashSet};

use sylva_analysis::{
    AllocStrategy, ParamOwnership, Program, ScopeId, Shape, VarKey,
};
use sylva_ast::{Ast, ExprKind, Name, NodeId, SpecialForm};

use crate::context::CodegenContext;

use super::runtime::free_stmt;

/// Per-function emission state.
pub(crate) struct FnEmitter<'a, 'b> {
    pub ctx: &'b mut CodegenContext<'a>,
    pub ast: &'a Ast,
    /// Lexical `try` nesting depth; allocations register cleanups when
    /// inside one.
    try_depth: usize,
    /// Emitting the initializer of a stack-pooled binding: constructors
    /// build into the pool instead of the heap.
    stack_init: bool,
    /// Emitting the initializer of an arena binding: constructors build
    /// into the function's arena (reclaimed in bulk at exit).
    arena_init: bool,
    /// The function's pool bump expression, when it has a pool.
    pool: Option<String>,
    /// The function's arena variable, when any binding is arena-bound.
    arena: Option<String>,
    /// Variables whose statement-level free is suppressed (passthrough
    /// or consumed arguments around a call).
    suppressed: FxHashSet<VarKey>,
    /// Bindings registered on the current unwind frame's cleanup stack.
    cleanup_pushed: FxHashSet<VarKey>,
    /// Frees consumed by a reuse candidate (the reuse takes the slot).
    reused: FxHashSet<VarKey>,
    /// Allocation node → the freed binding whose slot it may take.
    reuse_allocs: FxHashMap<NodeId, VarKey>,
}

impl<'a, 'b> FnEmitter<'a, 'b> {
    pub fn new(
        ctx: &'b mut CodegenContext<'a>,
        ast: &'a Ast,
        pool: Option<String>,
        arena: Option<String>,
    ) -> Self {
        let mut reused = FxHashSet::default();
        let mut reuse_allocs = FxHashMap::default();
        for candidate in &ctx.analysis.reuses {
            if candidate.can_reuse {
                reused.insert(candidate.freed);
                reuse_allocs.insert(candidate.alloc_node, candidate.freed);
            }
        }
        Self {
            ctx,
            ast,
            try_depth: 0,
            stack_init: false,
            arena_init: false,
            pool,
            arena,
            suppressed: FxHashSet::default(),
            cleanup_pushed: FxHashSet::default(),
            reused,
            reuse_allocs,
        }
    }

    /// An arena slot for the current allocation, creating the arena on
    /// first use.
    fn emit_arena_slot(&mut self) -> String {
        let arena = self
            .arena
            .clone()
            .unwrap_or_else(|| panic!("codegen: arena allocation without a function arena"));
        self.ctx.writeln(&format!(
            "if (!{arena}) {arena} = syl_arena_create(4096);"
        ));
        let slot = self.ctx.fresh_temp();
        self.ctx
            .writeln(&format!("syl_obj *{slot} = syl_arena_alloc({arena});"));
        slot
    }

    /// Emit a sequence of body forms; returns the last value expression.
    pub fn emit_body(&mut self, forms: &[NodeId]) -> String {
        let mut last = "SYL_NIL".to_owned();
        for &form in forms {
            last = self.emit_stmt(form);
        }
        last
    }

    /// Emit one statement: entry frees, the expression, exit frees.
    pub fn emit_stmt(&mut self, node: NodeId) -> String {
        self.suppressed.clear();
        self.emit_entry_frees(node);
        let value = self.emit_expr(node);
        self.emit_after_frees(node);
        value
    }

    // ── Free emission ───────────────────────────────────────────────

    pub fn emit_entry_frees(&mut self, anchor: NodeId) {
        let vars: Vec<VarKey> = self
            .ctx
            .analysis
            .frees_on_entry
            .get(&anchor)
            .cloned()
            .unwrap_or_default();
        for var in vars {
            self.emit_free(var);
        }
    }

    pub fn emit_after_frees(&mut self, anchor: NodeId) {
        let vars: Vec<VarKey> = self
            .ctx
            .analysis
            .frees_after
            .get(&anchor)
            .cloned()
            .unwrap_or_default();
        for var in vars {
            if self.suppressed.contains(&var) {
                continue;
            }
            self.emit_free(var);
        }
    }

    fn emit_free(&mut self, var: VarKey) {
        if self.reused.contains(&var) {
            // The paired reuse site releases or recycles this slot.
            return;
        }
        if self.cleanup_pushed.remove(&var) {
            // Unregister from the unwind frame before the normal free.
            self.ctx.writeln("syl_cleanup_pop();");
        }
        if let Some(stmt) = free_stmt(self.ctx, var) {
            self.ctx.writeln(&stmt);
        }
    }

    // ── Expression dispatch ─────────────────────────────────────────

    pub fn emit_expr(&mut self, node: NodeId) -> String {
        match self.ast.kind(node) {
            ExprKind::Int(i) => {
                if (-(1i64 << 60)..(1i64 << 60)).contains(&i) {
                    format!("syl_from_fixnum(INT64_C({i}))")
                } else {
                    format!("syl_mk_int(INT64_C({i}))")
                }
            }
            ExprKind::Float(f) => format!("syl_mk_float({f:?})"),
            ExprKind::Char(c) => format!("syl_from_char({}u)", c as u32),
            ExprKind::Nil => "SYL_NIL".to_owned(),
            ExprKind::Symbol(name) => self.emit_symbol(node, name),
            ExprKind::Cell { .. } => self.emit_form(node),
        }
    }

    fn emit_symbol(&mut self, node: NodeId, name: Name) -> String {
        match self.ctx.resolve_name(name) {
            "true" => return "SYL_TRUE".to_owned(),
            "false" => return "SYL_FALSE".to_owned(),
            _ => {}
        }
        if let Some(&key) = self.ctx.analysis.resolutions.get(&node) {
            return self.ctx.var_name(key);
        }
        if self.ctx.program.functions.contains_key(&name) {
            // A bare function reference closes over nothing.
            let tramp = format!("{}_tramp", self.ctx.mangle(name));
            let arity = self.ctx.program.functions[&name].params.len();
            let tmp = self.ctx.fresh_temp();
            self.ctx.writeln(&format!(
                "syl_value {tmp} = syl_mk_closure({tramp}, {arity}u, NULL, 0u);"
            ));
            return tmp;
        }
        panic!(
            "codegen: unresolvable symbol `{}` survived analysis",
            self.ctx.resolve_name(name)
        );
    }

    fn emit_form(&mut self, node: NodeId) -> String {
        let items = self.ast.list_items(node);
        if items.is_empty() {
            return "SYL_NIL".to_owned();
        }

        if let Some(form) = head_form(self.ast, self.ctx, node) {
            return self.emit_special(node, form, &items);
        }

        let Some(head_name) = self.ast.as_symbol(items[0]) else {
            // Computed head: evaluate and apply as a closure.
            let f = self.emit_expr(items[0]);
            return self.emit_closure_call(&f, &items[1..]);
        };

        // Local binding holding a closure?
        if self.ctx.analysis.resolutions.contains_key(&items[0]) {
            let f = self.emit_symbol(items[0], head_name);
            return self.emit_closure_call(&f, &items[1..]);
        }

        if self.ctx.program.functions.contains_key(&head_name) {
            return self.emit_user_call(head_name, &items[1..]);
        }

        if let Some(result) = self.emit_type_op(head_name, node, &items) {
            return result;
        }

        self.emit_primitive(head_name, node, &items)
    }

    // ── Calls ───────────────────────────────────────────────────────

    fn emit_user_call(&mut self, callee: Name, args: &[NodeId]) -> String {
        let summary = self.ctx.analysis.summaries.get(&callee).cloned();
        let mut arg_exprs = Vec::with_capacity(args.len());
        for (i, &arg) in args.iter().enumerate() {
            let expr = self.emit_expr(arg);
            if let (Some(summary), Some(&key)) =
                (summary.as_ref(), self.ctx.analysis.resolutions.get(&arg))
            {
                match summary.params.get(i).map(|p| p.ownership) {
                    Some(ParamOwnership::Passthrough) => {
                        // The value flows through and back; the caller
                        // must not free it around the call.
                        self.suppressed.insert(key);
                    }
                    Some(ParamOwnership::Consumed) => {
                        let last_use = self
                            .ctx
                            .analysis
                            .usage
                            .get(&key)
                            .is_some_and(|u| u.last_use == self.ast.pos(arg));
                        if last_use {
                            // The callee takes the caller's reference.
                            self.suppressed.insert(key);
                        } else {
                            self.emit_inc(key, &expr);
                        }
                    }
                    Some(ParamOwnership::Captured) => self.emit_inc(key, &expr),
                    _ => {}
                }
            }
            arg_exprs.push(expr);
        }
        let tmp = self.ctx.fresh_temp();
        let mangled = self.ctx.mangle(callee);
        self.ctx.writeln(&format!(
            "syl_value {tmp} = {mangled}({});",
            arg_exprs.join(", ")
        ));
        tmp
    }

    fn emit_closure_call(&mut self, f: &str, args: &[NodeId]) -> String {
        let mut arg_exprs = Vec::with_capacity(args.len());
        for &arg in args {
            let expr = self.emit_expr(arg);
            // Unknown callee: transfer ownership conservatively.
            if let Some(&key) = self.ctx.analysis.resolutions.get(&arg) {
                self.emit_inc(key, &expr);
            }
            arg_exprs.push(expr);
        }
        let tmp = self.ctx.fresh_temp();
        if arg_exprs.is_empty() {
            self.ctx
                .writeln(&format!("syl_value {tmp} = syl_closure_apply({f}, NULL, 0u);"));
        } else {
            self.ctx.writeln(&format!(
                "syl_value {tmp} = syl_closure_apply({f}, (syl_value[]){{{}}}, {}u);",
                arg_exprs.join(", "),
                arg_exprs.len()
            ));
        }
        tmp
    }

    /// Increment a variable's refcount unless the elision table says the
    /// operation is dead; atomic where the value is shared.
    fn emit_inc(&mut self, key: VarKey, expr: &str) {
        if self.ctx.can_elide_inc(key) {
            return;
        }
        if self.ctx.is_shared(key) {
            self.ctx.writeln(&format!("syl_inc_ref_atomic({expr});"));
        } else {
            self.ctx.writeln(&format!("syl_inc_ref({expr});"));
        }
    }

    /// Increment when the operand is a resolved variable (aliasing);
    /// fresh expressions move instead.
    fn emit_inc_if_var(&mut self, arg: NodeId, expr: &str) {
        if let Some(&key) = self.ctx.analysis.resolutions.get(&arg) {
            self.emit_inc(key, expr);
        }
    }

    // ── Special forms ───────────────────────────────────────────────

    #[expect(clippy::too_many_lines, reason = "one arm per special form")]
    fn emit_special(&mut self, node: NodeId, form: SpecialForm, items: &[NodeId]) -> String {
        match form {
            SpecialForm::Let => self.emit_let(items),
            SpecialForm::If => self.emit_if(node, items),
            SpecialForm::Begin => self.emit_body_values(&items[1..]),
            SpecialForm::While => self.emit_while(items),
            SpecialForm::ForEach => self.emit_for_each(node, items),
            SpecialForm::Map | SpecialForm::Filter => self.emit_map_filter(node, form, items),
            SpecialForm::Fold => self.emit_fold(node, items),
            SpecialForm::Try => self.emit_try(node, items),
            SpecialForm::Throw => {
                let v = self.emit_expr(items[1]);
                self.ctx.writeln(&format!("syl_throw({v});"));
                "SYL_NIL".to_owned()
            }
            SpecialForm::Error => {
                let msg = items.get(1).copied();
                match msg.map(|m| self.ast.kind(m)) {
                    Some(ExprKind::Symbol(name)) => {
                        let text = self.ctx.resolve_name(name).to_owned();
                        self.ctx.writeln(&format!(
                            "syl_throw(syl_mk_error(\"{}\", SYL_NIL));",
                            escape_c(&text)
                        ));
                    }
                    Some(_) => {
                        let v = self.emit_expr(msg.expect("checked above"));
                        self.ctx
                            .writeln(&format!("syl_throw(syl_mk_error(\"error\", {v}));"));
                    }
                    None => {
                        self.ctx.writeln("syl_throw(syl_mk_error(\"error\", SYL_NIL));");
                    }
                }
                "SYL_NIL".to_owned()
            }
            SpecialForm::Set => {
                let target = items[1];
                let key = *self
                    .ctx
                    .analysis
                    .resolutions
                    .get(&target)
                    .expect("set! targets resolve during analysis");
                let var = self.ctx.var_name(key);
                let value = self.emit_expr(items[2]);
                self.emit_inc_if_var(items[2], &value);
                // The displaced value releases by the binding's strategy.
                if self
                    .ctx
                    .analysis
                    .owner(key)
                    .is_some_and(|o| o.must_free)
                {
                    if let Some(stmt) = free_stmt(self.ctx, key) {
                        self.ctx.writeln(&stmt);
                    }
                }
                self.ctx.writeln(&format!("{var} = {value};"));
                "SYL_NIL".to_owned()
            }
            SpecialForm::Lambda | SpecialForm::Spawn => self.emit_closure_create(node, form),
            SpecialForm::Chan => {
                let cap = self.emit_expr(items[1]);
                let tmp = self.ctx.fresh_temp();
                self.ctx.writeln(&format!(
                    "syl_value {tmp} = syl_make_channel((uint32_t)syl_to_fixnum({cap}));"
                ));
                tmp
            }
            SpecialForm::Send => {
                let chan = self.emit_expr(items[1]);
                let payload = self.emit_expr(items[2]);
                let transfers = self
                    .ctx
                    .analysis
                    .channel_transfers
                    .get(&node)
                    .copied()
                    .unwrap_or(false);
                if !transfers {
                    // Both sides own: publish a second reference.
                    self.ctx.writeln(&format!("syl_inc_ref_atomic({payload});"));
                }
                let tmp = self.ctx.fresh_temp();
                self.ctx.writeln(&format!(
                    "syl_value {tmp} = syl_from_bool(syl_channel_send({chan}, {payload}));"
                ));
                tmp
            }
            SpecialForm::Recv => {
                let chan = self.emit_expr(items[1]);
                let tmp = self.ctx.fresh_temp();
                self.ctx
                    .writeln(&format!("syl_value {tmp} = syl_channel_recv({chan});"));
                tmp
            }
            SpecialForm::Close => {
                let chan = self.emit_expr(items[1]);
                self.ctx.writeln(&format!("syl_channel_close({chan});"));
                "SYL_NIL".to_owned()
            }
            SpecialForm::Atom => {
                let v = self.emit_expr(items[1]);
                self.emit_inc_if_var(items[1], &v);
                let tmp = self.ctx.fresh_temp();
                self.ctx.writeln(&format!("syl_value {tmp} = syl_make_atom({v});"));
                tmp
            }
            SpecialForm::Deref => {
                let a = self.emit_expr(items[1]);
                let tmp = self.ctx.fresh_temp();
                self.ctx.writeln(&format!("syl_value {tmp} = syl_atom_deref({a});"));
                tmp
            }
            SpecialForm::Reset => {
                let a = self.emit_expr(items[1]);
                let v = self.emit_expr(items[2]);
                self.emit_inc_if_var(items[2], &v);
                let tmp = self.ctx.fresh_temp();
                self.ctx
                    .writeln(&format!("syl_value {tmp} = syl_atom_reset({a}, {v});"));
                tmp
            }
            SpecialForm::Swap => {
                let a = self.emit_expr(items[1]);
                let f = self.emit_fn_value(items[2]);
                let tmp = self.ctx.fresh_temp();
                self.ctx
                    .writeln(&format!("syl_value {tmp} = syl_atom_swap({a}, {f});"));
                tmp
            }
            SpecialForm::Cas => {
                let a = self.emit_expr(items[1]);
                let old = self.emit_expr(items[2]);
                let new = self.emit_expr(items[3]);
                self.emit_inc_if_var(items[3], &new);
                let ok = self.ctx.fresh_temp();
                self.ctx.writeln(&format!(
                    "bool {ok} = syl_atom_cas({a}, {old}, {new});"
                ));
                if self.ctx.analysis.resolutions.contains_key(&items[3]) {
                    self.ctx
                        .writeln(&format!("if (!{ok}) syl_dec_ref_atomic({new});"));
                }
                let tmp = self.ctx.fresh_temp();
                self.ctx
                    .writeln(&format!("syl_value {tmp} = syl_from_bool({ok});"));
                tmp
            }
            SpecialForm::Box => {
                let v = self.emit_expr(items[1]);
                self.emit_inc_if_var(items[1], &v);
                let tmp = self.ctx.fresh_temp();
                self.ctx.writeln(&format!("syl_value {tmp} = syl_mk_box({v});"));
                tmp
            }
            SpecialForm::Unbox => {
                let b = self.emit_expr(items[1]);
                let tmp = self.ctx.fresh_temp();
                self.ctx.writeln(&format!("syl_value {tmp} = syl_box_get({b});"));
                tmp
            }
            SpecialForm::SetBox => {
                let b = self.emit_expr(items[1]);
                let v = self.emit_expr(items[2]);
                self.emit_inc_if_var(items[2], &v);
                self.ctx.writeln(&format!("syl_box_set({b}, {v});"));
                "SYL_NIL".to_owned()
            }
            SpecialForm::Freeze => {
                let v = self.emit_expr(items[1]);
                let tmp = self.ctx.fresh_temp();
                self.ctx.writeln(&format!("syl_value {tmp} = syl_freeze({v});"));
                tmp
            }
            SpecialForm::Define | SpecialForm::Deftype => {
                panic!("codegen: definition form survived analysis in expression position")
            }
        }
    }

    fn emit_let(&mut self, items: &[NodeId]) -> String {
        let bindings = self.ast.list_items(items[1]);
        for binding in bindings {
            let parts = self.ast.list_items(binding);
            let (name_node, init) = (parts[0], parts[1]);
            let key = self.binding_key(name_node);
            let var = self.ctx.var_name(key);

            let alloc = self.ctx.analysis.owner(key).map(|o| (o.alloc, o.shape));
            let (saved_stack, saved_arena) = (self.stack_init, self.arena_init);
            self.stack_init = matches!(alloc, Some((AllocStrategy::Stack, shape)) if shape != Shape::Scalar);
            self.arena_init = matches!(alloc, Some((AllocStrategy::Arena, _)));
            let value = self.emit_expr(init);
            self.stack_init = saved_stack;
            self.arena_init = saved_arena;

            self.ctx.writeln(&format!("syl_value {var} = {value};"));

            if self.try_depth > 0
                && self.ctx.analysis.owner(key).is_some_and(|o| o.must_free)
            {
                self.ctx.writeln(&format!("syl_cleanup_push({var});"));
                self.cleanup_pushed.insert(key);
            }
            self.emit_after_frees(binding);
        }
        self.emit_body_values(&items[2..])
    }

    /// Body forms of a block: all but the last are statements, the last
    /// is the block's value.
    fn emit_body_values(&mut self, forms: &[NodeId]) -> String {
        let Some((&last, init)) = forms.split_last() else {
            return "SYL_NIL".to_owned();
        };
        for &f in init {
            self.emit_entry_frees(f);
            self.emit_expr(f);
            self.emit_after_frees(f);
        }
        self.emit_entry_frees(last);
        let value = self.emit_expr(last);
        self.emit_after_frees(last);
        value
    }

    fn emit_if(&mut self, node: NodeId, items: &[NodeId]) -> String {
        let cond = self.emit_expr(items[1]);
        let tmp = self.ctx.fresh_temp();
        self.ctx.writeln(&format!("syl_value {tmp} = SYL_NIL;"));
        self.ctx.writeln(&format!("if (syl_is_truthy({cond})) {{"));
        self.ctx.indent();
        if let Some(&then_root) = items.get(2) {
            self.emit_entry_frees(then_root);
            let v = self.emit_expr(then_root);
            self.ctx.writeln(&format!("{tmp} = {v};"));
        }
        self.ctx.dedent();
        self.ctx.writeln("} else {");
        self.ctx.indent();
        match items.get(3) {
            Some(&else_root) => {
                self.emit_entry_frees(else_root);
                let v = self.emit_expr(else_root);
                self.ctx.writeln(&format!("{tmp} = {v};"));
            }
            None => {
                // Implicit else arm: branch-specific frees keyed by the
                // `if` node itself.
                let vars: Vec<VarKey> = self
                    .ctx
                    .analysis
                    .frees_else
                    .get(&node)
                    .cloned()
                    .unwrap_or_default();
                for var in vars {
                    self.emit_free(var);
                }
            }
        }
        self.ctx.dedent();
        self.ctx.writeln("}");
        tmp
    }

    fn emit_while(&mut self, items: &[NodeId]) -> String {
        self.ctx.writeln("for (;;) {");
        self.ctx.indent();
        let cond = self.emit_expr(items[1]);
        self.ctx.writeln(&format!("if (!syl_is_truthy({cond})) break;"));
        for &f in &items[2..] {
            self.emit_entry_frees(f);
            self.emit_expr(f);
            self.emit_after_frees(f);
        }
        self.ctx.dedent();
        self.ctx.writeln("}");
        "SYL_NIL".to_owned()
    }

    /// Whether a loop at `node` holds a tethered loop borrow on `coll`.
    fn loop_tether(&self, node: NodeId, coll: NodeId) -> Option<VarKey> {
        let key = *self.ctx.analysis.resolutions.get(&coll)?;
        let pos = self.ast.pos(node);
        self.ctx
            .analysis
            .borrows
            .get(&key)?
            .iter()
            .find(|b| b.needs_tether && b.start == pos)
            .map(|_| key)
    }

    fn emit_for_each(&mut self, node: NodeId, items: &[NodeId]) -> String {
        let var_key = self.binding_key(items[1]);
        let var = self.ctx.var_name(var_key);
        let coll = self.emit_expr(items[2]);

        let tether = self.loop_tether(node, items[2]);
        if let Some(key) = tether {
            let name = self.ctx.var_name(key);
            self.ctx.writeln(&format!("syl_tether_acquire({name});"));
        }

        let it = self.ctx.fresh_temp();
        self.ctx.writeln(&format!(
            "for (syl_value {it} = {coll}; syl_is_truthy(syl_is_pair_p({it})); {it} = syl_tail({it})) {{"
        ));
        self.ctx.indent();
        self.ctx
            .writeln(&format!("syl_value {var} = syl_head({it});"));
        for &f in &items[3..] {
            self.emit_entry_frees(f);
            self.emit_expr(f);
            self.emit_after_frees(f);
        }
        self.ctx.dedent();
        self.ctx.writeln("}");

        if let Some(key) = tether {
            let name = self.ctx.var_name(key);
            self.ctx.writeln(&format!("syl_tether_release({name});"));
        }
        "SYL_NIL".to_owned()
    }

    fn emit_map_filter(&mut self, node: NodeId, form: SpecialForm, items: &[NodeId]) -> String {
        let coll_node = items[2];
        let f_node = items[1];
        let coll = self.emit_expr(coll_node);

        let tether = self.loop_tether(node, coll_node);
        if let Some(key) = tether {
            let name = self.ctx.var_name(key);
            self.ctx.writeln(&format!("syl_tether_acquire({name});"));
        }

        let acc = self.ctx.fresh_temp();
        let it = self.ctx.fresh_temp();
        self.ctx.writeln(&format!("syl_value {acc} = SYL_NIL;"));
        self.ctx.writeln(&format!(
            "for (syl_value {it} = {coll}; syl_is_truthy(syl_is_pair_p({it})); {it} = syl_tail({it})) {{"
        ));
        self.ctx.indent();
        let elem = self.ctx.fresh_temp();
        self.ctx.writeln(&format!("syl_value {elem} = syl_head({it});"));
        match form {
            SpecialForm::Map => {
                let mapped = self.emit_apply_fn(f_node, &[elem]);
                self.ctx
                    .writeln(&format!("{acc} = syl_mk_pair({mapped}, {acc});"));
            }
            _ => {
                let keep = self.emit_apply_fn(f_node, &[elem.clone()]);
                self.ctx.writeln(&format!("if (syl_is_truthy({keep})) {{"));
                self.ctx.indent();
                // Kept elements alias the source list.
                self.ctx.writeln(&format!("syl_inc_ref({elem});"));
                self.ctx
                    .writeln(&format!("{acc} = syl_mk_pair({elem}, {acc});"));
                self.ctx.dedent();
                self.ctx.writeln("}");
            }
        }
        self.ctx.dedent();
        self.ctx.writeln("}");

        if let Some(key) = tether {
            let name = self.ctx.var_name(key);
            self.ctx.writeln(&format!("syl_tether_release({name});"));
        }

        let tmp = self.ctx.fresh_temp();
        self.ctx
            .writeln(&format!("syl_value {tmp} = syl_list_reverse({acc});"));
        tmp
    }

    fn emit_fold(&mut self, node: NodeId, items: &[NodeId]) -> String {
        let f_node = items[1];
        let init_node = items[2];
        let coll_node = items[3];

        let acc = self.ctx.fresh_temp();
        let init = self.emit_expr(init_node);
        self.ctx.writeln(&format!("syl_value {acc} = {init};"));
        let coll = self.emit_expr(coll_node);

        let tether = self.loop_tether(node, coll_node);
        if let Some(key) = tether {
            let name = self.ctx.var_name(key);
            self.ctx.writeln(&format!("syl_tether_acquire({name});"));
        }

        let it = self.ctx.fresh_temp();
        self.ctx.writeln(&format!(
            "for (syl_value {it} = {coll}; syl_is_truthy(syl_is_pair_p({it})); {it} = syl_tail({it})) {{"
        ));
        self.ctx.indent();
        let elem = self.ctx.fresh_temp();
        self.ctx.writeln(&format!("syl_value {elem} = syl_head({it});"));
        let next = self.emit_apply_fn(f_node, &[acc.clone(), elem]);
        self.ctx.writeln(&format!("{acc} = {next};"));
        self.ctx.dedent();
        self.ctx.writeln("}");

        if let Some(key) = tether {
            let name = self.ctx.var_name(key);
            self.ctx.writeln(&format!("syl_tether_release({name});"));
        }
        acc
    }

    /// Apply a function-position operand: direct call for named
    /// functions, closure application otherwise.
    fn emit_apply_fn(&mut self, f_node: NodeId, args: &[String]) -> String {
        if let Some(name) = self.ast.as_symbol(f_node) {
            if !self.ctx.analysis.resolutions.contains_key(&f_node)
                && self.ctx.program.functions.contains_key(&name)
            {
                let tmp = self.ctx.fresh_temp();
                let mangled = self.ctx.mangle(name);
                self.ctx.writeln(&format!(
                    "syl_value {tmp} = {mangled}({});",
                    args.join(", ")
                ));
                return tmp;
            }
        }
        let f = self.emit_expr(f_node);
        let tmp = self.ctx.fresh_temp();
        self.ctx.writeln(&format!(
            "syl_value {tmp} = syl_closure_apply({f}, (syl_value[]){{{}}}, {}u);",
            args.join(", "),
            args.len()
        ));
        tmp
    }

    /// A function value for positions that need a closure object.
    fn emit_fn_value(&mut self, f_node: NodeId) -> String {
        if let Some(name) = self.ast.as_symbol(f_node) {
            if !self.ctx.analysis.resolutions.contains_key(&f_node)
                && self.ctx.program.functions.contains_key(&name)
            {
                return self.emit_symbol(f_node, name);
            }
        }
        self.emit_expr(f_node)
    }

    fn emit_try(&mut self, node: NodeId, items: &[NodeId]) -> String {
        let tmp = self.ctx.fresh_temp();
        let frame = self.ctx.fresh_temp();
        self.ctx.writeln(&format!("syl_value {tmp} = SYL_NIL;"));
        self.ctx.writeln("{");
        self.ctx.indent();
        self.ctx
            .writeln(&format!("syl_frame *{frame} = syl_try_enter();"));
        self.ctx.writeln(&format!(
            "if (setjmp(*(jmp_buf *)syl_frame_jmpbuf({frame})) == 0) {{"
        ));
        self.ctx.indent();
        self.try_depth += 1;
        if let Some(&body) = items.get(1) {
            self.emit_entry_frees(body);
            let v = self.emit_expr(body);
            self.ctx.writeln(&format!("{tmp} = {v};"));
        }
        self.try_depth -= 1;
        // The frame and its registrations die with the try.
        self.cleanup_pushed.clear();
        self.ctx.writeln("syl_try_exit();");
        self.ctx.dedent();
        self.ctx.writeln("} else {");
        self.ctx.indent();

        // Tethers acquired inside the body never saw their release on
        // the unwound path; drop them here.
        let body_extent = items.get(1).map(|&b| {
            (
                self.ast.pos(b),
                Program::subtree_end(self.ast, b),
            )
        });
        if let Some((start, end)) = body_extent {
            let tethered: Vec<VarKey> = self
                .ctx
                .analysis
                .borrows
                .iter()
                .flat_map(|(&k, bs)| bs.iter().map(move |b| (k, b)))
                .filter(|(_, b)| b.needs_tether && b.start >= start && b.end <= end)
                .map(|(k, _)| k)
                .collect();
            for key in tethered {
                let name = self.ctx.var_name(key);
                self.ctx.writeln(&format!("syl_tether_release({name});"));
            }
        }

        if let Some(&catch) = items.get(2) {
            let catch_items = self.ast.list_items(catch);
            let err_key = self.binding_key(catch_items[1]);
            let err_var = self.ctx.var_name(err_key);
            self.ctx
                .writeln(&format!("syl_value {err_var} = syl_current_error();"));
            self.emit_entry_frees(catch);
            let v = self.emit_body_values(&catch_items[2..]);
            self.ctx.writeln(&format!("{tmp} = {v};"));
        }
        self.ctx.dedent();
        self.ctx.writeln("}");
        self.ctx.dedent();
        self.ctx.writeln("}");
        tmp
    }

    fn emit_closure_create(&mut self, node: NodeId, form: SpecialForm) -> String {
        let fn_name = self.ctx.closure_fns[&node].clone();
        let captures: Vec<VarKey> = self
            .ctx
            .analysis
            .captures
            .get(&node)
            .cloned()
            .unwrap_or_default();
        let arity = if form == SpecialForm::Lambda {
            self.ast
                .list_nth(node, 1)
                .map_or(0, |p| self.ast.list_len(p))
        } else {
            0
        };

        // The closure owns one reference per capture.
        for &key in &captures {
            let name = self.ctx.var_name(key);
            self.emit_inc(key, &name);
        }

        let tmp = self.ctx.fresh_temp();
        if captures.is_empty() {
            self.ctx.writeln(&format!(
                "syl_value {tmp} = syl_mk_closure({fn_name}, {arity}u, NULL, 0u);"
            ));
        } else {
            let caps: Vec<String> = captures.iter().map(|&k| self.ctx.var_name(k)).collect();
            self.ctx.writeln(&format!(
                "syl_value {tmp} = syl_mk_closure({fn_name}, {arity}u, (syl_value[]){{{}}}, {}u);",
                caps.join(", "),
                captures.len()
            ));
        }

        if form == SpecialForm::Spawn {
            let th = self.ctx.fresh_temp();
            self.ctx
                .writeln(&format!("syl_value {th} = syl_spawn_thread({tmp});"));
            return th;
        }
        tmp
    }

    // ── Type operations (make-T, T-field, set-T-field!, T?) ────────

    fn emit_type_op(&mut self, head: Name, node: NodeId, items: &[NodeId]) -> Option<String> {
        let head_str = self.ctx.resolve_name(head).to_owned();

        if let Some(ty) = head_str.strip_prefix("make-") {
            let ty_name = self.find_type(ty)?;
            return Some(self.emit_make_user(ty_name, node, &items[1..]));
        }

        if let Some(ty) = head_str.strip_suffix('?') {
            if let Some(ty_name) = self.find_type(ty) {
                let id = self.ctx.type_ids[&ty_name];
                let v = self.emit_expr(items[1]);
                let tmp = self.ctx.fresh_temp();
                self.ctx.writeln(&format!(
                    "syl_value {tmp} = syl_is_user_p({v}, {id}u);"
                ));
                return Some(tmp);
            }
        }

        if let Some(rest) = head_str.strip_prefix("set-") {
            if let Some(body) = rest.strip_suffix('!') {
                if let Some((ty_name, field_idx)) = self.find_field(body) {
                    let _ = ty_name;
                    let obj = self.emit_expr(items[1]);
                    let v = self.emit_expr(items[2]);
                    self.emit_inc_if_var(items[2], &v);
                    self.ctx.writeln(&format!(
                        "syl_user_set({obj}, {field_idx}u, {v});"
                    ));
                    return Some("SYL_NIL".to_owned());
                }
            }
        }

        if let Some((ty_name, field_idx)) = self.find_field(&head_str) {
            let _ = ty_name;
            let obj = self.emit_expr(items[1]);
            let tmp = self.ctx.fresh_temp();
            self.ctx
                .writeln(&format!("syl_value {tmp} = syl_user_get({obj}, {field_idx}u);"));
            return Some(tmp);
        }

        None
    }

    fn find_type(&self, name: &str) -> Option<Name> {
        self.ctx
            .analysis
            .shapes
            .keys()
            .find(|&&ty| self.ctx.resolve_name(ty) == name)
            .copied()
    }

    /// Resolve `T-field` to the type and field index.
    fn find_field(&self, accessor: &str) -> Option<(Name, usize)> {
        for (&ty, info) in &self.ctx.analysis.shapes {
            let ty_str = self.ctx.resolve_name(ty);
            let Some(rest) = accessor.strip_prefix(ty_str) else {
                continue;
            };
            let Some(field_str) = rest.strip_prefix('-') else {
                continue;
            };
            if let Some(idx) = info
                .fields
                .iter()
                .position(|f| self.ctx.resolve_name(f.name) == field_str)
            {
                return Some((ty, idx));
            }
        }
        None
    }

    fn emit_make_user(&mut self, ty_name: Name, node: NodeId, args: &[NodeId]) -> String {
        let id = self.ctx.type_ids[&ty_name];
        let back_edges = format!("{}_back_edges", self.ctx.mangle(ty_name));
        let mut field_exprs = Vec::with_capacity(args.len());
        for &arg in args {
            let expr = self.emit_expr(arg);
            self.emit_inc_if_var(arg, &expr);
            field_exprs.push(expr);
        }
        let fields = field_exprs.join(", ");
        let n = field_exprs.len();
        let tmp = self.ctx.fresh_temp();

        if self.arena_init {
            let slot = self.emit_arena_slot();
            self.ctx.writeln(&format!(
                "syl_value {tmp} = syl_reuse_user({slot}, {id}u, {n}u, (syl_value[]){{{fields}}}, {back_edges});"
            ));
            return tmp;
        }

        if self.stack_init {
            let pool = self.pool.clone().unwrap_or_else(|| {
                panic!("codegen: stack allocation without a function pool")
            });
            let store = self.ctx.fresh_temp();
            self.ctx
                .writeln(&format!("syl_value {store}[{}];", n.max(1)));
            self.ctx.writeln(&format!(
                "syl_value {tmp} = syl_mk_user_at({pool}, {id}u, {n}u, {store}, (syl_value[]){{{fields}}}, {back_edges});"
            ));
            return tmp;
        }

        if let Some(&freed) = self.reuse_allocs.get(&node) {
            let freed_var = self.ctx.var_name(freed);
            let slot = self.ctx.fresh_temp();
            self.ctx.writeln(&format!(
                "syl_obj *{slot} = syl_reuse_or_free({freed_var});"
            ));
            self.ctx.writeln(&format!(
                "syl_value {tmp} = {slot} ? syl_reuse_user({slot}, {id}u, {n}u, (syl_value[]){{{fields}}}, {back_edges}) : syl_mk_user({id}u, {n}u, (syl_value[]){{{fields}}}, {back_edges});"
            ));
            return tmp;
        }

        self.ctx.writeln(&format!(
            "syl_value {tmp} = syl_mk_user({id}u, {n}u, (syl_value[]){{{fields}}}, {back_edges});"
        ));
        tmp
    }

    // ── Primitives ──────────────────────────────────────────────────

    fn emit_primitive(&mut self, head: Name, node: NodeId, items: &[NodeId]) -> String {
        let head_str = self.ctx.resolve_name(head).to_owned();
        let args = &items[1..];

        match head_str.as_str() {
            "+" | "-" | "*" | "/" => {
                let op = match head_str.as_str() {
                    "+" => "syl_add",
                    "-" => "syl_sub",
                    "*" => "syl_mul",
                    _ => "syl_div",
                };
                let mut acc = self.emit_expr(args[0]);
                for &arg in &args[1..] {
                    let rhs = self.emit_expr(arg);
                    let tmp = self.ctx.fresh_temp();
                    self.ctx
                        .writeln(&format!("syl_value {tmp} = {op}({acc}, {rhs});"));
                    acc = tmp;
                }
                acc
            }
            "mod" => self.emit_binary_prim("syl_mod", args),
            "<" => self.emit_binary_prim("syl_lt", args),
            ">" => self.emit_binary_prim("syl_gt", args),
            "<=" => self.emit_binary_prim("syl_le", args),
            ">=" => self.emit_binary_prim("syl_ge", args),
            "=" => self.emit_binary_prim("syl_num_eq", args),
            "!=" => self.emit_binary_prim("syl_num_ne", args),
            "not" => {
                let v = self.emit_expr(args[0]);
                let tmp = self.ctx.fresh_temp();
                self.ctx.writeln(&format!("syl_value {tmp} = syl_not({v});"));
                tmp
            }
            "and" => {
                let tmp = self.ctx.fresh_temp();
                let first = self.emit_expr(args[0]);
                self.ctx.writeln(&format!("syl_value {tmp} = {first};"));
                for &arg in &args[1..] {
                    self.ctx
                        .writeln(&format!("if (syl_is_truthy({tmp})) {{"));
                    self.ctx.indent();
                    let v = self.emit_expr(arg);
                    self.ctx.writeln(&format!("{tmp} = {v};"));
                    self.ctx.dedent();
                    self.ctx.writeln("}");
                }
                tmp
            }
            "or" => {
                let tmp = self.ctx.fresh_temp();
                let first = self.emit_expr(args[0]);
                self.ctx.writeln(&format!("syl_value {tmp} = {first};"));
                for &arg in &args[1..] {
                    self.ctx
                        .writeln(&format!("if (!syl_is_truthy({tmp})) {{"));
                    self.ctx.indent();
                    let v = self.emit_expr(arg);
                    self.ctx.writeln(&format!("{tmp} = {v};"));
                    self.ctx.dedent();
                    self.ctx.writeln("}");
                }
                tmp
            }
            "cons" => self.emit_cons(node, args),
            "list" => {
                let mut exprs = Vec::with_capacity(args.len());
                for &arg in args {
                    let e = self.emit_expr(arg);
                    self.emit_inc_if_var(arg, &e);
                    exprs.push(e);
                }
                let mut acc = "SYL_NIL".to_owned();
                for e in exprs.into_iter().rev() {
                    acc = self.emit_pair(&e, &acc);
                }
                acc
            }
            "head" => self.emit_unary_prim("syl_head", args),
            "tail" => self.emit_unary_prim("syl_tail", args),
            "null?" => self.emit_unary_prim("syl_is_nil_p", args),
            "pair?" => self.emit_unary_prim("syl_is_pair_p", args),
            "int?" => self.emit_unary_prim("syl_is_int_p", args),
            "float?" => self.emit_unary_prim("syl_is_float_p", args),
            "char?" => self.emit_unary_prim("syl_is_char_p", args),
            "sym?" => self.emit_unary_prim("syl_is_sym_p", args),
            "bool?" => self.emit_unary_prim("syl_is_bool_p", args),
            "char->int" => self.emit_unary_prim("syl_char_to_int", args),
            "int->char" => self.emit_unary_prim("syl_int_to_char", args),
            "join" => self.emit_unary_prim("syl_thread_join", args),
            "print" => {
                let v = self.emit_expr(args[0]);
                self.ctx.writeln(&format!("syl_print({v});"));
                "SYL_NIL".to_owned()
            }
            other => panic!("codegen: unknown operator `{other}` survived analysis"),
        }
    }

    fn emit_cons(&mut self, node: NodeId, args: &[NodeId]) -> String {
        let head = self.emit_expr(args[0]);
        self.emit_inc_if_var(args[0], &head);
        let tail = self.emit_expr(args[1]);
        self.emit_inc_if_var(args[1], &tail);

        if self.stack_init {
            return self.emit_pair(&head, &tail);
        }

        if let Some(&freed) = self.reuse_allocs.get(&node) {
            let freed_var = self.ctx.var_name(freed);
            let slot = self.ctx.fresh_temp();
            let tmp = self.ctx.fresh_temp();
            self.ctx.writeln(&format!(
                "syl_obj *{slot} = syl_reuse_or_free({freed_var});"
            ));
            self.ctx.writeln(&format!(
                "syl_value {tmp} = {slot} ? syl_reuse_pair({slot}, {head}, {tail}) : syl_mk_pair({head}, {tail});"
            ));
            return tmp;
        }

        self.emit_pair(&head, &tail)
    }

    /// Emit a pair construction: into the function pool when building a
    /// stack-allocated value, into the arena for arena bindings, onto
    /// the heap otherwise.
    fn emit_pair(&mut self, head: &str, tail: &str) -> String {
        if self.arena_init {
            let slot = self.emit_arena_slot();
            let tmp = self.ctx.fresh_temp();
            self.ctx.writeln(&format!(
                "syl_value {tmp} = syl_reuse_pair({slot}, {head}, {tail});"
            ));
            return tmp;
        }
        let tmp = self.ctx.fresh_temp();
        if self.stack_init {
            let pool = self
                .pool
                .clone()
                .unwrap_or_else(|| panic!("codegen: stack allocation without a function pool"));
            self.ctx.writeln(&format!(
                "syl_value {tmp} = syl_mk_pair_at({pool}, {head}, {tail});"
            ));
        } else {
            self.ctx
                .writeln(&format!("syl_value {tmp} = syl_mk_pair({head}, {tail});"));
        }
        tmp
    }

    fn emit_unary_prim(&mut self, op: &str, args: &[NodeId]) -> String {
        let v = self.emit_expr(args[0]);
        let tmp = self.ctx.fresh_temp();
        self.ctx.writeln(&format!("syl_value {tmp} = {op}({v});"));
        tmp
    }

    fn emit_binary_prim(&mut self, op: &str, args: &[NodeId]) -> String {
        let a = self.emit_expr(args[0]);
        let b = self.emit_expr(args[1]);
        let tmp = self.ctx.fresh_temp();
        self.ctx
            .writeln(&format!("syl_value {tmp} = {op}({a}, {b});"));
        tmp
    }

    /// The binding introduced at a definition-site name node.
    pub fn binding_key(&self, name_node: NodeId) -> VarKey {
        let name = self
            .ast
            .as_symbol(name_node)
            .expect("binding sites are symbols after analysis");
        let pos = self.ast.pos(name_node);
        self.ctx
            .analysis
            .usage
            .iter()
            .find(|(k, u)| k.name == name && u.def_pos == pos)
            .map(|(&k, _)| k)
            .unwrap_or_else(|| {
                panic!(
                    "codegen: binding `{}` missing from the usage table",
                    self.ctx.resolve_name(name)
                )
            })
    }
}

/// The special form at a node's head, resolved through the emitter's
/// interner.
fn head_form(ast: &Ast, ctx: &CodegenContext<'_>, node: NodeId) -> Option<SpecialForm> {
    let name = ast.head_symbol(node)?;
    SpecialForm::from_str(ctx.resolve_name(name))
}

/// Escape a string for a C literal.
fn escape_c(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}

/// Global bindings referenced from `ScopeId::TOP`.
pub(crate) fn global_key(name: Name) -> VarKey {
    VarKey::new(ScopeId::TOP, name)
}
