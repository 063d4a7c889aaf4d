//! Scope resolution and the variable-usage table.
//!
//! The first analysis pass. Walks every top-level form, builds the scope
//! tree, binds every symbol reference to its definition, and fills the
//! usage table (definition position, first/last use, read/write/parameter/
//! captured flags). Later passes never look at raw symbols again — they go
//! through `ctx.resolutions`.
//!
//! Definitions are hoisted: all `define`d functions and `deftype`s of a
//! unit are registered before any body is walked, so recursion and
//! forward references resolve.
//!
//! Reports the resolution diagnostics (unbound symbol, `set!` on an
//! unknown name, arity mismatch, malformed forms); the unit aborts on the
//! first one.

use rustc_hash::{FxHashMap, FxHashSet};

use sylva_ast::{Ast, ExprKind, Name, NodeId, Pos, SpecialForm, StringInterner};
use sylva_diagnostic::{Diagnostic, ErrorCode};

use crate::context::{AnalysisContext, ScopeId, UsageFlags, UsageInfo, VarKey};

/// A user function definition.
#[derive(Clone, Debug)]
pub struct FnDef {
    pub name: Name,
    pub params: Vec<Name>,
    /// Body forms in order; the last is the return expression.
    pub body: Vec<NodeId>,
    /// The function's own scope (parameters bind here).
    pub scope: ScopeId,
    pub node: NodeId,
}

/// A top-level `(define name expr)`.
#[derive(Clone, Copy, Debug)]
pub struct GlobalDef {
    pub name: Name,
    pub value: NodeId,
    pub node: NodeId,
}

/// One scope in the scope tree.
#[derive(Clone, Copy, Debug)]
pub struct ScopeData {
    pub parent: Option<ScopeId>,
    /// Pre-order extent of the form that created the scope.
    pub start: Pos,
    pub end: Pos,
}

/// The resolved unit: definitions plus the scope tree.
#[derive(Default, Debug)]
pub struct Program {
    pub functions: FxHashMap<Name, FnDef>,
    /// Function names in definition order (map iteration is unordered).
    pub fn_order: Vec<Name>,
    pub globals: Vec<GlobalDef>,
    /// `deftype` forms in order.
    pub types: Vec<NodeId>,
    /// Non-definition top-level forms in order (the unit's entry body).
    pub toplevel: Vec<NodeId>,
    pub scopes: Vec<ScopeData>,
    /// Initializer expression per binding, where the binding form has one
    /// (`let` bindings and global `define`s).
    pub binding_inits: FxHashMap<VarKey, NodeId>,
    /// Scope introduced by each `lambda` / `spawn` node. Closure bodies
    /// get their own CFG pass keyed through this map.
    pub lambda_scopes: FxHashMap<NodeId, ScopeId>,
}

impl Program {
    /// Last pre-order position inside a node's subtree.
    pub fn subtree_end(ast: &Ast, node: NodeId) -> Pos {
        let mut end = ast.pos(node);
        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            let p = ast.pos(id);
            if p > end {
                end = p;
            }
            if let ExprKind::Cell { head, tail } = ast.kind(id) {
                stack.push(head);
                stack.push(tail);
            }
        }
        end
    }
}

/// Names that are always bound: the primitive operations the runtime
/// provides.
pub const PRIMITIVES: &[&str] = &[
    "+", "-", "*", "/", "mod", "<", ">", "<=", ">=", "=", "!=", "not", "and", "or", "print",
    "cons", "head", "tail", "list", "null?", "pair?", "int?", "float?", "char?", "sym?", "bool?",
    "char->int", "int->char", "join", "true", "false",
];

/// Run resolution over a unit.
pub fn resolve_unit(
    ast: &Ast,
    interner: &StringInterner,
    ctx: &mut AnalysisContext,
) -> Result<Program, Diagnostic> {
    tracing::debug!(roots = ast.roots().len(), "resolving unit");

    let mut resolver = Resolver {
        ast,
        interner,
        ctx,
        program: Program::default(),
        scope_stack: vec![],
        bindings: vec![],
        lambda_stack: vec![],
        primitives: PRIMITIVES.iter().map(|p| interner.intern(p)).collect(),
        type_ops: FxHashMap::default(),
    };

    resolver.push_scope(None, Pos::new(0), Pos::new(u32::MAX - 1));
    resolver.hoist_definitions()?;
    resolver.walk_unit()?;

    Ok(resolver.program)
}

struct Resolver<'a> {
    ast: &'a Ast,
    interner: &'a StringInterner,
    ctx: &'a mut AnalysisContext,
    program: Program,
    /// Active scopes, innermost last.
    scope_stack: Vec<ScopeId>,
    /// Per active scope, the bindings it introduced.
    bindings: Vec<FxHashMap<Name, VarKey>>,
    /// Active lambda/spawn boundaries: (boundary node, scope at entry).
    lambda_stack: Vec<(NodeId, usize)>,
    primitives: FxHashSet<Name>,
    /// Derived type operations (`make-T`, `T-field`, `set-T-field!`,
    /// `T?`) registered by `deftype` hoisting.
    type_ops: FxHashMap<Name, NodeId>,
}

impl Resolver<'_> {
    fn push_scope(&mut self, parent: Option<ScopeId>, start: Pos, end: Pos) -> ScopeId {
        let id = ScopeId::new(
            u32::try_from(self.program.scopes.len())
                .unwrap_or_else(|_| panic!("scope count exceeds u32::MAX")),
        );
        self.program.scopes.push(ScopeData { parent, start, end });
        self.scope_stack.push(id);
        self.bindings.push(FxHashMap::default());
        id
    }

    fn push_child_scope(&mut self, creator: NodeId) -> ScopeId {
        let parent = self.scope_stack.last().copied();
        let start = self.ast.pos(creator);
        let end = Program::subtree_end(self.ast, creator);
        self.push_scope(parent, start, end)
    }

    fn pop_scope(&mut self) {
        self.scope_stack.pop();
        self.bindings.pop();
    }

    fn current_scope(&self) -> ScopeId {
        *self.scope_stack.last().expect("scope stack never empty")
    }

    fn bind(&mut self, name: Name, def: NodeId, flags: UsageFlags) -> VarKey {
        let key = VarKey::new(self.current_scope(), name);
        self.bindings
            .last_mut()
            .expect("scope stack never empty")
            .insert(name, key);
        self.ctx
            .usage
            .insert(key, UsageInfo::at_def(self.ast.pos(def), flags));
        key
    }

    /// Resolve a name through the scope stack. Returns the binding and the
    /// scope-stack depth it was found at.
    fn lookup(&self, name: Name) -> Option<(VarKey, usize)> {
        for (depth, map) in self.bindings.iter().enumerate().rev() {
            if let Some(&key) = map.get(&name) {
                return Some((key, depth));
            }
        }
        None
    }

    fn err(&self, code: ErrorCode, msg: String, node: NodeId) -> Diagnostic {
        Diagnostic::error(code, msg, self.ast.span(node))
    }

    // ── Hoisting ────────────────────────────────────────────────────

    /// Register every `define`d function and `deftype` before walking
    /// bodies, so recursion and forward references resolve.
    fn hoist_definitions(&mut self) -> Result<(), Diagnostic> {
        for &root in self.ast.roots() {
            match head_form(self.ast, self.interner, root) {
                Some(SpecialForm::Define) => self.hoist_define(root)?,
                Some(SpecialForm::Deftype) => self.hoist_deftype(root)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn hoist_define(&mut self, root: NodeId) -> Result<(), Diagnostic> {
        let items = self.ast.list_items(root);
        if items.len() < 3 {
            return Err(self.err(
                ErrorCode::MalformedForm,
                "`define` needs a name and a value".into(),
                root,
            ));
        }
        match self.ast.kind(items[1]) {
            // (define (f p...) body...)
            ExprKind::Cell { .. } => {
                let sig = self.ast.list_items(items[1]);
                let Some(fn_name) = sig.first().and_then(|&n| self.ast.as_symbol(n)) else {
                    return Err(self.err(
                        ErrorCode::MalformedForm,
                        "function name must be a symbol".into(),
                        items[1],
                    ));
                };
                let mut params = Vec::with_capacity(sig.len() - 1);
                for &p in &sig[1..] {
                    let Some(name) = self.ast.as_symbol(p) else {
                        return Err(self.err(
                            ErrorCode::MalformedForm,
                            "parameter must be a symbol".into(),
                            p,
                        ));
                    };
                    params.push(name);
                }
                self.program.fn_order.push(fn_name);
                self.program.functions.insert(
                    fn_name,
                    FnDef {
                        name: fn_name,
                        params,
                        body: items[2..].to_vec(),
                        scope: ScopeId::TOP, // assigned when the body is walked
                        node: root,
                    },
                );
            }
            // (define name expr) — binds at top level.
            ExprKind::Symbol(_) => {}
            _ => {
                return Err(self.err(
                    ErrorCode::MalformedForm,
                    "`define` target must be a symbol or signature list".into(),
                    items[1],
                ));
            }
        }
        Ok(())
    }

    fn hoist_deftype(&mut self, root: NodeId) -> Result<(), Diagnostic> {
        let items = self.ast.list_items(root);
        let Some(ty_name) = items.get(1).and_then(|&n| self.ast.as_symbol(n)) else {
            return Err(self.err(
                ErrorCode::MalformedForm,
                "`deftype` needs a type name".into(),
                root,
            ));
        };
        self.program.types.push(root);

        // Register the derived operations so bodies can call them.
        let ty_str = self.interner.lookup(ty_name).to_owned();
        let ctor = self.interner.intern(&format!("make-{ty_str}"));
        let pred = self.interner.intern(&format!("{ty_str}?"));
        self.type_ops.insert(ctor, root);
        self.type_ops.insert(pred, root);
        for &field in &items[2..] {
            let fitems = self.ast.list_items(field);
            if let Some(fname) = fitems.first().and_then(|&n| self.ast.as_symbol(n)) {
                let f_str = self.interner.lookup(fname).to_owned();
                let get = self.interner.intern(&format!("{ty_str}-{f_str}"));
                let set = self.interner.intern(&format!("set-{ty_str}-{f_str}!"));
                self.type_ops.insert(get, root);
                self.type_ops.insert(set, root);
            }
        }
        Ok(())
    }

    // ── Walking ─────────────────────────────────────────────────────

    fn walk_unit(&mut self) -> Result<(), Diagnostic> {
        for &root in self.ast.roots() {
            match head_form(self.ast, self.interner, root) {
                Some(SpecialForm::Define) => self.walk_define(root)?,
                Some(SpecialForm::Deftype) => {} // shape pass handles fields
                _ => {
                    self.program.toplevel.push(root);
                    self.walk_expr(root)?;
                }
            }
        }
        Ok(())
    }

    fn walk_define(&mut self, root: NodeId) -> Result<(), Diagnostic> {
        let items = self.ast.list_items(root);
        match self.ast.kind(items[1]) {
            ExprKind::Cell { .. } => {
                let sig = self.ast.list_items(items[1]);
                let fn_name = self.ast.as_symbol(sig[0]).expect("checked in hoisting");

                let scope = self.push_child_scope(root);
                if let Some(def) = self.program.functions.get_mut(&fn_name) {
                    def.scope = scope;
                }
                for &p in &sig[1..] {
                    let name = self.ast.as_symbol(p).expect("checked in hoisting");
                    self.bind(name, p, UsageFlags::PARAMETER);
                }
                for &form in &items[2..] {
                    self.walk_expr(form)?;
                }
                self.pop_scope();
            }
            ExprKind::Symbol(name) => {
                self.walk_expr(items[2])?;
                // Global binding, visible to the rest of the unit.
                let key = VarKey::new(ScopeId::TOP, name);
                self.bindings[0].insert(name, key);
                self.ctx
                    .usage
                    .insert(key, UsageInfo::at_def(self.ast.pos(root), UsageFlags::empty()));
                self.program.binding_inits.insert(key, items[2]);
                self.program.globals.push(GlobalDef {
                    name,
                    value: items[2],
                    node: root,
                });
            }
            _ => {}
        }
        Ok(())
    }

    fn walk_expr(&mut self, node: NodeId) -> Result<(), Diagnostic> {
        match self.ast.kind(node) {
            ExprKind::Int(_) | ExprKind::Float(_) | ExprKind::Char(_) | ExprKind::Nil => Ok(()),
            ExprKind::Symbol(name) => self.resolve_use(node, name, UsageFlags::READ),
            ExprKind::Cell { .. } => self.walk_form(node),
        }
    }

    fn walk_form(&mut self, node: NodeId) -> Result<(), Diagnostic> {
        let items = self.ast.list_items(node);
        if items.is_empty() {
            return Ok(());
        }

        if let Some(form) = head_form(self.ast, self.interner, node) {
            return self.walk_special(node, form, &items);
        }

        // Ordinary call. The head may be a primitive, a user function, a
        // derived type operation, or a local closure.
        if let Some(head_name) = self.ast.as_symbol(items[0]) {
            self.resolve_head(items[0], head_name, &items)?;
        } else {
            // Computed head expression.
            self.walk_expr(items[0])?;
        }
        for &arg in &items[1..] {
            self.walk_expr(arg)?;
        }
        Ok(())
    }

    #[expect(clippy::too_many_lines, reason = "one arm per special form")]
    fn walk_special(
        &mut self,
        node: NodeId,
        form: SpecialForm,
        items: &[NodeId],
    ) -> Result<(), Diagnostic> {
        match form {
            SpecialForm::Define => {
                // Nested defines are not supported; treat as malformed.
                Err(self.err(
                    ErrorCode::MalformedForm,
                    "`define` is only valid at the top level".into(),
                    node,
                ))
            }
            SpecialForm::Deftype => Err(self.err(
                ErrorCode::MalformedForm,
                "`deftype` is only valid at the top level".into(),
                node,
            )),
            SpecialForm::Let => {
                let Some(&binding_list) = items.get(1) else {
                    return Err(self.err(
                        ErrorCode::MalformedForm,
                        "`let` needs a binding list".into(),
                        node,
                    ));
                };
                // Initializers resolve in the outer scope.
                let bindings = self.ast.list_items(binding_list);
                let mut bound = Vec::with_capacity(bindings.len());
                for &b in &bindings {
                    let parts = self.ast.list_items(b);
                    let (Some(&name_node), Some(&init)) = (parts.first(), parts.get(1)) else {
                        return Err(self.err(
                            ErrorCode::MalformedForm,
                            "`let` binding must be `(name expr)`".into(),
                            b,
                        ));
                    };
                    let Some(name) = self.ast.as_symbol(name_node) else {
                        return Err(self.err(
                            ErrorCode::MalformedForm,
                            "`let` binding name must be a symbol".into(),
                            name_node,
                        ));
                    };
                    self.walk_expr(init)?;
                    bound.push((name, name_node));
                }
                self.push_child_scope(node);
                for (i, (name, name_node)) in bound.into_iter().enumerate() {
                    let key = self.bind(name, name_node, UsageFlags::empty());
                    let parts = self.ast.list_items(bindings[i]);
                    self.program.binding_inits.insert(key, parts[1]);
                }
                for &body in &items[2..] {
                    self.walk_expr(body)?;
                }
                self.pop_scope();
                Ok(())
            }
            SpecialForm::Lambda => {
                let Some(&param_list) = items.get(1) else {
                    return Err(self.err(
                        ErrorCode::MalformedForm,
                        "`lambda` needs a parameter list".into(),
                        node,
                    ));
                };
                self.lambda_stack.push((node, self.scope_stack.len()));
                self.ctx.captures.insert(node, Vec::new());
                let scope = self.push_child_scope(node);
                self.program.lambda_scopes.insert(node, scope);
                for p in self.ast.list_items(param_list) {
                    let Some(name) = self.ast.as_symbol(p) else {
                        return Err(self.err(
                            ErrorCode::MalformedForm,
                            "parameter must be a symbol".into(),
                            p,
                        ));
                    };
                    self.bind(name, p, UsageFlags::PARAMETER);
                }
                for &body in &items[2..] {
                    self.walk_expr(body)?;
                }
                self.pop_scope();
                self.lambda_stack.pop();
                Ok(())
            }
            SpecialForm::Spawn => {
                // A spawn body is a thread closure: same capture rules as
                // a lambda, no parameters.
                self.lambda_stack.push((node, self.scope_stack.len()));
                self.ctx.captures.insert(node, Vec::new());
                let scope = self.push_child_scope(node);
                self.program.lambda_scopes.insert(node, scope);
                for &body in &items[1..] {
                    self.walk_expr(body)?;
                }
                self.pop_scope();
                self.lambda_stack.pop();
                Ok(())
            }
            SpecialForm::Set => {
                let (Some(&target), Some(&value)) = (items.get(1), items.get(2)) else {
                    return Err(self.err(
                        ErrorCode::MalformedForm,
                        "`set!` needs a name and a value".into(),
                        node,
                    ));
                };
                let Some(name) = self.ast.as_symbol(target) else {
                    return Err(self.err(
                        ErrorCode::MalformedForm,
                        "`set!` target must be a symbol".into(),
                        target,
                    ));
                };
                if self.lookup(name).is_none() {
                    return Err(self.err(
                        ErrorCode::SetUnknownName,
                        format!("`set!` on unknown name `{}`", self.interner.lookup(name)),
                        target,
                    ));
                }
                self.resolve_use(target, name, UsageFlags::WRITTEN)?;
                self.walk_expr(value)
            }
            SpecialForm::ForEach => {
                let (Some(&var), Some(&coll)) = (items.get(1), items.get(2)) else {
                    return Err(self.err(
                        ErrorCode::MalformedForm,
                        "`for-each` needs a variable and a collection".into(),
                        node,
                    ));
                };
                let Some(name) = self.ast.as_symbol(var) else {
                    return Err(self.err(
                        ErrorCode::MalformedForm,
                        "`for-each` variable must be a symbol".into(),
                        var,
                    ));
                };
                self.walk_expr(coll)?;
                self.push_child_scope(node);
                self.bind(name, var, UsageFlags::LOOP_VAR);
                for &body in &items[3..] {
                    self.walk_expr(body)?;
                }
                self.pop_scope();
                Ok(())
            }
            SpecialForm::Try => {
                // (try body (catch e handler...))
                let Some(&body) = items.get(1) else {
                    return Err(self.err(
                        ErrorCode::MalformedForm,
                        "`try` needs a body".into(),
                        node,
                    ));
                };
                self.walk_expr(body)?;
                if let Some(&catch) = items.get(2) {
                    let catch_items = self.ast.list_items(catch);
                    let is_catch = self
                        .ast
                        .as_symbol(*catch_items.first().unwrap_or(&catch))
                        .is_some_and(|n| self.interner.lookup(n) == "catch");
                    if !is_catch || catch_items.len() < 3 {
                        return Err(self.err(
                            ErrorCode::MalformedForm,
                            "`try` handler must be `(catch name expr...)`".into(),
                            catch,
                        ));
                    }
                    let Some(err_name) = self.ast.as_symbol(catch_items[1]) else {
                        return Err(self.err(
                            ErrorCode::MalformedForm,
                            "`catch` binding must be a symbol".into(),
                            catch_items[1],
                        ));
                    };
                    self.push_child_scope(catch);
                    self.bind(err_name, catch_items[1], UsageFlags::empty());
                    for &h in &catch_items[2..] {
                        self.walk_expr(h)?;
                    }
                    self.pop_scope();
                }
                Ok(())
            }
            // Remaining forms bind nothing; walk operands.
            SpecialForm::If
            | SpecialForm::Begin
            | SpecialForm::While
            | SpecialForm::Map
            | SpecialForm::Fold
            | SpecialForm::Filter
            | SpecialForm::Throw
            | SpecialForm::Error
            | SpecialForm::Chan
            | SpecialForm::Send
            | SpecialForm::Recv
            | SpecialForm::Close
            | SpecialForm::Atom
            | SpecialForm::Deref
            | SpecialForm::Reset
            | SpecialForm::Swap
            | SpecialForm::Cas
            | SpecialForm::Box
            | SpecialForm::Unbox
            | SpecialForm::SetBox
            | SpecialForm::Freeze => {
                for &operand in &items[1..] {
                    self.walk_expr(operand)?;
                }
                Ok(())
            }
        }
    }

    /// Resolve a call head: local closure, user function, derived type
    /// operation, or primitive.
    fn resolve_head(
        &mut self,
        head: NodeId,
        name: Name,
        items: &[NodeId],
    ) -> Result<(), Diagnostic> {
        if self.lookup(name).is_some() {
            // Local binding holding a closure — an ordinary use.
            return self.resolve_use(head, name, UsageFlags::READ);
        }
        if let Some(def) = self.program.functions.get(&name) {
            let expected = def.params.len();
            let actual = items.len() - 1;
            if expected != actual {
                return Err(self.err(
                    ErrorCode::ArityMismatch,
                    format!(
                        "`{}` expects {expected} argument(s), got {actual}",
                        self.interner.lookup(name)
                    ),
                    head,
                ));
            }
            return Ok(());
        }
        if self.type_ops.contains_key(&name) || self.primitives.contains(&name) {
            return Ok(());
        }
        Err(self.err(
            ErrorCode::UnboundSymbol,
            format!("unbound symbol `{}`", self.interner.lookup(name)),
            head,
        ))
    }

    /// Resolve a symbol use and update the usage table.
    fn resolve_use(
        &mut self,
        node: NodeId,
        name: Name,
        flag: UsageFlags,
    ) -> Result<(), Diagnostic> {
        // Keyword-style annotations (`:weak`) are inert data.
        if self.interner.lookup(name).starts_with(':') {
            return Ok(());
        }

        let Some((key, depth)) = self.lookup(name) else {
            if self.primitives.contains(&name)
                || self.program.functions.contains_key(&name)
                || self.type_ops.contains_key(&name)
            {
                return Ok(());
            }
            return Err(self.err(
                ErrorCode::UnboundSymbol,
                format!("unbound symbol `{}`", self.interner.lookup(name)),
                node,
            ));
        };

        self.ctx.resolutions.insert(node, key);

        let pos = self.ast.pos(node);
        let info = self
            .ctx
            .usage
            .get_mut(&key)
            .expect("bound variables always have usage records");
        if pos < info.first_use || info.first_use == info.def_pos {
            info.first_use = pos.max(info.def_pos);
        }
        if pos > info.last_use {
            info.last_use = pos;
        }
        info.flags |= flag;

        // Crossing a lambda/spawn boundary captures the variable in every
        // enclosing closure between the use and the binding.
        let mut captured = false;
        for &(boundary_node, boundary_depth) in self.lambda_stack.iter().rev() {
            if depth < boundary_depth {
                captured = true;
                let list = self
                    .ctx
                    .captures
                    .get_mut(&boundary_node)
                    .expect("boundaries register capture lists on entry");
                if !list.contains(&key) {
                    list.push(key);
                }
            }
        }
        if captured {
            let info = self
                .ctx
                .usage
                .get_mut(&key)
                .expect("bound variables always have usage records");
            info.flags |= UsageFlags::CAPTURED;
        }

        Ok(())
    }
}

/// The special form at a node's head, if any.
pub fn head_form(ast: &Ast, interner: &StringInterner, node: NodeId) -> Option<SpecialForm> {
    let name = ast.head_symbol(node)?;
    SpecialForm::from_str(interner.lookup(name))
}

#[cfg(test)]
mod tests;
