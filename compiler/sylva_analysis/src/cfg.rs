//! Control-flow graph over AST nodes.
//!
//! Each function body (and the unit's top-level sequence) lowers to one
//! [`Cfg`] with a distinguished Entry and Exit and typed nodes:
//! {Seq, Branch, Join, LoopHeader, LoopBackedge, Return}. Statement-level
//! granularity: a straight-line expression becomes one `Seq` node whose
//! `uses` are every variable referenced in its subtree; `if`, the looping
//! forms, and `try` get structural nodes so liveness can distinguish
//! paths.
//!
//! The CFG carries, per node, the covering AST node — free points
//! computed by liveness translate back to emission anchors through it.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use sylva_ast::{Ast, ExprKind, NodeId, SpecialForm, StringInterner};

use crate::context::{AnalysisContext, VarKey};
use crate::resolve::head_form;

/// CFG node identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct CfgNodeId(u32);

impl CfgNodeId {
    #[inline]
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Node kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CfgNodeKind {
    Entry,
    Exit,
    Seq,
    Branch,
    Join,
    LoopHeader,
    LoopBackedge,
    Return,
}

/// One CFG node.
#[derive(Clone, Debug)]
pub struct CfgNode {
    pub kind: CfgNodeKind,
    /// The AST node this CFG node covers (`None` for Entry/Exit/Join).
    pub node: Option<NodeId>,
    pub succs: SmallVec<[CfgNodeId; 2]>,
    /// Variables read by this node.
    pub uses: Vec<VarKey>,
    /// Variables defined at this node.
    pub defs: Vec<VarKey>,
}

/// A function body's control-flow graph.
pub struct Cfg {
    pub nodes: Vec<CfgNode>,
    pub entry: CfgNodeId,
    pub exit: CfgNodeId,
    /// First CFG node of each branch arm → the arm's AST root. Edge-gap
    /// frees computed by liveness anchor to the arm root so codegen can
    /// emit them at the top of the arm.
    pub arm_roots: FxHashMap<CfgNodeId, NodeId>,
}

impl Cfg {
    pub fn node(&self, id: CfgNodeId) -> &CfgNode {
        &self.nodes[id.index()]
    }

    /// Predecessor lists, deduplicated.
    pub fn predecessors(&self) -> Vec<Vec<CfgNodeId>> {
        let mut preds: Vec<Vec<CfgNodeId>> = vec![Vec::new(); self.nodes.len()];
        for (i, node) in self.nodes.iter().enumerate() {
            let from = CfgNodeId::new(u32::try_from(i).unwrap_or_else(|_| panic!("cfg overflow")));
            for &succ in &node.succs {
                if !preds[succ.index()].contains(&from) {
                    preds[succ.index()].push(from);
                }
            }
        }
        preds
    }

    /// Postorder over the graph from Entry. For the backward liveness
    /// fixpoint, iterating postorder processes successors before
    /// predecessors, which converges fast.
    pub fn postorder(&self) -> Vec<CfgNodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut visited = vec![false; self.nodes.len()];
        // Iterative DFS with an explicit phase marker.
        let mut stack: Vec<(CfgNodeId, bool)> = vec![(self.entry, false)];
        while let Some((id, processed)) = stack.pop() {
            if processed {
                order.push(id);
                continue;
            }
            if visited[id.index()] {
                continue;
            }
            visited[id.index()] = true;
            stack.push((id, true));
            for &succ in &self.nodes[id.index()].succs {
                if !visited[succ.index()] {
                    stack.push((succ, false));
                }
            }
        }
        order
    }

    /// Count nodes of one kind (test support).
    pub fn count_kind(&self, kind: CfgNodeKind) -> usize {
        self.nodes.iter().filter(|n| n.kind == kind).count()
    }
}

/// Build the CFG for a body: `params` define at Entry, `body` forms run
/// in order, the last form feeds a Return node.
pub fn build_cfg(
    ast: &Ast,
    interner: &StringInterner,
    ctx: &AnalysisContext,
    params: &[VarKey],
    body: &[NodeId],
) -> Cfg {
    let mut b = Builder {
        ast,
        interner,
        ctx,
        nodes: Vec::new(),
        arm_roots: FxHashMap::default(),
    };

    let entry = b.push(CfgNodeKind::Entry, None, Vec::new(), params.to_vec());
    let mut cursor = entry;
    for &form in body {
        let (first, last) = b.build_expr(form);
        b.link(cursor, first);
        cursor = last;
    }

    let ret = b.push(CfgNodeKind::Return, body.last().copied(), Vec::new(), Vec::new());
    b.link(cursor, ret);
    let exit = b.push(CfgNodeKind::Exit, None, Vec::new(), Vec::new());
    b.link(ret, exit);

    tracing::debug!(nodes = b.nodes.len(), "built cfg");

    Cfg {
        nodes: b.nodes,
        entry,
        exit,
        arm_roots: b.arm_roots,
    }
}

struct Builder<'a> {
    ast: &'a Ast,
    interner: &'a StringInterner,
    ctx: &'a AnalysisContext,
    nodes: Vec<CfgNode>,
    arm_roots: FxHashMap<CfgNodeId, NodeId>,
}

impl Builder<'_> {
    fn push(
        &mut self,
        kind: CfgNodeKind,
        node: Option<NodeId>,
        uses: Vec<VarKey>,
        defs: Vec<VarKey>,
    ) -> CfgNodeId {
        let id = CfgNodeId::new(
            u32::try_from(self.nodes.len()).unwrap_or_else(|_| panic!("cfg overflow")),
        );
        self.nodes.push(CfgNode {
            kind,
            node,
            succs: SmallVec::new(),
            uses,
            defs,
        });
        id
    }

    fn link(&mut self, from: CfgNodeId, to: CfgNodeId) {
        if !self.nodes[from.index()].succs.contains(&to) {
            self.nodes[from.index()].succs.push(to);
        }
    }

    /// Build the subgraph for one expression; returns its first and last
    /// nodes.
    fn build_expr(&mut self, node: NodeId) -> (CfgNodeId, CfgNodeId) {
        match head_form(self.ast, self.interner, node) {
            Some(SpecialForm::If) => self.build_if(node),
            Some(SpecialForm::Begin) => self.build_begin(node),
            Some(SpecialForm::Let) => self.build_let(node),
            Some(SpecialForm::While) => self.build_while(node),
            Some(SpecialForm::ForEach) => self.build_for_each(node),
            Some(SpecialForm::Map | SpecialForm::Fold | SpecialForm::Filter) => {
                self.build_collection_loop(node)
            }
            Some(SpecialForm::Try) => self.build_try(node),
            _ => {
                let uses = self.collect_uses(node);
                let defs = self.collect_defs(node);
                let id = self.push(CfgNodeKind::Seq, Some(node), uses, defs);
                (id, id)
            }
        }
    }

    fn build_if(&mut self, node: NodeId) -> (CfgNodeId, CfgNodeId) {
        let items = self.ast.list_items(node);
        let cond_uses = items.get(1).map_or_else(Vec::new, |&c| self.collect_uses(c));
        let branch = self.push(CfgNodeKind::Branch, Some(node), cond_uses, Vec::new());
        let join = self.push(CfgNodeKind::Join, None, Vec::new(), Vec::new());

        if let Some(&then_root) = items.get(2) {
            let (first, last) = self.build_expr(then_root);
            self.arm_roots.insert(first, then_root);
            self.link(branch, first);
            self.link(last, join);
        } else {
            self.link(branch, join);
        }
        if let Some(&else_root) = items.get(3) {
            let (first, last) = self.build_expr(else_root);
            self.arm_roots.insert(first, else_root);
            self.link(branch, first);
            self.link(last, join);
        } else {
            self.link(branch, join);
        }

        (branch, join)
    }

    fn build_begin(&mut self, node: NodeId) -> (CfgNodeId, CfgNodeId) {
        let items = self.ast.list_items(node);
        self.build_chain(node, &items[1..])
    }

    fn build_let(&mut self, node: NodeId) -> (CfgNodeId, CfgNodeId) {
        let items = self.ast.list_items(node);
        let mut first = None;
        let mut cursor = None;

        if let Some(&binding_list) = items.get(1) {
            for binding in self.ast.list_items(binding_list) {
                let parts = self.ast.list_items(binding);
                let (Some(&name_node), Some(&init)) = (parts.first(), parts.get(1)) else {
                    continue;
                };
                let uses = self.collect_uses(init);
                let defs = self.lookup_def(name_node).map_or_else(Vec::new, |k| vec![k]);
                let id = self.push(CfgNodeKind::Seq, Some(binding), uses, defs);
                if let Some(prev) = cursor {
                    self.link(prev, id);
                } else {
                    first = Some(id);
                }
                cursor = Some(id);
            }
        }

        let (body_first, body_last) = self.build_chain(node, &items[2..]);
        match cursor {
            Some(prev) => {
                self.link(prev, body_first);
                (first.unwrap_or(body_first), body_last)
            }
            None => (body_first, body_last),
        }
    }

    fn build_while(&mut self, node: NodeId) -> (CfgNodeId, CfgNodeId) {
        let items = self.ast.list_items(node);
        let cond_uses = items.get(1).map_or_else(Vec::new, |&c| self.collect_uses(c));
        let header = self.push(CfgNodeKind::LoopHeader, Some(node), cond_uses, Vec::new());

        let (body_first, body_last) = self.build_chain(node, &items[2..]);
        let backedge = self.push(CfgNodeKind::LoopBackedge, Some(node), Vec::new(), Vec::new());
        self.link(header, body_first);
        self.link(body_last, backedge);
        self.link(backedge, header);

        (header, header)
    }

    fn build_for_each(&mut self, node: NodeId) -> (CfgNodeId, CfgNodeId) {
        let items = self.ast.list_items(node);
        let coll_uses = items.get(2).map_or_else(Vec::new, |&c| self.collect_uses(c));
        let loop_var = items
            .get(1)
            .and_then(|v| self.lookup_def(*v))
            .map_or_else(Vec::new, |k| vec![k]);
        let header = self.push(CfgNodeKind::LoopHeader, Some(node), coll_uses, loop_var);

        let (body_first, body_last) = self.build_chain(node, &items[3..]);
        let backedge = self.push(CfgNodeKind::LoopBackedge, Some(node), Vec::new(), Vec::new());
        self.link(header, body_first);
        self.link(body_last, backedge);
        self.link(backedge, header);

        (header, header)
    }

    /// `map` / `fold` / `filter` iterate internally; the CFG models the
    /// iteration with a header/backedge pair so loop borrows see a loop,
    /// with the operand uses on the header.
    fn build_collection_loop(&mut self, node: NodeId) -> (CfgNodeId, CfgNodeId) {
        let items = self.ast.list_items(node);
        let mut uses = Vec::new();
        for &operand in &items[1..] {
            uses.extend(self.collect_uses(operand));
        }
        uses.sort_by_key(|k: &VarKey| (k.scope, k.name.raw()));
        uses.dedup();
        let header = self.push(CfgNodeKind::LoopHeader, Some(node), uses, Vec::new());
        let backedge = self.push(CfgNodeKind::LoopBackedge, Some(node), Vec::new(), Vec::new());
        self.link(header, backedge);
        self.link(backedge, header);
        (header, header)
    }

    /// `try` forks: the body path and the handler path rejoin at a Join.
    fn build_try(&mut self, node: NodeId) -> (CfgNodeId, CfgNodeId) {
        let items = self.ast.list_items(node);
        let branch = self.push(CfgNodeKind::Branch, Some(node), Vec::new(), Vec::new());
        let join = self.push(CfgNodeKind::Join, None, Vec::new(), Vec::new());

        if let Some(&body) = items.get(1) {
            let (first, last) = self.build_expr(body);
            self.arm_roots.insert(first, body);
            self.link(branch, first);
            self.link(last, join);
        } else {
            self.link(branch, join);
        }

        if let Some(&catch) = items.get(2) {
            let catch_items = self.ast.list_items(catch);
            let err_def = catch_items
                .get(1)
                .and_then(|v| self.lookup_def(*v))
                .map_or_else(Vec::new, |k| vec![k]);
            let catch_entry = self.push(CfgNodeKind::Seq, Some(catch), Vec::new(), err_def);
            self.arm_roots.insert(catch_entry, catch);
            self.link(branch, catch_entry);
            let (first, last) = self.build_chain(catch, &catch_items[2..]);
            self.link(catch_entry, first);
            self.link(last, join);
        }

        (branch, join)
    }

    /// Chain a sequence of forms; an empty sequence becomes a no-op Seq.
    fn build_chain(&mut self, parent: NodeId, forms: &[NodeId]) -> (CfgNodeId, CfgNodeId) {
        let mut first = None;
        let mut cursor = None;
        for &form in forms {
            let (f, l) = self.build_expr(form);
            if let Some(prev) = cursor {
                self.link(prev, f);
            } else {
                first = Some(f);
            }
            cursor = Some(l);
        }
        match (first, cursor) {
            (Some(f), Some(l)) => (f, l),
            _ => {
                let id = self.push(CfgNodeKind::Seq, Some(parent), Vec::new(), Vec::new());
                (id, id)
            }
        }
    }

    /// Every resolved variable reference in a subtree, deduplicated.
    ///
    /// Does not descend into `lambda` / `spawn` bodies: a closure's uses
    /// at this level are exactly its captures (closure construction reads
    /// them once), and closure-internal variables belong to the closure's
    /// own CFG.
    fn collect_uses(&self, root: NodeId) -> Vec<VarKey> {
        let mut uses = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if is_closure_boundary(self.ast, self.interner, id) {
                if let Some(captures) = self.ctx.captures.get(&id) {
                    for &key in captures {
                        if !uses.contains(&key) {
                            uses.push(key);
                        }
                    }
                }
                continue;
            }
            if let Some(&key) = self.ctx.resolutions.get(&id) {
                if !uses.contains(&key) {
                    uses.push(key);
                }
            }
            if let ExprKind::Cell { head, tail } = self.ast.kind(id) {
                stack.push(head);
                stack.push(tail);
            }
        }
        uses.sort_by_key(|k| (k.scope, k.name.raw()));
        uses
    }

    /// Variables defined inside a straight-line subtree (nested `let`s
    /// within an expression position). Closure bodies are skipped.
    fn collect_defs(&self, root: NodeId) -> Vec<VarKey> {
        let mut defs = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if is_closure_boundary(self.ast, self.interner, id) {
                continue;
            }
            if head_form(self.ast, self.interner, id) == Some(SpecialForm::Let) {
                let items = self.ast.list_items(id);
                if let Some(&binding_list) = items.get(1) {
                    for binding in self.ast.list_items(binding_list) {
                        if let Some(&name_node) = self.ast.list_items(binding).first() {
                            if let Some(key) = self.lookup_def(name_node) {
                                if !defs.contains(&key) {
                                    defs.push(key);
                                }
                            }
                        }
                    }
                }
            }
            if let ExprKind::Cell { head, tail } = self.ast.kind(id) {
                stack.push(head);
                stack.push(tail);
            }
        }
        defs.sort_by_key(|k| (k.scope, k.name.raw()));
        defs
    }

    /// The binding a definition-site name node introduces.
    ///
    /// Definition sites are not in `resolutions` (only uses are), so the
    /// binding is reconstructed from the usage table by definition
    /// position.
    fn lookup_def(&self, name_node: NodeId) -> Option<VarKey> {
        let name = self.ast.as_symbol(name_node)?;
        let pos = self.ast.pos(name_node);
        self.ctx
            .usage
            .iter()
            .find(|(k, u)| k.name == name && u.def_pos == pos)
            .map(|(&k, _)| k)
    }
}

/// Whether a node opens a closure body (`lambda` or `spawn`).
fn is_closure_boundary(ast: &Ast, interner: &StringInterner, id: NodeId) -> bool {
    matches!(
        head_form(ast, interner, id),
        Some(SpecialForm::Lambda | SpecialForm::Spawn)
    )
}

#[cfg(test)]
mod tests;
