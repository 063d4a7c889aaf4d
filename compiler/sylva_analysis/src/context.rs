//! The per-compilation analysis context.
//!
//! One [`AnalysisContext`] is created per compilation and discarded at its
//! end. Every pass appends facts to its own tables and reads the tables of
//! earlier passes; after a pass finishes, its tables are read-only. No
//! module statics — the context is threaded through every pass explicitly.
//!
//! Tables are keyed by [`VarKey`] (scope + name) unless a table's domain
//! is type names, function names, or AST nodes.

use bitflags::bitflags;
use rustc_hash::FxHashMap;

use sylva_ast::{Name, NodeId, Pos};
use sylva_diagnostic::{Diagnostic, ErrorCode};

// ── Keys ────────────────────────────────────────────────────────────

/// Scope identifier. Scope 0 is the top level of the unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ScopeId(u32);

impl ScopeId {
    pub const TOP: ScopeId = ScopeId(0);

    #[inline]
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A variable: its binding scope plus its name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VarKey {
    pub scope: ScopeId,
    pub name: Name,
}

impl VarKey {
    pub fn new(scope: ScopeId, name: Name) -> Self {
        Self { scope, name }
    }
}

// ── Usage table ─────────────────────────────────────────────────────

bitflags! {
    /// How a binding is touched within its scope.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct UsageFlags: u8 {
        const READ      = 1 << 0;
        const WRITTEN   = 1 << 1;
        const PARAMETER = 1 << 2;
        const CAPTURED  = 1 << 3;
        /// Bound by a looping form; aliases collection elements.
        const LOOP_VAR  = 1 << 4;
    }
}

/// Definition and use positions for one binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UsageInfo {
    pub def_pos: Pos,
    /// First read/write position; equals `def_pos` while unused.
    pub first_use: Pos,
    /// Last read/write position; equals `def_pos` while unused.
    pub last_use: Pos,
    pub flags: UsageFlags,
}

impl UsageInfo {
    pub fn at_def(def_pos: Pos, flags: UsageFlags) -> Self {
        Self {
            def_pos,
            first_use: def_pos,
            last_use: def_pos,
            flags,
        }
    }
}

// ── Owner / escape tables ───────────────────────────────────────────

/// Who is responsible for a binding's value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VarOwnership {
    /// Defined here, not written into anything that escapes.
    Local,
    /// Reachable from more than one live owner (closures, shared parents,
    /// atoms). Freed by refcount.
    Shared,
    /// A parameter the function does not retain.
    Borrowed,
    /// Sent away (channel transfer); the sender's reference ends at the
    /// transfer point.
    Transferred,
}

/// Topological class of a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Shape {
    Scalar,
    Tree,
    Dag,
    Cyclic,
}

/// Where a binding's storage comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocStrategy {
    Heap,
    Stack,
    Pool,
    Arena,
}

/// How a binding's storage is released.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FreeStrategy {
    /// No release emitted (borrowed, arena, stack).
    None,
    /// Direct free of a unique leaf object.
    Unique,
    /// Recursive structural free of a unique tree.
    Tree,
    /// Refcount decrement; free on zero.
    Rc,
    /// Refcount decrement with recursive tree free on zero.
    RcTree,
    /// Shared SCC refcount decrement (frozen cyclic values).
    Scc,
    /// Deferred decrement through the pending list (mutable cyclic values).
    Deferred,
}

/// The owner table record for one binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OwnerInfo {
    pub ownership: VarOwnership,
    pub is_unique: bool,
    pub must_free: bool,
    /// Earliest free point, filled by the liveness pass when `must_free`.
    pub free_pos: Option<Pos>,
    pub shape: Shape,
    pub alloc: AllocStrategy,
    pub free: FreeStrategy,
}

impl OwnerInfo {
    /// The default every new local starts from; refined by the ownership
    /// pass.
    pub fn local_default() -> Self {
        Self {
            ownership: VarOwnership::Local,
            is_unique: true,
            must_free: true,
            free_pos: None,
            shape: Shape::Tree,
            alloc: AllocStrategy::Heap,
            free: FreeStrategy::Tree,
        }
    }
}

/// How a binding's value leaves its defining scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EscapeClass {
    None,
    Return,
    Capture,
    HeapStore,
    Global,
}

/// The escape table record for one binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EscapeInfo {
    pub class: EscapeClass,
    pub is_unique: bool,
}

// ── Shape table (keyed by type name) ────────────────────────────────

/// One `deftype` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldInfo {
    pub name: Name,
    pub ty: Name,
    /// Explicit `:weak` annotation (forces back-edge treatment).
    pub weak: bool,
}

/// The shape table record for one user type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShapeInfo {
    pub shape: Shape,
    pub fields: Vec<FieldInfo>,
    /// Names of self-referential fields classified as back-edges.
    pub back_edge_fields: Vec<Name>,
    pub is_cyclic: bool,
    /// Defining node, for diagnostics.
    pub decl: NodeId,
}

// ── Function summaries ──────────────────────────────────────────────

/// Ownership a function assumes over one parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ParamOwnership {
    /// Read but never retained; caller keeps ownership.
    Borrowed,
    /// Freed (directly or transitively) inside the body.
    Consumed,
    /// Flows unchanged to the return value.
    Passthrough,
    /// Written into an escaping value.
    Captured,
}

/// Ownership of a function's return value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReturnOwnership {
    /// A fresh allocation the caller owns.
    Fresh,
    /// One of the parameters, unchanged.
    Passthrough,
    /// A reference into a structure the caller owns.
    Borrowed,
    /// Pure-effect function; no owned return.
    None,
}

/// Summary record for one parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParamSummary {
    pub name: Name,
    pub ownership: ParamOwnership,
}

/// The function-summary table record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FnSummary {
    pub params: Vec<ParamSummary>,
    pub return_ownership: ReturnOwnership,
    /// Which parameter is returned, when `return_ownership` is
    /// `Passthrough`.
    pub return_param_index: Option<usize>,
    pub has_side_effects: bool,
    pub allocates: bool,
}

impl FnSummary {
    /// Whether the caller must suppress its free of argument `i` around a
    /// call (the argument flows through and comes back).
    pub fn caller_should_free_arg(&self, i: usize) -> bool {
        self.params
            .get(i)
            .is_none_or(|p| p.ownership != ParamOwnership::Passthrough)
    }
}

// ── Regions ─────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct RegionId(u32);

impl RegionId {
    #[inline]
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// The region table record: a lexical allocation region.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegionInfo {
    pub id: RegionId,
    pub depth: u32,
    pub parent: Option<RegionId>,
    pub members: Vec<VarKey>,
    pub external_refs: u32,
    pub has_escaping_refs: bool,
}

// ── Borrows ─────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BorrowKind {
    Shared,
    Exclusive,
    Loop,
}

/// The borrow table record for one borrowed variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BorrowInfo {
    /// The name holding the borrow (the loop variable, or the accessor
    /// result).
    pub holder: Name,
    pub kind: BorrowKind,
    /// Loop borrows pin the collection: tether acquire at the header,
    /// release at every exit.
    pub needs_tether: bool,
    pub start: Pos,
    pub end: Pos,
    /// Scope the borrow was created in; the borrow must end within it.
    pub scope: ScopeId,
}

// ── Reuse ───────────────────────────────────────────────────────────

/// Allocation size class: object size in bytes, rounded up to 8. Type
/// sizes partition into a fixed small set of classes (scalar-24,
/// cell-32, closure-48, and the user-type sizes); a freed slot can only
/// be reinitialized by a constructor of the same class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct SizeClass(pub u32);

impl SizeClass {
    /// Boxed scalars: header + one word.
    pub const SCALAR: SizeClass = SizeClass(24);
    /// Pairs and boxes: header + two words.
    pub const CELL: SizeClass = SizeClass(32);
    /// Closure records: header + fn pointer + capture block header.
    pub const CLOSURE: SizeClass = SizeClass(48);

    /// Class of a user type with `fields` fields.
    pub fn for_user_type(fields: usize) -> SizeClass {
        let bytes = 16 + 8 * u32::try_from(fields).unwrap_or(u32::MAX / 8);
        SizeClass(bytes.max(24).next_multiple_of(8))
    }
}

/// The reuse table record: a freed slot immediately followed by a
/// same-class allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReuseCandidate {
    pub freed: VarKey,
    /// User type name of the freed value, when it has one.
    pub type_name: Option<Name>,
    pub free_pos: Pos,
    pub alloc_pos: Pos,
    /// The allocation node that may reinitialize the slot in place.
    pub alloc_node: NodeId,
    pub size_class: SizeClass,
    pub can_reuse: bool,
    pub is_consumed: bool,
}

// ── RC elision ──────────────────────────────────────────────────────

/// Which refcount operations a variable actually needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RcElision {
    Required,
    ElideInc,
    ElideDec,
    ElideBoth,
}

// ── Concurrency ─────────────────────────────────────────────────────

/// Which threads can observe a variable's value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ThreadLocality {
    Local,
    /// Visible to several threads; refcount ops must be atomic.
    Shared,
    /// Handed to exactly one other thread through a channel.
    Transferred,
    /// Frozen; readers need no RC operations.
    Immutable,
}

/// A spawn site and the variables its thread body captures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpawnSite {
    pub node: NodeId,
    pub captures: Vec<VarKey>,
}

// ── The context ─────────────────────────────────────────────────────

/// Process-wide registry of analysis facts for one compilation.
#[derive(Default)]
pub struct AnalysisContext {
    // Produced by resolution.
    pub usage: FxHashMap<VarKey, UsageInfo>,
    /// Symbol node → the binding it references.
    pub resolutions: FxHashMap<NodeId, VarKey>,
    /// Lambda / spawn node → variables captured from enclosing scopes.
    pub captures: FxHashMap<NodeId, Vec<VarKey>>,

    // Produced by the shape pass.
    pub shapes: FxHashMap<Name, ShapeInfo>,

    // Produced by the summary pass.
    pub summaries: FxHashMap<Name, FnSummary>,

    // Produced by the ownership & escape pass.
    pub owners: FxHashMap<VarKey, OwnerInfo>,
    pub escapes: FxHashMap<VarKey, EscapeInfo>,
    pub regions: Vec<RegionInfo>,
    /// Region of each member variable.
    pub var_regions: FxHashMap<VarKey, RegionId>,

    // Produced by the CFG / liveness / borrow pass.
    pub borrows: FxHashMap<VarKey, Vec<BorrowInfo>>,
    /// Frees to emit immediately after a statement node.
    pub frees_after: FxHashMap<NodeId, Vec<VarKey>>,
    /// Frees to emit on entry to a branch arm (keyed by the arm's root
    /// node). Distinct branches receive distinct frees.
    pub frees_on_entry: FxHashMap<NodeId, Vec<VarKey>>,
    /// Frees to emit on the implicit else path of an arm-less `if`
    /// (keyed by the `if` node; codegen materializes the arm).
    pub frees_else: FxHashMap<NodeId, Vec<VarKey>>,

    // Produced by the RC-elision / reuse / concurrency pass.
    pub elisions: FxHashMap<VarKey, RcElision>,
    pub reuses: Vec<ReuseCandidate>,
    pub locality: FxHashMap<VarKey, ThreadLocality>,
    pub spawns: Vec<SpawnSite>,
    /// Channel send node → whether the send transfers ownership.
    pub channel_transfers: FxHashMap<NodeId, bool>,
}

impl AnalysisContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Owner record for a binding, if the ownership pass saw it.
    pub fn owner(&self, key: VarKey) -> Option<&OwnerInfo> {
        self.owners.get(&key)
    }

    /// RC-elision class, defaulting to `Required` for untracked bindings.
    pub fn elision(&self, key: VarKey) -> RcElision {
        self.elisions.get(&key).copied().unwrap_or(RcElision::Required)
    }

    /// Thread locality, defaulting to `Local`.
    pub fn thread_locality(&self, key: VarKey) -> ThreadLocality {
        self.locality.get(&key).copied().unwrap_or(ThreadLocality::Local)
    }

    /// Whether two variables live in the same region (a reference between
    /// them can never cross a region boundary).
    pub fn is_cross_region_ref(&self, a: VarKey, b: VarKey) -> bool {
        match (self.var_regions.get(&a), self.var_regions.get(&b)) {
            (Some(ra), Some(rb)) => ra != rb,
            _ => false,
        }
    }

    /// Check the cross-table invariants.
    ///
    /// Violations are compiler bugs; they are reported as internal
    /// diagnostics so the driver can abort before codegen panics on them.
    pub fn validate(&self) -> Vec<Diagnostic> {
        let mut problems = Vec::new();
        let mut internal = |msg: String| {
            problems.push(Diagnostic::error(
                ErrorCode::InternalInvariant,
                msg,
                sylva_ast::Span::DUMMY,
            ));
        };

        for (key, owner) in &self.owners {
            let usage = self.usage.get(key);

            if owner.must_free {
                let Some(pos) = owner.free_pos else {
                    internal(format!("{key:?}: must_free without a free position"));
                    continue;
                };
                if let Some(u) = usage {
                    if pos < u.def_pos {
                        internal(format!("{key:?}: free position precedes definition"));
                    }
                }
            }

            if owner.alloc == AllocStrategy::Stack {
                let escape_ok = self
                    .escapes
                    .get(key)
                    .is_some_and(|e| e.class == EscapeClass::None);
                if !escape_ok || !owner.is_unique {
                    internal(format!("{key:?}: stack allocation of escaping or shared value"));
                }
            }

            if owner.alloc == AllocStrategy::Arena && owner.must_free {
                internal(format!("{key:?}: arena-allocated value marked must_free"));
            }

            if owner.ownership == VarOwnership::Borrowed {
                if owner.must_free {
                    internal(format!("{key:?}: borrowed value marked must_free"));
                }
                if self.elision(*key) == RcElision::Required {
                    internal(format!("{key:?}: borrowed value with required RC"));
                }
            }

            if owner.shape == Shape::Cyclic && owner.ownership == VarOwnership::Local {
                let managed = owner.alloc == AllocStrategy::Arena
                    || matches!(owner.free, FreeStrategy::Scc | FreeStrategy::Deferred);
                if !managed {
                    internal(format!("{key:?}: unmanaged local cyclic value"));
                }
            }
        }

        for (name, summary) in &self.summaries {
            if summary.return_ownership == ReturnOwnership::Passthrough
                && summary.return_param_index.is_none()
            {
                internal(format!(
                    "function {name:?}: passthrough return names no parameter"
                ));
            }
        }

        for borrows in self.borrows.values() {
            for b in borrows {
                if b.end < b.start {
                    internal(format!("borrow of `{:?}` ends before it starts", b.holder));
                }
            }
        }

        problems
    }

    /// Snapshot of every table for the idempotence check: running the
    /// passes twice over the same input must produce identical facts.
    pub fn facts_fingerprint(&self) -> String {
        use std::fmt::Write as _;
        let mut s = String::new();

        let mut usage: Vec<_> = self.usage.iter().collect();
        usage.sort_by_key(|(k, _)| (k.scope, k.name.raw()));
        for (k, v) in usage {
            let _ = writeln!(s, "usage {k:?} {v:?}");
        }

        let mut owners: Vec<_> = self.owners.iter().collect();
        owners.sort_by_key(|(k, _)| (k.scope, k.name.raw()));
        for (k, v) in owners {
            let _ = writeln!(s, "owner {k:?} {v:?}");
        }

        let mut escapes: Vec<_> = self.escapes.iter().collect();
        escapes.sort_by_key(|(k, _)| (k.scope, k.name.raw()));
        for (k, v) in escapes {
            let _ = writeln!(s, "escape {k:?} {v:?}");
        }

        let mut shapes: Vec<_> = self.shapes.iter().collect();
        shapes.sort_by_key(|(k, _)| k.raw());
        for (k, v) in shapes {
            let _ = writeln!(s, "shape {k:?} {v:?}");
        }

        let mut elisions: Vec<_> = self.elisions.iter().collect();
        elisions.sort_by_key(|(k, _)| (k.scope, k.name.raw()));
        for (k, v) in elisions {
            let _ = writeln!(s, "elide {k:?} {v:?}");
        }

        let mut locality: Vec<_> = self.locality.iter().collect();
        locality.sort_by_key(|(k, _)| (k.scope, k.name.raw()));
        for (k, v) in locality {
            let _ = writeln!(s, "locality {k:?} {v:?}");
        }

        let mut reuses = self.reuses.clone();
        reuses.sort_by_key(|r| r.free_pos);
        for r in reuses {
            let _ = writeln!(s, "reuse {r:?}");
        }

        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name_raw: u32) -> VarKey {
        VarKey::new(ScopeId::TOP, Name::from_raw(name_raw))
    }

    #[test]
    fn default_local_owner() {
        let o = OwnerInfo::local_default();
        assert_eq!(o.ownership, VarOwnership::Local);
        assert!(o.is_unique);
        assert!(o.must_free);
        assert_eq!(o.shape, Shape::Tree);
        assert_eq!(o.alloc, AllocStrategy::Heap);
    }

    #[test]
    fn validate_flags_stack_escape() {
        let mut ctx = AnalysisContext::new();
        let k = key(1);
        ctx.owners.insert(
            k,
            OwnerInfo {
                alloc: AllocStrategy::Stack,
                must_free: false,
                ..OwnerInfo::local_default()
            },
        );
        ctx.escapes.insert(
            k,
            EscapeInfo {
                class: EscapeClass::Return,
                is_unique: true,
            },
        );
        assert!(!ctx.validate().is_empty());
    }

    #[test]
    fn validate_flags_borrowed_must_free() {
        let mut ctx = AnalysisContext::new();
        let k = key(2);
        ctx.owners.insert(
            k,
            OwnerInfo {
                ownership: VarOwnership::Borrowed,
                must_free: true,
                free_pos: Some(Pos::new(3)),
                ..OwnerInfo::local_default()
            },
        );
        ctx.usage.insert(k, UsageInfo::at_def(Pos::new(1), UsageFlags::PARAMETER));
        assert!(!ctx.validate().is_empty());
    }

    #[test]
    fn validate_accepts_consistent_tables() {
        let mut ctx = AnalysisContext::new();
        let k = key(3);
        ctx.usage.insert(k, UsageInfo::at_def(Pos::new(1), UsageFlags::READ));
        ctx.owners.insert(
            k,
            OwnerInfo {
                free_pos: Some(Pos::new(5)),
                ..OwnerInfo::local_default()
            },
        );
        ctx.escapes.insert(
            k,
            EscapeInfo {
                class: EscapeClass::None,
                is_unique: true,
            },
        );
        ctx.elisions.insert(k, RcElision::ElideBoth);
        assert!(ctx.validate().is_empty());
    }

    #[test]
    fn caller_should_free_non_passthrough_args() {
        let summary = FnSummary {
            params: vec![
                ParamSummary {
                    name: Name::from_raw(1),
                    ownership: ParamOwnership::Passthrough,
                },
                ParamSummary {
                    name: Name::from_raw(2),
                    ownership: ParamOwnership::Borrowed,
                },
            ],
            return_ownership: ReturnOwnership::Passthrough,
            return_param_index: Some(0),
            has_side_effects: false,
            allocates: false,
        };
        assert!(!summary.caller_should_free_arg(0));
        assert!(summary.caller_should_free_arg(1));
    }
}
