//! AST value tree for the Sylva compiler.
//!
//! Sylva programs are symbolic expressions: every form is built from six
//! value variants — integers, floats, characters, interned symbols, cons
//! cells, and nil. The reader produces an [`Ast`] arena of these nodes and
//! every analysis pass consumes it read-only, attaching facts to side
//! tables keyed by [`NodeId`], by pre-order [`Pos`], or by symbol [`Name`].
//!
//! This crate provides:
//!
//! - **[`Ast`] / [`NodeId`] / [`Pos`]** — the append-only node arena with
//!   stable ids and pre-order positions.
//! - **[`ExprKind`]** — the value sum. `Cell` is the universal list and
//!   application node; the first element of an application carries the
//!   operator symbol.
//! - **[`Name`] / [`StringInterner`]** — compact 32-bit interned symbols.
//! - **[`Span`]** — 8-byte source locations.
//! - **[`SpecialForm`]** — recognition of the built-in operator heads.

pub mod ast;
pub mod interner;
pub mod name;
pub mod span;

mod display;
mod forms;

pub use ast::{Ast, Expr, ExprKind, ListIter, NodeId, Pos};
pub use forms::SpecialForm;
pub use interner::{InternError, StringInterner};
pub use name::Name;
pub use span::Span;
