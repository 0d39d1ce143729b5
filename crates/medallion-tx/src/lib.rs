//! # Medallion TX - Silver Transformations
//!
//! - [`unify`]: joins the three bronze tables on the customer key, anchored on
//!   the statement-derived table
//! - [`normalize`]: deterministic column-wise cleaning rules applied to the joined table
//!
//! Normalization works on plain Arrow batches and does not need a
//! `SessionContext`; only unification goes through DataFusion.

pub mod normalize;
pub mod unify;

pub use normalize::{ColumnRule, LetterCase, Normalizer};
pub use unify::{BronzeTables, KeyStats, UnifiedTable, Unifier};
