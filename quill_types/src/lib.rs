//! Type model for the quill bytecode translator.
//!
//! The translator never executes user code; everything it knows about values
//! comes from this crate. A [`TypeModel`] holds:
//!
//! - [`TypeDescriptor`]s with their bases and C3-linearised MRO
//! - Per-type method tables of overloaded [`Signature`]s
//! - Attribute types and the names bound in the builtins namespace
//!
//! The model is built once (usually via [`TypeModel::with_builtins`]), then
//! shared read-only between translations behind an `Arc`.
//!
//! # Lattice
//!
//! ```text
//!                 object (universal)
//!               /    |      \
//!            int   str   BaseException ...
//!             |             |
//!            bool       Exception
//!                           |
//!                       ValueError
//! ```
//!
//! [`TypeModel::common_supertype`] is the join of this lattice. Its height is
//! bounded by [`TypeModel::max_depth`], which is what makes the dataflow
//! fixed point terminate.

mod builtins;
mod error;
mod id;
mod model;
mod mro;
mod signature;

pub use error::TypeModelError;
pub use id::TypeId;
pub use model::{GlobalBinding, TypeDescriptor, TypeModel};
pub use mro::compute_c3_mro;
pub use signature::Signature;
