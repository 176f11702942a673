//! # sdx-core
//!
//! Conflict-tracked values for the Sardonyx replicated key-value core.
//!
//! - [`clock`] - dots and version vectors
//! - [`sibling`] - siblings and sibling sets, with their merge
//! - [`resolver`] - per-bucket conflict resolution strategies
//! - [`lattice`] - the join-semilattice trait sibling sets implement

pub mod clock;
pub mod lattice;
pub mod resolver;
pub mod sibling;

pub use clock::{Dot, VersionVector};
pub use lattice::Lattice;
pub use resolver::{ConflictResolver, LastWriterWins, MultiValue, ResolverKind};
pub use sibling::{Sibling, SiblingSet};
