//! Belief inference from program dependence graphs.
//!
//! The dependence graph says which loads feed which stores. From it the
//! database derives PM objects (merged address intervals), ordering beliefs
//! between objects, and the set of objects whose reads are critical.

pub mod belief;
pub mod graph;
pub mod objects;

pub use belief::{Belief, BeliefDatabase};
pub use graph::{AccessKind, DepEdge, DepGraph, DepNode, EdgeKind};
pub use objects::{PmObject, PmObjectList};
