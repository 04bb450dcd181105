//! Sample retention: the per-fix filter and the spatial cluster index it consults.

pub mod cluster;
pub mod filter;

pub use cluster::{ClusterAssignment, ClusterIndex};
pub use filter::{AcceptedPoint, Candidate, Decision, DecisionReason, LocationFilter};
