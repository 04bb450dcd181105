//! Accept/reject decision for a freshly observed fix.

use crate::config::TrackingConfig;
use crate::tracking::cluster::ClusterIndex;
use crate::types::{Coordinate, SampleKind};
use chrono::{DateTime, Duration, Utc};

/// A fix about to be filtered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub coordinate: Coordinate,
    pub accuracy: f64,
    pub kind: SampleKind,
    pub captured_at: DateTime<Utc>,
}

/// The last sample the session persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcceptedPoint {
    pub coordinate: Coordinate,
    pub captured_at: DateTime<Utc>,
}

/// Which rule settled the decision.
#[derive(Debug, Clone, PartialEq)]
pub enum DecisionReason {
    Important,
    Bootstrap,
    Moved { distance_m: f64 },
    Dwell,
    InaccurateFix { accuracy: f64 },
    TooSoon { elapsed_secs: i64 },
    ClusterFull { count: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub accept: bool,
    /// Cluster to stamp on the sample; `None` for important samples and rejections
    pub cluster_id: Option<String>,
    pub reason: DecisionReason,
}

impl Decision {
    fn accept(cluster_id: Option<String>, reason: DecisionReason) -> Self {
        Self {
            accept: true,
            cluster_id,
            reason,
        }
    }

    fn reject(reason: DecisionReason) -> Self {
        Self {
            accept: false,
            cluster_id: None,
            reason,
        }
    }
}

/// Threshold-driven sample filter.
#[derive(Debug, Clone)]
pub struct LocationFilter {
    max_accuracy_m: f64,
    min_distance_m: f64,
    min_dwell: Duration,
    cluster_cap: usize,
}

impl LocationFilter {
    pub fn new(config: &TrackingConfig) -> Self {
        Self {
            max_accuracy_m: config.max_accuracy_m,
            min_distance_m: config.min_distance_m,
            min_dwell: config.min_dwell(),
            cluster_cap: config.cluster_cap,
        }
    }

    /// Decide whether `candidate` should be persisted.
    ///
    /// Rules, first match wins:
    /// 1. important kinds are accepted without a cluster
    /// 2. the first sample of a session is accepted
    /// 3. fixes worse than `max_accuracy_m` are rejected
    /// 4. movement of at least `min_distance_m` is accepted, never capped
    /// 5. less than `min_dwell` since the last sample is rejected
    /// 6. otherwise accepted unless the cluster is full and has no important neighbor
    ///
    /// The index is consulted but never mutated beyond pruning; the caller
    /// inserts the sample once it has been stored.
    pub fn decide(
        &self,
        candidate: &Candidate,
        last_accepted: Option<&AcceptedPoint>,
        clusters: &mut ClusterIndex,
    ) -> Decision {
        if candidate.kind.is_important() {
            return Decision::accept(None, DecisionReason::Important);
        }

        let Some(last) = last_accepted else {
            let cluster = clusters.find_or_create_cluster(candidate.coordinate, candidate.captured_at);
            return Decision::accept(Some(cluster.cluster_id), DecisionReason::Bootstrap);
        };

        if candidate.accuracy > self.max_accuracy_m {
            return Decision::reject(DecisionReason::InaccurateFix {
                accuracy: candidate.accuracy,
            });
        }

        let distance_m = candidate.coordinate.distance_to(&last.coordinate);
        if distance_m >= self.min_distance_m {
            let cluster = clusters.find_or_create_cluster(candidate.coordinate, candidate.captured_at);
            return Decision::accept(Some(cluster.cluster_id), DecisionReason::Moved { distance_m });
        }

        let elapsed = candidate.captured_at - last.captured_at;
        if elapsed < self.min_dwell {
            return Decision::reject(DecisionReason::TooSoon {
                elapsed_secs: elapsed.num_seconds(),
            });
        }

        let cluster = clusters.find_or_create_cluster(candidate.coordinate, candidate.captured_at);
        if cluster.ordinary_count >= self.cluster_cap && !cluster.has_important_neighbor {
            return Decision::reject(DecisionReason::ClusterFull {
                count: cluster.ordinary_count,
            });
        }

        Decision::accept(Some(cluster.cluster_id), DecisionReason::Dwell)
    }
}
