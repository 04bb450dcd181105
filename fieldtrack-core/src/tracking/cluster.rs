//! Spatial clustering of recently accepted samples.
//!
//! The index keeps every sample accepted inside the lookback window. A
//! coordinate belongs to the first cluster that has a member within
//! `radius_m`; clusters are never merged, so a lookup is a linear scan of the
//! window. Important samples are tracked only so that a cluster near one can
//! be exempted from the cap.

use crate::types::Coordinate;
use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

/// Result of locating a coordinate in the index.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterAssignment {
    /// Existing cluster id, or a freshly minted one
    pub cluster_id: String,
    /// Ordinary samples already in the cluster
    pub ordinary_count: usize,
    /// An important sample lies within the radius of the coordinate or of a member
    pub has_important_neighbor: bool,
}

#[derive(Debug, Clone)]
enum Membership {
    Ordinary { cluster_id: String },
    Important,
}

#[derive(Debug, Clone)]
struct Member {
    captured_at: DateTime<Utc>,
    coordinate: Coordinate,
    membership: Membership,
}

/// Lookback window of accepted samples grouped by proximity.
#[derive(Debug, Clone)]
pub struct ClusterIndex {
    radius_m: f64,
    window: Duration,
    /// Oldest first
    members: VecDeque<Member>,
    next_seq: u64,
}

impl ClusterIndex {
    pub fn new(radius_m: f64, window: Duration) -> Self {
        Self {
            radius_m,
            window,
            members: VecDeque::new(),
            next_seq: 1,
        }
    }

    /// Drop members captured before `now - window`.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.window;
        while self
            .members
            .front()
            .is_some_and(|m| m.captured_at < cutoff)
        {
            self.members.pop_front();
        }
    }

    /// Locate the cluster `coordinate` falls in, minting an id if none matches.
    ///
    /// Nothing is inserted; call [`ClusterIndex::insert_ordinary`] once the
    /// sample has actually been persisted.
    pub fn find_or_create_cluster(
        &mut self,
        coordinate: Coordinate,
        now: DateTime<Utc>,
    ) -> ClusterAssignment {
        self.prune(now);

        let existing = self.members.iter().find_map(|m| match &m.membership {
            Membership::Ordinary { cluster_id } if self.is_near(&m.coordinate, &coordinate) => {
                Some(cluster_id.clone())
            }
            _ => None,
        });

        match existing {
            Some(cluster_id) => {
                let cluster: Vec<&Member> = self
                    .members
                    .iter()
                    .filter(|m| {
                        matches!(&m.membership, Membership::Ordinary { cluster_id: id } if *id == cluster_id)
                    })
                    .collect();

                let has_important_neighbor = self.important_members().any(|imp| {
                    self.is_near(&imp.coordinate, &coordinate)
                        || cluster
                            .iter()
                            .any(|m| self.is_near(&imp.coordinate, &m.coordinate))
                });

                ClusterAssignment {
                    ordinary_count: cluster.len(),
                    cluster_id,
                    has_important_neighbor,
                }
            }
            None => {
                let has_important_neighbor = self
                    .important_members()
                    .any(|imp| self.is_near(&imp.coordinate, &coordinate));
                let cluster_id = format!(
                    "{}:{:.5},{:.5}",
                    self.next_seq, coordinate.latitude, coordinate.longitude
                );
                self.next_seq += 1;

                ClusterAssignment {
                    cluster_id,
                    ordinary_count: 0,
                    has_important_neighbor,
                }
            }
        }
    }

    /// Record an accepted ordinary sample under `cluster_id`.
    pub fn insert_ordinary(
        &mut self,
        captured_at: DateTime<Utc>,
        coordinate: Coordinate,
        cluster_id: String,
    ) {
        self.members.push_back(Member {
            captured_at,
            coordinate,
            membership: Membership::Ordinary { cluster_id },
        });
    }

    /// Record an accepted important sample. It never counts toward a cap.
    pub fn insert_important(&mut self, captured_at: DateTime<Utc>, coordinate: Coordinate) {
        self.members.push_back(Member {
            captured_at,
            coordinate,
            membership: Membership::Important,
        });
    }

    /// Change radius and window. Existing members keep their cluster ids.
    pub fn reconfigure(&mut self, radius_m: f64, window: Duration) {
        self.radius_m = radius_m;
        self.window = window;
    }

    fn important_members(&self) -> impl Iterator<Item = &Member> {
        self.members
            .iter()
            .filter(|m| matches!(m.membership, Membership::Important))
    }

    fn is_near(&self, a: &Coordinate, b: &Coordinate) -> bool {
        a.distance_to(b) <= self.radius_m
    }
}
