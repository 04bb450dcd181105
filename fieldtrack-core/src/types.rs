//! Core domain types for fieldtrack
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Agent** | The employee whose device is being tracked |
//! | **Attendance** | A work period opened by a check-in on the attendance service |
//! | **Session** | One continuous tracking period bounded by `start`/`stop`, tied to one attendance |
//! | **Sample** | One persisted position reading with metadata |
//! | **Important sample** | A check-in/check-out boundary event, own or at a customer; always kept |
//! | **Cluster** | Nearby ordinary samples inside the lookback window, subject to a cap |
//!
//! Samples are keyed by `captured_at`. Within a session those timestamps are
//! strictly increasing, so the key doubles as the sync order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================
// Coordinates
// ============================================

/// A WGS84 position in signed decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Whether both components are finite and inside ±90 / ±180.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    /// Great-circle distance to `other` in meters.
    pub fn distance_to(&self, other: &Coordinate) -> f64 {
        crate::geo::distance_meters(*self, *other)
    }
}

// ============================================
// Sample kind
// ============================================

/// What a sample records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleKind {
    /// Start of the attendance period
    CheckIn,
    /// End of the attendance period
    CheckOut,
    /// Arrival at a customer site
    CustomerCheckIn,
    /// Departure from a customer site
    CustomerCheckOut,
    /// Periodic position along the way
    #[default]
    RoutePoint,
}

impl SampleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SampleKind::CheckIn => "check_in",
            SampleKind::CheckOut => "check_out",
            SampleKind::CustomerCheckIn => "customer_check_in",
            SampleKind::CustomerCheckOut => "customer_check_out",
            SampleKind::RoutePoint => "route_point",
        }
    }

    /// Boundary events are never filtered out and never clustered.
    pub fn is_important(&self) -> bool {
        !matches!(self, SampleKind::RoutePoint)
    }
}

impl std::fmt::Display for SampleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SampleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "check_in" => Ok(SampleKind::CheckIn),
            "check_out" => Ok(SampleKind::CheckOut),
            "customer_check_in" => Ok(SampleKind::CustomerCheckIn),
            "customer_check_out" => Ok(SampleKind::CustomerCheckOut),
            "route_point" => Ok(SampleKind::RoutePoint),
            _ => Err(format!("unknown sample kind: {}", s)),
        }
    }
}

// ============================================
// Location sample
// ============================================

/// One accepted position reading, as persisted in the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    /// Capture time; unique per session and the store key
    pub captured_at: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy radius in meters reported by the provider
    pub accuracy: f64,
    pub agent_id: String,
    pub attendance_id: String,
    pub session_id: String,
    /// Optional sub-activity
    pub task_id: Option<String>,
    pub kind: SampleKind,
    /// Free-text annotation; makes the sample important for display thinning
    pub comment: Option<String>,
    /// Cluster assigned at accept time; `None` for important samples
    pub cluster_id: Option<String>,
    /// Set once the remote confirmed the record; never reverted
    pub synced: bool,
}

impl LocationSample {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }

    pub fn is_important(&self) -> bool {
        self.kind.is_important()
    }

    pub fn has_comment(&self) -> bool {
        self.comment
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty())
    }

    /// Important or commented: such points survive display thinning.
    pub fn is_retained(&self) -> bool {
        self.is_important() || self.has_comment()
    }
}

// ============================================
// Tracking session
// ============================================

/// A running tracking period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingSession {
    /// Locally generated identifier (UUID v4)
    pub session_id: String,
    pub agent_id: String,
    pub attendance_id: String,
    pub task_id: Option<String>,
    /// Kind stamped on the opening sample
    pub kind: SampleKind,
    /// Comment stamped on the opening sample
    pub comment: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// Parameters for starting a session.
///
/// Identifiers left as `None` are resolved through the
/// [`IdentityResolver`](crate::session::IdentityResolver).
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub agent_id: Option<String>,
    pub attendance_id: Option<String>,
    pub task_id: Option<String>,
    pub kind: Option<SampleKind>,
    pub comment: Option<String>,
}

impl StartRequest {
    pub fn new(agent_id: impl Into<String>, attendance_id: impl Into<String>) -> Self {
        Self {
            agent_id: Some(agent_id.into()),
            attendance_id: Some(attendance_id.into()),
            ..Default::default()
        }
    }
}
