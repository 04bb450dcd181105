//! Route statistics over a day's samples.
//!
//! All functions expect samples ordered by capture time, as returned by
//! [`LocalStore::scan_range`](crate::db::LocalStore::scan_range).

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::geo;
use crate::types::{LocationSample, SampleKind};

/// Consecutive points at least this far apart count as movement.
const MOVEMENT_THRESHOLD_M: f64 = 10.0;

/// Movement periods longer than this are treated as noise and not counted.
const MAX_MOVEMENT_PERIOD_SECS: i64 = 300;

/// Heading change between legs that starts a new segment.
const SEGMENT_TURN_DEG: f64 = 45.0;

/// Sum of great-circle distances between consecutive points, in meters.
pub fn traveled_distance_m(points: &[LocationSample]) -> f64 {
    points
        .windows(2)
        .map(|w| w[0].coordinate().distance_to(&w[1].coordinate()))
        .sum()
}

/// Estimate of the time actually spent moving.
///
/// A movement period opens at the earlier point of the first pair at least
/// 10 m apart and closes at the first later pair closer than that. Periods
/// over five minutes are dropped. The result never exceeds `total`; when no
/// movement is found it falls back to 10% of `total`, at most five minutes.
pub fn travel_time(points: &[LocationSample], total: Duration) -> Duration {
    if points.len() < 2 {
        return total;
    }

    let cap = Duration::seconds(MAX_MOVEMENT_PERIOD_SECS);
    let mut moving = Duration::zero();
    let mut opened_at: Option<DateTime<Utc>> = None;

    for pair in points.windows(2) {
        let (prev, curr) = (&pair[0], &pair[1]);
        let distance = prev.coordinate().distance_to(&curr.coordinate());

        if distance >= MOVEMENT_THRESHOLD_M {
            opened_at.get_or_insert(prev.captured_at);
        } else if let Some(start) = opened_at.take() {
            let period = curr.captured_at - start;
            if period <= cap {
                moving = moving + period;
            }
        }
    }

    if let (Some(start), Some(last)) = (opened_at, points.last()) {
        let period = last.captured_at - start;
        if period <= cap {
            moving = moving + period;
        }
    }

    let moving = moving.min(total);
    if moving.is_zero() {
        (total / 10).min(cap)
    } else {
        moving
    }
}

/// Time at customer sites versus the rest of the attendance period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkAndRest {
    pub work: Duration,
    pub rest: Duration,
}

/// Pair each `customer_check_in` with the next `customer_check_out`.
///
/// Both totals are zero unless the slice holds a `check_in` and a later
/// `check_out`. An unmatched customer check-in is ignored; a second check-in
/// before a check-out restarts the visit.
pub fn work_and_rest(points: &[LocationSample]) -> WorkAndRest {
    let zero = WorkAndRest {
        work: Duration::zero(),
        rest: Duration::zero(),
    };
    let Some(span) = attendance_span(points) else {
        return zero;
    };

    let mut work = Duration::zero();
    let mut visit_start = None;
    for point in points {
        match point.kind {
            SampleKind::CustomerCheckIn => visit_start = Some(point.captured_at),
            SampleKind::CustomerCheckOut => {
                if let Some(start) = visit_start.take() {
                    work = work + (point.captured_at - start);
                }
            }
            _ => {}
        }
    }

    // Visits can run outside the attendance span
    WorkAndRest {
        work,
        rest: (span - work).max(Duration::zero()),
    }
}

/// First `check_in` to last `check_out`, if both exist in that order.
pub fn attendance_span(points: &[LocationSample]) -> Option<Duration> {
    let start = points.iter().find(|p| p.kind == SampleKind::CheckIn)?;
    let end = points.iter().rev().find(|p| p.kind == SampleKind::CheckOut)?;
    (end.captured_at >= start.captured_at).then(|| end.captured_at - start.captured_at)
}

/// Split the path wherever the heading turns by more than 45°.
///
/// A new segment starts with both points of the turning leg, so consecutive
/// segments share one point. Zero-length legs carry no heading and never
/// split. Fewer than three points form a single segment.
pub fn route_segments(points: &[LocationSample]) -> Vec<&[LocationSample]> {
    if points.len() < 3 {
        return vec![points];
    }

    let mut segments = Vec::new();
    let mut start = 0;
    let mut last_heading: Option<f64> = None;

    for i in 1..points.len() {
        let (a, b) = (points[i - 1].coordinate(), points[i].coordinate());
        if a == b {
            continue;
        }
        let heading = geo::bearing_degrees(a, b);

        if let Some(last) = last_heading {
            if geo::bearing_change(last, heading) > SEGMENT_TURN_DEG {
                segments.push(&points[start..i]);
                start = i - 1;
            }
        }
        last_heading = Some(heading);
    }
    segments.push(&points[start..]);

    segments
}

/// Headline numbers for one agent's day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteSummary {
    pub point_count: usize,
    pub distance_km: f64,
    /// First `check_in` to last `check_out`
    pub duration_secs: Option<i64>,
    /// Present when the attendance duration is positive
    pub average_speed_kmh: Option<f64>,
    pub travel_time_secs: i64,
    pub work_hours: f64,
    pub rest_hours: f64,
    pub segment_count: usize,
}

impl RouteSummary {
    pub fn compute(points: &[LocationSample]) -> Self {
        let distance_km = traveled_distance_m(points) / 1000.0;
        let span = attendance_span(points);

        // Without an attendance span fall back to the first-to-last spread
        let total = span.unwrap_or_else(|| match (points.first(), points.last()) {
            (Some(first), Some(last)) => last.captured_at - first.captured_at,
            _ => Duration::zero(),
        });

        let average_speed_kmh = span
            .filter(|d| d.num_milliseconds() > 0)
            .map(|d| distance_km / hours(d));

        let WorkAndRest { work, rest } = work_and_rest(points);

        Self {
            point_count: points.len(),
            distance_km,
            duration_secs: span.map(|d| d.num_seconds()),
            average_speed_kmh,
            travel_time_secs: travel_time(points, total).num_seconds(),
            work_hours: hours(work),
            rest_hours: hours(rest),
            segment_count: route_segments(points).len(),
        }
    }
}

fn hours(d: Duration) -> f64 {
    d.num_milliseconds() as f64 / 3_600_000.0
}
