//! Proximity thinning of a finished route for display.
//!
//! Points are grouped the same way the live cluster index groups them: a
//! point joins the first group with a member within `proximity_m`, otherwise
//! it opens a new group. Unlike the live index this runs over a fixed slice
//! and has no time window.

use crate::types::LocationSample;

/// Thin `points` so dwell periods do not crowd a rendered path.
///
/// Per proximity group every important or commented point is kept. A group
/// without one keeps only its earliest ordinary point. The result is sorted
/// by capture time and never longer than the input.
pub fn thin(points: &[LocationSample], proximity_m: f64) -> Vec<LocationSample> {
    let groups = group_by_proximity(points, proximity_m);

    let mut kept: Vec<&LocationSample> = Vec::with_capacity(groups.len());
    for group in &groups {
        let retained: Vec<&LocationSample> = group
            .iter()
            .map(|&i| &points[i])
            .filter(|p| p.is_retained())
            .collect();

        if retained.is_empty() {
            if let Some(earliest) = group.iter().map(|&i| &points[i]).min_by_key(|p| p.captured_at) {
                kept.push(earliest);
            }
        } else {
            kept.extend(retained);
        }
    }

    kept.sort_by_key(|p| p.captured_at);
    kept.into_iter().cloned().collect()
}

/// Group indices into `points`, first match wins, groups in creation order.
fn group_by_proximity(points: &[LocationSample], proximity_m: f64) -> Vec<Vec<usize>> {
    let mut groups: Vec<Vec<usize>> = Vec::new();

    for (i, point) in points.iter().enumerate() {
        let coordinate = point.coordinate();
        let home = groups.iter_mut().find(|group| {
            group
                .iter()
                .any(|&j| points[j].coordinate().distance_to(&coordinate) <= proximity_m)
        });

        match home {
            Some(group) => group.push(i),
            None => groups.push(vec![i]),
        }
    }

    groups
}
