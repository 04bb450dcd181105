//! Presentation helpers over stored samples.
//!
//! Nothing here touches the store or the live session; callers pass in a
//! time-ordered slice (typically from `LocalStore::scan_range`).

pub mod downsample;
pub mod summary;

pub use downsample::thin;
pub use summary::{
    attendance_span, route_segments, travel_time, traveled_distance_m, work_and_rest,
    RouteSummary, WorkAndRest,
};
