//! Positioning provider seam.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::clock::Clock;
use crate::error::ProviderError;
use crate::types::Coordinate;

/// Slack for provider timestamps running ahead of or behind our clock.
const FIX_CLOCK_SKEW: Duration = Duration::from_secs(1);

/// Parameters for one position request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixOptions {
    /// Ask for the most accurate (and most power-hungry) mode
    pub high_accuracy: bool,
    pub timeout: Duration,
    /// Oldest cached fix the provider may return
    pub max_age: Duration,
}

/// A position reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fix {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy radius in meters
    pub accuracy: f64,
    /// When the provider took the reading
    pub at: DateTime<Utc>,
}

impl Fix {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }
}

/// Source of position fixes (device GPS, a replay file, a test script).
pub trait PositionProvider: Send + Sync + 'static {
    fn get_fix(
        &self,
        options: FixOptions,
    ) -> impl Future<Output = Result<Fix, ProviderError>> + Send;
}

impl<T: PositionProvider> PositionProvider for Arc<T> {
    fn get_fix(
        &self,
        options: FixOptions,
    ) -> impl Future<Output = Result<Fix, ProviderError>> + Send {
        (**self).get_fix(options)
    }
}

/// Request a fix, racing the provider against `options.timeout`.
///
/// A slow provider yields [`ProviderError::Timeout`]; coordinates outside
/// ±90/±180, a nonsensical accuracy, or a reading older than
/// `options.max_age` by `clock` yield [`ProviderError::Unavailable`].
pub async fn request_fix<P: PositionProvider>(
    provider: &P,
    options: FixOptions,
    clock: &dyn Clock,
) -> Result<Fix, ProviderError> {
    let fix = tokio::time::timeout(options.timeout, provider.get_fix(options))
        .await
        .map_err(|_| ProviderError::Timeout)??;

    // A reading ahead of our clock has a negative age and counts as fresh
    if let Ok(age) = clock.now().signed_duration_since(fix.at).to_std() {
        if age > options.max_age + FIX_CLOCK_SKEW {
            return Err(ProviderError::Unavailable(format!(
                "stale fix from {} ({}s old)",
                fix.at.format("%Y-%m-%d %H:%M:%S"),
                age.as_secs()
            )));
        }
    }

    if !fix.coordinate().is_valid() {
        return Err(ProviderError::Unavailable(format!(
            "invalid coordinate ({}, {})",
            fix.latitude, fix.longitude
        )));
    }
    if !fix.accuracy.is_finite() || fix.accuracy < 0.0 {
        return Err(ProviderError::Unavailable(format!(
            "invalid accuracy {}",
            fix.accuracy
        )));
    }

    Ok(fix)
}
