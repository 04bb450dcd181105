//! Agent and attendance lookup.

use std::future::Future;
use std::sync::Arc;

/// Answer from the identity resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityStatus {
    /// The agent is known; `attendance_id` is set when a work period is open
    Ok {
        agent_id: String,
        attendance_id: Option<String>,
    },
    /// Tracking is turned off for this agent; never auto-start
    Disabled,
    Error(String),
}

/// Resolves the current agent and any open attendance period.
pub trait IdentityResolver: Send + Sync + 'static {
    fn resolve(&self) -> impl Future<Output = IdentityStatus> + Send;
}

impl<T: IdentityResolver> IdentityResolver for Arc<T> {
    fn resolve(&self) -> impl Future<Output = IdentityStatus> + Send {
        (**self).resolve()
    }
}

/// Always answers with the same status. For hosts that know the identity up
/// front.
#[derive(Debug, Clone)]
pub struct FixedIdentity(pub IdentityStatus);

impl IdentityResolver for FixedIdentity {
    async fn resolve(&self) -> IdentityStatus {
        self.0.clone()
    }
}
