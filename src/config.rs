//! Workflow tuning knobs.

use chrono::Duration;

#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// How long transfer verification codes stay valid after issuance.
    pub verification_ttl: Duration,
    /// Minimum gap between code issuances per channel, measured from the
    /// previous code's issuance.
    pub resend_cooldown: Duration,
    /// When set, a case parked in review longer than this may be lazily
    /// expired. `None` means reviewer inaction parks the case indefinitely.
    pub stale_review_ttl: Option<Duration>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            verification_ttl: Duration::minutes(15),
            resend_cooldown: Duration::seconds(60),
            stale_review_ttl: None,
        }
    }
}
