use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChallengeId(u64);

impl ChallengeId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChallengeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChallengeOutcome {
    Pending,
    /// Password validated by the backend.
    Passed,
    /// Wrong password, dismissed prompt, or validation transport failure.
    Failed,
    /// The backend timer elapsed before the person answered.
    TimedOut,
}

impl ChallengeOutcome {
    #[must_use]
    pub const fn is_resolved(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// What a `TimedOut` challenge means for the person's safety.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// No answer within the window clears the alert as if the password was
    /// entered. This is the behavior of the deployed app.
    #[default]
    TreatAsPassed,
    /// No answer is an escalation; the alert is not cleared as a pass.
    Escalate,
}

/// One "are you OK" challenge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Challenge {
    pub id: ChallengeId,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub outcome: ChallengeOutcome,
}

impl Challenge {
    #[must_use]
    pub fn start(id: ChallengeId, started_at: DateTime<Utc>, window: Duration) -> Self {
        Self {
            id,
            started_at,
            deadline: started_at + window,
            outcome: ChallengeOutcome::Pending,
        }
    }

    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self.outcome, ChallengeOutcome::Pending)
    }

    /// Record the outcome. Returns false if already resolved.
    pub fn resolve(&mut self, outcome: ChallengeOutcome) -> bool {
        if self.outcome.is_resolved() || !outcome.is_resolved() {
            return false;
        }
        self.outcome = outcome;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_resolves_once() {
        let now = Utc::now();
        let mut challenge = Challenge::start(ChallengeId::new(1), now, Duration::seconds(10));
        assert_eq!(challenge.deadline - challenge.started_at, Duration::seconds(10));
        assert!(challenge.is_pending());

        assert!(challenge.resolve(ChallengeOutcome::Passed));
        assert!(!challenge.resolve(ChallengeOutcome::TimedOut));
        assert_eq!(challenge.outcome, ChallengeOutcome::Passed);
    }

    #[test]
    fn pending_is_not_a_resolution() {
        let mut challenge =
            Challenge::start(ChallengeId::new(2), Utc::now(), Duration::seconds(10));
        assert!(!challenge.resolve(ChallengeOutcome::Pending));
        assert!(challenge.is_pending());
    }

    #[test]
    fn timeout_policy_parses_snake_case() {
        #[derive(Deserialize)]
        struct Wrapper {
            policy: TimeoutPolicy,
        }
        let w: Wrapper = serde_json::from_str(r#"{"policy": "escalate"}"#).unwrap();
        assert_eq!(w.policy, TimeoutPolicy::Escalate);
        assert_eq!(TimeoutPolicy::default(), TimeoutPolicy::TreatAsPassed);
    }
}
