//! Deviation state machine, one per active route.
//!
//! ```text
//!            beyond threshold              challenge started
//!   Armed ─────────────────────▶ Deviated ─────────────────▶ Challenged
//!     ▲                                                        │    │
//!     │ Failed / escalated timeout                             │    │ Passed /
//!     └────────────────────────────────────────────────────────┘    │ timeout as pass
//!     ▲                                                             ▼
//!     └──────────── back within threshold ──────────────────── Acknowledged
//! ```
//!
//! `Armed` and `Acknowledged` both read as [`DeviationState::Nominal`]. An
//! acknowledged excursion does not fire again until the person has come back
//! within the threshold, which gives one transition per crossing.
//! `Overridden` is entered only through [`DeviationMonitor::override_monitoring`]
//! and left only through [`DeviationMonitor::reset`].

use safewalk_config::DeviationSettings;
use safewalk_types::{ChallengeId, ChallengeOutcome, DeviationState, Position, Route, TimeoutPolicy};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Armed,
    Deviated,
    Challenged(ChallengeId),
    Acknowledged,
    Overridden,
}

/// Edge taken by one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviationTransition {
    /// Crossed the threshold while armed. A challenge must start.
    Deviated,
    /// Came back within the threshold after an acknowledged excursion.
    Rejoined,
}

/// Result of evaluating one position against the active route.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DeviationReading {
    pub min_distance_m: f64,
    pub nearest_index: usize,
    pub off_route: bool,
    pub transition: Option<DeviationTransition>,
}

#[derive(Debug)]
pub struct DeviationMonitor {
    threshold_m: f64,
    phase: Phase,
}

impl DeviationMonitor {
    #[must_use]
    pub fn new(settings: DeviationSettings) -> Self {
        Self {
            threshold_m: settings.deviation_threshold_meters,
            phase: Phase::Armed,
        }
    }

    #[must_use]
    pub fn threshold_meters(&self) -> f64 {
        self.threshold_m
    }

    #[must_use]
    pub fn state(&self) -> DeviationState {
        match self.phase {
            Phase::Armed | Phase::Acknowledged => DeviationState::Nominal,
            Phase::Deviated => DeviationState::Deviated,
            Phase::Challenged(_) => DeviationState::Challenged,
            Phase::Overridden => DeviationState::Overridden,
        }
    }

    /// Challenge currently pending, if any.
    #[must_use]
    pub fn pending_challenge(&self) -> Option<ChallengeId> {
        match self.phase {
            Phase::Challenged(id) => Some(id),
            _ => None,
        }
    }

    /// Evaluate a position. `None` while monitoring is overridden.
    pub fn evaluate(&mut self, route: &Route, position: &Position) -> Option<DeviationReading> {
        if self.phase == Phase::Overridden {
            return None;
        }

        let (nearest_index, min_distance_m) = route.nearest_point(position.coordinate);
        let off_route = min_distance_m > self.threshold_m;

        let transition = match (self.phase, off_route) {
            (Phase::Armed, true) => {
                self.phase = Phase::Deviated;
                Some(DeviationTransition::Deviated)
            }
            (Phase::Acknowledged, false) => {
                self.phase = Phase::Armed;
                Some(DeviationTransition::Rejoined)
            }
            _ => None,
        };

        let reading = DeviationReading {
            min_distance_m,
            nearest_index,
            off_route,
            transition,
        };
        tracing::debug!(
            distance_m = reading.min_distance_m,
            nearest = reading.nearest_index,
            state = self.state().label(),
            "Position evaluated"
        );
        Some(reading)
    }

    /// `Deviated -> Challenged`. Ignored outside `Deviated`.
    pub fn begin_challenge(&mut self, id: ChallengeId) -> bool {
        if self.phase != Phase::Deviated {
            return false;
        }
        self.phase = Phase::Challenged(id);
        true
    }

    /// Apply a challenge outcome. Returns false for an outcome that does not
    /// belong to the pending challenge.
    pub fn resolve_challenge(
        &mut self,
        id: ChallengeId,
        outcome: ChallengeOutcome,
        policy: TimeoutPolicy,
    ) -> bool {
        if self.phase != Phase::Challenged(id) {
            return false;
        }
        self.phase = match (outcome, policy) {
            (ChallengeOutcome::Pending, _) => return false,
            (ChallengeOutcome::Passed, _)
            | (ChallengeOutcome::TimedOut, TimeoutPolicy::TreatAsPassed) => Phase::Acknowledged,
            (ChallengeOutcome::Failed, _) | (ChallengeOutcome::TimedOut, TimeoutPolicy::Escalate) => {
                Phase::Armed
            }
        };
        true
    }

    /// Suspend monitoring for the rest of this route. Returns the challenge
    /// that was pending, which the caller must cancel.
    pub fn override_monitoring(&mut self) -> Option<ChallengeId> {
        let pending = self.pending_challenge();
        self.phase = Phase::Overridden;
        pending
    }

    /// Back to `Nominal` for a newly installed route.
    pub fn reset(&mut self) {
        self.phase = Phase::Armed;
    }
}
