//! Monitoring core for SafeWalk.
//!
//! [`SafetyMonitorSession`] composes the pieces below for one person and one
//! active route at a time:
//!
//! - [`RouteStore`] holds the active route behind an atomic swap.
//! - [`DeviationMonitor`] is the per-route deviation state machine.
//! - [`ChallengeCoordinator`] races the password prompt against the server
//!   timer.
//! - [`RouteSafetyScorer`] samples a route and aggregates classifier ratings.
//!
//! The UI layer only talks to the session: it sends [`SessionCommand`]s,
//! answers password requests through a [`PasswordPrompt`] such as
//! [`PromptBroker`], and renders [`SessionSnapshot`]s and [`SessionEvent`]s.

mod challenge;
mod deviation;
mod prompt;
mod route_store;
mod scorer;
mod session;

pub use challenge::{ChallengeCoordinator, ChallengeResolution};
pub use deviation::{DeviationMonitor, DeviationReading, DeviationTransition};
pub use prompt::{PasswordPrompt, PromptBroker, PromptFut};
pub use route_store::{ActiveRoute, RouteStore};
pub use scorer::{RouteSafetyScorer, ScoreError, sample_indices};
pub use session::{
    SafetyMonitorSession, SessionCommand, SessionError, SessionEvent, SessionProviders,
    SessionSettings, SessionSnapshot,
};

pub use safewalk_config;
pub use safewalk_providers;
pub use safewalk_types;
