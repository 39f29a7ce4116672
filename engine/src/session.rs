//! The safety monitor session: the one object the UI layer talks to.
//!
//! The session is the only writer of the active route and the deviation
//! state. Positions are evaluated synchronously as they arrive; challenge
//! races and route scoring run as spawned tasks whose results come back over
//! channels and are applied only if they still belong to the installed route
//! generation.

use std::sync::Arc;

use safewalk_config::{ChallengeSettings, DeviationSettings, ScorerSettings, Settings};
use safewalk_providers::{
    AddressBook, BackendError, ChallengeBackend, LocationError, LocationPermission,
    PositionSource, PredictionClient, RouteError, RouteProvider,
};
use safewalk_types::{
    Challenge, ChallengeOutcome, DeviationState, LatLon, Position, RouteGeneration,
    SafetyAssessment, Secret, TimeoutPolicy,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::challenge::{ChallengeCoordinator, ChallengeResolution};
use crate::deviation::{DeviationMonitor, DeviationReading, DeviationTransition};
use crate::prompt::PasswordPrompt;
use crate::route_store::{ActiveRoute, RouteStore};
use crate::scorer::{RouteSafetyScorer, ScoreError};

const EVENT_CHANNEL_CAPACITY: usize = 64;
const RESULT_CHANNEL_CAPACITY: usize = 8;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no position fix has been received yet")]
    NoPosition,
    #[error("no route is active")]
    NoRoute,
    #[error(transparent)]
    Location(#[from] LocationError),
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Score(#[from] ScoreError),
}

impl SessionError {
    /// One sentence for the person using the app.
    #[must_use]
    pub fn notice(&self) -> &'static str {
        match self {
            Self::NoPosition => "Waiting for your location. Try again once it appears.",
            Self::NoRoute => "Choose a destination first.",
            Self::Location(LocationError::PermissionDenied) => {
                "Location access is off. Allow location access to start monitoring."
            }
            Self::Route(RouteError::InvalidCoordinates(_)) => {
                "That destination is not a valid location."
            }
            Self::Route(RouteError::RouteNotFound { .. }) => {
                "No walking route was found to that destination."
            }
            Self::Route(RouteError::RouteFetchFailed { .. }) => {
                "Could not reach the directions service. Please try again."
            }
            Self::Backend(BackendError::EmptyPassword) => "The password cannot be empty.",
            Self::Backend(_) => "Could not reach the SafeWalk service. Please try again.",
            Self::Score(ScoreError::PredictionUnavailable { .. }) => {
                "The safety rating for this route is unavailable right now."
            }
            Self::Score(ScoreError::Cancelled) => "The safety rating was cancelled.",
        }
    }
}

/// Capabilities the session is built from.
pub struct SessionProviders {
    pub positions: Arc<dyn PositionSource>,
    pub routes: Arc<dyn RouteProvider>,
    pub predictions: Arc<dyn PredictionClient>,
    pub challenges: Arc<dyn ChallengeBackend>,
    pub addresses: Arc<dyn AddressBook>,
    pub prompt: Arc<dyn PasswordPrompt>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SessionSettings {
    pub monitor: DeviationSettings,
    pub challenge: ChallengeSettings,
    pub scorer: ScorerSettings,
}

impl From<&Settings> for SessionSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            monitor: settings.monitor,
            challenge: settings.challenge,
            scorer: settings.scorer,
        }
    }
}

/// Read-only view for the UI layer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionSnapshot {
    pub position: Option<Position>,
    pub route: Option<Arc<ActiveRoute>>,
    pub deviation: DeviationState,
    pub challenge: Option<Challenge>,
    pub last_reading: Option<DeviationReading>,
    pub assessment: Option<SafetyAssessment>,
    pub scoring: bool,
}

/// Things the UI should tell the person about.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    RouteInstalled {
        generation: RouteGeneration,
        points: usize,
    },
    RouteFailed {
        notice: String,
    },
    ChallengeStarted {
        challenge: Challenge,
        distance_m: f64,
    },
    ChallengeResolved {
        challenge: Challenge,
    },
    /// The person did not answer and the timeout policy says escalate.
    Escalated {
        challenge: Challenge,
    },
    AssessmentReady {
        generation: RouteGeneration,
        assessment: SafetyAssessment,
    },
    AssessmentFailed {
        generation: RouteGeneration,
        notice: String,
    },
    MonitoringOverridden,
    PasswordRegistered,
    AddressFetched {
        address: Option<String>,
    },
    Notice {
        notice: String,
    },
}

/// Requests from the UI layer, for [`SafetyMonitorSession::run`].
///
/// Password answers do not go through here; the UI answers the prompt
/// directly.
#[derive(Debug)]
pub enum SessionCommand {
    SelectDestination(LatLon),
    OverrideMonitoring,
    RegisterPassword(Secret),
    ReportAddress(String),
    FetchAddress,
}

#[derive(Debug)]
struct ScoredRoute {
    generation: RouteGeneration,
    result: Result<SafetyAssessment, ScoreError>,
}

#[derive(Debug)]
enum Background {
    Challenge(ChallengeResolution),
    Assessment(ScoredRoute),
}

pub struct SafetyMonitorSession {
    positions: Arc<dyn PositionSource>,
    routes: Arc<dyn RouteProvider>,
    challenge_backend: Arc<dyn ChallengeBackend>,
    addresses: Arc<dyn AddressBook>,
    store: RouteStore,
    monitor: DeviationMonitor,
    coordinator: ChallengeCoordinator,
    scorer: RouteSafetyScorer,
    timeout_policy: TimeoutPolicy,
    position: Option<Position>,
    last_reading: Option<DeviationReading>,
    assessment: Option<SafetyAssessment>,
    scoring: Option<CancellationToken>,
    resolutions: mpsc::Receiver<ChallengeResolution>,
    assessments_tx: mpsc::Sender<ScoredRoute>,
    assessments: mpsc::Receiver<ScoredRoute>,
    events: mpsc::Sender<SessionEvent>,
    snapshot: watch::Sender<SessionSnapshot>,
}

impl SafetyMonitorSession {
    /// Build a session. The returned receiver carries [`SessionEvent`]s.
    #[must_use]
    pub fn new(
        providers: SessionProviders,
        settings: SessionSettings,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (events, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (resolutions_tx, resolutions) = mpsc::channel(RESULT_CHANNEL_CAPACITY);
        let (assessments_tx, assessments) = mpsc::channel(RESULT_CHANNEL_CAPACITY);
        let (snapshot, _) = watch::channel(SessionSnapshot::default());

        let session = Self {
            positions: providers.positions,
            routes: providers.routes,
            challenge_backend: Arc::clone(&providers.challenges),
            addresses: providers.addresses,
            store: RouteStore::new(),
            monitor: DeviationMonitor::new(settings.monitor),
            coordinator: ChallengeCoordinator::new(
                providers.challenges,
                providers.prompt,
                settings.challenge,
                resolutions_tx,
            ),
            scorer: RouteSafetyScorer::new(providers.predictions, settings.scorer),
            timeout_policy: settings.challenge.timeout_policy,
            position: None,
            last_reading: None,
            assessment: None,
            scoring: None,
            resolutions,
            assessments_tx,
            assessments,
            events,
            snapshot,
        };
        (session, events_rx)
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            position: self.position,
            route: self.store.current(),
            deviation: self.monitor.state(),
            challenge: self.coordinator.active().cloned(),
            last_reading: self.last_reading,
            assessment: self.assessment.clone(),
            scoring: self.scoring.is_some(),
        }
    }

    /// Snapshot stream, updated after every state change.
    #[must_use]
    pub fn snapshots(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.subscribe()
    }

    /// Route replacements.
    #[must_use]
    pub fn routes(&self) -> watch::Receiver<Option<Arc<ActiveRoute>>> {
        self.store.subscribe()
    }

    #[must_use]
    pub fn deviation_state(&self) -> DeviationState {
        self.monitor.state()
    }

    /// Plan a walk from the latest position to `destination`.
    ///
    /// Any pending challenge is cancelled and the deviation state is reset
    /// before the route is fetched. Choosing the destination of the active
    /// route again only resets; nothing is fetched. On failure the previous
    /// route, if any, stays installed.
    pub async fn select_destination(
        &mut self,
        destination: LatLon,
    ) -> Result<Arc<ActiveRoute>, SessionError> {
        let origin = self
            .position
            .or_else(|| self.positions.current_position())
            .ok_or(SessionError::NoPosition)?;

        self.coordinator.cancel();
        self.monitor.reset();
        self.publish();

        if let Ok(target) = destination.validate()
            && let Some(active) = self.store.current()
            && active.destination() == target
        {
            tracing::info!(generation = %active.generation, "Same destination; monitoring reset");
            return Ok(active);
        }

        let route = match self
            .routes
            .fetch_route(LatLon::from(origin.coordinate), destination)
            .await
        {
            Ok(route) => route,
            Err(e) => {
                tracing::warn!(error = %e, "Route request failed");
                return Err(e.into());
            }
        };

        self.cancel_scoring();
        let active = self.store.install(route);
        self.monitor.reset();
        self.last_reading = None;
        self.assessment = None;
        self.emit(SessionEvent::RouteInstalled {
            generation: active.generation,
            points: active.route.len(),
        });
        self.start_scoring(&active);
        self.publish();
        Ok(active)
    }

    /// Feed one position fix.
    pub fn on_position(&mut self, position: Position) -> Option<DeviationReading> {
        self.position = Some(position);
        let Some(active) = self.store.current() else {
            self.publish();
            return None;
        };

        let reading = self.monitor.evaluate(&active.route, &position);
        self.last_reading = reading;

        match reading.and_then(|r| r.transition) {
            Some(DeviationTransition::Deviated) => {
                let distance_m = reading.map_or(0.0, |r| r.min_distance_m);
                tracing::warn!(
                    distance_m,
                    threshold_m = self.monitor.threshold_meters(),
                    "Off route"
                );
                let challenge = self.coordinator.start(active.generation);
                self.monitor.begin_challenge(challenge.id);
                self.emit(SessionEvent::ChallengeStarted {
                    challenge,
                    distance_m,
                });
            }
            Some(DeviationTransition::Rejoined) => {
                tracing::info!("Back on route");
            }
            None => {}
        }

        self.publish();
        reading
    }

    /// Stop deviation checks until a new route is installed.
    pub fn override_monitoring(&mut self) -> Result<(), SessionError> {
        if self.store.current().is_none() {
            return Err(SessionError::NoRoute);
        }
        if let Some(pending) = self.monitor.override_monitoring() {
            tracing::info!(challenge = %pending, "Override cancels pending challenge");
        }
        self.coordinator.cancel();
        tracing::info!("Deviation monitoring overridden");
        self.emit(SessionEvent::MonitoringOverridden);
        self.publish();
        Ok(())
    }

    /// Set the password future challenges are checked against.
    pub async fn register_password(&self, password: Secret) -> Result<(), SessionError> {
        self.challenge_backend.set_password(&password).await?;
        tracing::info!("Challenge password registered");
        Ok(())
    }

    /// Store the emergency address. Failures are logged only.
    pub fn report_address(&self, address: String) {
        let addresses = Arc::clone(&self.addresses);
        tokio::spawn(async move {
            match addresses.update_address(&address).await {
                Ok(()) => tracing::info!("Address reported"),
                Err(e) => tracing::warn!(error = %e, "Address report failed"),
            }
        });
    }

    pub async fn fetch_address(&self) -> Result<Option<String>, SessionError> {
        Ok(self.addresses.get_address().await?)
    }

    /// Wait for the next challenge or scoring result and apply it.
    ///
    /// For embedders that drive the session themselves instead of calling
    /// [`run`](Self::run).
    pub async fn process_background(&mut self) {
        let background = self.next_background().await;
        self.handle_background(background);
    }

    /// Drive the session until `shutdown` fires, the command channel closes
    /// or the position stream ends.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        shutdown: CancellationToken,
    ) -> Result<(), SessionError> {
        if self.positions.permission() != LocationPermission::Granted {
            let permission = self.positions.request_permission();
            tracing::info!(?permission, "Requested location permission");
        }
        let mut subscription = match self.positions.subscribe() {
            Ok(subscription) => subscription,
            Err(e) => {
                let err = SessionError::from(e);
                self.emit_notice(&err);
                return Err(err);
            }
        };
        if let Some(position) = self.positions.current_position() {
            self.on_position(position);
        }

        tracing::info!("Safety monitor session running");
        let result = loop {
            tokio::select! {
                () = shutdown.cancelled() => break Ok(()),
                fix = subscription.recv() => {
                    let Some(position) = fix else {
                        if self.positions.permission() == LocationPermission::Granted {
                            tracing::warn!("Position stream ended");
                            break Ok(());
                        }
                        let err = SessionError::from(LocationError::PermissionDenied);
                        self.emit_notice(&err);
                        break Err(err);
                    };
                    self.on_position(position);
                }
                command = commands.recv() => {
                    let Some(command) = command else { break Ok(()) };
                    self.handle_command(command).await;
                }
                background = self.next_background() => self.handle_background(background),
            }
        };

        subscription.release();
        self.stop();
        tracing::info!("Safety monitor session stopped");
        result
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::SelectDestination(destination) => {
                if let Err(e) = self.select_destination(destination).await {
                    self.emit(SessionEvent::RouteFailed {
                        notice: e.notice().to_string(),
                    });
                }
            }
            SessionCommand::OverrideMonitoring => {
                if let Err(e) = self.override_monitoring() {
                    self.emit_notice(&e);
                }
            }
            SessionCommand::RegisterPassword(password) => {
                match self.register_password(password).await {
                    Ok(()) => self.emit(SessionEvent::PasswordRegistered),
                    Err(e) => {
                        tracing::warn!(error = %e, "Password registration failed");
                        self.emit_notice(&e);
                    }
                }
            }
            SessionCommand::ReportAddress(address) => self.report_address(address),
            SessionCommand::FetchAddress => match self.fetch_address().await {
                Ok(address) => self.emit(SessionEvent::AddressFetched { address }),
                Err(e) => {
                    tracing::warn!(error = %e, "Address fetch failed");
                    self.emit_notice(&e);
                }
            },
        }
    }

    async fn next_background(&mut self) -> Background {
        tokio::select! {
            Some(resolution) = self.resolutions.recv() => Background::Challenge(resolution),
            Some(scored) = self.assessments.recv() => Background::Assessment(scored),
            else => std::future::pending().await,
        }
    }

    fn handle_background(&mut self, background: Background) {
        match background {
            Background::Challenge(resolution) => self.apply_resolution(resolution),
            Background::Assessment(scored) => self.apply_assessment(scored),
        }
    }

    fn apply_resolution(&mut self, resolution: ChallengeResolution) {
        if !self.store.is_current(resolution.generation) {
            tracing::debug!(
                generation = %resolution.generation,
                "Discarding challenge outcome for superseded route"
            );
            return;
        }
        let Some(challenge) = self.coordinator.complete(resolution) else {
            return;
        };

        self.monitor
            .resolve_challenge(challenge.id, challenge.outcome, self.timeout_policy);
        let escalate = challenge.outcome == ChallengeOutcome::TimedOut
            && self.timeout_policy == TimeoutPolicy::Escalate;

        self.emit(SessionEvent::ChallengeResolved {
            challenge: challenge.clone(),
        });
        if escalate {
            tracing::warn!(challenge = %challenge.id, "No answer before the server timer; escalating");
            self.emit(SessionEvent::Escalated { challenge });
        }
        self.publish();
    }

    fn apply_assessment(&mut self, scored: ScoredRoute) {
        if !self.store.is_current(scored.generation) {
            tracing::debug!(
                generation = %scored.generation,
                "Discarding assessment for superseded route"
            );
            return;
        }
        self.scoring = None;
        match scored.result {
            Ok(assessment) => {
                self.assessment = Some(assessment.clone());
                self.emit(SessionEvent::AssessmentReady {
                    generation: scored.generation,
                    assessment,
                });
            }
            Err(e) => {
                let err = SessionError::from(e);
                tracing::warn!(error = %err, "Route assessment failed");
                self.emit(SessionEvent::AssessmentFailed {
                    generation: scored.generation,
                    notice: err.notice().to_string(),
                });
            }
        }
        self.publish();
    }

    fn start_scoring(&mut self, active: &Arc<ActiveRoute>) {
        self.cancel_scoring();
        let cancel = CancellationToken::new();
        self.scoring = Some(cancel.clone());

        let scorer = self.scorer.clone();
        let active = Arc::clone(active);
        let results = self.assessments_tx.clone();
        tokio::spawn(async move {
            let result = scorer.score_route(&active.route, &cancel).await;
            if matches!(result, Err(ScoreError::Cancelled)) {
                return;
            }
            let scored = ScoredRoute {
                generation: active.generation,
                result,
            };
            if results.send(scored).await.is_err() {
                tracing::debug!("Session gone; assessment dropped");
            }
        });
    }

    fn cancel_scoring(&mut self) {
        if let Some(cancel) = self.scoring.take() {
            cancel.cancel();
        }
    }

    fn stop(&mut self) {
        self.coordinator.cancel();
        self.cancel_scoring();
    }

    fn emit(&self, event: SessionEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(?event, "Event channel full; event dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn emit_notice(&self, err: &SessionError) {
        self.emit(SessionEvent::Notice {
            notice: err.notice().to_string(),
        });
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.snapshot());
    }
}

impl Drop for SafetyMonitorSession {
    fn drop(&mut self) {
        self.cancel_scoring();
    }
}

impl std::fmt::Debug for SafetyMonitorSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafetyMonitorSession")
            .field("generation", &self.store.generation())
            .field("deviation", &self.monitor.state())
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}
