//! The "are you OK" challenge.
//!
//! A challenge races two sides and takes the first answer:
//!
//! - **prompt**: wait for the person's password, then validate it remotely.
//!   Accepted is `Passed`; a rejection, a dismissed prompt or a transport
//!   failure is `Failed`.
//! - **server timer**: start the remote timer, wait the configured window,
//!   then poll the timer until it reports elapsed (`TimedOut`). If the timer
//!   cannot be started, or the poll budget runs out without an elapsed
//!   report, the challenge times out locally once the window plus the poll
//!   budget has passed.
//!
//! Both sides run inside one spawned task under a `select!`, so the loser is
//! dropped the moment the winner resolves. A cancelled challenge is aborted
//! as a whole and reports nothing.

use std::sync::Arc;

use chrono::Utc;
use futures_util::future::{AbortHandle, Abortable};
use safewalk_config::ChallengeSettings;
use safewalk_providers::{ChallengeBackend, PasswordVerdict};
use safewalk_types::{Challenge, ChallengeId, ChallengeOutcome, RouteGeneration};
use tokio::sync::mpsc;

use crate::prompt::{PasswordPrompt, PromptFut};

/// Outcome delivered back to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChallengeResolution {
    pub challenge: ChallengeId,
    pub generation: RouteGeneration,
    pub outcome: ChallengeOutcome,
}

#[derive(Debug)]
struct ActiveChallenge {
    challenge: Challenge,
    generation: RouteGeneration,
    abort: AbortHandle,
}

pub struct ChallengeCoordinator {
    backend: Arc<dyn ChallengeBackend>,
    prompt: Arc<dyn PasswordPrompt>,
    settings: ChallengeSettings,
    resolutions: mpsc::Sender<ChallengeResolution>,
    next_id: u64,
    active: Option<ActiveChallenge>,
}

impl ChallengeCoordinator {
    #[must_use]
    pub fn new(
        backend: Arc<dyn ChallengeBackend>,
        prompt: Arc<dyn PasswordPrompt>,
        settings: ChallengeSettings,
        resolutions: mpsc::Sender<ChallengeResolution>,
    ) -> Self {
        Self {
            backend,
            prompt,
            settings,
            resolutions,
            next_id: 0,
            active: None,
        }
    }

    #[must_use]
    pub fn settings(&self) -> ChallengeSettings {
        self.settings
    }

    /// The pending challenge, if any.
    #[must_use]
    pub fn active(&self) -> Option<&Challenge> {
        self.active.as_ref().map(|active| &active.challenge)
    }

    /// Start a challenge for the route at `generation`.
    ///
    /// Must be called from within a Tokio runtime. A challenge that is
    /// still pending is cancelled first.
    pub fn start(&mut self, generation: RouteGeneration) -> Challenge {
        if let Some(previous) = self.cancel() {
            tracing::warn!(%previous, "Replacing a pending challenge");
        }

        self.next_id += 1;
        let id = ChallengeId::new(self.next_id);
        let window = chrono::Duration::from_std(self.settings.timeout).unwrap_or_else(|e| {
            tracing::warn!(
                challenge = %id,
                timeout_secs = self.settings.timeout.as_secs(),
                error = %e,
                "Challenge timeout out of range; deadline set to start time"
            );
            chrono::Duration::zero()
        });
        let challenge = Challenge::start(id, Utc::now(), window);

        let answer = self.prompt.request_password(id);
        let (abort, registration) = AbortHandle::new_pair();
        let race = Abortable::new(
            race(
                id,
                answer,
                Arc::clone(&self.backend),
                Arc::clone(&self.prompt),
                self.settings,
            ),
            registration,
        );
        let resolutions = self.resolutions.clone();
        tokio::spawn(async move {
            let Ok(outcome) = race.await else {
                tracing::debug!(challenge = %id, "Challenge tasks cancelled");
                return;
            };
            let resolution = ChallengeResolution {
                challenge: id,
                generation,
                outcome,
            };
            if resolutions.send(resolution).await.is_err() {
                tracing::debug!(challenge = %id, "Session gone; resolution dropped");
            }
        });

        tracing::info!(
            challenge = %id,
            generation = %generation,
            timeout_secs = self.settings.timeout.as_secs(),
            "Challenge started"
        );
        self.active = Some(ActiveChallenge {
            challenge: challenge.clone(),
            generation,
            abort,
        });
        challenge
    }

    /// Cancel the pending challenge. Its tasks stop and it never resolves.
    pub fn cancel(&mut self) -> Option<ChallengeId> {
        let active = self.active.take()?;
        let id = active.challenge.id;
        active.abort.abort();
        self.prompt.withdraw(id);
        tracing::info!(challenge = %id, "Challenge cancelled");
        Some(id)
    }

    /// Record a resolution from the spawned race.
    ///
    /// Returns the resolved challenge, or `None` if the resolution belongs to
    /// a challenge that was cancelled or superseded.
    pub fn complete(&mut self, resolution: ChallengeResolution) -> Option<Challenge> {
        let current = self.active.as_ref().is_some_and(|active| {
            active.challenge.id == resolution.challenge && active.generation == resolution.generation
        });
        if !current {
            tracing::debug!(
                challenge = %resolution.challenge,
                generation = %resolution.generation,
                "Discarding stale challenge resolution"
            );
            return None;
        }

        let mut active = self.active.take()?;
        active.challenge.resolve(resolution.outcome);
        tracing::info!(
            challenge = %active.challenge.id,
            outcome = ?active.challenge.outcome,
            "Challenge resolved"
        );
        Some(active.challenge)
    }
}

impl Drop for ChallengeCoordinator {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.abort.abort();
            self.prompt.withdraw(active.challenge.id);
        }
    }
}

impl std::fmt::Debug for ChallengeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeCoordinator")
            .field("settings", &self.settings)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

async fn race(
    id: ChallengeId,
    answer: PromptFut,
    backend: Arc<dyn ChallengeBackend>,
    prompt: Arc<dyn PasswordPrompt>,
    settings: ChallengeSettings,
) -> ChallengeOutcome {
    tokio::select! {
        outcome = check_password(id, answer, backend.as_ref()) => outcome,
        outcome = wait_for_server_timer(id, backend.as_ref(), settings) => {
            prompt.withdraw(id);
            outcome
        }
    }
}

async fn check_password(
    id: ChallengeId,
    answer: PromptFut,
    backend: &dyn ChallengeBackend,
) -> ChallengeOutcome {
    let Some(password) = answer.await else {
        tracing::info!(challenge = %id, "Password prompt dismissed");
        return ChallengeOutcome::Failed;
    };

    match backend.validate_password(&password).await {
        Ok(PasswordVerdict::Accepted) => {
            tracing::info!(challenge = %id, "Password validated");
            ChallengeOutcome::Passed
        }
        Ok(PasswordVerdict::Rejected { message }) => {
            tracing::warn!(challenge = %id, %message, "Password rejected");
            ChallengeOutcome::Failed
        }
        Err(e) => {
            tracing::warn!(challenge = %id, error = %e, "Password validation failed");
            ChallengeOutcome::Failed
        }
    }
}

/// Always ends in `TimedOut`; only the time it takes depends on the server.
async fn wait_for_server_timer(
    id: ChallengeId,
    backend: &dyn ChallengeBackend,
    settings: ChallengeSettings,
) -> ChallengeOutcome {
    if let Err(e) = backend.start_timer().await {
        tracing::warn!(
            challenge = %id,
            error = %e,
            "Could not start server timer; timing out locally"
        );
        let budget = settings.timeout.saturating_add(poll_budget(settings));
        tokio::time::sleep(budget).await;
        return ChallengeOutcome::TimedOut;
    }

    tokio::time::sleep(settings.timeout).await;

    for poll in 1..=settings.max_polls {
        match backend.timer_elapsed().await {
            Ok(true) => {
                tracing::info!(challenge = %id, poll, "Server timer elapsed");
                return ChallengeOutcome::TimedOut;
            }
            Ok(false) => tracing::debug!(challenge = %id, poll, "Server timer still running"),
            Err(e) => tracing::warn!(challenge = %id, poll, error = %e, "Timer check failed"),
        }
        if poll < settings.max_polls {
            tokio::time::sleep(settings.poll_interval).await;
        }
    }

    tracing::warn!(
        challenge = %id,
        polls = settings.max_polls,
        "Server timer never reported elapsed; timing out locally"
    );
    ChallengeOutcome::TimedOut
}

/// Time spent polling after the window: `max_polls - 1` intervals.
fn poll_budget(settings: ChallengeSettings) -> std::time::Duration {
    settings
        .poll_interval
        .saturating_mul(settings.max_polls.saturating_sub(1))
}

#[cfg(test)]
mod tests {
    use super::{ChallengeCoordinator, ChallengeResolution};
    use crate::prompt::{PasswordPrompt, PromptBroker};
    use safewalk_config::ChallengeSettings;
    use safewalk_providers::{BackendError, ChallengeBackend, PasswordVerdict, ProviderFut};
    use safewalk_types::{ChallengeOutcome, RouteGeneration, Secret, TimeoutPolicy};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct FakeBackend {
        elapsed: AtomicBool,
        start_fails: bool,
        calls: Mutex<Vec<&'static str>>,
    }

    impl FakeBackend {
        fn record(&self, call: &'static str) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ChallengeBackend for FakeBackend {
        fn validate_password<'a>(
            &'a self,
            password: &'a Secret,
        ) -> ProviderFut<'a, PasswordVerdict, BackendError> {
            Box::pin(async move {
                self.record("valpasswd");
                match password.expose_secret() {
                    "correct" => Ok(PasswordVerdict::Accepted),
                    "offline" => Err(BackendError::Transport {
                        endpoint: "valpasswd",
                        message: "connection reset".to_string(),
                    }),
                    _ => Ok(PasswordVerdict::Rejected {
                        message: "Invalid password".to_string(),
                    }),
                }
            })
        }

        fn set_password<'a>(&'a self, _password: &'a Secret) -> ProviderFut<'a, (), BackendError> {
            Box::pin(async move {
                self.record("setpasswd");
                Ok(())
            })
        }

        fn start_timer(&self) -> ProviderFut<'_, (), BackendError> {
            Box::pin(async move {
                self.record("timeout_start");
                if self.start_fails {
                    return Err(BackendError::Status {
                        endpoint: "timeout_start",
                        status: 500,
                        body: String::new(),
                    });
                }
                Ok(())
            })
        }

        fn timer_elapsed(&self) -> ProviderFut<'_, bool, BackendError> {
            Box::pin(async move {
                self.record("timeout_check");
                Ok(self.elapsed.load(Ordering::SeqCst))
            })
        }
    }

    fn settings() -> ChallengeSettings {
        ChallengeSettings {
            timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(2),
            max_polls: 3,
            timeout_policy: TimeoutPolicy::TreatAsPassed,
        }
    }

    fn coordinator(
        backend: &Arc<FakeBackend>,
        broker: &PromptBroker,
    ) -> (ChallengeCoordinator, mpsc::Receiver<ChallengeResolution>) {
        let (tx, rx) = mpsc::channel(4);
        let backend: Arc<dyn ChallengeBackend> = backend.clone();
        let prompt: Arc<dyn PasswordPrompt> = Arc::new(broker.clone());
        (ChallengeCoordinator::new(backend, prompt, settings(), tx), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn correct_password_passes_and_stops_timer_checks() {
        let backend = Arc::new(FakeBackend::default());
        let broker = PromptBroker::new();
        let (mut coordinator, mut rx) = coordinator(&backend, &broker);
        let generation = RouteGeneration::new(1);

        let challenge = coordinator.start(generation);
        assert!(broker.is_open(challenge.id));
        assert!(broker.answer(challenge.id, Secret::new("correct")));

        let resolution = rx.recv().await.unwrap();
        assert_eq!(resolution.outcome, ChallengeOutcome::Passed);
        let resolved = coordinator.complete(resolution).unwrap();
        assert_eq!(resolved.outcome, ChallengeOutcome::Passed);
        assert!(coordinator.active().is_none());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!backend.calls().contains(&"timeout_check"));
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_password_fails() {
        let backend = Arc::new(FakeBackend::default());
        let broker = PromptBroker::new();
        let (mut coordinator, mut rx) = coordinator(&backend, &broker);

        let challenge = coordinator.start(RouteGeneration::new(1));
        broker.answer(challenge.id, Secret::new("wrong"));
        assert_eq!(rx.recv().await.unwrap().outcome, ChallengeOutcome::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn validation_transport_error_fails() {
        let backend = Arc::new(FakeBackend::default());
        let broker = PromptBroker::new();
        let (mut coordinator, mut rx) = coordinator(&backend, &broker);

        let challenge = coordinator.start(RouteGeneration::new(1));
        broker.answer(challenge.id, Secret::new("offline"));
        assert_eq!(rx.recv().await.unwrap().outcome, ChallengeOutcome::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn dismissed_prompt_fails() {
        let backend = Arc::new(FakeBackend::default());
        let broker = PromptBroker::new();
        let (mut coordinator, mut rx) = coordinator(&backend, &broker);

        let challenge = coordinator.start(RouteGeneration::new(1));
        broker.dismiss(challenge.id);
        assert_eq!(rx.recv().await.unwrap().outcome, ChallengeOutcome::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_server_timer_times_out_and_withdraws_prompt() {
        let backend = Arc::new(FakeBackend {
            elapsed: AtomicBool::new(true),
            ..FakeBackend::default()
        });
        let broker = PromptBroker::new();
        let (mut coordinator, mut rx) = coordinator(&backend, &broker);

        let challenge = coordinator.start(RouteGeneration::new(1));
        let resolution = rx.recv().await.unwrap();

        assert_eq!(resolution.outcome, ChallengeOutcome::TimedOut);
        assert!(!broker.is_open(challenge.id));
        assert_eq!(backend.calls(), vec!["timeout_start", "timeout_check"]);

        // The prompt lost; a late answer goes nowhere.
        assert!(!broker.answer(challenge.id, Secret::new("correct")));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_poll_budget_times_out_locally() {
        let backend = Arc::new(FakeBackend::default());
        let broker = PromptBroker::new();
        let (mut coordinator, mut rx) = coordinator(&backend, &broker);

        let started = tokio::time::Instant::now();
        let challenge = coordinator.start(RouteGeneration::new(1));
        let resolution = rx.recv().await.unwrap();

        // 10 s window, then checks at 10, 12 and 14 s.
        assert_eq!(resolution.outcome, ChallengeOutcome::TimedOut);
        assert_eq!(started.elapsed(), Duration::from_secs(14));
        let checks = backend
            .calls()
            .iter()
            .filter(|call| **call == "timeout_check")
            .count();
        assert_eq!(checks, 3);
        assert!(!broker.is_open(challenge.id));
    }

    #[tokio::test(start_paused = true)]
    async fn prompt_still_wins_while_polls_report_running() {
        let backend = Arc::new(FakeBackend::default());
        let broker = PromptBroker::new();
        let (mut coordinator, mut rx) = coordinator(&backend, &broker);

        let challenge = coordinator.start(RouteGeneration::new(1));
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(rx.try_recv().is_err());

        broker.answer(challenge.id, Secret::new("correct"));
        assert_eq!(rx.recv().await.unwrap().outcome, ChallengeOutcome::Passed);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_start_failure_times_out_locally() {
        let backend = Arc::new(FakeBackend {
            elapsed: AtomicBool::new(true),
            start_fails: true,
            ..FakeBackend::default()
        });
        let broker = PromptBroker::new();
        let (mut coordinator, mut rx) = coordinator(&backend, &broker);

        let started = tokio::time::Instant::now();
        let challenge = coordinator.start(RouteGeneration::new(1));
        let resolution = rx.recv().await.unwrap();

        assert_eq!(resolution.outcome, ChallengeOutcome::TimedOut);
        assert_eq!(started.elapsed(), Duration::from_secs(14));
        assert_eq!(backend.calls(), vec!["timeout_start"]);
        assert!(!broker.is_open(challenge.id));
    }

    #[tokio::test(start_paused = true)]
    async fn timer_start_failure_still_accepts_an_answer() {
        let backend = Arc::new(FakeBackend {
            start_fails: true,
            ..FakeBackend::default()
        });
        let broker = PromptBroker::new();
        let (mut coordinator, mut rx) = coordinator(&backend, &broker);

        let challenge = coordinator.start(RouteGeneration::new(1));
        tokio::time::sleep(Duration::from_secs(5)).await;
        broker.answer(challenge.id, Secret::new("wrong"));
        assert_eq!(rx.recv().await.unwrap().outcome, ChallengeOutcome::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_coordinator_withdraws_the_prompt() {
        let backend = Arc::new(FakeBackend::default());
        let broker = PromptBroker::new();
        let (mut coordinator, mut rx) = coordinator(&backend, &broker);

        let challenge = coordinator.start(RouteGeneration::new(1));
        assert_eq!(broker.open_request(), Some(challenge.id));

        drop(coordinator);
        assert!(broker.open_request().is_none());
        assert!(!broker.answer(challenge.id, Secret::new("correct")));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_challenge_never_resolves() {
        let backend = Arc::new(FakeBackend {
            elapsed: AtomicBool::new(true),
            ..FakeBackend::default()
        });
        let broker = PromptBroker::new();
        let (mut coordinator, mut rx) = coordinator(&backend, &broker);

        let challenge = coordinator.start(RouteGeneration::new(1));
        assert_eq!(coordinator.cancel(), Some(challenge.id));
        assert!(!broker.is_open(challenge.id));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
        assert!(coordinator.cancel().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_resolution_is_discarded() {
        let backend = Arc::new(FakeBackend::default());
        let broker = PromptBroker::new();
        let (mut coordinator, _rx) = coordinator(&backend, &broker);

        let first = coordinator.start(RouteGeneration::new(1));
        let second = coordinator.start(RouteGeneration::new(2));
        assert_ne!(first.id, second.id);

        let stale = ChallengeResolution {
            challenge: first.id,
            generation: RouteGeneration::new(1),
            outcome: ChallengeOutcome::Passed,
        };
        assert!(coordinator.complete(stale).is_none());
        assert_eq!(coordinator.active().unwrap().id, second.id);
    }
}
