//! Password prompt capability and the broker that connects it to a UI.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use safewalk_types::{ChallengeId, Secret};
use tokio::sync::oneshot;

/// Resolves to the submitted password, or `None` if the prompt was dismissed
/// or withdrawn.
pub type PromptFut = Pin<Box<dyn Future<Output = Option<Secret>> + Send + 'static>>;

/// Asks the person for their password.
pub trait PasswordPrompt: Send + Sync {
    /// Show a password request for `challenge`.
    ///
    /// The request is registered when this is called, before the returned
    /// future is first polled, so an answer can never arrive too early.
    fn request_password(&self, challenge: ChallengeId) -> PromptFut;

    /// The challenge resolved without an answer; take the request down.
    fn withdraw(&self, challenge: ChallengeId);
}

type Pending = HashMap<ChallengeId, oneshot::Sender<Option<Secret>>>;

/// In-process [`PasswordPrompt`]: the UI layer answers through
/// [`answer`](Self::answer) and [`dismiss`](Self::dismiss).
#[derive(Clone, Default)]
pub struct PromptBroker {
    pending: Arc<Mutex<Pending>>,
}

fn lock(pending: &Mutex<Pending>) -> MutexGuard<'_, Pending> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PromptBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit a password. Returns false if no such request is open.
    pub fn answer(&self, challenge: ChallengeId, password: Secret) -> bool {
        self.complete(challenge, Some(password))
    }

    /// Close the request without a password. The challenge fails.
    pub fn dismiss(&self, challenge: ChallengeId) -> bool {
        self.complete(challenge, None)
    }

    /// Open request, if any. At most one challenge is pending per session.
    #[must_use]
    pub fn open_request(&self) -> Option<ChallengeId> {
        lock(&self.pending).keys().min_by_key(|id| id.value()).copied()
    }

    #[must_use]
    pub fn is_open(&self, challenge: ChallengeId) -> bool {
        lock(&self.pending).contains_key(&challenge)
    }

    fn complete(&self, challenge: ChallengeId, answer: Option<Secret>) -> bool {
        let Some(tx) = lock(&self.pending).remove(&challenge) else {
            tracing::debug!(%challenge, "No open password request");
            return false;
        };
        tx.send(answer).is_ok()
    }
}

impl PasswordPrompt for PromptBroker {
    fn request_password(&self, challenge: ChallengeId) -> PromptFut {
        let (tx, rx) = oneshot::channel();
        if lock(&self.pending).insert(challenge, tx).is_some() {
            tracing::warn!(%challenge, "Password request replaced");
        }
        Box::pin(async move { rx.await.ok().flatten() })
    }

    fn withdraw(&self, challenge: ChallengeId) {
        if lock(&self.pending).remove(&challenge).is_some() {
            tracing::debug!(%challenge, "Password request withdrawn");
        }
    }
}

impl std::fmt::Debug for PromptBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptBroker")
            .field("open", &lock(&self.pending).len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{PasswordPrompt, PromptBroker};
    use safewalk_types::{ChallengeId, Secret};

    #[tokio::test]
    async fn answer_resolves_request() {
        let broker = PromptBroker::new();
        let id = ChallengeId::new(1);
        let request = broker.request_password(id);

        assert_eq!(broker.open_request(), Some(id));
        assert!(broker.answer(id, Secret::new("hunter2")));
        assert_eq!(request.await.unwrap().expose_secret(), "hunter2");
        assert!(broker.open_request().is_none());
    }

    #[tokio::test]
    async fn dismiss_and_withdraw_yield_none() {
        let broker = PromptBroker::new();

        let dismissed = broker.request_password(ChallengeId::new(1));
        assert!(broker.dismiss(ChallengeId::new(1)));
        assert!(dismissed.await.is_none());

        let withdrawn = broker.request_password(ChallengeId::new(2));
        broker.withdraw(ChallengeId::new(2));
        assert!(!broker.is_open(ChallengeId::new(2)));
        assert!(withdrawn.await.is_none());
    }

    #[test]
    fn answering_unknown_request_is_rejected() {
        let broker = PromptBroker::new();
        assert!(!broker.answer(ChallengeId::new(9), Secret::new("x")));
        assert!(!broker.dismiss(ChallengeId::new(9)));
    }

    #[test]
    fn answer_after_requester_gave_up_reports_false() {
        let broker = PromptBroker::new();
        let request = broker.request_password(ChallengeId::new(3));
        drop(request);
        assert!(!broker.answer(ChallengeId::new(3), Secret::new("late")));
    }
}
