//! Device location stream.
//!
//! A pure transport: positions arrive in platform order and are handed to
//! subscribers as-is. Permission gating is the only decision made here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use safewalk_types::Position;
use thiserror::Error;
use tokio::sync::mpsc;

/// Per-subscriber buffer. A subscriber this far behind misses fixes.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocationPermission {
    #[default]
    Undetermined,
    Granted,
    Denied,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocationError {
    /// Terminal until the person grants access again.
    #[error("location permission was not granted")]
    PermissionDenied,
}

/// Continuous position stream from the device.
pub trait PositionSource: Send + Sync {
    fn permission(&self) -> LocationPermission;

    /// Ask the platform for access. Returns the resulting permission.
    fn request_permission(&self) -> LocationPermission;

    /// Start receiving fixes. Fails if permission has not been granted.
    fn subscribe(&self) -> Result<PositionSubscription, LocationError>;

    /// Most recent fix seen by the source, if any.
    fn current_position(&self) -> Option<Position>;
}

type Releaser = Box<dyn FnOnce() + Send>;
type PermissionPrompt = Arc<dyn Fn() -> LocationPermission + Send + Sync>;

/// Live subscription handle. Dropping it releases the subscription.
pub struct PositionSubscription {
    rx: mpsc::Receiver<Position>,
    releaser: Option<Releaser>,
}

impl PositionSubscription {
    pub fn new(rx: mpsc::Receiver<Position>, releaser: impl FnOnce() + Send + 'static) -> Self {
        Self {
            rx,
            releaser: Some(Box::new(releaser)),
        }
    }

    /// Next fix, or `None` once released or the source is gone.
    pub async fn recv(&mut self) -> Option<Position> {
        if self.releaser.is_none() {
            return None;
        }
        self.rx.recv().await
    }

    /// Stop delivery. Calling it again is a no-op.
    pub fn release(&mut self) {
        if let Some(release) = self.releaser.take() {
            release();
            self.rx.close();
        }
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.releaser.is_none()
    }
}

impl Drop for PositionSubscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for PositionSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionSubscription")
            .field("released", &self.is_released())
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct SourceState {
    permission: LocationPermission,
    subscribers: HashMap<u64, mpsc::Sender<Position>>,
    next_id: u64,
    last: Option<Position>,
}

/// In-process position source fed by platform glue.
///
/// The platform layer calls [`set_permission`](Self::set_permission) after
/// the OS prompt and [`publish`](Self::publish) for every fix. A prompt
/// installed with [`with_permission_prompt`](Self::with_permission_prompt)
/// answers [`PositionSource::request_permission`].
#[derive(Clone, Default)]
pub struct ChannelPositionSource {
    state: Arc<Mutex<SourceState>>,
    prompt: Option<PermissionPrompt>,
}

fn lock(state: &Mutex<SourceState>) -> MutexGuard<'_, SourceState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ChannelPositionSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_permission(permission: LocationPermission) -> Self {
        let source = Self::new();
        source.set_permission(permission);
        source
    }

    #[must_use]
    pub fn with_permission_prompt(
        prompt: impl Fn() -> LocationPermission + Send + Sync + 'static,
    ) -> Self {
        Self {
            state: Arc::default(),
            prompt: Some(Arc::new(prompt)),
        }
    }

    /// Record the outcome of the OS permission prompt.
    ///
    /// Revoking permission drops every live subscriber.
    pub fn set_permission(&self, permission: LocationPermission) {
        let mut state = lock(&self.state);
        state.permission = permission;
        if permission != LocationPermission::Granted {
            let dropped = state.subscribers.len();
            state.subscribers.clear();
            if dropped > 0 {
                tracing::warn!(dropped, "Location permission revoked; subscribers closed");
            }
        }
    }

    /// Deliver a fix to every live subscriber. Returns how many received it.
    pub fn publish(&self, position: Position) -> usize {
        let mut state = lock(&self.state);
        state.last = Some(position);

        let mut delivered = 0;
        state.subscribers.retain(|id, tx| match tx.try_send(position) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(subscriber = id, "Position subscriber lagging; fix dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        delivered
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        lock(&self.state).subscribers.len()
    }
}

impl PositionSource for ChannelPositionSource {
    fn permission(&self) -> LocationPermission {
        lock(&self.state).permission
    }

    fn request_permission(&self) -> LocationPermission {
        let current = self.permission();
        if current == LocationPermission::Granted {
            return current;
        }
        let Some(prompt) = &self.prompt else {
            return current;
        };
        let answer = prompt();
        tracing::info!(?answer, "Location permission requested");
        self.set_permission(answer);
        answer
    }

    fn subscribe(&self) -> Result<PositionSubscription, LocationError> {
        let mut state = lock(&self.state);
        if state.permission != LocationPermission::Granted {
            return Err(LocationError::PermissionDenied);
        }

        let id = state.next_id;
        state.next_id += 1;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        state.subscribers.insert(id, tx);
        drop(state);

        tracing::debug!(subscriber = id, "Position subscription opened");
        let registry = Arc::downgrade(&self.state);
        Ok(PositionSubscription::new(rx, move || {
            if let Some(state) = registry.upgrade() {
                lock(&state).subscribers.remove(&id);
                tracing::debug!(subscriber = id, "Position subscription released");
            }
        }))
    }

    fn current_position(&self) -> Option<Position> {
        lock(&self.state).last
    }
}
