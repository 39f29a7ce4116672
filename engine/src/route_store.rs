//! Holder of the active route.
//!
//! Readers take an `Arc` snapshot; installing a route swaps the whole value,
//! so an evaluation never sees a half-replaced point sequence.

use std::sync::Arc;

use safewalk_types::{Coordinate, Route, RouteGeneration};
use serde::Serialize;
use tokio::sync::watch;

/// A route as installed, stamped with its generation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveRoute {
    pub generation: RouteGeneration,
    pub route: Route,
}

impl ActiveRoute {
    #[must_use]
    pub fn destination(&self) -> Coordinate {
        self.route.destination()
    }
}

/// Single-writer store. Only the session holds it mutably.
#[derive(Debug)]
pub struct RouteStore {
    tx: watch::Sender<Option<Arc<ActiveRoute>>>,
    generation: RouteGeneration,
}

impl Default for RouteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteStore {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            tx,
            generation: RouteGeneration::new(0),
        }
    }

    /// Replace the active route. Returns the installed snapshot.
    pub fn install(&mut self, route: Route) -> Arc<ActiveRoute> {
        self.generation = self.generation.next();
        let active = Arc::new(ActiveRoute {
            generation: self.generation,
            route,
        });
        self.tx.send_replace(Some(Arc::clone(&active)));
        tracing::info!(
            generation = %active.generation,
            points = active.route.len(),
            destination = %active.destination(),
            "Route installed"
        );
        active
    }

    #[must_use]
    pub fn current(&self) -> Option<Arc<ActiveRoute>> {
        self.tx.borrow().clone()
    }

    /// Generation of the most recently installed route (0 before any).
    #[must_use]
    pub fn generation(&self) -> RouteGeneration {
        self.generation
    }

    #[must_use]
    pub fn is_current(&self, generation: RouteGeneration) -> bool {
        self.current()
            .is_some_and(|active| active.generation == generation)
    }

    /// Watch route replacements.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<ActiveRoute>>> {
        self.tx.subscribe()
    }
}
