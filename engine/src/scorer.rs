//! Route safety scoring.
//!
//! A route is rated by sampling up to `max_samples` vertices evenly by index
//! and asking the classifier about each. One failed call fails the whole
//! assessment; there is no partial result.

use std::sync::Arc;

use futures_util::future::try_join_all;
use safewalk_config::ScorerSettings;
use safewalk_providers::{BackendError, PredictionClient};
use safewalk_types::{Coordinate, Route, SafetyAssessment};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("safety prediction unavailable for route point {index}: {source}")]
    PredictionUnavailable {
        index: usize,
        #[source]
        source: BackendError,
    },
    #[error("route scoring was cancelled")]
    Cancelled,
}

/// Route indices to sample: every point for short routes, otherwise
/// `i * len / max_samples` for `i` in `0..max_samples`.
#[must_use]
pub fn sample_indices(len: usize, max_samples: usize) -> Vec<usize> {
    if len <= max_samples {
        return (0..len).collect();
    }
    (0..max_samples).map(|i| i * len / max_samples).collect()
}

#[derive(Clone)]
pub struct RouteSafetyScorer {
    client: Arc<dyn PredictionClient>,
    settings: ScorerSettings,
}

impl RouteSafetyScorer {
    #[must_use]
    pub fn new(client: Arc<dyn PredictionClient>, settings: ScorerSettings) -> Self {
        Self { client, settings }
    }

    #[must_use]
    pub fn max_samples(&self) -> usize {
        self.settings.max_samples
    }

    /// Score `route`. Predictions for all samples run concurrently; the
    /// first failure drops the rest.
    pub async fn score_route(
        &self,
        route: &Route,
        cancel: &CancellationToken,
    ) -> Result<SafetyAssessment, ScoreError> {
        let indices = sample_indices(route.len(), self.settings.max_samples);
        let points: Vec<Coordinate> = indices
            .iter()
            .filter_map(|&index| route.points().get(index).copied())
            .collect();

        tracing::info!(samples = indices.len(), points = route.len(), "Scoring route");

        let client = self.client.as_ref();
        let calls = indices.iter().zip(&points).map(|(&index, &point)| async move {
            client
                .rate(point)
                .await
                .map_err(|source| ScoreError::PredictionUnavailable { index, source })
        });

        let ratings = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::debug!("Route scoring cancelled");
                return Err(ScoreError::Cancelled);
            }
            ratings = try_join_all(calls) => ratings?,
        };

        let assessment = SafetyAssessment::new(indices, points, ratings);
        tracing::info!(
            aggregate = assessment.aggregate_rating.label(),
            "Route scored"
        );
        Ok(assessment)
    }
}

impl std::fmt::Debug for RouteSafetyScorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteSafetyScorer")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::{RouteSafetyScorer, ScoreError, sample_indices};
    use chrono::Utc;
    use safewalk_config::ScorerSettings;
    use safewalk_providers::{BackendError, PredictionClient, ProviderFut};
    use safewalk_types::{Coordinate, Rating, Route};
    use std::sync::{Arc, Mutex};
    use tokio_util::sync::CancellationToken;

    /// Rates by latitude: the integer part picks the label.
    #[derive(Default)]
    struct LatitudeClassifier {
        seen: Mutex<Vec<f64>>,
        fail_at: Option<f64>,
    }

    impl PredictionClient for LatitudeClassifier {
        fn rate(&self, point: Coordinate) -> ProviderFut<'_, Rating, BackendError> {
            Box::pin(async move {
                self.seen.lock().unwrap().push(point.latitude());
                if self.fail_at == Some(point.latitude()) {
                    return Err(BackendError::Status {
                        endpoint: "predict",
                        status: 503,
                        body: "down".to_string(),
                    });
                }
                Ok(match point.latitude() as i64 % 3 {
                    0 => Rating::Safe,
                    1 => Rating::ExtremelySafe,
                    _ => Rating::Unsafe,
                })
            })
        }
    }

    fn route_with(latitudes: &[f64]) -> Route {
        let points: Vec<Coordinate> = latitudes
            .iter()
            .map(|&lat| Coordinate::new(lat, 0.0).unwrap())
            .collect();
        let first = points[0];
        let last = points[points.len() - 1];
        Route::new(points, first, last, Utc::now()).unwrap()
    }

    fn scorer(client: &Arc<LatitudeClassifier>, max_samples: usize) -> RouteSafetyScorer {
        let client: Arc<dyn PredictionClient> = client.clone();
        RouteSafetyScorer::new(client, ScorerSettings { max_samples })
    }

    #[test]
    fn sampling_is_even_by_index() {
        assert_eq!(sample_indices(10, 5), vec![0, 2, 4, 6, 8]);
        assert_eq!(sample_indices(7, 3), vec![0, 2, 4]);
        assert_eq!(sample_indices(3, 5), vec![0, 1, 2]);
        assert_eq!(sample_indices(5, 5), vec![0, 1, 2, 3, 4]);
        assert_eq!(sample_indices(1, 5), vec![0]);
    }

    #[tokio::test]
    async fn ten_points_five_samples() {
        let client = Arc::new(LatitudeClassifier::default());
        let latitudes: Vec<f64> = (0..10).map(f64::from).collect();
        let route = route_with(&latitudes);

        let assessment = scorer(&client, 5)
            .score_route(&route, &CancellationToken::new())
            .await
            .unwrap();

        let mut seen = client.seen.lock().unwrap().clone();
        seen.sort_by(f64::total_cmp);
        assert_eq!(seen, vec![0.0, 2.0, 4.0, 6.0, 8.0]);
        assert_eq!(assessment.sampled_indices, vec![0, 2, 4, 6, 8]);
        assert_eq!(assessment.sampled_points[1].latitude(), 2.0);
        // 0 Safe, 2 Unsafe, 4 ExtremelySafe, 6 Safe, 8 Unsafe
        assert_eq!(
            assessment.per_point_rating,
            vec![
                Rating::Safe,
                Rating::Unsafe,
                Rating::ExtremelySafe,
                Rating::Safe,
                Rating::Unsafe
            ]
        );
        assert_eq!(assessment.aggregate_rating, Rating::Unsafe);
    }

    #[tokio::test]
    async fn short_route_samples_every_point() {
        let client = Arc::new(LatitudeClassifier::default());
        let route = route_with(&[0.0, 1.0]);

        let assessment = scorer(&client, 5)
            .score_route(&route, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(assessment.sampled_indices, vec![0, 1]);
        assert_eq!(assessment.aggregate_rating, Rating::ExtremelySafe);
    }

    #[tokio::test]
    async fn one_failure_fails_the_batch() {
        let client = Arc::new(LatitudeClassifier {
            fail_at: Some(4.0),
            ..LatitudeClassifier::default()
        });
        let latitudes: Vec<f64> = (0..10).map(f64::from).collect();
        let route = route_with(&latitudes);

        let err = scorer(&client, 5)
            .score_route(&route, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ScoreError::PredictionUnavailable { index: 4, .. }));
    }

    #[tokio::test]
    async fn cancelled_batch_reports_cancelled() {
        let client = Arc::new(LatitudeClassifier::default());
        let route = route_with(&[0.0, 1.0, 2.0]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = scorer(&client, 5)
            .score_route(&route, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ScoreError::Cancelled));
    }
}
