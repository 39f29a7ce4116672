//! Walking directions from OpenRouteService.
//!
//! `GET {base}?api_key=..&start=lon,lat&end=lon,lat` returns a GeoJSON
//! feature collection; the route polyline is
//! `features[0].geometry.coordinates` as `[longitude, latitude]` pairs.

use chrono::Utc;
use safewalk_types::{Coordinate, CoordinateError, LatLon, Route, Secret};
use serde::Deserialize;
use thiserror::Error;

use crate::{OPENROUTESERVICE_WALKING_URL, ProviderFut, read_capped_error_body};

#[derive(Debug, Error)]
pub enum RouteError {
    /// Caller error; no request was made.
    #[error("invalid coordinates for route: {0}")]
    InvalidCoordinates(#[from] CoordinateError),
    /// The provider answered but returned no usable geometry.
    #[error("route not found: {reason}")]
    RouteNotFound { reason: String },
    #[error("failed to fetch route: {message}")]
    RouteFetchFailed { message: String },
}

/// Source of walking routes.
pub trait RouteProvider: Send + Sync {
    /// Fetch a route from `origin` to `destination`.
    ///
    /// Implementations must validate both points before any IO and must not
    /// retry.
    fn fetch_route(&self, origin: LatLon, destination: LatLon) -> ProviderFut<'_, Route, RouteError>;
}

#[derive(Debug, Deserialize)]
struct DirectionsResponse {
    #[serde(default)]
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    geometry: Option<Geometry>,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    #[serde(default)]
    coordinates: Vec<Vec<f64>>,
}

/// Extract the route polyline, reversing `[lon, lat]` into [`Coordinate`]s.
fn parse_geometry(body: &str) -> Result<Vec<Coordinate>, RouteError> {
    let response: DirectionsResponse =
        serde_json::from_str(body).map_err(|e| RouteError::RouteNotFound {
            reason: format!("unparseable directions response: {e}"),
        })?;

    let geometry = response
        .features
        .into_iter()
        .next()
        .and_then(|feature| feature.geometry)
        .ok_or_else(|| RouteError::RouteNotFound {
            reason: "response has no route geometry".to_string(),
        })?;

    let mut points = Vec::with_capacity(geometry.coordinates.len());
    for (index, pair) in geometry.coordinates.iter().enumerate() {
        // Third element, when present, is elevation.
        let &[lon, lat, ..] = pair.as_slice() else {
            return Err(RouteError::RouteNotFound {
                reason: format!("vertex {index} is not a [lon, lat] pair"),
            });
        };
        let point = Coordinate::from_lon_lat([lon, lat]).map_err(|e| RouteError::RouteNotFound {
            reason: format!("vertex {index}: {e}"),
        })?;
        points.push(point);
    }

    if points.is_empty() {
        return Err(RouteError::RouteNotFound {
            reason: "route geometry is empty".to_string(),
        });
    }
    Ok(points)
}

/// OpenRouteService directions client.
#[derive(Debug, Clone)]
pub struct OpenRouteServiceClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Secret,
}

impl OpenRouteServiceClient {
    #[must_use]
    pub fn new(http: reqwest::Client, api_key: Secret) -> Self {
        Self::with_base_url(http, OPENROUTESERVICE_WALKING_URL, api_key)
    }

    #[must_use]
    pub fn with_base_url(http: reqwest::Client, base_url: impl Into<String>, api_key: Secret) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key,
        }
    }

    async fn fetch(&self, origin: LatLon, destination: LatLon) -> Result<Route, RouteError> {
        let origin = origin.validate()?;
        let destination = destination.validate()?;

        tracing::info!(%origin, %destination, "Fetching walking route");

        let url = reqwest::Url::parse_with_params(
            &self.base_url,
            &[
                ("api_key", self.api_key.expose_secret().to_string()),
                ("start", origin.lon_lat_param()),
                ("end", destination.lon_lat_param()),
            ],
        )
        .map_err(|e| RouteError::RouteFetchFailed {
            message: format!("invalid directions URL {}: {e}", self.base_url),
        })?;

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| RouteError::RouteFetchFailed {
                message: e.without_url().to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = read_capped_error_body(response).await;
            tracing::warn!(%status, "Directions provider returned an error");
            return Err(RouteError::RouteFetchFailed {
                message: format!("directions API error {status}: {body}"),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| RouteError::RouteFetchFailed {
                message: e.without_url().to_string(),
            })?;

        let points = parse_geometry(&body)?;
        tracing::info!(points = points.len(), "Route fetched");

        Route::new(points, origin, destination, Utc::now()).map_err(|e| RouteError::RouteNotFound {
            reason: e.to_string(),
        })
    }
}

impl RouteProvider for OpenRouteServiceClient {
    fn fetch_route(&self, origin: LatLon, destination: LatLon) -> ProviderFut<'_, Route, RouteError> {
        Box::pin(self.fetch(origin, destination))
    }
}

#[cfg(test)]
mod tests {
    use super::{OpenRouteServiceClient, RouteError, RouteProvider, parse_geometry};
    use safewalk_types::{LatLon, Secret};
    use serde_json::json;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> OpenRouteServiceClient {
        OpenRouteServiceClient::with_base_url(
            reqwest::Client::new(),
            format!("{}/v2/directions/foot-walking", server.uri()),
            Secret::new("test-key"),
        )
    }

    #[test]
    fn geometry_is_reversed_to_lat_lon() {
        let body = json!({
            "features": [{
                "geometry": { "coordinates": [[-122.42, 37.77], [-122.41, 37.78, 12.5]] }
            }]
        })
        .to_string();

        let points = parse_geometry(&body).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].latitude(), 37.77);
        assert_eq!(points[0].longitude(), -122.42);
        assert_eq!(points[1].latitude(), 37.78);
    }

    #[test]
    fn missing_or_empty_geometry_is_route_not_found() {
        for body in [
            json!({}).to_string(),
            json!({ "features": [] }).to_string(),
            json!({ "features": [{ "geometry": { "coordinates": [] } }] }).to_string(),
            json!({ "features": [{ "geometry": { "coordinates": [[1.0]] } }] }).to_string(),
            "not json".to_string(),
        ] {
            assert!(
                matches!(parse_geometry(&body), Err(RouteError::RouteNotFound { .. })),
                "body: {body}"
            );
        }
    }

    #[tokio::test]
    async fn out_of_range_start_fails_without_network_call() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let result = client(&server)
            .fetch_route(LatLon::new(91.0, 0.0), LatLon::new(0.0, 0.0))
            .await;

        assert!(matches!(result, Err(RouteError::InvalidCoordinates(_))));
        server.verify().await;
    }

    #[tokio::test]
    async fn sends_lon_lat_query_and_parses_route() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("api_key", "test-key"))
            .and(query_param("start", "-122.42,37.77"))
            .and(query_param("end", "-122.4,37.79"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "features": [{
                    "geometry": { "coordinates": [[-122.42, 37.77], [-122.41, 37.78], [-122.4, 37.79]] }
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let route = client(&server)
            .fetch_route(LatLon::new(37.77, -122.42), LatLon::new(37.79, -122.4))
            .await
            .unwrap();

        assert_eq!(route.len(), 3);
        assert_eq!(route.destination().latitude(), 37.79);
        assert_eq!(route.points()[2].longitude(), -122.4);
    }

    #[tokio::test]
    async fn http_error_is_fetch_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let err = client(&server)
            .fetch_route(LatLon::new(0.0, 0.0), LatLon::new(0.01, 0.01))
            .await
            .unwrap_err();

        match err {
            RouteError::RouteFetchFailed { message } => assert!(message.contains("maintenance")),
            other => panic!("expected RouteFetchFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_host_is_fetch_failure() {
        let client = OpenRouteServiceClient::with_base_url(
            reqwest::Client::new(),
            "http://127.0.0.1:9/directions",
            Secret::new("k"),
        );
        let err = client
            .fetch_route(LatLon::new(0.0, 0.0), LatLon::new(0.01, 0.01))
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::RouteFetchFailed { .. }));
    }
}
