//! Capability interfaces for the outside world, with production implementations.
//!
//! # Architecture
//!
//! Every external dependency of the monitoring core sits behind a trait so it
//! can be replaced by a test double:
//!
//! | Trait | Production implementation | Contract |
//! |-------|---------------------------|----------|
//! | [`PositionSource`] | [`ChannelPositionSource`] | Push stream of fixes, gated by permission |
//! | [`RouteProvider`] | [`OpenRouteServiceClient`] | Walking route between two points |
//! | [`PredictionClient`] | [`BackendClient`] | Safety rating for one coordinate |
//! | [`ChallengeBackend`] | [`BackendClient`] | Password validation and the server-side timer |
//! | [`AddressBook`] | [`BackendClient`] | Emergency address storage |
//!
//! Async trait methods return a boxed [`ProviderFut`] so the traits stay
//! object-safe and can be shared as `Arc<dyn Trait>`.
//!
//! # Error Handling
//!
//! Nothing in this crate retries. Transport and provider failures are returned
//! to the caller unchanged; the session decides what to surface.

pub mod backend;
pub mod directions;
pub mod location;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

pub use backend::{
    AddressBook, BackendClient, BackendError, ChallengeBackend, PasswordVerdict, PredictionClient,
};
pub use directions::{OpenRouteServiceClient, RouteError, RouteProvider};
pub use location::{
    ChannelPositionSource, LocationError, LocationPermission, PositionSource, PositionSubscription,
};

pub use safewalk_types;

/// Boxed future returned by capability trait methods.
pub type ProviderFut<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Canonical OpenRouteService foot-walking directions endpoint.
pub const OPENROUTESERVICE_WALKING_URL: &str =
    "https://api.openrouteservice.org/v2/directions/foot-walking";

const CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;

// Mobile links drop idle connections aggressively.
const TCP_KEEPALIVE_SECS: u64 = 60;

const POOL_MAX_IDLE_PER_HOST: usize = 8;
const POOL_IDLE_TIMEOUT_SECS: u64 = 90;

const MAX_ERROR_BODY_BYTES: usize = 32 * 1024;

/// Transport settings shared by every HTTP-backed provider.
#[derive(Debug, Clone, Copy)]
pub struct HttpOptions {
    pub request_timeout: Duration,
    /// Permit plain `http://` endpoints (local development, tests).
    pub allow_insecure_http: bool,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            allow_insecure_http: false,
        }
    }
}

fn base_client_builder(options: HttpOptions) -> reqwest::ClientBuilder {
    use reqwest::header::{HeaderMap, HeaderValue};

    let mut default_headers = HeaderMap::new();
    default_headers.insert(
        reqwest::header::USER_AGENT,
        HeaderValue::from_static(concat!("safewalk/", env!("CARGO_PKG_VERSION"))),
    );

    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .timeout(options.request_timeout)
        .redirect(reqwest::redirect::Policy::none())
        .https_only(!options.allow_insecure_http)
        .tcp_keepalive(Some(Duration::from_secs(TCP_KEEPALIVE_SECS)))
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(Some(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS)))
        .default_headers(default_headers)
}

/// Build the pooled client shared by the directions and backend clients.
pub fn http_client(options: HttpOptions) -> Result<reqwest::Client, reqwest::Error> {
    base_client_builder(options).build()
}

/// Read at most 32 KiB of an error response body for diagnostics.
pub async fn read_capped_error_body(response: reqwest::Response) -> String {
    use futures_util::StreamExt;
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        body.extend_from_slice(&chunk);
        if body.len() > MAX_ERROR_BODY_BYTES {
            body.truncate(MAX_ERROR_BODY_BYTES);
            let text = String::from_utf8_lossy(&body);
            return format!("{text}...(truncated)");
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}

/// Join a base URL and an endpoint path without doubling slashes.
pub(crate) fn join_url(base: &str, endpoint: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        endpoint.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::{HttpOptions, http_client, join_url, read_capped_error_body};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn join_url_normalizes_slashes() {
        assert_eq!(join_url("https://h/", "/predict"), "https://h/predict");
        assert_eq!(join_url("https://h", "predict"), "https://h/predict");
        assert_eq!(join_url("https://h/api/", "get_address"), "https://h/api/get_address");
    }

    #[test]
    fn default_options_are_https_only() {
        let options = HttpOptions::default();
        assert!(!options.allow_insecure_http);
        assert!(http_client(options).is_ok());
    }

    #[tokio::test]
    async fn error_body_is_capped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("x".repeat(40 * 1024)))
            .mount(&server)
            .await;

        let response = reqwest::get(server.uri()).await.unwrap();
        let body = read_capped_error_body(response).await;
        assert!(body.ends_with("...(truncated)"));
        assert_eq!(body.len(), 32 * 1024 + "...(truncated)".len());
    }
}
