//! SafeWalk backend service.
//!
//! One host serves the safety classifier, the challenge password store, the
//! server-side challenge timer and the emergency address book. Every call is
//! a JSON `POST` carrying the device id as `uuid`, authenticated with a
//! bearer token.
//!
//! | Endpoint | Request | Response |
//! |----------|---------|----------|
//! | `/predict` | `{uuid, latitude, longitude}` | `{safety}` |
//! | `/setpasswd` | `{uuid, password}` | 2xx |
//! | `/valpasswd` | `{uuid, password}` | `{message}` |
//! | `/timeout_start` | `{uuid}` | 2xx |
//! | `/timeout_check` | `{uuid}` | `{timer: 0/1}` |
//! | `/update_address` | `{uuid, address}` | 2xx |
//! | `/get_address` | `{uuid}` | `{address}` |

use safewalk_types::{Coordinate, DeviceId, Rating, Secret};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use thiserror::Error;

use crate::{ProviderFut, join_url, read_capped_error_body};

/// Exact message the backend returns for a correct password.
pub const PASSWORD_VALIDATED_MESSAGE: &str = "Password validated successfully";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{endpoint}: request failed: {message}")]
    Transport {
        endpoint: &'static str,
        message: String,
    },
    #[error("{endpoint}: backend returned {status}: {body}")]
    Status {
        endpoint: &'static str,
        status: u16,
        body: String,
    },
    #[error("{endpoint}: unexpected response: {message}")]
    Decode {
        endpoint: &'static str,
        message: String,
    },
    #[error("password must not be empty")]
    EmptyPassword,
}

impl BackendError {
    #[must_use]
    pub fn endpoint(&self) -> Option<&'static str> {
        match self {
            Self::Transport { endpoint, .. }
            | Self::Status { endpoint, .. }
            | Self::Decode { endpoint, .. } => Some(*endpoint),
            Self::EmptyPassword => None,
        }
    }
}

/// Backend verdict on a submitted challenge password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PasswordVerdict {
    Accepted,
    Rejected { message: String },
}

/// Remote safety classifier.
pub trait PredictionClient: Send + Sync {
    fn rate(&self, point: Coordinate) -> ProviderFut<'_, Rating, BackendError>;
}

/// Remote side of the "are you OK" challenge.
pub trait ChallengeBackend: Send + Sync {
    fn validate_password<'a>(
        &'a self,
        password: &'a Secret,
    ) -> ProviderFut<'a, PasswordVerdict, BackendError>;

    /// Register the password future challenges are checked against.
    fn set_password<'a>(&'a self, password: &'a Secret) -> ProviderFut<'a, (), BackendError>;

    /// Start the server-side challenge timer for this device.
    fn start_timer(&self) -> ProviderFut<'_, (), BackendError>;

    /// Whether the server-side timer has elapsed.
    fn timer_elapsed(&self) -> ProviderFut<'_, bool, BackendError>;
}

/// Emergency contact address stored on the backend.
pub trait AddressBook: Send + Sync {
    fn update_address<'a>(&'a self, address: &'a str) -> ProviderFut<'a, (), BackendError>;

    fn get_address(&self) -> ProviderFut<'_, Option<String>, BackendError>;
}

#[derive(Debug, serde::Deserialize)]
struct PredictResponse {
    safety: String,
}

#[derive(Debug, serde::Deserialize)]
struct ValidateResponse {
    #[serde(default)]
    message: String,
}

#[derive(Debug, serde::Deserialize)]
struct TimerResponse {
    timer: u8,
}

#[derive(Debug, serde::Deserialize)]
struct AddressResponse {
    #[serde(default)]
    address: Option<String>,
}

/// HTTP client for the SafeWalk backend.
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<Secret>,
    device: DeviceId,
}

impl BackendClient {
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        token: Option<Secret>,
        device: DeviceId,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            token: token.filter(|t| !t.is_empty()),
            device,
        }
    }

    #[must_use]
    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        endpoint: &'static str,
        body: &B,
    ) -> Result<reqwest::Response, BackendError> {
        let mut request = self.http.post(join_url(&self.base_url, endpoint)).json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| BackendError::Transport {
                endpoint,
                message: e.without_url().to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = read_capped_error_body(response).await;
            tracing::warn!(endpoint, %status, "Backend returned an error status");
            return Err(BackendError::Status {
                endpoint,
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn post_json<B, R>(&self, endpoint: &'static str, body: &B) -> Result<R, BackendError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = self.post(endpoint, body).await?;
        response
            .json::<R>()
            .await
            .map_err(|e| BackendError::Decode {
                endpoint,
                message: e.without_url().to_string(),
            })
    }

    async fn predict(&self, point: Coordinate) -> Result<Rating, BackendError> {
        let body = json!({
            "uuid": self.device.as_str(),
            "latitude": point.latitude(),
            "longitude": point.longitude(),
        });
        let response: PredictResponse = self.post_json("predict", &body).await?;
        let rating = Rating::from_label(&response.safety);
        tracing::debug!(%point, label = %response.safety, ?rating, "Point rated");
        Ok(rating)
    }

    async fn validate(&self, password: &Secret) -> Result<PasswordVerdict, BackendError> {
        let body = json!({
            "uuid": self.device.as_str(),
            "password": password.expose_secret(),
        });
        let response: ValidateResponse = self.post_json("valpasswd", &body).await?;
        if response.message == PASSWORD_VALIDATED_MESSAGE {
            Ok(PasswordVerdict::Accepted)
        } else {
            Ok(PasswordVerdict::Rejected {
                message: response.message,
            })
        }
    }

    async fn store_password(&self, password: &Secret) -> Result<(), BackendError> {
        if password.expose_secret().trim().is_empty() {
            return Err(BackendError::EmptyPassword);
        }
        let body = json!({
            "uuid": self.device.as_str(),
            "password": password.expose_secret(),
        });
        self.post("setpasswd", &body).await?;
        Ok(())
    }

    async fn timeout_start(&self) -> Result<(), BackendError> {
        self.post("timeout_start", &json!({ "uuid": self.device.as_str() }))
            .await?;
        Ok(())
    }

    async fn timeout_check(&self) -> Result<bool, BackendError> {
        let response: TimerResponse = self
            .post_json("timeout_check", &json!({ "uuid": self.device.as_str() }))
            .await?;
        match response.timer {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(BackendError::Decode {
                endpoint: "timeout_check",
                message: format!("timer must be 0 or 1, got {other}"),
            }),
        }
    }

    async fn store_address(&self, address: &str) -> Result<(), BackendError> {
        let body = json!({
            "uuid": self.device.as_str(),
            "address": address,
        });
        self.post("update_address", &body).await?;
        Ok(())
    }

    async fn load_address(&self) -> Result<Option<String>, BackendError> {
        let response: AddressResponse = self
            .post_json("get_address", &json!({ "uuid": self.device.as_str() }))
            .await?;
        Ok(response.address.filter(|a| !a.trim().is_empty()))
    }
}

impl PredictionClient for BackendClient {
    fn rate(&self, point: Coordinate) -> ProviderFut<'_, Rating, BackendError> {
        Box::pin(self.predict(point))
    }
}

impl ChallengeBackend for BackendClient {
    fn validate_password<'a>(
        &'a self,
        password: &'a Secret,
    ) -> ProviderFut<'a, PasswordVerdict, BackendError> {
        Box::pin(self.validate(password))
    }

    fn set_password<'a>(&'a self, password: &'a Secret) -> ProviderFut<'a, (), BackendError> {
        Box::pin(self.store_password(password))
    }

    fn start_timer(&self) -> ProviderFut<'_, (), BackendError> {
        Box::pin(self.timeout_start())
    }

    fn timer_elapsed(&self) -> ProviderFut<'_, bool, BackendError> {
        Box::pin(self.timeout_check())
    }
}

impl AddressBook for BackendClient {
    fn update_address<'a>(&'a self, address: &'a str) -> ProviderFut<'a, (), BackendError> {
        Box::pin(self.store_address(address))
    }

    fn get_address(&self) -> ProviderFut<'_, Option<String>, BackendError> {
        Box::pin(self.load_address())
    }
}
