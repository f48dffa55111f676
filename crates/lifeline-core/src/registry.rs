use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::errors::LifelineError;
use crate::events::{GeoPoint, SessionSummary};

/// The backend session registry.
///
/// Every call carries the bearer token handed over at construction; any of
/// them can come back with an expired-credential signal, which callers must
/// treat as a forced logout rather than a retryable failure.
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    /// Create a session at the given position, returning its server-issued id.
    async fn start(&self, location: GeoPoint) -> Result<String, LifelineError>;
    /// Upload a fresh position for the session in progress.
    async fn update(&self, location: GeoPoint) -> Result<(), LifelineError>;
    /// Terminate the session in progress.
    async fn stop(&self) -> Result<(), LifelineError>;
    /// List sessions currently active, for responders.
    async fn list(&self) -> Result<Vec<SessionSummary>, LifelineError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartResponse {
    emergency_id: String,
}

/// Error body the registry sends with non-2xx responses.
#[derive(Debug, Default, Deserialize)]
struct ApiFailure {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    expired: bool,
}

fn classify_failure(status: StatusCode, failure: ApiFailure) -> LifelineError {
    if failure.expired {
        return LifelineError::CredentialExpired;
    }
    LifelineError::Transient(
        failure
            .message
            .unwrap_or_else(|| format!("registry returned status {status}")),
    )
}

/// REST client for the session registry.
pub struct HttpSessionRegistry {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl HttpSessionRegistry {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn failure(resp: reqwest::Response) -> LifelineError {
        let status = resp.status();
        let failure: ApiFailure = resp.json().await.unwrap_or_default();
        classify_failure(status, failure)
    }
}

#[async_trait]
impl SessionRegistry for HttpSessionRegistry {
    async fn start(&self, location: GeoPoint) -> Result<String, LifelineError> {
        let resp = self
            .client
            .post(self.url("/api/sos/start"))
            .bearer_auth(&self.token)
            .json(&location)
            .send()
            .await
            .map_err(|e| LifelineError::Transient(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::failure(resp).await);
        }
        let data: StartResponse = resp
            .json()
            .await
            .map_err(|e| LifelineError::Transient(format!("invalid start response: {e}")))?;
        Ok(data.emergency_id)
    }

    async fn update(&self, location: GeoPoint) -> Result<(), LifelineError> {
        let resp = self
            .client
            .post(self.url("/api/sos/update"))
            .bearer_auth(&self.token)
            .json(&location)
            .send()
            .await
            .map_err(|e| LifelineError::Transient(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::failure(resp).await);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), LifelineError> {
        let resp = self
            .client
            .post(self.url("/api/sos/stop"))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| LifelineError::Transient(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::failure(resp).await);
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SessionSummary>, LifelineError> {
        let resp = self
            .client
            .get(self.url("/api/sos/active"))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| LifelineError::Transient(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::failure(resp).await);
        }
        resp.json()
            .await
            .map_err(|e| LifelineError::Transient(format!("invalid listing response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_body_maps_to_credential_expired() {
        let err = classify_failure(
            StatusCode::UNAUTHORIZED,
            ApiFailure {
                message: Some("jwt expired".into()),
                expired: true,
            },
        );
        assert!(matches!(err, LifelineError::CredentialExpired));
    }

    #[test]
    fn plain_failure_maps_to_transient_with_message() {
        let err = classify_failure(
            StatusCode::BAD_REQUEST,
            ApiFailure {
                message: Some("no active SOS".into()),
                expired: false,
            },
        );
        match err {
            LifelineError::Transient(msg) => assert_eq!(msg, "no active SOS"),
            other => panic!("expected Transient, got {other:?}"),
        }
    }

    #[test]
    fn missing_body_falls_back_to_status() {
        let err = classify_failure(StatusCode::BAD_GATEWAY, ApiFailure::default());
        match err {
            LifelineError::Transient(msg) => assert!(msg.contains("502")),
            other => panic!("expected Transient, got {other:?}"),
        }
    }

    #[test]
    fn base_url_trailing_slash_is_normalized() {
        let registry = HttpSessionRegistry::new("http://localhost:5500/", "tok");
        assert_eq!(registry.url("/api/sos/start"), "http://localhost:5500/api/sos/start");
    }
}
