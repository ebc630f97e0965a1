//! REST calls against the PumpLink backend.
//!
//! Bearer-authenticated calls map a `401` to [`ApiError::Unauthorized`]; the
//! caller decides what to do with the stored credentials.

use std::time::Duration;

use pumplink_core::{
    ActivateRequest, DeviceId, DeviceStatus, ErrorBody, LoginRequest, LoginResponse,
    RefreshRequest, RefreshResponse, RegisterRequest, RegisterResponse, ScheduleRequest,
    ScheduleResponse,
};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::warn;

use crate::config::ServiceEndpoints;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("credential rejected by the server")]
    Unauthorized,
    #[error("server returned {status}: {message}")]
    Status { status: StatusCode, message: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid endpoint: {0}")]
    Endpoint(String),
}

#[derive(Debug, Clone)]
pub struct DeviceApi {
    http: Client,
    endpoints: ServiceEndpoints,
}

impl DeviceApi {
    pub fn new(endpoints: ServiceEndpoints) -> Result<Self, ApiError> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { http, endpoints })
    }

    pub fn endpoints(&self) -> &ServiceEndpoints {
        &self.endpoints
    }

    pub async fn register(
        &self,
        email: &str,
        password: &str,
    ) -> Result<RegisterResponse, ApiError> {
        let request = self.http.post(self.url("register")?).json(&RegisterRequest {
            email: email.trim().to_owned(),
            password: password.to_owned(),
        });
        decode(send(request).await?).await
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<LoginResponse, ApiError> {
        let request = self.http.post(self.url("login")?).json(&LoginRequest {
            email: email.trim().to_owned(),
            password: password.to_owned(),
        });
        decode(send(request).await?).await
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<RefreshResponse, ApiError> {
        let request = self.http.post(self.url("refresh-token")?).json(&RefreshRequest {
            refresh_token: refresh_token.to_owned(),
        });
        decode(send(request).await?).await
    }

    pub async fn activate(&self, bearer: &str, body: &ActivateRequest) -> Result<(), ApiError> {
        let request = self
            .http
            .post(self.url("activate")?)
            .bearer_auth(bearer)
            .json(body);
        send(request).await?;
        Ok(())
    }

    pub async fn device_status(
        &self,
        bearer: &str,
        device_id: DeviceId,
    ) -> Result<DeviceStatus, ApiError> {
        let request = self
            .http
            .get(self.url(&format!("device/{device_id}/status"))?)
            .bearer_auth(bearer);
        decode(send(request).await?).await
    }

    pub async fn schedule(
        &self,
        bearer: &str,
        body: &ScheduleRequest,
    ) -> Result<ScheduleResponse, ApiError> {
        let request = self
            .http
            .post(self.url("schedule")?)
            .bearer_auth(bearer)
            .json(body);
        decode(send(request).await?).await
    }

    fn url(&self, segment: &str) -> Result<url::Url, ApiError> {
        self.endpoints.api_url(segment).map_err(ApiError::Endpoint)
    }
}

async fn send(request: RequestBuilder) -> Result<Response, ApiError> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(ApiError::Unauthorized);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .map(|body| body.error)
        .unwrap_or(body);
    warn!(%status, "request failed: {message}");
    Err(ApiError::Status { status, message })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    Ok(response.json::<T>().await?)
}
