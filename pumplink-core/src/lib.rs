pub mod activation;
pub mod dial;
pub mod lifecycle;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The app controls exactly one pump.
pub const DEVICE_ID: DeviceId = 1;
pub const MAX_ARM_MINUTES: u32 = 30;
pub const ACCESS_CREDENTIAL_KEY: &str = "accessToken";
pub const REFRESH_CREDENTIAL_KEY: &str = "refreshToken";

pub type DeviceId = u32;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    On,
    Off,
    #[default]
    Unknown,
}

impl PowerState {
    /// Realtime frames are bare `on`/`off` tokens. Anything else reads as `Off`
    /// so the status indicator keeps working on a garbled payload.
    pub fn from_frame(frame: &str) -> Self {
        match frame.trim() {
            "on" => PowerState::On,
            _ => PowerState::Off,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PowerState::On => "on",
            PowerState::Off => "off",
            PowerState::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivateRequest {
    pub device_id: DeviceId,
    /// Minutes.
    pub duration: u32,
}

impl ActivateRequest {
    pub fn new(device_id: DeviceId, duration_minutes: u32) -> Result<Self, CoreError> {
        validate_arm_minutes(duration_minutes)?;
        Ok(Self {
            device_id,
            duration: duration_minutes,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceStatus {
    pub status: PowerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleRequest {
    pub device_id: DeviceId,
    pub start_time: DateTime<Utc>,
    pub duration: u32,
}

impl ScheduleRequest {
    pub fn new(
        device_id: DeviceId,
        start_time: DateTime<Utc>,
        duration_minutes: u32,
    ) -> Result<Self, CoreError> {
        validate_arm_minutes(duration_minutes)?;
        Ok(Self {
            device_id,
            start_time,
            duration: duration_minutes,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleResponse {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterResponse {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoginResponse {
    #[serde(default)]
    pub message: String,
    pub token: String,
    #[serde(rename = "refreshToken")]
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefreshResponse {
    pub access_token: String,
}

/// Error body returned by the backend on non-2xx responses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Error, PartialEq)]
pub enum CoreError {
    #[error("dial radius must be a positive finite number, got {0}")]
    InvalidDialRadius(f64),
    #[error("arm duration must be between 1 and {max} minutes, got {minutes}")]
    InvalidDuration { minutes: u32, max: u32 },
    #[error("invalid timestamp {input:?}: {reason}")]
    InvalidTimestamp { input: String, reason: String },
}

pub fn validate_arm_minutes(minutes: u32) -> Result<(), CoreError> {
    if minutes == 0 || minutes > MAX_ARM_MINUTES {
        return Err(CoreError::InvalidDuration {
            minutes,
            max: MAX_ARM_MINUTES,
        });
    }
    Ok(())
}

pub fn parse_timestamp(input: &str) -> Result<DateTime<Utc>, CoreError> {
    DateTime::parse_from_rfc3339(input.trim())
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| CoreError::InvalidTimestamp {
            input: input.to_owned(),
            reason: err.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn power_frames_default_to_off() {
        assert_eq!(PowerState::from_frame("on"), PowerState::On);
        assert_eq!(PowerState::from_frame("off"), PowerState::Off);
        assert_eq!(PowerState::from_frame(" on\n"), PowerState::On);
        assert_eq!(PowerState::from_frame("ON!"), PowerState::Off);
        assert_eq!(PowerState::from_frame(""), PowerState::Off);
        assert_eq!(PowerState::from_frame("{\"state\":\"on\"}"), PowerState::Off);
    }

    #[test]
    fn arm_duration_bounds() {
        assert!(ActivateRequest::new(DEVICE_ID, 1).is_ok());
        assert!(ActivateRequest::new(DEVICE_ID, MAX_ARM_MINUTES).is_ok());
        assert_eq!(
            ActivateRequest::new(DEVICE_ID, 0).unwrap_err(),
            CoreError::InvalidDuration {
                minutes: 0,
                max: MAX_ARM_MINUTES
            }
        );
        assert!(ActivateRequest::new(DEVICE_ID, 31).is_err());
    }

    #[test]
    fn activate_request_wire_shape() {
        let body = serde_json::to_value(ActivateRequest::new(DEVICE_ID, 12).unwrap()).unwrap();
        assert_eq!(body, serde_json::json!({"device_id": 1, "duration": 12}));
    }

    #[test]
    fn device_status_without_window() {
        let status: DeviceStatus = serde_json::from_str(r#"{"status":"off"}"#).unwrap();
        assert_eq!(status.status, PowerState::Off);
        assert_eq!(status.active_until, None);
    }

    #[test]
    fn device_status_with_window() {
        let status: DeviceStatus =
            serde_json::from_str(r#"{"status":"on","active_until":"2025-03-01T10:15:00Z"}"#)
                .unwrap();
        assert_eq!(status.status, PowerState::On);
        assert_eq!(
            status.active_until,
            Some(Utc.with_ymd_and_hms(2025, 3, 1, 10, 15, 0).unwrap())
        );
    }

    #[test]
    fn login_response_uses_camel_case_refresh_field() {
        let response: LoginResponse = serde_json::from_str(
            r#"{"message":"ok","token":"a","refreshToken":"r","user":{"id":"1"}}"#,
        )
        .unwrap();
        assert_eq!(response.token, "a");
        assert_eq!(response.refresh_token, "r");
    }

    #[test]
    fn timestamps_are_normalised_to_utc() {
        let ts = parse_timestamp("2025-03-01T12:00:00+02:00").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap());
        assert!(matches!(
            parse_timestamp("tomorrow"),
            Err(CoreError::InvalidTimestamp { .. })
        ));
    }
}
