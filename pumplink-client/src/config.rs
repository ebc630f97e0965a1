use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use pumplink_core::{DEVICE_ID, DeviceId};
use serde::{Deserialize, Serialize};
use url::Url;

pub const DEFAULT_API_BASE_URL: &str = "https://pumplink-backend-production.up.railway.app/api/v1";

/// Defensive bound: `config.json` is expected to be tiny.
///
/// This prevents pathological reads if the file is corrupted or replaced.
pub const MAX_CONFIG_BYTES: u64 = 64 * 1024;

const MAX_API_BASE_URL_LEN: usize = 2048;
const REALTIME_PATH: &str = "ws";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientConfig {
    pub api_base_url: String,
    #[serde(default = "default_device_id")]
    pub device_id: DeviceId,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_owned(),
            device_id: DEVICE_ID,
        }
    }
}

fn default_device_id() -> DeviceId {
    DEVICE_ID
}

/// Where the REST calls and the realtime channel live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoints {
    pub api_base: Url,
    pub realtime: Url,
}

impl ServiceEndpoints {
    pub fn from_config(config: &ClientConfig) -> Result<Self, String> {
        validate_config(config)?;
        let api_base = Url::parse(config.api_base_url.trim()).map_err(|err| err.to_string())?;
        let realtime = realtime_url(&api_base)?;
        Ok(Self { api_base, realtime })
    }

    /// Joins `segment` (no leading slash) onto the API base path.
    pub fn api_url(&self, segment: &str) -> Result<Url, String> {
        join_path(&self.api_base, segment)
    }
}

fn realtime_url(api_base: &Url) -> Result<Url, String> {
    let mut realtime = join_path(api_base, REALTIME_PATH)?;
    let scheme = match api_base.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => return Err(format!("unsupported scheme {other}")),
    };
    realtime
        .set_scheme(scheme)
        .map_err(|()| format!("cannot switch {} to {scheme}", api_base))?;
    Ok(realtime)
}

fn join_path(base: &Url, segment: &str) -> Result<Url, String> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| format!("{base} cannot be a base URL"))?
        .pop_if_empty()
        .extend(segment.split('/'));
    Ok(url)
}

#[derive(Debug)]
pub enum ConfigLoadError {
    Metadata(io::Error),
    TooLarge { size: u64, max: u64 },
    Read(io::Error),
    Parse(serde_json::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigLoadError::Metadata(e) => write!(f, "metadata read failed: {e}"),
            ConfigLoadError::TooLarge { size, max } => {
                write!(f, "file too large: {size} bytes (max {max})")
            }
            ConfigLoadError::Read(e) => write!(f, "read failed: {e}"),
            ConfigLoadError::Parse(e) => write!(f, "parse failed: {e}"),
            ConfigLoadError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigLoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigLoadError::Metadata(e) => Some(e),
            ConfigLoadError::Read(e) => Some(e),
            ConfigLoadError::Parse(e) => Some(e),
            ConfigLoadError::TooLarge { .. } | ConfigLoadError::Invalid(_) => None,
        }
    }
}

#[derive(Debug)]
pub enum ConfigSaveError {
    Invalid(String),
    Serialize(serde_json::Error),
    WriteTmp(io::Error),
    Rename(io::Error),
}

impl std::fmt::Display for ConfigSaveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSaveError::Invalid(msg) => write!(f, "invalid config: {msg}"),
            ConfigSaveError::Serialize(e) => write!(f, "serialize failed: {e}"),
            ConfigSaveError::WriteTmp(e) => write!(f, "tmp write failed: {e}"),
            ConfigSaveError::Rename(e) => write!(f, "rename failed: {e}"),
        }
    }
}

impl std::error::Error for ConfigSaveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigSaveError::Serialize(e) => Some(e),
            ConfigSaveError::WriteTmp(e) => Some(e),
            ConfigSaveError::Rename(e) => Some(e),
            ConfigSaveError::Invalid(_) => None,
        }
    }
}

pub fn validate_config(config: &ClientConfig) -> Result<(), String> {
    let mut errors: Vec<String> = Vec::new();

    let api_base_url = config.api_base_url.trim();
    if api_base_url.is_empty() {
        errors.push("API base URL is required.".to_string());
    } else if api_base_url.len() > MAX_API_BASE_URL_LEN {
        errors.push(format!(
            "API base URL is too long ({} > {} chars).",
            api_base_url.len(),
            MAX_API_BASE_URL_LEN
        ));
    } else {
        match Url::parse(api_base_url) {
            Ok(url) => {
                let scheme = url.scheme();
                if scheme != "http" && scheme != "https" {
                    errors.push("API base URL must start with http:// or https://.".to_string());
                }
            }
            Err(err) => {
                errors.push(format!("API base URL is invalid: {err}"));
            }
        }
    }

    if config.device_id == 0 {
        errors.push("Device id must be positive.".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(format!(
            "Please fix the following:\n\n- {}",
            errors.join("\n- ")
        ))
    }
}

/// `$PUMPLINK_CONFIG_DIR`, else `$HOME/.pumplink`, else the working directory.
pub fn config_dir() -> PathBuf {
    let dir = if let Some(override_dir) = std::env::var_os("PUMPLINK_CONFIG_DIR") {
        PathBuf::from(override_dir)
    } else {
        std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(".pumplink"))
            .unwrap_or_else(|| PathBuf::from("."))
    };
    let _ = fs::create_dir_all(&dir);
    dir
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

pub fn secrets_path() -> PathBuf {
    config_dir().join("secrets.json")
}

pub fn load_config_from_path(path: &Path) -> Result<ClientConfig, ConfigLoadError> {
    let meta = fs::metadata(path).map_err(ConfigLoadError::Metadata)?;
    if meta.len() > MAX_CONFIG_BYTES {
        return Err(ConfigLoadError::TooLarge {
            size: meta.len(),
            max: MAX_CONFIG_BYTES,
        });
    }

    let data = fs::read_to_string(path).map_err(ConfigLoadError::Read)?;
    let config: ClientConfig = serde_json::from_str(&data).map_err(ConfigLoadError::Parse)?;
    validate_config(&config).map_err(ConfigLoadError::Invalid)?;
    Ok(config)
}

/// Missing config is not an error; anything else falls back to defaults.
pub fn load_config(path: &Path) -> Result<Option<ClientConfig>, ConfigLoadError> {
    if !path.exists() {
        return Ok(None);
    }
    load_config_from_path(path).map(Some)
}

pub fn save_config_to_path(path: &Path, config: &ClientConfig) -> Result<(), ConfigSaveError> {
    validate_config(config).map_err(ConfigSaveError::Invalid)?;

    let tmp = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(config).map_err(ConfigSaveError::Serialize)?;
    fs::write(&tmp, payload.as_bytes()).map_err(ConfigSaveError::WriteTmp)?;

    if path.exists() {
        let _ = fs::remove_file(path);
    }

    fs::rename(&tmp, path).map_err(ConfigSaveError::Rename)?;
    Ok(())
}

pub fn save_config_with_retry(path: &Path, config: &ClientConfig) -> Result<(), ConfigSaveError> {
    const MAX_ATTEMPTS: u32 = 3;
    const BACKOFF_BASE_MS: u64 = 50;

    let mut attempt: u32 = 1;
    loop {
        match save_config_to_path(path, config) {
            Ok(()) => return Ok(()),
            Err(ConfigSaveError::Invalid(msg)) => return Err(ConfigSaveError::Invalid(msg)),
            Err(err) if attempt >= MAX_ATTEMPTS => return Err(err),
            Err(_) => {
                let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
                std::thread::sleep(Duration::from_millis(backoff_ms));
                attempt += 1;
            }
        }
    }
}
