pub mod api;
pub mod command;
pub mod config;
pub mod connection;
pub mod secret_store;
pub mod session;
pub mod tracker;

use pumplink_core::CoreError;
use thiserror::Error;

use crate::{api::ApiError, secret_store::SecretStoreError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    SecretStore(#[from] SecretStoreError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("login required")]
    LoginRequired,
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("invalid configuration: {0}")]
    Config(String),
}
