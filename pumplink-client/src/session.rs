//! The signed-in client: credentials, REST calls, the realtime connection and
//! the activation countdown, owned by one explicit context object.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use pumplink_core::{
    ACCESS_CREDENTIAL_KEY, ActivateRequest, DeviceId, DeviceStatus, REFRESH_CREDENTIAL_KEY,
    RegisterResponse, ScheduleRequest, ScheduleResponse,
    activation::ActivationWindow,
    dial::{DialEngine, DialFeedback},
    lifecycle::AppPresence,
};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::{
    ClientError,
    api::{ApiError, DeviceApi},
    config::{ClientConfig, ServiceEndpoints},
    connection::{ConnectionManager, ConnectionSnapshot, SessionSignal},
    secret_store::{SecretStore, purge_credentials},
    tracker::ActivationTracker,
};

pub struct Session<S: SecretStore> {
    store: Arc<S>,
    api: DeviceApi,
    device_id: DeviceId,
    connection: Option<ConnectionManager>,
    tracker: ActivationTracker,
    signal_tx: mpsc::UnboundedSender<SessionSignal>,
    signal_rx: mpsc::UnboundedReceiver<SessionSignal>,
}

impl<S: SecretStore> Session<S> {
    /// Builds the context without touching the network.
    pub fn new(config: &ClientConfig, store: Arc<S>) -> Result<Self, ClientError> {
        let endpoints = ServiceEndpoints::from_config(config).map_err(ClientError::Config)?;
        let api = DeviceApi::new(endpoints)?;
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        Ok(Self {
            store,
            api,
            device_id: config.device_id,
            connection: None,
            tracker: ActivationTracker::new(),
            signal_tx,
            signal_rx,
        })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Creates an account. Does not sign in; call [`Session::login`] next.
    pub async fn register(
        &self,
        email: &str,
        password: &str,
    ) -> Result<RegisterResponse, ClientError> {
        let response = self.api.register(email, password).await?;
        info!(email = %email.trim(), "account registered");
        Ok(response)
    }

    /// Exchanges email and password for a credential pair, stores both and
    /// opens the realtime channel.
    pub async fn login(&mut self, email: &str, password: &str) -> Result<(), ClientError> {
        let response = self.api.login(email, password).await?;
        self.store.set(ACCESS_CREDENTIAL_KEY, &response.token).await?;
        self.store
            .set(REFRESH_CREDENTIAL_KEY, &response.refresh_token)
            .await?;
        info!(email = %email.trim(), "logged in");
        self.connect().await;
        Ok(())
    }

    /// Silent sign-in from the stored refresh credential.
    pub async fn restore(&mut self) -> Result<(), ClientError> {
        let Some(refresh_token) = self.store.get(REFRESH_CREDENTIAL_KEY).await? else {
            info!("no refresh credential stored");
            return Err(ClientError::LoginRequired);
        };

        match self.api.refresh(&refresh_token).await {
            Ok(refreshed) => {
                self.store
                    .set(ACCESS_CREDENTIAL_KEY, &refreshed.access_token)
                    .await?;
                info!("session restored from refresh credential");
                self.connect().await;
                Ok(())
            }
            Err(ApiError::Unauthorized) => Err(self.reject().await),
            Err(ApiError::Status { status, message }) if status.is_client_error() => {
                warn!(%status, "refresh credential refused: {message}");
                Err(self.reject().await)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Starts a fresh connection manager, retiring the previous one first.
    /// This is the only way out of the unauthorized state.
    pub async fn connect(&mut self) {
        if let Some(previous) = self.connection.take() {
            previous.shutdown().await;
        }
        self.connection = Some(ConnectionManager::start(
            Arc::clone(&self.store),
            self.api.endpoints().realtime.clone(),
            self.signal_tx.clone(),
        ));
    }

    pub fn set_presence(&self, presence: AppPresence) {
        if let Some(connection) = &self.connection {
            connection.set_presence(presence);
        }
    }

    pub fn connection(&self) -> ConnectionSnapshot {
        self.connection
            .as_ref()
            .map(ConnectionManager::snapshot)
            .unwrap_or_default()
    }

    pub fn subscribe_connection(&self) -> Option<watch::Receiver<ConnectionSnapshot>> {
        self.connection.as_ref().map(ConnectionManager::subscribe)
    }

    pub fn window(&self) -> ActivationWindow {
        self.tracker.window()
    }

    pub fn subscribe_window(&self) -> watch::Receiver<ActivationWindow> {
        self.tracker.subscribe()
    }

    pub fn tracker(&self) -> &ActivationTracker {
        &self.tracker
    }

    /// Powers the device on for `minutes` and starts the countdown from the
    /// deadline the server reports back.
    pub async fn arm(&mut self, minutes: u32) -> Result<DeviceStatus, ClientError> {
        let request = ActivateRequest::new(self.device_id, minutes)?;
        let bearer = self.bearer().await?;
        if let Err(err) = self.api.activate(&bearer, &request).await {
            return Err(self.api_failure(err).await);
        }
        info!(minutes, device_id = self.device_id, "device activated");
        self.refresh_status().await
    }

    /// Arms for whatever duration the dial currently shows. A dial resting
    /// below five degrees reads zero minutes and is refused without a request.
    pub async fn arm_from_dial<F: DialFeedback>(
        &mut self,
        dial: &DialEngine<F>,
    ) -> Result<DeviceStatus, ClientError> {
        self.arm(dial.duration_minutes()).await
    }

    /// Fetches the device state and re-arms the countdown accordingly.
    pub async fn refresh_status(&mut self) -> Result<DeviceStatus, ClientError> {
        let bearer = self.bearer().await?;
        let status = match self.api.device_status(&bearer, self.device_id).await {
            Ok(status) => status,
            Err(err) => return Err(self.api_failure(err).await),
        };
        self.tracker.set_active_until(status.active_until);
        Ok(status)
    }

    pub async fn schedule(
        &self,
        start_time: DateTime<Utc>,
        minutes: u32,
    ) -> Result<ScheduleResponse, ClientError> {
        let request = ScheduleRequest::new(self.device_id, start_time, minutes)?;
        let bearer = self.bearer().await?;
        match self.api.schedule(&bearer, &request).await {
            Ok(response) => {
                info!(%start_time, minutes, "activation scheduled");
                Ok(response)
            }
            Err(err) => Err(self.api_failure(err).await),
        }
    }

    /// Forgets both credentials and closes the realtime channel.
    pub async fn logout(&mut self) -> Result<(), ClientError> {
        if let Some(connection) = self.connection.take() {
            connection.shutdown().await;
        }
        self.tracker.set_active_until(None);
        purge_credentials(self.store.as_ref()).await?;
        info!("logged out");
        Ok(())
    }

    pub async fn next_signal(&mut self) -> Option<SessionSignal> {
        self.signal_rx.recv().await
    }

    pub async fn shutdown(mut self) {
        if let Some(connection) = self.connection.take() {
            connection.shutdown().await;
        }
    }

    async fn bearer(&self) -> Result<String, ClientError> {
        match self.store.get(ACCESS_CREDENTIAL_KEY).await? {
            Some(token) => Ok(token),
            None => {
                let _ = self.signal_tx.send(SessionSignal::LoginRequired);
                Err(ClientError::LoginRequired)
            }
        }
    }

    async fn api_failure(&self, err: ApiError) -> ClientError {
        match err {
            ApiError::Unauthorized => self.reject().await,
            other => other.into(),
        }
    }

    async fn reject(&self) -> ClientError {
        warn!("credential rejected; purging stored credentials");
        let purged = purge_credentials(self.store.as_ref()).await;
        let _ = self.signal_tx.send(SessionSignal::LoginRequired);
        match purged {
            Ok(()) => ClientError::LoginRequired,
            Err(err) => err.into(),
        }
    }
}
