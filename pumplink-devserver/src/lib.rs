use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use axum::{
    Json, Router,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use pumplink_core::{
    ActivateRequest, DEVICE_ID, DeviceId, DeviceStatus, ErrorBody, LoginRequest, LoginResponse,
    PowerState, RefreshRequest, RefreshResponse, RegisterRequest, RegisterResponse,
    ScheduleRequest, ScheduleResponse,
    lifecycle::CREDENTIAL_REJECTED_CLOSE_CODE, validate_arm_minutes,
};
use tokio::{
    net::TcpListener,
    sync::{RwLock, mpsc},
};
use tracing::{info, warn};

pub const API_PREFIX: &str = "/api/v1";
const TOKEN_BYTES: usize = 24;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const REJECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct DevAccount {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone)]
struct Subscriber {
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Debug)]
struct Device {
    power: PowerState,
    active_until: Option<DateTime<Utc>>,
    // Bumped on every activation so a stale expiry timer cannot power off a newer window.
    generation: u64,
}

#[derive(Debug)]
struct ServerState {
    // Keyed by lowercased email.
    accounts: HashMap<String, String>,
    access_tokens: HashSet<String>,
    refresh_tokens: HashSet<String>,
    device: Device,
    subscribers: HashMap<u64, Subscriber>,
    next_subscriber_id: u64,
}

impl ServerState {
    fn recipients(&self) -> Vec<mpsc::UnboundedSender<Message>> {
        self.subscribers.values().map(|sub| sub.tx.clone()).collect()
    }

    fn status(&self) -> DeviceStatus {
        DeviceStatus {
            status: self.device.power,
            active_until: self.device.active_until,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppState {
    inner: Arc<RwLock<ServerState>>,
}

impl AppState {
    #[must_use]
    pub fn new(account: DevAccount) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ServerState {
                accounts: HashMap::from([(account_key(&account.email), account.password)]),
                access_tokens: HashSet::new(),
                refresh_tokens: HashSet::new(),
                device: Device {
                    power: PowerState::Off,
                    active_until: None,
                    generation: 0,
                },
                subscribers: HashMap::new(),
                next_subscriber_id: 0,
            })),
        }
    }

    pub async fn has_account(&self, email: &str) -> bool {
        self.inner
            .read()
            .await
            .accounts
            .contains_key(&account_key(email))
    }

    /// Mints an access/refresh pair, as a successful login would.
    pub async fn issue_tokens(&self) -> (String, String) {
        let access = random_token();
        let refresh = random_token();
        let mut server = self.inner.write().await;
        server.access_tokens.insert(access.clone());
        server.refresh_tokens.insert(refresh.clone());
        (access, refresh)
    }

    /// Invalidates every credential and kicks live sockets with a policy-violation close.
    pub async fn revoke_all_tokens(&self) {
        let recipients = {
            let mut server = self.inner.write().await;
            server.access_tokens.clear();
            server.refresh_tokens.clear();
            server.recipients()
        };
        info!(sockets = recipients.len(), "revoked all tokens");
        close_all(recipients, CREDENTIAL_REJECTED_CLOSE_CODE, "credential revoked");
    }

    pub async fn disconnect_all(&self, code: u16) {
        let recipients = self.inner.read().await.recipients();
        close_all(recipients, code, "server going away");
    }

    pub async fn broadcast_raw(&self, text: &str) {
        let recipients = self.inner.read().await.recipients();
        broadcast_text(recipients, text);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.read().await.subscribers.len()
    }

    pub async fn device_status(&self) -> DeviceStatus {
        self.inner.read().await.status()
    }

    pub async fn activate(&self, minutes: u32) -> DateTime<Utc> {
        let active_until = Utc::now() + chrono::Duration::minutes(i64::from(minutes));
        let (generation, recipients) = {
            let mut server = self.inner.write().await;
            server.device.generation += 1;
            server.device.power = PowerState::On;
            server.device.active_until = Some(active_until);
            (server.device.generation, server.recipients())
        };
        info!(minutes, %active_until, "device activated");
        broadcast_text(recipients, PowerState::On.as_str());

        let state = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(u64::from(minutes) * 60)).await;
            state.expire(generation).await;
        });
        active_until
    }

    async fn expire(&self, generation: u64) {
        let recipients = {
            let mut server = self.inner.write().await;
            if server.device.generation != generation {
                return;
            }
            server.device.power = PowerState::Off;
            server.device.active_until = None;
            server.recipients()
        };
        info!("activation window elapsed");
        broadcast_text(recipients, PowerState::Off.as_str());
    }

    async fn register_subscriber(
        &self,
        token: &str,
        tx: mpsc::UnboundedSender<Message>,
    ) -> Option<u64> {
        let mut server = self.inner.write().await;
        if !server.access_tokens.contains(token) {
            return None;
        }
        let id = server.next_subscriber_id;
        server.next_subscriber_id += 1;
        let _ = tx.send(Message::Text(server.device.power.as_str().into()));
        server.subscribers.insert(id, Subscriber { tx });
        Some(id)
    }

    async fn unregister_subscriber(&self, id: u64) {
        self.inner.write().await.subscribers.remove(&id);
    }

    async fn is_valid_access_token(&self, token: &str) -> bool {
        self.inner.read().await.access_tokens.contains(token)
    }
}

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/ws", get(ws_handler))
        .route("/register", post(register_handler))
        .route("/login", post(login_handler))
        .route("/refresh-token", post(refresh_handler))
        .route("/activate", post(activate_handler))
        .route("/schedule", post(schedule_handler))
        .route("/device/{id}/status", get(status_handler));

    Router::new()
        .nest(API_PREFIX, api)
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> Result<(), String> {
    info!(
        "dev server listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned())
    );
    axum::serve(listener, build_router(state))
        .await
        .map_err(|err| err.to_string())
}

async fn healthz_handler() -> impl IntoResponse {
    Json(serde_json::json!({"ok": true}))
}

async fn register_handler(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), Response> {
    let key = account_key(&request.email);
    if key.is_empty() || !key.contains('@') || request.password.is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "email and password are required",
        ));
    }

    {
        let mut server = state.inner.write().await;
        if server.accounts.contains_key(&key) {
            warn!(email = %key, "registration rejected: account exists");
            return Err(error_response(StatusCode::CONFLICT, "account already exists"));
        }
        server.accounts.insert(key.clone(), request.password);
    }
    info!(email = %key, "account registered");
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            message: "registration successful".to_owned(),
        }),
    ))
}

async fn login_handler(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, Response> {
    let matches = state
        .inner
        .read()
        .await
        .accounts
        .get(&account_key(&request.email))
        .is_some_and(|password| *password == request.password);
    if !matches {
        warn!(email = %request.email, "login rejected");
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "invalid email or password",
        ));
    }

    let (token, refresh_token) = state.issue_tokens().await;
    info!(email = %request.email, "login accepted");
    Ok(Json(LoginResponse {
        message: "login successful".to_owned(),
        token,
        refresh_token,
    }))
}

async fn refresh_handler(
    State(state): State<AppState>,
    Json(request): Json<RefreshRequest>,
) -> Result<Json<RefreshResponse>, Response> {
    let access_token = {
        let mut server = state.inner.write().await;
        if !server.refresh_tokens.contains(&request.refresh_token) {
            return Err(error_response(
                StatusCode::UNAUTHORIZED,
                "invalid refresh token",
            ));
        }
        let access = random_token();
        server.access_tokens.insert(access.clone());
        access
    };
    Ok(Json(RefreshResponse { access_token }))
}

async fn activate_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ActivateRequest>,
) -> Result<Json<serde_json::Value>, Response> {
    authorize(&state, &headers).await?;
    check_device(request.device_id)?;
    validate_arm_minutes(request.duration)
        .map_err(|err| error_response(StatusCode::BAD_REQUEST, &err.to_string()))?;

    state.activate(request.duration).await;
    Ok(Json(serde_json::json!({})))
}

async fn schedule_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ScheduleRequest>,
) -> Result<Json<ScheduleResponse>, Response> {
    authorize(&state, &headers).await?;
    check_device(request.device_id)?;
    validate_arm_minutes(request.duration)
        .map_err(|err| error_response(StatusCode::BAD_REQUEST, &err.to_string()))?;

    let delay = (request.start_time - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO);
    let minutes = request.duration;
    let background_state = state.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        background_state.activate(minutes).await;
    });

    info!(start_time = %request.start_time, minutes, "activation scheduled");
    Ok(Json(ScheduleResponse {
        status: "scheduled".to_owned(),
    }))
}

async fn status_handler(
    State(state): State<AppState>,
    Path(device_id): Path<DeviceId>,
    headers: HeaderMap,
) -> Result<Json<DeviceStatus>, Response> {
    authorize(&state, &headers).await?;
    check_device(device_id)?;
    Ok(Json(state.device_status().await))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        if let Err(err) = handle_socket(state, socket).await {
            warn!("realtime session ended with error: {}", err);
        }
    })
}

async fn handle_socket(state: AppState, socket: WebSocket) -> Result<(), String> {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    // Pongs queued by the read half only go out when the write half sends, so
    // ping periodically to keep proxies from reaping an idle socket.
    const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(KEEPALIVE_INTERVAL);
        ping_interval.tick().await; // skip first immediate tick

        loop {
            tokio::select! {
                msg = outbound_rx.recv() => {
                    match msg {
                        Some(message) => {
                            let closing = matches!(message, Message::Close(_));
                            if ws_sender.send(message).await.is_err() || closing {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let first_message = tokio::time::timeout(HANDSHAKE_TIMEOUT, ws_receiver.next())
        .await
        .map_err(|_| "client sent no credential in time".to_owned())?
        .ok_or_else(|| "client disconnected before handshake".to_owned())
        .and_then(|result| result.map_err(|err| err.to_string()))?;

    let token = match &first_message {
        Message::Text(text) => text.as_str().trim().to_owned(),
        _ => String::new(),
    };

    let Some(subscriber_id) = state.register_subscriber(&token, outbound_tx.clone()).await else {
        let _ = outbound_tx.send(close_message(
            CREDENTIAL_REJECTED_CLOSE_CODE,
            "invalid credential",
        ));
        drop(outbound_tx);
        let _ = tokio::time::timeout(REJECT_FLUSH_TIMEOUT, send_task).await;
        return Err("handshake rejected".to_owned());
    };

    info!(subscriber_id, "realtime subscriber joined");

    while let Some(next_message) = ws_receiver.next().await {
        match next_message {
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                warn!("websocket receive error: {}", err);
                break;
            }
        }
    }

    state.unregister_subscriber(subscriber_id).await;
    send_task.abort();
    info!(subscriber_id, "realtime subscriber left");
    Ok(())
}

async fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| error_response(StatusCode::UNAUTHORIZED, "missing bearer token"))?;

    if !state.is_valid_access_token(token).await {
        return Err(error_response(StatusCode::UNAUTHORIZED, "invalid token"));
    }
    Ok(())
}

fn check_device(device_id: DeviceId) -> Result<(), Response> {
    if device_id != DEVICE_ID {
        return Err(error_response(StatusCode::NOT_FOUND, "unknown device"));
    }
    Ok(())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_owned(),
        }),
    )
        .into_response()
}

fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

fn close_all(recipients: Vec<mpsc::UnboundedSender<Message>>, code: u16, reason: &str) {
    for tx in recipients {
        let _ = tx.send(close_message(code, reason));
    }
}

fn broadcast_text(recipients: Vec<mpsc::UnboundedSender<Message>>, text: &str) {
    for tx in recipients {
        let _ = tx.send(Message::Text(text.into()));
    }
}

fn random_token() -> String {
    let bytes: [u8; TOKEN_BYTES] = rand::random();
    hex::encode(bytes)
}

fn account_key(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}
