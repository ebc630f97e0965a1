use std::{sync::Arc, time::Duration};

use chrono::Utc;
use pumplink_client::{
    ClientError,
    api::ApiError,
    config::ClientConfig,
    connection::SessionSignal,
    secret_store::{MemorySecretStore, SecretStore},
    session::Session,
};
use pumplink_core::{
    ACCESS_CREDENTIAL_KEY, CoreError, PowerState, REFRESH_CREDENTIAL_KEY,
    dial::{DialEngine, DialGeometry, Point},
    lifecycle::ConnectionState,
};
use pumplink_devserver::{API_PREFIX, AppState, DevAccount, build_router};
use tokio::{net::TcpListener, sync::oneshot, time::timeout};

const WAIT: Duration = Duration::from_secs(5);

struct TestServer {
    state: AppState,
    config: ClientConfig,
    shutdown_tx: oneshot::Sender<()>,
}

#[tokio::test]
async fn login_stores_credentials_and_connects() {
    let server = start_server().await;
    let mut session = Session::new(&server.config, Arc::new(MemorySecretStore::new())).unwrap();

    let err = session.login("dev@pumplink.test", "wrong").await.unwrap_err();
    assert!(matches!(err, ClientError::Api(ApiError::Unauthorized)), "{err}");
    assert!(!session.store().contains(ACCESS_CREDENTIAL_KEY));

    session.login(" dev@pumplink.test ", "secret").await.unwrap();
    assert!(session.store().contains(ACCESS_CREDENTIAL_KEY));
    assert!(session.store().contains(REFRESH_CREDENTIAL_KEY));

    let mut connection = session.subscribe_connection().expect("connection started");
    timeout(WAIT, connection.wait_for(|s| s.state == ConnectionState::Connected))
        .await
        .expect("connected in time")
        .expect("manager alive");

    session.shutdown().await;
    let _ = server.shutdown_tx.send(());
}

#[tokio::test]
async fn arm_activates_device_and_starts_countdown() {
    let server = start_server().await;
    let (access, refresh) = server.state.issue_tokens().await;
    let store = Arc::new(MemorySecretStore::with_credentials(&access, &refresh));
    let mut session = Session::new(&server.config, store).unwrap();

    let status = session.arm(12).await.unwrap();
    assert_eq!(status.status, PowerState::On);
    let until = status.active_until.expect("deadline reported");
    assert!(until > Utc::now() + chrono::Duration::minutes(11));

    let window = session.window();
    assert!(window.is_armed());
    assert!(window.label().starts_with("11:") || window.label().starts_with("12:"));
    assert_eq!(session.tracker().active_timers(), 1);

    // A second arm replaces the countdown instead of stacking another.
    session.arm(3).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.tracker().active_timers(), 1);
    let label = session.window().label().to_owned();
    assert!(label.starts_with("02:") || label.starts_with("03:"), "{label}");

    let _ = server.shutdown_tx.send(());
}

#[tokio::test]
async fn register_then_login_with_the_new_account() {
    let server = start_server().await;
    let mut session = Session::new(&server.config, Arc::new(MemorySecretStore::new())).unwrap();

    let response = session.register(" pat@pumplink.test ", "pw-1").await.unwrap();
    assert!(!response.message.is_empty());
    assert!(!session.store().contains(ACCESS_CREDENTIAL_KEY));

    let err = session.register("pat@pumplink.test", "pw-1").await.unwrap_err();
    assert!(
        matches!(
            err,
            ClientError::Api(ApiError::Status { status, .. }) if status == reqwest::StatusCode::CONFLICT
        ),
        "{err}"
    );

    session.login("pat@pumplink.test", "pw-1").await.unwrap();
    assert!(session.store().contains(ACCESS_CREDENTIAL_KEY));

    session.shutdown().await;
    let _ = server.shutdown_tx.send(());
}

#[tokio::test]
async fn dial_position_decides_the_armed_duration() {
    let server = start_server().await;
    let (access, refresh) = server.state.issue_tokens().await;
    let store = Arc::new(MemorySecretStore::with_credentials(&access, &refresh));
    let mut session = Session::new(&server.config, store).unwrap();
    let mut dial = DialEngine::new(DialGeometry::new(Point::new(200.0, 400.0)), ());

    // Below five degrees the dial reads zero minutes; nothing is sent.
    dial.drag_to(4.0);
    assert_eq!(dial.duration_minutes(), 0);
    let err = session.arm_from_dial(&dial).await.unwrap_err();
    assert!(
        matches!(err, ClientError::Core(CoreError::InvalidDuration { minutes: 0, .. })),
        "{err}"
    );
    assert_eq!(server.state.device_status().await.status, PowerState::Off);
    assert!(!session.window().is_armed());

    dial.drag_to(155.0);
    assert_eq!(dial.duration_minutes(), 16);
    let status = session.arm_from_dial(&dial).await.unwrap();
    assert_eq!(status.status, PowerState::On);
    let until = status.active_until.expect("deadline reported");
    assert!(until > Utc::now() + chrono::Duration::minutes(15));
    assert!(until <= Utc::now() + chrono::Duration::minutes(16));
    let label = session.window().label().to_owned();
    assert!(label.starts_with("15:") || label.starts_with("16:"), "{label}");

    let _ = server.shutdown_tx.send(());
}

#[tokio::test]
async fn out_of_range_arm_is_rejected_locally() {
    let server = start_server().await;
    let (access, refresh) = server.state.issue_tokens().await;
    let store = Arc::new(MemorySecretStore::with_credentials(&access, &refresh));
    let mut session = Session::new(&server.config, store).unwrap();

    let err = session.arm(31).await.unwrap_err();
    assert!(
        matches!(err, ClientError::Core(CoreError::InvalidDuration { minutes: 31, .. })),
        "{err}"
    );
    assert_eq!(server.state.device_status().await.status, PowerState::Off);

    let _ = server.shutdown_tx.send(());
}

#[tokio::test]
async fn rejected_bearer_purges_credentials_and_signals_login() {
    let server = start_server().await;
    let store = Arc::new(MemorySecretStore::with_credentials("stale", "stale-refresh"));
    let mut session = Session::new(&server.config, store).unwrap();

    let err = session.arm(5).await.unwrap_err();
    assert!(matches!(err, ClientError::LoginRequired), "{err}");
    assert!(!session.store().contains(ACCESS_CREDENTIAL_KEY));
    assert!(!session.store().contains(REFRESH_CREDENTIAL_KEY));

    let signal = timeout(WAIT, session.next_signal()).await.expect("signal in time");
    assert_eq!(signal, Some(SessionSignal::LoginRequired));
    assert_eq!(server.state.device_status().await.status, PowerState::Off);

    let _ = server.shutdown_tx.send(());
}

#[tokio::test]
async fn restore_refreshes_access_credential() {
    let server = start_server().await;
    let (_, refresh) = server.state.issue_tokens().await;
    let store = Arc::new(MemorySecretStore::with_credentials("expired", &refresh));
    let mut session = Session::new(&server.config, Arc::clone(&store)).unwrap();

    session.restore().await.unwrap();
    let access = store.get(ACCESS_CREDENTIAL_KEY).await.unwrap().expect("access stored");
    assert_ne!(access, "expired");

    let status = session.refresh_status().await.unwrap();
    assert_eq!(status.status, PowerState::Off);
    assert!(!session.window().is_armed());

    session.shutdown().await;
    let _ = server.shutdown_tx.send(());
}

#[tokio::test]
async fn restore_without_usable_refresh_credential_requires_login() {
    let server = start_server().await;

    let mut empty = Session::new(&server.config, Arc::new(MemorySecretStore::new())).unwrap();
    assert!(matches!(empty.restore().await, Err(ClientError::LoginRequired)));

    let store = Arc::new(MemorySecretStore::with_credentials("a", "revoked"));
    let mut revoked = Session::new(&server.config, store).unwrap();
    assert!(matches!(revoked.restore().await, Err(ClientError::LoginRequired)));
    assert!(!revoked.store().contains(REFRESH_CREDENTIAL_KEY));

    let _ = server.shutdown_tx.send(());
}

#[tokio::test]
async fn schedule_and_logout() {
    let server = start_server().await;
    let (access, refresh) = server.state.issue_tokens().await;
    let store = Arc::new(MemorySecretStore::with_credentials(&access, &refresh));
    let mut session = Session::new(&server.config, store).unwrap();

    let response = session
        .schedule(Utc::now() + chrono::Duration::hours(1), 10)
        .await
        .unwrap();
    assert_eq!(response.status, "scheduled");

    session.logout().await.unwrap();
    assert!(!session.store().contains(ACCESS_CREDENTIAL_KEY));
    assert!(!session.store().contains(REFRESH_CREDENTIAL_KEY));
    assert_eq!(session.connection().state, ConnectionState::Disconnected);

    let err = session.refresh_status().await.unwrap_err();
    assert!(matches!(err, ClientError::LoginRequired), "{err}");

    let _ = server.shutdown_tx.send(());
}

async fn start_server() -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral dev server socket");
    let address = listener.local_addr().expect("dev server local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let state = AppState::new(DevAccount {
        email: "dev@pumplink.test".to_owned(),
        password: "secret".to_owned(),
    });
    let server = axum::serve(listener, build_router(state.clone())).with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    TestServer {
        state,
        config: ClientConfig {
            api_base_url: format!("http://{address}{API_PREFIX}"),
            device_id: 1,
        },
        shutdown_tx,
    }
}
