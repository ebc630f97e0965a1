//! Realtime connection lifecycle.
//!
//! One actor task owns the session: it opens sockets, consumes their events
//! and applies [`pumplink_core::lifecycle::transition`]. Every socket runs in
//! its own task and tags its events with an epoch; events from a socket the
//! actor no longer considers current are dropped, so a slow close of an old
//! socket can never clobber the state of its replacement.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use pumplink_core::{
    ACCESS_CREDENTIAL_KEY, PowerState,
    lifecycle::{
        AppPresence, ConnectionState, LifecycleEvent, PresenceAction, classify_close,
        presence_action, transition,
    },
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::timeout,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::secret_store::{SecretStore, purge_credentials};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(12);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub power: PowerState,
}

/// Things the owner of the manager has to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    /// No usable credential: route the user to the login screen.
    LoginRequired,
    StoreFailure(String),
}

#[derive(Debug)]
enum Command {
    Presence(AppPresence),
    Shutdown,
}

#[derive(Debug)]
struct SocketEvent {
    epoch: u64,
    kind: SocketEventKind,
}

#[derive(Debug)]
enum SocketEventKind {
    Opened,
    Frame(String),
    Error(String),
    Closed { code: Option<u16> },
}

pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<ConnectionSnapshot>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    /// Spawns the lifecycle actor and runs the connect procedure right away.
    pub fn start<S: SecretStore>(
        store: Arc<S>,
        endpoint: Url,
        signal_tx: mpsc::UnboundedSender<SessionSignal>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(ConnectionSnapshot::default());

        let actor = Lifecycle {
            store,
            endpoint,
            snapshot: ConnectionSnapshot::default(),
            socket: None,
            next_epoch: 0,
            event_tx,
            snapshot_tx,
            signal_tx,
        };
        let task = tokio::spawn(actor.run(command_rx, event_rx));

        Self {
            commands: command_tx,
            snapshot: snapshot_rx,
            task: Some(task),
        }
    }

    pub fn set_presence(&self, presence: AppPresence) {
        let _ = self.commands.send(Command::Presence(presence));
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        *self.snapshot.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.snapshot.clone()
    }

    /// Closes the socket cleanly and waits for the actor to finish.
    pub async fn shutdown(mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(task) = self.task.take()
            && let Err(err) = task.await
        {
            warn!("connection actor ended abnormally: {}", err);
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        // Aborting the actor drops its socket handle, which aborts the socket task.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct SocketHandle {
    epoch: u64,
    close_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SocketHandle {
    fn open(
        epoch: u64,
        endpoint: Url,
        credential: String,
        events: mpsc::UnboundedSender<SocketEvent>,
    ) -> Self {
        let (close_tx, close_rx) = oneshot::channel();
        let task = tokio::spawn(run_socket(epoch, endpoint, credential, events, close_rx));
        Self {
            epoch,
            close_tx: Some(close_tx),
            task,
        }
    }

    fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Asks the socket task to send a close frame; the task exits on its own.
    fn close(mut self) {
        if let Some(close_tx) = self.close_tx.take() {
            let _ = close_tx.send(());
        }
    }

    /// Like [`SocketHandle::close`], but waits for the close handshake to finish.
    async fn close_and_wait(mut self) {
        if let Some(close_tx) = self.close_tx.take() {
            let _ = close_tx.send(());
        }
        if timeout(CLOSE_TIMEOUT + Duration::from_secs(1), &mut self.task)
            .await
            .is_err()
        {
            warn!(epoch = self.epoch, "socket task did not stop in time; aborting");
            self.task.abort();
        }
    }
}

impl Drop for SocketHandle {
    fn drop(&mut self) {
        // Handles dropped without `close` (teardown, abort) take the socket down hard.
        if self.close_tx.is_some() {
            self.task.abort();
        }
    }
}

struct Lifecycle<S> {
    store: Arc<S>,
    endpoint: Url,
    snapshot: ConnectionSnapshot,
    socket: Option<SocketHandle>,
    next_epoch: u64,
    event_tx: mpsc::UnboundedSender<SocketEvent>,
    snapshot_tx: watch::Sender<ConnectionSnapshot>,
    signal_tx: mpsc::UnboundedSender<SessionSignal>,
}

impl<S: SecretStore> Lifecycle<S> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<SocketEvent>,
    ) {
        self.connect().await;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Presence(presence)) => self.on_presence(presence).await,
                    Some(Command::Shutdown) | None => break,
                },
                Some(event) = events.recv() => self.on_socket_event(event).await,
            }
        }

        if let Some(socket) = self.socket.take() {
            info!(epoch = socket.epoch, "closing realtime channel for shutdown");
            socket.close_and_wait().await;
            self.apply(LifecycleEvent::ClosedLocally);
        }
        info!("connection manager stopped");
    }

    fn socket_live(&self) -> bool {
        self.socket.as_ref().is_some_and(|socket| !socket.is_finished())
    }

    async fn on_presence(&mut self, presence: AppPresence) {
        match presence_action(presence, self.snapshot.state, self.socket_live()) {
            PresenceAction::Connect => {
                info!(?presence, "foregrounded without a live socket; reconnecting");
                self.connect().await;
            }
            PresenceAction::Disconnect => {
                info!(?presence, "leaving foreground; closing socket");
                self.close_socket();
            }
            PresenceAction::Nothing => {
                debug!(?presence, state = %self.snapshot.state, "presence change needs no action");
            }
        }
    }

    async fn connect(&mut self) {
        if self.snapshot.state == ConnectionState::Unauthorized {
            debug!("session is unauthorized; not connecting");
            return;
        }

        // At most one socket: retire any previous one before opening another.
        if let Some(old) = self.socket.take() {
            old.close();
            self.apply(LifecycleEvent::ClosedLocally);
        }

        let credential = match self.store.get(ACCESS_CREDENTIAL_KEY).await {
            Ok(Some(credential)) => credential,
            Ok(None) => {
                info!("no access credential stored; login required");
                let _ = self.signal_tx.send(SessionSignal::LoginRequired);
                return;
            }
            Err(err) => {
                error!("failed to read access credential: {}", err);
                let _ = self
                    .signal_tx
                    .send(SessionSignal::StoreFailure(err.to_string()));
                return;
            }
        };

        self.next_epoch += 1;
        let epoch = self.next_epoch;
        info!(epoch, endpoint = %self.endpoint, "opening realtime channel");
        self.socket = Some(SocketHandle::open(
            epoch,
            self.endpoint.clone(),
            credential,
            self.event_tx.clone(),
        ));
        self.apply(LifecycleEvent::ConnectStarted);
    }

    fn close_socket(&mut self) {
        if let Some(socket) = self.socket.take() {
            info!(epoch = socket.epoch, "closing realtime channel");
            socket.close();
            self.apply(LifecycleEvent::ClosedLocally);
        }
    }

    async fn on_socket_event(&mut self, event: SocketEvent) {
        let current = self.socket.as_ref().map(|socket| socket.epoch);
        if current != Some(event.epoch) {
            debug!(epoch = event.epoch, ?current, "dropping event from a retired socket");
            return;
        }

        match event.kind {
            SocketEventKind::Opened => {
                info!(epoch = event.epoch, "realtime channel open; credential sent");
                self.apply(LifecycleEvent::Opened);
            }
            SocketEventKind::Frame(frame) => {
                let power = PowerState::from_frame(&frame);
                if power.as_str() != frame.trim() {
                    warn!(frame = %frame, "unrecognised power frame; treating as off");
                }
                self.snapshot.power = power;
                self.publish();
            }
            SocketEventKind::Error(err) => {
                warn!(epoch = event.epoch, "realtime channel error: {}", err);
                self.apply(LifecycleEvent::Error);
            }
            SocketEventKind::Closed { code } => {
                self.socket = None;
                warn!(epoch = event.epoch, ?code, "realtime channel closed");
                if classify_close(code).is_rejected() {
                    self.reject_session().await;
                }
                self.apply(LifecycleEvent::Closed { code });
            }
        }
    }

    async fn reject_session(&mut self) {
        warn!("credential rejected; purging stored credentials");
        if let Err(err) = purge_credentials(self.store.as_ref()).await {
            error!("failed to purge credentials: {}", err);
        }
        let _ = self.signal_tx.send(SessionSignal::LoginRequired);
    }

    fn apply(&mut self, event: LifecycleEvent) {
        let next = transition(self.snapshot.state, &event);
        if next != self.snapshot.state {
            debug!(from = %self.snapshot.state, to = %next, ?event, "connection state changed");
            self.snapshot.state = next;
            self.publish();
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot);
    }
}

async fn run_socket(
    epoch: u64,
    endpoint: Url,
    credential: String,
    events: mpsc::UnboundedSender<SocketEvent>,
    mut close_rx: oneshot::Receiver<()>,
) {
    let emit = |kind: SocketEventKind| {
        let _ = events.send(SocketEvent { epoch, kind });
    };

    let ws_stream = tokio::select! {
        _ = &mut close_rx => return,
        result = timeout(CONNECT_TIMEOUT, connect_async(endpoint.as_str())) => match result {
            Ok(Ok((ws_stream, _))) => ws_stream,
            Ok(Err(err)) => {
                emit(SocketEventKind::Error(format!("connect failed: {err}")));
                emit(SocketEventKind::Closed { code: None });
                return;
            }
            Err(_) => {
                emit(SocketEventKind::Error(format!(
                    "connect timed out after {:?}",
                    CONNECT_TIMEOUT
                )));
                emit(SocketEventKind::Closed { code: None });
                return;
            }
        },
    };

    let (mut ws_write, mut ws_read) = ws_stream.split();

    // The handshake is the first and only frame we ever send.
    if let Err(err) = ws_write.send(Message::Text(credential.into())).await {
        emit(SocketEventKind::Error(format!("handshake send failed: {err}")));
        emit(SocketEventKind::Closed { code: None });
        return;
    }
    emit(SocketEventKind::Opened);

    let mut close_code = None;
    loop {
        tokio::select! {
            _ = &mut close_rx => {
                if timeout(CLOSE_TIMEOUT, ws_write.close()).await.is_err() {
                    debug!(epoch, "close handshake timed out");
                }
                return;
            }
            next = ws_read.next() => match next {
                Some(Ok(Message::Text(text))) => emit(SocketEventKind::Frame(text.to_string())),
                Some(Ok(Message::Binary(data))) => {
                    emit(SocketEventKind::Frame(String::from_utf8_lossy(&data).into_owned()));
                }
                Some(Ok(Message::Close(frame))) => {
                    close_code = frame.map(|frame| u16::from(frame.code));
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    // After a close frame the transport usually errors out; that is not news.
                    if close_code.is_none() {
                        emit(SocketEventKind::Error(err.to_string()));
                    }
                    break;
                }
                None => break,
            },
        }
    }

    emit(SocketEventKind::Closed { code: close_code });
}

#[cfg(test)]
mod tests {
    use pumplink_core::REFRESH_CREDENTIAL_KEY;

    use super::*;
    use crate::secret_store::MemorySecretStore;

    struct Fixture {
        actor: Lifecycle<MemorySecretStore>,
        store: Arc<MemorySecretStore>,
        snapshots: watch::Receiver<ConnectionSnapshot>,
        signals: mpsc::UnboundedReceiver<SessionSignal>,
    }

    /// An actor that believes socket `epoch` is live, connected and reporting `on`.
    fn connected_actor(epoch: u64) -> Fixture {
        let store = Arc::new(MemorySecretStore::with_credentials("access", "refresh"));
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let (signal_tx, signals) = mpsc::unbounded_channel();
        let snapshot = ConnectionSnapshot {
            state: ConnectionState::Connected,
            power: PowerState::On,
        };
        let (snapshot_tx, snapshots) = watch::channel(snapshot);
        let (close_tx, _close_rx) = oneshot::channel();

        let actor = Lifecycle {
            store: Arc::clone(&store),
            endpoint: Url::parse("ws://127.0.0.1:9/ws").unwrap(),
            snapshot,
            socket: Some(SocketHandle {
                epoch,
                close_tx: Some(close_tx),
                task: tokio::spawn(std::future::pending()),
            }),
            next_epoch: epoch,
            event_tx,
            snapshot_tx,
            signal_tx,
        };
        Fixture {
            actor,
            store,
            snapshots,
            signals,
        }
    }

    fn stale(kind: SocketEventKind) -> SocketEvent {
        SocketEvent { epoch: 1, kind }
    }

    #[tokio::test]
    async fn events_from_a_retired_socket_are_ignored() {
        let mut fx = connected_actor(2);
        let before = fx.actor.snapshot;

        fx.actor.on_socket_event(stale(SocketEventKind::Frame("off".to_owned()))).await;
        fx.actor.on_socket_event(stale(SocketEventKind::Error("reset".to_owned()))).await;
        fx.actor.on_socket_event(stale(SocketEventKind::Opened)).await;
        fx.actor
            .on_socket_event(stale(SocketEventKind::Closed { code: Some(1008) }))
            .await;

        assert_eq!(fx.actor.snapshot, before);
        assert_eq!(fx.actor.socket.as_ref().map(|s| s.epoch), Some(2));
        assert!(!fx.snapshots.has_changed().unwrap());
        assert!(fx.signals.try_recv().is_err());
        assert!(fx.store.contains(ACCESS_CREDENTIAL_KEY));
        assert!(fx.store.contains(REFRESH_CREDENTIAL_KEY));
    }

    #[tokio::test]
    async fn events_from_the_current_socket_still_apply() {
        let mut fx = connected_actor(2);

        fx.actor
            .on_socket_event(SocketEvent {
                epoch: 2,
                kind: SocketEventKind::Frame("off".to_owned()),
            })
            .await;
        assert_eq!(fx.snapshots.borrow_and_update().power, PowerState::Off);

        fx.actor
            .on_socket_event(SocketEvent {
                epoch: 2,
                kind: SocketEventKind::Closed { code: Some(1001) },
            })
            .await;
        assert!(fx.actor.socket.is_none());
        assert_eq!(fx.actor.snapshot.state, ConnectionState::Disconnected);

        // With no socket at all, even the old epoch is dropped.
        fx.actor
            .on_socket_event(SocketEvent {
                epoch: 2,
                kind: SocketEventKind::Closed { code: Some(1008) },
            })
            .await;
        assert_eq!(fx.actor.snapshot.state, ConnectionState::Disconnected);
        assert!(fx.store.contains(ACCESS_CREDENTIAL_KEY));
        assert!(fx.signals.try_recv().is_err());
    }
}
