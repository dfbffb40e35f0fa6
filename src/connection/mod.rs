//! `ConnectionCore`: the singleton-per-URI state machine that owns the
//! broker connection, drives the reconnection loop, and re-runs channel
//! topology setup after a reconnect. Grounded on `fc-queue::activemq`'s
//! connect/reconnect shape (`ActiveMqConsumer::connect`/`reconnect`), scaled
//! up to a full state machine with backoff, an event bus, and a
//! leak-preventing connect timeout (`SPEC_FULL.md` §4.5).

mod registry;
mod state;
mod watchdog;

pub use registry::ConnectionRegistry;
pub use state::ConnectionState;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use lapin::{Channel, Connection, ConnectionProperties};
use tokio::sync::{watch, Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::backoff::full_jitter_delay;
use crate::classify::ErrorClass;
use crate::config::ConnectionOptions;
use crate::error::ConnectionError;
use crate::events::{ConnectionEvent, EventBus};

pub type SetupResult = Result<(), ConnectionError>;
pub type SetupFn = Arc<dyn Fn(Channel) -> Pin<Box<dyn Future<Output = SetupResult> + Send>> + Send + Sync>;

/// One entry in the channel registry: the live channel (or `None` once lost)
/// plus the idempotent setup closure that rebuilds its topology.
pub(crate) struct RegisteredChannel {
    channel: RwLock<Option<Channel>>,
    setup: Option<SetupFn>,
    watchdog_attempt: AtomicU32,
}

/// Resolution of the most recent connect attempt, broadcast to every caller
/// concurrently blocked in `get_connection` while the state is `Connecting`
/// or `Reconnecting`. Replaced atomically on every transition into
/// `Connecting`.
#[derive(Clone)]
enum ConnectOutcome {
    Pending,
    Ready(Result<(), String>),
}

pub struct ConnectionCore {
    uri: String,
    options: ConnectionOptions,
    state: RwLock<ConnectionState>,
    connection: RwLock<Option<Connection>>,
    attempt: AtomicU32,
    closing: AtomicBool,
    channels: DashMap<u64, Arc<RegisteredChannel>>,
    next_channel_id: AtomicU64,
    events: EventBus,
    gate_tx: watch::Sender<ConnectOutcome>,
    reconnect_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl ConnectionCore {
    fn new(uri: String, options: ConnectionOptions) -> Arc<Self> {
        let (gate_tx, _rx) = watch::channel(ConnectOutcome::Ready(Ok(())));
        Arc::new(Self {
            uri,
            options,
            state: RwLock::new(ConnectionState::Disconnected),
            connection: RwLock::new(None),
            attempt: AtomicU32::new(0),
            closing: AtomicBool::new(false),
            channels: DashMap::new(),
            next_channel_id: AtomicU64::new(0),
            events: EventBus::new(),
            gate_tx,
            reconnect_task: AsyncMutex::new(None),
        })
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Waits until the connection is `Connected` and returns a cloned handle,
    /// or fails terminally. Returns immediately if already connected.
    pub async fn get_connection(self: &Arc<Self>) -> Result<Connection, ConnectionError> {
        loop {
            let current = *self.state.read().await;
            match current {
                ConnectionState::Connected => {
                    if let Some(conn) = self.connection.read().await.clone() {
                        return Ok(conn);
                    }
                    // State says connected but the handle raced a disconnect;
                    // loop to observe the corrected state.
                    continue;
                }
                ConnectionState::Disconnected => {
                    // Try to become the owner of this attempt.
                    let became_owner = {
                        let mut guard = self.state.write().await;
                        if *guard == ConnectionState::Disconnected {
                            *guard = ConnectionState::Connecting;
                            true
                        } else {
                            false
                        }
                    };

                    if became_owner {
                        self.gate_tx.send_replace(ConnectOutcome::Pending);
                        return self.attempt_initial_connect().await;
                    }
                    // Lost the race; fall through to wait on the gate.
                }
                ConnectionState::Connecting | ConnectionState::Reconnecting => {}
            }

            self.await_gate().await?;
        }
    }

    async fn await_gate(&self) -> Result<(), ConnectionError> {
        let mut rx = self.gate_tx.subscribe();
        loop {
            {
                let outcome = rx.borrow_and_update().clone();
                if let ConnectOutcome::Ready(result) = outcome {
                    return result.map_err(ConnectionError::Connect);
                }
            }
            if rx.changed().await.is_err() {
                return Err(ConnectionError::Closing);
            }
        }
    }

    /// The first connect attempt performed directly by the calling task
    /// (the state-machine table's `Disconnected --get_connection--> Connecting`
    /// row). A failure here either propagates (terminal, or reconnect
    /// disabled) or hands off to the background reconnect loop.
    async fn attempt_initial_connect(self: &Arc<Self>) -> Result<(), ConnectionError> {
        match self.connect_with_timeout().await {
            Ok(conn) => {
                self.on_connected(conn).await;
                self.gate_tx.send_replace(ConnectOutcome::Ready(Ok(())));
                Ok(())
            }
            Err(err) => {
                let class = classify_error(&err);
                self.events.emit(ConnectionEvent::Error {
                    message: err.to_string(),
                });

                if class == ErrorClass::Terminal || !self.options.reconnect.enabled {
                    *self.state.write().await = ConnectionState::Disconnected;
                    self.gate_tx
                        .send_replace(ConnectOutcome::Ready(Err(err.to_string())));
                    return Err(err);
                }

                *self.state.write().await = ConnectionState::Reconnecting;
                self.spawn_reconnect_loop().await;
                self.await_gate().await
            }
        }
    }

    /// Races `Connection::connect_uri` against `connect_timeout_ms`. If the
    /// timer wins, the underlying connect is detached onto its own task so
    /// that a late success still gets closed instead of leaking a socket.
    async fn connect_with_timeout(&self) -> Result<Connection, ConnectionError> {
        let uri = self.parsed_uri()?;
        let timeout = self.options.reconnect.connect_timeout();
        let timeout_ms = self.options.reconnect.connect_timeout_ms;

        let connect_handle: JoinHandle<Result<Connection, lapin::Error>> = tokio::spawn(async move {
            let props = ConnectionProperties::default().with_connection_name("fc-amqp-broker".into());
            Connection::connect_uri(uri, props).await
        });

        tokio::select! {
            biased;
            result = connect_handle => {
                match result {
                    Ok(Ok(conn)) => Ok(conn),
                    Ok(Err(e)) => Err(ConnectionError::from(e)),
                    Err(join_err) => Err(ConnectionError::Connect(join_err.to_string())),
                }
            }
            _ = tokio::time::sleep(timeout) => {
                tokio::spawn(async move {
                    match connect_handle.await {
                        Ok(Ok(conn)) => {
                            debug!("connect resolved after its timeout fired; closing the late connection");
                            let _ = conn.close(200, "late connect after timeout").await;
                        }
                        Ok(Err(e)) => debug!(error = %e, "late connect failed after timeout; discarding"),
                        Err(e) => debug!(error = %e, "late connect task failed after timeout; discarding"),
                    }
                });
                Err(ConnectionError::Timeout(timeout_ms))
            }
        }
    }

    /// Parses `self.uri`, overlaying `options.heartbeat_secs` onto the
    /// negotiated heartbeat so it takes effect regardless of whether the
    /// URI itself carries a `heartbeat` query parameter.
    fn parsed_uri(&self) -> Result<lapin::uri::AMQPUri, ConnectionError> {
        let mut uri: lapin::uri::AMQPUri = self
            .uri
            .parse()
            .map_err(|e| ConnectionError::Connect(format!("invalid AMQP URI: {e}")))?;
        uri.query.heartbeat = Some(self.options.heartbeat_secs);
        Ok(uri)
    }

    async fn on_connected(self: &Arc<Self>, conn: Connection) {
        self.install_connection_watcher(&conn);
        *self.connection.write().await = Some(conn);
        *self.state.write().await = ConnectionState::Connected;
        self.attempt.store(0, Ordering::SeqCst);
        self.events.emit(ConnectionEvent::Connected);
    }

    /// Installs a connection-level error/close callback so a broker-initiated
    /// drop (not just a failed initial connect) triggers the reconnect loop.
    /// Scenario: the broker is killed out from under an established
    /// connection — without this, `state` would stay `Connected` forever and
    /// every channel watchdog's `recover_channel` would see a connected state
    /// and keep futilely trying to open channels on a dead connection.
    fn install_connection_watcher(self: &Arc<Self>, conn: &Connection) {
        let this = self.clone();
        conn.on_error(move |err| {
            let this = this.clone();
            let message = err.to_string();
            tokio::spawn(async move {
                this.handle_connection_drop(message).await;
            });
        });
    }

    async fn handle_connection_drop(self: &Arc<Self>, message: String) {
        if self.is_closing() {
            return;
        }

        let became_owner = {
            let mut guard = self.state.write().await;
            if *guard == ConnectionState::Connected {
                *guard = ConnectionState::Reconnecting;
                true
            } else {
                false
            }
        };
        if !became_owner {
            return;
        }

        *self.connection.write().await = None;
        for entry in self.channels.iter() {
            *entry.value().channel.write().await = None;
        }

        warn!(error = %message, "connection dropped, reconnecting");
        self.events.emit(ConnectionEvent::Disconnected { error: Some(message) });
        self.gate_tx.send_replace(ConnectOutcome::Pending);
        self.spawn_reconnect_loop().await;
    }

    async fn spawn_reconnect_loop(self: &Arc<Self>) {
        let this = self.clone();
        let mut guard = self.reconnect_task.lock().await;
        if guard.is_some() {
            return;
        }
        *guard = Some(tokio::spawn(async move { this.reconnect_loop().await }));
    }

    async fn reconnect_loop(self: Arc<Self>) {
        loop {
            if self.closing.load(Ordering::SeqCst) {
                return;
            }

            let attempt = self.attempt.fetch_add(1, Ordering::SeqCst);
            let delay = full_jitter_delay(attempt, &self.options.reconnect);
            self.events.emit(ConnectionEvent::Reconnecting {
                attempt: attempt + 1,
                delay_ms: delay.as_millis() as u64,
            });
            tokio::time::sleep(delay).await;

            if self.closing.load(Ordering::SeqCst) {
                return;
            }

            match self.connect_with_timeout().await {
                Ok(conn) => {
                    self.on_connected(conn).await;
                    self.rerun_all_channel_setups().await;
                    self.events.emit(ConnectionEvent::Reconnected);
                    self.gate_tx.send_replace(ConnectOutcome::Ready(Ok(())));
                    *self.reconnect_task.lock().await = None;
                    return;
                }
                Err(err) => {
                    let class = classify_error(&err);
                    if class == ErrorClass::Terminal {
                        *self.state.write().await = ConnectionState::Disconnected;
                        self.events.emit(ConnectionEvent::Error {
                            message: err.to_string(),
                        });
                        self.gate_tx
                            .send_replace(ConnectOutcome::Ready(Err(err.to_string())));
                        *self.reconnect_task.lock().await = None;
                        return;
                    }

                    let exhausted = self
                        .options
                        .reconnect
                        .max_attempts
                        .map(|max| attempt + 1 >= max)
                        .unwrap_or(false);

                    if exhausted {
                        *self.state.write().await = ConnectionState::Disconnected;
                        self.events.emit(ConnectionEvent::Error {
                            message: ConnectionError::MaxReconnectAttempts(attempt + 1).to_string(),
                        });
                        self.gate_tx
                            .send_replace(ConnectOutcome::Ready(Err(err.to_string())));
                        *self.reconnect_task.lock().await = None;
                        return;
                    }

                    warn!(attempt = attempt + 1, error = %err, "reconnect attempt failed, retrying");
                }
            }
        }
    }

    async fn rerun_all_channel_setups(self: &Arc<Self>) {
        let conn = self.connection.read().await.clone();
        let Some(conn) = conn else { return };

        for entry in self.channels.iter() {
            let registered = entry.value().clone();
            match conn.create_channel().await {
                Ok(channel) => {
                    watchdog::install(self, entry.key().clone(), channel.clone());
                    if let Some(setup) = &registered.setup {
                        if let Err(e) = setup(channel.clone()).await {
                            error!(channel = *entry.key(), error = %e, "channel setup failed after reconnect");
                        }
                    }
                    *registered.channel.write().await = Some(channel);
                    registered.watchdog_attempt.store(0, Ordering::SeqCst);
                }
                Err(e) => {
                    error!(channel = *entry.key(), error = %e, "failed to open replacement channel after reconnect");
                    *registered.channel.write().await = None;
                }
            }
        }
    }

    /// Opens a new channel, runs `setup` once, and registers the pair. The
    /// same `setup` re-runs automatically after every subsequent reconnect.
    pub async fn create_channel(
        self: &Arc<Self>,
        setup: Option<SetupFn>,
    ) -> Result<(u64, Channel), ConnectionError> {
        let conn = self.get_connection().await?;
        let channel = conn.create_channel().await.map_err(ConnectionError::from)?;

        if let Some(setup) = &setup {
            setup(channel.clone()).await?;
        }

        let id = self.next_channel_id.fetch_add(1, Ordering::SeqCst);
        let registered = Arc::new(RegisteredChannel {
            channel: RwLock::new(Some(channel.clone())),
            setup,
            watchdog_attempt: AtomicU32::new(0),
        });
        watchdog::install(self, id, channel.clone());
        self.channels.insert(id, registered);

        Ok((id, channel))
    }

    pub fn unregister_channel(&self, id: u64) {
        self.channels.remove(&id);
    }

    pub async fn close(self: &Arc<Self>) {
        self.closing.store(true, Ordering::SeqCst);

        if let Some(handle) = self.reconnect_task.lock().await.take() {
            handle.abort();
        }

        for entry in self.channels.iter() {
            if let Some(channel) = entry.value().channel.write().await.take() {
                let _ = channel.close(200, "client shutdown").await;
            }
        }
        self.channels.clear();

        if let Some(conn) = self.connection.write().await.take() {
            let _ = conn.close(200, "client shutdown").await;
        }

        *self.state.write().await = ConnectionState::Disconnected;
        self.gate_tx
            .send_replace(ConnectOutcome::Ready(Err("connection closed".to_string())));
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub(crate) async fn state_is_connected_and_open(&self) -> bool {
        !self.is_closing() && *self.state.read().await == ConnectionState::Connected
    }

    pub(crate) fn connection_handle(&self) -> &RwLock<Option<Connection>> {
        &self.connection
    }

    pub(crate) fn channel_entry(&self, id: u64) -> Option<Arc<RegisteredChannel>> {
        self.channels.get(&id).map(|e| e.value().clone())
    }

    /// Clones out the live `Channel` handle for a registered channel id, if
    /// one is currently open.
    pub(crate) async fn channel_handle(&self, id: u64) -> Option<Channel> {
        let registered = self.channel_entry(id)?;
        registered.channel.read().await.clone()
    }

    pub(crate) fn reconnect_policy(&self) -> &crate::config::ReconnectPolicy {
        &self.options.reconnect
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

fn classify_error(err: &ConnectionError) -> ErrorClass {
    match err {
        ConnectionError::Timeout(_) => ErrorClass::Recoverable,
        ConnectionError::Auth(_) | ConnectionError::Precondition(_) => ErrorClass::Terminal,
        ConnectionError::Connect(msg) | ConnectionError::Channel(msg) => {
            crate::classify::classify(None, msg)
        }
        ConnectionError::MaxReconnectAttempts(_) | ConnectionError::Closing => {
            ErrorClass::Recoverable
        }
    }
}
