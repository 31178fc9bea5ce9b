//! Async channel client over one WebSocket.
//!
//! [`ChannelClient`] is a cheap, cloneable handle. Every clone shares one
//! [`Registry`] and one background socket task. The task owns the socket and
//! does four things in a `tokio::select!` loop: write queued frames, route
//! inbound frames, send keepalive `PING`s and react to connect/close
//! requests.
//!
//! # Reconnection
//!
//! A server-side close (or a failed connect) schedules exactly one
//! reconnect after [`ClientOptions::reconnect_timeout`]. A caller-side
//! [`ChannelClient::close`] never reconnects: it bumps the registry
//! generation, so a connect that was already in flight is discarded when it
//! completes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::time::{Interval, MissedTickBehavior};

use super::protocol::{Command, RequestParams};
use super::registry::{Delivery, Registry};
use super::{ChannelError, ConnectionState, ErrorListener, Listener};
use crate::constants::{PING_INTERVAL, RECONNECT_TIMEOUT};
use crate::ws::{self, WsMessage, WsReader, WsWriter};

/// Hook run every time a connection opens.
///
/// The returned lines (control state such as `PROJECTION` and `BBOX`) are
/// the first frames of the connection, ahead of the messages queued while
/// it was opening and of the subscription replay. The hook runs while the
/// client is locked and must not call back into it.
pub type OnOpen = Arc<dyn Fn() -> Vec<String> + Send + Sync>;

/// Timing options of a channel client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Keepalive interval. Zero disables `PING`.
    pub ping_interval: Duration,
    /// Delay before reconnecting after the server closed the socket.
    pub reconnect_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            ping_interval: PING_INTERVAL,
            reconnect_timeout: RECONNECT_TIMEOUT,
        }
    }
}

#[derive(Debug)]
enum Control {
    Connect { url: String, generation: u64 },
    Close,
}

struct Shared {
    registry: Mutex<Registry>,
    wake: Notify,
    url: Mutex<Option<String>>,
    on_open: Mutex<Option<OnOpen>>,
    closed_by_caller: AtomicBool,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().expect("registry lock poisoned")
    }

    fn update<R>(&self, f: impl FnOnce(&mut Registry) -> R) -> R {
        let result = f(&mut self.registry());
        self.wake.notify_one();
        result
    }

    fn is_current(&self, generation: u64) -> bool {
        self.registry().generation() == generation
            && !self.closed_by_caller.load(Ordering::SeqCst)
    }

    /// Socket opened. Returns `false` if this connection was superseded.
    fn open(&self, generation: u64) -> bool {
        let hook = self.on_open.lock().expect("on_open lock poisoned").clone();
        self.update(|registry| {
            if registry.generation() != generation
                || self.closed_by_caller.load(Ordering::SeqCst)
            {
                return false;
            }
            // Under the registry lock: a setter racing with the open either
            // lands in the greeting or is sent after it.
            let control = hook.map(|hook| hook()).unwrap_or_default();
            registry.mark_open(control);
            registry.resubscribe_all();
            true
        })
    }

    /// Connection failed or closed remotely. Returns `true` if a reconnect
    /// should be scheduled.
    fn lose_connection(&self, generation: u64, err: &ChannelError) -> bool {
        let deliveries = {
            let mut registry = self.registry();
            if registry.generation() != generation {
                return false;
            }
            registry.connection_lost(err)
        };
        run(deliveries);
        !self.closed_by_caller.load(Ordering::SeqCst)
    }

    fn current_url(&self) -> Option<String> {
        self.url.lock().expect("url lock poisoned").clone()
    }
}

fn run(deliveries: Vec<Delivery>) {
    for delivery in deliveries {
        delivery.run();
    }
}

/// Handle to a realtime channel connection.
///
/// Must be created inside a tokio runtime; the socket task is spawned on
/// construction and exits once every handle is dropped.
#[derive(Clone)]
pub struct ChannelClient {
    shared: Arc<Shared>,
    control_tx: mpsc::UnboundedSender<Control>,
}

impl std::fmt::Debug for ChannelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelClient")
            .field("url", &self.shared.current_url())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Default for ChannelClient {
    fn default() -> Self {
        Self::new(ClientOptions::default())
    }
}

impl ChannelClient {
    /// Create a disconnected client and spawn its socket task.
    #[must_use]
    pub fn new(options: ClientOptions) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            registry: Mutex::new(Registry::new()),
            wake: Notify::new(),
            url: Mutex::new(None),
            on_open: Mutex::new(None),
            closed_by_caller: AtomicBool::new(false),
        });

        tokio::spawn(run_socket_loop(Arc::clone(&shared), options, control_rx));

        Self { shared, control_tx }
    }

    /// Connect to `url`, replacing any previous connection.
    ///
    /// `on_open` runs once per opened connection, right before every
    /// subscription is replayed. If the client is already open on the same
    /// URL, `on_open` and the replay run immediately instead.
    pub fn connect(&self, url: &str, on_open: Option<OnOpen>) {
        let already_open = self.shared.current_url().as_deref() == Some(url)
            && self.state() == ConnectionState::Open;

        *self.shared.on_open.lock().expect("on_open lock poisoned") = on_open.clone();

        if already_open {
            log::debug!("[Channel] Already connected, replaying subscriptions");
            let control = on_open.map(|hook| hook()).unwrap_or_default();
            self.shared.update(|registry| {
                for line in control {
                    registry.send(line);
                }
                registry.resubscribe_all();
            });
            return;
        }

        self.shared.closed_by_caller.store(false, Ordering::SeqCst);
        // URL and generation change together so a pending reconnect never
        // pairs the new generation with the old URL.
        let (dropped, generation) = self.shared.update(|registry| {
            *self.shared.url.lock().expect("url lock poisoned") = Some(url.to_string());
            let dropped = registry.begin_connect();
            (dropped, registry.generation())
        });
        run(dropped);

        if self
            .control_tx
            .send(Control::Connect {
                url: url.to_string(),
                generation,
            })
            .is_err()
        {
            log::warn!("[Channel] Socket task is gone, cannot connect");
        }
    }

    /// Close the connection for good.
    ///
    /// Keepalive stops, queued messages are discarded and no reconnect is
    /// attempted until [`Self::connect`] is called again.
    pub fn close(&self) {
        self.shared.closed_by_caller.store(true, Ordering::SeqCst);
        self.shared.registry().mark_closed();
        let _ = self.control_tx.send(Control::Close);
    }

    /// Whether the client wants a connection: [`Self::connect`] was called
    /// and [`Self::close`] was not. True during the reconnect delay after a
    /// lost connection, when the state is [`ConnectionState::Disconnected`].
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.shared.closed_by_caller.load(Ordering::SeqCst) && self.shared.current_url().is_some()
    }

    /// Send a raw protocol line (queued until the socket opens).
    pub fn send(&self, message: impl Into<String>) {
        let message = message.into();
        self.shared.update(|registry| registry.send(message));
    }

    /// One-shot request; `listener` fires at most once.
    pub fn get(&self, params: RequestParams, listener: Listener, on_error: Option<ErrorListener>) {
        self.shared
            .update(|registry| registry.get(params, listener, on_error));
    }

    /// Register `listener` for a channel. See [`Registry::subscribe`].
    pub fn subscribe(
        &self,
        params: RequestParams,
        listener: Listener,
        on_error: Option<ErrorListener>,
        quiet: bool,
    ) {
        self.shared
            .update(|registry| registry.subscribe(params, listener, on_error, quiet));
    }

    /// Remove listeners of a channel. See [`Registry::unsubscribe`].
    pub fn unsubscribe(&self, channel_key: &str, listener: Option<&Listener>) {
        self.shared
            .update(|registry| registry.unsubscribe(channel_key, listener));
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.registry().state()
    }

    /// Whether the socket is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// URL of the current (or last) connection.
    #[must_use]
    pub fn url(&self) -> Option<String> {
        self.shared.current_url()
    }

    /// Number of listeners registered for a channel key.
    #[must_use]
    pub fn listener_count(&self, channel_key: &str) -> usize {
        self.shared.registry().listener_count(channel_key)
    }
}

/// How a single connection ended.
enum LoopExit {
    /// Caller closed.
    Closed,
    /// Caller asked for a different connection.
    Reconnect(String, u64),
    /// Socket failed or the server closed it.
    Lost(ChannelError),
    /// Every client handle was dropped.
    Shutdown,
}

/// What to do after a lost connection.
enum Retry {
    Connect(String, u64),
    Idle,
    Shutdown,
}

/// Owns the socket for the lifetime of the client.
async fn run_socket_loop(
    shared: Arc<Shared>,
    options: ClientOptions,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
) {
    let mut next: Option<(String, u64)> = None;

    loop {
        let (url, generation) = match next.take() {
            Some(target) => target,
            None => match control_rx.recv().await {
                Some(Control::Connect { url, generation }) => (url, generation),
                Some(Control::Close) => continue,
                None => {
                    log::debug!("[Channel] All handles dropped, socket task exiting");
                    return;
                }
            },
        };

        if !shared.is_current(generation) {
            log::trace!("[Channel] Skipping superseded connect to {}", redact_key(&url));
            continue;
        }

        log::info!("[Channel] Connecting to {}", redact_key(&url));
        let (mut writer, mut reader) = match ws::connect(&url).await {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("[Channel] Connection failed: {:#}", e);
                let err = ChannelError::ConnectionFailed(e.to_string());
                if shared.lose_connection(generation, &err) {
                    match wait_before_reconnect(&shared, &options, &mut control_rx).await {
                        Retry::Connect(url, generation) => next = Some((url, generation)),
                        Retry::Idle => {}
                        Retry::Shutdown => return,
                    }
                }
                continue;
            }
        };

        if !shared.open(generation) {
            log::debug!("[Channel] Connection superseded before open, dropping it");
            let _ = writer.close().await;
            continue;
        }
        log::info!("[Channel] Connected");

        let exit =
            run_message_loop(&shared, &options, &mut writer, &mut reader, &mut control_rx).await;

        match exit {
            LoopExit::Closed => {
                log::info!("[Channel] Closed by caller");
                let _ = writer.close().await;
            }
            LoopExit::Reconnect(url, generation) => {
                log::debug!("[Channel] Switching connection");
                let _ = writer.close().await;
                next = Some((url, generation));
            }
            LoopExit::Lost(err) => {
                log::warn!("[Channel] Connection lost: {}", err);
                if shared.lose_connection(generation, &err) {
                    match wait_before_reconnect(&shared, &options, &mut control_rx).await {
                        Retry::Connect(url, generation) => next = Some((url, generation)),
                        Retry::Idle => {}
                        Retry::Shutdown => return,
                    }
                }
            }
            LoopExit::Shutdown => {
                let _ = writer.close().await;
                return;
            }
        }
    }
}

/// Wait out the reconnect delay unless the caller intervenes.
async fn wait_before_reconnect(
    shared: &Shared,
    options: &ClientOptions,
    control_rx: &mut mpsc::UnboundedReceiver<Control>,
) -> Retry {
    log::info!(
        "[Channel] Reconnecting in {}ms",
        options.reconnect_timeout.as_millis()
    );

    tokio::select! {
        () = tokio::time::sleep(options.reconnect_timeout) => {
            // Checked under the registry lock so a concurrent close() or
            // connect() wins.
            let next = shared.update(|registry| {
                if shared.closed_by_caller.load(Ordering::SeqCst) {
                    return None;
                }
                let url = shared.current_url()?;
                let dropped = registry.begin_connect();
                Some((url, dropped, registry.generation()))
            });
            match next {
                Some((url, dropped, generation)) => {
                    run(dropped);
                    Retry::Connect(url, generation)
                }
                None => Retry::Idle,
            }
        }
        ctrl = control_rx.recv() => match ctrl {
            Some(Control::Connect { url, generation }) => Retry::Connect(url, generation),
            Some(Control::Close) => Retry::Idle,
            None => Retry::Shutdown,
        }
    }
}

/// Serve one open connection until it ends.
async fn run_message_loop(
    shared: &Shared,
    options: &ClientOptions,
    writer: &mut WsWriter,
    reader: &mut WsReader,
    control_rx: &mut mpsc::UnboundedReceiver<Control>,
) -> LoopExit {
    let mut ping = keepalive(options.ping_interval);

    loop {
        let frames = shared.registry().take_outbox();
        for frame in frames {
            if let Err(e) = writer.send_text(&frame).await {
                return LoopExit::Lost(ChannelError::SendFailed(e.to_string()));
            }
            log::trace!("[Channel] >> {}", frame);
        }

        tokio::select! {
            () = shared.wake.notified() => {}

            msg = reader.recv() => match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    let deliveries = shared.registry().dispatch(&text);
                    run(deliveries);
                }
                Some(Ok(WsMessage::Ping(data))) => {
                    if let Err(e) = writer.send_pong(data).await {
                        return LoopExit::Lost(ChannelError::SendFailed(e.to_string()));
                    }
                }
                Some(Ok(WsMessage::Close { code, reason })) => {
                    log::info!("[Channel] Server closed the socket ({} {})", code, reason);
                    return LoopExit::Lost(ChannelError::Closed);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return LoopExit::Lost(ChannelError::ConnectionFailed(e.to_string()));
                }
                None => return LoopExit::Lost(ChannelError::Closed),
            },

            () = next_tick(&mut ping) => {
                shared.registry().send(Command::Ping.to_string());
            }

            ctrl = control_rx.recv() => match ctrl {
                Some(Control::Close) => return LoopExit::Closed,
                Some(Control::Connect { url, generation }) => {
                    if shared.is_current(generation) {
                        return LoopExit::Reconnect(url, generation);
                    }
                    log::trace!("[Channel] Ignoring superseded connect to {}", redact_key(&url));
                }
                None => return LoopExit::Shutdown,
            }
        }
    }
}

fn keepalive(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

async fn next_tick(ping: &mut Option<Interval>) {
    match ping {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Hide the API key when logging a URL.
fn redact_key(url: &str) -> String {
    match url.find("key=") {
        Some(idx) => {
            let end = url[idx..].find('&').map_or(url.len(), |e| idx + e);
            format!("{}key=***{}", &url[..idx], &url[end..])
        }
        None => url.to_string(),
    }
}
