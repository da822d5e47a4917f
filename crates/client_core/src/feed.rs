use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock,
    },
    time::Duration,
};

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::protocol::{FeedEvent, SeatUpdate, SEAT_REFRESH_TOPIC, SEAT_UPDATES_TOPIC};
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    config::Settings,
    stomp::{self, Command, Frame, HEARTBEAT_EOL},
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const UNMOUNT_GRACE: Duration = Duration::from_secs(2);
// A peer is considered gone after missing this many heartbeat intervals.
const HEARTBEAT_TOLERANCE: u32 = 2;
const SUBSCRIPTIONS: [(&str, &str); 2] = [
    ("sub-0", SEAT_UPDATES_TOPIC),
    ("sub-1", SEAT_REFRESH_TOPIC),
];

pub type FeedStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[async_trait]
pub trait FeedConnector: Send + Sync {
    async fn connect(&self, url: &Url) -> anyhow::Result<FeedStream>;
}

pub struct TungsteniteConnector;

#[async_trait]
impl FeedConnector for TungsteniteConnector {
    async fn connect(&self, url: &Url) -> anyhow::Result<FeedStream> {
        let (stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect seat feed: {url}"))?;
        Ok(stream)
    }
}

type SeatUpdateCallback = Arc<dyn Fn(SeatUpdate) + Send + Sync>;
type RefreshCallback = Arc<dyn Fn(u32) + Send + Sync>;

#[derive(Clone)]
pub struct FeedCallbacks {
    on_seat_update: SeatUpdateCallback,
    on_refresh: RefreshCallback,
}

impl FeedCallbacks {
    pub fn new<U, R>(on_seat_update: U, on_refresh: R) -> Self
    where
        U: Fn(SeatUpdate) + Send + Sync + 'static,
        R: Fn(u32) + Send + Sync + 'static,
    {
        Self {
            on_seat_update: Arc::new(on_seat_update),
            on_refresh: Arc::new(on_refresh),
        }
    }

    pub fn forwarding(tx: mpsc::UnboundedSender<FeedEvent>) -> Self {
        let refresh_tx = tx.clone();
        Self::new(
            move |update| {
                let _ = tx.send(FeedEvent::SeatUpdated(update));
            },
            move |released| {
                let _ = refresh_tx.send(FeedEvent::Refresh { released });
            },
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    Connecting,
    Connected,
    Reconnecting,
    Failed,
    Stopped,
}

pub struct SeatFeed {
    callbacks: Arc<RwLock<FeedCallbacks>>,
    mounted: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    status: watch::Receiver<FeedStatus>,
    task: Option<JoinHandle<()>>,
}

impl SeatFeed {
    pub fn mount(settings: &Settings, callbacks: FeedCallbacks) -> Self {
        Self::mount_with_connector(settings, callbacks, || TungsteniteConnector)
    }

    // `factory` runs inside the spawned task.
    pub fn mount_with_connector<C, F>(settings: &Settings, callbacks: FeedCallbacks, factory: F) -> Self
    where
        C: FeedConnector + 'static,
        F: FnOnce() -> C + Send + 'static,
    {
        let callbacks = Arc::new(RwLock::new(callbacks));
        let mounted = Arc::new(AtomicBool::new(true));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(FeedStatus::Connecting);

        let worker = FeedWorker {
            url: settings.feed_url(),
            reconnect_delay: settings.reconnect_delay,
            heartbeat_outgoing: settings.heartbeat_outgoing,
            heartbeat_incoming: settings.heartbeat_incoming,
            callbacks: Arc::clone(&callbacks),
            mounted: Arc::clone(&mounted),
            status: status_tx,
        };
        let task = tokio::spawn(async move {
            let connector = factory();
            worker.run(&connector, shutdown_rx).await;
        });

        Self {
            callbacks,
            mounted,
            shutdown: shutdown_tx,
            status: status_rx,
            task: Some(task),
        }
    }

    pub fn set_callbacks(&self, callbacks: FeedCallbacks) {
        *self
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner) = callbacks;
    }

    pub fn status(&self) -> watch::Receiver<FeedStatus> {
        self.status.clone()
    }

    pub fn current_status(&self) -> FeedStatus {
        *self.status.borrow()
    }

    pub async fn unmount(mut self) {
        self.signal_shutdown();
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(UNMOUNT_GRACE, &mut task).await.is_err() {
                warn!("feed: task did not stop in time, aborting");
                task.abort();
            }
        }
    }

    fn signal_shutdown(&self) {
        self.mounted.store(false, Ordering::SeqCst);
        self.shutdown.send_replace(true);
    }
}

impl Drop for SeatFeed {
    fn drop(&mut self) {
        self.signal_shutdown();
    }
}

enum SessionEnd {
    Shutdown,
    Lost(String),
}

struct OpenConnection {
    stream: FeedStream,
    send_every: Duration,
    expect_within: Duration,
}

struct FeedWorker {
    url: anyhow::Result<Url>,
    reconnect_delay: Duration,
    heartbeat_outgoing: Duration,
    heartbeat_incoming: Duration,
    callbacks: Arc<RwLock<FeedCallbacks>>,
    mounted: Arc<AtomicBool>,
    status: watch::Sender<FeedStatus>,
}

impl FeedWorker {
    async fn run(self, connector: &dyn FeedConnector, mut shutdown: watch::Receiver<bool>) {
        let url = match &self.url {
            Ok(url) => url.clone(),
            Err(err) => {
                error!("feed: cannot start: {err:#}");
                self.set_status(FeedStatus::Failed);
                return;
            }
        };

        let mut connected_once = false;
        loop {
            if !self.is_mounted() {
                break;
            }

            let attempt = tokio::select! {
                result = self.open(connector, &url) => result,
                _ = shutdown_requested(&mut shutdown) => break,
            };

            match attempt {
                Ok(conn) => {
                    if !self.is_mounted() {
                        debug!("feed: discarding connection opened after unmount");
                        let mut stream = conn.stream;
                        let _ = stream.close(None).await;
                        break;
                    }
                    connected_once = true;
                    match self.serve(conn, &mut shutdown).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost(reason) => {
                            warn!(%reason, "feed: connection lost");
                        }
                    }
                }
                Err(err) if !connected_once => {
                    error!(url = %url, "feed: initial connection failed: {err:#}");
                    self.set_status(FeedStatus::Failed);
                    return;
                }
                Err(err) => {
                    warn!(url = %url, "feed: reconnect attempt failed: {err:#}");
                }
            }

            self.set_status(FeedStatus::Reconnecting);
            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_delay) => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }

        self.set_status(FeedStatus::Stopped);
        info!("feed: stopped");
    }

    async fn open(&self, connector: &dyn FeedConnector, url: &Url) -> anyhow::Result<OpenConnection> {
        let mut stream = connector.connect(url).await?;
        let host = url.host_str().unwrap_or("localhost");
        stream
            .send(Message::Text(
                Frame::connect(host, self.heartbeat_outgoing, self.heartbeat_incoming).encode(),
            ))
            .await
            .context("failed to send STOMP CONNECT")?;

        let connected = tokio::time::timeout(HANDSHAKE_TIMEOUT, await_connected(&mut stream))
            .await
            .map_err(|_| anyhow!("STOMP handshake timed out"))??;

        let server_heartbeat = connected
            .get("heart-beat")
            .and_then(stomp::parse_heart_beat)
            .unwrap_or((0, 0));
        let (send_every, expect_within) = stomp::negotiate_heartbeat(
            self.heartbeat_outgoing,
            self.heartbeat_incoming,
            server_heartbeat,
        );
        debug!(
            send_every_ms = send_every.as_millis() as u64,
            expect_within_ms = expect_within.as_millis() as u64,
            "feed: STOMP session established"
        );

        Ok(OpenConnection {
            stream,
            send_every,
            expect_within,
        })
    }

    async fn serve(&self, conn: OpenConnection, shutdown: &mut watch::Receiver<bool>) -> SessionEnd {
        let (mut sink, mut reader) = conn.stream.split();

        for (id, topic) in SUBSCRIPTIONS {
            if let Err(err) = sink
                .send(Message::Text(Frame::subscribe(id, topic).encode()))
                .await
            {
                return SessionEnd::Lost(format!("subscribe to {topic} failed: {err}"));
            }
        }
        self.set_status(FeedStatus::Connected);
        info!("feed: connected and subscribed");

        let send_heartbeats = !conn.send_every.is_zero();
        let watch_incoming = !conn.expect_within.is_zero();
        let tick_period = if send_heartbeats {
            conn.send_every
        } else {
            Duration::from_secs(3600)
        };
        let mut heartbeat = tokio::time::interval_at(Instant::now() + tick_period, tick_period);
        let grace = conn.expect_within * HEARTBEAT_TOLERANCE;
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown_requested(shutdown) => {
                    let _ = sink.send(Message::Text(Frame::disconnect().encode())).await;
                    let _ = sink.close().await;
                    return SessionEnd::Shutdown;
                }
                _ = heartbeat.tick(), if send_heartbeats => {
                    if let Err(err) = sink.send(Message::Text(HEARTBEAT_EOL.to_string())).await {
                        return SessionEnd::Lost(format!("heartbeat send failed: {err}"));
                    }
                }
                _ = tokio::time::sleep_until(last_seen + grace), if watch_incoming => {
                    return SessionEnd::Lost(format!(
                        "no data from broker for {}ms",
                        grace.as_millis()
                    ));
                }
                msg = reader.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        self.handle_text(&text);
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        last_seen = Instant::now();
                        self.handle_text(&String::from_utf8_lossy(&bytes));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return SessionEnd::Lost(format!("closed by broker: {frame:?}"));
                    }
                    Some(Ok(_)) => last_seen = Instant::now(),
                    Some(Err(err)) => return SessionEnd::Lost(err.to_string()),
                    None => return SessionEnd::Lost("stream ended".to_string()),
                },
            }
        }
    }

    fn handle_text(&self, text: &str) {
        let frames = match stomp::decode(text) {
            Ok(frames) => frames,
            Err(err) => {
                warn!(%err, "feed: dropping undecodable STOMP data");
                return;
            }
        };
        for frame in frames {
            self.dispatch(frame);
        }
    }

    fn dispatch(&self, frame: Frame) {
        match frame.command {
            Command::Message => {
                if !self.is_mounted() {
                    return;
                }
                match topic_of(&frame) {
                    Some(SEAT_UPDATES_TOPIC) => {
                        match serde_json::from_str::<SeatUpdate>(&frame.body) {
                            Ok(update) => {
                                debug!(
                                    seat_id = update.seat_id.0,
                                    status = %update.state.status(),
                                    "feed: seat update"
                                );
                                let on_seat_update = self.callbacks().on_seat_update;
                                on_seat_update(update);
                            }
                            Err(err) => {
                                warn!(error = %err, body = %frame.body, "feed: malformed seat update");
                            }
                        }
                    }
                    Some(SEAT_REFRESH_TOPIC) => match serde_json::from_str::<u32>(frame.body.trim()) {
                        Ok(released) => {
                            debug!(released, "feed: seats released, refresh requested");
                            let on_refresh = self.callbacks().on_refresh;
                            on_refresh(released);
                        }
                        Err(err) => {
                            warn!(error = %err, body = %frame.body, "feed: malformed refresh signal");
                        }
                    },
                    other => debug!(destination = ?other, "feed: ignoring message"),
                }
            }
            Command::Error => {
                error!(
                    broker_message = frame.get("message").unwrap_or_default(),
                    body = %frame.body,
                    "feed: broker reported an error"
                );
            }
            Command::Receipt | Command::Connected => {}
            other => debug!(command = %other, "feed: unexpected frame"),
        }
    }

    fn callbacks(&self) -> FeedCallbacks {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    fn set_status(&self, status: FeedStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            debug!(?previous, ?status, "feed: status changed");
        }
    }
}

fn topic_of(frame: &Frame) -> Option<&str> {
    if let Some(destination) = frame.get("destination") {
        return Some(destination);
    }
    let subscription = frame.get("subscription")?;
    SUBSCRIPTIONS
        .iter()
        .find(|(id, _)| *id == subscription)
        .map(|(_, topic)| *topic)
}

async fn await_connected(stream: &mut FeedStream) -> anyhow::Result<Frame> {
    while let Some(msg) = stream.next().await {
        let text = match msg.context("seat feed closed during handshake")? {
            Message::Text(text) => text,
            Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Message::Close(frame) => bail!("broker closed during handshake: {frame:?}"),
            _ => continue,
        };
        for frame in stomp::decode(&text)? {
            match frame.command {
                Command::Connected => return Ok(frame),
                Command::Error => bail!(
                    "broker refused STOMP connection: {}",
                    frame.get("message").unwrap_or(frame.body.as_str())
                ),
                _ => {}
            }
        }
    }
    bail!("seat feed closed during handshake")
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
#[path = "tests/feed_tests.rs"]
mod tests;
