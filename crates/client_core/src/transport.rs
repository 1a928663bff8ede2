//! The one physical duplex connection per signed-in user.
//!
//! The session outlives any single view: UI surfaces come and go without
//! touching the socket, and only an explicit sign-out closes it.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use shared::{domain::UserId, protocol::ServerFrame};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{error, info, warn};
use url::Url;

use crate::{auth::TokenStore, error::ClientError, request::Correlator, router::PushRouter};

pub(crate) const RECONNECT_DELAY: Duration = Duration::from_secs(3);
pub(crate) const RECONNECT_ATTEMPTS: u32 = 5;
const OUTBOUND_QUEUE_CAPACITY: usize = 64;

pub struct Transport {
    server_url: String,
    tokens: Arc<dyn TokenStore>,
    pub(crate) correlator: Correlator,
    router: PushRouter,
    connected: AtomicBool,
    // Connect attempts are guarded by this flag rather than by inspecting
    // connection state, which transitions asynchronously.
    connecting: AtomicBool,
    inner: Mutex<TransportState>,
}

struct TransportState {
    user_id: Option<UserId>,
    outbound: Option<mpsc::Sender<Message>>,
    read_task: Option<JoinHandle<()>>,
    write_task: Option<JoinHandle<()>>,
    client_closed: bool,
}

impl Transport {
    pub fn new(
        server_url: impl Into<String>,
        tokens: Arc<dyn TokenStore>,
        router: PushRouter,
    ) -> Arc<Self> {
        Arc::new(Self {
            server_url: server_url.into(),
            tokens,
            correlator: Correlator::new(),
            router,
            connected: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            inner: Mutex::new(TransportState {
                user_id: None,
                outbound: None,
                read_task: None,
                write_task: None,
                client_closed: false,
            }),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn current_user(&self) -> Option<UserId> {
        self.inner.lock().await.user_id
    }

    /// Open the duplex channel for `user_id` and join that user's broadcast
    /// room. Idempotent: a second call while connected as the same user, or
    /// while another connect attempt is in flight, is a no-op. Connecting as
    /// a different user tears the previous session down first.
    pub async fn connect(self: &Arc<Self>, user_id: UserId) -> Result<(), ClientError> {
        if self.connecting.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.connect_inner(user_id).await;
        self.connecting.store(false, Ordering::SeqCst);
        result
    }

    /// Close the channel and clear the session identity. Explicit sign-out
    /// only; view teardown must never call this.
    pub async fn disconnect(&self) {
        let mut state = self.inner.lock().await;
        state.client_closed = true;
        state.user_id = None;
        self.teardown_locked(&mut state);
        info!("transport: disconnected");
    }

    pub(crate) async fn outbound(&self) -> Option<mpsc::Sender<Message>> {
        if !self.is_connected() {
            return None;
        }
        self.inner.lock().await.outbound.clone()
    }

    async fn connect_inner(self: &Arc<Self>, user_id: UserId) -> Result<(), ClientError> {
        {
            let mut state = self.inner.lock().await;
            if self.is_connected() {
                if state.user_id == Some(user_id) {
                    return Ok(());
                }
                info!(
                    previous_user_id = state.user_id.map(|id| id.0),
                    user_id = user_id.0,
                    "transport: switching user, tearing down previous session"
                );
                self.teardown_locked(&mut state);
            }
            state.client_closed = false;
            state.user_id = Some(user_id);
        }

        let ws_url = self.ws_url()?;
        let (stream, _) = connect_async(ws_url.as_str()).await.map_err(|err| {
            warn!(user_id = user_id.0, "transport: websocket connect failed: {err}");
            ClientError::Network(err.to_string())
        })?;
        let (mut writer, mut reader) = stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_CAPACITY);
        let write_task = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if writer.send(message).await.is_err() {
                    break;
                }
            }
            let _ = writer.close().await;
        });

        let client = Arc::clone(self);
        let read_task = tokio::spawn(async move {
            while let Some(message) = reader.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(ServerFrame::CallResult(result)) => {
                            client.correlator.complete(result).await;
                        }
                        Ok(ServerFrame::Event(push)) => client.router.publish(push),
                        Err(err) => warn!("transport: invalid server frame: {err}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("transport: websocket receive failed: {err}");
                        break;
                    }
                }
            }
            client.connected.store(false, Ordering::SeqCst);
            let client_closed = client.inner.lock().await.client_closed;
            if !client_closed {
                warn!(user_id = user_id.0, "transport: connection lost");
                client.spawn_reconnect(user_id);
            }
        });

        {
            let mut state = self.inner.lock().await;
            if state.client_closed {
                // Sign-out raced the dial; drop the fresh connection.
                read_task.abort();
                write_task.abort();
                return Err(ClientError::NotConnected);
            }
            state.outbound = Some(outbound_tx);
            state.read_task = Some(read_task);
            state.write_task = Some(write_task);
        }
        self.connected.store(true, Ordering::SeqCst);
        info!(user_id = user_id.0, "transport: connected");

        self.join_user_room(user_id).await?;
        Ok(())
    }

    fn teardown_locked(&self, state: &mut TransportState) {
        self.connected.store(false, Ordering::SeqCst);
        state.outbound = None;
        if let Some(task) = state.read_task.take() {
            task.abort();
        }
        if let Some(task) = state.write_task.take() {
            task.abort();
        }
    }

    // Fixed-delay bounded retry on non-client-initiated disconnects.
    fn spawn_reconnect(self: &Arc<Self>, user_id: UserId) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            for attempt in 1..=RECONNECT_ATTEMPTS {
                tokio::time::sleep(RECONNECT_DELAY).await;
                if client.inner.lock().await.client_closed {
                    return;
                }
                match client.connect(user_id).await {
                    Ok(()) if client.is_connected() => {
                        info!(attempt, user_id = user_id.0, "transport: reconnected");
                        return;
                    }
                    Ok(()) => {}
                    Err(err) => {
                        warn!(
                            attempt,
                            user_id = user_id.0,
                            "transport: reconnect attempt failed: {err}"
                        );
                    }
                }
            }
            error!(
                user_id = user_id.0,
                "transport: giving up after {RECONNECT_ATTEMPTS} reconnect attempts"
            );
        });
    }

    fn ws_url(&self) -> Result<Url, ClientError> {
        let base = if let Some(rest) = self.server_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.server_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(ClientError::Network(format!(
                "server url must start with http:// or https://: {}",
                self.server_url
            )));
        };

        let mut url = Url::parse(&format!("{}/ws", base.trim_end_matches('/')))
            .map_err(|err| ClientError::Network(err.to_string()))?;
        if let Some(token) = self.tokens.token() {
            url.query_pairs_mut().append_pair("token", &token);
        }
        Ok(url)
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
