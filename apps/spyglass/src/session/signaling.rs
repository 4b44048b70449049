//! Persistent duplex channel to the coordination server.
//!
//! The channel connects in the background and exposes its open state
//! through a watch. Sends are best-effort: a message written while the
//! socket is not open is logged and dropped, and the negotiator retries
//! at its own pace. Inbound traffic is demultiplexed by `device_id`
//! through explicit subscriptions, so concurrent sessions on the same
//! channel never cross-talk. The channel never reconnects on its own;
//! reconnection policy belongs to the owner.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::protocol::{ClientEnvelope, ServerEnvelope};

type Subscriber = (u64, mpsc::UnboundedSender<ServerEnvelope>);

#[derive(Default)]
struct SubscriberMap {
    next_id: u64,
    entries: HashMap<String, Vec<Subscriber>>,
    /// Set once the socket task has ended (including a failed connect).
    /// Terminal: subscriptions taken out afterwards end immediately.
    closed: bool,
}

impl SubscriberMap {
    fn dispatch(&mut self, envelope: &ServerEnvelope) {
        let Some(subscribers) = self.entries.get_mut(envelope.device_id()) else {
            tracing::trace!(
                target = "signaling",
                device_id = envelope.device_id(),
                "no subscriber for inbound envelope"
            );
            return;
        };
        subscribers.retain(|(_, tx)| tx.send(envelope.clone()).is_ok());
    }

    fn close(&mut self) {
        self.closed = true;
        self.entries.clear();
    }
}

pub struct SignalingChannel {
    outbound: mpsc::UnboundedSender<ClientEnvelope>,
    open: Arc<watch::Sender<bool>>,
    subscribers: Arc<Mutex<SubscriberMap>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl SignalingChannel {
    /// Open a channel to `url`. Returns immediately; the WebSocket
    /// connects in the background and flips the open state when ready.
    /// A failed connect leaves the channel closed; it is not retried
    /// here.
    pub fn open(url: &str) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<ClientEnvelope>();
        let (open_tx, _) = watch::channel(false);
        let open = Arc::new(open_tx);
        let subscribers = Arc::new(Mutex::new(SubscriberMap::default()));

        let channel = Arc::new(Self {
            outbound: outbound_tx,
            open: open.clone(),
            subscribers: subscribers.clone(),
            tasks: StdMutex::new(Vec::new()),
        });

        let handle = tokio::spawn(run_socket(url.to_string(), outbound_rx, open, subscribers));
        if let Ok(mut guard) = channel.tasks.lock() {
            guard.push(handle);
        }

        channel
    }

    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    /// Observe open/closed transitions.
    pub fn watch_open(&self) -> watch::Receiver<bool> {
        self.open.subscribe()
    }

    /// Best-effort send. Dropped with a warning when the socket is not
    /// open; never an error.
    pub fn send(&self, envelope: ClientEnvelope) {
        if !self.is_open() {
            tracing::warn!(
                target = "signaling",
                device_id = envelope.device_id(),
                "channel not open; dropping outbound message"
            );
            return;
        }
        if self.outbound.send(envelope).is_err() {
            tracing::warn!(target = "signaling", "writer gone; dropping outbound message");
        }
    }

    /// True once the socket task has ended, whether it ever connected or
    /// not. A closed channel never reopens.
    pub fn is_closed(&self) -> bool {
        self.subscribers.lock().closed
    }

    /// Register for inbound envelopes addressed to `device_id`. Dropping
    /// the subscription detaches it. Subscribing to a closed channel
    /// yields a subscription that ends immediately.
    pub fn subscribe(&self, device_id: &str) -> SignalingSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut map = self.subscribers.lock();
            let id = map.next_id;
            map.next_id += 1;
            if !map.closed {
                map.entries
                    .entry(device_id.to_string())
                    .or_default()
                    .push((id, tx));
            }
            id
        };
        SignalingSubscription {
            device_id: device_id.to_string(),
            id,
            subscribers: self.subscribers.clone(),
            rx,
        }
    }

    /// Close the socket and wake every subscriber with end-of-stream.
    pub fn close(&self) {
        self.open.send_replace(false);
        self.subscribers.lock().close();
        if let Ok(mut tasks) = self.tasks.lock() {
            for handle in tasks.drain(..) {
                handle.abort();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn inject_inbound(&self, envelope: ServerEnvelope) {
        self.subscribers.lock().dispatch(&envelope);
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for handle in tasks.drain(..) {
                handle.abort();
            }
        }
    }
}

pub struct SignalingSubscription {
    device_id: String,
    id: u64,
    subscribers: Arc<Mutex<SubscriberMap>>,
    rx: mpsc::UnboundedReceiver<ServerEnvelope>,
}

impl SignalingSubscription {
    /// Next envelope addressed to this device, or None once the channel
    /// is closed.
    pub async fn recv(&mut self) -> Option<ServerEnvelope> {
        self.rx.recv().await
    }
}

impl Drop for SignalingSubscription {
    fn drop(&mut self) {
        let mut map = self.subscribers.lock();
        if let Some(entries) = map.entries.get_mut(&self.device_id) {
            entries.retain(|(id, _)| *id != self.id);
            if entries.is_empty() {
                map.entries.remove(&self.device_id);
            }
        }
    }
}

async fn run_socket(
    url: String,
    mut outbound_rx: mpsc::UnboundedReceiver<ClientEnvelope>,
    open: Arc<watch::Sender<bool>>,
    subscribers: Arc<Mutex<SubscriberMap>>,
) {
    match url::Url::parse(&url) {
        Ok(parsed) if matches!(parsed.scheme(), "ws" | "wss") => {}
        Ok(parsed) => {
            tracing::warn!(
                target = "signaling",
                url = %url,
                scheme = parsed.scheme(),
                "refusing non-websocket url"
            );
            subscribers.lock().close();
            return;
        }
        Err(err) => {
            tracing::warn!(target = "signaling", url = %url, error = %err, "invalid server url");
            subscribers.lock().close();
            return;
        }
    }

    let (ws_stream, _) = match connect_async(url.as_str()).await {
        Ok(ok) => ok,
        Err(err) => {
            tracing::warn!(target = "signaling", url = %url, error = %err, "websocket connect failed");
            // A channel that never opened still has to wake its
            // subscribers with end-of-stream.
            subscribers.lock().close();
            return;
        }
    };
    tracing::debug!(target = "signaling", url = %url, "websocket connected");
    let (mut ws_write, mut ws_read) = ws_stream.split();
    // send_replace: the flag must flip even when nobody holds a receiver.
    open.send_replace(true);

    let writer = tokio::spawn(async move {
        while let Some(envelope) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&envelope) {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!(target = "signaling", error = %err, "failed to serialize envelope");
                    continue;
                }
            };
            if ws_write.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = ws_read.next().await {
        match message {
            Ok(Message::Text(text)) => handle_inbound(&subscribers, text.as_ref()),
            Ok(Message::Binary(data)) => {
                if let Ok(text) = String::from_utf8(data.to_vec()) {
                    handle_inbound(&subscribers, &text);
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(target = "signaling", error = %err, "websocket error");
                break;
            }
        }
    }

    tracing::debug!(target = "signaling", "websocket closed");
    open.send_replace(false);
    // End-of-stream for every subscriber.
    subscribers.lock().close();
    writer.abort();
}

fn handle_inbound(subscribers: &Mutex<SubscriberMap>, text: &str) {
    match serde_json::from_str::<ServerEnvelope>(text) {
        Ok(envelope) => subscribers.lock().dispatch(&envelope),
        Err(err) => {
            tracing::trace!(target = "signaling", error = %err, "ignoring unrecognized message");
        }
    }
}
