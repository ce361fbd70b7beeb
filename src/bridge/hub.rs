use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, warn};

use crate::errors::BridgeError;

/// A frame received from the real-time channel.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub kind: String,
    pub payload: Value,
}

impl InboundMessage {
    /// Parse `{"type": ..., "payload"|"data": {...}}`. A frame with neither
    /// body key gets a `null` payload.
    pub fn parse(raw: &str) -> Result<Self, BridgeError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| BridgeError::InvalidFrame(e.to_string()))?;
        let Value::Object(mut obj) = value else {
            return Err(BridgeError::InvalidFrame("frame is not a JSON object".into()));
        };
        let kind = match obj.remove("type") {
            Some(Value::String(kind)) if !kind.is_empty() => kind,
            _ => return Err(BridgeError::InvalidFrame("missing \"type\"".into())),
        };
        let payload = obj
            .remove("payload")
            .or_else(|| obj.remove("data"))
            .unwrap_or(Value::Null);
        Ok(Self { kind, payload })
    }

    /// The normalized `{type, payload}` form.
    pub fn to_value(&self) -> Value {
        json!({ "type": self.kind, "payload": self.payload })
    }
}

type Callback = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Channel {
    Wildcard,
    Kind(String),
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    channels: HashMap<Channel, Vec<(u64, Callback)>>,
    /// Channels each live subscription is registered under.
    subscriptions: HashMap<u64, Vec<Channel>>,
}

impl Registry {
    fn remove(&mut self, id: u64) {
        let Some(channels) = self.subscriptions.remove(&id) else {
            return;
        };
        for channel in channels {
            if let Some(list) = self.channels.get_mut(&channel) {
                list.retain(|(sub_id, _)| *sub_id != id);
                if list.is_empty() {
                    self.channels.remove(&channel);
                }
            }
        }
    }
}

struct HubInner {
    registry: Mutex<Registry>,
    closed: AtomicBool,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// One shared real-time connection fanned out to any number of subscribers.
///
/// Cloning is cheap and every clone refers to the same registry.
#[derive(Clone)]
pub struct ClientHub {
    inner: Arc<HubInner>,
}

impl Default for ClientHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientHub {
    /// A hub with no transport attached; frames arrive through [`deliver`].
    ///
    /// [`deliver`]: ClientHub::deliver
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                registry: Mutex::new(Registry::default()),
                closed: AtomicBool::new(false),
                shutdown: Mutex::new(None),
                reader: Mutex::new(None),
            }),
        }
    }

    /// Open a WebSocket to `url` and start forwarding its text frames.
    pub async fn connect(url: &str) -> Result<Self, BridgeError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| BridgeError::Transport(e.to_string()))?;
        let (mut write, mut read) = stream.split();
        let hub = Self::new();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let weak: Weak<HubInner> = Arc::downgrade(&hub.inner);
        let url = url.to_string();

        let reader = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                    frame = read.next() => {
                        match frame {
                            Some(Ok(Message::Text(text))) => {
                                let Some(inner) = weak.upgrade() else { break };
                                let hub = ClientHub { inner };
                                if let Err(e) = hub.deliver(&text) {
                                    warn!(error = %e, "dropping malformed frame");
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                if write.send(Message::Pong(data)).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(error = %e, "websocket read failed");
                                break;
                            }
                        }
                    }
                }
            }
            debug!(%url, "hub reader stopped");
        });

        *hub.inner.shutdown.lock().unwrap_or_else(PoisonError::into_inner) = Some(shutdown_tx);
        *hub.inner.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(reader);
        Ok(hub)
    }

    /// Register `callback` for the given message kinds, or every kind when
    /// `filters` is empty. Duplicate kinds are registered once.
    pub fn subscribe<F>(&self, filters: &[String], callback: F) -> Result<Subscription, BridgeError>
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        if self.is_closed() {
            return Err(BridgeError::Closed);
        }
        let mut unique: Vec<Channel> = Vec::with_capacity(filters.len().max(1));
        if filters.is_empty() {
            unique.push(Channel::Wildcard);
        }
        for filter in filters {
            let channel = Channel::Kind(filter.clone());
            if !unique.contains(&channel) {
                unique.push(channel);
            }
        }

        let callback: Callback = Arc::new(callback);
        let mut registry = self.registry();
        registry.next_id += 1;
        let id = registry.next_id;
        for channel in &unique {
            registry
                .channels
                .entry(channel.clone())
                .or_default()
                .push((id, callback.clone()));
        }
        registry.subscriptions.insert(id, unique);
        debug!(id, "hub subscription added");

        Ok(Subscription {
            hub: Arc::downgrade(&self.inner),
            id,
        })
    }

    /// Parse a raw frame and hand it to matching subscribers.
    pub fn deliver(&self, raw: &str) -> Result<usize, BridgeError> {
        let msg = InboundMessage::parse(raw)?;
        Ok(self.dispatch(&msg))
    }

    /// Invoke every subscriber for `msg.kind` plus wildcard subscribers.
    /// Returns how many callbacks ran.
    pub fn dispatch(&self, msg: &InboundMessage) -> usize {
        if self.is_closed() {
            return 0;
        }
        let callbacks: Vec<Callback> = {
            let registry = self.registry();
            let specific = registry.channels.get(&Channel::Kind(msg.kind.clone()));
            let wildcard = registry.channels.get(&Channel::Wildcard);
            specific
                .into_iter()
                .chain(wildcard)
                .flat_map(|list| list.iter().map(|(_, cb)| cb.clone()))
                .collect()
        };
        for callback in &callbacks {
            callback(msg);
        }
        callbacks.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.registry().subscriptions.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Drop every subscription and stop the transport. Later subscribes fail.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut registry = self.registry();
            registry.channels.clear();
            registry.subscriptions.clear();
        }
        if let Some(tx) = self
            .inner
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = tx.send(());
        }
    }

    /// Close and wait for the reader task to finish.
    pub async fn shutdown(&self) {
        self.close();
        let reader = self
            .inner
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = reader {
            let _ = reader.await;
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Teardown handle for a hub registration. Dropping it unsubscribes.
#[must_use = "dropping the subscription unsubscribes immediately"]
pub struct Subscription {
    hub: Weak<HubInner>,
    id: u64,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.hub.upgrade() {
            inner
                .registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(self.id);
        }
    }
}
