// Outbox - per-service outbound delivery
//
// Owns the subscription table and the handoff to the remote transport.
// Adding a message fans it out synchronously to matching subscribers and
// enqueues it for asynchronous routed delivery by the outbox worker task.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::message::{next_msg_id, Message, MsgStatus};
use crate::registry::{RemoteTransport, ServiceRegistry};

/// A subscription: when the owning service emits under `topic_method`, a
/// synthesized message is delivered to `callback_name.callback_method`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    pub topic_method: String,
    pub callback_name: String,
    pub callback_method: String,
}

impl Listener {
    pub fn new(topic_method: &str, callback_name: &str, callback_method: &str) -> Self {
        Self {
            topic_method: topic_method.to_string(),
            callback_name: callback_name.to_string(),
            callback_method: callback_method.to_string(),
        }
    }
}

type SharedTransport = Arc<Mutex<Option<Arc<dyn RemoteTransport>>>>;

/// Per-service outbound mailbox.
pub struct Outbox {
    name: String,
    registry: Arc<dyn ServiceRegistry>,
    /// topic method -> listeners in registration order
    listeners: Mutex<HashMap<String, Vec<Listener>>>,
    tx: UnboundedSender<Message>,
    rx: Mutex<Option<UnboundedReceiver<Message>>>,
    transport: SharedTransport,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Outbox {
    pub fn new(name: &str, registry: Arc<dyn ServiceRegistry>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name: name.to_string(),
            registry,
            listeners: Mutex::new(HashMap::new()),
            tx,
            rx: Mutex::new(Some(rx)),
            transport: Arc::new(Mutex::new(None)),
            worker: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach the cross-process delivery collaborator. Routed messages are
    /// then additionally forwarded over it; local delivery is unaffected.
    pub fn attach_transport(&self, transport: Arc<dyn RemoteTransport>) {
        *self.transport.lock() = Some(transport);
    }

    /// Enqueue a message for delivery.
    ///
    /// Synchronously, within this call, the message is fanned out to every
    /// listener whose topic equals its target method: each match produces a
    /// new message (destination = subscriber, method = callback, args = the
    /// original args) placed straight into the subscriber's inbox.
    /// `Return` messages are exempt from fan-out. The original message
    /// itself is handed to the worker task for routed delivery.
    pub fn add(&self, msg: Message) {
        // A Return answers a blocking caller; it routes by name only and
        // never fans out, even when it carries a subscribed method's name.
        let matched: Vec<Listener> = if msg.status == MsgStatus::Return {
            Vec::new()
        } else {
            self.listeners
                .lock()
                .get(&msg.method)
                .cloned()
                .unwrap_or_default()
        };

        for listener in matched {
            let mut fanned = Message {
                name: listener.callback_name.clone(),
                sender: self.name.clone(),
                sending_method: msg.method.clone(),
                method: listener.callback_method.clone(),
                data: msg.data.clone(),
                msg_id: next_msg_id(),
                status: MsgStatus::OneWay,
                history: msg.history.clone(),
            };
            fanned.history.push(self.name.clone());
            match self.registry.locate(&listener.callback_name) {
                Some(inbox) => inbox.add(fanned),
                None => warn!(
                    "subscriber '{}' of {}.{} is not registered",
                    listener.callback_name, self.name, msg.method
                ),
            }
        }

        if self.tx.send(msg).is_err() {
            debug!("outbox of '{}' is stopped - dropping message", self.name);
        }
    }

    /// Register a subscription. An identical tuple under the same topic is
    /// a no-op; registration order is preserved for fan-out determinism.
    pub fn add_listener(&self, listener: Listener) {
        let mut table = self.listeners.lock();
        let entries = table.entry(listener.topic_method.clone()).or_default();
        if entries.contains(&listener) {
            warn!("attempting to add duplicate listener {:?}", listener);
            return;
        }
        info!(
            "adding listener {}.{} -> {}.{}",
            self.name, listener.topic_method, listener.callback_name, listener.callback_method
        );
        entries.push(listener);
    }

    /// Remove one subscription: the first entry under `topic_method` whose
    /// subscriber matches `callback_name` (not all of them).
    pub fn remove_listener(&self, topic_method: &str, callback_name: &str) {
        let mut table = self.listeners.lock();
        match table.get_mut(topic_method) {
            Some(entries) => {
                if let Some(pos) = entries.iter().position(|l| l.callback_name == callback_name) {
                    entries.remove(pos);
                    info!("removed listener {}.{} -> {}", self.name, topic_method, callback_name);
                } else {
                    warn!(
                        "removeListener: no subscription of '{}' under {}.{}",
                        callback_name, self.name, topic_method
                    );
                }
            }
            None => warn!(
                "removeListener: topic {}.{} has no listeners",
                self.name, topic_method
            ),
        }
    }

    pub fn listeners_of(&self, topic_method: &str) -> Vec<Listener> {
        self.listeners
            .lock()
            .get(topic_method)
            .cloned()
            .unwrap_or_default()
    }

    pub fn topics(&self) -> Vec<String> {
        self.listeners.lock().keys().cloned().collect()
    }

    pub fn clear_listeners(&self) {
        self.listeners.lock().clear();
    }

    /// Start the delivery worker. No-op if already started or stopped.
    pub fn start(&self) {
        let Some(mut rx) = self.rx.lock().take() else {
            debug!("outbox of '{}' already started", self.name);
            return;
        };
        let name = self.name.clone();
        let registry = Arc::clone(&self.registry);
        let transport = Arc::clone(&self.transport);
        let handle = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                deliver(&name, &registry, &transport, msg);
            }
        });
        *self.worker.lock() = Some(handle);
    }

    /// Stop the delivery path. Idempotent; messages added afterwards are
    /// still fanned out locally but no longer routed.
    pub fn stop(&self) {
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
        }
        self.rx.lock().take();
    }
}

/// Routed delivery of one message: local via the registry, remote via the
/// transport. Both are attempted independently.
fn deliver(
    name: &str,
    registry: &Arc<dyn ServiceRegistry>,
    transport: &SharedTransport,
    mut msg: Message,
) {
    if msg.name.is_empty() {
        // unnamed publish message - existed only to drive fan-out
        trace!("{}: dropping unnamed message {}", name, msg.method);
        return;
    }
    if msg.history.iter().any(|hop| hop == &msg.name) {
        warn!("{}: loop detected - dropping {}", name, msg.signature());
        return;
    }
    msg.history.push(name.to_string());

    match registry.locate(&msg.name) {
        Some(inbox) => inbox.add(msg.clone()),
        None => warn!("{}: could not locate '{}' for {}", name, msg.name, msg.method),
    }

    let remote = transport.lock().clone();
    if let Some(remote) = remote {
        if let Err(e) = remote.deliver(&msg) {
            warn!("{}: remote delivery of {} failed: {}", name, msg.signature(), e);
        }
    }
}

impl Drop for Outbox {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
        }
    }
}
