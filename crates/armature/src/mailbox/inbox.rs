// Inbox - per-service inbound mailbox
//
// Multi-producer FIFO owned by a single consuming service task, plus the
// blocking-call correlation table. Producers only ever touch a service
// through its cloneable MailboxHandle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, trace, warn};

use crate::message::{Message, MsgStatus};
use crate::types::{Error, Result};

/// Shared half of an inbox: enqueue side plus the correlation table.
///
/// Cloneable and thread-safe; handed to the registry, to outboxes of other
/// services, and to the task scheduler. A `Return` message whose correlation
/// id has a pending cell resolves that cell instead of being enqueued.
#[derive(Clone)]
pub struct MailboxHandle {
    name: Arc<str>,
    tx: UnboundedSender<Message>,
    /// pending correlation id -> single-slot result cell
    pending: Arc<DashMap<u64, oneshot::Sender<Value>>>,
    stopped: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
}

impl MailboxHandle {
    /// Name of the owning service
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a message to the FIFO. Non-blocking and safe for concurrent
    /// producers. `Return` messages are routed to the correlation table
    /// instead; resolving an unknown or already-resolved id is a no-op.
    pub fn add(&self, msg: Message) {
        if msg.status == MsgStatus::Return {
            self.resolve(msg.msg_id, msg.return_value());
            return;
        }
        trace!("{} <- {}", self.name, msg.signature());
        if self.tx.send(msg).is_err() {
            debug!("inbox of '{}' is closed - dropping message", self.name);
        }
    }

    /// Create the single-slot result cell for a pending blocking call.
    /// At most one outstanding cell per correlation id.
    pub fn register_blocking_wait(&self, msg_id: u64) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        if self.pending.insert(msg_id, tx).is_some() {
            warn!("replacing outstanding blocking cell for id {}", msg_id);
        }
        rx
    }

    /// Fill the cell for `msg_id` and wake exactly one waiter. Unknown or
    /// already-resolved ids are logged and discarded, never queued.
    pub fn resolve(&self, msg_id: u64, value: Value) {
        match self.pending.remove(&msg_id) {
            Some((_, cell)) => {
                if cell.send(value).is_err() {
                    debug!("blocking caller for id {} gave up before resolve", msg_id);
                }
            }
            None => {
                debug!("resolve for unknown or already-resolved id {} - ignored", msg_id);
            }
        }
    }

    /// Drop the pending cell for a blocking call whose timeout expired.
    pub fn cancel_blocking_wait(&self, msg_id: u64) {
        self.pending.remove(&msg_id);
    }

    /// Unblock a pending `take()` with `Cancelled`. Idempotent; part of
    /// service shutdown.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        // a stored permit covers the window before the consumer parks
        self.stop_notify.notify_one();
    }

    pub fn is_shutdown(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MailboxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxHandle")
            .field("name", &self.name)
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Per-service inbound mailbox. The receiving half lives with the single
/// processing task; everyone else holds a [`MailboxHandle`].
pub struct Inbox {
    handle: MailboxHandle,
    rx: UnboundedReceiver<Message>,
}

impl Inbox {
    pub fn new(name: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = MailboxHandle {
            name: Arc::from(name),
            tx,
            pending: Arc::new(DashMap::new()),
            stopped: Arc::new(AtomicBool::new(false)),
            stop_notify: Arc::new(Notify::new()),
        };
        Self { handle, rx }
    }

    pub fn handle(&self) -> MailboxHandle {
        self.handle.clone()
    }

    /// Block the owning task until a message is available, or fail with
    /// `Cancelled` once the service is stopped.
    pub async fn take(&mut self) -> Result<Message> {
        if self.handle.is_shutdown() {
            return Err(Error::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.handle.stop_notify.notified() => Err(Error::Cancelled),
            maybe = self.rx.recv() => maybe.ok_or(Error::Cancelled),
        }
    }

    /// Non-blocking take; `None` when the queue is currently empty.
    pub fn try_take(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}
