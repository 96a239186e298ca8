// Service - composition root
//
// Wires mailboxes, dispatch, reservations and tasks together, runs the
// single processing loop per service, and exposes the public messaging
// API. No two messages for the same service ever execute concurrently:
// that is the invariant that lets handler state be mutated without any
// internal locking.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatch::{self, MethodTable, ResolutionCache};
use crate::dna::{peer_key, ReservationTree, ServiceReservation};
use crate::mailbox::{Inbox, Listener, MailboxHandle, Outbox};
use crate::message::{IntoArgs, Message, MsgStatus};
use crate::registry::{RemoteTransport, ServiceRegistry};
use crate::task::TaskScheduler;
use crate::types::{Error, Result, Status, StatusLevel};

/// Default timeout of a blocking call.
pub const DEFAULT_BLOCKING_TIMEOUT: Duration = Duration::from_millis(1000);

/// Behavior of a concrete service type.
///
/// A handler owns the service's mutable state; the processing loop is the
/// only code that ever touches it. Methods become invocable by declaring
/// them in the [`MethodTable`] returned from [`Handler::table`].
pub trait Handler: Send + 'static {
    /// Fully-qualified type name, used for peer reservations and registry
    /// create requests.
    fn type_name(&self) -> &str;

    /// The dispatch table for this type, built once at service start.
    fn table() -> MethodTable<Self>
    where
        Self: Sized;

    /// Runs before routing. Returning `false` vetoes all further
    /// processing of the message.
    fn pre_routing_hook(&mut self, _msg: &Message) -> bool {
        true
    }

    /// Runs after routing, before invocation. Returning `false` vetoes
    /// the invocation.
    fn pre_process_hook(&mut self, _msg: &Message) -> bool {
        true
    }

    /// Snapshot of the public mutable state, used by `publishState` and
    /// persistence. `None` means the type carries no persistent state.
    fn save_state(&self) -> Option<Value> {
        None
    }

    /// Restore a previously saved snapshot.
    fn load_state(&mut self, _state: Value) {}
}

/// Process-wide shared environment, constructor-injected into every
/// service: the registry collaborator, the reservation tree, the
/// resolution cache and the persistence directory.
#[derive(Clone)]
pub struct ServiceContext {
    pub registry: Arc<dyn ServiceRegistry>,
    pub dna: Arc<ReservationTree>,
    pub cache: Arc<ResolutionCache>,
    pub cfg_dir: PathBuf,
}

impl ServiceContext {
    pub fn new(registry: Arc<dyn ServiceRegistry>) -> Self {
        Self {
            registry,
            dna: Arc::new(ReservationTree::new()),
            cache: Arc::new(ResolutionCache::new()),
            cfg_dir: PathBuf::from(".armature"),
        }
    }

    pub fn with_cfg_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cfg_dir = dir.into();
        self
    }
}

/// Everything the processing loop needs besides the handler and inbox.
struct LoopEnv {
    name: String,
    outbox: Arc<Outbox>,
    cache: Arc<ResolutionCache>,
    running: Arc<AtomicBool>,
    last_error: Arc<Mutex<Option<Status>>>,
    cfg_dir: PathBuf,
}

/// An independently addressable, single-threaded component whose methods
/// are invocable only via messages.
pub struct Service<H: Handler> {
    name: String,
    type_name: String,
    instance_id: uuid::Uuid,
    ctx: ServiceContext,
    inbox_handle: MailboxHandle,
    outbox: Arc<Outbox>,
    tasks: TaskScheduler,
    /// Handler and inbox receiver, moved into the loop on start
    parts: Option<(H, Inbox)>,
    running: Arc<AtomicBool>,
    loop_handle: Option<JoinHandle<()>>,
    last_error: Arc<Mutex<Option<Status>>>,
}

impl<H: Handler> Service<H> {
    /// Construct a service under `reserved_key`.
    ///
    /// If the reservation tree binds the key to another actual name, the
    /// service takes that name. The type's declared peer requirements are
    /// merged into the tree (level by level), and previously saved state
    /// is loaded - a missing state file is "no prior state", not an error.
    pub fn new(reserved_key: &str, mut handler: H, ctx: ServiceContext) -> Self {
        let type_name = handler.type_name().to_string();

        let name = match ctx.dna.get(reserved_key).and_then(|sr| sr.actual_name) {
            Some(actual) => {
                info!(
                    "found reservation - exchanging key '{}' for actual name '{}'",
                    reserved_key, actual
                );
                actual
            }
            None => reserved_key.to_string(),
        };

        ctx.dna.build(ctx.registry.as_ref(), reserved_key, &type_name);

        match load_state_file(&mut handler, &ctx.cfg_dir, &name) {
            Ok(true) => debug!("{}: loaded saved state", name),
            Ok(false) => {}
            Err(e) => warn!("{}: could not load saved state: {}", name, e),
        }

        let inbox = Inbox::new(&name);
        let inbox_handle = inbox.handle();
        let outbox = Arc::new(Outbox::new(&name, Arc::clone(&ctx.registry)));
        let tasks = TaskScheduler::new(&name, inbox.handle());

        Self {
            name,
            type_name,
            instance_id: uuid::Uuid::new_v4(),
            ctx,
            inbox_handle,
            outbox,
            tasks,
            parts: Some((handler, inbox)),
            running: Arc::new(AtomicBool::new(false)),
            loop_handle: None,
            last_error: Arc::new(Mutex::new(None)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn instance_id(&self) -> uuid::Uuid {
        self.instance_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Shared inbound half; register this with the service registry so
    /// other services can reach us.
    pub fn mailbox(&self) -> MailboxHandle {
        self.inbox_handle.clone()
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn attach_transport(&self, transport: Arc<dyn RemoteTransport>) {
        self.outbox.attach_transport(transport);
    }

    // ── messaging ───────────────────────────────────────────────────────

    /// Build an envelope stamped with this service as sender.
    pub fn create_message(
        &self,
        destination: &str,
        method: &str,
        args: impl IntoArgs,
    ) -> Message {
        let mut msg = Message::new(destination, method, args);
        msg.sender = self.name.clone();
        msg
    }

    /// Fire-and-forget send.
    pub fn send(&self, destination: &str, method: &str, args: impl IntoArgs) {
        let mut msg = self.create_message(destination, method, args);
        msg.sending_method = "send".to_string();
        self.outbox.add(msg);
    }

    /// Route a pre-built message through this service's outbox.
    pub fn out(&self, msg: Message) {
        self.outbox.add(msg);
    }

    /// Invoke one of this service's own methods through the mailbox. The
    /// result is re-emitted under the method's name, so this doubles as an
    /// explicit publish. The request goes straight into the inbox: routing
    /// it through the outbox would fan the request itself out to
    /// subscribers of `method`, duplicating the result event.
    pub fn invoke(&self, method: &str, args: impl IntoArgs) {
        let mut msg = self.create_message(&self.name, method, args);
        msg.sending_method = "invoke".to_string();
        self.inbox_handle.add(msg);
    }

    /// Blocking call with the default ~1s timeout. Returns `Null` when the
    /// call times out - indistinguishable from a method legitimately
    /// returning null, which callers must treat as "no answer".
    pub async fn send_blocking(
        &self,
        destination: &str,
        method: &str,
        args: impl IntoArgs,
    ) -> Value {
        self.send_blocking_with(destination, DEFAULT_BLOCKING_TIMEOUT, method, args)
            .await
    }

    /// Blocking call with a caller-supplied timeout. Suspends the calling
    /// task on a single-slot result cell until the matching `Return`
    /// message resolves it or the timeout expires.
    pub async fn send_blocking_with(
        &self,
        destination: &str,
        timeout: Duration,
        method: &str,
        args: impl IntoArgs,
    ) -> Value {
        let mut msg = self.create_message(destination, method, args);
        msg.sending_method = "sendBlocking".to_string();
        msg.status = MsgStatus::Blocking;
        let msg_id = msg.msg_id;

        let cell = self.inbox_handle.register_blocking_wait(msg_id);
        self.outbox.add(msg);

        match tokio::time::timeout(timeout, cell).await {
            Ok(Ok(value)) => value,
            Ok(Err(_)) => Value::Null,
            Err(_) => {
                debug!(
                    "{}: blocking call {}.{} timed out after {:?}",
                    self.name, destination, method, timeout
                );
                self.inbox_handle.cancel_blocking_wait(msg_id);
                Value::Null
            }
        }
    }

    // ── publish/subscribe ───────────────────────────────────────────────

    /// Subscribe to `topic_name.topic_method`; callbacks arrive on this
    /// service's `on<TopicMethod>` method. Implemented as an
    /// `addListener` message to the publisher, so it works across
    /// processes too.
    pub fn subscribe(&self, topic_name: &str, topic_method: &str) {
        self.subscribe_as(topic_name, topic_method, &callback_name_of(topic_method));
    }

    /// Subscribe with an explicit callback method.
    pub fn subscribe_as(&self, topic_name: &str, topic_method: &str, callback_method: &str) {
        info!(
            "subscribe [{}/{} -> {}/{}]",
            topic_name, topic_method, self.name, callback_method
        );
        let mut msg = self.create_message(
            topic_name,
            "addListener",
            crate::args![topic_method, self.name.clone(), callback_method],
        );
        msg.sending_method = "subscribe".to_string();
        self.outbox.add(msg);
    }

    /// Remove this service's subscription to `topic_name.topic_method`.
    pub fn unsubscribe(&self, topic_name: &str, topic_method: &str) {
        let mut msg = self.create_message(
            topic_name,
            "removeListener",
            crate::args![topic_method, self.name.clone()],
        );
        msg.sending_method = "unsubscribe".to_string();
        self.outbox.add(msg);
    }

    /// Register a subscription on this service's own outbox directly.
    pub fn add_listener(&self, listener: Listener) {
        self.outbox.add_listener(listener);
    }

    pub fn remove_listener(&self, topic_method: &str, callback_name: &str) {
        self.outbox.remove_listener(topic_method, callback_name);
    }

    // ── peers ───────────────────────────────────────────────────────────

    /// Reserve a peer slot `{self}.{key}` of the given type. Merge
    /// semantics: fields already bound by an earlier writer are kept.
    pub fn reserve(&self, key: &str, type_name: &str, comment: &str) {
        let full_key = self.peer_key(key);
        self.ctx.dna.reserve(
            &full_key,
            ServiceReservation::new(
                full_key.clone(),
                Some(full_key.clone()),
                Some(type_name.to_string()),
                Some(comment.to_string()),
            ),
        );
    }

    /// Reserve a peer slot bound to an explicit instance name.
    pub fn reserve_named(&self, key: &str, actual_name: &str, type_name: &str, comment: &str) {
        let full_key = self.peer_key(key);
        self.ctx.dna.reserve(
            &full_key,
            ServiceReservation::new(
                full_key.clone(),
                Some(actual_name.to_string()),
                Some(type_name.to_string()),
                Some(comment.to_string()),
            ),
        );
    }

    /// Point the logical peer slot `key` at an already-existing named
    /// instance instead of creating a new one.
    pub fn reserve_as(&self, key: &str, new_name: &str) {
        self.ctx.dna.reserve_as(&self.peer_key(key), new_name);
    }

    /// Re-plan a peer slot outright, replacing any earlier reservation.
    /// Unlike [`reserve`](Self::reserve) this does not merge.
    pub fn set_peer(&self, key: &str, actual_name: &str, type_name: &str) {
        let full_key = self.peer_key(key);
        self.ctx.dna.rebind(
            &full_key,
            ServiceReservation::new(
                full_key.clone(),
                Some(actual_name.to_string()),
                Some(type_name.to_string()),
                None,
            ),
        );
    }

    /// Resolve the peer slot through the reservation tree and ask the
    /// registry to create-or-fetch the bound instance.
    pub fn create_peer(&self, key: &str) -> Result<MailboxHandle> {
        let full_key = self.peer_key(key);
        let Some(sr) = self.ctx.dna.get(&full_key) else {
            return Err(Error::PeerResolution { key: full_key });
        };
        let Some(type_name) = sr.type_name else {
            return Err(Error::PeerResolution { key: full_key });
        };
        let actual = sr.actual_name.unwrap_or_else(|| full_key.clone());
        self.ctx.registry.create(&actual, &type_name)
    }

    /// Like [`create_peer`](Self::create_peer) but falls back to
    /// `default_type` when the slot carries no reservation.
    pub fn create_peer_or(&self, key: &str, default_type: &str) -> Result<MailboxHandle> {
        let full_key = self.peer_key(key);
        let sr = self.ctx.dna.get(&full_key);
        let actual = sr
            .as_ref()
            .and_then(|sr| sr.actual_name.clone())
            .unwrap_or_else(|| full_key.clone());
        let type_name = sr
            .and_then(|sr| sr.type_name)
            .unwrap_or_else(|| default_type.to_string());
        self.ctx.registry.create(&actual, &type_name)
    }

    /// Release this service's peers: deepest reservations first, each
    /// peer's own peers before the peer itself (post-order teardown).
    /// Unregistered reservations are skipped.
    pub fn release_peers(&self) {
        for path in self.ctx.dna.subtree_post_order(&self.name) {
            let actual = self
                .ctx
                .dna
                .get(&path)
                .and_then(|sr| sr.actual_name)
                .unwrap_or_else(|| path.clone());
            if self.ctx.registry.locate(&actual).is_some() {
                info!("{}: releasing peer {} ({})", self.name, path, actual);
                self.ctx.registry.release(&actual);
            } else {
                debug!("{}: peer {} is not registered - skipping", self.name, path);
            }
        }
    }

    pub fn peer_key(&self, key: &str) -> String {
        peer_key(&self.name, key)
    }

    // ── tasks ───────────────────────────────────────────────────────────

    /// Arm a named task that injects `method(args)` into this service's
    /// own inbox after `interval_ms`, re-arming while `interval_ms > 0`.
    pub fn add_task(&self, task_name: &str, interval_ms: u64, method: &str, args: impl IntoArgs) {
        let mut template = self.create_message(&self.name, method, args);
        template.sending_method = "addTask".to_string();
        self.tasks
            .add_task(task_name, Duration::from_millis(interval_ms), template);
    }

    pub fn purge_task(&self, task_name: &str) {
        self.tasks.purge_task(task_name);
    }

    pub fn purge_tasks(&self) {
        self.tasks.purge_tasks();
    }

    // ── status ──────────────────────────────────────────────────────────

    /// Publish an info status to any subscribers of `publishStatus`.
    pub fn info(&self, detail: impl Into<String>) -> Status {
        let status = Status::info(&self.name, detail);
        publish_status(&self.name, &self.outbox, &self.last_error, status.clone());
        status
    }

    pub fn warn(&self, detail: impl Into<String>) -> Status {
        let status = Status::warn(&self.name, detail);
        publish_status(&self.name, &self.outbox, &self.last_error, status.clone());
        status
    }

    pub fn error(&self, detail: impl Into<String>) -> Status {
        let status = Status::error(&self.name, detail);
        publish_status(&self.name, &self.outbox, &self.last_error, status.clone());
        status
    }

    pub fn last_error(&self) -> Option<Status> {
        self.last_error.lock().clone()
    }

    pub fn has_error(&self) -> bool {
        self.last_error.lock().is_some()
    }

    pub fn clear_last_error(&self) -> Option<Status> {
        self.last_error.lock().take()
    }

    /// Publish the service's public state snapshot under `publishState`.
    pub fn broadcast_state(&self) {
        self.invoke("publishState", ());
    }

    // ── lifecycle ───────────────────────────────────────────────────────

    /// Start the outbox delivery worker and the processing loop.
    pub fn start_service(&mut self) {
        if self.is_running() {
            debug!("startService: '{}' is already running", self.name);
            return;
        }
        let Some((handler, inbox)) = self.parts.take() else {
            warn!("startService: '{}' was stopped and cannot restart", self.name);
            return;
        };
        self.running.store(true, Ordering::SeqCst);
        self.outbox.start();

        let env = LoopEnv {
            name: self.name.clone(),
            outbox: Arc::clone(&self.outbox),
            cache: Arc::clone(&self.ctx.cache),
            running: Arc::clone(&self.running),
            last_error: Arc::clone(&self.last_error),
            cfg_dir: self.ctx.cfg_dir.clone(),
        };
        self.loop_handle = Some(tokio::spawn(run_loop(handler, inbox, H::table(), env)));
        info!("{} started", self.name);
    }

    /// Stop the service: flip the running flag, wake the blocked loop,
    /// purge all tasks, stop the delivery path, and wait for the loop to
    /// save state and exit. Stopping an already-stopped service is a
    /// no-op.
    pub async fn stop_service(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) && self.loop_handle.is_none() {
            debug!("stopService: '{}' is already stopped", self.name);
            return;
        }
        self.tasks.purge_tasks();
        self.inbox_handle.shutdown();
        self.outbox.stop();
        if let Some(handle) = self.loop_handle.take() {
            if let Err(e) = handle.await {
                warn!("{}: processing loop ended abnormally: {}", self.name, e);
            }
        }
        info!("{} stopped", self.name);
    }

    /// Stop, tear down peers (post-order), and unregister from the
    /// registry.
    pub async fn release_service(&mut self) {
        self.stop_service().await;
        self.release_peers();
        self.ctx.registry.release(&self.name);
    }
}

/// `publishTemp` subscribes back on `onPublishTemp`.
pub fn callback_name_of(topic_method: &str) -> String {
    let mut chars = topic_method.chars();
    match chars.next() {
        Some(first) => format!("on{}{}", first.to_uppercase(), chars.as_str()),
        None => "on".to_string(),
    }
}

// ── processing loop ─────────────────────────────────────────────────────

async fn run_loop<H: Handler>(
    mut handler: H,
    mut inbox: Inbox,
    table: MethodTable<H>,
    env: LoopEnv,
) {
    debug!("{} processing loop started", env.name);
    while env.running.load(Ordering::SeqCst) {
        let msg = match inbox.take().await {
            Ok(msg) => msg,
            Err(_) => {
                debug!("{} shutting down", env.name);
                break;
            }
        };

        if !handler.pre_routing_hook(&msg) {
            continue;
        }

        // enqueued under a stale or foreign address - relay, don't invoke
        if msg.name != env.name {
            debug!("{}: relaying {}", env.name, msg.signature());
            env.outbox.add(msg);
            continue;
        }

        if !handler.pre_process_hook(&msg) {
            continue;
        }

        let blocking = msg.status == MsgStatus::Blocking;
        match process(&mut handler, &table, &env, &msg) {
            Ok(value) => {
                // every successful invocation doubles as a publish point:
                // re-emit the result under the invoked method's own name
                let mut event = Message::new("", &msg.method, value.clone());
                event.sender = env.name.clone();
                event.sending_method = msg.method.clone();
                env.outbox.add(event);

                if blocking {
                    env.outbox.add(return_message(&env.name, &msg, value));
                }
            }
            Err(e) => {
                let status = Status::error(&env.name, e.to_string());
                publish_status(&env.name, &env.outbox, &env.last_error, status);
                if blocking {
                    // failure is reported to a blocked caller as "no data"
                    env.outbox.add(return_message(&env.name, &msg, Value::Null));
                }
            }
        }
    }

    // best-effort save on the way out
    match save_state_file(&handler, &env.cfg_dir, &env.name) {
        Ok(true) => debug!("{}: state saved", env.name),
        Ok(false) => {}
        Err(e) => {
            let status = Status::error(&env.name, format!("save failed: {}", e));
            publish_status(&env.name, &env.outbox, &env.last_error, status);
        }
    }
    debug!("{} processing loop stopped", env.name);
}

/// Execute one message: framework methods first, then dynamic dispatch.
fn process<H: Handler>(
    handler: &mut H,
    table: &MethodTable<H>,
    env: &LoopEnv,
    msg: &Message,
) -> Result<Value> {
    match msg.method.as_str() {
        "addListener" => {
            let (topic, name, method) = listener_args(msg)?;
            env.outbox.add_listener(Listener::new(topic, name, method));
            Ok(Value::Null)
        }
        "removeListener" => {
            let (topic, name) = two_string_args(msg)?;
            env.outbox.remove_listener(topic, name);
            Ok(Value::Null)
        }
        "publishState" => Ok(handler.save_state().unwrap_or(Value::Null)),
        _ => dispatch::invoke_on(handler, table, &env.cache, &msg.method, &msg.data),
    }
}

fn return_message(name: &str, request: &Message, value: Value) -> Message {
    let mut ret = Message::new(request.sender.clone(), request.method.clone(), value);
    ret.sender = name.to_string();
    ret.sending_method = request.method.clone();
    ret.msg_id = request.msg_id;
    ret.status = MsgStatus::Return;
    ret
}

fn publish_status(
    name: &str,
    outbox: &Outbox,
    last_error: &Mutex<Option<Status>>,
    status: Status,
) {
    match status.level {
        StatusLevel::Info => info!("{}", status),
        StatusLevel::Warn => warn!("{}", status),
        StatusLevel::Error => tracing::error!("{}", status),
    }
    if status.is_error() {
        *last_error.lock() = Some(status.clone());
        let mut event = Message::new("", "publishError", status_value(&status));
        event.sender = name.to_string();
        event.sending_method = "publishError".to_string();
        outbox.add(event);
    }
    let mut event = Message::new("", "publishStatus", status_value(&status));
    event.sender = name.to_string();
    event.sending_method = "publishStatus".to_string();
    outbox.add(event);
}

fn status_value(status: &Status) -> Value {
    serde_json::to_value(status).unwrap_or(Value::Null)
}

fn listener_args(msg: &Message) -> Result<(&str, &str, &str)> {
    match (
        msg.data.first().and_then(Value::as_str),
        msg.data.get(1).and_then(Value::as_str),
        msg.data.get(2).and_then(Value::as_str),
    ) {
        (Some(topic), Some(name), Some(method)) => Ok((topic, name, method)),
        _ => Err(Error::Invocation {
            method: msg.method.clone(),
            reason: "expected (topicMethod, callbackName, callbackMethod) string arguments"
                .to_string(),
        }),
    }
}

fn two_string_args(msg: &Message) -> Result<(&str, &str)> {
    match (
        msg.data.first().and_then(Value::as_str),
        msg.data.get(1).and_then(Value::as_str),
    ) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(Error::Invocation {
            method: msg.method.clone(),
            reason: "expected two string arguments".to_string(),
        }),
    }
}

// ── persistence ─────────────────────────────────────────────────────────

fn state_file(cfg_dir: &Path, name: &str) -> PathBuf {
    cfg_dir.join(format!("{}.json", name))
}

fn load_state_file<H: Handler>(handler: &mut H, cfg_dir: &Path, name: &str) -> Result<bool> {
    let path = state_file(cfg_dir, name);
    if !path.exists() {
        debug!("cfg file {} does not exist", path.display());
        return Ok(false);
    }
    let text = std::fs::read_to_string(&path)?;
    handler.load_state(serde_json::from_str(&text)?);
    Ok(true)
}

fn save_state_file<H: Handler>(handler: &H, cfg_dir: &Path, name: &str) -> Result<bool> {
    let Some(state) = handler.save_state() else {
        return Ok(false);
    };
    std::fs::create_dir_all(cfg_dir)?;
    std::fs::write(state_file(cfg_dir, name), serde_json::to_string_pretty(&state)?)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_names() {
        assert_eq!(callback_name_of("publishTemp"), "onPublishTemp");
        assert_eq!(callback_name_of("state"), "onState");
    }
}
