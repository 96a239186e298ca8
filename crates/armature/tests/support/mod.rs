#![allow(dead_code)]

// Shared fixtures: an in-process registry hub and a recording handler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};

use armature::dispatch::{ArgKind, MethodTable};
use armature::dna::PeerSet;
use armature::mailbox::{Inbox, MailboxHandle};
use armature::registry::ServiceRegistry;
use armature::types::{Error, Result};
use armature::Handler;

/// In-process registry: name -> mailbox map plus call recording, so tests
/// can assert what the core asked of its lifecycle collaborator.
#[derive(Default)]
pub struct LocalHub {
    map: DashMap<String, MailboxHandle>,
    peers: Mutex<HashMap<String, PeerSet>>,
    created: Mutex<Vec<(String, String)>>,
    released: Mutex<Vec<String>>,
    /// Inboxes created on demand, kept alive so their channels stay open
    parked: Mutex<Vec<Inbox>>,
}

impl LocalHub {
    pub fn new() -> Arc<Self> {
        trace_init();
        Arc::new(Self::default())
    }

    pub fn register(&self, name: &str, handle: MailboxHandle) {
        self.map.insert(name.to_string(), handle);
    }

    pub fn set_default_peers(&self, type_name: &str, peers: PeerSet) {
        self.peers.lock().insert(type_name.to_string(), peers);
    }

    pub fn created(&self) -> Vec<(String, String)> {
        self.created.lock().clone()
    }

    pub fn released(&self) -> Vec<String> {
        self.released.lock().clone()
    }
}

impl ServiceRegistry for LocalHub {
    fn create(&self, name: &str, type_name: &str) -> Result<MailboxHandle> {
        self.created
            .lock()
            .push((name.to_string(), type_name.to_string()));
        if let Some(handle) = self.map.get(name) {
            return Ok(handle.clone());
        }
        let inbox = Inbox::new(name);
        let handle = inbox.handle();
        self.parked.lock().push(inbox);
        self.map.insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    fn locate(&self, name: &str) -> Option<MailboxHandle> {
        self.map.get(name).map(|h| h.clone())
    }

    fn release(&self, name: &str) -> bool {
        self.released.lock().push(name.to_string());
        self.map.remove(name).is_some()
    }

    fn default_peers(&self, type_name: &str) -> Option<PeerSet> {
        self.peers.lock().get(type_name).cloned()
    }
}

/// Handler with a few invocable methods and a shared sink recording every
/// callback it receives.
pub struct Recorder {
    type_name: String,
    pub count: i64,
    pub sink: Arc<Mutex<Vec<(String, Value)>>>,
}

impl Recorder {
    pub fn new(type_name: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            count: 0,
            sink: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Handler for Recorder {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn table() -> MethodTable<Self> {
        MethodTable::new()
            .register("add", &[ArgKind::Int, ArgKind::Int], |_, args| {
                let a = args[0].as_i64().unwrap_or(0);
                let b = args[1].as_i64().unwrap_or(0);
                Ok(json!(a + b))
            })
            .register("pulse", &[], |h: &mut Recorder, _| {
                h.count += 1;
                Ok(json!(h.count))
            })
            .register("getCount", &[], |h: &mut Recorder, _| Ok(json!(h.count)))
            .register("publishTemp", &[ArgKind::Float], |_, args| Ok(args[0].clone()))
            .register("onPublishTemp", &[ArgKind::Float], |h: &mut Recorder, args| {
                h.sink.lock().push(("onPublishTemp".to_string(), args[0].clone()));
                Ok(Value::Null)
            })
            .register("onPublishState", &[ArgKind::Object], |h: &mut Recorder, args| {
                h.sink.lock().push(("onPublishState".to_string(), args[0].clone()));
                Ok(Value::Null)
            })
            .register("boom", &[], |_: &mut Recorder, _| {
                Err(Error::Registry("boom".to_string()))
            })
    }

    fn save_state(&self) -> Option<Value> {
        Some(json!({ "count": self.count }))
    }

    fn load_state(&mut self, state: Value) {
        if let Some(count) = state.get("count").and_then(Value::as_i64) {
            self.count = count;
        }
    }
}

/// Honor RUST_LOG in test output; safe to call more than once.
pub fn trace_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll until `probe` returns true or ~2s elapse.
pub async fn wait_until(mut probe: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if probe() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
