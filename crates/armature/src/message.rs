// Message envelope
//
// The immutable-enough unit of communication between services. A message is
// created by a sender, mutated only while in transit (its status flips at
// most once, from OneWay/Blocking to Return), and discarded after delivery.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

static NEXT_MSG_ID: AtomicU64 = AtomicU64::new(1);

/// Issue a process-wide unique, monotonically increasing correlation id.
///
/// A `Return` message always carries the same id as the `Blocking` message
/// it answers.
pub fn next_msg_id() -> u64 {
    NEXT_MSG_ID.fetch_add(1, Ordering::Relaxed)
}

/// Delivery status tag of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MsgStatus {
    /// Fire-and-forget send; no answer expected.
    OneWay,
    /// The sender is suspended on the correlation id until a `Return` with
    /// the same id arrives (or its timeout expires).
    Blocking,
    /// Answer to a `Blocking` message; resolves the pending wait.
    Return,
}

/// Message envelope used by all components of the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Destination service name. Empty for "unnamed" publish messages which
    /// exist only to drive subscription fan-out.
    pub name: String,
    /// Name of the sending service
    pub sender: String,
    /// The sender's originating method, kept for introspection
    pub sending_method: String,
    /// Target method name on the destination
    pub method: String,
    /// Ordered, heterogeneous argument list
    pub data: Vec<Value>,
    /// Correlation id linking a blocking request to its return
    pub msg_id: u64,
    pub status: MsgStatus,
    /// Service names this message has passed through, for loop detection
    pub history: Vec<String>,
}

impl Message {
    /// Build an envelope. The sender is stamped by
    /// [`Service::create_message`](crate::service::Service::create_message);
    /// a bare `Message::new` leaves it empty.
    pub fn new(name: impl Into<String>, method: impl Into<String>, data: impl IntoArgs) -> Self {
        Self {
            name: name.into(),
            sender: String::new(),
            sending_method: String::new(),
            method: method.into(),
            data: data.into_args(),
            msg_id: next_msg_id(),
            status: MsgStatus::OneWay,
            history: Vec::new(),
        }
    }

    /// Clone with a cleared hop history — becomes a "new" message. Used by
    /// repeating tasks when they re-arm.
    pub fn fresh_copy(&self) -> Self {
        let mut copy = self.clone();
        copy.history.clear();
        copy.msg_id = next_msg_id();
        copy
    }

    /// First argument, or `Null` when the argument list is empty. This is the
    /// payload a `Return` message carries back to a blocked caller.
    pub fn return_value(&self) -> Value {
        self.data.first().cloned().unwrap_or(Value::Null)
    }

    /// `destination.method(arity)` — used in log lines
    pub fn signature(&self) -> String {
        format!("{}.{}({} args)", self.name, self.method, self.data.len())
    }
}

/// Argument normalization: `()`, a single value, or an array all become an
/// ordered argument list. No type validation happens here; type matching is
/// deferred to the invocation engine.
pub trait IntoArgs {
    fn into_args(self) -> Vec<Value>;
}

impl IntoArgs for () {
    fn into_args(self) -> Vec<Value> {
        Vec::new()
    }
}

impl IntoArgs for Value {
    fn into_args(self) -> Vec<Value> {
        vec![self]
    }
}

impl IntoArgs for Vec<Value> {
    fn into_args(self) -> Vec<Value> {
        self
    }
}

/// Build an argument list from any `Serialize` values.
///
/// ```ignore
/// service.send("arm", "moveTo", args![90, 0.5]);
/// ```
#[macro_export]
macro_rules! args {
    () => { ::std::vec::Vec::<$crate::__private::Value>::new() };
    ($($a:expr),+ $(,)?) => { ::std::vec![$($crate::__private::json!($a)),+] };
}
