//! Actor-style messaging core for composing systems out of named services.
//!
//! Each service is an independently addressable, single-threaded component:
//! its methods are invocable only via [`Message`]s taken one at a time from
//! its [`mailbox::Inbox`], so handler state needs no internal locking. On
//! top of the envelope the crate layers blocking request/response
//! correlation, publish/subscribe fan-out, dynamic method dispatch with an
//! LRU resolution cache, a hierarchical peer-reservation tree for composite
//! services, and named scheduled tasks.
//!
//! Process-wide lifecycle (who creates services, how remote messages travel)
//! stays behind the [`ServiceRegistry`] and [`RemoteTransport`] traits.
//!
//! ```ignore
//! let ctx = ServiceContext::new(registry);
//! let mut clock = Service::new("clock", ClockHandler::default(), ctx);
//! clock.start_service();
//! clock.add_task("tick", 1000, "pulse", ());
//! ```

pub mod dispatch;
pub mod dna;
pub mod mailbox;
pub mod message;
pub mod registry;
pub mod service;
pub mod task;
pub mod types;

pub use dispatch::{ArgKind, MethodTable, ResolutionCache};
pub use dna::{peer_key, PeerSet, ReservationTree, ServiceReservation};
pub use mailbox::{Inbox, Listener, MailboxHandle, Outbox};
pub use message::{IntoArgs, Message, MsgStatus};
pub use registry::{RemoteTransport, ServiceRegistry};
pub use service::{callback_name_of, Handler, Service, ServiceContext, DEFAULT_BLOCKING_TIMEOUT};
pub use task::TaskScheduler;
pub use types::{Error, Result, Status, StatusLevel};

#[doc(hidden)]
pub mod __private {
    pub use serde_json::{json, Value};
}
