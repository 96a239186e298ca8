// Per-service mailboxes
//
// Inbox: multi-producer inbound FIFO plus the blocking-call correlation
// table. Outbox: outbound delivery queue plus the subscription table and
// remote-transport handoff.

mod inbox;
mod outbox;

pub use inbox::{Inbox, MailboxHandle};
pub use outbox::{Listener, Outbox};
