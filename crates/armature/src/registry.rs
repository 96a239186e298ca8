// External collaborator interfaces
//
// The core never manages process-wide service lifecycle itself and never
// parses wire bytes. It talks to a registry to materialize peers and to
// route messages whose destination is not local, and hands fully-formed
// messages to an optional remote transport for cross-process delivery.

use crate::dna::PeerSet;
use crate::mailbox::MailboxHandle;
use crate::message::Message;
use crate::types::Result;

/// Process-wide service registry and lifecycle collaborator.
pub trait ServiceRegistry: Send + Sync {
    /// Create the named service of the given type, or fetch it if it
    /// already exists.
    fn create(&self, name: &str, type_name: &str) -> Result<MailboxHandle>;

    /// Look up a live service by name.
    fn locate(&self, name: &str) -> Option<MailboxHandle>;

    /// Release the named service. Returns whether it was registered.
    fn release(&self, name: &str) -> bool;

    /// The default peer set a service type declares at construction time,
    /// if it declares one. Drives the recursive reservation-tree build.
    fn default_peers(&self, type_name: &str) -> Option<PeerSet>;
}

/// Cross-process delivery collaborator. Receives fully-formed messages;
/// wire format and addressing are its own concern.
pub trait RemoteTransport: Send + Sync {
    fn deliver(&self, msg: &Message) -> Result<()>;
}
