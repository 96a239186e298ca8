// Peer reservation tree ("DNA")
//
// Process-wide hierarchical plan mapping composite-service key paths
// (dot-delimited, e.g. "robotArm.leftServo") to reserved peer identities.
// Built incrementally at service-construction time, level by level, so a
// parent's overrides are visible before a child peer's defaults apply.
//
// Shared mutable state behind one coarse lock; constructor-injected into
// the services that need it rather than living in an ambient static.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::registry::ServiceRegistry;
use crate::types::Error;

/// Join an owner name and a relative peer key into a full tree path.
pub fn peer_key(owner: &str, key: &str) -> String {
    if owner.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", owner, key)
    }
}

/// A reserved peer identity. Once a field is bound it is never overwritten
/// by a later merge - merges fill only unbound fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceReservation {
    /// Full key path within the tree
    pub key: String,
    /// Concrete instance name that satisfies this slot
    pub actual_name: Option<String>,
    /// Fully-qualified peer type name
    pub type_name: Option<String>,
    /// Human comment describing the slot's purpose
    pub comment: Option<String>,
}

impl ServiceReservation {
    pub fn new(
        key: impl Into<String>,
        actual_name: Option<String>,
        type_name: Option<String>,
        comment: Option<String>,
    ) -> Self {
        Self {
            key: key.into(),
            actual_name,
            type_name,
            comment,
        }
    }
}

/// The peer slots a composite service type declares at construction time.
/// Keys are relative to the composite; a slot without an explicit actual
/// name binds to its own full key path.
#[derive(Debug, Clone, Default)]
pub struct PeerSet {
    peers: Vec<ServiceReservation>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a peer slot: relative key, type, comment.
    pub fn with(mut self, key: &str, type_name: &str, comment: &str) -> Self {
        self.peers.push(ServiceReservation::new(
            key,
            None,
            Some(type_name.to_string()),
            Some(comment.to_string()),
        ));
        self
    }

    /// Declare a peer slot bound to an explicit instance name.
    pub fn with_named(mut self, key: &str, actual_name: &str, type_name: &str, comment: &str) -> Self {
        self.peers.push(ServiceReservation::new(
            key,
            Some(actual_name.to_string()),
            Some(type_name.to_string()),
            Some(comment.to_string()),
        ));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceReservation> {
        self.peers.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[derive(Default)]
struct Node {
    reservation: Option<ServiceReservation>,
    branches: BTreeMap<String, Node>,
}

impl Node {
    fn descend(&self, path: &str) -> Option<&Node> {
        let mut node = self;
        for part in path.split('.') {
            node = node.branches.get(part)?;
        }
        Some(node)
    }

    fn descend_or_create(&mut self, path: &str) -> &mut Node {
        let mut node = self;
        for part in path.split('.') {
            node = node.branches.entry(part.to_string()).or_default();
        }
        node
    }

    fn flatten_into(&self, out: &mut Vec<ServiceReservation>) {
        if let Some(sr) = &self.reservation {
            out.push(sr.clone());
        }
        for child in self.branches.values() {
            child.flatten_into(out);
        }
    }
}

/// Radix tree over dot-delimited key paths. Created lazily, never
/// wholesale-deleted; individual entries may be rebound via
/// [`reserve_as`](ReservationTree::reserve_as).
#[derive(Default)]
pub struct ReservationTree {
    root: Mutex<Node>,
}

impl ReservationTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or field-merge a reservation at `key`. Merging fills only
    /// unbound fields; a bound field is kept and the conflict logged
    /// (first writer wins per field).
    pub fn reserve(&self, key: &str, incoming: ServiceReservation) {
        let mut root = self.root.lock();
        let node = root.descend_or_create(key);
        match &mut node.reservation {
            None => {
                debug!(
                    "dna adding new key {} [{:?} {:?}]",
                    key, incoming.actual_name, incoming.type_name
                );
                node.reservation = Some(ServiceReservation { key: key.to_string(), ..incoming });
            }
            Some(existing) => {
                let mut filled: Vec<&str> = Vec::new();
                merge_field(key, "actual_name", &mut existing.actual_name, incoming.actual_name, &mut filled);
                merge_field(key, "type_name", &mut existing.type_name, incoming.type_name, &mut filled);
                merge_field(key, "comment", &mut existing.comment, incoming.comment, &mut filled);
                if !filled.is_empty() {
                    info!("dna merge at {} filled {}", key, filled.join(", "));
                }
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<ServiceReservation> {
        self.root.lock().descend(key).and_then(|n| n.reservation.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Re-bind an existing reservation's actual-name field, pointing a
    /// logical peer slot at an already-existing named instance. Creates the
    /// entry when the key was never reserved.
    pub fn reserve_as(&self, key: &str, new_name: &str) {
        let mut root = self.root.lock();
        let node = root.descend_or_create(key);
        match &mut node.reservation {
            Some(sr) => {
                info!("dna rebinding {} -> {}", key, new_name);
                sr.actual_name = Some(new_name.to_string());
            }
            None => {
                node.reservation = Some(ServiceReservation::new(
                    key,
                    Some(new_name.to_string()),
                    None,
                    None,
                ));
            }
        }
    }

    /// Replace the reservation at `key` outright, bypassing merge
    /// semantics. Used when a composer deliberately re-plans a slot.
    pub fn rebind(&self, key: &str, reservation: ServiceReservation) {
        let mut root = self.root.lock();
        let node = root.descend_or_create(key);
        info!(
            "dna rebinding {} [{:?} {:?}]",
            key, reservation.actual_name, reservation.type_name
        );
        node.reservation = Some(ServiceReservation { key: key.to_string(), ..reservation });
    }

    /// Full key paths of the immediate reservations directly under `key`,
    /// in tree order.
    pub fn children_of(&self, key: &str) -> Vec<String> {
        let root = self.root.lock();
        let Some(node) = root.descend(key) else {
            return Vec::new();
        };
        node.branches
            .iter()
            .filter(|(_, child)| child.reservation.is_some())
            .map(|(name, _)| peer_key(key, name))
            .collect()
    }

    /// All reserved key paths below `key` (exclusive), deepest first -
    /// the post-order walk used for peer teardown.
    pub fn subtree_post_order(&self, key: &str) -> Vec<String> {
        fn walk(node: &Node, prefix: &str, out: &mut Vec<String>) {
            for (name, child) in &node.branches {
                let path = peer_key(prefix, name);
                walk(child, &path, out);
                if child.reservation.is_some() {
                    out.push(path);
                }
            }
        }
        let root = self.root.lock();
        let mut out = Vec::new();
        if let Some(node) = root.descend(key) {
            walk(node, key, &mut out);
        }
        out
    }

    pub fn flatten(&self) -> Vec<ServiceReservation> {
        let mut out = Vec::new();
        self.root.lock().flatten_into(&mut out);
        out
    }

    pub fn len(&self) -> usize {
        self.flatten().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merge the declared default-peer-set of `type_name` into the tree
    /// under `my_key`, then recurse into each peer's own peers.
    ///
    /// Two passes are necessary: the entire current level is merged before
    /// any recursion starts, building the tree level by level instead of
    /// depth first. A grandparent's override of a deeply-nested peer must
    /// be in the tree before that level computes its own defaults.
    pub fn build(&self, registry: &dyn ServiceRegistry, my_key: &str, type_name: &str) {
        let Some(peers) = registry.default_peers(type_name) else {
            debug!("{} declares no peers", type_name);
            return;
        };

        for peer in peers.iter() {
            let full_key = peer_key(my_key, &peer.key);
            let actual = peer
                .actual_name
                .clone()
                .unwrap_or_else(|| full_key.clone());
            self.reserve(
                &full_key,
                ServiceReservation::new(
                    full_key.clone(),
                    Some(actual),
                    peer.type_name.clone(),
                    peer.comment.clone(),
                ),
            );
        }

        for peer in peers.iter() {
            if let Some(peer_type) = &peer.type_name {
                self.build(registry, &peer_key(my_key, &peer.key), peer_type);
            }
        }
    }
}

fn merge_field(
    key: &str,
    field: &'static str,
    existing: &mut Option<String>,
    incoming: Option<String>,
    filled: &mut Vec<&'static str>,
) {
    let Some(value) = incoming else { return };
    match existing {
        None => {
            *existing = Some(value);
            filled.push(field);
        }
        Some(kept) if *kept != value => {
            // first writer wins per field - logged, not fatal
            warn!(
                "{}",
                Error::ReservationConflict { key: key.to_string(), field }
            );
        }
        Some(_) => {}
    }
}
