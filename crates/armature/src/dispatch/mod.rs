// Invocation engine
//
// Resolves (receiver type, method name, args) to an executable target:
//
//   1. exact match - name + arity + per-position argument kinds
//   2. resolution-cache hit for the same shape
//   3. linear compatibility scan - name + arity only, first declaration
//      wins; the result is cached
//   4. MethodNotFound
//
// Exact match keeps the common statically-shaped path fast; the scan+cache
// path trades a one-time linear cost for amortized O(1) dispatch on
// repeated calls whose value kinds differ from the declared parameter
// kinds (e.g. an integer passed where a float was declared).

mod cache;
mod table;

pub use cache::{ResolutionCache, ResolutionKey, DEFAULT_CACHE_CAPACITY};
pub use table::{kind_of, signature_of, ArgKind, MethodEntry, MethodTable};

use std::any::TypeId;

use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::types::{Error, Result};

/// Resolve and execute `method(args)` against `handler`.
///
/// Fails with `MethodNotFound` when neither an exact nor an
/// arity-compatible candidate exists, or `Invocation` when the target
/// itself raised. The caller decides what to do with the result; emitting
/// it as an outbound event is the service loop's job.
pub fn invoke_on<H: 'static>(
    handler: &mut H,
    table: &MethodTable<H>,
    cache: &ResolutionCache,
    method: &str,
    args: &[Value],
) -> Result<Value> {
    let kinds: Vec<ArgKind> = args.iter().map(kind_of).collect();

    if let Some(slot) = table.find_exact(method, &kinds) {
        return table.invoke_slot(slot, handler, args);
    }

    let key = ResolutionKey {
        type_id: TypeId::of::<H>(),
        method: method.to_string(),
        kinds,
    };
    if let Some(slot) = cache.get(&key) {
        trace!("resolution cache hit for {}", signature_of(method, &key.kinds));
        return table.invoke_slot(slot, handler, args);
    }

    debug!(
        "no exact match for {} - scanning {} methods",
        signature_of(method, &key.kinds),
        table.len()
    );
    if let Some(slot) = table.find_compatible(method, args.len()) {
        cache.insert(key, slot);
        return table.invoke_slot(slot, handler, args);
    }

    let signature = signature_of(method, &key.kinds);
    warn!("did not find method - {}", signature);
    Err(Error::MethodNotFound { signature })
}
