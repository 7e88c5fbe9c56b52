//! Best-effort prefetch of the records a freshly materialized node points at.
//!
//! A reader that just loaded a node is very likely to need some of its keys
//! and children next. Anything that sits below the log's indexed length but
//! is not stored locally is requested in a detached task, so the fetch is
//! already in flight when the walk gets there. Results and failures are
//! discarded; the real read will fetch (or fail) on its own.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::trace;

use crate::log::Log;
use crate::tree::TreeNode;

/// Seqs referenced by `node` that are worth fetching ahead of time.
pub fn candidates(log: &dyn Log, node: &TreeNode) -> BTreeSet<u64> {
    let indexed = log.indexed_length();
    let keys = node
        .keys
        .iter()
        .filter(|k| k.value.is_none())
        .map(|k| k.seq);
    let children = node
        .children
        .iter()
        .filter(|c| c.node.is_none())
        .map(|c| c.seq);

    keys.chain(children)
        .filter(|&seq| seq < indexed && !log.has_local(seq))
        .collect()
}

/// Spawns a fetch for every candidate of `node`. Does nothing outside a
/// tokio runtime.
pub fn prefetch(log: &Arc<dyn Log>, node: &TreeNode) {
    let Ok(handle) = Handle::try_current() else {
        return;
    };

    for seq in candidates(log.as_ref(), node) {
        let log = Arc::clone(log);
        handle.spawn(async move {
            if let Err(err) = log.get(seq).await {
                trace!(seq, error = %err, "prefetch failed");
            }
        });
    }
}
