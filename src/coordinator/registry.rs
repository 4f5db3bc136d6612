//! Per-stream bookkeeping of the subscriptions hosted on one connection.

use std::collections::{BTreeSet, HashMap};

/// Maps streams to the subscription ids a connection hosts for them.
///
/// Metadata updates are stream-scoped, so disruption handling needs the
/// reverse view of the slot table. Kept in step with the slots under the
/// manager lock.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionRegistry {
    by_stream: HashMap<String, BTreeSet<u8>>,
}

impl SubscriptionRegistry {
    pub(crate) fn insert(&mut self, stream: &str, subscription_id: u8) {
        self.by_stream
            .entry(stream.to_string())
            .or_default()
            .insert(subscription_id);
    }

    pub(crate) fn remove(&mut self, stream: &str, subscription_id: u8) {
        if let Some(ids) = self.by_stream.get_mut(stream) {
            ids.remove(&subscription_id);
            if ids.is_empty() {
                self.by_stream.remove(stream);
            }
        }
    }

    /// Removes and returns every subscription id of a stream, in id order.
    pub(crate) fn take_stream(&mut self, stream: &str) -> Vec<u8> {
        self.by_stream
            .remove(stream)
            .map(|ids| ids.into_iter().collect())
            .unwrap_or_default()
    }

    pub(crate) fn clear(&mut self) {
        self.by_stream.clear();
    }

    #[cfg(test)]
    pub(crate) fn subscription_count(&self) -> usize {
        self.by_stream.values().map(BTreeSet::len).sum()
    }
}
