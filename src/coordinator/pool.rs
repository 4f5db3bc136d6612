//! Pooling of subscription managers per broker node.

use super::manager::SubscriptionManager;
use crate::protocol::Broker;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Pool bucket key: the broker a connection points at plus the connection
/// category, so e.g. consumer and locator connections never share managers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct PoolKey {
    pub broker: Broker,
    pub connection_name: String,
}

impl PoolKey {
    pub(crate) fn new(broker: Broker, connection_name: String) -> Self {
        Self {
            broker,
            connection_name,
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.broker, self.connection_name)
    }
}

/// Buckets of managers, one bucket per (broker, connection name).
///
/// A manager with a free slot is always preferred; a new one is created only
/// when every manager in the bucket is full. Structure is mutated under the
/// coordinator-wide lock.
#[derive(Default)]
pub(crate) struct ManagerPool {
    buckets: HashMap<PoolKey, Vec<Arc<SubscriptionManager>>>,
}

impl ManagerPool {
    /// First open manager in the bucket with a free slot, if any.
    pub(crate) fn first_available(&self, key: &PoolKey) -> Option<Arc<SubscriptionManager>> {
        self.buckets.get(key)?.iter().find(|manager| manager.is_open() && manager.has_free_slot()).cloned()
    }

    pub(crate) fn insert(&mut self, key: PoolKey, manager: Arc<SubscriptionManager>) {
        self.buckets.entry(key).or_default().push(manager);
    }

    /// Removes a manager wherever it lives. Returns whether it was present,
    /// so removal doubles as a once-only guard.
    pub(crate) fn remove(&mut self, manager_id: u64) -> bool {
        let mut removed = false;
        self.buckets.retain(|_, managers| {
            managers.retain(|manager| {
                let keep = manager.id() != manager_id;
                if !keep {
                    removed = true;
                }
                keep
            });
            !managers.is_empty()
        });
        removed
    }

    pub(crate) fn manager_count(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub(crate) fn managers(&self) -> Vec<Arc<SubscriptionManager>> {
        self.buckets.values().flatten().cloned().collect()
    }

    pub(crate) fn drain(&mut self) -> Vec<Arc<SubscriptionManager>> {
        std::mem::take(&mut self.buckets)
            .into_values()
            .flatten()
            .collect()
    }
}
