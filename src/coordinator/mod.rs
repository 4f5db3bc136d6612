//! Consumer coordinator: multiplexes many logical consumers over a small
//! pool of broker connections and keeps their subscriptions alive across
//! connection loss and topology changes.

mod directory;
mod manager;
mod pool;
mod recovery;
mod registry;
mod tracker;

#[cfg(test)]
pub(crate) mod test_support;

use crate::client::{ClientFactory, ClientParameters, StreamClient};
use crate::config::CoordinatorConfig;
use crate::consumer::{ConsumerHandle, MessageHandler, SubscriptionListener, TrackingClosingCallback};
use crate::error::RillmqClientError;
use crate::flow::FlowStrategyBuilder;
use crate::metrics::{CoordinatorMetrics, MetricsSnapshot};
use crate::protocol::{Broker, OffsetSpec};
use crate::Result;
use manager::SubscriptionManager;
use parking_lot::Mutex;
use pool::{ManagerPool, PoolKey};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracker::{SubscriptionTracker, TrackerState};
use tracing::{debug, info};

/// Coordinates consumer subscriptions over pooled connections.
///
/// One instance per environment; all public methods are safe to call from
/// any task. Must be created inside a tokio runtime, which recovery tasks
/// are spawned on.
pub struct ConsumerCoordinator {
    inner: Arc<CoordinatorInner>,
}

pub(crate) struct CoordinatorInner {
    pub(crate) config: CoordinatorConfig,
    pub(crate) locator: Arc<dyn StreamClient>,
    pub(crate) client_factory: Arc<dyn ClientFactory>,
    pub(crate) metrics: Arc<CoordinatorMetrics>,
    pub(crate) handle: tokio::runtime::Handle,
    /// Serializes structural pool changes (manager pick/create + subscribe).
    admission: tokio::sync::Mutex<()>,
    pool: Mutex<ManagerPool>,
    closed: AtomicBool,
    manager_ids: AtomicU64,
    broker_cursor: AtomicUsize,
}

impl ConsumerCoordinator {
    /// `locator` is the connection used for metadata lookups; subscriptions
    /// get their own pooled connections from `client_factory`.
    pub fn new(
        locator: Arc<dyn StreamClient>,
        client_factory: Arc<dyn ClientFactory>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                config,
                locator,
                client_factory,
                metrics: Arc::new(CoordinatorMetrics::default()),
                handle: tokio::runtime::Handle::current(),
                admission: tokio::sync::Mutex::new(()),
                pool: Mutex::new(ManagerPool::default()),
                closed: AtomicBool::new(false),
                manager_ids: AtomicU64::new(0),
                broker_cursor: AtomicUsize::new(0),
            }),
        }
    }

    /// Subscribes a consumer to a stream and returns its closer handle.
    ///
    /// Resolves the nodes serving the stream (replicas preferred), places
    /// the subscription on a pooled connection to one of them and opens it
    /// on the broker. With a `consumer_name`, the server-side stored offset
    /// takes precedence over `offset_spec` when one exists, and the name is
    /// sent to the broker in the subscription properties.
    #[allow(clippy::too_many_arguments)]
    pub async fn subscribe(
        &self,
        consumer: Arc<dyn ConsumerHandle>,
        stream: &str,
        offset_spec: Option<OffsetSpec>,
        consumer_name: Option<String>,
        subscription_listener: Arc<dyn SubscriptionListener>,
        tracking_closing_callback: TrackingClosingCallback,
        message_handler: MessageHandler,
        flow_strategy_builder: Arc<dyn FlowStrategyBuilder>,
        properties: HashMap<String, String>,
    ) -> Result<SubscriptionHandle> {
        if self.inner.is_closed() {
            return Err(RillmqClientError::closed("consumer coordinator is closed"));
        }
        let candidates = directory::find_brokers_for_stream(&self.inner.locator, stream).await?;
        let initial_offset_spec = offset_spec.unwrap_or_default();
        let tracker = Arc::new(SubscriptionTracker::new(
            stream,
            consumer_name,
            initial_offset_spec.clone(),
            properties,
            consumer,
            message_handler,
            subscription_listener,
            tracking_closing_callback,
            flow_strategy_builder,
        ));
        let broker = self.inner.pick_broker(&candidates);
        add_to_broker(&self.inner, broker, &tracker, initial_offset_spec, true).await?;
        Ok(SubscriptionHandle {
            inner: self.inner.clone(),
            tracker,
        })
    }

    /// Nodes currently able to serve a stream, replicas preferred.
    pub async fn find_brokers_for_stream(&self, stream: &str) -> Result<Vec<Broker>> {
        directory::find_brokers_for_stream(&self.inner.locator, stream).await
    }

    /// Closes every subscription and connection. Idempotent; subsequent
    /// subscribes fail.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // in-flight admissions either land before the drain or fail the
        // closed check afterwards
        let managers = {
            let _admission = self.inner.admission.lock().await;
            self.inner.pool.lock().drain()
        };
        futures::future::join_all(managers.iter().map(|manager| manager.shutdown())).await;
        info!(managers = managers.len(), "consumer coordinator closed");
    }

    pub fn manager_count(&self) -> usize {
        self.inner.pool.lock().manager_count()
    }

    pub fn tracker_count(&self) -> usize {
        self.info().consumer_count()
    }

    /// Snapshot of the managers and the subscriptions they host.
    pub fn info(&self) -> CoordinatorInfo {
        let managers = self.inner.pool.lock().managers();
        CoordinatorInfo {
            clients: managers.iter().map(|manager| manager.info()).collect(),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }
}

impl fmt::Display for ConsumerCoordinator {
    /// Renders the introspection snapshot as JSON.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(&self.info()).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

impl CoordinatorInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn remove_manager(&self, manager_id: u64) -> bool {
        self.pool.lock().remove(manager_id)
    }

    /// Disposes a manager if it is still empty, under the admission lock so
    /// the check cannot interleave with a subscription being placed on it.
    pub(crate) async fn dispose_manager_if_empty(
        &self,
        manager: &Arc<SubscriptionManager>,
    ) -> bool {
        let _admission = self.admission.lock().await;
        if !manager.is_empty() {
            return false;
        }
        if !self.remove_manager(manager.id()) {
            return false;
        }
        manager.mark_closed();
        manager.close_client().await;
        true
    }

    /// Round-robin pick among the candidate nodes.
    pub(crate) fn pick_broker(&self, candidates: &[Broker]) -> Broker {
        debug_assert!(!candidates.is_empty());
        let index = self.broker_cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        candidates[index].clone()
    }
}

/// Places a tracker on a pooled connection to `broker`, creating a new
/// manager only when every existing one in the bucket is full.
pub(crate) async fn add_to_broker(
    inner: &Arc<CoordinatorInner>,
    broker: Broker,
    tracker: &Arc<SubscriptionTracker>,
    offset_spec: OffsetSpec,
    first_subscription: bool,
) -> Result<()> {
    let key = PoolKey::new(broker, inner.config.connection_name.clone());
    let _admission = inner.admission.lock().await;
    if inner.is_closed() {
        return Err(RillmqClientError::closed("consumer coordinator is closed"));
    }
    loop {
        let existing = inner.pool.lock().first_available(&key);
        let manager = match existing {
            Some(manager) => manager,
            None => new_manager(inner, &key).await?,
        };
        match SubscriptionManager::add(&manager, tracker, offset_spec.clone(), first_subscription)
            .await
        {
            Ok(()) => return Ok(()),
            Err(err) => {
                if !manager.client_open() {
                    // the connection died under us; drop the manager and
                    // place the tracker elsewhere
                    debug!(manager = manager.id(), "dropping manager with dead connection");
                    inner.pool.lock().remove(manager.id());
                    manager.mark_closed();
                    continue;
                }
                if manager.is_empty() && inner.pool.lock().remove(manager.id()) {
                    manager.mark_closed();
                    manager.close_client().await;
                }
                return Err(err);
            }
        }
    }
}

async fn new_manager(
    inner: &Arc<CoordinatorInner>,
    key: &PoolKey,
) -> Result<Arc<SubscriptionManager>> {
    let manager = Arc::new(SubscriptionManager::new(
        inner.manager_ids.fetch_add(1, Ordering::Relaxed),
        key.clone(),
        inner.config.max_subscriptions_per_client,
        inner.config.offset_query_attempts,
        inner.metrics.clone(),
    ));
    let listeners = recovery::client_listeners(inner, &manager);
    let parameters = ClientParameters {
        broker: key.broker.clone(),
        connection_name: key.connection_name.clone(),
        listeners,
    };
    let client = inner.client_factory.client(parameters).await?;
    inner.metrics.record_client_created();
    manager.attach_client(client);
    inner.pool.lock().insert(key.clone(), manager.clone());
    debug!(manager = manager.id(), key = %key, "manager created");
    Ok(manager)
}

/// Closer returned by [`ConsumerCoordinator::subscribe`].
///
/// Idempotent: however many times it runs, the broker sees one unsubscribe
/// and the tracking closing callback fires once. Never fails; broker errors
/// on the way out are logged.
pub struct SubscriptionHandle {
    inner: Arc<CoordinatorInner>,
    tracker: Arc<SubscriptionTracker>,
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle").finish_non_exhaustive()
    }
}

impl SubscriptionHandle {
    pub async fn close(&self) {
        if !self.tracker.mark_closer_done() {
            return;
        }
        self.tracker.set_state(TrackerState::Closed);
        if let Some(assignment) = self.tracker.take_assignment() {
            if let Err(err) = assignment.client.unsubscribe(assignment.subscription_id).await {
                debug!(
                    stream = %self.tracker.stream,
                    subscription_id = assignment.subscription_id,
                    %err,
                    "unsubscribe failed while closing"
                );
            }
            let now_empty = assignment.manager.release_slot(assignment.subscription_id);
            if now_empty {
                self.inner.dispose_manager_if_empty(&assignment.manager).await;
            }
        }
        (self.tracker.tracking_closing_callback)();
        self.inner.metrics.record_subscription_closed();
    }
}

/// Introspection snapshot of the coordinator. Serializes to JSON.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorInfo {
    pub clients: Vec<ManagerInfo>,
}

impl CoordinatorInfo {
    pub fn consumer_count(&self) -> usize {
        self.clients.iter().map(|client| client.consumer_count).sum()
    }

    /// Distinct broker nodes with at least one connection.
    pub fn nodes_connected(&self) -> BTreeSet<String> {
        self.clients.iter().map(|client| client.node.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// One manager in the snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerInfo {
    pub node: String,
    pub consumer_count: usize,
    pub consumers: Vec<TrackerInfo>,
}

/// One hosted subscription in the snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct TrackerInfo {
    pub stream: String,
    pub subscription_id: u8,
}
