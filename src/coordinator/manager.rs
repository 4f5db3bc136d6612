//! One connection hosting up to 256 subscriptions.

use super::pool::PoolKey;
use super::registry::SubscriptionRegistry;
use super::tracker::{Assignment, SubscriptionTracker, TrackerState};
use super::{ManagerInfo, TrackerInfo};
use crate::client::StreamClient;
use crate::consumer::SubscriptionContext;
use crate::error::RillmqClientError;
use crate::metrics::CoordinatorMetrics;
use crate::protocol::{Message, OffsetSpec, ResponseCode};
use crate::Result;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ManagerState {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

struct SlotTable {
    trackers: Vec<Option<Arc<SubscriptionTracker>>>,
    occupied: usize,
    registry: SubscriptionRegistry,
}

/// Owns one connection and the slot table mapping subscription ids to
/// trackers. Slot `i` always corresponds to subscription id `i`.
///
/// The client handle is attached after construction because the connection
/// listeners need a reference to the manager they report into.
pub(crate) struct SubscriptionManager {
    id: u64,
    key: PoolKey,
    max_subscriptions: usize,
    offset_query_attempts: usize,
    client: OnceCell<Arc<dyn StreamClient>>,
    state: AtomicU8,
    slots: Mutex<SlotTable>,
    metrics: Arc<CoordinatorMetrics>,
}

impl SubscriptionManager {
    pub(crate) fn new(
        id: u64,
        key: PoolKey,
        max_subscriptions: usize,
        offset_query_attempts: usize,
        metrics: Arc<CoordinatorMetrics>,
    ) -> Self {
        Self {
            id,
            key,
            max_subscriptions,
            offset_query_attempts,
            client: OnceCell::new(),
            state: AtomicU8::new(ManagerState::Open as u8),
            slots: Mutex::new(SlotTable {
                trackers: vec![None; max_subscriptions],
                occupied: 0,
                registry: SubscriptionRegistry::default(),
            }),
            metrics,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn attach_client(&self, client: Arc<dyn StreamClient>) {
        if self.client.set(client).is_err() {
            warn!(manager = self.id, "client already attached");
        }
    }

    pub(crate) fn client(&self) -> Option<Arc<dyn StreamClient>> {
        self.client.get().cloned()
    }

    pub(crate) fn client_open(&self) -> bool {
        self.client.get().map(|c| c.is_open()).unwrap_or(false)
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state.load(Ordering::SeqCst) == ManagerState::Open as u8
    }

    pub(crate) fn mark_closed(&self) {
        self.state
            .store(ManagerState::Closed as u8, Ordering::SeqCst);
    }

    pub(crate) fn has_free_slot(&self) -> bool {
        self.slots.lock().occupied < self.max_subscriptions
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.lock().occupied == 0
    }

    /// Claims the lowest free slot for a tracker.
    pub(crate) fn reserve_slot(&self, tracker: &Arc<SubscriptionTracker>) -> Option<u8> {
        let mut slots = self.slots.lock();
        let index = slots.trackers.iter().position(Option::is_none)?;
        slots.trackers[index] = Some(tracker.clone());
        slots.occupied += 1;
        slots.registry.insert(&tracker.stream, index as u8);
        Some(index as u8)
    }

    /// Clears a slot; returns whether the manager is now empty.
    pub(crate) fn release_slot(&self, subscription_id: u8) -> bool {
        let mut slots = self.slots.lock();
        if let Some(tracker) = slots.trackers[subscription_id as usize].take() {
            slots.occupied -= 1;
            slots.registry.remove(&tracker.stream, subscription_id);
        }
        slots.occupied == 0
    }

    /// Places a tracker in a slot and opens the subscription on the broker.
    ///
    /// On any failure the slot is released again before the error
    /// propagates, so a failed call leaves no trace.
    pub(crate) async fn add(
        manager: &Arc<Self>,
        tracker: &Arc<SubscriptionTracker>,
        offset_spec: OffsetSpec,
        first_subscription: bool,
    ) -> Result<()> {
        if !manager.is_open() {
            return Err(RillmqClientError::connection("manager is closed"));
        }
        let client = manager
            .client()
            .ok_or_else(|| RillmqClientError::illegal_state("no client attached to manager"))?;
        if !client.is_open() {
            return Err(RillmqClientError::connection("connection is closed"));
        }
        let subscription_id = manager
            .reserve_slot(tracker)
            .ok_or_else(|| RillmqClientError::illegal_state("no free subscription slot"))?;

        match Self::subscribe_on_broker(
            manager,
            &client,
            tracker,
            subscription_id,
            offset_spec,
            first_subscription,
        )
        .await
        {
            Ok(()) => Ok(()),
            Err(err) => {
                tracker.clear_assignment();
                manager.release_slot(subscription_id);
                Err(err)
            }
        }
    }

    async fn subscribe_on_broker(
        manager: &Arc<Self>,
        client: &Arc<dyn StreamClient>,
        tracker: &Arc<SubscriptionTracker>,
        subscription_id: u8,
        offset_spec: OffsetSpec,
        first_subscription: bool,
    ) -> Result<()> {
        let mut effective_spec = offset_spec;
        if let Some(reference) = tracker.consumer_name.clone() {
            if let Some(stored) = manager
                .query_stored_offset(client, &reference, &tracker.stream)
                .await?
            {
                if first_subscription {
                    debug!(
                        stream = %tracker.stream,
                        reference,
                        stored,
                        "requested offset ignored in favor of the stored offset"
                    );
                }
                effective_spec = OffsetSpec::Offset(stored + 1);
            }
        }

        let mut context = SubscriptionContext {
            stream: tracker.stream.clone(),
            subscription_id,
            offset_spec: effective_spec,
        };
        tracker.subscription_listener.pre_subscribe(&mut context);

        let flow = tracker.flow_builder.build(client.clone(), subscription_id);
        let credits = flow.handle_subscribe(&context.offset_spec, first_subscription);

        let mut properties = tracker.properties.clone();
        if let Some(name) = &tracker.consumer_name {
            properties.insert("name".to_string(), name.clone());
        }

        tracker.set_assignment(Assignment {
            manager: manager.clone(),
            subscription_id,
            client: client.clone(),
            flow,
        });

        let response = client
            .subscribe(
                subscription_id,
                &tracker.stream,
                context.offset_spec.clone(),
                credits,
                properties,
            )
            .await?;
        if !response.is_ok() {
            return Err(match response.code {
                ResponseCode::StreamNotAvailable => {
                    RillmqClientError::stream_not_available(&tracker.stream)
                }
                ResponseCode::StreamDoesNotExist => {
                    RillmqClientError::stream_does_not_exist(&tracker.stream)
                }
                code => RillmqClientError::subscription(code),
            });
        }

        tracker.set_state(TrackerState::Active);
        tracker
            .consumer
            .set_subscription_client(Some(client.clone()));
        manager.metrics.record_subscription_created();
        debug!(
            manager = manager.id,
            subscription_id,
            stream = %tracker.stream,
            offset_spec = %context.offset_spec,
            "subscription opened"
        );
        Ok(())
    }

    /// Stored offset for a named consumer, `None` when nothing is stored.
    /// Timeouts are retried a bounded number of times.
    async fn query_stored_offset(
        &self,
        client: &Arc<dyn StreamClient>,
        reference: &str,
        stream: &str,
    ) -> Result<Option<u64>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match client.query_offset(reference, stream).await {
                Ok(response) if response.is_ok() && response.offset != 0 => {
                    return Ok(Some(response.offset));
                }
                Ok(_) => return Ok(None),
                Err(err) if err.is_timeout() && attempt < self.offset_query_attempts => {
                    debug!(reference, stream, attempt, "stored offset query timed out, retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Routes an inbound delivery to its tracker. Frames for unknown ids are
    /// dropped; the user handler runs outside the slot lock.
    pub(crate) fn dispatch(
        &self,
        subscription_id: u8,
        offset: u64,
        chunk_timestamp: i64,
        committed_offset: u64,
        message: Message,
    ) {
        let tracker = {
            let slots = self.slots.lock();
            slots
                .trackers
                .get(subscription_id as usize)
                .and_then(Clone::clone)
        };
        let Some(tracker) = tracker else {
            trace!(
                manager = self.id,
                subscription_id,
                "dropping delivery for unknown subscription"
            );
            return;
        };
        tracker.record_delivery(offset);
        if let Some(flow) = tracker.current_flow() {
            flow.handle_message(offset, chunk_timestamp, committed_offset, &message);
        }
        (tracker.message_handler)(offset, message);
    }

    /// Removes every tracker of a stream from the slot table. Returns the
    /// trackers and whether the manager is now empty.
    pub(crate) fn take_stream_trackers(
        &self,
        stream: &str,
    ) -> (Vec<Arc<SubscriptionTracker>>, bool) {
        let mut slots = self.slots.lock();
        let ids = slots.registry.take_stream(stream);
        let mut trackers = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(tracker) = slots.trackers[id as usize].take() {
                slots.occupied -= 1;
                trackers.push(tracker);
            }
        }
        (trackers, slots.occupied == 0)
    }

    /// Empties the slot table, grouping the trackers by stream.
    pub(crate) fn drain_all_trackers(&self) -> Vec<(String, Vec<Arc<SubscriptionTracker>>)> {
        let mut slots = self.slots.lock();
        let mut by_stream: HashMap<String, Vec<Arc<SubscriptionTracker>>> = HashMap::new();
        for slot in slots.trackers.iter_mut() {
            if let Some(tracker) = slot.take() {
                by_stream.entry(tracker.stream.clone()).or_default().push(tracker);
            }
        }
        slots.occupied = 0;
        slots.registry.clear();
        by_stream.into_iter().collect()
    }

    pub(crate) async fn close_client(&self) {
        if let Some(client) = self.client() {
            client.close().await;
            self.metrics.record_client_closed();
        }
    }

    /// Coordinator shutdown: best-effort unsubscribe of every live slot,
    /// then close the connection.
    pub(crate) async fn shutdown(&self) {
        self.state
            .store(ManagerState::Closing as u8, Ordering::SeqCst);
        let entries: Vec<(u8, Arc<SubscriptionTracker>)> = {
            let slots = self.slots.lock();
            slots
                .trackers
                .iter()
                .enumerate()
                .filter_map(|(index, slot)| {
                    slot.as_ref().map(|tracker| (index as u8, tracker.clone()))
                })
                .collect()
        };
        if let Some(client) = self.client() {
            for (subscription_id, tracker) in &entries {
                tracker.set_state(TrackerState::Closed);
                tracker.clear_assignment();
                if let Err(err) = client.unsubscribe(*subscription_id).await {
                    debug!(
                        manager = self.id,
                        subscription_id,
                        %err,
                        "unsubscribe failed during shutdown"
                    );
                }
            }
        }
        {
            let mut slots = self.slots.lock();
            slots.trackers.iter_mut().for_each(|slot| *slot = None);
            slots.occupied = 0;
            slots.registry.clear();
        }
        self.close_client().await;
        self.mark_closed();
    }

    pub(crate) fn info(&self) -> ManagerInfo {
        let slots = self.slots.lock();
        let consumers = slots
            .trackers
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.as_ref().map(|tracker| TrackerInfo {
                    stream: tracker.stream.clone(),
                    subscription_id: index as u8,
                })
            })
            .collect();
        ManagerInfo {
            node: self.key.broker.to_string(),
            consumer_count: slots.occupied,
            consumers,
        }
    }
}
