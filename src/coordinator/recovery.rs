//! Recovery engine: reacts to connection loss and topology changes by
//! re-subscribing the affected consumers at the right offset.

use super::directory::{self, CandidateLookup};
use super::manager::SubscriptionManager;
use super::tracker::{SubscriptionTracker, TrackerState};
use super::CoordinatorInner;
use crate::client::{ClientListeners, MessageListener, MetadataListener, ShutdownContext, ShutdownListener};
use crate::config::BackOffDelayPolicy;
use crate::error::RillmqClientError;
use crate::protocol::{Broker, ResponseCode};
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Builds the listener callbacks wired into a new connection.
///
/// The callbacks hold weak references: a dropped coordinator or manager
/// turns late broker events into no-ops instead of keeping them alive.
pub(crate) fn client_listeners(
    inner: &Arc<CoordinatorInner>,
    manager: &Arc<SubscriptionManager>,
) -> ClientListeners {
    let message: MessageListener = {
        let manager = Arc::downgrade(manager);
        Arc::new(
            move |subscription_id, offset, chunk_timestamp, committed_offset, message| {
                if let Some(manager) = manager.upgrade() {
                    manager.dispatch(
                        subscription_id,
                        offset,
                        chunk_timestamp,
                        committed_offset,
                        message,
                    );
                }
            },
        )
    };

    let shutdown: ShutdownListener = {
        let inner = Arc::downgrade(inner);
        let manager = Arc::downgrade(manager);
        Arc::new(move |context: ShutdownContext| {
            if !context.is_unexpected() {
                return;
            }
            let (Some(inner), Some(manager)) = (inner.upgrade(), manager.upgrade()) else {
                return;
            };
            if inner.is_closed() {
                return;
            }
            manager.mark_closed();
            inner
                .handle
                .spawn(handle_connection_shutdown(inner.clone(), manager, context));
        })
    };

    let metadata: MetadataListener = {
        let inner = Arc::downgrade(inner);
        let manager = Arc::downgrade(manager);
        Arc::new(move |stream: &str, code: ResponseCode| {
            if code.is_ok() {
                return;
            }
            let (Some(inner), Some(manager)) = (inner.upgrade(), manager.upgrade()) else {
                return;
            };
            if inner.is_closed() {
                return;
            }
            let (affected, now_empty) = manager.take_stream_trackers(stream);
            if affected.is_empty() {
                return;
            }
            debug!(
                %stream,
                %code,
                affected = affected.len(),
                "metadata update, moving its subscriptions"
            );
            let recoverable = begin_recovery(affected);
            inner.handle.spawn(handle_metadata_update(
                inner.clone(),
                manager,
                stream.to_string(),
                recoverable,
                now_empty,
            ));
        })
    };

    ClientListeners {
        message: Some(message),
        shutdown: Some(shutdown),
        metadata: Some(metadata),
    }
}

/// Marks trackers as recovering and performs the disconnection handshake.
///
/// The `Active -> Recovering` transition is a compare-and-set, so a second
/// disruption arriving while recovery is in flight coalesces into it instead
/// of producing a duplicate subscription. Abandoned consumers are dropped.
fn begin_recovery(trackers: Vec<Arc<SubscriptionTracker>>) -> Vec<Arc<SubscriptionTracker>> {
    let mut recoverable = Vec::with_capacity(trackers.len());
    for tracker in trackers {
        if !tracker.compare_and_set_state(TrackerState::Active, TrackerState::Recovering) {
            debug!(stream = %tracker.stream, "recovery already in flight, coalescing");
            continue;
        }
        tracker.clear_assignment();
        tracker.consumer.set_subscription_client(None);
        if !tracker.consumer.is_open() {
            debug!(stream = %tracker.stream, "consumer no longer open, dropping from recovery");
            tracker.set_state(TrackerState::Closed);
            continue;
        }
        recoverable.push(tracker);
    }
    recoverable
}

/// Connection lost: every subscription of the manager is re-homed.
async fn handle_connection_shutdown(
    inner: Arc<CoordinatorInner>,
    manager: Arc<SubscriptionManager>,
    context: ShutdownContext,
) {
    info!(
        manager = manager.id(),
        reason = ?context.reason,
        "connection lost, recovering its subscriptions"
    );
    inner.remove_manager(manager.id());
    for (stream, trackers) in manager.drain_all_trackers() {
        let recoverable = begin_recovery(trackers);
        if recoverable.is_empty() {
            continue;
        }
        inner.metrics.record_recovery_started();
        let policy = inner.config.recovery_back_off.clone();
        inner.handle.spawn(assign_consumers_to_stream(
            inner.clone(),
            stream,
            recoverable,
            policy,
        ));
    }
}

/// Topology changed for one stream: only its subscriptions move; the
/// manager survives unless that left it empty.
async fn handle_metadata_update(
    inner: Arc<CoordinatorInner>,
    manager: Arc<SubscriptionManager>,
    stream: String,
    trackers: Vec<Arc<SubscriptionTracker>>,
    now_empty: bool,
) {
    if now_empty && inner.dispose_manager_if_empty(&manager).await {
        debug!(manager = manager.id(), "manager emptied by metadata update, closed");
    }
    if trackers.is_empty() {
        return;
    }
    inner.metrics.record_recovery_started();
    let policy = inner.config.topology_update_back_off.clone();
    assign_consumers_to_stream(inner, stream, trackers, policy).await;
}

/// Re-homes a group of subscriptions of one stream, waiting out the back-off
/// policy between candidate lookups.
async fn assign_consumers_to_stream(
    inner: Arc<CoordinatorInner>,
    stream: String,
    trackers: Vec<Arc<SubscriptionTracker>>,
    policy: BackOffDelayPolicy,
) {
    let mut attempt = 0;
    let candidates = loop {
        if inner.is_closed() {
            return;
        }
        let Some(delay) = policy.delay(attempt) else {
            warn!(%stream, "no node came back within the retry budget, closing the consumers");
            for tracker in &trackers {
                close_tracker(&inner, tracker);
            }
            return;
        };
        attempt += 1;
        sleep(delay).await;
        match directory::lookup_candidates(&inner.locator, &stream).await {
            Ok(CandidateLookup::Found(candidates)) => break candidates,
            Ok(CandidateLookup::Missing) => {
                info!(%stream, "stream disappeared, closing its consumers");
                for tracker in &trackers {
                    close_tracker(&inner, tracker);
                }
                return;
            }
            Ok(CandidateLookup::Failed(code)) => {
                warn!(%stream, %code, "metadata lookup failed, closing the consumers");
                for tracker in &trackers {
                    close_tracker(&inner, tracker);
                }
                return;
            }
            Ok(CandidateLookup::NoNodes) => {
                debug!(%stream, attempt, "no node available yet, retrying");
            }
            Err(err) => {
                debug!(%stream, attempt, %err, "candidate lookup failed, retrying");
            }
        }
    };
    for tracker in trackers {
        recover_subscription(&inner, &stream, candidates.clone(), tracker, &policy).await;
    }
}

/// Re-subscribes one tracker, re-resolving candidates after each failed
/// attempt until the policy budget runs out.
async fn recover_subscription(
    inner: &Arc<CoordinatorInner>,
    stream: &str,
    mut candidates: Vec<Broker>,
    tracker: Arc<SubscriptionTracker>,
    policy: &BackOffDelayPolicy,
) {
    let mut attempt = 0;
    loop {
        if inner.is_closed() {
            return;
        }
        if tracker.state() != TrackerState::Recovering || !tracker.consumer.is_open() {
            debug!(%stream, "subscription no longer recoverable, skipping");
            return;
        }
        let broker = inner.pick_broker(&candidates);
        let offset_spec = tracker.resume_offset_spec();
        match super::add_to_broker(inner, broker, &tracker, offset_spec, false).await {
            Ok(()) => {
                inner.metrics.record_recovery_completed();
                return;
            }
            Err(RillmqClientError::StreamDoesNotExist { .. }) => {
                info!(%stream, "stream disappeared while re-subscribing, closing the consumer");
                close_tracker(inner, &tracker);
                return;
            }
            Err(err) => {
                warn!(%stream, %err, "re-subscription failed, looking the stream up again");
            }
        }
        // fresh candidates before the next attempt
        loop {
            if inner.is_closed() {
                return;
            }
            let Some(delay) = policy.delay(attempt) else {
                warn!(%stream, "re-subscription retry budget exhausted, closing the consumer");
                close_tracker(inner, &tracker);
                return;
            };
            attempt += 1;
            sleep(delay).await;
            match directory::lookup_candidates(&inner.locator, stream).await {
                Ok(CandidateLookup::Found(found)) => {
                    candidates = found;
                    break;
                }
                Ok(CandidateLookup::Missing) => {
                    info!(%stream, "stream disappeared, closing the consumer");
                    close_tracker(inner, &tracker);
                    return;
                }
                Ok(CandidateLookup::Failed(code)) => {
                    warn!(%stream, %code, "metadata lookup failed, closing the consumer");
                    close_tracker(inner, &tracker);
                    return;
                }
                Ok(CandidateLookup::NoNodes) => {
                    debug!(%stream, attempt, "no node available yet, retrying");
                }
                Err(err) => {
                    debug!(%stream, attempt, %err, "candidate lookup failed, retrying");
                }
            }
        }
    }
}

/// Terminal failure for one tracker: the consumer is closed, not errored.
fn close_tracker(inner: &Arc<CoordinatorInner>, tracker: &Arc<SubscriptionTracker>) {
    if tracker.compare_and_set_state(TrackerState::Recovering, TrackerState::Closed) {
        tracker.consumer.close_after_stream_deletion();
        inner.metrics.record_consumer_closed_on_stream_deletion();
    }
}
