//! Per-consumer subscription state.

use super::manager::SubscriptionManager;
use crate::client::StreamClient;
use crate::consumer::{
    ConsumerHandle, MessageHandler, SubscriptionListener, TrackingClosingCallback,
};
use crate::flow::{ConsumerFlowStrategy, FlowStrategyBuilder};
use crate::protocol::OffsetSpec;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Lifecycle of one tracked subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TrackerState {
    New = 0,
    Active = 1,
    Recovering = 2,
    Closed = 3,
}

impl TrackerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TrackerState::New,
            1 => TrackerState::Active,
            2 => TrackerState::Recovering,
            _ => TrackerState::Closed,
        }
    }
}

/// Where a tracker currently lives: the manager slot hosting it, the
/// connection serving it and the flow strategy built for that connection.
pub(crate) struct Assignment {
    pub manager: Arc<SubscriptionManager>,
    pub subscription_id: u8,
    pub client: Arc<dyn StreamClient>,
    pub flow: Arc<dyn ConsumerFlowStrategy>,
}

/// The coordinator's record of one logical consumer.
pub(crate) struct SubscriptionTracker {
    pub stream: String,
    pub consumer_name: Option<String>,
    pub initial_offset_spec: OffsetSpec,
    pub properties: HashMap<String, String>,
    pub consumer: Arc<dyn ConsumerHandle>,
    pub message_handler: MessageHandler,
    pub subscription_listener: Arc<dyn SubscriptionListener>,
    pub tracking_closing_callback: TrackingClosingCallback,
    pub flow_builder: Arc<dyn FlowStrategyBuilder>,
    state: AtomicU8,
    closer_done: AtomicBool,
    last_received_offset: AtomicU64,
    received_something: AtomicBool,
    assignment: Mutex<Option<Assignment>>,
}

impl SubscriptionTracker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        stream: impl Into<String>,
        consumer_name: Option<String>,
        initial_offset_spec: OffsetSpec,
        properties: HashMap<String, String>,
        consumer: Arc<dyn ConsumerHandle>,
        message_handler: MessageHandler,
        subscription_listener: Arc<dyn SubscriptionListener>,
        tracking_closing_callback: TrackingClosingCallback,
        flow_builder: Arc<dyn FlowStrategyBuilder>,
    ) -> Self {
        Self {
            stream: stream.into(),
            consumer_name,
            initial_offset_spec,
            properties,
            consumer,
            message_handler,
            subscription_listener,
            tracking_closing_callback,
            flow_builder,
            state: AtomicU8::new(TrackerState::New as u8),
            closer_done: AtomicBool::new(false),
            last_received_offset: AtomicU64::new(0),
            received_something: AtomicBool::new(false),
            assignment: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> TrackerState {
        TrackerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: TrackerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn compare_and_set_state(&self, expected: TrackerState, new: TrackerState) -> bool {
        self.state
            .compare_exchange(
                expected as u8,
                new as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// One-shot guard making the user-facing closer idempotent.
    pub(crate) fn mark_closer_done(&self) -> bool {
        !self.closer_done.swap(true, Ordering::SeqCst)
    }

    /// Records a dispatched message. The offset only ever advances.
    pub(crate) fn record_delivery(&self, offset: u64) {
        self.last_received_offset.fetch_max(offset, Ordering::AcqRel);
        self.received_something.store(true, Ordering::Release);
    }

    /// Offset to resume from after a disruption: the last dispatched offset
    /// if anything was received (the broker filters already-seen chunks),
    /// otherwise the spec the subscription started with.
    pub(crate) fn resume_offset_spec(&self) -> OffsetSpec {
        if self.received_something.load(Ordering::Acquire) {
            OffsetSpec::Offset(self.last_received_offset.load(Ordering::Acquire))
        } else {
            self.initial_offset_spec.clone()
        }
    }

    pub(crate) fn set_assignment(&self, assignment: Assignment) {
        *self.assignment.lock() = Some(assignment);
    }

    pub(crate) fn take_assignment(&self) -> Option<Assignment> {
        self.assignment.lock().take()
    }

    pub(crate) fn clear_assignment(&self) {
        *self.assignment.lock() = None;
    }

    pub(crate) fn current_flow(&self) -> Option<Arc<dyn ConsumerFlowStrategy>> {
        self.assignment.lock().as_ref().map(|a| a.flow.clone())
    }
}
