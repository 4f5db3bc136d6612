//! Consumer flow-control strategies.
//!
//! A strategy decides how much delivery credit a subscription starts with
//! and when to grant more. The coordinator forwards every delivered chunk;
//! granting credit back to the broker is entirely the strategy's business.

use crate::client::StreamClient;
use crate::protocol::{Message, OffsetSpec};
use std::sync::Arc;

/// Flow-control decisions for one subscription.
pub trait ConsumerFlowStrategy: Send + Sync {
    /// Credit count to attach to the subscribe request. `first_subscription`
    /// is false when re-subscribing during recovery.
    fn handle_subscribe(&self, offset_spec: &OffsetSpec, first_subscription: bool) -> u16;

    /// Called for every delivered chunk, before the user message handler.
    fn handle_message(
        &self,
        offset: u64,
        chunk_timestamp: i64,
        committed_offset: u64,
        message: &Message,
    );
}

/// Builds a strategy bound to the connection and subscription id in use.
///
/// Rebuilt on every (re-)subscription because recovery may move the
/// subscription to another connection.
pub trait FlowStrategyBuilder: Send + Sync {
    fn build(
        &self,
        client: Arc<dyn StreamClient>,
        subscription_id: u8,
    ) -> Arc<dyn ConsumerFlowStrategy>;
}

/// Default strategy: a fixed initial credit window, then one credit granted
/// back for every delivered chunk.
pub struct SynchronousFlowStrategy {
    client: Arc<dyn StreamClient>,
    subscription_id: u8,
    initial_credits: u16,
}

impl ConsumerFlowStrategy for SynchronousFlowStrategy {
    fn handle_subscribe(&self, _offset_spec: &OffsetSpec, _first_subscription: bool) -> u16 {
        self.initial_credits
    }

    fn handle_message(
        &self,
        _offset: u64,
        _chunk_timestamp: i64,
        _committed_offset: u64,
        _message: &Message,
    ) {
        self.client.credit(self.subscription_id, 1);
    }
}

/// Builder for [`SynchronousFlowStrategy`].
#[derive(Debug, Clone, Copy)]
pub struct SynchronousFlowStrategyBuilder {
    initial_credits: u16,
}

impl SynchronousFlowStrategyBuilder {
    pub fn new(initial_credits: u16) -> Self {
        Self { initial_credits }
    }
}

impl Default for SynchronousFlowStrategyBuilder {
    fn default() -> Self {
        Self {
            initial_credits: 10,
        }
    }
}

impl FlowStrategyBuilder for SynchronousFlowStrategyBuilder {
    fn build(
        &self,
        client: Arc<dyn StreamClient>,
        subscription_id: u8,
    ) -> Arc<dyn ConsumerFlowStrategy> {
        Arc::new(SynchronousFlowStrategy {
            client,
            subscription_id,
            initial_credits: self.initial_credits,
        })
    }
}
