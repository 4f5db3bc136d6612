//! Consumer-side surface the coordinator drives.

use crate::client::StreamClient;
use crate::protocol::{Message, OffsetSpec};
use std::sync::Arc;

/// The coordinator's view of one logical consumer.
///
/// Implementations own the user-facing consumer object; the coordinator only
/// needs to know whether it is still alive, hand it the connection currently
/// serving it, and close it when its stream disappears.
pub trait ConsumerHandle: Send + Sync {
    fn is_open(&self) -> bool;

    /// Connection currently hosting the subscription, or `None` while
    /// disconnected. Reset to `None` at the start of every recovery.
    fn set_subscription_client(&self, client: Option<Arc<dyn StreamClient>>);

    /// The stream is gone; the consumer cannot be recovered.
    fn close_after_stream_deletion(&self);
}

/// Per-message user callback: `(offset, message)`.
pub type MessageHandler = Arc<dyn Fn(u64, Message) + Send + Sync>;

/// Runs once when the subscription is torn down, so offset-tracking
/// machinery can flush.
pub type TrackingClosingCallback = Arc<dyn Fn() + Send + Sync>;

/// Passed to [`SubscriptionListener::pre_subscribe`] before every
/// (re-)subscription.
#[derive(Debug)]
pub struct SubscriptionContext {
    pub stream: String,
    pub subscription_id: u8,
    /// The offset the subscription is about to start from. Listeners may
    /// override it, e.g. to resume from an externally stored offset.
    pub offset_spec: OffsetSpec,
}

/// Hook invoked before each subscribe call, initial and recovery alike.
pub trait SubscriptionListener: Send + Sync {
    fn pre_subscribe(&self, _context: &mut SubscriptionContext) {}
}

/// Listener that leaves the subscription untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpSubscriptionListener;

impl SubscriptionListener for NoOpSubscriptionListener {}

impl<F> SubscriptionListener for F
where
    F: Fn(&mut SubscriptionContext) + Send + Sync,
{
    fn pre_subscribe(&self, context: &mut SubscriptionContext) {
        self(context)
    }
}
