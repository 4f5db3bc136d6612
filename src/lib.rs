//! # RillMQ Client Library
//!
//! An async Rust client for the RillMQ stream broker, centered on the
//! consumer coordinator: it multiplexes many logical consumers over a small
//! pool of broker connections and keeps their subscriptions alive across
//! connection loss, topology changes and stream-leader relocation.
//!
//! ## Features
//!
//! - **Connection pooling**: up to 256 subscriptions share one connection;
//!   new connections are opened only when every pooled one is full
//! - **Automatic recovery**: lost connections and stream topology changes
//!   re-subscribe consumers at the right resume offset with bounded back-off
//! - **Offset resume**: named consumers restart from the server-side stored
//!   offset, unnamed ones from the last dispatched offset
//! - **Pluggable flow control**: strategies decide initial credit and
//!   per-chunk replenishment
//! - **Observability**: JSON-serializable snapshot of connections and the
//!   subscriptions they host, plus built-in counters
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use rillmq_client::*;
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! # async fn run(locator: Arc<dyn StreamClient>, factory: Arc<dyn ClientFactory>,
//! #              consumer: Arc<dyn ConsumerHandle>) -> Result<()> {
//! let coordinator = ConsumerCoordinator::new(locator, factory, CoordinatorConfig::default());
//!
//! let subscription = coordinator
//!     .subscribe(
//!         consumer,
//!         "invoices",
//!         Some(OffsetSpec::First),
//!         None,
//!         Arc::new(NoOpSubscriptionListener),
//!         Arc::new(|| {}),
//!         Arc::new(|offset, message| println!("{offset}: {} bytes", message.len())),
//!         Arc::new(SynchronousFlowStrategyBuilder::default()),
//!         HashMap::new(),
//!     )
//!     .await?;
//!
//! // ... later
//! subscription.close().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod consumer;
pub mod coordinator;
pub mod error;
pub mod flow;
pub mod metrics;
pub mod protocol;

pub use client::{
    AdvertisedNodeClientFactory, ClientFactory, ClientListeners, ClientParameters,
    MessageListener, MetadataListener, ShutdownContext, ShutdownListener, ShutdownReason,
    StreamClient,
};
pub use config::{
    BackOffDelayPolicy, CoordinatorConfig, CoordinatorConfigBuilder,
    MAX_SUBSCRIPTIONS_PER_CLIENT,
};
pub use consumer::{
    ConsumerHandle, MessageHandler, NoOpSubscriptionListener, SubscriptionContext,
    SubscriptionListener, TrackingClosingCallback,
};
pub use coordinator::{
    ConsumerCoordinator, CoordinatorInfo, ManagerInfo, SubscriptionHandle, TrackerInfo,
};
pub use error::RillmqClientError;
pub use flow::{
    ConsumerFlowStrategy, FlowStrategyBuilder, SynchronousFlowStrategy,
    SynchronousFlowStrategyBuilder,
};
pub use metrics::{CoordinatorMetrics, MetricsSnapshot};
pub use protocol::{
    Broker, Message, OffsetSpec, QueryOffsetResponse, Response, ResponseCode, StreamMetadata,
};

/// Client library result type
pub type Result<T> = std::result::Result<T, RillmqClientError>;

/// Client library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
