//! Connection-level RPC handle and factory abstractions.
//!
//! A [`StreamClient`] wraps one broker connection. Inbound broker events
//! (deliveries, shutdowns, metadata updates) fan in through listener
//! callbacks registered at connection build time and never swapped
//! afterwards.

use crate::protocol::{
    Broker, Message, OffsetSpec, QueryOffsetResponse, Response, ResponseCode, StreamMetadata,
};
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Delivery callback: `(subscription_id, offset, chunk_timestamp,
/// committed_offset, message)`.
pub type MessageListener = Arc<dyn Fn(u8, u64, i64, u64, Message) + Send + Sync>;

/// Fired when the connection dies, with the shutdown reason.
pub type ShutdownListener = Arc<dyn Fn(ShutdownContext) + Send + Sync>;

/// Fired when the broker reports a topology change for a stream.
pub type MetadataListener = Arc<dyn Fn(&str, ResponseCode) + Send + Sync>;

/// Why a connection went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The client itself closed the connection.
    ClientClose,
    /// The broker closed the connection.
    ServerClose,
    /// Heartbeats stopped being answered.
    HeartbeatFailure,
    Unknown,
}

#[derive(Debug, Clone, Copy)]
pub struct ShutdownContext {
    pub reason: ShutdownReason,
}

impl ShutdownContext {
    pub fn new(reason: ShutdownReason) -> Self {
        Self { reason }
    }

    /// A client-initiated close is expected; everything else triggers
    /// recovery.
    pub fn is_unexpected(&self) -> bool {
        self.reason != ShutdownReason::ClientClose
    }
}

/// Listener callbacks installed on a connection at build time.
#[derive(Clone, Default)]
pub struct ClientListeners {
    pub message: Option<MessageListener>,
    pub shutdown: Option<ShutdownListener>,
    pub metadata: Option<MetadataListener>,
}

/// Everything a factory needs to open one connection.
#[derive(Clone)]
pub struct ClientParameters {
    /// The broker the caller intends to reach.
    pub broker: Broker,
    /// Connection category tag, e.g. `consumer-connection`.
    pub connection_name: String,
    pub listeners: ClientListeners,
}

/// Per-connection RPC handle to a broker.
#[async_trait]
pub trait StreamClient: Send + Sync {
    /// Opens a subscription on this connection.
    async fn subscribe(
        &self,
        subscription_id: u8,
        stream: &str,
        offset_spec: OffsetSpec,
        initial_credits: u16,
        properties: HashMap<String, String>,
    ) -> Result<Response>;

    async fn unsubscribe(&self, subscription_id: u8) -> Result<Response>;

    /// Topology lookup. Streams absent from the returned map are unknown to
    /// the broker.
    async fn metadata(&self, streams: &[&str]) -> Result<HashMap<String, StreamMetadata>>;

    /// Server-side stored offset for a named consumer.
    async fn query_offset(&self, reference: &str, stream: &str) -> Result<QueryOffsetResponse>;

    /// Partitions of a super-stream.
    async fn partitions(&self, super_stream: &str) -> Result<Vec<String>>;

    /// Streams a routing key maps to within a super-stream.
    async fn route(&self, routing_key: &str, super_stream: &str) -> Result<Vec<String>>;

    /// Grants additional delivery credit. Fire-and-forget; must not block.
    fn credit(&self, subscription_id: u8, credits: u16);

    /// Host the server advertises for itself, which may differ from the one
    /// the connection was opened against.
    fn server_advertised_host(&self) -> String;

    fn server_advertised_port(&self) -> i32;

    fn is_open(&self) -> bool;

    async fn close(&self);
}

/// Opens connections on demand.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn client(&self, parameters: ClientParameters) -> Result<Arc<dyn StreamClient>>;
}

/// Upper bound on reconnect attempts of [`AdvertisedNodeClientFactory`].
const MAX_ADVERTISED_NODE_ATTEMPTS: usize = 20;

/// Factory wrapper that keeps reconnecting until the server it lands on
/// advertises the intended host and port.
///
/// Load balancers may route an outbound connection to any node; consumers
/// however must sit on the leader or a replica of their stream. When the
/// attempt budget runs out the last connection is used as-is.
pub struct AdvertisedNodeClientFactory {
    delegate: Arc<dyn ClientFactory>,
    retry_interval: Duration,
}

impl AdvertisedNodeClientFactory {
    pub fn new(delegate: Arc<dyn ClientFactory>, retry_interval: Duration) -> Self {
        Self {
            delegate,
            retry_interval,
        }
    }
}

#[async_trait]
impl ClientFactory for AdvertisedNodeClientFactory {
    async fn client(&self, parameters: ClientParameters) -> Result<Arc<dyn StreamClient>> {
        let target = parameters.broker.clone();
        let mut attempt = 0;
        loop {
            let client = self.delegate.client(parameters.clone()).await?;
            let advertised = Broker::new(
                client.server_advertised_host(),
                client.server_advertised_port(),
            );
            if advertised == target {
                return Ok(client);
            }
            attempt += 1;
            if attempt >= MAX_ADVERTISED_NODE_ATTEMPTS {
                warn!(
                    %target,
                    %advertised,
                    attempt,
                    "giving up waiting for the advertised node, using the last connection"
                );
                return Ok(client);
            }
            debug!(
                %target,
                %advertised,
                attempt,
                "connected to the wrong node, retrying"
            );
            client.close().await;
            tokio::time::sleep(self.retry_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::OffsetSpec;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedClient {
        advertised: (String, i32),
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl StreamClient for ScriptedClient {
        async fn subscribe(
            &self,
            _subscription_id: u8,
            _stream: &str,
            _offset_spec: OffsetSpec,
            _initial_credits: u16,
            _properties: HashMap<String, String>,
        ) -> Result<Response> {
            Ok(Response::ok())
        }

        async fn unsubscribe(&self, _subscription_id: u8) -> Result<Response> {
            Ok(Response::ok())
        }

        async fn metadata(&self, _streams: &[&str]) -> Result<HashMap<String, StreamMetadata>> {
            Ok(HashMap::new())
        }

        async fn query_offset(
            &self,
            _reference: &str,
            _stream: &str,
        ) -> Result<QueryOffsetResponse> {
            Ok(QueryOffsetResponse::new(ResponseCode::Ok, 0))
        }

        async fn partitions(&self, _super_stream: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn route(&self, _routing_key: &str, _super_stream: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        fn credit(&self, _subscription_id: u8, _credits: u16) {}

        fn server_advertised_host(&self) -> String {
            self.advertised.0.clone()
        }

        fn server_advertised_port(&self) -> i32 {
            self.advertised.1
        }

        fn is_open(&self) -> bool {
            true
        }

        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ScriptedFactory {
        advertised: Mutex<VecDeque<(String, i32)>>,
        created: AtomicUsize,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ClientFactory for ScriptedFactory {
        async fn client(&self, _parameters: ClientParameters) -> Result<Arc<dyn StreamClient>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            let advertised = {
                let mut scripted = self.advertised.lock();
                if scripted.len() > 1 {
                    scripted.pop_front()
                } else {
                    scripted.front().cloned()
                }
            }
            .unwrap_or_else(|| ("unknown".to_string(), -1));
            Ok(Arc::new(ScriptedClient {
                advertised,
                closed: self.closed.clone(),
            }))
        }
    }

    fn parameters() -> ClientParameters {
        ClientParameters {
            broker: Broker::new("replica1", -1),
            connection_name: "consumer-connection".to_string(),
            listeners: ClientListeners::default(),
        }
    }

    #[tokio::test]
    async fn retries_until_the_advertised_node_matches() {
        let closed = Arc::new(AtomicUsize::new(0));
        let factory = Arc::new(ScriptedFactory {
            advertised: Mutex::new(VecDeque::from(vec![
                ("foo".to_string(), 42),
                ("replica1".to_string(), -1),
            ])),
            created: AtomicUsize::new(0),
            closed: closed.clone(),
        });
        let wrapper =
            AdvertisedNodeClientFactory::new(factory.clone(), Duration::from_millis(1));

        let client = wrapper.client(parameters()).await.unwrap();

        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(client.server_advertised_host(), "replica1");
    }

    #[tokio::test]
    async fn uses_the_first_connection_when_it_already_matches() {
        let factory = Arc::new(ScriptedFactory {
            advertised: Mutex::new(VecDeque::from(vec![("replica1".to_string(), -1)])),
            created: AtomicUsize::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
        });
        let wrapper =
            AdvertisedNodeClientFactory::new(factory.clone(), Duration::from_millis(1));

        wrapper.client(parameters()).await.unwrap();

        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_the_attempt_budget() {
        let factory = Arc::new(ScriptedFactory {
            advertised: Mutex::new(VecDeque::from(vec![("elsewhere".to_string(), 1)])),
            created: AtomicUsize::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
        });
        let wrapper =
            AdvertisedNodeClientFactory::new(factory.clone(), Duration::from_millis(1));

        let client = wrapper.client(parameters()).await.unwrap();

        assert_eq!(
            factory.created.load(Ordering::SeqCst),
            MAX_ADVERTISED_NODE_ATTEMPTS
        );
        assert_eq!(client.server_advertised_host(), "elsewhere");
    }
}
