//! Shared mock infrastructure for coordinator tests: a scriptable client,
//! a factory capturing the listeners of every connection it opens, and a
//! mock consumer with call counters.

use super::manager::SubscriptionManager;
use super::pool::PoolKey;
use super::tracker::SubscriptionTracker;
use crate::client::{
    ClientFactory, ClientListeners, ClientParameters, MessageListener, MetadataListener,
    ShutdownListener, StreamClient,
};
use crate::consumer::{ConsumerHandle, NoOpSubscriptionListener};
use crate::error::RillmqClientError;
use crate::flow::SynchronousFlowStrategyBuilder;
use crate::metrics::CoordinatorMetrics;
use crate::protocol::{
    Broker, Message, OffsetSpec, QueryOffsetResponse, Response, ResponseCode, StreamMetadata,
};
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Pops like Mockito's sequential stubbing: the last entry sticks.
fn pop_sticky<T: Clone>(queue: &mut VecDeque<T>) -> Option<T> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

#[derive(Clone)]
pub(crate) enum MetadataScript {
    Reply(HashMap<String, StreamMetadata>),
    IllegalState,
}

#[derive(Clone)]
pub(crate) enum OffsetQueryScript {
    Ok(u64),
    TimeoutAfter(Duration),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SubscribeCall {
    pub subscription_id: u8,
    pub stream: String,
    pub offset_spec: OffsetSpec,
    pub credits: u16,
    pub properties: HashMap<String, String>,
}

#[derive(Default)]
pub(crate) struct MockStreamClient {
    open: AtomicBool,
    metadata_script: Mutex<VecDeque<MetadataScript>>,
    subscribe_script: Mutex<VecDeque<Response>>,
    offset_query_script: Mutex<VecDeque<OffsetQueryScript>>,
    advertised_script: Mutex<VecDeque<(String, i32)>>,
    current_advertised: Mutex<Option<(String, i32)>>,
    pub subscribe_calls: Mutex<Vec<SubscribeCall>>,
    pub unsubscribe_calls: Mutex<Vec<u8>>,
    pub metadata_calls: Mutex<Vec<String>>,
    pub offset_query_calls: Mutex<Vec<(String, String)>>,
    pub credit_calls: Mutex<Vec<(u8, u16)>>,
    pub close_calls: AtomicUsize,
}

impl MockStreamClient {
    pub(crate) fn new() -> Arc<Self> {
        let client = Self::default();
        client.open.store(true, Ordering::SeqCst);
        Arc::new(client)
    }

    pub(crate) fn script_metadata(&self, reply: HashMap<String, StreamMetadata>) {
        self.metadata_script
            .lock()
            .push_back(MetadataScript::Reply(reply));
    }

    pub(crate) fn script_metadata_error(&self) {
        self.metadata_script
            .lock()
            .push_back(MetadataScript::IllegalState);
    }

    pub(crate) fn script_subscribe(&self, response: Response) {
        self.subscribe_script.lock().push_back(response);
    }

    pub(crate) fn script_offset_query(&self, script: OffsetQueryScript) {
        self.offset_query_script.lock().push_back(script);
    }

    pub(crate) fn script_advertised(&self, host: &str, port: i32) {
        self.advertised_script
            .lock()
            .push_back((host.to_string(), port));
    }

    pub(crate) fn subscribe_count(&self) -> usize {
        self.subscribe_calls.lock().len()
    }

    pub(crate) fn last_subscription_id(&self) -> u8 {
        self.subscribe_calls
            .lock()
            .last()
            .expect("no subscribe call recorded")
            .subscription_id
    }

    pub(crate) fn metadata_count_for(&self, stream: &str) -> usize {
        self.metadata_calls
            .lock()
            .iter()
            .filter(|s| s.as_str() == stream)
            .count()
    }

    pub(crate) fn offset_query_count(&self) -> usize {
        self.offset_query_calls.lock().len()
    }
}

#[async_trait]
impl StreamClient for MockStreamClient {
    async fn subscribe(
        &self,
        subscription_id: u8,
        stream: &str,
        offset_spec: OffsetSpec,
        initial_credits: u16,
        properties: HashMap<String, String>,
    ) -> Result<Response> {
        self.subscribe_calls.lock().push(SubscribeCall {
            subscription_id,
            stream: stream.to_string(),
            offset_spec,
            credits: initial_credits,
            properties,
        });
        let response = pop_sticky(&mut self.subscribe_script.lock()).unwrap_or_else(Response::ok);
        Ok(response)
    }

    async fn unsubscribe(&self, subscription_id: u8) -> Result<Response> {
        self.unsubscribe_calls.lock().push(subscription_id);
        Ok(Response::ok())
    }

    async fn metadata(&self, streams: &[&str]) -> Result<HashMap<String, StreamMetadata>> {
        for stream in streams {
            self.metadata_calls.lock().push(stream.to_string());
        }
        match pop_sticky(&mut self.metadata_script.lock()) {
            Some(MetadataScript::Reply(reply)) => Ok(reply),
            Some(MetadataScript::IllegalState) => {
                Err(RillmqClientError::illegal_state("metadata lookup failed"))
            }
            None => Ok(HashMap::new()),
        }
    }

    async fn query_offset(&self, reference: &str, stream: &str) -> Result<QueryOffsetResponse> {
        self.offset_query_calls
            .lock()
            .push((reference.to_string(), stream.to_string()));
        let script = pop_sticky(&mut self.offset_query_script.lock());
        match script {
            Some(OffsetQueryScript::Ok(offset)) => {
                Ok(QueryOffsetResponse::new(ResponseCode::Ok, offset))
            }
            Some(OffsetQueryScript::TimeoutAfter(delay)) => {
                tokio::time::sleep(delay).await;
                Err(RillmqClientError::timeout(delay.as_millis() as u64))
            }
            None => Ok(QueryOffsetResponse::new(ResponseCode::NoOffset, 0)),
        }
    }

    async fn partitions(&self, _super_stream: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn route(&self, _routing_key: &str, _super_stream: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn credit(&self, subscription_id: u8, credits: u16) {
        self.credit_calls.lock().push((subscription_id, credits));
    }

    // the advertised pair pops on the host call; the port call reads the
    // same pair, mirroring how the reconnect wrapper queries them
    fn server_advertised_host(&self) -> String {
        let pair = pop_sticky(&mut self.advertised_script.lock())
            .unwrap_or_else(|| ("replica1".to_string(), -1));
        let host = pair.0.clone();
        *self.current_advertised.lock() = Some(pair);
        host
    }

    fn server_advertised_port(&self) -> i32 {
        self.current_advertised
            .lock()
            .as_ref()
            .map(|(_, port)| *port)
            .unwrap_or(-1)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Factory handing out one shared mock client and capturing the listeners
/// registered on every "connection".
pub(crate) struct MockClientFactory {
    pub client: Arc<MockStreamClient>,
    pub created: AtomicUsize,
    pub listeners: Mutex<Vec<ClientListeners>>,
}

impl MockClientFactory {
    pub(crate) fn new(client: Arc<MockStreamClient>) -> Arc<Self> {
        Arc::new(Self {
            client,
            created: AtomicUsize::new(0),
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub(crate) fn message_listener(&self, index: usize) -> MessageListener {
        self.listeners.lock()[index]
            .message
            .clone()
            .expect("no message listener captured")
    }

    pub(crate) fn last_message_listener(&self) -> MessageListener {
        self.listeners
            .lock()
            .last()
            .and_then(|l| l.message.clone())
            .expect("no message listener captured")
    }

    pub(crate) fn shutdown_listener(&self, index: usize) -> ShutdownListener {
        self.listeners.lock()[index]
            .shutdown
            .clone()
            .expect("no shutdown listener captured")
    }

    pub(crate) fn metadata_listener(&self, index: usize) -> MetadataListener {
        self.listeners.lock()[index]
            .metadata
            .clone()
            .expect("no metadata listener captured")
    }
}

#[async_trait]
impl ClientFactory for MockClientFactory {
    async fn client(&self, parameters: ClientParameters) -> Result<Arc<dyn StreamClient>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().push(parameters.listeners.clone());
        Ok(self.client.clone())
    }
}

/// Mock consumer with call counters.
pub(crate) struct MockConsumer {
    open: AtomicBool,
    pub null_client_calls: AtomicUsize,
    pub some_client_calls: AtomicUsize,
    pub closed_after_stream_deletion: AtomicUsize,
}

impl MockConsumer {
    pub(crate) fn open() -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(true),
            null_client_calls: AtomicUsize::new(0),
            some_client_calls: AtomicUsize::new(0),
            closed_after_stream_deletion: AtomicUsize::new(0),
        })
    }

    pub(crate) fn closed() -> Arc<Self> {
        let consumer = Self::open();
        consumer.open.store(false, Ordering::SeqCst);
        consumer
    }

    pub(crate) fn null_client_count(&self) -> usize {
        self.null_client_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn some_client_count(&self) -> usize {
        self.some_client_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn closed_after_stream_deletion_count(&self) -> usize {
        self.closed_after_stream_deletion.load(Ordering::SeqCst)
    }
}

impl ConsumerHandle for MockConsumer {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn set_subscription_client(&self, client: Option<Arc<dyn StreamClient>>) {
        if client.is_some() {
            self.some_client_calls.fetch_add(1, Ordering::SeqCst);
        } else {
            self.null_client_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn close_after_stream_deletion(&self) {
        self.closed_after_stream_deletion
            .fetch_add(1, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
    }
}

pub(crate) fn leader() -> Broker {
    Broker::new("leader", -1)
}

pub(crate) fn replicas() -> Vec<Broker> {
    vec![Broker::new("replica1", -1), Broker::new("replica2", -1)]
}

pub(crate) fn replica() -> Vec<Broker> {
    vec![Broker::new("replica1", -1)]
}

pub(crate) fn metadata(
    stream: &str,
    leader: Option<Broker>,
    replicas: Vec<Broker>,
) -> HashMap<String, StreamMetadata> {
    let mut reply = HashMap::new();
    reply.insert(
        stream.to_string(),
        StreamMetadata::new(stream, ResponseCode::Ok, leader, replicas),
    );
    reply
}

pub(crate) fn metadata_code(stream: &str, code: ResponseCode) -> HashMap<String, StreamMetadata> {
    let mut reply = HashMap::new();
    reply.insert(
        stream.to_string(),
        StreamMetadata::new(stream, code, None, Vec::new()),
    );
    reply
}

/// Minimal tracker for slot-table tests.
pub(crate) fn new_tracker(stream: &str) -> Arc<SubscriptionTracker> {
    Arc::new(SubscriptionTracker::new(
        stream,
        None,
        OffsetSpec::Next,
        HashMap::new(),
        MockConsumer::open(),
        Arc::new(|_offset: u64, _message: Message| {}),
        Arc::new(NoOpSubscriptionListener),
        Arc::new(|| {}),
        Arc::new(SynchronousFlowStrategyBuilder::default()),
    ))
}

/// Manager with an attached mock client, for slot and pool tests.
pub(crate) fn new_manager_with_client(
    id: u64,
    key: PoolKey,
    max_subscriptions: usize,
) -> Arc<SubscriptionManager> {
    let manager = Arc::new(SubscriptionManager::new(
        id,
        key,
        max_subscriptions,
        3,
        Arc::new(CoordinatorMetrics::default()),
    ));
    manager.attach_client(MockStreamClient::new());
    manager
}

/// Surfaces coordinator logs in tests when `RUST_LOG` is set.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Polls a condition until it holds or a 5s deadline passes.
pub(crate) async fn wait_until<F: Fn() -> bool>(condition: F, what: &str) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 5s: {}", what);
}
