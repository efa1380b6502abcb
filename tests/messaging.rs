use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use courier::{
    Driver, Envelope, ErrorKind, HealthStatus, Message, MessageContext, PublishResult, QueueClient,
    SubscriptionState,
    middleware::{Middleware, Next, Payload, Publish, Receive},
    transport::InMemoryDriver,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: u64,
}

impl Message for OrderPlaced {
    fn message_type() -> &'static str {
        "orders.placed"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct InvoiceIssued {
    order_id: u64,
}

impl Message for InvoiceIssued {
    fn message_type() -> &'static str {
        "invoices.issued"
    }

    #[cfg(feature = "msgpack")]
    fn codec() -> courier::Codec {
        courier::Codec::MsgPack
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PriceQuery {
    sku: String,
}

impl Message for PriceQuery {
    fn message_type() -> &'static str {
        "prices.query"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Price {
    cents: u64,
}

impl Message for Price {
    fn message_type() -> &'static str {
        "prices.quote"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PriceRange {
    low: u64,
    high: u64,
}

impl Message for PriceRange {
    fn message_type() -> &'static str {
        "prices.range"
    }
}

fn client() -> (InMemoryDriver, QueueClient<InMemoryDriver>) {
    let driver = InMemoryDriver::default();
    (driver.clone(), QueueClient::new(driver))
}

/// Collects every envelope of `T` a subscriber receives.
async fn collect<T: Message>(client: &QueueClient<InMemoryDriver>) -> Arc<Mutex<Vec<Envelope<T>>>> {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let result = client
        .subscribe(move |envelope: Envelope<T>| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().push(envelope);
                true
            }
        })
        .await;
    assert!(result.is_success());
    received
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_publishes_without_subscribers_succeed() {
    let (driver, client) = client();

    let handles: Vec<_> = (0..32)
        .map(|order_id| {
            let client = client.clone();
            tokio::spawn(async move { client.publish(OrderPlaced { order_id }, None).await })
        })
        .collect();

    for handle in handles {
        assert!(handle.await.unwrap().is_success());
    }
    assert_eq!(driver.sent_messages().len(), 32);
    assert_eq!(client.pool().connector_count(), 1);
}

#[tokio::test]
async fn subscribe_twice_unsubscribe_once_keeps_one_subscription() {
    let (driver, client) = client();
    let first = collect::<OrderPlaced>(&client).await;
    let second = client.subscribe(|_: Envelope<OrderPlaced>| async { true }).await;

    client
        .unsubscribe::<OrderPlaced>(second.subscription_id().unwrap())
        .await
        .unwrap();

    assert_eq!(client.subscriber_count::<OrderPlaced>(), 1);
    assert_eq!(client.subscription_state::<OrderPlaced>(), SubscriptionState::Subscribed);
    assert_eq!(driver.subscriber_count("orders.placed"), 1);

    assert!(client.publish(OrderPlaced { order_id: 9 }, None).await.is_success());
    assert_eq!(first.lock().len(), 1);
    assert_eq!(first.lock()[0].message.order_id, 9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_subscribers_issue_one_broker_subscribe() {
    let (driver, client) = client();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .subscribe(|_: Envelope<OrderPlaced>| async { true })
                    .await
                    .is_success()
            })
        })
        .collect();
    for handle in handles {
        assert!(handle.await.unwrap());
    }

    assert_eq!(driver.subscriber_count("orders.placed"), 1);
    assert_eq!(client.subscriber_count::<OrderPlaced>(), 8);
}

#[tokio::test]
async fn published_messages_inherit_the_parent_chain() {
    let (_driver, client) = client();
    let invoices = collect::<InvoiceIssued>(&client).await;

    let root = MessageContext::new("checkout").with_request_id("req-42");
    let parent = MessageContext::caused_by("orders.placed", &root);
    assert!(client
        .publish(InvoiceIssued { order_id: 1 }, Some(&parent))
        .await
        .is_success());

    let invoices = invoices.lock();
    let context = &invoices[0].context;
    assert_eq!(context.message_type, "invoices.issued");
    assert_eq!(context.parent_message_id, Some(parent.id));
    assert_eq!(context.root_message_id, Some(root.id));
    assert_eq!(context.root_message_date, Some(root.date));
    assert_eq!(context.request_id.as_deref(), Some("req-42"));
}

#[tokio::test]
async fn causal_chain_survives_two_hops() {
    let (_driver, client) = client();
    let invoices = collect::<InvoiceIssued>(&client).await;

    let relay = client.clone();
    client
        .subscribe(move |order: Envelope<OrderPlaced>| {
            let relay = relay.clone();
            async move {
                relay
                    .publish(InvoiceIssued { order_id: order.message.order_id }, Some(&order.context))
                    .await
                    .is_success()
            }
        })
        .await;

    assert!(client.publish(OrderPlaced { order_id: 5 }, None).await.is_success());

    let invoices = invoices.lock();
    assert_eq!(invoices.len(), 1);
    let invoice = &invoices[0];
    assert_eq!(invoice.message.order_id, 5);
    assert!(!invoice.context.is_root());
    assert_eq!(invoice.context.root_message_id, invoice.context.parent_message_id);
}

#[tokio::test]
async fn reply_links_the_response_to_its_request() {
    let (_driver, client) = client();
    let seen_request = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&seen_request);
    client
        .reply(move |query: Envelope<PriceQuery>| {
            let seen = Arc::clone(&seen);
            async move {
                *seen.lock() = Some(query.context.clone());
                Price {
                    cents: query.message.sku.len() as u64 * 100,
                }
            }
        })
        .await;

    let parent = MessageContext::new("cart");
    let response: Envelope<Price> = client
        .request(PriceQuery { sku: "abc".into() }, Some(&parent), None)
        .await
        .unwrap();

    let request = seen_request.lock().clone().unwrap();
    assert_eq!(response.message.cents, 300);
    assert_eq!(request.parent_message_id, Some(parent.id));
    assert!(request.reply_to.is_some());
    assert_eq!(response.context.parent_message_id, Some(request.id));
    assert_eq!(response.context.root_message_id, Some(parent.id));
    assert!(response.context.reply_to.is_none());
}

#[tokio::test]
async fn request_without_responder_times_out() {
    let (_driver, client) = client();

    let started = Instant::now();
    let err = client
        .request::<PriceQuery, Price>(PriceQuery { sku: "x".into() }, None, Some(Duration::from_millis(200)))
        .await
        .unwrap_err();

    assert!(matches!(err.kind(), ErrorKind::RequestTimeout(t) if *t == Duration::from_millis(200)));
    assert!(started.elapsed() >= Duration::from_millis(200));
}

/// Records before/after hooks and optionally vetoes.
struct Audit {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
    veto_publish: bool,
    veto_receive: bool,
}

impl Audit {
    fn new(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            name,
            log: Arc::clone(log),
            veto_publish: false,
            veto_receive: false,
        }
    }
}

#[async_trait::async_trait]
impl Middleware for Audit {
    async fn publish<'a>(&'a self, payload: Payload<'a>, next: Next<'a, Publish>) -> PublishResult {
        self.log.lock().push(format!("{}:before", self.name));
        if self.veto_publish {
            return PublishResult::rejected(format!("{} says no", self.name));
        }
        let result = next.run(payload).await;
        self.log.lock().push(format!("{}:after", self.name));
        result
    }

    async fn receive<'a>(&'a self, payload: Payload<'a>, next: Next<'a, Receive>) -> bool {
        self.log.lock().push(format!("{}:receive", self.name));
        if self.veto_receive {
            return false;
        }
        let accepted = next.run(payload).await;
        self.log.lock().push(format!("{}:received", self.name));
        accepted
    }
}

#[tokio::test]
async fn middleware_veto_short_circuits_publish() {
    let driver = InMemoryDriver::default();
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut gate = Audit::new("gate", &log);
    gate.veto_publish = true;

    let client = QueueClient::builder(driver.clone())
        .with_middleware(Audit::new("outer", &log))
        .with_middleware(gate)
        .with_middleware(Audit::new("inner", &log))
        .build()
        .unwrap();

    let result = client.publish(OrderPlaced { order_id: 1 }, None).await;

    assert!(!result.is_success());
    assert_eq!(result.error_message(), Some("Rejected by middleware: gate says no"));
    assert_eq!(*log.lock(), ["outer:before", "gate:before", "outer:after"]);
    assert!(driver.sent_messages().is_empty());

    let err = client
        .request::<PriceQuery, Price>(PriceQuery { sku: "x".into() }, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::MiddlewareRejected(_)));
}

#[tokio::test]
async fn receive_veto_drops_inbound_messages() {
    let driver = InMemoryDriver::default();
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut gate = Audit::new("gate", &log);
    gate.veto_receive = true;
    let client = QueueClient::builder(driver).with_middleware(gate).build().unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    client
        .subscribe(move |_: Envelope<OrderPlaced>| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            }
        })
        .await;

    let envelope = Envelope::new(OrderPlaced { order_id: 3 }, MessageContext::new("orders.placed"));
    assert!(!client.dispatch(envelope).await);
    assert!(client.publish(OrderPlaced { order_id: 4 }, None).await.is_success());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn response_rejected_by_receive_chain_is_a_processing_error() {
    let driver = InMemoryDriver::default();
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut gate = Audit::new("gate", &log);
    gate.veto_receive = true;

    let responder = QueueClient::new(driver.clone());
    responder
        .reply(|_: Envelope<PriceQuery>| async { Price { cents: 1 } })
        .await;
    let requester = QueueClient::builder(driver).with_middleware(gate).build().unwrap();

    let err = requester
        .request::<PriceQuery, Price>(PriceQuery { sku: "x".into() }, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Processing));
}

#[tokio::test]
async fn subscriptions_survive_a_reconnect() {
    let (driver, client) = client();
    let orders = collect::<OrderPlaced>(&client).await;

    let key = courier::pool::ConnectorKey::consumer("orders.placed");
    let connector = client.pool().existing_connector(key).unwrap();
    let stale = connector.connection();
    driver.break_connection(stale.handle().id());
    assert_ne!(client.check_health(), HealthStatus::Healthy);

    assert_eq!(client.pool().reconnect_unhealthy().await, 1);

    let rebound = client.pool().existing_connector(key).unwrap();
    assert!(Arc::ptr_eq(&rebound, &connector));
    assert_ne!(connector.connection().id(), stale.id());
    assert_eq!(driver.subscriber_count("orders.placed"), 1);

    assert!(client.publish(OrderPlaced { order_id: 11 }, None).await.is_success());
    assert_eq!(orders.lock().len(), 1);
    assert_eq!(client.check_health(), HealthStatus::Healthy);
}

#[tokio::test]
async fn receive_after_hooks_run_when_subscribers_fail() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let client = QueueClient::builder(InMemoryDriver::default())
        .with_middleware(Audit::new("audit", &log))
        .build()
        .unwrap();
    client
        .subscribe(|order: Envelope<OrderPlaced>| async move {
            assert_ne!(order.message.order_id, 2, "cannot handle order 2");
            false
        })
        .await;

    let rejected = Envelope::new(OrderPlaced { order_id: 1 }, MessageContext::new("orders.placed"));
    assert!(client.dispatch(rejected).await);
    assert_eq!(*log.lock(), ["audit:receive", "audit:received"]);

    log.lock().clear();
    let panicking = Envelope::new(OrderPlaced { order_id: 2 }, MessageContext::new("orders.placed"));
    assert!(client.dispatch(panicking).await);
    assert_eq!(*log.lock(), ["audit:receive", "audit:received"]);
}

#[tokio::test]
async fn undecodable_messages_never_reach_subscribers() {
    let (driver, client) = client();
    let orders = collect::<OrderPlaced>(&client).await;

    let connection = driver.connect().await.unwrap();
    driver
        .send(&connection, "orders.placed", Bytes::from_static(b"\x00not an envelope"))
        .await
        .unwrap();
    assert!(orders.lock().is_empty());

    assert!(client.publish(OrderPlaced { order_id: 5 }, None).await.is_success());
    let received = orders.lock();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].message, OrderPlaced { order_id: 5 });
}

#[tokio::test]
async fn responders_of_one_request_type_cannot_disagree_on_the_response() {
    let (driver, client) = client();
    let quote = client
        .reply(|query: Envelope<PriceQuery>| async move {
            Price {
                cents: query.message.sku.len() as u64,
            }
        })
        .await;
    assert!(quote.is_success());

    let range = client
        .reply(|_: Envelope<PriceQuery>| async { PriceRange { low: 1, high: 2 } })
        .await;
    assert!(matches!(range.error().map(|e| e.kind()), Some(ErrorKind::Configuration(_))));
    assert_eq!(driver.responder_count("prices.query"), 1);

    let price: Envelope<Price> = client
        .request(PriceQuery { sku: "abcd".into() }, None, None)
        .await
        .unwrap();
    assert_eq!(price.message.cents, 4);

    client
        .stop_reply::<PriceQuery, Price>(quote.subscription_id().unwrap())
        .await
        .unwrap();
    assert_eq!(driver.responder_count("prices.query"), 0);

    let range = client
        .reply(|_: Envelope<PriceQuery>| async { PriceRange { low: 1, high: 2 } })
        .await;
    assert!(range.is_success());
    let answer: Envelope<PriceRange> = client
        .request(PriceQuery { sku: "x".into() }, None, None)
        .await
        .unwrap();
    assert_eq!(answer.message, PriceRange { low: 1, high: 2 });
}
