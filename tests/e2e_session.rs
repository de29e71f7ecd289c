//! End-to-end transaction tests.
//!
//! A scripted service consumes the request queue on an in-memory broker and
//! publishes replies on the request's `reply_to` after fixed delays. All
//! tests run on a paused clock, so delays and deadlines are exact.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use arca_rpc::broker::{self, BrokerConnection, DeliveryHandler};
use arca_rpc::protocol::{Delivery, Envelope, MessageProperties, DECODE_FAILURE_MESSAGE};
use arca_rpc::{Config, CorrelationToken, MemoryBroker, RpcClient, RpcError, WaitMode};
use serde_json::json;
use tokio::time::Instant;

/// Correlation id a scripted reply carries
#[derive(Clone)]
enum ReplyId {
    /// Echo the request's token
    Echo,
    /// Some other token
    Other(String),
    /// No correlation id at all
    Missing,
}

#[derive(Clone)]
struct Step {
    delay: Duration,
    id: ReplyId,
    body: &'static [u8],
}

fn step(millis: u64, id: ReplyId, body: &'static [u8]) -> Step {
    Step {
        delay: Duration::from_millis(millis),
        id,
        body,
    }
}

struct ScriptedService {
    // Held so the consumer stays attached
    _connection: Box<dyn BrokerConnection>,
    requests: Arc<Mutex<Vec<Envelope>>>,
}

impl ScriptedService {
    fn requests(&self) -> Vec<Envelope> {
        self.requests.lock().unwrap().clone()
    }
}

/// Consume the request queue and answer every request with `script`.
async fn scripted_service(broker: &MemoryBroker, script: Vec<Step>) -> ScriptedService {
    let config = Config::default();
    let mut connection = broker::connect(broker, &config.broker).await.unwrap();
    connection
        .declare_queue(&config.rpc.request_queue)
        .await
        .unwrap();

    let requests = Arc::new(Mutex::new(Vec::new()));
    let seen = requests.clone();
    let publisher = broker.clone();
    let handler: DeliveryHandler = Arc::new(move |delivery: Delivery| {
        seen.lock().unwrap().push(delivery.envelope.clone());
        let Some(reply_to) = delivery.envelope.reply_to().map(str::to_string) else {
            return;
        };
        let request_id = delivery.envelope.correlation_id().map(str::to_string);

        for step in script.iter().cloned() {
            let publisher = publisher.clone();
            let reply_to = reply_to.clone();
            let Step { delay, id, body } = step;
            let mut properties = MessageProperties::default();
            properties.correlation_id = match id {
                ReplyId::Echo => request_id.clone(),
                ReplyId::Other(id) => Some(id),
                ReplyId::Missing => None,
            };
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                publisher.publish(&reply_to, Envelope::new(body, properties));
            });
        }
    });
    connection
        .consume(&config.rpc.request_queue, handler)
        .await
        .unwrap();

    ScriptedService {
        _connection: connection,
        requests,
    }
}

fn client(broker: &MemoryBroker) -> RpcClient {
    RpcClient::new(Arc::new(broker.clone()), Config::default())
}

fn poll_client(broker: &MemoryBroker) -> RpcClient {
    let mut config = Config::default();
    config.rpc.wait = WaitMode::Poll;
    RpcClient::new(Arc::new(broker.clone()), config)
}

fn request() -> serde_json::Value {
    json!({"cuit": "23146234399", "pto_vta": "0001", "cbte_tipo": "001"})
}

/// Only the service's own connection is left and no reply queue survives.
fn assert_released(broker: &MemoryBroker) {
    assert_eq!(broker.open_connections(), 1);
    assert_eq!(broker.queue_names(), vec!["arca".to_string()]);
}

/// Test the canonical exchange: reply after 2s, well inside a 30s timeout
#[tokio::test(start_paused = true)]
async fn test_reply_within_timeout_is_returned() {
    let broker = MemoryBroker::new();
    let service = scripted_service(
        &broker,
        vec![step(2000, ReplyId::Echo, br#"{"invoice_number": 42, "date": "2024-01-01"}"#)],
    )
    .await;

    let start = Instant::now();
    let response = client(&broker)
        .request_last_invoice("23146234399", "0001", "001", Some(Duration::from_secs(30)))
        .await
        .unwrap();
    let elapsed = start.elapsed();

    assert_eq!(
        response.into_value(),
        json!({"invoice_number": 42, "date": "2024-01-01"})
    );
    assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_millis(2100));
    assert_released(&broker);

    // The request as the service saw it
    let requests = service.requests();
    assert_eq!(requests.len(), 1);
    let sent: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(sent, request());
    assert!(requests[0].reply_to().unwrap().starts_with("amq.gen-"));
    let token: CorrelationToken = requests[0].correlation_id().unwrap().parse().unwrap();
    assert_eq!(token.to_string().len(), 36);
}

/// Test that no reply produces a timeout naming the configured seconds
#[tokio::test(start_paused = true)]
async fn test_no_reply_times_out() {
    let broker = MemoryBroker::new();
    let _service = scripted_service(&broker, vec![]).await;

    let start = Instant::now();
    let err = client(&broker)
        .execute(&request(), Duration::from_secs(1))
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert_eq!(
        err.to_string(),
        "Reached broker but no response received after 1 seconds"
    );
    assert!(start.elapsed() >= Duration::from_secs(1));
    assert_released(&broker);
}

/// Test the deadline boundary with the event-driven wait
#[tokio::test(start_paused = true)]
async fn test_deadline_boundary_event() {
    let broker = MemoryBroker::new();
    let _early = scripted_service(&broker, vec![step(999, ReplyId::Echo, br#"{"ok": 1}"#)]).await;

    let response = client(&broker)
        .execute(&request(), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(response.value().unwrap()["ok"], 1);

    let broker = MemoryBroker::new();
    let _late = scripted_service(&broker, vec![step(1001, ReplyId::Echo, br#"{"ok": 1}"#)]).await;

    let err = client(&broker)
        .execute(&request(), Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    // The late reply finds its queue gone and is dropped
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(broker.messages_dropped(), 1);
    assert_released(&broker);
}

/// Test the deadline boundary with the polling wait (1s interval)
#[tokio::test(start_paused = true)]
async fn test_deadline_boundary_poll() {
    let broker = MemoryBroker::new();
    let _early = scripted_service(&broker, vec![step(999, ReplyId::Echo, br#"{"ok": 1}"#)]).await;

    let start = Instant::now();
    let response = poll_client(&broker)
        .execute(&request(), Duration::from_secs(1))
        .await
        .unwrap();
    // Noticed on the first poll after arrival
    assert!(start.elapsed() >= Duration::from_secs(1));
    assert_eq!(response.value().unwrap()["ok"], 1);

    // Late by more than one interval: the t=2 poll is past the deadline
    let broker = MemoryBroker::new();
    let _late = scripted_service(&broker, vec![step(2500, ReplyId::Echo, br#"{"ok": 1}"#)]).await;

    let start = Instant::now();
    let err = poll_client(&broker)
        .execute(&request(), Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert!(start.elapsed() >= Duration::from_secs(2));
    assert!(start.elapsed() < Duration::from_millis(2500));
}

/// Test that replies for other transactions are skipped
#[tokio::test(start_paused = true)]
async fn test_foreign_replies_are_ignored() {
    let broker = MemoryBroker::new();
    let other = CorrelationToken::generate().to_string();
    let _service = scripted_service(
        &broker,
        vec![
            step(100, ReplyId::Other(other), br#"{"invoice_number": 1}"#),
            step(200, ReplyId::Missing, br#"{"invoice_number": 2}"#),
            step(300, ReplyId::Echo, br#"{"invoice_number": 3}"#),
            step(400, ReplyId::Echo, br#"{"invoice_number": 4}"#),
        ],
    )
    .await;

    let response = client(&broker)
        .execute(&request(), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(response.value().unwrap()["invoice_number"], 3);

    // The duplicate arrives after release and has nowhere to go
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(broker.messages_dropped(), 1);
    assert_released(&broker);
}

/// Test that only foreign replies still ends in a timeout
#[tokio::test(start_paused = true)]
async fn test_only_foreign_replies_times_out() {
    let broker = MemoryBroker::new();
    let other = CorrelationToken::generate().to_string();
    let _service =
        scripted_service(&broker, vec![step(100, ReplyId::Other(other), br#"{"ok": 1}"#)]).await;

    let err = client(&broker)
        .execute(&request(), Duration::from_secs(2))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout { timeout } if timeout == Duration::from_secs(2)));
}

/// Test that a non-JSON reply is returned as a decode failure
#[tokio::test(start_paused = true)]
async fn test_malformed_reply_is_decode_failure() {
    let broker = MemoryBroker::new();
    let _service = scripted_service(&broker, vec![step(500, ReplyId::Echo, b"not json")]).await;

    let response = client(&broker)
        .execute(&request(), Duration::from_secs(5))
        .await
        .unwrap();

    assert!(response.is_decode_failure());
    assert_eq!(&response.raw().unwrap()[..], b"not json");
    let value = response.into_value();
    assert_eq!(value["error"], DECODE_FAILURE_MESSAGE);
    assert_eq!(value["raw"], "not json");
    assert_released(&broker);
}

/// Test that an unreachable broker fails before anything is acquired
#[tokio::test(start_paused = true)]
async fn test_unreachable_broker() {
    let broker = MemoryBroker::new();
    broker.refuse_connections(true);

    let err = client(&broker)
        .execute(&request(), Duration::from_secs(5))
        .await
        .unwrap_err();

    assert!(err.is_connection());
    assert!(err.to_string().starts_with("Could not reach broker"));
    assert_eq!(broker.connection_attempts(), 1);
    assert_eq!(broker.connections_opened(), 0);
    assert_eq!(broker.connections_closed(), 0);
    assert_eq!(broker.messages_published(), 0);
}

/// Test that retries are attempted only when configured
#[tokio::test(start_paused = true)]
async fn test_connection_retries_when_configured() {
    let broker = MemoryBroker::new();
    broker.refuse_connections(true);
    let mut config = Config::default();
    config.broker.connection_attempts = 3;

    let start = Instant::now();
    let err = RpcClient::new(Arc::new(broker.clone()), config)
        .execute(&request(), Duration::from_secs(5))
        .await
        .unwrap_err();

    assert!(err.is_connection());
    assert_eq!(broker.connection_attempts(), 3);
    // Two delays between three attempts
    assert!(start.elapsed() >= Duration::from_secs(2));
}

/// Test that rejected credentials surface as a transport error
#[tokio::test(start_paused = true)]
async fn test_rejected_credentials() {
    let broker = MemoryBroker::new().with_credentials("billing", "s3cret");

    let err = client(&broker)
        .execute(&request(), Duration::from_secs(5))
        .await
        .unwrap_err();

    assert!(matches!(err, RpcError::Transport(ref msg) if msg.contains("ACCESS_REFUSED")));
    assert_eq!(broker.connection_attempts(), 1);
    assert_eq!(broker.connections_opened(), 0);
    assert_eq!(broker.open_connections(), 0);
}

/// Test that a failed publish releases the connection once
#[tokio::test(start_paused = true)]
async fn test_publish_failure_releases() {
    let broker = MemoryBroker::new();
    let _service = scripted_service(&broker, vec![step(10, ReplyId::Echo, b"{}")]).await;
    broker.fail_publishes(true);

    let err = client(&broker)
        .execute(&request(), Duration::from_secs(5))
        .await
        .unwrap_err();

    assert!(matches!(err, RpcError::Transport(_)));
    assert_eq!(broker.connections_closed(), 1);
    assert_released(&broker);
}

/// Test that every outcome closes exactly the connection it opened
#[tokio::test(start_paused = true)]
async fn test_release_exactly_once_across_outcomes() {
    let broker = MemoryBroker::new();
    let _service = scripted_service(&broker, vec![step(1500, ReplyId::Echo, b"{}")]).await;
    let client = client(&broker);

    // success, timeout, success again
    assert!(client.execute(&request(), Duration::from_secs(2)).await.is_ok());
    assert!(client
        .execute(&request(), Duration::from_secs(1))
        .await
        .unwrap_err()
        .is_timeout());
    assert!(client.execute(&request(), Duration::from_secs(2)).await.is_ok());

    // service connection + three transactions
    assert_eq!(broker.connections_opened(), 4);
    assert_eq!(broker.connections_closed(), 3);
    assert_released(&broker);
}

/// Test that concurrent transactions never see each other's replies
#[tokio::test(start_paused = true)]
async fn test_concurrent_transactions_are_isolated() {
    let broker = MemoryBroker::new();
    let _service = scripted_service(&broker, vec![step(100, ReplyId::Echo, br#"{"ok": true}"#)]).await;

    let mut handles = Vec::new();
    for i in 0..8 {
        let client = client(&broker);
        handles.push(tokio::spawn(async move {
            let payload = json!({"cuit": format!("2000000000{i}"), "pto_vta": "1", "cbte_tipo": "1"});
            client.execute(&payload, Duration::from_secs(5)).await
        }));
    }

    let mut tokens = Vec::new();
    for handle in handles {
        let response = handle.await.unwrap().unwrap();
        assert_eq!(response.value().unwrap()["ok"], true);
        tokens.push(response.correlation_id);
    }
    tokens.sort();
    tokens.dedup();
    assert_eq!(tokens.len(), 8);
    assert_released(&broker);
}
