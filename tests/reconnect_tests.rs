//! Resumption scenarios driven through a scripted `Fetch` performer, where
//! stream interruptions are deterministic.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use parking_lot::Mutex;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, HeaderMap};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;
use url::Url;

use mcp_streamable_http::{
    Fetch, HttpRequest, HttpResponse, ReconnectionOptions, StreamableHttpConfig,
    StreamableHttpTransport, TransportError, TransportResult,
};

/// One scripted exchange.
enum Script {
    /// 200 `text/event-stream` whose body yields the given chunks
    Sse(Vec<TransportResult<Bytes>>),
    /// Request-level network failure
    Fail,
}

/// What the transport asked for, per exchange.
struct Recorded {
    method: String,
    last_event_id: Option<String>,
}

struct ScriptedFetch {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<Recorded>>,
}

impl ScriptedFetch {
    fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    fn last_event_id_of(&self, index: usize) -> Option<String> {
        self.requests.lock()[index].last_event_id.clone()
    }
}

#[async_trait]
impl Fetch for ScriptedFetch {
    async fn fetch(&self, request: HttpRequest) -> TransportResult<HttpResponse> {
        self.requests.lock().push(Recorded {
            method: request.method.to_string(),
            last_event_id: request
                .headers
                .get("last-event-id")
                .and_then(|v| v.to_str().ok())
                .map(String::from),
        });

        let script = self.scripts.lock().pop_front();
        match script {
            Some(Script::Sse(chunks)) => {
                let mut headers = HeaderMap::new();
                headers.insert(CONTENT_TYPE, "text/event-stream".parse().unwrap());
                Ok(HttpResponse::new(
                    StatusCode::OK,
                    headers,
                    stream::iter(chunks),
                ))
            }
            Some(Script::Fail) | None => Err(TransportError::Network("scripted failure".into())),
        }
    }
}

fn sse_chunk(id: &str, method: &str) -> Bytes {
    let message = json!({"jsonrpc": "2.0", "method": method, "params": {}});
    Bytes::from(format!("id: {id}\ndata: {message}\n\n"))
}

fn fast_reconnects(max_retries: u32) -> ReconnectionOptions {
    ReconnectionOptions {
        initial_reconnection_delay: Duration::from_millis(5),
        max_reconnection_delay: Duration::from_millis(20),
        reconnection_delay_grow_factor: 1.5,
        max_retries,
    }
}

fn transport_with(
    fetch: Arc<ScriptedFetch>,
    options: ReconnectionOptions,
) -> StreamableHttpTransport {
    let config = StreamableHttpConfig::builder(Url::parse("http://localhost:9/mcp").unwrap())
        .with_fetch(fetch)
        .with_reconnection_options(options)
        .build();
    StreamableHttpTransport::new(config)
}

fn channels(
    transport: &StreamableHttpTransport,
) -> (
    mpsc::UnboundedReceiver<Value>,
    mpsc::UnboundedReceiver<TransportError>,
) {
    let (msg_tx, msg_rx) = mpsc::unbounded_channel();
    transport.set_on_message(move |m| {
        let _ = msg_tx.send(m);
    });
    let (err_tx, err_rx) = mpsc::unbounded_channel();
    transport.set_on_error(move |e| {
        let _ = err_tx.send(e);
    });
    (msg_rx, err_rx)
}

#[tokio::test]
async fn interrupted_standalone_stream_resumes_with_last_event_id() {
    let fetch = ScriptedFetch::new(vec![
        Script::Sse(vec![
            Ok(sse_chunk("evt-1", "first")),
            Err(TransportError::Network("connection reset".into())),
        ]),
        Script::Sse(vec![Ok(sse_chunk("evt-2", "second"))]),
    ]);
    let transport = transport_with(fetch.clone(), fast_reconnects(3));
    let (mut messages, _errors) = channels(&transport);

    transport.open_standalone_stream(None).await.unwrap();

    let first = timeout(Duration::from_secs(2), messages.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first["method"], "first");

    let second = timeout(Duration::from_secs(2), messages.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second["method"], "second");

    assert_eq!(fetch.request_count(), 2);
    assert_eq!(fetch.last_event_id_of(0), None);
    // The reconnect replays from the last event seen before the drop.
    assert_eq!(fetch.last_event_id_of(1).as_deref(), Some("evt-1"));
}

#[tokio::test]
async fn reconnection_gives_up_after_max_retries() {
    let fetch = ScriptedFetch::new(vec![Script::Sse(vec![
        Ok(sse_chunk("evt-1", "only")),
        Err(TransportError::Network("connection reset".into())),
    ])]);
    let transport = transport_with(fetch.clone(), fast_reconnects(2));
    let (mut messages, mut errors) = channels(&transport);

    transport.open_standalone_stream(None).await.unwrap();
    let _ = timeout(Duration::from_secs(2), messages.recv()).await;

    let err = timeout(Duration::from_secs(2), errors.recv())
        .await
        .expect("exhaustion must surface via on_error")
        .unwrap();
    assert!(matches!(err, TransportError::ReconnectExhausted { attempts: 2 }));

    // Initial open plus the two failed reconnect attempts.
    assert_eq!(fetch.request_count(), 3);
}

#[tokio::test]
async fn max_retries_zero_disables_reconnection() {
    let fetch = ScriptedFetch::new(vec![Script::Sse(vec![
        Ok(sse_chunk("evt-1", "only")),
        Err(TransportError::Network("connection reset".into())),
    ])]);
    let transport = transport_with(fetch.clone(), fast_reconnects(0));
    let (_messages, mut errors) = channels(&transport);

    transport.open_standalone_stream(None).await.unwrap();

    let err = timeout(Duration::from_secs(2), errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(err, TransportError::ReconnectExhausted { attempts: 0 }));
    assert_eq!(fetch.request_count(), 1, "no reconnect may be attempted");
}

#[tokio::test]
async fn per_request_stream_without_events_is_not_resumed() {
    let fetch = ScriptedFetch::new(vec![Script::Sse(vec![Err(TransportError::Network(
        "connection reset".into(),
    ))])]);
    let transport = transport_with(fetch.clone(), fast_reconnects(3));
    let (_messages, mut errors) = channels(&transport);

    transport
        .send(json!({"jsonrpc": "2.0", "method": "slow", "params": {}, "id": "r1"}))
        .await
        .unwrap();

    let err = timeout(Duration::from_secs(2), errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(err, TransportError::Network(_)));

    // Nothing was replayed: the failed POST stream is the only exchange.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fetch.request_count(), 1);
    assert_eq!(fetch.requests.lock()[0].method, "POST");
}

#[tokio::test]
async fn per_request_stream_resumes_after_first_event() {
    let fetch = ScriptedFetch::new(vec![
        Script::Sse(vec![
            Ok(sse_chunk("evt-1", "progress")),
            Err(TransportError::Network("connection reset".into())),
        ]),
        Script::Sse(vec![Ok(sse_chunk("evt-2", "result"))]),
    ]);
    let transport = transport_with(fetch.clone(), fast_reconnects(3));
    let (mut messages, _errors) = channels(&transport);

    transport
        .send(json!({"jsonrpc": "2.0", "method": "slow", "params": {}, "id": "r1"}))
        .await
        .unwrap();

    let first = timeout(Duration::from_secs(2), messages.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first["method"], "progress");
    let second = timeout(Duration::from_secs(2), messages.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second["method"], "result");

    assert_eq!(fetch.request_count(), 2);
    assert_eq!(fetch.requests.lock()[0].method, "POST");
    // Resumption is a GET carrying the replay point.
    assert_eq!(fetch.requests.lock()[1].method, "GET");
    assert_eq!(fetch.last_event_id_of(1).as_deref(), Some("evt-1"));
}

#[tokio::test]
async fn close_cancels_a_pending_reconnect() {
    let fetch = ScriptedFetch::new(vec![Script::Sse(vec![
        Ok(sse_chunk("evt-1", "only")),
        Err(TransportError::Network("connection reset".into())),
    ])]);
    let options = ReconnectionOptions {
        initial_reconnection_delay: Duration::from_millis(200),
        max_reconnection_delay: Duration::from_millis(200),
        reconnection_delay_grow_factor: 1.0,
        max_retries: 5,
    };
    let transport = transport_with(fetch.clone(), options);
    let (mut messages, mut errors) = channels(&transport);

    transport.open_standalone_stream(None).await.unwrap();
    let _ = timeout(Duration::from_secs(2), messages.recv()).await;

    // The stream has failed and a reconnect sleep is pending; close now.
    transport.close().await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(fetch.request_count(), 1, "close must cancel the retry timer");
    assert!(errors.try_recv().is_err(), "no exhaustion after close");
}
