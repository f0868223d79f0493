//! Integration tests for the fetch engine against a local mock server.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use assert_matches::assert_matches;
use crawlq::{
    classify::{classify, ErrorKind},
    config::Config,
    fetch::{AttemptObserver, AttemptOutcome, AttemptResult, FetchEngine, Pacer, PacerError},
};
use reqwest::{Client, StatusCode};
use tokio_util::sync::CancellationToken;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

#[derive(Clone, Default)]
struct RecordingObserver {
    outcomes: Arc<Mutex<Vec<(u32, AttemptResult, Duration)>>>,
}

impl RecordingObserver {
    fn outcomes(&self) -> Vec<(u32, AttemptResult, Duration)> {
        self.outcomes.lock().unwrap().clone()
    }
}

impl AttemptObserver for RecordingObserver {
    fn on_attempt(&self, outcome: &AttemptOutcome<'_>) {
        self.outcomes.lock().unwrap().push((
            outcome.attempt,
            outcome.result.clone(),
            outcome.wait,
        ));
    }
}

fn config() -> Config {
    Config {
        max_attempts: 3,
        base_delay_ms: 50,
        ..Config::default()
    }
}

fn engine(observer: &RecordingObserver) -> FetchEngine {
    FetchEngine::new(Client::new(), &config()).with_observer(observer.clone())
}

#[tokio::test]
async fn success_on_the_first_attempt_makes_exactly_one_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/r/rust/about.json"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let observer = RecordingObserver::default();
    let url = format!("{}/r/rust/about.json", server.uri());
    let response = engine(&observer)
        .execute("r/rust", &CancellationToken::new(), &move |client: &Client| {
            client.get(&url)
        })
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let outcomes = observer.outcomes();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].2, Duration::ZERO, "no wait after the final attempt");
}

#[tokio::test]
async fn retry_after_header_is_honoured_exactly() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "1"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let observer = RecordingObserver::default();
    let url = server.uri();
    let started = Instant::now();
    let response = engine(&observer)
        .execute("r/rust", &CancellationToken::new(), &move |client: &Client| {
            client.get(&url)
        })
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        started.elapsed() >= Duration::from_millis(900),
        "server-dictated pacing was skipped: {:?}",
        started.elapsed()
    );

    let outcomes = observer.outcomes();
    assert_eq!(outcomes.len(), 2, "exactly two attempts");
    assert_eq!(
        outcomes[0].1,
        AttemptResult::Response(StatusCode::TOO_MANY_REQUESTS)
    );
    assert_eq!(outcomes[0].2, Duration::from_secs(1), "imposed wait is the header value");
    assert_eq!(outcomes[1].1, AttemptResult::Response(StatusCode::OK));
}

#[tokio::test]
async fn server_errors_are_retried_and_the_eventual_success_returned() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let observer = RecordingObserver::default();
    let url = server.uri();
    let response = engine(&observer)
        .execute("r/rust", &CancellationToken::new(), &move |client: &Client| {
            client.get(&url)
        })
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK, "no error for a recovered call");
    let attempts = observer
        .outcomes()
        .iter()
        .map(|(attempt, _, _)| *attempt)
        .collect::<Vec<_>>();
    assert_eq!(attempts, vec![1, 2, 3]);
}

#[tokio::test]
async fn an_exhausted_throttle_returns_the_response_as_is() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let observer = RecordingObserver::default();
    let url = server.uri();
    let response = engine(&observer)
        .execute("r/rust", &CancellationToken::new(), &move |client: &Client| {
            client.get(&url)
        })
        .await
        .unwrap();

    // Retries on a *received* response exhaust into the response itself, not
    // a synthesized error; the caller inspects the status.
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(observer.outcomes().len(), 3);
}

#[tokio::test]
async fn an_already_cancelled_call_is_never_sent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let observer = RecordingObserver::default();
    let cancelled = CancellationToken::new();
    cancelled.cancel();

    let url = server.uri();
    let result = engine(&observer)
        .execute("r/rust", &cancelled, &move |client: &Client| client.get(&url))
        .await;

    assert_matches!(result, Err(crawlq::fetch::FetchError::Cancelled));
    assert!(observer.outcomes().is_empty());
}

#[tokio::test]
async fn cancellation_short_circuits_the_backoff_sleep() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "30"))
        .mount(&server)
        .await;

    let observer = RecordingObserver::default();
    let cancel = CancellationToken::new();
    let url = server.uri();
    let engine = engine(&observer);

    let started = Instant::now();
    let call = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            engine
                .execute("r/rust", &cancel, &move |client: &Client| client.get(&url))
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let result = call.await.unwrap();
    assert_matches!(result, Err(crawlq::fetch::FetchError::Cancelled));
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "the 30s Retry-After sleep was not interrupted"
    );
}

struct RefusingPacer;

#[async_trait::async_trait]
impl Pacer for RefusingPacer {
    async fn acquire(&self, _attempt: u32) -> Result<(), PacerError> {
        Err(PacerError("limiter shutting down".to_owned()))
    }
}

#[tokio::test]
async fn a_pacer_abort_stops_the_call_before_any_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let url = server.uri();
    let result = FetchEngine::new(Client::new(), &config())
        .with_pacer(RefusingPacer)
        .execute(
            "r/rust",
            &CancellationToken::new(),
            &move |client: &Client| client.get(&url),
        )
        .await;

    assert_matches!(result, Err(crawlq::fetch::FetchError::Aborted(_)));
}

#[tokio::test]
async fn non_throttle_errors_return_immediately_for_classification() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(404).set_body_raw(r#"{"reason":"banned"}"#, "application/json"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let observer = RecordingObserver::default();
    let url = server.uri();
    let response = engine(&observer)
        .execute("r/banned", &CancellationToken::new(), &move |client: &Client| {
            client.get(&url)
        })
        .await
        .unwrap();

    assert_eq!(observer.outcomes().len(), 1, "404 is not retried");

    // The worker-side handoff: classify the response and learn this target
    // is permanently gone.
    let status = response.status();
    let body = response.text().await.unwrap();
    let classified = classify(status, &body).unwrap();
    assert_eq!(classified.kind, ErrorKind::BannedTarget);
    assert!(classified.kind.is_permanent());
}
