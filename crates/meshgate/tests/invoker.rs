//! Integration tests for outbound calls: routing, pooling and failure handling.

mod common;

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::CountingDialer;
use common::MemoryCatalog;
use common::Script;
use common::entry;
use meshgate::Error;
use meshgate::discovery::CatalogResolver;
use meshgate::invoker::RemoteInvoker;
use meshgate::pool::ConnectionPool;
use meshgate::remote;
use meshwire::InvokeRequest;
use meshwire::InvokeResponse;
use meshwire::Verb;
use meshwire::WireRequest;

const ADDR: &str = "10.0.0.9:7001";

fn invoker(dialer: CountingDialer) -> RemoteInvoker<CountingDialer> {
    let catalog = Arc::new(MemoryCatalog::default());
    catalog.add(entry("orders", "10.0.0.9", "", Some(7001), "passing"));
    let resolver = Arc::new(CatalogResolver::new(catalog));
    RemoteInvoker::new(resolver, Arc::new(ConnectionPool::new()), dialer)
}

fn to_orders(path: &str) -> WireRequest {
    WireRequest::new("GET", path).with_header("mesh-app-id", "orders")
}

/// Fails with `error` on the first `failures` calls, then succeeds.
fn flaky(failures: usize, error: remote::Error) -> Script {
    let calls = AtomicUsize::new(0);
    Arc::new(move |_: &InvokeRequest| {
        if calls.fetch_add(1, Ordering::SeqCst) < failures {
            return Err(error.clone());
        }
        Ok(InvokeResponse {
            status: 200,
            headers: Default::default(),
            content_type: String::new(),
            data: Vec::new(),
        })
    })
}

// --- Routing ---

#[tokio::test]
async fn test_frame_carries_the_request() {
    let script: Script = Arc::new(|request: &InvokeRequest| {
        assert_eq!(request.verb, Verb::Delete);
        assert_eq!(request.method, "/orders/7");
        assert_eq!(request.query_string, "hard=true");
        assert_eq!(request.metadata.get_all("x-tag"), ["a", "b"]);
        Ok(InvokeResponse {
            status: 404,
            headers: [("x-reason", "gone")].into_iter().collect(),
            content_type: "text/plain".into(),
            data: b"no such order".to_vec(),
        })
    });
    let invoker = invoker(CountingDialer::new().with_script(script));

    let request = WireRequest::new("DELETE", "/orders/7")
        .with_query("hard=true")
        .with_header("mesh-app-id", "orders")
        .with_header("x-tag", "a")
        .with_header("x-tag", "b");
    let response = invoker.invoke(request).await.expect("invoke");

    assert_eq!(response.status_code, 404);
    assert_eq!(response.headers.get("x-reason"), Some("gone"));
    assert_eq!(response.headers.content_type(), Some("text/plain"));
    assert_eq!(response.body, b"no such order");
}

#[tokio::test]
async fn test_missing_target_never_dials() {
    let dialer = CountingDialer::new();
    let invoker = invoker(dialer.clone());

    let err = invoker
        .invoke(WireRequest::new("GET", "/orders"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MissingTarget("mesh-app-id")));
    assert_eq!(err.status_code(), 400);
    assert_eq!(dialer.dials(), 0);
}

#[tokio::test]
async fn test_unknown_service_never_dials() {
    let dialer = CountingDialer::new();
    let invoker = invoker(dialer.clone());

    let err = invoker
        .invoke(WireRequest::new("GET", "/").with_header("mesh-app-id", "billing"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Discovery(_)));
    assert_eq!(err.status_code(), 502);
    assert_eq!(dialer.dials(), 0);
}

// --- Connection reuse ---

#[tokio::test]
async fn test_connection_is_reused() {
    let dialer = CountingDialer::new();
    let invoker = invoker(dialer.clone());

    for _ in 0..5 {
        invoker.invoke(to_orders("/a")).await.expect("invoke");
    }
    assert_eq!(dialer.dials(), 1);
    assert_eq!(invoker.pool().ref_count(ADDR), Some(1));
}

#[tokio::test]
async fn test_unavailable_forces_a_redial() {
    let dialer = CountingDialer::new()
        .with_script(flaky(1, remote::Error::Unavailable("connection reset".into())));
    let invoker = invoker(dialer.clone());

    let err = invoker.invoke(to_orders("/a")).await.unwrap_err();
    assert!(matches!(err, Error::TransportUnavailable(_)));
    assert_eq!(dialer.closes(), 1);
    assert!(invoker.pool().is_empty());

    invoker.invoke(to_orders("/a")).await.expect("second call");
    assert_eq!(dialer.dials(), 2);
}

#[tokio::test]
async fn test_unauthenticated_forces_a_redial() {
    let dialer = CountingDialer::new()
        .with_script(flaky(1, remote::Error::Unauthenticated("bad cert".into())));
    let invoker = invoker(dialer.clone());

    let err = invoker.invoke(to_orders("/a")).await.unwrap_err();
    assert!(matches!(err, Error::Unauthenticated(_)));
    invoker.invoke(to_orders("/a")).await.expect("second call");
    assert_eq!(dialer.dials(), 2);
}

#[tokio::test]
async fn test_other_failures_keep_the_connection() {
    let dialer = CountingDialer::new().with_script(flaky(1, remote::Error::Other("boom".into())));
    let invoker = invoker(dialer.clone());

    let err = invoker.invoke(to_orders("/a")).await.unwrap_err();
    assert!(matches!(err, Error::Remote(_)));
    assert_eq!(dialer.closes(), 0);
    assert_eq!(invoker.pool().ref_count(ADDR), Some(1));

    invoker.invoke(to_orders("/a")).await.expect("second call");
    assert_eq!(dialer.dials(), 1);
}

// --- Dialing ---

#[tokio::test]
async fn test_dial_failure_is_reported() {
    let dialer = CountingDialer::new().failing("connection refused");
    let invoker = invoker(dialer.clone());

    let err = invoker.invoke(to_orders("/a")).await.unwrap_err();
    assert!(matches!(err, Error::DialFailure(_)));
    assert!(err.to_string().contains("connection refused"));
    assert_eq!(err.status_code(), 502);
}

#[tokio::test]
async fn test_slow_dial_times_out() {
    let dialer = CountingDialer::new().with_delay(Duration::from_millis(500));
    let invoker = invoker(dialer).with_dial_timeout(Duration::from_millis(20));

    let err = invoker.invoke(to_orders("/a")).await.unwrap_err();
    assert!(matches!(err, Error::DialFailure(_)));
    assert!(err.to_string().contains("timed out"));
}
