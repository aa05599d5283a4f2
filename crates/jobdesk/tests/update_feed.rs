//! HttpUpdateChecker and the cached update check against a mock release feed.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use jobdesk::{HttpUpdateChecker, UpdateChecker, UpdateError, UpdateService, VersionInfo};

fn checker(server: &MockServer, current: &str) -> HttpUpdateChecker {
    HttpUpdateChecker::new(
        server.uri(),
        VersionInfo::new(current, "stable"),
        Duration::from_secs(5),
    )
    .expect("failed to build test checker")
}

async fn serve_version(server: &MockServer, version: &str) {
    Mock::given(method("GET"))
        .and(path("/stable"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "version": version })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn newer_remote_version_is_an_update() {
    let server = MockServer::start().await;
    serve_version(&server, "v1.4.0").await;

    let checker = checker(&server, "1.3.9");
    assert!(checker.update_available("stable", "1.3.9").await.unwrap());
}

#[tokio::test]
async fn same_or_older_remote_version_is_not_an_update() {
    let server = MockServer::start().await;
    serve_version(&server, "1.4").await;

    let checker = checker(&server, "1.4.0");
    assert!(!checker.update_available("stable", "1.4.0").await.unwrap());
    assert!(!checker.update_available("stable", "2.0.0").await.unwrap());
}

#[tokio::test]
async fn trailing_slash_in_feed_url_is_ignored() {
    let server = MockServer::start().await;
    serve_version(&server, "2.0.0").await;

    let checker = HttpUpdateChecker::new(
        format!("{}/", server.uri()),
        VersionInfo::new("1.0.0", "stable"),
        Duration::from_secs(5),
    )
    .unwrap();
    assert!(checker.update_available("stable", "1.0.0").await.unwrap());
}

#[tokio::test]
async fn error_status_is_a_feed_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/nightly"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such branch"))
        .mount(&server)
        .await;

    let checker = checker(&server, "1.0.0");
    let err = checker.update_available("nightly", "1.0.0").await.unwrap_err();
    match err {
        UpdateError::Feed { status, body } => {
            assert_eq!(status, 404);
            assert_eq!(body, "no such branch");
        }
        other => panic!("expected Feed error, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_remote_version_is_rejected() {
    let server = MockServer::start().await;
    serve_version(&server, "latest").await;

    let checker = checker(&server, "1.0.0");
    let err = checker.update_available("stable", "1.0.0").await.unwrap_err();
    assert!(matches!(err, UpdateError::InvalidVersion(ref v) if v == "latest"));
}

#[tokio::test]
async fn malformed_body_is_an_http_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/stable"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
        .mount(&server)
        .await;

    let checker = checker(&server, "1.0.0");
    let err = checker.update_available("stable", "1.0.0").await.unwrap_err();
    assert!(matches!(err, UpdateError::Http(_)));
}

#[tokio::test]
async fn slow_feed_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/stable"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "version": "9.9.9" }))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let checker = HttpUpdateChecker::new(
        server.uri(),
        VersionInfo::new("1.0.0", "stable"),
        Duration::from_millis(200),
    )
    .unwrap();
    let err = checker.update_available("stable", "1.0.0").await.unwrap_err();
    assert!(matches!(err, UpdateError::Http(ref e) if e.is_timeout()));
}

#[tokio::test]
async fn sequential_cached_checks_hit_the_feed_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/stable"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "version": "2.0.0" })))
        .expect(1)
        .mount(&server)
        .await;

    let service = UpdateService::new(Arc::new(checker(&server, "1.0.0")));
    assert!(service.check_cached().await.unwrap());
    assert!(service.check_cached().await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_cached_checks_share_one_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/stable"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "version": "2.0.0" }))
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let service = Arc::new(UpdateService::new(Arc::new(checker(&server, "1.0.0"))));
    let checks = (0..16).map(|_| {
        let service = Arc::clone(&service);
        async move { service.check_cached().await }
    });

    for result in join_all(checks).await {
        assert!(result.unwrap());
    }
}

#[tokio::test]
async fn failed_cached_check_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/stable"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    serve_version(&server, "2.0.0").await;

    let service = UpdateService::new(Arc::new(checker(&server, "1.0.0")));
    let err = service.check_cached().await.unwrap_err();
    assert!(matches!(
        err.producer_error(),
        Some(UpdateError::Feed { status: 503, .. })
    ));
    assert!(service.check_cached().await.unwrap());
}
