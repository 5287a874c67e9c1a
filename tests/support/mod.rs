//! Shared fixtures for integration tests: a socket guard for wiremock and
//! helpers to mount fixture vendor sites.

use std::net::TcpListener;
use std::panic::Location;
use std::time::Duration;

use harvester_core::{PipelineSettings, RetryPolicy};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Set to `1` to fail instead of skip when localhost sockets are unavailable.
const REQUIRE_SOCKETS_ENV: &str = "HARVESTER_REQUIRE_SOCKET_TESTS";

fn socket_tests_required() -> bool {
    std::env::var(REQUIRE_SOCKETS_ENV)
        .ok()
        .is_some_and(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

/// Starts a mock server, or returns `None` (after logging) when the sandbox
/// forbids binding localhost.
#[track_caller]
pub fn socket_unavailable() -> bool {
    if TcpListener::bind("127.0.0.1:0").is_ok() {
        return false;
    }
    let location = Location::caller();
    let message = format!(
        "[socket-bound-test] cannot bind localhost at {}:{}",
        location.file(),
        location.line()
    );
    assert!(!socket_tests_required(), "{message}");
    eprintln!("{message}; skipping. Set {REQUIRE_SOCKETS_ENV}=1 to fail instead.");
    true
}

pub async fn start_mock_server_or_skip() -> Option<MockServer> {
    if socket_unavailable() {
        None
    } else {
        Some(MockServer::start().await)
    }
}

/// Run settings with no politeness delay and millisecond backoff.
#[allow(dead_code)]
pub fn fast_settings() -> PipelineSettings {
    PipelineSettings {
        download_concurrency: 4,
        retry_policy: RetryPolicy::new(3, Duration::from_millis(5), Duration::from_millis(20), 2.0),
        politeness_delay: Duration::ZERO,
        fetch_timeout: Duration::from_secs(5),
        download_timeout: Duration::from_secs(5),
        dry_run: false,
    }
}

/// Serves `html` at `route`.
#[allow(dead_code)]
pub async fn mount_page(server: &MockServer, route: &str, html: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_raw(html.to_string(), "text/html"))
        .mount(server)
        .await;
}

/// Serves `body` as a PDF at `route`.
#[allow(dead_code)]
pub async fn mount_pdf(server: &MockServer, route: &str, body: &[u8]) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "application/pdf")
                .set_body_bytes(body.to_vec()),
        )
        .mount(server)
        .await;
}

/// Fails the test if `route` is ever requested.
#[allow(dead_code)]
pub async fn forbid(server: &MockServer, route: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(server)
        .await;
}

/// Number of requests the server saw for `route`.
#[allow(dead_code)]
pub async fn hits(server: &MockServer, route: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == route)
        .count()
}
