//! End-to-end runs of the pipeline against fixture vendor sites served by
//! wiremock, persisting to a temporary store and `SQLite` database.

#![allow(clippy::unwrap_used)]

mod support;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use harvester_core::{
    ArtifactPattern, LocalPersistence, Pipeline, SourceConfig, SourceStatus, SourceSummary,
};
use support::{fast_settings, forbid, hits, mount_page, mount_pdf, start_mock_server_or_skip};
use tempfile::TempDir;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn acme_config(server: &MockServer) -> SourceConfig {
    SourceConfig::new(
        "Acme",
        vec![Url::parse(&format!("{}/index", server.uri())).unwrap()],
    )
    .with_pattern(ArtifactPattern::parse(".pdf").unwrap())
    .with_allow_list(["127.0.0.1"])
}

async fn mount_acme(server: &MockServer) {
    mount_page(
        server,
        "/index",
        r#"<a href="/cat">Catalogue</a> <a href="/m1.pdf">Model 1</a>"#,
    )
    .await;
    mount_page(
        server,
        "/cat",
        r#"<a href="/m2.pdf">Model 2</a> <a href="https://elsewhere.example/z">Partner</a>"#,
    )
    .await;
    mount_pdf(server, "/m1.pdf", b"%PDF-1.7 model one").await;
    mount_pdf(server, "/m2.pdf", b"%PDF-1.7 model two").await;
}

async fn open_store(dir: &Path, db_name: &str) -> Arc<LocalPersistence> {
    Arc::new(
        LocalPersistence::open(&dir.join("store"), &dir.join(db_name))
            .await
            .unwrap(),
    )
}

async fn run_once(store: Arc<LocalPersistence>, config: SourceConfig) -> SourceSummary {
    let pipeline = Pipeline::new(fast_settings(), store).unwrap();
    pipeline.run_source(config).await
}

fn count_files(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() { count_files(&path) } else { 1 }
        })
        .sum()
}

#[tokio::test]
async fn test_acme_site_ingests_both_manuals() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_acme(&server).await;
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path(), "h.db").await;

    let summary = run_once(Arc::clone(&store), acme_config(&server)).await;

    assert_eq!(summary.status, SourceStatus::Completed);
    assert_eq!(summary.counts.discovered, 2);
    assert_eq!(summary.counts.ingested, 2);
    assert_eq!(summary.counts.failed, 0);
    let traversal = summary.traversal.as_ref().unwrap();
    assert_eq!(traversal.pages_failed, 0);
    assert!(traversal.links_skipped_off_domain >= 1);

    let checksums: HashSet<&str> = summary.records.iter().map(|r| r.checksum.as_str()).collect();
    assert_eq!(checksums.len(), 2);
    for record in &summary.records {
        assert_eq!(record.brand, "Acme");
        assert!(record.storage_location.starts_with("acme/"));
        assert!(record.file_name.ends_with(".pdf"));
        assert!(store.objects().root().join(&record.storage_location).is_file());
    }

    let persisted = store.metadata().records_for_brand("Acme").await.unwrap();
    assert_eq!(persisted.len(), 2);
}

#[tokio::test]
async fn test_rerun_dedups_everything() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_acme(&server).await;
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path(), "h.db").await;

    let first = run_once(Arc::clone(&store), acme_config(&server)).await;
    assert_eq!(first.counts.ingested, 2);
    let objects_after_first = count_files(&dir.path().join("store"));

    let second = run_once(Arc::clone(&store), acme_config(&server)).await;
    assert_eq!(second.counts.discovered, 2);
    assert_eq!(second.counts.deduped, 2);
    assert_eq!(second.counts.ingested, 0);
    assert_eq!(second.counts.failed, 0);
    assert_eq!(count_files(&dir.path().join("store")), objects_after_first);

    // Known URLs are never downloaded again.
    assert_eq!(hits(&server, "/m1.pdf").await, 1);
    assert_eq!(hits(&server, "/m2.pdf").await, 1);
}

#[tokio::test]
async fn test_same_bytes_at_two_urls_stored_once() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_page(
        &server,
        "/index",
        r#"<a href="/m1.pdf">Model 1</a> <a href="/mirror/m1-copy.pdf">Model 1 (mirror)</a>"#,
    )
    .await;
    mount_pdf(&server, "/m1.pdf", b"%PDF-1.7 identical").await;
    mount_pdf(&server, "/mirror/m1-copy.pdf", b"%PDF-1.7 identical").await;
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path(), "h.db").await;

    let first = run_once(Arc::clone(&store), acme_config(&server)).await;
    assert_eq!(first.counts.discovered, 2);
    assert_eq!(first.counts.ingested, 1);
    assert_eq!(first.counts.deduped, 1);
    assert_eq!(first.counts.failed, 0);
    assert_eq!(count_files(&dir.path().join("store")), 1);

    let second = run_once(Arc::clone(&store), acme_config(&server)).await;
    assert_eq!(second.counts.discovered, 2);
    assert_eq!(second.counts.deduped, 2);
    assert_eq!(second.counts.ingested, 0);
}

#[tokio::test]
async fn test_depth_limit_stops_link_following() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_page(
        &server,
        "/index",
        r#"<a href="/level1">Products</a> <a href="/top.pdf">Top</a>"#,
    )
    .await;
    mount_page(
        &server,
        "/level1",
        r#"<a href="/level2">More</a> <a href="/mid.pdf">Mid</a>"#,
    )
    .await;
    forbid(&server, "/level2").await;
    mount_pdf(&server, "/top.pdf", b"%PDF top").await;
    mount_pdf(&server, "/mid.pdf", b"%PDF mid").await;
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path(), "h.db").await;

    let summary = run_once(store, acme_config(&server).with_depth_limit(1)).await;

    assert_eq!(summary.status, SourceStatus::Completed);
    assert_eq!(summary.counts.discovered, 2);
    assert_eq!(summary.counts.ingested, 2);
    assert_eq!(summary.traversal.as_ref().unwrap().pages_visited, 2);
}

#[tokio::test]
async fn test_links_outside_allow_list_are_never_fetched() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let port = server.address().port();
    mount_page(
        &server,
        "/index",
        &format!(
            r#"<a href="http://localhost:{port}/offsite">Offsite</a>
               <a href="http://localhost:{port}/offsite.pdf">Offsite manual</a>
               <a href="/m1.pdf">Model 1</a>"#
        ),
    )
    .await;
    forbid(&server, "/offsite").await;
    forbid(&server, "/offsite.pdf").await;
    mount_pdf(&server, "/m1.pdf", b"%PDF on domain").await;
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path(), "h.db").await;

    let summary = run_once(store, acme_config(&server)).await;

    assert_eq!(summary.counts.discovered, 1);
    assert_eq!(summary.counts.ingested, 1);
    let traversal = summary.traversal.as_ref().unwrap();
    assert_eq!(traversal.links_skipped_off_domain, 1);
    assert_eq!(traversal.artifacts_skipped_off_domain, 1);
}

#[tokio::test]
async fn test_failing_page_does_not_stop_siblings() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_page(
        &server,
        "/index",
        r#"<a href="/broken">Broken</a> <a href="/ok">Ok</a> <a href="/m1.pdf">Model 1</a>"#,
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    mount_page(&server, "/ok", r#"<a href="/m2.pdf">Model 2</a>"#).await;
    mount_pdf(&server, "/m1.pdf", b"%PDF one").await;
    mount_pdf(&server, "/m2.pdf", b"%PDF two").await;
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path(), "h.db").await;

    let summary = run_once(store, acme_config(&server)).await;

    assert_eq!(summary.status, SourceStatus::Degraded);
    assert_eq!(summary.counts.ingested, 2);
    assert_eq!(summary.traversal.as_ref().unwrap().pages_failed, 1);
}

#[tokio::test]
async fn test_missing_artifact_fails_alone() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_page(
        &server,
        "/index",
        r#"<a href="/gone.pdf">Gone</a> <a href="/m1.pdf">Model 1</a>"#,
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/gone.pdf"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    mount_pdf(&server, "/m1.pdf", b"%PDF one").await;
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path(), "h.db").await;

    let summary = run_once(Arc::clone(&store), acme_config(&server)).await;

    assert_eq!(summary.status, SourceStatus::Degraded);
    assert_eq!(summary.counts.ingested, 1);
    assert_eq!(summary.counts.failed, 1);
    let failure = &summary.failures[0];
    assert!(failure.artifact_url.ends_with("/gone.pdf"));
    assert_eq!(failure.attempts, 1);

    // A failed artifact is not remembered, so the next run tries it again.
    let rerun = run_once(store, acme_config(&server)).await;
    assert_eq!(rerun.counts.deduped, 1);
    assert_eq!(rerun.counts.failed, 1);
}

#[tokio::test]
async fn test_transient_download_error_is_retried() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_page(&server, "/index", r#"<a href="/flaky.pdf">Flaky</a>"#).await;
    Mock::given(method("GET"))
        .and(path("/flaky.pdf"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_pdf(&server, "/flaky.pdf", b"%PDF eventually").await;
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path(), "h.db").await;

    let summary = run_once(store, acme_config(&server)).await;

    assert_eq!(summary.status, SourceStatus::Completed);
    assert_eq!(summary.counts.ingested, 1);
    assert_eq!(hits(&server, "/flaky.pdf").await, 2);
}

#[tokio::test]
async fn test_lost_catalogue_converges_without_rewriting_objects() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_acme(&server).await;
    let dir = TempDir::new().unwrap();

    let first = run_once(open_store(dir.path(), "first.db").await, acme_config(&server)).await;
    assert_eq!(first.counts.ingested, 2);
    let objects = count_files(&dir.path().join("store"));
    assert_eq!(objects, 2);

    // Objects survived but the catalogue did not: rows are written again,
    // objects are left as they are.
    let second = run_once(open_store(dir.path(), "second.db").await, acme_config(&server)).await;
    assert_eq!(second.status, SourceStatus::Completed);
    assert_eq!(second.counts.ingested, 2);
    assert_eq!(second.counts.failed, 0);
    assert_eq!(count_files(&dir.path().join("store")), objects);
}
