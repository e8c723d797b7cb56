//! Integration tests for tile-grid pages, end to end through the orchestrator.

mod support;

use std::time::Duration;

use folio_core::config::SourceProfile;
use folio_core::manifest::{Manifest, Page, TileGridRef};
use folio_core::{HttpClient, Orchestrator, RunSettings};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use support::{TileResponder, pdf_page_sizes, png};

const TILE: u32 = 16;

fn grid(server: &MockServer, columns: u32, rows: u32) -> TileGridRef {
    TileGridRef {
        base_url_template: format!("{}/tiles/{{col}}_{{row}}.{{format}}", server.uri()),
        grid_width: Some(columns),
        grid_height: Some(rows),
        tile_size: TILE,
        zoom_level: None,
        format: "png".to_string(),
        overlap_px: 0,
        max_zoom_discovered: true,
    }
}

fn manifest(pages: Vec<Page>) -> Manifest {
    Manifest {
        id: "tiles-ms".to_string(),
        display_name: "Tiled Atlas".to_string(),
        source_name: "default".to_string(),
        original_url: String::new(),
        pages,
        discovery: None,
    }
}

fn settings() -> RunSettings {
    let mut settings = RunSettings::resolve(&SourceProfile {
        concurrency: Some(6),
        retry_limit: Some(2),
        backoff_base_ms: Some(1),
        per_page_byte_estimate: Some(1.0),
        ..SourceProfile::default()
    });
    settings.min_tile_bytes = 16;
    settings.min_page_bytes = 16;
    settings.request_timeout = Duration::from_secs(5);
    settings
}

async fn run(manifest: Manifest, out: &TempDir) -> folio_core::RunReport {
    Orchestrator::new(HttpClient::new().expect("client"), out.path())
        .run(manifest, &settings(), CancellationToken::new())
        .await
        .expect("run completes")
}

#[tokio::test]
async fn test_full_grid_page_matches_grid_dimensions() {
    let server = MockServer::start().await;
    Mock::given(path_regex(r"^/tiles/"))
        .respond_with(TileResponder::full(4, 3, TILE))
        .mount(&server)
        .await;

    let out = TempDir::new().expect("temp dir");
    let report = run(manifest(vec![Page::tiled(0, grid(&server, 4, 3))]), &out).await;

    assert!(report.is_complete());
    assert_eq!(report.artifacts.len(), 1);
    assert_eq!(pdf_page_sizes(&report.artifacts[0]), vec![(64, 48)]);
}

#[tokio::test]
async fn test_missing_last_column_is_trimmed_not_failed() {
    let server = MockServer::start().await;
    let mut responder = TileResponder::full(10, 2, TILE);
    responder.missing.insert((9, 0));
    responder.missing.insert((9, 1));
    Mock::given(path_regex(r"^/tiles/"))
        .respond_with(responder)
        .mount(&server)
        .await;

    let out = TempDir::new().expect("temp dir");
    let report = run(manifest(vec![Page::tiled(0, grid(&server, 10, 2))]), &out).await;

    assert!(report.is_complete());
    assert_eq!(pdf_page_sizes(&report.artifacts[0]), vec![(9 * 16, 2 * 16)]);
}

#[tokio::test]
async fn test_probed_grid_without_known_dimensions() {
    let server = MockServer::start().await;
    Mock::given(path_regex(r"^/tiles/"))
        .respond_with(TileResponder::full(3, 5, TILE))
        .mount(&server)
        .await;

    let mut unknown = grid(&server, 0, 0);
    unknown.grid_width = None;
    unknown.grid_height = None;

    let out = TempDir::new().expect("temp dir");
    let report = run(manifest(vec![Page::tiled(0, unknown)]), &out).await;

    assert!(report.is_complete());
    assert_eq!(pdf_page_sizes(&report.artifacts[0]), vec![(48, 80)]);
}

#[tokio::test]
async fn test_grid_with_forty_percent_server_errors_fails_only_that_page() {
    let server = MockServer::start().await;
    let mut responder = TileResponder::full(5, 2, TILE);
    for cell in [(0, 0), (1, 0), (2, 1), (4, 1)] {
        responder.failing.insert(cell);
    }
    Mock::given(path_regex(r"^/tiles/"))
        .respond_with(responder)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/pages/1.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(png(20, 30)))
        .mount(&server)
        .await;

    let pages = vec![
        Page::tiled(0, grid(&server, 5, 2)),
        Page::direct(1, format!("{}/pages/1.png", server.uri())),
    ];
    let out = TempDir::new().expect("temp dir");
    let report = run(manifest(pages), &out).await;

    assert_eq!(report.failed_pages, vec![0]);
    assert!(report.failures[0].reason.contains("missing"));
    assert_eq!(report.artifacts.len(), 1);
    assert_eq!(pdf_page_sizes(&report.artifacts[0]), vec![(20, 30)]);
}
