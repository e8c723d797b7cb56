//! Integration tests for the download scheduler and page-count discovery.

mod support;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use folio_core::download::{ContentExpectation, HttpClient, ProbeMethod, RateLimiter, RetryPolicy};
use folio_core::manifest::{Page, PageDiscovery};
use folio_core::scheduler::{
    Fetcher, PageError, RunSignals, Scheduler, UrlTemplateProbe, discover_page_count,
    trim_trailing_artifacts,
};
use folio_core::tiles::TileStitcher;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use support::{PagedResponder, padded_jpeg, png};

fn fetcher(retry_limit: u32) -> Arc<Fetcher> {
    Arc::new(Fetcher::new(
        HttpClient::new().expect("client"),
        4,
        Arc::new(RateLimiter::disabled()),
        RetryPolicy::new(
            retry_limit,
            Duration::from_millis(1),
            Duration::from_millis(5),
            2.0,
        ),
        Duration::from_secs(5),
    ))
}

fn scheduler(retry_limit: u32) -> Scheduler {
    let fetcher = fetcher(retry_limit);
    let stitcher = Arc::new(TileStitcher::new(
        Arc::clone(&fetcher),
        ProbeMethod::RangeGet,
        16,
        0.25,
    ));
    Scheduler::new(fetcher, stitcher, 16)
}

fn signals() -> RunSignals {
    let (tx, _rx) = mpsc::unbounded_channel();
    RunSignals::new(&CancellationToken::new(), tx)
}

#[tokio::test]
async fn test_always_transient_failure_is_attempted_exactly_retry_limit_times() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky.jpg"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let pages = vec![Page::direct(0, format!("{}/flaky.jpg", server.uri()))];
    let mut results = scheduler(3).dispatch(&pages, &signals());
    let result = results.recv().await.expect("one result");

    assert_eq!(result.page_index, 0);
    assert_eq!(result.attempts, 3);
    assert!(matches!(result.outcome, Err(PageError::Fetch { .. })));
    assert!(results.recv().await.is_none());
}

#[tokio::test]
async fn test_terminal_client_error_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gone.jpg"))
        .respond_with(ResponseTemplate::new(410))
        .expect(1)
        .mount(&server)
        .await;

    let pages = vec![Page::direct(0, format!("{}/gone.jpg", server.uri()))];
    let result = scheduler(5)
        .dispatch(&pages, &signals())
        .recv()
        .await
        .expect("one result");
    assert_eq!(result.attempts, 1);
    assert!(result.outcome.is_err());
}

#[tokio::test]
async fn test_html_error_page_with_200_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html")
                .set_body_string("<html><body>Access denied, please log in</body></html>"),
        )
        .mount(&server)
        .await;

    let pages = vec![Page::direct(0, format!("{}/page.jpg", server.uri()))];
    let result = scheduler(2)
        .dispatch(&pages, &signals())
        .recv()
        .await
        .expect("one result");
    assert!(matches!(result.outcome, Err(PageError::Fetch { .. })));
}

#[tokio::test]
async fn test_discovery_ignores_phantom_pages_with_logarithmic_probes() {
    const PAGES: u32 = 37;
    const MAX_PAGES: u32 = 4096;

    let server = MockServer::start().await;
    let responder = PagedResponder::new(PAGES, png(24, 32));
    let hits = Arc::clone(&responder.hits);
    Mock::given(path_regex(r"^/book/\d+\.png$"))
        .respond_with(responder)
        .mount(&server)
        .await;

    let probe = UrlTemplateProbe::new(
        fetcher(2),
        PageDiscovery {
            url_template: format!("{}/book/{{page}}.png", server.uri()),
            first_page_number: 1,
            max_pages: MAX_PAGES,
        },
        ProbeMethod::RangeGet,
        ContentExpectation::image(16),
        signals(),
    );

    let found = discover_page_count(&probe, MAX_PAGES)
        .await
        .expect("discovery succeeds");

    assert_eq!(found.count, PAGES);
    // Doubling to 64 (7 probes) then a binary search over (32, 64).
    let bound = 2 * (u32::BITS - PAGES.leading_zeros()) + 2;
    assert!(found.probes <= bound, "{} probes > {bound}", found.probes);
    assert_eq!(hits.load(Ordering::SeqCst), found.probes as usize);
}

#[tokio::test]
async fn test_head_probing_finds_same_count() {
    let server = MockServer::start().await;
    Mock::given(path_regex(r"^/scan/\d+\.png$"))
        .respond_with(PagedResponder::new(9, png(8, 8)))
        .mount(&server)
        .await;

    let probe = UrlTemplateProbe::new(
        fetcher(2),
        PageDiscovery {
            url_template: format!("{}/scan/{{page}}.png", server.uri()),
            first_page_number: 1,
            max_pages: 100,
        },
        ProbeMethod::Head,
        ContentExpectation::image(16),
        signals(),
    );

    let found = discover_page_count(&probe, 100).await.expect("discovery");
    assert_eq!(found.count, 9);
}

#[tokio::test]
async fn test_trailing_placeholder_pages_are_trimmed() {
    let server = MockServer::start().await;
    let page = padded_jpeg(8_000);
    let placeholder = padded_jpeg(1_200);
    assert!(placeholder.len() * 10 < page.len() * 3);

    // 40 real pages followed by 3 tiny "not digitized" placeholders.
    Mock::given(path_regex(r"^/vol/(4[1-3])\.png$"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(placeholder))
        .mount(&server)
        .await;
    Mock::given(path_regex(r"^/vol/\d+\.png$"))
        .respond_with(PagedResponder::new(43, page))
        .mount(&server)
        .await;

    let probe = UrlTemplateProbe::new(
        fetcher(2),
        PageDiscovery {
            url_template: format!("{}/vol/{{page}}.png", server.uri()),
            first_page_number: 1,
            max_pages: 1000,
        },
        ProbeMethod::RangeGet,
        ContentExpectation::image(16),
        signals(),
    );

    let found = discover_page_count(&probe, 1000).await.expect("discovery");
    assert_eq!(found.count, 43);
    let kept = trim_trailing_artifacts(&probe, found.count, 15, 0.3)
        .await
        .expect("tail check");
    assert_eq!(kept, 40);
}
