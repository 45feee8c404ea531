//! Integration tests for full fetch cycles against a mocked feed and
//! mocked article pages.
//!
//! Each test gets its own wiremock server and in-memory SQLite database.

use chrono::{TimeZone, Utc};
use newsreel::feed::ParseError;
use newsreel::pipeline::{
    CycleError, CycleOutcome, CycleReport, EntryFailurePolicy, Pipeline, PipelineSettings,
};
use newsreel::storage::{Database, NewsItemDraft};
use pretty_assertions::assert_eq;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ============================================================================
// Fixtures
// ============================================================================

struct Entry<'a> {
    title: &'a str,
    slug: &'a str,
    date: &'a str,
}

fn rss(base: &str, entries: &[Entry]) -> String {
    let items: String = entries
        .iter()
        .map(|e| {
            format!(
                "<item><title>{}</title><link>{}/articles/{}</link>\
                 <description>Summary of {}</description><pubDate>{}</pubDate></item>",
                e.title, base, e.slug, e.title, e.date
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0"?><rss version="2.0"><channel><title>Crypto News</title>{}</channel></rss>"#,
        items
    )
}

fn article_page(image: Option<&str>) -> String {
    let meta = image
        .map(|src| format!(r#"<meta property="og:image" content="{}">"#, src))
        .unwrap_or_default();
    format!("<html><head><title>Story</title>{}</head><body>text</body></html>", meta)
}

async fn mount_feed(server: &MockServer, body: String) {
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(body)
                .insert_header("Content-Type", "application/rss+xml"),
        )
        .mount(server)
        .await;
}

async fn mount_article(server: &MockServer, slug: &str, response: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path(format!("/articles/{}", slug)))
        .respond_with(response)
        .mount(server)
        .await;
}

fn settings(server: &MockServer, policy: EntryFailurePolicy) -> PipelineSettings {
    PipelineSettings {
        feed_url: format!("{}/feed", server.uri()),
        request_timeout: Duration::from_secs(5),
        image_fetch_concurrency: 3,
        entry_failure_policy: policy,
    }
}

async fn pipeline(server: &MockServer) -> Pipeline {
    pipeline_with(server, EntryFailurePolicy::Abort).await
}

async fn pipeline_with(server: &MockServer, policy: EntryFailurePolicy) -> Pipeline {
    let db = Database::open(":memory:").await.unwrap();
    Pipeline::new(db, reqwest::Client::new(), settings(server, policy))
}

/// Put a known snapshot in place so failure tests can check it survives.
async fn seed_snapshot(db: &Database) -> Vec<newsreel::storage::NewsItem> {
    db.replace_all(&[
        NewsItemDraft {
            title: "Earlier story".into(),
            description: Some("kept".into()),
            link: "https://example.com/earlier".into(),
            published_at: Utc.with_ymd_and_hms(2023, 12, 31, 8, 0, 0).unwrap(),
            image: Some("https://cdn.example.com/earlier.jpg".into()),
        },
        NewsItemDraft {
            title: "Earliest story".into(),
            description: None,
            link: "https://example.com/earliest".into(),
            published_at: Utc.with_ymd_and_hms(2023, 12, 30, 8, 0, 0).unwrap(),
            image: None,
        },
    ])
    .await
    .unwrap();
    db.list_all_ordered_by_published_desc().await.unwrap()
}

// ============================================================================
// Successful cycles
// ============================================================================

#[tokio::test]
async fn test_three_entries_with_images_end_to_end() {
    let server = MockServer::start().await;
    let base = server.uri();
    mount_feed(
        &server,
        rss(
            &base,
            &[
                Entry { title: "Middle", slug: "b", date: "Tue, 02 Jan 2024 12:00:00 +0000" },
                Entry { title: "Newest", slug: "c", date: "Wed, 03 Jan 2024 12:00:00 +0000" },
                Entry { title: "Oldest", slug: "a", date: "Mon, 01 Jan 2024 12:00:00 +0000" },
            ],
        ),
    )
    .await;
    for slug in ["a", "b", "c"] {
        let image = format!("https://cdn.example.com/{}.jpg", slug);
        mount_article(
            &server,
            slug,
            ResponseTemplate::new(200).set_body_string(article_page(Some(&image))),
        )
        .await;
    }

    let pipeline = pipeline(&server).await;
    let outcome = pipeline.run().await;
    assert_eq!(outcome, CycleOutcome::Succeeded(CycleReport { stored: 3, skipped: 0 }));

    let items = pipeline.database().list_all_ordered_by_published_desc().await.unwrap();
    let titles: Vec<_> = items.iter().map(|i| i.title.as_str()).collect();
    assert_eq!(titles, vec!["Newest", "Middle", "Oldest"]);
    assert!(items.iter().all(|i| i.image.is_some()));
    assert_eq!(items[0].image.as_deref(), Some("https://cdn.example.com/c.jpg"));
    assert_eq!(items[0].link, format!("{}/articles/c", base));
    assert_eq!(items[0].description.as_deref(), Some("Summary of Newest"));
    assert_eq!(
        items[0].published_at,
        Utc.with_ymd_and_hms(2024, 1, 3, 12, 0, 0).unwrap()
    );
}

#[tokio::test]
async fn test_page_without_og_image_gives_absent_image() {
    let server = MockServer::start().await;
    let base = server.uri();
    mount_feed(
        &server,
        rss(
            &base,
            &[
                Entry { title: "Pictured", slug: "p", date: "Tue, 02 Jan 2024 12:00:00 +0000" },
                Entry { title: "Plain", slug: "q", date: "Mon, 01 Jan 2024 12:00:00 +0000" },
            ],
        ),
    )
    .await;
    mount_article(
        &server,
        "p",
        ResponseTemplate::new(200).set_body_string(article_page(Some("https://cdn.example.com/p.jpg"))),
    )
    .await;
    mount_article(&server, "q", ResponseTemplate::new(200).set_body_string(article_page(None))).await;

    let pipeline = pipeline(&server).await;
    assert!(pipeline.run().await.is_success());

    let items = pipeline.database().list_all_ordered_by_published_desc().await.unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].image.as_deref(), Some("https://cdn.example.com/p.jpg"));
    assert_eq!(items[1].image, None);
}

#[tokio::test]
async fn test_feed_order_kept_when_pages_finish_out_of_order() {
    let server = MockServer::start().await;
    let base = server.uri();
    // Same publish time everywhere: listing order falls back to insertion order
    let date = "Tue, 02 Jan 2024 12:00:00 +0000";
    mount_feed(
        &server,
        rss(
            &base,
            &[
                Entry { title: "One", slug: "1", date },
                Entry { title: "Two", slug: "2", date },
                Entry { title: "Three", slug: "3", date },
            ],
        ),
    )
    .await;
    mount_article(
        &server,
        "1",
        ResponseTemplate::new(200)
            .set_body_string(article_page(Some("https://cdn.example.com/1.jpg")))
            .set_delay(Duration::from_millis(300)),
    )
    .await;
    mount_article(
        &server,
        "2",
        ResponseTemplate::new(200)
            .set_body_string(article_page(Some("https://cdn.example.com/2.jpg")))
            .set_delay(Duration::from_millis(100)),
    )
    .await;
    mount_article(
        &server,
        "3",
        ResponseTemplate::new(200).set_body_string(article_page(Some("https://cdn.example.com/3.jpg"))),
    )
    .await;

    let pipeline = pipeline(&server).await;
    assert!(pipeline.run().await.is_success());

    let items = pipeline.database().list_all_ordered_by_published_desc().await.unwrap();
    let pairs: Vec<_> = items
        .iter()
        .map(|i| (i.title.as_str(), i.image.as_deref().unwrap_or("")))
        .collect();
    assert_eq!(
        pairs,
        vec![
            ("One", "https://cdn.example.com/1.jpg"),
            ("Two", "https://cdn.example.com/2.jpg"),
            ("Three", "https://cdn.example.com/3.jpg"),
        ]
    );
}

#[tokio::test]
async fn test_successful_cycle_replaces_previous_snapshot() {
    let server = MockServer::start().await;
    let base = server.uri();
    mount_feed(
        &server,
        rss(&base, &[Entry { title: "Fresh", slug: "f", date: "Tue, 02 Jan 2024 12:00:00 +0000" }]),
    )
    .await;
    mount_article(&server, "f", ResponseTemplate::new(200).set_body_string(article_page(None))).await;

    let pipeline = pipeline(&server).await;
    let previous = seed_snapshot(pipeline.database()).await;
    assert!(pipeline.run().await.is_success());

    let items = pipeline.database().list_all_ordered_by_published_desc().await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].title, "Fresh");
    assert!(previous.iter().all(|p| items[0].id > p.id));
}

// ============================================================================
// Failed cycles leave the snapshot alone
// ============================================================================

#[tokio::test]
async fn test_feed_http_error_keeps_snapshot() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let pipeline = pipeline(&server).await;
    let before = seed_snapshot(pipeline.database()).await;

    assert!(matches!(pipeline.try_run().await.unwrap_err(), CycleError::Fetch(_)));
    assert_eq!(
        pipeline.database().list_all_ordered_by_published_desc().await.unwrap(),
        before
    );
}

#[tokio::test]
async fn test_malformed_date_fails_cycle_with_parse_error() {
    let server = MockServer::start().await;
    let base = server.uri();
    mount_feed(
        &server,
        rss(
            &base,
            &[
                Entry { title: "Fine", slug: "a", date: "Tue, 02 Jan 2024 12:00:00 +0000" },
                Entry { title: "Broken", slug: "b", date: "not-a-date" },
            ],
        ),
    )
    .await;
    mount_article(&server, "a", ResponseTemplate::new(200).set_body_string(article_page(None))).await;
    mount_article(&server, "b", ResponseTemplate::new(200).set_body_string(article_page(None))).await;

    let pipeline = pipeline(&server).await;
    let before = seed_snapshot(pipeline.database()).await;

    match pipeline.try_run().await.unwrap_err() {
        CycleError::Parse(ParseError::InvalidDate { title, .. }) => assert_eq!(title, "Broken"),
        e => panic!("Expected InvalidDate, got {:?}", e),
    }
    assert!(!pipeline.run().await.is_success());
    assert_eq!(
        pipeline.database().list_all_ordered_by_published_desc().await.unwrap(),
        before
    );
}

#[tokio::test]
async fn test_unreachable_article_page_fails_cycle() {
    let server = MockServer::start().await;
    let base = server.uri();
    mount_feed(
        &server,
        rss(
            &base,
            &[
                Entry { title: "Up", slug: "up", date: "Tue, 02 Jan 2024 12:00:00 +0000" },
                Entry { title: "Down", slug: "down", date: "Mon, 01 Jan 2024 12:00:00 +0000" },
            ],
        ),
    )
    .await;
    mount_article(&server, "up", ResponseTemplate::new(200).set_body_string(article_page(None))).await;
    mount_article(&server, "down", ResponseTemplate::new(404)).await;

    let pipeline = pipeline(&server).await;
    let before = seed_snapshot(pipeline.database()).await;

    match pipeline.try_run().await.unwrap_err() {
        CycleError::ArticlePage { link, .. } => assert!(link.ends_with("/articles/down")),
        e => panic!("Expected ArticlePage, got {:?}", e),
    }
    assert_eq!(
        pipeline.database().list_all_ordered_by_published_desc().await.unwrap(),
        before
    );
}

#[tokio::test]
async fn test_slow_article_page_times_out() {
    let server = MockServer::start().await;
    let base = server.uri();
    mount_feed(
        &server,
        rss(&base, &[Entry { title: "Slow", slug: "slow", date: "Tue, 02 Jan 2024 12:00:00 +0000" }]),
    )
    .await;
    mount_article(
        &server,
        "slow",
        ResponseTemplate::new(200)
            .set_body_string(article_page(None))
            .set_delay(Duration::from_secs(3)),
    )
    .await;

    let db = Database::open(":memory:").await.unwrap();
    let mut settings = settings(&server, EntryFailurePolicy::Abort);
    settings.request_timeout = Duration::from_millis(200);
    let pipeline = Pipeline::new(db, reqwest::Client::new(), settings);

    match pipeline.try_run().await.unwrap_err() {
        CycleError::ArticlePage { source, .. } => {
            assert!(matches!(source, newsreel::feed::FetchError::Timeout(_)))
        }
        e => panic!("Expected ArticlePage timeout, got {:?}", e),
    }
}

// ============================================================================
// Per-entry isolation
// ============================================================================

#[tokio::test]
async fn test_skip_policy_drops_bad_entries_and_stores_rest() {
    let server = MockServer::start().await;
    let base = server.uri();
    mount_feed(
        &server,
        rss(
            &base,
            &[
                Entry { title: "Good", slug: "good", date: "Tue, 02 Jan 2024 12:00:00 +0000" },
                Entry { title: "Bad date", slug: "bad", date: "not-a-date" },
                Entry { title: "Dead page", slug: "dead", date: "Mon, 01 Jan 2024 12:00:00 +0000" },
            ],
        ),
    )
    .await;
    mount_article(
        &server,
        "good",
        ResponseTemplate::new(200).set_body_string(article_page(Some("https://cdn.example.com/g.jpg"))),
    )
    .await;
    mount_article(&server, "dead", ResponseTemplate::new(500)).await;

    let pipeline = pipeline_with(&server, EntryFailurePolicy::Skip).await;
    seed_snapshot(pipeline.database()).await;

    let report = pipeline.try_run().await.unwrap();
    assert_eq!(report, CycleReport { stored: 1, skipped: 2 });

    let items = pipeline.database().list_all_ordered_by_published_desc().await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].title, "Good");
}

#[tokio::test]
async fn test_skip_policy_still_fails_on_feed_errors() {
    let server = MockServer::start().await;
    mount_feed(&server, "<not valid xml".to_string()).await;

    let pipeline = pipeline_with(&server, EntryFailurePolicy::Skip).await;
    let before = seed_snapshot(pipeline.database()).await;

    assert!(matches!(
        pipeline.try_run().await.unwrap_err(),
        CycleError::Parse(ParseError::Malformed(_))
    ));
    assert_eq!(
        pipeline.database().list_all_ordered_by_published_desc().await.unwrap(),
        before
    );
}

// ============================================================================
// Concurrent cycles
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_cycles_leave_one_consistent_snapshot() {
    let server = MockServer::start().await;
    let base = server.uri();
    mount_feed(
        &server,
        rss(
            &base,
            &[
                Entry { title: "A", slug: "a", date: "Wed, 03 Jan 2024 12:00:00 +0000" },
                Entry { title: "B", slug: "b", date: "Tue, 02 Jan 2024 12:00:00 +0000" },
                Entry { title: "C", slug: "c", date: "Mon, 01 Jan 2024 12:00:00 +0000" },
            ],
        ),
    )
    .await;
    for slug in ["a", "b", "c"] {
        mount_article(
            &server,
            slug,
            ResponseTemplate::new(200)
                .set_body_string(article_page(None))
                .set_delay(Duration::from_millis(50)),
        )
        .await;
    }

    let pipeline = pipeline(&server).await;
    let other = pipeline.clone();
    let (first, second) = tokio::join!(
        tokio::spawn(async move { other.run().await }),
        pipeline.run(),
    );
    assert!(first.unwrap().is_success());
    assert!(second.is_success());

    let items = pipeline.database().list_all_ordered_by_published_desc().await.unwrap();
    let titles: Vec<_> = items.iter().map(|i| i.title.as_str()).collect();
    assert_eq!(titles, vec!["A", "B", "C"]);
    // All rows come from the same replacement
    assert!(items.iter().all(|i| i.created_at == items[0].created_at));
}
