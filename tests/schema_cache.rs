mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::FakeHost;
use pagepilot::PageHost;
use pagepilot::dom::SchemaExtractor;
use pagepilot::surface::SurfaceAdapter;

fn extractor(host: std::sync::Arc<FakeHost>, ttl: Duration) -> SchemaExtractor {
    let surface = SurfaceAdapter::new(host, Duration::from_millis(100), Duration::from_millis(20));
    SchemaExtractor::new(surface, ttl)
}

#[tokio::test]
async fn schema_is_cached_per_url() {
    let host = FakeHost::new("https://www.example.com/shop");
    let extractor = extractor(host.clone(), Duration::from_secs(120));

    let first = extractor.extract().await.unwrap();
    assert_eq!(first.title, "Example Shop");
    assert_eq!(first.buttons[0].selector, "#add-to-cart");
    let second = extractor.extract().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(host.scripts.load(Ordering::SeqCst), 1);

    extractor.refresh().await.unwrap();
    assert_eq!(host.scripts.load(Ordering::SeqCst), 2);

    host.load_url("https://www.wikipedia.org").await.unwrap();
    let other = extractor.extract().await.unwrap();
    assert_eq!(other.url, "https://www.wikipedia.org");
    assert_eq!(host.scripts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn expired_entries_are_extracted_again() {
    let host = FakeHost::new("https://www.example.com/");
    let extractor = extractor(host.clone(), Duration::from_millis(30));

    extractor.extract().await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    extractor.extract().await.unwrap();
    assert_eq!(host.scripts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn detached_surface_has_no_schema_and_a_fallback_state() {
    let host = FakeHost::new("https://www.example.com/");
    host.set_attached(false);
    let extractor = extractor(host.clone(), Duration::from_secs(120));

    assert!(extractor.extract().await.is_none());
    let state = extractor.page_state().await;
    assert_eq!(state.url, "https://www.example.com/");
    assert!(state.title.is_empty());
    assert_eq!(host.scripts.load(Ordering::SeqCst), 0);
}
