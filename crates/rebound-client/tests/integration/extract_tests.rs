use rebound_client::SelectorExtractor;
use rebound_core::models::{ExtractionSchema, ExtractionSource, FetchRequest};
use rebound_core::traits::Extractor;
use serde_json::json;

use crate::common::{fast_fetcher, spawn_server};

#[tokio::test]
async fn html_page_is_extracted_with_selectors() {
    let server = spawn_server().await;
    let result = fast_fetcher()
        .fetch(&FetchRequest::get(server.url("/products")))
        .await
        .unwrap();

    let schema = ExtractionSchema::new("li.item")
        .with_field("id", "attr:data-id")
        .with_field("link", "a")
        .with_field("price", "span.price");
    let extraction = SelectorExtractor.extract(&result, &schema).unwrap();

    assert_eq!(extraction.source, ExtractionSource::Semistructured);
    assert_eq!(extraction.status_code, 200);
    assert_eq!(
        extraction.items,
        vec![
            json!({"id": "1", "link": "/p/1", "price": "9.99"}),
            json!({"id": "2", "link": "/p/2", "price": null}),
        ]
    );
}

#[tokio::test]
async fn json_api_is_extracted_without_selectors() {
    let server = spawn_server().await;
    let result = fast_fetcher()
        .fetch(&FetchRequest::get(server.url("/api/items")))
        .await
        .unwrap();

    // Selectors are ignored on the structured path.
    let schema = ExtractionSchema::new("li.item").with_field("name", "a");
    let extraction = SelectorExtractor.extract(&result, &schema).unwrap();

    assert_eq!(extraction.source, ExtractionSource::Structured);
    assert_eq!(
        extraction.items,
        vec![json!({"id": 1, "name": "First"}), json!({"id": 2, "name": "Second"})]
    );
}

#[tokio::test]
async fn blocked_then_recovered_page_extracts_normally() {
    let server = spawn_server().await;
    let result = fast_fetcher()
        .fetch(&FetchRequest::get(server.url("/flaky")))
        .await
        .unwrap();

    let schema = ExtractionSchema::new("li.item").with_field("name", "a");
    let extraction = SelectorExtractor.extract(&result, &schema).unwrap();
    assert_eq!(extraction.items.len(), 2);
}
