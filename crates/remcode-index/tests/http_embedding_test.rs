//! Embedding over HTTP against a mock service.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use remcode_index::embeddings::{EmbeddingConfig, HttpEmbeddingProvider};
use remcode_index::retry::RetryConfig;
use remcode_index::{EmbeddingError, EmbeddingGenerator, ModelSpec, OutputShape};

fn fast_retry() -> EmbeddingConfig {
    EmbeddingConfig {
        batch_size: 8,
        retry: RetryConfig::new(3, Duration::from_millis(5), Duration::from_millis(20)),
        max_concurrent_requests: 2,
    }
}

fn provider(server: &MockServer, api_key: Option<&str>) -> Arc<HttpEmbeddingProvider> {
    Arc::new(
        HttpEmbeddingProvider::new(
            format!("{}/v1/embeddings", server.uri()),
            api_key.map(String::from),
            Duration::from_secs(5),
        )
        .unwrap(),
    )
}

#[tokio::test]
async fn test_rate_limit_is_retried_and_token_output_is_pooled() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .and(body_partial_json(json!({ "model": "code-model" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([[1.0, 0.0, 2.0], [3.0, 2.0, 0.0]])))
        .expect(1)
        .mount(&server)
        .await;

    let model = ModelSpec {
        id: "code-model".to_string(),
        dimension: 3,
        output: OutputShape::TokenLevel,
    };
    let generator = EmbeddingGenerator::new(provider(&server, None), model, None, fast_retry()).unwrap();

    let vector = generator.embed_text("fn main() {}").await.unwrap();
    assert_eq!(vector, vec![2.0, 1.0, 1.0]);
}

#[tokio::test]
async fn test_openai_shape_with_bearer_auth() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                { "embedding": [0.0, 1.0], "index": 1 },
                { "embedding": [1.0, 0.0], "index": 0 }
            ]
        })))
        .mount(&server)
        .await;

    let generator = EmbeddingGenerator::new(
        provider(&server, Some("secret")),
        ModelSpec::pooled("pooled", 2),
        None,
        fast_retry(),
    )
    .unwrap();

    let chunks = remcode_index::CodeChunker::default().chunk(
        "fn one() {}\n\nfn two() {}\n",
        &remcode_index::FileMeta::new("src/lib.rs"),
    );
    assert_eq!(chunks.len(), 2);
    let outcome = generator.embed(chunks, generator.default_selection()).await.unwrap();
    assert!(outcome.failed.is_empty());
    assert_eq!(outcome.embedded[0].embedding, vec![1.0, 0.0]);
    assert_eq!(outcome.embedded[1].embedding, vec![0.0, 1.0]);
}

#[tokio::test]
async fn test_rejected_request_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("unknown model"))
        .expect(1)
        .mount(&server)
        .await;

    let generator = EmbeddingGenerator::new(
        provider(&server, None),
        ModelSpec::pooled("missing", 4),
        None,
        fast_retry(),
    )
    .unwrap();

    let err = generator.embed_text("query").await.unwrap_err();
    assert!(matches!(err, EmbeddingError::Permanent(_)));
}

#[tokio::test]
async fn test_server_errors_fall_back_to_second_model() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "model": "primary" })))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "model": "fallback" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([0.6, 0.8])))
        .expect(1)
        .mount(&server)
        .await;

    let generator = EmbeddingGenerator::new(
        provider(&server, None),
        ModelSpec::pooled("primary", 2),
        Some(ModelSpec::pooled("fallback", 2)),
        fast_retry(),
    )
    .unwrap();

    assert_eq!(generator.embed_text("query").await.unwrap(), vec![0.6, 0.8]);
}
