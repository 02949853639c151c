use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub mod generator;

pub use generator::{build_embedding_text, EmbeddingGenerator, EmbeddingReport};

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("embedding service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed embedding response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for EmbeddingError {
    fn from(err: reqwest::Error) -> Self {
        EmbeddingError::Transport(err.to_string())
    }
}

#[async_trait]
pub trait EmbeddingService: Send + Sync {
    /// Vector for `text`. `Ok(None)` when the service answered without one.
    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>, EmbeddingError>;
}

/// Client for an OpenAI-compatible `/embeddings` endpoint.
#[derive(Clone)]
pub struct EmbeddingClient {
    http: Client,
    base_url: Url,
    api_key: String,
    model: String,
    dimensions: Option<usize>,
}

impl fmt::Debug for EmbeddingClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingClient")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    embedding: Vec<f32>,
}

impl EmbeddingClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        model: &str,
        dimensions: Option<usize>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        // `Url::join` replaces the last segment unless the base ends in '/'.
        let base_url = if base_url.ends_with('/') {
            Url::parse(base_url)
        } else {
            Url::parse(&format!("{base_url}/"))
        }
        .context("invalid embedding base URL")?;
        let http = Client::builder()
            .user_agent("catalog-enricher/0.1")
            .timeout(timeout)
            .build()
            .context("failed to build embedding HTTP client")?;
        Ok(Self {
            http,
            base_url,
            api_key: api_key.to_string(),
            model: model.to_string(),
            dimensions,
        })
    }

    pub fn build_request(&self, text: &str) -> anyhow::Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join("embeddings")
            .context("invalid embedding base URL")?;
        self.http
            .post(endpoint)
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest {
                model: &self.model,
                input: text,
                dimensions: self.dimensions,
            })
            .build()
            .context("failed to build embedding request")
    }
}

#[async_trait]
impl EmbeddingService for EmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>, EmbeddingError> {
        let request = self
            .build_request(text)
            .map_err(|e| EmbeddingError::Transport(e.to_string()))?;
        let res = self.http.execute(request).await?;
        let status = res.status();
        let body = res.text().await?;
        debug!(%status, bytes = body.len(), "embedding response");
        parse_embedding_response(status, &body)
    }
}

pub fn parse_embedding_response(
    status: StatusCode,
    body: &str,
) -> Result<Option<Vec<f32>>, EmbeddingError> {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Err(EmbeddingError::Transport(format!("embedding service returned {status}")));
    }
    if !status.is_success() {
        return Err(EmbeddingError::Status {
            status: status.as_u16(),
            body: body.chars().take(200).collect(),
        });
    }
    if body.trim().is_empty() {
        return Ok(None);
    }
    let payload: EmbeddingResponse =
        serde_json::from_str(body).map_err(|e| EmbeddingError::Decode(e.to_string()))?;
    Ok(payload
        .data
        .into_iter()
        .next()
        .map(|d| d.embedding)
        .filter(|v| !v.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_targets_embeddings_endpoint() {
        let client = EmbeddingClient::new(
            "https://embed.test/v1",
            "sk-test",
            "text-embedding-3-small",
            Some(256),
            Duration::from_secs(5),
        )
        .unwrap();
        let request = client.build_request("Title: Book").unwrap();
        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(request.url().path(), "/v1/embeddings");
        assert_eq!(
            request.headers()["authorization"].to_str().unwrap(),
            "Bearer sk-test"
        );
        let body: serde_json::Value =
            serde_json::from_slice(request.body().unwrap().as_bytes().unwrap()).unwrap();
        assert_eq!(body["model"], "text-embedding-3-small");
        assert_eq!(body["input"], "Title: Book");
        assert_eq!(body["dimensions"], 256);
    }

    #[test]
    fn parses_first_vector() {
        let body = r#"{"object":"list","data":[{"index":0,"embedding":[0.1,0.2,0.3]}]}"#;
        let vector = parse_embedding_response(StatusCode::OK, body).unwrap().unwrap();
        assert_eq!(vector.len(), 3);
    }

    #[test]
    fn empty_answers_are_none() {
        assert!(parse_embedding_response(StatusCode::OK, "").unwrap().is_none());
        assert!(parse_embedding_response(StatusCode::OK, r#"{"data":[]}"#)
            .unwrap()
            .is_none());
        assert!(parse_embedding_response(StatusCode::OK, r#"{"data":[{"embedding":[]}]}"#)
            .unwrap()
            .is_none());
    }

    #[test]
    fn classifies_errors() {
        assert!(matches!(
            parse_embedding_response(StatusCode::SERVICE_UNAVAILABLE, ""),
            Err(EmbeddingError::Transport(_))
        ));
        assert!(matches!(
            parse_embedding_response(StatusCode::UNAUTHORIZED, "bad key"),
            Err(EmbeddingError::Status { status: 401, .. })
        ));
        assert!(matches!(
            parse_embedding_response(StatusCode::OK, "not json"),
            Err(EmbeddingError::Decode(_))
        ));
    }
}
