use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::lookup::model::{LookupItem, LookupResponse};

pub mod model;

/// Error code the API uses for "daily call limit exceeded for this key".
pub const QUOTA_EXCEEDED_CODE: i64 = 10;

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("daily quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("api error {code}: {message}")]
    Api { code: i64, message: String },
    #[error("http status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for LookupError {
    fn from(err: reqwest::Error) -> Self {
        LookupError::Transport(err.to_string())
    }
}

#[async_trait]
pub trait LookupService: Send + Sync {
    /// One call per identifier. `Ok(None)` means the API knows no such item.
    async fn lookup(&self, api_key: &str, isbn: &str) -> Result<Option<LookupItem>, LookupError>;
}

#[derive(Clone)]
pub struct LookupClient {
    http: Client,
    base_url: Url,
}

impl fmt::Debug for LookupClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LookupClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl LookupClient {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url).context("invalid lookup base URL")?;
        let http = Client::builder()
            .user_agent("catalog-enricher/0.1")
            .timeout(timeout)
            .build()
            .context("failed to build lookup HTTP client")?;
        Ok(Self { http, base_url })
    }

    pub fn build_request(&self, api_key: &str, isbn: &str) -> anyhow::Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join("ItemLookUp.aspx")
            .context("invalid lookup base URL")?;
        self.http
            .get(endpoint)
            .query(&[
                ("ttbkey", api_key),
                ("itemIdType", "ISBN13"),
                ("ItemId", isbn),
                ("output", "js"),
                ("Version", "20131101"),
                ("OptResult", "authors,Toc"),
            ])
            .build()
            .context("failed to build lookup request")
    }
}

#[async_trait]
impl LookupService for LookupClient {
    async fn lookup(&self, api_key: &str, isbn: &str) -> Result<Option<LookupItem>, LookupError> {
        let request = self
            .build_request(api_key, isbn)
            .map_err(|e| LookupError::Transport(e.to_string()))?;
        let res = self.http.execute(request).await?;
        let status = res.status();
        let body = res.text().await?;
        debug!(isbn, %status, bytes = body.len(), "lookup response");
        parse_response(status, &body)
    }
}

/// Classify a raw response. Kept free of I/O so every branch is testable.
pub fn parse_response(status: StatusCode, body: &str) -> Result<Option<LookupItem>, LookupError> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        warn!("rate limited by lookup API");
        return Err(LookupError::RateLimited(body.chars().take(200).collect()));
    }
    if status.is_server_error() {
        return Err(LookupError::Transport(format!("server error {}", status)));
    }
    if !status.is_success() {
        return Err(LookupError::Status {
            status: status.as_u16(),
            body: body.chars().take(200).collect(),
        });
    }
    if body.trim().is_empty() {
        return Ok(None);
    }

    // The API has been seen to emit a trailing `;` after the JSON object.
    let trimmed = body.trim().trim_end_matches(';');
    let payload: LookupResponse =
        serde_json::from_str(trimmed).map_err(|e| LookupError::Decode(e.to_string()))?;

    if let Some(code) = payload.error_code {
        let message = payload.error_message.unwrap_or_default();
        if code == QUOTA_EXCEEDED_CODE {
            return Err(LookupError::QuotaExceeded(message));
        }
        return Err(LookupError::Api { code, message });
    }

    Ok(payload.item.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_request_sets_query() {
        let client = LookupClient::new("https://lookup.test/ttb/api/", Duration::from_secs(5)).unwrap();
        let request = client.build_request("key-1", "9780000000002").unwrap();
        assert_eq!(request.method(), reqwest::Method::GET);
        assert_eq!(request.url().path(), "/ttb/api/ItemLookUp.aspx");
        let query: Vec<(String, String)> = request
            .url()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(query.contains(&("ttbkey".into(), "key-1".into())));
        assert!(query.contains(&("ItemId".into(), "9780000000002".into())));
        assert!(query.contains(&("output".into(), "js".into())));
    }

    #[test]
    fn parses_item() {
        let body = r#"{"item":[{"title":"Book","author":"A (Author)","priceStandard":15000,
            "subInfo":{"subTitle":"Sub","itemPage":320,"authors":[{"authorName":"A","authorTypeDesc":"Author"}]}}]};"#;
        let item = parse_response(StatusCode::OK, body).unwrap().unwrap();
        assert_eq!(item.title.as_deref(), Some("Book"));
        assert_eq!(item.price_standard, Some(15000));
        let sub = item.sub_info.unwrap();
        assert_eq!(sub.item_page, Some(320));
        assert_eq!(sub.authors.len(), 1);
    }

    #[test]
    fn empty_item_list_is_no_match() {
        assert!(parse_response(StatusCode::OK, r#"{"item":[]}"#).unwrap().is_none());
        assert!(parse_response(StatusCode::OK, "  ").unwrap().is_none());
    }

    #[test]
    fn classifies_errors() {
        let quota = parse_response(
            StatusCode::OK,
            r#"{"errorCode":10,"errorMessage":"limit exceeded"}"#,
        );
        assert!(matches!(quota, Err(LookupError::QuotaExceeded(_))));

        let api = parse_response(StatusCode::OK, r#"{"errorCode":3,"errorMessage":"bad id"}"#);
        assert!(matches!(api, Err(LookupError::Api { code: 3, .. })));

        let limited = parse_response(StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(matches!(limited, Err(LookupError::RateLimited(_))));

        let server = parse_response(StatusCode::BAD_GATEWAY, "");
        assert!(matches!(server, Err(LookupError::Transport(_))));

        let client = parse_response(StatusCode::BAD_REQUEST, "nope");
        assert!(matches!(client, Err(LookupError::Status { status: 400, .. })));

        let garbage = parse_response(StatusCode::OK, "<html>");
        assert!(matches!(garbage, Err(LookupError::Decode(_))));
    }
}
