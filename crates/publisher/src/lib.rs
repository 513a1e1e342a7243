//! ContentWorks platform publisher adapter.
//!
//! Implements [`pipeline::PlatformPublisher`] for destinations reachable over
//! a small HTTP contract:
//!
//! | Call | Request | Success body |
//! |------|---------|--------------|
//! | upload | `POST {endpoint}/assets`, raw bytes, `Content-Type` = media type | `{"address": "..."}` |
//! | post | `POST {endpoint}/posts`, JSON, `Idempotency-Key` header | `{"id": "..."}` |
//! | lookup | `GET {endpoint}/posts?idempotency_key=...` | `{"id": "..."}` or 404 |
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** HTTP transport and status mapping live here. A 429 is
//! the only response reported as [`PublishError::RateLimited`]; the publish
//! coordinator owns the retry.

use std::time::Duration;

use async_trait::async_trait;
use pipeline::{
    AssetAddress, AssetUpload, DestinationId, ItemId, PlatformPublisher, PostRequest,
    PublishError, RemotePostId,
};
use reqwest::header::{HeaderMap, CONTENT_TYPE, RETRY_AFTER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

const IDEMPOTENCY_KEY: &str = "Idempotency-Key";
const ASSET_NAME: &str = "X-Asset-Name";
const ASSET_FINGERPRINT: &str = "X-Asset-Fingerprint";

/// Longest error body kept in a [`PublishError::Rejected`] message.
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Serialize)]
struct PostBody<'a> {
    item: String,
    caption: Option<&'a str>,
    assets: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    address: String,
}

#[derive(Debug, Deserialize)]
struct PostResponse {
    id: String,
}

/// Publisher for one HTTP destination.
pub struct HttpPublisher {
    destination: DestinationId,
    endpoint: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpPublisher {
    pub fn new(
        destination: DestinationId,
        endpoint: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, PublishError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("contentworks/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(transport)?;
        Ok(Self {
            destination,
            endpoint: endpoint.into().trim_end_matches('/').to_owned(),
            token,
            client,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}/{path}", self.endpoint));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl PlatformPublisher for HttpPublisher {
    fn destination(&self) -> &DestinationId {
        &self.destination
    }

    async fn upload(&self, upload: &AssetUpload) -> Result<AssetAddress, PublishError> {
        let response = self
            .request(reqwest::Method::POST, "assets")
            .header(CONTENT_TYPE, upload.asset.media_type.as_str())
            .header(ASSET_NAME, upload.asset.name.as_str())
            .header(ASSET_FINGERPRINT, upload.asset.fingerprint.as_str())
            .body(upload.bytes.clone())
            .send()
            .await
            .map_err(transport)?;
        let body: UploadResponse = parse(check(response).await?).await?;
        debug!(destination = %self.destination, address = %body.address, "asset uploaded");
        AssetAddress::new(body.address).ok_or_else(|| malformed("empty asset address"))
    }

    async fn post(&self, request: &PostRequest) -> Result<RemotePostId, PublishError> {
        let body = PostBody {
            item: request.item.to_string(),
            caption: request.caption.as_deref(),
            assets: request.assets.iter().map(|a| a.as_str()).collect(),
        };
        let response = self
            .request(reqwest::Method::POST, "posts")
            .header(IDEMPOTENCY_KEY, request.idempotency_key.as_str())
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        let body: PostResponse = parse(check(response).await?).await?;
        RemotePostId::new(body.id).ok_or_else(|| malformed("empty post id"))
    }

    async fn find_existing_post(&self, item: ItemId) -> Result<Option<RemotePostId>, PublishError> {
        let response = self
            .request(reqwest::Method::GET, "posts")
            .query(&[("idempotency_key", item.to_string())])
            .send()
            .await
            .map_err(transport)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: PostResponse = parse(check(response).await?).await?;
        Ok(RemotePostId::new(body.id))
    }
}

/// Maps a non-success response onto [`PublishError`].
async fn check(response: reqwest::Response) -> Result<reqwest::Response, PublishError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = retry_after(response.headers());
    let mut message = response.text().await.unwrap_or_default();
    if message.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
    }
    Err(classify_status(status, retry_after, message))
}

/// 429 is a rate limit; every other failure status is a rejection.
pub fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    message: String,
) -> PublishError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        PublishError::RateLimited { retry_after }
    } else {
        PublishError::Rejected {
            status: Some(status.as_u16()),
            message,
        }
    }
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

async fn parse<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, PublishError> {
    let bytes = response.bytes().await.map_err(transport)?;
    serde_json::from_slice(&bytes).map_err(|e| malformed(&e.to_string()))
}

fn transport(e: reqwest::Error) -> PublishError {
    PublishError::Transport {
        message: e.to_string(),
    }
}

fn malformed(message: &str) -> PublishError {
    PublishError::Transport {
        message: format!("unreadable platform response: {message}"),
    }
}
