//! Blob storage provider for image and file messages.
//!
//! The core never keeps raw bytes: a payload goes to the provider, the log
//! stores the returned URL with the file name and size.

use async_trait::async_trait;
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::clock::Millis;
use crate::error::{ChatError, ChatResult};

pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `bytes` under `name` and returns a public URL.
    async fn put(&self, name: &str, bytes: Vec<u8>) -> ChatResult<String>;
}

/// Rejects oversize payloads before anything is written.
pub fn check_size(len: usize) -> ChatResult<()> {
    if len > MAX_UPLOAD_BYTES {
        return Err(ChatError::Oversize { size: len, limit: MAX_UPLOAD_BYTES });
    }
    Ok(())
}

/// `uploads/<millis>-<random>-<name>` with anything outside `[A-Za-z0-9.-]`
/// replaced by `_`.
pub fn object_name(now: Millis, original: &str) -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    let clean: String = original
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect();
    let clean = if clean.is_empty() { "file".to_owned() } else { clean };
    format!("uploads/{now}-{suffix}-{clean}")
}

#[derive(Deserialize)]
struct PutResponse {
    url: String,
}

/// Talks to an HTTP blob service: `PUT {endpoint}/{name}` with a bearer
/// token, answered by `{"url": ...}`.
#[derive(Clone)]
pub struct HttpBlobStore {
    client: reqwest::Client,
    endpoint: Option<String>,
    token: Option<String>,
}

impl HttpBlobStore {
    pub fn new(endpoint: Option<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.map(|e| e.trim_end_matches('/').to_owned()),
            token,
        }
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn put(&self, name: &str, bytes: Vec<u8>) -> ChatResult<String> {
        check_size(bytes.len())?;
        let Some(endpoint) = &self.endpoint else {
            return Err(ChatError::StorageUnavailable("no blob endpoint configured".into()));
        };

        let size = bytes.len();
        let mut request = self.client.put(format!("{endpoint}/{name}")).body(bytes);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;

        let status = response.status();
        if status == reqwest::StatusCode::PAYLOAD_TOO_LARGE {
            return Err(ChatError::Oversize { size, limit: MAX_UPLOAD_BYTES });
        }
        if !status.is_success() {
            warn!(%status, name, "blob upload rejected");
            return Err(ChatError::StorageUnavailable(format!("blob provider answered {status}")));
        }

        let PutResponse { url } = response.json().await?;
        debug!(name, size, "blob stored");
        Ok(url)
    }
}
