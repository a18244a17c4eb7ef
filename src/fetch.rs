//! HTTP fetch client used by the API metadata fetcher.
//!
//! The fetcher only needs two operations: read a URL into memory, and download a
//! URL onto a path with an optional time condition. [`FetchClient`] captures that
//! contract so tests can drive the fetcher with an in-memory double; [`HttpFetcher`]
//! is the reqwest-backed implementation used by the binary.
//!
//! Both operations fail on non-2xx responses. A `304 Not Modified` answer to a
//! conditional download leaves the target untouched and counts as success.

use crate::error::{BruError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::header::IF_MODIFIED_SINCE;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWriteExt;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Body of an in-memory fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchOutput {
    pub success: bool,
    pub body: Vec<u8>,
}

impl FetchOutput {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            success: true,
            body: body.into(),
        }
    }

    pub fn failed() -> Self {
        Self::default()
    }

    /// Successful and non-blank.
    pub fn is_present(&self) -> bool {
        self.success && self.body.iter().any(|b| !b.is_ascii_whitespace())
    }
}

#[async_trait]
pub trait FetchClient: Send + Sync {
    /// Fetch `url` into memory. Transport failures and non-2xx responses are
    /// reported through `success`, never as an error.
    async fn get(&self, url: &str, since: Option<SystemTime>) -> FetchOutput;

    /// Download `url` onto `to`. With `since`, the server may answer 304 and `to`
    /// is left as it was.
    async fn download(&self, url: &str, to: &Path, since: Option<SystemTime>) -> Result<()>;
}

/// reqwest-backed [`FetchClient`].
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(format!("brulary/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client })
    }

    fn request(&self, url: &str, since: Option<SystemTime>) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        match since {
            Some(time) => request.header(IF_MODIFIED_SINCE, http_date(time)),
            None => request,
        }
    }
}

#[async_trait]
impl FetchClient for HttpFetcher {
    async fn get(&self, url: &str, since: Option<SystemTime>) -> FetchOutput {
        let response = match self.request(url, since).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("GET {} failed: {}", url, e);
                return FetchOutput::failed();
            }
        };

        if !response.status().is_success() {
            tracing::debug!("GET {} returned {}", url, response.status());
            return FetchOutput::failed();
        }

        match response.bytes().await {
            Ok(body) => FetchOutput::ok(body.to_vec()),
            Err(e) => {
                tracing::debug!("GET {} body failed: {}", url, e);
                FetchOutput::failed()
            }
        }
    }

    async fn download(&self, url: &str, to: &Path, since: Option<SystemTime>) -> Result<()> {
        let download_error = |reason: String| BruError::Download {
            url: url.to_string(),
            reason,
        };

        let mut response = self
            .request(url, since)
            .send()
            .await
            .map_err(|e| download_error(e.to_string()))?;

        if response.status() == StatusCode::NOT_MODIFIED && since.is_some() {
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(download_error(format!("HTTP {}", response.status())));
        }

        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(to).await?;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| download_error(e.to_string()))?
        {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        Ok(())
    }
}

/// RFC 7231 IMF-fixdate, as sent in `If-Modified-Since`.
pub fn http_date(time: SystemTime) -> String {
    let time: DateTime<Utc> = time.into();
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_date_format() {
        let time = SystemTime::UNIX_EPOCH + Duration::from_secs(784_111_777);
        assert_eq!(http_date(time), "Sun, 06 Nov 1994 08:49:37 GMT");
    }

    #[test]
    fn test_fetch_output_presence() {
        assert!(FetchOutput::ok("cask \"foo\" do\nend").is_present());
        assert!(!FetchOutput::ok("  \n").is_present());
        assert!(!FetchOutput::failed().is_present());
    }
}
