//! REST bulk-append client.
//!
//! ```text
//! POST {base}/spreadsheets/{destination}/values/{range}:append?valueInputOption=RAW
//! Authorization: Bearer <token>
//! {"values": [[...], [...]]}
//! ```

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::{AppendRequest, AppendSink, Row, SinkError};

pub const DEFAULT_BASE_URL: &str = "https://sheets.googleapis.com/v4";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Error bodies are truncated to this many bytes in `SinkError::Status`
const MAX_ERROR_BODY: usize = 512;

#[derive(Serialize)]
struct AppendBody<'a> {
    values: &'a [Row],
}

pub struct HttpAppendSink {
    client: Client,
    base_url: Url,
    bearer_token: String,
    name: String,
}

impl HttpAppendSink {
    /// Sink against the public API.
    pub fn new(bearer_token: impl Into<String>) -> Result<Self, SinkError> {
        Self::with_base_url(DEFAULT_BASE_URL, bearer_token)
    }

    /// Sink against another base URL (proxies, test servers).
    pub fn with_base_url(base_url: &str, bearer_token: impl Into<String>) -> Result<Self, SinkError> {
        let base_url = Url::parse(base_url).map_err(|e| SinkError::Other(format!("invalid base URL: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(SinkError::Other(format!("invalid base URL: {base_url}")));
        }
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| SinkError::Other(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            bearer_token: bearer_token.into(),
            name: "google_sheets".to_string(),
        })
    }

    /// Use a preconfigured client (custom timeouts, proxies).
    #[must_use]
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// Override the name used for the circuit breaker and metrics.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn append_url(&self, request: &AppendRequest<'_>) -> Result<Url, SinkError> {
        let append_segment = format!("{}:append", request.range);
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| SinkError::Other("base URL cannot hold a path".into()))?
            .pop_if_empty()
            .extend([
                "spreadsheets",
                request.destination,
                "values",
                append_segment.as_str(),
            ]);
        url.query_pairs_mut()
            .append_pair("valueInputOption", request.value_input.as_str());
        Ok(url)
    }
}

#[async_trait]
impl AppendSink for HttpAppendSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn append(&self, request: &AppendRequest<'_>) -> Result<(), SinkError> {
        let url = self.append_url(request)?;
        debug!(destination = request.destination, range = request.range, rows = request.rows.len(), "Appending rows");

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.bearer_token)
            .json(&AppendBody { values: request.rows })
            .send()
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        warn!(destination = request.destination, status = status.as_u16(), "Append rejected");
        Err(SinkError::Status {
            status: status.as_u16(),
            body,
        })
    }
}
