//! HTTP JSON client for a remote analysis oracle

use super::types::{ChapterAnalysis, OracleError, OracleRequest, OracleResult};
use super::ChapterOracle;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Oracle gateway speaking JSON over HTTP
///
/// POSTs the analysis request to a configured endpoint and expects a
/// [`ChapterAnalysis`] body back. The service is treated as untrusted:
/// anything that does not parse is a schema failure carrying the offending
/// payload, and server-side or network trouble surfaces as a transport
/// failure for the retry layer.
#[derive(Debug, Clone)]
pub struct HttpOracle {
    client: reqwest::Client,
    endpoint: String,
    /// Model/variant identifier forwarded with every request
    model: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct Envelope<'a> {
    model: &'a str,
    #[serde(flatten)]
    request: &'a OracleRequest,
}

impl HttpOracle {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> OracleResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OracleError::Transport(format!("client construction: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            model: model.into(),
            api_key: None,
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl ChapterOracle for HttpOracle {
    #[instrument(skip(self, request), fields(chapter = request.chapter, model = %self.model))]
    async fn analyze(&self, request: &OracleRequest) -> OracleResult<ChapterAnalysis> {
        debug!(
            mentions = request.characters.len(),
            text_len = request.text.len(),
            "Requesting chapter analysis"
        );

        let mut builder = self.client.post(&self.endpoint).json(&Envelope {
            model: &self.model,
            request,
        });
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| OracleError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| OracleError::Transport(format!("reading body: {e}")))?;

        if status.is_server_error() || status.as_u16() == 429 {
            warn!(%status, "Oracle transient failure");
            return Err(OracleError::Transport(format!("HTTP {status}")));
        }
        if !status.is_success() {
            // Client-side rejections are not transient; surface the body.
            return Err(OracleError::Schema {
                reason: format!("HTTP {status}"),
                payload: body,
            });
        }

        let analysis: ChapterAnalysis = serde_json::from_str(&body).map_err(|e| {
            OracleError::Schema {
                reason: format!("response is not a valid chapter analysis: {e}"),
                payload: body.clone(),
            }
        })?;

        debug!(verdicts = analysis.verdicts.len(), "Received chapter analysis");
        Ok(analysis)
    }
}
