//! Blocking HTTP client for the encoder service.
//!
//! Workers run outside the orchestrator and reach the shared encoder only
//! through this client. It keeps no state beyond the base URL and two
//! `reqwest` clients: one with the long encode timeout, one with the short
//! status timeout. Failures are returned once, never retried.
//!
//! The wire types are shared with [`crate::server`].

use reqwest::blocking::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::ClientConfig;
use crate::encoder::{matrix_from_base64, EncoderStatus, VectorEncoder};
use crate::error::{Error, Result};

/// `POST /api/encoder/encode/video` body.
#[derive(Debug, Serialize, Deserialize)]
pub struct EncodeVideoRequest {
    pub video_batch: Vec<PathBuf>,
}

/// `POST /api/encoder/encode/query` body.
#[derive(Debug, Serialize, Deserialize)]
pub struct EncodeQueryRequest {
    pub query: String,
}

/// Successful encode response. `result` is a base64 matrix blob.
#[derive(Debug, Serialize, Deserialize)]
pub struct EncodeResponse {
    pub success: bool,
    pub result: String,
    pub shape: [usize; 2],
    pub dtype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

/// `GET /api/encoder/status` (and `load`/`release`) response.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub success: bool,
    pub status: EncoderStatus,
}

pub struct EncoderClient {
    base_url: String,
    encode_http: Client,
    status_http: Client,
}

impl EncoderClient {
    pub fn new(base_url: &str, config: &ClientConfig) -> Result<Self> {
        let encode_http = Client::builder()
            .timeout(Duration::from_secs(config.encode_timeout_secs))
            .build()?;
        let status_http = Client::builder()
            .timeout(Duration::from_secs(config.status_timeout_secs))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            encode_http,
            status_http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/encoder/{}", self.base_url, path)
    }

    pub fn status(&self) -> Result<EncoderStatus> {
        let resp = self.status_http.get(self.url("status")).send()?;
        Ok(read_envelope::<StatusResponse>(resp)?.status)
    }

    /// Ask the service to load its model. Loading can take minutes, so this
    /// uses the encode timeout.
    pub fn load(&self) -> Result<EncoderStatus> {
        let resp = self.encode_http.post(self.url("load")).send()?;
        Ok(read_envelope::<StatusResponse>(resp)?.status)
    }

    pub fn release(&self) -> Result<EncoderStatus> {
        let resp = self.status_http.post(self.url("release")).send()?;
        Ok(read_envelope::<StatusResponse>(resp)?.status)
    }

    /// One vector per segment, in input order.
    pub fn encode_video_segments(&self, segments: &[PathBuf]) -> Result<Vec<Vec<f32>>> {
        let body = EncodeVideoRequest {
            video_batch: segments.to_vec(),
        };
        tracing::debug!("encoding {} segments via {}", segments.len(), self.base_url);
        let resp = self
            .encode_http
            .post(self.url("encode/video"))
            .json(&body)
            .send()?;
        let parsed: EncodeResponse = read_envelope(resp)?;
        let rows = matrix_from_base64(&parsed.result)?;
        if rows.len() != segments.len() {
            return Err(Error::Blob(format!(
                "expected {} vectors, got {}",
                segments.len(),
                rows.len()
            )));
        }
        Ok(rows)
    }

    pub fn encode_string_query(&self, query: &str) -> Result<Vec<f32>> {
        let body = EncodeQueryRequest {
            query: query.to_string(),
        };
        let resp = self
            .encode_http
            .post(self.url("encode/query"))
            .json(&body)
            .send()?;
        let parsed: EncodeResponse = read_envelope(resp)?;
        matrix_from_base64(&parsed.result)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Blob("query response holds no vector".to_string()))
    }
}

impl VectorEncoder for EncoderClient {
    fn encode_video_segments(&self, segments: &[PathBuf]) -> Result<Vec<Vec<f32>>> {
        EncoderClient::encode_video_segments(self, segments)
    }

    fn encode_string_query(&self, query: &str) -> Result<Vec<f32>> {
        EncoderClient::encode_string_query(self, query)
    }
}

/// Turn a response into `T`, mapping non-2xx and `success:false` to
/// [`Error::Remote`].
fn read_envelope<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    let text = resp.text()?;
    let value: Value = serde_json::from_str(&text).map_err(|_| Error::Remote {
        status: status.as_u16(),
        message: truncate(&text, 300),
    })?;

    let success = value.get("success").and_then(Value::as_bool).unwrap_or(false);
    if !status.is_success() || !success {
        let message = value
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| truncate(&text, 300));
        return Err(Error::Remote {
            status: status.as_u16(),
            message,
        });
    }
    Ok(serde_json::from_value(value)?)
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
