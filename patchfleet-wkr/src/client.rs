//! Blocking HTTP client for the aggregator daemon.

use std::collections::HashSet;
use std::time::Duration;

use patchfleet_common::{Report, Ticket};
use serde::de::DeserializeOwned;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

/// Ticket lists with full report histories can be large.
const MAX_BODY_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: ureq::Error,
    },

    #[error("{url} answered {status}: {message}")]
    Rejected {
        url: String,
        status: u16,
        message: String,
    },

    #[error("unexpected response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// What the worker needs from the aggregator.
pub trait Aggregator {
    fn tickets(&self, status: &str, limit: usize) -> Result<Vec<Ticket>, ClientError>;
    fn ticket(&self, id: u64) -> Result<Ticket, ClientError>;
    fn trusted_authors(&self) -> Result<HashSet<String>, ClientError>;
    fn latest_base(&self) -> Result<Option<String>, ClientError>;
    fn post_report(&self, id: u64, report: &Report, log: Option<&str>) -> Result<(), ClientError>;
}

pub struct DaemonClient {
    agent: ureq::Agent,
    base_url: String,
}

impl DaemonClient {
    pub fn new(base_url: &str) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(60)))
            .http_status_as_error(false)
            .build()
            .into();
        Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T, ClientError> {
        let url = self.url(path);
        debug!("GET {}", url);
        let mut request = self.agent.get(&url);
        for (key, value) in query {
            request = request.query(key, value);
        }
        let response = request.call().map_err(|source| ClientError::Transport {
            url: url.clone(),
            source,
        })?;
        let body = read_body(&url, response)?;
        serde_json::from_str(&body).map_err(|source| ClientError::Decode { url, source })
    }
}

fn read_body(url: &str, mut response: ureq::http::Response<ureq::Body>) -> Result<String, ClientError> {
    let status = response.status();
    let body = response
        .body_mut()
        .with_config()
        .limit(MAX_BODY_BYTES)
        .read_to_string()
        .map_err(|source| ClientError::Transport {
            url: url.to_string(),
            source,
        })?;
    if !status.is_success() {
        return Err(ClientError::Rejected {
            url: url.to_string(),
            status: status.as_u16(),
            message: error_message(&body),
        });
    }
    Ok(body)
}

/// Pull `error` out of a JSON error body, or fall back to the raw text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

impl Aggregator for DaemonClient {
    fn tickets(&self, status: &str, limit: usize) -> Result<Vec<Ticket>, ClientError> {
        self.get_json(
            "/ticket/",
            &[("status", status.to_string()), ("limit", limit.to_string())],
        )
    }

    fn ticket(&self, id: u64) -> Result<Ticket, ClientError> {
        self.get_json(&format!("/ticket/{id}"), &[])
    }

    fn trusted_authors(&self) -> Result<HashSet<String>, ClientError> {
        let authors: Vec<String> = self.get_json("/trusted", &[])?;
        Ok(authors.into_iter().collect())
    }

    fn latest_base(&self) -> Result<Option<String>, ClientError> {
        let body: serde_json::Value = self.get_json("/base/latest", &[])?;
        Ok(body.get("base").and_then(|b| b.as_str()).map(str::to_string))
    }

    fn post_report(&self, id: u64, report: &Report, log: Option<&str>) -> Result<(), ClientError> {
        let url = self.url(&format!("/report/{id}"));
        let payload = json!({ "report": report, "log": log }).to_string();
        debug!("POST {} ({} bytes)", url, payload.len());
        let response = self
            .agent
            .post(&url)
            .header("Content-Type", "application/json")
            .send(payload)
            .map_err(|source| ClientError::Transport {
                url: url.clone(),
                source,
            })?;
        read_body(&url, response).map(|_| ())
    }
}
