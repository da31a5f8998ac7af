use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use sonic_common::{now_ms, ControlError, ModelTraffic, ServerSample, ServerTarget};

use super::{MetricsSource, ServerControl};

/// HTTP client for Triton's repository, health, and metrics endpoints.
#[derive(Debug, Clone)]
pub struct TritonClient {
    http: reqwest::Client,
    http_port: u16,
    metrics_port: u16,
    request_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct RepositoryEntry {
    name: String,
    #[serde(default)]
    state: String,
}

impl TritonClient {
    pub fn new(http_port: u16, metrics_port: u16, request_timeout: Duration) -> Result<Self, ControlError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ControlError::Backend(e.to_string()))?;
        Ok(Self {
            http,
            http_port,
            metrics_port,
            request_timeout,
        })
    }

    fn api_url(&self, server: &ServerTarget, path: &str) -> String {
        format!("http://{}:{}{}", server.address, self.http_port, path)
    }

    fn metrics_url(&self, server: &ServerTarget) -> String {
        format!("http://{}:{}/metrics", server.address, self.metrics_port)
    }

    async fn post_repository(&self, server: &ServerTarget, model_name: &str, verb: &str) -> Result<(), ControlError> {
        let url = self.api_url(server, &format!("/v2/repository/models/{model_name}/{verb}"));
        let resp = self.http.post(&url).send().await.map_err(|e| self.transport(e))?;
        check_status(resp).await.map(|_| ())
    }

    fn transport(&self, e: reqwest::Error) -> ControlError {
        if e.is_timeout() {
            ControlError::Timeout(self.request_timeout.as_millis() as u64)
        } else {
            ControlError::Transport(e.to_string())
        }
    }

    async fn is_ready(&self, server: &ServerTarget) -> bool {
        match self.http.get(self.api_url(server, "/v2/health/ready")).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(server_id = %server.server_id, error = %e, "readiness check failed");
                false
            }
        }
    }
}


async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ControlError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(ControlError::NotFound(message));
    }
    Err(ControlError::Rejected {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl ServerControl for TritonClient {
    async fn load_model(&self, server: &ServerTarget, model_name: &str) -> Result<(), ControlError> {
        self.post_repository(server, model_name, "load").await
    }

    async fn unload_model(&self, server: &ServerTarget, model_name: &str) -> Result<(), ControlError> {
        self.post_repository(server, model_name, "unload").await
    }

    async fn ready_models(&self, server: &ServerTarget) -> Result<BTreeSet<String>, ControlError> {
        let resp = self
            .http
            .post(self.api_url(server, "/v2/repository/index"))
            .json(&serde_json::json!({ "ready": true }))
            .send()
            .await
            .map_err(|e| self.transport(e))?;
        let entries: Vec<RepositoryEntry> = check_status(resp)
            .await?
            .json()
            .await
            .map_err(|e| ControlError::Backend(format!("repository index: {e}")))?;
        Ok(entries
            .into_iter()
            .filter(|e| e.state.is_empty() || e.state == "READY")
            .map(|e| e.name)
            .collect())
    }
}

#[async_trait]
impl MetricsSource for TritonClient {
    async fn sample(&self, server: &ServerTarget) -> Result<ServerSample, ControlError> {
        let resp = self.http.get(self.metrics_url(server)).send().await.map_err(|e| self.transport(e))?;
        let text = check_status(resp)
            .await?
            .text()
            .await
            .map_err(|e| ControlError::Transport(e.to_string()))?;

        let mut sample = parse_metrics(&text);
        sample.ready = self.is_ready(server).await;
        sample.observed_at_ms = now_ms();
        Ok(sample)
    }
}

/// Parse Triton's Prometheus exposition into a sample. GPU gauges are summed
/// (memory) or averaged (utilization) across `gpu_uuid`; per-model counters
/// are summed across versions.
pub fn parse_metrics(text: &str) -> ServerSample {
    let mut total: BTreeMap<String, f64> = BTreeMap::new();
    let mut used: BTreeMap<String, f64> = BTreeMap::new();
    let mut util: BTreeMap<String, f64> = BTreeMap::new();
    let mut traffic: BTreeMap<String, ModelTraffic> = BTreeMap::new();

    for line in text.lines() {
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        let Some((name, labels, value)) = parse_line(line) else {
            tracing::debug!(line, "skipping unparsable metric line");
            continue;
        };
        let gpu = || labels.get("gpu_uuid").cloned().unwrap_or_default();
        match name {
            "nv_gpu_memory_total_bytes" => {
                total.insert(gpu(), value);
            }
            "nv_gpu_memory_used_bytes" => {
                used.insert(gpu(), value);
            }
            "nv_gpu_utilization" => {
                util.insert(gpu(), value);
            }
            "nv_inference_count" => {
                if let Some(model) = labels.get("model") {
                    traffic.entry(model.clone()).or_default().inference_count += value as u64;
                }
            }
            "nv_inference_pending_request_count" => {
                if let Some(model) = labels.get("model") {
                    traffic.entry(model.clone()).or_default().pending_requests += value as u64;
                }
            }
            _ => {}
        }
    }

    let gpu_utilization = if util.is_empty() {
        0.0
    } else {
        util.values().sum::<f64>() / util.len() as f64
    };

    ServerSample {
        gpu_memory_total_bytes: total.values().sum::<f64>() as u64,
        gpu_memory_used_bytes: used.values().sum::<f64>() as u64,
        gpu_utilization,
        ready: false,
        traffic,
        observed_at_ms: 0,
    }
}

/// `name{k="v",...} value [timestamp]`
fn parse_line(line: &str) -> Option<(&str, BTreeMap<String, String>, f64)> {
    let (head, rest) = match line.find('{') {
        Some(open) => {
            let close = line[open..].find('}')? + open;
            (&line[..=close], &line[close + 1..])
        }
        None => line.split_once(char::is_whitespace)?,
    };
    let value: f64 = rest.split_whitespace().next()?.parse().ok()?;

    let (name, labels) = match head.split_once('{') {
        Some((name, body)) => (name, parse_labels(body.trim_end_matches('}'))),
        None => (head, BTreeMap::new()),
    };
    Some((name.trim(), labels, value))
}

fn parse_labels(body: &str) -> BTreeMap<String, String> {
    body.split(',')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            Some((k.trim().to_string(), v.trim().trim_matches('"').to_string()))
        })
        .collect()
}
