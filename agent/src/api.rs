//! Client for the telemetry service.
//!
//! All sends are best-effort: failures are logged and never propagate into
//! the packet or event paths. Transport failures and non-200 responses are
//! retried up to three attempts.

use std::net::IpAddr;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ATTEMPTS: u32 = 3;
const ONE_TIME_KEY_HEADER: &str = "x-one-time-key";

/// The program (chain) behind an observed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tool {
    pub name: String,
    pub sha256: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<Box<Tool>>,
}

impl Tool {
    /// Attribution placeholder for observers without pid context.
    pub fn unknown() -> Self {
        Self {
            name: "Unknown".to_owned(),
            sha256: "Unknown".to_owned(),
            parent: None,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DnsRecord<'a> {
    domain_name: &'a str,
    ip_address: String,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NetworkConnection<'a> {
    #[serde(skip_serializing_if = "str::is_empty")]
    ip_address: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    port: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    domain_name: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    status: &'a str,
    timestamp: DateTime<Utc>,
    tool: &'a Tool,
}

#[derive(Debug, Serialize)]
struct FileEventRecord<'a> {
    filetype: &'a str,
    timestamp: DateTime<Utc>,
    tool: &'a Tool,
}

#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn send_dns_record(&self, domain: &str, addr: IpAddr);

    async fn send_network_connection(
        &self,
        addr: &str,
        port: &str,
        domain: &str,
        status: &str,
        timestamp: DateTime<Utc>,
        tool: &Tool,
    );

    async fn send_file_event(&self, file_type: &str, timestamp: DateTime<Utc>, tool: &Tool);
}

pub struct ApiClient {
    client: reqwest::Client,
    api_url: String,
    repo: String,
    correlation_id: String,
    one_time_key: String,
}

impl ApiClient {
    pub fn new(api_url: &str, repo: &str, correlation_id: &str, one_time_key: &str) -> Result<Self> {
        let client = reqwest::ClientBuilder::new()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("Failed to build telemetry HTTP client")?;

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_owned(),
            repo: repo.to_owned(),
            correlation_id: correlation_id.to_owned(),
            one_time_key: one_time_key.to_owned(),
        })
    }

    fn job_url(&self, kind: &str) -> String {
        format!(
            "{}/github/{}/actions/jobs/{}/{kind}",
            self.api_url, self.repo, self.correlation_id
        )
    }

    async fn post(&self, url: String, body: &impl Serialize) {
        for attempt in 1..=MAX_ATTEMPTS {
            match self.try_post(&url, body).await {
                Ok(()) => return,
                Err(e) if attempt == MAX_ATTEMPTS => {
                    tracing::debug!(%url, "Giving up on telemetry request: {e:#}");
                }
                Err(e) => {
                    tracing::trace!(%url, %attempt, "Telemetry request failed: {e:#}");
                }
            }
        }
    }

    async fn try_post(&self, url: &str, body: &impl Serialize) -> Result<()> {
        let response = self
            .client
            .post(url)
            .header(ONE_TIME_KEY_HEADER, &self.one_time_key)
            .json(body)
            .send()
            .await
            .context("Transport error")?;

        let status = response.status();
        if !status.is_success() {
            bail!("API call error, status code: {status}");
        }

        Ok(())
    }
}

#[async_trait]
impl TelemetrySink for ApiClient {
    async fn send_dns_record(&self, domain: &str, addr: IpAddr) {
        self.post(
            self.job_url("dns"),
            &DnsRecord {
                domain_name: domain,
                ip_address: addr.to_string(),
                timestamp: Utc::now(),
            },
        )
        .await;
    }

    async fn send_network_connection(
        &self,
        addr: &str,
        port: &str,
        domain: &str,
        status: &str,
        timestamp: DateTime<Utc>,
        tool: &Tool,
    ) {
        self.post(
            self.job_url("networkconnection"),
            &NetworkConnection {
                ip_address: addr,
                port,
                domain_name: domain,
                status,
                timestamp,
                tool,
            },
        )
        .await;
    }

    async fn send_file_event(&self, file_type: &str, timestamp: DateTime<Utc>, tool: &Tool) {
        self.post(
            self.job_url("fileevent"),
            &FileEventRecord {
                filetype: file_type,
                timestamp,
                tool,
            },
        )
        .await;
    }
}

/// Sink used when the operator disabled telemetry.
pub struct NoopSink;

#[async_trait]
impl TelemetrySink for NoopSink {
    async fn send_dns_record(&self, _: &str, _: IpAddr) {}

    async fn send_network_connection(
        &self,
        _: &str,
        _: &str,
        _: &str,
        _: &str,
        _: DateTime<Utc>,
        _: &Tool,
    ) {
    }

    async fn send_file_event(&self, _: &str, _: DateTime<Utc>, _: &Tool) {}
}
