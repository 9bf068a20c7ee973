//! Upstream resolution over DNS-over-HTTPS.
//!
//! Two independent providers are queried in order, each at most once per
//! lookup. Both speak the JSON DoH dialect, so one response type covers both.

use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;

use crate::cache::Answer;
use crate::policy::fqdn;

/// Answers shorter than this are stored with a 30-second TTL to bound the
/// upstream query rate in audit mode.
pub const MIN_TTL: u32 = 30;

const HTTP_TIMEOUT: Duration = Duration::from_secs(3);
const RECORD_TYPE_A: u16 = 1;

#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<Answer>;
}

pub struct DohResolver {
    client: reqwest::Client,
}

impl DohResolver {
    pub fn new() -> Result<Self> {
        let client = reqwest::ClientBuilder::new()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("Failed to build DoH HTTP client")?;

        Ok(Self { client })
    }

    async fn query(&self, url: String) -> Result<Answer> {
        let response = self
            .client
            .get(&url)
            .header("accept", "application/dns-json")
            .send()
            .await
            .context("DoH request failed")?
            .error_for_status()
            .context("DoH request rejected")?;

        let body = response
            .json::<DohResponse>()
            .await
            .context("Failed to parse DoH response body")?;

        first_a_record(body)
    }
}

#[async_trait]
impl Resolve for DohResolver {
    async fn resolve(&self, name: &str) -> Result<Answer> {
        let name = fqdn(name);

        let mut last_error = None;
        for url in [primary_url(&name), fallback_url(&name)] {
            match self.query(url).await {
                Ok(answer) => return Ok(answer),
                Err(e) => {
                    tracing::debug!(%name, "DoH provider failed: {e:#}");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.expect("at least one provider was queried"))
            .with_context(|| format!("All DoH providers failed for `{name}`"))
    }
}

fn primary_url(name: &str) -> String {
    format!("https://dns.google/resolve?name={name}&type=A")
}

fn fallback_url(name: &str) -> String {
    format!("https://cloudflare-dns.com/dns-query?name={name}&type=A")
}

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Status")]
    status: u32,
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    name: String,
    #[serde(rename = "type")]
    rtype: u16,
    #[serde(rename = "TTL")]
    ttl: u32,
    data: String,
}

/// Picks the first A record out of a DoH response and clamps its TTL.
fn first_a_record(response: DohResponse) -> Result<Answer> {
    if response.status != 0 {
        bail!("Upstream resolver returned status {}", response.status);
    }

    let record = response
        .answer
        .into_iter()
        .find(|answer| answer.rtype == RECORD_TYPE_A)
        .context("Upstream response contained no A record")?;

    let addr = record
        .data
        .parse::<Ipv4Addr>()
        .with_context(|| format!("A record data `{}` is not an IPv4 address", record.data))?;

    Ok(Answer {
        name: fqdn(&record.name),
        addr,
        ttl: record.ttl.max(MIN_TTL),
    })
}
