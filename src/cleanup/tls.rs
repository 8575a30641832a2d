//! Per-provider https inference.
//!
//! Upstream URLs often lack a scheme, or use http where https works. A few
//! staged URLs per provider are probed over https and the majority decides
//! which scheme the provider's scheme-less URLs get. This is a sampling
//! heuristic, not protocol negotiation; network failures simply count as a
//! vote against https.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use sqlx::Row;
use tracing::{debug, info, instrument};

use super::fields::{has_authority_scheme, starts_with_scheme};
use super::rules::{quote_ident, FieldRuleTable};
use crate::util::db::Db;

/// Column preferred when sampling URLs to probe.
pub const SAMPLE_THUMBNAIL_COLUMN: &str = "thumbnail";
/// Fallback when the thumbnail is empty.
pub const SAMPLE_URL_COLUMN: &str = "url";

/// Provider identifier -> "prefer https".
///
/// Workers receive their own copy. Decisions made on demand inside a worker
/// are tracked separately so the orchestrator can merge them back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderTlsSupport {
    decisions: HashMap<String, bool>,
    discovered: HashMap<String, bool>,
}

impl ProviderTlsSupport {
    pub fn get(&self, provider: &str) -> Option<bool> {
        self.decisions.get(provider).copied()
    }

    pub fn insert(&mut self, provider: impl Into<String>, prefer_https: bool) {
        self.decisions.insert(provider.into(), prefer_https);
    }

    /// Insert a decision made mid-run and remember it as a discovery.
    pub fn record_discovery(&mut self, provider: &str, prefer_https: bool) {
        self.decisions.insert(provider.to_string(), prefer_https);
        self.discovered.insert(provider.to_string(), prefer_https);
    }

    pub fn discoveries(&self) -> &HashMap<String, bool> {
        &self.discovered
    }

    pub fn take_discoveries(&mut self) -> HashMap<String, bool> {
        std::mem::take(&mut self.discovered)
    }

    /// Fold discoveries from a worker into this map. Providers already
    /// decided keep their decision.
    pub fn merge(&mut self, discovered: HashMap<String, bool>) -> usize {
        let mut added = 0;
        for (provider, decision) in discovered {
            if !self.decisions.contains_key(&provider) {
                self.decisions.insert(provider, decision);
                added += 1;
            }
        }
        added
    }

    pub fn len(&self) -> usize {
        self.decisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> + '_ {
        self.decisions.iter().map(|(p, d)| (p.as_str(), *d))
    }
}

impl FromIterator<(String, bool)> for ProviderTlsSupport {
    fn from_iter<I: IntoIterator<Item = (String, bool)>>(iter: I) -> Self {
        Self {
            decisions: iter.into_iter().collect(),
            discovered: HashMap::new(),
        }
    }
}

/// What probing a URL amounts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeTarget {
    /// Already https; trusted without a request.
    Trusted,
    /// GET this https variant.
    Fetch(String),
    /// Some other scheme; counts against https.
    Unsupported,
}

/// Scheme-less URLs are treated as http, then http is upgraded to https.
/// Anything without a `scheme://` prefix counts as scheme-less here, so
/// `host:port/path` is probed too.
pub fn probe_target(url: &str) -> ProbeTarget {
    if starts_with_scheme(url, "https") {
        ProbeTarget::Trusted
    } else if starts_with_scheme(url, "http") {
        ProbeTarget::Fetch(format!("https{}", &url["http".len()..]))
    } else if has_authority_scheme(url) {
        ProbeTarget::Unsupported
    } else {
        let rest = url.strip_prefix("//").unwrap_or(url);
        probe_target(&format!("http://{rest}"))
    }
}

/// Whether a 2xx/3xx status counts as https support.
pub fn status_supports_tls(status: u16) -> bool {
    (200..400).contains(&status)
}

/// Outbound capability used to test a single URL.
#[async_trait]
pub trait TlsProbe: Send + Sync {
    /// `true` when `url` should be served over https. Never fails: any
    /// error is a negative answer.
    async fn supports_tls(&self, url: &str) -> bool;
}

/// [`TlsProbe`] issuing real GET requests.
#[derive(Debug, Clone)]
pub struct HttpTlsProber {
    http: Client,
}

impl HttpTlsProber {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent("staging-cleanup/0.1")
            .timeout(timeout)
            .build()
            .context("failed to build TLS probe HTTP client")?;
        Ok(Self { http })
    }
}

#[async_trait]
impl TlsProbe for HttpTlsProber {
    async fn supports_tls(&self, url: &str) -> bool {
        let https = match probe_target(url) {
            ProbeTarget::Trusted => return true,
            ProbeTarget::Unsupported => return false,
            ProbeTarget::Fetch(https) => https,
        };
        match self.http.get(&https).send().await {
            Ok(res) => {
                let status = res.status().as_u16();
                info!(url = %https, status, "tls probe");
                status_supports_tls(status)
            }
            Err(e) => {
                debug!(url = %https, error = %e, "tls probe failed");
                false
            }
        }
    }
}

/// Tally of probe answers for one provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlsVotes {
    pub https: usize,
    pub http: usize,
}

impl TlsVotes {
    pub fn record(&mut self, supports_tls: bool) {
        if supports_tls {
            self.https += 1;
        } else {
            self.http += 1;
        }
    }

    /// Ties go to https, including the no-sample case.
    pub fn prefers_https(&self) -> bool {
        self.https >= self.http
    }
}

/// Pick the URL to probe from a sampled row: thumbnail first, then the
/// primary URL.
pub fn sample_url(thumbnail: Option<String>, url: Option<String>) -> Option<String> {
    thumbnail
        .filter(|t| !t.is_empty())
        .or_else(|| url.filter(|u| !u.is_empty()))
}

/// Decide https support for every provider in the upstream catalog by
/// probing up to `sample_size` staged URLs each.
#[instrument(skip_all, fields(table = rules.table()))]
pub async fn decide_provider_tls(
    catalog: &Db,
    staging: &Db,
    rules: &FieldRuleTable,
    prober: &dyn TlsProbe,
    sample_size: i64,
) -> Result<ProviderTlsSupport> {
    let providers: Vec<Option<String>> =
        sqlx::query_scalar("SELECT provider_identifier FROM content_provider")
            .persistent(false)
            .fetch_all(&catalog.pool)
            .await
            .context("failed to list content providers")?;

    let sample_sql = format!(
        "SELECT {thumb}::text AS thumbnail, {url}::text AS url FROM {table} WHERE provider = $1 LIMIT $2",
        thumb = quote_ident(SAMPLE_THUMBNAIL_COLUMN),
        url = quote_ident(SAMPLE_URL_COLUMN),
        table = rules.staging_table(),
    );

    let mut support = ProviderTlsSupport::default();
    for provider in providers.into_iter().flatten() {
        let rows = sqlx::query(&sample_sql)
            .persistent(false)
            .bind(&provider)
            .bind(sample_size)
            .fetch_all(&staging.pool)
            .await
            .with_context(|| format!("failed to sample staged rows for provider {provider}"))?;

        let mut samples = Vec::with_capacity(rows.len());
        for row in rows {
            let thumbnail: Option<String> = row.try_get("thumbnail")?;
            let url: Option<String> = row.try_get("url")?;
            if let Some(sample) = sample_url(thumbnail, url) {
                samples.push(sample);
            }
        }

        let answers = join_all(samples.iter().map(|u| prober.supports_tls(u))).await;
        let mut votes = TlsVotes::default();
        for answer in answers {
            votes.record(answer);
        }
        let prefers_https = votes.prefers_https();
        info!(
            provider = %provider,
            https_votes = votes.https,
            http_votes = votes.http,
            prefers_https,
            "provider TLS support"
        );
        support.insert(provider, prefers_https);
    }
    Ok(support)
}
