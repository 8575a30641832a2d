//! Cleanup of staged provider records before promotion.
//!
//! Upstream feeds leave scheme-less URLs and noisy machine-generated tags in
//! the `temp_import_<table>` staging tables. This module fixes those fields in
//! place:
//!
//! - [`tls`] decides per provider whether scheme-less URLs become https,
//! - [`rules`] and [`fields`] map each cleanable column to its cleaner,
//! - [`orchestrator`] streams the table in batches and fans each batch out
//!   to [`worker`]s that write the updates back.

pub mod fields;
pub mod orchestrator;
pub mod record;
pub mod rules;
pub mod tls;
pub mod worker;

use std::sync::Arc;

use anyhow::Result;

pub use orchestrator::{CleanupEngine, CleanupSettings, CleanupSummary};
pub use rules::{CleanupConfig, CleanupRule, FieldRuleTable};
pub use tls::{HttpTlsProber, ProviderTlsSupport, TlsProbe};

use crate::util::db::Db;
use crate::util::env::staging_db_url;

async fn engine_from_env(upstream_url: &str) -> Result<CleanupEngine> {
    let settings = CleanupSettings::from_env();
    let staging = Db::connect(&staging_db_url()?, settings.staging_connections()).await?;
    let catalog = Db::connect(upstream_url, 1).await?;
    let prober = Arc::new(HttpTlsProber::new(settings.probe_timeout)?);
    Ok(CleanupEngine::new(staging, catalog, settings, prober))
}

/// Clean staged media `table` in place. The provider catalog is read from
/// `upstream_url`; the staging store and tuning come from the environment.
pub async fn clean_table(table: &str, upstream_url: &str) -> Result<()> {
    engine_from_env(upstream_url)
        .await?
        .clean_table(table)
        .await
        .map(|_| ())
}

/// Per-provider TLS support for `table`, without cleaning anything.
pub async fn decide_provider_tls(table: &str, upstream_url: &str) -> Result<ProviderTlsSupport> {
    engine_from_env(upstream_url)
        .await?
        .decide_provider_tls(table)
        .await
}
