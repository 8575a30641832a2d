use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use futures::future::join_all;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use super::record::StagedRecord;
use super::rules::{CleanupConfig, FieldRuleTable};
use super::tls::{self, ProviderTlsSupport, TlsProbe};
use super::worker::{run_worker, WorkerReport, WorkerTask};
use crate::util::db::Db;
use crate::util::env::env_parse;

/// Rows fetched from the staging cursor per batch.
pub const DEFAULT_BATCH_SIZE: usize = 100_000;
/// Staged rows probed per provider when deciding TLS support.
pub const DEFAULT_SAMPLE_SIZE: i64 = 10;
/// Bound on each TLS probe request.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub struct CleanupSettings {
    /// Workers per batch; also bounds concurrent staging connections.
    pub workers: usize,
    pub batch_size: usize,
    pub sample_size: i64,
    pub probe_timeout: Duration,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            batch_size: DEFAULT_BATCH_SIZE,
            sample_size: DEFAULT_SAMPLE_SIZE,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

impl CleanupSettings {
    /// Defaults overridden by `CLEANUP_WORKERS`, `CLEANUP_BATCH_SIZE`,
    /// `TLS_PROBE_SAMPLE_SIZE` and `TLS_PROBE_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            workers: env_parse("CLEANUP_WORKERS", defaults.workers).max(1),
            batch_size: env_parse("CLEANUP_BATCH_SIZE", defaults.batch_size).max(1),
            sample_size: env_parse("TLS_PROBE_SAMPLE_SIZE", defaults.sample_size).max(0),
            probe_timeout: Duration::from_secs(env_parse(
                "TLS_PROBE_TIMEOUT_SECS",
                defaults.probe_timeout.as_secs(),
            )),
        }
    }

    /// Staging pool size: the cursor connection plus one per worker.
    pub fn staging_connections(&self) -> u32 {
        u32::try_from(self.workers.saturating_add(1)).unwrap_or(u32::MAX)
    }
}

/// Outcome of one cleanup run, for logging.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupSummary {
    pub table: String,
    pub batches: u64,
    pub rows_inspected: usize,
    pub rows_updated: usize,
    pub providers_probed: usize,
    pub providers_discovered: usize,
    pub elapsed: Duration,
}

/// Split `len` rows into `workers` contiguous ranges whose sizes differ by at
/// most one. Ranges cover `0..len` exactly; trailing ranges are empty when
/// there are fewer rows than workers.
pub fn partition_bounds(len: usize, workers: usize) -> Vec<Range<usize>> {
    let workers = workers.max(1);
    let base = len / workers;
    let extra = len % workers;
    let mut start = 0;
    (0..workers)
        .map(|i| {
            let size = base + usize::from(i < extra);
            let range = start..start + size;
            start += size;
            range
        })
        .collect()
}

/// Streams a staging table through the field cleaners.
pub struct CleanupEngine {
    staging: Db,
    catalog: Db,
    config: CleanupConfig,
    settings: CleanupSettings,
    prober: Arc<dyn TlsProbe>,
}

impl CleanupEngine {
    pub fn new(
        staging: Db,
        catalog: Db,
        settings: CleanupSettings,
        prober: Arc<dyn TlsProbe>,
    ) -> Self {
        Self {
            staging,
            catalog,
            config: CleanupConfig::with_defaults(),
            settings,
            prober,
        }
    }

    pub fn with_config(mut self, config: CleanupConfig) -> Self {
        self.config = config;
        self
    }

    pub fn settings(&self) -> &CleanupSettings {
        &self.settings
    }

    /// Probe every catalog provider against `temp_import_<table>`.
    pub async fn decide_provider_tls(&self, table: &str) -> Result<ProviderTlsSupport> {
        let rules = self.config.table_rules(table)?;
        tls::decide_provider_tls(
            &self.catalog,
            &self.staging,
            &rules,
            self.prober.as_ref(),
            self.settings.sample_size,
        )
        .await
    }

    /// Probe TLS support, then clean every staged row of `table`.
    pub async fn clean_table(&self, table: &str) -> Result<CleanupSummary> {
        info!(table, "testing TLS support for each provider");
        let tls = self.decide_provider_tls(table).await?;
        self.clean_table_with_tls(table, tls).await
    }

    /// Clean every staged row of `table` using an existing TLS decision.
    ///
    /// Batches run strictly one after another; a worker failure aborts the
    /// run after its batch's other workers have returned. Batches committed
    /// before the failure stay committed.
    #[instrument(skip(self, tls), fields(workers = self.settings.workers, batch_size = self.settings.batch_size))]
    pub async fn clean_table_with_tls(
        &self,
        table: &str,
        mut tls: ProviderTlsSupport,
    ) -> Result<CleanupSummary> {
        let rules = Arc::new(self.config.table_rules(table)?);
        let overrides: Vec<&str> = rules.override_providers().collect();
        let selection = rules.selection_sql();
        info!(
            selection = %selection,
            provider_overrides = ?overrides,
            "running cleanup on selection"
        );

        let t0 = Instant::now();
        let mut summary = CleanupSummary {
            table: table.to_string(),
            providers_probed: tls.len(),
            ..CleanupSummary::default()
        };

        // Server-side cursor: memory stays bounded by one batch no matter
        // how large the staging table is.
        let cursor = format!("cleanup_{}", Uuid::new_v4().simple());
        let mut tx = self
            .staging
            .pool
            .begin()
            .await
            .context("failed to open cursor transaction")?;
        sqlx::query(&format!("DECLARE {cursor} NO SCROLL CURSOR FOR {selection}"))
            .persistent(false)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to declare cursor over table {table}"))?;
        let fetch_sql = format!("FETCH FORWARD {} FROM {cursor}", self.settings.batch_size);

        loop {
            debug!("fetching next batch");
            let rows = sqlx::query(&fetch_sql)
                .persistent(false)
                .fetch_all(&mut *tx)
                .await
                .context("failed to fetch next batch")?;
            if rows.is_empty() {
                break;
            }
            let batch = rows
                .iter()
                .map(|row| StagedRecord::from_row(row, &rules))
                .collect::<Result<Vec<_>>>()?;
            drop(rows);

            summary.batches += 1;
            let batch_len = batch.len();
            let t_batch = Instant::now();
            let reports = self
                .dispatch_batch(summary.batches, batch, &rules, &tls)
                .await?;
            for report in reports {
                summary.rows_updated += report.rows_updated;
                summary.providers_discovered += tls.merge(report.discovered_tls);
            }
            summary.rows_inspected += batch_len;

            let secs = t_batch.elapsed().as_secs_f64().max(1e-3);
            info!(
                batch = summary.batches,
                rows = batch_len,
                cleanup_rate = batch_len as f64 / secs,
                cleaned_so_far = summary.rows_inspected,
                "batch finished"
            );
        }

        sqlx::query(&format!("CLOSE {cursor}"))
            .persistent(false)
            .execute(&mut *tx)
            .await
            .context("failed to close cursor")?;
        tx.commit().await.context("failed to end cursor transaction")?;

        summary.elapsed = t0.elapsed();
        info!(
            rows = summary.rows_inspected,
            updated = summary.rows_updated,
            batches = summary.batches,
            elapsed_secs = summary.elapsed.as_secs_f64(),
            "cleaned all records"
        );
        Ok(summary)
    }

    /// Fan one batch out over the workers and wait for all of them.
    async fn dispatch_batch(
        &self,
        batch_no: u64,
        batch: Vec<StagedRecord>,
        rules: &Arc<FieldRuleTable>,
        tls: &ProviderTlsSupport,
    ) -> Result<Vec<WorkerReport>> {
        let bounds = partition_bounds(batch.len(), self.settings.workers);
        let mut rows = batch.into_iter();
        let mut handles = Vec::with_capacity(bounds.len());
        for (worker, range) in bounds.into_iter().enumerate() {
            let slice: Vec<StagedRecord> = rows.by_ref().take(range.len()).collect();
            if slice.is_empty() {
                continue;
            }
            debug!(batch = batch_no, worker, start = range.start, end = range.end, "scheduling job");
            let task = WorkerTask {
                batch: batch_no,
                worker,
                rows: slice,
                rules: Arc::clone(rules),
                tls: tls.clone(),
            };
            handles.push(tokio::spawn(run_worker(
                task,
                self.staging.clone(),
                Arc::clone(&self.prober),
            )));
        }
        info!(batch = batch_no, jobs = handles.len(), "starting cleaning jobs");

        let results = join_all(handles).await;
        let mut reports = Vec::with_capacity(results.len());
        let mut first_err: Option<anyhow::Error> = None;
        for r in results {
            match r {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(e)) => {
                    error!(batch = batch_no, error = %e, "cleanup worker failed");
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
                Err(join_err) => {
                    error!(batch = batch_no, error = %join_err, "cleanup worker panicked");
                    if first_err.is_none() {
                        first_err = Some(anyhow!(join_err));
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e.context(format!("cleanup aborted in batch {batch_no}"))),
            None => Ok(reports),
        }
    }
}
