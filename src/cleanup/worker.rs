use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use sqlx::{types::Json, Postgres, QueryBuilder};
use tracing::{info, instrument};

use super::fields::{cleanup_tags, cleanup_url};
use super::record::{FieldValue, StagedRecord};
use super::rules::{quote_ident, CleanupRule, FieldRuleTable};
use super::tls::{ProviderTlsSupport, TlsProbe};
use crate::util::db::Db;

/// One changed column of one record.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateFragment {
    pub field: String,
    pub value: FieldValue,
}

/// Every change for one record, written as a single UPDATE.
#[derive(Debug, Clone, PartialEq)]
pub struct RowUpdate {
    pub id: i64,
    pub fragments: Vec<UpdateFragment>,
}

impl RowUpdate {
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fragments
            .iter()
            .find(|f| f.field == field)
            .map(|f| &f.value)
    }
}

/// Input of one worker: its slice of the batch plus read-only context.
#[derive(Debug)]
pub struct WorkerTask {
    pub batch: u64,
    pub worker: usize,
    pub rows: Vec<StagedRecord>,
    pub rules: Arc<FieldRuleTable>,
    /// This worker's own copy.
    pub tls: ProviderTlsSupport,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct WorkerReport {
    pub rows_seen: usize,
    pub rows_updated: usize,
    /// Providers probed on demand by this worker.
    pub discovered_tls: HashMap<String, bool>,
}

/// Run every rule that applies to `row` and collect the resulting changes.
/// `None` when nothing changes.
pub async fn plan_row_update(
    row: &StagedRecord,
    rules: &FieldRuleTable,
    tls: &mut ProviderTlsSupport,
    prober: &dyn TlsProbe,
) -> Result<Option<RowUpdate>> {
    let mut fragments = Vec::new();
    for (field, rule) in rules.rules_for(&row.provider) {
        let Some(dirty) = row.fields.get(field) else {
            continue;
        };
        if dirty.is_empty() {
            continue;
        }
        let cleaned = match (rule, dirty) {
            (CleanupRule::Url, FieldValue::Text(url)) => cleanup_url(url, tls, &row.provider, prober)
                .await
                .map(FieldValue::Text),
            (CleanupRule::Tags, FieldValue::Json(tags)) => cleanup_tags(tags)
                .with_context(|| format!("row {} field {field}", row.id))?
                .map(FieldValue::Json),
            (rule, value) => bail!(
                "row {} field {field}: {rule:?} rule cannot clean {value:?}",
                row.id
            ),
        };
        if let Some(value) = cleaned {
            fragments.push(UpdateFragment {
                field: field.clone(),
                value,
            });
        }
    }

    if fragments.is_empty() {
        Ok(None)
    } else {
        Ok(Some(RowUpdate {
            id: row.id,
            fragments,
        }))
    }
}

/// `UPDATE "temp_import_<table>" SET "a" = $1, "b" = $2 WHERE id = $3`.
/// Column names come from the validated rule table, values are bound.
pub fn build_update<'a>(rules: &FieldRuleTable, update: &'a RowUpdate) -> QueryBuilder<'a, Postgres> {
    let mut qb: QueryBuilder<'a, Postgres> = QueryBuilder::new("UPDATE ");
    qb.push(rules.staging_table());
    qb.push(" SET ");
    let mut set = qb.separated(", ");
    for fragment in &update.fragments {
        set.push(quote_ident(&fragment.field));
        set.push_unseparated(" = ");
        match &fragment.value {
            FieldValue::Text(text) => set.push_bind_unseparated(text.as_str()),
            FieldValue::Json(value) => set.push_bind_unseparated(Json(value)),
        };
    }
    qb.push(" WHERE id = ");
    qb.push_bind(update.id);
    qb
}

/// Clean one partition and write its updates in a single transaction on a
/// connection held for the whole slice.
#[instrument(skip_all, fields(batch = task.batch, worker = task.worker, rows = task.rows.len()))]
pub async fn run_worker(
    task: WorkerTask,
    staging: Db,
    prober: Arc<dyn TlsProbe>,
) -> Result<WorkerReport> {
    let WorkerTask {
        rows,
        rules,
        mut tls,
        ..
    } = task;
    let t0 = Instant::now();
    info!("cleaning {} rows", rows.len());

    let mut tx = staging
        .pool
        .begin()
        .await
        .context("worker failed to open staging transaction")?;

    let mut report = WorkerReport {
        rows_seen: rows.len(),
        ..WorkerReport::default()
    };
    for row in &rows {
        let Some(update) = plan_row_update(row, &rules, &mut tls, prober.as_ref()).await? else {
            continue;
        };
        build_update(&rules, &update)
            .build()
            .persistent(false)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to update staged row {}", update.id))?;
        report.rows_updated += 1;
    }

    info!("worker committing changes");
    tx.commit().await.context("worker commit failed")?;
    report.discovered_tls = tls.take_discoveries();
    info!(
        updated = report.rows_updated,
        discovered_providers = report.discovered_tls.len(),
        elapsed_ms = t0.elapsed().as_millis() as u64,
        "worker finished slice"
    );
    Ok(report)
}
