use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::{postgres::PgRow, Row};

use super::rules::{CleanupRule, FieldRuleTable};

/// A cleanable column value, typed by the rule that reads it.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Json(Value),
}

impl FieldValue {
    /// Empty strings, JSON null and empty arrays are never cleaned.
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Text(s) => s.is_empty(),
            FieldValue::Json(Value::Null) => true,
            FieldValue::Json(Value::Array(items)) => items.is_empty(),
            FieldValue::Json(_) => false,
        }
    }
}

/// One row of a `temp_import_<table>` staging table.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedRecord {
    pub id: i64,
    pub provider: String,
    /// Only non-NULL columns are present.
    pub fields: BTreeMap<String, FieldValue>,
}

impl StagedRecord {
    pub fn new(id: i64, provider: impl Into<String>) -> Self {
        Self {
            id,
            provider: provider.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_text(mut self, field: &str, value: impl Into<String>) -> Self {
        self.fields
            .insert(field.to_string(), FieldValue::Text(value.into()));
        self
    }

    pub fn with_json(mut self, field: &str, value: Value) -> Self {
        self.fields.insert(field.to_string(), FieldValue::Json(value));
        self
    }

    /// Decode a row produced by [`FieldRuleTable::selection_sql`]. Column
    /// decoding follows the rule kind registered for each column.
    pub fn from_row(row: &PgRow, rules: &FieldRuleTable) -> Result<Self> {
        let id: i64 = row.try_get("id").context("staged row without id")?;
        let provider: Option<String> = row.try_get("provider")?;
        let mut record = StagedRecord::new(id, provider.unwrap_or_default());
        for (column, rule) in rules.columns() {
            let value = match rule {
                CleanupRule::Url => row
                    .try_get::<Option<String>, _>(column)
                    .with_context(|| format!("decoding column {column} of row {id}"))?
                    .map(FieldValue::Text),
                CleanupRule::Tags => row
                    .try_get::<Option<Value>, _>(column)
                    .with_context(|| format!("decoding column {column} of row {id}"))?
                    .map(FieldValue::Json),
            };
            if let Some(value) = value {
                record.fields.insert(column.to_string(), value);
            }
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_values() {
        assert!(FieldValue::Text(String::new()).is_empty());
        assert!(FieldValue::Json(Value::Null).is_empty());
        assert!(FieldValue::Json(json!([])).is_empty());
        assert!(!FieldValue::Json(json!([{"name": "sunset"}])).is_empty());
        assert!(!FieldValue::Text("www.example.com".into()).is_empty());
    }
}
