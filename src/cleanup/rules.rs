//! Which columns get cleaned, per staging table and provider.
//!
//! The configuration is a small closed lookup keyed by
//! (table, provider-or-wildcard, field). It is built once, validated into an
//! immutable [`FieldRuleTable`] per table, and doubles as the allow-list for
//! every identifier that ends up in generated SQL.

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use anyhow::{anyhow, bail, Result};
use indexmap::IndexMap;
use regex::Regex;

/// Provider key whose rules apply to every provider.
pub const WILDCARD_PROVIDER: &str = "*";

/// Prefix of the staging tables filled by the import job.
pub const STAGING_PREFIX: &str = "temp_import_";

/// Cleaning function attached to a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CleanupRule {
    /// Add a missing scheme, see [`super::fields::cleanup_url`].
    Url,
    /// Drop boilerplate and low-confidence tags, see [`super::fields::cleanup_tags`].
    Tags,
}

impl CleanupRule {
    /// SQL type the column is read as.
    pub fn sql_cast(&self) -> &'static str {
        match self {
            CleanupRule::Url => "text",
            CleanupRule::Tags => "jsonb",
        }
    }
}

/// Field -> rule, in registration order. Rules run in this order, so the
/// first URL column registered is the one probed for an unknown provider.
pub type FieldRules = IndexMap<String, CleanupRule>;

/// Raw registrations for every table.
#[derive(Debug, Default, Clone)]
pub struct CleanupConfig {
    tables: HashMap<String, HashMap<String, FieldRules>>,
}

impl CleanupConfig {
    /// The stock configuration: image URLs and tags for every provider.
    pub fn with_defaults() -> Self {
        Self::default()
            .register("image", WILDCARD_PROVIDER, "tags", CleanupRule::Tags)
            .register("image", WILDCARD_PROVIDER, "url", CleanupRule::Url)
            .register("image", WILDCARD_PROVIDER, "creator_url", CleanupRule::Url)
            .register(
                "image",
                WILDCARD_PROVIDER,
                "foreign_landing_url",
                CleanupRule::Url,
            )
            .register("image", WILDCARD_PROVIDER, "thumbnail", CleanupRule::Url)
    }

    /// Register or override the rule for one (table, provider, field).
    pub fn register(
        mut self,
        table: impl Into<String>,
        provider: impl Into<String>,
        field: impl Into<String>,
        rule: CleanupRule,
    ) -> Self {
        self.tables
            .entry(table.into())
            .or_default()
            .entry(provider.into())
            .or_default()
            .insert(field.into(), rule);
        self
    }

    /// Build the merged, validated rule table for `table`.
    pub fn table_rules(&self, table: &str) -> Result<FieldRuleTable> {
        validate_ident(table)?;
        let providers = self
            .tables
            .get(table)
            .ok_or_else(|| anyhow!("no cleanup rules configured for table {table}"))?;

        let wildcard = providers.get(WILDCARD_PROVIDER).cloned().unwrap_or_default();
        let mut columns: BTreeMap<String, CleanupRule> = BTreeMap::new();
        let mut by_provider = HashMap::new();
        for (provider, rules) in providers {
            for (field, rule) in rules {
                validate_ident(field)?;
                if let Some(existing) = columns.insert(field.clone(), *rule) {
                    if existing != *rule {
                        bail!("column {field} of table {table} has conflicting cleanup rules");
                    }
                }
            }
            if provider != WILDCARD_PROVIDER {
                let mut merged = wildcard.clone();
                merged.extend(rules.iter().map(|(f, r)| (f.clone(), *r)));
                by_provider.insert(provider.clone(), merged);
            }
        }

        Ok(FieldRuleTable {
            table: table.to_string(),
            wildcard,
            by_provider,
            columns,
        })
    }

    /// Rules that apply to `provider`'s rows of `table`.
    pub fn resolve_rules(&self, table: &str, provider: &str) -> Result<FieldRules> {
        Ok(self.table_rules(table)?.rules_for(provider).clone())
    }
}

/// Immutable per-table rule lookup handed to every worker.
#[derive(Debug, Clone)]
pub struct FieldRuleTable {
    table: String,
    wildcard: FieldRules,
    /// Provider overrides already merged over the wildcard rules.
    by_provider: HashMap<String, FieldRules>,
    /// Every column some provider cleans, sorted by name.
    columns: BTreeMap<String, CleanupRule>,
}

impl FieldRuleTable {
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Quoted name of the staging table, e.g. `"temp_import_image"`.
    pub fn staging_table(&self) -> String {
        quote_ident(&format!("{STAGING_PREFIX}{}", self.table))
    }

    pub fn rules_for(&self, provider: &str) -> &FieldRules {
        self.by_provider.get(provider).unwrap_or(&self.wildcard)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, CleanupRule)> + '_ {
        self.columns.iter().map(|(c, r)| (c.as_str(), *r))
    }

    /// Providers with their own overrides.
    pub fn override_providers(&self) -> impl Iterator<Item = &str> + '_ {
        self.by_provider.keys().map(String::as_str)
    }

    /// Streaming selection over the staging table: id, provider and every
    /// cleanable column cast to the type its rule reads.
    pub fn selection_sql(&self) -> String {
        let mut sql = String::from("SELECT id::bigint AS id, provider::text AS provider");
        for (column, rule) in self.columns() {
            let quoted = quote_ident(column);
            sql.push_str(&format!(", {quoted}::{} AS {quoted}", rule.sql_cast()));
        }
        sql.push_str(" FROM ");
        sql.push_str(&self.staging_table());
        sql
    }
}

fn ident_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z_][a-z0-9_]{0,47}$").expect("static regex"))
}

/// Table and column names come from configuration only, and must still be
/// plain lowercase identifiers.
pub fn validate_ident(name: &str) -> Result<()> {
    if ident_pattern().is_match(name) {
        Ok(())
    } else {
        Err(anyhow!("invalid SQL identifier {name:?}"))
    }
}

/// Double-quote an identifier already accepted by [`validate_ident`].
pub fn quote_ident(name: &str) -> String {
    format!("\"{name}\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_rules_apply_to_unknown_providers() {
        let config = CleanupConfig::with_defaults();
        let rules = config.resolve_rules("image", "flickr").unwrap();
        assert_eq!(rules.len(), 5);
        assert_eq!(rules.get("tags"), Some(&CleanupRule::Tags));
        assert_eq!(rules.get("thumbnail"), Some(&CleanupRule::Url));
    }

    #[test]
    fn provider_rules_override_per_field() {
        let config = CleanupConfig::default()
            .register("image", WILDCARD_PROVIDER, "url", CleanupRule::Url)
            .register("image", WILDCARD_PROVIDER, "tags", CleanupRule::Tags)
            .register("image", "museum", "creator_url", CleanupRule::Url);

        let museum = config.resolve_rules("image", "museum").unwrap();
        assert_eq!(
            museum.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["url", "tags", "creator_url"]
        );

        let other = config.resolve_rules("image", "flickr").unwrap();
        assert!(!other.contains_key("creator_url"));

        let table = config.table_rules("image").unwrap();
        assert_eq!(table.override_providers().collect::<Vec<_>>(), vec!["museum"]);
        assert_eq!(table.columns().count(), 3);
    }

    #[test]
    fn default_rules_keep_registration_order() {
        let rules = CleanupConfig::with_defaults()
            .resolve_rules("image", "flickr")
            .unwrap();
        assert_eq!(
            rules.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["tags", "url", "creator_url", "foreign_landing_url", "thumbnail"]
        );
    }

    #[test]
    fn providers_without_wildcard_get_no_rules() {
        let config = CleanupConfig::default().register("audio", "jamendo", "url", CleanupRule::Url);
        let table = config.table_rules("audio").unwrap();
        assert!(table.rules_for("freesound").is_empty());
        assert_eq!(table.rules_for("jamendo").len(), 1);
    }

    #[test]
    fn unknown_table_is_rejected() {
        let err = CleanupConfig::with_defaults().table_rules("audio").unwrap_err();
        assert!(err.to_string().contains("audio"));
    }

    #[test]
    fn identifiers_are_allow_listed() {
        let config = CleanupConfig::default().register(
            "image",
            WILDCARD_PROVIDER,
            "url = 'x'; DROP TABLE image; --",
            CleanupRule::Url,
        );
        assert!(config.table_rules("image").is_err());
        assert!(CleanupConfig::with_defaults()
            .table_rules("image; DROP")
            .is_err());
        assert!(validate_ident("foreign_landing_url").is_ok());
        assert!(validate_ident("Url").is_err());
    }

    #[test]
    fn conflicting_column_rules_are_rejected() {
        let config = CleanupConfig::default()
            .register("image", WILDCARD_PROVIDER, "url", CleanupRule::Url)
            .register("image", "odd", "url", CleanupRule::Tags);
        assert!(config.table_rules("image").is_err());
    }

    #[test]
    fn selection_casts_columns_by_rule() {
        let table = CleanupConfig::with_defaults().table_rules("image").unwrap();
        assert_eq!(table.staging_table(), "\"temp_import_image\"");
        assert_eq!(
            table.selection_sql(),
            "SELECT id::bigint AS id, provider::text AS provider, \
             \"creator_url\"::text AS \"creator_url\", \
             \"foreign_landing_url\"::text AS \"foreign_landing_url\", \
             \"tags\"::jsonb AS \"tags\", \
             \"thumbnail\"::text AS \"thumbnail\", \
             \"url\"::text AS \"url\" \
             FROM \"temp_import_image\""
        );
    }
}
