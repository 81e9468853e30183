//! APN table loaded from TOML.
//!
//! ```toml
//! [[apn]]
//! _id = 1
//! numeric = "310260"
//! name = "T-Mobile US"
//! apn = "fast.t-mobile.com"
//! type = "default,supl"
//! ```
//!
//! Column names are the carrier-table names. Values are kept as strings;
//! validation happens when the supervisor builds its catalog, so a bad row
//! is skipped there rather than rejected here.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use celldata_supervisor::apn::{columns, ApnRow};
use celldata_supervisor::collab::ApnTable;
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
struct TableFile {
    #[serde(default)]
    apn: Vec<BTreeMap<String, toml::Value>>,
}

/// Convert loose TOML tables into carrier-table rows.
pub fn rows_from_values(values: &[BTreeMap<String, toml::Value>]) -> Vec<ApnRow> {
    values
        .iter()
        .map(|table| {
            let mut row = ApnRow::new();
            for (column, value) in table {
                let text = match value {
                    toml::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                row.set(column, text);
            }
            row
        })
        .collect()
}

/// Shared, replaceable APN table.
#[derive(Debug, Clone, Default)]
pub struct SimApnTable {
    rows: Arc<Mutex<Vec<ApnRow>>>,
}

impl SimApnTable {
    pub fn new(rows: Vec<ApnRow>) -> Self {
        Self {
            rows: Arc::new(Mutex::new(rows)),
        }
    }

    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let file: TableFile = toml::from_str(input).context("invalid APN table TOML")?;
        Ok(Self::new(rows_from_values(&file.apn)))
    }

    /// Swap in a new table. The supervisor only sees it after an
    /// `ApnTableChanged` event.
    pub fn replace(&self, rows: Vec<ApnRow>) {
        *self.rows.lock().unwrap_or_else(|e| e.into_inner()) = rows;
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ApnTable for SimApnTable {
    fn rows_for_operator(&self, operator: &str) -> Vec<ApnRow> {
        self.rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|row| row.get(columns::NUMERIC) == Some(operator))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use celldata_supervisor::apn::ApnSetting;

    #[test]
    fn parse_table_and_filter_by_operator() {
        let table = SimApnTable::from_toml_str(
            r#"
            [[apn]]
            _id = 1
            numeric = "310260"
            name = "T-Mobile US"
            apn = "fast.t-mobile.com"
            type = "default,supl"
            authtype = 0

            [[apn]]
            _id = 7
            numeric = "310410"
            apn = "broadband"
            "#,
        )
        .unwrap();
        assert_eq!(table.len(), 2);

        let rows = table.rows_for_operator("310260");
        assert_eq!(rows.len(), 1);
        let setting = ApnSetting::from_row(&rows[0]).unwrap();
        assert_eq!(setting.id, 1);
        assert_eq!(setting.carrier, "T-Mobile US");
        assert_eq!(setting.auth_type, 0);
        assert!(table.rows_for_operator("222010").is_empty());
    }

    #[test]
    fn replace_swaps_rows() {
        let table = SimApnTable::default();
        assert!(table.is_empty());
        table.replace(vec![ApnRow::new().with(columns::NUMERIC, "310260")]);
        assert_eq!(table.rows_for_operator("310260").len(), 1);
    }

    #[test]
    fn malformed_toml_is_an_error() {
        assert!(SimApnTable::from_toml_str("[[apn]\n").is_err());
    }
}
