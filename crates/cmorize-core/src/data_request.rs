//! Minimal model of the CMOR variable-table collaborator.
//!
//! Loading real CMIP6 table JSON (controlled vocabularies, cell methods,
//! dimension metadata) stays outside this crate; what the engine needs per
//! table is the approximate sampling interval, the frequency name and the
//! variable entries, so only that shape is mirrored here.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::frequency::{time_method_for, TimeMethod};

/// One variable entry as a table declares it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableEntry {
    pub unit: String,
    /// Per-variable frequency override; falls back to the table frequency.
    #[serde(default)]
    pub frequency: Option<String>,
}

/// One CMOR table: identity, sampling interval and its variable entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRequestTable {
    pub table_id: String,
    /// Approximate sampling interval in days, string-encoded as the table
    /// headers carry it.
    pub approx_interval: String,
    pub frequency_name: String,
    #[serde(default)]
    pub variables: BTreeMap<String, VariableEntry>,
}

impl DataRequestTable {
    pub fn variable_ids(&self) -> impl Iterator<Item = &str> {
        self.variables.keys().map(|k| k.as_str())
    }

    fn frequency_for(&self, entry: &VariableEntry) -> String {
        entry
            .frequency
            .clone()
            .unwrap_or_else(|| self.frequency_name.clone())
    }
}

/// One logical variable of the data request, possibly sourced from several
/// tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRequestVariable {
    pub variable_id: String,
    pub unit: String,
    pub time_method: TimeMethod,
    /// Source tables, in the order they were merged.
    pub tables: Vec<String>,
    /// Frequency name per source table, parallel to `tables`.
    pub frequencies: Vec<String>,
    /// Approximate interval per source table, parallel to `tables`.
    pub approx_intervals: Vec<String>,
}

impl DataRequestVariable {
    fn from_table_entry(variable_id: &str, entry: &VariableEntry, table: &DataRequestTable) -> Self {
        let frequency = table.frequency_for(entry);
        Self {
            variable_id: variable_id.to_string(),
            unit: entry.unit.clone(),
            time_method: time_method_for(&frequency),
            tables: vec![table.table_id.clone()],
            frequencies: vec![frequency],
            approx_intervals: vec![table.approx_interval.clone()],
        }
    }

    fn merge_table_entry(&mut self, entry: &VariableEntry, table: &DataRequestTable) {
        self.tables.push(table.table_id.clone());
        self.frequencies.push(table.frequency_for(entry));
        self.approx_intervals.push(table.approx_interval.clone());
    }

    /// The frequency declared by `table_id`, if this variable appears there.
    pub fn frequency_in_table(&self, table_id: &str) -> Option<&str> {
        self.tables
            .iter()
            .position(|t| t == table_id)
            .map(|idx| self.frequencies[idx].as_str())
    }
}

/// The merged set of variables across all loaded tables.
#[derive(Debug, Clone, Default)]
pub struct DataRequest {
    pub tables: Vec<DataRequestTable>,
    pub variables: Vec<DataRequestVariable>,
}

impl DataRequest {
    /// Merge variables with identical identifier, unit and time-method into
    /// one logical variable carrying the list of source tables. Entries that
    /// differ in unit or time-method stay distinct even when the identifier
    /// matches.
    pub fn from_tables(tables: Vec<DataRequestTable>) -> Self {
        let mut merged: Vec<DataRequestVariable> = Vec::new();
        for table in &tables {
            for (variable_id, entry) in &table.variables {
                let frequency = table.frequency_for(entry);
                let time_method = time_method_for(&frequency);
                let existing = merged.iter_mut().find(|v| {
                    v.variable_id == *variable_id
                        && v.unit == entry.unit
                        && v.time_method == time_method
                });
                match existing {
                    Some(variable) => variable.merge_table_entry(entry, table),
                    None => merged.push(DataRequestVariable::from_table_entry(
                        variable_id,
                        entry,
                        table,
                    )),
                }
            }
        }
        merged.sort_by(|a, b| {
            (&a.variable_id, &a.unit, a.time_method.to_string())
                .cmp(&(&b.variable_id, &b.unit, b.time_method.to_string()))
        });
        Self { tables, variables: merged }
    }

    pub fn find(&self, variable_id: &str) -> Option<&DataRequestVariable> {
        self.variables.iter().find(|v| v.variable_id == variable_id)
    }

    pub fn table(&self, table_id: &str) -> Option<&DataRequestTable> {
        self.tables.iter().find(|t| t.table_id == table_id)
    }
}
