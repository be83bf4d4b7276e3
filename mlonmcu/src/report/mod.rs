//! Tabular reports built from run results.
//!
//! Every run contributes one row. A row is split into three sections:
//! `pre` identifies the run, `main` holds metrics and stage times, `post`
//! holds features, configuration and failure details. Columns keep the
//! order in which they were first written.

mod postprocesses;

pub use postprocesses::{
    builtin_postprocess, Artifact2Columns, Config2Columns, Features2Columns, FilterColumns,
    Postprocess, RenameColumns,
};

use crate::core::csv_cell;
use crate::errors::{FlowError, Result};
use serde_json::{Map, Value};
use std::fmt;
use std::fs;
use std::path::Path;

/// Ordered column/value pairs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Section(Vec<(String, Value)>);

impl Section {
    /// Creates an empty section.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a column, keeping its position if it already exists.
    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        let column = column.into();
        let value = value.into();
        match self.0.iter_mut().find(|(name, _)| *name == column) {
            Some((_, slot)) => *slot = value,
            None => self.0.push((column, value)),
        }
    }

    /// Returns the value of a column.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    /// Removes a column.
    pub fn remove(&mut self, column: &str) -> Option<Value> {
        let index = self.0.iter().position(|(name, _)| name == column)?;
        Some(self.0.remove(index).1)
    }

    /// Returns true if the column exists.
    #[must_use]
    pub fn contains(&self, column: &str) -> bool {
        self.get(column).is_some()
    }

    /// Iterates over column names.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(name, _)| name.as_str())
    }

    /// Iterates over entries.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Returns the number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the section has no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Keeps only columns for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.0.retain(|(name, _)| keep(name));
    }

    /// Renames a column.
    ///
    /// When `to` already exists, `merge` keeps the existing value unless it is
    /// null; without `merge` the renamed value overwrites it.
    pub fn rename(&mut self, from: &str, to: &str, merge: bool) {
        if from == to {
            return;
        }
        let Some(index) = self.0.iter().position(|(name, _)| name == from) else {
            return;
        };
        let (_, value) = self.0.remove(index);
        match self.0.iter_mut().find(|(name, _)| name == to) {
            Some((_, existing)) => {
                if !merge || existing.is_null() {
                    *existing = value;
                }
            }
            None => self.0.insert(index, (to.to_string(), value)),
        }
    }
}

/// One report row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportRow {
    /// Identification columns.
    pub pre: Section,
    /// Metric columns.
    pub main: Section,
    /// Feature, config and failure columns.
    pub post: Section,
}

impl ReportRow {
    /// Creates an empty row.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks a column up in all sections.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.pre
            .get(column)
            .or_else(|| self.main.get(column))
            .or_else(|| self.post.get(column))
    }

    /// Returns the sections in order.
    #[must_use]
    pub fn sections(&self) -> [&Section; 3] {
        [&self.pre, &self.main, &self.post]
    }

    /// Returns the sections mutably, in order.
    pub fn sections_mut(&mut self) -> [&mut Section; 3] {
        [&mut self.pre, &mut self.main, &mut self.post]
    }

    /// Returns the row as a flat JSON object.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for section in self.sections() {
            for (column, value) in section.iter() {
                map.insert(column.to_string(), value.clone());
            }
        }
        Value::Object(map)
    }
}

/// The aggregated result of a session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Report {
    rows: Vec<ReportRow>,
}

impl Report {
    /// Creates an empty report.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a report from rows.
    #[must_use]
    pub fn from_rows(rows: Vec<ReportRow>) -> Self {
        Self { rows }
    }

    /// Appends a row.
    pub fn push(&mut self, row: ReportRow) {
        self.rows.push(row);
    }

    /// Returns the rows.
    #[must_use]
    pub fn rows(&self) -> &[ReportRow] {
        &self.rows
    }

    /// Returns the rows mutably.
    pub fn rows_mut(&mut self) -> &mut [ReportRow] {
        &mut self.rows
    }

    /// Returns the number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the report has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Returns the union of the column names of one section index
    /// (0 = pre, 1 = main, 2 = post), in first-seen order.
    #[must_use]
    pub fn section_columns(&self, section: usize) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        for row in &self.rows {
            if let Some(section) = row.sections().get(section) {
                for column in section.columns() {
                    if !columns.iter().any(|c| c == column) {
                        columns.push(column.to_string());
                    }
                }
            }
        }
        columns
    }

    /// Returns all column names: pre, then main, then post.
    #[must_use]
    pub fn columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        for index in 0..3 {
            for column in self.section_columns(index) {
                if !columns.contains(&column) {
                    columns.push(column);
                }
            }
        }
        columns
    }

    /// Returns the report as a JSON array of row objects.
    #[must_use]
    pub fn to_json(&self) -> Value {
        Value::Array(self.rows.iter().map(ReportRow::to_json).collect())
    }

    /// Renders the report as CSV. Lists and objects are written as JSON.
    #[must_use]
    pub fn to_csv(&self) -> String {
        let columns = self.columns();
        let mut out = columns
            .iter()
            .map(|c| csv_cell(&Value::String(c.clone())))
            .collect::<Vec<_>>()
            .join(",");
        out.push('\n');
        for row in &self.rows {
            let line = columns
                .iter()
                .map(|column| row.get(column).map(csv_cell).unwrap_or_default())
                .collect::<Vec<_>>()
                .join(",");
            out.push_str(&line);
            out.push('\n');
        }
        out
    }

    /// Writes the report; the format follows the extension (`.json`, `.csv`).
    pub fn export(&self, path: &Path) -> Result<()> {
        let content = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::to_string_pretty(&self.to_json())?,
            Some("csv") => self.to_csv(),
            other => {
                return Err(FlowError::Serialization(format!(
                    "unsupported report format '{}'",
                    other.unwrap_or_default()
                )))
            }
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_csv())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn row(run: u64, cycles: Option<u64>) -> ReportRow {
        let mut row = ReportRow::new();
        row.pre.set("Run", run);
        row.pre.set("Model", "aww");
        if let Some(cycles) = cycles {
            row.main.set("Cycles", cycles);
        }
        row.post.set("Features", json!(["debug"]));
        row
    }

    #[test]
    fn test_section_keeps_order() {
        let mut section = Section::new();
        section.set("b", 1);
        section.set("a", 2);
        section.set("b", 3);
        let columns: Vec<_> = section.columns().collect();
        assert_eq!(columns, vec!["b", "a"]);
        assert_eq!(section.get("b"), Some(&json!(3)));
    }

    #[test]
    fn test_section_rename_merge() {
        let mut section = Section::new();
        section.set("config_etiss.fpu", Value::Null);
        section.set("config_spike.fpu", true);
        section.rename("config_etiss.fpu", "FPU", true);
        section.rename("config_spike.fpu", "FPU", true);

        assert_eq!(section.get("FPU"), Some(&json!(true)));
        assert_eq!(section.len(), 1);
    }

    #[test]
    fn test_report_columns_union() {
        let report = Report::from_rows(vec![row(0, None), row(1, Some(99))]);
        assert_eq!(report.columns(), vec!["Run", "Model", "Cycles", "Features"]);
    }

    #[test]
    fn test_report_to_csv() {
        let report = Report::from_rows(vec![row(0, Some(10)), row(1, None)]);
        assert_eq!(
            report.to_csv(),
            "Run,Model,Cycles,Features\n0,aww,10,\"[\"\"debug\"\"]\"\n1,aww,,\"[\"\"debug\"\"]\"\n"
        );
    }

    #[test]
    fn test_report_export_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let report = Report::from_rows(vec![row(0, Some(10))]);

        report.export(&dir.path().join("report.json")).unwrap();
        report.export(&dir.path().join("report.csv")).unwrap();
        let err = report.export(&dir.path().join("report.xlsx")).unwrap_err();

        let json: Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("report.json")).unwrap())
                .unwrap();
        assert_eq!(json[0]["Cycles"], json!(10));
        assert!(fs::read_to_string(dir.path().join("report.csv"))
            .unwrap()
            .starts_with("Run,Model"));
        assert!(err.to_string().contains("xlsx"));
    }
}
