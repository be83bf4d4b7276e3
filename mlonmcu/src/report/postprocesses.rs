//! Run and session post-processes.

use super::{Report, ReportRow};
use crate::core::{Artifact, ArtifactFormat, Config};
use crate::errors::{CollaboratorError, FlowError, ResolutionAmbiguity};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Hook invoked at the end of a run and at the end of a session.
pub trait Postprocess: Send + Sync + fmt::Debug {
    /// Returns the post-process name.
    fn name(&self) -> &str;

    /// Adjusts a run's result row; may return additional artifacts.
    fn post_run(
        &self,
        _row: &mut ReportRow,
        _artifacts: &[Artifact],
    ) -> Result<Vec<Artifact>, CollaboratorError> {
        Ok(Vec::new())
    }

    /// Adjusts the aggregated session report.
    fn post_session(&self, _report: &mut Report) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

/// Creates a built-in post-process, reading options from `<name>.<option>`.
pub fn builtin_postprocess(name: &str, config: &Config) -> Result<Arc<dyn Postprocess>, FlowError> {
    let postprocess: Arc<dyn Postprocess> = match name {
        "filter_cols" => Arc::new(FilterColumns::from_config(config)?),
        "rename_cols" => Arc::new(RenameColumns::from_config(config)?),
        "features2cols" => Arc::new(Features2Columns::from_config(config)),
        "config2cols" => Arc::new(Config2Columns::from_config(config)),
        "artifact2cols" => Arc::new(Artifact2Columns::from_config(config)?),
        other => return Err(FlowError::UnknownPostprocess(other.to_string())),
    };
    Ok(postprocess)
}

fn bool_option(options: &Config, key: &str, default: bool) -> bool {
    options.get_bool(key).unwrap_or(default)
}

fn mapping_option(options: &Config, key: &str) -> Result<BTreeMap<String, String>, FlowError> {
    let value = match options.get(key) {
        None | Some(Value::Null) => return Ok(BTreeMap::new()),
        Some(Value::String(text)) => serde_json::from_str(text)?,
        Some(value) => value.clone(),
    };
    let Value::Object(map) = value else {
        return Err(FlowError::Serialization(format!(
            "'{key}' must be a mapping"
        )));
    };
    Ok(map
        .into_iter()
        .map(|(from, to)| {
            let to = match to {
                Value::String(text) => text,
                other => other.to_string(),
            };
            (from, to)
        })
        .collect())
}

/// Drops unwanted report columns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterColumns {
    keep: Option<Vec<String>>,
    drop: Option<Vec<String>>,
    drop_nan: bool,
    drop_const: bool,
}

impl FilterColumns {
    /// Reads `filter_cols.{keep,drop,drop_nan,drop_const}`.
    ///
    /// Setting both `keep` and `drop` is ambiguous and rejected.
    pub fn from_config(config: &Config) -> Result<Self, ResolutionAmbiguity> {
        let options = config.scoped("filter_cols");
        let keep = options.get_list("keep");
        let drop = options.get_list("drop");
        if keep.is_some() && drop.is_some() {
            return Err(ResolutionAmbiguity::new("filter_cols", "keep", "drop"));
        }
        Ok(Self {
            keep,
            drop,
            drop_nan: bool_option(&options, "drop_nan", false),
            drop_const: bool_option(&options, "drop_const", false),
        })
    }

    /// Keeps only the listed columns.
    #[must_use]
    pub fn keep<I: IntoIterator<Item = S>, S: Into<String>>(columns: I) -> Self {
        Self {
            keep: Some(columns.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// Drops the listed columns.
    #[must_use]
    pub fn drop<I: IntoIterator<Item = S>, S: Into<String>>(columns: I) -> Self {
        Self {
            drop: Some(columns.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// Also drops columns without any value.
    #[must_use]
    pub fn with_drop_nan(mut self) -> Self {
        self.drop_nan = true;
        self
    }

    /// Also drops columns whose value is the same in every row.
    #[must_use]
    pub fn with_drop_const(mut self) -> Self {
        self.drop_const = true;
        self
    }

    fn removed_columns(&self, report: &Report, section: usize) -> BTreeSet<String> {
        let rows = report.rows();
        let cell = |row: &ReportRow, column: &str| -> Value {
            row.sections()[section].get(column).cloned().unwrap_or(Value::Null)
        };
        let mut removed = BTreeSet::new();
        for column in report.section_columns(section) {
            let values: Vec<Value> = rows.iter().map(|row| cell(row, &column)).collect();
            let all_null = values.iter().all(Value::is_null);
            // Missing values never compare equal, so all-null columns are left to `drop_nan`.
            let dropped = (self.drop_nan && all_null)
                || (self.drop_const && !all_null && values.windows(2).all(|pair| pair[0] == pair[1]))
                || self
                    .keep
                    .as_ref()
                    .is_some_and(|keep| !keep.contains(&column))
                || self
                    .drop
                    .as_ref()
                    .is_some_and(|drop| drop.contains(&column));
            if dropped {
                removed.insert(column);
            }
        }
        removed
    }
}

impl Postprocess for FilterColumns {
    fn name(&self) -> &str {
        "filter_cols"
    }

    fn post_session(&self, report: &mut Report) -> Result<(), CollaboratorError> {
        let removed: Vec<BTreeSet<String>> =
            (0..3).map(|section| self.removed_columns(report, section)).collect();
        for row in report.rows_mut() {
            for (section, removed) in row.sections_mut().into_iter().zip(&removed) {
                section.retain(|column| !removed.contains(column));
            }
        }
        Ok(())
    }
}

/// Renames report columns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenameColumns {
    mapping: BTreeMap<String, String>,
    merge: bool,
}

impl RenameColumns {
    /// Reads `rename_cols.mapping` (object or JSON string) and
    /// `rename_cols.merge` (default true).
    pub fn from_config(config: &Config) -> Result<Self, FlowError> {
        let options = config.scoped("rename_cols");
        Ok(Self {
            mapping: mapping_option(&options, "mapping")?,
            merge: bool_option(&options, "merge", true),
        })
    }

    /// Creates a post-process from a mapping.
    #[must_use]
    pub fn new(mapping: BTreeMap<String, String>, merge: bool) -> Self {
        Self { mapping, merge }
    }
}

impl Postprocess for RenameColumns {
    fn name(&self) -> &str {
        "rename_cols"
    }

    fn post_session(&self, report: &mut Report) -> Result<(), CollaboratorError> {
        let targets: BTreeSet<&String> = self.mapping.values().collect();
        if targets.len() != self.mapping.len() && !self.merge {
            warn!("rename_cols: non unique mapping found, use merge=true to avoid overwriting values");
        }
        for row in report.rows_mut() {
            for section in row.sections_mut() {
                for (from, to) in &self.mapping {
                    section.rename(from, to, self.merge);
                }
            }
        }
        Ok(())
    }
}

fn limit_allows(limit: &[String], name: &str) -> bool {
    limit.is_empty() || limit.iter().any(|item| item == name)
}

/// Explodes the `Features` column into one boolean column per feature.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Features2Columns {
    limit: Vec<String>,
    drop: bool,
}

impl Features2Columns {
    /// Reads `features2cols.limit` and `features2cols.drop` (default true).
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let options = config.scoped("features2cols");
        Self {
            limit: options.get_list("limit").unwrap_or_default(),
            drop: bool_option(&options, "drop", true),
        }
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str().map(String::from))
            .collect(),
        _ => Vec::new(),
    }
}

impl Postprocess for Features2Columns {
    fn name(&self) -> &str {
        "features2cols"
    }

    fn post_session(&self, report: &mut Report) -> Result<(), CollaboratorError> {
        let names: BTreeSet<String> = report
            .rows()
            .iter()
            .flat_map(|row| string_list(row.post.get("Features")))
            .filter(|name| limit_allows(&self.limit, name))
            .collect();
        if names.is_empty() {
            return Ok(());
        }
        for row in report.rows_mut() {
            let enabled = string_list(row.post.get("Features"));
            if self.drop {
                row.post.remove("Features");
            }
            for name in &names {
                row.post.set(format!("feature_{name}"), enabled.contains(name));
            }
        }
        Ok(())
    }
}

/// Explodes the `Config` column into one column per key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config2Columns {
    limit: Vec<String>,
    drop: bool,
}

impl Config2Columns {
    /// Reads `config2cols.limit` and `config2cols.drop` (default true).
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let options = config.scoped("config2cols");
        Self {
            limit: options.get_list("limit").unwrap_or_default(),
            drop: bool_option(&options, "drop", true),
        }
    }
}

impl Postprocess for Config2Columns {
    fn name(&self) -> &str {
        "config2cols"
    }

    fn post_session(&self, report: &mut Report) -> Result<(), CollaboratorError> {
        for row in report.rows_mut() {
            let Some(Value::Object(config)) = row.post.get("Config").cloned() else {
                continue;
            };
            if self.drop {
                row.post.remove("Config");
            }
            for (key, value) in config {
                if limit_allows(&self.limit, &key) {
                    row.post.set(format!("config_{key}"), value);
                }
            }
        }
        Ok(())
    }
}

/// Copies text artifacts into report columns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Artifact2Columns {
    file2colname: BTreeMap<String, String>,
}

impl Artifact2Columns {
    /// Reads `artifact2cols.file2colname` (object or JSON string).
    pub fn from_config(config: &Config) -> Result<Self, FlowError> {
        let options = config.scoped("artifact2cols");
        Ok(Self {
            file2colname: mapping_option(&options, "file2colname")?,
        })
    }

    /// Creates a post-process from an artifact-name to column mapping.
    #[must_use]
    pub fn new(file2colname: BTreeMap<String, String>) -> Self {
        Self { file2colname }
    }
}

impl Postprocess for Artifact2Columns {
    fn name(&self) -> &str {
        "artifact2cols"
    }

    fn post_run(
        &self,
        row: &mut ReportRow,
        artifacts: &[Artifact],
    ) -> Result<Vec<Artifact>, CollaboratorError> {
        for (file, column) in &self.file2colname {
            let Some(artifact) = artifacts.iter().find(|a| a.name() == file) else {
                row.main.set(column.clone(), "");
                continue;
            };
            match (artifact.format(), artifact.as_text()) {
                (ArtifactFormat::Text, Some(text)) => row.main.set(column.clone(), text),
                _ => {
                    return Err(CollaboratorError::postprocess(
                        self.name(),
                        format!("can only put text into report columns ('{file}')"),
                    ))
                }
            }
        }
        Ok(Vec::new())
    }
}
