//! Artifacts produced by pipeline stages.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

/// A row of a tabular artifact.
pub type TableRow = BTreeMap<String, Value>;

/// The kind of content an artifact carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactFormat {
    /// Opaque bytes.
    Raw,
    /// Plain text (logs, summaries).
    Text,
    /// Generated source code.
    Source,
    /// A model file as produced by a frontend.
    Model,
    /// A model library format bundle (tar archive), unpacked on export.
    Mlf,
    /// A compiled program.
    Executable,
    /// Tabular results such as execution metrics.
    Table,
}

impl fmt::Display for ArtifactFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Raw => "raw",
            Self::Text => "text",
            Self::Source => "source",
            Self::Model => "model",
            Self::Mlf => "mlf",
            Self::Executable => "executable",
            Self::Table => "table",
        };
        f.write_str(name)
    }
}

/// Artifact payload.
#[derive(Clone, PartialEq)]
pub enum ArtifactData {
    /// Binary content.
    Bytes(Vec<u8>),
    /// Textual content.
    Text(String),
    /// Tabular content.
    Table(Vec<TableRow>),
}

impl fmt::Debug for ArtifactData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            Self::Text(text) => write!(f, "Text({} chars)", text.len()),
            Self::Table(rows) => write!(f, "Table({} rows)", rows.len()),
        }
    }
}

impl ArtifactData {
    /// Renders the payload as the bytes written on export.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Bytes(bytes) => bytes.clone(),
            Self::Text(text) => text.clone().into_bytes(),
            Self::Table(rows) => table_to_csv(rows).into_bytes(),
        }
    }
}

/// A named unit of output produced by a stage.
///
/// The payload never changes after construction. Exporting records where the
/// artifact was written so later stages can refer to it by path.
#[derive(Debug, Clone)]
pub struct Artifact {
    name: String,
    data: ArtifactData,
    format: ArtifactFormat,
    flags: BTreeSet<String>,
    optional: bool,
    path: Option<PathBuf>,
}

impl Artifact {
    fn with_data(name: impl Into<String>, data: ArtifactData, format: ArtifactFormat) -> Self {
        Self {
            name: name.into(),
            data,
            format,
            flags: BTreeSet::new(),
            optional: false,
            path: None,
        }
    }

    /// Creates a binary artifact.
    #[must_use]
    pub fn bytes(name: impl Into<String>, bytes: Vec<u8>, format: ArtifactFormat) -> Self {
        Self::with_data(name, ArtifactData::Bytes(bytes), format)
    }

    /// Creates a textual artifact.
    #[must_use]
    pub fn text(name: impl Into<String>, content: impl Into<String>, format: ArtifactFormat) -> Self {
        Self::with_data(name, ArtifactData::Text(content.into()), format)
    }

    /// Creates a tabular artifact.
    #[must_use]
    pub fn table(name: impl Into<String>, rows: Vec<TableRow>) -> Self {
        Self::with_data(name, ArtifactData::Table(rows), ArtifactFormat::Table)
    }

    /// Adds a flag.
    #[must_use]
    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.insert(flag.into());
        self
    }

    /// Marks the artifact as optional (skipped by default exports).
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Returns the artifact name (also its file name on export).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the payload.
    #[must_use]
    pub fn data(&self) -> &ArtifactData {
        &self.data
    }

    /// Returns the format.
    #[must_use]
    pub fn format(&self) -> ArtifactFormat {
        self.format
    }

    /// Returns the flags.
    #[must_use]
    pub fn flags(&self) -> &BTreeSet<String> {
        &self.flags
    }

    /// Returns true if the artifact carries the given flag.
    #[must_use]
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.contains(flag)
    }

    /// Returns true if the artifact is optional.
    #[must_use]
    pub fn is_optional(&self) -> bool {
        self.optional
    }

    /// Returns true once the artifact was written to disk.
    #[must_use]
    pub fn is_exported(&self) -> bool {
        self.path.is_some()
    }

    /// Returns the on-disk location of the last export.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns the text payload, if any.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match &self.data {
            ArtifactData::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Returns the table payload, if any.
    #[must_use]
    pub fn as_table(&self) -> Option<&[TableRow]> {
        match &self.data {
            ArtifactData::Table(rows) => Some(rows),
            _ => None,
        }
    }

    /// Writes the artifact into `dest`.
    ///
    /// With `extract`, MLF bundles are unpacked into `dest/<stem>/` instead
    /// of being copied as an archive. Existing files are overwritten and
    /// executables are made runnable.
    ///
    /// Names that are not a single plain file name are rejected with
    /// [`io::ErrorKind::InvalidInput`] so nothing is written outside `dest`.
    pub fn export(&mut self, dest: &Path, extract: bool) -> io::Result<PathBuf> {
        if !is_plain_file_name(&self.name) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("artifact name '{}' is not a plain file name", self.name),
            ));
        }
        fs::create_dir_all(dest)?;
        let path = if extract && self.format == ArtifactFormat::Mlf {
            let target = dest.join(self.stem());
            fs::create_dir_all(&target)?;
            let bytes = self.data.to_bytes();
            let mut archive = tar::Archive::new(bytes.as_slice());
            archive.set_overwrite(true);
            archive.unpack(&target)?;
            target
        } else {
            let target = dest.join(&self.name);
            fs::write(&target, self.data.to_bytes())?;
            #[cfg(unix)]
            if self.format == ArtifactFormat::Executable {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&target, fs::Permissions::from_mode(0o755))?;
            }
            target
        };
        self.path = Some(path.clone());
        Ok(path)
    }

    fn stem(&self) -> &str {
        self.name
            .strip_suffix(".tar")
            .or_else(|| Path::new(&self.name).file_stem().and_then(|s| s.to_str()))
            .unwrap_or(&self.name)
    }
}

fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Renders rows as CSV with the union of all columns as header.
#[must_use]
pub fn table_to_csv(rows: &[TableRow]) -> String {
    let columns: BTreeSet<&str> = rows
        .iter()
        .flat_map(|row| row.keys().map(String::as_str))
        .collect();
    let header: Vec<&str> = columns.into_iter().collect();
    let mut out = header.iter().map(|c| csv_escape(c)).collect::<Vec<_>>().join(",");
    out.push('\n');
    for row in rows {
        let line = header
            .iter()
            .map(|column| row.get(*column).map(csv_cell).unwrap_or_default())
            .collect::<Vec<_>>()
            .join(",");
        out.push_str(&line);
        out.push('\n');
    }
    out
}

pub(crate) fn csv_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => csv_escape(text),
        other => csv_escape(&other.to_string()),
    }
}

pub(crate) fn csv_escape(text: &str) -> String {
    if text.contains([',', '"', '\n']) {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mlf_bundle() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let content = b"{\"version\": 7}";
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "metadata.json", &content[..])
            .unwrap();
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_artifact_creation() {
        let artifact = Artifact::text("model.c", "int main;", ArtifactFormat::Source)
            .with_flag("codegen")
            .optional();

        assert_eq!(artifact.name(), "model.c");
        assert_eq!(artifact.format(), ArtifactFormat::Source);
        assert!(artifact.has_flag("codegen"));
        assert!(artifact.is_optional());
        assert!(!artifact.is_exported());
        assert_eq!(artifact.as_text(), Some("int main;"));
    }

    #[test]
    fn test_export_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut artifact = Artifact::bytes("model.tflite", vec![1, 2, 3], ArtifactFormat::Model);

        let path = artifact.export(dir.path(), false).unwrap();

        assert_eq!(path, dir.path().join("model.tflite"));
        assert_eq!(fs::read(&path).unwrap(), vec![1, 2, 3]);
        assert_eq!(artifact.path(), Some(path.as_path()));
    }

    #[test]
    fn test_export_rejects_names_leaving_dest() {
        let root = tempfile::tempdir().unwrap();
        let dest = root.path().join("run");

        for name in ["../escape.c", "/tmp/abs.c", "sub/dir.c", "..", ""] {
            let mut artifact = Artifact::text(name, "x", ArtifactFormat::Source);
            let err = artifact.export(&dest, false).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput, "{name}");
            assert!(artifact.path().is_none());
        }
        assert!(!root.path().join("escape.c").exists());
    }

    #[test]
    fn test_export_extracts_mlf() {
        let dir = tempfile::tempdir().unwrap();
        let mut artifact = Artifact::bytes("default.tar", mlf_bundle(), ArtifactFormat::Mlf);

        let path = artifact.export(dir.path(), true).unwrap();

        assert_eq!(path, dir.path().join("default"));
        let metadata = fs::read_to_string(path.join("metadata.json")).unwrap();
        assert!(metadata.contains("version"));

        // Unpacking again over the existing tree must succeed.
        artifact.export(dir.path(), true).unwrap();
    }

    #[test]
    fn test_table_to_csv() {
        let mut first = TableRow::new();
        first.insert("Cycles".into(), json!(1200));
        first.insert("Comment".into(), json!("a,b"));
        let mut second = TableRow::new();
        second.insert("Cycles".into(), json!(900));

        let csv = table_to_csv(&[first, second]);
        assert_eq!(csv, "Comment,Cycles\n\"a,b\",1200\n,900\n");
    }

    #[test]
    fn test_debug_hides_payload() {
        let artifact = Artifact::bytes("blob", vec![0; 4096], ArtifactFormat::Raw);
        let rendered = format!("{artifact:?}");
        assert!(rendered.contains("4096 bytes"));
    }
}
