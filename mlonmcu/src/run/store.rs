//! Per-run artifact storage.

use crate::core::{Artifact, ArtifactFormat, Stage};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

/// Artifacts of a run, grouped by the stage that produced them.
#[derive(Debug, Clone, Default)]
pub struct ArtifactStore {
    by_stage: BTreeMap<Stage, Vec<Artifact>>,
}

impl ArtifactStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the output of a completed stage, replacing earlier output.
    pub fn record(&mut self, stage: Stage, artifacts: Vec<Artifact>) {
        self.by_stage.insert(stage, artifacts);
    }

    /// Returns the artifacts of a stage.
    #[must_use]
    pub fn get(&self, stage: Stage) -> &[Artifact] {
        self.by_stage.get(&stage).map(Vec::as_slice).unwrap_or_default()
    }

    /// Returns true if the stage has recorded output.
    #[must_use]
    pub fn contains(&self, stage: Stage) -> bool {
        self.by_stage.contains_key(&stage)
    }

    /// Returns the stages with recorded output, in order.
    #[must_use]
    pub fn stages(&self) -> Vec<Stage> {
        self.by_stage.keys().copied().collect()
    }

    /// Iterates over all artifacts in stage order.
    pub fn iter(&self) -> impl Iterator<Item = &Artifact> {
        self.by_stage.values().flatten()
    }

    /// Returns the first artifact with the given name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&Artifact> {
        self.iter().find(|artifact| artifact.name() == name)
    }

    /// Returns the number of stored artifacts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_stage.values().map(Vec::len).sum()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes the artifacts of `stage` below `dir`.
    ///
    /// Optional artifacts are skipped unless `include_optional` is set. With
    /// `subdir` the files land in `dir/stage_<n>/`. MLF bundles are always
    /// unpacked.
    pub fn export_stage(
        &mut self,
        stage: Stage,
        dir: &Path,
        include_optional: bool,
        subdir: bool,
    ) -> io::Result<Vec<PathBuf>> {
        let Some(artifacts) = self.by_stage.get_mut(&stage) else {
            return Ok(Vec::new());
        };
        let dest = if subdir {
            dir.join(format!("stage_{}", stage.index()))
        } else {
            dir.to_path_buf()
        };
        artifacts
            .iter_mut()
            .filter(|artifact| include_optional || !artifact.is_optional())
            .map(|artifact| {
                let extract = artifact.format() == ArtifactFormat::Mlf;
                artifact.export(&dest, extract)
            })
            .collect()
    }

    /// Exports the first artifact of `stage` if needed and returns its path.
    ///
    /// The primary artifact is written even when it is optional.
    pub fn export_primary(&mut self, stage: Stage, dir: &Path) -> io::Result<Option<PathBuf>> {
        let Some(primary) = self.by_stage.get_mut(&stage).and_then(|a| a.first_mut()) else {
            return Ok(None);
        };
        if let Some(path) = primary.path() {
            return Ok(Some(path.to_path_buf()));
        }
        let extract = primary.format() == ArtifactFormat::Mlf;
        primary.export(dir, extract).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn store() -> ArtifactStore {
        let mut store = ArtifactStore::new();
        store.record(
            Stage::Build,
            vec![
                Artifact::text("model.c", "void run() {}", ArtifactFormat::Source),
                Artifact::text("tvmaot_out.log", "ok", ArtifactFormat::Text).optional(),
            ],
        );
        store
    }

    #[test]
    fn test_empty_before_record() {
        let store = ArtifactStore::new();
        assert!(store.get(Stage::Load).is_empty());
        assert!(!store.contains(Stage::Load));
        assert!(store.is_empty());
    }

    #[test]
    fn test_export_skips_optional() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store();

        let written = store.export_stage(Stage::Build, dir.path(), false, false).unwrap();

        assert_eq!(written, vec![dir.path().join("model.c")]);
        assert!(!dir.path().join("tvmaot_out.log").exists());
        assert!(store.get(Stage::Build)[0].is_exported());
        assert!(!store.get(Stage::Build)[1].is_exported());
    }

    #[test]
    fn test_export_with_optional_and_subdir() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store();

        let written = store.export_stage(Stage::Build, dir.path(), true, true).unwrap();

        assert_eq!(written.len(), 2);
        assert!(dir.path().join("stage_2").join("tvmaot_out.log").exists());
    }

    #[test]
    fn test_export_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store();

        store.export_stage(Stage::Build, dir.path(), true, false).unwrap();
        let first = fs::read(dir.path().join("model.c")).unwrap();
        store.export_stage(Stage::Build, dir.path(), true, false).unwrap();
        let second = fs::read(dir.path().join("model.c")).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_export_primary_includes_optional() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ArtifactStore::new();
        store.record(
            Stage::Load,
            vec![Artifact::bytes("aww.tflite", vec![1], ArtifactFormat::Model).optional()],
        );

        store.export_stage(Stage::Load, dir.path(), false, false).unwrap();
        let path = store.export_primary(Stage::Load, dir.path()).unwrap();

        assert_eq!(path, Some(dir.path().join("aww.tflite")));
        assert!(dir.path().join("aww.tflite").exists());
        assert_eq!(store.export_primary(Stage::Run, dir.path()).unwrap(), None);
    }
}
