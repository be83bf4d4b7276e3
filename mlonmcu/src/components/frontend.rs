//! Frontend reading model files from disk.

use super::{Frontend, ModelRef, StageContext};
use crate::core::{Artifact, ArtifactFormat};
use crate::errors::CollaboratorError;
use async_trait::async_trait;
use std::path::Path;
use tracing::debug;

/// Reads the files of a model reference and wraps them as artifacts.
///
/// The format follows the file extension: `.tflite`, `.onnx`, `.pb` and
/// `.relay` files become model artifacts, `.tar` bundles become MLF
/// artifacts, anything else is kept raw and marked optional.
#[derive(Debug, Clone)]
pub struct FileFrontend {
    name: String,
}

impl FileFrontend {
    /// Creates a frontend with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

fn format_for(path: &Path) -> ArtifactFormat {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("tflite" | "onnx" | "pb" | "relay") => ArtifactFormat::Model,
        Some("tar") => ArtifactFormat::Mlf,
        Some("txt" | "json" | "yml" | "yaml") => ArtifactFormat::Text,
        _ => ArtifactFormat::Raw,
    }
}

#[async_trait]
impl Frontend for FileFrontend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate_models(
        &self,
        ctx: &StageContext<'_>,
        model: &ModelRef,
    ) -> Result<Vec<Artifact>, CollaboratorError> {
        if model.paths.is_empty() {
            return Err(CollaboratorError::frontend(
                &self.name,
                format!("model '{}' has no files", model.name),
            ));
        }

        let mut artifacts = Vec::with_capacity(model.paths.len());
        for (index, path) in model.paths.iter().enumerate() {
            let bytes = tokio::fs::read(path).await.map_err(|err| {
                CollaboratorError::frontend(&self.name, format!("{}: {err}", path.display()))
            })?;
            let name = path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or(&model.name)
                .to_string();
            let format = format_for(path);
            debug!(run = ctx.run, artifact = %name, %format, bytes = bytes.len(), "Loaded model file");

            let artifact = match format {
                ArtifactFormat::Text => {
                    Artifact::text(name, String::from_utf8_lossy(&bytes).into_owned(), format)
                }
                _ => Artifact::bytes(name, bytes, format),
            };
            // Only the primary model is mandatory for later stages.
            let artifact = if index == 0 || format == ArtifactFormat::Model {
                artifact
            } else {
                artifact.optional()
            };
            artifacts.push(artifact);
        }
        Ok(artifacts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Config, Stage};

    #[tokio::test]
    async fn test_reads_model_files() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("aww.tflite");
        let notes_path = dir.path().join("notes.txt");
        std::fs::write(&model_path, [0x54, 0x46, 0x4c, 0x33]).unwrap();
        std::fs::write(&notes_path, "quantized").unwrap();

        let config = Config::new();
        let ctx = StageContext {
            stage: Stage::Load,
            run: "[run-0]",
            working_dir: dir.path(),
            config: &config,
        };
        let model = ModelRef::new("aww").with_path(&model_path).with_path(&notes_path);

        let artifacts = FileFrontend::new("tflite")
            .generate_models(&ctx, &model)
            .await
            .unwrap();

        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[0].name(), "aww.tflite");
        assert_eq!(artifacts[0].format(), ArtifactFormat::Model);
        assert!(!artifacts[0].is_optional());
        assert_eq!(artifacts[1].as_text(), Some("quantized"));
        assert!(artifacts[1].is_optional());
    }

    #[tokio::test]
    async fn test_missing_file_is_frontend_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new();
        let ctx = StageContext {
            stage: Stage::Load,
            run: "[run-0]",
            working_dir: dir.path(),
            config: &config,
        };
        let model = ModelRef::new("ghost").with_path(dir.path().join("ghost.tflite"));

        let err = FileFrontend::new("tflite")
            .generate_models(&ctx, &model)
            .await
            .unwrap_err();

        assert_eq!(err.name, "tflite");
        assert!(err.message.contains("ghost.tflite"));
    }
}
