//! Session-level integration tests.

#[cfg(test)]
mod tests {
    use crate::components::ModelRef;
    use crate::core::{Config, Stage};
    use crate::feature::ConfigResolver;
    use crate::report::{builtin_postprocess, FilterColumns, Postprocess};
    use crate::run::{Run, RUN_FILE};
    use crate::session::{CollectingProgress, Session};
    use crate::testing::{
        failing_run, fake_run, FakePlatform, FakeTarget, RecordingBackend, StaticFrontend,
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::fs;
    use std::sync::Arc;

    fn session(root: &std::path::Path) -> Session {
        Session::new(0, root, Arc::new(ConfigResolver::default())).unwrap()
    }

    #[tokio::test]
    async fn test_failing_backend_is_isolated() {
        let root = tempfile::tempdir().unwrap();
        let mut session = session(root.path());
        session.add_run(fake_run("aww", 10)).unwrap();
        session.add_run(failing_run("vww")).unwrap();
        session.add_run(fake_run("resnet", 30)).unwrap();

        let outcome = session.process_runs(Stage::Run, 2, None).await.unwrap();

        let stages: Vec<Stage> = outcome.runs.iter().map(|o| o.stage).collect();
        assert_eq!(stages, vec![Stage::Run, Stage::Load, Stage::Run]);
        let failed: Vec<_> = outcome.failed().collect();
        assert_eq!(failed.len(), 1);
        let failure = failed[0].failure.as_ref().unwrap();
        assert_eq!(failed[0].index, 1);
        assert_eq!(failure.stage, Stage::Build);
        assert_eq!(failure.kind, "backend");
        assert_eq!(session.run(1).unwrap().artifacts(Stage::Load).len(), 1);
        assert!(session.runs().iter().all(|run| !run.is_active()));
    }

    #[tokio::test]
    async fn test_every_run_advanced_once_for_any_worker_count() {
        for workers in 1..=5 {
            let root = tempfile::tempdir().unwrap();
            let mut session = session(root.path());
            let mut logs = Vec::new();
            for i in 0..5 {
                let backend = RecordingBackend::new("tvmaot");
                logs.push(backend.log());
                session
                    .add_run(fake_run(&format!("model{i}"), 1).backend(Box::new(backend)))
                    .unwrap();
            }
            let progress = Arc::new(CollectingProgress::new());

            let outcome = session
                .process_runs(Stage::Done, workers, Some(progress.clone()))
                .await
                .unwrap();

            assert!(!outcome.has_failures(), "workers={workers}");
            assert!(outcome.runs.iter().all(|o| o.stage == Stage::Postprocess));
            assert!(logs.iter().all(|log| log.count("generate_code") == 1));
            assert_eq!(progress.len(), 5);
        }
    }

    #[tokio::test]
    async fn test_export_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let mut session = session(root.path());
        let run = session.add_run(fake_run("aww", 10)).unwrap();
        session.process_runs(Stage::Build, 1, None).await.unwrap();

        run.export_stage(Stage::Build, true, true).unwrap();
        let first = fs::read(run.dir().join("stage_2").join("aww.c")).unwrap();
        run.export_stage(Stage::Build, true, true).unwrap();
        let second = fs::read(run.dir().join("stage_2").join("aww.c")).unwrap();

        assert_eq!(first, second);
        assert!(run.dir().join("stage_2").join("tvmaot_out.log").exists());
    }

    #[tokio::test]
    async fn test_export_runs_writes_summaries() {
        let root = tempfile::tempdir().unwrap();
        let mut session = session(root.path());
        session.add_run(fake_run("aww", 10)).unwrap();
        session.add_run(fake_run("vww", 20)).unwrap();
        session.process_runs(Stage::Done, 2, None).await.unwrap();

        let written = session.export_runs().unwrap();

        assert_eq!(written.len(), 2);
        for (index, path) in written.iter().enumerate() {
            assert_eq!(path, &session.run_dir(index).join(RUN_FILE));
            assert!(fs::read_to_string(path).unwrap().starts_with("Run("));
        }
    }

    #[tokio::test]
    async fn test_session_report() {
        let root = tempfile::tempdir().unwrap();
        let mut session = session(root.path());
        session.add_run(fake_run("aww", 10).feature("debug")).unwrap();
        session.add_run(failing_run("vww")).unwrap();
        session.process_runs(Stage::Done, 2, None).await.unwrap();

        let features2cols = builtin_postprocess("features2cols", &Config::new()).unwrap();
        let filter: Arc<dyn Postprocess> =
            Arc::new(FilterColumns::drop(["Config", "Postprocesses"]));
        let report = session.report(&[features2cols, filter]).unwrap();

        assert_eq!(report.len(), 2);
        let rows = report.rows();
        assert_eq!(rows[0].get("Cycles"), Some(&json!(10)));
        assert_eq!(rows[0].get("feature_debug"), Some(&json!(true)));
        assert_eq!(rows[1].get("Failed Stage"), Some(&json!("BUILD")));
        assert!(rows[0].get("Config").is_none());
        assert!(report.columns().contains(&"Load Stage Time [s]".to_string()));

        let path = session.dir().join("report.csv");
        report.export(&path).unwrap();
        assert!(fs::read_to_string(path).unwrap().starts_with("Session,Run,Model"));
    }

    #[tokio::test]
    async fn test_feature_config_reaches_collaborators() {
        let root = tempfile::tempdir().unwrap();
        let mut session = session(root.path());
        let user = Config::new()
            .with("muriscvnn.lib", "/opt/muriscvnn/libmuriscvnn.a")
            .with("muriscvnn.inc_dir", "/opt/muriscvnn/include");
        let run = session
            .add_run(
                Run::builder(ModelRef::new("aww"))
                    .frontend(Arc::new(StaticFrontend::new("tflite")))
                    .framework("tflite")
                    .backend(Box::new(RecordingBackend::new("tflmi")))
                    .platform(Arc::new(FakePlatform::new("mlif")))
                    .target(Arc::new(FakeTarget::new("etiss_pulpino", 7)))
                    .feature("muriscvnn")
                    .config(&user),
            )
            .unwrap();

        let libs = run.config().get_list("mlif.tflite_micro_libs").unwrap();
        assert_eq!(libs, vec!["/opt/muriscvnn/libmuriscvnn.a"]);
        assert_eq!(run.config().get_str("tflite.extra_kernel").as_deref(), Some("muriscvnn"));

        session.process_runs(Stage::Run, 1, None).await.unwrap();
        assert_eq!(run.stage(), Stage::Run);
    }
}
