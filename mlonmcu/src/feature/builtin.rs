//! Built-in feature catalogue.

use super::descriptor::{incompatible, CacheFlags, Capability, ComponentKind, FeatureDescriptor};
use crate::core::{Config, ConfigValue};
use crate::errors::ContractViolation;
use std::sync::Arc;

const TVM_BACKENDS: &[&str] = &["tvmaot", "tvmcg", "tvmrt"];

/// Returns every built-in descriptor.
#[must_use]
pub fn all() -> Vec<Arc<dyn FeatureDescriptor>> {
    vec![
        Arc::new(DebugArena),
        Arc::new(Muriscvnn),
        Arc::new(DebugBuild),
        Arc::new(GdbServer),
        Arc::new(EtissDebug),
        Arc::new(Trace),
        Arc::new(UnpackedApi),
        Arc::new(Packed),
        Arc::new(Memplan),
        Arc::new(Fusetile),
        Arc::new(Autotuned),
        Arc::new(Autotune),
    ]
}

fn enabled(options: &Config) -> bool {
    options.get_bool("enabled").unwrap_or(true)
}

fn check(
    feature: &str,
    kind: ComponentKind,
    component: &str,
    supported: &[&str],
) -> Result<(), ContractViolation> {
    if supported.contains(&component) {
        Ok(())
    } else {
        Err(incompatible(feature, kind, component))
    }
}

fn extend_list(current: &Config, key: &str, item: &str) -> ConfigValue {
    let mut items = current.get_list(key).unwrap_or_default();
    items.push(item.to_string());
    ConfigValue::from(items)
}

fn cmake_flag(current: &Config, flag: &str, on: bool) -> Config {
    let value = if on { "ON" } else { "OFF" };
    Config::new().with(
        "mlif.extra_cmake_args",
        extend_list(current, "mlif.extra_cmake_args", &format!("-D{flag}={value}")),
    )
}

/// Verbose printing of arena usage.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugArena;

impl FeatureDescriptor for DebugArena {
    fn name(&self) -> &'static str {
        "debug_arena"
    }

    fn description(&self) -> &'static str {
        "Enable verbose printing of arena usage for debugging."
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Backend, Capability::Compile]
    }

    fn backend_config(&self, backend: &str, options: &Config) -> Result<Config, ContractViolation> {
        check(self.name(), ComponentKind::Backend, backend, TVM_BACKENDS)?;
        Ok(Config::new().with(format!("{backend}.debug_arena"), enabled(options)))
    }

    fn compile_config(&self, options: &Config, current: &Config) -> Config {
        cmake_flag(current, "DEBUG_ARENA", enabled(options))
    }
}

/// CMSIS-NN style kernels for TFLite Micro.
#[derive(Debug, Clone, Copy, Default)]
pub struct Muriscvnn;

impl FeatureDescriptor for Muriscvnn {
    fn name(&self) -> &'static str {
        "muriscvnn"
    }

    fn description(&self) -> &'static str {
        "MuriscvNN CMSIS-NN wrappers for TFLite Micro."
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Setup, Capability::Framework, Capability::Compile]
    }

    fn required(&self) -> &'static [&'static str] {
        &["lib", "inc_dir"]
    }

    fn framework_config(&self, framework: &str, _options: &Config) -> Result<Config, ContractViolation> {
        check(self.name(), ComponentKind::Framework, framework, &["tflite"])?;
        Ok(Config::new().with(format!("{framework}.extra_kernel"), "muriscvnn"))
    }

    fn compile_config(&self, options: &Config, current: &Config) -> Config {
        let mut config = Config::new();
        if let Some(lib) = options.get_str("lib") {
            config.insert(
                "mlif.tflite_micro_libs",
                extend_list(current, "mlif.tflite_micro_libs", &lib),
            );
        }
        if let Some(inc) = options.get_str("inc_dir") {
            config.insert(
                "mlif.tflite_micro_incs",
                extend_list(current, "mlif.tflite_micro_incs", &inc),
            );
        }
        config.insert(
            "mlif.tflite_micro_extra_kernels",
            extend_list(current, "mlif.tflite_micro_extra_kernels", "muriscvnn"),
        );
        config
    }

    fn cache_flags(&self, _options: &Config) -> CacheFlags {
        CacheFlags::from([("tflmc.exe".to_string(), vec!["muriscvnn".to_string()])])
    }
}

/// Debuggable target software.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugBuild;

impl FeatureDescriptor for DebugBuild {
    fn name(&self) -> &'static str {
        "debug"
    }

    fn description(&self) -> &'static str {
        "Enable debugging ability of target software."
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Setup, Capability::Compile]
    }

    fn compile_config(&self, options: &Config, _current: &Config) -> Config {
        Config::new().with("mlif.debug", enabled(options))
    }
}

/// Remote debugging through gdbserver.
#[derive(Debug, Clone, Copy, Default)]
pub struct GdbServer;

impl FeatureDescriptor for GdbServer {
    fn name(&self) -> &'static str {
        "gdbserver"
    }

    fn description(&self) -> &'static str {
        "Start debugging session for target software using gdbserver."
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Target]
    }

    fn target_config(&self, target: &str, options: &Config) -> Result<Config, ContractViolation> {
        check(
            self.name(),
            ComponentKind::Target,
            target,
            &["host_x86", "etiss_pulpino"],
        )?;
        let mut config = Config::new().with(format!("{target}.gdbserver_enable"), enabled(options));
        config.insert_some(format!("{target}.gdbserver_attach"), options.get_bool("attach"));
        config.insert_some(format!("{target}.gdbserver_port"), options.get_u64("port"));
        Ok(config)
    }
}

/// Debug build of the ETISS simulator.
#[derive(Debug, Clone, Copy, Default)]
pub struct EtissDebug;

impl FeatureDescriptor for EtissDebug {
    fn name(&self) -> &'static str {
        "etissdbg"
    }

    fn description(&self) -> &'static str {
        "Debug ETISS internals."
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Setup, Capability::Target]
    }

    fn target_config(&self, target: &str, options: &Config) -> Result<Config, ContractViolation> {
        check(self.name(), ComponentKind::Target, target, &["etiss_pulpino"])?;
        Ok(Config::new().with("etiss_pulpino.debug_etiss", enabled(options)))
    }

    fn cache_flags(&self, options: &Config) -> CacheFlags {
        if !enabled(options) {
            return CacheFlags::new();
        }
        CacheFlags::from([
            ("etiss.install_dir".to_string(), vec!["debug".to_string()]),
            ("etissvp.script".to_string(), vec!["debug".to_string()]),
        ])
    }
}

/// Memory access tracing in ETISS.
#[derive(Debug, Clone, Copy, Default)]
pub struct Trace;

impl FeatureDescriptor for Trace {
    fn name(&self) -> &'static str {
        "trace"
    }

    fn description(&self) -> &'static str {
        "Enable tracing of all memory accesses in ETISS."
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Target]
    }

    fn target_config(&self, target: &str, options: &Config) -> Result<Config, ContractViolation> {
        check(self.name(), ComponentKind::Target, target, &["etiss_pulpino"])?;
        Ok(Config::new().with("etiss_pulpino.trace_memory", enabled(options)))
    }
}

/// Unpacked interface API for the AoT executor.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnpackedApi;

impl FeatureDescriptor for UnpackedApi {
    fn name(&self) -> &'static str {
        "unpacked_api"
    }

    fn description(&self) -> &'static str {
        "Use unpacked interface api for TVMAOT backend to reduce stack usage."
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Backend]
    }

    fn backend_config(&self, backend: &str, options: &Config) -> Result<Config, ContractViolation> {
        check(self.name(), ComponentKind::Backend, backend, &["tvmaot"])?;
        Ok(Config::new().with(format!("{backend}.unpacked_api"), enabled(options)))
    }
}

/// Sub-8-bit and sparse weights for TFLite Micro.
#[derive(Debug, Clone, Copy, Default)]
pub struct Packed;

impl FeatureDescriptor for Packed {
    fn name(&self) -> &'static str {
        "packed"
    }

    fn description(&self) -> &'static str {
        "Sub-8-bit and sparsity feature for TFLite Micro kernels."
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Frontend, Capability::Setup, Capability::Compile]
    }

    fn frontend_config(&self, frontend: &str, options: &Config) -> Result<Config, ContractViolation> {
        check(self.name(), ComponentKind::Frontend, frontend, &["tflite"])?;
        Ok(Config::new().with(format!("{frontend}.use_packed_weights"), enabled(options)))
    }

    fn compile_config(&self, options: &Config, current: &Config) -> Config {
        cmake_flag(current, "PACKED", enabled(options))
    }

    fn cache_flags(&self, _options: &Config) -> CacheFlags {
        CacheFlags::from([("tflmc.exe".to_string(), vec!["packed".to_string()])])
    }
}

/// Custom TVM memory planning.
#[derive(Debug, Clone, Copy, Default)]
pub struct Memplan;

impl FeatureDescriptor for Memplan {
    fn name(&self) -> &'static str {
        "memplan"
    }

    fn description(&self) -> &'static str {
        "Custom TVM memory planning."
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Framework]
    }

    fn framework_config(&self, framework: &str, options: &Config) -> Result<Config, ContractViolation> {
        check(self.name(), ComponentKind::Framework, framework, &["tvm"])?;
        Ok(Config::new().with("tvm.memplan_enable", enabled(options)))
    }
}

/// Operator fusion and tiling in TVM.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fusetile;

impl FeatureDescriptor for Fusetile {
    fn name(&self) -> &'static str {
        "fusetile"
    }

    fn description(&self) -> &'static str {
        "Fused tiling of TVM operators."
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Framework]
    }

    fn framework_config(&self, framework: &str, options: &Config) -> Result<Config, ContractViolation> {
        check(self.name(), ComponentKind::Framework, framework, &["tvm"])?;
        Ok(Config::new().with("tvm.fusetile_enable", enabled(options)))
    }
}

/// Reuse of existing tuning logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Autotuned;

impl FeatureDescriptor for Autotuned {
    fn name(&self) -> &'static str {
        "autotuned"
    }

    fn description(&self) -> &'static str {
        "Use existing TVM autotuning logs in backend."
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Backend]
    }

    fn backend_config(&self, backend: &str, options: &Config) -> Result<Config, ContractViolation> {
        check(self.name(), ComponentKind::Backend, backend, TVM_BACKENDS)?;
        let mut config = Config::new().with(format!("{backend}.autotuning_tuned"), enabled(options));
        config.insert_some(
            format!("{backend}.autotuning_results_file"),
            options.get_str("results_file"),
        );
        Ok(config)
    }
}

/// Tuning inside the backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct Autotune;

impl FeatureDescriptor for Autotune {
    fn name(&self) -> &'static str {
        "autotune"
    }

    fn description(&self) -> &'static str {
        "Use the TVM autotuner inside the backend to generate tuning logs."
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Backend]
    }

    fn backend_config(&self, backend: &str, options: &Config) -> Result<Config, ContractViolation> {
        check(self.name(), ComponentKind::Backend, backend, TVM_BACKENDS)?;
        let mut config = Config::new().with(format!("{backend}.autotuning_enable"), enabled(options));
        config.insert_some(
            format!("{backend}.autotuning_results_file"),
            options.get_str("results_file"),
        );
        config.insert_some(format!("{backend}.autotuning_append"), options.get_bool("append"));
        config.insert_some(format!("{backend}.autotuning_tuner"), options.get_str("tuner"));
        for key in ["trials", "early_stopping", "num_workers", "max_parallel"] {
            config.insert_some(format!("{backend}.autotuning_{key}"), options.get_u64(key));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn on() -> Config {
        Config::new().with("enabled", true)
    }

    #[test]
    fn test_catalogue_names_are_unique() {
        let mut names: Vec<_> = all().iter().map(|d| d.name()).collect();
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total);
        assert_eq!(total, 12);
    }

    #[test]
    fn test_unpacked_api_only_for_tvmaot() {
        let config = UnpackedApi.backend_config("tvmaot", &on()).unwrap();
        assert_eq!(config.get_bool("tvmaot.unpacked_api"), Some(true));

        let err = UnpackedApi.backend_config("tvmrt", &on()).unwrap_err();
        assert!(err.to_string().contains("'unpacked_api'"));
    }

    #[test]
    fn test_gdbserver_skips_unset_options() {
        let config = GdbServer.target_config("host_x86", &on()).unwrap();
        assert_eq!(config.len(), 1);

        let options = on().with("port", "2222").with("attach", true);
        let config = GdbServer.target_config("host_x86", &options).unwrap();
        assert_eq!(config.get("host_x86.gdbserver_port"), Some(&json!(2222)));
        assert_eq!(config.get_bool("host_x86.gdbserver_attach"), Some(true));
    }

    #[test]
    fn test_muriscvnn_extends_lists() {
        let options = on().with("lib", "/opt/libmuriscvnn.a").with("inc_dir", "/opt/inc");
        let current = Config::new().with("mlif.tflite_micro_libs", json!(["/opt/libcmsis.a"]));

        let config = Muriscvnn.compile_config(&options, &current);

        assert_eq!(
            config.get("mlif.tflite_micro_libs"),
            Some(&json!(["/opt/libcmsis.a", "/opt/libmuriscvnn.a"]))
        );
        assert_eq!(config.get("mlif.tflite_micro_incs"), Some(&json!(["/opt/inc"])));
        assert_eq!(
            config.get("mlif.tflite_micro_extra_kernels"),
            Some(&json!(["muriscvnn"]))
        );
    }

    #[test]
    fn test_etissdbg_cache_flags_depend_on_enabled() {
        assert_eq!(EtissDebug.cache_flags(&on()).len(), 2);
        assert!(EtissDebug
            .cache_flags(&Config::new().with("enabled", false))
            .is_empty());
    }

    #[test]
    fn test_autotune_options() {
        let options = on().with("trials", 100).with("tuner", "xgb");
        let config = Autotune.backend_config("tvmrt", &options).unwrap();
        assert_eq!(config.get_u64("tvmrt.autotuning_trials"), Some(100));
        assert_eq!(config.get_str("tvmrt.autotuning_tuner"), Some("xgb".to_string()));
        assert!(!config.contains_key("tvmrt.autotuning_num_workers"));
    }
}
