//! Engine configuration and CPU capability detection.
//!
//! Everything here is resolved once, when an engine is built. Planning and
//! post-ops execution only ever read the resolved values.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Fallback when the L2 size cannot be read from the system.
pub const DEFAULT_L2_CACHE_PER_CORE: usize = 1024 * 1024;
pub const DEFAULT_CLIP_UPPER_BOUND: f32 = 6.0;
pub const DEFAULT_SCRATCHPAD_ALIGNMENT: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads; physical core count when unset.
    pub num_threads: Option<usize>,
    /// Bytes of L2 per core; read from sysfs when unset.
    pub l2_cache_per_core: Option<usize>,
    /// Clip activated outputs at `clip_upper_bound`. Only takes effect
    /// together with `int8_support`.
    pub relu_upper_bound: bool,
    pub int8_support: bool,
    pub clip_upper_bound: f32,
    /// Upper limit on a single plan's scratchpad.
    pub max_scratchpad_bytes: Option<usize>,
    pub scratchpad_alignment: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_threads: None,
            l2_cache_per_core: None,
            relu_upper_bound: false,
            int8_support: false,
            clip_upper_bound: DEFAULT_CLIP_UPPER_BOUND,
            max_scratchpad_bytes: None,
            scratchpad_alignment: DEFAULT_SCRATCHPAD_ALIGNMENT,
        }
    }
}

impl EngineConfig {
    /// Reads `KJARNI_NUM_THREADS`, `KJARNI_L2_CACHE_SIZE`,
    /// `KJARNI_RELU_UPPERBOUND`, `KJARNI_INT8_SUPPORT` and
    /// `KJARNI_MAX_SCRATCHPAD`. Unset variables keep their defaults; the
    /// boolean flags are integers where non-zero means enabled.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let int = |key: &str| -> Result<Option<usize>> {
            match lookup(key) {
                None => Ok(None),
                Some(raw) => raw
                    .trim()
                    .parse::<usize>()
                    .map(Some)
                    .with_context(|| format!("{key} must be a non-negative integer, got {raw:?}")),
            }
        };

        let config = Self {
            num_threads: int("KJARNI_NUM_THREADS")?.filter(|&n| n > 0),
            l2_cache_per_core: int("KJARNI_L2_CACHE_SIZE")?.filter(|&n| n > 0),
            relu_upper_bound: int("KJARNI_RELU_UPPERBOUND")?.is_some_and(|v| v != 0),
            int8_support: int("KJARNI_INT8_SUPPORT")?.is_some_and(|v| v != 0),
            max_scratchpad_bytes: int("KJARNI_MAX_SCRATCHPAD")?,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse engine config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read engine config {}", path.display()))?;
        Self::from_json_str(&json).with_context(|| format!("In {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        if !self.scratchpad_alignment.is_power_of_two() {
            bail!(
                "scratchpad_alignment must be a power of two, got {}",
                self.scratchpad_alignment
            );
        }
        if !self.clip_upper_bound.is_finite() {
            bail!("clip_upper_bound must be finite");
        }
        Ok(())
    }

    /// The clip stage runs only when both flags are on.
    pub fn clip_enabled(&self) -> bool {
        self.relu_upper_bound && self.int8_support
    }
}

/// Instruction-set capabilities relevant to the bf16 1x1 kernels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsaFeatures {
    pub avx512_core: bool,
    pub avx512_core_bf16: bool,
    pub amx_bf16: bool,
}

impl IsaFeatures {
    pub fn detect() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            let avx512_core = is_x86_feature_detected!("avx512f")
                && is_x86_feature_detected!("avx512bw")
                && is_x86_feature_detected!("avx512vl")
                && is_x86_feature_detected!("avx512dq");
            let flags = cpu_flags();
            let has = |flag: &str| flags.iter().any(|f| f == flag);
            Self {
                avx512_core,
                avx512_core_bf16: avx512_core && has("avx512_bf16"),
                amx_bf16: avx512_core && has("amx_bf16"),
            }
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            Self::default()
        }
    }

    /// A machine with every feature up to (but excluding) AMX.
    pub fn avx512_core_bf16() -> Self {
        Self {
            avx512_core: true,
            avx512_core_bf16: true,
            amx_bf16: false,
        }
    }
}

#[cfg(target_arch = "x86_64")]
fn cpu_flags() -> Vec<String> {
    #[cfg(target_os = "linux")]
    {
        if let Ok(cpuinfo) = std::fs::read_to_string("/proc/cpuinfo") {
            if let Some(line) = cpuinfo.lines().find(|l| l.starts_with("flags")) {
                return line
                    .split(':')
                    .nth(1)
                    .unwrap_or("")
                    .split_whitespace()
                    .map(str::to_string)
                    .collect();
            }
        }
    }
    Vec::new()
}

/// Resolved CPU engine: capabilities, thread budget and cache size.
#[derive(Debug, Clone, PartialEq)]
pub struct CpuEngine {
    isa: IsaFeatures,
    max_threads: usize,
    l2_cache_per_core: usize,
    config: EngineConfig,
}

impl CpuEngine {
    /// Detects the ISA and cache size of the running machine.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_isa(config, IsaFeatures::detect())
    }

    pub fn with_isa(config: EngineConfig, isa: IsaFeatures) -> Self {
        let max_threads = config
            .num_threads
            .unwrap_or_else(num_cpus::get_physical)
            .max(1);
        let l2_cache_per_core = config
            .l2_cache_per_core
            .or_else(read_l2_cache_size)
            .unwrap_or(DEFAULT_L2_CACHE_PER_CORE);
        Self {
            isa,
            max_threads,
            l2_cache_per_core,
            config,
        }
    }

    pub fn isa(&self) -> IsaFeatures {
        self.isa
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    pub fn l2_cache_per_core(&self) -> usize {
        self.l2_cache_per_core
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

fn read_l2_cache_size() -> Option<usize> {
    #[cfg(target_os = "linux")]
    {
        let raw = std::fs::read_to_string("/sys/devices/system/cpu/cpu0/cache/index2/size").ok()?;
        parse_cache_size(&raw)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

/// Parses sysfs cache sizes such as `1024K` or `2M`.
pub(crate) fn parse_cache_size(raw: &str) -> Option<usize> {
    let raw = raw.trim();
    let (digits, scale) = match raw.chars().last()? {
        'K' | 'k' => (&raw[..raw.len() - 1], 1024),
        'M' | 'm' => (&raw[..raw.len() - 1], 1024 * 1024),
        _ => (raw, 1),
    };
    digits.parse::<usize>().ok().map(|v| v * scale).filter(|&v| v > 0)
}

/// Builds the global rayon pool with the configured thread count.
///
/// Later calls are no-ops: rayon's global pool can only be set once.
pub fn configure_threading(config: &EngineConfig) -> usize {
    let num_threads = config
        .num_threads
        .unwrap_or_else(num_cpus::get_physical)
        .max(1);

    let _ = rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build_global();

    log::info!("Threading: {} threads", num_threads);
    num_threads
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn env_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert!(!config.clip_enabled());
    }

    #[test]
    fn env_flags_are_integers() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("KJARNI_NUM_THREADS", "4"),
            ("KJARNI_RELU_UPPERBOUND", "1"),
            ("KJARNI_INT8_SUPPORT", "2"),
            ("KJARNI_L2_CACHE_SIZE", "2097152"),
        ]))
        .unwrap();
        assert_eq!(config.num_threads, Some(4));
        assert_eq!(config.l2_cache_per_core, Some(2 * 1024 * 1024));
        assert!(config.clip_enabled());
    }

    #[test]
    fn clip_needs_both_flags() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("KJARNI_RELU_UPPERBOUND", "1"),
            ("KJARNI_INT8_SUPPORT", "0"),
        ]))
        .unwrap();
        assert!(!config.clip_enabled());
    }

    #[test]
    fn env_garbage_is_an_error() {
        let err = EngineConfig::from_lookup(lookup(&[("KJARNI_NUM_THREADS", "many")])).unwrap_err();
        assert!(err.to_string().contains("KJARNI_NUM_THREADS"));
    }

    #[test]
    fn json_partial_uses_defaults() {
        let config = EngineConfig::from_json_str(r#"{ "num_threads": 2, "int8_support": true }"#)
            .unwrap();
        assert_eq!(config.num_threads, Some(2));
        assert!(config.int8_support);
        assert_eq!(config.clip_upper_bound, DEFAULT_CLIP_UPPER_BOUND);
        assert_eq!(config.scratchpad_alignment, DEFAULT_SCRATCHPAD_ALIGNMENT);
    }

    #[test]
    fn json_rejects_bad_alignment() {
        assert!(EngineConfig::from_json_str(r#"{ "scratchpad_alignment": 48 }"#).is_err());
    }

    #[test]
    fn from_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        let config = EngineConfig {
            num_threads: Some(3),
            max_scratchpad_bytes: Some(1 << 20),
            ..EngineConfig::default()
        };
        std::fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();
        assert_eq!(EngineConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn missing_file_names_path() {
        let err = EngineConfig::from_file("/nonexistent/engine.json").unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/engine.json"));
    }

    #[test]
    fn engine_uses_configured_values() {
        let config = EngineConfig {
            num_threads: Some(7),
            l2_cache_per_core: Some(4096),
            ..EngineConfig::default()
        };
        let engine = CpuEngine::with_isa(config, IsaFeatures::avx512_core_bf16());
        assert_eq!(engine.max_threads(), 7);
        assert_eq!(engine.l2_cache_per_core(), 4096);
        assert!(engine.isa().avx512_core);
        assert!(!engine.isa().amx_bf16);
    }

    #[test]
    fn cache_size_parsing() {
        assert_eq!(parse_cache_size("1024K\n"), Some(1024 * 1024));
        assert_eq!(parse_cache_size("2M"), Some(2 * 1024 * 1024));
        assert_eq!(parse_cache_size("512"), Some(512));
        assert_eq!(parse_cache_size(""), None);
        assert_eq!(parse_cache_size("abcK"), None);
    }
}
