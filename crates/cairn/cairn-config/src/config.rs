use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Runtime tunables for the valuation pool and pipeline orchestrator.
///
/// Values load from a TOML file, with every field defaulted, and the
/// `CAIRN_*` environment toggles applied on top.
#[derive(Deserialize, Debug, Clone)]
pub struct RuntimeConfig {
    /// CRC verification of bus blocks at pipeline handoff boundaries.
    #[serde(default = "defaults::integrity_checks")]
    pub integrity_checks: bool,

    /// Emit per-stage timing events through `tracing`.
    #[serde(default = "defaults::timing_log")]
    pub timing_log: bool,

    /// Give every worker a private copy of the inputs instead of zero-copy
    /// views (the degraded mode for hosts without shared memory).
    #[serde(default = "defaults::force_copy_transport")]
    pub force_copy_transport: bool,

    /// Upper bound on total shared-region bytes; unlimited when absent.
    #[serde(default)]
    pub max_memory_bytes: Option<u64>,

    /// Deadline for one chunk execution before the watchdog intervenes.
    #[serde(default = "defaults::chunk_timeout_ms")]
    pub chunk_timeout_ms: u64,

    /// Per-edge producer wait deadline in pipelines.
    #[serde(default = "defaults::handoff_timeout_ms")]
    pub handoff_timeout_ms: u64,

    /// Worker attach/engine-init deadline at pool initialization.
    #[serde(default = "defaults::init_timeout_ms")]
    pub init_timeout_ms: u64,

    /// Largest scenario count per chunk; smaller chunks cancel faster.
    #[serde(default = "defaults::scenario_chunk_size")]
    pub scenario_chunk_size: u32,

    /// Slots per worker deque. Must be a power of two.
    #[serde(default = "defaults::deque_capacity")]
    pub deque_capacity: u32,

    /// Directory for file-backed segments; anonymous mappings when absent.
    #[serde(default)]
    pub segment_dir: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {field} {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

mod defaults {
    pub fn integrity_checks() -> bool {
        true
    }

    pub fn timing_log() -> bool {
        false
    }

    pub fn force_copy_transport() -> bool {
        false
    }

    pub fn chunk_timeout_ms() -> u64 {
        120_000
    }

    pub fn handoff_timeout_ms() -> u64 {
        30_000
    }

    pub fn init_timeout_ms() -> u64 {
        30_000
    }

    pub fn scenario_chunk_size() -> u32 {
        2_500
    }

    pub fn deque_capacity() -> u32 {
        1024
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty config must default cleanly")
    }
}

impl RuntimeConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let mut config: RuntimeConfig = toml::from_str(&raw)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults with the environment toggles applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        fn flag(name: &str) -> Option<bool> {
            std::env::var(name).ok().map(|v| {
                matches!(v.trim(), "1" | "true" | "TRUE" | "yes" | "on")
            })
        }
        fn number<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
        }

        if let Some(v) = flag("CAIRN_INTEGRITY_CHECKS") {
            self.integrity_checks = v;
        }
        if let Some(v) = flag("CAIRN_TIMING_LOG") {
            self.timing_log = v;
        }
        if let Some(v) = flag("CAIRN_FORCE_COPY_TRANSPORT") {
            self.force_copy_transport = v;
        }
        if let Some(v) = number("CAIRN_MAX_MEMORY_BYTES") {
            self.max_memory_bytes = Some(v);
        }
        if let Some(v) = number("CAIRN_CHUNK_TIMEOUT_MS") {
            self.chunk_timeout_ms = v;
        }
        if let Some(v) = number("CAIRN_HANDOFF_TIMEOUT_MS") {
            self.handoff_timeout_ms = v;
        }
        if let Some(v) = number("CAIRN_SCENARIO_CHUNK_SIZE") {
            self.scenario_chunk_size = v;
        }
        if let Some(v) = number("CAIRN_DEQUE_CAPACITY") {
            self.deque_capacity = v;
        }
        if let Ok(dir) = std::env::var("CAIRN_SEGMENT_DIR") {
            self.segment_dir = Some(PathBuf::from(dir));
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.deque_capacity.is_power_of_two() {
            return Err(ConfigError::Invalid {
                field: "deque_capacity",
                reason: "must be a power of two",
            });
        }
        if self.scenario_chunk_size == 0 {
            return Err(ConfigError::Invalid {
                field: "scenario_chunk_size",
                reason: "must be non-zero",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = RuntimeConfig::default();
        assert!(c.integrity_checks);
        assert!(!c.timing_log);
        assert!(!c.force_copy_transport);
        assert_eq!(c.chunk_timeout_ms, 120_000);
        assert_eq!(c.handoff_timeout_ms, 30_000);
        assert_eq!(c.deque_capacity, 1024);
        assert!(c.max_memory_bytes.is_none());
        assert!(c.segment_dir.is_none());
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let c: RuntimeConfig = toml::from_str(
            r#"
            integrity_checks = false
            scenario_chunk_size = 500
            "#,
        )
        .unwrap();
        assert!(!c.integrity_checks);
        assert_eq!(c.scenario_chunk_size, 500);
        assert_eq!(c.chunk_timeout_ms, 120_000);
    }

    #[test]
    fn bad_deque_capacity_is_rejected() {
        let mut c = RuntimeConfig::default();
        c.deque_capacity = 100;
        assert!(matches!(
            c.validate(),
            Err(ConfigError::Invalid {
                field: "deque_capacity",
                ..
            })
        ));
    }
}
