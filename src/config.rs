use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::env::EnvOverrides;
use crate::probe::EngineConfig;

/// Runtime configuration, read once from the process environment at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub database_url: String,
    /// Directory whose backing disk is measured for available storage.
    pub data_dir: PathBuf,
    pub engine: EngineConfig,
    pub overrides: EnvOverrides,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            port: 8080,
            database_url: "sqlite:./data/gpu_probe.db".to_string(),
            data_dir: PathBuf::from("."),
            engine: EngineConfig::default(),
            overrides: EnvOverrides::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; `from_env` passes `std::env::var`.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = AppConfig::default();
        let engine_defaults = EngineConfig::default();

        let engine = EngineConfig {
            chunk_cap: parse_or(&lookup, "PROBE_CHUNK_CAP_BYTES", engine_defaults.chunk_cap),
            max_copy_time: Duration::from_millis(parse_or(
                &lookup,
                "PROBE_COPY_TIMEOUT_MS",
                engine_defaults.max_copy_time.as_millis() as u64,
            )),
            storage_margin: parse_or(
                &lookup,
                "PROBE_STORAGE_MARGIN_BYTES",
                engine_defaults.storage_margin,
            ),
            verify_samples: parse_or(
                &lookup,
                "PROBE_VERIFY_SAMPLES",
                engine_defaults.verify_samples,
            )
            .max(1),
        };

        let overrides = EnvOverrides {
            gpu_support: parse_opt(&lookup, "PROBE_OVERRIDE_GPU_SUPPORT"),
            compute_support: parse_opt(&lookup, "PROBE_OVERRIDE_COMPUTE_SUPPORT"),
            storage_support: parse_opt(&lookup, "PROBE_OVERRIDE_STORAGE_SUPPORT"),
            available_storage: parse_opt(&lookup, "PROBE_OVERRIDE_AVAILABLE_STORAGE"),
            system_memory: parse_opt(&lookup, "PROBE_OVERRIDE_SYSTEM_MEMORY"),
        };

        AppConfig {
            port: parse_or(&lookup, "PORT", defaults.port),
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            data_dir: lookup("PROBE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            engine,
            overrides,
        }
    }
}

fn parse_opt<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().to_lowercase().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring unparseable value for {}: {:?}", key, raw);
            None
        }
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    parse_opt(lookup, key).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::{GIGABYTE, MEGABYTE};
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = AppConfig::from_lookup(lookup_from(&[]));
        assert_eq!(config.port, 8080);
        assert_eq!(config.engine.chunk_cap, 128 * MEGABYTE);
        assert_eq!(config.engine.storage_margin, 5 * GIGABYTE);
        assert_eq!(config.engine.max_copy_time, Duration::from_millis(5000));
        assert_eq!(config.overrides, EnvOverrides::default());
    }

    #[test]
    fn test_reads_engine_settings_and_overrides() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("PORT", "9000"),
            ("PROBE_CHUNK_CAP_BYTES", "1073741824"),
            ("PROBE_COPY_TIMEOUT_MS", "250"),
            ("PROBE_OVERRIDE_GPU_SUPPORT", "FALSE"),
            ("PROBE_OVERRIDE_AVAILABLE_STORAGE", "42"),
        ]));
        assert_eq!(config.port, 9000);
        assert_eq!(config.engine.chunk_cap, GIGABYTE);
        assert_eq!(config.engine.max_copy_time, Duration::from_millis(250));
        assert_eq!(config.overrides.gpu_support, Some(false));
        assert_eq!(config.overrides.available_storage, Some(42));
        assert_eq!(config.overrides.system_memory, None);
    }

    #[test]
    fn test_bad_values_fall_back() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("PORT", "not-a-port"),
            ("PROBE_VERIFY_SAMPLES", "0"),
            ("PROBE_OVERRIDE_STORAGE_SUPPORT", "maybe"),
        ]));
        assert_eq!(config.port, 8080);
        assert_eq!(config.engine.verify_samples, 1);
        assert_eq!(config.overrides.storage_support, None);
    }
}
