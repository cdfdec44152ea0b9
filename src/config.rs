//! Worker configuration
//!
//! Read from the environment at startup (after `.env` is loaded). Every value
//! has a default; a value that is present but unparsable is a startup error.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ConfigError;
use crate::limits::{LimitPolicy, ResourceLimits, MIB};
use crate::sandbox::NetworkPolicy;

/// Isolate box ids per worker
const ISOLATE_MAX_CONCURRENT: usize = 1000;

/// Which isolation boundary the worker runs jobs in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxBackend {
    /// Native process sandbox (workspace directory, rlimits, namespaces, optional cgroups)
    Process,
    /// The `isolate` sandbox binary
    Isolate,
}

impl FromStr for SandboxBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "process" => Ok(SandboxBackend::Process),
            "isolate" => Ok(SandboxBackend::Isolate),
            _ => Err(ConfigError::invalid(
                "SANDBOX_BACKEND",
                s,
                "expected process or isolate",
            )),
        }
    }
}

impl fmt::Display for SandboxBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxBackend::Process => f.write_str("process"),
            SandboxBackend::Isolate => f.write_str("isolate"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub redis_url: String,
    pub backend: SandboxBackend,
    pub workspace_root: PathBuf,
    pub cgroup_root: Option<PathBuf>,
    pub network: NetworkPolicy,
    /// Replaces the embedded language table
    pub languages_config: Option<PathBuf>,
    pub max_concurrent_jobs: usize,
    /// Skip the Redis lease and use this id
    pub worker_id: Option<u32>,
    pub limits: LimitPolicy,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);
        let base = LimitPolicy::default();

        let backend = vars
            .parsed("SANDBOX_BACKEND")?
            .unwrap_or(SandboxBackend::Process);
        let max_concurrent_jobs = vars.parsed::<usize>("MAX_CONCURRENT_JOBS")?.unwrap_or(4);
        if max_concurrent_jobs == 0 {
            return Err(ConfigError::invalid(
                "MAX_CONCURRENT_JOBS",
                "0",
                "must be positive",
            ));
        }
        if backend == SandboxBackend::Isolate && max_concurrent_jobs > ISOLATE_MAX_CONCURRENT {
            return Err(ConfigError::invalid(
                "MAX_CONCURRENT_JOBS",
                max_concurrent_jobs.to_string(),
                format!(
                    "the isolate backend has {} boxes per worker",
                    ISOLATE_MAX_CONCURRENT
                ),
            ));
        }

        let limits = LimitPolicy {
            defaults: vars.limits("DEFAULT", &base.defaults)?,
            ceilings: vars.limits("MAX", &base.ceilings)?,
            compile: vars.limits("COMPILE", &base.compile)?,
        };

        Ok(Self {
            redis_url: vars
                .string("REDIS_URL")
                .unwrap_or_else(|| "redis://localhost:6379".into()),
            backend,
            workspace_root: vars
                .string("WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join("coderun")),
            cgroup_root: vars.string("CGROUP_ROOT").map(PathBuf::from),
            network: vars.parsed("NETWORK_POLICY")?.unwrap_or(NetworkPolicy::Deny),
            languages_config: vars.string("LANGUAGES_CONFIG").map(PathBuf::from),
            max_concurrent_jobs,
            worker_id: vars.parsed("WORKER_ID")?,
            limits,
        })
    }
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Non-empty trimmed value
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.string(key)
            .map(|value| {
                value
                    .parse::<T>()
                    .map_err(|e| ConfigError::invalid(key, value.as_str(), e.to_string()))
            })
            .transpose()
    }

    fn positive(&self, key: &str) -> Result<Option<u64>, ConfigError> {
        match self.parsed::<u64>(key)? {
            Some(0) => Err(ConfigError::invalid(key, "0", "must be positive")),
            other => Ok(other),
        }
    }

    /// `<PREFIX>_CPU_SECONDS`, `_MEMORY_MB`, `_WALL_SECONDS`, `_OUTPUT_BYTES` over `base`
    fn limits(&self, prefix: &str, base: &ResourceLimits) -> Result<ResourceLimits, ConfigError> {
        let key = |name: &str| format!("{}_{}", prefix, name);
        let output_bytes = match self.positive(&key("OUTPUT_BYTES"))? {
            Some(bytes) => usize::try_from(bytes).map_err(|e| {
                ConfigError::invalid(&key("OUTPUT_BYTES"), bytes.to_string(), e.to_string())
            })?,
            None => base.output_bytes,
        };

        let memory_bytes = match self.positive(&key("MEMORY_MB"))? {
            Some(mb) => mb.checked_mul(MIB).ok_or_else(|| {
                ConfigError::invalid(&key("MEMORY_MB"), mb.to_string(), "too large")
            })?,
            None => base.memory_bytes,
        };

        Ok(ResourceLimits {
            cpu_seconds: self.positive(&key("CPU_SECONDS"))?.unwrap_or(base.cpu_seconds),
            memory_bytes,
            wall_seconds: self.positive(&key("WALL_SECONDS"))?.unwrap_or(base.wall_seconds),
            output_bytes,
            ..*base
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<WorkerConfig, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.redis_url, "redis://localhost:6379");
        assert_eq!(config.backend, SandboxBackend::Process);
        assert_eq!(config.network, NetworkPolicy::Deny);
        assert_eq!(config.max_concurrent_jobs, 4);
        assert!(config.worker_id.is_none());
        assert!(config.cgroup_root.is_none());
        assert_eq!(config.limits, LimitPolicy::default());
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("SANDBOX_BACKEND", "isolate"),
            ("NETWORK_POLICY", "best-effort"),
            ("WORKSPACE_ROOT", "/srv/coderun"),
            ("CGROUP_ROOT", "/sys/fs/cgroup/coderun"),
            ("WORKER_ID", "3"),
            ("MAX_CONCURRENT_JOBS", "16"),
            ("DEFAULT_CPU_SECONDS", "2"),
            ("DEFAULT_MEMORY_MB", "128"),
            ("MAX_WALL_SECONDS", "120"),
            ("COMPILE_MEMORY_MB", "1024"),
        ])
        .unwrap();

        assert_eq!(config.backend, SandboxBackend::Isolate);
        assert_eq!(config.network, NetworkPolicy::BestEffort);
        assert_eq!(config.workspace_root, PathBuf::from("/srv/coderun"));
        assert_eq!(config.cgroup_root, Some(PathBuf::from("/sys/fs/cgroup/coderun")));
        assert_eq!(config.worker_id, Some(3));
        assert_eq!(config.max_concurrent_jobs, 16);
        assert_eq!(config.limits.defaults.cpu_seconds, 2);
        assert_eq!(config.limits.defaults.memory_bytes, 128 * MIB);
        assert_eq!(config.limits.defaults.wall_seconds, 10);
        assert_eq!(config.limits.ceilings.wall_seconds, 120);
        assert_eq!(config.limits.compile.memory_bytes, 1024 * MIB);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            config(&[("SANDBOX_BACKEND", "docker")]),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            config(&[("DEFAULT_CPU_SECONDS", "0")]),
            Err(ConfigError::Invalid { ref key, .. }) if key == "DEFAULT_CPU_SECONDS"
        ));
        assert!(matches!(
            config(&[("MAX_CONCURRENT_JOBS", "many")]),
            Err(ConfigError::Invalid { ref key, .. }) if key == "MAX_CONCURRENT_JOBS"
        ));
        assert!(config(&[("SANDBOX_BACKEND", "isolate"), ("MAX_CONCURRENT_JOBS", "1001")]).is_err());
        assert!(config(&[("SANDBOX_BACKEND", "process"), ("MAX_CONCURRENT_JOBS", "1001")]).is_ok());
    }

    #[test]
    fn test_memory_megabytes_overflow_rejected() {
        let huge = (u64::MAX / 1024).to_string();
        assert!(matches!(
            config(&[("MAX_MEMORY_MB", huge.as_str())]),
            Err(ConfigError::Invalid { ref key, .. }) if key == "MAX_MEMORY_MB"
        ));
        assert!(matches!(
            config(&[("DEFAULT_MEMORY_MB", "18446744073709551615")]),
            Err(ConfigError::Invalid { ref key, .. }) if key == "DEFAULT_MEMORY_MB"
        ));
    }

    #[test]
    fn test_blank_value_means_unset() {
        let config = config(&[("REDIS_URL", "  "), ("CGROUP_ROOT", "")]).unwrap();
        assert_eq!(config.redis_url, "redis://localhost:6379");
        assert!(config.cgroup_root.is_none());
    }
}
