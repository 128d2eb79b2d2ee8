use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::time::Duration;

const MAX_MEMORY_MB: u64 = 4096;
const MAX_CPUS: f64 = 4.0;
const MAX_PIDS: i64 = 1024;
const MAX_OUTPUT_KB: usize = 64 * 1024;
const DEFAULT_OUTPUT_BYTES: usize = 1024 * 1024;
const MAX_TIMEOUT_SECS: u64 = 300;

/// Resource ceilings applied to every sandbox. There is no way to build an
/// unlimited value: every constructor validates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SandboxLimits {
    memory_bytes: i64,
    nano_cpus: i64,
    pids_limit: i64,
    /// Combined stdout and stderr a run may produce
    output_bytes: usize,
}

impl SandboxLimits {
    pub fn new(memory_mb: u64, cpus: f64, pids_limit: i64) -> Result<Self> {
        if memory_mb == 0 || memory_mb > MAX_MEMORY_MB {
            bail!("memory limit must be between 1 and {} MB, got {}", MAX_MEMORY_MB, memory_mb);
        }
        if !(cpus > 0.0 && cpus <= MAX_CPUS) {
            bail!("cpu limit must be in (0, {}], got {}", MAX_CPUS, cpus);
        }
        if pids_limit <= 0 || pids_limit > MAX_PIDS {
            bail!("pids limit must be between 1 and {}, got {}", MAX_PIDS, pids_limit);
        }

        Ok(Self {
            memory_bytes: (memory_mb * 1024 * 1024) as i64,
            nano_cpus: (cpus * 1_000_000_000.0) as i64,
            pids_limit,
            output_bytes: DEFAULT_OUTPUT_BYTES,
        })
    }

    pub fn with_output_limit_kb(self, output_kb: usize) -> Result<Self> {
        if output_kb == 0 || output_kb > MAX_OUTPUT_KB {
            bail!("output limit must be between 1 and {} KB, got {}", MAX_OUTPUT_KB, output_kb);
        }
        Ok(Self {
            output_bytes: output_kb * 1024,
            ..self
        })
    }

    pub fn memory_bytes(&self) -> i64 {
        self.memory_bytes
    }

    pub fn nano_cpus(&self) -> i64 {
        self.nano_cpus
    }

    pub fn pids_limit(&self) -> i64 {
        self.pids_limit
    }

    pub fn output_bytes(&self) -> usize {
        self.output_bytes
    }
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 256 * 1024 * 1024,
            nano_cpus: 500_000_000,
            pids_limit: 64,
            output_bytes: DEFAULT_OUTPUT_BYTES,
        }
    }
}

/// Worker configuration, read from the environment
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub redis_url: String,
    pub timeout: Duration,
    pub limits: SandboxLimits,
    pub concurrency: usize,
    pub languages_config: PathBuf,
}

impl WorkerSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let redis_url = lookup("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".to_string());

        let timeout_secs: u64 = parse_or(&lookup, "SANDBOX_TIMEOUT_SECS", 10)?;
        if timeout_secs == 0 || timeout_secs > MAX_TIMEOUT_SECS {
            bail!("SANDBOX_TIMEOUT_SECS must be between 1 and {}, got {}", MAX_TIMEOUT_SECS, timeout_secs);
        }

        let limits = SandboxLimits::new(
            parse_or(&lookup, "SANDBOX_MEMORY_MB", 256)?,
            parse_or(&lookup, "SANDBOX_CPUS", 0.5)?,
            parse_or(&lookup, "SANDBOX_PIDS_LIMIT", 64)?,
        )?
        .with_output_limit_kb(parse_or(&lookup, "SANDBOX_OUTPUT_LIMIT_KB", 1024)?)?;

        let concurrency: usize = parse_or(&lookup, "GRADER_CONCURRENCY", 1)?;
        if concurrency == 0 {
            bail!("GRADER_CONCURRENCY must be at least 1");
        }

        let languages_config = lookup("LANGUAGES_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("config/languages.json"));

        Ok(Self {
            redis_url,
            timeout: Duration::from_secs(timeout_secs),
            limits,
            concurrency,
            languages_config,
        })
    }
}

pub fn max_timeout() -> Duration {
    Duration::from_secs(MAX_TIMEOUT_SECS)
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: {:?}", key, raw)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Result<WorkerSettings> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        WorkerSettings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let s = settings(&[]).unwrap();
        assert_eq!(s.timeout, Duration::from_secs(10));
        assert_eq!(s.limits, SandboxLimits::default());
        assert_eq!(s.limits.output_bytes(), 1024 * 1024);
        assert_eq!(s.concurrency, 1);
        assert_eq!(s.languages_config, PathBuf::from("config/languages.json"));
    }

    #[test]
    fn test_overrides() {
        let s = settings(&[
            ("SANDBOX_TIMEOUT_SECS", "3"),
            ("SANDBOX_MEMORY_MB", "128"),
            ("SANDBOX_CPUS", "1"),
            ("GRADER_CONCURRENCY", "4"),
            ("SANDBOX_OUTPUT_LIMIT_KB", "64"),
        ])
        .unwrap();
        assert_eq!(s.limits.output_bytes(), 64 * 1024);
        assert_eq!(s.timeout, Duration::from_secs(3));
        assert_eq!(s.limits.memory_bytes(), 128 * 1024 * 1024);
        assert_eq!(s.limits.nano_cpus(), 1_000_000_000);
        assert_eq!(s.concurrency, 4);
    }

    #[test]
    fn test_limits_cannot_be_disabled() {
        assert!(settings(&[("SANDBOX_MEMORY_MB", "0")]).is_err());
        assert!(settings(&[("SANDBOX_CPUS", "0")]).is_err());
        assert!(settings(&[("SANDBOX_PIDS_LIMIT", "-1")]).is_err());
        assert!(settings(&[("SANDBOX_TIMEOUT_SECS", "0")]).is_err());
        assert!(settings(&[("SANDBOX_MEMORY_MB", "lots")]).is_err());
        assert!(settings(&[("SANDBOX_OUTPUT_LIMIT_KB", "0")]).is_err());
        assert!(SandboxLimits::new(8192, 0.5, 64).is_err());
        assert!(SandboxLimits::default().with_output_limit_kb(1 << 20).is_err());
    }
}
