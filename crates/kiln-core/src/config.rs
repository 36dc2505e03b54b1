use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level engine configuration (loaded from kiln.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KilnConfig {
    /// Root directory for engine state (trash, store scratch, tmp files)
    pub dir: Option<PathBuf>,
    pub memo: MemoConfig,
    pub cache: CacheConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoConfig {
    /// Maximum concurrently executing operations (0 = available parallelism)
    pub jobs: usize,
    /// Operation hash algorithm: "xxh3" or "blake3"
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache directory (default: `<dir>/.cache`)
    pub dir: Option<PathBuf>,
    /// Trim target in MB for `trim` maintenance runs
    pub max_mb: u64,
    /// Percentage of `max_mb` to free when trimming
    pub trim_pct: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "text" or "json"
    pub format: String,
    /// Optional log file path
    pub file: Option<PathBuf>,
}

impl Default for MemoConfig {
    fn default() -> Self {
        Self {
            jobs: 0,
            hash: "xxh3".into(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_mb: 2048,
            trim_pct: 50,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            file: None,
        }
    }
}

impl KilnConfig {
    /// Parse a TOML config string.
    pub fn from_toml(s: &str) -> crate::KilnResult<Self> {
        toml::from_str(s).map_err(|e| crate::KilnError::Config(e.to_string()))
    }

    /// Apply environment overrides: `KILN_DIR`, `KILN_CACHE_DIR`, `KILN_LOG_FILE`.
    ///
    /// The surrounding driver recognizes these variables; the engine only
    /// consumes the resulting paths.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(dir) = std::env::var_os("KILN_DIR") {
            tracing::debug!(dir = %PathBuf::from(&dir).display(), "KILN_DIR override");
            self.dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = std::env::var_os("KILN_CACHE_DIR") {
            self.cache.dir = Some(PathBuf::from(dir));
        }
        if let Some(file) = std::env::var_os("KILN_LOG_FILE") {
            self.log.file = Some(PathBuf::from(file));
        }
        self
    }

    /// Effective engine state directory, defaulting to `_kiln` under `base`.
    pub fn dir_in(&self, base: &std::path::Path) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| base.join("_kiln"))
    }

    /// Effective cache directory, defaulting to `.cache` under the state dir.
    pub fn cache_dir_in(&self, base: &std::path::Path) -> PathBuf {
        self.cache
            .dir
            .clone()
            .unwrap_or_else(|| self.dir_in(base).join(".cache"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
dir = "/var/lib/kiln"

[memo]
jobs = 8
hash = "blake3"

[cache]
dir = "/var/cache/kiln"
max_mb = 4096
trim_pct = 30

[log]
level = "debug"
format = "json"
file = "/var/log/kiln.log"
"#;
        let config = KilnConfig::from_toml(toml_str).unwrap();

        assert_eq!(config.dir, Some(PathBuf::from("/var/lib/kiln")));
        assert_eq!(config.memo.jobs, 8);
        assert_eq!(config.memo.hash, "blake3");
        assert_eq!(config.cache.dir, Some(PathBuf::from("/var/cache/kiln")));
        assert_eq!(config.cache.max_mb, 4096);
        assert_eq!(config.cache.trim_pct, 30);
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.log.file, Some(PathBuf::from("/var/log/kiln.log")));
    }

    #[test]
    fn test_parse_defaults() {
        let config = KilnConfig::from_toml("").unwrap();

        assert_eq!(config.dir, None);
        assert_eq!(config.memo.jobs, 0);
        assert_eq!(config.memo.hash, "xxh3");
        assert_eq!(config.cache.max_mb, 2048);
        assert_eq!(config.cache.trim_pct, 50);
        assert_eq!(config.log.level, "info");
        assert_eq!(config.log.format, "text");
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[memo]
jobs = 2
"#;
        let config = KilnConfig::from_toml(toml_str).unwrap();

        // Overridden
        assert_eq!(config.memo.jobs, 2);
        // Defaults
        assert_eq!(config.memo.hash, "xxh3");
        assert_eq!(config.cache.max_mb, 2048);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = KilnConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed = KilnConfig::from_toml(&toml_str).unwrap();

        assert_eq!(config.memo.jobs, parsed.memo.jobs);
        assert_eq!(config.memo.hash, parsed.memo.hash);
        assert_eq!(config.cache.max_mb, parsed.cache.max_mb);
    }

    #[test]
    fn test_effective_dirs() {
        let config = KilnConfig::from_toml("").unwrap();
        let base = std::path::Path::new("/proj");
        assert_eq!(config.dir_in(base), PathBuf::from("/proj/_kiln"));
        assert_eq!(config.cache_dir_in(base), PathBuf::from("/proj/_kiln/.cache"));
    }
}
