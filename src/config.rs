//! Grader configuration
//!
//! Loaded from a TOML file, then overridden from the environment. Every field
//! has a default, so an absent file yields a working (strict) configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::sandbox::ExecLimits;
use crate::tester::IoScoring;

const DEFAULT_CONFIG_PATH: &str = "./files/grader.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoConfig {
    pub scoring: IoScoring,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            scoring: IoScoring::Proportional,
        }
    }
}

/// Where `s3://` file paths are fetched from. Without an endpoint only local
/// paths resolve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobConfig {
    pub endpoint: Option<String>,
    pub port: u16,
    pub use_ssl: bool,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub region: String,
    /// Base for relative local paths
    pub local_root: Option<PathBuf>,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            port: 9000,
            use_ssl: false,
            access_key: "minioadmin".into(),
            secret_key: "minioadmin".into(),
            bucket: "grader-files".into(),
            region: "us-east-1".into(),
            local_root: None,
        }
    }
}

impl BlobConfig {
    pub fn endpoint_url(&self) -> Option<String> {
        let host = self.endpoint.as_deref()?;
        let scheme = if self.use_ssl { "https" } else { "http" };
        Some(format!("{}://{}:{}", scheme, host, self.port))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraderConfig {
    /// Number of runs executed concurrently
    pub workers: usize,
    /// Parent directory for per-run working directories
    pub work_root: PathBuf,
    /// Cap on the `output` field of a stored run
    pub output_limit_bytes: usize,
    /// Build tool invoked by the `make` builder
    pub make_program: String,
    pub redis_url: String,
    pub build: ExecLimits,
    pub test: ExecLimits,
    pub io: IoConfig,
    pub blobs: BlobConfig,
}

impl Default for GraderConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            work_root: std::env::temp_dir(),
            output_limit_bytes: 64 * 1024,
            make_program: "make".into(),
            redis_url: "redis://localhost:6379".into(),
            build: ExecLimits::build_profile(),
            test: ExecLimits::default(),
            io: IoConfig::default(),
            blobs: BlobConfig::default(),
        }
    }
}

impl GraderConfig {
    /// Load from `GRADER_CONFIG` (or the default path) and apply environment overrides
    pub fn load() -> Result<Self> {
        let path = std::env::var("GRADER_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        let mut config = Self::from_file(Path::new(&path))?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("Invalid config file {:?}", path))?;
        info!("Loaded grader configuration from {:?}", path);
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `GRADER_*`, `REDIS_URL` and `MINIO_*` overrides read through `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(workers) = lookup("GRADER_WORKERS") {
            self.workers = workers
                .parse()
                .with_context(|| format!("Invalid GRADER_WORKERS: {}", workers))?;
        }
        if let Some(root) = lookup("GRADER_WORK_ROOT") {
            self.work_root = PathBuf::from(root);
        }
        if let Some(limit) = lookup("GRADER_OUTPUT_LIMIT") {
            self.output_limit_bytes = limit
                .parse()
                .with_context(|| format!("Invalid GRADER_OUTPUT_LIMIT: {}", limit))?;
        }
        if let Some(make) = lookup("GRADER_MAKE") {
            self.make_program = make;
        }
        if let Some(url) = lookup("REDIS_URL") {
            self.redis_url = url;
        }

        let blobs = &mut self.blobs;
        if let Some(endpoint) = lookup("MINIO_ENDPOINT") {
            blobs.endpoint = Some(endpoint);
        }
        if let Some(port) = lookup("MINIO_PORT") {
            blobs.port = port
                .parse()
                .with_context(|| format!("Invalid MINIO_PORT: {}", port))?;
        }
        if let Some(ssl) = lookup("MINIO_USE_SSL") {
            blobs.use_ssl = ssl == "true" || ssl == "1";
        }
        if let Some(key) = lookup("MINIO_ACCESS_KEY") {
            blobs.access_key = key;
        }
        if let Some(key) = lookup("MINIO_SECRET_KEY") {
            blobs.secret_key = key;
        }
        if let Some(bucket) = lookup("MINIO_BUCKET") {
            blobs.bucket = bucket;
        }
        self.validate()
    }

    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            anyhow::bail!("workers must be at least 1");
        }
        for (name, limits) in [("build", &self.build), ("test", &self.test)] {
            if limits.wall_time_ms == 0 || limits.max_processes == 0 {
                anyhow::bail!("[{}] wall_time_ms and max_processes must be positive", name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio_test::assert_err;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = GraderConfig::from_toml(
            r#"
workers = 4

[test]
wall_time_ms = 2000
max_processes = 8

[io]
scoring = "all_or_nothing"
"#,
        )
        .unwrap();

        assert_eq!(config.workers, 4);
        assert_eq!(config.test.wall_time_ms, 2000);
        assert_eq!(config.test.max_processes, 8);
        assert_eq!(config.test.memory_mb, ExecLimits::default().memory_mb);
        assert_eq!(config.build, ExecLimits::build_profile());
        assert_eq!(config.io.scoring, IoScoring::AllOrNothing);
        assert_eq!(config.make_program, "make");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("GRADER_WORKERS", "3"),
            ("GRADER_WORK_ROOT", "/srv/runs"),
            ("REDIS_URL", "redis://cache:6379"),
        ]
        .into_iter()
        .collect();

        let mut config = GraderConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.workers, 3);
        assert_eq!(config.work_root, PathBuf::from("/srv/runs"));
        assert_eq!(config.redis_url, "redis://cache:6379");
        assert_eq!(config.blobs.endpoint_url(), None);
    }

    #[test]
    fn test_minio_settings() {
        let config = GraderConfig::from_toml(
            r#"
[blobs]
endpoint = "files.internal"
bucket = "course-files"
"#,
        )
        .unwrap();
        assert_eq!(config.blobs.endpoint_url().as_deref(), Some("http://files.internal:9000"));
        assert_eq!(config.blobs.bucket, "course-files");
        assert_eq!(config.blobs.access_key, "minioadmin");

        let env: HashMap<&str, &str> = [
            ("MINIO_ENDPOINT", "minio"),
            ("MINIO_PORT", "9443"),
            ("MINIO_USE_SSL", "true"),
            ("MINIO_SECRET_KEY", "s3cret"),
        ]
        .into_iter()
        .collect();
        let mut config = config;
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.blobs.endpoint_url().as_deref(), Some("https://minio:9443"));
        assert_eq!(config.blobs.secret_key, "s3cret");
        assert_eq!(config.blobs.bucket, "course-files");

        assert_err!(config.apply_overrides(|key| (key == "MINIO_PORT").then(|| "http".to_string())));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert_err!(GraderConfig::from_toml("workers = 0"));
        assert_err!(GraderConfig::from_toml("[test]\nmax_processes = 0"));

        let mut config = GraderConfig::default();
        assert_err!(config.apply_overrides(|key| (key == "GRADER_WORKERS").then(|| "many".to_string())));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = GraderConfig::from_file(Path::new("/nonexistent/grader.toml")).unwrap();
        assert_eq!(config, GraderConfig::default());
    }
}
