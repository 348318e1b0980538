use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{VltError, VltResult};

/// Top-level configuration (loaded from vlt.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VltConfig {
    pub storage: StorageConfig,
    pub crypto: CryptoConfig,
    pub index: IndexConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend kind: "local", "s3" or "memory"
    pub backend: String,
    /// Root directory for the local backend, or key prefix inside the bucket
    pub root: String,
    /// S3 endpoint
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    /// Bucket name
    pub bucket: String,
    /// Refuse plaintext HTTP endpoints instead of warning
    pub enforce_tls: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "local".into(),
            root: "~/.local/share/vlt".into(),
            endpoint: "http://localhost:9000".into(),
            region: "us-east-1".into(),
            bucket: "vlt".into(),
            enforce_tls: false,
        }
    }
}

/// Argon2id parameters applied to newly created passphrase slots.
///
/// Existing slots keep the parameters they were created with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Argon2id memory cost in KiB (default: 81920 = 80 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 4)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 2)
    pub argon2_parallelism: u32,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            argon2_mem_cost_kib: 80 * 1024,
            argon2_time_cost: 4,
            argon2_parallelism: 2,
        }
    }
}

impl CryptoConfig {
    /// Apply `VLT_ARGON2_MEMORY`, `VLT_ARGON2_ITERATIONS` and
    /// `VLT_ARGON2_PARALLELISM`. Unparseable or zero values are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_u32("VLT_ARGON2_MEMORY") {
            self.argon2_mem_cost_kib = v;
        }
        if let Some(v) = env_u32("VLT_ARGON2_ITERATIONS") {
            self.argon2_time_cost = v;
        }
        if let Some(v) = env_u32("VLT_ARGON2_PARALLELISM") {
            self.argon2_parallelism = v;
        }
    }
}

fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .filter(|v| *v > 0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Number of elements per persisted index chunk. Fixed for the lifetime
    /// of a repository: changing it re-shards every chunk.
    pub chunk_size: usize,
    /// Compact when tombstones / total slots exceeds this ratio
    pub compact_threshold: f64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            chunk_size: 10,
            compact_threshold: 0.25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

/// Load configuration from a TOML file.
///
/// A missing file yields the defaults (with a warning); a malformed one is a
/// `VltError::Config`. Argon2 env overrides are applied in both cases.
pub async fn load_config(path: &Path) -> VltResult<VltConfig> {
    let mut config = if tokio::fs::try_exists(path).await.unwrap_or(false) {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| VltError::Config(format!("reading config {}: {e}", path.display())))?;
        parse_config(&content)
            .map_err(|e| VltError::Config(format!("parsing config {}: {e}", path.display())))?
    } else {
        tracing::warn!(
            "config file not found: {}  (using defaults)",
            path.display()
        );
        VltConfig::default()
    };

    config.crypto.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

/// Parse a TOML document without touching the environment.
pub fn parse_config(content: &str) -> Result<VltConfig, toml::de::Error> {
    toml::from_str(content)
}

impl VltConfig {
    pub fn validate(&self) -> VltResult<()> {
        if self.index.chunk_size == 0 {
            return Err(VltError::Config("index.chunk_size must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.index.compact_threshold) {
            return Err(VltError::Config(
                "index.compact_threshold must be in [0, 1)".into(),
            ));
        }
        match self.storage.backend.as_str() {
            "local" | "s3" | "memory" => Ok(()),
            other => Err(VltError::Config(format!(
                "unknown storage backend: {other}"
            ))),
        }
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[storage]
backend = "s3"
endpoint = "https://s3.example.com"
region = "eu-west-1"
bucket = "my-vault"
root = "vaults/personal"
enforce_tls = true

[crypto]
argon2_mem_cost_kib = 131072
argon2_time_cost = 6
argon2_parallelism = 8

[index]
chunk_size = 50
compact_threshold = 0.4

[log]
level = "debug"
format = "json"
"#;
        let config = parse_config(toml_str).unwrap();

        assert_eq!(config.storage.backend, "s3");
        assert_eq!(config.storage.bucket, "my-vault");
        assert!(config.storage.enforce_tls);
        assert_eq!(config.crypto.argon2_mem_cost_kib, 131072);
        assert_eq!(config.crypto.argon2_parallelism, 8);
        assert_eq!(config.index.chunk_size, 50);
        assert!((config.index.compact_threshold - 0.4).abs() < f64::EPSILON);
        assert_eq!(config.log.format, "json");
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_defaults() {
        let config = parse_config("").unwrap();

        assert_eq!(config.storage.backend, "local");
        assert_eq!(config.storage.region, "us-east-1");
        assert_eq!(config.crypto.argon2_mem_cost_kib, 81920);
        assert_eq!(config.crypto.argon2_time_cost, 4);
        assert_eq!(config.index.chunk_size, 10);
        assert_eq!(config.log.level, "info");
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_partial_config() {
        let config = parse_config("[index]\nchunk_size = 5\n").unwrap();

        // Overridden
        assert_eq!(config.index.chunk_size, 5);
        // Defaults
        assert!((config.index.compact_threshold - 0.25).abs() < f64::EPSILON);
        assert_eq!(config.storage.backend, "local");
    }

    #[test]
    fn test_validate_rejects_zero_chunk_size() {
        let config = parse_config("[index]\nchunk_size = 0\n").unwrap();
        assert!(matches!(config.validate(), Err(VltError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_unknown_backend() {
        let config = parse_config("[storage]\nbackend = \"ftp\"\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ftp"));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = VltConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed = parse_config(&toml_str).unwrap();

        assert_eq!(config.storage.root, parsed.storage.root);
        assert_eq!(config.index.chunk_size, parsed.index.chunk_size);
        assert_eq!(config.crypto.argon2_time_cost, parsed.crypto.argon2_time_cost);
    }

    #[tokio::test]
    async fn test_load_config_missing_file_uses_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = load_config(&tmp.path().join("absent.toml")).await.unwrap();
        assert_eq!(config.index.chunk_size, 10);
    }

    #[tokio::test]
    async fn test_load_config_malformed() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("vlt.toml");
        std::fs::write(&path, "[index\nchunk_size = ").unwrap();

        let err = load_config(&path).await.unwrap_err();
        assert!(matches!(err, VltError::Config(_)));
    }

    #[test]
    fn test_expand_tilde_leaves_absolute_paths() {
        assert_eq!(expand_tilde("/srv/vault"), PathBuf::from("/srv/vault"));
    }
}
