//! OpenDAL Operator factory for vlt storage backends

use anyhow::{Context, Result};
use opendal::Operator;
use secrecy::{ExposeSecret, SecretString};
use vlt_core::config::{expand_tilde, StorageConfig};

/// Credentials for the S3 backend.
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: SecretString,
}

impl S3Credentials {
    /// Read `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY`.
    pub fn from_env() -> Option<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID").ok()?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").ok()?;
        Some(Self {
            access_key_id,
            secret_access_key: SecretString::from(secret_access_key),
        })
    }
}

impl std::fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .finish()
    }
}

/// Build an Operator for the configured backend.
///
/// For S3, a plaintext HTTP endpoint is an error when `enforce_tls` is set
/// and a warning otherwise. Path-style addressing (the opendal default) is
/// kept so MinIO and SeaweedFS endpoints work.
pub fn build_operator(cfg: &StorageConfig, credentials: Option<&S3Credentials>) -> Result<Operator> {
    let op = match cfg.backend.as_str() {
        "local" => {
            let root = expand_tilde(&cfg.root);
            let builder = opendal::services::Fs::default().root(&root.to_string_lossy());
            Operator::new(builder)
                .context("creating OpenDAL fs operator")?
                .finish()
        }
        "memory" => Operator::new(opendal::services::Memory::default())
            .context("creating OpenDAL memory operator")?
            .finish(),
        "s3" => {
            check_endpoint_tls(cfg)?;
            let mut builder = opendal::services::S3::default()
                .endpoint(&cfg.endpoint)
                .region(&cfg.region)
                .bucket(&cfg.bucket)
                .root(&cfg.root);
            if let Some(creds) = credentials {
                builder = builder
                    .access_key_id(&creds.access_key_id)
                    .secret_access_key(creds.secret_access_key.expose_secret());
            }
            Operator::new(builder)
                .context("creating OpenDAL S3 operator")?
                .finish()
        }
        other => anyhow::bail!("unknown storage backend: {other}"),
    };

    Ok(op
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(5)
                .with_jitter(),
        ))
}

fn check_endpoint_tls(cfg: &StorageConfig) -> Result<()> {
    if cfg.endpoint.starts_with("http://") {
        if cfg.enforce_tls {
            anyhow::bail!(
                "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                 Use an HTTPS endpoint or set storage.enforce_tls = false for local development.",
                cfg.endpoint
            );
        }
        tracing::warn!(
            endpoint = %cfg.endpoint,
            "S3 endpoint uses plaintext HTTP; credentials are transmitted unencrypted"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s3_config(endpoint: &str, enforce_tls: bool) -> StorageConfig {
        StorageConfig {
            backend: "s3".into(),
            endpoint: endpoint.into(),
            enforce_tls,
            root: "/vaults/test".into(),
            ..Default::default()
        }
    }

    fn test_credentials() -> S3Credentials {
        S3Credentials {
            access_key_id: "test-key".into(),
            secret_access_key: SecretString::from("test-secret"),
        }
    }

    #[test]
    fn test_build_s3_http_warns() {
        let result = build_operator(&s3_config("http://localhost:9000", false), Some(&test_credentials()));
        assert!(result.is_ok());
    }

    #[test]
    fn test_build_s3_http_enforce_tls() {
        let result = build_operator(&s3_config("http://insecure:9000", true), None);
        assert!(result.is_err(), "HTTP + enforce_tls must fail");
        assert!(result.unwrap_err().to_string().contains("enforce_tls"));
    }

    #[test]
    fn test_build_s3_https() {
        let result = build_operator(&s3_config("https://s3.example.com", true), Some(&test_credentials()));
        assert!(result.is_ok());
    }

    #[test]
    fn test_build_local() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = StorageConfig {
            backend: "local".into(),
            root: tmp.path().to_string_lossy().into_owned(),
            ..Default::default()
        };
        assert!(build_operator(&cfg, None).is_ok());
    }

    #[test]
    fn test_unknown_backend() {
        let cfg = StorageConfig {
            backend: "ftp".into(),
            ..Default::default()
        };
        assert!(build_operator(&cfg, None).is_err());
    }

    #[test]
    fn test_credentials_debug_redacts() {
        let debug = format!("{:?}", test_credentials());
        assert!(!debug.contains("test-secret"));
    }
}
