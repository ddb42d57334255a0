use std::path::PathBuf;

use crate::{Error, Result};

pub const DEFAULT_CONTENT_STORE_URL: &str = "https://api.content.example";
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8087";

/// Runtime settings, read from the environment once at startup.
///
/// Storage credentials and the bucket are required before any backup job
/// may do work; everything else has a usable default.
#[derive(Debug, Clone)]
pub struct Settings {
    pub region: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub content_store_url: String,
    pub listen_addr: String,
    pub work_dir: PathBuf,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            region: env_or_default("PACKRAT_S3_REGION", ""),
            bucket: env_or_default("PACKRAT_S3_BUCKET", ""),
            access_key_id: env_or_default("AWS_ACCESS_KEY_ID", ""),
            secret_access_key: env_or_default("AWS_SECRET_ACCESS_KEY", ""),
            content_store_url: env_or_default(
                "PACKRAT_CONTENT_STORE_URL",
                DEFAULT_CONTENT_STORE_URL,
            ),
            listen_addr: env_or_default("PACKRAT_LISTEN", DEFAULT_LISTEN_ADDR),
            work_dir: std::env::var_os("PACKRAT_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
        }
    }

    /// Pre-flight check run before a job touches any collaborator.
    pub fn validate(&self) -> Result<()> {
        if self.bucket.trim().is_empty() {
            return Err(Error::InvalidConfig {
                message: "PACKRAT_S3_BUCKET must not be empty".to_string(),
            });
        }
        if self.region.trim().is_empty() {
            return Err(Error::InvalidConfig {
                message: "PACKRAT_S3_REGION must not be empty".to_string(),
            });
        }
        if self.access_key_id.trim().is_empty() || self.secret_access_key.trim().is_empty() {
            return Err(Error::InvalidConfig {
                message: "AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

fn env_or_default(name: &str, default: &str) -> String {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => v,
        _ => default.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled() -> Settings {
        Settings {
            region: "eu-west-1".to_string(),
            bucket: "backups".to_string(),
            access_key_id: "AKIATEST".to_string(),
            secret_access_key: "secret".to_string(),
            content_store_url: DEFAULT_CONTENT_STORE_URL.to_string(),
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            work_dir: std::env::temp_dir(),
        }
    }

    #[test]
    fn validate_accepts_complete_settings() {
        filled().validate().unwrap();
    }

    #[test]
    fn validate_rejects_missing_bucket() {
        let mut s = filled();
        s.bucket = String::new();
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("PACKRAT_S3_BUCKET"));
    }

    #[test]
    fn validate_rejects_missing_credentials() {
        let mut s = filled();
        s.secret_access_key = "  ".to_string();
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("AWS_SECRET_ACCESS_KEY"));
    }

    #[test]
    fn validate_rejects_missing_region() {
        let mut s = filled();
        s.region = String::new();
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("PACKRAT_S3_REGION"));
    }
}
