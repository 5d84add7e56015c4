use crate::error::AppError;
use dotenvy::dotenv;
use resilience::RetryConfig;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Upper bound of messages per sync response
    pub page_size: usize,
    /// Upper bound for `limit` on history pages
    pub max_page_limit: usize,
    pub rate_per_second: u32,
    pub burst: u32,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Append-only journal file; memory only when unset
    pub journal_path: Option<PathBuf>,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    /// Bound on a single journal write
    pub write_timeout: Duration,
}

impl StorageConfig {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            initial_backoff: self.initial_backoff,
            ..RetryConfig::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub dir: PathBuf,
    pub max_upload_bytes: usize,
    /// Prefix used to build media URLs
    pub public_path: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub max_message_length: usize,
    pub push_queue_capacity: usize,
    pub sync: SyncConfig,
    pub storage: StorageConfig,
    pub media: MediaConfig,
}

fn parse_or<T: FromStr>(key: &str, default: T) -> Result<T, AppError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("{key} has an invalid value: {raw}"))),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();

        let sync = SyncConfig {
            page_size: parse_or("PAGE_SIZE", 100)?,
            max_page_limit: parse_or("MAX_PAGE_LIMIT", 200)?,
            rate_per_second: parse_or("SYNC_RATE_PER_SECOND", 20)?,
            burst: parse_or("SYNC_BURST", 40)?,
        };

        let storage = StorageConfig {
            journal_path: env::var("JOURNAL_PATH")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            max_retries: parse_or("STORAGE_MAX_RETRIES", 3)?,
            initial_backoff: Duration::from_millis(parse_or("STORAGE_INITIAL_BACKOFF_MS", 50)?),
            write_timeout: Duration::from_millis(parse_or("STORAGE_WRITE_TIMEOUT_MS", 2000)?),
        };

        let media = MediaConfig {
            dir: PathBuf::from(env::var("MEDIA_DIR").unwrap_or_else(|_| "./media".to_string())),
            max_upload_bytes: parse_or("MAX_UPLOAD_BYTES", 10 * 1024 * 1024)?,
            public_path: env::var("MEDIA_PUBLIC_PATH").unwrap_or_else(|_| "/media".to_string()),
        };

        let config = Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: parse_or("PORT", 8080)?,
            max_message_length: parse_or("MAX_MESSAGE_LENGTH", 4096)?,
            push_queue_capacity: parse_or("PUSH_QUEUE_CAPACITY", 256)?,
            sync,
            storage,
            media,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.sync.page_size == 0 {
            return Err(AppError::Config("PAGE_SIZE must be > 0".into()));
        }
        if self.sync.max_page_limit == 0 {
            return Err(AppError::Config("MAX_PAGE_LIMIT must be > 0".into()));
        }
        if self.sync.rate_per_second == 0 || self.sync.burst == 0 {
            return Err(AppError::Config(
                "SYNC_RATE_PER_SECOND and SYNC_BURST must be > 0".into(),
            ));
        }
        if self.push_queue_capacity == 0 {
            return Err(AppError::Config("PUSH_QUEUE_CAPACITY must be > 0".into()));
        }
        Ok(())
    }

    /// Settings for unit and integration tests: memory journal, small pages.
    pub fn test_defaults() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_message_length: 4096,
            push_queue_capacity: 64,
            sync: SyncConfig {
                page_size: 100,
                max_page_limit: 200,
                rate_per_second: 1000,
                burst: 1000,
            },
            storage: StorageConfig {
                journal_path: None,
                max_retries: 2,
                initial_backoff: Duration::from_millis(1),
                write_timeout: Duration::from_secs(1),
            },
            media: MediaConfig {
                dir: std::env::temp_dir().join("chat-sync-media"),
                max_upload_bytes: 1024 * 1024,
                public_path: "/media".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(Config::test_defaults().validate().is_ok());
    }

    #[test]
    fn test_zero_page_size_rejected() {
        let mut config = Config::test_defaults();
        config.sync.page_size = 0;
        assert!(matches!(config.validate(), Err(AppError::Config(_))));
    }

    #[test]
    fn test_retry_config_follows_storage_settings() {
        let config = Config::test_defaults();
        let retry = config.storage.retry_config();
        assert_eq!(retry.max_retries, 2);
        assert_eq!(retry.initial_backoff, Duration::from_millis(1));
    }
}
