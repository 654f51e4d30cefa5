use crate::identity::DEFAULT_IDENT_SIZE;
use anyhow::{anyhow, Context, Result};
use chrono_tz::Tz;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct TextboardConfig {
    pub paths: TextboardPaths,
    pub identity: IdentityConfig,
    pub queue: QueueConfig,
    pub filters: FilterConfig,
    pub db_busy_timeout: Duration,
}

impl TextboardConfig {
    pub fn from_env() -> Result<Self> {
        let paths = match env::var("TEXTBOARD_HOME") {
            Ok(home) if !home.trim().is_empty() => TextboardPaths::from_base_dir(home),
            _ => TextboardPaths::discover()?,
        };
        Ok(Self {
            paths,
            identity: IdentityConfig::from_env()?,
            queue: QueueConfig::from_env()?,
            filters: FilterConfig::from_env()?,
            db_busy_timeout: Duration::from_millis(
                env_parse("TEXTBOARD_DB_BUSY_TIMEOUT_MS")?.unwrap_or(5_000),
            ),
        })
    }

    /// Defaults rooted at `base`, ignoring the environment.
    pub fn with_base_dir<P: AsRef<Path>>(base: P) -> Self {
        Self {
            paths: TextboardPaths::from_base_dir(base),
            identity: IdentityConfig::default(),
            queue: QueueConfig::default(),
            filters: FilterConfig::default(),
            db_busy_timeout: Duration::from_millis(5_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub ident_size: usize,
    /// Zone whose midnight starts a new ident day.
    pub time_zone: Tz,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            ident_size: DEFAULT_IDENT_SIZE,
            time_zone: Tz::UTC,
        }
    }
}

impl IdentityConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let ident_size = env_parse("TEXTBOARD_IDENT_SIZE")?.unwrap_or(defaults.ident_size);
        if ident_size == 0 {
            return Err(anyhow!("TEXTBOARD_IDENT_SIZE must be at least 1"));
        }
        let time_zone = match env_string("TEXTBOARD_TIME_ZONE") {
            Some(raw) => raw
                .parse::<Tz>()
                .map_err(|err| anyhow!("TEXTBOARD_TIME_ZONE {raw:?}: {err}"))?,
            None => defaults.time_zone,
        };
        Ok(Self {
            ident_size,
            time_zone,
        })
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub workers: usize,
    pub buffer: usize,
    pub result_ttl_secs: u64,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            buffer: 256,
            result_ttl_secs: 3_600,
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(100),
        }
    }
}

impl QueueConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let workers = env_parse("TEXTBOARD_WORKERS")?.unwrap_or(defaults.workers);
        let buffer = env_parse("TEXTBOARD_QUEUE_BUFFER")?.unwrap_or(defaults.buffer);
        let max_attempts = env_parse("TEXTBOARD_MAX_ATTEMPTS")?.unwrap_or(defaults.max_attempts);
        if workers == 0 || buffer == 0 || max_attempts == 0 {
            return Err(anyhow!(
                "TEXTBOARD_WORKERS, TEXTBOARD_QUEUE_BUFFER and TEXTBOARD_MAX_ATTEMPTS must be positive"
            ));
        }
        Ok(Self {
            workers,
            buffer,
            result_ttl_secs: env_parse("TEXTBOARD_RESULT_TTL")?.unwrap_or(defaults.result_ttl_secs),
            max_attempts,
            retry_base_delay: env_parse("TEXTBOARD_RETRY_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_base_delay),
        })
    }
}

#[derive(Debug, Clone)]
pub struct FilterConfig {
    pub dnsbl_providers: Vec<String>,
    pub akismet_key: Option<String>,
    pub proxy: ProxyConfig,
    pub timeout: Duration,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            dnsbl_providers: Vec::new(),
            akismet_key: None,
            proxy: ProxyConfig::default(),
            timeout: Duration::from_millis(2_000),
        }
    }
}

impl FilterConfig {
    pub fn from_env() -> Result<Self> {
        let dnsbl_providers = env_string("TEXTBOARD_DNSBL_PROVIDERS")
            .map(|raw| {
                raw.split(',')
                    .map(|part| part.trim().to_string())
                    .filter(|part| !part.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        Ok(Self {
            dnsbl_providers,
            akismet_key: env_string("TEXTBOARD_AKISMET_KEY"),
            proxy: ProxyConfig::from_env()?,
            timeout: Duration::from_millis(
                env_parse("TEXTBOARD_FILTER_TIMEOUT_MS")?.unwrap_or(2_000),
            ),
        })
    }

    pub fn any_enabled(&self) -> bool {
        !self.dnsbl_providers.is_empty()
            || self.akismet_key.is_some()
            || self.proxy.blackbox_enabled
            || self.proxy.getipintel_email.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub blackbox_enabled: bool,
    pub blackbox_url: String,
    pub getipintel_email: Option<String>,
    pub getipintel_url: String,
    pub getipintel_flags: Option<String>,
    pub getipintel_threshold: f64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            blackbox_enabled: false,
            blackbox_url: "http://proxy.mind-media.com/block/proxycheck.php".to_string(),
            getipintel_email: None,
            getipintel_url: "http://check.getipintel.net/check.php".to_string(),
            getipintel_flags: Some("m".to_string()),
            getipintel_threshold: 0.99,
        }
    }
}

impl ProxyConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let blackbox_enabled = env_string("TEXTBOARD_BLACKBOX_ENABLED")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(defaults.blackbox_enabled);
        let getipintel_threshold: f64 = env_parse("TEXTBOARD_GETIPINTEL_THRESHOLD")?
            .unwrap_or(defaults.getipintel_threshold);
        if !getipintel_threshold.is_finite() {
            return Err(anyhow!("TEXTBOARD_GETIPINTEL_THRESHOLD must be a finite number"));
        }
        Ok(Self {
            blackbox_enabled,
            blackbox_url: env_string("TEXTBOARD_BLACKBOX_URL").unwrap_or(defaults.blackbox_url),
            getipintel_email: env_string("TEXTBOARD_GETIPINTEL_EMAIL"),
            getipintel_url: env_string("TEXTBOARD_GETIPINTEL_URL")
                .unwrap_or(defaults.getipintel_url),
            getipintel_flags: env_string("TEXTBOARD_GETIPINTEL_FLAGS")
                .or(defaults.getipintel_flags),
            getipintel_threshold,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct TextboardPaths {
    pub base: PathBuf,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub logs_dir: PathBuf,
}

impl TextboardPaths {
    pub fn discover() -> Result<Self> {
        let exe_path = std::env::current_exe()
            .map_err(|err| anyhow!("failed to resolve current executable: {err}"))?;
        let base = exe_path
            .parent()
            .ok_or_else(|| anyhow!("executable path missing parent"))?
            .to_path_buf();
        Ok(Self::from_base_dir(base))
    }

    pub fn from_base_dir<P: AsRef<Path>>(base: P) -> Self {
        let base = base.as_ref().to_path_buf();
        let data_dir = base.join("data");
        let db_path = data_dir.join("textboard.db");
        let logs_dir = base.join("logs");
        Self {
            base,
            data_dir,
            db_path,
            logs_dir,
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|raw| {
        let raw = raw.trim();
        if raw.is_empty() {
            None
        } else {
            Some(raw.to_string())
        }
    })
}

/// Absent or blank → `None`; present but unparsable → error.
fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env_string(key)
        .map(|raw| {
            raw.parse::<T>()
                .with_context(|| format!("invalid value {raw:?} for {key}"))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_hang_off_the_base_dir() {
        let paths = TextboardPaths::from_base_dir("/srv/board");
        assert_eq!(paths.db_path, PathBuf::from("/srv/board/data/textboard.db"));
        assert_eq!(paths.logs_dir, PathBuf::from("/srv/board/logs"));
    }

    #[test]
    fn defaults_disable_external_filters() {
        let config = TextboardConfig::with_base_dir("/tmp/board");
        assert!(!config.filters.any_enabled());
        assert_eq!(config.identity.ident_size, 10);
        assert_eq!(config.identity.time_zone, Tz::UTC);
        assert_eq!(config.queue.result_ttl_secs, 3_600);
    }

    #[test]
    fn env_parse_rejects_garbage() {
        std::env::set_var("TEXTBOARD_TEST_PARSE_OK", "42");
        std::env::set_var("TEXTBOARD_TEST_PARSE_BAD", "forty-two");
        assert_eq!(env_parse::<u64>("TEXTBOARD_TEST_PARSE_OK").unwrap(), Some(42));
        assert!(env_parse::<u64>("TEXTBOARD_TEST_PARSE_BAD").is_err());
        assert_eq!(env_parse::<u64>("TEXTBOARD_TEST_PARSE_MISSING").unwrap(), None);
    }
}
