/// Configuration management
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_PAGE_SIZE: usize = 50;

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the REST collaborator (e.g. `http://127.0.0.1:8000/api`)
    pub api_url: String,

    /// Base URL of the realtime (SSE) collaborator, defaults to `api_url`
    pub realtime_url: Option<String>,

    /// Signed-in user
    pub user_id: Option<String>,

    /// Bearer token for the signed-in user
    #[serde(skip_serializing)]
    pub token: Option<String>,

    /// Messages requested per backfill page
    pub page_size: usize,

    /// First reconnect delay
    pub backoff_base: Duration,

    /// Multiplier applied per consecutive failure
    pub backoff_factor: u32,

    /// Upper bound for a single reconnect delay
    pub backoff_max: Duration,

    /// Add up to 10% random spread to reconnect delays
    pub backoff_jitter: bool,

    /// Consecutive failures tolerated before a channel reports `Degraded`
    pub degraded_after: u32,

    /// How long a heartbeat subscription may take to confirm
    pub health_check_timeout: Duration,

    /// Interval between background health checks
    pub health_check_interval: Duration,

    /// How long `select_conversation` waits for the message topic before backfilling anyway
    pub subscribe_timeout: Duration,

    /// Longest message body accepted by `send_message` (in characters)
    pub max_message_len: usize,

    /// Capacity of the inbound event queue and the UI event feed
    pub event_buffer: usize,

    /// Run against the in-memory backend instead of HTTP
    pub demo: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8000".to_string(),
            realtime_url: None,
            user_id: None,
            token: None,
            page_size: DEFAULT_PAGE_SIZE,
            backoff_base: Duration::from_secs(1),
            backoff_factor: 2,
            backoff_max: Duration::from_secs(30),
            backoff_jitter: true,
            degraded_after: 5,
            health_check_timeout: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(30),
            subscribe_timeout: Duration::from_secs(10),
            max_message_len: 4000,
            event_buffer: 256,
            demo: false,
        }
    }
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 2 {
            return Err(SyncError::Config(format!(
                "Usage: {} <api-url> [--realtime-url <url>] [--user <id>] [--token <token>] [--page-size <n>] [--degraded-after <n>] [--demo]",
                args.first().map(String::as_str).unwrap_or("chatsync")
            )));
        }

        let mut api_url: Option<String> = None;
        let mut realtime_url: Option<String> = None;
        let mut user_id: Option<String> = None;
        let mut token: Option<String> = None;
        let mut page_size: Option<usize> = None;
        let mut degraded_after: Option<u32> = None;
        let mut demo = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--demo" => {
                    demo = true;
                    i += 1;
                }
                "--realtime-url" => {
                    realtime_url = Some(flag_value(args, i, "--realtime-url")?.to_string());
                    i += 2;
                }
                "--user" => {
                    user_id = Some(flag_value(args, i, "--user")?.to_string());
                    i += 2;
                }
                "--token" => {
                    token = Some(flag_value(args, i, "--token")?.to_string());
                    i += 2;
                }
                "--page-size" => {
                    let v = flag_value(args, i, "--page-size")?;
                    page_size = Some(v.parse::<usize>().map_err(|_| {
                        SyncError::Config("--page-size must be a positive number".to_string())
                    })?);
                    i += 2;
                }
                "--degraded-after" => {
                    let v = flag_value(args, i, "--degraded-after")?;
                    degraded_after = Some(v.parse::<u32>().map_err(|_| {
                        SyncError::Config("--degraded-after must be a positive number".to_string())
                    })?);
                    i += 2;
                }
                other if other.starts_with("--") => {
                    return Err(SyncError::Config(format!("Unknown flag: {}", other)));
                }
                other => {
                    if api_url.is_some() {
                        return Err(SyncError::Config(format!(
                            "Unexpected argument: {}",
                            other
                        )));
                    }
                    api_url = Some(other.trim_end_matches('/').to_string());
                    i += 1;
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Ok(t) = std::env::var("CHATSYNC_TOKEN") {
            token = Some(t);
        }
        if let Ok(u) = std::env::var("CHATSYNC_USER") {
            user_id = Some(u);
        }
        if let Ok(r) = std::env::var("CHATSYNC_REALTIME_URL") {
            realtime_url = Some(r);
        }
        if let Some(n) = std::env::var("CHATSYNC_PAGE_SIZE")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
        {
            page_size = Some(n);
        }

        let defaults = Self::default();
        let config = Self {
            api_url: match api_url {
                Some(url) => url,
                None if demo => "memory://demo".to_string(),
                None => {
                    return Err(SyncError::Config("Missing <api-url> argument".to_string()))
                }
            },
            realtime_url: realtime_url.map(|u| u.trim_end_matches('/').to_string()),
            user_id,
            token,
            page_size: page_size.unwrap_or(defaults.page_size),
            degraded_after: degraded_after.unwrap_or(defaults.degraded_after),
            demo,
            ..defaults
        };
        config.validate()?;
        Ok(config)
    }

    /// Check values that would make the engine misbehave
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(SyncError::Config("page size must be at least 1".to_string()));
        }
        if self.degraded_after == 0 {
            return Err(SyncError::Config(
                "degraded-after must be at least 1".to_string(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(SyncError::Config("event buffer must be at least 1".to_string()));
        }
        if self.health_check_interval.is_zero() {
            return Err(SyncError::Config(
                "health check interval must be positive".to_string(),
            ));
        }
        if !self.demo {
            if !self.api_url.starts_with("http://") {
                return Err(SyncError::Config(format!(
                    "Only plain http:// endpoints are supported, got {}",
                    self.api_url
                )));
            }
            if let Some(rt) = &self.realtime_url {
                if !rt.starts_with("http://") {
                    return Err(SyncError::Config(format!(
                        "Only plain http:// endpoints are supported, got {}",
                        rt
                    )));
                }
            }
        }
        Ok(())
    }

    /// Realtime base URL, falling back to the REST base URL
    pub fn realtime_base(&self) -> &str {
        self.realtime_url.as_deref().unwrap_or(&self.api_url)
    }
}

fn flag_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| SyncError::Config(format!("{} requires a value", flag)))
}
