//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default OAuth scopes requested from Google.
pub const DEFAULT_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/drive",
    "https://www.googleapis.com/auth/spreadsheets",
    "https://www.googleapis.com/auth/gmail.compose",
];

/// Execution runtime configuration (worker pool, monitor, router).
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of concurrent workers claiming tasks.
    pub workers: usize,
    /// How long one handler invocation may run before it is retried.
    pub invocation_timeout: Duration,
    /// Maximum number of resubmissions per task after timeouts.
    pub max_retries: u32,
    /// Receive timeout used as the heartbeat tick of background loops.
    pub heartbeat_interval: Duration,
    /// Capacity of the inbound task queue.
    pub inbound_capacity: usize,
    /// Capacity of the state event queue.
    pub state_capacity: usize,
    /// Suspended tasks older than this are dropped.
    pub wait_ttl: Duration,
    /// Conversations not updated for this long are dropped.
    pub conversation_ttl: Duration,
    /// How often the router sweeps expired entries.
    pub sweep_interval: Duration,
    /// Bound on one authorization-code exchange performed by the router.
    pub exchange_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            invocation_timeout: Duration::from_secs(5),
            max_retries: 3,
            heartbeat_interval: Duration::from_secs(5),
            inbound_capacity: 256,
            state_capacity: 256,
            wait_ttl: Duration::from_secs(3600),                  // 1 hour
            conversation_ttl: Duration::from_secs(7 * 24 * 3600), // 1 week
            sweep_interval: Duration::from_secs(60),
            exchange_timeout: Duration::from_secs(10),
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            workers: env_parse("HAL_WORKERS", defaults.workers)?,
            invocation_timeout: env_secs("HAL_INVOCATION_TIMEOUT_SECS", defaults.invocation_timeout)?,
            max_retries: env_parse("HAL_MAX_RETRIES", defaults.max_retries)?,
            heartbeat_interval: env_secs("HAL_HEARTBEAT_SECS", defaults.heartbeat_interval)?,
            inbound_capacity: env_parse("HAL_INBOUND_CAPACITY", defaults.inbound_capacity)?,
            state_capacity: env_parse("HAL_STATE_CAPACITY", defaults.state_capacity)?,
            wait_ttl: env_secs("HAL_WAIT_TTL_SECS", defaults.wait_ttl)?,
            conversation_ttl: env_secs("HAL_CONVERSATION_TTL_SECS", defaults.conversation_ttl)?,
            sweep_interval: env_secs("HAL_SWEEP_INTERVAL_SECS", defaults.sweep_interval)?,
            exchange_timeout: env_secs("HAL_EXCHANGE_TIMEOUT_SECS", defaults.exchange_timeout)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall the runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("HAL_WORKERS", self.workers),
            ("HAL_INBOUND_CAPACITY", self.inbound_capacity),
            ("HAL_STATE_CAPACITY", self.state_capacity),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }
        let durations = [
            ("HAL_INVOCATION_TIMEOUT_SECS", self.invocation_timeout),
            ("HAL_HEARTBEAT_SECS", self.heartbeat_interval),
            ("HAL_SWEEP_INTERVAL_SECS", self.sweep_interval),
            ("HAL_EXCHANGE_TIMEOUT_SECS", self.exchange_timeout),
        ];
        for (key, value) in durations {
            non_zero(key, value)?;
        }
        Ok(())
    }
}

/// OAuth and token-transform configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// URL-safe base64 encoding of the 32-byte token key.
    pub token_key: SecretString,
    pub client_id: String,
    pub client_secret: SecretString,
    /// Redirect URI registered with the provider (our callback receiver).
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    /// Identity used when a handler does not need per-user credentials.
    pub service_identity: String,
    /// Optional access token seeded for the service identity at startup.
    pub service_access_token: Option<SecretString>,
    /// Reject state tokens older than this.
    pub state_token_max_age: Option<Duration>,
}

impl AuthConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let token_key = std::env::var("FERNET_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("FERNET_KEY".to_string()))?;

        let scopes = std::env::var("HAL_OAUTH_SCOPES")
            .map(|s| {
                s.split_whitespace()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_else(|_| DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect());

        let state_token_max_age = match std::env::var("HAL_STATE_TOKEN_MAX_AGE_SECS") {
            Ok(raw) => Some(Duration::from_secs(parse_value(
                "HAL_STATE_TOKEN_MAX_AGE_SECS",
                &raw,
            )?)),
            Err(_) => None,
        };

        Ok(Self {
            token_key: SecretString::from(token_key),
            client_id: std::env::var("GOOGLE_CLIENT_ID").unwrap_or_default(),
            client_secret: SecretString::from(
                std::env::var("GOOGLE_CLIENT_SECRET").unwrap_or_default(),
            ),
            redirect_uri: std::env::var("CALLBACK_URI")
                .unwrap_or_else(|_| "http://localhost:5555/oauth/callback".to_string()),
            scopes,
            service_identity: std::env::var("HAL_SERVICE_IDENTITY")
                .unwrap_or_else(|_| "hal".to_string()),
            service_access_token: std::env::var("HAL_SERVICE_ACCESS_TOKEN")
                .ok()
                .filter(|s| !s.is_empty())
                .map(SecretString::from),
            state_token_max_age,
        })
    }
}

/// Callback receiver configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 5555 }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            port: env_parse("HAL_CALLBACK_PORT", Self::default().port)?,
        })
    }
}

/// Behavior knobs for the built-in handlers.
#[derive(Debug, Clone)]
pub struct AssistantConfig {
    /// Delay between repeated nag reminders.
    pub nag_interval: Duration,
    /// Users allowed to start onboarding.
    pub onboarding_admins: Vec<String>,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            nag_interval: Duration::from_secs(3600),
            onboarding_admins: Vec::new(),
        }
    }
}

impl AssistantConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let onboarding_admins = std::env::var("HAL_ONBOARDING_ADMINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let config = Self {
            nag_interval: env_secs("HAL_NAG_INTERVAL_SECS", defaults.nag_interval)?,
            onboarding_admins,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("HAL_NAG_INTERVAL_SECS", self.nag_interval)
    }
}

/// Head-count stats endpoint (a Google Apps Script web app).
#[derive(Debug, Clone)]
pub struct StatsConfig {
    /// Script URL; the `galatean-count` intent reports an error without it.
    pub url: Option<String>,
    pub token: SecretString,
}

impl StatsConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            url: std::env::var("SCRIPTS_URL").ok().filter(|s| !s.is_empty()),
            token: SecretString::from(std::env::var("GOOGLE_SLACK_TOKEN").unwrap_or_default()),
        })
    }
}

fn non_zero(key: &str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => parse_value(key, &raw),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => parse_value::<u64>(key, &raw).map(Duration::from_secs),
        Err(_) => Ok(default),
    }
}
