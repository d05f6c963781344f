//! `SessionConfig`: the single configuration surface threaded into
//! `SessionManager`, `AgentCoordinator`, and `RollbackManager` constructors
//! (spec.md §6's minimum environment-variable set).

use std::env;
use std::time::Duration;

/// Configuration for the session coordination core, loaded from environment
/// variables with the spec's stated defaults.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Default TTL applied to a new session's keys.
    pub default_ttl: Duration,
    /// Emit an auto-checkpoint every N events (`seq % checkpoint_interval == 0`).
    pub checkpoint_interval: u64,
    /// Number of recent events `SessionStore::Get` hydrates by default.
    pub max_events: usize,
    /// Short TTL applied when the last agent leaves a session, or on checkpoint close.
    pub grace_ttl: Duration,
    pub enable_failure_snapshots: bool,
    /// `global:sessions`-style channel for lifecycle notifications.
    pub global_channel: String,
    /// Prefix for per-session pub/sub channels (`<prefix><sessionId>`).
    pub channel_prefix: String,
    /// Agent liveness heartbeat tick interval.
    pub heartbeat_interval: Duration,
    /// An agent with no heartbeat for longer than this is marked dead.
    pub heartbeat_timeout: Duration,
    /// Delay before probing a dead agent back to life.
    pub recovery_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
            checkpoint_interval: 20,
            max_events: 50,
            grace_ttl: Duration::from_secs(300),
            enable_failure_snapshots: true,
            global_channel: "global:sessions".to_string(),
            channel_prefix: "session:".to_string(),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            recovery_delay: Duration::from_secs(60),
        }
    }
}

impl SessionConfig {
    /// Load from the process environment, falling back to [`Default`] for
    /// any variable that is absent or fails to parse.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            default_ttl: env_secs("SESSION_DEFAULT_TTL", defaults.default_ttl),
            checkpoint_interval: env_u64(
                "SESSION_CHECKPOINT_INTERVAL",
                defaults.checkpoint_interval,
            ),
            max_events: env_u64("SESSION_MAX_EVENTS", defaults.max_events as u64) as usize,
            grace_ttl: env_secs("SESSION_GRACE_TTL", defaults.grace_ttl),
            enable_failure_snapshots: env::var("SESSION_ENABLE_FAILURE_SNAPSHOTS")
                .ok()
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.enable_failure_snapshots),
            global_channel: env::var("SESSION_GLOBAL_CHANNEL")
                .unwrap_or(defaults.global_channel),
            channel_prefix: env::var("SESSION_CHANNEL_PREFIX").unwrap_or(defaults.channel_prefix),
            ..defaults
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_secs(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

/// Redis connection configuration, consumed by `agentsync-redis`'s
/// `ConnPool` constructor. Lives here (rather than in the redis crate) so
/// that `SessionConfig::from_env` is the one place environment parsing
/// happens, per spec.md §1's ambient-config clause.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub password: Option<String>,
    pub db: i64,
    pub pool_min: usize,
    pub pool_max: usize,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub health_check_interval: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            password: None,
            db: 0,
            pool_min: 1,
            pool_max: 10,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(30),
        }
    }
}

impl RedisConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        if let Ok(url) = env::var("REDIS_URL") {
            return Self {
                url,
                password: env::var("REDIS_PASSWORD").ok(),
                db: env_u64("REDIS_SESSION_DB", defaults.db as u64) as i64,
                ..defaults
            };
        }
        let host = env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("REDIS_PORT").unwrap_or_else(|_| "6379".to_string());
        Self {
            url: format!("redis://{host}:{port}"),
            password: env::var("REDIS_PASSWORD").ok(),
            db: env_u64("REDIS_SESSION_DB", defaults.db as u64) as i64,
            ..defaults
        }
    }
}
