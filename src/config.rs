//! Environment-driven settings.
//!
//! Every knob has a default matching the deployed system; binaries read
//! the environment once at startup and pass the resulting `Settings` down
//! by value.

use std::path::PathBuf;
use std::time::Duration;

/// Process-wide configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Control-plane HTTP port (`HIVE_PORT`).
    pub port: u16,
    /// Postgres connection string (`DATABASE_URL`), used with the
    /// `postgres` feature.
    pub database_url: Option<String>,
    /// Storage backend: "memory" or "postgres" (`HIVE_STORE`).
    pub store_backend: String,
    /// Worker task poll cadence (`POLL_INTERVAL_MS`).
    pub poll_interval: Duration,
    /// Worker heartbeat cadence (`HEARTBEAT_INTERVAL_MS`).
    pub heartbeat_interval: Duration,
    /// Patrol cadence; 0 disables (`PATROL_INTERVAL_MS`).
    pub patrol_interval: Option<Duration>,
    /// Routing dispatcher cadence (`ROUTE_POLL_INTERVAL_MS`).
    pub route_poll_interval: Duration,
    /// Minimum routing confidence (`SCORE_THRESHOLD`).
    pub score_threshold: f64,
    /// Coordinator for low-confidence routes (`FALLBACK_AGENT`).
    pub fallback_agent: String,
    /// Unsolicited messages per hour per runtime (`NOISE_BUDGET_PER_HOUR`).
    pub noise_budget_per_hour: usize,
    /// Outcome-tracker flush debounce (`OUTCOME_SAVE_INTERVAL_MS`).
    pub outcome_save_interval: Duration,
    /// Delay between completion and archival (`ARCHIVE_DELAY_HOURS`).
    pub archive_delay: Duration,
    /// Workflow template JSON file (`WORKFLOWS_PATH`).
    pub workflows_path: Option<PathBuf>,
    /// Critic chain JSON file (`CRITIC_CHAINS_PATH`).
    pub critic_chains_path: Option<PathBuf>,
    /// Agent routing profile JSON file (`AGENT_PROFILES_PATH`).
    pub profiles_path: Option<PathBuf>,
    /// Side-channel webhook (`NOTIFY_WEBHOOK_URL`).
    pub notify_webhook_url: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 8789,
            database_url: None,
            store_backend: "memory".to_string(),
            poll_interval: Duration::from_millis(2000),
            heartbeat_interval: Duration::from_millis(15_000),
            patrol_interval: None,
            route_poll_interval: Duration::from_millis(5000),
            score_threshold: 0.15,
            fallback_agent: "overseer".to_string(),
            noise_budget_per_hour: 5,
            outcome_save_interval: Duration::from_millis(10_000),
            archive_delay: Duration::from_secs(36 * 60 * 60),
            workflows_path: None,
            critic_chains_path: None,
            profiles_path: None,
            notify_webhook_url: None,
        }
    }
}

impl Settings {
    /// Read everything from the process environment, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_parse("HIVE_PORT", defaults.port),
            database_url: std::env::var("DATABASE_URL").ok(),
            store_backend: std::env::var("HIVE_STORE").unwrap_or(defaults.store_backend),
            poll_interval: env_ms("POLL_INTERVAL_MS", defaults.poll_interval),
            heartbeat_interval: env_ms("HEARTBEAT_INTERVAL_MS", defaults.heartbeat_interval),
            patrol_interval: match env_parse::<u64>("PATROL_INTERVAL_MS", 0) {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            route_poll_interval: env_ms("ROUTE_POLL_INTERVAL_MS", defaults.route_poll_interval),
            score_threshold: env_parse("SCORE_THRESHOLD", defaults.score_threshold),
            fallback_agent: std::env::var("FALLBACK_AGENT").unwrap_or(defaults.fallback_agent),
            noise_budget_per_hour: env_parse(
                "NOISE_BUDGET_PER_HOUR",
                defaults.noise_budget_per_hour,
            ),
            outcome_save_interval: env_ms(
                "OUTCOME_SAVE_INTERVAL_MS",
                defaults.outcome_save_interval,
            ),
            archive_delay: Duration::from_secs(env_parse("ARCHIVE_DELAY_HOURS", 36u64) * 60 * 60),
            workflows_path: std::env::var("WORKFLOWS_PATH").ok().map(PathBuf::from),
            critic_chains_path: std::env::var("CRITIC_CHAINS_PATH").ok().map(PathBuf::from),
            profiles_path: std::env::var("AGENT_PROFILES_PATH").ok().map(PathBuf::from),
            notify_webhook_url: std::env::var("NOTIFY_WEBHOOK_URL").ok(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_ms(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_deployed_system() {
        let settings = Settings::default();
        assert_eq!(settings.score_threshold, 0.15);
        assert_eq!(settings.noise_budget_per_hour, 5);
        assert_eq!(settings.poll_interval, Duration::from_secs(2));
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(settings.archive_delay, Duration::from_secs(36 * 3600));
        assert_eq!(settings.fallback_agent, "overseer");
        assert!(settings.patrol_interval.is_none());
    }

    #[test]
    fn env_parse_ignores_garbage() {
        std::env::set_var("TASKHIVE_TEST_GARBAGE", "not-a-number");
        assert_eq!(env_parse::<u16>("TASKHIVE_TEST_GARBAGE", 42), 42);
        std::env::remove_var("TASKHIVE_TEST_GARBAGE");
    }
}
