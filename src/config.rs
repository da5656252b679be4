use crate::error::{AppError, Result};

pub const MARKET_API_URL: &str = "https://api.ragnarokmarket.lat";
pub const DISCORD_API_URL: &str = "https://discord.com/api/v10";

// ---------------------------------------------------------------------------
// Strategy engine tuning
// ---------------------------------------------------------------------------

/// Base cache TTL before the volatility/dormancy multipliers (5 minutes).
pub const BASE_CACHE_TTL_MS: u64 = 5 * 60 * 1000;
/// Computed TTLs are clamped to this range.
pub const MIN_CACHE_TTL_MS: u64 = 60 * 1000;
pub const MAX_CACHE_TTL_MS: u64 = 30 * 60 * 1000;

/// Rolling lowest-price window capacity per query group.
pub const PRICE_WINDOW_CAP: usize = 20;

/// Volatility above this halves the TTL; below `LOW_VOLATILITY` doubles it.
pub const HIGH_VOLATILITY: f64 = 0.7;
pub const LOW_VOLATILITY: f64 = 0.3;

/// Empty-streak length after which absence is trusted longer (TTL ×1.5).
pub const EMPTY_STREAK_TTL_BOOST: u64 = 3;
/// A group with no results for this long is considered dormant (TTL ×1.3).
pub const DORMANT_AFTER_MS: u64 = 12 * 60 * 60 * 1000;

/// Skip a group outright after this many consecutive empty results...
pub const EMPTY_STREAK_SKIP: u64 = 5;
/// ...as long as the last empty result is younger than this.
pub const EMPTY_SKIP_WINDOW_MS: u64 = 6 * 60 * 60 * 1000;

/// Minimum window samples before the stable-price comparison applies.
pub const STABLE_MIN_SAMPLES: usize = 10;
/// Relative variation between the two 5-sample means counted as "stable".
pub const STABLE_VARIATION: f64 = 0.02;
/// Stable groups are skipped only when the last check is younger than this.
/// Historical name; used as an upper bound on check age, not a minimum.
pub const MIN_CHECK_INTERVAL_MS: u64 = 10 * 60 * 1000;

/// Priority bonuses/penalties (base score = alert count in the group).
pub const PRIORITY_HAS_RESULTS: i64 = 10;
pub const PRIORITY_RECENT_RESULT: i64 = 5;
pub const PRIORITY_PRICE_DROP: i64 = 15;
pub const PRIORITY_EMPTY_PENALTY: i64 = 5;
pub const PRIORITY_STARVED: i64 = 3;

/// "Recent result" horizon for the +5 bonus (2 hours).
pub const RECENT_RESULT_MS: u64 = 2 * 60 * 60 * 1000;
/// Groups unchecked for longer than this get the starvation bonus (24 hours).
pub const STARVED_AFTER_MS: u64 = 24 * 60 * 60 * 1000;
/// Mean of the last 5 samples at or below 95% of the prior mean = price drop.
pub const PRICE_DROP_RATIO: f64 = 0.95;

// ---------------------------------------------------------------------------
// Checker
// ---------------------------------------------------------------------------

/// Delay before the very first cycle after `start()` (seconds).
pub const WARMUP_DELAY_SECS: u64 = 30;

/// Listings included in a notification message.
pub const NOTIFY_TOP_LISTINGS: usize = 5;

/// Expiry sweep interval (seconds) and inactivity horizon (days).
pub const SWEEP_INTERVAL_SECS: u64 = 6 * 60 * 60;
pub const ALERT_EXPIRY_DAYS: u64 = 30;

#[derive(Debug, Clone)]
pub struct Config {
    pub market_api_url: String,
    pub discord_token: String,
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    /// Minutes between poll cycles (WATCHER_POLL_INTERVAL_MINUTES).
    pub poll_interval_minutes: u64,
    /// Minutes between two routine notifications for one alert (WATCHER_COOLDOWN_MINUTES).
    pub cooldown_minutes: u64,
    /// Politeness delay between group queries (WATCHER_REQUEST_DELAY_MS).
    pub inter_request_delay_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            market_api_url: std::env::var("MARKET_API_URL")
                .unwrap_or_else(|_| MARKET_API_URL.to_string()),
            discord_token: std::env::var("DISCORD_TOKEN").unwrap_or_default(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "watcher.db".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            poll_interval_minutes: std::env::var("WATCHER_POLL_INTERVAL_MINUTES")
                .unwrap_or_else(|_| "15".to_string())
                .parse::<u64>()
                .unwrap_or(15)
                .max(1),
            cooldown_minutes: std::env::var("WATCHER_COOLDOWN_MINUTES")
                .unwrap_or_else(|_| "60".to_string())
                .parse::<u64>()
                .unwrap_or(60),
            inter_request_delay_ms: std::env::var("WATCHER_REQUEST_DELAY_MS")
                .unwrap_or_else(|_| "2000".to_string())
                .parse::<u64>()
                .unwrap_or(2000),
        })
    }
}
