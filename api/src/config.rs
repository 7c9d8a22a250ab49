use std::time::Duration;

use chrono_tz::Tz;

/// All admission-control tunables, read once at startup.
///
/// Every threshold is business policy, not a structural constant — each one
/// can be overridden through a `GATEHOUSE_*` environment variable and falls
/// back to the defaults below.
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Messages allowed inside the velocity window before the sender is banned.
    pub velocity_ceiling: usize,
    /// Sliding window for the velocity check.
    pub velocity_window: Duration,

    /// Distinct entries kept in the fuzzy duplicate history.
    pub dup_history_capacity: usize,
    /// normalized_levenshtein ratio at or above which two messages count as the same.
    pub dup_similarity_threshold: f64,
    /// Occurrences of the same message that trigger a ban.
    pub dup_occurrence_limit: u32,
    /// How long the duplicate history persists between messages.
    pub dup_history_ttl: Duration,

    /// Off-topic strikes before a ban.
    pub strike_limit: u32,
    /// How long strikes persist.
    pub strike_ttl: Duration,

    /// Per-sender daily message ceiling (stricter than per-address).
    pub daily_sender_quota: u32,
    /// Per-source-address daily message ceiling.
    pub daily_address_quota: u32,
    /// Timezone whose midnight resets the daily counters.
    pub business_timezone: Tz,

    /// Suspension duration when a sender is banned.
    pub ban_ttl: Duration,

    /// How long a held lock survives a crashed holder.
    pub lock_ttl: Duration,
    /// How long acquire() polls before reporting contention.
    pub lock_acquire_timeout: Duration,
    /// Extra acquire attempts the pipeline makes before answering 503.
    pub lock_retry_attempts: u32,

    /// Identical (sender, text) pairs inside this window replay the cached reply.
    pub dedup_window: Duration,

    /// Maximum message length in characters.
    pub max_message_chars: usize,

    /// Toxicity level at or above which the sender is hard-banned.
    pub toxicity_ban_floor: i32,

    /// Critical events per address within the window that trigger an auto-block.
    pub auto_block_threshold: i64,
    pub auto_block_window: Duration,
    pub auto_block_enabled: bool,

    /// Unclaimed handoff requests expire after this delay.
    pub handoff_timeout: Duration,

    /// Conversation memory: turns kept and retention.
    pub memory_turns: usize,
    pub memory_ttl: Duration,

    /// Reply served when the model gateway is unavailable. Empty disables the
    /// fallback and surfaces the outage as a 503 instead.
    pub fallback_reply: String,

    /// Bearer token required on /v1/admin routes.
    pub admin_token: Option<String>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            velocity_ceiling: 10,
            velocity_window: Duration::from_secs(60),
            dup_history_capacity: 5,
            dup_similarity_threshold: 0.85,
            dup_occurrence_limit: 3,
            dup_history_ttl: Duration::from_secs(60 * 60),
            strike_limit: 3,
            strike_ttl: Duration::from_secs(30 * 60),
            daily_sender_quota: 100,
            daily_address_quota: 300,
            business_timezone: chrono_tz::Europe::Madrid,
            ban_ttl: Duration::from_secs(24 * 60 * 60),
            lock_ttl: Duration::from_secs(3),
            lock_acquire_timeout: Duration::from_secs(2),
            lock_retry_attempts: 2,
            dedup_window: Duration::from_secs(10),
            max_message_chars: 1000,
            toxicity_ban_floor: 8,
            auto_block_threshold: 3,
            auto_block_window: Duration::from_secs(24 * 60 * 60),
            auto_block_enabled: true,
            handoff_timeout: Duration::from_secs(5 * 60),
            memory_turns: 10,
            memory_ttl: Duration::from_secs(24 * 60 * 60),
            fallback_reply: "Sorry, I can't answer right now. Please try again in a moment."
                .to_string(),
            admin_token: None,
        }
    }
}

impl GateConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            velocity_ceiling: env_parse("GATEHOUSE_VELOCITY_CEILING", defaults.velocity_ceiling),
            velocity_window: env_secs("GATEHOUSE_VELOCITY_WINDOW_SECS", defaults.velocity_window),
            dup_history_capacity: env_parse(
                "GATEHOUSE_DUP_HISTORY_CAPACITY",
                defaults.dup_history_capacity,
            ),
            dup_similarity_threshold: env_parse(
                "GATEHOUSE_DUP_SIMILARITY",
                defaults.dup_similarity_threshold,
            ),
            dup_occurrence_limit: env_parse(
                "GATEHOUSE_DUP_OCCURRENCE_LIMIT",
                defaults.dup_occurrence_limit,
            ),
            dup_history_ttl: env_secs("GATEHOUSE_DUP_HISTORY_TTL_SECS", defaults.dup_history_ttl),
            strike_limit: env_parse("GATEHOUSE_STRIKE_LIMIT", defaults.strike_limit),
            strike_ttl: env_secs("GATEHOUSE_STRIKE_TTL_SECS", defaults.strike_ttl),
            daily_sender_quota: env_parse(
                "GATEHOUSE_DAILY_SENDER_QUOTA",
                defaults.daily_sender_quota,
            ),
            daily_address_quota: env_parse(
                "GATEHOUSE_DAILY_ADDRESS_QUOTA",
                defaults.daily_address_quota,
            ),
            business_timezone: std::env::var("GATEHOUSE_BUSINESS_TZ")
                .ok()
                .and_then(|tz| tz.parse().ok())
                .unwrap_or(defaults.business_timezone),
            ban_ttl: env_secs("GATEHOUSE_BAN_TTL_SECS", defaults.ban_ttl),
            lock_ttl: env_secs("GATEHOUSE_LOCK_TTL_SECS", defaults.lock_ttl),
            lock_acquire_timeout: env_secs(
                "GATEHOUSE_LOCK_ACQUIRE_TIMEOUT_SECS",
                defaults.lock_acquire_timeout,
            ),
            lock_retry_attempts: env_parse(
                "GATEHOUSE_LOCK_RETRY_ATTEMPTS",
                defaults.lock_retry_attempts,
            ),
            dedup_window: env_secs("GATEHOUSE_DEDUP_WINDOW_SECS", defaults.dedup_window),
            max_message_chars: env_parse("GATEHOUSE_MAX_MESSAGE_CHARS", defaults.max_message_chars),
            toxicity_ban_floor: env_parse(
                "GATEHOUSE_TOXICITY_BAN_FLOOR",
                defaults.toxicity_ban_floor,
            ),
            auto_block_threshold: env_parse(
                "GATEHOUSE_AUTO_BLOCK_THRESHOLD",
                defaults.auto_block_threshold,
            ),
            auto_block_window: env_secs(
                "GATEHOUSE_AUTO_BLOCK_WINDOW_SECS",
                defaults.auto_block_window,
            ),
            auto_block_enabled: std::env::var("GATEHOUSE_AUTO_BLOCK_ENABLED")
                .map(|v| v != "false")
                .unwrap_or(defaults.auto_block_enabled),
            handoff_timeout: env_secs("GATEHOUSE_HANDOFF_TIMEOUT_SECS", defaults.handoff_timeout),
            memory_turns: env_parse("GATEHOUSE_MEMORY_TURNS", defaults.memory_turns),
            memory_ttl: env_secs("GATEHOUSE_MEMORY_TTL_SECS", defaults.memory_ttl),
            fallback_reply: std::env::var("GATEHOUSE_FALLBACK_REPLY")
                .unwrap_or(defaults.fallback_reply),
            admin_token: std::env::var("GATEHOUSE_ADMIN_TOKEN").ok(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

fn env_secs(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
