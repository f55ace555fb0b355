use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MAX_STEPS: usize = 6;
pub const DEFAULT_SEARCH_URL: &str = "https://www.google.com/search?q={query}";

/// Bounds applied by the skill store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkillLimits {
    /// Entries kept before the oldest-created one is evicted.
    pub max_entries: usize,
    /// Steps kept per skill after duplicate collapsing.
    pub max_steps: usize,
    /// A refinement is requested after every Nth save.
    pub refine_every: u64,
}

impl Default for SkillLimits {
    fn default() -> Self {
        Self {
            max_entries: 60,
            max_steps: 40,
            refine_every: 5,
        }
    }
}

/// Tunables of the browsing engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_steps: usize,
    pub navigation_timeout: Duration,
    pub ready_timeout: Duration,
    pub url_poll_interval: Duration,
    pub schema_ttl: Duration,
    pub follow_up_ttl: Duration,
    /// Search endpoint with a `{query}` placeholder.
    pub search_url: String,
    pub skills: SkillLimits,
    pub data_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            navigation_timeout: Duration::from_secs(10),
            ready_timeout: Duration::from_secs(2),
            url_poll_interval: Duration::from_millis(200),
            schema_ttl: Duration::from_secs(120),
            follow_up_ttl: Duration::from_secs(10 * 60),
            search_url: DEFAULT_SEARCH_URL.to_string(),
            skills: SkillLimits::default(),
            data_dir: default_data_dir(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `PAGEPILOT_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(steps) = env_parse::<usize>("PAGEPILOT_MAX_STEPS") {
            config.max_steps = steps.max(1);
        }
        if let Some(ms) = env_parse::<u64>("PAGEPILOT_NAVIGATION_TIMEOUT_MS") {
            config.navigation_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("PAGEPILOT_READY_TIMEOUT_MS") {
            config.ready_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("PAGEPILOT_URL_POLL_MS") {
            config.url_poll_interval = Duration::from_millis(ms.max(10));
        }
        if let Some(secs) = env_parse::<u64>("PAGEPILOT_SCHEMA_TTL_SECS") {
            config.schema_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("PAGEPILOT_FOLLOW_UP_TTL_SECS") {
            config.follow_up_ttl = Duration::from_secs(secs);
        }
        if let Ok(url) = std::env::var("PAGEPILOT_SEARCH_URL") {
            if url.contains("{query}") {
                config.search_url = url;
            } else {
                tracing::warn!(%url, "ignoring PAGEPILOT_SEARCH_URL without a {{query}} placeholder");
            }
        }
        if let Ok(dir) = std::env::var("PAGEPILOT_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        config
    }

    pub fn skills_path(&self) -> PathBuf {
        self.data_dir.join("skills.json")
    }

    pub fn visits_path(&self) -> PathBuf {
        self.data_dir.join("visits.json")
    }

    /// Search URL for `query`, form-encoded into the template.
    pub fn search_url_for(&self, query: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(query.trim().as_bytes()).collect();
        self.search_url.replace("{query}", &encoded)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("pagepilot")
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_constants() {
        let config = EngineConfig::default();
        assert_eq!(config.max_steps, 6);
        assert_eq!(config.url_poll_interval, Duration::from_millis(200));
        assert_eq!(config.schema_ttl, Duration::from_secs(120));
        assert_eq!(config.skills.max_entries, 60);
        assert_eq!(config.skills.max_steps, 40);
        assert!(config.skills_path().ends_with("skills.json"));
    }

    #[test]
    fn search_url_is_encoded() {
        let config = EngineConfig::default();
        assert_eq!(
            config.search_url_for(" rust & tokio "),
            "https://www.google.com/search?q=rust+%26+tokio"
        );
    }
}
