use serde::Deserialize;

pub mod defaults {
    pub const DB_PATH: &str = "postbus.db";
    pub const MAX_ATTEMPTS: u32 = 3;
    pub const CONCURRENCY_LIMIT: usize = 1;
    pub const RETRY_DELAY_MS: u64 = 1000;
    pub const INBOX_QUEUE: &str = "inbox";
}

#[derive(Clone, Deserialize, Default)]
pub struct Config {
    pub db_path: Option<String>,
    pub default_max_attempts: Option<u32>,
    pub default_concurrency_limit: Option<usize>,
    pub default_retry_delay_ms: Option<u64>,
    pub inbox_queue: Option<String>,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("POSTBUS_").from_env::<Self>()?)
    }

    pub fn db_path(&self) -> &str {
        self.db_path
            .as_ref()
            .map(|s| s.as_str())
            .unwrap_or(defaults::DB_PATH)
    }

    pub fn default_max_attempts(&self) -> u32 {
        self.default_max_attempts.unwrap_or(defaults::MAX_ATTEMPTS)
    }

    pub fn default_concurrency_limit(&self) -> usize {
        self.default_concurrency_limit
            .unwrap_or(defaults::CONCURRENCY_LIMIT)
    }

    pub fn default_retry_delay_ms(&self) -> u64 {
        self.default_retry_delay_ms
            .unwrap_or(defaults::RETRY_DELAY_MS)
    }

    pub fn inbox_queue(&self) -> &str {
        self.inbox_queue
            .as_ref()
            .map(|s| s.as_str())
            .unwrap_or(defaults::INBOX_QUEUE)
    }
}
