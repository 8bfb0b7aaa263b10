use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection settings for the Redis-backed store.
///
/// `host` and `port` are kept separate from the assembled URL because they
/// are also injected into agent container environments (`REDIS_HOST`,
/// `REDIS_PORT`) so agents can reach the same substrate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub database: u16,
    pub max_retries: u32,
    #[serde(with = "duration_ms")]
    pub retry_delay: Duration,
    #[serde(with = "duration_ms")]
    pub command_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            database: 0,
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            command_timeout: Duration::from_secs(5),
        }
    }
}

impl StoreConfig {
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => {
                format!("redis://:{}@{}:{}/{}", password, self.host, self.port, self.database)
            }
            None => format!("redis://{}:{}/{}", self.host, self.port, self.database),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        (value.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Simple glob matching for `keys(pattern)`: `*` matches any run of
/// characters, everything else is literal. Mirrors the subset of Redis
/// KEYS patterns the orchestrator actually uses.
pub(crate) fn glob_match(pattern: &str, candidate: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let candidate: Vec<char> = candidate.chars().collect();
    let (mut p, mut c) = (0usize, 0usize);
    let (mut star, mut mark) = (None::<usize>, 0usize);

    while c < candidate.len() {
        if p < pattern.len() && (pattern[p] == candidate[c] || pattern[p] == '?') {
            p += 1;
            c += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            mark = c;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            mark += 1;
            c = mark;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}
