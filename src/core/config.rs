use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Default soft limit on outstanding unconfirmed commands per session.
///
/// A session that crosses this limit surfaces a `Block` action to its caller;
/// confirmations draining the pending table back below it surface `Unblock`.
pub const DEFAULT_SOFT_LIMIT: usize = 32;

/// Default age after which an unconfirmed pipelined command is resubmitted.
pub const DEFAULT_RESEND_AFTER_MS: u64 = 2_000;

/// Default upper bound on how long a `dequeue` call waits for one delivery.
pub const DEFAULT_DEQUEUE_TIMEOUT_MS: u64 = 5_000;

/// Default prefetch count applied when a checkout does not name one.
pub const DEFAULT_PREFETCH: u32 = 64;

/// Top-level configuration for one queue plus the sessions that target it.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub queue: QueueConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// Identity and dead-letter wiring for one replicated queue.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Queue name; doubles as the state-machine identity inside the log.
    pub name: String,
    /// Handler invoked with discarded messages. Absent means log-and-drop.
    #[serde(default)]
    pub dead_letter: Option<DeadLetterRef>,
}

/// Reference to a dead-letter handler resolved by the embedding process.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeadLetterRef {
    pub handler: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Client-session tuning knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Ordered candidate endpoints; the session walks this list on
    /// not-leader rejections.
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default = "default_soft_limit")]
    pub soft_limit: usize,
    #[serde(default = "default_resend_after_ms")]
    pub resend_after_ms: u64,
    #[serde(default = "default_dequeue_timeout_ms")]
    pub dequeue_timeout_ms: u64,
    /// Prefetch count used when `checkout` is called without an explicit spec.
    #[serde(default = "default_prefetch")]
    pub initial_prefetch: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            soft_limit: DEFAULT_SOFT_LIMIT,
            resend_after_ms: DEFAULT_RESEND_AFTER_MS,
            dequeue_timeout_ms: DEFAULT_DEQUEUE_TIMEOUT_MS,
            initial_prefetch: DEFAULT_PREFETCH,
        }
    }
}

impl SessionConfig {
    pub fn resend_after(&self) -> Duration {
        Duration::from_millis(self.resend_after_ms)
    }

    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }
}

fn default_soft_limit() -> usize {
    DEFAULT_SOFT_LIMIT
}

fn default_resend_after_ms() -> u64 {
    DEFAULT_RESEND_AFTER_MS
}

fn default_dequeue_timeout_ms() -> u64 {
    DEFAULT_DEQUEUE_TIMEOUT_MS
}

fn default_prefetch() -> u32 {
    DEFAULT_PREFETCH
}

impl Config {
    /// Load configuration from a specific file (TOML or JSON based on extension).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let data = fs::read_to_string(path_ref)
            .with_context(|| format!("unable to read config {}", path_ref.display()))?;
        if is_json(path_ref) {
            serde_json::from_str(&data)
                .with_context(|| format!("invalid JSON config {}", path_ref.display()))
        } else {
            toml::from_str(&data)
                .with_context(|| format!("invalid TOML config {}", path_ref.display()))
        }
    }

    /// Reject values a session cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.queue.name.is_empty() {
            anyhow::bail!("queue.name must not be empty");
        }
        if self.session.soft_limit == 0 {
            anyhow::bail!("session.soft_limit must be at least 1");
        }
        Ok(())
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_fill_missing_session_fields() {
        let cfg: Config = toml::from_str(
            r#"
            [queue]
            name = "orders"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.session.soft_limit, DEFAULT_SOFT_LIMIT);
        assert_eq!(cfg.session.resend_after(), Duration::from_millis(2_000));
        assert_eq!(cfg.session.initial_prefetch, DEFAULT_PREFETCH);
        assert!(cfg.queue.dead_letter.is_none());
        cfg.validate().unwrap();
    }

    #[test]
    fn parses_full_toml() {
        let cfg: Config = toml::from_str(
            r#"
            [queue]
            name = "orders"
            dead_letter = { handler = "audit", args = ["orders"] }

            [session]
            endpoints = ["node-a", "node-b"]
            soft_limit = 8
            resend_after_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(cfg.session.endpoints, vec!["node-a", "node-b"]);
        assert_eq!(cfg.session.soft_limit, 8);
        assert_eq!(
            cfg.queue.dead_letter,
            Some(DeadLetterRef {
                handler: "audit".into(),
                args: vec!["orders".into()],
            })
        );
    }

    #[test]
    fn load_rejects_invalid_values() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[queue]\nname = \"\"").unwrap();
        let cfg = Config::load(file.path()).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_accepts_json() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        writeln!(file, "{{\"queue\": {{\"name\": \"orders\"}}}}").unwrap();
        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.queue.name, "orders");
    }
}
