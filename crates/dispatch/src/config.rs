//! Daemon configuration: one file, one subscription block per target system.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use campusidm_events::EligibilityWindow;

use crate::collector::{BackfillConfig, ListenerConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("no subscription configured for target system '{0}'")]
    UnknownTarget(String),
}

/// One target system's dispatch settings.
///
/// The defaults mirror a conservative production posture: single worker,
/// three-minute sweeps, ten failures before exclusion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Target system this subscription delivers to. Also the default
    /// notification channel when `channels` is empty.
    pub target_system: String,

    /// Notification channels to listen on. Names are passed to the store
    /// verbatim; whether they fold case is the store's business.
    #[serde(default)]
    pub channels: Vec<String>,

    /// Registered handler name resolving delivery logic for this target.
    pub handler: String,

    /// Worker tasks draining the queue for this subscription.
    #[serde(default = "defaults::concurrency")]
    pub concurrency: usize,

    /// Seconds between backfill sweep cycles.
    #[serde(default = "defaults::run_interval_secs")]
    pub run_interval_secs: u64,

    /// Failures before an event is excluded from automatic retry.
    #[serde(default = "defaults::fail_limit")]
    pub fail_limit: u32,

    /// Seconds a lease must be stale before the sweep reclaims it.
    #[serde(default = "defaults::failed_delay_secs")]
    pub failed_delay_secs: u64,

    /// Seconds before a never-attempted event counts as overdue.
    #[serde(default = "defaults::unpropagated_delay_secs")]
    pub unpropagated_delay_secs: u64,

    /// Blocking-wait granularity for listener polls, worker dequeues, and
    /// sweep sleep slices. Bounds shutdown latency.
    #[serde(default = "defaults::poll_timeout_secs")]
    pub poll_timeout_secs: u64,

    /// Seconds between reconnect attempts after a lost listen connection.
    #[serde(default = "defaults::reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    /// Run the live (notification) collector for this subscription.
    #[serde(default = "defaults::enabled")]
    pub enable_listener: bool,

    /// Run the backfill collector for this subscription.
    #[serde(default = "defaults::enabled")]
    pub enable_collector: bool,
}

mod defaults {
    pub fn concurrency() -> usize {
        1
    }
    pub fn run_interval_secs() -> u64 {
        180
    }
    pub fn fail_limit() -> u32 {
        10
    }
    pub fn failed_delay_secs() -> u64 {
        20 * 60
    }
    pub fn unpropagated_delay_secs() -> u64 {
        90 * 60
    }
    pub fn poll_timeout_secs() -> u64 {
        5
    }
    pub fn reconnect_delay_secs() -> u64 {
        5
    }
    pub fn enabled() -> bool {
        true
    }
}

impl SubscriptionConfig {
    /// A subscription with all defaults, delivering `target` via the builtin
    /// log handler.
    pub fn for_target(target: impl Into<String>) -> Self {
        Self {
            target_system: target.into(),
            channels: Vec::new(),
            handler: "log".to_string(),
            concurrency: defaults::concurrency(),
            run_interval_secs: defaults::run_interval_secs(),
            fail_limit: defaults::fail_limit(),
            failed_delay_secs: defaults::failed_delay_secs(),
            unpropagated_delay_secs: defaults::unpropagated_delay_secs(),
            poll_timeout_secs: defaults::poll_timeout_secs(),
            reconnect_delay_secs: defaults::reconnect_delay_secs(),
            enable_listener: defaults::enabled(),
            enable_collector: defaults::enabled(),
        }
    }

    /// Channels to subscribe to; falls back to the target system name.
    pub fn effective_channels(&self) -> Vec<String> {
        if self.channels.is_empty() {
            vec![self.target_system.clone()]
        } else {
            self.channels.clone()
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn eligibility_window(&self) -> EligibilityWindow {
        EligibilityWindow {
            fail_limit: self.fail_limit,
            failed_delay: Duration::from_secs(self.failed_delay_secs),
            unpropagated_delay: Duration::from_secs(self.unpropagated_delay_secs),
        }
    }

    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            channels: self.effective_channels(),
            poll_timeout: self.poll_timeout(),
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
            ..ListenerConfig::default()
        }
    }

    pub fn backfill_config(&self) -> BackfillConfig {
        BackfillConfig {
            run_interval: Duration::from_secs(self.run_interval_secs),
            poll_timeout: self.poll_timeout(),
            window: self.eligibility_window(),
        }
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Change log connection string. The `DATABASE_URL` environment variable
    /// takes precedence at the CLI layer.
    #[serde(default)]
    pub database_url: Option<String>,

    /// Event queue capacity. `None` means unbounded; set a bound when the
    /// backfill sweep can outrun delivery.
    #[serde(default)]
    pub queue_capacity: Option<usize>,

    pub subscriptions: Vec<SubscriptionConfig>,
}

impl DaemonConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// The subscriptions to run: all of them, or just the named target.
    pub fn select(&self, target: Option<&str>) -> Result<Vec<SubscriptionConfig>, ConfigError> {
        match target {
            None => Ok(self.subscriptions.clone()),
            Some(name) => {
                let selected: Vec<_> = self
                    .subscriptions
                    .iter()
                    .filter(|s| s.target_system == name)
                    .cloned()
                    .collect();
                if selected.is_empty() {
                    Err(ConfigError::UnknownTarget(name.to_string()))
                } else {
                    Ok(selected)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    #[test]
    fn minimal_subscription_fills_defaults() {
        let config: SubscriptionConfig =
            serde_json::from_str(r#"{"target_system": "AD", "handler": "log"}"#).unwrap();
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.run_interval_secs, 180);
        assert_eq!(config.fail_limit, 10);
        assert_eq!(config.failed_delay_secs, 1200);
        assert_eq!(config.unpropagated_delay_secs, 5400);
        assert!(config.enable_listener);
        assert!(config.enable_collector);
        assert_eq!(config.effective_channels(), vec!["AD".to_string()]);
    }

    #[test]
    fn explicit_channels_override_target_fallback() {
        let config: SubscriptionConfig = serde_json::from_str(
            r#"{"target_system": "Exchange", "handler": "log",
                "channels": ["exchange_events", "mailbox_events"]}"#,
        )
        .unwrap();
        assert_eq!(
            config.effective_channels(),
            vec!["exchange_events".to_string(), "mailbox_events".to_string()]
        );
    }

    #[test]
    fn window_and_loop_configs_carry_tuned_values() {
        let mut config = SubscriptionConfig::for_target("AD");
        config.fail_limit = 3;
        config.failed_delay_secs = 60;
        config.unpropagated_delay_secs = 120;
        config.run_interval_secs = 30;
        config.poll_timeout_secs = 2;

        let window = config.eligibility_window();
        assert_eq!(window.fail_limit, 3);
        assert_eq!(window.failed_delay, Duration::from_secs(60));
        assert_eq!(window.unpropagated_delay, Duration::from_secs(120));

        let backfill = config.backfill_config();
        assert_eq!(backfill.run_interval, Duration::from_secs(30));
        assert_eq!(backfill.poll_timeout, Duration::from_secs(2));

        let listener = config.listener_config();
        assert_eq!(listener.poll_timeout, Duration::from_secs(2));
        assert_eq!(listener.channels, vec!["AD".to_string()]);
    }

    #[test]
    fn from_file_and_select() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "database_url": "postgres://localhost/campusidm",
                "queue_capacity": 1024,
                "subscriptions": [
                    {{"target_system": "AD", "handler": "log"}},
                    {{"target_system": "Exchange", "handler": "log", "concurrency": 4}}
                ]
            }}"#
        )
        .unwrap();

        let config = DaemonConfig::from_file(file.path()).unwrap();
        assert_eq!(config.queue_capacity, Some(1024));
        assert_eq!(config.subscriptions.len(), 2);

        let all = config.select(None).unwrap();
        assert_eq!(all.len(), 2);

        let exchange = config.select(Some("Exchange")).unwrap();
        assert_eq!(exchange.len(), 1);
        assert_eq!(exchange[0].concurrency, 4);

        let err = config.select(Some("LDAP")).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownTarget(name) if name == "LDAP"));
    }

    #[test]
    fn unreadable_file_is_a_read_error() {
        let err = DaemonConfig::from_file("/nonexistent/config.json").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
