//! Runtime configuration.
//!
//! # Example
//!
//! ```
//! use keystone_runtime::config::RuntimeConfig;
//! use std::time::Duration;
//!
//! let config = RuntimeConfig::default()
//!     .with_debounce_window(Duration::from_millis(150))
//!     .with_max_concurrent_actions(4);
//!
//! assert_eq!(config.max_concurrent_actions, 4);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Environment variable overriding [`RuntimeConfig::debounce_window`] (milliseconds).
pub const ENV_DEBOUNCE_MS: &str = "CHANGE_EVENT_DEBOUNCE_MS";
/// Environment variable overriding [`RuntimeConfig::max_concurrent_actions`].
pub const ENV_MAX_CONCURRENT: &str = "ACTION_QUEUE_MAX_CONCURRENT";
/// Environment variable overriding [`RuntimeConfig::default_wait_timeout`] (milliseconds).
pub const ENV_WAIT_TIMEOUT_MS: &str = "CHANGE_WAIT_TIMEOUT_MS";
/// Environment variable overriding [`RuntimeConfig::defer_until_app_init`].
pub const ENV_DEFER_UNTIL_APP_INIT: &str = "DEFER_UNTIL_APP_INIT";

/// Configuration shared by the bus, the dispatcher and its queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Minimum interval between two accepted events of the same type
    pub debounce_window: Duration,
    /// Upper bound on concurrently running dispatched actions
    pub max_concurrent_actions: usize,
    /// Timeout used by `wait_for_change_actions_default`
    pub default_wait_timeout: Duration,
    /// Buffer events until `APP_INIT_DONE` is observed
    pub defer_until_app_init: bool,
}

impl RuntimeConfig {
    /// Create a configuration with explicit values.
    #[must_use]
    pub const fn new(
        debounce_window: Duration,
        max_concurrent_actions: usize,
        default_wait_timeout: Duration,
    ) -> Self {
        Self {
            debounce_window,
            max_concurrent_actions,
            default_wait_timeout,
            defer_until_app_init: false,
        }
    }

    /// Defaults overridden by environment variables.
    ///
    /// Absent variables keep their default; unparsable ones are logged and
    /// ignored.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an injectable lookup.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let debounce_ms = parse_var::<u64, _>(&lookup, ENV_DEBOUNCE_MS);
        let max_concurrent = parse_var::<usize, _>(&lookup, ENV_MAX_CONCURRENT);
        let wait_ms = parse_var::<u64, _>(&lookup, ENV_WAIT_TIMEOUT_MS);
        let defer = parse_var::<bool, _>(&lookup, ENV_DEFER_UNTIL_APP_INIT);

        Self {
            debounce_window: debounce_ms.map_or(defaults.debounce_window, Duration::from_millis),
            max_concurrent_actions: max_concurrent.unwrap_or(defaults.max_concurrent_actions),
            default_wait_timeout: wait_ms.map_or(defaults.default_wait_timeout, Duration::from_millis),
            defer_until_app_init: defer.unwrap_or(defaults.defer_until_app_init),
        }
    }

    /// Set the debounce window
    #[must_use]
    pub const fn with_debounce_window(mut self, window: Duration) -> Self {
        self.debounce_window = window;
        self
    }

    /// Set the action concurrency bound (clamped to at least 1 by the queue)
    #[must_use]
    pub const fn with_max_concurrent_actions(mut self, max: usize) -> Self {
        self.max_concurrent_actions = max;
        self
    }

    /// Set the default wait timeout
    #[must_use]
    pub const fn with_default_wait_timeout(mut self, timeout: Duration) -> Self {
        self.default_wait_timeout = timeout;
        self
    }

    /// Enable or disable buffering until `APP_INIT_DONE`
    #[must_use]
    pub const fn with_defer_until_app_init(mut self, defer: bool) -> Self {
        self.defer_until_app_init = defer;
        self
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_millis(300),
            max_concurrent_actions: 1,
            default_wait_timeout: Duration::from_secs(10),
            defer_until_app_init: false,
        }
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparsable configuration value");
            None
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let config = RuntimeConfig::default();
        assert_eq!(config.debounce_window, Duration::from_millis(300));
        assert_eq!(config.max_concurrent_actions, 1);
        assert_eq!(config.default_wait_timeout, Duration::from_secs(10));
        assert!(!config.defer_until_app_init);
    }

    #[test]
    fn lookup_overrides_defaults() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (ENV_DEBOUNCE_MS, "50"),
            (ENV_MAX_CONCURRENT, "3"),
            (ENV_DEFER_UNTIL_APP_INIT, "true"),
        ]);
        let config = RuntimeConfig::from_lookup(|key| vars.get(key).map(ToString::to_string));

        assert_eq!(config.debounce_window, Duration::from_millis(50));
        assert_eq!(config.max_concurrent_actions, 3);
        assert_eq!(config.default_wait_timeout, Duration::from_secs(10));
        assert!(config.defer_until_app_init);
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let config = RuntimeConfig::from_lookup(|key| {
            (key == ENV_DEBOUNCE_MS).then(|| "soon".to_string())
        });
        assert_eq!(config.debounce_window, Duration::from_millis(300));
    }
}
