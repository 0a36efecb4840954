//! Configuration resolution for console adapters.
//!
//! Every value follows the same three-tier priority:
//!
//! 1. **Parameter** - Explicitly provided function parameter (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `CONSOLE_TIMEOUT_SECS` | 0 | Session idle timeout in seconds, 0 disables it |
//! | `CONSOLE_WATCHDOG_INTERVAL_SECS` | 20 | Idle watchdog poll interval in seconds |
//! | `CONSOLE_MAX_CONNECTIONS` | 2 | Concurrent connections accepted per adapter |
//! | `CONSOLE_TELNET_PORT` | 6666 | Telnet listen port |
//! | `CONSOLE_SSH_PORT` | 5559 | SSH listen port |
//! | `CONSOLE_PUBLISH_RETRIES` | 3 | MQTT publish retry attempts |
//! | `CONSOLE_PUBLISH_RETRY_DELAY_MS` | 200 | Initial MQTT publish retry delay |

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Default idle timeout in seconds (disabled)
pub(crate) const DEFAULT_TIMEOUT_SECS: u64 = 0;

/// Default watchdog poll interval in seconds
pub(crate) const DEFAULT_WATCHDOG_INTERVAL_SECS: u64 = 20;

/// Default number of concurrent connections per adapter
pub(crate) const DEFAULT_MAX_CONNECTIONS: usize = 2;

/// Default Telnet port
pub(crate) const DEFAULT_TELNET_PORT: u16 = 6666;

/// Default SSH port
pub(crate) const DEFAULT_SSH_PORT: u16 = 5559;

/// Default number of publish retries
pub(crate) const DEFAULT_PUBLISH_RETRIES: u32 = 3;

/// Default initial publish retry delay in milliseconds
pub(crate) const DEFAULT_PUBLISH_RETRY_DELAY_MS: u64 = 200;

/// Upper bound for a single publish retry delay
pub(crate) const MAX_PUBLISH_RETRY_DELAY: Duration = Duration::from_secs(2);

pub(crate) const TIMEOUT_ENV_VAR: &str = "CONSOLE_TIMEOUT_SECS";
pub(crate) const WATCHDOG_INTERVAL_ENV_VAR: &str = "CONSOLE_WATCHDOG_INTERVAL_SECS";
pub(crate) const MAX_CONNECTIONS_ENV_VAR: &str = "CONSOLE_MAX_CONNECTIONS";
pub(crate) const TELNET_PORT_ENV_VAR: &str = "CONSOLE_TELNET_PORT";
pub(crate) const SSH_PORT_ENV_VAR: &str = "CONSOLE_SSH_PORT";
pub(crate) const PUBLISH_RETRIES_ENV_VAR: &str = "CONSOLE_PUBLISH_RETRIES";
pub(crate) const PUBLISH_RETRY_DELAY_MS_ENV_VAR: &str = "CONSOLE_PUBLISH_RETRY_DELAY_MS";

/// Shared resolution: parameter, then parsable env var, then default.
fn resolve<T: FromStr>(param: Option<T>, env_var: &str, default: T) -> T {
    if let Some(value) = param {
        return value;
    }

    if let Ok(raw) = env::var(env_var)
        && let Ok(value) = raw.trim().parse::<T>()
    {
        return value;
    }

    default
}

/// Resolve the session idle timeout. A zero duration disables the watchdog.
pub fn resolve_timeout(timeout_param: Option<Duration>) -> Duration {
    let secs = resolve(
        timeout_param.map(|d| d.as_secs()),
        TIMEOUT_ENV_VAR,
        DEFAULT_TIMEOUT_SECS,
    );
    Duration::from_secs(secs)
}

/// Resolve the idle watchdog poll interval. Zero is bumped to one second.
pub fn resolve_watchdog_interval(interval_param: Option<Duration>) -> Duration {
    if let Some(interval) = interval_param {
        return interval.max(Duration::from_millis(1));
    }
    let secs = resolve(
        None,
        WATCHDOG_INTERVAL_ENV_VAR,
        DEFAULT_WATCHDOG_INTERVAL_SECS,
    );
    Duration::from_secs(secs.max(1))
}

/// Resolve the number of concurrent connections an adapter accepts.
pub fn resolve_max_connections(max_param: Option<usize>) -> usize {
    resolve(max_param, MAX_CONNECTIONS_ENV_VAR, DEFAULT_MAX_CONNECTIONS)
}

/// Resolve the Telnet listen port.
pub fn resolve_telnet_port(port_param: Option<u16>) -> u16 {
    resolve(port_param, TELNET_PORT_ENV_VAR, DEFAULT_TELNET_PORT)
}

/// Resolve the SSH listen port.
pub fn resolve_ssh_port(port_param: Option<u16>) -> u16 {
    resolve(port_param, SSH_PORT_ENV_VAR, DEFAULT_SSH_PORT)
}

/// Resolve how many times a failed MQTT publish is retried.
pub fn resolve_publish_retries(retries_param: Option<u32>) -> u32 {
    resolve(
        retries_param,
        PUBLISH_RETRIES_ENV_VAR,
        DEFAULT_PUBLISH_RETRIES,
    )
}

/// Resolve the initial delay between MQTT publish retries.
pub fn resolve_publish_retry_delay(delay_param: Option<Duration>) -> Duration {
    let millis = resolve(
        delay_param.map(|d| d.as_millis() as u64),
        PUBLISH_RETRY_DELAY_MS_ENV_VAR,
        DEFAULT_PUBLISH_RETRY_DELAY_MS,
    );
    Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    // SAFETY: Tests are serialized via ENV_TEST_MUTEX to prevent data races
    static ENV_TEST_MUTEX: once_cell::sync::Lazy<StdMutex<()>> =
        once_cell::sync::Lazy::new(|| StdMutex::new(()));

    /// SAFETY: Must be called while holding ENV_TEST_MUTEX to prevent data races.
    unsafe fn set_env(key: &str, value: &str) {
        // SAFETY: Caller ensures ENV_TEST_MUTEX is held
        unsafe { env::set_var(key, value) };
    }

    /// SAFETY: Must be called while holding ENV_TEST_MUTEX to prevent data races.
    unsafe fn remove_env(key: &str) {
        // SAFETY: Caller ensures ENV_TEST_MUTEX is held
        unsafe { env::remove_var(key) };
    }

    mod timeout {
        use super::*;

        #[test]
        fn test_uses_param_when_provided() {
            assert_eq!(
                resolve_timeout(Some(Duration::from_secs(10))),
                Duration::from_secs(10)
            );
        }

        #[test]
        fn test_uses_env_var_when_no_param() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe { set_env(TIMEOUT_ENV_VAR, "45") };
            let result = resolve_timeout(None);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe { remove_env(TIMEOUT_ENV_VAR) };
            assert_eq!(result, Duration::from_secs(45));
        }

        #[test]
        fn test_default_is_disabled() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe { remove_env(TIMEOUT_ENV_VAR) };
            assert_eq!(resolve_timeout(None), Duration::ZERO);
        }

        #[test]
        fn test_ignores_invalid_env_var() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe { set_env(TIMEOUT_ENV_VAR, "soon") };
            let result = resolve_timeout(None);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe { remove_env(TIMEOUT_ENV_VAR) };
            assert_eq!(result, Duration::ZERO);
        }
    }

    mod watchdog_interval {
        use super::*;

        #[test]
        fn test_param_wins() {
            assert_eq!(
                resolve_watchdog_interval(Some(Duration::from_millis(50))),
                Duration::from_millis(50)
            );
        }

        #[test]
        fn test_zero_env_is_bumped() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe { set_env(WATCHDOG_INTERVAL_ENV_VAR, "0") };
            let result = resolve_watchdog_interval(None);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe { remove_env(WATCHDOG_INTERVAL_ENV_VAR) };
            assert_eq!(result, Duration::from_secs(1));
        }

        #[test]
        fn test_default() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe { remove_env(WATCHDOG_INTERVAL_ENV_VAR) };
            assert_eq!(
                resolve_watchdog_interval(None),
                Duration::from_secs(DEFAULT_WATCHDOG_INTERVAL_SECS)
            );
        }
    }

    mod max_connections {
        use super::*;

        #[test]
        fn test_param_takes_priority_over_env() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe { set_env(MAX_CONNECTIONS_ENV_VAR, "9") };
            let result = resolve_max_connections(Some(4));
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe { remove_env(MAX_CONNECTIONS_ENV_VAR) };
            assert_eq!(result, 4);
        }

        #[test]
        fn test_ignores_negative_env_var() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe { set_env(MAX_CONNECTIONS_ENV_VAR, "-1") };
            let result = resolve_max_connections(None);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe { remove_env(MAX_CONNECTIONS_ENV_VAR) };
            assert_eq!(result, DEFAULT_MAX_CONNECTIONS);
        }
    }

    mod ports {
        use super::*;

        #[test]
        fn test_telnet_env() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe { set_env(TELNET_PORT_ENV_VAR, " 2323 ") };
            let result = resolve_telnet_port(None);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe { remove_env(TELNET_PORT_ENV_VAR) };
            assert_eq!(result, 2323);
        }

        #[test]
        fn test_ssh_out_of_range_env_uses_default() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe { set_env(SSH_PORT_ENV_VAR, "70000") };
            let result = resolve_ssh_port(None);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe { remove_env(SSH_PORT_ENV_VAR) };
            assert_eq!(result, DEFAULT_SSH_PORT);
        }
    }

    mod publish_retry {
        use super::*;

        #[test]
        fn test_zero_retries_is_valid() {
            assert_eq!(resolve_publish_retries(Some(0)), 0);
        }

        #[test]
        fn test_delay_from_env() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe { set_env(PUBLISH_RETRY_DELAY_MS_ENV_VAR, "750") };
            let result = resolve_publish_retry_delay(None);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe { remove_env(PUBLISH_RETRY_DELAY_MS_ENV_VAR) };
            assert_eq!(result, Duration::from_millis(750));
        }
    }
}
