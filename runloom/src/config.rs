//! Server configuration, read once from the environment at startup.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} must be a valid {expected} (got {value:?})")]
    Invalid {
        key: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Environment-driven runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Worker → server callback endpoint for control/slot IPC.
    pub ipc_url: Option<String>,
    /// Blob upload URL prefix; file outputs are base64-inlined if unset.
    pub upload_url: Option<String>,
    /// Scratch directory for downloaded inputs and worker-written outputs.
    pub working_directory: PathBuf,
    /// Dynamic mode: number of procedure slots.
    pub max_runners: usize,
    /// Fixed mode: number of concurrent predictions per worker.
    pub concurrency_max: usize,
    /// Ignore SIGTERM and wait for explicit `/shutdown` or SIGINT.
    pub await_explicit_shutdown: bool,
    /// Grace period between signaling worker shutdown and force-killing it.
    pub runner_shutdown_grace_period: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            ipc_url: env_string("IPC_URL"),
            upload_url: env_string("UPLOAD_URL"),
            working_directory: env_string("WORKING_DIRECTORY")
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join("runloom")),
            max_runners: env_parsed("MAX_RUNNERS", 1)?,
            concurrency_max: env_parsed("CONCURRENCY_MAX", 1)?,
            await_explicit_shutdown: env_bool("AWAIT_EXPLICIT_SHUTDOWN", false)?,
            runner_shutdown_grace_period: Duration::from_secs(env_parsed(
                "RUNNER_SHUTDOWN_GRACE_PERIOD",
                30,
            )?),
        })
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parsed<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match env_string(key) {
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
            key,
            expected: "integer",
            value,
        }),
        None => Ok(default),
    }
}

fn env_bool(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env_string(key) {
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key,
                expected: "boolean (1/0/true/false/yes/no)",
                value,
            }),
        },
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_vars() {
        for key in [
            "IPC_URL",
            "UPLOAD_URL",
            "WORKING_DIRECTORY",
            "MAX_RUNNERS",
            "CONCURRENCY_MAX",
            "AWAIT_EXPLICIT_SHUTDOWN",
            "RUNNER_SHUTDOWN_GRACE_PERIOD",
        ] {
            unsafe { std::env::remove_var(key) };
        }
    }

    #[test]
    fn defaults_with_no_environment() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_vars();

        let config = Config::from_env().unwrap();
        assert_eq!(config.max_runners, 1);
        assert_eq!(config.concurrency_max, 1);
        assert!(!config.await_explicit_shutdown);
        assert_eq!(config.runner_shutdown_grace_period, Duration::from_secs(30));
        assert!(config.ipc_url.is_none());
        assert!(config.upload_url.is_none());
    }

    #[test]
    fn reads_all_variables() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_vars();

        unsafe {
            std::env::set_var("IPC_URL", "unix:///tmp/ipc.sock");
            std::env::set_var("UPLOAD_URL", "https://up.example/");
            std::env::set_var("WORKING_DIRECTORY", "/tmp/runloom-work");
            std::env::set_var("MAX_RUNNERS", "4");
            std::env::set_var("CONCURRENCY_MAX", "8");
            std::env::set_var("AWAIT_EXPLICIT_SHUTDOWN", "true");
            std::env::set_var("RUNNER_SHUTDOWN_GRACE_PERIOD", "60");
        }

        let config = Config::from_env().unwrap();
        assert_eq!(config.ipc_url.as_deref(), Some("unix:///tmp/ipc.sock"));
        assert_eq!(config.upload_url.as_deref(), Some("https://up.example/"));
        assert_eq!(config.working_directory, PathBuf::from("/tmp/runloom-work"));
        assert_eq!(config.max_runners, 4);
        assert_eq!(config.concurrency_max, 8);
        assert!(config.await_explicit_shutdown);
        assert_eq!(config.runner_shutdown_grace_period, Duration::from_secs(60));

        clear_vars();
    }

    #[test]
    fn rejects_invalid_integer() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_vars();
        unsafe { std::env::set_var("MAX_RUNNERS", "not-a-number") };

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "MAX_RUNNERS", .. }));

        clear_vars();
    }

    #[test]
    fn rejects_invalid_bool() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_vars();
        unsafe { std::env::set_var("AWAIT_EXPLICIT_SHUTDOWN", "maybe") };

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "AWAIT_EXPLICIT_SHUTDOWN",
                ..
            }
        ));

        clear_vars();
    }
}
