use std::path::PathBuf;
use std::time::Duration;

use atelier_comfyui::completion::CompletionConfig;

use crate::queue::QueueConfig;

/// Worker configuration loaded from environment variables.
///
/// All fields have defaults suitable for a local ComfyUI.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// ComfyUI base URL (default: `http://localhost:8188`).
    pub comfyui_url: String,
    /// Inline workflow template; takes precedence over `workflow_path`.
    pub workflow_json: Option<String>,
    /// Workflow template file (default: `workflow.json`).
    pub workflow_path: PathBuf,
    /// Where generated images are written (default: `output`).
    pub output_dir: PathBuf,
    /// Whole-job guard (default: 300s).
    pub job_timeout: Duration,
    pub completion: CompletionConfig,
    /// Watchdog sweep period (default: 300s).
    pub watchdog_interval: Duration,
    /// Backlog size that triggers a warning (default: `10`).
    pub queue_warn_depth: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got '{value}'")]
    Invalid {
        var: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("COMPLETION_TIMEOUT_SECS ({completion:?}) must be less than JOB_TIMEOUT_SECS ({job:?})")]
    TimeoutOrder { completion: Duration, job: Duration },
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// The completion budget must be shorter than the job timeout, so
    /// that a stuck prompt is cancelled on the backend before the queue
    /// gives up on the job.
    ///
    /// | Env Var                    | Default                 |
    /// |----------------------------|-------------------------|
    /// | `COMFYUI_URL`              | `http://localhost:8188` |
    /// | `WORKFLOW_JSON`            | unset                   |
    /// | `WORKFLOW_PATH`            | `workflow.json`         |
    /// | `OUTPUT_DIR`               | `output`                |
    /// | `JOB_TIMEOUT_SECS`         | `300`                   |
    /// | `COMPLETION_TIMEOUT_SECS`  | `280`                   |
    /// | `STREAM_RECV_TIMEOUT_SECS` | `5`                     |
    /// | `POLL_INTERVAL_SECS`       | `2`                     |
    /// | `WATCHDOG_INTERVAL_SECS`   | `300`                   |
    /// | `QUEUE_WARN_DEPTH`         | `10`                    |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reading from `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str, default: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let comfyui_url = var("COMFYUI_URL", "http://localhost:8188");
        let workflow_json = lookup("WORKFLOW_JSON").filter(|v| !v.trim().is_empty());
        let workflow_path = PathBuf::from(var("WORKFLOW_PATH", "workflow.json"));
        let output_dir = PathBuf::from(var("OUTPUT_DIR", "output"));

        let job_timeout = secs("JOB_TIMEOUT_SECS", &var("JOB_TIMEOUT_SECS", "300"))?;
        let completion = CompletionConfig {
            timeout: secs("COMPLETION_TIMEOUT_SECS", &var("COMPLETION_TIMEOUT_SECS", "280"))?,
            recv_timeout: secs("STREAM_RECV_TIMEOUT_SECS", &var("STREAM_RECV_TIMEOUT_SECS", "5"))?,
            poll_interval: secs("POLL_INTERVAL_SECS", &var("POLL_INTERVAL_SECS", "2"))?,
        };
        if completion.timeout >= job_timeout {
            return Err(ConfigError::TimeoutOrder {
                completion: completion.timeout,
                job: job_timeout,
            });
        }
        let watchdog_interval =
            secs("WATCHDOG_INTERVAL_SECS", &var("WATCHDOG_INTERVAL_SECS", "300"))?;

        let raw_depth = var("QUEUE_WARN_DEPTH", "10");
        let queue_warn_depth = raw_depth.parse().map_err(|_| ConfigError::Invalid {
            var: "QUEUE_WARN_DEPTH",
            value: raw_depth.clone(),
            expected: "a non-negative integer",
        })?;

        Ok(Self {
            comfyui_url,
            workflow_json,
            workflow_path,
            output_dir,
            job_timeout,
            completion,
            watchdog_interval,
            queue_warn_depth,
        })
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            job_timeout: self.job_timeout,
            warn_depth: self.queue_warn_depth,
        }
    }
}

/// Parse a positive whole number of seconds.
fn secs(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
    match value.parse::<u64>() {
        Ok(n) if n > 0 => Ok(Duration::from_secs(n)),
        _ => Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            expected: "a positive number of seconds",
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<WorkerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = load(&[]).unwrap();
        assert_eq!(config.comfyui_url, "http://localhost:8188");
        assert_eq!(config.workflow_json, None);
        assert_eq!(config.workflow_path, PathBuf::from("workflow.json"));
        assert_eq!(config.output_dir, PathBuf::from("output"));
        assert_eq!(config.job_timeout, Duration::from_secs(300));
        assert_eq!(config.completion.timeout, Duration::from_secs(280));
        assert!(config.completion.timeout < config.job_timeout);
        assert_eq!(config.completion.recv_timeout, Duration::from_secs(5));
        assert_eq!(config.completion.poll_interval, Duration::from_secs(2));
        assert_eq!(config.watchdog_interval, Duration::from_secs(300));
        assert_eq!(config.queue_warn_depth, 10);
    }

    #[test]
    fn overrides_are_read() {
        let config = load(&[
            ("COMFYUI_URL", "https://gpu.internal:8443"),
            ("WORKFLOW_JSON", r#"{"1":{}}"#),
            ("JOB_TIMEOUT_SECS", "60"),
            ("COMPLETION_TIMEOUT_SECS", "45"),
            ("POLL_INTERVAL_SECS", "1"),
            ("QUEUE_WARN_DEPTH", "3"),
        ])
        .unwrap();
        assert_eq!(config.comfyui_url, "https://gpu.internal:8443");
        assert_eq!(config.workflow_json.as_deref(), Some(r#"{"1":{}}"#));
        assert_eq!(config.queue_config().job_timeout, Duration::from_secs(60));
        assert_eq!(config.queue_config().warn_depth, 3);
        assert_eq!(config.completion.poll_interval, Duration::from_secs(1));
        assert_eq!(config.completion.timeout, Duration::from_secs(45));
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = load(&[("OUTPUT_DIR", "  "), ("WORKFLOW_JSON", "")]).unwrap();
        assert_eq!(config.output_dir, PathBuf::from("output"));
        assert_eq!(config.workflow_json, None);
    }

    #[test]
    fn rejects_zero_and_garbage_durations() {
        assert_matches!(
            load(&[("WATCHDOG_INTERVAL_SECS", "0")]),
            Err(ConfigError::Invalid { var: "WATCHDOG_INTERVAL_SECS", .. })
        );
        assert_matches!(
            load(&[("JOB_TIMEOUT_SECS", "soon")]),
            Err(ConfigError::Invalid { var: "JOB_TIMEOUT_SECS", .. })
        );
        assert_matches!(
            load(&[("QUEUE_WARN_DEPTH", "-1")]),
            Err(ConfigError::Invalid { var: "QUEUE_WARN_DEPTH", .. })
        );
    }

    #[test]
    fn completion_budget_must_fit_inside_job_timeout() {
        assert_matches!(
            load(&[("JOB_TIMEOUT_SECS", "60"), ("COMPLETION_TIMEOUT_SECS", "60")]),
            Err(ConfigError::TimeoutOrder { completion, job })
                if completion == Duration::from_secs(60) && job == Duration::from_secs(60)
        );
        assert_matches!(
            load(&[("JOB_TIMEOUT_SECS", "120")]),
            Err(ConfigError::TimeoutOrder { .. })
        );
        let config = load(&[("JOB_TIMEOUT_SECS", "120"), ("COMPLETION_TIMEOUT_SECS", "100")]).unwrap();
        assert_eq!(config.completion.timeout, Duration::from_secs(100));
    }
}
