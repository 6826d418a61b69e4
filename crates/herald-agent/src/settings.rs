use std::{path::PathBuf, time::Duration};

use crate::log_sink::LogLimits;

const DEFAULT_LOG_FILE_MAX_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB
const DEFAULT_LOG_FILE_MAX_FILES: usize = 3;
const DEFAULT_JOB_LOG_KEEP: usize = 200;
const DEFAULT_KILL_GRACE_MS: u64 = 5000;

pub fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

pub fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

pub fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

pub fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name)
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
            .as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Filesystem layout and process knobs for the launcher.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Parent of every owner's storage scope.
    pub storage_root: PathBuf,
    /// Where staged secrets files live while a job runs.
    pub scratch_dir: PathBuf,
    /// Per-job stdout/stderr files; `None` keeps job output in tracing only.
    pub job_log_dir: Option<PathBuf>,
    pub script_dir: PathBuf,
    pub program: String,
    pub kill_grace: Duration,
    /// Rollover and retention for files under `job_log_dir`.
    pub job_logs: LogLimits,
}

impl AgentSettings {
    /// Layout rooted at `data_root`, with every other knob at its default.
    pub fn with_data_root(data_root: impl Into<PathBuf>) -> Self {
        let data_root = data_root.into();
        Self {
            storage_root: data_root.join("scrape_data"),
            scratch_dir: data_root.join("temp"),
            job_log_dir: Some(data_root.join("job_logs")),
            script_dir: PathBuf::from("script"),
            program: "python3".to_string(),
            kill_grace: Duration::from_millis(DEFAULT_KILL_GRACE_MS),
            job_logs: LogLimits {
                segment_bytes: DEFAULT_LOG_FILE_MAX_BYTES,
                segments: DEFAULT_LOG_FILE_MAX_FILES,
                keep_jobs: DEFAULT_JOB_LOG_KEEP,
            },
        }
    }

    pub fn from_env() -> Self {
        let data_root = env_path("HERALD_DATA_ROOT").unwrap_or_else(|| PathBuf::from("data"));
        let mut s = Self::with_data_root(&data_root);

        if let Some(p) = env_path("HERALD_STORAGE_ROOT") {
            s.storage_root = p;
        }
        if let Some(p) = env_path("HERALD_SCRATCH_DIR") {
            s.scratch_dir = p;
        }
        if env_flag("HERALD_JOB_LOG_DISABLED") {
            s.job_log_dir = None;
        } else if let Some(p) = env_path("HERALD_JOB_LOG_DIR") {
            s.job_log_dir = Some(p);
        }
        if let Some(p) = env_path("HERALD_SCRIPT_DIR") {
            s.script_dir = p;
        }
        if let Ok(v) = std::env::var("HERALD_PYTHON")
            && !v.trim().is_empty()
        {
            s.program = v.trim().to_string();
        }

        s.kill_grace = Duration::from_millis(
            env_u64("HERALD_KILL_GRACE_MS")
                .map(|v| v.clamp(100, 60_000))
                .unwrap_or(DEFAULT_KILL_GRACE_MS),
        );
        s.job_logs.segment_bytes = env_u64("HERALD_LOG_FILE_MAX_BYTES")
            .map(|v| v.clamp(256 * 1024, 1024 * 1024 * 1024))
            .unwrap_or(DEFAULT_LOG_FILE_MAX_BYTES);
        s.job_logs.segments = env_usize("HERALD_LOG_FILE_MAX_FILES")
            .map(|v| v.clamp(1, 20))
            .unwrap_or(DEFAULT_LOG_FILE_MAX_FILES);
        s.job_logs.keep_jobs = env_usize("HERALD_JOB_LOG_KEEP")
            .map(|v| v.clamp(1, 100_000))
            .unwrap_or(DEFAULT_JOB_LOG_KEEP);
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_root_layout() {
        let s = AgentSettings::with_data_root("/srv/herald");
        assert_eq!(s.storage_root, PathBuf::from("/srv/herald/scrape_data"));
        assert_eq!(s.scratch_dir, PathBuf::from("/srv/herald/temp"));
        assert_eq!(s.job_log_dir, Some(PathBuf::from("/srv/herald/job_logs")));
        assert_eq!(s.program, "python3");
        assert_eq!(s.job_logs.segments, 3);
        assert_eq!(s.job_logs.keep_jobs, 200);
    }
}
