use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    time::SystemTime,
};

use herald_job::JobId;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    sync::mpsc,
    task::JoinHandle,
};

/// Size and retention bounds for per-job log files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogLimits {
    /// Bytes per segment before the job rolls over; 0 never rolls over.
    pub segment_bytes: u64,
    /// Segments kept per job, the live one included.
    pub segments: usize,
    /// Jobs whose logs survive pruning, the job being opened included.
    pub keep_jobs: usize,
}

/// Job-scoped output sink: every line goes to tracing and, when a log
/// directory is configured, to `<dir>/<job_id>.log` through a background
/// writer.
#[derive(Clone, Debug)]
pub struct LogSink {
    job_id: JobId,
    file_tx: Option<mpsc::UnboundedSender<String>>,
}

impl LogSink {
    pub fn tracing_only(job_id: JobId) -> Self {
        Self {
            job_id,
            file_tx: None,
        }
    }

    /// Open the job's log file and start its writer. Logs of older jobs
    /// beyond `limits.keep_jobs` are pruned before the first line lands.
    pub async fn open(job_id: JobId, dir: Option<&Path>, limits: LogLimits) -> Self {
        let Some(dir) = dir else {
            return Self::tracing_only(job_id);
        };

        let mut log = match JobLogFile::create(dir, &job_id, limits).await {
            Ok(f) => f,
            Err(err) => {
                tracing::warn!(
                    %job_id,
                    dir = %dir.display(),
                    error = %err,
                    "failed to open job log file; output goes to tracing only"
                );
                return Self::tracing_only(job_id);
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let dir = dir.to_path_buf();
        let current = job_id.clone();
        tokio::spawn(async move {
            match prune_job_logs(&dir, limits.keep_jobs, &current).await {
                Ok(0) => {}
                Ok(removed) => tracing::debug!(removed, "pruned old job logs"),
                Err(err) => tracing::debug!(error = %err, "job log pruning failed"),
            }

            while let Some(line) = rx.recv().await {
                if let Err(err) = log.append_line(&line).await {
                    tracing::warn!(job_id = %current, error = %err, "job log write failed");
                    break;
                }
            }
            log.file.flush().await.ok();
        });

        Self {
            job_id,
            file_tx: Some(tx),
        }
    }

    pub fn emit(&self, line: impl Into<String>) {
        let line = line.into();
        tracing::debug!(job_id = %self.job_id, "{line}");
        if let Some(tx) = &self.file_tx {
            let _ = tx.send(line);
        }
    }

    /// Forward every line of `reader` into the sink with a stream prefix.
    pub fn drain<R>(&self, reader: R, stream: &'static str) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let sink = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                sink.emit(format!("[{stream}] {line}"));
            }
        })
    }
}

async fn open_append(path: &Path) -> io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

/// One job's output: the live `<job_id>.log`, then `<job_id>.log.1` (most
/// recent) up to `<job_id>.log.<segments - 1>`.
struct JobLogFile {
    live: PathBuf,
    limits: LogLimits,
    written: u64,
    file: tokio::fs::File,
}

impl JobLogFile {
    async fn create(dir: &Path, job_id: &JobId, limits: LogLimits) -> io::Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let live = dir.join(format!("{job_id}.log"));
        let file = open_append(&live).await?;
        let written = file.metadata().await.map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            live,
            limits,
            written,
            file,
        })
    }

    fn segment(&self, n: usize) -> PathBuf {
        let mut name = self.live.clone().into_os_string();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    async fn roll_over(&mut self) -> io::Result<()> {
        self.file.flush().await?;
        let oldest = self.limits.segments.saturating_sub(1);
        if oldest == 0 {
            self.file = tokio::fs::OpenOptions::new()
                .write(true)
                .truncate(true)
                .open(&self.live)
                .await?;
        } else {
            // The rename onto the oldest slot discards what was there.
            for n in (1..oldest).rev() {
                match tokio::fs::rename(self.segment(n), self.segment(n + 1)).await {
                    Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err),
                    _ => {}
                }
            }
            tokio::fs::rename(&self.live, self.segment(1)).await?;
            self.file = open_append(&self.live).await?;
        }
        self.written = 0;
        Ok(())
    }

    async fn append_line(&mut self, line: &str) -> io::Result<()> {
        let len = line.len() as u64 + 1;
        let full = self.limits.segment_bytes > 0
            && self.written > 0
            && self.written.saturating_add(len) > self.limits.segment_bytes;
        if full && let Err(err) = self.roll_over().await {
            tracing::debug!(
                path = %self.live.display(),
                error = %err,
                "job log rollover failed; still appending"
            );
        }

        self.file.write_all(line.as_bytes()).await?;
        self.file.write_all(b"\n").await?;
        self.written = self.written.saturating_add(len);
        Ok(())
    }
}

/// Job id for `<job_id>.log` and `<job_id>.log.<n>`; `None` for anything
/// else in the directory.
fn log_owner(file_name: &str) -> Option<&str> {
    let (job, rest) = file_name.split_once(".log")?;
    let segment_ok = rest.is_empty()
        || rest
            .strip_prefix('.')
            .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()));
    (segment_ok && !job.is_empty()).then_some(job)
}

/// Delete every file of all but the most recently written jobs, so at most
/// `keep` jobs (`current` included) have logs. `current` is never touched.
/// Returns the number of files removed.
pub async fn prune_job_logs(dir: &Path, keep: usize, current: &JobId) -> io::Result<usize> {
    let mut jobs: HashMap<String, (SystemTime, Vec<PathBuf>)> = HashMap::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(job) = log_owner(&name) else {
            continue;
        };
        if job == current.as_str() {
            continue;
        }
        let modified = entry
            .metadata()
            .await
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let slot = jobs
            .entry(job.to_string())
            .or_insert((SystemTime::UNIX_EPOCH, Vec::new()));
        slot.0 = slot.0.max(modified);
        slot.1.push(entry.path());
    }

    let mut jobs: Vec<(SystemTime, Vec<PathBuf>)> = jobs.into_values().collect();
    jobs.sort_by(|a, b| b.0.cmp(&a.0));

    let mut removed = 0;
    for (_, files) in jobs.into_iter().skip(keep.saturating_sub(1)) {
        for path in files {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    tracing::debug!(path = %path.display(), error = %err, "could not prune job log");
                }
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    const LIMITS: LogLimits = LogLimits {
        segment_bytes: 1024 * 1024,
        segments: 3,
        keep_jobs: 50,
    };

    async fn read_eventually(path: &Path, needle: &str) -> String {
        for _ in 0..100 {
            if let Ok(s) = tokio::fs::read_to_string(path).await
                && s.contains(needle)
            {
                return s;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{} never contained {needle:?}", path.display());
    }

    fn touch(path: &Path, secs_after_epoch: u64) {
        std::fs::write(path, b"x\n").unwrap();
        std::fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs_after_epoch))
            .unwrap();
    }

    #[tokio::test]
    async fn drained_lines_land_in_job_file() {
        let dir = tempfile::tempdir().unwrap();
        let job_id = JobId::new();
        let sink = LogSink::open(job_id.clone(), Some(dir.path()), LIMITS).await;

        let input: &[u8] = b"first\nsecond\n";
        sink.drain(input, "stdout").await.unwrap();

        let path = dir.path().join(format!("{job_id}.log"));
        let s = read_eventually(&path, "[stdout] second").await;
        assert!(s.contains("[stdout] first\n"));
    }

    #[tokio::test]
    async fn full_segment_rolls_over() {
        let dir = tempfile::tempdir().unwrap();
        let job_id = JobId::new();
        let limits = LogLimits {
            segment_bytes: 16,
            segments: 2,
            keep_jobs: 50,
        };
        let mut log = JobLogFile::create(dir.path(), &job_id, limits).await.unwrap();
        log.append_line("0123456789").await.unwrap();
        log.append_line("abcdefghij").await.unwrap();
        log.append_line("klmnopqrst").await.unwrap();
        log.file.flush().await.unwrap();

        let live = dir.path().join(format!("{job_id}.log"));
        let previous = tokio::fs::read_to_string(dir.path().join(format!("{job_id}.log.1")))
            .await
            .unwrap();
        assert_eq!(previous, "abcdefghij\n");
        assert_eq!(tokio::fs::read_to_string(&live).await.unwrap(), "klmnopqrst\n");
        assert!(!dir.path().join(format!("{job_id}.log.2")).exists());
    }

    #[test]
    fn only_job_log_names_are_recognised() {
        assert_eq!(log_owner("abc.log"), Some("abc"));
        assert_eq!(log_owner("abc.log.2"), Some("abc"));
        assert_eq!(log_owner("abc.log.bak"), None);
        assert_eq!(log_owner("notes.txt"), None);
        assert_eq!(log_owner(".log"), None);
    }

    #[tokio::test]
    async fn pruning_keeps_only_the_newest_jobs() {
        let dir = tempfile::tempdir().unwrap();
        for (i, job) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            touch(&dir.path().join(format!("{job}.log")), 1_000 + i as u64);
        }
        touch(&dir.path().join("a.log.1"), 500);
        touch(&dir.path().join("notes.txt"), 1);

        let current = JobId::new();
        touch(&dir.path().join(format!("{current}.log")), 10);

        let removed = prune_job_logs(dir.path(), 3, &current).await.unwrap();
        assert_eq!(removed, 4);

        let mut left: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        let mut want = vec![
            "d.log".to_string(),
            "e.log".to_string(),
            "notes.txt".to_string(),
            format!("{current}.log"),
        ];
        want.sort();
        assert_eq!(left, want);
    }

    #[tokio::test]
    async fn opening_a_job_log_prunes_old_ones() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join("old-job.log");
        touch(&stale, 1_000);

        let limits = LogLimits {
            keep_jobs: 1,
            ..LIMITS
        };
        let sink = LogSink::open(JobId::new(), Some(dir.path()), limits).await;
        sink.emit("hello");

        for _ in 0..100 {
            if !stale.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("old job log was never pruned");
    }
}
