use std::{
    collections::{HashMap, hash_map::Entry},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use herald_job::{JobId, JobKind, JobOutcome, JobSummary, OwnerId, TerminationResult};
use tokio::sync::{Mutex, Notify, oneshot};

use crate::process::{JobProcess, StopSignal};

const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// What the exit observer knows once a job's process is gone.
#[derive(Debug, Clone)]
pub struct JobExit {
    pub job_id: JobId,
    pub owner: OwnerId,
    pub kind: JobKind,
    pub pid: Option<u32>,
    pub outcome: JobOutcome,
    pub runtime: Duration,
}

/// Cleanup the observer runs after the process has exited, before the entry
/// is released.
pub type ExitHook = Box<dyn FnOnce(JobExit) -> BoxFuture<'static, ()> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Owner,
    Swept,
}

impl StopReason {
    fn signal(self) -> StopSignal {
        match self {
            StopReason::Owner => StopSignal::Terminate,
            StopReason::Swept => StopSignal::Kill,
        }
    }

    fn outcome(self) -> JobOutcome {
        match self {
            StopReason::Owner => JobOutcome::KilledByOwner,
            StopReason::Swept => JobOutcome::SweptStale,
        }
    }
}

/// The registry's only grip on a process: the observer owns the child and
/// acts on whatever is sent here.
#[derive(Debug)]
struct ProcessHandle {
    pid: Option<u32>,
    stop_tx: oneshot::Sender<StopReason>,
}

impl ProcessHandle {
    fn stop(self, reason: StopReason) {
        // The observer may already be past the exit; nothing left to signal.
        let _ = self.stop_tx.send(reason);
    }
}

#[derive(Debug)]
struct JobEntry {
    owner: OwnerId,
    kind: JobKind,
    started_at: DateTime<Utc>,
    started: Instant,
    handle: ProcessHandle,
}

/// Live exit observers, so shutdown can wait for their cleanup.
#[derive(Debug, Default)]
struct Observers {
    live: AtomicUsize,
    idle: Notify,
}

struct ObserverGuard(Arc<Observers>);

impl ObserverGuard {
    fn enter(observers: &Arc<Observers>) -> Self {
        observers.live.fetch_add(1, Ordering::SeqCst);
        Self(observers.clone())
    }
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        if self.0.live.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

enum WatchEvent {
    Exited(std::io::Result<std::process::ExitStatus>),
    Stop(Option<StopReason>),
}

/// In-memory directory of running jobs.
///
/// Every removal (natural exit, owner termination, stale sweep) is a single
/// `HashMap::remove` under the map lock, so exactly one path wins and the
/// process handle is released once.
#[derive(Clone, Debug)]
pub struct JobRegistry {
    inner: Arc<Mutex<HashMap<JobId, JobEntry>>>,
    observers: Arc<Observers>,
    kill_grace: Duration,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_KILL_GRACE)
    }
}

impl JobRegistry {
    pub fn new(kill_grace: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            observers: Arc::new(Observers::default()),
            kill_grace,
        }
    }

    /// Store a running process and start its exit observer. Returns at once.
    pub async fn register(
        &self,
        owner: OwnerId,
        kind: JobKind,
        process: JobProcess,
        on_exit: Option<ExitHook>,
    ) -> JobId {
        let (stop_tx, stop_rx) = oneshot::channel();
        let pid = process.pid();
        let started = Instant::now();

        let job_id = {
            let mut map = self.inner.lock().await;
            let mut job_id = JobId::new();
            while map.contains_key(&job_id) {
                job_id = JobId::new();
            }
            map.insert(
                job_id.clone(),
                JobEntry {
                    owner: owner.clone(),
                    kind,
                    started_at: Utc::now(),
                    started,
                    handle: ProcessHandle { pid, stop_tx },
                },
            );
            job_id
        };

        let registry = self.clone();
        let observed = job_id.clone();
        let guard = ObserverGuard::enter(&self.observers);
        tokio::spawn(async move {
            let _guard = guard;
            registry
                .observe(observed, owner, kind, started, process, stop_rx, on_exit)
                .await;
        });

        job_id
    }

    #[allow(clippy::too_many_arguments)]
    async fn observe(
        self,
        job_id: JobId,
        owner: OwnerId,
        kind: JobKind,
        started: Instant,
        mut process: JobProcess,
        mut stop_rx: oneshot::Receiver<StopReason>,
        on_exit: Option<ExitHook>,
    ) {
        let pid = process.pid();
        let event = tokio::select! {
            res = process.wait() => WatchEvent::Exited(res),
            req = &mut stop_rx => WatchEvent::Stop(req.ok()),
        };

        let (res, stopped_by) = match event {
            WatchEvent::Exited(res) => (res, None),
            WatchEvent::Stop(Some(reason)) => {
                (process.stop(reason.signal(), self.kill_grace).await, Some(reason))
            }
            // Handle dropped without a request: the registry itself is gone.
            WatchEvent::Stop(None) => (process.wait().await, None),
        };

        let outcome = match (stopped_by, &res) {
            (Some(reason), _) => reason.outcome(),
            (None, Ok(status)) if status.success() => JobOutcome::ExitedNormally,
            (None, Ok(status)) => JobOutcome::ExitedWithError {
                exit_code: status.code(),
            },
            (None, Err(_)) => JobOutcome::ExitedWithError { exit_code: None },
        };
        let runtime = started.elapsed();
        let exit_code = res.as_ref().ok().and_then(|s| s.code());

        match outcome {
            JobOutcome::ExitedNormally => tracing::info!(
                %job_id, %owner, %kind, ?pid,
                runtime_ms = runtime.as_millis() as u64,
                "job exited normally"
            ),
            JobOutcome::ExitedWithError { .. } => match &res {
                Ok(_) => tracing::warn!(
                    %job_id, %owner, %kind, ?pid, ?exit_code,
                    runtime_ms = runtime.as_millis() as u64,
                    "job exited with error"
                ),
                Err(err) => tracing::warn!(
                    %job_id, %owner, %kind, ?pid, error = %err,
                    "waiting on job process failed"
                ),
            },
            JobOutcome::KilledByOwner | JobOutcome::SweptStale => tracing::info!(
                %job_id, %owner, %kind, ?pid, ?exit_code, ?outcome,
                runtime_ms = runtime.as_millis() as u64,
                "job stopped"
            ),
        }

        if let Some(hook) = on_exit {
            hook(JobExit {
                job_id: job_id.clone(),
                owner,
                kind,
                pid,
                outcome,
                runtime,
            })
            .await;
        }

        self.remove_exited(&job_id).await;
    }

    /// Exit path. A no-op when termination or the sweeper got there first.
    async fn remove_exited(&self, job_id: &JobId) -> bool {
        self.inner.lock().await.remove(job_id).is_some()
    }

    pub async fn terminate(&self, job_id: &JobId, requester: &OwnerId) -> TerminationResult {
        let entry = {
            let mut map = self.inner.lock().await;
            match map.entry(job_id.clone()) {
                Entry::Vacant(_) => return TerminationResult::NotFound,
                Entry::Occupied(e) if e.get().owner != *requester => {
                    return TerminationResult::Forbidden;
                }
                Entry::Occupied(e) => e.remove(),
            }
        };

        tracing::info!(
            %job_id,
            owner = %entry.owner,
            kind = %entry.kind,
            pid = ?entry.handle.pid,
            "terminating job at owner's request"
        );
        entry.handle.stop(StopReason::Owner);
        TerminationResult::Terminated
    }

    /// A single job, visible only to its owner.
    pub async fn lookup(&self, job_id: &JobId, requester: &OwnerId) -> Option<JobSummary> {
        let map = self.inner.lock().await;
        map.get(job_id)
            .filter(|e| e.owner == *requester)
            .map(|e| JobSummary {
                job_id: job_id.clone(),
                kind: e.kind,
                started_at: e.started_at,
            })
    }

    pub async fn list_by_owner(&self, owner: &OwnerId) -> Vec<JobSummary> {
        let map = self.inner.lock().await;
        map.iter()
            .filter(|(_, e)| e.owner == *owner)
            .map(|(id, e)| JobSummary {
                job_id: id.clone(),
                kind: e.kind,
                started_at: e.started_at,
            })
            .collect()
    }

    /// Kill and drop every job running for at least `max_age`, whoever owns it.
    pub async fn sweep_stale(&self, max_age: Duration) -> Vec<JobId> {
        let stale: Vec<(JobId, JobEntry)> = {
            let mut map = self.inner.lock().await;
            let ids: Vec<JobId> = map
                .iter()
                .filter(|(_, e)| e.started.elapsed() >= max_age)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| map.remove(&id).map(|e| (id, e)))
                .collect()
        };

        let mut swept = Vec::with_capacity(stale.len());
        for (job_id, entry) in stale {
            tracing::warn!(
                %job_id,
                owner = %entry.owner,
                kind = %entry.kind,
                pid = ?entry.handle.pid,
                age_ms = entry.started.elapsed().as_millis() as u64,
                "sweeping stale job"
            );
            entry.handle.stop(StopReason::Swept);
            swept.push(job_id);
        }
        swept
    }

    /// Kill every job and wait up to `wait` for the exit observers to finish
    /// their cleanup. Returns how many jobs were running.
    pub async fn shutdown(&self, wait: Duration) -> usize {
        let swept = self.sweep_stale(Duration::ZERO).await.len();

        let drained = tokio::time::timeout(wait, async {
            loop {
                let notified = self.observers.idle.notified();
                if self.observers.live.load(Ordering::SeqCst) == 0 {
                    break;
                }
                notified.await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                live = self.observers.live.load(Ordering::SeqCst),
                "job observers still running at shutdown"
            );
        }
        swept
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
impl JobRegistry {
    /// Stalls every registry operation until the guard is dropped.
    pub(crate) async fn hold_map_lock(&self) -> Box<dyn Send> {
        Box::new(self.inner.clone().lock_owned().await)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::process::Command;

    use super::*;

    fn sh(script: &str) -> JobProcess {
        let mut cmd = Command::new("/bin/sh");
        cmd.args(["-c", script]);
        JobProcess::spawn(&mut cmd).unwrap()
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..250 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    fn alice() -> OwnerId {
        OwnerId::new("alice")
    }

    fn bob() -> OwnerId {
        OwnerId::new("bob")
    }

    fn listed(jobs: &[JobSummary], id: &JobId) -> bool {
        jobs.iter().any(|j| j.job_id == *id)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_registrations_get_distinct_ids() {
        let registry = JobRegistry::default();
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry
                    .register(alice(), JobKind::AutoPost, sh("sleep 30"), None)
                    .await
            }));
        }

        let mut ids = Vec::new();
        for t in tasks {
            ids.push(t.await.unwrap());
        }
        let unique: std::collections::HashSet<_> = ids.iter().cloned().collect();
        assert_eq!(unique.len(), ids.len());
        assert_eq!(registry.len().await, 16);

        registry.sweep_stale(Duration::ZERO).await;
    }

    #[tokio::test]
    async fn natural_exit_removes_entry_and_terminate_then_misses() {
        let registry = JobRegistry::default();
        let id = registry
            .register(alice(), JobKind::Scrape, sh("exit 0"), None)
            .await;

        eventually(|| async { registry.list_by_owner(&alice()).await.is_empty() }).await;
        assert_eq!(
            registry.terminate(&id, &alice()).await,
            TerminationResult::NotFound
        );
        assert_eq!(
            registry.terminate(&id, &bob()).await,
            TerminationResult::NotFound
        );
    }

    #[tokio::test]
    async fn non_owner_is_forbidden_and_job_keeps_running() {
        let registry = JobRegistry::default();
        let id = registry
            .register(alice(), JobKind::Simulate, sh("sleep 30"), None)
            .await;

        assert_eq!(
            registry.terminate(&id, &bob()).await,
            TerminationResult::Forbidden
        );
        assert!(listed(&registry.list_by_owner(&alice()).await, &id));
        assert!(registry.list_by_owner(&bob()).await.is_empty());

        assert_eq!(
            registry.terminate(&id, &alice()).await,
            TerminationResult::Terminated
        );
    }

    #[tokio::test]
    async fn owner_termination_removes_entry_and_runs_hook() {
        let registry = JobRegistry::new(Duration::from_secs(2));
        let (tx, rx) = oneshot::channel::<JobOutcome>();
        let hook: ExitHook = Box::new(move |exit: JobExit| {
            Box::pin(async move {
                let _ = tx.send(exit.outcome);
            })
        });
        let id = registry
            .register(alice(), JobKind::AutoPost, sh("sleep 30"), Some(hook))
            .await;

        assert_eq!(
            registry.terminate(&id, &alice()).await,
            TerminationResult::Terminated
        );
        assert!(!listed(&registry.list_by_owner(&alice()).await, &id));

        let outcome = tokio::time::timeout(Duration::from_secs(10), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, JobOutcome::KilledByOwner);
        assert_eq!(
            registry.terminate(&id, &alice()).await,
            TerminationResult::NotFound
        );
    }

    #[tokio::test]
    async fn failing_job_reports_exit_code() {
        let registry = JobRegistry::default();
        let (tx, rx) = oneshot::channel::<JobOutcome>();
        let hook: ExitHook = Box::new(move |exit: JobExit| {
            Box::pin(async move {
                let _ = tx.send(exit.outcome);
            })
        });
        registry
            .register(alice(), JobKind::Scrape, sh("exit 3"), Some(hook))
            .await;

        let outcome = tokio::time::timeout(Duration::from_secs(10), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            outcome,
            JobOutcome::ExitedWithError { exit_code: Some(3) }
        );
        eventually(|| async { registry.is_empty().await }).await;
    }

    #[tokio::test]
    async fn same_kind_jobs_are_independently_terminable() {
        let registry = JobRegistry::default();
        let a = registry
            .register(alice(), JobKind::AutoPost, sh("sleep 30"), None)
            .await;
        let b = registry
            .register(alice(), JobKind::AutoPost, sh("sleep 30"), None)
            .await;
        assert_ne!(a, b);

        assert_eq!(
            registry.terminate(&a, &alice()).await,
            TerminationResult::Terminated
        );
        let jobs = registry.list_by_owner(&alice()).await;
        assert!(!listed(&jobs, &a));
        assert!(listed(&jobs, &b));

        assert_eq!(
            registry.terminate(&b, &alice()).await,
            TerminationResult::Terminated
        );
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn sweep_with_zero_age_kills_everyone() {
        let registry = JobRegistry::default();
        let hooks_run = Arc::new(AtomicUsize::new(0));
        let mut ids = Vec::new();
        for owner in [alice(), bob()] {
            let counter = hooks_run.clone();
            let hook: ExitHook = Box::new(move |exit: JobExit| {
                Box::pin(async move {
                    assert_eq!(exit.outcome, JobOutcome::SweptStale);
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            });
            ids.push(
                registry
                    .register(owner, JobKind::Simulate, sh("sleep 30"), Some(hook))
                    .await,
            );
        }

        let swept = registry.sweep_stale(Duration::ZERO).await;
        assert_eq!(swept.len(), 2);
        assert!(registry.is_empty().await);
        for id in &ids {
            assert_eq!(
                registry.terminate(id, &alice()).await,
                TerminationResult::NotFound
            );
        }
        eventually(|| {
            let hooks_run = hooks_run.clone();
            async move { hooks_run.load(Ordering::SeqCst) == 2 }
        })
        .await;
    }

    #[tokio::test]
    async fn sweep_spares_young_jobs() {
        let registry = JobRegistry::default();
        let id = registry
            .register(alice(), JobKind::Scrape, sh("sleep 30"), None)
            .await;
        assert!(registry.sweep_stale(Duration::from_secs(3600)).await.is_empty());
        assert!(listed(&registry.list_by_owner(&alice()).await, &id));
        registry.sweep_stale(Duration::ZERO).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_terminations_remove_once() {
        let registry = JobRegistry::default();
        let id = registry
            .register(alice(), JobKind::AutoPost, sh("sleep 30"), None)
            .await;

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                registry.terminate(&id, &alice()).await
            }));
        }
        let sweeper = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.sweep_stale(Duration::ZERO).await.len() })
        };

        let mut terminated = 0;
        for t in tasks {
            match t.await.unwrap() {
                TerminationResult::Terminated => terminated += 1,
                TerminationResult::NotFound => {}
                TerminationResult::Forbidden => panic!("owner was refused"),
            }
        }
        let swept = sweeper.await.unwrap();
        assert_eq!(terminated + swept, 1);
        assert!(registry.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn natural_exit_racing_owner_stop_cleans_up_once() {
        for _ in 0..20 {
            let registry = JobRegistry::default();
            let hooks = Arc::new(AtomicUsize::new(0));
            let counter = hooks.clone();
            let hook: ExitHook = Box::new(move |_exit: JobExit| {
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            });
            let id = registry
                .register(alice(), JobKind::Scrape, sh("exit 0"), Some(hook))
                .await;

            let stopper = {
                let registry = registry.clone();
                let id = id.clone();
                tokio::spawn(async move { registry.terminate(&id, &alice()).await })
            };
            let first = stopper.await.unwrap();
            assert!(matches!(
                first,
                TerminationResult::Terminated | TerminationResult::NotFound
            ));

            // Nothing is left to sweep; this only waits for the observer.
            assert_eq!(registry.shutdown(Duration::from_secs(5)).await, 0);
            assert_eq!(hooks.load(Ordering::SeqCst), 1);
            assert!(registry.is_empty().await);
            assert_eq!(
                registry.terminate(&id, &alice()).await,
                TerminationResult::NotFound
            );
        }
    }

    #[tokio::test]
    async fn lookup_is_owner_scoped() {
        let registry = JobRegistry::default();
        let id = registry
            .register(alice(), JobKind::Scrape, sh("sleep 30"), None)
            .await;

        let found = registry.lookup(&id, &alice()).await.unwrap();
        assert_eq!(found.job_id, id);
        assert_eq!(found.kind, JobKind::Scrape);
        assert!(registry.lookup(&id, &bob()).await.is_none());
        assert!(registry.lookup(&JobId::new(), &alice()).await.is_none());

        registry.sweep_stale(Duration::ZERO).await;
        assert!(registry.lookup(&id, &alice()).await.is_none());
    }

    #[tokio::test]
    async fn shutdown_waits_for_exit_hooks() {
        let registry = JobRegistry::default();
        let hooks = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let hooks = hooks.clone();
            let hook: ExitHook = Box::new(move |exit: JobExit| {
                Box::pin(async move {
                    assert_eq!(exit.outcome, JobOutcome::SweptStale);
                    hooks.fetch_add(1, Ordering::SeqCst);
                })
            });
            registry
                .register(alice(), JobKind::Simulate, sh("sleep 30"), Some(hook))
                .await;
        }

        assert_eq!(registry.shutdown(Duration::from_secs(5)).await, 3);
        assert_eq!(hooks.load(Ordering::SeqCst), 3);
        assert!(registry.is_empty().await);
        assert_eq!(registry.shutdown(Duration::from_secs(1)).await, 0);
    }
}
