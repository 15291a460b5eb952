//! Background generation scheduler.
//!
//! Requests are deduplicated per resource key, admitted in priority then
//! FIFO order up to a concurrency limit, and executed as cooperative tokio
//! tasks that observe a cancellation token at each suspension point.

mod subscribers;
mod task;

use std::{
    collections::{HashMap, HashSet},
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::{
    analysis::{self, SpectrogramParams},
    audio::AudioSource,
    cache::CacheManager,
    config::{AnalysisConfig, AppConfig, SchedulerConfig},
    Result, WaveviewError,
};

use subscribers::Subscribers;
pub use subscribers::Subscription;
pub use task::{
    Artifacts, CompletionEvent, Dimensions, ErrorEvent, Priority, ProgressEvent, QueueStats, Task,
    TaskId, TaskKind, TaskRequest, TaskStatus,
};

/// Priority task queue that turns audio sources into cached waveform and
/// spectrogram artifacts.
///
/// Cloning is cheap; clones share the same queue, caches and subscribers.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    config: SchedulerConfig,
    analysis: AnalysisConfig,
    cache: Arc<CacheManager>,
    source: Arc<dyn AudioSource>,
    runtime: Handle,
    table: Mutex<TaskTable>,
    progress: Arc<Subscribers<ProgressEvent>>,
    completed: Arc<Subscribers<CompletionEvent>>,
    failed: Arc<Subscribers<ErrorEvent>>,
}

/// Live tasks plus the set currently holding a concurrency slot.
#[derive(Default)]
struct TaskTable {
    tasks: HashMap<TaskId, Task>,
    running: HashSet<TaskId>,
    next_sequence: u64,
}

impl TaskTable {
    fn active_for_mut(&mut self, resource_key: &str) -> Option<&mut Task> {
        self.tasks
            .values_mut()
            .find(|task| task.resource_key == resource_key && task.is_active())
    }

    fn next_pending(&self, priority_enabled: bool) -> Option<TaskId> {
        self.tasks
            .values()
            .filter(|task| task.status == TaskStatus::Pending)
            .min_by_key(|task| {
                let rank = if priority_enabled { task.priority.rank() } else { 0 };
                (rank, task.sequence)
            })
            .map(|task| task.id)
    }

    /// Drops finished tasks for `resource_key` that are still waiting out
    /// their retention period.
    fn discard_terminal(&mut self, resource_key: &str) {
        self.tasks.retain(|_, task| {
            let stale = task.resource_key == resource_key && task.status.is_terminal();
            if stale {
                task.cancellation.cancel();
            }
            !stale
        });
    }

    fn cancel(&mut self, id: TaskId) -> bool {
        if !self.tasks.get(&id).is_some_and(Task::is_active) {
            return false;
        }
        let Some(mut task) = self.tasks.remove(&id) else {
            return false;
        };
        task.cancellation.cancel();
        task.status = TaskStatus::Cancelled;
        self.running.remove(&id);
        tracing::debug!(task_id = %id, resource_key = %task.resource_key, "task cancelled");
        true
    }

    fn cancel_where(&mut self, predicate: impl Fn(&Task) -> bool) -> usize {
        let ids: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|task| task.is_active() && predicate(task))
            .map(|task| task.id)
            .collect();
        ids.into_iter().filter(|id| self.cancel(*id)).count()
    }
}

/// Immutable view of a task taken when its pipeline starts.
struct Job {
    resource_key: String,
    source: String,
    kind: TaskKind,
    dimensions: Dimensions,
}

enum Outcome {
    Completed(CompletionEvent),
    Failed(ErrorEvent),
}

impl TaskScheduler {
    /// Creates a scheduler bound to the current tokio runtime.
    pub fn new(
        config: &AppConfig,
        cache: Arc<CacheManager>,
        source: Arc<dyn AudioSource>,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|error| {
            WaveviewError::msg(format!("task scheduler requires a tokio runtime: {error}"))
        })?;
        Ok(Self::with_runtime(config, cache, source, runtime))
    }

    pub fn with_runtime(
        config: &AppConfig,
        cache: Arc<CacheManager>,
        source: Arc<dyn AudioSource>,
        runtime: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: config.scheduler.clone(),
                analysis: config.analysis.clone(),
                cache,
                source,
                runtime,
                table: Mutex::new(TaskTable::default()),
                progress: Subscribers::new(),
                completed: Subscribers::new(),
                failed: Subscribers::new(),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.inner.cache
    }

    /// Requests artifacts for `resource_key` at the configured default size.
    pub fn add_task(
        &self,
        resource_key: impl Into<String>,
        source: impl Into<String>,
        kind: TaskKind,
        priority: Priority,
    ) -> TaskId {
        self.add_request(
            TaskRequest::new(resource_key, source)
                .kind(kind)
                .priority(priority),
        )
    }

    /// Queues `request` unless the resource already has a pending or running
    /// task. In that case the existing id is returned and its priority is
    /// raised if the request outranks it. A raise on a running task is kept
    /// but has no effect on execution.
    pub fn add_request(&self, request: TaskRequest) -> TaskId {
        let dimensions = request.dimensions.unwrap_or_else(|| {
            Dimensions::new(self.inner.analysis.default_width, self.inner.analysis.default_height)
        });

        let mut table = self.inner.table.lock();
        let existing = table
            .active_for_mut(&request.resource_key)
            .map(|task| {
                if request.priority.outranks(task.priority) {
                    tracing::debug!(
                        task_id = %task.id,
                        from = ?task.priority,
                        to = ?request.priority,
                        "raised priority of queued task"
                    );
                    task.priority = request.priority;
                }
                task.id
            });

        let id = match existing {
            Some(id) => id,
            None => {
                table.discard_terminal(&request.resource_key);
                let sequence = table.next_sequence;
                table.next_sequence += 1;
                let task = Task::new(request, dimensions, sequence);
                let id = task.id;
                tracing::debug!(
                    task_id = %id,
                    resource_key = %task.resource_key,
                    priority = ?task.priority,
                    "task queued"
                );
                table.tasks.insert(id, task);
                id
            }
        };
        drop(table);

        self.inner.schedule();
        id
    }

    /// Cancels a pending or running task and forgets it immediately. No
    /// completion or error handler fires for it. Unknown or finished ids are
    /// ignored.
    pub fn cancel_task(&self, id: TaskId) -> bool {
        let cancelled = self.inner.table.lock().cancel(id);
        if cancelled {
            self.inner.schedule();
        }
        cancelled
    }

    pub fn cancel_for_resource(&self, resource_key: &str) -> usize {
        self.cancel_where(|task| task.resource_key == resource_key)
    }

    pub fn cancel_all_pending(&self) -> usize {
        self.cancel_where(|task| task.status == TaskStatus::Pending)
    }

    pub fn cancel_all(&self) -> usize {
        self.cancel_where(|_| true)
    }

    fn cancel_where(&self, predicate: impl Fn(&Task) -> bool) -> usize {
        let cancelled = self.inner.table.lock().cancel_where(predicate);
        if cancelled > 0 {
            self.inner.schedule();
        }
        cancelled
    }

    /// Changes the priority of a pending task. Running and finished tasks
    /// are left alone.
    pub fn update_priority(&self, id: TaskId, priority: Priority) -> bool {
        let updated = {
            let mut table = self.inner.table.lock();
            match table.tasks.get_mut(&id) {
                Some(task) if task.status == TaskStatus::Pending => {
                    task.priority = priority;
                    true
                }
                _ => false,
            }
        };
        self.inner.schedule();
        updated
    }

    pub fn update_resource_priority(&self, resource_key: &str, priority: Priority) -> bool {
        let updated = {
            let mut table = self.inner.table.lock();
            let mut updated = false;
            for task in table.tasks.values_mut() {
                if task.resource_key == resource_key && task.status == TaskStatus::Pending {
                    task.priority = priority;
                    updated = true;
                }
            }
            updated
        };
        self.inner.schedule();
        updated
    }

    pub fn get_task(&self, id: TaskId) -> Option<Task> {
        self.inner.table.lock().tasks.get(&id).cloned()
    }

    /// Live tasks for `resource_key`, oldest first.
    pub fn get_tasks_for_resource(&self, resource_key: &str) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .inner
            .table
            .lock()
            .tasks
            .values()
            .filter(|task| task.resource_key == resource_key)
            .cloned()
            .collect();
        tasks.sort_by_key(|task| task.sequence);
        tasks
    }

    pub fn queue_stats(&self) -> QueueStats {
        let table = self.inner.table.lock();
        let mut stats = QueueStats {
            total: table.tasks.len(),
            ..Default::default()
        };
        for task in table.tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    pub fn on_progress<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        self.inner.progress.subscribe(handler)
    }

    pub fn on_complete<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&CompletionEvent) + Send + Sync + 'static,
    {
        self.inner.completed.subscribe(handler)
    }

    pub fn on_error<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ErrorEvent) + Send + Sync + 'static,
    {
        self.inner.failed.subscribe(handler)
    }
}

impl fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("config", &self.inner.config)
            .field("stats", &self.queue_stats())
            .finish()
    }
}

impl Inner {
    /// Starts pending tasks while slots are free. Runs after every change
    /// that could admit work.
    fn schedule(self: &Arc<Self>) {
        let admitted = {
            let mut table = self.table.lock();
            let mut admitted = Vec::new();
            while table.running.len() < self.config.concurrency_limit() {
                let Some(id) = table.next_pending(self.config.priority_enabled) else {
                    break;
                };
                let Some(task) = table.tasks.get_mut(&id) else {
                    break;
                };
                task.status = TaskStatus::Running;
                task.started_at = Some(Utc::now());
                tracing::debug!(
                    task_id = %id,
                    resource_key = %task.resource_key,
                    priority = ?task.priority,
                    "task started"
                );
                admitted.push((id, task.cancellation.clone()));
                table.running.insert(id);
            }
            admitted
        };

        for (id, token) in admitted {
            let inner = Arc::clone(self);
            self.runtime.spawn(inner.execute(id, token));
        }
    }

    async fn execute(self: Arc<Self>, id: TaskId, token: CancellationToken) {
        let outcome = AssertUnwindSafe(self.run_pipeline(id, &token))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(WaveviewError::msg("generation pipeline panicked")));
        self.finish(id, &token, outcome);
    }

    async fn run_pipeline(&self, id: TaskId, token: &CancellationToken) -> Result<Artifacts> {
        ensure_active(token)?;
        let job = self.job(id).ok_or(WaveviewError::Cancelled)?;

        self.report_progress(id, 10);
        if let Some(artifacts) = self.cached_artifacts(&job) {
            tracing::debug!(task_id = %id, resource_key = %job.resource_key, "served from cache");
            self.report_progress(id, 100);
            return Ok(artifacts);
        }

        let audio = match self.cache.get_audio(&job.resource_key) {
            Some(audio) => audio,
            None => {
                self.report_progress(id, 20);
                let bytes = until_cancelled(token, self.source.fetch(&job.source)).await?;
                ensure_active(token)?;
                let decoded = until_cancelled(token, self.source.decode(bytes)).await?;
                let audio = Arc::new(decoded.into_mono());
                tracing::debug!(
                    task_id = %id,
                    seconds = audio.duration_seconds(),
                    sample_rate = audio.sample_rate,
                    "decoded audio"
                );
                self.cache.set_audio(&job.resource_key, audio.clone());
                self.report_progress(id, 40);
                audio
            }
        };
        ensure_active(token)?;

        self.report_progress(id, 50);
        let wanted = usize::from(job.kind.wants_waveform()) + usize::from(job.kind.wants_spectrogram());
        let mut finished = 0;
        let mut artifacts = Artifacts::default();
        let Dimensions { width, height } = job.dimensions;

        if job.kind.wants_waveform() {
            let waveform = match self.cache.get_waveform(&job.resource_key, width) {
                Some(waveform) => waveform,
                None => {
                    let audio = audio.clone();
                    let waveform =
                        Arc::new(compute(move || analysis::downsample(&audio.samples, width)).await?);
                    self.cache.set_waveform(&job.resource_key, width, waveform.clone());
                    waveform
                }
            };
            artifacts.waveform = Some(waveform);
            finished += 1;
            self.report_progress(id, if finished == wanted { 100 } else { 75 });
            ensure_active(token)?;
        }

        if job.kind.wants_spectrogram() {
            let spectrogram = match self.cache.get_spectrogram(&job.resource_key, width, height) {
                Some(spectrogram) => spectrogram,
                None => {
                    let params = SpectrogramParams::new(width, height, audio.sample_rate)
                        .with_frequency_range(self.analysis.min_hz, self.analysis.max_hz)
                        .with_fft_size(self.analysis.fft_size)
                        .with_scale(self.analysis.scale);
                    let audio = audio.clone();
                    let spectrogram = Arc::new(
                        compute(move || analysis::spectrogram(&audio.samples, &params)).await?,
                    );
                    self.cache
                        .set_spectrogram(&job.resource_key, width, height, spectrogram.clone());
                    spectrogram
                }
            };
            artifacts.spectrogram = Some(spectrogram);
            finished += 1;
            self.report_progress(id, if finished == wanted { 100 } else { 75 });
        }

        ensure_active(token)?;
        Ok(artifacts)
    }

    /// Single exit path of every pipeline: releases the slot, records the
    /// terminal state, notifies and reschedules.
    fn finish(self: &Arc<Self>, id: TaskId, token: &CancellationToken, outcome: Result<Artifacts>) {
        let notification = {
            let mut table = self.table.lock();
            table.running.remove(&id);

            if token.is_cancelled() {
                if table.tasks.remove(&id).is_some() {
                    tracing::debug!(task_id = %id, "task cancelled while running");
                }
                None
            } else if let Some(task) = table.tasks.get_mut(&id) {
                task.completed_at = Some(Utc::now());
                match outcome {
                    Ok(artifacts) => {
                        task.status = TaskStatus::Completed;
                        task.progress = 100;
                        Some(Outcome::Completed(CompletionEvent {
                            task_id: id,
                            resource_key: task.resource_key.clone(),
                            kind: task.kind,
                            artifacts,
                        }))
                    }
                    Err(error) => {
                        task.status = TaskStatus::Failed;
                        task.error = Some(error.to_string());
                        Some(Outcome::Failed(ErrorEvent {
                            task_id: id,
                            resource_key: task.resource_key.clone(),
                            error: Arc::new(error),
                        }))
                    }
                }
            } else {
                None
            }
        };

        match notification {
            Some(Outcome::Completed(event)) => {
                tracing::info!(task_id = %id, resource_key = %event.resource_key, "task completed");
                self.completed.emit(&event);
                self.schedule_removal(id, self.config.completed_retention());
            }
            Some(Outcome::Failed(event)) => {
                tracing::warn!(
                    task_id = %id,
                    resource_key = %event.resource_key,
                    error = %event.error,
                    "task failed"
                );
                self.failed.emit(&event);
                self.schedule_removal(id, self.config.failed_retention());
            }
            None => {}
        }

        self.schedule();
    }

    fn schedule_removal(self: &Arc<Self>, id: TaskId, after: Duration) {
        let inner = Arc::downgrade(self);
        self.runtime.spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(inner) = inner.upgrade() {
                let mut table = inner.table.lock();
                if table.tasks.get(&id).is_some_and(|task| task.status.is_terminal()) {
                    table.tasks.remove(&id);
                }
            }
        });
    }

    fn job(&self, id: TaskId) -> Option<Job> {
        self.table.lock().tasks.get(&id).map(|task| Job {
            resource_key: task.resource_key.clone(),
            source: task.source.clone(),
            kind: task.kind,
            dimensions: task.dimensions,
        })
    }

    fn cached_artifacts(&self, job: &Job) -> Option<Artifacts> {
        let Dimensions { width, height } = job.dimensions;
        let waveform = if job.kind.wants_waveform() {
            Some(self.cache.get_waveform(&job.resource_key, width)?)
        } else {
            None
        };
        let spectrogram = if job.kind.wants_spectrogram() {
            Some(self.cache.get_spectrogram(&job.resource_key, width, height)?)
        } else {
            None
        };
        Some(Artifacts {
            waveform,
            spectrogram,
        })
    }

    /// Raises the task's progress and notifies subscribers. Lower values and
    /// tasks that are no longer running are ignored.
    fn report_progress(&self, id: TaskId, progress: u8) {
        let event = {
            let mut table = self.table.lock();
            match table.tasks.get_mut(&id) {
                Some(task) if task.status == TaskStatus::Running && progress > task.progress => {
                    task.progress = progress;
                    ProgressEvent {
                        task_id: id,
                        resource_key: task.resource_key.clone(),
                        progress,
                    }
                }
                _ => return,
            }
        };
        tracing::trace!(task_id = %id, progress, "task progress");
        self.progress.emit(&event);
    }
}

fn ensure_active(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        Err(WaveviewError::Cancelled)
    } else {
        Ok(())
    }
}

async fn until_cancelled<T>(
    token: &CancellationToken,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(WaveviewError::Cancelled),
        result = work => result,
    }
}

async fn compute<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|error| WaveviewError::msg(format!("analysis task failed: {error}")))?
}

#[cfg(test)]
mod tests {
    use std::{
        f32::consts::PI,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use tokio::sync::{mpsc, Semaphore};

    use super::*;
    use crate::audio::DecodedAudio;

    #[derive(Default)]
    struct FakeSource {
        gates: Mutex<HashMap<String, Arc<Semaphore>>>,
        failing: Mutex<HashSet<String>>,
        fetched: Mutex<Vec<String>>,
    }

    impl FakeSource {
        fn gate(&self, source: &str) -> Arc<Semaphore> {
            let gate = Arc::new(Semaphore::new(0));
            self.gates.lock().insert(source.to_string(), gate.clone());
            gate
        }

        fn fail(&self, source: &str) {
            self.failing.lock().insert(source.to_string());
        }

        fn fetched(&self) -> Vec<String> {
            self.fetched.lock().clone()
        }
    }

    #[async_trait]
    impl AudioSource for FakeSource {
        async fn fetch(&self, source: &str) -> Result<Vec<u8>> {
            self.fetched.lock().push(source.to_string());
            let gate = self.gates.lock().get(source).cloned();
            if let Some(gate) = gate {
                let _permit = gate
                    .acquire()
                    .await
                    .map_err(|_| WaveviewError::Transport("gate closed".into()))?;
            }
            if self.failing.lock().contains(source) {
                return Err(WaveviewError::Transport(format!("{source} unreachable")));
            }
            Ok(source.as_bytes().to_vec())
        }

        async fn decode(&self, bytes: Vec<u8>) -> Result<DecodedAudio> {
            if bytes.ends_with(b".panic") {
                panic!("decoder crashed");
            }
            if bytes.ends_with(b".corrupt") {
                return Err(WaveviewError::Decode("bad header".into()));
            }
            let samples = (0..4_096)
                .map(|i| (2.0 * PI * 440.0 * i as f32 / 8_000.0).sin())
                .collect();
            Ok(DecodedAudio::new(samples, 8_000, 1))
        }
    }

    #[derive(Debug, PartialEq)]
    enum Done {
        Completed(String),
        Failed(String),
    }

    fn build(max_concurrent: usize, source: Arc<FakeSource>) -> TaskScheduler {
        build_with(source, |config| config.scheduler.max_concurrent = max_concurrent)
    }

    fn build_with(source: Arc<FakeSource>, adjust: impl FnOnce(&mut AppConfig)) -> TaskScheduler {
        let mut config = AppConfig::default();
        config.analysis.default_width = 32;
        config.analysis.default_height = 16;
        adjust(&mut config);
        TaskScheduler::new(&config, Arc::new(CacheManager::new(&config.cache)), source).unwrap()
    }

    fn outcomes(scheduler: &TaskScheduler) -> mpsc::UnboundedReceiver<Done> {
        let (tx, rx) = mpsc::unbounded_channel();
        let completed = tx.clone();
        scheduler.on_complete(move |event| {
            let _ = completed.send(Done::Completed(event.resource_key.clone()));
        });
        scheduler.on_error(move |event| {
            let _ = tx.send(Done::Failed(event.resource_key.clone()));
        });
        rx
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Done>) -> Done {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("task outcome in time")
            .expect("outcome channel open")
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn completes_both_artifacts() {
        let scheduler = build(3, Arc::new(FakeSource::default()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        scheduler.on_complete(move |event| {
            let _ = tx.send(event.clone());
        });

        let id = scheduler.add_task("a", "a.wav", TaskKind::Both, Priority::Normal);
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(event.task_id, id);
        assert_eq!(event.artifacts.waveform.as_ref().unwrap().width(), 32);
        let spectrogram = event.artifacts.spectrogram.unwrap();
        assert_eq!((spectrogram.width, spectrogram.height), (32, 16));

        let task = scheduler.get_task(id).expect("completed task is retained");
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn duplicate_request_raises_priority_of_existing_task() {
        let source = Arc::new(FakeSource::default());
        let _gate = source.gate("k.wav");
        let scheduler = build(3, source);

        let first = scheduler.add_task("k", "k.wav", TaskKind::Both, Priority::Low);
        let second = scheduler.add_task("k", "k.wav", TaskKind::Both, Priority::High);
        let third = scheduler.add_task("k", "k.wav", TaskKind::Both, Priority::Low);

        assert_eq!(first, second);
        assert_eq!(first, third);
        let tasks = scheduler.get_tasks_for_resource("k");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].priority, Priority::High);
    }

    #[tokio::test]
    async fn pending_tasks_run_by_priority_then_fifo() {
        let source = Arc::new(FakeSource::default());
        let blocker = source.gate("blocker.wav");
        let scheduler = build(1, source);
        let mut rx = outcomes(&scheduler);

        scheduler.add_task("blocker", "blocker.wav", TaskKind::Waveform, Priority::Low);
        scheduler.add_task("a", "a.wav", TaskKind::Waveform, Priority::Low);
        scheduler.add_task("b", "b.wav", TaskKind::Waveform, Priority::Normal);
        scheduler.add_task("c", "c.wav", TaskKind::Waveform, Priority::High);
        scheduler.add_task("d", "d.wav", TaskKind::Waveform, Priority::High);
        assert_eq!(scheduler.queue_stats().pending, 4);

        blocker.add_permits(1);
        let mut order = Vec::new();
        for _ in 0..5 {
            order.push(next(&mut rx).await);
        }

        let expected: Vec<Done> = ["blocker", "c", "d", "b", "a"]
            .into_iter()
            .map(|key| Done::Completed(key.to_string()))
            .collect();
        assert_eq!(order, expected);
    }

    #[tokio::test]
    async fn disabled_priority_runs_in_admission_order() {
        let source = Arc::new(FakeSource::default());
        let blocker = source.gate("blocker.wav");
        let scheduler = build_with(source, |config| {
            config.scheduler.max_concurrent = 1;
            config.scheduler.priority_enabled = false;
        });
        let mut rx = outcomes(&scheduler);

        scheduler.add_task("blocker", "blocker.wav", TaskKind::Waveform, Priority::Normal);
        scheduler.add_task("a", "a.wav", TaskKind::Waveform, Priority::Low);
        scheduler.add_task("b", "b.wav", TaskKind::Waveform, Priority::High);

        blocker.add_permits(1);
        assert_eq!(next(&mut rx).await, Done::Completed("blocker".into()));
        assert_eq!(next(&mut rx).await, Done::Completed("a".into()));
        assert_eq!(next(&mut rx).await, Done::Completed("b".into()));
    }

    #[tokio::test]
    async fn cancelled_pending_task_never_runs_or_notifies() {
        let source = Arc::new(FakeSource::default());
        let blocker = source.gate("blocker.wav");
        let scheduler = build(1, source.clone());
        let mut rx = outcomes(&scheduler);

        scheduler.add_task("blocker", "blocker.wav", TaskKind::Waveform, Priority::Normal);
        let queued = scheduler.add_task("a", "a.wav", TaskKind::Waveform, Priority::Normal);

        assert!(scheduler.cancel_task(queued));
        assert!(scheduler.get_task(queued).is_none());
        assert!(!scheduler.cancel_task(queued));

        blocker.add_permits(1);
        assert_eq!(next(&mut rx).await, Done::Completed("blocker".into()));
        settle().await;

        assert!(rx.try_recv().is_err());
        assert!(!source.fetched().contains(&"a.wav".to_string()));
    }

    #[tokio::test]
    async fn cancelling_running_task_frees_its_slot() {
        let source = Arc::new(FakeSource::default());
        let _stuck = source.gate("a.wav");
        let scheduler = build(1, source);
        let mut rx = outcomes(&scheduler);

        let running = scheduler.add_task("a", "a.wav", TaskKind::Both, Priority::Normal);
        let queued = scheduler.add_task("b", "b.wav", TaskKind::Both, Priority::Normal);
        assert_eq!(scheduler.get_task(running).unwrap().status, TaskStatus::Running);
        assert_eq!(scheduler.get_task(queued).unwrap().status, TaskStatus::Pending);

        assert!(scheduler.cancel_task(running));
        assert!(scheduler.get_task(running).is_none());
        assert_eq!(scheduler.get_task(queued).unwrap().status, TaskStatus::Running);

        assert_eq!(next(&mut rx).await, Done::Completed("b".into()));
        settle().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn running_count_never_exceeds_limit() {
        let source = Arc::new(FakeSource::default());
        let gates: Vec<_> = (0..5).map(|i| source.gate(&format!("{i}.wav"))).collect();
        let scheduler = build(2, source);
        let mut rx = outcomes(&scheduler);

        let peak = Arc::new(AtomicUsize::new(0));
        {
            let observer = scheduler.clone();
            let peak = peak.clone();
            scheduler.on_progress(move |_| {
                peak.fetch_max(observer.queue_stats().running, Ordering::SeqCst);
            });
        }

        for i in 0..5 {
            scheduler.add_task(i.to_string(), format!("{i}.wav"), TaskKind::Waveform, Priority::Normal);
        }
        let stats = scheduler.queue_stats();
        assert_eq!((stats.running, stats.pending), (2, 3));

        for gate in &gates {
            gate.add_permits(1);
        }
        for _ in 0..5 {
            next(&mut rx).await;
            assert!(scheduler.queue_stats().running <= 2);
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(scheduler.queue_stats().completed, 5);
    }

    #[tokio::test]
    async fn transport_failure_is_reported_once() {
        let source = Arc::new(FakeSource::default());
        source.fail("gone.wav");
        let scheduler = build(1, source);
        let (tx, mut rx) = mpsc::unbounded_channel();
        scheduler.on_error(move |event| {
            let _ = tx.send(event.clone());
        });

        let id = scheduler.add_task("gone", "gone.wav", TaskKind::Both, Priority::Normal);
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(event.task_id, id);
        assert!(matches!(*event.error, WaveviewError::Transport(_)));
        let task = scheduler.get_task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("unreachable"));
        settle().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn decode_failure_fails_the_task() {
        let scheduler = build(1, Arc::new(FakeSource::default()));
        let mut rx = outcomes(&scheduler);

        scheduler.add_task("bad", "bad.corrupt", TaskKind::Waveform, Priority::Normal);

        assert_eq!(next(&mut rx).await, Done::Failed("bad".into()));
        assert_eq!(scheduler.queue_stats().failed, 1);
    }

    #[tokio::test]
    async fn panicking_pipeline_fails_and_frees_its_slot() {
        let scheduler = build(1, Arc::new(FakeSource::default()));
        let (tx, mut errors) = mpsc::unbounded_channel();
        scheduler.on_error(move |event| {
            let _ = tx.send(event.clone());
        });
        let mut rx = outcomes(&scheduler);

        let crashed = scheduler.add_task("boom", "boom.panic", TaskKind::Both, Priority::Normal);
        let queued = scheduler.add_task("ok", "ok.wav", TaskKind::Both, Priority::Normal);

        assert_eq!(next(&mut rx).await, Done::Failed("boom".into()));
        assert_eq!(next(&mut rx).await, Done::Completed("ok".into()));

        let event = errors.try_recv().expect("one error event");
        assert_eq!(event.task_id, crashed);
        assert!(event.error.to_string().contains("panicked"));
        settle().await;
        assert!(errors.try_recv().is_err());
        assert!(rx.try_recv().is_err());

        assert_eq!(scheduler.get_task(crashed).unwrap().status, TaskStatus::Failed);
        assert_eq!(scheduler.get_task(queued).unwrap().status, TaskStatus::Completed);
        let stats = scheduler.queue_stats();
        assert_eq!((stats.running, stats.completed, stats.failed), (0, 1, 1));
    }

    #[tokio::test]
    async fn cached_artifacts_skip_acquisition() {
        let source = Arc::new(FakeSource::default());
        let scheduler = build(1, source.clone());
        let mut rx = outcomes(&scheduler);

        let first = scheduler.add_task("a", "a.wav", TaskKind::Both, Priority::Normal);
        next(&mut rx).await;
        let second = scheduler.add_task("a", "a.wav", TaskKind::Both, Priority::Normal);
        next(&mut rx).await;

        assert_ne!(first, second);
        assert!(scheduler.get_task(first).is_none(), "stale task is discarded");
        assert_eq!(source.fetched(), vec!["a.wav".to_string()]);
    }

    #[tokio::test]
    async fn decoded_audio_is_reused_across_sizes() {
        let source = Arc::new(FakeSource::default());
        let scheduler = build(1, source.clone());
        let mut rx = outcomes(&scheduler);

        scheduler.add_request(TaskRequest::new("a", "a.wav").dimensions(16, 8));
        next(&mut rx).await;
        scheduler.add_request(TaskRequest::new("a", "a.wav").dimensions(64, 8));
        next(&mut rx).await;

        assert_eq!(source.fetched().len(), 1);
        assert!(scheduler.cache().get_waveform("a", 64).is_some());
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_reaches_completion() {
        let scheduler = build(1, Arc::new(FakeSource::default()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            scheduler.on_progress(move |event| seen.lock().push(event.progress));
        }
        let mut rx = outcomes(&scheduler);

        scheduler.add_task("a", "a.wav", TaskKind::Both, Priority::Normal);
        next(&mut rx).await;

        let seen = seen.lock().clone();
        assert_eq!(seen, vec![10, 20, 40, 50, 75, 100]);
    }

    #[tokio::test]
    async fn priority_updates_only_touch_pending_tasks() {
        let source = Arc::new(FakeSource::default());
        let _gate = source.gate("a.wav");
        let scheduler = build(1, source);

        let running = scheduler.add_task("a", "a.wav", TaskKind::Both, Priority::Low);
        let pending = scheduler.add_task("b", "b.wav", TaskKind::Both, Priority::Low);

        assert!(!scheduler.update_priority(running, Priority::High));
        assert!(scheduler.update_priority(pending, Priority::High));
        assert!(!scheduler.update_resource_priority("a", Priority::Normal));
        assert!(scheduler.update_resource_priority("b", Priority::Normal));

        assert_eq!(scheduler.get_task(running).unwrap().priority, Priority::Low);
        assert_eq!(scheduler.get_task(pending).unwrap().priority, Priority::Normal);
    }

    #[tokio::test]
    async fn finished_tasks_expire_after_retention() {
        let source = Arc::new(FakeSource::default());
        source.fail("gone.wav");
        let scheduler = build_with(source, |config| {
            config.scheduler.completed_retention_ms = 30;
            config.scheduler.failed_retention_ms = 60;
        });
        let mut rx = outcomes(&scheduler);

        let ok = scheduler.add_task("a", "a.wav", TaskKind::Waveform, Priority::Normal);
        let failed = scheduler.add_task("gone", "gone.wav", TaskKind::Waveform, Priority::Normal);
        next(&mut rx).await;
        next(&mut rx).await;
        assert!(scheduler.get_task(ok).is_some());
        assert!(scheduler.get_task(failed).is_some());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(scheduler.get_task(ok).is_none());
        assert!(scheduler.get_task(failed).is_none());
        assert_eq!(scheduler.queue_stats(), QueueStats::default());
    }

    #[tokio::test]
    async fn batch_cancellation() {
        let source = Arc::new(FakeSource::default());
        let _gates: Vec<_> = ["a.wav", "b.wav", "c.wav"]
            .into_iter()
            .map(|name| source.gate(name))
            .collect();
        let scheduler = build(1, source);

        scheduler.add_task("a", "a.wav", TaskKind::Both, Priority::Normal);
        scheduler.add_task("b", "b.wav", TaskKind::Both, Priority::Normal);
        scheduler.add_task("c", "c.wav", TaskKind::Both, Priority::Normal);

        assert_eq!(scheduler.cancel_all_pending(), 2);
        assert_eq!(scheduler.queue_stats().running, 1);
        assert_eq!(scheduler.cancel_for_resource("missing"), 0);
        assert_eq!(scheduler.cancel_all(), 1);
        assert_eq!(scheduler.queue_stats(), QueueStats::default());
    }

    #[tokio::test]
    async fn unsubscribed_handlers_are_not_called() {
        let scheduler = build(1, Arc::new(FakeSource::default()));
        let calls = Arc::new(AtomicUsize::new(0));
        let subscription = {
            let calls = calls.clone();
            scheduler.on_complete(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        let mut rx = outcomes(&scheduler);

        subscription.unsubscribe();
        scheduler.add_task("a", "a.wav", TaskKind::Waveform, Priority::Normal);
        next(&mut rx).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_wedge_the_queue() {
        let scheduler = build(1, Arc::new(FakeSource::default()));
        scheduler.on_complete(|_| panic!("subscriber bug"));
        let mut rx = outcomes(&scheduler);

        scheduler.add_task("a", "a.wav", TaskKind::Waveform, Priority::Normal);
        scheduler.add_task("b", "b.wav", TaskKind::Waveform, Priority::Normal);

        assert_eq!(next(&mut rx).await, Done::Completed("a".into()));
        assert_eq!(next(&mut rx).await, Done::Completed("b".into()));
    }

    #[test]
    fn requires_a_runtime() {
        let config = AppConfig::default();
        let result = TaskScheduler::new(
            &config,
            Arc::new(CacheManager::default()),
            Arc::new(FakeSource::default()),
        );
        assert!(result.is_err());
    }
}
