//! Durable per-key job queue
//!
//! On-disk layout under `base_dir/`: `pending/`, `inflight/`, `done/`,
//! `failed/`. Every persisted task sits in exactly one of the four
//! directories; transitions happen by rename, writes go through a temp file
//! with fsync. Per key, at most one worker runs at a time and at most one
//! pending file exists (newer tasks coalesce over older ones).
//!
//! The update queue and the forget queue are two instances of this type
//! with different runners.

pub mod task;

pub use task::{QueueTask, TaskKind};

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{DeepMemError, Result};

/// Queue tuning knobs
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub base_dir: PathBuf,
    /// Worker fan-out of the scheduler loop
    pub concurrency: usize,
    /// Per-namespace inflight cap; 0 = unset
    pub namespace_concurrency: usize,
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    /// Keep finished tasks under `done/` instead of deleting them
    pub keep_done: bool,
    /// Days a done file is retained before the cleanup loop removes it
    pub retention_days: u64,
    /// Reject tasks whose gzip payload exceeds this; 0 = unlimited
    pub max_task_bytes: usize,
    pub pump_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./queue"),
            concurrency: 2,
            namespace_concurrency: 0,
            max_attempts: 5,
            retry_base_ms: 2_000,
            retry_max_ms: 5 * 60_000,
            keep_done: false,
            retention_days: 7,
            max_task_bytes: 1_500_000,
            pump_interval_ms: 250,
        }
    }
}

/// Work executed for each task
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Process one task. `Ok(Some(value))` is recorded on the done file.
    async fn run(&self, task: &QueueTask) -> Result<Option<serde_json::Value>>;
}

/// Approximate queue depths for `/queue/stats` and backlog policies
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub pending_approx: usize,
    pub inflight: usize,
    pub active: usize,
    pub done: usize,
    pub failed: usize,
}

/// Outcome of an enqueue call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued { file: String },
    /// An identical pending task for the key already existed
    Coalesced,
}

/// Failed-archive export result
#[derive(Debug, Clone, Serialize)]
pub struct FailedExport {
    pub mode: &'static str,
    pub tasks: Vec<QueueTask>,
}

#[derive(Debug, Clone)]
struct PendingEntry {
    path: PathBuf,
    file: String,
    namespace: String,
    transcript_hash: Option<String>,
    next_run_at: u64,
}

#[derive(Default)]
struct QueueState {
    pending_by_key: HashMap<String, PendingEntry>,
    inflight_keys: HashSet<String>,
    inflight_namespaces: HashMap<String, usize>,
}

/// Durable per-key FIFO with crash recovery
pub struct DurableQueue {
    config: QueueConfig,
    runner: Arc<dyn TaskRunner>,
    state: Mutex<QueueState>,
    active: AtomicUsize,
    stopped: AtomicBool,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Reject file names that could escape the queue directories
fn safe_file_name(name: &str) -> Result<&str> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || !name.ends_with(".json")
    {
        return Err(DeepMemError::InvalidRequest(format!(
            "invalid queue file name: {}",
            name
        )));
    }
    Ok(name)
}

impl DurableQueue {
    pub fn new(config: QueueConfig, runner: Arc<dyn TaskRunner>) -> Result<Arc<Self>> {
        let queue = Arc::new(Self {
            config,
            runner,
            state: Mutex::new(QueueState::default()),
            active: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        });
        for dir in [
            queue.pending_dir(),
            queue.inflight_dir(),
            queue.done_dir(),
            queue.failed_dir(),
        ] {
            fs::create_dir_all(&dir)?;
        }
        Ok(queue)
    }

    fn pending_dir(&self) -> PathBuf {
        self.config.base_dir.join("pending")
    }

    fn inflight_dir(&self) -> PathBuf {
        self.config.base_dir.join("inflight")
    }

    fn done_dir(&self) -> PathBuf {
        self.config.base_dir.join("done")
    }

    fn failed_dir(&self) -> PathBuf {
        self.config.base_dir.join("failed")
    }

    /// Write-to-temp + fsync + rename
    fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
        let tmp = path.with_file_name(format!(
            "{}.tmp-{}",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("task"),
            Uuid::new_v4()
        ));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn write_task(path: &Path, task: &QueueTask) -> Result<()> {
        Self::atomic_write(path, &serde_json::to_vec(task)?)
    }

    fn read_task(path: &Path) -> Result<QueueTask> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Exponential backoff with a small jitter so retries of many keys do
    /// not land on the same instant
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1).min(20);
        let raw = self
            .config
            .retry_max_ms
            .min(self.config.retry_base_ms.saturating_mul(1u64 << exp));
        let upper = 250.min(raw / 10);
        let jitter = if upper > 10 {
            rand::thread_rng().gen_range(10..upper)
        } else {
            10
        };
        raw + jitter
    }

    /// Crash recovery: everything left in `inflight/` goes back to
    /// `pending/` under the same file name, attempt bumped and a backoff
    /// applied. Then the per-key pending index is rebuilt from disk.
    pub fn init(&self) -> Result<usize> {
        let mut recovered = 0usize;
        for entry in fs::read_dir(self.inflight_dir())? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };
            match Self::read_task(&path) {
                Ok(mut task) => {
                    task.attempt += 1;
                    task.next_run_at = now_ms() + self.backoff_ms(task.attempt);
                    let target = self.pending_dir().join(&name);
                    Self::write_task(&target, &task)?;
                    fs::remove_file(&path)?;
                    recovered += 1;
                }
                Err(e) => {
                    // Unparseable task files would poison the scheduler;
                    // park them in the failed archive as-is.
                    tracing::warn!("quarantining unreadable inflight task {}: {}", name, e);
                    let _ = fs::rename(&path, self.failed_dir().join(&name));
                }
            }
        }

        let mut state = self.state.lock();
        state.pending_by_key.clear();
        for entry in fs::read_dir(self.pending_dir())? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };
            let task = match Self::read_task(&path) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!("skipping unreadable pending task {}: {}", name, e);
                    continue;
                }
            };
            let candidate = PendingEntry {
                path: path.clone(),
                file: name,
                namespace: task.namespace.clone(),
                transcript_hash: task.transcript_hash.clone(),
                next_run_at: task.next_run_at,
            };
            match state.pending_by_key.get(&task.key) {
                // Best-effort newest wins: keep the entry scheduled latest.
                Some(existing) if existing.next_run_at >= candidate.next_run_at => {}
                _ => {
                    state.pending_by_key.insert(task.key.clone(), candidate);
                }
            }
        }
        if recovered > 0 {
            tracing::info!("queue recovery: {} inflight task(s) re-pended", recovered);
        }
        Ok(recovered)
    }

    /// Enqueue a task, coalescing per key
    pub fn enqueue(&self, task: QueueTask) -> Result<EnqueueOutcome> {
        if self.config.max_task_bytes > 0 && task.gzip_len() > self.config.max_task_bytes {
            return Err(DeepMemError::TaskTooLarge {
                got: task.gzip_len(),
                limit: self.config.max_task_bytes,
            });
        }

        // Identical replay: a pending task for the key with the same
        // transcript hash makes this enqueue a no-op.
        {
            let state = self.state.lock();
            if let Some(existing) = state.pending_by_key.get(&task.key) {
                if existing.transcript_hash.is_some()
                    && existing.transcript_hash == task.transcript_hash
                {
                    return Ok(EnqueueOutcome::Coalesced);
                }
            }
        }

        let name = task.file_name(now_ms());
        let path = self.pending_dir().join(&name);
        Self::write_task(&path, &task)?;

        let superseded = {
            let mut state = self.state.lock();
            state.pending_by_key.insert(
                task.key.clone(),
                PendingEntry {
                    path: path.clone(),
                    file: name.clone(),
                    namespace: task.namespace.clone(),
                    transcript_hash: task.transcript_hash.clone(),
                    next_run_at: task.next_run_at,
                },
            )
        };
        if let Some(old) = superseded {
            let _ = fs::remove_file(&old.path);
        }
        Ok(EnqueueOutcome::Enqueued { file: name })
    }

    /// Drop the pending task for a session, if any. Inflight tasks are not
    /// cancelled.
    pub fn cancel_by_session(&self, namespace: &str, session_id: &str) -> usize {
        let key = format!("{}::{}", namespace, session_id);
        let removed = self.state.lock().pending_by_key.remove(&key);
        match removed {
            Some(entry) => {
                let _ = fs::remove_file(&entry.path);
                1
            }
            None => 0,
        }
    }

    pub fn stats(&self) -> QueueStats {
        let (pending, inflight) = {
            let state = self.state.lock();
            (state.pending_by_key.len(), state.inflight_keys.len())
        };
        QueueStats {
            pending_approx: pending,
            inflight,
            active: self.active.load(Ordering::SeqCst),
            done: count_dir(&self.done_dir()),
            failed: count_dir(&self.failed_dir()),
        }
    }

    /// One scheduler pass: dispatch every runnable pending task up to the
    /// concurrency budget. Returns the number dispatched.
    pub fn pump_once(queue: &Arc<Self>) -> usize {
        let now = now_ms();
        let mut dispatched = 0usize;
        loop {
            if queue.active.load(Ordering::SeqCst) >= queue.config.concurrency {
                break;
            }
            // Pick and claim a candidate in one critical section so a second
            // pump pass (or run_now) cannot grab the same key.
            let claimed = {
                let mut state = queue.state.lock();
                let key = state
                    .pending_by_key
                    .iter()
                    .find(|(key, entry)| {
                        entry.next_run_at <= now
                            && !state.inflight_keys.contains(*key)
                            && (queue.config.namespace_concurrency == 0
                                || state
                                    .inflight_namespaces
                                    .get(&entry.namespace)
                                    .copied()
                                    .unwrap_or(0)
                                    < queue.config.namespace_concurrency)
                    })
                    .map(|(key, _)| key.clone());
                match key {
                    Some(key) => {
                        let entry = state.pending_by_key.remove(&key).expect("entry exists");
                        state.inflight_keys.insert(key.clone());
                        *state
                            .inflight_namespaces
                            .entry(entry.namespace.clone())
                            .or_insert(0) += 1;
                        Some((key, entry))
                    }
                    None => None,
                }
            };
            let Some((key, entry)) = claimed else { break };

            let inflight_path = queue.inflight_dir().join(&entry.file);
            let task = match fs::rename(&entry.path, &inflight_path)
                .map_err(DeepMemError::from)
                .and_then(|_| Self::read_task(&inflight_path))
            {
                Ok(task) => task,
                Err(e) => {
                    tracing::warn!("dropping undispatchable task {}: {}", entry.file, e);
                    let _ = fs::remove_file(&inflight_path);
                    queue.release_key(&key, &entry.namespace);
                    continue;
                }
            };

            queue.active.fetch_add(1, Ordering::SeqCst);
            let worker = Arc::clone(queue);
            tokio::spawn(async move {
                worker.process(inflight_path, task).await;
            });
            dispatched += 1;
        }
        dispatched
    }

    fn release_key(&self, key: &str, namespace: &str) {
        let mut state = self.state.lock();
        state.inflight_keys.remove(key);
        if let Some(count) = state.inflight_namespaces.get_mut(namespace) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.inflight_namespaces.remove(namespace);
            }
        }
    }

    async fn process(self: Arc<Self>, inflight_path: PathBuf, mut task: QueueTask) {
        let outcome = self.runner.run(&task).await;
        let name = inflight_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("task.json")
            .to_string();

        match outcome {
            Ok(result) => {
                if self.config.keep_done {
                    let done_path = self.done_dir().join(&name);
                    if let Err(e) = fs::rename(&inflight_path, &done_path) {
                        tracing::warn!("failed to archive done task {}: {}", name, e);
                    } else if let Some(result) = result {
                        task.result = Some(result);
                        if let Err(e) = Self::write_task(&done_path, &task) {
                            tracing::warn!("failed to record result on {}: {}", name, e);
                        }
                    }
                } else {
                    let _ = fs::remove_file(&inflight_path);
                }
            }
            Err(e) => {
                task.attempt += 1;
                task.last_error = Some(e.to_string());
                if task.attempt >= self.config.max_attempts {
                    tracing::warn!(
                        "task {} failed permanently after {} attempts: {}",
                        task.key,
                        task.attempt,
                        e
                    );
                    let failed_path = self.failed_dir().join(&name);
                    if Self::write_task(&failed_path, &task).is_ok() {
                        let _ = fs::remove_file(&inflight_path);
                    }
                } else {
                    task.next_run_at = now_ms() + self.backoff_ms(task.attempt);
                    tracing::info!(
                        "task {} attempt {} failed, retrying at {}: {}",
                        task.key,
                        task.attempt,
                        task.next_run_at,
                        e
                    );
                    self.repend_retry(&inflight_path, &task);
                }
            }
        }

        self.release_key(&task.key, &task.namespace);
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn repend_retry(&self, inflight_path: &Path, task: &QueueTask) {
        // A pending task enqueued while this one ran supersedes the retry:
        // it carries a newer transcript for the same key.
        let has_newer = self.state.lock().pending_by_key.contains_key(&task.key);
        if has_newer {
            tracing::debug!("retry of {} superseded by newer pending task", task.key);
            let _ = fs::remove_file(inflight_path);
            return;
        }
        let name = task.file_name(now_ms());
        let path = self.pending_dir().join(&name);
        if let Err(e) = Self::write_task(&path, task) {
            tracing::warn!("failed to re-pend {}: {}", task.key, e);
            return;
        }
        let _ = fs::remove_file(inflight_path);
        let superseded = self.state.lock().pending_by_key.insert(
            task.key.clone(),
            PendingEntry {
                path,
                file: name,
                namespace: task.namespace.clone(),
                transcript_hash: task.transcript_hash.clone(),
                next_run_at: task.next_run_at,
            },
        );
        if let Some(old) = superseded {
            let _ = fs::remove_file(&old.path);
        }
    }

    /// Run a task synchronously under the per-key lock, bypassing the disk.
    /// Spin-waits while a queue worker holds the same key.
    pub async fn run_now(&self, task: QueueTask) -> Result<Option<serde_json::Value>> {
        let key = task.key.clone();
        let namespace = task.namespace.clone();
        loop {
            {
                let mut state = self.state.lock();
                if !state.inflight_keys.contains(&key) {
                    state.inflight_keys.insert(key.clone());
                    *state
                        .inflight_namespaces
                        .entry(namespace.clone())
                        .or_insert(0) += 1;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let result = self.runner.run(&task).await;
        self.release_key(&key, &namespace);
        result
    }

    /// Resolve once the queue is drained (no active workers, no pending
    /// tasks) or the timeout elapses. Returns whether it drained.
    pub async fn on_idle(&self, timeout_ms: u64) -> bool {
        let deadline = now_ms() + timeout_ms;
        loop {
            let idle = self.active.load(Ordering::SeqCst) == 0
                && self.state.lock().pending_by_key.is_empty();
            if idle {
                return true;
            }
            if now_ms() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Background scheduler: pump on an interval, cleanup on a slower one
    pub fn spawn_scheduler(queue: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(queue);
        tokio::spawn(async move {
            let pump_every = Duration::from_millis(queue.config.pump_interval_ms.max(10));
            let cleanup_every = Duration::from_secs(45);
            let mut last_cleanup = SystemTime::now();
            loop {
                if queue.stopped.load(Ordering::SeqCst) {
                    break;
                }
                Self::pump_once(&queue);
                if last_cleanup.elapsed().unwrap_or_default() >= cleanup_every {
                    queue.cleanup_done();
                    last_cleanup = SystemTime::now();
                }
                tokio::time::sleep(pump_every).await;
            }
        })
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Delete done files past their retention window (by mtime)
    pub fn cleanup_done(&self) {
        let Ok(entries) = fs::read_dir(self.done_dir()) else {
            return;
        };
        let cutoff =
            SystemTime::now() - Duration::from_secs(self.config.retention_days * 24 * 60 * 60);
        for entry in entries.flatten() {
            let path = entry.path();
            let expired = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|mtime| mtime <= cutoff)
                .unwrap_or(false);
            if expired {
                let _ = fs::remove_file(&path);
            }
        }
    }

    // ------------------------------------------------------------------
    // Failed-archive admin
    // ------------------------------------------------------------------

    fn failed_entries(&self) -> Result<Vec<(String, QueueTask)>> {
        let mut names: Vec<String> = fs::read_dir(self.failed_dir())?
            .flatten()
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| n.ends_with(".json"))
            .collect();
        names.sort();
        let mut entries = Vec::new();
        for name in names {
            match Self::read_task(&self.failed_dir().join(&name)) {
                Ok(task) => entries.push((name, task)),
                Err(e) => tracing::warn!("unreadable failed task {}: {}", name, e),
            }
        }
        Ok(entries)
    }

    /// List failed tasks, transcript payloads stripped
    pub fn list_failed(&self, limit: usize) -> Result<Vec<(String, QueueTask)>> {
        Ok(self
            .failed_entries()?
            .into_iter()
            .take(limit)
            .map(|(name, task)| (name, task.without_payload()))
            .collect())
    }

    /// Export failed tasks by file name or by key
    pub fn export_failed(
        &self,
        file: Option<&str>,
        key: Option<&str>,
        limit: usize,
    ) -> Result<FailedExport> {
        if let Some(file) = file {
            let name = safe_file_name(file)?;
            let path = self.failed_dir().join(name);
            return match Self::read_task(&path) {
                Ok(task) => Ok(FailedExport {
                    mode: "file",
                    tasks: vec![task.without_payload()],
                }),
                Err(_) => Ok(FailedExport {
                    mode: "empty",
                    tasks: Vec::new(),
                }),
            };
        }
        let tasks: Vec<QueueTask> = self
            .failed_entries()?
            .into_iter()
            .filter(|(_, task)| key.map_or(true, |k| task.key == k))
            .take(limit)
            .map(|(_, task)| task.without_payload())
            .collect();
        Ok(FailedExport {
            mode: if tasks.is_empty() { "empty" } else { "list" },
            tasks,
        })
    }

    /// Move one failed file back to pending, resetting its schedule
    pub fn retry_failed(&self, file: &str) -> Result<bool> {
        let name = safe_file_name(file)?;
        let failed_path = self.failed_dir().join(name);
        let mut task = match Self::read_task(&failed_path) {
            Ok(task) => task,
            Err(_) => return Ok(false),
        };
        task.next_run_at = now_ms();
        task.last_error = None;

        let pending_path = self.pending_dir().join(name);
        Self::write_task(&pending_path, &task)?;
        fs::remove_file(&failed_path)?;

        let superseded = self.state.lock().pending_by_key.insert(
            task.key.clone(),
            PendingEntry {
                path: pending_path,
                file: name.to_string(),
                namespace: task.namespace.clone(),
                transcript_hash: task.transcript_hash.clone(),
                next_run_at: task.next_run_at,
            },
        );
        if let Some(old) = superseded {
            let _ = fs::remove_file(&old.path);
        }
        Ok(true)
    }

    /// Retry every failed task with the given key, up to `limit`.
    /// Returns the matched file names; `dry_run` lists without moving.
    pub fn retry_failed_by_key(
        &self,
        key: &str,
        limit: usize,
        dry_run: bool,
    ) -> Result<Vec<String>> {
        let matched: Vec<String> = self
            .failed_entries()?
            .into_iter()
            .filter(|(_, task)| task.key == key)
            .take(limit)
            .map(|(name, _)| name)
            .collect();
        if !dry_run {
            for name in &matched {
                self.retry_failed(name)?;
            }
        }
        Ok(matched)
    }
}

fn count_dir(dir: &Path) -> usize {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .filter(|e| {
                    e.file_name()
                        .to_str()
                        .is_some_and(|n| n.ends_with(".json"))
                })
                .count()
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct RecordingRunner {
        runs: Mutex<Vec<String>>,
        concurrent: AtomicU32,
        max_concurrent: AtomicU32,
        fail_times: u32,
        fail_count: AtomicU32,
        delay_ms: u64,
    }

    impl RecordingRunner {
        fn new() -> Arc<Self> {
            Self::with(0, 0)
        }

        fn with(fail_times: u32, delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                runs: Mutex::new(Vec::new()),
                concurrent: AtomicU32::new(0),
                max_concurrent: AtomicU32::new(0),
                fail_times,
                fail_count: AtomicU32::new(0),
                delay_ms,
            })
        }

        fn run_keys(&self) -> Vec<String> {
            self.runs.lock().clone()
        }
    }

    #[async_trait]
    impl TaskRunner for RecordingRunner {
        async fn run(&self, task: &QueueTask) -> Result<Option<serde_json::Value>> {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            self.runs.lock().push(task.key.clone());
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            if self.fail_count.fetch_add(1, Ordering::SeqCst) < self.fail_times {
                return Err(DeepMemError::VectorStore("injected".into()));
            }
            Ok(Some(serde_json::json!({ "ok": true })))
        }
    }

    fn queue_with(
        dir: &Path,
        runner: Arc<dyn TaskRunner>,
        tweak: impl FnOnce(&mut QueueConfig),
    ) -> Arc<DurableQueue> {
        let mut config = QueueConfig {
            base_dir: dir.to_path_buf(),
            retry_base_ms: 10,
            retry_max_ms: 50,
            pump_interval_ms: 10,
            ..Default::default()
        };
        tweak(&mut config);
        let queue = DurableQueue::new(config, runner).unwrap();
        queue.init().unwrap();
        queue
    }

    fn update_task(session: &str, hash: &str) -> QueueTask {
        QueueTask::update("default", session, hash.to_string(), 1, "Zm9v".into(), 0)
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = now_ms() + 3_000;
        while !condition() {
            assert!(now_ms() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(15)).await;
        }
    }

    #[tokio::test]
    async fn test_enqueue_writes_pending_file() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue_with(dir.path(), RecordingRunner::new(), |_| {});
        let outcome = queue.enqueue(update_task("s1", "h1")).unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Enqueued { .. }));
        assert_eq!(queue.stats().pending_approx, 1);
        assert_eq!(count_dir(&dir.path().join("pending")), 1);
    }

    #[tokio::test]
    async fn test_coalesce_identical_hash() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue_with(dir.path(), RecordingRunner::new(), |_| {});
        queue.enqueue(update_task("s1", "h1")).unwrap();
        let outcome = queue.enqueue(update_task("s1", "h1")).unwrap();
        assert_eq!(outcome, EnqueueOutcome::Coalesced);
        assert_eq!(count_dir(&dir.path().join("pending")), 1);
    }

    #[tokio::test]
    async fn test_coalesce_keeps_latest_hash() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue_with(dir.path(), RecordingRunner::new(), |_| {});
        queue.enqueue(update_task("s1", "h1")).unwrap();
        queue.enqueue(update_task("s1", "h2")).unwrap();
        assert_eq!(queue.stats().pending_approx, 1);
        assert_eq!(count_dir(&dir.path().join("pending")), 1);
        // The surviving file carries the newest transcript hash.
        let entry = fs::read_dir(dir.path().join("pending"))
            .unwrap()
            .flatten()
            .next()
            .unwrap();
        let task = DurableQueue::read_task(&entry.path()).unwrap();
        assert_eq!(task.transcript_hash.as_deref(), Some("h2"));
    }

    #[tokio::test]
    async fn test_cancel_by_session() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue_with(dir.path(), RecordingRunner::new(), |_| {});
        queue.enqueue(update_task("s1", "h1")).unwrap();
        assert_eq!(queue.cancel_by_session("default", "s1"), 1);
        assert_eq!(queue.cancel_by_session("default", "s1"), 0);
        assert_eq!(count_dir(&dir.path().join("pending")), 0);
    }

    #[tokio::test]
    async fn test_recovery_moves_inflight_to_pending() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue_with(dir.path(), RecordingRunner::new(), |_| {});
        // Simulate a crash: a task file stranded in inflight/.
        let task = update_task("s2", "h1");
        let name = task.file_name(now_ms());
        DurableQueue::write_task(&dir.path().join("inflight").join(&name), &task).unwrap();

        let recovered = queue.init().unwrap();
        assert_eq!(recovered, 1);
        let pending_path = dir.path().join("pending").join(&name);
        assert!(pending_path.exists());
        let recovered_task = DurableQueue::read_task(&pending_path).unwrap();
        assert_eq!(recovered_task.attempt, 1);
        assert!(recovered_task.next_run_at > now_ms().saturating_sub(1_000));
        assert_eq!(queue.stats().pending_approx, 1);
    }

    #[tokio::test]
    async fn test_worker_success_removes_task() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::new();
        let queue = queue_with(dir.path(), runner.clone(), |_| {});
        queue.enqueue(update_task("s1", "h1")).unwrap();
        assert_eq!(DurableQueue::pump_once(&queue), 1);
        assert!(queue.on_idle(2_000).await);
        assert_eq!(runner.run_keys(), vec!["default::s1".to_string()]);
        assert_eq!(count_dir(&dir.path().join("pending")), 0);
        assert_eq!(count_dir(&dir.path().join("inflight")), 0);
        assert_eq!(count_dir(&dir.path().join("done")), 0);
    }

    #[tokio::test]
    async fn test_worker_success_keep_done() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue_with(dir.path(), RecordingRunner::new(), |c| c.keep_done = true);
        queue.enqueue(update_task("s1", "h1")).unwrap();
        DurableQueue::pump_once(&queue);
        assert!(queue.on_idle(2_000).await);
        wait_for(|| count_dir(&dir.path().join("done")) == 1).await;
        let entry = fs::read_dir(dir.path().join("done"))
            .unwrap()
            .flatten()
            .next()
            .unwrap();
        let task = DurableQueue::read_task(&entry.path()).unwrap();
        assert_eq!(task.result.unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn test_worker_failure_retries_then_archives() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::with(10, 0); // always fails
        let queue = queue_with(dir.path(), runner.clone(), |c| c.max_attempts = 2);
        queue.enqueue(update_task("s1", "h1")).unwrap();

        // First attempt fails and re-pends with a short backoff.
        DurableQueue::pump_once(&queue);
        wait_for(|| queue.stats().active == 0 && queue.stats().pending_approx == 1).await;

        // Wait out the backoff; the retry hits max_attempts and is archived.
        tokio::time::sleep(Duration::from_millis(120)).await;
        DurableQueue::pump_once(&queue);
        wait_for(|| count_dir(&dir.path().join("failed")) == 1).await;
        assert_eq!(count_dir(&dir.path().join("pending")), 0);
        let (_, failed) = queue.list_failed(10).unwrap().pop().unwrap();
        assert_eq!(failed.attempt, 2);
        assert!(failed.last_error.as_deref().unwrap().contains("injected"));
    }

    #[tokio::test]
    async fn test_per_key_exclusion() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::with(0, 80);
        let queue = queue_with(dir.path(), runner.clone(), |c| c.concurrency = 4);
        queue.enqueue(update_task("s1", "h1")).unwrap();
        assert_eq!(DurableQueue::pump_once(&queue), 1);
        // Same key again while the first runs: must not dispatch.
        queue.enqueue(update_task("s1", "h2")).unwrap();
        assert_eq!(DurableQueue::pump_once(&queue), 0);
        // A different key dispatches fine.
        queue.enqueue(update_task("s9", "h1")).unwrap();
        assert_eq!(DurableQueue::pump_once(&queue), 1);

        wait_for(|| runner.run_keys().len() == 2).await;
        DurableQueue::pump_once(&queue);
        wait_for(|| runner.run_keys().len() == 3).await;
        let keys = runner.run_keys();
        assert_eq!(keys.iter().filter(|k| *k == "default::s1").count(), 2);
    }

    #[tokio::test]
    async fn test_namespace_concurrency_cap() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::with(0, 80);
        let queue = queue_with(dir.path(), runner.clone(), |c| {
            c.concurrency = 8;
            c.namespace_concurrency = 1;
        });
        queue.enqueue(update_task("s1", "h1")).unwrap();
        queue.enqueue(update_task("s2", "h1")).unwrap();
        // Same namespace: only one may be inflight at a time.
        assert_eq!(DurableQueue::pump_once(&queue), 1);
        assert_eq!(DurableQueue::pump_once(&queue), 0);
        wait_for(|| runner.run_keys().len() == 1).await;
        DurableQueue::pump_once(&queue);
        wait_for(|| runner.run_keys().len() == 2).await;
        assert_eq!(runner.max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_now_waits_for_key() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::with(0, 80);
        let queue = queue_with(dir.path(), runner.clone(), |_| {});
        queue.enqueue(update_task("s1", "h1")).unwrap();
        DurableQueue::pump_once(&queue);
        // run_now on the same key must wait for the inflight worker.
        let result = queue.run_now(update_task("s1", "h2")).await.unwrap();
        assert!(result.is_some());
        assert_eq!(runner.max_concurrent.load(Ordering::SeqCst), 1);
        assert_eq!(runner.run_keys().len(), 2);
    }

    #[tokio::test]
    async fn test_size_guard() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue_with(dir.path(), RecordingRunner::new(), |c| c.max_task_bytes = 2);
        let err = queue.enqueue(update_task("s1", "h1")).unwrap_err();
        assert!(matches!(err, DeepMemError::TaskTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_future_next_run_at_not_dispatched() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue_with(dir.path(), RecordingRunner::new(), |_| {});
        let mut task = update_task("s1", "h1");
        task.next_run_at = now_ms() + 60_000;
        queue.enqueue(task).unwrap();
        assert_eq!(DurableQueue::pump_once(&queue), 0);
        assert_eq!(queue.stats().pending_approx, 1);
    }

    #[tokio::test]
    async fn test_export_and_retry_failed() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue_with(dir.path(), RecordingRunner::new(), |_| {});
        // Seed the failed archive directly.
        let mut task = update_task("s1", "h1");
        task.attempt = 5;
        task.last_error = Some("boom".into());
        let name = task.file_name(now_ms());
        DurableQueue::write_task(&dir.path().join("failed").join(&name), &task).unwrap();

        let export = queue.export_failed(None, None, 10).unwrap();
        assert_eq!(export.mode, "list");
        assert_eq!(export.tasks.len(), 1);
        assert!(export.tasks[0].messages_gzip.is_none());

        let by_file = queue.export_failed(Some(&name), None, 10).unwrap();
        assert_eq!(by_file.mode, "file");

        let by_key = queue
            .export_failed(None, Some("default::other"), 10)
            .unwrap();
        assert_eq!(by_key.mode, "empty");

        // Dry run lists without moving.
        let dry = queue.retry_failed_by_key("default::s1", 10, true).unwrap();
        assert_eq!(dry, vec![name.clone()]);
        assert_eq!(count_dir(&dir.path().join("failed")), 1);

        assert!(queue.retry_failed(&name).unwrap());
        assert_eq!(count_dir(&dir.path().join("failed")), 0);
        let pending = DurableQueue::read_task(&dir.path().join("pending").join(&name)).unwrap();
        assert!(pending.last_error.is_none());
        assert!(pending.next_run_at <= now_ms());
        assert_eq!(queue.stats().pending_approx, 1);
    }

    #[tokio::test]
    async fn test_retry_rejects_path_escape() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue_with(dir.path(), RecordingRunner::new(), |_| {});
        assert!(queue.retry_failed("../pending/evil.json").is_err());
        assert!(queue.retry_failed("no-extension").is_err());
    }

    #[tokio::test]
    async fn test_cleanup_done_respects_retention() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue_with(dir.path(), RecordingRunner::new(), |c| {
            c.keep_done = true;
            c.retention_days = 0; // everything currently on disk is expired
        });
        let task = update_task("s1", "h1");
        let name = task.file_name(now_ms());
        DurableQueue::write_task(&dir.path().join("done").join(&name), &task).unwrap();
        queue.cleanup_done();
        assert_eq!(count_dir(&dir.path().join("done")), 0);
    }

    #[test]
    fn test_backoff_monotone_and_capped() {
        let dir = tempfile::tempdir().unwrap();
        let queue = DurableQueue::new(
            QueueConfig {
                base_dir: dir.path().to_path_buf(),
                retry_base_ms: 100,
                retry_max_ms: 10_000,
                ..Default::default()
            },
            RecordingRunner::new(),
        )
        .unwrap();
        let b1 = queue.backoff_ms(1);
        let b4 = queue.backoff_ms(4);
        assert!(b1 >= 100 && b1 < 100 + 260);
        assert!(b4 >= 800);
        // Huge attempts stay capped (plus jitter headroom).
        assert!(queue.backoff_ms(40) <= 10_000 + 260);
    }
}
