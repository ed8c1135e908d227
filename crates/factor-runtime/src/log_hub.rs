//! Per-task log buffering with size- and time-triggered flushing.
//!
//! Entries queue in memory per task; a dedicated flusher drains every queue
//! on an interval, a queue that reaches the size threshold drains at once,
//! and an urgent severity (warning and above) drains every queue
//! immediately. Flushing assigns storage ids and mirrors the newest entry
//! onto the task record.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use factor_core::{now_iso, FactorError, LogEntry, LogLevel};
use factor_data::{LogRepository, TaskRepository};
use mongodb::bson::doc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const MAX_BUFFER_PER_TASK: usize = 50;
const SHUTDOWN_WAIT: Duration = Duration::from_secs(10);

/// A log entry waiting in a task's buffer.
#[derive(Debug, Clone)]
pub struct PendingLog {
    pub task_id: String,
    pub factor_id: String,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: String,
    pub stage: String,
}

/// Persistence seam of the hub; the Mongo sink is the production
/// implementation.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Append `entries` in order and mirror the newest one onto the task.
    async fn persist(&self, task_id: &str, entries: Vec<LogEntry>) -> Result<(), FactorError>;
}

/// Writes flushed entries to the log collection and updates the task's
/// `last_log_*` mirror fields.
pub struct MongoLogSink {
    logs: LogRepository,
    tasks: TaskRepository,
}

impl MongoLogSink {
    pub fn new(logs: LogRepository, tasks: TaskRepository) -> Self {
        MongoLogSink { logs, tasks }
    }
}

#[async_trait]
impl LogSink for MongoLogSink {
    async fn persist(&self, task_id: &str, entries: Vec<LogEntry>) -> Result<(), FactorError> {
        let Some(newest) = entries.last().cloned() else {
            return Ok(());
        };
        self.logs.append(&entries).await?;
        self.tasks
            .set_fields(
                task_id,
                doc! {
                    "current_stage": newest.stage,
                    "last_log_message": newest.message,
                    "last_log_time": newest.timestamp,
                    "last_log_level": newest.level.as_str(),
                    "updated_at": now_iso(),
                },
            )
            .await?;
        Ok(())
    }
}

/// Process-wide log buffer, owned by the application context.
pub struct LogHub {
    buffers: DashMap<String, Vec<PendingLog>>,
    sink: Arc<dyn LogSink>,
    stopped: AtomicBool,
    stop_signal: Notify,
    flusher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl LogHub {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        LogHub {
            buffers: DashMap::new(),
            sink,
            stopped: AtomicBool::new(false),
            stop_signal: Notify::new(),
            flusher: std::sync::Mutex::new(None),
        }
    }

    /// Start the background flusher.
    pub fn start(self: &Arc<Self>) {
        let hub = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = hub.stop_signal.notified() => break,
                    _ = tokio::time::sleep(FLUSH_INTERVAL) => hub.flush_all().await,
                }
            }
        });
        *self.flusher.lock().expect("flusher mutex poisoned") = Some(handle);
    }

    /// Queue one entry. A full queue flushes that task; an urgent severity
    /// flushes every task. Ignored after shutdown.
    pub async fn add_log(&self, entry: PendingLog) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let task_id = entry.task_id.clone();
        let urgent = entry.level.is_urgent();
        let full = {
            let mut buffer = self.buffers.entry(task_id.clone()).or_default();
            buffer.push(entry);
            buffer.len() >= MAX_BUFFER_PER_TASK
        };

        if urgent {
            self.flush_all().await;
        } else if full {
            self.flush_task(&task_id).await;
        }
    }

    /// Convenience wrapper that also explodes a `details` map into
    /// follow-up debug entries sharing the stage.
    pub async fn log(
        &self,
        task_id: &str,
        factor_id: &str,
        level: LogLevel,
        stage: &str,
        message: impl Into<String>,
        details: Option<HashMap<String, String>>,
    ) {
        self.add_log(PendingLog {
            task_id: task_id.to_string(),
            factor_id: factor_id.to_string(),
            level,
            message: message.into(),
            timestamp: now_iso(),
            stage: stage.to_string(),
        })
        .await;

        if let Some(details) = details {
            for (key, value) in details {
                self.add_log(PendingLog {
                    task_id: task_id.to_string(),
                    factor_id: factor_id.to_string(),
                    level: LogLevel::Debug,
                    message: format!("{key}: {value}"),
                    timestamp: now_iso(),
                    stage: stage.to_string(),
                })
                .await;
            }
        }
    }

    async fn flush_task(&self, task_id: &str) {
        let pending = match self.buffers.get_mut(task_id) {
            Some(mut buffer) => std::mem::take(buffer.value_mut()),
            None => return,
        };
        if pending.is_empty() {
            return;
        }

        let entries: Vec<LogEntry> = pending
            .into_iter()
            .map(|p| LogEntry {
                id: None,
                log_id: uuid::Uuid::new_v4().to_string(),
                task_id: p.task_id,
                factor_id: p.factor_id,
                level: p.level,
                message: p.message,
                timestamp: p.timestamp,
                stage: p.stage,
                details: None,
                created_at: Some(now_iso()),
                updated_at: Some(now_iso()),
            })
            .collect();

        // A failed write must not take the evaluation down with it.
        if let Err(err) = self.sink.persist(task_id, entries).await {
            tracing::error!(task_id, error = %err, "failed to persist task logs");
        }
    }

    /// Flush every task's queue. Per-task enqueue order is preserved; no
    /// cross-task order is promised.
    pub async fn flush_all(&self) {
        let task_ids: Vec<String> = self.buffers.iter().map(|e| e.key().clone()).collect();
        for task_id in task_ids {
            self.flush_task(&task_id).await;
        }
    }

    /// Stop the flusher (waiting up to 10 s), then final-flush. Later
    /// `add_log` calls are ignored.
    pub async fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_signal.notify_waiters();
        let handle = self.flusher.lock().expect("flusher mutex poisoned").take();
        if let Some(handle) = handle {
            if tokio::time::timeout(SHUTDOWN_WAIT, handle).await.is_err() {
                tracing::warn!("log flusher did not stop within the shutdown window");
            }
        }
        self.flush_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MemorySink {
        entries: std::sync::Mutex<Vec<LogEntry>>,
        task_mirrors: std::sync::Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl LogSink for MemorySink {
        async fn persist(&self, task_id: &str, entries: Vec<LogEntry>) -> Result<(), FactorError> {
            if let Some(newest) = entries.last() {
                self.task_mirrors
                    .lock()
                    .unwrap()
                    .push((task_id.to_string(), newest.message.clone()));
            }
            self.entries.lock().unwrap().extend(entries);
            Ok(())
        }
    }

    fn hub() -> (Arc<LogHub>, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        (Arc::new(LogHub::new(sink.clone())), sink)
    }

    fn entry(task: &str, n: usize) -> PendingLog {
        PendingLog {
            task_id: task.to_string(),
            factor_id: "f1".to_string(),
            level: LogLevel::Info,
            message: format!("message {n}"),
            timestamp: now_iso(),
            stage: "statistics".to_string(),
        }
    }

    #[tokio::test]
    async fn below_threshold_nothing_persists() {
        let (hub, sink) = hub();
        for n in 0..49 {
            hub.add_log(entry("t1", n)).await;
        }
        assert!(sink.entries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fiftieth_entry_flushes_in_enqueue_order() {
        let (hub, sink) = hub();
        for n in 0..50 {
            hub.add_log(entry("t1", n)).await;
        }
        let entries = sink.entries.lock().unwrap();
        assert_eq!(entries.len(), 50);
        for (n, e) in entries.iter().enumerate() {
            assert_eq!(e.message, format!("message {n}"));
        }
        // The task mirror carries the newest message.
        let mirrors = sink.task_mirrors.lock().unwrap();
        assert_eq!(mirrors.last().unwrap().1, "message 49");
    }

    #[tokio::test]
    async fn urgent_levels_flush_every_task() {
        let (hub, sink) = hub();
        hub.add_log(entry("t1", 0)).await;
        hub.add_log(entry("t2", 1)).await;
        let mut warning = entry("t1", 2);
        warning.level = LogLevel::Warning;
        hub.add_log(warning).await;
        assert_eq!(sink.entries.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_flushes_without_reaching_threshold() {
        let (hub, sink) = hub();
        hub.start();
        hub.add_log(entry("t1", 0)).await;
        tokio::time::sleep(Duration::from_secs(6)).await;
        // Yield so the flusher task gets to run after its sleep elapses.
        tokio::task::yield_now().await;
        assert_eq!(sink.entries.lock().unwrap().len(), 1);
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_final_flushes_and_ignores_later_logs() {
        let (hub, sink) = hub();
        hub.start();
        hub.add_log(entry("t1", 0)).await;
        hub.shutdown().await;
        assert_eq!(sink.entries.lock().unwrap().len(), 1);

        hub.add_log(entry("t1", 1)).await;
        hub.flush_all().await;
        assert_eq!(sink.entries.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn details_explode_into_debug_entries() {
        let (hub, sink) = hub();
        let details: HashMap<String, String> =
            [("rows".to_string(), "120".to_string())].into_iter().collect();
        hub.log("t1", "f1", LogLevel::Info, "grouping", "grouped", Some(details))
            .await;
        hub.flush_all().await;
        let entries = sink.entries.lock().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].level, LogLevel::Debug);
        assert_eq!(entries[1].message, "rows: 120");
        assert_eq!(entries[1].stage, "grouping");
    }

    #[tokio::test]
    async fn flush_assigns_fresh_ids() {
        let (hub, sink) = hub();
        hub.add_log(entry("t1", 0)).await;
        hub.add_log(entry("t1", 1)).await;
        hub.flush_all().await;
        let entries = sink.entries.lock().unwrap();
        assert_ne!(entries[0].log_id, entries[1].log_id);
        assert!(entries[0].created_at.is_some());
    }
}
