use crate::broadcaster::{EventSink, OutputBroadcaster, SubscriberId};
use crate::config::BufferLimits;
use crate::errors::{AppError, AppResult};
use crate::models::{
    DashboardEvent, LogEvent, LogLevel, OutputEvent, OutputStream, RunDetail, RunStatus,
    SearchFilters,
};
use crate::record::{LaunchSpec, RunRecord, CANCELLED_EXIT_CODE};
use crate::registry::RunRegistry;
use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard, PoisonError};

struct Inner {
    registry: RunRegistry,
    broadcaster: OutputBroadcaster,
}

impl Inner {
    /// Ends running records that are about to leave history, so subscribers see a
    /// terminal event for them. The runner stops their processes once the record
    /// is gone.
    fn retire_running(&mut self, run_ids: Vec<String>) {
        let now = Utc::now();
        for run_id in run_ids {
            let Some(record) = self.registry.get_mut(&run_id) else {
                continue;
            };
            if record.finish(RunStatus::Cancelled, CANCELLED_EXIT_CODE, None).is_none() {
                continue;
            }
            let exit_code = record.exit_code();
            let duration_ms = record.duration_ms(now);
            tracing::info!(run_id = %run_id, "running run removed from history");
            self.broadcaster.publish(DashboardEvent::RunCancelled {
                run_id,
                exit_code,
                duration_ms,
            });
        }
    }

    fn publish_log(&mut self, run_id: &str, entry: Option<LogEvent>) {
        if let Some(entry) = entry {
            self.broadcaster.publish(DashboardEvent::LogAppended {
                run_id: run_id.to_string(),
                entry,
            });
        }
    }
}

/// Registry and broadcaster behind a single lock.
///
/// Each operation mutates the registry and publishes the matching event before the
/// lock is released, so events for one run go out in the order they happened and a
/// new subscriber's snapshot can never race a `run_started`.
pub struct RunState {
    inner: Mutex<Inner>,
}

impl RunState {
    pub fn new(history_limit: usize, limits: BufferLimits) -> Self {
        Self {
            inner: Mutex::new(Inner {
                registry: RunRegistry::new(history_limit, limits),
                broadcaster: OutputBroadcaster::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create(&self, launch: LaunchSpec) -> RunDetail {
        let mut inner = self.lock();
        let evicted: Vec<String> = inner
            .registry
            .pending_evictions()
            .filter(|record| record.is_running())
            .map(|record| record.id().to_string())
            .collect();
        inner.retire_running(evicted);
        let detail = inner.registry.create(launch).to_detail(Utc::now());
        tracing::info!(
            run_id = %detail.id,
            subject = %detail.subject_name,
            command = %detail.command,
            "run created"
        );
        inner.broadcaster.publish(DashboardEvent::RunStarted {
            run_id: detail.id.clone(),
            run: detail.clone(),
        });
        detail
    }

    pub fn attach_pid(&self, run_id: &str, pid: u32) -> bool {
        let mut inner = self.lock();
        let Some(record) = inner.registry.get_mut(run_id) else {
            return false;
        };
        if !record.attach_pid(pid) {
            return false;
        }
        let entry = record.append_log(LogLevel::Info, format!("Process started (pid {})", pid));
        inner.publish_log(run_id, entry);
        true
    }

    /// Appends one output line and, if the caller classified it, the derived log
    /// entry right after it.
    pub fn append_output(
        &self,
        run_id: &str,
        stream: OutputStream,
        data: String,
        annotation: Option<(LogLevel, String)>,
    ) -> bool {
        let mut inner = self.lock();
        let Some(record) = inner.registry.get_mut(run_id) else {
            return false;
        };
        let event = OutputEvent {
            data,
            timestamp: Utc::now(),
        };
        if !record.append_output(stream, event.clone()) {
            return false;
        }
        let entry = annotation.and_then(|(level, message)| record.append_log(level, message));
        inner.broadcaster.publish(DashboardEvent::OutputAppended {
            run_id: run_id.to_string(),
            stream,
            event,
        });
        inner.publish_log(run_id, entry);
        true
    }

    pub fn append_log(&self, run_id: &str, level: LogLevel, message: String) -> bool {
        let mut inner = self.lock();
        let Some(record) = inner.registry.get_mut(run_id) else {
            return false;
        };
        let entry = record.append_log(level, message);
        let appended = entry.is_some();
        inner.publish_log(run_id, entry);
        appended
    }

    /// Resolves a running record from its process exit code.
    pub fn complete(&self, run_id: &str, exit_code: i32) -> bool {
        let status = if exit_code == 0 {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        let mut inner = self.lock();
        let Some(record) = inner.registry.get_mut(run_id) else {
            return false;
        };
        let elapsed = format_elapsed(record.duration_ms(Utc::now()));
        let level = if exit_code == 0 { LogLevel::Success } else { LogLevel::Error };
        let closing = (level, format!("Process exited with code {} after {}", exit_code, elapsed));
        let Some(entry) = record.finish(status, exit_code, Some(closing)) else {
            return false;
        };
        let duration_ms = record.duration_ms(Utc::now());
        tracing::info!(run_id = %run_id, exit_code, status = status.as_str(), duration_ms, "run finished");
        inner.publish_log(run_id, entry);
        inner.broadcaster.publish(DashboardEvent::RunCompleted {
            run_id: run_id.to_string(),
            status,
            exit_code: Some(exit_code),
            duration_ms,
            error: None,
        });
        true
    }

    /// Fails a running record for a reason other than its own exit (spawn failure,
    /// timeout). The message lands in the logs and on the completion event.
    pub fn fail(&self, run_id: &str, exit_code: i32, message: &str) -> bool {
        let mut inner = self.lock();
        let Some(record) = inner.registry.get_mut(run_id) else {
            return false;
        };
        let closing = (LogLevel::Error, message.to_string());
        let Some(entry) = record.finish(RunStatus::Failed, exit_code, Some(closing)) else {
            return false;
        };
        let duration_ms = record.duration_ms(Utc::now());
        tracing::warn!(run_id = %run_id, exit_code, error = %message, "run failed");
        inner.publish_log(run_id, entry);
        inner.broadcaster.publish(DashboardEvent::RunCompleted {
            run_id: run_id.to_string(),
            status: RunStatus::Failed,
            exit_code: Some(exit_code),
            duration_ms,
            error: Some(message.to_string()),
        });
        true
    }

    pub fn cancel(&self, run_id: &str) -> AppResult<RunDetail> {
        let mut inner = self.lock();
        let Some(record) = inner.registry.get_mut(run_id) else {
            return Err(AppError::NotFound(format!("Run {} not found", run_id)));
        };
        let closing = (LogLevel::Warning, "Run cancelled".to_string());
        let Some(entry) = record.finish(RunStatus::Cancelled, CANCELLED_EXIT_CODE, Some(closing)) else {
            return Err(AppError::NotRunning(format!(
                "Run {} is {}",
                run_id,
                record.status().as_str()
            )));
        };
        let now = Utc::now();
        let detail = record.to_detail(now);
        tracing::info!(run_id = %run_id, pid = ?detail.pid, "run cancelled");
        inner.publish_log(run_id, entry);
        inner.broadcaster.publish(DashboardEvent::RunCancelled {
            run_id: run_id.to_string(),
            exit_code: detail.exit_code,
            duration_ms: detail.duration_ms,
        });
        Ok(detail)
    }

    pub fn subscribe(&self, sink: Box<dyn EventSink>) -> SubscriberId {
        let mut inner = self.lock();
        let now = Utc::now();
        let active = inner
            .registry
            .list_active()
            .map(|record| record.to_detail(now))
            .collect();
        inner.broadcaster.subscribe(sink, active)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.lock().broadcaster.unsubscribe(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().broadcaster.subscriber_count()
    }

    pub fn get(&self, run_id: &str) -> AppResult<RunDetail> {
        self.with_record(run_id, |record| record.to_detail(Utc::now()))
    }

    pub fn launch_of(&self, run_id: &str) -> AppResult<LaunchSpec> {
        self.with_record(run_id, |record| record.launch().clone())
    }

    /// `None` once the record has left history.
    pub fn status_of(&self, run_id: &str) -> Option<RunStatus> {
        self.with_record(run_id, RunRecord::status).ok()
    }

    pub fn is_running(&self, run_id: &str) -> bool {
        self.with_record(run_id, RunRecord::is_running).unwrap_or(false)
    }

    pub fn list_all(&self) -> Vec<RunDetail> {
        let inner = self.lock();
        let now = Utc::now();
        inner.registry.list_all().map(|record| record.to_detail(now)).collect()
    }

    pub fn list_active(&self) -> Vec<RunDetail> {
        let inner = self.lock();
        let now = Utc::now();
        inner
            .registry
            .list_active()
            .map(|record| record.to_detail(now))
            .collect()
    }

    pub fn search(&self, filters: &SearchFilters) -> Vec<RunDetail> {
        let inner = self.lock();
        let now = Utc::now();
        inner
            .registry
            .search(filters)
            .into_iter()
            .map(|record| record.to_detail(now))
            .collect()
    }

    pub fn clear(&self, older_than: Option<DateTime<Utc>>) -> usize {
        let mut inner = self.lock();
        let running: Vec<String> = inner
            .registry
            .list_active()
            .filter(|record| older_than.map_or(true, |cutoff| record.started_at() < cutoff))
            .map(|record| record.id().to_string())
            .collect();
        inner.retire_running(running);
        let removed = match older_than {
            Some(cutoff) => inner.registry.clear_older_than(cutoff),
            None => inner.registry.clear(),
        };
        tracing::info!(removed, older_than = ?older_than, "cleared run history");
        removed
    }

    fn with_record<T>(&self, run_id: &str, f: impl FnOnce(&RunRecord) -> T) -> AppResult<T> {
        let inner = self.lock();
        inner
            .registry
            .get(run_id)
            .map(f)
            .ok_or_else(|| AppError::NotFound(format!("Run {} not found", run_id)))
    }
}

fn format_elapsed(duration_ms: i64) -> String {
    if duration_ms < 1_000 {
        format!("{}ms", duration_ms)
    } else {
        format!("{:.2}s", duration_ms as f64 / 1_000.0)
    }
}
