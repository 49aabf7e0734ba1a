use crate::broadcaster::SubscriberId;
use crate::config::DashboardConfig;
use crate::errors::AppResult;
use crate::models::{RunDetail, SearchFilters, StartRunPayload, StreamEnvelope};
use crate::record::LaunchSpec;
use crate::runner::{ProcessRunner, RunnerOptions};
use crate::state::RunState;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A live event feed for one client. Dropping `events` is enough to be unregistered
/// on the next publish; [`RunController::unsubscribe`] does it immediately.
pub struct Subscription {
    pub id: SubscriberId,
    pub events: mpsc::Receiver<StreamEnvelope>,
}

/// Public surface over the registry, broadcaster and process runner.
#[derive(Clone)]
pub struct RunController {
    state: Arc<RunState>,
    runner: ProcessRunner,
    kill_on_cancel: bool,
    subscriber_buffer: usize,
}

impl RunController {
    pub fn new(config: &DashboardConfig) -> Self {
        let state = Arc::new(RunState::new(config.history_limit, config.buffer_limits()));
        let runner = ProcessRunner::new(state.clone(), RunnerOptions::from(config));
        Self {
            state,
            runner,
            kill_on_cancel: config.kill_on_cancel,
            subscriber_buffer: config.subscriber_buffer.max(1),
        }
    }

    /// Creates the record and announces it before returning; the process itself is
    /// spawned on a background task. Must be called from within a tokio runtime.
    pub fn start_run(&self, payload: StartRunPayload) -> RunDetail {
        let launch = LaunchSpec {
            subject_name: payload.subject_name,
            command: payload.command,
            args: payload.args,
            env: payload.env,
            context: payload.context,
            cwd: payload.cwd,
        };
        self.launch(launch)
    }

    /// Starts a fresh run with the same inputs as `run_id`.
    pub fn rerun(&self, run_id: &str) -> AppResult<RunDetail> {
        let launch = self.state.launch_of(run_id)?;
        let detail = self.launch(launch);
        tracing::info!(source_run_id = %run_id, run_id = %detail.id, "rerun started");
        Ok(detail)
    }

    fn launch(&self, launch: LaunchSpec) -> RunDetail {
        let detail = self.state.create(launch.clone());
        let runner = self.runner.clone();
        let run_id = detail.id.clone();
        tokio::spawn(async move {
            runner.execute(run_id, launch).await;
        });
        detail
    }

    /// Marks the run cancelled right away. Stopping the process is best effort and
    /// happens in the background.
    pub fn cancel(&self, run_id: &str) -> AppResult<RunDetail> {
        let detail = self.state.cancel(run_id)?;
        if self.kill_on_cancel {
            let runner = self.runner.clone();
            let run_id = run_id.to_string();
            tokio::spawn(async move {
                if !runner.terminate(&run_id).await {
                    tracing::debug!(run_id = %run_id, "no live process to terminate");
                }
            });
        }
        Ok(detail)
    }

    pub fn query(&self, run_id: &str) -> AppResult<RunDetail> {
        self.state.get(run_id)
    }

    pub fn list_all(&self) -> Vec<RunDetail> {
        self.state.list_all()
    }

    pub fn list_active(&self) -> Vec<RunDetail> {
        self.state.list_active()
    }

    pub fn search(&self, filters: &SearchFilters) -> Vec<RunDetail> {
        self.state.search(filters)
    }

    /// Removes every run, or only those started before `older_than`.
    pub fn clear(&self, older_than: Option<DateTime<Utc>>) -> usize {
        self.state.clear(older_than)
    }

    pub fn subscribe(&self) -> Subscription {
        let (sender, events) = mpsc::channel(self.subscriber_buffer);
        let id = self.state.subscribe(Box::new(sender));
        Subscription { id, events }
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.state.unsubscribe(id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.subscriber_count()
    }
}
