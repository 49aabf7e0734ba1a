use crate::config::BufferLimits;
use crate::models::{LogEvent, LogLevel, OutputEvent, OutputStream, RunDetail, RunStatus};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, VecDeque};

/// Exit code recorded when the process could not be started at all.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = -1;
/// Exit code recorded for a run the user cancelled.
pub const CANCELLED_EXIT_CODE: i32 = 130;
/// Exit code recorded for a run that outlived the configured maximum duration.
pub const TIMED_OUT_EXIT_CODE: i32 = 124;

/// Inputs needed to (re)launch a run. The environment is kept for reruns but never
/// serialized to clients.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    pub subject_name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub context: Option<String>,
    pub cwd: Option<String>,
}

#[derive(Debug, Default)]
struct OutputBuffer {
    events: VecDeque<OutputEvent>,
    total_bytes: usize,
    total_bytes_seen: u64,
}

impl OutputBuffer {
    /// Returns how many old events were dropped to stay within `limits`.
    fn push(&mut self, event: OutputEvent, limits: &BufferLimits) -> u64 {
        let len = event.data.len();
        self.events.push_back(event);
        self.total_bytes = self.total_bytes.saturating_add(len);
        self.total_bytes_seen = self.total_bytes_seen.saturating_add(len as u64);

        let mut dropped = 0;
        while self.events.len() > limits.max_output_events
            || (self.total_bytes > limits.max_output_bytes && self.events.len() > 1)
        {
            match self.events.pop_front() {
                Some(removed) => {
                    self.total_bytes = self.total_bytes.saturating_sub(removed.data.len());
                    dropped += 1;
                }
                None => break,
            }
        }
        dropped
    }
}

/// One external-command invocation and everything it has produced so far.
///
/// Every mutator returns `false` once the record is terminal; nothing about a
/// finished run changes afterwards.
#[derive(Debug)]
pub struct RunRecord {
    id: String,
    seq: u64,
    launch: LaunchSpec,
    status: RunStatus,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    pid: Option<u32>,
    stdout: OutputBuffer,
    stderr: OutputBuffer,
    logs: VecDeque<LogEvent>,
    dropped_output_events: u64,
    limits: BufferLimits,
}

impl RunRecord {
    pub(crate) fn new(id: String, seq: u64, launch: LaunchSpec, limits: BufferLimits) -> Self {
        Self {
            id,
            seq,
            launch,
            status: RunStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            exit_code: None,
            pid: None,
            stdout: OutputBuffer::default(),
            stderr: OutputBuffer::default(),
            logs: VecDeque::new(),
            dropped_output_events: 0,
            limits,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Creation order within the registry; breaks `started_at` ties.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn launch(&self) -> &LaunchSpec {
        &self.launch
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn output(&self, stream: OutputStream) -> impl Iterator<Item = &OutputEvent> {
        match stream {
            OutputStream::Stdout => self.stdout.events.iter(),
            OutputStream::Stderr => self.stderr.events.iter(),
        }
    }

    pub fn logs(&self) -> impl Iterator<Item = &LogEvent> {
        self.logs.iter()
    }

    pub fn duration_ms(&self, now: DateTime<Utc>) -> i64 {
        let end = self.ended_at.unwrap_or(now);
        (end - self.started_at).num_milliseconds().max(0)
    }

    /// Case-insensitive substring match against command, subject and log messages.
    /// `needle` must already be lowercased.
    pub(crate) fn matches_text(&self, needle: &str) -> bool {
        if needle.is_empty() {
            return true;
        }
        self.launch.command.to_lowercase().contains(needle)
            || self.launch.subject_name.to_lowercase().contains(needle)
            || self
                .logs
                .iter()
                .any(|entry| entry.message.to_lowercase().contains(needle))
    }

    pub(crate) fn attach_pid(&mut self, pid: u32) -> bool {
        if !self.is_running() {
            return false;
        }
        self.pid = Some(pid);
        true
    }

    pub(crate) fn append_output(&mut self, stream: OutputStream, event: OutputEvent) -> bool {
        if !self.is_running() {
            return false;
        }
        let buffer = match stream {
            OutputStream::Stdout => &mut self.stdout,
            OutputStream::Stderr => &mut self.stderr,
        };
        let dropped = buffer.push(event, &self.limits);
        self.dropped_output_events = self.dropped_output_events.saturating_add(dropped);
        true
    }

    pub(crate) fn append_log(&mut self, level: LogLevel, message: String) -> Option<LogEvent> {
        if !self.is_running() {
            return None;
        }
        Some(self.push_log(level, message))
    }

    /// Moves a running record to `status`. The closing log entry is written as part
    /// of the transition so it lands before the record freezes.
    pub(crate) fn finish(
        &mut self,
        status: RunStatus,
        exit_code: i32,
        closing: Option<(LogLevel, String)>,
    ) -> Option<Option<LogEvent>> {
        if !self.is_running() || !status.is_terminal() {
            return None;
        }
        let entry = closing.map(|(level, message)| self.push_log(level, message));
        self.status = status;
        self.exit_code = Some(exit_code);
        self.ended_at = Some(Utc::now());
        Some(entry)
    }

    fn push_log(&mut self, level: LogLevel, message: String) -> LogEvent {
        let entry = LogEvent {
            level,
            message,
            timestamp: Utc::now(),
        };
        self.logs.push_back(entry.clone());
        while self.logs.len() > self.limits.max_log_events.max(1) {
            self.logs.pop_front();
        }
        entry
    }

    pub fn to_detail(&self, now: DateTime<Utc>) -> RunDetail {
        RunDetail {
            id: self.id.clone(),
            subject_name: self.launch.subject_name.clone(),
            command: self.launch.command.clone(),
            args: self.launch.args.clone(),
            context: self.launch.context.clone(),
            cwd: self.launch.cwd.clone(),
            status: self.status,
            started_at: self.started_at,
            ended_at: self.ended_at,
            exit_code: self.exit_code,
            duration_ms: self.duration_ms(now),
            pid: self.pid,
            stdout: self.stdout.events.iter().cloned().collect(),
            stderr: self.stderr.events.iter().cloned().collect(),
            logs: self.logs.iter().cloned().collect(),
            stdout_bytes: self.stdout.total_bytes_seen,
            stderr_bytes: self.stderr.total_bytes_seen,
            dropped_output_events: self.dropped_output_events,
        }
    }
}
