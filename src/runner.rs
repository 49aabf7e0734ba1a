use crate::config::DashboardConfig;
use crate::harness::markers::{classify_line, sanitize_terminal_chunk};
use crate::harness::stream_decoder::StreamDecoder;
use crate::models::{LogLevel, OutputStream, RunStatus};
use crate::record::{LaunchSpec, SPAWN_FAILURE_EXIT_CODE, TIMED_OUT_EXIT_CODE};
use crate::state::RunState;
use std::collections::HashMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration, Instant};

const READ_CHUNK_BYTES: usize = 4096;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const STREAM_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const KILL_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub max_line_length: usize,
    pub max_stream_buffer_bytes: usize,
    pub strip_ansi: bool,
    pub max_run_duration: Option<Duration>,
    pub kill_on_cancel: bool,
    pub cancel_grace: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self::from(&DashboardConfig::default())
    }
}

impl From<&DashboardConfig> for RunnerOptions {
    fn from(config: &DashboardConfig) -> Self {
        Self {
            max_line_length: config.max_line_length,
            max_stream_buffer_bytes: config.max_stream_buffer_bytes,
            strip_ansi: config.strip_ansi,
            max_run_duration: config.max_run_duration_secs.map(Duration::from_secs),
            kill_on_cancel: config.kill_on_cancel,
            cancel_grace: Duration::from_millis(config.cancel_grace_ms),
        }
    }
}

struct ActiveChild {
    child: Arc<Mutex<Child>>,
}

/// Spawns the external tool for a run and drives its record to a terminal state.
#[derive(Clone)]
pub struct ProcessRunner {
    state: Arc<RunState>,
    options: RunnerOptions,
    active_children: Arc<Mutex<HashMap<String, ActiveChild>>>,
}

impl ProcessRunner {
    pub fn new(state: Arc<RunState>, options: RunnerOptions) -> Self {
        Self {
            state,
            options,
            active_children: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Runs `launch` to completion for the record `run_id`. Every failure ends up in
    /// the record; nothing is returned to the caller.
    pub async fn execute(&self, run_id: String, launch: LaunchSpec) {
        let Some((program, args)) = resolve_invocation(&launch) else {
            self.state
                .fail(&run_id, SPAWN_FAILURE_EXIT_CODE, "Command is empty");
            return;
        };

        if !self.state.is_running(&run_id) {
            tracing::info!(run_id = %run_id, "run ended before its process started; not spawning");
            return;
        }

        let mut command = Command::new(&program);
        command
            .args(&args)
            .envs(&launch.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = launch.cwd.as_deref().filter(|cwd| !cwd.trim().is_empty()) {
            command.current_dir(cwd);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(error) => {
                let message = describe_spawn_error(&error, &program, launch.cwd.as_deref());
                tracing::warn!(run_id = %run_id, program = %program, error = %error, "failed to spawn process");
                self.state.fail(&run_id, SPAWN_FAILURE_EXIT_CODE, &message);
                return;
            }
        };
        let started = Instant::now();
        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Registered before the pid is announced so a cancel can always find it.
        let child = Arc::new(Mutex::new(child));
        self.active_children.lock().await.insert(
            run_id.clone(),
            ActiveChild {
                child: child.clone(),
            },
        );

        if let Some(pid) = pid {
            tracing::info!(run_id = %run_id, pid, program = %program, "process spawned");
            self.state.attach_pid(&run_id, pid);
        }

        let stdout_task =
            stdout.map(|stream| self.spawn_pump(run_id.clone(), OutputStream::Stdout, stream));
        let stderr_task =
            stderr.map(|stream| self.spawn_pump(run_id.clone(), OutputStream::Stderr, stream));

        let deadline = self.options.max_run_duration.map(|limit| started + limit);
        let mut stop_sent = false;
        let exit_code = loop {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    let limit = self.options.max_run_duration.unwrap_or_default();
                    let message = format!("Run exceeded maximum duration of {}s", limit.as_secs());
                    self.state.fail(&run_id, TIMED_OUT_EXIT_CODE, &message);
                    let mut guard = child.lock().await;
                    terminate_then_kill(&mut guard, self.options.cancel_grace).await;
                    break None;
                }
            }

            if !stop_sent && self.should_stop(&run_id) {
                stop_sent = true;
                tracing::info!(run_id = %run_id, "run no longer active; stopping its process");
                let mut guard = child.lock().await;
                terminate_then_kill(&mut guard, self.options.cancel_grace).await;
            }

            let status = {
                let mut guard = child.lock().await;
                guard.try_wait()
            };
            match status {
                Ok(Some(status)) => break Some(exit_code_of(status)),
                Ok(None) => {}
                Err(error) => {
                    let message = format!("Failed to poll process status: {}", error);
                    self.state.fail(&run_id, SPAWN_FAILURE_EXIT_CODE, &message);
                    break None;
                }
            }

            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        };

        // Output must be fully recorded before the completion event goes out.
        for task in [stdout_task, stderr_task].into_iter().flatten() {
            let abort = task.abort_handle();
            if timeout(STREAM_DRAIN_TIMEOUT, task).await.is_err() {
                tracing::warn!(run_id = %run_id, "output stream still open after exit; detaching");
                abort.abort();
            }
        }
        self.active_children.lock().await.remove(&run_id);

        if let Some(code) = exit_code {
            self.state.complete(&run_id, code);
        }
    }

    /// Best-effort stop of a run's process: SIGTERM, then a forced kill once the
    /// grace period runs out. Returns `false` when no process is attached.
    pub async fn terminate(&self, run_id: &str) -> bool {
        let child = self
            .active_children
            .lock()
            .await
            .get(run_id)
            .map(|active| active.child.clone());
        let Some(child) = child else {
            return false;
        };
        let mut guard = child.lock().await;
        terminate_then_kill(&mut guard, self.options.cancel_grace).await;
        true
    }

    /// A cancelled run is stopped when `kill_on_cancel` is set. A run that has
    /// left history is always stopped, since nothing could reach it afterwards.
    fn should_stop(&self, run_id: &str) -> bool {
        match self.state.status_of(run_id) {
            None => true,
            Some(RunStatus::Cancelled) => self.options.kill_on_cancel,
            Some(_) => false,
        }
    }

    pub async fn active_count(&self) -> usize {
        self.active_children.lock().await.len()
    }

    fn spawn_pump<R>(&self, run_id: String, stream: OutputStream, reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let state = self.state.clone();
        let options = self.options.clone();
        tokio::spawn(async move { pump_stream(state, options, run_id, stream, reader).await })
    }
}

async fn pump_stream<R>(
    state: Arc<RunState>,
    options: RunnerOptions,
    run_id: String,
    stream: OutputStream,
    mut reader: R,
) where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0_u8; READ_CHUNK_BYTES];
    let mut decoder = StreamDecoder::new(options.max_stream_buffer_bytes);
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(size) => {
                let lines = decoder.push(&chunk[..size]);
                let trimmed = decoder.take_trimmed_bytes();
                if trimmed > 0 {
                    state.append_log(
                        &run_id,
                        LogLevel::Warning,
                        format!(
                            "Dropped {} bytes of an unterminated {} line",
                            trimmed,
                            stream.as_str()
                        ),
                    );
                }
                for line in lines {
                    record_line(&state, &options, &run_id, stream, line);
                }
            }
            Err(error) => {
                state.append_log(
                    &run_id,
                    LogLevel::Warning,
                    format!("Failed reading {}: {}", stream.as_str(), error),
                );
                break;
            }
        }
    }
    if let Some(rest) = decoder.finish() {
        record_line(&state, &options, &run_id, stream, rest);
    }
}

fn record_line(
    state: &RunState,
    options: &RunnerOptions,
    run_id: &str,
    stream: OutputStream,
    line: String,
) {
    let mut text = if options.strip_ansi {
        sanitize_terminal_chunk(&line)
    } else {
        line
    };
    truncate_at_char_boundary(&mut text, options.max_line_length);
    let annotation = classify_line(&text);
    state.append_output(run_id, stream, text, annotation);
}

fn truncate_at_char_boundary(text: &mut String, max_len: usize) {
    if text.len() <= max_len {
        return;
    }
    let mut cut = max_len;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

/// `npx playwright` + `["test"]` runs `npx` with `["playwright", "test"]`.
fn resolve_invocation(launch: &LaunchSpec) -> Option<(String, Vec<String>)> {
    let mut tokens = launch.command.split_whitespace().map(str::to_string);
    let program = tokens.next()?;
    let args = tokens.chain(launch.args.iter().cloned()).collect();
    Some((program, args))
}

fn describe_spawn_error(error: &std::io::Error, program: &str, cwd: Option<&str>) -> String {
    if let Some(cwd) = cwd.filter(|cwd| !cwd.trim().is_empty()) {
        if !Path::new(cwd).is_dir() {
            return format!("Working directory not found: {}", cwd);
        }
    }
    match error.kind() {
        std::io::ErrorKind::NotFound => format!("Command not found: {}", program),
        std::io::ErrorKind::PermissionDenied => format!("Permission denied starting {}", program),
        _ => format!("Failed to start {}: {}", program, error),
    }
}

fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    SPAWN_FAILURE_EXIT_CODE
}

async fn terminate_then_kill(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }

    #[cfg(windows)]
    {
        if let Some(pid) = child.id() {
            let _ = Command::new("taskkill")
                .args(["/PID", &pid.to_string(), "/T", "/F"])
                .spawn();
        }
    }

    if timeout(grace, child.wait()).await.is_ok() {
        return;
    }

    tracing::warn!(pid = ?child.id(), grace_ms = grace.as_millis() as u64, "process ignored termination; killing");
    let _ = child.start_kill();
    let _ = timeout(KILL_WAIT, child.wait()).await;
}
