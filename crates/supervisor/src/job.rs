//! One supervised av1an encode.
//!
//! A [`Job`] owns the options it was created with, the status history and at
//! most one live av1an process. Control calls (`start`, `pause`, `resume`,
//! `cancel`) may come from any task; the process exit, the side-file watch and
//! the control calls all serialize through one lock around the job state, so
//! the history never sees two transitions racing.

use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::args::{self, BuiltArgs};
use crate::config::SupervisorConfig;
use crate::env_path::{self, DependencyPaths};
use crate::error::SupervisorError;
use crate::estimate::{self, EstimateInput};
use crate::monitor::{MonitorUpdate, ProgressMonitor, SidePaths};
use crate::options::EncodeOptions;
use crate::process_tree::{self, TreeSignal};
use crate::progress::DoneFile;
use crate::status::{
    ChunkDelta, FailureKind, JobFailure, ProgressSnapshot, StateTag, StatusEvent, StatusHistory,
};
use crate::watch::{self as fswatch, FsEvent, WatchHandle};

/// Lines of stderr kept for error reports
const STDERR_TAIL: usize = 20;
/// How long output readers get to finish after the process exited
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Something a subscriber of a job is told about
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// A new entry in the status history
    Status(StatusEvent),
    /// The av1an log file changed; carries its full contents
    Log(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessSlot {
    Absent,
    /// A start is in progress but no process is live right now
    Starting,
    /// `suspended` holds the state to return to on resume
    Running {
        pid: u32,
        suspended: Option<StateTag>,
    },
}

struct JobState {
    history: StatusHistory,
    process: ProcessSlot,
    /// Set by `cancel`, cleared when a new start claims the slot
    cancel_requested: bool,
    monitor: Option<ProgressMonitor>,
    /// Chunks completed while not encoding, reported with the next progress
    held: Vec<ChunkDelta>,
    /// Frames of the newest batch reported in the current run window
    batch_frames: u64,
}

struct JobInner {
    id: Uuid,
    options: EncodeOptions,
    deps: DependencyPaths,
    config: SupervisorConfig,
    state: Mutex<JobState>,
    events: broadcast::Sender<JobEvent>,
    /// True while an av1an process is live
    running: watch::Sender<bool>,
}

/// Handle to a supervised encode. Cloning is cheap and every clone controls
/// the same job.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

/// Result of one av1an process
struct Exit {
    code: Option<i32>,
    stderr: String,
}

/// A spawned av1an with its output readers
struct RunningChild {
    child: Child,
    // held open so av1an never reads EOF from stdin while running
    _stdin: Option<ChildStdin>,
    stdout: Option<JoinHandle<String>>,
    stderr: Option<JoinHandle<String>>,
}

/// Releases the process slot when a start finishes or is dropped
struct SlotGuard<'a>(&'a Job);

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        state.process = ProcessSlot::Absent;
        self.0.inner.running.send_replace(false);
    }
}

/// The side-file watch of one encode run
struct Armed {
    watch: WatchHandle,
    pump: JoinHandle<()>,
}

impl Job {
    pub fn new(options: EncodeOptions, deps: DependencyPaths, config: SupervisorConfig) -> Self {
        let id = Uuid::new_v4();
        let mut history = StatusHistory::new();
        history.push(StateTag::Idle, None, None);
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let (running, _) = watch::channel(false);
        debug!("Job {} created for {}", id, options.input.display());

        Self {
            inner: Arc::new(JobInner {
                id,
                options,
                deps,
                config,
                state: Mutex::new(JobState {
                    history,
                    process: ProcessSlot::Absent,
                    cancel_requested: false,
                    monitor: None,
                    held: Vec::new(),
                    batch_frames: 0,
                }),
                events,
                running,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn options(&self) -> &EncodeOptions {
        &self.inner.options
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// The argument list the main encode runs with
    pub fn args(&self) -> BuiltArgs {
        args::build(&self.inner.options)
    }

    /// Receive every status event and log change from now on
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    pub fn history(&self) -> Vec<StatusEvent> {
        self.lock().history.events().to_vec()
    }

    pub fn latest_state(&self) -> Option<StateTag> {
        self.lock().history.latest_state()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.lock().process, ProcessSlot::Running { .. })
    }

    pub fn pid(&self) -> Option<u32> {
        match self.lock().process {
            ProcessSlot::Running { pid, .. } => Some(pid),
            _ => None,
        }
    }

    /// Estimates as of now, or `None` before the first encode was watched
    pub fn progress(&self) -> Option<ProgressSnapshot> {
        let state = self.lock();
        let last_chunk = state
            .history
            .latest_progress()
            .and_then(|p| p.last_chunk.clone());
        self.snapshot_of(&state, Vec::new(), last_chunk)
    }

    pub fn done_file(&self) -> Option<DoneFile> {
        self.lock().monitor.as_ref().map(|m| m.done().clone())
    }

    /// Latest contents of the av1an log file
    pub fn log(&self) -> Option<String> {
        self.lock()
            .monitor
            .as_ref()
            .and_then(|m| m.log().map(str::to_owned))
    }

    /// Run the encode to completion.
    ///
    /// Runs scene detection first when a scenes file is configured but not on
    /// disk. Resolves `Ok` on success, on cancellation and when the process was
    /// stopped by a signal; fails when av1an cannot be spawned or exits with a
    /// non-zero code while not cancelled.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        self.claim()?;
        let _slot = SlotGuard(self);
        self.prepare_dirs().await?;

        if let Some(scenes) = self.inner.options.scenes_path() {
            if !scenes.exists() {
                info!(
                    "Job {}: no scenes file at {}, running scene detection",
                    self.inner.id,
                    scenes.display()
                );
                if !self.detect_scenes().await? {
                    return Ok(());
                }
            }
        }

        self.encode().await
    }

    /// Suspend the av1an process tree
    pub async fn pause(&self) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let ProcessSlot::Running {
            pid,
            suspended: None,
        } = state.process
        else {
            warn!("Job {}: pause requested without a running process", self.inner.id);
            return;
        };
        let Some(current) = state
            .history
            .latest_state()
            .filter(|s| matches!(s, StateTag::Encoding | StateTag::SceneDetection))
        else {
            warn!(
                "Job {}: cannot pause from {:?}",
                self.inner.id,
                state.history.latest_state()
            );
            return;
        };

        if process_tree::signal_tree(pid, TreeSignal::Suspend) == 0 {
            warn!("Job {}: could not suspend pid {}", self.inner.id, pid);
            return;
        }
        info!("Job {}: paused pid {}", self.inner.id, pid);
        state.process = ProcessSlot::Running {
            pid,
            suspended: Some(current),
        };
        self.push_status(state, StateTag::Paused, None, None);
    }

    /// Continue a paused process, or start the job if it never ran
    pub async fn resume(&self) -> Result<(), SupervisorError> {
        let start = {
            let mut guard = self.lock();
            let state = &mut *guard;
            match state.process {
                ProcessSlot::Absent if state.history.latest_state() == Some(StateTag::Idle) => {
                    true
                }
                ProcessSlot::Running {
                    pid,
                    suspended: Some(previous),
                } => {
                    if process_tree::signal_tree(pid, TreeSignal::Continue) == 0 {
                        warn!("Job {}: could not continue pid {}", self.inner.id, pid);
                    } else {
                        info!("Job {}: resumed pid {}", self.inner.id, pid);
                        state.process = ProcessSlot::Running {
                            pid,
                            suspended: None,
                        };
                        state.batch_frames = 0;
                        self.push_status(state, previous, None, None);
                    }
                    false
                }
                ProcessSlot::Running {
                    suspended: None, ..
                } => {
                    warn!("Job {}: resume requested but not paused", self.inner.id);
                    false
                }
                _ => {
                    warn!(
                        "Job {}: resume requested but the process has already exited",
                        self.inner.id
                    );
                    false
                }
            }
        };

        if start {
            self.start().await
        } else {
            Ok(())
        }
    }

    /// Stop the job. The `cancelled` event is recorded before the process
    /// tree is told to terminate, so its exit is never reported as a failure.
    pub async fn cancel(&self) {
        let target = {
            let mut guard = self.lock();
            let state = &mut *guard;
            match state.history.latest_state() {
                Some(current) if current.is_cancellable() => {}
                other => {
                    warn!("Job {}: cannot cancel from {:?}", self.inner.id, other);
                    return;
                }
            }
            state.cancel_requested = true;
            self.push_status(state, StateTag::Cancelled, None, None);
            match state.process {
                ProcessSlot::Running { pid, suspended } => Some((pid, suspended.is_some())),
                _ => None,
            }
        };

        let Some((pid, suspended)) = target else {
            return;
        };
        info!("Job {}: terminating process tree of pid {}", self.inner.id, pid);
        process_tree::signal_tree(pid, TreeSignal::Terminate);
        if suspended {
            // a stopped process only acts on the termination once continued
            process_tree::signal_tree(pid, TreeSignal::Continue);
        }

        let limit = self.inner.config.termination_timeout();
        let mut running = self.inner.running.subscribe();
        let exited = tokio::time::timeout(limit, running.wait_for(|live| !*live))
            .await
            .is_ok();
        if !exited {
            warn!(
                "Job {}: pid {} still running {:?} after termination, killing",
                self.inner.id, pid, limit
            );
            process_tree::signal_tree(pid, TreeSignal::Kill);
        }
    }

    fn lock(&self) -> MutexGuard<'_, JobState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn claim(&self) -> Result<(), SupervisorError> {
        let mut state = self.lock();
        if state.process != ProcessSlot::Absent {
            return Err(SupervisorError::AlreadyRunning(self.inner.id.to_string()));
        }
        if state.history.latest_state() == Some(StateTag::Cancelled) {
            warn!("Job {}: start requested after cancellation", self.inner.id);
            return Err(SupervisorError::Cancelled(self.inner.id.to_string()));
        }
        state.process = ProcessSlot::Starting;
        state.cancel_requested = false;
        state.held.clear();
        state.batch_frames = 0;
        Ok(())
    }

    fn cancel_requested(&self) -> bool {
        self.lock().cancel_requested
    }

    fn push_status(
        &self,
        state: &mut JobState,
        tag: StateTag,
        progress: Option<ProgressSnapshot>,
        error: Option<JobFailure>,
    ) {
        let event = state.history.push(tag, progress, error).clone();
        debug!("Job {}: -> {:?}", self.inner.id, tag);
        // no subscribers is fine
        let _ = self.inner.events.send(JobEvent::Status(event));
    }

    fn snapshot_of(
        &self,
        state: &JobState,
        completed: Vec<ChunkDelta>,
        last_chunk: Option<ChunkDelta>,
    ) -> Option<ProgressSnapshot> {
        let monitor = state.monitor.as_ref()?;
        let input = EstimateInput {
            history: &state.history,
            done: monitor.done(),
            total_frames: monitor.total_frames(),
            chunks: monitor.chunks(),
            batch_frames: state.batch_frames,
            fallback_framerate: self.inner.config.fallback_framerate,
            now: Utc::now(),
        };
        Some(estimate::snapshot(&input, completed, last_chunk))
    }

    fn fail(&self, exit_code: Option<i32>, message: String) {
        let mut state = self.lock();
        let failure = JobFailure {
            kind: FailureKind::AbnormalExit,
            exit_code,
            message,
        };
        self.push_status(&mut state, StateTag::Error, None, Some(failure));
    }

    async fn prepare_dirs(&self) -> Result<(), SupervisorError> {
        let options = &self.inner.options;
        let mut dirs: Vec<&Path> = Vec::new();
        if let Some(temp) = options.temp_dir() {
            dirs.push(temp);
        }
        if let Some(parent) = options.output.parent() {
            dirs.push(parent);
        }
        if let Some(parent) = options.scenes_path().and_then(Path::parent) {
            dirs.push(parent);
        }

        for dir in dirs.into_iter().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| SupervisorError::Prepare {
                    path: dir.to_path_buf(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Returns whether the main encode should follow
    async fn detect_scenes(&self) -> Result<bool, SupervisorError> {
        let args = args::build(&self.inner.options.detection_only());
        let Some(child) = self.spawn(&args, StateTag::SceneDetection)? else {
            return Ok(false);
        };
        let exit = child.wait(self).await?;

        match exit.code {
            _ if self.cancel_requested() => {
                info!("Job {}: scene detection cancelled", self.inner.id);
                Ok(false)
            }
            Some(0) => {
                info!("Job {}: scene detection finished", self.inner.id);
                Ok(true)
            }
            None => {
                info!("Job {}: scene detection stopped by a signal", self.inner.id);
                Ok(false)
            }
            Some(code) => Err(self.abnormal_exit(code, exit.stderr)),
        }
    }

    async fn encode(&self) -> Result<(), SupervisorError> {
        let args = args::build(&self.inner.options);
        info!("Job {}: av1an {}", self.inner.id, args.display_line());

        let armed = self.arm_monitor().await;
        let Some(child) = self.spawn(&args, StateTag::Encoding)? else {
            release(armed).await;
            return Ok(());
        };
        let exit = match child.wait(self).await {
            Ok(exit) => exit,
            Err(e) => {
                release(armed).await;
                return Err(e);
            }
        };

        match exit.code {
            Some(0) => {
                // late writes to the done-file land after the exit
                tokio::time::sleep(self.inner.config.done_grace()).await;
                release(armed).await;

                let mut guard = self.lock();
                let state = &mut *guard;
                if state.cancel_requested {
                    info!("Job {}: finished after cancellation", self.inner.id);
                    return Ok(());
                }
                let last_chunk = state
                    .history
                    .latest_progress()
                    .and_then(|p| p.last_chunk.clone());
                let held = std::mem::take(&mut state.held);
                let progress = self.snapshot_of(state, held, last_chunk);
                info!("Job {}: encode finished", self.inner.id);
                self.push_status(state, StateTag::Done, progress, None);
                Ok(())
            }
            None => {
                release(armed).await;
                info!("Job {}: av1an stopped by a signal", self.inner.id);
                Ok(())
            }
            Some(code) => {
                release(armed).await;
                if self.cancel_requested() {
                    info!(
                        "Job {}: av1an exited with code {} after cancellation",
                        self.inner.id, code
                    );
                    return Ok(());
                }
                Err(self.abnormal_exit(code, exit.stderr))
            }
        }
    }

    fn abnormal_exit(&self, code: i32, stderr: String) -> SupervisorError {
        error!("Job {}: av1an exited with code {}", self.inner.id, code);
        let message = if stderr.trim().is_empty() {
            format!("av1an exited with code {}", code)
        } else {
            stderr.clone()
        };
        self.fail(Some(code), message);
        SupervisorError::AbnormalExit { code, stderr }
    }

    /// Watch the temp directory and log file for the coming encode
    async fn arm_monitor(&self) -> Option<Armed> {
        let temp = self.inner.options.temp_dir()?.to_path_buf();
        let log = self.inner.options.log_path()?;

        let mut monitor = ProgressMonitor::new(SidePaths::new(&temp, log.clone()));
        monitor.load_existing();
        let existing_log = monitor.log().map(str::to_owned);
        self.lock().monitor = Some(monitor);
        if let Some(text) = existing_log {
            let _ = self.inner.events.send(JobEvent::Log(text));
        }

        let (watch, mut rx) =
            fswatch::watch_paths(vec![temp, log], self.inner.config.watch_interval()).await;
        let job = self.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                job.on_fs_event(&event);
            }
        });
        Some(Armed { watch, pump })
    }

    fn on_fs_event(&self, event: &FsEvent) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(monitor) = state.monitor.as_mut() else {
            return;
        };

        match monitor.handle(event) {
            None => {}
            Some(MonitorUpdate::Chunks(count)) => {
                debug!("Job {}: {} chunk(s) planned", self.inner.id, count);
            }
            Some(MonitorUpdate::Log(text)) => {
                let _ = self.inner.events.send(JobEvent::Log(text));
            }
            Some(MonitorUpdate::Completed(completed)) => {
                info!(
                    "Job {}: {} chunk(s) completed",
                    self.inner.id,
                    completed.len()
                );
                if state.history.latest_state() != Some(StateTag::Encoding) {
                    debug!(
                        "Job {}: holding progress while {:?}",
                        self.inner.id,
                        state.history.latest_state()
                    );
                    state.held.extend(completed);
                    return;
                }
                state.batch_frames = completed.iter().map(|c| c.frames).sum();
                let mut reported = std::mem::take(&mut state.held);
                reported.extend(completed);
                let progress = self.snapshot_of(state, reported, None);
                self.push_status(state, StateTag::Encoding, progress, None);
            }
        }
    }

    /// Spawn av1an unless the job was cancelled while starting. The spawn
    /// and the resulting state change happen under one lock.
    fn spawn(&self, args: &BuiltArgs, tag: StateTag) -> Result<Option<RunningChild>, SupervisorError> {
        let path = env_path::resolve_current_path(&self.inner.deps)?;
        let program = &self.inner.config.av1an_bin;

        let mut cmd = Command::new(program);
        cmd.args(&args.argv)
            .env("PATH", &path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = self.inner.options.working_dir() {
            cmd.current_dir(dir);
        }

        let mut guard = self.lock();
        let state = &mut *guard;
        if state.cancel_requested {
            info!("Job {}: cancelled before av1an started", self.inner.id);
            return Ok(None);
        }

        let spawned = cmd
            .spawn()
            .and_then(|child| spawned_pid(child.id()).map(|pid| (child, pid)));
        let (mut child, pid) = match spawned {
            Ok(spawned) => spawned,
            Err(source) => {
                error!(
                    "Job {}: failed to spawn {}: {}",
                    self.inner.id,
                    program.display(),
                    source
                );
                let failure = JobFailure {
                    kind: FailureKind::Spawn,
                    exit_code: None,
                    message: source.to_string(),
                };
                self.push_status(state, StateTag::Error, None, Some(failure));
                return Err(SupervisorError::Spawn {
                    program: program.clone(),
                    source,
                });
            }
        };

        info!("Job {}: av1an running as pid {} ({:?})", self.inner.id, pid, tag);
        state.process = ProcessSlot::Running {
            pid,
            suspended: None,
        };
        self.push_status(state, tag, None, None);
        self.inner.running.send_replace(true);
        drop(guard);

        let id = self.inner.id;
        let stdout = child
            .stdout
            .take()
            .map(|out| tokio::spawn(drain(out, id, "stdout", 0)));
        let stderr = child
            .stderr
            .take()
            .map(|err| tokio::spawn(drain(err, id, "stderr", STDERR_TAIL)));

        Ok(Some(RunningChild {
            _stdin: child.stdin.take(),
            child,
            stdout,
            stderr,
        }))
    }

    /// The process is gone but the start call has not returned yet
    fn mark_exited(&self) {
        let mut state = self.lock();
        state.process = ProcessSlot::Starting;
        self.inner.running.send_replace(false);
    }
}

impl RunningChild {
    async fn wait(mut self, job: &Job) -> Result<Exit, SupervisorError> {
        let status = self.child.wait().await;
        job.mark_exited();

        if let Some(stdout) = self.stdout.take() {
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, stdout).await;
        }
        let stderr = match self.stderr.take() {
            Some(task) => tokio::time::timeout(DRAIN_TIMEOUT, task)
                .await
                .ok()
                .and_then(Result::ok)
                .unwrap_or_default(),
            None => String::new(),
        };

        match status {
            Ok(status) => {
                debug!("Job {}: av1an exited with {}", job.inner.id, status);
                Ok(Exit {
                    code: status.code(),
                    stderr,
                })
            }
            Err(e) => {
                error!("Job {}: failed to wait for av1an: {}", job.inner.id, e);
                if !job.cancel_requested() {
                    job.fail(None, e.to_string());
                }
                Err(SupervisorError::Wait(e))
            }
        }
    }
}

/// Tokio only loses the pid of a child it has already reaped
fn spawned_pid(pid: Option<u32>) -> io::Result<u32> {
    pid.ok_or_else(|| io::Error::other("av1an exited before its pid was known"))
}

/// Final scan, then stop the watch and wait for the last events to apply
async fn release(armed: Option<Armed>) {
    let Some(Armed { watch, pump }) = armed else {
        return;
    };
    watch.close().await;
    if let Err(e) = pump.await {
        warn!("Side-file pump failed: {}", e);
    }
}

/// Forward output lines to the log, keeping the last `keep` of them
async fn drain<R>(reader: R, job: Uuid, stream: &'static str, keep: usize) -> String
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut tail = VecDeque::with_capacity(keep);
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("Job {} av1an {}: {}", job, stream, line);
        if keep > 0 {
            if tail.len() == keep {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }
    Vec::from(tail).join("\n")
}
