//! FFmpeg encoder process supervision.
//!
//! [`FfmpegSupervisor`] owns the external PCM-to-MP3 encoder subprocess:
//! spawning, stdout/stderr draining, stall and startup-failure detection,
//! and restarts with a fixed backoff schedule. It is source-agnostic: every
//! valid 4608-byte PCM frame is written identically, whether it carries
//! program audio, silence, or tone. Source selection belongs entirely to the
//! EncoderManager upstream.
//!
//! State transitions are delivered to the manager over a typed mpsc channel,
//! never through synchronous callbacks, and never while the state lock is
//! held.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::audio::FrameRingBuffer;
use crate::encoder::mp3::FrameScanner;
use crate::encoder::EncoderError;
use crate::protocol_constants::{
    CHANNELS, PCM_FRAME_BYTES, PROCESS_TERM_GRACE, SAMPLE_RATE, SOFT_STARTUP_TARGET,
    STDERR_TAIL_MAX, STDIN_WRITE_TIMEOUT, STDOUT_READ_TIMEOUT,
};
use crate::state::EncoderConfig;

/// Supervisor state machine. Owned exclusively by the supervisor; observers
/// see it through [`FfmpegSupervisor::get_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Booting,
    Running,
    Restarting,
    Failed,
}

impl SupervisorState {
    /// Returns the state as an uppercase string identifier.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "STOPPED",
            Self::Starting => "STARTING",
            Self::Booting => "BOOTING",
            Self::Running => "RUNNING",
            Self::Restarting => "RESTARTING",
            Self::Failed => "FAILED",
        }
    }
}

/// Classification of supervisor failures. Every failure path funnels through
/// [`FfmpegSupervisor::report_failure`] with one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FailureKind {
    ProcessExit { exit_code: Option<i32> },
    Eof { exit_code: Option<i32> },
    ReadError(String),
    Stall { elapsed_ms: u64 },
    StartupTimeout,
    StdinBroken(String),
    Respawn(String),
}

impl FailureKind {
    fn describe(&self) -> String {
        match self {
            Self::ProcessExit { exit_code } => {
                format!("process_exit (exit code: {})", fmt_exit(*exit_code))
            }
            Self::Eof { exit_code } => {
                format!("stdout eof (exit code: {})", fmt_exit(*exit_code))
            }
            Self::ReadError(e) => format!("read_error ({e})"),
            Self::Stall { elapsed_ms } => format!("stall ({elapsed_ms}ms without frames)"),
            Self::StartupTimeout => "startup_timeout".to_string(),
            Self::StdinBroken(e) => format!("stdin_broken ({e})"),
            Self::Respawn(e) => format!("respawn_failed ({e})"),
        }
    }

    fn is_stall(&self) -> bool {
        matches!(self, Self::Stall { .. })
    }
}

fn fmt_exit(code: Option<i32>) -> String {
    code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
}

/// Picks the backoff delay for a restart attempt (1-based). Attempts beyond
/// the schedule reuse its last entry.
fn backoff_delay(schedule_ms: &[u64], attempt: u32) -> Duration {
    let idx = (attempt.saturating_sub(1) as usize).min(schedule_ms.len() - 1);
    Duration::from_millis(schedule_ms[idx])
}

struct StateInner {
    state: SupervisorState,
    restart_attempts: u32,
    first_frame_received: bool,
    startup_complete: bool,
    restart_disabled: bool,
    restart_in_flight: bool,
    deferred_failure: Option<FailureKind>,
    started_at: Option<Instant>,
    last_frame_at: Option<Instant>,
}

/// Tasks and cancellation scope tied to one process attempt.
struct AttemptTasks {
    cancel: CancellationToken,
    watchdog_cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Self-healing wrapper around the external PCM-to-MP3 encoder subprocess.
pub struct FfmpegSupervisor {
    config: EncoderConfig,
    mp3_buffer: Arc<FrameRingBuffer>,
    state: Mutex<StateInner>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    child: tokio::sync::Mutex<Option<Child>>,
    stderr_tail: Mutex<String>,
    attempt: Mutex<Option<AttemptTasks>>,
    events_tx: mpsc::UnboundedSender<SupervisorState>,
    shutdown: CancellationToken,
}

impl FfmpegSupervisor {
    /// Creates a supervisor. State transitions are delivered on `events_tx`.
    pub fn new(
        config: EncoderConfig,
        mp3_buffer: Arc<FrameRingBuffer>,
        events_tx: mpsc::UnboundedSender<SupervisorState>,
    ) -> Self {
        Self {
            config,
            mp3_buffer,
            state: Mutex::new(StateInner {
                state: SupervisorState::Stopped,
                restart_attempts: 0,
                first_frame_received: false,
                startup_complete: false,
                restart_disabled: false,
                restart_in_flight: false,
                deferred_failure: None,
                started_at: None,
                last_frame_at: None,
            }),
            stdin: tokio::sync::Mutex::new(None),
            child: tokio::sync::Mutex::new(None),
            stderr_tail: Mutex::new(String::new()),
            attempt: Mutex::new(None),
            events_tx,
            shutdown: CancellationToken::new(),
        }
    }

    /// Returns the supervisor state with restart-epoch semantics: once at
    /// least one restart has occurred and the new process has not yet
    /// produced its first MP3 frame, observers see `RESTARTING` even if the
    /// raw state has already advanced to `BOOTING`.
    pub fn get_state(&self) -> SupervisorState {
        let inner = self.state.lock();
        if inner.restart_attempts > 0
            && !inner.first_frame_received
            && matches!(
                inner.state,
                SupervisorState::Booting | SupervisorState::Restarting
            )
        {
            return SupervisorState::Restarting;
        }
        inner.state
    }

    /// Raw state without the restart-epoch mapping. The stdin gate uses
    /// this: a freshly respawned process is BOOTING and must receive PCM
    /// even while observers still see RESTARTING.
    fn raw_state(&self) -> SupervisorState {
        self.state.lock().state
    }

    /// Number of restarts attempted for the current failure streak.
    pub fn restart_attempts(&self) -> u32 {
        self.state.lock().restart_attempts
    }

    /// Most recent captured encoder stderr, bounded to 10KB.
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail.lock().clone()
    }

    fn emit(&self, state: SupervisorState) {
        log::debug!("Supervisor state -> {}", state.as_str());
        let _ = self.events_tx.send(state);
    }

    /// Spawns the encoder process and enters BOOTING.
    ///
    /// Always returns with state == BOOTING when the spawn syscall itself
    /// succeeds, even if the child died milliseconds later; such failures
    /// are deferred and processed asynchronously shortly after return.
    pub async fn start(self: &Arc<Self>) -> Result<(), EncoderError> {
        if !self.config.allow_spawn {
            // Hard, loud failure: tests must opt into subprocess launches.
            return Err(EncoderError::SpawnNotPermitted);
        }

        {
            let mut inner = self.state.lock();
            if inner.state != SupervisorState::Stopped {
                return Err(EncoderError::AlreadyStarted);
            }
            inner.state = SupervisorState::Starting;
            inner.startup_complete = false;
        }
        self.emit(SupervisorState::Starting);

        if let Err(e) = self.spawn_attempt().await {
            self.state.lock().state = SupervisorState::Failed;
            self.emit(SupervisorState::Failed);
            return Err(EncoderError::Spawn(e));
        }

        let deferred = {
            let mut inner = self.state.lock();
            inner.state = SupervisorState::Booting;
            inner.startup_complete = true;
            inner.deferred_failure.take()
        };
        self.emit(SupervisorState::Booting);

        if let Some(kind) = deferred {
            // Late-detected startup failure: processed after start() returns
            // so callers always observe BOOTING first.
            let supervisor = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                if supervisor.state.lock().state == SupervisorState::Booting {
                    supervisor.report_failure(kind);
                }
            });
        }

        Ok(())
    }

    /// Writes one canonical PCM frame to encoder stdin.
    ///
    /// Non-blocking beyond a bounded pipe-write timeout. Wrong-sized frames
    /// are dropped at this edge; frames outside BOOTING/RUNNING are silently
    /// discarded; a broken pipe schedules asynchronous failure handling and
    /// returns immediately.
    pub async fn write_pcm(self: &Arc<Self>, frame: &Bytes) {
        if frame.len() != PCM_FRAME_BYTES {
            log::debug!(
                "Rejecting PCM frame with wrong size: {} (expected {})",
                frame.len(),
                PCM_FRAME_BYTES
            );
            return;
        }

        if !matches!(
            self.raw_state(),
            SupervisorState::Booting | SupervisorState::Running
        ) {
            return;
        }

        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return;
        };

        let outcome = {
            let write = async {
                stdin.write_all(frame).await?;
                stdin.flush().await
            };
            tokio::time::timeout(STDIN_WRITE_TIMEOUT, write).await
        };
        drop(guard);

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::debug!("Encoder stdin write failed: {e}");
                self.report_failure(FailureKind::StdinBroken(e.to_string()));
            }
            Err(_) => {
                // Pipe full: the stall detector will classify a wedged
                // encoder; dropping one frame keeps the tick non-blocking.
                log::debug!("Encoder stdin write timed out, dropping frame");
            }
        }
    }

    /// Stops the supervisor: disables restarts, tears down the current
    /// process attempt, and leaves the state at STOPPED. Idempotent.
    pub async fn stop(self: &Arc<Self>, timeout: Duration) {
        log::info!("Stopping encoder supervisor");
        let old = {
            let mut inner = self.state.lock();
            inner.restart_disabled = true;
            inner.deferred_failure = None;
            let old = inner.state;
            inner.state = SupervisorState::Stopped;
            old
        };
        self.shutdown.cancel();
        if old != SupervisorState::Stopped {
            self.emit(SupervisorState::Stopped);
        }
        self.stop_current_process(timeout).await;
        log::info!("Encoder supervisor stopped");
    }

    /// Recovery entry point for the manager's DEGRADED loop: resets the
    /// restart budget and schedules a fresh attempt.
    pub(crate) fn begin_recovery(self: &Arc<Self>) {
        let proceed = {
            let mut inner = self.state.lock();
            if inner.state != SupervisorState::Failed
                || inner.restart_in_flight
                || inner.restart_disabled
            {
                false
            } else {
                inner.restart_attempts = 0;
                inner.state = SupervisorState::Restarting;
                inner.restart_in_flight = true;
                true
            }
        };
        if proceed {
            log::info!("Recovery: scheduling encoder restart");
            self.emit(SupervisorState::Restarting);
            let supervisor = Arc::clone(self);
            tokio::spawn(async move { supervisor.restart_worker(1).await });
        }
    }

    // ── Process attempt lifecycle ────────────────────────────────────────

    fn build_command(&self) -> Command {
        let sample_rate = SAMPLE_RATE.to_string();
        let channels = CHANNELS.to_string();
        let bitrate = format!("{}k", self.config.bitrate_kbps);

        let mut cmd = Command::new(&self.config.ffmpeg_bin);
        cmd.args([
            "-hide_banner",
            "-nostdin",
            "-loglevel",
            "warning",
            "-f",
            "s16le",
            "-ar",
            sample_rate.as_str(),
            "-ac",
            channels.as_str(),
            "-i",
            "pipe:0",
            "-c:a",
            "libmp3lame",
            "-b:a",
            bitrate.as_str(),
            // Forces MP3 packetization at the canonical 1152-sample frame
            // boundary; required for the startup-timeout guarantee.
            "-frame_size",
            "1152",
            "-f",
            "mp3",
            "-fflags",
            "+nobuffer",
            "-flush_packets",
            "1",
            "-write_xing",
            "0",
            "pipe:1",
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
        cmd
    }

    async fn spawn_attempt(self: &Arc<Self>) -> std::io::Result<()> {
        let mut child = self.build_command().spawn()?;
        let pid = child.id();
        log::info!(
            "Started {} PID={}",
            self.config.ffmpeg_bin,
            pid.map_or_else(|| "unknown".to_string(), |p| p.to_string())
        );

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        *self.stdin.lock().await = stdin;
        *self.child.lock().await = Some(child);

        {
            let mut inner = self.state.lock();
            inner.started_at = Some(Instant::now());
            inner.last_frame_at = None;
        }

        let cancel = self.shutdown.child_token();
        let watchdog_cancel = cancel.child_token();
        let mut handles = Vec::new();

        if let Some(stdout) = stdout {
            let supervisor = Arc::clone(self);
            let token = cancel.clone();
            handles.push(tokio::spawn(async move {
                supervisor.stdout_drain(stdout, token).await;
            }));
            log::debug!("Encoder stdout drain task started");
        }
        if let Some(stderr) = stderr {
            let supervisor = Arc::clone(self);
            let token = cancel.clone();
            handles.push(tokio::spawn(async move {
                supervisor.stderr_drain(stderr, token).await;
            }));
            log::debug!("Encoder stderr drain task started");
        }
        {
            let supervisor = Arc::clone(self);
            let token = watchdog_cancel.clone();
            handles.push(tokio::spawn(async move {
                supervisor.startup_watchdog(token).await;
            }));
        }

        *self.attempt.lock() = Some(AttemptTasks {
            cancel,
            watchdog_cancel,
            handles,
        });
        Ok(())
    }

    async fn stop_current_process(&self, timeout: Duration) {
        let attempt = self.attempt.lock().take();
        if let Some(attempt) = &attempt {
            attempt.cancel.cancel();
        }

        // Closing stdin is the encoder's graceful shutdown signal; escalate
        // to a kill if it lingers past the grace window.
        *self.stdin.lock().await = None;

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(PROCESS_TERM_GRACE, child.wait()).await {
                Ok(Ok(status)) => log::debug!("Encoder process exited: {status}"),
                Ok(Err(e)) => log::warn!("Error waiting for encoder process: {e}"),
                Err(_) => {
                    log::warn!("Encoder process did not exit after stdin close, killing");
                    if let Err(e) = child.kill().await {
                        log::warn!("Error killing encoder process: {e}");
                    }
                }
            }
        }

        if let Some(attempt) = attempt {
            for handle in attempt.handles {
                if tokio::time::timeout(timeout.min(Duration::from_millis(250)), handle)
                    .await
                    .is_err()
                {
                    log::warn!("Encoder drain task did not stop within timeout, abandoning");
                }
            }
        }
    }

    async fn child_exit_code(&self) -> Option<i32> {
        let mut guard = self.child.try_lock().ok()?;
        let child = guard.as_mut()?;
        child.try_wait().ok().flatten().and_then(|s| s.code())
    }

    // ── Drain tasks ──────────────────────────────────────────────────────

    async fn stdout_drain(self: Arc<Self>, mut stdout: ChildStdout, cancel: CancellationToken) {
        let mut scanner = FrameScanner::new();
        let mut buf = vec![0u8; 4096];

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                read = tokio::time::timeout(STDOUT_READ_TIMEOUT, stdout.read(&mut buf)) => {
                    match read {
                        Err(_) => {
                            // No output inside the window; stall check only.
                            if let Some(elapsed_ms) = self.stall_elapsed() {
                                self.report_failure(FailureKind::Stall { elapsed_ms });
                                break;
                            }
                        }
                        Ok(Ok(0)) => {
                            let exit_code = self.child_exit_code().await;
                            log::warn!(
                                "Encoder stdout EOF - encoder process ended (exit code: {})",
                                fmt_exit(exit_code)
                            );
                            self.report_failure(FailureKind::Eof { exit_code });
                            break;
                        }
                        Ok(Ok(n)) => {
                            for frame in scanner.feed(&buf[..n]) {
                                if self.mp3_buffer.push(frame).is_ok() {
                                    self.note_mp3_frame();
                                }
                            }
                            if let Some(elapsed_ms) = self.stall_elapsed() {
                                self.report_failure(FailureKind::Stall { elapsed_ms });
                                break;
                            }
                        }
                        Ok(Err(e)) => {
                            self.report_failure(FailureKind::ReadError(e.to_string()));
                            break;
                        }
                    }
                }
            }
        }
        log::debug!("Encoder stdout drain task stopped");
    }

    async fn stderr_drain(self: Arc<Self>, stderr: ChildStderr, cancel: CancellationToken) {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => self.record_stderr_line(&line),
                        Ok(None) => break,
                        Err(e) => {
                            log::debug!("Encoder stderr read error (likely closed): {e}");
                            break;
                        }
                    }
                }
            }
        }
        log::debug!("Encoder stderr drain task stopped");
    }

    fn record_stderr_line(&self, line: &str) {
        if line.is_empty() {
            return;
        }
        // "Guessed Channel Layout" is informational, not an error.
        if line.to_ascii_lowercase().contains("guessed channel layout") {
            log::debug!("[FFMPEG] {line}");
        } else {
            log::error!("[FFMPEG] {line}");
        }

        let mut tail = self.stderr_tail.lock();
        tail.push_str(line);
        tail.push('\n');
        if tail.len() > STDERR_TAIL_MAX {
            // Truncate oldest-first, keeping the most recent output.
            let excess = tail.len() - STDERR_TAIL_MAX;
            tail.drain(..excess);
        }
    }

    async fn startup_watchdog(self: Arc<Self>, cancel: CancellationToken) {
        let hard = Duration::from_millis(self.config.startup_timeout_ms);
        let soft = SOFT_STARTUP_TARGET.min(hard);

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(soft) => {}
        }
        if !self.state.lock().first_frame_received {
            log::warn!(
                "Slow encoder startup: no MP3 frame within {}ms (soft target)",
                soft.as_millis()
            );
        }

        let remaining = hard.saturating_sub(soft);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(remaining) => {}
        }
        if !self.state.lock().first_frame_received {
            log::error!(
                "Encoder did not produce first MP3 frame within {}ms",
                hard.as_millis()
            );
            self.report_failure(FailureKind::StartupTimeout);
        }
    }

    /// Records one extracted MP3 frame; the first frame of an attempt flips
    /// BOOTING into RUNNING (log emitted atomically with the transition) and
    /// cancels the startup watchdog.
    fn note_mp3_frame(self: &Arc<Self>) {
        let transitioned = {
            let mut inner = self.state.lock();
            inner.last_frame_at = Some(Instant::now());
            if inner.first_frame_received {
                false
            } else {
                inner.first_frame_received = true;
                if let Some(started_at) = inner.started_at {
                    log::info!(
                        "First MP3 output received after {}ms",
                        started_at.elapsed().as_millis()
                    );
                }
                if inner.state == SupervisorState::Booting {
                    inner.state = SupervisorState::Running;
                    // The restart streak ends once a process proves healthy.
                    inner.restart_attempts = 0;
                    log::info!("Encoder LIVE (first frame received)");
                    true
                } else {
                    false
                }
            }
        };

        if let Some(attempt) = self.attempt.lock().as_ref() {
            attempt.watchdog_cancel.cancel();
        }
        if transitioned {
            self.emit(SupervisorState::Running);
        }
    }

    fn stall_elapsed(&self) -> Option<u64> {
        let inner = self.state.lock();
        if !inner.first_frame_received {
            // Stall detection is disabled until the first frame; the
            // startup watchdog covers cold starts.
            return None;
        }
        let last = inner.last_frame_at?;
        let elapsed_ms = last.elapsed().as_millis() as u64;
        (elapsed_ms >= self.config.stall_threshold_ms).then_some(elapsed_ms)
    }

    // ── Failure handling ─────────────────────────────────────────────────

    /// Single funnel for every failure path. Defers during startup, ignores
    /// stalls while BOOTING, enforces the restart budget, and schedules the
    /// asynchronous restart worker.
    fn report_failure(self: &Arc<Self>, kind: FailureKind) {
        enum Decision {
            Ignore,
            Deferred,
            Failed,
            Restart { attempt: u32, announce: bool },
        }

        let decision = {
            let mut inner = self.state.lock();
            if inner.restart_disabled
                || matches!(
                    inner.state,
                    SupervisorState::Stopped | SupervisorState::Failed
                )
            {
                Decision::Ignore
            } else if inner.state == SupervisorState::Starting || !inner.startup_complete {
                inner.deferred_failure = Some(kind.clone());
                Decision::Deferred
            } else if kind.is_stall()
                && inner.state == SupervisorState::Booting
                && !inner.first_frame_received
            {
                Decision::Ignore
            } else if inner.restart_in_flight {
                Decision::Ignore
            } else {
                let announce = inner.state != SupervisorState::Restarting;
                inner.state = SupervisorState::Restarting;
                inner.restart_attempts += 1;
                if inner.restart_attempts > self.config.max_restarts {
                    inner.state = SupervisorState::Failed;
                    Decision::Failed
                } else {
                    inner.restart_in_flight = true;
                    Decision::Restart {
                        attempt: inner.restart_attempts,
                        announce,
                    }
                }
            }
        };

        match decision {
            Decision::Ignore => {}
            Decision::Deferred => {
                log::debug!("Deferred failure during startup: {}", kind.describe());
            }
            Decision::Failed => {
                self.log_failure(&kind);
                log::error!(
                    "Encoder failed after {} restart attempts, entering FAILED state",
                    self.config.max_restarts
                );
                self.emit(SupervisorState::Failed);
            }
            Decision::Restart { attempt, announce } => {
                self.log_failure(&kind);
                if announce {
                    self.emit(SupervisorState::Restarting);
                }
                let supervisor = Arc::clone(self);
                tokio::spawn(async move { supervisor.restart_worker(attempt).await });
            }
        }
    }

    fn log_failure(&self, kind: &FailureKind) {
        let tail = self.stderr_tail.lock();
        if tail.is_empty() {
            log::error!("Encoder failure: {}", kind.describe());
        } else {
            log::error!(
                "Encoder failure: {}; stderr tail: {}",
                kind.describe(),
                tail.trim_end().replace('\n', " | ")
            );
        }
    }

    /// One restart cycle: announce BOOTING, clear first-frame tracking, wait
    /// out the backoff, tear down the old process, spawn the replacement
    /// with fresh drain tasks and watchdog. The MP3 buffer is never cleared.
    async fn restart_worker(self: Arc<Self>, attempt: u32) {
        {
            let mut inner = self.state.lock();
            inner.state = SupervisorState::Booting;
            inner.first_frame_received = false;
            inner.started_at = None;
            inner.last_frame_at = None;
        }
        self.emit(SupervisorState::Booting);

        let delay = backoff_delay(&self.config.backoff_ms, attempt);
        log::info!(
            "Restarting encoder (attempt {}/{}) after {}ms delay",
            attempt,
            self.config.max_restarts,
            delay.as_millis()
        );

        tokio::select! {
            _ = self.shutdown.cancelled() => {
                self.state.lock().restart_in_flight = false;
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        self.stop_current_process(Duration::from_millis(500)).await;
        self.stderr_tail.lock().clear();

        if self.state.lock().restart_disabled {
            self.state.lock().restart_in_flight = false;
            return;
        }

        match self.spawn_attempt().await {
            Ok(()) => {
                // BOOTING must be observable for every attempt, even if the
                // new process fails immediately afterwards.
                self.state.lock().state = SupervisorState::Booting;
                self.emit(SupervisorState::Booting);
                self.state.lock().restart_in_flight = false;
                log::info!("Encoder restarted (BOOTING, waiting for first frame)");
            }
            Err(e) => {
                log::error!("Encoder respawn failed: {e}");
                self.state.lock().restart_in_flight = false;
                self.report_failure(FailureKind::Respawn(e.to_string()));
            }
        }
    }
}

#[cfg(test)]
impl FfmpegSupervisor {
    fn test_poke(&self, state: SupervisorState, attempts: u32, first_frame: bool) {
        let mut inner = self.state.lock();
        inner.state = state;
        inner.restart_attempts = attempts;
        inner.first_frame_received = first_frame;
        inner.startup_complete = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::EncoderConfig;

    fn make_supervisor(config: EncoderConfig) -> Arc<FfmpegSupervisor> {
        let buffer = Arc::new(FrameRingBuffer::new(8).unwrap());
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(FfmpegSupervisor::new(config, buffer, tx))
    }

    #[tokio::test]
    async fn start_without_permission_fails_loudly() {
        let supervisor = make_supervisor(EncoderConfig::default());
        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, EncoderError::SpawnNotPermitted));
        assert_eq!(supervisor.get_state(), SupervisorState::Stopped);
    }

    #[test]
    fn backoff_uses_schedule_then_repeats_last_entry() {
        let schedule = [1000, 2000, 4000, 8000, 10000];
        assert_eq!(backoff_delay(&schedule, 1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(&schedule, 3), Duration::from_millis(4000));
        assert_eq!(backoff_delay(&schedule, 5), Duration::from_millis(10000));
        assert_eq!(backoff_delay(&schedule, 42), Duration::from_millis(10000));
    }

    #[test]
    fn get_state_reports_restarting_until_new_first_frame() {
        let supervisor = make_supervisor(EncoderConfig::default());

        supervisor.test_poke(SupervisorState::Booting, 1, false);
        assert_eq!(supervisor.get_state(), SupervisorState::Restarting);

        supervisor.test_poke(SupervisorState::Booting, 1, true);
        assert_eq!(supervisor.get_state(), SupervisorState::Booting);

        // Initial start (no restart yet) reports plain BOOTING.
        supervisor.test_poke(SupervisorState::Booting, 0, false);
        assert_eq!(supervisor.get_state(), SupervisorState::Booting);
    }

    #[test]
    fn stderr_tail_truncates_oldest_first() {
        let supervisor = make_supervisor(EncoderConfig::default());
        let line = "x".repeat(1024);
        for _ in 0..20 {
            supervisor.record_stderr_line(&line);
        }
        let tail = supervisor.stderr_tail();
        assert!(tail.len() <= STDERR_TAIL_MAX);
        assert!(tail.ends_with("x\n"));
    }

    #[tokio::test]
    async fn write_pcm_rejects_wrong_sized_frames() {
        let supervisor = make_supervisor(EncoderConfig::default());
        supervisor.test_poke(SupervisorState::Running, 0, true);

        // Wrong-sized and out-of-state writes are silent no-ops (no stdin
        // is attached, so reaching the write path would hang; the guards
        // return first).
        supervisor.write_pcm(&Bytes::from(vec![0u8; 4607])).await;
        supervisor.write_pcm(&Bytes::from(vec![0u8; 4609])).await;

        supervisor.test_poke(SupervisorState::Stopped, 0, false);
        supervisor
            .write_pcm(&Bytes::from(vec![0u8; PCM_FRAME_BYTES]))
            .await;
    }

    #[tokio::test]
    async fn failure_past_budget_enters_failed() {
        let config = EncoderConfig {
            max_restarts: 0,
            ..Default::default()
        };
        let buffer = Arc::new(FrameRingBuffer::new(8).unwrap());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(FfmpegSupervisor::new(config, buffer, tx));

        supervisor.test_poke(SupervisorState::Running, 0, true);
        supervisor.report_failure(FailureKind::Eof { exit_code: Some(1) });

        assert_eq!(supervisor.get_state(), SupervisorState::Failed);
        assert_eq!(rx.recv().await, Some(SupervisorState::Failed));
    }

    #[test]
    fn stall_is_ignored_while_booting() {
        let supervisor = make_supervisor(EncoderConfig::default());
        supervisor.test_poke(SupervisorState::Booting, 0, false);
        supervisor.report_failure(FailureKind::Stall { elapsed_ms: 5000 });
        assert_eq!(supervisor.get_state(), SupervisorState::Booting);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let supervisor = make_supervisor(EncoderConfig::default());
        supervisor.stop(Duration::from_millis(100)).await;
        supervisor.stop(Duration::from_millis(100)).await;
        assert_eq!(supervisor.get_state(), SupervisorState::Stopped);
    }
}
