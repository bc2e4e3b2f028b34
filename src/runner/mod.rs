//! Execution orchestrator.
//!
//! Each `run` spawns one session task that walks a sandbox through
//! create → attach → start → stdin → running, relays everything the program
//! does as [`OutboundEvent`]s, and always finishes with teardown. Exactly
//! one terminal event (`ExitCode` or `Error`) ends every stream.
//!
//! A session owns a child of the server's shutdown token. The deadline
//! watchdog, an explicit stop, and server shutdown all cancel it; whoever
//! observes the cancellation kills the sandbox.

mod error;
mod event;
mod registry;

pub(crate) use error::{RunError, StopError};
pub(crate) use event::{EventKind, OutboundEvent, RunRequest, StopRequest, WireEvent};
#[cfg(test)]
pub(crate) use event::{Level, Payload};
pub(crate) use registry::{ActiveSession, SessionRegistry};

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::config::ExecutionConfig;
use crate::demux::{self, DemuxedIo, LineReceiver, StdinSink};
use crate::sandbox::{ExitOutcome, SandboxError, SandboxId, SandboxRuntime};
use crate::stats::CpuSampler;
use crate::technology::TechnologyRegistry;

const STARTING_MESSAGE: &str = "Starting up container...";
const CREATED_MESSAGE: &str = "Execution container is created.";

/// Cancellation state shared between a session and `stop`.
#[derive(Debug)]
pub(crate) struct SessionControl {
    cancel: CancellationToken,
    timed_out: AtomicBool,
    stop_requested: AtomicBool,
    force_stopped: AtomicBool,
}

impl SessionControl {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            timed_out: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            force_stopped: AtomicBool::new(false),
        }
    }

    /// Ask the session to stop; it kills its own sandbox.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    fn expire(&self) {
        self.timed_out.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    fn mark_force_stopped(&self, forced: bool) {
        self.force_stopped.store(forced, Ordering::SeqCst);
    }

    fn is_force_stopped(&self) -> bool {
        self.force_stopped.load(Ordering::SeqCst)
    }

    fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Why the token was cancelled.
    fn interruption(&self) -> RunError {
        if self.is_force_stopped() {
            RunError::ForceStopped
        } else if self.stop_requested.load(Ordering::SeqCst) {
            RunError::Stopped
        } else if self.timed_out.load(Ordering::SeqCst) {
            RunError::TimedOut
        } else {
            RunError::ShuttingDown
        }
    }
}

/// Outbound half of one session's event stream.
#[derive(Clone)]
struct EventSink {
    request_id: String,
    tx: mpsc::Sender<OutboundEvent>,
}

impl EventSink {
    async fn send(&self, kind: EventKind) -> Result<(), RunError> {
        let event = OutboundEvent {
            request_id: self.request_id.clone(),
            kind,
        };
        self.tx
            .send(event)
            .await
            .map_err(|_| RunError::ClientDisconnected)
    }

    async fn info(&self, text: impl Into<String>) -> Result<(), RunError> {
        self.send(EventKind::Info(text.into())).await
    }

    /// Resolves once the client stops listening.
    async fn closed(&self) {
        self.tx.closed().await;
    }
}

/// Per-session state that teardown needs.
struct Session {
    request_id: String,
    control: Arc<SessionControl>,
    sink: EventSink,
    sandbox: Option<SandboxId>,
    relay: Option<JoinHandle<()>>,
}

struct Inner {
    runtime: Arc<dyn SandboxRuntime>,
    technologies: TechnologyRegistry,
    sessions: SessionRegistry,
    policy: ExecutionConfig,
    shutdown: CancellationToken,
}

/// Runs code in sandboxes and tracks the sessions doing so.
#[derive(Clone)]
pub(crate) struct Runner {
    inner: Arc<Inner>,
}

impl Runner {
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        technologies: TechnologyRegistry,
        policy: ExecutionConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                runtime,
                technologies,
                sessions: SessionRegistry::new(),
                policy,
                shutdown,
            }),
        }
    }

    /// Number of sessions currently holding a sandbox.
    pub fn active_sessions(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Start a session. Returns its request id and its event stream; the
    /// stream closes after the terminal event.
    pub fn run(&self, request: RunRequest) -> (String, mpsc::Receiver<OutboundEvent>) {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.inner.policy.event_buffer.max(1));

        let session = Session {
            request_id: request_id.clone(),
            control: Arc::new(SessionControl::new(self.inner.shutdown.child_token())),
            sink: EventSink {
                request_id: request_id.clone(),
                tx,
            },
            sandbox: None,
            relay: None,
        };

        let inner = Arc::clone(&self.inner);
        let span = tracing::info_span!("session", request_id = %request_id);
        tokio::spawn(async move { inner.execute(session, request).await }.instrument(span));

        (request_id, rx)
    }

    /// Stop an active session.
    ///
    /// A graceful stop only cancels the session, which then kills and tears
    /// down on its own. A forced stop kills the sandbox here, reports the
    /// kill's outcome, and then cancels the session.
    pub async fn stop(&self, request_id: &str, force: bool) -> Result<(), StopError> {
        let session = self
            .inner
            .sessions
            .get(request_id)
            .ok_or_else(|| StopError::not_found(request_id))?;

        let running_ms = (Utc::now() - session.started_at).num_milliseconds();
        if !force {
            info!(request_id, language = %session.language, running_ms, "Stop requested");
            session.control.request_stop();
            return Ok(());
        }

        info!(
            request_id,
            sandbox = %session.sandbox,
            language = %session.language,
            running_ms,
            "Force stop requested"
        );
        session.control.mark_force_stopped(true);
        match self.inner.runtime.kill(&session.sandbox).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!(request_id, "Container already gone"),
            Err(e) => {
                session.control.mark_force_stopped(false);
                warn!(request_id, "Force stop failed: {}", e);
                return Err(StopError::internal(e.to_string()));
            }
        }
        // A kill that lands before start is a no-op; the session sees this instead
        session.control.cancel.cancel();
        Ok(())
    }
}

impl Inner {
    async fn execute(&self, mut session: Session, request: RunRequest) {
        let started_at = Utc::now();
        info!(
            language = %request.language,
            timeout_secs = request.timeout_seconds,
            stdin_lines = request.stdin.len(),
            "Session started"
        );

        let result = self.drive(&mut session, &request).await;

        // Helpers stop before the terminal event so nothing follows it
        session.control.cancel.cancel();
        if let Some(relay) = session.relay.take() {
            let _ = relay.await;
        }
        let result = match result {
            Err(RunError::ClientDisconnected) => Err(RunError::ClientDisconnected),
            Err(_) if session.control.is_force_stopped() => Err(RunError::ForceStopped),
            other => other,
        };

        // Unregister first: a client that saw the terminal event must get
        // NotFound from a later stop
        self.sessions.remove(&session.request_id);

        // Removal precedes the terminal event, which may wait on a slow client
        if let Some(sandbox) = session.sandbox.take() {
            match self.runtime.remove(&sandbox).await {
                Ok(()) => debug!(sandbox = %sandbox, "Container removed"),
                Err(e) if e.is_not_found() => debug!(sandbox = %sandbox, "Container already gone"),
                Err(e) => warn!(sandbox = %sandbox, "Failed to remove container: {}", e),
            }
        }

        let elapsed_ms = (Utc::now() - started_at).num_milliseconds();
        let terminal = match result {
            Ok(code) => {
                info!(exit_code = code, elapsed_ms, outcome = "completed", "Session finished");
                Some(EventKind::ExitCode(code))
            }
            Err(RunError::ClientDisconnected) => {
                info!(elapsed_ms, outcome = "killed", "Client went away; session aborted");
                None
            }
            Err(e) => {
                info!(elapsed_ms, outcome = e.outcome(), "Session failed: {}", e);
                Some(EventKind::Error(e.to_string()))
            }
        };
        if let Some(kind) = terminal {
            debug_assert!(kind.is_terminal());
            if session.sink.send(kind).await.is_err() {
                debug!("Client went away before the terminal event");
            }
        }
    }

    /// Everything up to the program's exit code.
    async fn drive(&self, session: &mut Session, request: &RunRequest) -> Result<i64, RunError> {
        let technology = self.technologies.lookup(&request.language)?;
        let timeout = self.session_timeout(request.timeout_seconds)?;
        arm_deadline(&session.control, timeout);

        let sink = session.sink.clone();
        if timeout.as_secs() < request.timeout_seconds {
            sink.info(format!("Timeout reduced to {} seconds.", timeout.as_secs()))
                .await?;
        }
        sink.info(STARTING_MESSAGE).await?;

        let sandbox = self
            .runtime
            .create(&session.request_id, technology.as_ref(), &request.source_code)
            .await
            .inspect_err(|e| {
                if e.is_image_not_found() || e.is_docker_unavailable() {
                    warn!(image = technology.image(), "Host cannot provision sandboxes: {}", e);
                }
            })
            .map_err(RunError::Provisioning)?;
        session.sandbox = Some(sandbox.clone());
        self.sessions.insert(
            &session.request_id,
            ActiveSession {
                sandbox: sandbox.clone(),
                control: Arc::clone(&session.control),
                started_at: Utc::now(),
                language: technology.key().to_string(),
            },
        );
        info!(sandbox = %sandbox, image = technology.image(), "Container created");
        sink.info(CREATED_MESSAGE).await?;

        // Attach before start so early output is not lost
        let DemuxedIo {
            mut stdin,
            stdout,
            stderr,
        } = demux::attach_io(self.runtime.as_ref(), &sandbox, session.control.token())
            .await
            .map_err(RunError::Attach)?;

        if session.control.is_force_stopped() {
            return Err(RunError::ForceStopped);
        }
        self.runtime
            .start(&sandbox)
            .await
            .map_err(RunError::Start)?;
        debug!(sandbox = %sandbox, "Container started");
        if session.control.is_force_stopped() {
            return Err(self.interrupt(&sandbox, &session.control).await);
        }

        let exit = self.runtime.wait(&sandbox, session.control.token());
        let relay = self.spawn_statistics_relay(&sandbox, sink.clone(), session.control.token());
        session.relay = Some(relay);

        tokio::select! {
            biased;
            () = session.control.cancel.cancelled() => {
                return Err(self.interrupt(&sandbox, &session.control).await);
            }
            written = write_stdin(&mut stdin, &request.stdin) => {
                written.map_err(RunError::StdinWrite)?;
            }
        }
        drop(stdin);

        let outputs = Outputs {
            stdout,
            stderr,
            exit,
        };
        self.pump(&sandbox, outputs, &sink, &session.control).await
    }

    /// The running state: relay output until all three sources are exhausted.
    async fn pump(
        &self,
        sandbox: &SandboxId,
        outputs: Outputs,
        sink: &EventSink,
        control: &SessionControl,
    ) -> Result<i64, RunError> {
        let Outputs {
            mut stdout,
            mut stderr,
            mut exit,
        } = outputs;
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut exit_code: Option<i64> = None;

        loop {
            if !stdout_open && !stderr_open {
                if let Some(code) = exit_code {
                    return Ok(code);
                }
            }

            tokio::select! {
                biased;
                () = control.cancel.cancelled() => {
                    return Err(self.interrupt(sandbox, control).await);
                }
                () = sink.closed() => {
                    self.kill_quietly(sandbox).await;
                    return Err(RunError::ClientDisconnected);
                }
                line = stdout.recv(), if stdout_open => match line {
                    Some(Ok(text)) => {
                        self.forward(sandbox, sink, control, EventKind::Stdout(text)).await?;
                    }
                    Some(Err(fault)) => {
                        self.kill_quietly(sandbox).await;
                        return Err(fault.into());
                    }
                    None => stdout_open = false,
                },
                line = stderr.recv(), if stderr_open => match line {
                    Some(Ok(text)) => {
                        self.forward(sandbox, sink, control, EventKind::Stderr(text)).await?;
                    }
                    Some(Err(fault)) => {
                        self.kill_quietly(sandbox).await;
                        return Err(fault.into());
                    }
                    None => stderr_open = false,
                },
                status = &mut exit, if exit_code.is_none() => match status {
                    Ok(Ok(code)) => {
                        debug!(exit_code = code, "Program exited");
                        // Our own force kill, not the program's exit
                        if control.is_force_stopped() {
                            return Err(RunError::ForceStopped);
                        }
                        exit_code = Some(code);
                    }
                    Ok(Err(fault)) => return Err(RunError::Lifecycle(fault)),
                    // The watcher gave up because the token fired
                    Err(_) if control.cancel.is_cancelled() => {
                        return Err(self.interrupt(sandbox, control).await);
                    }
                    Err(_) => {
                        return Err(RunError::Lifecycle(SandboxError::unhealthy(
                            "wait ended without an exit status",
                        )));
                    }
                },
            }
        }
    }

    /// Relay one output line. A full channel must not hold off the deadline
    /// or a stop.
    async fn forward(
        &self,
        sandbox: &SandboxId,
        sink: &EventSink,
        control: &SessionControl,
        kind: EventKind,
    ) -> Result<(), RunError> {
        tokio::select! {
            biased;
            () = control.cancel.cancelled() => Err(self.interrupt(sandbox, control).await),
            sent = sink.send(kind) => {
                if sent.is_err() {
                    self.kill_quietly(sandbox).await;
                }
                sent
            }
        }
    }

    /// Kill after the session token fired and report why it fired.
    async fn interrupt(&self, sandbox: &SandboxId, control: &SessionControl) -> RunError {
        let reason = control.interruption();
        debug!(sandbox = %sandbox, "Interrupted: {}", reason);
        self.kill_quietly(sandbox).await;
        reason
    }

    async fn kill_quietly(&self, sandbox: &SandboxId) {
        if let Err(e) = self.runtime.kill(sandbox).await {
            warn!(sandbox = %sandbox, "Failed to kill container: {}", e);
        }
    }

    fn session_timeout(&self, requested: u64) -> Result<Duration, RunError> {
        if requested == 0 {
            return Err(RunError::InvalidTimeout);
        }
        Ok(Duration::from_secs(requested.min(self.policy.max_timeout_secs)))
    }

    /// Relay statistics until the session token fires. Failures only end the relay.
    fn spawn_statistics_relay(
        &self,
        sandbox: &SandboxId,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let mut samples = self.runtime.stream_statistics(sandbox, cancel.clone());
        let relay = async move {
            let mut sampler = CpuSampler::new();
            loop {
                let sample = tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    sample = samples.recv() => match sample {
                        Some(sample) => sample,
                        None => break,
                    },
                };

                let usage = sampler.observe(sample);
                let event = EventKind::Statistics {
                    memory_used_bytes: usage.memory_bytes,
                    cpu_percent: usage.cpu_percent,
                };
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    sent = sink.send(event) => if sent.is_err() { break },
                }
            }
            debug!("Statistics relay finished");
        };
        tokio::spawn(relay.in_current_span())
    }
}

/// The three sources the running state waits on.
struct Outputs {
    stdout: LineReceiver,
    stderr: LineReceiver,
    exit: oneshot::Receiver<ExitOutcome>,
}

/// Cancel the session once `timeout` elapses.
fn arm_deadline(control: &Arc<SessionControl>, timeout: Duration) {
    let control = Arc::clone(control);
    tokio::spawn(async move {
        tokio::select! {
            () = control.cancel.cancelled() => {}
            () = tokio::time::sleep(timeout) => control.expire(),
        }
    });
}

async fn write_stdin(stdin: &mut StdinSink, lines: &[String]) -> std::io::Result<()> {
    for line in lines {
        stdin.write_line(line).await?;
    }
    stdin.close().await
}
