//! Scripted sandbox runtime for testing.
//!
//! Plays back a predetermined program: output frames, an exit code, an
//! optional hang until killed, and injected failures at any lifecycle
//! step. Every call is recorded for test assertions.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, DuplexStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::{
    AttachedConnection, ExitOutcome, OutputFrame, ResourceSample, SandboxError, SandboxId,
    SandboxRuntime,
};
use crate::technology::Technology;

/// Exit code Docker reports for a SIGKILLed program.
pub(crate) const KILLED_EXIT_CODE: i64 = 137;

/// Lifecycle step at which the scripted runtime fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailAt {
    Create,
    Attach,
    /// Attach succeeds but the program's stdin is already closed.
    Stdin,
    Start,
    Kill,
    Remove,
}

/// What the sandboxed "program" does once started.
#[derive(Debug, Clone, Default)]
pub(crate) struct Script {
    frames: Vec<OutputFrame>,
    exit_code: i64,
    hang: bool,
    echo_stdin: bool,
    fault: Option<String>,
    samples: Vec<ResourceSample>,
    fail_at: Option<FailAt>,
    frame_delay: Option<Duration>,
    start_delay: Option<Duration>,
}

impl Script {
    /// A program that writes nothing and exits with `code`.
    pub fn exits(code: i64) -> Self {
        Self {
            exit_code: code,
            ..Default::default()
        }
    }

    /// A program that never exits on its own.
    pub fn hangs() -> Self {
        Self {
            hang: true,
            ..Default::default()
        }
    }

    pub fn stdout(mut self, chunk: &str) -> Self {
        self.frames
            .push(OutputFrame::Stdout(Bytes::copy_from_slice(chunk.as_bytes())));
        self
    }

    pub fn stderr(mut self, chunk: &str) -> Self {
        self.frames
            .push(OutputFrame::Stderr(Bytes::copy_from_slice(chunk.as_bytes())));
        self
    }

    /// Read stdin to end-of-file, echoing each line to stdout first.
    pub fn echo_stdin(mut self) -> Self {
        self.echo_stdin = true;
        self
    }

    /// Report a lifecycle fault instead of an exit status.
    pub fn fault(mut self, message: &str) -> Self {
        self.fault = Some(message.to_string());
        self
    }

    pub fn samples(mut self, samples: Vec<ResourceSample>) -> Self {
        self.samples = samples;
        self
    }

    pub fn fail_at(mut self, step: FailAt) -> Self {
        self.fail_at = Some(step);
        self
    }

    /// Pause between output frames.
    pub fn frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = Some(delay);
        self
    }

    /// Pause inside `start` before the program runs.
    pub fn start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = Some(delay);
        self
    }
}

#[derive(Default)]
struct Calls {
    created: Vec<SandboxId>,
    started: Vec<SandboxId>,
    killed: Vec<SandboxId>,
    removed: Vec<SandboxId>,
    stdin: Vec<u8>,
}

struct Instance {
    exit: Arc<watch::Sender<Option<Result<i64, String>>>>,
    killed: CancellationToken,
    running: bool,
    frames: Option<mpsc::UnboundedSender<Result<OutputFrame, SandboxError>>>,
    stdin: Option<DuplexStream>,
}

/// A sandbox runtime that plays back a [`Script`].
#[derive(Clone)]
pub(crate) struct ScriptedSandbox {
    script: Arc<Script>,
    calls: Arc<Mutex<Calls>>,
    instances: Arc<Mutex<HashMap<SandboxId, Instance>>>,
    next_id: Arc<AtomicUsize>,
}

impl ScriptedSandbox {
    pub fn new(script: Script) -> Self {
        Self {
            script: Arc::new(script),
            calls: Arc::new(Mutex::new(Calls::default())),
            instances: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn created(&self) -> Vec<SandboxId> {
        self.calls.lock().unwrap().created.clone()
    }

    pub fn started(&self) -> Vec<SandboxId> {
        self.calls.lock().unwrap().started.clone()
    }

    pub fn killed(&self) -> Vec<SandboxId> {
        self.calls.lock().unwrap().killed.clone()
    }

    pub fn removed(&self) -> Vec<SandboxId> {
        self.calls.lock().unwrap().removed.clone()
    }

    /// Everything the program received on stdin.
    pub fn stdin(&self) -> String {
        String::from_utf8_lossy(&self.calls.lock().unwrap().stdin).into_owned()
    }

    fn fails_at(&self, step: FailAt) -> bool {
        self.script.fail_at == Some(step)
    }

    fn record(&self, f: impl FnOnce(&mut Calls)) {
        f(&mut self.calls.lock().unwrap());
    }
}

#[async_trait]
impl SandboxRuntime for ScriptedSandbox {
    async fn create(
        &self,
        _request_id: &str,
        _technology: &dyn Technology,
        _source_code: &str,
    ) -> Result<SandboxId, SandboxError> {
        if self.fails_at(FailAt::Create) {
            return Err(SandboxError::image_not_found("codecell/mock"));
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = SandboxId::new(format!("mock-{n}"));
        let (exit, _) = watch::channel(None);
        self.instances.lock().unwrap().insert(
            id.clone(),
            Instance {
                exit: Arc::new(exit),
                killed: CancellationToken::new(),
                running: false,
                frames: None,
                stdin: None,
            },
        );
        self.record(|calls| calls.created.push(id.clone()));
        Ok(id)
    }

    async fn attach(&self, id: &SandboxId) -> Result<AttachedConnection, SandboxError> {
        if self.fails_at(FailAt::Attach) {
            return Err(SandboxError::container_failed("attach", "hijack refused"));
        }

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (client, server) = tokio::io::duplex(64 * 1024);

        let mut instances = self.instances.lock().unwrap();
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| SandboxError::not_found(id.as_str()))?;
        instance.frames = Some(frames_tx);
        if self.fails_at(FailAt::Stdin) {
            drop(server);
        } else {
            instance.stdin = Some(server);
        }

        let output = futures_util::stream::unfold(frames_rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        })
        .boxed();

        Ok(AttachedConnection {
            output,
            input: Box::pin(client),
        })
    }

    async fn start(&self, id: &SandboxId) -> Result<(), SandboxError> {
        if self.fails_at(FailAt::Start) {
            return Err(SandboxError::container_failed("start", "exec format error"));
        }
        if let Some(delay) = self.script.start_delay {
            tokio::time::sleep(delay).await;
        }

        let (frames, stdin, exit, killed) = {
            let mut instances = self.instances.lock().unwrap();
            let instance = instances
                .get_mut(id)
                .ok_or_else(|| SandboxError::not_found(id.as_str()))?;
            instance.running = true;
            (
                instance.frames.take(),
                instance.stdin.take(),
                Arc::clone(&instance.exit),
                instance.killed.clone(),
            )
        };
        self.record(|calls| calls.started.push(id.clone()));

        let script = Arc::clone(&self.script);
        let calls = Arc::clone(&self.calls);
        tokio::spawn(async move {
            let program = async {
                if let Some(stdin) = stdin {
                    if script.echo_stdin {
                        let mut lines = BufReader::new(stdin).lines();
                        while let Ok(Some(line)) = lines.next_line().await {
                            calls.lock().unwrap().stdin.extend(format!("{line}\n").bytes());
                            if let Some(tx) = &frames {
                                let _ = tx.send(Ok(OutputFrame::Stdout(Bytes::from(format!(
                                    "{line}\n"
                                )))));
                            }
                        }
                    } else {
                        let calls = Arc::clone(&calls);
                        tokio::spawn(async move {
                            let mut received = Vec::new();
                            let mut stdin = stdin;
                            let _ = stdin.read_to_end(&mut received).await;
                            calls.lock().unwrap().stdin.extend(received);
                        });
                    }
                }

                for frame in &script.frames {
                    if let Some(delay) = script.frame_delay {
                        tokio::time::sleep(delay).await;
                    }
                    if let Some(tx) = &frames {
                        let _ = tx.send(Ok(frame.clone()));
                    }
                }

                if script.hang {
                    std::future::pending::<()>().await;
                }
            };

            tokio::select! {
                () = killed.cancelled() => {}
                () = program => {
                    let status = match &script.fault {
                        Some(message) => Err(message.clone()),
                        None => Ok(script.exit_code),
                    };
                    exit.send_replace(Some(status));
                }
            }
            // Output closes once the program is gone
            drop(frames);
        });

        Ok(())
    }

    fn wait(&self, id: &SandboxId, cancel: CancellationToken) -> oneshot::Receiver<ExitOutcome> {
        let (tx, rx) = oneshot::channel();
        let exit = self
            .instances
            .lock()
            .unwrap()
            .get(id)
            .map(|instance| instance.exit.subscribe());

        tokio::spawn(async move {
            let Some(mut exit) = exit else {
                let _ = tx.send(Err(SandboxError::unhealthy("container disappeared")));
                return;
            };
            let status = tokio::select! {
                () = cancel.cancelled() => return,
                status = exit.wait_for(Option::is_some) => status.map(|s| s.clone()),
            };
            let outcome = match status {
                Ok(Some(Ok(code))) => Ok(code),
                Ok(Some(Err(message))) => Err(SandboxError::unhealthy(message)),
                _ => Err(SandboxError::unhealthy("container disappeared")),
            };
            let _ = tx.send(outcome);
        });

        rx
    }

    async fn kill(&self, id: &SandboxId) -> Result<(), SandboxError> {
        self.record(|calls| calls.killed.push(id.clone()));
        if self.fails_at(FailAt::Kill) {
            return Err(SandboxError::container_failed("kill", "permission denied"));
        }

        // Like Docker, killing a container that is not running does nothing
        if let Some(instance) = self.instances.lock().unwrap().get(id).filter(|i| i.running) {
            instance.killed.cancel();
            instance.exit.send_if_modified(|status| {
                if status.is_none() {
                    *status = Some(Ok(KILLED_EXIT_CODE));
                    true
                } else {
                    false
                }
            });
        }
        Ok(())
    }

    async fn remove(&self, id: &SandboxId) -> Result<(), SandboxError> {
        self.record(|calls| calls.removed.push(id.clone()));
        if self.fails_at(FailAt::Remove) {
            return Err(SandboxError::container_failed("remove", "device busy"));
        }

        if let Some(instance) = self.instances.lock().unwrap().remove(id) {
            instance.killed.cancel();
        }
        Ok(())
    }

    fn stream_statistics(
        &self,
        _id: &SandboxId,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<ResourceSample> {
        let (tx, rx) = mpsc::channel(8);
        let samples = self.script.samples.clone();

        tokio::spawn(async move {
            for sample in samples {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    sent = tx.send(sample) => if sent.is_err() { return },
                }
            }
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::technology::PythonTechnology;
    use tokio::io::AsyncWriteExt;

    fn technology() -> PythonTechnology {
        PythonTechnology::new("codecell/python".to_string())
    }

    #[tokio::test]
    async fn test_scripted_program_plays_frames_then_exits() {
        let sandbox = ScriptedSandbox::new(Script::exits(3).stdout("a\n").stderr("b\n"));
        let id = sandbox.create("r", &technology(), "").await.unwrap();
        let mut connection = sandbox.attach(&id).await.unwrap();
        sandbox.start(&id).await.unwrap();
        connection.input.shutdown().await.unwrap();

        let frames: Vec<_> = connection.output.map(Result::unwrap).collect().await;
        assert_eq!(
            frames,
            vec![
                OutputFrame::Stdout(Bytes::from_static(b"a\n")),
                OutputFrame::Stderr(Bytes::from_static(b"b\n")),
            ]
        );

        let status = sandbox.wait(&id, CancellationToken::new()).await.unwrap();
        assert_eq!(status.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_kill_ends_hanging_program() {
        let sandbox = ScriptedSandbox::new(Script::hangs());
        let id = sandbox.create("r", &technology(), "").await.unwrap();
        let _connection = sandbox.attach(&id).await.unwrap();
        sandbox.start(&id).await.unwrap();

        let wait = sandbox.wait(&id, CancellationToken::new());
        sandbox.kill(&id).await.unwrap();
        assert_eq!(wait.await.unwrap().unwrap(), KILLED_EXIT_CODE);
        assert_eq!(sandbox.killed(), vec![id]);
    }

    #[tokio::test]
    async fn test_cancelled_wait_drops_sender() {
        let sandbox = ScriptedSandbox::new(Script::hangs());
        let id = sandbox.create("r", &technology(), "").await.unwrap();
        let cancel = CancellationToken::new();
        let wait = sandbox.wait(&id, cancel.clone());
        cancel.cancel();
        assert!(wait.await.is_err());
    }
}
