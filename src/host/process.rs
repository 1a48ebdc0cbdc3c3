//! Child-process sandbox host.
//!
//! Each module runs as a child of a configured interpreter, with its code
//! written to a private temp file passed as the last argument. Frames travel
//! as newline-delimited JSON over the child's stdin/stdout; stderr is logged.
//! Isolation is whatever the interpreter provides.

use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use super::{HostError, Sandbox, SandboxEvents, SandboxHost};
use crate::frame::Frame;

/// Sandbox host spawning one interpreter process per module.
#[derive(Debug, Clone)]
pub struct ProcessSandboxHost {
    program: String,
    args: Vec<String>,
    scratch_dir: PathBuf,
}

impl ProcessSandboxHost {
    /// Create a host from an interpreter command line.
    ///
    /// # Errors
    ///
    /// Returns an error if `command` is empty or the scratch directory cannot
    /// be created.
    pub fn new(command: &[String], scratch_dir: PathBuf) -> Result<Self, HostError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| HostError::Create("sandbox command is empty".to_owned()))?;
        std::fs::create_dir_all(&scratch_dir).map_err(|e| {
            HostError::Io(format!(
                "failed to create scratch directory {}: {e}",
                scratch_dir.display()
            ))
        })?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            scratch_dir,
        })
    }

    fn write_code(&self, code: &[u8]) -> Result<tempfile::TempPath, HostError> {
        let mut file = tempfile::Builder::new()
            .prefix("module-")
            .suffix(".js")
            .tempfile_in(&self.scratch_dir)
            .map_err(|e| HostError::Io(format!("failed to create code file: {e}")))?;
        file.write_all(code)
            .map_err(|e| HostError::Io(format!("failed to write code file: {e}")))?;
        Ok(file.into_temp_path())
    }
}

#[async_trait]
impl SandboxHost for ProcessSandboxHost {
    async fn create_sandbox(
        &self,
        code: Vec<u8>,
        events: SandboxEvents,
    ) -> Result<Arc<dyn Sandbox>, HostError> {
        let code_path = self.write_code(&code)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(&*code_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HostError::Create(format!("failed to spawn {}: {e}", self.program)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| HostError::Create("child stdin unavailable".to_owned()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HostError::Create("child stdout unavailable".to_owned()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| HostError::Create("child stderr unavailable".to_owned()))?;

        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<Frame>();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        // Writer: kernel -> child stdin.
        let writer_events = events.clone();
        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                let mut line = match serde_json::to_vec(&frame) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "failed to encode frame for sandbox");
                        continue;
                    }
                };
                line.push(b'\n');
                if let Err(e) = stdin.write_all(&line).await {
                    writer_events.fault(format!("stdin closed: {e}"));
                    break;
                }
            }
        });

        // Reader: child stdout -> kernel.
        let reader_events = events.clone();
        tokio::spawn(async move {
            let mut lines = LinesStream::new(BufReader::new(stdout).lines());
            while let Some(line) = lines.next().await {
                match line {
                    Ok(line) if line.trim().is_empty() => {}
                    Ok(line) => match serde_json::from_str(&line) {
                        Ok(value) => reader_events.message(value),
                        Err(e) => warn!(
                            module = %reader_events.domain(),
                            error = %e,
                            "sandbox wrote a line that is not JSON"
                        ),
                    },
                    Err(e) => {
                        reader_events.fault(format!("stdout read failed: {e}"));
                        break;
                    }
                }
            }
        });

        let stderr_domain = events.domain().to_owned();
        tokio::spawn(async move {
            let mut lines = LinesStream::new(BufReader::new(stderr).lines());
            while let Some(Ok(line)) = lines.next().await {
                debug!(module = %stderr_domain, line = %line, "sandbox stderr");
            }
        });

        // Supervisor: report exit, honour terminate, and keep the code file
        // alive until the child is gone.
        let exit_events = events;
        tokio::spawn(async move {
            let _code_path = code_path;
            tokio::select! {
                status = child.wait() => {
                    debug!(module = %exit_events.domain(), status = ?status.ok(), "sandbox process exited");
                }
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        warn!(module = %exit_events.domain(), error = %e, "failed to kill sandbox process");
                    }
                }
            }
            exit_events.exited();
        });

        Ok(Arc::new(ProcessSandbox {
            frames: frame_tx,
            kill: Mutex::new(Some(kill_tx)),
        }))
    }
}

struct ProcessSandbox {
    frames: mpsc::UnboundedSender<Frame>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
}

impl Sandbox for ProcessSandbox {
    fn post(&self, frame: Frame) -> Result<(), HostError> {
        self.frames.send(frame).map_err(|_| HostError::Closed)
    }

    fn terminate(&self) {
        let sender = match self.kill.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }
}
