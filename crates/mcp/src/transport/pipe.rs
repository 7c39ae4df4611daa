//! Pipe transport: a spawned subprocess speaking newline-framed JSON over
//! its standard streams.

use super::{Transport, INCOMING_BUFFER};
use crate::config::ServerConfig;
use crate::framing::FrameBuffer;
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};

pub struct PipeTransport {
    server: String,
    child: Mutex<Child>,
    outbound: mpsc::Sender<String>,
    incoming: Option<mpsc::Receiver<Value>>,
}

impl PipeTransport {
    /// Spawn the server process and wire up the reader/writer tasks.
    pub async fn spawn(config: &ServerConfig) -> Result<Self> {
        let command = config
            .command
            .as_deref()
            .ok_or_else(|| Error::InvalidConfig {
                name: config.name.clone(),
                reason: "command is required for pipe transport".to_string(),
            })?;

        let mut child = Command::new(command)
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(Error::Spawn)?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Spawn(std::io::Error::other("failed to capture stdin")))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn(std::io::Error::other("failed to capture stdout")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Spawn(std::io::Error::other("failed to capture stderr")))?;

        let server = config.name.clone();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(INCOMING_BUFFER);
        let (incoming_tx, incoming_rx) = mpsc::channel::<Value>(INCOMING_BUFFER);

        // Writer task: frames are newline-terminated.
        let writer_server = server.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = write_frame(&mut stdin, &frame).await {
                    tracing::warn!(server = %writer_server, error = %e, "pipe stdin write failed");
                    break;
                }
            }
        });

        // Reader task: raw chunks reassembled by the frame buffer. The
        // incoming sender dropping signals connection loss to the client.
        let reader_server = server.clone();
        tokio::spawn(async move {
            let mut frames = FrameBuffer::new();
            let mut chunk = [0u8; 8192];
            loop {
                match stdout.read(&mut chunk).await {
                    Ok(0) => {
                        tracing::debug!(server = %reader_server, "pipe stdout closed");
                        break;
                    }
                    Ok(n) => match frames.push(&chunk[..n]) {
                        Ok(lines) => {
                            for line in lines {
                                match serde_json::from_str::<Value>(&line) {
                                    Ok(value) => {
                                        if incoming_tx.send(value).await.is_err() {
                                            return;
                                        }
                                    }
                                    Err(e) => {
                                        tracing::warn!(
                                            server = %reader_server,
                                            error = %e,
                                            "dropping unparseable frame"
                                        );
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(server = %reader_server, error = %e, "frame overflow");
                            break;
                        }
                    },
                    Err(e) => {
                        tracing::warn!(server = %reader_server, error = %e, "pipe stdout read failed");
                        break;
                    }
                }
            }
        });

        // Stderr is the server's log stream; surface it at debug level.
        let stderr_server = server.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: "mcp::server_log", server = %stderr_server, "{line}");
            }
        });

        Ok(Self {
            server,
            child: Mutex::new(child),
            outbound: outbound_tx,
            incoming: Some(incoming_rx),
        })
    }

    /// Whether the subprocess is still alive.
    pub async fn is_running(&self) -> bool {
        let mut child = self.child.lock().await;
        matches!(child.try_wait(), Ok(None))
    }
}

async fn write_frame(stdin: &mut tokio::process::ChildStdin, frame: &str) -> std::io::Result<()> {
    stdin.write_all(frame.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

#[async_trait]
impl Transport for PipeTransport {
    async fn send(&self, msg: Value) -> Result<Option<Value>> {
        let frame = serde_json::to_string(&msg)?;
        self.outbound
            .send(frame)
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        Ok(None)
    }

    fn take_incoming(&mut self) -> Option<mpsc::Receiver<Value>> {
        self.incoming.take()
    }

    fn incoming_is_connection(&self) -> bool {
        true
    }

    async fn close(&self) {
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            tracing::debug!(server = %self.server, error = %e, "pipe process already gone");
        }
    }
}
