// Line-oriented IPC between the controller and an out-of-process worker.

use crate::constants::{MAX_LINE_LENGTH, SOCKET_FILE_PREFIX};
use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use std::path::{Path, PathBuf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;

/// IPC channel to a worker process.
///
/// The controller binds a Unix domain socket in a temp directory and the
/// worker connects to it. Each message is one UTF-8 line: commands flow
/// controller -> worker, JSON status snapshots flow back.
pub struct WorkerChannel {
    /// Socket path, set on the server (controller) side only.
    socket_path: Option<PathBuf>,
    /// Listener awaiting the worker's connection.
    listener: Option<UnixListener>,
    /// The connected, line-framed stream.
    framed: Option<Framed<UnixStream, LinesCodec>>,
}

impl WorkerChannel {
    /// Create a new, unconnected channel.
    pub fn new() -> Self {
        Self {
            socket_path: None,
            listener: None,
            framed: None,
        }
    }

    /// Start the server side. Returns the path the worker must connect to.
    pub fn start_server(&mut self, socket_dir: &Path) -> Result<PathBuf> {
        let socket_path =
            socket_dir.join(format!("{}{}", SOCKET_FILE_PREFIX, uuid::Uuid::new_v4().simple()));

        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("Failed to bind Unix socket at {:?}", socket_path))?;

        self.socket_path = Some(socket_path.clone());
        self.listener = Some(listener);

        Ok(socket_path)
    }

    /// Accept the worker's connection (server side).
    pub async fn accept(&mut self) -> Result<()> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Server not started; call start_server first"))?;

        let (stream, _addr) = listener
            .accept()
            .await
            .context("Failed to accept worker connection on IPC socket")?;

        self.framed = Some(Self::frame(stream));
        Ok(())
    }

    /// Connect to the controller's socket (worker side).
    pub async fn connect(&mut self, socket_path: &Path) -> Result<()> {
        let stream = UnixStream::connect(socket_path)
            .await
            .with_context(|| format!("Failed to connect to IPC socket at {:?}", socket_path))?;

        self.framed = Some(Self::frame(stream));
        Ok(())
    }

    /// Send one line.
    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        let framed = self
            .framed
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Channel not connected"))?;

        framed
            .send(line)
            .await
            .context("Failed to write line to IPC socket")?;
        Ok(())
    }

    /// Receive one line. `None` once the peer has closed the socket.
    pub async fn receive_line(&mut self) -> Result<Option<String>> {
        let framed = self
            .framed
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Channel not connected"))?;

        match framed.next().await {
            Some(line) => Ok(Some(line.context("Failed to read line from IPC socket")?)),
            None => Ok(None),
        }
    }

    /// Shuttle lines between the socket and a pair of in-memory queues until
    /// the peer disconnects, `outbound` is closed, or `shutdown` fires.
    ///
    /// Lines read from the socket go to `inbound`; lines received on
    /// `outbound` are written to the socket.
    pub async fn pump(
        mut self,
        mut outbound: mpsc::UnboundedReceiver<String>,
        inbound: mpsc::UnboundedSender<String>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let framed = self
            .framed
            .take()
            .ok_or_else(|| anyhow::anyhow!("Channel not connected"))?;
        let (mut sink, mut stream) = framed.split();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                line = outbound.recv() => match line {
                    Some(line) => sink
                        .send(line)
                        .await
                        .context("Failed to write line to IPC socket")?,
                    None => break,
                },
                line = stream.next() => match line {
                    Some(line) => {
                        let line = line.context("Failed to read line from IPC socket")?;
                        if inbound.send(line).is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        Ok(())
    }

    fn frame(stream: UnixStream) -> Framed<UnixStream, LinesCodec> {
        Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH))
    }
}

impl Default for WorkerChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WorkerChannel {
    fn drop(&mut self) {
        if let Some(ref path) = self.socket_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn server_and_client_exchange_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = WorkerChannel::new();
        let path = server.start_server(dir.path()).unwrap();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(SOCKET_FILE_PREFIX));

        let client_path = path.clone();
        let client = tokio::spawn(async move {
            let mut client = WorkerChannel::new();
            client.connect(&client_path).await.unwrap();
            let got = client.receive_line().await.unwrap();
            client.send_line(r#"{"testState":0}"#).await.unwrap();
            got
        });

        server.accept().await.unwrap();
        server.send_line("status").await.unwrap();
        let reply = server.receive_line().await.unwrap();

        assert_eq!(client.await.unwrap().as_deref(), Some("status"));
        assert_eq!(reply.as_deref(), Some(r#"{"testState":0}"#));
    }

    #[tokio::test]
    async fn socket_file_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = WorkerChannel::new();
        let path = server.start_server(dir.path()).unwrap();
        assert!(path.exists());
        drop(server);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn unconnected_channel_errors() {
        let mut channel = WorkerChannel::new();
        assert!(channel.send_line("status").await.is_err());
        assert!(channel.accept().await.is_err());
    }

    #[tokio::test]
    async fn pump_bridges_both_directions() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = WorkerChannel::new();
        let path = server.start_server(dir.path()).unwrap();

        let mut client = WorkerChannel::new();
        let (connected, accepted) = tokio::join!(client.connect(&path), server.accept());
        connected.unwrap();
        accepted.unwrap();

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, mut in_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let pump = tokio::spawn(server.pump(out_rx, in_tx, shutdown.clone()));

        out_tx.send("abort".to_string()).unwrap();
        assert_eq!(client.receive_line().await.unwrap().as_deref(), Some("abort"));

        client.send_line("reply").await.unwrap();
        assert_eq!(in_rx.recv().await.as_deref(), Some("reply"));

        shutdown.cancel();
        pump.await.unwrap().unwrap();
    }
}
